use super::*;

fn sse_events(body: &[u8]) -> Vec<Value> {
    body_text(body)
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(|data| serde_json::from_str(data).expect("event json"))
        .collect()
}

fn event_types(events: &[Value]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|event| event["type"].as_str())
        .collect()
}

fn create_thread_request(text: &str) -> Value {
    json!({
        "type": "threads.create",
        "params": {"input": {"content": [{"type": "input_text", "text": text}]}}
    })
}

#[tokio::test]
async fn create_thread_streams_server_sent_events() {
    let test_app = TestApp::with_runner(ScriptedRunner::new(coaching_reply()));

    let (status, headers, body) = send_request(
        &test_app.app,
        Method::POST,
        "/chatkit?sid=alice",
        Some(create_thread_request("What's your ICP framework?")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(header_value(&headers, "content-type").starts_with("text/event-stream"));

    let events = sse_events(&body);
    let types = event_types(&events);
    assert_eq!(types.first(), Some(&"thread.created"));
    assert_eq!(types.last(), Some(&"thread.item.done"));
    assert!(types.contains(&"progress_update"));

    let thread_id = events[0]["thread"]["id"].as_str().expect("thread id");
    let deltas: String = events
        .iter()
        .filter(|event| event["type"] == "thread.item.updated")
        .filter_map(|event| event["update"]["delta"].as_str())
        .collect();
    assert_eq!(deltas, "Your ICP is who you serve.");

    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        "/chatkit?sid=alice",
        Some(json!({"type": "threads.list", "params": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let page = parse_json(&body);
    assert_eq!(page["data"][0]["id"], thread_id);
    assert_eq!(page["data"][0]["title"], "What's your ICP framework?");
}

#[tokio::test]
async fn upstream_failure_becomes_error_event() {
    let runner = ScriptedRunner::new(Vec::new()).failing_after(0, "model unavailable");
    let test_app = TestApp::with_runner(runner);

    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        "/chatkit",
        Some(create_thread_request("hello")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let events = sse_events(&body);
    let error = events
        .iter()
        .find(|event| event["type"] == "error")
        .expect("error event");
    assert_eq!(error["code"], "stream.error");
    assert_eq!(error["message"], "model unavailable");
}

#[tokio::test]
async fn message_to_unknown_thread_is_not_found() {
    let test_app = TestApp::new();
    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        "/chatkit",
        Some(json!({
            "type": "threads.add_user_message",
            "params": {
                "thread_id": "missing",
                "input": {"content": [{"type": "input_text", "text": "hi"}]}
            }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(parse_json(&body)["threadId"], "missing");
    assert!(test_app.runner.requests().is_empty());
}

#[tokio::test]
async fn rename_then_delete_thread() {
    let test_app = TestApp::new();
    send_request(
        &test_app.app,
        Method::POST,
        "/chatkit",
        Some(create_thread_request("First question")),
    )
    .await;
    let (_, _, body) = send_request(
        &test_app.app,
        Method::POST,
        "/chatkit",
        Some(json!({"type": "threads.list", "params": {}})),
    )
    .await;
    let thread_id = parse_json(&body)["data"][0]["id"]
        .as_str()
        .expect("thread id")
        .to_string();

    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        "/chatkit",
        Some(json!({
            "type": "threads.update",
            "params": {"thread_id": thread_id, "title": "Offer positioning"}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(&body)["title"], "Offer positioning");

    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        "/chatkit",
        Some(json!({"type": "threads.delete", "params": {"thread_id": thread_id}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(&body), json!({}));

    let (status, _, _) = send_request(
        &test_app.app,
        Method::GET,
        &format!("/api/threads/{thread_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_request_type_is_rejected() {
    let test_app = TestApp::new();
    let (status, _, _) = send_request(
        &test_app.app,
        Method::POST,
        "/chatkit",
        Some(json!({"type": "threads.teleport", "params": {}})),
    )
    .await;
    assert!(status.is_client_error());
}

#[tokio::test]
async fn session_endpoint_issues_client_secret() {
    let test_app = TestApp::new();
    let (status, _, body) =
        send_request(&test_app.app, Method::POST, "/api/chatkit/session", None).await;
    assert_eq!(status, StatusCode::OK);
    let session = parse_json(&body);
    let secret = session["client_secret"].as_str().expect("client secret");
    assert!(secret.starts_with("cs_"));
    assert!(secret.len() > 3);
    assert!(!session["session_id"].as_str().expect("session id").is_empty());
}
