use super::*;

use cooperson::agent::ResponsesRunner;

#[tokio::test]
async fn icp_question_streams_reply_and_titles_thread() {
    let test_app = TestApp::with_runner(ScriptedRunner::new(coaching_reply()));

    let mut request = user_message("What's your ICP framework?");
    request["threadId"] = json!("t1");
    let (status, headers, body) =
        send_request(&test_app.app, Method::POST, "/api/chat?sid=alice", Some(request)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        header_value(&headers, "content-type"),
        "text/plain; charset=utf-8"
    );
    assert_eq!(header_value(&headers, "cache-control"), "no-cache");
    assert_eq!(header_value(&headers, "x-accel-buffering"), "no");
    insta::assert_snapshot!(body_text(&body), @r###"
    9:{"type":"tool_start","name":"file_search","query":"ICP framework"}
    9:{"type":"tool_end","name":"file_search"}
    0:"Your ICP is "
    0:"who you serve."
    e:{"finishReason":"stop","usage":{"promptTokens":0,"completionTokens":0}}
    d
    "###);

    let (status, _, body) =
        send_request(&test_app.app, Method::GET, "/api/threads?sid=alice", None).await;
    assert_eq!(status, StatusCode::OK);
    let threads = parse_json(&body);
    assert_eq!(threads["data"][0]["id"], "t1");
    assert_eq!(threads["data"][0]["title"], "What's your ICP framework?");

    let (_, _, body) = send_request(
        &test_app.app,
        Method::GET,
        "/api/threads/t1/items?sid=alice",
        None,
    )
    .await;
    let items = parse_json(&body);
    let kinds: Vec<&str> = items["data"]
        .as_array()
        .expect("items")
        .iter()
        .filter_map(|item| item["type"].as_str())
        .collect();
    assert_eq!(kinds, vec!["user_message", "tool_call", "assistant_message"]);
    assert_eq!(
        items["data"][2]["content"][0]["text"],
        "Your ICP is who you serve."
    );

    let (_, _, body) = send_request(&test_app.app, Method::GET, "/api/threads?sid=bob", None).await;
    assert_eq!(parse_json(&body)["data"], json!([]));
}

#[tokio::test]
async fn upstream_failure_ends_with_escaped_error_line() {
    let runner = ScriptedRunner::new(vec![RunEvent::text("Working on it")])
        .failing_after(1, "Rate limit \"exceeded\"");
    let test_app = TestApp::with_runner(runner);

    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        "/api/chat",
        Some(user_message("Give me three hooks")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    insta::assert_snapshot!(body_text(&body), @r###"
    0:"Working on it"
    3:"Rate limit \"exceeded\""
    d
    "###);

    // The failed reply is not persisted; the thread holds the user message only.
    let session = test_app.state.store().get_or_create_session("default").await;
    let threads = session
        .list_threads(10, None, cooperson::store::SortOrder::Asc)
        .await;
    assert_eq!(threads.data.len(), 1);
    let items = session
        .list_items(&threads.data[0].id, 10, None, cooperson::store::SortOrder::Asc)
        .await
        .expect("items");
    assert_eq!(items.data.len(), 1);
}

#[tokio::test]
async fn unconfigured_agent_fails_before_streaming() {
    let config = CoachConfig::default();
    let agent = Arc::new(ResponsesRunner::new(
        Arc::new(config.clone()),
        reqwest::Client::new(),
    ));
    let test_app = TestApp::with_agent(config, agent);

    let (status, headers, body) = send_request(
        &test_app.app,
        Method::POST,
        "/api/chat",
        Some(user_message("hello")),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        header_value(&headers, "content-type"),
        "application/problem+json"
    );
    let problem = parse_json(&body);
    assert_eq!(problem["type"], "urn:cooperson:error:unconfigured");
    assert_eq!(problem["setting"], "OPENAI_API_KEY");
}

#[tokio::test]
async fn rejects_requests_without_a_user_message() {
    let test_app = TestApp::new();

    let cases = [
        json!({"messages": []}),
        json!({"messages": [{"role": "user", "content": "   "}]}),
        json!({"messages": [
            {"role": "user", "content": "hi"},
            {"role": "assistant", "content": "hello"}
        ]}),
    ];
    for request in cases {
        let (status, _, body) =
            send_request(&test_app.app, Method::POST, "/api/chat", Some(request)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(parse_json(&body)["type"], "urn:cooperson:error:invalid_request");
    }
    assert!(test_app.runner.requests().is_empty());
}

#[tokio::test]
async fn text_parts_are_joined_from_structured_content() {
    let test_app = TestApp::new();
    let request = json!({"messages": [{
        "role": "user",
        "content": [
            {"type": "text", "text": "How do I "},
            {"type": "image", "image": "ignored"},
            {"type": "text", "text": "grow on reels?"}
        ]
    }]});
    let (status, _, _) =
        send_request(&test_app.app, Method::POST, "/api/chat", Some(request)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        test_app.runner.last_input_text().as_deref(),
        Some("How do I grow on reels?")
    );
}

#[tokio::test]
async fn follow_up_turn_chains_previous_response() {
    let test_app = TestApp::with_runner(ScriptedRunner::new(coaching_reply()));

    for text in ["What's your ICP framework?", "And for coaches?"] {
        let mut request = user_message(text);
        request["threadId"] = json!("t1");
        let (status, _, _) =
            send_request(&test_app.app, Method::POST, "/api/chat", Some(request)).await;
        assert_eq!(status, StatusCode::OK);
    }

    let requests = test_app.runner.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].previous_response_id, None);
    assert_eq!(requests[1].previous_response_id.as_deref(), Some("resp_1"));
    assert!(requests[1].history.is_empty());

    let (status, _, _) =
        send_request(&test_app.app, Method::DELETE, "/api/threads/t1", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let mut request = user_message("Start over");
    request["threadId"] = json!("t1");
    send_request(&test_app.app, Method::POST, "/api/chat", Some(request)).await;
    assert_eq!(test_app.runner.requests()[2].previous_response_id, None);
}
