use super::*;

async fn seed_threads(app: &Router, sid: &str, ids: &[&str]) {
    for id in ids {
        let mut request = user_message(&format!("Question for {id}"));
        request["threadId"] = json!(id);
        let (status, _, _) = send_request(
            app,
            Method::POST,
            &format!("/api/chat?sid={sid}"),
            Some(request),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
}

fn ids(page: &Value) -> Vec<String> {
    page["data"]
        .as_array()
        .expect("page data")
        .iter()
        .filter_map(|entry| entry["id"].as_str().map(str::to_string))
        .collect()
}

#[tokio::test]
async fn thread_listing_pages_with_cursor() {
    let test_app = TestApp::new();
    seed_threads(&test_app.app, "alice", &["a", "b", "c"]).await;

    let (status, _, body) = send_request(
        &test_app.app,
        Method::GET,
        "/api/threads?sid=alice&limit=2",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let first = parse_json(&body);
    assert_eq!(ids(&first), vec!["a", "b"]);
    assert_eq!(first["has_more"], true);
    assert_eq!(first["after"], "b");

    let (_, _, body) = send_request(
        &test_app.app,
        Method::GET,
        "/api/threads?sid=alice&limit=2&after=b",
        None,
    )
    .await;
    let second = parse_json(&body);
    assert_eq!(ids(&second), vec!["c"]);
    assert_eq!(second["has_more"], false);
    assert!(second.get("after").is_none());

    let (_, _, body) = send_request(
        &test_app.app,
        Method::GET,
        "/api/threads?sid=alice&order=desc",
        None,
    )
    .await;
    assert_eq!(ids(&parse_json(&body)), vec!["c", "b", "a"]);
}

#[tokio::test]
async fn invalid_order_is_rejected() {
    let test_app = TestApp::new();
    let (status, _, body) = send_request(
        &test_app.app,
        Method::GET,
        "/api/threads?order=sideways",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let problem = parse_json(&body);
    assert_eq!(problem["type"], "urn:cooperson:error:invalid_request");
    assert_eq!(
        problem["detail"],
        "invalid request: invalid order: sideways (expected asc or desc)"
    );
}

#[tokio::test]
async fn missing_thread_is_a_problem_document() {
    let test_app = TestApp::new();
    for uri in ["/api/threads/nope", "/api/threads/nope/items"] {
        let (status, headers, body) = send_request(&test_app.app, Method::GET, uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(
            header_value(&headers, "content-type"),
            "application/problem+json"
        );
        let problem = parse_json(&body);
        assert_eq!(problem["type"], "urn:cooperson:error:thread_not_found");
        assert_eq!(problem["status"], 404);
        assert_eq!(problem["threadId"], "nope");
    }
}

#[tokio::test]
async fn get_thread_embeds_first_item_page() {
    let test_app = TestApp::new();
    seed_threads(&test_app.app, "default", &["t1"]).await;

    let (status, _, body) = send_request(&test_app.app, Method::GET, "/api/threads/t1", None).await;
    assert_eq!(status, StatusCode::OK);
    let thread = parse_json(&body);
    assert_eq!(thread["id"], "t1");
    assert_eq!(thread["title"], "Question for t1");
    assert_eq!(thread["items"]["data"][0]["type"], "user_message");
    assert_eq!(
        thread["items"]["data"][0]["content"][0]["text"],
        "Question for t1"
    );
}

#[tokio::test]
async fn deleting_a_thread_is_idempotent() {
    let test_app = TestApp::new();
    seed_threads(&test_app.app, "default", &["t1"]).await;

    for _ in 0..2 {
        let (status, _, body) =
            send_request(&test_app.app, Method::DELETE, "/api/threads/t1", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(body.is_empty());
    }
    let (status, _, _) = send_request(&test_app.app, Method::GET, "/api/threads/t1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn items_can_be_fetched_and_removed() {
    let test_app = TestApp::new();
    seed_threads(&test_app.app, "default", &["t1"]).await;

    let (_, _, body) = send_request(
        &test_app.app,
        Method::GET,
        "/api/threads/t1/items?limit=1",
        None,
    )
    .await;
    let page = parse_json(&body);
    assert_eq!(page["has_more"], true);
    let item_id = page["data"][0]["id"].as_str().expect("item id").to_string();
    let item_uri = format!("/api/threads/t1/items/{item_id}");

    let (status, _, body) = send_request(&test_app.app, Method::GET, &item_uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(&body)["type"], "user_message");

    let (status, _, _) = send_request(&test_app.app, Method::DELETE, &item_uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _, body) = send_request(&test_app.app, Method::GET, &item_uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let problem = parse_json(&body);
    assert_eq!(problem["type"], "urn:cooperson:error:item_not_found");
    assert_eq!(problem["itemId"], item_id.as_str());
}

#[tokio::test]
async fn sessions_do_not_see_each_other() {
    let test_app = TestApp::new();
    seed_threads(&test_app.app, "alice", &["shared"]).await;

    let (status, _, _) = send_request(
        &test_app.app,
        Method::GET,
        "/api/threads/shared?sid=bob",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = send_request(
        &test_app.app,
        Method::DELETE,
        "/api/threads/shared?sid=bob",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _, _) = send_request(
        &test_app.app,
        Method::GET,
        "/api/threads/shared?sid=alice",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}
