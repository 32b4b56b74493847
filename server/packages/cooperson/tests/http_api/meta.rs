use super::*;

use cooperson::router::ApiDoc;
use utoipa::OpenApi;

#[tokio::test]
async fn health_and_root() {
    let test_app = TestApp::new();

    let (status, _, body) = send_request(&test_app.app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        parse_json(&body),
        json!({"status": "healthy", "agent": "Jason Cooperson Coaching Agent"})
    );

    let (status, _, body) = send_request(&test_app.app, Method::GET, "/", None).await;
    assert_eq!(status, StatusCode::OK);
    let root = parse_json(&body);
    assert_eq!(root["status"], "running");
    assert_eq!(root["endpoints"]["chat"], "/api/chat");
    assert_eq!(root["endpoints"]["health"], "/health");
}

#[tokio::test]
async fn unknown_route_is_problem_json() {
    let test_app = TestApp::new();
    let (status, headers, body) =
        send_request(&test_app.app, Method::GET, "/api/nowhere", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(
        header_value(&headers, "content-type"),
        "application/problem+json"
    );
    assert_eq!(parse_json(&body)["detail"], "endpoint not found");
}

#[tokio::test]
async fn widget_action_is_acknowledged() {
    let test_app = TestApp::new();
    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        "/api/widget-action",
        Some(json!({"action": {"type": "book_call"}, "itemId": "msg_1"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(&body), json!({"status": "ok"}));
}

#[tokio::test]
async fn knowledge_files_are_empty_without_a_vector_store() {
    let test_app = TestApp::new();
    let (status, _, body) = send_request(&test_app.app, Method::GET, "/api/files", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(&body)["files"], json!([]));

    let (status, _, body) =
        send_request(&test_app.app, Method::DELETE, "/api/files/file_1", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(parse_json(&body)["type"], "urn:cooperson:error:unconfigured");
}

#[test]
fn openapi_lists_every_route_group() {
    let doc = ApiDoc::openapi();
    for path in [
        "/api/chat",
        "/chatkit",
        "/api/threads",
        "/api/threads/{thread_id}/items/{item_id}",
        "/api/attachments/{attachment_id}/upload",
        "/api/files",
        "/health",
    ] {
        assert!(doc.paths.paths.contains_key(path), "missing {path}");
    }
}
