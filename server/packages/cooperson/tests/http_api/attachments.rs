use super::*;

async fn create_attachment(app: &Router, name: &str, mime_type: &str) -> Value {
    let (status, _, body) = send_request(
        app,
        Method::POST,
        "/api/attachments?sid=alice",
        Some(json!({"name": name, "mimeType": mime_type})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    parse_json(&body)
}

async fn upload(app: &Router, attachment_id: &str, bytes: &[u8]) -> StatusCode {
    let (status, _, _) = send_request_raw(
        app,
        Method::POST,
        &format!("/api/attachments/{attachment_id}/upload?sid=alice"),
        Some(bytes.to_vec()),
        Some("application/octet-stream"),
    )
    .await;
    status
}

#[tokio::test]
async fn two_phase_upload_then_chat_with_attachment() {
    let test_app = TestApp::new();

    let attachment = create_attachment(&test_app.app, "notes.txt", "text/plain").await;
    let attachment_id = attachment["id"].as_str().expect("id").to_string();
    assert!(attachment_id.starts_with("atc_"));
    assert_eq!(attachment["size"], 0);
    assert_eq!(
        attachment["upload_url"],
        format!("http://localhost:8000/api/attachments/{attachment_id}/upload?sid=alice")
    );
    let attachment_uri = format!("/api/attachments/{attachment_id}?sid=alice");

    let (status, _, body) = send_request(&test_app.app, Method::GET, &attachment_uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let problem = parse_json(&body);
    assert_eq!(problem["type"], "urn:cooperson:error:attachment_not_found");
    assert_eq!(problem["pendingUpload"], true);

    assert_eq!(upload(&test_app.app, &attachment_id, b"hello").await, StatusCode::OK);

    let (status, headers, body) =
        send_request(&test_app.app, Method::GET, &attachment_uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"hello");
    assert_eq!(header_value(&headers, "content-type"), "text/plain");
    assert_eq!(
        header_value(&headers, "content-disposition"),
        "inline; filename=\"notes.txt\""
    );

    let mut request = user_message("Summarize my notes");
    request["attachments"] = json!([attachment_id]);
    let (status, _, _) =
        send_request(&test_app.app, Method::POST, "/api/chat?sid=alice", Some(request)).await;
    assert_eq!(status, StatusCode::OK);
    let input = test_app.runner.last_input_text().expect("runner input");
    assert!(input.starts_with("Summarize my notes"));
    assert!(input.contains("Attached file notes.txt:\nhello"));

    let (status, _, _) = send_request(&test_app.app, Method::DELETE, &attachment_uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _, body) = send_request(&test_app.app, Method::GET, &attachment_uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(parse_json(&body).get("pendingUpload").is_none());
}

#[tokio::test]
async fn attachment_only_message_is_accepted() {
    let test_app = TestApp::new();
    let attachment = create_attachment(&test_app.app, "chart.png", "image/png").await;
    let attachment_id = attachment["id"].as_str().expect("id").to_string();
    assert_eq!(
        upload(&test_app.app, &attachment_id, &[0x89, b'P', b'N', b'G']).await,
        StatusCode::OK
    );

    let request = json!({
        "messages": [{"role": "user", "content": ""}],
        "attachments": [attachment_id],
    });
    let (status, _, _) =
        send_request(&test_app.app, Method::POST, "/api/chat?sid=alice", Some(request)).await;
    assert_eq!(status, StatusCode::OK);
    let requests = test_app.runner.requests();
    let last = requests.last().expect("run request");
    assert!(matches!(
        last.input.as_slice(),
        [cooperson::agent::InputPart::Image { data_url }] if data_url.starts_with("data:image/png;base64,")
    ));
}

#[tokio::test]
async fn unsupported_attachment_type_fails_before_streaming() {
    let test_app = TestApp::new();
    let attachment = create_attachment(&test_app.app, "bundle.zip", "application/zip").await;
    let attachment_id = attachment["id"].as_str().expect("id").to_string();
    assert_eq!(upload(&test_app.app, &attachment_id, b"PK").await, StatusCode::OK);

    let mut request = user_message("What is in here?");
    request["attachments"] = json!([attachment_id]);
    let (status, _, body) =
        send_request(&test_app.app, Method::POST, "/api/chat?sid=alice", Some(request)).await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    let problem = parse_json(&body);
    assert_eq!(problem["type"], "urn:cooperson:error:unsupported_media_type");
    assert_eq!(problem["mimeType"], "application/zip");
    assert!(test_app.runner.requests().is_empty());
}

#[tokio::test]
async fn upload_to_unknown_attachment_is_not_found() {
    let test_app = TestApp::new();
    assert_eq!(
        upload(&test_app.app, "atc_missing", b"data").await,
        StatusCode::NOT_FOUND
    );
}
