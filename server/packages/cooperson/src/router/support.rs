use super::*;

pub(super) async fn not_found() -> Response {
    let problem = ProblemDetails {
        type_: ErrorType::InvalidRequest.as_urn().to_string(),
        title: "Not Found".to_string(),
        status: 404,
        detail: Some("endpoint not found".to_string()),
        instance: None,
        extensions: serde_json::Map::new(),
    };
    problem_response(problem)
}

pub(super) fn problem_response(problem: ProblemDetails) -> Response {
    let status = StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(header::CONTENT_TYPE, "application/problem+json")],
        Json(problem),
    )
        .into_response()
}

/// Streams the chat turn in the data-stream line protocol.
pub(super) fn data_stream_response(outputs: ChatStream) -> Response {
    let lines = outputs.filter_map(|output| async move {
        match output {
            ChatOutput::Event(event) => data_stream::encode(&event).map(Ok::<_, Infallible>),
            _ => None,
        }
    });
    (
        [
            (header::CONTENT_TYPE, data_stream::CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Body::from_stream(lines),
    )
        .into_response()
}

pub(super) fn chatkit_sse_response(events: BoxStream<'static, ChatKitEvent>) -> Response {
    let stream = events.map(|event| Event::default().json_data(event));
    Sse::new(stream).into_response()
}

/// First multipart field named `name`, as `(filename, content type, bytes)`.
pub(super) async fn read_file_field(
    multipart: &mut Multipart,
    name: &str,
) -> Result<(String, Option<String>, Bytes), ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| CoachError::invalid_request(format!("invalid multipart body: {err}")))?
    {
        if field.name() != Some(name) {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload").to_string();
        let content_type = field.content_type().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|err| CoachError::invalid_request(format!("failed to read {name}: {err}")))?;
        return Ok((filename, content_type, bytes));
    }
    Err(CoachError::invalid_request(format!("multipart field `{name}` is required")).into())
}

/// Opaque url-safe token with `bytes` of randomness.
pub(super) fn random_token(bytes: usize) -> String {
    let mut raw = Vec::with_capacity(bytes + 16);
    while raw.len() < bytes {
        raw.extend_from_slice(Uuid::new_v4().as_bytes());
    }
    raw.truncate(bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw)
}
