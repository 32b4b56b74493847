use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    ThreadNotFound,
    ItemNotFound,
    AttachmentNotFound,
    Unconfigured,
    UpstreamFailure,
    UnsupportedMediaType,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:cooperson:error:invalid_request",
            Self::ThreadNotFound => "urn:cooperson:error:thread_not_found",
            Self::ItemNotFound => "urn:cooperson:error:item_not_found",
            Self::AttachmentNotFound => "urn:cooperson:error:attachment_not_found",
            Self::Unconfigured => "urn:cooperson:error:unconfigured",
            Self::UpstreamFailure => "urn:cooperson:error:upstream_failure",
            Self::UnsupportedMediaType => "urn:cooperson:error:unsupported_media_type",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::ThreadNotFound => "Thread Not Found",
            Self::ItemNotFound => "Item Not Found",
            Self::AttachmentNotFound => "Attachment Not Found",
            Self::Unconfigured => "Unconfigured",
            Self::UpstreamFailure => "Upstream Failure",
            Self::UnsupportedMediaType => "Unsupported Media Type",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::ThreadNotFound => 404,
            Self::ItemNotFound => 404,
            Self::AttachmentNotFound => 404,
            Self::Unconfigured => 503,
            Self::UpstreamFailure => 502,
            Self::UnsupportedMediaType => 415,
        }
    }

    /// True for the three lookup-by-id failures.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ThreadNotFound | Self::ItemNotFound | Self::AttachmentNotFound
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum CoachError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("thread {thread_id} not found")]
    ThreadNotFound { thread_id: String },
    #[error("item {item_id} not found in thread {thread_id}")]
    ItemNotFound { thread_id: String, item_id: String },
    /// Also raised for attachments whose byte upload has not completed yet.
    #[error("attachment {attachment_id} not found")]
    AttachmentNotFound {
        attachment_id: String,
        pending_upload: bool,
    },
    #[error("{setting} is not configured")]
    Unconfigured { setting: String },
    #[error("{message}")]
    UpstreamFailure { message: String },
    #[error("unsupported media type: {mime_type}")]
    UnsupportedMediaType { mime_type: String },
}

impl CoachError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn unconfigured(setting: impl Into<String>) -> Self {
        Self::Unconfigured {
            setting: setting.into(),
        }
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::UpstreamFailure {
            message: message.into(),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::ThreadNotFound { .. } => ErrorType::ThreadNotFound,
            Self::ItemNotFound { .. } => ErrorType::ItemNotFound,
            Self::AttachmentNotFound { .. } => ErrorType::AttachmentNotFound,
            Self::Unconfigured { .. } => ErrorType::Unconfigured,
            Self::UpstreamFailure { .. } => ErrorType::UpstreamFailure,
            Self::UnsupportedMediaType { .. } => ErrorType::UnsupportedMediaType,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.error_type().is_not_found()
    }

    fn extensions(&self) -> Map<String, Value> {
        let mut map = Map::new();
        match self {
            Self::InvalidRequest { .. } | Self::UpstreamFailure { .. } => {}
            Self::ThreadNotFound { thread_id } => {
                map.insert("threadId".to_string(), Value::String(thread_id.clone()));
            }
            Self::ItemNotFound { thread_id, item_id } => {
                map.insert("threadId".to_string(), Value::String(thread_id.clone()));
                map.insert("itemId".to_string(), Value::String(item_id.clone()));
            }
            Self::AttachmentNotFound {
                attachment_id,
                pending_upload,
            } => {
                map.insert(
                    "attachmentId".to_string(),
                    Value::String(attachment_id.clone()),
                );
                if *pending_upload {
                    map.insert("pendingUpload".to_string(), Value::Bool(true));
                }
            }
            Self::Unconfigured { setting } => {
                map.insert("setting".to_string(), Value::String(setting.clone()));
            }
            Self::UnsupportedMediaType { mime_type } => {
                map.insert("mimeType".to_string(), Value::String(mime_type.clone()));
            }
        }
        map
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        problem.extensions = self.extensions();
        problem
    }
}

impl From<CoachError> for ProblemDetails {
    fn from(value: CoachError) -> Self {
        value.to_problem_details()
    }
}

impl From<&CoachError> for ProblemDetails {
    fn from(value: &CoachError) -> Self {
        value.to_problem_details()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_attachment_is_not_found_with_marker() {
        let err = CoachError::AttachmentNotFound {
            attachment_id: "atc_1".to_string(),
            pending_upload: true,
        };
        assert!(err.is_not_found());
        let problem = err.to_problem_details();
        assert_eq!(problem.status, 404);
        assert_eq!(problem.type_, "urn:cooperson:error:attachment_not_found");
        assert_eq!(problem.extensions.get("pendingUpload"), Some(&Value::Bool(true)));
    }

    #[test]
    fn unconfigured_names_the_setting() {
        let problem = CoachError::unconfigured("JASON_VECTOR_STORE_ID").to_problem_details();
        assert_eq!(problem.status, 503);
        assert_eq!(
            problem.detail.as_deref(),
            Some("JASON_VECTOR_STORE_ID is not configured")
        );
        assert_eq!(
            problem.extensions.get("setting"),
            Some(&Value::String("JASON_VECTOR_STORE_ID".to_string()))
        );
    }

    #[test]
    fn upstream_failure_displays_bare_message() {
        let err = CoachError::upstream("model said \"no\"");
        assert_eq!(err.to_string(), "model said \"no\"");
        assert_eq!(err.error_type().status_code(), 502);
    }
}
