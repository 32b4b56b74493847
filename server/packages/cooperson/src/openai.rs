//! Thin proxies onto the hosted platform: knowledge-base files in the
//! coach's vector store, speech-to-text and text-to-speech.

use std::sync::Arc;

use axum::body::Bytes;
use cooperson_error::CoachError;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use utoipa::ToSchema;

use crate::config::CoachConfig;

pub const TRANSCRIPTION_MODEL: &str = "whisper-1";
pub const SPEECH_MODEL: &str = "tts-1";
pub const DEFAULT_VOICE: &str = "alloy";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct KnowledgeFile {
    pub id: String,
    pub filename: String,
    pub bytes: u64,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct FileList {
    pub files: Vec<KnowledgeFile>,
    pub vector_store_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct UploadedFile {
    #[serde(flatten)]
    pub file: KnowledgeFile,
    pub vector_store_id: String,
}

#[derive(Debug, Deserialize)]
struct ListEnvelope<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct VectorStoreFile {
    id: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Transcription {
    text: String,
}

#[derive(Debug, Clone)]
pub struct OpenAiClient {
    config: Arc<CoachConfig>,
    http: Client,
}

impl OpenAiClient {
    pub fn new(config: Arc<CoachConfig>, http: Client) -> Self {
        Self { config, http }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.openai_base_url, path)
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response, CoachError> {
        let api_key = self.config.require_openai_key()?;
        let response = request
            .bearer_auth(api_key)
            .send()
            .await
            .map_err(|err| CoachError::upstream(format!("{what} request failed: {err}")))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(CoachError::upstream(format!(
            "{what} returned {status}: {}",
            upstream_message(&body)
        )))
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> Result<T, CoachError> {
        self.send(request, what)
            .await?
            .json()
            .await
            .map_err(|err| CoachError::upstream(format!("{what} returned invalid json: {err}")))
    }

    /// Files attached to the coach's vector store. An unconfigured store
    /// lists as empty.
    pub async fn list_files(&self) -> Result<FileList, CoachError> {
        let Some(vector_store_id) = self.config.vector_store_id.clone() else {
            return Ok(FileList {
                files: Vec::new(),
                vector_store_id: None,
            });
        };
        let listed: ListEnvelope<VectorStoreFile> = self
            .send_json(
                self.http
                    .get(self.url(&format!("vector_stores/{vector_store_id}/files"))),
                "vector store file list",
            )
            .await?;
        let mut files = Vec::with_capacity(listed.data.len());
        for entry in listed.data {
            match self.retrieve_file(&entry.id).await {
                Ok(mut file) => {
                    file.status = entry.status;
                    files.push(file);
                }
                // One unreadable file does not hide the rest.
                Err(err) => tracing::warn!(file_id = %entry.id, error = %err, "skipping file"),
            }
        }
        Ok(FileList {
            files,
            vector_store_id: Some(vector_store_id),
        })
    }

    async fn retrieve_file(&self, file_id: &str) -> Result<KnowledgeFile, CoachError> {
        self.send_json(self.http.get(self.url(&format!("files/{file_id}"))), "file lookup")
            .await
    }

    /// Uploads a file and indexes it into the vector store.
    pub async fn upload_file(
        &self,
        filename: &str,
        bytes: Bytes,
    ) -> Result<UploadedFile, CoachError> {
        let vector_store_id = self.config.require_vector_store_id()?.to_string();
        let form = Form::new()
            .text("purpose", "assistants")
            .part("file", Part::bytes(bytes.to_vec()).file_name(filename.to_string()));
        let mut file: KnowledgeFile = self
            .send_json(
                self.http.post(self.url("files")).multipart(form),
                "file upload",
            )
            .await?;
        let indexed: VectorStoreFile = self
            .send_json(
                self.http
                    .post(self.url(&format!("vector_stores/{vector_store_id}/files")))
                    .json(&json!({ "file_id": file.id })),
                "vector store attach",
            )
            .await?;
        file.status = indexed.status;
        tracing::info!(file_id = %file.id, filename, vector_store_id = %vector_store_id, "knowledge file uploaded");
        Ok(UploadedFile {
            file,
            vector_store_id,
        })
    }

    /// Detaches the file from the vector store, then deletes it. A failed
    /// detach is logged and does not stop the delete.
    pub async fn delete_file(&self, file_id: &str) -> Result<(), CoachError> {
        let vector_store_id = self.config.require_vector_store_id()?.to_string();
        if let Err(err) = self
            .send(
                self.http.delete(
                    self.url(&format!("vector_stores/{vector_store_id}/files/{file_id}")),
                ),
                "vector store detach",
            )
            .await
        {
            tracing::warn!(file_id, error = %err, "vector store detach failed");
        }
        self.send(
            self.http.delete(self.url(&format!("files/{file_id}"))),
            "file delete",
        )
        .await?;
        tracing::info!(file_id, "knowledge file deleted");
        Ok(())
    }

    pub async fn transcribe(
        &self,
        filename: &str,
        mime_type: Option<&str>,
        bytes: Bytes,
    ) -> Result<String, CoachError> {
        let mut part = Part::bytes(bytes.to_vec()).file_name(filename.to_string());
        if let Some(mime_type) = mime_type {
            part = part
                .mime_str(mime_type)
                .map_err(|err| CoachError::invalid_request(format!("invalid audio type: {err}")))?;
        }
        let form = Form::new()
            .text("model", TRANSCRIPTION_MODEL)
            .part("file", part);
        let transcription: Transcription = self
            .send_json(
                self.http
                    .post(self.url("audio/transcriptions"))
                    .multipart(form),
                "transcription",
            )
            .await?;
        Ok(transcription.text)
    }

    /// Synthesizes `text` as MPEG audio.
    pub async fn speech(&self, text: &str, voice: Option<&str>) -> Result<Bytes, CoachError> {
        if text.trim().is_empty() {
            return Err(CoachError::invalid_request("text is empty"));
        }
        let body = json!({
            "model": SPEECH_MODEL,
            "input": text,
            "voice": voice.unwrap_or(DEFAULT_VOICE),
            "response_format": "mp3",
        });
        self.send(
            self.http.post(self.url("audio/speech")).json(&body),
            "speech",
        )
        .await?
        .bytes()
        .await
        .map_err(|err| CoachError::upstream(format!("speech body failed: {err}")))
    }
}

/// Pulls `error.message` out of a platform error body, falling back to the
/// raw text.
pub(crate) fn upstream_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("error")
                .and_then(|error| error.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}
