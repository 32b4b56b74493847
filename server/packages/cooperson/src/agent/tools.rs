use std::time::Duration;

use cooperson_agent_events::FunctionCall;
use cooperson_error::CoachError;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::CoachConfig;

pub const WEB_SEARCH_TOOL: &str = "web_search";
pub const REEL_TOOL: &str = "transcribe_reel";
pub const TAVILY_SEARCH_URL: &str = "https://api.tavily.com/search";
const WEB_SEARCH_MAX_RESULTS: u32 = 5;
const TOOL_TIMEOUT: Duration = Duration::from_secs(90);

/// Local function tools. Each tool is registered only when its settings
/// are present.
#[derive(Debug, Clone)]
pub struct ToolExecutor {
    http: Client,
    tavily_api_key: Option<String>,
    tavily_url: String,
    reel_webhook_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WebSearchArgs {
    query: String,
    #[serde(default)]
    search_depth: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReelArgs {
    reel_url: String,
}

#[derive(Debug, Default, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Debug, Deserialize)]
struct TavilyResult {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

impl ToolExecutor {
    pub fn from_config(config: &CoachConfig, http: Client) -> Self {
        Self {
            http,
            tavily_api_key: config.tavily_api_key.clone(),
            tavily_url: TAVILY_SEARCH_URL.to_string(),
            reel_webhook_url: config.reel_webhook_url.clone(),
        }
    }

    pub fn with_tavily_url(mut self, url: impl Into<String>) -> Self {
        self.tavily_url = url.into();
        self
    }

    /// Function tool declarations in Responses API shape.
    pub fn definitions(&self) -> Vec<Value> {
        let mut tools = Vec::new();
        if self.tavily_api_key.is_some() {
            tools.push(json!({
                "type": "function",
                "name": WEB_SEARCH_TOOL,
                "description": "Search the web for current information such as recent platform changes, trends and news.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "query": {"type": "string", "description": "The search query"},
                        "search_depth": {
                            "type": "string",
                            "enum": ["basic", "advanced"],
                            "description": "basic for quick results, advanced for comprehensive search"
                        }
                    },
                    "required": ["query"]
                }
            }));
        }
        if self.reel_webhook_url.is_some() {
            tools.push(json!({
                "type": "function",
                "name": REEL_TOOL,
                "description": "Transcribe a short-form video (Instagram reel, TikTok) from its URL.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "reel_url": {"type": "string", "description": "Public URL of the video"}
                    },
                    "required": ["reel_url"]
                }
            }));
        }
        tools
    }

    /// Runs one function call. Failures are reported to the model as the
    /// tool output instead of aborting the run.
    pub async fn execute(&self, call: &FunctionCall) -> String {
        let result = match call.name.as_str() {
            WEB_SEARCH_TOOL => self.web_search(&call.arguments).await,
            REEL_TOOL => self.transcribe_reel(&call.arguments).await,
            other => Err(CoachError::invalid_request(format!("unknown tool {other}"))),
        };
        match result {
            Ok(output) => output,
            Err(err) => {
                tracing::warn!(tool = %call.name, call_id = %call.call_id, error = %err, "tool call failed");
                format!("{} error: {err}", call.name)
            }
        }
    }

    async fn web_search(&self, arguments: &str) -> Result<String, CoachError> {
        let api_key = self
            .tavily_api_key
            .as_deref()
            .ok_or_else(|| CoachError::unconfigured(crate::config::TAVILY_API_KEY))?;
        let args: WebSearchArgs = parse_arguments(arguments)?;
        let depth = match args.search_depth.as_deref() {
            Some("advanced") => "advanced",
            _ => "basic",
        };
        tracing::debug!(query = %args.query, depth, "web search");
        let response = self
            .http
            .post(&self.tavily_url)
            .timeout(TOOL_TIMEOUT)
            .json(&json!({
                "api_key": api_key,
                "query": args.query,
                "search_depth": depth,
                "max_results": WEB_SEARCH_MAX_RESULTS,
                "include_answer": true,
            }))
            .send()
            .await
            .map_err(|err| CoachError::upstream(format!("web search request failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CoachError::upstream(format!(
                "web search returned {status}: {body}"
            )));
        }
        let parsed: TavilyResponse = response
            .json()
            .await
            .map_err(|err| CoachError::upstream(format!("invalid web search response: {err}")))?;
        Ok(format_search_results(&parsed))
    }

    async fn transcribe_reel(&self, arguments: &str) -> Result<String, CoachError> {
        let webhook = self
            .reel_webhook_url
            .as_deref()
            .ok_or_else(|| CoachError::unconfigured(crate::config::REEL_TRANSCRIBE_WEBHOOK_URL))?;
        let args: ReelArgs = parse_arguments(arguments)?;
        tracing::debug!(reel_url = %args.reel_url, "transcribing reel");
        let response = self
            .http
            .post(webhook)
            .timeout(TOOL_TIMEOUT)
            .json(&json!({ "reel_url": args.reel_url }))
            .send()
            .await
            .map_err(|err| CoachError::upstream(format!("transcription webhook failed: {err}")))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(CoachError::upstream(format!(
                "transcription webhook returned {status}: {body}"
            )));
        }
        // Webhooks answer either plain text or JSON with a transcript field.
        let transcript = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|value| {
                ["transcript", "text", "transcription"]
                    .iter()
                    .find_map(|key| value.get(*key).and_then(Value::as_str).map(str::to_string))
            })
            .unwrap_or(body);
        Ok(transcript)
    }
}

fn parse_arguments<T: for<'de> Deserialize<'de>>(arguments: &str) -> Result<T, CoachError> {
    serde_json::from_str(arguments)
        .map_err(|err| CoachError::invalid_request(format!("invalid tool arguments: {err}")))
}

fn format_search_results(response: &TavilyResponse) -> String {
    let mut lines = Vec::new();
    if let Some(answer) = response.answer.as_deref().filter(|a| !a.is_empty()) {
        lines.push(format!("Summary: {answer}\n"));
    }
    lines.push("Search Results:".to_string());
    for (index, result) in response.results.iter().enumerate() {
        lines.push(format!(
            "\n{}. {}",
            index + 1,
            result.title.as_deref().unwrap_or("No title")
        ));
        lines.push(format!("   URL: {}", result.url.as_deref().unwrap_or("N/A")));
        lines.push(format!(
            "   {}",
            result.content.as_deref().unwrap_or("No content")
        ));
    }
    lines.join("\n")
}
