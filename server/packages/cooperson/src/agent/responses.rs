use std::collections::VecDeque;
use std::sync::Arc;

use axum::body::Bytes;
use cooperson_agent_events::{FinishReason, RunEvent, ResponsesDecoder, TokenUsage, ToolKind};
use cooperson_error::CoachError;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};

use super::{
    AgentRunRequest, AgentRunner, InputPart, Role, RunEventStream, SseAccumulator, ToolExecutor,
};
use crate::config::CoachConfig;
use crate::openai::upstream_message;

/// Upper bound on function-call round trips within one run.
pub const MAX_TOOL_ROUNDS: usize = 5;
const FILE_SEARCH_MAX_RESULTS: u32 = 10;

const INSTRUCTIONS: &str = "You are Jason Cooperson, a social media marketing coach. \
Answer from the knowledge base first, use web search for anything recent, \
and keep answers practical and conversational.";

/// Streams runs from the hosted Responses API.
#[derive(Debug, Clone)]
pub struct ResponsesRunner {
    config: Arc<CoachConfig>,
    http: Client,
    tools: ToolExecutor,
}

impl ResponsesRunner {
    pub fn new(config: Arc<CoachConfig>, http: Client) -> Self {
        let tools = ToolExecutor::from_config(&config, http.clone());
        Self {
            config,
            http,
            tools,
        }
    }

    pub fn with_tools(mut self, tools: ToolExecutor) -> Self {
        self.tools = tools;
        self
    }

    fn first_request(&self, request: &AgentRunRequest, vector_store_id: &str) -> Value {
        let mut input: Vec<Value> = Vec::new();
        if request.previous_response_id.is_none() {
            for turn in &request.history {
                input.push(json!({
                    "role": match turn.role {
                        Role::User => "user",
                        Role::Assistant => "assistant",
                    },
                    "content": turn.text,
                }));
            }
        }
        let content: Vec<Value> = request
            .input
            .iter()
            .map(|part| match part {
                InputPart::Text(text) => json!({"type": "input_text", "text": text}),
                InputPart::Image { data_url } => {
                    json!({"type": "input_image", "image_url": data_url})
                }
                InputPart::File { filename, data_url } => {
                    json!({"type": "input_file", "filename": filename, "file_data": data_url})
                }
            })
            .collect();
        input.push(json!({"role": "user", "content": content}));

        let mut tools = vec![json!({
            "type": "file_search",
            "vector_store_ids": [vector_store_id],
            "max_num_results": FILE_SEARCH_MAX_RESULTS,
        })];
        tools.extend(self.tools.definitions());

        let mut body = json!({
            "model": self.config.model,
            "instructions": INSTRUCTIONS,
            "input": input,
            "tools": tools,
            "stream": true,
            "store": true,
        });
        if let Some(previous) = &request.previous_response_id {
            body["previous_response_id"] = Value::String(previous.clone());
        }
        body
    }

    fn follow_up_request(&self, previous_response_id: &str, outputs: Vec<Value>) -> Value {
        let mut tools = vec![];
        if let Some(vector_store_id) = self.config.vector_store_id.as_deref() {
            tools.push(json!({
                "type": "file_search",
                "vector_store_ids": [vector_store_id],
                "max_num_results": FILE_SEARCH_MAX_RESULTS,
            }));
        }
        tools.extend(self.tools.definitions());
        json!({
            "model": self.config.model,
            "instructions": INSTRUCTIONS,
            "previous_response_id": previous_response_id,
            "input": outputs,
            "tools": tools,
            "stream": true,
            "store": true,
        })
    }

    async fn open(&self, body: &Value) -> Result<BoxStream<'static, reqwest::Result<Bytes>>, CoachError> {
        let api_key = self.config.require_openai_key()?;
        let url = format!("{}/responses", self.config.openai_base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .json(body)
            .send()
            .await
            .map_err(|err| CoachError::upstream(format!("responses request failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CoachError::upstream(format!(
                "responses api returned {status}: {}",
                upstream_message(&body)
            )));
        }
        Ok(response.bytes_stream().boxed())
    }
}

impl AgentRunner for ResponsesRunner {
    fn check_ready(&self) -> Result<(), CoachError> {
        self.config.require_openai_key()?;
        self.config.require_vector_store_id()?;
        Ok(())
    }

    fn run(&self, request: AgentRunRequest) -> RunEventStream {
        let vector_store_id = match self
            .check_ready()
            .and_then(|_| self.config.require_vector_store_id().map(str::to_string))
        {
            Ok(id) => id,
            Err(err) => return stream::once(async move { Err(err) }).boxed(),
        };
        tracing::debug!(
            session = %request.session,
            thread_id = %request.thread_id,
            chained = request.previous_response_id.is_some(),
            "starting responses run"
        );
        let state = RunState {
            next_request: Some(self.first_request(&request, &vector_store_id)),
            runner: self.clone(),
            body: None,
            sse: SseAccumulator::new(),
            decoder: ResponsesDecoder::new(),
            queue: VecDeque::new(),
            rounds: 0,
            usage: TokenUsage::default(),
            done: false,
        };
        stream::unfold(state, |mut state| async move {
            let item = state.next_item().await?;
            Some((item, state))
        })
        .boxed()
    }
}

struct RunState {
    runner: ResponsesRunner,
    next_request: Option<Value>,
    body: Option<BoxStream<'static, reqwest::Result<Bytes>>>,
    sse: SseAccumulator,
    decoder: ResponsesDecoder,
    queue: VecDeque<Result<RunEvent, CoachError>>,
    rounds: usize,
    usage: TokenUsage,
    done: bool,
}

impl RunState {
    async fn next_item(&mut self) -> Option<Result<RunEvent, CoachError>> {
        loop {
            if let Some(item) = self.queue.pop_front() {
                return Some(item);
            }
            if self.done {
                return None;
            }
            if let Some(body) = self.body.as_mut() {
                match body.next().await {
                    Some(Ok(chunk)) => {
                        for data in self.sse.push(&chunk) {
                            self.handle_data(&data);
                        }
                    }
                    Some(Err(err)) => {
                        self.fail(CoachError::upstream(format!("responses stream failed: {err}")));
                    }
                    None => {
                        self.body = None;
                        if let Some(data) = self.sse.finish() {
                            self.handle_data(&data);
                        }
                        if !self.done {
                            self.response_finished().await;
                        }
                    }
                }
                continue;
            }
            match self.next_request.take() {
                Some(request) => match self.runner.open(&request).await {
                    Ok(body) => self.body = Some(body),
                    Err(err) => self.fail(err),
                },
                None => self.done = true,
            }
        }
    }

    fn handle_data(&mut self, data: &str) {
        if data == "[DONE]" {
            return;
        }
        let event: Value = match serde_json::from_str(data) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(error = %err, "skipping malformed responses event");
                return;
            }
        };
        for decoded in self.decoder.decode(&event) {
            if let RunEvent::Error { message } = decoded {
                self.fail(CoachError::upstream(message));
                return;
            }
            self.queue.push_back(Ok(decoded));
        }
    }

    /// One hosted response ended: run requested tools and chain a follow-up,
    /// or complete the run.
    async fn response_finished(&mut self) {
        let calls = self.decoder.take_function_calls();
        let completion = self.decoder.take_completion();
        if let Some(completion) = &completion {
            self.usage.add(completion.usage);
        }

        if !calls.is_empty() {
            if self.rounds >= MAX_TOOL_ROUNDS {
                tracing::warn!(rounds = self.rounds, "tool round limit reached");
                self.queue.push_back(Ok(RunEvent::Completed {
                    finish_reason: FinishReason::ToolCalls,
                    usage: self.usage,
                    response_id: completion.and_then(|c| c.response_id),
                }));
                self.done = true;
                return;
            }
            let Some(previous) = self.decoder.response_id().map(str::to_string) else {
                self.fail(CoachError::upstream("response id missing before tool outputs"));
                return;
            };
            self.rounds += 1;
            let mut outputs = Vec::with_capacity(calls.len());
            for call in &calls {
                let output = self.runner.tools.execute(call).await;
                self.queue.push_back(Ok(RunEvent::ToolCompleted {
                    call_id: call.call_id.clone(),
                    tool: ToolKind::Function {
                        name: call.name.clone(),
                    },
                }));
                outputs.push(json!({
                    "type": "function_call_output",
                    "call_id": call.call_id,
                    "output": output,
                }));
            }
            self.next_request = Some(self.runner.follow_up_request(&previous, outputs));
            self.decoder = ResponsesDecoder::new();
            return;
        }

        match completion {
            Some(completion) => {
                self.queue.push_back(Ok(RunEvent::Completed {
                    finish_reason: completion.finish_reason,
                    usage: self.usage,
                    response_id: completion.response_id,
                }));
                self.done = true;
            }
            None => self.fail(CoachError::upstream(
                "responses stream ended before completion",
            )),
        }
    }

    fn fail(&mut self, err: CoachError) {
        self.queue.push_back(Err(err));
        self.body = None;
        self.next_request = None;
        self.done = true;
    }
}
