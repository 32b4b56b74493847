use std::io::{BufRead, BufReader, Write};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use reqwest::blocking::Client as HttpClient;
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use utoipa::OpenApi;

use crate::agent::{AgentRunner, ResponsesRunner, ScriptedRunner};
use crate::config::CoachConfig;
use crate::conversation_cache::{ConversationCache, DEFAULT_CAPACITY, DEFAULT_TTL};
use crate::router::{build_router_with_state, ApiDoc, AppState, ChatMessage, ChatRequestBody};
use crate::store::{Page, Thread, ThreadItem, ThreadMetadata};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8000;
const MOCK_EVENT_DELAY: Duration = Duration::from_millis(40);
const DEBUG_FILTER: &str = "info,cooperson=debug,cooperson_agent_events=debug";

#[derive(Parser, Debug)]
#[command(name = "cooperson", bin_name = "cooperson")]
#[command(about = "Jason Cooperson coaching chat backend", version)]
#[command(arg_required_else_help = true)]
pub struct CoopersonCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the coaching HTTP server.
    Server(ServerArgs),
    /// Call the HTTP API of a running server.
    Api(ApiArgs),
    /// Print the OpenAPI document.
    Openapi,
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method", short = 'M')]
    cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header", short = 'A')]
    cors_allow_header: Vec<String>,

    #[arg(long = "cors-allow-credentials", short = 'C')]
    cors_allow_credentials: bool,

    /// Serve a canned coaching reply instead of calling the hosted model.
    #[arg(long)]
    mock_agent: bool,

    /// Log every upstream and client event of each chat stream.
    #[arg(long)]
    debug: bool,

    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    cache_capacity: usize,

    #[arg(long, default_value_t = DEFAULT_TTL.as_secs())]
    cache_ttl_secs: u64,
}

#[derive(Args, Debug)]
pub struct ApiArgs {
    #[command(subcommand)]
    command: ApiCommand,
}

#[derive(Subcommand, Debug)]
pub enum ApiCommand {
    /// Browse stored threads.
    Threads(ThreadsArgs),
    /// Talk to the coach.
    Chat(ChatArgs),
}

#[derive(Args, Debug)]
pub struct ThreadsArgs {
    #[command(subcommand)]
    command: ThreadsCommand,
}

#[derive(Subcommand, Debug)]
pub enum ThreadsCommand {
    /// List threads of a session.
    List(ThreadListArgs),
    /// Show a thread with its first page of items.
    Get(ThreadArgs),
    /// Page through a thread's items.
    Items(ThreadItemsArgs),
}

#[derive(Args, Debug)]
pub struct ChatArgs {
    #[command(subcommand)]
    command: ChatCommand,
}

#[derive(Subcommand, Debug)]
pub enum ChatCommand {
    /// Send a message and print the streamed reply.
    Send(ChatSendArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    #[arg(long, short = 'e')]
    endpoint: Option<String>,

    /// Session key.
    #[arg(long, short = 's')]
    sid: Option<String>,
}

#[derive(Args, Debug)]
pub struct PageArgs {
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    after: Option<String>,
    #[arg(long)]
    order: Option<String>,
}

#[derive(Args, Debug)]
pub struct ThreadListArgs {
    #[command(flatten)]
    page: PageArgs,
    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Args, Debug)]
pub struct ThreadArgs {
    thread_id: String,
    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Args, Debug)]
pub struct ThreadItemsArgs {
    thread_id: String,
    #[command(flatten)]
    page: PageArgs,
    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Args, Debug)]
pub struct ChatSendArgs {
    #[arg(long, short = 'm')]
    message: String,
    #[arg(long, short = 't')]
    thread_id: Option<String>,
    /// Attachment ids uploaded beforehand.
    #[arg(long = "attachment", short = 'a')]
    attachments: Vec<String>,
    /// Print protocol lines as received.
    #[arg(long)]
    raw: bool,
    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid cors method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid cors header: {0}")]
    InvalidCorsHeader(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(String),
    #[error("unexpected http status: {0}")]
    HttpStatus(reqwest::StatusCode),
    #[error("chat stream error: {0}")]
    Stream(String),
}

pub fn run_cooperson() -> Result<(), CliError> {
    let cli = CoopersonCli::parse();
    let config = CoachConfig::from_env();
    if let Err(err) = init_logging(&cli.command, &config) {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    run_command(&cli.command, config)
}

pub fn init_logging(command: &Command, config: &CoachConfig) -> Result<(), CliError> {
    let debug = config.debug || matches!(command, Command::Server(args) if args.debug);
    let default_filter = if debug { DEBUG_FILTER } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
    Ok(())
}

pub fn run_command(command: &Command, config: CoachConfig) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server(config, args),
        Command::Api(subcommand) => run_api(&subcommand.command),
        Command::Openapi => write_stdout_line(&ApiDoc::openapi().to_pretty_json()?),
    }
}

fn run_server(mut config: CoachConfig, server: &ServerArgs) -> Result<(), CliError> {
    config.debug |= server.debug;
    let upload_base = config
        .public_base_url(&server.host, server.port)
        .map_err(|err| CliError::Server(err.to_string()))?;

    let runner: Arc<dyn AgentRunner> = if server.mock_agent {
        tracing::info!("using scripted mock agent");
        Arc::new(ScriptedRunner::demo().with_delay(MOCK_EVENT_DELAY))
    } else {
        Arc::new(ResponsesRunner::new(
            Arc::new(config.clone()),
            reqwest::Client::new(),
        ))
    };
    if let Err(err) = runner.check_ready() {
        tracing::warn!(error = %err, "chat requests will fail until configured");
    }

    let conversations = ConversationCache::new(
        server.cache_capacity,
        Duration::from_secs(server.cache_ttl_secs),
    );
    let state = Arc::new(AppState::new(config, upload_base, runner, conversations));
    let (mut router, _state) = build_router_with_state(state);

    let cors = build_cors_layer(server)?;
    router = router.layer(cors);

    let addr = format!("{}:{}", server.host, server.port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "server listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down");
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn run_api(command: &ApiCommand) -> Result<(), CliError> {
    match command {
        ApiCommand::Threads(subcommand) => run_threads(&subcommand.command),
        ApiCommand::Chat(subcommand) => run_chat(&subcommand.command),
    }
}

fn run_threads(command: &ThreadsCommand) -> Result<(), CliError> {
    match command {
        ThreadsCommand::List(args) => {
            let ctx = ClientContext::new(&args.client)?;
            let response = ctx.get("/api/threads", &args.page.query())?;
            print_json_response::<Page<ThreadMetadata>>(response)
        }
        ThreadsCommand::Get(args) => {
            let ctx = ClientContext::new(&args.client)?;
            let response = ctx.get(&format!("/api/threads/{}", args.thread_id), &[])?;
            print_json_response::<Thread>(response)
        }
        ThreadsCommand::Items(args) => {
            let ctx = ClientContext::new(&args.client)?;
            let path = format!("/api/threads/{}/items", args.thread_id);
            let response = ctx.get(&path, &args.page.query())?;
            print_json_response::<Page<ThreadItem>>(response)
        }
    }
}

fn run_chat(command: &ChatCommand) -> Result<(), CliError> {
    match command {
        ChatCommand::Send(args) => {
            let ctx = ClientContext::new(&args.client)?;
            let body = ChatRequestBody {
                messages: vec![ChatMessage {
                    role: "user".to_string(),
                    content: Value::String(args.message.clone()),
                }],
                thread_id: args.thread_id.clone(),
                attachments: args.attachments.clone(),
            };
            let response = ctx.post("/api/chat", &body)?;
            let status = response.status();
            if !status.is_success() {
                print_error_body(&response.text()?)?;
                return Err(CliError::HttpStatus(status));
            }
            print_chat_stream(BufReader::new(response), args.raw)
        }
    }
}

/// Prints reply text from data-stream lines; an error line fails the
/// command after the text received so far.
fn print_chat_stream(reader: impl BufRead, raw: bool) -> Result<(), CliError> {
    for line in reader.lines() {
        let line = line?;
        if raw {
            write_stdout_line(&line)?;
            continue;
        }
        if let Some(payload) = line.strip_prefix("0:") {
            let delta: String = serde_json::from_str(payload)?;
            write_stdout(&delta)?;
        } else if let Some(payload) = line.strip_prefix("3:") {
            write_stdout("\n")?;
            let message: String = serde_json::from_str(payload)?;
            return Err(CliError::Stream(message));
        } else if line == "d" {
            write_stdout("\n")?;
        }
    }
    Ok(())
}

impl PageArgs {
    fn query(&self) -> Vec<(&'static str, Option<String>)> {
        vec![
            ("limit", self.limit.map(|limit| limit.to_string())),
            ("after", self.after.clone()),
            ("order", self.order.clone()),
        ]
    }
}

fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    let mut cors = CorsLayer::new();

    let mut origins = Vec::new();
    for origin in &server.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    if origins.is_empty() {
        // No origins configured: cross-origin requests are refused.
        cors = cors.allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false));
    } else {
        cors = cors.allow_origin(origins);
    }

    if server.cors_allow_method.is_empty() {
        cors = cors.allow_methods(Any);
    } else {
        let mut methods = Vec::new();
        for method in &server.cors_allow_method {
            let parsed = method
                .parse()
                .map_err(|_| CliError::InvalidCorsMethod(method.clone()))?;
            methods.push(parsed);
        }
        cors = cors.allow_methods(methods);
    }

    if server.cors_allow_header.is_empty() {
        cors = cors.allow_headers(Any);
    } else {
        let mut headers = Vec::new();
        for header in &server.cors_allow_header {
            let parsed = header
                .parse()
                .map_err(|_| CliError::InvalidCorsHeader(header.clone()))?;
            headers.push(parsed);
        }
        cors = cors.allow_headers(headers);
    }

    if server.cors_allow_credentials {
        cors = cors.allow_credentials(true);
    }

    Ok(cors)
}

struct ClientContext {
    endpoint: String,
    sid: Option<String>,
    client: HttpClient,
}

impl ClientContext {
    fn new(args: &ClientArgs) -> Result<Self, CliError> {
        let endpoint = args
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", DEFAULT_HOST, DEFAULT_PORT));
        // Chat replies stream for as long as the model talks.
        let client = HttpClient::builder().timeout(None).build()?;
        Ok(Self {
            endpoint,
            sid: args.sid.clone(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint.trim_end_matches('/'), path)
    }

    fn request(&self, method: Method, path: &str) -> reqwest::blocking::RequestBuilder {
        let mut builder = self.client.request(method, self.url(path));
        if let Some(sid) = &self.sid {
            builder = builder.query(&[("sid", sid)]);
        }
        builder
    }

    fn get(
        &self,
        path: &str,
        query: &[(&str, Option<String>)],
    ) -> Result<reqwest::blocking::Response, CliError> {
        let mut request = self.request(Method::GET, path);
        for (key, value) in query {
            if let Some(value) = value {
                request = request.query(&[(key, value)]);
            }
        }
        Ok(request.send()?)
    }

    fn post<T: Serialize>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<reqwest::blocking::Response, CliError> {
        Ok(self.request(Method::POST, path).json(body).send()?)
    }
}

fn print_json_response<T: serde::de::DeserializeOwned + Serialize>(
    response: reqwest::blocking::Response,
) -> Result<(), CliError> {
    let status = response.status();
    let text = response.text()?;

    if !status.is_success() {
        print_error_body(&text)?;
        return Err(CliError::HttpStatus(status));
    }

    let parsed: T = serde_json::from_str(&text)?;
    let pretty = serde_json::to_string_pretty(&parsed)?;
    write_stdout_line(&pretty)?;
    Ok(())
}

fn print_error_body(text: &str) -> Result<(), CliError> {
    if let Ok(json) = serde_json::from_str::<Value>(text) {
        let pretty = serde_json::to_string_pretty(&json)?;
        write_stderr_line(&pretty)?;
    } else {
        write_stderr_line(text)?;
    }
    Ok(())
}

fn write_stdout(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stdout();
    out.write_all(text.as_bytes())?;
    out.flush()?;
    Ok(())
}

fn write_stdout_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stdout();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

fn write_stderr_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stderr();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_server_flags() {
        let cli = CoopersonCli::try_parse_from([
            "cooperson",
            "server",
            "--port",
            "9000",
            "--mock-agent",
            "-O",
            "http://localhost:3000",
            "--cache-ttl-secs",
            "60",
        ])
        .expect("parse");
        let Command::Server(args) = cli.command else {
            panic!("expected server command");
        };
        assert_eq!(args.port, 9000);
        assert!(args.mock_agent);
        assert_eq!(args.cache_ttl_secs, 60);
        assert_eq!(args.cache_capacity, DEFAULT_CAPACITY);
        assert!(build_cors_layer(&args).is_ok());
    }

    #[test]
    fn rejects_bad_cors_method() {
        let cli = CoopersonCli::try_parse_from(["cooperson", "server", "-M", "NOT A METHOD"])
            .expect("parse");
        let Command::Server(args) = cli.command else {
            panic!("expected server command");
        };
        assert!(matches!(
            build_cors_layer(&args),
            Err(CliError::InvalidCorsMethod(_))
        ));
    }

    #[test]
    fn chat_stream_stops_at_error_line() {
        let body = "0:\"Hello\"\n3:\"upstream \\\"busy\\\"\"\nd\n";
        let err = print_chat_stream(body.as_bytes(), false).expect_err("stream error");
        assert!(matches!(err, CliError::Stream(message) if message == "upstream \"busy\""));
        assert!(print_chat_stream("0:\"ok\"\ne:{}\nd\n".as_bytes(), false).is_ok());
    }
}
