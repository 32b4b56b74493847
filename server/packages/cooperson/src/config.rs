use cooperson_error::CoachError;
use url::Url;

pub const OPENAI_API_KEY: &str = "OPENAI_API_KEY";
pub const OPENAI_BASE_URL: &str = "OPENAI_BASE_URL";
pub const VECTOR_STORE_ID: &str = "JASON_VECTOR_STORE_ID";
pub const TAVILY_API_KEY: &str = "TAVILY_API_KEY";
pub const REEL_TRANSCRIBE_WEBHOOK_URL: &str = "REEL_TRANSCRIBE_WEBHOOK_URL";
pub const MODEL: &str = "COOPERSON_MODEL";
pub const PUBLIC_URL: &str = "COOPERSON_PUBLIC_URL";
pub const DEBUG: &str = "DEBUG";

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Settings read from the process environment. Required values are checked
/// where they are used, not at startup, so the server can boot with a
/// partial configuration and fail loudly per feature.
#[derive(Debug, Clone)]
pub struct CoachConfig {
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub vector_store_id: Option<String>,
    pub tavily_api_key: Option<String>,
    pub reel_webhook_url: Option<String>,
    pub model: String,
    pub public_url: Option<String>,
    pub debug: bool,
}

impl Default for CoachConfig {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            openai_base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            vector_store_id: None,
            tavily_api_key: None,
            reel_webhook_url: None,
            model: DEFAULT_MODEL.to_string(),
            public_url: None,
            debug: false,
        }
    }
}

impl CoachConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        Self {
            openai_api_key: read(OPENAI_API_KEY),
            openai_base_url: read(OPENAI_BASE_URL)
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
            vector_store_id: read(VECTOR_STORE_ID),
            tavily_api_key: read(TAVILY_API_KEY),
            reel_webhook_url: read(REEL_TRANSCRIBE_WEBHOOK_URL),
            model: read(MODEL).unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            public_url: read(PUBLIC_URL),
            debug: read(DEBUG).is_some_and(|value| is_truthy(&value)),
        }
    }

    pub fn require_openai_key(&self) -> Result<&str, CoachError> {
        self.openai_api_key
            .as_deref()
            .ok_or_else(|| CoachError::unconfigured(OPENAI_API_KEY))
    }

    pub fn require_vector_store_id(&self) -> Result<&str, CoachError> {
        self.vector_store_id
            .as_deref()
            .ok_or_else(|| CoachError::unconfigured(VECTOR_STORE_ID))
    }

    /// Base URL that attachment upload URLs are built from. Always ends in
    /// `/` so relative joins append instead of replacing the last segment.
    pub fn public_base_url(&self, host: &str, port: u16) -> Result<Url, CoachError> {
        let raw = match &self.public_url {
            Some(url) => url.clone(),
            None => {
                let host = match host {
                    "0.0.0.0" | "::" => "localhost",
                    other => other,
                };
                format!("http://{host}:{port}")
            }
        };
        let normalized = format!("{}/", raw.trim_end_matches('/'));
        Url::parse(&normalized).map_err(|err| {
            CoachError::invalid_request(format!("{PUBLIC_URL} is not a valid url: {err}"))
        })
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
