use thiserror::Error;

#[derive(Debug, Error)]
pub enum DroidClawError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("LLM provider error: {0}")]
    LlmProvider(String),

    #[error("LLM API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("SSE parsing error: {0}")]
    SseParsing(String),

    #[error("Perception error: {0}")]
    Perception(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Safety violation: {0}")]
    SafetyViolation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TOML deserialize error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Task cancelled")]
    Cancelled,
}

impl serde::Serialize for DroidClawError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

pub type DroidClawResult<T> = Result<T, DroidClawError>;

/// Stable, user-facing category for a failed reasoning-service call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    HostUnreachable,
    Tls,
    Network,
    Unauthorized,
    Forbidden,
    NotFound,
    RateLimited,
    Server,
    Api,
    Other,
}

impl FailureKind {
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => FailureKind::Unauthorized,
            403 => FailureKind::Forbidden,
            404 => FailureKind::NotFound,
            429 => FailureKind::RateLimited,
            500..=599 => FailureKind::Server,
            _ => FailureKind::Api,
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "The model service timed out. Check the network and try again.",
            FailureKind::HostUnreachable => "Cannot reach the model service host. Check the API address and DNS.",
            FailureKind::Tls => "Secure connection to the model service failed (TLS/certificate error).",
            FailureKind::Network => "Network error while contacting the model service.",
            FailureKind::Unauthorized => "The API key was rejected (401). Check your credentials.",
            FailureKind::Forbidden => "Access to the model was denied (403).",
            FailureKind::NotFound => "The model or endpoint was not found (404). Check the model name and API address.",
            FailureKind::RateLimited => "Rate limit reached (429). Wait a moment before retrying.",
            FailureKind::Server => "The model service reported a server error (5xx).",
            FailureKind::Api => "The model service returned an unexpected response.",
            FailureKind::Other => "The model request failed.",
        }
    }
}

impl DroidClawError {
    /// Maps transport and API failures to a [`FailureKind`].
    pub fn classify(&self) -> FailureKind {
        match self {
            DroidClawError::Api { status, .. } => FailureKind::from_status(*status),
            DroidClawError::Http(e) => classify_transport(e),
            DroidClawError::SseParsing(_) | DroidClawError::Json(_) => FailureKind::Api,
            _ => FailureKind::Other,
        }
    }
}

fn classify_transport(err: &reqwest::Error) -> FailureKind {
    if err.is_timeout() {
        return FailureKind::Timeout;
    }
    if let Some(status) = err.status() {
        return FailureKind::from_status(status.as_u16());
    }

    // reqwest folds DNS and TLS failures into connect errors; the source chain tells them apart.
    let mut chain = String::new();
    let mut source: Option<&dyn std::error::Error> = Some(err);
    while let Some(e) = source {
        chain.push_str(&e.to_string().to_lowercase());
        chain.push(' ');
        source = e.source();
    }

    if chain.contains("certificate") || chain.contains("tls") || chain.contains("ssl") || chain.contains("handshake") {
        FailureKind::Tls
    } else if chain.contains("dns")
        || chain.contains("resolve")
        || chain.contains("lookup")
        || chain.contains("no such host")
    {
        FailureKind::HostUnreachable
    } else if err.is_connect() || err.is_request() || err.is_body() {
        FailureKind::Network
    } else {
        FailureKind::Other
    }
}
