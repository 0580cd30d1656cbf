use std::fmt;

use serde_json::{Map, Value};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Structured failure reported by the server in an `error` envelope.
///
/// `context` holds every field of the envelope except `code` and `info`,
/// plus any top-level siblings of `error` in the response document.
/// `parameters` is the outgoing parameter set exactly as it was sent.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiError {
    pub code: String,
    pub info: String,
    pub context: Map<String, Value>,
    pub parameters: Vec<(String, String)>,
}

impl ApiError {
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.info)?;
        if self.parameters.is_empty() {
            return Ok(());
        }
        let rendered = self
            .parameters
            .iter()
            .map(|(key, value)| {
                if is_secret_key(key) {
                    format!("{key}=<hidden>")
                } else {
                    format!("{key}={value}")
                }
            })
            .collect::<Vec<_>>()
            .join("; ");
        write!(f, " (parameters: {rendered})")
    }
}

fn is_secret_key(key: &str) -> bool {
    key.ends_with("token") || key.ends_with("password")
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("MediaWiki API error {0}")]
    Api(Box<ApiError>),
    #[error("MediaWiki API exception {0}")]
    InternalApi(Box<ApiError>),
    #[error("maximum retries attempted without success ({retries} retries)")]
    Timeout { retries: u32 },
    #[error("MediaWiki API request failed with HTTP {status} ({url})")]
    Http { status: u16, url: String },
    #[error("failed to call MediaWiki API at {url}: {message}")]
    Transport { url: String, message: String },
    #[error("failed to decode MediaWiki API response: {0}")]
    Decode(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("invalid request: {0}")]
    Misuse(String),
    #[error("response cache failure: {0}")]
    Cache(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Server-reported error code, when the failure came from an error envelope.
    pub fn api_code(&self) -> Option<&str> {
        match self {
            Self::Api(error) | Self::InternalApi(error) => Some(&error.code),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
