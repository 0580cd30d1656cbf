use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use reqwest::blocking::{Client, multipart};
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use url::form_urlencoded;

use crate::cookies::CookieJar;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

/// File or raw part attached to a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimePart {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

/// One physical HTTP call against the API endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpCall {
    pub method: Method,
    pub url: String,
    /// Form-encoded parameters in wire order.
    pub query: String,
    /// The same parameters as raw pairs, used to build multipart bodies.
    pub fields: Vec<(String, Vec<u8>)>,
    pub parts: Vec<MimePart>,
    pub bearer_token: Option<String>,
}

impl HttpCall {
    pub fn is_multipart(&self) -> bool {
        !self.parts.is_empty()
    }

    /// Decoded value of a parameter as sent.
    pub fn param(&self, key: &str) -> Option<String> {
        form_urlencoded::parse(self.query.as_bytes())
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.into_owned())
    }

    pub fn param_keys(&self) -> Vec<String> {
        form_urlencoded::parse(self.query.as_bytes())
            .map(|(name, _)| name.into_owned())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
    pub retry_after: Option<u64>,
}

impl HttpReply {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            retry_after: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: String::new(),
            retry_after: None,
        }
    }
}

/// Failure below the HTTP layer (no status code was received).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFailure {
    pub message: String,
    pub retryable: bool,
}

impl TransportFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

pub trait Transport {
    fn execute(&mut self, call: &HttpCall) -> std::result::Result<HttpReply, TransportFailure>;

    /// Forget cookies set for parent domains of `host`.
    fn clear_superior_cookies(&mut self, host: &str);

    fn clear_cookies(&mut self);
}

pub struct HttpTransport {
    client: Client,
    cookies: Arc<CookieJar>,
    user_agent: String,
}

impl HttpTransport {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        let cookies = Arc::new(CookieJar::new());
        let client = Client::builder()
            .timeout(timeout)
            .cookie_provider(Arc::clone(&cookies))
            .build()
            .map_err(|error| {
                Error::Config(format!("failed to build MediaWiki HTTP client: {error}"))
            })?;
        Ok(Self {
            client,
            cookies,
            user_agent: user_agent.to_string(),
        })
    }

    pub fn cookies(&self) -> &CookieJar {
        &self.cookies
    }

    fn build_multipart(call: &HttpCall) -> std::result::Result<multipart::Form, TransportFailure> {
        let mut form = multipart::Form::new();
        for (key, value) in &call.fields {
            form = form.part(key.clone(), multipart::Part::bytes(value.clone()));
        }
        for part in &call.parts {
            let mut body = multipart::Part::bytes(part.data.clone());
            if let Some(filename) = &part.filename {
                body = body.file_name(filename.clone());
            }
            if let Some(content_type) = &part.content_type {
                body = body.mime_str(content_type).map_err(|error| {
                    TransportFailure::fatal(format!("invalid mime type {content_type}: {error}"))
                })?;
            }
            form = form.part(part.name.clone(), body);
        }
        Ok(form)
    }
}

impl Transport for HttpTransport {
    fn execute(&mut self, call: &HttpCall) -> std::result::Result<HttpReply, TransportFailure> {
        let mut url = Url::parse(&call.url)
            .map_err(|error| TransportFailure::fatal(format!("invalid API URL {}: {error}", call.url)))?;
        let mut builder = match call.method {
            Method::Get => {
                url.set_query(Some(&call.query));
                self.client.get(url)
            }
            Method::Post if call.is_multipart() => {
                self.client.post(url).multipart(Self::build_multipart(call)?)
            }
            Method::Post => self
                .client
                .post(url)
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(call.query.clone()),
        };
        builder = builder.header("User-Agent", self.user_agent.clone());
        if let Some(token) = &call.bearer_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().map_err(|error| TransportFailure {
            message: error.to_string(),
            retryable: is_retryable_error(&error),
        })?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());
        let body = response.text().map_err(|error| TransportFailure {
            message: format!("failed to read response body: {error}"),
            retryable: true,
        })?;
        Ok(HttpReply {
            status,
            body,
            retry_after,
        })
    }

    fn clear_superior_cookies(&mut self, host: &str) {
        let removed = self.cookies.clear_superior(host);
        tracing::debug!(host, removed, "invalidated parent-domain cookies");
    }

    fn clear_cookies(&mut self) {
        self.cookies.clear();
    }
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request() || error.is_body()
}
