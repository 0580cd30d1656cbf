use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::params::SiteEncoding;

pub const DEFAULT_USER_AGENT: &str = "wikiquery/0.2";
pub const DEFAULT_STATE_DIR: &str = ".wikiquery";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub site: SiteSection,
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub throttle: ThrottleSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub ratelimits: Vec<RateLimitEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct SiteSection {
    pub api_url: Option<String>,
    pub family: Option<String>,
    pub code: Option<String>,
    pub user_agent: Option<String>,
    pub encoding: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub bearer_token: Option<String>,
    /// Assert `bot` rather than `user` on write actions.
    pub bot: bool,
    /// Use `highmax` batch ceilings (accounts with `apihighlimits`).
    pub high_limits: bool,
    /// Fetch module metadata from `action=paraminfo` on first use.
    pub auto_paraminfo: bool,
}

impl Default for SiteSection {
    fn default() -> Self {
        Self {
            api_url: None,
            family: None,
            code: None,
            user_agent: None,
            encoding: None,
            username: None,
            password: None,
            bearer_token: None,
            bot: false,
            high_limits: false,
            auto_paraminfo: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct HttpSection {
    pub timeout_ms: u64,
    pub max_get_length: usize,
    pub allow_get_without_https: bool,
    /// Sent as `maxlag`; zero disables the parameter.
    pub maxlag: u32,
    /// Sent as `formatversion`; zero leaves the server default.
    pub formatversion: u32,
    /// Add `meta=userinfo` to queries while logged in to detect lost sessions.
    pub check_userinfo: bool,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_get_length: 255,
            allow_get_without_https: false,
            maxlag: 5,
            formatversion: 2,
            check_userinfo: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub retry_wait_ms: u64,
    pub retry_max_ms: u64,
    /// Halve `*limit` parameters when a response body is not JSON. A guess
    /// at "response too large", not something the server promises.
    pub halve_limits_on_decode_failure: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 15,
            retry_wait_ms: 5_000,
            retry_max_ms: 120_000,
            halve_limits_on_decode_failure: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ThrottleSection {
    pub read_interval_ms: u64,
    pub write_interval_ms: u64,
}

impl Default for ThrottleSection {
    fn default() -> Self {
        Self {
            read_interval_ms: 300,
            write_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheSection {
    pub dir: Option<PathBuf>,
    pub expiry_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            dir: None,
            expiry_secs: 86_400,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RateLimitEntry {
    pub action: String,
    pub hits: u32,
    pub seconds: u32,
}

impl EngineConfig {
    pub fn for_api(api_url: &str) -> Self {
        let mut config = Self::default();
        config.site.api_url = Some(api_url.to_string());
        config
    }

    /// Apply `WIKI_*` environment variables on top of file values.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| env::var(key).ok())
    }

    pub fn with_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        if let Some(api_url) = value("WIKI_API_URL") {
            self.site.api_url = Some(api_url);
        }
        if let Some(user_agent) = value("WIKI_USER_AGENT") {
            self.site.user_agent = Some(user_agent);
        }
        if let Some(username) = value("WIKI_BOT_USER") {
            self.site.username = Some(username);
        }
        if let Some(password) = value("WIKI_BOT_PASS") {
            self.site.password = Some(password);
        }
        if let Some(token) = value("WIKI_BEARER_TOKEN") {
            self.site.bearer_token = Some(token);
        }
        if let Some(timeout) = value("WIKI_HTTP_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.http.timeout_ms = timeout;
        }
        if let Some(retries) = value("WIKI_HTTP_RETRIES").and_then(|v| v.parse().ok()) {
            self.retry.max_retries = retries;
        }
        if let Some(delay) = value("WIKI_HTTP_RETRY_DELAY_MS").and_then(|v| v.parse().ok()) {
            self.retry.retry_wait_ms = delay;
        }
        if let Some(dir) = value("WIKI_CACHE_DIR") {
            self.cache.dir = Some(PathBuf::from(dir));
        }
        self
    }

    pub fn api_url(&self) -> Option<&str> {
        self.site
            .api_url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn user_agent(&self) -> String {
        self.site
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn encoding(&self) -> SiteEncoding {
        let Some(name) = self.site.encoding.as_deref() else {
            return SiteEncoding::default();
        };
        SiteEncoding::parse(name).unwrap_or_else(|| {
            tracing::warn!(encoding = name, "unsupported site encoding; using utf-8");
            SiteEncoding::default()
        })
    }

    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.site.username.as_deref(), self.site.password.as_deref()) {
            (Some(username), Some(password)) if !username.trim().is_empty() => {
                Some((username.trim(), password))
            }
            _ => None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.http.timeout_ms)
    }

    pub fn retry_wait(&self) -> Duration {
        Duration::from_millis(self.retry.retry_wait_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry.retry_max_ms)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache
            .dir
            .clone()
            .unwrap_or_else(|| Path::new(DEFAULT_STATE_DIR).join("cache"))
    }

    pub fn cache_expiry(&self) -> Duration {
        Duration::from_secs(self.cache.expiry_secs)
    }
}

/// Load and parse an EngineConfig from a TOML file. Returns defaults if the file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<EngineConfig> {
    if !config_path.exists() {
        return Ok(EngineConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: EngineConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}
