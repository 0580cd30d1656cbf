use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use reqwest::Url;
use serde_json::Value;

use crate::config::EngineConfig;
use crate::cursor::QueryCursor;
use crate::error::{Error, Result};
use crate::params::{ParameterSet, SiteEncoding};
use crate::request::Request;
use crate::throttle::{IntervalThrottle, Throttle};
use crate::transport::{HttpCall, HttpReply, HttpTransport, Transport, TransportFailure};

/// Actions that change server state. They are posted and carry a write assertion.
pub const WRITE_ACTIONS: &[&str] = &[
    "block",
    "changecontentmodel",
    "clearhasmsg",
    "createaccount",
    "delete",
    "edit",
    "emailuser",
    "filerevert",
    "import",
    "managetags",
    "mergehistory",
    "move",
    "options",
    "patrol",
    "protect",
    "purge",
    "resetpassword",
    "revisiondelete",
    "rollback",
    "setnotificationtimestamp",
    "setpagelanguage",
    "tag",
    "thank",
    "unblock",
    "undelete",
    "upload",
    "userrights",
    "watch",
];

/// Modules known to require POST even without server metadata.
const POST_ONLY_ACTIONS: &[&str] = &["login", "logout", "clientlogin"];

const PARAMINFO_BATCH: usize = 50;

pub fn is_write_action(action: &str) -> bool {
    WRITE_ACTIONS.contains(&action)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SiteIdentity {
    pub family: String,
    pub code: String,
}

impl SiteIdentity {
    pub fn new(family: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            code: code.into(),
        }
    }
}

impl fmt::Display for SiteIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.code.is_empty() {
            write!(f, "{}", self.family)
        } else {
            write!(f, "{}:{}", self.family, self.code)
        }
    }
}

/// Privilege level a response was produced under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthClass {
    /// No credentials configured.
    Anonymous,
    /// Credentials configured but no active session.
    NotLoggedIn,
    User(String),
}

impl AuthClass {
    pub fn cache_key(&self) -> String {
        match self {
            Self::Anonymous => "anonymous".to_string(),
            Self::NotLoggedIn => "not-logged-in".to_string(),
            Self::User(name) => format!("user:{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginState {
    NotAttempted,
    InProgress,
    NotLoggedIn,
    LoggedIn(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitInfo {
    pub max: u64,
    pub highmax: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NamespaceSupport {
    #[default]
    Unsupported,
    Single,
    Multi,
}

/// Server-declared metadata of one API module (`query+allpages`, `edit`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub path: String,
    pub prefix: String,
    pub limit: Option<LimitInfo>,
    pub namespace: NamespaceSupport,
    pub must_be_posted: bool,
}

impl ModuleInfo {
    pub fn new(path: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            prefix: prefix.into(),
            limit: None,
            namespace: NamespaceSupport::Unsupported,
            must_be_posted: false,
        }
    }

    pub fn with_limit(mut self, max: u64, highmax: u64) -> Self {
        self.limit = Some(LimitInfo { max, highmax });
        self
    }

    pub fn with_namespace(mut self, support: NamespaceSupport) -> Self {
        self.namespace = support;
        self
    }

    pub fn posted(mut self) -> Self {
        self.must_be_posted = true;
        self
    }

    fn from_paraminfo(module: &Value) -> Option<Self> {
        let path = module.get("path").and_then(Value::as_str)?;
        let prefix = module.get("prefix").and_then(Value::as_str).unwrap_or("");
        let mut info = Self::new(path, prefix);
        info.must_be_posted = is_truthy(module.get("mustbeposted"));
        let parameters = module
            .get("parameters")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for parameter in parameters {
            match parameter.get("name").and_then(Value::as_str) {
                Some("limit") => {
                    let max = parameter.get("max").and_then(Value::as_u64);
                    let highmax = parameter.get("highmax").and_then(Value::as_u64);
                    if let Some(max) = max {
                        info.limit = Some(LimitInfo {
                            max,
                            highmax: highmax.unwrap_or(max),
                        });
                    }
                }
                Some("namespace") => {
                    info.namespace = if is_truthy(parameter.get("multi")) {
                        NamespaceSupport::Multi
                    } else {
                        NamespaceSupport::Single
                    };
                }
                _ => {}
            }
        }
        Some(info)
    }
}

/// Format version 1 marks booleans with an empty string, version 2 with `true`.
fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(_)) => true,
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub hits: u32,
    pub seconds: u32,
}

impl RateLimit {
    /// Even spacing that keeps within `hits` per `seconds`.
    pub fn delay(&self) -> Duration {
        if self.hits == 0 {
            return Duration::from_secs(u64::from(self.seconds));
        }
        Duration::from_secs_f64(f64::from(self.seconds) / f64::from(self.hits))
    }
}

/// Connection state shared by every request against one wiki.
pub struct Site {
    config: EngineConfig,
    api_url: String,
    identity: SiteIdentity,
    encoding: SiteEncoding,
    transport: Box<dyn Transport>,
    throttle: Box<dyn Throttle>,
    login: LoginState,
    tokens: BTreeMap<String, String>,
    modules: BTreeMap<String, ModuleInfo>,
    unknown_modules: BTreeSet<String>,
    request_count: usize,
}

impl Site {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let transport = HttpTransport::new(&config.user_agent(), config.timeout())?;
        let throttle = IntervalThrottle::new(
            Duration::from_millis(config.throttle.read_interval_ms),
            Duration::from_millis(config.throttle.write_interval_ms),
        );
        Self::with_parts(config, Box::new(transport), Box::new(throttle))
    }

    pub fn with_parts(
        config: EngineConfig,
        transport: Box<dyn Transport>,
        throttle: Box<dyn Throttle>,
    ) -> Result<Self> {
        let api_url = config
            .api_url()
            .ok_or_else(|| Error::Config("WIKI_API_URL is not set".to_string()))?
            .to_string();
        let parsed = Url::parse(&api_url)
            .map_err(|error| Error::Config(format!("invalid WIKI_API_URL {api_url}: {error}")))?;
        let host = parsed.host_str().unwrap_or("localhost").to_string();
        let identity = SiteIdentity::new(
            config.site.family.clone().unwrap_or(host),
            config.site.code.clone().unwrap_or_default(),
        );
        let encoding = config.encoding();
        Ok(Self {
            config,
            api_url,
            identity,
            encoding,
            transport,
            throttle,
            login: LoginState::NotAttempted,
            tokens: BTreeMap::new(),
            modules: BTreeMap::new(),
            unknown_modules: BTreeSet::new(),
            request_count: 0,
        })
    }

    pub fn identity(&self) -> &SiteIdentity {
        &self.identity
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    pub fn api_host(&self) -> Option<String> {
        Url::parse(&self.api_url)
            .ok()
            .and_then(|url| url.host_str().map(ToString::to_string))
    }

    pub fn is_https(&self) -> bool {
        self.api_url.starts_with("https://")
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn encoding(&self) -> SiteEncoding {
        self.encoding
    }

    pub fn bearer_token(&self) -> Option<&str> {
        self.config
            .site
            .bearer_token
            .as_deref()
            .filter(|token| !token.trim().is_empty())
    }

    pub fn username(&self) -> Option<&str> {
        self.config
            .site
            .username
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }

    pub fn login_state(&self) -> &LoginState {
        &self.login
    }

    pub fn login_in_progress(&self) -> bool {
        self.login == LoginState::InProgress
    }

    /// Identity the server should report for this session, if any.
    pub fn logged_in_user(&self) -> Option<&str> {
        match &self.login {
            LoginState::LoggedIn(name) => Some(name),
            _ if self.bearer_token().is_some() => self.username(),
            _ => None,
        }
    }

    pub fn auth_class(&self) -> AuthClass {
        if let Some(name) = self.logged_in_user() {
            return AuthClass::User(name.to_string());
        }
        if self.username().is_some() || self.bearer_token().is_some() {
            AuthClass::NotLoggedIn
        } else {
            AuthClass::Anonymous
        }
    }

    pub fn request_count(&self) -> usize {
        self.request_count
    }

    /// Submit one parameter set and return the decoded document.
    pub fn submit(&mut self, params: ParameterSet) -> Result<Value> {
        Request::new(self, params)?.submit()
    }

    /// Iterate the result items of a query, stopping after `cap` items when set.
    pub fn iterate(&mut self, params: ParameterSet, cap: Option<usize>) -> Result<QueryCursor<'_>> {
        let mut cursor = QueryCursor::new(self, params)?;
        cursor.set_maximum_items(cap);
        Ok(cursor)
    }

    pub fn login(&mut self) -> Result<()> {
        let (username, password) = self
            .config
            .credentials()
            .map(|(username, password)| (username.to_string(), password.to_string()))
            .ok_or_else(|| Error::Auth("WIKI_BOT_USER/WIKI_BOT_PASS are not set".to_string()))?;

        self.login = LoginState::InProgress;
        match self.perform_login(&username, &password) {
            Ok(name) => {
                tracing::info!(site = %self.identity, user = %name, "logged in");
                self.tokens.clear();
                self.login = LoginState::LoggedIn(name);
                Ok(())
            }
            Err(error) => {
                self.login = LoginState::NotLoggedIn;
                Err(error)
            }
        }
    }

    fn perform_login(&mut self, username: &str, password: &str) -> Result<String> {
        self.load_tokens(&["login".to_string()])?;
        let login_token = self
            .tokens
            .get("login")
            .cloned()
            .ok_or_else(|| Error::Auth("failed to get MediaWiki login token".to_string()))?;

        let params = ParameterSet::from_pairs([
            ("action", "login"),
            ("lgname", username),
            ("lgpassword", password),
            ("lgtoken", login_token.as_str()),
        ]);
        let document = Request::new(self, params)?.submit()?;
        let login = document.get("login").cloned().unwrap_or(Value::Null);
        match login.get("result").and_then(Value::as_str) {
            Some("Success") => Ok(login
                .get("lgusername")
                .and_then(Value::as_str)
                .unwrap_or(username)
                .to_string()),
            other => Err(Error::Auth(format!(
                "MediaWiki login failed: {}",
                login
                    .get("reason")
                    .and_then(Value::as_str)
                    .or(other)
                    .unwrap_or("unknown error")
            ))),
        }
    }

    pub fn relogin(&mut self) -> Result<()> {
        tracing::warn!(site = %self.identity, "session lost; logging in again");
        self.tokens.clear();
        self.transport.clear_cookies();
        self.login = LoginState::NotAttempted;
        self.login()
    }

    pub fn token(&mut self, kind: &str) -> Result<String> {
        if let Some(token) = self.tokens.get(kind) {
            return Ok(token.clone());
        }
        self.load_tokens(&[kind.to_string()])?;
        self.tokens
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::Auth(format!("failed to get MediaWiki {kind} token")))
    }

    /// Fetch fresh values for the given token kinds (`csrf`, `login`, ...).
    pub fn load_tokens(&mut self, kinds: &[String]) -> Result<()> {
        let params = ParameterSet::from_pairs([
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
            ("type", kinds.join("|")),
        ]);
        let document = Request::new(self, params)?.submit()?;
        let tokens = document
            .get("query")
            .and_then(|query| query.get("tokens"))
            .ok_or_else(|| Error::Decode("token response has no query.tokens".to_string()))?;
        for kind in kinds {
            if let Some(value) = tokens.get(format!("{kind}token")).and_then(Value::as_str) {
                self.tokens.insert(kind.clone(), value.to_string());
            }
        }
        Ok(())
    }

    pub fn set_token(&mut self, kind: &str, value: &str) {
        self.tokens.insert(kind.to_string(), value.to_string());
    }

    pub fn invalidate_tokens(&mut self) {
        self.tokens.clear();
    }

    pub fn token_kind_for_value(&self, value: &str) -> Option<String> {
        self.tokens
            .iter()
            .find(|(_, token)| token.as_str() == value)
            .map(|(kind, _)| kind.clone())
    }

    pub fn invalidate_superior_cookies(&mut self) {
        if let Some(host) = self.api_host() {
            self.transport.clear_superior_cookies(&host);
        }
    }

    pub fn register_module(&mut self, info: ModuleInfo) {
        self.unknown_modules.remove(&info.path);
        self.modules.insert(info.path.clone(), info);
    }

    pub fn module_info(&mut self, path: &str) -> Result<Option<ModuleInfo>> {
        if !self.modules.contains_key(path) {
            self.load_module_info(&[path.to_string()])?;
        }
        Ok(self.modules.get(path).cloned())
    }

    /// Fetch metadata for modules not known yet. A no-op unless `auto_paraminfo` is set.
    pub fn load_module_info(&mut self, paths: &[String]) -> Result<()> {
        if !self.config.site.auto_paraminfo {
            return Ok(());
        }
        let missing = paths
            .iter()
            .filter(|path| {
                !self.modules.contains_key(path.as_str())
                    && !self.unknown_modules.contains(path.as_str())
            })
            .cloned()
            .collect::<Vec<_>>();
        for batch in missing.chunks(PARAMINFO_BATCH) {
            let params = ParameterSet::from_pairs([
                ("action", "paraminfo".to_string()),
                ("modules", batch.join("|")),
            ]);
            let document = Request::new(self, params)?.submit()?;
            let modules = document
                .get("paraminfo")
                .and_then(|info| info.get("modules"))
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            for module in modules {
                if let Some(info) = ModuleInfo::from_paraminfo(module) {
                    tracing::debug!(module = %info.path, prefix = %info.prefix, "loaded module info");
                    self.modules.insert(info.path.clone(), info);
                }
            }
            for path in batch {
                if !self.modules.contains_key(path) {
                    self.unknown_modules.insert(path.clone());
                }
            }
        }
        Ok(())
    }

    pub fn is_post_only(&mut self, path: &str) -> Result<bool> {
        if POST_ONLY_ACTIONS.contains(&path) || is_write_action(path) {
            return Ok(true);
        }
        Ok(self
            .module_info(path)?
            .is_some_and(|info| info.must_be_posted))
    }

    pub fn rate_limit(&self, action: &str) -> Option<RateLimit> {
        self.config
            .ratelimits
            .iter()
            .find(|entry| entry.action == action)
            .map(|entry| RateLimit {
                hits: entry.hits,
                seconds: entry.seconds,
            })
    }

    /// Issue one physical call; the throttle gate runs exactly once per call.
    pub(crate) fn dispatch(
        &mut self,
        call: &HttpCall,
        is_write: bool,
    ) -> std::result::Result<HttpReply, TransportFailure> {
        self.throttle.gate(is_write);
        self.request_count += 1;
        tracing::debug!(
            method = call.method.as_str(),
            url = %call.url,
            params = %call.query,
            "dispatching API call"
        );
        self.transport.execute(call)
    }

    pub(crate) fn pause(&mut self, delay: Duration) {
        self.throttle.pause(delay);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{AuthClass, LoginState, ModuleInfo, NamespaceSupport, RateLimit, SiteIdentity};
    use crate::config::{EngineConfig, RateLimitEntry};
    use crate::testing::{ScriptedTransport, site_with};

    #[test]
    fn identity_defaults_to_api_host() {
        let (site, _) = site_with(EngineConfig::for_api("https://wiki.example.org/w/api.php"));
        assert_eq!(site.identity(), &SiteIdentity::new("wiki.example.org", ""));
        assert_eq!(site.identity().to_string(), "wiki.example.org");
        assert_eq!(SiteIdentity::new("wikipedia", "en").to_string(), "wikipedia:en");
        assert!(site.is_https());
    }

    #[test]
    fn missing_api_url_is_a_config_error() {
        let result = super::Site::with_parts(
            EngineConfig::default(),
            Box::new(ScriptedTransport::default()),
            Box::new(crate::testing::RecordingThrottle::default()),
        );
        assert!(matches!(result, Err(crate::Error::Config(_))));
    }

    #[test]
    fn auth_class_distinguishes_privilege_levels() {
        let (site, _) = site_with(EngineConfig::for_api("https://wiki.example.org/api.php"));
        assert_eq!(site.auth_class(), AuthClass::Anonymous);

        let mut config = EngineConfig::for_api("https://wiki.example.org/api.php");
        config.site.username = Some("Bot".to_string());
        config.site.password = Some("pw".to_string());
        let (site, _) = site_with(config);
        assert_eq!(site.auth_class(), AuthClass::NotLoggedIn);
        assert_eq!(AuthClass::User("Bot".to_string()).cache_key(), "user:Bot");
    }

    #[test]
    fn login_fetches_token_and_records_user() {
        let mut config = EngineConfig::for_api("https://wiki.example.org/api.php");
        config.site.username = Some("Bot@task".to_string());
        config.site.password = Some("pw".to_string());
        let (mut site, handle) = site_with(config);
        handle.push_json(json!({"query": {"tokens": {"logintoken": "lt+\\"}}}));
        handle.push_json(json!({"login": {"result": "Success", "lgusername": "Bot"}}));

        site.login().expect("login");
        assert_eq!(site.login_state(), &LoginState::LoggedIn("Bot".to_string()));
        assert_eq!(site.auth_class(), AuthClass::User("Bot".to_string()));

        let calls = handle.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].param("type").as_deref(), Some("login"));
        assert_eq!(calls[1].method, crate::transport::Method::Post);
        assert_eq!(calls[1].param("lgtoken").as_deref(), Some("lt+\\"));
        assert_eq!(calls[1].param_keys().last().map(String::as_str), Some("lgtoken"));
    }

    #[test]
    fn failed_login_reports_reason() {
        let mut config = EngineConfig::for_api("https://wiki.example.org/api.php");
        config.site.username = Some("Bot".to_string());
        config.site.password = Some("wrong".to_string());
        let (mut site, handle) = site_with(config);
        handle.push_json(json!({"query": {"tokens": {"logintoken": "lt"}}}));
        handle.push_json(json!({"login": {"result": "Failed", "reason": "Incorrect password"}}));

        let error = site.login().expect_err("login must fail");
        assert!(error.to_string().contains("Incorrect password"));
        assert_eq!(site.login_state(), &LoginState::NotLoggedIn);
    }

    #[test]
    fn tokens_are_cached_and_reverse_resolvable() {
        let (mut site, handle) = site_with(EngineConfig::for_api("https://wiki.example.org/api.php"));
        handle.push_json(json!({"query": {"tokens": {"csrftoken": "abc+\\"}}}));
        assert_eq!(site.token("csrf").expect("token"), "abc+\\");
        assert_eq!(site.token("csrf").expect("cached token"), "abc+\\");
        assert_eq!(handle.calls().len(), 1);
        assert_eq!(site.token_kind_for_value("abc+\\").as_deref(), Some("csrf"));
        assert!(site.token_kind_for_value("other").is_none());
    }

    #[test]
    fn module_info_is_loaded_from_paraminfo() {
        let mut config = EngineConfig::for_api("https://wiki.example.org/api.php");
        config.site.auto_paraminfo = true;
        let (mut site, handle) = site_with(config);
        handle.push_json(json!({
            "paraminfo": {"modules": [{
                "name": "allpages",
                "path": "query+allpages",
                "prefix": "ap",
                "parameters": [
                    {"name": "namespace", "type": "namespace"},
                    {"name": "limit", "type": "limit", "max": 500, "highmax": 5000}
                ]
            }]}
        }));

        let info = site
            .module_info("query+allpages")
            .expect("module info")
            .expect("known module");
        assert_eq!(info.prefix, "ap");
        assert_eq!(info.limit.map(|limit| limit.highmax), Some(5000));
        assert_eq!(info.namespace, NamespaceSupport::Single);
        assert!(!info.must_be_posted);
        assert_eq!(handle.calls()[0].param("modules").as_deref(), Some("query+allpages"));

        site.module_info("query+allpages").expect("cached");
        assert_eq!(handle.calls().len(), 1);
    }

    #[test]
    fn post_only_modules_and_write_actions() {
        let mut config = EngineConfig::for_api("https://wiki.example.org/api.php");
        config.site.auto_paraminfo = false;
        let (mut site, _) = site_with(config);
        site.register_module(ModuleInfo::new("query+deletedrevs", "dr").posted());
        assert!(site.is_post_only("edit").expect("edit"));
        assert!(site.is_post_only("login").expect("login"));
        assert!(site.is_post_only("query+deletedrevs").expect("registered"));
        assert!(!site.is_post_only("query+allpages").expect("unknown module"));
    }

    #[test]
    fn rate_limit_entries_come_from_config() {
        let mut config = EngineConfig::for_api("https://wiki.example.org/api.php");
        config.ratelimits.push(RateLimitEntry {
            action: "edit".to_string(),
            hits: 8,
            seconds: 60,
        });
        let (site, _) = site_with(config);
        assert_eq!(site.rate_limit("edit"), Some(RateLimit { hits: 8, seconds: 60 }));
        assert_eq!(
            RateLimit { hits: 8, seconds: 60 }.delay(),
            std::time::Duration::from_secs_f64(7.5)
        );
        assert!(site.rate_limit("move").is_none());
    }
}
