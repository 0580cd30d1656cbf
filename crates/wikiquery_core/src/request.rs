use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde_json::{Map, Value};

use crate::classify::{
    Action, Fatal, RetryKind, Rewrite, SearchScope, Situation, WarningAction, classify_error,
    classify_status, classify_warning, userinfo_mismatch,
};
use crate::error::{ApiError, Error, Result};
use crate::params::{EncodedParams, ParamValue, ParameterSet, token_rank};
use crate::site::{Site, is_write_action};
use crate::transport::{HttpCall, Method, MimePart};

const BODY_EXCERPT_CHARS: usize = 500;

static HTML_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("html tag pattern"));
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportHint {
    #[default]
    Auto,
    Get,
    Post,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Building,
    Submitted,
    Retrying,
    Success,
    Fatal,
}

/// Answer of a registered warning handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningVerdict {
    /// Fall through to the built-in handling.
    Unhandled,
    Handled,
    /// Resend the request without waiting.
    Retry,
}

pub type WarningHandler<'h> = Box<dyn FnMut(&str, &str) -> WarningVerdict + 'h>;

/// One logical API call with its retry and authentication state.
///
/// The request is mutated in place across retries: refreshed tokens,
/// halved limits and rewritten search parameters all stay in `params`.
/// Retry counters are kept per instance, so a cursor that reuses one
/// request shares a single retry budget across all its pages.
pub struct Request<'s> {
    site: &'s mut Site,
    params: ParameterSet,
    action: String,
    is_write: bool,
    hint: TransportHint,
    parts: Vec<MimePart>,
    state: RequestState,
    defaulted: bool,
    force_post: bool,
    retries: u32,
    max_retries: u32,
    retry_wait: Duration,
    retry_max: Duration,
    last_delay: Duration,
    relogin_attempted: bool,
    nonce_retried: bool,
    decode_failure_logged: bool,
    expected_user: Option<String>,
    warning_handler: Option<WarningHandler<'s>>,
}

impl<'s> Request<'s> {
    pub fn new(site: &'s mut Site, params: ParameterSet) -> Result<Self> {
        let action = params
            .first("action")
            .map(str::trim)
            .filter(|action| !action.is_empty())
            .map(ToString::to_string)
            .ok_or_else(|| Error::Misuse("parameter 'action' is required".to_string()))?;
        let retry = site.config().retry.clone();
        Ok(Self {
            is_write: is_write_action(&action),
            action,
            params,
            hint: TransportHint::Auto,
            parts: Vec::new(),
            state: RequestState::Building,
            defaulted: false,
            force_post: false,
            retries: 0,
            max_retries: retry.max_retries,
            retry_wait: Duration::from_millis(retry.retry_wait_ms),
            retry_max: Duration::from_millis(retry.retry_max_ms),
            last_delay: Duration::ZERO,
            relogin_attempted: false,
            nonce_retried: false,
            decode_failure_logged: false,
            expected_user: None,
            warning_handler: None,
            site,
        })
    }

    pub fn with_transport(mut self, hint: TransportHint) -> Self {
        self.hint = hint;
        self
    }

    pub fn add_mime_part(&mut self, part: MimePart) {
        self.parts.push(part);
    }

    pub fn set_max_retries(&mut self, max_retries: u32) {
        self.max_retries = max_retries;
    }

    pub fn set_warning_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&str, &str) -> WarningVerdict + 's,
    {
        self.warning_handler = Some(Box::new(handler));
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn is_write(&self) -> bool {
        self.is_write
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn last_delay(&self) -> Duration {
        self.last_delay
    }

    pub fn params(&self) -> &ParameterSet {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut ParameterSet {
        &mut self.params
    }

    pub fn site(&self) -> &Site {
        &*self.site
    }

    pub fn site_mut(&mut self) -> &mut Site {
        &mut *self.site
    }

    /// Parameters exactly as they would be sent now.
    pub fn encoded(&self) -> EncodedParams {
        self.params.encode(self.site.encoding())
    }

    /// Apply default parameters. Only the first call has an effect.
    pub fn prepare(&mut self) {
        if self.defaulted {
            return;
        }
        self.defaulted = true;
        let http = self.site.config().http.clone();

        self.params.set("format", "json");
        if http.formatversion > 0 {
            self.params.set_default("formatversion", http.formatversion);
        }
        if http.maxlag > 0 {
            self.params.set_default("maxlag", http.maxlag);
        }
        if self.is_write && self.site.username().is_some() {
            let assertion = if self.site.config().site.bot { "bot" } else { "user" };
            self.params.set_default("assert", assertion);
        }
        if self.action == "query"
            && http.check_userinfo
            && !self.site.login_in_progress()
            && let Some(user) = self.site.logged_in_user()
        {
            self.expected_user = Some(user.to_string());
            self.params.add_values("meta", &["userinfo"]);
        }
    }

    pub fn submit(&mut self) -> Result<Value> {
        self.prepare();
        let result = self.run();
        self.state = match result {
            Ok(_) => RequestState::Success,
            Err(_) => RequestState::Fatal,
        };
        result
    }

    fn run(&mut self) -> Result<Value> {
        loop {
            self.state = RequestState::Submitted;
            let encoded = self.encoded();
            let method = self.choose_method(&encoded)?;
            let call = self.build_call(method, &encoded);

            let reply = match self.site.dispatch(&call, self.is_write) {
                Ok(reply) => reply,
                Err(failure) if failure.retryable => {
                    tracing::warn!(error = %failure.message, "API call failed; retrying");
                    self.wait(None)?;
                    continue;
                }
                Err(failure) => {
                    return Err(Error::Transport {
                        url: call.url,
                        message: failure.message,
                    });
                }
            };

            if let Some(action) = classify_status(reply.status, &self.situation(method)) {
                match action {
                    Action::Retry(_) => {
                        tracing::warn!(status = reply.status, "HTTP status is retryable");
                        self.wait(reply.retry_after.map(Duration::from_secs))?;
                    }
                    Action::Rewrite(Rewrite::ForcePost) => {
                        tracing::debug!(status = reply.status, "request URI too long; switching to POST");
                        self.force_post = true;
                        self.count_retry()?;
                    }
                    _ => {
                        return Err(Error::Http {
                            status: reply.status,
                            url: call.url,
                        });
                    }
                }
                continue;
            }

            let document = match serde_json::from_str::<Value>(&reply.body) {
                Ok(document) => document,
                Err(error) => {
                    self.recover_from_decode_failure(&reply.body, &error)?;
                    continue;
                }
            };
            if !document.is_object() {
                return Err(Error::Decode(format!(
                    "expected a JSON object, got {}",
                    excerpt(&reply.body)
                )));
            }

            if document.get("error").is_some() {
                let error = api_error(&document, &encoded);
                self.recover_from_error(error, method)?;
                continue;
            }

            if let Some(warnings) = document.get("warnings")
                && self.handle_warnings(warnings)?
            {
                continue;
            }

            if let Some(expected) = self.expected_user.clone()
                && userinfo_mismatch(&document, &expected)
            {
                self.reauthenticate(&format!("server no longer reports user {expected}"))?;
                continue;
            }

            return Ok(document);
        }
    }

    fn situation(&self, method: Method) -> Situation {
        Situation {
            action: self.action.clone(),
            login_in_progress: self.site.login_in_progress(),
            relogin_attempted: self.relogin_attempted,
            nonce_retried: self.nonce_retried,
            uses_post: method == Method::Post,
        }
    }

    fn choose_method(&mut self, encoded: &EncodedParams) -> Result<Method> {
        if !self.parts.is_empty() {
            if self.hint == TransportHint::Get {
                return Err(Error::Misuse(
                    "multipart parts cannot be sent with GET".to_string(),
                ));
            }
            return Ok(Method::Post);
        }
        if self.force_post {
            return Ok(Method::Post);
        }
        match self.hint {
            TransportHint::Get => return Ok(Method::Get),
            TransportHint::Post => return Ok(Method::Post),
            TransportHint::Auto => {}
        }
        let allow_plain_get = self.site.config().http.allow_get_without_https;
        let max_get_length = self.site.config().http.max_get_length;
        let use_post = (!self.site.is_https() && !allow_plain_get)
            || self.site.bearer_token().is_some()
            || encoded.to_query_string().len() > max_get_length
            || self.requires_post();
        Ok(if use_post { Method::Post } else { Method::Get })
    }

    fn requires_post(&mut self) -> bool {
        let modules = match self.action.as_str() {
            "paraminfo" => return false,
            "query" => ["list", "prop", "generator"]
                .iter()
                .flat_map(|key| self.params.values(key))
                .map(|module| format!("query+{module}"))
                .collect::<Vec<_>>(),
            action => vec![action.to_string()],
        };
        modules
            .iter()
            .any(|path| match self.site.is_post_only(path) {
                Ok(post_only) => post_only,
                Err(error) => {
                    tracing::warn!(module = %path, %error, "module metadata unavailable; assuming GET is allowed");
                    false
                }
            })
    }

    fn build_call(&self, method: Method, encoded: &EncodedParams) -> HttpCall {
        HttpCall {
            method,
            url: self.site.api_url().to_string(),
            query: encoded.to_query_string(),
            fields: encoded
                .wire_pairs()
                .into_iter()
                .map(|(key, value)| (key.to_string(), value.to_vec()))
                .collect(),
            parts: self.parts.clone(),
            bearer_token: self.site.bearer_token().map(ToString::to_string),
        }
    }

    /// Count one retry and sleep with exponential backoff.
    ///
    /// `base` replaces the configured base delay (reported lag, rate limit).
    /// The delay never shrinks between consecutive retries of this request.
    pub fn wait(&mut self, base: Option<Duration>) -> Result<()> {
        self.count_retry()?;
        let base = base.unwrap_or(self.retry_wait);
        let exponent = self.retries.saturating_sub(1).min(31);
        let delay = base
            .saturating_mul(1u32 << exponent)
            .min(self.retry_max)
            .max(self.last_delay);
        self.last_delay = delay;
        tracing::warn!(
            action = %self.action,
            attempt = self.retries,
            max_retries = self.max_retries,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "waiting before retry"
        );
        self.site.pause(delay);
        Ok(())
    }

    /// Count a retry that resends without sleeping.
    pub fn count_retry(&mut self) -> Result<()> {
        self.state = RequestState::Retrying;
        self.retries += 1;
        if self.retries > self.max_retries {
            return Err(Error::Timeout {
                retries: self.max_retries,
            });
        }
        Ok(())
    }

    fn recover_from_error(&mut self, error: ApiError, method: Method) -> Result<()> {
        let action = classify_error(&error.code, &error.info, &self.situation(method));
        match action {
            Action::Retry(RetryKind::Backoff) => {
                tracing::warn!(code = %error.code, info = %error.info, "API is busy");
                self.wait(None)
            }
            Action::Retry(RetryKind::Lagged { lag_seconds }) => {
                tracing::warn!(info = %error.info, "server is lagged");
                self.wait(lag_seconds.map(Duration::from_secs_f64))
            }
            Action::Retry(RetryKind::RateLimited) => {
                let base = self.site.rate_limit(&self.action).map(|limit| limit.delay());
                tracing::warn!(action = %self.action, "rate limited");
                self.wait(base)
            }
            Action::Retry(RetryKind::ServerFault { class }) => {
                tracing::error!(class = %class, info = %error.info, "internal API error");
                self.wait(None)
            }
            Action::Retry(RetryKind::Immediate) => {
                self.nonce_retried = true;
                self.count_retry()
            }
            Action::Reauthenticate => {
                if self.site.username().is_none() {
                    return Err(Error::Api(Box::new(error)));
                }
                self.reauthenticate(&error.code)
            }
            Action::RefreshToken => self.refresh_tokens(error),
            Action::ReduceBatch { parameter } => {
                if !halve_limit(&mut self.params, &parameter) {
                    return Err(Error::Api(Box::new(error)));
                }
                self.count_retry()
            }
            Action::Rewrite(Rewrite::SearchScope(scope)) => self.rewrite_search(scope, error),
            Action::Rewrite(Rewrite::ForcePost) => {
                self.force_post = true;
                self.count_retry()
            }
            Action::Fatal(Fatal::InternalApi { class }) => {
                tracing::error!(class = %class, info = %error.info, "internal API error");
                Err(Error::InternalApi(Box::new(error)))
            }
            Action::Fatal(_) => Err(Error::Api(Box::new(error))),
        }
    }

    fn reauthenticate(&mut self, reason: &str) -> Result<()> {
        if self.relogin_attempted {
            return Err(Error::Auth(format!("session lost again after relogin: {reason}")));
        }
        self.relogin_attempted = true;
        self.count_retry()?;
        self.site.relogin()?;
        self.expected_user = self.site.logged_in_user().map(ToString::to_string);
        Ok(())
    }

    /// Replace every parameter value that matches a cached token with a fresh one.
    fn refresh_tokens(&mut self, error: ApiError) -> Result<()> {
        let stale = self
            .params
            .keys()
            .filter(|key| token_rank(key) > 0)
            .filter_map(|key| {
                let value = self.params.first(key)?;
                let kind = self.site.token_kind_for_value(value)?;
                Some((key.to_string(), kind))
            })
            .collect::<Vec<_>>();
        if stale.is_empty() {
            return Err(Error::Api(Box::new(error)));
        }
        self.count_retry()?;

        let mut kinds = stale.iter().map(|(_, kind)| kind.clone()).collect::<Vec<_>>();
        kinds.sort();
        kinds.dedup();
        tracing::warn!(tokens = %kinds.join("|"), "token expired; refreshing");
        self.site.invalidate_superior_cookies();
        self.site.load_tokens(&kinds)?;

        for (key, kind) in stale {
            let value = self.site.token(&kind)?;
            self.params.set(key, ParamValue::List(vec![value]));
        }
        Ok(())
    }

    fn rewrite_search(&mut self, scope: SearchScope, error: ApiError) -> Result<()> {
        let prefix = if self.params.contains_key("gsrsearch") { "gsr" } else { "sr" };
        if self.params.remove(&format!("{prefix}what")).is_none() {
            return Err(Error::Api(Box::new(error)));
        }
        if scope == SearchScope::Title {
            let key = format!("{prefix}search");
            let rewritten = self
                .params
                .values(&key)
                .iter()
                .map(|search| format!("intitle:{search}"))
                .collect::<Vec<_>>();
            self.params.set(key, ParamValue::List(rewritten));
        }
        tracing::debug!(code = %error.code, "search scope disabled; rewriting query");
        self.count_retry()
    }

    fn recover_from_decode_failure(&mut self, body: &str, error: &serde_json::Error) -> Result<()> {
        if !self.decode_failure_logged {
            self.decode_failure_logged = true;
            tracing::warn!(%error, body = %excerpt(body), "non-JSON response from API");
        }
        if self.site.config().retry.halve_limits_on_decode_failure {
            let limits = self
                .params
                .keys()
                .filter(|key| key.ends_with("limit"))
                .map(ToString::to_string)
                .collect::<Vec<_>>();
            for key in limits {
                halve_limit(&mut self.params, &key);
            }
        }
        self.wait(None)
    }

    /// Returns whether the request must be resent.
    fn handle_warnings(&mut self, warnings: &Value) -> Result<bool> {
        let Some(modules) = warnings.as_object() else {
            return Ok(false);
        };
        let mut retry = false;
        for (module, body) in modules {
            if module == "info" {
                continue;
            }
            let text = ["warnings", "*", "html"]
                .iter()
                .find_map(|key| body.get(key).and_then(Value::as_str))
                .or_else(|| body.as_str())
                .unwrap_or_default();
            for line in text.lines().filter(|line| !line.trim().is_empty()) {
                let verdict = match self.warning_handler.as_mut() {
                    Some(handler) => handler(module.as_str(), line),
                    None => WarningVerdict::Unhandled,
                };
                match verdict {
                    WarningVerdict::Handled => continue,
                    WarningVerdict::Retry => {
                        retry = true;
                        continue;
                    }
                    WarningVerdict::Unhandled => {}
                }
                match classify_warning(module, line, &self.params) {
                    WarningAction::ReduceBatch { parameter } => {
                        if halve_limit(&mut self.params, &parameter) {
                            retry = true;
                        }
                    }
                    WarningAction::Log => {
                        tracing::warn!(module = %module, "API warning: {line}");
                    }
                }
            }
        }
        if retry {
            self.count_retry()?;
        }
        Ok(retry)
    }
}

fn api_error(document: &Value, encoded: &EncodedParams) -> ApiError {
    let envelope = document
        .get("error")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let code = envelope
        .get("code")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let info = ["info", "text", "*"]
        .iter()
        .find_map(|key| envelope.get(*key).and_then(Value::as_str))
        .unwrap_or_default()
        .to_string();

    let mut context = envelope
        .into_iter()
        .filter(|(key, _)| key != "code" && key != "info")
        .collect::<Map<_, _>>();
    if let Some(top_level) = document.as_object() {
        for (key, value) in top_level {
            if key != "error" && !context.contains_key(key) {
                context.insert(key.clone(), value.clone());
            }
        }
    }
    ApiError {
        code,
        info,
        context,
        parameters: encoded.display_pairs(),
    }
}

/// Halve a numeric limit parameter. Returns false when it cannot shrink.
fn halve_limit(params: &mut ParameterSet, key: &str) -> bool {
    let Some(current) = params.first(key).and_then(|value| value.parse::<u64>().ok()) else {
        return false;
    };
    if current <= 1 {
        return false;
    }
    let halved = current / 2;
    tracing::debug!(parameter = key, from = current, to = halved, "reducing limit");
    params.set(key, halved);
    true
}

fn excerpt(body: &str) -> String {
    let stripped = HTML_TAG.replace_all(body, " ");
    let collapsed = WHITESPACE.replace_all(stripped.trim(), " ");
    let mut excerpt = collapsed.chars().take(BODY_EXCERPT_CHARS).collect::<String>();
    if collapsed.chars().count() > BODY_EXCERPT_CHARS {
        excerpt.push_str("...");
    }
    excerpt
}
