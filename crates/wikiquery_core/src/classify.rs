//! Decision table for server-reported errors, HTTP statuses and warnings.
//!
//! Everything here is pure: the request state machine gathers the
//! situation, asks for an [`Action`] and carries it out.

use std::sync::LazyLock;

use regex::Regex;

use crate::params::{ParamValue, ParameterSet};

/// `internal_api_error_*` classes worth retrying.
pub const RETRYABLE_INTERNAL_ERRORS: &[&str] = &[
    "DBConnectionError",
    "DBQueryError",
    "DBQueryTimeoutError",
    "ReadOnlyError",
];

const INTERNAL_ERROR_PREFIX: &str = "internal_api_error_";
const NONCE_REUSED: &str = "Nonce already used";

static LAG_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Waiting for [^:]+: (?P<lag>\d+(?:\.\d+)?) seconds? lagged").expect("lag pattern")
});

static UNRECOGNIZED_PARAMETERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Unrecognized parameters?: (?P<names>.+?)\.?$").expect("unrecognized pattern")
});

/// What the caller's request looked like when the failure arrived.
#[derive(Debug, Clone, Default)]
pub struct Situation {
    pub action: String,
    pub login_in_progress: bool,
    pub relogin_attempted: bool,
    pub nonce_retried: bool,
    pub uses_post: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryKind {
    /// Plain exponential backoff.
    Backoff,
    /// Replication lag; the reported lag seeds the delay when present.
    Lagged { lag_seconds: Option<f64> },
    /// Delay derived from the site's rate-limit entry for the action.
    RateLimited,
    /// A server-side exception class on the retry allow-list.
    ServerFault { class: String },
    /// Resend right away.
    Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    Title,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rewrite {
    /// Drop the disabled `*what` scope; title searches become `intitle:` queries.
    SearchScope(SearchScope),
    ForcePost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fatal {
    Api,
    InternalApi { class: String },
    Auth,
    Http,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Retry(RetryKind),
    Reauthenticate,
    RefreshToken,
    ReduceBatch { parameter: String },
    Rewrite(Rewrite),
    Fatal(Fatal),
}

pub fn classify_error(code: &str, info: &str, situation: &Situation) -> Action {
    if let Some(class) = code.strip_prefix(INTERNAL_ERROR_PREFIX) {
        return internal_error(class);
    }
    match code {
        "maxlag" => Action::Retry(RetryKind::Lagged {
            lag_seconds: parse_lag(info),
        }),
        "ratelimited" => Action::Retry(RetryKind::RateLimited),
        "badtoken" if !situation.login_in_progress && situation.action != "login" => {
            Action::RefreshToken
        }
        "notloggedin" | "readapidenied" | "assertuserfailed" | "assertbotfailed" => {
            if situation.relogin_attempted || situation.login_in_progress {
                Action::Fatal(Fatal::Auth)
            } else {
                Action::Reauthenticate
            }
        }
        "readonly" => internal_error("ReadOnlyError"),
        "search-title-disabled" => Action::Rewrite(Rewrite::SearchScope(SearchScope::Title)),
        "search-text-disabled" => Action::Rewrite(Rewrite::SearchScope(SearchScope::Text)),
        "cirrussearch-too-busy-error" => Action::Retry(RetryKind::Backoff),
        "mwoauth-invalid-authorization" => {
            if info.contains(NONCE_REUSED) && !situation.nonce_retried {
                Action::Retry(RetryKind::Immediate)
            } else {
                Action::Fatal(Fatal::Auth)
            }
        }
        _ => Action::Fatal(Fatal::Api),
    }
}

fn internal_error(class: &str) -> Action {
    if RETRYABLE_INTERNAL_ERRORS.contains(&class) {
        Action::Retry(RetryKind::ServerFault {
            class: class.to_string(),
        })
    } else {
        Action::Fatal(Fatal::InternalApi {
            class: class.to_string(),
        })
    }
}

/// `None` for success statuses.
pub fn classify_status(status: u16, situation: &Situation) -> Option<Action> {
    match status {
        200..=299 => None,
        504 => Some(Action::Retry(RetryKind::Backoff)),
        414 if situation.uses_post => Some(Action::Fatal(Fatal::Http)),
        414 => Some(Action::Rewrite(Rewrite::ForcePost)),
        408 | 429 | 502 | 503 => Some(Action::Retry(RetryKind::Backoff)),
        _ => Some(Action::Fatal(Fatal::Http)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarningAction {
    Log,
    ReduceBatch { parameter: String },
}

pub fn classify_warning(module: &str, text: &str, params: &ParameterSet) -> WarningAction {
    if module != "main" {
        return WarningAction::Log;
    }
    let Some(captures) = UNRECOGNIZED_PARAMETERS.captures(text.trim()) else {
        return WarningAction::Log;
    };
    captures["names"]
        .split(',')
        .map(|name| name.trim().trim_matches('"').trim_matches('\''))
        .find(|name| name.ends_with("limit") && halvable(params, name))
        .map(|name| WarningAction::ReduceBatch {
            parameter: name.to_string(),
        })
        .unwrap_or(WarningAction::Log)
}

/// Whether the logged-in identity reported in `query.userinfo` disagrees with `expected`.
pub fn userinfo_mismatch(document: &serde_json::Value, expected: &str) -> bool {
    let Some(userinfo) = document.get("query").and_then(|query| query.get("userinfo")) else {
        return false;
    };
    if userinfo.get("anon").is_some_and(|anon| anon != &serde_json::Value::Bool(false)) {
        return true;
    }
    userinfo
        .get("name")
        .and_then(serde_json::Value::as_str)
        .is_some_and(|name| name != expected)
}

pub fn parse_lag(info: &str) -> Option<f64> {
    LAG_PATTERN
        .captures(info)
        .and_then(|captures| captures["lag"].parse::<f64>().ok())
}

fn halvable(params: &ParameterSet, name: &str) -> bool {
    match params.get(name) {
        Some(ParamValue::List(values)) => values
            .first()
            .and_then(|value| value.parse::<u64>().ok())
            .is_some_and(|value| value > 1),
        _ => false,
    }
}
