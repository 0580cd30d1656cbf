use std::sync::{Mutex, MutexGuard, PoisonError};

use cookie_store::{CookieDomain, RawCookie};
use reqwest::Url;
use reqwest::cookie::CookieStore;
use reqwest::header::HeaderValue;

/// Session cookie store shared with the HTTP client.
///
/// Wraps [`cookie_store::CookieStore`] so parent-domain cookies can be
/// dropped on demand, which reqwest's built-in jar does not expose.
#[derive(Debug, Default)]
pub struct CookieJar {
    store: Mutex<cookie_store::CookieStore>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, cookie_store::CookieStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one `Set-Cookie` header received from `url`.
    pub fn store(&self, set_cookie: &str, url: &Url) {
        match RawCookie::parse(set_cookie.to_string()) {
            Ok(cookie) => self.lock().store_response_cookies(std::iter::once(cookie), url),
            Err(err) => tracing::debug!(error = %err, "ignoring malformed Set-Cookie header"),
        }
    }

    pub fn header_for(&self, url: &Url) -> Option<String> {
        let store = self.lock();
        let rendered = store
            .get_request_values(url)
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>();
        if rendered.is_empty() {
            None
        } else {
            Some(rendered.join("; "))
        }
    }

    /// Drop cookies scoped to a parent domain of `host` (e.g. `.example.org`
    /// for `en.example.org`). Host cookies are kept.
    pub fn clear_superior(&self, host: &str) -> usize {
        let host = host.to_ascii_lowercase();
        let mut store = self.lock();
        let doomed = store
            .iter_unexpired()
            .filter(|cookie| match &cookie.domain {
                CookieDomain::Suffix(domain) => is_parent_domain(domain, &host),
                _ => false,
            })
            .map(|cookie| {
                (
                    String::from(&cookie.domain),
                    String::from(&cookie.path),
                    cookie.name().to_string(),
                )
            })
            .collect::<Vec<_>>();
        doomed
            .iter()
            .filter(|(domain, path, name)| store.remove(domain, path, name).is_some())
            .count()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().iter_unexpired().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CookieStore for CookieJar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        let cookies = cookie_headers
            .filter_map(|header| header.to_str().ok())
            .filter_map(|value| RawCookie::parse(value.to_string()).ok())
            .collect::<Vec<_>>();
        self.lock().store_response_cookies(cookies.into_iter(), url);
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        self.header_for(url)
            .and_then(|value| HeaderValue::from_str(&value).ok())
    }
}

fn is_parent_domain(domain: &str, host: &str) -> bool {
    host.strip_suffix(domain)
        .is_some_and(|prefix| prefix.ends_with('.'))
}
