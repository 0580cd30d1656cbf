//! Scripted collaborators for unit tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use serde_json::Value;

use crate::config::EngineConfig;
use crate::site::Site;
use crate::throttle::Throttle;
use crate::transport::{HttpCall, HttpReply, Transport, TransportFailure};

pub(crate) const TEST_API_URL: &str = "https://wiki.example.org/w/api.php";

#[derive(Default)]
struct Recorder {
    replies: VecDeque<Result<HttpReply, TransportFailure>>,
    calls: Vec<HttpCall>,
    superior_cleared: Vec<String>,
    cookies_cleared: usize,
    gates: Vec<bool>,
    pauses: Vec<Duration>,
}

/// Shared view of what a scripted site sent and how it was paced.
#[derive(Clone, Default)]
pub(crate) struct ScriptHandle(Rc<RefCell<Recorder>>);

impl ScriptHandle {
    pub(crate) fn push_json(&self, document: Value) {
        self.push_reply(HttpReply::ok(document.to_string()));
    }

    pub(crate) fn push_reply(&self, reply: HttpReply) {
        self.0.borrow_mut().replies.push_back(Ok(reply));
    }

    pub(crate) fn push_failure(&self, failure: TransportFailure) {
        self.0.borrow_mut().replies.push_back(Err(failure));
    }

    pub(crate) fn calls(&self) -> Vec<HttpCall> {
        self.0.borrow().calls.clone()
    }

    pub(crate) fn superior_cleared(&self) -> Vec<String> {
        self.0.borrow().superior_cleared.clone()
    }

    pub(crate) fn cookies_cleared(&self) -> usize {
        self.0.borrow().cookies_cleared
    }

    pub(crate) fn gates(&self) -> Vec<bool> {
        self.0.borrow().gates.clone()
    }

    pub(crate) fn pauses(&self) -> Vec<Duration> {
        self.0.borrow().pauses.clone()
    }
}

#[derive(Default)]
pub(crate) struct ScriptedTransport(ScriptHandle);

impl Transport for ScriptedTransport {
    fn execute(&mut self, call: &HttpCall) -> Result<HttpReply, TransportFailure> {
        let mut recorder = self.0.0.borrow_mut();
        recorder.calls.push(call.clone());
        recorder
            .replies
            .pop_front()
            .unwrap_or_else(|| Err(TransportFailure::fatal("no scripted reply left")))
    }

    fn clear_superior_cookies(&mut self, host: &str) {
        self.0.0.borrow_mut().superior_cleared.push(host.to_string());
    }

    fn clear_cookies(&mut self) {
        self.0.0.borrow_mut().cookies_cleared += 1;
    }
}

/// Records gate and pause calls without sleeping.
#[derive(Default)]
pub(crate) struct RecordingThrottle(ScriptHandle);

impl Throttle for RecordingThrottle {
    fn gate(&mut self, is_write: bool) {
        self.0.0.borrow_mut().gates.push(is_write);
    }

    fn pause(&mut self, delay: Duration) {
        self.0.0.borrow_mut().pauses.push(delay);
    }
}

/// Config pointing at the scripted wiki, with module metadata lookups disabled.
pub(crate) fn test_config() -> EngineConfig {
    let mut config = EngineConfig::for_api(TEST_API_URL);
    config.site.auto_paraminfo = false;
    config
}

pub(crate) fn site_with(config: EngineConfig) -> (Site, ScriptHandle) {
    let handle = ScriptHandle::default();
    let site = Site::with_parts(
        config,
        Box::new(ScriptedTransport(handle.clone())),
        Box::new(RecordingThrottle(handle.clone())),
    )
    .expect("scripted site");
    (site, handle)
}
