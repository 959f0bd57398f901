//! Registered expectations, request history and net-connect policy.
//!
//! All mutation happens under one lock held only for the lookup or append;
//! response bodies are produced by the caller after the lock is released.

use crate::config::GlobalSettings;
use crate::entry::{Entry, Reply, Response};
use crate::error::{ConfigurationError, UnmockedError};
use crate::headers::Headers;
use crate::matcher::{find_match, MatchContext, UriMatcher, UriPattern};
use crate::request::StructuredRequest;
use http::Method;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

enum PatternSource {
    Literal(String),
    Regex(String),
}

/// A pending registration: method, URI pattern and the responses to serve.
///
/// The single-response setters (`status`, `body`, `header`, ...) shape one
/// response; [`Registration::responses`] supplies a rotation instead.
pub struct Registration {
    method: Method,
    pattern: PatternSource,
    response: Response,
    responses: Option<Vec<Response>>,
    priority: i32,
    match_querystring: bool,
}

impl Registration {
    /// Register against a literal URI.
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self::with_pattern(method, PatternSource::Literal(uri.into()))
    }

    /// Register against a regular expression matched on the full URL.
    pub fn regex(method: Method, pattern: impl Into<String>) -> Self {
        Self::with_pattern(method, PatternSource::Regex(pattern.into()))
    }

    fn with_pattern(method: Method, pattern: PatternSource) -> Self {
        Self {
            method,
            pattern,
            response: Response::default(),
            responses: None,
            priority: 0,
            match_querystring: false,
        }
    }

    pub fn status(mut self, status: u16) -> Self {
        self.response = self.response.status(status);
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.response = self.response.body(body);
        self
    }

    pub fn json(mut self, value: &serde_json::Value) -> Self {
        self.response = self.response.json(value);
        self
    }

    /// Keyword-style header, see [`Response::header`].
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.response = self.response.header(name, value);
        self
    }

    pub fn adding_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.response = self.response.adding_header(name, value);
        self
    }

    pub fn forcing_headers<K, V>(mut self, headers: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.response = self.response.forcing_headers(headers);
        self
    }

    pub fn callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&StructuredRequest, &MatchContext, Headers) -> Reply + Send + Sync + 'static,
    {
        self.response = self.response.callback(callback);
        self
    }

    pub fn streaming<I, T>(mut self, chunks: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        T: Into<Vec<u8>> + 'static,
    {
        self.response = self.response.streaming(chunks);
        self
    }

    /// Serve these responses in order, then repeat the last one.
    pub fn responses(mut self, responses: Vec<Response>) -> Self {
        self.responses = Some(responses);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn match_querystring(mut self, enabled: bool) -> Self {
        self.match_querystring = enabled;
        self
    }
}

/// Outcome of resolving one request.
pub enum Resolution {
    Matched {
        entry: Arc<Entry>,
        context: MatchContext,
        request: Arc<StructuredRequest>,
    },
    /// Nothing matched; the real network may be used.
    Passthrough(Arc<StructuredRequest>),
    /// Nothing matched and the real network is off limits.
    Unmocked(UnmockedError),
}

struct State {
    matchers: HashMap<Method, Vec<UriMatcher>>,
    history: Vec<Arc<StructuredRequest>>,
    allow_net_connect: bool,
    potential_ports: HashSet<u16>,
}

/// Store of matchers per method, request history and policy.
pub struct Registry {
    state: Mutex<State>,
    enabled: AtomicBool,
    settings: GlobalSettings,
    empty: Arc<StructuredRequest>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Disabled registry with default settings.
    pub fn new() -> Self {
        Self::with_settings(GlobalSettings::default())
    }

    pub fn with_settings(settings: GlobalSettings) -> Self {
        let state = State {
            matchers: HashMap::new(),
            history: Vec::new(),
            allow_net_connect: settings.allow_net_connect,
            potential_ports: settings.potential_http_ports.iter().copied().collect(),
        };
        Self {
            state: Mutex::new(state),
            enabled: AtomicBool::new(false),
            settings,
            empty: Arc::new(StructuredRequest::empty()),
        }
    }

    pub fn settings(&self) -> &GlobalSettings {
        &self.settings
    }

    /// Add a matcher, or append entries to the one with the same method,
    /// pattern and querystring rule. The latest registration sets the
    /// priority.
    pub fn register(&self, registration: Registration) -> Result<(), ConfigurationError> {
        let Registration {
            method,
            pattern,
            response,
            responses,
            priority,
            match_querystring,
        } = registration;

        let (pattern, uri) = match pattern {
            PatternSource::Literal(uri) => (UriPattern::literal(&uri)?, uri),
            PatternSource::Regex(regex) => (UriPattern::regex(&regex)?, regex),
        };

        let responses = responses.unwrap_or_else(|| vec![response]);
        if responses.is_empty() {
            return Err(ConfigurationError::NoResponses);
        }
        let entries = responses
            .into_iter()
            .map(|r| r.into_entry(method.clone(), &uri))
            .collect::<Result<Vec<_>, _>>()?;

        let mut state = self.state.lock();
        if let UriPattern::Literal(info) = &pattern {
            state.potential_ports.insert(info.port());
        }

        let matchers = state.matchers.entry(method.clone()).or_default();
        let count = entries.len();
        match matchers
            .iter()
            .position(|m| m.same_binding(&method, &pattern, match_querystring))
        {
            Some(idx) => {
                matchers[idx].extend(entries);
                matchers[idx].set_priority(priority);
                debug!(method = %method, uri = %uri, priority, added = count, "Appended responses to registered URI");
            }
            None => {
                matchers.push(UriMatcher::new(
                    method.clone(),
                    pattern,
                    entries,
                    priority,
                    match_querystring,
                ));
                debug!(method = %method, uri = %uri, priority, responses = count, "Registered URI");
            }
        }
        Ok(())
    }

    /// Record `request` in the history and find the entry serving it.
    pub fn resolve(&self, request: StructuredRequest) -> Resolution {
        let request = Arc::new(request);
        let mut state = self.state.lock();
        state.history.push(Arc::clone(&request));

        let found = state.matchers.get_mut(&request.method).and_then(|matchers| {
            let (idx, context) = find_match(matchers, &request.info)?;
            let entry = matchers[idx].select_entry()?;
            Some((entry, context))
        });

        if let Some((entry, context)) = found {
            drop(state);
            if self.settings.log_matches {
                info!(
                    method = %request.method,
                    url = %request.url,
                    uri = %entry.uri(),
                    "Request matched registered URI"
                );
            }
            return Resolution::Matched {
                entry,
                context,
                request,
            };
        }

        let allow_net_connect = state.allow_net_connect;
        drop(state);
        if self.settings.log_unmatched {
            warn!(
                method = %request.method,
                url = %request.url,
                allow_net_connect,
                "No registered URI matched request"
            );
        }

        if allow_net_connect {
            Resolution::Passthrough(request)
        } else {
            Resolution::Unmocked(UnmockedError {
                method: request.method.to_string(),
                host: request.host.clone(),
                protocol: request.protocol.clone(),
                url: request.url.clone(),
            })
        }
    }

    /// Turn interception on. Idempotent.
    pub fn enable(&self, allow_net_connect: bool) {
        self.state.lock().allow_net_connect = allow_net_connect;
        self.enabled.store(true, Ordering::SeqCst);
        info!(allow_net_connect, "Interception enabled");
    }

    /// Turn interception off: new connections reach the real network.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        info!("Interception disabled");
    }

    /// Drop all matchers and history; keeps enabled state and policy.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.matchers.clear();
        state.history.clear();
        state.potential_ports = self.settings.potential_http_ports.iter().copied().collect();
        debug!("Registry reset");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn allow_net_connect(&self) -> bool {
        self.state.lock().allow_net_connect
    }

    /// Most recent request, or an empty request if none was made.
    pub fn last_request(&self) -> Arc<StructuredRequest> {
        self.state
            .lock()
            .history
            .last()
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.empty))
    }

    /// Every request seen since the last reset, oldest first.
    pub fn latest_requests(&self) -> Vec<Arc<StructuredRequest>> {
        self.state.lock().history.clone()
    }

    pub fn has_request(&self) -> bool {
        !self.state.lock().history.is_empty()
    }

    /// Whether any registered matcher could serve `hostname:port`.
    pub fn could_match(&self, hostname: &str, port: u16) -> bool {
        self.state
            .lock()
            .matchers
            .values()
            .flatten()
            .any(|m| m.could_match(hostname, port))
    }

    pub fn is_potential_http_port(&self, port: u16) -> bool {
        self.state.lock().potential_ports.contains(&port)
    }

    /// Whether a connection to `hostname:port` should be intercepted.
    pub fn should_intercept(&self, hostname: &str, port: u16) -> bool {
        self.is_enabled() && (self.is_potential_http_port(port) || self.could_match(hostname, port))
    }
}
