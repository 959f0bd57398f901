//! URI matching logic.
//!
//! Binds a method and URI pattern to an ordered list of entries and decides
//! whether an intercepted request corresponds to it.

use crate::entry::Entry;
use crate::error::ConfigurationError;
use crate::uri::UriInfo;
use http::Method;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Context captured during matching, handed to callbacks.
#[derive(Debug, Clone, Default)]
pub struct MatchContext {
    /// Full URL of the request, querystring included
    pub url: String,
    /// Regex capture groups, positional ("1", "2", ...) and named
    pub captures: HashMap<String, String>,
}

impl MatchContext {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            captures: HashMap::new(),
        }
    }
}

/// What a matcher compares requests against.
#[derive(Debug, Clone)]
pub enum UriPattern {
    Literal(UriInfo),
    Regex(Regex),
}

impl UriPattern {
    pub fn literal(uri: &str) -> Result<Self, ConfigurationError> {
        Ok(UriPattern::Literal(UriInfo::from_uri(uri)?))
    }

    pub fn regex(pattern: &str) -> Result<Self, ConfigurationError> {
        Ok(UriPattern::Regex(Regex::new(pattern)?))
    }
}

impl fmt::Display for UriPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UriPattern::Literal(info) => write!(f, "{}", info),
            UriPattern::Regex(regex) => write!(f, "{}", regex.as_str()),
        }
    }
}

/// A method + pattern binding with its rotating entries.
#[derive(Debug)]
pub struct UriMatcher {
    method: Method,
    pattern: UriPattern,
    entries: Vec<Arc<Entry>>,
    priority: i32,
    match_querystring: bool,
    cursor: usize,
}

impl UriMatcher {
    pub fn new(
        method: Method,
        pattern: UriPattern,
        entries: Vec<Entry>,
        priority: i32,
        match_querystring: bool,
    ) -> Self {
        Self {
            method,
            pattern,
            entries: entries.into_iter().map(Arc::new).collect(),
            priority,
            match_querystring,
            cursor: 0,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn pattern(&self) -> &UriPattern {
        &self.pattern
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn match_querystring(&self) -> bool {
        self.match_querystring
    }

    pub fn entries(&self) -> &[Arc<Entry>] {
        &self.entries
    }

    pub fn set_priority(&mut self, priority: i32) {
        self.priority = priority;
    }

    /// Append entries after the existing ones; the cursor is untouched.
    pub fn extend(&mut self, entries: Vec<Entry>) {
        self.entries.extend(entries.into_iter().map(Arc::new));
    }

    /// Check a request URI against this matcher.
    pub fn matches(&self, info: &UriInfo) -> Option<MatchContext> {
        let mut context = MatchContext::new(info.full_url(true));

        match &self.pattern {
            UriPattern::Literal(expected) => {
                if expected != info {
                    return None;
                }
                if self.match_querystring && !expected.query_matches(info) {
                    return None;
                }
                Some(context)
            }
            UriPattern::Regex(regex) => {
                let candidate = info.full_url(self.match_querystring);
                let captures = regex.captures(&candidate)?;
                for (i, cap) in captures.iter().enumerate().skip(1) {
                    if let Some(m) = cap {
                        context.captures.insert(format!("{}", i), m.as_str().to_string());
                    }
                }
                // Also add named captures
                for name in regex.capture_names().flatten() {
                    if let Some(m) = captures.name(name) {
                        context.captures.insert(name.to_string(), m.as_str().to_string());
                    }
                }
                Some(context)
            }
        }
    }

    /// Next entry in rotation; sticks to the last one once exhausted.
    pub fn select_entry(&mut self) -> Option<Arc<Entry>> {
        let entry = self.entries.get(self.cursor).cloned()?;
        if self.cursor + 1 < self.entries.len() {
            self.cursor += 1;
        }
        Some(entry)
    }

    /// Whether this matcher could serve a connection to `hostname:port`.
    ///
    /// Regex patterns cannot be checked against a bare host, so they
    /// always qualify.
    pub fn could_match(&self, hostname: &str, port: u16) -> bool {
        match &self.pattern {
            UriPattern::Literal(info) => {
                info.hostname().eq_ignore_ascii_case(hostname) && info.port() == port
            }
            UriPattern::Regex(_) => true,
        }
    }

    /// Same method, pattern and querystring rule: registrations merge.
    pub fn same_binding(&self, method: &Method, pattern: &UriPattern, match_querystring: bool) -> bool {
        if self.method != *method || self.match_querystring != match_querystring {
            return false;
        }
        match (&self.pattern, pattern) {
            (UriPattern::Literal(a), UriPattern::Literal(b)) => {
                a == b && (!match_querystring || a.query_matches(b))
            }
            (UriPattern::Regex(a), UriPattern::Regex(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

/// Find the first matcher for a request: highest priority first,
/// registration order among equals.
pub fn find_match(matchers: &[UriMatcher], info: &UriInfo) -> Option<(usize, MatchContext)> {
    // Sort by priority (highest first)
    let mut indexed: Vec<usize> = (0..matchers.len()).collect();
    indexed.sort_by(|&a, &b| matchers[b].priority.cmp(&matchers[a].priority));

    for idx in indexed {
        if let Some(context) = matchers[idx].matches(info) {
            return Some((idx, context));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Response;

    fn entry(body: &str) -> Entry {
        Response::new(200)
            .body(body)
            .into_entry(Method::GET, "http://example.com/")
            .unwrap()
    }

    fn literal(uri: &str, match_querystring: bool) -> UriMatcher {
        UriMatcher::new(
            Method::GET,
            UriPattern::literal(uri).unwrap(),
            vec![entry("x")],
            0,
            match_querystring,
        )
    }

    fn info(uri: &str) -> UriInfo {
        UriInfo::from_uri(uri).unwrap()
    }

    fn body_of(entry: &Entry) -> Vec<u8> {
        match entry.body() {
            crate::entry::Body::Static(bytes) => bytes.clone(),
            _ => panic!("expected a static body"),
        }
    }

    #[test]
    fn test_querystring_ignored_by_default() {
        let matcher = literal("http://www.foo.com/?query=true", false);
        assert!(matcher.matches(&info("http://www.foo.com/")).is_some());
        assert!(matcher.matches(&info("http://www.foo.com/?a=2")).is_some());
    }

    #[test]
    fn test_querystring_respected_when_requested() {
        let matcher = literal("http://www.foo.com/?query=true", true);
        assert!(matcher.matches(&info("http://www.foo.com/")).is_none());
        assert!(matcher.matches(&info("http://www.foo.com/?query=true")).is_some());

        let matcher = literal("http://www.foo.com/?query=true&unquery=false", true);
        assert!(matcher
            .matches(&info("http://www.foo.com/?unquery=false&query=true"))
            .is_some());

        let matcher = literal("http://www.foo.com/?a=1", true);
        assert!(matcher.matches(&info("http://www.foo.com/?a=2")).is_none());
    }

    #[test]
    fn test_hostname_case_insensitive() {
        let matcher = literal("http://example.com/", false);
        assert!(matcher.matches(&info("HTTP://EXAMPLE.com/")).is_some());
    }

    #[test]
    fn test_regex_matching_with_captures() {
        let matcher = UriMatcher::new(
            Method::GET,
            UriPattern::regex(r"^https://api\.yipit\.com/v1/deal;brand=(?P<brand>\w+)").unwrap(),
            vec![entry("x")],
            0,
            false,
        );
        let ctx = matcher
            .matches(&info("https://api.yipit.com/v1/deal;brand=gap?first_name=chuck"))
            .unwrap();
        assert_eq!(ctx.captures.get("brand"), Some(&"gap".to_string()));
        assert_eq!(ctx.captures.get("1"), Some(&"gap".to_string()));
        assert_eq!(
            ctx.url,
            "https://api.yipit.com/v1/deal;brand=gap?first_name=chuck"
        );
    }

    #[test]
    fn test_regex_sees_query_only_when_requested() {
        let pattern = r"^http://example\.com/search\?q=rust$";
        let loose = UriMatcher::new(Method::GET, UriPattern::regex(pattern).unwrap(), vec![entry("x")], 0, false);
        let strict = UriMatcher::new(Method::GET, UriPattern::regex(pattern).unwrap(), vec![entry("x")], 0, true);
        let request = info("http://example.com/search?q=rust");
        assert!(loose.matches(&request).is_none());
        assert!(strict.matches(&request).is_some());
    }

    #[test]
    fn test_regex_with_port() {
        let matcher = UriMatcher::new(
            Method::GET,
            UriPattern::regex(r"^http://fakeuri\.com:8080/$").unwrap(),
            vec![entry("x")],
            0,
            false,
        );
        assert!(matcher.matches(&info("http://fakeuri.com:8080")).is_some());
    }

    #[test]
    fn test_sticky_rotation() {
        let mut matcher = UriMatcher::new(
            Method::GET,
            UriPattern::literal("http://example.com/").unwrap(),
            vec![entry("first"), entry("second"), entry("third")],
            0,
            false,
        );
        let bodies: Vec<_> = (0..5)
            .map(|_| body_of(&matcher.select_entry().unwrap()))
            .collect();
        assert_eq!(
            bodies,
            vec![
                b"first".to_vec(),
                b"second".to_vec(),
                b"third".to_vec(),
                b"third".to_vec(),
                b"third".to_vec()
            ]
        );

        matcher.extend(vec![entry("fourth")]);
        assert_eq!(body_of(&matcher.select_entry().unwrap()), b"third");
        assert_eq!(body_of(&matcher.select_entry().unwrap()), b"fourth");
    }

    #[test]
    fn test_priority_matching() {
        let low = UriMatcher::new(Method::GET, UriPattern::regex(".+").unwrap(), vec![entry("low")], 0, false);
        let high = UriMatcher::new(Method::GET, UriPattern::regex(".*").unwrap(), vec![entry("high")], 5, false);
        let matchers = vec![low, high];
        let (idx, _) = find_match(&matchers, &info("http://api.yipit.com/v1/")).unwrap();
        assert_eq!(idx, 1);
    }

    #[test]
    fn test_registration_order_breaks_ties() {
        let first = literal("http://example.com/", false);
        let second = UriMatcher::new(Method::GET, UriPattern::regex(".*").unwrap(), vec![entry("x")], 0, false);
        let matchers = vec![first, second];
        let (idx, _) = find_match(&matchers, &info("http://example.com/")).unwrap();
        assert_eq!(idx, 0);
        assert!(find_match(&matchers[..1], &info("http://other.com/")).is_none());
    }

    #[test]
    fn test_same_binding_respects_querystring() {
        let pattern = |uri: &str| UriPattern::literal(uri).unwrap();

        let a = literal("http://www.foo.com/?query=true", false);
        assert!(a.same_binding(&Method::GET, &pattern("http://www.foo.com/?query=false"), false));
        assert!(a.same_binding(&Method::GET, &pattern("http://www.foo.com/"), false));
        assert!(!a.same_binding(&Method::POST, &pattern("http://www.foo.com/"), false));

        let b = literal("http://www.foo.com/?query=true", true);
        assert!(!b.same_binding(&Method::GET, &pattern("http://www.foo.com/?query=false"), true));
        assert!(!b.same_binding(&Method::GET, &pattern("http://www.foo.com/"), true));

        let c = literal("http://www.foo.com/?query=true&unquery=false", true);
        assert!(c.same_binding(&Method::GET, &pattern("http://www.foo.com/?unquery=false&query=true"), true));
    }

    #[test]
    fn test_could_match() {
        let matcher = literal("http://Example.com:8080/", false);
        assert!(matcher.could_match("example.com", 8080));
        assert!(!matcher.could_match("example.com", 80));
        assert!(!matcher.could_match("other.com", 8080));

        let regex = UriMatcher::new(Method::GET, UriPattern::regex(r"^http://\w+\.foo\.com/baz$").unwrap(), vec![entry("x")], 0, false);
        assert!(regex.could_match("www.foo.com", 80));
    }
}
