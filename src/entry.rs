//! Registered response definitions and response synthesis.
//!
//! An [`Entry`] is one response a matcher can hand out. Its headers go
//! through a fixed pipeline: computed defaults, then added headers, unless
//! forcing headers are present, in which case they are the whole set.

use crate::error::ConfigurationError;
use crate::headers::{normalize_name, Headers};
use crate::matcher::MatchContext;
use crate::request::StructuredRequest;
use crate::status::reason_phrase;
use http::Method;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Value of the default `Server` header.
pub const SERVER: &str = concat!("interpose/", env!("CARGO_PKG_VERSION"));

const DEFAULT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Computes a reply from the intercepted request.
///
/// Receives the request, the match context (full URL and regex captures)
/// and the headers the entry would have sent; may return them modified.
pub type Callback = Arc<dyn Fn(&StructuredRequest, &MatchContext, Headers) -> Reply + Send + Sync>;

/// Lazy sequence of body chunks.
///
/// Consumed once: a second response drawing from the same stream gets
/// whatever is left, usually nothing.
pub struct ChunkStream {
    chunks: Mutex<Box<dyn Iterator<Item = Vec<u8>> + Send>>,
}

impl ChunkStream {
    pub fn new<I, T>(chunks: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        T: Into<Vec<u8>> + 'static,
    {
        Self {
            chunks: Mutex::new(Box::new(chunks.into_iter().map(Into::into))),
        }
    }

    /// Pull the next chunk. May block for as long as the iterator does.
    pub fn next_chunk(&self) -> Option<Vec<u8>> {
        self.chunks.lock().next()
    }
}

impl fmt::Debug for ChunkStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChunkStream")
    }
}

/// Where an entry's body comes from.
#[derive(Clone)]
pub enum Body {
    Static(Vec<u8>),
    Callback(Callback),
    Stream(Arc<ChunkStream>),
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Static(bytes) => write!(f, "Static({} bytes)", bytes.len()),
            Body::Callback(_) => f.write_str("Callback"),
            Body::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// What a callback returns.
#[derive(Debug)]
pub struct Reply {
    pub status: u16,
    pub headers: Headers,
    pub body: ResponseBody,
}

impl Reply {
    pub fn new(status: u16, headers: Headers, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers,
            body: ResponseBody::Full(body.into()),
        }
    }

    /// Reply whose body is streamed chunk by chunk.
    pub fn streaming<I, T>(status: u16, headers: Headers, chunks: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        T: Into<Vec<u8>> + 'static,
    {
        Self {
            status,
            headers,
            body: ResponseBody::Stream(Arc::new(ChunkStream::new(chunks))),
        }
    }
}

/// Declaration of one response, turned into an [`Entry`] at registration.
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    body: Body,
    adding_headers: Headers,
    forcing_headers: Option<Headers>,
}

impl Default for Response {
    fn default() -> Self {
        Self::new(200)
    }
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            body: Body::Static(Vec::new()),
            adding_headers: Headers::new(),
            forcing_headers: None,
        }
    }

    pub fn status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    /// Static body; text is stored as its UTF-8 bytes.
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Body::Static(body.into());
        self
    }

    /// Static JSON body with a matching `Content-Type`.
    pub fn json(self, value: &serde_json::Value) -> Self {
        self.body(value.to_string())
            .adding_header("Content-Type", "application/json")
    }

    pub fn callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&StructuredRequest, &MatchContext, Headers) -> Reply + Send + Sync + 'static,
    {
        self.body = Body::Callback(Arc::new(callback));
        self
    }

    pub fn streaming<I, T>(mut self, chunks: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        T: Into<Vec<u8>> + 'static,
    {
        self.body = Body::Stream(Arc::new(ChunkStream::new(chunks)));
        self
    }

    /// Keyword-style header: `cache_control` is sent as `Cache-Control`.
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.adding_headers.insert(normalize_name(name), value);
        self
    }

    /// Header layered over the computed defaults, name kept verbatim.
    pub fn adding_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.adding_headers.insert(name, value);
        self
    }

    pub fn adding_headers<K, V>(mut self, headers: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        for (name, value) in headers {
            self.adding_headers.insert(name, value);
        }
        self
    }

    /// Replace the whole header set, computed defaults included.
    pub fn forcing_headers<K, V>(mut self, headers: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.forcing_headers = Some(headers.into_iter().collect());
        self
    }

    pub(crate) fn into_entry(self, method: Method, uri: &str) -> Result<Entry, ConfigurationError> {
        let entry = Entry {
            method,
            uri: uri.to_string(),
            status: self.status,
            body: self.body,
            adding_headers: self.adding_headers,
            forcing_headers: self.forcing_headers,
        };
        entry.validate()?;
        Ok(entry)
    }
}

/// A registered response definition.
#[derive(Debug, Clone)]
pub struct Entry {
    method: Method,
    uri: String,
    status: u16,
    body: Body,
    adding_headers: Headers,
    forcing_headers: Option<Headers>,
}

impl Entry {
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The registered URI or pattern this entry belongs to.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        let Body::Static(body) = &self.body else {
            return Ok(());
        };
        let declared = self.adding_headers.get("content-length").or_else(|| {
            self.forcing_headers
                .as_ref()
                .and_then(|h| h.get("content-length"))
        });
        if let Some(value) = declared {
            let declared: usize = value
                .trim()
                .parse()
                .map_err(|_| ConfigurationError::InvalidContentLength(value.to_string()))?;
            if declared != body.len() {
                return Err(ConfigurationError::ContentLengthMismatch {
                    declared,
                    actual: body.len(),
                });
            }
        }
        Ok(())
    }

    /// Defaults, then added headers; or the forced set alone.
    fn assemble_headers(&self, status: u16, body_len: Option<usize>) -> Headers {
        if let Some(forced) = &self.forcing_headers {
            return forced.clone();
        }

        let mut headers = Headers::new();
        headers.insert("Server", SERVER);
        headers.insert("Date", http_date());
        headers.insert("Content-Type", DEFAULT_CONTENT_TYPE);
        headers.insert("Connection", "close");
        headers.insert("Status", status.to_string());
        if let Some(len) = body_len {
            headers.insert("Content-Length", len.to_string());
        }
        headers.merge(&self.adding_headers);
        headers
    }

    /// Produce the response for a request.
    ///
    /// Runs the callback for callback bodies, so this can block; call it
    /// outside any shared lock.
    pub fn respond(&self, request: &StructuredRequest, context: &MatchContext) -> SynthesizedResponse {
        match &self.body {
            Body::Static(bytes) => SynthesizedResponse {
                status: self.status,
                headers: self.assemble_headers(self.status, Some(bytes.len())),
                body: ResponseBody::Full(bytes.clone()),
            },
            Body::Stream(chunks) => SynthesizedResponse {
                status: self.status,
                headers: self.assemble_headers(self.status, None),
                body: ResponseBody::Stream(Arc::clone(chunks)),
            },
            Body::Callback(callback) => {
                let base = self.assemble_headers(self.status, None);
                let Reply {
                    status,
                    mut headers,
                    body,
                } = callback(request, context, base);

                if self.forcing_headers.is_none() {
                    if headers.contains("status") {
                        headers.insert("Status", status.to_string());
                    }
                    if let ResponseBody::Full(bytes) = &body {
                        if !headers.contains("content-length") {
                            headers.insert("Content-Length", bytes.len().to_string());
                        }
                    }
                }

                SynthesizedResponse {
                    status,
                    headers,
                    body,
                }
            }
        }
    }
}

/// Body of a synthesized response.
#[derive(Debug)]
pub enum ResponseBody {
    Full(Vec<u8>),
    Stream(Arc<ChunkStream>),
}

/// A response ready to be written to the wire.
#[derive(Debug)]
pub struct SynthesizedResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: ResponseBody,
}

impl SynthesizedResponse {
    /// Status line and headers, terminated by the blank line.
    pub fn head_bytes(&self) -> Vec<u8> {
        format!(
            "HTTP/1.1 {} {}\r\n{}\r\n",
            self.status,
            reason_phrase(self.status),
            self.headers
        )
        .into_bytes()
    }

    pub fn is_chunked(&self) -> bool {
        self.headers
            .get("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    /// Whether the connection must end after this response.
    pub fn closes_connection(&self) -> bool {
        let announced = self
            .headers
            .get("connection")
            .map(|v| v.to_ascii_lowercase().contains("close"))
            .unwrap_or(false);
        let close_delimited = match &self.body {
            ResponseBody::Full(_) => !self.is_chunked() && !self.headers.contains("content-length"),
            ResponseBody::Stream(_) => !self.is_chunked(),
        };
        announced || close_delimited
    }
}

/// Frame one chunk for `Transfer-Encoding: chunked`.
pub fn frame_chunk(chunk: &[u8]) -> Vec<u8> {
    let mut framed = format!("{:x}\r\n", chunk.len()).into_bytes();
    framed.extend_from_slice(chunk);
    framed.extend_from_slice(b"\r\n");
    framed
}

/// Terminating zero-length chunk.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Current time in RFC 1123 format.
fn http_date() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(response: Response) -> Entry {
        response
            .into_entry(Method::GET, "http://example.com/")
            .unwrap()
    }

    fn get_request() -> StructuredRequest {
        StructuredRequest::parse(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n", "http").unwrap()
    }

    fn respond(entry: &Entry) -> SynthesizedResponse {
        entry.respond(&get_request(), &MatchContext::new("http://example.com/"))
    }

    #[test]
    fn test_content_length_counts_bytes() {
        let response = respond(&entry(Response::new(200).body("こんにちは")));
        assert_eq!(response.headers.get("content-length"), Some("15"));
        let head = String::from_utf8(response.head_bytes()).unwrap();
        assert!(head.contains("Content-Length: 15\r\n"));
    }

    #[test]
    fn test_inconsistent_content_length_rejected() {
        let err = Response::new(200)
            .body("that's me!")
            .adding_header("Content-Length", "999")
            .into_entry(Method::GET, "http://github.com/gabrielfalcao")
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::ContentLengthMismatch {
                declared: 999,
                actual: 10
            }
        ));

        let err = Response::new(200)
            .body("abc")
            .adding_header("content-length", "three")
            .into_entry(Method::GET, "http://example.com/")
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidContentLength(_)));

        // multi-byte text is measured after encoding
        assert!(Response::new(200)
            .body("こんにちは")
            .adding_header("Content-Length", "15")
            .into_entry(Method::GET, "http://example.com/")
            .is_ok());
    }

    #[test]
    fn test_default_headers() {
        let response = respond(&entry(Response::new(201).body("ok")));
        assert_eq!(response.status, 201);
        assert_eq!(response.headers.get("server"), Some(SERVER));
        assert_eq!(response.headers.get("connection"), Some("close"));
        assert_eq!(response.headers.get("status"), Some("201"));
        assert!(response.headers.get("date").unwrap().ends_with(" GMT"));
        assert!(response.closes_connection());
    }

    #[test]
    fn test_adding_headers_override_defaults() {
        let response = respond(&entry(
            Response::new(200)
                .body("{}")
                .adding_header("content-type", "application/json")
                .header("cache_control", "no-cache"),
        ));
        assert_eq!(response.headers.get("Content-Type"), Some("application/json"));
        assert_eq!(response.headers.get("Cache-Control"), Some("no-cache"));
        let names: Vec<_> = response.headers.iter().map(|(k, _)| k).collect();
        assert!(names.contains(&"Cache-Control"));
    }

    #[test]
    fn test_forcing_headers_replace_everything() {
        let response = respond(&entry(
            Response::new(200)
                .body("hi")
                .forcing_headers([("X-Only", "this")]),
        ));
        assert_eq!(response.headers.len(), 1);
        assert_eq!(response.headers.get("x-only"), Some("this"));
        assert!(!response.headers.contains("server"));
        assert!(!response.headers.contains("content-length"));
        assert!(response.closes_connection());
    }

    #[test]
    fn test_callback_body_length_computed() {
        let e = entry(Response::new(200).callback(|_, _, _| {
            Reply::new(200, Headers::new(), "こんにちは".as_bytes())
        }));
        let response = respond(&e);
        assert_eq!(response.headers.get("content-length"), Some("15"));
    }

    #[test]
    fn test_callback_status_and_headers() {
        let e = entry(Response::new(200).callback(|req, ctx, mut headers| {
            headers.insert("a", "b");
            Reply::new(
                418,
                headers,
                format!("The {} response from {}", req.method, ctx.url),
            )
        }));
        let response = respond(&e);
        assert_eq!(response.status, 418);
        assert_eq!(response.headers.get("a"), Some("b"));
        assert_eq!(response.headers.get("status"), Some("418"));
        match response.body {
            ResponseBody::Full(body) => {
                assert_eq!(body, b"The GET response from http://example.com/")
            }
            ResponseBody::Stream(_) => panic!("expected a full body"),
        }
        assert!(String::from_utf8(response_head(&e)).unwrap().starts_with("HTTP/1.1 418 I'm a teapot\r\n"));
    }

    fn response_head(e: &Entry) -> Vec<u8> {
        respond(e).head_bytes()
    }

    #[test]
    fn test_callback_content_length_kept() {
        let e = Response::new(200)
            .callback(|_, _, mut headers| {
                headers.insert("content-length", "12345");
                Reply::new(200, headers, "")
            })
            .into_entry(Method::HEAD, "https://api.yahoo.com/test")
            .unwrap();
        let response = respond(&e);
        assert_eq!(response.headers.get("Content-Length"), Some("12345"));
    }

    #[test]
    fn test_streaming_body_consumed_once() {
        let e = entry(Response::new(200).streaming(vec!["a", "bc", "def"]));
        let response = respond(&e);
        assert!(!response.headers.contains("content-length"));
        assert!(response.closes_connection());

        let ResponseBody::Stream(chunks) = response.body else {
            panic!("expected a stream");
        };
        let collected: Vec<_> = std::iter::from_fn(|| chunks.next_chunk()).collect();
        assert_eq!(collected, vec![b"a".to_vec(), b"bc".to_vec(), b"def".to_vec()]);

        let ResponseBody::Stream(again) = respond(&e).body else {
            panic!("expected a stream");
        };
        assert!(again.next_chunk().is_none());
    }

    #[test]
    fn test_callback_may_stream() {
        let e = entry(Response::new(200).callback(|_, _, headers| {
            Reply::streaming(200, headers, vec!["x".to_string(), "y".to_string()])
        }));
        let response = respond(&e);
        assert!(matches!(response.body, ResponseBody::Stream(_)));
        assert!(!response.headers.contains("content-length"));
    }

    #[test]
    fn test_chunk_framing() {
        assert_eq!(frame_chunk(b"Wikipedia in"), b"c\r\nWikipedia in\r\n".to_vec());
        let response = respond(&entry(
            Response::new(200)
                .streaming(vec!["a"])
                .adding_header("Transfer-Encoding", "chunked")
                .adding_header("Connection", "keep-alive"),
        ));
        assert!(response.is_chunked());
        assert!(!response.closes_connection());
    }

    #[test]
    fn test_json_response() {
        let response = respond(&entry(Response::new(200).json(&serde_json::json!({"hello": "world"}))));
        assert_eq!(response.headers.get("content-type"), Some("application/json"));
        assert_eq!(response.headers.get("content-length"), Some("17"));
    }
}
