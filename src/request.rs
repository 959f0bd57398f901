//! Request parsing.
//!
//! Turns intercepted bytes into a [`StructuredRequest`]: request line and
//! headers first, then the body according to its framing, then a parsed
//! view of the body chosen by `Content-Type`.

use crate::error::ParseError;
use crate::headers::Headers;
use crate::uri::{default_port, parse_query, split_host_port, QueryMap, UriInfo, UriParts};
use http::Method;
use std::fmt;
use url::Url;

/// Longest method token we wait for before deciding the bytes are not HTTP.
const MAX_METHOD_LEN: usize = 24;

/// Request line and headers.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub version: String,
    pub headers: Headers,
}

/// How the body following a head is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Length(usize),
    Chunked,
    /// No declared length: whatever arrived with the head is the body.
    Unframed,
}

impl RequestHead {
    pub fn framing(&self) -> Result<BodyFraming, ParseError> {
        let chunked = self
            .headers
            .get_all("transfer-encoding")
            .any(|v| v.to_ascii_lowercase().contains("chunked"));
        if chunked {
            return Ok(BodyFraming::Chunked);
        }
        match self.headers.get("content-length") {
            Some(value) => value
                .trim()
                .parse()
                .map(BodyFraming::Length)
                .map_err(|_| ParseError::InvalidContentLength(value.to_string())),
            None => Ok(BodyFraming::Unframed),
        }
    }

    /// Whether the client waits for an interim `100 Continue`.
    pub fn expects_continue(&self) -> bool {
        self.headers
            .get("expect")
            .map(|v| v.trim().eq_ignore_ascii_case("100-continue"))
            .unwrap_or(false)
    }
}

/// Verdict on the first bytes written to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sniff {
    Http,
    NotHttp,
    Undetermined,
}

/// Decide from a prefix whether a byte stream is an HTTP/1.x request.
pub fn sniff(buf: &[u8]) -> Sniff {
    let buf = trim_leading_newlines(buf);
    for (idx, &byte) in buf.iter().enumerate() {
        if byte == b' ' {
            if idx == 0 {
                return Sniff::NotHttp;
            }
            break;
        }
        if !is_token_byte(byte) || idx >= MAX_METHOD_LEN {
            return Sniff::NotHttp;
        }
    }

    let Some(line_end) = buf.iter().position(|&b| b == b'\n') else {
        return Sniff::Undetermined;
    };
    let line = String::from_utf8_lossy(&buf[..line_end]);
    match parse_request_line(line.trim_end_matches('\r')) {
        Ok(_) => Sniff::Http,
        Err(_) => Sniff::NotHttp,
    }
}

/// Length of the head including its blank-line terminator, once complete.
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    let crlf = find(buf, b"\r\n\r\n").map(|pos| pos + 4);
    let lf = find(buf, b"\n\n").map(|pos| pos + 2);
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Parse a request line and headers.
pub fn parse_head(raw: &[u8]) -> Result<RequestHead, ParseError> {
    let text = String::from_utf8_lossy(trim_leading_newlines(raw));
    let mut lines = text.split('\n').map(|line| line.trim_end_matches('\r'));

    let request_line = lines
        .next()
        .filter(|line| !line.is_empty())
        .ok_or(ParseError::MissingRequestLine)?;
    let (method, target, version) = parse_request_line(request_line)?;

    let mut headers = Headers::new();
    let mut last: Option<(String, String)> = None;
    for line in lines {
        if line.is_empty() {
            break;
        }
        if line.starts_with([' ', '\t']) {
            // obs-fold continuation
            match last.as_mut() {
                Some((_, value)) => {
                    value.push(' ');
                    value.push_str(line.trim());
                    continue;
                }
                None => return Err(ParseError::InvalidHeader(line.to_string())),
            }
        }
        let (name, value) = line
            .split_once(':')
            .filter(|(name, _)| !name.is_empty() && name.bytes().all(is_token_byte))
            .ok_or_else(|| ParseError::InvalidHeader(line.to_string()))?;
        if let Some((name, value)) = last.replace((name.to_string(), value.trim().to_string())) {
            headers.append(name, value);
        }
    }
    if let Some((name, value)) = last {
        headers.append(name, value);
    }

    Ok(RequestHead {
        method,
        target,
        version,
        headers,
    })
}

/// Decode a complete chunked body.
///
/// Returns `None` while more bytes are needed, otherwise the decoded body
/// and the number of bytes consumed (trailers included).
pub fn decode_chunked(buf: &[u8]) -> Result<Option<(Vec<u8>, usize)>, ParseError> {
    let mut pos = 0;
    let mut body = Vec::new();

    loop {
        let Some(line_len) = find(&buf[pos..], b"\r\n") else {
            return Ok(None);
        };
        let line = String::from_utf8_lossy(&buf[pos..pos + line_len]);
        let size_text = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| ParseError::InvalidChunkSize(line.to_string()))?;
        pos += line_len + 2;

        if size == 0 {
            loop {
                let Some(trailer_len) = find(&buf[pos..], b"\r\n") else {
                    return Ok(None);
                };
                pos += trailer_len + 2;
                if trailer_len == 0 {
                    return Ok(Some((body, pos)));
                }
            }
        }

        let Some(end) = pos.checked_add(size).and_then(|n| n.checked_add(2)) else {
            return Err(ParseError::InvalidChunkSize(line.to_string()));
        };
        if buf.len() < end {
            return Ok(None);
        }
        body.extend_from_slice(&buf[pos..end - 2]);
        if &buf[end - 2..end] != b"\r\n" {
            return Err(ParseError::UnterminatedChunk);
        }
        pos = end;
    }
}

/// Body interpreted according to its `Content-Type`.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedBody {
    Json(serde_json::Value),
    Form(QueryMap),
    Text(String),
    Bytes(Vec<u8>),
}

impl ParsedBody {
    pub fn parse(content_type: Option<&str>, body: &[u8]) -> Self {
        let media_type = content_type
            .and_then(|ct| ct.split(';').next())
            .map(|ct| ct.trim().to_ascii_lowercase())
            .unwrap_or_default();

        match media_type.as_str() {
            "application/json" | "text/json" => match serde_json::from_slice(body) {
                Ok(value) => ParsedBody::Json(value),
                Err(_) => Self::raw(body),
            },
            "application/x-www-form-urlencoded" => {
                ParsedBody::Form(parse_query(&String::from_utf8_lossy(body)))
            }
            _ => Self::raw(body),
        }
    }

    fn raw(body: &[u8]) -> Self {
        match std::str::from_utf8(body) {
            Ok(text) => ParsedBody::Text(text.to_string()),
            Err(_) => ParsedBody::Bytes(body.to_vec()),
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            ParsedBody::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_form(&self) -> Option<&QueryMap> {
        match self {
            ParsedBody::Form(form) => Some(form),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParsedBody::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// An intercepted request, parsed and ready for inspection.
#[derive(Debug, Clone)]
pub struct StructuredRequest {
    pub method: Method,
    /// Request target as sent, querystring included.
    pub path: String,
    pub version: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub parsed_body: ParsedBody,
    pub querystring: QueryMap,
    /// Absolute URL rebuilt from scheme, host and target.
    pub url: String,
    /// `"http"` or `"https"`.
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub info: UriInfo,
}

impl StructuredRequest {
    /// Build from a parsed head and its body.
    ///
    /// `scheme`, `host` and `port` describe the connection and are used
    /// when neither the target nor the `Host` header says otherwise.
    pub fn new(head: RequestHead, body: Vec<u8>, scheme: &str, host: &str, port: u16) -> Self {
        let mut protocol = scheme.to_ascii_lowercase();
        let mut path = head.target.clone();
        let (mut hostname, mut port) = (host.to_string(), port);

        if let Some(url) = absolute_target(&head.target) {
            protocol = url.scheme().to_string();
            hostname = url.host_str().unwrap_or(host).to_string();
            port = url.port_or_known_default().unwrap_or(port);
            path = match url.query() {
                Some(query) => format!("{}?{}", url.path(), query),
                None => url.path().to_string(),
            };
        } else if let Some(authority) = head.headers.get("host") {
            let (name, explicit) = split_host_port(authority);
            if !name.is_empty() {
                hostname = name;
            }
            if let Some(explicit) = explicit {
                port = explicit;
            }
        }

        let without_fragment = path.split('#').next().unwrap_or_default();
        let (path_only, query) = without_fragment
            .split_once('?')
            .unwrap_or((without_fragment, ""));

        let info = UriInfo::from(UriParts {
            scheme: protocol.clone(),
            hostname: hostname.clone(),
            port: Some(port),
            path: path_only.to_string(),
            query: query.to_string(),
            ..Default::default()
        });

        let port_suffix = if port == default_port(&protocol) {
            String::new()
        } else {
            format!(":{}", port)
        };
        let url = format!("{}://{}{}{}", protocol, hostname, port_suffix, without_fragment);
        let parsed_body = ParsedBody::parse(head.headers.get("content-type"), &body);

        Self {
            method: head.method,
            querystring: parse_query(query),
            path: without_fragment.to_string(),
            version: head.version,
            headers: head.headers,
            body,
            parsed_body,
            url,
            protocol,
            host: hostname,
            port,
            info,
        }
    }

    /// Parse a complete request held in one buffer.
    pub fn parse(raw: &[u8], scheme: &str) -> Result<Self, ParseError> {
        let head_len = find_head_end(raw).unwrap_or(raw.len());
        let head = parse_head(&raw[..head_len])?;
        let rest = &raw[head_len..];

        let body = match head.framing()? {
            BodyFraming::Length(len) => rest[..len.min(rest.len())].to_vec(),
            BodyFraming::Chunked => match decode_chunked(rest)? {
                Some((body, _)) => body,
                None => rest.to_vec(),
            },
            BodyFraming::Unframed => rest.to_vec(),
        };

        Ok(Self::new(head, body, scheme, "localhost", default_port(scheme)))
    }

    /// Placeholder returned before any request was intercepted.
    pub fn empty() -> Self {
        Self {
            method: Method::GET,
            path: String::new(),
            version: String::new(),
            headers: Headers::new(),
            body: Vec::new(),
            parsed_body: ParsedBody::Text(String::new()),
            querystring: QueryMap::new(),
            url: String::new(),
            protocol: String::new(),
            host: String::new(),
            port: 0,
            info: UriInfo::from(UriParts::default()),
        }
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl fmt::Display for StructuredRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({} headers, {} bytes)",
            self.method,
            self.url,
            self.headers.len(),
            self.body.len()
        )
    }
}

fn parse_request_line(line: &str) -> Result<(Method, String, String), ParseError> {
    let invalid = || ParseError::InvalidRequestLine(line.to_string());
    let mut parts = line.split_whitespace();
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(invalid());
    };
    if !method.bytes().all(is_token_byte) || !version.starts_with("HTTP/") {
        return Err(invalid());
    }
    let method = Method::from_bytes(method.as_bytes()).map_err(|_| invalid())?;
    Ok((method, target.to_string(), version.to_string()))
}

fn absolute_target(target: &str) -> Option<Url> {
    let lower = target.get(..8)?.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        Url::parse(target).ok()
    } else {
        None
    }
}

fn is_token_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&byte)
}

fn trim_leading_newlines(buf: &[u8]) -> &[u8] {
    let start = buf
        .iter()
        .position(|&b| b != b'\r' && b != b'\n')
        .unwrap_or(buf.len());
    &buf[start..]
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
