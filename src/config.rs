//! Configuration for the interceptor.
//!
//! Declares global settings and stubs that are registered up front, so a
//! test suite can keep its fake endpoints in a YAML file.

use crate::entry::Response;
use crate::registry::{Registration, Registry};
use http::Method;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Main configuration for the interceptor.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct InterceptorConfig {
    /// List of stub definitions
    #[serde(default)]
    pub stubs: Vec<StubDefinition>,

    /// Global settings
    #[serde(default)]
    pub settings: GlobalSettings,
}

impl InterceptorConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.settings.validate()?;
        for (i, stub) in self.stubs.iter().enumerate() {
            stub.validate()
                .map_err(|e| anyhow::anyhow!("Stub {}: {}", i, e))?;
        }
        Ok(())
    }

    /// Register every stub with `registry`.
    pub fn apply(&self, registry: &Registry) -> anyhow::Result<()> {
        for stub in &self.stubs {
            stub.apply(registry)
                .map_err(|e| anyhow::anyhow!("Stub {}: {}", stub.id, e))?;
        }
        Ok(())
    }
}

/// A single stub definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StubDefinition {
    /// Unique identifier for this stub
    pub id: String,

    /// Optional name/description
    #[serde(default)]
    pub name: Option<String>,

    /// HTTP method(s) the stub answers
    #[serde(default = "default_methods")]
    pub method: Vec<String>,

    /// URI to match
    pub uri: UriSpec,

    /// Priority (higher = matched first)
    #[serde(default)]
    pub priority: i32,

    /// Compare querystrings too
    #[serde(default)]
    pub match_querystring: bool,

    /// Responses handed out in order, the last one repeating
    pub responses: Vec<ResponseDefinition>,
}

fn default_methods() -> Vec<String> {
    vec!["GET".to_string()]
}

fn default_true() -> bool {
    true
}

impl StubDefinition {
    /// Validate the stub definition.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.id.is_empty() {
            anyhow::bail!("Stub id cannot be empty");
        }
        if self.method.is_empty() {
            anyhow::bail!("Stub must name at least one method");
        }
        for method in &self.method {
            parse_method(method)?;
        }
        if self.responses.is_empty() {
            anyhow::bail!("Stub must declare at least one response");
        }
        self.uri.validate()?;
        for response in &self.responses {
            response.validate()?;
        }
        Ok(())
    }

    fn apply(&self, registry: &Registry) -> anyhow::Result<()> {
        let responses = self
            .responses
            .iter()
            .map(ResponseDefinition::to_response)
            .collect::<anyhow::Result<Vec<_>>>()?;

        for method in &self.method {
            let method = parse_method(method)?;
            let registration = match &self.uri {
                UriSpec::Literal { value } => Registration::new(method, value.clone()),
                UriSpec::Regex { pattern } => Registration::regex(method, pattern.clone()),
            };
            registry.register(
                registration
                    .responses(responses.clone())
                    .priority(self.priority)
                    .match_querystring(self.match_querystring),
            )?;
        }
        Ok(())
    }
}

fn parse_method(method: &str) -> anyhow::Result<Method> {
    Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid method {:?}: {}", method, e))
}

/// URI matching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UriSpec {
    /// Literal URI, compared component-wise
    Literal { value: String },
    /// Regex pattern matched against the full URL
    Regex { pattern: String },
}

impl UriSpec {
    /// Validate the URI pattern.
    pub fn validate(&self) -> anyhow::Result<()> {
        match self {
            UriSpec::Literal { value } => {
                crate::uri::UriInfo::from_uri(value)?;
            }
            UriSpec::Regex { pattern } => {
                regex::Regex::new(pattern).map_err(|e| anyhow::anyhow!("Invalid regex: {}", e))?;
            }
        }
        Ok(())
    }
}

/// Response definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseDefinition {
    /// HTTP status code
    #[serde(default = "default_status")]
    pub status: u16,

    /// Headers layered over the computed defaults
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Headers replacing the whole set, defaults included
    #[serde(default)]
    pub forcing_headers: Option<BTreeMap<String, String>>,

    /// Response body
    #[serde(default)]
    pub body: Option<ResponseBody>,
}

fn default_status() -> u16 {
    200
}

impl ResponseDefinition {
    /// Validate the response definition.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.status < 100 || self.status > 599 {
            anyhow::bail!("Invalid status code: {}", self.status);
        }
        Ok(())
    }

    /// Build the [`Response`] this definition describes.
    pub fn to_response(&self) -> anyhow::Result<Response> {
        let mut response = Response::new(self.status);
        if let Some(body) = &self.body {
            response = response.body(body.to_bytes()?);
            let declares_type = self
                .headers
                .keys()
                .any(|k| k.eq_ignore_ascii_case("content-type"));
            if let (false, Some(content_type)) = (declares_type, body.content_type()) {
                response = response.adding_header("Content-Type", content_type);
            }
        }
        response = response.adding_headers(self.headers.clone());
        if let Some(forced) = &self.forcing_headers {
            response = response.forcing_headers(forced.clone());
        }
        Ok(response)
    }
}

/// Response body configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBody {
    /// Plain text body
    Text { content: String },
    /// JSON body
    Json { content: serde_json::Value },
    /// Base64 encoded binary
    Base64 { content: String },
    /// Load from file
    File { path: String },
}

impl ResponseBody {
    /// Get the body content as bytes.
    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        match self {
            ResponseBody::Text { content } => Ok(content.as_bytes().to_vec()),
            ResponseBody::Json { content } => Ok(serde_json::to_string(content)?.into_bytes()),
            ResponseBody::Base64 { content } => {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD
                    .decode(content)
                    .map_err(|e| anyhow::anyhow!("Invalid base64: {}", e))
            }
            ResponseBody::File { path } => std::fs::read(path)
                .map_err(|e| anyhow::anyhow!("Failed to read file {}: {}", path, e)),
        }
    }

    /// Content type implied by the body kind; text keeps the default.
    pub fn content_type(&self) -> Option<&'static str> {
        match self {
            ResponseBody::Text { .. } => None,
            ResponseBody::Json { .. } => Some("application/json"),
            ResponseBody::Base64 { .. } => Some("application/octet-stream"),
            ResponseBody::File { .. } => Some("application/octet-stream"),
        }
    }
}

/// Global settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalSettings {
    /// Let unmatched requests reach the real network
    #[serde(default = "default_true")]
    pub allow_net_connect: bool,

    /// Destination ports treated as HTTP at connect time
    #[serde(default = "default_http_ports")]
    pub potential_http_ports: Vec<u16>,

    /// Read deadline for intercepted streams (none = wait forever)
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,

    /// Buffer size for reads on intercepted connections
    #[serde(default = "default_io_chunk_size")]
    pub io_chunk_size: usize,

    /// How long a body without declared length may go quiet before it is
    /// considered complete
    #[serde(default = "default_unframed_body_idle_ms")]
    pub unframed_body_idle_ms: u64,

    /// Log all matched requests
    #[serde(default = "default_true")]
    pub log_matches: bool,

    /// Log unmatched requests
    #[serde(default = "default_true")]
    pub log_unmatched: bool,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            allow_net_connect: true,
            potential_http_ports: default_http_ports(),
            read_timeout_ms: None,
            io_chunk_size: default_io_chunk_size(),
            unframed_body_idle_ms: default_unframed_body_idle_ms(),
            log_matches: true,
            log_unmatched: true,
        }
    }
}

impl GlobalSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.io_chunk_size == 0 {
            anyhow::bail!("io_chunk_size must be positive");
        }
        Ok(())
    }
}

fn default_http_ports() -> Vec<u16> {
    vec![80, 443]
}

fn default_io_chunk_size() -> usize {
    8192
}

fn default_unframed_body_idle_ms() -> u64 {
    100
}
