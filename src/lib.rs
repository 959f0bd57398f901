//! Interpose
//!
//! HTTP traffic interception for tests. Client code opens connections
//! through a [`Dialer`]; while interception is enabled, requests to
//! registered URIs are answered with synthesized responses and never touch
//! the network.
//!
//! # Features
//!
//! - **URI Matching**: literal URIs (case-insensitive host, optional
//!   querystring comparison) or regular expressions with captures
//! - **Response Rotation**: several responses per URI, the last one repeats
//! - **Dynamic Bodies**: callbacks computing the reply from the request,
//!   and lazily streamed bodies
//! - **Request History**: every intercepted request, matched or not
//! - **Passthrough**: non-HTTP bytes and, when allowed, unmatched requests
//!   reach the real destination
//!
//! # Example
//!
//! ```no_run
//! use interpose::{Endpoint, Registration};
//! use http::Method;
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! interpose::enable(false);
//! interpose::register(
//!     Registration::new(Method::GET, "http://api.example.com/users").json(&serde_json::json!([])),
//! )?;
//!
//! let mut conn = interpose::dialer()
//!     .connect(&Endpoint::http("api.example.com", 80))
//!     .await?;
//! conn.write_all(b"GET /users HTTP/1.1\r\nHost: api.example.com\r\n\r\n").await?;
//! let mut response = Vec::new();
//! conn.read_to_end(&mut response).await?;
//!
//! assert_eq!(interpose::last_request().path, "/users");
//! interpose::disable();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod entry;
pub mod error;
pub mod headers;
pub mod logging;
pub mod matcher;
pub mod registry;
pub mod request;
pub mod status;
pub mod transport;
pub mod uri;

pub use config::{GlobalSettings, InterceptorConfig};
pub use connection::{InterceptedStream, Phase};
pub use entry::{Reply, Response};
pub use error::{ConfigurationError, Error, UnmockedError};
pub use headers::Headers;
pub use matcher::MatchContext;
pub use registry::{Registration, Registry};
pub use request::StructuredRequest;
pub use transport::{Connection, Dialer, Endpoint, Interceptor, InterceptorStream, Scheme, TcpDialer};
pub use uri::UriInfo;

use once_cell::sync::Lazy;
use std::sync::Arc;

static GLOBAL: Lazy<Arc<Registry>> = Lazy::new(|| Arc::new(Registry::new()));

/// The process-wide registry the free functions operate on.
pub fn registry() -> Arc<Registry> {
    Arc::clone(&GLOBAL)
}

/// Interceptor over the process-wide registry, falling back to plain TCP.
pub fn dialer() -> Interceptor {
    Interceptor::with_tcp(registry())
}

/// Turn interception on. Unmatched requests reach the network only when
/// `allow_net_connect` is true.
pub fn enable(allow_net_connect: bool) {
    GLOBAL.enable(allow_net_connect);
}

/// Turn interception off; new connections reach the real destination.
pub fn disable() {
    GLOBAL.disable();
}

/// Forget all registrations and history.
pub fn reset() {
    GLOBAL.reset();
}

pub fn is_enabled() -> bool {
    GLOBAL.is_enabled()
}

pub fn register(registration: Registration) -> Result<(), ConfigurationError> {
    GLOBAL.register(registration)
}

pub fn last_request() -> Arc<StructuredRequest> {
    GLOBAL.last_request()
}

pub fn latest_requests() -> Vec<Arc<StructuredRequest>> {
    GLOBAL.latest_requests()
}

pub fn has_request() -> bool {
    GLOBAL.has_request()
}
