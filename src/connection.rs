//! Intercepted connections.
//!
//! Each intercepted connection is an in-memory pipe. The client holds an
//! [`InterceptedStream`]; a driver task owns the other end and runs the
//! request cycle:
//!
//! ```text
//! Idle -> AccumulatingHeaders -> HeadersComplete -> AccumulatingBody -> Dispatched -> Idle
//!                  \                     \
//!                   +---------------------+--> Passthrough (bytes are not HTTP, or no match)
//! ```
//!
//! Response bodies are produced on the blocking pool so a slow callback
//! holds up only its own connection.

use crate::entry::{frame_chunk, ResponseBody, SynthesizedResponse, LAST_CHUNK};
use crate::error::UnmockedError;
use crate::registry::{Registry, Resolution};
use crate::request::{
    decode_chunked, find_head_end, parse_head, sniff, BodyFraming, Sniff, StructuredRequest,
};
use crate::transport::{Dialer, Endpoint};
use http::Method;
use parking_lot::Mutex;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::time::Sleep;
use tracing::debug;

const PIPE_CAPACITY: usize = 64 * 1024;

const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Where an intercepted connection is in its request cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing buffered.
    Idle,
    /// Bytes received, blank line not seen yet.
    AccumulatingHeaders,
    /// Request line and headers parsed.
    HeadersComplete,
    /// Reading a fixed-length or chunked body.
    AccumulatingBody,
    /// Request resolved; response being written.
    Dispatched,
    /// Bytes are relayed to a real destination.
    Passthrough,
    Closed,
}

/// Error to surface on the client side once the driver gives up.
#[derive(Debug, Clone)]
enum Failure {
    Unmocked(UnmockedError),
    Io(io::ErrorKind, String),
}

impl Failure {
    fn to_io_error(&self) -> io::Error {
        match self {
            Failure::Unmocked(err) => err.clone().into(),
            Failure::Io(kind, message) => io::Error::new(*kind, message.clone()),
        }
    }
}

#[derive(Debug)]
struct Shared {
    phase: Mutex<Phase>,
    failure: Mutex<Option<Failure>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            phase: Mutex::new(Phase::Idle),
            failure: Mutex::new(None),
        }
    }

    fn set_phase(&self, phase: Phase) {
        let mut current = self.phase.lock();
        let previous = *current;
        if previous != phase {
            debug!(from = ?previous, to = ?phase, "Connection phase changed");
            *current = phase;
        }
    }

    fn fail(&self, failure: Failure) {
        let mut slot = self.failure.lock();
        if slot.is_none() {
            *slot = Some(failure);
        }
    }

    fn failure(&self) -> Option<io::Error> {
        self.failure.lock().as_ref().map(Failure::to_io_error)
    }
}

/// Client end of an intercepted connection.
///
/// Reads yield the synthesized response bytes. When a request cannot be
/// served, reads and writes fail with the reason; see
/// [`crate::error::unmocked`].
pub struct InterceptedStream {
    io: DuplexStream,
    shared: Arc<Shared>,
    endpoint: Endpoint,
    read_timeout: Option<Duration>,
    deadline: Option<Pin<Box<Sleep>>>,
}

impl InterceptedStream {
    /// Open the pipe and spawn its driver. Must run inside a tokio runtime.
    pub(crate) fn open(registry: Arc<Registry>, fallback: Arc<dyn Dialer>, endpoint: Endpoint) -> Self {
        let read_timeout = registry.settings().read_timeout_ms.map(Duration::from_millis);
        let chunk_size = registry.settings().io_chunk_size.max(1);
        let body_idle = Duration::from_millis(registry.settings().unframed_body_idle_ms);
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        let shared = Arc::new(Shared::new());

        let driver = Driver {
            io: server,
            registry,
            fallback,
            endpoint: endpoint.clone(),
            shared: Arc::clone(&shared),
            buf: Vec::new(),
            chunk_size,
            body_idle,
        };
        tokio::spawn(driver.run());

        Self {
            io: client,
            shared,
            endpoint,
            read_timeout,
            deadline: None,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn phase(&self) -> Phase {
        *self.shared.phase.lock()
    }

    /// Fail reads that wait longer than `timeout` with `TimedOut`.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
        self.deadline = None;
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }
}

impl AsyncRead for InterceptedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(err) = this.shared.failure() {
            return Poll::Ready(Err(err));
        }

        let before = buf.filled().len();
        match Pin::new(&mut this.io).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.deadline = None;
                if result.is_ok() && buf.filled().len() == before {
                    // EOF: the driver may have closed the pipe on failure
                    if let Some(err) = this.shared.failure() {
                        return Poll::Ready(Err(err));
                    }
                }
                Poll::Ready(result)
            }
            Poll::Pending => {
                let Some(timeout) = this.read_timeout else {
                    return Poll::Pending;
                };
                let deadline = this
                    .deadline
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
                match deadline.as_mut().poll(cx) {
                    Poll::Ready(()) => {
                        this.deadline = None;
                        Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("read from {} timed out after {:?}", this.endpoint, timeout),
                        )))
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}

impl AsyncWrite for InterceptedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Some(err) = this.shared.failure() {
            return Poll::Ready(Err(err));
        }
        match Pin::new(&mut this.io).poll_write(cx, buf) {
            Poll::Ready(Err(err)) => Poll::Ready(Err(this.shared.failure().unwrap_or(err))),
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

enum Next {
    KeepAlive,
    Close,
    Forward,
    Fail(UnmockedError),
}

/// Server end of the pipe.
struct Driver {
    io: DuplexStream,
    registry: Arc<Registry>,
    fallback: Arc<dyn Dialer>,
    endpoint: Endpoint,
    shared: Arc<Shared>,
    buf: Vec<u8>,
    chunk_size: usize,
    body_idle: Duration,
}

impl Driver {
    async fn run(mut self) {
        if let Err(err) = self.serve().await {
            debug!(endpoint = %self.endpoint, error = %err, "Intercepted connection failed");
            self.shared.fail(Failure::Io(err.kind(), err.to_string()));
        }
        self.shared.set_phase(Phase::Closed);
    }

    async fn serve(&mut self) -> io::Result<()> {
        loop {
            self.shared.set_phase(Phase::Idle);
            match self.serve_one().await? {
                Next::KeepAlive => {}
                Next::Close => {
                    self.shared.set_phase(Phase::Closed);
                    // the client may already be gone
                    let _ = self.io.shutdown().await;
                    return Ok(());
                }
                Next::Forward => return self.passthrough().await,
                Next::Fail(err) => {
                    self.shared.fail(Failure::Unmocked(err));
                    self.shared.set_phase(Phase::Closed);
                    return Ok(());
                }
            }
        }
    }

    /// Read one request and answer it.
    async fn serve_one(&mut self) -> io::Result<Next> {
        let head_len = loop {
            if !self.buf.is_empty() {
                if sniff(&self.buf) == Sniff::NotHttp {
                    return Ok(Next::Forward);
                }
                if let Some(end) = find_head_end(&self.buf) {
                    break end;
                }
                self.shared.set_phase(Phase::AccumulatingHeaders);
            }
            if self.fill().await? == 0 {
                return Ok(Next::Close);
            }
        };

        let head = match parse_head(&self.buf[..head_len]) {
            Ok(head) => head,
            Err(err) => {
                debug!(error = %err, "Unparseable request head, forwarding");
                return Ok(Next::Forward);
            }
        };
        let framing = match head.framing() {
            Ok(framing) => framing,
            Err(err) => {
                debug!(error = %err, "Unusable body framing, forwarding");
                return Ok(Next::Forward);
            }
        };
        self.shared.set_phase(Phase::HeadersComplete);

        let mut continued = false;
        let (body, consumed) = match framing {
            BodyFraming::Length(len) => {
                let total = head_len.saturating_add(len);
                while self.buf.len() < total {
                    if head.expects_continue() && !continued {
                        self.io.write_all(CONTINUE).await?;
                        continued = true;
                    }
                    self.shared.set_phase(Phase::AccumulatingBody);
                    if self.fill().await? == 0 {
                        break;
                    }
                }
                let end = total.min(self.buf.len());
                (self.buf[head_len..end].to_vec(), end)
            }
            BodyFraming::Chunked => loop {
                match decode_chunked(&self.buf[head_len..]) {
                    Ok(Some((body, used))) => break (body, head_len + used),
                    Ok(None) => {}
                    Err(err) => {
                        debug!(error = %err, "Malformed chunked body, forwarding");
                        return Ok(Next::Forward);
                    }
                }
                if head.expects_continue() && !continued {
                    self.io.write_all(CONTINUE).await?;
                    continued = true;
                }
                self.shared.set_phase(Phase::AccumulatingBody);
                if self.fill().await? == 0 {
                    break (self.buf[head_len..].to_vec(), self.buf.len());
                }
            },
            BodyFraming::Unframed if carries_body(&head.method) => {
                self.shared.set_phase(Phase::AccumulatingBody);
                loop {
                    if sniff(&self.buf[head_len..]) == Sniff::Http {
                        break (Vec::new(), head_len);
                    }
                    match tokio::time::timeout(self.body_idle, self.fill()).await {
                        Ok(Ok(0)) | Err(_) => break (self.buf[head_len..].to_vec(), self.buf.len()),
                        Ok(Ok(_)) => {}
                        Ok(Err(err)) => return Err(err),
                    }
                }
            }
            BodyFraming::Unframed => {
                let rest = &self.buf[head_len..];
                if sniff(rest) == Sniff::Http {
                    // a pipelined request follows
                    (Vec::new(), head_len)
                } else {
                    (rest.to_vec(), self.buf.len())
                }
            }
        };

        let raw: Vec<u8> = self.buf.drain(..consumed).collect();
        let request = StructuredRequest::new(
            head,
            body,
            self.endpoint.scheme.as_str(),
            &self.endpoint.host,
            self.endpoint.port,
        );
        let is_head = request.method == Method::HEAD;

        match self.registry.resolve(request) {
            Resolution::Matched {
                entry,
                context,
                request,
            } => {
                self.shared.set_phase(Phase::Dispatched);
                let response = tokio::task::spawn_blocking(move || entry.respond(&request, &context))
                    .await
                    .map_err(join_error)?;
                self.write_response(response, is_head).await
            }
            Resolution::Passthrough(_) => {
                let mut restored = raw;
                restored.append(&mut self.buf);
                self.buf = restored;
                Ok(Next::Forward)
            }
            Resolution::Unmocked(err) => Ok(Next::Fail(err)),
        }
    }

    async fn write_response(&mut self, response: SynthesizedResponse, is_head: bool) -> io::Result<Next> {
        let closes = response.closes_connection();
        let chunked = response.is_chunked();
        self.io.write_all(&response.head_bytes()).await?;

        if !is_head {
            match response.body {
                ResponseBody::Full(bytes) => self.io.write_all(&bytes).await?,
                ResponseBody::Stream(chunks) => {
                    loop {
                        let source = Arc::clone(&chunks);
                        let next = tokio::task::spawn_blocking(move || source.next_chunk())
                            .await
                            .map_err(join_error)?;
                        let Some(chunk) = next else { break };
                        if chunked {
                            // an empty chunk would end the body early
                            if chunk.is_empty() {
                                continue;
                            }
                            self.io.write_all(&frame_chunk(&chunk)).await?;
                        } else {
                            self.io.write_all(&chunk).await?;
                        }
                        self.io.flush().await?;
                    }
                    if chunked {
                        self.io.write_all(LAST_CHUNK).await?;
                    }
                }
            }
        }
        self.io.flush().await?;

        Ok(if closes { Next::Close } else { Next::KeepAlive })
    }

    /// Relay everything, buffered bytes first, to the real destination.
    async fn passthrough(&mut self) -> io::Result<()> {
        self.shared.set_phase(Phase::Passthrough);
        debug!(endpoint = %self.endpoint, buffered = self.buf.len(), "Forwarding connection to real destination");

        let mut upstream = self.fallback.dial(&self.endpoint).await?;
        upstream.write_all(&self.buf).await?;
        upstream.flush().await?;
        self.buf.clear();

        let (sent, received) = tokio::io::copy_bidirectional(&mut self.io, &mut upstream).await?;
        debug!(endpoint = %self.endpoint, sent, received, "Passthrough finished");
        Ok(())
    }

    async fn fill(&mut self) -> io::Result<usize> {
        self.buf.reserve(self.chunk_size);
        loop {
            match self.io.read_buf(&mut self.buf).await {
                Err(err) if is_transient(&err) => continue,
                other => return other,
            }
        }
    }
}

/// Methods whose requests may carry a body without declaring its length.
fn carries_body(method: &Method) -> bool {
    *method != Method::GET && *method != Method::HEAD
}

fn is_transient(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

fn join_error(err: tokio::task::JoinError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("response generation failed: {}", err))
}
