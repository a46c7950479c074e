//! Typed RPC surface of the remote storage service.
//!
//! Every call is one HTTP POST `{base}/{call}` carrying the session `auth`
//! token plus call parameters in the query string, answered by a JSON
//! envelope with a numeric `result` (see [`ApiResponse`]). Connections are
//! logical pipelining channels acquired from an [`ApiPool`]:
//!
//! - [`ApiConn::send`] issues a request without waiting for its response,
//! - [`ApiConn::try_take_response`] non-blockingly takes the oldest finished
//!   response,
//! - [`ApiConn::recv`] waits for the oldest in-flight response.
//!
//! Responses complete through a per-connection FIFO, so they are always
//! handed back in send order - the correctness condition the pipelined
//! batch runner relies on.

mod codes;
mod response;

pub use codes::ErrorClass;
pub use response::{ApiResponse, Metadata};

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::Stream;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, instrument};
use url::Url;

/// HTTP connect timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur on the RPC surface.
///
/// Non-zero `result` codes are not errors at this layer; they travel inside
/// [`ApiResponse`] and are classified by the operation handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Failed to construct the HTTP client.
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),

    /// Transport-level failure (DNS, connect, TLS, non-2xx status, body).
    #[error("network error calling {call}: {source}")]
    Network {
        /// The remote call that failed.
        call: &'static str,
        /// The underlying transport error.
        #[source]
        source: reqwest::Error,
    },

    /// The response envelope lacks a required field.
    #[error("malformed response from {call}: missing field {field}")]
    MissingField {
        /// The remote call that answered.
        call: &'static str,
        /// The missing or mistyped field.
        field: &'static str,
    },

    /// The call name does not join onto the API base URL.
    #[error("invalid api url for {call}")]
    InvalidUrl {
        /// The remote call being issued.
        call: &'static str,
    },

    /// `recv` was called with nothing in flight.
    #[error("no response pending on this connection")]
    NoPendingResponse,

    /// The in-flight request was aborted or its task panicked.
    #[error("request for {call} was aborted")]
    Canceled {
        /// The remote call that was dropped.
        call: &'static str,
    },
}

/// Request body attached to a command.
enum CommandBody {
    /// Fully buffered payload (small pipelined uploads).
    Bytes(Vec<u8>),
    /// Streamed payload with a known length (chunked large uploads).
    Stream {
        stream: BoxStream<'static, io::Result<Vec<u8>>>,
        len: u64,
    },
}

impl fmt::Debug for CommandBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            Self::Stream { len, .. } => write!(f, "Stream({len} bytes)"),
        }
    }
}

/// One remote call under construction.
#[derive(Debug)]
pub struct Command {
    name: &'static str,
    params: Vec<(&'static str, String)>,
    body: Option<CommandBody>,
}

impl Command {
    /// Starts a command for the named remote call.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            params: Vec::new(),
            body: None,
        }
    }

    /// The remote call name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Appends an unsigned integer parameter.
    #[must_use]
    pub fn num(mut self, key: &'static str, value: u64) -> Self {
        self.params.push((key, value.to_string()));
        self
    }

    /// Appends a string parameter.
    #[must_use]
    pub fn text(mut self, key: &'static str, value: &str) -> Self {
        self.params.push((key, value.to_string()));
        self
    }

    /// Appends a boolean parameter (wire format `1`/`0`).
    #[must_use]
    pub fn flag(mut self, key: &'static str, value: bool) -> Self {
        self.params.push((key, String::from(if value { "1" } else { "0" })));
        self
    }

    /// Attaches a fully buffered request body.
    #[must_use]
    pub fn body_bytes(mut self, bytes: Vec<u8>) -> Self {
        self.body = Some(CommandBody::Bytes(bytes));
        self
    }

    /// Attaches a streamed request body of known length.
    #[must_use]
    pub fn body_stream<S>(mut self, len: u64, stream: S) -> Self
    where
        S: Stream<Item = io::Result<Vec<u8>>> + Send + 'static,
    {
        self.body = Some(CommandBody::Stream {
            stream: Box::pin(stream),
            len,
        });
        self
    }
}

/// Pool of connections to the storage service.
///
/// Cheap to clone; the underlying HTTP client reuses sockets internally.
#[derive(Debug, Clone)]
pub struct ApiPool {
    client: reqwest::Client,
    base: Url,
    auth: String,
}

impl ApiPool {
    /// Creates a pool against the given API base URL with a session token.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Client`] if the HTTP client cannot be built.
    pub fn new(base: Url, auth: impl Into<String>) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(ApiError::Client)?;

        Ok(Self {
            client,
            base,
            auth: auth.into(),
        })
    }

    /// Acquires a connection.
    ///
    /// Transport failures surface on the connection's `send`/`recv`, not
    /// here.
    #[must_use]
    pub fn acquire(&self) -> ApiConn {
        ApiConn {
            client: self.client.clone(),
            base: self.base.clone(),
            auth: self.auth.clone(),
            inflight: VecDeque::new(),
        }
    }
}

/// An in-flight request and the call it belongs to.
struct Pending {
    call: &'static str,
    handle: JoinHandle<Result<ApiResponse, ApiError>>,
}

/// One pipelining channel to the storage service.
///
/// Held exclusively between acquire and release. Dropping the connection
/// aborts whatever is still in flight, so a healthy release only happens
/// after every pending response has been taken.
pub struct ApiConn {
    client: reqwest::Client,
    base: Url,
    auth: String,
    inflight: VecDeque<Pending>,
}

impl ApiConn {
    /// Issues a request without waiting for its response.
    ///
    /// The response is read later by [`Self::try_take_response`] or
    /// [`Self::recv`], in send order.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidUrl`] if the call name does not join onto
    /// the base URL. Transport failures surface on the receive side.
    #[instrument(skip(self, command), fields(call = command.name()))]
    pub fn send(&mut self, command: Command) -> Result<(), ApiError> {
        let call = command.name;
        let url = self
            .base
            .join(call)
            .map_err(|_| ApiError::InvalidUrl { call })?;

        let mut query: Vec<(&'static str, String)> = command.params;
        query.push(("auth", self.auth.clone()));

        let mut request = self.client.post(url).query(&query);
        match command.body {
            None => {}
            Some(CommandBody::Bytes(bytes)) => {
                request = request.body(bytes);
            }
            Some(CommandBody::Stream { stream, len }) => {
                request = request
                    .header(reqwest::header::CONTENT_LENGTH, len)
                    .body(reqwest::Body::wrap_stream(stream));
            }
        }

        let handle = tokio::spawn(async move {
            let response = request
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(|source| ApiError::Network { call, source })?;
            let value = response
                .json::<Value>()
                .await
                .map_err(|source| ApiError::Network { call, source })?;
            Ok(ApiResponse::new(call, value))
        });

        self.inflight.push_back(Pending { call, handle });
        Ok(())
    }

    /// Awaits a pending request's task, mapping a join failure to
    /// [`ApiError::Canceled`].
    async fn join(pending: Pending) -> Result<ApiResponse, ApiError> {
        match pending.handle.await {
            Ok(result) => result,
            Err(_) => Err(ApiError::Canceled { call: pending.call }),
        }
    }

    /// Non-blockingly takes the oldest response if it has arrived.
    ///
    /// Returns `None` when nothing is in flight or the oldest request is
    /// still pending.
    pub async fn try_take_response(&mut self) -> Option<Result<ApiResponse, ApiError>> {
        if !self
            .inflight
            .front()
            .is_some_and(|pending| pending.handle.is_finished())
        {
            return None;
        }
        let pending = self.inflight.pop_front()?;
        Some(Self::join(pending).await)
    }

    /// Waits for the oldest in-flight response.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::NoPendingResponse`] if nothing is in flight, or
    /// the transport/envelope error of the request itself.
    pub async fn recv(&mut self) -> Result<ApiResponse, ApiError> {
        match self.inflight.pop_front() {
            Some(pending) => Self::join(pending).await,
            None => Err(ApiError::NoPendingResponse),
        }
    }

    /// Issues a request and waits for its response.
    ///
    /// # Errors
    ///
    /// Propagates the errors of [`Self::send`] and [`Self::recv`].
    pub async fn call(&mut self, command: Command) -> Result<ApiResponse, ApiError> {
        self.send(command)?;
        self.recv().await
    }

    /// Number of requests issued but not yet taken.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inflight.len()
    }

    /// Returns the connection healthy.
    pub fn release(self) {}

    /// Returns the connection after a failure, discarding in-flight work.
    pub fn release_bad(mut self) {
        debug!(pending = self.inflight.len(), "releasing bad connection");
        self.abort_inflight();
    }

    fn abort_inflight(&mut self) {
        for pending in self.inflight.drain(..) {
            pending.handle.abort();
        }
    }
}

impl Drop for ApiConn {
    fn drop(&mut self) {
        self.abort_inflight();
    }
}

impl fmt::Debug for ApiConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConn")
            .field("base", &self.base.as_str())
            .field("pending", &self.inflight.len())
            .finish()
    }
}
