//! HTTP transport implementation.
//!
//! The actual HTTP client is abstracted via a trait so that any HTTP library,
//! or an in-process loopback, can carry the requests. Bodies are encoded with
//! the content type chosen when the session started.

use crate::error::{SyncError, SyncResult};
use crate::transport::{Transport, TransportOptions, TransportProvider};
use async_trait::async_trait;
use crsync_protocol::{
    decode, encode, ContentType, CreateOrMigrateRequest, CreateOrMigrateResponse, DbId,
    Endpoints, LastSeenRequest, LastSeenResponse, PullRequest, PullResponse, PushRequest,
    PushResponse,
};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, trace};

/// A failed HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpError {
    /// Response status, or `None` if no response arrived.
    pub status: Option<u16>,
    /// Error message.
    pub message: String,
}

impl HttpError {
    /// An error response with `status`.
    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    /// A failure before any response arrived.
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    /// Returns true if the server refused the request as invalid.
    ///
    /// Timeouts (408) and rate limiting (429) are not refusals.
    pub fn is_client_error(&self) -> bool {
        matches!(self.status, Some(400..=499)) && !matches!(self.status, Some(408 | 429))
    }
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{status} {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for HttpError {}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a POST request and returns the response body.
    async fn post(
        &self,
        url: &str,
        content_type: ContentType,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, HttpError>;
}

/// HTTP-based sync transport.
pub struct HttpTransport<C: HttpClient> {
    endpoints: Endpoints,
    content_type: ContentType,
    client: C,
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(endpoints: Endpoints, content_type: ContentType, client: C) -> Self {
        Self {
            endpoints,
            content_type,
            client,
            last_error: RwLock::new(None),
        }
    }

    /// Returns the endpoints.
    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Returns the body encoding.
    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    async fn post_encoded<Req, Res>(&self, url: &str, request: &Req) -> SyncResult<Res>
    where
        Req: Serialize + Sync,
        Res: DeserializeOwned,
    {
        let body = encode(self.content_type, request)?;
        trace!(url, bytes = body.len(), "posting");

        let response = self
            .client
            .post(url, self.content_type, body)
            .await
            .map_err(|e| {
                *self.last_error.write() = Some(e.message.clone());
                if e.is_client_error() {
                    SyncError::Rejected(e.to_string())
                } else {
                    SyncError::transport_retryable(e.to_string())
                }
            })?;

        *self.last_error.write() = None;
        Ok(decode(self.content_type, &response)?)
    }
}

#[async_trait]
impl<C: HttpClient> Transport for HttpTransport<C> {
    async fn create_or_migrate(
        &self,
        request: &CreateOrMigrateRequest,
    ) -> SyncResult<CreateOrMigrateResponse> {
        self.post_encoded(&self.endpoints.create_or_migrate, request)
            .await
    }

    async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        self.post_encoded(&self.endpoints.apply_changes, request).await
    }

    async fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        let url = self
            .endpoints
            .get_changes
            .as_deref()
            .unwrap_or(&self.endpoints.start_outbound_stream);
        self.post_encoded(url, request).await
    }

    async fn last_seen(&self, request: &LastSeenRequest) -> SyncResult<LastSeenResponse> {
        match &self.endpoints.get_last_seen {
            Some(url) => self.post_encoded(url, request).await,
            None => {
                // Without the endpoint the remote is assumed to have seen
                // nothing. The remote acknowledges resent pushes at its own
                // position, so the session skips ahead after one batch.
                debug!(dbid = %request.dbid, "no last-seen endpoint");
                Ok(LastSeenResponse {
                    checkpoint: request.set.unwrap_or_default(),
                })
            }
        }
    }
}

/// Connects sessions through [`HttpTransport`]s that share one client.
pub struct HttpTransportProvider<C> {
    client: C,
}

impl<C: HttpClient + Clone + 'static> HttpTransportProvider<C> {
    /// Creates a provider around `client`.
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<C: HttpClient + Clone + 'static> TransportProvider for HttpTransportProvider<C> {
    async fn connect(
        &self,
        dbid: &DbId,
        options: &TransportOptions,
    ) -> SyncResult<Arc<dyn Transport>> {
        debug!(%dbid, content_type = %options.content_type, "connecting http transport");
        Ok(Arc::new(HttpTransport::new(
            options.endpoints.clone(),
            options.content_type,
            self.client.clone(),
        )))
    }
}

/// Trait for servers that can handle loopback requests.
#[async_trait]
pub trait LoopbackServer: Send + Sync {
    /// Handles a POST request and returns the response body.
    async fn handle_post(
        &self,
        path: &str,
        content_type: ContentType,
        body: &[u8],
    ) -> Result<Vec<u8>, HttpError>;
}

/// A loopback HTTP client that routes requests directly to a sync server.
///
/// Useful for testing without actual network overhead.
pub struct LoopbackClient<S> {
    server: Arc<S>,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: Arc<S>) -> Self {
        Self { server }
    }
}

impl<S> Clone for LoopbackClient<S> {
    fn clone(&self) -> Self {
        Self {
            server: Arc::clone(&self.server),
        }
    }
}

#[async_trait]
impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    async fn post(
        &self,
        url: &str,
        content_type: ContentType,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, HttpError> {
        // Extract path from URL
        let path = url.find("/sync/").map(|i| &url[i..]).unwrap_or(url);
        self.server.handle_post(path, content_type, &body).await
    }
}
