//! Main sync server.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{HandlerContext, RequestHandler};
use async_trait::async_trait;
use crsync_engine::{HttpError, LoopbackServer, MemoryDatabase};
use crsync_protocol::{decode, encode, Checkpoint, ContentType, DbId, SiteId};
use std::sync::Arc;
use tracing::{debug, warn};

/// The sync server.
///
/// Requests arrive as encoded bodies on a path and are answered in the same
/// encoding.
///
/// # Example
///
/// ```
/// use crsync_engine::{HttpTransportProvider, LoopbackClient};
/// use crsync_server::{ServerConfig, SyncServer};
/// use std::sync::Arc;
///
/// let server = Arc::new(SyncServer::new(ServerConfig::default()));
/// let transports = HttpTransportProvider::new(LoopbackClient::new(server));
/// ```
pub struct SyncServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
}

impl SyncServer {
    /// Creates a new sync server.
    pub fn new(config: ServerConfig) -> Self {
        let context = Arc::new(HandlerContext::new(config));
        let handler = RequestHandler::new(Arc::clone(&context));
        Self { handler, context }
    }

    /// Returns the server's replica of `dbid`, if a client has created it.
    pub fn database(&self, dbid: &DbId) -> Option<Arc<MemoryDatabase>> {
        self.context.database(dbid)
    }

    /// Returns how many databases the server holds.
    pub fn database_count(&self) -> usize {
        self.context.database_count()
    }

    /// Returns how far `site_id` has reported applying the server's stream.
    pub fn pulled_through(&self, dbid: &DbId, site_id: &SiteId) -> Checkpoint {
        self.handler.pulled_through(dbid, site_id)
    }

    /// Decodes a request for `path`, handles it and encodes the response.
    pub async fn dispatch(
        &self,
        path: &str,
        content_type: ContentType,
        body: &[u8],
    ) -> ServerResult<Vec<u8>> {
        let path = path.trim_end_matches('/');
        match path {
            "/sync/create-or-migrate" => {
                let response = self
                    .handler
                    .handle_create_or_migrate(decode(content_type, body)?)?;
                Ok(encode(content_type, &response)?)
            }
            "/sync/apply" => {
                let response = self.handler.handle_push(decode(content_type, body)?).await?;
                Ok(encode(content_type, &response)?)
            }
            "/sync/changes" | "/sync/stream" => {
                let response = self.handler.handle_pull(decode(content_type, body)?).await?;
                Ok(encode(content_type, &response)?)
            }
            "/sync/last-seen" => {
                let response = self
                    .handler
                    .handle_last_seen(decode(content_type, body)?)
                    .await?;
                Ok(encode(content_type, &response)?)
            }
            other => Err(ServerError::NotFound(other.to_string())),
        }
    }
}

#[async_trait]
impl LoopbackServer for SyncServer {
    async fn handle_post(
        &self,
        path: &str,
        content_type: ContentType,
        body: &[u8],
    ) -> Result<Vec<u8>, HttpError> {
        self.dispatch(path, content_type, body).await.map_err(|e| {
            if e.is_server_error() {
                warn!(path, error = %e, "request failed");
            } else {
                debug!(path, error = %e, "request rejected");
            }
            HttpError::with_status(e.status(), e.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crsync_engine::{HttpTransport, LoopbackClient, Transport};
    use crsync_protocol::{
        ChangeRecord, CreateOrMigrateRequest, CreateOrMigrateResponse, Endpoints, FailureKind,
        PullRequest, PullResponse, PushRequest, PushResponse,
    };

    #[test]
    fn server_lifecycle() {
        let server = SyncServer::new(ServerConfig::default());
        assert_eq!(server.database_count(), 0);
        assert!(server.database(&DbId::new()).is_none());
    }

    #[tokio::test]
    async fn full_sync_flow() {
        for content_type in [ContentType::Json, ContentType::Binary] {
            let server = SyncServer::new(ServerConfig::default());
            let dbid = DbId::new();
            let alice = SiteId::new();

            let body = encode(content_type, &CreateOrMigrateRequest { dbid, site_id: alice })
                .unwrap();
            let created: CreateOrMigrateResponse = decode(
                content_type,
                &server
                    .dispatch("/sync/create-or-migrate", content_type, &body)
                    .await
                    .unwrap(),
            )
            .unwrap();

            let change = ChangeRecord::insert("todo", vec![1], vec![1], 1, alice).at(1, 0);
            let body = encode(content_type, &PushRequest::new(dbid, alice, vec![change])).unwrap();
            let pushed: PushResponse = decode(
                content_type,
                &server.dispatch("/sync/apply", content_type, &body).await.unwrap(),
            )
            .unwrap();
            assert_eq!(pushed.checkpoint, Checkpoint::new(1, 0));

            let body = encode(
                content_type,
                &PullRequest::new(dbid, SiteId::new(), Checkpoint::ZERO, 10),
            )
            .unwrap();
            let pulled: PullResponse = decode(
                content_type,
                &server.dispatch("/sync/changes", content_type, &body).await.unwrap(),
            )
            .unwrap();
            assert_eq!(pulled.site_id, created.site_id);
            assert_eq!(pulled.changes.len(), 1);
        }
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let server = SyncServer::new(ServerConfig::default());
        let result = server.dispatch("/sync/nope", ContentType::Json, b"{}").await;
        assert!(matches!(result, Err(ServerError::NotFound(_))));
    }

    #[tokio::test]
    async fn garbage_body_is_a_client_error() {
        let server = SyncServer::new(ServerConfig::default());
        let result = server
            .dispatch("/sync/apply", ContentType::Json, b"not json")
            .await;
        match result {
            Err(e) => assert!(e.is_client_error()),
            Ok(_) => panic!("garbage body accepted"),
        }
    }

    #[tokio::test]
    async fn loopback_errors_carry_a_status() {
        let server = SyncServer::new(ServerConfig::default());
        let error = server
            .handle_post("/elsewhere", ContentType::Binary, &[])
            .await
            .unwrap_err();
        assert_eq!(error.status, Some(404));
        assert!(error.message.contains("/elsewhere"));
        assert!(error.is_client_error());
    }

    #[tokio::test]
    async fn out_of_order_push_is_rejected_as_a_protocol_error() {
        let server = Arc::new(SyncServer::new(ServerConfig::default()));
        let transport = HttpTransport::new(
            Endpoints::new("loopback://server"),
            ContentType::Json,
            LoopbackClient::new(Arc::clone(&server)),
        );
        let dbid = DbId::new();
        let alice = SiteId::new();
        transport
            .create_or_migrate(&CreateOrMigrateRequest { dbid, site_id: alice })
            .await
            .unwrap();

        let changes = vec![
            ChangeRecord::insert("todo", vec![1], vec![1], 3, alice).at(3, 0),
            ChangeRecord::insert("todo", vec![2], vec![2], 2, alice).at(2, 0),
        ];
        let err = transport
            .push(&PushRequest::new(dbid, alice, changes))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Protocol);
        assert!(!err.is_retryable());
        assert!(server.database(&dbid).unwrap().rows().is_empty());
    }
}
