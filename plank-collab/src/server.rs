//! WebSocket sync server: commit routing plus per-board push fanout.
//!
//! Architecture:
//! ```text
//! Session A ──┐                    ┌── MutationProcessor ── BoardStore (RocksDB)
//!             ├── SyncServer ──────┤
//! Session B ──┘   (one task per    └── FanoutHub
//!                  connection)          │
//!                        ┌──────────────┴──────────────┐
//!                        ▼                             ▼
//!                  Session B (push)              Session C (push)
//! ```
//!
//! A connection serves either role: request/response frames (commits,
//! fetches, board CRUD) until a `Subscribe` frame switches it into push
//! mode for one `(board, session)` pair. Push connections receive newline-
//! delimited JSON records, starting with a connectivity acknowledgment.
//!
//! A successful commit replies to its caller first; fanout to peers is
//! fire-and-forget and can neither delay nor fail the commit.

use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::fanout::FanoutHub;
use crate::mutation::{CommitError, MutationProcessor};
use crate::protocol::{ClientRequest, FailureKind, PushEvent, ServerReply};
use crate::storage::{BoardStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Events buffered per push subscriber
    pub fanout_capacity: usize,
    /// Board store settings (path, caches)
    pub store: StoreConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9191".to_string(),
            fanout_capacity: 64,
            store: StoreConfig::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub commits_applied: u64,
    pub commits_conflicted: u64,
    pub commits_rejected: u64,
}

/// Publish instruction produced by a successful commit, executed after the
/// reply frame has gone out.
struct PublishAfter {
    board_id: Uuid,
    origin_session: Uuid,
    version: u64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    processor: Arc<MutationProcessor>,
    hub: Arc<FanoutHub>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server, opening (or creating) the board store.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store = Arc::new(BoardStore::open(config.store.clone())?);
        let hub = Arc::new(FanoutHub::new(config.fanout_capacity));
        Ok(Self {
            processor: Arc::new(MutationProcessor::new(store)),
            hub,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            config,
        })
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("sync server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let processor = self.processor.clone();
            let hub = self.hub.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, processor, hub, stats).await
                {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        processor: Arc<MutationProcessor>,
        hub: Arc<FanoutHub>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Set once this connection subscribes as a push channel.
        let mut subscription: Option<(Uuid, Uuid)> = None;
        let mut push_rx: Option<mpsc::Receiver<PushEvent>> = None;

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            let request = match ClientRequest::decode(&bytes) {
                                Ok(request) => request,
                                Err(e) => {
                                    log::warn!("failed to decode request from {addr}: {e}");
                                    let reply = ServerReply::failure(
                                        FailureKind::Validation,
                                        "malformed request frame",
                                    );
                                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                    continue;
                                }
                            };

                            match request {
                                ClientRequest::Subscribe { board_id, session_id } => {
                                    if let Some((b, s)) = subscription.take() {
                                        hub.unsubscribe(b, s).await;
                                    }
                                    push_rx = Some(hub.subscribe(board_id, session_id).await);
                                    subscription = Some((board_id, session_id));

                                    let ack = PushEvent::Connected.to_line()?;
                                    ws_sender.send(Message::Text(ack.into())).await?;
                                    log::info!(
                                        "session {session_id} watching board {board_id} from {addr}"
                                    );
                                }

                                request => {
                                    let (reply, publish) =
                                        Self::handle_request(&processor, &stats, request).await;
                                    ws_sender
                                        .send(Message::Binary(reply.encode()?.into()))
                                        .await?;

                                    // Fanout after the caller has its reply.
                                    if let Some(p) = publish {
                                        let reached = hub
                                            .publish(
                                                p.board_id,
                                                p.origin_session,
                                                PushEvent::DocumentUpdated { version: p.version },
                                            )
                                            .await;
                                        log::debug!(
                                            "board {} update v{} fanned out to {reached} peer(s)",
                                            p.board_id,
                                            p.version
                                        );
                                    }
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing push event for a subscribed connection
                event = async {
                    if let Some(ref mut rx) = push_rx {
                        rx.recv().await
                    } else {
                        // Not subscribed — wait forever
                        std::future::pending().await
                    }
                } => {
                    match event {
                        Some(event) => {
                            ws_sender.send(Message::Text(event.to_line()?.into())).await?;
                        }
                        // Sender gone: a newer connection took over this
                        // session's registration — it is not ours to remove.
                        None => {
                            subscription = None;
                            break;
                        }
                    }
                }
            }
        }

        // Cleanup: deregister the push channel whatever ended the connection.
        if let Some((board_id, session_id)) = subscription {
            hub.unsubscribe(board_id, session_id).await;
        }
        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
        }

        Ok(())
    }

    /// Route one request/response frame. Returns the reply plus, for a
    /// successful commit, the fanout to perform after replying.
    async fn handle_request(
        processor: &MutationProcessor,
        stats: &RwLock<ServerStats>,
        request: ClientRequest,
    ) -> (ServerReply, Option<PublishAfter>) {
        match request {
            ClientRequest::Commit(req) => {
                let result = processor
                    .commit(req.board_id, req.identity, &req.changes, req.expected_version)
                    .await;
                match result {
                    Ok(new_version) => {
                        stats.write().await.commits_applied += 1;
                        (
                            ServerReply::CommitOk { new_version },
                            Some(PublishAfter {
                                board_id: req.board_id,
                                origin_session: req.session_id,
                                version: new_version,
                            }),
                        )
                    }
                    Err(e) => {
                        {
                            let mut s = stats.write().await;
                            if matches!(e, CommitError::Conflict { .. }) {
                                s.commits_conflicted += 1;
                            } else {
                                s.commits_rejected += 1;
                            }
                        }
                        (Self::failure_reply(e), None)
                    }
                }
            }

            ClientRequest::FetchBoard { board_id, identity } => {
                match processor.fetch_board(board_id, identity).await {
                    Ok(board) => (ServerReply::Board(board), None),
                    Err(e) => (Self::failure_reply(e), None),
                }
            }

            ClientRequest::ListBoards { identity } => {
                match processor.list_boards(identity).await {
                    Ok(metas) => (ServerReply::BoardList(metas), None),
                    Err(e) => (Self::failure_reply(e), None),
                }
            }

            ClientRequest::CreateBoard {
                board_id,
                name,
                identity,
            } => match processor.create_board(board_id, &name, identity).await {
                Ok(_) => (ServerReply::Done, None),
                Err(e) => (Self::failure_reply(e), None),
            },

            ClientRequest::RenameBoard {
                board_id,
                name,
                identity,
            } => match processor.rename_board(board_id, &name, identity).await {
                Ok(()) => (ServerReply::Done, None),
                Err(e) => (Self::failure_reply(e), None),
            },

            ClientRequest::DeleteBoard { board_id, identity } => {
                match processor.delete_board(board_id, identity).await {
                    Ok(()) => (ServerReply::Done, None),
                    Err(e) => (Self::failure_reply(e), None),
                }
            }

            // Handled by the connection loop before dispatch.
            ClientRequest::Subscribe { .. } => (
                ServerReply::failure(FailureKind::Validation, "subscribe is connection-scoped"),
                None,
            ),
        }
    }

    /// Map a processor error to its wire form. Internal detail stays in the
    /// server log; the caller gets a generic message.
    fn failure_reply(e: CommitError) -> ServerReply {
        match e {
            CommitError::Conflict { .. } => ServerReply::failure(FailureKind::Conflict, e.to_string()),
            CommitError::NotFound(_) => ServerReply::failure(FailureKind::NotFound, e.to_string()),
            CommitError::Forbidden => ServerReply::failure(FailureKind::Forbidden, e.to_string()),
            CommitError::Validation(_) => {
                ServerReply::failure(FailureKind::Validation, e.to_string())
            }
            CommitError::Storage(err) => {
                log::error!("storage failure during commit: {err}");
                ServerReply::failure(FailureKind::Internal, "internal server error")
            }
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// The mutation processor (shared with tests and embedding code).
    pub fn processor(&self) -> &Arc<MutationProcessor> {
        &self.processor
    }

    /// The fanout hub.
    pub fn hub(&self) -> &Arc<FanoutHub> {
        &self.hub
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &tempfile::TempDir) -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            fanout_capacity: 16,
            store: StoreConfig::for_testing(dir.path().join("db")),
        }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9191");
        assert_eq!(config.fanout_capacity, 64);
    }

    #[tokio::test]
    async fn test_server_creation() {
        let dir = tempfile::tempdir().unwrap();
        let server = SyncServer::new(test_config(&dir)).unwrap();
        assert_eq!(server.bind_addr(), "127.0.0.1:0");

        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.commits_applied, 0);
    }

    #[tokio::test]
    async fn test_handle_request_commit_and_fanout_instruction() {
        let dir = tempfile::tempdir().unwrap();
        let server = SyncServer::new(test_config(&dir)).unwrap();
        let owner = Uuid::new_v4();
        let board_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();

        server
            .processor()
            .create_board(board_id, "b", owner)
            .await
            .unwrap();

        let request = ClientRequest::Commit(crate::protocol::CommitRequest {
            board_id,
            session_id,
            identity: owner,
            expected_version: 0,
            changes: vec![plank_core::Change::AddList {
                list_id: Uuid::new_v4(),
                title: "todo".into(),
            }],
        });

        let (reply, publish) =
            SyncServer::handle_request(server.processor(), &server.stats, request).await;
        assert!(matches!(reply, ServerReply::CommitOk { new_version: 1 }));

        let publish = publish.unwrap();
        assert_eq!(publish.board_id, board_id);
        assert_eq!(publish.origin_session, session_id);
        assert_eq!(publish.version, 1);

        assert_eq!(server.stats().await.commits_applied, 1);
    }

    #[tokio::test]
    async fn test_handle_request_conflict_counts() {
        let dir = tempfile::tempdir().unwrap();
        let server = SyncServer::new(test_config(&dir)).unwrap();
        let owner = Uuid::new_v4();
        let board_id = Uuid::new_v4();

        server
            .processor()
            .create_board(board_id, "b", owner)
            .await
            .unwrap();

        let request = ClientRequest::Commit(crate::protocol::CommitRequest {
            board_id,
            session_id: Uuid::new_v4(),
            identity: owner,
            expected_version: 7,
            changes: vec![plank_core::Change::AddList {
                list_id: Uuid::new_v4(),
                title: "late".into(),
            }],
        });

        let (reply, publish) =
            SyncServer::handle_request(server.processor(), &server.stats, request).await;
        match reply {
            ServerReply::Failure(f) => assert_eq!(f.kind, FailureKind::Conflict),
            other => panic!("expected conflict failure, got {other:?}"),
        }
        assert!(publish.is_none());
        assert_eq!(server.stats().await.commits_conflicted, 1);
    }

    #[tokio::test]
    async fn test_handle_request_fetch_unknown_board() {
        let dir = tempfile::tempdir().unwrap();
        let server = SyncServer::new(test_config(&dir)).unwrap();

        let request = ClientRequest::FetchBoard {
            board_id: Uuid::new_v4(),
            identity: Uuid::new_v4(),
        };
        let (reply, _) =
            SyncServer::handle_request(server.processor(), &server.stats, request).await;
        match reply {
            ServerReply::Failure(f) => assert_eq!(f.kind, FailureKind::NotFound),
            other => panic!("expected not-found failure, got {other:?}"),
        }
    }
}
