//! Board client: optimistic edits, debounced batch commits, push events.
//!
//! Provides:
//! - Connection lifecycle for the commit channel (request/response)
//! - A debounced batch scheduler over the session's change queue
//! - Rollback on any commit failure (conflict and transport alike)
//! - A subscribe task with automatic reconnect + backoff for push events
//!
//! The scheduling contract: an edit arms the debounce timer unless one is
//! already armed; when it fires, the pending queue is submitted as one
//! commit fenced by the last-known version. At most one commit is ever
//! outstanding — edits made meanwhile wait for the next batch. A successful
//! commit with a non-empty residual queue flushes again immediately; any
//! failure discards the queue, restores the pre-batch snapshot, and stops
//! until the caller re-syncs.

use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use plank_core::{Board, BoardMeta, Change, ChangeError};

use crate::protocol::{
    ClientRequest, CommitRequest, ProtocolError, PushEvent, ServerReply, WireFailure,
};
use crate::session::EditorSession;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server URL, e.g. `ws://127.0.0.1:9191`
    pub server_url: String,
    /// Debounce delay between the first queued edit and the commit
    pub debounce: Duration,
    /// Upper bound on a commit round-trip before it counts as failed
    pub commit_timeout: Duration,
    /// Initial reconnect delay for the push channel
    pub reconnect_base: Duration,
    /// Reconnect delay ceiling
    pub reconnect_max: Duration,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9191".to_string(),
            debounce: Duration::from_millis(500),
            commit_timeout: Duration::from_secs(10),
            reconnect_base: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(15),
        }
    }
}

/// Events emitted to the embedding application.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Push channel acknowledged by the server
    PushConnected,
    /// Push channel lost; reconnecting with backoff
    PushDisconnected,
    /// A peer committed; re-fetch to see version `version`
    PeerUpdate { version: u64 },
    /// Our batch was applied
    BatchCommitted { new_version: u64 },
    /// Our batch was rejected and local state rolled back; the session must
    /// re-sync (`refresh`) before editing again
    RolledBack { failure: WireFailure },
}

/// Client errors.
#[derive(Debug)]
pub enum ClientError {
    NotConnected,
    NoBoardOpen,
    Transport(String),
    Protocol(ProtocolError),
    /// The server answered with a typed failure
    Rejected(WireFailure),
    /// The server answered with the wrong reply shape
    UnexpectedReply,
    /// A change that does not apply to the local board (caller bug)
    Change(ChangeError),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::NotConnected => write!(f, "not connected to the server"),
            ClientError::NoBoardOpen => write!(f, "no board is open in this session"),
            ClientError::Transport(e) => write!(f, "transport error: {e}"),
            ClientError::Protocol(e) => write!(f, "protocol error: {e}"),
            ClientError::Rejected(failure) => {
                write!(f, "request rejected ({}): {}", failure.kind, failure.message)
            }
            ClientError::UnexpectedReply => write!(f, "unexpected reply from server"),
            ClientError::Change(e) => write!(f, "change not applicable: {e}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        ClientError::Protocol(e)
    }
}

impl From<ChangeError> for ClientError {
    fn from(e: ChangeError) -> Self {
        ClientError::Change(e)
    }
}

/// Cancellable, replaceable debounce handle.
///
/// Owned by the client; at most one armed timer exists per session. The
/// timer is a plain tokio task, so tests drive it with the paused virtual
/// clock instead of real time.
pub struct DebounceTimer {
    handle: Option<JoinHandle<()>>,
}

impl DebounceTimer {
    pub fn new() -> Self {
        Self { handle: None }
    }

    /// True while an armed timer has not yet fired.
    pub fn is_armed(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Arm the timer: after `delay`, run `task`. Replaces a finished handle;
    /// the caller checks `is_armed` first to keep a single armed timer.
    pub fn arm<F>(&mut self, delay: Duration, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        }));
    }

    /// Cancel a pending timer, if any.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Default for DebounceTimer {
    fn default() -> Self {
        Self::new()
    }
}

struct ClientInner {
    config: ClientConfig,
    identity: Uuid,
    session_id: Uuid,
    session: Mutex<Option<EditorSession>>,
    /// Commit channel; requests are serialized behind this lock.
    sock: Mutex<Option<WsStream>>,
    timer: Mutex<DebounceTimer>,
    push_task: Mutex<Option<JoinHandle<()>>>,
    event_tx: mpsc::Sender<ClientEvent>,
}

/// The board client. One per session; owns the session state, the debounce
/// timer, the commit channel, and the push subscription task.
pub struct BoardClient {
    inner: Arc<ClientInner>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
}

impl BoardClient {
    /// Create a client acting as `identity` (resolved by the caller's
    /// authentication layer).
    pub fn new(identity: Uuid, config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            inner: Arc::new(ClientInner {
                config,
                identity,
                session_id: Uuid::new_v4(),
                session: Mutex::new(None),
                sock: Mutex::new(None),
                timer: Mutex::new(DebounceTimer::new()),
                push_task: Mutex::new(None),
                event_tx,
            }),
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    pub fn session_id(&self) -> Uuid {
        self.inner.session_id
    }

    pub fn identity(&self) -> Uuid {
        self.inner.identity
    }

    pub fn server_url(&self) -> &str {
        &self.inner.config.server_url
    }

    /// Open the commit channel.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let (ws, _) = tokio_tungstenite::connect_async(&self.inner.config.server_url)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        *self.inner.sock.lock().await = Some(ws);
        log::info!(
            "session {} connected to {}",
            self.inner.session_id,
            self.inner.config.server_url
        );
        Ok(())
    }

    /// Stop the timer and the push task, and close the commit channel. Any
    /// in-flight commit is left to resolve on the server; it is not retried.
    pub async fn close(&self) {
        self.inner.timer.lock().await.cancel();
        if let Some(task) = self.inner.push_task.lock().await.take() {
            task.abort();
        }
        if let Some(mut ws) = self.inner.sock.lock().await.take() {
            let _ = ws.close(None).await;
        }
        *self.inner.session.lock().await = None;
    }

    /// Create a board owned by this client's identity.
    pub async fn create_board(&self, name: &str) -> Result<Uuid, ClientError> {
        let board_id = Uuid::new_v4();
        let reply = Self::request_reply(
            &self.inner,
            &ClientRequest::CreateBoard {
                board_id,
                name: name.to_string(),
                identity: self.inner.identity,
            },
        )
        .await?;
        match reply {
            ServerReply::Done => Ok(board_id),
            ServerReply::Failure(f) => Err(ClientError::Rejected(f)),
            _ => Err(ClientError::UnexpectedReply),
        }
    }

    /// List boards owned by this client's identity.
    pub async fn list_boards(&self) -> Result<Vec<BoardMeta>, ClientError> {
        let reply = Self::request_reply(
            &self.inner,
            &ClientRequest::ListBoards {
                identity: self.inner.identity,
            },
        )
        .await?;
        match reply {
            ServerReply::BoardList(metas) => Ok(metas),
            ServerReply::Failure(f) => Err(ClientError::Rejected(f)),
            _ => Err(ClientError::UnexpectedReply),
        }
    }

    /// Fetch a board without opening it.
    pub async fn fetch_board(&self, board_id: Uuid) -> Result<Board, ClientError> {
        let reply = Self::request_reply(
            &self.inner,
            &ClientRequest::FetchBoard {
                board_id,
                identity: self.inner.identity,
            },
        )
        .await?;
        match reply {
            ServerReply::Board(board) => Ok(board),
            ServerReply::Failure(f) => Err(ClientError::Rejected(f)),
            _ => Err(ClientError::UnexpectedReply),
        }
    }

    /// Open a board view: fetch the authoritative state, start the editing
    /// session, and subscribe to peer updates.
    pub async fn open_board(&self, board_id: Uuid) -> Result<(), ClientError> {
        let board = self.fetch_board(board_id).await?;
        *self.inner.session.lock().await =
            Some(EditorSession::new(self.inner.session_id, board));

        let mut push_task = self.inner.push_task.lock().await;
        if let Some(old) = push_task.take() {
            old.abort();
        }
        *push_task = Some(Self::spawn_push_task(self.inner.clone(), board_id));
        Ok(())
    }

    /// Re-fetch the open board and adopt the server state. Required after a
    /// `RolledBack` event before editing again.
    pub async fn refresh(&self) -> Result<(), ClientError> {
        let board_id = {
            let guard = self.inner.session.lock().await;
            guard.as_ref().ok_or(ClientError::NoBoardOpen)?.board().id
        };
        let board = self.fetch_board(board_id).await?;
        let mut guard = self.inner.session.lock().await;
        let session = guard.as_mut().ok_or(ClientError::NoBoardOpen)?;
        session.resync(board);
        Ok(())
    }

    /// Current local board state (optimistic).
    pub async fn board(&self) -> Result<Board, ClientError> {
        let guard = self.inner.session.lock().await;
        Ok(guard.as_ref().ok_or(ClientError::NoBoardOpen)?.board().clone())
    }

    /// Changes queued but not yet committed.
    pub async fn pending_len(&self) -> usize {
        let guard = self.inner.session.lock().await;
        guard.as_ref().map_or(0, EditorSession::pending_len)
    }

    /// Record a user edit: apply it locally right away and schedule a batch
    /// commit if no timer is already running.
    pub async fn edit(&self, change: Change) -> Result<(), ClientError> {
        {
            let mut guard = self.inner.session.lock().await;
            let session = guard.as_mut().ok_or(ClientError::NoBoardOpen)?;
            session.enqueue(change)?;
        }

        let mut timer = self.inner.timer.lock().await;
        if !timer.is_armed() {
            let inner = self.inner.clone();
            // The timer task only sleeps and hands off; the flush runs
            // detached so `is_armed` turns false the moment the delay ends
            // and later edits can arm the next window.
            timer.arm(self.inner.config.debounce, async move {
                tokio::spawn(Self::run_flush(inner));
            });
        }
        Ok(())
    }

    /// Submit the pending queue immediately, bypassing the debounce delay.
    pub async fn flush(&self) {
        self.inner.timer.lock().await.cancel();
        Self::run_flush(self.inner.clone()).await;
    }

    /// The flush loop: one batch in flight at a time; keeps going while a
    /// successful commit leaves entries behind in the queue.
    async fn run_flush(inner: Arc<ClientInner>) {
        loop {
            let (board_id, expected_version, changes) = {
                let mut guard = inner.session.lock().await;
                let Some(session) = guard.as_mut() else { return };
                let Some(changes) = session.take_batch() else { return };
                (session.board().id, session.expected_version(), changes)
            };

            let request = ClientRequest::Commit(CommitRequest {
                board_id,
                session_id: inner.session_id,
                identity: inner.identity,
                expected_version,
                changes,
            });

            let outcome = tokio::time::timeout(
                inner.config.commit_timeout,
                Self::request_reply(&inner, &request),
            )
            .await;

            // A timed-out or broken exchange leaves the socket mid-stream;
            // a late reply would desync the next request. Force a reconnect.
            if matches!(outcome, Err(_) | Ok(Err(ClientError::Transport(_)))) {
                *inner.sock.lock().await = None;
            }

            let (event, reschedule) = {
                let mut guard = inner.session.lock().await;
                let Some(session) = guard.as_mut() else { return };
                match outcome {
                    Ok(Ok(ServerReply::CommitOk { new_version })) => {
                        let reschedule = session.batch_committed(new_version);
                        (ClientEvent::BatchCommitted { new_version }, reschedule)
                    }
                    Ok(Ok(ServerReply::Failure(failure))) => {
                        session.batch_rejected();
                        log::warn!(
                            "batch rejected ({}): {} — rolled back",
                            failure.kind,
                            failure.message
                        );
                        (ClientEvent::RolledBack { failure }, false)
                    }
                    Ok(Ok(_)) => {
                        session.batch_rejected();
                        let failure = WireFailure::new(
                            crate::protocol::FailureKind::Internal,
                            "unexpected reply to commit",
                        );
                        (ClientEvent::RolledBack { failure }, false)
                    }
                    Ok(Err(e)) => {
                        session.batch_rejected();
                        log::warn!("commit transport failure: {e} — rolled back");
                        let failure = WireFailure::new(
                            crate::protocol::FailureKind::Internal,
                            e.to_string(),
                        );
                        (ClientEvent::RolledBack { failure }, false)
                    }
                    Err(_) => {
                        session.batch_rejected();
                        log::warn!("commit timed out — rolled back");
                        let failure = WireFailure::new(
                            crate::protocol::FailureKind::Internal,
                            "commit timed out",
                        );
                        (ClientEvent::RolledBack { failure }, false)
                    }
                }
            };

            // A rejection leaves nothing to flush; a timer armed by edits
            // that arrived mid-flight must not fire into the next window.
            if matches!(event, ClientEvent::RolledBack { .. }) {
                inner.timer.lock().await.cancel();
            }

            let _ = inner.event_tx.send(event).await;
            if !reschedule {
                return;
            }
        }
    }

    /// Send one request and read its reply on the commit channel.
    async fn request_reply(
        inner: &ClientInner,
        request: &ClientRequest,
    ) -> Result<ServerReply, ClientError> {
        let mut guard = inner.sock.lock().await;
        let ws = guard.as_mut().ok_or(ClientError::NotConnected)?;

        let frame = request.encode()?;
        ws.send(Message::Binary(frame.into()))
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    let bytes: Vec<u8> = data.into();
                    return Ok(ServerReply::decode(&bytes)?);
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => return Err(ClientError::Transport(e.to_string())),
            }
        }
        Err(ClientError::Transport("connection closed".into()))
    }

    /// Long-lived push subscription with reconnect + exponential backoff.
    fn spawn_push_task(inner: Arc<ClientInner>, board_id: Uuid) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut backoff = inner.config.reconnect_base;
            loop {
                match tokio_tungstenite::connect_async(&inner.config.server_url).await {
                    Ok((mut ws, _)) => {
                        let subscribe = ClientRequest::Subscribe {
                            board_id,
                            session_id: inner.session_id,
                        };
                        let frame = match subscribe.encode() {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::error!("cannot encode subscribe request: {e}");
                                return;
                            }
                        };
                        if ws.send(Message::Binary(frame.into())).await.is_ok() {
                            while let Some(msg) = ws.next().await {
                                match msg {
                                    Ok(Message::Text(text)) => {
                                        for line in text.lines() {
                                            match PushEvent::from_line(line) {
                                                Ok(PushEvent::Connected) => {
                                                    backoff = inner.config.reconnect_base;
                                                    let _ = inner
                                                        .event_tx
                                                        .send(ClientEvent::PushConnected)
                                                        .await;
                                                }
                                                Ok(PushEvent::DocumentUpdated { version }) => {
                                                    let _ = inner
                                                        .event_tx
                                                        .send(ClientEvent::PeerUpdate { version })
                                                        .await;
                                                }
                                                Err(e) => {
                                                    log::warn!("bad push record: {e}");
                                                }
                                            }
                                        }
                                    }
                                    Ok(Message::Close(_)) | Err(_) => break,
                                    Ok(_) => {}
                                }
                            }
                            let _ = inner.event_tx.send(ClientEvent::PushDisconnected).await;
                        }
                    }
                    Err(e) => {
                        log::debug!("push reconnect failed: {e}");
                    }
                }

                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(inner.config.reconnect_max);
            }
        })
    }
}
