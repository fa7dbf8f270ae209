//! Connection gateway: handshake, authentication and inbound routing.
//!
//! ```text
//! TCP ──► WS handshake ──(Origin allowed?)──no──► HTTP 403
//!                │ yes
//!                ▼
//!          Authenticator ──AuthError──► Close(1008)
//!                │ (userId, role)
//!                ▼
//!          SessionHandle ──► session-ready ──► reader loop ◄── frames
//!                 │                               │
//!                 │ outbox   join/leave ─► RoomRegistry
//!                 ▼          edit/chat/cursor/sync ─► room actor
//!            writer task     claim-session ─► ClaimBook
//!                 │
//!                 ▼
//!               frames
//! ```
//!
//! The writer drains the session's outbox on its own task, so a slow join
//! or store load on the reader side never holds back outbound events.

use futures_util::{Sink, SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, ORIGIN};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::auth::{AuthError, Authenticator, Credentials};
use crate::claims::{ClaimBook, ClaimError};
use crate::protocol::{ClientEvent, RoomId, ServerEvent, SessionId};
use crate::registry::RoomRegistry;
use crate::relay::Outbox;
use crate::session::SessionHandle;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("origin {0:?} is not allowed")]
    OriginRejected(Option<String>),
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Trusted `Origin` values. Empty admits every origin.
    pub allowed_origins: Vec<String>,
    pub outbox_capacity: usize,
    pub idle_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["http://localhost:5173".to_string()],
            outbox_capacity: 256,
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Gateway counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayStats {
    pub total_connections: u64,
    pub active_sessions: usize,
    pub rejected_origins: u64,
    pub auth_failures: u64,
    pub messages: u64,
    pub malformed: u64,
}

#[derive(Default)]
struct Counters {
    connections: AtomicU64,
    rejected_origins: AtomicU64,
    auth_failures: AtomicU64,
    messages: AtomicU64,
    malformed: AtomicU64,
}

struct Connected {
    handle: SessionHandle,
    rooms: HashSet<RoomId>,
}

pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<RoomRegistry>,
    auth: Arc<dyn Authenticator>,
    claims: Arc<ClaimBook>,
    sessions: RwLock<HashMap<SessionId, Connected>>,
    counters: Counters,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        registry: Arc<RoomRegistry>,
        auth: Arc<dyn Authenticator>,
        claims: Arc<ClaimBook>,
    ) -> Self {
        Self {
            config,
            registry,
            auth,
            claims,
            sessions: RwLock::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn claims(&self) -> &Arc<ClaimBook> {
        &self.claims
    }

    // ─── Session lifecycle ────────────────────────────────────────────

    pub fn check_origin(&self, origin: Option<&str>) -> Result<(), GatewayError> {
        if self.config.allowed_origins.is_empty() {
            return Ok(());
        }
        let allowed = origin.is_some_and(|o| {
            let o = o.trim_end_matches('/');
            self.config
                .allowed_origins
                .iter()
                .any(|a| a.trim_end_matches('/').eq_ignore_ascii_case(o))
        });
        if allowed {
            Ok(())
        } else {
            self.counters.rejected_origins.fetch_add(1, Ordering::Relaxed);
            log::warn!("rejected connection from origin {origin:?}");
            Err(GatewayError::OriginRejected(origin.map(str::to_string)))
        }
    }

    /// Authenticate and register a session. Nothing is created on failure.
    pub async fn connect(
        &self,
        origin: Option<&str>,
        credentials: &Credentials,
    ) -> Result<SessionHandle, GatewayError> {
        self.check_origin(origin)?;
        let identity = match self.auth.authenticate(credentials).await {
            Ok(identity) => identity,
            Err(e) => {
                self.counters.auth_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("authentication failed: {e}");
                return Err(e.into());
            }
        };

        let handle = SessionHandle::new(identity.user_id, identity.role, self.config.outbox_capacity);
        handle.send(handle.ready_event());
        self.counters.connections.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "session {} connected: {} ({}, replica {})",
            handle.id,
            handle.user_id,
            handle.role,
            handle.replica
        );
        self.sessions.write().await.insert(
            handle.id,
            Connected {
                handle: handle.clone(),
                rooms: HashSet::new(),
            },
        );
        Ok(handle)
    }

    /// Remove a session from every room it joined and close its outbox.
    pub async fn disconnect(&self, session: SessionId) -> bool {
        let Some(connected) = self.sessions.write().await.remove(&session) else {
            return false;
        };
        for room in &connected.rooms {
            self.registry.leave_room(session, room).await;
        }
        connected.handle.outbox.close();
        log::info!(
            "session {session} disconnected ({} room(s) left)",
            connected.rooms.len()
        );
        true
    }

    pub async fn session(&self, session: SessionId) -> Option<SessionHandle> {
        self.sessions
            .read()
            .await
            .get(&session)
            .map(|c| c.handle.clone())
    }

    pub async fn joined_rooms(&self, session: SessionId) -> Vec<RoomId> {
        let sessions = self.sessions.read().await;
        let mut rooms: Vec<RoomId> = sessions
            .get(&session)
            .map(|c| c.rooms.iter().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    pub async fn stats(&self) -> GatewayStats {
        GatewayStats {
            total_connections: self.counters.connections.load(Ordering::Relaxed),
            active_sessions: self.sessions.read().await.len(),
            rejected_origins: self.counters.rejected_origins.load(Ordering::Relaxed),
            auth_failures: self.counters.auth_failures.load(Ordering::Relaxed),
            messages: self.counters.messages.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
        }
    }

    // ─── Inbound routing ──────────────────────────────────────────────

    fn malformed(&self, session: SessionId, what: &dyn std::fmt::Display) {
        self.counters.malformed.fetch_add(1, Ordering::Relaxed);
        log::warn!("session {session}: dropped malformed input: {what}");
    }

    /// Decode and route one text frame. Bad frames are counted and dropped.
    pub async fn handle_text(&self, session: SessionId, text: &str) -> Result<(), GatewayError> {
        self.counters.messages.fetch_add(1, Ordering::Relaxed);
        match ClientEvent::decode(text) {
            Ok(event) => self.handle_event(session, event).await,
            Err(e) => {
                self.malformed(session, &e);
                Ok(())
            }
        }
    }

    pub async fn handle_event(&self, session: SessionId, event: ClientEvent) -> Result<(), GatewayError> {
        let (handle, rooms) = {
            let sessions = self.sessions.read().await;
            let connected = sessions
                .get(&session)
                .ok_or(GatewayError::UnknownSession(session))?;
            (connected.handle.clone(), connected.rooms.clone())
        };
        if let Some(room_id) = event.room_id() {
            let joins = matches!(event, ClientEvent::JoinRoom { .. });
            if !joins && !rooms.contains(room_id) {
                log::debug!("session {session}: event for unjoined room {room_id} ignored");
                return Ok(());
            }
        }

        match event {
            ClientEvent::JoinRoom { room_id } => match self.registry.join_room(&handle, &room_id).await {
                Ok(_) => {
                    if let Some(connected) = self.sessions.write().await.get_mut(&session) {
                        connected.rooms.insert(room_id);
                    }
                }
                Err(e) => self.malformed(session, &e),
            },
            ClientEvent::LeaveRoom { room_id } => {
                if let Some(connected) = self.sessions.write().await.get_mut(&session) {
                    connected.rooms.remove(&room_id);
                }
                self.registry.leave_room(session, &room_id).await;
            }
            ClientEvent::EditOp(edit) => {
                let room_id = edit.room_id.clone();
                match edit.into_operation() {
                    Ok(op) if op.origin() == handle.replica => {
                        self.deliver(&handle, &room_id, || {
                            self.registry.apply(session, &room_id, op.clone())
                        })
                        .await;
                    }
                    Ok(op) => self.malformed(
                        session,
                        &format!("operation {} claims replica {}, session owns {}", op.id(), op.origin(), handle.replica),
                    ),
                    Err(e) => self.malformed(session, &e),
                }
            }
            ClientEvent::ChatMessage(message) => {
                let room_id = message.room_id;
                self.deliver(&handle, &room_id, || {
                    self.registry.chat(session, &room_id, message.content.clone())
                })
                .await;
            }
            ClientEvent::Cursor { room_id, cursor } => {
                self.deliver(&handle, &room_id, || self.registry.touch(session, &room_id, cursor))
                    .await;
            }
            ClientEvent::SyncRequest { room_id } => {
                // a rejoin queues a snapshot of its own
                if !self.registry.sync_request(session, &room_id).await {
                    self.rejoin(&handle, &room_id).await;
                }
            }
            ClientEvent::Heartbeat => {
                for room_id in &rooms {
                    self.deliver(&handle, room_id, || self.registry.heartbeat(session, room_id))
                        .await;
                }
            }
            ClientEvent::ClaimSession { room_id, post_id } => {
                self.claim(&handle, room_id, post_id).await;
            }
        }
        Ok(())
    }

    /// Run a room-scoped `send`. A room that retired while the session
    /// still counted as a member is joined again, which queues a fresh
    /// snapshot, and the send repeated. The room is forgotten if that fails.
    async fn deliver<F, Fut>(&self, handle: &SessionHandle, room_id: &str, send: F)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = bool>,
    {
        if !send().await && self.rejoin(handle, room_id).await {
            send().await;
        }
    }

    async fn rejoin(&self, handle: &SessionHandle, room_id: &str) -> bool {
        log::info!("session {}: room {room_id} retired underneath it, rejoining", handle.id);
        match self.registry.join_room(handle, room_id).await {
            Ok(_) => true,
            Err(e) => {
                log::warn!("session {}: rejoin of {room_id} failed: {e}", handle.id);
                if let Some(connected) = self.sessions.write().await.get_mut(&handle.id) {
                    connected.rooms.remove(room_id);
                }
                false
            }
        }
    }

    async fn claim(&self, handle: &SessionHandle, room_id: RoomId, post_id: String) {
        match self
            .claims
            .claim(&room_id, &post_id, &handle.user_id, handle.role)
            .await
        {
            Ok(claim) => {
                let event = ServerEvent::SessionClaimed {
                    room_id: room_id.clone(),
                    post_id,
                    mentor_id: claim.mentor_id,
                };
                self.registry.announce(&room_id, event).await;
            }
            Err(e) => {
                log::info!("claim by {} rejected: {e}", handle.user_id);
                let holder = match &e {
                    ClaimError::AlreadyClaimed { holder, .. } => holder.clone(),
                    ClaimError::NotMentor => self.claims.holder(&post_id).unwrap_or_default(),
                };
                handle.send(ServerEvent::ClaimRejected {
                    room_id,
                    post_id,
                    reason: e.reason().to_string(),
                    holder,
                });
            }
        }
    }

    // ─── Transport ────────────────────────────────────────────────────

    /// Run one WebSocket connection to completion.
    pub async fn serve_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<(), GatewayError> {
        let mut origin: Option<String> = None;
        let mut credentials = Credentials::none();
        let mut origin_rejected = false;

        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let header = request
                .headers()
                .get(ORIGIN)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            if self.check_origin(header.as_deref()).is_err() {
                origin_rejected = true;
                let mut refusal = ErrorResponse::new(Some("origin not allowed".to_string()));
                *refusal.status_mut() = StatusCode::FORBIDDEN;
                return Err(refusal);
            }
            credentials = extract_credentials(request);
            origin = header;
            Ok(response)
        };

        let handshake = tokio_tungstenite::accept_hdr_async(stream, callback).await;
        let ws_stream = match handshake {
            Ok(ws) => ws,
            Err(_) if origin_rejected => return Err(GatewayError::OriginRejected(None)),
            Err(e) => return Err(GatewayError::Handshake(e.to_string())),
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let session = match self.connect(origin.as_deref(), &credentials).await {
            Ok(session) => session,
            Err(e) => {
                let frame = CloseFrame {
                    code: CloseCode::Policy,
                    reason: e.to_string().into(),
                };
                let _ = ws_sender.send(Message::Close(Some(frame))).await;
                return Err(e);
            }
        };
        log::debug!("session {} bound to {addr}", session.id);

        let (frames, frame_rx) = mpsc::unbounded_channel();
        let mut writer = tokio::spawn(write_frames(ws_sender, session.outbox.clone(), frame_rx));
        let mut writer_done = false;

        let idle = self.config.idle_timeout;
        let mut deadline = Instant::now() + idle;
        loop {
            tokio::select! {
                incoming = ws_receiver.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            deadline = Instant::now() + idle;
                            if self.handle_text(session.id, &text).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Binary(_))) => {
                            deadline = Instant::now() + idle;
                            self.malformed(session.id, &"binary frame");
                        }
                        Some(Ok(Message::Ping(data))) => {
                            deadline = Instant::now() + idle;
                            if frames.send(Message::Pong(data)).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {
                            deadline = Instant::now() + idle;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::debug!("session {}: transport error: {e}", session.id);
                            break;
                        }
                    }
                }
                _ = &mut writer => {
                    writer_done = true;
                    break;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    log::info!("session {}: idle for {idle:?}, disconnecting", session.id);
                    break;
                }
            }
        }

        self.disconnect(session.id).await;
        drop(frames);
        if !writer_done {
            let _ = writer.await;
        }
        Ok(())
    }
}

/// Write control frames and outbox events until either source ends or the
/// socket fails, then close the sink.
async fn write_frames<S>(mut sink: S, outbox: Outbox, mut frames: mpsc::UnboundedReceiver<Message>)
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        let message = tokio::select! {
            biased;
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            event = outbox.next() => {
                let Some(event) = event else { break };
                match event.encode() {
                    Ok(text) => Message::Text(text.into()),
                    Err(e) => {
                        log::error!("failed to encode {event:?}: {e}");
                        continue;
                    }
                }
            }
        };
        if let Err(e) = sink.send(message).await {
            log::debug!("write failed: {e}");
            break;
        }
    }
    let _ = sink.close().await;
}

/// Pull a token from `Authorization: Bearer` or the `token` query parameter.
fn extract_credentials(request: &Request) -> Credentials {
    let bearer = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string());
    let query = request.uri().query().and_then(|q| {
        q.split('&')
            .find_map(|pair| pair.strip_prefix("token="))
            .map(str::to_string)
    });
    Credentials {
        token: bearer.or(query),
    }
}
