//! WebSocket client for the sync server.
//!
//! Thin by intent: it speaks the JSON event protocol and surfaces every
//! server event on a channel. Editors build their operations from the
//! `blocks` of the snapshot they hold: the anchor is the visible block
//! before the cursor and the right id is whatever block, deleted or not,
//! follows that anchor.

use futures_util::{SinkExt, StreamExt};
use pairwise_core::{OpId, Operation};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION, ORIGIN};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ChatMessage, ClientEvent, EditOp, ProtocolError, ServerEvent};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("connection closed")]
    Closed,
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// What the reader task surfaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Server(ServerEvent),
    /// The server closed the socket, with its close code if it sent one.
    Closed(Option<u16>),
}

/// Connection options.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub origin: Option<String>,
    pub token: Option<String>,
}

pub struct SyncClient {
    outgoing: mpsc::Sender<Message>,
    events: Option<mpsc::Receiver<SyncEvent>>,
    state: Arc<RwLock<ConnectionState>>,
}

impl SyncClient {
    /// Connect and spawn the reader and writer tasks.
    pub async fn connect(url: &str, options: ClientOptions) -> Result<Self, ClientError> {
        let mut request = url.into_client_request()?;
        if let Some(origin) = &options.origin {
            request.headers_mut().insert(ORIGIN, header(origin)?);
        }
        if let Some(token) = &options.token {
            request
                .headers_mut()
                .insert(AUTHORIZATION, header(&format!("Bearer {token}"))?);
        }

        let (ws_stream, _) = tokio_tungstenite::connect_async(request).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let state = Arc::new(RwLock::new(ConnectionState::Connected));

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if ws_writer.send(message).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let (event_tx, event_rx) = mpsc::channel(1024);
        let reader_state = state.clone();
        let pong_tx = out_tx.clone();
        tokio::spawn(async move {
            let mut close_code = None;
            while let Some(message) = ws_reader.next().await {
                match message {
                    Ok(Message::Text(text)) => match ServerEvent::decode(&text) {
                        Ok(event) => {
                            if event_tx.send(SyncEvent::Server(event)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("undecodable server event: {e}"),
                    },
                    Ok(Message::Ping(data)) => {
                        let _ = pong_tx.send(Message::Pong(data)).await;
                    }
                    Ok(Message::Close(frame)) => {
                        close_code = frame.map(|f| u16::from(f.code));
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::debug!("client transport error: {e}");
                        break;
                    }
                }
            }
            *reader_state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Closed(close_code)).await;
        });

        Ok(Self {
            outgoing: out_tx,
            events: Some(event_rx),
            state,
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.events.take()
    }

    /// Next event, if the receiver has not been taken.
    pub async fn next_event(&mut self) -> Option<SyncEvent> {
        self.events.as_mut()?.recv().await
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn send(&self, event: &ClientEvent) -> Result<(), ClientError> {
        let text = event.encode()?;
        self.send_raw(text).await
    }

    /// Send an arbitrary text frame.
    pub async fn send_raw(&self, text: String) -> Result<(), ClientError> {
        self.outgoing
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| ClientError::Closed)
    }

    pub async fn join(&self, room_id: &str) -> Result<(), ClientError> {
        self.send(&ClientEvent::JoinRoom {
            room_id: room_id.to_string(),
        })
        .await
    }

    pub async fn leave(&self, room_id: &str) -> Result<(), ClientError> {
        self.send(&ClientEvent::LeaveRoom {
            room_id: room_id.to_string(),
        })
        .await
    }

    pub async fn edit(&self, room_id: &str, op: &Operation) -> Result<(), ClientError> {
        self.send(&ClientEvent::EditOp(EditOp::from_operation(room_id, op)))
            .await
    }

    /// Insert `text` after `anchor` (`None` = document start) and after
    /// everything else anchored there. Mid-document inserts should go
    /// through [`edit`](Self::edit) with a right id set.
    pub async fn insert(&self, room_id: &str, id: OpId, anchor: Option<OpId>, text: &str) -> Result<(), ClientError> {
        self.edit(room_id, &Operation::insert(id, anchor, text)).await
    }

    pub async fn chat(&self, room_id: &str, content: &str) -> Result<(), ClientError> {
        self.send(&ClientEvent::ChatMessage(ChatMessage {
            room_id: room_id.to_string(),
            author: String::new(),
            content: content.to_string(),
            ts: 0,
        }))
        .await
    }

    pub async fn cursor(&self, room_id: &str, cursor: Option<usize>) -> Result<(), ClientError> {
        self.send(&ClientEvent::Cursor {
            room_id: room_id.to_string(),
            cursor,
        })
        .await
    }

    pub async fn heartbeat(&self) -> Result<(), ClientError> {
        self.send(&ClientEvent::Heartbeat).await
    }

    pub async fn sync_request(&self, room_id: &str) -> Result<(), ClientError> {
        self.send(&ClientEvent::SyncRequest {
            room_id: room_id.to_string(),
        })
        .await
    }

    pub async fn claim(&self, room_id: &str, post_id: &str) -> Result<(), ClientError> {
        self.send(&ClientEvent::ClaimSession {
            room_id: room_id.to_string(),
            post_id: post_id.to_string(),
        })
        .await
    }

    /// Send a close frame and stop the writer.
    pub async fn close(self) {
        let _ = self.outgoing.send(Message::Close(None)).await;
    }
}

fn header(value: &str) -> Result<HeaderValue, ClientError> {
    HeaderValue::from_str(value).map_err(|e| ClientError::InvalidRequest(e.to_string()))
}
