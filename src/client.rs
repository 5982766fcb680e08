//! Peer-side connection and correlation state.
//!
//! This is the extension half of the bridge: it owns the transport to the
//! host, assigns correlation ids, and matches inbound frames back to the
//! callers that are waiting on them. Streamed `content` frames fan out to
//! broadcast subscribers; terminal frames resolve the per-request channel.
//!
//! The connection is a tagged state machine (`Disconnected`, `Connecting`,
//! `Connected`) with the transport handles embedded in the variants: a
//! state that cannot send has no writer to send with.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::transport::{
    CodecError, FrameCodec, Request, RequestPayload, Response, ResponsePayload,
};

/// Capacity of the event fan-out channel. Slow subscribers lag rather
/// than backpressure the read loop.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,
    #[error("already connected")]
    AlreadyConnected,
    #[error("connection lost")]
    ConnectionLost,
    #[error("host rejected handshake (tool invalid)")]
    HandshakeRejected {
        resolved_path: Option<String>,
    },
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("transport error: {0}")]
    Transport(#[from] CodecError),
}

/// Externally visible connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Events fanned out to all subscribers.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// Connection status changed.
    Status(ConnectionStatus),
    /// One streamed output line for the operation `id`.
    Content { id: Uuid, content: String },
}

/// Result of a completed handshake, as reported by the host.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub resolved_path: Option<String>,
    pub version: Option<String>,
    pub valid: bool,
}

/// Response channel for one outstanding request. Resolved exactly once:
/// by the terminal frame, or synthetically on connection loss.
pub type ResponseReceiver = oneshot::Receiver<Result<Response, ClientError>>;

type PendingMap = Arc<Mutex<HashMap<Uuid, oneshot::Sender<Result<Response, ClientError>>>>>;

enum ConnectionState<R, W> {
    Disconnected,
    Connecting {
        reader: FramedRead<R, FrameCodec<Value>>,
        writer: FramedWrite<W, FrameCodec<Request>>,
        handshake_id: Uuid,
    },
    Connected {
        writer: FramedWrite<W, FrameCodec<Request>>,
        reader_task: JoinHandle<()>,
    },
}

/// The peer side of the bridge.
pub struct BridgeConnection<R, W>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Unpin,
{
    state: ConnectionState<R, W>,
    pending: PendingMap,
    events: broadcast::Sender<BridgeEvent>,
    /// Tool path override attached to every outbound request, read from
    /// the extension's settings by the caller.
    tool_path: Option<PathBuf>,
    handshake_timeout: Duration,
}

impl<R, W> BridgeConnection<R, W>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Unpin,
{
    pub fn new(tool_path: Option<PathBuf>, handshake_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: ConnectionState::Disconnected,
            pending: Arc::new(Mutex::new(HashMap::new())),
            events,
            tool_path,
            handshake_timeout,
        }
    }

    /// Subscribe to streamed content and status changes.
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        match &self.state {
            ConnectionState::Disconnected => ConnectionStatus::Disconnected,
            ConnectionState::Connecting { .. } => ConnectionStatus::Connecting,
            ConnectionState::Connected { reader_task, .. } if reader_task.is_finished() => {
                ConnectionStatus::Disconnected
            }
            ConnectionState::Connected { .. } => ConnectionStatus::Connected,
        }
    }

    /// Number of requests still waiting on a terminal frame.
    pub async fn pending_requests(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Open the transport and run the handshake.
    ///
    /// Sends `ping` while in the connecting state; a `pong` with
    /// `valid: true` inside the timeout lands in `Connected` and
    /// broadcasts the status change. A rejection, timeout, or transport
    /// error lands back in `Disconnected`; an invalid tool and a broken
    /// transport look the same to callers.
    pub async fn connect(&mut self, reader: R, writer: W) -> Result<Handshake, ClientError> {
        if !matches!(self.state, ConnectionState::Disconnected) {
            return Err(ClientError::AlreadyConnected);
        }

        let reader = FramedRead::new(reader, FrameCodec::default());
        let mut writer = FramedWrite::new(writer, FrameCodec::default());

        let handshake_id = Uuid::new_v4();
        writer
            .send(Request {
                id: handshake_id,
                path: self.tool_path.clone(),
                payload: RequestPayload::Ping,
            })
            .await?;

        self.state = ConnectionState::Connecting {
            reader,
            writer,
            handshake_id,
        };
        self.complete_handshake().await
    }

    async fn complete_handshake(&mut self) -> Result<Handshake, ClientError> {
        // Take the transport out; every failure path below leaves the
        // state machine in `Disconnected`.
        let ConnectionState::Connecting {
            mut reader,
            writer,
            handshake_id,
        } = std::mem::replace(&mut self.state, ConnectionState::Disconnected)
        else {
            return Err(ClientError::NotConnected);
        };

        let outcome = tokio::time::timeout(self.handshake_timeout, async {
            loop {
                let Some(frame) = reader.next().await else {
                    return Err(ClientError::ConnectionLost);
                };
                let frame = frame?;
                let response = match Response::deserialize(&frame) {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(error = %e, "ignoring unknown frame during handshake");
                        continue;
                    }
                };
                if response.id != handshake_id {
                    debug!(id = %response.id, "ignoring unrelated frame during handshake");
                    continue;
                }
                match response.payload {
                    ResponsePayload::Pong {
                        resolved_path,
                        version,
                        valid,
                    } => {
                        return Ok(Handshake {
                            resolved_path,
                            version,
                            valid,
                        })
                    }
                    other => {
                        warn!(payload = ?other, "unexpected handshake reply");
                        continue;
                    }
                }
            }
        })
        .await;

        match outcome {
            Ok(Ok(handshake)) if handshake.valid => {
                let reader_task = tokio::spawn(read_loop(
                    reader,
                    Arc::clone(&self.pending),
                    self.events.clone(),
                ));
                self.state = ConnectionState::Connected {
                    writer,
                    reader_task,
                };
                let _ = self
                    .events
                    .send(BridgeEvent::Status(ConnectionStatus::Connected));
                Ok(handshake)
            }
            Ok(Ok(handshake)) => Err(ClientError::HandshakeRejected {
                resolved_path: handshake.resolved_path,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ClientError::HandshakeTimeout),
        }
    }

    /// Tear the connection down and resolve everything still pending.
    pub async fn disconnect(&mut self) {
        if let ConnectionState::Connected { reader_task, .. } =
            std::mem::replace(&mut self.state, ConnectionState::Disconnected)
        {
            reader_task.abort();
            let drained: Vec<_> = {
                let mut pending = self.pending.lock().await;
                pending.drain().collect()
            };
            for (_, tx) in drained {
                let _ = tx.send(Err(ClientError::ConnectionLost));
            }
            let _ = self
                .events
                .send(BridgeEvent::Status(ConnectionStatus::Disconnected));
        }
    }

    /// Enumerate patterns. Resolved by a `patternsList` or `error` frame.
    pub async fn list_patterns(&mut self) -> Result<ResponseReceiver, ClientError> {
        self.send_request(RequestPayload::ListPatterns)
            .await
            .map(|(_, rx)| rx)
    }

    /// Enumerate contexts. Resolved by a `contextsList` or `error` frame.
    pub async fn list_contexts(&mut self) -> Result<ResponseReceiver, ClientError> {
        self.send_request(RequestPayload::ListContexts)
            .await
            .map(|(_, rx)| rx)
    }

    /// Start a streaming operation. `content` frames for the returned id
    /// arrive via [`subscribe`](Self::subscribe); the receiver resolves on
    /// the terminal frame only.
    pub async fn process_content(
        &mut self,
        content: String,
        model: Option<String>,
        pattern: Option<String>,
        context: Option<String>,
        custom_prompt: Option<String>,
    ) -> Result<(Uuid, ResponseReceiver), ClientError> {
        self.send_request(RequestPayload::ProcessContent {
            content,
            model,
            pattern,
            context,
            custom_prompt,
        })
        .await
    }

    /// Cancel the in-flight operation `request_id`. Resolved by a
    /// `cancelled` frame, or an `error` frame when there is nothing to
    /// cancel.
    pub async fn cancel(&mut self, request_id: Uuid) -> Result<(Uuid, ResponseReceiver), ClientError> {
        self.send_request(RequestPayload::CancelProcess { request_id })
            .await
    }

    async fn send_request(
        &mut self,
        payload: RequestPayload,
    ) -> Result<(Uuid, ResponseReceiver), ClientError> {
        // A finished read loop means the transport died underneath us; it
        // has already drained pending entries and broadcast the status.
        let lost = matches!(
            &self.state,
            ConnectionState::Connected { reader_task, .. } if reader_task.is_finished()
        );
        if lost {
            self.state = ConnectionState::Disconnected;
            return Err(ClientError::ConnectionLost);
        }

        let ConnectionState::Connected { writer, .. } = &mut self.state else {
            return Err(ClientError::NotConnected);
        };

        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        // Record the pending entry before the frame goes out, so the
        // response can never race the bookkeeping.
        self.pending.lock().await.insert(id, tx);

        let request = Request {
            id,
            path: self.tool_path.clone(),
            payload,
        };
        if let Err(e) = writer.send(request).await {
            self.pending.lock().await.remove(&id);
            self.disconnect().await;
            return Err(e.into());
        }

        Ok((id, rx))
    }
}

/// Inbound frame pump: rebroadcasts `content`, resolves pending entries
/// on terminal frames, and on stream end resolves everything left with a
/// synthetic connection-lost error.
async fn read_loop<R>(
    mut reader: FramedRead<R, FrameCodec<Value>>,
    pending: PendingMap,
    events: broadcast::Sender<BridgeEvent>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    loop {
        match reader.next().await {
            Some(Ok(frame)) => {
                let response = match Response::deserialize(&frame) {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(error = %e, "ignoring unknown inbound frame");
                        continue;
                    }
                };
                handle_inbound(response, &pending, &events).await;
            }
            Some(Err(e)) => {
                warn!(error = %e, "transport error, closing connection");
                break;
            }
            None => {
                debug!("transport closed by host");
                break;
            }
        }
    }

    let drained: Vec<_> = {
        let mut pending = pending.lock().await;
        pending.drain().collect()
    };
    for (_, tx) in drained {
        let _ = tx.send(Err(ClientError::ConnectionLost));
    }
    let _ = events.send(BridgeEvent::Status(ConnectionStatus::Disconnected));
}

async fn handle_inbound(
    response: Response,
    pending: &PendingMap,
    events: &broadcast::Sender<BridgeEvent>,
) {
    match &response.payload {
        // Streamed output: fan out, leave the pending entry for the
        // terminal frame.
        ResponsePayload::Content { content } => {
            let _ = events.send(BridgeEvent::Content {
                id: response.id,
                content: content.clone(),
            });
        }
        // `cancelled` ends two things at once: the cancel request it
        // answers and the stream it terminated.
        ResponsePayload::Cancelled { request_id } => {
            let (cancel_entry, stream_entry) = {
                let mut pending = pending.lock().await;
                (pending.remove(&response.id), pending.remove(request_id))
            };
            if let Some(tx) = cancel_entry {
                let _ = tx.send(Ok(response.clone()));
            }
            if let Some(tx) = stream_entry {
                let _ = tx.send(Ok(response.clone()));
            }
        }
        _ => {
            let entry = pending.lock().await.remove(&response.id);
            match entry {
                Some(tx) => {
                    let _ = tx.send(Ok(response));
                }
                None => debug!(id = %response.id, "frame for unknown correlation id, ignoring"),
            }
        }
    }
}
