//! Connection lifecycle
//!
//! A connection moves through `Connecting -> Open -> Closing -> Closed`.
//! While open it runs two tasks:
//!
//! - the **write loop**, the only writer of the socket. It drains the
//!   outbound queue and writes a ping on every heartbeat tick.
//! - the **read loop**, which tracks the pong deadline and, for
//!   authenticated connections, decodes events and dispatches them.
//!   Guests may not write at all.
//!
//! A supervisor waits for whichever task ends first, removes the connection
//! from the registry and tears down the other task. Removal drops the only
//! sender of the outbound queue, which is what closes the socket. A close
//! frame for a rejected frame travels on its own channel and is written
//! ahead of anything still queued.

use crate::{
    config::GatewayConfig,
    error::{GatewayError, GatewayResult},
    model::UserId,
    protocol::Event,
    registry::{ConnectionHandle, ConnectionId, Registry},
    router::{EventRouter, HandlerContext},
};
use axum::{
    body::Bytes,
    extract::ws::{CloseFrame, Message, Utf8Bytes, close_code},
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::{fmt, future, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at, timeout, timeout_at},
};
use tracing::{debug, info, warn};

/// Time the write loop gets to flush its close frame once the read side ended
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Classification of a connection, decided once at upgrade time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Read-only: receives broadcasts to all connections, may not send
    Guest,
    /// Owned by a user, may send chat events
    Authenticated(UserId),
}

impl Classification {
    pub fn user_id(self) -> Option<UserId> {
        match self {
            Self::Guest => None,
            Self::Authenticated(user_id) => Some(user_id),
        }
    }

    pub fn is_guest(self) -> bool {
        matches!(self, Self::Guest)
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Guest => f.write_str("guest"),
            Self::Authenticated(user_id) => write!(f, "user {user_id}"),
        }
    }
}

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open(Classification),
    Closing,
    Closed,
}

impl ConnectionState {
    /// Whether `next` may follow `self`
    ///
    /// Closing may be entered straight from Connecting when registration
    /// never completes.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Open(_))
                | (Self::Connecting, Self::Closing)
                | (Self::Open(_), Self::Closing)
                | (Self::Closing, Self::Closed)
        )
    }

    pub fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Timing and size limits applied to every connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub pong_wait: Duration,
    pub ping_interval: Duration,
    pub max_message_size: usize,
    pub outbound_buffer: usize,
}

impl From<&GatewayConfig> for ConnectionSettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            pong_wait: config.pong_wait,
            ping_interval: config.ping_interval(),
            max_message_size: config.max_message_size,
            outbound_buffer: config.outbound_buffer,
        }
    }
}

/// Shared collaborators of all connections
#[derive(Debug)]
pub(crate) struct ConnectionDeps {
    pub registry: Arc<Registry>,
    pub router: Arc<EventRouter>,
    pub settings: ConnectionSettings,
}

/// One connection and its lifecycle state
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    classification: Classification,
    state: ConnectionState,
}

impl Connection {
    fn new(id: ConnectionId, classification: Classification) -> Self {
        Self {
            id,
            classification,
            state: ConnectionState::Connecting,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn classification(&self) -> Classification {
        self.classification
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state.can_transition_to(next) {
            debug!(conn_id = %self.id, from = ?self.state, to = ?next, "connection state change");
            self.state = next;
        } else {
            warn!(conn_id = %self.id, from = ?self.state, to = ?next, "ignored illegal state change");
        }
    }
}

/// Register a connection and start its loops
///
/// The connection is in the registry before this returns, so broadcasts
/// issued afterwards reach it.
pub(crate) async fn open<K, S, E>(
    deps: Arc<ConnectionDeps>,
    classification: Classification,
    sink: K,
    stream: S,
) -> ConnectionId
where
    K: Sink<Message> + Unpin + Send + 'static,
    K::Error: fmt::Display + Send,
    S: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let settings = deps.settings;
    let (handle, outbound_rx) =
        ConnectionHandle::new(classification.user_id(), settings.outbound_buffer);
    let id = handle.id();
    let (close_tx, close_rx) = oneshot::channel();

    let mut connection = Connection::new(id, classification);
    deps.registry.add(handle).await;
    connection.transition(ConnectionState::Open(classification));
    info!(conn_id = %id, classification = %classification, "connection opened");

    let reader = ReadLoop {
        conn_id: id,
        classification,
        router: Arc::clone(&deps.router),
        pong_wait: settings.pong_wait,
        max_message_size: settings.max_message_size,
    };
    let writer = WriteLoop {
        conn_id: id,
        ping_interval: settings.ping_interval,
    };

    let read_task = tokio::spawn(reader.run(stream));
    let write_task = tokio::spawn(writer.run(sink, outbound_rx, close_rx));
    tokio::spawn(supervise(connection, deps, close_tx, read_task, write_task));

    id
}

async fn supervise(
    mut connection: Connection,
    deps: Arc<ConnectionDeps>,
    close_tx: oneshot::Sender<CloseFrame>,
    mut read_task: JoinHandle<GatewayResult<()>>,
    mut write_task: JoinHandle<GatewayResult<()>>,
) {
    let conn_id = connection.id();

    tokio::select! {
        result = &mut read_task => {
            let outcome = result.unwrap_or_else(|e| Err(GatewayError::Transport(e.to_string())));
            if let Err(e) = &outcome {
                log_read_error(conn_id, e);
                // Sent before removal so the write loop sees it before the
                // queue ends.
                if close_tx.send(e.close_frame()).is_err() {
                    debug!(conn_id = %conn_id, "write loop gone before close frame");
                }
            }
            connection.transition(ConnectionState::Closing);
            deps.registry.remove(conn_id).await;

            match timeout(CLOSE_GRACE, &mut write_task).await {
                Ok(Ok(Err(e))) => debug!(conn_id = %conn_id, error = %e, "write loop ended with error"),
                Ok(Err(e)) => warn!(conn_id = %conn_id, error = %e, "write loop panicked"),
                Ok(Ok(Ok(()))) => {}
                Err(_) => {
                    debug!(conn_id = %conn_id, "write loop did not finish in time, aborting");
                    write_task.abort();
                }
            }
        }
        result = &mut write_task => {
            match result {
                Ok(Err(e)) => debug!(conn_id = %conn_id, error = %e, "write loop failed"),
                Err(e) => warn!(conn_id = %conn_id, error = %e, "write loop panicked"),
                Ok(Ok(())) => {}
            }
            connection.transition(ConnectionState::Closing);
            read_task.abort();
            deps.registry.remove(conn_id).await;
        }
    }

    connection.transition(ConnectionState::Closed);
    info!(conn_id = %conn_id, classification = %connection.classification(), "connection closed");
}

fn log_read_error(conn_id: ConnectionId, e: &GatewayError) {
    if e.is_protocol_violation() {
        warn!(conn_id = %conn_id, error = %e, "protocol violation, closing connection");
    } else {
        match e {
            GatewayError::HeartbeatTimeout => {
                info!(conn_id = %conn_id, "heartbeat timed out, closing connection")
            }
            GatewayError::Transport(_) => {
                debug!(conn_id = %conn_id, error = %e, "transport error, closing connection")
            }
            _ => warn!(conn_id = %conn_id, error = %e, "rejected event, closing connection"),
        }
    }
}

/// Inbound half of a connection
pub(crate) struct ReadLoop {
    pub conn_id: ConnectionId,
    pub classification: Classification,
    pub router: Arc<EventRouter>,
    pub pong_wait: Duration,
    pub max_message_size: usize,
}

impl ReadLoop {
    /// Read until the peer closes, the heartbeat deadline passes or a frame
    /// is rejected
    ///
    /// `Ok` is an orderly close by the peer.
    pub async fn run<S, E>(self, mut stream: S) -> GatewayResult<()>
    where
        S: Stream<Item = Result<Message, E>> + Unpin,
        E: fmt::Display,
    {
        let mut deadline = Instant::now() + self.pong_wait;
        loop {
            let frame = match timeout_at(deadline, stream.next()).await {
                Err(_) => return Err(GatewayError::HeartbeatTimeout),
                Ok(None) => return Ok(()),
                Ok(Some(Err(e))) => return Err(GatewayError::Transport(e.to_string())),
                Ok(Some(Ok(frame))) => frame,
            };

            match frame {
                Message::Pong(_) => deadline = Instant::now() + self.pong_wait,
                // The transport answers pings on its own
                Message::Ping(_) => {}
                Message::Close(frame) => {
                    debug!(
                        conn_id = %self.conn_id,
                        code = frame.as_ref().map(|f| f.code),
                        "peer closed connection"
                    );
                    return Ok(());
                }
                Message::Text(text) => self.handle_data(text.as_str().as_bytes()).await?,
                Message::Binary(data) => self.handle_data(&data).await?,
            }
        }
    }

    async fn handle_data(&self, data: &[u8]) -> GatewayResult<()> {
        let Classification::Authenticated(user_id) = self.classification else {
            return Err(GatewayError::GuestWrite);
        };

        if data.len() > self.max_message_size {
            return Err(GatewayError::MessageTooLarge {
                size: data.len(),
                max: self.max_message_size,
            });
        }

        let event = Event::decode(data)?;
        debug!(conn_id = %self.conn_id, event_type = %event.event_type, "dispatching event");
        let ctx = HandlerContext {
            conn_id: self.conn_id,
            user_id,
        };
        self.router.dispatch(&event, &ctx).await
    }
}

/// Outbound half of a connection, the sole writer of its socket
pub(crate) struct WriteLoop {
    pub conn_id: ConnectionId,
    pub ping_interval: Duration,
}

impl WriteLoop {
    /// Write queued frames and heartbeat pings until the queue closes, a
    /// close frame is requested or the socket fails
    ///
    /// A requested close frame is written as soon as the socket is free;
    /// frames still queued at that point are dropped.
    pub async fn run<K>(
        self,
        mut sink: K,
        mut outbound: mpsc::Receiver<Utf8Bytes>,
        close: oneshot::Receiver<CloseFrame>,
    ) -> GatewayResult<()>
    where
        K: Sink<Message> + Unpin,
        K::Error: fmt::Display,
    {
        let mut heartbeat = interval_at(Instant::now() + self.ping_interval, self.ping_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut requested = Some(close);
        let close = loop {
            tokio::select! {
                biased;
                frame = requested_close(&mut requested) => break frame,
                text = outbound.recv() => match text {
                    Some(text) => send(&mut sink, Message::Text(text)).await?,
                    None => {
                        break CloseFrame {
                            code: close_code::NORMAL,
                            reason: "".into(),
                        };
                    }
                },
                _ = heartbeat.tick() => send(&mut sink, Message::Ping(Bytes::new())).await?,
            }
        };

        debug!(conn_id = %self.conn_id, code = close.code, "writing close frame");
        send(&mut sink, Message::Close(Some(close))).await?;
        if let Err(e) = sink.close().await {
            debug!(conn_id = %self.conn_id, error = %e, "socket close failed");
        }
        Ok(())
    }
}

/// Resolve with the requested close frame, or never if the requester went
/// away without asking
async fn requested_close(requested: &mut Option<oneshot::Receiver<CloseFrame>>) -> CloseFrame {
    let Some(rx) = requested.as_mut() else {
        return future::pending().await;
    };
    match rx.await {
        Ok(frame) => frame,
        Err(_) => {
            *requested = None;
            future::pending().await
        }
    }
}

async fn send<K>(sink: &mut K, frame: Message) -> GatewayResult<()>
where
    K: Sink<Message> + Unpin,
    K::Error: fmt::Display,
{
    sink.send(frame)
        .await
        .map_err(|e| GatewayError::Transport(e.to_string()))
}
