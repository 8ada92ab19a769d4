//! One relay connection: a read loop feeding the session hub and a single
//! write task that owns every outbound write (forwarded frames, keepalive
//! pings and the close frame).

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message};
use chrono::{DateTime, Utc};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use metrics::{counter, decrement_gauge, increment_gauge};
use signal_proto::{ConnectionInfo, SignalingMessage};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConnectionConfig;
use crate::registry::SessionRegistry;
use crate::session::{RoutedMessage, Session};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection is closing")]
    AlreadyClosing,
    #[error("outbound queue is full")]
    QueueFull,
    #[error("connection writer has stopped")]
    WriterGone,
    #[error("write exceeded deadline of {0:?}")]
    WriteTimeout(Duration),
    #[error("websocket error: {0}")]
    Socket(#[from] axum::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

/// Diagnostic details captured at upgrade time.
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    pub remote: String,
    pub user_agent: String,
    pub created: DateTime<Utc>,
}

impl ConnectionMeta {
    pub fn new(remote: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            user_agent: user_agent.into(),
            created: Utc::now(),
        }
    }
}

/// Shared side of a connection, held by the actor and (non-owning) by its session.
pub struct ConnectionHandle {
    meta: ConnectionMeta,
    outbound: mpsc::Sender<String>,
    closing: AtomicBool,
    close_requested: Notify,
    /// Stops both loops immediately.
    shutdown: CancellationToken,
    /// Fired once the connection has left its session and the transport is gone.
    done: CancellationToken,
    close_timeout: Duration,
}

impl ConnectionHandle {
    pub fn new(meta: ConnectionMeta, config: &ConnectionConfig) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (outbound, rx) = mpsc::channel(config.outbound_buffer);
        let handle = Arc::new(Self {
            meta,
            outbound,
            closing: AtomicBool::new(false),
            close_requested: Notify::new(),
            shutdown: CancellationToken::new(),
            done: CancellationToken::new(),
            close_timeout: config.close_timeout,
        });
        (handle, rx)
    }

    pub fn meta(&self) -> &ConnectionMeta {
        &self.meta
    }

    pub fn info(&self, id: u64) -> ConnectionInfo {
        ConnectionInfo {
            id,
            remote: self.meta.remote.clone(),
            user_agent: self.meta.user_agent.clone(),
            created: self.meta.created,
        }
    }

    pub fn state(&self) -> ConnectionState {
        if self.done.is_cancelled() {
            ConnectionState::Closed
        } else if self.closing.load(Ordering::SeqCst) {
            ConnectionState::Closing
        } else {
            ConnectionState::Open
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Marks the connection closing; false if it already was.
    fn begin_closing(&self) -> bool {
        !self.closing.swap(true, Ordering::SeqCst)
    }

    /// Queues a frame without waiting. Used for roster updates under the hub lock.
    pub fn try_send(&self, frame: String) -> Result<(), ConnectionError> {
        if self.is_closing() {
            return Err(ConnectionError::AlreadyClosing);
        }
        self.outbound.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => ConnectionError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ConnectionError::WriterGone,
        })
    }

    /// Queues a frame, waiting for room in the outbound queue.
    pub async fn send(&self, frame: String) -> Result<(), ConnectionError> {
        if self.is_closing() {
            return Err(ConnectionError::AlreadyClosing);
        }
        self.outbound
            .send(frame)
            .await
            .map_err(|_| ConnectionError::WriterGone)
    }

    /// Starts the close handshake and waits (bounded) for the connection to finish.
    ///
    /// A second call while the connection is already closing fails with
    /// [`ConnectionError::AlreadyClosing`] instead of sending another close frame.
    /// When the peer does not acknowledge within the close timeout the
    /// transport is torn down regardless.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        if !self.begin_closing() {
            return Err(ConnectionError::AlreadyClosing);
        }
        info!(remote = %self.meta.remote, "connection closing");
        self.close_requested.notify_one();

        if timeout(self.close_timeout, self.done.cancelled())
            .await
            .is_err()
        {
            warn!(remote = %self.meta.remote, "timed out waiting for connection close");
            self.shutdown.cancel();
            if timeout(self.close_timeout, self.done.cancelled())
                .await
                .is_err()
            {
                warn!(remote = %self.meta.remote, "connection did not tear down after forced close");
            }
        }
        Ok(())
    }

    /// Waits until the connection reaches [`ConnectionState::Closed`].
    pub async fn closed(&self) {
        self.done.cancelled().await;
    }
}

/// Runs a connection against `session_name` until it closes, then leaves the session.
///
/// The reader and writer halves are generic so the actor can be driven by an
/// upgraded axum socket or by in-memory channels.
pub async fn run_connection<W, R>(
    writer: W,
    reader: R,
    session_name: &str,
    meta: ConnectionMeta,
    registry: SessionRegistry,
    config: ConnectionConfig,
) -> Arc<ConnectionHandle>
where
    W: Sink<Message, Error = axum::Error> + Unpin + Send + 'static,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin + Send,
{
    let (handle, outbound_rx) = ConnectionHandle::new(meta, &config);
    let (session, membership) = registry.join(session_name, Arc::clone(&handle));
    let member_id = membership.member_id;

    counter!("signaling_connections_total", 1);
    increment_gauge!("signaling_active_connections", 1.0);
    info!(
        session = %session.name(),
        member_id,
        polite = membership.polite,
        remote = %handle.meta.remote,
        user_agent = %handle.meta.user_agent,
        "connection opened"
    );

    let mut writer_task = tokio::spawn(write_loop(
        writer,
        outbound_rx,
        Arc::clone(&handle),
        config.clone(),
        member_id,
    ));

    read_loop(reader, &handle, &session, member_id, &config).await;

    handle.shutdown.cancel();
    if timeout(Duration::from_millis(50), &mut writer_task)
        .await
        .is_err()
    {
        writer_task.abort();
    }

    registry.leave(&session, member_id);
    decrement_gauge!("signaling_active_connections", 1.0);
    handle.done.cancel();
    info!(session = %session.name(), member_id, "connection closed");

    handle
}

async fn read_loop<R>(
    mut reader: R,
    handle: &ConnectionHandle,
    session: &Session,
    member_id: u64,
    config: &ConnectionConfig,
) where
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        // Once closing, only wait for the peer's acknowledgement.
        let deadline = if handle.is_closing() {
            config.close_timeout
        } else {
            config.pong_wait
        };

        let next = tokio::select! {
            _ = handle.shutdown.cancelled() => {
                debug!(member_id, "read loop cancelled");
                break;
            }
            next = timeout(deadline, reader.next()) => next,
        };

        let frame = match next {
            Err(_) if handle.is_closing() => {
                debug!(member_id, "peer did not acknowledge close");
                break;
            }
            Err(_) => {
                warn!(member_id, timeout = ?deadline, "read deadline exceeded");
                break;
            }
            Ok(None) => {
                debug!(member_id, "websocket stream ended");
                break;
            }
            Ok(Some(Err(err))) => {
                if !handle.is_closing() {
                    error!(member_id, error = %err, "failed to read");
                }
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let parsed = match frame {
            Message::Text(text) => SignalingMessage::from_json(&text),
            Message::Binary(bytes) => SignalingMessage::from_json_bytes(&bytes),
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(frame) => {
                info!(
                    member_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "peer closed websocket"
                );
                if handle.begin_closing() {
                    handle.close_requested.notify_one();
                }
                continue;
            }
        };

        match parsed {
            Ok(message) => {
                debug!(session = %session.name(), member_id, %message, "read signaling message");
                if let Err(err) = session
                    .route(RoutedMessage {
                        sender: member_id,
                        message,
                    })
                    .await
                {
                    warn!(member_id, error = %err, "dropping signaling message");
                }
            }
            Err(err) => {
                counter!(
                    "signaling_protocol_violations_total",
                    1,
                    "reason" => err.metric_label()
                );
                warn!(member_id, error = %err, "dropping invalid signaling frame");
            }
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<String>,
    handle: Arc<ConnectionHandle>,
    config: ConnectionConfig,
    member_id: u64,
) where
    W: Sink<Message, Error = axum::Error> + Unpin,
{
    let mut ticker = tokio::time::interval_at(
        Instant::now() + config.ping_period,
        config.ping_period,
    );

    let result = loop {
        tokio::select! {
            biased;
            _ = handle.shutdown.cancelled() => break Ok(()),
            _ = handle.close_requested.notified() => {
                let frame = Message::Close(Some(CloseFrame {
                    code: close_code::NORMAL,
                    reason: Cow::Borrowed(""),
                }));
                if let Err(err) = write_with_deadline(&mut writer, frame, config.write_wait).await {
                    // The peer may already have completed the handshake.
                    debug!(member_id, error = %err, "failed to send close frame");
                }
                break Ok(());
            }
            frame = outbound.recv() => match frame {
                Some(text) => {
                    if let Err(err) = write_with_deadline(&mut writer, Message::Text(text), config.write_wait).await {
                        break Err(err);
                    }
                }
                None => break Ok(()),
            },
            _ = ticker.tick() => {
                debug!(member_id, "send ping");
                if let Err(err) = write_with_deadline(&mut writer, Message::Ping(Vec::new()), config.write_wait).await {
                    break Err(err);
                }
            }
        }
    };

    if let Err(err) = result {
        error!(member_id, error = %err, "fatal write error");
        handle.shutdown.cancel();
    }
}

async fn write_with_deadline<W>(
    writer: &mut W,
    frame: Message,
    deadline: Duration,
) -> Result<(), ConnectionError>
where
    W: Sink<Message, Error = axum::Error> + Unpin,
{
    match timeout(deadline, writer.send(frame)).await {
        Ok(result) => result.map_err(ConnectionError::Socket),
        Err(_) => Err(ConnectionError::WriteTimeout(deadline)),
    }
}
