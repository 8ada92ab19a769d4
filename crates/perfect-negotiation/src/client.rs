//! Peer-side connection to the signaling relay.
//!
//! A connected client owns one writer task (the only writer to the socket)
//! and one reader task that dispatches inbound messages to observers. When
//! the reader observes a disconnect that was not requested locally it
//! reconnects with exponential backoff.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use signal_proto::{ProtocolError, SignalingMessage};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{error::ProtocolError as WsProtocolError, Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::backoff::{Backoff, BackoffConfig};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Observer = Arc<dyn Fn(&SignalingMessage) + Send + Sync>;

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(3);
const OUTBOUND_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid signaling url: {0}")]
    InvalidUrl(String),
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("timed out after {0:?} during handshake")]
    HandshakeTimeout(Duration),
    #[error("connection ended before the first relay message")]
    NoGreeting,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("failed to encode signaling message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("signaling client is not connected")]
    NotConnected,
    #[error("signaling client is already closing")]
    AlreadyClosing,
    #[error("signaling client was closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct SignalingConfig {
    pub url: Url,
    pub handshake_timeout: Duration,
    pub close_timeout: Duration,
    pub backoff: BackoffConfig,
}

impl SignalingConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            backoff: BackoffConfig::default(),
        }
    }

    /// Targets session `name` on the relay at `relay_url` (the path is replaced).
    pub fn for_session(relay_url: &str, name: &str) -> Result<Self, SignalingError> {
        let mut url =
            Url::parse(relay_url).map_err(|err| SignalingError::InvalidUrl(err.to_string()))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(SignalingError::InvalidUrl(format!(
                    "unsupported scheme {other}"
                )))
            }
        }
        let name = name.trim_start_matches('/');
        if name.is_empty() {
            return Err(SignalingError::InvalidUrl("session name is empty".into()));
        }
        url.set_path(&format!("/{name}"));
        Ok(Self::new(url))
    }
}

/// Sink for outbound signaling messages.
#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn send_signal(&self, message: SignalingMessage) -> Result<(), SignalingError>;
}

#[derive(Default)]
struct Observers {
    connect: Vec<Observer>,
    message: Vec<Observer>,
}

struct Link {
    generation: u64,
    outbound: mpsc::Sender<Message>,
    done: watch::Receiver<bool>,
    reader: JoinHandle<()>,
}

struct ClientInner {
    config: SignalingConfig,
    backoff: Mutex<Backoff>,
    observers: RwLock<Observers>,
    link: Mutex<Option<Link>>,
    generation: AtomicU64,
    closing: AtomicBool,
    /// Cancelled by a local close; aborts handshakes and backoff sleeps.
    shutdown: CancellationToken,
    reconnecting: AtomicBool,
}

#[derive(Clone)]
pub struct SignalingClient {
    inner: Arc<ClientInner>,
}

impl SignalingClient {
    pub fn new(config: SignalingConfig) -> Self {
        let backoff = Backoff::new(config.backoff);
        Self {
            inner: Arc::new(ClientInner {
                config,
                backoff: Mutex::new(backoff),
                observers: RwLock::new(Observers::default()),
                link: Mutex::new(None),
                generation: AtomicU64::new(0),
                closing: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                reconnecting: AtomicBool::new(false),
            }),
        }
    }

    pub fn url(&self) -> &Url {
        &self.inner.config.url
    }

    pub fn is_connected(&self) -> bool {
        self.inner.link.lock().is_some()
    }

    /// Delay the next reconnect attempt would wait.
    pub fn next_retry_delay(&self) -> Duration {
        self.inner.backoff.lock().current()
    }

    /// Registers a callback run with the first relay message of every
    /// successful connection. Callbacks run in registration order.
    pub fn on_connect<F>(&self, callback: F)
    where
        F: Fn(&SignalingMessage) + Send + Sync + 'static,
    {
        self.inner.observers.write().connect.push(Arc::new(callback));
    }

    /// Registers a callback run for every later inbound message, in
    /// registration order. Messages received before registration are not replayed.
    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(&SignalingMessage) + Send + Sync + 'static,
    {
        self.inner.observers.write().message.push(Arc::new(callback));
    }

    /// Single connection attempt. A local [`SignalingClient::close`] that
    /// lands while the attempt is in flight makes it fail with
    /// [`SignalingError::Closed`] without installing the connection.
    pub async fn connect(&self) -> Result<(), SignalingError> {
        let shutdown = self.inner.shutdown.clone();
        if shutdown.is_cancelled() {
            return Err(SignalingError::Closed);
        }
        let config = &self.inner.config;
        let (stream, first) = tokio::select! {
            _ = shutdown.cancelled() => return Err(SignalingError::Closed),
            result = handshake(config) => result?,
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        // The reader waits for the gate so connect observers always run
        // before any later message is dispatched.
        let (gate_tx, gate_rx) = oneshot::channel();
        let mut pending = Some(stream);
        {
            let mut link = self.inner.link.lock();
            // Checked under the link lock: `close` sets the flag before it
            // looks for a link, so it either sees this one or we see the flag.
            if !self.inner.closing.load(Ordering::SeqCst) {
                if let Some(stream) = pending.take() {
                    let (write, read) = stream.split();
                    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
                    let (done_tx, done_rx) = watch::channel(false);
                    tokio::spawn(write_loop(write, outbound_rx, generation));
                    let reader =
                        tokio::spawn(read_loop(self.clone(), read, generation, done_tx, gate_rx));
                    if let Some(stale) = link.replace(Link {
                        generation,
                        outbound: outbound_tx,
                        done: done_rx,
                        reader,
                    }) {
                        stale.reader.abort();
                    }
                }
            }
        }
        if let Some(mut stream) = pending {
            debug!(generation, "closed while connecting; dropping new connection");
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            };
            if let Err(err) = timeout(config.close_timeout, stream.close(Some(frame))).await {
                debug!(generation, error = %err, "relay did not take the close frame");
            }
            return Err(SignalingError::Closed);
        }

        self.inner.backoff.lock().reset();
        info!(url = %config.url, generation, first = %first, "signaling connected");

        let connect_observers = self.inner.observers.read().connect.clone();
        for observer in &connect_observers {
            observer(&first);
        }
        let _ = gate_tx.send(());
        Ok(())
    }

    /// Retries [`SignalingClient::connect`] until it succeeds, waiting the
    /// current backoff delay before every attempt.
    pub async fn connect_with_backoff(&self) -> Result<(), SignalingError> {
        loop {
            let delay = self.inner.backoff.lock().current();
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return Err(SignalingError::Closed),
                _ = sleep(delay) => {}
            }
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(SignalingError::Closed) => return Err(SignalingError::Closed),
                Err(err) => {
                    let retry_in = {
                        let mut backoff = self.inner.backoff.lock();
                        backoff.next_delay();
                        backoff.current()
                    };
                    error!(url = %self.inner.config.url, error = %err, ?retry_in, "failed to connect");
                }
            }
        }
    }

    fn reconnect(self) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        Box::pin(async move {
            if self.inner.reconnecting.swap(true, Ordering::SeqCst) {
                return;
            }
            let result = self.connect_with_backoff().await;
            self.inner.reconnecting.store(false, Ordering::SeqCst);
            if let Err(err) = result {
                debug!(error = %err, "reconnect abandoned");
            }
        })
    }

    /// Serializes `message` and queues it for the writer task.
    pub async fn send_signaling_message(
        &self,
        message: &SignalingMessage,
    ) -> Result<(), SignalingError> {
        let text = message.to_json()?;
        let outbound = self
            .inner
            .link
            .lock()
            .as_ref()
            .map(|link| link.outbound.clone())
            .ok_or(SignalingError::NotConnected)?;
        debug!(%message, "sending signaling message");
        outbound
            .send(Message::Text(text))
            .await
            .map_err(|_| SignalingError::NotConnected)
    }

    /// Sends a close frame and waits (bounded) for the relay to finish the
    /// handshake. Disables automatic reconnection.
    pub async fn close(&self) -> Result<(), SignalingError> {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return Err(SignalingError::AlreadyClosing);
        }
        self.inner.shutdown.cancel();
        let link = self
            .inner
            .link
            .lock()
            .as_ref()
            .map(|link| (link.outbound.clone(), link.done.clone()));
        let Some((outbound, mut done)) = link else {
            return Ok(());
        };

        let frame = Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        }));
        if outbound.send(frame).await.is_err() {
            debug!("writer already stopped; nothing to close");
            return Ok(());
        }

        match timeout(self.inner.config.close_timeout, done.wait_for(|done| *done)).await {
            Ok(_) => info!("signaling connection closed"),
            Err(_) => {
                warn!(
                    timeout = ?self.inner.config.close_timeout,
                    "timed out waiting for signaling connection close"
                );
                if let Some(link) = self.inner.link.lock().take() {
                    link.reader.abort();
                }
            }
        }
        Ok(())
    }

    fn dispatch(&self, message: &SignalingMessage) {
        let observers = self.inner.observers.read().message.clone();
        for observer in &observers {
            observer(message);
        }
    }
}

#[async_trait]
impl SignalSink for SignalingClient {
    async fn send_signal(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        self.send_signaling_message(&message).await
    }
}

async fn handshake(config: &SignalingConfig) -> Result<(WsStream, SignalingMessage), SignalingError> {
    let (mut stream, _) = timeout(config.handshake_timeout, connect_async(config.url.as_str()))
        .await
        .map_err(|_| SignalingError::HandshakeTimeout(config.handshake_timeout))?
        .map_err(|err| SignalingError::Connect(err.to_string()))?;
    let first = timeout(config.handshake_timeout, read_greeting(&mut stream))
        .await
        .map_err(|_| SignalingError::HandshakeTimeout(config.handshake_timeout))??;
    Ok((stream, first))
}

async fn read_greeting(read: &mut WsStream) -> Result<SignalingMessage, SignalingError> {
    while let Some(frame) = read.next().await {
        match frame.map_err(|err| SignalingError::Connect(err.to_string()))? {
            Message::Text(text) => return Ok(SignalingMessage::from_json(&text)?),
            Message::Binary(bytes) => return Ok(SignalingMessage::from_json_bytes(&bytes)?),
            Message::Close(_) => break,
            _ => continue,
        }
    }
    Err(SignalingError::NoGreeting)
}

async fn write_loop(
    mut write: SplitSink<WsStream, Message>,
    mut outbound: mpsc::Receiver<Message>,
    generation: u64,
) {
    while let Some(frame) = outbound.recv().await {
        let closing = matches!(frame, Message::Close(_));
        if let Err(err) = write.send(frame).await {
            debug!(generation, error = %err, "signaling writer stopped");
            break;
        }
        if closing {
            break;
        }
    }
}

async fn read_loop(
    client: SignalingClient,
    mut read: SplitStream<WsStream>,
    generation: u64,
    done: watch::Sender<bool>,
    gate: oneshot::Receiver<()>,
) {
    let _ = gate.await;
    while let Some(frame) = read.next().await {
        let parsed = match frame {
            Ok(Message::Text(text)) => SignalingMessage::from_json(&text),
            Ok(Message::Binary(bytes)) => SignalingMessage::from_json_bytes(&bytes),
            Ok(Message::Close(frame)) => {
                debug!(generation, ?frame, "relay closed signaling connection");
                continue;
            }
            Ok(_) => continue,
            Err(WsError::ConnectionClosed)
            | Err(WsError::AlreadyClosed)
            | Err(WsError::Protocol(WsProtocolError::ResetWithoutClosingHandshake)) => {
                debug!(generation, "signaling websocket closed");
                break;
            }
            Err(err) => {
                error!(generation, error = %err, "failed to read from signaling websocket");
                break;
            }
        };
        match parsed {
            Ok(message) => {
                debug!(generation, %message, "received signaling message");
                client.dispatch(&message);
            }
            Err(err) => warn!(generation, error = %err, "ignoring invalid signaling message"),
        }
    }

    let _ = done.send(true);
    {
        let mut link = client.inner.link.lock();
        if link.as_ref().is_some_and(|link| link.generation == generation) {
            *link = None;
        }
    }

    if client.inner.closing.load(Ordering::SeqCst) {
        debug!(generation, "signaling reader finished after local close");
        return;
    }
    warn!(
        generation,
        retry_in = ?client.next_retry_delay(),
        "signaling connection lost; reconnecting"
    );
    tokio::spawn(client.reconnect());
}
