mod webrtc_peer;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use perfect_negotiation::{
    BackoffConfig, PerfectNegotiation, PolitenessMode, SignalingClient, SignalingConfig,
};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

use crate::webrtc_peer::WebRtcPeer;

const DATA_CHANNEL_LABEL: &str = "test";

#[derive(Parser, Debug)]
#[command(author, version, about = "Demo peer negotiating through a beach relay")]
struct Cli {
    /// Relay base URL
    #[arg(long, env = "BEACH_PEER_URL", default_value = "ws://localhost:8080")]
    url: String,

    /// Session name shared with the remote peer
    #[arg(long, env = "BEACH_PEER_SESSION", default_value = "session")]
    name: String,

    /// Always yield on offer collisions instead of using the relay assignment
    #[arg(long, conflicts_with = "impolite")]
    polite: bool,

    /// Never yield on offer collisions instead of using the relay assignment
    #[arg(long)]
    impolite: bool,

    /// STUN or TURN server URLs
    #[arg(long, default_value = "stun:stun.l.google.com:19302")]
    stun: Vec<String>,

    /// First reconnect delay in milliseconds
    #[arg(long, default_value_t = 1000)]
    backoff_initial_ms: u64,

    /// Reconnect delay cap in milliseconds
    #[arg(long, default_value_t = 60_000)]
    backoff_max_ms: u64,

    /// Reconnect delay growth factor
    #[arg(long, default_value_t = 1.5)]
    backoff_multiplier: f64,
}

impl Cli {
    fn politeness(&self) -> PolitenessMode {
        match (self.polite, self.impolite) {
            (true, _) => PolitenessMode::Static(true),
            (_, true) => PolitenessMode::Static(false),
            _ => PolitenessMode::ServerAssigned,
        }
    }

    fn signaling(&self) -> Result<SignalingConfig> {
        let mut config = SignalingConfig::for_session(&self.url, &self.name)
            .with_context(|| format!("invalid relay url {}", self.url))?;
        config.backoff = BackoffConfig {
            initial: Duration::from_millis(self.backoff_initial_ms),
            max: Duration::from_millis(self.backoff_max_ms),
            multiplier: self.backoff_multiplier,
        };
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.signaling()?;
    info!(url = %config.url, mode = ?cli.politeness(), "starting peer");

    let peer = Arc::new(
        WebRtcPeer::new(cli.stun.clone())
            .await
            .context("failed to create peer connection")?,
    );
    peer.peer_connection()
        .on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            Box::pin(async move {
                info!(label = channel.label(), "remote data channel announced");
                tokio::spawn(chat(channel));
            })
        }));

    let client = SignalingClient::new(config);
    let negotiation = PerfectNegotiation::start(peer.clone(), &client, cli.politeness())
        .context("failed to start negotiation")?;
    client
        .connect_with_backoff()
        .await
        .context("failed to connect signaling client")?;

    peer.peer_connection()
        .create_data_channel(DATA_CHANNEL_LABEL, None)
        .await
        .context("failed to create data channel")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");

    negotiation.abort();
    if let Err(err) = client.close().await {
        warn!(error = %err, "failed to close signaling client");
    }
    if let Err(err) = peer.close().await {
        warn!(error = %err, "failed to close peer connection");
    }
    Ok(())
}

/// Logs everything received on `channel` and sends `Hello N` once per second.
async fn chat(channel: Arc<RTCDataChannel>) {
    let (opened_tx, opened_rx) = tokio::sync::oneshot::channel::<()>();
    let opened_tx = parking_lot::Mutex::new(Some(opened_tx));
    channel.on_open(Box::new(move || {
        let opened = opened_tx.lock().take();
        Box::pin(async move {
            info!("data channel opened");
            if let Some(tx) = opened {
                let _ = tx.send(());
            }
        })
    }));
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        Box::pin(async move {
            info!(message = %String::from_utf8_lossy(&message.data), "received");
        })
    }));

    if opened_rx.await.is_err() {
        warn!("data channel closed before opening");
        return;
    }

    let mut ticker = interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    for sequence in 0u64.. {
        ticker.tick().await;
        let text = format!("Hello {sequence}");
        info!(message = %text, "send");
        if let Err(err) = channel.send_text(text).await {
            error!(error = %err, "failed to send on data channel");
            return;
        }
    }
}
