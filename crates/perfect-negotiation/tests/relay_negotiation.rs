use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use beach_relay::api::ApiAuth;
use beach_relay::{serve, AppState, ConnectionConfig, SessionConfig, SessionRegistry};
use perfect_negotiation::mock::MockPeer;
use perfect_negotiation::{
    BackoffConfig, PerfectNegotiation, PolitenessMode, SignalingClient, SignalingConfig,
    SignalingError, SignalingState,
};
use signal_proto::SdpType;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::sleep;

struct TestRelay {
    addr: SocketAddr,
    registry: SessionRegistry,
    _shutdown: oneshot::Sender<()>,
}

async fn start_relay() -> TestRelay {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let registry = SessionRegistry::new(SessionConfig::default());
    let connection = ConnectionConfig {
        close_timeout: Duration::from_millis(300),
        ..ConnectionConfig::default()
    };
    let state = AppState::new(registry.clone(), connection, ApiAuth::default(), None);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let _ = serve(listener, state, async move {
            let _ = shutdown_rx.await;
        })
        .await;
    });
    TestRelay {
        addr,
        registry,
        _shutdown: shutdown_tx,
    }
}

fn client_for(relay: &TestRelay, session: &str) -> SignalingClient {
    let mut config = SignalingConfig::for_session(&format!("ws://{}", relay.addr), session).unwrap();
    config.backoff = BackoffConfig {
        initial: Duration::from_millis(10),
        max: Duration::from_millis(200),
        multiplier: 1.5,
    };
    config.close_timeout = Duration::from_millis(500);
    SignalingClient::new(config)
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Asserts the settled exchange is `offerer`'s offer answered by `answerer`.
fn assert_offer_accepted(offerer: &MockPeer, offerer_id: &str, answerer: &MockPeer) {
    let accepted = offerer.snapshot().local.unwrap();
    assert_eq!(accepted.sdp_type, SdpType::Offer);
    assert_eq!(accepted.ice_ufrag(), Some(offerer_id));
    let answer = answerer.snapshot().local.unwrap();
    assert_eq!(answer.sdp_type, SdpType::Answer);
}

fn converged(a: &MockPeer, b: &MockPeer) -> bool {
    let a = a.snapshot();
    let b = b.snapshot();
    a.state == SignalingState::Stable
        && b.state == SignalingState::Stable
        && a.local.is_some()
        && a.remote.is_some()
        && a.local == b.remote
        && a.remote == b.local
}

#[test_timeout::tokio_timeout_test(30)]
async fn concurrent_offers_converge_through_the_relay() {
    let relay = start_relay().await;

    let a_peer = Arc::new(MockPeer::new("alice"));
    let a_client = client_for(&relay, "glare");
    let a = PerfectNegotiation::start(a_peer.clone(), &a_client, PolitenessMode::ServerAssigned)
        .unwrap();
    a_client.connect_with_backoff().await.unwrap();
    assert_eq!(a.politeness(), Some(false));

    let b_peer = Arc::new(MockPeer::new("bob"));
    let b_client = client_for(&relay, "glare");
    let b = PerfectNegotiation::start(b_peer.clone(), &b_client, PolitenessMode::ServerAssigned)
        .unwrap();
    b_client.connect_with_backoff().await.unwrap();
    assert_eq!(b.politeness(), Some(true));

    a_peer.negotiation_needed();
    b_peer.negotiation_needed();
    eventually("stable matching descriptions", || converged(&a_peer, &b_peer)).await;
    assert_offer_accepted(&a_peer, "alice", &b_peer);

    let candidate = a_peer.gather_candidate();
    eventually("candidate delivery", || {
        b_peer.snapshot().remote_candidates.contains(&candidate)
    })
    .await;
    assert!(!a.is_finished());
    assert!(!b.is_finished());

    a_client.close().await.unwrap();
    b_client.close().await.unwrap();
    let registry = relay.registry.clone();
    eventually("session removal", move || registry.get("glare").is_none()).await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn static_politeness_ignores_relay_assignment() {
    let relay = start_relay().await;

    let a_peer = Arc::new(MockPeer::new("alice"));
    let a_client = client_for(&relay, "fixed");
    let a = PerfectNegotiation::start(a_peer.clone(), &a_client, PolitenessMode::Static(true))
        .unwrap();
    a_client.connect_with_backoff().await.unwrap();
    assert_eq!(a.politeness(), Some(true));

    let b_peer = Arc::new(MockPeer::new("bob"));
    let b_client = client_for(&relay, "fixed");
    let b = PerfectNegotiation::start(b_peer.clone(), &b_client, PolitenessMode::Static(false))
        .unwrap();
    b_client.connect_with_backoff().await.unwrap();
    assert_eq!(b.politeness(), Some(false));

    a_peer.negotiation_needed();
    b_peer.negotiation_needed();
    eventually("stable matching descriptions", || converged(&a_peer, &b_peer)).await;
    assert_offer_accepted(&b_peer, "bob", &a_peer);
}

#[test_timeout::tokio_timeout_test(30)]
async fn client_reconnects_after_relay_closes_it() {
    let relay = start_relay().await;
    let client = client_for(&relay, "flaky");
    let connects = Arc::new(AtomicUsize::new(0));
    {
        let connects = Arc::clone(&connects);
        client.on_connect(move |message| {
            assert!(message.control.is_some());
            connects.fetch_add(1, Ordering::SeqCst);
        });
    }

    client.connect().await.unwrap();
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    relay.registry.close_all().await;
    {
        let connects = Arc::clone(&connects);
        eventually("automatic reconnect", move || connects.load(Ordering::SeqCst) == 2).await;
    }
    assert!(client.is_connected());
    assert_eq!(client.next_retry_delay(), Duration::from_millis(10));

    client.close().await.unwrap();
    assert!(matches!(client.close().await, Err(SignalingError::AlreadyClosing)));
    sleep(Duration::from_millis(200)).await;
    assert_eq!(connects.load(Ordering::SeqCst), 2);
    assert!(!client.is_connected());

    let registry = relay.registry.clone();
    eventually("session removal", move || registry.get("flaky").is_none()).await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn connect_fails_when_nothing_listens() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = SignalingClient::new(
        SignalingConfig::for_session(&format!("ws://{addr}"), "nobody").unwrap(),
    );
    let err = client.connect().await.unwrap_err();
    assert!(matches!(
        err,
        SignalingError::Connect(_) | SignalingError::HandshakeTimeout(_)
    ));
    assert!(!client.is_connected());
}
