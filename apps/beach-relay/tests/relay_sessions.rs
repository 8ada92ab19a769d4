use std::net::SocketAddr;
use std::time::Duration;

use beach_relay::{serve, AppState, ConnectionConfig, SessionConfig, SessionRegistry};
use beach_relay::api::ApiAuth;
use futures_util::{SinkExt, StreamExt};
use signal_proto::{ControlMessage, IceCandidate, SignalingMessage};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

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

async fn connect(relay: &TestRelay, session: &str) -> Client {
    let url = format!("ws://{}/{}", relay.addr, session);
    let (stream, _) = connect_async(url).await.expect("websocket handshake");
    stream
}

async fn next_signal(client: &mut Client) -> SignalingMessage {
    loop {
        let frame = timeout(Duration::from_secs(2), client.next())
            .await
            .expect("frame before deadline")
            .expect("stream open")
            .expect("frame ok");
        if let Message::Text(text) = frame {
            return SignalingMessage::from_json(&text).expect("valid signaling frame");
        }
    }
}

async fn next_control(client: &mut Client) -> ControlMessage {
    next_signal(client)
        .await
        .control
        .expect("control message")
}

async fn assert_silent(client: &mut Client) {
    match timeout(Duration::from_millis(200), client.next()).await {
        Err(_) => {}
        Ok(Some(Ok(Message::Ping(_)))) => {}
        Ok(other) => panic!("unexpected frame: {other:?}"),
    }
}

async fn wait_for_removal(registry: &SessionRegistry, session: &str) {
    for _ in 0..100 {
        if registry.get(session).is_none() {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("session {session} was never removed");
}

#[test_timeout::tokio_timeout_test(20)]
async fn two_peers_are_paired_and_relayed() {
    let relay = start_relay().await;

    let mut x = connect(&relay, "room").await;
    let x_first = next_control(&mut x).await;
    assert_eq!(x_first.polite, Some(false));
    assert_eq!(x_first.connection_id, Some(0));
    assert_eq!(x_first.member_ids(), vec![0]);

    let mut y = connect(&relay, "room").await;
    let y_first = next_control(&mut y).await;
    assert_eq!(y_first.polite, Some(true));
    assert_eq!(y_first.connection_id, Some(1));
    assert_eq!(y_first.member_ids(), vec![0, 1]);

    let x_update = next_control(&mut x).await;
    assert_eq!(x_update.polite, Some(false));
    assert_eq!(x_update.member_ids(), vec![0, 1]);

    let candidate = SignalingMessage::candidate(IceCandidate::new(
        "candidate:842163049 1 udp 1677729535 203.0.113.7 40000 typ srflx raddr 0.0.0.0 rport 0",
    ));
    x.send(Message::Text(candidate.to_json().unwrap()))
        .await
        .unwrap();
    assert_eq!(next_signal(&mut y).await, candidate);
    assert_silent(&mut x).await;

    y.close(None).await.unwrap();
    let x_after = next_control(&mut x).await;
    assert_eq!(x_after.member_ids(), vec![0]);
    assert_eq!(x_after.polite, Some(false));

    x.close(None).await.unwrap();
    wait_for_removal(&relay.registry, "room").await;
}

#[test_timeout::tokio_timeout_test(20)]
async fn sessions_are_isolated_by_name() {
    let relay = start_relay().await;
    let mut a = connect(&relay, "alpha").await;
    let mut b = connect(&relay, "team/beta").await;

    assert_eq!(next_control(&mut a).await.member_ids(), vec![0]);
    let b_control = next_control(&mut b).await;
    assert_eq!(b_control.member_ids(), vec![0]);
    assert_eq!(b_control.polite, Some(false));

    let description = SignalingMessage::description(signal_proto::SessionDescription::offer(
        "v=0\r\na=ice-ufrag:abcd\r\n",
    ));
    a.send(Message::Text(description.to_json().unwrap()))
        .await
        .unwrap();
    assert_silent(&mut b).await;

    let mut names: Vec<String> = relay
        .registry
        .snapshot()
        .into_iter()
        .map(|summary| summary.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["alpha".to_string(), "team/beta".to_string()]);
}

#[test_timeout::tokio_timeout_test(20)]
async fn malformed_frames_do_not_disconnect() {
    let relay = start_relay().await;
    let mut x = connect(&relay, "lobby").await;
    next_control(&mut x).await;
    let mut y = connect(&relay, "lobby").await;
    next_control(&mut y).await;
    next_control(&mut x).await;

    x.send(Message::Text("definitely not json".into())).await.unwrap();
    x.send(Message::Text("{}".into())).await.unwrap();
    x.send(Message::Binary(vec![0xff, 0x00])).await.unwrap();
    assert_silent(&mut y).await;

    let answer = SignalingMessage::description(signal_proto::SessionDescription::answer(
        "v=0\r\na=ice-ufrag:efgh\r\n",
    ));
    x.send(Message::Binary(answer.to_json().unwrap().into_bytes()))
        .await
        .unwrap();
    assert_eq!(next_signal(&mut y).await, answer);
}

#[test_timeout::tokio_timeout_test(20)]
async fn close_all_closes_every_connection() {
    let relay = start_relay().await;
    let mut x = connect(&relay, "shutdown").await;
    next_control(&mut x).await;

    let registry = relay.registry.clone();
    let closer = tokio::spawn(async move { registry.close_all().await });

    let mut saw_close = false;
    while let Ok(Some(frame)) = timeout(Duration::from_secs(2), x.next()).await {
        match frame {
            Ok(Message::Close(_)) => saw_close = true,
            Ok(_) => {}
            Err(_) => break,
        }
    }
    assert!(saw_close);
    closer.await.unwrap();
    wait_for_removal(&relay.registry, "shutdown").await;
}
