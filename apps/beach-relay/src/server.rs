use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::ws::WebSocket;
use axum::extract::{ConnectInfo, Path, Request, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::StreamExt;
use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::api::{self, ApiAuth};
use crate::config::ConnectionConfig;
use crate::connection::{run_connection, ConnectionMeta};
use crate::registry::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    pub connection: ConnectionConfig,
    pub auth: Arc<ApiAuth>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        registry: SessionRegistry,
        connection: ConnectionConfig,
        auth: ApiAuth,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            registry,
            connection,
            auth: Arc::new(auth),
            metrics,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/favicon.ico", get(|| async { StatusCode::NOT_FOUND }))
        .route("/metrics", get(metrics_handler))
        .route("/api/v1/sessions", get(api::list_sessions))
        .route("/", get(missing_session))
        .route("/*session", get(ws_handler))
        .layer(middleware::from_fn(track_http))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the relay on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server shutdown with error")
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn missing_session() -> Response {
    (StatusCode::BAD_REQUEST, "session name required").into_response()
}

async fn ws_handler(
    State(state): State<AppState>,
    Path(session): Path<String>,
    remote: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let name = session.trim_start_matches('/').to_string();
    if name.is_empty() {
        return missing_session().await;
    }
    let remote = remote
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    debug!(session = %name, %remote, "upgrading signaling connection");

    let max_message_size = state.connection.max_message_size;
    ws.max_message_size(max_message_size)
        .max_frame_size(max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, name, remote, user_agent, state))
}

async fn handle_socket(
    socket: WebSocket,
    session: String,
    remote: String,
    user_agent: String,
    state: AppState,
) {
    let (writer, reader) = socket.split();
    run_connection(
        writer,
        reader,
        &session,
        ConnectionMeta::new(remote, user_agent),
        state.registry.clone(),
        state.connection.clone(),
    )
    .await;
}

async fn track_http(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let started = Instant::now();
    let response = next.run(request).await;
    let code = response.status().as_u16().to_string();
    counter!("http_requests_total", 1, "code" => code.clone(), "method" => method.clone());
    histogram!(
        "http_request_duration_seconds",
        started.elapsed().as_secs_f64(),
        "code" => code,
        "method" => method
    );
    response
}

/// Resolves on ctrl-c or SIGTERM, then closes every relay connection.
pub async fn shutdown_signal(registry: SessionRegistry) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received; closing connections");
    registry.close_all().await;
}
