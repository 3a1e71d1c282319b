//! `GatewayServer`: axum HTTP + WebSocket server.

use std::net::SocketAddr;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::admission::Rejection;
use crate::connection::PeerInfo;
use crate::error::{GatewayError, Result};
use crate::gateway::Gateway;
use crate::health::HealthResponse;
use crate::stats::ConnectionStats;
use crate::websocket::session::run_session;

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The gateway.
    pub gateway: Gateway,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// Query parameters accepted on the upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Application user opening the connection.
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
}

/// HTTP front end for a [`Gateway`].
pub struct GatewayServer {
    gateway: Gateway,
    host: String,
    port: u16,
    metrics: Option<PrometheusHandle>,
}

impl GatewayServer {
    /// Create a server for `gateway` on `host:port`.
    pub fn new(gateway: Gateway, host: impl Into<String>, port: u16) -> Self {
        Self {
            gateway,
            host: host.into(),
            port,
            metrics: None,
        }
    }

    /// Serve `/metrics` from this recorder handle.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// The gateway behind this server.
    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Build the axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            gateway: self.gateway.clone(),
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route(&self.gateway.config().path, get(ws_handler))
            .route("/health", get(health_handler))
            .route("/stats", get(stats_handler))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Bind and serve in a background task.
    ///
    /// Returns the bound address and the server task. The task ends once the
    /// gateway's shutdown closes the listener.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>)> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| GatewayError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local = listener.local_addr()?;

        if self.gateway.config().compression_enabled {
            warn!("compression enabled but permessage-deflate is unavailable, frames are sent uncompressed");
        }

        let app = self.router();
        let stop = self.gateway.listener_token();
        let handle = tokio::spawn(async move {
            let service = app.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(listener, service)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
            {
                error!(error = %e, "server error");
            }
        });

        info!(
            addr = %local,
            path = %self.gateway.config().path,
            "gateway listening"
        );
        Ok((local, handle))
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let status = match self {
            Self::CapacityExceeded { .. } | Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::OriginNotAllowed { .. } => StatusCode::FORBIDDEN,
        };
        let body = json!({ "error": self.reason(), "message": self.to_string() });
        (status, Json(body)).into_response()
    }
}

/// GET {path}: admission, then the WebSocket upgrade.
async fn ws_handler(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let permit = match state.gateway.admit(origin.as_deref()) {
        Ok(permit) => permit,
        Err(rejection) => return rejection.into_response(),
    };

    let peer = PeerInfo {
        remote_addr: Some(remote),
        user_id: params.user_id,
        origin,
    };
    let gateway = state.gateway;
    let max_message_size = gateway.config().max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| {
            let session_gateway = gateway.clone();
            gateway.track(run_session(session_gateway, socket, permit, peer))
        })
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(state.gateway.health())
}

/// GET /stats
async fn stats_handler(State(state): State<AppState>) -> Json<ConnectionStats> {
    Json(state.gateway.connection_stats())
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::config::GatewayConfig;

    fn make_server() -> GatewayServer {
        let gateway = Gateway::new(GatewayConfig {
            heartbeat_enabled: false,
            health_sweep_enabled: false,
            ..GatewayConfig::default()
        })
        .unwrap();
        GatewayServer::new(gateway, "127.0.0.1", 0)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 10_000)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap_or_default())
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let server = make_server();
        let (status, body) = get_json(server.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["compression_negotiated"], false);
    }

    #[tokio::test]
    async fn stats_endpoint_is_camel_case() {
        let server = make_server();
        let (status, body) = get_json(server.router(), "/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalConnections"], 0);
        assert_eq!(body["droppedMessages"], 0);
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_404() {
        let server = make_server();
        let req = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_with_local_handle_renders() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let server = make_server().with_metrics(handle);

        let req = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server();
        let req = Request::builder()
            .uri("/nonexistent")
            .body(Body::empty())
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn rejection_status_codes() {
        let cases = [
            (
                Rejection::CapacityExceeded { max: 1 },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (Rejection::ShuttingDown, StatusCode::SERVICE_UNAVAILABLE),
            (
                Rejection::OriginNotAllowed {
                    origin: "https://evil.example".into(),
                },
                StatusCode::FORBIDDEN,
            ),
        ];
        for (rejection, expected) in cases {
            assert_eq!(rejection.into_response().status(), expected);
        }
    }

    #[tokio::test]
    async fn listen_on_ephemeral_port() {
        let server = make_server();
        let (addr, handle) = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);

        server.gateway().shutdown().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let server = make_server();
        let (addr, _handle) = server.listen().await.unwrap();

        let clash = GatewayServer::new(server.gateway().clone(), "127.0.0.1", addr.port());
        match clash.listen().await {
            Err(GatewayError::Bind { addr: requested, .. }) => {
                assert!(requested.ends_with(&addr.port().to_string()));
            }
            other => panic!("expected bind error, got {:?}", other.map(|(a, _)| a)),
        }
        server.gateway().shutdown().await;
    }
}
