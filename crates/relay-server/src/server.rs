//! Axum HTTP server hosting event-stream endpoints.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::request::StreamRequest;
use crate::shutdown::ShutdownCoordinator;
use crate::stream::callback::is_callback_request;
use crate::stream::handler::HandlerFactory;
use crate::stream::hub::StreamHub;

/// Shared state for the server's own routes.
#[derive(Clone)]
struct AppState {
    hubs: Arc<RwLock<Vec<StreamHub>>>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

/// The relay server.
///
/// Register endpoints first, then call [`router`](Self::router) or
/// [`listen`](Self::listen); endpoints registered afterwards are not routed.
pub struct RelayServer {
    config: ServerConfig,
    hubs: Arc<RwLock<Vec<StreamHub>>>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl RelayServer {
    /// Create a new server.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            hubs: Arc::new(RwLock::new(Vec::new())),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            metrics: None,
        }
    }

    /// Serve `GET /metrics` from the given Prometheus handle.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Mount an event-stream endpoint at `path` and return its hub.
    ///
    /// `ANY {path}` opens a stream, or is handled as a callback when the
    /// caller does not accept `text/event-stream` but sends `X-Client-ID`.
    /// `POST {path}/callback` is always a callback. Without a factory every
    /// connection uses [`NoopHandler`](crate::stream::handler::NoopHandler).
    pub fn register_stream_endpoint(&self, path: &str, factory: Option<HandlerFactory>) -> StreamHub {
        let path = normalize_path(path);
        let hub = StreamHub::new(
            path.clone(),
            self.config.stream.clone(),
            factory,
            self.shutdown.clone(),
        );
        self.hubs.write().push(hub.clone());
        info!(path, "stream endpoint registered");
        hub
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            hubs: self.hubs.clone(),
            shutdown: self.shutdown.clone(),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state);

        for hub in self.hubs.read().iter() {
            let callback_path = callback_path(hub.path());
            let endpoint = Router::new()
                .route(hub.path(), any(stream_entry))
                .route(&callback_path, post(callback_entry))
                .with_state(hub.clone());
            router = router.merge(endpoint);
        }

        router
            .layer(DefaultBodyLimit::max(self.config.max_body_bytes))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// Returns the bound address (useful with port `0`) and the server task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        let app = self.router();
        let token = self.shutdown.token();

        info!(%local_addr, "relay server listening");
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(token.cancelled_owned())
                .await;
            if let Err(e) = served {
                error!(error = %e, "server terminated with error");
            }
        });
        Ok((local_addr, handle))
    }

    /// Close every stream, stop accepting, and wait for connection workers.
    ///
    /// Returns `false` if workers were still running after the configured
    /// shutdown timeout.
    pub async fn graceful_shutdown(&self) -> bool {
        let closed: usize = self.hubs.read().iter().map(StreamHub::close_all).sum();
        info!(closed, "shutting down relay server");
        self.shutdown
            .graceful_shutdown(self.config.shutdown_timeout())
            .await
    }

    /// Registered endpoint hubs.
    pub fn hubs(&self) -> Vec<StreamHub> {
        self.hubs.read().clone()
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Collapse repeated slashes and ensure a single leading slash.
fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

fn callback_path(path: &str) -> String {
    if path == "/" {
        "/callback".into()
    } else {
        format!("{path}/callback")
    }
}

/// ANY {path}
async fn stream_entry(State(hub): State<StreamHub>, request: StreamRequest) -> Response {
    if is_callback_request(request.headers()) {
        return callback_entry(State(hub), request).await;
    }
    match hub.accept(request).await {
        Ok(connection) => connection.into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST {path}/callback
async fn callback_entry(State(hub): State<StreamHub>, request: StreamRequest) -> Response {
    match hub.handle_callback(request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let hubs = state.hubs.read().clone();
    let connections = hubs.iter().map(StreamHub::len).sum();
    let endpoints = hubs.iter().map(|hub| hub.path().to_owned()).collect();
    Json(health::health_check(
        state.start_time,
        state.shutdown.is_shutting_down(),
        connections,
        endpoints,
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::stream::handler::{EventHandler, handler_factory};

    fn make_server() -> RelayServer {
        RelayServer::new(ServerConfig::default())
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[test]
    fn path_normalization() {
        assert_eq!(normalize_path("events"), "/events");
        assert_eq!(normalize_path("//api///events/"), "/api/events");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(callback_path("/events"), "/events/callback");
        assert_eq!(callback_path("/"), "/callback");
    }

    #[test]
    fn register_returns_hub_for_path() {
        let server = make_server();
        let hub = server.register_stream_endpoint("//events", None);
        assert_eq!(hub.path(), "/events");
        assert_eq!(server.hubs().len(), 1);
    }

    #[tokio::test]
    async fn health_lists_endpoints() {
        let server = make_server();
        let _ = server.register_stream_endpoint("/events", None);
        let resp = server
            .router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let parsed = body_json(resp).await;
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 0);
        assert_eq!(parsed["endpoints"][0], "/events");
    }

    #[tokio::test]
    async fn metrics_without_handle_is_404() {
        let resp = make_server()
            .router()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_with_handle_renders() {
        let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle();
        let resp = make_server()
            .with_metrics(handle)
            .router()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn stream_route_opens_event_stream() {
        let server = make_server();
        let hub = server.register_stream_endpoint("/events", None);
        let resp = server
            .router()
            .oneshot(
                Request::builder()
                    .uri("/events")
                    .header("accept", "text/event-stream")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "text/event-stream");
        assert_eq!(hub.len(), 1);
    }

    #[tokio::test]
    async fn header_on_stream_path_is_callback() {
        let server = make_server();
        let _ = server.register_stream_endpoint("/events", None);
        let resp = server
            .router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/events")
                    .header("x-client-id", "nobody")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["error"], "client not found: nobody");
    }

    #[tokio::test]
    async fn blank_client_header_opens_stream() {
        let server = make_server();
        let hub = server.register_stream_endpoint("/events", None);
        let resp = server
            .router()
            .oneshot(
                Request::builder()
                    .uri("/events")
                    .header("x-client-id", "")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "text/event-stream");
        assert_eq!(hub.len(), 1);
    }

    #[tokio::test]
    async fn callback_route_without_id_is_400() {
        let server = make_server();
        let _ = server.register_stream_endpoint("/events", None);
        let resp = server
            .router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/events/callback")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"], "missing client id");
    }

    #[tokio::test]
    async fn refused_connection_returns_error_payload() {
        struct Refuse;

        #[async_trait::async_trait]
        impl EventHandler for Refuse {
            async fn on_connect(&self, _request: &StreamRequest) -> Result<(), crate::errors::HandlerError> {
                Err("closed for maintenance".into())
            }
        }

        let server = make_server();
        let hub = server.register_stream_endpoint("/events", Some(handler_factory(|| Refuse)));
        let resp = server
            .router()
            .oneshot(Request::builder().uri("/events").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(resp).await["error"],
            "connect failed: closed for maintenance"
        );
        assert!(hub.is_empty());
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let resp = make_server()
            .router()
            .oneshot(Request::builder().uri("/nonexistent").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn shutdown_flag_shows_in_health() {
        let server = make_server();
        server.shutdown().shutdown();
        let resp = server
            .router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["status"], "shutting_down");
    }
}
