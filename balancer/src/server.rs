//! HTTP front of the proxy
//!
//! A single fallback route catches every method and path, reads the body
//! (bounded by `max_body_bytes`) and hands the request to the [`Dispatcher`].
//! Shutdown is graceful on Ctrl+C or SIGTERM.

use crate::config::ProxyConfig;
use crate::dispatch::Dispatcher;
use crate::forward::{HttpForwarder, ProxyRequest};
use crate::upstream::{PeerPolicy, UpstreamGroup};
use crate::{BalancerError, BalancerResult};
use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::CONTENT_LENGTH;
use axum::response::{IntoResponse, Response};
use axum::Router;
use http_body_util::LengthLimitError;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub struct ProxyState {
    pub dispatcher: Dispatcher,
    pub max_body_bytes: usize,
}

impl ProxyState {
    pub fn new(dispatcher: Dispatcher, max_body_bytes: usize) -> Self {
        Self {
            dispatcher,
            max_body_bytes,
        }
    }

    /// Validate the config and wire an HTTP forwarder to its upstream group
    pub fn from_config(config: &ProxyConfig) -> BalancerResult<Self> {
        config
            .validate()
            .map_err(|message| BalancerError::InvalidConfig { message })?;

        let policy = PeerPolicy {
            max_fails: config.max_fails,
            fail_timeout: config.fail_timeout,
        };
        let group = UpstreamGroup::from_addresses(config.upstreams.iter().cloned(), policy)
            .ok_or_else(|| BalancerError::InvalidConfig {
                message: "At least one upstream is required".to_string(),
            })?;
        let forwarder = HttpForwarder::new(config.connect_timeout, config.read_timeout)?;

        Ok(Self::new(
            Dispatcher::new(group, Box::new(forwarder)),
            config.max_body_bytes,
        ))
    }
}

impl IntoResponse for BalancerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let reason = status.canonical_reason().unwrap_or("Error");
        (status, format!("{} {}\n", status.as_u16(), reason)).into_response()
    }
}

pub fn build_router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .fallback(proxy_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn proxy_handler(
    State(state): State<Arc<ProxyState>>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    match forward_request(&state, client_addr, request).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    }
}

async fn forward_request(
    state: &ProxyState,
    client_addr: SocketAddr,
    request: Request,
) -> BalancerResult<Response> {
    let limit = state.max_body_bytes;
    let (parts, body) = request.into_parts();

    let declared = parts
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());
    if declared.is_some_and(|length| length > limit) {
        return Err(BalancerError::BodyTooLarge { limit });
    }

    let body = read_body(body, limit).await?;

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let proxy_request = ProxyRequest {
        method: parts.method,
        path_and_query,
        headers: parts.headers,
        body,
        client_addr,
        authority: parts.uri.authority().map(|a| a.to_string()),
    };

    let upstream_response = state.dispatcher.dispatch(&proxy_request).await?;

    let mut response = Response::new(Body::from(upstream_response.body));
    *response.status_mut() = upstream_response.status;
    *response.headers_mut() = upstream_response.headers;
    Ok(response)
}

/// Read the whole body. Only going over `limit` is a 413; a body that
/// cannot be read (client gone, broken chunking) is a 400.
async fn read_body(body: Body, limit: usize) -> BalancerResult<Bytes> {
    axum::body::to_bytes(body, limit).await.map_err(|error| {
        let inner = error.into_inner();
        if is_length_limit(&*inner) {
            BalancerError::BodyTooLarge { limit }
        } else {
            BalancerError::BadRequest {
                message: inner.to_string(),
            }
        }
    })
}

fn is_length_limit(error: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(error);
    while let Some(error) = current {
        if error.is::<LengthLimitError>() {
            return true;
        }
        current = error.source();
    }
    false
}

/// Bind `config.listen` and serve until Ctrl+C or SIGTERM
pub async fn serve(config: ProxyConfig) -> BalancerResult<()> {
    let listener = TcpListener::bind(config.listen).await?;
    serve_on(listener, &config, shutdown_signal()).await
}

/// Serve on an already bound listener until `shutdown` resolves
pub async fn serve_on<F>(listener: TcpListener, config: &ProxyConfig, shutdown: F) -> BalancerResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let state = Arc::new(ProxyState::from_config(config)?);
    let app = build_router(state);

    info!(
        "Proxy listening on {} with upstreams [{}]",
        listener.local_addr()?,
        config.upstreams.join(", ")
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    info!("Proxy shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
