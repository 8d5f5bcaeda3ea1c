//! Reverse proxy over a static upstream group
//!
//! Every inbound request, whatever its path, is forwarded to one of a fixed
//! list of interchangeable application replicas picked round-robin. The
//! client's host and IP travel upstream in `Host` and `X-Real-IP`. A replica
//! that refuses connections is skipped for the rest of the request and,
//! for a short while, for later requests too.

pub mod config;
pub mod dispatch;
pub mod forward;
pub mod nginx;
pub mod server;
pub mod upstream;

pub use config::ProxyConfig;
pub use dispatch::Dispatcher;
pub use forward::{
    ForwardError, ForwardResult, Forwarder, HttpForwarder, ProxyRequest, ProxyResponse,
};
pub use nginx::render_nginx_conf;
pub use server::{build_router, serve, serve_on, ProxyState};
pub use upstream::{PeerPolicy, PeerStatus, Upstream, UpstreamGroup};

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BalancerError {
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("No live upstreams")]
    NoLiveUpstreams,

    #[error("Upstream error: {0}")]
    Upstream(#[from] ForwardError),

    #[error("Request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("Unreadable request body: {message}")]
    BadRequest { message: String },

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BalancerError {
    /// Status returned to the client when this error ends a request
    pub fn status_code(&self) -> StatusCode {
        match self {
            BalancerError::NoLiveUpstreams => StatusCode::BAD_GATEWAY,
            BalancerError::Upstream(error) if error.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            BalancerError::Upstream(_) => StatusCode::BAD_GATEWAY,
            BalancerError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            BalancerError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            BalancerError::InvalidConfig { .. }
            | BalancerError::Client(_)
            | BalancerError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type BalancerResult<T> = Result<T, BalancerError>;
