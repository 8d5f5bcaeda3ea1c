//! Forwarding a buffered request to one upstream.

use crate::upstream::Upstream;
use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "proxy-authorization",
    "proxy-authenticate",
];

pub const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");

#[derive(Error, Debug)]
pub enum ForwardError {
    /// The request never reached the upstream
    #[error("connect to {upstream} failed: {message}")]
    Connect { upstream: String, message: String },

    #[error("upstream {upstream} timed out")]
    Timeout { upstream: String },

    #[error("upstream {upstream} failed: {message}")]
    Other { upstream: String, message: String },
}

impl ForwardError {
    pub fn upstream(&self) -> &str {
        match self {
            ForwardError::Connect { upstream, .. }
            | ForwardError::Timeout { upstream }
            | ForwardError::Other { upstream, .. } => upstream,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ForwardError::Timeout { .. })
    }
}

pub type ForwardResult<T> = Result<T, ForwardError>;

/// Inbound request with its body already read
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_addr: SocketAddr,
    /// Host from an absolute-form request target; wins over the `Host` header
    pub authority: Option<String>,
}

impl ProxyRequest {
    pub fn new(method: Method, path_and_query: impl Into<String>, client_addr: SocketAddr) -> Self {
        Self {
            method,
            path_and_query: path_and_query.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            client_addr,
            authority: None,
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Methods that may be resent to another upstream after a timeout
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self.method,
            Method::GET | Method::HEAD | Method::OPTIONS | Method::PUT | Method::DELETE | Method::TRACE
        )
    }

    /// Client host without port, lowercased: the request target's host,
    /// else the `Host` header
    pub fn client_host(&self) -> Option<String> {
        let raw = self.authority.clone().or_else(|| {
            self.headers
                .get(header::HOST)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        })?;

        let host = strip_port(raw.trim());
        if host.is_empty() {
            None
        } else {
            Some(host.to_ascii_lowercase())
        }
    }

    /// Headers sent to the upstream: hop-by-hop removed, `Host` and `X-Real-IP` set.
    /// Without a client host the upstream gets an empty `Host`, never its own address.
    pub fn upstream_headers(&self) -> HeaderMap {
        let mut headers = without_hop_by_hop(&self.headers);
        headers.remove(header::HOST);
        headers.remove(&X_REAL_IP);

        let host = self
            .client_host()
            .and_then(|host| HeaderValue::from_str(&host).ok())
            .unwrap_or_else(|| HeaderValue::from_static(""));
        headers.insert(header::HOST, host);
        if let Ok(value) = HeaderValue::from_str(&self.client_addr.ip().to_string()) {
            headers.insert(X_REAL_IP, value);
        }

        headers
    }
}

/// Upstream answer, body fully read
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        return match rest.find(']') {
            Some(end) => &host[..end + 2],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Copy headers dropping hop-by-hop fields, including those listed in `Connection`
pub fn without_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let lower = name.as_str();
        if HOP_BY_HOP.contains(&lower) || listed.iter().any(|l| l == lower) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, upstream: &Upstream, request: &ProxyRequest)
        -> ForwardResult<ProxyResponse>;
}

/// Forwards over HTTP with `reqwest`
pub struct HttpForwarder {
    client: reqwest::Client,
}

impl HttpForwarder {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }

    fn classify(upstream: &Upstream, error: reqwest::Error) -> ForwardError {
        let upstream = upstream.address.clone();
        if error.is_connect() {
            ForwardError::Connect {
                upstream,
                message: error.to_string(),
            }
        } else if error.is_timeout() {
            ForwardError::Timeout { upstream }
        } else {
            ForwardError::Other {
                upstream,
                message: error.to_string(),
            }
        }
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(
        &self,
        upstream: &Upstream,
        request: &ProxyRequest,
    ) -> ForwardResult<ProxyResponse> {
        let url = upstream.url_for(&request.path_and_query);
        debug!("Forwarding {} {} to {}", request.method, request.path_and_query, upstream);

        let response = self
            .client
            .request(request.method.clone(), &url)
            .headers(request.upstream_headers())
            .body(request.body.clone())
            .send()
            .await
            .map_err(|e| Self::classify(upstream, e))?;

        let status = response.status();
        let headers = without_hop_by_hop(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|e| Self::classify(upstream, e))?;

        Ok(ProxyResponse {
            status,
            headers,
            body,
        })
    }
}
