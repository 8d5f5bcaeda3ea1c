use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Default `client_max_body_size` of the proxy: 1 MiB
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub listen: SocketAddr,
    /// Name of the upstream group, used when rendering nginx.conf
    pub upstream_name: String,
    /// `host:port` of every backend, in round-robin order
    pub upstreams: Vec<String>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Failures within `fail_timeout` before a peer is skipped; 0 disables accounting
    pub max_fails: u32,
    pub fail_timeout: Duration,
    pub max_body_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 80)),
            upstream_name: "backend".to_string(),
            upstreams: vec!["127.0.0.1:8000".to_string(), "127.0.0.1:8001".to_string()],
            connect_timeout: Duration::from_secs(60),
            read_timeout: Duration::from_secs(60),
            max_fails: 1,
            fail_timeout: Duration::from_secs(10),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl ProxyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listen(mut self, listen: SocketAddr) -> Self {
        self.listen = listen;
        self
    }

    pub fn with_upstreams<I, S>(mut self, upstreams: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.upstreams = upstreams.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_upstream_name(mut self, name: impl Into<String>) -> Self {
        self.upstream_name = name.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_max_fails(mut self, max_fails: u32) -> Self {
        self.max_fails = max_fails;
        self
    }

    pub fn with_fail_timeout(mut self, fail_timeout: Duration) -> Self {
        self.fail_timeout = fail_timeout;
        self
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.upstreams.is_empty() {
            return Err("At least one upstream is required".to_string());
        }

        for upstream in &self.upstreams {
            if !is_host_port(upstream) {
                return Err(format!("Upstream '{}' must be host:port", upstream));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for upstream in &self.upstreams {
            if !seen.insert(upstream.as_str()) {
                return Err(format!("Upstream '{}' is listed twice", upstream));
            }
        }

        if self.upstream_name.is_empty()
            || !self
                .upstream_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err("Upstream name must be a non-empty identifier".to_string());
        }

        if self.connect_timeout.is_zero() || self.read_timeout.is_zero() {
            return Err("Timeouts must be greater than 0".to_string());
        }

        if self.max_fails > 0 && self.fail_timeout.is_zero() {
            return Err("Fail timeout must be greater than 0 when max_fails is set".to_string());
        }

        Ok(())
    }
}

fn is_host_port(value: &str) -> bool {
    let Some((host, port)) = value.rsplit_once(':') else {
        return false;
    };
    !host.is_empty() && !host.contains('/') && port.parse::<u16>().is_ok_and(|p| p > 0)
}
