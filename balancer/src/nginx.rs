//! nginx rendition of a [`ProxyConfig`].
//!
//! The output is a `conf.d` server file (no `http {}` wrapper) for the stock
//! nginx image. Directives whose value equals nginx's own default are left
//! out, so the default config renders to the minimal two-header block.

use crate::config::{ProxyConfig, DEFAULT_MAX_BODY_BYTES};
use std::fmt::Write;
use std::time::Duration;

const NGINX_TIMEOUT: Duration = Duration::from_secs(60);
const NGINX_MAX_FAILS: u32 = 1;
const NGINX_FAIL_TIMEOUT: Duration = Duration::from_secs(10);

fn seconds(duration: Duration) -> String {
    if duration.subsec_millis() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

pub fn render_nginx_conf(config: &ProxyConfig) -> String {
    let mut out = String::new();

    let peer_params = if config.max_fails != NGINX_MAX_FAILS
        || config.fail_timeout != NGINX_FAIL_TIMEOUT
    {
        format!(
            " max_fails={} fail_timeout={}",
            config.max_fails,
            seconds(config.fail_timeout)
        )
    } else {
        String::new()
    };

    let _ = writeln!(out, "upstream {} {{", config.upstream_name);
    for upstream in &config.upstreams {
        let _ = writeln!(out, "    server {}{};", upstream, peer_params);
    }
    let _ = writeln!(out, "}}");
    let _ = writeln!(out);

    let _ = writeln!(out, "server {{");
    let _ = writeln!(out, "    listen {};", config.listen.port());
    if config.max_body_bytes != DEFAULT_MAX_BODY_BYTES {
        let _ = writeln!(out, "    client_max_body_size {};", config.max_body_bytes);
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "    location / {{");
    let _ = writeln!(out, "        proxy_pass http://{};", config.upstream_name);
    let _ = writeln!(out, "        proxy_set_header Host $host;");
    let _ = writeln!(out, "        proxy_set_header X-Real-IP $remote_addr;");
    if config.connect_timeout != NGINX_TIMEOUT {
        let _ = writeln!(
            out,
            "        proxy_connect_timeout {};",
            seconds(config.connect_timeout)
        );
    }
    if config.read_timeout != NGINX_TIMEOUT {
        let _ = writeln!(
            out,
            "        proxy_read_timeout {};",
            seconds(config.read_timeout)
        );
    }
    let _ = writeln!(out, "    }}");
    let _ = writeln!(out, "}}");

    out
}
