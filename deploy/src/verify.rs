//! Post-deploy check that the proxy rotates across the replicas.
//!
//! Each replica answers `GET /instance` with `{"instance": "<hostname>"}`.
//! Requests that fail while the stack is still starting are retried until
//! the deadline; a reply without an `instance` field is a hard failure.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

const RETRY_DELAY: Duration = Duration::from_millis(500);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url} did not answer within {timeout:?}: {last_error}")]
    Timeout {
        url: String,
        timeout: Duration,
        last_error: String,
    },

    #[error("Response from {url} has no instance field")]
    MissingInstance { url: String },

    #[error("Only {seen} distinct instance(s) answered, expected at least {required}")]
    InsufficientCoverage { seen: usize, required: usize },
}

pub type VerifyResult<T> = Result<T, VerifyError>;

#[derive(Debug, Deserialize)]
struct InstanceReply {
    instance: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    /// Instance that answered each request, in order
    pub responses: Vec<String>,
    pub instances: BTreeSet<String>,
}

impl VerifyReport {
    /// At least `n` distinct replicas answered
    pub fn covers(&self, n: usize) -> bool {
        self.instances.len() >= n
    }

    pub fn require(&self, n: usize) -> VerifyResult<()> {
        if self.covers(n) {
            Ok(())
        } else {
            Err(VerifyError::InsufficientCoverage {
                seen: self.instances.len(),
                required: n,
            })
        }
    }
}

fn instance_url(base_url: &str) -> String {
    format!("{}/instance", base_url.trim_end_matches('/'))
}

async fn fetch_instance(client: &reqwest::Client, url: &str) -> Result<Option<String>, String> {
    let response = client.get(url).send().await.map_err(|e| e.to_string())?;
    let status = response.status();
    if !status.is_success() {
        return Err(format!("status {}", status));
    }
    let reply: InstanceReply = response.json().await.map_err(|e| e.to_string())?;
    Ok(reply.instance)
}

/// Issue `attempts` requests to `<base_url>/instance` and collect who answered
pub async fn verify_rotation(
    base_url: &str,
    attempts: usize,
    timeout: Duration,
) -> VerifyResult<VerifyReport> {
    let client = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT.min(timeout))
        .no_proxy()
        .build()?;
    let url = instance_url(base_url);
    let deadline = Instant::now() + timeout;
    let mut report = VerifyReport::default();

    info!("Verifying rotation at {} ({} requests)", url, attempts);

    for attempt in 1..=attempts {
        let instance = loop {
            match fetch_instance(&client, &url).await {
                Ok(Some(instance)) => break instance,
                Ok(None) => return Err(VerifyError::MissingInstance { url }),
                Err(e) => {
                    if Instant::now() + RETRY_DELAY > deadline {
                        return Err(VerifyError::Timeout {
                            url,
                            timeout,
                            last_error: e,
                        });
                    }
                    warn!("Request {} to {} failed: {}, retrying", attempt, url, e);
                    sleep(RETRY_DELAY).await;
                }
            }
        };

        debug!("Request {} answered by {}", attempt, instance);
        report.instances.insert(instance.clone());
        report.responses.push(instance);
    }

    info!(
        "{} distinct instance(s) answered: {:?}",
        report.instances.len(),
        report.instances
    );
    Ok(report)
}
