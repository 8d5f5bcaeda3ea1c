use crate::forward::{ForwardError, Forwarder, ProxyRequest, ProxyResponse};
use crate::upstream::{PeerStatus, UpstreamGroup};
use crate::{BalancerError, BalancerResult};
use tracing::{debug, warn};

/// Sends each request to the group's next live peer, moving on to the
/// following peer when the attempt fails in a way that is safe to repeat
pub struct Dispatcher {
    group: UpstreamGroup,
    forwarder: Box<dyn Forwarder>,
}

impl Dispatcher {
    pub fn new(group: UpstreamGroup, forwarder: Box<dyn Forwarder>) -> Self {
        Self { group, forwarder }
    }

    pub async fn dispatch(&self, request: &ProxyRequest) -> BalancerResult<ProxyResponse> {
        let mut tried = Vec::with_capacity(self.group.len());
        let mut last_error: Option<ForwardError> = None;

        while let Some(index) = self.group.next_peer(&tried) {
            tried.push(index);
            let Some(upstream) = self.group.peer(index) else {
                break;
            };

            match self.forwarder.forward(upstream, request).await {
                Ok(response) => {
                    self.group.report_success(index);
                    debug!(
                        "{} {} served by {} ({})",
                        request.method, request.path_and_query, upstream, response.status
                    );
                    return Ok(response);
                }
                Err(error) => {
                    self.group.report_failure(index);
                    warn!("Upstream attempt failed: {}", error);

                    let retry = match &error {
                        ForwardError::Connect { .. } => true,
                        ForwardError::Timeout { .. } | ForwardError::Other { .. } => {
                            request.is_idempotent()
                        }
                    };
                    last_error = Some(error);
                    if !retry {
                        break;
                    }
                }
            }
        }

        match last_error {
            Some(error) => Err(BalancerError::Upstream(error)),
            None => {
                let down: Vec<String> = self
                    .group
                    .status()
                    .into_iter()
                    .filter(|peer| !peer.available)
                    .map(|peer: PeerStatus| format!("{} ({} fails)", peer.address, peer.fails))
                    .collect();
                warn!(
                    "No live upstreams for {} {}, down: [{}]",
                    request.method,
                    request.path_and_query,
                    down.join(", ")
                );
                Err(BalancerError::NoLiveUpstreams)
            }
        }
    }
}
