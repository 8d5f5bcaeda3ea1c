//! Static upstream group with round-robin selection.
//!
//! Peers are chosen in declaration order. A peer that failed `max_fails`
//! times is skipped until `fail_timeout` has passed since its last failure,
//! after which it is offered traffic again; one success clears its record.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A backend the proxy forwards to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    /// `host:port`
    pub address: String,
}

impl Upstream {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    /// Absolute URL for a request target on this upstream
    pub fn url_for(&self, path_and_query: &str) -> String {
        if path_and_query.starts_with('/') {
            format!("http://{}{}", self.address, path_and_query)
        } else {
            format!("http://{}/{}", self.address, path_and_query)
        }
    }
}

impl std::fmt::Display for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// Passive health policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerPolicy {
    pub max_fails: u32,
    pub fail_timeout: Duration,
}

impl Default for PeerPolicy {
    fn default() -> Self {
        Self {
            max_fails: 1,
            fail_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct PeerState {
    fails: u32,
    checked_at: Option<Instant>,
}

impl PeerState {
    fn is_available(&self, policy: &PeerPolicy, now: Instant) -> bool {
        if policy.max_fails == 0 || self.fails < policy.max_fails {
            return true;
        }
        match self.checked_at {
            Some(checked_at) => now.duration_since(checked_at) >= policy.fail_timeout,
            None => true,
        }
    }
}

/// Health snapshot of one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub address: String,
    pub fails: u32,
    pub available: bool,
}

pub struct UpstreamGroup {
    peers: Vec<Upstream>,
    states: Mutex<Vec<PeerState>>,
    cursor: AtomicUsize,
    policy: PeerPolicy,
}

impl UpstreamGroup {
    /// Returns `None` for an empty peer list
    pub fn new(peers: Vec<Upstream>, policy: PeerPolicy) -> Option<Self> {
        if peers.is_empty() {
            return None;
        }
        let states = vec![PeerState::default(); peers.len()];
        Some(Self {
            peers,
            states: Mutex::new(states),
            cursor: AtomicUsize::new(0),
            policy,
        })
    }

    pub fn from_addresses<I, S>(addresses: I, policy: PeerPolicy) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(addresses.into_iter().map(Upstream::new).collect(), policy)
    }

    pub(crate) fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn peers(&self) -> &[Upstream] {
        &self.peers
    }

    pub fn peer(&self, index: usize) -> Option<&Upstream> {
        self.peers.get(index)
    }

    /// A lone peer is never marked down, there is nowhere else to go
    fn is_available(&self, state: &PeerState, now: Instant) -> bool {
        self.peers.len() == 1 || state.is_available(&self.policy, now)
    }

    /// Pick the next peer for a request that already tried `tried`
    pub fn next_peer(&self, tried: &[usize]) -> Option<usize> {
        let count = self.peers.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % count;
        let now = Instant::now();
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());

        (0..count)
            .map(|offset| (start + offset) % count)
            .find(|index| !tried.contains(index) && self.is_available(&states[*index], now))
    }

    pub fn report_failure(&self, index: usize) {
        let now = Instant::now();
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let Some(state) = states.get_mut(index) else {
            return;
        };

        // failures only accumulate within one fail_timeout window
        if let Some(checked_at) = state.checked_at {
            if now.duration_since(checked_at) >= self.policy.fail_timeout {
                state.fails = 0;
            }
        }
        state.fails = state.fails.saturating_add(1);
        state.checked_at = Some(now);
    }

    pub fn report_success(&self, index: usize) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = states.get_mut(index) {
            *state = PeerState::default();
        }
    }

    pub fn status(&self) -> Vec<PeerStatus> {
        let now = Instant::now();
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        self.peers
            .iter()
            .zip(states.iter())
            .map(|(peer, state)| PeerStatus {
                address: peer.address.clone(),
                fails: state.fails,
                available: self.is_available(state, now),
            })
            .collect()
    }
}
