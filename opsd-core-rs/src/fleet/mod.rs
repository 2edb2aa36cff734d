//! Fleet of miners and the shared ops state
//!
//! `Fleet` owns the one lock in the daemon. Behind it sit the member
//! registry and the `(value, mask)` pair. Nothing is ever sent while the
//! lock is held: every path that publishes first copies the state and the
//! links it needs, releases the lock, then publishes.
//!
//! Sends from different paths are not ordered against each other, so a
//! sender may finish after a newer state went out. Every sender re-reads
//! the state once it is done and sends again until what it sent last is
//! still current. The last message a member receives always carries the
//! latest state.

pub mod lifecycle;
pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::state::{OpsState, OPS_SET_TOPIC};
use crate::transport::{Connector, Link};

pub use registry::{Attempt, ConnectionState, Member, MemberId, Registry, INITIAL_BACKOFF, MAX_BACKOFF};

/// Publishing settings for state broadcasts
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Topic the state is published on
    pub topic: String,
    /// Ask the broker to retain the state
    pub retain: bool,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            topic: OPS_SET_TOPIC.to_string(),
            retain: true,
        }
    }
}

/// Point-in-time summary of the fleet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetStatus {
    pub waiting: usize,
    pub connecting: usize,
    pub connected: usize,
    pub state: OpsState,
}

struct Shared {
    registry: Registry,
    state: OpsState,
}

/// Members, their connections and the state pushed to them
pub struct Fleet {
    shared: Mutex<Shared>,
    connector: Arc<dyn Connector>,
    broadcast: BroadcastConfig,
}

impl Fleet {
    pub fn new(
        connector: Arc<dyn Connector>,
        broadcast: BroadcastConfig,
        initial: OpsState,
        max_backoff: Duration,
    ) -> Self {
        Self {
            shared: Mutex::new(Shared {
                registry: Registry::new(max_backoff),
                state: initial,
            }),
            connector,
            broadcast,
        }
    }

    /// Track a new member, due for its first attempt right away
    pub fn register(&self, host: &str) -> Option<MemberId> {
        let id = self.shared.lock().registry.register(host, Instant::now());
        if id.is_none() {
            warn!("{}: listed more than once, ignoring duplicate", host);
        }
        id
    }

    pub fn state(&self) -> OpsState {
        self.shared.lock().state
    }

    pub fn status(&self) -> FleetStatus {
        let shared = self.shared.lock();
        let (waiting, connecting, connected) = shared.registry.counts();
        FleetStatus {
            waiting,
            connecting,
            connected,
            state: shared.state,
        }
    }

    /// Run `f` against the registry under the lock
    pub fn with_registry<T>(&self, f: impl FnOnce(&Registry) -> T) -> T {
        f(&self.shared.lock().registry)
    }

    /// Hosts of the connected members, in join order
    pub fn connected_hosts(&self) -> Vec<String> {
        self.shared.lock().registry.connected_hosts()
    }

    /// Claim the members whose retry deadline has passed
    pub fn schedule_due(&self, now: Instant) -> Vec<Attempt> {
        self.shared.lock().registry.schedule_due(now)
    }

    /// Start a connection attempt for a claimed member
    pub fn attempt(self: &Arc<Self>, attempt: Attempt) {
        debug!("connecting to {} (attempt {})", attempt.host, attempt.seq);
        tokio::spawn(lifecycle::run(self.clone(), attempt));
    }

    /// Apply one input bit. Broadcasts and returns true if the state changed.
    pub fn apply_update(&self, bits: u64, on: bool) -> bool {
        let (before, after, targets) = {
            let mut shared = self.shared.lock();
            let before = shared.state;
            let Some(after) = before.apply(bits, on) else {
                return false;
            };
            shared.state = after;
            (before, after, shared.registry.connected_links())
        };

        info!(
            "update {:#x}={}: {} -> {}",
            bits,
            u8::from(on),
            before,
            after
        );
        self.send_settled(after, targets);
        true
    }

    /// Push the current state to every connected member
    pub fn broadcast_now(&self) -> usize {
        let (state, targets) = self.snapshot();
        self.send_settled(state, targets)
    }

    fn snapshot(&self) -> (OpsState, Vec<(String, Arc<dyn Link>)>) {
        let shared = self.shared.lock();
        (shared.state, shared.registry.connected_links())
    }

    /// Send `state`, then keep re-sending the current state to the whole
    /// fleet until it stops changing under us
    fn send_settled(&self, mut state: OpsState, mut targets: Vec<(String, Arc<dyn Link>)>) -> usize {
        loop {
            let sent = self.send_all(state, &targets);
            let (current, links) = self.snapshot();
            if current == state {
                return sent;
            }
            debug!("state moved to {} while sending {}, resending", current, state);
            state = current;
            targets = links;
        }
    }

    fn send_all(&self, state: OpsState, targets: &[(String, Arc<dyn Link>)]) -> usize {
        let payload = state.encode();
        targets
            .iter()
            .filter(|(host, link)| self.send_payload(host, link.as_ref(), &payload))
            .count()
    }

    fn send_payload(&self, host: &str, link: &dyn Link, payload: &str) -> bool {
        debug!("{} to {}", payload, host);
        match link.publish(&self.broadcast.topic, payload.as_bytes(), self.broadcast.retain) {
            Ok(()) => true,
            Err(e) => {
                warn!("{}: {}", host, e);
                false
            }
        }
    }

    /// Handshake succeeded. Moves the member to connected and, if we drive
    /// any bits, sends it the current state straight away.
    pub(crate) fn on_connected(&self, attempt: &Attempt, link: &Arc<dyn Link>) -> bool {
        let initial = {
            let mut shared = self.shared.lock();
            let now = Instant::now();
            if !shared.registry.mark_connected(attempt.id, attempt.seq, link.clone(), now) {
                return false;
            }
            (shared.state.mask != 0).then_some(shared.state)
        };

        info!("connected to {}", attempt.host);
        if let Some(mut state) = initial {
            loop {
                self.send_payload(&attempt.host, link.as_ref(), &state.encode());
                let current = self.state();
                if current == state {
                    break;
                }
                state = current;
            }
        }
        true
    }

    /// Attempt failed or the connection dropped. Returns the new backoff.
    pub(crate) fn on_failed(&self, attempt: &Attempt) -> Option<Duration> {
        self.shared
            .lock()
            .registry
            .mark_failed(attempt.id, attempt.seq, Instant::now())
    }

    /// We closed the connection ourselves
    pub(crate) fn on_closed(&self, attempt: &Attempt) -> bool {
        self.shared
            .lock()
            .registry
            .mark_closed(attempt.id, attempt.seq, Instant::now())
    }

    pub(crate) fn connector(&self) -> &dyn Connector {
        self.connector.as_ref()
    }

    /// Close every connected member's link
    pub fn disconnect_all(&self) {
        let targets = self.shared.lock().registry.connected_links();
        for (host, link) in targets {
            debug!("disconnecting {}", host);
            link.disconnect();
        }
    }
}
