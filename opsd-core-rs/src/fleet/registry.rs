//! Member registry
//!
//! Members live in an arena indexed by `MemberId` and are never removed.
//! Each one is in exactly one of two sets:
//! - pending: not connected. Includes members with an attempt in flight,
//!   which are marked `Connecting` and skipped by the scheduler.
//! - connected: handshake done, receives broadcasts.
//!
//! Every attempt carries a sequence number. Notifications for an older
//! attempt than the member's latest are stale and ignored, and a failure
//! reported for a member that is already disconnected is a no-op, so
//! duplicate disconnect notifications are harmless.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::transport::Link;

/// Delay before retrying a member after its first failure is twice this
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound for the retry delay
pub const MAX_BACKOFF: Duration = Duration::from_secs(600);

/// Largest retry delay cap a registry accepts
pub const BACKOFF_CEILING: Duration = Duration::from_secs(24 * 60 * 60);

/// Handle of a member in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(usize);

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Connection state of a member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// A tracked endpoint
pub struct Member {
    host: String,
    backoff: Duration,
    next_attempt_at: Instant,
    state: ConnectionState,
    attempt: u64,
    link: Option<Arc<dyn Link>>,
}

impl Member {
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Current retry delay
    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    pub fn next_attempt_at(&self) -> Instant {
        self.next_attempt_at
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Sequence number of the latest attempt (0 before the first one)
    pub fn attempt(&self) -> u64 {
        self.attempt
    }
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Member")
            .field("host", &self.host)
            .field("backoff", &self.backoff)
            .field("state", &self.state)
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// Ticket for one connection attempt, handed out by `schedule_due`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub id: MemberId,
    pub seq: u64,
    pub host: String,
}

/// Partition of all members into pending and connected
pub struct Registry {
    members: Vec<Member>,
    index: HashMap<String, MemberId>,
    pending: BTreeSet<MemberId>,
    connected: Vec<MemberId>,
    max_backoff: Duration,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(MAX_BACKOFF)
    }
}

impl Registry {
    pub fn new(max_backoff: Duration) -> Self {
        Self {
            members: Vec::new(),
            index: HashMap::new(),
            pending: BTreeSet::new(),
            connected: Vec::new(),
            max_backoff: max_backoff.clamp(INITIAL_BACKOFF, BACKOFF_CEILING),
        }
    }

    /// Add a member, due for its first attempt at `now`.
    /// Returns `None` if the host is already tracked.
    pub fn register(&mut self, host: impl Into<String>, now: Instant) -> Option<MemberId> {
        let host = host.into();
        if self.index.contains_key(&host) {
            return None;
        }

        let id = MemberId(self.members.len());
        self.index.insert(host.clone(), id);
        self.members.push(Member {
            host,
            backoff: INITIAL_BACKOFF,
            next_attempt_at: now,
            state: ConnectionState::Disconnected,
            attempt: 0,
            link: None,
        });
        self.pending.insert(id);
        Some(id)
    }

    pub fn find(&self, host: &str) -> Option<MemberId> {
        self.index.get(host).copied()
    }

    pub fn member(&self, id: MemberId) -> Option<&Member> {
        self.members.get(id.0)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Claim every pending member whose deadline has passed.
    ///
    /// Claimed members are marked `Connecting` and stay in the pending set
    /// until their attempt reports back.
    pub fn schedule_due(&mut self, now: Instant) -> Vec<Attempt> {
        let mut due = Vec::new();

        for &id in &self.pending {
            let member = &mut self.members[id.0];
            if member.state != ConnectionState::Disconnected || member.next_attempt_at > now {
                continue;
            }
            member.state = ConnectionState::Connecting;
            member.attempt += 1;
            due.push(Attempt {
                id,
                seq: member.attempt,
                host: member.host.clone(),
            });
        }

        due
    }

    /// Move a member from pending to connected after a successful handshake.
    /// Resets its backoff. Returns false if the transition does not apply.
    ///
    /// If the sets turn out to be inconsistent, the connect is refused and
    /// the member is put back on pending, due again after its backoff.
    pub fn mark_connected(
        &mut self,
        id: MemberId,
        seq: u64,
        link: Arc<dyn Link>,
        now: Instant,
    ) -> bool {
        let Some(member) = self.members.get_mut(id.0) else {
            error!("connect for unknown member {}", id);
            return false;
        };
        if member.attempt != seq {
            debug!("{}: ignoring connect from stale attempt {}", member.host, seq);
            return false;
        }
        if member.state != ConnectionState::Connecting {
            warn!("{}: connect while {:?} ?!?", member.host, member.state);
            return false;
        }
        if self.connected.contains(&id) {
            error!("{}: already on connected ?!?", member.host);
            self.repair(id, now);
            return false;
        }
        if !self.pending.remove(&id) {
            error!("{}: connecting but not on pending ?!?", member.host);
            self.repair(id, now);
            return false;
        }

        member.state = ConnectionState::Connected;
        member.backoff = INITIAL_BACKOFF;
        member.link = Some(link);
        self.connected.push(id);
        true
    }

    /// Record a failed attempt or an unexpected disconnect.
    ///
    /// Doubles the backoff (up to the cap), schedules the next attempt and
    /// puts the member back on pending. Returns the new backoff, or `None`
    /// if the notification is stale or the member is already disconnected.
    pub fn mark_failed(&mut self, id: MemberId, seq: u64, now: Instant) -> Option<Duration> {
        let max_backoff = self.max_backoff;
        let member = self.settle(id, seq)?;
        member.backoff = member.backoff.saturating_mul(2).min(max_backoff);
        member.next_attempt_at = now + member.backoff;
        Some(member.backoff)
    }

    /// Record a disconnect we asked for. The member goes back to pending
    /// with its backoff unchanged.
    pub fn mark_closed(&mut self, id: MemberId, seq: u64, now: Instant) -> bool {
        match self.settle(id, seq) {
            Some(member) => {
                member.next_attempt_at = now + member.backoff;
                true
            }
            None => false,
        }
    }

    /// Put a member found in the wrong set back on pending only
    fn repair(&mut self, id: MemberId, now: Instant) {
        self.connected.retain(|c| *c != id);
        self.pending.insert(id);
        let member = &mut self.members[id.0];
        member.state = ConnectionState::Disconnected;
        member.link = None;
        member.next_attempt_at = now + member.backoff;
    }

    /// Common part of the transitions back to pending
    fn settle(&mut self, id: MemberId, seq: u64) -> Option<&mut Member> {
        let Some(member) = self.members.get_mut(id.0) else {
            error!("disconnect for unknown member {}", id);
            return None;
        };
        if member.attempt != seq {
            debug!("{}: ignoring disconnect from stale attempt {}", member.host, seq);
            return None;
        }

        match member.state {
            ConnectionState::Disconnected => {
                debug!("{}: not connected, ignoring duplicate disconnect", member.host);
                return None;
            }
            ConnectionState::Connecting => {
                if !self.pending.contains(&id) {
                    error!("{}: connecting but not on pending ?!?", member.host);
                    return None;
                }
            }
            ConnectionState::Connected => {
                let Some(pos) = self.connected.iter().position(|c| *c == id) else {
                    error!("{}: connected but not on connected ?!?", member.host);
                    return None;
                };
                if !self.pending.insert(id) {
                    error!("{}: already on pending ?!?", member.host);
                    return None;
                }
                self.connected.remove(pos);
            }
        }

        member.state = ConnectionState::Disconnected;
        member.link = None;
        Some(member)
    }

    /// Hosts and links of all connected members, in join order
    pub fn connected_links(&self) -> Vec<(String, Arc<dyn Link>)> {
        self.connected
            .iter()
            .filter_map(|id| {
                let member = &self.members[id.0];
                member.link.clone().map(|link| (member.host.clone(), link))
            })
            .collect()
    }

    /// Hosts of all connected members, in join order
    pub fn connected_hosts(&self) -> Vec<String> {
        self.connected
            .iter()
            .map(|id| self.members[id.0].host.clone())
            .collect()
    }

    /// Counts of (waiting, connecting, connected) members
    pub fn counts(&self) -> (usize, usize, usize) {
        let connecting = self
            .pending
            .iter()
            .filter(|id| self.members[id.0].state == ConnectionState::Connecting)
            .count();
        (self.pending.len() - connecting, connecting, self.connected.len())
    }

    /// Whether every member is in exactly one set
    pub fn is_consistent(&self) -> bool {
        self.members.iter().enumerate().all(|(i, member)| {
            let id = MemberId(i);
            let in_pending = self.pending.contains(&id);
            let in_connected = self.connected.contains(&id);
            in_pending != in_connected
                && in_connected == (member.state == ConnectionState::Connected)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Connector, MemoryConnector};

    fn link(connector: &MemoryConnector, host: &str) -> Arc<dyn Link> {
        connector.connect(host).unwrap().link
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let now = Instant::now();
        let mut registry = Registry::default();

        let a = registry.register("m1", now).unwrap();
        assert!(registry.register("m1", now).is_none());
        assert_eq!(registry.find("m1"), Some(a));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.counts(), (1, 0, 0));
    }

    #[test]
    fn test_schedule_due_claims_once() {
        let now = Instant::now();
        let mut registry = Registry::default();
        registry.register("m1", now);
        registry.register("m2", now + Duration::from_secs(5));

        let due = registry.schedule_due(now);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].host, "m1");
        assert_eq!(due[0].seq, 1);

        // m1 is in flight now, m2 not due yet
        assert!(registry.schedule_due(now).is_empty());
        assert_eq!(registry.counts(), (1, 1, 0));
        assert!(registry.is_consistent());

        let due = registry.schedule_due(now + Duration::from_secs(5));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].host, "m2");
    }

    #[test]
    fn test_backoff_sequence() {
        let mut now = Instant::now();
        let mut registry = Registry::default();
        let id = registry.register("m3", now).unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            let due = registry.schedule_due(now);
            assert_eq!(due.len(), 1);
            seen.push(registry.member(id).unwrap().backoff().as_secs());

            let backoff = registry.mark_failed(id, due[0].seq, now).unwrap();
            // Not due before the backoff has elapsed
            assert!(registry.schedule_due(now + backoff - Duration::from_millis(1)).is_empty());
            now += backoff;
        }
        assert_eq!(seen, vec![1, 2, 4]);

        let connector = MemoryConnector::new();
        let due = registry.schedule_due(now);
        assert!(registry.mark_connected(id, due[0].seq, link(&connector, "m3"), now));
        assert_eq!(registry.member(id).unwrap().backoff(), INITIAL_BACKOFF);

        // Next failure starts over from the reset value
        assert_eq!(registry.mark_failed(id, due[0].seq, now), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut now = Instant::now();
        let mut registry = Registry::default();
        let id = registry.register("m1", now).unwrap();

        let mut last = Duration::ZERO;
        for _ in 0..20 {
            let due = registry.schedule_due(now);
            let backoff = registry.mark_failed(id, due[0].seq, now).unwrap();
            assert!(backoff >= last);
            assert!(backoff <= MAX_BACKOFF);
            last = backoff;
            now += backoff;
        }
        assert_eq!(last, MAX_BACKOFF);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let now = Instant::now();
        let connector = MemoryConnector::new();
        let mut registry = Registry::default();
        let id = registry.register("m1", now).unwrap();

        let seq = registry.schedule_due(now)[0].seq;
        assert!(registry.mark_connected(id, seq, link(&connector, "m1"), now));
        assert_eq!(registry.connected_hosts(), vec!["m1".to_string()]);

        assert_eq!(registry.mark_failed(id, seq, now), Some(Duration::from_secs(2)));
        assert_eq!(registry.mark_failed(id, seq, now), None);
        assert_eq!(registry.member(id).unwrap().backoff(), Duration::from_secs(2));
        assert_eq!(registry.counts(), (1, 0, 0));
        assert!(registry.is_consistent());
    }

    #[test]
    fn test_stale_attempt_is_ignored() {
        let now = Instant::now();
        let connector = MemoryConnector::new();
        let mut registry = Registry::default();
        let id = registry.register("m1", now).unwrap();

        let first = registry.schedule_due(now)[0].seq;
        registry.mark_failed(id, first, now);
        let second = registry.schedule_due(now + Duration::from_secs(2))[0].seq;

        assert!(!registry.mark_connected(id, first, link(&connector, "m1"), now));
        assert_eq!(registry.mark_failed(id, first, now), None);
        assert!(registry.mark_connected(id, second, link(&connector, "m1"), now));
        assert!(registry.is_consistent());
    }

    #[test]
    fn test_connect_requires_claim() {
        let now = Instant::now();
        let connector = MemoryConnector::new();
        let mut registry = Registry::default();
        let id = registry.register("m1", now).unwrap();

        assert!(!registry.mark_connected(id, 0, link(&connector, "m1"), now));
        assert_eq!(registry.counts(), (1, 0, 0));
    }

    #[test]
    fn test_inconsistent_connect_is_retried() {
        let now = Instant::now();
        let connector = MemoryConnector::new();
        let mut registry = Registry::default();
        let a = registry.register("m1", now).unwrap();
        let b = registry.register("m2", now).unwrap();
        let due = registry.schedule_due(now);

        // m1 somehow already listed as connected, m2 missing from pending
        registry.connected.push(a);
        registry.pending.remove(&b);

        assert!(!registry.mark_connected(a, due[0].seq, link(&connector, "m1"), now));
        assert!(!registry.mark_connected(b, due[1].seq, link(&connector, "m2"), now));
        assert!(registry.is_consistent());
        assert_eq!(registry.counts(), (2, 0, 0));

        for id in [a, b] {
            let member = registry.member(id).unwrap();
            assert_eq!(member.state(), ConnectionState::Disconnected);
            assert_eq!(member.next_attempt_at(), now + INITIAL_BACKOFF);
        }
        assert_eq!(registry.schedule_due(now + INITIAL_BACKOFF).len(), 2);
    }

    #[test]
    fn test_huge_backoff_cap_is_clamped() {
        let mut now = Instant::now();
        let mut registry = Registry::new(Duration::MAX);
        let id = registry.register("m1", now).unwrap();

        let mut last = Duration::ZERO;
        for _ in 0..40 {
            let due = registry.schedule_due(now);
            last = registry.mark_failed(id, due[0].seq, now).unwrap();
            now = registry.member(id).unwrap().next_attempt_at();
        }
        assert_eq!(last, BACKOFF_CEILING);
    }

    #[test]
    fn test_mark_closed_keeps_backoff() {
        let now = Instant::now();
        let connector = MemoryConnector::new();
        let mut registry = Registry::default();
        let id = registry.register("m1", now).unwrap();

        let seq = registry.schedule_due(now)[0].seq;
        registry.mark_connected(id, seq, link(&connector, "m1"), now);
        assert!(registry.mark_closed(id, seq, now));

        let member = registry.member(id).unwrap();
        assert_eq!(member.state(), ConnectionState::Disconnected);
        assert_eq!(member.backoff(), INITIAL_BACKOFF);
        assert_eq!(member.next_attempt_at(), now + INITIAL_BACKOFF);
        assert!(registry.connected_links().is_empty());
    }
}
