//! Session-scoped acknowledgment ids and outstanding-recipient tracking
//!
//! An id has the form `session_<startMillis>_<sequence>_<nonce>`. The
//! `session_<startMillis>` prefix names the running process instance; the
//! zero-padded sequence orders ids by generation, so ids sort
//! lexicographically in creation order. Ids from any other session are
//! never honored, which keeps acknowledgments from a previous run from
//! resolving anything in this one.

use crate::clock::{to_chrono, SharedClock};
use crate::peer::PeerDirectory;
use crate::types::PeerId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::*;

const ID_PREFIX: &str = "session_";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AckId(String);

impl AckId {
    pub fn compose(session_start_ms: i64, sequence: u64, nonce: u32) -> Self {
        Self(format!(
            "{ID_PREFIX}{session_start_ms}_{sequence:012}_{nonce:08x}"
        ))
    }

    /// Wraps a raw id received off the wire; validity is checked by [`AckId::parse`].
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn parse(&self) -> Option<ParsedAckId> {
        let rest = self.0.strip_prefix(ID_PREFIX)?;
        let mut parts = rest.split('_');
        let session_start_ms = parts.next()?.parse::<i64>().ok()?;
        let sequence = parts.next()?.parse::<u64>().ok()?;
        let nonce = u32::from_str_radix(parts.next()?, 16).ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(ParsedAckId {
            session: format!("{ID_PREFIX}{session_start_ms}"),
            session_start_ms,
            sequence,
            nonce,
        })
    }
}

impl std::fmt::Display for AckId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAckId {
    pub session: String,
    pub session_start_ms: i64,
    pub sequence: u64,
    pub nonce: u32,
}

/// Recipients still owing an acknowledgment for one push.
#[derive(Debug, Clone)]
pub struct AcknowledgmentRequest {
    pub id: AckId,
    pub session_id: String,
    pub sequence: u64,
    pub recipients: HashSet<PeerId>,
    pub created_at: DateTime<Utc>,
}

/// Session id -> generation sequence -> request
type SessionMap = HashMap<String, BTreeMap<u64, AcknowledgmentRequest>>;

#[derive(Debug)]
pub struct SessionTracker {
    session_id: String,
    session_start_ms: i64,
    counter: AtomicU64,
    sessions: Mutex<SessionMap>,
    peers: Arc<PeerDirectory>,
    clock: SharedClock,
}

impl SessionTracker {
    pub fn new(peers: Arc<PeerDirectory>, clock: SharedClock) -> Self {
        let start = clock.now().timestamp_millis();
        Self::with_session_start(start, peers, clock)
    }

    pub fn with_session_start(
        session_start_ms: i64,
        peers: Arc<PeerDirectory>,
        clock: SharedClock,
    ) -> Self {
        Self {
            session_id: format!("{ID_PREFIX}{session_start_ms}"),
            session_start_ms,
            counter: AtomicU64::new(0),
            sessions: Mutex::new(HashMap::new()),
            peers,
            clock,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn generate_id(&self) -> AckId {
        let sequence = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        AckId::compose(self.session_start_ms, sequence, rand::random::<u32>())
    }

    pub fn is_current_session(&self, id: &AckId) -> bool {
        id.parse()
            .map(|parsed| parsed.session == self.session_id)
            .unwrap_or(false)
    }

    /// Starts awaiting `recipients` under `id`.
    ///
    /// Every older request of this session is retired whether or not its
    /// recipients overlap, and so is any request awaiting one of the new
    /// recipients. Ids of other sessions are ignored. Returns whether the
    /// request was registered.
    pub fn register_pending<I>(&self, recipients: I, id: &AckId) -> bool
    where
        I: IntoIterator<Item = PeerId>,
    {
        let Some(parsed) = id.parse() else {
            warn!(%id, "Refusing to register malformed acknowledgment id");
            return false;
        };
        if parsed.session != self.session_id {
            debug!(%id, session = %self.session_id, "Refusing to register id from another session");
            return false;
        }

        let recipients: HashSet<PeerId> = recipients.into_iter().collect();
        if recipients.is_empty() {
            trace!(%id, "No recipients to await");
            return false;
        }

        let mut sessions = self.sessions.lock();

        let requests = sessions.entry(parsed.session.clone()).or_default();
        let superseded = requests.range(..parsed.sequence).count();
        let mut kept = requests.split_off(&parsed.sequence);
        std::mem::swap(requests, &mut kept);

        let mut overlapping = 0;
        for requests in sessions.values_mut() {
            requests.retain(|_, request| {
                let overlaps = !request.recipients.is_disjoint(&recipients);
                if overlaps {
                    overlapping += 1;
                }
                !overlaps
            });
        }

        let request = AcknowledgmentRequest {
            id: id.clone(),
            session_id: parsed.session.clone(),
            sequence: parsed.sequence,
            recipients,
            created_at: self.clock.now(),
        };
        sessions
            .entry(parsed.session)
            .or_default()
            .insert(parsed.sequence, request);
        sessions.retain(|_, requests| !requests.is_empty());

        debug!(%id, superseded, overlapping, "Registered pending acknowledgment");
        true
    }

    /// Marks `recipient` as having applied the push under `id`.
    pub fn resolve(&self, id: &AckId, recipient: &PeerId) -> bool {
        self.resolve_with(id, recipient, true)
    }

    /// Like [`resolve`](Self::resolve) but records `success` on the peer.
    ///
    /// Unknown sessions, unknown ids and recipients not in the request are
    /// treated as stale or duplicate replies and change nothing.
    pub fn resolve_with(&self, id: &AckId, recipient: &PeerId, success: bool) -> bool {
        let Some(parsed) = id.parse() else {
            return false;
        };
        if parsed.session != self.session_id {
            return false;
        }

        {
            let mut sessions = self.sessions.lock();
            let Some(requests) = sessions.get_mut(&parsed.session) else {
                return false;
            };
            let Some(request) = requests.get_mut(&parsed.sequence) else {
                return false;
            };
            if request.id != *id || !request.recipients.remove(recipient) {
                return false;
            }

            if request.recipients.is_empty() {
                requests.remove(&parsed.sequence);
                trace!(%id, "All recipients resolved");
            }
            if requests.is_empty() {
                sessions.remove(&parsed.session);
            }
        }

        self.peers.record_acknowledgment(recipient, id, success);
        true
    }

    /// Drops every request created more than `max_age` ago.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let cutoff = self.clock.now() - to_chrono(max_age);
        let mut removed = 0;
        let mut sessions = self.sessions.lock();
        for requests in sessions.values_mut() {
            requests.retain(|_, request| {
                let keep = request.created_at >= cutoff;
                if !keep {
                    removed += 1;
                }
                keep
            });
        }
        sessions.retain(|_, requests| !requests.is_empty());
        if removed > 0 {
            debug!(removed, "Swept expired acknowledgment requests");
        }
        removed
    }

    pub fn recipients_of(&self, id: &AckId) -> Option<HashSet<PeerId>> {
        let parsed = id.parse()?;
        self.sessions
            .lock()
            .get(&parsed.session)
            .and_then(|requests| requests.get(&parsed.sequence))
            .filter(|request| request.id == *id)
            .map(|request| request.recipients.clone())
    }

    pub fn contains(&self, id: &AckId) -> bool {
        self.recipients_of(id).is_some()
    }

    pub fn outstanding_requests(&self) -> usize {
        self.sessions.lock().values().map(BTreeMap::len).sum()
    }

    pub fn tracked_sessions(&self) -> usize {
        self.sessions.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::types::{PairingStatus, UserPermissions};

    struct Fixture {
        clock: Arc<ManualClock>,
        peers: Arc<PeerDirectory>,
        tracker: SessionTracker,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let peers = Arc::new(PeerDirectory::new(clock.clone()));
        for name in ["a", "b", "c", "d"] {
            peers.upsert_peer(
                PeerId::from(name),
                None,
                PairingStatus::Paired,
                UserPermissions::default(),
            );
        }
        let tracker = SessionTracker::new(peers.clone(), clock.clone());
        Fixture {
            clock,
            peers,
            tracker,
        }
    }

    fn ids(names: &[&str]) -> Vec<PeerId> {
        names.iter().map(|n| PeerId::from(*n)).collect()
    }

    #[test]
    fn generated_ids_belong_to_the_current_session_and_sort_by_creation() {
        let f = fixture();
        let generated: Vec<AckId> = (0..50).map(|_| f.tracker.generate_id()).collect();

        assert!(generated.iter().all(|id| f.tracker.is_current_session(id)));

        let mut sorted = generated.clone();
        sorted.sort();
        assert_eq!(sorted, generated);

        let unique: HashSet<_> = generated.iter().collect();
        assert_eq!(unique.len(), generated.len());
    }

    #[test]
    fn malformed_ids_do_not_parse() {
        for raw in [
            "",
            "session_",
            "session_abc_000000000001_0000000a",
            "session_1_2",
            "other_1_000000000001_0000000a",
            "session_1_000000000001_zz",
            "session_1_000000000001_0000000a_extra",
        ] {
            assert!(AckId::from_raw(raw).parse().is_none(), "{raw} parsed");
        }
    }

    #[test]
    fn newer_request_supersedes_older_without_overlap() {
        let f = fixture();
        let id1 = f.tracker.generate_id();
        let id2 = f.tracker.generate_id();

        assert!(f.tracker.register_pending(ids(&["a", "b"]), &id1));
        assert!(f.tracker.register_pending(ids(&["c", "d"]), &id2));

        assert!(!f.tracker.contains(&id1));
        assert_eq!(f.tracker.outstanding_requests(), 1);
        assert_eq!(
            f.tracker.recipients_of(&id2).unwrap(),
            ids(&["c", "d"]).into_iter().collect()
        );
    }

    #[test]
    fn overlapping_recipient_retires_request_regardless_of_order() {
        let f = fixture();
        let older = f.tracker.generate_id();
        let newer = f.tracker.generate_id();

        // A late registration of an older id still steals the overlapping
        // recipient from the newer request.
        assert!(f.tracker.register_pending(ids(&["a", "b"]), &newer));
        assert!(f.tracker.register_pending(ids(&["b"]), &older));

        assert!(!f.tracker.contains(&newer));
        assert!(f.tracker.contains(&older));
    }

    #[test]
    fn foreign_session_registration_is_a_no_op() {
        let f = fixture();
        let foreign = AckId::compose(1, 1, 7);
        assert!(!f.tracker.register_pending(ids(&["a"]), &foreign));
        assert_eq!(f.tracker.outstanding_requests(), 0);
        assert_eq!(f.tracker.tracked_sessions(), 0);
    }

    #[test]
    fn stale_and_unknown_resolutions_change_nothing() {
        let f = fixture();
        let id = f.tracker.generate_id();
        f.tracker.register_pending(ids(&["a", "b"]), &id);
        f.peers.mark_awaiting_ack(&PeerId::from("a"), &id);
        let before = f.tracker.recipients_of(&id);
        let view_before = f.peers.ack_view(&PeerId::from("a"));

        let unknown = f.tracker.generate_id();
        assert!(!f.tracker.resolve(&unknown, &PeerId::from("a")));
        assert!(!f.tracker.resolve(&id, &PeerId::from("c")));
        let foreign = AckId::compose(1, id.parse().unwrap().sequence, 1);
        assert!(!f.tracker.resolve(&foreign, &PeerId::from("a")));

        assert_eq!(f.tracker.recipients_of(&id), before);
        assert_eq!(f.peers.ack_view(&PeerId::from("a")), view_before);
    }

    #[test]
    fn round_trip_clears_requests_and_session() {
        let f = fixture();
        let id = f.tracker.generate_id();
        let a = PeerId::from("a");
        let b = PeerId::from("b");
        f.tracker.register_pending(vec![a.clone(), b.clone()], &id);
        f.peers.mark_awaiting_ack(&a, &id);
        f.peers.mark_awaiting_ack(&b, &id);

        assert!(f.tracker.resolve(&id, &a));
        assert_eq!(f.tracker.outstanding_requests(), 1);
        assert!(!f.tracker.resolve(&id, &a), "duplicate reply must be ignored");

        assert!(f.tracker.resolve(&id, &b));
        assert_eq!(f.tracker.outstanding_requests(), 0);
        assert_eq!(f.tracker.tracked_sessions(), 0);

        let view = f.peers.ack_view(&a).unwrap();
        assert!(!view.pending_acknowledgment);
        assert_eq!(view.last_acknowledgment_success, Some(true));
        assert_eq!(view.last_acknowledgment_id, Some(id));
        assert_eq!(view.last_acknowledgment_time, Some(f.clock.now()));
    }

    #[test]
    fn sweep_drops_only_old_requests() {
        let f = fixture();
        let old = f.tracker.generate_id();
        f.tracker.register_pending(ids(&["a"]), &old);

        f.clock.advance(Duration::from_secs(120));
        // Newer ids supersede older ones, so register the fresh one in a
        // separate tracker state by sweeping first.
        assert_eq!(f.tracker.sweep(Duration::from_secs(300)), 0);
        assert_eq!(f.tracker.sweep(Duration::from_secs(60)), 1);
        assert_eq!(f.tracker.outstanding_requests(), 0);
        assert_eq!(f.tracker.tracked_sessions(), 0);

        let fresh = f.tracker.generate_id();
        f.tracker.register_pending(ids(&["b"]), &fresh);
        assert_eq!(f.tracker.sweep(Duration::from_secs(60)), 0);
        assert!(f.tracker.contains(&fresh));
    }
}
