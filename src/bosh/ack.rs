//! Request ids and the acknowledgment / retry registry (XEP-0124 §9, §14).

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::Rng;

use super::body::Body;

/// Exclusive upper bound of the initial RID: 2^52, so that any realistic
/// session stays well below 2^53.
pub const RID_SEED_BOUND: u64 = 1 << 52;

/// RIDs must stay below 2^53 (XEP-0124 §14).
pub const RID_LIMIT: u64 = 1 << 53;

/// Monotonic RID counter, seeded once per `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestIds {
    next: u64,
    last: Option<u64>,
}

impl RequestIds {
    pub fn random() -> Self {
        Self::starting_at(rand::rng().random_range(0..RID_SEED_BOUND))
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: first,
            last: None,
        }
    }

    /// Allocate the next RID. Never reuses a value.
    pub fn allocate(&mut self) -> u64 {
        let rid = self.next;
        self.next += 1;
        self.last = Some(rid);
        rid
    }

    /// Last RID handed out, if any.
    pub fn last(&self) -> Option<u64> {
        self.last
    }

    #[cfg(test)]
    pub fn peek(&self) -> u64 {
        self.next
    }
}

/// A request as it went out on the wire, kept for verbatim retransmission.
#[derive(Debug, Clone, PartialEq)]
pub struct SentRequest {
    pub body: Arc<Body>,
    pub wire: Arc<[u8]>,
}

impl SentRequest {
    pub fn rid(&self) -> Option<u64> {
        self.body.rid
    }
}

/// Requests not yet known to have reached the connection manager, in RID
/// order.
#[derive(Debug, Default)]
pub struct AckRegistry {
    pending: BTreeMap<u64, SentRequest>,
}

impl AckRegistry {
    pub fn insert(&mut self, rid: u64, request: SentRequest) {
        self.pending.insert(rid, request);
    }

    /// A response to `rid` arrived: the request evidently reached the far end.
    pub fn received(&mut self, rid: u64) -> Option<SentRequest> {
        self.pending.remove(&rid)
    }

    /// The far end acknowledged everything up to and including `ack`.
    /// Returns how many entries were released.
    pub fn acknowledge(&mut self, ack: u64) -> usize {
        let before = self.pending.len();
        self.pending = match ack.checked_add(1) {
            Some(first_kept) => self.pending.split_off(&first_kept),
            None => BTreeMap::new(),
        };
        before - self.pending.len()
    }

    /// Everything still unacknowledged, ascending by RID.
    pub fn unacknowledged(&self) -> Vec<SentRequest> {
        self.pending.values().cloned().collect()
    }

    pub fn rids(&self) -> Vec<u64> {
        self.pending.keys().copied().collect()
    }

    #[cfg(test)]
    pub fn lowest(&self) -> Option<u64> {
        self.pending.keys().next().copied()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
