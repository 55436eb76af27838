//! Correlation table: pending results keyed by call id.
//!
//! Each duplex call registers a single-shot settlement channel under a
//! freshly drawn id. Settlement removes the entry before firing, so a given
//! id resolves or rejects at most once, and an id is never reused while its
//! call is still live.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;

use crate::error::BridgeError;
use crate::protocol::{CALL_ID_SPACE, CallId, RawReply};

pub(crate) type Settlement = Result<RawReply, BridgeError>;

/// Draw 64 bits of entropy. UUID v4 is the crate's randomness source; the
/// allocator needs uniform bits, not a CSPRNG.
pub(crate) fn entropy_u64() -> u64 {
    let b = uuid::Uuid::new_v4().into_bytes();
    u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

fn random_call_id() -> CallId {
    CallId::from((entropy_u64() % CALL_ID_SPACE as u64) as u32)
}

#[derive(Default)]
pub(crate) struct CorrelationTable {
    pending: DashMap<CallId, oneshot::Sender<Settlement>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id not held by any live call and register a pending
    /// result under it. Retries on collision; with 10^8 ids and a handful
    /// in flight, a retry is vanishingly rare.
    pub fn register(&self) -> (CallId, oneshot::Receiver<Settlement>) {
        loop {
            let id = random_call_id();
            match self.pending.entry(id) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    let (tx, rx) = oneshot::channel();
                    slot.insert(tx);
                    return (id, rx);
                }
            }
        }
    }

    /// Fulfill the pending result for `id`. Returns false if no entry
    /// exists (stale correlation), which is the caller's cue to log and
    /// move on.
    pub fn resolve(&self, id: CallId, reply: RawReply) -> bool {
        self.settle(id, Ok(reply))
    }

    /// Reject the pending result for `id`. Returns false on stale ids.
    pub fn reject(&self, id: CallId, error: BridgeError) -> bool {
        self.settle(id, Err(error))
    }

    pub fn is_pending(&self, id: CallId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Drop an entry without settling it (the caller abandoned the receiver).
    pub fn discard(&self, id: CallId) {
        self.pending.remove(&id);
    }

    /// Reject every outstanding call, e.g. when the connection drops.
    pub fn reject_all(&self, mut error: impl FnMut() -> BridgeError) {
        let ids: Vec<CallId> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.settle(id, Err(error()));
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    fn settle(&self, id: CallId, settlement: Settlement) -> bool {
        match self.pending.remove(&id) {
            Some((_, tx)) => {
                // Receiver may already be gone; settlement is still consumed.
                let _ = tx.send(settlement);
                true
            }
            None => false,
        }
    }
}
