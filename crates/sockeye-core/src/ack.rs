//! Per-session table of outstanding ack waiters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Maps locally-allocated ack ids to single-use result slots.
///
/// Ids are assigned monotonically per session. An entry is removed exactly
/// once: when the response is delivered, when the waiting side gives up
/// (timeout), or when the session closes and the table is cleared.
#[derive(Default)]
pub(crate) struct AckTable {
    next_id: AtomicU64,
    waiters: Mutex<HashMap<u64, oneshot::Sender<String>>>,
}

impl AckTable {
    /// Allocate the next ack id for this session.
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Install a single-shot slot for the given id and return its receiving
    /// half.
    pub(crate) fn register(&self, id: u64) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(id, tx);
        rx
    }

    /// Take the waiter for an incoming response, if one is still installed.
    pub(crate) fn take(&self, id: u64) -> Option<oneshot::Sender<String>> {
        self.waiters.lock().remove(&id)
    }

    /// Remove a waiter that gave up. No-op if it was already taken.
    pub(crate) fn remove(&self, id: u64) {
        self.waiters.lock().remove(&id);
    }

    /// Drop every outstanding waiter; their receivers resolve with a closed
    /// error. Called when the session closes.
    pub(crate) fn clear(&self) {
        self.waiters.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic() {
        let table = AckTable::default();
        let a = table.next_id();
        let b = table.next_id();
        let c = table.next_id();
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn delivery_consumes_the_slot() {
        let table = AckTable::default();
        let id = table.next_id();
        let rx = table.register(id);

        let waiter = table.take(id).unwrap();
        waiter.send("\"result\"".to_owned()).unwrap();
        assert_eq!(rx.await.unwrap(), "\"result\"");

        assert!(table.take(id).is_none());
    }

    #[tokio::test]
    async fn clear_fails_pending_receivers() {
        let table = AckTable::default();
        let rx = table.register(table.next_id());
        table.clear();
        assert!(rx.await.is_err());
    }
}
