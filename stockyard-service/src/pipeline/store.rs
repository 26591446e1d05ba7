//! Response store with per-corr-id waiters
//!
//! Responses are keyed by correlation id and claimed exactly once. A slot is
//! registered when the request is accepted, so the GET handler can block on a
//! waiter instead of polling; an unknown id resolves to nothing immediately.
//! Streaming endpoints may overwrite an unclaimed response; the latest batch
//! wins.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::ids::CorrId;
use crate::model::Response;

enum Slot {
    Pending(Arc<Notify>),
    Ready(Response),
}

/// Mutex-guarded `CorrId → Response` map
#[derive(Default)]
pub struct ResponseStore {
    slots: Mutex<HashMap<CorrId, Slot>>,
}

impl ResponseStore {
    /// Open a pending slot for an accepted request
    pub fn register(&self, corr_id: &CorrId) {
        let mut slots = self.slots.lock().expect("store lock");
        slots
            .entry(corr_id.clone())
            .or_insert_with(|| Slot::Pending(Arc::new(Notify::new())));
    }

    /// Deliver a response and wake its waiters
    pub fn set(&self, corr_id: &CorrId, response: Response) {
        let mut slots = self.slots.lock().expect("store lock");
        match slots.insert(corr_id.clone(), Slot::Ready(response)) {
            Some(Slot::Pending(notify)) => notify.notify_waiters(),
            // Streaming overwrite of an unclaimed response, or a first
            // delivery without registration; nobody is waiting either way
            Some(Slot::Ready(_)) | None => {}
        }
    }

    /// Claim a ready response; pending slots stay put
    pub fn pop(&self, corr_id: &CorrId) -> Option<Response> {
        let mut slots = self.slots.lock().expect("store lock");
        match slots.get(corr_id) {
            Some(Slot::Ready(_)) => match slots.remove(corr_id) {
                Some(Slot::Ready(response)) => Some(response),
                _ => unreachable!("slot changed under the lock"),
            },
            _ => None,
        }
    }

    /// Block until the response for a registered id arrives, then claim it
    ///
    /// Returns `None` right away when the id is unknown (never registered or
    /// already claimed).
    pub async fn wait(&self, corr_id: &CorrId) -> Option<Response> {
        loop {
            let notify = {
                let mut slots = self.slots.lock().expect("store lock");
                match slots.get(corr_id) {
                    None => return None,
                    Some(Slot::Ready(_)) => match slots.remove(corr_id) {
                        Some(Slot::Ready(response)) => return Some(response),
                        _ => unreachable!("slot changed under the lock"),
                    },
                    Some(Slot::Pending(notify)) => Arc::clone(notify),
                }
            };
            let mut notified = std::pin::pin!(notify.notified());
            notified.as_mut().enable();
            // Re-check before sleeping: the response may have landed between
            // dropping the lock and registering the waiter
            {
                let slots = self.slots.lock().expect("store lock");
                match slots.get(corr_id) {
                    Some(Slot::Pending(_)) => {}
                    _ => continue,
                }
            }
            notified.await;
        }
    }

    pub fn pending_count(&self) -> usize {
        let slots = self.slots.lock().expect("store lock");
        slots
            .values()
            .filter(|slot| matches!(slot, Slot::Pending(_)))
            .count()
    }

    pub fn ready_count(&self) -> usize {
        let slots = self.slots.lock().expect("store lock");
        slots
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Request, RequestParams, Scalar};

    fn response(tag: &str) -> Response {
        let mut request = Request::new("fred", "series", RequestParams::default());
        request.corr_id = Some(CorrId::Seq(1));
        Response::ok(request, vec![vec![Scalar::Text(tag.into())]])
    }

    #[test]
    fn pop_claims_exactly_once() {
        let store = ResponseStore::default();
        let id = CorrId::Seq(1);
        store.register(&id);
        assert!(store.pop(&id).is_none()); // pending, not claimable

        store.set(&id, response("a"));
        assert!(store.pop(&id).is_some());
        assert!(store.pop(&id).is_none()); // second claim finds nothing
    }

    #[test]
    fn set_replaces_unclaimed_response() {
        let store = ResponseStore::default();
        let id = CorrId::Seq(2);
        store.register(&id);
        store.set(&id, response("first"));
        store.set(&id, response("second"));
        let got = store.pop(&id).unwrap();
        assert_eq!(got.data.unwrap()[0][0], Scalar::Text("second".into()));
    }

    #[tokio::test]
    async fn wait_blocks_until_delivery() {
        let store = Arc::new(ResponseStore::default());
        let id = CorrId::Seq(3);
        store.register(&id);

        let waiter = {
            let store = Arc::clone(&store);
            let id = id.clone();
            tokio::spawn(async move { store.wait(&id).await })
        };
        tokio::task::yield_now().await;
        store.set(&id, response("x"));

        let got = waiter.await.unwrap();
        assert!(got.is_some());
        assert_eq!(store.ready_count(), 0);
    }

    #[tokio::test]
    async fn wait_on_unknown_id_returns_immediately() {
        let store = ResponseStore::default();
        assert!(store.wait(&CorrId::Seq(99)).await.is_none());
    }

    #[test]
    fn counts_split_by_slot_state() {
        let store = ResponseStore::default();
        store.register(&CorrId::Seq(1));
        store.register(&CorrId::Seq(2));
        store.set(&CorrId::Seq(2), response("done"));
        assert_eq!(store.pending_count(), 1);
        assert_eq!(store.ready_count(), 1);
    }
}
