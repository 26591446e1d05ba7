//! Two-band request queue
//!
//! Urgent requests come from the coverage planner (backfill/frontfill);
//! normal requests come from the HTTP front-end and the scheduler daemon.
//! Within a band, strictly FIFO.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::model::Request;

/// Queue priority bands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Planner fill requests; always dequeued first
    Urgent,
    /// Scheduler ticks and ad-hoc HTTP submissions
    Normal,
}

#[derive(Default)]
struct Bands {
    urgent: VecDeque<Request>,
    normal: VecDeque<Request>,
}

/// The pipeline's inbound queue
#[derive(Default)]
pub struct RequestQueue {
    bands: Mutex<Bands>,
}

impl RequestQueue {
    pub fn push(&self, request: Request, priority: Priority) {
        let mut bands = self.bands.lock().expect("queue lock");
        match priority {
            Priority::Urgent => bands.urgent.push_back(request),
            Priority::Normal => bands.normal.push_back(request),
        }
    }

    /// Highest-priority request, if any
    pub fn try_pop(&self) -> Option<Request> {
        let mut bands = self.bands.lock().expect("queue lock");
        bands.urgent.pop_front().or_else(|| bands.normal.pop_front())
    }

    pub fn len(&self) -> usize {
        let bands = self.bands.lock().expect("queue lock");
        bands.urgent.len() + bands.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RequestParams;

    fn request(endpoint: &str) -> Request {
        Request::new("fred", endpoint, RequestParams::default())
    }

    #[test]
    fn urgent_band_drains_first() {
        let queue = RequestQueue::default();
        queue.push(request("n1"), Priority::Normal);
        queue.push(request("u1"), Priority::Urgent);
        queue.push(request("n2"), Priority::Normal);
        queue.push(request("u2"), Priority::Urgent);

        let order: Vec<String> = std::iter::from_fn(|| queue.try_pop())
            .map(|r| r.endpoint)
            .collect();
        assert_eq!(order, vec!["u1", "u2", "n1", "n2"]);
    }

    #[test]
    fn bands_are_fifo() {
        let queue = RequestQueue::default();
        for i in 0..4 {
            queue.push(request(&format!("e{i}")), Priority::Normal);
        }
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.try_pop().unwrap().endpoint, "e0");
        assert_eq!(queue.try_pop().unwrap().endpoint, "e1");
    }

    #[test]
    fn empty_queue_pops_nothing() {
        let queue = RequestQueue::default();
        assert!(queue.try_pop().is_none());
        assert!(queue.is_empty());
    }
}
