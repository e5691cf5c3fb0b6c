//! Per-ordering-key delivery lanes.
//!
//! A key has at most one delivery in flight. Later deliveries for the same
//! key wait in the lane until the listener returns for the one ahead of
//! them. Unkeyed deliveries never wait.

use std::collections::{HashMap, VecDeque};

#[derive(Debug)]
pub(crate) struct OrderingLanes<T> {
    lanes: HashMap<String, VecDeque<T>>,
}

impl<T> Default for OrderingLanes<T> {
    fn default() -> Self {
        Self {
            lanes: HashMap::new(),
        }
    }
}

impl<T> OrderingLanes<T> {
    /// Hands `item` back when it may start now, otherwise queues it behind
    /// the delivery its key already has in flight.
    pub(crate) fn admit(&mut self, key: Option<&str>, item: T) -> Option<T> {
        let Some(key) = key else {
            return Some(item);
        };
        match self.lanes.get_mut(key) {
            Some(waiting) => {
                waiting.push_back(item);
                None
            }
            None => {
                self.lanes.insert(key.to_owned(), VecDeque::new());
                Some(item)
            }
        }
    }

    /// The in-flight delivery for `key` settled. Returns the next one to
    /// start; the lane stays busy while it runs.
    pub(crate) fn release(&mut self, key: &str) -> Option<T> {
        let waiting = self.lanes.get_mut(key)?;
        match waiting.pop_front() {
            Some(next) => Some(next),
            None => {
                self.lanes.remove(key);
                None
            }
        }
    }

    /// Takes every waiting delivery out, leaving no lane busy.
    pub(crate) fn drain(&mut self) -> Vec<T> {
        self.lanes
            .drain()
            .flat_map(|(_, waiting)| waiting)
            .collect()
    }
}
