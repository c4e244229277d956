use ahash::{HashMap, HashMapExt};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{
    error::{Error, Result},
    session::Incoming,
};

pub const DEFAULT_CAPACITY: usize = 1024;

/// The application-level pending-request table: one one-shot waiter per
/// correlation id, bounded, with explicit eviction on timeout and bulk
/// failure on teardown.
pub struct PendingRequests {
    waiters: Mutex<HashMap<String, oneshot::Sender<Incoming>>>,
    capacity: usize,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl PendingRequests {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            waiters: Mutex::new(HashMap::with_capacity(capacity.min(64))),
            capacity,
        }
    }

    /// Register a waiter. Two waiters on one correlation id is a caller
    /// bug and fails the contract.
    pub fn register(&self, correlation_id: &str) -> Result<oneshot::Receiver<Incoming>> {
        let mut waiters = self.waiters.lock();

        if waiters.len() >= self.capacity {
            return Err(Error::Protocol("pending request table full".to_string()));
        }

        if waiters.contains_key(correlation_id) {
            return Err(Error::Protocol(format!(
                "duplicate correlation id: {}",
                correlation_id
            )));
        }

        let (tx, rx) = oneshot::channel();
        waiters.insert(correlation_id.to_string(), tx);
        Ok(rx)
    }

    /// Hand an incoming message to its waiter. Returns the message back
    /// when no live waiter claims it, so late responses still reach the
    /// general handlers.
    pub fn complete(&self, correlation_id: &str, message: Incoming) -> Option<Incoming> {
        let Some(waiter) = self.waiters.lock().remove(correlation_id) else {
            return Some(message);
        };

        match waiter.send(message) {
            Ok(()) => None,
            Err(message) => Some(message),
        }
    }

    /// Evict a waiter that timed out.
    pub fn remove(&self, correlation_id: &str) {
        self.waiters.lock().remove(correlation_id);
    }

    /// Teardown: drop every waiter, failing all pending requests.
    pub fn fail_all(&self) {
        self.waiters.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(correlation_id: &str) -> Incoming {
        Incoming {
            from: "f".repeat(32),
            message_type: "sum:response".to_string(),
            payload: json!({"result": 6}),
            correlation_id: correlation_id.to_string(),
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn waiters_are_one_shot() {
        let pending = PendingRequests::default();
        let rx = pending.register("aa00").unwrap();

        assert!(pending.complete("aa00", message("aa00")).is_none());
        assert_eq!(rx.await.unwrap().payload, json!({"result": 6}));

        // Second completion finds no waiter and hands the message back.
        assert!(pending.complete("aa00", message("aa00")).is_some());
    }

    #[test]
    fn duplicate_registration_fails_the_contract() {
        let pending = PendingRequests::default();
        let _rx = pending.register("aa00").unwrap();
        assert!(pending.register("aa00").is_err());
    }

    #[test]
    fn capacity_is_bounded() {
        let pending = PendingRequests::with_capacity(2);
        let _a = pending.register("a").unwrap();
        let _b = pending.register("b").unwrap();
        assert!(pending.register("c").is_err());

        pending.remove("a");
        assert!(pending.register("c").is_ok());
    }

    #[tokio::test]
    async fn teardown_fails_every_waiter() {
        let pending = PendingRequests::default();
        let rx = pending.register("aa00").unwrap();

        pending.fail_all();
        assert!(rx.await.is_err());
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn dropped_receiver_returns_the_message() {
        let pending = PendingRequests::default();
        let rx = pending.register("aa00").unwrap();
        drop(rx);

        assert!(pending.complete("aa00", message("aa00")).is_some());
    }
}
