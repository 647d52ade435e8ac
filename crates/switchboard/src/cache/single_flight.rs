//! Single-flight deduplication keyed by fingerprint.
//!
//! When many callers miss on the same key concurrently, exactly one (the
//! leader) runs the producer; the rest wait and receive the leader's result
//! or its error. The registry is cheaply clonable and the leader guard is
//! owned, so the guard can ride inside per-request state while the leader
//! works through its pipeline. If the leader is dropped without completing
//! (cancellation, panic unwound above us), waiters are released with
//! [`Error::Cancelled`] rather than hanging.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::cache::entry::CacheEntry;
use crate::error::{Error, Result};

type WaiterTx = oneshot::Sender<Result<CacheEntry>>;

/// Deduplicates concurrent producers per key.
#[derive(Clone, Default)]
pub struct SingleFlight {
    flights: Arc<Mutex<HashMap<String, Vec<WaiterTx>>>>,
}

/// The caller's role in a flight.
pub enum Flight {
    /// This caller runs the producer and must call [`LeaderGuard::complete`].
    Leader(LeaderGuard),
    /// Another caller is producing; await the receiver.
    Follower(oneshot::Receiver<Result<CacheEntry>>),
}

/// Held by the producing caller; completes or cancels the flight on drop.
pub struct LeaderGuard {
    owner: SingleFlight,
    key: String,
    completed: bool,
}

impl SingleFlight {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the flight for `key`, becoming the leader if none is in
    /// progress.
    pub fn join(&self, key: &str) -> Flight {
        let mut flights = self.flights.lock();
        if let Some(waiters) = flights.get_mut(key) {
            let (tx, rx) = oneshot::channel();
            waiters.push(tx);
            return Flight::Follower(rx);
        }
        flights.insert(key.to_string(), Vec::new());
        Flight::Leader(LeaderGuard {
            owner: self.clone(),
            key: key.to_string(),
            completed: false,
        })
    }

    fn finish(&self, key: &str, result: &Result<CacheEntry>) {
        let waiters = self.flights.lock().remove(key).unwrap_or_default();
        for tx in waiters {
            // A follower that stopped waiting is fine.
            let _ = tx.send(result.clone());
        }
    }

    /// Number of in-progress flights (for tests).
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.flights.lock().len()
    }
}

impl LeaderGuard {
    /// Deliver the producer's result to every follower and close the flight.
    pub fn complete(mut self, result: &Result<CacheEntry>) {
        self.completed = true;
        self.owner.finish(&self.key, result);
    }

    /// The key this guard leads.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        if !self.completed {
            self.owner.finish(&self.key, &Err(Error::Cancelled));
        }
    }
}

impl std::fmt::Debug for LeaderGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderGuard")
            .field("key", &self.key)
            .field("completed", &self.completed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry() -> CacheEntry {
        CacheEntry::new(b"v".to_vec(), "", Duration::from_secs(60), "test")
    }

    #[tokio::test]
    async fn test_leader_then_follower() {
        let flight = SingleFlight::new();
        let leader = match flight.join("k") {
            Flight::Leader(guard) => guard,
            Flight::Follower(_) => panic!("first joiner must lead"),
        };
        let follower = match flight.join("k") {
            Flight::Follower(rx) => rx,
            Flight::Leader(_) => panic!("second joiner must follow"),
        };
        leader.complete(&Ok(entry()));
        let got = follower.await.unwrap().unwrap();
        assert_eq!(got.payload, b"v".to_vec());
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_followers_receive_leader_error() {
        let flight = SingleFlight::new();
        let leader = match flight.join("k") {
            Flight::Leader(guard) => guard,
            Flight::Follower(_) => panic!("first joiner must lead"),
        };
        let follower = match flight.join("k") {
            Flight::Follower(rx) => rx,
            Flight::Leader(_) => panic!("second joiner must follow"),
        };
        leader.complete(&Err(Error::Backend("boom".into())));
        let got = follower.await.unwrap();
        assert!(matches!(got, Err(Error::Backend(_))));
    }

    #[tokio::test]
    async fn test_dropped_leader_releases_followers() {
        let flight = SingleFlight::new();
        let leader = match flight.join("k") {
            Flight::Leader(guard) => guard,
            Flight::Follower(_) => panic!("first joiner must lead"),
        };
        let follower = match flight.join("k") {
            Flight::Follower(rx) => rx,
            Flight::Leader(_) => panic!("second joiner must follow"),
        };
        drop(leader);
        let got = follower.await.unwrap();
        assert!(matches!(got, Err(Error::Cancelled)));
        // The key is free for a fresh flight.
        assert!(matches!(flight.join("k"), Flight::Leader(_)));
    }

    #[tokio::test]
    async fn test_guard_outlives_registry_handle() {
        // The guard owns a registry clone, so it can be stowed in state
        // that outlives the caller's borrow of the cache.
        let flight = SingleFlight::new();
        let guard = match flight.join("k") {
            Flight::Leader(guard) => guard,
            Flight::Follower(_) => panic!("first joiner must lead"),
        };
        let stashed: Box<LeaderGuard> = Box::new(guard);
        let follower = match flight.join("k") {
            Flight::Follower(rx) => rx,
            Flight::Leader(_) => panic!("second joiner must follow"),
        };
        stashed.complete(&Ok(entry()));
        assert!(follower.await.unwrap().is_ok());
    }
}
