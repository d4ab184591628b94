//! Single-flight coordination per fingerprint.
//!
//! The first lookup for an unseen fingerprint becomes the leader and builds
//! the response; concurrent lookups subscribe to the leader's broadcast and
//! wait. When a build fails, a bounded number of waiters (the retry quota)
//! may take over one at a time instead of stampeding upstream together. A
//! leader dropped without completing closes the channel so waiters are never
//! stranded.

use super::fingerprint::Fingerprint;
use super::CacheEntry;
use crate::error::{ErrorKind, UpstreamError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Cloneable description of a failed build, broadcast to waiters.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl BuildFailure {
    pub fn from_error(error: &UpstreamError) -> Self {
        Self { kind: error.kind, message: error.message.clone() }
    }

    pub fn into_upstream(self) -> UpstreamError {
        UpstreamError::new(self.kind, self.message)
    }
}

pub type BuildResult = Result<Arc<CacheEntry>, BuildFailure>;

struct FlightMap {
    in_flight: HashMap<Fingerprint, broadcast::Sender<BuildResult>>,
    retry_permits: HashMap<Fingerprint, u32>,
}

pub struct SingleFlight {
    inner: Arc<Mutex<FlightMap>>,
    retry_quota: u32,
}

/// What a lookup became.
pub enum FlightRole {
    /// This caller builds; complete or fail the guard.
    Leader(FlightGuard),
    /// Another build is running; await its broadcast.
    Waiter(broadcast::Receiver<BuildResult>),
}

impl SingleFlight {
    /// `retry_quota` bounds how many waiters may individually retry after a
    /// failed build.
    pub fn new(retry_quota: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FlightMap {
                in_flight: HashMap::new(),
                retry_permits: HashMap::new(),
            })),
            retry_quota,
        }
    }

    /// Become the leader for a fingerprint, or subscribe to the build
    /// already in flight.
    pub fn join(&self, fingerprint: &Fingerprint) -> FlightRole {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(sender) = map.in_flight.get(fingerprint) {
            FlightRole::Waiter(sender.subscribe())
        } else {
            let (tx, _rx) = broadcast::channel(1);
            map.in_flight.insert(fingerprint.clone(), tx);
            map.retry_permits.remove(fingerprint);
            FlightRole::Leader(FlightGuard {
                fingerprint: fingerprint.clone(),
                inner: Arc::clone(&self.inner),
                retry_quota: self.retry_quota,
                finished: false,
            })
        }
    }

    /// Claim one retry permit after a failed build. Returns false once the
    /// quota is spent, in which case the caller surfaces the failure.
    pub fn try_retry(&self, fingerprint: &Fingerprint) -> bool {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        match map.retry_permits.get_mut(fingerprint) {
            Some(permits) if *permits > 0 => {
                *permits -= 1;
                true
            }
            _ => false,
        }
    }

    /// Number of builds currently in flight (tests and stats).
    pub fn in_flight(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).in_flight.len()
    }
}

impl std::fmt::Debug for SingleFlight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight").field("in_flight", &self.in_flight()).finish()
    }
}

/// Leadership over one fingerprint's build.
#[must_use = "complete or fail the build, or waiters will see a cancellation"]
pub struct FlightGuard {
    fingerprint: Fingerprint,
    inner: Arc<Mutex<FlightMap>>,
    retry_quota: u32,
    finished: bool,
}

impl FlightGuard {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Publish the built entry to every waiter and clear the flight.
    pub fn complete(mut self, entry: Arc<CacheEntry>) {
        self.finish(Ok(entry));
    }

    /// Publish the failure and arm the waiter retry quota.
    pub fn fail(mut self, failure: BuildFailure) {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        map.retry_permits.insert(self.fingerprint.clone(), self.retry_quota);
        if let Some(sender) = map.in_flight.remove(&self.fingerprint) {
            let _ = sender.send(Err(failure));
        }
        self.finished = true;
    }

    fn finish(&mut self, result: BuildResult) {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(sender) = map.in_flight.remove(&self.fingerprint) {
            let _ = sender.send(result);
        }
        self.finished = true;
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.finished {
            // Leader cancelled: closing the channel wakes waiters with an
            // explicit error instead of leaving them to time out.
            let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            map.in_flight.remove(&self.fingerprint);
        }
    }
}

impl std::fmt::Debug for FlightGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlightGuard").field("fingerprint", &self.fingerprint).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::entry_with;
    use super::*;
    use std::time::Duration;

    fn fp(s: &str) -> Fingerprint {
        Fingerprint::from_hex(s)
    }

    #[test]
    fn first_join_leads_others_wait() {
        let flight = SingleFlight::new(1);
        assert!(matches!(flight.join(&fp("a")), FlightRole::Leader(_)));
        // The leader guard from above was dropped, clearing the flight.
        assert_eq!(flight.in_flight(), 0);

        let guard = match flight.join(&fp("a")) {
            FlightRole::Leader(guard) => guard,
            FlightRole::Waiter(_) => panic!("expected leadership"),
        };
        assert!(matches!(flight.join(&fp("a")), FlightRole::Waiter(_)));
        assert!(matches!(flight.join(&fp("b")), FlightRole::Leader(_)));
        drop(guard);
    }

    #[tokio::test]
    async fn waiters_receive_the_completed_entry() {
        let flight = SingleFlight::new(1);
        let guard = match flight.join(&fp("a")) {
            FlightRole::Leader(guard) => guard,
            _ => panic!("leader"),
        };
        let mut rx = match flight.join(&fp("a")) {
            FlightRole::Waiter(rx) => rx,
            _ => panic!("waiter"),
        };

        let entry = entry_with("a", "built", Duration::from_secs(60));
        guard.complete(Arc::clone(&entry));

        let received = rx.recv().await.unwrap().unwrap();
        assert_eq!(received.response, entry.response);
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn failure_arms_a_bounded_retry_quota() {
        let flight = SingleFlight::new(2);
        let guard = match flight.join(&fp("a")) {
            FlightRole::Leader(guard) => guard,
            _ => panic!("leader"),
        };
        let mut rx = match flight.join(&fp("a")) {
            FlightRole::Waiter(rx) => rx,
            _ => panic!("waiter"),
        };

        guard.fail(BuildFailure { kind: ErrorKind::Server, message: "503".into() });

        let failure = rx.recv().await.unwrap().unwrap_err();
        assert_eq!(failure.kind, ErrorKind::Server);

        // Exactly two waiters get to retry; the rest surface the failure.
        assert!(flight.try_retry(&fp("a")));
        assert!(flight.try_retry(&fp("a")));
        assert!(!flight.try_retry(&fp("a")));
    }

    #[tokio::test]
    async fn dropped_leader_closes_the_channel() {
        let flight = SingleFlight::new(1);
        let guard = match flight.join(&fp("a")) {
            FlightRole::Leader(guard) => guard,
            _ => panic!("leader"),
        };
        let mut rx = match flight.join(&fp("a")) {
            FlightRole::Waiter(rx) => rx,
            _ => panic!("waiter"),
        };

        drop(guard);
        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Closed)));
        // The key is free again for a new leader.
        assert!(matches!(flight.join(&fp("a")), FlightRole::Leader(_)));
    }

    #[test]
    fn new_leadership_clears_stale_retry_permits() {
        let flight = SingleFlight::new(1);
        match flight.join(&fp("a")) {
            FlightRole::Leader(guard) => {
                guard.fail(BuildFailure { kind: ErrorKind::Server, message: "x".into() })
            }
            _ => panic!("leader"),
        }
        assert!(flight.try_retry(&fp("a")));

        // A fresh build starts; old permits must not linger for later
        // failures.
        match flight.join(&fp("a")) {
            FlightRole::Leader(guard) => {
                drop(guard);
            }
            _ => panic!("leader"),
        }
        assert!(!flight.try_retry(&fp("a")));
    }
}
