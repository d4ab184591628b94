//! Out-of-process KV tier contract.
//!
//! The real backend (Redis or similar) lives outside the core and is
//! injected at container build time; the trait keeps the surface down to
//! the four operations the cache needs. [`InMemoryKvStore`] backs tests and
//! single-process deployments.

use crate::time::epoch_millis;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

/// Failure talking to the KV backend. The cache degrades silently on these;
/// they never fail a user request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvError(pub String);

impl fmt::Display for KvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kv store error: {}", self.0)
    }
}

impl std::error::Error for KvError {}

/// Storage contract for the KV tier.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), KvError>;
    async fn remove(&self, key: &str) -> Result<(), KvError>;
    async fn clear(&self) -> Result<(), KvError>;
}

/// In-memory KV store with TTL expiry.
#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    data: Mutex<HashMap<String, (Vec<u8>, u64)>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let now = epoch_millis();
        let mut data = self.data.lock().unwrap_or_else(|p| p.into_inner());
        let Some((bytes, expires_at)) = data.get(key).map(|(b, e)| (b.clone(), *e)) else {
            return Ok(None);
        };
        if expires_at <= now {
            data.remove(key);
            return Ok(None);
        }
        Ok(Some(bytes))
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), KvError> {
        let expires_at = epoch_millis() + ttl.as_millis() as u64;
        let mut data = self.data.lock().unwrap_or_else(|p| p.into_inner());
        data.insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), KvError> {
        let mut data = self.data.lock().unwrap_or_else(|p| p.into_inner());
        data.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), KvError> {
        let mut data = self.data.lock().unwrap_or_else(|p| p.into_inner());
        data.clear();
        Ok(())
    }
}
