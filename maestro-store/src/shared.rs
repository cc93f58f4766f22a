//! ABOUTME: SharedStore — failover wrapper over a primary StoreBackend
//! ABOUTME: Degrades to the process-local backend when the primary is unreachable

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use maestro_core::{MaestroError, Result};

use crate::backend::StoreBackend;
use crate::memory::MemoryBackend;

/// Shared store with process-local degradation.
///
/// Operations go to the primary backend when one is configured; a failed
/// primary call falls back to the local in-memory backend for that call,
/// so a single-node deployment stays correct. Visibility across instances
/// is lost while degraded.
pub struct SharedStore {
    primary: Option<Arc<dyn StoreBackend>>,
    local: MemoryBackend,
    degraded: AtomicBool,
}

impl SharedStore {
    /// Store with no external backing: all state is process-local
    pub fn local_only() -> Self {
        Self {
            primary: None,
            local: MemoryBackend::new(),
            degraded: AtomicBool::new(false),
        }
    }

    /// Store backed by an external backend with local failover
    pub fn with_primary(primary: Arc<dyn StoreBackend>) -> Self {
        Self {
            primary: Some(primary),
            local: MemoryBackend::new(),
            degraded: AtomicBool::new(false),
        }
    }

    /// Whether the last primary call failed
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    fn note_failure(&self, err: &MaestroError) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(error = %err, "shared store primary unreachable, degrading to process-local");
        }
    }

    fn note_success(&self) {
        if self.degraded.swap(false, Ordering::Relaxed) {
            info!("shared store primary reachable again");
        }
    }
}

macro_rules! delegate {
    ($self:ident, $method:ident ( $($arg:expr),* )) => {{
        if let Some(primary) = $self.primary.as_ref() {
            match primary.$method($($arg),*).await {
                Ok(value) => {
                    $self.note_success();
                    Ok(value)
                }
                Err(err) => {
                    $self.note_failure(&err);
                    $self.local.$method($($arg),*).await
                }
            }
        } else {
            $self.local.$method($($arg),*).await
        }
    }};
}

#[async_trait]
impl StoreBackend for SharedStore {
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        delegate!(self, set(key, value.clone(), ttl))
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        delegate!(self, get(key))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        delegate!(self, delete(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        delegate!(self, expire(key, ttl))
    }

    async fn incr_by(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64> {
        delegate!(self, incr_by(key, delta, ttl))
    }

    async fn list_push_front(&self, key: &str, value: String) -> Result<u64> {
        delegate!(self, list_push_front(key, value.clone()))
    }

    async fn list_push_back(&self, key: &str, value: String) -> Result<u64> {
        delegate!(self, list_push_back(key, value.clone()))
    }

    async fn list_pop_front(&self, key: &str) -> Result<Option<String>> {
        delegate!(self, list_pop_front(key))
    }

    async fn list_pop_back(&self, key: &str) -> Result<Option<String>> {
        delegate!(self, list_pop_back(key))
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        delegate!(self, list_range(key, start, stop))
    }

    async fn list_len(&self, key: &str) -> Result<u64> {
        delegate!(self, list_len(key))
    }

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        delegate!(self, list_trim(key, start, stop))
    }

    async fn zset_add(&self, key: &str, member: String, score: f64) -> Result<bool> {
        delegate!(self, zset_add(key, member.clone(), score))
    }

    async fn zset_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<(String, f64)>> {
        delegate!(self, zset_range(key, start, stop))
    }

    async fn zset_pop_min(&self, key: &str) -> Result<Option<(String, f64)>> {
        delegate!(self, zset_pop_min(key))
    }

    async fn zset_remove(&self, key: &str, member: &str) -> Result<bool> {
        delegate!(self, zset_remove(key, member))
    }

    async fn zset_card(&self, key: &str) -> Result<u64> {
        delegate!(self, zset_card(key))
    }

    async fn zset_rank(&self, key: &str, member: &str) -> Result<Option<u64>> {
        delegate!(self, zset_rank(key, member))
    }

    async fn set_add(&self, key: &str, member: String) -> Result<bool> {
        delegate!(self, set_add(key, member.clone()))
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        delegate!(self, set_remove(key, member))
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        delegate!(self, set_contains(key, member))
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        delegate!(self, set_members(key))
    }

    async fn set_card(&self, key: &str) -> Result<u64> {
        delegate!(self, set_card(key))
    }

    async fn set_intersection(&self, keys: &[String]) -> Result<Vec<String>> {
        delegate!(self, set_intersection(keys))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        delegate!(self, scan_prefix(prefix))
    }

    async fn ping(&self) -> Result<()> {
        delegate!(self, ping())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Primary that fails every call, for degradation tests
    struct DeadBackend;

    #[async_trait]
    impl StoreBackend for DeadBackend {
        async fn set(&self, _: &str, _: String, _: Option<Duration>) -> Result<()> {
            Err(MaestroError::storage("connection refused"))
        }
        async fn get(&self, _: &str) -> Result<Option<String>> {
            Err(MaestroError::storage("connection refused"))
        }
        async fn delete(&self, _: &str) -> Result<bool> {
            Err(MaestroError::storage("connection refused"))
        }
        async fn expire(&self, _: &str, _: Duration) -> Result<bool> {
            Err(MaestroError::storage("connection refused"))
        }
        async fn incr_by(&self, _: &str, _: i64, _: Option<Duration>) -> Result<i64> {
            Err(MaestroError::storage("connection refused"))
        }
        async fn list_push_front(&self, _: &str, _: String) -> Result<u64> {
            Err(MaestroError::storage("connection refused"))
        }
        async fn list_push_back(&self, _: &str, _: String) -> Result<u64> {
            Err(MaestroError::storage("connection refused"))
        }
        async fn list_pop_front(&self, _: &str) -> Result<Option<String>> {
            Err(MaestroError::storage("connection refused"))
        }
        async fn list_pop_back(&self, _: &str) -> Result<Option<String>> {
            Err(MaestroError::storage("connection refused"))
        }
        async fn list_range(&self, _: &str, _: i64, _: i64) -> Result<Vec<String>> {
            Err(MaestroError::storage("connection refused"))
        }
        async fn list_len(&self, _: &str) -> Result<u64> {
            Err(MaestroError::storage("connection refused"))
        }
        async fn list_trim(&self, _: &str, _: i64, _: i64) -> Result<()> {
            Err(MaestroError::storage("connection refused"))
        }
        async fn zset_add(&self, _: &str, _: String, _: f64) -> Result<bool> {
            Err(MaestroError::storage("connection refused"))
        }
        async fn zset_range(&self, _: &str, _: i64, _: i64) -> Result<Vec<(String, f64)>> {
            Err(MaestroError::storage("connection refused"))
        }
        async fn zset_pop_min(&self, _: &str) -> Result<Option<(String, f64)>> {
            Err(MaestroError::storage("connection refused"))
        }
        async fn zset_remove(&self, _: &str, _: &str) -> Result<bool> {
            Err(MaestroError::storage("connection refused"))
        }
        async fn zset_card(&self, _: &str) -> Result<u64> {
            Err(MaestroError::storage("connection refused"))
        }
        async fn zset_rank(&self, _: &str, _: &str) -> Result<Option<u64>> {
            Err(MaestroError::storage("connection refused"))
        }
        async fn set_add(&self, _: &str, _: String) -> Result<bool> {
            Err(MaestroError::storage("connection refused"))
        }
        async fn set_remove(&self, _: &str, _: &str) -> Result<bool> {
            Err(MaestroError::storage("connection refused"))
        }
        async fn set_contains(&self, _: &str, _: &str) -> Result<bool> {
            Err(MaestroError::storage("connection refused"))
        }
        async fn set_members(&self, _: &str) -> Result<Vec<String>> {
            Err(MaestroError::storage("connection refused"))
        }
        async fn set_card(&self, _: &str) -> Result<u64> {
            Err(MaestroError::storage("connection refused"))
        }
        async fn set_intersection(&self, _: &[String]) -> Result<Vec<String>> {
            Err(MaestroError::storage("connection refused"))
        }
        async fn scan_prefix(&self, _: &str) -> Result<Vec<String>> {
            Err(MaestroError::storage("connection refused"))
        }
        async fn ping(&self) -> Result<()> {
            Err(MaestroError::storage("connection refused"))
        }
    }

    #[tokio::test]
    async fn test_local_only_roundtrip() {
        let store = SharedStore::local_only();
        store.set("k", "v".into(), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".into()));
        assert!(!store.is_degraded());
    }

    #[tokio::test]
    async fn test_degrades_and_stays_correct_locally() {
        let store = SharedStore::with_primary(Arc::new(DeadBackend));
        store.set("k", "v".into(), None).await.unwrap();
        assert!(store.is_degraded());
        // The fallback served the write; reads observe it locally.
        assert_eq!(store.get("k").await.unwrap(), Some("v".into()));
    }
}
