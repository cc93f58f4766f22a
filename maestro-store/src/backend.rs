//! ABOUTME: StoreBackend trait — the abstract shared-store contract
//! ABOUTME: Key-value with TTL, lists, sorted sets, sets, counters, and prefix scan

use async_trait::async_trait;
use std::time::Duration;

use maestro_core::Result;

/// Abstract shared store.
///
/// Every operation is atomic per call. Values are opaque strings; each
/// consumer serializes its own records. Implementations must treat an
/// expired key as absent on every operation.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    // -- plain keys ---------------------------------------------------------

    /// Set a key, optionally with a time-to-live
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;

    /// Get a key's value
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Delete a key of any record type; returns whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Refresh the TTL on an existing key; returns whether it existed
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Atomically add `delta` to an integer counter, creating it at zero.
    /// A TTL given on creation starts the rolling window.
    async fn incr_by(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64>;

    // -- lists --------------------------------------------------------------

    async fn list_push_front(&self, key: &str, value: String) -> Result<u64>;
    async fn list_push_back(&self, key: &str, value: String) -> Result<u64>;
    async fn list_pop_front(&self, key: &str) -> Result<Option<String>>;
    async fn list_pop_back(&self, key: &str) -> Result<Option<String>>;

    /// Inclusive range; negative indices count from the end, redis-style
    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;

    async fn list_len(&self, key: &str) -> Result<u64>;

    /// Keep only the inclusive range, dropping everything else
    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<()>;

    // -- sorted sets --------------------------------------------------------

    /// Add or update a member; returns true when newly added
    async fn zset_add(&self, key: &str, member: String, score: f64) -> Result<bool>;

    /// Members with scores, ordered by (score, member), inclusive rank range
    async fn zset_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<(String, f64)>>;

    /// Remove and return the lowest-scored member
    async fn zset_pop_min(&self, key: &str) -> Result<Option<(String, f64)>>;

    async fn zset_remove(&self, key: &str, member: &str) -> Result<bool>;
    async fn zset_card(&self, key: &str) -> Result<u64>;

    /// Zero-based rank of a member in score order
    async fn zset_rank(&self, key: &str, member: &str) -> Result<Option<u64>>;

    // -- sets ---------------------------------------------------------------

    async fn set_add(&self, key: &str, member: String) -> Result<bool>;
    async fn set_remove(&self, key: &str, member: &str) -> Result<bool>;
    async fn set_contains(&self, key: &str, member: &str) -> Result<bool>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;
    async fn set_card(&self, key: &str) -> Result<u64>;

    /// Members present in every listed set
    async fn set_intersection(&self, keys: &[String]) -> Result<Vec<String>>;

    // -- scanning / liveness ------------------------------------------------

    /// All live keys starting with `prefix`
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Cheap reachability check
    async fn ping(&self) -> Result<()>;
}
