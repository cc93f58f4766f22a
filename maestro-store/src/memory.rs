//! ABOUTME: Process-local StoreBackend over an in-memory record table
//! ABOUTME: Lazy TTL expiry; typed records guard against cross-type misuse

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use maestro_core::{MaestroError, Result};

use crate::backend::StoreBackend;

#[derive(Debug, Clone)]
enum Record {
    Value(String),
    List(VecDeque<String>),
    /// Kept sorted by (score, member)
    Zset(Vec<(f64, String)>),
    Set(HashSet<String>),
}

impl Record {
    fn type_name(&self) -> &'static str {
        match self {
            Record::Value(_) => "value",
            Record::List(_) => "list",
            Record::Zset(_) => "zset",
            Record::Set(_) => "set",
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    record: Record,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map(|at| Instant::now() < at).unwrap_or(true)
    }
}

/// In-memory store backend.
///
/// The process-local equivalent every deployment can fall back to; a
/// single-node deployment runs on this alone.
#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn wrong_type(key: &str, want: &str, got: &str) -> MaestroError {
        MaestroError::storage(format!(
            "key '{}' holds a {} record, expected {}",
            key, got, want
        ))
    }

    /// Run `f` against the live record for `key`, creating it via `make`
    /// when absent or expired.
    fn with_record<T>(
        &self,
        key: &str,
        want: &'static str,
        make: impl Fn() -> Record,
        f: impl FnOnce(&mut Record) -> Result<T>,
    ) -> Result<T> {
        let mut entries = self.entries.write();
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            record: make(),
            expires_at: None,
        });
        if !entry.live() {
            *entry = Entry {
                record: make(),
                expires_at: None,
            };
        }
        if entry.record.type_name() != want {
            let got = entry.record.type_name();
            return Err(Self::wrong_type(key, want, got));
        }
        f(&mut entry.record)
    }

    /// Read-only access; absent and expired keys yield None
    fn read_record<T>(
        &self,
        key: &str,
        want: &'static str,
        f: impl FnOnce(&Record) -> T,
    ) -> Result<Option<T>> {
        let entries = self.entries.read();
        match entries.get(key) {
            Some(entry) if entry.live() => {
                if entry.record.type_name() != want {
                    return Err(Self::wrong_type(key, want, entry.record.type_name()));
                }
                Ok(Some(f(&entry.record)))
            }
            _ => Ok(None),
        }
    }

    fn drop_if_empty(record: &Record) -> bool {
        match record {
            Record::List(list) => list.is_empty(),
            Record::Zset(zset) => zset.is_empty(),
            Record::Set(set) => set.is_empty(),
            Record::Value(_) => false,
        }
    }

    fn cleanup(&self, key: &str) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(key) {
            if !entry.live() || Self::drop_if_empty(&entry.record) {
                entries.remove(key);
            }
        }
    }
}

fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len = len as i64;
    let mut start = if start < 0 { len + start } else { start };
    let mut stop = if stop < 0 { len + stop } else { stop };
    start = start.max(0);
    stop = stop.min(len - 1);
    if start > stop {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let mut entries = self.entries.write();
        entries.insert(
            key.to_string(),
            Entry {
                record: Record::Value(value),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.read_record(key, "value", |record| match record {
            Record::Value(v) => v.clone(),
            _ => unreachable!(),
        })
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.write();
        Ok(entries
            .remove(key)
            .map(|entry| entry.live())
            .unwrap_or(false))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(entry) if entry.live() => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn incr_by(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64> {
        let mut entries = self.entries.write();
        let live = entries.get(key).map(|e| e.live()).unwrap_or(false);
        if !live {
            entries.insert(
                key.to_string(),
                Entry {
                    record: Record::Value(delta.to_string()),
                    expires_at: ttl.map(|d| Instant::now() + d),
                },
            );
            return Ok(delta);
        }
        let entry = entries.get_mut(key).expect("checked above");
        match &mut entry.record {
            Record::Value(raw) => {
                let current: i64 = raw.parse().map_err(|_| {
                    MaestroError::storage(format!("key '{}' is not an integer counter", key))
                })?;
                let next = current + delta;
                *raw = next.to_string();
                Ok(next)
            }
            other => Err(Self::wrong_type(key, "value", other.type_name())),
        }
    }

    async fn list_push_front(&self, key: &str, value: String) -> Result<u64> {
        self.with_record(
            key,
            "list",
            || Record::List(VecDeque::new()),
            |record| match record {
                Record::List(list) => {
                    list.push_front(value);
                    Ok(list.len() as u64)
                }
                _ => unreachable!(),
            },
        )
    }

    async fn list_push_back(&self, key: &str, value: String) -> Result<u64> {
        self.with_record(
            key,
            "list",
            || Record::List(VecDeque::new()),
            |record| match record {
                Record::List(list) => {
                    list.push_back(value);
                    Ok(list.len() as u64)
                }
                _ => unreachable!(),
            },
        )
    }

    async fn list_pop_front(&self, key: &str) -> Result<Option<String>> {
        let popped = self.with_record(
            key,
            "list",
            || Record::List(VecDeque::new()),
            |record| match record {
                Record::List(list) => Ok(list.pop_front()),
                _ => unreachable!(),
            },
        )?;
        self.cleanup(key);
        Ok(popped)
    }

    async fn list_pop_back(&self, key: &str) -> Result<Option<String>> {
        let popped = self.with_record(
            key,
            "list",
            || Record::List(VecDeque::new()),
            |record| match record {
                Record::List(list) => Ok(list.pop_back()),
                _ => unreachable!(),
            },
        )?;
        self.cleanup(key);
        Ok(popped)
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        Ok(self
            .read_record(key, "list", |record| match record {
                Record::List(list) => match resolve_range(list.len(), start, stop) {
                    Some((lo, hi)) => list.iter().skip(lo).take(hi - lo + 1).cloned().collect(),
                    None => Vec::new(),
                },
                _ => unreachable!(),
            })?
            .unwrap_or_default())
    }

    async fn list_len(&self, key: &str) -> Result<u64> {
        Ok(self
            .read_record(key, "list", |record| match record {
                Record::List(list) => list.len() as u64,
                _ => unreachable!(),
            })?
            .unwrap_or(0))
    }

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        self.with_record(
            key,
            "list",
            || Record::List(VecDeque::new()),
            |record| match record {
                Record::List(list) => {
                    match resolve_range(list.len(), start, stop) {
                        Some((lo, hi)) => {
                            let kept: VecDeque<String> =
                                list.iter().skip(lo).take(hi - lo + 1).cloned().collect();
                            *list = kept;
                        }
                        None => list.clear(),
                    }
                    Ok(())
                }
                _ => unreachable!(),
            },
        )?;
        self.cleanup(key);
        Ok(())
    }

    async fn zset_add(&self, key: &str, member: String, score: f64) -> Result<bool> {
        self.with_record(
            key,
            "zset",
            || Record::Zset(Vec::new()),
            |record| match record {
                Record::Zset(zset) => {
                    let existing = zset.iter().position(|(_, m)| *m == member);
                    if let Some(pos) = existing {
                        zset.remove(pos);
                    }
                    let at = zset
                        .binary_search_by(|(s, m)| {
                            s.partial_cmp(&score)
                                .unwrap_or(std::cmp::Ordering::Equal)
                                .then_with(|| m.as_str().cmp(member.as_str()))
                        })
                        .unwrap_or_else(|pos| pos);
                    zset.insert(at, (score, member));
                    Ok(existing.is_none())
                }
                _ => unreachable!(),
            },
        )
    }

    async fn zset_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<(String, f64)>> {
        Ok(self
            .read_record(key, "zset", |record| match record {
                Record::Zset(zset) => match resolve_range(zset.len(), start, stop) {
                    Some((lo, hi)) => zset[lo..=hi]
                        .iter()
                        .map(|(score, member)| (member.clone(), *score))
                        .collect(),
                    None => Vec::new(),
                },
                _ => unreachable!(),
            })?
            .unwrap_or_default())
    }

    async fn zset_pop_min(&self, key: &str) -> Result<Option<(String, f64)>> {
        let popped = self.with_record(
            key,
            "zset",
            || Record::Zset(Vec::new()),
            |record| match record {
                Record::Zset(zset) => {
                    if zset.is_empty() {
                        Ok(None)
                    } else {
                        let (score, member) = zset.remove(0);
                        Ok(Some((member, score)))
                    }
                }
                _ => unreachable!(),
            },
        )?;
        self.cleanup(key);
        Ok(popped)
    }

    async fn zset_remove(&self, key: &str, member: &str) -> Result<bool> {
        let removed = self.with_record(
            key,
            "zset",
            || Record::Zset(Vec::new()),
            |record| match record {
                Record::Zset(zset) => {
                    let before = zset.len();
                    zset.retain(|(_, m)| m != member);
                    Ok(zset.len() != before)
                }
                _ => unreachable!(),
            },
        )?;
        self.cleanup(key);
        Ok(removed)
    }

    async fn zset_card(&self, key: &str) -> Result<u64> {
        Ok(self
            .read_record(key, "zset", |record| match record {
                Record::Zset(zset) => zset.len() as u64,
                _ => unreachable!(),
            })?
            .unwrap_or(0))
    }

    async fn zset_rank(&self, key: &str, member: &str) -> Result<Option<u64>> {
        Ok(self
            .read_record(key, "zset", |record| match record {
                Record::Zset(zset) => zset
                    .iter()
                    .position(|(_, m)| m == member)
                    .map(|pos| pos as u64),
                _ => unreachable!(),
            })?
            .flatten())
    }

    async fn set_add(&self, key: &str, member: String) -> Result<bool> {
        self.with_record(
            key,
            "set",
            || Record::Set(HashSet::new()),
            |record| match record {
                Record::Set(set) => Ok(set.insert(member)),
                _ => unreachable!(),
            },
        )
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        let removed = self.with_record(
            key,
            "set",
            || Record::Set(HashSet::new()),
            |record| match record {
                Record::Set(set) => Ok(set.remove(member)),
                _ => unreachable!(),
            },
        )?;
        self.cleanup(key);
        Ok(removed)
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self
            .read_record(key, "set", |record| match record {
                Record::Set(set) => set.contains(member),
                _ => unreachable!(),
            })?
            .unwrap_or(false))
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .read_record(key, "set", |record| match record {
                Record::Set(set) => {
                    let mut members: Vec<String> = set.iter().cloned().collect();
                    members.sort();
                    members
                }
                _ => unreachable!(),
            })?
            .unwrap_or_default())
    }

    async fn set_card(&self, key: &str) -> Result<u64> {
        Ok(self
            .read_record(key, "set", |record| match record {
                Record::Set(set) => set.len() as u64,
                _ => unreachable!(),
            })?
            .unwrap_or(0))
    }

    async fn set_intersection(&self, keys: &[String]) -> Result<Vec<String>> {
        let mut result: Option<HashSet<String>> = None;
        for key in keys {
            let members: HashSet<String> = self.set_members(key).await?.into_iter().collect();
            result = Some(match result {
                Some(acc) => acc.intersection(&members).cloned().collect(),
                None => members,
            });
            if result.as_ref().map(HashSet::is_empty).unwrap_or(false) {
                break;
            }
        }
        let mut members: Vec<String> = result.unwrap_or_default().into_iter().collect();
        members.sort();
        Ok(members)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.read();
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.live())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemoryBackend::new();
        store.set("k", "v".into(), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".into()));
        assert!(store.delete("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MemoryBackend::new();
        store
            .set("k", "v".into(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(store.get("k").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_counter_with_window() {
        let store = MemoryBackend::new();
        assert_eq!(
            store
                .incr_by("c", 1, Some(Duration::from_millis(30)))
                .await
                .unwrap(),
            1
        );
        assert_eq!(store.incr_by("c", 2, None).await.unwrap(), 3);
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Window elapsed: counter restarts
        assert_eq!(store.incr_by("c", 1, None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_list_ops() {
        let store = MemoryBackend::new();
        store.list_push_back("l", "a".into()).await.unwrap();
        store.list_push_back("l", "b".into()).await.unwrap();
        store.list_push_front("l", "z".into()).await.unwrap();
        assert_eq!(store.list_len("l").await.unwrap(), 3);
        assert_eq!(
            store.list_range("l", 0, -1).await.unwrap(),
            vec!["z", "a", "b"]
        );
        assert_eq!(store.list_pop_front("l").await.unwrap(), Some("z".into()));
        assert_eq!(store.list_pop_back("l").await.unwrap(), Some("b".into()));
    }

    #[tokio::test]
    async fn test_list_trim_bounds_metrics() {
        let store = MemoryBackend::new();
        for i in 0..10 {
            store.list_push_front("m", i.to_string()).await.unwrap();
        }
        store.list_trim("m", 0, 4).await.unwrap();
        assert_eq!(store.list_len("m").await.unwrap(), 5);
        assert_eq!(
            store.list_range("m", 0, -1).await.unwrap(),
            vec!["9", "8", "7", "6", "5"]
        );
    }

    #[tokio::test]
    async fn test_zset_score_then_fifo_order() {
        let store = MemoryBackend::new();
        store.zset_add("q", "low".into(), 5.0).await.unwrap();
        store.zset_add("q", "first".into(), 1.0).await.unwrap();
        store.zset_add("q", "second".into(), 2.0).await.unwrap();
        assert_eq!(store.zset_rank("q", "first").await.unwrap(), Some(0));
        assert_eq!(store.zset_rank("q", "low").await.unwrap(), Some(2));
        assert_eq!(
            store.zset_pop_min("q").await.unwrap(),
            Some(("first".into(), 1.0))
        );
        assert!(store.zset_remove("q", "low").await.unwrap());
        assert_eq!(store.zset_card("q").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_zset_update_rescores() {
        let store = MemoryBackend::new();
        store.zset_add("q", "m".into(), 1.0).await.unwrap();
        assert!(!store.zset_add("q", "m".into(), 9.0).await.unwrap());
        assert_eq!(
            store.zset_range("q", 0, -1).await.unwrap(),
            vec![("m".to_string(), 9.0)]
        );
    }

    #[tokio::test]
    async fn test_set_ops_and_intersection() {
        let store = MemoryBackend::new();
        store.set_add("s1", "a".into()).await.unwrap();
        store.set_add("s1", "b".into()).await.unwrap();
        store.set_add("s2", "b".into()).await.unwrap();
        store.set_add("s2", "c".into()).await.unwrap();
        assert!(store.set_contains("s1", "a").await.unwrap());
        assert_eq!(store.set_card("s1").await.unwrap(), 2);
        assert_eq!(
            store
                .set_intersection(&["s1".to_string(), "s2".to_string()])
                .await
                .unwrap(),
            vec!["b"]
        );
    }

    #[tokio::test]
    async fn test_scan_prefix() {
        let store = MemoryBackend::new();
        store.set("app:1", "x".into(), None).await.unwrap();
        store.set("app:2", "y".into(), None).await.unwrap();
        store.set("other", "z".into(), None).await.unwrap();
        assert_eq!(
            store.scan_prefix("app:").await.unwrap(),
            vec!["app:1", "app:2"]
        );
    }

    #[tokio::test]
    async fn test_wrong_type_is_storage_error() {
        let store = MemoryBackend::new();
        store.set("k", "v".into(), None).await.unwrap();
        assert!(store.list_push_back("k", "x".into()).await.is_err());
        assert!(store.zset_card("k").await.is_err());
    }
}
