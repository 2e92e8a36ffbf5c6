//! In-process coordination store.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use super::{CoordinationStore, StoreError, StoreResult, StoreScript};

/// Channel capacity for pub/sub
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct Keyspace {
    values: HashMap<String, Entry>,
    sets: HashMap<String, BTreeSet<String>>,
}

impl Keyspace {
    /// Live entry for `key`, dropping it first if expired.
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.values.get(key).is_some_and(|e| e.is_expired(now)) {
            self.values.remove(key);
            debug!(key, "Key expired");
        }
        self.values.get_mut(key)
    }
}

fn holder_matches(value: &str, holder_id: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(value)
        .ok()
        .and_then(|v| v.get("holder_id").and_then(|h| h.as_str()).map(|h| h == holder_id))
        .unwrap_or(false)
}

/// Coordination store held in process memory.
///
/// A single mutex guards the keyspace, so each call (scripts included)
/// is atomic with respect to every other call. Expiry uses
/// `tokio::time::Instant`, which follows a paused test clock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    keyspace: Mutex<Keyspace>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn with_keyspace<T>(&self, f: impl FnOnce(&mut Keyspace) -> T) -> StoreResult<T> {
        let mut guard = self.keyspace.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(f(&mut guard))
    }

    fn sender(&self, channel: &str) -> StoreResult<broadcast::Sender<String>> {
        let mut channels = self.channels.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone())
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.with_keyspace(|ks| ks.live(key).map(|e| e.value.clone()))
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        only_if_absent: bool,
    ) -> StoreResult<bool> {
        self.with_keyspace(|ks| {
            if only_if_absent && ks.live(key).is_some() {
                return false;
            }
            ks.values.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: ttl.map(|t| Instant::now() + t),
                },
            );
            true
        })
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.with_keyspace(|ks| ks.live(key).is_some() && ks.values.remove(key).is_some())
    }

    async fn ttl_remaining(&self, key: &str) -> StoreResult<Option<Duration>> {
        self.with_keyspace(|ks| {
            let now = Instant::now();
            ks.live(key)
                .and_then(|e| e.expires_at)
                .map(|at| at.saturating_duration_since(now))
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.with_keyspace(|ks| match ks.live(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        })
    }

    async fn eval(&self, script: StoreScript, keys: &[&str], args: &[&str]) -> StoreResult<i64> {
        script.check_arity(keys, args)?;
        let key = keys[0];
        let holder_id = args[0];

        match script {
            StoreScript::CompareAndDelete => self.with_keyspace(|ks| {
                let matches = ks.live(key).is_some_and(|e| holder_matches(&e.value, holder_id));
                if matches {
                    ks.values.remove(key);
                    1
                } else {
                    0
                }
            }),
            StoreScript::CompareAndExtend => {
                let extra: u64 = args[1]
                    .parse()
                    .map_err(|_| StoreError::InvalidArgument(format!("extra seconds: {}", args[1])))?;
                self.with_keyspace(|ks| {
                    let now = Instant::now();
                    match ks.live(key) {
                        Some(entry) if holder_matches(&entry.value, holder_id) => {
                            match entry.expires_at {
                                Some(at) if at > now => {
                                    entry.expires_at = Some(at + Duration::from_secs(extra));
                                    1
                                }
                                _ => 0,
                            }
                        }
                        _ => 0,
                    }
                })
            }
        }
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<usize> {
        let sender = self.sender(channel)?;
        // No receivers is not an error for pub/sub.
        Ok(sender.send(message.to_string()).unwrap_or(0))
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<broadcast::Receiver<String>> {
        Ok(self.sender(channel)?.subscribe())
    }

    async fn set_add(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.with_keyspace(|ks| {
            ks.sets
                .entry(key.to_string())
                .or_default()
                .insert(member.to_string())
        })
    }

    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.with_keyspace(|ks| {
            let removed = ks.sets.get_mut(key).is_some_and(|s| s.remove(member));
            if ks.sets.get(key).is_some_and(|s| s.is_empty()) {
                ks.sets.remove(key);
            }
            removed
        })
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        self.with_keyspace(|ks| {
            ks.sets
                .get(key)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(holder: &str) -> String {
        serde_json::json!({ "holder_id": holder }).to_string()
    }

    #[tokio::test]
    async fn test_set_only_if_absent() {
        let store = MemoryStore::new();
        assert!(store.set("k", "a", None, true).await.unwrap());
        assert!(!store.set("k", "b", None, true).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));

        assert!(store.set("k", "c", None, false).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .set("k", "v", Some(Duration::from_secs(10)), true)
            .await
            .unwrap();
        assert!(store.ttl_remaining("k").await.unwrap().unwrap() <= Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.get("k").await.unwrap().is_none());
        // Expired key no longer blocks a conditional set.
        assert!(store.set("k", "w", None, true).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_replaces_ttl() {
        let store = MemoryStore::new();
        assert!(!store.expire("missing", Duration::from_secs(5)).await.unwrap());

        store.set("k", "v", None, true).await.unwrap();
        assert_eq!(store.ttl_remaining("k").await.unwrap(), None);
        assert!(store.expire("k", Duration::from_secs(5)).await.unwrap());
        assert_eq!(store.ttl_remaining("k").await.unwrap(), Some(Duration::from_secs(5)));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_compare_and_delete() {
        let store = MemoryStore::new();
        store.set("lock", &record("alice"), None, true).await.unwrap();

        let miss = store
            .eval(StoreScript::CompareAndDelete, &["lock"], &["bob"])
            .await
            .unwrap();
        assert_eq!(miss, 0);
        assert!(store.get("lock").await.unwrap().is_some());

        let hit = store
            .eval(StoreScript::CompareAndDelete, &["lock"], &["alice"])
            .await
            .unwrap();
        assert_eq!(hit, 1);
        assert!(store.get("lock").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_compare_and_extend_requires_ttl() {
        let store = MemoryStore::new();
        store.set("persistent", &record("a"), None, true).await.unwrap();
        let r = store
            .eval(StoreScript::CompareAndExtend, &["persistent"], &["a", "30"])
            .await
            .unwrap();
        assert_eq!(r, 0);

        store
            .set("lease", &record("a"), Some(Duration::from_secs(10)), true)
            .await
            .unwrap();
        let r = store
            .eval(StoreScript::CompareAndExtend, &["lease"], &["a", "30"])
            .await
            .unwrap();
        assert_eq!(r, 1);
        assert_eq!(
            store.ttl_remaining("lease").await.unwrap(),
            Some(Duration::from_secs(40))
        );
    }

    #[tokio::test]
    async fn test_eval_rejects_bad_extra_seconds() {
        let store = MemoryStore::new();
        let err = store
            .eval(StoreScript::CompareAndExtend, &["k"], &["a", "soon"])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let store = MemoryStore::new();
        assert_eq!(store.publish("ch", "nobody").await.unwrap(), 0);

        let mut rx = store.subscribe("ch").await.unwrap();
        assert_eq!(store.publish("ch", "hello").await.unwrap(), 1);
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_set_membership() {
        let store = MemoryStore::new();
        assert!(store.set_add("s", "b1").await.unwrap());
        assert!(!store.set_add("s", "b1").await.unwrap());
        store.set_add("s", "b2").await.unwrap();
        assert_eq!(store.set_members("s").await.unwrap(), vec!["b1", "b2"]);
        assert!(store.set_remove("s", "b1").await.unwrap());
        assert_eq!(store.set_members("s").await.unwrap(), vec!["b2"]);
    }
}
