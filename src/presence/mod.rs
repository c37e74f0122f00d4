// Presence module for the SFU
//
// This module counts the distinct viewers of every room. Membership lives in a
// shared store (`room:{id}:viewers` set) next to a stats hash
// (`room:{id}:stats`, field `viewerCount`) read by other services.

pub mod redis;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::Result;

pub use self::redis::RedisPresenceStore;

/// Field of the stats hash holding the viewer count
pub const VIEWER_COUNT_FIELD: &str = "viewerCount";

/// Key of the viewer set of a room
pub fn viewers_key(room_id: &str) -> String {
    format!("room:{}:viewers", room_id)
}

/// Key of the stats hash of a room
pub fn stats_key(room_id: &str) -> String {
    format!("room:{}:stats", room_id)
}

/// Set and counter operations of the shared store
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Add `member` to the set; returns whether it was new
    async fn add_member(&self, key: &str, member: &str) -> Result<bool>;

    /// Remove `member` from the set; returns whether it was present
    async fn remove_member(&self, key: &str, member: &str) -> Result<bool>;

    async fn cardinality(&self, key: &str) -> Result<u64>;

    async fn increment_field(&self, key: &str, field: &str, delta: i64) -> Result<i64>;

    async fn delete(&self, keys: &[String]) -> Result<()>;
}

/// Process-local store
#[derive(Default)]
pub struct MemoryPresenceStore {
    sets: DashMap<String, HashSet<String>>,
    hashes: DashMap<String, HashMap<String, i64>>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a hash field
    pub fn field(&self, key: &str, field: &str) -> Option<i64> {
        self.hashes.get(key).and_then(|hash| hash.get(field).copied())
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn add_member(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn remove_member(&self, key: &str, member: &str) -> Result<bool> {
        let removed = match self.sets.get_mut(key) {
            Some(mut set) => set.remove(member),
            None => false,
        };
        self.sets.remove_if(key, |_, set| set.is_empty());
        Ok(removed)
    }

    async fn cardinality(&self, key: &str) -> Result<u64> {
        Ok(self.sets.get(key).map(|set| set.len() as u64).unwrap_or(0))
    }

    async fn increment_field(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut hash = self.hashes.entry(key.to_string()).or_default();
        let value = hash.entry(field.to_string()).or_insert(0);
        *value += delta;
        Ok(*value)
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.sets.remove(key);
            self.hashes.remove(key);
        }
        Ok(())
    }
}

/// Distinct viewer counter of every room
#[derive(Clone)]
pub struct PresenceCounter {
    store: Arc<dyn PresenceStore>,
}

impl PresenceCounter {
    pub fn new(store: Arc<dyn PresenceStore>) -> Self {
        Self { store }
    }

    /// Count `viewer_id` in; returns the room's viewer count
    pub async fn add(&self, room_id: &str, viewer_id: &str) -> Result<u64> {
        if self.store.add_member(&viewers_key(room_id), viewer_id).await? {
            self.store
                .increment_field(&stats_key(room_id), VIEWER_COUNT_FIELD, 1)
                .await?;
        }
        self.count(room_id).await
    }

    /// Count `viewer_id` out; returns the room's viewer count
    pub async fn remove(&self, room_id: &str, viewer_id: &str) -> Result<u64> {
        if self.store.remove_member(&viewers_key(room_id), viewer_id).await? {
            self.store
                .increment_field(&stats_key(room_id), VIEWER_COUNT_FIELD, -1)
                .await?;
        }
        self.count(room_id).await
    }

    pub async fn count(&self, room_id: &str) -> Result<u64> {
        self.store.cardinality(&viewers_key(room_id)).await
    }

    /// Forget the room entirely
    pub async fn clear(&self, room_id: &str) -> Result<()> {
        self.store
            .delete(&[viewers_key(room_id), stats_key(room_id)])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counts_distinct_viewers_and_never_goes_negative() {
        let store = Arc::new(MemoryPresenceStore::new());
        let presence = PresenceCounter::new(store.clone());

        assert_eq!(presence.add("r1", "alice").await.unwrap(), 1);
        assert_eq!(presence.add("r1", "alice").await.unwrap(), 1);
        assert_eq!(presence.add("r1", "bob").await.unwrap(), 2);
        assert_eq!(store.field(&stats_key("r1"), VIEWER_COUNT_FIELD), Some(2));

        assert_eq!(presence.remove("r1", "alice").await.unwrap(), 1);
        assert_eq!(presence.remove("r1", "alice").await.unwrap(), 1);
        assert_eq!(presence.remove("r1", "bob").await.unwrap(), 0);
        assert_eq!(presence.remove("r1", "carol").await.unwrap(), 0);
        assert_eq!(store.field(&stats_key("r1"), VIEWER_COUNT_FIELD), Some(0));
    }

    #[tokio::test]
    async fn clear_drops_both_keys() {
        let store = Arc::new(MemoryPresenceStore::new());
        let presence = PresenceCounter::new(store.clone());
        presence.add("r1", "alice").await.unwrap();

        presence.clear("r1").await.unwrap();
        assert_eq!(presence.count("r1").await.unwrap(), 0);
        assert_eq!(store.field(&stats_key("r1"), VIEWER_COUNT_FIELD), None);
    }
}
