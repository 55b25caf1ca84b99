//! Session-scoped cache for template VM descriptors.
//!
//! The store is injected, never ambient, so hosts can back it with
//! whatever survives their UI lifecycle. Entries are keyed by user and
//! session kind; opening a session purges every other user's entries so a
//! principal change on the same host never leaks another account's
//! descriptor.

use async_trait::async_trait;
use dashmap::DashMap;

/// Keyed session cache.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, user_id: &str, kind: &str) -> Option<serde_json::Value>;
    async fn set(&self, user_id: &str, kind: &str, value: serde_json::Value);
    async fn clear(&self, user_id: &str, kind: &str);
    /// Remove every entry belonging to any other user, all kinds.
    async fn purge_other_users(&self, keep_user_id: &str);
}

/// Process-local store used by default and in tests.
#[derive(Default)]
pub struct MemorySessionStore {
    entries: DashMap<(String, String), serde_json::Value>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, user_id: &str, kind: &str) -> Option<serde_json::Value> {
        self.entries
            .get(&(user_id.to_string(), kind.to_string()))
            .map(|entry| entry.value().clone())
    }

    async fn set(&self, user_id: &str, kind: &str, value: serde_json::Value) {
        self.entries
            .insert((user_id.to_string(), kind.to_string()), value);
    }

    async fn clear(&self, user_id: &str, kind: &str) {
        self.entries
            .remove(&(user_id.to_string(), kind.to_string()));
    }

    async fn purge_other_users(&self, keep_user_id: &str) {
        self.entries.retain(|(user, _), _| user == keep_user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_clear_round_trip() {
        let store = MemorySessionStore::new();
        store.set("dana", "template-vm", json!({"id": "vm-1"})).await;

        assert_eq!(
            store.get("dana", "template-vm").await,
            Some(json!({"id": "vm-1"}))
        );
        assert_eq!(store.get("dana", "other").await, None);

        store.clear("dana", "template-vm").await;
        assert_eq!(store.get("dana", "template-vm").await, None);
    }

    #[tokio::test]
    async fn test_purge_keeps_only_the_given_user() {
        let store = MemorySessionStore::new();
        store.set("dana", "template-vm", json!(1)).await;
        store.set("dana", "drafts", json!(2)).await;
        store.set("omer", "template-vm", json!(3)).await;
        store.set("omer", "drafts", json!(4)).await;

        store.purge_other_users("dana").await;

        assert!(store.get("dana", "template-vm").await.is_some());
        assert!(store.get("dana", "drafts").await.is_some());
        assert!(store.get("omer", "template-vm").await.is_none());
        assert!(store.get("omer", "drafts").await.is_none());
    }
}
