//! In-process collections. Clones share state, so every allocator built from
//! one `InMemorySet` sees the same reservations.

use crate::collections::traits::{KeyStream, KeyedMapping, KeyedSet};
use crate::Result;
use async_trait::async_trait;
use futures_util::stream;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default)]
pub struct InMemorySet {
    members: Arc<RwLock<HashSet<String>>>,
}

impl InMemorySet {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyedSet for InMemorySet {
    async fn add(&self, member: &str) -> Result<bool> {
        Ok(self.members.write().await.insert(member.to_string()))
    }

    async fn remove(&self, member: &str) -> Result<bool> {
        Ok(self.members.write().await.remove(member))
    }

    async fn contains(&self, member: &str) -> Result<bool> {
        Ok(self.members.read().await.contains(member))
    }

    async fn clear(&self) -> Result<()> {
        self.members.write().await.clear();
        Ok(())
    }

    async fn to_list(&self) -> Result<Vec<String>> {
        let mut out: Vec<String> = self.members.read().await.iter().cloned().collect();
        out.sort();
        Ok(out)
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryMapping {
    entries: Arc<RwLock<BTreeMap<String, serde_json::Value>>>,
}

impl InMemoryMapping {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyedMapping for InMemoryMapping {
    async fn set(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    fn scan(&self, prefix: &str) -> KeyStream {
        let entries = self.entries.clone();
        let prefix = prefix.to_string();
        // Snapshot lazily on first poll so every call is an independent pass.
        let keys = stream::once(async move {
            let snapshot: Vec<Result<String>> = entries
                .read()
                .await
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&prefix))
                .map(|(k, _)| Ok(k.clone()))
                .collect();
            stream::iter(snapshot)
        });
        Box::pin(futures_util::StreamExt::flatten(keys))
    }
}
