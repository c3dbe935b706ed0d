use crate::Result;
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;

/// Lazy, finite stream of mapping keys. Each `scan` call starts a fresh pass.
pub type KeyStream = Pin<Box<dyn Stream<Item = Result<String>> + Send + 'static>>;

/// Membership set shared by every allocator that points at the same backing store.
///
/// `add` is the reservation primitive: it must be atomic, so two concurrent
/// callers adding the same member see exactly one `true`.
#[async_trait]
pub trait KeyedSet: Send + Sync {
    /// Insert `member`. Returns `false` if it was already present.
    async fn add(&self, member: &str) -> Result<bool>;

    /// Remove `member`. Returns `false` if it was absent.
    async fn remove(&self, member: &str) -> Result<bool>;

    async fn contains(&self, member: &str) -> Result<bool>;

    async fn clear(&self) -> Result<()>;

    async fn to_list(&self) -> Result<Vec<String>>;
}

/// Key/value mapping with prefix scans.
#[async_trait]
pub trait KeyedMapping: Send + Sync {
    async fn set(&self, key: &str, value: serde_json::Value) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;

    /// Delete `key`. Returns `false` if it was absent.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Keys starting with `prefix`, without any store-level namespace.
    ///
    /// Keys added while the stream is being consumed may or may not be
    /// yielded; keys present for the whole scan are yielded at least once.
    fn scan(&self, prefix: &str) -> KeyStream;
}
