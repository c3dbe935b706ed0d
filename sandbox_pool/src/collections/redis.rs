//! Redis-backed collections for allocators shared across processes.
//!
//! The set lives in one Redis set key; mapping entries are individual string
//! keys holding JSON. Both are namespaced under the configured key prefix.

use crate::collections::config::RedisConfig;
use crate::collections::traits::{KeyStream, KeyedMapping, KeyedSet};
use crate::{Error, Result};
use async_trait::async_trait;
use futures_util::stream;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::VecDeque;

const SCAN_COUNT: usize = 100;

#[tracing::instrument(level = "debug", skip(cfg), fields(url = %cfg.redacted_url()))]
async fn connect(cfg: &RedisConfig) -> Result<ConnectionManager> {
    let client =
        redis::Client::open(cfg.url.clone()).map_err(|e| Error::backend("redis client open", e))?;
    ConnectionManager::new(client)
        .await
        .map_err(|e| Error::backend("redis connect", e))
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::InvalidInput("redis key is empty".to_string()));
    }
    if name.contains(' ') {
        return Err(Error::InvalidInput(
            "redis key must not contain spaces".to_string(),
        ));
    }
    Ok(())
}

/// `"{prefix}:{name}"`, or just `name` when no prefix is configured.
pub(crate) fn namespaced(prefix: Option<&str>, name: &str) -> String {
    match prefix.map(str::trim).filter(|p| !p.is_empty()) {
        Some(p) => format!("{p}:{name}"),
        None => name.to_string(),
    }
}

/// Escape glob metacharacters so a caller prefix matches literally in `SCAN MATCH`.
pub(crate) fn glob_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

#[derive(Clone)]
pub struct RedisSet {
    manager: ConnectionManager,
    key: String,
}

impl RedisSet {
    /// Connect and bind to the set named `name` under the configured prefix.
    #[tracing::instrument(level = "debug", skip(cfg))]
    pub async fn connect(cfg: &RedisConfig, name: &str) -> Result<Self> {
        validate_name(name)?;
        let manager = connect(cfg).await?;
        Ok(Self::with_manager(manager, cfg.key_prefix.as_deref(), name))
    }

    pub fn with_manager(manager: ConnectionManager, prefix: Option<&str>, name: &str) -> Self {
        Self {
            manager,
            key: namespaced(prefix, name),
        }
    }
}

#[async_trait]
impl KeyedSet for RedisSet {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn add(&self, member: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        let added: i64 = conn
            .sadd(&self.key, member)
            .await
            .map_err(|e| Error::backend("redis sadd", e))?;
        Ok(added > 0)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn remove(&self, member: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        let removed: i64 = conn
            .srem(&self.key, member)
            .await
            .map_err(|e| Error::backend("redis srem", e))?;
        Ok(removed > 0)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn contains(&self, member: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        conn.sismember(&self.key, member)
            .await
            .map_err(|e| Error::backend("redis sismember", e))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn clear(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: i64 = conn
            .del(&self.key)
            .await
            .map_err(|e| Error::backend("redis del", e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn to_list(&self) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        let mut members: Vec<String> = conn
            .smembers(&self.key)
            .await
            .map_err(|e| Error::backend("redis smembers", e))?;
        members.sort();
        Ok(members)
    }
}

#[derive(Clone)]
pub struct RedisMapping {
    manager: ConnectionManager,
    /// Full namespace including the trailing `:`; stripped from scanned keys.
    namespace: String,
}

impl RedisMapping {
    #[tracing::instrument(level = "debug", skip(cfg))]
    pub async fn connect(cfg: &RedisConfig, name: &str) -> Result<Self> {
        validate_name(name)?;
        let manager = connect(cfg).await?;
        Ok(Self::with_manager(manager, cfg.key_prefix.as_deref(), name))
    }

    pub fn with_manager(manager: ConnectionManager, prefix: Option<&str>, name: &str) -> Self {
        Self {
            manager,
            namespace: format!("{}:", namespaced(prefix, name)),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{key}", self.namespace)
    }
}

struct ScanState {
    conn: ConnectionManager,
    pattern: String,
    namespace: String,
    cursor: u64,
    buffered: VecDeque<String>,
    started: bool,
}

impl ScanState {
    /// Next key, fetching further `SCAN` pages as needed. `None` once the cursor wraps to 0.
    async fn next_key(&mut self) -> Option<Result<String>> {
        loop {
            if let Some(raw) = self.buffered.pop_front() {
                let stripped = raw
                    .strip_prefix(&self.namespace)
                    .map(str::to_string)
                    .unwrap_or(raw);
                return Some(Ok(stripped));
            }
            if self.started && self.cursor == 0 {
                return None;
            }
            self.started = true;
            let page: redis::RedisResult<(u64, Vec<String>)> = redis::cmd("SCAN")
                .arg(self.cursor)
                .arg("MATCH")
                .arg(&self.pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut self.conn)
                .await;
            match page {
                Ok((next, keys)) => {
                    self.cursor = next;
                    self.buffered.extend(keys);
                }
                Err(e) => {
                    // Terminate after surfacing the error.
                    self.cursor = 0;
                    return Some(Err(Error::backend("redis scan", e)));
                }
            }
        }
    }
}

#[async_trait]
impl KeyedMapping for RedisMapping {
    #[tracing::instrument(level = "debug", skip(self, value))]
    async fn set(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let raw = serde_json::to_string(&value)
            .map_err(|e| Error::backend("serialize mapping value", e))?;
        let mut conn = self.manager.clone();
        let _: () = conn
            .set(self.full_key(key), raw)
            .await
            .map_err(|e| Error::backend("redis set", e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn
            .get(self.full_key(key))
            .await
            .map_err(|e| Error::backend("redis get", e))?;
        raw.map(|s| {
            serde_json::from_str(&s).map_err(|e| Error::backend("deserialize mapping value", e))
        })
        .transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        let n: i64 = conn
            .del(self.full_key(key))
            .await
            .map_err(|e| Error::backend("redis del", e))?;
        Ok(n > 0)
    }

    fn scan(&self, prefix: &str) -> KeyStream {
        let state = ScanState {
            conn: self.manager.clone(),
            pattern: format!("{}*", glob_escape(&self.full_key(prefix))),
            namespace: self.namespace.clone(),
            cursor: 0,
            buffered: VecDeque::new(),
            started: false,
        };
        Box::pin(stream::unfold(state, |mut state| async move {
            let item = state.next_key().await?;
            Some((item, state))
        }))
    }
}
