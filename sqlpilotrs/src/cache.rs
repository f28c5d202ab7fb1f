//! In-process caches: a TTL map for table metadata and the results backend
//! used by SQL Lab to hand off large payloads.

use std::collections::HashMap;
use std::hash::Hash;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::{MetadataCacheConfig, ResultsBackendConfig};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// Cache entry with insertion time and expiry.
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    expires_at: Instant,
}

/// Map with per-entry TTL and a size cap; the oldest entry is evicted first.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    ttl: Duration,
    max_size: usize,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            max_size: max_size.max(1),
        }
    }

    pub fn insert(&mut self, key: K, value: V) {
        let ttl = self.ttl;
        self.insert_with_ttl(key, value, ttl);
    }

    pub fn insert_with_ttl(&mut self, key: K, value: V, ttl: Duration) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_size {
            self.evict_expired();
            if self.entries.len() >= self.max_size {
                self.evict_oldest();
            }
        }
        let now = Instant::now();
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
                expires_at: now + ttl,
            },
        );
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.get(key).and_then(|entry| {
            if Instant::now() < entry.expires_at {
                Some(entry.value.clone())
            } else {
                // Expired - treat as cache miss
                None
            }
        })
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|e| e.value)
    }

    /// Remove expired entries from the cache.
    pub fn evict_expired(&mut self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| now < entry.expires_at);
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest_key) = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.inserted_at)
            .map(|(k, _)| k.clone())
        {
            tracing::debug!(key = ?oldest_key, "evicting oldest cache entry");
            self.entries.remove(&oldest_key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Table metadata keyed by (database, schema-qualified table).
pub type SchemaCache = TtlCache<(String, String), TableSchema>;

impl SchemaCache {
    pub fn with_config(config: &MetadataCacheConfig) -> Self {
        Self::new(Duration::from_secs(config.ttl_secs), config.max_size)
    }
}

/// Out-of-band payload store. Entries are written once under a fresh key.
#[async_trait]
pub trait ResultsBackend: Send + Sync {
    async fn set(&self, key: &str, payload: Vec<u8>, ttl: Duration) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn delete(&self, key: &str) -> Result<()>;
}

pub struct InMemoryResultsBackend {
    entries: Mutex<TtlCache<String, Vec<u8>>>,
}

impl InMemoryResultsBackend {
    pub fn new(config: &ResultsBackendConfig) -> Self {
        Self {
            entries: Mutex::new(TtlCache::new(
                Duration::from_secs(config.ttl_secs),
                config.max_entries,
            )),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

impl Default for InMemoryResultsBackend {
    fn default() -> Self {
        Self::new(&ResultsBackendConfig::default())
    }
}

#[async_trait]
impl ResultsBackend for InMemoryResultsBackend {
    async fn set(&self, key: &str, payload: Vec<u8>, ttl: Duration) -> Result<()> {
        let bytes = payload.len();
        self.entries
            .lock()
            .await
            .insert_with_ttl(key.to_string(), payload, ttl);
        tracing::debug!(key, bytes, ttl_secs = ttl.as_secs(), "stored results payload");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().await.get(&key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(&key.to_string());
        Ok(())
    }
}

/// Serialize to JSON and zlib-compress.
pub fn compress_payload<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(value)?;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

pub fn decompress_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let mut decoder = ZlibDecoder::new(bytes);
    let mut json = Vec::new();
    decoder.read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}
