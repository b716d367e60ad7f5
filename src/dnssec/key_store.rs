//! DNSSEC Key Store
//!
//! Whole-bundle persistence of CDN key bundles in a KV cluster under
//! `(bucket = "dnssec", key = <cdn name>)`. Every operation opens its own
//! cluster session; the session is released when it goes out of scope, on
//! success and error paths alike.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::dnssec_config::KvConfig;
use super::{CdnDnssecBundle, Deadline, DnssecError};

/// Bucket holding CDN key bundles
pub const DNSSEC_BUCKET: &str = "dnssec";

/// Content type of stored bundles
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A KV cluster that hands out sessions
#[async_trait]
pub trait KvCluster: Send + Sync {
    /// Open a session; dropping it releases the session
    async fn start(&self) -> Result<Box<dyn KvSession>, DnssecError>;
}

/// An open session against the cluster. Reads and writes use quorum semantics.
#[async_trait]
pub trait KvSession: Send {
    async fn fetch(&mut self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, DnssecError>;

    async fn store(
        &mut self,
        bucket: &str,
        key: &str,
        value: Vec<u8>,
        content_type: &str,
    ) -> Result<(), DnssecError>;

    /// Delete an object; deleting an absent object succeeds
    async fn delete(&mut self, bucket: &str, key: &str) -> Result<(), DnssecError>;
}

/// Key bundle store over a KV cluster
#[derive(Clone)]
pub struct KeyStore {
    cluster: Arc<dyn KvCluster>,
}

impl KeyStore {
    pub fn new(cluster: Arc<dyn KvCluster>) -> Self {
        Self { cluster }
    }

    pub fn cluster(&self) -> Arc<dyn KvCluster> {
        Arc::clone(&self.cluster)
    }

    /// Fetch the bundle for a CDN, `None` when absent
    pub async fn get(
        &self,
        cdn_name: &str,
        deadline: Deadline,
    ) -> Result<Option<CdnDnssecBundle>, DnssecError> {
        let mut session = self.open(deadline).await?;
        let raw = deadline
            .run("fetching dnssec keys", session.fetch(DNSSEC_BUCKET, cdn_name))
            .await?;

        match raw {
            Some(bytes) => {
                let bundle = serde_json::from_slice(&bytes).map_err(|e| {
                    DnssecError::StoreSerialization(format!(
                        "decoding dnssec keys for CDN {}: {}",
                        cdn_name, e
                    ))
                })?;
                Ok(Some(bundle))
            }
            None => Ok(None),
        }
    }

    /// Replace the bundle for a CDN
    pub async fn put(
        &self,
        cdn_name: &str,
        bundle: &CdnDnssecBundle,
        deadline: Deadline,
    ) -> Result<(), DnssecError> {
        let value = serde_json::to_vec(bundle).map_err(|e| {
            DnssecError::StoreSerialization(format!("encoding dnssec keys for CDN {}: {}", cdn_name, e))
        })?;

        let mut session = self.open(deadline).await?;
        deadline
            .run(
                "storing dnssec keys",
                session.store(DNSSEC_BUCKET, cdn_name, value, JSON_CONTENT_TYPE),
            )
            .await?;

        info!("Stored DNSSEC keys for CDN {} ({} zones)", cdn_name, bundle.len());
        Ok(())
    }

    /// Remove the bundle for a CDN. Idempotent.
    pub async fn delete(&self, cdn_name: &str, deadline: Deadline) -> Result<(), DnssecError> {
        let mut session = self.open(deadline).await?;
        deadline
            .run("deleting dnssec keys", session.delete(DNSSEC_BUCKET, cdn_name))
            .await?;

        info!("Deleted DNSSEC keys for CDN {}", cdn_name);
        Ok(())
    }

    async fn open(&self, deadline: Deadline) -> Result<Box<dyn KvSession>, DnssecError> {
        deadline.run("starting kv cluster session", self.cluster.start()).await
    }
}

// =============================================================================
// REDIS CLUSTER
// =============================================================================

/// KV cluster backed by Redis/DragonflyDB
pub struct RedisKvCluster {
    client: Client,
    quorum_replicas: u32,
    quorum_timeout_ms: u64,
}

impl RedisKvCluster {
    pub fn new(config: &KvConfig) -> Result<Self, DnssecError> {
        let url = config.url()?;
        let client = Client::open(url.as_str())
            .map_err(|e| DnssecError::StoreUnavailable(format!("opening kv cluster client: {}", e)))?;

        Ok(Self {
            client,
            quorum_replicas: config.quorum_replicas,
            quorum_timeout_ms: config.quorum_timeout_ms,
        })
    }
}

#[async_trait]
impl KvCluster for RedisKvCluster {
    async fn start(&self) -> Result<Box<dyn KvSession>, DnssecError> {
        let connection = self.client.get_multiplexed_async_connection().await?;
        debug!("Started kv cluster session");

        Ok(Box::new(RedisKvSession {
            connection,
            quorum_replicas: self.quorum_replicas,
            quorum_timeout_ms: self.quorum_timeout_ms,
        }))
    }
}

struct RedisKvSession {
    connection: MultiplexedConnection,
    quorum_replicas: u32,
    quorum_timeout_ms: u64,
}

impl RedisKvSession {
    /// Block until the last write reached the configured number of replicas
    async fn await_quorum(&mut self) -> Result<(), DnssecError> {
        if self.quorum_replicas == 0 {
            return Ok(());
        }

        let acked: u32 = redis::cmd("WAIT")
            .arg(self.quorum_replicas)
            .arg(self.quorum_timeout_ms)
            .query_async(&mut self.connection)
            .await?;

        if acked < self.quorum_replicas {
            return Err(DnssecError::StoreUnavailable(format!(
                "write reached {} of {} replicas",
                acked, self.quorum_replicas
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl KvSession for RedisKvSession {
    async fn fetch(&mut self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, DnssecError> {
        let value: Option<Vec<u8>> = self.connection.hget(object_key(bucket, key), "value").await?;
        Ok(value)
    }

    async fn store(
        &mut self,
        bucket: &str,
        key: &str,
        value: Vec<u8>,
        content_type: &str,
    ) -> Result<(), DnssecError> {
        let object = object_key(bucket, key);
        let fields = [
            ("content_type", content_type.as_bytes().to_vec()),
            ("value", value),
        ];

        redis::pipe()
            .atomic()
            .del(&object)
            .ignore()
            .hset_multiple(&object, &fields)
            .ignore()
            .query_async::<_, ()>(&mut self.connection)
            .await?;

        self.await_quorum().await
    }

    async fn delete(&mut self, bucket: &str, key: &str) -> Result<(), DnssecError> {
        self.connection.del::<_, ()>(object_key(bucket, key)).await?;
        self.await_quorum().await
    }
}

impl Drop for RedisKvSession {
    fn drop(&mut self) {
        debug!("Released kv cluster session");
    }
}

fn object_key(bucket: &str, key: &str) -> String {
    format!("{}:{}", bucket, key)
}

impl From<redis::RedisError> for DnssecError {
    fn from(e: redis::RedisError) -> Self {
        DnssecError::StoreUnavailable(e.to_string())
    }
}

// =============================================================================
// IN-MEMORY CLUSTER
// =============================================================================

/// A stored object and its content type
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub value: Vec<u8>,
    pub content_type: String,
}

/// Single-process KV cluster for development and tests
#[derive(Default)]
pub struct MemoryKvCluster {
    objects: Arc<RwLock<HashMap<(String, String), StoredObject>>>,
    open_sessions: Arc<AtomicUsize>,
    unavailable: AtomicBool,
}

impl MemoryKvCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sessions that have been started and not yet released
    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    /// Make `start` fail as if the cluster were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Read an object directly, bypassing sessions
    pub async fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .read()
            .await
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Write an object directly, bypassing sessions
    pub async fn insert_object(&self, bucket: &str, key: &str, value: Vec<u8>) {
        self.objects.write().await.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                value,
                content_type: JSON_CONTENT_TYPE.to_string(),
            },
        );
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl KvCluster for MemoryKvCluster {
    async fn start(&self) -> Result<Box<dyn KvSession>, DnssecError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DnssecError::StoreUnavailable("kv cluster unreachable".to_string()));
        }

        self.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryKvSession {
            objects: Arc::clone(&self.objects),
            open_sessions: Arc::clone(&self.open_sessions),
        }))
    }
}

struct MemoryKvSession {
    objects: Arc<RwLock<HashMap<(String, String), StoredObject>>>,
    open_sessions: Arc<AtomicUsize>,
}

#[async_trait]
impl KvSession for MemoryKvSession {
    async fn fetch(&mut self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, DnssecError> {
        let objects = self.objects.read().await;
        Ok(objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.value.clone()))
    }

    async fn store(
        &mut self,
        bucket: &str,
        key: &str,
        value: Vec<u8>,
        content_type: &str,
    ) -> Result<(), DnssecError> {
        let mut objects = self.objects.write().await;
        objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                value,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn delete(&mut self, bucket: &str, key: &str) -> Result<(), DnssecError> {
        let mut objects = self.objects.write().await;
        objects.remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}

impl Drop for MemoryKvSession {
    fn drop(&mut self) {
        self.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}
