//! Shared rates caches
//!
//! The redis variant is the production shared cache; the in-memory variant
//! backs tests and single-process deployments. Entries expire after the
//! configured TTL, which equals the refresh period.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redis::{aio::MultiplexedConnection, AsyncCommands, Client};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use tally_common::{BillingError, RatesSnapshot, Result};

/// Shared-storage cache for rates snapshots
#[async_trait]
pub trait RatesCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<RatesSnapshot>>;
    async fn set(&self, key: &str, snapshot: &RatesSnapshot) -> Result<()>;
}

/// Redis-backed shared cache
pub struct RedisRatesCache {
    client: Client,
    connection: Arc<RwLock<Option<MultiplexedConnection>>>,
    ttl: Duration,
}

impl RedisRatesCache {
    pub async fn new(redis_url: &str, ttl: Duration) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| BillingError::Internal(format!("failed to create redis client: {e}")))?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BillingError::Storage(format!("failed to connect to redis: {e}")))?;

        Ok(Self {
            client,
            connection: Arc::new(RwLock::new(Some(connection))),
            ttl,
        })
    }

    async fn get_connection(&self) -> Result<MultiplexedConnection> {
        let guard = self.connection.read().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        drop(guard);

        let mut guard = self.connection.write().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let connection = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BillingError::Storage(format!("failed to reconnect to redis: {e}")))?;

        *guard = Some(connection.clone());
        Ok(connection)
    }
}

#[async_trait]
impl RatesCache for RedisRatesCache {
    async fn get(&self, key: &str) -> Result<Option<RatesSnapshot>> {
        let mut conn = self.get_connection().await?;

        let cached: Option<String> = conn.get(key).await.map_err(|e| {
            warn!(error = %e, "redis get failed");
            BillingError::Storage(format!("redis get failed: {e}"))
        })?;

        match cached {
            Some(json) => {
                let snapshot: RatesSnapshot = serde_json::from_str(&json)?;
                debug!(key, "rates cache hit");
                Ok(Some(snapshot))
            }
            None => {
                debug!(key, "rates cache miss");
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, snapshot: &RatesSnapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot)?;
        let mut conn = self.get_connection().await?;

        conn.set_ex::<_, _, ()>(key, json, self.ttl.as_secs())
            .await
            .map_err(|e| {
                warn!(error = %e, "redis set failed");
                BillingError::Storage(format!("redis set failed: {e}"))
            })?;

        debug!(key, ttl_secs = self.ttl.as_secs(), "cached rates snapshot");
        Ok(())
    }
}

/// In-memory shared cache with TTL expiry
pub struct InMemoryRatesCache {
    entries: DashMap<String, (RatesSnapshot, DateTime<Utc>)>,
    ttl: Duration,
}

impl InMemoryRatesCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl RatesCache for InMemoryRatesCache {
    async fn get(&self, key: &str) -> Result<Option<RatesSnapshot>> {
        Ok(self.entries.get(key).and_then(|entry| {
            let (snapshot, expires_at) = entry.value();
            if Utc::now() < *expires_at {
                Some(snapshot.clone())
            } else {
                None
            }
        }))
    }

    async fn set(&self, key: &str, snapshot: &RatesSnapshot) -> Result<()> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.ttl)
                .map_err(|e| BillingError::Internal(format!("invalid cache ttl: {e}")))?;
        self.entries
            .insert(key.to_string(), (snapshot.clone(), expires_at));
        Ok(())
    }
}
