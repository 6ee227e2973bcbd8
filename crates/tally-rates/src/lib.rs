//! # Tally Rates
//!
//! TTL-cached, single-flight fetcher of cross-currency rates. Rates are used
//! only at read time to compute converted bill totals.
//!
//! Lookup order: in-process snapshot within TTL, then the shared cache, then
//! an HTTP GET against the provider. Cache write failures are logged and
//! swallowed; the freshly fetched snapshot is still adopted in-process.

pub mod cache;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use tally_common::config::RatesConfig;
use tally_common::{BillingError, RatesSnapshot, Result};

pub use cache::{InMemoryRatesCache, RatesCache, RedisRatesCache};

/// Read-side interface consumed by the billing service
#[async_trait]
pub trait ExchangeRates: Send + Sync {
    /// Current rates snapshot, or upstream-unavailable.
    async fn get_rates(&self) -> Result<RatesSnapshot>;
}

/// Provider wire payload; disclaimer/license fields are ignored
#[derive(Debug, Deserialize)]
struct ProviderPayload {
    #[serde(default)]
    base: String,
    rates: HashMap<String, Decimal>,
    #[serde(default)]
    timestamp: i64,
}

/// TTL-cached rate service backed by a shared cache and the provider API
pub struct RatesService {
    cfg: RatesConfig,
    cache: Arc<dyn RatesCache>,
    http: reqwest::Client,
    current: RwLock<Option<RatesSnapshot>>,
    /// Gates refresh so concurrent expired readers trigger a single fetch
    refresh_gate: Mutex<()>,
}

impl RatesService {
    pub fn new(cfg: RatesConfig, cache: Arc<dyn RatesCache>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.http_timeout_secs))
            .build()
            .map_err(|e| BillingError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            cfg,
            cache,
            http,
            current: RwLock::new(None),
            refresh_gate: Mutex::new(()),
        })
    }

    fn is_fresh(&self, snapshot: &RatesSnapshot) -> bool {
        let ttl = chrono::Duration::seconds(self.cfg.ttl_secs as i64);
        Utc::now() < snapshot.updated_at + ttl
    }

    async fn fresh_in_process(&self) -> Option<RatesSnapshot> {
        let guard = self.current.read().await;
        guard.as_ref().filter(|s| self.is_fresh(*s)).cloned()
    }

    /// Read the shared cache or fetch from the provider, then adopt.
    async fn refresh(&self) -> Result<RatesSnapshot> {
        match self.cache.get(&self.cfg.cache_key).await {
            Ok(Some(snapshot)) => {
                info!(
                    rates_count = snapshot.rates.len(),
                    cache_updated_at = %snapshot.updated_at,
                    "adopted exchange rates from shared cache"
                );
                *self.current.write().await = Some(snapshot.clone());
                return Ok(snapshot);
            }
            Ok(None) => debug!("shared cache miss"),
            Err(e) => warn!(error = %e, "shared cache read failed"),
        }

        let snapshot = self.fetch().await?;

        if let Err(e) = self.cache.set(&self.cfg.cache_key, &snapshot).await {
            // The snapshot is still served from memory.
            warn!(error = %e, "failed to write exchange rates to shared cache");
        }

        *self.current.write().await = Some(snapshot.clone());
        Ok(snapshot)
    }

    #[instrument(skip(self), fields(endpoint = %self.cfg.base_url))]
    async fn fetch(&self) -> Result<RatesSnapshot> {
        info!("fetching exchange rates from provider");

        let url = format!("{}?app_id={}", self.cfg.base_url, self.cfg.app_id);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| BillingError::UpstreamUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BillingError::UpstreamUnavailable(format!(
                "rate provider returned status {status}"
            )));
        }

        let payload: ProviderPayload = response
            .json()
            .await
            .map_err(|e| BillingError::UpstreamUnavailable(format!("invalid rate payload: {e}")))?;

        info!(
            base_currency = %payload.base,
            rates_count = payload.rates.len(),
            api_timestamp = payload.timestamp,
            "fetched exchange rates"
        );

        Ok(RatesSnapshot::new(payload.rates, Utc::now()))
    }
}

#[async_trait]
impl ExchangeRates for RatesService {
    #[instrument(skip(self))]
    async fn get_rates(&self) -> Result<RatesSnapshot> {
        if let Some(snapshot) = self.fresh_in_process().await {
            debug!(updated_at = %snapshot.updated_at, "exchange rates are still fresh");
            return Ok(snapshot);
        }

        let _gate = self.refresh_gate.lock().await;

        // A concurrent caller may have refreshed while this one waited.
        if let Some(snapshot) = self.fresh_in_process().await {
            return Ok(snapshot);
        }

        info!("exchange rates expired, updating from cache or provider");
        self.refresh().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::{Json, Router};
    use rust_decimal_macros::dec;

    fn config(base_url: &str, ttl_secs: u64) -> RatesConfig {
        RatesConfig {
            base_url: base_url.to_string(),
            app_id: "test-app-id".to_string(),
            ttl_secs,
            cache_key: "exchange_rates".to_string(),
            http_timeout_secs: 5,
        }
    }

    fn snapshot(rates: &[(&str, Decimal)]) -> RatesSnapshot {
        let map = rates.iter().map(|(c, r)| (c.to_string(), *r)).collect();
        RatesSnapshot::new(map, Utc::now())
    }

    /// Shared cache whose writes always fail.
    struct WriteFailingCache;

    #[async_trait]
    impl RatesCache for WriteFailingCache {
        async fn get(&self, _key: &str) -> Result<Option<RatesSnapshot>> {
            Ok(None)
        }
        async fn set(&self, _key: &str, _snapshot: &RatesSnapshot) -> Result<()> {
            Err(BillingError::Storage("cache down".into()))
        }
    }

    async fn spawn_provider(payload: serde_json::Value) -> String {
        let app = Router::new().route(
            "/latest.json",
            get(move || {
                let payload = payload.clone();
                async move { Json(payload) }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/latest.json")
    }

    #[test]
    fn test_provider_payload_decodes_float_rates_as_decimal() {
        let payload: ProviderPayload = serde_json::from_str(
            r#"{"base":"USD","disclaimer":"x","license":"y","rates":{"USD":1.0,"GEL":2.5},"timestamp":1735689600}"#,
        )
        .unwrap();
        assert_eq!(payload.rates["GEL"], dec!(2.5));
        assert_eq!(payload.base, "USD");
    }

    #[tokio::test]
    async fn test_adopts_snapshot_from_shared_cache() {
        // Bogus provider URL: reaching the fetch path would fail the call.
        let cache = Arc::new(InMemoryRatesCache::new(Duration::from_secs(3600)));
        cache
            .set("exchange_rates", &snapshot(&[("USD", dec!(1.0))]))
            .await
            .unwrap();

        let service =
            RatesService::new(config("http://127.0.0.1:1/latest.json", 3600), cache).unwrap();
        let rates = service.get_rates().await.unwrap();
        assert_eq!(rates.rates["USD"], dec!(1.0));
    }

    #[tokio::test]
    async fn test_in_process_snapshot_served_within_ttl() {
        let cache = Arc::new(InMemoryRatesCache::new(Duration::from_secs(3600)));
        cache
            .set("exchange_rates", &snapshot(&[("USD", dec!(1.0))]))
            .await
            .unwrap();

        let service = RatesService::new(
            config("http://127.0.0.1:1/latest.json", 3600),
            cache.clone(),
        )
        .unwrap();
        service.get_rates().await.unwrap();

        // Drop the shared cache entry: the second read must come from the
        // in-process snapshot.
        cache.clear();
        let rates = service.get_rates().await.unwrap();
        assert_eq!(rates.rates["USD"], dec!(1.0));
    }

    #[tokio::test]
    async fn test_fetches_from_provider_and_populates_cache() {
        let url = spawn_provider(serde_json::json!({
            "base": "USD",
            "rates": {"USD": 1.0, "GEL": 2.5},
            "timestamp": 1735689600,
        }))
        .await;

        let cache = Arc::new(InMemoryRatesCache::new(Duration::from_secs(3600)));
        let service = RatesService::new(config(&url, 3600), cache.clone()).unwrap();

        let rates = service.get_rates().await.unwrap();
        assert_eq!(rates.rates["GEL"], dec!(2.5));

        let cached = cache.get("exchange_rates").await.unwrap();
        assert!(cached.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_expired_callers_share_one_fetch() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let hits = Arc::new(AtomicU32::new(0));
        let handler_hits = Arc::clone(&hits);
        let app = Router::new().route(
            "/latest.json",
            get(move || {
                handler_hits.fetch_add(1, Ordering::SeqCst);
                async {
                    Json(serde_json::json!({
                        "base": "USD",
                        "rates": {"USD": 1.0},
                        "timestamp": 1735689600,
                    }))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let url = format!("http://{addr}/latest.json");

        let cache = Arc::new(InMemoryRatesCache::new(Duration::from_secs(3600)));
        let service = RatesService::new(config(&url, 3600), cache).unwrap();

        let (a, b, c) =
            tokio::join!(service.get_rates(), service.get_rates(), service.get_rates());
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_provider_failure_surfaces_upstream_unavailable() {
        let cache = Arc::new(InMemoryRatesCache::new(Duration::from_secs(3600)));
        let service =
            RatesService::new(config("http://127.0.0.1:1/latest.json", 3600), cache).unwrap();

        let err = service.get_rates().await.unwrap_err();
        assert_eq!(err.code(), "upstream_unavailable");
    }

    #[tokio::test]
    async fn test_cache_write_failure_is_swallowed() {
        let url = spawn_provider(serde_json::json!({
            "base": "USD",
            "rates": {"USD": 1.0},
            "timestamp": 1735689600,
        }))
        .await;

        let service =
            RatesService::new(config(&url, 3600), Arc::new(WriteFailingCache)).unwrap();
        let rates = service.get_rates().await.unwrap();
        assert_eq!(rates.rates["USD"], dec!(1.0));
    }
}
