// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cached snapshots of remotely managed configuration.
//!
//! The sampling configuration and the governance rules are pulled from the Remote
//! Configuration Service and kept as immutable snapshots. Readers always get the latest
//! cached value; refreshes run in the background and never hold up an invocation.

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::governance::RulesSnapshot;
use crate::http::APPLICATION_ID_HEADER;
use crate::sampling::ConfigSnapshot;

pub const CONFIG_ETAG_HEADER: &str = "X-Moesif-Config-ETag";
const CONFIG_PATH: &str = "/v1/config";
const RULES_PATH: &str = "/v1/rules";
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[async_trait]
pub trait RemoteConfigService {
    async fn fetch_config(&self) -> Result<ConfigSnapshot, FetchError>;
    async fn fetch_rules(&self) -> Result<RulesSnapshot, FetchError>;
}

/// Remote Configuration Service client over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpRemoteConfig {
    client: reqwest::Client,
    base_uri: String,
    application_id: String,
}

impl HttpRemoteConfig {
    pub fn new(client: reqwest::Client, base_uri: &str, application_id: &str) -> Self {
        HttpRemoteConfig {
            client,
            base_uri: base_uri.trim_end_matches('/').to_string(),
            application_id: application_id.to_string(),
        }
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, FetchError> {
        let response = self
            .client
            .get(format!("{}{path}", self.base_uri))
            .header(APPLICATION_ID_HEADER, &self.application_id)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }
        Ok(response)
    }
}

#[async_trait]
impl RemoteConfigService for HttpRemoteConfig {
    async fn fetch_config(&self) -> Result<ConfigSnapshot, FetchError> {
        let response = self.get(CONFIG_PATH).await?;
        let etag = response
            .headers()
            .get(CONFIG_ETAG_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let mut snapshot = response
            .json::<ConfigSnapshot>()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))?;
        snapshot.etag = etag;
        Ok(snapshot)
    }

    async fn fetch_rules(&self) -> Result<RulesSnapshot, FetchError> {
        self.get(RULES_PATH)
            .await?
            .json::<RulesSnapshot>()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))
    }
}

/// Latest snapshot of `T` plus the bookkeeping deciding when to fetch a new one.
pub struct SnapshotCache<T> {
    current: RwLock<Arc<T>>,
    last_fetch: Mutex<Option<Instant>>,
    stale: AtomicBool,
    in_flight: AtomicBool,
    loaded: watch::Sender<bool>,
    refresh_interval: Duration,
}

impl<T: Send + Sync + 'static> SnapshotCache<T> {
    pub fn new(initial: T, refresh_interval: Duration) -> Self {
        let (loaded, _) = watch::channel(false);
        SnapshotCache {
            current: RwLock::new(Arc::new(initial)),
            last_fetch: Mutex::new(None),
            stale: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
            loaded,
            refresh_interval,
        }
    }

    #[allow(clippy::expect_used)]
    pub fn get(&self) -> Arc<T> {
        Arc::clone(&self.current.read().expect("lock poisoned"))
    }

    #[allow(clippy::expect_used)]
    pub fn set(&self, snapshot: T) {
        *self.current.write().expect("lock poisoned") = Arc::new(snapshot);
        self.loaded.send_replace(true);
    }

    pub fn is_loaded(&self) -> bool {
        *self.loaded.borrow()
    }

    /// Forces the next `try_refresh` to fetch regardless of age.
    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }

    #[allow(clippy::expect_used)]
    fn needs_refresh(&self) -> bool {
        if self.stale.load(Ordering::Acquire) {
            return true;
        }
        match *self.last_fetch.lock().expect("lock poisoned") {
            None => true,
            Some(at) => at.elapsed() >= self.refresh_interval,
        }
    }

    /// Starts a background fetch when the snapshot is due and no fetch is running.
    #[allow(clippy::expect_used)]
    pub fn try_refresh<F, Fut>(self: &Arc<Self>, label: &'static str, fetch: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        if !self.needs_refresh() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("{label}: no async runtime, skipping refresh");
            return;
        };
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let cache = Arc::clone(self);
        runtime.spawn(async move {
            match fetch().await {
                Ok(snapshot) => {
                    debug!("{label}: refreshed snapshot");
                    cache.stale.store(false, Ordering::Release);
                    cache.set(snapshot);
                }
                Err(e) => {
                    warn!("{label}: failed to refresh snapshot: {e}");
                    // Unblock cold-start waiters, the previous snapshot stays in use.
                    cache.loaded.send_replace(true);
                }
            }
            *cache.last_fetch.lock().expect("lock poisoned") = Some(Instant::now());
            cache.in_flight.store(false, Ordering::Release);
        });
    }

    /// Waits until the first fetch finished, up to `timeout`. Returns whether it did.
    pub async fn wait_until_loaded(&self, timeout: Duration) -> bool {
        let mut rx = self.loaded.subscribe();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|loaded| *loaded)).await;
        matches!(waited, Ok(Ok(_)))
    }
}

/// Owns the cached sampling configuration.
pub struct ConfigManager {
    service: Arc<dyn RemoteConfigService + Send + Sync>,
    cache: Arc<SnapshotCache<ConfigSnapshot>>,
}

impl ConfigManager {
    pub fn new(service: Arc<dyn RemoteConfigService + Send + Sync>) -> Self {
        Self::with_refresh_interval(service, DEFAULT_REFRESH_INTERVAL)
    }

    pub fn with_refresh_interval(
        service: Arc<dyn RemoteConfigService + Send + Sync>,
        refresh_interval: Duration,
    ) -> Self {
        ConfigManager {
            service,
            cache: Arc::new(SnapshotCache::new(
                ConfigSnapshot::default(),
                refresh_interval,
            )),
        }
    }

    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.cache.get()
    }

    pub fn try_refresh(&self) {
        let service = Arc::clone(&self.service);
        self.cache
            .try_refresh("config", move || async move { service.fetch_config().await });
    }

    /// Compares the e-tag echoed by the ingestion API with the cached one and schedules a
    /// refetch when they differ.
    pub fn try_update_hash(&self, etag: Option<&str>) {
        let Some(etag) = etag else {
            return;
        };
        if self.snapshot().etag.as_deref() != Some(etag) {
            debug!("config: e-tag changed to {etag}, refreshing");
            self.cache.mark_stale();
            self.try_refresh();
        }
    }
}

/// Owns the cached governance rules.
pub struct RulesManager {
    service: Arc<dyn RemoteConfigService + Send + Sync>,
    cache: Arc<SnapshotCache<RulesSnapshot>>,
}

impl RulesManager {
    pub fn new(service: Arc<dyn RemoteConfigService + Send + Sync>) -> Self {
        Self::with_refresh_interval(service, DEFAULT_REFRESH_INTERVAL)
    }

    pub fn with_refresh_interval(
        service: Arc<dyn RemoteConfigService + Send + Sync>,
        refresh_interval: Duration,
    ) -> Self {
        RulesManager {
            service,
            cache: Arc::new(SnapshotCache::new(
                RulesSnapshot::default(),
                refresh_interval,
            )),
        }
    }

    pub fn snapshot(&self) -> Arc<RulesSnapshot> {
        self.cache.get()
    }

    pub fn has_rules(&self) -> bool {
        !self.snapshot().is_empty()
    }

    pub fn try_refresh(&self) {
        let service = Arc::clone(&self.service);
        self.cache
            .try_refresh("governance", move || async move { service.fetch_rules().await });
    }

    /// Cold-start guard: waits for the first rules fetch to land, up to `timeout`.
    pub async fn wait_until_loaded(&self, timeout: Duration) -> bool {
        if self.cache.is_loaded() {
            return true;
        }
        self.try_refresh();
        self.cache.wait_until_loaded(timeout).await
    }
}
