//! Explicit service wiring.
//!
//! [`ServiceContext`] owns every long-lived component. It is built once in
//! `main` (or a test) and handed to routes and background tasks; nothing is
//! reachable through globals.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::{
    CacheConfig, CacheState, CacheStore, CacheWarmer, InvalidationReport, Pool, PoolConfig,
    WarmerConfig, manager_for_url,
};
use crate::config::Settings;
use crate::events::{DomainEvent, EventBus, SubscriptionId};
use crate::infra::auth::{StaticTokenVerifier, TokenVerifier};
use crate::infra::error::InfraError;
use crate::infra::http::{self, OpsState};
use crate::realtime::{RealtimeConfig, RealtimeHub};
use crate::util::lock::mutex_lock;

const SOURCE: &str = "shelfcache::context";
const DEFAULT_HEALTH_PROBE: Duration = Duration::from_secs(10);

pub struct ServiceContext {
    pub store: Arc<CacheStore>,
    pub bus: Arc<EventBus>,
    pub hub: Arc<RealtimeHub>,
    pub warmer: Option<Arc<CacheWarmer>>,
    pub verifier: Arc<dyn TokenVerifier>,
    health_probe: Duration,
    hub_subscription: SubscriptionId,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceContext {
    /// Build every component from resolved settings.
    ///
    /// An unreachable backing store does not fail startup; the pool starts
    /// unhealthy and the cache stays bypassed until the health probe succeeds.
    pub async fn build(settings: &Settings) -> Result<Self, InfraError> {
        let cache_config = CacheConfig::from(&settings.cache);
        let manager = manager_for_url(&settings.store.url, cache_config.max_keys())?;
        let pool = Pool::new(manager, PoolConfig::from(&settings.store));
        let opened = pool.warm_up().await;
        if opened == 0 && settings.store.min_connections > 0 {
            warn!(
                target = SOURCE,
                error = pool.last_error().as_deref().unwrap_or("unknown"),
                "backing store unreachable at startup; serving uncached"
            );
        }
        let store = Arc::new(CacheStore::new(cache_config, pool));

        let verifier: Arc<dyn TokenVerifier> =
            Arc::new(StaticTokenVerifier::from_settings(&settings.auth));
        let hub = Arc::new(RealtimeHub::new(
            RealtimeConfig::from(&settings.realtime),
            Arc::clone(&verifier),
        ));

        let warmer = CacheWarmer::new(WarmerConfig::from_settings(
            &settings.warmer,
            &settings.server.public_base_url,
            settings.cache.enabled,
        ))?;

        let mut context = Self::from_parts(store, hub, Some(Arc::new(warmer)), verifier);
        context.health_probe = Duration::from_secs(settings.store.health_probe_seconds.get().into());
        info!(
            target = SOURCE,
            store = %redact_url(&settings.store.url),
            cache_enabled = settings.cache.enabled,
            realtime_path = %settings.realtime.path,
            "service context ready"
        );
        Ok(context)
    }

    /// Wire pre-built components; the hub is subscribed to a fresh bus.
    pub fn from_parts(
        store: Arc<CacheStore>,
        hub: Arc<RealtimeHub>,
        warmer: Option<Arc<CacheWarmer>>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        let bus = Arc::new(EventBus::new());
        let hub_subscription = hub.attach(&bus);
        Self {
            store,
            bus,
            hub,
            warmer,
            verifier,
            health_probe: DEFAULT_HEALTH_PROBE,
            hub_subscription,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn cache_state(&self) -> CacheState {
        CacheState::new(Arc::clone(&self.store))
    }

    pub fn ops_state(&self) -> OpsState {
        OpsState {
            store: Arc::clone(&self.store),
            hub: Arc::clone(&self.hub),
            warmer: self.warmer.clone(),
        }
    }

    /// Full service router: `app` plus health, ops and the real-time channel.
    pub fn router(&self, app: Router) -> Router {
        http::build_router(app, self.ops_state(), Arc::clone(&self.verifier))
    }

    /// Write-path hook: drop cached reads for `tags`, then notify subscribers.
    ///
    /// Invalidation runs first so a client reacting to the event refetches
    /// fresh data.
    pub async fn publish_change<T: AsRef<str>>(
        &self,
        event: &DomainEvent,
        tags: &[T],
    ) -> InvalidationReport {
        let report = if tags.is_empty() {
            InvalidationReport::default()
        } else {
            self.store.invalidate(tags).await
        };
        self.bus.publish(event);
        report
    }

    /// Start the pool health probe, the heartbeat and the warmer schedule.
    pub fn spawn_background(&self) {
        let mut tasks = mutex_lock(&self.tasks, SOURCE, "spawn_background");
        tasks.push(self.store.pool().spawn_health_probe(self.health_probe));
        tasks.push(self.hub.spawn_heartbeat());
        if let Some(handle) = self.warmer.as_ref().and_then(|warmer| warmer.spawn()) {
            tasks.push(handle);
        }
        info!(target = SOURCE, tasks = tasks.len(), "background tasks started");
    }

    /// Close real-time clients, stop background tasks, then drain the pool.
    pub async fn shutdown(&self, grace: Duration) {
        self.bus.unsubscribe(self.hub_subscription);
        let closed = self.hub.close_all("server shutting down");

        let tasks: Vec<JoinHandle<()>> =
            mutex_lock(&self.tasks, SOURCE, "shutdown").drain(..).collect();
        for task in &tasks {
            task.abort();
        }

        let drained = self.store.pool().close(grace).await;
        info!(
            target = SOURCE,
            realtime_closed = closed,
            tasks = tasks.len(),
            pool_drained = drained,
            "service context shut down"
        );
    }
}

/// Strip credentials from a store URL before logging it.
fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("***"));
            }
            url.to_string()
        }
        Err(_) => "<invalid>".to_string(),
    }
}
