//! Cache warmer.
//!
//! Periodically replays the configured read endpoints over HTTP so the
//! response cache is populated before real callers arrive. Requests go through
//! the service's public base URL with a bearer token, so they take the same
//! path (auth, middleware, handler) as client traffic.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::{StreamExt, stream};
use metrics::histogram;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

const SOURCE: &str = "shelfcache::cache_warmer";

#[derive(Debug, Error)]
pub enum CacheWarmError {
    #[error("failed to build warm-up HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("invalid warm-up target `{path}`: {source}")]
    Target {
        path: String,
        #[source]
        source: url::ParseError,
    },
    #[error("warm-up request to `{url}` failed: {source}")]
    Request {
        url: Url,
        #[source]
        source: reqwest::Error,
    },
    #[error("warm-up request to `{url}` returned {status}")]
    Status { url: Url, status: reqwest::StatusCode },
}

/// One endpoint to keep warm, optionally expanded by query-parameter variants.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct WarmEndpoint {
    pub path: String,
    #[serde(default)]
    pub variants: Vec<BTreeMap<String, String>>,
}

impl WarmEndpoint {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            variants: Vec::new(),
        }
    }

    pub fn with_variant<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.variants.push(
            params
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        );
        self
    }
}

#[derive(Debug, Clone)]
pub struct WarmerConfig {
    pub enabled: bool,
    pub base_url: Url,
    pub token: Option<String>,
    pub initial_delay: Duration,
    pub interval: Duration,
    pub request_timeout: Duration,
    pub concurrency: usize,
    pub endpoints: Vec<WarmEndpoint>,
}

impl WarmerConfig {
    pub fn from_settings(
        settings: &crate::config::WarmerSettings,
        base_url: &Url,
        cache_enabled: bool,
    ) -> Self {
        Self {
            enabled: settings.enabled && cache_enabled,
            base_url: base_url.clone(),
            token: settings.token.clone(),
            initial_delay: Duration::from_secs(settings.initial_delay_seconds),
            interval: Duration::from_secs(settings.interval_seconds.get().into()),
            request_timeout: Duration::from_millis(settings.request_timeout_ms),
            concurrency: settings.concurrency.get(),
            endpoints: settings.endpoints.clone(),
        }
    }
}

/// Result of one warm cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WarmReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Targets that could not be turned into a URL.
    pub skipped: usize,
    pub elapsed_ms: u64,
}

pub struct CacheWarmer {
    config: WarmerConfig,
    client: reqwest::Client,
    running: AtomicBool,
}

/// Clears the running flag when a cycle ends, including by panic or cancellation.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl CacheWarmer {
    pub fn new(config: WarmerConfig) -> Result<Self, CacheWarmError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("shelfcache-warmer/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(CacheWarmError::Client)?;
        Ok(Self {
            config,
            client,
            running: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &WarmerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Expand every endpoint into its bare URL plus one URL per variant.
    pub fn targets(&self) -> (Vec<Url>, Vec<CacheWarmError>) {
        let mut urls = Vec::new();
        let mut invalid = Vec::new();
        for endpoint in &self.config.endpoints {
            let base = match self.config.base_url.join(&endpoint.path) {
                Ok(url) => url,
                Err(source) => {
                    invalid.push(CacheWarmError::Target {
                        path: endpoint.path.clone(),
                        source,
                    });
                    continue;
                }
            };
            urls.push(base.clone());
            for variant in &endpoint.variants {
                let mut url = base.clone();
                url.query_pairs_mut().extend_pairs(variant.iter());
                urls.push(url);
            }
        }
        (urls, invalid)
    }

    /// Run one cycle. Returns `None` when disabled or a cycle is already running.
    pub async fn warm_cycle(&self) -> Option<WarmReport> {
        if !self.config.enabled {
            return None;
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(target = SOURCE, "warm cycle already in progress; skipping trigger");
            return None;
        }
        let _guard = CycleGuard(&self.running);

        let started = Instant::now();
        let (urls, invalid) = self.targets();
        for err in &invalid {
            warn!(target = SOURCE, error = %err, "skipping warm-up target");
        }

        let outcomes: Vec<Result<(), CacheWarmError>> = stream::iter(urls)
            .map(|url| self.warm_one(url))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut report = WarmReport {
            attempted: outcomes.len(),
            skipped: invalid.len(),
            ..WarmReport::default()
        };
        for outcome in outcomes {
            match outcome {
                Ok(()) => report.succeeded += 1,
                Err(err) => {
                    warn!(target = SOURCE, error = %err, "warm-up request failed");
                    report.failed += 1;
                }
            }
        }
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        histogram!("shelfcache_warm_cycle_ms").record(report.elapsed_ms as f64);
        info!(
            target = SOURCE,
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            elapsed_ms = report.elapsed_ms,
            "warm cycle finished"
        );
        Some(report)
    }

    async fn warm_one(&self, url: Url) -> Result<(), CacheWarmError> {
        let mut request = self
            .client
            .get(url.clone())
            .timeout(self.config.request_timeout);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }
        let response = match request.send().await {
            Ok(response) => response,
            Err(source) => return Err(CacheWarmError::Request { url, source }),
        };
        let status = response.status();
        if !status.is_success() {
            return Err(CacheWarmError::Status { url, status });
        }
        // Drain so the connection can be reused.
        if let Err(source) = response.bytes().await {
            return Err(CacheWarmError::Request { url, source });
        }
        debug!(target = SOURCE, %url, %status, "warmed");
        Ok(())
    }

    /// Spawn the schedule: wait `initial_delay`, then one cycle per `interval`.
    pub fn spawn(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if !self.config.enabled {
            info!(target = SOURCE, "cache warmer disabled");
            return None;
        }
        let warmer = Arc::clone(self);
        Some(tokio::spawn(async move {
            tokio::time::sleep(warmer.config.initial_delay).await;
            let mut ticker = tokio::time::interval(warmer.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                warmer.warm_cycle().await;
            }
        }))
    }
}
