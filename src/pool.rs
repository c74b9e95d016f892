//! Egress endpoint (proxy) pool with health tracking.
//!
//! The pool hands out a uniformly random active endpoint per fetch attempt
//! and learns from the outcome:
//!
//! - [`ResourcePool::report_success`] clears the consecutive-failure count and
//!   folds the latency into a cumulative running average.
//! - [`ResourcePool::report_failure`] bumps the count; reaching `max_fails`
//!   deactivates the endpoint and resets the count in one step.
//!
//! Deactivated endpoints are never dropped. A background health checker
//! probes every endpoint whose last check is older than the interval and
//! reactivates the ones that answer. Only explicit [`ResourcePool::remove`]
//! deletes an endpoint.
//!
//! All state sits behind one mutex that is held only while mutating, never
//! across a probe.

use crate::config::PoolConfig;
use crate::errors::{PipelineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use rand::seq::IndexedRandom;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Health and usage figures for one egress route.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Endpoint {
    pub address: String,
    pub active: bool,
    pub consecutive_failures: u32,
    pub successes: u64,
    pub failures: u64,
    /// Cumulative mean latency over all successes.
    pub avg_latency: Duration,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

impl Endpoint {
    fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            active: true,
            consecutive_failures: 0,
            successes: 0,
            failures: 0,
            avg_latency: Duration::ZERO,
            last_checked: None,
            last_success: None,
            last_failure: None,
        }
    }
}

/// Point-in-time copy of the pool, for logging and status output.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub endpoints: Vec<Endpoint>,
}

/// Lightweight reachability check used by the health checker.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Returns the round-trip latency when the endpoint is reachable.
    async fn probe(&self, address: &str) -> Result<Duration>;
}

/// Probes an endpoint by fetching a known URL through it as an HTTP proxy.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    url: String,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(url: &str, timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, address: &str) -> Result<Duration> {
        let proxy = reqwest::Proxy::all(address).map_err(|e| PipelineError::Fetch(e.to_string()))?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.timeout)
            .build()
            .map_err(|e| PipelineError::Fetch(e.to_string()))?;

        let t0 = Instant::now();
        let resp = client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| PipelineError::Fetch(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(PipelineError::Fetch(format!("probe returned {}", resp.status())));
        }
        Ok(t0.elapsed())
    }
}

#[derive(Debug, Default)]
struct PoolState {
    endpoints: BTreeMap<String, Endpoint>,
}

pub struct ResourcePool {
    state: Mutex<PoolState>,
    max_fails: u32,
    check_interval: Duration,
    probe: Arc<dyn Probe>,
}

impl std::fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePool")
            .field("max_fails", &self.max_fails)
            .field("check_interval", &self.check_interval)
            .finish()
    }
}

impl ResourcePool {
    pub fn new<I, S>(addresses: I, max_fails: u32, check_interval: Duration, probe: Arc<dyn Probe>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let endpoints = addresses
            .into_iter()
            .map(|a| (a.as_ref().to_string(), Endpoint::new(a.as_ref())))
            .collect::<BTreeMap<_, _>>();
        info!(count = endpoints.len(), max_fails, "Started resource pool");
        Self {
            state: Mutex::new(PoolState { endpoints }),
            max_fails: max_fails.max(1),
            check_interval,
            probe,
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        let probe = HttpProbe::new(&config.probe_url, Duration::from_secs(config.probe_timeout_secs));
        Self::new(
            &config.endpoints,
            config.max_fails,
            Duration::from_secs(config.check_interval_secs),
            Arc::new(probe),
        )
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// A uniformly random active endpoint, or `None` when no egress path is
    /// available.
    pub fn acquire(&self) -> Option<String> {
        let state = self.lock();
        let active: Vec<&String> = state
            .endpoints
            .values()
            .filter(|e| e.active)
            .map(|e| &e.address)
            .collect();
        active.choose(&mut rand::rng()).map(|a| (*a).clone())
    }

    pub fn report_success(&self, address: &str, latency: Duration) {
        let mut state = self.lock();
        if let Some(ep) = state.endpoints.get_mut(address) {
            record_success(ep, latency);
        }
    }

    /// Record a failed use. Returns `true` when this call deactivated the
    /// endpoint.
    pub fn report_failure(&self, address: &str, error: &str) -> bool {
        let mut state = self.lock();
        match state.endpoints.get_mut(address) {
            Some(ep) => record_failure(ep, self.max_fails, error),
            None => false,
        }
    }

    /// Register a new endpoint; it starts active with clean counters.
    pub fn add(&self, address: &str) -> bool {
        let mut state = self.lock();
        if state.endpoints.contains_key(address) {
            return false;
        }
        state.endpoints.insert(address.to_string(), Endpoint::new(address));
        info!(%address, "Added endpoint");
        true
    }

    pub fn remove(&self, address: &str) -> bool {
        let removed = self.lock().endpoints.remove(address).is_some();
        if removed {
            info!(%address, "Removed endpoint");
        }
        removed
    }

    pub fn is_empty(&self) -> bool {
        self.lock().endpoints.is_empty()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            total: state.endpoints.len(),
            active: state.endpoints.values().filter(|e| e.active).count(),
            endpoints: state.endpoints.values().cloned().collect(),
        }
    }

    /// Probe every endpoint not checked within the interval.
    ///
    /// Returns the number of endpoints probed.
    #[instrument(level = "debug", skip_all)]
    pub async fn check_due(&self) -> usize {
        let now = Utc::now();
        let interval = chrono::Duration::from_std(self.check_interval).unwrap_or(chrono::Duration::MAX);
        let due: Vec<String> = {
            let state = self.lock();
            state
                .endpoints
                .values()
                .filter(|e| e.last_checked.is_none_or(|t| now - t >= interval))
                .map(|e| e.address.clone())
                .collect()
        };
        if due.is_empty() {
            return 0;
        }

        let outcomes = join_all(due.iter().map(|a| self.probe.probe(a))).await;

        let mut state = self.lock();
        for (address, outcome) in due.iter().zip(outcomes) {
            let Some(ep) = state.endpoints.get_mut(address) else {
                // removed while the probe was in flight
                continue;
            };
            ep.last_checked = Some(Utc::now());
            match outcome {
                Ok(latency) => {
                    if !ep.active {
                        info!(%address, "Endpoint reactivated by health check");
                    }
                    ep.active = true;
                    record_success(ep, latency);
                }
                Err(e) => {
                    warn!(%address, error = %e, "Health check failed");
                    record_failure(ep, self.max_fails, &e.to_string());
                }
            }
        }
        due.len()
    }

    /// Run [`check_due`](Self::check_due) every interval until `cancel` fires.
    pub fn spawn_health_checker(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.check_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Stopped endpoint health checker");
                        break;
                    }
                    _ = ticker.tick() => {
                        let checked = self.check_due().await;
                        let stats = self.stats();
                        debug!(checked, active = stats.active, total = stats.total, "Health check pass");
                        if stats.total > 0 && stats.active == 0 {
                            error!("No active egress endpoints remain");
                        }
                    }
                }
            }
        })
    }
}

fn record_success(ep: &mut Endpoint, latency: Duration) {
    ep.successes += 1;
    let n = u128::from(ep.successes);
    let nanos = (ep.avg_latency.as_nanos() * (n - 1) + latency.as_nanos()) / n;
    ep.avg_latency = Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX));
    ep.consecutive_failures = 0;
    ep.last_success = Some(Utc::now());
}

fn record_failure(ep: &mut Endpoint, max_fails: u32, error: &str) -> bool {
    ep.failures += 1;
    ep.consecutive_failures += 1;
    ep.last_failure = Some(Utc::now());
    if ep.active && ep.consecutive_failures >= max_fails {
        ep.active = false;
        ep.consecutive_failures = 0;
        warn!(address = %ep.address, max_fails, %error, "Deactivated endpoint");
        return true;
    }
    false
}
