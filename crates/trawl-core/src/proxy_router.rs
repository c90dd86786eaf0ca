//! Health-aware proxy selection.
//!
//! The router owns a pool of [`ProxyEndpoint`]s and a health record per
//! endpoint. Callers pick an endpoint before each fetch and report the
//! outcome back. Endpoints with too many consecutive failures are
//! blacklisted for a cooldown and come back on their own afterwards.
//!
//! ```text
//! HEALTHY --[N consecutive failures]--> BLACKLISTED --[cooldown elapsed]--> HEALTHY
//!    ^                                                                        |
//!    +------------------------[success resets the streak]---------------------+
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::join_all;
use serde::Serialize;

use crate::error::AppError;
use crate::proxy::{ProxyEndpoint, ProxySource};
use crate::traits::ProxyProbe;
use crate::util::{millis, random_below};

/// Configuration for proxy health tracking.
#[derive(Debug, Clone)]
pub struct ProxyRouterConfig {
    /// Consecutive failures before an endpoint is blacklisted. `0` behaves as `1`.
    pub failure_threshold: u32,
    pub blacklist_duration: Duration,
    /// Deadline for a single probe in `test_all`.
    pub probe_timeout: Duration,
}

impl Default for ProxyRouterConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            blacklist_duration: Duration::from_secs(10 * 60),
            probe_timeout: Duration::from_secs(10),
        }
    }
}

impl ProxyRouterConfig {
    /// Set the consecutive-failure threshold. `0` is raised to `1`: the first failure blacklists.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_blacklist_duration(mut self, duration: Duration) -> Self {
        self.blacklist_duration = duration;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }
}

/// Health counters for one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyHealth {
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub blacklisted_until: Option<DateTime<Utc>>,
    pub total_latency_ms: u64,
    pub request_count: u64,
}

impl ProxyHealth {
    pub fn is_healthy_at(&self, now: DateTime<Utc>) -> bool {
        self.blacklisted_until.is_none_or(|until| until <= now)
    }

    pub fn avg_response_time_ms(&self) -> u64 {
        self.total_latency_ms
            .checked_div(self.request_count)
            .unwrap_or(0)
    }
}

/// Per-endpoint summary for monitoring.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyStats {
    /// Redacted endpoint URL.
    pub url: String,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub avg_response_time_ms: u64,
    pub blacklisted: bool,
    pub blacklisted_until: Option<DateTime<Utc>>,
}

/// Result of loading a [`ProxySource`].
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub added: usize,
    pub duplicates: usize,
    pub rejected: Vec<RejectedProxy>,
}

/// An entry that could not be normalised.
#[derive(Debug, Clone)]
pub struct RejectedProxy {
    pub input: String,
    pub reason: String,
}

/// Outcome of probing one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ProbeStatus {
    Ok { latency_ms: u64 },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeOutcome {
    pub url: String,
    #[serde(flatten)]
    pub status: ProbeStatus,
}

impl ProbeOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self.status, ProbeStatus::Ok { .. })
    }
}

#[derive(Debug, Default)]
struct RouterInner {
    pool: Vec<ProxyEndpoint>,
    health: HashMap<String, ProxyHealth>,
    cursor: usize,
}

impl RouterInner {
    fn healthy(&self, now: DateTime<Utc>) -> Vec<ProxyEndpoint> {
        self.pool
            .iter()
            .filter(|ep| {
                self.health
                    .get(ep.url())
                    .is_none_or(|h| h.is_healthy_at(now))
            })
            .cloned()
            .collect()
    }
}

/// Thread-safe proxy pool with health-based selection. Clones share state.
#[derive(Clone)]
pub struct ProxyRouter {
    config: ProxyRouterConfig,
    inner: Arc<Mutex<RouterInner>>,
}

impl Default for ProxyRouter {
    fn default() -> Self {
        Self::new(ProxyRouterConfig::default())
    }
}

impl ProxyRouter {
    pub fn new(config: ProxyRouterConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(RouterInner::default())),
        }
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, RouterInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned proxy router mutex");
            poisoned.into_inner()
        })
    }

    /// Add endpoints from `source`. Known URLs are skipped; bad entries are
    /// reported in the returned [`LoadReport`], never guessed at.
    pub fn load_from(&self, source: &ProxySource) -> Result<LoadReport, AppError> {
        let mut report = LoadReport::default();
        let parsed: Vec<ProxyEndpoint> = match source {
            ProxySource::Endpoints(endpoints) => endpoints.clone(),
            other => other
                .entries()?
                .into_iter()
                .filter_map(|entry| match ProxyEndpoint::parse(&entry) {
                    Ok(ep) => Some(ep),
                    Err(e) => {
                        tracing::warn!(input = %entry, error = %e, "Skipping invalid proxy");
                        report.rejected.push(RejectedProxy {
                            input: entry,
                            reason: e.to_string(),
                        });
                        None
                    }
                })
                .collect(),
        };

        let mut inner = self.lock_inner();
        for endpoint in parsed {
            if inner.health.contains_key(endpoint.url()) {
                report.duplicates += 1;
                continue;
            }
            inner
                .health
                .insert(endpoint.url().to_string(), ProxyHealth::default());
            inner.pool.push(endpoint);
            report.added += 1;
        }

        tracing::info!(
            added = report.added,
            duplicates = report.duplicates,
            rejected = report.rejected.len(),
            pool = inner.pool.len(),
            "Loaded proxies"
        );
        Ok(report)
    }

    pub fn len(&self) -> usize {
        self.lock_inner().pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All endpoints, healthy or not, in load order.
    pub fn endpoints(&self) -> Vec<ProxyEndpoint> {
        self.lock_inner().pool.clone()
    }

    /// Endpoints that are not currently blacklisted.
    pub fn get_healthy(&self) -> Vec<ProxyEndpoint> {
        self.lock_inner().healthy(Utc::now())
    }

    /// Round-robin over healthy endpoints. `None` when none are healthy.
    pub fn get_next(&self) -> Option<ProxyEndpoint> {
        let mut inner = self.lock_inner();
        let healthy = inner.healthy(Utc::now());
        if healthy.is_empty() {
            return None;
        }
        let endpoint = healthy[inner.cursor % healthy.len()].clone();
        inner.cursor = inner.cursor.wrapping_add(1);
        Some(endpoint)
    }

    /// Uniform random choice over healthy endpoints. `None` when none are healthy.
    pub fn get_random(&self) -> Option<ProxyEndpoint> {
        let healthy = self.get_healthy();
        if healthy.is_empty() {
            return None;
        }
        let idx = random_below(healthy.len() as u64) as usize;
        healthy.into_iter().nth(idx)
    }

    /// Like [`get_next`](Self::get_next) but raises `ProxyUnavailable` on an empty healthy set.
    pub fn require_next(&self) -> Result<ProxyEndpoint, AppError> {
        self.get_next().ok_or(AppError::ProxyUnavailable)
    }

    pub fn mark_success(&self, endpoint: &ProxyEndpoint, latency: Duration) {
        let mut inner = self.lock_inner();
        let Some(health) = inner.health.get_mut(endpoint.url()) else {
            tracing::debug!(proxy = %endpoint, "Success reported for unknown proxy");
            return;
        };
        health.success_count += 1;
        health.request_count += 1;
        health.total_latency_ms = health.total_latency_ms.saturating_add(millis(latency));
        health.consecutive_failures = 0;
    }

    pub fn mark_failed(&self, endpoint: &ProxyEndpoint) {
        let mut inner = self.lock_inner();
        let Some(health) = inner.health.get_mut(endpoint.url()) else {
            tracing::debug!(proxy = %endpoint, "Failure reported for unknown proxy");
            return;
        };
        health.failure_count += 1;
        health.consecutive_failures += 1;

        if health.consecutive_failures >= self.config.failure_threshold.max(1) {
            let cooldown = TimeDelta::from_std(self.config.blacklist_duration)
                .unwrap_or(TimeDelta::minutes(10));
            let until = Utc::now() + cooldown;
            health.blacklisted_until = Some(until);
            tracing::warn!(
                proxy = %endpoint,
                consecutive_failures = health.consecutive_failures,
                %until,
                "Proxy blacklisted"
            );
        }
    }

    /// Health record for one endpoint, if it is in the pool.
    pub fn health(&self, endpoint: &ProxyEndpoint) -> Option<ProxyHealth> {
        self.lock_inner().health.get(endpoint.url()).cloned()
    }

    pub fn get_stats(&self) -> Vec<ProxyStats> {
        let now = Utc::now();
        let inner = self.lock_inner();
        inner
            .pool
            .iter()
            .map(|ep| {
                let health = inner.health.get(ep.url()).cloned().unwrap_or_default();
                ProxyStats {
                    url: ep.redacted(),
                    successes: health.success_count,
                    failures: health.failure_count,
                    consecutive_failures: health.consecutive_failures,
                    avg_response_time_ms: health.avg_response_time_ms(),
                    blacklisted: !health.is_healthy_at(now),
                    blacklisted_until: health.blacklisted_until.filter(|until| *until > now),
                }
            })
            .collect()
    }

    /// Zero every health record. Blacklists are lifted immediately.
    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        tracing::info!(pool = inner.pool.len(), "Proxy health manually reset");
        for health in inner.health.values_mut() {
            *health = ProxyHealth::default();
        }
        inner.cursor = 0;
    }

    /// Probe every endpoint concurrently with a per-probe deadline.
    ///
    /// Each outcome is recorded independently as soon as its probe settles;
    /// a slow or failing probe never cancels the others.
    pub async fn test_all<P: ProxyProbe>(&self, probe: &P) -> Vec<ProbeOutcome> {
        let timeout = self.config.probe_timeout;
        let probes = self.endpoints().into_iter().map(|endpoint| async move {
            let started = tokio::time::Instant::now();
            let result = match tokio::time::timeout(timeout, probe.probe(&endpoint)).await {
                Ok(Ok(())) => Ok(started.elapsed()),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(AppError::Timeout(millis(timeout))),
            };

            let status = match result {
                Ok(latency) => {
                    self.mark_success(&endpoint, latency);
                    ProbeStatus::Ok {
                        latency_ms: millis(latency),
                    }
                }
                Err(e) => {
                    tracing::debug!(proxy = %endpoint, error = %e, "Proxy probe failed");
                    self.mark_failed(&endpoint);
                    ProbeStatus::Failed {
                        error: e.to_string(),
                    }
                }
            };
            ProbeOutcome {
                url: endpoint.redacted(),
                status,
            }
        });

        let outcomes = join_all(probes).await;
        let ok = outcomes.iter().filter(|o| o.is_ok()).count();
        tracing::info!(
            ok,
            failed = outcomes.len() - ok,
            "Proxy probe round finished"
        );
        outcomes
    }
}
