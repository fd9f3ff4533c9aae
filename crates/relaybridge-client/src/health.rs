//! Health registry: named async checks evaluated on a periodic tick.
//!
//! Each check gets its own deadline; results feed the `/health` exposition
//! and the health metrics. Aggregation: any critical check Unhealthy makes
//! the whole registry Unhealthy; anything less than Healthy (including
//! Unknown) degrades it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metrics;
use crate::tunnel::TunnelManager;

/// Result of one check evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Check passed
    Healthy,
    /// Check passed with reservations
    Degraded,
    /// Check failed
    Unhealthy,
    /// Check has not produced a verdict
    Unknown,
}

/// What a check function reports
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    /// Verdict
    pub status: HealthStatus,
    /// Optional detail for the exposition payload
    pub detail: Option<String>,
}

impl CheckOutcome {
    /// Healthy with no detail
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            detail: None,
        }
    }

    /// Unhealthy with a reason
    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            detail: Some(detail.into()),
        }
    }

    /// Unknown with a reason
    pub fn unknown(detail: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unknown,
            detail: Some(detail.into()),
        }
    }
}

/// Stored result of the latest evaluation
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    /// Verdict
    pub status: HealthStatus,
    /// Wall-clock time of the evaluation
    pub checked_at: SystemTime,
    /// How long the check took
    pub duration: Duration,
    /// Error or detail text
    pub error: Option<String>,
}

type CheckFn = Arc<dyn Fn() -> BoxFuture<'static, CheckOutcome> + Send + Sync>;

struct Check {
    name: &'static str,
    description: &'static str,
    critical: bool,
    run: CheckFn,
}

/// One check's entry in the aggregate report
#[derive(Debug, Clone, Serialize)]
pub struct CheckEntry {
    /// What the check watches
    pub description: String,
    /// Latest verdict, Unknown before the first evaluation
    pub status: HealthStatus,
    /// Latest evaluation, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_result: Option<CheckResult>,
}

/// Aggregate report served at `/health`
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Aggregate status over all checks
    pub status: HealthStatus,
    /// Per-check results by name
    pub checks: HashMap<String, CheckEntry>,
}

/// Collection of named health checks with periodic evaluation
#[derive(Clone)]
pub struct HealthRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    checks: RwLock<Vec<Check>>,
    results: RwLock<HashMap<&'static str, CheckResult>>,
    interval: Duration,
    check_timeout: Duration,
}

impl HealthRegistry {
    /// Create a registry ticking at `interval` with a per-check deadline
    pub fn new(interval: Duration, check_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                checks: RwLock::new(Vec::new()),
                results: RwLock::new(HashMap::new()),
                interval,
                check_timeout,
            }),
        }
    }

    /// Register a named check. `critical` checks can make the aggregate
    /// Unhealthy; the rest only degrade it.
    pub fn register<F, Fut>(
        &self,
        name: &'static str,
        description: &'static str,
        critical: bool,
        check: F,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = CheckOutcome> + Send + 'static,
    {
        debug!(name, description, critical, "registering health check");
        self.inner.checks.write().push(Check {
            name,
            description,
            critical,
            run: Arc::new(move || check().boxed()),
        });
    }

    /// Evaluate every registered check once, concurrently
    pub async fn run_once(&self) {
        let checks: Vec<(&'static str, bool, CheckFn)> = {
            let checks = self.inner.checks.read();
            checks
                .iter()
                .map(|c| (c.name, c.critical, Arc::clone(&c.run)))
                .collect()
        };

        let timeout = self.inner.check_timeout;
        let evaluations = checks.into_iter().map(|(name, _, run)| async move {
            let started = std::time::Instant::now();
            let outcome = match tokio::time::timeout(timeout, run()).await {
                Ok(outcome) => outcome,
                Err(_) => CheckOutcome::unhealthy("check deadline exceeded"),
            };
            let duration = started.elapsed();
            (name, outcome, duration)
        });

        for (name, outcome, duration) in futures::future::join_all(evaluations).await {
            if outcome.status == HealthStatus::Unhealthy {
                warn!(check = name, detail = ?outcome.detail, "health check unhealthy");
            }
            metrics::record_health_check(name, outcome.status == HealthStatus::Healthy, duration);
            self.inner.results.write().insert(
                name,
                CheckResult {
                    status: outcome.status,
                    checked_at: SystemTime::now(),
                    duration,
                    error: outcome.detail,
                },
            );
        }
    }

    /// Run the periodic tick until cancelled
    pub fn spawn(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(registry.inner.interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = tick.tick() => registry.run_once().await,
                }
            }
        })
    }

    /// Aggregate status over the latest results
    pub fn aggregate(&self) -> HealthStatus {
        let checks = self.inner.checks.read();
        let results = self.inner.results.read();

        let mut aggregate = HealthStatus::Healthy;
        for check in checks.iter() {
            let status = results
                .get(check.name)
                .map_or(HealthStatus::Unknown, |r| r.status);
            match status {
                HealthStatus::Unhealthy if check.critical => return HealthStatus::Unhealthy,
                // Unknown counts as degraded for aggregation
                HealthStatus::Unhealthy | HealthStatus::Degraded | HealthStatus::Unknown => {
                    aggregate = HealthStatus::Degraded;
                }
                HealthStatus::Healthy => {}
            }
        }
        aggregate
    }

    /// Full report for the exposition endpoint
    pub fn report(&self) -> HealthReport {
        let status = self.aggregate();
        let checks = self.inner.checks.read();
        let results = self.inner.results.read();
        HealthReport {
            status,
            checks: checks
                .iter()
                .map(|check| {
                    let last_result = results.get(check.name).cloned();
                    (
                        check.name.to_string(),
                        CheckEntry {
                            description: check.description.to_string(),
                            status: last_result
                                .as_ref()
                                .map_or(HealthStatus::Unknown, |r| r.status),
                            last_result,
                        },
                    )
                })
                .collect(),
        }
    }
}

impl std::fmt::Debug for HealthRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthRegistry")
            .field("checks", &self.inner.checks.read().len())
            .finish_non_exhaustive()
    }
}

/// Register the built-in checks every client carries.
///
/// `relay_connection` is the only critical one: without a session the
/// client is not doing its job, while a missing tunnel or a metrics blip
/// only degrade it.
pub fn register_builtin_checks(
    registry: &HealthRegistry,
    established: watch::Receiver<bool>,
    tunnels: TunnelManager,
    metrics_port: Option<u16>,
) {
    registry.register(
        "relay_connection",
        "control session to the relay is established",
        true,
        move || {
            let established = established.clone();
            async move {
                if *established.borrow() {
                    CheckOutcome::healthy()
                } else {
                    CheckOutcome::unhealthy("no established session")
                }
            }
        },
    );

    registry.register(
        "tunnel_status",
        "at least one declared tunnel is active",
        false,
        move || {
            let tunnels = tunnels.clone();
            async move {
                if tunnels.is_empty() {
                    CheckOutcome::unknown("no tunnels configured")
                } else if tunnels.active_count() > 0 {
                    CheckOutcome::healthy()
                } else {
                    CheckOutcome::unhealthy("all tunnels inactive")
                }
            }
        },
    );

    registry.register(
        "metrics_endpoint",
        "metrics exposition answers scrapes",
        false,
        move || async move {
            let Some(port) = metrics_port else {
                return CheckOutcome::unknown("metrics exposition disabled");
            };
            let url = format!("http://127.0.0.1:{port}/live");
            match reqwest::get(&url).await {
                Ok(response) if response.status().is_success() => CheckOutcome::healthy(),
                Ok(response) => {
                    CheckOutcome::unhealthy(format!("exposition returned {}", response.status()))
                }
                Err(e) => CheckOutcome::unhealthy(format!("exposition unreachable: {e}")),
            }
        },
    );
}
