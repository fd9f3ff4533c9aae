//! Protocol selector: per-transport outcome bookkeeping and the policy that
//! decides which transport a connection attempt uses and when a live
//! session should migrate.
//!
//! The selector owns statistics only; transport instances are owned by
//! whoever dialled them. Its lock is never held across I/O; callers get
//! snapshots.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use metrics::counter;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::core::TransportKind;

/// Ordered preference over transports plus the migration rules
#[derive(Debug, Clone)]
pub struct TransportPolicy {
    /// Preference order; each kind appears at most once
    pub order: Vec<TransportKind>,
    /// Failure rate above which a transport is marked unavailable, in [0,1]
    pub failure_rate_threshold: f64,
    /// Minimum observations before the failure rate is trusted
    pub min_observations: u32,
    /// Cooldown between switches, and before rehabilitating a failed transport
    pub switch_cooldown: Duration,
    /// Whether live sessions may migrate automatically
    pub auto_switch: bool,
}

impl Default for TransportPolicy {
    fn default() -> Self {
        Self {
            order: TransportKind::ALL.to_vec(),
            failure_rate_threshold: 0.8,
            min_observations: 5,
            switch_cooldown: Duration::from_secs(30),
            auto_switch: true,
        }
    }
}

impl TransportPolicy {
    /// Check the policy invariants: no duplicate kinds, threshold in [0,1]
    pub fn validate(&self) -> Result<(), String> {
        if self.order.is_empty() {
            return Err("transport policy order is empty".to_string());
        }
        let mut seen = Vec::with_capacity(self.order.len());
        for kind in &self.order {
            if seen.contains(kind) {
                return Err(format!("transport {kind} appears twice in the policy order"));
            }
            seen.push(*kind);
        }
        if !(0.0..=1.0).contains(&self.failure_rate_threshold) {
            return Err(format!(
                "failure rate threshold {} is outside [0, 1]",
                self.failure_rate_threshold
            ));
        }
        Ok(())
    }

    fn head(&self) -> TransportKind {
        self.order[0]
    }
}

/// Outcome bookkeeping for one transport
#[derive(Debug, Clone)]
pub struct TransportStats {
    /// Successful connections
    pub successes: u64,
    /// Failed operations
    pub failures: u64,
    /// Sum of observed latencies
    pub total_latency: Duration,
    /// When the transport last failed
    pub last_failure_at: Option<Instant>,
    /// Why the transport last failed
    pub last_failure_reason: Option<String>,
    /// When the transport was last used successfully
    pub last_used_at: Option<Instant>,
    /// Cleared when the failure rate crosses the threshold
    pub available: bool,
}

impl Default for TransportStats {
    fn default() -> Self {
        Self {
            successes: 0,
            failures: 0,
            total_latency: Duration::ZERO,
            last_failure_at: None,
            last_failure_reason: None,
            last_used_at: None,
            available: true,
        }
    }
}

impl TransportStats {
    /// Total observations
    pub fn observations(&self) -> u64 {
        self.successes + self.failures
    }

    /// failures / (successes + failures), zero with no observations
    pub fn failure_rate(&self) -> f64 {
        let total = self.observations();
        if total == 0 {
            0.0
        } else {
            self.failures as f64 / total as f64
        }
    }

    /// Mean latency over successful operations
    pub fn average_latency(&self) -> Duration {
        if self.successes == 0 {
            Duration::ZERO
        } else {
            self.total_latency / self.successes as u32
        }
    }
}

/// Chooses transports and records their outcomes
#[derive(Debug)]
pub struct ProtocolSelector {
    policy: TransportPolicy,
    stats: RwLock<HashMap<TransportKind, TransportStats>>,
    last_switch: Mutex<Option<Instant>>,
}

impl ProtocolSelector {
    /// Create a selector for the given policy
    pub fn new(policy: TransportPolicy) -> Self {
        let stats = policy
            .order
            .iter()
            .map(|kind| (*kind, TransportStats::default()))
            .collect();
        Self {
            policy,
            stats: RwLock::new(stats),
            last_switch: Mutex::new(None),
        }
    }

    /// The policy this selector applies
    pub fn policy(&self) -> &TransportPolicy {
        &self.policy
    }

    /// Pick the transport for a new connection attempt: the first usable
    /// transport in policy order, or the head of the order as a last-ditch
    /// attempt when every transport is unavailable.
    pub fn optimal_for(&self) -> TransportKind {
        let now = Instant::now();
        let mut stats = self.stats.write();
        for kind in &self.policy.order {
            let entry = stats.entry(*kind).or_default();
            if Self::usable(entry, &self.policy, now) {
                if !entry.available {
                    debug!(transport = %kind, "rehabilitating transport after cooldown");
                    entry.available = true;
                }
                return *kind;
            }
        }
        self.policy.head()
    }

    /// Record a successful operation
    pub fn record_success(&self, kind: TransportKind, latency: Duration) {
        let mut stats = self.stats.write();
        let entry = stats.entry(kind).or_default();
        entry.successes += 1;
        entry.total_latency += latency;
        entry.last_used_at = Some(Instant::now());
        entry.available = true;
        drop(stats);
        counter!("protocol_success_total", "transport" => kind.as_str()).increment(1);
    }

    /// Record a failed operation; crossing the threshold with enough
    /// observations marks the transport unavailable
    pub fn record_failure(&self, kind: TransportKind, reason: &str) {
        let mut stats = self.stats.write();
        let entry = stats.entry(kind).or_default();
        entry.failures += 1;
        entry.last_failure_at = Some(Instant::now());
        entry.last_failure_reason = Some(reason.to_string());
        if entry.observations() >= u64::from(self.policy.min_observations)
            && entry.failure_rate() > self.policy.failure_rate_threshold
        {
            entry.available = false;
        }
        drop(stats);
        counter!(
            "protocol_errors_total",
            "transport" => kind.as_str(),
            "kind" => reason.to_string()
        )
        .increment(1);
    }

    /// Whether a live session on `current` should migrate, and to what.
    ///
    /// Migration needs all of: auto-switch enabled, the switch cooldown
    /// elapsed, the current transport over the failure threshold, and a
    /// strictly better alternative.
    pub fn should_switch(&self, current: TransportKind) -> Option<TransportKind> {
        if !self.policy.auto_switch {
            return None;
        }
        {
            let last_switch = self.last_switch.lock();
            if let Some(at) = *last_switch {
                if at.elapsed() < self.policy.switch_cooldown {
                    return None;
                }
            }
        }

        let now = Instant::now();
        let stats = self.stats.read();
        let current_stats = stats.get(&current).cloned().unwrap_or_default();
        if current_stats.observations() < u64::from(self.policy.min_observations)
            || current_stats.failure_rate() <= self.policy.failure_rate_threshold
        {
            return None;
        }

        self.policy
            .order
            .iter()
            .filter(|kind| **kind != current)
            .find(|kind| {
                let candidate = stats.get(*kind).cloned().unwrap_or_default();
                Self::usable(&candidate, &self.policy, now)
                    && candidate.failure_rate() < current_stats.failure_rate()
            })
            .copied()
    }

    /// Record a completed switch: starts the cooldown and counts it
    pub fn mark_switched(&self, from: TransportKind, to: TransportKind) {
        *self.last_switch.lock() = Some(Instant::now());
        info!(from = %from, to = %to, "switched transport");
        counter!(
            "protocol_switches_total",
            "from" => from.as_str(),
            "to" => to.as_str()
        )
        .increment(1);
    }

    /// Snapshot of all per-transport statistics
    pub fn snapshot(&self) -> Vec<(TransportKind, TransportStats)> {
        let stats = self.stats.read();
        self.policy
            .order
            .iter()
            .map(|kind| (*kind, stats.get(kind).cloned().unwrap_or_default()))
            .collect()
    }

    fn usable(stats: &TransportStats, policy: &TransportPolicy, now: Instant) -> bool {
        let cooled_down = stats
            .last_failure_at
            .is_none_or(|at| now.duration_since(at) >= policy.switch_cooldown);
        if !stats.available {
            return cooled_down;
        }
        if stats.observations() >= u64::from(policy.min_observations)
            && stats.failure_rate() > policy.failure_rate_threshold
        {
            return cooled_down;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn quick_policy() -> TransportPolicy {
        TransportPolicy {
            min_observations: 2,
            switch_cooldown: Duration::from_secs(3600),
            ..TransportPolicy::default()
        }
    }

    #[test]
    fn test_policy_validation() {
        assert!(TransportPolicy::default().validate().is_ok());

        let dup = TransportPolicy {
            order: vec![TransportKind::Quic, TransportKind::Quic],
            ..TransportPolicy::default()
        };
        assert!(dup.validate().is_err());

        let bad_threshold = TransportPolicy {
            failure_rate_threshold: 1.5,
            ..TransportPolicy::default()
        };
        assert!(bad_threshold.validate().is_err());

        let empty = TransportPolicy {
            order: vec![],
            ..TransportPolicy::default()
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_prefers_policy_head() {
        let selector = ProtocolSelector::new(TransportPolicy::default());
        assert_eq!(selector.optimal_for(), TransportKind::Quic);
    }

    #[test]
    fn test_falls_back_after_repeated_failures() {
        let selector = ProtocolSelector::new(quick_policy());
        selector.record_failure(TransportKind::Quic, "udp_blocked");
        selector.record_failure(TransportKind::Quic, "udp_blocked");
        // Two failures cross min_observations with a 100% failure rate
        assert_eq!(selector.optimal_for(), TransportKind::Http2);
    }

    /// Counter value rendered for the first series matching every fragment
    fn counter_value(rendered: &str, name: &str, fragments: &[&str]) -> u64 {
        rendered
            .lines()
            .find(|line| {
                line.starts_with(name) && fragments.iter().all(|fragment| line.contains(fragment))
            })
            .and_then(|line| line.rsplit(' ').next())
            .and_then(|value| value.parse().ok())
            .unwrap_or_else(|| panic!("no {name} series matching {fragments:?} in:\n{rendered}"))
    }

    #[test]
    fn test_transport_fallback_records_metrics() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            let selector = ProtocolSelector::new(quick_policy());
            // QUIC is blocked twice in a row, crossing min_observations
            selector.record_failure(TransportKind::Quic, "udp_blocked");
            selector.record_failure(TransportKind::Quic, "udp_blocked");

            let next = selector.optimal_for();
            assert_eq!(next, TransportKind::Http2);
            selector.mark_switched(TransportKind::Quic, next);
            selector.record_success(next, Duration::from_millis(12));
        });

        let rendered = handle.render();
        assert_eq!(
            counter_value(
                &rendered,
                "protocol_errors_total",
                &[r#"transport="quic""#, r#"kind="udp_blocked""#],
            ),
            2
        );
        assert_eq!(
            counter_value(
                &rendered,
                "protocol_switches_total",
                &[r#"from="quic""#, r#"to="http2""#],
            ),
            1
        );
        assert_eq!(
            counter_value(&rendered, "protocol_success_total", &[r#"transport="http2""#]),
            1
        );
    }

    #[test]
    fn test_success_keeps_transport_available() {
        let selector = ProtocolSelector::new(quick_policy());
        selector.record_success(TransportKind::Quic, Duration::from_millis(20));
        selector.record_failure(TransportKind::Quic, "reset");
        // 50% failure rate is under the 0.8 threshold
        assert_eq!(selector.optimal_for(), TransportKind::Quic);
    }

    #[test]
    fn test_last_ditch_returns_head() {
        let selector = ProtocolSelector::new(quick_policy());
        for kind in TransportKind::ALL {
            selector.record_failure(kind, "down");
            selector.record_failure(kind, "down");
        }
        assert_eq!(selector.optimal_for(), TransportKind::Quic);
    }

    #[test]
    fn test_cooldown_rehabilitates() {
        let policy = TransportPolicy {
            min_observations: 2,
            switch_cooldown: Duration::from_millis(20),
            ..TransportPolicy::default()
        };
        let selector = ProtocolSelector::new(policy);
        selector.record_failure(TransportKind::Quic, "down");
        selector.record_failure(TransportKind::Quic, "down");
        assert_eq!(selector.optimal_for(), TransportKind::Http2);

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(selector.optimal_for(), TransportKind::Quic);
        // Rehabilitation restored the availability bit
        let (_, stats) = selector.snapshot().into_iter().next().unwrap();
        assert!(stats.available);
    }

    #[test]
    fn test_should_switch_requires_threshold() {
        let selector = ProtocolSelector::new(quick_policy());
        selector.record_success(TransportKind::Quic, Duration::from_millis(5));
        assert_eq!(selector.should_switch(TransportKind::Quic), None);

        selector.record_failure(TransportKind::Quic, "reset");
        selector.record_failure(TransportKind::Quic, "reset");
        selector.record_failure(TransportKind::Quic, "reset");
        selector.record_failure(TransportKind::Quic, "reset");
        selector.record_failure(TransportKind::Quic, "reset");
        // 5/6 failures > 0.8
        assert_eq!(
            selector.should_switch(TransportKind::Quic),
            Some(TransportKind::Http2)
        );
    }

    #[test]
    fn test_should_switch_honours_auto_switch_bit() {
        let policy = TransportPolicy {
            auto_switch: false,
            min_observations: 1,
            ..TransportPolicy::default()
        };
        let selector = ProtocolSelector::new(policy);
        selector.record_failure(TransportKind::Quic, "reset");
        assert_eq!(selector.should_switch(TransportKind::Quic), None);
    }

    #[test]
    fn test_should_switch_honours_cooldown() {
        let selector = ProtocolSelector::new(quick_policy());
        selector.mark_switched(TransportKind::Quic, TransportKind::Http2);
        selector.record_failure(TransportKind::Http2, "reset");
        selector.record_failure(TransportKind::Http2, "reset");
        // Cooldown of an hour has not elapsed
        assert_eq!(selector.should_switch(TransportKind::Http2), None);
    }

    #[test]
    fn test_stats_derivations() {
        let mut stats = TransportStats::default();
        assert_eq!(stats.failure_rate(), 0.0);
        assert_eq!(stats.average_latency(), Duration::ZERO);
        stats.successes = 3;
        stats.failures = 1;
        stats.total_latency = Duration::from_millis(30);
        assert_eq!(stats.failure_rate(), 0.25);
        assert_eq!(stats.average_latency(), Duration::from_millis(10));
    }

    proptest! {
        /// An unavailable transport is never selected unless every
        /// transport is unavailable, in which case the policy head is the
        /// last-ditch answer.
        #[test]
        fn prop_never_selects_unavailable(outcomes in proptest::collection::vec(
            (0usize..3, proptest::bool::ANY),
            0..64,
        )) {
            let policy = TransportPolicy {
                min_observations: 2,
                switch_cooldown: Duration::from_secs(3600),
                ..TransportPolicy::default()
            };
            let selector = ProtocolSelector::new(policy);
            for (index, success) in outcomes {
                let kind = TransportKind::ALL[index];
                if success {
                    selector.record_success(kind, Duration::from_millis(1));
                } else {
                    selector.record_failure(kind, "induced");
                }
            }

            let chosen = selector.optimal_for();
            let snapshot = selector.snapshot();
            let any_available = snapshot.iter().any(|(_, s)| s.available);
            if any_available {
                let stats = snapshot
                    .iter()
                    .find(|(kind, _)| *kind == chosen)
                    .map(|(_, s)| s.clone())
                    .unwrap();
                prop_assert!(stats.available);
            } else {
                prop_assert_eq!(chosen, TransportKind::Quic);
            }
        }
    }
}
