//! Compute budget contracts.
//!
//! A budget declares what a workload promises to respect; it never acts on
//! its own. Until a measured baseline resolves, the declared base budget
//! applies as-is; afterwards the profile multipliers scale the baseline into
//! concrete numbers.

use serde::{Deserialize, Serialize};

use crate::telemetry::LatencyStats;

/// Adaptive budget profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BudgetProfile {
    /// Wide latency allowance, strict drain: 2.0x p95, 0.6x drain, thermal
    /// floor 1.
    Conservative,
    /// Middle ground: 1.5x p95, 1.0x drain, thermal floor 2.
    #[default]
    Balanced,
    /// Tight latency, generous drain: 1.1x p95, 1.5x drain, thermal floor 3.
    Performance,
}

impl BudgetProfile {
    /// Multiplier applied to the observed p95 latency.
    pub fn p95_multiplier(self) -> f64 {
        match self {
            BudgetProfile::Conservative => 2.0,
            BudgetProfile::Balanced => 1.5,
            BudgetProfile::Performance => 1.1,
        }
    }

    /// Multiplier applied to the observed drain rate.
    pub fn drain_multiplier(self) -> f64 {
        match self {
            BudgetProfile::Conservative => 0.6,
            BudgetProfile::Balanced => 1.0,
            BudgetProfile::Performance => 1.5,
        }
    }

    /// Lower bound applied to the thermal ceiling at resolution.
    pub fn thermal_floor(self) -> u8 {
        match self {
            BudgetProfile::Conservative => 1,
            BudgetProfile::Balanced => 2,
            BudgetProfile::Performance => 3,
        }
    }
}

/// Declarative constraints for one workload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    /// Profile selecting the baseline multipliers.
    pub profile: BudgetProfile,
    /// p95 latency ceiling in ms.
    pub p95_latency_ms: u64,
    /// Battery drain ceiling in %/10min.
    pub battery_drain_per_ten_minutes: f64,
    /// Thermal level ceiling (0..=3).
    pub max_thermal_level: u8,
    /// Heap ceiling in MiB.
    pub max_memory_mb: u64,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            profile: BudgetProfile::Balanced,
            p95_latency_ms: 2_000,
            battery_drain_per_ten_minutes: 5.0,
            max_thermal_level: 2,
            max_memory_mb: 2_048,
        }
    }
}

impl Budget {
    /// Resolve against a measured baseline, when one exists.
    ///
    /// `max_memory_mb` is always left as declared; the thermal ceiling is
    /// raised to the profile floor when the declaration sits below it.
    pub fn resolve(&self, baseline: Option<&MeasuredBaseline>) -> Budget {
        let Some(baseline) = baseline else {
            return *self;
        };
        Budget {
            profile: self.profile,
            p95_latency_ms: (baseline.observed_p95_ms * self.profile.p95_multiplier()).ceil()
                as u64,
            battery_drain_per_ten_minutes: baseline.observed_drain_per_10min
                * self.profile.drain_multiplier(),
            max_thermal_level: self
                .max_thermal_level
                .max(self.profile.thermal_floor())
                .min(3),
            max_memory_mb: self.max_memory_mb,
        }
    }
}

/// Immutable snapshot of observed runtime performance, resolved once after
/// the warm-up period.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeasuredBaseline {
    /// Observed median latency in ms.
    pub observed_p50_ms: f64,
    /// Observed p95 latency in ms.
    pub observed_p95_ms: f64,
    /// Observed generation speed.
    pub observed_tokens_per_second: f64,
    /// Observed battery drain in %/10min.
    pub observed_drain_per_10min: f64,
    /// Samples that contributed to the snapshot.
    pub samples_contributing: usize,
    /// Unix timestamp of resolution.
    pub resolved_at: i64,
}

/// Collects activity until the warm-up completes, then resolves a baseline
/// exactly once.
#[derive(Debug)]
pub(crate) struct BaselineRecorder {
    warmup_ms: i64,
    min_samples: usize,
    first_activity_ms: Option<i64>,
    resolved: Option<MeasuredBaseline>,
}

impl BaselineRecorder {
    /// Default warm-up span of non-idle activity.
    pub(crate) const DEFAULT_WARMUP_MS: i64 = 40_000;

    const MIN_SAMPLES: usize = 5;

    pub(crate) fn new(warmup_ms: i64) -> Self {
        Self {
            warmup_ms: warmup_ms.max(1),
            min_samples: Self::MIN_SAMPLES,
            first_activity_ms: None,
            resolved: None,
        }
    }

    /// Note that the workload did real work at `now_ms`.
    pub(crate) fn note_activity(&mut self, now_ms: i64) {
        if self.first_activity_ms.is_none() {
            self.first_activity_ms = Some(now_ms);
        }
    }

    pub(crate) fn baseline(&self) -> Option<&MeasuredBaseline> {
        self.resolved.as_ref()
    }

    /// Resolve once the warm-up has elapsed and enough samples exist.
    pub(crate) fn try_resolve(
        &mut self,
        stats: &LatencyStats,
        tokens_per_second: f64,
        drain_per_10min: f64,
        now_ms: i64,
    ) -> Option<&MeasuredBaseline> {
        if self.resolved.is_some() {
            return self.resolved.as_ref();
        }
        let first = self.first_activity_ms?;
        if now_ms - first < self.warmup_ms || stats.count < self.min_samples {
            return None;
        }

        self.resolved = Some(MeasuredBaseline {
            observed_p50_ms: stats.p50,
            observed_p95_ms: stats.p95,
            observed_tokens_per_second: tokens_per_second,
            observed_drain_per_10min: drain_per_10min,
            samples_contributing: stats.count,
            resolved_at: now_ms / 1000,
        });
        self.resolved.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::LatencyTracker;

    fn baseline() -> MeasuredBaseline {
        MeasuredBaseline {
            observed_p50_ms: 400.0,
            observed_p95_ms: 1000.0,
            observed_tokens_per_second: 20.0,
            observed_drain_per_10min: 3.0,
            samples_contributing: 50,
            resolved_at: 1_700_000_000,
        }
    }

    #[test]
    fn base_budget_applies_until_baseline_resolves() {
        let budget = Budget::default();
        assert_eq!(budget.resolve(None), budget);
    }

    #[test]
    fn profiles_scale_the_baseline() {
        let base = Budget {
            profile: BudgetProfile::Conservative,
            max_thermal_level: 0,
            ..Budget::default()
        };
        let resolved = base.resolve(Some(&baseline()));
        assert_eq!(resolved.p95_latency_ms, 2000);
        assert!((resolved.battery_drain_per_ten_minutes - 1.8).abs() < 1e-9);
        // Thermal ceiling raised to the profile floor.
        assert_eq!(resolved.max_thermal_level, 1);
        // Memory ceiling untouched.
        assert_eq!(resolved.max_memory_mb, base.max_memory_mb);

        let perf = Budget {
            profile: BudgetProfile::Performance,
            max_thermal_level: 2,
            ..Budget::default()
        };
        let resolved = perf.resolve(Some(&baseline()));
        assert_eq!(resolved.p95_latency_ms, 1100);
        assert!((resolved.battery_drain_per_ten_minutes - 4.5).abs() < 1e-9);
        assert_eq!(resolved.max_thermal_level, 3);
    }

    #[test]
    fn declared_thermal_ceiling_survives_when_above_floor() {
        let base = Budget {
            profile: BudgetProfile::Conservative,
            max_thermal_level: 3,
            ..Budget::default()
        };
        assert_eq!(base.resolve(Some(&baseline())).max_thermal_level, 3);
    }

    #[test]
    fn recorder_resolves_once_after_warmup() {
        let mut recorder = BaselineRecorder::new(40_000);
        let mut latency = LatencyTracker::new();
        for _ in 0..10 {
            latency.record(500.0);
        }
        let stats = latency.stats();

        // No activity noted yet.
        assert!(recorder.try_resolve(&stats, 20.0, 2.0, 100_000).is_none());

        recorder.note_activity(0);
        // Warm-up not elapsed.
        assert!(recorder.try_resolve(&stats, 20.0, 2.0, 39_999).is_none());

        let resolved = recorder
            .try_resolve(&stats, 20.0, 2.0, 40_000)
            .copied()
            .expect("resolved");
        assert_eq!(resolved.observed_p95_ms, 500.0);
        assert_eq!(resolved.samples_contributing, 10);

        // Immutable once resolved: later samples do not change it.
        latency.record(9_000.0);
        let later_stats = latency.stats();
        let again = recorder
            .try_resolve(&later_stats, 99.0, 9.0, 90_000)
            .copied()
            .expect("still resolved");
        assert_eq!(again, resolved);
    }

    #[test]
    fn recorder_requires_minimum_samples() {
        let mut recorder = BaselineRecorder::new(40_000);
        let mut latency = LatencyTracker::new();
        latency.record(500.0);
        recorder.note_activity(0);
        let stats = latency.stats();
        assert!(recorder.try_resolve(&stats, 20.0, 2.0, 50_000).is_none());
    }
}
