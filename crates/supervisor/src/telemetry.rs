//! Telemetry primitives: latency percentiles, heap sampling, thermal state,
//! battery drain, and page visibility.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// Summary over the latency window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    /// Median latency in ms.
    pub p50: f64,
    /// 95th percentile in ms. The primary signal for budget checks.
    pub p95: f64,
    /// 99th percentile in ms. Informational only: over a 100-sample window
    /// this is the top one or two samples.
    pub p99: f64,
    /// Mean latency in ms.
    pub average: f64,
    /// Smallest sample in the window.
    pub min: f64,
    /// Largest sample in the window.
    pub max: f64,
    /// Number of samples in the window.
    pub count: usize,
}

/// Sliding window of the last N latency samples.
///
/// Percentile `p` is the element at index `ceil(p * n) - 1` of the sorted
/// window. The sorted view is memoized until the next sample lands.
#[derive(Debug)]
pub struct LatencyTracker {
    window: usize,
    samples: VecDeque<f64>,
    sorted: Option<Vec<f64>>,
}

impl LatencyTracker {
    /// Default window size.
    pub const DEFAULT_WINDOW: usize = 100;

    /// Tracker with the default 100-sample window.
    pub fn new() -> Self {
        Self::with_window(Self::DEFAULT_WINDOW)
    }

    /// Tracker with an explicit window size (>= 1).
    pub fn with_window(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            samples: VecDeque::with_capacity(window),
            sorted: None,
        }
    }

    /// Record one latency sample in milliseconds.
    pub fn record(&mut self, ms: f64) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(ms);
        self.sorted = None;
    }

    /// Number of samples currently in the window.
    pub fn count(&self) -> usize {
        self.samples.len()
    }

    fn sorted(&mut self) -> &[f64] {
        if self.sorted.is_none() {
            let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            self.sorted = Some(sorted);
        }
        self.sorted.as_deref().unwrap_or(&[])
    }

    fn percentile(sorted: &[f64], p: f64) -> f64 {
        if sorted.is_empty() {
            return 0.0;
        }
        let index = ((p * sorted.len() as f64).ceil() as usize).max(1) - 1;
        sorted[index.min(sorted.len() - 1)]
    }

    /// Stats over the current window. All zeros for an empty window.
    pub fn stats(&mut self) -> LatencyStats {
        let count = self.samples.len();
        if count == 0 {
            return LatencyStats::default();
        }
        let sum: f64 = self.samples.iter().sum();
        let sorted = self.sorted();
        LatencyStats {
            p50: Self::percentile(sorted, 0.50),
            p95: Self::percentile(sorted, 0.95),
            p99: Self::percentile(sorted, 0.99),
            average: sum / count as f64,
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            count,
        }
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Process heap probe.
///
/// Returns 0 where the platform reports nothing; callers must treat 0 as
/// "unknown", not "zero bytes used". Tracks the session peak.
pub struct HeapSampler {
    system: sysinfo::System,
    pid: Option<sysinfo::Pid>,
    peak: u64,
}

impl HeapSampler {
    /// Probe for the current process.
    pub fn new() -> Self {
        Self {
            system: sysinfo::System::new(),
            pid: sysinfo::get_current_pid().ok(),
            peak: 0,
        }
    }

    /// Current resident set size in bytes, or 0 when unavailable.
    pub fn sample(&mut self) -> u64 {
        let Some(pid) = self.pid else { return 0 };
        self.system.refresh_processes(
            sysinfo::ProcessesToUpdate::Some(&[pid]),
            true,
        );
        let current = self.system.process(pid).map_or(0, |p| p.memory());
        if current > self.peak {
            self.peak = current;
        }
        current
    }

    /// Largest value [`HeapSampler::sample`] has returned this session.
    pub fn peak(&self) -> u64 {
        self.peak
    }

    /// System-wide available memory in bytes, or `None` when the platform
    /// reports nothing.
    pub fn available_memory(&mut self) -> Option<u64> {
        self.system
            .refresh_memory_specifics(sysinfo::MemoryRefreshKind::nothing().with_ram());
        let available = self.system.available_memory();
        (available > 0).then_some(available)
    }
}

impl Default for HeapSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Thermal level: -1 unavailable, 0 nominal, 1 fair, 2 serious, 3 critical.
pub type ThermalLevel = i8;

struct ThermalInner {
    level: ThermalLevel,
    listeners: Vec<Box<dyn Fn(ThermalLevel) + Send>>,
}

/// Holder for the device thermal level.
///
/// The host has no native thermal signal; updates arrive from an external
/// observer through [`ThermalState::update_level`]. Listeners fire on state
/// change only.
#[derive(Clone)]
pub struct ThermalState {
    inner: Arc<Mutex<ThermalInner>>,
}

impl ThermalState {
    /// Holder starting at "unavailable" (-1).
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ThermalInner {
                level: -1,
                listeners: Vec::new(),
            })),
        }
    }

    /// Feed a new level, clamped to [-1, 3]. Listeners run (on the calling
    /// thread) only when the level actually changes.
    pub fn update_level(&self, level: ThermalLevel) {
        let level = level.clamp(-1, 3);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.level == level {
            return;
        }
        inner.level = level;
        tracing::debug!(level, "thermal level changed");
        let listeners = std::mem::take(&mut inner.listeners);
        drop(inner);
        for listener in &listeners {
            listener(level);
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.listeners.extend(listeners);
    }

    /// Current level.
    pub fn level(&self) -> ThermalLevel {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).level
    }

    /// True at level 2 (serious) or above.
    pub fn should_throttle(&self) -> bool {
        self.level() >= 2
    }

    /// True at level 3 (critical).
    pub fn is_critical(&self) -> bool {
        self.level() == 3
    }

    /// Register a change listener.
    pub fn on_change(&self, listener: impl Fn(ThermalLevel) + Send + 'static) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .listeners
            .push(Box::new(listener));
    }
}

impl Default for ThermalState {
    fn default() -> Self {
        Self::new()
    }
}

/// One battery reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatterySample {
    /// Charge level in [0, 1].
    pub level: f64,
    /// Sample time in unix milliseconds.
    pub timestamp_ms: i64,
}

/// Battery drain tracker over a 10-minute window.
///
/// Caller-fed: a platform battery event source may feed it where one exists,
/// otherwise the embedder records levels at its own cadence.
#[derive(Debug)]
pub struct BatteryTracker {
    samples: VecDeque<BatterySample>,
}

/// Window span for drain computation.
const BATTERY_WINDOW_MS: i64 = 600_000;

/// At a typical 1-per-minute cadence this holds the whole window.
const BATTERY_MAX_SAMPLES: usize = 11;

impl BatteryTracker {
    /// An empty tracker.
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(BATTERY_MAX_SAMPLES),
        }
    }

    /// Record a battery level (clamped to [0, 1]) at `timestamp_ms`.
    pub fn record(&mut self, level: f64, timestamp_ms: i64) {
        self.samples.push_back(BatterySample {
            level: level.clamp(0.0, 1.0),
            timestamp_ms,
        });

        while let Some(first) = self.samples.front() {
            let expired = timestamp_ms - first.timestamp_ms > BATTERY_WINDOW_MS;
            if expired || self.samples.len() > BATTERY_MAX_SAMPLES {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Most recent level, when any sample exists.
    pub fn current_level(&self) -> Option<f64> {
        self.samples.back().map(|s| s.level)
    }

    /// Drain in %/10min over the window span, clamped at 0 (charging reads
    /// as zero drain). 0 with fewer than two samples.
    pub fn current_drain_rate(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        let elapsed_ms = last.timestamp_ms - first.timestamp_ms;
        if elapsed_ms <= 0 {
            return 0.0;
        }
        ((first.level - last.level) * BATTERY_WINDOW_MS as f64 / elapsed_ms as f64 * 100.0)
            .max(0.0)
    }

    /// Mean of the consecutive-pair drain rates.
    pub fn average_drain_rate(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let mut sum = 0.0;
        let mut pairs = 0u32;
        for pair in self.samples.iter().zip(self.samples.iter().skip(1)) {
            let (a, b) = pair;
            let elapsed_ms = b.timestamp_ms - a.timestamp_ms;
            if elapsed_ms <= 0 {
                continue;
            }
            sum += ((a.level - b.level) * BATTERY_WINDOW_MS as f64 / elapsed_ms as f64 * 100.0)
                .max(0.0);
            pairs += 1;
        }
        if pairs == 0 { 0.0 } else { sum / f64::from(pairs) }
    }
}

impl Default for BatteryTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Page/tab visibility probe, evaluated per decision.
pub trait VisibilityProbe: Send + Sync {
    /// True when the host surface is hidden.
    fn is_hidden(&self) -> bool;
}

/// Caller-fed visibility flag.
#[derive(Debug, Default)]
pub struct VisibilityFlag {
    hidden: AtomicBool,
}

impl VisibilityFlag {
    /// Flag starting visible.
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the flag.
    pub fn set_hidden(&self, hidden: bool) {
        self.hidden.store(hidden, Ordering::SeqCst);
    }
}

impl VisibilityProbe for VisibilityFlag {
    fn is_hidden(&self) -> bool {
        self.hidden.load(Ordering::SeqCst)
    }
}
