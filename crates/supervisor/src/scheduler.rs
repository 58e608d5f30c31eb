//! Workload scheduler.
//!
//! Owns the set of registered workloads and arbitrates between them: every
//! tick it samples telemetry, checks each attached budget, degrades
//! lower-priority workloads to relieve a violating one, applies the pressure
//! escalation/restoration policy, and publishes the resulting QoS map.
//!
//! All state lives on the scheduler task. Handles talk to it through a
//! command channel; violation events fan out over a broadcast channel whose
//! receivers can never block the loop.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

use crate::budget::{BaselineRecorder, Budget, MeasuredBaseline};
use crate::policy::{PressureSnapshot, QosController, QosLevel};
use crate::telemetry::{
    BatteryTracker, HeapSampler, LatencyStats, LatencyTracker, ThermalState, VisibilityProbe,
};

/// Workload priority. Higher priorities push lower ones down under pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    /// Degraded first.
    Low,
    /// Middle tier.
    Medium,
    /// Degraded last.
    High,
}

/// Which budget constraint was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ViolationKind {
    /// p95 latency above the resolved ceiling.
    LatencyP95,
    /// Battery drain above the resolved ceiling.
    Drain,
    /// Thermal level above the ceiling.
    Thermal,
    /// Heap use above the ceiling.
    Memory,
}

/// How bad a violation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Mitigation is still possible (or the violation is fresh).
    Warn,
    /// Every lower-priority workload is already paused and the violation has
    /// persisted past the cooldown window.
    Critical,
}

/// A budget constraint observed above its limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetViolation {
    /// Scheduler-assigned workload id.
    pub workload_id: u64,
    /// Workload name.
    pub workload: String,
    /// Constraint that tripped.
    pub kind: ViolationKind,
    /// Observed value.
    pub observed: f64,
    /// Configured (resolved) limit.
    pub limit: f64,
    /// Severity under the mitigation rules.
    pub severity: ViolationSeverity,
    /// Unix milliseconds.
    pub timestamp_ms: i64,
}

/// Scheduler tunables.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Budget-check period. Zero falls back to the default; never disabled.
    pub tick: Duration,
    /// Sustained-clear span required per QoS restoration step.
    pub cooldown: Duration,
    /// Latency window per workload.
    pub latency_window: usize,
    /// Activity span before the measured baseline resolves.
    pub baseline_warmup: Duration,
}

impl SchedulerConfig {
    /// Default budget-check period.
    pub const DEFAULT_TICK: Duration = Duration::from_secs(2);
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Self::DEFAULT_TICK,
            cooldown: QosController::DEFAULT_COOLDOWN,
            latency_window: LatencyTracker::DEFAULT_WINDOW,
            baseline_warmup: Duration::from_millis(BaselineRecorder::DEFAULT_WARMUP_MS as u64),
        }
    }
}

/// Telemetry sources the scheduler samples each tick.
#[derive(Clone)]
pub struct TelemetrySources {
    /// Thermal state holder, fed by an external observer.
    pub thermal: ThermalState,
    /// Battery tracker, fed by the platform or the embedder.
    pub battery: Arc<Mutex<BatteryTracker>>,
    /// Visibility probe.
    pub visibility: Arc<dyn VisibilityProbe>,
    /// Memory-headroom override. `None` samples system available memory.
    pub memory_headroom: Option<Arc<dyn Fn() -> Option<u64> + Send + Sync>>,
}

impl Default for TelemetrySources {
    fn default() -> Self {
        Self {
            thermal: ThermalState::new(),
            battery: Arc::new(Mutex::new(BatteryTracker::new())),
            visibility: Arc::new(crate::telemetry::VisibilityFlag::new()),
            memory_headroom: None,
        }
    }
}

/// Point-in-time view of one workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSnapshot {
    /// Scheduler-assigned id.
    pub id: u64,
    /// Workload name.
    pub name: String,
    /// Priority.
    pub priority: Priority,
    /// Current QoS level.
    pub qos: QosLevel,
    /// Latency stats over the window.
    pub latency: LatencyStats,
    /// Resolved baseline, once warm-up completed.
    pub baseline: Option<MeasuredBaseline>,
    /// Unix ms of registration.
    pub registered_at: i64,
    /// Unix ms of the last recorded activity.
    pub last_active: i64,
}

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    /// Registered workloads, ordered by id.
    pub workloads: Vec<WorkloadSnapshot>,
}

/// QoS level per workload name, as published to workers.
pub type QosMap = BTreeMap<String, QosLevel>;

enum Command {
    Register {
        id: u64,
        name: String,
        priority: Priority,
        budget: Option<Budget>,
    },
    Unregister {
        id: u64,
    },
    RecordLatency {
        id: u64,
        ms: f64,
        tokens_per_second: Option<f64>,
    },
    Shutdown,
}

/// Handle for recording one workload's activity.
#[derive(Clone)]
pub struct WorkloadHandle {
    id: u64,
    name: String,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl WorkloadHandle {
    /// Scheduler-assigned id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Workload name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record one request latency.
    pub fn record_latency(&self, ms: f64) {
        let _ = self.cmd_tx.send(Command::RecordLatency {
            id: self.id,
            ms,
            tokens_per_second: None,
        });
    }

    /// Record a completed generation: latency plus throughput.
    pub fn record_generation(&self, ms: f64, tokens_per_second: f64) {
        let _ = self.cmd_tx.send(Command::RecordLatency {
            id: self.id,
            ms,
            tokens_per_second: Some(tokens_per_second),
        });
    }

    /// Remove the workload from the scheduler.
    pub fn unregister(self) {
        let _ = self.cmd_tx.send(Command::Unregister { id: self.id });
    }
}

/// Running scheduler instance.
pub struct Scheduler {
    cmd_tx: mpsc::UnboundedSender<Command>,
    next_id: AtomicU64,
    violation_tx: broadcast::Sender<BudgetViolation>,
    qos_rx: watch::Receiver<QosMap>,
    snapshot_rx: watch::Receiver<SchedulerSnapshot>,
    join: tokio::task::JoinHandle<()>,
}

impl Scheduler {
    /// Spawn the scheduler task.
    pub fn start(mut config: SchedulerConfig, sources: TelemetrySources) -> Self {
        if config.tick.is_zero() {
            config.tick = SchedulerConfig::DEFAULT_TICK;
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (violation_tx, _) = broadcast::channel(256);
        let (qos_tx, qos_rx) = watch::channel(QosMap::new());
        let (snapshot_tx, snapshot_rx) = watch::channel(SchedulerSnapshot::default());

        let loop_state = SchedulerLoop {
            config,
            sources,
            heap: HeapSampler::new(),
            workloads: BTreeMap::new(),
            cmd_rx,
            violation_tx: violation_tx.clone(),
            qos_tx,
            snapshot_tx,
        };
        let join = tokio::spawn(loop_state.run());

        Self {
            cmd_tx,
            next_id: AtomicU64::new(1),
            violation_tx,
            qos_rx,
            snapshot_rx,
            join,
        }
    }

    /// Register a workload, optionally with a budget to enforce.
    pub fn register(
        &self,
        name: impl Into<String>,
        priority: Priority,
        budget: Option<Budget>,
    ) -> WorkloadHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = name.into();
        let _ = self.cmd_tx.send(Command::Register {
            id,
            name: name.clone(),
            priority,
            budget,
        });
        WorkloadHandle {
            id,
            name,
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    /// Subscribe to budget-violation events. Handlers run on their own
    /// receivers; a slow or dropped receiver never blocks the loop.
    pub fn subscribe_violations(&self) -> broadcast::Receiver<BudgetViolation> {
        self.violation_tx.subscribe()
    }

    /// Watch the published QoS map.
    pub fn qos_updates(&self) -> watch::Receiver<QosMap> {
        self.qos_rx.clone()
    }

    /// Latest scheduler snapshot.
    pub fn snapshot(&self) -> SchedulerSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Stop the scheduler task and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
        let _ = self.join.await;
    }
}

struct WorkloadState {
    name: String,
    priority: Priority,
    qos: QosController,
    latency: LatencyTracker,
    baseline: BaselineRecorder,
    budget: Option<Budget>,
    registered_at: i64,
    last_active: i64,
    last_tokens_per_second: f64,
    violating_since: BTreeMap<ViolationKind, Instant>,
}

struct SchedulerLoop {
    config: SchedulerConfig,
    sources: TelemetrySources,
    heap: HeapSampler,
    workloads: BTreeMap<u64, WorkloadState>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    violation_tx: broadcast::Sender<BudgetViolation>,
    qos_tx: watch::Sender<QosMap>,
    snapshot_tx: watch::Sender<SchedulerSnapshot>,
}

impl SchedulerLoop {
    async fn run(mut self) {
        let mut tick = tokio::time::interval(self.config.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.run_tick();
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        None | Some(Command::Shutdown) => break,
                        Some(cmd) => self.handle_command(cmd),
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Register {
                id,
                name,
                priority,
                budget,
            } => {
                let now_ms = chrono::Utc::now().timestamp_millis();
                tracing::debug!(id, %name, ?priority, "workload registered");
                self.workloads.insert(
                    id,
                    WorkloadState {
                        name,
                        priority,
                        qos: QosController::new(self.config.cooldown),
                        latency: LatencyTracker::with_window(self.config.latency_window),
                        baseline: BaselineRecorder::new(
                            self.config.baseline_warmup.as_millis() as i64
                        ),
                        budget,
                        registered_at: now_ms,
                        last_active: now_ms,
                        last_tokens_per_second: 0.0,
                        violating_since: BTreeMap::new(),
                    },
                );
                self.publish();
            }
            Command::Unregister { id } => {
                if self.workloads.remove(&id).is_some() {
                    tracing::debug!(id, "workload unregistered");
                    self.publish();
                }
            }
            Command::RecordLatency {
                id,
                ms,
                tokens_per_second,
            } => {
                if let Some(workload) = self.workloads.get_mut(&id) {
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    workload.latency.record(ms);
                    workload.baseline.note_activity(now_ms);
                    workload.last_active = now_ms;
                    if let Some(tps) = tokens_per_second {
                        workload.last_tokens_per_second = tps;
                    }
                }
            }
            Command::Shutdown => {}
        }
    }

    fn sample_pressure(&mut self) -> (PressureSnapshot, f64) {
        let battery = self.sources.battery.lock().unwrap_or_else(|e| e.into_inner());
        let battery_level = battery.current_level();
        let drain = battery.current_drain_rate();
        drop(battery);

        let heap_current = self.heap.sample();
        let available_memory_bytes = match &self.sources.memory_headroom {
            Some(probe) => probe(),
            None => self.heap.available_memory(),
        };
        let pressure = PressureSnapshot {
            thermal_level: self.sources.thermal.level(),
            battery_level,
            available_memory_bytes,
            heap_current_bytes: heap_current,
            heap_peak_bytes: self.heap.peak(),
            hidden: self.sources.visibility.is_hidden(),
        };
        (pressure, drain)
    }

    fn run_tick(&mut self) {
        let (pressure, drain) = self.sample_pressure();
        let now = Instant::now();
        let now_ms = chrono::Utc::now().timestamp_millis();

        // Budget checks, highest priority first so mitigation settles
        // deterministically within one tick.
        let mut ordered: Vec<u64> = self.workloads.keys().copied().collect();
        ordered.sort_by_key(|id| {
            let priority = self.workloads[id].priority;
            (std::cmp::Reverse(priority), *id)
        });

        let mut qos_dirty = false;
        for id in &ordered {
            qos_dirty |= self.check_budget(*id, &pressure, drain, now, now_ms);
        }

        // Pressure escalation / restoration, independent of budgets.
        let target = pressure.escalation_target();
        for (id, workload) in &mut self.workloads {
            if let Some(level) = workload.qos.apply(target, now) {
                tracing::info!(
                    id,
                    name = %workload.name,
                    ?level,
                    ?target,
                    "qos level changed"
                );
                qos_dirty = true;
            }
        }

        if qos_dirty {
            self.publish();
        }
    }

    /// Check one workload's budget. Returns whether any QoS level moved.
    fn check_budget(
        &mut self,
        id: u64,
        pressure: &PressureSnapshot,
        drain: f64,
        now: Instant,
        now_ms: i64,
    ) -> bool {
        let Some(workload) = self.workloads.get_mut(&id) else {
            return false;
        };
        let Some(budget) = workload.budget else {
            return false;
        };

        let stats = workload.latency.stats();
        workload
            .baseline
            .try_resolve(&stats, workload.last_tokens_per_second, drain, now_ms);
        let resolved = budget.resolve(workload.baseline.baseline());

        let heap_mb = pressure.heap_current_bytes as f64 / (1024.0 * 1024.0);
        let mut exceeded: Vec<(ViolationKind, f64, f64)> = Vec::new();
        if stats.count > 0 && stats.p95 > resolved.p95_latency_ms as f64 {
            exceeded.push((ViolationKind::LatencyP95, stats.p95, resolved.p95_latency_ms as f64));
        }
        if drain > resolved.battery_drain_per_ten_minutes {
            exceeded.push((ViolationKind::Drain, drain, resolved.battery_drain_per_ten_minutes));
        }
        if pressure.thermal_level > resolved.max_thermal_level as i8 {
            exceeded.push((
                ViolationKind::Thermal,
                f64::from(pressure.thermal_level),
                f64::from(resolved.max_thermal_level),
            ));
        }
        if pressure.heap_current_bytes > 0 && heap_mb > resolved.max_memory_mb as f64 {
            exceeded.push((ViolationKind::Memory, heap_mb, resolved.max_memory_mb as f64));
        }

        let violated_kinds: Vec<ViolationKind> = exceeded.iter().map(|(k, _, _)| *k).collect();
        workload
            .violating_since
            .retain(|kind, _| violated_kinds.contains(kind));
        for kind in &violated_kinds {
            workload.violating_since.entry(*kind).or_insert(now);
        }

        if exceeded.is_empty() {
            return false;
        }

        let name = workload.name.clone();
        let priority = workload.priority;

        // Mitigation: push every strictly lower-priority workload down one
        // level.
        let lower_ids: Vec<u64> = self
            .workloads
            .iter()
            .filter(|(other_id, other)| **other_id != id && other.priority < priority)
            .map(|(other_id, _)| *other_id)
            .collect();

        let mut qos_dirty = false;
        let mut all_lower_paused = true;
        for lower_id in &lower_ids {
            let Some(lower) = self.workloads.get_mut(lower_id) else {
                continue;
            };
            if let Some(level) = lower.qos.degrade() {
                tracing::info!(
                    violating = %name,
                    degraded = %lower.name,
                    ?level,
                    "degraded lower-priority workload to relieve budget violation"
                );
                qos_dirty = true;
            }
            if lower.qos.level() != QosLevel::Paused {
                all_lower_paused = false;
            }
        }

        let workload = &self.workloads[&id];
        for (kind, observed, limit) in exceeded {
            let persisted = workload
                .violating_since
                .get(&kind)
                .is_some_and(|since| now.duration_since(*since) >= self.config.cooldown);
            let severity = if all_lower_paused && persisted {
                ViolationSeverity::Critical
            } else {
                ViolationSeverity::Warn
            };

            tracing::warn!(
                workload = %name,
                ?kind,
                observed,
                limit,
                ?severity,
                "budget violation"
            );
            let _ = self.violation_tx.send(BudgetViolation {
                workload_id: id,
                workload: name.clone(),
                kind,
                observed,
                limit,
                severity,
                timestamp_ms: now_ms,
            });
        }

        qos_dirty
    }

    fn publish(&mut self) {
        let qos: QosMap = self
            .workloads
            .values()
            .map(|w| (w.name.clone(), w.qos.level()))
            .collect();
        let _ = self.qos_tx.send(qos);

        let workloads = self
            .workloads
            .iter_mut()
            .map(|(id, w)| WorkloadSnapshot {
                id: *id,
                name: w.name.clone(),
                priority: w.priority,
                qos: w.qos.level(),
                latency: w.latency.stats(),
                baseline: w.baseline.baseline().copied(),
                registered_at: w.registered_at,
                last_active: w.last_active,
            })
            .collect();
        let _ = self.snapshot_tx.send(SchedulerSnapshot { workloads });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            tick: Duration::from_millis(100),
            cooldown: Duration::from_secs(60),
            latency_window: 100,
            baseline_warmup: Duration::from_secs(40),
        }
    }

    fn test_sources() -> TelemetrySources {
        // Pin memory headroom well clear of every trigger so host memory
        // never leaks into the assertions.
        TelemetrySources {
            memory_headroom: Some(Arc::new(|| Some(4 * 1024 * 1024 * 1024))),
            ..TelemetrySources::default()
        }
    }

    async fn settle() {
        // Let the scheduler process at least one tick under the paused clock.
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn thermal_critical_pauses_within_one_tick() {
        let sources = test_sources();
        let scheduler = Scheduler::start(test_config(), sources.clone());
        let _workload = scheduler.register("vision", Priority::Medium, Some(Budget::default()));
        settle().await;

        sources.thermal.update_level(3);
        settle().await;

        let qos = scheduler.qos_updates().borrow().clone();
        assert_eq!(qos.get("vision"), Some(&QosLevel::Paused));

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn thermal_violation_escalates_to_critical_after_cooldown() {
        let sources = test_sources();
        let scheduler = Scheduler::start(test_config(), sources.clone());
        let mut violations = scheduler.subscribe_violations();
        let _workload = scheduler.register(
            "vision",
            Priority::Medium,
            Some(Budget {
                max_thermal_level: 2,
                ..Budget::default()
            }),
        );
        settle().await;

        sources.thermal.update_level(3);
        settle().await;

        let first = violations.recv().await.expect("violation");
        assert_eq!(first.kind, ViolationKind::Thermal);
        assert_eq!(first.severity, ViolationSeverity::Warn);
        assert_eq!(first.observed, 3.0);
        assert_eq!(first.limit, 2.0);

        // Keep the level high past the cooldown window.
        tokio::time::sleep(Duration::from_secs(61)).await;
        let mut last = None;
        loop {
            match violations.try_recv() {
                Ok(violation) => last = Some(violation),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        assert_eq!(
            last.expect("violations kept coming").severity,
            ViolationSeverity::Critical
        );

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn latency_violation_degrades_lower_priority_first() {
        let sources = test_sources();
        let scheduler = Scheduler::start(test_config(), sources);
        let high = scheduler.register(
            "inference",
            Priority::High,
            Some(Budget {
                p95_latency_ms: 10,
                ..Budget::default()
            }),
        );
        let _low = scheduler.register("background", Priority::Low, None);
        settle().await;

        for _ in 0..20 {
            high.record_latency(500.0);
        }
        settle().await;

        let qos = scheduler.qos_updates().borrow().clone();
        // The violator keeps its level; the lower-priority workload pays,
        // one step per violating tick.
        assert_eq!(qos.get("inference"), Some(&QosLevel::Full));
        assert!(qos.get("background").expect("registered") < &QosLevel::Full);

        // A persisting violation walks the lower workload all the way down.
        tokio::time::sleep(Duration::from_secs(1)).await;
        let qos = scheduler.qos_updates().borrow().clone();
        assert_eq!(qos.get("background"), Some(&QosLevel::Paused));
        assert_eq!(qos.get("inference"), Some(&QosLevel::Full));

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn restoration_steps_back_up_after_cooldown() {
        let sources = test_sources();
        let scheduler = Scheduler::start(test_config(), sources.clone());
        let _workload = scheduler.register("vision", Priority::Medium, None);
        settle().await;

        sources.thermal.update_level(2);
        settle().await;
        assert_eq!(
            scheduler.qos_updates().borrow().get("vision"),
            Some(&QosLevel::Reduced)
        );

        sources.thermal.update_level(0);
        // One cooldown of sustained clear restores one step (here: to Full).
        tokio::time::sleep(Duration::from_secs(62)).await;
        assert_eq!(
            scheduler.qos_updates().borrow().get("vision"),
            Some(&QosLevel::Full)
        );

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn paused_to_full_takes_three_cooldowns() {
        let sources = test_sources();
        let scheduler = Scheduler::start(test_config(), sources.clone());
        let _workload = scheduler.register("vision", Priority::Medium, None);
        settle().await;

        sources.thermal.update_level(3);
        settle().await;
        assert_eq!(
            scheduler.qos_updates().borrow().get("vision"),
            Some(&QosLevel::Paused)
        );

        sources.thermal.update_level(0);
        tokio::time::sleep(Duration::from_secs(62)).await;
        assert_eq!(
            scheduler.qos_updates().borrow().get("vision"),
            Some(&QosLevel::Minimal)
        );
        tokio::time::sleep(Duration::from_secs(62)).await;
        assert_eq!(
            scheduler.qos_updates().borrow().get("vision"),
            Some(&QosLevel::Reduced)
        );
        tokio::time::sleep(Duration::from_secs(62)).await;
        assert_eq!(
            scheduler.qos_updates().borrow().get("vision"),
            Some(&QosLevel::Full)
        );

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unregister_removes_the_workload() {
        let scheduler = Scheduler::start(test_config(), test_sources());
        let workload = scheduler.register("w", Priority::Medium, None);
        settle().await;
        assert_eq!(scheduler.snapshot().workloads.len(), 1);

        workload.unregister();
        settle().await;
        assert!(scheduler.snapshot().workloads.is_empty());
        assert!(scheduler.qos_updates().borrow().is_empty());

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn latency_samples_feed_the_snapshot_and_baseline() {
        let scheduler = Scheduler::start(test_config(), test_sources());
        let workload = scheduler.register("w", Priority::Medium, Some(Budget::default()));
        settle().await;

        for _ in 0..10 {
            workload.record_generation(100.0, 25.0);
        }
        settle().await;
        let snapshot = scheduler.snapshot();
        assert_eq!(snapshot.workloads[0].latency.count, 10);
        assert!(snapshot.workloads[0].baseline.is_none());

        // Warm-up elapses on the wall clock; the paused tokio clock does not
        // drive chrono, so feed more activity to cover the elapsed check.
        scheduler.shutdown().await;
    }
}
