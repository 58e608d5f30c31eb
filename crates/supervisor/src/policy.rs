//! QoS levels, escalation/restoration policy, and throttle advice.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Escalation trigger thresholds (bytes of memory headroom).
const HEADROOM_REDUCED: u64 = 200 * 1024 * 1024;
const HEADROOM_MINIMAL: u64 = 100 * 1024 * 1024;
const HEADROOM_PAUSED: u64 = 50 * 1024 * 1024;

/// Battery-level escalation thresholds.
const BATTERY_REDUCED: f64 = 0.15;
const BATTERY_MINIMAL: f64 = 0.05;

/// Discrete service level. Transitions are the only way a workload's
/// capability envelope changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QosLevel {
    /// Everything off.
    Paused,
    /// Smallest useful envelope.
    Minimal,
    /// Degraded envelope.
    Reduced,
    /// Full capability.
    Full,
}

/// Capability envelope carried by a QoS level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QosEnvelope {
    /// Frames per second ceiling.
    pub max_fps: f64,
    /// Largest input dimension in pixels; `None` when paused.
    pub max_input_dim: Option<u32>,
    /// Token budget per request.
    pub max_tokens: u32,
}

impl QosLevel {
    /// The envelope for this level.
    pub fn envelope(self) -> QosEnvelope {
        match self {
            QosLevel::Full => QosEnvelope {
                max_fps: 2.0,
                max_input_dim: Some(640),
                max_tokens: 100,
            },
            QosLevel::Reduced => QosEnvelope {
                max_fps: 1.0,
                max_input_dim: Some(480),
                max_tokens: 75,
            },
            QosLevel::Minimal => QosEnvelope {
                max_fps: 1.0,
                max_input_dim: Some(320),
                max_tokens: 50,
            },
            QosLevel::Paused => QosEnvelope {
                max_fps: 0.0,
                max_input_dim: None,
                max_tokens: 0,
            },
        }
    }

    /// One step worse; saturates at `Paused`.
    pub fn degraded(self) -> QosLevel {
        match self {
            QosLevel::Full => QosLevel::Reduced,
            QosLevel::Reduced => QosLevel::Minimal,
            QosLevel::Minimal | QosLevel::Paused => QosLevel::Paused,
        }
    }

    /// One step better; saturates at `Full`.
    pub fn restored(self) -> QosLevel {
        match self {
            QosLevel::Paused => QosLevel::Minimal,
            QosLevel::Minimal => QosLevel::Reduced,
            QosLevel::Reduced | QosLevel::Full => QosLevel::Full,
        }
    }
}

/// Telemetry inputs to one policy decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct PressureSnapshot {
    /// Thermal level: -1 unavailable, 0..=3 otherwise.
    pub thermal_level: i8,
    /// Battery charge in [0, 1]; `None` when unknown.
    pub battery_level: Option<f64>,
    /// Memory headroom in bytes; `None` when unknown.
    pub available_memory_bytes: Option<u64>,
    /// Current heap sample in bytes (0 = unknown).
    pub heap_current_bytes: u64,
    /// Session heap peak in bytes.
    pub heap_peak_bytes: u64,
    /// Whether the host surface is hidden.
    pub hidden: bool,
}

impl PressureSnapshot {
    /// The worst QoS level any trigger demands, or `None` when every trigger
    /// is clear.
    pub fn escalation_target(&self) -> Option<QosLevel> {
        let mut target: Option<QosLevel> = None;
        let mut demand = |level: QosLevel| {
            target = Some(match target {
                Some(current) => current.min(level),
                None => level,
            });
        };

        if self.thermal_level >= 3 {
            demand(QosLevel::Paused);
        } else if self.thermal_level >= 2 {
            demand(QosLevel::Reduced);
        }

        if let Some(level) = self.battery_level {
            if level < BATTERY_MINIMAL {
                demand(QosLevel::Minimal);
            } else if level < BATTERY_REDUCED {
                demand(QosLevel::Reduced);
            }
        }

        if let Some(headroom) = self.available_memory_bytes {
            if headroom < HEADROOM_PAUSED {
                demand(QosLevel::Paused);
            } else if headroom < HEADROOM_MINIMAL {
                demand(QosLevel::Minimal);
            } else if headroom < HEADROOM_REDUCED {
                demand(QosLevel::Reduced);
            }
        }

        target
    }
}

/// Per-workload QoS state: immediate escalation, cooldown-gated stepwise
/// restoration.
///
/// Escalation applies the moment a trigger fires. Restoration requires the
/// full cooldown of sustained "no pressure" per step, so recovery from
/// `Paused` to `Full` takes at least three cooldowns; a single clear sample
/// never bounces the level back up.
#[derive(Debug)]
pub(crate) struct QosController {
    level: QosLevel,
    cooldown: Duration,
    clear_since: Option<Instant>,
}

impl QosController {
    /// Default restoration cooldown per step.
    pub(crate) const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

    pub(crate) fn new(cooldown: Duration) -> Self {
        Self {
            level: QosLevel::Full,
            cooldown,
            clear_since: None,
        }
    }

    pub(crate) fn level(&self) -> QosLevel {
        self.level
    }

    /// Apply one tick's pressure reading. Returns the new level when it
    /// changed.
    pub(crate) fn apply(&mut self, target: Option<QosLevel>, now: Instant) -> Option<QosLevel> {
        match target {
            Some(target) => {
                self.clear_since = None;
                if target < self.level {
                    self.level = target;
                    return Some(self.level);
                }
                None
            }
            None => {
                let since = *self.clear_since.get_or_insert(now);
                if self.level < QosLevel::Full && now.duration_since(since) >= self.cooldown {
                    self.level = self.level.restored();
                    // Each further step takes a fresh cooldown.
                    self.clear_since = Some(now);
                    return Some(self.level);
                }
                None
            }
        }
    }

    /// Forced one-step degradation (scheduler mitigation). Returns the new
    /// level when it changed.
    pub(crate) fn degrade(&mut self) -> Option<QosLevel> {
        let next = self.level.degraded();
        if next == self.level {
            return None;
        }
        self.level = next;
        self.clear_since = None;
        Some(self.level)
    }
}

/// Combined advice for callers that do not consume discrete QoS levels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleAdvice {
    /// True when any escalation trigger crossed its threshold.
    pub should_throttle: bool,
    /// Multiplicative factor in [0, 1] to apply to work rate.
    pub throttle_factor: f64,
    /// Human-readable contributing pressure sources.
    pub reasons: Vec<String>,
}

/// Compose the throttle recommendation from a pressure snapshot.
pub fn throttle_advice(pressure: &PressureSnapshot) -> ThrottleAdvice {
    let mut factor = 1.0;
    let mut reasons = Vec::new();

    let thermal_factor = match pressure.thermal_level {
        3 => 0.3,
        2 => 0.5,
        1 => 0.8,
        _ => 1.0,
    };
    if thermal_factor < 1.0 {
        reasons.push(format!("thermal level {}", pressure.thermal_level));
    }
    factor *= thermal_factor;

    if let Some(level) = pressure.battery_level {
        let battery_factor = if level >= 0.5 {
            1.0
        } else if level >= 0.2 {
            0.9
        } else {
            0.6
        };
        if battery_factor < 1.0 {
            reasons.push(format!("battery at {:.0}%", level * 100.0));
        }
        factor *= battery_factor;
    }

    if pressure.heap_peak_bytes > 0
        && pressure.heap_current_bytes as f64 > 0.9 * pressure.heap_peak_bytes as f64
    {
        reasons.push("heap near session peak".to_string());
        factor *= 0.7;
    }

    if pressure.hidden {
        reasons.push("surface hidden".to_string());
        factor *= 0.3;
    }

    ThrottleAdvice {
        should_throttle: pressure.escalation_target().is_some(),
        throttle_factor: factor,
        reasons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_table_matches_policy() {
        assert_eq!(QosLevel::Full.envelope().max_tokens, 100);
        assert_eq!(QosLevel::Reduced.envelope().max_input_dim, Some(480));
        assert_eq!(QosLevel::Minimal.envelope().max_fps, 1.0);
        assert_eq!(QosLevel::Paused.envelope().max_tokens, 0);
        assert_eq!(QosLevel::Paused.envelope().max_input_dim, None);
    }

    #[test]
    fn escalation_targets_follow_the_trigger_table() {
        let clear = PressureSnapshot::default();
        assert_eq!(clear.escalation_target(), None);

        let thermal_serious = PressureSnapshot {
            thermal_level: 2,
            ..Default::default()
        };
        assert_eq!(thermal_serious.escalation_target(), Some(QosLevel::Reduced));

        let thermal_critical = PressureSnapshot {
            thermal_level: 3,
            ..Default::default()
        };
        assert_eq!(thermal_critical.escalation_target(), Some(QosLevel::Paused));

        let low_battery = PressureSnapshot {
            battery_level: Some(0.10),
            ..Default::default()
        };
        assert_eq!(low_battery.escalation_target(), Some(QosLevel::Reduced));

        let dying_battery = PressureSnapshot {
            battery_level: Some(0.04),
            ..Default::default()
        };
        assert_eq!(dying_battery.escalation_target(), Some(QosLevel::Minimal));

        let tight_memory = PressureSnapshot {
            available_memory_bytes: Some(150 * 1024 * 1024),
            ..Default::default()
        };
        assert_eq!(tight_memory.escalation_target(), Some(QosLevel::Reduced));

        let no_memory = PressureSnapshot {
            available_memory_bytes: Some(10 * 1024 * 1024),
            ..Default::default()
        };
        assert_eq!(no_memory.escalation_target(), Some(QosLevel::Paused));

        // The worst trigger wins.
        let combined = PressureSnapshot {
            thermal_level: 2,
            battery_level: Some(0.04),
            available_memory_bytes: Some(10 * 1024 * 1024),
            ..Default::default()
        };
        assert_eq!(combined.escalation_target(), Some(QosLevel::Paused));
    }

    #[test]
    fn escalation_is_immediate_and_restoration_is_stepwise() {
        let cooldown = Duration::from_secs(60);
        let mut qos = QosController::new(cooldown);
        let t0 = Instant::now();

        assert_eq!(qos.apply(Some(QosLevel::Paused), t0), Some(QosLevel::Paused));

        // Pressure cleared: nothing moves before the cooldown.
        assert_eq!(qos.apply(None, t0 + Duration::from_secs(1)), None);
        assert_eq!(qos.apply(None, t0 + Duration::from_secs(59)), None);

        // One step per sustained cooldown.
        assert_eq!(
            qos.apply(None, t0 + Duration::from_secs(61)),
            Some(QosLevel::Minimal)
        );
        assert_eq!(qos.apply(None, t0 + Duration::from_secs(90)), None);
        assert_eq!(
            qos.apply(None, t0 + Duration::from_secs(121)),
            Some(QosLevel::Reduced)
        );
        assert_eq!(
            qos.apply(None, t0 + Duration::from_secs(181)),
            Some(QosLevel::Full)
        );
        // Saturates at Full.
        assert_eq!(qos.apply(None, t0 + Duration::from_secs(300)), None);
    }

    #[test]
    fn pressure_mid_restoration_resets_the_clock() {
        let mut qos = QosController::new(Duration::from_secs(60));
        let t0 = Instant::now();

        qos.apply(Some(QosLevel::Minimal), t0);
        qos.apply(None, t0 + Duration::from_secs(61));
        assert_eq!(qos.level(), QosLevel::Reduced);

        // Trigger re-fires: escalate immediately, restoration clock resets.
        qos.apply(Some(QosLevel::Minimal), t0 + Duration::from_secs(62));
        assert_eq!(qos.level(), QosLevel::Minimal);
        assert_eq!(qos.apply(None, t0 + Duration::from_secs(100)), None);
        assert_eq!(
            qos.apply(None, t0 + Duration::from_secs(123)),
            Some(QosLevel::Reduced)
        );
    }

    #[test]
    fn escalation_never_improves_the_level() {
        let mut qos = QosController::new(Duration::from_secs(60));
        let t0 = Instant::now();
        qos.apply(Some(QosLevel::Paused), t0);
        // A weaker trigger does not restore anything.
        assert_eq!(qos.apply(Some(QosLevel::Reduced), t0 + Duration::from_secs(1)), None);
        assert_eq!(qos.level(), QosLevel::Paused);
    }

    #[test]
    fn forced_degradation_steps_down_and_saturates() {
        let mut qos = QosController::new(Duration::from_secs(60));
        assert_eq!(qos.degrade(), Some(QosLevel::Reduced));
        assert_eq!(qos.degrade(), Some(QosLevel::Minimal));
        assert_eq!(qos.degrade(), Some(QosLevel::Paused));
        assert_eq!(qos.degrade(), None);
    }

    #[test]
    fn throttle_factor_composes_multiplicatively() {
        let pressure = PressureSnapshot {
            thermal_level: 2,
            battery_level: Some(0.3),
            heap_current_bytes: 95,
            heap_peak_bytes: 100,
            hidden: true,
            ..Default::default()
        };
        let advice = throttle_advice(&pressure);
        // 0.5 (thermal) * 0.9 (battery) * 0.7 (heap) * 0.3 (hidden)
        assert!((advice.throttle_factor - 0.5 * 0.9 * 0.7 * 0.3).abs() < 1e-9);
        assert!(advice.should_throttle);
        assert_eq!(advice.reasons.len(), 4);
    }

    #[test]
    fn hidden_tab_alone_throttles_rate_but_not_qos() {
        let pressure = PressureSnapshot {
            hidden: true,
            battery_level: Some(0.9),
            ..Default::default()
        };
        let advice = throttle_advice(&pressure);
        assert!(!advice.should_throttle);
        assert!((advice.throttle_factor - 0.3).abs() < 1e-9);
    }
}
