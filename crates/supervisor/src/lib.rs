#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Adaptive runtime supervisor: telemetry collection, compute budgets, QoS
//! policy, the workload scheduler, and the frame backpressure queue.
//!
//! The supervisor never performs inference. Workers report samples; the
//! supervisor answers "should you throttle, pause, and at which QoS?" and
//! emits budget-violation events. All scheduler state lives on one task;
//! everything else talks to it through channels.

pub mod budget;
pub mod frame;
pub mod policy;
pub mod scheduler;
pub mod telemetry;

pub use budget::{Budget, BudgetProfile, MeasuredBaseline};
pub use frame::{Frame, FrameQueue};
pub use policy::{PressureSnapshot, QosEnvelope, QosLevel, ThrottleAdvice, throttle_advice};
pub use scheduler::{
    BudgetViolation, Priority, Scheduler, SchedulerConfig, SchedulerSnapshot, TelemetrySources,
    ViolationKind, ViolationSeverity, WorkloadHandle, WorkloadSnapshot,
};
pub use telemetry::{
    BatterySample, BatteryTracker, HeapSampler, LatencyStats, LatencyTracker, ThermalState,
    VisibilityFlag, VisibilityProbe,
};
