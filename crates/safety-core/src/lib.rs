pub mod bus;
#[cfg(any(test, feature = "simulation"))]
pub mod bus_sim;
pub mod collision;
pub mod config;
pub mod error;
pub mod events;
pub mod monitor;
pub mod motion;
pub mod performance;
pub mod safety;
pub mod tags;
pub mod timebase;

pub use bus::{MotorBus, MotorId, MotorRange, Readings, Register, Telemetry};
#[cfg(any(test, feature = "simulation"))]
pub use bus_sim::{BusCommand, SimulatedArm};
pub use collision::{
    AbortReason, CollisionAction, CollisionDetector, CollisionPhase, NoKinematics,
    PositionEstimator,
};
pub use config::{CollisionConfig, SafetyThresholds};
pub use error::{BusError, CalibrationError, ConfigError, MotionError};
pub use events::{EventSink, SafetyEvent};
pub use monitor::{MonitorGuard, MotorReport, MotorSafetyMonitor, SafetyReport};
pub use motion::{Calibrator, MoveResult, SmartCollisionSafetySystem};
pub use performance::PerformanceMetrics;
pub use safety::{SafetyStats, SafetyStatus, Violation, ViolationKind};
pub use timebase::{Clock, ManualClock, TimeBase};
