//! Contract between the safety core and the servo bus driver.
//!
//! The driver owns the transport and serializes its own reads and writes, so
//! every method takes `&self` and implementations are shared behind an `Arc`.

use crate::error::BusError;
use crate::tags::{self, Tag};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

/// Name of a motor on the bus (e.g. `"shoulder_pan"`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MotorId(String);

impl MotorId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MotorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for MotorId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MotorId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for MotorId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// One numeric value per motor, as returned by a batch read.
pub type Readings = BTreeMap<MotorId, f64>;

/// Batch-readable telemetry registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Telemetry {
    Temperature,
    Current,
    Position,
    Load,
    Voltage,
}

impl Telemetry {
    pub fn tag(self) -> Tag {
        match self {
            Self::Temperature => tags::PRESENT_TEMPERATURE,
            Self::Current => tags::PRESENT_CURRENT,
            Self::Position => tags::PRESENT_POSITION,
            Self::Load => tags::PRESENT_LOAD,
            Self::Voltage => tags::PRESENT_VOLTAGE,
        }
    }
}

/// Single-motor read/write registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    GoalPosition,
    GoalVelocity,
    TorqueLimit,
}

impl Register {
    pub fn tag(self) -> Tag {
        match self {
            Self::GoalPosition => tags::GOAL_POSITION,
            Self::GoalVelocity => tags::GOAL_VELOCITY,
            Self::TorqueLimit => tags::TORQUE_LIMIT,
        }
    }
}

/// Calibrated range of motion for one motor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotorRange {
    pub range_min: f64,
    pub range_max: f64,
}

impl MotorRange {
    pub fn new(range_min: f64, range_max: f64) -> Self {
        Self {
            range_min,
            range_max,
        }
    }

    pub fn clamp(&self, position: f64) -> f64 {
        position.clamp(self.range_min, self.range_max)
    }

    /// True when `position` lies within `margin` of either bound.
    pub fn near_limit(&self, position: f64, margin: f64) -> bool {
        position <= self.range_min + margin || position >= self.range_max - margin
    }
}

pub trait MotorBus: Send + Sync {
    /// All motors known to the bus. Consulted once when a component is built.
    fn motors(&self) -> Vec<MotorId>;

    fn sync_read(&self, key: Telemetry) -> Result<Readings, BusError>;

    fn read(&self, key: Register, motor: &MotorId) -> Result<f64, BusError>;

    fn write(&self, key: Register, motor: &MotorId, value: f64) -> Result<(), BusError>;

    /// Disable one motor, or every motor when `motor` is `None`.
    fn disable_torque(&self, motor: Option<&MotorId>) -> Result<(), BusError>;

    fn enable_torque(&self) -> Result<(), BusError>;

    /// Calibrated range, when the motor has been calibrated.
    fn calibration(&self, _motor: &MotorId) -> Option<MotorRange> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readings_lookup_by_str() {
        let mut readings = Readings::new();
        readings.insert(MotorId::from("elbow_flex"), 12.5);
        assert_eq!(readings.get("elbow_flex"), Some(&12.5));
        assert_eq!(readings.get("gripper"), None);
    }

    #[test]
    fn range_near_limit_checks_both_bounds() {
        let range = MotorRange::new(0.0, 100.0);
        assert!(range.near_limit(3.0, 5.0));
        assert!(range.near_limit(96.0, 5.0));
        assert!(!range.near_limit(50.0, 5.0));
        assert_eq!(range.clamp(120.0), 100.0);
    }

    #[test]
    fn register_names_match_control_table() {
        assert_eq!(Telemetry::Temperature.tag().key, "Present_Temperature");
        assert_eq!(Register::TorqueLimit.tag().key, "Torque_Limit");
    }
}
