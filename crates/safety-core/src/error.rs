//! Error types shared across the safety core.

use std::path::PathBuf;
use thiserror::Error;

/// Construction-time misconfiguration. Returned by constructors and config loaders.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Temperature bands must ascend (warning {warning} < critical {critical} < shutdown {shutdown})")]
    TemperatureOrder {
        warning: f64,
        critical: f64,
        shutdown: f64,
    },

    #[error("Cooldown temperature {cooldown} must be below the warning band {warning}")]
    CooldownAboveWarning { cooldown: f64, warning: f64 },

    #[error("{field} must be finite and positive (got {value})")]
    NotPositive { field: &'static str, value: f64 },

    #[error("{field} must be at least 1")]
    ZeroCount { field: &'static str },

    #[error("{field} = {value} is outside [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Bus exposes no motors")]
    NoMotors,

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Transport-level failure reported by a [`MotorBus`](crate::bus::MotorBus).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BusError {
    #[error("Bus transport failure: {0}")]
    Transport(String),

    #[error("Unknown motor '{0}'")]
    UnknownMotor(String),

    #[error("Bus is not connected")]
    Disconnected,
}

/// Failure of the recalibration procedure. Always logged, never propagated.
#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("Operator did not confirm recalibration: {0}")]
    OperatorAborted(String),

    #[error("Calibration routine failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Failure of a commanded move. Goal moves record it in their result instead
/// of returning it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MotionError {
    #[error("Emergency stop is active")]
    EmergencyStopActive,

    #[error("No position reading for motor '{0}'")]
    MissingReading(String),

    #[error(transparent)]
    Bus(#[from] BusError),
}
