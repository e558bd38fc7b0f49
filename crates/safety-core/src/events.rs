use crate::bus::MotorId;
use serde::Serialize;
use std::sync::mpsc::Sender;

/// Safety notifications published by the monitor and the collision system.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SafetyEvent {
    TemperatureShutdown { motor: MotorId, temperature_c: f64 },
    StallDetected { motor: MotorId, current_ma: f64 },
    EmergencyStop,
    RecalibrationTriggered { total_collisions: u32 },
    RecalibrationFailed { reason: String },
}

impl SafetyEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TemperatureShutdown { .. } => "temperature_shutdown",
            Self::StallDetected { .. } => "stall_detected",
            Self::EmergencyStop => "emergency_stop",
            Self::RecalibrationTriggered { .. } => "recalibration_triggered",
            Self::RecalibrationFailed { .. } => "recalibration_failed",
        }
    }

    pub fn motor(&self) -> Option<&MotorId> {
        match self {
            Self::TemperatureShutdown { motor, .. } | Self::StallDetected { motor, .. } => {
                Some(motor)
            }
            _ => None,
        }
    }
}

/// Optional outlet for [`SafetyEvent`]s. A dropped receiver is not an error.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<Sender<SafetyEvent>>,
}

impl EventSink {
    pub fn new(tx: Sender<SafetyEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disconnected() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: SafetyEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                log::debug!("Safety event receiver dropped");
            }
        }
    }
}
