//! Immutable safety and collision configuration.
//!
//! Both records are validated once at construction; after that they are only
//! read, so they can be shared between the monitor thread and a goal move
//! without locking.

use crate::error::ConfigError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Temperature, current, position and timing limits for [`MotorSafetyMonitor`](crate::MotorSafetyMonitor).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyThresholds {
    pub temperature_warning_c: f64,
    pub temperature_critical_c: f64,
    pub temperature_shutdown_c: f64,

    pub current_stall_threshold_ma: f64,
    pub current_stall_duration_s: f64,
    pub current_spike_threshold_ma: f64,

    pub soft_start_duration_s: f64,
    pub soft_start_steps: u32,

    /// Distance from a calibrated bound at which motion is damped.
    pub position_margin: f64,
    /// Value written to `Goal_Velocity` inside the position margin.
    pub soft_limit_velocity: f64,

    pub max_velocity: f64,

    pub monitor_frequency_hz: f64,

    pub cooldown_temperature_c: f64,
    /// Reserved: validated and serialized, not read by the monitor.
    pub recovery_wait_s: f64,
}

impl Default for SafetyThresholds {
    fn default() -> Self {
        Self {
            temperature_warning_c: 40.0,
            temperature_critical_c: 45.0,
            temperature_shutdown_c: 50.0,
            current_stall_threshold_ma: 800.0,
            current_stall_duration_s: 0.5,
            current_spike_threshold_ma: 1200.0,
            soft_start_duration_s: 1.0,
            soft_start_steps: 10,
            position_margin: 5.0,
            soft_limit_velocity: 50.0,
            max_velocity: 180.0,
            monitor_frequency_hz: 10.0,
            cooldown_temperature_c: 35.0,
            recovery_wait_s: 5.0,
        }
    }
}

impl SafetyThresholds {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bands = [
            self.temperature_warning_c,
            self.temperature_critical_c,
            self.temperature_shutdown_c,
            self.cooldown_temperature_c,
        ];
        if bands.iter().any(|t| !t.is_finite())
            || !(self.temperature_warning_c < self.temperature_critical_c
                && self.temperature_critical_c < self.temperature_shutdown_c)
        {
            return Err(ConfigError::TemperatureOrder {
                warning: self.temperature_warning_c,
                critical: self.temperature_critical_c,
                shutdown: self.temperature_shutdown_c,
            });
        }
        if self.cooldown_temperature_c >= self.temperature_warning_c {
            return Err(ConfigError::CooldownAboveWarning {
                cooldown: self.cooldown_temperature_c,
                warning: self.temperature_warning_c,
            });
        }

        require_positive("current_stall_threshold_ma", self.current_stall_threshold_ma)?;
        require_positive("current_stall_duration_s", self.current_stall_duration_s)?;
        require_positive("current_spike_threshold_ma", self.current_spike_threshold_ma)?;
        require_positive("soft_start_duration_s", self.soft_start_duration_s)?;
        require_positive("max_velocity", self.max_velocity)?;
        require_positive("monitor_frequency_hz", self.monitor_frequency_hz)?;
        require_non_negative("position_margin", self.position_margin)?;
        require_non_negative("soft_limit_velocity", self.soft_limit_velocity)?;
        require_non_negative("recovery_wait_s", self.recovery_wait_s)?;

        if self.soft_start_steps == 0 {
            return Err(ConfigError::ZeroCount {
                field: "soft_start_steps",
            });
        }
        Ok(())
    }

    pub fn monitor_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.monitor_frequency_hz)
    }

    /// Delay between consecutive soft-start setpoints.
    pub fn soft_start_step_interval(&self) -> Duration {
        Duration::from_secs_f64(self.soft_start_duration_s / f64::from(self.soft_start_steps.max(1)))
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let thresholds: Self = load_json(path)?;
        thresholds.validate()?;
        Ok(thresholds)
    }
}

/// Limits for [`CollisionDetector`](crate::CollisionDetector).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollisionConfig {
    /// Normalized load (0-1) above which the motor is considered resisting.
    pub torque_threshold: f64,
    pub current_threshold_ma: f64,
    /// Resistance must persist this long before a collision is confirmed.
    pub collision_duration_s: f64,

    pub backoff_distance: f64,
    /// Reserved: validated and serialized, not read by the detector.
    pub backoff_speed: f64,
    pub cooldown_period_s: f64,
    pub max_retries: u32,

    /// Reserved for kinematic detection: validated and serialized, not read.
    pub position_error_threshold: f64,
    pub consecutive_collisions_for_recal: u32,
    pub time_since_last_calibration_s: f64,

    /// Polling rate the adaptive controller starts from.
    pub initial_frequency_hz: f64,
}

impl Default for CollisionConfig {
    fn default() -> Self {
        Self {
            torque_threshold: 0.3,
            current_threshold_ma: 900.0,
            collision_duration_s: 0.3,
            backoff_distance: 0.1,
            backoff_speed: 0.5,
            cooldown_period_s: 2.0,
            max_retries: 3,
            position_error_threshold: 0.05,
            consecutive_collisions_for_recal: 5,
            time_since_last_calibration_s: 3600.0,
            initial_frequency_hz: 2.0,
        }
    }
}

impl CollisionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.torque_threshold > 0.0 && self.torque_threshold <= 1.0) {
            return Err(ConfigError::OutOfRange {
                field: "torque_threshold",
                value: self.torque_threshold,
                min: 0.0,
                max: 1.0,
            });
        }
        require_positive("current_threshold_ma", self.current_threshold_ma)?;
        require_positive("collision_duration_s", self.collision_duration_s)?;
        require_non_negative("backoff_distance", self.backoff_distance)?;
        require_positive("backoff_speed", self.backoff_speed)?;
        require_non_negative("cooldown_period_s", self.cooldown_period_s)?;
        require_positive("position_error_threshold", self.position_error_threshold)?;
        require_positive(
            "time_since_last_calibration_s",
            self.time_since_last_calibration_s,
        )?;

        if self.max_retries == 0 {
            return Err(ConfigError::ZeroCount {
                field: "max_retries",
            });
        }
        if self.consecutive_collisions_for_recal == 0 {
            return Err(ConfigError::ZeroCount {
                field: "consecutive_collisions_for_recal",
            });
        }
        if !(0.5..=10.0).contains(&self.initial_frequency_hz) {
            return Err(ConfigError::OutOfRange {
                field: "initial_frequency_hz",
                value: self.initial_frequency_hz,
                min: 0.5,
                max: 10.0,
            });
        }
        Ok(())
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = load_json(path)?;
        config.validate()?;
        Ok(config)
    }
}

fn require_positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NotPositive { field, value })
    }
}

fn require_non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NotPositive { field, value })
    }
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(SafetyThresholds::default().validate().is_ok());
        assert!(CollisionConfig::default().validate().is_ok());
    }

    #[test]
    fn default_values_match_servo_ratings() {
        let t = SafetyThresholds::default();
        assert_eq!(t.temperature_warning_c, 40.0);
        assert_eq!(t.temperature_critical_c, 45.0);
        assert_eq!(t.temperature_shutdown_c, 50.0);
        assert_eq!(t.current_stall_threshold_ma, 800.0);
        assert_eq!(t.current_stall_duration_s, 0.5);
        assert_eq!(t.soft_start_steps, 10);
    }

    #[test]
    fn rejects_unordered_temperature_bands() {
        let t = SafetyThresholds {
            temperature_critical_c: 55.0,
            ..Default::default()
        };
        assert!(matches!(
            t.validate(),
            Err(ConfigError::TemperatureOrder { .. })
        ));
    }

    #[test]
    fn rejects_zero_soft_start_steps() {
        let t = SafetyThresholds {
            soft_start_steps: 0,
            ..Default::default()
        };
        assert!(matches!(t.validate(), Err(ConfigError::ZeroCount { .. })));
    }

    #[test]
    fn rejects_zero_retries() {
        let c = CollisionConfig {
            max_retries: 0,
            ..Default::default()
        };
        assert!(matches!(c.validate(), Err(ConfigError::ZeroCount { .. })));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let t: SafetyThresholds =
            serde_json::from_str(r#"{"temperature_warning_c": 38.0, "monitor_frequency_hz": 2.0}"#)
                .unwrap();
        assert_eq!(t.temperature_warning_c, 38.0);
        assert_eq!(t.monitor_frequency_hz, 2.0);
        assert_eq!(t.temperature_shutdown_c, 50.0);
        assert!(t.validate().is_ok());
    }

    #[test]
    fn reserved_fields_are_validated_and_kept() {
        let c: CollisionConfig =
            serde_json::from_str(r#"{"backoff_speed": 0.8, "position_error_threshold": 0.1}"#)
                .unwrap();
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["backoff_speed"], 0.8);
        assert_eq!(json["position_error_threshold"], 0.1);

        let c = CollisionConfig {
            backoff_speed: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            c.validate(),
            Err(ConfigError::NotPositive {
                field: "backoff_speed",
                ..
            })
        ));
        let t = SafetyThresholds {
            recovery_wait_s: -1.0,
            ..Default::default()
        };
        assert!(t.validate().is_err());
    }

    #[test]
    fn monitor_period_follows_frequency() {
        let t = SafetyThresholds {
            monitor_frequency_hz: 4.0,
            ..Default::default()
        };
        assert_eq!(t.monitor_period(), Duration::from_millis(250));
        assert_eq!(
            SafetyThresholds::default().soft_start_step_interval(),
            Duration::from_millis(100)
        );
    }
}
