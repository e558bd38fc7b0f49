//! Per-motor safety state and the rules evaluated on every poll cycle.
//!
//! The rules are pure with respect to the bus: they update a
//! [`MotorSafetyState`], record violations, and return the corrective
//! [`MonitorAction`]s for the monitor to apply afterwards. Violations are
//! therefore always recorded before anything acts on them.

use crate::bus::{MotorId, MotorRange};
use crate::config::SafetyThresholds;
use crate::events::SafetyEvent;
use crate::timebase::{secs_to_us, us_to_secs};
use serde::Serialize;
use std::collections::VecDeque;

pub const TEMPERATURE_HISTORY_LEN: usize = 100;

/// Torque-limit scale applied while a motor sits in the critical temperature band.
pub const CRITICAL_TEMPERATURE_TORQUE_SCALE: f64 = 0.5;
/// Torque-limit scale applied on a single current spike (a 30% reduction).
pub const CURRENT_SPIKE_TORQUE_SCALE: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyStatus {
    #[default]
    Normal,
    Warning,
    Critical,
    EmergencyStop,
}

impl SafetyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::EmergencyStop => "emergency_stop",
        }
    }

    /// Numeric encoding for gauges (0=normal .. 3=emergency_stop).
    pub fn level(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Warning => 1,
            Self::Critical => 2,
            Self::EmergencyStop => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    TemperatureWarning,
    TemperatureCritical,
    CurrentStall,
    VelocityLimit,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub time_us: u64,
    pub kind: ViolationKind,
    /// The reading that crossed the threshold.
    pub value: f64,
    pub duration_s: Option<f64>,
}

/// Mutable safety state for one motor. Owned by the monitor.
#[derive(Debug, Clone)]
pub struct MotorSafetyState {
    pub motor: MotorId,
    pub temperature_c: f64,
    pub current_ma: f64,
    pub position: f64,
    pub velocity: f64,

    pub high_current_start_us: Option<u64>,
    pub is_stalled: bool,

    pub temperature_history: VecDeque<f64>,
    pub max_temp_reached_c: f64,
    /// Latched after a temperature shutdown until the motor cools down.
    pub thermal_shutdown: bool,

    pub violations: Vec<Violation>,
    pub last_violation_us: Option<u64>,

    pub soft_start_active: bool,
    pub soft_start_progress: f64,

    last_sample_us: Option<u64>,
}

impl MotorSafetyState {
    pub fn new(motor: MotorId) -> Self {
        Self {
            motor,
            temperature_c: 0.0,
            current_ma: 0.0,
            position: 0.0,
            velocity: 0.0,
            high_current_start_us: None,
            is_stalled: false,
            temperature_history: VecDeque::with_capacity(TEMPERATURE_HISTORY_LEN),
            max_temp_reached_c: 0.0,
            thermal_shutdown: false,
            violations: Vec::new(),
            last_violation_us: None,
            soft_start_active: false,
            soft_start_progress: 0.0,
            last_sample_us: None,
        }
    }

    fn record(&mut self, stats: &mut SafetyStats, violation: Violation) {
        stats.total_violations += 1;
        match violation.kind {
            ViolationKind::TemperatureWarning | ViolationKind::TemperatureCritical => {
                stats.temperature_warnings += 1
            }
            ViolationKind::CurrentStall => stats.current_stalls += 1,
            _ => {}
        }
        self.last_violation_us = Some(violation.time_us);
        self.violations.push(violation);
    }

    fn push_temperature(&mut self, temperature_c: f64) {
        if self.temperature_history.len() == TEMPERATURE_HISTORY_LEN {
            self.temperature_history.pop_front();
        }
        self.temperature_history.push_back(temperature_c);
        self.max_temp_reached_c = self.max_temp_reached_c.max(temperature_c);
    }
}

/// Aggregate counters kept by the monitor.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SafetyStats {
    pub total_violations: u64,
    pub temperature_warnings: u64,
    pub current_stalls: u64,
    pub current_spikes: u64,
    pub emergency_stops: u64,
    pub poll_cycles: u64,
    pub poll_failures: u64,
    pub uptime_s: f64,
}

/// Corrective step decided by a rule, applied to the bus by the monitor.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorAction {
    DisableTorque(MotorId),
    ReduceTorque { motor: MotorId, scale: f64 },
    LimitVelocity { motor: MotorId, velocity: f64 },
    Notify(SafetyEvent),
}

/// One motor's readings from a poll cycle.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub temperature_c: f64,
    pub current_ma: f64,
    pub position: f64,
}

/// Apply temperature, current and position rules, in that order, to one motor.
pub fn evaluate_motor(
    state: &mut MotorSafetyState,
    sample: Sample,
    range: Option<MotorRange>,
    thresholds: &SafetyThresholds,
    stats: &mut SafetyStats,
    now_us: u64,
    actions: &mut Vec<MonitorAction>,
) {
    state.temperature_c = sample.temperature_c;
    state.current_ma = sample.current_ma.abs();

    check_temperature(state, thresholds, stats, now_us, actions);
    check_current(state, thresholds, stats, now_us, actions);
    check_position(state, sample.position, range, thresholds, stats, now_us, actions);
}

fn check_temperature(
    state: &mut MotorSafetyState,
    t: &SafetyThresholds,
    stats: &mut SafetyStats,
    now_us: u64,
    actions: &mut Vec<MonitorAction>,
) {
    let temp = state.temperature_c;
    state.push_temperature(temp);

    if state.thermal_shutdown && temp < t.cooldown_temperature_c {
        log::info!("{}: cooled to {:.1}C, shutdown latch cleared", state.motor, temp);
        state.thermal_shutdown = false;
    }

    if temp >= t.temperature_shutdown_c {
        state.record(stats, violation(now_us, ViolationKind::TemperatureCritical, temp));
        if !state.thermal_shutdown {
            log::error!("Temperature SHUTDOWN for {}: {:.1}C", state.motor, temp);
            state.thermal_shutdown = true;
            actions.push(MonitorAction::DisableTorque(state.motor.clone()));
            actions.push(MonitorAction::Notify(SafetyEvent::TemperatureShutdown {
                motor: state.motor.clone(),
                temperature_c: temp,
            }));
        }
    } else if temp >= t.temperature_critical_c {
        log::warn!("Temperature CRITICAL for {}: {:.1}C", state.motor, temp);
        state.record(stats, violation(now_us, ViolationKind::TemperatureCritical, temp));
        actions.push(MonitorAction::ReduceTorque {
            motor: state.motor.clone(),
            scale: CRITICAL_TEMPERATURE_TORQUE_SCALE,
        });
    } else if temp >= t.temperature_warning_c {
        log::warn!("Temperature WARNING for {}: {:.1}C", state.motor, temp);
        state.record(stats, violation(now_us, ViolationKind::TemperatureWarning, temp));
    }
}

fn check_current(
    state: &mut MotorSafetyState,
    t: &SafetyThresholds,
    stats: &mut SafetyStats,
    now_us: u64,
    actions: &mut Vec<MonitorAction>,
) {
    let current = state.current_ma;

    if current >= t.current_spike_threshold_ma {
        log::warn!("Current spike detected for {}: {:.0}mA", state.motor, current);
        stats.current_spikes += 1;
        actions.push(MonitorAction::ReduceTorque {
            motor: state.motor.clone(),
            scale: CURRENT_SPIKE_TORQUE_SCALE,
        });
    } else if current >= t.current_stall_threshold_ma {
        let Some(start_us) = state.high_current_start_us else {
            state.high_current_start_us = Some(now_us);
            return;
        };
        let held_us = now_us.saturating_sub(start_us);
        if held_us >= secs_to_us(t.current_stall_duration_s) && !state.is_stalled {
            let duration_s = us_to_secs(held_us);
            log::error!(
                "Motor stall detected for {}: {:.0}mA for {:.2}s",
                state.motor,
                current,
                duration_s
            );
            state.is_stalled = true;
            state.record(
                stats,
                Violation {
                    time_us: now_us,
                    kind: ViolationKind::CurrentStall,
                    value: current,
                    duration_s: Some(duration_s),
                },
            );
            actions.push(MonitorAction::DisableTorque(state.motor.clone()));
            actions.push(MonitorAction::Notify(SafetyEvent::StallDetected {
                motor: state.motor.clone(),
                current_ma: current,
            }));
        }
    } else {
        state.high_current_start_us = None;
        state.is_stalled = false;
    }
}

fn check_position(
    state: &mut MotorSafetyState,
    position: f64,
    range: Option<MotorRange>,
    t: &SafetyThresholds,
    stats: &mut SafetyStats,
    now_us: u64,
    actions: &mut Vec<MonitorAction>,
) {
    if let Some(prev_us) = state.last_sample_us {
        let dt_s = us_to_secs(now_us.saturating_sub(prev_us));
        if dt_s > 0.0 {
            state.velocity = (position - state.position) / dt_s;
            if state.velocity.abs() > t.max_velocity {
                log::warn!(
                    "Velocity limit exceeded for {}: {:.1}/s",
                    state.motor,
                    state.velocity
                );
                state.record(
                    stats,
                    violation(now_us, ViolationKind::VelocityLimit, state.velocity),
                );
            }
        }
    }
    state.position = position;
    state.last_sample_us = Some(now_us);

    let Some(range) = range else {
        return;
    };
    if range.near_limit(position, t.position_margin) {
        log::debug!(
            "Position limit warning for {}: {:.1} (limits: {:.1}-{:.1})",
            state.motor,
            position,
            range.range_min,
            range.range_max
        );
        actions.push(MonitorAction::LimitVelocity {
            motor: state.motor.clone(),
            velocity: t.soft_limit_velocity,
        });
    }
}

fn violation(time_us: u64, kind: ViolationKind, value: f64) -> Violation {
    Violation {
        time_us,
        kind,
        value,
        duration_s: None,
    }
}

/// Worst-case status across all motors. Emergency stop overrides everything.
pub fn derive_status<'a>(
    states: impl IntoIterator<Item = &'a MotorSafetyState>,
    t: &SafetyThresholds,
    emergency_stop_active: bool,
) -> SafetyStatus {
    if emergency_stop_active {
        return SafetyStatus::EmergencyStop;
    }
    let mut status = SafetyStatus::Normal;
    for state in states {
        if state.is_stalled || state.temperature_c >= t.temperature_critical_c {
            return SafetyStatus::Critical;
        }
        if state.temperature_c >= t.temperature_warning_c {
            status = SafetyStatus::Warning;
        }
    }
    status
}

/// S-curve ramp from `current` to `target` in `steps` setpoints.
///
/// Each setpoint is `current + s(p) * (target - current)` with
/// `s(p) = 0.5 * (1 - cos(pi * p))` and `p = (i + 1) / steps`. The last
/// setpoint is `target` exactly.
pub fn s_curve_trajectory(current: f64, target: f64, steps: u32) -> Vec<f64> {
    let steps = steps.max(1);
    let span = target - current;
    (1..=steps)
        .map(|i| {
            if i == steps {
                return target;
            }
            let progress = f64::from(i) / f64::from(steps);
            let s = 0.5 * (1.0 - (std::f64::consts::PI * progress).cos());
            current + s * span
        })
        .collect()
}
