//! Collision detection with backoff, retry limits and recalibration hints.
//!
//! Each motor runs a small state machine:
//!
//! ```text
//! IDLE --resisting--> DETECTING --held >= collision_duration--> COOLDOWN
//!   ^                     |                                        |
//!   +----- resistance clears -------------------------------------+
//! ```
//!
//! "Resisting" means current above `current_threshold_ma` or |load| above
//! `torque_threshold`, while the motor is still more than
//! [`AT_TARGET_TOLERANCE`] away from its target. Nothing is evaluated while a
//! motor is cooling down.

use crate::bus::{MotorBus, MotorId, Readings};
use crate::config::CollisionConfig;
use crate::error::{CalibrationError, ConfigError};
use crate::events::{EventSink, SafetyEvent};
use crate::performance::PerformanceMetrics;
use crate::timebase::{secs_to_us, us_to_secs, Clock};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// Position error below which a motor counts as having arrived.
pub const AT_TARGET_TOLERANCE: f64 = 0.02;
/// Position error below which a backed-off motor counts as recovered.
pub const RECOVERY_TOLERANCE: f64 = 0.05;
/// Collisions this close together (population std-dev) suggest calibration drift.
pub const DRIFT_CLUSTER_STDDEV: f64 = 0.02;

const COLLISION_HISTORY_LEN: usize = 10;
const DRIFT_WINDOW: usize = 3;

pub type RecalibrationHook = Box<dyn Fn() -> Result<(), CalibrationError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    MaxRetriesExceeded,
}

/// Outcome of one [`CollisionDetector::detect_collision`] call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CollisionAction {
    Clear,
    Detecting {
        elapsed_s: f64,
    },
    Cooldown {
        time_remaining_s: f64,
    },
    Backoff {
        backoff_position: f64,
        retry_count: u32,
        cooldown_period_s: f64,
        should_recalibrate: bool,
    },
    /// Retries are exhausted. The retry count only resets through backoff
    /// recovery, so later confirmed collisions on the motor abort again.
    Abort {
        reason: AbortReason,
        should_recalibrate: bool,
    },
}

impl CollisionAction {
    /// True for a confirmed collision (backoff or abort).
    pub fn is_collision(&self) -> bool {
        matches!(self, Self::Backoff { .. } | Self::Abort { .. })
    }

    pub fn should_recalibrate(&self) -> bool {
        match self {
            Self::Backoff {
                should_recalibrate, ..
            }
            | Self::Abort {
                should_recalibrate, ..
            } => *should_recalibrate,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPhase {
    Idle,
    Detecting,
    Cooldown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MotorCollisionState {
    pub detecting: bool,
    pub collision_start_us: Option<u64>,
    pub backed_off: bool,
    pub retry_count: u32,
    pub last_collision_us: Option<u64>,
    pub cooldown_until_us: u64,
}

impl MotorCollisionState {
    pub fn phase(&self, now_us: u64) -> CollisionPhase {
        if now_us < self.cooldown_until_us {
            CollisionPhase::Cooldown
        } else if self.detecting {
            CollisionPhase::Detecting
        } else {
            CollisionPhase::Idle
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollisionRecord {
    pub time_us: u64,
    pub position: f64,
    pub target: f64,
    pub current_ma: f64,
    pub load: Option<f64>,
}

/// Hook for end-effector collision checks. Joint-space detection does not
/// need it; an arm with a kinematic model can supply one.
pub trait PositionEstimator: Send + Sync {
    /// Cartesian end-effector position for the given joint readings.
    fn end_effector(&self, joints: &Readings) -> Option<[f64; 3]>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoKinematics;

impl PositionEstimator for NoKinematics {
    fn end_effector(&self, _joints: &Readings) -> Option<[f64; 3]> {
        None
    }
}

struct DetectorState {
    motors: BTreeMap<MotorId, MotorCollisionState>,
    history: BTreeMap<MotorId, VecDeque<CollisionRecord>>,
    backoff_positions: BTreeMap<MotorId, f64>,
    metrics: PerformanceMetrics,
    last_calibration_us: u64,
    total_collisions: u32,
}

impl DetectorState {
    fn should_recalibrate(&self, config: &CollisionConfig, now_us: u64) -> bool {
        let since_calibration_s = us_to_secs(now_us.saturating_sub(self.last_calibration_us));
        if since_calibration_s > config.time_since_last_calibration_s {
            log::info!("Recalibration recommended: time threshold exceeded");
            return true;
        }

        if self.total_collisions >= config.consecutive_collisions_for_recal {
            log::info!(
                "Recalibration recommended: {} collisions detected",
                self.total_collisions
            );
            return true;
        }

        for (motor, history) in &self.history {
            if history.len() < DRIFT_WINDOW {
                continue;
            }
            let recent: Vec<f64> = history
                .iter()
                .rev()
                .take(DRIFT_WINDOW)
                .map(|c| c.position)
                .collect();
            if population_stddev(&recent) < DRIFT_CLUSTER_STDDEV {
                log::info!(
                    "Recalibration recommended: repeated collisions at same position for {}",
                    motor
                );
                return true;
            }
        }
        false
    }
}

pub struct CollisionDetector<B: MotorBus> {
    bus: Arc<B>,
    config: CollisionConfig,
    clock: Arc<dyn Clock>,
    recalibration: Option<RecalibrationHook>,
    events: EventSink,
    state: Mutex<DetectorState>,
}

impl<B: MotorBus> CollisionDetector<B> {
    pub fn new(
        bus: Arc<B>,
        config: CollisionConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let motors = bus.motors();
        if motors.is_empty() {
            return Err(ConfigError::NoMotors);
        }

        let state = DetectorState {
            motors: motors
                .iter()
                .map(|m| (m.clone(), MotorCollisionState::default()))
                .collect(),
            history: motors
                .iter()
                .map(|m| (m.clone(), VecDeque::with_capacity(COLLISION_HISTORY_LEN)))
                .collect(),
            backoff_positions: BTreeMap::new(),
            metrics: PerformanceMetrics::new(config.initial_frequency_hz),
            last_calibration_us: clock.now_us(),
            total_collisions: 0,
        };

        Ok(Self {
            bus,
            config,
            clock,
            recalibration: None,
            events: EventSink::disconnected(),
            state: Mutex::new(state),
        })
    }

    pub fn with_recalibration(mut self, hook: RecalibrationHook) -> Self {
        self.recalibration = Some(hook);
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &CollisionConfig {
        &self.config
    }

    /// Feed one motor's readings through its state machine.
    ///
    /// `load` is normalized to 0-1. Unknown motors get fresh state.
    pub fn detect_collision(
        &self,
        motor: &MotorId,
        current_ma: f64,
        position: f64,
        target: f64,
        load: Option<f64>,
    ) -> CollisionAction {
        let now_us = self.clock.now_us();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let entry = state.motors.entry(motor.clone()).or_default();

        if now_us < entry.cooldown_until_us {
            return CollisionAction::Cooldown {
                time_remaining_s: us_to_secs(entry.cooldown_until_us - now_us),
            };
        }

        let position_error = (target - position).abs();
        let resisting = (current_ma > self.config.current_threshold_ma
            || load.is_some_and(|l| l.abs() > self.config.torque_threshold))
            && position_error > AT_TARGET_TOLERANCE;

        if !resisting {
            if entry.detecting {
                entry.detecting = false;
                entry.collision_start_us = None;
            }
            if entry.backed_off && position_error < RECOVERY_TOLERANCE {
                entry.backed_off = false;
                entry.retry_count = 0;
                state.backoff_positions.remove(motor);
                log::debug!("Motor {}: successfully moved after backoff", motor);
            }
            return CollisionAction::Clear;
        }

        let start_us = match entry.collision_start_us {
            Some(start) if entry.detecting => start,
            _ => {
                entry.detecting = true;
                entry.collision_start_us = Some(now_us);
                log::debug!(
                    "Motor {}: collision detection started (current={:.1}mA)",
                    motor,
                    current_ma
                );
                now_us
            }
        };

        let held_us = now_us - start_us;
        if held_us < secs_to_us(self.config.collision_duration_s) {
            return CollisionAction::Detecting {
                elapsed_s: us_to_secs(held_us),
            };
        }

        // Confirmed.
        entry.detecting = false;
        entry.collision_start_us = None;
        entry.last_collision_us = Some(now_us);
        entry.retry_count += 1;
        let retry_count = entry.retry_count;
        state.total_collisions += 1;

        let history = state
            .history
            .entry(motor.clone())
            .or_insert_with(|| VecDeque::with_capacity(COLLISION_HISTORY_LEN));
        if history.len() == COLLISION_HISTORY_LEN {
            history.pop_front();
        }
        history.push_back(CollisionRecord {
            time_us: now_us,
            position,
            target,
            current_ma,
            load,
        });

        if retry_count >= self.config.max_retries {
            log::warn!("Motor {}: max retries exceeded, aborting movement", motor);
            return CollisionAction::Abort {
                reason: AbortReason::MaxRetriesExceeded,
                should_recalibrate: state.should_recalibrate(&self.config, now_us),
            };
        }

        let direction = if position >= target { 1.0 } else { -1.0 };
        let mut backoff_position = position + direction * self.config.backoff_distance;
        if let Some(range) = self.bus.calibration(motor) {
            backoff_position = range.clamp(backoff_position);
        }

        if let Some(entry) = state.motors.get_mut(motor) {
            entry.backed_off = true;
            entry.cooldown_until_us = now_us + secs_to_us(self.config.cooldown_period_s);
        }
        state.backoff_positions.insert(motor.clone(), backoff_position);

        log::info!(
            "Motor {}: collision detected, backing off to {:.3}",
            motor,
            backoff_position
        );

        CollisionAction::Backoff {
            backoff_position,
            retry_count,
            cooldown_period_s: self.config.cooldown_period_s,
            should_recalibrate: state.should_recalibrate(&self.config, now_us),
        }
    }

    pub fn should_recalibrate(&self) -> bool {
        let now_us = self.clock.now_us();
        self.state.lock().should_recalibrate(&self.config, now_us)
    }

    /// Reset collision counters and history, then run the recalibration hook.
    /// Hook failures are logged and reported as an event, never returned.
    pub fn trigger_recalibration(&self) {
        let now_us = self.clock.now_us();
        let total = {
            let mut state = self.state.lock();
            let total = state.total_collisions;
            state.last_calibration_us = now_us;
            state.total_collisions = 0;
            for history in state.history.values_mut() {
                history.clear();
            }
            total
        };

        log::info!("Triggering auto-recalibration after {} collisions", total);
        self.events.emit(SafetyEvent::RecalibrationTriggered {
            total_collisions: total,
        });

        if let Some(hook) = &self.recalibration {
            if let Err(e) = hook() {
                log::error!("Recalibration failed: {}", e);
                self.events.emit(SafetyEvent::RecalibrationFailed {
                    reason: e.to_string(),
                });
            }
        }
    }

    pub fn update_smoothness_metrics(&self, positions: &Readings, timestamp_s: f64) -> f64 {
        self.state.lock().metrics.update_smoothness(positions, timestamp_s)
    }

    pub fn record_latency(&self, latency_ms: f64) {
        self.state.lock().metrics.record_latency(latency_ms);
    }

    pub fn adaptive_frequency(&self) -> f64 {
        self.state.lock().metrics.adaptive_frequency()
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        self.state.lock().metrics.clone()
    }

    pub fn total_collisions(&self) -> u32 {
        self.state.lock().total_collisions
    }

    pub fn motor_state(&self, motor: &MotorId) -> Option<MotorCollisionState> {
        self.state.lock().motors.get(motor).cloned()
    }

    pub fn phase(&self, motor: &MotorId) -> CollisionPhase {
        let now_us = self.clock.now_us();
        self.state
            .lock()
            .motors
            .get(motor)
            .map_or(CollisionPhase::Idle, |s| s.phase(now_us))
    }

    pub fn backoff_position(&self, motor: &MotorId) -> Option<f64> {
        self.state.lock().backoff_positions.get(motor).copied()
    }

    pub fn collision_history(&self, motor: &MotorId) -> Vec<CollisionRecord> {
        self.state
            .lock()
            .history
            .get(motor)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }
}

fn population_stddev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt()
}
