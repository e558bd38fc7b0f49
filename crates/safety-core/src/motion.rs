//! Multi-motor goal moves driven through the collision detector.

use crate::bus::{MotorBus, MotorId, Readings, Register, Telemetry};
use crate::collision::{
    CollisionAction, CollisionDetector, NoKinematics, PositionEstimator, RecalibrationHook,
    AT_TARGET_TOLERANCE,
};
use crate::config::CollisionConfig;
use crate::error::{CalibrationError, ConfigError, MotionError};
use crate::events::EventSink;
use crate::monitor::MotorSafetyMonitor;
use crate::performance::PerformanceMetrics;
use crate::timebase::{us_to_secs, Clock};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// `Present_Load` full scale; readings are divided by this to normalize.
pub const LOAD_FULL_SCALE: f64 = 1000.0;

const RECALIBRATION_PROMPT: &str =
    "Multiple collisions detected. Move the arm to the middle position and confirm.";

/// Operator-assisted calibration used by auto-recalibration.
pub trait Calibrator: Send + Sync {
    /// Block until the operator confirms the arm is ready.
    fn await_operator(&self, prompt: &str) -> Result<(), CalibrationError>;

    /// Re-run the homing / range-of-motion procedure.
    fn calibrate(&self) -> Result<(), CalibrationError>;
}

/// Outcome of [`SmartCollisionSafetySystem::safe_move_with_collision_detection`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MoveResult {
    /// Every motor reached its effective target and none aborted.
    pub success: bool,
    /// Confirmed collisions (backoff or abort) per motor, in order.
    pub collisions: BTreeMap<MotorId, Vec<CollisionAction>>,
    pub final_positions: Readings,
    /// Motors that finished at their backoff position instead of the goal.
    pub backed_off: Vec<MotorId>,
    pub aborted: Vec<MotorId>,
    pub recalibration_triggered: bool,
    pub cycles: u32,
    pub elapsed_s: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_effector: Option<[f64; 3]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug)]
struct ActiveMove {
    target: f64,
    backoff_position: Option<f64>,
    aborted: bool,
}

impl ActiveMove {
    fn effective_target(&self) -> f64 {
        self.backoff_position.unwrap_or(self.target)
    }
}

/// Drives goal moves to completion with collision backoff, retry limits and
/// auto-recalibration. Optionally gated by a [`MotorSafetyMonitor`].
pub struct SmartCollisionSafetySystem<B: MotorBus + 'static> {
    bus: Arc<B>,
    detector: CollisionDetector<B>,
    clock: Arc<dyn Clock>,
    monitor: Option<Arc<MotorSafetyMonitor<B>>>,
    estimator: Box<dyn PositionEstimator>,
    moving: Mutex<()>,
}

impl<B: MotorBus + 'static> SmartCollisionSafetySystem<B> {
    pub fn new(
        bus: Arc<B>,
        config: CollisionConfig,
        clock: Arc<dyn Clock>,
        calibrator: Arc<dyn Calibrator>,
    ) -> Result<Self, ConfigError> {
        let hook_bus = Arc::clone(&bus);
        let hook: RecalibrationHook =
            Box::new(move || recalibrate(hook_bus.as_ref(), calibrator.as_ref()));
        let detector = CollisionDetector::new(Arc::clone(&bus), config, Arc::clone(&clock))?
            .with_recalibration(hook);

        log::info!("Smart collision safety system initialized");
        Ok(Self {
            bus,
            detector,
            clock,
            monitor: None,
            estimator: Box::new(NoKinematics),
            moving: Mutex::new(()),
        })
    }

    /// Refuse and abort moves while `monitor` reports emergency stop.
    pub fn with_monitor(mut self, monitor: Arc<MotorSafetyMonitor<B>>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.detector = self.detector.with_events(events);
        self
    }

    pub fn with_estimator(mut self, estimator: Box<dyn PositionEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn detector(&self) -> &CollisionDetector<B> {
        &self.detector
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        self.detector.metrics()
    }

    /// Move every motor in `goals` to its target, backing off on collisions.
    ///
    /// Blocks the caller until the move completes, every motor aborts, or
    /// `timeout` elapses. Runtime faults end the move and are reported in
    /// [`MoveResult::error`]; nothing is returned as an `Err`.
    pub fn safe_move_with_collision_detection(
        &self,
        goals: &Readings,
        timeout: Duration,
    ) -> MoveResult {
        let _moving = self.moving.lock();
        let started = Instant::now();
        let mut result = MoveResult::default();

        if let Err(e) = self.drive(goals, timeout, started, &mut result) {
            log::error!("Error during safe movement: {}", e);
            result.error = Some(e.to_string());
        }

        match self.bus.sync_read(Telemetry::Position) {
            Ok(positions) => result.final_positions = positions,
            Err(e) => {
                log::error!("Failed to read final positions: {}", e);
                result.error.get_or_insert_with(|| e.to_string());
            }
        }
        result.elapsed_s = started.elapsed().as_secs_f64();

        let metrics = self.detector.metrics();
        log::info!(
            "Movement complete. Smoothness: {:.2}, Latency: {:.1}ms, Frequency: {:.1}Hz",
            metrics.smoothness_score,
            metrics.latency_ms,
            metrics.optimal_frequency_hz
        );
        result
    }

    fn emergency_stop_active(&self) -> bool {
        self.monitor
            .as_ref()
            .is_some_and(|m| m.emergency_stop_active())
    }

    fn drive(
        &self,
        goals: &Readings,
        timeout: Duration,
        started: Instant,
        result: &mut MoveResult,
    ) -> Result<(), MotionError> {
        if self.emergency_stop_active() {
            return Err(MotionError::EmergencyStopActive);
        }

        let mut moves: BTreeMap<MotorId, ActiveMove> = BTreeMap::new();
        for (motor, &target) in goals {
            self.bus.write(Register::GoalPosition, motor, target)?;
            moves.insert(
                motor.clone(),
                ActiveMove {
                    target,
                    backoff_position: None,
                    aborted: false,
                },
            );
        }

        while started.elapsed() < timeout {
            let cycle_start = Instant::now();
            if self.emergency_stop_active() {
                return Err(MotionError::EmergencyStopActive);
            }
            result.cycles += 1;

            let positions = self.bus.sync_read(Telemetry::Position)?;
            let currents = self.bus.sync_read(Telemetry::Current)?;
            let loads = self.bus.sync_read(Telemetry::Load)?;

            self.detector
                .update_smoothness_metrics(&positions, us_to_secs(self.clock.now_us()));
            if let Some(ee) = self.estimator.end_effector(&positions) {
                result.end_effector = Some(ee);
            }

            let mut complete = true;
            for (motor, mv) in moves.iter_mut().filter(|(_, mv)| !mv.aborted) {
                let position = positions
                    .get(motor)
                    .copied()
                    .ok_or_else(|| MotionError::MissingReading(motor.to_string()))?;
                let current = currents.get(motor).copied().unwrap_or(0.0);
                let load = loads.get(motor).map(|l| l / LOAD_FULL_SCALE);

                let action = self
                    .detector
                    .detect_collision(motor, current, position, mv.target, load);

                if action.is_collision() {
                    match &action {
                        CollisionAction::Backoff {
                            backoff_position, ..
                        } => {
                            log::info!(
                                "Motor {}: executing backoff to {:.3}",
                                motor,
                                backoff_position
                            );
                            self.bus
                                .write(Register::GoalPosition, motor, *backoff_position)?;
                            mv.backoff_position = Some(*backoff_position);
                        }
                        CollisionAction::Abort { .. } => {
                            log::warn!("Motor {}: movement aborted", motor);
                            mv.aborted = true;
                        }
                        _ => {}
                    }

                    if action.should_recalibrate() && !result.recalibration_triggered {
                        result.recalibration_triggered = true;
                        self.detector.trigger_recalibration();
                    }
                    result
                        .collisions
                        .entry(motor.clone())
                        .or_default()
                        .push(action);
                }

                // Recovery near the original goal ends the backoff.
                if mv.backoff_position.is_some() && self.detector.backoff_position(motor).is_none()
                {
                    mv.backoff_position = None;
                }

                if !mv.aborted && (position - mv.effective_target()).abs() > AT_TARGET_TOLERANCE {
                    complete = false;
                }
            }

            let latency_ms = cycle_start.elapsed().as_secs_f64() * 1000.0;
            self.detector.record_latency(latency_ms);

            if complete {
                result.aborted = moves
                    .iter()
                    .filter(|(_, mv)| mv.aborted)
                    .map(|(m, _)| m.clone())
                    .collect();
                result.backed_off = moves
                    .iter()
                    .filter(|(_, mv)| !mv.aborted && mv.backoff_position.is_some())
                    .map(|(m, _)| m.clone())
                    .collect();
                result.success = result.aborted.is_empty();
                return Ok(());
            }

            let period = Duration::from_secs_f64(1.0 / self.detector.adaptive_frequency());
            thread::sleep(period.saturating_sub(cycle_start.elapsed()));
        }

        log::warn!("Goal move timed out after {:?}", timeout);
        result.aborted = moves
            .iter()
            .filter(|(_, mv)| mv.aborted)
            .map(|(m, _)| m.clone())
            .collect();
        Ok(())
    }
}

/// Disable torque, wait for the operator, calibrate, re-enable torque.
fn recalibrate<B: MotorBus>(bus: &B, calibrator: &dyn Calibrator) -> Result<(), CalibrationError> {
    log::info!("Auto-recalibration triggered by collision detection");
    bus.disable_torque(None)?;
    calibrator.await_operator(RECALIBRATION_PROMPT)?;
    calibrator.calibrate()?;
    bus.enable_torque()?;
    log::info!("Auto-recalibration completed successfully");
    Ok(())
}
