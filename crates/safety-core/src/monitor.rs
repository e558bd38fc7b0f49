//! Background supervision of motor health.
//!
//! A single polling thread batch-reads telemetry, runs the rules in
//! [`crate::safety`] under the state lock, then applies the resulting
//! [`MonitorAction`]s to the bus with the lock released. Emergency stop is
//! synchronous and does not wait for the next cycle.

use crate::bus::{MotorBus, MotorId, MotorRange, Readings, Register, Telemetry};
use crate::config::SafetyThresholds;
use crate::error::{BusError, ConfigError, MotionError};
use crate::events::{EventSink, SafetyEvent};
use crate::safety::{
    derive_status, evaluate_motor, s_curve_trajectory, MonitorAction, MotorSafetyState, Sample,
    SafetyStats, SafetyStatus,
};
use crate::timebase::{us_to_secs, Clock};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Upper bound on how long `stop_monitoring` waits for the poll thread.
pub const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

struct MonitorState {
    motors: BTreeMap<MotorId, MotorSafetyState>,
    stats: SafetyStats,
    status: SafetyStatus,
    emergency_stop_active: bool,
    started_us: u64,
}

struct Shared<B> {
    bus: Arc<B>,
    thresholds: SafetyThresholds,
    clock: Arc<dyn Clock>,
    events: EventSink,
    state: Mutex<MonitorState>,
    /// Held for a whole poll cycle so cycles never overlap.
    cycle: Mutex<()>,
}

/// A spawned poll thread and the stop flag that belongs to it alone.
struct Worker {
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
}

/// Per-motor section of a [`SafetyReport`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MotorReport {
    pub temperature_c: f64,
    pub max_temp_c: f64,
    pub current_ma: f64,
    pub position: f64,
    pub velocity: f64,
    pub is_stalled: bool,
    pub thermal_shutdown: bool,
    pub violations: usize,
    /// Seconds on the monitor clock.
    pub last_violation_s: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetyReport {
    pub status: SafetyStatus,
    pub emergency_stop: bool,
    pub uptime_s: f64,
    pub statistics: SafetyStats,
    pub motors: BTreeMap<MotorId, MotorReport>,
}

pub struct MotorSafetyMonitor<B: MotorBus + 'static> {
    shared: Arc<Shared<B>>,
    worker: Mutex<Option<Worker>>,
}

impl<B: MotorBus + 'static> MotorSafetyMonitor<B> {
    /// Build per-motor state for every motor on the bus. Fails fast on
    /// malformed thresholds or an empty bus.
    pub fn new(
        bus: Arc<B>,
        thresholds: SafetyThresholds,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        thresholds.validate()?;
        let motors: BTreeMap<_, _> = bus
            .motors()
            .into_iter()
            .map(|m| (m.clone(), MotorSafetyState::new(m)))
            .collect();
        if motors.is_empty() {
            return Err(ConfigError::NoMotors);
        }

        log::info!(
            "Safety monitor initialized for {} motors at {:.1}Hz",
            motors.len(),
            thresholds.monitor_frequency_hz
        );

        let state = MonitorState {
            motors,
            stats: SafetyStats::default(),
            status: SafetyStatus::Normal,
            emergency_stop_active: false,
            started_us: clock.now_us(),
        };

        Ok(Self {
            shared: Arc::new(Shared {
                bus,
                thresholds,
                clock,
                events: EventSink::disconnected(),
                state: Mutex::new(state),
                cycle: Mutex::new(()),
            }),
            worker: Mutex::new(None),
        })
    }

    /// Route safety events to `events`. Must be called before monitoring starts.
    pub fn with_events(mut self, events: EventSink) -> Self {
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => shared.events = events,
            None => log::warn!("Event sink not attached: monitor already running"),
        }
        self
    }

    pub fn thresholds(&self) -> &SafetyThresholds {
        &self.shared.thresholds
    }

    pub fn start_monitoring(&self) {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            log::warn!("Safety monitoring already running");
            return;
        }

        // A thread detached by a timed-out stop keeps its own raised flag.
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("safety-monitor".into())
            .spawn(move || shared.run(&thread_stop));
        match spawned {
            Ok(handle) => {
                *worker = Some(Worker { handle, stop });
                log::info!("Safety monitoring started");
            }
            Err(e) => log::error!("Failed to spawn safety monitor thread: {}", e),
        }
    }

    /// Signal the poll thread and wait up to [`STOP_JOIN_TIMEOUT`] for it.
    pub fn stop_monitoring(&self) {
        let Some(Worker { handle, stop }) = self.worker.lock().take() else {
            log::warn!("Safety monitoring not running");
            return;
        };

        stop.store(true, Ordering::Release);
        handle.thread().unpark();

        let deadline = Instant::now() + STOP_JOIN_TIMEOUT;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                log::warn!(
                    "Safety monitor thread did not exit within {:?}; detaching",
                    STOP_JOIN_TIMEOUT
                );
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        if handle.join().is_err() {
            log::error!("Safety monitor thread panicked");
        }
        log::info!("Safety monitoring stopped");
    }

    pub fn is_monitoring(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }

    /// Start monitoring for the lifetime of the returned guard.
    pub fn scoped(&self) -> MonitorGuard<'_, B> {
        self.start_monitoring();
        MonitorGuard { monitor: self }
    }

    /// Run one poll cycle on the calling thread.
    ///
    /// A failed batch read skips the cycle and is returned; the background
    /// loop only logs it.
    pub fn perform_safety_checks(&self) -> Result<SafetyStatus, BusError> {
        self.shared.perform_safety_checks()
    }

    /// Disable torque on every motor and latch the emergency-stop flag.
    pub fn emergency_stop(&self) {
        self.shared.emergency_stop();
    }

    /// Clear the emergency stop if every motor is below the cooldown
    /// temperature. Returns whether emergency stop is now clear.
    pub fn reset_emergency_stop(&self) -> bool {
        let t = &self.shared.thresholds;
        let mut state = self.shared.state.lock();
        if !state.emergency_stop_active {
            return true;
        }

        if let Some(hot) = state
            .motors
            .values()
            .find(|s| s.temperature_c >= t.cooldown_temperature_c)
        {
            log::warn!(
                "Cannot reset emergency stop - {} still at {:.1}C (cooldown {:.1}C)",
                hot.motor,
                hot.temperature_c,
                t.cooldown_temperature_c
            );
            return false;
        }

        state.emergency_stop_active = false;
        state.status = derive_status(state.motors.values(), t, false);
        log::info!("Emergency stop reset");
        true
    }

    pub fn emergency_stop_active(&self) -> bool {
        self.shared.state.lock().emergency_stop_active
    }

    pub fn status(&self) -> SafetyStatus {
        self.shared.state.lock().status
    }

    /// Plan an S-curve ramp from `current` to `target`.
    pub fn apply_soft_start(&self, motor: &MotorId, target: f64, current: f64) -> Vec<f64> {
        let steps = s_curve_trajectory(current, target, self.shared.thresholds.soft_start_steps);
        log::debug!(
            "Soft start for {}: {:.2} -> {:.2} in {} steps",
            motor,
            current,
            target,
            steps.len()
        );
        steps
    }

    /// Drive `motor` to `target` along the soft-start ramp, one
    /// `Goal_Position` write per step. Aborts if emergency stop fires.
    pub fn soft_start_move(&self, motor: &MotorId, target: f64) -> Result<(), MotionError> {
        if self.emergency_stop_active() {
            return Err(MotionError::EmergencyStopActive);
        }

        let bus = &self.shared.bus;
        let current = bus
            .sync_read(Telemetry::Position)?
            .get(motor)
            .copied()
            .ok_or_else(|| MotionError::MissingReading(motor.to_string()))?;
        let steps = self.apply_soft_start(motor, target, current);
        let interval = self.shared.thresholds.soft_start_step_interval();
        let total = steps.len();

        self.set_soft_start(motor, true, 0.0);
        let result = steps.iter().enumerate().try_for_each(|(i, &setpoint)| {
            if self.emergency_stop_active() {
                return Err(MotionError::EmergencyStopActive);
            }
            bus.write(Register::GoalPosition, motor, setpoint)?;
            self.set_soft_start(motor, true, (i + 1) as f64 / total as f64);
            if i + 1 < total {
                thread::sleep(interval);
            }
            Ok(())
        });
        let progress = self.soft_start_progress(motor);
        self.set_soft_start(motor, false, progress);
        result
    }

    fn set_soft_start(&self, motor: &MotorId, active: bool, progress: f64) {
        if let Some(state) = self.shared.state.lock().motors.get_mut(motor) {
            state.soft_start_active = active;
            state.soft_start_progress = progress;
        }
    }

    fn soft_start_progress(&self, motor: &MotorId) -> f64 {
        self.shared
            .state
            .lock()
            .motors
            .get(motor)
            .map_or(0.0, |s| s.soft_start_progress)
    }

    pub fn motor_state(&self, motor: &MotorId) -> Option<MotorSafetyState> {
        self.shared.state.lock().motors.get(motor).cloned()
    }

    pub fn get_safety_report(&self) -> SafetyReport {
        let now_us = self.shared.clock.now_us();
        let state = self.shared.state.lock();
        let uptime_s = us_to_secs(now_us.saturating_sub(state.started_us));
        let mut statistics = state.stats.clone();
        statistics.uptime_s = uptime_s;

        SafetyReport {
            status: state.status,
            emergency_stop: state.emergency_stop_active,
            uptime_s,
            statistics,
            motors: state
                .motors
                .iter()
                .map(|(motor, s)| {
                    (
                        motor.clone(),
                        MotorReport {
                            temperature_c: s.temperature_c,
                            max_temp_c: s.max_temp_reached_c,
                            current_ma: s.current_ma,
                            position: s.position,
                            velocity: s.velocity,
                            is_stalled: s.is_stalled,
                            thermal_shutdown: s.thermal_shutdown,
                            violations: s.violations.len(),
                            last_violation_s: s.last_violation_us.map(us_to_secs),
                        },
                    )
                })
                .collect(),
        }
    }
}

impl<B: MotorBus + 'static> Drop for MotorSafetyMonitor<B> {
    fn drop(&mut self) {
        if self.worker.get_mut().is_some() {
            self.stop_monitoring();
        }
    }
}

/// Keeps monitoring running until dropped.
pub struct MonitorGuard<'a, B: MotorBus + 'static> {
    monitor: &'a MotorSafetyMonitor<B>,
}

impl<B: MotorBus + 'static> std::ops::Deref for MonitorGuard<'_, B> {
    type Target = MotorSafetyMonitor<B>;

    fn deref(&self) -> &Self::Target {
        self.monitor
    }
}

impl<B: MotorBus + 'static> Drop for MonitorGuard<'_, B> {
    fn drop(&mut self) {
        self.monitor.stop_monitoring();
    }
}

impl<B: MotorBus> Shared<B> {
    fn run(&self, stop: &AtomicBool) {
        let period = self.thresholds.monitor_period();
        while !stop.load(Ordering::Acquire) {
            if let Err(e) = self.perform_safety_checks() {
                log::error!("Error in safety monitor loop: {}", e);
            }
            thread::park_timeout(period);
        }
    }

    fn read_batch(&self) -> Result<(Readings, Readings, Readings), BusError> {
        Ok((
            self.bus.sync_read(Telemetry::Temperature)?,
            self.bus.sync_read(Telemetry::Current)?,
            self.bus.sync_read(Telemetry::Position)?,
        ))
    }

    fn perform_safety_checks(&self) -> Result<SafetyStatus, BusError> {
        let _cycle = self.cycle.lock();
        let (temps, currents, positions) = match self.read_batch() {
            Ok(batch) => batch,
            Err(e) => {
                self.state.lock().stats.poll_failures += 1;
                return Err(e);
            }
        };
        let now_us = self.clock.now_us();
        let ranges: BTreeMap<MotorId, MotorRange> = positions
            .keys()
            .filter_map(|m| self.bus.calibration(m).map(|r| (m.clone(), r)))
            .collect();

        let mut actions = Vec::new();
        let status = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            for (motor, motor_state) in state.motors.iter_mut() {
                let (Some(&temperature_c), Some(&current_ma), Some(&position)) =
                    (temps.get(motor), currents.get(motor), positions.get(motor))
                else {
                    log::debug!("Incomplete telemetry for {}, skipping", motor);
                    continue;
                };
                evaluate_motor(
                    motor_state,
                    Sample {
                        temperature_c,
                        current_ma,
                        position,
                    },
                    ranges.get(motor).copied(),
                    &self.thresholds,
                    &mut state.stats,
                    now_us,
                    &mut actions,
                );
            }
            state.stats.poll_cycles += 1;
            state.stats.uptime_s = us_to_secs(now_us.saturating_sub(state.started_us));
            state.status = derive_status(
                state.motors.values(),
                &self.thresholds,
                state.emergency_stop_active,
            );
            state.status
        };

        for action in actions {
            self.apply(action);
        }
        Ok(status)
    }

    fn apply(&self, action: MonitorAction) {
        match action {
            MonitorAction::DisableTorque(motor) => {
                if let Err(e) = self.bus.disable_torque(Some(&motor)) {
                    log::error!("Failed to disable torque for {}: {}", motor, e);
                }
            }
            MonitorAction::ReduceTorque { motor, scale } => {
                let reduced = self
                    .bus
                    .read(Register::TorqueLimit, &motor)
                    .map(|limit| (limit * scale).round())
                    .and_then(|limit| {
                        self.bus.write(Register::TorqueLimit, &motor, limit)?;
                        Ok(limit)
                    });
                match reduced {
                    Ok(limit) => log::info!("Reduced torque for {} to {}", motor, limit),
                    Err(e) => log::error!("Failed to reduce torque for {}: {}", motor, e),
                }
            }
            MonitorAction::LimitVelocity { motor, velocity } => {
                if let Err(e) = self.bus.write(Register::GoalVelocity, &motor, velocity) {
                    log::error!("Failed to limit velocity for {}: {}", motor, e);
                }
            }
            MonitorAction::Notify(event) => self.events.emit(event),
        }
    }

    fn emergency_stop(&self) {
        log::error!("EMERGENCY STOP ACTIVATED");
        {
            let mut state = self.state.lock();
            state.emergency_stop_active = true;
            state.status = SafetyStatus::EmergencyStop;
            state.stats.emergency_stops += 1;
        }
        if let Err(e) = self.bus.disable_torque(None) {
            log::error!("Failed to disable torque during emergency stop: {}", e);
        }
        self.events.emit(SafetyEvent::EmergencyStop);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus_sim::{BusCommand, SimulatedArm, DEFAULT_TORQUE_LIMIT};
    use crate::safety::ViolationKind;
    use crate::timebase::ManualClock;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc::{self, Receiver};

    struct Rig {
        arm: Arc<SimulatedArm>,
        clock: ManualClock,
        monitor: MotorSafetyMonitor<SimulatedArm>,
        events: Receiver<SafetyEvent>,
    }

    fn rig_with(thresholds: SafetyThresholds) -> Rig {
        let arm = Arc::new(SimulatedArm::new(["elbow_flex", "gripper"]));
        let clock = ManualClock::new();
        let (tx, events) = mpsc::channel();
        let monitor = MotorSafetyMonitor::new(Arc::clone(&arm), thresholds, Arc::new(clock.clone()))
            .unwrap()
            .with_events(EventSink::new(tx));
        Rig {
            arm,
            clock,
            monitor,
            events,
        }
    }

    fn rig() -> Rig {
        rig_with(SafetyThresholds::default())
    }

    fn id(name: &str) -> MotorId {
        MotorId::from(name)
    }

    #[test]
    fn construction_fails_fast() {
        let bad = SafetyThresholds {
            temperature_critical_c: 60.0,
            ..Default::default()
        };
        let arm = Arc::new(SimulatedArm::new(["a"]));
        assert!(matches!(
            MotorSafetyMonitor::new(arm, bad, Arc::new(ManualClock::new())),
            Err(ConfigError::TemperatureOrder { .. })
        ));

        let empty = Arc::new(SimulatedArm::new(Vec::<&str>::new()));
        assert!(matches!(
            MotorSafetyMonitor::new(empty, SafetyThresholds::default(), Arc::new(ManualClock::new())),
            Err(ConfigError::NoMotors)
        ));
    }

    #[test]
    fn shutdown_disables_only_the_hot_motor_once() {
        let r = rig();
        r.arm.pin(Telemetry::Temperature, "gripper", 52.0);

        assert_eq!(r.monitor.perform_safety_checks(), Ok(SafetyStatus::Critical));
        r.clock.advance_secs(0.1);
        r.monitor.perform_safety_checks().unwrap();

        assert!(!r.arm.torque_enabled("gripper"));
        assert!(r.arm.torque_enabled("elbow_flex"));
        let shutdowns: Vec<_> = r
            .events
            .try_iter()
            .filter(|e| e.kind() == "temperature_shutdown")
            .collect();
        assert_eq!(shutdowns.len(), 1);
        assert_eq!(r.monitor.motor_state(&id("gripper")).unwrap().violations.len(), 2);
    }

    #[test]
    fn rising_temperature_escalates_through_every_band() {
        let r = rig();
        let gripper = id("gripper");
        for temperature_c in [38.0, 41.0, 46.0, 51.0, 53.0] {
            r.arm.pin(Telemetry::Temperature, "gripper", temperature_c);
            r.monitor.perform_safety_checks().unwrap();
            r.clock.advance_secs(0.1);
        }

        let recorded: Vec<_> = r
            .monitor
            .motor_state(&gripper)
            .unwrap()
            .violations
            .iter()
            .map(|v| (v.kind, v.value))
            .collect();
        assert_eq!(
            recorded,
            vec![
                (ViolationKind::TemperatureWarning, 41.0),
                (ViolationKind::TemperatureCritical, 46.0),
                (ViolationKind::TemperatureCritical, 51.0),
                (ViolationKind::TemperatureCritical, 53.0),
            ]
        );

        let commands: Vec<_> = r
            .arm
            .journal()
            .into_iter()
            .filter(|c| {
                matches!(
                    c,
                    BusCommand::DisableTorque(_)
                        | BusCommand::Write {
                            register: Register::TorqueLimit,
                            ..
                        }
                )
            })
            .collect();
        assert_eq!(
            commands,
            vec![
                BusCommand::Write {
                    register: Register::TorqueLimit,
                    motor: gripper.clone(),
                    value: DEFAULT_TORQUE_LIMIT * 0.5,
                },
                BusCommand::DisableTorque(Some(gripper)),
            ]
        );
        assert_eq!(r.monitor.status(), SafetyStatus::Critical);
    }

    #[test]
    fn critical_band_halves_torque_limit() {
        let r = rig();
        r.arm.pin(Telemetry::Temperature, "elbow_flex", 46.0);
        r.monitor.perform_safety_checks().unwrap();
        assert_eq!(
            r.arm.read(Register::TorqueLimit, &id("elbow_flex")).unwrap(),
            DEFAULT_TORQUE_LIMIT * 0.5
        );
        assert_eq!(r.monitor.status(), SafetyStatus::Critical);
    }

    #[test]
    fn current_spike_trims_torque_by_thirty_percent() {
        let r = rig();
        r.arm.pin(Telemetry::Current, "gripper", 1250.0);
        r.monitor.perform_safety_checks().unwrap();
        assert_eq!(
            r.arm.read(Register::TorqueLimit, &id("gripper")).unwrap(),
            700.0
        );
        assert_eq!(r.monitor.get_safety_report().statistics.current_spikes, 1);
    }

    #[test]
    fn stall_requires_sustained_current() {
        let r = rig();
        r.arm.pin(Telemetry::Current, "gripper", 900.0);

        r.monitor.perform_safety_checks().unwrap();
        r.clock.advance_secs(0.4);
        r.monitor.perform_safety_checks().unwrap();
        assert!(!r.monitor.motor_state(&id("gripper")).unwrap().is_stalled);
        assert!(r.arm.torque_enabled("gripper"));

        r.clock.advance_secs(0.1);
        assert_eq!(r.monitor.perform_safety_checks(), Ok(SafetyStatus::Critical));
        assert!(r.monitor.motor_state(&id("gripper")).unwrap().is_stalled);
        assert!(!r.arm.torque_enabled("gripper"));
        assert_eq!(
            r.events.try_recv().unwrap(),
            SafetyEvent::StallDetected {
                motor: id("gripper"),
                current_ma: 900.0
            }
        );

        // Recovery is immediate.
        r.arm.pin(Telemetry::Current, "gripper", 50.0);
        r.clock.advance_secs(0.1);
        assert_eq!(r.monitor.perform_safety_checks(), Ok(SafetyStatus::Normal));
    }

    #[test]
    fn rules_run_in_order_within_one_cycle() {
        let r = rig();
        r.arm.pin(Telemetry::Temperature, "gripper", 55.0);
        r.arm.pin(Telemetry::Current, "gripper", 1300.0);
        r.monitor.perform_safety_checks().unwrap();

        let gripper = id("gripper");
        let journal = r.arm.journal();
        assert_eq!(journal[0], BusCommand::DisableTorque(Some(gripper.clone())));
        assert_eq!(
            journal[1],
            BusCommand::Write {
                register: Register::TorqueLimit,
                motor: gripper,
                value: 700.0
            }
        );
    }

    #[test]
    fn near_bound_writes_soft_velocity() {
        let r = rig();
        r.arm.set_range("elbow_flex", MotorRange::new(0.0, 100.0));
        r.arm.set_position("elbow_flex", 97.0);
        r.monitor.perform_safety_checks().unwrap();
        assert!(r.arm.journal().contains(&BusCommand::Write {
            register: Register::GoalVelocity,
            motor: id("elbow_flex"),
            value: 50.0
        }));
    }

    #[test]
    fn failed_batch_skips_cycle() {
        let r = rig();
        r.arm.fail_reads(true);
        assert!(r.monitor.perform_safety_checks().is_err());
        let stats = r.monitor.get_safety_report().statistics;
        assert_eq!(stats.poll_failures, 1);
        assert_eq!(stats.poll_cycles, 0);

        r.arm.fail_reads(false);
        assert!(r.monitor.perform_safety_checks().is_ok());
    }

    #[test]
    fn emergency_stop_round_trip() {
        let r = rig();
        r.arm.pin(Telemetry::Temperature, "elbow_flex", 38.0);
        r.monitor.perform_safety_checks().unwrap();

        r.monitor.emergency_stop();
        assert!(r.monitor.emergency_stop_active());
        assert_eq!(r.monitor.status(), SafetyStatus::EmergencyStop);
        assert!(r.arm.journal().contains(&BusCommand::DisableTorque(None)));
        assert!(!r.arm.torque_enabled("elbow_flex"));
        assert!(!r.arm.torque_enabled("gripper"));
        assert_eq!(r.events.try_recv().unwrap(), SafetyEvent::EmergencyStop);

        // Polling does not clear it.
        assert_eq!(r.monitor.perform_safety_checks(), Ok(SafetyStatus::EmergencyStop));

        assert!(!r.monitor.reset_emergency_stop());
        assert!(r.monitor.emergency_stop_active());

        r.arm.pin(Telemetry::Temperature, "elbow_flex", 30.0);
        r.monitor.perform_safety_checks().unwrap();
        assert!(r.monitor.reset_emergency_stop());
        assert!(!r.monitor.emergency_stop_active());
        assert_eq!(r.monitor.status(), SafetyStatus::Normal);
        assert_eq!(r.monitor.get_safety_report().statistics.emergency_stops, 1);
    }

    #[test]
    fn soft_start_plan_has_configured_length() {
        let r = rig();
        let plan = r.monitor.apply_soft_start(&id("gripper"), 90.0, 10.0);
        assert_eq!(plan.len(), 10);
        assert!(plan[0] > 10.0 && plan[0] < 90.0);
        assert_eq!(plan[9], 90.0);
    }

    #[test]
    fn soft_start_move_writes_every_step() {
        let r = rig_with(SafetyThresholds {
            soft_start_duration_s: 0.01,
            soft_start_steps: 4,
            ..Default::default()
        });
        let gripper = id("gripper");
        r.monitor.soft_start_move(&gripper, 40.0).unwrap();

        let goals: Vec<f64> = r
            .arm
            .journal()
            .into_iter()
            .filter_map(|c| match c {
                BusCommand::Write {
                    register: Register::GoalPosition,
                    value,
                    ..
                } => Some(value),
                _ => None,
            })
            .collect();
        assert_eq!(goals.len(), 4);
        assert_eq!(goals[3], 40.0);
        let state = r.monitor.motor_state(&gripper).unwrap();
        assert!(!state.soft_start_active);
        assert_eq!(state.soft_start_progress, 1.0);
    }

    #[test]
    fn soft_start_move_refused_during_emergency_stop() {
        let r = rig();
        r.monitor.emergency_stop();
        assert_eq!(
            r.monitor.soft_start_move(&id("gripper"), 40.0),
            Err(MotionError::EmergencyStopActive)
        );
    }

    #[test]
    fn report_reflects_motor_state() {
        let r = rig();
        r.arm.pin(Telemetry::Temperature, "gripper", 42.0);
        r.monitor.perform_safety_checks().unwrap();
        r.clock.advance_secs(3.0);

        let report = r.monitor.get_safety_report();
        assert_eq!(report.status, SafetyStatus::Warning);
        assert!(!report.emergency_stop);
        assert_eq!(report.uptime_s, 3.0);
        let gripper = &report.motors[&id("gripper")];
        assert_eq!(gripper.temperature_c, 42.0);
        assert_eq!(gripper.max_temp_c, 42.0);
        assert_eq!(gripper.violations, 1);
        assert_eq!(gripper.last_violation_s, Some(0.0));
        assert_eq!(report.motors[&id("elbow_flex")].violations, 0);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "warning");
    }

    #[test]
    fn start_is_idempotent_and_stop_is_a_noop_when_idle() {
        let r = rig_with(SafetyThresholds {
            monitor_frequency_hz: 20.0,
            ..Default::default()
        });
        r.monitor.stop_monitoring();
        assert!(!r.monitor.is_monitoring());

        r.monitor.start_monitoring();
        r.monitor.start_monitoring();
        assert!(r.monitor.is_monitoring());
        thread::sleep(Duration::from_millis(300));
        r.monitor.stop_monitoring();
        assert!(!r.monitor.is_monitoring());

        // One poll thread at 20Hz manages at most 1 + 300/50 cycles.
        let cycles = r.monitor.get_safety_report().statistics.poll_cycles;
        assert!((1..=8).contains(&cycles), "cycles = {cycles}");
    }

    /// Blocks the first temperature read and tracks overlapping batch reads.
    struct StallingBus {
        arm: SimulatedArm,
        stall: Duration,
        stalled: AtomicBool,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl MotorBus for StallingBus {
        fn motors(&self) -> Vec<MotorId> {
            self.arm.motors()
        }

        fn sync_read(&self, key: Telemetry) -> Result<Readings, BusError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if key == Telemetry::Temperature && !self.stalled.swap(true, Ordering::SeqCst) {
                thread::sleep(self.stall);
            }
            let readings = self.arm.sync_read(key);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            readings
        }

        fn read(&self, key: Register, motor: &MotorId) -> Result<f64, BusError> {
            self.arm.read(key, motor)
        }

        fn write(&self, key: Register, motor: &MotorId, value: f64) -> Result<(), BusError> {
            self.arm.write(key, motor, value)
        }

        fn disable_torque(&self, motor: Option<&MotorId>) -> Result<(), BusError> {
            self.arm.disable_torque(motor)
        }

        fn enable_torque(&self) -> Result<(), BusError> {
            self.arm.enable_torque()
        }

        fn calibration(&self, motor: &MotorId) -> Option<MotorRange> {
            self.arm.calibration(motor)
        }
    }

    #[test]
    fn restart_after_stuck_stop_keeps_a_single_poller() {
        let bus = Arc::new(StallingBus {
            arm: SimulatedArm::new(["elbow_flex"]),
            stall: STOP_JOIN_TIMEOUT + Duration::from_millis(500),
            stalled: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });
        let thresholds = SafetyThresholds {
            monitor_frequency_hz: 20.0,
            ..Default::default()
        };
        let monitor =
            MotorSafetyMonitor::new(Arc::clone(&bus), thresholds, Arc::new(ManualClock::new()))
                .unwrap();

        monitor.start_monitoring();
        thread::sleep(Duration::from_millis(50));
        // Gives up on the thread stuck in its first read.
        monitor.stop_monitoring();
        assert!(!monitor.is_monitoring());

        monitor.start_monitoring();
        thread::sleep(Duration::from_secs(1));
        monitor.stop_monitoring();
        assert_eq!(bus.max_in_flight.load(Ordering::SeqCst), 1);

        // The detached thread has finished its cycle and exited.
        let cycles = monitor.get_safety_report().statistics.poll_cycles;
        assert!(cycles > 0);
        thread::sleep(Duration::from_millis(200));
        assert_eq!(monitor.get_safety_report().statistics.poll_cycles, cycles);
    }

    #[test]
    fn scoped_guard_stops_on_drop() {
        let r = rig();
        {
            let guard = r.monitor.scoped();
            assert!(guard.is_monitoring());
        }
        assert!(!r.monitor.is_monitoring());
    }
}
