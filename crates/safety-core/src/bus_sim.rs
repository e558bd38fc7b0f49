use crate::bus::{MotorBus, MotorId, MotorRange, Readings, Register, Telemetry};
use crate::error::BusError;
use crate::timebase::{us_to_secs, Clock};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Command issued to the simulated bus, kept in a journal for inspection.
#[derive(Debug, Clone, PartialEq)]
pub enum BusCommand {
    Write {
        register: Register,
        motor: MotorId,
        value: f64,
    },
    DisableTorque(Option<MotorId>),
    EnableTorque,
}

#[derive(Debug, Clone)]
struct SimServo {
    position: f64,
    goal: f64,
    goal_velocity: f64,
    torque_limit: f64,
    torque_enabled: bool,
    temperature_c: f64,
    current_ma: f64,
    load: f64,
    range: Option<MotorRange>,
    /// Obstacle position and the direction it blocks (+1 or -1).
    obstacle: Option<(f64, f64)>,
}

impl SimServo {
    fn new() -> Self {
        Self {
            position: 0.0,
            goal: 0.0,
            goal_velocity: 0.0,
            torque_limit: DEFAULT_TORQUE_LIMIT,
            torque_enabled: true,
            temperature_c: AMBIENT_TEMP_C,
            current_ma: IDLE_CURRENT_MA,
            load: 0.0,
            range: None,
            obstacle: None,
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    servos: BTreeMap<MotorId, SimServo>,
    pinned: HashMap<(Telemetry, MotorId), f64>,
    fail_reads: bool,
    journal: Vec<BusCommand>,
    calibrations: u32,
    last_step_us: Option<u64>,
}

pub const DEFAULT_TORQUE_LIMIT: f64 = 1000.0;
const AMBIENT_TEMP_C: f64 = 25.0;
const IDLE_CURRENT_MA: f64 = 20.0;
const MOVING_CURRENT_MA: f64 = 150.0;
const BLOCKED_CURRENT_MA: f64 = 1000.0;
const MOVING_LOAD: f64 = 100.0;
const BLOCKED_LOAD: f64 = 600.0;
const SUPPLY_VOLTAGE: f64 = 12.0;

/// Simulated servo arm with slew-limited motion, obstacles and thermal dynamics.
///
/// Physics advances every time positions are batch-read: by `tick_s`, or by
/// the elapsed time since the previous read when a clock is attached. Any
/// telemetry value can be pinned to script a scenario.
pub struct SimulatedArm {
    state: Mutex<SimState>,
    clock: Option<Arc<dyn Clock>>,
    slew_rate: f64,
    tick_s: f64,
    heat_gain: f64,
    cooling_rate: f64,
    thermal_mass: f64,
}

impl SimulatedArm {
    pub fn new<I, S>(motors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<MotorId>,
    {
        let servos = motors
            .into_iter()
            .map(|m| (m.into(), SimServo::new()))
            .collect();
        Self {
            state: Mutex::new(SimState {
                servos,
                ..Default::default()
            }),
            clock: None,
            slew_rate: 200.0,
            tick_s: 0.25,
            heat_gain: 30.0,
            cooling_rate: 0.5,
            thermal_mass: 20.0,
        }
    }

    /// Units per second the servos can travel.
    pub fn with_slew_rate(mut self, slew_rate: f64) -> Self {
        self.slew_rate = slew_rate;
        self
    }

    /// Simulated time advanced per position read.
    pub fn with_tick(mut self, tick_s: f64) -> Self {
        self.tick_s = tick_s;
        self
    }

    /// Advance physics by wall time instead of a fixed tick.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    fn elapsed_since_last_read(&self) -> f64 {
        let Some(clock) = &self.clock else {
            return self.tick_s;
        };
        let now_us = clock.now_us();
        let last = self.state.lock().last_step_us.replace(now_us);
        last.map_or(0.0, |prev| us_to_secs(now_us.saturating_sub(prev)))
    }

    pub fn step(&self, dt_s: f64) {
        let mut state = self.state.lock();
        for servo in state.servos.values_mut() {
            self.step_servo(servo, dt_s);
        }
    }

    fn step_servo(&self, servo: &mut SimServo, dt_s: f64) {
        let mut blocked = false;
        let mut moving = false;

        if servo.torque_enabled {
            let max_step = self.slew_rate * dt_s;
            let error = servo.goal - servo.position;
            let direction = error.signum();
            let mut next = servo.position + error.clamp(-max_step, max_step);

            if let Some((obstacle, side)) = servo.obstacle {
                let ahead = (obstacle - servo.position) * side >= 0.0;
                let goal_beyond = (servo.goal - obstacle) * side > 0.0;
                let within_reach = (obstacle - servo.position).abs() <= max_step;
                if error != 0.0 && direction == side && ahead && goal_beyond && within_reach {
                    next = obstacle;
                    blocked = true;
                }
            }

            moving = !blocked && next != servo.position;
            servo.position = next;
        }

        (servo.current_ma, servo.load) = if blocked {
            (BLOCKED_CURRENT_MA, BLOCKED_LOAD)
        } else if moving {
            (MOVING_CURRENT_MA, MOVING_LOAD)
        } else {
            (IDLE_CURRENT_MA, 0.0)
        };

        let current_a = servo.current_ma / 1000.0;
        let heat_in = self.heat_gain * current_a * current_a;
        let heat_out = self.cooling_rate * (servo.temperature_c - AMBIENT_TEMP_C);
        servo.temperature_c += (heat_in - heat_out) * dt_s / self.thermal_mass;
    }

    pub fn set_range(&self, motor: &str, range: MotorRange) {
        if let Some(servo) = self.state.lock().servos.get_mut(motor) {
            servo.range = Some(range);
        }
    }

    /// Teleport a servo (position and goal) without motion.
    pub fn set_position(&self, motor: &str, position: f64) {
        if let Some(servo) = self.state.lock().servos.get_mut(motor) {
            servo.position = position;
            servo.goal = position;
        }
    }

    pub fn set_temperature(&self, motor: &str, temperature_c: f64) {
        if let Some(servo) = self.state.lock().servos.get_mut(motor) {
            servo.temperature_c = temperature_c;
        }
    }

    /// Place an obstacle in the servo's path. It blocks motion toward it
    /// from the side the servo is on now.
    pub fn add_obstacle(&self, motor: &str, position: f64) {
        if let Some(servo) = self.state.lock().servos.get_mut(motor) {
            let side = if position < servo.position { -1.0 } else { 1.0 };
            servo.obstacle = Some((position, side));
        }
    }

    pub fn clear_obstacles(&self) {
        for servo in self.state.lock().servos.values_mut() {
            servo.obstacle = None;
        }
    }

    /// Force a telemetry value regardless of the simulated physics.
    pub fn pin(&self, key: Telemetry, motor: &str, value: f64) {
        self.state
            .lock()
            .pinned
            .insert((key, MotorId::from(motor)), value);
    }

    pub fn unpin(&self, key: Telemetry, motor: &str) {
        self.state.lock().pinned.remove(&(key, MotorId::from(motor)));
    }

    pub fn fail_reads(&self, fail: bool) {
        self.state.lock().fail_reads = fail;
    }

    pub fn journal(&self) -> Vec<BusCommand> {
        self.state.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.state.lock().journal.clear();
    }

    pub fn torque_enabled(&self, motor: &str) -> bool {
        self.state
            .lock()
            .servos
            .get(motor)
            .is_some_and(|s| s.torque_enabled)
    }

    /// Re-home every servo: goal follows position, ranges are kept.
    pub fn recalibrate(&self) {
        let mut state = self.state.lock();
        for servo in state.servos.values_mut() {
            servo.goal = servo.position;
        }
        state.calibrations += 1;
    }

    pub fn calibrations(&self) -> u32 {
        self.state.lock().calibrations
    }
}

impl MotorBus for SimulatedArm {
    fn motors(&self) -> Vec<MotorId> {
        self.state.lock().servos.keys().cloned().collect()
    }

    fn sync_read(&self, key: Telemetry) -> Result<Readings, BusError> {
        if key == Telemetry::Position {
            self.step(self.elapsed_since_last_read());
        }

        let state = self.state.lock();
        if state.fail_reads {
            return Err(BusError::Transport(format!(
                "no status packet for {}",
                key.tag().key
            )));
        }

        Ok(state
            .servos
            .iter()
            .map(|(motor, servo)| {
                let physical = match key {
                    Telemetry::Temperature => servo.temperature_c,
                    Telemetry::Current => servo.current_ma,
                    Telemetry::Position => servo.position,
                    Telemetry::Load => servo.load,
                    Telemetry::Voltage => SUPPLY_VOLTAGE,
                };
                let value = state
                    .pinned
                    .get(&(key, motor.clone()))
                    .copied()
                    .unwrap_or(physical);
                (motor.clone(), value)
            })
            .collect())
    }

    fn read(&self, key: Register, motor: &MotorId) -> Result<f64, BusError> {
        let state = self.state.lock();
        if state.fail_reads {
            return Err(BusError::Transport(format!(
                "no status packet for {}",
                key.tag().key
            )));
        }
        let servo = state
            .servos
            .get(motor)
            .ok_or_else(|| BusError::UnknownMotor(motor.to_string()))?;
        Ok(match key {
            Register::GoalPosition => servo.goal,
            Register::GoalVelocity => servo.goal_velocity,
            Register::TorqueLimit => servo.torque_limit,
        })
    }

    fn write(&self, key: Register, motor: &MotorId, value: f64) -> Result<(), BusError> {
        let mut state = self.state.lock();
        let servo = state
            .servos
            .get_mut(motor)
            .ok_or_else(|| BusError::UnknownMotor(motor.to_string()))?;
        match key {
            Register::GoalPosition => {
                servo.goal = servo.range.map_or(value, |r| r.clamp(value));
            }
            Register::GoalVelocity => servo.goal_velocity = value,
            Register::TorqueLimit => servo.torque_limit = value,
        }
        state.journal.push(BusCommand::Write {
            register: key,
            motor: motor.clone(),
            value,
        });
        Ok(())
    }

    fn disable_torque(&self, motor: Option<&MotorId>) -> Result<(), BusError> {
        let mut state = self.state.lock();
        match motor {
            Some(m) => {
                let servo = state
                    .servos
                    .get_mut(m)
                    .ok_or_else(|| BusError::UnknownMotor(m.to_string()))?;
                servo.torque_enabled = false;
            }
            None => {
                for servo in state.servos.values_mut() {
                    servo.torque_enabled = false;
                }
            }
        }
        state.journal.push(BusCommand::DisableTorque(motor.cloned()));
        Ok(())
    }

    fn enable_torque(&self) -> Result<(), BusError> {
        let mut state = self.state.lock();
        for servo in state.servos.values_mut() {
            servo.torque_enabled = true;
        }
        state.journal.push(BusCommand::EnableTorque);
        Ok(())
    }

    fn calibration(&self, motor: &MotorId) -> Option<MotorRange> {
        self.state.lock().servos.get(motor).and_then(|s| s.range)
    }
}
