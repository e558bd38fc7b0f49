use crate::calibration::OperatorCalibrator;
use crate::infra::audit::{AuditEventType, AuditLogger};
use crate::metrics::{COLLISIONS, GOAL_MOVES, MOVE_DURATION_S, SAFETY_EVENTS};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::logging::init_tracing;
use crate::runtime::telemetry;
use safety_core::{
    Clock, CollisionAction, CollisionConfig, ConfigError, EventSink, MotorBus, MotorId,
    MotorRange, MotorSafetyMonitor, MoveResult, Readings, SafetyEvent, SafetyReport,
    SafetyThresholds, SimulatedArm, SmartCollisionSafetySystem, TimeBase,
};
use serde::Serialize;
use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

/// Travel limits applied to every simulated joint.
const SIM_RANGE: MotorRange = MotorRange {
    range_min: -100.0,
    range_max: 100.0,
};

/// Joint speed of the simulated arm, units/s. Below the default velocity limit.
const SIM_SLEW_RATE: f64 = 120.0;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Audit logging requested but failed to initialize: {0}")]
    Audit(#[source] std::io::Error),

    #[error("Motor '{0}' is not on the bus")]
    UnknownMotor(String),

    #[error("Failed to serialize session report: {0}")]
    Report(#[from] serde_json::Error),
}

/// Printed to stdout as JSON when a bounded session ends.
#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub report: SafetyReport,
    pub moves: Vec<MoveResult>,
    pub total_collisions: u32,
}

pub fn run_from_args() -> ExitCode {
    let config = match RuntimeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("arm-guard: {e}\nTry 'arm-guard --help' for usage.");
            return ExitCode::from(2);
        }
    };
    if config.show_help {
        RuntimeConfig::print_help();
        return ExitCode::SUCCESS;
    }
    match run(config) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Session failed");
            ExitCode::FAILURE
        }
    }
}

pub fn run(config: RuntimeConfig) -> Result<SessionSummary, AppError> {
    // Held until return so the rolling file appender flushes
    let _log_guard = init_tracing(config.json_logs, config.log_dir.as_deref());

    telemetry::init();
    let metrics_enabled = config.metrics_addr.is_some();
    let _metrics_handle = telemetry::start_metrics_server(&config.metrics_addr);

    let thresholds = load_or_default(
        config.thresholds_path.as_deref(),
        SafetyThresholds::from_json_file,
    )?;
    let collision = load_or_default(
        config.collision_path.as_deref(),
        CollisionConfig::from_json_file,
    )?;

    let timebase = TimeBase::new();
    let clock: Arc<dyn Clock> = Arc::new(timebase);

    let audit = init_audit_logger(config.audit_path.as_deref(), timebase)?;
    if let Some(logger) = &audit {
        let _ = logger.record(
            AuditEventType::SessionStart,
            serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "motors": config.motors,
                "metrics_enabled": metrics_enabled,
            }),
        );
        let _ = logger.record(
            AuditEventType::ConfigLoaded,
            serde_json::json!({
                "thresholds": thresholds,
                "collision": collision,
            }),
        );
    }

    let arm = Arc::new(build_arm(&config, Arc::clone(&clock))?);
    let goals = resolve_goals(arm.as_ref(), &config.goals)?;

    let (tx, rx) = mpsc::channel();
    let pump = spawn_event_pump(rx, audit.clone());

    info!(
        motors = config.motors.len(),
        monitor_hz = thresholds.monitor_frequency_hz,
        shutdown_c = thresholds.temperature_shutdown_c,
        stall_ma = thresholds.current_stall_threshold_ma,
        "Starting safety monitor"
    );
    let monitor = Arc::new(
        MotorSafetyMonitor::new(Arc::clone(&arm), thresholds, Arc::clone(&clock))?
            .with_events(EventSink::new(tx.clone())),
    );
    let calibrator = Arc::new(OperatorCalibrator::new(
        Arc::clone(&arm),
        config.unattended,
    ));
    let system = Arc::new(
        SmartCollisionSafetySystem::new(Arc::clone(&arm), collision, clock, calibrator)?
            .with_events(EventSink::new(tx))
            .with_monitor(Arc::clone(&monitor)),
    );

    let stop = Arc::new(AtomicBool::new(false));
    let updater = telemetry::start_metrics_updater(
        Arc::clone(&monitor),
        Arc::clone(&system),
        Arc::clone(&stop),
    );

    let started = Instant::now();
    let mut moves = Vec::new();
    {
        let _monitoring = monitor.scoped();

        if !goals.is_empty() {
            let result = run_goal_move(&system, &goals, config.move_timeout);
            if let Some(logger) = &audit {
                let _ = logger.record(
                    AuditEventType::MoveCompleted,
                    serde_json::to_value(&result)?,
                );
            }
            moves.push(result);
        }

        match config.run_seconds {
            Some(seconds) => {
                info!(seconds, "Running for limited duration");
                thread::sleep(Duration::from_secs(seconds).saturating_sub(started.elapsed()));
            }
            None => {
                info!("Supervising until terminated");
                loop {
                    thread::sleep(Duration::from_secs(60));
                }
            }
        }
    }

    stop.store(true, Ordering::Relaxed);
    let _ = updater.join();

    let summary = SessionSummary {
        report: monitor.get_safety_report(),
        moves,
        total_collisions: system.detector().total_collisions(),
    };
    let stats = &summary.report.statistics;
    info!(
        status = summary.report.status.as_str(),
        poll_cycles = stats.poll_cycles,
        total_violations = stats.total_violations,
        emergency_stops = stats.emergency_stops,
        total_collisions = summary.total_collisions,
        "Run complete"
    );

    if let Some(logger) = &audit {
        let _ = logger.record(
            AuditEventType::SessionStop,
            serde_json::json!({
                "status": summary.report.status,
                "poll_cycles": stats.poll_cycles,
                "total_violations": stats.total_violations,
                "total_collisions": summary.total_collisions,
            }),
        );
    }

    // The event pump drains until every sender is gone
    drop(system);
    drop(monitor);
    if pump.join().is_err() {
        warn!("Safety event pump panicked");
    }

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(summary)
}

fn load_or_default<T: Default>(
    path: Option<&Path>,
    load: fn(&Path) -> Result<T, ConfigError>,
) -> Result<T, ConfigError> {
    match path {
        Some(path) => {
            let loaded = load(path)?;
            info!(path = %path.display(), "Loaded configuration");
            Ok(loaded)
        }
        None => Ok(T::default()),
    }
}

fn init_audit_logger(
    path: Option<&Path>,
    timebase: TimeBase,
) -> Result<Option<Arc<AuditLogger>>, AppError> {
    let Some(path) = path else {
        return Ok(None);
    };
    let logger = AuditLogger::open(path, timebase).map_err(AppError::Audit)?;
    info!(path = %path.display(), "Audit logging enabled");
    Ok(Some(Arc::new(logger)))
}

fn build_arm(config: &RuntimeConfig, clock: Arc<dyn Clock>) -> Result<SimulatedArm, AppError> {
    let arm = SimulatedArm::new(config.motors.iter().map(String::as_str))
        .with_slew_rate(SIM_SLEW_RATE)
        .with_clock(clock);
    for motor in &config.motors {
        arm.set_range(motor, SIM_RANGE);
    }
    for (motor, position) in &config.obstacles {
        if !config.motors.contains(motor) {
            return Err(AppError::UnknownMotor(motor.clone()));
        }
        info!(motor = %motor, position, "Placing simulated obstacle");
        arm.add_obstacle(motor, *position);
    }
    Ok(arm)
}

fn resolve_goals<B: MotorBus>(bus: &B, goals: &[(String, f64)]) -> Result<Readings, AppError> {
    let motors = bus.motors();
    goals
        .iter()
        .map(|(motor, target)| {
            let id = MotorId::from(motor.as_str());
            if motors.contains(&id) {
                Ok((id, *target))
            } else {
                Err(AppError::UnknownMotor(motor.clone()))
            }
        })
        .collect()
}

fn run_goal_move<B: MotorBus + 'static>(
    system: &SmartCollisionSafetySystem<B>,
    goals: &Readings,
    timeout: Duration,
) -> MoveResult {
    info!(motors = goals.len(), timeout_s = timeout.as_secs_f64(), "Starting goal move");
    let result = system.safe_move_with_collision_detection(goals, timeout);

    for (motor, actions) in &result.collisions {
        for action in actions {
            let kind = match action {
                CollisionAction::Backoff { .. } => "backoff",
                CollisionAction::Abort { .. } => "abort",
                _ => continue,
            };
            COLLISIONS.with_label_values(&[motor.as_str(), kind]).inc();
        }
    }
    let outcome = match (&result.error, result.success) {
        (Some(_), _) => "error",
        (None, true) => "success",
        (None, false) => "incomplete",
    };
    GOAL_MOVES.with_label_values(&[outcome]).inc();
    MOVE_DURATION_S.observe(result.elapsed_s);

    info!(
        outcome,
        cycles = result.cycles,
        elapsed_s = result.elapsed_s,
        backed_off = result.backed_off.len(),
        aborted = result.aborted.len(),
        recalibrated = result.recalibration_triggered,
        "Goal move finished"
    );
    if let Some(e) = &result.error {
        warn!(error = %e, "Goal move ended on a fault");
    }
    result
}

fn spawn_event_pump(
    rx: Receiver<SafetyEvent>,
    audit: Option<Arc<AuditLogger>>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for event in rx {
            SAFETY_EVENTS.with_label_values(&[event.kind()]).inc();
            match &event {
                SafetyEvent::TemperatureShutdown {
                    motor,
                    temperature_c,
                } => error!(motor = %motor, temperature_c, "Motor disabled on overtemperature"),
                SafetyEvent::StallDetected { motor, current_ma } => {
                    error!(motor = %motor, current_ma, "Motor disabled on stall")
                }
                SafetyEvent::EmergencyStop => error!("Emergency stop engaged"),
                SafetyEvent::RecalibrationTriggered { total_collisions } => {
                    warn!(total_collisions, "Recalibration triggered")
                }
                SafetyEvent::RecalibrationFailed { reason } => {
                    warn!(reason = %reason, "Recalibration failed")
                }
            }
            if let Some(logger) = &audit {
                if let Err(e) = logger.record_safety_event(&event) {
                    warn!(error = %e, "Failed to write audit entry");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn goals_must_name_bus_motors() {
        let arm = SimulatedArm::new(["shoulder_pan", "gripper"]);
        let goals = resolve_goals(&arm, &[("gripper".into(), 10.0)]).unwrap();
        assert_eq!(goals.get("gripper"), Some(&10.0));

        assert!(matches!(
            resolve_goals(&arm, &[("elbow_flex".into(), 10.0)]),
            Err(AppError::UnknownMotor(m)) if m == "elbow_flex"
        ));
    }

    #[test]
    fn obstacles_must_name_bus_motors() {
        let config = RuntimeConfig {
            motors: vec!["gripper".into()],
            obstacles: vec![("wrist_roll".into(), 5.0)],
            ..Default::default()
        };
        assert!(matches!(
            build_arm(&config, Arc::new(TimeBase::new())),
            Err(AppError::UnknownMotor(m)) if m == "wrist_roll"
        ));
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let result = load_or_default(
            Some(Path::new("/nonexistent/thresholds.json")),
            SafetyThresholds::from_json_file,
        );
        assert!(matches!(result, Err(ConfigError::Read { .. })));
        assert_eq!(
            load_or_default(None, SafetyThresholds::from_json_file).unwrap(),
            SafetyThresholds::default()
        );
    }
}
