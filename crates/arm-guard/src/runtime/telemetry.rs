use crate::metrics::{
    init_metrics, serve_metrics, MOTOR_CURRENT_MA, MOTOR_POSITION, MOTOR_TEMPERATURE_C,
    POLL_CYCLES, POLL_FAILURES, POLL_FREQUENCY_HZ, SAFETY_STATUS, SMOOTHNESS,
};
use safety_core::{MotorBus, MotorSafetyMonitor, SmartCollisionSafetySystem};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::info;

const UPDATE_INTERVAL: Duration = Duration::from_millis(200);

pub fn init() {
    init_metrics();
}

pub fn start_metrics_server(addr: &Option<String>) -> Option<thread::JoinHandle<()>> {
    addr.as_ref().map(|addr| {
        info!(addr = %addr, "Starting metrics server");
        serve_metrics(addr.clone())
    })
}

/// Mirror the monitor report and collision metrics into Prometheus until `stop` is set.
pub fn start_metrics_updater<B: MotorBus + 'static>(
    monitor: Arc<MotorSafetyMonitor<B>>,
    system: Arc<SmartCollisionSafetySystem<B>>,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut last_cycles = 0u64;
        let mut last_failures = 0u64;
        while !stop.load(Ordering::Relaxed) {
            let report = monitor.get_safety_report();
            SAFETY_STATUS.set(f64::from(report.status.level()));
            for (motor, m) in &report.motors {
                let label = [motor.as_str()];
                MOTOR_TEMPERATURE_C.with_label_values(&label).set(m.temperature_c);
                MOTOR_CURRENT_MA.with_label_values(&label).set(m.current_ma);
                MOTOR_POSITION.with_label_values(&label).set(m.position);
            }

            let stats = &report.statistics;
            if stats.poll_cycles > last_cycles {
                POLL_CYCLES.inc_by(stats.poll_cycles - last_cycles);
                last_cycles = stats.poll_cycles;
            }
            if stats.poll_failures > last_failures {
                POLL_FAILURES.inc_by(stats.poll_failures - last_failures);
                last_failures = stats.poll_failures;
            }

            let perf = system.metrics();
            POLL_FREQUENCY_HZ.set(perf.adaptive_frequency());
            SMOOTHNESS.set(perf.smoothness_score);

            thread::sleep(UPDATE_INTERVAL);
        }
    })
}
