//! Prometheus metrics for arm-guard observability.
//!
//! Motor telemetry is exported per motor with a `motor` label; safety and
//! collision counters are fed from the event pump and the telemetry updater.

use prometheus::core::Collector;
use prometheus::{
    Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use safety_core::tags;
use std::sync::LazyLock;
use std::thread;
use tiny_http::{Header, Response, Server};

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

fn register<C: Collector + Clone + 'static>(collector: C) -> C {
    REGISTRY
        .register(Box::new(collector.clone()))
        .expect("metric registered twice");
    collector
}

fn motor_gauge(name: &str, help: &str) -> GaugeVec {
    register(GaugeVec::new(Opts::new(name, help), &["motor"]).expect("valid gauge opts"))
}

// ============================================================================
// Motor Telemetry
// ============================================================================

pub static MOTOR_TEMPERATURE_C: LazyLock<GaugeVec> = LazyLock::new(|| {
    motor_gauge(
        tags::PRESENT_TEMPERATURE.metric,
        "Latest motor temperature in Celsius",
    )
});

pub static MOTOR_CURRENT_MA: LazyLock<GaugeVec> = LazyLock::new(|| {
    motor_gauge(
        tags::PRESENT_CURRENT.metric,
        "Latest motor current draw in milliamps",
    )
});

pub static MOTOR_POSITION: LazyLock<GaugeVec> = LazyLock::new(|| {
    motor_gauge(tags::PRESENT_POSITION.metric, "Latest motor position")
});

// ============================================================================
// Safety Monitor
// ============================================================================

/// Safety status (0=normal,1=warning,2=critical,3=emergency_stop)
pub static SAFETY_STATUS: LazyLock<Gauge> = LazyLock::new(|| {
    register(
        Gauge::new(
            tags::SAFETY_STATUS.metric,
            "Safety status (0=normal,1=warning,2=critical,3=emergency_stop)",
        )
        .expect("valid gauge opts"),
    )
});

pub static POLL_CYCLES: LazyLock<IntCounter> = LazyLock::new(|| {
    register(
        IntCounter::new(
            "armguard_safety_poll_cycles_total",
            "Safety monitor poll cycles completed",
        )
        .expect("valid counter opts"),
    )
});

pub static POLL_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    register(
        IntCounter::new(
            "armguard_safety_poll_failures_total",
            "Safety monitor poll cycles skipped after a failed batch read",
        )
        .expect("valid counter opts"),
    )
});

pub static SAFETY_EVENTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register(
        IntCounterVec::new(
            Opts::new(
                "armguard_safety_events_total",
                "Safety events published, by event kind",
            ),
            &["event"],
        )
        .expect("valid counter opts"),
    )
});

// ============================================================================
// Collision Detection
// ============================================================================

pub static COLLISIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register(
        IntCounterVec::new(
            Opts::new(
                "armguard_collisions_total",
                "Confirmed collisions, by motor and response",
            ),
            &["motor", "action"],
        )
        .expect("valid counter opts"),
    )
});

pub static GOAL_MOVES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register(
        IntCounterVec::new(
            Opts::new("armguard_goal_moves_total", "Goal moves, by outcome"),
            &["outcome"],
        )
        .expect("valid counter opts"),
    )
});

pub static MOVE_DURATION_S: LazyLock<Histogram> = LazyLock::new(|| {
    register(
        Histogram::with_opts(
            HistogramOpts::new("armguard_goal_move_seconds", "Goal move wall-clock duration")
                .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )
        .expect("valid histogram opts"),
    )
});

pub static POLL_FREQUENCY_HZ: LazyLock<Gauge> = LazyLock::new(|| {
    register(
        Gauge::new(
            tags::POLL_FREQUENCY.metric,
            "Adaptive collision polling frequency in Hz",
        )
        .expect("valid gauge opts"),
    )
});

pub static SMOOTHNESS: LazyLock<Gauge> = LazyLock::new(|| {
    register(
        Gauge::new(
            "armguard_motion_smoothness",
            "Motion smoothness score (0.0-1.0)",
        )
        .expect("valid gauge opts"),
    )
});

// ============================================================================
// Metrics HTTP Server
// ============================================================================

/// Start the metrics HTTP server on the given address.
/// Returns a join handle for the server thread.
pub fn serve_metrics(bind_addr: String) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let server = match Server::http(&bind_addr) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to start metrics server on {}: {}", bind_addr, e);
                return;
            }
        };

        tracing::info!("Metrics server listening on http://{}/metrics", bind_addr);

        for request in server.incoming_requests() {
            let response = match request.url() {
                "/metrics" => {
                    let mut buffer = Vec::new();
                    match TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer) {
                        Ok(()) => {
                            let response = Response::from_data(buffer);
                            match Header::from_bytes(
                                &b"Content-Type"[..],
                                &b"text/plain; version=0.0.4"[..],
                            ) {
                                Ok(header) => response.with_header(header),
                                Err(()) => response,
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Failed to encode metrics: {}", e);
                            Response::from_data(b"Internal Server Error".to_vec())
                                .with_status_code(500)
                        }
                    }
                }
                "/health" => Response::from_data(b"OK".to_vec()),
                // Ready once the safety monitor has completed a poll
                "/ready" if POLL_CYCLES.get() > 0 => Response::from_data(b"Ready".to_vec()),
                "/ready" => Response::from_data(b"Not Ready".to_vec()).with_status_code(503),
                _ => Response::from_data(b"Not Found".to_vec()).with_status_code(404),
            };
            let _ = request.respond(response);
        }
    })
}

/// Initialize all metrics (forces lazy initialization)
pub fn init_metrics() {
    let _ = MOTOR_TEMPERATURE_C.desc();
    let _ = MOTOR_CURRENT_MA.desc();
    let _ = MOTOR_POSITION.desc();
    let _ = SAFETY_STATUS.get();
    let _ = POLL_CYCLES.get();
    let _ = POLL_FAILURES.get();
    let _ = SAFETY_EVENTS.desc();
    let _ = COLLISIONS.desc();
    let _ = GOAL_MOVES.desc();
    let _ = MOVE_DURATION_S.get_sample_count();
    let _ = POLL_FREQUENCY_HZ.get();
    let _ = SMOOTHNESS.get();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_exports_motor_labels() {
        init_metrics();
        MOTOR_TEMPERATURE_C.with_label_values(&["gripper"]).set(41.5);
        SAFETY_EVENTS.with_label_values(&["stall_detected"]).inc();

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&REGISTRY.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();

        assert!(text.contains(r#"armguard_motor_temperature_celsius{motor="gripper"} 41.5"#));
        assert!(text.contains(r#"armguard_safety_events_total{event="stall_detected"}"#));
        assert!(text.contains("armguard_safety_status"));
    }
}
