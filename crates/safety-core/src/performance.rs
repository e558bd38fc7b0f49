//! Smoothness and latency tracking driving the adaptive polling rate.
//!
//! The control law here is an empirically tuned heuristic, not a derived
//! optimum. Its constants (the x10 jitter scale, the smoothness tiers, the
//! 0.7/0.3 blend) are kept as-is so behaviour matches the tuned arm; retune
//! them as a set against recorded sessions rather than individually.

use crate::bus::{MotorId, Readings};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

pub const LATENCY_HISTORY_LEN: usize = 100;
pub const SMOOTHNESS_HISTORY_LEN: usize = 100;
pub const JITTER_HISTORY_LEN: usize = 50;

/// Samples averaged for the rolling latency and smoothness figures.
const RECENT_WINDOW: usize = 10;

pub const MIN_FREQUENCY_HZ: f64 = 0.5;
pub const MAX_FREQUENCY_HZ: f64 = 10.0;

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceMetrics {
    /// 1.0 is perfectly smooth.
    pub smoothness_score: f64,
    /// Mean of the last ten loop latencies.
    pub latency_ms: f64,
    pub monitoring_frequency_hz: f64,
    pub optimal_frequency_hz: f64,

    #[serde(skip)]
    latency_history: VecDeque<f64>,
    #[serde(skip)]
    smoothness_history: VecDeque<f64>,
    #[serde(skip)]
    position_jitter: VecDeque<f64>,
    #[serde(skip)]
    last_positions: BTreeMap<MotorId, f64>,
    #[serde(skip)]
    last_sample_s: Option<f64>,
}

impl PerformanceMetrics {
    pub fn new(initial_frequency_hz: f64) -> Self {
        let hz = initial_frequency_hz.clamp(MIN_FREQUENCY_HZ, MAX_FREQUENCY_HZ);
        Self {
            smoothness_score: 1.0,
            latency_ms: 0.0,
            monitoring_frequency_hz: hz,
            optimal_frequency_hz: hz,
            latency_history: VecDeque::with_capacity(LATENCY_HISTORY_LEN),
            smoothness_history: VecDeque::with_capacity(SMOOTHNESS_HISTORY_LEN),
            position_jitter: VecDeque::with_capacity(JITTER_HISTORY_LEN),
            last_positions: BTreeMap::new(),
            last_sample_s: None,
        }
    }

    /// Fold a new position sample into the smoothness figure and re-plan the
    /// polling rate. Returns the current smoothness score.
    pub fn update_smoothness(&mut self, positions: &Readings, timestamp_s: f64) -> f64 {
        if !self.last_positions.is_empty() {
            let mut deltas = Vec::with_capacity(positions.len());
            for (motor, pos) in positions {
                if let Some(last) = self.last_positions.get(motor) {
                    let delta = (pos - last).abs();
                    deltas.push(delta);
                    push_bounded(&mut self.position_jitter, delta, JITTER_HISTORY_LEN);
                }
            }

            if !deltas.is_empty() {
                let avg_jitter = mean(&deltas);
                let smoothness = (1.0 - avg_jitter * 10.0).max(0.0);
                self.smoothness_score = smoothness;
                push_bounded(&mut self.smoothness_history, smoothness, SMOOTHNESS_HISTORY_LEN);
            }
        }

        self.last_positions = positions.clone();
        self.last_sample_s = Some(timestamp_s);
        self.recalculate_frequency();
        self.smoothness_score
    }

    pub fn record_latency(&mut self, latency_ms: f64) {
        push_bounded(&mut self.latency_history, latency_ms, LATENCY_HISTORY_LEN);
        self.latency_ms = mean_of_recent(&self.latency_history);
    }

    pub fn adaptive_frequency(&self) -> f64 {
        self.optimal_frequency_hz
    }

    pub fn smoothness_samples(&self) -> usize {
        self.smoothness_history.len()
    }

    pub fn jitter_samples(&self) -> usize {
        self.position_jitter.len()
    }

    pub fn latency_samples(&self) -> usize {
        self.latency_history.len()
    }

    /// Timestamp of the last position sample, if any.
    pub fn last_sample_s(&self) -> Option<f64> {
        self.last_sample_s
    }

    fn recalculate_frequency(&mut self) {
        if self.smoothness_history.len() < RECENT_WINDOW {
            return;
        }

        let smoothness = mean_of_recent(&self.smoothness_history);
        let latency = mean_of_recent(&self.latency_history);
        let current = self.monitoring_frequency_hz;

        let optimal = if smoothness < 0.7 && latency < 20.0 {
            // Jittery but cheap: sample faster.
            (current * 1.5).min(MAX_FREQUENCY_HZ)
        } else if smoothness > 0.9 && latency > 50.0 {
            (current * 0.7).max(1.0)
        } else if latency > 100.0 {
            (current * 0.5).max(MIN_FREQUENCY_HZ)
        } else {
            let target = if smoothness > 0.8 {
                2.0
            } else if smoothness > 0.6 {
                5.0
            } else {
                8.0
            };
            0.7 * current + 0.3 * target
        };

        self.optimal_frequency_hz = optimal.clamp(MIN_FREQUENCY_HZ, MAX_FREQUENCY_HZ);
        self.monitoring_frequency_hz = self.optimal_frequency_hz;

        log::debug!(
            "Performance: smoothness={:.2}, latency={:.1}ms, optimal_freq={:.1}Hz",
            smoothness,
            latency,
            self.optimal_frequency_hz
        );
    }
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self::new(2.0)
    }
}

fn push_bounded(buf: &mut VecDeque<f64>, value: f64, cap: usize) {
    if buf.len() == cap {
        buf.pop_front();
    }
    buf.push_back(value);
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn mean_of_recent(buf: &VecDeque<f64>) -> f64 {
    let n = buf.len().min(RECENT_WINDOW);
    if n == 0 {
        return 0.0;
    }
    buf.iter().rev().take(n).sum::<f64>() / n as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn positions(value: f64) -> Readings {
        let mut r = Readings::new();
        r.insert(MotorId::from("a"), value);
        r.insert(MotorId::from("b"), value);
        r
    }

    #[test]
    fn first_sample_keeps_perfect_score() {
        let mut m = PerformanceMetrics::default();
        assert_eq!(m.update_smoothness(&positions(0.0), 0.0), 1.0);
        assert_eq!(m.smoothness_samples(), 0);
    }

    #[test]
    fn jitter_lowers_smoothness() {
        let mut m = PerformanceMetrics::default();
        m.update_smoothness(&positions(0.0), 0.0);
        let score = m.update_smoothness(&positions(0.05), 0.1);
        assert!((score - 0.5).abs() < 1e-9);
        let floor = m.update_smoothness(&positions(1.0), 0.2);
        assert_eq!(floor, 0.0);
        assert_eq!(m.jitter_samples(), 4);
    }

    #[test]
    fn frequency_holds_until_ten_samples() {
        let mut m = PerformanceMetrics::default();
        for i in 0..10 {
            m.update_smoothness(&positions(i as f64), i as f64);
        }
        // Nine deltas so far.
        assert_eq!(m.adaptive_frequency(), 2.0);
        m.update_smoothness(&positions(10.0), 10.0);
        assert!(m.adaptive_frequency() > 2.0);
    }

    #[test]
    fn jittery_low_latency_speeds_up_to_cap() {
        let mut m = PerformanceMetrics::default();
        for i in 0..40 {
            m.record_latency(5.0);
            m.update_smoothness(&positions(if i % 2 == 0 { 0.0 } else { 1.0 }), i as f64);
        }
        assert_eq!(m.adaptive_frequency(), MAX_FREQUENCY_HZ);
    }

    #[test]
    fn very_high_latency_backs_off_to_floor() {
        let mut m = PerformanceMetrics::default();
        for i in 0..40 {
            m.record_latency(250.0);
            m.update_smoothness(&positions(if i % 2 == 0 { 0.0 } else { 0.05 }), i as f64);
        }
        assert_eq!(m.adaptive_frequency(), MIN_FREQUENCY_HZ);
    }

    #[test]
    fn smooth_motion_converges_toward_two_hz() {
        let mut m = PerformanceMetrics::new(8.0);
        for i in 0..60 {
            m.record_latency(10.0);
            m.update_smoothness(&positions(0.0), i as f64);
        }
        assert!((m.adaptive_frequency() - 2.0).abs() < 0.01);
    }

    #[test]
    fn latency_is_rolling_mean_of_ten() {
        let mut m = PerformanceMetrics::default();
        for _ in 0..10 {
            m.record_latency(100.0);
        }
        for _ in 0..10 {
            m.record_latency(10.0);
        }
        assert_eq!(m.latency_ms, 10.0);
        for _ in 0..200 {
            m.record_latency(1.0);
        }
        assert_eq!(m.latency_samples(), LATENCY_HISTORY_LEN);
    }
}
