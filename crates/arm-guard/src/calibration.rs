//! Operator-confirmed recalibration for the simulated arm.

use parking_lot::Mutex;
use safety_core::{CalibrationError, Calibrator, SimulatedArm};
use std::io::{self, BufRead, BufReader, Write};
use std::sync::Arc;
use tracing::{info, warn};

/// Prompts on stderr and waits for a line on the operator input before
/// re-homing the arm. Unattended sessions confirm immediately.
pub struct OperatorCalibrator {
    arm: Arc<SimulatedArm>,
    unattended: bool,
    input: Mutex<Box<dyn BufRead + Send>>,
}

impl OperatorCalibrator {
    pub fn new(arm: Arc<SimulatedArm>, unattended: bool) -> Self {
        Self {
            arm,
            unattended,
            input: Mutex::new(Box::new(BufReader::new(io::stdin()))),
        }
    }

    pub fn with_input(mut self, input: Box<dyn BufRead + Send>) -> Self {
        self.input = Mutex::new(input);
        self
    }
}

impl Calibrator for OperatorCalibrator {
    fn await_operator(&self, prompt: &str) -> Result<(), CalibrationError> {
        if self.unattended {
            info!(prompt, "Unattended session, confirming recalibration");
            return Ok(());
        }

        let mut stderr = io::stderr().lock();
        let _ = write!(stderr, "{prompt} Press ENTER to continue... ");
        let _ = stderr.flush();
        drop(stderr);

        let mut line = String::new();
        match self.input.lock().read_line(&mut line) {
            Ok(0) => Err(CalibrationError::OperatorAborted(
                "operator input closed".into(),
            )),
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(error = %e, "Failed to read operator confirmation");
                Err(CalibrationError::OperatorAborted(e.to_string()))
            }
        }
    }

    fn calibrate(&self) -> Result<(), CalibrationError> {
        self.arm.recalibrate();
        info!(
            calibrations = self.arm.calibrations(),
            "Arm recalibrated"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn arm() -> Arc<SimulatedArm> {
        Arc::new(SimulatedArm::new(["elbow_flex"]))
    }

    #[test]
    fn confirmation_line_lets_calibration_proceed() {
        let arm = arm();
        let calibrator = OperatorCalibrator::new(Arc::clone(&arm), false)
            .with_input(Box::new(Cursor::new(b"\n".to_vec())));

        calibrator.await_operator("Center the arm.").unwrap();
        calibrator.calibrate().unwrap();
        assert_eq!(arm.calibrations(), 1);
    }

    #[test]
    fn closed_input_aborts() {
        let calibrator =
            OperatorCalibrator::new(arm(), false).with_input(Box::new(Cursor::new(Vec::new())));

        assert!(matches!(
            calibrator.await_operator("Center the arm."),
            Err(CalibrationError::OperatorAborted(_))
        ));
    }

    #[test]
    fn unattended_never_reads_input() {
        let calibrator =
            OperatorCalibrator::new(arm(), true).with_input(Box::new(Cursor::new(Vec::new())));
        assert!(calibrator.await_operator("Center the arm.").is_ok());
    }
}
