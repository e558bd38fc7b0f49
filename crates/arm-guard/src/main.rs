mod calibration;
mod infra;
mod metrics;
mod runtime;

use std::process::ExitCode;

fn main() -> ExitCode {
    runtime::run_from_args()
}
