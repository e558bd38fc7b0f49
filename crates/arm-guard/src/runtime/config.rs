use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MOTORS: [&str; 6] = [
    "shoulder_pan",
    "shoulder_lift",
    "elbow_flex",
    "wrist_flex",
    "wrist_roll",
    "gripper",
];

#[derive(Debug, Error, PartialEq)]
pub enum ArgError {
    #[error("{flag} requires a value")]
    MissingValue { flag: &'static str },

    #[error("{flag}: expected a number, got '{value}'")]
    NotANumber { flag: &'static str, value: String },

    #[error("{flag}: expected motor=value, got '{value}'")]
    BadAssignment { flag: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub show_help: bool,
    pub run_seconds: Option<u64>,
    pub json_logs: bool,
    pub log_dir: Option<PathBuf>,
    pub metrics_addr: Option<String>,
    pub audit_path: Option<PathBuf>,
    pub thresholds_path: Option<PathBuf>,
    pub collision_path: Option<PathBuf>,
    pub motors: Vec<String>,
    pub goals: Vec<(String, f64)>,
    pub obstacles: Vec<(String, f64)>,
    pub move_timeout: Duration,
    pub unattended: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            show_help: false,
            run_seconds: None,
            json_logs: false,
            log_dir: None,
            metrics_addr: None,
            audit_path: None,
            thresholds_path: None,
            collision_path: None,
            motors: DEFAULT_MOTORS.iter().map(|m| m.to_string()).collect(),
            goals: Vec::new(),
            obstacles: Vec::new(),
            move_timeout: Duration::from_secs(5),
            unattended: false,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ArgError> {
        let args: Vec<String> = std::env::args().collect();
        Self::from_args(&args)
    }

    pub fn from_args(args: &[String]) -> Result<Self, ArgError> {
        let mut cfg = RuntimeConfig::default();
        let mut i = 1;
        while i < args.len() {
            let flag = args[i].as_str();
            let mut value = |name: &'static str| {
                i += 1;
                args.get(i)
                    .cloned()
                    .ok_or(ArgError::MissingValue { flag: name })
            };
            match flag {
                "--run-seconds" => {
                    let raw = value("--run-seconds")?;
                    cfg.run_seconds = Some(raw.parse().map_err(|_| ArgError::NotANumber {
                        flag: "--run-seconds",
                        value: raw,
                    })?);
                }
                "--json-logs" => cfg.json_logs = true,
                "--log-dir" => cfg.log_dir = Some(PathBuf::from(value("--log-dir")?)),
                "--metrics-addr" => cfg.metrics_addr = Some(value("--metrics-addr")?),
                "--audit-log" => cfg.audit_path = Some(PathBuf::from(value("--audit-log")?)),
                "--thresholds" => {
                    cfg.thresholds_path = Some(PathBuf::from(value("--thresholds")?))
                }
                "--collision-config" => {
                    cfg.collision_path = Some(PathBuf::from(value("--collision-config")?))
                }
                "--motors" => {
                    cfg.motors = value("--motors")?
                        .split(',')
                        .map(str::trim)
                        .filter(|m| !m.is_empty())
                        .map(String::from)
                        .collect();
                }
                "--goal" => cfg.goals.push(parse_assignment("--goal", &value("--goal")?)?),
                "--obstacle" => cfg
                    .obstacles
                    .push(parse_assignment("--obstacle", &value("--obstacle")?)?),
                "--move-timeout" => {
                    let raw = value("--move-timeout")?;
                    let secs: f64 = raw
                        .parse()
                        .ok()
                        .filter(|s: &f64| s.is_finite() && *s > 0.0)
                        .ok_or(ArgError::NotANumber {
                            flag: "--move-timeout",
                            value: raw,
                        })?;
                    cfg.move_timeout = Duration::from_secs_f64(secs);
                }
                "--unattended" => cfg.unattended = true,
                "--help" | "-h" => {
                    cfg.show_help = true;
                    break;
                }
                _ => {}
            }
            i += 1;
        }
        Ok(cfg)
    }

    pub fn print_help() {
        println!(
            r#"arm-guard - Motor safety supervisor and collision-aware goal moves for servo arms

USAGE:
    arm-guard [OPTIONS]

OPTIONS:
    --run-seconds <SECS>       Supervise for a fixed duration then print the safety report
    --json-logs                Output logs in JSON format (for log aggregation)
    --log-dir <DIR>            Also write daily-rolled log files to DIR
    --metrics-addr <ADDR>      Enable Prometheus metrics server on address (e.g., 0.0.0.0:9090)
    --audit-log <PATH>         Enable audit logging to specified JSONL file
    --thresholds <PATH>        Safety thresholds JSON file
    --collision-config <PATH>  Collision detection JSON file
    --motors <A,B,C>           Motors on the simulated bus [default: so-arm joints]
    --goal <MOTOR=POS>         Goal position for a move (repeatable)
    --obstacle <MOTOR=POS>     Place a simulated obstacle (repeatable)
    --move-timeout <SECS>      Goal move timeout [default: 5]
    --unattended               Confirm recalibration prompts automatically
    -h, --help                 Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                   Set log filter (e.g., RUST_LOG=debug,safety_core=trace)

EXAMPLES:
    # Supervise for ten seconds with metrics
    arm-guard --run-seconds 10 --metrics-addr 0.0.0.0:9090

    # Move into an obstacle and watch the backoff
    arm-guard --run-seconds 5 --goal elbow_flex=60 --obstacle elbow_flex=25 --unattended
"#
        );
    }
}

fn parse_assignment(flag: &'static str, raw: &str) -> Result<(String, f64), ArgError> {
    let bad = || ArgError::BadAssignment {
        flag,
        value: raw.to_string(),
    };
    let (motor, value) = raw.split_once('=').ok_or_else(bad)?;
    let motor = motor.trim();
    if motor.is_empty() {
        return Err(bad());
    }
    let value: f64 = value.trim().parse().map_err(|_| bad())?;
    Ok((motor.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("arm-guard")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn defaults_without_flags() {
        let cfg = RuntimeConfig::from_args(&args(&[])).unwrap();
        assert_eq!(cfg, RuntimeConfig::default());
        assert_eq!(cfg.motors.len(), 6);
    }

    #[test]
    fn parses_full_command_line() {
        let cfg = RuntimeConfig::from_args(&args(&[
            "--run-seconds",
            "3",
            "--json-logs",
            "--motors",
            "a, b",
            "--goal",
            "a=12.5",
            "--goal",
            "b=-4",
            "--obstacle",
            "a=8",
            "--move-timeout",
            "1.5",
            "--audit-log",
            "/tmp/audit.jsonl",
            "--unattended",
        ]))
        .unwrap();

        assert_eq!(cfg.run_seconds, Some(3));
        assert!(cfg.json_logs);
        assert_eq!(cfg.motors, vec!["a", "b"]);
        assert_eq!(cfg.goals, vec![("a".into(), 12.5), ("b".into(), -4.0)]);
        assert_eq!(cfg.obstacles, vec![("a".into(), 8.0)]);
        assert_eq!(cfg.move_timeout, Duration::from_millis(1500));
        assert_eq!(cfg.audit_path, Some(PathBuf::from("/tmp/audit.jsonl")));
        assert!(cfg.unattended);
    }

    #[test]
    fn help_stops_parsing() {
        let cfg = RuntimeConfig::from_args(&args(&["--help", "--goal", "nonsense"])).unwrap();
        assert!(cfg.show_help);
        assert!(cfg.goals.is_empty());
    }

    #[test]
    fn rejects_malformed_values() {
        assert_eq!(
            RuntimeConfig::from_args(&args(&["--goal", "elbow"])),
            Err(ArgError::BadAssignment {
                flag: "--goal",
                value: "elbow".into()
            })
        );
        assert_eq!(
            RuntimeConfig::from_args(&args(&["--run-seconds"])),
            Err(ArgError::MissingValue {
                flag: "--run-seconds"
            })
        );
        assert!(matches!(
            RuntimeConfig::from_args(&args(&["--move-timeout", "-1"])),
            Err(ArgError::NotANumber { .. })
        ));
    }
}
