//! Append-only JSONL trail of safety events, session boundaries and move results.
//!
//! Each line carries a per-session sequence number so a truncated or
//! interleaved file can be detected when the trail is replayed.

use parking_lot::Mutex;
use safety_core::{SafetyEvent, TimeBase};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SessionStart,
    SessionStop,
    /// Thresholds and collision settings in effect for the session
    ConfigLoaded,
    TemperatureShutdown,
    StallDetected,
    EmergencyStop,
    RecalibrationTriggered,
    RecalibrationFailed,
    MoveCompleted,
}

impl From<&SafetyEvent> for AuditEventType {
    fn from(event: &SafetyEvent) -> Self {
        match event {
            SafetyEvent::TemperatureShutdown { .. } => Self::TemperatureShutdown,
            SafetyEvent::StallDetected { .. } => Self::StallDetected,
            SafetyEvent::EmergencyStop => Self::EmergencyStop,
            SafetyEvent::RecalibrationTriggered { .. } => Self::RecalibrationTriggered,
            SafetyEvent::RecalibrationFailed { .. } => Self::RecalibrationFailed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Starts at 1 for every logger instance.
    pub seq: u64,
    /// Microseconds since the session time base started.
    pub session_us: u64,
    pub unix_us: u64,
    pub event_type: AuditEventType,
    pub details: serde_json::Value,
}

struct Trail<W: Write> {
    out: BufWriter<W>,
    next_seq: u64,
}

/// Shared by the session thread and the event pump.
pub struct AuditLogger<W: Write = std::fs::File> {
    timebase: TimeBase,
    trail: Mutex<Trail<W>>,
}

impl AuditLogger {
    /// Open `path` for appending, creating parent directories as needed.
    pub fn open(path: &Path, timebase: TimeBase) -> std::io::Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::with_writer(file, timebase))
    }
}

impl<W: Write> AuditLogger<W> {
    pub fn with_writer(out: W, timebase: TimeBase) -> Self {
        Self {
            timebase,
            trail: Mutex::new(Trail {
                out: BufWriter::new(out),
                next_seq: 1,
            }),
        }
    }

    /// Stamp and append one record. Each record is flushed before returning.
    pub fn record(
        &self,
        event_type: AuditEventType,
        details: serde_json::Value,
    ) -> std::io::Result<()> {
        let mut trail = self.trail.lock();
        let entry = AuditRecord {
            seq: trail.next_seq,
            session_us: self.timebase.now_us(),
            unix_us: self.timebase.unix_us(),
            event_type,
            details,
        };
        serde_json::to_writer(&mut trail.out, &entry)?;
        trail.out.write_all(b"\n")?;
        trail.out.flush()?;
        trail.next_seq += 1;
        Ok(())
    }

    /// Record a [`SafetyEvent`] with its tagged payload as details.
    pub fn record_safety_event(&self, event: &SafetyEvent) -> std::io::Result<()> {
        self.record(event.into(), serde_json::to_value(event)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use safety_core::MotorId;

    fn parse(path: &Path) -> Vec<AuditRecord> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn records_are_sequenced_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let logger = AuditLogger::open(&path, TimeBase::new()).unwrap();

        logger
            .record(
                AuditEventType::SessionStart,
                serde_json::json!({"motors": ["gripper"]}),
            )
            .unwrap();
        logger
            .record_safety_event(&SafetyEvent::StallDetected {
                motor: MotorId::from("gripper"),
                current_ma: 1020.0,
            })
            .unwrap();

        let records = parse(&path);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].seq, 1);
        assert_eq!(records[0].event_type, AuditEventType::SessionStart);
        assert_eq!(records[1].seq, 2);
        assert_eq!(records[1].event_type, AuditEventType::StallDetected);
        assert_eq!(records[1].details["event"], "stall_detected");
        assert_eq!(records[1].details["motor"], "gripper");
        assert!(records[1].session_us >= records[0].session_us);
        assert!(records[0].unix_us > 0);
    }

    #[test]
    fn reopening_appends_with_fresh_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("audit.jsonl");

        for _ in 0..2 {
            AuditLogger::open(&path, TimeBase::new())
                .unwrap()
                .record_safety_event(&SafetyEvent::EmergencyStop)
                .unwrap();
        }

        let records = parse(&path);
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.seq == 1));
        assert!(records
            .iter()
            .all(|r| r.event_type == AuditEventType::EmergencyStop));
    }

    #[test]
    fn writes_to_any_sink() {
        let logger = AuditLogger::with_writer(Vec::new(), TimeBase::new());
        logger
            .record(AuditEventType::SessionStop, serde_json::json!({}))
            .unwrap();
        let trail = logger.trail.into_inner();
        let text = String::from_utf8(trail.out.into_inner().unwrap()).unwrap();
        assert!(text.starts_with(r#"{"seq":1,"#));
        assert!(text.ends_with("\n"));
    }
}
