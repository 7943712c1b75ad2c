//! jsonlog assembly: one JSON object per line.

use serde::Deserialize;

use crate::source::LogFormat;
use crate::time::parse_log_timestamp;

use super::RecordAssembler;
use super::grammar::{
    DEADLOCK_MESSAGE, EventDraft, LogMetadata, extract_context_relation, extract_detection_time,
    normalize_client_addr,
};

/// The jsonlog keys we use. Absent keys are empty.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct JsonLogRecord {
    timestamp: String,
    user: String,
    dbname: String,
    pid: Option<i32>,
    remote_host: String,
    session_start: String,
    error_severity: String,
    message: String,
    detail: String,
    context: String,
    application_name: String,
}

/// Keeps the open report until the next record arrives.
#[derive(Debug, Default)]
pub struct JsonAssembler {
    open: Option<EventDraft>,
    detection_ms: Option<u64>,
    malformed: usize,
}

impl JsonAssembler {
    fn open_report(&mut self, rec: JsonLogRecord) -> EventDraft {
        let mut draft = EventDraft {
            detected_at: parse_log_timestamp(&rec.timestamp),
            database_name: Some(rec.dbname),
            resolved_by_pid: rec.pid,
            detection_time_ms: self.detection_ms.take(),
            metadata: LogMetadata {
                application_name: rec.application_name,
                username: rec.user,
                client_addr: normalize_client_addr(&rec.remote_host),
            },
            backend_start: parse_log_timestamp(&rec.session_start),
            context_relation: extract_context_relation(&rec.context),
            ..Default::default()
        };
        draft.push_detail_text(&rec.detail);
        draft
    }
}

impl RecordAssembler for JsonAssembler {
    const FORMAT: LogFormat = LogFormat::Json;

    fn push_line(&mut self, line: &str, out: &mut Vec<EventDraft>) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let rec: JsonLogRecord = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(_) => {
                self.malformed += 1;
                return;
            }
        };

        // Any following record completes the open report.
        out.extend(self.open.take());

        if rec.error_severity == "ERROR" && rec.message.contains(DEADLOCK_MESSAGE) {
            self.open = Some(self.open_report(rec));
        } else if rec.error_severity == "LOG"
            && let Some(ms) = extract_detection_time(&rec.message)
        {
            self.detection_ms = Some(ms);
        }
    }

    fn finish(&mut self, out: &mut Vec<EventDraft>) {
        out.extend(self.open.take());
    }

    fn malformed(&self) -> usize {
        self.malformed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEADLOCK: &str = r#"{"timestamp":"2025-11-23 00:15:52.554 UTC","user":"alice","dbname":"shop","pid":83853,"remote_host":"[local]","session_start":"2025-11-23 00:10:00 UTC","error_severity":"ERROR","message":"deadlock detected","detail":"Process 83853 waits for ShareLock on transaction 4370; blocked by process 83850.\nProcess 83850 waits for ShareLock on transaction 4371; blocked by process 83853.\nProcess 83853: UPDATE accounts SET balance = 1 WHERE id = 1;\nProcess 83850: UPDATE accounts SET balance = 2 WHERE id = 2;","context":"while updating tuple (0,1) in relation \"accounts\"","application_name":"psql"}"#;

    fn run(lines: &[&str]) -> (Vec<EventDraft>, usize) {
        let mut asm = JsonAssembler::default();
        let mut out = Vec::new();
        for line in lines {
            asm.push_line(line, &mut out);
        }
        asm.finish(&mut out);
        (out, asm.malformed())
    }

    #[test]
    fn test_deadlock_record() {
        let (drafts, malformed) = run(&[DEADLOCK]);
        assert_eq!(malformed, 0);
        assert_eq!(drafts.len(), 1);
        let d = &drafts[0];
        assert_eq!(d.database_name.as_deref(), Some("shop"));
        assert_eq!(d.resolved_by_pid, Some(83853));
        assert_eq!(d.metadata.client_addr, "local");
        assert_eq!(d.metadata.username, "alice");
        assert!(d.backend_start.is_some());
        assert_eq!(d.context_relation.as_deref(), Some("accounts"));
        assert_eq!(d.process_count(), 2);
    }

    #[test]
    fn test_detection_time_from_log_record() {
        let log = r#"{"timestamp":"2025-11-23 00:15:52.550 UTC","pid":83853,"error_severity":"LOG","message":"process 83853 detected deadlock while waiting for ShareLock on transaction 4370 after 1001.189 ms"}"#;
        let (drafts, _) = run(&[log, DEADLOCK]);
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].detection_time_ms, Some(1001));
    }

    #[test]
    fn test_next_record_closes_report() {
        let other = r#"{"error_severity":"LOG","message":"checkpoint starting: time"}"#;
        let mut asm = JsonAssembler::default();
        let mut out = Vec::new();
        asm.push_line(DEADLOCK, &mut out);
        assert!(out.is_empty());
        asm.push_line(other, &mut out);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_malformed_lines_counted() {
        let (drafts, malformed) = run(&["{not json", "", DEADLOCK, "garbage"]);
        assert_eq!(drafts.len(), 1);
        assert_eq!(malformed, 2);
    }
}
