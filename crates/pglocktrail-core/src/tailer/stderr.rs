//! Stderr log assembly.
//!
//! A deadlock report in a stderr log spans several prefixed lines (ERROR,
//! DETAIL, HINT, CONTEXT, STATEMENT) plus tab-indented continuation lines.
//! The report ends at the next prefixed line that belongs to another
//! message, or at end of input.

use crate::source::LogFormat;

use super::RecordAssembler;
use super::grammar::{
    DEADLOCK_MESSAGE, EventDraft, TIMESTAMP_RE, extract_context_relation, extract_detection_time,
    extract_log_metadata, extract_log_pid, extract_log_timestamp,
};

/// Prefixed message kinds that continue the current report.
const REPORT_SECTIONS: &[&str] = &["DETAIL:", "HINT:", "CONTEXT:", "STATEMENT:"];

#[derive(Debug, Clone)]
pub enum StderrState {
    Idle {
        /// From a preceding `detected deadlock ... after N ms` line.
        detection_ms: Option<u64>,
    },
    Collecting {
        draft: Box<EventDraft>,
        /// Inside the DETAIL section, where indented lines continue queries.
        in_detail: bool,
    },
}

impl Default for StderrState {
    fn default() -> Self {
        StderrState::Idle { detection_ms: None }
    }
}

fn is_deadlock_error(line: &str) -> bool {
    line.contains("ERROR:") && line.contains(DEADLOCK_MESSAGE)
}

fn open_report(line: &str, detection_ms: Option<u64>) -> StderrState {
    let draft = EventDraft {
        detected_at: extract_log_timestamp(line),
        resolved_by_pid: extract_log_pid(line),
        detection_time_ms: detection_ms,
        metadata: extract_log_metadata(line).unwrap_or_default(),
        ..Default::default()
    };
    StderrState::Collecting {
        draft: Box::new(draft),
        in_detail: false,
    }
}

/// Advances the machine by one line. A finished report is returned
/// alongside the next state.
pub fn step(state: StderrState, line: &str) -> (StderrState, Option<EventDraft>) {
    match state {
        StderrState::Idle { detection_ms } => {
            if let Some(ms) = extract_detection_time(line) {
                return (StderrState::Idle { detection_ms: Some(ms) }, None);
            }
            if is_deadlock_error(line) {
                return (open_report(line, detection_ms), None);
            }
            (StderrState::Idle { detection_ms }, None)
        }
        StderrState::Collecting {
            mut draft,
            mut in_detail,
        } => {
            if is_deadlock_error(line) {
                return (open_report(line, None), Some(*draft));
            }

            if TIMESTAMP_RE.is_match(line) {
                let Some(section) = REPORT_SECTIONS.iter().find(|s| line.contains(*s)) else {
                    // Another message: the report is complete.
                    let detection_ms = extract_detection_time(line);
                    return (StderrState::Idle { detection_ms }, Some(*draft));
                };
                in_detail = *section == "DETAIL:";
                if *section == "CONTEXT:"
                    && let Some(rel) = extract_context_relation(line)
                {
                    draft.context_relation = Some(rel);
                }
                if in_detail {
                    draft.push_detail_line(line, false);
                }
                return (StderrState::Collecting { draft, in_detail }, None);
            }

            if in_detail {
                let indented = line.starts_with([' ', '\t']);
                draft.push_detail_line(line, indented);
            } else if draft.context_relation.is_none()
                && let Some(rel) = extract_context_relation(line)
            {
                draft.context_relation = Some(rel);
            }
            (StderrState::Collecting { draft, in_detail }, None)
        }
    }
}

/// Drives [`step`] over a file.
#[derive(Debug, Default)]
pub struct StderrAssembler {
    state: StderrState,
}

impl RecordAssembler for StderrAssembler {
    const FORMAT: LogFormat = LogFormat::Stderr;

    fn push_line(&mut self, line: &str, out: &mut Vec<EventDraft>) {
        let state = std::mem::take(&mut self.state);
        let (next, done) = step(state, line);
        self.state = next;
        out.extend(done);
    }

    fn finish(&mut self, out: &mut Vec<EventDraft>) {
        if let StderrState::Collecting { draft, .. } = std::mem::take(&mut self.state) {
            out.push(*draft);
        }
    }

    fn malformed(&self) -> usize {
        0
    }
}
