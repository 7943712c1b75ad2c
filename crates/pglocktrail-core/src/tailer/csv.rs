//! csvlog assembly.
//!
//! PostgreSQL csvlog has fixed columns (PG 13+):
//! `log_time,user_name,database_name,process_id,connection_from,session_id,
//!  session_line_num,command_tag,session_start_time,virtual_transaction_id,
//!  transaction_id,error_severity,sql_state_code,message,detail,hint,
//!  internal_query,internal_query_pos,context,query,query_pos,location,
//!  application_name,...`
//!
//! Quoted fields may contain newlines, so a record can span several
//! physical lines. Records are framed by quote balance before splitting.

use thiserror::Error;
use tracing::debug;

use crate::source::LogFormat;
use crate::time::parse_log_timestamp;

use super::RecordAssembler;
use super::grammar::{
    DEADLOCK_MESSAGE, EventDraft, LogMetadata, extract_context_relation, extract_detection_time,
};

const COL_LOG_TIME: usize = 0;
const COL_USER_NAME: usize = 1;
const COL_DATABASE_NAME: usize = 2;
const COL_PROCESS_ID: usize = 3;
const COL_CONNECTION_FROM: usize = 4;
const COL_SESSION_START: usize = 8;
const COL_ERROR_SEVERITY: usize = 11;
const COL_MESSAGE: usize = 13;
const COL_DETAIL: usize = 14;
const COL_CONTEXT: usize = 18;
const COL_APPLICATION_NAME: usize = 22;

/// Fewer columns than this cannot carry a deadlock report.
const MIN_COLUMNS: usize = COL_DETAIL + 1;

/// Upper bound for one framed record; guards against an unbalanced quote
/// swallowing the rest of the file.
const MAX_RECORD_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Default)]
pub struct CsvAssembler {
    /// Physical lines of a record whose quotes are not yet balanced.
    partial: String,
    in_quotes: bool,
    detection_ms: Option<u64>,
    malformed: usize,
}

impl CsvAssembler {
    fn handle_record(&mut self, record: &str, out: &mut Vec<EventDraft>) {
        if record.trim().is_empty() {
            return;
        }
        let fields = match parse_csv_record(record) {
            Ok(fields) => fields,
            Err(e) => {
                debug!(error = %e, "unreadable csvlog record");
                self.malformed += 1;
                return;
            }
        };
        if fields.len() < MIN_COLUMNS {
            self.malformed += 1;
            return;
        }

        let severity = fields[COL_ERROR_SEVERITY].as_str();
        let message = fields[COL_MESSAGE].as_str();

        if severity == "ERROR" && message.contains(DEADLOCK_MESSAGE) {
            out.push(self.parse_deadlock(&fields));
        } else if severity == "LOG"
            && let Some(ms) = extract_detection_time(message)
        {
            self.detection_ms = Some(ms);
        }
    }

    fn parse_deadlock(&mut self, fields: &[String]) -> EventDraft {
        let field = |idx: usize| fields.get(idx).map(String::as_str).unwrap_or("");

        let mut draft = EventDraft {
            detected_at: parse_log_timestamp(field(COL_LOG_TIME)),
            database_name: Some(field(COL_DATABASE_NAME).to_string()),
            resolved_by_pid: field(COL_PROCESS_ID).parse().ok(),
            detection_time_ms: self.detection_ms.take(),
            metadata: LogMetadata {
                application_name: field(COL_APPLICATION_NAME).to_string(),
                username: field(COL_USER_NAME).to_string(),
                client_addr: client_addr(field(COL_CONNECTION_FROM)),
            },
            backend_start: parse_log_timestamp(field(COL_SESSION_START)),
            context_relation: extract_context_relation(field(COL_CONTEXT)),
            ..Default::default()
        };
        draft.push_detail_text(field(COL_DETAIL));
        draft
    }
}

/// `connection_from` is `host:port`, `[local]`, or empty for local sockets.
fn client_addr(connection_from: &str) -> String {
    let host = match connection_from.rfind(':') {
        Some(idx) if idx > 0 => &connection_from[..idx],
        _ => connection_from,
    };
    if host.is_empty() || host == "[local]" {
        "local".to_string()
    } else {
        host.to_string()
    }
}

/// Toggles `in_quotes` once per `"`; an escaped `""` toggles twice.
fn quotes_balanced_after(line: &str, mut in_quotes: bool) -> bool {
    for b in line.bytes() {
        if b == b'"' {
            in_quotes = !in_quotes;
        }
    }
    in_quotes
}

impl RecordAssembler for CsvAssembler {
    const FORMAT: LogFormat = LogFormat::Csv;

    fn push_line(&mut self, line: &str, out: &mut Vec<EventDraft>) {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if !self.partial.is_empty() || self.in_quotes {
            self.partial.push('\n');
        }
        self.partial.push_str(line);
        self.in_quotes = quotes_balanced_after(line, self.in_quotes);

        if self.in_quotes {
            if self.partial.len() > MAX_RECORD_BYTES {
                self.partial.clear();
                self.in_quotes = false;
                self.malformed += 1;
            }
            return;
        }

        let record = std::mem::take(&mut self.partial);
        self.handle_record(&record, out);
    }

    fn finish(&mut self, out: &mut Vec<EventDraft>) {
        if self.partial.is_empty() {
            return;
        }
        // Unterminated quote at end of input.
        let record = std::mem::take(&mut self.partial);
        self.in_quotes = false;
        self.handle_record(&record, out);
    }

    fn malformed(&self) -> usize {
        self.malformed
    }
}

/// Why a framed record could not be split into fields.
#[derive(Debug, PartialEq, Eq, Error)]
enum CsvRecordError {
    #[error("field {0}: quoted value is never closed")]
    UnterminatedQuote(usize),
    #[error("field {0}: quote inside an unquoted value")]
    StrayQuote(usize),
    #[error("field {0}: text after the closing quote")]
    TrailingText(usize),
}

/// Splits one framed csvlog record into fields. csvlog quotes whole fields
/// and doubles embedded quotes; any other use of `"` is rejected.
fn parse_csv_record(record: &str) -> Result<Vec<String>, CsvRecordError> {
    let mut fields = Vec::new();
    let mut rest = record;
    loop {
        let idx = fields.len();
        let (value, after) = match rest.strip_prefix('"') {
            Some(quoted) => unquote(quoted).ok_or(CsvRecordError::UnterminatedQuote(idx))?,
            None => {
                let end = rest.find(',').unwrap_or(rest.len());
                if rest[..end].contains('"') {
                    return Err(CsvRecordError::StrayQuote(idx));
                }
                (rest[..end].to_string(), &rest[end..])
            }
        };
        fields.push(value);
        match after.strip_prefix(',') {
            Some(next) => rest = next,
            None if after.is_empty() => return Ok(fields),
            None => return Err(CsvRecordError::TrailingText(idx)),
        }
    }
}

/// Reads a quoted value up to its closing quote. Returns the value and the
/// text after the quote, or `None` if the quote is never closed.
fn unquote(mut tail: &str) -> Option<(String, &str)> {
    let mut value = String::new();
    loop {
        let q = tail.find('"')?;
        value.push_str(&tail[..q]);
        tail = &tail[q + 1..];
        match tail.strip_prefix('"') {
            Some(escaped) => {
                value.push('"');
                tail = escaped;
            }
            None => return Some((value, tail)),
        }
    }
}
