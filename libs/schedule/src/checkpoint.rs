//! Single-line checkpoint format persisted by the agent.
//!
//! Layout: `<yyyyMMddHHmmss> <rescheduleCount> <rescheduleNeeded> [<lastAttempted>]`.
//! A disabled schedule is encoded as the minimum timestamp `00010101000000`.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use thiserror::Error;

/// Compact timestamp layout used in checkpoint files.
const COMPACT_FORMAT: &str = "%Y%m%d%H%M%S";

/// Sentinel written when no schedule is set.
const MIN_TIMESTAMP: &str = "00010101000000";

/// Errors from parsing a checkpoint line.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CheckpointParseError {
    #[error("checkpoint line has {0} fields, expected 3 or 4")]
    WrongFieldCount(usize),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("invalid reschedule count: {0}")]
    InvalidCount(String),

    #[error("invalid reschedule flag: {0}")]
    InvalidFlag(String),
}

/// Scheduling state the agent persists between restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CheckpointData {
    /// Next scheduled cycle; `None` means scheduling is disabled.
    pub scheduling_time: Option<DateTime<Utc>>,

    /// Consecutive reschedules attempted for the current failure.
    pub reschedule_count: u32,

    /// Whether the last cycle asked for a reschedule.
    pub reschedule_needed: bool,

    /// When the last update cycle was attempted, if ever.
    pub last_attempted: Option<DateTime<Utc>>,
}

impl CheckpointData {
    /// Fresh checkpoint for a newly computed schedule. Resets the reschedule
    /// bookkeeping.
    pub fn fresh(scheduling_time: Option<DateTime<Utc>>) -> Self {
        Self {
            scheduling_time,
            reschedule_count: 0,
            reschedule_needed: false,
            last_attempted: None,
        }
    }

    /// Serialize to the single-line on-disk form.
    pub fn to_line(&self) -> String {
        let mut line = format!(
            "{} {} {}",
            self.scheduling_time
                .map(format_compact)
                .unwrap_or_else(|| MIN_TIMESTAMP.to_string()),
            self.reschedule_count,
            self.reschedule_needed,
        );
        if let Some(last) = self.last_attempted {
            line.push(' ');
            line.push_str(&format_compact(last));
        }
        line
    }

    /// Parse the single-line on-disk form.
    pub fn from_line(line: &str) -> Result<Self, CheckpointParseError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 3 && fields.len() != 4 {
            return Err(CheckpointParseError::WrongFieldCount(fields.len()));
        }

        let scheduling_time = if fields[0] == MIN_TIMESTAMP {
            None
        } else {
            Some(parse_compact(fields[0])
                .ok_or_else(|| CheckpointParseError::InvalidTimestamp(fields[0].to_string()))?)
        };

        let reschedule_count: u32 = fields[1]
            .parse()
            .map_err(|_| CheckpointParseError::InvalidCount(fields[1].to_string()))?;

        let reschedule_needed = match fields[2] {
            "true" => true,
            "false" => false,
            other => return Err(CheckpointParseError::InvalidFlag(other.to_string())),
        };

        let last_attempted = match fields.get(3) {
            Some(raw) => Some(parse_compact(raw)
                .ok_or_else(|| CheckpointParseError::InvalidTimestamp(raw.to_string()))?),
            None => None,
        };

        Ok(Self {
            scheduling_time,
            reschedule_count,
            reschedule_needed,
            last_attempted,
        })
    }
}

/// Format a timestamp in the compact `yyyyMMddHHmmss` layout.
pub fn format_compact(dt: DateTime<Utc>) -> String {
    dt.format(COMPACT_FORMAT).to_string()
}

/// Parse the compact `yyyyMMddHHmmss` layout.
pub fn parse_compact(s: &str) -> Option<DateTime<Utc>> {
    if s.len() != 14 {
        return None;
    }
    NaiveDateTime::parse_from_str(s, COMPACT_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_line_roundtrip_with_all_fields() {
        let data = CheckpointData {
            scheduling_time: Some(at("2026-03-04T07:00:00Z")),
            reschedule_count: 2,
            reschedule_needed: true,
            last_attempted: Some(at("2026-02-25T07:03:11Z")),
        };
        let line = data.to_line();
        assert_eq!(line, "20260304070000 2 true 20260225070311");
        assert_eq!(CheckpointData::from_line(&line).unwrap(), data);
    }

    #[test]
    fn test_line_roundtrip_minimal() {
        let data = CheckpointData::fresh(None);
        let line = data.to_line();
        assert_eq!(line, "00010101000000 0 false");
        assert_eq!(CheckpointData::from_line(&line).unwrap(), data);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(CheckpointData::from_line("").is_err());
        assert!(CheckpointData::from_line("20260304070000").is_err());
        assert!(CheckpointData::from_line("20260304070000 x false").is_err());
        assert!(CheckpointData::from_line("20260304070000 0 maybe").is_err());
        assert!(CheckpointData::from_line("2026030407 0 false").is_err());
        assert!(CheckpointData::from_line("20260304070000 0 false 1 2").is_err());
    }

    #[test]
    fn test_compact_format_roundtrip() {
        let dt = at("2026-12-31T23:59:59Z");
        assert_eq!(parse_compact(&format_compact(dt)), Some(dt));
        assert_eq!(parse_compact("not-a-timestamp"), None);
    }
}
