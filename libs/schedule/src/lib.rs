//! Scheduling primitives for the node update agent.
//!
//! Two concerns live here, both pure and deterministic:
//!
//! - Parsing the comma-separated frequency strings from node settings and
//!   computing the next scheduled occurrence (`next_schedule`)
//! - The single-line checkpoint format the agent persists across restarts
//!
//! # Invariants
//!
//! - `next_schedule(freq, now)` is a pure function of its arguments; repeated
//!   calls at the same `now` return the same result
//! - Checkpoint write-then-read round-trips to equal values
//! - All times are UTC

mod checkpoint;
mod frequency;

pub use checkpoint::{format_compact, parse_compact, CheckpointData, CheckpointParseError};
pub use frequency::{next_schedule, Frequency, FrequencyParseError, MonthlyDay};
