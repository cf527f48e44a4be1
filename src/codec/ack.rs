//! Acknowledgment construction
//!
//! An acknowledgment is two lines joined by `\r`: an `MSH` header naming the
//! `ACK` message type with a timestamp, and an `MSA` status line carrying the
//! accept/error code, the original control id, and optional error text.

use super::{FIELD_SEPARATOR, SEGMENT_SEPARATOR};
use chrono::{DateTime, Utc};

/// Timestamp layout used in the acknowledgment header
pub const ACK_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Acknowledgment code written to MSA-1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckCode {
    /// Application accept (`AA`)
    Accept,
    /// Application error (`AE`)
    Error,
}

impl AckCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckCode::Accept => "AA",
            AckCode::Error => "AE",
        }
    }
}

/// Build an acknowledgment stamped with the current time
pub fn build_ack(control_id: &str, code: AckCode, error_text: &str) -> String {
    build_ack_at(control_id, code, error_text, Utc::now())
}

/// Build an acknowledgment stamped with `now`
pub fn build_ack_at(control_id: &str, code: AckCode, error_text: &str, now: DateTime<Utc>) -> String {
    let header = format!(
        "MSH|^~\\&|RECEIVING_APP|RECEIVING_FACILITY|SENDING_APP|SENDING_FACILITY|{}||ACK|{}|P|2.3",
        now.format(ACK_TIMESTAMP_FORMAT),
        now.timestamp_millis()
    );
    let status = format!(
        "MSA|{}|{}|{}",
        code.as_str(),
        sanitize(control_id),
        sanitize(error_text)
    );

    [header, status].join(&SEGMENT_SEPARATOR.to_string())
}

/// Keep free text from breaking the segment/field structure
fn sanitize(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\r' | '\n' | FIELD_SEPARATOR => ' ',
            c if (c as u32) < 0x20 => ' ',
            c => c,
        })
        .collect()
}
