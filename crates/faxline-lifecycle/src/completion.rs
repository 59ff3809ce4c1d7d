//! Normalized completion events reported by the telephony gateway.
//!
//! The gateway hands us loosely typed channel variables. Everything is
//! normalized here so the manager only sees validated values: missing
//! numbers default to zero (or 14400 for the transfer rate) and a missing
//! result counts as a failure.

use faxline_core::models::{TransmissionStatus, DEFAULT_BAUD_RATE};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Error text used when a failure carries no description.
pub const UNKNOWN_ERROR: &str = "Unknown error";

/// Outcome reported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallResult {
    /// The document was transferred.
    Success,
    /// Anything else.
    Failure,
}

impl CallResult {
    /// Parses the gateway's result variable. Anything but `SUCCESS` fails.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some(value) if value.trim().eq_ignore_ascii_case("SUCCESS") => Self::Success,
            _ => Self::Failure,
        }
    }

    /// Wire representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        }
    }
}

/// Normalized report that a transmission attempt has finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionEvent {
    /// Success or failure.
    pub result: CallResult,
    /// Pages transferred.
    pub pages: i32,
    /// Call duration in seconds.
    pub duration_seconds: i32,
    /// Negotiated transfer rate.
    pub transfer_rate: i32,
    /// Error correction mode used.
    pub ecm: bool,
    /// Gateway error code.
    pub error_code: Option<String>,
    /// Gateway error text; drives failure classification.
    pub error_text: Option<String>,
    /// Station id announced by the remote machine.
    pub remote_station_id: Option<String>,
    /// Station id we announced.
    pub local_station_id: Option<String>,
    /// Gateway call id of the attempt this event belongs to.
    pub call_ref: Option<String>,
}

impl CompletionEvent {
    /// A successful completion with the given metrics.
    pub fn success(pages: i32, duration_seconds: i32) -> Self {
        Self {
            result: CallResult::Success,
            pages: pages.max(0),
            duration_seconds: duration_seconds.max(0),
            transfer_rate: DEFAULT_BAUD_RATE,
            ecm: false,
            error_code: None,
            error_text: None,
            remote_station_id: None,
            local_station_id: None,
            call_ref: None,
        }
    }

    /// A failed completion with the given error text.
    pub fn failure(error_text: impl Into<String>) -> Self {
        Self {
            result: CallResult::Failure,
            error_text: Some(error_text.into()),
            ..Self::success(0, 0)
        }
    }

    /// Attaches the gateway call reference.
    #[must_use]
    pub fn with_call_ref(mut self, call_ref: impl Into<String>) -> Self {
        self.call_ref = Some(call_ref.into());
        self
    }

    /// Builds an event from gateway channel variables.
    ///
    /// `lookup` returns the raw value of a variable, if set.
    pub fn from_gateway_vars<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let count = |name: &str, default: i32| {
            text(name).and_then(|v| v.parse::<i32>().ok()).map_or(default, |v| v.max(0))
        };

        Self {
            result: CallResult::parse(text("fax_result").as_deref()),
            pages: count("fax_pages", 0),
            duration_seconds: count("fax_duration", 0),
            transfer_rate: count("fax_transfer_rate", DEFAULT_BAUD_RATE),
            ecm: text("fax_ecm").is_some_and(|v| v.eq_ignore_ascii_case("true")),
            error_code: text("fax_error_code"),
            error_text: text("fax_error"),
            remote_station_id: text("fax_remote_station_id"),
            local_station_id: text("fax_local_station_id"),
            call_ref: text("Unique-ID"),
        }
    }

    /// Terminal status this event moves a transmission to.
    pub fn outcome(&self) -> TransmissionStatus {
        match self.result {
            CallResult::Success => TransmissionStatus::Completed,
            CallResult::Failure => classify_failure(self.error_message()),
        }
    }

    /// Error text to store, defaulting for failures without one.
    pub fn error_message(&self) -> &str {
        self.error_text.as_deref().unwrap_or(UNKNOWN_ERROR)
    }

    /// Structured detail recorded in the completion audit entry.
    pub fn audit_details(&self) -> serde_json::Value {
        json!({
            "result": self.result.as_str(),
            "pages_sent": self.pages,
            "duration": self.duration_seconds,
            "transfer_rate": self.transfer_rate,
            "ecm_used": self.ecm,
            "error_code": self.error_code,
            "error": self.error_text,
            "remote_station_id": self.remote_station_id,
            "local_station_id": self.local_station_id,
            "call_ref": self.call_ref,
        })
    }
}

/// Maps gateway error text to a failure status.
///
/// Checked in fixed order: `BUSY` wins over `NO_ANSWER`, and anything
/// else is a generic failure.
pub fn classify_failure(error_text: &str) -> TransmissionStatus {
    if error_text.contains("BUSY") {
        TransmissionStatus::Busy
    } else if error_text.contains("NO_ANSWER") {
        TransmissionStatus::NoAnswer
    } else {
        TransmissionStatus::Failed
    }
}
