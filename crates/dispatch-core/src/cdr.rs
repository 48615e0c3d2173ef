//! Call detail records and call outcomes
//!
//! A [`CallDetailRecord`] is filled in stages: the admission time and caller
//! number when the task is created, everything else either when the queue
//! rejects the call or when an operator finishes servicing it. The
//! [`CallResult`] is the smaller value delivered to the caller through the
//! task's future.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Identifier of an admitted call
pub type CallId = u64;

/// Timestamp layout used in CDR lines
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Call status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallStatus {
    /// Call is waiting to be serviced
    Awaiting,
    /// Call was serviced by an operator
    Completed,
    /// A newer call from the same number replaced this one
    Duplication,
    /// The queue was full when the call arrived
    Overloaded,
    /// Call was discarded (queue torn down) or failed in service
    Rejected,
    /// Call waited longer than the upper service bound
    Timeout,
}

impl CallStatus {
    /// Status name as written to CDR lines
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Awaiting => "Awaiting",
            CallStatus::Completed => "Completed",
            CallStatus::Duplication => "Duplication",
            CallStatus::Overloaded => "Overloaded",
            CallStatus::Rejected => "Rejected",
            CallStatus::Timeout => "Timeout",
        }
    }

    /// Whether the status ends the life of a call
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CallStatus::Awaiting)
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a call, delivered through the task's future
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallResult {
    pub status: CallStatus,
    pub call_duration: Duration,
    pub call_id: CallId,
}

impl CallResult {
    /// Result for a call that was never serviced
    pub fn unserviced(status: CallStatus, call_id: CallId) -> Self {
        Self {
            status,
            call_duration: Duration::ZERO,
            call_id,
        }
    }
}

/// Call detail record
#[derive(Debug, Clone, PartialEq)]
pub struct CallDetailRecord {
    /// Admission time
    pub start_time: DateTime<Local>,
    /// Time the call left the system
    pub end_time: Option<DateTime<Local>>,
    pub call_id: CallId,
    pub status: CallStatus,
    /// Time an operator picked the call up
    pub operator_call_time: Option<DateTime<Local>>,
    /// Operator that handled the call, 0 when none did
    pub operator_id: usize,
    /// Service time, zero when the call was not serviced
    pub call_duration: Duration,
    /// Caller number, shared with the task rather than copied
    pub number: Arc<str>,
}

impl CallDetailRecord {
    /// Fresh record for a call admitted at `start_time`
    pub fn new(number: Arc<str>, start_time: DateTime<Local>) -> Self {
        Self {
            start_time,
            end_time: None,
            call_id: 0,
            status: CallStatus::Awaiting,
            operator_call_time: None,
            operator_id: 0,
            call_duration: Duration::ZERO,
            number,
        }
    }

    /// Close the record for a call that never reached an operator
    pub fn finish_unserviced(&mut self, status: CallStatus) {
        let now = Local::now();
        self.status = status;
        self.operator_id = 0;
        self.call_duration = Duration::ZERO;
        self.operator_call_time = Some(now);
        self.end_time = Some(now);
    }

    /// Close the record for a call that failed or was abandoned
    ///
    /// Written as `Rejected` with zero duration. The operator fields are
    /// kept when an operator had already picked the call up.
    pub fn finish_failed(&mut self) {
        let now = Local::now();
        self.status = CallStatus::Rejected;
        self.call_duration = Duration::ZERO;
        self.operator_call_time.get_or_insert(now);
        self.end_time = Some(now);
    }

    /// Render the record as one semicolon-delimited line
    ///
    /// Fields: start time; call id; number; end time; status; operator call
    /// time; operator id; duration in whole seconds with an `s` suffix.
    /// Unset timestamps are rendered empty.
    pub fn to_record_line(&self) -> String {
        format!(
            "{};{};{};{};{};{};{};{}s",
            self.start_time.format(TIME_FORMAT),
            self.call_id,
            self.number,
            format_time(self.end_time.as_ref()),
            self.status,
            format_time(self.operator_call_time.as_ref()),
            self.operator_id,
            self.call_duration.as_secs()
        )
    }
}

fn format_time(time: Option<&DateTime<Local>>) -> String {
    time.map(|t| t.format(TIME_FORMAT).to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record() -> CallDetailRecord {
        let start = Local.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        CallDetailRecord::new(Arc::from("89161234567"), start)
    }

    #[test]
    fn test_status_names() {
        assert_eq!(CallStatus::Overloaded.to_string(), "Overloaded");
        assert_eq!(CallStatus::Timeout.as_str(), "Timeout");
        assert!(!CallStatus::Awaiting.is_terminal());
        assert!(CallStatus::Duplication.is_terminal());
    }

    #[test]
    fn test_record_line_with_unset_times() {
        let mut cdr = record();
        cdr.call_id = 42;
        assert_eq!(
            cdr.to_record_line(),
            "2024-03-01 12:30:05.000;42;89161234567;;Awaiting;;0;0s"
        );
    }

    #[test]
    fn test_record_line_for_serviced_call() {
        let mut cdr = record();
        let picked = Local.with_ymd_and_hms(2024, 3, 1, 12, 30, 7).unwrap();
        let ended = Local.with_ymd_and_hms(2024, 3, 1, 12, 30, 19).unwrap();
        cdr.call_id = 7;
        cdr.status = CallStatus::Completed;
        cdr.operator_id = 3;
        cdr.operator_call_time = Some(picked);
        cdr.end_time = Some(ended);
        cdr.call_duration = Duration::from_secs(12);

        let line = cdr.to_record_line();
        let fields: Vec<&str> = line.split(';').collect();
        assert_eq!(fields.len(), 8);
        assert_eq!(fields[3], "2024-03-01 12:30:19.000");
        assert_eq!(fields[4], "Completed");
        assert_eq!(fields[5], "2024-03-01 12:30:07.000");
        assert_eq!(fields[6], "3");
        assert_eq!(fields[7], "12s");
    }

    #[test]
    fn test_finish_unserviced() {
        let mut cdr = record();
        cdr.operator_id = 9;
        cdr.finish_unserviced(CallStatus::Overloaded);
        assert_eq!(cdr.status, CallStatus::Overloaded);
        assert_eq!(cdr.operator_id, 0);
        assert_eq!(cdr.call_duration, Duration::ZERO);
        assert_eq!(cdr.end_time, cdr.operator_call_time);
        assert!(cdr.end_time.is_some());
    }

    #[test]
    fn test_finish_failed_keeps_pickup() {
        let mut cdr = record();
        let picked_up = Local.with_ymd_and_hms(2024, 3, 1, 12, 30, 9).unwrap();
        cdr.operator_id = 4;
        cdr.operator_call_time = Some(picked_up);
        cdr.status = CallStatus::Completed;
        cdr.call_duration = Duration::from_secs(7);

        cdr.finish_failed();
        assert_eq!(cdr.status, CallStatus::Rejected);
        assert_eq!(cdr.operator_id, 4);
        assert_eq!(cdr.operator_call_time, Some(picked_up));
        assert_eq!(cdr.call_duration, Duration::ZERO);
        assert!(cdr.end_time.is_some());
    }
}
