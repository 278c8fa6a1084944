//! Persisted record of a long-running process.

use super::error::{CoreError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a long-running process.
///
/// `Queued -> Running -> {Succeeded, Failed, Canceled}`. The last three are
/// terminal: a record in a terminal state only changes by being deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProcessStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl ProcessStatus {
    /// Returns the string representation of the process status.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Queued => "QUEUED",
            ProcessStatus::Running => "RUNNING",
            ProcessStatus::Succeeded => "SUCCEEDED",
            ProcessStatus::Failed => "FAILED",
            ProcessStatus::Canceled => "CANCELED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessStatus::Succeeded | ProcessStatus::Failed | ProcessStatus::Canceled
        )
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ProcessStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "QUEUED" => Ok(ProcessStatus::Queued),
            "RUNNING" => Ok(ProcessStatus::Running),
            "SUCCEEDED" => Ok(ProcessStatus::Succeeded),
            "FAILED" => Ok(ProcessStatus::Failed),
            "CANCELED" => Ok(ProcessStatus::Canceled),
            _ => Err(CoreError::InvalidStatus(s.to_string())),
        }
    }
}

/// A long-running process as stored by the tracker.
///
/// Times are epoch milliseconds. `payload` is opaque to the pipeline and is
/// interpreted only by the worker that handles the record's `process_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LongRunningProcessRecord {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub process_type: String,
    pub payload: serde_json::Value,
    pub user_id: String,
    pub enqueue_time: i64,
    pub status: ProcessStatus,
    pub progress: f64,
    #[serde(default)]
    pub progress_message: Option<String>,
    #[serde(default)]
    pub canceled: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub start_time: Option<i64>,
    #[serde(default)]
    pub end_time: Option<i64>,
}

impl LongRunningProcessRecord {
    /// Creates a new record in `Queued` state with a fresh id.
    pub fn new(
        process_type: impl Into<String>,
        payload: serde_json::Value,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            process_type: process_type.into(),
            payload,
            user_id: user_id.into(),
            enqueue_time: Utc::now().timestamp_millis(),
            status: ProcessStatus::Queued,
            progress: 0.0,
            progress_message: None,
            canceled: false,
            error: None,
            start_time: None,
            end_time: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            ProcessStatus::Queued,
            ProcessStatus::Running,
            ProcessStatus::Succeeded,
            ProcessStatus::Failed,
            ProcessStatus::Canceled,
        ] {
            assert_eq!(status.as_str().parse::<ProcessStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<ProcessStatus>().is_err());
    }

    #[test]
    fn test_new_record_is_queued() {
        let record = LongRunningProcessRecord::new(
            "findPath",
            serde_json::json!({"source": "v1", "dest": "v2"}),
            "user-1",
        );
        assert_eq!(record.status, ProcessStatus::Queued);
        assert_eq!(record.progress, 0.0);
        assert!(!record.canceled);
        assert!(!record.is_finished());

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "findPath");
        assert_eq!(json["userId"], "user-1");
        assert_eq!(json["payload"]["dest"], "v2");
    }
}
