//! Operational snapshot of a running pipeline.

use crate::dispatch::WorkerStatus;
use crate::queue::QueueStatusSnapshot;
use serde::{Deserialize, Serialize};

/// What [`crate::dispatch::DispatchRunner::status`] reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    /// Pending plus in-flight messages per queue.
    pub queues: QueueStatusSnapshot,
    /// One entry per registered worker, in registration order.
    pub workers: Vec<WorkerStatus>,
    /// Epoch millis of the last dispatched property.
    pub last_processed_property_time: Option<i64>,
}

impl PipelineStatus {
    pub fn worker(&self, name: &str) -> Option<&WorkerStatus> {
        self.workers.iter().find(|w| w.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::TimerSnapshot;

    #[test]
    fn test_serializes_for_status_endpoints() {
        let mut queues = QueueStatusSnapshot::default();
        queues.queues.insert("graphProperty".to_string(), 3);
        let status = PipelineStatus {
            queues,
            workers: vec![WorkerStatus {
                name: "ocr".to_string(),
                processed: 10,
                errors: 1,
                in_flight: 0,
                processing_time: TimerSnapshot::default(),
            }],
            last_processed_property_time: Some(1_700_000_000_000),
        };

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["queues"]["graphProperty"], 3);
        assert_eq!(json["workers"][0]["inFlight"], 0);
        assert_eq!(json["lastProcessedPropertyTime"], 1_700_000_000_000i64);
        assert_eq!(status.worker("ocr").map(|w| w.errors), Some(1));
    }
}
