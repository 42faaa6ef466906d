use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events emitted toward the persistent-store collaborator.
///
/// Delivery is fire-and-forget: the core enqueues these and moves on,
/// buffering and retry belong to the store client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "data")]
pub enum TaskEvent {
    TaskQueued {
        task_id: Uuid,
        platform: String,
        priority: String,
        timestamp: DateTime<Utc>,
    },
    TaskStarted {
        task_id: Uuid,
        machine_id: String,
        timestamp: DateTime<Utc>,
    },
    TaskRetried {
        task_id: Uuid,
        retry_count: u32,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    TaskFinished {
        task_id: Uuid,
        status: String,
        result_id: Option<Uuid>,
        error_message: Option<String>,
        timestamp: DateTime<Utc>,
    },
    MachineCordoned {
        machine_id: String,
        consecutive_failures: u32,
        timestamp: DateTime<Utc>,
    },
    MachineRecovered {
        machine_id: String,
        timestamp: DateTime<Utc>,
    },
    ReportReady {
        report_id: Uuid,
        task_id: Uuid,
        verdict: String,
        score: f64,
        timestamp: DateTime<Utc>,
    },
}

impl TaskEvent {
    /// Get a human-readable title for the event
    pub fn get_title(&self) -> String {
        match self {
            TaskEvent::TaskQueued { task_id, .. } => format!("Task Queued: {}", task_id),
            TaskEvent::TaskStarted { task_id, machine_id, .. } => {
                format!("Task {} Started on {}", task_id, machine_id)
            }
            TaskEvent::TaskRetried { task_id, retry_count, .. } => {
                format!("Task {} Retried (attempt {})", task_id, retry_count)
            }
            TaskEvent::TaskFinished { task_id, status, .. } => {
                format!("Task {} Finished: {}", task_id, status)
            }
            TaskEvent::MachineCordoned { machine_id, .. } => {
                format!("Machine Cordoned: {}", machine_id)
            }
            TaskEvent::MachineRecovered { machine_id, .. } => {
                format!("Machine Recovered: {}", machine_id)
            }
            TaskEvent::ReportReady { task_id, verdict, .. } => {
                format!("Report Ready for {}: {}", task_id, verdict)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_tag() {
        let event = TaskEvent::TaskStarted {
            task_id: Uuid::new_v4(),
            machine_id: "vm-01".to_string(),
            timestamp: Utc::now(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "TaskStarted");
        assert_eq!(json["data"]["machine_id"], "vm-01");
    }

    #[test]
    fn test_event_titles() {
        let event = TaskEvent::MachineCordoned {
            machine_id: "vm-07".to_string(),
            consecutive_failures: 3,
            timestamp: Utc::now(),
        };
        assert_eq!(event.get_title(), "Machine Cordoned: vm-07");
    }
}
