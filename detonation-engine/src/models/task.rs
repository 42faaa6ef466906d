use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of an analysis task in its lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Task is queued and waiting for a matching machine
    Pending,
    /// Task has been matched to a machine, handoff in progress
    Scheduled,
    /// Task is detonating inside its machine
    Running,
    /// Guest run finished and the agent signalled completion
    Completed,
    /// Task failed permanently
    Failed,
    /// Maximum run duration elapsed before the agent signalled completion
    TimedOut,
    /// Task was cancelled before reaching a natural terminal state
    Cancelled,
}

impl TaskStatus {
    /// Transitions are monotonic, with one exception: a bounded retry
    /// loop re-enqueues a running task after an infrastructure failure.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Scheduled)
                | (Pending, Cancelled)
                | (Scheduled, Running)
                | (Scheduled, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, TimedOut)
                | (Running, Cancelled)
                | (Running, Pending) // infra-failure retry
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::TimedOut | TaskStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::TimedOut => "timed_out",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

/// Priority level for analysis tasks
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

impl TaskPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        }
    }
}

/// Declared file type of the submitted sample, used to pick the
/// analysis package transferred to the guest.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Exe,
    Dll,
    Pdf,
    Doc,
    Js,
    PowerShell,
    Generic,
}

impl Default for FileType {
    fn default() -> Self {
        FileType::Generic
    }
}

impl FileType {
    /// Resolve a submitted hint, falling back to the filename extension.
    pub fn from_hint(hint: Option<&str>, filename: Option<&str>) -> Self {
        if let Some(h) = hint {
            if let Some(t) = Self::parse(h) {
                return t;
            }
        }
        filename
            .and_then(|name| name.rsplit('.').next())
            .and_then(Self::parse)
            .unwrap_or_default()
    }

    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "exe" | "com" | "scr" => Some(FileType::Exe),
            "dll" => Some(FileType::Dll),
            "pdf" => Some(FileType::Pdf),
            "doc" | "docx" | "docm" | "xls" | "xlsx" | "rtf" => Some(FileType::Doc),
            "js" | "jse" | "wsf" | "hta" => Some(FileType::Js),
            "ps1" | "powershell" => Some(FileType::PowerShell),
            "generic" | "bin" => Some(FileType::Generic),
            _ => None,
        }
    }
}

/// Reference to a submitted sample: content hash plus the spooled byte stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleRef {
    pub sha256: String,
    pub size: u64,
    pub path: PathBuf,
    pub file_name: Option<String>,
}

/// One submitted sample's analysis request and its lifecycle
#[derive(Debug, Clone)]
pub struct Task {
    pub id: Uuid,
    pub sample: SampleRef,
    pub file_type: FileType,
    pub platform: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub max_run_duration: Duration,

    /// Held only while status is `Running`
    pub machine_id: Option<String>,

    pub retry_count: u32,
    pub max_retries: u32,

    pub result_id: Option<Uuid>,
    pub error_message: Option<String>,

    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        sample: SampleRef,
        platform: String,
        file_type: FileType,
        priority: TaskPriority,
        max_run_duration: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sample,
            file_type,
            platform,
            priority,
            status: TaskStatus::Pending,
            max_run_duration,
            machine_id: None,
            retry_count: 0,
            max_retries,
            result_id: None,
            error_message: None,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Enforced status transition; illegal moves are a programming error
    /// surfaced to the caller rather than silently applied.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), shared::SandboxError> {
        if !self.status.can_transition_to(next) {
            return Err(shared::SandboxError::Internal(format!(
                "illegal task transition {:?} -> {:?} for {}",
                self.status, next, self.id
            )));
        }
        self.status = next;
        match next {
            TaskStatus::Running => {
                self.started_at = Some(Utc::now());
            }
            s if s.is_terminal() => {
                self.completed_at = Some(Utc::now());
                self.machine_id = None;
            }
            _ => {}
        }
        Ok(())
    }

    /// Bind the machine lease; valid only on entry to `Running`.
    pub fn assign_machine(&mut self, machine_id: &str) {
        debug_assert_eq!(self.status, TaskStatus::Running);
        self.machine_id = Some(machine_id.to_string());
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Re-enqueue after an infrastructure failure, consuming one retry.
    pub fn requeue_for_retry(&mut self, reason: &str) -> Result<(), shared::SandboxError> {
        self.transition(TaskStatus::Pending)?;
        self.retry_count += 1;
        self.machine_id = None;
        self.started_at = None;
        self.error_message = Some(reason.to_string());
        Ok(())
    }

    pub fn mark_completed(&mut self, result_id: Uuid) -> Result<(), shared::SandboxError> {
        self.transition(TaskStatus::Completed)?;
        self.result_id = Some(result_id);
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: &str) -> Result<(), shared::SandboxError> {
        self.transition(TaskStatus::Failed)?;
        self.error_message = Some(reason.to_string());
        Ok(())
    }

    pub fn mark_timed_out(&mut self, result_id: Option<Uuid>) -> Result<(), shared::SandboxError> {
        self.transition(TaskStatus::TimedOut)?;
        self.result_id = result_id;
        Ok(())
    }
}

/// Validated submission input assembled by the intake surface
#[derive(Debug, Clone)]
pub struct SubmitTaskRequest {
    pub sample: SampleRef,
    pub platform: String,
    pub file_type: FileType,
    pub priority: TaskPriority,
    pub max_run_duration: Option<Duration>,
}

/// Response when querying task status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponse {
    pub id: Uuid,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub platform: String,
    pub sample_sha256: String,
    pub machine_id: Option<String>,
    pub retry_count: u32,
    pub result_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Task> for TaskResponse {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            status: task.status,
            priority: task.priority,
            platform: task.platform.clone(),
            sample_sha256: task.sample.sha256.clone(),
            machine_id: task.machine_id.clone(),
            retry_count: task.retry_count,
            result_id: task.result_id,
            error_message: task.error_message.clone(),
            submitted_at: task.submitted_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
        }
    }
}
