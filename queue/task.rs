use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "task_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    /// A terminal status never transitions to anything else.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

/// Input to `Queue::enqueue`. `dependencies` lists the ids of tasks that must reach a terminal
/// status before this one becomes eligible for `Dequeue`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    pub task_type: String,
    pub payload: Option<serde_json::Value>,
    pub org_id: Option<String>,
    pub repository_uuid: Option<Uuid>,
    pub request_id: Option<String>,
    pub dependencies: Vec<Uuid>,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>) -> NewTask {
        NewTask {
            task_type: task_type.into(),
            ..Default::default()
        }
    }

    pub fn payload(mut self, payload: serde_json::Value) -> NewTask {
        self.payload = Some(payload);
        self
    }

    pub fn depends_on(mut self, dependencies: Vec<Uuid>) -> NewTask {
        self.dependencies = dependencies;
        self
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct TaskRow {
    pub id: Uuid,
    #[sqlx(rename = "type")]
    pub task_type: String,
    pub payload: Option<serde_json::Value>,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub org_id: Option<String>,
    pub repository_uuid: Option<Uuid>,
    pub token: Option<Uuid>,
    pub request_id: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Everything `Status` and `Dequeue` expose about a task, including the dependency ids read
/// from `task_dependencies` alongside the row itself.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub id: Uuid,
    pub task_type: String,
    pub payload: Option<serde_json::Value>,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub org_id: Option<String>,
    pub repository_uuid: Option<Uuid>,
    pub token: Option<Uuid>,
    pub request_id: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub dependencies: Vec<Uuid>,
}

impl TaskInfo {
    pub(crate) fn from_row(row: TaskRow, dependencies: Vec<Uuid>) -> TaskInfo {
        TaskInfo {
            id: row.id,
            task_type: row.task_type,
            payload: row.payload,
            status: row.status,
            error: row.error,
            org_id: row.org_id,
            repository_uuid: row.repository_uuid,
            token: row.token,
            request_id: row.request_id,
            queued_at: row.queued_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            dependencies,
        }
    }
}

/// A single outstanding lease, as surfaced by `Heartbeats`.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    pub token: Uuid,
    pub id: Uuid,
    pub heartbeat: DateTime<Utc>,
}
