use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AssignmentId, FileId, SubmissionId, UserId};

/// Server-side handle returned for each individually uploaded file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFileHandle {
    pub id: FileId,
    pub name: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitSolutionRequest {
    pub files: Vec<FileId>,
    pub note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionPayload {
    pub id: SubmissionId,
    pub user_id: UserId,
    pub assignment_id: AssignmentId,
    pub note: String,
    pub submitted_at: DateTime<Utc>,
}

/// Coordinates for observing one in-flight evaluation. Immutable once
/// received; a new submission produces a new descriptor and invalidates
/// the old one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorDescriptor {
    pub channel_id: String,
    pub url: String,
    pub expected_task_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitSolutionResponse {
    pub submission: SubmissionPayload,
    pub monitor: MonitorDescriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Completed,
    Skipped,
    Failed,
}

/// Frames pushed by the evaluation broker after the `channel_id`
/// handshake. No client-to-server frames follow the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "UPPERCASE")]
pub enum MonitorFrame {
    Task {
        task_state: TaskState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    Finished,
}
