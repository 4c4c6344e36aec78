use std::sync::Arc;

use shared::{
    domain::{FileId, SolutionKind, SubmissionStatus, UserId},
    protocol::{MonitorDescriptor, SubmissionPayload, SubmitSolutionRequest},
};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use crate::{PipelineEvent, SolutionBackend};

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("submission is not ready to be sent (status {0:?})")]
    InvalidState(SubmissionStatus),
    #[error("no uploaded files to submit")]
    NoUploadedFiles,
    #[error("backend rejected the solution: {0}")]
    Rejected(String),
}

/// Owns the lifecycle of one solution submission:
/// `None → Creating → Sending → {Processing | Failed} → Finished`.
/// The same controller serves ordinary assignment submissions and
/// reference-solution evaluations; only the submit endpoint differs.
pub struct SubmissionController {
    backend: Arc<dyn SolutionBackend>,
    inner: Mutex<SubmissionState>,
    events: broadcast::Sender<PipelineEvent>,
}

#[derive(Default)]
struct SubmissionState {
    status: SubmissionStatus,
    kind: Option<SolutionKind>,
    user_id: Option<UserId>,
    target_id: Option<i64>,
    submission: Option<SubmissionPayload>,
    monitor: Option<MonitorDescriptor>,
    last_note: String,
    last_files: Vec<FileId>,
}

impl SubmissionController {
    pub fn new(
        backend: Arc<dyn SolutionBackend>,
        events: broadcast::Sender<PipelineEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            inner: Mutex::new(SubmissionState::default()),
            events,
        })
    }

    /// Begin composing a submission for a target (assignment or reference
    /// solution). Replaces whatever context existed before.
    pub async fn begin(&self, user_id: UserId, target_id: i64, kind: SolutionKind) {
        {
            let mut state = self.inner.lock().await;
            *state = SubmissionState {
                status: SubmissionStatus::Creating,
                kind: Some(kind),
                user_id: Some(user_id),
                target_id: Some(target_id),
                ..SubmissionState::default()
            };
        }
        self.emit_status(SubmissionStatus::Creating);
    }

    /// Tear the context down entirely (logout path).
    pub async fn reset(&self) {
        {
            let mut state = self.inner.lock().await;
            *state = SubmissionState::default();
        }
        self.emit_status(SubmissionStatus::None);
    }

    /// Send the composed solution. On rejection the state passes through
    /// `Failed` back to `Creating`, with note and file list preserved so
    /// the same call can be retried unmodified.
    pub async fn submit(
        &self,
        note: &str,
        files: Vec<FileId>,
    ) -> Result<MonitorDescriptor, SubmitError> {
        let (kind, target_id, user_id) = {
            let mut state = self.inner.lock().await;
            if state.status != SubmissionStatus::Creating {
                return Err(SubmitError::InvalidState(state.status));
            }
            let (Some(kind), Some(target_id), Some(user_id)) =
                (state.kind, state.target_id, state.user_id)
            else {
                return Err(SubmitError::InvalidState(state.status));
            };
            if files.is_empty() {
                return Err(SubmitError::NoUploadedFiles);
            }
            state.last_note = note.to_string();
            state.last_files = files.clone();
            state.status = SubmissionStatus::Sending;
            (kind, target_id, user_id)
        };
        self.emit_status(SubmissionStatus::Sending);

        let request = SubmitSolutionRequest {
            files,
            note: note.to_string(),
        };
        match self.backend.submit_solution(kind, target_id, &request).await {
            Ok(response) => {
                info!(
                    submission_id = response.submission.id.0,
                    user_id = user_id.0,
                    channel_id = %response.monitor.channel_id,
                    expected = response.monitor.expected_task_count,
                    "submission accepted, evaluation queued"
                );
                let monitor = response.monitor.clone();
                {
                    let mut state = self.inner.lock().await;
                    state.status = SubmissionStatus::Processing;
                    state.submission = Some(response.submission);
                    state.monitor = Some(response.monitor);
                }
                self.emit_status(SubmissionStatus::Processing);
                Ok(monitor)
            }
            Err(err) => {
                warn!(target_id, "submission rejected: {err}");
                let _ = self
                    .events
                    .send(PipelineEvent::Error(format!("submit failed: {err}")));
                {
                    let mut state = self.inner.lock().await;
                    state.status = SubmissionStatus::Failed;
                }
                self.emit_status(SubmissionStatus::Failed);
                // Back to Creating so the user can retry without
                // re-uploading anything.
                {
                    let mut state = self.inner.lock().await;
                    state.status = SubmissionStatus::Creating;
                }
                self.emit_status(SubmissionStatus::Creating);
                Err(SubmitError::Rejected(err.to_string()))
            }
        }
    }

    /// Retry the last attempt with the preserved note and file list.
    pub async fn resubmit(&self) -> Result<MonitorDescriptor, SubmitError> {
        let (note, files) = {
            let state = self.inner.lock().await;
            (state.last_note.clone(), state.last_files.clone())
        };
        self.submit(&note, files).await
    }

    /// Completion signal from the Evaluation Monitor, or the UI-driven
    /// "proceed without waiting" action. No-op outside `Processing`.
    pub async fn mark_finished(&self) {
        {
            let mut state = self.inner.lock().await;
            if state.status != SubmissionStatus::Processing {
                return;
            }
            state.status = SubmissionStatus::Finished;
        }
        self.emit_status(SubmissionStatus::Finished);
    }

    pub async fn status(&self) -> SubmissionStatus {
        self.inner.lock().await.status
    }

    pub async fn submission(&self) -> Option<SubmissionPayload> {
        self.inner.lock().await.submission.clone()
    }

    pub async fn monitor_descriptor(&self) -> Option<MonitorDescriptor> {
        self.inner.lock().await.monitor.clone()
    }

    pub async fn note(&self) -> String {
        self.inner.lock().await.last_note.clone()
    }

    pub async fn files(&self) -> Vec<FileId> {
        self.inner.lock().await.last_files.clone()
    }

    fn emit_status(&self, status: SubmissionStatus) {
        let _ = self
            .events
            .send(PipelineEvent::SubmissionStatusChanged(status));
    }
}

#[cfg(test)]
#[path = "tests/submission_tests.rs"]
mod tests;
