use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use shared::{
    domain::{SolutionKind, SubmissionStatus, UserId},
    error::{ApiError, ApiException},
    protocol::{
        MonitorDescriptor, SubmitSolutionRequest, SubmitSolutionResponse, UploadedFileHandle,
    },
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};

pub mod channel;
pub mod monitor;
pub mod submission;
pub mod upload;

pub use channel::{
    ChannelConnector, EvaluationChannel, MissingChannelConnector, WebSocketChannelConnector,
};
pub use monitor::{
    ChannelEvent, EvaluationMonitor, Message, MessagePool, MessageStatus, MonitorPhase,
    ProgressReducer, ProgressState,
};
pub use submission::{SubmissionController, SubmitError};
pub use upload::{LocalFile, UploadEntry, UploadManager};

/// Backend surface the pipeline consumes: one call per uploaded file plus
/// the submit call that queues the evaluation.
#[async_trait]
pub trait SolutionBackend: Send + Sync {
    async fn upload_file(&self, name: &str, blob: Vec<u8>) -> Result<UploadedFileHandle>;

    async fn submit_solution(
        &self,
        kind: SolutionKind,
        target_id: i64,
        request: &SubmitSolutionRequest,
    ) -> Result<SubmitSolutionResponse>;
}

pub struct MissingSolutionBackend;

#[async_trait]
impl SolutionBackend for MissingSolutionBackend {
    async fn upload_file(&self, name: &str, _blob: Vec<u8>) -> Result<UploadedFileHandle> {
        Err(anyhow!("solution backend is unavailable (file '{name}')"))
    }

    async fn submit_solution(
        &self,
        _kind: SolutionKind,
        target_id: i64,
        _request: &SubmitSolutionRequest,
    ) -> Result<SubmitSolutionResponse> {
        Err(anyhow!(
            "solution backend is unavailable (target {target_id})"
        ))
    }
}

pub struct HttpSolutionBackend {
    http: Client,
    server_url: String,
}

impl HttpSolutionBackend {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into(),
        }
    }

    fn submit_path(kind: SolutionKind, target_id: i64) -> String {
        match kind {
            SolutionKind::Assignment => format!("/exercise-assignments/{target_id}/submit"),
            SolutionKind::Reference => format!("/reference-solutions/{target_id}/evaluate"),
        }
    }
}

#[async_trait]
impl SolutionBackend for HttpSolutionBackend {
    async fn upload_file(&self, name: &str, blob: Vec<u8>) -> Result<UploadedFileHandle> {
        let handle: UploadedFileHandle = self
            .http
            .post(format!("{}/uploaded-files/upload", self.server_url))
            .query(&[("name", name)])
            .body(blob)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(handle)
    }

    async fn submit_solution(
        &self,
        kind: SolutionKind,
        target_id: i64,
        request: &SubmitSolutionRequest,
    ) -> Result<SubmitSolutionResponse> {
        let response = self
            .http
            .post(format!(
                "{}{}",
                self.server_url,
                Self::submit_path(kind, target_id)
            ))
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if let Ok(api_error) = serde_json::from_str::<ApiError>(&body) {
                return Err(ApiException::from(api_error).into());
            }
            return Err(anyhow!("submit rejected with status {status}: {body}"));
        }

        Ok(response.json().await?)
    }
}

/// Everything the UI observes about the pipeline.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    UploadsChanged,
    SubmissionStatusChanged(SubmissionStatus),
    ProgressUpdated(ProgressState),
    /// Terminal monitor outcome for the current descriptor; consumers
    /// refresh the evaluation record on it. Fired at most once per
    /// descriptor.
    EvaluationFinished,
    Error(String),
}

/// Wires the three pipeline components around one event channel: user
/// action → uploads → submission → evaluation monitor.
pub struct SolutionPipeline {
    uploads: Arc<UploadManager>,
    submission: Arc<SubmissionController>,
    monitor: Arc<EvaluationMonitor>,
    events: broadcast::Sender<PipelineEvent>,
    // Listener that settles the submission record when its evaluation
    // concludes; scoped to one submission and aborted with it.
    finish_waiter: Mutex<Option<JoinHandle<()>>>,
}

impl SolutionPipeline {
    pub fn new(server_url: impl Into<String>) -> Arc<Self> {
        Self::new_with_dependencies(
            Arc::new(HttpSolutionBackend::new(server_url)),
            Arc::new(WebSocketChannelConnector),
        )
    }

    pub fn new_with_dependencies(
        backend: Arc<dyn SolutionBackend>,
        connector: Arc<dyn ChannelConnector>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let uploads = UploadManager::new(Arc::clone(&backend), events.clone());
        let submission = SubmissionController::new(backend, events.clone());
        let monitor = EvaluationMonitor::new(connector, events.clone());
        Arc::new(Self {
            uploads,
            submission,
            monitor,
            events,
            finish_waiter: Mutex::new(None),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn uploads(&self) -> &Arc<UploadManager> {
        &self.uploads
    }

    pub fn submission(&self) -> &Arc<SubmissionController> {
        &self.submission
    }

    pub fn monitor(&self) -> &Arc<EvaluationMonitor> {
        &self.monitor
    }

    /// Switch to a new submission context. In-flight uploads of the
    /// abandoned context are cancelled (not merely ignored) and any open
    /// evaluation channel is closed before the new context exists.
    pub async fn begin_submission(&self, user_id: UserId, target_id: i64, kind: SolutionKind) {
        self.abort_finish_waiter().await;
        self.monitor.close().await;
        self.uploads.reset().await;
        self.submission.begin(user_id, target_id, kind).await;
    }

    /// Submit the composed solution with every ready file and start
    /// monitoring the evaluation it triggers.
    pub async fn submit(&self, note: &str) -> Result<MonitorDescriptor, SubmitError> {
        let files = self.uploads.ready_file_ids().await;
        let descriptor = self.submission.submit(note, files).await?;

        // Subscribe before opening so an instantly-terminal monitor (the
        // degraded path) cannot finish unobserved.
        let mut events = self.events.subscribe();
        self.monitor.open(descriptor.clone()).await;

        let submission = Arc::clone(&self.submission);
        let monitor = Arc::clone(&self.monitor);
        let waiter = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(PipelineEvent::EvaluationFinished) => {
                        // Only a conclusive finish closes the submission;
                        // after a transport loss or on the degraded path
                        // the user proceeds explicitly.
                        if monitor.progress().await.is_finished {
                            submission.mark_finished().await;
                        }
                        break;
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        let mut slot = self.finish_waiter.lock().await;
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        *slot = Some(waiter);

        Ok(descriptor)
    }

    /// UI action: stop waiting for the evaluation and mark the submission
    /// finished anyway.
    pub async fn proceed_without_waiting(&self) {
        self.abort_finish_waiter().await;
        self.monitor.close().await;
        self.submission.mark_finished().await;
    }

    /// Tear the whole pipeline down (logout / unmount).
    pub async fn reset(&self) {
        self.abort_finish_waiter().await;
        self.monitor.close().await;
        self.uploads.reset().await;
        self.submission.reset().await;
    }

    async fn abort_finish_waiter(&self) {
        if let Some(task) = self.finish_waiter.lock().await.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
