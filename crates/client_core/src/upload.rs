use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Result};
use shared::{
    domain::{FileId, UploadStatus},
    protocol::UploadedFileHandle,
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{PipelineEvent, SolutionBackend};

/// A file picked by the user, not yet known to the server.
#[derive(Debug, Clone)]
pub struct LocalFile {
    pub name: String,
    pub blob: Vec<u8>,
}

/// Snapshot of one staged file, exposed to collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadEntry {
    pub name: String,
    pub status: UploadStatus,
    pub handle: Option<UploadedFileHandle>,
}

struct StagedFile {
    status: UploadStatus,
    handle: Option<UploadedFileHandle>,
    // Retained while a (re)transfer is still possible; dropped once uploaded.
    blob: Option<Vec<u8>>,
}

/// Stages files for a not-yet-created submission. Each transfer runs as
/// its own task; a failure on one file never aborts the others, and a
/// failed entry keeps its blob so the user can retry or discard it.
pub struct UploadManager {
    backend: Arc<dyn SolutionBackend>,
    inner: Mutex<UploadState>,
    events: broadcast::Sender<PipelineEvent>,
}

struct UploadState {
    files: HashMap<String, StagedFile>,
    transfers: HashMap<String, JoinHandle<()>>,
    // Bumped on reset; transfers from an abandoned context compare against
    // it and never mutate current state.
    generation: u64,
}

impl UploadManager {
    pub fn new(
        backend: Arc<dyn SolutionBackend>,
        events: broadcast::Sender<PipelineEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            inner: Mutex::new(UploadState {
                files: HashMap::new(),
                transfers: HashMap::new(),
                generation: 0,
            }),
            events,
        })
    }

    /// Stage files and start transferring each of them concurrently. A
    /// name that is already staged is replaced and its superseded transfer
    /// aborted, keeping one active entry per name.
    pub async fn add_files(self: &Arc<Self>, files: Vec<LocalFile>) {
        for file in files {
            let name = file.name.clone();
            let generation = {
                let mut state = self.inner.lock().await;
                if let Some(task) = state.transfers.remove(&name) {
                    task.abort();
                }
                state.files.insert(
                    name.clone(),
                    StagedFile {
                        status: UploadStatus::Queued,
                        handle: None,
                        blob: Some(file.blob),
                    },
                );
                state.generation
            };
            self.emit_changed();
            self.spawn_transfer(name, generation).await;
        }
    }

    /// Soft-delete an uploaded file; the entry is retained for restore and
    /// nothing is deleted on the server.
    pub async fn remove_file(&self, name: &str) -> Result<()> {
        self.transition(name, UploadStatus::Uploaded, UploadStatus::Removed)
            .await
    }

    pub async fn restore_file(&self, name: &str) -> Result<()> {
        self.transition(name, UploadStatus::Removed, UploadStatus::Uploaded)
            .await
    }

    /// Permanently discard a failed entry.
    pub async fn remove_failed_file(&self, name: &str) -> Result<()> {
        {
            let mut state = self.inner.lock().await;
            let entry = state
                .files
                .get(name)
                .ok_or_else(|| anyhow!("no staged file named '{name}'"))?;
            if entry.status != UploadStatus::Failed {
                return Err(anyhow!(
                    "file '{name}' has status {:?}, expected failed",
                    entry.status
                ));
            }
            state.files.remove(name);
        }
        self.emit_changed();
        Ok(())
    }

    /// Re-issue the transfer for a failed entry under the same identity.
    pub async fn retry_upload_file(self: &Arc<Self>, name: &str) -> Result<()> {
        let generation = {
            let mut state = self.inner.lock().await;
            let entry = state
                .files
                .get_mut(name)
                .ok_or_else(|| anyhow!("no staged file named '{name}'"))?;
            if entry.status != UploadStatus::Failed {
                return Err(anyhow!(
                    "file '{name}' has status {:?}, expected failed",
                    entry.status
                ));
            }
            if entry.blob.is_none() {
                return Err(anyhow!("file '{name}' has no retained data to retry"));
            }
            entry.status = UploadStatus::Uploading;
            state.generation
        };
        self.emit_changed();
        self.spawn_transfer(name.to_string(), generation).await;
        Ok(())
    }

    /// Abandon the whole staging area: aborts every in-flight transfer and
    /// clears all entries. A stray completion from before the reset can no
    /// longer mutate state.
    pub async fn reset(&self) {
        let transfers: Vec<JoinHandle<()>> = {
            let mut state = self.inner.lock().await;
            state.generation += 1;
            state.files.clear();
            state.transfers.drain().map(|(_, task)| task).collect()
        };
        for task in transfers {
            task.abort();
        }
        self.emit_changed();
    }

    pub async fn entries(&self) -> Vec<UploadEntry> {
        let state = self.inner.lock().await;
        let mut entries: Vec<UploadEntry> = state
            .files
            .iter()
            .map(|(name, file)| UploadEntry {
                name: name.clone(),
                status: file.status,
                handle: file.handle.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub async fn status_of(&self, name: &str) -> Option<UploadStatus> {
        self.inner
            .lock()
            .await
            .files
            .get(name)
            .map(|entry| entry.status)
    }

    /// Server file ids eligible for submission: uploaded and not removed.
    pub async fn ready_file_ids(&self) -> Vec<FileId> {
        let state = self.inner.lock().await;
        let mut ids: Vec<FileId> = state
            .files
            .values()
            .filter(|entry| entry.status == UploadStatus::Uploaded)
            .filter_map(|entry| entry.handle.as_ref().map(|handle| handle.id))
            .collect();
        ids.sort_by_key(|id| id.0);
        ids
    }

    pub async fn has_ready_files(&self) -> bool {
        !self.ready_file_ids().await.is_empty()
    }

    /// True once no transfer is queued or running.
    pub async fn is_settled(&self) -> bool {
        let state = self.inner.lock().await;
        !state
            .files
            .values()
            .any(|entry| matches!(entry.status, UploadStatus::Queued | UploadStatus::Uploading))
    }

    async fn transition(&self, name: &str, from: UploadStatus, to: UploadStatus) -> Result<()> {
        {
            let mut state = self.inner.lock().await;
            let entry = state
                .files
                .get_mut(name)
                .ok_or_else(|| anyhow!("no staged file named '{name}'"))?;
            if entry.status != from {
                return Err(anyhow!(
                    "file '{name}' has status {:?}, expected {from:?}",
                    entry.status
                ));
            }
            entry.status = to;
        }
        self.emit_changed();
        Ok(())
    }

    async fn spawn_transfer(self: &Arc<Self>, name: String, generation: u64) {
        let manager = Arc::clone(self);
        let task_name = name.clone();
        let task = tokio::spawn(async move {
            manager.run_transfer(task_name, generation).await;
        });

        let mut state = self.inner.lock().await;
        if state.generation == generation && state.files.contains_key(&name) {
            state.transfers.insert(name, task);
        } else {
            task.abort();
        }
    }

    async fn run_transfer(self: Arc<Self>, name: String, generation: u64) {
        let blob = {
            let mut state = self.inner.lock().await;
            if state.generation != generation {
                return;
            }
            let Some(entry) = state.files.get_mut(&name) else {
                return;
            };
            entry.status = UploadStatus::Uploading;
            match entry.blob.clone() {
                Some(blob) => blob,
                None => return,
            }
        };
        self.emit_changed();

        let result = self.backend.upload_file(&name, blob).await;

        {
            let mut state = self.inner.lock().await;
            if state.generation != generation {
                return;
            }
            let Some(entry) = state.files.get_mut(&name) else {
                return;
            };
            match result {
                Ok(handle) => {
                    info!(file = %name, file_id = handle.id.0, "upload: transfer complete");
                    entry.status = UploadStatus::Uploaded;
                    entry.handle = Some(handle);
                    entry.blob = None;
                }
                Err(err) => {
                    // The blob stays around so the user can retry.
                    warn!(file = %name, "upload: transfer failed: {err}");
                    entry.status = UploadStatus::Failed;
                    let _ = self
                        .events
                        .send(PipelineEvent::Error(format!("upload of '{name}' failed: {err}")));
                }
            }
            state.transfers.remove(&name);
        }
        self.emit_changed();
    }

    fn emit_changed(&self) {
        let _ = self.events.send(PipelineEvent::UploadsChanged);
    }
}

#[cfg(test)]
#[path = "tests/upload_tests.rs"]
mod tests;
