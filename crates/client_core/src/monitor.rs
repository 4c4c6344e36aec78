use std::sync::Arc;

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use shared::protocol::{MonitorDescriptor, MonitorFrame, TaskState};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{channel::ChannelConnector, PipelineEvent};

const DEFAULT_PROGRESS_MESSAGES: &[&str] = &[
    "Compiling the submitted sources ...",
    "Running test cases ...",
    "Measuring time and memory limits ...",
    "Comparing outputs with the reference ...",
    "Judging the results ...",
    "Crunching the numbers ...",
    "Feeding the grading machinery ...",
    "Almost there ...",
];

const TRANSPORT_LOST_TEXT: &str =
    "Real-time evaluation progress was interrupted; the evaluation continues on the server";

const UNTRACKED_TEXT: &str = "Real-time progress tracking is not available in this environment. \
     The solution is being evaluated out of sight; results will appear once it completes.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Completed,
    Skipped,
    Failed,
    Ok,
}

impl From<TaskState> for MessageStatus {
    fn from(state: TaskState) -> Self {
        match state {
            TaskState::Completed => MessageStatus::Completed,
            TaskState::Skipped => MessageStatus::Skipped,
            TaskState::Failed => MessageStatus::Failed,
        }
    }
}

/// One line of the human-readable audit trail of an evaluation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub was_successful: bool,
    pub status: MessageStatus,
    pub text: String,
}

/// Aggregated view of an in-flight evaluation. `total` always equals
/// `completed + skipped + failed`; `is_finished` only ever goes false→true
/// and `so_far_so_good` only true→false within one descriptor lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressState {
    pub total: u32,
    pub completed: u32,
    pub skipped: u32,
    pub failed: u32,
    pub messages: Vec<Message>,
    pub is_finished: bool,
    pub so_far_so_good: bool,
    /// Set on the degraded path: the evaluation runs out of sight and the
    /// counts above are not populated.
    pub untracked: bool,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self {
            total: 0,
            completed: 0,
            skipped: 0,
            failed: 0,
            messages: Vec::new(),
            is_finished: false,
            so_far_so_good: true,
            untracked: false,
        }
    }
}

impl ProgressState {
    fn untracked_snapshot() -> Self {
        Self {
            untracked: true,
            messages: vec![Message {
                was_successful: true,
                status: MessageStatus::Ok,
                text: UNTRACKED_TEXT.to_string(),
            }],
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorPhase {
    Idle,
    Connecting,
    Listening,
    Closed,
    ClosedWithError,
    Degraded,
}

/// Input alphabet of the progress reducer: decoded frames plus the
/// transport-level error the channel itself can produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Task {
        state: TaskState,
        text: Option<String>,
    },
    Finished,
    TransportError(String),
}

impl From<MonitorFrame> for ChannelEvent {
    fn from(frame: MonitorFrame) -> Self {
        match frame {
            MonitorFrame::Task { task_state, text } => ChannelEvent::Task {
                state: task_state,
                text,
            },
            MonitorFrame::Finished => ChannelEvent::Finished,
        }
    }
}

/// Texts for task events that arrive without one, sampled without
/// replacement. The pool reshuffles once exhausted, so no text repeats
/// within one exhaustion cycle. Each monitor owns its own pool.
pub struct MessagePool {
    texts: Vec<String>,
    remaining: Vec<String>,
    rng: StdRng,
}

impl MessagePool {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_os_rng())
    }

    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    pub fn with_texts(texts: Vec<String>, seed: u64) -> Self {
        Self {
            texts,
            remaining: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            texts: DEFAULT_PROGRESS_MESSAGES
                .iter()
                .map(|text| text.to_string())
                .collect(),
            remaining: Vec::new(),
            rng,
        }
    }

    pub fn draw(&mut self) -> String {
        if self.remaining.is_empty() {
            self.remaining = self.texts.clone();
            self.remaining.shuffle(&mut self.rng);
        }
        self.remaining
            .pop()
            .unwrap_or_else(|| "Evaluating ...".to_string())
    }
}

impl Default for MessagePool {
    fn default() -> Self {
        Self::new()
    }
}

/// Pure step of the monitor state machine: one channel event in, the next
/// progress state out. Events after completion change nothing.
pub struct ProgressReducer {
    expected_task_count: u32,
    pool: MessagePool,
}

impl ProgressReducer {
    pub fn new(expected_task_count: u32) -> Self {
        Self::with_pool(expected_task_count, MessagePool::new())
    }

    pub fn with_pool(expected_task_count: u32, pool: MessagePool) -> Self {
        Self {
            expected_task_count,
            pool,
        }
    }

    pub fn apply(&mut self, state: ProgressState, event: &ChannelEvent) -> ProgressState {
        if state.is_finished {
            return state;
        }

        let mut next = state;
        match event {
            ChannelEvent::Task {
                state: task_state,
                text,
            } => {
                next.total += 1;
                match task_state {
                    TaskState::Completed => next.completed += 1,
                    TaskState::Skipped => next.skipped += 1,
                    TaskState::Failed => next.failed += 1,
                }
                next.so_far_so_good =
                    next.so_far_so_good && matches!(task_state, TaskState::Completed);
                let text = text.clone().unwrap_or_else(|| self.pool.draw());
                next.messages.push(Message {
                    was_successful: matches!(task_state, TaskState::Completed),
                    status: MessageStatus::from(*task_state),
                    text,
                });
                // An unknown expected count (zero) never completes by itself;
                // only a FINISHED frame does.
                if self.expected_task_count > 0 && next.total >= self.expected_task_count {
                    next.is_finished = true;
                }
            }
            ChannelEvent::Finished => {
                next.is_finished = true;
            }
            ChannelEvent::TransportError(reason) => {
                // Losing visibility is not an evaluation outcome: one
                // SKIPPED-class message, is_finished untouched.
                next.messages.push(Message {
                    was_successful: false,
                    status: MessageStatus::Skipped,
                    text: format!("{TRANSPORT_LOST_TEXT} ({reason})"),
                });
            }
        }
        next
    }
}

/// Converts a [`MonitorDescriptor`] into a live [`ProgressState`] by
/// consuming the push channel. All mutation goes through the reducer; the
/// reader task only forwards decoded frames, so a stale task (superseded
/// descriptor) can never touch current state.
pub struct EvaluationMonitor {
    connector: Arc<dyn ChannelConnector>,
    inner: Mutex<MonitorInner>,
    events: broadcast::Sender<PipelineEvent>,
}

struct MonitorInner {
    phase: MonitorPhase,
    progress: ProgressState,
    reducer: ProgressReducer,
    descriptor: Option<MonitorDescriptor>,
    reader_task: Option<JoinHandle<()>>,
    generation: u64,
    finish_notified: bool,
}

impl EvaluationMonitor {
    pub fn new(
        connector: Arc<dyn ChannelConnector>,
        events: broadcast::Sender<PipelineEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            connector,
            inner: Mutex::new(MonitorInner {
                phase: MonitorPhase::Idle,
                progress: ProgressState::default(),
                reducer: ProgressReducer::new(0),
                descriptor: None,
                reader_task: None,
                generation: 0,
                finish_notified: false,
            }),
            events,
        })
    }

    /// Start observing a new descriptor. Any previously open channel is
    /// closed first; no two channels are ever open concurrently for one
    /// monitor instance.
    pub async fn open(self: &Arc<Self>, descriptor: MonitorDescriptor) {
        self.close().await;

        if !self.connector.is_available() {
            let (progress, generation) = {
                let mut inner = self.inner.lock().await;
                inner.generation += 1;
                inner.descriptor = Some(descriptor.clone());
                inner.finish_notified = false;
                inner.reducer = ProgressReducer::new(descriptor.expected_task_count);
                inner.progress = ProgressState::untracked_snapshot();
                inner.phase = MonitorPhase::Degraded;
                (inner.progress.clone(), inner.generation)
            };
            info!(
                channel_id = %descriptor.channel_id,
                "monitor: push channel unavailable; reporting untracked evaluation"
            );
            let _ = self.events.send(PipelineEvent::ProgressUpdated(progress));
            self.notify_finished(generation).await;
            return;
        }

        let generation = {
            let mut inner = self.inner.lock().await;
            inner.generation += 1;
            inner.descriptor = Some(descriptor.clone());
            inner.finish_notified = false;
            inner.reducer = ProgressReducer::new(descriptor.expected_task_count);
            inner.progress = ProgressState::default();
            inner.phase = MonitorPhase::Connecting;
            inner.generation
        };

        let monitor = Arc::clone(self);
        let task = tokio::spawn(async move {
            monitor.run_channel(descriptor, generation).await;
        });

        let mut inner = self.inner.lock().await;
        if inner.generation == generation {
            inner.reader_task = Some(task);
        } else {
            task.abort();
        }
    }

    /// Stop observing without a terminal outcome: re-initialization,
    /// unmount, or the user proceeding without waiting. Does not fire the
    /// finish notification.
    pub async fn close(&self) {
        let task = {
            let mut inner = self.inner.lock().await;
            inner.generation += 1;
            if matches!(
                inner.phase,
                MonitorPhase::Connecting | MonitorPhase::Listening
            ) {
                inner.phase = MonitorPhase::Closed;
            }
            inner.reader_task.take()
        };
        if let Some(task) = task {
            task.abort();
        }
    }

    pub async fn progress(&self) -> ProgressState {
        self.inner.lock().await.progress.clone()
    }

    pub async fn phase(&self) -> MonitorPhase {
        self.inner.lock().await.phase
    }

    pub async fn descriptor(&self) -> Option<MonitorDescriptor> {
        self.inner.lock().await.descriptor.clone()
    }

    async fn run_channel(self: Arc<Self>, descriptor: MonitorDescriptor, generation: u64) {
        let mut channel = match self.connector.connect(&descriptor).await {
            Ok(channel) => channel,
            Err(err) => {
                warn!(channel_id = %descriptor.channel_id, "monitor: connect failed: {err}");
                self.handle_event(generation, ChannelEvent::TransportError(err.to_string()))
                    .await;
                return;
            }
        };

        {
            let mut inner = self.inner.lock().await;
            if inner.generation != generation {
                return;
            }
            inner.phase = MonitorPhase::Listening;
        }
        info!(
            channel_id = %descriptor.channel_id,
            expected = descriptor.expected_task_count,
            "monitor: listening for evaluation events"
        );

        loop {
            match channel.next_frame().await {
                Some(Ok(frame)) => {
                    if self
                        .handle_event(generation, ChannelEvent::from(frame))
                        .await
                    {
                        break;
                    }
                }
                Some(Err(err)) => {
                    self.handle_event(generation, ChannelEvent::TransportError(err.to_string()))
                        .await;
                    return;
                }
                None => {
                    // The peer closed the stream before completion: a
                    // transport loss, not a normal close.
                    self.handle_event(
                        generation,
                        ChannelEvent::TransportError(
                            "channel closed before the evaluation finished".to_string(),
                        ),
                    )
                    .await;
                    return;
                }
            }
        }

        {
            let mut inner = self.inner.lock().await;
            if inner.generation != generation {
                return;
            }
            inner.phase = MonitorPhase::Closed;
        }
        info!(channel_id = %descriptor.channel_id, "monitor: evaluation finished, channel closed");
        self.notify_finished(generation).await;
    }

    /// Feed one event through the reducer. Returns true when the reader
    /// should stop (completion, error, or a superseded generation).
    async fn handle_event(&self, generation: u64, event: ChannelEvent) -> bool {
        let is_error = matches!(event, ChannelEvent::TransportError(_));
        let progress = {
            let mut inner = self.inner.lock().await;
            if inner.generation != generation {
                return true;
            }
            let state = std::mem::take(&mut inner.progress);
            inner.progress = inner.reducer.apply(state, &event);
            if is_error {
                inner.phase = MonitorPhase::ClosedWithError;
            }
            inner.progress.clone()
        };

        let finished = progress.is_finished;
        let _ = self.events.send(PipelineEvent::ProgressUpdated(progress));

        if is_error {
            self.notify_finished(generation).await;
            return true;
        }
        finished
    }

    /// Fires the completion notification exactly once per descriptor.
    async fn notify_finished(&self, generation: u64) {
        let should_notify = {
            let mut inner = self.inner.lock().await;
            if inner.generation != generation || inner.finish_notified {
                false
            } else {
                inner.finish_notified = true;
                true
            }
        };
        if should_notify {
            let _ = self.events.send(PipelineEvent::EvaluationFinished);
        }
    }
}

#[cfg(test)]
#[path = "tests/monitor_tests.rs"]
mod tests;
