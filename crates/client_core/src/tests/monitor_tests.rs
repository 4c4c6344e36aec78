use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use tokio::{net::TcpListener, sync::mpsc, time::timeout};

use super::*;
use crate::channel::{EvaluationChannel, MissingChannelConnector, WebSocketChannelConnector};

fn task(state: TaskState, text: Option<&str>) -> ChannelEvent {
    ChannelEvent::Task {
        state,
        text: text.map(str::to_string),
    }
}

fn task_frame(state: TaskState, text: Option<&str>) -> MonitorFrame {
    MonitorFrame::Task {
        task_state: state,
        text: text.map(str::to_string),
    }
}

fn seeded_reducer(expected: u32) -> ProgressReducer {
    ProgressReducer::with_pool(expected, MessagePool::seeded(7))
}

#[test]
fn reducer_counts_split_by_task_state() {
    let mut reducer = seeded_reducer(0);
    let mut state = ProgressState::default();
    for event in [
        task(TaskState::Completed, Some("compiled")),
        task(TaskState::Skipped, Some("io tests")),
        task(TaskState::Failed, Some("limits")),
        task(TaskState::Completed, Some("style")),
    ] {
        state = reducer.apply(state, &event);
        assert_eq!(state.total, state.completed + state.skipped + state.failed);
    }
    assert_eq!(state.total, 4);
    assert_eq!(state.completed, 2);
    assert_eq!(state.skipped, 1);
    assert_eq!(state.failed, 1);
    assert_eq!(state.messages.len(), 4);
    assert!(!state.is_finished);
    assert!(!state.so_far_so_good);
}

#[test]
fn reducer_finishes_once_expected_count_is_reached() {
    let mut reducer = seeded_reducer(2);
    let mut state = ProgressState::default();
    state = reducer.apply(state, &task(TaskState::Completed, Some("compiled")));
    assert!(!state.is_finished);
    state = reducer.apply(state, &task(TaskState::Skipped, Some("deadline tests")));
    assert!(state.is_finished);
    assert_eq!(state.total, 2);
    assert_eq!(state.completed, 1);
    assert_eq!(state.skipped, 1);
    assert!(!state.so_far_so_good);
}

#[test]
fn reducer_finished_frame_completes_early() {
    let mut reducer = seeded_reducer(5);
    let mut state = ProgressState::default();
    state = reducer.apply(state, &task(TaskState::Completed, None));
    state = reducer.apply(state, &task(TaskState::Completed, None));
    state = reducer.apply(state, &ChannelEvent::Finished);
    assert!(state.is_finished);
    assert_eq!(state.total, 2);
    assert!(state.so_far_so_good);
}

#[test]
fn reducer_ignores_events_after_completion() {
    let mut reducer = seeded_reducer(1);
    let mut state = ProgressState::default();
    state = reducer.apply(state, &task(TaskState::Completed, Some("done")));
    assert!(state.is_finished);

    let settled = state.clone();
    state = reducer.apply(state, &task(TaskState::Failed, Some("late")));
    state = reducer.apply(state, &ChannelEvent::TransportError("late error".into()));
    assert_eq!(state, settled);
}

#[test]
fn so_far_so_good_never_recovers() {
    let mut reducer = seeded_reducer(0);
    let mut state = ProgressState::default();
    assert!(state.so_far_so_good);
    state = reducer.apply(state, &task(TaskState::Completed, None));
    assert!(state.so_far_so_good);
    state = reducer.apply(state, &task(TaskState::Failed, None));
    assert!(!state.so_far_so_good);
    state = reducer.apply(state, &task(TaskState::Completed, None));
    assert!(!state.so_far_so_good);
}

#[test]
fn unknown_expected_count_only_finishes_on_finished_frame() {
    let mut reducer = seeded_reducer(0);
    let mut state = ProgressState::default();
    for _ in 0..10 {
        state = reducer.apply(state, &task(TaskState::Completed, None));
    }
    assert!(!state.is_finished);
    state = reducer.apply(state, &ChannelEvent::Finished);
    assert!(state.is_finished);
}

#[test]
fn transport_error_adds_single_message_without_finishing() {
    let mut reducer = seeded_reducer(3);
    let mut state = ProgressState::default();
    state = reducer.apply(state, &task(TaskState::Completed, Some("compiled")));
    state = reducer.apply(state, &ChannelEvent::TransportError("socket torn down".into()));

    assert_eq!(state.messages.len(), 2);
    let last = state.messages.last().expect("message");
    assert_eq!(last.status, MessageStatus::Skipped);
    assert!(!last.was_successful);
    assert!(last.text.contains("socket torn down"));
    // The counters describe evaluation tasks, not transport incidents.
    assert_eq!(state.total, 1);
    assert!(!state.is_finished);
}

#[test]
fn missing_task_text_is_synthesized_from_pool() {
    let pool = MessagePool::with_texts(vec!["judging".to_string()], 3);
    let mut reducer = ProgressReducer::with_pool(0, pool);
    let state = reducer.apply(ProgressState::default(), &task(TaskState::Completed, None));
    assert_eq!(state.messages[0].text, "judging");
}

#[test]
fn message_pool_does_not_repeat_within_a_cycle() {
    let texts: Vec<String> = ["alpha", "beta", "gamma"]
        .iter()
        .map(|text| text.to_string())
        .collect();
    let mut pool = MessagePool::with_texts(texts.clone(), 42);
    for _ in 0..2 {
        let mut cycle: Vec<String> = (0..texts.len()).map(|_| pool.draw()).collect();
        cycle.sort();
        assert_eq!(cycle, texts);
    }
}

#[test]
fn seeded_pools_draw_identical_sequences() {
    let mut first = MessagePool::seeded(99);
    let mut second = MessagePool::seeded(99);
    for _ in 0..16 {
        assert_eq!(first.draw(), second.draw());
    }
}

struct TestChannel {
    rx: mpsc::UnboundedReceiver<Result<MonitorFrame>>,
}

#[async_trait]
impl EvaluationChannel for TestChannel {
    async fn next_frame(&mut self) -> Option<Result<MonitorFrame>> {
        self.rx.recv().await
    }
}

/// Hands the monitor a scripted channel per `connect` call; frames are
/// pushed from the test body.
struct TestConnector {
    senders: std::sync::Mutex<Vec<mpsc::UnboundedSender<Result<MonitorFrame>>>>,
}

impl TestConnector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            senders: std::sync::Mutex::new(Vec::new()),
        })
    }

    fn sender(&self, index: usize) -> mpsc::UnboundedSender<Result<MonitorFrame>> {
        self.senders.lock().expect("senders lock")[index].clone()
    }

    fn connections(&self) -> usize {
        self.senders.lock().expect("senders lock").len()
    }

    /// Drops the server half so the channel reads as closed.
    fn close_channel(&self, index: usize) {
        self.senders.lock().expect("senders lock").remove(index);
    }
}

#[async_trait]
impl ChannelConnector for TestConnector {
    async fn connect(&self, _descriptor: &MonitorDescriptor) -> Result<Box<dyn EvaluationChannel>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().expect("senders lock").push(tx);
        Ok(Box::new(TestChannel { rx }))
    }
}

fn descriptor(channel_id: &str, expected: u32) -> MonitorDescriptor {
    MonitorDescriptor {
        channel_id: channel_id.to_string(),
        url: "ws://127.0.0.1:9/unused".to_string(),
        expected_task_count: expected,
    }
}

fn monitor_with(
    connector: Arc<dyn ChannelConnector>,
) -> (Arc<EvaluationMonitor>, broadcast::Receiver<PipelineEvent>) {
    let (events, rx) = broadcast::channel(64);
    (EvaluationMonitor::new(connector, events), rx)
}

async fn wait_for_phase(monitor: &Arc<EvaluationMonitor>, phase: MonitorPhase) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while monitor.phase().await != phase {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {phase:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_total(monitor: &Arc<EvaluationMonitor>, total: u32) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while monitor.progress().await.total != total {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for total {total}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_finished(rx: &mut broadcast::Receiver<PipelineEvent>) {
    timeout(Duration::from_secs(2), async {
        loop {
            match rx.recv().await {
                Ok(PipelineEvent::EvaluationFinished) => break,
                Ok(_) => continue,
                Err(err) => panic!("event stream ended: {err}"),
            }
        }
    })
    .await
    .expect("finish notification timeout");
}

async fn assert_no_finish(rx: &mut broadcast::Receiver<PipelineEvent>, window: Duration) {
    let extra_finish = timeout(window, async {
        loop {
            match rx.recv().await {
                Ok(PipelineEvent::EvaluationFinished) => break,
                Ok(_) => continue,
                Err(_) => std::future::pending::<()>().await,
            }
        }
    })
    .await;
    assert!(extra_finish.is_err(), "unexpected finish notification");
}

#[tokio::test]
async fn monitor_tracks_progress_to_completion() {
    let connector = TestConnector::new();
    let (monitor, mut rx) = monitor_with(connector.clone());
    monitor.open(descriptor("chan-1", 2)).await;
    wait_for_phase(&monitor, MonitorPhase::Listening).await;

    let sender = connector.sender(0);
    sender
        .send(Ok(task_frame(TaskState::Completed, Some("compiled"))))
        .expect("send frame");
    sender
        .send(Ok(task_frame(TaskState::Completed, Some("tests passed"))))
        .expect("send frame");

    wait_for_finished(&mut rx).await;
    let progress = monitor.progress().await;
    assert!(progress.is_finished);
    assert!(progress.so_far_so_good);
    assert_eq!(progress.completed, 2);
    assert_eq!(monitor.phase().await, MonitorPhase::Closed);
}

#[tokio::test]
async fn monitor_reports_error_and_finishes_once() {
    let connector = TestConnector::new();
    let (monitor, mut rx) = monitor_with(connector.clone());
    monitor.open(descriptor("chan-1", 3)).await;
    wait_for_phase(&monitor, MonitorPhase::Listening).await;

    let sender = connector.sender(0);
    sender
        .send(Ok(task_frame(TaskState::Completed, Some("compiled"))))
        .expect("send frame");
    sender
        .send(Err(anyhow!("socket torn down")))
        .expect("send error");

    wait_for_finished(&mut rx).await;
    let progress = monitor.progress().await;
    assert!(!progress.is_finished);
    assert_eq!(progress.total, 1);
    assert_eq!(
        progress.messages.last().map(|message| message.status),
        Some(MessageStatus::Skipped)
    );
    assert_eq!(monitor.phase().await, MonitorPhase::ClosedWithError);

    assert_no_finish(&mut rx, Duration::from_millis(150)).await;
}

#[tokio::test]
async fn monitor_treats_server_close_without_finished_as_error() {
    let connector = TestConnector::new();
    let (monitor, mut rx) = monitor_with(connector.clone());
    monitor.open(descriptor("chan-1", 2)).await;
    wait_for_phase(&monitor, MonitorPhase::Listening).await;

    connector
        .sender(0)
        .send(Ok(task_frame(TaskState::Completed, None)))
        .expect("send frame");
    wait_for_total(&monitor, 1).await;
    connector.close_channel(0);

    wait_for_finished(&mut rx).await;
    let progress = monitor.progress().await;
    assert!(!progress.is_finished);
    assert_eq!(progress.messages.len(), 2);
    assert_eq!(monitor.phase().await, MonitorPhase::ClosedWithError);
}

#[tokio::test]
async fn monitor_reopen_ignores_stale_channel() {
    let connector = TestConnector::new();
    let (monitor, mut rx) = monitor_with(connector.clone());
    monitor.open(descriptor("chan-old", 3)).await;
    wait_for_phase(&monitor, MonitorPhase::Listening).await;

    let stale = connector.sender(0);
    stale
        .send(Ok(task_frame(TaskState::Completed, Some("old progress"))))
        .expect("send frame");
    wait_for_total(&monitor, 1).await;

    monitor.open(descriptor("chan-new", 1)).await;
    wait_for_phase(&monitor, MonitorPhase::Listening).await;
    assert_eq!(connector.connections(), 2);

    // The superseded channel may outlive the switch; anything it still
    // carries must not reach the new state.
    let _ = stale.send(Ok(task_frame(TaskState::Failed, Some("stale failure"))));
    tokio::time::sleep(Duration::from_millis(50)).await;
    let progress = monitor.progress().await;
    assert_eq!(progress.total, 0);
    assert!(progress.so_far_so_good);

    connector
        .sender(1)
        .send(Ok(task_frame(TaskState::Completed, Some("new progress"))))
        .expect("send frame");
    wait_for_finished(&mut rx).await;
    let progress = monitor.progress().await;
    assert!(progress.is_finished);
    assert_eq!(progress.total, 1);
    assert_eq!(
        monitor.descriptor().await.map(|d| d.channel_id),
        Some("chan-new".to_string())
    );
}

#[tokio::test]
async fn monitor_degrades_without_channel_support() {
    let (monitor, mut rx) = monitor_with(Arc::new(MissingChannelConnector));
    monitor.open(descriptor("chan-9", 4)).await;

    let progress = monitor.progress().await;
    assert!(progress.untracked);
    assert!(!progress.is_finished);
    assert_eq!(progress.total, 0);
    assert_eq!(progress.messages.len(), 1);
    assert_eq!(monitor.phase().await, MonitorPhase::Degraded);

    wait_for_finished(&mut rx).await;
    assert_no_finish(&mut rx, Duration::from_millis(150)).await;
}

#[tokio::test]
async fn explicit_close_fires_no_finish_notification() {
    let connector = TestConnector::new();
    let (monitor, mut rx) = monitor_with(connector.clone());
    monitor.open(descriptor("chan-1", 3)).await;
    wait_for_phase(&monitor, MonitorPhase::Listening).await;

    connector
        .sender(0)
        .send(Ok(task_frame(TaskState::Completed, None)))
        .expect("send frame");
    wait_for_total(&monitor, 1).await;

    monitor.close().await;
    assert_eq!(monitor.phase().await, MonitorPhase::Closed);
    assert_no_finish(&mut rx, Duration::from_millis(150)).await;
}

#[derive(Clone)]
struct WsServerState {
    handshakes: Arc<Mutex<Vec<String>>>,
    frames: Vec<MonitorFrame>,
}

async fn handle_monitor_socket(
    ws: WebSocketUpgrade,
    State(state): State<WsServerState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_frames(socket, state))
}

async fn stream_frames(mut socket: WebSocket, state: WsServerState) {
    let Some(Ok(WsMessage::Text(channel_id))) = socket.recv().await else {
        return;
    };
    state.handshakes.lock().await.push(channel_id);
    for frame in &state.frames {
        let text = serde_json::to_string(frame).expect("encode frame");
        if socket.send(WsMessage::Text(text)).await.is_err() {
            return;
        }
    }
    let _ = socket.send(WsMessage::Close(None)).await;
}

async fn spawn_monitor_server(
    frames: Vec<MonitorFrame>,
) -> Result<(String, Arc<Mutex<Vec<String>>>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let handshakes = Arc::new(Mutex::new(Vec::new()));
    let state = WsServerState {
        handshakes: handshakes.clone(),
        frames,
    };
    let app = Router::new()
        .route("/monitor", get(handle_monitor_socket))
        .with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("ws://{addr}/monitor"), handshakes))
}

#[tokio::test]
async fn websocket_channel_performs_handshake_and_streams_frames() {
    let frames = vec![
        task_frame(TaskState::Completed, Some("compiled")),
        task_frame(TaskState::Completed, None),
        MonitorFrame::Finished,
    ];
    let (url, handshakes) = spawn_monitor_server(frames).await.expect("spawn server");

    let (monitor, mut rx) = monitor_with(Arc::new(WebSocketChannelConnector));
    monitor
        .open(MonitorDescriptor {
            channel_id: "eval-42".to_string(),
            url,
            expected_task_count: 0,
        })
        .await;

    wait_for_finished(&mut rx).await;
    let progress = monitor.progress().await;
    assert!(progress.is_finished);
    assert_eq!(progress.completed, 2);
    assert_eq!(progress.messages.len(), 2);
    // The second frame carried no text, so one was synthesized.
    assert!(!progress.messages[1].text.is_empty());
    assert_eq!(handshakes.lock().await.as_slice(), ["eval-42".to_string()]);
}
