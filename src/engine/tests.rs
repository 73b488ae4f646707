use super::*;
use crate::domain::accuracy::FeedbackType;
use crate::domain::exercise::{Exercise, InMemoryCatalog};
use crate::infrastructure::storage::{InMemoryResultStore, StorageError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Mutex};
use tokio::time::timeout;

/// Reading source the test can cut, as if the device dropped.
struct CuttableSource {
    sender: Mutex<Option<broadcast::Sender<MotionReading>>>,
    spare: broadcast::Sender<MotionReading>,
}

impl CuttableSource {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(64);
        let (spare, _) = broadcast::channel(1);
        Self {
            sender: Mutex::new(Some(sender)),
            spare,
        }
    }

    fn send(&self, angle: f32) {
        let sender = self.sender.lock().unwrap();
        sender
            .as_ref()
            .expect("source was cut")
            .send(MotionReading::with_angle(0, angle))
            .unwrap();
    }

    fn cut(&self) {
        self.sender.lock().unwrap().take();
    }
}

impl ReadingSource for CuttableSource {
    fn subscribe_readings(&self) -> broadcast::Receiver<MotionReading> {
        match self.sender.lock().unwrap().as_ref() {
            Some(sender) => sender.subscribe(),
            None => self.spare.subscribe(),
        }
    }
}

struct Harness {
    engine: SessionEngine,
    source: Arc<CuttableSource>,
    store: Arc<InMemoryResultStore>,
}

/// Arm flexion: target 90 degrees, 15 points. Duration overridden per test.
fn arm_exercise(duration: u32) -> Exercise {
    let mut exercise = InMemoryCatalog::seeded().get_exercise_by_id("1").unwrap();
    exercise.duration = duration;
    exercise
}

fn harness(exercises: Vec<Exercise>) -> Harness {
    let source = Arc::new(CuttableSource::new());
    let store = Arc::new(InMemoryResultStore::new());
    let engine = SessionEngine::spawn(
        Arc::new(InMemoryCatalog::new(exercises)),
        source.clone(),
        store.clone(),
        EngineConfig::default(),
    );
    Harness {
        engine,
        source,
        store,
    }
}

async fn wait_movements(engine: &SessionEngine, count: u32) {
    let mut rx = engine.watch_snapshot();
    timeout(Duration::from_secs(5), rx.wait_for(|s| s.total_movements == count))
        .await
        .expect("readings were not processed")
        .unwrap();
}

async fn wait_completed(engine: &SessionEngine) -> ExerciseResult {
    let mut rx = engine.watch_completed();
    let result = rx.wait_for(|r| r.is_some()).await.unwrap().clone();
    result.unwrap()
}

fn invalid(operation: &'static str, state: SessionState) -> SessionError {
    SessionError::InvalidTransition { operation, state }
}

#[tokio::test]
async fn unknown_exercise_leaves_nothing_loaded() {
    let h = harness(vec![arm_exercise(60)]);
    h.engine.load_exercise("1").await.unwrap();

    assert_eq!(
        h.engine.load_exercise("missing").await,
        Err(SessionError::UnknownExercise("missing".into()))
    );
    assert_eq!(h.engine.snapshot().exercise_id, None);
    assert_eq!(h.engine.start().await, Err(SessionError::NoExerciseLoaded));
}

#[tokio::test]
async fn operations_from_the_wrong_state_are_rejected() {
    let h = harness(vec![arm_exercise(60)]);
    assert_eq!(h.engine.pause().await, Err(SessionError::NoExerciseLoaded));

    h.engine.load_exercise("1").await.unwrap();
    assert_eq!(h.engine.pause().await, Err(invalid("pause", SessionState::Preparation)));
    assert_eq!(h.engine.resume().await, Err(invalid("resume", SessionState::Preparation)));
    assert_eq!(h.engine.end().await, Err(invalid("end", SessionState::Preparation)));

    h.engine.start().await.unwrap();
    assert_eq!(h.engine.start().await, Err(invalid("start", SessionState::Active)));
    assert_eq!(h.engine.resume().await, Err(invalid("resume", SessionState::Active)));
    assert_eq!(h.engine.load_exercise("1").await, Err(invalid("load", SessionState::Active)));

    h.engine.pause().await.unwrap();
    assert_eq!(h.engine.pause().await, Err(invalid("pause", SessionState::Paused)));

    h.engine.end().await.unwrap();
    assert_eq!(h.engine.pause().await, Err(invalid("pause", SessionState::Completed)));
    assert_eq!(h.engine.resume().await, Err(invalid("resume", SessionState::Completed)));
    assert_eq!(h.store.results().len(), 1);
}

#[tokio::test]
async fn ending_twice_persists_a_single_result() {
    let h = harness(vec![arm_exercise(60)]);
    h.engine.load_exercise("1").await.unwrap();
    h.engine.start().await.unwrap();

    let result = h.engine.end().await.unwrap();
    assert_eq!(h.engine.end().await, Err(invalid("end", SessionState::Completed)));

    assert_eq!(h.store.results(), vec![result.clone()]);
    let sessions = h.store.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id, result.session_id);
    assert!(sessions[0].is_completed);
    assert_eq!(sessions[0].completed_exercises, 1);
}

#[tokio::test]
async fn readings_are_scored_into_the_final_result() {
    let h = harness(vec![arm_exercise(60)]);
    h.engine.load_exercise("1").await.unwrap();
    h.engine.start().await.unwrap();

    // 100, 50 and 83.3 percent against the 90 degree target
    for angle in [90.0, 45.0, 75.0] {
        h.source.send(angle);
    }
    wait_movements(&h.engine, 3).await;

    let live = h.engine.snapshot();
    assert_eq!(live.correct_movements, 2);
    assert_eq!(live.score, 2);

    let result = h.engine.end().await.unwrap();
    assert_eq!(result.total_movements, 3);
    assert_eq!(result.correct_movements, 2);
    assert_eq!(result.sensor_data.len(), 3);
    assert!((result.accuracy - 77.777_78).abs() < 1e-3);
    assert_eq!(result.score, 15 + 7);
    assert_eq!(result.score, accuracy::final_score(15, result.accuracy));

    assert_eq!(h.engine.snapshot().state, SessionState::Completed);
    assert_eq!(h.engine.snapshot().score, result.score);
    assert_eq!(h.store.results().len(), 1);
}

#[tokio::test]
async fn ending_without_readings_scores_zero_accuracy() {
    let h = harness(vec![arm_exercise(60)]);
    h.engine.load_exercise("1").await.unwrap();
    h.engine.start().await.unwrap();

    let result = h.engine.end().await.unwrap();
    assert_eq!(result.accuracy, 0.0);
    assert_eq!(result.score, 15);
    assert_eq!(result.total_movements, 0);
}

#[tokio::test]
async fn readings_while_paused_are_ignored() {
    let h = harness(vec![arm_exercise(60)]);
    h.engine.load_exercise("1").await.unwrap();
    h.engine.start().await.unwrap();
    h.engine.pause().await.unwrap();

    h.source.send(90.0);
    h.engine.resume().await.unwrap();
    h.source.send(90.0);
    wait_movements(&h.engine, 1).await;

    let result = h.engine.end().await.unwrap();
    assert_eq!(result.total_movements, 1);
}

#[tokio::test(start_paused = true)]
async fn timer_ticks_exactly_duration_times() {
    let h = harness(vec![arm_exercise(3)]);
    h.engine.load_exercise("1").await.unwrap();

    let started = Instant::now();
    h.engine.start().await.unwrap();
    let result = wait_completed(&h.engine).await;

    assert_eq!(started.elapsed(), Duration::from_secs(3));
    assert_eq!(result.duration, 3);
    let snapshot = h.engine.snapshot();
    assert_eq!(snapshot.state, SessionState::Completed);
    assert_eq!(snapshot.time_remaining, 0);
    assert_eq!(snapshot.progress, 1.0);
    assert_eq!(h.store.results().len(), 1);

    // Auto-end counts as the one end of this attempt
    assert_eq!(h.engine.end().await, Err(invalid("end", SessionState::Completed)));
}

#[tokio::test(start_paused = true)]
async fn pause_extends_wall_clock_time_by_its_length() {
    let h = harness(vec![arm_exercise(5)]);
    h.engine.load_exercise("1").await.unwrap();

    let started = Instant::now();
    h.engine.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(2500)).await;
    let paused = h.engine.pause().await.unwrap();
    assert_eq!(paused.time_remaining, 3);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.engine.snapshot().time_remaining, 3);
    assert_eq!(h.engine.snapshot().state, SessionState::Paused);

    h.engine.resume().await.unwrap();
    let result = wait_completed(&h.engine).await;

    assert_eq!(started.elapsed(), Duration::from_secs(15));
    assert_eq!(result.duration, 5);
}

#[tokio::test(start_paused = true)]
async fn manual_end_records_actual_duration() {
    let h = harness(vec![arm_exercise(120)]);
    h.engine.load_exercise("1").await.unwrap();
    h.engine.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(4500)).await;
    let snapshot = h.engine.snapshot();
    assert_eq!(snapshot.time_remaining, 116);
    assert!((snapshot.progress - 4.0 / 120.0).abs() < 1e-6);

    let result = h.engine.end().await.unwrap();
    assert_eq!(result.duration, 4);
}

#[tokio::test]
async fn zero_duration_completes_on_start() {
    let h = harness(vec![arm_exercise(0)]);
    h.engine.load_exercise("1").await.unwrap();

    let snapshot = h.engine.start().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Completed);
    assert_eq!(h.store.results().len(), 1);
    assert_eq!(h.store.results()[0].duration, 0);
}

#[tokio::test(start_paused = true)]
async fn feedback_expires_unless_superseded() {
    let h = harness(vec![arm_exercise(120)]);
    let mut feedback = h.engine.watch_feedback();
    h.engine.load_exercise("1").await.unwrap();
    h.engine.start().await.unwrap();

    h.source.send(90.0);
    wait_movements(&h.engine, 1).await;
    let first = feedback.borrow().clone().unwrap();
    assert_eq!(first.kind, FeedbackType::Correct);
    assert_eq!(first.accuracy, 100.0);

    // Superseded at 2s, so the first expiry at 3s must not clear it
    tokio::time::sleep(Duration::from_secs(2)).await;
    h.source.send(45.0);
    wait_movements(&h.engine, 2).await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let second = feedback.borrow_and_update().clone().unwrap();
    assert_eq!(second.kind, FeedbackType::Incorrect);
    assert!(second.sequence > first.sequence);

    tokio::time::sleep(Duration::from_millis(1400)).await;
    assert!(feedback.borrow().is_some());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(feedback.borrow().is_none());
}

#[tokio::test]
async fn end_clears_pending_feedback() {
    let h = harness(vec![arm_exercise(120)]);
    let feedback = h.engine.watch_feedback();
    h.engine.load_exercise("1").await.unwrap();
    h.engine.start().await.unwrap();

    h.source.send(80.0);
    wait_movements(&h.engine, 1).await;
    assert!(feedback.borrow().is_some());

    h.engine.end().await.unwrap();
    assert!(feedback.borrow().is_none());
}

#[tokio::test(start_paused = true)]
async fn losing_the_stream_does_not_end_the_attempt() {
    let h = harness(vec![arm_exercise(30)]);
    h.engine.load_exercise("1").await.unwrap();
    h.engine.start().await.unwrap();

    h.source.send(90.0);
    wait_movements(&h.engine, 1).await;
    h.source.cut();

    tokio::time::sleep(Duration::from_millis(5500)).await;
    let snapshot = h.engine.snapshot();
    assert_eq!(snapshot.state, SessionState::Active);
    assert_eq!(snapshot.time_remaining, 25);
    assert!(h.store.results().is_empty());

    let result = h.engine.end().await.unwrap();
    assert_eq!(result.total_movements, 1);
}

#[tokio::test]
async fn completed_attempt_can_be_followed_by_a_new_one() {
    let h = harness(vec![arm_exercise(60)]);
    h.engine.load_exercise("1").await.unwrap();
    h.engine.start().await.unwrap();
    h.source.send(90.0);
    wait_movements(&h.engine, 1).await;
    let first = h.engine.end().await.unwrap();

    let fresh = h.engine.load_exercise("1").await.unwrap();
    assert_eq!(fresh.state, SessionState::Preparation);
    assert_eq!(fresh.total_movements, 0);
    assert_eq!(fresh.score, 0);
    assert_ne!(fresh.attempt_id.as_deref(), Some(first.session_id.as_str()));
    assert!(h.engine.watch_completed().borrow().is_none());
}

#[tokio::test]
async fn engine_reports_stopped_when_actor_is_gone() {
    let (commands, _) = mpsc::channel(1);
    let (_, snapshot) = watch::channel(SessionSnapshot::default());
    let (_, feedback) = watch::channel(None);
    let (_, completed) = watch::channel(None);
    let engine = SessionEngine {
        commands,
        snapshot,
        feedback,
        completed,
    };
    assert_eq!(engine.start().await, Err(SessionError::EngineStopped));
}

/// Sink whose first write blocks its thread until the test opens the gate.
struct GatedSink {
    gate: Mutex<std_mpsc::Receiver<()>>,
    opened_in_time: AtomicBool,
    store: InMemoryResultStore,
}

impl ResultSink for GatedSink {
    fn save_result(&self, result: &ExerciseResult) -> Result<(), StorageError> {
        let opened = self
            .gate
            .lock()
            .unwrap()
            .recv_timeout(Duration::from_secs(5))
            .is_ok();
        self.opened_in_time.store(opened, Ordering::SeqCst);
        self.store.save_result(result)
    }

    fn update_session(&self, session: &Session) -> Result<(), StorageError> {
        self.store.update_session(session)
    }
}

#[tokio::test]
async fn slow_sink_does_not_stall_the_runtime() {
    let (open_gate, gate) = std_mpsc::channel();
    let sink = Arc::new(GatedSink {
        gate: Mutex::new(gate),
        opened_in_time: AtomicBool::new(false),
        store: InMemoryResultStore::new(),
    });
    let engine = SessionEngine::spawn(
        Arc::new(InMemoryCatalog::new(vec![arm_exercise(60)])),
        Arc::new(CuttableSource::new()),
        sink.clone(),
        EngineConfig::default(),
    );
    engine.load_exercise("1").await.unwrap();
    engine.start().await.unwrap();

    let ending = tokio::spawn({
        let engine = engine.clone();
        async move { engine.end().await }
    });

    // This timer only fires if the runtime thread is free while the sink blocks
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!ending.is_finished());

    open_gate.send(()).unwrap();
    let result = ending.await.unwrap().unwrap();
    assert!(sink.opened_in_time.load(Ordering::SeqCst));
    assert_eq!(sink.store.results(), vec![result]);
    assert_eq!(sink.store.sessions().len(), 1);
}

#[tokio::test]
async fn readings_lost_to_lag_are_left_out_of_the_result() {
    let h = harness(vec![arm_exercise(60)]);
    h.engine.load_exercise("1").await.unwrap();
    h.engine.start().await.unwrap();

    // The actor cannot run until this task yields, so the 64-slot
    // receiver overflows and keeps only the newest readings
    for _ in 0..100 {
        h.source.send(90.0);
    }
    wait_movements(&h.engine, 64).await;

    let result = h.engine.end().await.unwrap();
    assert_eq!(result.total_movements, 64);
    assert_eq!(result.sensor_data.len(), 64);
    assert_eq!(result.accuracy, 100.0);
}
