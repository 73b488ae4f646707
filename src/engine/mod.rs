//! Exercise Session Engine
//!
//! Runs one timed attempt at a time. All accumulators live inside a single
//! actor task; commands, sensor readings, timer ticks and feedback expiry are
//! serialised through one `select!` loop, so nothing else ever mutates an
//! attempt.
//!
//! ```text
//!  SessionEngine (handle) ──cmd + oneshot──▶ ┌──────────────┐ ──▶ ResultSink
//!  ReadingSource ─────────broadcast────────▶ │ EngineActor  │ ──▶ watch: snapshot
//!  tick / feedback deadlines ──────────────▶ └──────────────┘ ──▶ watch: feedback
//! ```

use crate::domain::accuracy::{self, Feedback};
use crate::domain::exercise::ExerciseCatalog;
use crate::domain::models::MotionReading;
use crate::domain::session::{
    ExerciseAttemptState, ExerciseResult, Session, SessionSnapshot, SessionState,
};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::DeviceLink;
use crate::infrastructure::storage::ResultSink;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("exercise {0} not found")]
    UnknownExercise(String),
    #[error("no exercise loaded")]
    NoExerciseLoaded,
    #[error("cannot {operation} while {state:?}")]
    InvalidTransition {
        operation: &'static str,
        state: SessionState,
    },
    #[error("session engine stopped")]
    EngineStopped,
}

/// Supplies the motion readings an attempt consumes.
///
/// Receivers are bounded. An attempt that falls more than the source's buffer
/// behind skips the oldest readings; skipped readings are logged with their
/// count and are not part of the mean or the movement counts. [`DeviceLink`]
/// buffers `LinkConfig::reading_buffer` readings per receiver.
pub trait ReadingSource: Send + Sync {
    /// Receiver for every reading produced after this call.
    fn subscribe_readings(&self) -> broadcast::Receiver<MotionReading>;
}

impl ReadingSource for DeviceLink {
    fn subscribe_readings(&self) -> broadcast::Receiver<MotionReading> {
        DeviceLink::subscribe_readings(self)
    }
}

impl ReadingSource for broadcast::Sender<MotionReading> {
    fn subscribe_readings(&self) -> broadcast::Receiver<MotionReading> {
        self.subscribe()
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub user_id: String,
    /// Countdown granularity; one tick removes one second of remaining time
    pub tick_interval: Duration,
    /// How long a feedback stays visible unless superseded
    pub feedback_clear: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_id: "user1".to_string(),
            tick_interval: Duration::from_secs(1),
            feedback_clear: Duration::from_millis(3000),
        }
    }
}

impl EngineConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            user_id: settings.user_id.clone(),
            tick_interval: Duration::from_millis(settings.tick_interval_ms.max(1)),
            feedback_clear: Duration::from_millis(settings.feedback_clear_ms),
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum Command {
    Load {
        exercise_id: String,
        reply: Reply<SessionSnapshot>,
    },
    Start(Reply<SessionSnapshot>),
    Pause(Reply<SessionSnapshot>),
    Resume(Reply<SessionSnapshot>),
    End(Reply<ExerciseResult>),
}

/// Handle to the engine actor. Clones share the same attempt; the actor
/// stops once every handle is dropped.
#[derive(Clone)]
pub struct SessionEngine {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
    feedback: watch::Receiver<Option<Feedback>>,
    completed: watch::Receiver<Option<ExerciseResult>>,
}

impl SessionEngine {
    /// Spawn the actor on the current tokio runtime.
    pub fn spawn(
        catalog: Arc<dyn ExerciseCatalog>,
        source: Arc<dyn ReadingSource>,
        sink: Arc<dyn ResultSink>,
        config: EngineConfig,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (snapshot_tx, snapshot) = watch::channel(SessionSnapshot::default());
        let (feedback_tx, feedback) = watch::channel(None);
        let (completed_tx, completed) = watch::channel(None);

        let actor = EngineActor {
            catalog,
            source,
            sink,
            config,
            attempt: None,
            readings: None,
            next_tick: None,
            paused_tick_left: None,
            feedback_deadline: None,
            feedback_sequence: 0,
            snapshot_tx,
            feedback_tx,
            completed_tx,
        };
        tokio::spawn(actor.run(commands_rx));

        Self {
            commands: commands_tx,
            snapshot,
            feedback,
            completed,
        }
    }

    /// Load an exercise and reset the accumulators for a new attempt.
    pub async fn load_exercise(&self, exercise_id: &str) -> Result<SessionSnapshot, SessionError> {
        let exercise_id = exercise_id.to_string();
        self.request(|reply| Command::Load { exercise_id, reply }).await
    }

    pub async fn start(&self) -> Result<SessionSnapshot, SessionError> {
        self.request(Command::Start).await
    }

    pub async fn pause(&self) -> Result<SessionSnapshot, SessionError> {
        self.request(Command::Pause).await
    }

    pub async fn resume(&self) -> Result<SessionSnapshot, SessionError> {
        self.request(Command::Resume).await
    }

    /// Finish the attempt and persist its result. Only the first call for an
    /// attempt succeeds.
    pub async fn end(&self) -> Result<ExerciseResult, SessionError> {
        self.request(Command::End).await
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub fn watch_feedback(&self) -> watch::Receiver<Option<Feedback>> {
        self.feedback.clone()
    }

    /// Result of the most recently completed attempt, whether it ended by
    /// command or by the timer.
    pub fn watch_completed(&self) -> watch::Receiver<Option<ExerciseResult>> {
        self.completed.clone()
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SessionError::EngineStopped)?;
        response.await.map_err(|_| SessionError::EngineStopped)?
    }
}

enum Wake {
    Reading(Result<MotionReading, RecvError>),
    Tick,
    Command(Option<Command>),
    FeedbackExpired(u64),
}

struct EngineActor {
    catalog: Arc<dyn ExerciseCatalog>,
    source: Arc<dyn ReadingSource>,
    sink: Arc<dyn ResultSink>,
    config: EngineConfig,

    attempt: Option<ExerciseAttemptState>,
    readings: Option<broadcast::Receiver<MotionReading>>,
    next_tick: Option<Instant>,
    /// Unelapsed part of the tick interrupted by a pause
    paused_tick_left: Option<Duration>,
    feedback_deadline: Option<(Instant, u64)>,
    feedback_sequence: u64,

    snapshot_tx: watch::Sender<SessionSnapshot>,
    feedback_tx: watch::Sender<Option<Feedback>>,
    completed_tx: watch::Sender<Option<ExerciseResult>>,
}

impl EngineActor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        debug!("Session engine started");
        loop {
            // Readings queued before a command are scored before it runs
            let wake = tokio::select! {
                biased;
                reading = next_reading(&mut self.readings) => Wake::Reading(reading),
                _ = sleep_until_some(self.next_tick) => Wake::Tick,
                command = commands.recv() => Wake::Command(command),
                sequence = expire_at(self.feedback_deadline) => Wake::FeedbackExpired(sequence),
            };

            match wake {
                Wake::Reading(Ok(reading)) => self.on_reading(reading),
                Wake::Reading(Err(RecvError::Lagged(skipped))) => {
                    warn!("Scoring fell behind, {} readings skipped and not scored", skipped);
                }
                Wake::Reading(Err(RecvError::Closed)) => {
                    // The attempt keeps running; only feedback stops
                    warn!("Reading stream closed");
                    self.readings = None;
                }
                Wake::Tick => self.on_tick().await,
                Wake::Command(Some(command)) => self.on_command(command).await,
                Wake::Command(None) => break,
                Wake::FeedbackExpired(sequence) => self.on_feedback_expired(sequence),
            }
        }
        debug!("Session engine stopped");
    }

    async fn on_command(&mut self, command: Command) {
        // Dropped receivers only mean the caller stopped waiting
        match command {
            Command::Load { exercise_id, reply } => {
                let _ = reply.send(self.load(&exercise_id));
            }
            Command::Start(reply) => {
                let _ = reply.send(self.start().await);
            }
            Command::Pause(reply) => {
                let _ = reply.send(self.pause());
            }
            Command::Resume(reply) => {
                let _ = reply.send(self.resume());
            }
            Command::End(reply) => {
                let _ = reply.send(self.end().await);
            }
        }
    }

    fn load(&mut self, exercise_id: &str) -> Result<SessionSnapshot, SessionError> {
        if let Some(attempt) = &self.attempt {
            if matches!(attempt.state, SessionState::Active | SessionState::Paused) {
                return Err(SessionError::InvalidTransition {
                    operation: "load",
                    state: attempt.state,
                });
            }
        }

        self.feedback_tx.send_replace(None);
        self.completed_tx.send_replace(None);

        let Some(exercise) = self.catalog.get_exercise_by_id(exercise_id) else {
            warn!("Exercise {} not found", exercise_id);
            self.attempt = None;
            self.publish();
            return Err(SessionError::UnknownExercise(exercise_id.to_string()));
        };

        info!("Loaded exercise {} ({})", exercise.id, exercise.name);
        self.attempt = Some(ExerciseAttemptState::new(Uuid::new_v4().to_string(), exercise));
        Ok(self.publish())
    }

    async fn start(&mut self) -> Result<SessionSnapshot, SessionError> {
        let attempt = self.attempt.as_mut().ok_or(SessionError::NoExerciseLoaded)?;
        if attempt.state != SessionState::Preparation {
            return Err(SessionError::InvalidTransition {
                operation: "start",
                state: attempt.state,
            });
        }

        attempt.state = SessionState::Active;
        attempt.started_at = Some(Utc::now());
        info!(
            "Attempt {} started: {} for {}s",
            attempt.attempt_id, attempt.exercise.name, attempt.exercise.duration
        );
        let nothing_to_count = attempt.time_remaining == 0;

        self.readings = Some(self.source.subscribe_readings());
        self.next_tick = Some(Instant::now() + self.config.tick_interval);

        if nothing_to_count {
            self.finish().await;
        }
        Ok(self.publish())
    }

    fn pause(&mut self) -> Result<SessionSnapshot, SessionError> {
        let attempt = self.attempt.as_mut().ok_or(SessionError::NoExerciseLoaded)?;
        if attempt.state != SessionState::Active {
            return Err(SessionError::InvalidTransition {
                operation: "pause",
                state: attempt.state,
            });
        }

        attempt.state = SessionState::Paused;
        let now = Instant::now();
        self.paused_tick_left = self
            .next_tick
            .take()
            .map(|deadline| deadline.saturating_duration_since(now));
        info!("Attempt paused with {}s remaining", attempt.time_remaining);
        Ok(self.publish())
    }

    fn resume(&mut self) -> Result<SessionSnapshot, SessionError> {
        let attempt = self.attempt.as_mut().ok_or(SessionError::NoExerciseLoaded)?;
        if attempt.state != SessionState::Paused {
            return Err(SessionError::InvalidTransition {
                operation: "resume",
                state: attempt.state,
            });
        }

        attempt.state = SessionState::Active;
        let left = self
            .paused_tick_left
            .take()
            .unwrap_or(self.config.tick_interval);
        self.next_tick = Some(Instant::now() + left);
        info!("Attempt resumed with {}s remaining", attempt.time_remaining);
        Ok(self.publish())
    }

    async fn end(&mut self) -> Result<ExerciseResult, SessionError> {
        let attempt = self.attempt.as_ref().ok_or(SessionError::NoExerciseLoaded)?;
        if !matches!(attempt.state, SessionState::Active | SessionState::Paused) {
            return Err(SessionError::InvalidTransition {
                operation: "end",
                state: attempt.state,
            });
        }
        let result = self.finish().await.ok_or(SessionError::NoExerciseLoaded)?;
        self.publish();
        Ok(result)
    }

    fn on_reading(&mut self, reading: MotionReading) {
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        if attempt.state != SessionState::Active {
            return;
        }

        self.feedback_sequence += 1;
        let feedback = attempt.record_reading(reading, self.feedback_sequence);
        debug!(
            angle = reading.angle,
            accuracy = feedback.accuracy,
            "Reading scored as {:?}",
            feedback.kind
        );

        self.feedback_deadline = Some((
            Instant::now() + self.config.feedback_clear,
            feedback.sequence,
        ));
        self.feedback_tx.send_replace(Some(feedback));
        self.publish();
    }

    async fn on_tick(&mut self) {
        let Some(deadline) = self.next_tick.take() else {
            return;
        };
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        if attempt.state != SessionState::Active {
            return;
        }

        attempt.time_remaining = attempt.time_remaining.saturating_sub(1);
        attempt.ticks += 1;

        if attempt.time_remaining == 0 {
            info!("Time is up after {} ticks", attempt.ticks);
            self.finish().await;
        } else {
            self.next_tick = Some(deadline + self.config.tick_interval);
        }
        self.publish();
    }

    fn on_feedback_expired(&mut self, sequence: u64) {
        self.feedback_deadline = None;
        self.feedback_tx.send_if_modified(|current| {
            let expired = current.as_ref().is_some_and(|f| f.sequence == sequence);
            if expired {
                *current = None;
            }
            expired
        });
    }

    /// Move the attempt to COMPLETED, stop every pending activity and hand
    /// the result to the sink.
    ///
    /// Sinks may do blocking I/O, so they run on the blocking pool. The actor
    /// waits for them before announcing completion.
    async fn finish(&mut self) -> Option<ExerciseResult> {
        let attempt = self.attempt.as_mut()?;

        attempt.state = SessionState::Completed;
        self.readings = None;
        self.next_tick = None;
        self.paused_tick_left = None;
        self.feedback_deadline = None;
        self.feedback_tx.send_replace(None);

        let mean = attempt.mean_accuracy();
        attempt.score = accuracy::final_score(attempt.exercise.points, mean);
        let ended_at = Utc::now();

        let result = ExerciseResult {
            id: Uuid::new_v4().to_string(),
            session_id: attempt.attempt_id.clone(),
            exercise_id: attempt.exercise.id.clone(),
            score: attempt.score,
            accuracy: mean,
            duration: attempt.actual_duration(),
            correct_movements: attempt.correct_movements,
            total_movements: attempt.total_movements,
            sensor_data: std::mem::take(&mut attempt.readings),
        };
        let session = Session {
            id: attempt.attempt_id.clone(),
            user_id: self.config.user_id.clone(),
            exercise_ids: vec![attempt.exercise.id.clone()],
            start_time: attempt.started_at.unwrap_or(ended_at),
            end_time: Some(ended_at),
            total_score: result.score,
            accuracy: mean,
            completed_exercises: 1,
            is_completed: true,
        };

        info!(
            "Attempt {} completed: score {}, accuracy {:.1}%, {}/{} correct",
            attempt.attempt_id, result.score, mean, result.correct_movements, result.total_movements
        );

        let sink = Arc::clone(&self.sink);
        let record = result.clone();
        let persisted = tokio::task::spawn_blocking(move || {
            if let Err(e) = sink.save_result(&record) {
                error!("Failed to save result {}: {}", record.id, e);
            }
            if let Err(e) = sink.update_session(&session) {
                error!("Failed to update session {}: {}", session.id, e);
            }
        })
        .await;
        if let Err(e) = persisted {
            error!("Result persistence task failed: {}", e);
        }

        self.completed_tx.send_replace(Some(result.clone()));
        Some(result)
    }

    fn publish(&self) -> SessionSnapshot {
        let snapshot = self
            .attempt
            .as_ref()
            .map(SessionSnapshot::from_attempt)
            .unwrap_or_default();
        self.snapshot_tx.send_replace(snapshot.clone());
        snapshot
    }
}

async fn next_reading(
    readings: &mut Option<broadcast::Receiver<MotionReading>>,
) -> Result<MotionReading, RecvError> {
    match readings {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn expire_at(deadline: Option<(Instant, u64)>) -> u64 {
    match deadline {
        Some((at, sequence)) => {
            sleep_until(at).await;
            sequence
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests;
