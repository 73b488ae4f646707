use crate::domain::accuracy::{self, Feedback};
use crate::domain::exercise::Exercise;
use crate::domain::models::MotionReading;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Score added to the live score for each correct reading.
pub const SCORE_PER_CORRECT_READING: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    #[default]
    Preparation,
    Active,
    Paused,
    Completed,
}

/// Working record of one in-progress attempt. Owned by the engine actor.
#[derive(Debug, Clone)]
pub struct ExerciseAttemptState {
    pub attempt_id: String,
    pub exercise: Exercise,
    pub state: SessionState,
    pub score: u32,
    pub accuracy_sum: f64,
    pub accuracy_count: u32,
    pub correct_movements: u32,
    pub total_movements: u32,
    pub readings: Vec<MotionReading>,
    pub time_remaining: u32,
    pub ticks: u32,
    pub started_at: Option<DateTime<Utc>>,
}

impl ExerciseAttemptState {
    pub fn new(attempt_id: String, exercise: Exercise) -> Self {
        let time_remaining = exercise.duration;
        Self {
            attempt_id,
            exercise,
            state: SessionState::Preparation,
            score: 0,
            accuracy_sum: 0.0,
            accuracy_count: 0,
            correct_movements: 0,
            total_movements: 0,
            readings: Vec::new(),
            time_remaining,
            ticks: 0,
            started_at: None,
        }
    }

    pub fn target_angle(&self) -> f32 {
        self.exercise.target_angle.unwrap_or(0.0)
    }

    /// Score one reading and fold it into the accumulators.
    pub fn record_reading(&mut self, reading: MotionReading, sequence: u64) -> Feedback {
        let accuracy = accuracy::accuracy(reading.angle, self.target_angle());
        let feedback = Feedback::new(sequence, accuracy);

        self.accuracy_sum += f64::from(accuracy);
        self.accuracy_count += 1;
        self.total_movements += 1;
        if feedback.is_correct() {
            self.correct_movements += 1;
            self.score += SCORE_PER_CORRECT_READING;
        }
        self.readings.push(reading);

        feedback
    }

    pub fn mean_accuracy(&self) -> f32 {
        accuracy::mean_accuracy(self.accuracy_sum, self.accuracy_count)
    }

    /// Fraction of the nominal duration already elapsed.
    pub fn progress(&self) -> f32 {
        if self.exercise.duration == 0 {
            return 1.0;
        }
        let elapsed = self.exercise.duration.saturating_sub(self.time_remaining);
        elapsed as f32 / self.exercise.duration as f32
    }

    pub fn actual_duration(&self) -> u32 {
        self.exercise.duration.saturating_sub(self.time_remaining)
    }
}

/// Finalized, write-once snapshot of a completed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExerciseResult {
    pub id: String,
    pub session_id: String,
    pub exercise_id: String,
    pub score: u32,
    pub accuracy: f32,
    /// Actual duration in seconds
    pub duration: u32,
    pub correct_movements: u32,
    pub total_movements: u32,
    pub sensor_data: Vec<MotionReading>,
}

/// Session completion record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub exercise_ids: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_score: u32,
    pub accuracy: f32,
    pub completed_exercises: u32,
    pub is_completed: bool,
}

/// Read-only view of the engine published after every change.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub attempt_id: Option<String>,
    pub exercise_id: Option<String>,
    pub state: SessionState,
    pub score: u32,
    pub mean_accuracy: f32,
    pub correct_movements: u32,
    pub total_movements: u32,
    pub time_remaining: u32,
    pub progress: f32,
}

impl SessionSnapshot {
    pub fn from_attempt(attempt: &ExerciseAttemptState) -> Self {
        Self {
            attempt_id: Some(attempt.attempt_id.clone()),
            exercise_id: Some(attempt.exercise.id.clone()),
            state: attempt.state,
            score: attempt.score,
            mean_accuracy: attempt.mean_accuracy(),
            correct_movements: attempt.correct_movements,
            total_movements: attempt.total_movements,
            time_remaining: attempt.time_remaining,
            progress: attempt.progress(),
        }
    }
}
