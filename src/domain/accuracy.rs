//! Movement accuracy scoring
//!
//! Pure functions used by the session engine for every reading processed
//! while an attempt is active.

use serde::{Deserialize, Serialize};

/// Angular error (degrees) at which accuracy reaches zero.
pub const MAX_ANGLE_DIFFERENCE: f32 = 90.0;

/// Readings strictly above this accuracy count as correct movements.
pub const CORRECT_THRESHOLD: f32 = 80.0;

/// Readings strictly above this (and not correct) get guidance feedback.
pub const GUIDANCE_THRESHOLD: f32 = 60.0;

/// Accuracy of `angle` against `target_angle`, in `[0, 100]`.
///
/// Evaluated as `100 - |angle - target| * 100 / 90` in f64, which is the same
/// line as `(90 - diff) / 90 * 100` but lands exactly on the 80/60 cutoffs.
pub fn accuracy(angle: f32, target_angle: f32) -> f32 {
    let difference = (f64::from(angle) - f64::from(target_angle)).abs();
    let score = 100.0 - difference * 100.0 / f64::from(MAX_ANGLE_DIFFERENCE);
    if score.is_nan() {
        return 0.0;
    }
    score.clamp(0.0, 100.0) as f32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedbackType {
    Correct,
    Guidance,
    Incorrect,
}

impl FeedbackType {
    pub fn classify(accuracy: f32) -> Self {
        if accuracy > CORRECT_THRESHOLD {
            Self::Correct
        } else if accuracy > GUIDANCE_THRESHOLD {
            Self::Guidance
        } else {
            Self::Incorrect
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::Correct => "Excellent! You are doing the movement correctly.",
            Self::Guidance => "Good! Try to be a little more precise.",
            Self::Incorrect => "Check your movement angle and follow the video guide.",
        }
    }
}

/// Transient, user-facing reaction to one reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    /// Increments per published feedback so expiry never clears a newer one
    pub sequence: u64,
    pub kind: FeedbackType,
    pub message: String,
    pub accuracy: f32,
}

impl Feedback {
    pub fn new(sequence: u64, accuracy: f32) -> Self {
        let kind = FeedbackType::classify(accuracy);
        Self {
            sequence,
            kind,
            message: kind.message().to_string(),
            accuracy,
        }
    }

    pub fn is_correct(&self) -> bool {
        self.kind == FeedbackType::Correct
    }
}

/// Running arithmetic mean; zero when nothing was accumulated.
pub fn mean_accuracy(sum: f64, count: u32) -> f32 {
    if count == 0 {
        return 0.0;
    }
    ((sum / count as f64) as f32).clamp(0.0, 100.0)
}

/// Exercise points plus one bonus point per full 10% of mean accuracy.
pub fn final_score(exercise_points: u32, mean_accuracy: f32) -> u32 {
    let bonus = (mean_accuracy.clamp(0.0, 100.0) / 10.0).floor() as u32;
    exercise_points + bonus
}
