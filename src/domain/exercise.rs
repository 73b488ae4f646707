//! Exercise Catalog
//!
//! Static exercise definitions read by the session engine. The catalog is
//! seeded once and never mutated by the core.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExerciseDifficulty {
    Beginner,
    Intermediate,
    Advanced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BodyPart {
    Arm,
    Leg,
    Shoulder,
    Back,
    Neck,
    Knee,
    Ankle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementType {
    Flexion,
    Extension,
    Rotation,
    Abduction,
    Adduction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Exercise {
    pub id: String,
    pub name: String,
    pub description: String,
    pub video_url: String,
    pub thumbnail_url: String,
    /// Nominal duration in seconds
    pub duration: u32,
    pub difficulty: ExerciseDifficulty,
    pub body_part: BodyPart,
    pub instructions: Vec<String>,
    /// Reference angle in degrees used for accuracy scoring
    pub target_angle: Option<f32>,
    pub target_movement: MovementType,
    pub points: u32,
}

/// Lookup used by the session engine.
pub trait ExerciseCatalog: Send + Sync {
    fn get_exercise_by_id(&self, id: &str) -> Option<Exercise>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    exercises: BTreeMap<String, Exercise>,
}

impl InMemoryCatalog {
    pub fn new(exercises: impl IntoIterator<Item = Exercise>) -> Self {
        Self {
            exercises: exercises.into_iter().map(|e| (e.id.clone(), e)).collect(),
        }
    }

    /// Catalog with the default exercise set.
    pub fn seeded() -> Self {
        Self::new(default_exercises())
    }

    pub fn all(&self) -> impl Iterator<Item = &Exercise> {
        self.exercises.values()
    }

    /// Filter by body part and/or difficulty; `None` matches everything.
    pub fn filter(
        &self,
        body_part: Option<BodyPart>,
        difficulty: Option<ExerciseDifficulty>,
    ) -> Vec<Exercise> {
        self.exercises
            .values()
            .filter(|e| body_part.map_or(true, |b| e.body_part == b))
            .filter(|e| difficulty.map_or(true, |d| e.difficulty == d))
            .cloned()
            .collect()
    }
}

impl ExerciseCatalog for InMemoryCatalog {
    fn get_exercise_by_id(&self, id: &str) -> Option<Exercise> {
        self.exercises.get(id).cloned()
    }
}

#[allow(clippy::too_many_arguments)]
fn exercise(
    id: &str,
    name: &str,
    description: &str,
    media: &str,
    duration: u32,
    difficulty: ExerciseDifficulty,
    body_part: BodyPart,
    instructions: &[&str],
    target_angle: f32,
    target_movement: MovementType,
    points: u32,
) -> Exercise {
    Exercise {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        video_url: format!("media/video/{media}.mp4"),
        thumbnail_url: format!("media/thumb/{media}.jpg"),
        duration,
        difficulty,
        body_part,
        instructions: instructions.iter().map(|s| s.to_string()).collect(),
        target_angle: Some(target_angle),
        target_movement,
        points,
    }
}

pub fn default_exercises() -> Vec<Exercise> {
    use BodyPart::*;
    use ExerciseDifficulty::*;
    use MovementType::*;

    vec![
        exercise(
            "1",
            "Arm Flexion",
            "Raise your arm and lower it again",
            "arm_flexion",
            120,
            Beginner,
            Arm,
            &[
                "Keep your arm at your side",
                "Raise it slowly",
                "Stop when it reaches 90 degrees",
                "Return slowly to the starting position",
            ],
            90.0,
            Flexion,
            15,
        ),
        exercise(
            "2",
            "Leg Extension",
            "Extend your leg until it is straight",
            "leg_extension",
            180,
            Intermediate,
            Leg,
            &[
                "Sit on a chair",
                "Extend your leg slowly",
                "Hold full extension for 2 seconds",
                "Lower it slowly",
            ],
            0.0,
            Extension,
            20,
        ),
        exercise(
            "3",
            "Shoulder Rotation",
            "Rotate your shoulder in a circular motion",
            "shoulder_rotation",
            90,
            Beginner,
            Shoulder,
            &[
                "Stand upright",
                "Keep your arms at your sides",
                "Roll your shoulders slowly backwards",
                "Do 10 repetitions",
            ],
            180.0,
            Rotation,
            12,
        ),
        exercise(
            "4",
            "Knee Flexion",
            "Bend your knee to gain flexibility",
            "knee_flexion",
            150,
            Intermediate,
            Knee,
            &[
                "Lie face down",
                "Bend your knee bringing the heel towards the hip",
                "Hold the maximum bend for 3 seconds",
                "Return slowly to the starting position",
            ],
            120.0,
            Flexion,
            18,
        ),
        exercise(
            "5",
            "Ankle Rotation",
            "Rotate your ankle in a circular motion",
            "ankle_rotation",
            60,
            Beginner,
            Ankle,
            &[
                "Sit and extend your leg",
                "Rotate your ankle clockwise",
                "10 repetitions clockwise",
                "10 repetitions counter-clockwise",
            ],
            360.0,
            Rotation,
            10,
        ),
        exercise(
            "6",
            "Advanced Arm Exercise",
            "A combination of complex arm movements",
            "advanced_arm",
            240,
            Advanced,
            Arm,
            &[
                "This exercise is for experienced users",
                "Move your arm through different angles",
                "Hold each position for 5 seconds",
                "Move slowly and with control",
            ],
            135.0,
            Abduction,
            30,
        ),
    ]
}
