//! User Progress
//!
//! Gamification rules applied to completed attempts: point totals, levels
//! and achievement unlocks.

use crate::domain::session::{ExerciseResult, Session};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const POINTS_PER_LEVEL: u32 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AchievementType {
    Points,
    Sessions,
    Exercises,
    Accuracy,
    Streak,
    Special,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Achievement {
    pub id: String,
    pub title: String,
    pub description: String,
    /// Threshold in the unit of `kind` (points, sessions, percent, days...)
    pub points_required: u32,
    pub kind: AchievementType,
    pub unlocked_at: Option<DateTime<Utc>>,
}

impl Achievement {
    pub fn new(id: &str, title: &str, description: &str, points_required: u32, kind: AchievementType) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            points_required,
            kind,
            unlocked_at: None,
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked_at.is_some()
    }

    fn is_met_by(&self, progress: &UserProgress) -> bool {
        let threshold = self.points_required;
        match self.kind {
            AchievementType::Points => progress.total_points >= threshold,
            AchievementType::Sessions => progress.total_sessions >= threshold,
            AchievementType::Exercises => progress.total_exercises >= threshold,
            AchievementType::Accuracy => {
                progress.total_exercises > 0 && progress.average_accuracy >= threshold as f32
            }
            AchievementType::Streak => progress.current_streak_days >= threshold,
            // Awarded manually
            AchievementType::Special => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProgress {
    pub total_points: u32,
    pub total_sessions: u32,
    pub total_exercises: u32,
    pub average_accuracy: f32,
    pub current_streak_days: u32,
    pub last_active_day: Option<NaiveDate>,
}

impl UserProgress {
    /// Fold one completed attempt into the totals.
    pub fn record(&mut self, result: &ExerciseResult, session: &Session) {
        let previous = self.total_exercises as f32;
        self.total_exercises += 1;
        self.average_accuracy =
            (self.average_accuracy * previous + result.accuracy) / self.total_exercises as f32;
        self.total_points += result.score;
        if session.is_completed {
            self.total_sessions += 1;
        }

        let day = session.end_time.unwrap_or(session.start_time).date_naive();
        self.record_active_day(day);
    }

    fn record_active_day(&mut self, day: NaiveDate) {
        self.current_streak_days = match self.last_active_day {
            Some(last) if last == day => self.current_streak_days.max(1),
            Some(last) if last.succ_opt() == Some(day) => self.current_streak_days + 1,
            Some(last) if last > day => return,
            _ => 1,
        };
        self.last_active_day = Some(day);
    }

    pub fn level(&self) -> u32 {
        self.total_points / POINTS_PER_LEVEL + 1
    }

    pub fn points_to_next_level(&self) -> u32 {
        POINTS_PER_LEVEL - self.total_points % POINTS_PER_LEVEL
    }

    pub fn level_progress(&self) -> f32 {
        (self.total_points % POINTS_PER_LEVEL) as f32 / POINTS_PER_LEVEL as f32
    }

    /// Unlock every achievement whose threshold is now met. Returns the ids
    /// that were unlocked by this call.
    pub fn evaluate(&self, achievements: &mut [Achievement], now: DateTime<Utc>) -> Vec<String> {
        let mut unlocked = Vec::new();
        for achievement in achievements.iter_mut().filter(|a| !a.is_unlocked()) {
            if achievement.is_met_by(self) {
                achievement.unlocked_at = Some(now);
                unlocked.push(achievement.id.clone());
            }
        }
        unlocked
    }
}

pub fn default_achievements() -> Vec<Achievement> {
    use AchievementType::*;
    vec![
        Achievement::new("first_session", "First Step", "Complete your first exercise session", 1, Sessions),
        Achievement::new("point_collector", "Point Collector", "Collect 100 points", 100, Points),
        Achievement::new("consistency_master", "Consistency Master", "Complete 10 exercise sessions", 10, Sessions),
        Achievement::new("accuracy_expert", "Accuracy Expert", "Reach 90% accuracy", 90, Accuracy),
        Achievement::new("exercise_enthusiast", "Exercise Enthusiast", "Do 50 exercises", 50, Exercises),
        Achievement::new("point_master", "Point Master", "Collect 1000 points", 1000, Points),
        Achievement::new("dedication_champion", "Dedication Champion", "Exercise 30 days in a row", 30, Streak),
        Achievement::new("perfectionist", "Perfectionist", "Reach 95% accuracy", 95, Accuracy),
        Achievement::new("marathon_runner", "Marathon Runner", "Complete 100 exercise sessions", 100, Sessions),
        Achievement::new("legend", "Legend", "Complete every exercise with perfect accuracy", 100, Special),
    ]
}
