//! Result persistence
//!
//! Completed attempts leave through [`ResultSink`]. The store behind it is
//! external to the engine; two implementations ship here.

use crate::domain::session::{ExerciseResult, Session};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("result {0} was already saved")]
    Duplicate(String),
}

/// Write-once destination for completed attempts.
pub trait ResultSink: Send + Sync {
    fn save_result(&self, result: &ExerciseResult) -> Result<(), StorageError>;

    fn update_session(&self, session: &Session) -> Result<(), StorageError>;
}

#[derive(Default)]
struct Records {
    results: Vec<ExerciseResult>,
    sessions: Vec<Session>,
}

/// Keeps everything in memory. Used by tests and the demo runner when no
/// data directory is wanted.
#[derive(Default)]
pub struct InMemoryResultStore {
    records: Mutex<Records>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<ExerciseResult> {
        self.records().results.clone()
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.records().sessions.clone()
    }

    fn records(&self) -> MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ResultSink for InMemoryResultStore {
    fn save_result(&self, result: &ExerciseResult) -> Result<(), StorageError> {
        let mut records = self.records();
        if records.results.iter().any(|r| r.id == result.id) {
            return Err(StorageError::Duplicate(result.id.clone()));
        }
        records.results.push(result.clone());
        Ok(())
    }

    fn update_session(&self, session: &Session) -> Result<(), StorageError> {
        let mut records = self.records();
        match records.sessions.iter_mut().find(|s| s.id == session.id) {
            Some(existing) => *existing = session.clone(),
            None => records.sessions.push(session.clone()),
        }
        Ok(())
    }
}

/// One pretty-printed JSON file per record:
///
/// ```text
/// <root>/results/<result id>.json
/// <root>/sessions/<session id>.json
/// ```
pub struct JsonFileResultStore {
    root: PathBuf,
}

impl JsonFileResultStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        for dir in [root.join("results"), root.join("sessions")] {
            fs::create_dir_all(&dir).map_err(|source| StorageError::Io { path: dir, source })?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn load_results(&self) -> Result<Vec<ExerciseResult>, StorageError> {
        load_dir(&self.root.join("results"))
    }

    pub fn load_sessions(&self) -> Result<Vec<Session>, StorageError> {
        load_dir(&self.root.join("sessions"))
    }

    fn record_path(&self, kind: &str, id: &str) -> PathBuf {
        // Ids are generated uuids; strip anything that could escape the directory
        let file: String = id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        self.root.join(kind).join(format!("{file}.json"))
    }
}

impl ResultSink for JsonFileResultStore {
    fn save_result(&self, result: &ExerciseResult) -> Result<(), StorageError> {
        let path = self.record_path("results", &result.id);
        if path.exists() {
            return Err(StorageError::Duplicate(result.id.clone()));
        }
        write_json(&path, result)?;
        debug!("Saved result {} to {}", result.id, path.display());
        Ok(())
    }

    fn update_session(&self, session: &Session) -> Result<(), StorageError> {
        let path = self.record_path("sessions", &session.id);
        write_json(&path, session)?;
        debug!("Saved session {} to {}", session.id, path.display());
        Ok(())
    }
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json).map_err(|source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn load_dir<T: serde::de::DeserializeOwned>(dir: &Path) -> Result<Vec<T>, StorageError> {
    let io_err = |source| StorageError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut records = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let contents = fs::read_to_string(&path).map_err(|source| StorageError::Io {
            path: path.clone(),
            source,
        })?;
        records.push(serde_json::from_str(&contents)?);
    }
    Ok(records)
}
