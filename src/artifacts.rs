use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::error::MillResult;
use crate::stats::AnalysisTimes;

/// File names of the side-channel documents exchanged with externally
/// launched processes. They live in the root of each job's directory.
pub const FINISHED_FILE: &str = "seqmill_finished.json";
pub const PROGRESS_FILE: &str = "seqmill_progress.json";
pub const ABORT_FILE: &str = "seqmill_abort";

// --- Document types ---

/// Terminal report written by a unit process when it exits.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FinishedArtifact {
    /// Terminal status text ("completed", "error" or "canceled").
    pub status: String,
    pub start_date: String,
    pub end_date: String,
    pub elapsed_secs: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub times: Option<AnalysisTimes>,
}

/// Progress report periodically refreshed by a unit process.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ProgressArtifact {
    pub completed_tasks: u32,
    pub total_tasks: u32,
    pub percent: u32,
    pub report_date: String,
}

/// Exit report of a single task phase (execution or parsing), written by
/// the external launcher next to the task's working directory.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TaskAbstract {
    /// "completed", "error" or "skip".
    pub exit_status: String,
    #[serde(default)]
    pub need_parsing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_time_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub real_time_secs: Option<f64>,
}

impl TaskAbstract {
    pub fn is_error(&self) -> bool {
        self.exit_status.eq_ignore_ascii_case("error")
    }

    pub fn is_skip(&self) -> bool {
        self.exit_status.eq_ignore_ascii_case("skip")
    }
}

/// Parsed abort sentinel. The file's mere presence requests a cascade
/// abort; a first line of `kill=yes` escalates to forced kill.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AbortRequest {
    pub kill: bool,
}

// --- Read outcomes ---

/// Result of polling one artifact. A missing, empty or too-recent file is
/// "not ready", never an error; only a present-but-unparseable document is
/// malformed.
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactState<T> {
    NotReady,
    Ready(T),
    Malformed(String),
}

impl<T> ArtifactState<T> {
    pub fn ready(self) -> Option<T> {
        match self {
            ArtifactState::Ready(value) => Some(value),
            _ => None,
        }
    }
}

// --- Reader port ---

/// Read side of the artifact protocol. The scheduler only ever observes
/// externally produced state through this trait, so tests can substitute
/// an in-memory double.
pub trait ArtifactReader {
    fn read_finished(&self, job_dir: &Path) -> ArtifactState<FinishedArtifact>;
    fn read_progress(&self, job_dir: &Path) -> ArtifactState<ProgressArtifact>;
    fn read_task_abstract(&self, path: &Path) -> ArtifactState<TaskAbstract>;
    fn read_abort(&self, dir: &Path) -> Option<AbortRequest>;
    fn dir_exists(&self, path: &Path) -> bool;
}

/// Production reader backed by the filesystem, with a debounce window
/// guarding against partially written documents.
pub struct FsArtifactReader {
    debounce: Duration,
}

impl FsArtifactReader {
    pub fn new(debounce_secs: u64) -> Self {
        Self {
            debounce: Duration::from_secs(debounce_secs),
        }
    }

    /// A file is trustworthy once it exists, has content, and has not been
    /// modified within the debounce window.
    fn is_settled(&self, path: &Path) -> bool {
        let metadata = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(_) => return false,
        };
        if metadata.len() == 0 {
            return false;
        }
        match metadata.modified() {
            Ok(mtime) => match SystemTime::now().duration_since(mtime) {
                Ok(age) => age >= self.debounce,
                Err(_) => false,
            },
            Err(_) => false,
        }
    }

    fn read_settled<T: serde::de::DeserializeOwned>(&self, path: &Path) -> ArtifactState<T> {
        if !self.is_settled(path) {
            return ArtifactState::NotReady;
        }
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => return ArtifactState::NotReady,
        };
        match serde_json::from_str(&contents) {
            Ok(value) => ArtifactState::Ready(value),
            Err(e) => ArtifactState::Malformed(format!(
                "{} is not a valid artifact document: {}",
                path.display(),
                e
            )),
        }
    }
}

impl ArtifactReader for FsArtifactReader {
    fn read_finished(&self, job_dir: &Path) -> ArtifactState<FinishedArtifact> {
        self.read_settled(&job_dir.join(FINISHED_FILE))
    }

    fn read_progress(&self, job_dir: &Path) -> ArtifactState<ProgressArtifact> {
        self.read_settled(&job_dir.join(PROGRESS_FILE))
    }

    fn read_task_abstract(&self, path: &Path) -> ArtifactState<TaskAbstract> {
        self.read_settled(path)
    }

    fn read_abort(&self, dir: &Path) -> Option<AbortRequest> {
        let path = dir.join(ABORT_FILE);
        if !path.is_file() {
            return None;
        }
        let first_line = std::fs::read_to_string(&path)
            .ok()
            .and_then(|c| c.lines().next().map(|l| l.trim().to_lowercase()));
        Some(AbortRequest {
            kill: first_line.as_deref() == Some("kill=yes"),
        })
    }

    fn dir_exists(&self, path: &Path) -> bool {
        path.is_dir()
    }
}

// --- Writers ---

pub fn write_finished(job_dir: &Path, artifact: &FinishedArtifact) -> MillResult<()> {
    let contents = serde_json::to_string_pretty(artifact)?;
    std::fs::write(job_dir.join(FINISHED_FILE), contents)?;
    Ok(())
}

pub fn write_progress(job_dir: &Path, artifact: &ProgressArtifact) -> MillResult<()> {
    let contents = serde_json::to_string_pretty(artifact)?;
    std::fs::write(job_dir.join(PROGRESS_FILE), contents)?;
    Ok(())
}

pub fn write_task_abstract(path: &Path, doc: &TaskAbstract) -> MillResult<()> {
    let contents = serde_json::to_string_pretty(doc)?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Drop an abort sentinel into `dir`, optionally requesting forced kill.
pub fn write_abort(dir: &Path, kill: bool) -> MillResult<()> {
    let contents = if kill { "kill=yes\n" } else { "" };
    std::fs::write(dir.join(ABORT_FILE), contents)?;
    Ok(())
}

pub fn remove_stale_control_files(dir: &Path) {
    for name in [FINISHED_FILE, ABORT_FILE] {
        let _ = std::fs::remove_file(dir.join(name));
    }
}

// --- In-memory double for tests ---

/// Test double holding artifacts keyed by path. Shipped alongside the
/// production reader the same way the mock runner is, so integration tests
/// can drive a scheduler without touching the filesystem clock.
#[derive(Default)]
pub struct MemoryArtifactReader {
    pub finished: std::collections::HashMap<PathBuf, ArtifactState<FinishedArtifact>>,
    pub progress: std::collections::HashMap<PathBuf, ArtifactState<ProgressArtifact>>,
    pub abstracts: std::collections::HashMap<PathBuf, ArtifactState<TaskAbstract>>,
    pub abort: std::collections::HashMap<PathBuf, AbortRequest>,
    pub existing_dirs: std::collections::HashSet<PathBuf>,
}

impl ArtifactReader for MemoryArtifactReader {
    fn read_finished(&self, job_dir: &Path) -> ArtifactState<FinishedArtifact> {
        self.finished
            .get(job_dir)
            .cloned()
            .unwrap_or(ArtifactState::NotReady)
    }

    fn read_progress(&self, job_dir: &Path) -> ArtifactState<ProgressArtifact> {
        self.progress
            .get(job_dir)
            .cloned()
            .unwrap_or(ArtifactState::NotReady)
    }

    fn read_task_abstract(&self, path: &Path) -> ArtifactState<TaskAbstract> {
        self.abstracts
            .get(path)
            .cloned()
            .unwrap_or(ArtifactState::NotReady)
    }

    fn read_abort(&self, dir: &Path) -> Option<AbortRequest> {
        self.abort.get(dir).copied()
    }

    fn dir_exists(&self, path: &Path) -> bool {
        self.existing_dirs.contains(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_file_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = FinishedArtifact {
            status: "completed".to_string(),
            start_date: "2026-01-01T00:00:00Z".to_string(),
            end_date: "2026-01-01T01:00:00Z".to_string(),
            elapsed_secs: 3600.0,
            times: None,
        };
        write_finished(dir.path(), &artifact).unwrap();

        // Just written, still inside the debounce window.
        let reader = FsArtifactReader::new(10);
        assert_eq!(reader.read_finished(dir.path()), ArtifactState::NotReady);

        // A zero debounce trusts it immediately.
        let reader = FsArtifactReader::new(0);
        assert_eq!(
            reader.read_finished(dir.path()),
            ArtifactState::Ready(artifact)
        );
    }

    #[test]
    fn missing_and_empty_files_are_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let reader = FsArtifactReader::new(0);
        assert_eq!(reader.read_finished(dir.path()), ArtifactState::NotReady);

        std::fs::write(dir.path().join(FINISHED_FILE), "").unwrap();
        assert_eq!(reader.read_finished(dir.path()), ArtifactState::NotReady);
    }

    #[test]
    fn garbage_document_is_malformed_not_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(FINISHED_FILE), "not json at all").unwrap();
        let reader = FsArtifactReader::new(0);
        assert!(matches!(
            reader.read_finished(dir.path()),
            ArtifactState::Malformed(_)
        ));
    }

    #[test]
    fn abort_sentinel_parses_kill_switch() {
        let dir = tempfile::tempdir().unwrap();
        let reader = FsArtifactReader::new(0);
        assert_eq!(reader.read_abort(dir.path()), None);

        write_abort(dir.path(), false).unwrap();
        assert_eq!(reader.read_abort(dir.path()), Some(AbortRequest { kill: false }));

        write_abort(dir.path(), true).unwrap();
        assert_eq!(reader.read_abort(dir.path()), Some(AbortRequest { kill: true }));
    }

    #[test]
    fn task_abstract_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("001_blast_execution_result.json");
        let doc = TaskAbstract {
            exit_status: "completed".to_string(),
            need_parsing: true,
            output_file: Some("blast.out".to_string()),
            cpu_time_secs: Some(12.5),
            real_time_secs: Some(30.0),
        };
        write_task_abstract(&path, &doc).unwrap();
        let reader = FsArtifactReader::new(0);
        assert_eq!(reader.read_task_abstract(&path), ArtifactState::Ready(doc));
    }
}
