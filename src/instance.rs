use std::path::{Path, PathBuf};

use crate::artifacts::{self, FinishedArtifact};
use crate::job::JobState;
use crate::plan::ChunkDescriptor;
use crate::status::Status;

/// One chunk analysis: a job whose execution is a full run of the inner
/// task scheduler in a separate process.
#[derive(Debug)]
pub struct Instance {
    pub id: u32,
    pub chunk: ChunkDescriptor,
    pub state: JobState,
    /// Percent completion mirrored from the chunk's progress artifact.
    pub progress: u32,
    pub fasta_path: Option<PathBuf>,
    pub directory: Option<PathBuf>,
    pub directory_size: Option<u64>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub elapsed_secs: Option<f64>,
    /// Archive of the previous attempt's directory, recorded by retry.
    pub backup_archive: Option<PathBuf>,
    pub finished: Option<FinishedArtifact>,
}

impl Instance {
    pub fn new(id: u32, chunk: ChunkDescriptor) -> Self {
        Self {
            id,
            chunk,
            state: JobState::default(),
            progress: 0,
            fasta_path: None,
            directory: None,
            directory_size: None,
            start_date: None,
            end_date: None,
            elapsed_secs: None,
            backup_archive: None,
            finished: None,
        }
    }

    pub fn status(&self) -> Status {
        self.state.status
    }

    pub fn description(&self) -> String {
        format!(
            "instance {} [chunk {}, {} bp, sequence {}]",
            self.id,
            self.chunk.chunk_name,
            self.chunk.size(),
            self.chunk.sequence
        )
    }

    /// Working directory assigned to this chunk: `<root>/<sequence>` for an
    /// unsplit sequence, `<root>/<sequence>/Chunk_<n>` otherwise.
    pub fn directory_under(&self, root: &Path) -> PathBuf {
        let sequence_dir = root.join(&self.chunk.sequence);
        if self.chunk.chunk_number == 0 {
            sequence_dir
        } else {
            sequence_dir.join(format!("Chunk_{}", self.chunk.chunk_number))
        }
    }

    /// Fold the finished artifact into the instance. The artifact's status
    /// text decides the terminal state; an unknown status text forces
    /// `Error`.
    pub fn absorb_finished(&mut self, doc: FinishedArtifact) {
        let status = doc.status.parse::<Status>();
        self.start_date = Some(doc.start_date.clone());
        self.end_date = Some(doc.end_date.clone());
        self.elapsed_secs = Some(doc.elapsed_secs);
        self.finished = Some(doc);

        match status {
            Ok(Status::Error) => {
                self.state
                    .set_error(&self.description(), "the unit run exited with error status");
            }
            Ok(status @ (Status::Completed | Status::Canceled)) => {
                self.state.status = status;
            }
            Ok(other) => {
                self.state.set_error(
                    &self.description(),
                    format!("the finished artifact carries a non-terminal status '{}'", other),
                );
            }
            Err(e) => {
                self.state.set_error(&self.description(), e);
            }
        }
    }

    /// Cooperative cancellation: drop an abort sentinel into the chunk's
    /// directory so the unit process stops itself. Nothing to do when the
    /// instance never started.
    pub fn request_abort(&self, kill: bool) -> bool {
        match &self.directory {
            Some(dir) if dir.is_dir() => artifacts::write_abort(dir, kill).is_ok(),
            _ => false,
        }
    }
}

/// Total size in bytes of a directory tree, for the completion row.
pub fn directory_tree_size(path: &Path) -> Option<u64> {
    if !path.is_dir() {
        return None;
    }
    let mut total = 0u64;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = std::fs::read_dir(&dir).ok()?;
        for entry in entries.flatten() {
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if metadata.is_dir() {
                stack.push(entry.path());
            } else {
                total += metadata.len();
            }
        }
    }
    Some(total)
}
