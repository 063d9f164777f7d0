#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use seqmill::artifacts::{
    AbortRequest, ArtifactReader, ArtifactState, FinishedArtifact, MemoryArtifactReader,
    ProgressArtifact, TaskAbstract,
};
use seqmill::config::MillConfig;
use seqmill::plan::{PlanEntry, TaskPlan};

/// Artifact reader double shared between a test and the scheduler under
/// test, so artifacts can appear between ticks.
#[derive(Clone, Default)]
pub struct SharedReader(pub Arc<Mutex<MemoryArtifactReader>>);

impl SharedReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dir(&self, path: PathBuf) {
        self.0.lock().unwrap().existing_dirs.insert(path);
    }

    pub fn set_task_abstract(&self, path: PathBuf, doc: TaskAbstract) {
        self.0
            .lock()
            .unwrap()
            .abstracts
            .insert(path, ArtifactState::Ready(doc));
    }

    pub fn set_malformed_abstract(&self, path: PathBuf, message: &str) {
        self.0
            .lock()
            .unwrap()
            .abstracts
            .insert(path, ArtifactState::Malformed(message.to_string()));
    }

    pub fn set_finished(&self, dir: PathBuf, doc: FinishedArtifact) {
        self.0
            .lock()
            .unwrap()
            .finished
            .insert(dir, ArtifactState::Ready(doc));
    }

    pub fn set_progress(&self, dir: PathBuf, doc: ProgressArtifact) {
        self.0
            .lock()
            .unwrap()
            .progress
            .insert(dir, ArtifactState::Ready(doc));
    }

    pub fn set_abort(&self, dir: PathBuf, kill: bool) {
        self.0.lock().unwrap().abort.insert(dir, AbortRequest { kill });
    }
}

impl ArtifactReader for SharedReader {
    fn read_finished(&self, job_dir: &Path) -> ArtifactState<FinishedArtifact> {
        self.0.lock().unwrap().read_finished(job_dir)
    }

    fn read_progress(&self, job_dir: &Path) -> ArtifactState<ProgressArtifact> {
        self.0.lock().unwrap().read_progress(job_dir)
    }

    fn read_task_abstract(&self, path: &Path) -> ArtifactState<TaskAbstract> {
        self.0.lock().unwrap().read_task_abstract(path)
    }

    fn read_abort(&self, dir: &Path) -> Option<AbortRequest> {
        self.0.lock().unwrap().read_abort(dir)
    }

    fn dir_exists(&self, path: &Path) -> bool {
        self.0.lock().unwrap().dir_exists(path)
    }
}

// --- Plan helpers ---

pub fn entry(id: u32, tool: &str, deps: &[u32]) -> PlanEntry {
    PlanEntry {
        id,
        tool: tool.to_string(),
        step: 1,
        sequence: "initial".to_string(),
        cores: 1,
        spawns_subprocesses: false,
        dependencies: deps.iter().map(|d| (*d, None)).collect::<BTreeMap<_, _>>(),
    }
}

pub fn plan_of(entries: Vec<PlanEntry>) -> TaskPlan {
    TaskPlan {
        description: "test plan".to_string(),
        entries,
    }
}

// --- Abstract documents ---

pub fn exec_ok() -> TaskAbstract {
    TaskAbstract {
        exit_status: "completed".to_string(),
        need_parsing: false,
        output_file: None,
        cpu_time_secs: Some(2.0),
        real_time_secs: Some(4.0),
    }
}

pub fn exec_with_parsing(output: &str) -> TaskAbstract {
    TaskAbstract {
        exit_status: "completed".to_string(),
        need_parsing: true,
        output_file: Some(output.to_string()),
        cpu_time_secs: Some(2.0),
        real_time_secs: Some(4.0),
    }
}

pub fn exec_error() -> TaskAbstract {
    TaskAbstract {
        exit_status: "error".to_string(),
        need_parsing: false,
        output_file: None,
        cpu_time_secs: None,
        real_time_secs: None,
    }
}

pub fn parsing_ok() -> TaskAbstract {
    TaskAbstract {
        exit_status: "completed".to_string(),
        need_parsing: false,
        output_file: None,
        cpu_time_secs: Some(0.5),
        real_time_secs: Some(1.0),
    }
}

pub fn finished_ok() -> FinishedArtifact {
    FinishedArtifact {
        status: "completed".to_string(),
        start_date: "2026-03-01T08:00:00Z".to_string(),
        end_date: "2026-03-01T09:00:00Z".to_string(),
        elapsed_secs: 3600.0,
        times: Some(seqmill::stats::aggregate_times(
            &[seqmill::stats::PhaseSample {
                cpu_secs: 100.0,
                real_secs: 200.0,
            }],
            &[],
        )),
    }
}

pub fn finished_with_status(status: &str) -> FinishedArtifact {
    FinishedArtifact {
        status: status.to_string(),
        ..finished_ok()
    }
}

// --- Config & input files ---

pub fn test_config(max_parallel_tasks: u32, max_parallel_instances: u32) -> MillConfig {
    let mut config = MillConfig::default();
    config.global.max_parallel_tasks = max_parallel_tasks;
    config.global.max_parallel_instances = max_parallel_instances;
    config.global.fallback_runner = "mock".to_string();
    config
}

pub fn write_sequence_file(dir: &Path) -> PathBuf {
    let path = dir.join("genome.fasta");
    let body = "acgt".repeat(100);
    std::fs::write(&path, format!(">chr1\n{}\n", body)).unwrap();
    path
}

/// Three chunks over the sequence written by `write_sequence_file`.
pub fn write_chunk_manifest(dir: &Path) -> PathBuf {
    let path = dir.join("chunks.toml");
    let header_len = ">chr1\n".len() as u64;
    let mut contents = String::new();
    for number in 1..=3u64 {
        let start = header_len + (number - 1) * 100;
        contents.push_str(&format!(
            "[[chunks]]\nsequence = \"chr1\"\nchunk_name = \"chr1_c{}\"\nchunk_number = {}\nstart_offset = {}\nend_offset = {}\n\n",
            number,
            number,
            start,
            start + 100,
        ));
    }
    std::fs::write(&path, contents).unwrap();
    path
}

pub fn write_plan_file(dir: &Path) -> PathBuf {
    let path = dir.join("plan.toml");
    std::fs::write(
        &path,
        r#"description = "annotation test plan"

[[tasks]]
id = 1
tool = "repeat_masker"
step = 1

[[tasks]]
id = 2
tool = "blast"
step = 2
cores = 4
needs = [1]

[[tasks]]
id = 3
tool = "eugene"
step = 3
needs = [{ id = 2, tool = "blast" }]
"#,
    )
    .unwrap();
    path
}

pub fn write_config_file(dir: &Path, max_parallel_instances: u32) -> PathBuf {
    let path = dir.join("seqmill.toml");
    std::fs::write(
        &path,
        format!(
            r#"[global]
max_parallel_instances = {}
artifact_debounce_secs = 0
fallback_runner = "local"

[runners.local]
kind = "local"
total_threads = 8
monitoring_interval_secs = 1
"#,
            max_parallel_instances
        ),
    )
    .unwrap();
    path
}
