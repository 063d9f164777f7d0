mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::*;
use seqmill::config::load_config;
use seqmill::pipeline::{PipelineScheduler, RunOptions};
use seqmill::runner::{MockRunner, MockState, RunnerRegistry};
use seqmill::status::Status;

// --- Helpers ---

struct Fixture {
    _dir: tempfile::TempDir,
    workdir: PathBuf,
    plan_path: PathBuf,
    config_path: PathBuf,
    chunks_path: PathBuf,
    sequence_path: PathBuf,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let sequence_path = write_sequence_file(dir.path());
    let chunks_path = write_chunk_manifest(dir.path());
    let plan_path = write_plan_file(dir.path());
    let config_path = write_pipeline_config(dir.path());
    let workdir = dir.path().join("work");
    std::fs::create_dir_all(&workdir).unwrap();
    Fixture {
        _dir: dir,
        workdir,
        plan_path,
        config_path,
        chunks_path,
        sequence_path,
    }
}

/// Configuration with a local instance runner and a slurm task runner, so
/// two instances may run in parallel.
fn write_pipeline_config(dir: &Path) -> PathBuf {
    let path = dir.join("seqmill.toml");
    std::fs::write(
        &path,
        r#"[global]
max_parallel_instances = 2
artifact_debounce_secs = 0
fallback_runner = "local"

[runners.local]
kind = "local"
total_threads = 8
monitoring_interval_secs = 1

[runners.slurm]
kind = "slurm"
submit_command = "sbatch -p {queue}"
monitoring_command = "squeue -h -j {jobid}"
kill_command = "scancel {jobid}"
default_queue = "normal"
"#,
    )
    .unwrap();
    path
}

fn run_options(fixture: &Fixture) -> RunOptions {
    RunOptions {
        workdir: fixture.workdir.clone(),
        sequence_path: fixture.sequence_path.clone(),
        chunks_path: fixture.chunks_path.clone(),
        plan_path: fixture.plan_path.clone(),
        config_path: fixture.config_path.clone(),
        instance_runner: "local".to_string(),
        task_runner: "slurm".to_string(),
        kill_on_abort: false,
        ignore_original_masking: false,
    }
}

fn mock_registry() -> (RunnerRegistry, Arc<MockState>) {
    let mock = MockRunner::new("local");
    let state = mock.state();
    let registry =
        RunnerRegistry::with_runners(vec![("local".to_string(), Box::new(mock))], "local");
    (registry, state)
}

fn prepare(fixture: &Fixture) -> (PipelineScheduler, SharedReader, Arc<MockState>) {
    let config = load_config(&fixture.config_path).unwrap();
    let reader = SharedReader::new();
    let (registry, state) = mock_registry();
    let scheduler =
        PipelineScheduler::prepare_run(run_options(fixture), config, Box::new(reader.clone()))
            .unwrap()
            .with_registry(registry);
    (scheduler, reader, state)
}

fn resume(fixture: &Fixture, reader: SharedReader) -> (PipelineScheduler, Arc<MockState>) {
    let config = load_config(&fixture.config_path).unwrap();
    let (registry, state) = mock_registry();
    let scheduler =
        PipelineScheduler::prepare_resume(&fixture.workdir, config, Box::new(reader.clone()))
            .unwrap()
            .with_registry(registry);
    (scheduler, state)
}

fn chunk_dir(fixture: &Fixture, number: u32) -> PathBuf {
    fixture.workdir.join("chr1").join(format!("Chunk_{}", number))
}

fn progress(percent: u32) -> seqmill::artifacts::ProgressArtifact {
    seqmill::artifacts::ProgressArtifact {
        completed_tasks: percent / 10,
        total_tasks: 10,
        percent,
        report_date: "2026-03-01T08:30:00Z".to_string(),
    }
}

// --- Registration & admission ---

#[test]
fn run_registers_every_chunk_before_submitting_up_to_the_ceiling() {
    let fixture = fixture();
    let (mut scheduler, _reader, state) = prepare(&fixture);

    // Plan-time bulk registration happened before any submission.
    let counters = scheduler.store().status_counters().unwrap();
    assert_eq!(counters.get("pending"), Some(&3));
    assert!(state.submitted_names.lock().unwrap().is_empty());

    scheduler.startup();
    scheduler.tick().unwrap();

    let live = scheduler
        .active_instances()
        .iter()
        .filter(|i| i.status().is_live())
        .count();
    assert_eq!(live, 2);
    assert_eq!(state.submitted_names.lock().unwrap().len(), 2);

    let counters = scheduler.store().status_counters().unwrap();
    assert_eq!(counters.get("submitted"), Some(&2));
    assert_eq!(counters.get("pending"), Some(&1));

    // Inputs were prepared: the chunk FASTA and the wrapper script exist.
    let fasta = chunk_dir(&fixture, 1).join("chr1_c1.fasta");
    assert!(fasta.is_file());
    let contents = std::fs::read_to_string(&fasta).unwrap();
    assert!(contents.starts_with(">chr1_c1\n"));
    assert!(std::fs::read_dir(fixture.workdir.join("launchers"))
        .unwrap()
        .next()
        .is_some());
}

// --- Completion flow ---

#[test]
fn finished_artifact_retires_the_instance_and_grows_the_statistics() {
    let fixture = fixture();
    let (mut scheduler, reader, _state) = prepare(&fixture);
    scheduler.startup();
    scheduler.tick().unwrap();

    let dir = chunk_dir(&fixture, 1);
    reader.add_dir(dir.clone());
    reader.set_progress(dir.clone(), progress(50));
    scheduler.tick().unwrap();
    let first = &scheduler.active_instances()[0];
    assert_eq!(first.status(), Status::Running);

    reader.set_finished(dir, finished_ok());
    scheduler.tick().unwrap();

    // The instance left the active set; the freed slot admitted chunk 3.
    assert_eq!(scheduler.active_instances().len(), 2);
    let live = scheduler
        .active_instances()
        .iter()
        .filter(|i| i.status().is_live())
        .count();
    assert_eq!(live, 2);

    let counters = scheduler.store().status_counters().unwrap();
    assert_eq!(counters.get("completed"), Some(&1));

    let stats = scheduler.store().stats().unwrap();
    assert_eq!(stats.total_cpu_secs, 100.0);
    assert_eq!(stats.total_real_secs, 200.0);

    let overview = scheduler.store().overview().unwrap();
    let row = overview.iter().find(|r| r.chunk_name == "chr1_c1").unwrap();
    assert_eq!(row.status, Status::Completed);
    assert_eq!(row.progress, 100);
}

#[test]
fn error_reported_by_the_finished_artifact_propagates_as_is() {
    let fixture = fixture();
    let (mut scheduler, reader, _state) = prepare(&fixture);
    scheduler.startup();
    scheduler.tick().unwrap();

    let dir = chunk_dir(&fixture, 1);
    reader.add_dir(dir.clone());
    reader.set_progress(dir.clone(), progress(10));
    scheduler.tick().unwrap();
    reader.set_finished(dir, finished_with_status("error"));
    scheduler.tick().unwrap();

    let counters = scheduler.store().status_counters().unwrap();
    assert_eq!(counters.get("error"), Some(&1));
}

// --- Scenario D: graceful abort ---

#[test]
fn abort_sentinel_without_kill_requests_graceful_stops() {
    let fixture = fixture();
    let (mut scheduler, reader, state) = prepare(&fixture);
    scheduler.startup();
    scheduler.tick().unwrap();

    for number in [1, 2] {
        let dir = chunk_dir(&fixture, number);
        reader.add_dir(dir.clone());
        reader.set_progress(dir, progress(20));
    }
    scheduler.tick().unwrap();

    reader.set_abort(fixture.workdir.clone(), false);
    scheduler.poll_abort_sentinel();
    assert!(scheduler.is_aborting());

    // Graceful: no kill command ran; each live chunk received its own
    // abort sentinel and the pending chunk canceled immediately.
    assert!(state.killed.lock().unwrap().is_empty());
    for number in [1, 2] {
        let sentinel = chunk_dir(&fixture, number).join("seqmill_abort");
        assert!(sentinel.is_file());
        assert!(!std::fs::read_to_string(&sentinel).unwrap().contains("kill=yes"));
    }
    let counters = scheduler.store().status_counters().unwrap();
    assert_eq!(counters.get("canceled"), Some(&1));

    // The live chunks reach Canceled once their own finished artifact is
    // observed.
    for number in [1, 2] {
        reader.set_finished(chunk_dir(&fixture, number), finished_with_status("canceled"));
    }
    scheduler.tick().unwrap();
    assert!(scheduler.active_instances().is_empty());
    let counters = scheduler.store().status_counters().unwrap();
    assert_eq!(counters.get("canceled"), Some(&3));
}

// --- Resume ---

#[test]
fn resume_rebinds_persisted_handles_without_resubmitting() {
    let fixture = fixture();
    let submitted_commands: Vec<(String, String)>;
    {
        let (mut scheduler, _reader, _state) = prepare(&fixture);
        scheduler.startup();
        scheduler.tick().unwrap();
        submitted_commands = scheduler
            .active_instances()
            .iter()
            .filter_map(|i| i.state.bound.as_ref())
            .map(|b| {
                (
                    b.handle.monitoring_command.clone(),
                    b.handle.kill_command.clone(),
                )
            })
            .collect();
        assert_eq!(submitted_commands.len(), 2);
    }

    // A fresh scheduler reloads the rows: the submitted instances come
    // back with their handles rebound from the store alone.
    let reader = SharedReader::new();
    let (mut scheduler, state) = resume(&fixture, reader.clone());
    assert_eq!(scheduler.active_instances().len(), 3);
    let rebound: Vec<(String, String)> = scheduler
        .active_instances()
        .iter()
        .filter_map(|i| i.state.bound.as_ref())
        .map(|b| {
            (
                b.handle.monitoring_command.clone(),
                b.handle.kill_command.clone(),
            )
        })
        .collect();
    assert_eq!(rebound, submitted_commands);

    // One tick applies the same status-refresh decisions an uninterrupted
    // process would have made: a finished chunk retires, nothing is
    // resubmitted for the already-submitted rows.
    let dir = chunk_dir(&fixture, 1);
    reader.add_dir(dir.clone());
    reader.set_progress(dir.clone(), progress(80));
    reader.set_finished(dir, finished_ok());
    scheduler.startup();
    scheduler.tick().unwrap();

    let counters = scheduler.store().status_counters().unwrap();
    assert_eq!(counters.get("completed"), Some(&1));
    // Only the still-pending chunk 3 was submitted by the new process.
    assert_eq!(state.submitted_names.lock().unwrap().len(), 1);
}

// --- Retry ---

#[test]
fn retry_archives_the_failed_directory_and_resets_the_row() {
    let fixture = fixture();
    {
        let (mut scheduler, reader, _state) = prepare(&fixture);
        scheduler.startup();
        scheduler.tick().unwrap();
        let dir = chunk_dir(&fixture, 1);
        reader.add_dir(dir.clone());
        reader.set_progress(dir.clone(), progress(10));
        scheduler.tick().unwrap();
        reader.set_finished(dir, finished_with_status("error"));
        scheduler.tick().unwrap();
        let counters = scheduler.store().status_counters().unwrap();
        assert_eq!(counters.get("error"), Some(&1));
    }

    let config = load_config(&fixture.config_path).unwrap();
    let (registry, _state) = mock_registry();
    let scheduler = PipelineScheduler::prepare_retry(
        &fixture.workdir,
        config,
        Box::new(SharedReader::new()),
    )
    .unwrap()
    .with_registry(registry);

    // The directory moved aside, the row is pending again with its id
    // preserved and the backup recorded.
    assert!(!chunk_dir(&fixture, 1).exists());
    let backup = PathBuf::from(format!("{}.backup", chunk_dir(&fixture, 1).display()));
    assert!(backup.is_dir());

    let reset = scheduler
        .active_instances()
        .iter()
        .find(|i| i.chunk.chunk_name == "chr1_c1")
        .unwrap();
    assert_eq!(reset.id, 1);
    assert_eq!(reset.status(), Status::Pending);
    assert_eq!(reset.backup_archive.as_deref(), Some(backup.as_path()));
}

// --- Startup reconciliation ---

#[test]
fn pending_row_with_leftover_directory_is_flagged_unmonitorable() {
    let fixture = fixture();
    let (mut scheduler, _reader, _state) = prepare(&fixture);

    // A crashed predecessor created the directory but never recorded the
    // submission.
    let dir = chunk_dir(&fixture, 1);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("stray.log"), "half-submitted").unwrap();

    scheduler.startup();
    let flagged = scheduler
        .active_instances()
        .iter()
        .find(|i| i.chunk.chunk_name == "chr1_c1")
        .unwrap();
    assert_eq!(flagged.status(), Status::Error);
}

// --- Global file integrity ---

#[test]
fn resume_refuses_a_modified_plan_file() {
    let fixture = fixture();
    {
        let (_scheduler, _reader, _state) = prepare(&fixture);
    }

    std::fs::write(
        &fixture.plan_path,
        "[[tasks]]\nid = 9\ntool = \"edited\"\nstep = 1\n",
    )
    .unwrap();

    let config = load_config(&fixture.config_path).unwrap();
    let err = PipelineScheduler::prepare_resume(
        &fixture.workdir,
        config,
        Box::new(SharedReader::new()),
    )
    .unwrap_err();
    assert!(err.is_fatal());
    assert!(err.to_string().contains("modified"));
}

#[test]
fn a_second_run_against_the_same_store_is_refused() {
    let fixture = fixture();
    {
        let (_scheduler, _reader, _state) = prepare(&fixture);
    }
    let config = load_config(&fixture.config_path).unwrap();
    let err = PipelineScheduler::prepare_run(
        run_options(&fixture),
        config,
        Box::new(SharedReader::new()),
    )
    .unwrap_err();
    assert!(err.to_string().contains("already holds a run"));
}
