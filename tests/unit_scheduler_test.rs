mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::*;
use seqmill::error::MillError;
use seqmill::plan::PlanEntry;
use seqmill::runner::{MockRunner, MockState, RunnerRegistry};
use seqmill::status::Status;
use seqmill::unit::{UnitOptions, UnitScheduler};

// --- Helpers ---

fn unit_options(dir: &Path, runner_name: &str) -> UnitOptions {
    UnitOptions {
        workdir: dir.to_path_buf(),
        sequence_path: dir.join("chunk.fasta"),
        plan_path: dir.join("plan.toml"),
        config_path: dir.join("seqmill.toml"),
        runner_name: runner_name.to_string(),
        report_progress: false,
        kill_on_abort: false,
    }
}

fn build(
    dir: &Path,
    entries: Vec<PlanEntry>,
    max_parallel_tasks: u32,
    mock: MockRunner,
) -> (UnitScheduler, SharedReader, Arc<MockState>) {
    let reader = SharedReader::new();
    let state = mock.state();
    let registry =
        RunnerRegistry::with_runners(vec![("mock".to_string(), Box::new(mock))], "mock");
    let scheduler = UnitScheduler::new(
        unit_options(dir, "mock"),
        test_config(max_parallel_tasks, 2),
        &plan_of(entries),
        Box::new(reader.clone()),
    )
    .unwrap()
    .with_registry(registry);
    scheduler.prepare_workdir().unwrap();
    (scheduler, reader, state)
}

fn exec_dir(workdir: &Path, id: u32, tool: &str) -> PathBuf {
    workdir.join(format!("{:03}_{}_execution", id, tool))
}

fn parsing_dir(workdir: &Path, id: u32, tool: &str) -> PathBuf {
    workdir.join(format!("{:03}_{}_parsing", id, tool))
}

fn exec_abstract(workdir: &Path, id: u32, tool: &str) -> PathBuf {
    workdir
        .join("summaries")
        .join(format!("{:03}_{}_execution_result.json", id, tool))
}

fn parsing_abstract(workdir: &Path, id: u32, tool: &str) -> PathBuf {
    workdir
        .join("summaries")
        .join(format!("{:03}_{}_parsing_result.json", id, tool))
}

fn live_count(scheduler: &UnitScheduler) -> usize {
    scheduler
        .active_tasks()
        .iter()
        .filter(|t| t.status().is_live())
        .count()
}

// --- Scenario A: 5 independent jobs, ceiling 2 ---

#[test]
fn ceiling_of_two_admits_two_then_refills_on_completion() {
    let dir = tempfile::tempdir().unwrap();
    let entries: Vec<PlanEntry> = (1..=5)
        .map(|i| entry(i, &format!("tool{}", i), &[]))
        .collect();
    let (mut scheduler, reader, state) = build(dir.path(), entries, 2, MockRunner::new("mock"));

    scheduler.startup();
    scheduler.tick().unwrap();
    assert_eq!(live_count(&scheduler), 2);
    assert_eq!(
        scheduler
            .active_tasks()
            .iter()
            .filter(|t| t.status() == Status::Pending)
            .count(),
        3
    );
    assert_eq!(state.submitted_names.lock().unwrap().len(), 2);

    // Each completion frees a slot and admits the next pending task,
    // never exceeding the ceiling.
    let mut rounds = 0;
    while !scheduler.active_tasks().is_empty() {
        rounds += 1;
        assert!(rounds < 50, "the scheduler did not converge");

        for task in scheduler.active_tasks() {
            if task.status() == Status::SubmittedExec {
                reader.add_dir(exec_dir(dir.path(), task.id, &task.tool));
            } else if task.status() == Status::RunningExec {
                reader.set_task_abstract(
                    exec_abstract(dir.path(), task.id, &task.tool),
                    exec_ok(),
                );
            }
        }
        scheduler.tick().unwrap();
        assert!(live_count(&scheduler) <= 2, "ceiling violated");
    }

    assert_eq!(scheduler.retired_tasks().len(), 5);
    assert!(scheduler
        .retired_tasks()
        .iter()
        .all(|t| t.status() == Status::Completed));
    assert_eq!(state.submitted_names.lock().unwrap().len(), 5);
}

// --- Scenario B: dependent cascades to canceled on upstream error ---

#[test]
fn upstream_error_cancels_the_dependent_without_submitting_it() {
    let dir = tempfile::tempdir().unwrap();
    let entries = vec![entry(1, "masker", &[]), entry(2, "blast", &[1])];
    let (mut scheduler, reader, state) = build(dir.path(), entries, 4, MockRunner::new("mock"));

    scheduler.startup();
    scheduler.tick().unwrap();
    assert_eq!(state.submitted_names.lock().unwrap().len(), 1);

    reader.add_dir(exec_dir(dir.path(), 1, "masker"));
    scheduler.tick().unwrap();
    reader.set_task_abstract(exec_abstract(dir.path(), 1, "masker"), exec_error());
    scheduler.tick().unwrap();

    let retired = scheduler.retired_tasks();
    assert_eq!(retired.len(), 2);
    let failed = retired.iter().find(|t| t.id == 1).unwrap();
    let canceled = retired.iter().find(|t| t.id == 2).unwrap();
    assert_eq!(failed.status(), Status::Error);
    assert_eq!(canceled.status(), Status::Canceled);
    assert!(canceled
        .state
        .error_info
        .as_deref()
        .unwrap()
        .contains("task 1"));

    // The dependent never reached a back-end.
    assert_eq!(state.submitted_names.lock().unwrap().len(), 1);
}

#[test]
fn cascade_reaches_transitive_dependents_through_the_middle_job() {
    let dir = tempfile::tempdir().unwrap();
    let entries = vec![
        entry(1, "masker", &[]),
        entry(2, "blast", &[1]),
        entry(3, "eugene", &[2]),
    ];
    let (mut scheduler, reader, _state) = build(dir.path(), entries, 4, MockRunner::new("mock"));

    scheduler.startup();
    scheduler.tick().unwrap();
    reader.add_dir(exec_dir(dir.path(), 1, "masker"));
    scheduler.tick().unwrap();
    reader.set_task_abstract(exec_abstract(dir.path(), 1, "masker"), exec_error());
    scheduler.tick().unwrap();

    let retired = scheduler.retired_tasks();
    let middle = retired.iter().find(|t| t.id == 2).unwrap();
    let leaf = retired.iter().find(|t| t.id == 3).unwrap();
    assert_eq!(middle.status(), Status::Canceled);
    assert_eq!(leaf.status(), Status::Canceled);
    // Each hop names its direct upstream cause.
    assert!(middle.state.error_info.as_deref().unwrap().contains("task 1"));
    assert!(leaf.state.error_info.as_deref().unwrap().contains("task 2"));
}

// --- Scenario C: capacity shortage postpones submission ---

#[test]
fn capacity_shortage_keeps_the_job_pending_until_power_frees_up() {
    let dir = tempfile::tempdir().unwrap();
    let entries = vec![entry(1, "blast", &[])];
    let mock = MockRunner::new("mock").script_capacity(vec![false, false, false]);
    let (mut scheduler, _reader, state) = build(dir.path(), entries, 4, mock);

    scheduler.startup();
    for _ in 0..3 {
        scheduler.tick().unwrap();
        assert_eq!(scheduler.active_tasks()[0].status(), Status::Pending);
        assert!(state.submitted_names.lock().unwrap().is_empty());
    }

    scheduler.tick().unwrap();
    assert_eq!(scheduler.active_tasks()[0].status(), Status::SubmittedExec);
    assert_eq!(state.submitted_names.lock().unwrap().len(), 1);
}

// --- Scenario D: abort sentinel, graceful vs forced ---

#[test]
fn abort_sentinel_without_kill_cancels_gracefully() {
    let dir = tempfile::tempdir().unwrap();
    let entries = vec![entry(1, "blast", &[]), entry(2, "eugene", &[])];
    let (mut scheduler, reader, state) = build(dir.path(), entries, 4, MockRunner::new("mock"));

    scheduler.startup();
    scheduler.tick().unwrap();
    reader.add_dir(exec_dir(dir.path(), 1, "blast"));
    reader.add_dir(exec_dir(dir.path(), 2, "eugene"));
    scheduler.tick().unwrap();
    assert_eq!(live_count(&scheduler), 2);

    reader.set_abort(dir.path().to_path_buf(), false);
    assert!(scheduler.poll_abort_sentinel());
    assert!(scheduler.is_aborting());

    assert!(state.killed.lock().unwrap().is_empty(), "graceful stop must not kill");
    assert_eq!(scheduler.retired_tasks().len(), 2);
    assert!(scheduler
        .retired_tasks()
        .iter()
        .all(|t| t.status() == Status::Canceled));
}

#[test]
fn abort_sentinel_with_kill_invokes_the_kill_command() {
    let dir = tempfile::tempdir().unwrap();
    let entries = vec![entry(1, "blast", &[])];
    let (mut scheduler, reader, state) = build(dir.path(), entries, 4, MockRunner::new("mock"));

    scheduler.startup();
    scheduler.tick().unwrap();
    reader.set_abort(dir.path().to_path_buf(), true);
    assert!(scheduler.poll_abort_sentinel());

    assert_eq!(state.killed.lock().unwrap().len(), 1);
    assert_eq!(scheduler.retired_tasks()[0].status(), Status::Canceled);
}

// --- Terminal jobs are never re-activated ---

#[test]
fn completed_tasks_are_never_resubmitted() {
    let dir = tempfile::tempdir().unwrap();
    let entries = vec![entry(1, "blast", &[])];
    let (mut scheduler, reader, state) = build(dir.path(), entries, 4, MockRunner::new("mock"));

    scheduler.startup();
    scheduler.tick().unwrap();
    reader.add_dir(exec_dir(dir.path(), 1, "blast"));
    scheduler.tick().unwrap();
    reader.set_task_abstract(exec_abstract(dir.path(), 1, "blast"), exec_ok());
    scheduler.tick().unwrap();
    assert_eq!(scheduler.retired_tasks().len(), 1);

    for _ in 0..3 {
        scheduler.tick().unwrap();
    }
    assert_eq!(state.submitted_names.lock().unwrap().len(), 1);
}

// --- Two-phase tasks ---

#[test]
fn parsing_phase_is_a_second_submission() {
    let dir = tempfile::tempdir().unwrap();
    let entries = vec![entry(1, "blast", &[])];
    let (mut scheduler, reader, state) = build(dir.path(), entries, 4, MockRunner::new("mock"));

    scheduler.startup();
    scheduler.tick().unwrap();
    reader.add_dir(exec_dir(dir.path(), 1, "blast"));
    scheduler.tick().unwrap();
    reader.set_task_abstract(
        exec_abstract(dir.path(), 1, "blast"),
        exec_with_parsing("blast.out"),
    );
    scheduler.tick().unwrap();

    // The execution abstract asked for parsing, so the task is now on its
    // second submission instead of being complete.
    assert_eq!(scheduler.active_tasks()[0].status(), Status::SubmittedParsing);
    let names = state.submitted_names.lock().unwrap().clone();
    assert_eq!(names.len(), 2);
    assert!(names[0].contains("_execution_"));
    assert!(names[1].contains("_parsing_"));

    reader.add_dir(parsing_dir(dir.path(), 1, "blast"));
    scheduler.tick().unwrap();
    assert_eq!(scheduler.active_tasks()[0].status(), Status::RunningParsing);

    reader.set_task_abstract(parsing_abstract(dir.path(), 1, "blast"), parsing_ok());
    scheduler.tick().unwrap();
    let task = &scheduler.retired_tasks()[0];
    assert_eq!(task.status(), Status::Completed);
    assert!(task.exec_sample.is_some());
    assert!(task.parsing_sample.is_some());
}

// --- Startup fast-forward ---

#[test]
fn preexisting_abstracts_fast_forward_without_resubmission() {
    let dir = tempfile::tempdir().unwrap();
    let entries = vec![entry(1, "masker", &[]), entry(2, "blast", &[1])];
    let reader = SharedReader::new();
    reader.set_task_abstract(exec_abstract(dir.path(), 1, "masker"), exec_ok());

    let mock = MockRunner::new("mock");
    let state = mock.state();
    let registry =
        RunnerRegistry::with_runners(vec![("mock".to_string(), Box::new(mock))], "mock");
    let mut scheduler = UnitScheduler::new(
        unit_options(dir.path(), "mock"),
        test_config(4, 2),
        &plan_of(entries),
        Box::new(reader.clone()),
    )
    .unwrap()
    .with_registry(registry);
    scheduler.prepare_workdir().unwrap();

    scheduler.startup();
    assert_eq!(scheduler.active_tasks()[0].status(), Status::Completed);

    // First tick retires task 1 and, with its dependency satisfied,
    // submits only task 2.
    scheduler.tick().unwrap();
    let names = state.submitted_names.lock().unwrap().clone();
    assert_eq!(names.len(), 1);
    assert!(names[0].contains("blast"));
}

// --- Submission failures ---

#[test]
fn submission_failures_error_the_job_at_the_ceiling_without_hurting_siblings() {
    let dir = tempfile::tempdir().unwrap();
    let entries = vec![entry(1, "flaky", &[]), entry(2, "steady", &[])];
    // Default max_failed_submissions is 3; the first three attempts for
    // task 1 fail while task 2 submits cleanly on the first tick.
    let mock = MockRunner::new("mock").script_submissions(vec![
        Err(MillError::Submission("qsub exited 1".to_string())),
        Ok(MockRunner::handle("good-2")),
        Err(MillError::Submission("qsub exited 1".to_string())),
        Err(MillError::Submission("qsub exited 1".to_string())),
    ]);
    let (mut scheduler, _reader, _state) = build(dir.path(), entries, 4, mock);

    scheduler.startup();
    scheduler.tick().unwrap();
    assert_eq!(scheduler.active_tasks()[0].state.failed_submissions, 1);
    assert_eq!(
        scheduler
            .active_tasks()
            .iter()
            .find(|t| t.id == 2)
            .unwrap()
            .status(),
        Status::SubmittedExec
    );

    scheduler.tick().unwrap();
    scheduler.tick().unwrap();
    // The third failure forced the job to Error during the submission
    // stage; the next tick retires it.
    scheduler.tick().unwrap();

    let flaky = scheduler.retired_tasks().iter().find(|t| t.id == 1).unwrap();
    assert_eq!(flaky.status(), Status::Error);
    assert!(flaky
        .state
        .error_info
        .as_deref()
        .unwrap()
        .contains("failed submissions"));
}

// --- Fallback runner ---

#[test]
fn incompatible_runner_swaps_once_to_the_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let mut task = entry(1, "spawner", &[]);
    task.spawns_subprocesses = true;

    let batch = MockRunner::new("batch").incompatible();
    let fallback = MockRunner::new("mock");
    let batch_state = batch.state();
    let fallback_state = fallback.state();
    let registry = RunnerRegistry::with_runners(
        vec![
            ("batch".to_string(), Box::new(batch)),
            ("mock".to_string(), Box::new(fallback)),
        ],
        "mock",
    );

    let reader = SharedReader::new();
    let mut scheduler = UnitScheduler::new(
        unit_options(dir.path(), "batch"),
        test_config(4, 2),
        &plan_of(vec![task]),
        Box::new(reader.clone()),
    )
    .unwrap()
    .with_registry(registry);
    scheduler.prepare_workdir().unwrap();

    scheduler.startup();
    scheduler.tick().unwrap();

    assert!(batch_state.submitted_names.lock().unwrap().is_empty());
    assert_eq!(fallback_state.submitted_names.lock().unwrap().len(), 1);
    assert_eq!(scheduler.active_tasks()[0].status(), Status::SubmittedExec);
}

#[test]
fn incompatible_fallback_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut task = entry(1, "spawner", &[]);
    task.spawns_subprocesses = true;

    let registry = RunnerRegistry::with_runners(
        vec![("mock".to_string(), Box::new(MockRunner::new("mock").incompatible()))],
        "mock",
    );
    let reader = SharedReader::new();
    let mut scheduler = UnitScheduler::new(
        unit_options(dir.path(), "mock"),
        test_config(4, 2),
        &plan_of(vec![task]),
        Box::new(reader.clone()),
    )
    .unwrap()
    .with_registry(registry);
    scheduler.prepare_workdir().unwrap();

    scheduler.startup();
    let err = scheduler.tick().unwrap_err();
    assert!(err.is_fatal());
    assert!(err.to_string().contains("fallback runner"));
}

// --- Configuration errors abort before submission ---

#[test]
fn runner_configuration_errors_are_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockRunner::new("mock")
        .with_configuration_errors(vec!["queue <prod> is not available".to_string()]);
    let (mut scheduler, _reader, state) = build(dir.path(), vec![entry(1, "blast", &[])], 4, mock);

    scheduler.startup();
    let err = scheduler.tick().unwrap_err();
    assert!(err.is_fatal());
    assert!(state.submitted_names.lock().unwrap().is_empty());
}

// --- Malformed artifacts ---

#[test]
fn malformed_exec_abstract_errors_the_task() {
    let dir = tempfile::tempdir().unwrap();
    let (mut scheduler, reader, _state) =
        build(dir.path(), vec![entry(1, "blast", &[])], 4, MockRunner::new("mock"));

    scheduler.startup();
    scheduler.tick().unwrap();
    reader.add_dir(exec_dir(dir.path(), 1, "blast"));
    scheduler.tick().unwrap();
    reader.set_malformed_abstract(
        exec_abstract(dir.path(), 1, "blast"),
        "not a valid artifact document",
    );
    scheduler.tick().unwrap();

    assert_eq!(scheduler.retired_tasks()[0].status(), Status::Error);
}
