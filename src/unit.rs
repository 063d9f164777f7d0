use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::artifacts::{self, ArtifactReader, ArtifactState, ProgressArtifact};
use crate::config::MillConfig;
use crate::error::{MillError, MillResult};
use crate::graph;
use crate::job::{BoundRunner, JobPhase};
use crate::plan::TaskPlan;
use crate::runner::{ResourcePool, RunnerRegistry, SubmitRequest};
use crate::scheduler::{
    self, admission_count, refresh_liveness, write_wrapper, LivenessOutcome, LAUNCHERS_DIR,
};
use crate::stats;
use crate::status::Status;
use crate::task::{Task, SUMMARIES_DIR};
use crate::{log_debug, log_error, log_info};

/// Standard sub-directories of a unit working directory.
pub const SEQUENCES_DIR: &str = "sequences";
pub const LOGS_DIR: &str = "logs";

/// Options for one unit run (one chunk analysis).
#[derive(Debug, Clone)]
pub struct UnitOptions {
    pub workdir: PathBuf,
    pub sequence_path: PathBuf,
    pub plan_path: PathBuf,
    pub config_path: PathBuf,
    pub runner_name: String,
    pub report_progress: bool,
    pub kill_on_abort: bool,
}

/// Summary returned to the caller once the run is over.
#[derive(Debug)]
pub struct UnitSummary {
    pub status: Status,
    pub completed_tasks: u32,
    pub total_tasks: u32,
}

/// The task-tier scheduler: drives a dependency graph of tool invocations
/// through the runner abstraction, each task split into an execution and
/// an optional parsing submission.
pub struct UnitScheduler {
    config: MillConfig,
    registry: RunnerRegistry,
    pool: ResourcePool,
    reader: Box<dyn ArtifactReader>,
    options: UnitOptions,
    run_id: String,

    tasks: Vec<Task>,
    retired: Vec<Task>,
    total_tasks: u32,

    start_date: String,
    started: std::time::Instant,
    last_progress: String,
    /// Set once an abort is underway so later failures do not re-abort.
    aborting: bool,
    /// Terminal status imposed by an abort, unless a task error outranks it.
    forced_status: Option<Status>,
    kill_switch: bool,
}

impl UnitScheduler {
    pub fn new(
        options: UnitOptions,
        config: MillConfig,
        plan: &TaskPlan,
        reader: Box<dyn ArtifactReader>,
    ) -> MillResult<Self> {
        let registry = RunnerRegistry::from_config(&config);
        let tasks: Vec<Task> = plan
            .entries
            .iter()
            .map(|entry| Task::from_plan(entry, &options.runner_name))
            .collect();
        let total_tasks = tasks.len() as u32;
        let kill_switch = options.kill_on_abort;

        log_info!("Total number of tasks to execute: {}", total_tasks);
        if crate::log::enabled(crate::log::LogLevel::Debug) {
            for task in &tasks {
                log_debug!(
                    "{} | {} dependency(ies)",
                    task.description(),
                    task.dependencies.len()
                );
            }
        }

        Ok(Self {
            config,
            registry,
            pool: ResourcePool::default(),
            reader,
            options,
            run_id: scheduler::generate_run_id(),
            tasks,
            retired: Vec::new(),
            total_tasks,
            start_date: scheduler::now_rfc3339(),
            started: std::time::Instant::now(),
            last_progress: String::new(),
            aborting: false,
            forced_status: None,
            kill_switch,
        })
    }

    /// Swap in a pre-assembled registry (tests slot mock back-ends here).
    pub fn with_registry(mut self, registry: RunnerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn active_tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn retired_tasks(&self) -> &[Task] {
        &self.retired
    }

    pub fn is_aborting(&self) -> bool {
        self.aborting
    }

    /// Startup reconciliation plus one scheduling round, exposed so tests
    /// can drive the loop deterministically.
    pub fn startup(&mut self) {
        self.fast_forward_completed_tasks();
    }

    /// Poll the abort sentinel the way the main loop does between ticks.
    pub fn poll_abort_sentinel(&mut self) -> bool {
        self.check_user_abort()
    }

    /// Create the standard sub-directories and clear stale control files
    /// from an earlier attempt.
    pub fn prepare_workdir(&self) -> MillResult<()> {
        for dir in [LAUNCHERS_DIR, SUMMARIES_DIR, SEQUENCES_DIR, LOGS_DIR] {
            std::fs::create_dir_all(self.options.workdir.join(dir))?;
        }
        artifacts::remove_stale_control_files(&self.options.workdir);
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        let secs = self
            .config
            .runners
            .get(&self.options.runner_name)
            .map(|r| r.monitoring_interval_secs)
            .unwrap_or(5);
        Duration::from_secs(secs)
    }

    // --- Main loop ---

    pub async fn run(&mut self, cancel: &CancellationToken) -> MillResult<UnitSummary> {
        self.fast_forward_completed_tasks();

        while !self.tasks.is_empty() {
            if cancel.is_cancelled() {
                self.abort_run("an interruption request was received", Status::Canceled);
                break;
            }

            // An unexpected failure inside a tick converts into a full
            // abort unless one is already underway.
            if let Err(e) = self.tick() {
                if self.aborting {
                    break;
                }
                self.abort_run(&format!("an unexpected error occurred ({})", e), Status::Error);
                break;
            }

            if self.aborting {
                break;
            }

            if !self.tasks.is_empty() {
                if self.check_user_abort() {
                    break;
                }
                tokio::time::sleep(self.poll_interval()).await;
            }
        }

        self.finalize()
    }

    /// One scheduling round: refresh, advance phases, retire, admit,
    /// submit, report.
    pub fn tick(&mut self) -> MillResult<()> {
        self.refresh_statuses()?;
        self.advance_exec_finished_tasks()?;
        self.retire_terminal_tasks();
        self.submit_eligible_pending()?;
        if self.options.report_progress {
            self.update_progress_artifact();
        }
        Ok(())
    }

    // --- Startup reconciliation ---

    /// Fast-forward tasks whose abstract documents already report success,
    /// so a restarted unit never resubmits finished work.
    fn fast_forward_completed_tasks(&mut self) {
        let workdir = self.options.workdir.clone();
        for task in &mut self.tasks {
            let exec_doc = match self
                .reader
                .read_task_abstract(&task.exec_abstract_path(&workdir))
            {
                ArtifactState::Ready(doc) => doc,
                _ => continue,
            };
            if !task.absorb_exec_abstract(&exec_doc, true) {
                continue;
            }
            log_info!(
                "Execution step for {} has already been done",
                task.description()
            );
            if task.need_parsing {
                task.state.status = Status::FinishedExec;
                if let ArtifactState::Ready(parsing_doc) = self
                    .reader
                    .read_task_abstract(&task.parsing_abstract_path(&workdir))
                {
                    if task.absorb_parsing_abstract(&parsing_doc, true) {
                        log_info!(
                            "Parsing step for {} has already been done",
                            task.description()
                        );
                        task.state.status = Status::Completed;
                    }
                }
            } else {
                task.state.status = Status::Completed;
            }
        }
    }

    // --- Tick stages ---

    fn refresh_statuses(&mut self) -> MillResult<()> {
        let workdir = self.options.workdir.clone();
        log_debug!("Current status of uncompleted tasks:");

        for index in 0..self.tasks.len() {
            let (status, description) = {
                let task = &self.tasks[index];
                (task.status(), task.description())
            };
            log_debug!("Status for {} is: {}", description, status);

            match status {
                Status::Pending => continue,
                Status::SubmittedExec => {
                    let exec_dir = workdir.join(self.tasks[index].exec_dir_name());
                    if self.reader.dir_exists(&exec_dir) {
                        self.tasks[index].state.transition(Status::RunningExec).ok();
                    } else {
                        self.refresh_task_liveness(index)?;
                    }
                }
                Status::SubmittedParsing => {
                    let parsing_dir = workdir.join(self.tasks[index].parsing_dir_name());
                    if self.reader.dir_exists(&parsing_dir) {
                        self.tasks[index]
                            .state
                            .transition(Status::RunningParsing)
                            .ok();
                    } else {
                        self.refresh_task_liveness(index)?;
                    }
                }
                Status::RunningExec => {
                    let path = self.tasks[index].exec_abstract_path(&workdir);
                    match self.reader.read_task_abstract(&path) {
                        ArtifactState::Ready(doc) => {
                            self.release_task_runner(index);
                            let task = &mut self.tasks[index];
                            if task.absorb_exec_abstract(&doc, false) {
                                task.state.transition(Status::FinishedExec).ok();
                            }
                        }
                        ArtifactState::Malformed(message) => {
                            self.release_task_runner(index);
                            let task = &mut self.tasks[index];
                            let description = task.description();
                            task.state.set_error(&description, message);
                        }
                        ArtifactState::NotReady => {
                            self.refresh_task_liveness(index)?;
                        }
                    }
                }
                Status::RunningParsing => {
                    let path = self.tasks[index].parsing_abstract_path(&workdir);
                    match self.reader.read_task_abstract(&path) {
                        ArtifactState::Ready(doc) => {
                            self.release_task_runner(index);
                            let task = &mut self.tasks[index];
                            if task.absorb_parsing_abstract(&doc, false) {
                                task.state.transition(Status::Completed).ok();
                            }
                        }
                        ArtifactState::Malformed(message) => {
                            self.release_task_runner(index);
                            let task = &mut self.tasks[index];
                            let description = task.description();
                            task.state.set_error(&description, message);
                        }
                        ArtifactState::NotReady => {
                            self.refresh_task_liveness(index)?;
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn refresh_task_liveness(&mut self, index: usize) -> MillResult<()> {
        let (runner_name, description) = {
            let task = &self.tasks[index];
            match &task.state.bound {
                Some(bound) => (bound.runner_name.clone(), task.description()),
                None => return Ok(()),
            }
        };
        let runner = self.registry.get(&runner_name)?;
        let runner_config = runner.config();
        let interval = Duration::from_secs(runner_config.liveness_interval_secs());
        let max_failed = runner_config.max_failed_liveness_checks;

        let outcome = refresh_liveness(
            &mut self.tasks[index].state,
            runner,
            &description,
            interval,
            max_failed,
        )?;
        if outcome == LivenessOutcome::Errored {
            self.release_task_runner(index);
        }
        Ok(())
    }

    /// Move exec-finished tasks forward: submit the parsing phase when the
    /// execution abstract asked for one, complete the task otherwise.
    fn advance_exec_finished_tasks(&mut self) -> MillResult<()> {
        for index in 0..self.tasks.len() {
            if self.tasks[index].status() != Status::FinishedExec {
                continue;
            }
            if self.tasks[index].need_parsing {
                self.try_submit_phase(index, JobPhase::Parsing)?;
            } else {
                log_debug!(
                    "The output of {} does not need to be parsed, task is complete",
                    self.tasks[index].description()
                );
                self.tasks[index].state.transition(Status::Completed).ok();
            }
        }
        Ok(())
    }

    /// Retirement: terminal tasks propagate dependency satisfaction, then
    /// failures cascade, then every terminal task leaves the active set.
    fn retire_terminal_tasks(&mut self) {
        let mut completed_ids: Vec<u32> = Vec::new();
        let mut failed: Vec<(u32, String)> = Vec::new();

        for index in 0..self.tasks.len() {
            let status = self.tasks[index].status();
            if !status.is_terminal() {
                continue;
            }
            self.release_task_runner(index);
            let task = &self.tasks[index];
            match status {
                Status::Completed => {
                    log_info!("{} is completed", task.description());
                    completed_ids.push(task.id);
                }
                Status::Error => {
                    failed.push((task.id, format!("{} failed", task.description())));
                }
                Status::Canceled => {
                    log_info!("{} is canceled", task.description());
                    failed.push((task.id, format!("{} was canceled", task.description())));
                }
                _ => {}
            }
        }

        // Same-tick ordering: completions are visible to this tick's
        // admission decision, and propagation precedes cascade evaluation.
        for id in &completed_ids {
            graph::mark_dependency_satisfied(&mut self.tasks, *id);
        }
        for (id, reason) in &failed {
            graph::cancel_dependents_of(&mut self.tasks, *id, reason);
        }

        let mut index = 0;
        while index < self.tasks.len() {
            if self.tasks[index].status().is_terminal() {
                let task = self.tasks.remove(index);
                self.retired.push(task);
            } else {
                index += 1;
            }
        }
    }

    fn submit_eligible_pending(&mut self) -> MillResult<()> {
        let live = self.tasks.iter().filter(|t| t.status().is_live()).count() as u32;
        let eligible = self
            .tasks
            .iter()
            .filter(|t| t.status() == Status::Pending && graph::is_eligible(t))
            .count() as u32;
        let mut budget = admission_count(self.config.global.max_parallel_tasks, live, eligible);

        for index in 0..self.tasks.len() {
            if budget == 0 {
                break;
            }
            // Eligibility is re-checked immediately before every attempt;
            // a same-tick cascade may have canceled the task since the
            // budget was computed.
            if self.tasks[index].status() != Status::Pending
                || !graph::is_eligible(&self.tasks[index])
            {
                continue;
            }
            if self.try_submit_phase(index, JobPhase::Execution)? {
                budget -= 1;
            }
        }
        Ok(())
    }

    // --- Runner binding & submission ---

    /// Select a runner for the task, swapping once to the configured
    /// fallback when the preferred back-end is incompatible. A fallback
    /// that is itself incompatible aborts the run.
    fn select_runner_name(&mut self, index: usize) -> MillResult<String> {
        loop {
            let name = self.tasks[index].runner_name.clone();
            let runner = self.registry.get(&name)?;
            if runner.is_compatible_with(self.tasks[index].spawns_subprocesses) {
                return Ok(name);
            }
            if name == self.registry.fallback {
                return Err(MillError::Config(format!(
                    "unsupported case: the fallback runner ({}) is not compatible with {}",
                    name,
                    self.tasks[index].description()
                )));
            }
            log_info!(
                "Selected runner ({}) is not compatible with {}, switching to the fallback \
                 runner <{}>",
                name,
                self.tasks[index].description(),
                self.registry.fallback
            );
            let fallback = self.registry.fallback.clone();
            self.tasks[index].runner_name = fallback;
        }
    }

    /// Bind a runner and submit one phase of a task. Returns whether a
    /// submission actually happened (capacity shortage is not an error).
    fn try_submit_phase(&mut self, index: usize, phase: JobPhase) -> MillResult<bool> {
        let runner_name = self.select_runner_name(index)?;

        // Configuration problems abort the whole run before any further
        // submission; transient submission failures stay job-local.
        self.registry.ensure_configuration_ok(&runner_name)?;

        // Pending tasks charge their configured core count, a task between
        // phases charges a single parsing slot.
        let threads = {
            let runner_config = self.registry.get(&runner_name)?.config();
            self.tasks[index]
                .threads_based_on_status()
                .min(runner_config.max_threads_per_tool)
                .max(1)
        };

        {
            let runner = self.registry.get(&runner_name)?;
            if !runner.is_computing_power_available(&self.pool, threads) {
                return Ok(false);
            }
        }

        let launchers_dir = self.options.workdir.join(LAUNCHERS_DIR);
        let job_name = format!(
            "{}_{:03}_{}_{}",
            self.run_id,
            self.tasks[index].id,
            phase.as_str(),
            self.tasks[index].tool
        );
        let wrapper_path = launchers_dir.join(format!("{}.{}.sh", job_name, runner_name));
        let command_line = self.launcher_command_line(index, phase)?;
        write_wrapper(&wrapper_path, &command_line)?;

        let description = self.tasks[index].description();
        let runner = self.registry.get(&runner_name)?;
        log_info!(
            "Submitting {} job for {} (runner: {})",
            phase.as_str(),
            description,
            runner.describe(threads)
        );

        let request = SubmitRequest {
            job_name,
            wrapper_path,
            submit_dir: launchers_dir,
            threads,
        };

        match runner.submit(&request) {
            Ok(handle) => {
                log_debug!("{} native job id is: {}", description, handle.native_id);
                runner.after_submission(&mut self.pool, threads);
                let task = &mut self.tasks[index];
                task.state.bind(
                    BoundRunner {
                        runner_name: runner_name.clone(),
                        phase,
                        handle,
                        charged_threads: threads,
                    },
                    scheduler::now_rfc3339(),
                );
                let next = match phase {
                    JobPhase::Parsing => Status::SubmittedParsing,
                    _ => Status::SubmittedExec,
                };
                task.state.transition(next).map_err(MillError::Internal)?;
                Ok(true)
            }
            Err(e) if e.is_retryable() => {
                let max_failed = runner.config().max_failed_submissions;
                let task = &mut self.tasks[index];
                let failures = task.state.record_submission_failure();
                log_info!(
                    "Submission failed for {} ({}/{} failures): {}",
                    description,
                    failures,
                    max_failed,
                    e
                );
                if failures >= max_failed {
                    task.state.set_error(
                        &description,
                        "the maximum number of failed submissions has been reached",
                    );
                }
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Command line of the external launcher wrapped in the job script.
    fn launcher_command_line(&self, index: usize, phase: JobPhase) -> MillResult<String> {
        let task = &self.tasks[index];
        let sequence_path = if phase == JobPhase::Execution && task.sequence != "initial" {
            self.options
                .workdir
                .join(SEQUENCES_DIR)
                .join(&task.sequence)
        } else {
            self.options.sequence_path.clone()
        };

        let mut command = match phase {
            JobPhase::Parsing => {
                let file_to_parse = task.file_to_parse.as_ref().ok_or_else(|| {
                    MillError::Internal(format!(
                        "parsing requested for {} without a recorded output file",
                        task.description()
                    ))
                })?;
                format!(
                    "{} --file-to-parse {}",
                    self.config.global.parser_launcher, file_to_parse
                )
            }
            _ => self.config.global.tool_launcher.clone(),
        };

        command.push_str(&format!(" --plan {}", self.options.plan_path.display()));
        command.push_str(&format!(" --sequence {}", sequence_path.display()));
        command.push_str(&format!(" --config {}", self.options.config_path.display()));
        command.push_str(&format!(" --workdir {}", self.options.workdir.display()));
        command.push_str(&format!(" --task-id {}", task.id));

        log_debug!("Generated launcher command line: {}", command);
        Ok(command)
    }

    fn release_task_runner(&mut self, index: usize) {
        let Some(bound) = self.tasks[index].state.bound.clone() else {
            return;
        };
        if let Ok(runner) = self.registry.get(&bound.runner_name) {
            runner.after_completion(&mut self.pool, bound.charged_threads);
        }
        self.tasks[index].state.unbind();

        // Execution through the fallback runner is an exception, not the
        // new default: the next phase retries the preferred runner.
        if self.tasks[index].runner_name != self.options.runner_name {
            log_info!(
                "Switching {} back to the default runner: {}",
                self.tasks[index].description(),
                self.options.runner_name
            );
            self.tasks[index].runner_name = self.options.runner_name.clone();
        }
    }

    // --- Abort & progress ---

    /// True when the abort sentinel is present; triggers the cascade abort.
    fn check_user_abort(&mut self) -> bool {
        match self.reader.read_abort(&self.options.workdir) {
            Some(request) => {
                if request.kill {
                    self.kill_switch = true;
                }
                if self.options.report_progress {
                    self.update_progress_artifact();
                }
                self.abort_run(
                    "an abort sentinel has been detected in the main execution folder",
                    Status::Canceled,
                );
                true
            }
            None => false,
        }
    }

    /// Abort the whole run: the reason is logged before any cancellation
    /// or kill side effect.
    fn abort_run(&mut self, reason: &str, final_status: Status) {
        if self.aborting {
            return;
        }
        log_error!("{}", reason);
        log_info!("The unit execution will now be aborted");
        self.aborting = true;
        self.forced_status = Some(final_status);

        for index in 0..self.tasks.len() {
            let status = self.tasks[index].status();
            if !status.is_live() {
                // Pending tasks, and tasks sitting between their two
                // phases, cancel without any external side effect.
                if !status.is_terminal() {
                    self.tasks[index].state.cancel(reason.to_string());
                }
                continue;
            }
            let Some(bound) = self.tasks[index].state.bound.clone() else {
                continue;
            };
            let description = self.tasks[index].description();
            if self.kill_switch {
                log_info!("{} will now be killed", description);
                if let Ok(runner) = self.registry.get(&bound.runner_name) {
                    runner.kill(&bound.handle, &description);
                }
                self.tasks[index].state.cancel(reason.to_string());
                self.release_task_runner(index);
            } else {
                log_info!(
                    "To abort {}, please run the command: {}",
                    description,
                    bound.handle.kill_command
                );
                self.tasks[index].state.cancel(reason.to_string());
                self.release_task_runner(index);
            }
        }

        self.retire_terminal_tasks();
    }

    fn update_progress_artifact(&mut self) {
        let completed = self.retired.len() as u32;
        let current = format!("{}/{}", completed, self.total_tasks);
        if current == self.last_progress {
            return;
        }
        self.last_progress = current;

        let percent = if self.total_tasks == 0 {
            100
        } else {
            completed * 100 / self.total_tasks
        };
        let artifact = ProgressArtifact {
            completed_tasks: completed,
            total_tasks: self.total_tasks,
            percent,
            report_date: scheduler::now_rfc3339(),
        };
        if let Err(e) = artifacts::write_progress(&self.options.workdir, &artifact) {
            log_error!("Could not update the progress artifact: {}", e);
        }
    }

    // --- Finalization ---

    /// Aggregate the statistics, decide the run's terminal status and
    /// write the finished artifact the outer tier polls for.
    fn finalize(&mut self) -> MillResult<UnitSummary> {
        let exec_samples: Vec<stats::PhaseSample> =
            self.retired.iter().filter_map(|t| t.exec_sample).collect();
        let parsing_samples: Vec<stats::PhaseSample> = self
            .retired
            .iter()
            .filter_map(|t| t.parsing_sample)
            .collect();
        let times = stats::aggregate_times(&exec_samples, &parsing_samples);

        let any_error = self.retired.iter().any(|t| t.status() == Status::Error);
        let any_canceled = self.retired.iter().any(|t| t.status() == Status::Canceled);
        let status = if any_error {
            Status::Error
        } else if let Some(forced) = self.forced_status {
            forced
        } else if any_canceled {
            Status::Canceled
        } else {
            Status::Completed
        };

        let completed_tasks = self
            .retired
            .iter()
            .filter(|t| t.status() == Status::Completed)
            .count() as u32;

        log_info!(
            "Analysis timing report (seconds): execution cpu sum {:.1}, parsing cpu sum {:.1}, \
             total real sum {:.1}",
            times.execution.cpu.sum,
            times.parsing.cpu.sum,
            times.total.real.sum
        );

        let finished = artifacts::FinishedArtifact {
            status: status.to_string(),
            start_date: self.start_date.clone(),
            end_date: scheduler::now_rfc3339(),
            elapsed_secs: self.started.elapsed().as_secs_f64(),
            times: Some(times),
        };
        artifacts::write_finished(&self.options.workdir, &finished)?;

        Ok(UnitSummary {
            status,
            completed_tasks,
            total_tasks: self.total_tasks,
        })
    }
}
