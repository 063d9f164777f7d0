use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::artifacts::{ArtifactReader, ArtifactState};
use crate::config::{self, MillConfig};
use crate::db::{RunParameters, Store};
use crate::error::{MillError, MillResult};
use crate::instance::{directory_tree_size, Instance};
use crate::job::{BoundRunner, JobPhase};
use crate::plan;
use crate::runner::{ResourcePool, RunnerRegistry, SubmitRequest};
use crate::scheduler::{self, admission_count, refresh_liveness, write_wrapper, LAUNCHERS_DIR};
use crate::status::Status;
use crate::{log_debug, log_error, log_info, log_warn};

/// Options for a fresh `run` of the instance tier.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub workdir: PathBuf,
    pub sequence_path: PathBuf,
    pub chunks_path: PathBuf,
    pub plan_path: PathBuf,
    pub config_path: PathBuf,
    pub instance_runner: String,
    pub task_runner: String,
    pub kill_on_abort: bool,
    pub ignore_original_masking: bool,
}

/// Why the instance loop stopped.
#[derive(Debug, PartialEq, Eq)]
pub enum HaltReason {
    AllInstancesRetired,
    Aborted,
}

#[derive(Debug)]
pub struct PipelineSummary {
    pub completed: u32,
    pub errored: u32,
    pub canceled: u32,
    pub halt_reason: HaltReason,
}

/// SHA-256 of a file, hex encoded. Guards the global plan and config
/// files against silent edits between `run` and `resume`.
pub fn file_checksum(path: &Path) -> MillResult<String> {
    let contents = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&contents);
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{:02x}", byte));
    }
    Ok(hex)
}

/// Checksum of a file that is allowed to be absent (the configuration
/// file falls back to built-in defaults when missing).
fn checksum_if_present(path: &Path) -> MillResult<String> {
    if path.exists() {
        file_checksum(path)
    } else {
        Ok(String::new())
    }
}

/// The instance-tier scheduler: one job per sequence chunk, each job being
/// a full unit run in a separate process, observed through its progress
/// and finished artifacts and persisted in the embedded store.
pub struct PipelineScheduler {
    config: MillConfig,
    registry: RunnerRegistry,
    pool: ResourcePool,
    reader: Box<dyn ArtifactReader>,
    store: Store,
    parameters: RunParameters,
    instances: Vec<Instance>,
    retired_counts: (u32, u32, u32),
    aborting: bool,
    kill_switch: bool,
}

impl std::fmt::Debug for PipelineScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineScheduler")
            .field("parameters", &self.parameters)
            .field("instances", &self.instances.len())
            .field("retired_counts", &self.retired_counts)
            .field("aborting", &self.aborting)
            .field("kill_switch", &self.kill_switch)
            .finish_non_exhaustive()
    }
}

impl PipelineScheduler {
    // --- Mode preparation ---

    /// Plan-time setup of a fresh run: validate the runner selection,
    /// register every chunk as a pending instance row, and capture the
    /// run parameters before any submission.
    pub fn prepare_run(
        options: RunOptions,
        config: MillConfig,
        reader: Box<dyn ArtifactReader>,
    ) -> MillResult<Self> {
        config::validate_runner_selection(&config, &options.instance_runner, &options.task_runner)
            .map_err(|errors| MillError::Config(errors.join("; ")))?;

        let chunks = plan::load_chunk_manifest(&options.chunks_path)?;
        // Loading the plan here surfaces plan problems before anything is
        // registered, even though only unit processes consume it.
        plan::load_plan(&options.plan_path)?;

        let mut store = Store::open(&options.workdir)?;
        if !store.is_fresh()? {
            return Err(MillError::Config(format!(
                "the store in {} already holds a run; use resume or retry",
                options.workdir.display()
            )));
        }

        let instances: Vec<Instance> = chunks
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| Instance::new(index as u32 + 1, chunk))
            .collect();

        let monitoring_interval_secs = config
            .runners
            .get(&options.instance_runner)
            .map(|r| r.monitoring_interval_secs)
            .unwrap_or(30);

        let parameters = RunParameters {
            run_id: scheduler::generate_run_id(),
            sequence_path: options.sequence_path.display().to_string(),
            plan_path: options.plan_path.display().to_string(),
            config_path: options.config_path.display().to_string(),
            workdir: options.workdir.display().to_string(),
            instance_runner: options.instance_runner.clone(),
            task_runner: options.task_runner.clone(),
            max_parallel_instances: config.global.max_parallel_instances,
            monitoring_interval_secs,
            kill_on_abort: options.kill_on_abort,
            ignore_masking: options.ignore_original_masking,
            plan_checksum: file_checksum(&options.plan_path)?,
            config_checksum: checksum_if_present(&options.config_path)?,
        };

        store.save_parameters(&parameters)?;
        store.register_instances(&instances)?;
        std::fs::create_dir_all(options.workdir.join(LAUNCHERS_DIR))?;

        let registry = RunnerRegistry::from_config(&config);
        let kill_switch = options.kill_on_abort;
        Ok(Self {
            config,
            registry,
            pool: ResourcePool::default(),
            reader,
            store,
            parameters,
            instances,
            retired_counts: (0, 0, 0),
            aborting: false,
            kill_switch,
        })
    }

    /// Reload a halted run: non-terminal rows come back into the active
    /// set, already-submitted ones with their runner handle rebound from
    /// the persisted monitoring and kill commands.
    pub fn prepare_resume(
        workdir: &Path,
        config: MillConfig,
        reader: Box<dyn ArtifactReader>,
    ) -> MillResult<Self> {
        let store = Store::open(workdir)?;
        let parameters = store.load_parameters()?;
        verify_global_files(&parameters)?;

        let instances = store.load_instances(&parameters.instance_runner)?;
        let registry = RunnerRegistry::from_config(&config);
        let kill_switch = parameters.kill_on_abort;
        Ok(Self {
            config,
            registry,
            pool: ResourcePool::default(),
            reader,
            store,
            parameters,
            instances,
            retired_counts: (0, 0, 0),
            aborting: false,
            kill_switch,
        })
    }

    /// Retry failed or canceled instances: archive each one's directory,
    /// rewrite its row as a fresh pending entry, then resume.
    pub fn prepare_retry(
        workdir: &Path,
        config: MillConfig,
        reader: Box<dyn ArtifactReader>,
    ) -> MillResult<Self> {
        let store = Store::open(workdir)?;
        let parameters = store.load_parameters()?;
        verify_global_files(&parameters)?;

        for instance in store.load_instances(&parameters.instance_runner)? {
            if !matches!(instance.status(), Status::Error | Status::Canceled) {
                continue;
            }
            let directory = instance
                .directory
                .clone()
                .unwrap_or_else(|| instance.directory_under(workdir));
            let backup = PathBuf::from(format!("{}.backup", directory.display()));
            if backup.exists() {
                log_warn!(
                    "The backup of {} already exists and will be replaced; make sure the \
                     reported errors were investigated",
                    instance.description()
                );
                let _ = std::fs::remove_dir_all(&backup);
            }
            if directory.is_dir() {
                std::fs::rename(&directory, &backup)?;
            }
            store.reset_instance_for_retry(instance.id, &backup)?;
        }

        let instances = store.load_instances(&parameters.instance_runner)?;
        let registry = RunnerRegistry::from_config(&config);
        let kill_switch = parameters.kill_on_abort;
        Ok(Self {
            config,
            registry,
            pool: ResourcePool::default(),
            reader,
            store,
            parameters,
            instances,
            retired_counts: (0, 0, 0),
            aborting: false,
            kill_switch,
        })
    }

    /// Swap in a pre-assembled registry (tests slot mock back-ends here).
    pub fn with_registry(mut self, registry: RunnerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn active_instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn is_aborting(&self) -> bool {
        self.aborting
    }

    /// Startup reconciliation, exposed so tests can drive the loop
    /// deterministically.
    pub fn startup(&mut self) {
        self.reconcile_on_startup();
    }

    /// Poll the abort sentinel the way the main loop does between ticks.
    pub fn poll_abort_sentinel(&mut self) {
        self.check_user_abort();
    }

    fn workdir(&self) -> PathBuf {
        PathBuf::from(&self.parameters.workdir)
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.parameters.monitoring_interval_secs)
    }

    // --- Main loop ---

    pub async fn run(&mut self, cancel: &CancellationToken) -> MillResult<PipelineSummary> {
        self.reconcile_on_startup();
        self.display_status_counters();

        while !self.instances.is_empty() {
            if cancel.is_cancelled() && !self.aborting {
                self.abort_all_instances("an interruption request was received");
            }

            if let Err(e) = self.tick() {
                if e.is_fatal() && !self.aborting {
                    self.abort_all_instances(&e.to_string());
                } else if !self.aborting {
                    self.abort_all_instances(&format!("an unexpected error occurred ({})", e));
                }
            }

            if !self.instances.is_empty() {
                if !self.aborting {
                    self.check_user_abort();
                }
                tokio::time::sleep(self.poll_interval()).await;
            }
        }

        let (completed, errored, canceled) = self.retired_counts;
        Ok(PipelineSummary {
            completed,
            errored,
            canceled,
            halt_reason: if self.aborting {
                HaltReason::Aborted
            } else {
                HaltReason::AllInstancesRetired
            },
        })
    }

    pub fn tick(&mut self) -> MillResult<()> {
        self.refresh_statuses()?;
        self.retire_finished_instances();
        if !self.aborting {
            self.submit_pending_instances()?;
        }
        Ok(())
    }

    // --- Startup reconciliation ---

    /// Align the reloaded active set with reality: drop rows that were
    /// already terminal, retire instances that finished while the
    /// scheduler was down, and flag pending rows whose directory has
    /// content from a crashed submission attempt.
    fn reconcile_on_startup(&mut self) {
        let workdir = self.workdir();
        let mut index = 0;
        while index < self.instances.len() {
            let instance = &mut self.instances[index];

            if instance.status().is_terminal() {
                log_info!(
                    "The execution of {} was already over during a previous run",
                    instance.description()
                );
                self.instances.remove(index);
                continue;
            }

            if let Some(dir) = instance.directory.clone() {
                if let ArtifactState::Ready(doc) = self.reader.read_finished(&dir) {
                    log_info!(
                        "The execution of {} has finished since the previous run",
                        instance.description()
                    );
                    instance.absorb_finished(doc);
                    index += 1;
                    continue;
                }
            }

            if instance.status() == Status::Pending {
                let probable_dir = instance.directory_under(&workdir);
                let has_content = std::fs::read_dir(&probable_dir)
                    .map(|mut entries| entries.next().is_some())
                    .unwrap_or(false);
                if has_content {
                    // A previous process crashed mid-submission: the row
                    // says pending but work exists on disk with no handle
                    // to monitor it by.
                    let description = instance.description();
                    instance.state.set_error(
                        &description,
                        format!(
                            "the directory {} already has content but no submission was \
                             recorded; inspect it, then use retry to rerun this chunk",
                            probable_dir.display()
                        ),
                    );
                }
            }
            index += 1;
        }
    }

    // --- Tick stages ---

    fn refresh_statuses(&mut self) -> MillResult<()> {
        for index in 0..self.instances.len() {
            let (status, description) = {
                let instance = &self.instances[index];
                (instance.status(), instance.description())
            };
            log_debug!("Status for {} is: {}", description, status);

            match status {
                Status::Pending => continue,
                Status::Submitted => {
                    let promoted = match &self.instances[index].directory {
                        Some(dir) => {
                            self.reader.dir_exists(dir)
                                && !matches!(
                                    self.reader.read_progress(dir),
                                    ArtifactState::NotReady
                                )
                        }
                        None => false,
                    };
                    if promoted {
                        self.instances[index].state.transition(Status::Running).ok();
                        let _ = self.store.update_during_monitoring(
                            self.instances[index].id,
                            Status::Running,
                            0,
                        );
                    } else {
                        self.refresh_instance_liveness(index)?;
                    }
                }
                Status::Running => {
                    let dir = match self.instances[index].directory.clone() {
                        Some(dir) => dir,
                        None => continue,
                    };
                    match self.reader.read_finished(&dir) {
                        ArtifactState::Ready(doc) => {
                            self.instances[index].absorb_finished(doc);
                        }
                        ArtifactState::Malformed(message) => {
                            let description = self.instances[index].description();
                            self.instances[index].state.set_error(&description, message);
                        }
                        ArtifactState::NotReady => {
                            if let ArtifactState::Ready(progress) = self.reader.read_progress(&dir)
                            {
                                self.instances[index].progress = progress.percent;
                            }
                            // A lossy snapshot: a failed write is retried
                            // naturally on the next tick.
                            let _ = self.store.update_during_monitoring(
                                self.instances[index].id,
                                Status::Running,
                                self.instances[index].progress,
                            );
                            self.refresh_instance_liveness(index)?;
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn refresh_instance_liveness(&mut self, index: usize) -> MillResult<()> {
        let (runner_name, description) = {
            let instance = &self.instances[index];
            match &instance.state.bound {
                Some(bound) => (bound.runner_name.clone(), instance.description()),
                None => return Ok(()),
            }
        };
        let runner = self.registry.get(&runner_name)?;
        let runner_config = runner.config();
        let interval = Duration::from_secs(runner_config.liveness_interval_secs());
        let max_failed = runner_config.max_failed_liveness_checks;

        refresh_liveness(
            &mut self.instances[index].state,
            runner,
            &description,
            interval,
            max_failed,
        )?;
        Ok(())
    }

    /// Retirement: terminal instances run their teardown, update the
    /// store (row + aggregate statistics) and leave the active set.
    fn retire_finished_instances(&mut self) {
        let mut index = 0;
        while index < self.instances.len() {
            if !self.instances[index].status().is_terminal() {
                index += 1;
                continue;
            }

            self.release_instance_runner(index);
            let mut instance = self.instances.remove(index);
            log_info!(
                "{} is finished, exit status is: {}",
                instance.description(),
                instance.status()
            );

            if let Some(dir) = &instance.directory {
                instance.directory_size = directory_tree_size(dir);
            }
            if instance.status() == Status::Completed {
                instance.progress = 100;
            }
            if let Err(e) = self.store.update_at_completion(&instance) {
                log_error!(
                    "Could not persist the completion of {}: {}",
                    instance.description(),
                    e
                );
            }

            if let Some(times) = instance.finished.as_ref().and_then(|f| f.times) {
                let disk = instance.directory_size.unwrap_or(0);
                if let Err(e) =
                    self.store
                        .add_completion_stats(times.total.cpu.sum, times.total.real.sum, disk)
                {
                    log_error!("Could not update the aggregate statistics: {}", e);
                }
            }

            // A successful retry no longer needs the previous attempt.
            if instance.status() == Status::Completed {
                if let Some(backup) = &instance.backup_archive {
                    if backup.exists() {
                        let _ = std::fs::remove_dir_all(backup);
                    }
                }
            }

            match instance.status() {
                Status::Completed => self.retired_counts.0 += 1,
                Status::Error => self.retired_counts.1 += 1,
                Status::Canceled => self.retired_counts.2 += 1,
                _ => {}
            }
        }
    }

    fn submit_pending_instances(&mut self) -> MillResult<()> {
        let live = self
            .instances
            .iter()
            .filter(|i| i.status().is_live())
            .count() as u32;
        let eligible = self
            .instances
            .iter()
            .filter(|i| i.status() == Status::Pending)
            .count() as u32;
        let mut budget = admission_count(
            self.parameters.max_parallel_instances,
            live,
            eligible,
        );
        if budget > 0 {
            self.display_status_counters();
            log_debug!("Up to {} new instance(s) may be submitted this turn", budget);
        }

        for index in 0..self.instances.len() {
            if budget == 0 {
                break;
            }
            if self.instances[index].status() != Status::Pending {
                continue;
            }
            if self.submit_instance(index)? {
                budget -= 1;
            }
        }
        Ok(())
    }

    /// Prepare one chunk's directory and input file, then submit its unit
    /// job. Returns whether a submission actually happened.
    fn submit_instance(&mut self, index: usize) -> MillResult<bool> {
        let workdir = self.workdir();
        let runner_name = self.parameters.instance_runner.clone();

        // Fatal on configuration problems; the whole run aborts before any
        // further submission (the caller maps the error).
        self.registry.ensure_configuration_ok(&runner_name)?;

        {
            let runner = self.registry.get(&runner_name)?;
            if !runner.is_computing_power_available(&self.pool, 1) {
                return Ok(false);
            }
        }

        // Working directory and chunk FASTA, created idempotently so a
        // retried submission reuses them.
        let directory = self.instances[index].directory_under(&workdir);
        std::fs::create_dir_all(&directory)?;
        let fasta_path = directory.join(format!(
            "{}.fasta",
            self.instances[index].chunk.chunk_name
        ));
        if !fasta_path.exists() {
            plan::write_chunk_fasta(
                Path::new(&self.parameters.sequence_path),
                &self.instances[index].chunk,
                &fasta_path,
                self.parameters.ignore_masking,
            )?;
        }
        self.instances[index].directory = Some(directory.clone());
        self.instances[index].fasta_path = Some(fasta_path.clone());

        let launchers_dir = workdir.join(LAUNCHERS_DIR);
        let job_name = format!(
            "{}_{}_analysis",
            self.parameters.run_id, self.instances[index].chunk.chunk_name
        );
        let wrapper_path = launchers_dir.join(format!("{}.{}.sh", job_name, runner_name));
        let command_line = self.unit_command_line(&directory, &fasta_path);
        write_wrapper(&wrapper_path, &command_line)?;

        let description = self.instances[index].description();
        let runner = self.registry.get(&runner_name)?;
        log_info!(
            "Submitting a new unit job for {} (runner: {})",
            description,
            runner.describe(1)
        );

        let request = SubmitRequest {
            job_name,
            wrapper_path,
            submit_dir: launchers_dir,
            threads: 1,
        };

        match runner.submit(&request) {
            Ok(handle) => {
                log_debug!("{} native job id is: {}", description, handle.native_id);
                runner.after_submission(&mut self.pool, 1);
                let instance = &mut self.instances[index];
                instance.state.bind(
                    BoundRunner {
                        runner_name: runner_name.clone(),
                        phase: JobPhase::Unit,
                        handle,
                        charged_threads: 1,
                    },
                    scheduler::now_rfc3339(),
                );
                instance
                    .state
                    .transition(Status::Submitted)
                    .map_err(MillError::Internal)?;
                self.store.update_at_submission(&self.instances[index])?;
                Ok(true)
            }
            Err(e) if e.is_retryable() => {
                let max_failed = runner.config().max_failed_submissions;
                let instance = &mut self.instances[index];
                let failures = instance.state.record_submission_failure();
                log_info!(
                    "Submission failed for {} ({}/{} failures): {}",
                    description,
                    failures,
                    max_failed,
                    e
                );
                if failures >= max_failed {
                    instance.state.set_error(
                        &description,
                        "the maximum number of failed submissions has been reached",
                    );
                }
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Command line launching the inner task scheduler for one chunk.
    fn unit_command_line(&self, directory: &Path, fasta_path: &Path) -> String {
        let mut command = format!(
            "{} unit --sequence {} --tasks {} --config {} --workdir {} --runner {} --progress",
            self.config.global.unit_command,
            fasta_path.display(),
            self.parameters.plan_path,
            self.parameters.config_path,
            directory.display(),
            self.parameters.task_runner,
        );
        if self.parameters.kill_on_abort {
            command.push_str(" --kill-on-abort");
        }
        // A locally launched unit shares the terminal's process group; it
        // must ignore Ctrl+C so only the outer scheduler reacts to it.
        let instance_is_local = self
            .config
            .runners
            .get(&self.parameters.instance_runner)
            .map(|r| r.kind == crate::config::RunnerKind::Local)
            .unwrap_or(false);
        if instance_is_local {
            command.push_str(" --no-interrupt");
        }
        log_debug!("Generated unit command line: {}", command);
        command
    }

    fn release_instance_runner(&mut self, index: usize) {
        let Some(bound) = self.instances[index].state.bound.clone() else {
            return;
        };
        if let Ok(runner) = self.registry.get(&bound.runner_name) {
            runner.after_completion(&mut self.pool, bound.charged_threads);
        }
        self.instances[index].state.unbind();
    }

    // --- Abort handling ---

    /// Check for the abort sentinel in the main execution directory.
    fn check_user_abort(&mut self) {
        if let Some(request) = self.reader.read_abort(&self.workdir()) {
            if request.kill {
                self.kill_switch = true;
            }
            self.abort_all_instances(
                "an abort sentinel has been detected in the main execution folder",
            );
        }
    }

    /// Cascade the abort to every instance. Pending ones cancel
    /// immediately; live ones get a cooperative stop request (their own
    /// abort sentinel) and retire once their finished artifact, or its
    /// definitive absence, is observed.
    fn abort_all_instances(&mut self, reason: &str) {
        log_error!("{}", reason);
        log_info!("The analysis will now be aborted");
        self.aborting = true;

        for index in 0..self.instances.len() {
            let status = self.instances[index].status();
            if status == Status::Pending {
                self.instances[index].state.cancel(reason.to_string());
                let _ = self.store.update_during_monitoring(
                    self.instances[index].id,
                    Status::Canceled,
                    self.instances[index].progress,
                );
                continue;
            }
            if !status.is_live() {
                continue;
            }
            let description = self.instances[index].description();
            if self.instances[index].request_abort(self.kill_switch) {
                log_info!("A stop request was delivered to {}", description);
            } else {
                // The unit never created its directory, so nothing can
                // deliver the sentinel; fall back to the kill command or a
                // direct cancellation.
                if self.kill_switch {
                    if let Some(bound) = self.instances[index].state.bound.clone() {
                        if let Ok(runner) = self.registry.get(&bound.runner_name) {
                            runner.kill(&bound.handle, &description);
                        }
                    }
                }
                self.instances[index].state.cancel(reason.to_string());
                self.release_instance_runner(index);
            }
        }
    }

    // --- Reporting ---

    fn display_status_counters(&self) {
        if let Ok(counters) = self.store.status_counters() {
            let formatted: Vec<String> = counters
                .iter()
                .map(|(status, count)| format!("{} = {}", status, count))
                .collect();
            log_info!(
                "Current repartition of instance statuses: {}",
                formatted.join(" / ")
            );
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}

/// Refuse to resume when the plan or config files changed since `run`
/// captured them: the unit processes would silently diverge from the
/// persisted state.
pub fn verify_global_files(parameters: &RunParameters) -> MillResult<()> {
    let plan_path = Path::new(&parameters.plan_path);
    let config_path = Path::new(&parameters.config_path);

    if file_checksum(plan_path)? != parameters.plan_checksum {
        return Err(MillError::Config(format!(
            "{} was modified after the run was registered; restore it before resuming",
            parameters.plan_path
        )));
    }
    if checksum_if_present(config_path)? != parameters.config_checksum {
        return Err(MillError::Config(format!(
            "{} was modified after the run was registered; restore it before resuming",
            parameters.config_path
        )));
    }
    Ok(())
}
