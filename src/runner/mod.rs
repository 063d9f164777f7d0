mod local;
mod sge;
mod slurm;
mod torque;

pub use local::LocalRunner;
pub use sge::SunGridEngineRunner;
pub use slurm::SlurmRunner;
pub use torque::TorqueRunner;

use std::collections::HashMap;
use std::path::PathBuf;

use crate::config::{MillConfig, RunnerConfig, RunnerKind};
use crate::error::{MillError, MillResult};
use crate::{log_debug, log_error, log_warn};

/// Placeholders that command patterns may reference. Anything else is a
/// configuration error, caught before the first submission.
pub const SUPPORTED_KEYWORDS: &[&str] = &["job_name", "wrapper", "jobid", "queue", "threads"];

// --- Shared value types ---

/// Scheduler-owned shared resource accounting. The local back-end charges
/// its active-thread counter here; batch back-ends leave it untouched.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResourcePool {
    pub active_threads: u32,
}

impl ResourcePool {
    pub fn charge(&mut self, threads: u32) {
        self.active_threads += threads;
    }

    pub fn release(&mut self, threads: u32) {
        self.active_threads = self.active_threads.saturating_sub(threads);
    }
}

/// Outcome of one monitoring probe.
///
/// `Unknown` means the probe itself failed; the caller stays optimistic and
/// counts it against the failed-check ceiling. `NotAlive` is a positive
/// observation that the native job is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    NotAlive,
    Unknown,
}

/// Native handle recorded at submission. The monitoring and kill commands
/// are fully resolved so that a resumed scheduler can keep polling a job it
/// never submitted itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub native_id: String,
    pub monitoring_command: String,
    pub kill_command: String,
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub job_name: String,
    pub wrapper_path: PathBuf,
    /// Directory the submission command runs in (stdout/stderr files and
    /// batch job files land here).
    pub submit_dir: PathBuf,
    pub threads: u32,
}

// --- Template resolution ---

/// Scan a command pattern for `{keyword}` placeholders that are not
/// supported, returning one message per offender.
pub fn check_pattern_keywords(pattern: &str, pattern_type: &str, runner_name: &str) -> Vec<String> {
    let mut errors = Vec::new();
    for keyword in pattern_keywords(pattern) {
        if !SUPPORTED_KEYWORDS.contains(&keyword.as_str()) {
            errors.push(format!(
                "keyword <{}> is not supported in the {} command pattern of runner {}",
                keyword, pattern_type, runner_name
            ));
        }
    }
    errors
}

/// Replace every supported `{keyword}` with its value. A keyword missing
/// from the context, or present with an empty value, is a fatal
/// configuration error: the resulting command would be silently broken.
pub fn resolve_pattern(
    pattern: &str,
    pattern_type: &str,
    runner_name: &str,
    values: &HashMap<&str, String>,
) -> MillResult<String> {
    let mut resolved = pattern.to_string();
    for keyword in pattern_keywords(pattern) {
        match values.get(keyword.as_str()) {
            Some(value) if !value.is_empty() => {
                resolved = resolved.replace(&format!("{{{}}}", keyword), value);
            }
            Some(_) => {
                return Err(MillError::Config(format!(
                    "keyword <{}> in the {} command pattern of runner {} has an empty value",
                    keyword, pattern_type, runner_name
                )));
            }
            None => {
                return Err(MillError::Config(format!(
                    "keyword <{}> is not supported in the {} command pattern of runner {}",
                    keyword, pattern_type, runner_name
                )));
            }
        }
    }
    Ok(resolved)
}

fn pattern_keywords(pattern: &str) -> Vec<String> {
    let mut keywords = Vec::new();
    let mut rest = pattern;
    while let Some(open) = rest.find('{') {
        let tail = &rest[open + 1..];
        match tail.find('}') {
            Some(close) => {
                let keyword = &tail[..close];
                if !keyword.is_empty()
                    && keyword.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    keywords.push(keyword.to_string());
                }
                rest = &tail[close + 1..];
            }
            None => break,
        }
    }
    keywords
}

// --- Shell helpers shared by the back-ends ---

/// Run a command line through the shell, capturing combined output.
/// Returns `Err` only when the shell itself could not be spawned.
pub(crate) fn run_shell(command: &str, cwd: Option<&std::path::Path>) -> std::io::Result<ShellOutput> {
    let mut cmd = std::process::Command::new("sh");
    cmd.arg("-c").arg(command);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    let output = cmd.output()?;
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(ShellOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        combined,
    })
}

pub(crate) struct ShellOutput {
    pub success: bool,
    pub stdout: String,
    pub combined: String,
}

/// Shared monitoring-probe logic for command-based back-ends: the probe
/// output must positively contain the native id for the job to be alive.
pub(crate) fn probe_with_command(
    runner_name: &str,
    handle: &JobHandle,
    description: &str,
) -> Liveness {
    match run_shell(&handle.monitoring_command, None) {
        Err(e) => {
            log_warn!(
                "Failed to check whether the {} job for {} (id {}) is still alive: {}",
                runner_name,
                description,
                handle.native_id,
                e
            );
            Liveness::Unknown
        }
        Ok(output) => {
            if output.combined.contains(handle.native_id.as_str()) {
                log_debug!(
                    "{} job for {} (id {}) is still alive",
                    runner_name,
                    description,
                    handle.native_id
                );
                Liveness::Alive
            } else {
                log_warn!(
                    "{} job for {} (id {}) does not exist anymore",
                    runner_name,
                    description,
                    handle.native_id
                );
                Liveness::NotAlive
            }
        }
    }
}

/// List the queues/partitions known to the batch system, one per line.
pub(crate) fn list_queues(queue_list_command: &str) -> Vec<String> {
    if queue_list_command.trim().is_empty() {
        return Vec::new();
    }
    match run_shell(queue_list_command, None) {
        Ok(output) if output.success => output
            .stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect(),
        Ok(_) | Err(_) => {
            log_warn!(
                "The list of available queues/partitions could not be retrieved with: {}",
                queue_list_command
            );
            Vec::new()
        }
    }
}

/// Resolve the monitoring and kill command patterns against a freshly
/// assigned native job id, producing the handle persisted with the job.
pub(crate) fn build_handle(
    runner_name: &str,
    config: &RunnerConfig,
    native_id: &str,
    job_name: &str,
) -> MillResult<JobHandle> {
    let mut values: HashMap<&str, String> = HashMap::new();
    values.insert("jobid", native_id.to_string());
    values.insert("job_name", job_name.to_string());
    if !config.default_queue.is_empty() {
        values.insert("queue", config.default_queue.clone());
    }

    let monitoring_command =
        resolve_pattern(&config.monitoring_command, "monitoring", runner_name, &values)?;
    let kill_command = resolve_pattern(&config.kill_command, "kill", runner_name, &values)?;

    log_debug!(
        "Monitoring command after keyword replacement: {}",
        monitoring_command
    );
    log_debug!("Kill command after keyword replacement: {}", kill_command);

    Ok(JobHandle {
        native_id: native_id.to_string(),
        monitoring_command,
        kill_command,
    })
}

// --- The back-end contract ---

/// Pluggable adapter submitting, monitoring and killing the external
/// process or batch job behind a schedulable unit of work.
pub trait JobRunner: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> RunnerKind;

    fn config(&self) -> &RunnerConfig;

    fn describe(&self, threads: u32) -> String {
        if threads > 1 {
            format!("{} (multithread, {} slots)", self.name(), threads)
        } else {
            self.name().to_string()
        }
    }

    /// Validate static configuration: every pattern keyword resolvable and,
    /// for batch systems, the default queue known to the cluster. Run once
    /// per runner and cached by the registry.
    fn check_configuration(&self) -> Result<(), Vec<String>>;

    /// Back-end-specific admission. The local runner compares the pool's
    /// active-thread counter against its slot ceiling; batch back-ends
    /// defer to the external queue and always accept.
    fn is_computing_power_available(&self, pool: &ResourcePool, threads: u32) -> bool;

    /// Whether this back-end can carry a job that itself submits further
    /// jobs while running on a compute node.
    fn is_compatible_with(&self, spawns_subprocesses: bool) -> bool;

    /// Synchronously run the submission command and parse the native job
    /// id from its output. An `Err` is a transient per-job failure; the
    /// caller owns the retry bookkeeping.
    fn submit(&self, request: &SubmitRequest) -> MillResult<JobHandle>;

    /// Run the monitoring command and inspect its output for the native
    /// id. `description` identifies the job in log lines.
    fn check_alive(&self, handle: &JobHandle, description: &str) -> Liveness;

    fn after_submission(&self, pool: &mut ResourcePool, threads: u32) {
        let _ = (pool, threads);
    }

    fn after_completion(&self, pool: &mut ResourcePool, threads: u32) {
        let _ = (pool, threads);
    }

    /// Run the resolved kill command against a live handle.
    fn kill(&self, handle: &JobHandle, description: &str) {
        log_debug!("Kill command is: {}", handle.kill_command);
        match run_shell(&handle.kill_command, None) {
            Ok(output) => {
                let message = output.combined.trim();
                if !message.is_empty() {
                    crate::log_info!("{}", message);
                }
            }
            Err(e) => log_error!("Failed to kill the job for {}: {}", description, e),
        }
    }
}

// --- Factory & registry ---

/// Build the concrete back-end for a configured runner. An explicit
/// name-to-implementation mapping: a runner's concrete type is fixed here,
/// once, and never rebound afterwards.
pub fn build(name: &str, config: &RunnerConfig) -> Box<dyn JobRunner> {
    match config.kind {
        RunnerKind::Local => Box::new(LocalRunner::new(name, config.clone())),
        RunnerKind::Slurm => Box::new(SlurmRunner::new(name, config.clone())),
        RunnerKind::SunGridEngine => Box::new(SunGridEngineRunner::new(name, config.clone())),
        RunnerKind::Torque => Box::new(TorqueRunner::new(name, config.clone())),
    }
}

struct RegistryEntry {
    runner: Box<dyn JobRunner>,
    configuration_ok: Option<bool>,
}

/// All configured back-ends, built once at startup. Configuration checks
/// are cached so each back-end is validated at most once per process.
pub struct RunnerRegistry {
    entries: HashMap<String, RegistryEntry>,
    pub fallback: String,
}

impl RunnerRegistry {
    /// Assemble a registry from explicit back-end instances. Production
    /// code goes through `from_config`; tests use this to slot in mocks.
    pub fn with_runners(
        runners: Vec<(String, Box<dyn JobRunner>)>,
        fallback: impl Into<String>,
    ) -> Self {
        Self {
            entries: runners
                .into_iter()
                .map(|(name, runner)| {
                    (
                        name,
                        RegistryEntry {
                            runner,
                            configuration_ok: None,
                        },
                    )
                })
                .collect(),
            fallback: fallback.into(),
        }
    }

    pub fn from_config(config: &MillConfig) -> Self {
        let entries = config
            .runners
            .iter()
            .map(|(name, runner_config)| {
                (
                    name.clone(),
                    RegistryEntry {
                        runner: build(name, runner_config),
                        configuration_ok: None,
                    },
                )
            })
            .collect();
        Self {
            entries,
            fallback: config.global.fallback_runner.clone(),
        }
    }

    pub fn get(&self, name: &str) -> MillResult<&dyn JobRunner> {
        self.entries
            .get(name)
            .map(|entry| entry.runner.as_ref())
            .ok_or_else(|| MillError::Config(format!("unknown runner '{}'", name)))
    }

    /// Validate a runner's configuration, caching the verdict. A cached
    /// failure stays a failure: configuration does not heal mid-run.
    pub fn ensure_configuration_ok(&mut self, name: &str) -> MillResult<()> {
        let entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| MillError::Config(format!("unknown runner '{}'", name)))?;

        match entry.configuration_ok {
            Some(true) => Ok(()),
            Some(false) => Err(MillError::Config(format!(
                "there is at least one configuration error for runner {}",
                name
            ))),
            None => match entry.runner.check_configuration() {
                Ok(()) => {
                    entry.configuration_ok = Some(true);
                    Ok(())
                }
                Err(errors) => {
                    for error in &errors {
                        log_error!("{}", error);
                    }
                    entry.configuration_ok = Some(false);
                    Err(MillError::Config(format!(
                        "there is at least one configuration error for runner {}",
                        name
                    )))
                }
            },
        }
    }
}

// --- Mock back-end for scheduler tests ---

/// Scripted back-end used by the integration tests. Submission results,
/// liveness probes and capacity answers are consumed in order; once a
/// script is exhausted the mock keeps returning its last-resort defaults
/// (successful submission, alive, capacity available).
///
/// The scripts and call records live behind an `Arc` so a test can keep a
/// probe on them after the registry takes ownership of the runner.
#[derive(Default)]
pub struct MockState {
    pub submissions: std::sync::Mutex<Vec<MillResult<JobHandle>>>,
    pub liveness: std::sync::Mutex<Vec<Liveness>>,
    pub capacity: std::sync::Mutex<Vec<bool>>,
    pub submitted_names: std::sync::Mutex<Vec<String>>,
    pub killed: std::sync::Mutex<Vec<String>>,
}

pub struct MockRunner {
    name: String,
    runner_config: RunnerConfig,
    compatible: bool,
    configuration_errors: Vec<String>,
    state: std::sync::Arc<MockState>,
}

impl MockRunner {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            runner_config: RunnerConfig::default(),
            compatible: true,
            configuration_errors: Vec::new(),
            state: std::sync::Arc::new(MockState::default()),
        }
    }

    /// Shared probe into the mock's scripts and call records.
    pub fn state(&self) -> std::sync::Arc<MockState> {
        std::sync::Arc::clone(&self.state)
    }

    pub fn incompatible(mut self) -> Self {
        self.compatible = false;
        self
    }

    pub fn with_configuration_errors(mut self, errors: Vec<String>) -> Self {
        self.configuration_errors = errors;
        self
    }

    /// Queue submission outcomes, consumed first-in-first-out.
    pub fn script_submissions(self, results: Vec<MillResult<JobHandle>>) -> Self {
        {
            let mut guard = self.state.submissions.lock().unwrap();
            *guard = results;
            guard.reverse();
        }
        self
    }

    pub fn script_liveness(self, results: Vec<Liveness>) -> Self {
        {
            let mut guard = self.state.liveness.lock().unwrap();
            *guard = results;
            guard.reverse();
        }
        self
    }

    /// Queue capacity answers; exhausted scripts answer true.
    pub fn script_capacity(self, results: Vec<bool>) -> Self {
        {
            let mut guard = self.state.capacity.lock().unwrap();
            *guard = results;
            guard.reverse();
        }
        self
    }

    pub fn handle(id: &str) -> JobHandle {
        JobHandle {
            native_id: id.to_string(),
            monitoring_command: format!("true {}", id),
            kill_command: format!("true kill {}", id),
        }
    }
}

impl JobRunner for MockRunner {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> RunnerKind {
        self.runner_config.kind
    }

    fn config(&self) -> &RunnerConfig {
        &self.runner_config
    }

    fn check_configuration(&self) -> Result<(), Vec<String>> {
        if self.configuration_errors.is_empty() {
            Ok(())
        } else {
            Err(self.configuration_errors.clone())
        }
    }

    fn is_computing_power_available(&self, _pool: &ResourcePool, _threads: u32) -> bool {
        self.state.capacity.lock().unwrap().pop().unwrap_or(true)
    }

    fn is_compatible_with(&self, _spawns_subprocesses: bool) -> bool {
        self.compatible
    }

    fn submit(&self, request: &SubmitRequest) -> MillResult<JobHandle> {
        self.state
            .submitted_names
            .lock()
            .unwrap()
            .push(request.job_name.clone());
        self.state
            .submissions
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| Ok(Self::handle(&format!("mock-{}", request.job_name))))
    }

    fn check_alive(&self, _handle: &JobHandle, _description: &str) -> Liveness {
        self.state
            .liveness
            .lock()
            .unwrap()
            .pop()
            .unwrap_or(Liveness::Alive)
    }

    fn kill(&self, handle: &JobHandle, _description: &str) {
        self.state.killed.lock().unwrap().push(handle.native_id.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_keywords_are_extracted() {
        assert_eq!(
            pattern_keywords("squeue -h -j {jobid} --name {job_name}"),
            vec!["jobid".to_string(), "job_name".to_string()]
        );
        assert!(pattern_keywords("no placeholders").is_empty());
        assert!(pattern_keywords("dangling {brace").is_empty());
    }

    #[test]
    fn unsupported_keyword_is_a_configuration_error() {
        let errors = check_pattern_keywords("qdel {walltime}", "kill", "torque");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("<walltime>"));
        assert!(check_pattern_keywords("qdel {jobid}", "kill", "torque").is_empty());
    }

    #[test]
    fn resolution_replaces_values() {
        let mut values = HashMap::new();
        values.insert("jobid", "4242".to_string());
        let resolved = resolve_pattern("scancel {jobid}", "kill", "slurm", &values).unwrap();
        assert_eq!(resolved, "scancel 4242");
    }

    #[test]
    fn resolution_rejects_empty_values() {
        let mut values = HashMap::new();
        values.insert("queue", String::new());
        let err = resolve_pattern("sbatch -p {queue}", "submission", "slurm", &values).unwrap_err();
        assert!(err.to_string().contains("empty value"));
        assert!(err.is_fatal());
    }

    #[test]
    fn resource_pool_charge_and_release() {
        let mut pool = ResourcePool::default();
        pool.charge(4);
        pool.charge(2);
        assert_eq!(pool.active_threads, 6);
        pool.release(4);
        assert_eq!(pool.active_threads, 2);
        pool.release(10);
        assert_eq!(pool.active_threads, 0);
    }

    #[test]
    fn registry_caches_configuration_verdict() {
        let config = {
            let mut c = MillConfig::default();
            c.runners
                .insert("local".to_string(), RunnerConfig::default());
            c
        };
        let mut registry = RunnerRegistry::from_config(&config);
        assert!(registry.ensure_configuration_ok("local").is_ok());
        assert!(registry.ensure_configuration_ok("local").is_ok());
        assert!(registry.ensure_configuration_ok("missing").is_err());
    }

    #[test]
    fn mock_runner_scripts_are_consumed_in_order() {
        let mock = MockRunner::new("mock")
            .script_capacity(vec![false, false, true])
            .script_liveness(vec![Liveness::NotAlive, Liveness::Alive]);
        let pool = ResourcePool::default();
        assert!(!mock.is_computing_power_available(&pool, 1));
        assert!(!mock.is_computing_power_available(&pool, 1));
        assert!(mock.is_computing_power_available(&pool, 1));
        assert!(mock.is_computing_power_available(&pool, 1));

        let handle = MockRunner::handle("7");
        assert_eq!(mock.check_alive(&handle, "job"), Liveness::NotAlive);
        assert_eq!(mock.check_alive(&handle, "job"), Liveness::Alive);
        assert_eq!(mock.check_alive(&handle, "job"), Liveness::Alive);
    }
}
