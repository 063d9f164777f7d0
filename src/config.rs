use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MillConfig {
    pub global: GlobalConfig,
    pub runners: HashMap<String, RunnerConfig>,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct GlobalConfig {
    /// Runner swapped in when the selected task runner is incompatible with
    /// a given tool invocation.
    pub fallback_runner: String,
    pub max_parallel_instances: u32,
    pub max_parallel_tasks: u32,
    /// Minimum age (seconds) of a finished/progress artifact before it is
    /// trusted, guarding against partially written files.
    pub artifact_debounce_secs: u64,
    /// External launcher executed for a task's execution phase.
    pub tool_launcher: String,
    /// External launcher executed for a task's parsing phase.
    pub parser_launcher: String,
    /// Binary submitted for each chunk analysis by the instance tier.
    pub unit_command: String,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            fallback_runner: "local".to_string(),
            max_parallel_instances: 2,
            max_parallel_tasks: 64,
            artifact_debounce_secs: 10,
            tool_launcher: "taskwrap-exec".to_string(),
            parser_launcher: "taskwrap-parse".to_string(),
            unit_command: "seqmill".to_string(),
        }
    }
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunnerKind {
    Local,
    Slurm,
    SunGridEngine,
    Torque,
}

impl std::fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunnerKind::Local => "local",
            RunnerKind::Slurm => "slurm",
            RunnerKind::SunGridEngine => "sun_grid_engine",
            RunnerKind::Torque => "torque",
        };
        write!(f, "{}", name)
    }
}

/// Which tier a runner may serve.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunnerUsage {
    Instance,
    Task,
    #[default]
    Both,
}

impl RunnerUsage {
    pub fn allows_instances(&self) -> bool {
        matches!(self, RunnerUsage::Instance | RunnerUsage::Both)
    }

    pub fn allows_tasks(&self) -> bool {
        matches!(self, RunnerUsage::Task | RunnerUsage::Both)
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    pub kind: RunnerKind,
    pub usage: RunnerUsage,
    /// Batch systems configured to reject submissions issued from compute
    /// nodes cannot run jobs that themselves submit further jobs.
    pub allow_submission_from_compute_nodes: bool,
    /// Command patterns with `{keyword}` placeholders, resolved against the
    /// bound job at submission time. `submit_command` is unused by the
    /// local runner.
    pub submit_command: String,
    pub monitoring_command: String,
    pub kill_command: String,
    /// Command printing one queue/partition name per line; empty disables
    /// the queue existence check.
    pub queue_list_command: String,
    pub default_queue: String,
    /// Slot ceiling for the local runner's active-thread counter.
    pub total_threads: u32,
    pub default_threads: u32,
    pub max_threads_per_tool: u32,
    pub monitoring_interval_secs: u64,
    pub max_failed_submissions: u32,
    pub max_failed_liveness_checks: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            kind: RunnerKind::Local,
            usage: RunnerUsage::Both,
            allow_submission_from_compute_nodes: true,
            submit_command: String::new(),
            monitoring_command: "ps -o pid= -p {jobid}".to_string(),
            kill_command: "kill {jobid}".to_string(),
            queue_list_command: String::new(),
            default_queue: String::new(),
            total_threads: 4,
            default_threads: 1,
            max_threads_per_tool: 4,
            monitoring_interval_secs: 5,
            max_failed_submissions: 3,
            max_failed_liveness_checks: 3,
        }
    }
}

impl RunnerConfig {
    /// The lengthened interval used for liveness-only probes: one minute
    /// when polling is faster than that, otherwise one minute on top of the
    /// polling interval.
    pub fn liveness_interval_secs(&self) -> u64 {
        if self.monitoring_interval_secs < 60 {
            60
        } else {
            60 + self.monitoring_interval_secs
        }
    }
}

fn default_slurm_runner() -> RunnerConfig {
    RunnerConfig {
        kind: RunnerKind::Slurm,
        submit_command: "sbatch -p {queue}".to_string(),
        monitoring_command: "squeue -h -j {jobid}".to_string(),
        kill_command: "scancel {jobid}".to_string(),
        queue_list_command: "sinfo -h --format %R".to_string(),
        default_queue: "normal".to_string(),
        monitoring_interval_secs: 30,
        ..RunnerConfig::default()
    }
}

pub fn validate(config: &MillConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.runners.is_empty() {
        errors.push("at least one runner must be configured".to_string());
    }

    if config.global.max_parallel_instances < 1 {
        errors.push("global.max_parallel_instances must be >= 1".to_string());
    }

    if config.global.max_parallel_tasks < 1 {
        errors.push("global.max_parallel_tasks must be >= 1".to_string());
    }

    match config.runners.get(&config.global.fallback_runner) {
        None => errors.push(format!(
            "global.fallback_runner '{}' is not a configured runner",
            config.global.fallback_runner
        )),
        Some(fallback) => {
            if !fallback.usage.allows_tasks() {
                errors.push(format!(
                    "global.fallback_runner '{}' is not allowed to run tasks",
                    config.global.fallback_runner
                ));
            }
        }
    }

    for (name, runner) in &config.runners {
        if runner.monitoring_command.trim().is_empty() {
            errors.push(format!(
                "runners.{}: monitoring_command must not be empty",
                name
            ));
        }
        if runner.kill_command.trim().is_empty() {
            errors.push(format!("runners.{}: kill_command must not be empty", name));
        }
        if runner.kind != RunnerKind::Local && runner.submit_command.trim().is_empty() {
            errors.push(format!(
                "runners.{}: submit_command must not be empty for a {} runner",
                name, runner.kind
            ));
        }
        if runner.kind == RunnerKind::Local && runner.total_threads < 1 {
            errors.push(format!("runners.{}: total_threads must be >= 1", name));
        }
        if runner.default_threads < 1 {
            errors.push(format!("runners.{}: default_threads must be >= 1", name));
        }
        if runner.default_threads > runner.max_threads_per_tool {
            errors.push(format!(
                "runners.{}: default_threads ({}) exceeds max_threads_per_tool ({})",
                name, runner.default_threads, runner.max_threads_per_tool
            ));
        }
        if runner.monitoring_interval_secs < 1 {
            errors.push(format!(
                "runners.{}: monitoring_interval_secs must be >= 1",
                name
            ));
        }
        if runner.max_failed_submissions < 1 {
            errors.push(format!(
                "runners.{}: max_failed_submissions must be >= 1",
                name
            ));
        }
        if runner.max_failed_liveness_checks < 1 {
            errors.push(format!(
                "runners.{}: max_failed_liveness_checks must be >= 1",
                name
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate the runner names selected for a run against usage limitations
/// and the overload rules for the local back-end.
pub fn validate_runner_selection(
    config: &MillConfig,
    instance_runner: &str,
    task_runner: &str,
) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    let instance_cfg = match config.runners.get(instance_runner) {
        Some(cfg) => {
            if !cfg.usage.allows_instances() {
                errors.push(format!(
                    "runner '{}' is not allowed to run analysis instances",
                    instance_runner
                ));
            }
            Some(cfg)
        }
        None => {
            errors.push(format!("unknown instance runner '{}'", instance_runner));
            None
        }
    };

    let task_cfg = match config.runners.get(task_runner) {
        Some(cfg) => {
            if !cfg.usage.allows_tasks() {
                errors.push(format!("runner '{}' is not allowed to run tasks", task_runner));
            }
            Some(cfg)
        }
        None => {
            errors.push(format!("unknown task runner '{}'", task_runner));
            None
        }
    };

    if let (Some(instance_cfg), Some(task_cfg)) = (instance_cfg, task_cfg) {
        // A batch-launched instance submits its task jobs from a compute
        // node; the instance back-end must tolerate that.
        if instance_cfg.kind != RunnerKind::Local
            && task_cfg.kind != RunnerKind::Local
            && !instance_cfg.allow_submission_from_compute_nodes
        {
            errors.push(format!(
                "invalid runner combination: '{}' refuses submissions from compute nodes, \
                 so it cannot launch instances that submit '{}' jobs",
                instance_runner, task_runner
            ));
        }

        if config.global.max_parallel_instances > 1 && instance_cfg.kind == RunnerKind::Local {
            if task_cfg.kind == RunnerKind::Local {
                errors.push(
                    "max_parallel_instances cannot exceed 1 when both tiers use the local runner"
                        .to_string(),
                );
            } else if config.global.max_parallel_instances > instance_cfg.total_threads {
                errors.push(format!(
                    "max_parallel_instances ({}) exceeds the local runner's total_threads ({})",
                    config.global.max_parallel_instances, instance_cfg.total_threads
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

pub fn load_config(path: &Path) -> Result<MillConfig, String> {
    if !path.exists() {
        let mut config = MillConfig::default();
        populate_default_runners(&mut config);
        return Ok(config);
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;

    let mut config: MillConfig = toml::from_str(&contents)
        .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))?;

    populate_default_runners(&mut config);

    validate(&config).map_err(|errors| {
        format!(
            "Config validation failed:\n{}",
            errors
                .iter()
                .map(|e| format!("  - {}", e))
                .collect::<Vec<_>>()
                .join("\n")
        )
    })?;

    Ok(config)
}

fn populate_default_runners(config: &mut MillConfig) {
    if config.runners.is_empty() {
        config
            .runners
            .insert("local".to_string(), RunnerConfig::default());
        config
            .runners
            .insert("slurm".to_string(), default_slurm_runner());
    }
}
