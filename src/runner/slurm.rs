use std::collections::HashMap;

use crate::config::{RunnerConfig, RunnerKind};
use crate::error::{MillError, MillResult};
use crate::runner::{
    build_handle, check_pattern_keywords, list_queues, probe_with_command, resolve_pattern,
    run_shell, JobHandle, JobRunner, Liveness, ResourcePool, SubmitRequest,
};
use crate::log_debug;

/// Slurm back-end: `sbatch` submission, `squeue` monitoring, `scancel`
/// kill. Admission defers to the partition scheduler.
pub struct SlurmRunner {
    name: String,
    runner_config: RunnerConfig,
}

impl SlurmRunner {
    pub fn new(name: &str, runner_config: RunnerConfig) -> Self {
        Self {
            name: name.to_string(),
            runner_config,
        }
    }

    /// `sbatch` acknowledges with "Submitted batch job <id>"; the id is the
    /// last whitespace-separated token of the first line.
    fn parse_native_id(stdout: &str) -> Option<String> {
        let candidate = stdout.lines().next()?.split_whitespace().last()?;
        candidate.parse::<u64>().ok().map(|id| id.to_string())
    }
}

impl JobRunner for SlurmRunner {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> RunnerKind {
        RunnerKind::Slurm
    }

    fn config(&self) -> &RunnerConfig {
        &self.runner_config
    }

    fn check_configuration(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.runner_config.default_queue.is_empty() {
            let queues = list_queues(&self.runner_config.queue_list_command);
            if queues.contains(&self.runner_config.default_queue) {
                log_debug!(
                    "Queue/partition <{}> for runner {} is available on the current cluster",
                    self.runner_config.default_queue,
                    self.name
                );
            } else {
                errors.push(format!(
                    "queue/partition <{}> for runner {} is not available on the current cluster",
                    self.runner_config.default_queue, self.name
                ));
            }
        }

        errors.extend(check_pattern_keywords(
            &self.runner_config.submit_command,
            "submission",
            &self.name,
        ));
        errors.extend(check_pattern_keywords(
            &self.runner_config.monitoring_command,
            "monitoring",
            &self.name,
        ));
        errors.extend(check_pattern_keywords(
            &self.runner_config.kill_command,
            "kill",
            &self.name,
        ));

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn is_computing_power_available(&self, _pool: &ResourcePool, _threads: u32) -> bool {
        true
    }

    fn is_compatible_with(&self, spawns_subprocesses: bool) -> bool {
        self.runner_config.allow_submission_from_compute_nodes || !spawns_subprocesses
    }

    fn submit(&self, request: &SubmitRequest) -> MillResult<JobHandle> {
        let mut values: HashMap<&str, String> = HashMap::new();
        values.insert("queue", self.runner_config.default_queue.clone());
        values.insert("threads", request.threads.to_string());
        values.insert("job_name", request.job_name.clone());
        values.insert("wrapper", request.wrapper_path.display().to_string());

        let mut command =
            resolve_pattern(&self.runner_config.submit_command, "submission", &self.name, &values)?;

        command.push_str(&format!(" --job-name {}", request.job_name));
        if request.threads > 1 {
            command.push_str(&format!(" --cpus-per-task {}", request.threads));
        }
        command.push_str(&format!(" -o {}.slurm_%j.out", request.job_name));
        command.push_str(&format!(" -e {}.slurm_%j.err", request.job_name));
        command.push_str(&format!(" {}", request.wrapper_path.display()));

        log_debug!("Full submission command: {}", command);

        let output = run_shell(&command, Some(&request.submit_dir))
            .map_err(|e| MillError::Submission(format!("failed to run sbatch: {}", e)))?;
        if !output.success {
            return Err(MillError::Submission(format!(
                "sbatch rejected the job: {}",
                output.combined.trim()
            )));
        }

        let native_id = Self::parse_native_id(&output.stdout).ok_or_else(|| {
            MillError::Submission(format!(
                "could not parse a job id from the sbatch output: {}",
                output.stdout.trim()
            ))
        })?;

        build_handle(&self.name, &self.runner_config, &native_id, &request.job_name)
    }

    fn check_alive(&self, handle: &JobHandle, description: &str) -> Liveness {
        probe_with_command(&self.name, handle, description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sbatch_output_parses_to_the_job_id() {
        assert_eq!(
            SlurmRunner::parse_native_id("Submitted batch job 123456\n"),
            Some("123456".to_string())
        );
        assert_eq!(SlurmRunner::parse_native_id("sbatch: error\n"), None);
        assert_eq!(SlurmRunner::parse_native_id(""), None);
    }

    #[test]
    fn compute_node_refusal_limits_compatibility() {
        let mut config = RunnerConfig::default();
        config.kind = RunnerKind::Slurm;
        config.allow_submission_from_compute_nodes = false;
        let runner = SlurmRunner::new("slurm", config);
        assert!(!runner.is_compatible_with(true));
        assert!(runner.is_compatible_with(false));
    }

    #[test]
    fn batch_admission_always_accepts() {
        let runner = SlurmRunner::new("slurm", RunnerConfig::default());
        let pool = ResourcePool {
            active_threads: 10_000,
        };
        assert!(runner.is_computing_power_available(&pool, 64));
    }
}
