use std::collections::HashMap;

use crate::config::{RunnerConfig, RunnerKind};
use crate::error::{MillError, MillResult};
use crate::log_debug;
use crate::runner::{
    build_handle, check_pattern_keywords, list_queues, probe_with_command, resolve_pattern,
    run_shell, JobHandle, JobRunner, Liveness, ResourcePool, SubmitRequest,
};

/// Sun Grid Engine back-end: `qsub` submission, `qstat` monitoring,
/// `qdel` kill.
pub struct SunGridEngineRunner {
    name: String,
    runner_config: RunnerConfig,
}

impl SunGridEngineRunner {
    pub fn new(name: &str, runner_config: RunnerConfig) -> Self {
        Self {
            name: name.to_string(),
            runner_config,
        }
    }

    /// `qsub` acknowledges with `Your job <id> ("<name>") has been
    /// submitted`; the id is the third token.
    fn parse_native_id(stdout: &str) -> Option<String> {
        let candidate = stdout.lines().next()?.split_whitespace().nth(2)?;
        candidate.parse::<u64>().ok().map(|id| id.to_string())
    }
}

impl JobRunner for SunGridEngineRunner {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> RunnerKind {
        RunnerKind::SunGridEngine
    }

    fn config(&self) -> &RunnerConfig {
        &self.runner_config
    }

    fn check_configuration(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.runner_config.default_queue.is_empty() {
            let queues = list_queues(&self.runner_config.queue_list_command);
            if !queues.contains(&self.runner_config.default_queue) {
                errors.push(format!(
                    "queue <{}> for runner {} is not available on the current cluster",
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

        command.push_str(&format!(" -N {}", request.job_name));
        if request.threads > 1 {
            command.push_str(&format!(" -pe smp {}", request.threads));
        }
        command.push_str(&format!(" -o {}.sge.out", request.job_name));
        command.push_str(&format!(" -e {}.sge.err", request.job_name));
        command.push_str(&format!(" {}", request.wrapper_path.display()));

        log_debug!("Full submission command: {}", command);

        let output = run_shell(&command, Some(&request.submit_dir))
            .map_err(|e| MillError::Submission(format!("failed to run qsub: {}", e)))?;
        if !output.success {
            return Err(MillError::Submission(format!(
                "qsub rejected the job: {}",
                output.combined.trim()
            )));
        }

        let native_id = Self::parse_native_id(&output.stdout).ok_or_else(|| {
            MillError::Submission(format!(
                "could not parse a job id from the qsub output: {}",
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
    fn qsub_output_parses_to_the_job_id() {
        assert_eq!(
            SunGridEngineRunner::parse_native_id(
                "Your job 987654 (\"TA_001_execution\") has been submitted\n"
            ),
            Some("987654".to_string())
        );
        assert_eq!(SunGridEngineRunner::parse_native_id("qsub: error\n"), None);
    }
}
