use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::{RunnerConfig, RunnerKind};
use crate::error::{MillError, MillResult};
use crate::runner::{
    build_handle, check_pattern_keywords, probe_with_command, JobHandle, JobRunner, Liveness,
    ResourcePool, SubmitRequest,
};
use crate::{log_debug, log_warn};

/// Back-end running jobs as plain subprocesses on the scheduler host.
///
/// Admission is governed by the scheduler's resource pool: the counter of
/// threads charged by live local jobs must stay below the configured slot
/// ceiling. Spawned children are retained so liveness checks can reap them
/// instead of consulting `ps` for a process this very scheduler owns.
pub struct LocalRunner {
    name: String,
    runner_config: RunnerConfig,
    children: Mutex<HashMap<String, std::process::Child>>,
}

impl LocalRunner {
    pub fn new(name: &str, runner_config: RunnerConfig) -> Self {
        Self {
            name: name.to_string(),
            runner_config,
            children: Mutex::new(HashMap::new()),
        }
    }
}

impl JobRunner for LocalRunner {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> RunnerKind {
        RunnerKind::Local
    }

    fn config(&self) -> &RunnerConfig {
        &self.runner_config
    }

    fn check_configuration(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
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

    fn is_computing_power_available(&self, pool: &ResourcePool, _threads: u32) -> bool {
        if pool.active_threads < self.runner_config.total_threads {
            true
        } else {
            log_debug!(
                "Maximum number of active threads already reached, new submissions are postponed"
            );
            false
        }
    }

    fn is_compatible_with(&self, _spawns_subprocesses: bool) -> bool {
        true
    }

    fn submit(&self, request: &SubmitRequest) -> MillResult<JobHandle> {
        let stdout_path = request.submit_dir.join(format!("{}.o0", request.job_name));
        let stderr_path = request.submit_dir.join(format!("{}.e0", request.job_name));

        let stdout = std::fs::File::create(&stdout_path)
            .map_err(|e| MillError::Submission(format!("cannot create {}: {}", stdout_path.display(), e)))?;
        let stderr = std::fs::File::create(&stderr_path)
            .map_err(|e| MillError::Submission(format!("cannot create {}: {}", stderr_path.display(), e)))?;

        let child = std::process::Command::new(&request.wrapper_path)
            .current_dir(&request.submit_dir)
            .stdin(std::process::Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| {
                MillError::Submission(format!(
                    "failed to spawn {}: {}",
                    request.wrapper_path.display(),
                    e
                ))
            })?;

        let native_id = child.id().to_string();
        let handle = build_handle(&self.name, &self.runner_config, &native_id, &request.job_name)?;

        if let Ok(mut children) = self.children.lock() {
            children.insert(native_id, child);
        }

        Ok(handle)
    }

    fn check_alive(&self, handle: &JobHandle, description: &str) -> Liveness {
        // Prefer reaping our own child over shelling out to `ps`; a zombie
        // would otherwise look alive to the monitoring command forever.
        if let Ok(mut children) = self.children.lock() {
            if let Some(child) = children.get_mut(&handle.native_id) {
                return match child.try_wait() {
                    Ok(Some(_)) => {
                        children.remove(&handle.native_id);
                        log_warn!(
                            "Local job for {} (pid {}) does not exist anymore",
                            description,
                            handle.native_id
                        );
                        Liveness::NotAlive
                    }
                    Ok(None) => Liveness::Alive,
                    Err(e) => {
                        log_warn!(
                            "Failed to check whether the local job for {} (pid {}) is still alive: {}",
                            description,
                            handle.native_id,
                            e
                        );
                        Liveness::Unknown
                    }
                };
            }
        }
        // A handle rebound from persisted state: the child belongs to a
        // previous scheduler process, only the monitoring command can see it.
        probe_with_command(&self.name, handle, description)
    }

    fn after_submission(&self, pool: &mut ResourcePool, threads: u32) {
        pool.charge(threads);
    }

    fn after_completion(&self, pool: &mut ResourcePool, threads: u32) {
        pool.release(threads);
    }
}
