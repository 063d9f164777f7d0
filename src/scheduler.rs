use std::path::Path;

use crate::error::{MillError, MillResult};
use crate::job::{JobState, LivenessVerdict};
use crate::runner::JobRunner;
use crate::{log_debug, log_info};

/// Launcher wrapper scripts and batch submission byproducts live here,
/// inside the main execution directory of each tier.
pub const LAUNCHERS_DIR: &str = "launchers";

/// How many new submissions a tick may attempt: the free concurrency
/// slots, capped by the number of jobs actually ready to go.
pub fn admission_count(ceiling: u32, live: u32, eligible_pending: u32) -> u32 {
    ceiling.saturating_sub(live).min(eligible_pending)
}

/// Identifier stamped on every run, prefixed to job names so wrapper and
/// output files of different runs never collide.
pub fn generate_run_id() -> String {
    format!(
        "SM{}_{}",
        chrono::Local::now().format("%H%M%S%m%d"),
        std::process::id()
    )
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Write the shell wrapper an external back-end will execute, and make it
/// executable.
pub fn write_wrapper(path: &Path, command_line: &str) -> MillResult<()> {
    log_debug!("Writing launcher command line in file: {}", path.display());
    std::fs::write(path, format!("#!/usr/bin/env bash\n\n{}\n", command_line))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o750))?;
    }
    Ok(())
}

/// Outcome of one liveness refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessOutcome {
    /// The lengthened liveness interval has not elapsed yet.
    NotDue,
    Alive,
    /// The job was forced into `Error` (dead, or probe ceiling reached).
    Errored,
}

/// Re-probe a live job once its liveness interval has elapsed, escalating
/// to `Error` on a confirmed death or when the probe-failure ceiling is
/// reached.
pub fn refresh_liveness(
    state: &mut JobState,
    runner: &dyn JobRunner,
    description: &str,
    liveness_interval: std::time::Duration,
    max_failed_checks: u32,
) -> MillResult<LivenessOutcome> {
    if !state.liveness_due(liveness_interval) {
        return Ok(LivenessOutcome::NotDue);
    }

    let handle = match &state.bound {
        Some(bound) => bound.handle.clone(),
        None => {
            return Err(MillError::Internal(format!(
                "liveness refresh requested for {} without a bound runner",
                description
            )))
        }
    };

    let probe = runner.check_alive(&handle, description);
    let verdict = state.observe_liveness(probe);
    state.touch_liveness_check();

    match verdict {
        LivenessVerdict::Alive => Ok(LivenessOutcome::Alive),
        LivenessVerdict::Dead => {
            state.set_error(description, "job is not alive anymore");
            Ok(LivenessOutcome::Errored)
        }
        LivenessVerdict::CheckFailed(count) => {
            if count >= max_failed_checks {
                state.set_error(
                    description,
                    "failed too many times to check whether the job is still alive",
                );
                Ok(LivenessOutcome::Errored)
            } else {
                log_info!(
                    "Liveness check failed for {} ({}/{} failures tolerated)",
                    description,
                    count,
                    max_failed_checks
                );
                Ok(LivenessOutcome::Alive)
            }
        }
    }
}
