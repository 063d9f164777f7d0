use std::time::{Duration, Instant};

use crate::log_error;
use crate::runner::{JobHandle, Liveness};
use crate::status::Status;

/// Which kind of work a runner binding carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    /// A whole inner-pipeline run (instance tier).
    Unit,
    /// A task's tool execution.
    Execution,
    /// A task's output parsing.
    Parsing,
}

impl JobPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPhase::Unit => "unit",
            JobPhase::Execution => "execution",
            JobPhase::Parsing => "parsing",
        }
    }
}

/// The runner bound to a job while a submission is outstanding. After
/// retirement the binding is dropped; a job never holds more than one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundRunner {
    pub runner_name: String,
    pub phase: JobPhase,
    pub handle: JobHandle,
    /// Thread slots charged against the resource pool at submission,
    /// released verbatim at teardown.
    pub charged_threads: u32,
}

/// Verdict of one liveness observation after applying the asymmetric
/// policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessVerdict {
    Alive,
    /// Two consecutive probes positively reported the job gone.
    Dead,
    /// The probe itself failed; carries the running failure count so the
    /// caller can compare it against the configured ceiling.
    CheckFailed(u32),
}

/// Status, counters and runner binding shared by both job roles.
#[derive(Debug, Default)]
pub struct JobState {
    pub status: Status,
    pub error_info: Option<String>,
    pub bound: Option<BoundRunner>,
    pub failed_submissions: u32,
    pub failed_liveness_checks: u32,
    pub consecutive_not_alive: u32,
    pub submitted_at: Option<String>,
    pub last_liveness_check: Option<Instant>,
}

impl JobState {
    /// Apply a lifecycle transition, rejecting illegal edges.
    pub fn transition(&mut self, to: Status) -> Result<(), String> {
        if !self.status.can_transition_to(to) {
            return Err(format!(
                "illegal status transition {} -> {}",
                self.status, to
            ));
        }
        self.status = to;
        Ok(())
    }

    /// The sole path forcing a job into `Error`. Repeatable, always logs,
    /// keeps the first recorded reason as primary but logs every call.
    pub fn set_error(&mut self, description: &str, reason: impl Into<String>) {
        let reason = reason.into();
        log_error!("{} failed: {}", description, reason);
        self.status = Status::Error;
        if self.error_info.is_none() {
            self.error_info = Some(reason);
        }
    }

    /// Cancel the job unless it is already terminal. Returns whether the
    /// cancellation was applied.
    pub fn cancel(&mut self, reason: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = Status::Canceled;
        self.error_info = Some(reason.into());
        true
    }

    /// Record a successful submission: bind the runner handle, stamp the
    /// submission time and reset the monitoring counters.
    pub fn bind(&mut self, bound: BoundRunner, submitted_at: String) {
        self.bound = Some(bound);
        self.submitted_at = Some(submitted_at);
        self.failed_liveness_checks = 0;
        self.consecutive_not_alive = 0;
        self.last_liveness_check = Some(Instant::now());
    }

    /// Drop the runner binding at retirement.
    pub fn unbind(&mut self) {
        self.bound = None;
    }

    pub fn record_submission_failure(&mut self) -> u32 {
        self.failed_submissions += 1;
        self.failed_submissions
    }

    /// Whether the lengthened liveness interval has elapsed since the last
    /// probe (or since submission for the first probe).
    pub fn liveness_due(&self, interval: Duration) -> bool {
        match self.last_liveness_check {
            Some(checked) => checked.elapsed() >= interval,
            None => false,
        }
    }

    pub fn touch_liveness_check(&mut self) {
        self.last_liveness_check = Some(Instant::now());
    }

    /// Fold one probe result into the counters.
    ///
    /// The policy is asymmetric: a failed probe counts toward the
    /// failed-check ceiling but reports alive, while a positive not-alive
    /// answer only kills the job on the second consecutive observation.
    pub fn observe_liveness(&mut self, probe: Liveness) -> LivenessVerdict {
        match probe {
            Liveness::Alive => {
                self.consecutive_not_alive = 0;
                self.failed_liveness_checks = 0;
                LivenessVerdict::Alive
            }
            Liveness::NotAlive => {
                self.consecutive_not_alive += 1;
                if self.consecutive_not_alive >= 2 {
                    LivenessVerdict::Dead
                } else {
                    LivenessVerdict::Alive
                }
            }
            Liveness::Unknown => {
                self.failed_liveness_checks += 1;
                LivenessVerdict::CheckFailed(self.failed_liveness_checks)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_rejects_illegal_edges() {
        let mut state = JobState::default();
        assert!(state.transition(Status::Submitted).is_ok());
        assert!(state.transition(Status::Pending).is_err());
        assert!(state.transition(Status::Running).is_ok());
        assert!(state.transition(Status::Completed).is_ok());
        assert!(state.transition(Status::Canceled).is_err());
    }

    #[test]
    fn set_error_is_repeatable_and_keeps_first_reason() {
        let mut state = JobState::default();
        state.set_error("task 1 [blast]", "first reason");
        assert_eq!(state.status, Status::Error);
        state.set_error("task 1 [blast]", "second reason");
        assert_eq!(state.status, Status::Error);
        assert_eq!(state.error_info.as_deref(), Some("first reason"));
    }

    #[test]
    fn cancel_skips_terminal_jobs() {
        let mut state = JobState::default();
        assert!(state.cancel("upstream failed"));
        assert_eq!(state.status, Status::Canceled);

        let mut completed = JobState {
            status: Status::Completed,
            ..JobState::default()
        };
        assert!(!completed.cancel("too late"));
        assert_eq!(completed.status, Status::Completed);
    }

    #[test]
    fn one_not_alive_observation_is_not_enough() {
        let mut state = JobState::default();
        assert_eq!(
            state.observe_liveness(Liveness::NotAlive),
            LivenessVerdict::Alive
        );
        assert_eq!(
            state.observe_liveness(Liveness::NotAlive),
            LivenessVerdict::Dead
        );
    }

    #[test]
    fn alive_probe_resets_the_not_alive_streak() {
        let mut state = JobState::default();
        state.observe_liveness(Liveness::NotAlive);
        state.observe_liveness(Liveness::Alive);
        assert_eq!(
            state.observe_liveness(Liveness::NotAlive),
            LivenessVerdict::Alive
        );
    }

    #[test]
    fn failed_probes_count_up_and_stay_optimistic() {
        let mut state = JobState::default();
        assert_eq!(
            state.observe_liveness(Liveness::Unknown),
            LivenessVerdict::CheckFailed(1)
        );
        assert_eq!(
            state.observe_liveness(Liveness::Unknown),
            LivenessVerdict::CheckFailed(2)
        );
        // A successful probe clears the failure streak.
        state.observe_liveness(Liveness::Alive);
        assert_eq!(
            state.observe_liveness(Liveness::Unknown),
            LivenessVerdict::CheckFailed(1)
        );
    }

    #[test]
    fn binding_resets_monitoring_counters() {
        let mut state = JobState::default();
        state.failed_liveness_checks = 3;
        state.consecutive_not_alive = 1;
        state.bind(
            BoundRunner {
                runner_name: "local".to_string(),
                phase: JobPhase::Execution,
                handle: crate::runner::JobHandle {
                    native_id: "77".to_string(),
                    monitoring_command: "ps -p 77".to_string(),
                    kill_command: "kill 77".to_string(),
                },
                charged_threads: 1,
            },
            "2026-01-01T00:00:00Z".to_string(),
        );
        assert_eq!(state.failed_liveness_checks, 0);
        assert_eq!(state.consecutive_not_alive, 0);
        assert!(state.bound.is_some());
        assert!(state.submitted_at.is_some());
    }
}
