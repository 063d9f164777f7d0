use serde::{Deserialize, Serialize};

/// Lifecycle status shared by both scheduler tiers.
///
/// The instance tier only uses the coarse states (`Pending`, `Submitted`,
/// `Running` and the terminals). The task tier refines `Running` into paired
/// execution/parsing phases, each with its own submitted/running pair.
///
/// `Completed`, `Error` and `Canceled` are terminal and mutually exclusive.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Pending,
    Submitted,
    Running,
    SubmittedExec,
    RunningExec,
    FinishedExec,
    SubmittedParsing,
    RunningParsing,
    Completed,
    Error,
    Canceled,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Error | Status::Canceled)
    }

    /// True while a submission is outstanding against a back-end, i.e. the
    /// job occupies a concurrency slot.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            Status::Submitted
                | Status::Running
                | Status::SubmittedExec
                | Status::RunningExec
                | Status::SubmittedParsing
                | Status::RunningParsing
        )
    }

    /// Validates whether a transition from this status to `to` is allowed.
    ///
    /// Rules:
    /// - Terminal statuses have no outgoing edges (a Completed job cannot be
    ///   retroactively canceled)
    /// - Any non-terminal status can short-circuit to Canceled or Error
    /// - Otherwise only forward progression along the lifecycle graph,
    ///   including the resume fast-forwards from Pending
    pub fn can_transition_to(&self, to: Status) -> bool {
        use Status::*;

        if self.is_terminal() {
            return false;
        }

        if to == Canceled || to == Error {
            return true;
        }

        matches!(
            (*self, to),
            (Pending, Submitted)
                | (Pending, SubmittedExec)
                | (Pending, FinishedExec)
                | (Pending, Completed)
                | (Submitted, Running)
                | (Submitted, Completed)
                | (Running, Completed)
                | (SubmittedExec, RunningExec)
                | (RunningExec, FinishedExec)
                | (FinishedExec, SubmittedParsing)
                | (FinishedExec, Completed)
                | (SubmittedParsing, RunningParsing)
                | (RunningParsing, Completed)
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Status::Pending => "pending",
            Status::Submitted => "submitted",
            Status::Running => "running",
            Status::SubmittedExec => "submitted_exec",
            Status::RunningExec => "running_exec",
            Status::FinishedExec => "finished_exec",
            Status::SubmittedParsing => "submitted_parsing",
            Status::RunningParsing => "running_parsing",
            Status::Completed => "completed",
            Status::Error => "error",
            Status::Canceled => "canceled",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Status::Pending),
            "submitted" => Ok(Status::Submitted),
            "running" => Ok(Status::Running),
            "submitted_exec" => Ok(Status::SubmittedExec),
            "running_exec" => Ok(Status::RunningExec),
            "finished_exec" => Ok(Status::FinishedExec),
            "submitted_parsing" => Ok(Status::SubmittedParsing),
            "running_parsing" => Ok(Status::RunningParsing),
            "completed" => Ok(Status::Completed),
            "error" => Ok(Status::Error),
            "canceled" => Ok(Status::Canceled),
            _ => Err(format!("<{}> is not a valid status name", s)),
        }
    }
}
