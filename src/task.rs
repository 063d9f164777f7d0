use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::artifacts::TaskAbstract;
use crate::job::JobState;
use crate::plan::PlanEntry;
use crate::stats::PhaseSample;
use crate::status::Status;

/// Directory holding the per-task abstract documents inside a unit
/// working directory.
pub const SUMMARIES_DIR: &str = "summaries";

/// One tool invocation inside a unit run, with its execution and parsing
/// sub-phases.
#[derive(Debug)]
pub struct Task {
    pub id: u32,
    pub tool: String,
    pub step: u32,
    pub sequence: String,
    pub cores: u32,
    pub spawns_subprocesses: bool,
    /// Dependency id mapped to the optional tool pin recorded by the plan
    /// loader (pins are validated at load time only).
    pub dependencies: BTreeMap<u32, Option<String>>,
    /// Satisfied dependency ids; grows monotonically.
    pub satisfied: BTreeSet<u32>,
    pub state: JobState,
    /// Runner selected for the next submission; swaps to the fallback when
    /// the preferred runner is incompatible and back after execution.
    pub runner_name: String,
    pub need_parsing: bool,
    pub file_to_parse: Option<String>,
    pub skipped: bool,
    pub exec_sample: Option<PhaseSample>,
    pub parsing_sample: Option<PhaseSample>,
}

impl Task {
    pub fn from_plan(entry: &PlanEntry, runner_name: &str) -> Self {
        Self {
            id: entry.id,
            tool: entry.tool.clone(),
            step: entry.step,
            sequence: entry.sequence.clone(),
            cores: entry.cores,
            spawns_subprocesses: entry.spawns_subprocesses,
            dependencies: entry.dependencies.clone(),
            satisfied: BTreeSet::new(),
            state: JobState::default(),
            runner_name: runner_name.to_string(),
            need_parsing: false,
            file_to_parse: None,
            skipped: false,
            exec_sample: None,
            parsing_sample: None,
        }
    }

    pub fn status(&self) -> Status {
        self.state.status
    }

    /// Log-friendly identity, phase-aware like the rest of the engine's
    /// messages.
    pub fn description(&self) -> String {
        let phase = match self.state.status {
            Status::SubmittedExec | Status::RunningExec => "exec ",
            Status::SubmittedParsing | Status::RunningParsing => "parsing ",
            _ => "",
        };
        format!("task {} {}[{} - step {}]", self.id, phase, self.tool, self.step)
    }

    // --- Dependencies ---

    pub fn mark_dependency_satisfied(&mut self, completed_id: u32) {
        if self.dependencies.contains_key(&completed_id) {
            self.satisfied.insert(completed_id);
        }
    }

    pub fn has_unsatisfied_dependencies(&self) -> bool {
        self.satisfied.len() < self.dependencies.len()
    }

    // --- Directory & artifact layout ---

    pub fn exec_dir_name(&self) -> String {
        format!("{:03}_{}_execution", self.id, self.tool)
    }

    pub fn parsing_dir_name(&self) -> String {
        format!("{:03}_{}_parsing", self.id, self.tool)
    }

    pub fn exec_abstract_path(&self, workdir: &Path) -> PathBuf {
        workdir
            .join(SUMMARIES_DIR)
            .join(format!("{:03}_{}_execution_result.json", self.id, self.tool))
    }

    pub fn parsing_abstract_path(&self, workdir: &Path) -> PathBuf {
        workdir
            .join(SUMMARIES_DIR)
            .join(format!("{:03}_{}_parsing_result.json", self.id, self.tool))
    }

    /// Thread slots this task occupies in its current lifecycle position:
    /// the configured core count through execution, one during parsing.
    pub fn threads_based_on_status(&self) -> u32 {
        match self.state.status {
            Status::Pending | Status::SubmittedExec | Status::RunningExec => self.cores,
            Status::FinishedExec | Status::SubmittedParsing | Status::RunningParsing => 1,
            Status::Completed => {
                if self.need_parsing {
                    1
                } else {
                    self.cores
                }
            }
            _ => 0,
        }
    }

    // --- Abstract absorption ---

    /// Fold the execution abstract into the task. Returns false when the
    /// document reported a failure (the task is already in `Error` then).
    pub fn absorb_exec_abstract(&mut self, doc: &TaskAbstract, quiet: bool) -> bool {
        if doc.is_error() {
            if !quiet {
                self.state
                    .set_error(&self.description(), "execution exited with error status");
            }
            return false;
        }
        if doc.is_skip() {
            self.skipped = true;
        }
        if doc.need_parsing {
            match &doc.output_file {
                Some(output_file) => {
                    self.need_parsing = true;
                    self.file_to_parse = Some(output_file.clone());
                }
                None => {
                    if !quiet {
                        self.state.set_error(
                            &self.description(),
                            "execution abstract requests parsing but names no output file",
                        );
                    }
                    return false;
                }
            }
        }
        if let (Some(cpu), Some(real)) = (doc.cpu_time_secs, doc.real_time_secs) {
            self.exec_sample = Some(PhaseSample {
                cpu_secs: cpu,
                real_secs: real,
            });
        }
        true
    }

    /// Fold the parsing abstract into the task. Same contract as
    /// `absorb_exec_abstract`.
    pub fn absorb_parsing_abstract(&mut self, doc: &TaskAbstract, quiet: bool) -> bool {
        if doc.is_error() {
            if !quiet {
                self.state
                    .set_error(&self.description(), "parsing exited with error status");
            }
            return false;
        }
        if let (Some(cpu), Some(real)) = (doc.cpu_time_secs, doc.real_time_secs) {
            self.parsing_sample = Some(PhaseSample {
                cpu_secs: cpu,
                real_secs: real,
            });
        }
        true
    }
}
