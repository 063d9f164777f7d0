use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use serde::{Deserialize, Deserializer};

use crate::error::{MillError, MillResult};

// --- Task plan ---

/// A dependency declaration: either a bare task id or an id with a pinned
/// tool name the dependency must resolve to.
#[derive(Debug, Clone, PartialEq)]
pub struct DepSpec {
    pub id: u32,
    pub tool: Option<String>,
}

/// Accepts both a bare integer (`needs = [1, 2]`) and a full table
/// (`needs = [{ id = 3, tool = "eugene" }]`).
impl<'de> Deserialize<'de> for DepSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum DepSpecRaw {
            Id(u32),
            Pinned {
                id: u32,
                #[serde(default)]
                tool: Option<String>,
            },
        }

        match DepSpecRaw::deserialize(deserializer)? {
            DepSpecRaw::Id(id) => Ok(DepSpec { id, tool: None }),
            DepSpecRaw::Pinned { id, tool } => Ok(DepSpec { id, tool }),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub id: u32,
    pub tool: String,
    pub step: u32,
    /// Input sequence reference; "initial" means the chunk sequence itself.
    #[serde(default = "default_sequence")]
    pub sequence: String,
    #[serde(default = "default_cores")]
    pub cores: u32,
    /// Tools that submit further jobs while running (relevant for back-ends
    /// refusing submissions from compute nodes).
    #[serde(default)]
    pub spawns_subprocesses: bool,
    #[serde(default)]
    pub needs: Vec<DepSpec>,
    /// Wildcard dependency on every task of an earlier step, resolved at
    /// load time.
    #[serde(default)]
    pub needs_step: Option<u32>,
}

fn default_sequence() -> String {
    "initial".to_string()
}

fn default_cores() -> u32 {
    1
}

#[derive(Deserialize, Debug, Clone, Default)]
struct PlanFile {
    #[serde(default)]
    description: String,
    #[serde(default)]
    tasks: Vec<TaskSpec>,
}

/// A fully validated task entry with its wildcard dependencies resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanEntry {
    pub id: u32,
    pub tool: String,
    pub step: u32,
    pub sequence: String,
    pub cores: u32,
    pub spawns_subprocesses: bool,
    /// Dependency id mapped to the optional pinned tool name.
    pub dependencies: BTreeMap<u32, Option<String>>,
}

#[derive(Debug, Clone)]
pub struct TaskPlan {
    pub description: String,
    pub entries: Vec<PlanEntry>,
}

/// Load and validate a task plan.
///
/// Every problem is collected and reported in one pass: duplicate ids,
/// unknown or self dependencies, pinned-tool mismatches, and step wildcards
/// that do not reference an earlier step.
pub fn load_plan(path: &Path) -> MillResult<TaskPlan> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        MillError::Plan(format!("failed to read {}: {}", path.display(), e))
    })?;
    let plan: PlanFile = toml::from_str(&contents)
        .map_err(|e| MillError::Plan(format!("failed to parse {}: {}", path.display(), e)))?;
    resolve_plan(plan.description, plan.tasks)
}

fn resolve_plan(description: String, tasks: Vec<TaskSpec>) -> MillResult<TaskPlan> {
    let mut errors: Vec<String> = Vec::new();

    if tasks.is_empty() {
        errors.push("the plan contains no tasks".to_string());
    }

    let mut tool_by_id: HashMap<u32, &str> = HashMap::new();
    let mut step_by_id: HashMap<u32, u32> = HashMap::new();
    for task in &tasks {
        if tool_by_id.insert(task.id, task.tool.as_str()).is_some() {
            errors.push(format!("duplicate task id {}", task.id));
        }
        step_by_id.insert(task.id, task.step);
        if task.cores < 1 {
            errors.push(format!("task {}: cores must be >= 1", task.id));
        }
    }

    let mut entries = Vec::with_capacity(tasks.len());
    for task in &tasks {
        let mut dependencies: BTreeMap<u32, Option<String>> = BTreeMap::new();

        for dep in &task.needs {
            if dep.id == task.id {
                errors.push(format!("task {} depends on itself", task.id));
                continue;
            }
            match tool_by_id.get(&dep.id) {
                None => errors.push(format!(
                    "task {}: unknown dependency id {}",
                    task.id, dep.id
                )),
                Some(actual_tool) => {
                    if let Some(ref pinned) = dep.tool {
                        if !pinned.eq_ignore_ascii_case(actual_tool) {
                            errors.push(format!(
                                "task {}: dependency {} is pinned to tool '{}' but resolves to '{}'",
                                task.id, dep.id, pinned, actual_tool
                            ));
                        }
                    }
                    if step_by_id.get(&dep.id).copied().unwrap_or(0) > task.step {
                        errors.push(format!(
                            "task {}: dependency {} belongs to a later step and can never \
                             complete first",
                            task.id, dep.id
                        ));
                    }
                    dependencies.insert(dep.id, dep.tool.clone());
                }
            }
        }

        if let Some(step) = task.needs_step {
            if step >= task.step {
                errors.push(format!(
                    "task {}: needs_step {} must reference an earlier step (task is in step {})",
                    task.id, step, task.step
                ));
            } else {
                let mut matched = false;
                for other in &tasks {
                    if other.step == step && other.id != task.id {
                        dependencies.entry(other.id).or_insert(None);
                        matched = true;
                    }
                }
                if !matched {
                    errors.push(format!(
                        "task {}: needs_step {} matches no task",
                        task.id, step
                    ));
                }
            }
        }

        entries.push(PlanEntry {
            id: task.id,
            tool: task.tool.clone(),
            step: task.step,
            sequence: task.sequence.clone(),
            cores: task.cores,
            spawns_subprocesses: task.spawns_subprocesses,
            dependencies,
        });
    }

    if !errors.is_empty() {
        return Err(MillError::Plan(errors.join("; ")));
    }

    entries.sort_by_key(|e| e.id);
    Ok(TaskPlan {
        description,
        entries,
    })
}

// --- Chunk manifest ---

/// One entry of the chunk manifest produced by the external sequence
/// splitter. Offsets are byte positions into the main FASTA file.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ChunkDescriptor {
    pub sequence: String,
    pub chunk_name: String,
    /// 0 means the sequence was not split and the chunk covers all of it.
    pub chunk_number: u32,
    pub start_offset: u64,
    pub end_offset: u64,
}

impl ChunkDescriptor {
    pub fn size(&self) -> u64 {
        self.end_offset.saturating_sub(self.start_offset)
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
struct ChunkManifestFile {
    #[serde(default)]
    chunks: Vec<ChunkDescriptor>,
}

pub fn load_chunk_manifest(path: &Path) -> MillResult<Vec<ChunkDescriptor>> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        MillError::Plan(format!("failed to read {}: {}", path.display(), e))
    })?;
    let manifest: ChunkManifestFile = toml::from_str(&contents)
        .map_err(|e| MillError::Plan(format!("failed to parse {}: {}", path.display(), e)))?;

    let mut errors: Vec<String> = Vec::new();
    if manifest.chunks.is_empty() {
        errors.push("the chunk manifest contains no chunks".to_string());
    }

    let mut seen_names: HashSet<&str> = HashSet::new();
    for chunk in &manifest.chunks {
        if !seen_names.insert(chunk.chunk_name.as_str()) {
            errors.push(format!("duplicate chunk name '{}'", chunk.chunk_name));
        }
        if chunk.end_offset <= chunk.start_offset {
            errors.push(format!(
                "chunk '{}': end_offset must be greater than start_offset",
                chunk.chunk_name
            ));
        }
    }

    if !errors.is_empty() {
        return Err(MillError::Plan(errors.join("; ")));
    }

    Ok(manifest.chunks)
}

/// Maximum FASTA line width for generated chunk files. Some downstream
/// sequence libraries refuse lines longer than 64 KiB, so chunks are
/// re-wrapped instead of written as a single line.
const FASTA_LINE_WIDTH: usize = 80;

/// Extract the chunk's byte range from the main FASTA file and write it as
/// a standalone single-record FASTA file.
pub fn write_chunk_fasta(
    main_fasta: &Path,
    chunk: &ChunkDescriptor,
    destination: &Path,
    ignore_original_masking: bool,
) -> MillResult<()> {
    let mut input = std::fs::File::open(main_fasta)?;
    input.seek(SeekFrom::Start(chunk.start_offset))?;

    let mut raw = vec![0u8; chunk.size() as usize];
    input.read_exact(&mut raw)?;

    let mut sequence: String = String::from_utf8_lossy(&raw)
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if ignore_original_masking {
        sequence = sequence.to_uppercase();
    }

    let mut output = std::fs::File::create(destination)?;
    writeln!(output, ">{}", chunk.chunk_name)?;
    let bytes = sequence.as_bytes();
    for line in bytes.chunks(FASTA_LINE_WIDTH) {
        output.write_all(line)?;
        output.write_all(b"\n")?;
    }

    Ok(())
}
