use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{MillError, MillResult};
use crate::instance::Instance;
use crate::job::{BoundRunner, JobPhase};
use crate::plan::ChunkDescriptor;
use crate::runner::JobHandle;
use crate::status::Status;

pub const DB_FILE: &str = "seqmill.db";

/// Static run configuration captured once in `run` mode and read back
/// verbatim by the database-backed modes.
#[derive(Debug, Clone, PartialEq)]
pub struct RunParameters {
    pub run_id: String,
    pub sequence_path: String,
    pub plan_path: String,
    pub config_path: String,
    pub workdir: String,
    pub instance_runner: String,
    pub task_runner: String,
    pub max_parallel_instances: u32,
    pub monitoring_interval_secs: u64,
    pub kill_on_abort: bool,
    pub ignore_masking: bool,
    pub plan_checksum: String,
    pub config_checksum: String,
}

/// Monotone aggregate over every completed instance.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunStats {
    pub total_cpu_secs: f64,
    pub total_real_secs: f64,
    pub total_disk_usage: u64,
}

/// One row of the status overview used by the `status` subcommand.
#[derive(Debug, Clone, PartialEq)]
pub struct OverviewRow {
    pub sequence_name: String,
    pub chunk_name: String,
    pub status: Status,
    pub progress: u32,
}

/// Embedded relational store holding the instance rows, the run
/// parameters and the aggregate statistics. Every write happens inside an
/// implicit transaction, so a crashed writer never leaves a row half
/// updated.
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(workdir: &Path) -> MillResult<Self> {
        Self::open_file(&workdir.join(DB_FILE))
    }

    pub fn open_file(path: &Path) -> MillResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        store.ensure_stats_row()?;
        Ok(store)
    }

    fn migrate(&self) -> MillResult<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;

            CREATE TABLE IF NOT EXISTS parameters (
              run_id TEXT NOT NULL,
              sequence_path TEXT NOT NULL,
              plan_path TEXT NOT NULL,
              config_path TEXT NOT NULL,
              workdir TEXT NOT NULL,
              instance_runner TEXT NOT NULL,
              task_runner TEXT NOT NULL,
              max_parallel_instances INTEGER NOT NULL,
              monitoring_interval_secs INTEGER NOT NULL,
              kill_on_abort INTEGER NOT NULL,
              ignore_masking INTEGER NOT NULL,
              plan_checksum TEXT NOT NULL,
              config_checksum TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS instances (
              id INTEGER PRIMARY KEY,
              sequence_name TEXT NOT NULL,
              chunk_name TEXT NOT NULL,
              chunk_number INTEGER NOT NULL,
              start_offset INTEGER NOT NULL,
              end_offset INTEGER NOT NULL,
              status TEXT NOT NULL,
              progress INTEGER NOT NULL DEFAULT 0,
              submission_date TEXT,
              start_date TEXT,
              end_date TEXT,
              elapsed_secs REAL,
              fasta_path TEXT,
              directory TEXT,
              directory_size INTEGER,
              native_job_id TEXT,
              monitoring_command TEXT,
              kill_command TEXT,
              backup_archive TEXT
            );

            CREATE TABLE IF NOT EXISTS run_stats (
              total_cpu_secs REAL NOT NULL,
              total_real_secs REAL NOT NULL,
              total_disk_usage INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn ensure_stats_row(&self) -> MillResult<()> {
        let count: i64 = self
            .conn
            .query_row("SELECT count(*) FROM run_stats", [], |row| row.get(0))?;
        if count == 0 {
            self.conn.execute(
                "INSERT INTO run_stats (total_cpu_secs, total_real_secs, total_disk_usage) \
                 VALUES (0.0, 0.0, 0)",
                [],
            )?;
        }
        Ok(())
    }

    /// A store that has never registered a run.
    pub fn is_fresh(&self) -> MillResult<bool> {
        let instances: i64 = self
            .conn
            .query_row("SELECT count(*) FROM instances", [], |row| row.get(0))?;
        let parameters: i64 = self
            .conn
            .query_row("SELECT count(*) FROM parameters", [], |row| row.get(0))?;
        Ok(instances == 0 && parameters == 0)
    }

    // --- Parameters ---

    pub fn save_parameters(&self, p: &RunParameters) -> MillResult<()> {
        self.conn.execute("DELETE FROM parameters", [])?;
        self.conn.execute(
            "INSERT INTO parameters (run_id, sequence_path, plan_path, config_path, workdir, \
             instance_runner, task_runner, max_parallel_instances, monitoring_interval_secs, \
             kill_on_abort, ignore_masking, plan_checksum, config_checksum) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                p.run_id,
                p.sequence_path,
                p.plan_path,
                p.config_path,
                p.workdir,
                p.instance_runner,
                p.task_runner,
                p.max_parallel_instances,
                p.monitoring_interval_secs as i64,
                p.kill_on_abort as i64,
                p.ignore_masking as i64,
                p.plan_checksum,
                p.config_checksum,
            ],
        )?;
        Ok(())
    }

    pub fn load_parameters(&self) -> MillResult<RunParameters> {
        self.conn
            .query_row(
                "SELECT run_id, sequence_path, plan_path, config_path, workdir, instance_runner, \
                 task_runner, max_parallel_instances, monitoring_interval_secs, kill_on_abort, \
                 ignore_masking, plan_checksum, config_checksum FROM parameters",
                [],
                |row| {
                    Ok(RunParameters {
                        run_id: row.get(0)?,
                        sequence_path: row.get(1)?,
                        plan_path: row.get(2)?,
                        config_path: row.get(3)?,
                        workdir: row.get(4)?,
                        instance_runner: row.get(5)?,
                        task_runner: row.get(6)?,
                        max_parallel_instances: row.get(7)?,
                        monitoring_interval_secs: row.get::<_, i64>(8)? as u64,
                        kill_on_abort: row.get::<_, i64>(9)? != 0,
                        ignore_masking: row.get::<_, i64>(10)? != 0,
                        plan_checksum: row.get(11)?,
                        config_checksum: row.get(12)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| {
                MillError::Internal("the store holds no run parameters to resume from".to_string())
            })
    }

    // --- Instance registration & updates ---

    /// Bulk-register every instance of the run before any submission.
    pub fn register_instances(&mut self, instances: &[Instance]) -> MillResult<()> {
        let tx = self.conn.transaction()?;
        for instance in instances {
            tx.execute(
                "INSERT INTO instances (id, sequence_name, chunk_name, chunk_number, \
                 start_offset, end_offset, status, progress) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
                params![
                    instance.id,
                    instance.chunk.sequence,
                    instance.chunk.chunk_name,
                    instance.chunk.chunk_number,
                    instance.chunk.start_offset as i64,
                    instance.chunk.end_offset as i64,
                    instance.status().to_string(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Record the native handle and resume commands at submission time.
    pub fn update_at_submission(&self, instance: &Instance) -> MillResult<()> {
        let bound = instance.state.bound.as_ref().ok_or_else(|| {
            MillError::Internal(format!(
                "update_at_submission called for {} without a bound runner",
                instance.description()
            ))
        })?;
        self.conn.execute(
            "UPDATE instances SET status = ?1, submission_date = ?2, fasta_path = ?3, \
             directory = ?4, native_job_id = ?5, monitoring_command = ?6, kill_command = ?7 \
             WHERE id = ?8",
            params![
                instance.status().to_string(),
                instance.state.submitted_at,
                instance.fasta_path.as_ref().map(|p| p.display().to_string()),
                instance.directory.as_ref().map(|p| p.display().to_string()),
                bound.handle.native_id,
                bound.handle.monitoring_command,
                bound.handle.kill_command,
                instance.id,
            ],
        )?;
        Ok(())
    }

    /// Best-effort per-tick snapshot of status and progress.
    pub fn update_during_monitoring(&self, id: u32, status: Status, progress: u32) -> MillResult<()> {
        self.conn.execute(
            "UPDATE instances SET status = ?1, progress = ?2 WHERE id = ?3",
            params![status.to_string(), progress, id],
        )?;
        Ok(())
    }

    /// Final write at the terminal transition.
    pub fn update_at_completion(&self, instance: &Instance) -> MillResult<()> {
        self.conn.execute(
            "UPDATE instances SET status = ?1, progress = ?2, start_date = ?3, end_date = ?4, \
             elapsed_secs = ?5, directory_size = ?6, backup_archive = ?7 WHERE id = ?8",
            params![
                instance.status().to_string(),
                instance.progress,
                instance.start_date,
                instance.end_date,
                instance.elapsed_secs,
                instance.directory_size.map(|s| s as i64),
                instance
                    .backup_archive
                    .as_ref()
                    .map(|p| p.display().to_string()),
                instance.id,
            ],
        )?;
        Ok(())
    }

    /// Rewrite a failed or canceled row as a fresh pending entry, keeping
    /// its id and chunk geometry and recording the backup archive of the
    /// previous attempt.
    pub fn reset_instance_for_retry(&self, id: u32, backup_archive: &Path) -> MillResult<()> {
        self.conn.execute(
            "UPDATE instances SET status = ?1, progress = 0, submission_date = NULL, \
             start_date = NULL, end_date = NULL, elapsed_secs = NULL, fasta_path = NULL, \
             directory = NULL, directory_size = NULL, native_job_id = NULL, \
             monitoring_command = NULL, kill_command = NULL, backup_archive = ?2 WHERE id = ?3",
            params![
                Status::Pending.to_string(),
                backup_archive.display().to_string(),
                id,
            ],
        )?;
        Ok(())
    }

    // --- Loading ---

    /// Rebuild the full instance set from the store. Rows that were
    /// already submitted get their runner handle rebound from the persisted
    /// monitoring and kill commands, so polling resumes without any
    /// resubmission.
    pub fn load_instances(&self, instance_runner: &str) -> MillResult<Vec<Instance>> {
        let mut statement = self.conn.prepare(
            "SELECT id, sequence_name, chunk_name, chunk_number, start_offset, end_offset, \
             status, progress, submission_date, start_date, end_date, elapsed_secs, fasta_path, \
             directory, directory_size, native_job_id, monitoring_command, kill_command, \
             backup_archive FROM instances ORDER BY id",
        )?;

        let rows = statement.query_map([], |row| {
            let status_text: String = row.get(6)?;
            let native_job_id: Option<String> = row.get(15)?;
            let monitoring_command: Option<String> = row.get(16)?;
            let kill_command: Option<String> = row.get(17)?;

            let mut instance = Instance::new(
                row.get(0)?,
                ChunkDescriptor {
                    sequence: row.get(1)?,
                    chunk_name: row.get(2)?,
                    chunk_number: row.get(3)?,
                    start_offset: row.get::<_, i64>(4)? as u64,
                    end_offset: row.get::<_, i64>(5)? as u64,
                },
            );
            instance.state.status = status_text.parse::<Status>().unwrap_or(Status::Error);
            instance.progress = row.get(7)?;
            instance.state.submitted_at = row.get(8)?;
            instance.start_date = row.get(9)?;
            instance.end_date = row.get(10)?;
            instance.elapsed_secs = row.get(11)?;
            instance.fasta_path = row.get::<_, Option<String>>(12)?.map(PathBuf::from);
            instance.directory = row.get::<_, Option<String>>(13)?.map(PathBuf::from);
            instance.directory_size = row.get::<_, Option<i64>>(14)?.map(|s| s as u64);
            instance.backup_archive = row.get::<_, Option<String>>(18)?.map(PathBuf::from);

            if !instance.state.status.is_terminal() {
                if let (Some(native_id), Some(monitoring), Some(kill)) =
                    (native_job_id, monitoring_command, kill_command)
                {
                    instance.state.bound = Some(BoundRunner {
                        runner_name: instance_runner.to_string(),
                        phase: JobPhase::Unit,
                        handle: JobHandle {
                            native_id,
                            monitoring_command: monitoring,
                            kill_command: kill,
                        },
                        charged_threads: 1,
                    });
                    instance.state.last_liveness_check = Some(std::time::Instant::now());
                }
            }
            Ok(instance)
        })?;

        let mut instances = Vec::new();
        for row in rows {
            instances.push(row?);
        }
        Ok(instances)
    }

    // --- Reporting ---

    pub fn status_counters(&self) -> MillResult<BTreeMap<String, u32>> {
        let mut statement = self
            .conn
            .prepare("SELECT status, count(*) FROM instances GROUP BY status")?;
        let rows = statement.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
        })?;
        let mut counters = BTreeMap::new();
        for row in rows {
            let (status, count) = row?;
            counters.insert(status, count);
        }
        Ok(counters)
    }

    pub fn overview(&self) -> MillResult<Vec<OverviewRow>> {
        let mut statement = self.conn.prepare(
            "SELECT sequence_name, chunk_name, status, progress FROM instances ORDER BY id",
        )?;
        let rows = statement.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, u32>(3)?,
            ))
        })?;
        let mut overview = Vec::new();
        for row in rows {
            let (sequence_name, chunk_name, status_text, progress) = row?;
            overview.push(OverviewRow {
                sequence_name,
                chunk_name,
                status: status_text.parse::<Status>().unwrap_or(Status::Error),
                progress,
            });
        }
        Ok(overview)
    }

    pub fn stats(&self) -> MillResult<RunStats> {
        self.conn
            .query_row(
                "SELECT total_cpu_secs, total_real_secs, total_disk_usage FROM run_stats",
                [],
                |row| {
                    Ok(RunStats {
                        total_cpu_secs: row.get(0)?,
                        total_real_secs: row.get(1)?,
                        total_disk_usage: row.get::<_, i64>(2)? as u64,
                    })
                },
            )
            .map_err(MillError::from)
    }

    /// Fold one completed instance into the aggregate statistics. The
    /// totals only ever grow.
    pub fn add_completion_stats(
        &self,
        cpu_secs: f64,
        real_secs: f64,
        disk_usage: u64,
    ) -> MillResult<()> {
        self.conn.execute(
            "UPDATE run_stats SET total_cpu_secs = total_cpu_secs + ?1, \
             total_real_secs = total_real_secs + ?2, \
             total_disk_usage = total_disk_usage + ?3",
            params![cpu_secs, real_secs, disk_usage as i64],
        )?;
        Ok(())
    }
}
