use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use seqmill::artifacts::{self, FsArtifactReader};
use seqmill::config::{load_config, MillConfig};
use seqmill::db::Store;
use seqmill::lock;
use seqmill::log::parse_log_level;
use seqmill::pipeline::{HaltReason, PipelineScheduler, RunOptions};
use seqmill::plan;
use seqmill::status::Status;
use seqmill::unit::{UnitOptions, UnitScheduler};
use seqmill::{log_error, log_info};

#[derive(Parser)]
#[command(name = "seqmill", about = "Two-tier batch orchestration for chunked annotation runs")]
struct Cli {
    /// Log verbosity level (error, warn, info, debug)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register and execute a new analysis over every chunk
    Run {
        /// Main FASTA file the chunk offsets refer to
        #[arg(long)]
        sequence: PathBuf,
        /// Chunk manifest produced by the sequence splitter
        #[arg(long)]
        chunks: PathBuf,
        /// Task plan executed inside every chunk
        #[arg(long)]
        tasks: PathBuf,
        /// Configuration file (defaults to {workdir}/seqmill.toml)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Main execution directory
        #[arg(long, default_value = ".")]
        workdir: PathBuf,
        /// Runner submitting the per-chunk unit jobs
        #[arg(long, default_value = "local")]
        instance_runner: String,
        /// Runner the unit jobs use for their tool invocations
        #[arg(long, default_value = "local")]
        task_runner: String,
        /// Kill running jobs on abort instead of letting them finish
        #[arg(long)]
        kill_on_abort: bool,
        /// Uppercase chunk sequences, dropping soft-masking
        #[arg(long)]
        ignore_masking: bool,
    },
    /// Run the inner task scheduler for one chunk (launched by `run`)
    Unit {
        /// Chunk FASTA file to analyze
        #[arg(long)]
        sequence: PathBuf,
        /// Task plan to execute
        #[arg(long)]
        tasks: PathBuf,
        /// Configuration file
        #[arg(long)]
        config: PathBuf,
        /// Working directory of this chunk
        #[arg(long, default_value = ".")]
        workdir: PathBuf,
        /// Runner submitting the execution/parsing jobs
        #[arg(long, default_value = "local")]
        runner: String,
        /// Maintain a progress artifact in the working directory
        #[arg(long)]
        progress: bool,
        /// Kill running jobs on abort instead of letting them finish
        #[arg(long)]
        kill_on_abort: bool,
        /// Ignore SIGINT (used when launched by a local instance runner so
        /// Ctrl+C reaches only the outer scheduler)
        #[arg(long)]
        no_interrupt: bool,
    },
    /// Resume a halted run from its persisted state
    Resume {
        #[arg(long, default_value = ".")]
        workdir: PathBuf,
    },
    /// Archive failed/canceled chunks and run them again
    Retry {
        #[arg(long, default_value = ".")]
        workdir: PathBuf,
    },
    /// Show the per-chunk status table and aggregate statistics
    Status {
        #[arg(long, default_value = ".")]
        workdir: PathBuf,
    },
    /// Request a cascade abort of a running analysis
    Abort {
        #[arg(long, default_value = ".")]
        workdir: PathBuf,
        /// Escalate to forced kill instead of a graceful stop
        #[arg(long)]
        kill: bool,
    },
}

// --- Signal handling ---

fn shutdown_flag() -> &'static Arc<AtomicBool> {
    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

fn install_signal_handlers(ignore_sigint: bool) -> Result<(), String> {
    let flag = Arc::clone(shutdown_flag());
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))
        .map_err(|e| format!("Failed to register the SIGTERM handler: {}", e))?;
    if ignore_sigint {
        // Registering a handler that only sets an unread flag keeps the
        // default terminate-on-SIGINT behavior from firing.
        let ignored = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(signal_hook::consts::SIGINT, ignored)
            .map_err(|e| format!("Failed to register the SIGINT handler: {}", e))?;
    } else {
        signal_hook::flag::register(signal_hook::consts::SIGINT, flag)
            .map_err(|e| format!("Failed to register the SIGINT handler: {}", e))?;
    }
    Ok(())
}

/// Bridge the signal flag into a cancellation token the schedulers poll.
fn spawn_shutdown_watcher(cancel: CancellationToken) {
    tokio::spawn(async move {
        loop {
            if shutdown_flag().load(Ordering::Relaxed) {
                cancel.cancel();
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        }
    });
}

fn reader_for(config: &MillConfig) -> Box<FsArtifactReader> {
    Box::new(FsArtifactReader::new(config.global.artifact_debounce_secs))
}

fn fail(message: impl std::fmt::Display) -> ! {
    log_error!("Error: {}", message);
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match parse_log_level(&cli.log_level) {
        Ok(level) => seqmill::log::set_log_level(level),
        Err(e) => fail(e),
    }

    match cli.command {
        Commands::Run {
            sequence,
            chunks,
            tasks,
            config,
            workdir,
            instance_runner,
            task_runner,
            kill_on_abort,
            ignore_masking,
        } => {
            let config_path = config.unwrap_or_else(|| workdir.join("seqmill.toml"));
            let config = load_config(&config_path).unwrap_or_else(|e| fail(e));

            let _lock = lock::acquire_workdir_lock(&workdir).unwrap_or_else(|e| fail(e));
            if let Err(e) = install_signal_handlers(false) {
                fail(e);
            }
            let cancel = CancellationToken::new();
            spawn_shutdown_watcher(cancel.clone());

            let options = RunOptions {
                workdir,
                sequence_path: sequence,
                chunks_path: chunks,
                plan_path: tasks,
                config_path,
                instance_runner,
                task_runner,
                kill_on_abort,
                ignore_original_masking: ignore_masking,
            };
            let reader = reader_for(&config);
            let mut scheduler = PipelineScheduler::prepare_run(options, config, reader)
                .unwrap_or_else(|e| fail(e));
            run_pipeline(&mut scheduler, &cancel).await;
        }

        Commands::Resume { workdir } => {
            let config = config_from_store(&workdir);
            let _lock = lock::acquire_workdir_lock(&workdir).unwrap_or_else(|e| fail(e));
            if let Err(e) = install_signal_handlers(false) {
                fail(e);
            }
            let cancel = CancellationToken::new();
            spawn_shutdown_watcher(cancel.clone());

            let reader = reader_for(&config);
            let mut scheduler = PipelineScheduler::prepare_resume(&workdir, config, reader)
                .unwrap_or_else(|e| fail(e));
            run_pipeline(&mut scheduler, &cancel).await;
        }

        Commands::Retry { workdir } => {
            let config = config_from_store(&workdir);
            let _lock = lock::acquire_workdir_lock(&workdir).unwrap_or_else(|e| fail(e));
            if let Err(e) = install_signal_handlers(false) {
                fail(e);
            }
            let cancel = CancellationToken::new();
            spawn_shutdown_watcher(cancel.clone());

            let reader = reader_for(&config);
            let mut scheduler = PipelineScheduler::prepare_retry(&workdir, config, reader)
                .unwrap_or_else(|e| fail(e));
            run_pipeline(&mut scheduler, &cancel).await;
        }

        Commands::Unit {
            sequence,
            tasks,
            config,
            workdir,
            runner,
            progress,
            kill_on_abort,
            no_interrupt,
        } => {
            let mill_config = load_config(&config).unwrap_or_else(|e| fail(e));
            let _lock = lock::acquire_workdir_lock(&workdir).unwrap_or_else(|e| fail(e));
            if let Err(e) = install_signal_handlers(no_interrupt) {
                fail(e);
            }
            let cancel = CancellationToken::new();
            spawn_shutdown_watcher(cancel.clone());

            let task_plan = plan::load_plan(&tasks).unwrap_or_else(|e| fail(e));
            log_info!(
                "Starting a unit analysis for {} ({} tasks)",
                sequence.display(),
                task_plan.entries.len()
            );

            let options = UnitOptions {
                workdir,
                sequence_path: sequence,
                plan_path: tasks,
                config_path: config,
                runner_name: runner,
                report_progress: progress,
                kill_on_abort,
            };
            let reader = reader_for(&mill_config);
            let mut scheduler = UnitScheduler::new(options, mill_config, &task_plan, reader)
                .unwrap_or_else(|e| fail(e));
            scheduler.prepare_workdir().unwrap_or_else(|e| fail(e));

            match scheduler.run(&cancel).await {
                Ok(summary) => {
                    log_info!(
                        "Unit analysis finished: {} ({}/{} tasks completed)",
                        summary.status,
                        summary.completed_tasks,
                        summary.total_tasks
                    );
                    if summary.status != Status::Completed {
                        std::process::exit(1);
                    }
                }
                Err(e) => fail(e),
            }
        }

        Commands::Status { workdir } => {
            show_status(&workdir);
        }

        Commands::Abort { workdir, kill } => {
            if let Err(e) = artifacts::write_abort(&workdir, kill) {
                fail(e);
            }
            log_info!(
                "Abort requested{}; the running scheduler will cascade it on its next turn",
                if kill { " (forced kill)" } else { "" }
            );
        }
    }
}

/// Load the configuration recorded in the store's parameters row, for the
/// modes that resume an existing run.
fn config_from_store(workdir: &Path) -> MillConfig {
    let store = Store::open(workdir).unwrap_or_else(|e| fail(e));
    let parameters = store.load_parameters().unwrap_or_else(|e| fail(e));
    load_config(Path::new(&parameters.config_path)).unwrap_or_else(|e| fail(e))
}

async fn run_pipeline(scheduler: &mut PipelineScheduler, cancel: &CancellationToken) {
    match scheduler.run(cancel).await {
        Ok(summary) => {
            log_info!(
                "Analysis finished: {} completed, {} in error, {} canceled",
                summary.completed,
                summary.errored,
                summary.canceled
            );
            if summary.halt_reason == HaltReason::Aborted || summary.errored > 0 {
                std::process::exit(1);
            }
        }
        Err(e) => fail(e),
    }
}

fn show_status(workdir: &Path) {
    let store = Store::open(workdir).unwrap_or_else(|e| fail(e));
    let overview = store.overview().unwrap_or_else(|e| fail(e));
    if overview.is_empty() {
        log_info!("No instances are registered in {}", workdir.display());
        return;
    }

    println!("{:<20} {:<24} {:<18} {:>8}", "sequence", "chunk", "status", "progress");
    for row in &overview {
        println!(
            "{:<20} {:<24} {:<18} {:>7}%",
            row.sequence_name, row.chunk_name, row.status, row.progress
        );
    }

    if let Ok(stats) = store.stats() {
        println!(
            "\ntotal cpu time: {:.1}s, total real time: {:.1}s, disk usage: {} bytes",
            stats.total_cpu_secs, stats.total_real_secs, stats.total_disk_usage
        );
    }
}
