use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;

use weft::config::Config;
use weft::core::TaskAnalyzer;
use weft::orchestration::SchedulerEvent;
use weft::{load_batch, wlog, Orchestrator, Result};

/// weft - run a batch of tasks in parallel, one git worktree per task
#[derive(Parser, Debug)]
#[command(name = "weft")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    WEFT_LOG=<level>    Log level: error, warn, info, debug or trace")]
pub struct Cli {
    /// Enable debug logging (writes to <state_dir>/weft.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (default: ~/.weft/weft.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a batch of tasks (JSON array or TOML [[task]] tables)
    Run {
        batch: PathBuf,

        /// Repository to work in
        #[arg(long, default_value = ".")]
        repo: PathBuf,

        /// Override max_parallel from the config
        #[arg(short = 'j', long)]
        max_parallel: Option<usize>,

        /// Write the JSON report here instead of stdout
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Print scheduling levels and synthesized file-conflict edges
    Analyze { batch: PathBuf },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Analyze { batch } => run_analyze(&batch),
        Command::Run {
            batch,
            repo,
            max_parallel,
            report,
        } => {
            if let Some(n) = max_parallel {
                config.max_parallel = n;
            }
            weft::log::init(&config.state_path()?, cli.debug);
            wlog!("weft starting: batch {}", batch.display());
            run_batch(config, &batch, repo, report)
        }
    }
}

fn run_analyze(batch: &Path) -> Result<()> {
    let analysis = TaskAnalyzer::analyze(load_batch(batch)?)?;

    for level in &analysis.levels {
        let ids: Vec<&str> = level.tasks.iter().map(|t| t.as_str()).collect();
        println!("level {}: {}", level.index, ids.join(", "));
    }
    if !analysis.implicit_edges.is_empty() {
        println!();
        for edge in &analysis.implicit_edges {
            println!(
                "{} -> {} (shared: {})",
                edge.before,
                edge.after,
                edge.patterns.join(", ")
            );
        }
    }
    if !analysis.rejected.is_empty() {
        println!();
        for (id, err) in &analysis.rejected {
            println!("rejected {}: {}", id, err);
        }
    }
    Ok(())
}

fn run_batch(
    config: Config,
    batch: &Path,
    repo: PathBuf,
    report_path: Option<PathBuf>,
) -> Result<()> {
    let specs = load_batch(batch)?;
    let rt = tokio::runtime::Runtime::new()?;

    let report = rt.block_on(async {
        let orchestrator = Orchestrator::new(repo, config);
        let cancel = orchestrator.cancel_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Interrupted; cancelling the batch");
                cancel.cancel();
            }
        });

        let batch = orchestrator.prepare(specs).await?;
        let mut events = batch.handle().subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SchedulerEvent::StatusChanged { task_id, to, .. }) => {
                        eprintln!("{:<24} {}", task_id.as_str(), to);
                    }
                    Ok(SchedulerEvent::Retrying { task_id, retry, delay }) => {
                        eprintln!("{:<24} retry {} in {:?}", task_id.as_str(), retry, delay);
                    }
                    Ok(SchedulerEvent::SequentialFallback { failure_rate }) => {
                        eprintln!(
                            "failure rate {:.0}%: running sequentially",
                            failure_rate * 100.0
                        );
                    }
                    Ok(SchedulerEvent::AllTasksComplete) | Err(RecvError::Closed) => break,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                }
            }
        });

        batch.run().await
    })?;

    match report_path {
        Some(path) => {
            report.write_to(&path)?;
            eprintln!("Report written to {}", path.display());
        }
        None => println!("{}", report.to_json()?),
    }

    if !report.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
