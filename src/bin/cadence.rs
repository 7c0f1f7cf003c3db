//! CLI binary for cadence.

use anyhow::Context;
use cadence::recurrence::{self, Frequency, RecurrenceEngine, RuleCache, TimezoneHandler};
use cadence::scheduler::{EventKind, JsonTimestampStore, MemoryTaskStore, Scheduler, Task};
use cadence::CadenceConfig;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Cadence: recurrence computation and reminder scheduling.
#[derive(Parser)]
#[command(name = "cadence", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long, env = "CADENCE_CONFIG")]
    config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Command,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Validate an RRULE and print errors and warnings.
    Validate {
        /// Rule text, e.g. "FREQ=MONTHLY;BYDAY=MO;BYSETPOS=1".
        rule: String,
        /// Series start (RFC 3339). Defaults to now.
        #[arg(long)]
        dtstart: Option<DateTime<Utc>>,
        /// IANA timezone the rule is evaluated in.
        #[arg(long)]
        timezone: Option<String>,
    },

    /// Print upcoming occurrences of a frequency.
    Next {
        /// Frequency as JSON, e.g. '{"type":"weekly","weekdays":[1,3]}'.
        frequency: String,
        /// Reference instant (RFC 3339). Defaults to now.
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        /// Number of occurrences to print.
        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,
    },

    /// Run recovery and one due/overdue check over a JSON task file.
    Check {
        /// JSON array of tasks.
        tasks: PathBuf,
        /// Timestamp file holding the last-run time.
        #[arg(long)]
        state: Option<PathBuf>,
        /// Write advanced due dates back to the task file.
        #[arg(long)]
        write_back: bool,
        /// Keep checking on the configured interval until Ctrl+C.
        #[arg(long)]
        watch: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cadence=info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => CadenceConfig::from_file(path)
            .with_context(|| format!("cannot load config from {}", path.display()))?,
        None => {
            let path = CadenceConfig::default_config_path();
            if path.exists() {
                CadenceConfig::from_file(&path)?
            } else {
                CadenceConfig::default()
            }
        }
    };

    match cli.command {
        Command::Validate {
            rule,
            dtstart,
            timezone,
        } => validate(&rule, dtstart, timezone.as_deref()),
        Command::Next {
            frequency,
            from,
            count,
        } => next(&config, &frequency, from, count),
        Command::Check {
            tasks,
            state,
            write_back,
            watch,
        } => check(config, &tasks, state, write_back, watch).await,
    }
}

fn validate(rule: &str, dtstart: Option<DateTime<Utc>>, timezone: Option<&str>) -> anyhow::Result<()> {
    let result = recurrence::validate(rule, Some(dtstart.unwrap_or_else(Utc::now)), timezone);
    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.valid {
        anyhow::bail!("rule is invalid");
    }
    Ok(())
}

fn next(
    config: &CadenceConfig,
    frequency: &str,
    from: Option<DateTime<Utc>>,
    count: usize,
) -> anyhow::Result<()> {
    let frequency: Frequency =
        serde_json::from_str(frequency).context("frequency is not valid JSON")?;
    let tz = TimezoneHandler::from_name(&config.timezone)?;
    let engine = RecurrenceEngine::new(tz, Arc::new(RuleCache::new(config.cache.max_size)?));

    let mut current = from.unwrap_or_else(Utc::now);
    for _ in 0..count {
        match engine.calculate_next_for("cli", current, &frequency)? {
            Some(next) => {
                println!("{}", next.to_rfc3339());
                current = next;
            }
            None => {
                info!("series has ended");
                break;
            }
        }
    }
    Ok(())
}

async fn check(
    config: CadenceConfig,
    tasks_path: &Path,
    state: Option<PathBuf>,
    write_back: bool,
    watch: bool,
) -> anyhow::Result<()> {
    let bytes = std::fs::read(tasks_path)
        .with_context(|| format!("cannot read tasks from {}", tasks_path.display()))?;
    let tasks: Vec<Task> = serde_json::from_slice(&bytes).context("cannot parse task file")?;
    let store = Arc::new(MemoryTaskStore::new(tasks));
    let timestamps = Arc::new(JsonTimestampStore::new(
        state.unwrap_or_else(CadenceConfig::default_state_path),
    ));

    let scheduler = Scheduler::builder(store.clone(), timestamps)
        .with_cadence_config(&config)?
        .build()?;
    for kind in [EventKind::Due, EventKind::Overdue] {
        scheduler.on(kind, |event| {
            match serde_json::to_string(event) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!("cannot encode event: {e}"),
            }
            Ok(())
        });
    }

    if watch {
        scheduler.start().await?;
        tokio::signal::ctrl_c().await?;
        info!("received Ctrl+C, shutting down...");
        scheduler.stop();
    } else {
        let recovery = scheduler.recover_missed_tasks().await?;
        let report = scheduler.run_once().await?;
        info!(
            recovered = recovery.overdue,
            due = report.due,
            overdue = report.overdue,
            "check complete"
        );
    }

    if write_back {
        let json = serde_json::to_vec_pretty(&store.all())?;
        std::fs::write(tasks_path, json)
            .with_context(|| format!("cannot write tasks to {}", tasks_path.display()))?;
    }
    Ok(())
}
