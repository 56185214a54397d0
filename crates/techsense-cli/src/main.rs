//! Command-line interface for the TechSense cleaning robot controller.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use chrono_tz::Tz;
use clap::{Parser, Subcommand};
use techsense_commands::{ActionType, ExportRow, HistoryFilter, HistoryLedger, Outcome};
use techsense_core::config::env_vars;
use techsense_core::EventBus;
use techsense_rules::{Rule, RuleAction, Schedule};
use techsense_session::{
    ControlConfig, DeviceSession, SessionInputs, SimulatedDevice, SimulationConfig,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Real time between simulated telemetry samples.
const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Longest simulated job: a full sweep at eco power, in simulated seconds.
const LONGEST_JOB_SECS: f64 = 45.0 * 60.0 * 1.4;

/// TechSense - solar panel cleaning robot controller.
#[derive(Parser, Debug)]
#[command(name = "techsense")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run a control session against the simulated robot.
    ///
    /// Simulated time runs `speed` times faster than the wall clock.
    /// Schedules follow the wall clock.
    Run {
        /// Configuration file (TOML); built-in defaults when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Simulated minutes to run.
        #[arg(short, long, default_value_t = 120)]
        minutes: u64,
        /// Simulated seconds per real second.
        #[arg(long, default_value_t = 120.0)]
        speed: f64,
        /// Seed for the simulation noise.
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Validate a configuration file and list its rules and schedules.
    CheckConfig {
        /// Configuration file (TOML).
        #[arg(required = true)]
        path: PathBuf,
    },
    /// Print the command history as CSV rows.
    History {
        /// History database written by a session.
        #[arg(long)]
        db: PathBuf,
        /// Only rows with this outcome (success, partial, failed).
        #[arg(long)]
        outcome: Option<String>,
        /// Only rows of this action type (e.g. full_sweep).
        #[arg(long)]
        action: Option<String>,
        /// Time zone for the date and time columns.
        #[arg(long, default_value = "UTC")]
        timezone: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match args.command {
        Command::Run {
            config,
            minutes,
            speed,
            seed,
        } => run_simulation(config, minutes, speed, seed).await,
        Command::CheckConfig { path } => check_config(&path),
        Command::History {
            db,
            outcome,
            action,
            timezone,
        } => show_history(&db, outcome, action, &timezone),
    }
}

fn init_logging(verbose: bool) {
    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_filter = if verbose {
        "techsense=debug"
    } else {
        "techsense=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_writer(std::io::stderr)
            .compact()
            .init();
    }
}

async fn run_simulation(
    config_path: Option<PathBuf>,
    minutes: u64,
    speed: f64,
    seed: Option<u64>,
) -> Result<()> {
    if !(speed.is_finite() && speed > 0.0) {
        bail!("--speed must be a positive number");
    }
    let mut config = match &config_path {
        Some(path) => ControlConfig::load(path)?,
        None => ControlConfig::default(),
    };

    // The slowest job must be able to finish before its acknowledgement
    // deadline in real time.
    let needed = (LONGEST_JOB_SECS / speed).ceil() as u64 + 5;
    if config.core.dispatcher.ack_timeout_secs < needed {
        tracing::info!(
            configured = config.core.dispatcher.ack_timeout_secs,
            ack_timeout_secs = needed,
            "Acknowledgement deadline stretched for simulation speed"
        );
        config.core.dispatcher.ack_timeout_secs = needed;
    }
    let tz = config.core.device.tz()?;

    let sim_config = SimulationConfig {
        seed,
        ..SimulationConfig::default()
    };
    let (sim, acks) = SimulatedDevice::new(config.core.device.grid(), sim_config, Utc::now());
    let session = Arc::new(DeviceSession::new(&config, Arc::new(sim.clone())).await?);
    let event_log = spawn_event_log(session.bus());

    let (sample_tx, samples) = mpsc::channel(16);
    let (_manual_tx, manual) = mpsc::channel(1);
    let runner = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .run(SessionInputs {
                    samples,
                    acks,
                    manual,
                })
                .await
        })
    };

    let sim_step = SAMPLE_INTERVAL.mul_f64(speed);
    let total = Duration::from_secs(minutes * 60);
    let mut elapsed = Duration::ZERO;
    let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
    tracing::info!(minutes, speed, "Simulation started");

    while elapsed < total {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
        elapsed += sim_step;
        if sample_tx.send(sim.advance(sim_step)).await.is_err() {
            break;
        }
    }

    drop(sample_tx);
    runner.await?;
    event_log.abort();

    if let Some(snapshot) = session.snapshot() {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }
    print_rows(session.ledger(), HistoryFilter::all(), tz);
    Ok(())
}

/// Log every control event at info level.
fn spawn_event_log(bus: &EventBus) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        while let Some((event, meta)) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => tracing::info!(source = %meta.source, event = %json, "{}", event.type_name()),
                Err(e) => tracing::warn!(error = %e, "Event not serializable"),
            }
        }
    })
}

fn check_config(path: &Path) -> Result<()> {
    let config = ControlConfig::load(path)
        .with_context(|| format!("invalid configuration {}", path.display()))?;
    let tz = config.core.device.tz()?;
    let grid = config.core.device.grid();

    println!("Configuration OK: {}", path.display());
    println!("  grid {}x{}, timezone {}", grid.rows, grid.cols, tz);

    println!("Rules ({}):", config.rules.len());
    for rule in &config.rules {
        println!("  {}", describe_rule(rule));
    }

    let now = Utc::now();
    println!("Schedules ({}):", config.schedules.len());
    for schedule in &config.schedules {
        println!("  {}", describe_schedule(schedule, now, tz));
    }
    Ok(())
}

fn enabled_mark(enabled: bool) -> &'static str {
    if enabled {
        "on "
    } else {
        "off"
    }
}

fn describe_rule(rule: &Rule) -> String {
    let conditions: Vec<String> = rule.conditions.iter().map(|c| c.to_string()).collect();
    let action = match &rule.action {
        RuleAction::Clean { action, .. } => action.to_string(),
        RuleAction::Alert { message } => format!("alert \"{}\"", message),
    };
    format!(
        "[{}] {} ({}): {} -> {}",
        enabled_mark(rule.enabled),
        rule.name,
        rule.id,
        conditions.join(" AND "),
        action
    )
}

fn describe_schedule(schedule: &Schedule, now: chrono::DateTime<Utc>, tz: Tz) -> String {
    let days: Vec<String> = schedule.weekdays.iter().map(|d| d.to_string()).collect();
    let next = if schedule.enabled {
        schedule
            .next_due(now, tz)
            .map(|due| due.with_timezone(&tz).format("%Y-%m-%d %H:%M %Z").to_string())
            .unwrap_or_else(|| "-".to_string())
    } else {
        "-".to_string()
    };
    format!(
        "[{}] {} ({}): {} {} -> {}, next {}",
        enabled_mark(schedule.enabled),
        schedule.name,
        schedule.id,
        schedule.time_of_day.format("%H:%M"),
        days.join(","),
        schedule.action,
        next
    )
}

fn show_history(
    db: &Path,
    outcome: Option<String>,
    action: Option<String>,
    timezone: &str,
) -> Result<()> {
    let tz: Tz = timezone
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid timezone '{}': {}", timezone, e))?;

    let mut filter = HistoryFilter::all();
    if let Some(outcome) = outcome {
        filter = filter.with_outcome(Outcome::from_str(&outcome)?);
    }
    if let Some(action) = action {
        filter = filter.with_action(ActionType::from_str(&action)?);
    }

    if !db.exists() {
        bail!("history database {} does not exist", db.display());
    }
    let ledger = HistoryLedger::open(db)
        .with_context(|| format!("cannot open history database {}", db.display()))?;
    print_rows(&ledger, filter, tz);
    Ok(())
}

fn print_rows(ledger: &HistoryLedger, filter: HistoryFilter, tz: Tz) {
    println!("{}", ExportRow::HEADER);
    for row in ledger.export_rows(filter, tz) {
        println!("{}", row);
    }
}
