use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use sreagent::config::{Config, CONFIG_ENV};
use sreagent::detect::incident::IncidentCorrelator;
use sreagent::detect::IncidentStatus;

#[derive(Parser)]
#[command(
    name = "sreagent",
    about = "Streaming metric anomaly scoring, incident correlation and alert routing",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + scoring pipeline + collectors)
    Serve {
        /// Bind address (overrides server.bind)
        #[arg(long)]
        bind: Option<String>,

        /// SQLite database file (overrides server.db_path)
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Score a JSON-lines file of samples through the full pipeline
    Replay {
        /// Input file, one MetricSample per line
        #[arg(long)]
        file: PathBuf,

        /// Deliver alerts to the configured channels
        #[arg(long)]
        deliver: bool,

        /// Persist anomalies, incidents and dispatches to this database
        #[arg(long)]
        db: Option<PathBuf>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Inspect and update incidents
    Incidents {
        #[command(subcommand)]
        action: IncidentAction,
    },

    /// List alert dispatches that permanently failed
    DeadLetter {
        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Configuration helpers
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Extrapolate a stream's recent trend
    Forecast {
        /// Input file, one MetricSample per line
        #[arg(long)]
        file: PathBuf,

        #[arg(long)]
        metric: String,

        #[arg(long)]
        source: String,

        /// Number of steps to predict
        #[arg(long, default_value = "12")]
        horizon: u32,
    },
}

#[derive(Subcommand)]
enum IncidentAction {
    /// List incidents, most recently updated first
    List {
        /// Filter by status: open, investigating or resolved
        #[arg(long)]
        status: Option<IncidentStatus>,

        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Mark an incident as being investigated
    Investigate { id: Uuid },

    /// Resolve an incident (terminal)
    Resolve { id: Uuid },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // Logs go to stderr so `--json` output on stdout stays parseable.
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = Config::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { bind, db } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(db) = db {
                config.server.db_path = db;
            }
            tracing::info!(bind = %config.server.bind, "Starting sreagent daemon");
            sreagent::serve(config).await?;
        }
        Commands::Replay { file, deliver, db, json } => {
            let pool = db.as_deref().map(sreagent::storage::open_pool).transpose()?;
            let report = sreagent::replay(&config, &file, deliver, pool).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("\n=== Replay: {} ===", file.display());
                println!("Accepted: {}   Rejected: {}", report.batch.accepted, report.batch.rejected);
                println!("\nAnomalies ({}):", report.batch.anomalies.len());
                for a in &report.batch.anomalies {
                    println!(
                        " - {:<8} {} {}@{} value={:.3} score={:.2} conf={:.2}",
                        a.severity.to_string().to_uppercase(),
                        a.detected_at.to_rfc3339(),
                        a.metric_name,
                        a.source,
                        a.value,
                        a.score,
                        a.confidence
                    );
                }
                println!("\nOpen incidents ({}):", report.incidents.len());
                for i in &report.incidents {
                    println!(
                        " - {} [{}] {} ({} anomalies)",
                        i.id,
                        i.severity,
                        i.title,
                        i.anomaly_ids.len()
                    );
                }
                if !report.dead_letter.is_empty() {
                    println!("\nUndeliverable alerts: {}", report.dead_letter.len());
                }
                println!();
            }
        }
        Commands::Incidents { action } => {
            let pool = sreagent::storage::open_pool(&config.server.db_path)?;
            match action {
                IncidentAction::List { status, limit } => {
                    let list = sreagent::storage::incidents::list(&pool, status, limit)?;
                    if list.is_empty() {
                        println!("No incidents found.");
                    } else {
                        println!("{:<36} | {:<13} | {:<8} | {:<5} | Title", "ID", "Status", "Severity", "Count");
                        println!("{:-<36}-|-{:-<13}-|-{:-<8}-|-{:-<5}-|-{:-<30}", "", "", "", "", "");
                        for i in list {
                            println!(
                                "{:<36} | {:<13} | {:<8} | {:<5} | {}",
                                i.id,
                                i.status.to_string(),
                                i.severity.to_string(),
                                i.anomaly_ids.len(),
                                i.title
                            );
                        }
                    }
                }
                IncidentAction::Investigate { id } => {
                    let correlator = IncidentCorrelator::new(config.correlation.window(), Some(pool));
                    correlator.restore()?;
                    let incident = correlator.set_status(id, IncidentStatus::Investigating)?;
                    println!("Incident {} is now {}.", incident.id, incident.status);
                }
                IncidentAction::Resolve { id } => {
                    let correlator = IncidentCorrelator::new(config.correlation.window(), Some(pool));
                    correlator.restore()?;
                    let incident = correlator.set_status(id, IncidentStatus::Resolved)?;
                    println!("Incident {} resolved.", incident.id);
                }
            }
        }
        Commands::DeadLetter { limit } => {
            let pool = sreagent::storage::open_pool(&config.server.db_path)?;
            let failed = sreagent::storage::dispatches::list(
                &pool,
                Some(sreagent::alerts::DispatchStatus::Failed),
                limit,
            )?;
            if failed.is_empty() {
                println!("Dead-letter queue is empty.");
            } else {
                for d in failed {
                    println!(
                        "{} {} -> {} attempts={} error={}",
                        d.created_at.to_rfc3339(),
                        d.entity,
                        d.channel,
                        d.attempt_count,
                        d.last_error.as_deref().unwrap_or("-")
                    );
                }
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;
                println!("{}", rendered);
            }
        },
        Commands::Forecast {
            file,
            metric,
            source,
            horizon,
        } => {
            let mut samples: Vec<_> = sreagent::metrics::replay::read_file(&file)?
                .into_iter()
                .filter(|s| s.metric_name == metric && s.source == source)
                .collect();
            samples.sort_by_key(|s| s.timestamp);
            let Some(last) = samples.last() else {
                anyhow::bail!("No samples for {}@{} in {}", metric, source, file.display());
            };
            let step = if samples.len() >= 2 {
                (last.timestamp - samples[0].timestamp) / (samples.len() as i32 - 1)
            } else {
                chrono::Duration::minutes(1)
            };
            let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
            let points = sreagent::detect::forecast::forecast(&values, last.timestamp, step, horizon);
            if points.is_empty() {
                println!(
                    "Need at least {} samples to forecast, have {}.",
                    sreagent::detect::forecast::MIN_POINTS,
                    values.len()
                );
            } else {
                println!("{:<25} | {:>12} | {:>12} | {:>12} | Score", "Time", "Predicted", "Lower", "Upper");
                for p in points {
                    println!(
                        "{:<25} | {:>12.3} | {:>12.3} | {:>12.3} | {:.2}",
                        p.at.to_rfc3339(),
                        p.predicted,
                        p.lower,
                        p.upper,
                        p.anomaly_score
                    );
                }
            }
        }
    }

    Ok(())
}
