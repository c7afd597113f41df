use anyhow::{Context, Result, bail};
use attendance_core::batch::{OutgoingMessage, SleepPacer, Transport};
use attendance_core::db::{self, OutboxTransport, RunMode};
use attendance_core::reconcile::ReconciliationReport;
use attendance_core::{Campaign, ParticipationRecord, Representative, VoteRecord, reconcile};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use schemars::schema_for;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "mep-attendance")]
#[command(about = "MEP attendance notifications and missed-vote reconciliation", long_about = None)]
struct Cli {
    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export JSON Schemas for the input records and reports
    Schema {
        #[command(subcommand)]
        command: SchemaCommands,
    },
    /// Render a campaign for every representative in a JSON export
    Notify {
        /// Campaign directory (campaign.toml, templates.yaml, remarks.yaml)
        #[arg(long)]
        campaign: PathBuf,
        /// JSON array of representative records
        #[arg(long)]
        input: PathBuf,
        /// Audit store; the batch outcome is recorded when given
        #[arg(long)]
        db: Option<PathBuf>,
        /// Queue messages in the audit store outbox instead of printing them
        #[arg(long, requires = "db")]
        outbox: bool,
        /// Process at most this many records
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Work out which votes representatives missed
    Reconcile {
        /// JSON array of representative records
        #[arg(long)]
        input: PathBuf,
        /// JSON array of every vote in the period
        #[arg(long)]
        votes: PathBuf,
        /// JSON array of participation records
        #[arg(long)]
        participation: PathBuf,
        /// Only reconcile this representative
        #[arg(long)]
        representative: Option<String>,
        /// Audit store; reports are upserted when given
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Generate Markdown notes from the audit store
    Report {
        #[command(subcommand)]
        command: ReportCommands,
    },
    /// Inspect and acknowledge messages queued by `notify --outbox`
    Outbox {
        #[command(subcommand)]
        command: OutboxCommands,
    },
}

#[derive(Subcommand)]
enum SchemaCommands {
    /// Export JSON Schema files for canonical types
    Export {
        /// Output directory (default: ./schemas)
        #[arg(long, default_value = "schemas")]
        out_dir: PathBuf,
    },
}

#[derive(Subcommand)]
enum ReportCommands {
    /// Write batch and reconciliation notes plus their indexes
    Build {
        #[arg(long)]
        db: PathBuf,
        /// Vault root directory
        #[arg(long, default_value = "vault")]
        out_dir: PathBuf,
    },
    /// Print the stored reconciliation report of one representative
    Show {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        representative: String,
    },
}

#[derive(Subcommand)]
enum OutboxCommands {
    /// Print unsent messages as JSON, oldest first
    List {
        #[arg(long)]
        db: PathBuf,
    },
    /// Mark queued messages as sent
    MarkSent {
        #[arg(long)]
        db: PathBuf,
        /// Outbox message ids
        #[arg(required = true)]
        ids: Vec<i64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Schema { command } => match command {
            SchemaCommands::Export { out_dir } => schema_export(out_dir),
        },
        Commands::Notify {
            campaign,
            input,
            db,
            outbox,
            limit,
        } => notify(&campaign, &input, db.as_deref(), outbox, limit),
        Commands::Reconcile {
            input,
            votes,
            participation,
            representative,
            db,
        } => reconcile_all(
            &input,
            &votes,
            &participation,
            representative.as_deref(),
            db.as_deref(),
        ),
        Commands::Report { command } => match command {
            ReportCommands::Build { db, out_dir } => {
                let conn = db::open(&db)?;
                let summary = reports::build_vault(&conn, &out_dir)?;
                println!(
                    "Wrote {} batch notes and {} reconciliation notes to {}",
                    summary.batches,
                    summary.reconciliations,
                    out_dir.display()
                );
                Ok(())
            }
            ReportCommands::Show { db, representative } => {
                let conn = db::open(&db)?;
                let Some(report) = db::load_reconciliation(&conn, &representative)? else {
                    bail!("no reconciliation stored for {representative}");
                };
                println!("{}", serde_json::to_string_pretty(&report)?);
                Ok(())
            }
        },
        Commands::Outbox { command } => match command {
            OutboxCommands::List { db } => {
                let conn = db::open(&db)?;
                let pending = db::pending_outbox(&conn)?;
                info!("{} messages pending", pending.len());
                println!("{}", serde_json::to_string_pretty(&pending)?);
                Ok(())
            }
            OutboxCommands::MarkSent { db, ids } => {
                let conn = db::open(&db)?;
                let mut marked = 0;
                for id in ids {
                    if db::mark_sent(&conn, id)? {
                        marked += 1;
                    } else {
                        warn!("outbox message {id} is unknown or already sent");
                    }
                }
                println!("Marked {marked} messages as sent");
                Ok(())
            }
        },
    }
}

fn schema_export(out_dir: PathBuf) -> Result<()> {
    fs::create_dir_all(&out_dir)?;

    let schemas = [
        ("Representative", schema_for!(Representative)),
        ("VoteRecord", schema_for!(VoteRecord)),
        ("ParticipationRecord", schema_for!(ParticipationRecord)),
        ("ReconciliationReport", schema_for!(ReconciliationReport)),
    ];
    for (name, schema) in schemas {
        let json = serde_json::to_string_pretty(&schema)?;
        fs::write(out_dir.join(format!("{name}.schema.json")), json)?;
    }

    println!("Exported schemas to {}", out_dir.display());
    Ok(())
}

/// Dry-run transport: prints each message instead of sending it.
struct PreviewTransport;

impl Transport for PreviewTransport {
    fn deliver(&mut self, message: &OutgoingMessage) -> bool {
        println!("To: {} [{}, {}]", message.destination, message.locale, message.tier);
        println!("Subject: {}", message.subject);
        println!();
        println!("{}", message.body);
        println!("{}", "-".repeat(72));
        true
    }
}

fn notify(
    campaign_dir: &Path,
    input: &Path,
    db_path: Option<&Path>,
    outbox: bool,
    limit: Option<usize>,
) -> Result<()> {
    let campaign = Campaign::load_from_dir(campaign_dir)
        .with_context(|| format!("loading campaign from {}", campaign_dir.display()))?;
    let representatives: Vec<Representative> = read_json(input)?;
    let conn = db_path.map(db::open).transpose()?;

    let runner = campaign.runner().with_limit(limit);
    let (mode, result) = match (&conn, outbox) {
        (Some(conn), true) => (
            RunMode::Dispatch,
            runner.run(&representatives, &mut OutboxTransport::new(conn), &mut SleepPacer),
        ),
        _ => (
            RunMode::Preview,
            runner.run(&representatives, &mut PreviewTransport, &mut SleepPacer),
        ),
    };

    if let Some(conn) = &conn {
        let run_id = db::record_batch(conn, &campaign.name, mode, representatives.len(), &result)?;
        info!("recorded {} batch run {run_id}", mode.as_str());
    }

    let sent = match mode {
        RunMode::Preview => "preview only".to_string(),
        RunMode::Dispatch => format!(
            "{} queued, {} transport failures",
            result.delivered(),
            result.transport_failures()
        ),
    };
    println!(
        "{}: {} rendered ({sent}), {} skipped, {} failed",
        campaign.name,
        result.rendered.len(),
        result.skipped.len(),
        result.failed.len()
    );
    Ok(())
}

fn reconcile_all(
    input: &Path,
    votes_path: &Path,
    participation_path: &Path,
    only: Option<&str>,
    db_path: Option<&Path>,
) -> Result<()> {
    let representatives: Vec<Representative> = read_json(input)?;
    let votes: Vec<VoteRecord> = read_json(votes_path)?;
    let participation: Vec<ParticipationRecord> = read_json(participation_path)?;
    let conn = db_path.map(db::open).transpose()?;

    let selected: Vec<&Representative> = representatives
        .iter()
        .filter(|rep| only.is_none_or(|id| rep.id.as_deref() == Some(id)))
        .collect();
    if selected.is_empty() {
        bail!("no matching representatives in {}", input.display());
    }

    let mut reports = Vec::new();
    let mut failures = 0;
    for rep in selected {
        match reconcile(rep, &votes, &participation) {
            Ok(report) => {
                if let Some(conn) = &conn {
                    db::upsert_reconciliation(conn, &report)?;
                }
                reports.push(report);
            }
            Err(err) => {
                error!("cannot reconcile {}: {err}", rep.label());
                failures += 1;
            }
        }
    }

    println!("{}", serde_json::to_string_pretty(&reports)?);
    if failures > 0 {
        bail!("{failures} reconciliations failed on inconsistent data");
    }
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}
