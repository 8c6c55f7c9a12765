use std::path::PathBuf;
use std::process;

use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, TimeZone, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;

use ledgerkeep_lib::archive::{ArchivePass, ArchiveResult, ShardQuery};
use ledgerkeep_lib::config::{default_data_dir, EnvPassphrases, LedgerConfig, LOG_DIR_NAME};
use ledgerkeep_lib::db::health::CorruptionReport;
use ledgerkeep_lib::db::repair::{RepairStep, RepairStepState};
use ledgerkeep_lib::time::PeriodKey;
use ledgerkeep_lib::{logging, Ledger};

/// Mutating commands refuse to run against a corrupted store.
const DB_UNHEALTHY_EXIT_CODE: i32 = 2;
const DB_UNHEALTHY_CLI_HINT: &str = "Run 'ledgerkeep db status' or 'ledgerkeep db repair'.";

#[derive(Debug, Parser)]
#[command(name = "ledgerkeep", about = "Encrypted ledger store maintenance", version)]
struct Cli {
    /// Data directory. Defaults to LEDGERKEEP_DATA_DIR or the platform data dir.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Live store health and maintenance.
    #[command(subcommand)]
    Db(DbCommand),
    /// JSON snapshots of the live store.
    #[command(subcommand)]
    Backup(BackupCommand),
    /// Per-year archive shards.
    #[command(subcommand)]
    Archive(ArchiveCommand),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Probe the live store and report every check.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Non-destructive repair: reindex, fix dangling references, rebuild.
    Repair,
    /// Discard the live store and reseed it from the newest usable snapshot.
    ForceRepair,
    /// Reclaim free pages in the live store.
    Compact,
}

#[derive(Debug, Subcommand)]
enum BackupCommand {
    /// Write a snapshot now.
    Create {
        /// File name inside the backups directory.
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Write a timestamped snapshot and apply the retention policy.
    Scheduled,
    /// List snapshots, newest first.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Replace the live data with a snapshot.
    Restore(RestoreArgs),
    /// Delete one snapshot from the backups directory.
    Delete { file: PathBuf },
    /// Parse a snapshot and report its contents without restoring it.
    Validate { file: PathBuf },
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct RestoreArgs {
    file: Option<PathBuf>,
    #[arg(long)]
    latest: bool,
}

#[derive(Debug, Subcommand)]
enum ArchiveCommand {
    /// Archive everything dated before a cutoff (default: the configured threshold).
    Run {
        /// Cutoff date, YYYY-MM-DD (UTC midnight).
        #[arg(long)]
        before: Option<String>,
    },
    /// Run the automatic pass, honouring the interval since the last run.
    Check,
    /// List shard files on disk.
    List,
    /// Print archived entries for one year, newest first.
    Show {
        year: String,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Delete the shard for one year.
    Delete { year: String },
}

fn main() {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            1
        }
    };
    process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir().map_err(|err| anyhow!(err))?,
    };
    // Held until `run` returns; dropping it flushes the file sink.
    let _log_guard = match logging::init_file_logging(&data_dir.join(LOG_DIR_NAME)) {
        Ok(guard) => Some(guard),
        Err(err) => {
            logging::init_logging();
            tracing::warn!(target: logging::LOG_TARGET, event = "file_logging_unavailable", error = %err);
            None
        }
    };
    let config = LedgerConfig::load(data_dir);
    let ledger = Ledger::open(config, &EnvPassphrases).context("open ledger")?;

    let code = match cli.command {
        Commands::Db(command) => handle_db_command(&ledger, command),
        Commands::Backup(command) => handle_backup_command(&ledger, command),
        Commands::Archive(command) => handle_archive_command(&ledger, command),
    };
    ledger.close().context("close ledger")?;
    code
}

/// Probe before a write. `Some(exit_code)` means the command must not run.
fn guard_mutation(ledger: &Ledger) -> Option<i32> {
    let report = ledger.recovery.probe();
    if report.corrupted {
        eprintln!(
            "Error: live store is corrupted ({}). {DB_UNHEALTHY_CLI_HINT}",
            kind_label(&report)
        );
        return Some(DB_UNHEALTHY_EXIT_CODE);
    }
    None
}

fn handle_db_command(ledger: &Ledger, command: DbCommand) -> Result<i32> {
    match command {
        DbCommand::Status { json } => {
            let report = ledger.recovery.probe();
            if json {
                print_json(&report)?;
            } else {
                print_report_table(&report);
            }
            Ok(if report.corrupted { 1 } else { 0 })
        }
        DbCommand::Repair => {
            let healthy = ledger.recovery.repair();
            if let Some(summary) = ledger.recovery.last_repair() {
                for step in &summary.steps {
                    let label = step_label(step.step);
                    let status = status_label(step.status);
                    match &step.message {
                        Some(msg) => println!("{label:<12} {status:<9} {msg}"),
                        None => println!("{label:<12} {status:<9}"),
                    }
                }
                println!();
                if let Some(path) = &summary.pre_repair_copy {
                    println!("Pre-repair copy: {}", path.display());
                }
                if let Some(error) = &summary.error {
                    println!("Reason: {} ({})", error.message(), error.code());
                }
            }
            if healthy {
                println!("Repair complete.");
                Ok(0)
            } else {
                println!("Repair failed. Run 'ledgerkeep db force-repair' to rebuild from the newest snapshot.");
                Ok(1)
            }
        }
        DbCommand::ForceRepair => {
            let outcome = ledger.recovery.force_repair().context("force rebuild")?;
            if let Some(path) = &outcome.quarantined_path {
                println!("Unreadable store moved to: {}", path.display());
            }
            match (&outcome.restored_from, &outcome.restore_error) {
                (Some(path), _) => println!("Restored from: {}", path.display()),
                (None, Some(err)) => println!("No snapshot could be restored: {err}"),
                (None, None) => println!("No snapshots found; the store is empty."),
            }
            Ok(0)
        }
        DbCommand::Compact => {
            if let Some(code) = guard_mutation(ledger) {
                return Ok(code);
            }
            ledger.live.get()?.compact()?;
            println!("Live store compacted.");
            Ok(0)
        }
    }
}

fn handle_backup_command(ledger: &Ledger, command: BackupCommand) -> Result<i32> {
    let backups = &ledger.backups;
    match command {
        BackupCommand::Create { name, json } => {
            if let Some(code) = guard_mutation(ledger) {
                return Ok(code);
            }
            let snapshot = match name {
                Some(name) => backups.create_snapshot(&name)?,
                None => backups.create_manual_snapshot()?,
            };
            if json {
                print_json(&json!({ "snapshot": snapshot, "path": snapshot.path }))?;
            } else {
                println!("Snapshot stored at {}", snapshot.path.display());
            }
            Ok(0)
        }
        BackupCommand::Scheduled => {
            if let Some(code) = guard_mutation(ledger) {
                return Ok(code);
            }
            let snapshot = backups.create_scheduled_snapshot()?;
            println!("Snapshot stored at {}", snapshot.path.display());
            Ok(0)
        }
        BackupCommand::List { json } => {
            let snapshots = backups.list_snapshots()?;
            if json {
                print_json(&snapshots)?;
            } else if snapshots.is_empty() {
                println!("No snapshots in {}", backups.dir().display());
            } else {
                println!("{:<40} {:>12}  Modified", "File", "Bytes");
                for snapshot in &snapshots {
                    println!(
                        "{:<40} {:>12}  {}",
                        snapshot.file_name,
                        snapshot.size_bytes,
                        snapshot.modified_at.to_rfc3339()
                    );
                }
            }
            Ok(0)
        }
        BackupCommand::Restore(args) => {
            let summary = if args.latest {
                match backups.restore_latest()? {
                    Some(summary) => summary,
                    None => {
                        println!("No snapshots to restore.");
                        return Ok(1);
                    }
                }
            } else {
                let file = args.file.ok_or_else(|| anyhow!("snapshot file is required"))?;
                backups.restore(&file)?
            };
            println!(
                "Restored {} transaction(s), {} account(s), {} categor(ies) from {}",
                summary.counts.transactions,
                summary.counts.accounts,
                summary.counts.categories,
                summary.source.display()
            );
            Ok(0)
        }
        BackupCommand::Delete { file } => {
            let file = resolve_snapshot_path(ledger, file);
            if backups.delete_snapshot(&file) {
                println!("Deleted {}", file.display());
                Ok(0)
            } else {
                eprintln!("Error: {} was not deleted", file.display());
                Ok(1)
            }
        }
        BackupCommand::Validate { file } => {
            let file = resolve_snapshot_path(ledger, file);
            let validation = backups.validate_snapshot(&file)?;
            print_json(&validation)?;
            Ok(if validation.is_consistent() { 0 } else { 1 })
        }
    }
}

/// Bare file names refer to the backups directory.
fn resolve_snapshot_path(ledger: &Ledger, file: PathBuf) -> PathBuf {
    if file.components().count() == 1 && !file.exists() {
        ledger.backups.dir().join(file)
    } else {
        file
    }
}

fn handle_archive_command(ledger: &Ledger, command: ArchiveCommand) -> Result<i32> {
    let archive = &ledger.archive;
    match command {
        ArchiveCommand::Run { before } => {
            if let Some(code) = guard_mutation(ledger) {
                return Ok(code);
            }
            let threshold = match before {
                Some(value) => parse_cutoff(&value)?,
                None => ledgerkeep_lib::time::months_before(
                    Utc::now(),
                    archive.policy().threshold_months,
                ),
            };
            Ok(print_archive_result(&archive.archive_before(threshold)))
        }
        ArchiveCommand::Check => {
            if let Some(code) = guard_mutation(ledger) {
                return Ok(code);
            }
            match archive.check_and_archive() {
                ArchivePass::Skipped { last_run_ms } => {
                    let last = ledgerkeep_lib::time::to_datetime(last_run_ms);
                    println!("Not due; last pass completed {}", last.to_rfc3339());
                    Ok(0)
                }
                ArchivePass::Completed(result) => Ok(print_archive_result(&result)),
            }
        }
        ArchiveCommand::List => {
            let shards = archive.catalog().list_shards()?;
            if shards.is_empty() {
                println!("No archive shards.");
            }
            for shard in &shards {
                println!(
                    "{:<6} {:<20} {:>8}  {}",
                    shard.period.to_string(),
                    shard.name,
                    shard.formatted_size,
                    shard.modified_at.to_rfc3339()
                );
            }
            Ok(0)
        }
        ArchiveCommand::Show { year, limit } => {
            let period: PeriodKey = year.parse()?;
            let summary = archive.shard_summary(period)?;
            println!(
                "{period}: {} entr(ies), income {:.2}, expense {:.2}",
                summary.count, summary.income, summary.expense
            );
            let query = ShardQuery {
                limit: Some(limit),
                ..ShardQuery::default()
            };
            for record in archive.query_shard(period, query)? {
                let record = record?;
                let date = ledgerkeep_lib::time::to_datetime(record.date);
                println!(
                    "{:>8} {} {:>12.2} {}",
                    record.id,
                    date.format("%Y-%m-%d"),
                    record.amount,
                    record.note
                );
            }
            Ok(0)
        }
        ArchiveCommand::Delete { year } => {
            let period: PeriodKey = year.parse()?;
            if archive.delete_shard(period)? {
                println!("Deleted archive for {period}");
                Ok(0)
            } else {
                println!("No archive for {period}");
                Ok(1)
            }
        }
    }
}

fn parse_cutoff(value: &str) -> Result<chrono::DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .with_context(|| format!("invalid date '{value}', expected YYYY-MM-DD"))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| anyhow!("invalid date '{value}'"))?;
    Ok(Utc.from_utc_datetime(&midnight))
}

fn print_archive_result(result: &ArchiveResult) -> i32 {
    if result.success {
        match result.period {
            Some(period) => println!("Archived {} entr(ies) into {period}", result.archived_count),
            None => println!("Nothing to archive."),
        }
        0
    } else {
        eprintln!(
            "Archiving failed: {}",
            result.error.as_deref().unwrap_or("unknown error")
        );
        1
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{json}");
    Ok(())
}

fn kind_label(report: &CorruptionReport) -> String {
    report
        .kind
        .map(|kind| format!("{kind:?}"))
        .unwrap_or_else(|| "healthy".to_string())
}

fn print_report_table(report: &CorruptionReport) {
    println!("Live store health report");
    println!("Status       : {}", if report.corrupted { "corrupted" } else { "ok" });
    println!("Kind         : {}", kind_label(report));
    println!("Action       : {:?}", report.recommended_action());
    println!("Schema hash  : {}", report.schema_hash);
    println!("App version  : {}", report.app_version);
    println!("Generated at : {}", report.generated_at);

    println!("\nChecks:");
    println!(
        "{:<20} {:<7} {:>13}  Details",
        "Check", "Passed", "Duration (ms)"
    );
    for check in &report.checks {
        let passed = if check.passed { "yes" } else { "no" };
        let details = check
            .details
            .as_deref()
            .map(|value| value.replace('\n', " "))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<20} {:<7} {:>13}  {}",
            check.name, passed, check.duration_ms, details
        );
    }

    if report.offenders.is_empty() {
        println!("\nOffenders: none");
    } else {
        println!("\nOffenders:");
        println!("{:<20} {:>10}  Message", "Table", "RowID");
        for offender in &report.offenders {
            println!(
                "{:<20} {:>10}  {}",
                offender.table, offender.rowid, offender.message
            );
        }
    }
}

fn step_label(step: RepairStep) -> &'static str {
    match step {
        RepairStep::Backup => "Backup",
        RepairStep::Checkpoint => "Checkpoint",
        RepairStep::Reindex => "Reindex",
        RepairStep::Orphans => "Orphans",
        RepairStep::Rebuild => "Rebuild",
        RepairStep::Validate => "Validate",
        RepairStep::Swap => "Swap",
    }
}

fn status_label(state: RepairStepState) -> &'static str {
    match state {
        RepairStepState::Pending => "pending",
        RepairStepState::Success => "success",
        RepairStepState::Skipped => "skipped",
        RepairStepState::Failed => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cutoff_is_utc_midnight() {
        let cutoff = parse_cutoff("2023-03-15").unwrap();
        assert_eq!(cutoff.to_rfc3339(), "2023-03-15T00:00:00+00:00");
        assert!(parse_cutoff("15/03/2023").is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
