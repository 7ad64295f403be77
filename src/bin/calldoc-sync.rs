use chrono::NaiveDate;
use clap::{Parser, Subcommand};

use calldoc_sync::{
    date_util, CallDocSync, CancelToken, DeletePolicy, RecordedRun, RunSummary, SyncProgress,
    SyncStatus,
};

#[derive(Parser)]
#[command(
    name = "calldoc-sync",
    about = "Reconcile CallDoc appointments with SQLHK examinations"
)]
struct Cli {
    /// Journal database path (default: ~/.calldoc-sync/calldoc-sync.db)
    #[arg(long)]
    db: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Progress reporter that writes to stderr.
struct StderrProgress;

impl SyncProgress for StderrProgress {
    fn on_run_start(&self, date: NaiveDate) {
        eprintln!("Synchronizing {date}...");
    }

    fn on_fetched(&self, _date: NaiveDate, source: usize, target: usize) {
        eprintln!("  {source} active appointments, {target} stored examinations");
    }

    fn on_plan(&self, inserts: usize, updates: usize, deletes: usize) {
        eprintln!("  Plan: {inserts} inserts, {updates} updates, {deletes} deletes");
    }

    fn on_run_complete(&self, summary: &RunSummary) {
        eprintln!("  Done: {}", summary.status().as_str());
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile one day, or a range of days
    Sync {
        /// Day to reconcile (DD.MM.YYYY or YYYY-MM-DD, default: today)
        date: Option<String>,
        /// Last day of a range starting at DATE
        #[arg(long)]
        to: Option<String>,
        /// Delete policy: selective or reset
        #[arg(long)]
        policy: Option<String>,
        /// Include lab, imaging, team and material cost in the diff
        #[arg(long)]
        compare_billing: bool,
        /// Compute the plan without writing anything
        #[arg(long)]
        dry_run: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show recent runs
    History {
        #[arg(long, default_value = "20")]
        limit: u32,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List the failed items of a run
    Failures {
        run_id: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show effective settings and the last run
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a stored value
    Get { key: String },
    /// Set a value
    Set { key: String, value: String },
    /// Remove a stored value
    Unset { key: String },
    /// List stored values
    List,
    /// Show effective settings (defaults, stored values, environment)
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let db = match &cli.db {
        Some(path) => calldoc_sync::Database::open_at(path).await?,
        None => calldoc_sync::Database::open().await?,
    };
    let app = CallDocSync::new(db);

    match cli.command {
        Commands::Sync {
            date,
            to,
            policy,
            compare_billing,
            dry_run,
            json,
        } => {
            let from = match date.as_deref() {
                Some(s) => date_util::normalize_date(s)?,
                None => date_util::today(),
            };
            let to = match to.as_deref() {
                Some(s) => date_util::normalize_date(s)?,
                None => from,
            };

            let settings = app.settings().await?;
            let mut options = settings.sync_options();
            if let Some(p) = policy.as_deref() {
                options.policy = DeletePolicy::parse(p)?;
            }
            options.compare_billing_fields |= compare_billing;
            options.dry_run = dry_run;

            let feed = calldoc_sync::open_feed(&settings)?;
            let gateway = calldoc_sync::open_gateway(&settings).await?;

            let cancel = CancelToken::new();
            tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        eprintln!("Interrupted, finishing the current statement...");
                        cancel.cancel();
                    }
                }
            });

            let progress = StderrProgress;
            let runs = app
                .sync_range(&feed, gateway.as_ref(), from, to, &options, &progress, &cancel)
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
            } else {
                for run in &runs {
                    print_run(run);
                }
            }
            if runs.iter().any(|r| r.status() != SyncStatus::Success) {
                std::process::exit(1);
            }
        }
        Commands::History { limit, json } => {
            let runs = app.history(limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
            } else if runs.is_empty() {
                println!("No runs recorded.");
            } else {
                for r in runs {
                    println!(
                        "#{} {} {:<15} {}{} +{} ~{} ={} -{} !{} (started {})",
                        r.id,
                        r.sync_date,
                        r.status,
                        r.policy,
                        if r.dry_run { " dry-run" } else { "" },
                        r.inserted,
                        r.updated,
                        r.unchanged,
                        r.deleted,
                        r.errors,
                        r.started_at
                    );
                }
            }
        }
        Commands::Failures { run_id, json } => {
            if app.run(run_id).await?.is_none() {
                anyhow::bail!("no run with id {run_id}");
            }
            let items = app.failures(run_id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else if items.is_empty() {
                println!("Run #{run_id} has no failed items.");
            } else {
                for item in items {
                    println!("{:<8} {:<20} {}", item.operation, item.key, item.message);
                }
            }
        }
        Commands::Config { action } => {
            handle_config(&app, action).await?;
        }
        Commands::Status => {
            print_status(&app).await?;
        }
    }

    Ok(())
}

async fn handle_config(app: &CallDocSync, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => match app.config_get(&key).await? {
            Some(v) => println!("{key} = {v}"),
            None => println!("{key} is not set"),
        },
        ConfigAction::Set { key, value } => {
            app.config_set(&key, &value).await?;
            println!("Config updated.");
        }
        ConfigAction::Unset { key } => {
            if app.config_unset(&key).await? {
                println!("Removed {key}.");
            } else {
                println!("{key} is not set");
            }
        }
        ConfigAction::List => {
            let items = app.config_list().await?;
            if items.is_empty() {
                println!("No configuration set.");
            } else {
                for (k, v) in items {
                    println!("{k} = {v}");
                }
            }
        }
        ConfigAction::Show => {
            for (k, v) in app.settings().await?.entries() {
                println!("{k} = {v}");
            }
        }
    }
    Ok(())
}

fn print_run(run: &RecordedRun) {
    let s = &run.summary;
    println!(
        "Run #{} for {} ({}{}): {}",
        run.run_id,
        s.sync_date,
        s.policy.as_str(),
        if s.dry_run { ", dry run" } else { "" },
        s.status().as_str()
    );
    if let Some(reason) = &s.aborted {
        println!("  Aborted: {reason}");
        return;
    }
    println!(
        "  Source: {} active, {} cancelled   Target: {} rows",
        s.total_source, s.cancelled_in_feed, s.total_target
    );
    println!(
        "  Inserted: {}  Updated: {}  Unchanged: {}  Deleted: {}",
        s.inserted, s.updated, s.unchanged, s.deleted
    );
    if s.failed + s.skipped + s.errors + s.ambiguities > 0 {
        println!(
            "  Failed: {}  Skipped: {}  Errors: {}  Ambiguities: {}",
            s.failed, s.skipped, s.errors, s.ambiguities
        );
    }
    for item in &s.failures {
        println!("    {} {}: {}", item.operation, item.key, item.message);
    }
}

async fn print_status(app: &CallDocSync) -> anyhow::Result<()> {
    let settings = app.settings().await?;
    println!("CallDoc sync status");
    println!("  Feed:     {}", settings.feed_url);
    println!(
        "  Gateway:  {} ({})",
        settings.gateway_url, settings.gateway_database
    );
    println!(
        "  Policy:   {} (dates written as {})",
        settings.delete_policy.as_str(),
        settings.date_style.as_str()
    );

    let today = date_util::today();
    match app.last_run_for(today).await? {
        Some(r) => println!(
            "  Today:    run #{} {} at {}",
            r.id,
            r.status,
            r.completed_at.as_deref().unwrap_or(&r.started_at)
        ),
        None => println!("  Today:    not synchronized"),
    }
    match app.history(1).await?.first() {
        Some(r) => println!("  Last run: #{} for {} ({})", r.id, r.sync_date, r.status),
        None => println!("  Last run: never"),
    }
    Ok(())
}
