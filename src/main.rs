mod api;
mod classify;
mod db;
mod error;
mod pipeline;
mod record;
mod schedule;
mod settings;
mod stats;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tokio::sync::Notify;

use api::BattleMetricsClient;
use db::SqliteStore;
use pipeline::{PaginationMode, Pipeline};
use record::region_name;
use schedule::WipeScheduleAnalyzer;
use settings::Settings;
use stats::{format_duration, LogReporter};

#[derive(Parser)]
#[command(name = "wipe_scraper", about = "Rust server wipe schedule scraper (BattleMetrics)")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest the server listing (one page unless --all)
    Scrape {
        /// Follow pagination until the listing is exhausted
        #[arg(long)]
        all: bool,
        #[command(flatten)]
        listing: ListingArgs,
    },
    /// Repeat single-page scrapes with a fixed pause, until Ctrl-C
    Watch {
        /// Seconds between runs
        #[arg(long)]
        every: Option<u64>,
        #[command(flatten)]
        listing: ListingArgs,
    },
    /// Rebuild every stored server's wipe schedule from its history
    Recompute,
    /// Summarize recorded scraper runs
    Stats {
        /// Number of recent runs to include
        #[arg(short = 'n', long, default_value = "20")]
        last: usize,
    },
    /// Stored servers overview table
    Overview {
        /// Filter by country code (e.g. US, DE)
        #[arg(short, long)]
        region: Option<String>,
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },
}

/// Listing filters; each overrides the loaded setting when given.
#[derive(Args)]
struct ListingArgs {
    #[arg(long)]
    country: Option<String>,
    /// Max distance filter
    #[arg(long)]
    distance: Option<u32>,
    #[arg(long)]
    min_players: Option<u32>,
    #[arg(long)]
    page_size: Option<u32>,
    /// Skip servers ranked worse than this
    #[arg(long)]
    min_rank: Option<i64>,
    /// Skip servers whose last wipe is older than this (0 = never)
    #[arg(long)]
    max_days_old: Option<i64>,
}

impl ListingArgs {
    fn apply(self, settings: &mut Settings) {
        if let Some(v) = self.country {
            settings.country = v.to_uppercase();
        }
        if let Some(v) = self.distance {
            settings.distance = v;
        }
        if let Some(v) = self.min_players {
            settings.min_players = v;
        }
        if let Some(v) = self.page_size {
            settings.page_size = v;
        }
        if let Some(v) = self.min_rank {
            settings.min_rank = v;
        }
        if let Some(v) = self.max_days_old {
            settings.max_days_old = v;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let mut settings = Settings::load()?;
    let store = SqliteStore::open(&settings.db_path)?;

    let result = match cli.command {
        Commands::Scrape { all, listing } => {
            listing.apply(&mut settings);
            let mode = if all {
                PaginationMode::All
            } else {
                PaginationMode::SinglePage
            };
            let client = BattleMetricsClient::new(&settings.api_base_url, settings.request_timeout())?;
            let pipeline = Pipeline::new(
                settings.pipeline_config(),
                client,
                &store,
                (LogReporter, &store),
            );
            stop_on_ctrl_c(pipeline.stop_handle(), Arc::new(Notify::new()));

            let stats = pipeline.run(mode).await;
            println!(
                "Done: {} parsed, {} skipped, {} posted ({} errors).",
                stats.parsed,
                stats.skipped,
                stats.posted,
                stats.errors.len()
            );
            Ok(())
        }
        Commands::Watch { every, listing } => {
            listing.apply(&mut settings);
            let pause = Duration::from_secs(every.unwrap_or(settings.interval_secs));
            let client = BattleMetricsClient::new(&settings.api_base_url, settings.request_timeout())?;
            let pipeline = Pipeline::new(
                settings.pipeline_config(),
                client,
                &store,
                (LogReporter, &store),
            );
            let stop = pipeline.stop_handle();
            let wake = Arc::new(Notify::new());
            stop_on_ctrl_c(Arc::clone(&stop), Arc::clone(&wake));

            let mut runs = 0usize;
            while !stop.load(Ordering::Relaxed) {
                let stats = pipeline.run(PaginationMode::SinglePage).await;
                runs += 1;
                println!(
                    "Run {}: {} parsed, {} skipped, {} posted.",
                    runs, stats.parsed, stats.skipped, stats.posted
                );
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                if interrupted(pause, &wake).await {
                    break;
                }
            }
            println!("Stopped after {} runs.", runs);
            Ok(())
        }
        Commands::Recompute => {
            let out = pipeline::recompute_schedules(&store, &WipeScheduleAnalyzer::default())?;
            println!(
                "Recomputed {} servers ({} updated, {} without history).",
                out.servers, out.updated, out.without_history
            );
            Ok(())
        }
        Commands::Stats { last } => {
            let runs = store.recent_runs(last)?;
            if runs.is_empty() {
                println!("No recorded runs. Run 'scrape' first.");
                return Ok(());
            }
            let parsed: i64 = runs.iter().map(|r| r.parsed).sum();
            let skipped: i64 = runs.iter().map(|r| r.skipped).sum();
            let posted: i64 = runs.iter().map(|r| r.posted).sum();
            let errors: usize = runs.iter().map(|r| r.error_count()).sum();
            let avg = runs.iter().map(|r| r.duration_secs).sum::<i64>() as f64 / runs.len() as f64;

            println!("Runs:     {}", runs.len());
            println!("Parsed:   {}", parsed);
            println!("Skipped:  {}", skipped);
            println!("Posted:   {}", posted);
            println!("Errors:   {}", errors);
            println!("Avg time: {:.2}s", avg);
            println!();
            println!(
                "{:<24} | {:>10} | {:>6} | {:>7} | {:>6} | {:>6}",
                "Started", "Duration", "Parsed", "Skipped", "Posted", "Errors"
            );
            println!("{}", "-".repeat(74));
            for r in &runs {
                println!(
                    "{:<24} | {:>10} | {:>6} | {:>7} | {:>6} | {:>6}",
                    r.started_at,
                    format_duration(Duration::from_secs(r.duration_secs.max(0) as u64)),
                    r.parsed,
                    r.skipped,
                    r.posted,
                    r.error_count()
                );
            }
            Ok(())
        }
        Commands::Overview { region, limit } => {
            let region = region.map(|r| r.to_uppercase());
            let rows = store.list_servers(region.as_deref(), limit)?;
            if rows.is_empty() {
                println!("No servers found.");
                return Ok(());
            }

            println!(
                "{:>3} | {:<28} | {:<13} | {:>5} | {:>7} | {:<9} | {:<5} | {:<5} | {:<8} | {:<8} | {:<8}",
                "#", "Server", "Region", "Rank", "Players", "Schedule", "Mode", "Rate", "Group", "Main", "BP"
            );
            println!("{}", "-".repeat(130));

            for (i, r) in rows.iter().enumerate() {
                let attrs = r.attributes.clone().unwrap_or_default();
                let schedule = r.schedule.clone().unwrap_or_default();
                println!(
                    "{:>3} | {:<28} | {:<13} | {:>5} | {:>7} | {:<9} | {:<5} | {:<5} | {:<8} | {:<8} | {:<8}",
                    i + 1,
                    truncate(r.title.as_deref().unwrap_or("-"), 28),
                    r.region.as_deref().map(region_name).unwrap_or("-"),
                    r.rank.map(|v| v.to_string()).unwrap_or_else(|| "-".into()),
                    players(r.players, r.max_players),
                    attrs.wipe_schedule.as_deref().unwrap_or("-"),
                    attrs.game_mode.as_deref().unwrap_or("-"),
                    attrs.resource_rate.as_deref().unwrap_or("-"),
                    attrs.group_limit.as_deref().unwrap_or("-"),
                    slot(schedule.main_dow, schedule.main_hour),
                    slot(schedule.blueprint_dow, schedule.blueprint_hour),
                );
            }

            println!("\n{} servers", rows.len());
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

/// Ctrl-C sets `stop` and wakes whoever waits on `wake`. `notify_one`
/// keeps a permit, so a signal that lands before the wait still counts.
fn stop_on_ctrl_c(stop: Arc<AtomicBool>, wake: Arc<Notify>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received, finishing current server");
            stop.store(true, Ordering::Relaxed);
            wake.notify_one();
        }
    });
}

/// Sleep for `pause` unless woken first; true when woken.
async fn interrupted(pause: Duration, wake: &Notify) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(pause) => false,
        _ = wake.notified() => true,
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max - 3).collect();
        format!("{}...", truncated)
    }
}

fn players(current: Option<i64>, max: Option<i64>) -> String {
    match (current, max) {
        (Some(c), Some(m)) => format!("{}/{}", c, m),
        (Some(c), None) => c.to_string(),
        _ => "-".into(),
    }
}

fn slot(dow: Option<u32>, hour: Option<u32>) -> String {
    const DAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
    match (dow, hour) {
        (Some(d), Some(h)) => format!("{} {:02}h", DAYS.get(d as usize).unwrap_or(&"?"), h),
        _ => "-".into(),
    }
}
