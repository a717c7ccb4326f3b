//! Polymarket Trade-Mirroring Bot
//!
//! Watches leader accounts and mirrors each of their trades into a follower
//! account exactly once, sized by a copy ratio and capped by capital limits.

mod api;
mod bot;
mod db;
mod error;
mod health;
mod models;
mod trading;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::api::{ClobClient, DataClient, MarketClient, PaperVenue, PolymarketVenue};
use crate::bot::Bot;
use crate::db::Database;
use crate::trading::{
    parse_address_list, parse_decimal_pairs, ExecutionConfig, MirrorConfig, SizingConfig,
};

/// Polymarket trade-mirroring bot CLI.
#[derive(Parser)]
#[command(name = "polymirror")]
#[command(about = "Mirror Polymarket leader trades into a follower account", long_about = None)]
struct Cli {
    /// Database URL
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:./polymirror.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start mirroring leader trades
    Run(MirrorArgs),

    /// Resolve every unfinished mirror against the venue, then exit
    Reconcile(MirrorArgs),

    /// Show mirror records, positions and recent skips or failures
    Status {
        /// Number of recent skipped/failed records to show
        #[arg(short, long, default_value = "10")]
        limit: i64,
    },

    /// Check the state store, venue and follower balance, then exit
    Health(MirrorArgs),

    /// Show the effective configuration
    Config(MirrorArgs),
}

#[derive(Args, Debug)]
struct MirrorArgs {
    /// Leader addresses, comma separated
    #[arg(long, env = "LEADER_ADDRESSES")]
    leaders: String,

    /// Leader size multiplier
    #[arg(long, env = "COPY_RATIO", default_value = "0.1")]
    copy_ratio: Decimal,

    /// Per-leader ratio overrides (addr:ratio,...)
    #[arg(long, env = "LEADER_COPY_RATIOS")]
    leader_ratios: Option<String>,

    /// Total follower capital in USDC
    #[arg(long, env = "FOLLOWER_CAPITAL")]
    capital: Decimal,

    /// Default per-market capital ceiling in USDC (defaults to the capital)
    #[arg(long, env = "DEFAULT_MARKET_CEILING")]
    market_ceiling: Option<Decimal>,

    /// Per-market ceiling overrides (token:usd,...)
    #[arg(long, env = "MARKET_CEILINGS")]
    market_ceilings: Option<String>,

    /// Markets to mirror, comma separated; empty mirrors all
    #[arg(long, env = "MIRRORED_MARKETS")]
    markets: Option<String>,

    /// Venue minimum order size in shares
    #[arg(long, env = "MIN_ORDER_SIZE", default_value = "5")]
    min_order_size: Decimal,

    /// Max single order cost as a fraction of capital
    #[arg(long, env = "MAX_ORDER_FRACTION", default_value = "0.1")]
    max_order_fraction: Decimal,

    /// Skip leader trades older than this many seconds
    #[arg(long, env = "MAX_TRADE_AGE_SECS", default_value = "300")]
    max_trade_age: i64,

    /// USDC cap on buys per UTC day
    #[arg(long, env = "MAX_DAILY_VOLUME_USD")]
    max_daily_volume: Option<Decimal>,

    /// Max submission attempts per mirror
    #[arg(long, env = "RETRY_LIMIT", default_value = "3")]
    retry_limit: u32,

    /// Leader polling interval in seconds
    #[arg(short, long, env = "FETCH_INTERVAL", default_value = "5")]
    interval: u64,

    /// Seconds to wait for a fill before handing over to reconciliation
    #[arg(long, env = "FILL_TIMEOUT_SECS", default_value = "60")]
    fill_timeout: u64,

    /// Order lifetime at the venue in seconds
    #[arg(long, env = "ORDER_TTL_SECS", default_value = "120")]
    order_ttl: u64,

    /// Concurrent mirror workers
    #[arg(long, env = "WORKERS", default_value = "4")]
    workers: usize,

    /// Seconds between reconciliation passes
    #[arg(long, env = "RECONCILE_INTERVAL_SECS", default_value = "30")]
    reconcile_interval: u64,

    /// Mirror into an in-memory paper venue instead of the CLOB
    #[arg(long)]
    dry_run: bool,
}

impl MirrorArgs {
    fn to_config(&self) -> Result<MirrorConfig> {
        let leader_ratios = match &self.leader_ratios {
            Some(pairs) => parse_decimal_pairs(pairs)?,
            None => Default::default(),
        };
        let market_ceilings = match &self.market_ceilings {
            Some(pairs) => parse_decimal_pairs(pairs)?,
            None => Default::default(),
        };
        let mirrored_markets = self
            .markets
            .as_deref()
            .map(|m| {
                m.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let defaults = MirrorConfig::default();
        let config = MirrorConfig {
            leaders: parse_address_list(&self.leaders),
            sizing: SizingConfig {
                copy_ratio: self.copy_ratio,
                leader_ratios,
                total_capital: self.capital,
                default_market_ceiling: self.market_ceiling.unwrap_or(self.capital),
                market_ceilings,
                mirrored_markets,
                min_order_size: self.min_order_size,
                max_order_fraction: self.max_order_fraction,
                max_trade_age: chrono::Duration::seconds(self.max_trade_age),
                max_daily_volume: self.max_daily_volume,
            },
            execution: ExecutionConfig {
                retry_limit: self.retry_limit,
                fill_timeout: Duration::from_secs(self.fill_timeout),
                order_ttl: Duration::from_secs(self.order_ttl),
                ..defaults.execution
            },
            poll_interval: Duration::from_secs(self.interval),
            workers: self.workers,
            reconcile_interval: Duration::from_secs(self.reconcile_interval),
            dry_run: self.dry_run,
        };

        config.validate()?;
        Ok(config)
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
        return Ok(());
    }

    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn build_venue(dry_run: bool) -> Result<Arc<dyn MarketClient>> {
    let data = DataClient::new().context("failed to build Data API client")?;
    if dry_run {
        info!("Dry run: follower orders go to the paper venue");
        return Ok(Arc::new(PaperVenue::new(data)));
    }

    let clob = ClobClient::from_env().context("CLOB credentials are required unless --dry-run is set")?;
    info!(address = %clob.address(), "CLOB client initialized");
    Ok(Arc::new(PolymarketVenue::new(data, clob)))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    match cli.command {
        Commands::Run(args) => {
            let config = args.to_config()?;
            let db = Database::new(&cli.database)
                .await
                .context("failed to open state store")?;
            let venue = build_venue(config.dry_run)?;

            println!("\n=== Polymarket Trade Mirror ===");
            println!("Leaders: {}", config.leaders.len());
            println!("Capital: ${}", config.sizing.total_capital);
            println!("Mode:    {}", if config.dry_run { "DRY RUN (paper venue)" } else { "LIVE TRADING" });
            println!("\nPress Ctrl+C to stop.\n");

            let bot = Bot::new(config, db.clone(), venue);
            let result = bot.run().await;

            if let Ok(stats) = bot.get_stats().await {
                println!("\n{}", stats);
            }
            db.close().await;
            result?;
        }

        Commands::Reconcile(args) => {
            let config = args.to_config()?;
            let db = Database::new(&cli.database)
                .await
                .context("failed to open state store")?;
            let venue = build_venue(config.dry_run)?;

            let bot = Bot::new(config, db.clone(), venue);
            let report = bot.reconcile_once().await?;
            println!("Reconciliation: {}", report);
            db.close().await;
        }

        Commands::Status { limit } => {
            let db = Database::new(&cli.database)
                .await
                .context("failed to open state store")?;
            print_status(&db, limit).await?;
        }

        Commands::Health(args) => {
            let config = args.to_config()?;
            let db = Database::new(&cli.database)
                .await
                .context("failed to open state store")?;
            let venue = build_venue(config.dry_run)?;

            let report = health::check(&db, venue.as_ref(), &config).await;
            println!("\n{}", report);
            db.close().await;
            if !report.healthy() {
                anyhow::bail!("health check failed");
            }
        }

        Commands::Config(args) => {
            let config = args.to_config()?;
            println!("\n=== Mirror Configuration ===\n");
            println!("{}", config);
        }
    }

    Ok(())
}

async fn print_status(db: &Database, limit: i64) -> Result<()> {
    let counts = db.status_counts().await?;
    if counts.is_empty() {
        println!("No mirror records yet. Use 'polymirror run' to start mirroring.");
        return Ok(());
    }

    println!("\n=== Mirror Records ===");
    for (status, count) in &counts {
        println!("  {:<16} {:>6}", status, count);
    }

    let positions = db.get_positions().await?;
    println!("\n=== Follower Positions ({}) ===", positions.len());
    if !positions.is_empty() {
        println!(
            "  {:<24} {:>10} {:>10} {:>12} {:>10}",
            "MARKET", "SIZE", "AVG", "RESERVED", "P&L"
        );
        for pos in &positions {
            println!(
                "  {:<24} {:>10} {:>10.4} {:>12.2} {:>10.2}",
                truncate(&pos.market_id, 24),
                pos.net_size,
                pos.average_price,
                pos.reserved_capital,
                pos.realized_pnl
            );
        }
    }
    println!("Capital in use: ${:.2}", db.capital_in_use().await?);

    let exceptions = db.recent_exceptions(limit).await?;
    if !exceptions.is_empty() {
        println!("\n=== Recent Skips and Failures ===");
        for record in &exceptions {
            println!(
                "  {:<10} {} {} {} | {}",
                record.status.as_str(),
                truncate(record.id(), 20),
                record.trade.side,
                truncate(&record.trade.market_id, 20),
                record.last_error.as_deref().unwrap_or("-")
            );
        }
    }

    Ok(())
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
