//! Startup health check: state store, venue reachability and follower balance.

use chrono::Utc;
use rust_decimal::Decimal;
use std::fmt;
use tracing::{info, warn};

use crate::api::MarketClient;
use crate::db::Database;
use crate::trading::MirrorConfig;

/// Result of one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check {
    Ok(String),
    Warning(String),
    Error(String),
}

impl Check {
    pub fn is_error(&self) -> bool {
        matches!(self, Check::Error(_))
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Check::Ok(msg) => write!(f, "ok      {msg}"),
            Check::Warning(msg) => write!(f, "warning {msg}"),
            Check::Error(msg) => write!(f, "error   {msg}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub database: Check,
    pub venue: Check,
    pub balance: Check,
}

impl HealthReport {
    /// Warnings do not make the process unhealthy.
    pub fn healthy(&self) -> bool {
        !(self.database.is_error() || self.venue.is_error() || self.balance.is_error())
    }

    /// One log line per check at a level matching its result.
    pub fn log(&self) {
        for (name, check) in [("database", &self.database), ("venue", &self.venue), ("balance", &self.balance)] {
            match check {
                Check::Ok(msg) => info!(check = name, "{msg}"),
                Check::Warning(msg) | Check::Error(msg) => warn!(check = name, status = %check, "{msg}"),
            }
        }
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Health Check ===")?;
        writeln!(f, "Database: {}", self.database)?;
        writeln!(f, "Venue:    {}", self.venue)?;
        writeln!(f, "Balance:  {}", self.balance)?;
        write!(f, "Overall:  {}", if self.healthy() { "healthy" } else { "unhealthy" })
    }
}

/// Run every check once. Never fails; failures are reported per check.
pub async fn check(db: &Database, venue: &dyn MarketClient, config: &MirrorConfig) -> HealthReport {
    let database = match db.ping().await {
        Ok(()) => Check::Ok("state store answering".into()),
        Err(e) => Check::Error(format!("state store unreachable: {e}")),
    };

    let venue_check = match config.leaders.first() {
        Some(leader) => match venue.fetch_leader_trades(leader, Some(Utc::now())).await {
            Ok(_) => Check::Ok(format!("{} API responding", venue.name())),
            Err(e) => Check::Error(format!("{} API unreachable: {e}", venue.name())),
        },
        None => Check::Warning("no leaders configured".into()),
    };

    let balance = match venue.collateral_balance().await {
        Ok(None) => Check::Ok("no follower wallet (paper venue)".into()),
        Ok(Some(balance)) => balance_check(balance, config.sizing.total_capital),
        Err(e) => Check::Error(format!("balance unavailable: {e}")),
    };

    HealthReport {
        database,
        venue: venue_check,
        balance,
    }
}

fn balance_check(balance: Decimal, capital: Decimal) -> Check {
    if balance <= Decimal::ZERO {
        Check::Error("no USDC in the follower wallet".into())
    } else if balance < capital {
        Check::Warning(format!("${balance:.2} USDC is below the configured capital of ${capital}"))
    } else {
        Check::Ok(format!("${balance:.2} USDC available"))
    }
}
