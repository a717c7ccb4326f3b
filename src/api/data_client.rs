//! Polymarket Data API client for reading leader trade activity.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{MirrorError, MirrorResult};
use crate::models::{LeaderTrade, TradeSide};

use super::types::{ActivityResponse, PositionResponse};

const DATA_API_BASE: &str = "https://data-api.polymarket.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const PAGE_SIZE: u32 = 500;
/// The Data API refuses offsets past this.
const MAX_OFFSET: u32 = 10_000;

/// Client for Polymarket Data API (read-only operations).
pub struct DataClient {
    client: Client,
    base_url: String,
}

impl DataClient {
    /// Create a new data client with default settings.
    pub fn new() -> Result<Self> {
        Self::with_base_url(DATA_API_BASE.to_string())
    }

    /// Create with custom base URL (for testing).
    pub fn with_base_url(base_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, base_url })
    }

    /// Fetch one page of trade activity for an account, oldest first.
    pub async fn get_trade_activity(
        &self,
        address: &str,
        start: Option<i64>,
        offset: u32,
    ) -> MirrorResult<Vec<ActivityResponse>> {
        let mut url = format!(
            "{}/activity?user={}&type=TRADE&sortBy=TIMESTAMP&sortDirection=ASC&limit={}&offset={}",
            self.base_url, address, PAGE_SIZE, offset
        );
        if let Some(start) = start {
            url = format!("{}&start={}", url, start);
        }

        debug!(url = %url, "Fetching activity");

        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            // Reads carry no side effects, so every failure is worth retrying
            return Err(MirrorError::TransientNetwork(format!(
                "Activity request failed: {} - {}",
                status, body
            )));
        }

        Ok(response.json().await?)
    }

    /// Fetch all leader trades at or after `since` (second resolution,
    /// inclusive), oldest first.
    ///
    /// Unparseable rows are dropped with a warning; they can never be
    /// mirrored and must not stall the account's cursor.
    pub async fn fetch_leader_trades(
        &self,
        address: &str,
        since: Option<DateTime<Utc>>,
    ) -> MirrorResult<Vec<LeaderTrade>> {
        let start = since.map(|ts| ts.timestamp());
        let mut activities = Vec::new();
        let mut offset = 0u32;

        loop {
            let page = self.get_trade_activity(address, start, offset).await?;
            let page_len = page.len() as u32;

            activities.extend(page);

            if page_len < PAGE_SIZE || offset + PAGE_SIZE > MAX_OFFSET {
                break;
            }
            offset += PAGE_SIZE;

            // Rate limiting
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let mut trades: Vec<LeaderTrade> = activities
            .into_iter()
            .filter_map(|a| to_leader_trade(address, a))
            .collect();
        number_identical_fills(&mut trades);
        trades.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(trades)
    }

    /// Leader's current size in one outcome token; zero if they hold none.
    pub async fn get_position_size(&self, address: &str, asset: &str) -> MirrorResult<Decimal> {
        let url = format!("{}/positions?user={}&sizeThreshold=0", self.base_url, address);

        debug!(url = %url, "Fetching positions");

        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(MirrorError::TransientNetwork(format!(
                "Positions request failed: {} - {}",
                status, body
            )));
        }

        let positions: Vec<PositionResponse> = response.json().await?;
        Ok(positions
            .iter()
            .filter(|p| p.asset == asset)
            .map(|p| p.size)
            .sum())
    }
}

/// Suffix repeated ids with their ordinal in response order. A transaction
/// can carry two fills with the same size and price; a page window always
/// holds every fill of a transaction, so ordinals are stable across polls.
fn number_identical_fills(trades: &mut [LeaderTrade]) {
    let mut seen: HashMap<String, u32> = HashMap::new();
    for trade in trades.iter_mut() {
        let n = seen.entry(trade.id.clone()).or_insert(0);
        if *n > 0 {
            trade.id = format!("{}:{}", trade.id, n);
        }
        *n += 1;
    }
}

fn to_leader_trade(leader: &str, activity: ActivityResponse) -> Option<LeaderTrade> {
    if !activity.activity_type.eq_ignore_ascii_case("TRADE") {
        return None;
    }

    let side = match TradeSide::parse(&activity.side) {
        Ok(side) => side,
        Err(_) => {
            warn!(side = %activity.side, tx = %activity.transaction_hash, "Unknown trade side");
            return None;
        }
    };

    let timestamp = Utc.timestamp_opt(activity.timestamp, 0).single()?;

    Some(LeaderTrade {
        id: activity.trade_id(),
        leader: leader.to_lowercase(),
        market_id: activity.asset,
        condition_id: activity.condition_id,
        outcome: activity.outcome,
        side,
        price: activity.price,
        size: activity.size,
        timestamp,
        transaction_hash: activity.transaction_hash,
    })
}
