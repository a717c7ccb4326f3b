//! Venue capability interface consumed by the mirroring core.
//!
//! The core owns retries and backoff; implementations make exactly one
//! attempt per call and classify what went wrong.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::MirrorResult;
use crate::models::{LeaderTrade, OrderIntent, TradeSide};

/// A follower order as sent to the venue.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    /// Outcome token to trade
    pub market_id: String,
    pub side: TradeSide,
    pub price: Decimal,
    pub size: Decimal,
    /// Leader trade id; the same key always yields the same venue order
    pub idempotency_key: String,
    /// Venue-side expiry of the order
    pub expires_at: DateTime<Utc>,
}

impl OrderRequest {
    /// Build the request for an intent. `ttl` is measured from intent
    /// creation so every resubmission of the intent is identical.
    pub fn from_intent(intent: &OrderIntent, ttl: chrono::Duration) -> Self {
        Self {
            market_id: intent.market_id.clone(),
            side: intent.side,
            price: intent.price,
            size: intent.size,
            idempotency_key: intent.leader_trade_id.clone(),
            expires_at: intent.created_at + ttl,
        }
    }
}

/// Lifecycle state of a venue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VenueOrderState {
    /// Resting or being matched
    Open,
    Filled,
    Cancelled,
    Expired,
}

impl VenueOrderState {
    /// Whether the venue will do nothing more with the order.
    pub fn is_closed(&self) -> bool {
        !matches!(self, VenueOrderState::Open)
    }
}

/// Snapshot of a venue order.
#[derive(Debug, Clone, PartialEq)]
pub struct VenueOrder {
    pub order_id: String,
    pub state: VenueOrderState,
    /// Total shares matched so far
    pub size_matched: Decimal,
    /// Average price of the matched shares
    pub avg_price: Decimal,
}

/// What the mirroring core needs from a trading venue.
#[async_trait]
pub trait MarketClient: Send + Sync {
    /// Leader trades at or after `since`, oldest first.
    async fn fetch_leader_trades(
        &self,
        account: &str,
        since: Option<DateTime<Utc>>,
    ) -> MirrorResult<Vec<LeaderTrade>>;

    /// Place an order; returns the venue order id.
    async fn submit_order(&self, request: &OrderRequest) -> MirrorResult<String>;

    /// Current state of an order; `None` if the venue does not know it.
    async fn get_order_status(&self, order_id: &str) -> MirrorResult<Option<VenueOrder>>;

    /// Look up whether a prior attempt for this request reached the venue.
    async fn find_order(&self, request: &OrderRequest) -> MirrorResult<Option<String>>;

    /// Leader account's current size in a market, as the venue reports it.
    async fn leader_position(&self, account: &str, market_id: &str) -> MirrorResult<Decimal>;

    /// Spendable follower collateral; `None` when the venue has no wallet.
    async fn collateral_balance(&self) -> MirrorResult<Option<Decimal>>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}
