//! Follower position: what the bot-controlled account holds in one market.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Follower holdings and capital usage in one outcome token.
///
/// Mutated only by the Execution Engine on confirmed fills and reservations,
/// always under that market's lease.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowerPosition {
    /// Outcome token ID
    pub market_id: String,

    /// Shares currently held
    pub net_size: Decimal,

    /// Average entry price per share
    pub average_price: Decimal,

    /// USDC reserved for open buy orders
    pub reserved_capital: Decimal,

    /// USDC cost basis of filled shares still held
    pub committed_capital: Decimal,

    /// Shares promised to open sell orders
    #[serde(default)]
    pub reserved_shares: Decimal,

    /// Realized P&L from sells
    #[serde(default)]
    pub realized_pnl: Decimal,

    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
}

impl FollowerPosition {
    /// Empty position in a market.
    pub fn empty(market_id: impl Into<String>) -> Self {
        Self {
            market_id: market_id.into(),
            net_size: Decimal::ZERO,
            average_price: Decimal::ZERO,
            reserved_capital: Decimal::ZERO,
            committed_capital: Decimal::ZERO,
            reserved_shares: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            last_updated: Utc::now(),
        }
    }

    /// Shares not yet promised to an open sell order.
    pub fn available_shares(&self) -> Decimal {
        (self.net_size - self.reserved_shares).max(Decimal::ZERO)
    }

    /// Set aside shares for an open sell order.
    pub fn reserve_shares(&mut self, size: Decimal) {
        self.reserved_shares += size;
        self.last_updated = Utc::now();
    }

    pub fn release_shares(&mut self, size: Decimal) {
        self.reserved_shares = (self.reserved_shares - size).max(Decimal::ZERO);
        self.last_updated = Utc::now();
    }

    /// Capital counted against the market ceiling.
    pub fn exposure(&self) -> Decimal {
        self.reserved_capital + self.committed_capital
    }

    /// Set aside capital for an open buy order.
    pub fn reserve(&mut self, amount: Decimal) {
        self.reserved_capital += amount;
        self.last_updated = Utc::now();
    }

    /// Return reserved capital that will not be used.
    pub fn release(&mut self, amount: Decimal) {
        self.reserved_capital = (self.reserved_capital - amount).max(Decimal::ZERO);
        self.last_updated = Utc::now();
    }

    /// Book a buy fill of `size` shares at `fill_price` against an order
    /// that reserved capital at `limit_price`.
    pub fn apply_buy_fill(&mut self, size: Decimal, fill_price: Decimal, limit_price: Decimal) {
        self.release(size * limit_price);

        let total_cost = self.committed_capital + size * fill_price;
        let new_size = self.net_size + size;
        if !new_size.is_zero() {
            self.average_price = total_cost / new_size;
        }

        self.net_size = new_size;
        self.committed_capital = total_cost;
        self.last_updated = Utc::now();
    }

    /// Book a sell fill; returns realized P&L.
    pub fn apply_sell_fill(&mut self, size: Decimal, fill_price: Decimal) -> Decimal {
        let reduce_size = size.min(self.net_size);
        let realized = reduce_size * (fill_price - self.average_price);

        self.net_size -= reduce_size;
        self.realized_pnl += realized;

        if self.is_closed() {
            self.net_size = Decimal::ZERO;
            self.average_price = Decimal::ZERO;
            self.committed_capital = Decimal::ZERO;
        } else {
            self.committed_capital = self.net_size * self.average_price;
        }

        self.last_updated = Utc::now();
        realized
    }

    /// Check if this position is closed (size is zero or negligible).
    pub fn is_closed(&self) -> bool {
        self.net_size < Decimal::new(1, 6) // Less than 0.000001
    }
}
