//! Sized order intents, skip reasons, and execution outcomes.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::TradeSide;

/// A follower order the sizer decided to place for one leader trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    /// Leader trade id; doubles as the venue idempotency key
    pub leader_trade_id: String,
    pub market_id: String,
    pub side: TradeSide,
    /// Limit price
    pub price: Decimal,
    /// Shares
    pub size: Decimal,
    pub created_at: DateTime<Utc>,
}

impl OrderIntent {
    /// USDC the order commits if fully filled at its limit.
    pub fn cost(&self) -> Decimal {
        self.size * self.price
    }
}

/// Why a leader trade was not mirrored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    InsufficientCapital,
    BelowMinimumSize,
    MarketNotMirrored,
    NoExistingPosition,
    /// Every held share is already promised to an open sell
    HoldingsReserved,
    DailyVolumeReached,
    TooOld,
    Malformed(String),
}

impl SkipReason {
    pub fn code(&self) -> &'static str {
        match self {
            SkipReason::InsufficientCapital => "insufficientCapital",
            SkipReason::BelowMinimumSize => "belowMinimumSize",
            SkipReason::MarketNotMirrored => "marketNotMirrored",
            SkipReason::NoExistingPosition => "noExistingPosition",
            SkipReason::HoldingsReserved => "holdingsReserved",
            SkipReason::DailyVolumeReached => "dailyVolumeReached",
            SkipReason::TooOld => "tooOld",
            SkipReason::Malformed(_) => "malformed",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::InsufficientCapital => {
                write!(f, "{}: no capital left under the ceiling", self.code())
            }
            SkipReason::BelowMinimumSize => {
                write!(f, "{}: order below venue minimum", self.code())
            }
            SkipReason::MarketNotMirrored => {
                write!(f, "{}: market is not on the mirror list", self.code())
            }
            SkipReason::NoExistingPosition => {
                write!(f, "{}: leader sold a position the follower never opened", self.code())
            }
            SkipReason::HoldingsReserved => {
                write!(f, "{}: held shares are already committed to open sells", self.code())
            }
            SkipReason::DailyVolumeReached => {
                write!(f, "{}: daily buy volume limit reached", self.code())
            }
            SkipReason::TooOld => write!(f, "{}: leader trade is past the max age", self.code()),
            SkipReason::Malformed(detail) => write!(f, "{}: {}", self.code(), detail),
        }
    }
}

/// Result of running the Position Sizer.
#[derive(Debug, Clone, PartialEq)]
pub enum SizingDecision {
    Order(OrderIntent),
    Skip(SkipReason),
}

/// What the Execution Engine observed for a submitted intent.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// Order closed fully filled
    Filled { size: Decimal, avg_price: Decimal },
    /// Order closed with only part of it filled
    PartiallyFilled { size: Decimal, avg_price: Decimal },
    /// Venue refused the order, or it closed without any fill
    Rejected(String),
    /// No confirmation either way; left for reconciliation
    TimedOut,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_intent_cost() {
        let intent = OrderIntent {
            leader_trade_id: "t1".into(),
            market_id: "tok".into(),
            side: TradeSide::Buy,
            price: dec!(0.60),
            size: dec!(10),
            created_at: Utc::now(),
        };
        assert_eq!(intent.cost(), dec!(6.00));
    }

    #[test]
    fn test_skip_reason_text_carries_code() {
        let text = SkipReason::NoExistingPosition.to_string();
        assert!(text.starts_with("noExistingPosition"));
        assert_eq!(SkipReason::Malformed("bad".into()).to_string(), "malformed: bad");
    }
}
