//! Leader trade model: one observed fill on a leader account.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{MirrorError, MirrorResult};

/// Direction of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }

    /// Parse a venue side string (case-insensitive).
    pub fn parse(s: &str) -> MirrorResult<Self> {
        match s.to_uppercase().as_str() {
            "BUY" => Ok(TradeSide::Buy),
            "SELL" => Ok(TradeSide::Sell),
            other => Err(MirrorError::MalformedEvent(format!("unknown trade side: {other}"))),
        }
    }

    /// Signed multiplier applied to sizes when updating net exposure.
    pub fn sign(&self) -> Decimal {
        match self {
            TradeSide::Buy => Decimal::ONE,
            TradeSide::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trade observed on a leader account. Immutable once observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderTrade {
    /// Venue trade identifier, unique across leaders
    pub id: String,

    /// Leader wallet address
    pub leader: String,

    /// Outcome token the trade was in; the unit of follower exposure
    pub market_id: String,

    /// Market condition ID, for display
    #[serde(default)]
    pub condition_id: String,

    /// Outcome name (e.g. "Yes")
    #[serde(default)]
    pub outcome: String,

    /// Trade direction
    pub side: TradeSide,

    /// Price per share in USDC (0.0 to 1.0)
    pub price: Decimal,

    /// Number of shares
    pub size: Decimal,

    /// When the trade happened at the venue
    pub timestamp: DateTime<Utc>,

    /// On-chain transaction hash
    #[serde(default)]
    pub transaction_hash: String,
}

impl LeaderTrade {
    /// USDC value of the trade.
    pub fn notional(&self) -> Decimal {
        self.size * self.price
    }

    /// Reject events we cannot mirror meaningfully.
    pub fn validate(&self) -> MirrorResult<()> {
        if self.id.trim().is_empty() {
            return Err(MirrorError::MalformedEvent("empty trade id".into()));
        }
        if self.market_id.trim().is_empty() {
            return Err(MirrorError::MalformedEvent(format!(
                "trade {} has no market",
                self.id
            )));
        }
        if self.size <= Decimal::ZERO {
            return Err(MirrorError::MalformedEvent(format!(
                "trade {} has non-positive size {}",
                self.id, self.size
            )));
        }
        if self.price <= Decimal::ZERO || self.price >= Decimal::ONE {
            return Err(MirrorError::MalformedEvent(format!(
                "trade {} has price {} outside (0, 1)",
                self.id, self.price
            )));
        }
        Ok(())
    }

    /// Whether the trade is older than `max_age` at `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        now - self.timestamp > max_age
    }
}

#[cfg(test)]
pub(crate) fn sample_trade(id: &str, market: &str, side: TradeSide, size: Decimal, price: Decimal) -> LeaderTrade {
    LeaderTrade {
        id: id.to_string(),
        leader: "0x1111111111111111111111111111111111111111".to_string(),
        market_id: market.to_string(),
        condition_id: "0xcond".to_string(),
        outcome: "Yes".to_string(),
        side,
        price,
        size,
        timestamp: Utc::now(),
        transaction_hash: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_side_parse() {
        assert_eq!(TradeSide::parse("buy").unwrap(), TradeSide::Buy);
        assert_eq!(TradeSide::parse("SELL").unwrap(), TradeSide::Sell);
        assert!(matches!(
            TradeSide::parse("MERGE"),
            Err(MirrorError::MalformedEvent(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_price_and_size() {
        let good = sample_trade("t1", "tok", TradeSide::Buy, dec!(100), dec!(0.60));
        assert!(good.validate().is_ok());
        assert_eq!(good.notional(), dec!(60));

        let zero_size = LeaderTrade { size: Decimal::ZERO, ..good.clone() };
        assert!(zero_size.validate().is_err());

        let bad_price = LeaderTrade { price: dec!(1.2), ..good.clone() };
        assert!(bad_price.validate().is_err());

        let no_id = LeaderTrade { id: " ".into(), ..good };
        assert!(no_id.validate().is_err());
    }

    #[test]
    fn test_stale_detection() {
        let mut trade = sample_trade("t1", "tok", TradeSide::Buy, dec!(1), dec!(0.5));
        let now = Utc::now();
        trade.timestamp = now - Duration::seconds(600);
        assert!(trade.is_stale(now, Duration::seconds(300)));
        assert!(!trade.is_stale(now, Duration::seconds(900)));
    }
}
