//! Position sizing: turn a leader trade into a follower order or a skip.
//!
//! Sizing is a pure function of its inputs. The caller reads the follower
//! position and global capital usage under the market's lease and passes
//! them in, so identical inputs always give identical decisions.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};

use crate::models::{FollowerPosition, LeaderTrade, OrderIntent, SizingDecision, SkipReason, TradeSide};

use super::SizingConfig;

/// Venue share precision.
const SIZE_DP: u32 = 2;

/// Calculator for follower order sizes.
pub struct PositionSizer {
    config: SizingConfig,
}

impl PositionSizer {
    pub fn new(config: SizingConfig) -> Self {
        Self { config }
    }

    /// Size the follower's response to `trade`.
    ///
    /// # Arguments
    /// * `trade` - The leader trade being mirrored
    /// * `leader_position_before` - Leader's observed net size in the market before the trade
    /// * `position` - Follower position in the market
    /// * `capital_in_use` - Reserved plus committed capital across all markets
    /// * `volume_today` - USDC already spent on buys this UTC day
    /// * `now` - Decision time; becomes the intent's creation time
    pub fn size(
        &self,
        trade: &LeaderTrade,
        leader_position_before: Decimal,
        position: &FollowerPosition,
        capital_in_use: Decimal,
        volume_today: Decimal,
        now: DateTime<Utc>,
    ) -> SizingDecision {
        if trade.is_stale(now, self.config.max_trade_age) {
            return SizingDecision::Skip(SkipReason::TooOld);
        }
        if !self.config.is_mirrored(&trade.market_id) {
            return SizingDecision::Skip(SkipReason::MarketNotMirrored);
        }

        let size = match trade.side {
            TradeSide::Buy => self.buy_size(trade, position, capital_in_use, volume_today),
            TradeSide::Sell => self.sell_size(trade, leader_position_before, position),
        };

        match size {
            Ok(size) => SizingDecision::Order(OrderIntent {
                leader_trade_id: trade.id.clone(),
                market_id: trade.market_id.clone(),
                side: trade.side,
                price: trade.price,
                size,
                created_at: now,
            }),
            Err(reason) => SizingDecision::Skip(reason),
        }
    }

    fn buy_size(
        &self,
        trade: &LeaderTrade,
        position: &FollowerPosition,
        capital_in_use: Decimal,
        volume_today: Decimal,
    ) -> Result<Decimal, SkipReason> {
        let cfg = &self.config;
        let wanted = round_down(trade.size * cfg.ratio_for(&trade.leader));
        if wanted < cfg.min_order_size || wanted <= Decimal::ZERO {
            return Err(SkipReason::BelowMinimumSize);
        }

        // USDC limits on this order's cost
        let market_room = (cfg.ceiling_for(&trade.market_id) - position.exposure()).max(Decimal::ZERO);
        let capital_room = (cfg.total_capital - capital_in_use).max(Decimal::ZERO);
        let order_cap = cfg.max_order_fraction * cfg.total_capital;

        let capital_limit = round_down(market_room.min(capital_room) / trade.price);
        let order_limit = round_down(order_cap / trade.price);
        let daily_limit = cfg
            .max_daily_volume
            .map(|cap| round_down((cap - volume_today).max(Decimal::ZERO) / trade.price));
        let size = wanted
            .min(capital_limit)
            .min(order_limit)
            .min(daily_limit.unwrap_or(wanted));

        if size >= cfg.min_order_size && size > Decimal::ZERO {
            return Ok(size);
        }

        if daily_limit.is_some_and(|d| d < wanted && d <= capital_limit.min(order_limit)) {
            Err(SkipReason::DailyVolumeReached)
        } else if capital_limit < wanted && capital_limit <= order_limit {
            Err(SkipReason::InsufficientCapital)
        } else {
            Err(SkipReason::BelowMinimumSize)
        }
    }

    /// Proportional close: sell the same fraction of our holding that the
    /// leader sold of theirs. A leader exit we cannot measure closes us out.
    /// Shares already promised to open sells are not sold again.
    fn sell_size(
        &self,
        trade: &LeaderTrade,
        leader_position_before: Decimal,
        position: &FollowerPosition,
    ) -> Result<Decimal, SkipReason> {
        if position.is_closed() {
            return Err(SkipReason::NoExistingPosition);
        }

        let held = position.available_shares();
        if held <= Decimal::ZERO {
            return Err(SkipReason::HoldingsReserved);
        }
        let size = if leader_position_before <= Decimal::ZERO || trade.size >= leader_position_before {
            held
        } else {
            round_down(held * (trade.size / leader_position_before)).min(held)
        };

        if size < self.config.min_order_size || size <= Decimal::ZERO {
            return Err(SkipReason::BelowMinimumSize);
        }
        Ok(size)
    }
}

fn round_down(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(SIZE_DP, RoundingStrategy::ToZero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::sample_trade;
    use rust_decimal_macros::dec;

    fn sizer() -> PositionSizer {
        PositionSizer::new(SizingConfig {
            copy_ratio: dec!(0.1),
            total_capital: dec!(1000),
            default_market_ceiling: dec!(1000),
            min_order_size: dec!(5),
            max_order_fraction: dec!(0.1),
            ..Default::default()
        })
    }

    fn holding(size: Decimal, price: Decimal) -> FollowerPosition {
        let mut pos = FollowerPosition::empty("M");
        pos.apply_buy_fill(size, price, price);
        pos
    }

    fn order(decision: SizingDecision) -> OrderIntent {
        match decision {
            SizingDecision::Order(intent) => intent,
            SizingDecision::Skip(reason) => panic!("unexpected skip: {reason}"),
        }
    }

    #[test]
    fn test_leader_buy_100_at_060_sizes_to_10_costing_6() {
        let trade = sample_trade("t1", "M", TradeSide::Buy, dec!(100), dec!(0.60));
        let intent = order(sizer().size(&trade, dec!(0), &FollowerPosition::empty("M"), dec!(0), dec!(0), Utc::now()));

        assert_eq!(intent.size, dec!(10));
        assert_eq!(intent.price, dec!(0.60));
        assert_eq!(intent.cost(), dec!(6.00));
        assert_eq!(intent.leader_trade_id, "t1");
    }

    #[test]
    fn test_intent_never_exceeds_ceiling_minus_reserved() {
        let sizer = PositionSizer::new(SizingConfig {
            copy_ratio: dec!(1),
            total_capital: dec!(10000),
            default_market_ceiling: dec!(100),
            min_order_size: dec!(1),
            max_order_fraction: dec!(1),
            ..Default::default()
        });

        for reserved in [dec!(0), dec!(10), dec!(55.5), dec!(99), dec!(100)] {
            for price in [dec!(0.01), dec!(0.33), dec!(0.6), dec!(0.99)] {
                for leader_size in [dec!(1), dec!(50), dec!(1000), dec!(100000)] {
                    let mut pos = FollowerPosition::empty("M");
                    pos.reserve(reserved);
                    let trade = sample_trade("t", "M", TradeSide::Buy, leader_size, price);

                    if let SizingDecision::Order(intent) = sizer.size(&trade, dec!(0), &pos, reserved, dec!(0), Utc::now()) {
                        assert!(intent.cost() <= dec!(100) - reserved);
                    }
                }
            }
        }
    }

    #[test]
    fn test_sell_without_position_is_skipped() {
        let trade = sample_trade("t1", "M", TradeSide::Sell, dec!(50), dec!(0.70));
        let decision = sizer().size(&trade, dec!(100), &FollowerPosition::empty("M"), dec!(0), dec!(0), Utc::now());
        assert_eq!(decision, SizingDecision::Skip(SkipReason::NoExistingPosition));
    }

    #[test]
    fn test_sell_is_proportional_to_leader_exit() {
        // Leader sells 40 of 100; we hold 30 so we sell 12
        let trade = sample_trade("t1", "M", TradeSide::Sell, dec!(40), dec!(0.70));
        let intent = order(sizer().size(&trade, dec!(100), &holding(dec!(30), dec!(0.5)), dec!(15), dec!(0), Utc::now()));
        assert_eq!(intent.size, dec!(12));
        assert_eq!(intent.side, TradeSide::Sell);
    }

    #[test]
    fn test_full_or_unmeasurable_leader_exit_closes_position() {
        let pos = holding(dec!(7.5), dec!(0.5));

        // Leader sells everything
        let full = sample_trade("t1", "M", TradeSide::Sell, dec!(100), dec!(0.70));
        assert_eq!(order(sizer().size(&full, dec!(100), &pos, dec!(0), dec!(0), Utc::now())).size, dec!(7.5));

        // Leader sells more than we ever saw them hold
        let unseen = sample_trade("t2", "M", TradeSide::Sell, dec!(100), dec!(0.70));
        assert_eq!(order(sizer().size(&unseen, dec!(20), &pos, dec!(0), dec!(0), Utc::now())).size, dec!(7.5));
    }

    #[test]
    fn test_small_orders_skip_below_minimum() {
        let trade = sample_trade("t1", "M", TradeSide::Buy, dec!(30), dec!(0.5));
        let decision = sizer().size(&trade, dec!(0), &FollowerPosition::empty("M"), dec!(0), dec!(0), Utc::now());
        assert_eq!(decision, SizingDecision::Skip(SkipReason::BelowMinimumSize));
    }

    #[test]
    fn test_exhausted_capital_skips_insufficient_capital() {
        let trade = sample_trade("t1", "M", TradeSide::Buy, dec!(100), dec!(0.60));
        let decision = sizer().size(&trade, dec!(0), &FollowerPosition::empty("M"), dec!(998), dec!(0), Utc::now());
        assert_eq!(decision, SizingDecision::Skip(SkipReason::InsufficientCapital));
    }

    #[test]
    fn test_order_fraction_clips_size() {
        // 10% of $1000 = $100 per order -> 200 shares at 0.50
        let trade = sample_trade("t1", "M", TradeSide::Buy, dec!(5000), dec!(0.50));
        let intent = order(sizer().size(&trade, dec!(0), &FollowerPosition::empty("M"), dec!(0), dec!(0), Utc::now()));
        assert_eq!(intent.size, dec!(200));
    }

    #[test]
    fn test_market_filter_and_staleness() {
        let mut config = sizer().config;
        config.mirrored_markets.insert("other".into());
        let sizer = PositionSizer::new(config);

        let trade = sample_trade("t1", "M", TradeSide::Buy, dec!(100), dec!(0.60));
        assert_eq!(
            sizer.size(&trade, dec!(0), &FollowerPosition::empty("M"), dec!(0), dec!(0), Utc::now()),
            SizingDecision::Skip(SkipReason::MarketNotMirrored)
        );

        let late = Utc::now() + chrono::Duration::seconds(301);
        assert_eq!(
            sizer.size(&trade, dec!(0), &FollowerPosition::empty("M"), dec!(0), dec!(0), late),
            SizingDecision::Skip(SkipReason::TooOld)
        );
    }

    #[test]
    fn test_daily_volume_clips_then_skips_buys() {
        let mut config = sizer().config;
        config.max_daily_volume = Some(dec!(50));
        let sizer = PositionSizer::new(config);
        let trade = sample_trade("t1", "M", TradeSide::Buy, dec!(1000), dec!(0.50));
        let empty = FollowerPosition::empty("M");

        // $20 of room left today buys 40 shares instead of 100
        let intent = order(sizer.size(&trade, dec!(0), &empty, dec!(0), dec!(30), Utc::now()));
        assert_eq!(intent.size, dec!(40));
        assert_eq!(intent.cost(), dec!(20));

        assert_eq!(
            sizer.size(&trade, dec!(0), &empty, dec!(0), dec!(49), Utc::now()),
            SizingDecision::Skip(SkipReason::DailyVolumeReached)
        );

        // Sells are never held back by the buy volume cap
        let sell = sample_trade("t2", "M", TradeSide::Sell, dec!(100), dec!(0.50));
        let intent = order(sizer.size(&sell, dec!(100), &holding(dec!(30), dec!(0.5)), dec!(15), dec!(50), Utc::now()));
        assert_eq!(intent.size, dec!(30));
    }

    #[test]
    fn test_sell_sizes_against_unreserved_shares() {
        let mut pos = holding(dec!(30), dec!(0.5));
        pos.reserve_shares(dec!(20));

        // Leader exits fully; only the 10 unpromised shares are sold
        let trade = sample_trade("t1", "M", TradeSide::Sell, dec!(100), dec!(0.70));
        let intent = order(sizer().size(&trade, dec!(100), &pos, dec!(15), dec!(0), Utc::now()));
        assert_eq!(intent.size, dec!(10));

        pos.reserve_shares(dec!(10));
        assert_eq!(
            sizer().size(&trade, dec!(100), &pos, dec!(15), dec!(0), Utc::now()),
            SizingDecision::Skip(SkipReason::HoldingsReserved)
        );
    }

    #[test]
    fn test_sizing_is_deterministic() {
        let trade = sample_trade("t1", "M", TradeSide::Buy, dec!(123.45), dec!(0.37));
        let now = Utc::now();
        let a = sizer().size(&trade, dec!(0), &FollowerPosition::empty("M"), dec!(42), dec!(0), now);
        let b = sizer().size(&trade, dec!(0), &FollowerPosition::empty("M"), dec!(42), dec!(0), now);
        assert_eq!(a, b);
    }
}
