//! Data models for leader trades, mirror records, follower positions, and orders.

mod mirror;
mod order;
mod position;
mod trade;

pub use mirror::{MirrorRecord, MirrorStatus};
pub use order::{ExecutionOutcome, OrderIntent, SizingDecision, SkipReason};
pub use position::FollowerPosition;
pub use trade::{LeaderTrade, TradeSide};

#[cfg(test)]
pub(crate) use trade::sample_trade;
