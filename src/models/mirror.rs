//! Mirror record: persisted replication state of one leader trade.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{MirrorError, MirrorResult};

use super::{LeaderTrade, OrderIntent};

/// Lifecycle of a mirror: `pending -> sizing -> submitted -> terminal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorStatus {
    Pending,
    Sizing,
    Submitted,
    Filled,
    PartiallyFilled,
    Failed,
    Skipped,
}

impl MirrorStatus {
    pub const TERMINAL: [MirrorStatus; 4] = [
        MirrorStatus::Filled,
        MirrorStatus::PartiallyFilled,
        MirrorStatus::Failed,
        MirrorStatus::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MirrorStatus::Pending => "pending",
            MirrorStatus::Sizing => "sizing",
            MirrorStatus::Submitted => "submitted",
            MirrorStatus::Filled => "filled",
            MirrorStatus::PartiallyFilled => "partially_filled",
            MirrorStatus::Failed => "failed",
            MirrorStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> MirrorResult<Self> {
        Ok(match s {
            "pending" => MirrorStatus::Pending,
            "sizing" => MirrorStatus::Sizing,
            "submitted" => MirrorStatus::Submitted,
            "filled" => MirrorStatus::Filled,
            "partially_filled" => MirrorStatus::PartiallyFilled,
            "failed" => MirrorStatus::Failed,
            "skipped" => MirrorStatus::Skipped,
            other => {
                return Err(MirrorError::StorageUnavailable(format!(
                    "unknown mirror status in store: {other}"
                )))
            }
        })
    }

    /// Terminal states are never revisited.
    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }
}

impl std::fmt::Display for MirrorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Replication state of one leader trade, keyed by the leader trade id.
#[derive(Debug, Clone)]
pub struct MirrorRecord {
    /// The leader trade this record mirrors (its id is the record key)
    pub trade: LeaderTrade,

    /// Leader's observed net size in the market before this trade
    pub leader_position_before: Decimal,

    pub status: MirrorStatus,

    /// Venue order id once the venue has acknowledged an order
    pub follower_order_id: Option<String>,

    /// The sized order, once sizing produced one
    pub intent: Option<OrderIntent>,

    /// Capital currently reserved for this record's open order
    pub reserved: Decimal,

    /// Follower shares filled so far
    pub mirrored_size: Decimal,

    pub attempt_count: u32,

    /// Human-readable reason for skips and failures
    pub last_error: Option<String>,
}

impl MirrorRecord {
    pub fn id(&self) -> &str {
        &self.trade.id
    }
}
