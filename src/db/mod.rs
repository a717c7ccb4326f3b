//! Durable mirror state: the dedup authority for leader trades.
//!
//! Stores everything needed to resume after restart:
//! - Mirror records (one per leader trade id, insert-if-absent)
//! - Follower positions and capital reservations
//! - Observed leader exposure per market
//! - Watcher cursors per leader account
//!
//! Decimal values are stored as TEXT so that amounts survive round trips
//! without float drift.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use tracing::{debug, warn};

use crate::error::{MirrorError, MirrorResult};
use crate::models::{
    FollowerPosition, LeaderTrade, MirrorRecord, MirrorStatus, OrderIntent, TradeSide,
};

/// Database connection pool with full mirror state management.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Result of `try_begin` for a leader trade id.
#[derive(Debug, Clone)]
pub enum BeginOutcome {
    /// A fresh pending record was inserted; the caller owns it.
    Accepted(MirrorRecord),
    /// A record already exists; nothing must be done for this delivery.
    Rejected { status: MirrorStatus },
}

/// Outcome of a capital reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Reserved,
    AlreadyReserved,
    ExceedsMarketCeiling,
    ExceedsCapital,
    /// A sell for more shares than are held and not already promised.
    ExceedsHoldings,
}

/// Stored mirror record row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredMirrorRecord {
    pub leader_trade_id: String,
    pub leader: String,
    pub market_id: String,
    pub condition_id: String,
    pub outcome: String,
    pub side: String,
    pub price: String,
    pub size: String,
    pub leader_ts_ms: i64,
    pub transaction_hash: String,
    pub leader_position_before: String,
    pub status: String,
    pub follower_order_id: Option<String>,
    pub intent_size: Option<String>,
    pub intent_price: Option<String>,
    pub intent_at_ms: Option<i64>,
    pub reserved: String,
    pub mirrored_size: String,
    pub attempt_count: i64,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Stored follower position row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredPosition {
    pub market_id: String,
    pub net_size: String,
    pub average_price: String,
    pub reserved_capital: String,
    pub committed_capital: String,
    pub reserved_shares: String,
    pub realized_pnl: String,
    pub updated_at: String,
}

fn parse_decimal(value: &str) -> MirrorResult<Decimal> {
    Decimal::from_str(value)
        .map_err(|e| MirrorError::StorageUnavailable(format!("corrupt decimal {value:?}: {e}")))
}

fn from_millis(ms: i64) -> MirrorResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| MirrorError::StorageUnavailable(format!("corrupt timestamp {ms}")))
}

impl StoredMirrorRecord {
    fn into_record(self) -> MirrorResult<MirrorRecord> {
        let side = TradeSide::parse(&self.side)
            .map_err(|e| MirrorError::StorageUnavailable(e.to_string()))?;

        let intent = match (&self.intent_size, &self.intent_price, self.intent_at_ms) {
            (Some(size), Some(price), Some(at)) => Some(OrderIntent {
                leader_trade_id: self.leader_trade_id.clone(),
                market_id: self.market_id.clone(),
                side,
                price: parse_decimal(price)?,
                size: parse_decimal(size)?,
                created_at: from_millis(at)?,
            }),
            _ => None,
        };

        Ok(MirrorRecord {
            trade: LeaderTrade {
                id: self.leader_trade_id,
                leader: self.leader,
                market_id: self.market_id,
                condition_id: self.condition_id,
                outcome: self.outcome,
                side,
                price: parse_decimal(&self.price)?,
                size: parse_decimal(&self.size)?,
                timestamp: from_millis(self.leader_ts_ms)?,
                transaction_hash: self.transaction_hash,
            },
            leader_position_before: parse_decimal(&self.leader_position_before)?,
            status: MirrorStatus::parse(&self.status)?,
            follower_order_id: self.follower_order_id,
            intent,
            reserved: parse_decimal(&self.reserved)?,
            mirrored_size: parse_decimal(&self.mirrored_size)?,
            attempt_count: self.attempt_count.max(0) as u32,
            last_error: self.last_error,
        })
    }
}

impl StoredPosition {
    fn into_position(self) -> MirrorResult<FollowerPosition> {
        Ok(FollowerPosition {
            market_id: self.market_id,
            net_size: parse_decimal(&self.net_size)?,
            average_price: parse_decimal(&self.average_price)?,
            reserved_capital: parse_decimal(&self.reserved_capital)?,
            committed_capital: parse_decimal(&self.committed_capital)?,
            reserved_shares: parse_decimal(&self.reserved_shares)?,
            realized_pnl: parse_decimal(&self.realized_pnl)?,
            last_updated: DateTime::parse_from_rfc3339(&self.updated_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }
}

const TERMINAL_SQL: &str = "('filled', 'partially_filled', 'failed', 'skipped')";

fn settled(leader_trade_id: &str) -> MirrorError {
    MirrorError::AmbiguousOutcome(format!("record {leader_trade_id} is missing or already terminal"))
}

impl Database {
    /// Open (creating if missing) the database and run migrations.
    pub async fn new(database_url: &str) -> MirrorResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        // Single writer: read-modify-write transactions never interleave,
        // and an in-memory database lives as long as the pool.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> MirrorResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mirror_records (
                leader_trade_id TEXT PRIMARY KEY,
                leader TEXT NOT NULL,
                market_id TEXT NOT NULL,
                condition_id TEXT NOT NULL DEFAULT '',
                outcome TEXT NOT NULL DEFAULT '',
                side TEXT NOT NULL,
                price TEXT NOT NULL,
                size TEXT NOT NULL,
                leader_ts_ms INTEGER NOT NULL,
                transaction_hash TEXT NOT NULL DEFAULT '',
                leader_position_before TEXT NOT NULL DEFAULT '0',
                status TEXT NOT NULL DEFAULT 'pending',
                follower_order_id TEXT,
                intent_size TEXT,
                intent_price TEXT,
                intent_at_ms INTEGER,
                reserved TEXT NOT NULL DEFAULT '0',
                mirrored_size TEXT NOT NULL DEFAULT '0',
                attempt_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS follower_positions (
                market_id TEXT PRIMARY KEY,
                net_size TEXT NOT NULL DEFAULT '0',
                average_price TEXT NOT NULL DEFAULT '0',
                reserved_capital TEXT NOT NULL DEFAULT '0',
                committed_capital TEXT NOT NULL DEFAULT '0',
                reserved_shares TEXT NOT NULL DEFAULT '0',
                realized_pnl TEXT NOT NULL DEFAULT '0',
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS leader_positions (
                leader TEXT NOT NULL,
                market_id TEXT NOT NULL,
                net_size TEXT NOT NULL DEFAULT '0',
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (leader, market_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS leader_cursors (
                leader TEXT PRIMARY KEY,
                cursor_ms INTEGER NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_mirror_records_status ON mirror_records(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_mirror_records_leader ON mirror_records(leader, leader_ts_ms)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Mirror Records ====================

    /// Atomically insert a pending record for a leader trade if none exists.
    ///
    /// The leader exposure ledger is updated in the same transaction, so the
    /// "position before" captured on the record is stable across replays.
    pub async fn try_begin(&self, trade: &LeaderTrade) -> MirrorResult<BeginOutcome> {
        let mut tx = self.pool.begin().await?;

        let before = load_leader_position(&mut tx, &trade.leader, &trade.market_id).await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO mirror_records (
                leader_trade_id, leader, market_id, condition_id, outcome, side,
                price, size, leader_ts_ms, transaction_hash, leader_position_before, status
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending')
            ON CONFLICT(leader_trade_id) DO NOTHING
            "#,
        )
        .bind(&trade.id)
        .bind(&trade.leader)
        .bind(&trade.market_id)
        .bind(&trade.condition_id)
        .bind(&trade.outcome)
        .bind(trade.side.as_str())
        .bind(trade.price.to_string())
        .bind(trade.size.to_string())
        .bind(trade.timestamp.timestamp_millis())
        .bind(&trade.transaction_hash)
        .bind(before.to_string())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            let (status,): (String,) =
                sqlx::query_as("SELECT status FROM mirror_records WHERE leader_trade_id = ?")
                    .bind(&trade.id)
                    .fetch_one(&mut *tx)
                    .await?;
            tx.rollback().await?;
            return Ok(BeginOutcome::Rejected {
                status: MirrorStatus::parse(&status)?,
            });
        }

        let after = (before + trade.side.sign() * trade.size).max(Decimal::ZERO);
        sqlx::query(
            r#"
            INSERT INTO leader_positions (leader, market_id, net_size, updated_at)
            VALUES (?, ?, ?, datetime('now'))
            ON CONFLICT(leader, market_id) DO UPDATE SET
                net_size = excluded.net_size,
                updated_at = datetime('now')
            "#,
        )
        .bind(&trade.leader)
        .bind(&trade.market_id)
        .bind(after.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(BeginOutcome::Accepted(MirrorRecord {
            trade: trade.clone(),
            leader_position_before: before,
            status: MirrorStatus::Pending,
            follower_order_id: None,
            intent: None,
            reserved: Decimal::ZERO,
            mirrored_size: Decimal::ZERO,
            attempt_count: 0,
            last_error: None,
        }))
    }

    /// Record a leader event that cannot be mirrored as `skipped`, leaving
    /// the exposure ledger untouched. Returns `false` if the id is known.
    pub async fn record_malformed(&self, trade: &LeaderTrade, reason: &str) -> MirrorResult<bool> {
        let rows = sqlx::query(
            r#"
            INSERT INTO mirror_records (
                leader_trade_id, leader, market_id, condition_id, outcome, side,
                price, size, leader_ts_ms, transaction_hash, status, last_error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'skipped', ?)
            ON CONFLICT(leader_trade_id) DO NOTHING
            "#,
        )
        .bind(&trade.id)
        .bind(&trade.leader)
        .bind(&trade.market_id)
        .bind(&trade.condition_id)
        .bind(&trade.outcome)
        .bind(trade.side.as_str())
        .bind(trade.price.to_string())
        .bind(trade.size.to_string())
        .bind(trade.timestamp.timestamp_millis())
        .bind(&trade.transaction_hash)
        .bind(reason)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows == 1)
    }

    /// Fetch one record.
    pub async fn get_record(&self, leader_trade_id: &str) -> MirrorResult<Option<MirrorRecord>> {
        sqlx::query_as::<_, StoredMirrorRecord>(
            "SELECT * FROM mirror_records WHERE leader_trade_id = ?",
        )
        .bind(leader_trade_id)
        .fetch_optional(&self.pool)
        .await?
        .map(StoredMirrorRecord::into_record)
        .transpose()
    }

    /// Move a record from one non-terminal status to another, only if it is
    /// still in `from`. Returns whether the update matched.
    pub async fn transition(
        &self,
        leader_trade_id: &str,
        from: MirrorStatus,
        to: MirrorStatus,
    ) -> MirrorResult<bool> {
        if from.is_terminal() || to.is_terminal() {
            warn!(leader_trade_id, from = %from, to = %to, "Refusing transition involving a terminal status");
            return Ok(false);
        }

        let rows = sqlx::query(&format!(
            r#"
            UPDATE mirror_records SET status = ?, updated_at = datetime('now')
            WHERE leader_trade_id = ? AND status = ? AND status NOT IN {TERMINAL_SQL}
            "#
        ))
        .bind(to.as_str())
        .bind(leader_trade_id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows == 1)
    }

    /// Record the sized intent and move `sizing -> submitted`.
    pub async fn mark_submitted(&self, intent: &OrderIntent) -> MirrorResult<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE mirror_records SET
                status = 'submitted',
                intent_size = ?,
                intent_price = ?,
                intent_at_ms = ?,
                updated_at = datetime('now')
            WHERE leader_trade_id = ? AND status = 'sizing'
            "#,
        )
        .bind(intent.size.to_string())
        .bind(intent.price.to_string())
        .bind(intent.created_at.timestamp_millis())
        .bind(&intent.leader_trade_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows == 1)
    }

    /// Count one more submission attempt; returns the new count.
    ///
    /// Fails with `AmbiguousOutcome` once the record is terminal, so a late
    /// retry can never place an order for a settled trade.
    pub async fn record_attempt(&self, leader_trade_id: &str) -> MirrorResult<u32> {
        let row: Option<(i64,)> = sqlx::query_as(&format!(
            r#"
            UPDATE mirror_records SET
                attempt_count = attempt_count + 1,
                updated_at = datetime('now')
            WHERE leader_trade_id = ? AND status NOT IN {TERMINAL_SQL}
            RETURNING attempt_count
            "#
        ))
        .bind(leader_trade_id)
        .fetch_optional(&self.pool)
        .await?;

        let (count,) = row.ok_or_else(|| settled(leader_trade_id))?;
        Ok(count.max(0) as u32)
    }

    /// Remember the venue order id as soon as the venue acknowledges it.
    pub async fn attach_order_id(&self, leader_trade_id: &str, order_id: &str) -> MirrorResult<()> {
        sqlx::query(&format!(
            r#"
            UPDATE mirror_records SET follower_order_id = ?, updated_at = datetime('now')
            WHERE leader_trade_id = ? AND status NOT IN {TERMINAL_SQL}
            "#
        ))
        .bind(order_id)
        .bind(leader_trade_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Note a non-terminal problem (retry, ambiguity) for the audit trail.
    pub async fn note_error(&self, leader_trade_id: &str, message: &str) -> MirrorResult<()> {
        sqlx::query(&format!(
            r#"
            UPDATE mirror_records SET last_error = ?, updated_at = datetime('now')
            WHERE leader_trade_id = ? AND status NOT IN {TERMINAL_SQL}
            "#
        ))
        .bind(message)
        .bind(leader_trade_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Move a record to a terminal status. Terminal records are immutable:
    /// returns `false` if the record was already terminal (or missing).
    pub async fn commit(
        &self,
        leader_trade_id: &str,
        status: MirrorStatus,
        details: Option<&str>,
    ) -> MirrorResult<bool> {
        if !status.is_terminal() {
            warn!(leader_trade_id, status = %status, "Refusing to commit non-terminal status");
            return Ok(false);
        }

        let rows = sqlx::query(&format!(
            r#"
            UPDATE mirror_records SET
                status = ?,
                last_error = COALESCE(?, last_error),
                updated_at = datetime('now')
            WHERE leader_trade_id = ? AND status NOT IN {TERMINAL_SQL}
            "#
        ))
        .bind(status.as_str())
        .bind(details)
        .bind(leader_trade_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        debug!(leader_trade_id, status = %status, committed = rows == 1, "Commit mirror record");
        Ok(rows == 1)
    }

    /// All records not yet in a terminal status, oldest first.
    pub async fn non_terminal_records(&self) -> MirrorResult<Vec<MirrorRecord>> {
        sqlx::query_as::<_, StoredMirrorRecord>(&format!(
            "SELECT * FROM mirror_records WHERE status NOT IN {TERMINAL_SQL} ORDER BY leader_ts_ms"
        ))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(StoredMirrorRecord::into_record)
        .collect()
    }

    /// Current status of each of `ids` that has a record.
    pub async fn record_statuses(&self, ids: &[String]) -> MirrorResult<HashMap<String, MirrorStatus>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT leader_trade_id, status FROM mirror_records WHERE leader_trade_id IN (");
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        let rows: Vec<(String, String)> = query.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|(id, status)| Ok((id, MirrorStatus::parse(&status)?)))
            .collect()
    }

    /// Record count per status.
    pub async fn status_counts(&self) -> MirrorResult<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM mirror_records GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Most recent skipped and failed records, for audit.
    pub async fn recent_exceptions(&self, limit: i64) -> MirrorResult<Vec<MirrorRecord>> {
        sqlx::query_as::<_, StoredMirrorRecord>(
            r#"
            SELECT * FROM mirror_records
            WHERE status IN ('skipped', 'failed')
            ORDER BY updated_at DESC, leader_ts_ms DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(StoredMirrorRecord::into_record)
        .collect()
    }

    // ==================== Positions ====================

    /// Follower position in a market (empty if never traded).
    pub async fn get_position(&self, market_id: &str) -> MirrorResult<FollowerPosition> {
        let mut conn = self.pool.acquire().await?;
        load_position(&mut conn, market_id).await
    }

    /// All follower positions with any size or capital attached.
    pub async fn get_positions(&self) -> MirrorResult<Vec<FollowerPosition>> {
        sqlx::query_as::<_, StoredPosition>("SELECT * FROM follower_positions ORDER BY market_id")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(StoredPosition::into_position)
            .collect()
    }

    /// Reserved plus committed capital across all markets.
    pub async fn capital_in_use(&self) -> MirrorResult<Decimal> {
        let mut conn = self.pool.acquire().await?;
        total_capital_in_use(&mut conn).await
    }

    /// Reserve capital for a record's buy order, once per record.
    ///
    /// Ceilings are re-checked inside the transaction so concurrent markets
    /// can never jointly overrun the follower's capital.
    pub async fn reserve(
        &self,
        leader_trade_id: &str,
        market_id: &str,
        amount: Decimal,
        market_ceiling: Decimal,
        total_capital: Decimal,
    ) -> MirrorResult<Reservation> {
        let mut tx = self.pool.begin().await?;

        if reserved_for(&mut tx, leader_trade_id).await? > Decimal::ZERO {
            tx.rollback().await?;
            return Ok(Reservation::AlreadyReserved);
        }

        let mut position = load_position(&mut tx, market_id).await?;
        if position.exposure() + amount > market_ceiling {
            tx.rollback().await?;
            return Ok(Reservation::ExceedsMarketCeiling);
        }
        if total_capital_in_use(&mut tx).await? + amount > total_capital {
            tx.rollback().await?;
            return Ok(Reservation::ExceedsCapital);
        }

        position.reserve(amount);
        save_position(&mut tx, &position).await?;
        set_reserved(&mut tx, leader_trade_id, amount).await?;

        tx.commit().await?;
        Ok(Reservation::Reserved)
    }

    /// Reserve held shares for a record's sell order, once per record.
    ///
    /// Open sells together can never promise more shares than the follower
    /// holds. A sell record's `reserved` column counts shares, not USDC.
    pub async fn reserve_shares(
        &self,
        leader_trade_id: &str,
        market_id: &str,
        size: Decimal,
    ) -> MirrorResult<Reservation> {
        let mut tx = self.pool.begin().await?;

        if reserved_for(&mut tx, leader_trade_id).await? > Decimal::ZERO {
            tx.rollback().await?;
            return Ok(Reservation::AlreadyReserved);
        }

        let mut position = load_position(&mut tx, market_id).await?;
        if size > position.available_shares() {
            tx.rollback().await?;
            return Ok(Reservation::ExceedsHoldings);
        }

        position.reserve_shares(size);
        save_position(&mut tx, &position).await?;
        set_reserved(&mut tx, leader_trade_id, size).await?;

        tx.commit().await?;
        Ok(Reservation::Reserved)
    }

    /// Book fills for a record up to `total_filled` shares.
    ///
    /// Only the delta over what the record already booked is applied, so
    /// repeated status polls and reconciliation replays are harmless.
    /// Returns the delta applied.
    pub async fn apply_fill(
        &self,
        leader_trade_id: &str,
        total_filled: Decimal,
        fill_price: Decimal,
    ) -> MirrorResult<Decimal> {
        let mut tx = self.pool.begin().await?;

        let (market_id, side, intent_price, mirrored, reserved): (
            String,
            String,
            Option<String>,
            String,
            String,
        ) = match sqlx::query_as(&format!(
            r#"
            SELECT market_id, side, intent_price, mirrored_size, reserved
            FROM mirror_records WHERE leader_trade_id = ? AND status NOT IN {TERMINAL_SQL}
            "#
        ))
        .bind(leader_trade_id)
        .fetch_optional(&mut *tx)
        .await?
        {
            Some(row) => row,
            None => {
                tx.rollback().await?;
                return Ok(Decimal::ZERO);
            }
        };

        let delta = total_filled - parse_decimal(&mirrored)?;
        if delta <= Decimal::ZERO {
            tx.rollback().await?;
            return Ok(Decimal::ZERO);
        }

        let side = TradeSide::parse(&side).map_err(|e| MirrorError::StorageUnavailable(e.to_string()))?;
        let limit_price = match intent_price {
            Some(p) => parse_decimal(&p)?,
            None => fill_price,
        };

        let mut position = load_position(&mut tx, &market_id).await?;
        let mut reserved = parse_decimal(&reserved)?;
        match side {
            TradeSide::Buy => {
                // Never release more than this record reserved.
                let released = (delta * limit_price).min(reserved);
                position.release(released);
                position.apply_buy_fill(delta, fill_price, Decimal::ZERO);
                reserved -= released;
            }
            TradeSide::Sell => {
                let released = delta.min(reserved);
                position.release_shares(released);
                position.apply_sell_fill(delta, fill_price);
                reserved -= released;
            }
        }
        save_position(&mut tx, &position).await?;

        sqlx::query(
            r#"
            UPDATE mirror_records SET
                mirrored_size = ?,
                reserved = ?,
                updated_at = datetime('now')
            WHERE leader_trade_id = ?
            "#,
        )
        .bind(total_filled.to_string())
        .bind(reserved.to_string())
        .bind(leader_trade_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(delta)
    }

    /// Return whatever a record still has reserved: capital for a buy,
    /// shares for a sell. Returns the amount.
    pub async fn release_reservation(&self, leader_trade_id: &str) -> MirrorResult<Decimal> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(String, String, String)> = sqlx::query_as(&format!(
            r#"
            SELECT market_id, side, reserved FROM mirror_records
            WHERE leader_trade_id = ? AND status NOT IN {TERMINAL_SQL}
            "#
        ))
        .bind(leader_trade_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((market_id, side, reserved)) = row else {
            tx.rollback().await?;
            return Ok(Decimal::ZERO);
        };
        let reserved = parse_decimal(&reserved)?;
        if reserved <= Decimal::ZERO {
            tx.rollback().await?;
            return Ok(Decimal::ZERO);
        }

        let mut position = load_position(&mut tx, &market_id).await?;
        match TradeSide::parse(&side).map_err(|e| MirrorError::StorageUnavailable(e.to_string()))? {
            TradeSide::Buy => position.release(reserved),
            TradeSide::Sell => position.release_shares(reserved),
        }
        save_position(&mut tx, &position).await?;
        set_reserved(&mut tx, leader_trade_id, Decimal::ZERO).await?;

        tx.commit().await?;
        Ok(reserved)
    }

    /// USDC spent on buys whose intent was sized at or after `since`.
    ///
    /// Settled buys count what actually filled; buys still in flight count
    /// their full intent.
    pub async fn buy_volume_since(&self, since: DateTime<Utc>) -> MirrorResult<Decimal> {
        let rows: Vec<(String, Option<String>, Option<String>, String)> = sqlx::query_as(
            r#"
            SELECT status, intent_size, intent_price, mirrored_size FROM mirror_records
            WHERE side = 'BUY' AND intent_at_ms >= ? AND status NOT IN ('failed', 'skipped')
            "#,
        )
        .bind(since.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        let mut total = Decimal::ZERO;
        for (status, size, price, mirrored) in rows {
            let (Some(size), Some(price)) = (size, price) else { continue };
            let shares = if MirrorStatus::parse(&status)?.is_terminal() {
                parse_decimal(&mirrored)?
            } else {
                parse_decimal(&size)?
            };
            total += shares * parse_decimal(&price)?;
        }
        Ok(total)
    }

    // ==================== Leader Exposure ====================

    /// Leader's observed net size in a market.
    #[cfg(test)]
    pub async fn leader_position(&self, leader: &str, market_id: &str) -> MirrorResult<Decimal> {
        let mut conn = self.pool.acquire().await?;
        load_leader_position(&mut conn, leader, market_id).await
    }

    /// Whether the ledger has seen this leader in this market.
    pub async fn has_leader_position(&self, leader: &str, market_id: &str) -> MirrorResult<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM leader_positions WHERE leader = ? AND market_id = ?")
                .bind(leader)
                .bind(market_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.is_some())
    }

    /// Start the ledger for a leader market at `size` unless it already
    /// exists. Returns whether the seed was stored.
    pub async fn seed_leader_position(
        &self,
        leader: &str,
        market_id: &str,
        size: Decimal,
    ) -> MirrorResult<bool> {
        let rows = sqlx::query(
            "INSERT OR IGNORE INTO leader_positions (leader, market_id, net_size) VALUES (?, ?, ?)",
        )
        .bind(leader)
        .bind(market_id)
        .bind(size.max(Decimal::ZERO).to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows == 1)
    }

    // ==================== Cursors ====================

    /// Last committed watcher cursor for a leader.
    pub async fn get_cursor(&self, leader: &str) -> MirrorResult<Option<DateTime<Utc>>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT cursor_ms FROM leader_cursors WHERE leader = ?")
                .bind(leader)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(ms,)| from_millis(ms)).transpose()
    }

    /// Create a cursor for a leader unless one exists; returns the stored cursor.
    pub async fn init_cursor(&self, leader: &str, at: DateTime<Utc>) -> MirrorResult<DateTime<Utc>> {
        sqlx::query("INSERT OR IGNORE INTO leader_cursors (leader, cursor_ms) VALUES (?, ?)")
            .bind(leader)
            .bind(at.timestamp_millis())
            .execute(&self.pool)
            .await?;

        Ok(self.get_cursor(leader).await?.unwrap_or(at))
    }

    /// Move a leader's cursor forward; never moves it back.
    pub async fn advance_cursor(&self, leader: &str, to: DateTime<Utc>) -> MirrorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO leader_cursors (leader, cursor_ms, updated_at)
            VALUES (?, ?, datetime('now'))
            ON CONFLICT(leader) DO UPDATE SET
                cursor_ms = MAX(leader_cursors.cursor_ms, excluded.cursor_ms),
                updated_at = datetime('now')
            "#,
        )
        .bind(leader)
        .bind(to.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Cheap round trip proving the store answers.
    pub async fn ping(&self) -> MirrorResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Close the pool, waiting for connections to be returned.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn load_position(conn: &mut SqliteConnection, market_id: &str) -> MirrorResult<FollowerPosition> {
    let row = sqlx::query_as::<_, StoredPosition>(
        "SELECT * FROM follower_positions WHERE market_id = ?",
    )
    .bind(market_id)
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some(row) => row.into_position(),
        None => Ok(FollowerPosition::empty(market_id)),
    }
}

async fn save_position(conn: &mut SqliteConnection, position: &FollowerPosition) -> MirrorResult<()> {
    sqlx::query(
        r#"
        INSERT INTO follower_positions (
            market_id, net_size, average_price, reserved_capital,
            committed_capital, reserved_shares, realized_pnl, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(market_id) DO UPDATE SET
            net_size = excluded.net_size,
            average_price = excluded.average_price,
            reserved_capital = excluded.reserved_capital,
            committed_capital = excluded.committed_capital,
            reserved_shares = excluded.reserved_shares,
            realized_pnl = excluded.realized_pnl,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&position.market_id)
    .bind(position.net_size.to_string())
    .bind(position.average_price.to_string())
    .bind(position.reserved_capital.to_string())
    .bind(position.committed_capital.to_string())
    .bind(position.reserved_shares.to_string())
    .bind(position.realized_pnl.to_string())
    .bind(position.last_updated.to_rfc3339())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// What a live record has reserved; fails if the record is terminal.
async fn reserved_for(conn: &mut SqliteConnection, leader_trade_id: &str) -> MirrorResult<Decimal> {
    let row: Option<(String,)> = sqlx::query_as(&format!(
        "SELECT reserved FROM mirror_records WHERE leader_trade_id = ? AND status NOT IN {TERMINAL_SQL}"
    ))
    .bind(leader_trade_id)
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some((reserved,)) => parse_decimal(&reserved),
        None => Err(settled(leader_trade_id)),
    }
}

async fn set_reserved(conn: &mut SqliteConnection, leader_trade_id: &str, amount: Decimal) -> MirrorResult<()> {
    sqlx::query("UPDATE mirror_records SET reserved = ?, updated_at = datetime('now') WHERE leader_trade_id = ?")
        .bind(amount.to_string())
        .bind(leader_trade_id)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

async fn total_capital_in_use(conn: &mut SqliteConnection) -> MirrorResult<Decimal> {
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT reserved_capital, committed_capital FROM follower_positions")
            .fetch_all(&mut *conn)
            .await?;

    let mut total = Decimal::ZERO;
    for (reserved, committed) in rows {
        total += parse_decimal(&reserved)? + parse_decimal(&committed)?;
    }
    Ok(total)
}

async fn load_leader_position(
    conn: &mut SqliteConnection,
    leader: &str,
    market_id: &str,
) -> MirrorResult<Decimal> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT net_size FROM leader_positions WHERE leader = ? AND market_id = ?")
            .bind(leader)
            .bind(market_id)
            .fetch_optional(&mut *conn)
            .await?;

    match row {
        Some((size,)) => parse_decimal(&size),
        None => Ok(Decimal::ZERO),
    }
}

#[cfg(test)]
impl Database {
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
pub(crate) async fn memory_db() -> Database {
    Database::new("sqlite::memory:")
        .await
        .expect("in-memory database")
}
