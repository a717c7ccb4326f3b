//! Mirror Coordinator: drives each leader trade through
//! `pending -> sizing -> submitted -> terminal`.
//!
//! Mirrors for different markets run concurrently; everything touching one
//! market runs under that market's lease, so position reads and capital
//! checks never race within a market.

use chrono::{DateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

use crate::api::MarketClient;
use crate::db::{BeginOutcome, Database};
use crate::error::{MirrorError, MirrorResult};
use crate::models::{
    ExecutionOutcome, LeaderTrade, MirrorRecord, MirrorStatus, SizingDecision, SkipReason,
    TradeSide,
};

use super::executor::ExecutionEngine;
use super::position_sizer::PositionSizer;
use super::{ExecutionConfig, SizingConfig};

/// One async mutex per market id.
#[derive(Default)]
pub struct MarketLeases {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl MarketLeases {
    pub async fn acquire(&self, market_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(market_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Marks a record as being driven by this process until dropped.
struct Claim<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    id: String,
}

impl<'a> Claim<'a> {
    fn try_new(in_flight: &'a Mutex<HashSet<String>>, id: &str) -> Option<Self> {
        let inserted = in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string());
        inserted.then(|| Self { in_flight, id: id.to_string() })
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

/// Counts from one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub examined: usize,
    pub resolved: usize,
    pub still_open: usize,
    pub busy: usize,
}

impl std::fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "examined {}, resolved {}, still open {}, in flight {}",
            self.examined, self.resolved, self.still_open, self.busy
        )
    }
}

pub struct MirrorCoordinator {
    db: Database,
    sizer: PositionSizer,
    engine: ExecutionEngine,
    leases: MarketLeases,
    in_flight: Mutex<HashSet<String>>,
}

impl MirrorCoordinator {
    pub fn new(
        db: Database,
        venue: Arc<dyn MarketClient>,
        sizing: SizingConfig,
        execution: ExecutionConfig,
    ) -> Self {
        let engine = ExecutionEngine::new(venue, db.clone(), execution, sizing.clone());
        Self {
            db,
            sizer: PositionSizer::new(sizing),
            engine,
            leases: MarketLeases::default(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Mirror one delivered leader trade.
    ///
    /// Returns the status the record reached, or `None` when the delivery
    /// was a duplicate or malformed. Only storage failures are errors.
    pub async fn handle(&self, trade: LeaderTrade) -> MirrorResult<Option<MirrorStatus>> {
        if let Err(e) = trade.validate() {
            warn!(leader_trade_id = %trade.id, error = %e, "Malformed leader event");
            if !trade.id.trim().is_empty() {
                let reason = SkipReason::Malformed(e.to_string()).to_string();
                self.db.record_malformed(&trade, &reason).await?;
            }
            return Ok(None);
        }

        match self.db.try_begin(&trade).await? {
            BeginOutcome::Rejected { status } => {
                debug!(leader_trade_id = %trade.id, status = %status, "Already handled");
                Ok(None)
            }
            BeginOutcome::Accepted(record) => {
                info!(
                    leader_trade_id = %trade.id,
                    leader = %trade.leader,
                    market = %trade.market_id,
                    side = %trade.side,
                    size = %trade.size,
                    price = %trade.price,
                    notional = %trade.notional(),
                    "Mirroring leader trade"
                );
                self.drive(record).await.map(Some)
            }
        }
    }

    /// Resolve every non-terminal record not currently being driven.
    pub async fn reconcile_pass(&self) -> MirrorResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for record in self.db.non_terminal_records().await? {
            report.examined += 1;
            if self.is_in_flight(record.id()) {
                report.busy += 1;
                continue;
            }

            match self.drive(record).await? {
                status if status.is_terminal() => report.resolved += 1,
                _ => report.still_open += 1,
            }
        }

        if report.examined > 0 {
            info!(%report, "Reconciliation pass");
        }
        Ok(report)
    }

    fn is_in_flight(&self, id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(id)
    }

    /// Advance a record as far as it can go right now.
    async fn drive(&self, record: MirrorRecord) -> MirrorResult<MirrorStatus> {
        let id = record.id().to_string();
        let Some(_claim) = Claim::try_new(&self.in_flight, &id) else {
            return Ok(record.status);
        };
        let _lease = self.leases.acquire(&record.trade.market_id).await;

        // Re-read under the claim; the caller's copy may be stale
        let record = self.db.get_record(&id).await?.unwrap_or(record);

        match record.status {
            MirrorStatus::Pending => {
                if !self.db.transition(&id, MirrorStatus::Pending, MirrorStatus::Sizing).await? {
                    return Ok(self.current_status(&id, record.status).await?);
                }
            }
            MirrorStatus::Sizing => {}
            MirrorStatus::Submitted => {
                let outcome = self.engine.reconcile(&record).await;
                return self.settle(&id, record.trade.side, outcome).await;
            }
            terminal => return Ok(terminal),
        }

        let now = Utc::now();
        let position = self.db.get_position(&record.trade.market_id).await?;
        let capital_in_use = self.db.capital_in_use().await?;
        let volume_today = match record.trade.side {
            TradeSide::Buy => self.db.buy_volume_since(start_of_day(now)).await?,
            TradeSide::Sell => Decimal::ZERO,
        };
        let decision = self.sizer.size(
            &record.trade,
            record.leader_position_before,
            &position,
            capital_in_use,
            volume_today,
            now,
        );

        match decision {
            SizingDecision::Skip(reason) => self.skip(&id, &reason.to_string()).await,
            SizingDecision::Order(intent) => {
                if !self.db.mark_submitted(&intent).await? {
                    return Ok(self.current_status(&id, MirrorStatus::Sizing).await?);
                }
                debug!(leader_trade_id = %id, size = %intent.size, cost = %intent.cost(), "Sized");
                let outcome = self.engine.submit(&intent).await;
                self.settle(&id, intent.side, outcome).await
            }
        }
    }

    async fn current_status(&self, id: &str, fallback: MirrorStatus) -> MirrorResult<MirrorStatus> {
        Ok(self.db.get_record(id).await?.map(|r| r.status).unwrap_or(fallback))
    }

    async fn skip(&self, id: &str, reason: &str) -> MirrorResult<MirrorStatus> {
        warn!(leader_trade_id = %id, reason = %reason, "Skipped");
        self.db.commit(id, MirrorStatus::Skipped, Some(reason)).await?;
        Ok(MirrorStatus::Skipped)
    }

    /// Commit an execution outcome, or leave the record open for reconciliation.
    async fn settle(
        &self,
        id: &str,
        side: TradeSide,
        outcome: MirrorResult<ExecutionOutcome>,
    ) -> MirrorResult<MirrorStatus> {
        match outcome {
            Ok(ExecutionOutcome::Filled { size, avg_price }) => {
                info!(leader_trade_id = %id, size = %size, avg_price = %avg_price, "Mirror filled");
                self.db.commit(id, MirrorStatus::Filled, None).await?;
                Ok(MirrorStatus::Filled)
            }
            Ok(ExecutionOutcome::PartiallyFilled { size, avg_price }) => {
                info!(leader_trade_id = %id, size = %size, avg_price = %avg_price, "Mirror partially filled");
                let details = format!("order closed with {size} filled");
                self.db.commit(id, MirrorStatus::PartiallyFilled, Some(&details)).await?;
                Ok(MirrorStatus::PartiallyFilled)
            }
            Ok(ExecutionOutcome::Rejected(reason)) => {
                warn!(leader_trade_id = %id, reason = %reason, "Mirror failed");
                self.db.commit(id, MirrorStatus::Failed, Some(&reason)).await?;
                Ok(MirrorStatus::Failed)
            }
            Ok(ExecutionOutcome::TimedOut) => {
                warn!(leader_trade_id = %id, "Outcome unconfirmed; awaiting reconciliation");
                self.db.note_error(id, "awaiting reconciliation").await?;
                Ok(MirrorStatus::Submitted)
            }
            Err(MirrorError::CapitalConstraint(detail)) => {
                self.db.release_reservation(id).await?;
                let reason = match side {
                    TradeSide::Buy => SkipReason::InsufficientCapital,
                    TradeSide::Sell => SkipReason::HoldingsReserved,
                };
                self.skip(id, &format!("{}: {detail}", reason.code())).await
            }
            Err(e @ MirrorError::StorageUnavailable(_)) => {
                error!(leader_trade_id = %id, error = %e, "State store failure");
                Err(e)
            }
            Err(e @ (MirrorError::TransientNetwork(_) | MirrorError::AmbiguousOutcome(_))) => {
                warn!(leader_trade_id = %id, error = %e, "Outcome unknown; awaiting reconciliation");
                self.db.note_error(id, &e.to_string()).await?;
                Ok(MirrorStatus::Submitted)
            }
            Err(e) => {
                warn!(leader_trade_id = %id, error = %e, "Mirror failed");
                self.db.release_reservation(id).await?;
                self.db.commit(id, MirrorStatus::Failed, Some(&e.to_string())).await?;
                Ok(MirrorStatus::Failed)
            }
        }
    }
}

/// Midnight UTC of the day containing `now`.
fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::{FillPlan, ScriptedVenue, SubmitScript};
    use crate::api::VenueOrderState;
    use crate::db::memory_db;
    use crate::models::{sample_trade, TradeSide};
    use crate::trading::EventWatcher;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn sizing() -> SizingConfig {
        SizingConfig {
            copy_ratio: dec!(0.1),
            total_capital: dec!(1000),
            default_market_ceiling: dec!(1000),
            min_order_size: dec!(5),
            max_order_fraction: dec!(0.1),
            ..Default::default()
        }
    }

    fn execution() -> ExecutionConfig {
        ExecutionConfig {
            retry_limit: 3,
            fill_timeout: Duration::from_millis(50),
            status_poll_interval: Duration::from_millis(10),
            order_ttl: Duration::from_secs(120),
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(5),
        }
    }

    fn coordinator(db: &Database, venue: &Arc<ScriptedVenue>) -> MirrorCoordinator {
        MirrorCoordinator::new(db.clone(), venue.clone(), sizing(), execution())
    }

    fn buy(id: &str) -> LeaderTrade {
        sample_trade(id, "M", TradeSide::Buy, dec!(100), dec!(0.60))
    }

    #[tokio::test]
    async fn test_leader_buy_is_mirrored_end_to_end() {
        let db = memory_db().await;
        let venue = Arc::new(ScriptedVenue::new());

        let status = coordinator(&db, &venue).handle(buy("t1")).await.unwrap();

        assert_eq!(status, Some(MirrorStatus::Filled));
        let record = db.get_record("t1").await.unwrap().unwrap();
        assert_eq!(record.mirrored_size, dec!(10));
        assert_eq!(db.get_position("M").await.unwrap().committed_capital, dec!(6.00));
    }

    #[tokio::test]
    async fn test_duplicate_delivery_submits_exactly_one_order() {
        let db = memory_db().await;
        let venue = Arc::new(ScriptedVenue::new());
        let coordinator = coordinator(&db, &venue);

        assert_eq!(coordinator.handle(buy("t1")).await.unwrap(), Some(MirrorStatus::Filled));
        assert_eq!(coordinator.handle(buy("t1")).await.unwrap(), None);

        assert_eq!(venue.submit_calls(), 1);
        assert_eq!(db.get_position("M").await.unwrap().net_size, dec!(10));
    }

    #[tokio::test]
    async fn test_concurrent_redelivery_is_idempotent() {
        let db = memory_db().await;
        let venue = Arc::new(ScriptedVenue::new());
        let coordinator = Arc::new(coordinator(&db, &venue));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.handle(buy("t1")).await.unwrap() })
            })
            .collect();

        let mut handled = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                handled += 1;
            }
        }

        assert_eq!(handled, 1);
        assert_eq!(venue.submit_calls(), 1);
        assert_eq!(venue.order_count(), 1);
    }

    #[tokio::test]
    async fn test_sell_without_position_is_skipped_without_order() {
        let db = memory_db().await;
        let venue = Arc::new(ScriptedVenue::new());
        let sell = sample_trade("s1", "M", TradeSide::Sell, dec!(50), dec!(0.70));

        let status = coordinator(&db, &venue).handle(sell).await.unwrap();

        assert_eq!(status, Some(MirrorStatus::Skipped));
        let record = db.get_record("s1").await.unwrap().unwrap();
        assert!(record.last_error.unwrap().starts_with("noExistingPosition"));
        assert_eq!(venue.submit_calls(), 0);
    }

    #[tokio::test]
    async fn test_leader_exit_closes_follower_proportionally() {
        let db = memory_db().await;
        let venue = Arc::new(ScriptedVenue::new());
        let coordinator = coordinator(&db, &venue);

        coordinator.handle(buy("b1")).await.unwrap();
        let sell = sample_trade("s1", "M", TradeSide::Sell, dec!(50), dec!(0.70));
        assert_eq!(coordinator.handle(sell).await.unwrap(), Some(MirrorStatus::Filled));

        // Leader sold half of 100, so we sold half of 10
        let pos = db.get_position("M").await.unwrap();
        assert_eq!(pos.net_size, dec!(5));
        assert_eq!(pos.realized_pnl, dec!(0.50));
    }

    #[tokio::test]
    async fn test_open_sells_never_promise_more_than_held() {
        let db = memory_db().await;
        let venue = Arc::new(ScriptedVenue::new());
        let coordinator = coordinator(&db, &venue);
        coordinator.handle(buy("b1")).await.unwrap();

        // Sell orders rest at the venue without filling
        venue.set_fill_plan(FillPlan::Open);
        for id in ["s1", "s2"] {
            let sell = sample_trade(id, "M", TradeSide::Sell, dec!(50), dec!(0.70));
            assert_eq!(coordinator.handle(sell).await.unwrap(), Some(MirrorStatus::Submitted));
        }

        let s1 = db.get_record("s1").await.unwrap().unwrap().intent.unwrap();
        let s2 = db.get_record("s2").await.unwrap().unwrap().intent.unwrap();
        assert_eq!((s1.size, s2.size), (dec!(5), dec!(5)));
        let pos = db.get_position("M").await.unwrap();
        assert_eq!(pos.net_size, dec!(10));
        assert_eq!(pos.reserved_shares, dec!(10));

        // Nothing left to sell against
        let sell = sample_trade("s3", "M", TradeSide::Sell, dec!(10), dec!(0.70));
        assert_eq!(coordinator.handle(sell).await.unwrap(), Some(MirrorStatus::Skipped));
        let record = db.get_record("s3").await.unwrap().unwrap();
        assert!(record.last_error.unwrap().starts_with("holdingsReserved"));
        assert_eq!(venue.submit_calls(), 3);
    }

    #[tokio::test]
    async fn test_partial_fill_then_cancel_commits_partially_filled() {
        let db = memory_db().await;
        let venue = Arc::new(ScriptedVenue::new());
        venue.set_fill_plan(FillPlan::PartialThenCancelled(dec!(4)));

        let status = coordinator(&db, &venue).handle(buy("t1")).await.unwrap();

        assert_eq!(status, Some(MirrorStatus::PartiallyFilled));
        let record = db.get_record("t1").await.unwrap().unwrap();
        assert_eq!(record.mirrored_size, dec!(4));
        assert_eq!(record.last_error.as_deref(), Some("order closed with 4 filled"));
        let pos = db.get_position("M").await.unwrap();
        assert_eq!(pos.net_size, dec!(4));
        assert_eq!(pos.reserved_capital, dec!(0));
        assert_eq!(db.capital_in_use().await.unwrap(), dec!(2.40));
    }

    #[tokio::test]
    async fn test_daily_volume_limit_stops_buys() {
        let db = memory_db().await;
        let venue = Arc::new(ScriptedVenue::new());
        let mut limits = sizing();
        limits.max_daily_volume = Some(dec!(10));
        let coordinator = MirrorCoordinator::new(db.clone(), venue.clone(), limits, execution());

        assert_eq!(coordinator.handle(buy("a")).await.unwrap(), Some(MirrorStatus::Filled));
        // $4 of the day's $10 is left: 6.66 shares instead of 10
        assert_eq!(coordinator.handle(buy("b")).await.unwrap(), Some(MirrorStatus::Filled));
        assert_eq!(db.get_record("b").await.unwrap().unwrap().mirrored_size, dec!(6.66));

        assert_eq!(coordinator.handle(buy("c")).await.unwrap(), Some(MirrorStatus::Skipped));
        let record = db.get_record("c").await.unwrap().unwrap();
        assert!(record.last_error.unwrap().starts_with("dailyVolumeReached"));
        assert_eq!(venue.submit_calls(), 2);
    }

    #[test]
    fn test_day_starts_at_utc_midnight() {
        let now = chrono::TimeZone::with_ymd_and_hms(&Utc, 2026, 3, 14, 15, 9, 26).unwrap();
        let start = start_of_day(now);
        assert_eq!(start, chrono::TimeZone::with_ymd_and_hms(&Utc, 2026, 3, 14, 0, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_open_order_stays_submitted_until_reconciled() {
        let db = memory_db().await;
        let venue = Arc::new(ScriptedVenue::new());
        venue.set_fill_plan(FillPlan::Open);
        let coordinator = coordinator(&db, &venue);

        assert_eq!(coordinator.handle(buy("t1")).await.unwrap(), Some(MirrorStatus::Submitted));
        assert_eq!(db.get_record("t1").await.unwrap().unwrap().status, MirrorStatus::Submitted);

        // Still open: reconciliation leaves it alone and does not resubmit
        let report = coordinator.reconcile_pass().await.unwrap();
        assert_eq!(report.still_open, 1);

        venue.set_order("order-t1", VenueOrderState::Filled, dec!(10));
        let report = coordinator.reconcile_pass().await.unwrap();
        assert_eq!(report.resolved, 1);
        assert_eq!(db.get_record("t1").await.unwrap().unwrap().status, MirrorStatus::Filled);
        assert_eq!(venue.submit_calls(), 1);
    }

    #[tokio::test]
    async fn test_restart_never_resubmits_terminal_trades() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/mirror.db?mode=rwc", dir.path().display());
        let venue = Arc::new(ScriptedVenue::new());

        let mut done = buy("done");
        done.timestamp = Utc::now() - chrono::Duration::seconds(2);
        let mut crashed = buy("crashed");
        crashed.timestamp = Utc::now() - chrono::Duration::seconds(1);
        venue.add_leader_trade(done.clone());
        venue.add_leader_trade(crashed.clone());

        {
            let db = Database::new(&url).await.unwrap();
            db.init_cursor(&done.leader, done.timestamp - chrono::Duration::seconds(1))
                .await
                .unwrap();
            let coordinator = coordinator(&db, &venue);
            assert_eq!(coordinator.handle(done.clone()).await.unwrap(), Some(MirrorStatus::Filled));

            // Second trade: the order lands but we never learn about it
            venue.script_submits([SubmitScript::LostAck]);
            venue.fail_find(1);
            assert_eq!(coordinator.handle(crashed.clone()).await.unwrap(), Some(MirrorStatus::Submitted));
            db.close().await;
        }

        let db = Database::new(&url).await.unwrap();
        let coordinator = coordinator(&db, &venue);

        // Replaying the watcher from the persisted cursor delivers nothing new
        let watcher = EventWatcher::new(venue.clone(), db.clone(), Duration::from_millis(5));
        for trade in watcher.poll_once(&done.leader).await.unwrap() {
            coordinator.handle(trade).await.unwrap();
        }
        assert_eq!(coordinator.handle(done).await.unwrap(), None);

        let report = coordinator.reconcile_pass().await.unwrap();
        assert_eq!(report.resolved, 1);
        assert_eq!(db.get_record("crashed").await.unwrap().unwrap().status, MirrorStatus::Filled);
        assert_eq!(venue.submit_calls(), 2);
        assert_eq!(venue.order_count(), 2);
    }

    #[tokio::test]
    async fn test_reconcile_redrives_records_left_pending() {
        let db = memory_db().await;
        let venue = Arc::new(ScriptedVenue::new());
        db.try_begin(&buy("t1")).await.unwrap();

        let report = coordinator(&db, &venue).reconcile_pass().await.unwrap();

        assert_eq!(report.resolved, 1);
        assert_eq!(db.get_record("t1").await.unwrap().unwrap().status, MirrorStatus::Filled);
    }

    #[tokio::test]
    async fn test_same_market_mirrors_never_overrun_ceiling() {
        let db = memory_db().await;
        let venue = Arc::new(ScriptedVenue::new());
        let mut limits = sizing();
        limits.market_ceilings.insert("M".into(), dec!(10));
        let coordinator = Arc::new(MirrorCoordinator::new(db.clone(), venue.clone(), limits, execution()));

        let handles: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|id| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.handle(buy(id)).await.unwrap() })
            })
            .collect();

        let mut statuses = Vec::new();
        for handle in handles {
            statuses.push(handle.await.unwrap());
        }

        // $6, then the $4 left (6.66 shares), then nothing fits
        let filled = statuses.iter().filter(|s| **s == Some(MirrorStatus::Filled)).count();
        let skipped = statuses.iter().filter(|s| **s == Some(MirrorStatus::Skipped)).count();
        assert_eq!((filled, skipped), (2, 1));

        let pos = db.get_position("M").await.unwrap();
        assert_eq!(pos.net_size, dec!(16.66));
        assert!(pos.exposure() <= dec!(10));
    }

    #[tokio::test]
    async fn test_malformed_and_stale_events_are_recorded_as_skipped() {
        let db = memory_db().await;
        let venue = Arc::new(ScriptedVenue::new());
        let coordinator = coordinator(&db, &venue);

        let mut bad = buy("bad");
        bad.price = Decimal::ZERO;
        assert_eq!(coordinator.handle(bad).await.unwrap(), None);
        let record = db.get_record("bad").await.unwrap().unwrap();
        assert_eq!(record.status, MirrorStatus::Skipped);
        assert!(record.last_error.unwrap().starts_with("malformed"));

        let mut old = buy("old");
        old.timestamp = Utc::now() - chrono::Duration::minutes(30);
        assert_eq!(coordinator.handle(old).await.unwrap(), Some(MirrorStatus::Skipped));
        let record = db.get_record("old").await.unwrap().unwrap();
        assert!(record.last_error.unwrap().starts_with("tooOld"));

        assert_eq!(venue.submit_calls(), 0);
    }

    #[tokio::test]
    async fn test_venue_rejection_commits_failed_with_reason() {
        let db = memory_db().await;
        let venue = Arc::new(ScriptedVenue::new());
        venue.script_submits([SubmitScript::Reject("market closed".into())]);

        let status = coordinator(&db, &venue).handle(buy("t1")).await.unwrap();

        assert_eq!(status, Some(MirrorStatus::Failed));
        let record = db.get_record("t1").await.unwrap().unwrap();
        assert_eq!(record.last_error.as_deref(), Some("market closed"));
        assert_eq!(db.capital_in_use().await.unwrap(), dec!(0));
    }
}
