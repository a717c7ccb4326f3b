//! Event Watcher: turns leader account activity into a lazy stream of trades.
//!
//! Each cycle re-queries from the persisted cursor (inclusive), so a cycle's
//! worth of trades is never lost to a failed fetch or a restart. The cursor
//! never moves past a trade whose mirror record is not terminal; the
//! Dedup & State Store is the final filter for anything delivered twice.
//!
//! The first time a leader shows up in a market, their exposure ledger is
//! seeded from the venue's live position so proportional sells measure
//! against what they actually held, not just what we watched them buy.

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::MarketClient;
use crate::db::Database;
use crate::error::MirrorResult;
use crate::models::LeaderTrade;

use super::retry::FullJitter;

const FETCH_BACKOFF_BASE: Duration = Duration::from_secs(1);
const FETCH_BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct EventWatcher {
    venue: Arc<dyn MarketClient>,
    db: Database,
    poll_interval: Duration,
    backoff_base: Duration,
    backoff_cap: Duration,
}

struct WatchState {
    watcher: EventWatcher,
    leader: String,
    queue: VecDeque<LeaderTrade>,
    backoff: FullJitter,
    polled: bool,
    stopped: bool,
}

impl EventWatcher {
    pub fn new(venue: Arc<dyn MarketClient>, db: Database, poll_interval: Duration) -> Self {
        Self {
            venue,
            db,
            poll_interval,
            backoff_base: FETCH_BACKOFF_BASE,
            backoff_cap: FETCH_BACKOFF_CAP,
        }
    }

    /// Override the fetch retry backoff (for testing).
    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    /// Infinite stream of one leader's trades. Fetch failures are retried
    /// forever; the stream only yields an error (and then ends) when the
    /// state store fails.
    pub fn watch_account(&self, leader: String) -> BoxStream<'static, MirrorResult<LeaderTrade>> {
        let state = WatchState {
            watcher: self.clone(),
            leader,
            queue: VecDeque::new(),
            backoff: FullJitter::new(self.backoff_base, self.backoff_cap),
            polled: false,
            stopped: false,
        };

        stream::unfold(state, |mut st| async move {
            loop {
                if let Some(trade) = st.queue.pop_front() {
                    return Some((Ok(trade), st));
                }
                if st.stopped {
                    return None;
                }
                if st.polled {
                    tokio::time::sleep(st.watcher.poll_interval).await;
                }

                match st.watcher.poll_once(&st.leader).await {
                    Ok(trades) => {
                        st.backoff.reset();
                        st.polled = true;
                        st.queue.extend(trades);
                    }
                    Err(e) if e.is_fatal() => {
                        st.stopped = true;
                        return Some((Err(e), st));
                    }
                    Err(e) => {
                        let delay = st.backoff.next_delay();
                        warn!(leader = %st.leader, error = %e, delay_ms = delay.as_millis() as u64, "Leader fetch failed; retrying");
                        tokio::time::sleep(delay).await;
                        st.polled = false;
                    }
                }
            }
        })
        .boxed()
    }

    /// Merged stream over several leaders.
    pub fn watch(&self, leaders: &[String]) -> BoxStream<'static, MirrorResult<LeaderTrade>> {
        stream::select_all(leaders.iter().map(|leader| self.watch_account(leader.clone()))).boxed()
    }

    /// One polling cycle: fetch from the cursor, advance it, and return the
    /// trades that have no mirror record yet.
    pub async fn poll_once(&self, leader: &str) -> MirrorResult<Vec<LeaderTrade>> {
        let cursor = self.cursor(leader).await?;
        let mut trades = self.venue.fetch_leader_trades(leader, Some(cursor)).await?;
        trades.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

        let ids: Vec<String> = trades.iter().map(|t| t.id.clone()).collect();
        let statuses = self.db.record_statuses(&ids).await?;

        // Earliest trade not yet terminal pins the cursor
        let next = trades
            .iter()
            .find(|t| !statuses.get(&t.id).is_some_and(|s| s.is_terminal()))
            .or(trades.last())
            .map(|t| t.timestamp);
        if let Some(next) = next {
            self.db.advance_cursor(leader, next).await?;
        }

        let fresh: Vec<LeaderTrade> = trades
            .into_iter()
            .filter(|t| !statuses.contains_key(&t.id))
            .collect();
        self.seed_leader_ledger(leader, &fresh).await?;

        debug!(leader = %leader, cursor = %cursor, fresh = fresh.len(), "Poll cycle");
        Ok(fresh)
    }

    /// Seed unseen (leader, market) ledgers with the live position net of
    /// the fresh trades that will be replayed onto it.
    async fn seed_leader_ledger(&self, leader: &str, fresh: &[LeaderTrade]) -> MirrorResult<()> {
        let mut replayed: HashMap<(&str, &str), Decimal> = HashMap::new();
        for trade in fresh.iter().filter(|t| t.validate().is_ok()) {
            *replayed
                .entry((trade.leader.as_str(), trade.market_id.as_str()))
                .or_default() += trade.side.sign() * trade.size;
        }

        for ((account, market_id), net) in replayed {
            if self.db.has_leader_position(account, market_id).await? {
                continue;
            }
            match self.venue.leader_position(leader, market_id).await {
                Ok(live) => {
                    let seed = (live - net).max(Decimal::ZERO);
                    if self.db.seed_leader_position(account, market_id, seed).await? {
                        info!(leader = %account, market = %market_id, live = %live, seed = %seed, "Seeded leader exposure");
                    }
                }
                Err(e) => {
                    warn!(leader = %account, market = %market_id, error = %e, "Leader position unavailable; exposure starts at zero");
                }
            }
        }
        Ok(())
    }

    /// Stored cursor, or "now" on first sight of a leader so history is skipped.
    async fn cursor(&self, leader: &str) -> MirrorResult<DateTime<Utc>> {
        match self.db.get_cursor(leader).await? {
            Some(cursor) => Ok(cursor),
            None => {
                let cursor = self.db.init_cursor(leader, Utc::now()).await?;
                info!(leader = %leader, cursor = %cursor, "New leader; skipping earlier history");
                Ok(cursor)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::ScriptedVenue;
    use crate::db::{memory_db, BeginOutcome};
    use crate::models::{sample_trade, MirrorStatus, TradeSide};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    const LEADER: &str = "0x1111111111111111111111111111111111111111";

    fn trade_at(id: &str, secs: i64) -> LeaderTrade {
        let mut trade = sample_trade(id, "M", TradeSide::Buy, dec!(100), dec!(0.5));
        trade.timestamp = Utc.timestamp_opt(secs, 0).unwrap();
        trade
    }

    fn watcher(venue: Arc<ScriptedVenue>, db: Database) -> EventWatcher {
        EventWatcher::new(venue, db, Duration::from_millis(5))
            .with_backoff(Duration::from_millis(1), Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_first_run_skips_history() {
        let db = memory_db().await;
        let venue = Arc::new(ScriptedVenue::new());
        let mut old = sample_trade("old", "M", TradeSide::Buy, dec!(100), dec!(0.5));
        old.timestamp = Utc::now() - chrono::Duration::minutes(10);
        venue.add_leader_trade(old);

        let fresh = watcher(venue, db.clone()).poll_once(LEADER).await.unwrap();

        assert!(fresh.is_empty());
        assert!(db.get_cursor(LEADER).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cursor_waits_for_terminal_records() {
        let db = memory_db().await;
        let venue = Arc::new(ScriptedVenue::new());
        db.init_cursor(LEADER, Utc.timestamp_opt(1_000, 0).unwrap()).await.unwrap();
        venue.add_leader_trade(trade_at("a", 1_001));
        venue.add_leader_trade(trade_at("b", 1_002));
        let watcher = watcher(venue, db.clone());

        let first = watcher.poll_once(LEADER).await.unwrap();
        assert_eq!(first.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(), ["a", "b"]);
        assert_eq!(db.get_cursor(LEADER).await.unwrap().unwrap().timestamp(), 1_001);

        // "a" finishes, "b" is still in flight
        db.try_begin(&first[0]).await.unwrap();
        db.commit("a", MirrorStatus::Skipped, Some("tooOld")).await.unwrap();
        db.try_begin(&first[1]).await.unwrap();

        let second = watcher.poll_once(LEADER).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(db.get_cursor(LEADER).await.unwrap().unwrap().timestamp(), 1_002);

        db.commit("b", MirrorStatus::Filled, None).await.unwrap();
        watcher.poll_once(LEADER).await.unwrap();
        assert_eq!(db.get_cursor(LEADER).await.unwrap().unwrap().timestamp(), 1_002);
    }

    #[tokio::test]
    async fn test_unrecorded_trades_are_redelivered() {
        let db = memory_db().await;
        let venue = Arc::new(ScriptedVenue::new());
        db.init_cursor(LEADER, Utc.timestamp_opt(1_000, 0).unwrap()).await.unwrap();
        venue.add_leader_trade(trade_at("a", 1_001));
        let watcher = watcher(venue, db);

        // Emitted but never recorded (e.g. lost in a crash): comes back
        assert_eq!(watcher.poll_once(LEADER).await.unwrap().len(), 1);
        assert_eq!(watcher.poll_once(LEADER).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_first_trade_in_market_seeds_leader_exposure() {
        let db = memory_db().await;
        let venue = Arc::new(ScriptedVenue::new());
        db.init_cursor(LEADER, Utc.timestamp_opt(1_000, 0).unwrap()).await.unwrap();
        // Leader held 150 before we started watching, then bought 100
        venue.set_leader_position(LEADER, "M", dec!(250));
        venue.add_leader_trade(trade_at("a", 1_001));
        let watcher = watcher(venue.clone(), db.clone());

        let fresh = watcher.poll_once(LEADER).await.unwrap();
        assert_eq!(db.leader_position(LEADER, "M").await.unwrap(), dec!(150));

        let BeginOutcome::Accepted(record) = db.try_begin(&fresh[0]).await.unwrap() else {
            panic!("trade should be accepted");
        };
        assert_eq!(record.leader_position_before, dec!(150));

        // A known market is never re-seeded
        venue.add_leader_trade(trade_at("b", 1_002));
        watcher.poll_once(LEADER).await.unwrap();
        assert_eq!(venue.position_calls(), 1);
        assert_eq!(db.leader_position(LEADER, "M").await.unwrap(), dec!(250));
    }

    #[tokio::test]
    async fn test_unreadable_leader_position_does_not_block_trades() {
        let db = memory_db().await;
        let venue = Arc::new(ScriptedVenue::new());
        db.init_cursor(LEADER, Utc.timestamp_opt(1_000, 0).unwrap()).await.unwrap();
        venue.set_leader_position(LEADER, "M", dec!(250));
        venue.fail_positions(1);
        venue.add_leader_trade(trade_at("a", 1_001));

        let fresh = watcher(venue, db.clone()).poll_once(LEADER).await.unwrap();

        assert_eq!(fresh.len(), 1);
        assert!(!db.has_leader_position(LEADER, "M").await.unwrap());
    }

    #[tokio::test]
    async fn test_stream_retries_failed_fetches() {
        let db = memory_db().await;
        let venue = Arc::new(ScriptedVenue::new());
        db.init_cursor(LEADER, Utc.timestamp_opt(1_000, 0).unwrap()).await.unwrap();
        venue.add_leader_trade(trade_at("a", 1_001));
        venue.fail_fetches(2);

        let mut trades = watcher(venue.clone(), db).watch_account(LEADER.to_string());
        let trade = trades.next().await.unwrap().unwrap();

        assert_eq!(trade.id, "a");
        assert_eq!(venue.fetch_calls(), 3);
    }

    #[tokio::test]
    async fn test_watch_merges_leaders() {
        let db = memory_db().await;
        let venue = Arc::new(ScriptedVenue::new());
        let other = "0x2222222222222222222222222222222222222222";
        for leader in [LEADER, other] {
            db.init_cursor(leader, Utc.timestamp_opt(1_000, 0).unwrap()).await.unwrap();
        }
        venue.add_leader_trade(trade_at("a", 1_001));
        let mut b = trade_at("b", 1_001);
        b.leader = other.to_string();
        venue.add_leader_trade(b);

        let mut trades = watcher(venue, db).watch(&[LEADER.to_string(), other.to_string()]);
        let mut seen = vec![
            trades.next().await.unwrap().unwrap().id,
            trades.next().await.unwrap().unwrap().id,
        ];
        seen.sort();
        assert_eq!(seen, ["a", "b"]);
    }
}
