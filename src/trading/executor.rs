//! Execution Engine: places follower orders and watches them to a close.
//!
//! Submission is never retried blindly. After a transport failure the
//! engine first asks the venue whether the previous attempt landed (orders
//! are keyed by the leader trade id) and only resubmits on a confirmed "no".
//! If it cannot find out, the outcome is `TimedOut` and the record is left
//! for reconciliation.

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::{MarketClient, OrderRequest, VenueOrder};
use crate::db::{Database, Reservation};
use crate::error::{MirrorError, MirrorResult};
use crate::models::{ExecutionOutcome, MirrorRecord, OrderIntent, TradeSide};

use super::retry::FullJitter;
use super::{ExecutionConfig, SizingConfig};

enum Placement {
    Placed(String),
    Rejected(String),
    Unconfirmed,
}

pub struct ExecutionEngine {
    venue: Arc<dyn MarketClient>,
    db: Database,
    config: ExecutionConfig,
    limits: SizingConfig,
}

impl ExecutionEngine {
    pub fn new(
        venue: Arc<dyn MarketClient>,
        db: Database,
        config: ExecutionConfig,
        limits: SizingConfig,
    ) -> Self {
        Self { venue, db, config, limits }
    }

    fn request_for(&self, intent: &OrderIntent) -> OrderRequest {
        let ttl = chrono::Duration::from_std(self.config.order_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(120));
        OrderRequest::from_intent(intent, ttl)
    }

    /// Reserve, place the order, and follow it until it closes or the fill
    /// timeout runs out.
    ///
    /// Returns `CapitalConstraint` if the reservation no longer fits.
    pub async fn submit(&self, intent: &OrderIntent) -> MirrorResult<ExecutionOutcome> {
        let id = intent.leader_trade_id.as_str();

        self.reserve(intent).await?;

        let request = self.request_for(intent);
        match self.place(id, &request).await? {
            Placement::Placed(order_id) => self.monitor(intent, &order_id).await,
            Placement::Rejected(reason) => {
                self.db.release_reservation(id).await?;
                Ok(ExecutionOutcome::Rejected(reason))
            }
            Placement::Unconfirmed => Ok(ExecutionOutcome::TimedOut),
        }
    }

    /// Capital for a buy, held shares for a sell. Fails with
    /// `CapitalConstraint` when the reservation no longer fits.
    async fn reserve(&self, intent: &OrderIntent) -> MirrorResult<()> {
        let id = intent.leader_trade_id.as_str();
        let reservation = match intent.side {
            TradeSide::Buy => {
                self.db
                    .reserve(
                        id,
                        &intent.market_id,
                        intent.cost(),
                        self.limits.ceiling_for(&intent.market_id),
                        self.limits.total_capital,
                    )
                    .await?
            }
            TradeSide::Sell => self.db.reserve_shares(id, &intent.market_id, intent.size).await?,
        };

        match reservation {
            Reservation::Reserved | Reservation::AlreadyReserved => Ok(()),
            Reservation::ExceedsMarketCeiling => Err(MirrorError::CapitalConstraint(format!(
                "${} would exceed the ceiling for {}",
                intent.cost(),
                intent.market_id
            ))),
            Reservation::ExceedsCapital => Err(MirrorError::CapitalConstraint(format!(
                "${} would exceed total capital",
                intent.cost()
            ))),
            Reservation::ExceedsHoldings => Err(MirrorError::CapitalConstraint(format!(
                "selling {} shares of {} would exceed unreserved holdings",
                intent.size, intent.market_id
            ))),
        }
    }

    async fn place(&self, id: &str, request: &OrderRequest) -> MirrorResult<Placement> {
        let mut backoff = FullJitter::new(self.config.backoff_base, self.config.backoff_cap);

        loop {
            let attempt = self.db.record_attempt(id).await?;

            let error = match self.venue.submit_order(request).await {
                Ok(order_id) => {
                    self.db.attach_order_id(id, &order_id).await?;
                    info!(
                        leader_trade_id = %id,
                        order_id = %order_id,
                        side = %request.side,
                        size = %request.size,
                        price = %request.price,
                        "Order submitted"
                    );
                    return Ok(Placement::Placed(order_id));
                }
                Err(MirrorError::VenueRejection(reason)) => {
                    warn!(leader_trade_id = %id, reason = %reason, "Venue rejected order");
                    return Ok(Placement::Rejected(reason));
                }
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            };

            warn!(leader_trade_id = %id, attempt, error = %error, "Submission failed; checking venue");
            self.db.note_error(id, &error.to_string()).await?;

            match self.venue.find_order(request).await {
                Ok(Some(order_id)) => {
                    info!(leader_trade_id = %id, order_id = %order_id, "Earlier attempt reached the venue");
                    self.db.attach_order_id(id, &order_id).await?;
                    return Ok(Placement::Placed(order_id));
                }
                Ok(None) if attempt >= self.config.retry_limit => {
                    return Ok(Placement::Rejected(format!(
                        "gave up after {attempt} attempts: {error}"
                    )));
                }
                Ok(None) => backoff.wait().await,
                Err(lookup) => {
                    warn!(leader_trade_id = %id, error = %lookup, "Cannot confirm submission; leaving for reconciliation");
                    self.db
                        .note_error(id, &format!("submission unconfirmed: {lookup}"))
                        .await?;
                    return Ok(Placement::Unconfirmed);
                }
            }
        }
    }

    /// Poll the order until it closes or the fill timeout passes.
    async fn monitor(&self, intent: &OrderIntent, order_id: &str) -> MirrorResult<ExecutionOutcome> {
        let id = intent.leader_trade_id.as_str();
        let deadline = Instant::now() + self.config.fill_timeout;

        while Instant::now() < deadline {
            match self.venue.get_order_status(order_id).await {
                Ok(Some(order)) if order.state.is_closed() => return self.close(intent, &order).await,
                Ok(Some(order)) => self.book_fills(id, &order).await?,
                Ok(None) => debug!(order_id = %order_id, "Order not visible yet"),
                Err(e) => warn!(order_id = %order_id, error = %e, "Order status query failed"),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(self.config.status_poll_interval.min(remaining)).await;
        }

        // One last look before declaring the outcome ambiguous
        match self.venue.get_order_status(order_id).await {
            Ok(Some(order)) if order.state.is_closed() => self.close(intent, &order).await,
            Ok(Some(order)) => {
                self.book_fills(id, &order).await?;
                warn!(leader_trade_id = %id, order_id = %order_id, matched = %order.size_matched, "Order still open at fill timeout");
                Ok(ExecutionOutcome::TimedOut)
            }
            Ok(None) | Err(_) => {
                warn!(leader_trade_id = %id, order_id = %order_id, "No confirmation at fill timeout");
                Ok(ExecutionOutcome::TimedOut)
            }
        }
    }

    async fn book_fills(&self, id: &str, order: &VenueOrder) -> MirrorResult<()> {
        let delta = self.db.apply_fill(id, order.size_matched, order.avg_price).await?;
        if delta > Decimal::ZERO {
            info!(leader_trade_id = %id, filled = %delta, total = %order.size_matched, "Fill booked");
        }
        Ok(())
    }

    /// Book final fills of a closed order and free what it did not use.
    async fn close(&self, intent: &OrderIntent, order: &VenueOrder) -> MirrorResult<ExecutionOutcome> {
        let id = intent.leader_trade_id.as_str();
        self.book_fills(id, order).await?;
        self.db.release_reservation(id).await?;

        let matched = order.size_matched;
        Ok(if matched >= intent.size {
            ExecutionOutcome::Filled { size: matched, avg_price: order.avg_price }
        } else if matched > Decimal::ZERO {
            ExecutionOutcome::PartiallyFilled { size: matched, avg_price: order.avg_price }
        } else {
            ExecutionOutcome::Rejected(format!("order {:?} without any fill", order.state))
        })
    }

    /// Resolve a record left `submitted` by an earlier run or a timeout.
    ///
    /// Only resubmits after the venue confirms no order exists for the
    /// intent and the intent has not expired.
    pub async fn reconcile(&self, record: &MirrorRecord) -> MirrorResult<ExecutionOutcome> {
        let id = record.id();
        let Some(intent) = record.intent.as_ref() else {
            self.db.release_reservation(id).await?;
            return Ok(ExecutionOutcome::Rejected("submitted without an order intent".into()));
        };
        let request = self.request_for(intent);
        let expired = Utc::now() >= request.expires_at;

        let order_id = match &record.follower_order_id {
            Some(order_id) => Some(order_id.clone()),
            None => match self.venue.find_order(&request).await {
                Ok(found) => found,
                Err(e) => {
                    warn!(leader_trade_id = %id, error = %e, "Order lookup failed during reconciliation");
                    return Ok(ExecutionOutcome::TimedOut);
                }
            },
        };

        let Some(order_id) = order_id else {
            if expired {
                self.db.release_reservation(id).await?;
                return Ok(ExecutionOutcome::Rejected(
                    "order expired before reaching the venue".into(),
                ));
            }
            info!(leader_trade_id = %id, "No order at the venue; resubmitting");
            return self.submit(intent).await;
        };

        if record.follower_order_id.is_none() {
            self.db.attach_order_id(id, &order_id).await?;
        }

        match self.venue.get_order_status(&order_id).await {
            Ok(Some(order)) if order.state.is_closed() => self.close(intent, &order).await,
            Ok(Some(order)) => {
                self.book_fills(id, &order).await?;
                Ok(ExecutionOutcome::TimedOut)
            }
            Ok(None) if expired => {
                self.db.release_reservation(id).await?;
                Ok(ExecutionOutcome::Rejected(format!(
                    "venue has no record of order {order_id}"
                )))
            }
            Ok(None) => Ok(ExecutionOutcome::TimedOut),
            Err(e) => {
                warn!(leader_trade_id = %id, error = %e, "Status query failed during reconciliation");
                Ok(ExecutionOutcome::TimedOut)
            }
        }
    }
}
