//! Scripted in-memory venue for driving failure paths in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::error::{MirrorError, MirrorResult};
use crate::models::LeaderTrade;

use super::venue::{MarketClient, OrderRequest, VenueOrder, VenueOrderState};

/// What happens to the next submission.
#[derive(Debug, Clone)]
pub enum SubmitScript {
    Accept,
    /// Transport error before the venue saw the order
    DropBeforeVenue,
    /// Venue created the order but the acknowledgement was lost
    LostAck,
    Reject(String),
}

/// How accepted orders trade.
#[derive(Debug, Clone, Copy)]
pub enum FillPlan {
    Full,
    Open,
    /// Matches this many shares, then the venue cancels the rest
    PartialThenCancelled(Decimal),
    /// Matches this many shares and keeps resting
    PartialOpen(Decimal),
}

#[derive(Default)]
struct State {
    trades: HashMap<String, Vec<LeaderTrade>>,
    fetch_failures: u32,
    fetch_calls: u32,
    submits: VecDeque<SubmitScript>,
    submit_calls: u32,
    status_failures: u32,
    find_failures: u32,
    fill_plan: Option<FillPlan>,
    orders: HashMap<String, VenueOrder>,
    leader_positions: HashMap<(String, String), Decimal>,
    position_failures: u32,
    position_calls: u32,
    balance: Option<Decimal>,
}

pub struct ScriptedVenue {
    state: Mutex<State>,
}

impl ScriptedVenue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().expect("scripted venue lock");
        f(&mut state)
    }

    pub fn add_leader_trade(&self, trade: LeaderTrade) {
        self.with(|s| s.trades.entry(trade.leader.clone()).or_default().push(trade));
    }

    pub fn fail_fetches(&self, n: u32) {
        self.with(|s| s.fetch_failures = n);
    }

    pub fn script_submits(&self, script: impl IntoIterator<Item = SubmitScript>) {
        self.with(|s| s.submits.extend(script));
    }

    pub fn set_fill_plan(&self, plan: FillPlan) {
        self.with(|s| s.fill_plan = Some(plan));
    }

    pub fn fail_status(&self, n: u32) {
        self.with(|s| s.status_failures = n);
    }

    pub fn fail_find(&self, n: u32) {
        self.with(|s| s.find_failures = n);
    }

    /// Size the venue reports for a leader in a market.
    pub fn set_leader_position(&self, account: &str, market_id: &str, size: Decimal) {
        self.with(|s| {
            s.leader_positions
                .insert((account.to_string(), market_id.to_string()), size)
        });
    }

    pub fn fail_positions(&self, n: u32) {
        self.with(|s| s.position_failures = n);
    }

    pub fn position_calls(&self) -> u32 {
        self.with(|s| s.position_calls)
    }

    pub fn set_balance(&self, balance: Decimal) {
        self.with(|s| s.balance = Some(balance));
    }

    /// Force an order into a state, as the venue would on expiry or a late fill.
    pub fn set_order(&self, order_id: &str, state: VenueOrderState, matched: Decimal) {
        self.with(|s| {
            if let Some(order) = s.orders.get_mut(order_id) {
                order.state = state;
                order.size_matched = matched;
            }
        });
    }

    /// Orders that actually exist at the venue.
    pub fn order_count(&self) -> usize {
        self.with(|s| s.orders.len())
    }

    pub fn submit_calls(&self) -> u32 {
        self.with(|s| s.submit_calls)
    }

    pub fn fetch_calls(&self) -> u32 {
        self.with(|s| s.fetch_calls)
    }

    pub fn order_id(request: &OrderRequest) -> String {
        format!("order-{}", request.idempotency_key)
    }

    fn create(state: &mut State, request: &OrderRequest) -> String {
        let order_id = Self::order_id(request);
        let plan = state.fill_plan.unwrap_or(FillPlan::Full);
        let (venue_state, matched) = match plan {
            FillPlan::Full => (VenueOrderState::Filled, request.size),
            FillPlan::Open => (VenueOrderState::Open, Decimal::ZERO),
            FillPlan::PartialThenCancelled(n) => (VenueOrderState::Cancelled, n.min(request.size)),
            FillPlan::PartialOpen(n) => (VenueOrderState::Open, n.min(request.size)),
        };
        state.orders.entry(order_id.clone()).or_insert(VenueOrder {
            order_id: order_id.clone(),
            state: venue_state,
            size_matched: matched,
            avg_price: request.price,
        });
        order_id
    }
}

#[async_trait]
impl MarketClient for ScriptedVenue {
    async fn fetch_leader_trades(
        &self,
        account: &str,
        since: Option<DateTime<Utc>>,
    ) -> MirrorResult<Vec<LeaderTrade>> {
        self.with(|s| {
            s.fetch_calls += 1;
            if s.fetch_failures > 0 {
                s.fetch_failures -= 1;
                return Err(MirrorError::TransientNetwork("scripted fetch failure".into()));
            }
            let since = since.map(|ts| ts.timestamp());
            let mut trades: Vec<LeaderTrade> = s
                .trades
                .get(account)
                .map(|all| {
                    all.iter()
                        .filter(|t| since.map_or(true, |since| t.timestamp.timestamp() >= since))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            trades.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
            Ok(trades)
        })
    }

    async fn submit_order(&self, request: &OrderRequest) -> MirrorResult<String> {
        self.with(|s| {
            s.submit_calls += 1;
            match s.submits.pop_front().unwrap_or(SubmitScript::Accept) {
                SubmitScript::Accept => Ok(Self::create(s, request)),
                SubmitScript::DropBeforeVenue => {
                    Err(MirrorError::TransientNetwork("connection reset".into()))
                }
                SubmitScript::LostAck => {
                    Self::create(s, request);
                    Err(MirrorError::TransientNetwork("timed out reading response".into()))
                }
                SubmitScript::Reject(reason) => Err(MirrorError::VenueRejection(reason)),
            }
        })
    }

    async fn get_order_status(&self, order_id: &str) -> MirrorResult<Option<VenueOrder>> {
        self.with(|s| {
            if s.status_failures > 0 {
                s.status_failures -= 1;
                return Err(MirrorError::TransientNetwork("scripted status failure".into()));
            }
            Ok(s.orders.get(order_id).cloned())
        })
    }

    async fn find_order(&self, request: &OrderRequest) -> MirrorResult<Option<String>> {
        self.with(|s| {
            if s.find_failures > 0 {
                s.find_failures -= 1;
                return Err(MirrorError::TransientNetwork("scripted lookup failure".into()));
            }
            let order_id = Self::order_id(request);
            Ok(s.orders.contains_key(&order_id).then_some(order_id))
        })
    }

    async fn leader_position(&self, account: &str, market_id: &str) -> MirrorResult<Decimal> {
        self.with(|s| {
            s.position_calls += 1;
            if s.position_failures > 0 {
                s.position_failures -= 1;
                return Err(MirrorError::TransientNetwork("scripted positions failure".into()));
            }
            Ok(s.leader_positions
                .get(&(account.to_string(), market_id.to_string()))
                .copied()
                .unwrap_or_default())
        })
    }

    async fn collateral_balance(&self) -> MirrorResult<Option<Decimal>> {
        Ok(self.with(|s| s.balance))
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
