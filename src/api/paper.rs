//! Paper venue for dry runs: leader trades come from the live Data API,
//! follower orders are filled in memory at their limit price.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::info;

use crate::error::{MirrorError, MirrorResult};
use crate::models::LeaderTrade;

use super::data_client::DataClient;
use super::venue::{MarketClient, OrderRequest, VenueOrder, VenueOrderState};

pub struct PaperVenue {
    data: DataClient,
    orders: Mutex<HashMap<String, VenueOrder>>,
}

impl PaperVenue {
    pub fn new(data: DataClient) -> Self {
        Self {
            data,
            orders: Mutex::new(HashMap::new()),
        }
    }

    fn order_id(request: &OrderRequest) -> String {
        format!("paper-{}", request.idempotency_key)
    }

    fn orders(&self) -> MirrorResult<std::sync::MutexGuard<'_, HashMap<String, VenueOrder>>> {
        self.orders
            .lock()
            .map_err(|_| MirrorError::TransientNetwork("paper order book poisoned".into()))
    }
}

#[async_trait]
impl MarketClient for PaperVenue {
    async fn fetch_leader_trades(
        &self,
        account: &str,
        since: Option<DateTime<Utc>>,
    ) -> MirrorResult<Vec<LeaderTrade>> {
        self.data.fetch_leader_trades(account, since).await
    }

    async fn submit_order(&self, request: &OrderRequest) -> MirrorResult<String> {
        if request.size <= Decimal::ZERO {
            return Err(MirrorError::VenueRejection("size must be positive".into()));
        }

        let order_id = Self::order_id(request);
        let mut orders = self.orders()?;
        orders.entry(order_id.clone()).or_insert_with(|| {
            info!(
                order_id = %order_id,
                market = %request.market_id,
                side = %request.side,
                size = %request.size,
                price = %request.price,
                "[DRY RUN] Paper fill"
            );
            VenueOrder {
                order_id: order_id.clone(),
                state: VenueOrderState::Filled,
                size_matched: request.size,
                avg_price: request.price,
            }
        });

        Ok(order_id)
    }

    async fn get_order_status(&self, order_id: &str) -> MirrorResult<Option<VenueOrder>> {
        Ok(self.orders()?.get(order_id).cloned())
    }

    async fn find_order(&self, request: &OrderRequest) -> MirrorResult<Option<String>> {
        let order_id = Self::order_id(request);
        Ok(self.orders()?.contains_key(&order_id).then_some(order_id))
    }

    async fn leader_position(&self, account: &str, market_id: &str) -> MirrorResult<Decimal> {
        self.data.get_position_size(account, market_id).await
    }

    async fn collateral_balance(&self) -> MirrorResult<Option<Decimal>> {
        Ok(None)
    }

    fn name(&self) -> &'static str {
        "paper"
    }
}
