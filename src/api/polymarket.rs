//! Live Polymarket venue: Data API for leader reads, CLOB for follower writes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::MirrorResult;
use crate::models::LeaderTrade;

use super::clob_client::ClobClient;
use super::data_client::DataClient;
use super::venue::{MarketClient, OrderRequest, VenueOrder};

pub struct PolymarketVenue {
    data: DataClient,
    clob: ClobClient,
}

impl PolymarketVenue {
    pub fn new(data: DataClient, clob: ClobClient) -> Self {
        Self { data, clob }
    }
}

#[async_trait]
impl MarketClient for PolymarketVenue {
    async fn fetch_leader_trades(
        &self,
        account: &str,
        since: Option<DateTime<Utc>>,
    ) -> MirrorResult<Vec<LeaderTrade>> {
        self.data.fetch_leader_trades(account, since).await
    }

    async fn submit_order(&self, request: &OrderRequest) -> MirrorResult<String> {
        self.clob.place_order(request).await
    }

    async fn get_order_status(&self, order_id: &str) -> MirrorResult<Option<VenueOrder>> {
        self.clob
            .get_order(order_id)
            .await?
            .map(|status| status.to_venue_order())
            .transpose()
    }

    async fn find_order(&self, request: &OrderRequest) -> MirrorResult<Option<String>> {
        let order_id = self.clob.order_id_for(request)?;
        Ok(self.clob.get_order(&order_id).await?.map(|status| status.id))
    }

    async fn leader_position(&self, account: &str, market_id: &str) -> MirrorResult<Decimal> {
        self.data.get_position_size(account, market_id).await
    }

    async fn collateral_balance(&self) -> MirrorResult<Option<Decimal>> {
        self.clob.get_collateral_balance().await.map(Some)
    }

    fn name(&self) -> &'static str {
        "polymarket"
    }
}
