//! API response types for Polymarket Data API.

use rust_decimal::Decimal;
use serde::Deserialize;

/// Activity response from /activity endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityResponse {
    #[serde(rename = "type")]
    pub activity_type: String,
    pub proxy_wallet: String,
    #[serde(default)]
    pub condition_id: String,
    /// Outcome token ID
    #[serde(default)]
    pub asset: String,
    #[serde(default)]
    pub size: Decimal,
    #[serde(default)]
    pub usdc_size: Decimal,
    #[serde(default)]
    pub price: Decimal,
    pub timestamp: i64,
    #[serde(default)]
    pub transaction_hash: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub outcome: String,
    #[serde(default)]
    pub title: String,
}

impl ActivityResponse {
    /// Venue trade id. A transaction can fill several orders for one
    /// wallet, so the hash alone is not unique; fills that match on every
    /// field are told apart by the caller with an ordinal.
    pub fn trade_id(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.transaction_hash,
            self.asset,
            self.side.to_uppercase(),
            self.size.normalize(),
            self.price.normalize()
        )
    }
}

/// Position response from /positions endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionResponse {
    #[serde(default)]
    pub proxy_wallet: String,
    /// Outcome token ID
    pub asset: String,
    #[serde(default)]
    pub condition_id: String,
    #[serde(default)]
    pub outcome: String,
    pub size: Decimal,
    #[serde(default)]
    pub avg_price: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_parses_data_api_shape() {
        let json = r#"{
            "proxyWallet": "0x1111111111111111111111111111111111111111",
            "timestamp": 1700000000,
            "conditionId": "0xcond",
            "type": "TRADE",
            "size": 100,
            "usdcSize": 60,
            "transactionHash": "0xhash",
            "price": 0.6,
            "asset": "123",
            "side": "buy",
            "outcome": "Yes",
            "title": "Will it rain?"
        }"#;

        let activity: ActivityResponse = serde_json::from_str(json).unwrap();
        assert_eq!(activity.activity_type, "TRADE");
        assert_eq!(activity.trade_id(), "0xhash:123:BUY:100:0.6");
    }

    #[test]
    fn test_fills_in_one_transaction_get_distinct_ids() {
        let fill = |size: &str, price: &str| -> ActivityResponse {
            serde_json::from_str(&format!(
                r#"{{"proxyWallet": "0x1", "timestamp": 1700000000, "type": "TRADE",
                    "size": {size}, "price": {price}, "asset": "123",
                    "transactionHash": "0xhash", "side": "BUY"}}"#
            ))
            .unwrap()
        };

        assert_ne!(fill("100", "0.6").trade_id(), fill("40", "0.6").trade_id());
        assert_ne!(fill("100", "0.6").trade_id(), fill("100", "0.61").trade_id());
        // Same amount written two ways is the same fill
        assert_eq!(fill("100", "0.6").trade_id(), fill("100.0", "0.60").trade_id());
    }

    #[test]
    fn test_position_parses_data_api_shape() {
        let json = r#"[{
            "proxyWallet": "0x1111111111111111111111111111111111111111",
            "asset": "123",
            "conditionId": "0xcond",
            "size": 250.5,
            "avgPrice": 0.41,
            "outcome": "Yes",
            "title": "Will it rain?"
        }]"#;

        let positions: Vec<PositionResponse> = serde_json::from_str(json).unwrap();
        assert_eq!(positions[0].asset, "123");
        assert_eq!(positions[0].size, rust_decimal_macros::dec!(250.5));
    }
}
