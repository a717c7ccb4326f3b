//! Polymarket CLOB (Central Limit Order Book) client for follower orders.
//!
//! The CLOB is Polymarket's off-chain order matching engine that settles on Polygon.
//! This client handles:
//! - API authentication (HMAC-SHA256 L2 headers)
//! - Order signing using EIP-712 typed data
//! - Order submission, status queries and lookup of prior submissions
//!
//! Orders are deterministic: the salt comes from the idempotency key and the
//! expiration from the intent, so the same request always hashes to the same
//! order id. The venue identifies orders by that hash, which lets us ask
//! "did an earlier attempt land?" without any local bookkeeping.

use alloy_primitives::{Address, U256};
use alloy_signer::Signer;
use alloy_signer_local::PrivateKeySigner;
use anyhow::{Context, Result};
use base64::{
    engine::general_purpose::{STANDARD as BASE64, URL_SAFE as BASE64_URL_SAFE},
    Engine,
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::error::{MirrorError, MirrorResult};
use crate::models::TradeSide;

use super::venue::{OrderRequest, VenueOrder, VenueOrderState};

type HmacSha256 = Hmac<Sha256>;

/// CLOB API base URL
pub const CLOB_URL: &str = "https://clob.polymarket.com";

/// Polymarket CTF Exchange contract on Polygon
pub const CTF_EXCHANGE: &str = "0x4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E";

const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// CLOB API client for executing follower orders on Polymarket.
pub struct ClobClient {
    http: Client,
    base_url: String,
    signer: PrivateKeySigner,
    api_key: String,
    api_secret: String,
    api_passphrase: String,
    chain_id: u64,
}

/// Order type. Follower orders are always good-til-date so that every
/// order the venue accepts eventually closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Gtd,
}

/// Signature type for CLOB orders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureType {
    /// EOA signature
    Eoa = 0,
}

/// Signed order ready for submission
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedOrder {
    pub salt: u64,
    pub maker: String,
    pub signer: String,
    pub taker: String,
    pub token_id: String,
    pub maker_amount: String,
    pub taker_amount: String,
    pub side: String,
    pub expiration: String,
    pub nonce: String,
    pub fee_rate_bps: String,
    pub signature_type: u8,
    pub signature: String,
}

/// Order submission request body
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPayload {
    pub order: SignedOrder,
    pub owner: String,
    pub order_type: OrderType,
}

/// Response from order placement
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    #[serde(rename = "orderID", alias = "orderId", default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error_msg: String,
}

/// Order status response
#[derive(Debug, Clone, Deserialize)]
pub struct OrderStatus {
    pub id: String,
    pub status: String,
    pub original_size: String,
    pub size_matched: String,
    pub price: String,
}

/// Collateral balance response; amounts are in USDC base units.
#[derive(Debug, Clone, Deserialize)]
struct BalanceAllowance {
    balance: String,
}

/// USDC has six decimals on Polygon.
const USDC_DECIMALS: u32 = 6;

impl OrderStatus {
    /// Normalize the venue's status vocabulary.
    pub fn to_venue_order(&self) -> MirrorResult<VenueOrder> {
        let parse = |field: &str, value: &str| {
            Decimal::from_str(value).map_err(|e| {
                MirrorError::AmbiguousOutcome(format!("order {} has bad {field} {value:?}: {e}", self.id))
            })
        };
        let original = parse("original_size", &self.original_size)?;
        let matched = parse("size_matched", &self.size_matched)?;
        let price = parse("price", &self.price)?;

        let state = match self.status.to_uppercase().as_str() {
            "MATCHED" => VenueOrderState::Filled,
            "CANCELED" | "CANCELLED" => VenueOrderState::Cancelled,
            "EXPIRED" => VenueOrderState::Expired,
            // LIVE, DELAYED, UNMATCHED: still working
            _ if original > Decimal::ZERO && matched >= original => VenueOrderState::Filled,
            _ => VenueOrderState::Open,
        };

        Ok(VenueOrder {
            order_id: self.id.clone(),
            state,
            size_matched: matched,
            avg_price: price,
        })
    }
}

fn parse_base_units(raw: &str) -> MirrorResult<Decimal> {
    let mut units = Decimal::from_str(raw.trim())
        .map_err(|e| MirrorError::TransientNetwork(format!("unreadable balance {raw:?}: {e}")))?;
    units.set_scale(units.scale() + USDC_DECIMALS).map_err(|e| {
        MirrorError::TransientNetwork(format!("balance {raw:?} out of range: {e}"))
    })?;
    Ok(units.normalize())
}

fn side_index(side: TradeSide) -> u8 {
    match side {
        TradeSide::Buy => 0,
        TradeSide::Sell => 1,
    }
}

/// Classify a non-success HTTP response from the CLOB.
fn classify_status(status: StatusCode, body: String) -> MirrorError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        MirrorError::TransientNetwork(format!("{status} - {body}"))
    } else {
        MirrorError::VenueRejection(format!("{status} - {body}"))
    }
}

impl ClobClient {
    /// Create a new CLOB client.
    ///
    /// # Arguments
    /// * `private_key` - Ethereum private key (hex string, with or without 0x prefix)
    /// * `api_key` - Polymarket API key
    /// * `api_secret` - Polymarket API secret (base64)
    /// * `api_passphrase` - Polymarket API passphrase
    /// * `chain_id` - Polygon chain ID (137 for mainnet, 80002 for Amoy testnet)
    pub fn new(
        private_key: &str,
        api_key: &str,
        api_secret: &str,
        api_passphrase: &str,
        chain_id: u64,
    ) -> Result<Self> {
        let pk = private_key.strip_prefix("0x").unwrap_or(private_key);
        let signer = PrivateKeySigner::from_str(pk).context("Invalid private key")?;

        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: CLOB_URL.to_string(),
            signer,
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            api_passphrase: api_passphrase.to_string(),
            chain_id,
        })
    }

    /// Get the wallet address.
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Submit a GTD limit order for the request; returns the venue order id.
    pub async fn place_order(&self, request: &OrderRequest) -> MirrorResult<String> {
        let (order, order_id) = self.build_signed_order(request).await?;

        let payload = OrderPayload {
            order,
            owner: self.api_key.clone(),
            order_type: OrderType::Gtd,
        };
        let body = serde_json::to_string(&payload)
            .map_err(|e| MirrorError::VenueRejection(format!("cannot encode order: {e}")))?;

        let path = "/order";
        debug!(order_id = %order_id, key = %request.idempotency_key, "Posting order");

        let resp = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .headers(self.build_l2_headers("POST", path, &body)?)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, text));
        }

        let parsed: OrderResponse = resp.json().await?;
        if !parsed.success {
            return Err(MirrorError::VenueRejection(parsed.error_msg));
        }

        Ok(parsed.order_id.filter(|id| !id.is_empty()).unwrap_or(order_id))
    }

    /// Get order status by ID; `None` if the venue has never seen it.
    pub async fn get_order(&self, order_id: &str) -> MirrorResult<Option<OrderStatus>> {
        let path = format!("/data/order/{order_id}");
        let resp = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .headers(self.build_l2_headers("GET", &path, "")?)
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            // A failed status lookup tells us nothing about the order itself
            return Err(MirrorError::TransientNetwork(format!("{status} - {text}")));
        }

        let text = resp.text().await?;
        if text.trim().is_empty() || text.trim() == "null" {
            return Ok(None);
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| MirrorError::TransientNetwork(format!("unreadable order status: {e}")))
    }

    /// Spendable USDC of the follower wallet.
    pub async fn get_collateral_balance(&self) -> MirrorResult<Decimal> {
        let path = "/balance-allowance";
        let resp = self
            .http
            .get(format!(
                "{}{}?asset_type=COLLATERAL&signature_type=0",
                self.base_url, path
            ))
            .headers(self.build_l2_headers("GET", path, "")?)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, text));
        }

        let parsed: BalanceAllowance = resp.json().await?;
        parse_base_units(&parsed.balance)
    }

    /// Order id (EIP-712 hash) the request would produce.
    pub fn order_id_for(&self, request: &OrderRequest) -> MirrorResult<String> {
        let fields = self.order_fields(request)?;
        let hash = self.final_hash(&fields)?;
        Ok(format!("0x{}", hex::encode(hash)))
    }

    /// Build a signed order and its id.
    async fn build_signed_order(&self, request: &OrderRequest) -> MirrorResult<(SignedOrder, String)> {
        let fields = self.order_fields(request)?;
        let hash = self.final_hash(&fields)?;

        let signature = self
            .signer
            .sign_hash(&alloy_primitives::B256::from(hash))
            .await
            .map_err(|e| MirrorError::VenueRejection(format!("failed to sign order: {e}")))?;

        let order = SignedOrder {
            salt: fields.salt,
            maker: fields.maker.clone(),
            signer: fields.maker,
            taker: ZERO_ADDRESS.to_string(),
            token_id: fields.token_id,
            maker_amount: fields.maker_amount,
            taker_amount: fields.taker_amount,
            side: request.side.as_str().to_string(),
            expiration: fields.expiration,
            nonce: "0".to_string(),
            fee_rate_bps: "0".to_string(),
            signature_type: SignatureType::Eoa as u8,
            signature: format!("0x{}", hex::encode(signature.as_bytes())),
        };

        Ok((order, format!("0x{}", hex::encode(hash))))
    }

    fn order_fields(&self, request: &OrderRequest) -> MirrorResult<OrderFields> {
        let shares = Self::to_wei(request.size);
        let usdc = Self::to_wei(request.size * request.price);

        // BUY: maker gives USDC, receives shares. SELL: gives shares, receives USDC.
        let (maker_amount, taker_amount) = match request.side {
            TradeSide::Buy => (usdc, shares),
            TradeSide::Sell => (shares, usdc),
        };

        Ok(OrderFields {
            salt: Self::salt_for(&request.idempotency_key),
            maker: self.address().to_checksum(None),
            token_id: request.market_id.clone(),
            maker_amount,
            taker_amount,
            expiration: request.expires_at.timestamp().max(0).to_string(),
            side: side_index(request.side),
        })
    }

    /// keccak256("\x19\x01" + domainSeparator + orderHash)
    fn final_hash(&self, fields: &OrderFields) -> MirrorResult<[u8; 32]> {
        let order_hash = Self::compute_order_hash(fields)?;
        let domain_hash = self.compute_domain_separator()?;

        let mut message = vec![0x19, 0x01];
        message.extend_from_slice(&domain_hash);
        message.extend_from_slice(&order_hash);

        Ok(alloy_primitives::keccak256(&message).0)
    }

    /// Compute the EIP-712 order struct hash.
    fn compute_order_hash(fields: &OrderFields) -> MirrorResult<[u8; 32]> {
        let type_hash = alloy_primitives::keccak256(
            b"Order(uint256 salt,address maker,address signer,address taker,uint256 tokenId,uint256 makerAmount,uint256 takerAmount,uint256 expiration,uint256 nonce,uint256 feeRateBps,uint8 side,uint8 signatureType)"
        );

        let mut encoded = Vec::with_capacity(13 * 32);
        encoded.extend_from_slice(type_hash.as_slice());
        encoded.extend_from_slice(&Self::encode_uint256(&fields.salt.to_string())?);
        encoded.extend_from_slice(&Self::encode_address(&fields.maker)?);
        encoded.extend_from_slice(&Self::encode_address(&fields.maker)?);
        encoded.extend_from_slice(&Self::encode_address(ZERO_ADDRESS)?);
        encoded.extend_from_slice(&Self::encode_uint256(&fields.token_id)?);
        encoded.extend_from_slice(&Self::encode_uint256(&fields.maker_amount)?);
        encoded.extend_from_slice(&Self::encode_uint256(&fields.taker_amount)?);
        encoded.extend_from_slice(&Self::encode_uint256(&fields.expiration)?);
        encoded.extend_from_slice(&Self::encode_uint256("0")?);
        encoded.extend_from_slice(&Self::encode_uint256("0")?);
        encoded.extend_from_slice(&Self::encode_uint8(fields.side));
        encoded.extend_from_slice(&Self::encode_uint8(SignatureType::Eoa as u8));

        Ok(alloy_primitives::keccak256(&encoded).0)
    }

    /// Compute the EIP-712 domain separator.
    fn compute_domain_separator(&self) -> MirrorResult<[u8; 32]> {
        let type_hash = alloy_primitives::keccak256(
            b"EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)",
        );
        let name_hash = alloy_primitives::keccak256(b"Polymarket CTF Exchange");
        let version_hash = alloy_primitives::keccak256(b"1");

        let mut encoded = Vec::with_capacity(5 * 32);
        encoded.extend_from_slice(type_hash.as_slice());
        encoded.extend_from_slice(name_hash.as_slice());
        encoded.extend_from_slice(version_hash.as_slice());
        encoded.extend_from_slice(&Self::encode_uint256(&self.chain_id.to_string())?);
        encoded.extend_from_slice(&Self::encode_address(CTF_EXCHANGE)?);

        Ok(alloy_primitives::keccak256(&encoded).0)
    }

    /// HMAC-SHA256 over `{timestamp}{method}{path}{body}` with the API secret.
    fn sign_l2(&self, timestamp: &str, method: &str, path: &str, body: &str) -> MirrorResult<String> {
        // Polymarket API secrets use URL-safe base64
        let secret = BASE64_URL_SAFE
            .decode(&self.api_secret)
            .or_else(|_| BASE64.decode(&self.api_secret))
            .map_err(|e| MirrorError::Configuration(format!("invalid API secret: {e}")))?;

        let mut mac = HmacSha256::new_from_slice(&secret)
            .map_err(|e| MirrorError::Configuration(format!("invalid API secret: {e}")))?;
        mac.update(format!("{timestamp}{method}{path}{body}").as_bytes());

        Ok(BASE64_URL_SAFE.encode(mac.finalize().into_bytes()))
    }

    /// Build L2 authentication headers.
    fn build_l2_headers(&self, method: &str, path: &str, body: &str) -> MirrorResult<HeaderMap> {
        let timestamp = Utc::now().timestamp().to_string();
        let signature = self.sign_l2(&timestamp, method, path, body)?;

        let header = |value: &str| {
            HeaderValue::from_str(value)
                .map_err(|e| MirrorError::Configuration(format!("invalid header value: {e}")))
        };

        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("poly_address"),
            header(&self.address().to_checksum(None))?,
        );
        headers.insert(HeaderName::from_static("poly_signature"), header(&signature)?);
        headers.insert(HeaderName::from_static("poly_timestamp"), header(&timestamp)?);
        headers.insert(HeaderName::from_static("poly_api_key"), header(&self.api_key)?);
        headers.insert(
            HeaderName::from_static("poly_passphrase"),
            header(&self.api_passphrase)?,
        );

        Ok(headers)
    }

    /// Salt derived from the idempotency key.
    ///
    /// Kept below 2^53 so JSON number parsers read it exactly.
    fn salt_for(key: &str) -> u64 {
        let digest = alloy_primitives::keccak256(key.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(bytes) & ((1u64 << 53) - 1)
    }

    /// Convert to base units (USDC and CTF shares both have 6 decimals).
    fn to_wei(amount: Decimal) -> String {
        (amount * Decimal::from(1_000_000u64)).trunc().to_string()
    }

    /// Encode address to 32-byte padded format.
    fn encode_address(addr: &str) -> MirrorResult<[u8; 32]> {
        let addr = Address::from_str(addr)
            .map_err(|e| MirrorError::Configuration(format!("bad address {addr}: {e}")))?;
        let mut buf = [0u8; 32];
        buf[12..].copy_from_slice(addr.as_slice());
        Ok(buf)
    }

    /// Encode uint256 from a decimal string.
    fn encode_uint256(value: &str) -> MirrorResult<[u8; 32]> {
        let n = U256::from_str_radix(value, 10)
            .map_err(|e| MirrorError::VenueRejection(format!("not a uint256: {value:?}: {e}")))?;
        Ok(n.to_be_bytes())
    }

    /// Encode uint8 to 32-byte padded format.
    fn encode_uint8(value: u8) -> [u8; 32] {
        let mut buf = [0u8; 32];
        buf[31] = value;
        buf
    }
}

struct OrderFields {
    salt: u64,
    maker: String,
    token_id: String,
    maker_amount: String,
    taker_amount: String,
    expiration: String,
    side: u8,
}

/// Helper to create a client from environment variables.
impl ClobClient {
    /// Create from environment variables:
    /// - POLYMARKET_PRIVATE_KEY
    /// - POLYMARKET_API_KEY
    /// - POLYMARKET_API_SECRET
    /// - POLYMARKET_API_PASSPHRASE
    /// - POLYMARKET_CHAIN_ID (defaults to 137)
    pub fn from_env() -> Result<Self> {
        let private_key =
            std::env::var("POLYMARKET_PRIVATE_KEY").context("POLYMARKET_PRIVATE_KEY not set")?;
        let api_key = std::env::var("POLYMARKET_API_KEY").context("POLYMARKET_API_KEY not set")?;
        let api_secret =
            std::env::var("POLYMARKET_API_SECRET").context("POLYMARKET_API_SECRET not set")?;
        let api_passphrase = std::env::var("POLYMARKET_API_PASSPHRASE")
            .context("POLYMARKET_API_PASSPHRASE not set")?;
        let chain_id: u64 = std::env::var("POLYMARKET_CHAIN_ID")
            .unwrap_or_else(|_| "137".to_string())
            .parse()
            .context("Invalid POLYMARKET_CHAIN_ID")?;

        Self::new(&private_key, &api_key, &api_secret, &api_passphrase, chain_id)
    }
}
