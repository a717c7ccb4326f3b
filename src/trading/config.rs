//! Mirroring configuration. Loaded once at startup, immutable afterwards.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{MirrorError, MirrorResult};

/// Inputs to the Position Sizer.
#[derive(Debug, Clone)]
pub struct SizingConfig {
    /// Leader size multiplier
    pub copy_ratio: Decimal,

    /// Per-leader overrides of `copy_ratio`, keyed by lowercase address
    pub leader_ratios: HashMap<String, Decimal>,

    /// Total follower capital ceiling in USDC
    pub total_capital: Decimal,

    /// Capital ceiling for markets without an override
    pub default_market_ceiling: Decimal,

    pub market_ceilings: HashMap<String, Decimal>,

    /// Markets to mirror; empty means every market
    pub mirrored_markets: HashSet<String>,

    /// Venue minimum order size in shares
    pub min_order_size: Decimal,

    /// Max cost of a single order as a fraction of total capital
    pub max_order_fraction: Decimal,

    /// Leader trades older than this are not mirrored
    pub max_trade_age: chrono::Duration,

    /// USDC the follower may spend on buys per UTC day; unlimited if unset
    pub max_daily_volume: Option<Decimal>,
}

impl SizingConfig {
    pub fn ratio_for(&self, leader: &str) -> Decimal {
        self.leader_ratios
            .get(&leader.to_lowercase())
            .copied()
            .unwrap_or(self.copy_ratio)
    }

    pub fn ceiling_for(&self, market_id: &str) -> Decimal {
        self.market_ceilings
            .get(market_id)
            .copied()
            .unwrap_or(self.default_market_ceiling)
    }

    pub fn is_mirrored(&self, market_id: &str) -> bool {
        self.mirrored_markets.is_empty() || self.mirrored_markets.contains(market_id)
    }
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            copy_ratio: dec!(0.1),
            leader_ratios: HashMap::new(),
            total_capital: dec!(1000),
            default_market_ceiling: dec!(1000),
            market_ceilings: HashMap::new(),
            mirrored_markets: HashSet::new(),
            min_order_size: dec!(5),
            max_order_fraction: dec!(0.1),
            max_trade_age: chrono::Duration::seconds(300),
            max_daily_volume: None,
        }
    }
}

/// Inputs to the Execution Engine.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Max submission attempts per intent
    pub retry_limit: u32,

    /// How long to wait for the venue to close an order
    pub fill_timeout: Duration,

    /// Delay between order status polls
    pub status_poll_interval: Duration,

    /// Venue-side lifetime of follower orders, from intent creation
    pub order_ttl: Duration,

    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            fill_timeout: Duration::from_secs(60),
            status_poll_interval: Duration::from_secs(2),
            order_ttl: Duration::from_secs(120),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

/// Full process configuration.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Leader accounts, lowercase
    pub leaders: Vec<String>,
    pub sizing: SizingConfig,
    pub execution: ExecutionConfig,
    /// Leader activity polling interval
    pub poll_interval: Duration,
    /// Concurrent mirror workers
    pub workers: usize,
    pub reconcile_interval: Duration,
    pub dry_run: bool,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            leaders: Vec::new(),
            sizing: SizingConfig::default(),
            execution: ExecutionConfig::default(),
            poll_interval: Duration::from_secs(5),
            workers: 4,
            reconcile_interval: Duration::from_secs(30),
            dry_run: false,
        }
    }
}

impl MirrorConfig {
    /// Reject configurations the pipeline cannot run safely with.
    pub fn validate(&self) -> MirrorResult<()> {
        let invalid = |msg: String| Err(MirrorError::Configuration(msg));

        if self.leaders.is_empty() {
            return invalid("at least one leader address is required".into());
        }
        for leader in &self.leaders {
            if !is_address(leader) {
                return invalid(format!("malformed leader address: {leader}"));
            }
        }

        let s = &self.sizing;
        if s.copy_ratio <= Decimal::ZERO {
            return invalid(format!("copy ratio must be positive, got {}", s.copy_ratio));
        }
        if let Some((leader, ratio)) = s.leader_ratios.iter().find(|(_, r)| **r <= Decimal::ZERO) {
            return invalid(format!("copy ratio for {leader} must be positive, got {ratio}"));
        }
        if s.total_capital <= Decimal::ZERO {
            return invalid(format!("capital must be positive, got {}", s.total_capital));
        }
        if s.default_market_ceiling <= Decimal::ZERO {
            return invalid("market ceiling must be positive".into());
        }
        if let Some((market, ceiling)) = s.market_ceilings.iter().find(|(_, c)| **c < Decimal::ZERO) {
            return invalid(format!("ceiling for {market} must not be negative, got {ceiling}"));
        }
        if s.min_order_size < Decimal::ZERO {
            return invalid("minimum order size must not be negative".into());
        }
        if s.max_order_fraction <= Decimal::ZERO || s.max_order_fraction > Decimal::ONE {
            return invalid(format!(
                "max order fraction must be in (0, 1], got {}",
                s.max_order_fraction
            ));
        }
        if s.max_trade_age < chrono::Duration::zero() {
            return invalid(format!(
                "max trade age must not be negative, got {}s",
                s.max_trade_age.num_seconds()
            ));
        }
        if let Some(volume) = s.max_daily_volume.filter(|v| *v <= Decimal::ZERO) {
            return invalid(format!("daily volume limit must be positive, got {volume}"));
        }

        if self.workers == 0 {
            return invalid("worker pool needs at least one worker".into());
        }
        if self.execution.retry_limit == 0 {
            return invalid("retry limit must allow at least one attempt".into());
        }
        if self.execution.order_ttl < self.execution.fill_timeout {
            return invalid(format!(
                "order TTL ({}s) must not be shorter than the fill timeout ({}s)",
                self.execution.order_ttl.as_secs(),
                self.execution.fill_timeout.as_secs()
            ));
        }

        Ok(())
    }
}

impl fmt::Display for MirrorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.sizing;
        writeln!(f, "Leaders:            {}", self.leaders.join(", "))?;
        writeln!(f, "Copy ratio:         {}", s.copy_ratio)?;
        for (leader, ratio) in &s.leader_ratios {
            writeln!(f, "  {leader}: {ratio}")?;
        }
        writeln!(f, "Capital:            ${}", s.total_capital)?;
        writeln!(f, "Market ceiling:     ${}", s.default_market_ceiling)?;
        for (market, ceiling) in &s.market_ceilings {
            writeln!(f, "  {market}: ${ceiling}")?;
        }
        if s.mirrored_markets.is_empty() {
            writeln!(f, "Markets:            all")?;
        } else {
            let mut markets: Vec<_> = s.mirrored_markets.iter().cloned().collect();
            markets.sort();
            writeln!(f, "Markets:            {}", markets.join(", "))?;
        }
        writeln!(f, "Min order size:     {} shares", s.min_order_size)?;
        writeln!(f, "Max order fraction: {}", s.max_order_fraction)?;
        writeln!(f, "Max trade age:      {}s", s.max_trade_age.num_seconds())?;
        match s.max_daily_volume {
            Some(volume) => writeln!(f, "Daily volume:       ${volume}")?,
            None => writeln!(f, "Daily volume:       unlimited")?,
        }
        writeln!(f, "Retry limit:        {}", self.execution.retry_limit)?;
        writeln!(f, "Fill timeout:       {}s", self.execution.fill_timeout.as_secs())?;
        writeln!(f, "Order TTL:          {}s", self.execution.order_ttl.as_secs())?;
        writeln!(f, "Poll interval:      {}s", self.poll_interval.as_secs())?;
        writeln!(f, "Workers:            {}", self.workers)?;
        writeln!(f, "Reconcile every:    {}s", self.reconcile_interval.as_secs())?;
        write!(f, "Dry run:            {}", self.dry_run)
    }
}

fn is_address(s: &str) -> bool {
    s.len() == 42 && s.starts_with("0x") && s[2..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Parse a comma-separated address list, lowercased and deduplicated.
pub fn parse_address_list(input: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    input
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .filter(|s| seen.insert(s.clone()))
        .collect()
}

/// Parse `key:value,key:value` pairs with decimal values.
pub fn parse_decimal_pairs(input: &str) -> MirrorResult<HashMap<String, Decimal>> {
    let mut pairs = HashMap::new();
    for item in input.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (key, value) = item.rsplit_once(':').ok_or_else(|| {
            MirrorError::Configuration(format!("expected key:value, got {item:?}"))
        })?;
        let value = Decimal::from_str(value.trim()).map_err(|e| {
            MirrorError::Configuration(format!("bad number in {item:?}: {e}"))
        })?;
        pairs.insert(key.trim().to_lowercase(), value);
    }
    Ok(pairs)
}
