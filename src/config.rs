use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use solana_sdk::{native_token::sol_to_lamports, pubkey::Pubkey};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::trading::detector::DetectorConfig;
use crate::trading::monitor::MonitorConfig;
use crate::trading::relay::{PriorityFee, TipAccountPool};
use crate::trading::retry::{transient_root, RetryPolicy};
use crate::trading::sniper::{SnipeFilter, SniperConfig};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    pub rpc_url: String,
    pub private_key: String,
    pub relay_endpoints: Vec<String>,
    pub tip_accounts: Vec<String>,

    pub slippage_bps: u16,
    pub sell_slippage_bps: u16,
    pub priority_fee_micro_lamports: u64,
    pub compute_unit_limit: u32,
    pub jito_tip_lamports: u64,

    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub skip_sell_loss_pct: f64,
    pub max_sell_retries: u32,
    pub max_trade_attempts: u32,
    pub retry_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub price_check_interval_ms: u64,
    pub price_check_duration_ms: u64,
    pub sell_on_timeout: bool,

    pub confirm_poll_interval_ms: u64,
    pub batch_stagger_ms: u64,
    pub positions_file: String,

    pub buy_amount_sol: f64,
    pub min_initial_liquidity_sol: f64,
    pub max_initial_liquidity_sol: Option<f64>,
    pub blacklisted_creators: Vec<String>,
    pub dry_run: bool,
    pub detection_poll_interval_ms: u64,
    pub detection_batch_limit: usize,
    pub rate_limit_ms: u64,
}

/// Reads an optional variable, falling back to `default` when unset.
/// A value that is set but malformed is an error rather than silently ignored.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", name, e)),
        Err(_) => Ok(default),
    }
}

fn env_list(name: &str) -> Vec<String> {
    env::var(name)
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn parse_pubkeys(name: &str, raw: &[String]) -> Result<Vec<Pubkey>> {
    raw.iter()
        .map(|key| Pubkey::from_str(key).with_context(|| format!("Invalid pubkey in {}: {}", name, key)))
        .collect()
}

fn env_flag(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| v.to_lowercase() == "true" || v == "1")
        .unwrap_or(default)
}

impl Config {
    pub fn load() -> Result<Self> {
        let slippage_bps = env_or("SLIPPAGE_BPS", 500u16)?;

        let relay_endpoints = env_list("RELAY_ENDPOINTS")
            .into_iter()
            .map(|endpoint| endpoint.trim_end_matches('/').to_string())
            .collect();
        let max_initial_liquidity_sol = match env::var("MAX_INITIAL_LIQUIDITY_SOL") {
            Ok(_) => Some(env_or("MAX_INITIAL_LIQUIDITY_SOL", 0.0)?),
            Err(_) => None,
        };

        let config = Self {
            rpc_url: env::var("RPC_ENDPOINT").context("RPC_ENDPOINT not set in environment")?,
            private_key: env::var("PRIVATE_KEY").context("PRIVATE_KEY not set in environment")?,
            relay_endpoints,
            tip_accounts: env_list("TIP_ACCOUNTS"),

            slippage_bps,
            sell_slippage_bps: env_or("SELL_SLIPPAGE_BPS", slippage_bps)?,
            priority_fee_micro_lamports: env_or("PRIORITY_FEE_MICRO_LAMPORTS", 100_000u64)?,
            compute_unit_limit: env_or("COMPUTE_UNIT_LIMIT", 200_000u32)?,
            jito_tip_lamports: env_or("JITO_TIP_LAMPORTS", 100_000u64)?,

            take_profit_pct: env_or("TAKE_PROFIT", 50.0)?,
            stop_loss_pct: env_or("STOP_LOSS", 20.0)?,
            skip_sell_loss_pct: env_or("SKIP_SELLING_IF_LOST_MORE_THAN", 80.0)?,
            max_sell_retries: env_or("MAX_SELL_RETRIES", 5u32)?,
            max_trade_attempts: env_or("MAX_TRADE_ATTEMPTS", 3u32)?,
            retry_delay_ms: env_or("RETRY_DELAY_MS", 1_000u64)?,
            retry_max_delay_ms: env_or("RETRY_MAX_DELAY_MS", 8_000u64)?,
            price_check_interval_ms: env_or("PRICE_CHECK_INTERVAL", 2_000u64)?,
            price_check_duration_ms: env_or("PRICE_CHECK_DURATION", 600_000u64)?,
            sell_on_timeout: env_flag("SELL_ON_TIMEOUT", true),

            confirm_poll_interval_ms: env_or("CONFIRM_POLL_INTERVAL_MS", 500u64)?,
            batch_stagger_ms: env_or("BATCH_STAGGER_MS", 200u64)?,
            positions_file: env::var("POSITIONS_FILE")
                .unwrap_or_else(|_| "data/positions.json".to_string()),

            buy_amount_sol: env_or("BUY_AMOUNT_SOL", 0.1)?,
            min_initial_liquidity_sol: env_or("MIN_INITIAL_LIQUIDITY_SOL", 0.0)?,
            max_initial_liquidity_sol,
            blacklisted_creators: env_list("BLACKLISTED_CREATORS"),
            dry_run: env_flag("DRY_RUN", true),
            detection_poll_interval_ms: env_or("DETECTION_POLL_INTERVAL_MS", 1_000u64)?,
            detection_batch_limit: env_or("DETECTION_BATCH_LIMIT", 100usize)?,
            rate_limit_ms: env_or("RATE_LIMIT_MS", 100u64)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.slippage_bps > 10_000 || self.sell_slippage_bps > 10_000 {
            anyhow::bail!("Slippage must be at most 10000 bps");
        }
        if self.max_trade_attempts == 0 {
            anyhow::bail!("MAX_TRADE_ATTEMPTS must be at least 1");
        }
        if self.take_profit_pct <= 0.0 || self.stop_loss_pct <= 0.0 {
            anyhow::bail!("TAKE_PROFIT and STOP_LOSS must be positive percentages");
        }
        if self.skip_sell_loss_pct < self.stop_loss_pct {
            anyhow::bail!(
                "SKIP_SELLING_IF_LOST_MORE_THAN ({}) must not be below STOP_LOSS ({})",
                self.skip_sell_loss_pct,
                self.stop_loss_pct
            );
        }
        if self.buy_amount_sol <= 0.0 {
            anyhow::bail!("BUY_AMOUNT_SOL must be positive");
        }
        if let Some(max) = self.max_initial_liquidity_sol {
            if max < self.min_initial_liquidity_sol {
                anyhow::bail!("MAX_INITIAL_LIQUIDITY_SOL must not be below MIN_INITIAL_LIQUIDITY_SOL");
            }
        }
        if self.detection_batch_limit == 0 {
            anyhow::bail!("DETECTION_BATCH_LIMIT must be at least 1");
        }
        parse_pubkeys("BLACKLISTED_CREATORS", &self.blacklisted_creators)?;
        self.tip_pool()?;
        Ok(())
    }

    /// Tip accounts override from `TIP_ACCOUNTS`; `None` keeps the public pool.
    pub fn tip_pool(&self) -> Result<Option<TipAccountPool>> {
        if self.tip_accounts.is_empty() {
            return Ok(None);
        }
        let accounts = parse_pubkeys("TIP_ACCOUNTS", &self.tip_accounts)?;
        Ok(Some(TipAccountPool::new(accounts)?))
    }

    /// The relay tip is only paid when transactions go through a relay.
    pub fn priority_fee(&self) -> PriorityFee {
        PriorityFee {
            unit_limit: self.compute_unit_limit,
            unit_price_micro_lamports: self.priority_fee_micro_lamports,
            tip_lamports: if self.relay_endpoints.is_empty() {
                0
            } else {
                self.jito_tip_lamports
            },
        }
    }

    /// Submission retry policy used by buy/sell, backing off exponentially.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.max_trade_attempts,
            Duration::from_millis(self.retry_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms.max(self.retry_delay_ms)),
        )
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            take_profit_pct: self.take_profit_pct,
            stop_loss_pct: self.stop_loss_pct,
            skip_sell_loss_pct: self.skip_sell_loss_pct,
            interval: Duration::from_millis(self.price_check_interval_ms),
            duration: Duration::from_millis(self.price_check_duration_ms),
            sell_on_timeout: self.sell_on_timeout,
            sell_slippage_bps: self.sell_slippage_bps,
            sell_policy: RetryPolicy::fixed(
                self.max_sell_retries.max(1),
                Duration::from_millis(self.retry_delay_ms),
            )
            .retrying_on(transient_root),
        }
    }

    pub fn confirm_poll_interval(&self) -> Duration {
        Duration::from_millis(self.confirm_poll_interval_ms)
    }

    pub fn batch_stagger(&self) -> Duration {
        Duration::from_millis(self.batch_stagger_ms)
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            poll_interval: Duration::from_millis(self.detection_poll_interval_ms),
            batch_limit: self.detection_batch_limit,
        }
    }

    pub fn snipe_filter(&self) -> Result<SnipeFilter> {
        Ok(SnipeFilter {
            blacklisted_creators: parse_pubkeys("BLACKLISTED_CREATORS", &self.blacklisted_creators)?
                .into_iter()
                .collect(),
            min_liquidity_lamports: sol_to_lamports(self.min_initial_liquidity_sol),
            max_liquidity_lamports: self.max_initial_liquidity_sol.map(sol_to_lamports),
        })
    }

    pub fn sniper_config(&self, dry_run: bool) -> SniperConfig {
        SniperConfig {
            buy_lamports: sol_to_lamports(self.buy_amount_sol),
            slippage_bps: self.slippage_bps,
            dry_run,
            rate_limit: Duration::from_millis(self.rate_limit_ms),
            monitor: self.monitor_config(),
        }
    }
}
