use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::error::TradeError;
use crate::trading::position::Position;
use crate::trading::quote::{Instrument, QuoteSource};
use crate::trading::relay::TradeAttempt;
use crate::trading::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    /// Losses at or beyond this are left unsold.
    pub skip_sell_loss_pct: f64,
    pub interval: Duration,
    pub duration: Duration,
    pub sell_on_timeout: bool,
    pub sell_slippage_bps: u16,
    pub sell_policy: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorState {
    Idle,
    Watching,
    Exited { signature: String },
    TimedOut { signature: Option<String> },
    Abandoned { reason: String },
}

/// Outcome of comparing one price observation with the entry price.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExitDecision {
    Hold,
    TakeProfit(f64),
    StopLoss(f64),
    SkipSell(f64),
}

/// Pure threshold check. The skip-sell threshold is deeper than the stop
/// loss, so it is tested first.
pub fn evaluate(config: &MonitorConfig, entry_price: f64, current_price: f64) -> ExitDecision {
    if entry_price <= 0.0 {
        return ExitDecision::Hold;
    }
    let change = (current_price - entry_price) / entry_price * 100.0;
    if change <= -config.skip_sell_loss_pct {
        ExitDecision::SkipSell(change)
    } else if change >= config.take_profit_pct {
        ExitDecision::TakeProfit(change)
    } else if change <= -config.stop_loss_pct {
        ExitDecision::StopLoss(change)
    } else {
        ExitDecision::Hold
    }
}

#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn current_price(&self, instrument: &Instrument) -> Result<f64, TradeError>;
}

#[async_trait]
impl PriceFeed for QuoteSource {
    async fn current_price(&self, instrument: &Instrument) -> Result<f64, TradeError> {
        Ok(self.get_reserves(instrument).await?.price())
    }
}

/// Where the monitor sends its exits.
#[async_trait]
pub trait ExitSeller: Send + Sync {
    async fn sell_position(&self, position: &Position, slippage_bps: u16) -> Result<TradeAttempt, TradeError>;

    /// Forgets the position without trading.
    async fn abandon_position(&self, position: &Position) -> Result<(), TradeError>;
}

/// Watches one position on its own task until a terminal state.
pub struct PositionMonitor {
    position: Position,
    config: MonitorConfig,
    feed: Arc<dyn PriceFeed>,
    seller: Arc<dyn ExitSeller>,
    state: MonitorState,
}

impl PositionMonitor {
    pub fn new(
        position: Position,
        config: MonitorConfig,
        feed: Arc<dyn PriceFeed>,
        seller: Arc<dyn ExitSeller>,
    ) -> Self {
        Self {
            position,
            config,
            feed,
            seller,
            state: MonitorState::Idle,
        }
    }

    pub fn spawn(self) -> JoinHandle<MonitorState> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) -> MonitorState {
        let instrument = self.position.instrument;
        self.state = MonitorState::Watching;
        info!(
            "Watching {}: entry {:.12}, TP +{}%, SL -{}%, skip below -{}%, for {:?}",
            instrument,
            self.position.entry_price,
            self.config.take_profit_pct,
            self.config.stop_loss_pct,
            self.config.skip_sell_loss_pct,
            self.config.duration
        );

        let started = Instant::now();
        loop {
            if started.elapsed() >= self.config.duration {
                self.state = self.on_timeout().await;
                return self.state;
            }

            match self.feed.current_price(&instrument).await {
                Ok(price) => match evaluate(&self.config, self.position.entry_price, price) {
                    ExitDecision::Hold => {
                        debug!("{} at {:.12} ({:+.2}%)", instrument, price, self.position.change_pct(price));
                    }
                    ExitDecision::TakeProfit(change) | ExitDecision::StopLoss(change) => {
                        info!("Exit signal for {} at {:+.2}%, selling", instrument, change);
                        self.state = match self.sell().await {
                            Ok(signature) => MonitorState::Exited { signature },
                            Err(reason) => self.abandon(reason).await,
                        };
                        return self.state;
                    }
                    ExitDecision::SkipSell(change) => {
                        let reason = format!(
                            "loss {:.2}% is past the {}% skip-selling threshold, not selling",
                            change, self.config.skip_sell_loss_pct
                        );
                        warn!("{}: {}", instrument, reason);
                        self.state = self.abandon(reason).await;
                        return self.state;
                    }
                },
                Err(e) => warn!("Price check for {} failed: {}", instrument, e),
            }

            sleep(self.config.interval).await;
        }
    }

    async fn on_timeout(&self) -> MonitorState {
        let instrument = self.position.instrument;
        if !self.config.sell_on_timeout {
            info!("Monitoring of {} timed out, position left open", instrument);
            return MonitorState::TimedOut { signature: None };
        }
        info!("Monitoring of {} timed out, selling", instrument);
        match self.sell().await {
            Ok(signature) => MonitorState::TimedOut {
                signature: Some(signature),
            },
            Err(reason) => self.abandon(reason).await,
        }
    }

    /// Sells under the monitor's own retry ceiling.
    async fn sell(&self) -> Result<String, String> {
        let label = format!("Exit sell {}", self.position.instrument);
        let seller = self.seller.clone();
        let position = &self.position;
        let slippage_bps = self.config.sell_slippage_bps;
        self.config
            .sell_policy
            .run(&label, |_| {
                let seller = seller.clone();
                async move { seller.sell_position(position, slippage_bps).await }
            })
            .await
            .map(|attempt| attempt.signature().map(|s| s.to_string()).unwrap_or_default())
            .map_err(|e| format!("sell failed: {}", e))
    }

    async fn abandon(&self, reason: String) -> MonitorState {
        error!("Abandoning position on {}: {}", self.position.instrument, reason);
        if let Err(e) = self.seller.abandon_position(&self.position).await {
            warn!("Failed to drop abandoned position {}: {}", self.position.id, e);
        }
        MonitorState::Abandoned { reason }
    }
}
