use solana_sdk::{native_token::lamports_to_sol, pubkey::Pubkey};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use crate::error::TradeError;
use crate::trading::detector::TokenCreationEvent;
use crate::trading::monitor::{MonitorConfig, MonitorState, PositionMonitor};
use crate::trading::orchestrator::TradeOrchestrator;
use crate::trading::quote::{sol_per_token, Instrument, QuoteSource, ReserveSnapshot};

/// Launch filters. Liquidity is the SOL actually deposited in the curve.
#[derive(Debug, Clone, Default)]
pub struct SnipeFilter {
    pub blacklisted_creators: HashSet<Pubkey>,
    pub min_liquidity_lamports: u64,
    pub max_liquidity_lamports: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnipeVerdict {
    Accept,
    Reject(String),
}

impl SnipeFilter {
    pub fn check_creator(&self, creator: &Pubkey) -> SnipeVerdict {
        if self.blacklisted_creators.contains(creator) {
            SnipeVerdict::Reject(format!("creator {} is blacklisted", creator))
        } else {
            SnipeVerdict::Accept
        }
    }

    pub fn check_curve(&self, snapshot: &ReserveSnapshot) -> SnipeVerdict {
        let liquidity = snapshot.curve.real_sol_reserves;
        if snapshot.curve.complete {
            return SnipeVerdict::Reject("bonding curve already complete".to_string());
        }
        if liquidity < self.min_liquidity_lamports {
            return SnipeVerdict::Reject(format!(
                "liquidity {:.4} SOL below minimum {:.4} SOL",
                lamports_to_sol(liquidity),
                lamports_to_sol(self.min_liquidity_lamports)
            ));
        }
        match self.max_liquidity_lamports {
            Some(max) if liquidity > max => SnipeVerdict::Reject(format!(
                "liquidity {:.4} SOL above maximum {:.4} SOL",
                lamports_to_sol(liquidity),
                lamports_to_sol(max)
            )),
            _ => SnipeVerdict::Accept,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SniperConfig {
    pub buy_lamports: u64,
    pub slippage_bps: u16,
    /// Evaluate and log, never trade.
    pub dry_run: bool,
    /// Pause after each handled launch.
    pub rate_limit: Duration,
    pub monitor: MonitorConfig,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SnipeReport {
    pub detected: usize,
    pub rejected: usize,
    pub dry_runs: usize,
    pub bought: usize,
    pub failed: usize,
}

/// Buys launches that pass the filters and hands each position to its own monitor.
pub struct Sniper {
    quotes: QuoteSource,
    orchestrator: Arc<TradeOrchestrator>,
    filter: SnipeFilter,
    config: SniperConfig,
    monitors: Vec<JoinHandle<MonitorState>>,
}

impl Sniper {
    pub fn new(
        quotes: QuoteSource,
        orchestrator: Arc<TradeOrchestrator>,
        filter: SnipeFilter,
        config: SniperConfig,
    ) -> Self {
        Self {
            quotes,
            orchestrator,
            filter,
            config,
            monitors: Vec::new(),
        }
    }

    /// Blacklist first, so rejected creators cost no reads.
    pub async fn evaluate(&self, event: &TokenCreationEvent) -> Result<SnipeVerdict, TradeError> {
        if let verdict @ SnipeVerdict::Reject(_) = self.filter.check_creator(&event.creator) {
            return Ok(verdict);
        }
        let snapshot = self.quotes.get_reserves(&Instrument::new(event.mint)).await?;
        Ok(self.filter.check_curve(&snapshot))
    }

    async fn handle(&mut self, event: &TokenCreationEvent, report: &mut SnipeReport) {
        report.detected += 1;
        match self.evaluate(event).await {
            Ok(SnipeVerdict::Accept) => {}
            Ok(SnipeVerdict::Reject(reason)) => {
                info!("Skipping {}: {}", event.mint, reason);
                report.rejected += 1;
                return;
            }
            Err(e) => {
                warn!("Could not evaluate {}: {}", event.mint, e);
                report.failed += 1;
                return;
            }
        }

        if self.config.dry_run {
            info!(
                "[DRY RUN] Would buy {} ({}) for {} SOL",
                event.mint,
                event.symbol,
                lamports_to_sol(self.config.buy_lamports)
            );
            report.dry_runs += 1;
            return;
        }

        let instrument = Instrument::new(event.mint);
        match self
            .orchestrator
            .buy(instrument, self.config.buy_lamports, self.config.slippage_bps)
            .await
        {
            Ok(position) => {
                info!(
                    "Sniped {} ({}): {} tokens at {:.10} SOL/token",
                    instrument,
                    event.symbol,
                    position.amount_held,
                    sol_per_token(position.entry_price, instrument.decimals)
                );
                report.bought += 1;
                let monitor = PositionMonitor::new(
                    position,
                    self.config.monitor.clone(),
                    Arc::new(self.quotes.clone()),
                    self.orchestrator.clone(),
                );
                self.monitors.push(monitor.spawn());
            }
            Err(e) => {
                error!("Snipe of {} failed: {}", instrument, e);
                report.failed += 1;
            }
        }
    }

    /// Handles launches until the channel closes. Monitors still running at
    /// that point are stopped; their positions stay in the book.
    pub async fn run(mut self, mut events: mpsc::Receiver<TokenCreationEvent>) -> SnipeReport {
        let mut report = SnipeReport::default();
        info!(
            "Sniper ready: {} SOL per buy, dry run {}",
            lamports_to_sol(self.config.buy_lamports),
            self.config.dry_run
        );
        while let Some(event) = events.recv().await {
            self.handle(&event, &mut report).await;
            sleep(self.config.rate_limit).await;
        }

        let running: Vec<_> = self.monitors.into_iter().filter(|m| !m.is_finished()).collect();
        if !running.is_empty() {
            warn!(
                "Stopping {} position monitor(s); resume them with `watch <mint>`",
                running.len()
            );
        }
        for monitor in running {
            monitor.abort();
        }
        info!("Sniper finished: {:?}", report);
        report
    }
}
