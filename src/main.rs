use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use solana_sdk::{native_token::lamports_to_sol, native_token::sol_to_lamports, pubkey::Pubkey};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod api;
mod config;
mod error;
mod solana;
mod trading;

#[cfg(test)]
mod testing;

use crate::api::jito::JitoClient;
use crate::config::Config;
use crate::solana::client::{Ledger, SolanaClient};
use crate::solana::wallet::WalletManager;
use crate::trading::distributor::{parse_recipients, TokenDistributor};
use crate::trading::quote::sol_per_token;
use crate::trading::sweeper::AccountSweeper;
use crate::trading::{
    Instrument, MonitorState, PositionBook, PositionMonitor, QuoteSource, RelaySubmitter, Sniper,
    TokenDetector, TradeOrchestrator,
};

#[derive(Parser, Debug)]
#[command(name = "pump-trader", about = "Trade Pump.fun bonding-curve tokens")]
struct Cli {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Buy a token with SOL and record the position
    Buy {
        mint: String,
        /// SOL to spend
        sol: f64,
        #[arg(long)]
        slippage_bps: Option<u16>,
    },
    /// Sell a token; sells the whole balance unless --amount is given
    Sell {
        mint: String,
        /// Whole tokens to sell
        #[arg(long)]
        amount: Option<f64>,
        #[arg(long)]
        slippage_bps: Option<u16>,
    },
    /// Monitor a position until take-profit, stop-loss or timeout, buying first with --sol
    Watch {
        mint: String,
        #[arg(long)]
        sol: Option<f64>,
    },
    /// Watch for new launches and buy those passing the filters until ctrl-c
    Snipe {
        /// Overrides DRY_RUN
        #[arg(long)]
        dry_run: Option<bool>,
        /// SOL per buy, overrides BUY_AMOUNT_SOL
        #[arg(long)]
        sol: Option<f64>,
    },
    /// Close empty token accounts
    Sweep,
    /// Sell every residual token balance, then close the empty accounts
    Gather {
        #[arg(long)]
        slippage_bps: Option<u16>,
    },
    /// Send tokens to the wallets listed in a `wallet,amount` file
    Distribute { mint: String, file: PathBuf },
    /// Show SOL and token balances
    Balance,
}

struct App {
    config: Config,
    ledger: Arc<dyn Ledger>,
    submitter: Arc<RelaySubmitter>,
    quotes: QuoteSource,
    orchestrator: Arc<TradeOrchestrator>,
}

impl App {
    async fn build(config: Config) -> Result<Self> {
        let ledger: Arc<dyn Ledger> = Arc::new(SolanaClient::new(&config.rpc_url));
        let wallet = WalletManager::new(&config.private_key)?;

        let relay = if config.relay_endpoints.is_empty() {
            warn!("RELAY_ENDPOINTS not set, submitting through RPC without a tip");
            None
        } else {
            Some(JitoClient::new(config.relay_endpoints.clone())?)
        };

        let mut submitter = RelaySubmitter::new(ledger.clone(), wallet, relay, config.confirm_poll_interval());
        if let Some(tips) = config.tip_pool()? {
            submitter = submitter.with_tip_pool(tips);
        }
        let submitter = Arc::new(submitter);
        let quotes = QuoteSource::new(ledger.clone());

        let book = PositionBook::new(Some(PathBuf::from(&config.positions_file)));
        book.load().await.context("Failed to load positions")?;

        let orchestrator = Arc::new(TradeOrchestrator::new(
            quotes.clone(),
            submitter.clone(),
            book,
            config.retry_policy(),
            config.priority_fee(),
        ));

        Ok(Self {
            config,
            ledger,
            submitter,
            quotes,
            orchestrator,
        })
    }

    fn instrument(mint: &str) -> Result<Instrument> {
        let mint = Pubkey::from_str(mint.trim()).with_context(|| format!("Invalid mint address: {}", mint))?;
        Ok(Instrument::new(mint))
    }

    fn monitor(&self, position: trading::Position) -> PositionMonitor {
        PositionMonitor::new(
            position,
            self.config.monitor_config(),
            Arc::new(self.quotes.clone()),
            self.orchestrator.clone(),
        )
    }

    fn sweeper(&self) -> AccountSweeper {
        AccountSweeper::new(
            self.submitter.clone(),
            self.config.priority_fee(),
            self.config.batch_stagger(),
        )
    }

    async fn snipe(&self, dry_run: bool, sol: Option<f64>) -> Result<()> {
        let mut sniper_config = self.config.sniper_config(dry_run);
        if let Some(sol) = sol {
            sniper_config.buy_lamports = sol_to_lamports(sol);
        }
        if !dry_run {
            warn!("Live sniping: every accepted launch is bought with real SOL");
        }
        let sniper = Sniper::new(
            self.quotes.clone(),
            self.orchestrator.clone(),
            self.config.snipe_filter()?,
            sniper_config,
        );

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (event_tx, event_rx) = mpsc::channel(64);
        let detector = TokenDetector::new(self.ledger.clone(), self.config.detector_config())
            .spawn(event_tx, shutdown_rx);
        let sniper = tokio::spawn(sniper.run(event_rx));

        tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
        info!("Shutdown requested");
        let _ = shutdown_tx.send(());

        let stats = detector.await.context("Detector task failed")?;
        let report = sniper.await.context("Sniper task failed")?;
        info!("Detector: {:?}", stats);
        info!(
            "Snipe session: {} detected, {} rejected, {} dry runs, {} bought, {} failed",
            report.detected, report.rejected, report.dry_runs, report.bought, report.failed
        );
        Ok(())
    }

    async fn run(&self, command: Command) -> Result<()> {
        match command {
            Command::Buy {
                mint,
                sol,
                slippage_bps,
            } => {
                let instrument = Self::instrument(&mint)?;
                let slippage = slippage_bps.unwrap_or(self.config.slippage_bps);
                let position = self
                    .orchestrator
                    .buy(instrument, sol_to_lamports(sol), slippage)
                    .await?;
                info!(
                    "Bought {} raw units of {} at {:.12} SOL/token ({})",
                    position.amount_held,
                    instrument,
                    sol_per_token(position.entry_price, instrument.decimals),
                    position.entry_signature
                );
            }
            Command::Sell {
                mint,
                amount,
                slippage_bps,
            } => {
                let instrument = Self::instrument(&mint)?;
                let slippage = slippage_bps.unwrap_or(self.config.sell_slippage_bps);
                let raw_amount = match amount {
                    Some(tokens) => (tokens * 10f64.powi(instrument.decimals as i32)).round() as u64,
                    None => u64::MAX,
                };
                let attempt = self.orchestrator.sell(instrument, raw_amount, slippage).await?;
                info!(
                    "Sold {} (submitted {}): {:?}",
                    instrument,
                    attempt.submitted_at(),
                    attempt.outcome()
                );
            }
            Command::Watch { mint, sol } => {
                let instrument = Self::instrument(&mint)?;
                let position = match self.orchestrator.book().get(&instrument.mint).await {
                    Some(position) => {
                        info!("Resuming monitor for existing position {}", position.id);
                        position
                    }
                    None => {
                        let sol = sol.context("No open position for this mint; pass --sol to buy first")?;
                        self.orchestrator
                            .buy(instrument, sol_to_lamports(sol), self.config.slippage_bps)
                            .await?
                    }
                };
                let state = self.monitor(position).spawn().await?;
                match state {
                    MonitorState::Abandoned { reason } => warn!("Position on {} abandoned: {}", instrument, reason),
                    other => info!("Monitor for {} finished: {:?}", instrument, other),
                }
            }
            Command::Snipe { dry_run, sol } => {
                self.snipe(dry_run.unwrap_or(self.config.dry_run), sol).await?;
            }
            Command::Sweep => {
                let report = self.sweeper().sweep().await?;
                for (account, reason) in &report.failed {
                    warn!("Could not close {}: {}", account, reason);
                }
            }
            Command::Gather { slippage_bps } => {
                let slippage = slippage_bps.unwrap_or(self.config.sell_slippage_bps);
                let report = self.sweeper().gather(&self.orchestrator, slippage).await?;
                for (account, reason) in &report.failed {
                    warn!("Could not gather {}: {}", account, reason);
                }
            }
            Command::Distribute { mint, file } => {
                let instrument = Self::instrument(&mint)?;
                let text = tokio::fs::read_to_string(&file)
                    .await
                    .with_context(|| format!("Failed to read {:?}", file))?;
                let recipients = parse_recipients(&text, instrument.decimals)?;
                let distributor = TokenDistributor::new(
                    self.submitter.clone(),
                    self.config.priority_fee(),
                    self.config.batch_stagger(),
                );
                let report = distributor.distribute(&instrument, &recipients).await?;
                info!(
                    "Distribution finished: {} delivered, {} failed",
                    report.delivered.len(),
                    report.failed.len()
                );
            }
            Command::Balance => {
                let owner = self.submitter.wallet_pubkey();
                let lamports = self.ledger.get_balance(&owner).await?;
                info!("{}: {:.9} SOL", owner, lamports_to_sol(lamports));
                for account in self.ledger.token_accounts_by_owner(&owner).await? {
                    info!("  {} {} (account {})", account.mint, account.amount, account.address);
                }
                for position in self.orchestrator.book().all().await {
                    let current = match self.quotes.get_reserves(&position.instrument).await {
                        Ok(snapshot) => format!(
                            "{:.10} SOL/token",
                            sol_per_token(snapshot.price(), position.instrument.decimals)
                        ),
                        Err(e) => format!("price unavailable ({})", e),
                    };
                    info!(
                        "  open position {} on {}: {} held since {}, entry {:.10} SOL/token, now {}",
                        position.id,
                        position.instrument,
                        position.amount_held,
                        position.opened_at,
                        sol_per_token(position.entry_price, position.instrument.decimals),
                        current
                    );
                }
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::load()?;
    info!("Configuration loaded successfully");

    let app = App::build(config).await?;
    app.run(cli.command).await
}
