use futures::future::join_all;
use solana_sdk::pubkey::Pubkey;
use spl_associated_token_account::get_associated_token_address;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info};

use crate::error::TradeError;
use crate::solana::client::TokenAccountInfo;
use crate::trading::instructions::Operation;
use crate::trading::orchestrator::TradeOrchestrator;
use crate::trading::quote::Instrument;
use crate::trading::relay::{PriorityFee, RelaySubmitter};

#[derive(Debug, Default)]
pub struct SweepReport {
    pub closed: Vec<(Pubkey, String)>,
    /// Residual balances sold off by `gather`, with the sell signature.
    pub sold: Vec<(Pubkey, String)>,
    /// Accounts still holding tokens, left untouched.
    pub skipped: Vec<(Pubkey, u64)>,
    pub failed: Vec<(Pubkey, String)>,
}

impl SweepReport {
    fn log_summary(&self) {
        info!(
            "Sweep finished: {} closed, {} sold, {} skipped, {} failed",
            self.closed.len(),
            self.sold.len(),
            self.skipped.len(),
            self.failed.len()
        );
    }
}

/// Closes the wallet's empty token accounts to reclaim their rent.
pub struct AccountSweeper {
    submitter: Arc<RelaySubmitter>,
    fee: PriorityFee,
    stagger: Duration,
}

impl AccountSweeper {
    pub fn new(submitter: Arc<RelaySubmitter>, fee: PriorityFee, stagger: Duration) -> Self {
        Self {
            submitter,
            fee,
            stagger,
        }
    }

    /// Each close is its own transaction; one failure never stops the rest.
    pub async fn sweep(&self) -> Result<SweepReport, TradeError> {
        let (empty, residual) = self.list_accounts().await?;

        let mut report = SweepReport::default();
        for account in residual {
            info!(
                "Skipping {} ({}): still holds {} tokens",
                account.address, account.mint, account.amount
            );
            report.skipped.push((account.address, account.amount));
        }
        self.close_all(&empty, &mut report).await;

        report.log_summary();
        Ok(report)
    }

    /// Sells every residual balance on its curve, closing the account with
    /// the sale, then closes the accounts that were already empty. Only the
    /// wallet's associated accounts can be sold; others are skipped.
    pub async fn gather(&self, seller: &TradeOrchestrator, slippage_bps: u16) -> Result<SweepReport, TradeError> {
        let owner = self.submitter.wallet_pubkey();
        let (empty, residual) = self.list_accounts().await?;

        let mut report = SweepReport::default();
        let (sellable, foreign): (Vec<TokenAccountInfo>, Vec<TokenAccountInfo>) = residual
            .into_iter()
            .partition(|account| account.address == get_associated_token_address(&owner, &account.mint));
        for account in foreign {
            info!(
                "Skipping {} ({}): not the wallet's associated account",
                account.address, account.mint
            );
            report.skipped.push((account.address, account.amount));
        }

        let sells = sellable.iter().enumerate().map(|(i, account)| async move {
            sleep(self.stagger * i as u32).await;
            let instrument = Instrument::new(account.mint);
            (account, seller.sell(instrument, account.amount, slippage_bps).await)
        });
        for (account, result) in join_all(sells).await {
            match result {
                Ok(attempt) => {
                    let signature = attempt.signature().map(|s| s.to_string()).unwrap_or_default();
                    info!("Sold {} of {} from {}: {}", account.amount, account.mint, account.address, signature);
                    report.sold.push((account.address, signature));
                }
                Err(e) => {
                    error!("Failed to sell {} from {}: {}", account.mint, account.address, e);
                    report.failed.push((account.address, e.to_string()));
                }
            }
        }

        self.close_all(&empty, &mut report).await;
        report.log_summary();
        Ok(report)
    }

    /// The wallet's token accounts split into (empty, holding a balance).
    async fn list_accounts(&self) -> Result<(Vec<TokenAccountInfo>, Vec<TokenAccountInfo>), TradeError> {
        let owner = self.submitter.wallet_pubkey();
        let accounts = self.submitter.ledger().token_accounts_by_owner(&owner).await?;
        info!("Found {} token accounts for {}", accounts.len(), owner);
        Ok(accounts.into_iter().partition(|account| account.amount == 0))
    }

    async fn close_all(&self, empty: &[TokenAccountInfo], report: &mut SweepReport) {
        let closes = empty.iter().enumerate().map(|(i, account)| async move {
            sleep(self.stagger * i as u32).await;
            let operations = vec![Operation::CloseAccount {
                account: account.address,
            }];
            (account, self.submitter.submit(None, operations, &self.fee).await)
        });

        for (account, result) in join_all(closes).await {
            match result {
                Ok(attempt) => {
                    let signature = attempt.signature().map(|s| s.to_string()).unwrap_or_default();
                    info!("Closed {} ({}): {}", account.address, account.mint, signature);
                    report.closed.push((account.address, signature));
                }
                Err(e) => {
                    error!("Failed to close {} ({}): {}", account.address, account.mint, e);
                    report.failed.push((account.address, e.to_string()));
                }
            }
        }
    }
}
