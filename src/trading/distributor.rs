use futures::future::join_all;
use solana_sdk::pubkey::Pubkey;
use spl_associated_token_account::get_associated_token_address;
use std::str::FromStr;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info};

use crate::error::TradeError;
use crate::solana::client::token_balance;
use crate::trading::instructions::Operation;
use crate::trading::quote::Instrument;
use crate::trading::relay::{PriorityFee, RelaySubmitter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub wallet: Pubkey,
    /// Raw token units.
    pub amount: u64,
}

#[derive(Debug, Default)]
pub struct DistributionReport {
    pub delivered: Vec<(Pubkey, String)>,
    pub failed: Vec<(Pubkey, String)>,
}

/// Parses `wallet,amount` lines, amounts in whole tokens. Blank lines and
/// `#` comments are ignored.
pub fn parse_recipients(text: &str, decimals: u8) -> Result<Vec<Recipient>, TradeError> {
    let scale = 10f64.powi(decimals as i32);
    text.lines()
        .enumerate()
        .map(|(n, line)| (n + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(n, line)| {
            let (wallet, amount) = line
                .split_once(',')
                .ok_or_else(|| TradeError::InvalidAmount(format!("line {}: expected `wallet,amount`", n)))?;
            let wallet = Pubkey::from_str(wallet.trim())
                .map_err(|e| TradeError::InvalidAmount(format!("line {}: bad wallet: {}", n, e)))?;
            let amount: f64 = amount
                .trim()
                .parse()
                .map_err(|e| TradeError::InvalidAmount(format!("line {}: bad amount: {}", n, e)))?;
            if !amount.is_finite() || amount <= 0.0 {
                return Err(TradeError::InvalidAmount(format!("line {}: amount must be positive", n)));
            }
            Ok(Recipient {
                wallet,
                amount: (amount * scale).round() as u64,
            })
        })
        .collect()
}

/// Sends tokens from the main wallet to many recipients.
pub struct TokenDistributor {
    submitter: Arc<RelaySubmitter>,
    fee: PriorityFee,
    stagger: Duration,
}

impl TokenDistributor {
    pub fn new(submitter: Arc<RelaySubmitter>, fee: PriorityFee, stagger: Duration) -> Self {
        Self {
            submitter,
            fee,
            stagger,
        }
    }

    /// Dispatches one transfer per recipient, staggered. Fails up front only
    /// when the wallet cannot cover the total.
    pub async fn distribute(
        &self,
        instrument: &Instrument,
        recipients: &[Recipient],
    ) -> Result<DistributionReport, TradeError> {
        let owner = self.submitter.wallet_pubkey();
        let source = get_associated_token_address(&owner, &instrument.mint);
        let available = token_balance(self.submitter.ledger().as_ref(), &source).await?;
        let total: u128 = recipients.iter().map(|r| r.amount as u128).sum();
        if total > available as u128 {
            return Err(TradeError::InvalidAmount(format!(
                "Distribution of {} needs {} tokens, wallet holds {}",
                instrument, total, available
            )));
        }
        info!("Distributing {} {} tokens to {} wallets", total, instrument, recipients.len());

        let transfers = recipients.iter().enumerate().map(|(i, recipient)| async move {
            sleep(self.stagger * i as u32).await;
            if recipient.amount == 0 {
                return (recipient, Err(TradeError::InvalidAmount("zero transfer".to_string())));
            }
            let operations = vec![
                Operation::CreateAccount {
                    owner: recipient.wallet,
                    mint: instrument.mint,
                },
                Operation::Transfer {
                    mint: instrument.mint,
                    decimals: instrument.decimals,
                    recipient: recipient.wallet,
                    amount: recipient.amount,
                },
            ];
            (recipient, self.submitter.submit(None, operations, &self.fee).await)
        });

        let mut report = DistributionReport::default();
        for (recipient, result) in join_all(transfers).await {
            match result {
                Ok(attempt) => {
                    let signature = attempt.signature().map(|s| s.to_string()).unwrap_or_default();
                    info!("Sent {} to {}: {}", recipient.amount, recipient.wallet, signature);
                    report.delivered.push((recipient.wallet, signature));
                }
                Err(e) => {
                    error!("Transfer of {} to {} failed: {}", recipient.amount, recipient.wallet, e);
                    report.failed.push((recipient.wallet, e.to_string()));
                }
            }
        }
        Ok(report)
    }
}
