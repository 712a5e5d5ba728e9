use async_trait::async_trait;
use spl_associated_token_account::get_associated_token_address;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::TradeError;
use crate::solana::client::{token_balance, Ledger};
use crate::trading::instructions::{build_trade, Direction, TradeRequest};
use crate::trading::monitor::ExitSeller;
use crate::trading::position::{Position, PositionBook};
use crate::trading::quote::{Instrument, QuoteSource, ReserveSnapshot};
use crate::trading::relay::{PriorityFee, RelaySubmitter, TradeAttempt};
use crate::trading::retry::RetryPolicy;

/// Quote, build and submit, retried as a whole under one policy.
///
/// Every attempt starts from a fresh reserve read, so an on-chain rejection
/// caused by stale reserves is retried against current state and never with
/// the rejected amounts.
pub struct TradeOrchestrator {
    quotes: QuoteSource,
    submitter: Arc<RelaySubmitter>,
    ledger: Arc<dyn Ledger>,
    book: PositionBook,
    policy: RetryPolicy,
    fee: PriorityFee,
}

impl TradeOrchestrator {
    pub fn new(
        quotes: QuoteSource,
        submitter: Arc<RelaySubmitter>,
        book: PositionBook,
        policy: RetryPolicy,
        fee: PriorityFee,
    ) -> Self {
        let ledger = submitter.ledger();
        Self {
            quotes,
            submitter,
            ledger,
            book,
            policy,
            fee,
        }
    }

    pub fn book(&self) -> &PositionBook {
        &self.book
    }

    /// Spends `quote_amount` lamports on `instrument` and opens a position.
    pub async fn buy(
        &self,
        instrument: Instrument,
        quote_amount: u64,
        slippage_bps: u16,
    ) -> Result<Position, TradeError> {
        if quote_amount == 0 {
            return Err(TradeError::InvalidAmount(format!(
                "Buy amount for {} must be positive",
                instrument
            )));
        }
        let _slot = self.book.reserve(&instrument).await?;

        let label = format!("Buy {}", instrument);
        let (attempt, snapshot, expected_tokens) = self
            .policy
            .run(&label, move |n| self.buy_attempt(instrument, quote_amount, slippage_bps, n))
            .await?;
        let signature = attempt.signature().map(|s| s.to_string()).unwrap_or_default();

        let wallet = self.submitter.wallet_pubkey();
        let ata = get_associated_token_address(&wallet, &instrument.mint);
        let amount_held = match token_balance(self.ledger.as_ref(), &ata).await {
            Ok(balance) if balance > 0 => balance,
            Ok(_) => {
                warn!("Token account {} not visible yet, recording quoted amount", ata);
                expected_tokens
            }
            Err(e) => {
                warn!("Failed to read balance of {}: {}. Recording quoted amount", ata, e);
                expected_tokens
            }
        };

        let entry_price = match self.quotes.get_reserves(&instrument).await {
            Ok(after) => after.price(),
            Err(e) => {
                warn!("Post-buy quote for {} failed: {}. Using pre-trade price", instrument, e);
                snapshot.price()
            }
        };

        let position = Position::new(instrument, entry_price, quote_amount, amount_held, signature);
        self.book.open(position).await
    }

    async fn buy_attempt(
        &self,
        instrument: Instrument,
        quote_amount: u64,
        slippage_bps: u16,
        attempt: u32,
    ) -> Result<(TradeAttempt, ReserveSnapshot, u64), TradeError> {
        let snapshot = self.quotes.get_reserves(&instrument).await?;
        if snapshot.curve.complete {
            return Err(TradeError::NotFound(format!(
                "Bonding curve for {} is complete",
                instrument
            )));
        }

        let expected_tokens = snapshot.expected_tokens_out(quote_amount);
        let request = TradeRequest {
            instrument,
            direction: Direction::Buy,
            amount: quote_amount,
            expected_out: expected_tokens,
            slippage_bps,
            priority_fee: self.fee,
            close_account_when_empty: false,
        };
        let operations = build_trade(&request, &self.submitter.wallet_pubkey())?;

        info!(
            "Buy attempt {} for {}: {} lamports for ~{} tokens (slippage {} bps)",
            attempt, instrument, quote_amount, expected_tokens, slippage_bps
        );
        let trade = self.submitter.submit(Some(request), operations, &self.fee).await?;
        Ok((trade, snapshot, expected_tokens))
    }

    /// Sells `base_amount` raw tokens of `instrument`, capped at the wallet's
    /// balance. Selling the whole balance also closes the token account.
    pub async fn sell(
        &self,
        instrument: Instrument,
        base_amount: u64,
        slippage_bps: u16,
    ) -> Result<TradeAttempt, TradeError> {
        if base_amount == 0 {
            return Err(TradeError::InvalidAmount(format!(
                "Sell amount for {} must be positive",
                instrument
            )));
        }

        let label = format!("Sell {}", instrument);
        let attempt = self
            .policy
            .run(&label, move |n| self.sell_attempt(instrument, base_amount, slippage_bps, n))
            .await?;
        let sold = attempt.request().map_or(0, |request| request.amount);

        match self.book.reduce(&instrument.mint, sold).await {
            Ok(Some(remaining)) => info!(
                "Position on {} reduced to {} tokens",
                instrument, remaining.amount_held
            ),
            Ok(None) => info!("Position on {} fully sold", instrument),
            Err(TradeError::PositionNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        Ok(attempt)
    }

    async fn sell_attempt(
        &self,
        instrument: Instrument,
        base_amount: u64,
        slippage_bps: u16,
        attempt: u32,
    ) -> Result<TradeAttempt, TradeError> {
        let wallet = self.submitter.wallet_pubkey();
        let ata = get_associated_token_address(&wallet, &instrument.mint);
        let held = token_balance(self.ledger.as_ref(), &ata).await?;
        if held == 0 {
            return Err(TradeError::NotFound(format!("No {} tokens held in {}", instrument, ata)));
        }
        let amount = if base_amount > held {
            warn!(
                "Asked to sell {} of {} but only {} held, selling balance",
                base_amount, instrument, held
            );
            held
        } else {
            base_amount
        };

        let snapshot = self.quotes.get_reserves(&instrument).await?;
        if snapshot.curve.complete {
            return Err(TradeError::NotFound(format!(
                "Bonding curve for {} is complete",
                instrument
            )));
        }
        let expected_lamports = snapshot.expected_lamports_out(amount);
        let request = TradeRequest {
            instrument,
            direction: Direction::Sell,
            amount,
            expected_out: expected_lamports,
            slippage_bps,
            priority_fee: self.fee,
            close_account_when_empty: amount == held,
        };
        let operations = build_trade(&request, &wallet)?;

        info!(
            "Sell attempt {} for {}: {} tokens for ~{} lamports (slippage {} bps)",
            attempt, instrument, amount, expected_lamports, slippage_bps
        );
        self.submitter.submit(Some(request), operations, &self.fee).await
    }
}

#[async_trait]
impl ExitSeller for TradeOrchestrator {
    async fn sell_position(&self, position: &Position, slippage_bps: u16) -> Result<TradeAttempt, TradeError> {
        self.sell(position.instrument, position.amount_held, slippage_bps).await
    }

    async fn abandon_position(&self, position: &Position) -> Result<(), TradeError> {
        match self.book.close(&position.instrument.mint).await {
            Ok(_) | Err(TradeError::PositionNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solana::wallet::WalletManager;
    use crate::testing::{packed_token_account, sample_curve, FakeLedger, ScriptedStatus};
    use crate::trading::instructions::Operation;
    use rand::{rngs::StdRng, SeedableRng};
    use solana_sdk::{pubkey::Pubkey, signature::Keypair};
    use tokio::time::Duration;

    const SOL_RESERVE: u64 = 30_000_000_000;
    const TOKEN_RESERVE: u64 = 1_000_000_000_000_000;

    struct Harness {
        ledger: Arc<FakeLedger>,
        orchestrator: TradeOrchestrator,
        instrument: Instrument,
        wallet: Pubkey,
    }

    fn harness() -> Harness {
        let ledger = Arc::new(FakeLedger::new());
        let instrument = Instrument::new(Pubkey::new_unique());
        ledger.set_curve(&instrument, sample_curve(SOL_RESERVE, TOKEN_RESERVE));

        let submitter = RelaySubmitter::new(
            ledger.clone(),
            WalletManager::from_keypair(Keypair::new()),
            None,
            Duration::from_millis(100),
        )
        .with_rng(StdRng::seed_from_u64(1));
        let wallet = submitter.wallet_pubkey();

        let orchestrator = TradeOrchestrator::new(
            QuoteSource::new(ledger.clone()),
            Arc::new(submitter),
            PositionBook::in_memory(),
            RetryPolicy::fixed(3, Duration::from_millis(1_000)),
            PriorityFee::default(),
        );
        Harness {
            ledger,
            orchestrator,
            instrument,
            wallet,
        }
    }

    fn hold(h: &Harness, amount: u64) {
        h.ledger.set_account(
            get_associated_token_address(&h.wallet, &h.instrument.mint),
            packed_token_account(&h.instrument.mint, &h.wallet, amount),
        );
    }

    #[tokio::test]
    async fn test_buy_opens_position() {
        let h = harness();

        let position = h.orchestrator.buy(h.instrument, 100_000_000, 500).await.unwrap();

        let expected = sample_curve(SOL_RESERVE, TOKEN_RESERVE).tokens_out_for_sol(100_000_000);
        assert_eq!(position.amount_held, expected);
        assert!((position.entry_price - 0.00003).abs() < 1e-12);
        assert_eq!(h.ledger.submissions(), 1);
        assert_eq!(h.orchestrator.book().get(&h.instrument.mint).await, Some(position));
    }

    #[tokio::test]
    async fn test_buy_records_actual_balance() {
        let h = harness();
        hold(&h, 12_345);

        let position = h.orchestrator.buy(h.instrument, 100_000_000, 500).await.unwrap();
        assert_eq!(position.amount_held, 12_345);
    }

    #[tokio::test]
    async fn test_second_buy_is_rejected_without_submitting() {
        let h = harness();
        h.orchestrator.buy(h.instrument, 100_000_000, 500).await.unwrap();

        let err = h.orchestrator.buy(h.instrument, 100_000_000, 500).await.unwrap_err();
        assert!(matches!(err, TradeError::PositionAlreadyOpen(_)));
        assert_eq!(h.ledger.submissions(), 1);
    }

    #[tokio::test]
    async fn test_buy_in_flight_blocks_concurrent_buy() {
        let h = harness();
        let _slot = h.orchestrator.book().reserve(&h.instrument).await.unwrap();

        let err = h.orchestrator.buy(h.instrument, 100_000_000, 500).await.unwrap_err();
        assert!(matches!(err, TradeError::PositionAlreadyOpen(_)));
        assert_eq!(h.ledger.submissions(), 0);
    }

    #[tokio::test]
    async fn test_failed_buy_releases_slot() {
        let h = harness();
        h.ledger.remove_curve(&h.instrument);
        assert!(h.orchestrator.buy(h.instrument, 100_000_000, 500).await.is_err());

        h.ledger.set_curve(&h.instrument, sample_curve(SOL_RESERVE, TOKEN_RESERVE));
        assert!(h.orchestrator.buy(h.instrument, 100_000_000, 500).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_read_faults_do_not_resubmit_buy() {
        let h = harness();
        h.ledger.fail_next_status_reads(10);

        h.orchestrator.buy(h.instrument, 100_000_000, 500).await.unwrap();

        assert_eq!(h.ledger.submissions(), 1);
        assert!(h.orchestrator.book().get(&h.instrument.mint).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_confirmation_is_not_retried() {
        let h = harness();
        h.ledger.script_statuses([ScriptedStatus::Dropped]);
        h.ledger.fail_height_reads(true);

        let err = h.orchestrator.buy(h.instrument, 100_000_000, 500).await.unwrap_err();

        assert!(matches!(err, TradeError::ConfirmationUnknown(_)));
        assert_eq!(h.ledger.submissions(), 1);
        assert!(h.orchestrator.book().get(&h.instrument.mint).await.is_none());
    }

    #[tokio::test]
    async fn test_sell_on_complete_curve_is_not_found() {
        let h = harness();
        hold(&h, 1_000);
        let mut curve = sample_curve(SOL_RESERVE, TOKEN_RESERVE);
        curve.complete = true;
        h.ledger.set_curve(&h.instrument, curve);

        let err = h.orchestrator.sell(h.instrument, 1_000, 500).await.unwrap_err();
        assert!(matches!(err, TradeError::NotFound(_)));
        assert_eq!(h.ledger.submissions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buy_retries_failed_sends() {
        let h = harness();
        h.ledger.fail_next_sends(2);

        h.orchestrator.buy(h.instrument, 100_000_000, 500).await.unwrap();
        assert_eq!(h.ledger.submissions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buy_exhaustion_surfaces_trade_failed() {
        let h = harness();
        h.ledger.fail_next_sends(10);

        let err = h.orchestrator.buy(h.instrument, 100_000_000, 500).await.unwrap_err();
        match err {
            TradeError::TradeFailed { attempts, ref source } => {
                assert_eq!(attempts, 3);
                assert!(matches!(**source, TradeError::SubmissionFailed(_)));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(h.orchestrator.book().get(&h.instrument.mint).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_execution_failure_is_requoted_and_resubmitted() {
        let h = harness();
        h.ledger.script_statuses([ScriptedStatus::Failed("TooMuchSolRequired".into())]);

        h.orchestrator.buy(h.instrument, 100_000_000, 500).await.unwrap();

        let sent = h.ledger.sent_transactions();
        assert_eq!(sent.len(), 2);
        assert_ne!(sent[0].signatures[0], sent[1].signatures[0]);
    }

    #[tokio::test]
    async fn test_buy_missing_curve_is_not_retried() {
        let h = harness();
        let unknown = Instrument::new(Pubkey::new_unique());

        let err = h.orchestrator.buy(unknown, 100_000_000, 500).await.unwrap_err();
        assert!(matches!(err, TradeError::NotFound(_)));
        assert_eq!(h.ledger.submissions(), 0);
    }

    #[tokio::test]
    async fn test_zero_amounts_fail_fast() {
        let h = harness();
        assert!(matches!(
            h.orchestrator.buy(h.instrument, 0, 500).await,
            Err(TradeError::InvalidAmount(_))
        ));
        assert!(matches!(
            h.orchestrator.sell(h.instrument, 0, 500).await,
            Err(TradeError::InvalidAmount(_))
        ));
    }

    #[tokio::test]
    async fn test_full_sell_closes_account_and_position() {
        let h = harness();
        h.orchestrator.buy(h.instrument, 100_000_000, 500).await.unwrap();
        let held = h.orchestrator.book().get(&h.instrument.mint).await.unwrap().amount_held;
        hold(&h, held);

        let attempt = h.orchestrator.sell(h.instrument, held, 500).await.unwrap();

        assert!(attempt.is_confirmed());
        assert!(matches!(attempt.operations().last(), Some(Operation::CloseAccount { .. })));
        assert!(h.orchestrator.book().get(&h.instrument.mint).await.is_none());
    }

    #[tokio::test]
    async fn test_partial_sell_keeps_account() {
        let h = harness();
        hold(&h, 1_000);
        h.orchestrator
            .book()
            .open(Position::new(h.instrument, 0.00003, 1, 1_000, "sig".into()))
            .await
            .unwrap();

        let attempt = h.orchestrator.sell(h.instrument, 400, 500).await.unwrap();

        assert_eq!(attempt.operations().len(), 1);
        let remaining = h.orchestrator.book().get(&h.instrument.mint).await.unwrap();
        assert_eq!(remaining.amount_held, 600);
    }

    #[tokio::test]
    async fn test_abandon_drops_position_without_trading() {
        let h = harness();
        let position = h.orchestrator.buy(h.instrument, 100_000_000, 500).await.unwrap();

        h.orchestrator.abandon_position(&position).await.unwrap();

        assert!(h.orchestrator.book().get(&h.instrument.mint).await.is_none());
        assert_eq!(h.ledger.submissions(), 1);
    }

    #[tokio::test]
    async fn test_sell_without_balance_is_not_found() {
        let h = harness();
        let err = h.orchestrator.sell(h.instrument, 10, 500).await.unwrap_err();
        assert!(matches!(err, TradeError::NotFound(_)));
    }
}
