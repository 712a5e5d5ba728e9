use chrono::{DateTime, Utc};
use rand::{rngs::StdRng, Rng, SeedableRng};
use solana_sdk::{
    compute_budget::ComputeBudgetInstruction, instruction::Instruction, pubkey, pubkey::Pubkey,
    signature::Signature, transaction::VersionedTransaction,
};
use std::sync::{Arc, Mutex};
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use crate::api::jito::JitoClient;
use crate::error::TradeError;
use crate::solana::client::Ledger;
use crate::solana::wallet::WalletManager;
use crate::trading::instructions::{Operation, TradeRequest};

/// Public tip accounts of the block-engine relay.
pub const JITO_TIP_ACCOUNTS: [Pubkey; 8] = [
    pubkey!("Cw8CFyM9FkoMi7K7Crf6HNQqf4uEMzpKw6QNghXLvLkY"),
    pubkey!("DttWaMuVvTiduZRnguLF7jNxTgiMBZ1hyAumKUiL2KRL"),
    pubkey!("96gYZGLnJYVFmbjzopPSU6QiEV5fGqZNyN9nmNhvrZU5"),
    pubkey!("3AVi9Tg9Uo68tJfuvoKvqKNWKkC5wPdSSdeBnizKZ6jT"),
    pubkey!("HFqU5x63VTqvQss8hp11i4wVV8bD44PvwucfZ2bU7gRe"),
    pubkey!("ADaUMid9yfUytqMBgopwjb2DTLSokTSzL1zt6iGPaS49"),
    pubkey!("ADuUkR4vqLUMWXxW9gh6D6L8pMSawimctcNZ5pGwDcEt"),
    pubkey!("DfXygSm4jCyNCybVYYK6DwvWqjKee8pbDmJGcLWNDXjh"),
];

/// Consecutive failed block-height reads tolerated while confirming.
const MAX_HEIGHT_READ_FAILURES: u32 = 10;

/// Fee settings attached to every submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PriorityFee {
    pub unit_limit: u32,
    pub unit_price_micro_lamports: u64,
    /// Lamports transferred to a relay tip account; zero disables the tip.
    pub tip_lamports: u64,
}

impl PriorityFee {
    pub fn compute_budget_instructions(&self) -> Vec<Instruction> {
        let mut instructions = Vec::with_capacity(2);
        if self.unit_limit > 0 {
            instructions.push(ComputeBudgetInstruction::set_compute_unit_limit(self.unit_limit));
        }
        if self.unit_price_micro_lamports > 0 {
            instructions.push(ComputeBudgetInstruction::set_compute_unit_price(
                self.unit_price_micro_lamports,
            ));
        }
        instructions
    }
}

/// Fixed set of tip destinations. Each draw is independent of the last.
#[derive(Debug, Clone)]
pub struct TipAccountPool {
    accounts: Vec<Pubkey>,
}

impl Default for TipAccountPool {
    fn default() -> Self {
        Self {
            accounts: JITO_TIP_ACCOUNTS.to_vec(),
        }
    }
}

impl TipAccountPool {
    pub fn new(accounts: Vec<Pubkey>) -> Result<Self, TradeError> {
        if accounts.is_empty() {
            return Err(TradeError::Config("Tip account pool is empty".to_string()));
        }
        Ok(Self { accounts })
    }

    pub fn choose<R: Rng + ?Sized>(&self, rng: &mut R) -> Pubkey {
        self.accounts[rng.gen_range(0..self.accounts.len())]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Pending,
    Confirmed,
    Failed(String),
}

/// One signed submission. Only the signature (once) and the outcome
/// (pending to terminal, once) change after creation.
#[derive(Debug, Clone)]
pub struct TradeAttempt {
    request: Option<TradeRequest>,
    operations: Vec<Operation>,
    transaction: VersionedTransaction,
    submitted_at: DateTime<Utc>,
    last_valid_block_height: u64,
    signature: Option<Signature>,
    outcome: AttemptOutcome,
}

impl TradeAttempt {
    fn new(
        request: Option<TradeRequest>,
        operations: Vec<Operation>,
        transaction: VersionedTransaction,
        last_valid_block_height: u64,
    ) -> Self {
        Self {
            request,
            operations,
            transaction,
            submitted_at: Utc::now(),
            last_valid_block_height,
            signature: None,
            outcome: AttemptOutcome::Pending,
        }
    }

    fn assign_signature(&mut self, signature: Signature) {
        if self.signature.is_none() {
            self.signature = Some(signature);
        }
    }

    fn resolve(&mut self, outcome: AttemptOutcome) {
        if self.outcome == AttemptOutcome::Pending {
            self.outcome = outcome;
        }
    }

    pub fn request(&self) -> Option<&TradeRequest> {
        self.request.as_ref()
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn transaction(&self) -> &VersionedTransaction {
        &self.transaction
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    pub fn last_valid_block_height(&self) -> u64 {
        self.last_valid_block_height
    }

    pub fn signature(&self) -> Option<Signature> {
        self.signature
    }

    pub fn outcome(&self) -> &AttemptOutcome {
        &self.outcome
    }

    #[cfg(test)]
    pub fn is_confirmed(&self) -> bool {
        self.outcome == AttemptOutcome::Confirmed
    }
}

/// Single-shot submission: one network send per call, no internal retry.
pub struct RelaySubmitter {
    ledger: Arc<dyn Ledger>,
    wallet: WalletManager,
    relay: Option<JitoClient>,
    tips: TipAccountPool,
    rng: Mutex<StdRng>,
    poll_interval: Duration,
}

impl RelaySubmitter {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        wallet: WalletManager,
        relay: Option<JitoClient>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            ledger,
            wallet,
            relay,
            tips: TipAccountPool::default(),
            rng: Mutex::new(StdRng::from_entropy()),
            poll_interval,
        }
    }

    pub fn with_tip_pool(mut self, tips: TipAccountPool) -> Self {
        self.tips = tips;
        self
    }

    #[cfg(test)]
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = Mutex::new(rng);
        self
    }

    pub fn wallet_pubkey(&self) -> Pubkey {
        self.wallet.get_public_key()
    }

    pub fn ledger(&self) -> Arc<dyn Ledger> {
        self.ledger.clone()
    }

    fn choose_tip_account(&self) -> Pubkey {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.tips.choose(&mut *rng)
    }

    /// Builds, signs and sends one transaction carrying `operations`, then
    /// polls until it confirms, fails on-chain, or its blockhash expires.
    pub async fn submit(
        &self,
        request: Option<TradeRequest>,
        operations: Vec<Operation>,
        fee: &PriorityFee,
    ) -> Result<TradeAttempt, TradeError> {
        let payer = self.wallet.get_public_key();
        let (blockhash, last_valid_block_height) = self.ledger.latest_blockhash().await?;

        let mut instructions = fee.compute_budget_instructions();
        for operation in &operations {
            instructions.push(operation.to_instruction(&payer)?);
        }
        if fee.tip_lamports > 0 {
            let tip_account = self.choose_tip_account();
            debug!("Tipping {} lamports to {}", fee.tip_lamports, tip_account);
            let tip = Operation::TipTransfer {
                to: tip_account,
                lamports: fee.tip_lamports,
            };
            instructions.push(tip.to_instruction(&payer)?);
        }

        let transaction = self.wallet.sign_versioned_transaction(&instructions, blockhash)?;
        let mut attempt = TradeAttempt::new(request, operations, transaction, last_valid_block_height);

        let signature = match &self.relay {
            Some(relay) => relay.send_transaction(attempt.transaction()).await?,
            None => self.ledger.send_transaction(attempt.transaction()).await?,
        };
        attempt.assign_signature(signature);
        let labels: Vec<&str> = attempt.operations().iter().map(Operation::label).collect();
        info!(
            "Submitted {} [{}], valid until block {}",
            signature,
            labels.join(", "),
            last_valid_block_height
        );

        self.confirm(&mut attempt, signature).await?;
        Ok(attempt)
    }

    /// Polls until the transaction resolves or the chain passes its last
    /// valid block height. Status read faults alone never end the wait; only
    /// a run of failed height reads does, and then the outcome is unknown.
    async fn confirm(&self, attempt: &mut TradeAttempt, signature: Signature) -> Result<(), TradeError> {
        let mut height_failures = 0;
        loop {
            match self.ledger.signature_status(&signature).await {
                Ok(Some(Ok(()))) => {
                    attempt.resolve(AttemptOutcome::Confirmed);
                    info!("Transaction {} confirmed", signature);
                    return Ok(());
                }
                Ok(Some(Err(reason))) => {
                    attempt.resolve(AttemptOutcome::Failed(reason.clone()));
                    error!("Transaction {} failed on-chain: {}", signature, reason);
                    return Err(TradeError::ExecutionFailed(format!("{}: {}", signature, reason)));
                }
                Ok(None) => {}
                Err(e) => warn!("Status check for {} failed: {}", signature, e),
            }

            match self.ledger.block_height().await {
                Ok(height) if height > attempt.last_valid_block_height() => {
                    let reason = format!("blockhash expired at height {}", height);
                    attempt.resolve(AttemptOutcome::Failed(reason));
                    warn!("Transaction {} expired unconfirmed", signature);
                    return Err(TradeError::Expired {
                        signature: signature.to_string(),
                        last_valid_block_height: attempt.last_valid_block_height(),
                    });
                }
                Ok(_) => height_failures = 0,
                Err(e) => {
                    height_failures += 1;
                    warn!("Block height check failed: {}", e);
                }
            }

            if height_failures >= MAX_HEIGHT_READ_FAILURES {
                error!(
                    "Cannot tell whether {} landed after {} failed height reads; check it before trading again",
                    signature, height_failures
                );
                return Err(TradeError::ConfirmationUnknown(signature.to_string()));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeLedger, ScriptedStatus};
    use solana_sdk::{compute_budget, signature::Keypair, system_program};
    use std::collections::HashMap;

    const FEE: PriorityFee = PriorityFee {
        unit_limit: 200_000,
        unit_price_micro_lamports: 100_000,
        tip_lamports: 10_000,
    };

    fn submitter(ledger: Arc<FakeLedger>) -> RelaySubmitter {
        RelaySubmitter::new(
            ledger,
            WalletManager::from_keypair(Keypair::new()),
            None,
            Duration::from_millis(500),
        )
        .with_rng(StdRng::seed_from_u64(42))
    }

    fn close_op() -> Vec<Operation> {
        vec![Operation::CloseAccount {
            account: Pubkey::new_unique(),
        }]
    }

    fn program_ids(tx: &VersionedTransaction) -> Vec<Pubkey> {
        let keys = tx.message.static_account_keys();
        tx.message
            .instructions()
            .iter()
            .map(|ix| keys[ix.program_id_index as usize])
            .collect()
    }

    #[test]
    fn test_tip_selection_is_uniform() {
        let pool = TipAccountPool::default();
        let mut rng = StdRng::seed_from_u64(7);
        let mut counts: HashMap<Pubkey, u32> = HashMap::new();

        for _ in 0..10_000 {
            *counts.entry(pool.choose(&mut rng)).or_default() += 1;
        }

        assert_eq!(counts.len(), JITO_TIP_ACCOUNTS.len());
        for (account, count) in counts {
            assert!((1_050..=1_450).contains(&count), "{} drawn {} times", account, count);
        }
    }

    #[test]
    fn test_empty_tip_pool_rejected() {
        assert!(TipAccountPool::new(vec![]).is_err());
    }

    #[tokio::test]
    async fn test_submit_assembles_budget_ops_and_tip() {
        let ledger = Arc::new(FakeLedger::new());
        let submitter = submitter(ledger.clone());

        let attempt = submitter.submit(None, close_op(), &FEE).await.unwrap();

        assert!(attempt.is_confirmed());
        assert_eq!(attempt.signature(), Some(attempt.transaction().signatures[0]));

        let programs = program_ids(attempt.transaction());
        assert_eq!(
            programs,
            vec![
                compute_budget::id(),
                compute_budget::id(),
                spl_token::id(),
                system_program::id()
            ]
        );
        let keys = attempt.transaction().message.static_account_keys();
        assert!(keys.iter().any(|key| JITO_TIP_ACCOUNTS.contains(key)));
    }

    #[tokio::test]
    async fn test_each_call_is_exactly_one_submission() {
        let ledger = Arc::new(FakeLedger::new());
        let submitter = submitter(ledger.clone());

        submitter.submit(None, close_op(), &FEE).await.unwrap();
        submitter.submit(None, close_op(), &FEE).await.unwrap();

        assert_eq!(ledger.submissions(), 2);
    }

    #[tokio::test]
    async fn test_zero_tip_omits_transfer() {
        let ledger = Arc::new(FakeLedger::new());
        let fee = PriorityFee {
            tip_lamports: 0,
            ..FEE
        };

        let attempt = submitter(ledger).submit(None, close_op(), &fee).await.unwrap();
        assert!(!program_ids(attempt.transaction()).contains(&system_program::id()));
    }

    #[tokio::test]
    async fn test_onchain_failure_is_execution_failed() {
        let ledger = Arc::new(FakeLedger::new());
        ledger.script_statuses([ScriptedStatus::Failed("slippage exceeded".into())]);

        let err = submitter(ledger.clone()).submit(None, close_op(), &FEE).await.unwrap_err();
        assert!(matches!(err, TradeError::ExecutionFailed(ref msg) if msg.contains("slippage exceeded")));
        assert_eq!(ledger.submissions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlanded_transaction_expires() {
        let ledger = Arc::new(FakeLedger::new());
        ledger.script_statuses([ScriptedStatus::Dropped]);
        ledger.advance_height_by(100);

        let err = submitter(ledger.clone()).submit(None, close_op(), &FEE).await.unwrap_err();
        assert!(matches!(err, TradeError::Expired { .. }));
        assert_eq!(ledger.submissions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_read_faults_keep_polling() {
        let ledger = Arc::new(FakeLedger::new());
        ledger.fail_next_status_reads(25);

        let attempt = submitter(ledger.clone()).submit(None, close_op(), &FEE).await.unwrap();
        assert!(attempt.is_confirmed());
        assert_eq!(ledger.submissions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_height_is_unknown_not_transient() {
        let ledger = Arc::new(FakeLedger::new());
        ledger.script_statuses([ScriptedStatus::Dropped]);
        ledger.fail_height_reads(true);

        let err = submitter(ledger.clone()).submit(None, close_op(), &FEE).await.unwrap_err();
        assert!(matches!(err, TradeError::ConfirmationUnknown(_)));
        assert!(!err.is_transient());
        assert_eq!(ledger.submissions(), 1);
    }

    #[tokio::test]
    async fn test_send_failure_is_submission_failed() {
        let ledger = Arc::new(FakeLedger::new());
        ledger.fail_next_sends(1);

        let err = submitter(ledger.clone()).submit(None, close_op(), &FEE).await.unwrap_err();
        assert!(matches!(err, TradeError::SubmissionFailed(_)));
        assert_eq!(ledger.submissions(), 0);
    }
}
