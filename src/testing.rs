//! In-memory ledger and fixtures shared by unit tests.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use borsh::BorshSerialize;
use solana_sdk::{
    hash::Hash, program_option::COption, program_pack::Pack, pubkey::Pubkey, signature::Signature,
    transaction::VersionedTransaction,
};
use spl_token::state::{Account as TokenAccount, AccountState};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::TradeError;
use crate::solana::client::{Ledger, TokenAccountInfo};
use crate::trading::pumpfun::{
    BondingCurveState, PumpCreateEvent, ACCOUNT_DISCRIMINATOR_LEN, CREATE_EVENT_DISCRIMINATOR, PUMP_PROGRAM_ID,
};
use crate::trading::quote::Instrument;

/// Blocks a blockhash stays valid for after it is handed out.
pub const BLOCKHASH_VALIDITY: u64 = 150;

/// How a submitted transaction resolves when its status is polled.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedStatus {
    Confirmed,
    Failed(String),
    /// Never lands.
    Dropped,
}

pub struct FakeLedger {
    accounts: Mutex<HashMap<Pubkey, Vec<u8>>>,
    balances: Mutex<HashMap<Pubkey, u64>>,
    fail_reads: AtomicBool,
    fail_height_reads: AtomicBool,
    status_failures: AtomicU32,
    send_failures: AtomicU32,
    poisoned: Mutex<HashSet<Pubkey>>,
    statuses: Mutex<VecDeque<ScriptedStatus>>,
    outcomes: Mutex<HashMap<Signature, ScriptedStatus>>,
    sent: Mutex<Vec<VersionedTransaction>>,
    height: AtomicU64,
    height_step: AtomicU64,
    /// Program transactions, oldest first, with their logs.
    program_transactions: Mutex<Vec<(Signature, Option<Vec<String>>)>>,
}

impl Default for FakeLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeLedger {
    pub fn new() -> Self {
        Self {
            accounts: Mutex::new(HashMap::new()),
            balances: Mutex::new(HashMap::new()),
            fail_reads: AtomicBool::new(false),
            fail_height_reads: AtomicBool::new(false),
            status_failures: AtomicU32::new(0),
            send_failures: AtomicU32::new(0),
            poisoned: Mutex::new(HashSet::new()),
            statuses: Mutex::new(VecDeque::new()),
            outcomes: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            height: AtomicU64::new(1_000),
            height_step: AtomicU64::new(0),
            program_transactions: Mutex::new(Vec::new()),
        }
    }

    pub fn set_account(&self, address: Pubkey, data: Vec<u8>) {
        self.accounts.lock().unwrap().insert(address, data);
    }

    pub fn set_curve(&self, instrument: &Instrument, curve: BondingCurveState) {
        self.set_account(instrument.bonding_curve(), curve_account_data(&curve));
    }

    pub fn remove_curve(&self, instrument: &Instrument) {
        self.accounts.lock().unwrap().remove(&instrument.bonding_curve());
    }

    /// Makes every read fail with a transient error.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Fails the next `count` signature status reads.
    pub fn fail_next_status_reads(&self, count: u32) {
        self.status_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_height_reads(&self, fail: bool) {
        self.fail_height_reads.store(fail, Ordering::SeqCst);
    }

    /// Rejects the next `count` submissions.
    pub fn fail_next_sends(&self, count: u32) {
        self.send_failures.store(count, Ordering::SeqCst);
    }

    /// Rejects every submission that references `account`.
    pub fn poison(&self, account: Pubkey) {
        self.poisoned.lock().unwrap().insert(account);
    }

    /// Queues outcomes for upcoming submissions; unscripted ones confirm.
    pub fn script_statuses(&self, statuses: impl IntoIterator<Item = ScriptedStatus>) {
        self.statuses.lock().unwrap().extend(statuses);
    }

    /// Advances the block height by `step` on every height query.
    pub fn advance_height_by(&self, step: u64) {
        self.height_step.store(step, Ordering::SeqCst);
    }

    /// Records a transaction touching the program; `None` logs stand for a
    /// failed transaction. Returns its signature.
    pub fn record_program_transaction(&self, logs: Option<Vec<String>>) -> Signature {
        let mut transactions = self.program_transactions.lock().unwrap();
        let mut bytes = [0u8; 64];
        bytes[..8].copy_from_slice(&(transactions.len() as u64 + 1).to_le_bytes());
        let signature = Signature::from(bytes);
        transactions.push((signature, logs));
        signature
    }

    pub fn submissions(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn sent_transactions(&self) -> Vec<VersionedTransaction> {
        self.sent.lock().unwrap().clone()
    }

    fn check_reads(&self) -> Result<(), TradeError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(TradeError::TransientRead("injected read fault".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Ledger for FakeLedger {
    async fn get_account_data(&self, address: &Pubkey) -> Result<Option<Vec<u8>>, TradeError> {
        self.check_reads()?;
        Ok(self.accounts.lock().unwrap().get(address).cloned())
    }

    async fn latest_blockhash(&self) -> Result<(Hash, u64), TradeError> {
        self.check_reads()?;
        Ok((Hash::new_unique(), self.height.load(Ordering::SeqCst) + BLOCKHASH_VALIDITY))
    }

    async fn send_transaction(&self, transaction: &VersionedTransaction) -> Result<Signature, TradeError> {
        let pending_failures = self.send_failures.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.send_failures.store(pending_failures - 1, Ordering::SeqCst);
            return Err(TradeError::SubmissionFailed("injected send fault".into()));
        }
        {
            let poisoned = self.poisoned.lock().unwrap();
            if transaction
                .message
                .static_account_keys()
                .iter()
                .any(|key| poisoned.contains(key))
            {
                return Err(TradeError::SubmissionFailed("poisoned account".into()));
            }
        }

        let signature = transaction.signatures[0];
        let outcome = self
            .statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ScriptedStatus::Confirmed);
        self.outcomes.lock().unwrap().insert(signature, outcome);
        self.sent.lock().unwrap().push(transaction.clone());
        Ok(signature)
    }

    async fn signature_status(&self, signature: &Signature) -> Result<Option<Result<(), String>>, TradeError> {
        self.check_reads()?;
        if self
            .status_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TradeError::TransientRead("injected status fault".into()));
        }
        Ok(match self.outcomes.lock().unwrap().get(signature) {
            Some(ScriptedStatus::Confirmed) => Some(Ok(())),
            Some(ScriptedStatus::Failed(reason)) => Some(Err(reason.clone())),
            Some(ScriptedStatus::Dropped) | None => None,
        })
    }

    async fn block_height(&self) -> Result<u64, TradeError> {
        self.check_reads()?;
        if self.fail_height_reads.load(Ordering::SeqCst) {
            return Err(TradeError::TransientRead("injected height fault".into()));
        }
        let step = self.height_step.load(Ordering::SeqCst);
        Ok(self.height.fetch_add(step, Ordering::SeqCst) + step)
    }

    async fn token_accounts_by_owner(&self, owner: &Pubkey) -> Result<Vec<TokenAccountInfo>, TradeError> {
        self.check_reads()?;
        let accounts = self.accounts.lock().unwrap();
        let mut found: Vec<TokenAccountInfo> = accounts
            .iter()
            .filter(|(_, data)| data.len() == TokenAccount::LEN)
            .filter_map(|(address, data)| {
                TokenAccount::unpack(data)
                    .ok()
                    .filter(|state| state.owner == *owner)
                    .map(|state| TokenAccountInfo {
                        address: *address,
                        mint: state.mint,
                        amount: state.amount,
                    })
            })
            .collect();
        found.sort_by_key(|info| info.address);
        Ok(found)
    }

    async fn get_balance(&self, address: &Pubkey) -> Result<u64, TradeError> {
        self.check_reads()?;
        Ok(self.balances.lock().unwrap().get(address).copied().unwrap_or(0))
    }

    async fn recent_signatures(
        &self,
        _address: &Pubkey,
        until: Option<Signature>,
        limit: usize,
    ) -> Result<Vec<Signature>, TradeError> {
        self.check_reads()?;
        Ok(self
            .program_transactions
            .lock()
            .unwrap()
            .iter()
            .rev()
            .map(|(signature, _)| *signature)
            .take_while(|signature| Some(*signature) != until)
            .take(limit)
            .collect())
    }

    async fn transaction_logs(&self, signature: &Signature) -> Result<Option<Vec<String>>, TradeError> {
        self.check_reads()?;
        Ok(self
            .program_transactions
            .lock()
            .unwrap()
            .iter()
            .find(|(candidate, _)| candidate == signature)
            .and_then(|(_, logs)| logs.clone()))
    }
}

/// Packs an initialized SPL token account.
pub fn packed_token_account(mint: &Pubkey, owner: &Pubkey, amount: u64) -> Vec<u8> {
    let state = TokenAccount {
        mint: *mint,
        owner: *owner,
        amount,
        delegate: COption::None,
        state: AccountState::Initialized,
        is_native: COption::None,
        delegated_amount: 0,
        close_authority: COption::None,
    };
    let mut data = vec![0u8; TokenAccount::LEN];
    TokenAccount::pack(state, &mut data).unwrap();
    data
}

/// A live curve with the given virtual reserves.
pub fn sample_curve(sol_reserve: u64, token_reserve: u64) -> BondingCurveState {
    BondingCurveState {
        virtual_token_reserves: token_reserve,
        virtual_sol_reserves: sol_reserve,
        real_token_reserves: token_reserve,
        real_sol_reserves: 0,
        token_total_supply: 1_000_000_000_000_000,
        complete: false,
    }
}

/// Account bytes as the program stores them: discriminator, then state.
pub fn curve_account_data(curve: &BondingCurveState) -> Vec<u8> {
    let mut data = vec![0u8; ACCOUNT_DISCRIMINATOR_LEN];
    data.extend(curve.try_to_vec().unwrap());
    data
}

/// Program logs of a successful token launch carrying `event`.
pub fn create_event_logs(event: &PumpCreateEvent) -> Vec<String> {
    let mut data = CREATE_EVENT_DISCRIMINATOR.to_vec();
    data.extend(event.try_to_vec().unwrap());
    vec![
        format!("Program {} invoke [1]", PUMP_PROGRAM_ID),
        "Program log: Instruction: Create".to_string(),
        format!("Program data: {}", STANDARD.encode(data)),
        format!("Program {} success", PUMP_PROGRAM_ID),
    ]
}
