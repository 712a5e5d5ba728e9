use async_trait::async_trait;
use solana_account_decoder::UiAccountEncoding;
use solana_client::{
    nonblocking::rpc_client::RpcClient,
    rpc_client::GetConfirmedSignaturesForAddress2Config,
    rpc_config::{
        RpcAccountInfoConfig, RpcProgramAccountsConfig, RpcSendTransactionConfig, RpcTransactionConfig,
    },
    rpc_filter::{Memcmp, RpcFilterType},
};
use solana_sdk::{
    commitment_config::CommitmentConfig,
    hash::Hash,
    program_pack::Pack,
    pubkey::Pubkey,
    signature::Signature,
    transaction::VersionedTransaction,
};
use solana_transaction_status::UiTransactionEncoding;
use spl_token::state::Account as TokenAccount;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::TradeError;

/// Byte offset of the owner field inside an SPL token account.
const TOKEN_ACCOUNT_OWNER_OFFSET: usize = 32;

/// An SPL token account owned by a wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenAccountInfo {
    pub address: Pubkey,
    pub mint: Pubkey,
    pub amount: u64,
}

/// Everything the trading components need from the chain.
///
/// Implemented by [`SolanaClient`] for the real network and by an in-memory
/// fake in tests.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Raw account data, `None` when the account does not exist.
    async fn get_account_data(&self, address: &Pubkey) -> Result<Option<Vec<u8>>, TradeError>;

    /// Latest blockhash and the last block height at which it is valid.
    async fn latest_blockhash(&self) -> Result<(Hash, u64), TradeError>;

    /// Single submission with preflight simulation disabled.
    async fn send_transaction(&self, transaction: &VersionedTransaction) -> Result<Signature, TradeError>;

    /// `None` while unconfirmed; `Some(Err)` when the transaction landed with an error.
    async fn signature_status(&self, signature: &Signature) -> Result<Option<Result<(), String>>, TradeError>;

    async fn block_height(&self) -> Result<u64, TradeError>;

    async fn token_accounts_by_owner(&self, owner: &Pubkey) -> Result<Vec<TokenAccountInfo>, TradeError>;

    async fn get_balance(&self, address: &Pubkey) -> Result<u64, TradeError>;

    /// Signatures of transactions touching `address` that are newer than
    /// `until`, newest first, at most `limit`.
    async fn recent_signatures(
        &self,
        address: &Pubkey,
        until: Option<Signature>,
        limit: usize,
    ) -> Result<Vec<Signature>, TradeError>;

    /// Log messages of a successful transaction; `None` when it failed or
    /// carries no logs.
    async fn transaction_logs(&self, signature: &Signature) -> Result<Option<Vec<String>>, TradeError>;
}

/// Reads the amount out of a packed SPL token account.
pub fn unpack_token_amount(data: &[u8]) -> Option<u64> {
    TokenAccount::unpack(data).ok().map(|account| account.amount)
}

/// Token balance held at `token_account`, zero when the account is absent.
pub async fn token_balance(ledger: &dyn Ledger, token_account: &Pubkey) -> Result<u64, TradeError> {
    match ledger.get_account_data(token_account).await? {
        Some(data) => unpack_token_amount(&data).ok_or_else(|| {
            TradeError::TransientRead(format!("Failed to unpack token account {}", token_account))
        }),
        None => Ok(0),
    }
}

#[derive(Clone)]
pub struct SolanaClient {
    rpc_client: Arc<RpcClient>,
    commitment: CommitmentConfig,
}

impl SolanaClient {
    pub fn new(rpc_url: &str) -> Self {
        let commitment = CommitmentConfig::confirmed();
        info!("Solana RPC client targeting {}", rpc_url);
        Self {
            rpc_client: Arc::new(RpcClient::new_with_commitment(rpc_url.to_string(), commitment)),
            commitment,
        }
    }
}

#[async_trait]
impl Ledger for SolanaClient {
    async fn get_account_data(&self, address: &Pubkey) -> Result<Option<Vec<u8>>, TradeError> {
        let response = self
            .rpc_client
            .get_account_with_commitment(address, self.commitment)
            .await
            .map_err(|e| {
                error!("Failed to get account {}: {:?}", address, e);
                TradeError::TransientRead(format!("Failed to get account {}: {}", address, e))
            })?;
        Ok(response.value.map(|account| account.data))
    }

    async fn latest_blockhash(&self) -> Result<(Hash, u64), TradeError> {
        self.rpc_client
            .get_latest_blockhash_with_commitment(self.commitment)
            .await
            .map_err(|e| TradeError::TransientRead(format!("Failed to fetch blockhash: {}", e)))
    }

    async fn send_transaction(&self, transaction: &VersionedTransaction) -> Result<Signature, TradeError> {
        let config = RpcSendTransactionConfig {
            skip_preflight: true,
            preflight_commitment: None,
            encoding: Some(UiTransactionEncoding::Base64),
            max_retries: Some(0),
            min_context_slot: None,
        };
        let signature = self
            .rpc_client
            .send_transaction_with_config(transaction, config)
            .await
            .map_err(|e| {
                error!("Failed to send transaction: {:?}", e);
                TradeError::SubmissionFailed(format!("Send failed: {}", e))
            })?;
        debug!("Transaction sent with signature: {}", signature);
        Ok(signature)
    }

    async fn signature_status(&self, signature: &Signature) -> Result<Option<Result<(), String>>, TradeError> {
        let response = self
            .rpc_client
            .get_signature_statuses(&[*signature])
            .await
            .map_err(|e| TradeError::TransientRead(format!("Status check failed: {}", e)))?;

        let status = match response.value.into_iter().next().flatten() {
            Some(status) => status,
            None => return Ok(None),
        };

        if let Some(err) = status.err {
            return Ok(Some(Err(format!("{:?}", err))));
        }
        if status.satisfies_commitment(self.commitment) {
            Ok(Some(Ok(())))
        } else {
            Ok(None)
        }
    }

    async fn block_height(&self) -> Result<u64, TradeError> {
        self.rpc_client
            .get_block_height()
            .await
            .map_err(|e| TradeError::TransientRead(format!("Failed to get block height: {}", e)))
    }

    async fn token_accounts_by_owner(&self, owner: &Pubkey) -> Result<Vec<TokenAccountInfo>, TradeError> {
        let config = RpcProgramAccountsConfig {
            filters: Some(vec![
                RpcFilterType::DataSize(TokenAccount::LEN as u64),
                RpcFilterType::Memcmp(Memcmp::new_base58_encoded(
                    TOKEN_ACCOUNT_OWNER_OFFSET,
                    owner.as_ref(),
                )),
            ]),
            account_config: RpcAccountInfoConfig {
                encoding: Some(UiAccountEncoding::Base64),
                commitment: Some(self.commitment),
                ..RpcAccountInfoConfig::default()
            },
            ..RpcProgramAccountsConfig::default()
        };

        let accounts = self
            .rpc_client
            .get_program_accounts_with_config(&spl_token::id(), config)
            .await
            .map_err(|e| {
                TradeError::TransientRead(format!("Failed to list token accounts of {}: {}", owner, e))
            })?;

        Ok(accounts
            .into_iter()
            .filter_map(|(address, account)| {
                TokenAccount::unpack(&account.data)
                    .ok()
                    .map(|state| TokenAccountInfo {
                        address,
                        mint: state.mint,
                        amount: state.amount,
                    })
            })
            .collect())
    }

    async fn get_balance(&self, address: &Pubkey) -> Result<u64, TradeError> {
        self.rpc_client
            .get_balance(address)
            .await
            .map_err(|e| TradeError::TransientRead(format!("Failed to get balance of {}: {}", address, e)))
    }

    async fn recent_signatures(
        &self,
        address: &Pubkey,
        until: Option<Signature>,
        limit: usize,
    ) -> Result<Vec<Signature>, TradeError> {
        let config = GetConfirmedSignaturesForAddress2Config {
            before: None,
            until,
            limit: Some(limit),
            commitment: Some(self.commitment),
        };
        let statuses = self
            .rpc_client
            .get_signatures_for_address_with_config(address, config)
            .await
            .map_err(|e| {
                TradeError::TransientRead(format!("Failed to list signatures for {}: {}", address, e))
            })?;

        Ok(statuses
            .into_iter()
            .filter_map(|status| match Signature::from_str(&status.signature) {
                Ok(signature) => Some(signature),
                Err(e) => {
                    warn!("Skipping malformed signature {}: {}", status.signature, e);
                    None
                }
            })
            .collect())
    }

    async fn transaction_logs(&self, signature: &Signature) -> Result<Option<Vec<String>>, TradeError> {
        let config = RpcTransactionConfig {
            encoding: Some(UiTransactionEncoding::Base64),
            commitment: Some(self.commitment),
            max_supported_transaction_version: Some(0),
        };
        let transaction = self
            .rpc_client
            .get_transaction_with_config(signature, config)
            .await
            .map_err(|e| TradeError::TransientRead(format!("Failed to fetch transaction {}: {}", signature, e)))?;

        let meta = match transaction.transaction.meta {
            Some(meta) if meta.err.is_none() => meta,
            _ => return Ok(None),
        };
        Ok(Option::<Vec<String>>::from(meta.log_messages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{packed_token_account, FakeLedger};

    #[test]
    fn test_unpack_token_amount() {
        let mint = Pubkey::new_unique();
        let owner = Pubkey::new_unique();
        let data = packed_token_account(&mint, &owner, 1_234);
        assert_eq!(unpack_token_amount(&data), Some(1_234));
        assert_eq!(unpack_token_amount(&[0u8; 10]), None);
    }

    #[tokio::test]
    async fn test_token_balance_missing_account_is_zero() {
        let ledger = FakeLedger::new();
        let balance = token_balance(&ledger, &Pubkey::new_unique()).await.unwrap();
        assert_eq!(balance, 0);
    }

    #[tokio::test]
    async fn test_token_balance_reads_amount() {
        let ledger = FakeLedger::new();
        let account = Pubkey::new_unique();
        ledger.set_account(
            account,
            packed_token_account(&Pubkey::new_unique(), &Pubkey::new_unique(), 99),
        );
        assert_eq!(token_balance(&ledger, &account).await.unwrap(), 99);
    }
}
