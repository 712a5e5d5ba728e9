use anyhow::Result;
use solana_sdk::{
    hash::Hash,
    instruction::Instruction,
    message::{v0, VersionedMessage},
    pubkey::Pubkey,
    signature::Keypair,
    signer::Signer,
    transaction::VersionedTransaction,
};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::error::TradeError;

/// Signing identity of the single wallet this process trades for.
#[derive(Clone)]
pub struct WalletManager {
    keypair: Arc<Keypair>,
}

impl WalletManager {
    pub fn new(private_key_bs58: &str) -> Result<Self> {
        let bytes = bs58::decode(private_key_bs58.trim())
            .into_vec()
            .map_err(|e| {
                error!("Failed to decode base58 private key: {}", e);
                TradeError::Wallet(format!("Invalid private key format: {}", e))
            })?;

        let keypair = Keypair::from_bytes(&bytes).map_err(|e| {
            error!("Failed to create keypair from bytes: {}", e);
            TradeError::Wallet(format!("Invalid private key data: {}", e))
        })?;

        info!("WalletManager initialized. Pubkey: {}", keypair.pubkey());
        Ok(Self::from_keypair(keypair))
    }

    pub fn from_keypair(keypair: Keypair) -> Self {
        Self {
            keypair: Arc::new(keypair),
        }
    }

    pub fn get_public_key(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    /// Compiles `instructions` into a v0 message paid by this wallet and signs it.
    pub fn sign_versioned_transaction(
        &self,
        instructions: &[Instruction],
        recent_blockhash: Hash,
    ) -> Result<VersionedTransaction, TradeError> {
        let message = v0::Message::try_compile(&self.get_public_key(), instructions, &[], recent_blockhash)
            .map_err(|e| TradeError::Wallet(format!("Failed to compile message: {}", e)))?;

        let transaction = VersionedTransaction::try_new(VersionedMessage::V0(message), &[self.keypair.as_ref()])
            .map_err(|e| {
                error!("Failed to sign versioned transaction: {}", e);
                TradeError::Wallet(format!("Signing failed: {}", e))
            })?;

        debug!("Signed versioned transaction with blockhash: {}", recent_blockhash);
        Ok(transaction)
    }
}
