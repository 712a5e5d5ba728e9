// src/trading/pumpfun.rs
//
// Pump.fun bonding curve program: addresses, account layout and the
// constant-product math used to derive expected trade outputs.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use borsh::{BorshDeserialize, BorshSerialize};
use solana_sdk::{pubkey, pubkey::Pubkey};
use tracing::{debug, warn};

use crate::error::TradeError;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Pump.fun Program ID
pub const PUMP_PROGRAM_ID: Pubkey = pubkey!("6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M5uBEwF6P");

/// Program-wide global state account
pub const PUMP_GLOBAL: Pubkey = pubkey!("4wTVyMKBvC6P4p58Prv7SzaLxe89nJ641PzN4331vX78");

/// Receives the protocol trade fee
pub const PUMP_FEE_RECIPIENT: Pubkey = pubkey!("CebN5WGQ4jvEPvsVU4EoHEpgzq1VV7AbicfhtW4xC9iM");

/// Anchor event authority PDA of the program
pub const PUMP_EVENT_AUTHORITY: Pubkey = pubkey!("Ce6TQqeHC9p8KBAZvYtSAsvS6J2fXmzkm1Yw2XJ1f3R7");

/// Bonding curve seed for PDA derivation
pub const BONDING_CURVE_SEED: &[u8] = b"bonding-curve";

/// Anchor instruction discriminators
pub const BUY_DISCRIMINATOR: [u8; 8] = [102, 6, 61, 18, 1, 218, 235, 234];
pub const SELL_DISCRIMINATOR: [u8; 8] = [51, 230, 133, 164, 1, 127, 131, 210];

/// Anchor event discriminator of `CreateEvent`, emitted when a token launches
pub const CREATE_EVENT_DISCRIMINATOR: [u8; 8] = [27, 114, 169, 77, 222, 235, 99, 118];

/// Length of the Anchor account discriminator preceding account state
pub const ACCOUNT_DISCRIMINATOR_LEN: usize = 8;

/// Default token decimals for Pump.fun tokens
pub const DEFAULT_DECIMALS: u8 = 6;

/// Protocol fee charged on every curve trade, in basis points
pub const PUMP_FEE_BPS: u64 = 100;

const BPS_DENOMINATOR: u128 = 10_000;

// ============================================================================
// BONDING CURVE STATE
// ============================================================================

/// The on-chain state of a Pump.fun bonding curve account.
#[derive(BorshDeserialize, BorshSerialize, Debug, Clone, PartialEq, Eq)]
pub struct BondingCurveState {
    /// Virtual token reserves (for price calculation via constant product)
    pub virtual_token_reserves: u64,
    /// Virtual SOL reserves (for price calculation via constant product)
    pub virtual_sol_reserves: u64,
    /// Real token reserves (actual tokens remaining in curve)
    pub real_token_reserves: u64,
    /// Real SOL reserves (actual SOL deposited in curve)
    pub real_sol_reserves: u64,
    /// Total token supply
    pub token_total_supply: u64,
    /// Whether the token has graduated (bonding curve complete)
    pub complete: bool,
}

impl BondingCurveState {
    /// Parses raw account data. Trailing fields added by newer program
    /// versions are ignored.
    pub fn from_account_data(data: &[u8]) -> Result<Self, TradeError> {
        if data.len() <= ACCOUNT_DISCRIMINATOR_LEN {
            return Err(TradeError::TransientRead(format!(
                "Bonding curve account too short: {} bytes",
                data.len()
            )));
        }
        let mut body = &data[ACCOUNT_DISCRIMINATOR_LEN..];
        BondingCurveState::deserialize(&mut body)
            .map_err(|e| TradeError::TransientRead(format!("Failed to decode bonding curve: {}", e)))
    }

    /// Tokens received for spending `sol_in` lamports, fee included in `sol_in`.
    ///
    /// Constant product over the virtual reserves, capped by the real token
    /// reserves still held by the curve.
    pub fn tokens_out_for_sol(&self, sol_in: u64) -> u64 {
        if sol_in == 0 || self.virtual_token_reserves == 0 {
            return 0;
        }
        let sol_after_fee =
            sol_in as u128 * BPS_DENOMINATOR / (BPS_DENOMINATOR + PUMP_FEE_BPS as u128);
        let vs = self.virtual_sol_reserves as u128;
        let vt = self.virtual_token_reserves as u128;
        let tokens = vt * sol_after_fee / (vs + sol_after_fee);
        (tokens as u64).min(self.real_token_reserves)
    }

    /// Lamports received for selling `tokens_in`, net of the protocol fee.
    pub fn sol_out_for_tokens(&self, tokens_in: u64) -> u64 {
        if tokens_in == 0 || self.virtual_token_reserves == 0 {
            return 0;
        }
        let vs = self.virtual_sol_reserves as u128;
        let vt = self.virtual_token_reserves as u128;
        let gross = vs * tokens_in as u128 / (vt + tokens_in as u128);
        let fee = gross * PUMP_FEE_BPS as u128 / BPS_DENOMINATOR;
        (gross - fee) as u64
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// Emitted by the program when a new token is created. Carried base64 in a
/// "Program data:" log line, behind [`CREATE_EVENT_DISCRIMINATOR`].
#[derive(BorshDeserialize, BorshSerialize, Debug, Clone, PartialEq, Eq)]
pub struct PumpCreateEvent {
    pub name: String,
    pub symbol: String,
    pub uri: String,
    pub mint: Pubkey,
    pub bonding_curve: Pubkey,
    /// The creator (dev) wallet
    pub user: Pubkey,
}

/// Decodes a "Program data:" payload. `None` for any other event kind.
pub fn parse_create_event(base64_data: &str) -> Option<PumpCreateEvent> {
    let data = match STANDARD.decode(base64_data.trim()) {
        Ok(d) => d,
        Err(e) => {
            debug!("Failed to decode program data: {:?}", e);
            return None;
        }
    };
    if data.len() <= CREATE_EVENT_DISCRIMINATOR.len() || data[..8] != CREATE_EVENT_DISCRIMINATOR {
        return None;
    }
    // Newer program versions append fields after the ones read here.
    let mut body = &data[8..];
    match PumpCreateEvent::deserialize(&mut body) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!("Create event matched but failed to decode: {:?}", e);
            None
        }
    }
}

// ============================================================================
// PDA DERIVATION FUNCTIONS
// ============================================================================

/// Derive the bonding curve PDA from a token mint.
/// Returns (PDA pubkey, bump seed).
pub fn derive_bonding_curve_pda(mint: &Pubkey) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[BONDING_CURVE_SEED, mint.as_ref()], &PUMP_PROGRAM_ID)
}

/// Derive the associated token account for the bonding curve.
/// This is where the tokens are held before being sold.
pub fn derive_bonding_curve_ata(bonding_curve: &Pubkey, mint: &Pubkey) -> Pubkey {
    spl_associated_token_account::get_associated_token_address(bonding_curve, mint)
}

// ============================================================================
// TESTS
// ============================================================================
