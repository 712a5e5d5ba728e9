use borsh::BorshSerialize;
use solana_sdk::{
    instruction::{AccountMeta, Instruction},
    pubkey::Pubkey,
    system_instruction, system_program, sysvar,
};
use spl_associated_token_account::{
    get_associated_token_address, instruction::create_associated_token_account_idempotent,
};

use crate::error::TradeError;
use crate::trading::pumpfun::{
    derive_bonding_curve_ata, derive_bonding_curve_pda, BUY_DISCRIMINATOR, PUMP_EVENT_AUTHORITY,
    PUMP_FEE_RECIPIENT, PUMP_GLOBAL, PUMP_PROGRAM_ID, SELL_DISCRIMINATOR,
};
use crate::trading::quote::Instrument;
use crate::trading::relay::PriorityFee;

/// Slippage is expressed in basis points of 1/10000.
pub const BPS_DENOMINATOR: u128 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Buy,
    Sell,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Parameters of one trade attempt.
///
/// `amount` is the input side (lamports to spend on a buy, raw tokens to
/// sell); `expected_out` is the quoted output for that input.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeRequest {
    pub instrument: Instrument,
    pub direction: Direction,
    pub amount: u64,
    pub expected_out: u64,
    pub slippage_bps: u16,
    pub priority_fee: PriorityFee,
    /// Close the wallet's token account after a sell that empties it.
    pub close_account_when_empty: bool,
}

/// A single step of a trade; lowered to a Solana instruction at submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Idempotently creates `owner`'s associated token account for `mint`.
    CreateAccount { owner: Pubkey, mint: Pubkey },
    /// Moves tokens from the payer's associated account to `recipient`'s.
    Transfer {
        mint: Pubkey,
        decimals: u8,
        recipient: Pubkey,
        amount: u64,
    },
    /// Closes a payer-owned token account, reclaiming rent to the payer.
    CloseAccount { account: Pubkey },
    Buy {
        mint: Pubkey,
        token_amount: u64,
        max_sol_cost: u64,
    },
    Sell {
        mint: Pubkey,
        token_amount: u64,
        min_sol_output: u64,
    },
    TipTransfer { to: Pubkey, lamports: u64 },
}

#[derive(BorshSerialize)]
struct BuyArgs {
    amount: u64,
    max_sol_cost: u64,
}

#[derive(BorshSerialize)]
struct SellArgs {
    amount: u64,
    min_sol_output: u64,
}

fn anchor_data<T: BorshSerialize>(discriminator: [u8; 8], args: &T) -> Result<Vec<u8>, TradeError> {
    let mut data = discriminator.to_vec();
    let encoded = args
        .try_to_vec()
        .map_err(|e| TradeError::InvalidAmount(format!("Failed to encode instruction args: {}", e)))?;
    data.extend(encoded);
    Ok(data)
}

fn curve_accounts(mint: &Pubkey, user: &Pubkey) -> (Pubkey, Pubkey, Pubkey) {
    let bonding_curve = derive_bonding_curve_pda(mint).0;
    let associated_bonding_curve = derive_bonding_curve_ata(&bonding_curve, mint);
    let associated_user = get_associated_token_address(user, mint);
    (bonding_curve, associated_bonding_curve, associated_user)
}

impl Operation {
    pub fn label(&self) -> &'static str {
        match self {
            Self::CreateAccount { .. } => "create-account",
            Self::Transfer { .. } => "transfer",
            Self::CloseAccount { .. } => "close-account",
            Self::Buy { .. } => "buy",
            Self::Sell { .. } => "sell",
            Self::TipTransfer { .. } => "tip",
        }
    }

    /// Lowers the operation to an instruction executed on behalf of `payer`.
    pub fn to_instruction(&self, payer: &Pubkey) -> Result<Instruction, TradeError> {
        match self {
            Self::CreateAccount { owner, mint } => Ok(create_associated_token_account_idempotent(
                payer,
                owner,
                mint,
                &spl_token::id(),
            )),
            Self::Transfer {
                mint,
                decimals,
                recipient,
                amount,
            } => {
                let source = get_associated_token_address(payer, mint);
                let destination = get_associated_token_address(recipient, mint);
                spl_token::instruction::transfer_checked(
                    &spl_token::id(),
                    &source,
                    mint,
                    &destination,
                    payer,
                    &[],
                    *amount,
                    *decimals,
                )
                .map_err(|e| TradeError::InvalidAmount(format!("Failed to build transfer: {}", e)))
            }
            Self::CloseAccount { account } => {
                spl_token::instruction::close_account(&spl_token::id(), account, payer, payer, &[])
                    .map_err(|e| TradeError::InvalidAmount(format!("Failed to build close: {}", e)))
            }
            Self::Buy {
                mint,
                token_amount,
                max_sol_cost,
            } => {
                let (bonding_curve, associated_bonding_curve, associated_user) = curve_accounts(mint, payer);
                let data = anchor_data(
                    BUY_DISCRIMINATOR,
                    &BuyArgs {
                        amount: *token_amount,
                        max_sol_cost: *max_sol_cost,
                    },
                )?;
                Ok(Instruction {
                    program_id: PUMP_PROGRAM_ID,
                    accounts: vec![
                        AccountMeta::new_readonly(PUMP_GLOBAL, false),
                        AccountMeta::new(PUMP_FEE_RECIPIENT, false),
                        AccountMeta::new_readonly(*mint, false),
                        AccountMeta::new(bonding_curve, false),
                        AccountMeta::new(associated_bonding_curve, false),
                        AccountMeta::new(associated_user, false),
                        AccountMeta::new(*payer, true),
                        AccountMeta::new_readonly(system_program::id(), false),
                        AccountMeta::new_readonly(spl_token::id(), false),
                        AccountMeta::new_readonly(sysvar::rent::id(), false),
                        AccountMeta::new_readonly(PUMP_EVENT_AUTHORITY, false),
                        AccountMeta::new_readonly(PUMP_PROGRAM_ID, false),
                    ],
                    data,
                })
            }
            Self::Sell {
                mint,
                token_amount,
                min_sol_output,
            } => {
                let (bonding_curve, associated_bonding_curve, associated_user) = curve_accounts(mint, payer);
                let data = anchor_data(
                    SELL_DISCRIMINATOR,
                    &SellArgs {
                        amount: *token_amount,
                        min_sol_output: *min_sol_output,
                    },
                )?;
                Ok(Instruction {
                    program_id: PUMP_PROGRAM_ID,
                    accounts: vec![
                        AccountMeta::new_readonly(PUMP_GLOBAL, false),
                        AccountMeta::new(PUMP_FEE_RECIPIENT, false),
                        AccountMeta::new_readonly(*mint, false),
                        AccountMeta::new(bonding_curve, false),
                        AccountMeta::new(associated_bonding_curve, false),
                        AccountMeta::new(associated_user, false),
                        AccountMeta::new(*payer, true),
                        AccountMeta::new_readonly(system_program::id(), false),
                        AccountMeta::new_readonly(spl_associated_token_account::id(), false),
                        AccountMeta::new_readonly(spl_token::id(), false),
                        AccountMeta::new_readonly(PUMP_EVENT_AUTHORITY, false),
                        AccountMeta::new_readonly(PUMP_PROGRAM_ID, false),
                    ],
                    data,
                })
            }
            Self::TipTransfer { to, lamports } => Ok(system_instruction::transfer(payer, to, *lamports)),
        }
    }
}

/// Upper bound for a spend: `amount * (1 + bps/10000)`.
pub fn with_slippage_up(amount: u64, slippage_bps: u16) -> u64 {
    let bound = amount as u128 + amount as u128 * slippage_bps as u128 / BPS_DENOMINATOR;
    bound.min(u64::MAX as u128) as u64
}

/// Lower bound for a receipt: `amount * (1 - bps/10000)`.
pub fn with_slippage_down(amount: u64, slippage_bps: u16) -> u64 {
    let cut = amount as u128 * slippage_bps.min(10_000) as u128 / BPS_DENOMINATOR;
    (amount as u128 - cut) as u64
}

/// Produces the ordered operations for `request`, executed by `wallet`.
pub fn build_trade(request: &TradeRequest, wallet: &Pubkey) -> Result<Vec<Operation>, TradeError> {
    if request.amount == 0 {
        return Err(TradeError::InvalidAmount(format!(
            "{} amount for {} must be positive",
            request.direction, request.instrument
        )));
    }

    let mint = request.instrument.mint;
    match request.direction {
        Direction::Buy => {
            if request.expected_out == 0 {
                return Err(TradeError::InvalidAmount(format!(
                    "{} lamports buys no {} tokens",
                    request.amount, request.instrument
                )));
            }
            Ok(vec![
                Operation::CreateAccount { owner: *wallet, mint },
                Operation::Buy {
                    mint,
                    token_amount: request.expected_out,
                    max_sol_cost: with_slippage_up(request.amount, request.slippage_bps),
                },
            ])
        }
        Direction::Sell => {
            let mut operations = vec![Operation::Sell {
                mint,
                token_amount: request.amount,
                min_sol_output: with_slippage_down(request.expected_out, request.slippage_bps),
            }];
            if request.close_account_when_empty {
                operations.push(Operation::CloseAccount {
                    account: get_associated_token_address(wallet, &mint),
                });
            }
            Ok(operations)
        }
    }
}
