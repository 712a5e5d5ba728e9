use thiserror::Error;

/// Failure kinds surfaced by the trading components.
///
/// Transient kinds are retried locally by [`crate::trading::retry::RetryPolicy`];
/// everything else propagates to the caller immediately.
#[derive(Debug, Error)]
pub enum TradeError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Transient read error: {0}")]
    TransientRead(String),

    #[error("Submission failed: {0}")]
    SubmissionFailed(String),

    #[error("Execution failed on-chain: {0}")]
    ExecutionFailed(String),

    #[error("Transaction {signature} expired at block height {last_valid_block_height}")]
    Expired {
        signature: String,
        last_valid_block_height: u64,
    },

    /// The chain could not be read long enough to tell whether a sent
    /// transaction landed. Never retried: the first transaction may still land.
    #[error("Confirmation of {0} unknown")]
    ConfirmationUnknown(String),

    #[error("Trade failed after {attempts} attempt(s)")]
    TradeFailed {
        attempts: u32,
        #[source]
        source: Box<TradeError>,
    },

    #[error("Position already open for {0}")]
    PositionAlreadyOpen(String),

    #[error("Position not found: {0}")]
    PositionNotFound(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    /// The relay payload could not be built. Transport failures are `SubmissionFailed`.
    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TradeError {
    /// Network-layer and ledger-state failures that a fresh attempt may cure.
    ///
    /// `ExecutionFailed` is included because every orchestrator attempt
    /// re-quotes before rebuilding; it must never be resent as-is.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TradeError::TransientRead(_)
                | TradeError::SubmissionFailed(_)
                | TradeError::ExecutionFailed(_)
                | TradeError::Expired { .. }
        )
    }

    /// The innermost error of a `TradeFailed` chain.
    pub fn root_cause(&self) -> &TradeError {
        match self {
            TradeError::TradeFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
