use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use std::sync::Arc;
use tracing::debug;

use crate::error::TradeError;
use crate::solana::client::Ledger;
use crate::trading::pumpfun::{derive_bonding_curve_pda, BondingCurveState, DEFAULT_DECIMALS};

/// A tradable token on the bonding curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instrument {
    #[serde(with = "serde_pubkey")]
    pub mint: Pubkey,
    pub decimals: u8,
}

impl Instrument {
    pub fn new(mint: Pubkey) -> Self {
        Self {
            mint,
            decimals: DEFAULT_DECIMALS,
        }
    }

    pub fn bonding_curve(&self) -> Pubkey {
        derive_bonding_curve_pda(&self.mint).0
    }
}

impl std::fmt::Display for Instrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.mint)
    }
}

/// Base58 strings in persisted JSON.
pub(crate) mod serde_pubkey {
    use serde::{Deserialize, Deserializer, Serializer};
    use solana_sdk::pubkey::Pubkey;

    pub fn serialize<S: Serializer>(key: &Pubkey, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&key.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Pubkey, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse::<Pubkey>().map_err(serde::de::Error::custom)
    }
}

/// Converts a lamports-per-raw-unit price to SOL per whole token, for display.
pub fn sol_per_token(price: f64, decimals: u8) -> f64 {
    price * 10f64.powi(decimals as i32) / 1_000_000_000.0
}

/// Point-in-time reading of a curve's reserves. Superseded, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct ReserveSnapshot {
    pub virtual_base_reserve: u64,
    pub virtual_quote_reserve: u64,
    pub curve: BondingCurveState,
    pub observed_at: DateTime<Utc>,
}

impl ReserveSnapshot {
    pub fn from_curve(curve: BondingCurveState) -> Self {
        Self {
            virtual_base_reserve: curve.virtual_token_reserves,
            virtual_quote_reserve: curve.virtual_sol_reserves,
            curve,
            observed_at: Utc::now(),
        }
    }

    /// Quote units per base unit (lamports per raw token unit).
    /// Never zero-divides: snapshots with an empty base reserve are not constructed.
    pub fn price(&self) -> f64 {
        self.virtual_quote_reserve as f64 / self.virtual_base_reserve as f64
    }

    pub fn expected_tokens_out(&self, lamports_in: u64) -> u64 {
        self.curve.tokens_out_for_sol(lamports_in)
    }

    pub fn expected_lamports_out(&self, tokens_in: u64) -> u64 {
        self.curve.sol_out_for_tokens(tokens_in)
    }
}

/// Reads bonding curve reserves for an instrument.
#[derive(Clone)]
pub struct QuoteSource {
    ledger: Arc<dyn Ledger>,
}

impl QuoteSource {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    pub async fn get_reserves(&self, instrument: &Instrument) -> Result<ReserveSnapshot, TradeError> {
        let bonding_curve = instrument.bonding_curve();
        let data = self
            .ledger
            .get_account_data(&bonding_curve)
            .await?
            .ok_or_else(|| {
                TradeError::NotFound(format!("Bonding curve account not found: {}", instrument.mint))
            })?;

        let curve = BondingCurveState::from_account_data(&data)?;
        if curve.virtual_token_reserves == 0 {
            return Err(TradeError::NotFound(format!(
                "Bonding curve for {} has no base reserve",
                instrument.mint
            )));
        }

        let snapshot = ReserveSnapshot::from_curve(curve);
        debug!(
            "Reserves for {}: {} lamports / {} tokens (complete: {})",
            instrument, snapshot.virtual_quote_reserve, snapshot.virtual_base_reserve, snapshot.curve.complete
        );
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{curve_account_data, sample_curve, FakeLedger};
    use tokio_test::assert_err;

    #[tokio::test]
    async fn test_get_reserves_reads_curve() {
        let ledger = Arc::new(FakeLedger::new());
        let instrument = Instrument::new(Pubkey::new_unique());
        ledger.set_curve(&instrument, sample_curve(30_000_000_000, 1_000_000_000_000_000));

        let quotes = QuoteSource::new(ledger);
        let snapshot = quotes.get_reserves(&instrument).await.unwrap();

        assert_eq!(snapshot.virtual_quote_reserve, 30_000_000_000);
        assert!((snapshot.price() - 0.00003).abs() < 1e-12);
        assert!((sol_per_token(snapshot.price(), 6) - 0.00000003).abs() < 1e-15);
    }

    #[tokio::test]
    async fn test_missing_curve_is_not_found() {
        let quotes = QuoteSource::new(Arc::new(FakeLedger::new()));
        let result = quotes.get_reserves(&Instrument::new(Pubkey::new_unique())).await;
        assert!(matches!(result, Err(TradeError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_zero_base_reserve_is_not_found() {
        let ledger = Arc::new(FakeLedger::new());
        let instrument = Instrument::new(Pubkey::new_unique());
        ledger.set_account(instrument.bonding_curve(), curve_account_data(&sample_curve(30, 0)));

        let result = QuoteSource::new(ledger).get_reserves(&instrument).await;
        assert!(matches!(result, Err(TradeError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_read_fault_is_transient() {
        let ledger = Arc::new(FakeLedger::new());
        ledger.fail_reads(true);

        let result = QuoteSource::new(ledger).get_reserves(&Instrument::new(Pubkey::new_unique())).await;
        let err = assert_err!(result);
        assert!(matches!(err, TradeError::TransientRead(_)));
        assert!(err.is_transient());
    }
}
