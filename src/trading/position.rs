use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::{Arc, Mutex},
};
use tokio::{fs, sync::RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::TradeError;
use crate::trading::quote::Instrument;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub id: String,
    pub instrument: Instrument,
    /// Curve price at entry, lamports per raw token unit.
    pub entry_price: f64,
    pub entry_quote_amount: u64,
    pub amount_held: u64,
    pub opened_at: DateTime<Utc>,
    pub entry_signature: String,
}

impl Position {
    pub fn new(
        instrument: Instrument,
        entry_price: f64,
        entry_quote_amount: u64,
        amount_held: u64,
        entry_signature: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            instrument,
            entry_price,
            entry_quote_amount,
            amount_held,
            opened_at: Utc::now(),
            entry_signature,
        }
    }

    /// Percentage change of `current_price` relative to entry.
    pub fn change_pct(&self, current_price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        (current_price - self.entry_price) / self.entry_price * 100.0
    }
}

/// Open positions keyed by mint; at most one per instrument.
#[derive(Clone)]
pub struct PositionBook {
    positions: Arc<RwLock<HashMap<Pubkey, Position>>>,
    /// Mints with a buy in flight.
    pending: Arc<Mutex<HashSet<Pubkey>>>,
    persistence_path: Option<PathBuf>,
}

/// Holds an instrument's slot in the book while its buy is in flight.
/// Dropping it releases the slot.
#[derive(Debug)]
pub struct BuySlot {
    mint: Pubkey,
    pending: Arc<Mutex<HashSet<Pubkey>>>,
}

impl Drop for BuySlot {
    fn drop(&mut self) {
        let mut pending = self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        pending.remove(&self.mint);
    }
}

impl PositionBook {
    pub fn new(persistence_path: Option<PathBuf>) -> Self {
        Self {
            positions: Arc::new(RwLock::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashSet::new())),
            persistence_path,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(None)
    }

    // --- Persistence ---

    pub async fn load(&self) -> Result<usize> {
        let path = match &self.persistence_path {
            Some(path) => path,
            None => return Ok(0),
        };
        if !path.exists() {
            info!("Positions file not found at {:?}, starting fresh.", path);
            return Ok(0);
        }

        let data = fs::read_to_string(path)
            .await
            .context(format!("Failed to read positions file: {:?}", path))?;
        if data.trim().is_empty() {
            return Ok(0);
        }

        let loaded: Vec<Position> =
            serde_json::from_str(&data).context("Failed to deserialize positions data")?;

        let mut positions = self.positions.write().await;
        positions.clear();
        for position in loaded {
            positions.insert(position.instrument.mint, position);
        }
        info!("Loaded {} open positions from {:?}", positions.len(), path);
        Ok(positions.len())
    }

    pub async fn save(&self) -> Result<()> {
        let path = match &self.persistence_path {
            Some(path) => path,
            None => return Ok(()),
        };
        let snapshot: Vec<Position> = self.positions.read().await.values().cloned().collect();

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await.context("Failed to create data directory")?;
        }
        let data = serde_json::to_string_pretty(&snapshot).context("Failed to serialize positions")?;
        fs::write(path, data)
            .await
            .context(format!("Failed to write positions file: {:?}", path))?;
        debug!("Saved {} positions to {:?}", snapshot.len(), path);
        Ok(())
    }

    async fn persist(&self) {
        if let Err(e) = self.save().await {
            warn!("Failed to persist positions: {:#}", e);
        }
    }

    // --- Book keeping ---

    /// Claims the instrument for a buy. Fails while a position is open or
    /// another buy holds the slot.
    pub async fn reserve(&self, instrument: &Instrument) -> Result<BuySlot, TradeError> {
        let positions = self.positions.read().await;
        let mut pending = self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if positions.contains_key(&instrument.mint) || !pending.insert(instrument.mint) {
            return Err(TradeError::PositionAlreadyOpen(instrument.to_string()));
        }
        Ok(BuySlot {
            mint: instrument.mint,
            pending: self.pending.clone(),
        })
    }

    pub async fn open(&self, position: Position) -> Result<Position, TradeError> {
        {
            let mut positions = self.positions.write().await;
            if positions.contains_key(&position.instrument.mint) {
                return Err(TradeError::PositionAlreadyOpen(position.instrument.to_string()));
            }
            positions.insert(position.instrument.mint, position.clone());
        }
        info!(
            "Opened position {} on {}: {} tokens at {:.12} lamports/unit",
            position.id, position.instrument, position.amount_held, position.entry_price
        );
        self.persist().await;
        Ok(position)
    }

    pub async fn get(&self, mint: &Pubkey) -> Option<Position> {
        self.positions.read().await.get(mint).cloned()
    }

    pub async fn all(&self) -> Vec<Position> {
        self.positions.read().await.values().cloned().collect()
    }

    /// Records a sale of `sold` tokens. Returns the remaining position, or
    /// `None` once nothing is held and the position is closed.
    pub async fn reduce(&self, mint: &Pubkey, sold: u64) -> Result<Option<Position>, TradeError> {
        let remaining = {
            let mut positions = self.positions.write().await;
            let position = positions
                .get_mut(mint)
                .ok_or_else(|| TradeError::PositionNotFound(mint.to_string()))?;
            position.amount_held = position.amount_held.saturating_sub(sold);
            if position.amount_held == 0 {
                positions.remove(mint);
                info!("Closed position on {}", mint);
                None
            } else {
                Some(position.clone())
            }
        };
        self.persist().await;
        Ok(remaining)
    }

    /// Drops the position without trading, e.g. when selling was abandoned.
    pub async fn close(&self, mint: &Pubkey) -> Result<Position, TradeError> {
        let removed = self
            .positions
            .write()
            .await
            .remove(mint)
            .ok_or_else(|| TradeError::PositionNotFound(mint.to_string()))?;
        info!("Removed position {} on {}", removed.id, mint);
        self.persist().await;
        Ok(removed)
    }
}
