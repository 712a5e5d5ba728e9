// src/trading/detector.rs
//
// New-token discovery: polls the Pump.fun program's recent transactions and
// decodes the CreateEvent carried in their logs.

use chrono::{DateTime, Utc};
use solana_sdk::{pubkey::Pubkey, signature::Signature};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::error::TradeError;
use crate::solana::client::Ledger;
use crate::trading::pumpfun::{parse_create_event, PUMP_PROGRAM_ID};

const CREATE_INSTRUCTION_LOG: &str = "Program log: Instruction: Create";
const PROGRAM_DATA_PREFIX: &str = "Program data: ";

/// A token launch seen on the program.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenCreationEvent {
    pub mint: Pubkey,
    pub bonding_curve: Pubkey,
    pub creator: Pubkey,
    pub name: String,
    pub symbol: String,
    pub signature: Signature,
    pub detected_at: DateTime<Utc>,
}

/// Extracts launches from one transaction's logs. Only data logged after a
/// Create instruction is considered.
pub fn events_from_logs(signature: &Signature, logs: &[String]) -> Vec<TokenCreationEvent> {
    let mut in_create = false;
    let mut events = Vec::new();
    for log in logs {
        if log.contains(CREATE_INSTRUCTION_LOG) {
            in_create = true;
            continue;
        }
        if !in_create {
            continue;
        }
        if let Some(data) = log.strip_prefix(PROGRAM_DATA_PREFIX) {
            if let Some(event) = parse_create_event(data) {
                events.push(TokenCreationEvent {
                    mint: event.mint,
                    bonding_curve: event.bonding_curve,
                    creator: event.user,
                    name: event.name,
                    symbol: event.symbol,
                    signature: *signature,
                    detected_at: Utc::now(),
                });
            }
        }
    }
    events
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub poll_interval: Duration,
    /// Signatures fetched per poll. Launches beyond it between two polls are missed.
    pub batch_limit: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DetectorStats {
    pub polls: u64,
    pub transactions_scanned: u64,
    pub tokens_detected: u64,
    pub poll_failures: u64,
}

pub struct TokenDetector {
    ledger: Arc<dyn Ledger>,
    config: DetectorConfig,
    last_seen: Option<Signature>,
    stats: DetectorStats,
}

impl TokenDetector {
    pub fn new(ledger: Arc<dyn Ledger>, config: DetectorConfig) -> Self {
        Self {
            ledger,
            config,
            last_seen: None,
            stats: DetectorStats::default(),
        }
    }

    /// Launches since the previous poll, oldest first. The first poll only
    /// anchors the cursor so tokens created before startup are not sniped.
    pub async fn poll(&mut self) -> Result<Vec<TokenCreationEvent>, TradeError> {
        let signatures = self
            .ledger
            .recent_signatures(&PUMP_PROGRAM_ID, self.last_seen, self.config.batch_limit)
            .await?;
        self.stats.polls += 1;

        let newest = match signatures.first() {
            Some(signature) => *signature,
            None => return Ok(Vec::new()),
        };
        let anchoring = self.last_seen.is_none();
        self.last_seen = Some(newest);
        if anchoring {
            info!("Detector anchored at {}", newest);
            return Ok(Vec::new());
        }
        if signatures.len() >= self.config.batch_limit {
            warn!(
                "{} or more program transactions since last poll, older ones skipped",
                self.config.batch_limit
            );
        }

        let mut events = Vec::new();
        for signature in signatures.iter().rev() {
            self.stats.transactions_scanned += 1;
            match self.ledger.transaction_logs(signature).await {
                Ok(Some(logs)) => events.extend(events_from_logs(signature, &logs)),
                Ok(None) => debug!("No logs for {}", signature),
                Err(e) => warn!("Skipping transaction {}: {}", signature, e),
            }
        }
        self.stats.tokens_detected += events.len() as u64;
        Ok(events)
    }

    /// Polls on its own task, forwarding launches until shutdown or until
    /// the receiver goes away.
    pub fn spawn(
        mut self,
        sender: mpsc::Sender<TokenCreationEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<DetectorStats> {
        tokio::spawn(async move {
            info!(
                "Watching {} for new tokens every {:?}",
                PUMP_PROGRAM_ID, self.config.poll_interval
            );
            loop {
                match self.poll().await {
                    Ok(events) => {
                        for event in events {
                            info!(
                                "New token {} ({}) by {} in {}",
                                event.mint, event.symbol, event.creator, event.signature
                            );
                            if sender.send(event).await.is_err() {
                                info!("Event receiver closed, detector stopping");
                                return self.stats;
                            }
                        }
                    }
                    Err(e) => {
                        self.stats.poll_failures += 1;
                        warn!("Detector poll failed: {}", e);
                    }
                }

                tokio::select! {
                    _ = shutdown.recv() => {
                        info!("Detector stopped");
                        break;
                    }
                    _ = sleep(self.config.poll_interval) => {}
                }
            }
            self.stats
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{create_event_logs, FakeLedger};
    use crate::trading::pumpfun::PumpCreateEvent;

    fn launch(symbol: &str) -> PumpCreateEvent {
        PumpCreateEvent {
            name: format!("{} token", symbol),
            symbol: symbol.to_string(),
            uri: String::new(),
            mint: Pubkey::new_unique(),
            bonding_curve: Pubkey::new_unique(),
            user: Pubkey::new_unique(),
        }
    }

    fn detector(ledger: Arc<FakeLedger>) -> TokenDetector {
        TokenDetector::new(
            ledger,
            DetectorConfig {
                poll_interval: Duration::from_millis(500),
                batch_limit: 50,
            },
        )
    }

    #[test]
    fn test_program_data_before_create_is_ignored() {
        let event = launch("EARLY");
        let mut logs = create_event_logs(&event);
        logs.swap(1, 2);

        assert!(events_from_logs(&Signature::default(), &logs).is_empty());
    }

    #[tokio::test]
    async fn test_first_poll_only_anchors() {
        let ledger = Arc::new(FakeLedger::new());
        ledger.record_program_transaction(Some(create_event_logs(&launch("OLD"))));
        let mut detector = detector(ledger.clone());

        assert!(detector.poll().await.unwrap().is_empty());

        let fresh = launch("NEW");
        let signature = ledger.record_program_transaction(Some(create_event_logs(&fresh)));
        let events = detector.poll().await.unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].mint, fresh.mint);
        assert_eq!(events[0].creator, fresh.user);
        assert_eq!(events[0].signature, signature);
    }

    #[tokio::test]
    async fn test_poll_yields_launches_oldest_first() {
        let ledger = Arc::new(FakeLedger::new());
        ledger.record_program_transaction(None);
        let mut detector = detector(ledger.clone());
        detector.poll().await.unwrap();

        let first = launch("ONE");
        let second = launch("TWO");
        ledger.record_program_transaction(Some(create_event_logs(&first)));
        ledger.record_program_transaction(Some(vec!["Program log: Instruction: Buy".to_string()]));
        ledger.record_program_transaction(None);
        ledger.record_program_transaction(Some(create_event_logs(&second)));

        let mints: Vec<Pubkey> = detector.poll().await.unwrap().iter().map(|e| e.mint).collect();
        assert_eq!(mints, vec![first.mint, second.mint]);
        assert!(detector.poll().await.unwrap().is_empty());
        assert_eq!(detector.stats.tokens_detected, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_detector_forwards_and_stops_on_shutdown() {
        let ledger = Arc::new(FakeLedger::new());
        ledger.record_program_transaction(None);
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = detector(ledger.clone()).spawn(event_tx, shutdown_rx);
        sleep(Duration::from_millis(100)).await;

        let token = launch("LIVE");
        ledger.record_program_transaction(Some(create_event_logs(&token)));
        let event = event_rx.recv().await.unwrap();
        assert_eq!(event.mint, token.mint);

        shutdown_tx.send(()).unwrap();
        let stats = handle.await.unwrap();
        assert_eq!(stats.tokens_detected, 1);
        assert!(event_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_faults_are_counted_not_fatal() {
        let ledger = Arc::new(FakeLedger::new());
        ledger.fail_reads(true);
        let (event_tx, _event_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = detector(ledger).spawn(event_tx, shutdown_rx);
        sleep(Duration::from_millis(1_200)).await;
        shutdown_tx.send(()).unwrap();

        let stats = handle.await.unwrap();
        assert!(stats.poll_failures >= 2, "{:?}", stats);
        assert_eq!(stats.polls, 0);
    }
}
