//! Alert engine - wires detectors into the queue and drives delivery
//!
//! Ingestion is split in two: ticks feed the volatility detector, candles
//! feed both the volatility detector (via their close) and the pattern
//! checks. Accepted alerts land in the queue; a single background worker
//! drains it into the delivery manager.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::audit::{AlertRecord, AuditRecord, AuditSink};
use crate::delivery::DeliveryManager;
use crate::types::{Candle, Tick};

use super::alert::{Alert, AlertState};
use super::patterns::{rsi, PatternConfig, PatternDetector};
use super::queue::AlertQueue;
use super::volatility::{VolatilityConfig, VolatilityDetector};

/// Configuration for the alert engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub volatility: VolatilityConfig,
    pub patterns: PatternConfig,

    /// Candles retained per symbol for the pattern checks
    pub candle_history: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            volatility: VolatilityConfig::default(),
            patterns: PatternConfig::default(),
            candle_history: 50,
        }
    }
}

/// Runs detectors over incoming market data and feeds the queue
pub struct AlertEngine {
    config: EngineConfig,
    queue: Arc<AlertQueue>,
    volatility: Mutex<VolatilityDetector>,
    patterns: PatternDetector,
    candles: Mutex<HashMap<String, VecDeque<Candle>>>,
}

impl AlertEngine {
    pub fn new(config: EngineConfig, queue: Arc<AlertQueue>) -> Self {
        let volatility = VolatilityDetector::new(config.volatility.clone());
        let patterns = PatternDetector::new(config.patterns.clone());
        Self {
            config,
            queue,
            volatility: Mutex::new(volatility),
            patterns,
            candles: Mutex::new(HashMap::new()),
        }
    }

    /// Feed one tick through the volatility detector.
    ///
    /// Returns whether an alert was produced and accepted by the queue.
    pub async fn on_tick(&self, tick: &Tick) -> bool {
        let alert = self
            .volatility
            .lock()
            .await
            .analyze(&tick.symbol, tick.price, tick.timestamp, None);

        match alert {
            Some(alert) => self.submit(alert).await,
            None => false,
        }
    }

    /// Feed one closed candle through the volatility and pattern checks.
    ///
    /// Returns how many alerts were accepted by the queue.
    pub async fn on_candle(&self, candle: Candle) -> usize {
        let symbol = candle.symbol.clone();
        let timestamp = candle.timestamp;

        let volatility_alert = self.volatility.lock().await.analyze(
            &symbol,
            candle.close,
            timestamp,
            None,
        );

        let window: Vec<Candle> = {
            let mut candles = self.candles.lock().await;
            let history = candles.entry(symbol.clone()).or_default();
            if history.len() == self.config.candle_history {
                history.pop_front();
            }
            history.push_back(candle);
            history.iter().cloned().collect()
        };

        let closes: Vec<f64> = window.iter().map(|c| c.close).collect();
        let rsi_series = rsi(&closes, self.patterns.config().rsi_period);

        let mut accepted = 0;
        for alert in [
            volatility_alert,
            self.patterns.detect_engulfing(&window),
            self.patterns
                .detect_rsi_divergence(&symbol, &closes, &rsi_series, timestamp),
            self.patterns.detect_support_break(&symbol, &closes, timestamp),
            self.patterns
                .detect_resistance_break(&symbol, &closes, timestamp),
        ]
        .into_iter()
        .flatten()
        {
            if self.submit(alert).await {
                accepted += 1;
            }
        }
        accepted
    }

    async fn submit(&self, alert: Alert) -> bool {
        let symbol = alert.symbol.clone();
        let pattern = alert.pattern;
        let accepted = self.queue.enqueue(alert).await;
        if accepted {
            info!("{}: {} alert queued", symbol, pattern);
        } else {
            debug!("{}: {} alert rejected by queue", symbol, pattern);
        }
        accepted
    }

    /// Drop detector and candle state for one symbol
    pub async fn reset_symbol(&self, symbol: &str) {
        self.volatility.lock().await.reset(symbol);
        self.candles.lock().await.remove(symbol);
    }

    pub fn queue(&self) -> &Arc<AlertQueue> {
        &self.queue
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

/// Background consumer: drains the queue into the delivery manager.
///
/// A failed delivery marks the alert and moves on; nothing that happens to
/// one alert can stop the loop. Exits when the queue closes.
pub async fn run_worker(
    queue: Arc<AlertQueue>,
    manager: Arc<DeliveryManager>,
    audit: Arc<dyn AuditSink>,
) {
    info!("alert delivery worker started");

    while let Some(entry) = queue.dequeue().await {
        let mut alert = entry.alert;

        if let Err(e) = alert.transition(AlertState::Delivering) {
            error!("skipping alert {}: {}", alert.id, e);
            continue;
        }
        queue.mark_delivering(alert.id).await;

        let delivered = manager.deliver(&mut alert).await;
        let outcome = if delivered {
            AlertState::Delivered
        } else {
            AlertState::DeliveryFailed
        };
        if let Err(e) = alert.transition(outcome) {
            error!("alert {} outcome transition failed: {}", alert.id, e);
        }
        if !delivered {
            warn!(
                "{}: alert {} primary delivery failed",
                alert.symbol, alert.id
            );
        }

        // The durable record is written even when every channel failed
        if let Err(e) = audit
            .record(AuditRecord::Alert(AlertRecord::from(&alert)))
            .await
        {
            error!("audit write failed for alert {}: {}", alert.id, e);
        }

        queue.finish_delivery(alert.id, delivered).await;
    }

    info!("alert queue closed, worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert_core::queue::QueueConfig;
    use crate::alert_core::{ChannelKind, PatternKind};
    use crate::audit::MemoryAuditSink;
    use crate::delivery::channels::AlertChannel;
    use crate::delivery::DeliveryConfig;
    use anyhow::bail;
    use async_trait::async_trait;
    use chrono::Utc;

    struct OkChannel;

    #[async_trait]
    impl AlertChannel for OkChannel {
        fn kind(&self) -> ChannelKind {
            ChannelKind::Push
        }
        async fn send(&self, _alert: &Alert) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct FailChannel;

    #[async_trait]
    impl AlertChannel for FailChannel {
        fn kind(&self) -> ChannelKind {
            ChannelKind::Push
        }
        async fn send(&self, _alert: &Alert) -> anyhow::Result<()> {
            bail!("push transport down");
        }
    }

    fn engine() -> AlertEngine {
        AlertEngine::new(
            EngineConfig::default(),
            Arc::new(AlertQueue::new(QueueConfig::default())),
        )
    }

    fn candle(symbol: &str, open: f64, close: f64) -> Candle {
        Candle {
            symbol: symbol.to_string(),
            open,
            high: open.max(close) + 0.1,
            low: open.min(close) - 0.1,
            close,
            volume: 100,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_warmup_produces_nothing() {
        let engine = engine();
        for i in 0..10 {
            let tick = Tick {
                symbol: "WINQ26".to_string(),
                price: 130_000.0 + i as f64,
                timestamp: Utc::now(),
            };
            assert!(!engine.on_tick(&tick).await);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_engulfing_candle_enqueues() {
        let engine = engine();

        assert_eq!(engine.on_candle(candle("WINQ26", 90.0, 89.0)).await, 0);
        assert_eq!(engine.on_candle(candle("WINQ26", 88.8, 90.2)).await, 1);

        let entry = engine.queue().dequeue().await.unwrap();
        assert_eq!(entry.alert.pattern, PatternKind::BullishEngulfing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_symbol_clears_candles() {
        let engine = engine();
        engine.on_candle(candle("WINQ26", 90.0, 89.0)).await;
        engine.reset_symbol("WINQ26").await;

        // The engulfing partner candle alone no longer matches
        assert_eq!(engine.on_candle(candle("WINQ26", 88.8, 90.2)).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_delivers_and_audits() {
        let queue = Arc::new(AlertQueue::new(QueueConfig::default()));
        let engine = AlertEngine::new(EngineConfig::default(), queue.clone());
        let audit = Arc::new(MemoryAuditSink::new());
        let manager = Arc::new(DeliveryManager::new(
            DeliveryConfig::default(),
            Arc::new(OkChannel),
            audit.clone(),
        ));

        let worker = tokio::spawn(run_worker(queue.clone(), manager, audit.clone()));

        engine.on_candle(candle("WINQ26", 90.0, 89.0)).await;
        assert_eq!(engine.on_candle(candle("WINQ26", 88.8, 90.2)).await, 1);

        tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;

        let records = audit.records().await;
        let alert_record = records
            .iter()
            .find_map(|r| match r {
                AuditRecord::Alert(a) => Some(a),
                _ => None,
            })
            .expect("alert record written");
        assert_eq!(alert_record.state, AlertState::Delivered);
        assert_eq!(alert_record.delivered_channels, vec![ChannelKind::Push]);

        let metrics = queue.metrics().await;
        assert_eq!(metrics.processed, 1);
        assert_eq!(metrics.failed, 0);

        worker.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_survives_failed_delivery() {
        let queue = Arc::new(AlertQueue::new(QueueConfig::default()));
        let engine = AlertEngine::new(EngineConfig::default(), queue.clone());
        let audit = Arc::new(MemoryAuditSink::new());
        let manager = Arc::new(DeliveryManager::new(
            DeliveryConfig::default(),
            Arc::new(FailChannel),
            audit.clone(),
        ));

        let worker = tokio::spawn(run_worker(queue.clone(), manager, audit.clone()));

        // Two alerts through a failing channel
        engine.on_candle(candle("WINQ26", 90.0, 89.0)).await;
        engine.on_candle(candle("WINQ26", 88.8, 90.2)).await;
        engine.on_candle(candle("WDOQ26", 89.0, 90.0)).await;
        tokio::time::advance(tokio::time::Duration::from_secs(61)).await;
        engine.on_candle(candle("WDOQ26", 90.2, 88.8)).await;

        tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;

        let metrics = queue.metrics().await;
        assert_eq!(metrics.processed, 2, "worker kept consuming after failure");
        assert_eq!(metrics.failed, 2);

        let failed_states: Vec<_> = audit
            .records()
            .await
            .iter()
            .filter_map(|r| match r {
                AuditRecord::Alert(a) => Some(a.state),
                _ => None,
            })
            .collect();
        assert_eq!(failed_states, vec![AlertState::DeliveryFailed; 2]);

        worker.abort();
    }
}
