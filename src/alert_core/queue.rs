//! Alert deduplication queue
//!
//! Sits between the detectors and the delivery manager: collapses
//! near-duplicate detections of the same move, rate-limits each pattern
//! kind, and bounds the backlog so a detector storm cannot flood the
//! delivery channels.

use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use super::alert::{Alert, AlertState, PatternKind};

/// Configuration for the alert queue
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum queued alerts; enqueue fails cleanly when full
    pub capacity: usize,

    /// Minimum seconds between accepted alerts of the same pattern kind
    pub rate_limit_secs: u64,

    /// Seconds a fingerprint blocks re-entry of the same alert content
    pub dedup_ttl_secs: u64,

    /// Seconds between background sweeps of expired fingerprints
    pub sweep_interval_secs: u64,

    /// Concurrent in-delivery alerts above which a warning is logged
    pub delivery_warn_threshold: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            rate_limit_secs: 60,
            dedup_ttl_secs: 120,
            sweep_interval_secs: 30,
            delivery_warn_threshold: 3,
        }
    }
}

/// An accepted alert waiting for the consumer
#[derive(Debug)]
pub struct QueueEntry {
    pub alert: Alert,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
}

/// Running queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueMetrics {
    pub accepted: u64,
    pub duplicate_rejected: u64,
    pub rate_limited_rejected: u64,
    pub processed: u64,
    pub failed: u64,
}

/// Everything mutated during the check-and-insert sequence, under one lock
struct QueueState {
    /// fingerprint -> instant of acceptance
    dedup: HashMap<String, Instant>,
    /// pattern kind -> instant of last accepted alert
    last_accepted: HashMap<PatternKind, Instant>,
    /// alert ids currently with the delivery manager
    in_delivery: HashSet<Uuid>,
    metrics: QueueMetrics,
}

/// Dedup/rate-limited bounded queue feeding the delivery worker
pub struct AlertQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
    tx: mpsc::Sender<QueueEntry>,
    rx: Mutex<mpsc::Receiver<QueueEntry>>,
}

impl AlertQueue {
    pub fn new(config: QueueConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity);
        Self {
            config,
            state: Mutex::new(QueueState {
                dedup: HashMap::new(),
                last_accepted: HashMap::new(),
                in_delivery: HashSet::new(),
                metrics: QueueMetrics::default(),
            }),
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Content fingerprint: symbol, pattern kind, and the price bucketed at
    /// 0.5% relative width, so near-simultaneous detections of the same
    /// move collapse regardless of id or timestamp.
    fn fingerprint(alert: &Alert) -> String {
        let bucket = (alert.price.max(f64::MIN_POSITIVE).ln() / 1.005_f64.ln()).floor() as i64;
        format!("{}:{}:{}", alert.symbol, alert.pattern, bucket)
    }

    /// Offer an alert to the queue.
    ///
    /// Returns `true` when accepted and queued, `false` when rejected as a
    /// duplicate, rate-limited, or on a full queue. The check-and-insert
    /// sequence runs under one lock and never awaits channel I/O.
    pub async fn enqueue(&self, mut alert: Alert) -> bool {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let fingerprint = Self::fingerprint(&alert);

        // Dedup before rate limiting: an identical alert reports as a
        // duplicate even when the rate limiter would also have caught it.
        if let Some(&seen_at) = state.dedup.get(&fingerprint) {
            if now.duration_since(seen_at) < Duration::from_secs(self.config.dedup_ttl_secs) {
                state.metrics.duplicate_rejected += 1;
                let _ = alert.transition(AlertState::RejectedDuplicate);
                debug!("{}: duplicate alert rejected ({})", alert.symbol, fingerprint);
                return false;
            }
            // Expired entry: lazy eviction on lookup
            state.dedup.remove(&fingerprint);
        }

        if let Some(&last) = state.last_accepted.get(&alert.pattern) {
            if now.duration_since(last) < Duration::from_secs(self.config.rate_limit_secs) {
                state.metrics.rate_limited_rejected += 1;
                let _ = alert.transition(AlertState::RejectedRateLimited);
                debug!("{}: {} alert rate-limited", alert.symbol, alert.pattern);
                return false;
            }
        }

        if alert.transition(AlertState::Enqueued).is_err() {
            warn!("{}: alert {} re-offered after leaving Generated", alert.symbol, alert.id);
            return false;
        }

        let pattern = alert.pattern;
        let entry = QueueEntry {
            alert,
            enqueued_at: chrono::Utc::now(),
        };

        match self.tx.try_send(entry) {
            Ok(()) => {
                state.dedup.insert(fingerprint, now);
                state.last_accepted.insert(pattern, now);
                state.metrics.accepted += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(entry)) => {
                warn!(
                    "alert queue full ({} entries), dropping {} alert for {}",
                    self.config.capacity, pattern, entry.alert.symbol
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("alert queue closed, dropping {} alert", pattern);
                false
            }
        }
    }

    /// Wait for the next accepted alert in FIFO order.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn dequeue(&self) -> Option<QueueEntry> {
        self.rx.lock().await.recv().await
    }

    /// Track an alert as handed to the delivery manager
    pub async fn mark_delivering(&self, id: Uuid) {
        let mut state = self.state.lock().await;
        state.in_delivery.insert(id);
        if state.in_delivery.len() > self.config.delivery_warn_threshold {
            warn!(
                "{} alerts concurrently in delivery (threshold {})",
                state.in_delivery.len(),
                self.config.delivery_warn_threshold
            );
        }
    }

    /// Record the delivery outcome for an alert
    pub async fn finish_delivery(&self, id: Uuid, success: bool) {
        let mut state = self.state.lock().await;
        state.in_delivery.remove(&id);
        state.metrics.processed += 1;
        if !success {
            state.metrics.failed += 1;
        }
    }

    /// Number of alerts currently with the delivery manager
    pub async fn delivering_count(&self) -> usize {
        self.state.lock().await.in_delivery.len()
    }

    /// Remove expired dedup fingerprints; returns how many were evicted
    pub async fn sweep_expired(&self) -> usize {
        let mut state = self.state.lock().await;
        let ttl = Duration::from_secs(self.config.dedup_ttl_secs);
        let now = Instant::now();
        let before = state.dedup.len();
        state
            .dedup
            .retain(|_, seen_at| now.duration_since(*seen_at) < ttl);
        before - state.dedup.len()
    }

    /// Periodic sweep loop; run as a background task
    pub async fn sweep_loop(&self) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.sweep_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let evicted = self.sweep_expired().await;
            if evicted > 0 {
                debug!("dedup sweep evicted {} expired fingerprints", evicted);
            }
        }
    }

    /// Snapshot of the running counters
    pub async fn metrics(&self) -> QueueMetrics {
        self.state.lock().await.metrics
    }

    /// Zero the running counters, returning the final snapshot
    pub async fn reset_metrics(&self) -> QueueMetrics {
        let mut state = self.state.lock().await;
        std::mem::take(&mut state.metrics)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert_core::alert::{AlertParams, Severity};

    fn make_alert(pattern: PatternKind, price: f64) -> Alert {
        Alert::new(AlertParams {
            symbol: "WINQ26".to_string(),
            pattern,
            severity: Severity::High,
            price,
            timestamp: chrono::Utc::now(),
            entry_min: price - 50.0,
            entry_max: price + 50.0,
            stop_loss: price - 300.0,
            take_profit: Some(price + 700.0),
            confidence: 0.7,
            risk_reward: 2.5,
        })
        .unwrap()
    }

    fn queue() -> AlertQueue {
        AlertQueue::new(QueueConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_rejected() {
        let q = queue();
        let alert = make_alert(PatternKind::SupportBreak, 130_000.0);

        assert!(q.enqueue(alert.clone()).await);
        assert!(!q.enqueue(alert).await);

        let metrics = q.metrics().await;
        assert_eq!(metrics.accepted, 1);
        assert_eq!(metrics.duplicate_rejected, 1);
        assert_eq!(metrics.rate_limited_rejected, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_kind_rate_limited() {
        let q = queue();

        // Different prices, far enough apart for distinct fingerprints
        assert!(q.enqueue(make_alert(PatternKind::SupportBreak, 130_000.0)).await);
        assert!(!q.enqueue(make_alert(PatternKind::SupportBreak, 140_000.0)).await);

        let metrics = q.metrics().await;
        assert_eq!(metrics.accepted, 1);
        assert_eq!(metrics.rate_limited_rejected, 1);
        assert_eq!(metrics.duplicate_rejected, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_expires() {
        let q = queue();
        assert!(q.enqueue(make_alert(PatternKind::SupportBreak, 130_000.0)).await);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(q.enqueue(make_alert(PatternKind::SupportBreak, 140_000.0)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_kinds_not_rate_limited() {
        let q = queue();
        assert!(q.enqueue(make_alert(PatternKind::SupportBreak, 130_000.0)).await);
        assert!(q.enqueue(make_alert(PatternKind::ExtremeVolatility, 140_000.0)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedup_ttl_expiry_readmits() {
        let q = queue();
        let alert = make_alert(PatternKind::SupportBreak, 130_000.0);

        assert!(q.enqueue(alert.clone()).await);
        tokio::time::advance(Duration::from_secs(121)).await;
        assert!(q.enqueue(alert).await, "expired fingerprint should re-admit");
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_full_rejects_cleanly() {
        let q = AlertQueue::new(QueueConfig {
            capacity: 2,
            ..Default::default()
        });

        assert!(q.enqueue(make_alert(PatternKind::SupportBreak, 130_000.0)).await);
        assert!(q.enqueue(make_alert(PatternKind::ResistanceBreak, 131_000.0)).await);
        assert!(!q.enqueue(make_alert(PatternKind::ExtremeVolatility, 132_000.0)).await);

        let metrics = q.metrics().await;
        assert_eq!(metrics.accepted, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_order() {
        let q = queue();
        let first = make_alert(PatternKind::SupportBreak, 130_000.0);
        let second = make_alert(PatternKind::ExtremeVolatility, 131_000.0);
        let first_id = first.id;
        let second_id = second.id;

        assert!(q.enqueue(first).await);
        assert!(q.enqueue(second).await);

        assert_eq!(q.dequeue().await.unwrap().alert.id, first_id);
        assert_eq!(q.dequeue().await.unwrap().alert.id, second_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueued_state_transition() {
        let q = queue();
        assert!(q.enqueue(make_alert(PatternKind::SupportBreak, 130_000.0)).await);
        let entry = q.dequeue().await.unwrap();
        assert_eq!(entry.alert.state, AlertState::Enqueued);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_tracking() {
        let q = queue();
        let id = Uuid::new_v4();

        q.mark_delivering(id).await;
        assert_eq!(q.delivering_count().await, 1);

        q.finish_delivery(id, true).await;
        assert_eq!(q.delivering_count().await, 0);

        let failed_id = Uuid::new_v4();
        q.mark_delivering(failed_id).await;
        q.finish_delivery(failed_id, false).await;

        let metrics = q.metrics().await;
        assert_eq!(metrics.processed, 2);
        assert_eq!(metrics.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_expired() {
        let q = queue();
        assert!(q.enqueue(make_alert(PatternKind::SupportBreak, 130_000.0)).await);
        assert!(q.enqueue(make_alert(PatternKind::ExtremeVolatility, 135_000.0)).await);

        assert_eq!(q.sweep_expired().await, 0);

        tokio::time::advance(Duration::from_secs(121)).await;
        assert_eq!(q.sweep_expired().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_reset() {
        let q = queue();
        assert!(q.enqueue(make_alert(PatternKind::SupportBreak, 130_000.0)).await);

        let snapshot = q.reset_metrics().await;
        assert_eq!(snapshot.accepted, 1);
        assert_eq!(q.metrics().await, QueueMetrics::default());
    }
}
