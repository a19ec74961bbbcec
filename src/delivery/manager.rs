//! Channel delivery orchestration
//!
//! The primary push gets exactly one bounded attempt: a stale real-time
//! alert is worth less than a fast failure, and the store-and-forward
//! channels pick up the slack. Secondary and tertiary sends run as spawned
//! tasks with bounded retry and exponential backoff, so they never block
//! the consumer loop.

use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::alert_core::Alert;
use crate::audit::{AuditRecord, AuditSink, DeliveryRecord, DeliveryStatus};

use super::channels::AlertChannel;

/// Retry budget for a store-and-forward channel
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Timeout for each individual attempt
    pub timeout: Duration,

    /// Total attempts before the channel is marked permanently failed
    pub max_attempts: u32,

    /// Backoff before the second attempt; doubles per retry
    pub initial_backoff: Duration,
}

/// Configuration for the delivery manager
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Single-attempt timeout for the real-time push channel
    pub primary_timeout: Duration,

    /// Retry policy for the email channel
    pub secondary: RetryPolicy,

    /// Retry policy for the SMS channel
    pub tertiary: RetryPolicy,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            primary_timeout: Duration::from_millis(500),
            secondary: RetryPolicy {
                timeout: Duration::from_secs(8),
                max_attempts: 3,
                initial_backoff: Duration::from_secs(1),
            },
            tertiary: RetryPolicy {
                timeout: Duration::from_secs(8),
                max_attempts: 2,
                initial_backoff: Duration::from_secs(1),
            },
        }
    }
}

/// Delivers one alert across the configured channels
pub struct DeliveryManager {
    config: DeliveryConfig,
    primary: Arc<dyn AlertChannel>,
    secondary: Option<Arc<dyn AlertChannel>>,
    tertiary: Option<Arc<dyn AlertChannel>>,
    audit: Arc<dyn AuditSink>,
}

impl DeliveryManager {
    pub fn new(
        config: DeliveryConfig,
        primary: Arc<dyn AlertChannel>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            config,
            primary,
            secondary: None,
            tertiary: None,
            audit,
        }
    }

    /// Attach the store-and-forward email channel
    pub fn with_secondary(mut self, channel: Arc<dyn AlertChannel>) -> Self {
        self.secondary = Some(channel);
        self
    }

    /// Attach the optional SMS channel
    pub fn with_tertiary(mut self, channel: Arc<dyn AlertChannel>) -> Self {
        self.tertiary = Some(channel);
        self
    }

    /// Deliver an alert.
    ///
    /// Returns `true` iff the primary channel succeeded. Secondary and
    /// tertiary sends are scheduled as background tasks and tracked only
    /// through the audit sink; the call never raises and never blocks
    /// beyond the primary timeout.
    pub async fn deliver(&self, alert: &mut Alert) -> bool {
        let started = Instant::now();
        let result = timeout(self.config.primary_timeout, self.primary.send(alert)).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let (status, err) = match result {
            Ok(Ok(())) => (DeliveryStatus::Delivered, None),
            Ok(Err(e)) => (DeliveryStatus::Failed, Some(e.to_string())),
            Err(_) => (DeliveryStatus::TimedOut, None),
        };

        let primary_ok = status == DeliveryStatus::Delivered;
        if primary_ok {
            alert.record_delivered_channel(self.primary.kind());
            info!(
                "{}: {} alert pushed in {}ms",
                alert.symbol, alert.pattern, latency_ms
            );
        } else {
            warn!(
                "{}: primary push failed after {}ms ({:?}): {}",
                alert.symbol,
                latency_ms,
                status,
                err.as_deref().unwrap_or("timeout")
            );
        }

        self.record_attempt(alert, self.primary.kind(), status, 1, latency_ms, err)
            .await;

        if let Some(secondary) = &self.secondary {
            Self::spawn_retries(
                alert.clone(),
                secondary.clone(),
                self.config.secondary.clone(),
                self.audit.clone(),
            );
        }

        if let Some(tertiary) = &self.tertiary {
            Self::spawn_retries(
                alert.clone(),
                tertiary.clone(),
                self.config.tertiary.clone(),
                self.audit.clone(),
            );
        }

        primary_ok
    }

    fn spawn_retries(
        alert: Alert,
        channel: Arc<dyn AlertChannel>,
        policy: RetryPolicy,
        audit: Arc<dyn AuditSink>,
    ) {
        tokio::spawn(async move {
            run_retries(alert, channel, policy, audit).await;
        });
    }

    async fn record_attempt(
        &self,
        alert: &Alert,
        channel: crate::alert_core::ChannelKind,
        status: DeliveryStatus,
        attempt: u32,
        latency_ms: u64,
        error: Option<String>,
    ) {
        let record = AuditRecord::Delivery(DeliveryRecord {
            alert_id: alert.id,
            symbol: alert.symbol.clone(),
            channel,
            status,
            attempt,
            latency_ms,
            error,
            timestamp: chrono::Utc::now(),
        });
        if let Err(e) = self.audit.record(record).await {
            error!("audit write failed for alert {}: {}", alert.id, e);
        }
    }
}

/// Bounded-retry send loop for a store-and-forward channel.
///
/// Every attempt outcome is audited; exhausting the budget appends a
/// terminal `RetriesExhausted` record for manual follow-up and returns.
async fn run_retries(
    alert: Alert,
    channel: Arc<dyn AlertChannel>,
    policy: RetryPolicy,
    audit: Arc<dyn AuditSink>,
) {
    let kind = channel.kind();
    let mut backoff = policy.initial_backoff;

    for attempt in 1..=policy.max_attempts {
        let started = Instant::now();
        let result = timeout(policy.timeout, channel.send(&alert)).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let (status, err) = match result {
            Ok(Ok(())) => (DeliveryStatus::Delivered, None),
            Ok(Err(e)) => (DeliveryStatus::Failed, Some(e.to_string())),
            Err(_) => (DeliveryStatus::TimedOut, None),
        };

        let record = AuditRecord::Delivery(DeliveryRecord {
            alert_id: alert.id,
            symbol: alert.symbol.clone(),
            channel: kind,
            status,
            attempt,
            latency_ms,
            error: err.clone(),
            timestamp: chrono::Utc::now(),
        });
        if let Err(e) = audit.record(record).await {
            error!("audit write failed for alert {}: {}", alert.id, e);
        }

        if status == DeliveryStatus::Delivered {
            debug!(
                "{}: {} delivery succeeded on attempt {}",
                alert.symbol, kind, attempt
            );
            return;
        }

        debug!(
            "{}: {} attempt {}/{} failed: {}",
            alert.symbol,
            kind,
            attempt,
            policy.max_attempts,
            err.as_deref().unwrap_or("timeout")
        );

        if attempt < policy.max_attempts {
            sleep(backoff).await;
            backoff *= 2;
        }
    }

    warn!(
        "{}: {} delivery permanently failed after {} attempts, flagged for manual follow-up",
        alert.symbol, kind, policy.max_attempts
    );

    let record = AuditRecord::Delivery(DeliveryRecord {
        alert_id: alert.id,
        symbol: alert.symbol.clone(),
        channel: kind,
        status: DeliveryStatus::RetriesExhausted,
        attempt: policy.max_attempts,
        latency_ms: 0,
        error: Some("retry budget exhausted".to_string()),
        timestamp: chrono::Utc::now(),
    });
    if let Err(e) = audit.record(record).await {
        error!("audit write failed for alert {}: {}", alert.id, e);
    }
}
