//! Append-only audit log
//!
//! Every alert, delivery attempt, and operator action lands here exactly
//! once. Records are never updated or deleted; the file sink writes one
//! JSON line per record and the query path re-reads the file, so a crash
//! can lose at most the line being written.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::alert_core::{
    Alert, AlertState, ChannelKind, ExecutionRecord, OperatorAction, OperatorDecision,
    PatternKind, Severity,
};

/// Outcome of a single channel delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    Failed,
    TimedOut,
    /// All attempts for the channel exhausted; needs manual follow-up
    RetriesExhausted,
}

/// Durable snapshot of an alert at the end of its queue/delivery lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub alert_id: Uuid,
    pub symbol: String,
    pub pattern: PatternKind,
    pub severity: Severity,
    pub detected_at: DateTime<Utc>,
    pub price: f64,
    pub entry_min: f64,
    pub entry_max: f64,
    pub stop_loss: f64,
    pub take_profit: Option<f64>,
    pub confidence: f64,
    pub risk_reward: f64,
    pub state: AlertState,
    pub delivered_channels: Vec<ChannelKind>,
    pub operator_action: Option<OperatorAction>,
    pub execution: Option<ExecutionRecord>,
    pub recorded_at: DateTime<Utc>,
}

impl From<&Alert> for AlertRecord {
    fn from(alert: &Alert) -> Self {
        Self {
            alert_id: alert.id,
            symbol: alert.symbol.clone(),
            pattern: alert.pattern,
            severity: alert.severity,
            detected_at: alert.timestamp,
            price: alert.price,
            entry_min: alert.entry_min,
            entry_max: alert.entry_max,
            stop_loss: alert.stop_loss,
            take_profit: alert.take_profit,
            confidence: alert.confidence,
            risk_reward: alert.risk_reward,
            state: alert.state,
            delivered_channels: alert.delivered_channels.clone(),
            operator_action: alert.operator_action.clone(),
            execution: alert.execution.clone(),
            recorded_at: Utc::now(),
        }
    }
}

/// One channel delivery attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub alert_id: Uuid,
    pub symbol: String,
    pub channel: ChannelKind,
    pub status: DeliveryStatus,
    /// 1-based attempt number within the channel's retry budget
    pub attempt: u32,
    pub latency_ms: u64,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// An operator acting on a delivered alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorActionRecord {
    pub alert_id: Uuid,
    pub symbol: String,
    pub operator_id: String,
    pub decision: OperatorDecision,
    pub ticket: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum AuditRecord {
    Alert(AlertRecord),
    Delivery(DeliveryRecord),
    OperatorAction(OperatorActionRecord),
}

impl AuditRecord {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Alert(r) => r.recorded_at,
            Self::Delivery(r) => r.timestamp,
            Self::OperatorAction(r) => r.timestamp,
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            Self::Alert(r) => &r.symbol,
            Self::Delivery(r) => &r.symbol,
            Self::OperatorAction(r) => &r.symbol,
        }
    }
}

/// Append-only writer for audit records
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> Result<()>;

    /// Records within `[from, to]`, optionally restricted to one symbol
    async fn query(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        symbol: Option<&str>,
    ) -> Result<Vec<AuditRecord>>;
}

/// JSONL file sink, one record per line, flushed per write
pub struct JsonlAuditSink {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl JsonlAuditSink {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening audit log {}", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<()> {
        let line = serde_json::to_string(&record).context("serializing audit record")?;
        let mut file = self.file.lock().await;
        writeln!(file, "{}", line).context("appending audit record")?;
        file.flush().context("flushing audit log")?;
        Ok(())
    }

    async fn query(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        symbol: Option<&str>,
    ) -> Result<Vec<AuditRecord>> {
        // Hold the writer lock so a concurrent append cannot tear a line
        let _file = self.file.lock().await;
        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading audit log {}", self.path.display()))?;

        let mut records = Vec::new();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let record: AuditRecord =
                serde_json::from_str(line).context("parsing audit record")?;
            let ts = record.timestamp();
            if ts < from || ts > to {
                continue;
            }
            if let Some(symbol) = symbol {
                if record.symbol() != symbol {
                    continue;
                }
            }
            records.push(record);
        }
        Ok(records)
    }
}

/// In-memory sink for tests
#[derive(Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<()> {
        self.records.lock().await.push(record);
        Ok(())
    }

    async fn query(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        symbol: Option<&str>,
    ) -> Result<Vec<AuditRecord>> {
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .filter(|r| {
                let ts = r.timestamp();
                ts >= from && ts <= to && symbol.map(|s| r.symbol() == s).unwrap_or(true)
            })
            .cloned()
            .collect())
    }
}
