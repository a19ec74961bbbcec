use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::alert_core::{Alert, AlertEngine};
use crate::audit::AuditSink;
use crate::broker::OrderGateway;

/// A single price tick from the market feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub price: f64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// An aggregated OHLC candle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Candle {
    /// Body size in points (absolute open-to-close distance)
    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }
}

/// Messages pushed to WebSocket clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsMessage {
    Alert(Box<Alert>),
    Connected { symbols: Vec<String> },
    Error { message: String },
}

/// Messages received from WebSocket clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub action: String,
    pub symbol: Option<String>,
}

/// Shared application state for the server
pub struct AppState {
    pub tx: broadcast::Sender<WsMessage>,
    pub engine: AlertEngine,
    pub audit: Arc<dyn AuditSink>,
    pub gateway: Arc<dyn OrderGateway>,
    pub active_symbols: RwLock<HashSet<String>>,
}
