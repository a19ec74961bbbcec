//! Alert Core - detection, deduplication, and queueing
//!
//! This module contains the alert pipeline components:
//! - Alert entity and lifecycle state machine
//! - Rolling z-score volatility detection
//! - Chart pattern detection (engulfing, RSI divergence, S/R breaks)
//! - Dedup/rate-limited bounded queue
//! - Engine wiring detectors to the delivery worker

pub mod alert;
pub mod engine;
pub mod patterns;
pub mod queue;
pub mod volatility;

// Re-export commonly used types
pub use alert::{
    Alert, AlertParams, AlertState, ChannelKind, ExecutionRecord, OperatorAction,
    OperatorDecision, PatternKind, Severity,
};
pub use engine::{run_worker, AlertEngine, EngineConfig};
pub use patterns::{rsi, PatternConfig, PatternDetector};
pub use queue::{AlertQueue, QueueConfig, QueueEntry, QueueMetrics};
pub use volatility::{VolatilityConfig, VolatilityDetector};
