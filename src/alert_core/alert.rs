//! Alert entity and lifecycle state machine

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Chart/volatility pattern that produced an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    ExtremeVolatility,
    BullishEngulfing,
    BearishEngulfing,
    RsiDivergence,
    SupportBreak,
    ResistanceBreak,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExtremeVolatility => "extreme_volatility",
            Self::BullishEngulfing => "bullish_engulfing",
            Self::BearishEngulfing => "bearish_engulfing",
            Self::RsiDivergence => "rsi_divergence",
            Self::SupportBreak => "support_break",
            Self::ResistanceBreak => "resistance_break",
        }
    }
}

impl std::fmt::Display for PatternKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Alert severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "CRITICAL"),
            Self::High => write!(f, "HIGH"),
            Self::Medium => write!(f, "MEDIUM"),
        }
    }
}

/// Delivery channel identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Push,
    Email,
    Sms,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Email => "email",
            Self::Sms => "sms",
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Alert lifecycle state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    /// Created by a detector, not yet queued
    Generated,
    /// Accepted by the queue
    Enqueued,
    /// Rejected at enqueue: fingerprint seen within the dedup TTL
    RejectedDuplicate,
    /// Rejected at enqueue: same pattern kind accepted too recently
    RejectedRateLimited,
    /// Picked up by the consumer, channel sends in flight
    Delivering,
    /// Primary channel delivery succeeded
    Delivered,
    /// Primary channel delivery failed
    DeliveryFailed,
    /// Operator executed the suggested trade
    Executed,
    /// Operator rejected the alert
    Rejected,
    /// Operator let the alert lapse
    TimedOut,
}

impl AlertState {
    /// Check whether a transition to `next` is allowed
    pub fn can_transition(&self, next: AlertState) -> bool {
        use AlertState::*;
        matches!(
            (*self, next),
            (Generated, Enqueued)
                | (Generated, RejectedDuplicate)
                | (Generated, RejectedRateLimited)
                | (Enqueued, Delivering)
                | (Delivering, Delivered)
                | (Delivering, DeliveryFailed)
                | (Delivered, Executed)
                | (Delivered, Rejected)
                | (Delivered, TimedOut)
                | (DeliveryFailed, Executed)
                | (DeliveryFailed, Rejected)
                | (DeliveryFailed, TimedOut)
        )
    }

    /// Check if the state is terminal (no further transitions)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RejectedDuplicate
                | Self::RejectedRateLimited
                | Self::Executed
                | Self::Rejected
                | Self::TimedOut
        )
    }
}

impl std::fmt::Display for AlertState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Generated => "GENERATED",
            Self::Enqueued => "ENQUEUED",
            Self::RejectedDuplicate => "REJECTED_DUPLICATE",
            Self::RejectedRateLimited => "REJECTED_RATE_LIMITED",
            Self::Delivering => "DELIVERING",
            Self::Delivered => "DELIVERED",
            Self::DeliveryFailed => "DELIVERY_FAILED",
            Self::Executed => "EXECUTED",
            Self::Rejected => "REJECTED",
            Self::TimedOut => "TIMED_OUT",
        };
        write!(f, "{}", s)
    }
}

/// What the operator decided to do with a delivered alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorDecision {
    Executed,
    Rejected,
    TimedOut,
}

/// Operator action taken on an alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorAction {
    pub operator_id: String,
    pub decision: OperatorDecision,
    pub timestamp: DateTime<Utc>,
}

/// Broker execution linked to an alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Broker ticket returned by the order gateway
    pub ticket: String,
    /// Realized P&L in points, set when the position closes
    pub realized_pnl: Option<f64>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Inputs for constructing an [`Alert`]
#[derive(Debug, Clone)]
pub struct AlertParams {
    pub symbol: String,
    pub pattern: PatternKind,
    pub severity: Severity,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub entry_min: f64,
    pub entry_max: f64,
    pub stop_loss: f64,
    pub take_profit: Option<f64>,
    pub confidence: f64,
    pub risk_reward: f64,
}

/// A detected trading opportunity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Process-unique identifier, immutable
    pub id: Uuid,

    /// Instrument symbol (e.g. "WINQ26")
    pub symbol: String,

    /// Pattern that fired
    pub pattern: PatternKind,

    /// Severity level
    pub severity: Severity,

    /// Price at detection
    pub price: f64,

    /// Detection timestamp
    pub timestamp: DateTime<Utc>,

    /// Suggested entry band lower bound
    pub entry_min: f64,

    /// Suggested entry band upper bound
    pub entry_max: f64,

    /// Stop loss price
    pub stop_loss: f64,

    /// Take profit price (optional)
    pub take_profit: Option<f64>,

    /// Detector confidence, 0.0-1.0
    pub confidence: f64,

    /// Risk:reward ratio of the suggested trade
    pub risk_reward: f64,

    /// Current lifecycle state
    pub state: AlertState,

    /// Channels that completed delivery for this alert
    pub delivered_channels: Vec<ChannelKind>,

    /// Operator action, if acted upon
    pub operator_action: Option<OperatorAction>,

    /// Broker execution, if executed
    pub execution: Option<ExecutionRecord>,
}

impl Alert {
    /// Construct a new alert, enforcing construction invariants.
    ///
    /// An invalid parameter set is a programming error in the detector, so
    /// the error carries enough context to find the producing call site.
    pub fn new(params: AlertParams) -> Result<Self> {
        if params.entry_min >= params.entry_max {
            bail!(
                "invalid entry band: min {:.2} >= max {:.2}",
                params.entry_min,
                params.entry_max
            );
        }
        if params.price < params.entry_min || params.price > params.entry_max {
            bail!(
                "detection price {:.2} outside entry band [{:.2}, {:.2}]",
                params.price,
                params.entry_min,
                params.entry_max
            );
        }
        if params.stop_loss >= params.entry_min {
            bail!(
                "stop loss {:.2} not below entry band min {:.2}",
                params.stop_loss,
                params.entry_min
            );
        }
        if !(0.0..=1.0).contains(&params.confidence) {
            bail!("confidence {} outside [0.0, 1.0]", params.confidence);
        }

        Ok(Self {
            id: Uuid::new_v4(),
            symbol: params.symbol,
            pattern: params.pattern,
            severity: params.severity,
            price: params.price,
            timestamp: params.timestamp,
            entry_min: params.entry_min,
            entry_max: params.entry_max,
            stop_loss: params.stop_loss,
            take_profit: params.take_profit,
            confidence: params.confidence,
            risk_reward: params.risk_reward,
            state: AlertState::Generated,
            delivered_channels: Vec::new(),
            operator_action: None,
            execution: None,
        })
    }

    /// Advance the lifecycle state machine
    pub fn transition(&mut self, next: AlertState) -> Result<()> {
        if !self.state.can_transition(next) {
            bail!("illegal alert transition {} -> {}", self.state, next);
        }
        self.state = next;
        Ok(())
    }

    /// Record a channel that completed delivery
    pub fn record_delivered_channel(&mut self, channel: ChannelKind) {
        if !self.delivered_channels.contains(&channel) {
            self.delivered_channels.push(channel);
        }
    }

    /// Record the operator's decision; Executed also links the broker ticket
    pub fn record_operator_action(
        &mut self,
        operator_id: &str,
        decision: OperatorDecision,
        ticket: Option<String>,
    ) -> Result<()> {
        let next = match decision {
            OperatorDecision::Executed => AlertState::Executed,
            OperatorDecision::Rejected => AlertState::Rejected,
            OperatorDecision::TimedOut => AlertState::TimedOut,
        };
        self.transition(next)?;

        self.operator_action = Some(OperatorAction {
            operator_id: operator_id.to_string(),
            decision,
            timestamp: Utc::now(),
        });

        if let Some(ticket) = ticket {
            self.execution = Some(ExecutionRecord {
                ticket,
                realized_pnl: None,
                closed_at: None,
            });
        }

        Ok(())
    }

    /// Close out the linked execution with realized P&L
    pub fn close_execution(&mut self, realized_pnl: f64) {
        if let Some(exec) = &mut self.execution {
            exec.realized_pnl = Some(realized_pnl);
            exec.closed_at = Some(Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_params() -> AlertParams {
        AlertParams {
            symbol: "WINQ26".to_string(),
            pattern: PatternKind::ExtremeVolatility,
            severity: Severity::Critical,
            price: 130_000.0,
            timestamp: Utc::now(),
            entry_min: 129_900.0,
            entry_max: 130_100.0,
            stop_loss: 129_500.0,
            take_profit: Some(131_200.0),
            confidence: 0.9,
            risk_reward: 2.4,
        }
    }

    #[test]
    fn test_round_trip_fields() {
        let params = valid_params();
        let alert = Alert::new(params.clone()).unwrap();

        assert_eq!(alert.symbol, params.symbol);
        assert_eq!(alert.pattern, params.pattern);
        assert_eq!(alert.severity, params.severity);
        assert_eq!(alert.price, params.price);
        assert_eq!(alert.timestamp, params.timestamp);
        assert_eq!(alert.entry_min, params.entry_min);
        assert_eq!(alert.entry_max, params.entry_max);
        assert_eq!(alert.stop_loss, params.stop_loss);
        assert_eq!(alert.take_profit, params.take_profit);
        assert_eq!(alert.confidence, params.confidence);
        assert_eq!(alert.risk_reward, params.risk_reward);
        assert_eq!(alert.state, AlertState::Generated);
        assert!(alert.delivered_channels.is_empty());
    }

    #[test]
    fn test_invalid_entry_band() {
        let mut params = valid_params();
        params.entry_min = 130_100.0;
        params.entry_max = 129_900.0;
        assert!(Alert::new(params).is_err());
    }

    #[test]
    fn test_price_outside_band() {
        let mut params = valid_params();
        params.price = 130_200.0;
        assert!(Alert::new(params).is_err());
    }

    #[test]
    fn test_stop_above_entry_min() {
        let mut params = valid_params();
        params.stop_loss = 129_950.0;
        assert!(Alert::new(params).is_err());
    }

    #[test]
    fn test_confidence_out_of_range() {
        let mut params = valid_params();
        params.confidence = 1.2;
        assert!(Alert::new(params).is_err());
    }

    #[test]
    fn test_legal_lifecycle() {
        let mut alert = Alert::new(valid_params()).unwrap();
        alert.transition(AlertState::Enqueued).unwrap();
        alert.transition(AlertState::Delivering).unwrap();
        alert.transition(AlertState::Delivered).unwrap();
        alert
            .record_operator_action("op-1", OperatorDecision::Executed, Some("WIN_1".to_string()))
            .unwrap();

        assert_eq!(alert.state, AlertState::Executed);
        assert!(alert.state.is_terminal());
        assert_eq!(alert.execution.as_ref().unwrap().ticket, "WIN_1");
    }

    #[test]
    fn test_illegal_transitions() {
        let mut alert = Alert::new(valid_params()).unwrap();

        // Cannot deliver before enqueue
        assert!(alert.transition(AlertState::Delivering).is_err());

        alert.transition(AlertState::Enqueued).unwrap();
        // Cannot jump straight to a terminal operator state
        assert!(alert.transition(AlertState::Executed).is_err());

        alert.transition(AlertState::Delivering).unwrap();
        alert.transition(AlertState::DeliveryFailed).unwrap();
        // Failed delivery can still be acted upon
        alert
            .record_operator_action("op-1", OperatorDecision::Rejected, None)
            .unwrap();
        assert_eq!(alert.state, AlertState::Rejected);
    }

    #[test]
    fn test_rejection_states_terminal() {
        let mut alert = Alert::new(valid_params()).unwrap();
        alert.transition(AlertState::RejectedDuplicate).unwrap();
        assert!(alert.state.is_terminal());
        assert!(alert.transition(AlertState::Enqueued).is_err());
    }

    #[test]
    fn test_close_execution() {
        let mut alert = Alert::new(valid_params()).unwrap();
        alert.transition(AlertState::Enqueued).unwrap();
        alert.transition(AlertState::Delivering).unwrap();
        alert.transition(AlertState::Delivered).unwrap();
        alert
            .record_operator_action("op-1", OperatorDecision::Executed, Some("WIN_7".to_string()))
            .unwrap();

        alert.close_execution(350.0);
        let exec = alert.execution.as_ref().unwrap();
        assert_eq!(exec.realized_pnl, Some(350.0));
        assert!(exec.closed_at.is_some());
    }
}
