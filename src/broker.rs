//! Broker order gateway
//!
//! The alert service only needs "fire an order, get a ticket back" when the
//! operator executes a delivered alert. Reconciliation and retry against the
//! broker live outside this system.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// A bracket order request derived from an alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceOrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    /// Volume in contracts
    pub volume: u32,
    pub entry: f64,
    pub stop_loss: f64,
    pub take_profit: Option<f64>,
}

/// Broker confirmation for a placed order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderTicket {
    pub ticket: String,
    pub placed_at: DateTime<Utc>,
}

/// Order gateway collaborator
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn place_order(&self, request: &PlaceOrderRequest) -> Result<OrderTicket>;
}

/// Gateway that fills every order locally and issues sequential tickets
#[derive(Default)]
pub struct SimulatedGateway {
    counter: AtomicU64,
}

impl SimulatedGateway {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderGateway for SimulatedGateway {
    async fn place_order(&self, request: &PlaceOrderRequest) -> Result<OrderTicket> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let ticket = format!("WIN_{}", n);

        info!(
            "simulated order: {} {} x{} @ {:.0} (stop {:.0}, target {})",
            request.side,
            request.symbol,
            request.volume,
            request.entry,
            request.stop_loss,
            request
                .take_profit
                .map(|tp| format!("{:.0}", tp))
                .unwrap_or_else(|| "-".to_string()),
        );

        Ok(OrderTicket {
            ticket,
            placed_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> PlaceOrderRequest {
        PlaceOrderRequest {
            symbol: "WINQ26".to_string(),
            side: OrderSide::Buy,
            volume: 1,
            entry: 130_000.0,
            stop_loss: 129_500.0,
            take_profit: Some(131_200.0),
        }
    }

    #[tokio::test]
    async fn test_sequential_tickets() {
        let gateway = SimulatedGateway::new();

        let first = gateway.place_order(&request()).await.unwrap();
        let second = gateway.place_order(&request()).await.unwrap();

        assert_eq!(first.ticket, "WIN_1");
        assert_eq!(second.ticket, "WIN_2");
    }
}
