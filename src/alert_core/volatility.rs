//! Rolling z-score volatility detection with two-bar confirmation

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, error};

use super::alert::{Alert, AlertParams, PatternKind, Severity};

/// Below this, the window is treated as flat and no z-score is computed
const MIN_STDDEV: f64 = 1e-6;

/// Confidence at exactly the z-score threshold
const BASE_CONFIDENCE: f64 = 0.85;

/// Confidence ceiling for volatility alerts
const MAX_CONFIDENCE: f64 = 0.95;

/// Confidence gained per sigma beyond the threshold
const CONFIDENCE_SLOPE: f64 = 0.05;

/// Configuration for the volatility detector
#[derive(Debug, Clone)]
pub struct VolatilityConfig {
    /// Number of prices in the z-score window
    pub window: usize,

    /// Capacity of the per-symbol rolling price buffer
    pub lookback_bars: usize,

    /// Z-score magnitude required on two consecutive bars
    pub threshold_sigma: f64,
}

impl Default for VolatilityConfig {
    fn default() -> Self {
        Self {
            window: 20,
            lookback_bars: 100,
            threshold_sigma: 2.0,
        }
    }
}

/// Rolling state for one symbol
#[derive(Debug)]
struct SymbolState {
    prices: VecDeque<f64>,
    prev_z: Option<f64>,
}

impl SymbolState {
    fn new(capacity: usize) -> Self {
        Self {
            prices: VecDeque::with_capacity(capacity),
            prev_z: None,
        }
    }

    fn push(&mut self, price: f64, capacity: usize) {
        if self.prices.len() == capacity {
            self.prices.pop_front();
        }
        self.prices.push_back(price);
    }
}

/// Flags abnormal price excursions per symbol using a rolling z-score.
///
/// A single extreme bar is treated as noise; an alert requires the current
/// and previous bar to both breach the threshold.
pub struct VolatilityDetector {
    config: VolatilityConfig,
    states: HashMap<String, SymbolState>,
}

impl VolatilityDetector {
    pub fn new(config: VolatilityConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
        }
    }

    /// Feed one closing price for `symbol`.
    ///
    /// `history` seeds the rolling buffer the first time a symbol is seen,
    /// so a warm feed can start alerting without replaying `window` ticks.
    /// Returns `None` while warming up, on flat windows, and on
    /// unconfirmed single-bar spikes.
    pub fn analyze(
        &mut self,
        symbol: &str,
        close: f64,
        timestamp: DateTime<Utc>,
        history: Option<&[f64]>,
    ) -> Option<Alert> {
        let capacity = self.config.lookback_bars;
        let state = self.states.entry(symbol.to_string()).or_insert_with(|| {
            let mut state = SymbolState::new(capacity);
            if let Some(history) = history {
                let skip = history.len().saturating_sub(capacity);
                for &price in &history[skip..] {
                    state.push(price, capacity);
                }
            }
            state
        });

        state.push(close, capacity);

        if state.prices.len() < self.config.window {
            state.prev_z = None;
            return None;
        }

        let window: Vec<f64> = state
            .prices
            .iter()
            .rev()
            .take(self.config.window)
            .copied()
            .collect();
        let mean = window.iter().sum::<f64>() / window.len() as f64;
        let variance =
            window.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / window.len() as f64;
        let stddev = variance.sqrt();

        if stddev < MIN_STDDEV {
            state.prev_z = None;
            return None;
        }

        let z = (close - mean) / stddev;
        let confirmed = z.abs() > self.config.threshold_sigma
            && state
                .prev_z
                .map(|prev| prev.abs() > self.config.threshold_sigma)
                .unwrap_or(false);
        state.prev_z = Some(z);

        if !confirmed {
            return None;
        }

        debug!(
            "{}: confirmed volatility excursion z={:.2} mean={:.2} stddev={:.2}",
            symbol, z, mean, stddev
        );

        let entry_min = close - 0.25 * stddev;
        let entry_max = close + 0.25 * stddev;
        let stop_loss = entry_min - 1.5 * stddev;
        let take_profit = close + 2.5 * (1.5 * stddev);
        let confidence = (BASE_CONFIDENCE
            + CONFIDENCE_SLOPE * (z.abs() - self.config.threshold_sigma))
            .min(MAX_CONFIDENCE);
        let risk = close - stop_loss;
        let reward = take_profit - close;

        let params = AlertParams {
            symbol: symbol.to_string(),
            pattern: PatternKind::ExtremeVolatility,
            severity: Severity::Critical,
            price: close,
            timestamp,
            entry_min,
            entry_max,
            stop_loss,
            take_profit: Some(take_profit),
            confidence,
            risk_reward: reward / risk,
        };

        match Alert::new(params) {
            Ok(alert) => Some(alert),
            Err(e) => {
                error!("{}: volatility alert construction failed: {}", symbol, e);
                None
            }
        }
    }

    /// Number of buffered prices for a symbol
    pub fn buffered(&self, symbol: &str) -> usize {
        self.states.get(symbol).map(|s| s.prices.len()).unwrap_or(0)
    }

    /// Drop all rolling state for one symbol
    pub fn reset(&mut self, symbol: &str) {
        self.states.remove(symbol);
    }

    pub fn config(&self) -> &VolatilityConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(window: usize) -> VolatilityDetector {
        VolatilityDetector::new(VolatilityConfig {
            window,
            lookback_bars: 100,
            threshold_sigma: 2.0,
        })
    }

    /// Nine alternating prices, one short of a 10-bar window
    fn warmup_prices() -> Vec<f64> {
        vec![10.0, 10.2, 10.0, 10.2, 10.0, 10.2, 10.0, 10.2, 10.0]
    }

    #[test]
    fn test_none_until_window_filled() {
        let mut det = detector(10);
        let now = Utc::now();

        for (i, price) in warmup_prices().iter().enumerate() {
            assert!(
                det.analyze("WINQ26", *price, now, None).is_none(),
                "no signal expected at sample {}",
                i
            );
        }
        assert_eq!(det.buffered("WINQ26"), 9);
    }

    #[test]
    fn test_single_spike_does_not_trigger() {
        let mut det = detector(10);
        let now = Utc::now();
        for price in warmup_prices() {
            det.analyze("WINQ26", price, now, None);
        }

        // One extreme bar, then back to normal: never an alert
        assert!(det.analyze("WINQ26", 12.0, now, None).is_none());
        assert!(det.analyze("WINQ26", 10.2, now, None).is_none());
    }

    #[test]
    fn test_two_consecutive_extremes_trigger() {
        let mut det = detector(10);
        let now = Utc::now();
        for price in warmup_prices() {
            det.analyze("WINQ26", price, now, None);
        }

        assert!(det.analyze("WINQ26", 12.0, now, None).is_none());
        let alert = det
            .analyze("WINQ26", 12.2, now, None)
            .expect("second extreme bar should confirm");

        assert_eq!(alert.pattern, PatternKind::ExtremeVolatility);
        assert_eq!(alert.severity, Severity::Critical);
        assert!(alert.entry_min < alert.entry_max);
        assert!(alert.stop_loss < alert.entry_min);
        assert!(alert.take_profit.unwrap() > alert.entry_max);
        assert!(alert.confidence >= 0.85 && alert.confidence <= 0.95);
        assert!(alert.risk_reward > 1.0);
    }

    #[test]
    fn test_flat_window_returns_none() {
        let mut det = detector(10);
        let now = Utc::now();

        for _ in 0..15 {
            assert!(det.analyze("WINQ26", 130_000.0, now, None).is_none());
        }
    }

    #[test]
    fn test_history_seeds_buffer() {
        let mut det = detector(10);
        let now = Utc::now();
        let history = warmup_prices();

        // First call arrives with enough history to fill the window
        assert!(det.analyze("WINQ26", 10.2, now, Some(&history)).is_none());
        assert_eq!(det.buffered("WINQ26"), 10);
    }

    #[test]
    fn test_per_symbol_isolation() {
        let mut det = detector(10);
        let now = Utc::now();

        for price in warmup_prices() {
            det.analyze("WINQ26", price, now, None);
        }
        det.analyze("WINQ26", 12.0, now, None);

        // A spike on a different symbol has no warmed-up state
        assert!(det.analyze("WDOQ26", 12.2, now, None).is_none());
        assert_eq!(det.buffered("WDOQ26"), 1);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut det = detector(10);
        let now = Utc::now();
        for price in warmup_prices() {
            det.analyze("WINQ26", price, now, None);
        }

        det.reset("WINQ26");
        assert_eq!(det.buffered("WINQ26"), 0);
        assert!(det.analyze("WINQ26", 12.0, now, None).is_none());
    }

    #[test]
    fn test_buffer_evicts_oldest() {
        let mut det = VolatilityDetector::new(VolatilityConfig {
            window: 5,
            lookback_bars: 8,
            threshold_sigma: 2.0,
        });
        let now = Utc::now();

        for i in 0..20 {
            det.analyze("WINQ26", 10.0 + (i % 2) as f64 * 0.2, now, None);
        }
        assert_eq!(det.buffered("WINQ26"), 8);
    }
}
