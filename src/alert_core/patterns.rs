//! Stateless chart pattern detection over short price windows
//!
//! Four independent checks: bullish/bearish engulfing, RSI divergence,
//! support break, resistance break. All of them size stops and targets from
//! a synthetic ATR proxy derived from the entry band width.

use chrono::{DateTime, Utc};
use tracing::error;

use super::alert::{Alert, AlertParams, PatternKind, Severity};
use crate::types::Candle;

/// Configuration for the pattern checks
#[derive(Debug, Clone)]
pub struct PatternConfig {
    /// Closes considered when computing support/resistance
    pub sr_window: usize,

    /// Minimum current-body to prior-body ratio for an engulfing candle
    pub engulfing_body_ratio: f64,

    /// RSI level above which bearish divergence is considered
    pub rsi_overbought: f64,

    /// RSI level below which bullish divergence is considered
    pub rsi_oversold: f64,

    /// Wilder RSI period
    pub rsi_period: usize,

    /// Entry band half-width as a fraction of price
    pub entry_band_pct: f64,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            sr_window: 5,
            engulfing_body_ratio: 0.8,
            rsi_overbought: 70.0,
            rsi_oversold: 30.0,
            rsi_period: 14,
            entry_band_pct: 0.0015,
        }
    }
}

/// Stateless per-call pattern matchers
pub struct PatternDetector {
    config: PatternConfig,
}

impl PatternDetector {
    pub fn new(config: PatternConfig) -> Self {
        Self { config }
    }

    /// Engulfing reversal: the current body opens beyond the prior close,
    /// closes beyond the prior open, and is at least `engulfing_body_ratio`
    /// of the prior body. Needs the last two candles.
    pub fn detect_engulfing(&self, candles: &[Candle]) -> Option<Alert> {
        if candles.len() < 2 {
            return None;
        }
        let prev = &candles[candles.len() - 2];
        let curr = &candles[candles.len() - 1];

        let body_ok = curr.body() >= self.config.engulfing_body_ratio * prev.body();

        let bullish = prev.is_bearish()
            && curr.is_bullish()
            && curr.open < prev.close
            && curr.close > prev.open
            && body_ok;

        let bearish = prev.is_bullish()
            && curr.is_bearish()
            && curr.open > prev.close
            && curr.close < prev.open
            && body_ok;

        let pattern = if bullish {
            PatternKind::BullishEngulfing
        } else if bearish {
            PatternKind::BearishEngulfing
        } else {
            return None;
        };

        self.build_alert(
            &curr.symbol,
            pattern,
            Severity::Medium,
            curr.close,
            curr.timestamp,
            0.65,
        )
    }

    /// Price/RSI divergence over the last 5 bars: price prints a new
    /// extreme while RSI fails to confirm it from an extreme zone.
    pub fn detect_rsi_divergence(
        &self,
        symbol: &str,
        closes: &[f64],
        rsi: &[f64],
        timestamp: DateTime<Utc>,
    ) -> Option<Alert> {
        if closes.len() < 5 || rsi.len() < 5 {
            return None;
        }
        let closes = &closes[closes.len() - 5..];
        let rsi = &rsi[rsi.len() - 5..];

        let price_now = closes[4];
        let rsi_now = rsi[4];
        let prior_high = closes[..4].iter().cloned().fold(f64::MIN, f64::max);
        let prior_low = closes[..4].iter().cloned().fold(f64::MAX, f64::min);
        let rsi_high = rsi[..4].iter().cloned().fold(f64::MIN, f64::max);
        let rsi_low = rsi[..4].iter().cloned().fold(f64::MAX, f64::min);

        let bearish =
            price_now > prior_high && rsi_now < rsi_high && rsi_now > self.config.rsi_overbought;
        let bullish =
            price_now < prior_low && rsi_now > rsi_low && rsi_now < self.config.rsi_oversold;

        if !bearish && !bullish {
            return None;
        }

        self.build_alert(
            symbol,
            PatternKind::RsiDivergence,
            Severity::Medium,
            price_now,
            timestamp,
            0.60,
        )
    }

    /// Support break: support is the minimum of the `sr_window` closes
    /// preceding the current one; the break is confirmed when the previous
    /// close held at or above it and the current close falls below it.
    pub fn detect_support_break(
        &self,
        symbol: &str,
        closes: &[f64],
        timestamp: DateTime<Utc>,
    ) -> Option<Alert> {
        let window = self.config.sr_window;
        if closes.len() < window + 1 {
            return None;
        }
        let curr = closes[closes.len() - 1];
        let prev = closes[closes.len() - 2];
        let support = closes[closes.len() - 1 - window..closes.len() - 1]
            .iter()
            .cloned()
            .fold(f64::MAX, f64::min);

        if prev >= support && curr < support {
            self.build_alert(
                symbol,
                PatternKind::SupportBreak,
                Severity::High,
                curr,
                timestamp,
                0.70,
            )
        } else {
            None
        }
    }

    /// Resistance break, symmetric to [`Self::detect_support_break`]
    pub fn detect_resistance_break(
        &self,
        symbol: &str,
        closes: &[f64],
        timestamp: DateTime<Utc>,
    ) -> Option<Alert> {
        let window = self.config.sr_window;
        if closes.len() < window + 1 {
            return None;
        }
        let curr = closes[closes.len() - 1];
        let prev = closes[closes.len() - 2];
        let resistance = closes[closes.len() - 1 - window..closes.len() - 1]
            .iter()
            .cloned()
            .fold(f64::MIN, f64::max);

        if prev <= resistance && curr > resistance {
            self.build_alert(
                symbol,
                PatternKind::ResistanceBreak,
                Severity::High,
                curr,
                timestamp,
                0.70,
            )
        } else {
            None
        }
    }

    /// Shared alert construction: entry band around the detection price,
    /// ATR proxy equal to the band width, stop one ATR below the band,
    /// target at 2.5x the resulting risk.
    fn build_alert(
        &self,
        symbol: &str,
        pattern: PatternKind,
        severity: Severity,
        price: f64,
        timestamp: DateTime<Utc>,
        confidence: f64,
    ) -> Option<Alert> {
        let half_band = self.config.entry_band_pct * price;
        let entry_min = price - half_band;
        let entry_max = price + half_band;
        let atr_proxy = entry_max - entry_min;
        let stop_loss = entry_min - atr_proxy;
        let risk = price - stop_loss;
        let take_profit = price + 2.5 * risk;

        let params = AlertParams {
            symbol: symbol.to_string(),
            pattern,
            severity,
            price,
            timestamp,
            entry_min,
            entry_max,
            stop_loss,
            take_profit: Some(take_profit),
            confidence,
            risk_reward: (take_profit - price) / risk,
        };

        match Alert::new(params) {
            Ok(alert) => Some(alert),
            Err(e) => {
                error!("{}: {} alert construction failed: {}", symbol, pattern, e);
                None
            }
        }
    }

    pub fn config(&self) -> &PatternConfig {
        &self.config
    }
}

/// Wilder-smoothed RSI. Returns one value per close after the initial
/// `period` seed, so `out.len() == closes.len() - period` (empty when the
/// series is too short).
pub fn rsi(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() <= period {
        return Vec::new();
    }

    let mut gains = 0.0;
    let mut losses = 0.0;
    for i in 1..=period {
        let delta = closes[i] - closes[i - 1];
        if delta > 0.0 {
            gains += delta;
        } else {
            losses -= delta;
        }
    }

    let period_f = period as f64;
    let mut avg_gain = gains / period_f;
    let mut avg_loss = losses / period_f;

    let mut out = Vec::with_capacity(closes.len() - period);
    out.push(rsi_value(avg_gain, avg_loss));

    for i in period + 1..closes.len() {
        let delta = closes[i] - closes[i - 1];
        let (gain, loss) = if delta > 0.0 { (delta, 0.0) } else { (0.0, -delta) };
        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
        out.push(rsi_value(avg_gain, avg_loss));
    }

    out
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_gain < f64::EPSILON && avg_loss < f64::EPSILON {
        50.0
    } else if avg_loss < f64::EPSILON {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}
