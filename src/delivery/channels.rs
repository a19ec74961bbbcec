//! Delivery channel transports
//!
//! Each channel wraps one transport behind the [`AlertChannel`] trait: the
//! WebSocket broadcast for connected dashboards, an HTTP mail API for the
//! store-and-forward path, and an optional HTTP SMS API.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::broadcast;

use crate::alert_core::{Alert, ChannelKind};
use crate::types::WsMessage;

/// A transport capable of delivering one alert
#[async_trait]
pub trait AlertChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Attempt one delivery. Timeouts are enforced by the caller.
    async fn send(&self, alert: &Alert) -> Result<()>;
}

/// Real-time push over the server's WebSocket broadcast
pub struct WebSocketPushChannel {
    tx: broadcast::Sender<WsMessage>,
}

impl WebSocketPushChannel {
    pub fn new(tx: broadcast::Sender<WsMessage>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl AlertChannel for WebSocketPushChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Push
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        self.tx
            .send(WsMessage::Alert(Box::new(alert.clone())))
            .map(|_| ())
            .map_err(|_| anyhow::anyhow!("no connected websocket clients"))
    }
}

/// Configuration for the HTTP mail API transport
#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// Mail API endpoint, e.g. https://api.mailprovider.com/v1/send
    pub api_url: String,
    pub api_key: String,
    pub from: String,
    pub to: String,
}

/// Store-and-forward email delivery through an HTTP mail API
pub struct EmailChannel {
    client: reqwest::Client,
    config: EmailConfig,
}

impl EmailChannel {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Low-level send against the mail API
    pub async fn send_message(
        &self,
        destination: &str,
        subject: &str,
        html_body: &str,
        text_body: &str,
    ) -> Result<()> {
        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&json!({
                "from": self.config.from,
                "to": destination,
                "subject": subject,
                "html": html_body,
                "text": text_body,
            }))
            .send()
            .await
            .context("mail API request failed")?;

        if !response.status().is_success() {
            bail!("mail API returned {}", response.status());
        }
        Ok(())
    }
}

#[async_trait]
impl AlertChannel for EmailChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let subject = format_subject(alert);
        let html = format_html_body(alert);
        let text = format_text_body(alert);
        self.send_message(&self.config.to, &subject, &html, &text)
            .await
    }
}

/// Configuration for the HTTP SMS API transport
#[derive(Debug, Clone)]
pub struct SmsConfig {
    pub api_url: String,
    pub api_key: String,
    pub to: String,
}

/// Optional tertiary SMS delivery through an HTTP SMS API
pub struct SmsChannel {
    client: reqwest::Client,
    config: SmsConfig,
}

impl SmsChannel {
    pub fn new(config: SmsConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl AlertChannel for SmsChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Sms
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&json!({
                "to": self.config.to,
                "body": format_subject(alert),
            }))
            .send()
            .await
            .context("SMS API request failed")?;

        if !response.status().is_success() {
            bail!("SMS API returned {}", response.status());
        }
        Ok(())
    }
}

/// One-line summary used for email subjects and SMS bodies
pub fn format_subject(alert: &Alert) -> String {
    format!(
        "[{}] {} {} @ {:.0}",
        alert.severity, alert.symbol, alert.pattern, alert.price
    )
}

/// HTML email body with the full trade suggestion
pub fn format_html_body(alert: &Alert) -> String {
    let take_profit = alert
        .take_profit
        .map(|tp| format!("{:.0}", tp))
        .unwrap_or_else(|| "-".to_string());

    format!(
        "<h2>{} {}</h2>\
         <p>Severity: {}<br>\
         Price: {:.0}<br>\
         Entry band: {:.0} - {:.0}<br>\
         Stop loss: {:.0}<br>\
         Take profit: {}<br>\
         Confidence: {:.0}%<br>\
         Risk:reward: {:.2}</p>\
         <p><small>Alert {} at {}</small></p>",
        alert.symbol,
        alert.pattern,
        alert.severity,
        alert.price,
        alert.entry_min,
        alert.entry_max,
        alert.stop_loss,
        take_profit,
        alert.confidence * 100.0,
        alert.risk_reward,
        alert.id,
        alert.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
    )
}

/// Plain-text email body
pub fn format_text_body(alert: &Alert) -> String {
    let take_profit = alert
        .take_profit
        .map(|tp| format!("{:.0}", tp))
        .unwrap_or_else(|| "-".to_string());

    format!(
        "{} {} ({})\n\
         Price: {:.0}\n\
         Entry band: {:.0} - {:.0}\n\
         Stop loss: {:.0}\n\
         Take profit: {}\n\
         Confidence: {:.0}%\n\
         Risk:reward: {:.2}\n\
         Alert {} at {}",
        alert.symbol,
        alert.pattern,
        alert.severity,
        alert.price,
        alert.entry_min,
        alert.entry_max,
        alert.stop_loss,
        take_profit,
        alert.confidence * 100.0,
        alert.risk_reward,
        alert.id,
        alert.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert_core::{AlertParams, PatternKind, Severity};

    fn sample_alert() -> Alert {
        Alert::new(AlertParams {
            symbol: "WINQ26".to_string(),
            pattern: PatternKind::SupportBreak,
            severity: Severity::High,
            price: 130_000.0,
            timestamp: chrono::Utc::now(),
            entry_min: 129_805.0,
            entry_max: 130_195.0,
            stop_loss: 129_415.0,
            take_profit: Some(131_462.0),
            confidence: 0.70,
            risk_reward: 2.5,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_push_delivers_to_subscriber() {
        let (tx, mut rx) = broadcast::channel(16);
        let channel = WebSocketPushChannel::new(tx);
        let alert = sample_alert();

        channel.send(&alert).await.unwrap();

        match rx.recv().await.unwrap() {
            WsMessage::Alert(delivered) => assert_eq!(delivered.id, alert.id),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_push_fails_without_subscribers() {
        let (tx, _) = broadcast::channel(16);
        let channel = WebSocketPushChannel::new(tx);

        assert!(channel.send(&sample_alert()).await.is_err());
    }

    #[test]
    fn test_subject_line() {
        let subject = format_subject(&sample_alert());
        assert!(subject.contains("WINQ26"));
        assert!(subject.contains("support_break"));
        assert!(subject.contains("HIGH"));
        assert!(subject.contains("130000"));
    }

    #[test]
    fn test_bodies_carry_trade_levels() {
        let alert = sample_alert();
        let html = format_html_body(&alert);
        let text = format_text_body(&alert);

        for body in [&html, &text] {
            assert!(body.contains("129805"));
            assert!(body.contains("130195"));
            assert!(body.contains("129415"));
            assert!(body.contains("131462"));
            assert!(body.contains("70%"));
        }
        assert!(html.contains("<h2>"));
        assert!(!text.contains("<h2>"));
    }
}
