//! Delivery - multi-channel alert fan-out with per-channel retry policies

pub mod channels;
pub mod manager;

// Re-export commonly used types
pub use channels::{
    AlertChannel, EmailChannel, EmailConfig, SmsChannel, SmsConfig, WebSocketPushChannel,
};
pub use manager::{DeliveryConfig, DeliveryManager, RetryPolicy};
