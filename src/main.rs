use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use clap::Parser;
use futures::{SinkExt, StreamExt};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::sync::{broadcast, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use winalert::alert_core::{
    run_worker, AlertEngine, AlertQueue, EngineConfig, QueueConfig, VolatilityConfig,
};
use winalert::api;
use winalert::audit::JsonlAuditSink;
use winalert::broker::SimulatedGateway;
use winalert::delivery::{
    DeliveryConfig, DeliveryManager, EmailChannel, EmailConfig, SmsChannel, SmsConfig,
    WebSocketPushChannel,
};
use winalert::types::{AppState, ClientMessage, WsMessage};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Symbols to watch (comma-separated)
    #[arg(short, long, default_value = "WINQ26")]
    symbols: String,

    /// Port to run the server on
    #[arg(short, long, default_value = "3000")]
    port: u16,

    /// Path of the append-only audit log
    #[arg(long, env = "AUDIT_LOG", default_value = "winalert_audit.jsonl")]
    audit_log: PathBuf,

    /// Z-score window in bars
    #[arg(long, default_value = "20")]
    window: usize,

    /// Z-score magnitude required on two consecutive bars
    #[arg(long, default_value = "2.0")]
    threshold_sigma: f64,

    /// Minimum seconds between alerts of the same pattern kind
    #[arg(long, default_value = "60")]
    rate_limit_secs: u64,

    /// Seconds a fingerprint blocks duplicate alerts
    #[arg(long, default_value = "120")]
    dedup_ttl_secs: u64,

    /// Maximum queued alerts
    #[arg(long, default_value = "100")]
    queue_capacity: usize,

    /// Mail API endpoint for the store-and-forward channel
    #[arg(long, env = "EMAIL_API_URL")]
    email_api_url: Option<String>,

    #[arg(long, env = "EMAIL_API_KEY", hide_env_values = true)]
    email_api_key: Option<String>,

    #[arg(long, env = "EMAIL_FROM")]
    email_from: Option<String>,

    #[arg(long, env = "EMAIL_TO")]
    email_to: Option<String>,

    /// SMS API endpoint for the tertiary channel
    #[arg(long, env = "SMS_API_URL")]
    sms_api_url: Option<String>,

    #[arg(long, env = "SMS_API_KEY", hide_env_values = true)]
    sms_api_key: Option<String>,

    #[arg(long, env = "SMS_TO")]
    sms_to: Option<String>,
}

impl Args {
    fn email_config(&self) -> Option<EmailConfig> {
        Some(EmailConfig {
            api_url: self.email_api_url.clone()?,
            api_key: self.email_api_key.clone()?,
            from: self.email_from.clone()?,
            to: self.email_to.clone()?,
        })
    }

    fn sms_config(&self) -> Option<SmsConfig> {
        Some(SmsConfig {
            api_url: self.sms_api_url.clone()?,
            api_key: self.sms_api_key.clone()?,
            to: self.sms_to.clone()?,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("winalert=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    info!("Starting WIN alert server");
    info!("Symbols: {}", args.symbols);
    info!("Port: {}", args.port);
    info!("Audit log: {}", args.audit_log.display());

    let symbols: Vec<String> = args
        .symbols
        .split(',')
        .map(|s| s.trim().to_string())
        .collect();

    // Broadcast channel feeding WebSocket clients and the push channel
    let (tx, _rx) = broadcast::channel::<WsMessage>(1000);

    let queue = Arc::new(AlertQueue::new(QueueConfig {
        capacity: args.queue_capacity,
        rate_limit_secs: args.rate_limit_secs,
        dedup_ttl_secs: args.dedup_ttl_secs,
        ..Default::default()
    }));

    let engine = AlertEngine::new(
        EngineConfig {
            volatility: VolatilityConfig {
                window: args.window,
                threshold_sigma: args.threshold_sigma,
                ..Default::default()
            },
            ..Default::default()
        },
        queue.clone(),
    );

    let audit = Arc::new(
        JsonlAuditSink::open(&args.audit_log)
            .with_context(|| format!("opening audit log {}", args.audit_log.display()))?,
    );

    let mut manager = DeliveryManager::new(
        DeliveryConfig::default(),
        Arc::new(WebSocketPushChannel::new(tx.clone())),
        audit.clone(),
    );
    if let Some(config) = args.email_config() {
        info!("Email channel enabled ({})", config.to);
        manager = manager.with_secondary(Arc::new(EmailChannel::new(config)));
    }
    if let Some(config) = args.sms_config() {
        info!("SMS channel enabled ({})", config.to);
        manager = manager.with_tertiary(Arc::new(SmsChannel::new(config)));
    }
    let manager = Arc::new(manager);

    // Background consumer and dedup cache sweeper
    tokio::spawn(run_worker(queue.clone(), manager, audit.clone()));
    let sweep_queue = queue.clone();
    tokio::spawn(async move { sweep_queue.sweep_loop().await });

    let state = Arc::new(AppState {
        tx,
        engine,
        audit,
        gateway: Arc::new(SimulatedGateway::new()),
        active_symbols: RwLock::new(symbols.iter().cloned().collect()),
    });

    // Build router
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/ticks", post(api::ingest_tick))
        .route("/api/candles", post(api::ingest_candle))
        .route("/api/metrics", get(api::get_metrics))
        .route("/api/alerts", get(api::get_alerts))
        .route("/api/alerts/{id}/action", post(api::post_alert_action))
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], args.port));
    info!("Server running at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.tx.subscribe();

    // Send current state to new client
    let symbols: Vec<String> = state.active_symbols.read().await.iter().cloned().collect();
    let welcome = WsMessage::Connected { symbols };
    if let Ok(json) = serde_json::to_string(&welcome) {
        let _ = sender.send(Message::Text(json.into())).await;
    }

    // Forward delivered alerts to this client
    let send_task = tokio::spawn(async move {
        while let Ok(msg) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&msg) {
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        }
    });

    // Handle incoming messages from client
    let state_clone = state.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(client_msg) = serde_json::from_str::<ClientMessage>(&text) {
                    match client_msg.action.as_str() {
                        "watch" => {
                            if let Some(symbol) = client_msg.symbol {
                                info!("Client watching symbol: {}", symbol);
                                state_clone.active_symbols.write().await.insert(symbol);
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    });

    // Wait for either task to complete
    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    info!("WebSocket client disconnected");
}
