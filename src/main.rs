//! Tickgate Gateway Server
//!
//! Demo gateway binary: accepts WebSocket sessions, echoes a simple
//! chat envelope back to the sender, and drives the session manager's
//! tick from a millisecond interval.

use std::any::Any;
use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use tickgate::codec::{CodecPool, Packer, Unpacker};
use tickgate::config::GatewayConfig;
use tickgate::error::CodecError;
use tickgate::session::{Message, SessionManager};
use tickgate::VERSION;

/// Demo chat envelope: sender name plus one line of text.
const MSG_CHAT: u32 = 0x0001;

#[derive(Default)]
struct ChatMessage {
    sender: String,
    text: String,
}

impl Message for ChatMessage {
    fn msg_id(&self) -> u32 {
        MSG_CHAT
    }

    fn encode(&self, packer: &mut Packer) {
        packer.pack_str(&self.sender);
        packer.pack_str(&self.text);
    }

    fn decode(&mut self, unpacker: &mut Unpacker) -> std::result::Result<(), CodecError> {
        self.sender = unpacker.unpack_str()?;
        self.text = unpacker.unpack_str()?;
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Tickgate Gateway v{}", VERSION);

    let config = GatewayConfig::load().await?;
    info!(
        "Configuration loaded from: {}",
        config.config_path.display()
    );

    let pool = Arc::new(CodecPool::new(config.codec_pool_size));
    let mut manager = SessionManager::new(
        config.name.clone(),
        config.listen_addr.clone(),
        config.max_msg_size,
        config.max_sessions,
        pool,
    );

    manager.register_message(
        MSG_CHAT,
        Box::new(|| Box::new(ChatMessage::default())),
        Box::new(|session, msg, decode_ok| {
            if !decode_ok {
                warn!(session_id = session.id(), "undecodable chat message");
                session.close();
                return;
            }
            let chat = match msg.as_any_mut().downcast_mut::<ChatMessage>() {
                Some(chat) => chat,
                None => return,
            };
            info!(
                session_id = session.id(),
                sender = %chat.sender,
                text = %chat.text,
                "chat message"
            );
            session.send_message(chat);
        }),
    )?;

    manager.on_session_open(Box::new(|session| {
        info!(
            session_id = session.id(),
            address = %session.remote_addr(),
            "session opened"
        );
    }));
    manager.on_session_close(Box::new(|session| {
        info!(session_id = session.id(), "session closed");
    }));

    if !manager.start() {
        anyhow::bail!("failed to start gateway on {}", config.listen_addr);
    }
    if let Some(addr) = manager.local_addr() {
        info!("Gateway listening on: {}", addr);
    }

    // External driver: one tick per interval, skipping missed ticks
    // rather than bursting to catch up.
    let mut ticker = interval(Duration::from_millis(config.tick_interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => manager.run(),
            _ = &mut shutdown => break,
        }
    }

    info!("Shutting down gateway...");
    manager.stop();
    info!("Gateway shutdown complete. Goodbye!");
    Ok(())
}

/// Initialize the logging/tracing system
fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tickgate=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .init();
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
