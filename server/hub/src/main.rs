use anyhow::Result;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use hub_server::config::Config;
use hub_server::{build_state, Hub};
use hub_store::bot::BotSurface;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let cfg = Config::parse();
    let state = build_state(&cfg);

    // Credential mutation surface for the external Telegram bot. The bot
    // process polls Telegram on its own; it shares only these stores.
    let _bot = BotSurface::new(state.users.clone(), state.links.clone());
    match cfg.tg_bot_token.as_deref() {
        Some(_) => info!("telegram bot token present, credential surface armed"),
        None => info!("TG_BOT_TOKEN not set, bot integration disabled"),
    }

    let hub = Hub::bind(&cfg, state).await?;
    info!(
        control = %hub.control_addr()?,
        voice = %hub.voice_addr()?,
        video = %hub.video_addr()?,
        http = %hub.http_addr()?,
        "hub ready"
    );

    tokio::select! {
        r = hub.serve() => r?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown");
        }
    }

    Ok(())
}
