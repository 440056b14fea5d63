use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "hub-server", about = "Voice, screen-share and chat hub server")]
pub struct Config {
    /// TCP control listener.
    #[arg(long, default_value = "0.0.0.0:12345")]
    pub control_listen: String,

    /// Address the UDP media ports bind on.
    #[arg(long, default_value = "0.0.0.0")]
    pub udp_bind: String,

    /// UDP voice forwarding port.
    #[arg(long, default_value_t = 40000)]
    pub voice_port: u16,

    /// UDP video forwarding port.
    #[arg(long, default_value_t = 40001)]
    pub video_port: u16,

    /// HTTP web-viewer bridge listener.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub http_listen: String,

    #[arg(long, default_value = "users.json")]
    pub users_file: String,

    #[arg(long, default_value = "telegram_links.json")]
    pub links_file: String,

    #[arg(long, default_value = "history.log")]
    pub history_file: String,

    /// Token handed to the external Telegram bot integration.
    #[arg(long, env = "TG_BOT_TOKEN", hide_env_values = true)]
    pub tg_bot_token: Option<String>,
}
