use std::{net::SocketAddr, num::NonZeroUsize};

use clap::Parser;

/// Real-time presence and private messaging over WebSocket.
#[derive(Parser, Debug, Clone)]
#[command(name = "geochat", version, about)]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "JSON_LOGS")]
    pub json_logs: bool,

    /// Evict the oldest users once this many are online. Unlimited when unset.
    #[arg(long, env = "MAX_ONLINE_USERS")]
    pub max_online_users: Option<NonZeroUsize>,
}

impl Config {
    /// CLI flags, then the environment, with `.env` loaded into the environment first.
    pub fn load() -> Self {
        dotenv::dotenv().ok();
        Self::parse()
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.bind_address, self.port).parse()?)
    }
}
