use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pairwise_collab::auth::{parse_entry, Identity};
use pairwise_collab::{LogOrchestrator, ServerConfig, StaticTokens, SyncServer};

#[derive(Parser, Debug)]
#[command(name = "pairwise-server")]
#[command(about = "Real-time sync server for pair-programming rooms")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:3000")]
    bind: String,

    /// Trusted browser origin (repeatable; none given = localhost dev origin)
    #[arg(long = "origin")]
    origins: Vec<String>,

    /// Accept any origin
    #[arg(long)]
    any_origin: bool,

    /// Access token as TOKEN=USER:ROLE (repeatable)
    #[arg(short, long = "token", value_parser = parse_entry)]
    tokens: Vec<(String, Identity)>,

    /// RocksDB directory; omit to keep documents in memory
    #[arg(long)]
    storage: Option<PathBuf>,

    /// Outbound events buffered per connection before resync
    #[arg(long, default_value_t = 256)]
    outbox: usize,

    /// Milliseconds an empty room lingers before it drains
    #[arg(long, default_value_t = 5_000)]
    grace_ms: u64,

    /// Debounce of periodic saves, in milliseconds
    #[arg(long, default_value_t = 500)]
    save_ms: u64,

    /// Seconds of silence before a connection is dropped
    #[arg(long, default_value_t = 60)]
    idle_secs: u64,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        let mut config = ServerConfig {
            bind_addr: self.bind.clone(),
            outbox_capacity: self.outbox,
            idle_timeout: Duration::from_secs(self.idle_secs),
            storage_path: self.storage.clone(),
            ..ServerConfig::default()
        };
        if self.any_origin {
            config.allowed_origins.clear();
        } else if !self.origins.is_empty() {
            config.allowed_origins = self.origins.clone();
        }
        config.room.grace_period = Duration::from_millis(self.grace_ms);
        config.room.save_interval = Duration::from_millis(self.save_ms);
        config
    }

    fn authenticator(&self) -> StaticTokens {
        let mut tokens = StaticTokens::new();
        for (token, identity) in &self.tokens {
            tokens.insert(token.clone(), identity.user_id.clone(), identity.role);
        }
        tokens
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let tokens = args.authenticator();
    if tokens.is_empty() {
        log::warn!("no --token given; every connection will be refused");
    }

    let server = SyncServer::new(args.server_config(), Arc::new(tokens), Arc::new(LogOrchestrator))?;
    info!("starting pairwise-server on {}", server.config().bind_addr);

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down, flushing live rooms");
            server.shutdown().await;
        }
    }
    Ok(())
}
