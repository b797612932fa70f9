//! Devspace relay binary.
//!
//! Hosts one room per shared document: keeps a replica of it, answers
//! sync requests and fans edits and presence out to every connected editor.

use clap::Parser;
use log::info;

use devspace_collab::{ServerConfig, SyncServer};

/// Relay command line arguments.
#[derive(Parser, Debug)]
#[command(name = "devspace-relay")]
#[command(about = "Collaborative editing relay for devspace")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:1234", value_name = "ADDR")]
    bind: String,

    /// Frames a slow connection may fall behind before it is disconnected
    #[arg(long, default_value_t = 256)]
    broadcast_capacity: usize,

    /// Maximum connections per room
    #[arg(long, default_value_t = 100)]
    max_peers: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();
    let args = Args::parse();

    let config = ServerConfig {
        bind_addr: args.bind,
        max_peers_per_room: args.max_peers,
        broadcast_capacity: args.broadcast_capacity,
    };
    info!("Starting devspace-relay on {}", config.bind_addr);
    SyncServer::new(config).run().await
}
