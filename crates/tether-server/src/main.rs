mod config;
mod events;
mod server;

use anyhow::Result;
use clap::Parser;

use config::ServerConfig;
use server::GameServer;
use tether::DistanceRings;

#[derive(Parser)]
#[command(name = "tether-server")]
#[command(about = "Authoritative replication server")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = tether::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value_t = 60)]
    tick_rate: u32,

    #[arg(short, long, default_value_t = 32)]
    max_clients: usize,

    #[arg(long, default_value_t = 32.0, help = "Interest grid cell size")]
    cell_size: f32,

    #[arg(long, default_value_t = 30, help = "Client timeout in seconds")]
    timeout: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let bind_addr = format!("{}:{}", args.bind, args.port);

    let config = ServerConfig {
        tick_rate: args.tick_rate,
        max_clients: args.max_clients,
        interest_cell_size: args.cell_size,
        rings: DistanceRings::default(),
        client_timeout_secs: args.timeout,
        ..Default::default()
    };

    let server = GameServer::new(&bind_addr, config)?;
    log::info!("server listening on {}", server.local_addr());
    server.run()?;
    log::info!("server shutting down");

    Ok(())
}
