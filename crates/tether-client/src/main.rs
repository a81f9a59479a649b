mod client;
mod prediction;

use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use client::GameClient;

#[derive(Parser)]
#[command(name = "tether-client")]
#[command(about = "Predicting replication client")]
struct Args {
    #[arg(short, long, default_value = "127.0.0.1")]
    server: String,

    #[arg(short, long, default_value_t = tether::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value_t = 60)]
    tick_rate: u32,

    #[arg(long, default_value_t = 0, help = "Seconds to run, 0 for forever")]
    duration: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let server_addr = format!("{}:{}", args.server, args.port).parse()?;

    let mut client = GameClient::new(server_addr)?;
    client.connect()?;

    let duration = (args.duration > 0).then(|| Duration::from_secs(args.duration));
    client.run(args.tick_rate, duration)?;

    log::info!("client shutting down");
    Ok(())
}
