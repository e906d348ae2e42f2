mod harness;
mod messages;

use std::net::SocketAddr;

use anyhow::{Result, bail};
use clap::Parser;
use log::{info, warn};
use tether::{MAX_CLIENTS, ServerConfig, SimulatorSettings};

use harness::{EchoHarness, HarnessConfig};

#[derive(Parser)]
#[command(name = "tether-server")]
#[command(about = "Headless echo server with simulated clients")]
struct Args {
    #[arg(short, long, default_value = "127.0.0.1:40000")]
    address: SocketAddr,

    #[arg(short, long, default_value_t = 8)]
    max_clients: usize,

    #[arg(short, long, default_value_t = 4)]
    clients: usize,

    #[arg(short, long, default_value_t = 600)]
    frames: u32,

    #[arg(long, default_value_t = 60)]
    frame_rate: u32,

    #[arg(long, default_value_t = 0.0, help = "Simulated latency in ms")]
    latency: f32,

    #[arg(long, default_value_t = 0.0, help = "Simulated jitter in ms")]
    jitter: f32,

    #[arg(long, default_value_t = 0.0, help = "Packet loss percentage (0-100)")]
    loss: f32,

    #[arg(long, default_value_t = 0.0, help = "Packet duplication percentage (0-100)")]
    duplicates: f32,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    #[arg(long, default_value_t = 64 * 1024, help = "Size of the block each client sends")]
    block_size: usize,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if args.max_clients == 0 || args.max_clients > MAX_CLIENTS {
        bail!("--max-clients must be between 1 and {}", MAX_CLIENTS);
    }
    if args.frame_rate == 0 {
        bail!("--frame-rate must be positive");
    }

    let server = ServerConfig {
        protocol_id: 0x7465_7468_6572,
        simulator_seed: args.seed,
        global_memory: 16 * 1024 * 1024,
        per_client_memory: 4 * 1024 * 1024 + 2 * args.block_size,
        ..Default::default()
    };
    let max_block_size = server
        .connection
        .channels
        .first()
        .map_or(0, |channel| channel.max_block_size);
    if args.block_size + 4 > max_block_size {
        bail!("--block-size must be below {} bytes", max_block_size - 4);
    }

    let config = HarnessConfig {
        address: args.address,
        max_clients: args.max_clients,
        clients: args.clients,
        frames: args.frames,
        frame_rate: args.frame_rate,
        block_size: args.block_size,
        simulator: SimulatorSettings {
            latency_ms: args.latency,
            jitter_ms: args.jitter,
            loss_percent: args.loss,
            duplicate_percent: args.duplicates,
        },
        server,
    };

    info!(
        "running {} clients against {} slots for {} frames",
        config.clients, config.max_clients, config.frames
    );
    let mut harness = EchoHarness::new(config)?;
    let reports = harness.run()?;

    let mut violations = 0;
    for (id, report) in reports.iter().enumerate() {
        info!(
            "client {} (slot {:?}): {}/{} echoed, block {}, rtt {:.1} ms, loss {:.1}%, {} sent / {} acked",
            id,
            report.client_index,
            report.echoed,
            report.sent,
            if report.block_echoed { "ok" } else { "missing" },
            report.stats.rtt_ms,
            report.stats.packet_loss_percent,
            report.stats.packets_sent,
            report.stats.packets_acked,
        );
        if report.echoed < report.sent {
            warn!("client {}: {} echoes outstanding", id, report.sent - report.echoed);
        }
        violations += report.violations;
    }

    if violations > 0 {
        bail!("{} ordering or integrity violations", violations);
    }
    Ok(())
}
