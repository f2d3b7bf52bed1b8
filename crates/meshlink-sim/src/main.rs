//! meshlink simulation CLI
//!
//! Usage:
//!   meshlink-sim swarm [--peers 8] [--duration-ms 2000] [--star]
//!   meshlink-sim pair [--code 1234] [--guest-code 0000 --guest-code 1234]
//!   meshlink-sim signal-server [--addr 127.0.0.1:7470]
//!   meshlink-sim decode <invitation>

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use meshlink::{decode_invitation, SignalServer};
use meshlink_config::Config;
use meshlink_sim::{run_pairing, PairConfig, SimConfig, SimTopology, Simulation};
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "meshlink-sim")]
#[command(about = "Simulate meshlink swarms and invitations in one process", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run N peers on one topic and print topology statistics
    Swarm {
        #[arg(long, default_value_t = 8)]
        peers: usize,
        #[arg(long, default_value_t = 2000)]
        duration_ms: u64,
        /// Star topology centered on the first peer
        #[arg(long)]
        star: bool,
        /// Per-message latency
        #[arg(long, default_value_t = 0)]
        latency_ms: u64,
    },
    /// Pair a guest device with a host over an in-memory network
    Pair {
        /// Host code; generated when omitted
        #[arg(long)]
        code: Option<String>,
        /// Codes the guest tries, in order
        #[arg(long = "guest-code")]
        guest_codes: Vec<String>,
        /// Invite into a space instead of pairing a device
        #[arg(long)]
        space: bool,
    },
    /// Run the websocket signal server
    SignalServer {
        #[arg(long, env = "MESHLINK_SIGNAL_ADDR")]
        addr: Option<String>,
    },
    /// Print a decoded invitation
    Decode {
        invitation: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("meshlink=info,meshlink_sim=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load_or_default();

    match cli.command {
        Commands::Swarm {
            peers,
            duration_ms,
            star,
            latency_ms,
        } => {
            let sim = Simulation::new(SimConfig {
                peer_count: peers,
                duration: Duration::from_millis(duration_ms),
                topology: if star { SimTopology::Star } else { SimTopology::FullyConnected },
                latency: Duration::from_millis(latency_ms),
                swarm: config.swarm.to_runtime(),
                presence: config.presence.to_runtime(),
            });
            let stats = sim.run().await?;
            let topology = &stats.topology;
            println!("Peers:               {}", topology.peer_count);
            println!("Connections:         {}", topology.connection_count);
            println!(
                "Degree:              avg {:.2}, min {}, max {}",
                topology.avg_degree, topology.min_degree, topology.max_degree
            );
            println!("Isolated peers:      {}", topology.isolated_peers);
            println!("Asymmetric pairs:    {}", topology.asymmetric_pairs);
            println!("Presence consistent: {}", topology.presence_matches_connections);
            println!("Connections formed:  {}", stats.connections_formed);
            println!("Connect failures:    {}", stats.connect_failures);
            println!("Leaked subscriptions: {}", stats.leaked_subscriptions);
            println!("Elapsed:             {:?}", stats.elapsed);
        }
        Commands::Pair {
            code,
            guest_codes,
            space,
        } => {
            let outcome = run_pairing(PairConfig {
                code,
                guest_codes,
                space,
                invitation: config.invitation.to_runtime(),
                ..PairConfig::default()
            })
            .await?;
            println!("Invitation: {}", outcome.encoded);
            for (i, attempt) in outcome.attempts.iter().enumerate() {
                match attempt {
                    Ok(()) => println!("Attempt {}: accepted", i + 1),
                    Err(e) => println!("Attempt {}: {}", i + 1, e),
                }
            }
            println!("Host:  {}", outcome.host.state);
            println!("Guest: {}", outcome.guest.state);
            for peer in &outcome.admitted {
                println!("Admitted: {}", peer);
            }
        }
        Commands::SignalServer { addr } => {
            let addr = addr.unwrap_or_else(|| config.signal.bind_address.clone());
            let server = SignalServer::bind(&addr)
                .await
                .with_context(|| format!("Failed to bind signal server on {}", addr))?;
            info!("signal server at {}", server.url());
            tokio::signal::ctrl_c().await.context("Failed to wait for ctrl-c")?;
            info!("shutting down");
            server.shutdown().await;
        }
        Commands::Decode { invitation } => {
            let descriptor = decode_invitation(&invitation).context("Invalid invitation")?;
            println!("Version:   {}", descriptor.version);
            println!("Id:        {}", descriptor.id);
            println!("Kind:      {:?}", descriptor.kind);
            println!("Type:      {:?}", descriptor.invitation_type);
            println!("Topic:     {}", descriptor.topic);
            println!("Swarm key: {}", descriptor.swarm_key);
            println!("Host peer: {}", descriptor.host_peer_id());
            match descriptor.expires_at {
                Some(ms) => println!("Expires:   {} (unix ms)", ms),
                None => println!("Expires:   never"),
            }
        }
    }

    Ok(())
}
