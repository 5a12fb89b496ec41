//! GameTunnel CLI
//!
//! Low-latency relay tunnel for real-time game traffic.

mod config;
mod dashboard;
mod games;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use config::{Config, DEFAULT_RELAY_PORT};
use dashboard::Dashboard;
use games::{DetectedGame, GameDetector};
use gametunnel_client::{EndpointProbe, RunExit, TunnelClient};
use gametunnel_core::{CandidateEndpoint, Destination, format_bytes, format_latency};
use gametunnel_relay::RelayServer;

/// GameTunnel - route game traffic through the fastest relay
#[derive(Parser)]
#[command(name = "gametunnel")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Intercept local game traffic and tunnel it through the best relay
    Client {
        /// Relay host to use (added to the catalog if absent)
        #[arg(long)]
        server_host: Option<String>,

        /// Relay port for --server-host
        #[arg(long)]
        server_port: Option<u16>,

        /// Use this catalog entry instead of the lowest-latency one
        #[arg(long, conflicts_with = "server_host")]
        server: Option<String>,

        /// True destination as host:port
        #[arg(long)]
        destination: Option<String>,

        /// Local UDP port (0 for ephemeral)
        #[arg(long)]
        local_port: Option<u16>,

        /// Look for running games from the [[games]] profiles
        #[arg(long)]
        detect_games: bool,
    },

    /// Run a relay node
    Server {
        /// Bind host
        #[arg(long)]
        host: Option<String>,

        /// Bind port
        #[arg(short, long)]
        port: Option<u16>,

        /// Region label
        #[arg(long)]
        region: Option<String>,
    },

    /// Show live probe results for the relay catalog
    Dashboard {
        /// Probe only this relay host
        #[arg(long)]
        host: Option<String>,

        /// Relay port for --host
        #[arg(short, long)]
        port: Option<u16>,

        /// Seconds between probe rounds
        #[arg(long)]
        interval: Option<u64>,

        /// Probe once and print a JSON snapshot
        #[arg(long)]
        json: bool,
    },

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Init { force } = cli.command {
        let path = cli.config.unwrap_or_else(Config::default_path);
        write_default_config(&path, force)?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    // Load configuration
    let config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::load_or_default()?,
    };

    // Validate configuration
    config.validate()?;

    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    init_logging(level, config.logging.file.as_deref())?;

    match cli.command {
        Commands::Client {
            server_host,
            server_port,
            server,
            destination,
            local_port,
            detect_games,
        } => {
            run_client(
                &config,
                ClientArgs {
                    server_host,
                    server_port,
                    server,
                    destination,
                    local_port,
                    detect_games,
                },
            )
            .await?;
        }
        Commands::Server { host, port, region } => {
            run_server(&config, host, port, region).await?;
        }
        Commands::Dashboard {
            host,
            port,
            interval,
            json,
        } => {
            run_dashboard(&config, host, port, interval, json).await?;
        }
        Commands::Init { .. } => {}
    }

    Ok(())
}

/// Install the tracing subscriber: stderr, plus an optional log file
fn init_logging(level: &str, file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_layer = match file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let log_file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(log_file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(())
}

struct ClientArgs {
    server_host: Option<String>,
    server_port: Option<u16>,
    server: Option<String>,
    destination: Option<String>,
    local_port: Option<u16>,
    detect_games: bool,
}

/// Write `Config::default()` to `path`, refusing to replace a file
/// unless `force` is set
fn write_default_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    Config::default()
        .save(path)
        .with_context(|| format!("Failed to write config {}", path.display()))
}

/// Report detected games and warn about ones the UDP intercept cannot carry
fn report_games(detected: &[DetectedGame]) {
    if detected.is_empty() {
        println!("No configured games running");
        return;
    }

    for game in detected {
        let profile = &game.profile;
        println!(
            "Detected:  {} (pid {}, {} ports {:?}, profile {})",
            profile.name, game.pid, profile.protocol, profile.ports, profile.optimization
        );
        if !game.is_tunnelable() {
            tracing::warn!(
                "{} uses {}, only UDP traffic is tunnelled",
                profile.name,
                profile.protocol
            );
        }
    }
}

/// Add `host:port` to the catalog if absent; returns its name
fn ensure_custom_endpoint(endpoints: &mut Vec<CandidateEndpoint>, host: &str, port: u16) -> String {
    if let Some(existing) = endpoints.iter().find(|e| e.host == host && e.port == port) {
        return existing.name.clone();
    }

    let name = format!("custom-{host}");
    endpoints.push(
        CandidateEndpoint::new(name.clone(), host, port)
            .with_region("custom")
            .with_location("Custom"),
    );
    name
}

/// Run the tunnel client until Ctrl+C
async fn run_client(config: &Config, args: ClientArgs) -> anyhow::Result<()> {
    let mut endpoints = config.endpoints();
    let mut pinned = args.server;

    if let Some(host) = &args.server_host {
        let port = args.server_port.unwrap_or(DEFAULT_RELAY_PORT);
        pinned = Some(ensure_custom_endpoint(&mut endpoints, host, port));
    }

    if endpoints.is_empty() {
        anyhow::bail!("No relay endpoints configured: add [[servers]] or pass --server-host");
    }

    if args.detect_games {
        if config.games.is_empty() {
            tracing::warn!("--detect-games given but no [[games]] profiles are configured");
        }
        report_games(&GameDetector::new(config.games.clone()).detect());
    }

    let mut client_config = config.client_config()?;
    if let Some(destination) = &args.destination {
        let destination: Destination = destination
            .parse()
            .with_context(|| format!("Invalid destination: {destination}"))?;
        client_config.destination = Some(destination);
    }
    if let Some(port) = args.local_port {
        client_config.local_port = port;
    }

    let tunnel = &config.tunnel;
    tracing::info!(
        "Tunnel options: encryption={}, compression={}, mtu={} (not applied)",
        tunnel.encryption,
        tunnel.compression,
        tunnel.mtu
    );

    let mut client = TunnelClient::new(client_config, endpoints);
    if let Some(name) = &pinned {
        client.pin_endpoint(name)?;
    }

    let chosen = client
        .initialize()
        .await
        .context("No reachable relay endpoint")?;
    let local = client.start().await.context("Failed to start tunnel")?;

    println!("Relay:    {} ({})", chosen.name, chosen.destination());
    println!("Latency:  {}", format_latency(chosen.latency_ms));
    println!("Listening on {local}");
    println!("Press Ctrl+C to stop");

    let exit = client
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    report_exit(&exit);
    Ok(())
}

/// Tell the operator why the tunnel ended.
///
/// Losing every relay after startup is reported, not treated as a failure.
fn report_exit(exit: &RunExit) {
    match exit {
        RunExit::Shutdown => println!("Tunnel stopped"),
        RunExit::Exhausted {
            attempts,
            last_error,
        } => {
            tracing::error!(
                "Relay link lost, {} reconnect attempts failed: {}",
                attempts,
                last_error
            );
            println!("Tunnel stopped: no relay reachable after {attempts} attempts");
        }
    }
}

/// Run a relay node until Ctrl+C
async fn run_server(
    config: &Config,
    host: Option<String>,
    port: Option<u16>,
    region: Option<String>,
) -> anyhow::Result<()> {
    let mut relay_config = config.relay_config();
    if let Some(host) = host {
        relay_config.host = host;
    }
    if let Some(port) = port {
        relay_config.port = port;
    }
    if region.is_some() {
        relay_config.region = region;
    }

    let server = Arc::new(
        RelayServer::bind(relay_config)
            .await
            .context("Failed to start relay")?,
    );
    println!("Relay listening on {}", server.local_addr());
    println!("Press Ctrl+C to stop");

    let runner = Arc::clone(&server);
    let task = tokio::spawn(async move { runner.run().await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down relay");
    server.shutdown();
    task.await??;

    let stats = server.stats();
    println!(
        "Served {} sessions, relayed {} ({} rejected)",
        stats.total_sessions,
        format_bytes(stats.bytes_relayed()),
        stats.rejected_sessions
    );
    Ok(())
}

/// Probe the catalog and display the results
async fn run_dashboard(
    config: &Config,
    host: Option<String>,
    port: Option<u16>,
    interval: Option<u64>,
    json: bool,
) -> anyhow::Result<()> {
    let mut endpoints = config.endpoints();
    if let Some(host) = &host {
        let port = port.unwrap_or(DEFAULT_RELAY_PORT);
        let name = ensure_custom_endpoint(&mut endpoints, host, port);
        endpoints.retain(|e| e.name == name);
    }

    if endpoints.is_empty() {
        anyhow::bail!("No relay endpoints configured: add [[servers]] or pass --host");
    }

    let probe = EndpointProbe::new(config.probe_config());
    let mut dashboard = Dashboard::new(endpoints, probe, config.dashboard.history_size);

    if json {
        dashboard.refresh().await;
        println!("{}", serde_json::to_string_pretty(&dashboard.snapshot())?);
        return Ok(());
    }

    let interval = Duration::from_secs(interval.unwrap_or(config.dashboard.refresh_interval).max(1));
    dashboard::run(&mut dashboard, interval, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;

    tracing::info!("Dashboard stopped after {} rounds", dashboard.rounds());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_client_args() {
        let cli = Cli::parse_from([
            "gametunnel",
            "-v",
            "client",
            "--server-host",
            "relay.example.com",
            "--destination",
            "203.0.113.7:27015",
        ]);
        assert!(cli.verbose);
        match cli.command {
            Commands::Client {
                server_host,
                server_port,
                destination,
                ..
            } => {
                assert_eq!(server_host.as_deref(), Some("relay.example.com"));
                assert_eq!(server_port, None);
                assert_eq!(destination.as_deref(), Some("203.0.113.7:27015"));
            }
            _ => panic!("expected client command"),
        }
    }

    #[test]
    fn test_server_and_server_host_conflict() {
        let result = Cli::try_parse_from([
            "gametunnel",
            "client",
            "--server",
            "fra-1",
            "--server-host",
            "relay.example.com",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_write_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gametunnel/config.toml");

        write_default_config(&path, false).unwrap();
        let written = Config::load(&path).unwrap();
        assert_eq!(written.server.port, DEFAULT_RELAY_PORT);
        assert!(written.validate().is_ok());

        assert!(write_default_config(&path, false).is_err());
        write_default_config(&path, true).unwrap();
    }

    #[test]
    fn test_parse_init_and_detect_flags() {
        let cli = Cli::parse_from(["gametunnel", "init", "--force"]);
        assert!(matches!(cli.command, Commands::Init { force: true }));

        let cli = Cli::parse_from(["gametunnel", "client", "--detect-games"]);
        assert!(matches!(
            cli.command,
            Commands::Client {
                detect_games: true,
                ..
            }
        ));
    }

    #[test]
    fn test_ensure_custom_endpoint() {
        let mut endpoints = vec![CandidateEndpoint::new("fra-1", "10.0.0.1", 8080)];

        assert_eq!(ensure_custom_endpoint(&mut endpoints, "10.0.0.1", 8080), "fra-1");
        assert_eq!(endpoints.len(), 1);

        let name = ensure_custom_endpoint(&mut endpoints, "10.0.0.9", 9000);
        assert_eq!(name, "custom-10.0.0.9");
        assert_eq!(endpoints[1].region, "custom");
        assert_eq!(endpoints[1].port, 9000);
    }
}
