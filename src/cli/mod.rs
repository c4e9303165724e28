//! CLI commands for roamlink using clap.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::Agent;
use crate::config::{get_settings_path, load_settings, validate_settings, Settings};
use crate::protocol::{AgentId, Content, Frame, MessageBuilder};
use crate::server::RelayServer;
use crate::transport::{handshake, Connector, ServerAddr, TcpConnector};
use crate::web::run_dashboard;

/// roamlink - route-driven agents that keep per-peer relationships and travel between servers.
#[derive(Parser)]
#[command(name = "roamlink")]
#[command(version)]
#[command(about = "Route-driven agent messaging with server-to-server travel", long_about = None)]
pub struct Commands {
    /// Log to the console as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a relay server agents can connect and travel to
    Serve(ServeArgs),

    /// Run an agent on its home server
    Agent(AgentArgs),

    /// Send one message as a short-lived client, e.g. a travel command
    Send(SendArgs),

    /// Print the effective settings
    Config {
        /// Settings file (default: ~/.roamlink/settings.json)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args)]
pub struct ServeArgs {
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub host: Option<String>,
    #[arg(long)]
    pub port: Option<u16>,
    /// Name announced to connecting agents
    #[arg(long)]
    pub name: Option<String>,
}

#[derive(Args)]
pub struct AgentArgs {
    /// Agent id
    #[arg(long)]
    pub name: Option<String>,
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Home server host
    #[arg(long)]
    pub host: Option<String>,
    /// Home server port
    #[arg(long)]
    pub port: Option<u16>,
    /// Only act on the travel command until travelled
    #[arg(long)]
    pub listen: bool,
    /// Travel destination as host:port
    #[arg(long, value_parser = parse_addr)]
    pub destination: Option<ServerAddr>,
    /// Serve the flow graph dashboard
    #[arg(long)]
    pub dashboard: bool,
    /// Broadcast on a clock every this many milliseconds
    #[arg(long)]
    pub broadcast_every_ms: Option<u64>,
    /// Send good/bad notes to classified peers every this many milliseconds
    #[arg(long)]
    pub reputation_every_ms: Option<u64>,
}

#[derive(Args)]
pub struct SendArgs {
    /// Message text; `/travel` is a travel command
    pub text: String,
    /// Recipient; broadcast when omitted
    #[arg(long)]
    pub to: Option<String>,
    /// Sender id
    #[arg(long, default_value = "operator")]
    pub from: String,
    /// Server as host:port (default: the configured home server)
    #[arg(long, value_parser = parse_addr)]
    pub server: Option<ServerAddr>,
    /// Travel destination carried by a travel command, as host:port
    #[arg(long, value_parser = parse_addr)]
    pub destination: Option<ServerAddr>,
    #[arg(long)]
    pub config: Option<PathBuf>,
}

fn parse_addr(s: &str) -> std::result::Result<ServerAddr, String> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| format!("'{}' is not host:port", s))?;
    let port: u16 = port.parse().map_err(|_| format!("invalid port in '{}'", s))?;
    if host.is_empty() || port == 0 {
        return Err(format!("'{}' is not host:port", s));
    }
    Ok(ServerAddr::new(host, port))
}

impl Commands {
    /// Run the command.
    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Command::Serve(args) => cmd_serve(args).await,
            Command::Agent(args) => cmd_agent(args).await,
            Command::Send(args) => cmd_send(args).await,
            Command::Config { config } => cmd_config(config.as_deref()),
        }
    }
}

// Command implementations

async fn cmd_serve(args: &ServeArgs) -> Result<()> {
    let mut settings = load_settings(args.config.as_deref())?;
    if let Some(host) = &args.host {
        settings.server.host = host.clone();
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    if let Some(name) = &args.name {
        settings.server.name = name.clone();
    }
    validate_settings(&settings)?;

    let server = RelayServer::bind(&settings.server.host, settings.server.port, settings.server.name.clone()).await?;
    println!("Relay '{}' on {}", settings.server.name, server.local_addr()?);

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Relay stopping"),
    }
    Ok(())
}

fn apply_agent_args(settings: &mut Settings, args: &AgentArgs) {
    if let Some(name) = &args.name {
        settings.agent.name = name.clone();
    }
    if let Some(host) = &args.host {
        settings.server.host = host.clone();
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    if args.listen {
        settings.agent.listen = true;
    }
    if let Some(dest) = &args.destination {
        settings.travel.destination = Some(dest.clone());
    }
    if args.dashboard {
        settings.dashboard.enabled = true;
    }
    if args.broadcast_every_ms.is_some() {
        settings.agent.broadcast_every_ms = args.broadcast_every_ms;
    }
    if args.reputation_every_ms.is_some() {
        settings.agent.reputation_every_ms = args.reputation_every_ms;
    }
}

async fn cmd_agent(args: &AgentArgs) -> Result<()> {
    let mut settings = load_settings(args.config.as_deref())?;
    apply_agent_args(&mut settings, args);
    validate_settings(&settings)?;

    let agent = Arc::new(Agent::from_settings(&settings).await?);
    println!(
        "Agent {} -> home {} (decision: {}{})",
        agent.id(),
        settings.server.addr(),
        settings.decision.backend,
        if settings.agent.listen { ", listening" } else { "" }
    );

    if settings.dashboard.enabled {
        let dashboard = settings.dashboard.clone();
        let agent = agent.clone();
        tokio::spawn(async move {
            if let Err(e) = run_dashboard(&dashboard, agent).await {
                tracing::error!("Dashboard stopped: {}", e);
            }
        });
    }

    let runner = agent.clone();
    let mut run = tokio::spawn(async move { runner.run().await });

    tokio::select! {
        result = &mut run => {
            result.context("agent task failed")??;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down {}", agent.id());
            agent.shutdown();
        }
    }
    run.await.context("agent task failed")??;
    Ok(())
}

async fn cmd_send(args: &SendArgs) -> Result<()> {
    let settings = load_settings(args.config.as_deref())?;
    let server = args.server.clone().unwrap_or_else(|| settings.server.addr());
    let from = AgentId::new(args.from.clone());

    let mut content = Content::text(args.text.clone());
    if let Some(dest) = &args.destination {
        content = content.with_data(serde_json::to_value(dest)?);
    }
    let mut builder = MessageBuilder::from(from.clone()).content(content);
    if let Some(to) = &args.to {
        builder = builder.to(to.clone());
    }
    let message = builder.build().map_err(|e| anyhow::anyhow!("bad message: {}", e))?;

    let transport = TcpConnector.connect(&server).await?;
    let name = tokio::time::timeout(
        settings.travel.connect_timeout(),
        handshake(transport.as_ref(), &from, Vec::new()),
    )
    .await
    .map_err(|_| anyhow::anyhow!("handshake with {} timed out", server))??;

    transport.send(&Frame::message(message)).await?;
    transport.send(&Frame::Bye).await?;
    // Let the relay read the frames before the socket goes away.
    tokio::time::sleep(Duration::from_millis(100)).await;
    transport.close().await;

    println!("Sent to {} ({})", name, server);
    Ok(())
}

fn cmd_config(path: Option<&std::path::Path>) -> Result<()> {
    let settings = load_settings(path)?;
    let shown = match path {
        Some(p) => p.to_path_buf(),
        None => get_settings_path()?,
    };
    println!("# {}", shown.display());
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_addr() {
        assert_eq!(parse_addr("10.0.0.2:7461").unwrap(), ServerAddr::new("10.0.0.2", 7461));
        assert!(parse_addr("nohost").is_err());
        assert!(parse_addr(":7461").is_err());
        assert!(parse_addr("h:0").is_err());
        assert!(parse_addr("h:port").is_err());
    }

    #[test]
    fn test_agent_args_override_settings() {
        let cli = Commands::parse_from([
            "roamlink",
            "agent",
            "--name",
            "Scout_9",
            "--port",
            "9000",
            "--listen",
            "--destination",
            "away:7461",
            "--broadcast-every-ms",
            "3000",
        ]);
        let Command::Agent(args) = cli.command else {
            panic!("expected agent command");
        };
        let mut settings = Settings::default();
        apply_agent_args(&mut settings, &args);
        assert_eq!(settings.agent.name, "Scout_9");
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert!(settings.agent.listen);
        assert_eq!(settings.travel.destination, Some(ServerAddr::new("away", 7461)));
        assert!(!settings.dashboard.enabled);
        assert_eq!(settings.agent.broadcast_every_ms, Some(3000));
        assert_eq!(settings.agent.reputation_every_ms, None);
    }

    #[tokio::test]
    async fn test_send_reaches_connected_agent() {
        let server = RelayServer::bind("127.0.0.1", 0, "hub").await.unwrap();
        let port = server.local_addr().unwrap().port();
        let hub = server.hub();
        server.spawn();

        let listener = TcpConnector.connect(&ServerAddr::new("127.0.0.1", port)).await.unwrap();
        handshake(listener.as_ref(), &AgentId::new("Scout_1"), Vec::new()).await.unwrap();

        let dir = tempfile::TempDir::new().unwrap();
        let config = dir.path().join("settings.json");
        crate::config::save_settings(&config, &Settings::default()).unwrap();
        let cli = Commands::parse_from([
            "roamlink".to_string(),
            "send".to_string(),
            "/travel".to_string(),
            "--to".to_string(),
            "Scout_1".to_string(),
            "--server".to_string(),
            format!("127.0.0.1:{}", port),
            "--destination".to_string(),
            "away:7461".to_string(),
            "--config".to_string(),
            config.display().to_string(),
        ]);
        cli.run().await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), listener.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match frame {
            Frame::Message { message } => {
                assert!(message.content.is_travel());
                assert_eq!(message.from, AgentId::new("operator"));
                let dest: ServerAddr = serde_json::from_value(message.content.data.unwrap()).unwrap();
                assert_eq!(dest, ServerAddr::new("away", 7461));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(hub.is_connected(&AgentId::new("Scout_1")));
    }
}
