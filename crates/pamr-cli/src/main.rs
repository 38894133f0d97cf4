//! PAMR CLI: run a router and administer it.

mod cli;
mod config;

use crate::cli::*;
use anyhow::{bail, Context};
use clap::Parser;
use pamr_types::{AgentConfig, AgentId, MagicCookie, RouterConfig};
use pamr_wire::message::{read_message, write_message, Message, WireError};
use pamr_wire::registry::agent_uri;
use pamr_wire::{Pipeline, RemoteEndpoint, Router, TraceValve, ADMIN_TARGET};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::info;
use url::Url;

fn init_tracing(level: &str, admin_verbose: bool) {
    let fallback = if admin_verbose {
        format!("{level},{ADMIN_TARGET}=debug")
    } else {
        level.to_string()
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback)),
        )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Report configuration problems before the configured subscriber exists.
    let loading = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::WARN)
        .finish();
    let config = tracing::subscriber::with_default(loading, || {
        config::load_config(cli.config.as_deref())
    });

    let verbose = match &cli.command {
        Commands::Router(args) => args.verbose || config.router.admin_verbose,
        _ => false,
    };
    init_tracing(&config.log_level, verbose);

    match cli.command {
        Commands::Router(args) => cmd_router(config.router, args).await,
        Commands::Reload {
            cookie,
            address,
            port,
        } => cmd_reload(&config.agent, &cookie, address, port).await,
        Commands::List { target, json } => cmd_list(config.agent, &target, json).await,
    }
}

async fn cmd_router(mut config: RouterConfig, args: RouterArgs) -> anyhow::Result<()> {
    args.apply(&mut config);
    let pipeline = Pipeline::new().with(Arc::new(TraceValve::new("router")));
    let (router, handle) = Router::start(config, pipeline)
        .await
        .context("cannot start router")?;
    println!(
        "PAMR router {} listening on {}",
        router.router_id(),
        router.local_addr()
    );

    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for interrupt")?;
    info!("Interrupted, stopping router");
    router.stop();
    handle.await.context("router task failed")?;
    Ok(())
}

async fn cmd_reload(
    agent: &AgentConfig,
    cookie: &str,
    address: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let address = address.unwrap_or_else(|| agent.router_address.clone());
    let port = port.unwrap_or(agent.router_port);
    let mut stream = TcpStream::connect((address.as_str(), port))
        .await
        .with_context(|| format!("cannot reach router at {address}:{port}"))?;

    let request = Message::ReloadConfiguration {
        msg_id: 1,
        cookie: MagicCookie::parse(cookie),
    };
    write_message(&mut stream, &request).await?;

    match tokio::time::timeout(Duration::from_secs(10), read_message(&mut stream)).await {
        Ok(Err(WireError::ConnectionClosed)) => {
            println!("Configuration reloaded on {address}:{port}");
            Ok(())
        }
        Ok(Ok(Message::Error(e))) => bail!("router refused the reload ({:?})", e.code),
        Ok(Ok(other)) => bail!("unexpected answer from router: {:?}", other.message_type()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => bail!("router did not answer within 10 s"),
    }
}

async fn cmd_list(agent: AgentConfig, target: &str, json: bool) -> anyhow::Result<()> {
    let uri = match target.parse::<AgentId>() {
        Ok(id) => agent_uri(id)?,
        Err(_) => Url::parse(target).with_context(|| format!("invalid target {target}"))?,
    };
    let endpoint = RemoteEndpoint::connect(agent)
        .await
        .context("cannot connect to router")?;
    let listed = endpoint.list(&uri).await;
    endpoint.shutdown();
    let uris = listed?;

    if json {
        let names: Vec<&str> = uris.iter().map(Url::as_str).collect();
        println!("{}", serde_json::to_string_pretty(&names)?);
    } else if uris.is_empty() {
        println!("No objects exported at {uri}");
    } else {
        for uri in &uris {
            println!("{uri}");
        }
    }
    Ok(())
}
