// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use burrow_core::{LockedIdentity, Node, NodeConfig, RendezvousClient, SecretIdentity};
use clap::Parser;
use tracing::warn;

#[derive(Parser)]
#[command(name = "burrow")]
#[command(about = "Friend-to-friend data sharing node")]
struct Args {
    /// State directory; must already exist.
    #[arg(long)]
    dir: PathBuf,

    /// Run as a rendezvous server on this port instead of a node.
    #[arg(long)]
    rendezvous_port: Option<u16>,

    /// Port the link layer listens on.
    #[arg(long, default_value_t = 31337)]
    port: u16,

    /// Rendezvous server used to publish and resolve addresses.
    #[arg(long, default_value = "localhost:2134")]
    rendezvous: String,

    /// Externally visible host to publish to the rendezvous server.
    #[arg(long)]
    ext_host: Option<String>,

    /// Accepted for compatibility; automatic port mapping is handled
    /// outside this binary.
    #[arg(long)]
    only_upnp: bool,

    /// Accepted for compatibility; automatic port mapping is handled
    /// outside this binary.
    #[arg(long)]
    only_natpmp: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(err) = run(args).await {
        eprintln!("burrow: {err:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    if !args.dir.is_dir() {
        bail!("state directory {} does not exist", args.dir.display());
    }

    if let Some(port) = args.rendezvous_port {
        let server = burrow_core::RendezvousServer::start(
            &format!("0.0.0.0:{port}"),
            args.dir.join("rendezvous.db"),
        )
        .await
        .context("start rendezvous server")?;
        println!("rendezvous server on {}", server.local_addr());
        tokio::signal::ctrl_c().await?;
        server.stop().await;
        return Ok(());
    }

    if args.only_upnp || args.only_natpmp {
        warn!("port mapping flags are accepted but not acted on");
    }

    let identity = load_or_create_identity(&args.dir)?;
    let mut config = NodeConfig::new(&args.dir, identity);
    config.bind = format!("0.0.0.0:{}", args.port)
        .parse()
        .context("bind address")?;
    config.rendezvous = args.rendezvous.clone();

    let node = Node::start(config).await.context("start node")?;
    println!("fingerprint: {}", node.fingerprint());
    println!("passport:    {}", node.passport());

    if let Some(host) = &args.ext_host {
        let client = RendezvousClient::new();
        if let Err(err) = client
            .put(&args.rendezvous, node.identity(), host, args.port)
            .await
        {
            warn!("rendezvous publish failed: {err}");
        }
    }

    tokio::signal::ctrl_c().await?;
    println!("shutting down");
    node.stop().await;
    Ok(())
}

/// Unlock the identity at `<dir>/identity.lock`, creating a fresh one
/// on first run.  The file is the raw locked form:
/// `salt || iv || digest || encrypted key`.
fn load_or_create_identity(dir: &Path) -> anyhow::Result<SecretIdentity> {
    let path = dir.join("identity.lock");
    if path.exists() {
        let bytes = std::fs::read(&path).context("read identity file")?;
        let locked = LockedIdentity::from_bytes(bytes);
        let password = prompt("password: ")?;
        let ident = SecretIdentity::unlock(&locked, &password).context("unlock identity")?;
        Ok(ident)
    } else {
        let password = prompt("new password: ")?;
        println!("generating identity (this can take a moment)");
        let ident = SecretIdentity::generate(&password);
        std::fs::write(&path, ident.lock().as_bytes()).context("write identity file")?;
        Ok(ident)
    }
}

fn prompt(message: &str) -> anyhow::Result<String> {
    print!("{message}");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
