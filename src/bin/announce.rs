//! CLI tool for talking to a running coreproxy
//!
//! Usage:
//!   coreproxy-announce add <domain> <port>
//!   coreproxy-announce remove <domain>
//!   coreproxy-announce shutdown

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coreproxy::control::{default_control_addr, send_command};
use coreproxy::{Command, ForwardTarget};
use std::net::SocketAddr;

/// Send control commands to coreproxy
#[derive(Parser, Debug)]
#[command(name = "coreproxy-announce")]
#[command(author = "CoreProxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Announce backends to a running coreproxy")]
struct Args {
    /// UDP control address
    #[arg(long, env = "CONTROL_ADDR", default_value_t = default_control_addr())]
    control_addr: SocketAddr,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Route a domain to a local port
    Add {
        /// Domain name (e.g., app.example.com)
        domain: String,

        /// Backend port on localhost
        port: u16,
    },

    /// Stop routing a domain
    Remove {
        /// Domain name
        domain: String,
    },

    /// Ask the running instance to exit
    Shutdown,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let command = match args.command {
        Commands::Add { domain, port } => Command::Add(ForwardTarget::new(domain, port)),
        Commands::Remove { domain } => Command::Remove(domain),
        Commands::Shutdown => Command::Shutdown,
    };

    send_command(args.control_addr, &command)
        .await
        .with_context(|| format!("sending {:?} to {}", command.to_string(), args.control_addr))?;

    println!("Sent \"{}\" to udp://{}", command, args.control_addr);
    Ok(())
}
