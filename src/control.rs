//! UDP control protocol
//!
//! A backend announces itself with one text datagram sent to the control port:
//!
//! ```text
//! add example.com 5665
//! ```
//!
//! after which requests for `example.com` are forwarded to `localhost:5665`.
//! Any process on this machine is trusted; datagrams from anywhere else are dropped.

use crate::error::CommandError;
use crate::routes::{ForwardTarget, Routes};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

pub const DEFAULT_CONTROL_PORT: u16 = 40608;

const MAX_DATAGRAM: usize = 1024;

/// `127.0.0.1:40608`
pub fn default_control_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_CONTROL_PORT)
}

/// A parsed control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `add <domain> <port>`
    Add(ForwardTarget),
    /// `remove <domain>`
    Remove(String),
    /// `shutdown`: the receiving instance exits
    Shutdown,
}

impl Command {
    pub fn parse(message: &str) -> Result<Self, CommandError> {
        let message = message.trim_end();
        let (command, argument) = message.split_once(' ').unwrap_or((message, ""));
        let argument = argument.trim();

        match command {
            "add" => Ok(Command::Add(ForwardTarget::parse(argument)?)),
            "remove" if argument.is_empty() => {
                Err(CommandError::MissingArgument(command.to_string()))
            }
            "remove" => Ok(Command::Remove(argument.to_string())),
            "shutdown" if argument.is_empty() => Ok(Command::Shutdown),
            "shutdown" => Err(CommandError::UnexpectedArgument {
                command: command.to_string(),
                argument: argument.to_string(),
            }),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Add(target) => write!(f, "add {}", target),
            Command::Remove(domain) => write!(f, "remove {}", domain),
            Command::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// What the listener does after handling a datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Shutdown,
}

/// Applies control datagrams to the routing table, one at a time
pub struct ControlListener {
    socket: UdpSocket,
    routes: Routes,
}

impl ControlListener {
    pub fn new(socket: UdpSocket, routes: Routes) -> Self {
        Self { socket, routes }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve until a `shutdown` command arrives
    pub async fn run(self) {
        match self.socket.local_addr() {
            Ok(addr) => info!("Control listener started on udp://{}", addr),
            Err(_) => info!("Control listener started"),
        }

        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("Control socket receive failed: {}", e);
                    continue;
                }
            };

            // Route updates write the routes file, so they run off the async workers
            let routes = self.routes.clone();
            let data = buf[..len].to_vec();
            let handled =
                tokio::task::spawn_blocking(move || handle_datagram(&routes, &data, from)).await;
            let flow = match handled {
                Ok(flow) => flow,
                Err(e) => {
                    warn!("Control message handler failed: {}", e);
                    continue;
                }
            };

            if flow == Flow::Shutdown {
                info!("Received shutdown command from {}", from);
                return;
            }
        }
    }
}

/// Validate, parse and apply one datagram
pub fn handle_datagram(routes: &Routes, data: &[u8], from: SocketAddr) -> Flow {
    if !from.ip().to_canonical().is_loopback() {
        warn!("Dropping control message from non-loopback address {}", from.ip());
        return Flow::Continue;
    }

    let Ok(message) = std::str::from_utf8(data) else {
        warn!("Dropping control message that is not UTF-8 from {}", from);
        return Flow::Continue;
    };

    debug!("Control message from {}: {:?}", from, message);

    match Command::parse(message) {
        Ok(Command::Add(target)) => {
            if let Err(e) = routes.upsert(&target.domain, target.port) {
                warn!("Refusing to add {:?}: {}", message, e);
            }
            Flow::Continue
        }
        Ok(Command::Remove(domain)) => {
            if !routes.remove(&domain) {
                debug!("remove: no route for {}", domain);
            }
            Flow::Continue
        }
        Ok(Command::Shutdown) => Flow::Shutdown,
        Err(e) => {
            warn!("Ignoring control message {:?}: {}", message, e);
            Flow::Continue
        }
    }
}

/// Send one command to the control port at `addr`
pub async fn send_command(addr: SocketAddr, command: &Command) -> io::Result<()> {
    let local = match addr {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 0),
    };

    let socket = UdpSocket::bind(local).await?;
    socket.send_to(command.to_string().as_bytes(), addr).await?;
    Ok(())
}

/// Ask the proxy listening on `addr` to route `domain` to `localhost:port`
pub async fn announce(addr: SocketAddr, domain: &str, port: u16) -> io::Result<()> {
    info!("Announcing {} -> localhost:{}", domain, port);
    send_command(addr, &Command::Add(ForwardTarget::new(domain, port))).await
}
