//! Single-instance takeover
//!
//! Only one instance can own the control port and the HTTP(S) ports. A new
//! instance that finds the control port taken sends the owner a `shutdown`
//! command, then retries the bind with a growing delay until the port frees up
//! or the deadline passes. A previous instance that refuses to exit is a fatal
//! startup error, never an endless wait.

use crate::control::{self, Command};
use crate::error::StartupError;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, info, warn};

/// How long to wait for a previous instance to let go of its ports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TakeoverPolicy {
    /// First delay after asking the previous instance to exit
    pub grace: Duration,
    /// Upper bound for a single delay between bind attempts
    pub max_delay: Duration,
    /// Total time before giving up
    pub deadline: Duration,
}

impl Default for TakeoverPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(10),
            max_delay: Duration::from_millis(250),
            deadline: Duration::from_secs(2),
        }
    }
}

/// Bind the control socket, shutting down a running instance first if needed
///
/// The returned socket is the one the control listener should serve on.
pub async fn acquire_control_socket(
    addr: SocketAddr,
    policy: TakeoverPolicy,
) -> Result<UdpSocket, StartupError> {
    match UdpSocket::bind(addr).await {
        Ok(socket) => {
            debug!("No previous instance on udp://{}", addr);
            return Ok(socket);
        }
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {}
        Err(source) => return Err(StartupError::Bind { addr, source }),
    }

    info!("Another instance owns udp://{}, sending shutdown command", addr);
    if let Err(e) = control::send_command(addr, &Command::Shutdown).await {
        warn!("Error sending shutdown command: {}", e);
    }

    tokio::time::sleep(policy.grace).await;
    retry_bind(addr, policy, || UdpSocket::bind(addr)).await
}

/// Bind a TCP listener, waiting out a previous instance that is still exiting
pub async fn bind_tcp(addr: SocketAddr, policy: TakeoverPolicy) -> Result<TcpListener, StartupError> {
    retry_bind(addr, policy, || TcpListener::bind(addr)).await
}

async fn retry_bind<T, F, Fut>(
    addr: SocketAddr,
    policy: TakeoverPolicy,
    mut bind: F,
) -> Result<T, StartupError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    let started = Instant::now();
    let mut delay = policy.grace;

    loop {
        match bind().await {
            Ok(bound) => return Ok(bound),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {}
            Err(source) => return Err(StartupError::Bind { addr, source }),
        }

        let waited = started.elapsed();
        if waited >= policy.deadline {
            return Err(StartupError::AddressBusy { addr, waited });
        }

        debug!("{} still in use, retrying in {:?}", addr, delay);
        tokio::time::sleep(delay.min(policy.deadline - waited)).await;
        delay = (delay * 2).min(policy.max_delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlListener;
    use crate::routes::Routes;

    fn quick_policy() -> TakeoverPolicy {
        TakeoverPolicy {
            grace: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            deadline: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_free_port_binds_immediately() {
        let socket = acquire_control_socket("127.0.0.1:0".parse().unwrap(), quick_policy())
            .await
            .unwrap();
        assert!(socket.local_addr().unwrap().port() > 0);
    }

    #[tokio::test]
    async fn test_running_instance_is_replaced() {
        let previous = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = previous.local_addr().unwrap();
        let previous = tokio::spawn(ControlListener::new(previous, Routes::in_memory()).run());

        let socket = acquire_control_socket(addr, TakeoverPolicy::default())
            .await
            .unwrap();

        assert_eq!(socket.local_addr().unwrap(), addr);
        previous.await.unwrap();
    }

    #[tokio::test]
    async fn test_stuck_instance_fails_startup() {
        // Holds the port and never reads the shutdown command
        let stuck = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = stuck.local_addr().unwrap();

        let started = Instant::now();
        let err = acquire_control_socket(addr, quick_policy()).await.unwrap_err();

        assert!(matches!(err, StartupError::AddressBusy { addr: a, .. } if a == addr));
        assert!(started.elapsed() < Duration::from_secs(2));
        drop(stuck);
    }

    #[tokio::test]
    async fn test_bind_tcp_waits_for_release() {
        let previous = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = previous.local_addr().unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(previous);
        });

        let listener = bind_tcp(addr, TakeoverPolicy::default()).await.unwrap();
        assert_eq!(listener.local_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_bind_tcp_gives_up() {
        let stuck = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = stuck.local_addr().unwrap();

        let err = bind_tcp(addr, quick_policy()).await.unwrap_err();
        assert!(matches!(err, StartupError::AddressBusy { .. }));
        assert!(err.to_string().contains(&addr.to_string()));
    }
}
