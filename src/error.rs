//! Error types shared across the proxy

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// A line of the routes file or the argument of an `add` command that could not be parsed
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("expected \"<domain> <port>\", got {0} field(s)")]
    FieldCount(usize),

    #[error("invalid port {0:?}")]
    InvalidPort(String),

    #[error("domain must not be empty")]
    EmptyDomain,
}

/// A control datagram that could not be turned into a command
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command {0:?}")]
    Unknown(String),

    #[error("command {command:?} takes no argument, got {argument:?}")]
    UnexpectedArgument { command: String, argument: String },

    #[error("missing argument for {0:?}")]
    MissingArgument(String),

    #[error(transparent)]
    Route(#[from] RouteError),
}

/// Failures that abort startup
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{addr} is still in use after waiting {waited:?} for the previous instance to exit")]
    AddressBusy { addr: SocketAddr, waited: Duration },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Why a request could not be forwarded to its backend
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("connecting to {backend}: {source}")]
    Connect {
        backend: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),

    #[error("HTTP handshake with backend failed: {0}")]
    Handshake(#[source] hyper::Error),

    #[error("backend request failed: {0}")]
    Backend(#[source] hyper::Error),

    #[error("timed out waiting for the backend response")]
    ResponseTimeout,

    #[error("request cannot be forwarded: {0}")]
    InvalidRequest(String),
}
