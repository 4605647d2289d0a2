// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Chain Contributors

// Single-hop collaborator traits composed by the chain builder

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use ssh_chain_common::network::{format_host_port, DEFAULT_BIND_ADDRESS};
use ssh_chain_common::{ChainOptions, CheckedForward, HostCredential};

use crate::error::TransportError;
use crate::signal::DisconnectReporter;

/// A listener to open through an established session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardRequest {
    /// Local listener, each connection tunneled to `host:port` via `direct-tcpip`
    Local {
        bind_address: String,
        bind_port: u16,
        host: String,
        port: u16,
    },
    /// Server-side listener, each connection delivered to `host:port` from this side
    Remote {
        bind_address: String,
        bind_port: u16,
        host: String,
        port: u16,
    },
    /// Local SOCKS5 listener
    Dynamic { bind_address: String, bind_port: u16 },
}

impl ForwardRequest {
    /// Ephemeral loopback listener used to reach the next hop
    pub fn hop_tunnel(host: &str, port: u16) -> Self {
        ForwardRequest::Local {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            bind_port: 0,
            host: host.to_string(),
            port,
        }
    }
}

impl From<CheckedForward> for ForwardRequest {
    fn from(forward: CheckedForward) -> Self {
        match forward {
            CheckedForward::Local {
                bind_address,
                local_port,
                host,
                remote_port,
            } => ForwardRequest::Local {
                bind_address,
                bind_port: local_port,
                host,
                port: remote_port,
            },
            CheckedForward::Remote {
                bind_address,
                remote_port,
                host,
                local_port,
            } => ForwardRequest::Remote {
                bind_address,
                bind_port: remote_port,
                host,
                port: local_port,
            },
            CheckedForward::Dynamic {
                bind_address,
                local_port,
            } => ForwardRequest::Dynamic {
                bind_address,
                bind_port: local_port,
            },
        }
    }
}

impl fmt::Display for ForwardRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardRequest::Local {
                bind_address,
                bind_port,
                host,
                port,
            } => write!(
                f,
                "-L {} -> {}",
                format_host_port(bind_address, *bind_port),
                format_host_port(host, *port)
            ),
            ForwardRequest::Remote {
                bind_address,
                bind_port,
                host,
                port,
            } => write!(
                f,
                "-R {} -> {}",
                format_host_port(bind_address, *bind_port),
                format_host_port(host, *port)
            ),
            ForwardRequest::Dynamic {
                bind_address,
                bind_port,
            } => write!(f, "-D {}", format_host_port(bind_address, *bind_port)),
        }
    }
}

/// Terminal parameters for the primary shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

impl From<&ChainOptions> for PtyRequest {
    fn from(options: &ChainOptions) -> Self {
        Self {
            term: options.term.clone(),
            cols: options.cols,
            rows: options.rows,
        }
    }
}

/// Opens one authenticated SSH session
#[async_trait]
pub trait HopConnector: Send + Sync {
    /// Connect to `credential`, through `via` when the hop is tunneled.
    /// The host key is always verified under the credential's real hostname.
    async fn connect(
        &self,
        credential: &HostCredential,
        via: Option<SocketAddr>,
        reporter: DisconnectReporter,
    ) -> Result<Arc<dyn HopClient>, TransportError>;
}

/// An established SSH session
#[async_trait]
pub trait HopClient: Send + Sync {
    fn describe(&self) -> String;

    async fn open_forward(
        &self,
        request: ForwardRequest,
    ) -> Result<Box<dyn ForwardedPort>, TransportError>;

    async fn open_shell(&self, pty: PtyRequest) -> Result<Box<dyn ShellChannel>, TransportError>;

    /// Run a command on a fresh exec channel and collect its output
    async fn exec(&self, command: &str) -> Result<String, TransportError>;

    fn is_alive(&self) -> bool;

    async fn disconnect(&self);
}

/// A running forward listener
#[async_trait]
pub trait ForwardedPort: Send + Sync {
    /// Address of the local listener (`None` for server-side listeners)
    fn local_addr(&self) -> Option<SocketAddr>;

    fn describe(&self) -> String;

    /// Stop listening and wait for the listener task to finish
    async fn stop(&self);
}

/// Interactive shell stream of the target hop
#[async_trait]
pub trait ShellChannel: Send + Sync {
    async fn resize(&self, cols: u32, rows: u32) -> Result<(), TransportError>;

    async fn write(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Output stream; the first receiver also sees output produced before it was taken
    fn subscribe_output(&self) -> broadcast::Receiver<Vec<u8>>;

    async fn close(&self);
}
