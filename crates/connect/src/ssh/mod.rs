// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Chain Contributors

// Production hop connector built on russh

mod auth;
mod forward;
mod handler;
mod shell;
mod socks;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use russh::client::{self, Config};
use russh::{ChannelMsg, Disconnect};
use tracing::{debug, info, warn};

use ssh_chain_common::network::{format_host_port, unbracket_host};
use ssh_chain_common::{ChainOptions, HostCredential, HostKeyPolicy};

use crate::connector::{ForwardRequest, ForwardedPort, HopClient, HopConnector, PtyRequest, ShellChannel};
use crate::error::TransportError;
use crate::known_hosts::KnownHosts;
use crate::signal::DisconnectReporter;

use self::forward::{Dial, ListenerForward, RemoteForward, SharedSession};
use self::handler::{lock, ClientHandler, HostKeyCheck, RemoteRoutes, SharedKnownHosts};
use self::shell::RusshShell;

/// Connects hops with russh, verifying host keys against known_hosts
pub struct RusshConnector {
    config: Arc<Config>,
    policy: HostKeyPolicy,
    known_hosts: SharedKnownHosts,
}

impl RusshConnector {
    /// Client configuration and known hosts from `options`
    ///
    /// Keys in `~/.ssh/known_hosts` are trusted as well but never modified.
    pub fn new(options: &ChainOptions) -> anyhow::Result<Self> {
        let path = options.known_hosts_path()?;
        let mut known_hosts = KnownHosts::load_from(&path)?;
        if let Ok(user_file) = KnownHosts::user_ssh_path() {
            if user_file.exists() && user_file != path {
                known_hosts = known_hosts.with_fallback(&user_file)?;
            }
        }
        Ok(Self::with_known_hosts(options, known_hosts))
    }

    pub fn with_known_hosts(options: &ChainOptions, known_hosts: KnownHosts) -> Self {
        Self {
            config: Arc::new(client_config(options)),
            policy: options.host_key_policy,
            known_hosts: Arc::new(Mutex::new(known_hosts)),
        }
    }
}

fn client_config(options: &ChainOptions) -> Config {
    let mut config = Config::default();
    config.window_size = options.window_size;
    config.maximum_packet_size = options.max_packet_size;
    config.nodelay = options.nodelay;
    config.keepalive_interval = options.keepalive();
    config.keepalive_max = options.keepalive_max;
    config
}

#[async_trait]
impl HopConnector for RusshConnector {
    async fn connect(
        &self,
        credential: &HostCredential,
        via: Option<SocketAddr>,
        reporter: DisconnectReporter,
    ) -> Result<Arc<dyn HopClient>, TransportError> {
        let endpoint = credential.checked().map_err(|e| TransportError::Connect {
            addr: credential.hostname.clone(),
            message: e.to_string(),
        })?;
        let host = unbracket_host(endpoint.hostname).to_string();
        let addr = format_host_port(&host, endpoint.port);

        let check = HostKeyCheck {
            host: host.clone(),
            port: endpoint.port,
            policy: self.policy,
            known_hosts: self.known_hosts.clone(),
            rejection: Arc::new(Mutex::new(None)),
        };
        let routes = RemoteRoutes::default();
        let closed = Arc::new(AtomicBool::new(false));
        let handler = ClientHandler::new(check.clone(), routes.clone(), reporter.clone(), closed.clone());

        let connected = match via {
            Some(tunnel) => {
                debug!("Connecting to {} through {}", addr, tunnel);
                client::connect(self.config.clone(), tunnel, handler).await
            }
            None => {
                debug!("Connecting to {}", addr);
                client::connect(self.config.clone(), (host.as_str(), endpoint.port), handler).await
            }
        };
        let mut session = connected.map_err(|e| match lock(&check.rejection).take() {
            Some(reason) => TransportError::HostKey(reason),
            None => TransportError::Connect {
                addr: addr.clone(),
                message: e.to_string(),
            },
        })?;

        let user = auth::login_name(endpoint.username);
        if let Err(e) = auth::authenticate(&mut session, &user, &credential.auth).await {
            let _ = session
                .disconnect(Disconnect::ByApplication, "authentication failed", "en")
                .await;
            return Err(e);
        }

        info!("Session established: {}@{}", user, addr);
        Ok(Arc::new(RusshClient {
            label: format!("{}@{}", user, addr),
            session: Arc::new(tokio::sync::Mutex::new(session)),
            routes,
            closed,
            reporter,
        }))
    }
}

/// One authenticated russh session
pub struct RusshClient {
    label: String,
    session: SharedSession,
    routes: RemoteRoutes,
    closed: Arc<AtomicBool>,
    reporter: DisconnectReporter,
}

#[async_trait]
impl HopClient for RusshClient {
    fn describe(&self) -> String {
        self.label.clone()
    }

    async fn open_forward(
        &self,
        request: ForwardRequest,
    ) -> Result<Box<dyn ForwardedPort>, TransportError> {
        let forward: Box<dyn ForwardedPort> = match request {
            ForwardRequest::Local {
                bind_address,
                bind_port,
                host,
                port,
            } => Box::new(
                ListenerForward::start(
                    self.session.clone(),
                    &bind_address,
                    bind_port,
                    Dial::Fixed { host, port },
                    self.reporter.clone(),
                )
                .await?,
            ),
            ForwardRequest::Dynamic {
                bind_address,
                bind_port,
            } => Box::new(
                ListenerForward::start(
                    self.session.clone(),
                    &bind_address,
                    bind_port,
                    Dial::Socks,
                    self.reporter.clone(),
                )
                .await?,
            ),
            ForwardRequest::Remote {
                bind_address,
                bind_port,
                host,
                port,
            } => Box::new(
                RemoteForward::start(
                    self.session.clone(),
                    self.routes.clone(),
                    &bind_address,
                    bind_port,
                    &host,
                    port,
                )
                .await?,
            ),
        };
        Ok(forward)
    }

    async fn open_shell(&self, pty: PtyRequest) -> Result<Box<dyn ShellChannel>, TransportError> {
        let channel = self.session.lock().await.channel_open_session().await?;
        let shell = RusshShell::start(channel, &pty, self.reporter.child("shell")).await?;
        Ok(Box::new(shell))
    }

    async fn exec(&self, command: &str) -> Result<String, TransportError> {
        let mut channel = self.session.lock().await.channel_open_session().await?;
        channel.exec(true, command).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;
        while let Some(message) = channel.wait().await {
            match message {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext } if ext == 1 => stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        match exit_status {
            Some(0) | None => {}
            Some(code) => warn!(
                "'{}' exited with status {} on {}: {}",
                command,
                code,
                self.label,
                String::from_utf8_lossy(&stderr).trim()
            ),
        }
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }

    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let session = self.session.lock().await;
        if let Err(e) = session
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("Disconnect from {} failed: {}", self.label, e);
        }
        debug!("Disconnected {}", self.label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_client_config_from_options() {
        let options = ChainOptions {
            keepalive_interval: 0,
            window_size: 1 << 20,
            ..Default::default()
        };
        let config = client_config(&options);
        assert_eq!(config.window_size, 1 << 20);
        assert_eq!(config.maximum_packet_size, 65535);
        assert!(config.keepalive_interval.is_none());
        assert!(config.nodelay);
    }

    #[test]
    fn test_connector_uses_configured_known_hosts() {
        let dir = TempDir::new().unwrap();
        let options = ChainOptions {
            known_hosts_path: Some(dir.path().join("known_hosts")),
            host_key_policy: HostKeyPolicy::AcceptNew,
            ..Default::default()
        };
        let connector = RusshConnector::new(&options).unwrap();
        assert_eq!(connector.policy, HostKeyPolicy::AcceptNew);
        assert_eq!(
            lock(&connector.known_hosts).path(),
            dir.path().join("known_hosts")
        );
    }
}
