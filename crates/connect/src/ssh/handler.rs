// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Chain Contributors

// russh client handler: host key policy, forwarded-tcpip routing, disconnect reporting

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use russh::client::{self, Msg, Session};
use russh::keys::PublicKey;
use russh::Channel;
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use ssh_chain_common::network::unbracket_host;
use ssh_chain_common::HostKeyPolicy;

use crate::known_hosts::{fingerprint, HostKeyVerdict, KnownHosts};
use crate::signal::{DisconnectReason, DisconnectReporter};

pub(crate) type SharedKnownHosts = Arc<Mutex<KnownHosts>>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Server-side listeners of one session and where their connections go
#[derive(Debug, Clone, Default)]
pub(crate) struct RemoteRoutes {
    inner: Arc<Mutex<HashMap<(String, u32), (String, u16)>>>,
}

impl RemoteRoutes {
    /// Addresses are stored without IPv6 brackets, as servers and sockets expect them
    pub(crate) fn insert(&self, bind_address: &str, bind_port: u32, host: &str, port: u16) {
        lock(&self.inner).insert(
            (unbracket_host(bind_address).to_string(), bind_port),
            (unbracket_host(host).to_string(), port),
        );
    }

    pub(crate) fn remove(&self, bind_address: &str, bind_port: u32) {
        lock(&self.inner).remove(&(unbracket_host(bind_address).to_string(), bind_port));
    }

    /// Exact match first; servers may echo a different spelling of the
    /// bind address, so fall back to the port alone
    pub(crate) fn lookup(&self, address: &str, port: u32) -> Option<(String, u16)> {
        let routes = lock(&self.inner);
        if let Some(dest) = routes.get(&(address.to_string(), port)) {
            return Some(dest.clone());
        }
        routes
            .iter()
            .find(|((_, bound), _)| *bound == port)
            .map(|(_, dest)| dest.clone())
    }
}

/// Host key verification state shared with the connector
#[derive(Clone)]
pub(crate) struct HostKeyCheck {
    pub host: String,
    pub port: u16,
    pub policy: HostKeyPolicy,
    pub known_hosts: SharedKnownHosts,
    /// Why the key was refused, read back when the handshake fails
    pub rejection: Arc<Mutex<Option<String>>>,
}

impl HostKeyCheck {
    fn reject(&self, reason: String) -> bool {
        *lock(&self.rejection) = Some(reason);
        false
    }

    fn verify(&self, key: &PublicKey) -> bool {
        let mut known_hosts = lock(&self.known_hosts);
        match known_hosts.verify(&self.host, self.port, key) {
            HostKeyVerdict::Trusted => {
                debug!("Host key verified for {}:{}", self.host, self.port);
                true
            }
            HostKeyVerdict::Unknown => {
                let presented = fingerprint(key);
                match self.policy {
                    HostKeyPolicy::Strict => self.reject(format!(
                        "{}:{} is not a known host ({}); connect with --accept-new to trust it",
                        self.host, self.port, presented
                    )),
                    HostKeyPolicy::AcceptNew => {
                        warn!(
                            "Permanently adding {}:{} ({}) to {}",
                            self.host,
                            self.port,
                            presented,
                            known_hosts.path().display()
                        );
                        known_hosts.add(&self.host, self.port, key);
                        if let Err(e) = known_hosts.save() {
                            warn!("Failed to save known_hosts: {:#}", e);
                        }
                        true
                    }
                }
            }
            HostKeyVerdict::Changed {
                presented_fingerprint,
                source,
                line_number,
            } => {
                error!("@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@");
                error!("@    WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED!     @");
                error!("@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@");
                error!("Someone could be eavesdropping on you right now (man-in-the-middle attack)!");
                error!("It is also possible that the host key has just been changed.");
                error!("Host: {}:{}", self.host, self.port);
                error!("Presented fingerprint: {}", presented_fingerprint);
                error!("Offending entry: {}:{}", source.display(), line_number);
                self.reject(format!(
                    "host key for {}:{} does not match {}:{}",
                    self.host,
                    self.port,
                    source.display(),
                    line_number
                ))
            }
        }
    }
}

pub(crate) struct ClientHandler {
    check: HostKeyCheck,
    routes: RemoteRoutes,
    reporter: DisconnectReporter,
    closed: Arc<AtomicBool>,
}

impl ClientHandler {
    pub(crate) fn new(
        check: HostKeyCheck,
        routes: RemoteRoutes,
        reporter: DisconnectReporter,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            check,
            routes,
            reporter,
            closed,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(self.check.verify(server_public_key))
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some((host, port)) = self.routes.lookup(connected_address, connected_port) else {
            warn!(
                "No remote forward registered for {}:{}, dropping connection",
                connected_address, connected_port
            );
            return Ok(());
        };

        debug!(
            "Forwarded connection from {}:{} via {}:{} -> {}:{}",
            originator_address, originator_port, connected_address, connected_port, host, port
        );
        tokio::spawn(async move {
            let mut stream = match TcpStream::connect((host.as_str(), port)).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Remote forward could not reach {}:{}: {}", host, port, e);
                    let _ = channel.close().await;
                    return;
                }
            };
            let mut channel_stream = channel.into_stream();
            match copy_bidirectional(&mut stream, &mut channel_stream).await {
                Ok((sent, received)) => debug!(
                    "Remote forward connection closed: {} bytes out, {} bytes in",
                    sent, received
                ),
                Err(e) => debug!("Remote forward connection ended: {}", e),
            }
        });
        Ok(())
    }

    async fn disconnected(
        &mut self,
        reason: client::DisconnectReason<Self::Error>,
    ) -> Result<(), Self::Error> {
        self.closed.store(true, Ordering::SeqCst);
        match reason {
            client::DisconnectReason::ReceivedDisconnect(info) => {
                info!("Server closed the session: {}", info.message);
                self.reporter.report(DisconnectReason::Remote(info.message));
                Ok(())
            }
            client::DisconnectReason::Error(e) => {
                let reason = match &e {
                    russh::Error::IO(io) => DisconnectReason::Socket(io.to_string()),
                    other => DisconnectReason::Protocol(other.to_string()),
                };
                self.reporter.report(reason);
                Err(e)
            }
        }
    }
}
