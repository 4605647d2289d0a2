// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Chain Contributors

// Forward listeners over one russh session

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use russh::client::Handle;
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use ssh_chain_common::network::{format_host_port, unbracket_host};

use super::handler::{lock, ClientHandler, RemoteRoutes};
use super::socks;
use crate::connector::ForwardedPort;
use crate::error::TransportError;
use crate::signal::{DisconnectReason, DisconnectReporter};

pub(crate) type SharedSession = Arc<tokio::sync::Mutex<Handle<ClientHandler>>>;

/// Channel opens that may fail in a row before the session is presumed dead
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Where a local listener sends each accepted connection
#[derive(Debug, Clone)]
pub(crate) enum Dial {
    /// Always the same destination (`-L`)
    Fixed { host: String, port: u16 },
    /// Destination chosen per connection by a SOCKS5 handshake (`-D`)
    Socks,
}

/// Destination fields of a `direct-tcpip` open; servers resolve the host literally
fn channel_target(host: &str, port: u16) -> (String, u32) {
    (unbracket_host(host).to_string(), u32::from(port))
}

/// State shared by a listener and its connection tasks
#[derive(Clone)]
struct ListenerShared {
    session: SharedSession,
    label: Arc<str>,
    failures: Arc<AtomicU32>,
    reporter: DisconnectReporter,
    cancel: CancellationToken,
}

impl ListenerShared {
    async fn open_channel(
        &self,
        host: &str,
        port: u16,
        peer: SocketAddr,
    ) -> Option<russh::Channel<russh::client::Msg>> {
        let (target_host, target_port) = channel_target(host, port);
        let opened = {
            let session = self.session.lock().await;
            session
                .channel_open_direct_tcpip(
                    target_host,
                    target_port,
                    peer.ip().to_string(),
                    u32::from(peer.port()),
                )
                .await
        };

        match opened {
            Ok(channel) => {
                self.failures.store(0, Ordering::SeqCst);
                Some(channel)
            }
            Err(e) => {
                let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                error!(
                    "{}: failed to open channel to {} ({}/{}): {}",
                    self.label,
                    format_host_port(host, port),
                    failures,
                    MAX_CONSECUTIVE_FAILURES,
                    e
                );
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    self.reporter.report(DisconnectReason::ForwardFailed {
                        forward: self.label.to_string(),
                        message: format!("{} consecutive channel failures", failures),
                    });
                    self.cancel.cancel();
                }
                None
            }
        }
    }
}

/// Background task stopped by [`ListenerTask::stop`] or by dropping it
struct ListenerTask {
    cancel: CancellationToken,
    _guard: DropGuard,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ListenerTask {
    fn spawn<F>(cancel: CancellationToken, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            _guard: cancel.clone().drop_guard(),
            cancel,
            task: Mutex::new(Some(tokio::spawn(future))),
        }
    }

    /// Cancel and join; `None` when already stopped
    async fn stop(&self) -> Option<Result<(), JoinError>> {
        self.cancel.cancel();
        let task = lock(&self.task).take();
        match task {
            Some(task) => Some(task.await),
            None => None,
        }
    }
}

/// Local (`-L`) or dynamic (`-D`) forward
pub(crate) struct ListenerForward {
    label: String,
    local_addr: SocketAddr,
    task: ListenerTask,
}

impl ListenerForward {
    pub(crate) async fn start(
        session: SharedSession,
        bind_address: &str,
        bind_port: u16,
        dial: Dial,
        reporter: DisconnectReporter,
    ) -> Result<Self, TransportError> {
        let bind = format_host_port(bind_address, bind_port);
        let listener = match TcpListener::bind((unbracket_host(bind_address), bind_port)).await {
            Ok(listener) => listener,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(TransportError::Forward(format!(
                    "Permission denied binding to {}; ports below 1024 need elevated privileges",
                    bind
                )));
            }
            Err(e) => {
                return Err(TransportError::Forward(format!("Failed to bind to {}: {}", bind, e)));
            }
        };
        let local_addr = listener.local_addr()?;

        let label = match &dial {
            Dial::Fixed { host, port } => {
                format!("-L {} -> {}", local_addr, format_host_port(host, *port))
            }
            Dial::Socks => format!("-D {}", local_addr),
        };
        info!("Listening: {}", label);

        let cancel = CancellationToken::new();
        let shared = ListenerShared {
            session,
            label: Arc::from(label.as_str()),
            failures: Arc::new(AtomicU32::new(0)),
            reporter: reporter.child(&label),
            cancel: cancel.clone(),
        };
        let task = ListenerTask::spawn(cancel, accept_loop(listener, dial, shared));

        Ok(Self {
            label,
            local_addr,
            task,
        })
    }
}

#[async_trait]
impl ForwardedPort for ListenerForward {
    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }

    fn describe(&self) -> String {
        self.label.clone()
    }

    async fn stop(&self) {
        match self.task.stop().await {
            Some(Ok(())) => debug!("Stopped {}", self.label),
            Some(Err(e)) => warn!("{}: listener task ended abnormally: {}", self.label, e),
            None => {}
        }
    }
}

async fn accept_loop(listener: TcpListener, dial: Dial, shared: ListenerShared) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("{}: accepted connection from {}", shared.label, peer);
                    let shared = shared.clone();
                    let dial = dial.clone();
                    tokio::spawn(async move {
                        let cancel = shared.cancel.clone();
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            _ = serve(stream, peer, dial, shared) => {}
                        }
                    });
                }
                Err(e) => error!("{}: failed to accept connection: {}", shared.label, e),
            }
        }
    }
}

async fn serve(mut stream: TcpStream, peer: SocketAddr, dial: Dial, shared: ListenerShared) {
    let channel = match dial {
        Dial::Fixed { host, port } => match shared.open_channel(&host, port, peer).await {
            Some(channel) => channel,
            None => return,
        },
        Dial::Socks => {
            let (host, port) = match socks::accept(&mut stream).await {
                Ok(target) => target,
                Err(e) => {
                    debug!("{}: SOCKS handshake with {} failed: {}", shared.label, peer, e);
                    return;
                }
            };
            let Some(channel) = shared.open_channel(&host, port, peer).await else {
                let _ = socks::reply(&mut stream, socks::REP_HOST_UNREACHABLE).await;
                return;
            };
            if socks::reply(&mut stream, socks::REP_SUCCESS).await.is_err() {
                return;
            }
            channel
        }
    };

    let mut channel_stream = channel.into_stream();
    match copy_bidirectional(&mut stream, &mut channel_stream).await {
        Ok((sent, received)) => debug!(
            "{}: connection from {} closed ({} bytes out, {} bytes in)",
            shared.label, peer, sent, received
        ),
        Err(e) => debug!("{}: connection from {} ended: {}", shared.label, peer, e),
    }
}

/// Remote (`-R`) forward: a server-side listener routed back through the handler
pub(crate) struct RemoteForward {
    label: String,
    session: SharedSession,
    routes: RemoteRoutes,
    bind_address: String,
    bound_port: u32,
    stopped: CancellationToken,
}

impl RemoteForward {
    pub(crate) async fn start(
        session: SharedSession,
        routes: RemoteRoutes,
        bind_address: &str,
        bind_port: u16,
        host: &str,
        port: u16,
    ) -> Result<Self, TransportError> {
        let bind_address = unbracket_host(bind_address);
        let requested = u32::from(bind_port);
        let bound_port = {
            let mut handle = session.lock().await;
            handle
                .tcpip_forward(bind_address.to_string(), requested)
                .await
                .map_err(|e| {
                    TransportError::Forward(format!(
                        "Server refused to listen on {}: {}",
                        format_host_port(bind_address, bind_port),
                        e
                    ))
                })?
        };
        // Port 0 asks the server to pick one
        let bound_port = if requested == 0 { bound_port } else { requested };
        routes.insert(bind_address, bound_port, host, port);

        let label = format!(
            "-R {}:{} -> {}",
            bind_address,
            bound_port,
            format_host_port(host, port)
        );
        info!("Remote listener active: {}", label);

        Ok(Self {
            label,
            session,
            routes,
            bind_address: bind_address.to_string(),
            bound_port,
            stopped: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl ForwardedPort for RemoteForward {
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn describe(&self) -> String {
        self.label.clone()
    }

    async fn stop(&self) {
        if self.stopped.is_cancelled() {
            return;
        }
        self.stopped.cancel();
        self.routes.remove(&self.bind_address, self.bound_port);

        let mut handle = self.session.lock().await;
        if handle.is_closed() {
            return;
        }
        if let Err(e) = handle
            .cancel_tcpip_forward(self.bind_address.clone(), self.bound_port)
            .await
        {
            debug!("{}: cancel request failed: {}", self.label, e);
        }
        debug!("Stopped {}", self.label);
    }
}

impl Drop for RemoteForward {
    fn drop(&mut self) {
        // Without a route, forwarded-tcpip opens for this listener are refused
        self.routes.remove(&self.bind_address, self.bound_port);
    }
}
