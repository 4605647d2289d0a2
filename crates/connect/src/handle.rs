// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Chain Contributors

// Lifecycle wrapper around an established chain

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::connector::{HopClient, ShellChannel};
use crate::disposable::{ResourceKind, ResourceStack};
use crate::signal::{DisconnectReason, DisconnectSignal, SubscriptionId};

/// A live, possibly nested, SSH connection
///
/// One owner is responsible for calling [`dispose`](Self::dispose). Concurrent
/// `run_command` calls are fine because every call uses its own channel; the
/// handle itself only guards against double disposal.
pub struct ConnectionHandle {
    hops: Vec<String>,
    forwards: Vec<String>,
    target: Arc<dyn HopClient>,
    shell: Arc<dyn ShellChannel>,
    resources: Mutex<Option<ResourceStack>>,
    signal: DisconnectSignal,
    disposed: AtomicBool,
}

impl ConnectionHandle {
    pub(crate) fn new(
        hops: Vec<String>,
        target: Arc<dyn HopClient>,
        shell: Arc<dyn ShellChannel>,
        resources: ResourceStack,
        signal: DisconnectSignal,
    ) -> Self {
        let forwards = resources.describe_kind(ResourceKind::Forward);
        Self {
            hops,
            forwards,
            target,
            shell,
            resources: Mutex::new(Some(resources)),
            signal,
            disposed: AtomicBool::new(false),
        }
    }

    /// Hop descriptions, first proxy to target
    pub fn hops(&self) -> &[String] {
        &self.hops
    }

    /// Forward descriptions, hop tunnels included
    pub fn forwards(&self) -> &[String] {
        &self.forwards
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        !self.is_disposed() && !self.signal.is_fired() && self.target.is_alive()
    }

    /// Reason recorded by the first disconnect report
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.signal.reason()
    }

    pub async fn resize(&self, cols: u32, rows: u32) -> bool {
        if self.is_disposed() {
            return false;
        }
        match self.shell.resize(cols, rows).await {
            Ok(()) => true,
            Err(e) => {
                debug!("Resize to {}x{} failed: {}", cols, rows, e);
                false
            }
        }
    }

    /// Send bytes to the primary shell
    pub async fn write(&self, data: &[u8]) -> bool {
        if self.is_disposed() {
            return false;
        }
        self.shell.write(data).await.is_ok()
    }

    /// Output of the primary shell, `None` once disposed
    pub fn subscribe_output(&self) -> Option<broadcast::Receiver<Vec<u8>>> {
        if self.is_disposed() {
            None
        } else {
            Some(self.shell.subscribe_output())
        }
    }

    /// Run a command on an auxiliary channel of the target
    ///
    /// Returns `None` on failure, timeout, or after disposal.
    pub async fn run_command(&self, command: &str, timeout: Duration) -> Option<String> {
        if !self.is_connected() {
            return None;
        }
        match tokio::time::timeout(timeout, self.target.exec(command)).await {
            Ok(Ok(output)) => Some(output),
            Ok(Err(e)) => {
                warn!("Command failed on {}: {}", self.target.describe(), e);
                None
            }
            Err(_) => {
                warn!(
                    "Command timed out after {}s on {}",
                    timeout.as_secs(),
                    self.target.describe()
                );
                None
            }
        }
    }

    /// Called once when the chain drops, immediately if it already has
    pub fn on_disconnected<F>(&self, callback: F) -> SubscriptionId
    where
        F: FnOnce(&DisconnectReason) + Send + 'static,
    {
        self.signal.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.signal.unsubscribe(id)
    }

    /// Tear the chain down; only the first call does anything
    ///
    /// Listeners are detached first so teardown never reports as a disconnect.
    /// Then the shell closes, forwards stop newest first, and sessions close
    /// from the target back to the first proxy.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            debug!("Connection already disposed");
            return;
        }

        self.signal.mute();

        let stack = self
            .resources
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(mut stack) = stack {
            stack.unwind_kind(ResourceKind::Shell).await;
            stack.unwind_kind(ResourceKind::Forward).await;
            stack.unwind_kind(ResourceKind::Client).await;
        }

        info!("Disconnected chain of {} hop(s)", self.hops.len());
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if !self.is_disposed() {
            warn!("Connection handle dropped without dispose; skipping orderly teardown");
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("hops", &self.hops)
            .field("forwards", &self.forwards)
            .field("disposed", &self.is_disposed())
            .field("disconnect_reason", &self.signal.reason())
            .finish()
    }
}
