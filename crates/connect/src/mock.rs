// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Chain Contributors

// In-memory hop connector for builder and handle tests

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;

use ssh_chain_common::{
    resolve_from_local, AuthMethod, HopPlan, HostCredential, TunnelNode, TunnelProfile,
};

use crate::connector::{ForwardRequest, ForwardedPort, HopClient, HopConnector, PtyRequest, ShellChannel};
use crate::credentials::StaticCredentials;
use crate::error::TransportError;
use crate::signal::DisconnectReporter;

/// Ordered record of everything the mocks were asked to do
#[derive(Clone, Default)]
pub(crate) struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub(crate) fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, entry: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == entry).count()
    }
}

/// How a connect to a given hostname behaves
#[derive(Clone)]
pub(crate) enum Behavior {
    Fail(&'static str),
    Hang,
}

#[derive(Clone, Default)]
pub(crate) struct MockConnector {
    pub journal: Journal,
    behaviors: Arc<Mutex<HashMap<String, Behavior>>>,
    reporters: Arc<Mutex<Vec<DisconnectReporter>>>,
    next_port: Arc<AtomicU16>,
}

impl MockConnector {
    pub(crate) fn new() -> Self {
        let connector = Self::default();
        connector.next_port.store(40000, Ordering::SeqCst);
        connector
    }

    pub(crate) fn on(self, hostname: &str, behavior: Behavior) -> Self {
        self.behaviors
            .lock()
            .unwrap()
            .insert(hostname.to_string(), behavior);
        self
    }

    /// Reporters handed to each successfully connected hop, in order
    pub(crate) fn reporters(&self) -> Vec<DisconnectReporter> {
        self.reporters.lock().unwrap().clone()
    }
}

#[async_trait]
impl HopConnector for MockConnector {
    async fn connect(
        &self,
        credential: &HostCredential,
        via: Option<SocketAddr>,
        reporter: DisconnectReporter,
    ) -> Result<Arc<dyn HopClient>, TransportError> {
        let route = via.map(|a| a.to_string()).unwrap_or_else(|| "direct".to_string());
        self.journal
            .push(format!("connect {} via {}", credential.hostname, route));

        let behavior = self.behaviors.lock().unwrap().get(&credential.hostname).cloned();
        match behavior {
            Some(Behavior::Fail(message)) => return Err(TransportError::Auth(message.to_string())),
            Some(Behavior::Hang) => std::future::pending::<()>().await,
            None => {}
        }

        self.reporters.lock().unwrap().push(reporter);
        Ok(Arc::new(MockClient {
            name: credential.hostname.clone(),
            journal: self.journal.clone(),
            next_port: self.next_port.clone(),
            alive: AtomicBool::new(true),
        }))
    }
}

pub(crate) struct MockClient {
    name: String,
    journal: Journal,
    next_port: Arc<AtomicU16>,
    alive: AtomicBool,
}

#[async_trait]
impl HopClient for MockClient {
    fn describe(&self) -> String {
        self.name.clone()
    }

    async fn open_forward(
        &self,
        request: ForwardRequest,
    ) -> Result<Box<dyn ForwardedPort>, TransportError> {
        self.journal.push(format!("forward on {}: {}", self.name, request));
        let local_addr = match &request {
            ForwardRequest::Remote { .. } => None,
            _ => {
                let port = self.next_port.fetch_add(1, Ordering::SeqCst);
                Some(SocketAddr::from(([127, 0, 0, 1], port)))
            }
        };
        Ok(Box::new(MockForward {
            label: format!("{} on {}", request, self.name),
            local_addr,
            journal: self.journal.clone(),
        }))
    }

    async fn open_shell(&self, pty: PtyRequest) -> Result<Box<dyn ShellChannel>, TransportError> {
        self.journal
            .push(format!("shell on {} ({}x{})", self.name, pty.cols, pty.rows));
        let (output, first) = broadcast::channel(16);
        Ok(Box::new(MockShell {
            name: self.name.clone(),
            journal: self.journal.clone(),
            output,
            first: Mutex::new(Some(first)),
        }))
    }

    async fn exec(&self, command: &str) -> Result<String, TransportError> {
        self.journal.push(format!("exec on {}: {}", self.name, command));
        if command == "sleep" {
            std::future::pending::<()>().await;
        }
        if command == "false" {
            return Err(TransportError::Channel("exit status 1".to_string()));
        }
        Ok(format!("{}\n", self.name))
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.journal.push(format!("disconnect {}", self.name));
    }
}

struct MockForward {
    label: String,
    local_addr: Option<SocketAddr>,
    journal: Journal,
}

#[async_trait]
impl ForwardedPort for MockForward {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn describe(&self) -> String {
        self.label.clone()
    }

    async fn stop(&self) {
        self.journal.push(format!("stop {}", self.label));
    }
}

struct MockShell {
    name: String,
    journal: Journal,
    output: broadcast::Sender<Vec<u8>>,
    first: Mutex<Option<broadcast::Receiver<Vec<u8>>>>,
}

#[async_trait]
impl ShellChannel for MockShell {
    async fn resize(&self, cols: u32, rows: u32) -> Result<(), TransportError> {
        self.journal
            .push(format!("resize {} {}x{}", self.name, cols, rows));
        Ok(())
    }

    /// Echoes what it is given
    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        let _ = self.output.send(data.to_vec());
        Ok(())
    }

    fn subscribe_output(&self) -> broadcast::Receiver<Vec<u8>> {
        self.first
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| self.output.subscribe())
    }

    async fn close(&self) {
        self.journal.push(format!("close shell on {}", self.name));
    }
}

/// local -> bastion A -> bastion B -> target, with a `-L` and a `-R` on the target
pub(crate) fn three_hop_plan() -> HopPlan {
    let profile = TunnelProfile::new("three-hop".to_string())
        .with_node(TunnelNode::local_machine("local"))
        .with_node(TunnelNode::ssh_host("a", "bastion-a"))
        .with_node(TunnelNode::ssh_host("b", "bastion-b"))
        .with_node(TunnelNode::target_host("t", "target"))
        .with_node(TunnelNode::local_forward("pg", 5432, 5432).with_remote_host("db.internal"))
        .with_node(TunnelNode::remote_forward("rf", 9000, 3000).with_remote_host("localhost"))
        .with_edge("local", "a")
        .with_edge("a", "b")
        .with_edge("b", "t")
        .with_edge("t", "pg")
        .with_edge("t", "rf");
    resolve_from_local(&profile).unwrap()
}

pub(crate) fn credentials() -> StaticCredentials {
    StaticCredentials::new()
        .with("bastion-a", HostCredential::new("hostA", 2222, "user1", AuthMethod::key("/k")))
        .with("bastion-b", HostCredential::new("hostB", 22, "user2", AuthMethod::key("/k")))
        .with("target", HostCredential::new("hostC", 22, "user3", AuthMethod::password("pw")))
}
