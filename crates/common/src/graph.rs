// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Chain Contributors

// Tunnel graph model: nodes, edges and per-kind field validation

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::TunnelProfile;
use crate::sanitize::validate_port;

/// Kind of a node in the tunnel graph
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// The machine running the chain (graph entry point)
    LocalMachine,
    /// Intermediate SSH server (bastion / jump host)
    SshHost,
    /// Final SSH server where the shell is opened
    TargetHost,
    /// Local port forwarding (-L)
    LocalPortForward,
    /// Remote port forwarding (-R)
    RemotePortForward,
    /// Dynamic port forwarding / SOCKS proxy (-D)
    DynamicProxy,
}

impl NodeKind {
    /// SSH-capable nodes become hops of the chain
    pub fn is_ssh_capable(self) -> bool {
        matches!(self, NodeKind::SshHost | NodeKind::TargetHost)
    }

    pub fn is_forward(self) -> bool {
        matches!(
            self,
            NodeKind::LocalPortForward | NodeKind::RemotePortForward | NodeKind::DynamicProxy
        )
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeKind::LocalMachine => "local machine",
            NodeKind::SshHost => "SSH host",
            NodeKind::TargetHost => "target host",
            NodeKind::LocalPortForward => "local forward",
            NodeKind::RemotePortForward => "remote forward",
            NodeKind::DynamicProxy => "dynamic proxy",
        };
        f.write_str(name)
    }
}

/// A point in the chain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelNode {
    pub id: String,
    pub kind: NodeKind,
    /// Reference into the host store (SSH-capable nodes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ref: Option<String>,
    /// Display label, never used for connection parameters
    #[serde(default)]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_host: Option<String>,
    /// Interface the listening socket binds on, on whichever side opens it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,
}

impl TunnelNode {
    fn bare(id: &str, kind: NodeKind) -> Self {
        Self {
            id: id.to_string(),
            kind,
            host_ref: None,
            label: String::new(),
            local_port: None,
            remote_port: None,
            remote_host: None,
            bind_address: None,
        }
    }

    pub fn local_machine(id: &str) -> Self {
        Self::bare(id, NodeKind::LocalMachine)
    }

    pub fn ssh_host(id: &str, host_ref: &str) -> Self {
        Self {
            host_ref: Some(host_ref.to_string()),
            ..Self::bare(id, NodeKind::SshHost)
        }
    }

    pub fn target_host(id: &str, host_ref: &str) -> Self {
        Self {
            host_ref: Some(host_ref.to_string()),
            ..Self::bare(id, NodeKind::TargetHost)
        }
    }

    /// `-L local_port:remote_host:remote_port`
    pub fn local_forward(id: &str, local_port: u32, remote_port: u32) -> Self {
        Self {
            local_port: Some(local_port),
            remote_port: Some(remote_port),
            ..Self::bare(id, NodeKind::LocalPortForward)
        }
    }

    /// `-R remote_port:remote_host:local_port`
    pub fn remote_forward(id: &str, remote_port: u32, local_port: u32) -> Self {
        Self {
            local_port: Some(local_port),
            remote_port: Some(remote_port),
            ..Self::bare(id, NodeKind::RemotePortForward)
        }
    }

    /// `-D local_port`
    pub fn dynamic_proxy(id: &str, local_port: u32) -> Self {
        Self {
            local_port: Some(local_port),
            ..Self::bare(id, NodeKind::DynamicProxy)
        }
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }

    pub fn with_remote_host(mut self, host: &str) -> Self {
        self.remote_host = Some(host.to_string());
        self
    }

    pub fn with_bind_address(mut self, address: &str) -> Self {
        self.bind_address = Some(address.to_string());
        self
    }

    /// Label if set, id otherwise
    pub fn display_name(&self) -> &str {
        if self.label.is_empty() {
            &self.id
        } else {
            &self.label
        }
    }
}

/// Directed adjacency between two nodes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelEdge {
    pub source: String,
    pub target: String,
}

impl TunnelEdge {
    pub fn new(source: &str, target: &str) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
        }
    }
}

/// Severity of a graph issue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// One problem found while validating a profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphIssue {
    pub severity: Severity,
    pub node_id: Option<String>,
    pub message: String,
}

impl GraphIssue {
    fn error(node_id: Option<&str>, message: String) -> Self {
        Self {
            severity: Severity::Error,
            node_id: node_id.map(str::to_string),
            message,
        }
    }

    fn warning(node_id: Option<&str>, message: String) -> Self {
        Self {
            severity: Severity::Warning,
            node_id: node_id.map(str::to_string),
            message,
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for GraphIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node_id {
            Some(id) => write!(f, "[{}] {}", id, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// All issues found in a profile, in discovery order
#[derive(Debug, Clone, Default)]
pub struct GraphIssues(Vec<GraphIssue>);

impl GraphIssues {
    pub fn has_errors(&self) -> bool {
        self.0.iter().any(GraphIssue::is_error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &GraphIssue> {
        self.0.iter().filter(|i| i.is_error())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &GraphIssue> {
        self.0.iter().filter(|i| !i.is_error())
    }

    pub fn iter(&self) -> impl Iterator<Item = &GraphIssue> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// `TargetHost` node connected to `node_id` by an edge in either direction
pub fn adjacent_target<'a>(profile: &'a TunnelProfile, node_id: &str) -> Option<&'a TunnelNode> {
    profile.edges.iter().find_map(|edge| {
        let other = if edge.source == node_id {
            &edge.target
        } else if edge.target == node_id {
            &edge.source
        } else {
            return None;
        };
        profile
            .node(other)
            .filter(|n| n.kind == NodeKind::TargetHost)
    })
}

/// Validate a profile, collecting every problem instead of stopping at the first
pub fn validate(profile: &TunnelProfile) -> GraphIssues {
    let mut issues = Vec::new();

    // Local machine
    let locals: Vec<&TunnelNode> = profile
        .nodes
        .iter()
        .filter(|n| n.kind == NodeKind::LocalMachine)
        .collect();
    match locals.len() {
        0 => issues.push(GraphIssue::error(
            None,
            "Profile has no local machine node".to_string(),
        )),
        1 => {}
        n => issues.push(GraphIssue::error(
            None,
            format!("Profile has {} local machine nodes, expected exactly one", n),
        )),
    }

    // Node ids
    let mut seen = HashSet::new();
    for node in &profile.nodes {
        if node.id.trim().is_empty() {
            issues.push(GraphIssue::error(None, "Node with empty id".to_string()));
        } else if !seen.insert(node.id.as_str()) {
            issues.push(GraphIssue::error(
                Some(&node.id),
                format!("Duplicate node id '{}'", node.id),
            ));
        }
    }

    // Per-kind fields
    for node in &profile.nodes {
        validate_node_fields(profile, node, &mut issues);
    }

    // Edges
    for edge in &profile.edges {
        if edge.source == edge.target {
            issues.push(GraphIssue::error(
                Some(&edge.source),
                format!("Self edge on '{}'", edge.source),
            ));
            continue;
        }
        for id in [&edge.source, &edge.target] {
            if profile.node(id).is_none() {
                issues.push(GraphIssue::error(
                    None,
                    format!(
                        "Edge {} -> {} references unknown node '{}'",
                        edge.source, edge.target, id
                    ),
                ));
            }
        }
    }

    // Reachability of at least one hop
    if let [local] = locals.as_slice() {
        if !reaches_ssh_node(profile, &local.id) {
            issues.push(GraphIssue::error(
                Some(&local.id),
                "No SSH host is reachable from the local machine".to_string(),
            ));
        }
    }

    GraphIssues(issues)
}

fn validate_node_fields(profile: &TunnelProfile, node: &TunnelNode, issues: &mut Vec<GraphIssue>) {
    let id = node.id.as_str();
    let require_port = |field: &'static str, value: Option<u32>, issues: &mut Vec<GraphIssue>| {
        match value {
            None => issues.push(GraphIssue::error(
                Some(id),
                format!("{} node is missing {}", node.kind, field),
            )),
            Some(port) => {
                if let Err(e) = validate_port(i64::from(port), field) {
                    issues.push(GraphIssue::error(Some(id), e.to_string()));
                }
            }
        }
    };

    match node.kind {
        NodeKind::LocalMachine => {}
        NodeKind::SshHost | NodeKind::TargetHost => {
            let missing = node
                .host_ref
                .as_deref()
                .map(|r| r.trim().is_empty())
                .unwrap_or(true);
            if missing {
                issues.push(GraphIssue::error(
                    Some(id),
                    format!("{} node has no host reference", node.kind),
                ));
            }
        }
        NodeKind::LocalPortForward => {
            require_port("local port", node.local_port, issues);
            require_port("remote port", node.remote_port, issues);
            warn_missing_destination(profile, node, issues);
        }
        NodeKind::RemotePortForward => {
            require_port("remote port", node.remote_port, issues);
            require_port("local port", node.local_port, issues);
            warn_missing_destination(profile, node, issues);
        }
        NodeKind::DynamicProxy => {
            require_port("local port", node.local_port, issues);
        }
    }
}

fn warn_missing_destination(profile: &TunnelProfile, node: &TunnelNode, issues: &mut Vec<GraphIssue>) {
    let has_host = node
        .remote_host
        .as_deref()
        .map(|h| !h.trim().is_empty())
        .unwrap_or(false);
    if !has_host && adjacent_target(profile, &node.id).is_none() {
        issues.push(GraphIssue::warning(
            Some(&node.id),
            format!(
                "{} node has no target host, defaulting to loopback",
                node.kind
            ),
        ));
    }
}

fn reaches_ssh_node(profile: &TunnelProfile, start: &str) -> bool {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &profile.edges {
        adjacency
            .entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
    }

    let mut visited = HashSet::from([start]);
    let mut queue = VecDeque::from([start]);
    while let Some(id) = queue.pop_front() {
        if profile
            .node(id)
            .map(|n| n.kind.is_ssh_capable())
            .unwrap_or(false)
        {
            return true;
        }
        for next in adjacency.get(id).into_iter().flatten() {
            if visited.insert(*next) {
                queue.push_back(*next);
            }
        }
    }
    false
}
