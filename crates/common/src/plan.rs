// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Chain Contributors

// Resolved hop sequence handed to the composer and the chain builder

use crate::graph::{NodeKind, TunnelNode};
use crate::types::HostCredential;

/// Destination used when a forward names no host
pub const LOOPBACK_DESTINATION: &str = "localhost";

/// One node on the resolved path
#[derive(Debug, Clone)]
pub struct HopEntry {
    pub node: TunnelNode,
    /// Filled by the credential stage (or supplied directly by the caller)
    pub credential: Option<HostCredential>,
}

impl HopEntry {
    pub fn new(node: TunnelNode) -> Self {
        Self {
            node,
            credential: None,
        }
    }

    pub fn is_ssh_capable(&self) -> bool {
        self.node.kind.is_ssh_capable()
    }
}

/// Where a forward delivers its traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardDestination {
    /// `remote_host` set on the forward node
    Explicit(String),
    /// Hostname of an adjacent target node, known once credentials resolve
    AdjacentTarget { node_id: String, host_ref: String },
    /// Neither was available
    Loopback,
}

/// A forward node to attach to the target session
#[derive(Debug, Clone)]
pub struct PlannedForward {
    pub node: TunnelNode,
    pub destination: ForwardDestination,
    /// Hostname of an adjacent target that is not itself a hop of the plan
    pub resolved_host: Option<String>,
}

impl PlannedForward {
    pub fn new(node: TunnelNode, destination: ForwardDestination) -> Self {
        Self {
            node,
            destination,
            resolved_host: None,
        }
    }
}

/// Ordered hop sequence produced by the resolver
///
/// SSH-capable entries in order are the proxies followed by the target.
#[derive(Debug, Clone, Default)]
pub struct HopPlan {
    pub entries: Vec<HopEntry>,
    pub forwards: Vec<PlannedForward>,
}

impl HopPlan {
    /// SSH-capable entries in path order
    pub fn hops(&self) -> impl Iterator<Item = &HopEntry> {
        self.entries.iter().filter(|e| e.is_ssh_capable())
    }

    pub fn hops_mut(&mut self) -> impl Iterator<Item = &mut HopEntry> {
        self.entries.iter_mut().filter(|e| e.is_ssh_capable())
    }

    pub fn hop_count(&self) -> usize {
        self.hops().count()
    }

    /// Every hop except the last
    pub fn proxies(&self) -> Vec<&HopEntry> {
        let mut hops: Vec<&HopEntry> = self.hops().collect();
        hops.pop();
        hops
    }

    /// Last SSH-capable entry
    pub fn target(&self) -> Option<&HopEntry> {
        self.hops().last()
    }

    /// Entry for a node id, if it is on the path
    pub fn entry(&self, node_id: &str) -> Option<&HopEntry> {
        self.entries.iter().find(|e| e.node.id == node_id)
    }

    /// Hostname a forward delivers to, given the credentials currently on the plan
    ///
    /// `None` while an adjacent target's hostname is still unknown.
    pub fn destination_host<'a>(&'a self, forward: &'a PlannedForward) -> Option<&'a str> {
        match &forward.destination {
            ForwardDestination::Explicit(host) => Some(host),
            ForwardDestination::AdjacentTarget { node_id, .. } => {
                forward.resolved_host.as_deref().or_else(|| {
                    self.entry(node_id)
                        .and_then(|e| e.credential.as_ref())
                        .map(|c| c.hostname.as_str())
                })
            }
            ForwardDestination::Loopback => Some(LOOPBACK_DESTINATION),
        }
    }

    /// Adjacent-target forwards whose hostname is not yet known
    pub fn unresolved_forwards_mut(&mut self) -> Vec<&mut PlannedForward> {
        let known: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.credential.is_some())
            .map(|e| e.node.id.clone())
            .collect();
        self.forwards
            .iter_mut()
            .filter(|f| f.resolved_host.is_none())
            .filter(|f| match &f.destination {
                ForwardDestination::AdjacentTarget { node_id, .. } => !known.contains(node_id),
                _ => false,
            })
            .collect()
    }

    /// Node kinds along the path, for display
    pub fn kinds(&self) -> Vec<NodeKind> {
        self.entries.iter().map(|e| e.node.kind).collect()
    }
}
