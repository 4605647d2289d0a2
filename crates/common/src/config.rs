// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Chain Contributors

// Configuration structures for SSH Chain

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::graph::{self, NodeKind, TunnelEdge, TunnelNode};

/// Name of the configuration directory under the platform config dir
pub const APP_DIR_NAME: &str = "ssh-chain";

/// Complete tunnel profile: a graph of hops plus connection options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelProfile {
    #[serde(flatten)]
    pub metadata: ProfileMetadata,
    #[serde(default)]
    pub nodes: Vec<TunnelNode>,
    #[serde(default)]
    pub edges: Vec<TunnelEdge>,
    #[serde(default)]
    pub options: ChainOptions,
}

/// Identity and bookkeeping, flattened into the top of the profile file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileMetadata {
    /// Also the file stem under the profiles directory
    pub id: Uuid,
    /// Unique within a profile store
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// Free-form, shown by `list`
    #[serde(default)]
    pub tags: Vec<String>,
}

/// How unknown server host keys are treated
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Reject hosts that are not in known_hosts
    #[default]
    Strict,
    /// Trust and record hosts seen for the first time
    AcceptNew,
}

/// Connection behaviour shared by every hop of a chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainOptions {
    /// Per-hop handshake timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Timeout for auxiliary commands in seconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Keepalive interval in seconds (0 = disabled)
    #[serde(default = "default_keepalive")]
    pub keepalive_interval: u64,
    /// Missed keepalives before the session is considered dead
    #[serde(default = "default_keepalive_max")]
    pub keepalive_max: usize,
    /// SSH window size in bytes
    #[serde(default = "default_window_size")]
    pub window_size: u32,
    /// Maximum SSH packet size in bytes
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,
    /// Disable Nagle on the transport sockets
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,
    /// Terminal type requested for the interactive shell
    #[serde(default = "default_term")]
    pub term: String,
    /// Initial terminal width
    #[serde(default = "default_cols")]
    pub cols: u32,
    /// Initial terminal height
    #[serde(default = "default_rows")]
    pub rows: u32,
    /// Host key verification policy
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
    /// known_hosts file (default: ~/.config/ssh-chain/known_hosts)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts_path: Option<PathBuf>,
}

// Default value functions
fn default_connect_timeout() -> u64 {
    15
}

fn default_command_timeout() -> u64 {
    30
}

fn default_keepalive() -> u64 {
    30
}

fn default_keepalive_max() -> usize {
    3
}

fn default_window_size() -> u32 {
    2097152 // 2 MiB
}

fn default_max_packet_size() -> u32 {
    65535
}

fn default_nodelay() -> bool {
    true
}

fn default_term() -> String {
    "xterm-256color".to_string()
}

fn default_cols() -> u32 {
    80
}

fn default_rows() -> u32 {
    24
}

impl Default for ChainOptions {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
            keepalive_interval: default_keepalive(),
            keepalive_max: default_keepalive_max(),
            window_size: default_window_size(),
            max_packet_size: default_max_packet_size(),
            nodelay: default_nodelay(),
            term: default_term(),
            cols: default_cols(),
            rows: default_rows(),
            host_key_policy: HostKeyPolicy::default(),
            known_hosts_path: None,
        }
    }
}

impl ChainOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Keepalive interval, `None` when disabled
    pub fn keepalive(&self) -> Option<Duration> {
        (self.keepalive_interval > 0).then(|| Duration::from_secs(self.keepalive_interval))
    }

    /// Effective known_hosts path
    pub fn known_hosts_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.known_hosts_path {
            return Ok(path.clone());
        }
        Ok(app_config_dir()?.join("known_hosts"))
    }

    /// Reject values that would make every connect fail
    pub fn ensure_valid(&self) -> Result<()> {
        if self.connect_timeout_secs == 0 {
            return Err(Error::Config(
                "connect_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// `~/.config/ssh-chain` (or the platform equivalent)
pub fn app_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;
    Ok(config_dir.join(APP_DIR_NAME))
}

impl TunnelProfile {
    /// Create an empty profile with the given name
    pub fn new(name: String) -> Self {
        let now = Utc::now();
        Self {
            metadata: ProfileMetadata {
                id: Uuid::new_v4(),
                name,
                description: None,
                created_at: now,
                modified_at: now,
                tags: Vec::new(),
            },
            nodes: Vec::new(),
            edges: Vec::new(),
            options: ChainOptions::default(),
        }
    }

    /// Builder-style node insertion
    pub fn with_node(mut self, node: TunnelNode) -> Self {
        self.nodes.push(node);
        self
    }

    /// Builder-style edge insertion
    pub fn with_edge(mut self, source: &str, target: &str) -> Self {
        self.edges.push(TunnelEdge::new(source, target));
        self
    }

    pub fn node(&self, id: &str) -> Option<&TunnelNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// The single local machine node, if present
    pub fn local_machine(&self) -> Option<&TunnelNode> {
        self.nodes
            .iter()
            .find(|n| n.kind == NodeKind::LocalMachine)
    }

    /// Check the options, then fail with every error-severity graph issue joined into one message
    pub fn ensure_valid(&self) -> Result<()> {
        self.options.ensure_valid()?;
        let issues = graph::validate(self);
        let errors: Vec<String> = issues.errors().map(|i| i.to_string()).collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidGraph(errors.join("; ")))
        }
    }
}
