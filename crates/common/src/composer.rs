// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Chain Contributors

// Command composition: materialized hop plan -> portable `ssh` invocation

use tracing::warn;

use crate::error::ValidationError;
use crate::graph::{NodeKind, TunnelNode};
use crate::network::{bracket_host, is_loopback_address, DEFAULT_BIND_ADDRESS};
use crate::plan::{HopEntry, HopPlan, PlannedForward};
use crate::sanitize::{validate_identifier, validate_port};
use crate::types::CheckedEndpoint;

/// A forward whose fields have all been validated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckedForward {
    /// Listen locally, deliver to `host:remote_port` from the target
    Local {
        bind_address: String,
        local_port: u16,
        host: String,
        remote_port: u16,
    },
    /// Listen on the target, deliver to `host:local_port` from this side
    Remote {
        bind_address: String,
        remote_port: u16,
        host: String,
        local_port: u16,
    },
    /// SOCKS listener on this side
    Dynamic {
        bind_address: String,
        local_port: u16,
    },
}

impl CheckedForward {
    /// `ssh` argument pair for this forward
    pub fn to_args(&self) -> [String; 2] {
        match self {
            CheckedForward::Local {
                bind_address,
                local_port,
                host,
                remote_port,
            } => [
                "-L".to_string(),
                format!(
                    "{}:{}:{}:{}",
                    bracket_host(bind_address),
                    local_port,
                    bracket_host(host),
                    remote_port
                ),
            ],
            CheckedForward::Remote {
                bind_address,
                remote_port,
                host,
                local_port,
            } => [
                "-R".to_string(),
                format!(
                    "{}:{}:{}:{}",
                    bracket_host(bind_address),
                    remote_port,
                    bracket_host(host),
                    local_port
                ),
            ],
            CheckedForward::Dynamic {
                bind_address,
                local_port,
            } => [
                "-D".to_string(),
                format!("{}:{}", bracket_host(bind_address), local_port),
            ],
        }
    }

    fn order(&self) -> u8 {
        match self {
            CheckedForward::Local { .. } => 0,
            CheckedForward::Remote { .. } => 1,
            CheckedForward::Dynamic { .. } => 2,
        }
    }
}

/// Bind address of a forward node, loopback unless explicitly set
pub fn effective_bind_address(node: &TunnelNode) -> Result<String, ValidationError> {
    match node.bind_address.as_deref().map(str::trim) {
        None | Some("") => Ok(DEFAULT_BIND_ADDRESS.to_string()),
        Some(address) => {
            let address = validate_identifier(address, "bind address")?;
            if !is_loopback_address(address) {
                warn!(
                    "Forward '{}' binds on non-loopback address {}",
                    node.id, address
                );
            }
            Ok(address.to_string())
        }
    }
}

fn required_port(node: &TunnelNode, value: Option<u32>, field: &'static str) -> Result<u16, ValidationError> {
    let port = value.ok_or_else(|| ValidationError::MissingField {
        node: node.id.clone(),
        field,
    })?;
    validate_port(i64::from(port), field)
}

/// Validate one planned forward against the plan's credentials
pub fn check_forward(plan: &HopPlan, forward: &PlannedForward) -> Result<CheckedForward, ValidationError> {
    let node = &forward.node;
    let destination = || -> Result<String, ValidationError> {
        let host = plan
            .destination_host(forward)
            .ok_or_else(|| ValidationError::MissingCredential {
                node: node.id.clone(),
            })?;
        Ok(validate_identifier(host, "remote host")?.to_string())
    };

    match node.kind {
        NodeKind::LocalPortForward => Ok(CheckedForward::Local {
            bind_address: effective_bind_address(node)?,
            local_port: required_port(node, node.local_port, "local port")?,
            host: destination()?,
            remote_port: required_port(node, node.remote_port, "remote port")?,
        }),
        NodeKind::RemotePortForward => Ok(CheckedForward::Remote {
            bind_address: effective_bind_address(node)?,
            remote_port: required_port(node, node.remote_port, "remote port")?,
            host: destination()?,
            local_port: required_port(node, node.local_port, "local port")?,
        }),
        NodeKind::DynamicProxy => Ok(CheckedForward::Dynamic {
            bind_address: effective_bind_address(node)?,
            local_port: required_port(node, node.local_port, "local port")?,
        }),
        NodeKind::LocalMachine | NodeKind::SshHost | NodeKind::TargetHost => {
            Err(ValidationError::MissingField {
                node: node.id.clone(),
                field: "forward kind",
            })
        }
    }
}

fn checked_endpoint(entry: &HopEntry) -> Result<CheckedEndpoint<'_>, ValidationError> {
    entry
        .credential
        .as_ref()
        .ok_or_else(|| ValidationError::MissingCredential {
            node: entry.node.id.clone(),
        })?
        .checked()
}

/// `[user@]host[:port]`, port omitted when it is the protocol default
///
/// IPv6 literals are always bracketed; `-J` rejects them bare.
fn format_proxy(endpoint: &CheckedEndpoint<'_>) -> String {
    let mut proxy = bracket_host(endpoint.hostname);
    if !endpoint.username.is_empty() {
        proxy = format!("{}@{}", endpoint.username, proxy);
    }
    if !endpoint.is_default_port() {
        proxy = format!("{}:{}", proxy, endpoint.port);
    }
    proxy
}

/// Argument vector equivalent to [`compose`], without the leading `ssh`
pub fn compose_args(plan: &HopPlan) -> Result<Vec<String>, ValidationError> {
    let hops: Vec<&HopEntry> = plan.hops().collect();
    let (target, proxies) = hops.split_last().ok_or(ValidationError::NoHops)?;

    let mut args = Vec::new();

    if !proxies.is_empty() {
        let jumps = proxies
            .iter()
            .map(|entry| checked_endpoint(entry).map(|e| format_proxy(&e)))
            .collect::<Result<Vec<_>, _>>()?;
        args.push("-J".to_string());
        args.push(jumps.join(","));
    }

    let target = checked_endpoint(target)?;
    if !target.is_default_port() {
        args.push("-p".to_string());
        args.push(target.port.to_string());
    }
    args.push(target.user_host());

    let mut forwards = plan
        .forwards
        .iter()
        .map(|f| check_forward(plan, f))
        .collect::<Result<Vec<_>, _>>()?;
    // -L, then -R, then -D; stable within each group
    forwards.sort_by_key(CheckedForward::order);
    for forward in &forwards {
        args.extend(forward.to_args());
    }

    Ok(args)
}

/// Render a materialized plan as `ssh [-J p1,p2] [-p PORT] target [-L ..] [-R ..] [-D ..]`
///
/// Every hop must carry a credential. Hostnames, usernames, bind addresses
/// and forward destinations are checked against the identifier allow-list
/// and every port is range-checked before anything is formatted.
pub fn compose(plan: &HopPlan) -> Result<String, ValidationError> {
    let args = compose_args(plan)?;
    Ok(format!("ssh {}", args.join(" ")))
}
