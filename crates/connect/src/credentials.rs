// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Chain Contributors

// Credential stage: fill a hop plan before composing or connecting

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::debug;

use ssh_chain_common::{ForwardDestination, HopPlan, HostCredential, ValidationError};

use crate::error::{ChainError, CredentialError};

/// Maps a node's host reference to connection parameters
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, host_ref: &str) -> Result<HostCredential, CredentialError>;
}

/// In-memory resolver
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    entries: HashMap<String, HostCredential>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, host_ref: &str, credential: HostCredential) {
        self.entries.insert(host_ref.to_string(), credential);
    }

    pub fn with(mut self, host_ref: &str, credential: HostCredential) -> Self {
        self.insert(host_ref, credential);
        self
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentials {
    async fn resolve(&self, host_ref: &str) -> Result<HostCredential, CredentialError> {
        self.entries
            .get(host_ref)
            .cloned()
            .ok_or_else(|| CredentialError::UnknownHost(host_ref.to_string()))
    }
}

/// Fetch every missing credential of a plan, in hop order
///
/// Hops that already carry a credential are left alone. Forwards whose
/// destination is an adjacent target outside the path get that target's
/// hostname. The returned plan can be composed without further I/O.
pub async fn materialize_credentials(
    plan: &HopPlan,
    resolver: &dyn CredentialResolver,
) -> Result<HopPlan, ChainError> {
    let mut plan = plan.clone();

    for (index, entry) in plan.hops_mut().enumerate() {
        let hop = index + 1;
        if entry.credential.is_some() {
            continue;
        }
        let host_ref = entry
            .node
            .host_ref
            .clone()
            .ok_or_else(|| ChainError::Validation {
                hop,
                source: ValidationError::MissingField {
                    node: entry.node.id.clone(),
                    field: "host reference",
                },
            })?;
        let credential = resolver
            .resolve(&host_ref)
            .await
            .map_err(|source| ChainError::Credential { hop, source })?;
        debug!("Resolved credential for hop {} ({})", hop, host_ref);
        entry.credential = Some(credential);
    }

    let target_hop = plan.hop_count();
    for forward in plan.unresolved_forwards_mut() {
        if let ForwardDestination::AdjacentTarget { host_ref, .. } = &forward.destination {
            let credential = resolver
                .resolve(host_ref)
                .await
                .map_err(|source| ChainError::Credential {
                    hop: target_hop,
                    source,
                })?;
            forward.resolved_host = Some(credential.hostname);
        }
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssh_chain_common::{compose, resolve_from_local, AuthMethod, TunnelNode, TunnelProfile};

    fn profile() -> TunnelProfile {
        TunnelProfile::new("p".to_string())
            .with_node(TunnelNode::local_machine("local"))
            .with_node(TunnelNode::ssh_host("a", "bastion-a"))
            .with_node(TunnelNode::target_host("t", "target"))
            .with_node(TunnelNode::target_host("db", "db"))
            .with_node(TunnelNode::local_forward("pg", 5432, 5432))
            .with_edge("local", "a")
            .with_edge("a", "t")
            // db is not on the path, it only names the forward's destination
            .with_edge("db", "pg")
            .with_edge("t", "pg")
    }

    fn resolver() -> StaticCredentials {
        StaticCredentials::new()
            .with("bastion-a", HostCredential::new("hostA", 2222, "user1", AuthMethod::key("/k")))
            .with("target", HostCredential::new("hostC", 22, "user3", AuthMethod::key("/k")))
            .with("db", HostCredential::new("db.internal", 22, "dba", AuthMethod::key("/k")))
    }

    #[tokio::test]
    async fn test_materialize_then_compose() {
        let plan = resolve_from_local(&profile()).unwrap();
        assert_eq!(plan.hop_count(), 2);
        assert!(plan.entry("db").is_none());

        let plan = materialize_credentials(&plan, &resolver()).await.unwrap();
        assert!(plan.hops().all(|e| e.credential.is_some()));
        assert_eq!(
            compose(&plan).unwrap(),
            "ssh -J user1@hostA:2222 user3@hostC -L 127.0.0.1:5432:db.internal:5432"
        );
    }

    #[tokio::test]
    async fn test_missing_credential_tags_hop() {
        let plan = resolve_from_local(&profile()).unwrap();
        let partial = StaticCredentials::new()
            .with("bastion-a", HostCredential::new("hostA", 22, "u", AuthMethod::key("/k")));
        let err = materialize_credentials(&plan, &partial).await.unwrap_err();
        match err {
            ChainError::Credential { hop, source } => {
                assert_eq!(hop, 2);
                assert_eq!(source, CredentialError::UnknownHost("target".to_string()));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_existing_credentials_kept() {
        let mut plan = resolve_from_local(&profile()).unwrap();
        for entry in plan.hops_mut() {
            entry.credential = Some(HostCredential::new("preset", 22, "me", AuthMethod::key("/k")));
        }
        let only_db = StaticCredentials::new()
            .with("db", HostCredential::new("db.internal", 22, "dba", AuthMethod::key("/k")));
        let plan = materialize_credentials(&plan, &only_db).await.unwrap();
        assert_eq!(plan.forwards[0].resolved_host.as_deref(), Some("db.internal"));
        assert!(plan
            .hops()
            .all(|e| e.credential.as_ref().unwrap().hostname == "preset"));
    }
}
