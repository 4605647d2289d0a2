// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Chain Contributors

// Chain builder: hop plan -> nested tunnel with ordered rollback

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use ssh_chain_common::network::format_host_port;
use ssh_chain_common::{
    check_forward, ChainOptions, ForwardDestination, HopEntry, HopPlan, HostCredential,
    ValidationError,
};

use crate::connector::{ForwardRequest, HopClient, HopConnector, PtyRequest, ShellChannel};
use crate::credentials::CredentialResolver;
use crate::disposable::{ClientResource, ForwardResource, ResourceStack, ShellResource};
use crate::error::{ChainError, Result, TransportError};
use crate::handle::ConnectionHandle;
use crate::signal::DisconnectSignal;

/// Output of a successful build before it is wrapped in a handle
struct Established {
    hops: Vec<String>,
    target: Arc<dyn HopClient>,
    shell: Arc<dyn ShellChannel>,
}

/// Per-build state threaded through every step
struct BuildContext<'a> {
    resolver: &'a dyn CredentialResolver,
    cancel: &'a CancellationToken,
    signal: &'a DisconnectSignal,
    stack: ResourceStack,
}

/// Builds nested SSH tunnels one hop at a time
pub struct ChainBuilder {
    connector: Arc<dyn HopConnector>,
    options: ChainOptions,
}

impl ChainBuilder {
    pub fn new(connector: Arc<dyn HopConnector>, options: ChainOptions) -> Self {
        Self { connector, options }
    }

    pub fn options(&self) -> &ChainOptions {
        &self.options
    }

    /// Establish every hop of `plan`, open the target shell and attach forwards
    ///
    /// Each proxy opens an ephemeral loopback forward to the next hop's real
    /// address and the next hop connects through it. Every step runs under the
    /// connect timeout and is raced against `cancel`. On any failure the
    /// resources acquired so far are released newest first before the error
    /// is returned.
    pub async fn build(
        &self,
        plan: &HopPlan,
        resolver: &dyn CredentialResolver,
        cancel: CancellationToken,
    ) -> Result<ConnectionHandle> {
        let signal = DisconnectSignal::new();
        let mut ctx = BuildContext {
            resolver,
            cancel: &cancel,
            signal: &signal,
            stack: ResourceStack::new(),
        };

        match self.build_steps(plan, &mut ctx).await {
            Ok(established) => {
                let stack = std::mem::take(&mut ctx.stack);
                Ok(ConnectionHandle::new(
                    established.hops,
                    established.target,
                    established.shell,
                    stack,
                    signal.clone(),
                ))
            }
            Err(e) => {
                error!("Chain build failed: {}", e);
                info!("Rolling back {} resource(s)", ctx.stack.len());
                signal.mute();
                ctx.stack.unwind().await;
                Err(e)
            }
        }
    }

    async fn build_steps(&self, plan: &HopPlan, ctx: &mut BuildContext<'_>) -> Result<Established> {
        let mut plan = plan.clone();
        let total = plan.hop_count();
        if total == 0 {
            return Err(ChainError::Validation {
                hop: 0,
                source: ValidationError::NoHops,
            });
        }

        let entries: Vec<HopEntry> = plan.hops().cloned().collect();
        let mut hops = Vec::with_capacity(total);
        let mut previous: Option<Arc<dyn HopClient>> = None;

        for (index, entry) in entries.iter().enumerate() {
            let hop = index + 1;
            let credential = self.credential_for(hop, entry, ctx).await?;
            let endpoint = credential
                .checked()
                .map_err(|source| ChainError::Validation { hop, source })?;
            let host = format_host_port(endpoint.hostname, endpoint.port);

            let via = match &previous {
                Some(client) => {
                    let addr = self
                        .open_hop_tunnel(hop, &host, client, endpoint.hostname, endpoint.port, ctx)
                        .await?;
                    Some(addr)
                }
                None => None,
            };

            info!("Connecting hop {}/{}: {}", hop, total, host);
            let reporter = ctx.signal.reporter(format!("hop {} ({})", hop, host));
            let client = self
                .step(hop, &host, ctx, self.connector.connect(&credential, via, reporter))
                .await?;
            ctx.stack.push(ClientResource(client.clone()));
            info!("Hop {}/{} established: {}", hop, total, client.describe());

            hops.push(client.describe());
            // Forwards may name this hop as their destination
            if let Some(slot) = plan.hops_mut().nth(index) {
                slot.credential = Some(credential);
            }
            previous = Some(client);
        }

        let target = previous.ok_or(ChainError::Validation {
            hop: 0,
            source: ValidationError::NoHops,
        })?;
        let target_host = hops.last().cloned().unwrap_or_default();

        let shell: Arc<dyn ShellChannel> = self
            .step(total, &target_host, ctx, target.open_shell(PtyRequest::from(&self.options)))
            .await?
            .into();
        ctx.stack.push(ShellResource(shell.clone()));
        debug!("Primary shell open on {}", target_host);

        self.attach_forwards(&mut plan, total, &target_host, &target, ctx)
            .await?;

        // A hop may have dropped between the last step and here
        if let Some(reason) = ctx.signal.reason() {
            return Err(ChainError::Hop {
                hop: total,
                host: target_host,
                source: TransportError::Disconnected(reason.to_string()),
            });
        }

        info!("Chain established through {} hop(s)", total);
        Ok(Established {
            hops,
            target,
            shell,
        })
    }

    /// Loopback forward through `client` to the next hop's real address
    async fn open_hop_tunnel(
        &self,
        hop: usize,
        host: &str,
        client: &Arc<dyn HopClient>,
        hostname: &str,
        port: u16,
        ctx: &mut BuildContext<'_>,
    ) -> Result<SocketAddr> {
        let request = ForwardRequest::hop_tunnel(hostname, port);
        debug!("Opening tunnel to hop {}: {}", hop, request);
        let forward = self
            .step(hop, host, ctx, client.open_forward(request))
            .await?;
        let addr = forward.local_addr();
        ctx.stack.push(ForwardResource(forward));
        addr.ok_or_else(|| ChainError::Hop {
            hop,
            host: host.to_string(),
            source: TransportError::Forward("tunnel listener has no local address".to_string()),
        })
    }

    /// Start every planned forward on the target session
    async fn attach_forwards(
        &self,
        plan: &mut HopPlan,
        hop: usize,
        host: &str,
        target: &Arc<dyn HopClient>,
        ctx: &mut BuildContext<'_>,
    ) -> Result<()> {
        let forwards = plan.forwards.clone();
        for (index, forward) in forwards.iter().enumerate() {
            // Destination is an adjacent target that is not one of our hops
            let needs_lookup = matches!(forward.destination, ForwardDestination::AdjacentTarget { .. })
                && plan.destination_host(forward).is_none();
            if needs_lookup {
                if let ForwardDestination::AdjacentTarget { host_ref, .. } = &forward.destination {
                    let credential = self.lookup(hop, host_ref, ctx).await?;
                    plan.forwards[index].resolved_host = Some(credential.hostname);
                }
            }

            let checked = check_forward(plan, &plan.forwards[index])
                .map_err(|source| ChainError::Validation { hop, source })?;
            let request = ForwardRequest::from(checked);
            info!("Attaching forward '{}': {}", forward.node.id, request);
            let port = self
                .step(hop, host, ctx, target.open_forward(request))
                .await?;
            ctx.stack.push(ForwardResource(port));
        }
        Ok(())
    }

    async fn credential_for(
        &self,
        hop: usize,
        entry: &HopEntry,
        ctx: &BuildContext<'_>,
    ) -> Result<HostCredential> {
        if let Some(credential) = &entry.credential {
            return Ok(credential.clone());
        }
        let host_ref = entry
            .node
            .host_ref
            .as_deref()
            .ok_or_else(|| ChainError::Validation {
                hop,
                source: ValidationError::MissingField {
                    node: entry.node.id.clone(),
                    field: "host reference",
                },
            })?;
        self.lookup(hop, host_ref, ctx).await
    }

    /// Credential lookup, bounded and cancellable like any other step
    async fn lookup(
        &self,
        hop: usize,
        host_ref: &str,
        ctx: &BuildContext<'_>,
    ) -> Result<HostCredential> {
        let timeout = self.options.connect_timeout();
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(ChainError::Cancelled { hop }),
            result = tokio::time::timeout(timeout, ctx.resolver.resolve(host_ref)) => match result {
                Ok(Ok(credential)) => Ok(credential),
                Ok(Err(source)) => Err(ChainError::Credential { hop, source }),
                Err(_) => Err(ChainError::Timeout {
                    hop,
                    host: host_ref.to_string(),
                    timeout,
                }),
            },
        }
    }

    /// Await one handshake under the connect timeout, racing cancellation
    /// and any disconnect reported by hops already established
    async fn step<T, F>(&self, hop: usize, host: &str, ctx: &BuildContext<'_>, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, TransportError>>,
    {
        let timeout = self.options.connect_timeout();
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                info!("Build cancelled at hop {}", hop);
                Err(ChainError::Cancelled { hop })
            }
            _ = ctx.signal.lost() => Err(ChainError::Hop {
                hop,
                host: host.to_string(),
                source: TransportError::Disconnected(
                    ctx.signal
                        .reason()
                        .map(|r| r.to_string())
                        .unwrap_or_default(),
                ),
            }),
            result = tokio::time::timeout(timeout, fut) => match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(source)) => Err(ChainError::Hop {
                    hop,
                    host: host.to_string(),
                    source,
                }),
                Err(_) => Err(ChainError::Timeout {
                    hop,
                    host: host.to_string(),
                    timeout,
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{materialize_credentials, StaticCredentials};
    use crate::error::CredentialError;
    use crate::mock::{credentials, three_hop_plan, Behavior, MockConnector};
    use crate::signal::DisconnectReason;
    use ssh_chain_common::{resolve_from_local, TunnelNode, TunnelProfile};
    use std::time::Duration;

    fn builder(connector: &MockConnector) -> ChainBuilder {
        ChainBuilder::new(Arc::new(connector.clone()), ChainOptions::default())
    }

    #[tokio::test]
    async fn test_three_hop_build_order() {
        let connector = MockConnector::new();
        let handle = builder(&connector)
            .build(&three_hop_plan(), &credentials(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(handle.hops(), ["hostA", "hostB", "hostC"]);
        assert_eq!(
            connector.journal.entries(),
            vec![
                "connect hostA via direct",
                "forward on hostA: -L 127.0.0.1:0 -> hostB:22",
                "connect hostB via 127.0.0.1:40000",
                "forward on hostB: -L 127.0.0.1:0 -> hostC:22",
                "connect hostC via 127.0.0.1:40001",
                "shell on hostC (80x24)",
                "forward on hostC: -L 127.0.0.1:5432 -> db.internal:5432",
                "forward on hostC: -R 127.0.0.1:9000 -> localhost:3000",
            ]
        );
        assert_eq!(handle.forwards().len(), 4);
        handle.dispose().await;
    }

    #[tokio::test]
    async fn test_failure_at_second_hop_rolls_back_first() {
        let connector = MockConnector::new().on("hostB", Behavior::Fail("Password authentication rejected"));
        let err = builder(&connector)
            .build(&three_hop_plan(), &credentials(), CancellationToken::new())
            .await
            .unwrap_err();

        match &err {
            ChainError::Hop { hop, host, source } => {
                assert_eq!(*hop, 2);
                assert_eq!(host, "hostB:22");
                assert!(matches!(source, TransportError::Auth(_)));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(
            connector.journal.entries(),
            vec![
                "connect hostA via direct",
                "forward on hostA: -L 127.0.0.1:0 -> hostB:22",
                "connect hostB via 127.0.0.1:40000",
                "stop -L 127.0.0.1:0 -> hostB:22 on hostA",
                "disconnect hostA",
            ]
        );
        assert_eq!(connector.journal.count("disconnect hostA"), 1);
        assert!(!connector
            .journal
            .entries()
            .iter()
            .any(|e| e.contains("hostC via")));
    }

    #[tokio::test]
    async fn test_cancellation_rolls_back() {
        let connector = MockConnector::new().on("hostB", Behavior::Hang);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = builder(&connector)
            .build(&three_hop_plan(), &credentials(), cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, ChainError::Cancelled { hop: 2 }));
        let entries = connector.journal.entries();
        assert_eq!(
            &entries[entries.len() - 2..],
            ["stop -L 127.0.0.1:0 -> hostB:22 on hostA", "disconnect hostA"]
        );
    }

    #[tokio::test]
    async fn test_upstream_drop_during_handshake_fails_pending_hop() {
        let connector = MockConnector::new().on("hostB", Behavior::Hang);
        let options = ChainOptions {
            connect_timeout_secs: 300,
            ..Default::default()
        };
        let chain = ChainBuilder::new(Arc::new(connector.clone()), options);
        let plan = three_hop_plan();
        let creds = credentials();
        let build = chain.build(&plan, &creds, CancellationToken::new());
        let drop_first_hop = async {
            while connector.journal.count("connect hostB via 127.0.0.1:40000") == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let reporters = connector.reporters();
            assert_eq!(reporters.len(), 1);
            reporters[0].report(DisconnectReason::Socket("reset".to_string()));
        };

        let (result, ()) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(build, drop_first_hop)
        })
        .await
        .unwrap();
        let err = result.unwrap_err();
        match &err {
            ChainError::Hop { hop, host, source } => {
                assert_eq!(*hop, 2);
                assert_eq!(host, "hostB:22");
                match source {
                    TransportError::Disconnected(reason) => assert!(reason.contains("reset")),
                    other => panic!("unexpected source: {:?}", other),
                }
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(
            connector.journal.count("stop -L 127.0.0.1:0 -> hostB:22 on hostA"),
            1
        );
        assert_eq!(connector.journal.count("disconnect hostA"), 1);
        assert!(!connector
            .journal
            .entries()
            .iter()
            .any(|e| e.contains("hostC")));
    }

    #[tokio::test]
    async fn test_timeout_names_hop() {
        let connector = MockConnector::new().on("hostC", Behavior::Hang);
        let options = ChainOptions {
            connect_timeout_secs: 1,
            ..Default::default()
        };
        let err = ChainBuilder::new(Arc::new(connector.clone()), options)
            .build(&three_hop_plan(), &credentials(), CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            ChainError::Timeout { hop, host, timeout } => {
                assert_eq!(hop, 3);
                assert_eq!(host, "hostC:22");
                assert_eq!(timeout, Duration::from_secs(1));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(connector.journal.count("disconnect hostB"), 1);
        assert_eq!(connector.journal.count("disconnect hostA"), 1);
    }

    #[tokio::test]
    async fn test_missing_credential_rolls_back() {
        let connector = MockConnector::new();
        let partial = StaticCredentials::new()
            .with("bastion-a", HostCredential::new("hostA", 2222, "user1", ssh_chain_common::AuthMethod::key("/k")))
            .with("bastion-b", HostCredential::new("hostB", 22, "user2", ssh_chain_common::AuthMethod::key("/k")));
        let err = builder(&connector)
            .build(&three_hop_plan(), &partial, CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            ChainError::Credential { hop, source } => {
                assert_eq!(hop, 3);
                assert_eq!(source, CredentialError::UnknownHost("target".to_string()));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(connector.journal.count("disconnect hostA"), 1);
        assert_eq!(connector.journal.count("disconnect hostB"), 1);
    }

    #[tokio::test]
    async fn test_invalid_hostname_never_connects() {
        let connector = MockConnector::new();
        let bad = credentials().with(
            "bastion-a",
            HostCredential::new("hostA;rm -rf /", 22, "user1", ssh_chain_common::AuthMethod::key("/k")),
        );
        let err = builder(&connector)
            .build(&three_hop_plan(), &bad, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ChainError::Validation { hop: 1, .. }));
        assert!(connector.journal.entries().is_empty());
    }

    #[tokio::test]
    async fn test_materialized_plan_needs_no_lookup() {
        let connector = MockConnector::new();
        let plan = materialize_credentials(&three_hop_plan(), &credentials())
            .await
            .unwrap();
        let handle = builder(&connector)
            .build(&plan, &StaticCredentials::new(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(handle.hops().len(), 3);
        handle.dispose().await;
    }

    #[tokio::test]
    async fn test_remote_forward_binds_loopback_by_default() {
        let profile = TunnelProfile::new("rf".to_string())
            .with_node(TunnelNode::local_machine("local"))
            .with_node(TunnelNode::target_host("t", "target"))
            .with_node(TunnelNode::remote_forward("rf", 8080, 80).with_remote_host("web"))
            .with_edge("local", "t")
            .with_edge("t", "rf");
        let plan = resolve_from_local(&profile).unwrap();

        let connector = MockConnector::new();
        let handle = builder(&connector)
            .build(&plan, &credentials(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            connector.journal.entries().last().unwrap(),
            "forward on hostC: -R 127.0.0.1:8080 -> web:80"
        );
        handle.dispose().await;
    }
}
