// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Chain Contributors

// Path resolution: tunnel graph + start node -> ordered hop plan

use std::collections::HashMap;

use tracing::debug;

use crate::config::TunnelProfile;
use crate::error::ResolveError;
use crate::graph::{adjacent_target, NodeKind, TunnelNode};
use crate::plan::{ForwardDestination, HopEntry, HopPlan, PlannedForward};

/// Node arena with adjacency lists in edge declaration order
struct GraphIndex<'a> {
    nodes: Vec<&'a TunnelNode>,
    adjacency: Vec<Vec<usize>>,
    by_id: HashMap<&'a str, usize>,
}

impl<'a> GraphIndex<'a> {
    fn new(profile: &'a TunnelProfile) -> Self {
        let nodes: Vec<&TunnelNode> = profile.nodes.iter().collect();
        let mut by_id = HashMap::with_capacity(nodes.len());
        for (idx, node) in nodes.iter().enumerate() {
            // First declaration wins on duplicate ids
            by_id.entry(node.id.as_str()).or_insert(idx);
        }

        let mut adjacency = vec![Vec::new(); nodes.len()];
        for edge in &profile.edges {
            match (by_id.get(edge.source.as_str()), by_id.get(edge.target.as_str())) {
                (Some(&from), Some(&to)) if from != to => adjacency[from].push(to),
                _ => debug!("Skipping edge {} -> {}", edge.source, edge.target),
            }
        }

        Self {
            nodes,
            adjacency,
            by_id,
        }
    }
}

/// Ordering key of a candidate path: more hops first, then fewer nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PathScore {
    ssh_count: usize,
    len: usize,
}

impl PathScore {
    fn is_better_than(&self, other: &PathScore) -> bool {
        self.ssh_count > other.ssh_count
            || (self.ssh_count == other.ssh_count && self.len < other.len)
    }
}

/// One level of the explicit DFS stack
struct Frame {
    node: usize,
    next_edge: usize,
    entered_child: bool,
}

/// Resolve the best hop sequence starting at `start_id`
///
/// The best path maximises the number of SSH-capable nodes, then minimises
/// its length; among equal paths the first found in edge order wins. The
/// start node itself is not part of the plan.
pub fn resolve(profile: &TunnelProfile, start_id: &str) -> Result<HopPlan, ResolveError> {
    let index = GraphIndex::new(profile);
    let start = *index
        .by_id
        .get(start_id)
        .ok_or_else(|| ResolveError::UnknownStart(start_id.to_string()))?;

    let mut on_path = vec![false; index.nodes.len()];
    let mut path: Vec<usize> = Vec::new();
    let mut ssh_on_path = 0usize;
    let mut best: Option<(PathScore, Vec<usize>)> = None;

    let mut stack = vec![Frame {
        node: start,
        next_edge: 0,
        entered_child: false,
    }];
    on_path[start] = true;

    while let Some(frame) = stack.last_mut() {
        let children = &index.adjacency[frame.node];

        // Next edge whose head is not already on the current path
        let mut next = None;
        while frame.next_edge < children.len() {
            let child = children[frame.next_edge];
            frame.next_edge += 1;
            if !on_path[child] {
                next = Some(child);
                break;
            }
        }

        match next {
            Some(child) => {
                frame.entered_child = true;
                on_path[child] = true;
                path.push(child);
                if index.nodes[child].kind.is_ssh_capable() {
                    ssh_on_path += 1;
                }
                stack.push(Frame {
                    node: child,
                    next_edge: 0,
                    entered_child: false,
                });
            }
            None => {
                if !frame.entered_child {
                    let score = PathScore {
                        ssh_count: ssh_on_path,
                        len: path.len(),
                    };
                    let replace = match &best {
                        Some((best_score, _)) => score.is_better_than(best_score),
                        None => true,
                    };
                    if replace {
                        best = Some((score, path.clone()));
                    }
                }

                // Backtrack
                let node = frame.node;
                stack.pop();
                on_path[node] = false;
                if node != start {
                    path.pop();
                    if index.nodes[node].kind.is_ssh_capable() {
                        ssh_on_path -= 1;
                    }
                }
            }
        }
    }

    let path = match best {
        Some((score, path)) if score.ssh_count > 0 => path,
        _ => return Err(ResolveError::NoPath(start_id.to_string())),
    };

    let plan = build_plan(profile, &index, &path);
    debug!(
        "Resolved {} hop(s) and {} forward(s) from '{}'",
        plan.hop_count(),
        plan.forwards.len(),
        start_id
    );
    Ok(plan)
}

/// Resolve starting from the profile's local machine node
pub fn resolve_from_local(profile: &TunnelProfile) -> Result<HopPlan, ResolveError> {
    let local = profile
        .local_machine()
        .ok_or(ResolveError::NoLocalMachine)?;
    resolve(profile, &local.id)
}

fn build_plan(profile: &TunnelProfile, index: &GraphIndex<'_>, path: &[usize]) -> HopPlan {
    let entries: Vec<HopEntry> = path
        .iter()
        .map(|&idx| HopEntry::new(index.nodes[idx].clone()))
        .collect();

    // Forward nodes on the path, then those hanging off the target
    let mut forward_nodes: Vec<usize> = path
        .iter()
        .copied()
        .filter(|&idx| index.nodes[idx].kind.is_forward())
        .collect();
    if let Some(&target) = path
        .iter()
        .rev()
        .find(|&&idx| index.nodes[idx].kind.is_ssh_capable())
    {
        for &child in &index.adjacency[target] {
            if index.nodes[child].kind.is_forward() && !forward_nodes.contains(&child) {
                forward_nodes.push(child);
            }
        }
    }

    let forwards = forward_nodes
        .into_iter()
        .map(|idx| {
            let node = index.nodes[idx];
            PlannedForward::new(node.clone(), forward_destination(profile, node))
        })
        .collect();

    HopPlan { entries, forwards }
}

fn forward_destination(profile: &TunnelProfile, node: &TunnelNode) -> ForwardDestination {
    match node.kind {
        NodeKind::LocalPortForward | NodeKind::RemotePortForward => {
            if let Some(host) = node.remote_host.as_deref().map(str::trim) {
                if !host.is_empty() {
                    return ForwardDestination::Explicit(host.to_string());
                }
            }
            match adjacent_target(profile, &node.id) {
                Some(target) => ForwardDestination::AdjacentTarget {
                    node_id: target.id.clone(),
                    host_ref: target.host_ref.clone().unwrap_or_default(),
                },
                None => ForwardDestination::Loopback,
            }
        }
        // SOCKS picks its destination per connection
        NodeKind::DynamicProxy => ForwardDestination::Loopback,
        NodeKind::LocalMachine | NodeKind::SshHost | NodeKind::TargetHost => {
            ForwardDestination::Loopback
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(plan: &HopPlan) -> Vec<&str> {
        plan.hops().map(|e| e.node.id.as_str()).collect()
    }

    fn chain() -> TunnelProfile {
        TunnelProfile::new("chain".to_string())
            .with_node(TunnelNode::local_machine("local"))
            .with_node(TunnelNode::ssh_host("a", "bastion-a"))
            .with_node(TunnelNode::ssh_host("b", "bastion-b"))
            .with_node(TunnelNode::target_host("t", "target"))
            .with_edge("local", "a")
            .with_edge("a", "b")
            .with_edge("b", "t")
    }

    #[test]
    fn test_linear_chain_in_edge_order() {
        let plan = resolve_from_local(&chain()).unwrap();
        assert_eq!(ids(&plan), vec!["a", "b", "t"]);
        assert_eq!(plan.target().unwrap().node.id, "t");
        let proxies: Vec<&str> = plan.proxies().iter().map(|e| e.node.id.as_str()).collect();
        assert_eq!(proxies, vec!["a", "b"]);
        assert!(plan.entry("local").is_none());
    }

    #[test]
    fn test_cycle_terminates() {
        let profile = chain().with_edge("t", "a").with_edge("b", "a");
        let plan = resolve_from_local(&profile).unwrap();
        assert_eq!(ids(&plan), vec!["a", "b", "t"]);
    }

    #[test]
    fn test_cycle_back_to_start() {
        let profile = chain().with_edge("t", "local");
        let plan = resolve_from_local(&profile).unwrap();
        assert_eq!(ids(&plan), vec!["a", "b", "t"]);
    }

    #[test]
    fn test_prefers_more_hops_over_shortcut() {
        let profile = chain().with_edge("local", "t");
        let plan = resolve_from_local(&profile).unwrap();
        assert_eq!(ids(&plan), vec!["a", "b", "t"]);
    }

    #[test]
    fn test_equal_hops_prefers_shorter_then_first() {
        let profile = TunnelProfile::new("p".to_string())
            .with_node(TunnelNode::local_machine("local"))
            .with_node(TunnelNode::ssh_host("x", "x"))
            .with_node(TunnelNode::ssh_host("y", "y"))
            .with_node(TunnelNode::local_forward("fwd", 1, 2))
            .with_node(TunnelNode::target_host("t", "t"))
            .with_edge("local", "fwd")
            .with_edge("fwd", "x")
            .with_edge("x", "t")
            .with_edge("local", "y")
            .with_edge("y", "t")
            .with_edge("local", "x");
        let plan = resolve_from_local(&profile).unwrap();
        // local->fwd->x->t is longer than local->y->t
        assert_eq!(ids(&plan), vec!["y", "t"]);

        let tie = TunnelProfile::new("tie".to_string())
            .with_node(TunnelNode::local_machine("local"))
            .with_node(TunnelNode::ssh_host("x", "x"))
            .with_node(TunnelNode::ssh_host("y", "y"))
            .with_edge("local", "x")
            .with_edge("local", "y");
        assert_eq!(ids(&resolve_from_local(&tie).unwrap()), vec!["x"]);
    }

    #[test]
    fn test_unknown_start_and_no_path() {
        assert_eq!(
            resolve(&chain(), "nope").unwrap_err(),
            ResolveError::UnknownStart("nope".to_string())
        );

        let lonely = TunnelProfile::new("p".to_string())
            .with_node(TunnelNode::local_machine("local"))
            .with_node(TunnelNode::ssh_host("island", "h"))
            .with_node(TunnelNode::dynamic_proxy("socks", 1080))
            .with_edge("local", "socks");
        assert_eq!(
            resolve_from_local(&lonely).unwrap_err(),
            ResolveError::NoPath("local".to_string())
        );

        let empty = TunnelProfile::new("p".to_string());
        assert_eq!(
            resolve_from_local(&empty).unwrap_err(),
            ResolveError::NoLocalMachine
        );
    }

    #[test]
    fn test_resolve_from_inner_node() {
        let plan = resolve(&chain(), "a").unwrap();
        assert_eq!(ids(&plan), vec!["b", "t"]);
    }

    #[test]
    fn test_edges_to_unknown_nodes_are_skipped() {
        let profile = chain().with_edge("a", "ghost");
        assert_eq!(ids(&resolve_from_local(&profile).unwrap()), vec!["a", "b", "t"]);
    }

    #[test]
    fn test_forwards_attached_with_destinations() {
        let profile = chain()
            .with_node(TunnelNode::local_forward("pg", 5432, 5432).with_remote_host("db.internal"))
            .with_node(TunnelNode::remote_forward("back", 9000, 3000))
            .with_node(TunnelNode::dynamic_proxy("socks", 1080))
            .with_node(TunnelNode::local_forward("web", 8080, 80))
            .with_edge("t", "pg")
            .with_edge("t", "back")
            .with_edge("t", "socks")
            // not hanging off the target, so not attached
            .with_edge("a", "web");

        let plan = resolve_from_local(&profile).unwrap();
        let forward_ids: Vec<&str> = plan.forwards.iter().map(|f| f.node.id.as_str()).collect();
        // "pg" is the path leaf (first leaf in edge order), the rest hang off the target
        assert_eq!(forward_ids, vec!["pg", "back", "socks"]);
        assert_eq!(
            plan.forwards[0].destination,
            ForwardDestination::Explicit("db.internal".to_string())
        );
        assert_eq!(
            plan.forwards[1].destination,
            ForwardDestination::AdjacentTarget {
                node_id: "t".to_string(),
                host_ref: "target".to_string()
            }
        );
        assert_eq!(plan.forwards[2].destination, ForwardDestination::Loopback);
        assert_eq!(ids(&plan), vec!["a", "b", "t"]);
    }

    #[test]
    fn test_forward_without_target_defaults_to_loopback() {
        let profile = TunnelProfile::new("p".to_string())
            .with_node(TunnelNode::local_machine("local"))
            .with_node(TunnelNode::ssh_host("a", "a"))
            .with_node(TunnelNode::remote_forward("r", 9000, 3000))
            .with_edge("local", "a")
            .with_edge("a", "r");
        let plan = resolve_from_local(&profile).unwrap();
        assert_eq!(plan.forwards.len(), 1);
        assert_eq!(plan.forwards[0].destination, ForwardDestination::Loopback);
    }
}
