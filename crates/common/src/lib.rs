// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Chain Contributors

// SSH Chain - Common Library
// Graph model, path resolution, command composition and profile storage

pub mod composer;
pub mod config;
pub mod error;
pub mod graph;
pub mod network;
pub mod plan;
pub mod profile_manager;
pub mod resolver;
pub mod sanitize;
pub mod types;

pub use composer::{check_forward, compose, compose_args, effective_bind_address, CheckedForward};
pub use config::{app_config_dir, ChainOptions, HostKeyPolicy, ProfileMetadata, TunnelProfile};
pub use error::{Error, ResolveError, Result, ValidationError};
pub use graph::{validate, GraphIssue, GraphIssues, NodeKind, Severity, TunnelEdge, TunnelNode};
pub use network::{is_loopback_address, DEFAULT_BIND_ADDRESS};
pub use plan::{ForwardDestination, HopEntry, HopPlan, PlannedForward};
pub use profile_manager::{load_profile, profiles_dir, ProfileStore};
pub use resolver::{resolve, resolve_from_local};
pub use sanitize::{validate_identifier, validate_port};
pub use types::{AuthMethod, CheckedEndpoint, HostCredential};

// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
pub use uuid::Uuid;
pub use zeroize::Zeroizing;
