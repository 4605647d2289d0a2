// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Chain Contributors

// SSH Chain - live chain construction
// Builds nested SSH tunnels from a resolved hop plan

pub mod builder;
pub mod connector;
pub mod credentials;
pub mod disposable;
pub mod error;
pub mod handle;
pub mod known_hosts;
pub mod signal;
pub mod ssh;

#[cfg(test)]
mod mock;

pub use builder::ChainBuilder;
pub use connector::{ForwardRequest, ForwardedPort, HopClient, HopConnector, PtyRequest, ShellChannel};
pub use credentials::{materialize_credentials, CredentialResolver, StaticCredentials};
pub use error::{ChainError, CredentialError, Result, TransportError};
pub use handle::ConnectionHandle;
pub use known_hosts::{HostKeyVerdict, KnownHosts};
pub use signal::{DisconnectReason, DisconnectReporter, DisconnectSignal, SubscriptionId};
pub use ssh::{RusshClient, RusshConnector};
