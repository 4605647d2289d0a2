// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Chain Contributors

// Error types for chain construction

use std::time::Duration;

use thiserror::Error;

use ssh_chain_common::{ResolveError, ValidationError};

/// Failure of a single-hop operation
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to connect to {addr}: {message}")]
    Connect { addr: String, message: String },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Host key rejected: {0}")]
    HostKey(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Port forwarding error: {0}")]
    Forward(String),

    #[error("Session disconnected: {0}")]
    Disconnected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<russh::Error> for TransportError {
    fn from(e: russh::Error) -> Self {
        match e {
            russh::Error::IO(io) => TransportError::Io(io),
            russh::Error::Disconnect => TransportError::Disconnected(e.to_string()),
            other => TransportError::Channel(other.to_string()),
        }
    }
}

/// Failure of the credential lookup collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("Unknown host reference '{0}'")]
    UnknownHost(String),

    #[error("Credential lookup for '{host_ref}' failed: {message}")]
    Lookup { host_ref: String, message: String },
}

/// Failure while building a chain; raised only after full rollback
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Hop {hop} ({host}) failed: {source}")]
    Hop {
        hop: usize,
        host: String,
        #[source]
        source: TransportError,
    },

    #[error("Hop {hop} ({host}) timed out after {}s", timeout.as_secs())]
    Timeout {
        hop: usize,
        host: String,
        timeout: Duration,
    },

    #[error("Chain build cancelled at hop {hop}")]
    Cancelled { hop: usize },

    #[error("No credential for hop {hop}: {source}")]
    Credential {
        hop: usize,
        #[source]
        source: CredentialError,
    },

    #[error("Hop {hop} has invalid parameters: {source}")]
    Validation {
        hop: usize,
        #[source]
        source: ValidationError,
    },

    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

impl ChainError {
    /// 1-based index of the hop that failed, when known
    pub fn hop(&self) -> Option<usize> {
        match self {
            ChainError::Hop { hop, .. }
            | ChainError::Timeout { hop, .. }
            | ChainError::Cancelled { hop }
            | ChainError::Credential { hop, .. }
            | ChainError::Validation { hop, .. } => Some(*hop),
            ChainError::Resolve(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ChainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_hop_context() {
        let err = ChainError::Hop {
            hop: 2,
            host: "hostB:22".to_string(),
            source: TransportError::Auth("Password authentication rejected".to_string()),
        };
        assert_eq!(err.hop(), Some(2));
        let text = err.to_string();
        assert!(text.contains("Hop 2"));
        assert!(text.contains("hostB:22"));

        let err = ChainError::Timeout {
            hop: 1,
            host: "hostA:2222".to_string(),
            timeout: Duration::from_secs(15),
        };
        assert!(err.to_string().ends_with("timed out after 15s"));
        assert_eq!(ChainError::from(ResolveError::NoLocalMachine).hop(), None);
    }
}
