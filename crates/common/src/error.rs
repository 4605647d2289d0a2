// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Chain Contributors

// Error types for SSH Chain

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    #[error("Profile already exists: {0}")]
    ProfileExists(String),

    #[error("Invalid tunnel graph: {0}")]
    InvalidGraph(String),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Structural failure while turning a graph into a hop sequence
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Start node '{0}' does not exist in the profile")]
    UnknownStart(String),

    #[error("Profile has no local machine node")]
    NoLocalMachine,

    #[error("No SSH-capable node is reachable from '{0}'")]
    NoPath(String),
}

/// Rejected input while composing a command or preparing a hop
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid character '{character}' in {field} '{value}'")]
    InvalidCharacter {
        field: &'static str,
        value: String,
        character: char,
    },

    #[error("{field} cannot be empty")]
    Empty { field: &'static str },

    #[error("{field} '{value}' cannot start with '-'")]
    LeadingDash { field: &'static str, value: String },

    #[error("{field} {value} is out of range (1-65535)")]
    PortOutOfRange { field: &'static str, value: i64 },

    #[error("Node '{node}' is missing {field}")]
    MissingField { node: String, field: &'static str },

    #[error("Hop '{node}' has no resolved credential")]
    MissingCredential { node: String },

    #[error("Plan contains no SSH-capable hop")]
    NoHops,
}
