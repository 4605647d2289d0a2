// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Chain Contributors

// Credential types shared by the composer and the connector

use std::fmt;
use std::path::PathBuf;

use zeroize::Zeroizing;

use crate::error::ValidationError;
use crate::network::DEFAULT_SSH_PORT;
use crate::sanitize::{validate_identifier, validate_optional_identifier, validate_port};

/// How a hop authenticates
#[derive(Clone)]
pub enum AuthMethod {
    /// Private key file, optionally encrypted
    Key {
        path: PathBuf,
        passphrase: Option<Zeroizing<String>>,
    },
    /// Password authentication
    Password { secret: Zeroizing<String> },
}

impl AuthMethod {
    pub fn password(secret: &str) -> Self {
        AuthMethod::Password {
            secret: Zeroizing::new(secret.to_string()),
        }
    }

    pub fn key(path: impl Into<PathBuf>) -> Self {
        AuthMethod::Key {
            path: path.into(),
            passphrase: None,
        }
    }
}

// Secrets never reach Debug output
impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Key { path, passphrase } => f
                .debug_struct("Key")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
            AuthMethod::Password { .. } => f
                .debug_struct("Password")
                .field("secret", &"<redacted>")
                .finish(),
        }
    }
}

/// Connection parameters for one SSH-capable node
#[derive(Debug, Clone)]
pub struct HostCredential {
    pub hostname: String,
    pub port: u32,
    /// May be empty, in which case the user part is omitted
    pub username: String,
    pub auth: AuthMethod,
}

/// A credential whose fields passed sanitization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckedEndpoint<'a> {
    pub hostname: &'a str,
    pub port: u16,
    pub username: &'a str,
}

impl HostCredential {
    pub fn new(hostname: &str, port: u32, username: &str, auth: AuthMethod) -> Self {
        Self {
            hostname: hostname.to_string(),
            port,
            username: username.to_string(),
            auth,
        }
    }

    /// Sanitize hostname and username, range-check the port
    pub fn checked(&self) -> Result<CheckedEndpoint<'_>, ValidationError> {
        Ok(CheckedEndpoint {
            hostname: validate_identifier(&self.hostname, "hostname")?,
            port: validate_port(i64::from(self.port), "port")?,
            username: validate_optional_identifier(&self.username, "username")?,
        })
    }
}

impl CheckedEndpoint<'_> {
    pub fn is_default_port(&self) -> bool {
        self.port == DEFAULT_SSH_PORT
    }

    /// `user@host` or `host`
    pub fn user_host(&self) -> String {
        if self.username.is_empty() {
            self.hostname.to_string()
        } else {
            format!("{}@{}", self.username, self.hostname)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_secrets() {
        let cred = HostCredential::new("db", 22, "admin", AuthMethod::password("hunter2"));
        let text = format!("{:?}", cred);
        assert!(!text.contains("hunter2"));
        assert!(text.contains("<redacted>"));

        let key = AuthMethod::Key {
            path: PathBuf::from("/k"),
            passphrase: Some(Zeroizing::new("open sesame".to_string())),
        };
        assert!(!format!("{:?}", key).contains("open sesame"));
    }

    #[test]
    fn test_checked_rejects_injection() {
        let cred = HostCredential::new("host;reboot", 22, "u", AuthMethod::key("/k"));
        assert!(matches!(
            cred.checked(),
            Err(ValidationError::InvalidCharacter { field: "hostname", .. })
        ));

        let cred = HostCredential::new("host", 0, "u", AuthMethod::key("/k"));
        assert!(matches!(
            cred.checked(),
            Err(ValidationError::PortOutOfRange { value: 0, .. })
        ));
    }

    #[test]
    fn test_user_host() {
        let cred = HostCredential::new("hostA", 2222, "user1", AuthMethod::key("/k"));
        let checked = cred.checked().unwrap();
        assert_eq!(checked.user_host(), "user1@hostA");
        assert!(!checked.is_default_port());

        let cred = HostCredential::new("hostB", 22, "", AuthMethod::key("/k"));
        let checked = cred.checked().unwrap();
        assert_eq!(checked.user_host(), "hostB");
        assert!(checked.is_default_port());
    }
}
