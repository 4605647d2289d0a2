// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Chain Contributors

// Public key and password authentication for one hop

use std::sync::Arc;

use russh::client::{AuthResult, Handle};
use russh::keys::{load_secret_key, PrivateKeyWithHashAlg};
use tracing::{debug, info};

use ssh_chain_common::AuthMethod;

use super::handler::ClientHandler;
use crate::error::TransportError;

/// Login name, falling back to the local user when the credential has none
pub(crate) fn login_name(username: &str) -> String {
    if !username.is_empty() {
        return username.to_string();
    }
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "root".to_string())
}

pub(crate) async fn authenticate(
    session: &mut Handle<ClientHandler>,
    user: &str,
    auth: &AuthMethod,
) -> Result<(), TransportError> {
    let result = match auth {
        AuthMethod::Key { path, passphrase } => {
            let key = load_secret_key(path, passphrase.as_ref().map(|p| p.as_str())).map_err(|e| {
                TransportError::Auth(format!("Failed to load SSH key {}: {}", path.display(), e))
            })?;
            debug!("Loaded key {} for {}", path.display(), user);

            // RSA keys need the hash the server prefers; other key types ignore it
            let hash = session.best_supported_rsa_hash().await?.flatten();
            session
                .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash))
                .await?
        }
        AuthMethod::Password { secret } => {
            session.authenticate_password(user, secret.as_str()).await?
        }
    };

    match result {
        AuthResult::Success => {
            info!("Authenticated as {}", user);
            Ok(())
        }
        AuthResult::Failure {
            remaining_methods,
            partial_success,
        } => {
            let methods: Vec<String> = remaining_methods
                .iter()
                .map(|m| {
                    let s: &str = m.into();
                    s.to_string()
                })
                .collect();
            let remaining = if methods.is_empty() {
                "no methods left".to_string()
            } else {
                format!("server requires: {}", methods.join(", "))
            };
            let kind = match auth {
                AuthMethod::Key { .. } => "Public key",
                AuthMethod::Password { .. } => "Password",
            };
            let message = if partial_success {
                format!("{} accepted but more authentication needed ({})", kind, remaining)
            } else {
                format!("{} authentication rejected ({})", kind, remaining)
            };
            Err(TransportError::Auth(message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_name_keeps_explicit_user() {
        assert_eq!(login_name("user1"), "user1");
        assert!(!login_name("").is_empty());
    }
}
