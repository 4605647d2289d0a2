// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Chain Contributors

// SSH Chain - CLI Host Book
// Maps the host references used in profiles to connection parameters

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use dialoguer::{Confirm, Password};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use ssh_chain_common::{app_config_dir, AuthMethod, HostCredential, Zeroizing};
use ssh_chain_connect::{CredentialError, CredentialResolver};

/// Keychain service name for stored secrets
pub const KEYCHAIN_SERVICE: &str = "ssh-chain";

fn default_port() -> u32 {
    22
}

/// One `[hosts.<ref>]` table
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HostEntry {
    pub hostname: String,

    #[serde(default = "default_port")]
    pub port: u32,

    /// Login name; the local user when empty
    #[serde(default)]
    pub user: String,

    /// Private key; password authentication when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<String>,

    #[serde(default)]
    pub password_in_keychain: bool,

    #[serde(default)]
    pub passphrase_in_keychain: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SecretKind {
    Password,
    Passphrase,
}

impl SecretKind {
    fn account(self, host_ref: &str) -> String {
        match self {
            SecretKind::Password => host_ref.to_string(),
            SecretKind::Passphrase => format!("{}:passphrase", host_ref),
        }
    }
}

impl fmt::Display for SecretKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretKind::Password => f.write_str("password"),
            SecretKind::Passphrase => f.write_str("key passphrase"),
        }
    }
}

/// Host references from `hosts.toml`, with secrets from the system keychain
///
/// ```toml
/// [hosts.bastion-a]
/// hostname = "hostA"
/// port = 2222
/// user = "user1"
/// identity_file = "~/.ssh/id_ed25519"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HostBook {
    #[serde(default)]
    pub hosts: BTreeMap<String, HostEntry>,

    /// Prompt on the terminal for secrets the keychain does not have
    #[serde(skip)]
    interactive: bool,

    /// Resolve addresses only; secrets are left empty
    #[serde(skip)]
    addresses_only: bool,
}

impl HostBook {
    /// `<config>/ssh-chain/hosts.toml`
    pub fn default_path() -> Result<PathBuf> {
        Ok(app_config_dir()?.join("hosts.toml"))
    }

    /// Load a host book; a missing file is an empty book
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No host book at {}", path.display());
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read host book {}", path.display()))?;
        let book: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse host book {}", path.display()))?;

        debug!("Loaded {} host(s) from {}", book.hosts.len(), path.display());
        Ok(book)
    }

    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    /// For composing commands, which never carry secrets
    pub fn addresses_only(mut self) -> Self {
        self.addresses_only = true;
        self
    }

    pub fn get(&self, host_ref: &str) -> Option<&HostEntry> {
        self.hosts.get(host_ref)
    }

    async fn secret(
        &self,
        host_ref: &str,
        kind: SecretKind,
        in_keychain: bool,
    ) -> Result<Zeroizing<String>, CredentialError> {
        let lookup_error = |message: String| CredentialError::Lookup {
            host_ref: host_ref.to_string(),
            message,
        };

        if in_keychain {
            let account = kind.account(host_ref);
            let stored = tokio::task::spawn_blocking(move || keychain_get(&account))
                .await
                .map_err(|e| lookup_error(e.to_string()))?;
            match stored {
                Ok(secret) => return Ok(secret),
                Err(e) if self.interactive => {
                    warn!("No {} for '{}' in keychain: {}", kind, host_ref, e);
                }
                Err(e) => return Err(lookup_error(format!("keychain: {}", e))),
            }
        }

        if !self.interactive {
            return Err(lookup_error(format!(
                "no stored {} and prompting is disabled",
                kind
            )));
        }

        let prompt = format!("{} for {}", capitalize(&kind.to_string()), host_ref);
        let account = kind.account(host_ref);
        tokio::task::spawn_blocking(move || prompt_secret(&prompt, &account, in_keychain))
            .await
            .map_err(|e| lookup_error(e.to_string()))?
            .map_err(|e| lookup_error(e.to_string()))
    }
}

#[async_trait]
impl CredentialResolver for HostBook {
    async fn resolve(&self, host_ref: &str) -> Result<HostCredential, CredentialError> {
        let entry = self
            .get(host_ref)
            .ok_or_else(|| CredentialError::UnknownHost(host_ref.to_string()))?;

        let auth = match &entry.identity_file {
            Some(path) => {
                let path = PathBuf::from(shellexpand::tilde(path).to_string());
                let passphrase = if entry.passphrase_in_keychain && !self.addresses_only {
                    Some(
                        self.secret(host_ref, SecretKind::Passphrase, true)
                            .await?,
                    )
                } else {
                    None
                };
                AuthMethod::Key { path, passphrase }
            }
            None if self.addresses_only => AuthMethod::password(""),
            None => AuthMethod::Password {
                secret: self
                    .secret(host_ref, SecretKind::Password, entry.password_in_keychain)
                    .await?,
            },
        };

        Ok(HostCredential::new(
            &entry.hostname,
            entry.port,
            &entry.user,
            auth,
        ))
    }
}

fn keychain_get(account: &str) -> Result<Zeroizing<String>> {
    let entry = keyring::Entry::new(KEYCHAIN_SERVICE, account)?;
    Ok(Zeroizing::new(entry.get_password()?))
}

fn keychain_set(account: &str, secret: &str) -> Result<()> {
    let entry = keyring::Entry::new(KEYCHAIN_SERVICE, account)?;
    entry.set_password(secret)?;
    Ok(())
}

/// Ask on the terminal, offering to store the answer when the entry expects a keychain secret
fn prompt_secret(prompt: &str, account: &str, offer_store: bool) -> Result<Zeroizing<String>> {
    let secret = Zeroizing::new(Password::new().with_prompt(prompt).interact()?);

    if offer_store
        && Confirm::new()
            .with_prompt("Store in system keychain?")
            .default(true)
            .interact()?
    {
        match keychain_set(account, &secret) {
            Ok(()) => debug!("Stored secret for '{}' in keychain", account),
            Err(e) => warn!("Failed to store secret in keychain: {}", e),
        }
    }

    Ok(secret)
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
