// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Chain Contributors

// Host key store in OpenSSH known_hosts format

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use ssh_chain_common::network::{unbracket_host, DEFAULT_SSH_PORT};

/// Outcome of looking a server key up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyVerdict {
    /// A stored key for this host matches
    Trusted,
    /// No key stored for this host
    Unknown,
    /// Keys are stored for this host but none matches
    Changed {
        presented_fingerprint: String,
        source: PathBuf,
        line_number: usize,
    },
}

#[derive(Debug, Clone)]
struct Entry {
    /// Comma-separated host patterns, e.g. `bastion,10.0.0.5` or `[db]:2222`
    hosts: String,
    key_type: String,
    key_data: String,
    comment: Option<String>,
    line_number: usize,
}

impl Entry {
    fn parse(line: &str, line_number: usize) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let mut fields = line.split_whitespace();
        let hosts = fields.next()?;
        // Markers (@cert-authority, @revoked) and hashed names are not supported
        if hosts.starts_with('@') || hosts.starts_with('|') {
            debug!("Skipping unsupported known_hosts entry at line {}", line_number);
            return None;
        }
        let (Some(key_type), Some(key_data)) = (fields.next(), fields.next()) else {
            warn!("Malformed known_hosts entry at line {}", line_number);
            return None;
        };
        let comment = fields.collect::<Vec<_>>().join(" ");

        Some(Entry {
            hosts: hosts.to_string(),
            key_type: key_type.to_string(),
            key_data: key_data.to_string(),
            comment: (!comment.is_empty()).then_some(comment),
            line_number,
        })
    }

    fn to_line(&self) -> String {
        match &self.comment {
            Some(comment) => format!("{} {} {} {}", self.hosts, self.key_type, self.key_data, comment),
            None => format!("{} {} {}", self.hosts, self.key_type, self.key_data),
        }
    }

    fn matches(&self, host: &str, port: u16) -> bool {
        let wanted = host_pattern(host, port);
        self.hosts.split(',').any(|pattern| pattern == wanted)
    }

    fn holds(&self, key_type: &str, key_data: &str) -> bool {
        self.key_type == key_type && self.key_data == key_data
    }
}

/// Entries loaded from one file
#[derive(Debug, Clone)]
struct KnownHostsFile {
    path: PathBuf,
    entries: Vec<Entry>,
}

impl KnownHostsFile {
    fn load(path: &Path) -> Result<Self> {
        let mut entries = Vec::new();

        if path.exists() {
            let file = fs::File::open(path)
                .with_context(|| format!("Failed to open known_hosts file: {}", path.display()))?;
            for (index, line) in BufReader::new(file).lines().enumerate() {
                let line = line.context("Failed to read line from known_hosts")?;
                if let Some(entry) = Entry::parse(&line, index + 1) {
                    entries.push(entry);
                }
            }
            debug!("Loaded {} known host(s) from {}", entries.len(), path.display());
        } else {
            debug!("No known_hosts file at {}", path.display());
        }

        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }
}

/// Known host keys: one writable file plus optional read-only fallbacks
///
/// Lookups consult the writable file first. New keys are only ever
/// appended to the writable file.
#[derive(Debug, Clone)]
pub struct KnownHosts {
    primary: KnownHostsFile,
    fallbacks: Vec<KnownHostsFile>,
}

impl KnownHosts {
    pub fn load_from(path: &Path) -> Result<Self> {
        Ok(Self {
            primary: KnownHostsFile::load(path)?,
            fallbacks: Vec::new(),
        })
    }

    /// Also trust keys recorded in `path` without ever writing to it
    pub fn with_fallback(mut self, path: &Path) -> Result<Self> {
        self.fallbacks.push(KnownHostsFile::load(path)?);
        Ok(self)
    }

    /// `~/.ssh/known_hosts`
    pub fn user_ssh_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;
        Ok(home.join(".ssh").join("known_hosts"))
    }

    pub fn path(&self) -> &Path {
        &self.primary.path
    }

    pub fn len(&self) -> usize {
        self.primary.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primary.entries.is_empty()
    }

    /// Look up `key` for `host:port`
    ///
    /// A host that matches in any file but never with this key is Changed,
    /// even when another file has no entry for it.
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerdict {
        let key_type = key_type(key);
        let key_data = key.public_key_base64();
        let mut first_mismatch: Option<(&Path, usize)> = None;

        for file in std::iter::once(&self.primary).chain(self.fallbacks.iter()) {
            for entry in file.entries.iter().filter(|e| e.matches(host, port)) {
                if entry.holds(&key_type, &key_data) {
                    return HostKeyVerdict::Trusted;
                }
                first_mismatch.get_or_insert((&file.path, entry.line_number));
            }
        }

        match first_mismatch {
            Some((source, line_number)) => HostKeyVerdict::Changed {
                presented_fingerprint: fingerprint(key),
                source: source.to_path_buf(),
                line_number,
            },
            None => HostKeyVerdict::Unknown,
        }
    }

    /// Record `key` for `host:port` in the writable file (in memory)
    pub fn add(&mut self, host: &str, port: u16, key: &PublicKey) {
        let entry = Entry {
            hosts: host_pattern(host, port),
            key_type: key_type(key),
            key_data: key.public_key_base64(),
            comment: None,
            line_number: self.primary.entries.len() + 1,
        };
        info!("Recording {} key for {}", entry.key_type, entry.hosts);
        self.primary.entries.push(entry);
    }

    /// Write the writable file with owner-only permissions
    pub fn save(&self) -> Result<()> {
        let path = &self.primary.path;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create known_hosts directory")?;
        }

        let mut file = fs::File::create(path)
            .with_context(|| format!("Failed to create known_hosts file: {}", path.display()))?;
        writeln!(file, "# ssh-chain known hosts")?;
        for entry in &self.primary.entries {
            writeln!(file, "{}", entry.to_line())?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))
                .context("Failed to set known_hosts file permissions")?;
        }

        debug!("Saved {} known host(s) to {}", self.primary.entries.len(), path.display());
        Ok(())
    }
}

/// `host` on the default port, `[host]:port` otherwise
fn host_pattern(host: &str, port: u16) -> String {
    let host = unbracket_host(host);
    if port == DEFAULT_SSH_PORT {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

fn key_type(key: &PublicKey) -> String {
    key.algorithm().as_str().to_string()
}

/// OpenSSH style `SHA256:...` fingerprint
pub fn fingerprint(key: &PublicKey) -> String {
    let digest = Sha256::digest(key.public_key_bytes());
    let encoded = STANDARD.encode(digest);
    format!("SHA256:{}", encoded.trim_end_matches('='))
}
