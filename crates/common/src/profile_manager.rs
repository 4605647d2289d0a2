// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Chain Contributors

// SSH Chain - Profile Manager Module
// Profile I/O operations shared by the CLI and library callers

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{app_config_dir, TunnelProfile};
use crate::error::Error;

/// Get the profiles directory path
pub fn profiles_dir() -> Result<PathBuf> {
    Ok(app_config_dir()?.join("profiles"))
}

/// Profiles stored as `<uuid>.toml` files in one directory
#[derive(Debug, Clone)]
pub struct ProfileStore {
    dir: PathBuf,
}

impl ProfileStore {
    /// Store rooted at the default profiles directory
    pub fn open_default() -> Result<Self> {
        Ok(Self::new(profiles_dir()?))
    }

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &Uuid) -> PathBuf {
        self.dir.join(format!("{}.toml", id))
    }

    fn toml_files(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            debug!("Profiles directory does not exist: {}", self.dir.display());
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.dir).context("Failed to read profiles directory")?;
        let mut paths = Vec::new();
        for entry in entries {
            let path = entry?.path();
            // Skip non-TOML files
            if path.extension().and_then(|s| s.to_str()) == Some("toml") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Load all profiles, skipping unreadable files
    pub fn load_all(&self) -> Result<Vec<TunnelProfile>> {
        let mut profiles = Vec::new();
        for path in self.toml_files()? {
            match load_profile(&path) {
                Ok(profile) => {
                    debug!(
                        "Loaded profile: {} ({})",
                        profile.metadata.name, profile.metadata.id
                    );
                    profiles.push(profile);
                }
                Err(e) => {
                    warn!("Failed to load profile {}: {:#}", path.display(), e);
                }
            }
        }
        Ok(profiles)
    }

    /// Load a single profile by its UUID
    pub fn load_by_id(&self, id: &Uuid) -> Result<TunnelProfile> {
        let path = self.path_for(id);
        if !path.exists() {
            return Err(Error::ProfileNotFound(id.to_string()).into());
        }
        load_profile(&path)
    }

    /// Load a single profile by its name
    pub fn load_by_name(&self, name: &str) -> Result<TunnelProfile> {
        self.load_all()?
            .into_iter()
            .find(|p| p.metadata.name == name)
            .ok_or_else(|| Error::ProfileNotFound(name.to_string()).into())
    }

    /// Resolve a user-supplied reference: UUID, profile name, or path to a TOML file
    pub fn find(&self, reference: &str) -> Result<TunnelProfile> {
        if let Ok(id) = Uuid::parse_str(reference) {
            if self.path_for(&id).exists() {
                return self.load_by_id(&id);
            }
        }

        let path = Path::new(reference);
        if path.extension().and_then(|s| s.to_str()) == Some("toml") && path.is_file() {
            return load_profile(path);
        }

        self.load_by_name(reference)
    }

    /// Save a profile
    ///
    /// # Arguments
    /// * `profile` - The profile to save
    /// * `overwrite` - If true, overwrite existing profile. If false, error if one exists
    ///   with the same id or the same name.
    ///
    /// # Returns
    /// The path where the profile was saved
    pub fn save(&self, profile: &TunnelProfile, overwrite: bool) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).context("Failed to create profile directory")?;

        let path = self.path_for(&profile.metadata.id);
        if !overwrite {
            let name_taken = self
                .load_all()?
                .iter()
                .any(|p| p.metadata.name == profile.metadata.name);
            if path.exists() || name_taken {
                return Err(Error::ProfileExists(profile.metadata.name.clone()).into());
            }
        }

        let toml_content =
            toml::to_string_pretty(profile).context("Failed to serialize profile")?;
        fs::write(&path, toml_content)
            .context(format!("Failed to write profile to {}", path.display()))?;

        debug!("Saved profile '{}' to {}", profile.metadata.name, path.display());
        Ok(path)
    }

    /// Delete a profile by UUID
    pub fn delete_by_id(&self, id: &Uuid) -> Result<PathBuf> {
        let path = self.path_for(id);
        if !path.exists() {
            return Err(Error::ProfileNotFound(id.to_string()).into());
        }

        fs::remove_file(&path)
            .context(format!("Failed to delete profile from {}", path.display()))?;

        debug!("Deleted profile at {}", path.display());
        Ok(path)
    }

    /// Delete a profile by name
    pub fn delete_by_name(&self, name: &str) -> Result<PathBuf> {
        let profile = self.load_by_name(name)?;
        self.delete_by_id(&profile.metadata.id)
    }
}

/// Load a single profile from a path
pub fn load_profile(path: &Path) -> Result<TunnelProfile> {
    let contents =
        fs::read_to_string(path).context(format!("Failed to read {}", path.display()))?;

    let profile: TunnelProfile =
        toml::from_str(&contents).context(format!("Failed to parse {}", path.display()))?;

    Ok(profile)
}
