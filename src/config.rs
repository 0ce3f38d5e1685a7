// Copyright (c) 2024 notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Crate configuration: where trust material and plugins live on disk,
//! and the operational defaults of the verification flow.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::policy::{PolicyError, TrustPolicyDocument};
use crate::truststore::{TrustStore, TrustStoreError};

/// Trust policy document file name inside the configuration directory.
pub const TRUST_POLICY_FILE: &str = "trustpolicy.json";

/// Trust store layout inside the configuration directory.
pub const TRUST_STORE_SUBDIR: &str = "truststore/x509";

/// Plugin layout: `plugins/<name>/notation-<name>`.
pub const PLUGIN_SUBDIR: &str = "plugins";
pub const PLUGIN_BINARY_PREFIX: &str = "notation-";

/// Default bound on signature envelopes processed per verification.
pub const DEFAULT_MAX_SIGNATURE_ATTEMPTS: usize = 100;

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    TrustStore(#[from] TrustStoreError),
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Root directory holding the trust policy, trust stores and plugins.
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// The maximum number of signatures processed when verifying one
    /// artifact.
    #[serde(default = "default_max_signature_attempts")]
    pub max_signature_attempts: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            max_signature_attempts: default_max_signature_attempts(),
        }
    }
}

fn default_max_signature_attempts() -> usize {
    DEFAULT_MAX_SIGNATURE_ATTEMPTS
}

fn default_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(dir).join("notation");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("notation");
    }
    PathBuf::from("/etc/notation")
}

impl Config {
    pub fn trust_policy_path(&self) -> PathBuf {
        self.config_dir.join(TRUST_POLICY_FILE)
    }

    pub fn trust_store_dir(&self) -> PathBuf {
        self.config_dir.join(TRUST_STORE_SUBDIR)
    }

    /// Path of the named plugin's executable.
    pub fn plugin_path(&self, name: &str) -> PathBuf {
        self.config_dir
            .join(PLUGIN_SUBDIR)
            .join(name)
            .join(format!("{PLUGIN_BINARY_PREFIX}{name}"))
    }

    /// Loads and validates the trust policy document.
    pub fn load_trust_policy(&self) -> ConfigResult<TrustPolicyDocument> {
        let path = self.trust_policy_path();
        let bytes = read(&path)?;
        Ok(TrustPolicyDocument::from_json(&bytes)?)
    }

    /// Loads the trust stores from the conventional directory layout.
    pub fn load_trust_store(&self) -> ConfigResult<TrustStore> {
        Ok(TrustStore::from_dir(self.trust_store_dir())?)
    }
}

fn read(path: &Path) -> ConfigResult<Vec<u8>> {
    std::fs::read(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}
