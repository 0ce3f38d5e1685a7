// Copyright (c) 2024 notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Named trust stores grouped by store type. Stores are loaded once per
//! invocation and read-only afterwards.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use strum_macros::{Display, EnumString};
use thiserror::Error;

use crate::crypto::certificate::{Certificate, CertificateError};

pub type TrustStoreResult<T> = std::result::Result<T, TrustStoreError>;

#[derive(Error, Debug)]
pub enum TrustStoreError {
    #[error("trust store {name:?} of type {store_type} has no certificates")]
    EmptyStore {
        store_type: TrustStoreType,
        name: String,
    },

    #[error("trust store {name:?} does not exist for type {store_type}")]
    StoreNotFound {
        store_type: TrustStoreType,
        name: String,
    },

    #[error(
        "single certificate with subject {subject:?} in store {name:?} is neither self-signed nor a CA certificate"
    )]
    NotAnAnchor { name: String, subject: String },

    #[error(
        "certificate with subject {subject:?} in store {name:?} is not a CA certificate; multi-certificate stores may only contain CA certificates"
    )]
    NotACa { name: String, subject: String },

    #[error("{path:?} is not a regular file; symlinks and directories are not allowed in trust stores")]
    NotARegularFile { path: String },

    #[error("invalid trust store reference {0:?}, expected \"<type>:<name>\"")]
    InvalidStoreRef(String),

    #[error("failed to read trust store from {path:?}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse certificate in {path:?}: {source}")]
    BadCertificate {
        path: String,
        #[source]
        source: CertificateError,
    },
}

/// The three trust store classes of the trust policy model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString)]
pub enum TrustStoreType {
    #[strum(serialize = "ca")]
    Ca,
    #[strum(serialize = "signingAuthority")]
    SigningAuthority,
    #[strum(serialize = "tsa")]
    Tsa,
}

/// A `"<type>:<name>"` reference as written in trust policy statements.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TrustStoreRef {
    pub store_type: TrustStoreType,
    pub name: String,
}

impl FromStr for TrustStoreRef {
    type Err = TrustStoreError;

    fn from_str(s: &str) -> TrustStoreResult<Self> {
        let (ty, name) = s
            .split_once(':')
            .ok_or_else(|| TrustStoreError::InvalidStoreRef(s.to_string()))?;
        if name.is_empty() {
            return Err(TrustStoreError::InvalidStoreRef(s.to_string()));
        }
        let store_type = TrustStoreType::from_str(ty)
            .map_err(|_| TrustStoreError::InvalidStoreRef(s.to_string()))?;
        Ok(Self {
            store_type,
            name: name.to_string(),
        })
    }
}

/// In-memory trust stores keyed by `(type, name)`.
#[derive(Debug, Default)]
pub struct TrustStore {
    stores: HashMap<(TrustStoreType, String), Vec<Certificate>>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a named store, enforcing the load-time invariants: a store must
    /// be non-empty, a single-certificate store must hold a self-signed or
    /// CA certificate, and a multi-certificate store only CA certificates.
    pub fn add_store(
        &mut self,
        store_type: TrustStoreType,
        name: &str,
        certs: Vec<Certificate>,
    ) -> TrustStoreResult<()> {
        validate_store_certs(&certs, store_type, name)?;
        self.stores
            .insert((store_type, name.to_string()), certs);
        Ok(())
    }

    /// Certificates of a named store. Missing stores are an error, never an
    /// empty answer.
    pub fn certs_for_ref(
        &self,
        store_type: TrustStoreType,
        name: &str,
    ) -> TrustStoreResult<&[Certificate]> {
        self.stores
            .get(&(store_type, name.to_string()))
            .map(Vec::as_slice)
            .ok_or_else(|| TrustStoreError::StoreNotFound {
                store_type,
                name: name.to_string(),
            })
    }

    pub fn contains(&self, store_type: TrustStoreType, name: &str) -> bool {
        self.stores.contains_key(&(store_type, name.to_string()))
    }

    /// Loads the conventional on-disk layout `<root>/<type>/<name>/*`.
    ///
    /// Only the stores referenced by a policy need to exist; absent type
    /// directories are skipped.
    pub fn from_dir(root: impl AsRef<Path>) -> TrustStoreResult<Self> {
        let root = root.as_ref();
        let mut store = Self::new();
        for store_type in [
            TrustStoreType::Ca,
            TrustStoreType::SigningAuthority,
            TrustStoreType::Tsa,
        ] {
            let type_dir = root.join(store_type.to_string());
            if !type_dir.is_dir() {
                continue;
            }
            let entries = std::fs::read_dir(&type_dir).map_err(|source| TrustStoreError::Io {
                path: type_dir.display().to_string(),
                source,
            })?;
            for entry in entries {
                let entry = entry.map_err(|source| TrustStoreError::Io {
                    path: type_dir.display().to_string(),
                    source,
                })?;
                let name = entry.file_name().to_string_lossy().to_string();
                let certs = load_store_dir(&entry.path())?;
                store.add_store(store_type, &name, certs)?;
            }
        }
        Ok(store)
    }
}

fn validate_store_certs(
    certs: &[Certificate],
    store_type: TrustStoreType,
    name: &str,
) -> TrustStoreResult<()> {
    match certs {
        [] => Err(TrustStoreError::EmptyStore {
            store_type,
            name: name.to_string(),
        }),
        [only] => {
            let is_anchor = only
                .is_self_signed()
                .unwrap_or(false)
                || only.is_ca().unwrap_or(false);
            if !is_anchor {
                return Err(TrustStoreError::NotAnAnchor {
                    name: name.to_string(),
                    subject: only.subject().unwrap_or_default(),
                });
            }
            Ok(())
        }
        many => {
            for cert in many {
                if !cert.is_ca().unwrap_or(false) {
                    return Err(TrustStoreError::NotACa {
                        name: name.to_string(),
                        subject: cert.subject().unwrap_or_default(),
                    });
                }
            }
            Ok(())
        }
    }
}

/// Reads all certificates from one named store directory. Every entry must
/// be a regular file containing at least one PEM or DER certificate.
fn load_store_dir(dir: &Path) -> TrustStoreResult<Vec<Certificate>> {
    let meta = std::fs::symlink_metadata(dir).map_err(|source| TrustStoreError::Io {
        path: dir.display().to_string(),
        source,
    })?;
    if !meta.is_dir() || meta.file_type().is_symlink() {
        return Err(TrustStoreError::NotARegularFile {
            path: dir.display().to_string(),
        });
    }

    let mut certs = Vec::new();
    let entries = std::fs::read_dir(dir).map_err(|source| TrustStoreError::Io {
        path: dir.display().to_string(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| TrustStoreError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        let path = entry.path();
        let meta = std::fs::symlink_metadata(&path).map_err(|source| TrustStoreError::Io {
            path: path.display().to_string(),
            source,
        })?;
        if !meta.is_file() || meta.file_type().is_symlink() {
            return Err(TrustStoreError::NotARegularFile {
                path: path.display().to_string(),
            });
        }

        let bytes = std::fs::read(&path).map_err(|source| TrustStoreError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let file_certs = if bytes.starts_with(b"-----BEGIN") {
            Certificate::from_pem_chain(&bytes)
        } else {
            Certificate::from_der(bytes).map(|c| vec![c])
        }
        .map_err(|source| TrustStoreError::BadCertificate {
            path: path.display().to_string(),
            source,
        })?;
        certs.extend(file_certs);
    }

    Ok(certs)
}
