// Copyright (c) 2024 notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Revocation status model. Endpoint discovery happens here; actually
//! talking to OCSP responders or CRL distribution points is transport work
//! behind the [`StatusFetcher`] boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::crypto::certificate::{Certificate, RevocationEndpoints};

/// Revocation status of a single certificate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RevocationStatus {
    /// An authoritative source vouched for the certificate.
    Good,
    /// The certificate advertises no OCSP or CRL endpoints; there is
    /// nothing to consult and nothing to fail.
    NonRevokable,
    Revoked(String),
    /// The status could not be determined.
    Unknown(String),
}

/// Fetches a revocation verdict from the endpoints a certificate
/// advertises. OCSP endpoints are consulted first, CRL distribution points
/// are the fallback.
#[async_trait]
pub trait StatusFetcher: Send + Sync {
    async fn fetch(
        &self,
        cert: &Certificate,
        endpoints: &RevocationEndpoints,
        at: DateTime<Utc>,
    ) -> RevocationStatus;
}

/// Per-certificate revocation checking driven by the endpoints in the
/// certificate. Without a fetcher, certificates that do advertise
/// endpoints come back `Unknown`.
#[derive(Default)]
pub struct RevocationValidator {
    fetcher: Option<Box<dyn StatusFetcher>>,
}

impl RevocationValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fetcher(fetcher: Box<dyn StatusFetcher>) -> Self {
        Self {
            fetcher: Some(fetcher),
        }
    }

    pub async fn status(&self, cert: &Certificate, at: DateTime<Utc>) -> RevocationStatus {
        let endpoints = match cert.revocation_endpoints() {
            Ok(endpoints) => endpoints,
            Err(e) => return RevocationStatus::Unknown(e.to_string()),
        };
        if endpoints.is_empty() {
            return RevocationStatus::NonRevokable;
        }
        match &self.fetcher {
            Some(fetcher) => fetcher.fetch(cert, &endpoints, at).await,
            None => RevocationStatus::Unknown(
                "certificate advertises revocation endpoints but no revocation fetcher is configured"
                    .to_string(),
            ),
        }
    }

    /// Statuses for a chain, leaf first. The self-signed anchor at the end
    /// of the chain is not checked against itself.
    pub async fn chain_status(
        &self,
        chain: &[Certificate],
        at: DateTime<Utc>,
    ) -> Vec<RevocationStatus> {
        let to_check = match chain.split_last() {
            Some((root, rest)) if !rest.is_empty() && root.is_self_signed().unwrap_or(false) => {
                rest
            }
            _ => chain,
        };

        let mut statuses = Vec::with_capacity(to_check.len());
        for cert in to_check {
            statuses.push(self.status(cert, at).await);
        }
        statuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEAF_PEM: &[u8] = include_bytes!("../../test_data/certs/leaf.pem");
    const CA_PEM: &[u8] = include_bytes!("../../test_data/certs/ca.pem");

    struct AlwaysRevoked;

    #[async_trait]
    impl StatusFetcher for AlwaysRevoked {
        async fn fetch(
            &self,
            _cert: &Certificate,
            _endpoints: &RevocationEndpoints,
            _at: DateTime<Utc>,
        ) -> RevocationStatus {
            RevocationStatus::Revoked("test".to_string())
        }
    }

    fn chain() -> Vec<Certificate> {
        let mut chain = Certificate::from_pem_chain(LEAF_PEM).unwrap();
        chain.extend(Certificate::from_pem_chain(CA_PEM).unwrap());
        chain
    }

    #[tokio::test]
    async fn no_endpoints_means_non_revokable() {
        let validator = RevocationValidator::new();
        let statuses = validator.chain_status(&chain(), Utc::now()).await;
        // The self-signed root is not checked.
        assert_eq!(statuses, vec![RevocationStatus::NonRevokable]);
    }

    #[tokio::test]
    async fn fetcher_is_not_consulted_without_endpoints() {
        let validator = RevocationValidator::with_fetcher(Box::new(AlwaysRevoked));
        let statuses = validator.chain_status(&chain(), Utc::now()).await;
        assert_eq!(statuses, vec![RevocationStatus::NonRevokable]);
    }
}
