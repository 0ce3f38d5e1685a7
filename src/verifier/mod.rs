// Copyright (c) 2024 notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Per-signature verification: envelope parsing, integrity, authenticity,
//! authentic timestamp, expiry, identity and revocation, each honoring the
//! action the trust policy derives for it.

pub mod revocation;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use oci_client::Reference;
use thiserror::Error;

use crate::crypto::certificate::Certificate;
use crate::envelope::{
    self, EnvelopeContent, SignatureMediaType, SigningScheme, MEDIA_TYPE_PAYLOAD_V1,
};
use crate::oci::Descriptor;
use crate::policy::level::{CheckType, ValidationAction, VerificationLevel, ALL_CHECKS};
use crate::policy::{self, PolicyError, TrustPolicyDocument, TrustPolicyStatement};
use crate::truststore::{TrustStore, TrustStoreType};
use revocation::{RevocationStatus, RevocationValidator};

pub type VerifierResult<T> = std::result::Result<T, VerifierError>;

/// Flow-level verifier failures; anything per-signature lands in the
/// outcome instead.
#[derive(Error, Debug)]
pub enum VerifierError {
    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("cannot derive a trust policy scope: {0}")]
    InvalidScope(String),
}

/// Why a single check failed.
#[derive(Clone, Debug, Error)]
pub enum CheckFailure {
    #[error("signature envelope is malformed: {0}")]
    EnvelopeMalformed(String),

    #[error("integrity check failed: {0}")]
    IntegrityFailed(String),

    #[error("user metadata mismatch: key {key:?} {problem}")]
    UserMetadataMismatch { key: String, problem: String },

    #[error("signature is not authentic: {0}")]
    AuthenticityFailed(String),

    #[error("authentic timestamp check failed: {0}")]
    TimestampFailed(String),

    #[error("signature expired at {0}")]
    Expired(DateTime<Utc>),

    #[error("signing identity {0:?} does not match any trusted identity")]
    IdentityNotTrusted(String),

    #[error("certificate is revoked: {0}")]
    Revoked(String),

    #[error("revocation status could not be determined: {0}")]
    RevocationUnavailable(String),
}

/// The recorded result of one executed check.
#[derive(Clone, Debug)]
pub struct ValidationResult {
    pub check: CheckType,

    pub action: ValidationAction,

    pub error: Option<CheckFailure>,
}

/// Everything known about one signature after verification.
#[derive(Debug)]
pub struct VerificationOutcome {
    pub raw_signature: Vec<u8>,

    pub envelope_content: Option<EnvelopeContent>,

    pub verification_level: VerificationLevel,

    /// Results of the checks that executed, in pipeline order.
    pub results: Vec<ValidationResult>,

    /// The first enforced failure, or the structural failure that stopped
    /// the pipeline.
    pub error: Option<CheckFailure>,
}

impl VerificationOutcome {
    fn new(raw_signature: Vec<u8>, verification_level: VerificationLevel) -> Self {
        Self {
            raw_signature,
            envelope_content: None,
            verification_level,
            results: Vec::new(),
            error: None,
        }
    }

    /// An outcome carrying only the level, for statements configured to
    /// skip verification.
    pub(crate) fn skipped(verification_level: VerificationLevel) -> Self {
        Self::new(Vec::new(), verification_level)
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// The user metadata carried by the signature payload.
    pub fn user_metadata(&self) -> BTreeMap<String, String> {
        self.envelope_content
            .as_ref()
            .and_then(|content| content.payload().ok())
            .and_then(|payload| payload.target_artifact.annotations)
            .unwrap_or_default()
    }
}

/// Options for verifying one signature.
#[derive(Clone, Debug, Default)]
pub struct SignatureVerifyOptions {
    /// Reference of the artifact under verification; used to select the
    /// trust policy statement unless `trust_policy_scope` is set.
    pub artifact_reference: Option<String>,

    /// Explicit policy scope, used for artifacts outside any registry.
    pub trust_policy_scope: Option<String>,

    pub signature_media_type: Option<SignatureMediaType>,

    /// Key/value pairs that must be present in the signature payload.
    pub user_metadata: BTreeMap<String, String>,
}

/// Verifies a signature blob against an artifact descriptor.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(
        &self,
        desc: &Descriptor,
        signature: &[u8],
        opts: &SignatureVerifyOptions,
    ) -> VerifierResult<VerificationOutcome>;

    /// Consults the trust policy before any signature is fetched; returns
    /// the derived level when verification is configured away entirely.
    async fn check_skip(
        &self,
        _opts: &SignatureVerifyOptions,
    ) -> VerifierResult<Option<VerificationLevel>> {
        Ok(None)
    }
}

/// The trust-policy driven verifier.
pub struct TrustPolicyVerifier {
    policy: TrustPolicyDocument,
    trust_store: TrustStore,
    revocation: RevocationValidator,
}

impl TrustPolicyVerifier {
    pub fn new(policy: TrustPolicyDocument, trust_store: TrustStore) -> VerifierResult<Self> {
        policy.validate()?;
        Ok(Self {
            policy,
            trust_store,
            revocation: RevocationValidator::new(),
        })
    }

    pub fn with_revocation_validator(mut self, revocation: RevocationValidator) -> Self {
        self.revocation = revocation;
        self
    }

    fn statement_for(
        &self,
        opts: &SignatureVerifyOptions,
    ) -> VerifierResult<&TrustPolicyStatement> {
        let scope = match (&opts.trust_policy_scope, &opts.artifact_reference) {
            (Some(scope), _) => scope.clone(),
            (None, Some(reference)) => {
                let parsed = Reference::try_from(reference.as_str())
                    .map_err(|e| VerifierError::InvalidScope(e.to_string()))?;
                format!("{}/{}", parsed.registry(), parsed.repository())
            }
            (None, None) => {
                return Err(VerifierError::InvalidScope(
                    "neither an artifact reference nor a trust policy scope given".to_string(),
                ))
            }
        };
        Ok(self.policy.statement_for_scope(&scope)?)
    }

    /// Certificates of every `ca` and `signingAuthority` store the
    /// statement references.
    fn trusted_certs(&self, statement: &TrustPolicyStatement) -> Result<Vec<Certificate>, CheckFailure> {
        let mut certs = Vec::new();
        for store_ref in statement.trust_store_refs() {
            if store_ref.store_type == TrustStoreType::Tsa {
                continue;
            }
            let store_certs = self
                .trust_store
                .certs_for_ref(store_ref.store_type, &store_ref.name)
                .map_err(|e| CheckFailure::AuthenticityFailed(e.to_string()))?;
            certs.extend_from_slice(store_certs);
        }
        if certs.is_empty() {
            return Err(CheckFailure::AuthenticityFailed(
                "no trust anchors configured for this policy statement".to_string(),
            ));
        }
        Ok(certs)
    }

    fn check_integrity(
        &self,
        desc: &Descriptor,
        content: &EnvelopeContent,
        opts: &SignatureVerifyOptions,
    ) -> Result<(), CheckFailure> {
        let leaf = content
            .leaf_certificate()
            .map_err(|e| CheckFailure::IntegrityFailed(e.to_string()))?;
        envelope::verify_integrity(content, leaf)
            .map_err(|e| CheckFailure::IntegrityFailed(e.to_string()))?;

        if content.payload_content_type != MEDIA_TYPE_PAYLOAD_V1 {
            return Err(CheckFailure::IntegrityFailed(format!(
                "unexpected payload content type {:?}",
                content.payload_content_type
            )));
        }

        let payload = content
            .payload()
            .map_err(|e| CheckFailure::IntegrityFailed(e.to_string()))?;
        if !payload.target_artifact.same_content(desc) {
            return Err(CheckFailure::IntegrityFailed(format!(
                "signature payload describes {} ({} bytes), the subject is {} ({} bytes)",
                payload.target_artifact.digest,
                payload.target_artifact.size,
                desc.digest,
                desc.size
            )));
        }

        // Required user metadata must be present in the signed payload.
        let annotations = payload.target_artifact.annotations.unwrap_or_default();
        for (key, expected) in &opts.user_metadata {
            match annotations.get(key) {
                None => {
                    return Err(CheckFailure::UserMetadataMismatch {
                        key: key.clone(),
                        problem: "is not present in the signature".to_string(),
                    })
                }
                Some(actual) if actual != expected => {
                    return Err(CheckFailure::UserMetadataMismatch {
                        key: key.clone(),
                        problem: format!("has value {actual:?}, expected {expected:?}"),
                    })
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn check_authenticity(
        &self,
        content: &EnvelopeContent,
        statement: &TrustPolicyStatement,
    ) -> Result<(), CheckFailure> {
        let trusted = self.trusted_certs(statement)?;
        let chain = &content.signer_info.certificate_chain;

        // Walk from the leaf towards a trust anchor; intermediates carried
        // in the envelope are used for path building but the path must end
        // in a trust-store certificate.
        let mut current = &chain[0];
        for _ in 0..=chain.len() {
            if trusted.contains(current) {
                return Ok(());
            }
            if trusted
                .iter()
                .any(|anchor| current.verify_issued_by(anchor).unwrap_or(false))
            {
                return Ok(());
            }
            match chain.iter().find(|candidate| {
                *candidate != current && current.verify_issued_by(candidate).unwrap_or(false)
            }) {
                Some(parent) => current = parent,
                None => break,
            }
        }
        Err(CheckFailure::AuthenticityFailed(
            "signing certificate does not chain to any trusted certificate".to_string(),
        ))
    }

    /// Establishes the authentic time and checks the certificate chain
    /// covered it. A timestamp countersignature requires a `tsa` trust
    /// store to be configured.
    fn check_authentic_timestamp(
        &self,
        content: &EnvelopeContent,
        statement: &TrustPolicyStatement,
        authentic_time: DateTime<Utc>,
    ) -> Result<(), CheckFailure> {
        if content.signer_info.signing_scheme == SigningScheme::NotaryX509SigningAuthority
            && content.signer_info.authentic_signing_time.is_none()
        {
            return Err(CheckFailure::TimestampFailed(
                "signing authority envelope carries no authentic signing time".to_string(),
            ));
        }

        if content.unsigned.timestamp_token.is_some() {
            let has_tsa_store = statement
                .trust_store_refs()
                .iter()
                .any(|r| {
                    r.store_type == TrustStoreType::Tsa
                        && self.trust_store.contains(TrustStoreType::Tsa, &r.name)
                });
            if !has_tsa_store {
                return Err(CheckFailure::TimestampFailed(
                    "signature carries a timestamp token but no tsa trust store is configured"
                        .to_string(),
                ));
            }
        }

        for cert in &content.signer_info.certificate_chain {
            let valid = cert
                .valid_at(authentic_time)
                .map_err(|e| CheckFailure::TimestampFailed(e.to_string()))?;
            if !valid {
                return Err(CheckFailure::TimestampFailed(format!(
                    "certificate {:?} was not valid at the authentic signing time {authentic_time}",
                    cert.subject().unwrap_or_default()
                )));
            }
        }
        Ok(())
    }

    fn check_expiry(
        &self,
        content: &EnvelopeContent,
        authentic_time: DateTime<Utc>,
    ) -> Result<(), CheckFailure> {
        match content.signer_info.expiry {
            Some(expiry) if authentic_time > expiry => Err(CheckFailure::Expired(expiry)),
            _ => Ok(()),
        }
    }

    fn check_authorized_identity(
        &self,
        content: &EnvelopeContent,
        statement: &TrustPolicyStatement,
    ) -> Result<(), CheckFailure> {
        let leaf = content
            .leaf_certificate()
            .map_err(|e| CheckFailure::IntegrityFailed(e.to_string()))?;
        let subject = leaf
            .subject()
            .map_err(|e| CheckFailure::IdentityNotTrusted(e.to_string()))?;
        if policy::is_identity_trusted(&statement.trusted_identities, &subject) {
            Ok(())
        } else {
            Err(CheckFailure::IdentityNotTrusted(subject))
        }
    }

    async fn check_revocation(
        &self,
        content: &EnvelopeContent,
        authentic_time: DateTime<Utc>,
    ) -> Result<(), CheckFailure> {
        let statuses = self
            .revocation
            .chain_status(&content.signer_info.certificate_chain, authentic_time)
            .await;
        for status in statuses {
            match status {
                RevocationStatus::Good | RevocationStatus::NonRevokable => {}
                RevocationStatus::Revoked(reason) => {
                    return Err(CheckFailure::Revoked(reason));
                }
                RevocationStatus::Unknown(reason) => {
                    return Err(CheckFailure::RevocationUnavailable(reason));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Verifier for TrustPolicyVerifier {
    async fn verify(
        &self,
        desc: &Descriptor,
        signature: &[u8],
        opts: &SignatureVerifyOptions,
    ) -> VerifierResult<VerificationOutcome> {
        let statement = self.statement_for(opts)?;
        let level = statement.verification_level()?;
        let mut outcome = VerificationOutcome::new(signature.to_vec(), level.clone());
        debug!(
            "verifying signature under statement {:?} at level {}",
            statement.name, level.name
        );

        if level.name == crate::policy::level::LevelName::Skip {
            return Ok(outcome);
        }

        let media_type = opts
            .signature_media_type
            .unwrap_or(SignatureMediaType::Jws);
        let content = match envelope::parse(media_type, signature) {
            Ok(content) => content,
            Err(e) => {
                outcome.error = Some(CheckFailure::EnvelopeMalformed(e.to_string()));
                return Ok(outcome);
            }
        };

        let authentic_time = content
            .signer_info
            .authentic_signing_time
            .unwrap_or(content.signer_info.signing_time);

        for check in ALL_CHECKS {
            let action = level.action(check);
            if action == ValidationAction::Skip {
                continue;
            }

            let result = match check {
                CheckType::Integrity => self.check_integrity(desc, &content, opts),
                CheckType::Authenticity => self.check_authenticity(&content, statement),
                CheckType::AuthenticTimestamp => {
                    self.check_authentic_timestamp(&content, statement, authentic_time)
                }
                CheckType::Expiry => self.check_expiry(&content, authentic_time),
                CheckType::AuthorizedIdentity => {
                    self.check_authorized_identity(&content, statement)
                }
                CheckType::Revocation => self.check_revocation(&content, authentic_time).await,
            };

            let failed = result.as_ref().err().cloned();
            outcome.results.push(ValidationResult {
                check,
                action,
                error: failed.clone(),
            });

            if let Some(failure) = failed {
                match action {
                    ValidationAction::Enforce => {
                        outcome.error = Some(failure);
                        break;
                    }
                    ValidationAction::Log => {
                        warn!("{check} check failed (logged): {failure}");
                    }
                    ValidationAction::Skip => unreachable!("skipped checks do not run"),
                }
            }
        }

        outcome.envelope_content = Some(content);
        Ok(outcome)
    }

    async fn check_skip(
        &self,
        opts: &SignatureVerifyOptions,
    ) -> VerifierResult<Option<VerificationLevel>> {
        let statement = self.statement_for(opts)?;
        let level = statement.verification_level()?;
        if level.name == crate::policy::level::LevelName::Skip {
            return Ok(Some(level));
        }
        Ok(None)
    }
}
