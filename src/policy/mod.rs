// Copyright (c) 2024 notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Trust policy: the document format, its validation rules, and statement
//! selection by registry scope.

pub mod level;

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::truststore::TrustStoreRef;
use level::{derive_level, LevelError, VerificationLevel};

pub const SUPPORTED_POLICY_VERSION: &str = "1.0";

/// Matches any registry scope or any identity, and must stand alone in its
/// list.
pub const WILDCARD: &str = "*";

const IDENTITY_PREFIX_X509_SUBJECT: &str = "x509.subject:";

pub type PolicyResult<T> = std::result::Result<T, PolicyError>;

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("invalid trust policy: {0}")]
    Invalid(String),

    #[error("no trust policy statement is applicable to artifact {reference:?}")]
    NotApplicable { reference: String },

    #[error("multiple trust policy statements apply to artifact {reference:?}")]
    Ambiguous { reference: String },

    #[error(transparent)]
    Level(#[from] LevelError),
}

/// The `signatureVerification` object of a statement.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SignatureVerification {
    pub level: String,

    #[serde(default, rename = "override", skip_serializing_if = "BTreeMap::is_empty")]
    pub overrides: BTreeMap<String, String>,
}

/// One trust policy statement scoping verification behavior to a set of
/// repositories.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustPolicyStatement {
    pub name: String,

    pub registry_scopes: Vec<String>,

    pub signature_verification: SignatureVerification,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trust_stores: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trusted_identities: Vec<String>,
}

impl TrustPolicyStatement {
    /// The derived per-check action matrix for this statement.
    pub fn verification_level(&self) -> PolicyResult<VerificationLevel> {
        Ok(derive_level(
            &self.signature_verification.level,
            &self.signature_verification.overrides,
        )?)
    }

    /// Parsed trust store references. Assumes `validate` has passed.
    pub fn trust_store_refs(&self) -> Vec<TrustStoreRef> {
        self.trust_stores
            .iter()
            .filter_map(|s| TrustStoreRef::from_str(s).ok())
            .collect()
    }

    fn is_skip(&self) -> bool {
        self.signature_verification.level == "skip"
    }
}

/// The trust policy document as persisted on disk.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustPolicyDocument {
    pub version: String,

    pub trust_policies: Vec<TrustPolicyStatement>,
}

impl TrustPolicyDocument {
    pub fn from_json(bytes: &[u8]) -> PolicyResult<Self> {
        let doc: TrustPolicyDocument = serde_json::from_slice(bytes)
            .map_err(|e| PolicyError::Invalid(format!("malformed document: {e}")))?;
        doc.validate()?;
        Ok(doc)
    }

    /// Structural validation of the whole document; rejects anything the
    /// selection and derivation logic would otherwise have to tolerate.
    pub fn validate(&self) -> PolicyResult<()> {
        if self.version != SUPPORTED_POLICY_VERSION {
            return Err(PolicyError::Invalid(format!(
                "unsupported version {:?}, supported: {SUPPORTED_POLICY_VERSION:?}",
                self.version
            )));
        }
        if self.trust_policies.is_empty() {
            return Err(PolicyError::Invalid(
                "the document has no trust policy statements".to_string(),
            ));
        }

        let mut names = HashSet::new();
        let mut scopes = HashSet::new();
        for statement in &self.trust_policies {
            if statement.name.is_empty() {
                return Err(PolicyError::Invalid(
                    "a trust policy statement is missing a name".to_string(),
                ));
            }
            if !names.insert(statement.name.clone()) {
                return Err(PolicyError::Invalid(format!(
                    "multiple trust policy statements use the name {:?}",
                    statement.name
                )));
            }

            validate_scopes(statement, &mut scopes)?;

            // Surface level/override problems at load time.
            statement.verification_level()?;

            if statement.is_skip() {
                if !statement.trust_stores.is_empty() || !statement.trusted_identities.is_empty() {
                    return Err(PolicyError::Invalid(format!(
                        "statement {:?} is set to skip verification but configures trust stores or trusted identities",
                        statement.name
                    )));
                }
                continue;
            }

            if statement.trust_stores.is_empty() || statement.trusted_identities.is_empty() {
                return Err(PolicyError::Invalid(format!(
                    "statement {:?} is missing trust stores or trusted identities",
                    statement.name
                )));
            }
            for store in &statement.trust_stores {
                TrustStoreRef::from_str(store)
                    .map_err(|e| PolicyError::Invalid(e.to_string()))?;
            }
            validate_identities(statement)?;
        }

        Ok(())
    }

    /// Selects the statement applicable to `scope` (a `registry/repository`
    /// pair): the exact scope match wins, a single wildcard statement is the
    /// fallback.
    pub fn statement_for_scope(&self, scope: &str) -> PolicyResult<&TrustPolicyStatement> {
        let mut exact = None;
        let mut wildcard = None;
        for statement in &self.trust_policies {
            for s in &statement.registry_scopes {
                if s == scope {
                    if exact.replace(statement).is_some() {
                        return Err(PolicyError::Ambiguous {
                            reference: scope.to_string(),
                        });
                    }
                } else if s == WILDCARD {
                    wildcard = Some(statement);
                }
            }
        }

        exact
            .or(wildcard)
            .ok_or_else(|| PolicyError::NotApplicable {
                reference: scope.to_string(),
            })
    }
}

fn validate_scopes(
    statement: &TrustPolicyStatement,
    seen: &mut HashSet<String>,
) -> PolicyResult<()> {
    if statement.registry_scopes.is_empty() {
        return Err(PolicyError::Invalid(format!(
            "statement {:?} has no registry scopes",
            statement.name
        )));
    }
    if statement.registry_scopes.contains(&WILDCARD.to_string())
        && statement.registry_scopes.len() > 1
    {
        return Err(PolicyError::Invalid(format!(
            "statement {:?} mixes the wildcard scope with specific scopes",
            statement.name
        )));
    }
    for scope in &statement.registry_scopes {
        if scope != WILDCARD && (!scope.contains('/') || scope.contains(['@', ' '])) {
            return Err(PolicyError::Invalid(format!(
                "registry scope {scope:?} in statement {:?} is not a valid \"registry/repository\" scope",
                statement.name
            )));
        }
        if !seen.insert(scope.clone()) {
            return Err(PolicyError::Invalid(format!(
                "registry scope {scope:?} appears in multiple statements"
            )));
        }
    }
    Ok(())
}

fn validate_identities(statement: &TrustPolicyStatement) -> PolicyResult<()> {
    let identities = &statement.trusted_identities;
    if identities.contains(&WILDCARD.to_string()) && identities.len() > 1 {
        return Err(PolicyError::Invalid(format!(
            "statement {:?} mixes the wildcard identity with specific identities",
            statement.name
        )));
    }
    for identity in identities {
        if identity == WILDCARD {
            continue;
        }
        let Some(dn) = identity.strip_prefix(IDENTITY_PREFIX_X509_SUBJECT) else {
            return Err(PolicyError::Invalid(format!(
                "trusted identity {identity:?} in statement {:?} has an unsupported form",
                statement.name
            )));
        };
        if parse_distinguished_name(dn).is_empty() {
            return Err(PolicyError::Invalid(format!(
                "trusted identity {identity:?} in statement {:?} has an empty subject",
                statement.name
            )));
        }
    }
    Ok(())
}

/// Splits a textual distinguished name into attribute pairs. Attribute
/// values may not contain commas in this representation.
pub fn parse_distinguished_name(dn: &str) -> BTreeMap<String, String> {
    dn.split(',')
        .filter_map(|part| part.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, v)| !k.is_empty() && !v.is_empty())
        .collect()
}

/// Whether the leaf certificate subject satisfies one of the trusted
/// identity patterns. The wildcard matches any identity; an `x509.subject`
/// pattern matches when every listed attribute is present with an equal
/// value.
pub fn is_identity_trusted(identities: &[String], leaf_subject_dn: &str) -> bool {
    let subject = parse_distinguished_name(leaf_subject_dn);
    identities.iter().any(|identity| {
        if identity == WILDCARD {
            return true;
        }
        let Some(dn) = identity.strip_prefix(IDENTITY_PREFIX_X509_SUBJECT) else {
            return false;
        };
        let wanted = parse_distinguished_name(dn);
        !wanted.is_empty()
            && wanted
                .iter()
                .all(|(k, v)| subject.get(k).map(|sv| sv == v).unwrap_or(false))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statement(name: &str, scopes: &[&str], level: &str) -> TrustPolicyStatement {
        TrustPolicyStatement {
            name: name.to_string(),
            registry_scopes: scopes.iter().map(|s| s.to_string()).collect(),
            signature_verification: SignatureVerification {
                level: level.to_string(),
                overrides: BTreeMap::new(),
            },
            trust_stores: if level == "skip" {
                Vec::new()
            } else {
                vec!["ca:acme".to_string()]
            },
            trusted_identities: if level == "skip" {
                Vec::new()
            } else {
                vec![WILDCARD.to_string()]
            },
        }
    }

    fn document(statements: Vec<TrustPolicyStatement>) -> TrustPolicyDocument {
        TrustPolicyDocument {
            version: SUPPORTED_POLICY_VERSION.to_string(),
            trust_policies: statements,
        }
    }

    #[test]
    fn parse_and_validate_document() {
        let json = r#"{
            "version": "1.0",
            "trustPolicies": [
                {
                    "name": "acme",
                    "registryScopes": ["registry.io/acme/app"],
                    "signatureVerification": {
                        "level": "strict",
                        "override": { "revocation": "log" }
                    },
                    "trustStores": ["ca:acme"],
                    "trustedIdentities": ["x509.subject: C=US, O=Acme"]
                },
                {
                    "name": "default",
                    "registryScopes": ["*"],
                    "signatureVerification": { "level": "skip" }
                }
            ]
        }"#;
        let doc = TrustPolicyDocument::from_json(json.as_bytes()).unwrap();
        assert_eq!(doc.trust_policies.len(), 2);
    }

    #[test]
    fn scope_selection_prefers_exact_match() {
        let doc = document(vec![
            statement("foo", &["registry.io/foo"], "strict"),
            statement("fallback", &["*"], "audit"),
        ]);

        let selected = doc.statement_for_scope("registry.io/foo").unwrap();
        assert_eq!(selected.name, "foo");

        let selected = doc.statement_for_scope("other.io/bar").unwrap();
        assert_eq!(selected.name, "fallback");
    }

    #[test]
    fn no_match_without_wildcard() {
        let doc = document(vec![statement("foo", &["registry.io/foo"], "strict")]);
        assert!(matches!(
            doc.statement_for_scope("other.io/bar"),
            Err(PolicyError::NotApplicable { .. })
        ));
    }

    #[test]
    fn duplicate_scopes_rejected() {
        let doc = document(vec![
            statement("a", &["registry.io/foo"], "strict"),
            statement("b", &["registry.io/foo"], "audit"),
        ]);
        assert!(matches!(doc.validate(), Err(PolicyError::Invalid(_))));
    }

    #[test]
    fn wildcard_scope_must_stand_alone() {
        let doc = document(vec![statement("a", &["*", "registry.io/foo"], "strict")]);
        assert!(matches!(doc.validate(), Err(PolicyError::Invalid(_))));
    }

    #[test]
    fn skip_level_forbids_trust_material() {
        let mut skip = statement("skip", &["*"], "skip");
        skip.trust_stores = vec!["ca:acme".to_string()];
        let doc = document(vec![skip]);
        assert!(matches!(doc.validate(), Err(PolicyError::Invalid(_))));
    }

    #[test]
    fn non_skip_requires_trust_material() {
        let mut s = statement("a", &["registry.io/foo"], "strict");
        s.trusted_identities.clear();
        let doc = document(vec![s]);
        assert!(matches!(doc.validate(), Err(PolicyError::Invalid(_))));
    }

    #[test]
    fn bad_store_ref_rejected() {
        let mut s = statement("a", &["registry.io/foo"], "strict");
        s.trust_stores = vec!["vault:acme".to_string()];
        let doc = document(vec![s]);
        assert!(matches!(doc.validate(), Err(PolicyError::Invalid(_))));
    }

    #[test]
    fn identity_matching() {
        let identities = vec!["x509.subject: C=US, O=Notation Test".to_string()];
        assert!(is_identity_trusted(
            &identities,
            "C=US, ST=WA, O=Notation Test, CN=notation-test-signer"
        ));
        assert!(!is_identity_trusted(
            &identities,
            "C=US, ST=WA, O=Other Org, CN=signer"
        ));
        assert!(is_identity_trusted(&["*".to_string()], "CN=anyone"));
        assert!(!is_identity_trusted(&[], "CN=anyone"));
    }
}
