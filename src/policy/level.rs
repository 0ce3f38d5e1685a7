// Copyright (c) 2024 notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Verification levels: the mapping from a policy preset to per-check
//! actions, plus caller overrides.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// The checks performed on every signature, in pipeline order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
pub enum CheckType {
    #[strum(serialize = "integrity")]
    #[serde(rename = "integrity")]
    Integrity,
    #[strum(serialize = "authenticity")]
    #[serde(rename = "authenticity")]
    Authenticity,
    #[strum(serialize = "authenticTimestamp")]
    #[serde(rename = "authenticTimestamp")]
    AuthenticTimestamp,
    #[strum(serialize = "expiry")]
    #[serde(rename = "expiry")]
    Expiry,
    #[strum(serialize = "authorizedIdentity")]
    #[serde(rename = "authorizedIdentity")]
    AuthorizedIdentity,
    #[strum(serialize = "revocation")]
    #[serde(rename = "revocation")]
    Revocation,
}

pub const ALL_CHECKS: [CheckType; 6] = [
    CheckType::Integrity,
    CheckType::Authenticity,
    CheckType::AuthenticTimestamp,
    CheckType::Expiry,
    CheckType::AuthorizedIdentity,
    CheckType::Revocation,
];

/// What to do with the result of a check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
pub enum ValidationAction {
    #[strum(serialize = "enforce")]
    #[serde(rename = "enforce")]
    Enforce,
    #[strum(serialize = "log")]
    #[serde(rename = "log")]
    Log,
    #[strum(serialize = "skip")]
    #[serde(rename = "skip")]
    Skip,
}

/// The named presets of the trust policy model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
pub enum LevelName {
    #[strum(serialize = "strict")]
    #[serde(rename = "strict")]
    Strict,
    #[strum(serialize = "permissive")]
    #[serde(rename = "permissive")]
    Permissive,
    #[strum(serialize = "audit")]
    #[serde(rename = "audit")]
    Audit,
    #[strum(serialize = "skip")]
    #[serde(rename = "skip")]
    Skip,
}

/// A fully derived verification level: one action per check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationLevel {
    pub name: LevelName,
    actions: [(CheckType, ValidationAction); 6],
}

impl VerificationLevel {
    /// The preset action matrix.
    pub fn preset(name: LevelName) -> Self {
        use CheckType::*;
        use ValidationAction::*;

        let actions = match name {
            LevelName::Strict => [
                (Integrity, Enforce),
                (Authenticity, Enforce),
                (AuthenticTimestamp, Enforce),
                (Expiry, Enforce),
                (AuthorizedIdentity, Enforce),
                (Revocation, Enforce),
            ],
            LevelName::Permissive => [
                (Integrity, Enforce),
                (Authenticity, Enforce),
                (AuthenticTimestamp, Log),
                (Expiry, Log),
                (AuthorizedIdentity, Log),
                (Revocation, Log),
            ],
            LevelName::Audit => [
                (Integrity, Enforce),
                (Authenticity, Log),
                (AuthenticTimestamp, Log),
                (Expiry, Log),
                (AuthorizedIdentity, Log),
                (Revocation, Skip),
            ],
            LevelName::Skip => [
                (Integrity, Skip),
                (Authenticity, Skip),
                (AuthenticTimestamp, Skip),
                (Expiry, Skip),
                (AuthorizedIdentity, Skip),
                (Revocation, Skip),
            ],
        };
        Self { name, actions }
    }

    pub fn action(&self, check: CheckType) -> ValidationAction {
        self.actions
            .iter()
            .find(|(c, _)| *c == check)
            .map(|(_, a)| *a)
            .unwrap_or(ValidationAction::Skip)
    }

    pub(crate) fn set_action(&mut self, check: CheckType, action: ValidationAction) {
        if let Some(slot) = self.actions.iter_mut().find(|(c, _)| *c == check) {
            slot.1 = action;
        }
    }
}

/// Errors produced when applying per-check overrides from a policy
/// statement.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LevelError {
    #[error("unknown verification level {0:?}")]
    UnknownLevel(String),

    #[error("unknown check {0:?} in signature verification overrides")]
    UnknownCheck(String),

    #[error("unknown action {0:?} for check {check}")]
    UnknownAction { check: CheckType, action: String },

    #[error("the integrity check cannot be overridden")]
    IntegrityNotOverridable,

    #[error("the authenticity check can only be overridden to \"log\"")]
    AuthenticityOverrideInvalid,

    #[error("the {0} level does not support overrides")]
    OverridesNotAllowed(LevelName),
}

/// Derives a level from its preset name and raw `check -> action` override
/// strings, as they appear in the policy document.
pub fn derive_level(
    level: &str,
    overrides: &std::collections::BTreeMap<String, String>,
) -> Result<VerificationLevel, LevelError> {
    let name =
        LevelName::from_str(level).map_err(|_| LevelError::UnknownLevel(level.to_string()))?;
    let mut derived = VerificationLevel::preset(name);

    if overrides.is_empty() {
        return Ok(derived);
    }
    if matches!(name, LevelName::Skip) {
        return Err(LevelError::OverridesNotAllowed(name));
    }

    for (check, action) in overrides {
        let check = CheckType::from_str(check)
            .map_err(|_| LevelError::UnknownCheck(check.to_string()))?;
        let action = ValidationAction::from_str(action).map_err(|_| LevelError::UnknownAction {
            check,
            action: action.to_string(),
        })?;
        match check {
            CheckType::Integrity => return Err(LevelError::IntegrityNotOverridable),
            CheckType::Authenticity if action != ValidationAction::Log => {
                return Err(LevelError::AuthenticityOverrideInvalid)
            }
            _ => derived.set_action(check, action),
        }
    }

    Ok(derived)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn preset_matrix_matches_model() {
        let strict = VerificationLevel::preset(LevelName::Strict);
        for check in ALL_CHECKS {
            assert_eq!(strict.action(check), ValidationAction::Enforce);
        }

        let permissive = VerificationLevel::preset(LevelName::Permissive);
        assert_eq!(
            permissive.action(CheckType::Authenticity),
            ValidationAction::Enforce
        );
        assert_eq!(permissive.action(CheckType::Expiry), ValidationAction::Log);

        let audit = VerificationLevel::preset(LevelName::Audit);
        assert_eq!(audit.action(CheckType::Integrity), ValidationAction::Enforce);
        assert_eq!(audit.action(CheckType::Authenticity), ValidationAction::Log);
        assert_eq!(audit.action(CheckType::Revocation), ValidationAction::Skip);

        let skip = VerificationLevel::preset(LevelName::Skip);
        for check in ALL_CHECKS {
            assert_eq!(skip.action(check), ValidationAction::Skip);
        }
    }

    #[test]
    fn overrides_apply() {
        let overrides = BTreeMap::from([("revocation".to_string(), "skip".to_string())]);
        let level = derive_level("strict", &overrides).unwrap();
        assert_eq!(level.action(CheckType::Revocation), ValidationAction::Skip);
        assert_eq!(level.action(CheckType::Expiry), ValidationAction::Enforce);
    }

    #[test]
    fn integrity_cannot_be_overridden() {
        let overrides = BTreeMap::from([("integrity".to_string(), "log".to_string())]);
        assert_eq!(
            derive_level("strict", &overrides).unwrap_err(),
            LevelError::IntegrityNotOverridable
        );
    }

    #[test]
    fn authenticity_only_lowers_to_log() {
        let overrides = BTreeMap::from([("authenticity".to_string(), "skip".to_string())]);
        assert_eq!(
            derive_level("strict", &overrides).unwrap_err(),
            LevelError::AuthenticityOverrideInvalid
        );
    }

    #[test]
    fn skip_level_rejects_overrides() {
        let overrides = BTreeMap::from([("expiry".to_string(), "log".to_string())]);
        assert_eq!(
            derive_level("skip", &overrides).unwrap_err(),
            LevelError::OverridesNotAllowed(LevelName::Skip)
        );
    }

    #[test]
    fn unknown_names_are_rejected() {
        assert!(matches!(
            derive_level("paranoid", &BTreeMap::new()),
            Err(LevelError::UnknownLevel(_))
        ));
        let overrides = BTreeMap::from([("freshness".to_string(), "log".to_string())]);
        assert!(matches!(
            derive_level("strict", &overrides),
            Err(LevelError::UnknownCheck(_))
        ));
    }
}
