// Copyright (c) 2024 notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Sign and verify OCI artifacts under the Notary Project trust model.
//!
//! Signatures are detached JWS or COSE envelopes stored next to the
//! artifact as OCI referrers. Signing may use an in-process key or
//! delegate to an external plugin; verification evaluates every signature
//! against a trust policy and a set of named trust stores.

pub mod config;
pub mod crypto;
pub mod digest;
pub mod envelope;
pub mod oci;
pub mod plugin;
pub mod policy;
pub mod registry;
pub mod sign;
pub mod signer;
pub mod truststore;
pub mod verifier;
pub mod verify;

pub use sign::{sign, sign_artifact, ArtifactSignOptions, SignError, SignOptions, SignedArtifact};
pub use verify::{verify, verify_local_content, LocalVerifyOptions, VerifyError, VerifyOptions};
