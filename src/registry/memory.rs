// Copyright (c) 2024 notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! A content-addressed in-memory signature store. Serves the tests and any
//! programmatic use that does not involve a live registry; also the
//! reference implementation of the referrers indexing contract.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use oci_client::Reference;
use tokio::sync::RwLock;

use super::{RegistryBackend, RegistryError, RegistryResult, ReferrerPage};
use crate::digest::ContentDigest;
use crate::oci::Descriptor;

const DEFAULT_PAGE_SIZE: usize = 10;

#[derive(Default)]
struct Store {
    blobs: HashMap<String, Vec<u8>>,
    manifests: HashMap<String, (String, Vec<u8>)>,
    tags: HashMap<String, String>,
    referrers: HashMap<String, Vec<Descriptor>>,
}

pub struct MemoryRegistry {
    store: RwLock<Store>,
    page_size: usize,
    blob_fetches: AtomicUsize,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            store: RwLock::new(Store::default()),
            page_size: page_size.max(1),
            blob_fetches: AtomicUsize::new(0),
        }
    }

    /// Number of blob fetches served, across all content.
    pub fn blob_fetch_count(&self) -> usize {
        self.blob_fetches.load(Ordering::Relaxed)
    }

    /// Stores a manifest directly, optionally tagging it. Returns its
    /// descriptor; referrer indexing applies as for pushed manifests.
    pub async fn put_manifest(
        &self,
        media_type: &str,
        content: Vec<u8>,
        tag: Option<&str>,
    ) -> Descriptor {
        let desc = self.index_manifest(media_type, content).await;
        if let Some(tag) = tag {
            let mut store = self.store.write().await;
            store.tags.insert(tag.to_string(), desc.digest.to_string());
        }
        desc
    }

    /// Rewrites stored manifest JSON in place, keeping its address. Used by
    /// tests to simulate misbehaving registries.
    pub async fn rewrite_manifest(
        &self,
        digest: &ContentDigest,
        mutate: impl FnOnce(&mut serde_json::Value),
    ) {
        let mut store = self.store.write().await;
        if let Some((_, content)) = store.manifests.get_mut(digest.as_str()) {
            if let Ok(mut json) = serde_json::from_slice::<serde_json::Value>(content) {
                mutate(&mut json);
                if let Ok(bytes) = serde_json::to_vec(&json) {
                    *content = bytes;
                }
            }
        }
    }

    async fn index_manifest(&self, media_type: &str, content: Vec<u8>) -> Descriptor {
        let mut desc = Descriptor::from_content(media_type, &content);

        // Referrer indexing: a manifest with a subject becomes listable
        // under that subject, described with its artifact type and
        // annotations.
        if let Ok(json) = serde_json::from_slice::<serde_json::Value>(&content) {
            let artifact_type = json
                .get("artifactType")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .or_else(|| {
                    json.pointer("/config/mediaType")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                });
            desc.artifact_type = artifact_type;
            desc.annotations = json
                .get("annotations")
                .and_then(|v| serde_json::from_value(v.clone()).ok());

            if let Some(subject_digest) = json.pointer("/subject/digest").and_then(|v| v.as_str())
            {
                let mut store = self.store.write().await;
                store
                    .referrers
                    .entry(subject_digest.to_string())
                    .or_default()
                    .push(desc.clone());
            }
        }

        let mut store = self.store.write().await;
        store
            .manifests
            .insert(desc.digest.to_string(), (media_type.to_string(), content));
        desc
    }
}

#[async_trait]
impl RegistryBackend for MemoryRegistry {
    async fn resolve(&self, reference: &str) -> RegistryResult<Descriptor> {
        let parsed =
            Reference::try_from(reference).map_err(|e| RegistryError::InvalidReference {
                reference: reference.to_string(),
                message: e.to_string(),
            })?;

        let store = self.store.read().await;
        let digest = match (parsed.digest(), parsed.tag()) {
            (Some(digest), _) => digest.to_string(),
            (None, Some(tag)) => store
                .tags
                .get(tag)
                .cloned()
                .ok_or_else(|| RegistryError::NotFound(reference.to_string()))?,
            (None, None) => {
                return Err(RegistryError::InvalidReference {
                    reference: reference.to_string(),
                    message: "reference carries neither tag nor digest".to_string(),
                })
            }
        };

        let (media_type, content) = store
            .manifests
            .get(&digest)
            .ok_or_else(|| RegistryError::NotFound(reference.to_string()))?;
        Ok(Descriptor::from_content(media_type, content))
    }

    async fn fetch_manifest(&self, desc: &Descriptor, limit: i64) -> RegistryResult<Vec<u8>> {
        if desc.size > limit {
            return Err(RegistryError::SizeExceeded {
                content: "manifest",
                size: desc.size,
                limit,
            });
        }
        let store = self.store.read().await;
        store
            .manifests
            .get(desc.digest.as_str())
            .map(|(_, content)| content.clone())
            .ok_or_else(|| RegistryError::NotFound(desc.digest.to_string()))
    }

    async fn fetch_blob(&self, desc: &Descriptor, limit: i64) -> RegistryResult<Vec<u8>> {
        if desc.size > limit {
            return Err(RegistryError::SizeExceeded {
                content: "blob",
                size: desc.size,
                limit,
            });
        }
        self.blob_fetches.fetch_add(1, Ordering::Relaxed);
        let store = self.store.read().await;
        store
            .blobs
            .get(desc.digest.as_str())
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(desc.digest.to_string()))
    }

    async fn push_blob(&self, media_type: &str, content: Vec<u8>) -> RegistryResult<Descriptor> {
        let desc = Descriptor::from_content(media_type, &content);
        let mut store = self.store.write().await;
        store.blobs.insert(desc.digest.to_string(), content);
        Ok(desc)
    }

    async fn push_manifest(
        &self,
        media_type: &str,
        content: Vec<u8>,
    ) -> RegistryResult<Descriptor> {
        Ok(self.index_manifest(media_type, content).await)
    }

    async fn referrers_page(
        &self,
        subject: &Descriptor,
        artifact_type: &str,
        page_token: Option<String>,
    ) -> RegistryResult<ReferrerPage> {
        let offset: usize = match page_token {
            Some(token) => token
                .parse()
                .map_err(|_| RegistryError::Transport(format!("bad page token {token:?}")))?,
            None => 0,
        };

        let store = self.store.read().await;
        let all: Vec<Descriptor> = store
            .referrers
            .get(subject.digest.as_str())
            .map(|descs| {
                descs
                    .iter()
                    .filter(|d| d.artifact_type.as_deref() == Some(artifact_type))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let page: Vec<Descriptor> = all.iter().skip(offset).take(self.page_size).cloned().collect();
        let next = if offset + page.len() < all.len() {
            Some((offset + page.len()).to_string())
        } else {
            None
        };
        Ok(ReferrerPage {
            referrers: page,
            next,
        })
    }
}
