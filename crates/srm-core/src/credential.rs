// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Delegated request credentials and their bounded cache.
//!
//! Requests only carry a credential id. The credential itself is resolved
//! lazily: from the cache if present, otherwise from persistence. The cache
//! evicts deterministically: entries older than the time-to-live are dropped
//! on access, and inserting into a full cache drops the oldest entry.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::error::SrmError;
use crate::persistence::Persistence;

/// A credential delegated by a client for use on its behalf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCredential {
    pub id: String,
    /// Identity the credential was issued to.
    pub owner: String,
    /// Opaque delegated material handed to the storage backend.
    pub delegated: String,
    pub expiration: DateTime<Utc>,
}

impl RequestCredential {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration <= now
    }
}

#[derive(Debug, Clone)]
struct CachedCredential {
    credential: RequestCredential,
    inserted_at: Instant,
}

/// Size and time bounded credential cache.
#[derive(Debug)]
pub struct CredentialCache {
    entries: DashMap<String, CachedCredential>,
    max_size: usize,
    ttl: Duration,
}

impl CredentialCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            max_size,
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cache a credential, evicting the oldest entry when full.
    pub fn insert(&self, credential: RequestCredential) {
        if self.max_size == 0 {
            return;
        }
        self.evict_expired();
        if !self.entries.contains_key(&credential.id) && self.entries.len() >= self.max_size {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.value().inserted_at)
                .map(|entry| entry.key().clone());
            if let Some(oldest) = oldest {
                debug!(credential_id = %oldest, "Evicting credential from full cache");
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(
            credential.id.clone(),
            CachedCredential {
                credential,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Cached credential, if present and fresh.
    pub fn get_cached(&self, id: &str) -> Option<RequestCredential> {
        let fresh = self
            .entries
            .get(id)
            .map(|entry| (entry.inserted_at.elapsed() < self.ttl, entry.credential.clone()));
        match fresh {
            Some((true, credential)) => Some(credential),
            Some((false, _)) => {
                self.entries.remove(id);
                None
            }
            None => None,
        }
    }

    /// Resolve a credential by id, loading it from persistence on a miss.
    pub async fn resolve(
        &self,
        persistence: &dyn Persistence,
        id: &str,
    ) -> Result<Option<RequestCredential>, SrmError> {
        if let Some(credential) = self.get_cached(id) {
            return Ok(Some(credential));
        }
        let loaded = persistence.get_credential(id).await?;
        if let Some(credential) = &loaded {
            self.insert(credential.clone());
        }
        Ok(loaded)
    }

    /// Persist a credential and cache it.
    pub async fn store(
        &self,
        persistence: &dyn Persistence,
        credential: RequestCredential,
    ) -> Result<(), SrmError> {
        persistence.save_credential(&credential).await?;
        self.insert(credential);
        Ok(())
    }

    fn evict_expired(&self) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, entry| entry.inserted_at.elapsed() < ttl);
    }
}
