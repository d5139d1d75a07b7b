// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Entity identity types and the process-wide key to identifier cache.

use derive_more::{Display, From};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

/// Locally known identity of an entity, derived from its reported name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, From, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(String);

impl EntityKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntityKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

/// Identifier assigned to an entity by the registration service. Zero is never assigned.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, From, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EntityId(u64);

impl EntityId {
    pub const EMPTY: EntityId = EntityId(0);

    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Entity reference attached to emitted inventory and events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub key: EntityKey,
    pub id: Option<EntityId>,
}

impl Entity {
    pub fn new(key: EntityKey, id: Option<EntityId>) -> Self {
        Self { key, id }
    }
}

/// Concurrency-safe cache of entity identifiers obtained from registration.
///
/// Cloning shares the underlying map. Entries are only ever added.
#[derive(Debug, Clone, Default)]
pub struct KnownIds {
    ids: Arc<RwLock<HashMap<EntityKey, EntityId>>>,
}

impl KnownIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &EntityKey) -> Option<EntityId> {
        match self.ids.read() {
            Ok(ids) => ids.get(key).copied(),
            Err(poisoned) => poisoned.into_inner().get(key).copied(),
        }
    }

    /// Stores the identifier for `key`. Re-inserting an existing pair is harmless.
    pub fn put(&self, key: EntityKey, id: EntityId) {
        match self.ids.write() {
            Ok(mut ids) => {
                ids.insert(key, id);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(key, id);
            }
        }
    }

    pub fn len(&self) -> usize {
        match self.ids.read() {
            Ok(ids) => ids.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
