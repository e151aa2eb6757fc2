//! Collaborator interfaces consumed by the recognition facade, plus an
//! in-memory identity store.

use facekit_core::{Embedding, Identity, IdentityId};
use image::DynamicImage;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use thiserror::Error;

/// Attribute map attached to an identity.
pub type Attributes = BTreeMap<String, String>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("identity {0} not found")]
    NotFound(IdentityId),
    #[error("embedding for identity {0} has a non-finite component")]
    NonFinite(IdentityId),
    #[error("identity store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("embedding extraction failed: {0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("no training images for identity {0}")]
    NoData(IdentityId),
    #[error("training data unavailable: {0}")]
    Unavailable(String),
}

/// Persistence for identities and their training embeddings.
///
/// Implementations must be safe for concurrent use.
pub trait IdentityStore: Send + Sync {
    /// All identities, ascending by id.
    fn list_identities(&self) -> Result<Vec<Identity>, StoreError>;

    /// Create an identity with a fresh id.
    fn add_identity(&self, attributes: &Attributes) -> Result<Identity, StoreError>;

    /// Replace the attributes of an existing identity.
    fn update_identity(&self, id: IdentityId, attributes: &Attributes) -> Result<Identity, StoreError>;

    /// Remove identities. Unknown ids are ignored.
    fn delete_identities(&self, ids: &[IdentityId]) -> Result<(), StoreError>;

    /// First identity (lowest id) whose `key` attribute equals `value`.
    fn find_by_attribute(&self, key: &str, value: &str) -> Result<Option<Identity>, StoreError>;

    /// Persist training embeddings for one identity. `context` records
    /// where the training came from.
    fn add_training(&self, identity: IdentityId, embeddings: &[Embedding], context: &str) -> Result<(), StoreError>;

    /// All stored training embeddings in insertion order.
    fn training_data(&self) -> Result<Vec<(IdentityId, Embedding)>, StoreError>;

    /// Drop the training embeddings of the given identities.
    fn clear_training(&self, ids: &[IdentityId], context: &str) -> Result<(), StoreError>;

    /// Drop every training embedding.
    fn clear_all_training(&self, context: &str) -> Result<(), StoreError>;
}

/// Turns an aligned face crop into an embedding. Detection happens before
/// this boundary.
pub trait Extractor: Send + Sync {
    fn extract(&self, face: &DynamicImage) -> Result<Embedding, ExtractError>;
}

/// Supplies raw face crops to train an identity with.
pub trait TrainingDataProvider {
    fn images_for_identity(&self, identity: &Identity) -> Result<Vec<DynamicImage>, ProviderError>;
}

struct TrainingRow {
    identity: IdentityId,
    context: String,
    embedding: Embedding,
}

struct MemoryStoreInner {
    identities: BTreeMap<IdentityId, Identity>,
    training: Vec<TrainingRow>,
    next_id: IdentityId,
}

/// In-memory [`IdentityStore`]. Data is lost on restart.
pub struct MemoryIdentityStore {
    inner: Mutex<MemoryStoreInner>,
    unavailable: bool,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryStoreInner {
                identities: BTreeMap::new(),
                training: Vec::new(),
                next_id: 1,
            }),
            unavailable: false,
        }
    }

    /// A store whose every call fails, as if the backing database could not
    /// be opened.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::new()
        }
    }

    /// Training contexts in insertion order, one per stored embedding.
    pub fn training_contexts(&self) -> Vec<String> {
        self.inner.lock().training.iter().map(|r| r.context.clone()).collect()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable {
            Err(StoreError::Unavailable("memory store disabled".into()))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryIdentityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn list_identities(&self) -> Result<Vec<Identity>, StoreError> {
        self.check()?;
        Ok(self.inner.lock().identities.values().cloned().collect())
    }

    fn add_identity(&self, attributes: &Attributes) -> Result<Identity, StoreError> {
        self.check()?;
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let identity = Identity::new(id, attributes.clone());
        inner.identities.insert(id, identity.clone());
        Ok(identity)
    }

    fn update_identity(&self, id: IdentityId, attributes: &Attributes) -> Result<Identity, StoreError> {
        self.check()?;
        let mut inner = self.inner.lock();
        let identity = inner.identities.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        identity.attributes = attributes.clone();
        Ok(identity.clone())
    }

    fn delete_identities(&self, ids: &[IdentityId]) -> Result<(), StoreError> {
        self.check()?;
        let mut inner = self.inner.lock();
        for id in ids {
            inner.identities.remove(id);
        }
        Ok(())
    }

    fn find_by_attribute(&self, key: &str, value: &str) -> Result<Option<Identity>, StoreError> {
        self.check()?;
        let inner = self.inner.lock();
        Ok(inner
            .identities
            .values()
            .find(|i| i.attribute(key) == Some(value))
            .cloned())
    }

    fn add_training(&self, identity: IdentityId, embeddings: &[Embedding], context: &str) -> Result<(), StoreError> {
        self.check()?;
        let mut inner = self.inner.lock();
        if !inner.identities.contains_key(&identity) {
            return Err(StoreError::NotFound(identity));
        }
        inner.training.extend(embeddings.iter().map(|e| TrainingRow {
            identity,
            context: context.to_string(),
            embedding: e.clone(),
        }));
        Ok(())
    }

    fn training_data(&self) -> Result<Vec<(IdentityId, Embedding)>, StoreError> {
        self.check()?;
        let inner = self.inner.lock();
        Ok(inner
            .training
            .iter()
            .map(|r| (r.identity, r.embedding.clone()))
            .collect())
    }

    fn clear_training(&self, ids: &[IdentityId], _context: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner.lock().training.retain(|r| !ids.contains(&r.identity));
        Ok(())
    }

    fn clear_all_training(&self, _context: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner.lock().training.clear();
        Ok(())
    }
}
