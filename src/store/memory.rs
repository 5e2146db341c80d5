use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{CatalogStore, ImageId, ImageRecord, SearchResult, check_dims, rank};
use crate::vector::sanitize;
use crate::{Result, VaultError};

#[derive(Debug, Default)]
struct MemoryState {
    next_id: ImageId,
    records: BTreeMap<ImageId, ImageRecord>,
}

/// In-memory catalog with brute-force ranking.
#[derive(Debug)]
pub struct MemoryCatalog {
    dims: usize,
    state: RwLock<MemoryState>,
}

impl MemoryCatalog {
    #[must_use]
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            state: RwLock::new(MemoryState {
                next_id: 1,
                records: BTreeMap::new(),
            }),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>> {
        self.state
            .read()
            .map_err(|_| VaultError::Lock("memory catalog poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>> {
        self.state
            .write()
            .map_err(|_| VaultError::Lock("memory catalog poisoned".into()))
    }
}

impl CatalogStore for MemoryCatalog {
    fn dims(&self) -> usize {
        self.dims
    }

    fn insert(&self, image_ref: &str, embedding: &[f32]) -> Result<ImageId> {
        check_dims(self.dims, embedding)?;
        let mut state = self.write()?;
        let id = state.next_id;
        state.next_id += 1;
        state.records.insert(
            id,
            ImageRecord {
                id,
                image_ref: image_ref.to_string(),
                embedding: sanitize(embedding),
            },
        );
        Ok(id)
    }

    fn get(&self, id: ImageId) -> Result<ImageRecord> {
        self.read()?
            .records
            .get(&id)
            .cloned()
            .ok_or(VaultError::ImageNotFound { id })
    }

    fn list(&self) -> Result<Vec<ImageRecord>> {
        Ok(self.read()?.records.values().cloned().collect())
    }

    fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<SearchResult>> {
        check_dims(self.dims, embedding)?;
        let target = sanitize(embedding);
        let state = self.read()?;
        let candidates = state
            .records
            .values()
            .map(|r| (r.id, r.image_ref.as_str(), r.embedding.as_slice()));
        Ok(rank(candidates, &target, k))
    }

    fn delete_all(&self) -> Result<usize> {
        let mut state = self.write()?;
        let removed = state.records.len();
        state.records.clear();
        Ok(removed)
    }

    fn len(&self) -> Result<usize> {
        Ok(self.read()?.records.len())
    }
}
