//! Catalog storage: image records with fixed-length embeddings and ranked
//! cosine-distance queries.
//!
//! [`CatalogStore`] is the narrow interface the retrieval flows depend on.
//! [`SqliteCatalog`] persists records; [`MemoryCatalog`] keeps them in memory
//! for ephemeral catalogs and tests.

mod memory;
mod sqlite;

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::vector::cosine_distance;
use crate::{Result, VaultError};

pub use memory::MemoryCatalog;
pub use sqlite::SqliteCatalog;

/// Record identifier, assigned on insert and never reused.
pub type ImageId = u64;

/// One stored photo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: ImageId,
    /// Path of the storage-owned image file
    pub image_ref: String,
    pub embedding: Vec<f32>,
}

/// One ranked match; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: ImageId,
    pub image_ref: String,
    /// Cosine distance in `[0, 2]`, lower is more similar
    pub distance: f32,
}

/// Storage contract for the catalog.
///
/// Embeddings are sanitized on insert, so [`CatalogStore::get`] returns
/// exactly `sanitize(e)` for an inserted `e`. Records are immutable; the only
/// removal path is [`CatalogStore::delete_all`].
pub trait CatalogStore: Send + Sync {
    /// Embedding dimension every record must have.
    fn dims(&self) -> usize;

    fn insert(&self, image_ref: &str, embedding: &[f32]) -> Result<ImageId>;

    fn get(&self, id: ImageId) -> Result<ImageRecord>;

    /// All records in ascending id order.
    fn list(&self) -> Result<Vec<ImageRecord>>;

    /// Up to `k` records ranked by ascending cosine distance, ties broken by
    /// ascending id.
    fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<SearchResult>>;

    /// Remove every record. Returns how many were removed.
    fn delete_all(&self) -> Result<usize>;

    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

pub(crate) fn check_dims(expected: usize, embedding: &[f32]) -> Result<()> {
    if embedding.len() != expected {
        return Err(VaultError::DimensionMismatch {
            expected,
            actual: embedding.len(),
        });
    }
    Ok(())
}

/// Ranking order shared by every engine.
pub(crate) fn compare_results(a: &SearchResult, b: &SearchResult) -> Ordering {
    a.distance
        .total_cmp(&b.distance)
        .then_with(|| a.id.cmp(&b.id))
}

/// Exact k-nearest scan over `(id, image_ref, embedding)` candidates.
pub(crate) fn rank<'a, I>(candidates: I, query: &[f32], k: usize) -> Vec<SearchResult>
where
    I: IntoIterator<Item = (ImageId, &'a str, &'a [f32])>,
{
    if k == 0 {
        return Vec::new();
    }
    let mut hits: Vec<SearchResult> = candidates
        .into_iter()
        .map(|(id, image_ref, embedding)| SearchResult {
            id,
            image_ref: image_ref.to_string(),
            distance: cosine_distance(query, embedding),
        })
        .collect();
    hits.sort_by(compare_results);
    hits.truncate(k);
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::sanitize;

    /// Contract checks run against every engine.
    pub(crate) fn exercise_store(store: &dyn CatalogStore) {
        assert_eq!(store.dims(), 3);
        assert!(store.is_empty().unwrap());
        assert!(store.query(&[1.0, 0.0, 0.0], 6).unwrap().is_empty());

        // Round trip returns the sanitized embedding, bit for bit.
        let raw = [-0.0, f32::NAN, 1.5];
        let id = store.insert("images/a.jpg", &raw).unwrap();
        let record = store.get(id).unwrap();
        assert_eq!(record.image_ref, "images/a.jpg");
        let expected: Vec<u32> = sanitize(&raw).iter().map(|v| v.to_bits()).collect();
        let actual: Vec<u32> = record.embedding.iter().map(|v| v.to_bits()).collect();
        assert_eq!(actual, expected);

        // Ids are monotonic and listing follows insertion order.
        let b = store.insert("images/b.jpg", &[0.0, 1.0, 0.0]).unwrap();
        let c = store.insert("images/c.jpg", &[1.0, 1.0, 0.0]).unwrap();
        assert!(id < b && b < c);
        let ids: Vec<ImageId> = store.list().unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![id, b, c]);

        // Ranking is non-decreasing and truncated to k.
        let hits = store.query(&[0.0, 1.0, 0.1], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, b);
        assert_eq!(hits[1].id, c);
        assert!(hits[0].distance <= hits[1].distance);

        let all = store.query(&[0.0, 1.0, 0.1], 6).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].distance <= w[1].distance));
        // The record sanitized to `[0, 0, 1.5]` is orthogonal-ish, never NaN.
        assert!(all.iter().all(|h| (0.0..=2.0).contains(&h.distance)));

        // Wrong dimension is rejected on both paths.
        assert!(matches!(
            store.insert("images/bad.jpg", &[1.0]),
            Err(VaultError::DimensionMismatch { .. })
        ));
        assert!(store.query(&[1.0, 0.0], 6).is_err());

        assert!(matches!(
            store.get(9_999),
            Err(VaultError::ImageNotFound { id: 9_999 })
        ));

        assert_eq!(store.delete_all().unwrap(), 3);
        assert!(store.list().unwrap().is_empty());
        assert!(matches!(store.get(id), Err(VaultError::ImageNotFound { .. })));

        // Ids keep increasing after a delete-all.
        let d = store.insert("images/d.jpg", &[1.0, 0.0, 0.0]).unwrap();
        assert!(d > c);
    }

    /// Identical embeddings tie at distance 0 and come back in id order.
    pub(crate) fn exercise_tie_break(store: &dyn CatalogStore) {
        let mut ids = Vec::new();
        for n in 0..7 {
            let embedding = if n == 2 || n == 6 {
                [0.5, 0.5, 0.0]
            } else {
                [0.0, 0.0, 1.0 + n as f32]
            };
            ids.push(store.insert(&format!("images/{n}.jpg"), &embedding).unwrap());
        }
        let hits = store.query(&[1.0, 1.0, 0.0], 2).unwrap();
        assert_eq!(hits[0].id, ids[2]);
        assert_eq!(hits[1].id, ids[6]);
        assert!(hits[0].distance.abs() < 1e-6);
        assert!(hits[1].distance.abs() < 1e-6);
    }

    #[test]
    fn rank_orders_by_distance_then_id() {
        let a = [1.0, 0.0];
        let b = [0.0, 1.0];
        let candidates = vec![(7, "x", &a[..]), (3, "y", &a[..]), (1, "z", &b[..])];
        let hits = rank(candidates, &[1.0, 0.0], 6);
        let ids: Vec<ImageId> = hits.iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![3, 7, 1]);
    }

    #[test]
    fn zero_k_returns_nothing() {
        let a = [1.0, 0.0];
        assert!(rank(vec![(1, "x", &a[..])], &[1.0, 0.0], 0).is_empty());
    }

    #[test]
    fn zero_vector_ranks_last() {
        let zero = [0.0, 0.0];
        let far = [-1.0, 0.0];
        let hits = rank(vec![(1, "zero", &zero[..]), (2, "far", &far[..])], &[1.0, 0.0], 6);
        assert_eq!(hits[0].distance, 2.0);
        assert_eq!(hits[1].distance, 2.0);
        assert_eq!(hits[0].id, 1);
    }
}
