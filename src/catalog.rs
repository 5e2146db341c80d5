//! Retrieval flows over the embedder and the catalog store: save a photo,
//! search by photo, search by text.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::VaultConfig;
use crate::embedder::EmbeddingGenerator;
use crate::onnx::OrtLoader;
use crate::preprocess::TempImage;
use crate::session::{Lifecycle, ModelSessionManager, SessionLoader, SessionState};
use crate::store::{CatalogStore, ImageId, ImageRecord, SearchResult, SqliteCatalog};
use crate::tokenizer::LazyTokenizer;
use crate::vector::sanitize;
use crate::{Result, VaultError};

/// Caller-owned flag deciding whether a finished search is still wanted.
///
/// Dismissing never interrupts inference; it only makes the result
/// [`Delivery::Stale`].
#[derive(Debug, Clone)]
pub struct Relevance(Arc<AtomicBool>);

impl Relevance {
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn dismiss(&self) {
        self.0.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_current(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for Relevance {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a search that may have been dismissed while running.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery<T> {
    Ready(T),
    Stale,
}

impl<T> Delivery<T> {
    #[must_use]
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale)
    }

    pub fn ready(self) -> Option<T> {
        match self {
            Self::Ready(value) => Some(value),
            Self::Stale => None,
        }
    }
}

/// The photo catalog.
pub struct Catalog {
    embedder: EmbeddingGenerator,
    store: Arc<dyn CatalogStore>,
    images_dir: PathBuf,
    top_k: usize,
    /// Held while a save or delete-all touches both the store and `images_dir`.
    writes: Mutex<()>,
}

impl Catalog {
    /// Open the on-disk catalog described by `config`, backed by ONNX Runtime
    /// encoders. Models are not loaded until first use.
    pub fn open(config: &VaultConfig) -> Result<Self> {
        config.validate()?;
        config.ensure_dirs()?;

        let model = config.model_info();
        if model.name != config.model_name {
            tracing::warn!(
                requested = %config.model_name,
                using = %model.name,
                "unknown model, falling back to default"
            );
        }

        let loader: Arc<dyn SessionLoader> = Arc::new(OrtLoader::new(
            &config.models_dir,
            model,
            config.intra_threads,
        ));
        let sessions = Arc::new(ModelSessionManager::new(loader, config.session_policy));
        let tokenizer = Arc::new(
            LazyTokenizer::new(config.models_dir.join(model.tokenizer_file()))
                .with_download_url(model.tokenizer_url),
        );
        let embedder =
            EmbeddingGenerator::new(sessions, tokenizer, model.dims, config.scratch_dir());
        let store = Arc::new(SqliteCatalog::open(
            &config.database_path(),
            model.name,
            model.dims,
        )?);

        let scratch = config.scratch_dir();
        if let Err(err) = purge_dir(&scratch) {
            tracing::warn!(path = %scratch.display(), error = %err, "failed to clear scratch directory");
        }
        tracing::info!(
            root = %config.root.display(),
            model = %model.name,
            dims = model.dims,
            "catalog ready"
        );
        Self::with_parts(embedder, store, config.images_dir(), config.top_k)
    }

    /// Assemble a catalog from explicit parts. The embedder and the store must
    /// agree on the embedding dimension.
    pub fn with_parts(
        embedder: EmbeddingGenerator,
        store: Arc<dyn CatalogStore>,
        images_dir: impl Into<PathBuf>,
        top_k: usize,
    ) -> Result<Self> {
        if embedder.dims() != store.dims() {
            return Err(VaultError::DimensionMismatch {
                expected: store.dims(),
                actual: embedder.dims(),
            });
        }
        if top_k == 0 {
            return Err(VaultError::Config {
                reason: "top_k must be at least 1".into(),
            });
        }
        let images_dir = images_dir.into();
        std::fs::create_dir_all(&images_dir).map_err(|e| VaultError::io_at(e, &images_dir))?;
        Ok(Self {
            embedder,
            store,
            images_dir,
            top_k,
            writes: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn top_k(&self) -> usize {
        self.top_k
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn CatalogStore> {
        &self.store
    }

    #[must_use]
    pub fn embedder(&self) -> &EmbeddingGenerator {
        &self.embedder
    }

    #[must_use]
    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    /// Embed a photo without storing it. The returned [`PendingPhoto`] is
    /// stored with [`PendingPhoto::commit`]; dropping it discards the photo.
    pub async fn prepare_photo(&self, raw: &[u8], width: u32, height: u32) -> Result<PendingPhoto<'_>> {
        self.prepare_photo_zoomed(raw, width, height, 1.0).await
    }

    /// [`Self::prepare_photo`] with a zoomed crop.
    pub async fn prepare_photo_zoomed(
        &self,
        raw: &[u8],
        width: u32,
        height: u32,
        zoom: f32,
    ) -> Result<PendingPhoto<'_>> {
        let (temp, embedding) = self
            .embedder
            .embed_image_zoomed(raw, width, height, zoom)
            .await?;
        Ok(PendingPhoto {
            catalog: self,
            temp,
            embedding: sanitize(&embedding),
        })
    }

    /// Embed and store a photo. Returns the new record id.
    pub async fn save_photo(&self, raw: &[u8], width: u32, height: u32) -> Result<ImageId> {
        self.prepare_photo(raw, width, height).await?.commit()
    }

    /// Rank stored photos by similarity to a photo. The photo itself is not
    /// stored.
    pub async fn search_by_photo(
        &self,
        raw: &[u8],
        width: u32,
        height: u32,
        relevance: &Relevance,
    ) -> Result<Delivery<Vec<SearchResult>>> {
        let (temp, embedding) = self.embedder.embed_image(raw, width, height).await?;
        let results = self.store.query(&sanitize(&embedding), self.top_k);
        release(temp);
        let results = results?;
        tracing::debug!(hits = results.len(), "image search finished");
        Ok(deliver(relevance, results))
    }

    /// Rank stored photos by similarity to a text description.
    pub async fn search_by_text(
        &self,
        query: &str,
        relevance: &Relevance,
    ) -> Result<Delivery<Vec<SearchResult>>> {
        let embedding = self.embedder.embed_text(query).await?;
        let results = self.store.query(&sanitize(&embedding), self.top_k)?;
        tracing::debug!(hits = results.len(), "text search finished");
        Ok(deliver(relevance, results))
    }

    pub fn list(&self) -> Result<Vec<ImageRecord>> {
        self.store.list()
    }

    pub fn get(&self, id: ImageId) -> Result<ImageRecord> {
        self.store.get(id)
    }

    pub fn len(&self) -> Result<usize> {
        self.store.len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.store.is_empty()
    }

    /// Remove every record and the stored image files. Irreversible.
    ///
    /// Saves wait until both are gone, so a photo committed concurrently is
    /// either deleted with the rest or stored after the purge.
    pub fn delete_all(&self) -> Result<usize> {
        let _writes = self.lock_writes()?;
        let removed = self.store.delete_all()?;
        let files = purge_dir(&self.images_dir)?;
        tracing::info!(removed, files, "catalog deleted");
        Ok(removed)
    }

    /// Forward a host lifecycle signal to the session manager.
    pub async fn set_lifecycle(&self, lifecycle: Lifecycle) {
        self.embedder.sessions().set_lifecycle(lifecycle).await;
    }

    pub async fn session_state(&self) -> SessionState {
        self.embedder.sessions().state().await
    }

    /// Verify the text encoder and tokenizer load and agree with the catalog's
    /// embedding dimension. Returns that dimension.
    pub async fn self_check(&self) -> Result<usize> {
        let dims = self.embedder.self_check().await?;
        if dims != self.store.dims() {
            return Err(VaultError::DimensionMismatch {
                expected: self.store.dims(),
                actual: dims,
            });
        }
        Ok(dims)
    }

    fn lock_writes(&self) -> Result<MutexGuard<'_, ()>> {
        self.writes
            .lock()
            .map_err(|_| VaultError::Lock("catalog write lock poisoned".into()))
    }

    fn store_pending(&self, temp: TempImage, embedding: &[f32]) -> Result<ImageId> {
        let _writes = self.lock_writes()?;
        let bytes = std::fs::read(temp.path()).map_err(|e| VaultError::io_at(e, temp.path()))?;
        let hex = blake3::hash(&bytes).to_hex();
        let dest = self.images_dir.join(format!("{}.jpg", &hex[..16]));

        // Identical processed photos share one file.
        let created = !dest.exists();
        let stored = if created {
            temp.persist(&dest)?
        } else {
            temp.remove()?;
            dest
        };

        let image_ref = stored.to_string_lossy();
        match self.store.insert(&image_ref, embedding) {
            Ok(id) => {
                tracing::info!(id, image_ref = %image_ref, "photo saved");
                Ok(id)
            }
            Err(err) => {
                if created {
                    if let Err(cleanup) = std::fs::remove_file(&stored) {
                        tracing::warn!(path = %stored.display(), error = %cleanup, "failed to remove unsaved image");
                    }
                }
                Err(err)
            }
        }
    }
}

/// A photo that has been embedded but not yet stored.
pub struct PendingPhoto<'a> {
    catalog: &'a Catalog,
    temp: TempImage,
    embedding: Vec<f32>,
}

impl PendingPhoto<'_> {
    /// Processed image, for previewing before the save is confirmed.
    #[must_use]
    pub fn preview_path(&self) -> &Path {
        self.temp.path()
    }

    /// Sanitized embedding that will be stored.
    #[must_use]
    pub fn embedding(&self) -> &[f32] {
        &self.embedding
    }

    /// Store the photo. Returns the new record id.
    pub fn commit(self) -> Result<ImageId> {
        let Self {
            catalog,
            temp,
            embedding,
        } = self;
        catalog.store_pending(temp, &embedding)
    }

    /// Drop the photo without storing it.
    pub fn discard(self) -> Result<()> {
        self.temp.remove()
    }
}

fn deliver<T>(relevance: &Relevance, value: T) -> Delivery<T> {
    if relevance.is_current() {
        Delivery::Ready(value)
    } else {
        tracing::debug!("result dismissed before delivery");
        Delivery::Stale
    }
}

fn release(temp: TempImage) {
    let path = temp.path().to_path_buf();
    if let Err(err) = temp.remove() {
        tracing::warn!(path = %path.display(), error = %err, "failed to remove scratch image");
    }
}

/// Remove every file directly inside `dir`. A missing directory is empty.
fn purge_dir(dir: &Path) -> Result<usize> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(VaultError::io_at(err, dir)),
    };
    let mut removed = 0;
    for entry in entries {
        let path = entry.map_err(|e| VaultError::io_at(e, dir))?.path();
        if path.is_file() {
            std::fs::remove_file(&path).map_err(|e| VaultError::io_at(e, &path))?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{InferenceSession, Modality, ModelInput, SessionPolicy};
    use crate::store::MemoryCatalog;
    use crate::tokenizer::{TokenSequence, Tokenize, fit_to_context};
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use tempfile::TempDir;

    struct ColorSession;

    impl InferenceSession for ColorSession {
        fn run(&mut self, input: ModelInput) -> Result<Vec<f32>> {
            match input {
                ModelInput::Pixels(pixels) => Ok((0..3)
                    .map(|c| pixels.index_axis(ndarray::Axis(1), c).mean().unwrap_or(0.0))
                    .collect()),
                ModelInput::Tokens(tokens) => Ok(vec![tokens.token_count() as f32, 0.0, 0.0]),
            }
        }
    }

    struct ColorLoader;

    impl SessionLoader for ColorLoader {
        fn load(&self, _modality: Modality) -> Result<Box<dyn InferenceSession>> {
            Ok(Box::new(ColorSession))
        }
    }

    struct CountTokenizer;

    impl Tokenize for CountTokenizer {
        fn tokenize(&self, text: &str) -> Result<TokenSequence> {
            let ids: Vec<u32> = text.split_whitespace().map(|_| 1).collect();
            Ok(fit_to_context(&ids))
        }
    }

    fn catalog(dir: &TempDir) -> Catalog {
        let sessions = Arc::new(ModelSessionManager::new(
            Arc::new(ColorLoader),
            SessionPolicy::Exclusive,
        ));
        let embedder = EmbeddingGenerator::new(
            sessions,
            Arc::new(CountTokenizer),
            3,
            dir.path().join("scratch"),
        );
        Catalog::with_parts(
            embedder,
            Arc::new(MemoryCatalog::new(3)),
            dir.path().join("images"),
            6,
        )
        .unwrap()
    }

    fn png(color: [u8; 3]) -> Vec<u8> {
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 48, Rgb(color)))
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn file_count(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn save_moves_image_into_storage() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(&dir);

        let id = catalog.save_photo(&png([200, 10, 10]), 64, 48).await.unwrap();
        let record = catalog.get(id).unwrap();
        assert!(Path::new(&record.image_ref).starts_with(catalog.images_dir()));
        assert!(Path::new(&record.image_ref).exists());
        assert_eq!(file_count(&dir.path().join("scratch")), 0);
    }

    #[tokio::test]
    async fn discarded_pending_photo_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(&dir);

        let pending = catalog.prepare_photo(&png([0, 0, 0]), 64, 48).await.unwrap();
        assert!(pending.preview_path().exists());
        pending.discard().unwrap();

        let pending = catalog.prepare_photo(&png([0, 0, 0]), 64, 48).await.unwrap();
        drop(pending);

        assert_eq!(file_count(&dir.path().join("scratch")), 0);
        assert_eq!(file_count(catalog.images_dir()), 0);
        assert!(catalog.is_empty().unwrap());
    }

    #[tokio::test]
    async fn search_cleans_scratch_and_respects_relevance() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(&dir);
        catalog.save_photo(&png([0, 200, 0]), 64, 48).await.unwrap();

        let relevance = Relevance::new();
        let hits = catalog
            .search_by_photo(&png([0, 190, 0]), 64, 48, &relevance)
            .await
            .unwrap()
            .ready()
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(file_count(&dir.path().join("scratch")), 0);

        relevance.dismiss();
        let delivery = catalog.search_by_text("green", &relevance).await.unwrap();
        assert!(delivery.is_stale());
    }

    #[tokio::test]
    async fn delete_all_removes_images() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(&dir);
        catalog.save_photo(&png([1, 2, 3]), 64, 48).await.unwrap();
        catalog.save_photo(&png([250, 2, 3]), 64, 48).await.unwrap();

        assert_eq!(catalog.delete_all().unwrap(), 2);
        assert!(catalog.list().unwrap().is_empty());
        assert_eq!(file_count(catalog.images_dir()), 0);
    }

    #[test]
    fn mismatched_parts_are_rejected() {
        let dir = TempDir::new().unwrap();
        let sessions = Arc::new(ModelSessionManager::new(
            Arc::new(ColorLoader),
            SessionPolicy::Exclusive,
        ));
        let embedder =
            EmbeddingGenerator::new(sessions, Arc::new(CountTokenizer), 3, dir.path());
        let result = Catalog::with_parts(embedder, Arc::new(MemoryCatalog::new(4)), dir.path(), 6);
        assert!(matches!(result, Err(VaultError::DimensionMismatch { .. })));
    }

    #[test]
    fn purge_of_a_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        assert_eq!(purge_dir(&dir.path().join("absent")).unwrap(), 0);
    }

    #[test]
    fn purge_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let not_a_dir = dir.path().join("images");
        std::fs::write(&not_a_dir, b"x").unwrap();

        match purge_dir(&not_a_dir) {
            Err(VaultError::Io { path, .. }) => assert_eq!(path.as_deref(), Some(not_a_dir.as_path())),
            other => panic!("expected Io, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_all_reports_an_unreadable_images_dir() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(&dir);
        catalog.save_photo(&png([9, 9, 9]), 64, 48).await.unwrap();

        std::fs::remove_dir_all(catalog.images_dir()).unwrap();
        std::fs::write(catalog.images_dir(), b"x").unwrap();

        assert!(matches!(catalog.delete_all(), Err(VaultError::Io { .. })));
        assert!(catalog.is_empty().unwrap());
    }
}
