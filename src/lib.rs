//! On-device photo catalog: CLIP embeddings for photos and text queries, and
//! ranked cosine-distance search over the stored photos.
//!
//! ```no_run
//! # async fn demo() -> photovault::Result<()> {
//! use photovault::{Catalog, Relevance, VaultConfig};
//!
//! let catalog = Catalog::open(&VaultConfig::default())?;
//! let photo = std::fs::read("cover.jpg")?;
//! catalog.save_photo(&photo, 1200, 1200).await?;
//!
//! let relevance = Relevance::new();
//! if let Some(hits) = catalog.search_by_text("a red album cover", &relevance).await?.ready() {
//!     for hit in hits {
//!         println!("{} {:.3} {}", hit.id, hit.distance, hit.image_ref);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod config;
pub mod embedder;
pub mod error;
pub mod models;
pub mod onnx;
pub mod preprocess;
pub mod session;
pub mod store;
pub mod tokenizer;
pub mod vector;

pub use catalog::{Catalog, Delivery, PendingPhoto, Relevance};
pub use config::{DEFAULT_TOP_K, FileConfig, VaultConfig};
pub use embedder::EmbeddingGenerator;
pub use error::{Result, VaultError};
pub use models::{CLIP_MODELS, ClipModelInfo, default_model_info, get_model_info};
pub use preprocess::{CropRect, ProcessedImage, TempImage, crop_dimensions, preprocess};
pub use session::{
    InferenceSession, Lifecycle, Modality, ModelInput, ModelSessionManager, SessionLoader,
    SessionPolicy, SessionState,
};
pub use store::{CatalogStore, ImageId, ImageRecord, MemoryCatalog, SearchResult, SqliteCatalog};
pub use tokenizer::{TokenSequence, Tokenize};
pub use vector::{cosine_distance, sanitize};
