//! Embedding generation: preprocessing or tokenization followed by one
//! inference call on the matching encoder session.

use std::path::PathBuf;
use std::sync::Arc;

use crate::preprocess::{ProcessedImage, TempImage, preprocess_zoomed};
use crate::session::{ModelInput, ModelSessionManager};
use crate::tokenizer::Tokenize;
use crate::{Result, VaultError};

/// Phrase embedded by [`EmbeddingGenerator::self_check`].
const CHECK_TEXT: &str = "a photo of a vinyl record";

/// Produces raw (unsanitized) embeddings for photos and text queries. Both
/// encoders emit vectors of the same dimension, so image and text embeddings
/// are directly comparable.
pub struct EmbeddingGenerator {
    sessions: Arc<ModelSessionManager>,
    tokenizer: Arc<dyn Tokenize>,
    dims: usize,
    scratch_dir: PathBuf,
}

impl EmbeddingGenerator {
    pub fn new(
        sessions: Arc<ModelSessionManager>,
        tokenizer: Arc<dyn Tokenize>,
        dims: usize,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            sessions,
            tokenizer,
            dims,
            scratch_dir: scratch_dir.into(),
        }
    }

    #[must_use]
    pub fn dims(&self) -> usize {
        self.dims
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<ModelSessionManager> {
        &self.sessions
    }

    /// Embed a photo. Returns the processed scratch image alongside the
    /// embedding; the scratch file is removed automatically if any step fails.
    pub async fn embed_image(
        &self,
        raw: &[u8],
        width: u32,
        height: u32,
    ) -> Result<(TempImage, Vec<f32>)> {
        self.embed_image_zoomed(raw, width, height, 1.0).await
    }

    /// [`Self::embed_image`] with a zoomed crop.
    pub async fn embed_image_zoomed(
        &self,
        raw: &[u8],
        width: u32,
        height: u32,
        zoom: f32,
    ) -> Result<(TempImage, Vec<f32>)> {
        let raw = raw.to_vec();
        let scratch_dir = self.scratch_dir.clone();
        let ProcessedImage { tensor, temp } = tokio::task::spawn_blocking(move || {
            preprocess_zoomed(&raw, width, height, zoom, &scratch_dir)
        })
        .await
        .map_err(|e| VaultError::preprocess(format!("preprocess task failed: {e}")))??;

        let lease = self.sessions.vision_session().await?;
        let output = lease.infer(ModelInput::Pixels(tensor)).await?;
        let embedding = self.check_dims(output)?;

        tracing::debug!(dims = embedding.len(), "generated image embedding");
        Ok((temp, embedding))
    }

    /// Embed a free-text query.
    pub async fn embed_text(&self, query: &str) -> Result<Vec<f32>> {
        let tokens = self.tokenizer.tokenize(query)?;

        let lease = self.sessions.text_session().await?;
        let output = lease.infer(ModelInput::Tokens(tokens)).await?;
        let embedding = self.check_dims(output)?;

        tracing::debug!(
            text_len = query.len(),
            dims = embedding.len(),
            "generated text embedding"
        );
        Ok(embedding)
    }

    /// Embed a known phrase and verify the text encoder and tokenizer produce
    /// vectors of the configured dimension. Returns that dimension.
    pub async fn self_check(&self) -> Result<usize> {
        let embedding = self.embed_text(CHECK_TEXT).await?;
        if embedding.iter().all(|v| *v == 0.0 || v.is_nan()) {
            return Err(VaultError::inference(
                "check embedding is degenerate; tokenizer and text encoder may not match",
            ));
        }
        Ok(embedding.len())
    }

    /// An encoder output of the wrong length is an inference failure.
    fn check_dims(&self, output: Vec<f32>) -> Result<Vec<f32>> {
        if output.len() != self.dims {
            return Err(VaultError::inference(format!(
                "encoder returned {} values, expected {}",
                output.len(),
                self.dims
            )));
        }
        Ok(output)
    }
}
