//! Text tokenization for the CLIP text encoder.
//!
//! The vocabulary must be the BPE file exported with the text encoder. A
//! mismatched vocabulary still produces token ids, just meaningless ones, so
//! the file is always resolved from the same registry entry as the encoder.

use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tokenizers::{
    PaddingDirection, PaddingParams, PaddingStrategy, Tokenizer, TruncationDirection,
    TruncationParams, TruncationStrategy,
};

use crate::models::CONTEXT_LEN;
use crate::{Result, VaultError};

/// Id used to pad sequences shorter than the context window.
pub const PAD_TOKEN_ID: i32 = 0;

/// Exactly [`CONTEXT_LEN`] token ids with their attention mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSequence {
    ids: Vec<i32>,
    attention_mask: Vec<i32>,
}

impl TokenSequence {
    #[must_use]
    pub fn ids(&self) -> &[i32] {
        &self.ids
    }

    #[must_use]
    pub fn attention_mask(&self) -> &[i32] {
        &self.attention_mask
    }

    /// Number of non-padding tokens.
    #[must_use]
    pub fn token_count(&self) -> usize {
        self.attention_mask.iter().filter(|m| **m != 0).count()
    }
}

/// Truncate or pad raw ids to the context window.
#[must_use]
pub fn fit_to_context(ids: &[u32]) -> TokenSequence {
    let kept = ids.len().min(CONTEXT_LEN);
    let mut out = Vec::with_capacity(CONTEXT_LEN);
    // Ids come from a 49k-entry vocabulary, far below i32::MAX.
    out.extend(ids[..kept].iter().map(|id| *id as i32));
    out.resize(CONTEXT_LEN, PAD_TOKEN_ID);

    let mut mask = vec![1; kept];
    mask.resize(CONTEXT_LEN, 0);

    TokenSequence {
        ids: out,
        attention_mask: mask,
    }
}

/// Converts query text into model-ready token sequences.
pub trait Tokenize: Send + Sync {
    fn tokenize(&self, text: &str) -> Result<TokenSequence>;
}

/// HuggingFace `tokenizers` BPE tokenizer configured for a 77-token window.
pub struct ClipTokenizer {
    inner: Tokenizer,
}

impl ClipTokenizer {
    /// Load a `tokenizer.json` and apply fixed padding and truncation.
    pub fn from_file(path: &Path) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path).map_err(|e| {
            VaultError::model_load("tokenizer", format!("{}: {e}", path.display()))
        })?;
        Self::from_tokenizer(tokenizer)
    }

    pub fn from_tokenizer(mut tokenizer: Tokenizer) -> Result<Self> {
        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::Fixed(CONTEXT_LEN),
            direction: PaddingDirection::Right,
            pad_to_multiple_of: None,
            pad_id: 0,
            pad_type_id: 0,
            pad_token: "[PAD]".to_string(),
        }));

        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: CONTEXT_LEN,
                strategy: TruncationStrategy::LongestFirst,
                stride: 0,
                direction: TruncationDirection::Right,
            }))
            .map_err(|e| {
                VaultError::model_load("tokenizer", format!("failed to apply truncation: {e}"))
            })?;

        Ok(Self { inner: tokenizer })
    }
}

impl Tokenize for ClipTokenizer {
    fn tokenize(&self, text: &str) -> Result<TokenSequence> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| VaultError::inference(format!("text tokenization failed: {e}")))?;
        let ids = encoding.get_ids();
        let real = encoding
            .get_attention_mask()
            .iter()
            .filter(|m| **m != 0)
            .count();
        // Padding from the tokenizer is re-applied by `fit_to_context`.
        Ok(fit_to_context(&ids[..real.min(ids.len())]))
    }
}

/// Tokenizer loaded from disk on first use.
pub struct LazyTokenizer {
    path: PathBuf,
    download_url: Option<&'static str>,
    cell: OnceCell<ClipTokenizer>,
}

impl LazyTokenizer {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            download_url: None,
            cell: OnceCell::new(),
        }
    }

    /// Where the vocabulary can be fetched from, quoted when the file is missing.
    #[must_use]
    pub fn with_download_url(mut self, url: &'static str) -> Self {
        self.download_url = Some(url);
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn get(&self) -> Result<&ClipTokenizer> {
        self.cell.get_or_try_init(|| {
            if !self.path.exists() {
                let reason = match self.download_url {
                    Some(url) => format!(
                        "tokenizer file missing at {}. Download it with:\n  curl -L '{url}' -o '{}'",
                        self.path.display(),
                        self.path.display()
                    ),
                    None => format!("missing {}", self.path.display()),
                };
                return Err(VaultError::model_load("tokenizer", reason));
            }
            tracing::debug!(path = %self.path.display(), "loading CLIP tokenizer");
            let tokenizer = ClipTokenizer::from_file(&self.path)?;
            tracing::info!(path = %self.path.display(), "CLIP tokenizer loaded");
            Ok(tokenizer)
        })
    }
}

impl Tokenize for LazyTokenizer {
    fn tokenize(&self, text: &str) -> Result<TokenSequence> {
        self.get()?.tokenize(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_sequences_are_padded() {
        let seq = fit_to_context(&[49406, 320, 1125, 49407]);
        assert_eq!(seq.ids().len(), CONTEXT_LEN);
        assert_eq!(&seq.ids()[..4], &[49406, 320, 1125, 49407]);
        assert!(seq.ids()[4..].iter().all(|id| *id == PAD_TOKEN_ID));
        assert_eq!(seq.token_count(), 4);
    }

    #[test]
    fn long_sequences_are_truncated() {
        let ids: Vec<u32> = (1..=100).collect();
        let seq = fit_to_context(&ids);
        assert_eq!(seq.ids().len(), CONTEXT_LEN);
        assert_eq!(seq.ids()[CONTEXT_LEN - 1], 77);
        assert_eq!(seq.token_count(), CONTEXT_LEN);
    }

    #[test]
    fn empty_input_is_all_padding() {
        let seq = fit_to_context(&[]);
        assert!(seq.ids().iter().all(|id| *id == PAD_TOKEN_ID));
        assert_eq!(seq.token_count(), 0);
    }

    #[test]
    fn missing_tokenizer_file_is_a_model_load_error() {
        let lazy = LazyTokenizer::new("/nonexistent/clip_tokenizer.json");
        let err = lazy.tokenize("a record sleeve").unwrap_err();
        assert!(matches!(err, VaultError::ModelLoad { .. }));
    }

    #[test]
    fn missing_tokenizer_names_its_download() {
        let url = "https://example.com/clip/tokenizer.json";
        let lazy = LazyTokenizer::new("/nonexistent/clip_tokenizer.json").with_download_url(url);
        let err = lazy.tokenize("a record sleeve").unwrap_err().to_string();
        assert!(err.contains("curl -L"), "{err}");
        assert!(err.contains(url), "{err}");
        assert!(err.contains("/nonexistent/clip_tokenizer.json"), "{err}");
    }
}
