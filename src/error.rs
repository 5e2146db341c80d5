use std::borrow::Cow;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, VaultError>;

/// Canonical error surface for photovault.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("I/O error: {source}")]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    #[error("Image preprocessing failed: {reason}")]
    Preprocess { reason: Cow<'static, str> },

    #[error("Failed to load {model} model: {reason}")]
    ModelLoad { model: String, reason: Box<str> },

    #[error("Inference failed: {reason}")]
    Inference { reason: Box<str> },

    #[error("Embedding dimension mismatch (expected {expected}, got {actual})")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Storage error: {reason}")]
    Storage { reason: String },

    #[error("Image {id} was not found")]
    ImageNotFound { id: u64 },

    #[error("Model mismatch: catalog is bound to '{expected}', but requested model was '{actual}'")]
    ModelMismatch { expected: String, actual: String },

    #[error("Lock acquisition failed: {0}")]
    Lock(String),

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },
}

impl VaultError {
    pub(crate) fn preprocess(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::Preprocess {
            reason: reason.into(),
        }
    }

    pub(crate) fn inference(reason: impl std::fmt::Display) -> Self {
        Self::Inference {
            reason: reason.to_string().into_boxed_str(),
        }
    }

    pub(crate) fn model_load(model: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::ModelLoad {
            model: model.into(),
            reason: reason.to_string().into_boxed_str(),
        }
    }

    pub(crate) fn io_at(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Short, actionable message for the host UI. Each failure class maps to a
    /// distinct message.
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Preprocess { .. } => "Could not read that photo. Try taking it again.",
            Self::ModelLoad { .. } => "Model unavailable. Try again.",
            Self::Inference { .. } | Self::DimensionMismatch { .. } => {
                "Could not analyze the photo. Try again."
            }
            Self::Storage { .. } | Self::Io { .. } => "Save failed. Check free storage space.",
            Self::ImageNotFound { .. } => "That photo is no longer in the catalog.",
            Self::ModelMismatch { .. } => {
                "The catalog was built with a different model. Delete the catalog to switch models."
            }
            Self::Lock(_) => "The catalog is busy. Try again.",
            Self::Config { .. } => "Settings are invalid. Check the configuration file.",
        }
    }
}

impl From<std::io::Error> for VaultError {
    fn from(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }
}

impl From<rusqlite::Error> for VaultError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Storage {
            reason: value.to_string(),
        }
    }
}

impl From<image::ImageError> for VaultError {
    fn from(value: image::ImageError) -> Self {
        Self::Preprocess {
            reason: Cow::Owned(value.to_string()),
        }
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(value: serde_json::Error) -> Self {
        Self::Config {
            reason: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_messages_are_distinct_per_failure_class() {
        let errors = [
            VaultError::preprocess("zero width"),
            VaultError::model_load("vision", "missing file"),
            VaultError::inference("shape mismatch"),
            VaultError::Storage {
                reason: "disk full".into(),
            },
            VaultError::ImageNotFound { id: 7 },
        ];
        let mut messages: Vec<&str> = errors.iter().map(VaultError::user_message).collect();
        messages.sort_unstable();
        messages.dedup();
        assert_eq!(messages.len(), errors.len());
    }

    #[test]
    fn sqlite_errors_become_storage_errors() {
        let err: VaultError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, VaultError::Storage { .. }));
    }
}
