//! Catalog configuration: environment defaults plus an optional
//! `<root>/config.json` overlay.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::models::{ClipModelInfo, get_model_info};
use crate::session::SessionPolicy;
use crate::{Result, VaultError};

/// Number of matches returned by a search unless configured otherwise.
pub const DEFAULT_TOP_K: usize = 6;

const DEFAULT_INTRA_THREADS: usize = 4;
const CONFIG_FILE_NAME: &str = "config.json";

/// Resolved settings for one catalog root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultConfig {
    /// Directory holding the database, stored images and scratch files
    pub root: PathBuf,
    /// Directory where model files are placed by the host platform
    pub models_dir: PathBuf,
    /// Registered model name (see [`crate::models::CLIP_MODELS`])
    pub model_name: String,
    /// ONNX Runtime intra-op threads per session
    pub intra_threads: usize,
    /// Matches returned per search
    pub top_k: usize,
    /// Whether vision and text sessions may be resident together
    pub session_policy: SessionPolicy,
}

/// On-disk shape of `config.json`. Every field is optional so a partial file
/// only overrides what it names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intra_threads: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_policy: Option<SessionPolicy>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        let root = std::env::var("PHOTOVAULT_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| dirs_next::home_dir().map(|d| d.join(".photovault")))
            .unwrap_or_else(|| PathBuf::from(".photovault"));
        Self::for_root(root)
    }
}

impl VaultConfig {
    /// Defaults for an explicit root directory. Environment overrides for the
    /// models directory and model name still apply.
    #[must_use]
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let models_dir = std::env::var("PHOTOVAULT_MODELS_DIR")
            .ok()
            .map(PathBuf::from)
            .unwrap_or_else(|| root.join("models"));
        let model_name = std::env::var("PHOTOVAULT_CLIP_MODEL")
            .unwrap_or_else(|_| crate::models::default_model_info().name.to_string());

        Self {
            root,
            models_dir,
            model_name,
            intra_threads: DEFAULT_INTRA_THREADS,
            top_k: DEFAULT_TOP_K,
            session_policy: SessionPolicy::default(),
        }
    }

    /// Load the configuration for `root`, applying `<root>/config.json` when
    /// it exists.
    pub fn load(root: impl Into<PathBuf>) -> Result<Self> {
        let mut config = Self::for_root(root);
        let path = config.config_path();
        match std::fs::read_to_string(&path) {
            Ok(data) => {
                let file: FileConfig = serde_json::from_str(&data)?;
                config.apply(file);
                tracing::debug!(path = %path.display(), "applied config file");
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(VaultError::io_at(err, path)),
        }
        config.validate()?;
        Ok(config)
    }

    /// Overlay the fields present in `file`.
    pub fn apply(&mut self, file: FileConfig) {
        if let Some(models_dir) = file.models_dir {
            self.models_dir = models_dir;
        }
        if let Some(model_name) = file.model_name {
            self.model_name = model_name;
        }
        if let Some(threads) = file.intra_threads {
            self.intra_threads = threads;
        }
        if let Some(top_k) = file.top_k {
            self.top_k = top_k;
        }
        if let Some(policy) = file.session_policy {
            self.session_policy = policy;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(VaultError::Config {
                reason: "top_k must be at least 1".into(),
            });
        }
        if self.intra_threads == 0 {
            return Err(VaultError::Config {
                reason: "intra_threads must be at least 1".into(),
            });
        }
        if self.model_name.trim().is_empty() {
            return Err(VaultError::Config {
                reason: "model_name is empty".into(),
            });
        }
        Ok(())
    }

    /// Persist the current settings to `<root>/config.json` (tmp + rename).
    pub fn save(&self) -> Result<()> {
        let path = self.config_path();
        std::fs::create_dir_all(&self.root).map_err(|e| VaultError::io_at(e, &self.root))?;
        let file = FileConfig {
            models_dir: Some(self.models_dir.clone()),
            model_name: Some(self.model_name.clone()),
            intra_threads: Some(self.intra_threads),
            top_k: Some(self.top_k),
            session_policy: Some(self.session_policy),
        };
        let json = serde_json::to_string_pretty(&file)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| VaultError::io_at(e, &tmp))?;
        std::fs::rename(&tmp, &path).map_err(|e| VaultError::io_at(e, &path))?;
        Ok(())
    }

    /// Registry entry for the configured model (falls back to the default).
    #[must_use]
    pub fn model_info(&self) -> &'static ClipModelInfo {
        get_model_info(&self.model_name)
    }

    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE_NAME)
    }

    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.root.join("catalog.sqlite")
    }

    /// Storage-owned copies of saved photos.
    #[must_use]
    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    /// Temporary processed images live here until their flow completes.
    #[must_use]
    pub fn scratch_dir(&self) -> PathBuf {
        self.root.join("scratch")
    }

    /// Create the directories a catalog needs.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.root.clone(), self.images_dir(), self.scratch_dir()] {
            create_dir(&dir)?;
        }
        Ok(())
    }
}

fn create_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| VaultError::io_at(e, dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_for_root() {
        let config = VaultConfig::for_root("/tmp/catalog");
        assert_eq!(config.top_k, DEFAULT_TOP_K);
        assert_eq!(config.database_path(), PathBuf::from("/tmp/catalog/catalog.sqlite"));
        assert_eq!(config.images_dir(), PathBuf::from("/tmp/catalog/images"));
        assert_eq!(config.session_policy, SessionPolicy::Exclusive);
    }

    #[test]
    fn missing_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let config = VaultConfig::load(dir.path()).unwrap();
        assert_eq!(config.top_k, DEFAULT_TOP_K);
        assert_eq!(config.intra_threads, DEFAULT_INTRA_THREADS);
    }

    #[test]
    fn file_overrides_named_fields_only() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{ "top_k": 10, "session_policy": "coresident" }"#,
        )
        .unwrap();
        let config = VaultConfig::load(dir.path()).unwrap();
        assert_eq!(config.top_k, 10);
        assert_eq!(config.session_policy, SessionPolicy::Coresident);
        assert_eq!(config.intra_threads, DEFAULT_INTRA_THREADS);
    }

    #[test]
    fn save_then_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut config = VaultConfig::for_root(dir.path());
        config.top_k = 3;
        config.intra_threads = 2;
        config.save().unwrap();

        let loaded = VaultConfig::load(dir.path()).unwrap();
        assert_eq!(loaded, config);
        assert!(!dir.path().join("config.json.tmp").exists());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.json"), r#"{ "top_k": 0 }"#).unwrap();
        let err = VaultConfig::load(dir.path()).unwrap_err();
        assert!(matches!(err, VaultError::Config { .. }));

        std::fs::write(dir.path().join("config.json"), "not json").unwrap();
        let err = VaultConfig::load(dir.path()).unwrap_err();
        assert!(matches!(err, VaultError::Config { .. }));
    }
}
