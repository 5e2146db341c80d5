//! ONNX Runtime backed encoder sessions.

use std::path::{Path, PathBuf};

use ndarray::Array;
use once_cell::sync::Lazy;
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;

use crate::models::ClipModelInfo;
use crate::session::{InferenceSession, Modality, ModelInput, SessionLoader};
use crate::{Result, VaultError};

// ONNX Runtime on macOS emits "Context leak detected, msgtracer returned -1"
// warnings from Apple's tracing infrastructure while building sessions.
#[cfg(target_os = "macos")]
mod stderr_suppress {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::{AsRawFd, RawFd};

    pub struct StderrSuppressor {
        original_stderr: RawFd,
        #[allow(dead_code)]
        dev_null: File,
    }

    impl StderrSuppressor {
        pub fn new() -> io::Result<Self> {
            let dev_null = File::open("/dev/null")?;
            let original_stderr = unsafe { libc::dup(2) };
            if original_stderr == -1 {
                return Err(io::Error::last_os_error());
            }
            let result = unsafe { libc::dup2(dev_null.as_raw_fd(), 2) };
            if result == -1 {
                unsafe { libc::close(original_stderr) };
                return Err(io::Error::last_os_error());
            }
            Ok(Self {
                original_stderr,
                dev_null,
            })
        }
    }

    impl Drop for StderrSuppressor {
        fn drop(&mut self) {
            unsafe {
                libc::dup2(self.original_stderr, 2);
                libc::close(self.original_stderr);
            }
        }
    }
}

#[cfg(not(target_os = "macos"))]
mod stderr_suppress {
    pub struct StderrSuppressor;

    impl StderrSuppressor {
        pub fn new() -> std::io::Result<Self> {
            Ok(Self)
        }
    }
}

static ORT_INIT: Lazy<()> = Lazy::new(|| {
    let _stderr_guard = stderr_suppress::StderrSuppressor::new().ok();
    // Building a session builder forces the global environment to initialize.
    let _ = Session::builder();
    tracing::debug!("ONNX Runtime global environment initialized");
});

/// Loads encoder sessions for one registered model from a models directory.
pub struct OrtLoader {
    models_dir: PathBuf,
    model_info: &'static ClipModelInfo,
    intra_threads: usize,
}

impl OrtLoader {
    #[must_use]
    pub fn new(
        models_dir: impl Into<PathBuf>,
        model_info: &'static ClipModelInfo,
        intra_threads: usize,
    ) -> Self {
        Self {
            models_dir: models_dir.into(),
            model_info,
            intra_threads,
        }
    }

    #[must_use]
    pub fn model_path(&self, modality: Modality) -> PathBuf {
        let file = match modality {
            Modality::Vision => self.model_info.vision_file(),
            Modality::Text => self.model_info.text_file(),
        };
        self.models_dir.join(file)
    }

    fn build_session(&self, modality: Modality, path: &Path) -> Result<Session> {
        let fail = |e: &dyn std::fmt::Display| VaultError::model_load(modality.as_str(), e);

        let _stderr_guard = stderr_suppress::StderrSuppressor::new().ok();
        Session::builder()
            .map_err(|e| fail(&e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| fail(&e))?
            .with_intra_threads(self.intra_threads)
            .map_err(|e| fail(&e))?
            .commit_from_file(path)
            .map_err(|e| fail(&format!("failed to load {}: {e}", path.display())))
    }
}

impl SessionLoader for OrtLoader {
    fn load(&self, modality: Modality) -> Result<Box<dyn InferenceSession>> {
        let path = self.model_path(modality);
        if !path.exists() {
            let url = match modality {
                Modality::Vision => self.model_info.vision_url,
                Modality::Text => self.model_info.text_url,
            };
            return Err(VaultError::model_load(
                modality.as_str(),
                format!(
                    "model file missing at {}. Download it with:\n  curl -L '{url}' -o '{}'",
                    path.display(),
                    path.display()
                ),
            ));
        }

        Lazy::force(&ORT_INIT);
        tracing::debug!(path = %path.display(), modality = %modality, "loading ONNX model");
        let session = self.build_session(modality, &path)?;

        let (preferred_input, preferred_output) = match modality {
            Modality::Vision => (self.model_info.vision_input, self.model_info.vision_output),
            Modality::Text => (self.model_info.text_input, self.model_info.text_output),
        };
        let input_names: Vec<String> = session.inputs.iter().map(|i| i.name.clone()).collect();
        let output_name = session
            .outputs
            .iter()
            .find(|o| o.name == preferred_output)
            .or_else(|| session.outputs.first())
            .map_or_else(|| preferred_output.to_string(), |o| o.name.clone());
        let primary_input = input_names
            .iter()
            .find(|name| name.as_str() == preferred_input)
            .or_else(|| input_names.first())
            .cloned()
            .unwrap_or_else(|| preferred_input.to_string());

        tracing::info!(
            model = %self.model_info.name,
            modality = %modality,
            input = %primary_input,
            output = %output_name,
            "ONNX session ready"
        );

        Ok(Box::new(OrtSession {
            session,
            modality,
            primary_input,
            mask_input: input_names.into_iter().find(|n| n == "attention_mask"),
            output_name,
        }))
    }
}

/// One ONNX Runtime session with its resolved tensor names.
pub struct OrtSession {
    session: Session,
    modality: Modality,
    primary_input: String,
    mask_input: Option<String>,
    output_name: String,
}

impl InferenceSession for OrtSession {
    fn run(&mut self, input: ModelInput) -> Result<Vec<f32>> {
        let outputs = match (self.modality, input) {
            (Modality::Vision, ModelInput::Pixels(pixels)) => {
                let tensor = Tensor::from_array(pixels).map_err(|e| {
                    VaultError::inference(format!("failed to create pixel tensor: {e}"))
                })?;
                self.session
                    .run(ort::inputs![self.primary_input.clone() => tensor])
                    .map_err(|e| VaultError::inference(format!("vision inference failed: {e}")))?
            }
            (Modality::Text, ModelInput::Tokens(tokens)) => {
                let len = tokens.ids().len();
                let ids: Vec<i64> = tokens.ids().iter().map(|id| i64::from(*id)).collect();
                let ids = Array::from_shape_vec((1, len), ids).map_err(VaultError::inference)?;
                let ids = Tensor::from_array(ids).map_err(|e| {
                    VaultError::inference(format!("failed to create input_ids tensor: {e}"))
                })?;

                match self.mask_input.clone() {
                    Some(mask_name) => {
                        let mask: Vec<i64> = tokens
                            .attention_mask()
                            .iter()
                            .map(|m| i64::from(*m))
                            .collect();
                        let mask = Array::from_shape_vec((1, len), mask)
                            .map_err(VaultError::inference)?;
                        let mask = Tensor::from_array(mask).map_err(|e| {
                            VaultError::inference(format!(
                                "failed to create attention_mask tensor: {e}"
                            ))
                        })?;
                        self.session
                            .run(ort::inputs![
                                self.primary_input.clone() => ids,
                                mask_name => mask
                            ])
                            .map_err(|e| {
                                VaultError::inference(format!("text inference failed: {e}"))
                            })?
                    }
                    None => self
                        .session
                        .run(ort::inputs![self.primary_input.clone() => ids])
                        .map_err(|e| VaultError::inference(format!("text inference failed: {e}")))?,
                }
            }
            (modality, _) => {
                return Err(VaultError::inference(format!(
                    "{modality} session received input for the other encoder"
                )));
            }
        };

        let output = outputs.get(&self.output_name).ok_or_else(|| {
            VaultError::inference(format!(
                "no output '{}' from {} model",
                self.output_name, self.modality
            ))
        })?;
        let (_shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| VaultError::inference(format!("failed to extract embeddings: {e}")))?;
        Ok(data.to_vec())
    }
}
