//! Registry of supported CLIP encoder pairs.
//!
//! Each entry describes a vision encoder and a text encoder that share one
//! embedding space. Model files are not downloaded by photovault; the host
//! platform places them in the models directory under the names returned by
//! [`ClipModelInfo::vision_file`], [`ClipModelInfo::text_file`] and
//! [`ClipModelInfo::tokenizer_file`].

/// CLIP ViT-B/32 embedding dimensions
pub const VIT_B32_DIMS: usize = 512;

/// CLIP ViT-L/14 embedding dimensions
pub const VIT_L14_DIMS: usize = 768;

/// Input resolution shared by all registered vision encoders
pub const INPUT_SIZE: u32 = 224;

/// Text encoder context window, in tokens
pub const CONTEXT_LEN: usize = 77;

/// Available CLIP models with their `HuggingFace` export URLs
#[derive(Debug, Clone)]
pub struct ClipModelInfo {
    /// Model identifier
    pub name: &'static str,
    /// URL for vision encoder ONNX model
    pub vision_url: &'static str,
    /// URL for text encoder ONNX model
    pub text_url: &'static str,
    /// URL for tokenizer JSON (BPE)
    pub tokenizer_url: &'static str,
    /// Output embedding dimensions
    pub dims: usize,
    /// Input image resolution
    pub input_resolution: u32,
    /// Named input of the vision graph
    pub vision_input: &'static str,
    /// Named output of the vision graph
    pub vision_output: &'static str,
    /// Named token input of the text graph
    pub text_input: &'static str,
    /// Named output of the text graph
    pub text_output: &'static str,
    /// Whether this is the default model
    pub is_default: bool,
}

impl ClipModelInfo {
    #[must_use]
    pub fn vision_file(&self) -> String {
        format!("{}_vision.onnx", self.name)
    }

    #[must_use]
    pub fn text_file(&self) -> String {
        format!("{}_text.onnx", self.name)
    }

    #[must_use]
    pub fn tokenizer_file(&self) -> String {
        format!("{}_tokenizer.json", self.name)
    }
}

/// Available CLIP models registry
pub static CLIP_MODELS: &[ClipModelInfo] = &[
    ClipModelInfo {
        name: "clip-vit-b32",
        vision_url: "https://huggingface.co/Xenova/clip-vit-base-patch32/resolve/main/onnx/vision_model.onnx",
        text_url: "https://huggingface.co/Xenova/clip-vit-base-patch32/resolve/main/onnx/text_model.onnx",
        tokenizer_url: "https://huggingface.co/Xenova/clip-vit-base-patch32/resolve/main/tokenizer.json",
        dims: VIT_B32_DIMS,
        input_resolution: INPUT_SIZE,
        vision_input: "pixel_values",
        vision_output: "image_embeds",
        text_input: "input_ids",
        text_output: "text_embeds",
        is_default: true,
    },
    // Larger and slower; better separation between similar record sleeves
    ClipModelInfo {
        name: "clip-vit-l14",
        vision_url: "https://huggingface.co/Xenova/clip-vit-large-patch14/resolve/main/onnx/vision_model.onnx",
        text_url: "https://huggingface.co/Xenova/clip-vit-large-patch14/resolve/main/onnx/text_model.onnx",
        tokenizer_url: "https://huggingface.co/Xenova/clip-vit-large-patch14/resolve/main/tokenizer.json",
        dims: VIT_L14_DIMS,
        input_resolution: INPUT_SIZE,
        vision_input: "pixel_values",
        vision_output: "image_embeds",
        text_input: "input_ids",
        text_output: "text_embeds",
        is_default: false,
    },
];

/// Get model info by name, defaults to clip-vit-b32
#[must_use]
pub fn get_model_info(name: &str) -> &'static ClipModelInfo {
    CLIP_MODELS
        .iter()
        .find(|m| m.name == name)
        .unwrap_or_else(default_model_info)
}

/// Get the default model info
#[must_use]
pub fn default_model_info() -> &'static ClipModelInfo {
    CLIP_MODELS
        .iter()
        .find(|m| m.is_default)
        .unwrap_or(&CLIP_MODELS[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_registry() {
        let default = default_model_info();
        assert_eq!(default.name, "clip-vit-b32");
        assert_eq!(default.dims, 512);
        assert!(default.is_default);

        let large = get_model_info("clip-vit-l14");
        assert_eq!(large.dims, 768);

        // Unknown model returns default
        let unknown = get_model_info("nonexistent");
        assert_eq!(unknown.name, "clip-vit-b32");
    }

    #[test]
    fn registered_models_share_input_geometry() {
        assert_eq!(CLIP_MODELS.iter().filter(|m| m.is_default).count(), 1);
        for model in CLIP_MODELS {
            assert_eq!(model.input_resolution, INPUT_SIZE);
            assert!(model.vision_file().ends_with("_vision.onnx"));
        }
    }
}
