use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "photovault")]
#[command(about = "On-device photo catalog with CLIP similarity search", long_about = None)]
#[command(version)]
pub(crate) struct Cli {
    /// Catalog root. Default: $PHOTOVAULT_HOME or ~/.photovault
    #[arg(long, global = true)]
    pub(crate) root: Option<PathBuf>,
    /// Log debug output to stderr (overridden by PHOTOVAULT_LOG)
    #[arg(short, long, global = true)]
    pub(crate) verbose: bool,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Create the catalog directories and write a config file.
    Init {
        /// Model to bind the catalog to
        #[arg(long)]
        model: Option<String>,
        /// Directory containing the model files
        #[arg(long)]
        models_dir: Option<PathBuf>,
    },

    /// Embed a photo and store it in the catalog.
    Save {
        image: PathBuf,
        /// Capture width. Default: decoded width
        #[arg(long)]
        width: Option<u32>,
        /// Capture height. Default: decoded height
        #[arg(long)]
        height: Option<u32>,
        /// Narrow the centered crop by this factor
        #[arg(long, default_value_t = 1.0)]
        zoom: f32,
        #[arg(long)]
        json: bool,
    },

    /// Save every photo under a directory.
    Import {
        dir: PathBuf,
        /// File extensions to import (repeatable). Default: jpg, jpeg, png, webp
        #[arg(long = "ext")]
        exts: Vec<String>,
        #[arg(long)]
        json: bool,
    },

    /// Find stored photos similar to a photo.
    SearchImage {
        image: PathBuf,
        #[arg(long)]
        width: Option<u32>,
        #[arg(long)]
        height: Option<u32>,
        #[arg(long)]
        json: bool,
    },

    /// Find stored photos matching a text description.
    SearchText {
        query: String,
        #[arg(long)]
        json: bool,
    },

    /// List stored photos in insertion order.
    List {
        #[arg(long)]
        json: bool,
    },

    /// Show one stored photo.
    Show {
        id: u64,
        /// Include the embedding in the output
        #[arg(long)]
        embedding: bool,
        #[arg(long)]
        json: bool,
    },

    /// Delete every stored photo. Irreversible.
    DeleteAll {
        /// Confirm deletion
        #[arg(long)]
        yes: bool,
    },

    /// List the registered CLIP models.
    Models {
        #[arg(long)]
        json: bool,
    },

    /// Load the text encoder and tokenizer and verify they match the catalog.
    Check {
        #[arg(long)]
        json: bool,
    },
}
