mod cli;

use std::path::Path;

use clap::Parser;
use photovault::{
    CLIP_MODELS, Catalog, Delivery, ImageRecord, Relevance, SearchResult, VaultConfig, VaultError,
};
use serde::Serialize;
use tracing_subscriber::{EnvFilter, fmt};
use walkdir::WalkDir;

use cli::{Cli, Command};

const DEFAULT_IMPORT_EXTS: &[&str] = &["jpg", "jpeg", "png", "webp"];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    if let Err(err) = runtime.block_on(run(cli)) {
        eprintln!("{}", err.user_message());
        eprintln!("error: {err}");
        std::process::exit(1);
    }
    Ok(())
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env("PHOTOVAULT_LOG").unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("photovault=debug")
        } else {
            EnvFilter::new("warn")
        }
    });
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> photovault::Result<VaultConfig> {
    let root = cli
        .root
        .clone()
        .unwrap_or_else(|| VaultConfig::default().root);
    VaultConfig::load(root)
}

async fn run(cli: Cli) -> photovault::Result<()> {
    let config = load_config(&cli)?;

    match cli.command {
        Command::Init { model, models_dir } => {
            let mut config = config;
            if let Some(model) = model {
                config.model_name = model;
            }
            if let Some(models_dir) = models_dir {
                config.models_dir = models_dir;
            }
            config.validate()?;
            config.save()?;
            let catalog = Catalog::open(&config)?;
            println!(
                "Initialized {} ({}, {} dims, {} photos)",
                config.root.display(),
                config.model_info().name,
                config.model_info().dims,
                catalog.len()?
            );
            Ok(())
        }

        Command::Save {
            image,
            width,
            height,
            zoom,
            json,
        } => {
            let catalog = Catalog::open(&config)?;
            let (raw, w, h) = read_photo(&image, width, height)?;
            let id = catalog
                .prepare_photo_zoomed(&raw, w, h, zoom)
                .await?
                .commit()?;
            let record = catalog.get(id)?;
            if json {
                print_json(&serde_json::json!({
                    "id": record.id,
                    "image_ref": record.image_ref,
                }))?;
            } else {
                println!("Saved {} as #{} ({})", image.display(), id, record.image_ref);
            }
            Ok(())
        }

        Command::Import { dir, exts, json } => {
            if !dir.is_dir() {
                eprintln!("Not a directory: {}", dir.display());
                std::process::exit(2);
            }
            let catalog = Catalog::open(&config)?;
            let summary = import_dir(&catalog, &dir, &exts).await;
            if json {
                print_json(&summary)?;
            } else {
                println!(
                    "Imported {} of {} photos ({} failed)",
                    summary.saved.len(),
                    summary.scanned,
                    summary.failed.len()
                );
                for failure in &summary.failed {
                    println!("  {}: {}", failure.path, failure.error);
                }
            }
            Ok(())
        }

        Command::SearchImage {
            image,
            width,
            height,
            json,
        } => {
            let catalog = Catalog::open(&config)?;
            let (raw, w, h) = read_photo(&image, width, height)?;
            let delivery = catalog
                .search_by_photo(&raw, w, h, &Relevance::new())
                .await?;
            print_results(delivery, json)
        }

        Command::SearchText { query, json } => {
            let catalog = Catalog::open(&config)?;
            let delivery = catalog.search_by_text(&query, &Relevance::new()).await?;
            print_results(delivery, json)
        }

        Command::List { json } => {
            let catalog = Catalog::open(&config)?;
            let records = catalog.list()?;
            if json {
                let rows: Vec<_> = records.iter().map(RecordSummary::from).collect();
                print_json(&rows)?;
            } else if records.is_empty() {
                println!("No photos.");
            } else {
                for record in &records {
                    println!("#{:<6} {}", record.id, record.image_ref);
                }
            }
            Ok(())
        }

        Command::Show {
            id,
            embedding,
            json,
        } => {
            let catalog = Catalog::open(&config)?;
            let record = catalog.get(id)?;
            if json {
                if embedding {
                    print_json(&record)?;
                } else {
                    print_json(&RecordSummary::from(&record))?;
                }
            } else {
                println!("id: {}", record.id);
                println!("image: {}", record.image_ref);
                println!("dims: {}", record.embedding.len());
                if embedding {
                    println!("embedding: {:?}", record.embedding);
                }
            }
            Ok(())
        }

        Command::DeleteAll { yes } => {
            if !yes {
                eprintln!("Refusing to delete the catalog without --yes");
                std::process::exit(2);
            }
            let catalog = Catalog::open(&config)?;
            let removed = catalog.delete_all()?;
            println!("Deleted {removed} photos");
            Ok(())
        }

        Command::Models { json } => {
            if json {
                let models: Vec<_> = CLIP_MODELS
                    .iter()
                    .map(|m| {
                        serde_json::json!({
                            "name": m.name,
                            "dims": m.dims,
                            "default": m.is_default,
                            "files": [m.vision_file(), m.text_file(), m.tokenizer_file()],
                        })
                    })
                    .collect();
                print_json(&models)?;
            } else {
                for model in CLIP_MODELS {
                    let present = [model.vision_file(), model.text_file(), model.tokenizer_file()]
                        .iter()
                        .all(|f| config.models_dir.join(f).exists());
                    println!(
                        "{}{:<14} {:>4} dims  {}",
                        if model.is_default { "*" } else { " " },
                        model.name,
                        model.dims,
                        if present { "installed" } else { "missing" }
                    );
                }
                println!("models dir: {}", config.models_dir.display());
            }
            Ok(())
        }

        Command::Check { json } => {
            let catalog = Catalog::open(&config)?;
            let dims = catalog.self_check().await?;
            if json {
                print_json(&serde_json::json!({
                    "model": config.model_info().name,
                    "dims": dims,
                    "ok": true,
                }))?;
            } else {
                println!("{} OK ({} dims)", config.model_info().name, dims);
            }
            Ok(())
        }
    }
}

#[derive(Serialize)]
struct RecordSummary<'a> {
    id: u64,
    image_ref: &'a str,
    dims: usize,
}

impl<'a> From<&'a ImageRecord> for RecordSummary<'a> {
    fn from(record: &'a ImageRecord) -> Self {
        Self {
            id: record.id,
            image_ref: &record.image_ref,
            dims: record.embedding.len(),
        }
    }
}

#[derive(Serialize)]
struct ImportFailure {
    path: String,
    error: String,
}

#[derive(Serialize, Default)]
struct ImportSummary {
    scanned: usize,
    saved: Vec<u64>,
    failed: Vec<ImportFailure>,
}

async fn import_dir(catalog: &Catalog, dir: &Path, exts: &[String]) -> ImportSummary {
    let mut summary = ImportSummary::default();

    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        if !entry.file_type().is_file() || !is_extension_allowed(entry.path(), exts) {
            continue;
        }
        summary.scanned += 1;

        let path = entry.path();
        let outcome = match read_photo(path, None, None) {
            Ok((raw, w, h)) => catalog.save_photo(&raw, w, h).await,
            Err(err) => Err(err),
        };
        match outcome {
            Ok(id) => {
                tracing::debug!(id, path = %path.display(), "imported photo");
                summary.saved.push(id);
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "import failed");
                summary.failed.push(ImportFailure {
                    path: path.display().to_string(),
                    error: err.to_string(),
                });
            }
        }
    }
    summary
}

fn is_extension_allowed(path: &Path, exts: &[String]) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    let ext = ext.to_ascii_lowercase();
    if exts.is_empty() {
        DEFAULT_IMPORT_EXTS.contains(&ext.as_str())
    } else {
        exts.iter()
            .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(&ext))
    }
}

/// Read a photo and resolve its capture dimensions, defaulting to the
/// encoded image's own size.
fn read_photo(
    path: &Path,
    width: Option<u32>,
    height: Option<u32>,
) -> photovault::Result<(Vec<u8>, u32, u32)> {
    let raw = std::fs::read(path).map_err(|e| VaultError::Io {
        source: e,
        path: Some(path.to_path_buf()),
    })?;
    let (w, h) = match (width, height) {
        (Some(w), Some(h)) => (w, h),
        _ => {
            let (dw, dh) = image::image_dimensions(path)?;
            (width.unwrap_or(dw), height.unwrap_or(dh))
        }
    };
    Ok((raw, w, h))
}

fn print_results(delivery: Delivery<Vec<SearchResult>>, json: bool) -> photovault::Result<()> {
    let Delivery::Ready(results) = delivery else {
        return Ok(());
    };
    if json {
        return print_json(&results);
    }
    if results.is_empty() {
        println!("No photos in the catalog.");
        return Ok(());
    }
    for (rank, hit) in results.iter().enumerate() {
        println!(
            "{:>2}. #{:<6} {:.4}  {}",
            rank + 1,
            hit.id,
            hit.distance,
            hit.image_ref
        );
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> photovault::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
