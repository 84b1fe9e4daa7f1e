//! EPUB to audiobook converter: extracts text units from EPUB files,
//! synthesizes them through a remote TTS backend, and optionally merges the
//! per-unit audio into per-chapter files.

mod chapterize;
mod config;
mod endpoint;
mod error;
mod extract;
mod manifest;
mod media;
mod normalize;
mod schedule;
mod synth;

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use epub::doc::EpubDoc;
use regex::Regex;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::endpoint::EndpointPool;
use crate::manifest::Manifest;
use crate::media::FfmpegJoiner;
use crate::schedule::BatchScheduler;
use crate::synth::HttpSynthesizer;

#[derive(Parser, Debug)]
#[command(name = "epub-narrator")]
#[command(about = "Convert EPUB files to audiobooks using remote TTS backends", version)]
struct Args {
    /// Directory scanned for EPUB files (overrides the config value)
    #[arg(short, long)]
    books: Option<PathBuf>,

    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Merge per-unit audio into chapter files after synthesis
    #[arg(long)]
    chapterize: bool,

    /// Use the alternate TTS backend
    #[arg(long)]
    alt_backend: bool,

    /// Units synthesized concurrently per batch (overrides the config value)
    #[arg(long)]
    batch_size: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = Config::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    if let Some(books) = args.books {
        config.books_dir = books;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if args.alt_backend {
        config.use_alt_service = true;
    }
    let config = Arc::new(config);

    let mut epubs: Vec<PathBuf> = fs::read_dir(&config.books_dir)
        .with_context(|| format!("failed to read books dir {}", config.books_dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("epub"))
        .collect();
    epubs.sort();

    if epubs.is_empty() {
        info!(dir = %config.books_dir.display(), "no EPUB files found");
        return Ok(());
    }

    for epub_path in &epubs {
        if let Err(err) = convert_book(epub_path, &config, args.chapterize).await {
            error!(book = %epub_path.display(), error = %err, "conversion failed");
        }
    }
    Ok(())
}

async fn convert_book(epub_path: &Path, config: &Arc<Config>, run_chapterize: bool) -> Result<()> {
    let started = Instant::now();
    let stem = epub_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "book".to_string());
    let output_dir = config.books_dir.join(sanitize_book_dir(&stem));

    info!(book = %epub_path.display(), output = %output_dir.display(), "processing");
    let resuming = output_dir.exists();
    fs::create_dir_all(&output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;
    if resuming {
        discard_latest_partial(&output_dir);
    }

    let mut doc: EpubDoc<BufReader<File>> = EpubDoc::new(epub_path)
        .with_context(|| format!("failed to open EPUB {}", epub_path.display()))?;

    if let Err(err) = extract::save_cover(&mut doc, &output_dir) {
        warn!(error = %err, "failed to save cover image");
    }

    let units = extract::extract_units(&mut doc, config);
    for unit in &units {
        let tag = if unit.is_chapter_start { "CHAPTER" } else { "PARA" };
        debug!(id = %unit.id, tag, text = %preview(&unit.display_text), "extracted");
    }

    let mut manifest = Manifest::new(stem, units);
    let manifest_path = output_dir.join("content.json");

    let pool = Arc::new(EndpointPool::from_backend(config.active_backend()));
    let synthesizer = Arc::new(HttpSynthesizer::new(config, pool).context("failed to build TTS client")?);
    let scheduler = BatchScheduler::new(Arc::clone(config), synthesizer);
    scheduler.run(&mut manifest, &output_dir, &manifest_path).await?;

    if run_chapterize {
        info!("chapterizing");
        let chapterized = chapterize::chapterize(&mut manifest, &output_dir, &FfmpegJoiner)?;
        info!(dir = %chapterized.display(), "chapterized output written");
    }

    info!(elapsed_secs = started.elapsed().as_secs(), "book complete");
    Ok(())
}

fn preview(text: &str) -> String {
    if text.chars().count() > 80 {
        let head: String = text.chars().take(80).collect();
        format!("{head}...")
    } else {
        text.to_string()
    }
}

static DIR_INVALID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_.\- ]+").unwrap());
static DIR_SEPARATORS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\s_]+").unwrap());
static DIR_DASH_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-{2,}").unwrap());

/// Output directory name for a book: the EPUB stem with anything exotic
/// stripped and separators collapsed to single dashes.
fn sanitize_book_dir(stem: &str) -> String {
    let cleaned = DIR_INVALID.replace_all(stem, "");
    let dashed = DIR_SEPARATORS.replace_all(&cleaned, "-");
    let collapsed = DIR_DASH_RUNS.replace_all(&dashed, "-");
    collapsed.trim_matches('-').to_string()
}

/// A run killed mid-write can leave a truncated final clip behind. Drop the
/// most recently modified per-unit file so resume re-renders it.
fn discard_latest_partial(output_dir: &Path) {
    let newest = fs::read_dir(output_dir)
        .ok()
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.starts_with("pgrf-") && name.ends_with(".mp3")
        })
        .filter_map(|entry| {
            entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .map(|modified| (modified, entry.path()))
        })
        .max_by_key(|(modified, _)| *modified);

    if let Some((_, path)) = newest {
        match fs::remove_file(&path) {
            Ok(()) => info!(file = %path.display(), "discarded most recent clip before resume"),
            Err(err) => warn!(file = %path.display(), error = %err, "failed to discard clip"),
        }
    }
}
