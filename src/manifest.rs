//! Content manifest: the persistent mapping between text units and audio.
//!
//! The on-disk format keeps each unit as an 8-element array (with the
//! chapter flag as 0/1) so existing `content.json` files remain readable by
//! the file-serving frontend.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

pub const AUDIO_EXT: &str = "mp3";

/// One synthesizable piece of text with its audio bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "UnitRow", into = "UnitRow")]
pub struct Unit {
    /// Stable sequence id, zero-padded, assigned in document order.
    pub id: String,
    /// Normalized text sent to the TTS backend.
    pub synthesis_text: String,
    /// First unit of a new chapter.
    pub is_chapter_start: bool,
    /// Relative name of the rendered per-unit audio file; empty until
    /// rendered.
    pub audio_file_name: String,
    /// Human-readable variant, emphasis kept as `*...*` delimiters.
    pub display_text: String,
    pub duration_ms: u64,
    pub cumulative_duration_ms: u64,
    /// Merged chapter file this unit belongs to; assigned during
    /// chapterization.
    pub chapter_file_name: String,
}

impl Unit {
    pub fn new(id: String, synthesis_text: String, display_text: String, chapter: bool) -> Self {
        Self {
            id,
            synthesis_text,
            is_chapter_start: chapter,
            audio_file_name: String::new(),
            display_text,
            duration_ms: 0,
            cumulative_duration_ms: 0,
            chapter_file_name: String::new(),
        }
    }

    /// Destination file name for this unit's audio. Chapter starts carry a
    /// slug of their first words so the output directory stays navigable.
    pub fn derive_audio_file_name(&self) -> String {
        if self.is_chapter_start {
            let slug = slugify_words(&self.display_text, 5);
            if !slug.is_empty() {
                return format!("{}-{}.{}", self.id, slug, AUDIO_EXT);
            }
        }
        format!("{}.{}", self.id, AUDIO_EXT)
    }
}

/// On-disk row shape.
#[derive(Serialize, Deserialize)]
struct UnitRow(String, String, u8, String, String, u64, u64, String);

impl From<Unit> for UnitRow {
    fn from(u: Unit) -> Self {
        UnitRow(
            u.id,
            u.synthesis_text,
            u.is_chapter_start as u8,
            u.audio_file_name,
            u.display_text,
            u.duration_ms,
            u.cumulative_duration_ms,
            u.chapter_file_name,
        )
    }
}

impl From<UnitRow> for Unit {
    fn from(r: UnitRow) -> Self {
        Unit {
            id: r.0,
            synthesis_text: r.1,
            is_chapter_start: r.2 != 0,
            audio_file_name: r.3,
            display_text: r.4,
            duration_ms: r.5,
            cumulative_duration_ms: r.6,
            chapter_file_name: r.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub title: String,
    pub created_at: String,
    pub paragraphs: Vec<Unit>,
}

impl Manifest {
    pub fn new(title: String, paragraphs: Vec<Unit>) -> Self {
        Self {
            title,
            created_at: chrono::Local::now().format("%Y%m%d-%H%M%S").to_string(),
            paragraphs,
        }
    }

    /// Overwrite the manifest at `path`. Called after every batch and after
    /// chapterization, so a killed run leaves resumable state behind.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let file = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(file, self).map_err(std::io::Error::from)
    }
}

static NON_SLUG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^A-Za-z0-9 ]+").unwrap());

/// First `max_words` words reduced to `A-Za-z0-9` and joined with dashes.
pub fn slugify_words(text: &str, max_words: usize) -> String {
    let head: Vec<&str> = text.split_whitespace().take(max_words).collect();
    let joined = head.join(" ");
    let cleaned = NON_SLUG.replace_all(&joined, "");
    cleaned
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}
