//! Chapterization: regroup per-unit audio files into merged per-chapter
//! files using the chapter-start flags, delegating concatenation to the
//! external tool behind `AudioJoiner`.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::manifest::{Manifest, AUDIO_EXT};
use crate::media::AudioJoiner;

/// Merged chapter file name for a 1-based group index.
fn chapter_file_name(index: usize) -> String {
    format!("PART-{index:03}.{AUDIO_EXT}")
}

/// Group the units into chapters, merge each group, copy the cover, and
/// rewrite the manifest into the chapterized subtree. A failed merge skips
/// that group and continues. Returns the chapterized directory.
pub fn chapterize(
    manifest: &mut Manifest,
    output_dir: &Path,
    joiner: &dyn AudioJoiner,
) -> Result<PathBuf> {
    let book_name = output_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "chapterized".to_string());
    let chapterized_dir = output_dir.join(&book_name);
    if chapterized_dir.exists() {
        fs::remove_dir_all(&chapterized_dir)
            .with_context(|| format!("failed to clear {}", chapterized_dir.display()))?;
    }
    fs::create_dir_all(&chapterized_dir)
        .with_context(|| format!("failed to create {}", chapterized_dir.display()))?;

    let groups = group_units(manifest, output_dir);
    info!(chapters = groups.len(), "merging chapter groups");

    for (index, group) in groups.iter().enumerate() {
        let out_path = chapterized_dir.join(chapter_file_name(index + 1));
        let inputs: Vec<PathBuf> = group
            .files
            .iter()
            .filter(|p| p.metadata().map(|m| m.len() > 0).unwrap_or(false))
            .cloned()
            .collect();
        if inputs.is_empty() {
            warn!(chapter = index + 1, "no rendered audio in group, skipping");
            continue;
        }
        match joiner.concatenate(&inputs, &out_path) {
            Ok(()) => info!(
                chapter = index + 1,
                files = inputs.len(),
                output = %out_path.display(),
                "merged chapter"
            ),
            // Keep going: one bad group must not block the rest.
            Err(err) => error!(chapter = index + 1, error = %err, "chapter merge failed"),
        }
    }

    let cover = output_dir.join("cover.jpg");
    if cover.exists() {
        fs::copy(&cover, chapterized_dir.join("cover.jpg"))
            .context("failed to copy cover image")?;
    }

    manifest
        .save(&chapterized_dir.join("content.json"))
        .context("failed to write chapterized manifest")?;
    Ok(chapterized_dir)
}

struct ChapterGroup {
    key: String,
    files: Vec<PathBuf>,
}

/// Walk the units in order, opening a group at every chapter start and
/// stamping each unit with the file name of the group it falls in. The
/// dangling final group is closed too, unless its key already closed.
fn group_units(manifest: &mut Manifest, output_dir: &Path) -> Vec<ChapterGroup> {
    let mut groups: Vec<ChapterGroup> = Vec::new();
    let mut open: Option<ChapterGroup> = None;
    let mut closed_keys: HashSet<String> = HashSet::new();

    for unit in &mut manifest.paragraphs {
        let path = output_dir.join(&unit.audio_file_name);
        // A leading non-chapter unit still belongs to a chapter: open a
        // group for it so nothing is orphaned.
        if unit.is_chapter_start || open.is_none() {
            if let Some(group) = open.take() {
                closed_keys.insert(group.key.clone());
                groups.push(group);
            }
            open = Some(ChapterGroup { key: unit.audio_file_name.clone(), files: vec![path] });
        } else if let Some(group) = open.as_mut() {
            group.files.push(path);
        }
        unit.chapter_file_name = chapter_file_name(groups.len() + 1);
    }

    if let Some(group) = open {
        if !closed_keys.contains(&group.key) {
            groups.push(group);
        }
    }
    groups
}
