//! Batch scheduler: drives the unit list through synthesis with bounded
//! parallelism, staggered starts, resume, and duration accounting.
//!
//! Batches run to full completion before the next one forms; the manifest
//! is rewritten after every batch so a killed run resumes where it left
//! off.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::manifest::Manifest;
use crate::media;
use crate::synth::{destination_for, Synthesizer};

pub struct BatchScheduler {
    config: Arc<Config>,
    synthesizer: Arc<dyn Synthesizer>,
}

impl BatchScheduler {
    pub fn new(config: Arc<Config>, synthesizer: Arc<dyn Synthesizer>) -> Self {
        Self { config, synthesizer }
    }

    /// Render every pending unit, then run the duration pass. The manifest
    /// is persisted after each batch and once more at the end.
    pub async fn run(
        &self,
        manifest: &mut Manifest,
        output_dir: &Path,
        manifest_path: &Path,
    ) -> Result<()> {
        for unit in &mut manifest.paragraphs {
            unit.audio_file_name = unit.derive_audio_file_name();
        }

        let total = manifest.paragraphs.len();
        let pending: Vec<usize> = (0..total)
            .filter(|&i| {
                let unit = &manifest.paragraphs[i];
                if is_rendered(output_dir, &unit.audio_file_name) {
                    info!(id = %unit.id, file = %unit.audio_file_name, "already rendered, skipping");
                    false
                } else {
                    true
                }
            })
            .collect();

        info!(total, pending = pending.len(), "starting synthesis");
        let bar = ProgressBar::new(pending.len() as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>7}/{len:7} {msg}")?
                .progress_chars("█▉▊▋▌▍▎▏  "),
        );

        let started = Instant::now();
        let mut rendered_this_run = 0usize;

        for batch in pending.chunks(self.config.batch_size.max(1)) {
            let mut pool = JoinSet::new();
            for (position, &index) in batch.iter().enumerate() {
                let unit = &manifest.paragraphs[index];
                let text = unit.synthesis_text.clone();
                let destination = destination_for(output_dir, &unit.audio_file_name);
                let delay = Duration::from_millis(self.config.stagger_ms * position as u64);
                let synthesizer = Arc::clone(&self.synthesizer);
                pool.spawn(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let duration_ms = synthesizer.synthesize(&text, &destination).await;
                    (index, duration_ms)
                });
            }

            while let Some(joined) = pool.join_next().await {
                match joined {
                    Ok((index, duration_ms)) => {
                        manifest.paragraphs[index].duration_ms = duration_ms;
                        bar.inc(1);
                    }
                    Err(err) => error!(error = %err, "synthesis task panicked"),
                }
            }
            rendered_this_run += batch.len();

            manifest
                .save(manifest_path)
                .with_context(|| format!("failed to persist manifest to {}", manifest_path.display()))?;
            self.report_progress(total, pending.len(), rendered_this_run, started.elapsed());
        }
        bar.finish_and_clear();

        finalize_durations(manifest, output_dir, &self.config);
        manifest
            .save(manifest_path)
            .with_context(|| format!("failed to persist manifest to {}", manifest_path.display()))?;
        Ok(())
    }

    /// Observability only: never feeds back into scheduling.
    fn report_progress(&self, total: usize, pending: usize, done: usize, elapsed: Duration) {
        let completed = total - pending + done;
        let percent = if total > 0 { completed * 100 / total } else { 100 };
        let eta = if done > 0 {
            elapsed.mul_f64((pending - done) as f64 / done as f64)
        } else {
            Duration::ZERO
        };
        info!(
            completed,
            total,
            percent,
            elapsed_secs = elapsed.as_secs(),
            eta_secs = eta.as_secs(),
            "batch complete"
        );
    }
}

/// A unit whose audio artifact exists with nonzero size is rendered and
/// must not be re-synthesized.
fn is_rendered(output_dir: &Path, audio_file_name: &str) -> bool {
    let path = output_dir.join(audio_file_name);
    path.metadata().map(|m| m.len() > 0).unwrap_or(false)
}

/// Final duration pass: recompute per-unit and cumulative durations from
/// the audio artifacts, promoting units to chapter starts where the
/// configured heuristics say the markup under-marked boundaries.
pub fn finalize_durations(manifest: &mut Manifest, output_dir: &Path, config: &Config) {
    let budget_ms = config.chapter_minutes.saturating_mul(60_000);
    let mut cumulative = 0u64;
    let mut since_chapter_start = 0u64;
    let mut previous_was_chapter = false;

    for index in 0..manifest.paragraphs.len() {
        let unit = &manifest.paragraphs[index];
        let path = output_dir.join(&unit.audio_file_name);
        let duration_ms = if is_rendered(output_dir, &unit.audio_file_name) {
            match media::probe_duration_ms(&path) {
                Ok(ms) => ms,
                Err(err) => {
                    warn!(id = %unit.id, error = %err, "duration probe failed, keeping recorded value");
                    unit.duration_ms
                }
            }
        } else {
            // Not rendered: zero duration is valid, resumable state.
            unit.duration_ms
        };

        let unit = &mut manifest.paragraphs[index];
        if index > 0 && !unit.is_chapter_start {
            let over_budget = config.promote_long_chapters
                && budget_ms > 0
                && since_chapter_start > budget_ms;
            let marker = config.chapter_marker_promotion
                && !previous_was_chapter
                && crate::extract::text_marks_chapter(&unit.display_text);
            if over_budget || marker {
                info!(id = %unit.id, over_budget, marker, "promoting unit to chapter start");
                unit.is_chapter_start = true;
            }
        }

        if unit.is_chapter_start {
            since_chapter_start = 0;
        }
        since_chapter_start += duration_ms;
        cumulative += duration_ms;
        unit.duration_ms = duration_ms;
        unit.cumulative_duration_ms = cumulative;
        previous_was_chapter = unit.is_chapter_start;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Unit;
    use crate::synth::Synthesizer;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct MockSynthesizer {
        calls: Mutex<Vec<String>>,
        duration_ms: u64,
    }

    #[async_trait]
    impl Synthesizer for MockSynthesizer {
        async fn synthesize(&self, text: &str, destination: &Path) -> u64 {
            self.calls.lock().unwrap().push(text.to_string());
            std::fs::write(destination, b"mock audio").unwrap();
            self.duration_ms
        }
    }

    fn unit(n: usize, chapter: bool) -> Unit {
        Unit::new(
            format!("pgrf-{n:05}"),
            format!("text {n}"),
            format!("display {n}"),
            chapter,
        )
    }

    fn test_config() -> Arc<Config> {
        Arc::new(Config { batch_size: 2, stagger_ms: 0, ..Config::default() })
    }

    #[tokio::test]
    async fn rendered_units_are_not_resynthesized() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = Manifest::new(
            "book".to_string(),
            vec![unit(1, true), unit(2, false), unit(3, false)],
        );
        // Unit 2 is already on disk with nonzero size.
        std::fs::write(dir.path().join("pgrf-00002.mp3"), b"existing").unwrap();

        let mock = Arc::new(MockSynthesizer { calls: Mutex::new(Vec::new()), duration_ms: 1_000 });
        let scheduler = BatchScheduler::new(test_config(), Arc::clone(&mock) as Arc<dyn Synthesizer>);
        let manifest_path = dir.path().join("content.json");
        scheduler
            .run(&mut manifest, dir.path(), &manifest_path)
            .await
            .unwrap();

        let mut calls = mock.calls.lock().unwrap().clone();
        calls.sort();
        assert_eq!(calls, vec!["text 1", "text 3"]);
        assert!(manifest_path.exists());
    }

    #[tokio::test]
    async fn zero_size_artifacts_count_as_pending() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = Manifest::new("book".to_string(), vec![unit(1, true)]);
        std::fs::write(dir.path().join("pgrf-00001-display-1.mp3"), b"").unwrap();

        let mock = Arc::new(MockSynthesizer { calls: Mutex::new(Vec::new()), duration_ms: 500 });
        let scheduler = BatchScheduler::new(test_config(), Arc::clone(&mock) as Arc<dyn Synthesizer>);
        scheduler
            .run(&mut manifest, dir.path(), &dir.path().join("content.json"))
            .await
            .unwrap();
        assert_eq!(mock.calls.lock().unwrap().len(), 1);
    }

    /// Writes a silent WAV of the requested duration so the duration pass
    /// probes real values instead of falling back to recorded ones.
    struct WavSynthesizer {
        duration_ms: u64,
    }

    #[async_trait]
    impl Synthesizer for WavSynthesizer {
        async fn synthesize(&self, _text: &str, destination: &Path) -> u64 {
            write_silent_wav(destination, self.duration_ms);
            self.duration_ms
        }
    }

    fn write_silent_wav(path: &Path, duration_ms: u64) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for _ in 0..(8 * duration_ms) {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[tokio::test]
    async fn resumed_run_reproduces_the_cumulative_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let units = || vec![unit(1, true), unit(2, false), unit(3, false)];
        let manifest_path = dir.path().join("content.json");
        let scheduler = BatchScheduler::new(
            test_config(),
            Arc::new(WavSynthesizer { duration_ms: 1_000 }),
        );

        let mut fresh = Manifest::new("book".to_string(), units());
        scheduler.run(&mut fresh, dir.path(), &manifest_path).await.unwrap();

        // Second run over the same output directory starts from a blank
        // manifest, skips every rendered unit, and recovers durations by
        // probing the artifacts.
        let mut resumed = Manifest::new("book".to_string(), units());
        scheduler.run(&mut resumed, dir.path(), &manifest_path).await.unwrap();

        let cumulative = |m: &Manifest| {
            m.paragraphs.iter().map(|u| u.cumulative_duration_ms).collect::<Vec<_>>()
        };
        assert_eq!(cumulative(&fresh), cumulative(&resumed));
        assert!(cumulative(&resumed).iter().all(|&ms| ms > 0));
    }

    struct FailingSynthesizer;

    #[async_trait]
    impl Synthesizer for FailingSynthesizer {
        async fn synthesize(&self, _text: &str, _destination: &Path) -> u64 {
            0 // every attempt exhausted, nothing written
        }
    }

    #[tokio::test]
    async fn exhausted_units_leave_a_consistent_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = Manifest::new(
            "book".to_string(),
            vec![unit(1, true), unit(2, false)],
        );
        let scheduler = BatchScheduler::new(test_config(), Arc::new(FailingSynthesizer));
        let manifest_path = dir.path().join("content.json");
        scheduler
            .run(&mut manifest, dir.path(), &manifest_path)
            .await
            .unwrap();

        assert!(manifest_path.exists());
        assert!(manifest.paragraphs.iter().all(|u| u.duration_ms == 0));
        assert!(!dir.path().join(&manifest.paragraphs[1].audio_file_name).exists());
        // Still parseable, resumable state.
        let raw = std::fs::read_to_string(&manifest_path).unwrap();
        let back: Manifest = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.paragraphs.len(), 2);
    }

    #[test]
    fn cumulative_durations_are_non_decreasing_and_complete() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = Manifest::new(
            "book".to_string(),
            vec![unit(1, true), unit(2, false), unit(3, false)],
        );
        manifest.paragraphs[0].duration_ms = 1_000;
        manifest.paragraphs[1].duration_ms = 0; // unrendered unit stays valid
        manifest.paragraphs[2].duration_ms = 2_500;
        let config = Config { promote_long_chapters: false, ..Config::default() };
        finalize_durations(&mut manifest, dir.path(), &config);

        let cumulative: Vec<u64> = manifest
            .paragraphs
            .iter()
            .map(|u| u.cumulative_duration_ms)
            .collect();
        assert_eq!(cumulative, vec![1_000, 1_000, 3_500]);
        assert!(cumulative.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn long_chapters_are_promoted_at_the_budget() {
        let dir = tempfile::tempdir().unwrap();
        let mut units: Vec<Unit> = vec![unit(1, true), unit(2, false), unit(3, false)];
        for u in &mut units {
            u.duration_ms = 8 * 60_000;
        }
        let mut manifest = Manifest::new("book".to_string(), units);
        let config = Config { chapter_minutes: 15, ..Config::default() };
        finalize_durations(&mut manifest, dir.path(), &config);

        // 8 + 8 minutes exceeds the 15-minute budget at unit 3.
        assert!(!manifest.paragraphs[1].is_chapter_start);
        assert!(manifest.paragraphs[2].is_chapter_start);
    }

    #[test]
    fn chapter_marker_text_is_promoted_unless_adjacent_to_a_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut units = vec![unit(1, true), unit(2, false), unit(3, false)];
        units[1].display_text = "Chapter 2".to_string(); // right after a start
        units[2].display_text = "Chapter 3".to_string();
        let mut manifest = Manifest::new("book".to_string(), units);
        let config = Config { promote_long_chapters: false, ..Config::default() };
        finalize_durations(&mut manifest, dir.path(), &config);

        assert!(!manifest.paragraphs[1].is_chapter_start);
        assert!(manifest.paragraphs[2].is_chapter_start);
    }

    #[test]
    fn promotions_can_be_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut units = vec![unit(1, true), unit(2, false), unit(3, false)];
        units[2].display_text = "Chapter 3".to_string();
        for u in &mut units {
            u.duration_ms = 20 * 60_000;
        }
        let mut manifest = Manifest::new("book".to_string(), units);
        let config = Config {
            promote_long_chapters: false,
            chapter_marker_promotion: false,
            ..Config::default()
        };
        finalize_durations(&mut manifest, dir.path(), &config);
        assert!(!manifest.paragraphs[1].is_chapter_start);
        assert!(!manifest.paragraphs[2].is_chapter_start);
    }
}
