//! Audio post-processing: duration probing, silence padding, and the
//! external concatenation tool.
//!
//! The pipeline never decodes audio beyond what duration accounting needs;
//! transcoding, padding and concatenation are delegated to ffmpeg behind
//! narrow interfaces, with a non-zero exit reported as an error the caller
//! can choose to skip past.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::debug;

use crate::error::MediaError;

/// Silence appended after a clip, sized by the clip's raw duration so the
/// pause feels proportional to the just-spoken passage. The boundary is
/// inclusive on the upper bucket: exactly 5s gets 300ms.
pub fn silence_pad_ms(raw_ms: u64) -> u64 {
    if raw_ms < 5_000 {
        200
    } else if raw_ms < 10_000 {
        300
    } else if raw_ms < 15_000 {
        500
    } else {
        700
    }
}

/// Measure a clip's duration by summing packet durations in the default
/// track. Works on whatever container/codec symphonia can probe.
pub fn probe_duration_ms(path: &Path) -> Result<u64, MediaError> {
    let file = File::open(path)?;
    let source = MediaSourceStream::new(Box::new(file), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }
    let probed = symphonia::default::get_probe().format(
        &hint,
        source,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let mut format = probed.format;
    let track = format.default_track().ok_or(MediaError::NoTrack)?;
    let track_id = track.id;
    let time_base = track.codec_params.time_base.ok_or(MediaError::NoTrack)?;

    let mut frames = 0u64;
    loop {
        match format.next_packet() {
            Ok(packet) if packet.track_id() == track_id => frames += packet.dur(),
            Ok(_) => {}
            // End of stream surfaces as an IO error; either way the packets
            // seen so far are the measurable duration.
            Err(_) => break,
        }
    }
    let time = time_base.calc_time(frames);
    Ok(time.seconds * 1_000 + (time.frac * 1_000.0) as u64)
}

/// Write the backend's audio bytes to `destination` with calibrated
/// trailing silence, transcoding to the target codec on the way. Returns
/// the final, post-silence duration in milliseconds.
///
/// Any failure removes `destination`: ffmpeg creates its output before
/// muxing and leaves the partial file behind on error, and a leftover
/// nonzero clip would count as rendered on the next run.
pub fn write_padded(bytes: &[u8], destination: &Path) -> Result<u64, MediaError> {
    match transcode_padded(bytes, destination) {
        Ok(duration) => Ok(duration),
        Err(err) => {
            let _ = fs::remove_file(destination);
            Err(err)
        }
    }
}

fn transcode_padded(bytes: &[u8], destination: &Path) -> Result<u64, MediaError> {
    let mut raw = tempfile::Builder::new().suffix(".bin").tempfile()?;
    raw.write_all(bytes)?;
    raw.flush()?;

    let raw_ms = probe_duration_ms(raw.path())?;
    let pad_ms = silence_pad_ms(raw_ms);
    debug!(raw_ms, pad_ms, "padding clip");

    let status = Command::new("ffmpeg")
        .arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-y")
        .arg("-i")
        .arg(raw.path())
        .arg("-af")
        .arg(format!("apad=pad_dur={}", pad_ms as f64 / 1_000.0))
        .arg("-codec:a")
        .arg("libmp3lame")
        .arg("-q:a")
        .arg("4")
        .arg(destination)
        .stdin(Stdio::null())
        .status()?;
    if !status.success() {
        return Err(MediaError::Tool { tool: "ffmpeg", status });
    }

    probe_duration_ms(destination)
}

/// Concatenation of ordered audio files into one output. The core only
/// depends on this contract, not on any tool's command-line syntax.
pub trait AudioJoiner {
    fn concatenate(&self, inputs: &[PathBuf], output: &Path) -> Result<(), MediaError>;
}

/// ffmpeg concat demuxer driven by an ordered list file; streams are
/// copied, not re-encoded.
pub struct FfmpegJoiner;

impl AudioJoiner for FfmpegJoiner {
    fn concatenate(&self, inputs: &[PathBuf], output: &Path) -> Result<(), MediaError> {
        let mut list = tempfile::Builder::new().suffix(".txt").tempfile()?;
        for input in inputs {
            // Single quotes in our generated names are impossible, but a
            // book directory could carry one.
            let path = input.to_string_lossy().replace('\'', r"'\''");
            writeln!(list, "file '{path}'")?;
        }
        list.flush()?;

        let status = Command::new("ffmpeg")
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-y")
            .arg("-f")
            .arg("concat")
            .arg("-safe")
            .arg("0")
            .arg("-i")
            .arg(list.path())
            .arg("-c")
            .arg("copy")
            .arg(output)
            .stdin(Stdio::null())
            .status()?;
        if !status.success() {
            return Err(MediaError::Tool { tool: "ffmpeg", status });
        }
        Ok(())
    }
}
