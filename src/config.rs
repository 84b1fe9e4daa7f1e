//! Configuration surface.
//!
//! Loaded once from a JSON file at startup and treated as immutable for the
//! rest of the run. Every field has a default so a minimal config file only
//! needs to override what differs from the local Kokoro setup.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory scanned for `.epub` files; output lands in per-book
    /// subdirectories next to them.
    pub books_dir: PathBuf,
    /// Primary TTS backend.
    pub api: BackendConfig,
    /// Alternate TTS backend, selected with `use_alt_service`.
    pub alt_api: BackendConfig,
    pub use_alt_service: bool,
    pub max_retries: u32,
    pub request_timeout_secs: u64,
    /// Units synthesized concurrently per batch.
    pub batch_size: usize,
    /// Per-worker start delay within a batch, multiplied by the worker's
    /// position.
    pub stagger_ms: u64,
    /// Chapter duration budget used by the promotion pass.
    pub chapter_minutes: u64,
    pub promote_long_chapters: bool,
    pub chapter_marker_promotion: bool,
    /// Accept any paragraph with two consecutive letters as a chapter
    /// heading when the stricter heuristics find nothing. Off by default:
    /// it matches nearly every paragraph.
    pub broad_heading_fallback: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            books_dir: PathBuf::from("books"),
            api: BackendConfig::default(),
            alt_api: BackendConfig {
                host: "http://localhost:8020".to_string(),
                speech_path: "/tts_to_audio/".to_string(),
                params: Map::new(),
                ..BackendConfig::default()
            },
            use_alt_service: false,
            max_retries: 5,
            request_timeout_secs: 300,
            batch_size: 4,
            stagger_ms: 250,
            chapter_minutes: 15,
            promote_long_chapters: true,
            chapter_marker_promotion: true,
            broad_heading_fallback: false,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::Missing(path.to_path_buf()));
        }
        let raw = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Backend the current run should talk to.
    pub fn active_backend(&self) -> &BackendConfig {
        if self.use_alt_service {
            &self.alt_api
        } else {
            &self.api
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Default host, used when the round-robin pool is empty.
    pub host: String,
    /// Interchangeable hosts rotated across by the endpoint selector.
    pub host_round_robin: Vec<String>,
    /// Path appended to the selected host.
    pub speech_path: String,
    pub request_style: RequestStyle,
    /// Synthesis parameters sent verbatim alongside the input text.
    pub params: Map<String, Value>,
    /// Optional wrapper applied to the text before sending; `{text}` marks
    /// the insertion point.
    pub prosody_template: Option<String>,
    /// Ordered literal substring replacements applied in synthesis mode.
    pub replacements: Vec<(String, String)>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        let mut params = Map::new();
        params.insert("model".to_string(), json!("kokoro"));
        params.insert("voice".to_string(), json!("af_heart"));
        params.insert("response_format".to_string(), json!("mp3"));
        params.insert("speed".to_string(), json!(1.0));
        Self {
            host: "http://localhost:8880".to_string(),
            host_round_robin: Vec::new(),
            speech_path: "/v1/audio/speech".to_string(),
            request_style: RequestStyle::JsonPost,
            params,
            prosody_template: None,
            replacements: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestStyle {
    /// HTTP POST with a JSON body of synthesis parameters.
    JsonPost,
    /// HTTP GET with the same parameters URL-encoded.
    QueryGet,
}
