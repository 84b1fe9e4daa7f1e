//! Synthesis worker: one unit of text in, one padded audio file out.
//!
//! Has no awareness of chapters or manifests. Transient failures are
//! retried with capped exponential backoff; an exhausted retry budget or a
//! post-processing failure degrades to a zero duration, which the caller
//! treats as "unit not rendered" rather than an error to propagate.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde_json::{json, Map, Value};
use tracing::{debug, error, warn};

use crate::config::{BackendConfig, Config, RequestStyle};
use crate::endpoint::EndpointPool;
use crate::error::TtsError;
use crate::media;

/// Text-in, file-out, duration-out. Zero duration means not rendered.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, destination: &Path) -> u64;
}

pub struct HttpSynthesizer {
    client: Client,
    backend: BackendConfig,
    pool: Arc<EndpointPool>,
    max_retries: u32,
}

#[derive(Debug)]
enum RetryState {
    Attempting(u32),
    Backoff { attempt: u32, delay: Duration },
    Succeeded(u64),
    Exhausted,
}

impl HttpSynthesizer {
    pub fn new(config: &Config, pool: Arc<EndpointPool>) -> Result<Self, TtsError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            backend: config.active_backend().clone(),
            pool,
            max_retries: config.max_retries,
        })
    }

    fn build_params(&self, text: &str) -> Map<String, Value> {
        let mut params = self.backend.params.clone();
        let short = is_short_utterance(text);
        let text = prepare_text(text, short, self.backend.prosody_template.as_deref());
        if short {
            // Very short inputs clip at higher speeds.
            params.insert("speed".to_string(), json!(1.0));
        }
        // Backends disagree on the field name; send both.
        params.insert("input".to_string(), json!(text));
        params.insert("text".to_string(), json!(text));
        params
    }

    async fn request_once(&self, params: &Map<String, Value>, destination: &Path) -> Result<u64, TtsError> {
        let url = self.pool.select();
        debug!(
            %url,
            voice = params.get("voice").and_then(serde_json::Value::as_str).unwrap_or(""),
            "sending synthesis request"
        );
        let request = match self.backend.request_style {
            RequestStyle::JsonPost => self.client.post(url.as_str()).json(params),
            RequestStyle::QueryGet => self.client.get(url.as_str()).query(&query_pairs(params)),
        };
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(TtsError::Status(response.status()));
        }
        let bytes = response.bytes().await?;
        debug!(len = bytes.len(), "received audio bytes");

        let destination = destination.to_path_buf();
        let duration = tokio::task::spawn_blocking(move || media::write_padded(&bytes, &destination))
            .await
            .map_err(|e| TtsError::Postprocess(crate::error::MediaError::Task(e.to_string())))??;
        Ok(duration)
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str, destination: &Path) -> u64 {
        let params = self.build_params(text);
        let mut state = RetryState::Attempting(1);
        loop {
            state = match state {
                RetryState::Attempting(attempt) => {
                    match self.request_once(&params, destination).await {
                        Ok(duration) => RetryState::Succeeded(duration),
                        Err(err) if err.is_retryable() && attempt < self.max_retries => {
                            let delay = backoff_delay(attempt);
                            warn!(
                                attempt,
                                max_retries = self.max_retries,
                                wait_secs = delay.as_secs(),
                                error = %err,
                                "synthesis attempt failed, backing off"
                            );
                            RetryState::Backoff { attempt, delay }
                        }
                        Err(err) => {
                            error!(attempt, error = %err, "synthesis failed");
                            RetryState::Exhausted
                        }
                    }
                }
                RetryState::Backoff { attempt, delay } => {
                    tokio::time::sleep(delay).await;
                    RetryState::Attempting(attempt + 1)
                }
                RetryState::Succeeded(duration) => return duration,
                RetryState::Exhausted => {
                    warn!(destination = %destination.display(), "giving up on unit");
                    return 0;
                }
            };
        }
    }
}

/// `5 * 2^(attempt-1)` seconds.
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(5 * 2u64.pow(attempt.saturating_sub(1)))
}

fn query_pairs(params: &Map<String, Value>) -> Vec<(String, String)> {
    params
        .iter()
        .map(|(k, v)| {
            let value = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), value)
        })
        .collect()
}

static ALL_CAPS_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b[A-Z]{2,}\b").unwrap());

/// ALL-CAPS words read as spelled-out acronyms on most engines; speak them
/// as capitalized words instead.
fn sentence_case_all_caps(text: &str) -> String {
    ALL_CAPS_WORD
        .replace_all(text, |caps: &regex::Captures| {
            let word = &caps[0];
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_string() + chars.as_str().to_lowercase().as_str(),
                None => String::new(),
            }
        })
        .to_string()
}

fn is_short_utterance(text: &str) -> bool {
    text.split_whitespace().count() < 5 && !text.trim_end().ends_with("...")
}

fn prepare_text(text: &str, short: bool, prosody_template: Option<&str>) -> String {
    let mut text = sentence_case_all_caps(text);
    if short {
        text.push_str("...");
    }
    match prosody_template {
        Some(template) => template.replace("{text}", &text),
        None => text,
    }
}

/// Resolve the per-unit destination inside the book's output directory.
pub fn destination_for(output_dir: &Path, audio_file_name: &str) -> PathBuf {
    output_dir.join(audio_file_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_caps_words_become_capitalized() {
        assert_eq!(
            sentence_case_all_caps("NASA launched. I saw THE END."),
            "Nasa launched. I saw The End."
        );
        // Single capitals such as "I" are untouched.
        assert_eq!(sentence_case_all_caps("I am A."), "I am A.");
    }

    #[test]
    fn short_utterances_get_a_trailing_ellipsis() {
        assert_eq!(prepare_text("The end", true, None), "The end...");
        assert!(!is_short_utterance("this sentence has five words"));
        assert!(!is_short_utterance("already trails..."));
        assert!(is_short_utterance("too short"));
    }

    #[test]
    fn prosody_template_wraps_the_text() {
        assert_eq!(
            prepare_text("hello", false, Some("<prosody rate=\"95%\">{text}</prosody>")),
            "<prosody rate=\"95%\">hello</prosody>"
        );
    }

    #[test]
    fn backoff_doubles_from_five_seconds() {
        assert_eq!(backoff_delay(1), Duration::from_secs(5));
        assert_eq!(backoff_delay(2), Duration::from_secs(10));
        assert_eq!(backoff_delay(3), Duration::from_secs(20));
        assert_eq!(backoff_delay(4), Duration::from_secs(40));
    }

    #[test]
    fn query_pairs_stringify_non_string_values() {
        let mut params = Map::new();
        params.insert("voice".to_string(), json!("af_heart"));
        params.insert("speed".to_string(), json!(1.1));
        let pairs = query_pairs(&params);
        assert!(pairs.contains(&("voice".to_string(), "af_heart".to_string())));
        assert!(pairs.contains(&("speed".to_string(), "1.1".to_string())));
    }
}
