//! Round-robin selection over a pool of interchangeable TTS hosts.
//!
//! Synthesis workers call `select` concurrently, so the cursor
//! read-modify-write happens under a mutex: a lost update would make two
//! workers reuse or skip a host.

use std::sync::Mutex;

use crate::config::BackendConfig;

pub struct EndpointPool {
    hosts: Vec<String>,
    default_host: String,
    speech_path: String,
    cursor: Mutex<usize>,
}

impl EndpointPool {
    pub fn from_backend(backend: &BackendConfig) -> Self {
        Self {
            hosts: backend.host_round_robin.clone(),
            default_host: backend.host.clone(),
            speech_path: backend.speech_path.clone(),
            cursor: Mutex::new(0),
        }
    }

    /// Full URL for the next synthesis request. Pools of zero or one host
    /// always resolve to the default host.
    pub fn select(&self) -> String {
        if self.hosts.len() <= 1 {
            return format!("{}{}", self.default_host, self.speech_path);
        }
        let mut cursor = self.cursor.lock().unwrap();
        let host = self.hosts[*cursor].clone();
        *cursor = (*cursor + 1) % self.hosts.len();
        drop(cursor);
        format!("{host}{}", self.speech_path)
    }
}
