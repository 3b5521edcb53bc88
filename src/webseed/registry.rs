use std::collections::HashSet;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::peer::PeerRequest;

/// Partial block kept from a dropped web seed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartState {
    pub request: PeerRequest,
    pub data: Bytes,
}

/// Everything the torrent remembers about one web seed.
#[derive(Debug, Clone)]
pub struct WebSeedEntry {
    pub url: String,
    /// Extra headers sent with every request to this seed.
    pub extra_headers: Vec<(String, String)>,
    /// Do not connect before this instant.
    pub retry_at: Option<Instant>,
    /// Block left half-received by the previous connection.
    pub restart: Option<RestartState>,
    /// Pieces the server turned out not to have.
    pub unavailable: HashSet<u32>,
    /// Label built from the `Server` response header.
    pub server: Option<String>,
}

impl WebSeedEntry {
    fn new(url: String, extra_headers: Vec<(String, String)>) -> Self {
        Self {
            url,
            extra_headers,
            retry_at: None,
            restart: None,
            unavailable: HashSet::new(),
            server: None,
        }
    }
}

/// The web seeds of a torrent.
///
/// Entries outlive connections: restart state, cooldowns and per-piece
/// availability are kept here rather than on the connection.
#[derive(Debug, Default)]
pub struct WebSeedList {
    seeds: Mutex<Vec<WebSeedEntry>>,
}

impl WebSeedList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a seed. Returns `false` if the URL is already known.
    pub fn add(&self, url: impl Into<String>, extra_headers: Vec<(String, String)>) -> bool {
        let url = url.into();
        let mut seeds = self.seeds.lock();
        if seeds.iter().any(|s| s.url == url) {
            return false;
        }
        debug!(%url, "web seed added");
        seeds.push(WebSeedEntry::new(url, extra_headers));
        true
    }

    pub fn remove(&self, url: &str) -> bool {
        let mut seeds = self.seeds.lock();
        let before = seeds.len();
        seeds.retain(|s| s.url != url);
        let removed = seeds.len() != before;
        if removed {
            warn!(%url, "web seed removed");
        }
        removed
    }

    pub fn contains(&self, url: &str) -> bool {
        self.seeds.lock().iter().any(|s| s.url == url)
    }

    pub fn get(&self, url: &str) -> Option<WebSeedEntry> {
        self.seeds.lock().iter().find(|s| s.url == url).cloned()
    }

    pub fn urls(&self) -> Vec<String> {
        self.seeds.lock().iter().map(|s| s.url.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.seeds.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.lock().is_empty()
    }

    fn with_entry<R>(&self, url: &str, f: impl FnOnce(&mut WebSeedEntry) -> R) -> Option<R> {
        self.seeds.lock().iter_mut().find(|s| s.url == url).map(f)
    }

    /// Puts the seed on cooldown for `after`.
    pub fn retry(&self, url: &str, after: Duration) {
        warn!(%url, secs = after.as_secs(), "web seed retry later");
        self.with_entry(url, |s| s.retry_at = Some(Instant::now() + after));
    }

    /// Whether the seed exists and is not cooling down.
    pub fn is_ready(&self, url: &str, now: Instant) -> bool {
        self.with_entry(url, |s| s.retry_at.is_none_or(|at| now >= at))
            .unwrap_or(false)
    }

    /// Seeds that may be connected to now.
    pub fn ready(&self, now: Instant) -> Vec<String> {
        self.seeds
            .lock()
            .iter()
            .filter(|s| s.retry_at.is_none_or(|at| now >= at))
            .map(|s| s.url.clone())
            .collect()
    }

    pub fn save_restart(&self, url: &str, state: RestartState) {
        debug!(%url, request = %state.request, bytes = state.data.len(), "saving restart state");
        self.with_entry(url, |s| s.restart = Some(state));
    }

    /// Removes and returns the saved restart state.
    pub fn take_restart(&self, url: &str) -> Option<RestartState> {
        self.with_entry(url, |s| s.restart.take()).flatten()
    }

    pub fn mark_unavailable(&self, url: &str, pieces: impl IntoIterator<Item = u32>) {
        self.with_entry(url, |s| s.unavailable.extend(pieces));
    }

    pub fn unavailable(&self, url: &str) -> HashSet<u32> {
        self.with_entry(url, |s| s.unavailable.clone())
            .unwrap_or_default()
    }

    pub fn set_server(&self, url: &str, server: String) {
        self.with_entry(url, |s| s.server = Some(server));
    }

    pub fn server(&self, url: &str) -> Option<String> {
        self.with_entry(url, |s| s.server.clone()).flatten()
    }

    pub fn extra_headers(&self, url: &str) -> Vec<(String, String)> {
        self.with_entry(url, |s| s.extra_headers.clone())
            .unwrap_or_default()
    }
}
