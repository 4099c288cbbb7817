//! Collaborator seams: where keys and relay URLs come from.

use nostr_sdk::Keys;
use parking_lot::Mutex;

use crate::error::Result;
use crate::pool::normalize_relay_url;

/// Used when no relay is configured.
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nostr-pub.wellorder.net",
    "wss://relay.nostr.band",
    "wss://relay.snort.social",
];

pub fn default_relays() -> Vec<String> {
    DEFAULT_RELAYS.iter().map(|s| s.to_string()).collect()
}

/// Persistence for the local key pair. The medium and any encryption at
/// rest belong to the implementation.
pub trait KeyStore: Send + Sync {
    fn load_private_key(&self) -> Result<Option<Keys>>;
    fn save_private_key(&self, keys: &Keys) -> Result<()>;
    fn clear_private_key(&self) -> Result<()>;
}

/// Keeps the key in process memory only.
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: Mutex<Option<Keys>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keys(keys: Keys) -> Self {
        Self {
            keys: Mutex::new(Some(keys)),
        }
    }
}

impl KeyStore for MemoryKeyStore {
    fn load_private_key(&self) -> Result<Option<Keys>> {
        Ok(self.keys.lock().clone())
    }

    fn save_private_key(&self, keys: &Keys) -> Result<()> {
        *self.keys.lock() = Some(keys.clone());
        Ok(())
    }

    fn clear_private_key(&self) -> Result<()> {
        *self.keys.lock() = None;
        Ok(())
    }
}

pub trait RelayConfigSource {
    /// Configured relay URLs, possibly empty.
    fn load_relay_urls(&self) -> Vec<String>;
}

impl RelayConfigSource for Vec<String> {
    fn load_relay_urls(&self) -> Vec<String> {
        self.clone()
    }
}

/// Valid, de-duplicated relay URLs from `source`, or [`DEFAULT_RELAYS`]
/// when none remain.
pub fn resolve_relay_urls(source: &dyn RelayConfigSource) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for raw in source.load_relay_urls() {
        match normalize_relay_url(&raw) {
            Ok(url) if !urls.contains(&url) => urls.push(url),
            Ok(_) => {}
            Err(e) => tracing::warn!("ignoring configured relay: {e}"),
        }
    }
    if urls.is_empty() {
        default_relays()
    } else {
        urls
    }
}
