//! Session: one identity, one relay set, one owned pool.

use nostr_sdk::{Keys, PublicKey};
use tokio::sync::watch;
use tracing::info;

use crate::aggregator::ConversationAggregator;
use crate::codec::parse_public_key;
use crate::conversation::Conversation;
use crate::error::{Error, Result};
use crate::event::LocalSigner;
use crate::pool::{PoolConfig, PublishOutput, RelayPool};
use crate::profile::{fetch_profile, publish_profile, Profile};
use crate::storage::{resolve_relay_urls, KeyStore, RelayConfigSource};
use crate::thread::{encrypt_direct_message, MessageThread};

pub struct Session {
    keys: Keys,
    relays: Vec<String>,
    pool: RelayPool,
    aggregator: ConversationAggregator,
}

impl Session {
    /// Open `relays` and start aggregating conversations for `keys`.
    pub fn start(keys: Keys, relays: Vec<String>, config: PoolConfig) -> Self {
        let pool = RelayPool::new(config);
        let relays = pool.open(&relays);
        let aggregator = ConversationAggregator::spawn(pool.clone(), relays.clone(), keys.clone());
        info!("session for {} on {} relay(s)", keys.public_key(), relays.len());
        Self {
            keys,
            relays,
            pool,
            aggregator,
        }
    }

    /// Start from the stored key and configured relays.
    pub fn from_stores(
        key_store: &dyn KeyStore,
        relay_source: &dyn RelayConfigSource,
        config: PoolConfig,
    ) -> Result<Self> {
        let keys = key_store
            .load_private_key()?
            .ok_or_else(|| Error::KeyStore("no key stored".to_string()))?;
        Ok(Self::start(keys, resolve_relay_urls(relay_source), config))
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    pub fn relays(&self) -> &[String] {
        &self.relays
    }

    pub fn pool(&self) -> &RelayPool {
        &self.pool
    }

    /// Signing capability for collaborators such as media upload.
    pub fn signer(&self) -> LocalSigner {
        LocalSigner::new(self.keys.clone())
    }

    /// Push-updated conversation list, newest first.
    pub fn conversations(&self) -> watch::Receiver<Vec<Conversation>> {
        self.aggregator.subscribe()
    }

    pub fn open_thread(&self, counterparty: PublicKey) -> MessageThread {
        MessageThread::open(self.pool.clone(), self.relays.clone(), self.keys.clone(), counterparty)
    }

    /// Send without an open thread. Threads should use [`MessageThread::send`]
    /// so the message shows up immediately.
    pub async fn send_message(&self, counterparty: &PublicKey, plaintext: &str) -> Result<PublishOutput> {
        let event = encrypt_direct_message(&self.keys, counterparty, plaintext)?;
        self.pool.publish(&self.relays, &event).await
    }

    /// Decode a user-typed identifier and add it to the conversation list.
    pub async fn start_conversation(&self, identifier: &str) -> Result<Conversation> {
        let counterparty = parse_public_key(identifier)?;
        if counterparty == self.keys.public_key() {
            return Err(Error::invalid_identifier(identifier, "that is your own key"));
        }
        self.aggregator.start(counterparty).await
    }

    pub async fn profile(&self, author: &PublicKey) -> Result<Option<Profile>> {
        fetch_profile(&self.pool, &self.relays, author).await
    }

    pub async fn publish_profile(&self, profile: &Profile) -> Result<PublishOutput> {
        publish_profile(&self.pool, &self.relays, &self.signer(), profile).await
    }

    pub async fn shutdown(self) {
        self.aggregator.shutdown().await;
        self.pool.shutdown();
        info!("session closed");
    }
}
