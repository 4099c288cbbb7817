//! Per-conversation message thread.
//!
//! A [`MessageThread`] follows direct messages in both directions between us
//! and one counterparty, decrypts them and keeps them ordered by
//! `(created_at, id)`. Older history is pulled on demand with
//! [`MessageThread::load_older`]; a backfill that yields nothing new ends
//! history for the thread.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nostr_sdk::{Event, EventId, Keys, PublicKey};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::codec::{decrypt, encrypt, short_hex};
use crate::error::{Error, Result};
use crate::event::{build_event, direct_message_draft};
use crate::filter::thread_filters;
use crate::pool::{PublishOutput, RelayPool, SubscriptionItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecryptedMessage {
    pub id: EventId,
    pub counterparty: PublicKey,
    pub sender: PublicKey,
    pub created_at: u64,
    pub plaintext: String,
    pub direction: Direction,
}

impl DecryptedMessage {
    /// Decrypt a direct message exchanged between `keys` and `counterparty`.
    pub fn from_event(event: &Event, keys: &Keys, counterparty: &PublicKey) -> Result<Self> {
        let own = keys.public_key();
        let direction = if event.pubkey == own {
            Direction::Sent
        } else if event.pubkey == *counterparty {
            Direction::Received
        } else {
            return Err(Error::Validation(format!(
                "event {} is not part of this conversation",
                event.id
            )));
        };
        let plaintext = decrypt(keys.secret_key(), counterparty, &event.content)?;
        Ok(Self {
            id: event.id,
            counterparty: *counterparty,
            sender: event.pubkey,
            created_at: event.created_at.as_u64(),
            plaintext,
            direction,
        })
    }

    fn sort_key(&self) -> (u64, EventId) {
        (self.created_at, self.id)
    }
}

/// Ordered, id-unique message list.
#[derive(Debug, Default)]
pub struct ThreadState {
    messages: Vec<DecryptedMessage>,
    ids: HashSet<EventId>,
    history_exhausted: bool,
    replay_complete: bool,
}

impl ThreadState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert in `(created_at, id)` order. `false` if the id is already here.
    pub fn insert(&mut self, message: DecryptedMessage) -> bool {
        if !self.ids.insert(message.id) {
            return false;
        }
        let key = message.sort_key();
        let at = self.messages.partition_point(|m| m.sort_key() < key);
        self.messages.insert(at, message);
        true
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.ids.contains(id)
    }

    pub fn messages(&self) -> &[DecryptedMessage] {
        &self.messages
    }

    pub fn oldest(&self) -> Option<u64> {
        self.messages.first().map(|m| m.created_at)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn history_exhausted(&self) -> bool {
        self.history_exhausted
    }

    pub fn mark_history_exhausted(&mut self) {
        self.history_exhausted = true;
    }
}

struct ThreadShared {
    state: Mutex<ThreadState>,
    updates: watch::Sender<Vec<DecryptedMessage>>,
    /// Written only while `state` is locked, so no insert lands after
    /// `close` returns.
    closed: AtomicBool,
}

impl ThreadShared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        let _state = self.state.lock();
        self.closed.store(true, Ordering::Release);
    }

    fn insert(&self, message: DecryptedMessage) -> bool {
        let mut state = self.state.lock();
        if self.is_closed() || !state.insert(message) {
            return false;
        }
        self.updates.send_replace(state.messages().to_vec());
        true
    }

    fn admit_event(&self, event: &Event, keys: &Keys, counterparty: &PublicKey) -> bool {
        if self.is_closed() || self.state.lock().contains(&event.id) {
            return false;
        }
        match DecryptedMessage::from_event(event, keys, counterparty) {
            Ok(message) => self.insert(message),
            Err(e) => {
                debug!("{}: {e}, skipped", event.id);
                false
            }
        }
    }
}

/// Encrypt `plaintext` for `counterparty` and sign the direct message.
pub fn encrypt_direct_message(keys: &Keys, counterparty: &PublicKey, plaintext: &str) -> Result<Event> {
    let ciphertext = encrypt(keys.secret_key(), counterparty, plaintext)?;
    build_event(keys, direct_message_draft(counterparty, ciphertext))
}

pub struct MessageThread {
    counterparty: PublicKey,
    keys: Keys,
    pool: RelayPool,
    relays: Vec<String>,
    shared: Arc<ThreadShared>,
    stop: Option<oneshot::Sender<()>>,
}

impl MessageThread {
    /// Subscribe to the conversation with `counterparty` and start following it.
    pub fn open(pool: RelayPool, relays: Vec<String>, keys: Keys, counterparty: PublicKey) -> Self {
        let (updates, _) = watch::channel(Vec::new());
        let shared = Arc::new(ThreadShared {
            state: Mutex::new(ThreadState::new()),
            updates,
            closed: AtomicBool::new(false),
        });

        let mut subscription = pool.subscribe(&relays, thread_filters(&keys.public_key(), &counterparty));
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let follower = shared.clone();
        let follower_keys = keys.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    item = subscription.recv() => match item {
                        Some(SubscriptionItem::Event(event)) => {
                            follower.admit_event(&event, &follower_keys, &counterparty);
                        }
                        Some(SubscriptionItem::EndOfStoredEvents) => {
                            if follower.is_closed() {
                                break;
                            }
                            let mut state = follower.state.lock();
                            state.replay_complete = true;
                            debug!("thread with {}: {} stored message(s)", short_hex(&counterparty), state.len());
                        }
                        None => break,
                    },
                }
            }
            subscription.close();
        });

        Self {
            counterparty,
            keys,
            pool,
            relays,
            shared,
            stop: Some(stop_tx),
        }
    }

    pub fn counterparty(&self) -> PublicKey {
        self.counterparty
    }

    /// Current ordered message list.
    pub fn messages(&self) -> Vec<DecryptedMessage> {
        self.shared.state.lock().messages().to_vec()
    }

    /// Receiver that sees the full ordered list after every change.
    pub fn updates(&self) -> watch::Receiver<Vec<DecryptedMessage>> {
        self.shared.updates.subscribe()
    }

    /// Whether the initial replay of stored messages has finished.
    pub fn replay_complete(&self) -> bool {
        self.shared.state.lock().replay_complete
    }

    pub fn history_exhausted(&self) -> bool {
        self.shared.state.lock().history_exhausted()
    }

    /// Backfill older messages. Returns how many new messages arrived; once a
    /// backfill brings nothing new, history is considered exhausted and
    /// further calls return `Ok(0)` without touching the relays.
    pub async fn load_older(&self) -> Result<usize> {
        let until = {
            let state = self.shared.state.lock();
            if state.history_exhausted() {
                return Ok(0);
            }
            state.oldest()
        };

        let filters = thread_filters(&self.keys.public_key(), &self.counterparty)
            .into_iter()
            .map(|f| match until {
                Some(until) => f.until(until),
                None => f,
            })
            .collect();
        let events = self.pool.fetch(&self.relays, filters).await;

        let added = events
            .iter()
            .filter(|event| self.shared.admit_event(event, &self.keys, &self.counterparty))
            .count();
        if added == 0 {
            info!("no older messages with {}", short_hex(&self.counterparty));
            self.shared.state.lock().mark_history_exhausted();
        }
        Ok(added)
    }

    /// Encrypt, sign and publish `plaintext`, then append it as sent.
    ///
    /// The message is appended even when no relay acknowledges it; the
    /// returned error reports the publish failure.
    pub async fn send(&self, plaintext: &str) -> Result<PublishOutput> {
        let event = encrypt_direct_message(&self.keys, &self.counterparty, plaintext)?;
        let result = self.pool.publish(&self.relays, &event).await;
        if let Err(e) = &result {
            warn!("message to {} not acknowledged: {e}", short_hex(&self.counterparty));
        }
        self.shared.insert(DecryptedMessage {
            id: event.id,
            counterparty: self.counterparty,
            sender: event.pubkey,
            created_at: event.created_at.as_u64(),
            plaintext: plaintext.to_string(),
            direction: Direction::Sent,
        });
        result
    }

    /// Stop following the conversation. Idempotent; once this returns the
    /// message list no longer changes.
    pub fn close(&mut self) {
        self.shared.close();
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for MessageThread {
    fn drop(&mut self) {
        self.close();
    }
}
