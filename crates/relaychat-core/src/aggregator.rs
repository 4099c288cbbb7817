//! Conversation aggregator task.
//!
//! Consumes the inbox subscription (every direct message to or from us),
//! keeps the [`ConversationIndex`] and publishes the ordered list through a
//! `watch` channel. Unknown counterparties get exactly one metadata lookup;
//! lookups run concurrently inside the same task, so the index is only ever
//! touched from one place.

use std::collections::HashMap;

use nostr_sdk::{Event, Keys, PublicKey};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::{StreamExt, StreamMap};
use tracing::{debug, info, warn};

use crate::codec::{decrypt, short_hex};
use crate::conversation::{Conversation, ConversationIndex, MessageOutcome};
use crate::error::{Error, Result};
use crate::event::counterparty;
use crate::filter::{inbox_filters, metadata_filter};
use crate::pool::{RelayPool, Subscription, SubscriptionItem};
use crate::profile::newest_metadata;

enum Command {
    Start {
        counterparty: PublicKey,
        reply: oneshot::Sender<Conversation>,
    },
    Shutdown,
}

pub struct ConversationAggregator {
    commands: mpsc::UnboundedSender<Command>,
    updates: watch::Receiver<Vec<Conversation>>,
    task: JoinHandle<()>,
}

impl ConversationAggregator {
    /// Subscribe to `keys`' inbox on `relays` and start aggregating.
    pub fn spawn(pool: RelayPool, relays: Vec<String>, keys: Keys) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (updates_tx, updates_rx) = watch::channel(Vec::new());
        let inbox = pool.subscribe(&relays, inbox_filters(&keys.public_key()));
        let driver = Driver {
            pool,
            relays,
            keys,
            index: ConversationIndex::new(),
            lookups: StreamMap::new(),
            found: HashMap::new(),
            updates: updates_tx,
        };
        let task = tokio::spawn(driver.run(inbox, commands_rx));
        Self {
            commands: commands_tx,
            updates: updates_rx,
            task,
        }
    }

    /// Push-updated, ordered conversation list.
    pub fn subscribe(&self) -> watch::Receiver<Vec<Conversation>> {
        self.updates.clone()
    }

    pub fn snapshot(&self) -> Vec<Conversation> {
        self.updates.borrow().clone()
    }

    /// Add `counterparty` to the index (or return its existing entry).
    pub async fn start(&self, counterparty: PublicKey) -> Result<Conversation> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Start { counterparty, reply })
            .map_err(|_| Error::Closed("conversation aggregator"))?;
        rx.await.map_err(|_| Error::Closed("conversation aggregator"))
    }

    /// Close the inbox and every pending metadata lookup. Once this returns
    /// the conversation list no longer changes.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Err(e) = self.task.await {
            warn!("aggregator task ended abnormally: {e}");
        }
    }
}

struct Driver {
    pool: RelayPool,
    relays: Vec<String>,
    keys: Keys,
    index: ConversationIndex,
    /// One-shot metadata subscriptions, keyed by counterparty.
    lookups: StreamMap<PublicKey, Subscription>,
    /// Newest metadata seen so far per in-flight lookup.
    found: HashMap<PublicKey, Event>,
    updates: watch::Sender<Vec<Conversation>>,
}

impl Driver {
    async fn run(mut self, mut inbox: Subscription, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!("aggregating conversations for {}", short_hex(&self.keys.public_key()));
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Start { counterparty, reply }) => {
                        let (conversation, needs_metadata) = self.index.start(counterparty);
                        if needs_metadata {
                            self.lookup(counterparty);
                        }
                        self.publish();
                        let _ = reply.send(conversation);
                    }
                    Some(Command::Shutdown) | None => break,
                },
                item = inbox.recv() => match item {
                    Some(SubscriptionItem::Event(event)) => self.on_message(&event),
                    Some(SubscriptionItem::EndOfStoredEvents) => {
                        debug!("inbox replay complete, {} conversation(s)", self.index.sorted().len());
                    }
                    None => break,
                },
                Some((author, item)) = self.lookups.next(), if !self.lookups.is_empty() => {
                    self.on_metadata(author, item);
                }
            }
        }

        inbox.close();
        // Dropping the lookups closes their subscriptions; nothing they
        // receive from here on reaches the index.
        self.lookups.clear();
        self.found.clear();
        debug!("conversation aggregator stopped");
    }

    fn on_message(&mut self, event: &Event) {
        let own = self.keys.public_key();
        let Some(other) = counterparty(event, &own) else {
            debug!("direct message {} has no recipient tag, skipped", event.id);
            return;
        };
        if let Err(e) = decrypt(self.keys.secret_key(), &other, &event.content) {
            debug!("{}: {e}, skipped", event.id);
            return;
        }

        match self.index.observe_message(other, event.created_at.as_u64()) {
            MessageOutcome::NeedsMetadata => self.lookup(other),
            MessageOutcome::Updated => self.publish(),
            MessageOutcome::AwaitingMetadata | MessageOutcome::Unchanged => {}
        }
    }

    fn lookup(&mut self, author: PublicKey) {
        if self.lookups.contains_key(&author) {
            return;
        }
        debug!("looking up metadata for {}", short_hex(&author));
        let subscription = self.pool.subscribe(&self.relays, vec![metadata_filter(&author)]);
        self.lookups.insert(author, subscription);
    }

    fn on_metadata(&mut self, author: PublicKey, item: SubscriptionItem) {
        match item {
            SubscriptionItem::Event(event) => {
                let newest = newest_metadata([self.found.get(&author), Some(&*event)].into_iter().flatten(), &author)
                    .cloned();
                if let Some(newest) = newest {
                    if self.index.apply_metadata(author, Some(&newest)) {
                        self.publish();
                    }
                    self.found.insert(author, newest);
                }
            }
            SubscriptionItem::EndOfStoredEvents => {
                // Closes the one-shot subscription.
                self.lookups.remove(&author);
                let found = self.found.remove(&author);
                if self.index.apply_metadata(author, found.as_ref()) {
                    self.publish();
                }
            }
        }
    }

    fn publish(&self) {
        self.updates.send_replace(self.index.sorted());
    }
}
