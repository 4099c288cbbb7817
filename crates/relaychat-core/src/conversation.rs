//! Conversation index: one summary per counterparty, ordered by recency.
//!
//! Pure state. The aggregator feeds it message and metadata observations
//! and acts on the outcomes (opening metadata lookups, pushing updates).

use std::collections::HashMap;

use nostr_sdk::{Event, PublicKey};
use serde::Serialize;

use crate::profile::display_name_for;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conversation {
    pub counterparty: PublicKey,
    pub display_name: String,
    /// `created_at` of the newest message seen in either direction.
    pub latest_message_at: u64,
}

#[derive(Debug)]
enum Entry {
    /// Metadata lookup in flight. Messages only advance the timestamp.
    Pending { latest_message_at: u64 },
    Known {
        conversation: Conversation,
        /// `created_at` of the metadata behind `display_name`, if any.
        metadata_at: Option<u64>,
    },
}

/// What the caller must do after [`ConversationIndex::observe_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// First sight of this counterparty: open exactly one metadata lookup.
    NeedsMetadata,
    /// Still waiting on metadata; nothing visible changed.
    AwaitingMetadata,
    /// A visible conversation moved.
    Updated,
    /// Older than what the conversation already shows.
    Unchanged,
}

#[derive(Debug, Default)]
pub struct ConversationIndex {
    entries: HashMap<PublicKey, Entry>,
}

impl ConversationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe_message(&mut self, counterparty: PublicKey, created_at: u64) -> MessageOutcome {
        match self.entries.get_mut(&counterparty) {
            None => {
                self.entries.insert(
                    counterparty,
                    Entry::Pending {
                        latest_message_at: created_at,
                    },
                );
                MessageOutcome::NeedsMetadata
            }
            Some(Entry::Pending { latest_message_at }) => {
                *latest_message_at = (*latest_message_at).max(created_at);
                MessageOutcome::AwaitingMetadata
            }
            Some(Entry::Known { conversation, .. }) => {
                if created_at > conversation.latest_message_at {
                    conversation.latest_message_at = created_at;
                    MessageOutcome::Updated
                } else {
                    MessageOutcome::Unchanged
                }
            }
        }
    }

    /// Apply a metadata lookup result. `None` means the lookup finished with
    /// nothing usable; a pending counterparty then materializes under its
    /// public key. Returns whether anything visible changed.
    pub fn apply_metadata(&mut self, counterparty: PublicKey, metadata: Option<&Event>) -> bool {
        let metadata = metadata.filter(|e| e.pubkey == counterparty);
        let metadata_at = metadata.map(|e| e.created_at.as_u64());
        let Some(entry) = self.entries.get_mut(&counterparty) else {
            return false;
        };

        match entry {
            Entry::Pending { latest_message_at } => {
                let latest_message_at = *latest_message_at;
                *entry = Entry::Known {
                    conversation: Conversation {
                        counterparty,
                        display_name: display_name_for(&counterparty, metadata),
                        latest_message_at,
                    },
                    metadata_at,
                };
                true
            }
            Entry::Known {
                conversation,
                metadata_at: current,
            } => {
                let newer = match (metadata_at, *current) {
                    (Some(new), Some(old)) => new > old,
                    (Some(_), None) => true,
                    (None, _) => false,
                };
                if !newer {
                    return false;
                }
                *current = metadata_at;
                let name = display_name_for(&counterparty, metadata);
                if name == conversation.display_name {
                    return false;
                }
                conversation.display_name = name;
                true
            }
        }
    }

    /// Explicit new-conversation action. Returns the conversation and whether
    /// a metadata lookup should be started for it.
    pub fn start(&mut self, counterparty: PublicKey) -> (Conversation, bool) {
        if let Some(Entry::Known { conversation, .. }) = self.entries.get(&counterparty) {
            return (conversation.clone(), false);
        }
        let (latest_message_at, needs_metadata) = match self.entries.get(&counterparty) {
            Some(Entry::Pending { latest_message_at }) => (*latest_message_at, false),
            _ => (0, true),
        };
        let conversation = Conversation {
            counterparty,
            display_name: counterparty.to_hex(),
            latest_message_at,
        };
        self.entries.insert(
            counterparty,
            Entry::Known {
                conversation: conversation.clone(),
                metadata_at: None,
            },
        );
        (conversation, needs_metadata)
    }

    pub fn get(&self, counterparty: &PublicKey) -> Option<&Conversation> {
        match self.entries.get(counterparty) {
            Some(Entry::Known { conversation, .. }) => Some(conversation),
            _ => None,
        }
    }

    pub fn is_pending(&self, counterparty: &PublicKey) -> bool {
        matches!(self.entries.get(counterparty), Some(Entry::Pending { .. }))
    }

    /// Visible conversations, newest first; ties by counterparty id.
    pub fn sorted(&self) -> Vec<Conversation> {
        let mut list: Vec<Conversation> = self
            .entries
            .values()
            .filter_map(|entry| match entry {
                Entry::Known { conversation, .. } => Some(conversation.clone()),
                Entry::Pending { .. } => None,
            })
            .collect();
        list.sort_by(|a, b| {
            b.latest_message_at
                .cmp(&a.latest_message_at)
                .then_with(|| a.counterparty.cmp(&b.counterparty))
        });
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{build_event, EventDraft, KIND_METADATA};
    use nostr_sdk::Keys;

    fn metadata(keys: &Keys, content: &str, at: u64) -> Event {
        build_event(keys, EventDraft::new(KIND_METADATA, content).created_at(at)).unwrap()
    }

    fn summary(list: &[Conversation]) -> Vec<(PublicKey, u64)> {
        list.iter().map(|c| (c.counterparty, c.latest_message_at)).collect()
    }

    #[test]
    fn orders_by_latest_timestamp_not_arrival() {
        let x = Keys::generate().public_key();
        let y = Keys::generate().public_key();
        let mut index = ConversationIndex::new();

        assert_eq!(index.observe_message(x, 100), MessageOutcome::NeedsMetadata);
        assert_eq!(index.observe_message(y, 300), MessageOutcome::NeedsMetadata);
        assert_eq!(index.observe_message(x, 200), MessageOutcome::AwaitingMetadata);

        index.apply_metadata(x, None);
        index.apply_metadata(y, None);
        assert_eq!(summary(&index.sorted()), vec![(y, 300), (x, 200)]);
    }

    #[test]
    fn metadata_requested_once_per_counterparty() {
        let x = Keys::generate().public_key();
        let mut index = ConversationIndex::new();
        let requests = [10, 20, 5]
            .into_iter()
            .filter(|at| index.observe_message(x, *at) == MessageOutcome::NeedsMetadata)
            .count();
        assert_eq!(requests, 1);
        assert!(index.is_pending(&x));
        assert!(index.sorted().is_empty());
    }

    #[test]
    fn pending_conversation_materializes_with_metadata_name() {
        let keys = Keys::generate();
        let x = keys.public_key();
        let mut index = ConversationIndex::new();
        index.observe_message(x, 50);

        assert!(index.apply_metadata(x, Some(&metadata(&keys, r#"{"name":"xena"}"#, 1))));
        let conversation = index.get(&x).unwrap();
        assert_eq!(conversation.display_name, "xena");
        assert_eq!(conversation.latest_message_at, 50);
    }

    #[test]
    fn malformed_metadata_falls_back_to_public_key() {
        let keys = Keys::generate();
        let x = keys.public_key();
        let mut index = ConversationIndex::new();
        index.observe_message(x, 50);
        index.apply_metadata(x, Some(&metadata(&keys, "not json", 1)));
        assert_eq!(index.get(&x).unwrap().display_name, x.to_hex());
    }

    #[test]
    fn newer_metadata_renames_older_does_not() {
        let keys = Keys::generate();
        let x = keys.public_key();
        let mut index = ConversationIndex::new();
        index.observe_message(x, 50);
        index.apply_metadata(x, Some(&metadata(&keys, r#"{"name":"v2"}"#, 20)));

        assert!(!index.apply_metadata(x, Some(&metadata(&keys, r#"{"name":"v1"}"#, 10))));
        assert_eq!(index.get(&x).unwrap().display_name, "v2");

        assert!(index.apply_metadata(x, Some(&metadata(&keys, r#"{"name":"v3"}"#, 30))));
        assert_eq!(index.get(&x).unwrap().display_name, "v3");
    }

    #[test]
    fn metadata_from_someone_else_is_ignored() {
        let x = Keys::generate().public_key();
        let impostor = Keys::generate();
        let mut index = ConversationIndex::new();
        index.observe_message(x, 50);
        index.apply_metadata(x, Some(&metadata(&impostor, r#"{"name":"fake"}"#, 1)));
        assert_eq!(index.get(&x).unwrap().display_name, x.to_hex());
    }

    #[test]
    fn timestamp_never_moves_backwards() {
        let x = Keys::generate().public_key();
        let mut index = ConversationIndex::new();
        index.observe_message(x, 300);
        index.apply_metadata(x, None);
        assert_eq!(index.observe_message(x, 100), MessageOutcome::Unchanged);
        assert_eq!(index.observe_message(x, 400), MessageOutcome::Updated);
        assert_eq!(index.get(&x).unwrap().latest_message_at, 400);
    }

    #[test]
    fn ties_break_by_counterparty_id() {
        let a = Keys::generate().public_key();
        let b = Keys::generate().public_key();
        let mut index = ConversationIndex::new();
        for pk in [a, b] {
            index.observe_message(pk, 100);
            index.apply_metadata(pk, None);
        }
        let mut expected = vec![a, b];
        expected.sort();
        let order: Vec<_> = index.sorted().iter().map(|c| c.counterparty).collect();
        assert_eq!(order, expected);
    }

    #[test]
    fn starting_a_conversation_is_idempotent() {
        let x = Keys::generate().public_key();
        let mut index = ConversationIndex::new();
        let (first, lookup) = index.start(x);
        assert!(lookup);
        assert_eq!(first.latest_message_at, 0);
        let (second, lookup) = index.start(x);
        assert!(!lookup);
        assert_eq!(first, second);
        assert_eq!(index.observe_message(x, 10), MessageOutcome::Updated);
    }

    #[test]
    fn starting_a_pending_conversation_keeps_its_timestamp() {
        let x = Keys::generate().public_key();
        let mut index = ConversationIndex::new();
        index.observe_message(x, 42);
        let (conversation, lookup) = index.start(x);
        assert!(!lookup);
        assert_eq!(conversation.latest_message_at, 42);
    }
}
