//! Event construction, verification and the signing capability.

use nostr_sdk::{Event, EventBuilder, Keys, Kind, PublicKey, Tag, Timestamp};
use serde::Deserialize;

use crate::error::{Error, Result};

/// Profile metadata (`kind 0`).
pub const KIND_METADATA: u16 = 0;
/// NIP-04 encrypted direct message (`kind 4`).
pub const KIND_DIRECT_MESSAGE: u16 = 4;

/// Unsigned event template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EventDraft {
    pub kind: u64,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    /// Unix seconds; `None` means "now".
    #[serde(default)]
    pub created_at: Option<u64>,
}

impl EventDraft {
    pub fn new(kind: u16, content: impl Into<String>) -> Self {
        Self {
            kind: u64::from(kind),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn tag(mut self, tag: Vec<String>) -> Self {
        self.tags.push(tag);
        self
    }

    pub fn created_at(mut self, secs: u64) -> Self {
        self.created_at = Some(secs);
        self
    }

    /// Parse an untyped template, e.g. one handed over by an upload service.
    ///
    /// A negative or fractional `kind`, or a non-string `content`, is a
    /// [`Error::Validation`].
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Validation(e.to_string()))
    }
}

/// Encrypted direct message template addressed to `recipient`.
pub fn direct_message_draft(recipient: &PublicKey, ciphertext: impl Into<String>) -> EventDraft {
    EventDraft::new(KIND_DIRECT_MESSAGE, ciphertext).tag(vec!["p".to_string(), recipient.to_hex()])
}

/// Validate `draft`, compute its content-addressed id and sign it.
pub fn build_event(keys: &Keys, draft: EventDraft) -> Result<Event> {
    let kind = u16::try_from(draft.kind)
        .map_err(|_| Error::Validation(format!("kind {} is out of range", draft.kind)))?;

    let mut tags = Vec::with_capacity(draft.tags.len());
    for raw in draft.tags {
        if raw.first().map_or(true, |name| name.is_empty()) {
            return Err(Error::Validation("tags must start with a non-empty name".to_string()));
        }
        tags.push(Tag::parse(raw).map_err(|e| Error::Validation(e.to_string()))?);
    }

    let created_at = draft
        .created_at
        .map(Timestamp::from)
        .unwrap_or_else(Timestamp::now);

    EventBuilder::new(Kind::from(kind), draft.content)
        .tags(tags)
        .custom_created_at(created_at)
        .sign_with_keys(keys)
        .map_err(|e| Error::Validation(e.to_string()))
}

/// Recompute the id from the event fields and check the signature.
pub fn verify(event: &Event) -> bool {
    event.verify().is_ok()
}

/// First public key referenced by a `p` tag.
pub fn tagged_recipient(event: &Event) -> Option<PublicKey> {
    event.tags.iter().find_map(|tag| {
        let s = tag.as_slice();
        if s.first().map(|v| v.as_str()) == Some("p") {
            s.get(1).and_then(|hex| PublicKey::from_hex(hex).ok())
        } else {
            None
        }
    })
}

/// The other party of a direct message as seen from `own`.
pub fn counterparty(event: &Event, own: &PublicKey) -> Option<PublicKey> {
    if event.pubkey == *own {
        tagged_recipient(event)
    } else {
        Some(event.pubkey)
    }
}

/// Signing capability handed to collaborators (e.g. media upload).
pub trait Signer: Send + Sync {
    fn public_key(&self) -> PublicKey;
    fn sign(&self, draft: EventDraft) -> Result<Event>;
}

#[derive(Clone)]
pub struct LocalSigner {
    keys: Keys,
}

impl LocalSigner {
    pub fn new(keys: Keys) -> Self {
        Self { keys }
    }
}

impl Signer for LocalSigner {
    fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    fn sign(&self, draft: EventDraft) -> Result<Event> {
        build_event(&self.keys, draft)
    }
}
