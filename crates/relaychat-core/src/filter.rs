//! Relay subscription filters, serialized exactly as relays expect them.

use std::collections::BTreeSet;

use nostr_sdk::filter::MatchEventOptions;
use nostr_sdk::{Event, Kind, PublicKey, Timestamp};
use serde::{Deserialize, Serialize};

use crate::event::{KIND_DIRECT_MESSAGE, KIND_METADATA};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub kinds: BTreeSet<u16>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub authors: BTreeSet<PublicKey>,
    /// Tagged recipients (`#p`).
    #[serde(rename = "#p", default, skip_serializing_if = "BTreeSet::is_empty")]
    pub recipients: BTreeSet<PublicKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: u16) -> Self {
        self.kinds.insert(kind);
        self
    }

    pub fn author(mut self, author: PublicKey) -> Self {
        self.authors.insert(author);
        self
    }

    pub fn recipient(mut self, recipient: PublicKey) -> Self {
        self.recipients.insert(recipient);
        self
    }

    pub fn since(mut self, secs: u64) -> Self {
        self.since = Some(secs);
        self
    }

    pub fn until(mut self, secs: u64) -> Self {
        self.until = Some(secs);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `event` satisfies every constraint of this filter.
    ///
    /// `limit` only shapes the relay's stored-event replay and is ignored.
    pub fn matches(&self, event: &Event) -> bool {
        self.to_nostr().match_event(event, MatchEventOptions::new())
    }

    fn to_nostr(&self) -> nostr_sdk::Filter {
        let mut filter = nostr_sdk::Filter::new();
        if !self.kinds.is_empty() {
            filter = filter.kinds(self.kinds.iter().copied().map(Kind::from_u16));
        }
        if !self.authors.is_empty() {
            filter = filter.authors(self.authors.iter().copied());
        }
        if !self.recipients.is_empty() {
            filter = filter.pubkeys(self.recipients.iter().copied());
        }
        if let Some(since) = self.since {
            filter = filter.since(Timestamp::from_secs(since));
        }
        if let Some(until) = self.until {
            filter = filter.until(Timestamp::from_secs(until));
        }
        filter
    }
}

/// Every direct message sent to or by `own`.
pub fn inbox_filters(own: &PublicKey) -> Vec<Filter> {
    vec![
        Filter::new().kind(KIND_DIRECT_MESSAGE).recipient(*own),
        Filter::new().kind(KIND_DIRECT_MESSAGE).author(*own),
    ]
}

/// Direct messages in both directions between `own` and `counterparty`.
pub fn thread_filters(own: &PublicKey, counterparty: &PublicKey) -> Vec<Filter> {
    vec![
        Filter::new()
            .kind(KIND_DIRECT_MESSAGE)
            .author(*own)
            .recipient(*counterparty),
        Filter::new()
            .kind(KIND_DIRECT_MESSAGE)
            .author(*counterparty)
            .recipient(*own),
    ]
}

/// Profile metadata published by `author`.
pub fn metadata_filter(author: &PublicKey) -> Filter {
    Filter::new().kind(KIND_METADATA).author(*author)
}
