//! Profile metadata (`kind 0`): parsing, display names, fetch and publish.

use nostr_sdk::{Event, PublicKey};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::event::{EventDraft, Signer, KIND_METADATA};
use crate::filter::metadata_filter;
use crate::pool::{PublishOutput, RelayPool};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nip05: Option<String>,
}

impl Profile {
    /// Parse the content of a metadata event.
    pub fn from_event(event: &Event) -> Result<Self> {
        if event.kind.as_u16() != KIND_METADATA {
            return Err(Error::MetadataParse(format!(
                "event {} is kind {}, not metadata",
                event.id,
                event.kind.as_u16()
            )));
        }
        Self::from_content(&event.content)
    }

    pub fn from_content(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| Error::MetadataParse(e.to_string()))
    }

    /// Priority: name > display_name. Blank values don't count.
    pub fn display_name(&self) -> Option<&str> {
        [self.name.as_deref(), self.display_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|name| !name.is_empty())
    }
}

/// Name to show for `counterparty` given its (possibly missing or malformed)
/// metadata event. Falls back to the hex public key.
pub fn display_name_for(counterparty: &PublicKey, metadata: Option<&Event>) -> String {
    let parsed = metadata.map(Profile::from_event);
    match parsed {
        Some(Ok(profile)) => profile
            .display_name()
            .map(str::to_string)
            .unwrap_or_else(|| counterparty.to_hex()),
        Some(Err(e)) => {
            debug!("{counterparty}: {e}, using public key as name");
            counterparty.to_hex()
        }
        None => counterparty.to_hex(),
    }
}

/// Newest metadata event in `events` authored by `author`.
pub fn newest_metadata<'a>(events: impl IntoIterator<Item = &'a Event>, author: &PublicKey) -> Option<&'a Event> {
    events
        .into_iter()
        .filter(|e| e.pubkey == *author && e.kind.as_u16() == KIND_METADATA)
        .max_by_key(|e| (e.created_at, e.id))
}

/// One-shot lookup of `author`'s profile across `relays`. `Ok(None)` when
/// no relay has metadata for it before end-of-stored-events or timeout.
pub async fn fetch_profile(pool: &RelayPool, relays: &[String], author: &PublicKey) -> Result<Option<Profile>> {
    let events = pool.fetch(relays, vec![metadata_filter(author)]).await;
    match newest_metadata(&events, author) {
        Some(event) => Profile::from_event(event).map(Some),
        None => Ok(None),
    }
}

/// Sign and publish `profile` as the signer's metadata.
pub async fn publish_profile(
    pool: &RelayPool,
    relays: &[String],
    signer: &dyn Signer,
    profile: &Profile,
) -> Result<PublishOutput> {
    let content = serde_json::to_string(profile)?;
    let event = signer.sign(EventDraft::new(KIND_METADATA, content))?;
    pool.publish(relays, &event).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::build_event;
    use nostr_sdk::Keys;

    fn metadata(keys: &Keys, content: &str, at: u64) -> Event {
        build_event(keys, EventDraft::new(KIND_METADATA, content).created_at(at)).unwrap()
    }

    #[test]
    fn prefers_name_over_display_name() {
        let profile = Profile::from_content(r#"{"name":"alice","display_name":"Alice A."}"#).unwrap();
        assert_eq!(profile.display_name(), Some("alice"));

        let profile = Profile::from_content(r#"{"name":"  ","display_name":" Alice A. "}"#).unwrap();
        assert_eq!(profile.display_name(), Some("Alice A."));

        let profile = Profile::from_content(r#"{"about":"no names"}"#).unwrap();
        assert_eq!(profile.display_name(), None);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let profile = Profile::from_content(r#"{"name":"bob","lud16":"bob@example.com","banner":"x"}"#).unwrap();
        assert_eq!(profile.name.as_deref(), Some("bob"));
    }

    #[test]
    fn malformed_content_is_a_metadata_error() {
        assert!(matches!(Profile::from_content("not json"), Err(Error::MetadataParse(_))));
        assert!(matches!(Profile::from_content("[1,2]"), Err(Error::MetadataParse(_))));
    }

    #[test]
    fn display_name_falls_back_to_public_key() {
        let keys = Keys::generate();
        let pk = keys.public_key();

        assert_eq!(display_name_for(&pk, None), pk.to_hex());

        let broken = metadata(&keys, "{oops", 1);
        assert_eq!(display_name_for(&pk, Some(&broken)), pk.to_hex());

        let nameless = metadata(&keys, r#"{"about":"hi"}"#, 1);
        assert_eq!(display_name_for(&pk, Some(&nameless)), pk.to_hex());

        let named = metadata(&keys, r#"{"name":"carol"}"#, 1);
        assert_eq!(display_name_for(&pk, Some(&named)), "carol");
    }

    #[test]
    fn newest_metadata_wins() {
        let keys = Keys::generate();
        let other = Keys::generate();
        let old = metadata(&keys, r#"{"name":"old"}"#, 10);
        let new = metadata(&keys, r#"{"name":"new"}"#, 20);
        let foreign = metadata(&other, r#"{"name":"someone"}"#, 30);
        let events = vec![new.clone(), old, foreign];
        assert_eq!(newest_metadata(&events, &keys.public_key()).map(|e| e.id), Some(new.id));
    }

    #[test]
    fn serialized_profile_skips_empty_fields() {
        let profile = Profile {
            name: Some("dave".into()),
            ..Default::default()
        };
        assert_eq!(serde_json::to_string(&profile).unwrap(), r#"{"name":"dave"}"#);
    }
}
