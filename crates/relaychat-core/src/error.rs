//! Error taxonomy shared by every component of the core.
//!
//! Transport and parse failures are normally contained where they are
//! detected (logged, then skipped or retried). Only caller-input validation
//! and user-initiated action failures travel back to the caller as `Err`.

use std::collections::BTreeMap;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Relay unreachable or connection dropped.
    #[error("relay {url}: {reason}")]
    Connection { url: String, reason: String },

    /// Malformed event construction request, rejected before signing.
    #[error("invalid event: {0}")]
    Validation(String),

    /// Event id or signature does not verify.
    #[error("event {0} failed verification")]
    Signature(String),

    /// Content cannot be decrypted with the current keys.
    #[error("unable to decrypt message: {0}")]
    Decryption(String),

    /// Profile metadata content is not a usable JSON object.
    #[error("malformed profile metadata: {0}")]
    MetadataParse(String),

    /// User-supplied counterparty identifier does not decode to a public key.
    #[error("invalid identifier '{input}': {reason}")]
    InvalidIdentifier { input: String, reason: String },

    /// No relay acknowledged a published event.
    #[error("no relay accepted event {event_id} ({})", format_failures(.failures))]
    Publish {
        event_id: String,
        failures: BTreeMap<String, String>,
    },

    /// The component was shut down before the operation completed.
    #[error("{0} is closed")]
    Closed(&'static str),

    /// Key storage collaborator failure.
    #[error("key store: {0}")]
    KeyStore(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn format_failures(failures: &BTreeMap<String, String>) -> String {
    if failures.is_empty() {
        return "no relays configured".to_string();
    }
    failures
        .iter()
        .map(|(url, reason)| format!("{url}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    pub(crate) fn connection(url: &str, reason: impl ToString) -> Self {
        Self::Connection {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn invalid_identifier(input: &str, reason: impl ToString) -> Self {
        Self::InvalidIdentifier {
            input: input.to_string(),
            reason: reason.to_string(),
        }
    }
}
