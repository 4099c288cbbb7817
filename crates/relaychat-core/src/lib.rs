//! Direct-message core for Nostr relays: a multi-relay pool with per-
//! subscription dedup, NIP-04 encryption, and conversation/thread state.

pub mod aggregator;
pub mod codec;
pub mod conversation;
pub mod dedup;
pub mod error;
pub mod event;
pub mod filter;
pub mod message;
pub mod pool;
pub mod profile;
pub mod relay;
pub mod session;
pub mod storage;
pub mod thread;

pub use aggregator::ConversationAggregator;
pub use codec::{decrypt, encode_npub, encode_nsec, encrypt, parse_keys, parse_public_key};
pub use conversation::{Conversation, ConversationIndex};
pub use error::{Error, Result};
pub use event::{build_event, verify, EventDraft, LocalSigner, Signer};
pub use filter::Filter;
pub use pool::{PoolConfig, PublishOutput, RelayPool, Subscription, SubscriptionItem};
pub use profile::Profile;
pub use relay::RelayStatus;
pub use session::Session;
pub use storage::{KeyStore, MemoryKeyStore, RelayConfigSource, DEFAULT_RELAYS};
pub use thread::{DecryptedMessage, Direction, MessageThread};

pub use nostr_sdk;
