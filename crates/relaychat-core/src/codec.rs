//! Key text formats and direct-message content encryption.
//!
//! Keys travel as bech32 (`npub1…`/`nsec1…`) or 64-char hex. Message bodies
//! use NIP-04: an ECDH shared secret between our secret key and the
//! counterparty public key keys an AES-256-CBC cipher.

use nostr_sdk::nips::nip04;
use nostr_sdk::nips::nip19::ToBech32;
use nostr_sdk::{Keys, PublicKey, SecretKey};

use crate::error::{Error, Result};

/// Decode a counterparty identifier typed by the user (`npub1…` or hex).
pub fn parse_public_key(input: &str) -> Result<PublicKey> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::invalid_identifier(input, "empty identifier"));
    }
    if trimmed.starts_with("nsec1") {
        return Err(Error::invalid_identifier(
            input,
            "this is a secret key, expected npub1... or hex",
        ));
    }
    PublicKey::parse(trimmed).map_err(|e| Error::invalid_identifier(input, e))
}

/// Decode secret key material (`nsec1…` or hex) into a key pair.
pub fn parse_keys(input: &str) -> Result<Keys> {
    let secret = SecretKey::parse(input.trim()).map_err(|e| Error::KeyStore(e.to_string()))?;
    Ok(Keys::new(secret))
}

pub fn encode_npub(public_key: &PublicKey) -> Result<String> {
    public_key
        .to_bech32()
        .map_err(|e| Error::Validation(format!("npub encoding failed: {e}")))
}

pub fn encode_nsec(keys: &Keys) -> Result<String> {
    keys.secret_key()
        .to_bech32()
        .map_err(|e| Error::Validation(format!("nsec encoding failed: {e}")))
}

/// Short form of a hex public key for log lines.
pub fn short_hex(public_key: &PublicKey) -> String {
    let hex = public_key.to_hex();
    hex[..8.min(hex.len())].to_string()
}

/// Encrypt `plaintext` for `counterparty`.
pub fn encrypt(secret_key: &SecretKey, counterparty: &PublicKey, plaintext: &str) -> Result<String> {
    nip04::encrypt(secret_key, counterparty, plaintext)
        .map_err(|e| Error::Validation(format!("encryption failed: {e}")))
}

/// Decrypt content exchanged with `counterparty`.
///
/// Fails with [`Error::Decryption`] on malformed payloads and on payloads
/// produced under a different shared secret. Callers treat that as
/// "message unreadable" and skip the event.
pub fn decrypt(secret_key: &SecretKey, counterparty: &PublicKey, ciphertext: &str) -> Result<String> {
    nip04::decrypt(secret_key, counterparty, ciphertext).map_err(|e| Error::Decryption(e.to_string()))
}
