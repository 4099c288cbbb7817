//! Passphrase-encrypted key file.
//!
//! Argon2id turns the passphrase and a random salt into a 256-bit key;
//! XChaCha20-Poly1305 seals the 32 secret-key bytes with the public key as
//! associated data. The secret never touches disk in clear.

use std::fs;
use std::path::{Path, PathBuf};

use chacha20poly1305::aead::rand_core::RngCore;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use relaychat_core::nostr_sdk::{Keys, SecretKey};
use relaychat_core::{Error, KeyStore, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const PASSPHRASE_ENV: &str = "RELAYCHAT_PASSPHRASE";

const FILE_VERSION: u32 = 1;
const KDF: &str = "argon2id";
const SALT_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub m_cost: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            m_cost: 65_536,
            t_cost: 3,
            p_cost: 1,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct KeyFile {
    version: u32,
    kdf: String,
    params: KdfParams,
    salt: String,
    nonce: String,
    ciphertext: String,
    public_key: String,
}

/// Where the passphrase comes from.
#[derive(Clone)]
pub enum Passphrase {
    Fixed(String),
    /// `RELAYCHAT_PASSPHRASE`, else an interactive prompt.
    Interactive,
}

impl Passphrase {
    fn resolve(&self, confirm: bool) -> Result<String> {
        let passphrase = match self {
            Passphrase::Fixed(p) => p.clone(),
            Passphrase::Interactive => match std::env::var(PASSPHRASE_ENV) {
                Ok(p) => p,
                Err(_) => {
                    let mut prompt = dialoguer::Password::new().with_prompt("Key passphrase");
                    if confirm {
                        prompt = prompt.with_confirmation("Repeat passphrase", "Passphrases do not match");
                    }
                    prompt
                        .interact()
                        .map_err(|e| Error::KeyStore(format!("passphrase prompt failed: {e}")))?
                }
            },
        };
        if passphrase.is_empty() {
            return Err(Error::KeyStore("passphrase must not be empty".to_string()));
        }
        Ok(passphrase)
    }
}

pub struct FileKeyStore {
    path: PathBuf,
    passphrase: Passphrase,
    params: KdfParams,
}

impl FileKeyStore {
    pub fn new(path: impl Into<PathBuf>, passphrase: Passphrase) -> Self {
        Self::with_params(path, passphrase, KdfParams::default())
    }

    pub fn with_params(path: impl Into<PathBuf>, passphrase: Passphrase, params: KdfParams) -> Self {
        Self {
            path: path.into(),
            passphrase,
            params,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Public key recorded in the file; readable without the passphrase.
    pub fn stored_public_key(&self) -> Result<Option<String>> {
        Ok(self.read_file()?.map(|file| file.public_key))
    }

    fn read_file(&self) -> Result<Option<KeyFile>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)
            .map_err(|e| Error::KeyStore(format!("failed to read {}: {e}", self.path.display())))?;
        let file: KeyFile = serde_json::from_str(&content)?;
        if file.version != FILE_VERSION {
            return Err(Error::KeyStore(format!("unsupported key file version {}", file.version)));
        }
        if file.kdf != KDF {
            return Err(Error::KeyStore(format!("unsupported key derivation {:?}", file.kdf)));
        }
        Ok(Some(file))
    }
}

fn derive_key(passphrase: &str, salt: &[u8], params: &KdfParams) -> Result<[u8; 32]> {
    let argon2_params = argon2::Params::new(params.m_cost, params.t_cost, params.p_cost, Some(32))
        .map_err(|e| Error::KeyStore(format!("invalid Argon2 parameters: {e}")))?;
    let argon2 = argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, argon2_params);
    let mut output = [0u8; 32];
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut output)
        .map_err(|e| Error::KeyStore(format!("Argon2id derivation failed: {e}")))?;
    Ok(output)
}

fn decode_hex(field: &str, value: &str) -> Result<Vec<u8>> {
    hex::decode(value).map_err(|e| Error::KeyStore(format!("corrupt {field}: {e}")))
}

impl KeyStore for FileKeyStore {
    fn load_private_key(&self) -> Result<Option<Keys>> {
        let Some(file) = self.read_file()? else {
            return Ok(None);
        };
        let salt = decode_hex("salt", &file.salt)?;
        let nonce = decode_hex("nonce", &file.nonce)?;
        let ciphertext = decode_hex("ciphertext", &file.ciphertext)?;
        if nonce.len() != 24 {
            return Err(Error::KeyStore("corrupt nonce: expected 24 bytes".to_string()));
        }

        let passphrase = self.passphrase.resolve(false)?;
        let key = derive_key(&passphrase, &salt, &file.params)?;
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
        let payload = Payload {
            msg: &ciphertext,
            aad: file.public_key.as_bytes(),
        };
        let secret = cipher
            .decrypt(XNonce::from_slice(&nonce), payload)
            .map_err(|_| Error::KeyStore("wrong passphrase or corrupted key file".to_string()))?;

        let secret = SecretKey::from_slice(&secret).map_err(|e| Error::KeyStore(e.to_string()))?;
        let keys = Keys::new(secret);
        if keys.public_key().to_hex() != file.public_key {
            return Err(Error::KeyStore("key file public key does not match its secret".to_string()));
        }
        debug!("loaded key {} from {}", file.public_key, self.path.display());
        Ok(Some(keys))
    }

    fn save_private_key(&self, keys: &Keys) -> Result<()> {
        let passphrase = self.passphrase.resolve(true)?;
        let public_key = keys.public_key().to_hex();

        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);

        let key = derive_key(&passphrase, &salt, &self.params)?;
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
        let secret_bytes = keys.secret_key().to_secret_bytes();
        let payload = Payload {
            msg: secret_bytes.as_slice(),
            aad: public_key.as_bytes(),
        };
        let ciphertext = cipher
            .encrypt(&nonce, payload)
            .map_err(|e| Error::KeyStore(format!("XChaCha20-Poly1305 encryption failed: {e}")))?;

        let file = KeyFile {
            version: FILE_VERSION,
            kdf: KDF.to_string(),
            params: self.params,
            salt: hex::encode(salt),
            nonce: hex::encode(nonce),
            ciphertext: hex::encode(ciphertext),
            public_key,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::KeyStore(format!("failed to create {}: {e}", parent.display())))?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(&file)?)
            .map_err(|e| Error::KeyStore(format!("failed to write {}: {e}", self.path.display())))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))
                .map_err(|e| Error::KeyStore(format!("failed to restrict {}: {e}", self.path.display())))?;
        }
        info!("saved key {} to {}", file.public_key, self.path.display());
        Ok(())
    }

    fn clear_private_key(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::KeyStore(format!("failed to remove {}: {e}", self.path.display()))),
        }
    }
}
