//! Asymmetric archive encryption.
//!
//! Archives are sealed for a recipient X25519 public key: an ephemeral key
//! pair agrees a shared secret with the recipient, HKDF-SHA256 turns it into an
//! AES-256-GCM key, and the archive bytes are encrypted under a random nonce.
//!
//! Sealed file layout:
//!
//! ```text
//! "SFE1" | ephemeral public key (32) | nonce (12) | ciphertext + tag
//! ```
//!
//! Only the holder of the matching private key can open it.

use std::fs;
use std::path::{Path, PathBuf};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use tracing::{debug, warn};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::archive::Archive;

const MAGIC: &[u8; 4] = b"SFE1";
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const HEADER_LEN: usize = MAGIC.len() + KEY_LEN + NONCE_LEN;
const HKDF_SALT: &[u8] = b"sample-forwarder-archive-v1";

/// File extension appended to sealed archives.
pub const ENCRYPTED_EXTENSION: &str = "enc";

/// Encryption/decryption errors
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid public key: {0}")]
    InvalidKey(String),
    #[error("key derivation failed")]
    KeyDerivationFailed,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed - wrong key or data corrupted")]
    DecryptionFailed,
    #[error("not a sealed archive")]
    InvalidFormat,
    #[error("encryption unavailable: {0}")]
    Unavailable(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where the recipient public key comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKeySource {
    /// Hex-encoded 32-byte key
    Hex(String),
    /// File holding the key as hex text or 32 raw bytes
    File(PathBuf),
}

impl PublicKeySource {
    pub fn load(&self) -> Result<PublicKey, CryptoError> {
        match self {
            PublicKeySource::Hex(text) => parse_public_key_hex(text),
            PublicKeySource::File(path) => {
                let bytes = fs::read(path)?;
                if bytes.len() == KEY_LEN {
                    let mut raw = [0u8; KEY_LEN];
                    raw.copy_from_slice(&bytes);
                    return Ok(PublicKey::from(raw));
                }
                let text = String::from_utf8(bytes)
                    .map_err(|_| CryptoError::InvalidKey("key file is neither hex nor raw".into()))?;
                parse_public_key_hex(&text)
            }
        }
    }
}

fn decode_key_hex(text: &str) -> Result<[u8; KEY_LEN], CryptoError> {
    let bytes = hex::decode(text.trim()).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| CryptoError::InvalidKey(format!("expected 32 bytes, got {}", b.len())))
}

/// Parse a hex-encoded X25519 public key.
pub fn parse_public_key_hex(text: &str) -> Result<PublicKey, CryptoError> {
    decode_key_hex(text).map(PublicKey::from)
}

/// Parse a hex-encoded X25519 private key.
pub fn parse_secret_key_hex(text: &str) -> Result<StaticSecret, CryptoError> {
    decode_key_hex(text).map(StaticSecret::from)
}

/// Long-lived recipient key pair, used by the receiving side and in tests.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public.as_bytes())
    }

    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.secret.to_bytes())
    }
}

fn derive_key(
    shared: &[u8; 32],
    ephemeral: &PublicKey,
    recipient: &PublicKey,
) -> Result<[u8; 32], CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(Some(HKDF_SALT), shared);
    let mut info = Vec::with_capacity(KEY_LEN * 2);
    info.extend_from_slice(ephemeral.as_bytes());
    info.extend_from_slice(recipient.as_bytes());

    let mut key = [0u8; 32];
    hkdf.expand(&info, &mut key)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;
    Ok(key)
}

/// Seal `plaintext` for `recipient`.
pub fn seal(recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let ephemeral_secret = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral_secret);
    let shared = ephemeral_secret.diffie_hellman(recipient);
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey("low-order public key".into()));
    }
    let key = derive_key(shared.as_bytes(), &ephemeral_public, recipient)?;

    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::EncryptionFailed)?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open data produced by [`seal`] with the recipient's private key.
pub fn open(secret: &StaticSecret, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < HEADER_LEN || &sealed[..MAGIC.len()] != MAGIC {
        return Err(CryptoError::InvalidFormat);
    }

    let mut ephemeral = [0u8; KEY_LEN];
    ephemeral.copy_from_slice(&sealed[MAGIC.len()..MAGIC.len() + KEY_LEN]);
    let ephemeral = PublicKey::from(ephemeral);
    let nonce = &sealed[MAGIC.len() + KEY_LEN..HEADER_LEN];

    let recipient = PublicKey::from(secret);
    let shared = secret.diffie_hellman(&ephemeral);
    let key = derive_key(shared.as_bytes(), &ephemeral, &recipient)?;

    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::DecryptionFailed)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), &sealed[HEADER_LEN..])
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Archive encryption selected by configuration.
#[derive(Clone)]
pub enum EncryptionStrategy {
    /// Ship archives as they are
    Disabled,
    /// Seal archives for this recipient
    PublicKey(PublicKey),
    /// Encryption was requested but no usable key is configured; every
    /// attempt fails so that plaintext is never uploaded
    Unavailable(String),
}

impl EncryptionStrategy {
    /// Resolve the strategy from an optional key source.
    pub fn from_source(source: Option<&PublicKeySource>) -> Self {
        match source {
            None => EncryptionStrategy::Disabled,
            Some(source) => match source.load() {
                Ok(key) => EncryptionStrategy::PublicKey(key),
                Err(e) => {
                    warn!(error = %e, "Encryption key unusable, uploads will fail until fixed");
                    EncryptionStrategy::Unavailable(e.to_string())
                }
            },
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, EncryptionStrategy::Disabled)
    }

    /// Encrypt `archive` into a sibling `.enc` file.
    ///
    /// The plaintext archive is deleted whether or not encryption succeeds.
    /// With encryption disabled the archive is returned untouched.
    pub fn encrypt_archive(&self, archive: Archive) -> Result<Archive, CryptoError> {
        let recipient = match self {
            EncryptionStrategy::Disabled => return Ok(archive),
            EncryptionStrategy::PublicKey(key) => *key,
            EncryptionStrategy::Unavailable(reason) => {
                remove_plaintext(&archive.path);
                return Err(CryptoError::Unavailable(reason.clone()));
            }
        };

        let target = sealed_path(&archive.path);
        let result = fs::read(&archive.path)
            .map_err(CryptoError::from)
            .and_then(|plain| seal(&recipient, &plain))
            .and_then(|sealed| fs::write(&target, sealed).map_err(CryptoError::from));

        remove_plaintext(&archive.path);

        match result {
            Ok(()) => {
                debug!(path = %target.display(), "Archive encrypted");
                Ok(Archive {
                    path: target,
                    encrypted: true,
                })
            }
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&target) {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %target.display(), error = %cleanup, "Failed to delete partial sealed archive");
                    }
                }
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for EncryptionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncryptionStrategy::Disabled => write!(f, "Disabled"),
            EncryptionStrategy::PublicKey(key) => {
                write!(f, "PublicKey({})", hex::encode(key.as_bytes()))
            }
            EncryptionStrategy::Unavailable(reason) => write!(f, "Unavailable({})", reason),
        }
    }
}

fn sealed_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(ENCRYPTED_EXTENSION);
    PathBuf::from(name)
}

fn remove_plaintext(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to delete plaintext archive");
        }
    }
}

/// Decrypt a sealed archive file.
pub fn decrypt_file(path: &Path, secret: &StaticSecret) -> Result<Vec<u8>, CryptoError> {
    let sealed = fs::read(path)?;
    open(secret, &sealed)
}
