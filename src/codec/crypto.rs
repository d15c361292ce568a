//! File encryption: HKDF-SHA256 key derivation and AES-256-GCM
//!
//! Every file gets its own key, derived from the owner's master key with a
//! fresh random salt and an info string bound to the file identity. The same
//! string is used as associated data, so a ciphertext cannot be replayed
//! under a different file id or name.

use crate::error::{Error, Result};
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::{ZeroizeOnDrop, Zeroizing};

pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 32;
pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

pub const CIPHER_NAME: &str = "AES-256-GCM";
pub const KDF_NAME: &str = "HKDF-SHA256";

/// A user's 256-bit master key. Zeroed on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; KEY_LEN],
}

impl MasterKey {
    /// Generate a random master key
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    pub fn from_bytes(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            Error::InvalidConfig(format!(
                "master key must be {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self { key })
    }

    pub fn from_hex(encoded: &str) -> Result<Self> {
        let bytes = Zeroizing::new(
            hex::decode(encoded.trim())
                .map_err(|e| Error::InvalidConfig(format!("master key is not hex: {}", e)))?,
        );
        Self::from_slice(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.key)
    }

    /// Get raw key bytes (use carefully)
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

impl PartialEq for MasterKey {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for MasterKey {}

/// Identity a file key and its ciphertext are bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContext {
    pub file_id: String,
    pub file_name: String,
}

impl FileContext {
    pub fn new(file_id: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            file_name: file_name.into(),
        }
    }

    /// HKDF info string, also used as AEAD associated data.
    pub fn info(&self) -> Vec<u8> {
        format!("shardwarden/file-key/v1|{}|{}", self.file_id, self.file_name).into_bytes()
    }
}

/// Output of [`encrypt`].
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    pub ciphertext: Vec<u8>,
    pub iv: [u8; IV_LEN],
    pub tag: [u8; TAG_LEN],
    pub salt: [u8; SALT_LEN],
}

impl fmt::Debug for EncryptedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedBlob")
            .field("ciphertext_len", &self.ciphertext.len())
            .field("iv", &hex::encode(self.iv))
            .field("tag", &hex::encode(self.tag))
            .field("salt", &hex::encode(self.salt))
            .finish()
    }
}

/// Expand `ikm` into a 32-byte key with HKDF-SHA256.
pub fn hkdf_sha256(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(info, &mut okm[..])
        .map_err(|e| Error::EncryptionFailed(format!("HKDF expand failed: {}", e)))?;
    Ok(okm)
}

/// Derive the per-file key from the master key.
pub fn derive_file_key(
    master: &MasterKey,
    salt: &[u8; SALT_LEN],
    context: &FileContext,
) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    hkdf_sha256(master.as_bytes(), salt, &context.info())
}

/// AES-256-GCM with a detached tag. Returns the tag.
pub fn seal(key: &[u8; KEY_LEN], iv: &[u8; IV_LEN], aad: &[u8], buffer: &mut [u8]) -> Result<[u8; TAG_LEN]> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::EncryptionFailed(format!("invalid key length: {}", e)))?;
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(iv), aad, buffer)
        .map_err(|_| Error::EncryptionFailed("AES-GCM encryption failed".into()))?;

    let mut out = [0u8; TAG_LEN];
    out.copy_from_slice(&tag);
    Ok(out)
}

/// Inverse of [`seal`]. On tag mismatch the buffer contents are unspecified
/// and must be discarded.
pub fn open(
    key: &[u8; KEY_LEN],
    iv: &[u8; IV_LEN],
    aad: &[u8],
    buffer: &mut [u8],
    tag: &[u8; TAG_LEN],
) -> Result<()> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::EncryptionFailed(format!("invalid key length: {}", e)))?;
    cipher
        .decrypt_in_place_detached(Nonce::from_slice(iv), aad, buffer, Tag::from_slice(tag))
        .map_err(|_| Error::DecryptionFailed)
}

/// Encrypt a file under a key derived for `context`.
pub fn encrypt(master: &MasterKey, context: &FileContext, plaintext: &[u8]) -> Result<EncryptedBlob> {
    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut iv);

    let key = derive_file_key(master, &salt, context)?;
    let mut ciphertext = plaintext.to_vec();
    let tag = seal(&key, &iv, &context.info(), &mut ciphertext)?;

    Ok(EncryptedBlob {
        ciphertext,
        iv,
        tag,
        salt,
    })
}

/// Decrypt a blob. Any authentication failure yields `DecryptionFailed`
/// and no plaintext.
pub fn decrypt(master: &MasterKey, context: &FileContext, blob: &EncryptedBlob) -> Result<Vec<u8>> {
    let key = derive_file_key(master, &blob.salt, context)?;
    let mut plaintext = blob.ciphertext.clone();
    if let Err(e) = open(&key, &blob.iv, &context.info(), &mut plaintext, &blob.tag) {
        zeroize::Zeroize::zeroize(&mut plaintext);
        return Err(e);
    }
    Ok(plaintext)
}

/// Lowercase hex SHA-256.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Decode a fixed-size hex field from a manifest.
pub fn decode_hex_array<const N: usize>(field: &str, value: &str) -> Result<[u8; N]> {
    let bytes = hex::decode(value)
        .map_err(|e| Error::integrity(field, format!("not valid hex: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| Error::integrity(field, format!("expected {} bytes", N)))
}
