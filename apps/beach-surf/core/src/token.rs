//! Signed session tokens.
//!
//! A token has three dot-separated segments: the id of the key that signed
//! it, the base64url payload, and the base64url HMAC-SHA256 tag computed over
//! `"{key_id}.{payload}"`. Nothing is stored server-side; whatever the token
//! carries is everything the connected phase gets to see.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use serde::{de::DeserializeOwned, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const SEGMENT_SEPARATOR: char = '.';

/// Errors returned while checking a token presented on upgrade.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerificationError {
    #[error("malformed token: {0}")]
    Malformed(&'static str),
    #[error("token signature does not match its content")]
    SignatureMismatch,
    #[error("token signed with unknown key {0}")]
    UnknownKey(String),
}

impl VerificationError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            VerificationError::Malformed(_) => "malformed",
            VerificationError::SignatureMismatch => "signature_mismatch",
            VerificationError::UnknownKey(_) => "unknown_key",
        }
    }
}

#[derive(Debug, Error)]
pub enum SignError {
    #[error("payload is not serializable: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyringError {
    #[error("at least one signing key is required")]
    Empty,
    #[error("signing key id must be non-empty and must not contain '.': {0:?}")]
    InvalidKeyId(String),
    #[error("signing key {0} has an empty secret")]
    EmptySecret(String),
    #[error("signing key id {0} is configured more than once")]
    DuplicateKeyId(String),
}

#[derive(Clone)]
struct SigningKey {
    id: String,
    mac: HmacSha256,
}

/// Ordered set of signing keys. The first key signs; every key verifies.
///
/// Keeping retired keys after the active one lets tokens embedded in pages
/// rendered before a rotation still upgrade.
#[derive(Clone)]
pub struct Keyring {
    keys: Vec<SigningKey>,
}

impl fmt::Debug for Keyring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keyring")
            .field("active", &self.active_key_id())
            .field("key_ids", &self.key_ids().collect::<Vec<_>>())
            .finish()
    }
}

impl Keyring {
    pub fn new<I, K, S>(entries: I) -> Result<Self, KeyringError>
    where
        I: IntoIterator<Item = (K, S)>,
        K: Into<String>,
        S: AsRef<[u8]>,
    {
        let mut keys: Vec<SigningKey> = Vec::new();
        for (id, secret) in entries {
            let id = id.into();
            if id.is_empty() || id.contains(SEGMENT_SEPARATOR) {
                return Err(KeyringError::InvalidKeyId(id));
            }
            let secret = secret.as_ref();
            if secret.is_empty() {
                return Err(KeyringError::EmptySecret(id));
            }
            if keys.iter().any(|key| key.id == id) {
                return Err(KeyringError::DuplicateKeyId(id));
            }
            let mac = HmacSha256::new_from_slice(secret)
                .map_err(|_| KeyringError::EmptySecret(id.clone()))?;
            keys.push(SigningKey { id, mac });
        }

        if keys.is_empty() {
            return Err(KeyringError::Empty);
        }
        Ok(Self { keys })
    }

    /// Convenience for a single active key.
    pub fn single(id: impl Into<String>, secret: impl AsRef<[u8]>) -> Result<Self, KeyringError> {
        Self::new([(id.into(), secret)])
    }

    pub fn active_key_id(&self) -> &str {
        // `new` rejects empty key lists.
        &self.keys[0].id
    }

    pub fn key_ids(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(|key| key.id.as_str())
    }

    pub fn sign<T: Serialize + ?Sized>(&self, payload: &T) -> Result<String, SignError> {
        let key = &self.keys[0];
        let bytes = serde_json::to_vec(payload)?;
        let encoded = URL_SAFE_NO_PAD.encode(bytes);
        let tag = tag(key, &encoded);
        Ok(format!(
            "{id}{sep}{encoded}{sep}{tag}",
            id = key.id,
            sep = SEGMENT_SEPARATOR,
            tag = URL_SAFE_NO_PAD.encode(tag)
        ))
    }

    /// Resolves the key, then checks the tag against the exact text that was
    /// signed. Anything after the second separator is taken as the tag, so
    /// once the key id and both separators are intact, any alteration of the
    /// payload or tag text is a signature mismatch. The payload is only
    /// decoded after the tag matches.
    pub fn verify<T: DeserializeOwned>(&self, token: &str) -> Result<T, VerificationError> {
        let mut segments = token.splitn(3, SEGMENT_SEPARATOR);
        let (Some(key_id), Some(encoded), Some(signature)) =
            (segments.next(), segments.next(), segments.next())
        else {
            return Err(VerificationError::Malformed("expected three segments"));
        };
        if key_id.is_empty() {
            return Err(VerificationError::Malformed("empty key id"));
        }

        let key = self
            .keys
            .iter()
            .find(|key| key.id == key_id)
            .ok_or_else(|| VerificationError::UnknownKey(key_id.to_string()))?;

        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| VerificationError::SignatureMismatch)?;
        let mut mac = key.mac.clone();
        mac.update(key_id.as_bytes());
        mac.update(&[SEGMENT_SEPARATOR as u8]);
        mac.update(encoded.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| VerificationError::SignatureMismatch)?;

        let payload = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| VerificationError::Malformed("payload is not base64url"))?;
        serde_json::from_slice(&payload)
            .map_err(|_| VerificationError::Malformed("payload does not match expected shape"))
    }
}

fn tag(key: &SigningKey, encoded: &str) -> Vec<u8> {
    let mut mac = key.mac.clone();
    mac.update(key.id.as_bytes());
    mac.update(&[SEGMENT_SEPARATOR as u8]);
    mac.update(encoded.as_bytes());
    mac.finalize().into_bytes().to_vec()
}
