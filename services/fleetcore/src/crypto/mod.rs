//! At-rest encryption for tenant secrets.
//!
//! # Purpose
//! Encrypts bot credentials and other tenant secrets into self-describing
//! envelopes (see [`envelope`]) and decrypts them at the point of use.
//!
//! # Key invariants
//! - AES-256-GCM with a fresh random 16-byte IV per call and a 16-byte tag.
//! - The 256-bit key is derived once, at construction, with scrypt over
//!   `(master secret, installation salt)`. Two installations sharing a master
//!   secret but not a salt cannot read each other's envelopes.
//! - New envelopes always carry [`envelope::CURRENT_VERSION`]; the legacy
//!   unversioned shape is accepted on read only.
//! - A failed tag check is reported as [`CryptoError::AuthenticationFailed`]
//!   and is never folded into another error kind.
//!
//! # Security model
//! Plaintext, envelopes, and key material are never logged. `Debug` on the
//! service and its settings redacts secrets.
//!
//! # Concurrency model
//! The service is immutable after construction and is shared as
//! `Arc<EncryptionService>`. Key derivation is CPU-heavy; async callers use
//! [`EncryptionService::derive`], which runs it on the blocking pool.
pub mod envelope;

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce, Tag};
use envelope::{CURRENT_VERSION, Envelope, EnvelopeShape, IV_LEN};
use rand::RngCore;
use rand::rngs::OsRng;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// AES-256-GCM with a 128-bit IV.
type Cipher = AesGcm<Aes256, U16>;

pub const KEY_LEN: usize = 32;
pub const MIN_MASTER_KEY_LEN: usize = 16;
pub const MIN_SALT_LEN: usize = 8;
/// scrypt cost parameter (log2 N) used when none is configured.
pub const DEFAULT_KDF_LOG_N: u8 = 14;
const KDF_R: u32 = 8;
const KDF_P: u32 = 1;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("cannot encrypt an empty value")]
    EmptyInput,
    #[error("invalid envelope format: {0}")]
    InvalidFormat(String),
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(String),
    #[error("authentication failed: ciphertext was tampered with or the key is wrong")]
    AuthenticationFailed,
    #[error("missing configuration: {0}")]
    MissingConfiguration(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
}

pub type CryptoResult<T> = Result<T, CryptoError>;

/// Inputs for key derivation.
#[derive(Clone)]
pub struct EncryptionSettings {
    pub master_key: String,
    pub installation_salt: String,
    pub kdf_log_n: u8,
}

impl EncryptionSettings {
    pub fn new(master_key: impl Into<String>, installation_salt: impl Into<String>) -> Self {
        Self {
            master_key: master_key.into(),
            installation_salt: installation_salt.into(),
            kdf_log_n: DEFAULT_KDF_LOG_N,
        }
    }

    pub fn with_kdf_log_n(mut self, log_n: u8) -> Self {
        self.kdf_log_n = log_n;
        self
    }

    fn validate(&self) -> CryptoResult<()> {
        if self.master_key.is_empty() {
            return Err(CryptoError::MissingConfiguration(
                "encryption master key".into(),
            ));
        }
        if self.master_key.chars().count() < MIN_MASTER_KEY_LEN {
            return Err(CryptoError::InvalidConfiguration(format!(
                "encryption master key must be at least {MIN_MASTER_KEY_LEN} characters"
            )));
        }
        if self.installation_salt.is_empty() {
            return Err(CryptoError::MissingConfiguration("installation salt".into()));
        }
        if self.installation_salt.chars().count() < MIN_SALT_LEN {
            return Err(CryptoError::InvalidConfiguration(format!(
                "installation salt must be at least {MIN_SALT_LEN} characters"
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for EncryptionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionSettings")
            .field("master_key", &"<redacted>")
            .field("installation_salt", &"<redacted>")
            .field("kdf_log_n", &self.kdf_log_n)
            .finish()
    }
}

/// Versioned authenticated encryption of secret strings.
///
/// # Example
/// ```rust
/// use fleetcore::crypto::{EncryptionService, EncryptionSettings};
///
/// let settings = EncryptionSettings::new("an-example-master-key", "install-salt").with_kdf_log_n(10);
/// let service = EncryptionService::from_settings(&settings).unwrap();
/// let envelope = service.encrypt("bot-token").unwrap();
/// assert!(envelope.starts_with("2:"));
/// assert_eq!(service.decrypt(&envelope).unwrap(), "bot-token");
/// ```
pub struct EncryptionService {
    cipher: Cipher,
}

impl fmt::Debug for EncryptionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionService")
            .field("version", &CURRENT_VERSION)
            .finish_non_exhaustive()
    }
}

impl EncryptionService {
    /// Build a service with the default KDF cost.
    pub fn new(master_key: &str, installation_salt: &str) -> CryptoResult<Self> {
        Self::from_settings(&EncryptionSettings::new(master_key, installation_salt))
    }

    /// Validate settings and derive the key synchronously.
    ///
    /// # Errors
    /// - [`CryptoError::MissingConfiguration`] when the master key or salt is
    ///   absent; [`CryptoError::InvalidConfiguration`] when too short.
    /// - [`CryptoError::KeyDerivation`] for invalid scrypt parameters.
    pub fn from_settings(settings: &EncryptionSettings) -> CryptoResult<Self> {
        settings.validate()?;
        let key = derive_key(settings)?;
        let cipher = Cipher::new_from_slice(&key)
            .map_err(|_| CryptoError::KeyDerivation("derived key has wrong length".into()))?;
        Ok(Self { cipher })
    }

    /// Derive the key on the blocking pool and return a shareable handle.
    pub async fn derive(settings: EncryptionSettings) -> CryptoResult<Arc<Self>> {
        tokio::task::spawn_blocking(move || Self::from_settings(&settings))
            .await
            .map_err(|err| CryptoError::KeyDerivation(format!("derivation task failed: {err}")))?
            .map(Arc::new)
    }

    /// Encrypt `plaintext` into a current-version envelope.
    ///
    /// # Errors
    /// - [`CryptoError::EmptyInput`] when `plaintext` is empty.
    pub fn encrypt(&self, plaintext: &str) -> CryptoResult<String> {
        if plaintext.is_empty() {
            return Err(CryptoError::EmptyInput);
        }
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        let mut buffer = plaintext.as_bytes().to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::<U16>::from_slice(&iv), b"", &mut buffer)
            .map_err(|_| CryptoError::InvalidFormat("plaintext too large".into()))?;
        let mut tag_bytes = [0u8; envelope::TAG_LEN];
        tag_bytes.copy_from_slice(tag.as_slice());
        Ok(Envelope {
            version: CURRENT_VERSION,
            shape: EnvelopeShape::Versioned,
            iv,
            tag: tag_bytes,
            ciphertext: buffer,
        }
        .encode())
    }

    /// Decrypt a versioned or legacy envelope.
    ///
    /// # Errors
    /// - [`CryptoError::InvalidFormat`] / [`CryptoError::UnsupportedVersion`]
    ///   from parsing.
    /// - [`CryptoError::AuthenticationFailed`] when the tag does not verify.
    pub fn decrypt(&self, raw: &str) -> CryptoResult<String> {
        let envelope = Envelope::parse(raw)?;
        self.open(envelope)
    }

    /// Decrypt and re-encrypt under the current version with a fresh IV.
    pub fn reencrypt(&self, raw: &str) -> CryptoResult<String> {
        let plaintext = self.decrypt(raw)?;
        self.encrypt(&plaintext)
    }

    fn open(&self, envelope: Envelope) -> CryptoResult<String> {
        let mut buffer = envelope.ciphertext;
        self.cipher
            .decrypt_in_place_detached(
                Nonce::<U16>::from_slice(&envelope.iv),
                b"",
                &mut buffer,
                Tag::<U16>::from_slice(&envelope.tag),
            )
            .map_err(|_| {
                metrics::counter!("fleetcore_crypto_auth_failures_total").increment(1);
                CryptoError::AuthenticationFailed
            })?;
        String::from_utf8(buffer)
            .map_err(|_| CryptoError::InvalidFormat("plaintext is not utf-8".into()))
    }
}

/// True when `raw` uses the unversioned legacy shape.
pub fn is_legacy_encryption(raw: &str) -> bool {
    Envelope::shape_of(raw) == Some(EnvelopeShape::Legacy)
}

/// True when `raw` should be rewritten by [`EncryptionService::reencrypt`].
pub fn needs_rotation(raw: &str) -> bool {
    match Envelope::shape_of(raw) {
        Some(EnvelopeShape::Legacy) => true,
        Some(EnvelopeShape::Versioned) => Envelope::parse(raw)
            .map(|env| env.version < CURRENT_VERSION)
            .unwrap_or(false),
        None => false,
    }
}

fn derive_key(settings: &EncryptionSettings) -> CryptoResult<[u8; KEY_LEN]> {
    let params = scrypt::Params::new(settings.kdf_log_n, KDF_R, KDF_P, KEY_LEN)
        .map_err(|err| CryptoError::KeyDerivation(err.to_string()))?;
    let mut key = [0u8; KEY_LEN];
    scrypt::scrypt(
        settings.master_key.as_bytes(),
        settings.installation_salt.as_bytes(),
        &params,
        &mut key,
    )
    .map_err(|err| CryptoError::KeyDerivation(err.to_string()))?;
    Ok(key)
}
