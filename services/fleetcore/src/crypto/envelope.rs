//! Wire format for encrypted secrets.
//!
//! Two shapes exist and are parsed by separate branches:
//! - versioned: `<version>:<iv-hex>:<tag-hex>:<ciphertext-hex>`
//! - legacy: `<iv-hex>:<tag-hex>:<ciphertext-hex>`, implicitly version 1
//!
//! Parsing never touches key material; it only checks shape, hex, and
//! field lengths.
use super::{CryptoError, CryptoResult};

/// Version implied by the unversioned shape.
pub const LEGACY_VERSION: u8 = 1;
/// Version written by every new encryption.
pub const CURRENT_VERSION: u8 = 2;
/// Versions this build can decrypt.
pub const SUPPORTED_VERSIONS: &[u8] = &[LEGACY_VERSION, CURRENT_VERSION];

pub const IV_LEN: usize = 16;
pub const TAG_LEN: usize = 16;

const SEPARATOR: char = ':';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeShape {
    Versioned,
    Legacy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub version: u8,
    pub shape: EnvelopeShape,
    pub iv: [u8; IV_LEN],
    pub tag: [u8; TAG_LEN],
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    /// Parse either shape.
    ///
    /// # Errors
    /// - [`CryptoError::InvalidFormat`] for a wrong field count, bad hex, or
    ///   wrong IV/tag length.
    /// - [`CryptoError::UnsupportedVersion`] for a well-formed version tag
    ///   outside [`SUPPORTED_VERSIONS`].
    pub fn parse(raw: &str) -> CryptoResult<Self> {
        let parts: Vec<&str> = raw.split(SEPARATOR).collect();
        match parts.as_slice() {
            [version, iv, tag, ciphertext] => {
                let version = parse_version(version)?;
                Self::from_hex_parts(version, EnvelopeShape::Versioned, iv, tag, ciphertext)
            }
            [iv, tag, ciphertext] => {
                Self::from_hex_parts(LEGACY_VERSION, EnvelopeShape::Legacy, iv, tag, ciphertext)
            }
            _ => Err(CryptoError::InvalidFormat(format!(
                "expected 3 or 4 fields, found {}",
                parts.len()
            ))),
        }
    }

    /// Classify the shape of `raw` without validating hex or lengths.
    pub fn shape_of(raw: &str) -> Option<EnvelopeShape> {
        let parts: Vec<&str> = raw.split(SEPARATOR).collect();
        match parts.as_slice() {
            [version, _, _, _] if is_version_tag(version) => Some(EnvelopeShape::Versioned),
            [iv, _, _] if iv.len() == IV_LEN * 2 => Some(EnvelopeShape::Legacy),
            _ => None,
        }
    }

    fn from_hex_parts(
        version: u8,
        shape: EnvelopeShape,
        iv: &str,
        tag: &str,
        ciphertext: &str,
    ) -> CryptoResult<Self> {
        let iv: [u8; IV_LEN] = decode_fixed(iv, "iv")?;
        let tag: [u8; TAG_LEN] = decode_fixed(tag, "auth tag")?;
        let ciphertext = hex::decode(ciphertext)
            .map_err(|_| CryptoError::InvalidFormat("ciphertext is not hex".into()))?;
        if ciphertext.is_empty() {
            return Err(CryptoError::InvalidFormat("empty ciphertext".into()));
        }
        Ok(Self {
            version,
            shape,
            iv,
            tag,
            ciphertext,
        })
    }

    /// Render in the versioned shape.
    pub fn encode(&self) -> String {
        format!(
            "{}{SEPARATOR}{}{SEPARATOR}{}{SEPARATOR}{}",
            self.version,
            hex::encode(self.iv),
            hex::encode(self.tag),
            hex::encode(&self.ciphertext)
        )
    }

    /// Render in the unversioned legacy shape.
    ///
    /// Only meaningful for version 1 payloads; used to produce fixtures for
    /// rolling-migration checks.
    pub fn encode_legacy(&self) -> String {
        format!(
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            hex::encode(self.iv),
            hex::encode(self.tag),
            hex::encode(&self.ciphertext)
        )
    }
}

fn is_version_tag(value: &str) -> bool {
    !value.is_empty() && value.len() <= 3 && value.bytes().all(|b| b.is_ascii_digit())
}

fn parse_version(value: &str) -> CryptoResult<u8> {
    if !is_version_tag(value) {
        return Err(CryptoError::InvalidFormat("malformed version tag".into()));
    }
    let version: u8 = value
        .parse()
        .map_err(|_| CryptoError::UnsupportedVersion(value.to_string()))?;
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(CryptoError::UnsupportedVersion(value.to_string()));
    }
    Ok(version)
}

fn decode_fixed<const N: usize>(value: &str, label: &str) -> CryptoResult<[u8; N]> {
    let bytes =
        hex::decode(value).map_err(|_| CryptoError::InvalidFormat(format!("{label} is not hex")))?;
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidFormat(format!("{label} must be {N} bytes")))
}
