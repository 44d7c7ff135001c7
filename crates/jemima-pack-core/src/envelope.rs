//! Password-sealed envelope: PBKDF2-HMAC-SHA256 key derivation feeding
//! AES-256-GCM, serialized as a small JSON object with base64 fields.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::EnvelopeError;

pub const ALG_AES_GCM: &str = "AES-GCM";
/// Algorithm label written by older sealing tools, which carried the
/// iteration count in `pbkdf2_iterations` instead of the `pbkdf2` tag.
pub const ALG_LEGACY: &str = "aes-256-gcm+pbkdf2-sha256";
pub const KDF_TAG_PREFIX: &str = "PBKDF2-HMAC-SHA256/";
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 150_000;
pub const MAX_PBKDF2_ITERATIONS: u32 = 10_000_000;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self { iterations: DEFAULT_PBKDF2_ITERATIONS }
    }
}

impl KdfParams {
    /// # Errors
    /// Returns [`EnvelopeError::Format`] when the count is zero or above the accepted ceiling.
    pub fn new(iterations: u32) -> Result<Self, EnvelopeError> {
        if iterations == 0 || iterations > MAX_PBKDF2_ITERATIONS {
            return Err(EnvelopeError::Format(format!(
                "pbkdf2 iteration count {iterations} outside 1..={MAX_PBKDF2_ITERATIONS}"
            )));
        }
        Ok(Self { iterations })
    }

    #[must_use]
    pub fn tag(self) -> String {
        format!("{KDF_TAG_PREFIX}{}", self.iterations)
    }

    /// Parse a `PBKDF2-HMAC-SHA256/<n>` tag.
    ///
    /// # Errors
    /// Returns [`EnvelopeError::Format`] for any other shape.
    pub fn parse_tag(tag: &str) -> Result<Self, EnvelopeError> {
        let count = tag
            .strip_prefix(KDF_TAG_PREFIX)
            .ok_or_else(|| EnvelopeError::Format(format!("unsupported pbkdf2 tag '{tag}'")))?;
        let iterations = count
            .parse::<u32>()
            .map_err(|_| EnvelopeError::Format(format!("invalid pbkdf2 iteration count in '{tag}'")))?;
        Self::new(iterations)
    }
}

/// On-disk shape of a sealed pack. Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedEnvelope {
    #[serde(default)]
    pub alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pbkdf2: Option<String>,
    #[serde(default)]
    pub salt_b64: String,
    #[serde(default)]
    pub nonce_b64: String,
    #[serde(default)]
    pub ct_b64: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pbkdf2_iterations: Option<u32>,
    /// Source file name, recorded by directory sealing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original: Option<String>,
}

impl SealedEnvelope {
    /// # Errors
    /// Returns [`EnvelopeError::Format`] when the bytes are not an envelope object.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes)
            .map_err(|err| EnvelopeError::Format(format!("envelope is not valid JSON: {err}")))
    }

    /// Pretty-printed JSON with a trailing newline, as written to disk.
    ///
    /// # Errors
    /// Returns [`EnvelopeError::Format`] if serialization fails.
    pub fn to_pretty_json(&self) -> Result<Vec<u8>, EnvelopeError> {
        let mut bytes = serde_json::to_vec_pretty(self)
            .map_err(|err| EnvelopeError::Format(format!("failed to encode envelope: {err}")))?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Key derivation parameters, honoring both the current tag and the
    /// legacy `pbkdf2_iterations` field.
    ///
    /// # Errors
    /// Returns [`EnvelopeError::Format`] for an unknown algorithm or bad parameters.
    pub fn kdf_params(&self) -> Result<KdfParams, EnvelopeError> {
        match self.alg.as_str() {
            ALG_AES_GCM | ALG_LEGACY => {}
            "" => return Err(EnvelopeError::Format("missing alg".to_string())),
            other => return Err(EnvelopeError::Format(format!("unsupported alg '{other}'"))),
        }
        match (&self.pbkdf2, self.pbkdf2_iterations) {
            (Some(tag), _) => KdfParams::parse_tag(tag),
            (None, Some(iterations)) => KdfParams::new(iterations),
            (None, None) => Err(EnvelopeError::Format("missing pbkdf2 parameters".to_string())),
        }
    }
}

/// Seal `plaintext` under `password` with a fresh salt and nonce.
///
/// # Errors
/// Returns [`EnvelopeError::Format`] for out-of-range parameters and
/// [`EnvelopeError::Encryption`] if the cipher fails.
pub fn seal(plaintext: &[u8], password: &[u8], kdf: KdfParams) -> Result<SealedEnvelope, EnvelopeError> {
    let kdf = KdfParams::new(kdf.iterations)?;
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let key = derive_key(password, &salt, kdf.iterations);
    let cipher = Aes256Gcm::new_from_slice(key.as_slice())
        .map_err(|err| EnvelopeError::Encryption(err.to_string()))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|err| EnvelopeError::Encryption(err.to_string()))?;

    Ok(SealedEnvelope {
        alg: ALG_AES_GCM.to_string(),
        pbkdf2: Some(kdf.tag()),
        salt_b64: general_purpose::STANDARD.encode(salt),
        nonce_b64: general_purpose::STANDARD.encode(nonce_bytes),
        ct_b64: general_purpose::STANDARD.encode(ciphertext),
        pbkdf2_iterations: None,
        original: None,
    })
}

/// Recover the plaintext of a sealed envelope.
///
/// # Errors
/// Returns [`EnvelopeError::Format`] for structural problems and
/// [`EnvelopeError::Authentication`] when the tag does not verify.
pub fn unseal(envelope: &SealedEnvelope, password: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let kdf = envelope.kdf_params()?;
    let salt = decode_field("salt_b64", &envelope.salt_b64)?;
    let nonce_bytes = decode_field("nonce_b64", &envelope.nonce_b64)?;
    let ciphertext = decode_field("ct_b64", &envelope.ct_b64)?;

    if salt.len() < SALT_LEN {
        return Err(EnvelopeError::Format(format!(
            "salt must be at least {SALT_LEN} bytes, found {}",
            salt.len()
        )));
    }
    if nonce_bytes.len() != NONCE_LEN {
        return Err(EnvelopeError::Format(format!(
            "nonce must be {NONCE_LEN} bytes, found {}",
            nonce_bytes.len()
        )));
    }
    if ciphertext.len() < TAG_LEN {
        return Err(EnvelopeError::Format(format!(
            "ciphertext shorter than the {TAG_LEN}-byte authentication tag"
        )));
    }

    let key = derive_key(password, &salt, kdf.iterations);
    let cipher = Aes256Gcm::new_from_slice(key.as_slice())
        .map_err(|err| EnvelopeError::Format(err.to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
        .map_err(|_| EnvelopeError::Authentication)
}

/// Parse envelope JSON and unseal it in one step.
///
/// # Errors
/// See [`SealedEnvelope::from_json_slice`] and [`unseal`].
pub fn unseal_bytes(envelope_json: &[u8], password: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    unseal(&SealedEnvelope::from_json_slice(envelope_json)?, password)
}

fn derive_key(password: &[u8], salt: &[u8], iterations: u32) -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut key[..]);
    key
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, EnvelopeError> {
    if value.is_empty() {
        return Err(EnvelopeError::Format(format!("missing {name}")));
    }
    general_purpose::STANDARD
        .decode(value)
        .map_err(|err| EnvelopeError::Format(format!("{name} is not valid base64: {err}")))
}
