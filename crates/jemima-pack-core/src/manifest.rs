use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ValidationError;

pub const SOURCE_TEMPLATE_BACKFILL: &str = "backfill";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackType {
    Questions,
    Maths,
}

impl PackType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Questions => "questions",
            Self::Maths => "maths",
        }
    }

    /// File name prefix inside the pool.
    #[must_use]
    pub fn file_prefix(self) -> &'static str {
        match self {
            Self::Questions => "QPACK",
            Self::Maths => "MPACK",
        }
    }

    #[must_use]
    pub fn from_file_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "QPACK" => Some(Self::Questions),
            "MPACK" => Some(Self::Maths),
            _ => None,
        }
    }
}

/// Companion record written next to every sealed pool file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackManifest {
    #[serde(rename = "type")]
    pub pack_type: PackType,
    pub version: String,
    pub created_at: String,
    /// SHA-256 hex of the sealed file bytes.
    pub hash: String,
    pub filename: String,
    pub bytes: u64,
    pub source_template: String,
}

impl PackManifest {
    #[must_use]
    pub fn for_sealed_bytes(
        pack_type: PackType,
        version: &str,
        created_at: &str,
        filename: &str,
        sealed_bytes: &[u8],
        source_template: &str,
    ) -> Self {
        Self {
            pack_type,
            version: version.to_string(),
            created_at: created_at.to_string(),
            hash: sha256_hex(sealed_bytes),
            filename: filename.to_string(),
            bytes: u64::try_from(sealed_bytes.len()).unwrap_or(u64::MAX),
            source_template: source_template.to_string(),
        }
    }

    /// # Errors
    /// Returns [`ValidationError`] when the bytes are not a manifest object.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, ValidationError> {
        serde_json::from_slice(bytes)
            .map_err(|err| ValidationError::new("manifest", format!("invalid manifest: {err}")))
    }

    /// # Errors
    /// Returns [`ValidationError`] if serialization fails.
    pub fn to_pretty_json(&self) -> Result<Vec<u8>, ValidationError> {
        let mut bytes = serde_json::to_vec_pretty(self)
            .map_err(|err| ValidationError::new("manifest", format!("failed to encode: {err}")))?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Whether `sealed_bytes` are the bytes this manifest describes.
    #[must_use]
    pub fn matches(&self, sealed_bytes: &[u8]) -> bool {
        self.hash == sha256_hex(sealed_bytes)
    }

    #[must_use]
    pub fn provenance(&self) -> PackProvenance {
        PackProvenance {
            filename: self.filename.clone(),
            hash: self.hash.clone(),
            created_at: self.created_at.clone(),
            version: self.version.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackProvenance {
    pub filename: String,
    pub hash: String,
    pub created_at: String,
    pub version: String,
}

/// Where a seeded room's content came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedSource {
    pub room_code: String,
    pub assignment_id: String,
    pub assigned_at: String,
    pub question_pack: PackProvenance,
    pub maths_pack: PackProvenance,
}

#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
