use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use jemima_pack_core::{KdfParams, DEFAULT_PBKDF2_ITERATIONS};
use serde::Deserialize;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::pool::PackPool;

/// Placeholder shared secret. Packs sealed with it are obfuscated, not protected.
pub const DEFAULT_PASSWORD: &str = "DEMO-ONLY";
pub const DEFAULT_QUESTION_TEMPLATE: &str = "AAA-questions.json";
pub const DEFAULT_MATHS_TEMPLATE: &str = "AAA-maths.json";

/// Password wrapper that is wiped on drop and never printed.
#[derive(Clone, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct Secret {
    value: String,
}

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self { value: value.into() }
    }

    #[must_use]
    pub fn expose(&self) -> &[u8] {
        self.value.as_bytes()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secret").field("value", &"[REDACTED]").finish()
    }
}

/// Settings shared by every pack operation. Loaded from a YAML or JSON
/// file; missing keys take their defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PackConfig {
    pub password: Secret,
    pub pbkdf2_iterations: u32,
    /// Pool root holding `new/`, `used/`, the assignment lock and the claim index.
    pub pool_dir: PathBuf,
    pub templates_dir: PathBuf,
    pub question_template: String,
    pub maths_template: String,
    pub rooms_db: PathBuf,
    /// Treat an integrity mismatch during assignment as fatal.
    pub strict_integrity: bool,
}

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            password: Secret::new(DEFAULT_PASSWORD),
            pbkdf2_iterations: DEFAULT_PBKDF2_ITERATIONS,
            pool_dir: PathBuf::from("packs"),
            templates_dir: PathBuf::from("."),
            question_template: DEFAULT_QUESTION_TEMPLATE.to_string(),
            maths_template: DEFAULT_MATHS_TEMPLATE.to_string(),
            rooms_db: PathBuf::from("rooms.sqlite3"),
            strict_integrity: true,
        }
    }
}

impl PackConfig {
    /// # Errors
    /// Returns an error when the file cannot be read, parsed or fails [`PackConfig::validate`].
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error for an empty password or an out-of-range iteration count.
    pub fn validate(&self) -> Result<()> {
        if self.password.is_empty() {
            return Err(anyhow!("password must not be empty"));
        }
        self.kdf()?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when `pbkdf2_iterations` is zero or above the accepted ceiling.
    pub fn kdf(&self) -> Result<KdfParams> {
        KdfParams::new(self.pbkdf2_iterations).map_err(|err| anyhow!("invalid pbkdf2_iterations: {err}"))
    }

    #[must_use]
    pub fn pool(&self) -> PackPool {
        PackPool::new(&self.pool_dir)
    }

    #[must_use]
    pub fn question_template_path(&self) -> PathBuf {
        self.templates_dir.join(&self.question_template)
    }

    #[must_use]
    pub fn maths_template_path(&self) -> PathBuf {
        self.templates_dir.join(&self.maths_template)
    }
}
