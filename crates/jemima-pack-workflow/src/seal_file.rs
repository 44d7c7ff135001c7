//! Single-file tooling around the envelope: seal an authored pack, audit a
//! sealed file, and bulk-seal a directory of JSON files.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use jemima_pack_core::{
    integrity, parse_document, prepare_plaintext, seal, to_canonical_bytes, unseal_bytes, validate, validate_maths,
    PackKind,
};
use serde::Serialize;
use serde_json::{Map, Value};
use time::OffsetDateTime;
use tracing::info;

use crate::config::PackConfig;
use crate::files::{file_name, write_new};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SealReport {
    pub output: String,
    pub kind: PackKind,
    pub version: String,
    pub room_code: String,
    pub generated_at: String,
    pub checksum: String,
}

/// `<ROOM>-questions.sealed`, `<ROOM>-maths.sealed` or `<ROOM>.sealed`.
#[must_use]
pub fn default_sealed_name(room_code: &str, kind: PackKind) -> String {
    match kind {
        PackKind::Questions => format!("{room_code}-questions.sealed"),
        PackKind::MathsChain | PackKind::MathsTimeline => format!("{room_code}-maths.sealed"),
        PackKind::Combined => format!("{room_code}.sealed"),
    }
}

/// Normalize, stamp and seal the pack at `input`. Without `output` the
/// sealed file lands next to the input under [`default_sealed_name`].
/// An existing sealed file is never replaced.
///
/// # Errors
/// Returns an error when the input is unreadable or invalid, or the
/// output exists or cannot be written.
pub fn seal_pack_file(
    config: &PackConfig,
    input: &Path,
    output: Option<&Path>,
    now: OffsetDateTime,
) -> Result<SealReport> {
    let bytes = fs::read(input).with_context(|| format!("failed to read {}", input.display()))?;
    let value: Value =
        serde_json::from_slice(&bytes).with_context(|| format!("{} is not valid JSON", input.display()))?;
    let (pack, plaintext) =
        prepare_plaintext(value, now).with_context(|| format!("{} failed validation", input.display()))?;

    let room_code = pack.room_code().unwrap_or_default().to_string();
    let output = output.map_or_else(
        || input.with_file_name(default_sealed_name(&room_code, pack.kind())),
        Path::to_path_buf,
    );
    let envelope = seal(&plaintext, config.password.expose(), config.kdf()?)?;
    write_new(&output, &envelope.to_pretty_json()?)
        .with_context(|| format!("failed to write {}", output.display()))?;
    info!(output = %output.display(), kind = pack.kind().as_str(), "pack sealed");

    Ok(SealReport {
        output: output.display().to_string(),
        kind: pack.kind(),
        version: pack.kind().version().to_string(),
        generated_at: pack.generated_at().unwrap_or_default().to_string(),
        checksum: integrity::stored_checksum(pack.document()).unwrap_or_default().to_string(),
        room_code,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditMeta {
    pub room_code: Option<String>,
    pub generated_at: Option<String>,
}

/// What a sealed file holds. Problems with the content are reported as
/// fields rather than errors; only an unopenable envelope is an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub file: String,
    pub version: Option<String>,
    pub meta: AuditMeta,
    pub kind: Option<PackKind>,
    pub rounds_count: usize,
    pub items_total: usize,
    pub maths_ok: bool,
    pub checksum_ok: bool,
    /// First schema violation, if any.
    pub schema_error: Option<String>,
}

/// # Errors
/// Returns an error when the file cannot be read or decrypted, or its
/// plaintext is not a JSON object.
pub fn audit_sealed_file(config: &PackConfig, path: &Path) -> Result<AuditReport> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let plaintext = unseal_bytes(&bytes, config.password.expose())
        .with_context(|| format!("failed to open {}", path.display()))?;
    let document = parse_document(&plaintext).with_context(|| format!("{} holds no pack", path.display()))?;

    let text = |value: Option<&Value>| value.and_then(Value::as_str).map(str::to_string);
    let meta = document.get("meta");
    let (rounds_count, items_total) = count_rounds(document.get("rounds"));
    let schema = validate(&document);
    Ok(AuditReport {
        file: file_name(path),
        version: text(document.get("version")),
        meta: AuditMeta {
            room_code: text(meta.and_then(|meta| meta.get("roomCode"))),
            generated_at: text(meta.and_then(|meta| meta.get("generatedAt"))),
        },
        kind: schema.as_ref().ok().copied().or_else(|| PackKind::detect(&document).ok()),
        rounds_count,
        items_total,
        maths_ok: document.get("maths").is_some_and(|maths| validate_maths(maths).is_ok()),
        checksum_ok: integrity::verify(&document),
        schema_error: schema.err().map(|err| err.to_string()),
    })
}

/// Rounds may be keyed by number or listed; items are counted on both sides.
fn count_rounds(rounds: Option<&Value>) -> (usize, usize) {
    let rounds: Vec<&Value> = match rounds {
        Some(Value::Object(rounds)) => rounds.values().collect(),
        Some(Value::Array(rounds)) => rounds.iter().collect(),
        _ => Vec::new(),
    };
    let count = rounds.len();
    let items = rounds
        .into_iter()
        .flat_map(|round| ["hostItems", "guestItems"].map(|side| round.get(side)))
        .map(|side| side.and_then(Value::as_array).map_or(0, Vec::len))
        .sum();
    (count, items)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SealedFile {
    pub source: String,
    pub output: String,
    pub kept_source: bool,
}

/// Seal every `*.json` file directly inside `dir` to a sibling `.sealed`
/// file, recording the source name in the envelope. Sources are removed
/// unless `keep_json` is set.
///
/// # Errors
/// Returns an error before sealing anything when a `.sealed` sibling
/// already exists. Otherwise fails on the first file that is not valid
/// JSON or cannot be written; files sealed before it stay sealed.
pub fn seal_directory(config: &PackConfig, dir: &Path, keep_json: bool) -> Result<Vec<SealedFile>> {
    let kdf = config.kdf()?;
    let mut sources: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("failed to list {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    sources.sort();
    if let Some(existing) =
        sources.iter().map(|source| source.with_extension("sealed")).find(|output| output.exists())
    {
        bail!("{} already exists; sealed files are never replaced", existing.display());
    }

    let mut sealed = Vec::with_capacity(sources.len());
    for source in sources {
        let bytes = fs::read(&source).with_context(|| format!("failed to read {}", source.display()))?;
        let value: Value =
            serde_json::from_slice(&bytes).with_context(|| format!("{} is not valid JSON", source.display()))?;
        let mut envelope = seal(&to_canonical_bytes(&value), config.password.expose(), kdf)?;
        let source_name = file_name(&source);
        envelope.original = Some(source_name.clone());

        let output = source.with_extension("sealed");
        write_new(&output, &envelope.to_pretty_json()?)
            .with_context(|| format!("failed to write {}", output.display()))?;
        if !keep_json {
            fs::remove_file(&source).with_context(|| format!("failed to remove {}", source.display()))?;
        }
        info!(source = %source_name, "sealed");
        sealed.push(SealedFile { source: source_name, output: file_name(&output), kept_source: keep_json });
    }
    Ok(sealed)
}

/// Decrypt a sealed file back into its JSON document.
///
/// # Errors
/// Returns an error when the file cannot be read, decrypted or parsed.
pub fn open_sealed_document(config: &PackConfig, path: &Path) -> Result<Map<String, Value>> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let plaintext = unseal_bytes(&bytes, config.password.expose())
        .with_context(|| format!("failed to open {}", path.display()))?;
    Ok(parse_document(&plaintext)?)
}
