//! Fill a pool directory with sealed packs made from the authored templates.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use jemima_pack_core::manifest::SOURCE_TEMPLATE_BACKFILL;
use jemima_pack_core::schema::{MATHS_CHAIN_VERSION, QUESTIONS_VERSION};
use jemima_pack_core::{
    normalize, parse_document, pool_key, seal, unseal_bytes, utc_timestamp, NormalizedPack, PackKind,
    PackManifest, PackType,
};
use serde::Serialize;
use serde_json::{Map, Value};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::config::PackConfig;
use crate::files::write_new;
use crate::pool::{pack_file_name, scan_dir, FileRole};

/// Room code every generated pack carries until assignment replaces it.
pub const GENERATION_ROOM_CODE: &str = "SEA";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedFile {
    pub key: String,
    #[serde(rename = "type")]
    pub pack_type: PackType,
    pub filename: String,
    pub version: String,
    pub source_template: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateReport {
    pub out_dir: String,
    pub created: Vec<GeneratedFile>,
    /// Manifests written for sealed files that had none.
    pub backfilled: Vec<String>,
}

/// Seal any missing half of every key in `out_dir`, or a fresh pair keyed
/// by `now` when nothing is missing, then backfill absent manifests.
/// Existing files are never overwritten.
///
/// # Errors
/// Returns an error when a template cannot be read or does not validate,
/// or a file cannot be written.
pub fn generate(config: &PackConfig, out_dir: &Path, now: OffsetDateTime) -> Result<GenerateReport> {
    config.validate()?;
    fs::create_dir_all(out_dir).with_context(|| format!("failed to create {}", out_dir.display()))?;

    let scanned = scan_dir(out_dir)?;
    let mut targets: Vec<(String, PackType)> = Vec::new();
    for (key, files) in &scanned {
        for pack_type in [PackType::Questions, PackType::Maths] {
            if files.get(pack_type, FileRole::Sealed).is_none() {
                targets.push((key.clone(), pack_type));
            }
        }
    }
    if targets.is_empty() {
        let key = pool_key(now)?;
        if scanned.contains_key(&key) {
            info!(key = %key, "pair for this second already exists; nothing to generate");
        } else {
            targets.push((key.clone(), PackType::Questions));
            targets.push((key, PackType::Maths));
        }
    }

    // Every needed template must validate before the first file is written.
    let mut templates: BTreeMap<PackType, (String, NormalizedPack)> = BTreeMap::new();
    for (_, pack_type) in &targets {
        if !templates.contains_key(pack_type) {
            templates.insert(*pack_type, load_template(config, *pack_type, now)?);
        }
    }

    let mut report = GenerateReport { out_dir: out_dir.display().to_string(), ..GenerateReport::default() };
    for (key, pack_type) in targets {
        let Some((template_name, pack)) = templates.get(&pack_type) else {
            continue;
        };
        if let Some(created) = write_sealed_pack(config, out_dir, &key, pack_type, pack, template_name, now)? {
            report.created.push(created);
        }
    }

    report.backfilled = backfill_manifests(config, out_dir, now)?;
    Ok(report)
}

fn load_template(config: &PackConfig, pack_type: PackType, now: OffsetDateTime) -> Result<(String, NormalizedPack)> {
    let (path, default_version) = match pack_type {
        PackType::Questions => (config.question_template_path(), QUESTIONS_VERSION),
        PackType::Maths => (config.maths_template_path(), MATHS_CHAIN_VERSION),
    };
    let bytes = fs::read(&path).with_context(|| format!("failed to read template {}", path.display()))?;
    let mut document = parse_document(&bytes).with_context(|| format!("invalid template {}", path.display()))?;
    prepare_template(&mut document, default_version, now)?;

    let pack = normalize(Value::Object(document), now)
        .with_context(|| format!("template {} failed validation", path.display()))?;
    let matches_type = match pack_type {
        PackType::Questions => pack.kind() == PackKind::Questions,
        PackType::Maths => pack.kind().maths_variant().is_some(),
    };
    if !matches_type {
        bail!("template {} is a {} pack, expected {}", path.display(), pack.kind().as_str(), pack_type.as_str());
    }
    let template_name = path
        .file_name()
        .map_or_else(|| path.display().to_string(), |name| name.to_string_lossy().into_owned());
    Ok((template_name, pack.stamped()))
}

/// Placeholder room code, fresh `generatedAt`, and a version when the
/// author left it out.
fn prepare_template(document: &mut Map<String, Value>, default_version: &str, now: OffsetDateTime) -> Result<()> {
    if matches!(document.get("version"), None | Some(Value::Null)) {
        document.insert("version".to_string(), Value::String(default_version.to_string()));
    }
    let meta = document.entry("meta").or_insert_with(|| Value::Object(Map::new()));
    let meta = meta.as_object_mut().ok_or_else(|| anyhow!("template meta must be an object"))?;
    meta.insert("roomCode".to_string(), Value::String(GENERATION_ROOM_CODE.to_string()));
    meta.insert("generatedAt".to_string(), Value::String(utc_timestamp(now)?));
    Ok(())
}

fn write_sealed_pack(
    config: &PackConfig,
    out_dir: &Path,
    key: &str,
    pack_type: PackType,
    pack: &NormalizedPack,
    template_name: &str,
    now: OffsetDateTime,
) -> Result<Option<GeneratedFile>> {
    let filename = pack_file_name(pack_type, key, FileRole::Sealed);
    let path = out_dir.join(&filename);
    let envelope = seal(&pack.canonical_bytes(), config.password.expose(), config.kdf()?)
        .with_context(|| format!("failed to seal {filename}"))?;
    let sealed = envelope.to_pretty_json().with_context(|| format!("failed to encode {filename}"))?;
    match write_new(&path, &sealed) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            warn!(file = %filename, "sealed pack appeared while generating; leaving it in place");
            return Ok(None);
        }
        Err(err) => return Err(err).with_context(|| format!("failed to write {}", path.display())),
    }

    let version = pack.kind().version();
    let manifest = PackManifest::for_sealed_bytes(pack_type, version, &utc_timestamp(now)?, &filename, &sealed, template_name);
    write_manifest(out_dir, key, pack_type, &manifest)?;
    info!(file = %filename, version, "sealed pack written");
    Ok(Some(GeneratedFile {
        key: key.to_string(),
        pack_type,
        filename,
        version: version.to_string(),
        source_template: template_name.to_string(),
    }))
}

fn write_manifest(out_dir: &Path, key: &str, pack_type: PackType, manifest: &PackManifest) -> Result<bool> {
    let path = out_dir.join(pack_file_name(pack_type, key, FileRole::Manifest));
    let bytes = manifest.to_pretty_json()?;
    match write_new(&path, &bytes) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err).with_context(|| format!("failed to write {}", path.display())),
    }
}

/// Write a manifest for every sealed file in `out_dir` that lacks one.
fn backfill_manifests(config: &PackConfig, out_dir: &Path, now: OffsetDateTime) -> Result<Vec<String>> {
    let mut written = Vec::new();
    for (key, files) in scan_dir(out_dir)? {
        for pack_type in [PackType::Questions, PackType::Maths] {
            let Some(sealed_path) = files.get(pack_type, FileRole::Sealed) else {
                continue;
            };
            if files.get(pack_type, FileRole::Manifest).is_some() {
                continue;
            }
            let sealed = fs::read(sealed_path).with_context(|| format!("failed to read {}", sealed_path.display()))?;
            let version = match sealed_version(config, &sealed) {
                Ok(version) => version,
                Err(err) => {
                    warn!(file = %sealed_path.display(), error = %format!("{err:#}"), "cannot backfill manifest");
                    continue;
                }
            };
            let filename = pack_file_name(pack_type, &key, FileRole::Sealed);
            let manifest = PackManifest::for_sealed_bytes(
                pack_type,
                &version,
                &utc_timestamp(now)?,
                &filename,
                &sealed,
                SOURCE_TEMPLATE_BACKFILL,
            );
            if write_manifest(out_dir, &key, pack_type, &manifest)? {
                info!(file = %filename, "manifest backfilled");
                written.push(pack_file_name(pack_type, &key, FileRole::Manifest));
            }
        }
    }
    Ok(written)
}

fn sealed_version(config: &PackConfig, sealed: &[u8]) -> Result<String> {
    let plaintext = unseal_bytes(sealed, config.password.expose())?;
    let document = parse_document(&plaintext)?;
    document
        .get("version")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("sealed pack has no version"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::Duration;

    use super::*;
    use crate::config::Secret;
    use crate::test_support::{fixture_time, write_templates};

    fn config(templates: &Path) -> PackConfig {
        PackConfig {
            password: Secret::new("DEMO-ONLY"),
            pbkdf2_iterations: 1_000,
            templates_dir: templates.to_path_buf(),
            ..PackConfig::default()
        }
    }

    fn names(dir: &Path) -> Result<Vec<String>> {
        let mut names = fs::read_dir(dir)?
            .map(|entry| entry.map(|entry| entry.file_name().to_string_lossy().into_owned()))
            .collect::<io::Result<Vec<_>>>()?;
        names.sort();
        Ok(names)
    }

    #[test]
    fn empty_directory_gets_one_fresh_pair() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_templates(dir.path())?;
        let out = dir.path().join("new");
        let report = generate(&config(dir.path()), &out, fixture_time())?;

        assert_eq!(report.created.len(), 2);
        assert!(report.backfilled.is_empty());
        assert_eq!(
            names(&out)?,
            vec![
                "MPACK_20240501_100000.json",
                "MPACK_20240501_100000.sealed",
                "QPACK_20240501_100000.json",
                "QPACK_20240501_100000.sealed",
            ]
        );

        let sealed = fs::read(out.join("QPACK_20240501_100000.sealed"))?;
        let opened = jemima_pack_core::open_sealed(&sealed, b"DEMO-ONLY")?;
        assert_eq!(opened.integrity, Ok(()));
        assert_eq!(opened.document["meta"]["roomCode"], GENERATION_ROOM_CODE);
        assert_eq!(opened.document["meta"]["generatedAt"], "2024-05-01T10:00:00Z");

        let manifest = PackManifest::from_json_slice(&fs::read(out.join("QPACK_20240501_100000.json"))?)?;
        assert!(manifest.matches(&sealed));
        assert_eq!(manifest.version, QUESTIONS_VERSION);
        assert_eq!(manifest.source_template, "AAA-questions.json");
        Ok(())
    }

    #[test]
    fn rerunning_in_the_same_second_writes_nothing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_templates(dir.path())?;
        let out = dir.path().join("new");
        generate(&config(dir.path()), &out, fixture_time())?;
        let before = fs::read(out.join("MPACK_20240501_100000.sealed"))?;

        let report = generate(&config(dir.path()), &out, fixture_time())?;
        assert!(report.created.is_empty());
        assert_eq!(fs::read(out.join("MPACK_20240501_100000.sealed"))?, before);
        assert_eq!(names(&out)?.len(), 4);
        Ok(())
    }

    #[test]
    fn a_later_run_adds_a_second_pair() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_templates(dir.path())?;
        let out = dir.path().join("new");
        generate(&config(dir.path()), &out, fixture_time())?;
        let report = generate(&config(dir.path()), &out, fixture_time() + Duration::minutes(5))?;
        assert_eq!(report.created.iter().map(|file| file.key.as_str()).collect::<Vec<_>>(), vec![
            "20240501_100500",
            "20240501_100500"
        ]);
        assert_eq!(names(&out)?.len(), 8);
        Ok(())
    }

    #[test]
    fn missing_half_is_completed_and_orphan_manifest_backfilled() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_templates(dir.path())?;
        let out = dir.path().join("new");
        generate(&config(dir.path()), &out, fixture_time())?;
        fs::remove_file(out.join("MPACK_20240501_100000.sealed"))?;
        fs::remove_file(out.join("MPACK_20240501_100000.json"))?;
        fs::remove_file(out.join("QPACK_20240501_100000.json"))?;
        let questions_before = fs::read(out.join("QPACK_20240501_100000.sealed"))?;

        let report = generate(&config(dir.path()), &out, fixture_time() + Duration::hours(1))?;
        assert_eq!(report.created.len(), 1);
        assert_eq!(report.created[0].pack_type, PackType::Maths);
        assert_eq!(report.created[0].key, "20240501_100000");
        assert_eq!(report.backfilled, vec!["QPACK_20240501_100000.json".to_string()]);

        assert_eq!(fs::read(out.join("QPACK_20240501_100000.sealed"))?, questions_before);
        let manifest = PackManifest::from_json_slice(&fs::read(out.join("QPACK_20240501_100000.json"))?)?;
        assert_eq!(manifest.source_template, SOURCE_TEMPLATE_BACKFILL);
        assert_eq!(manifest.version, QUESTIONS_VERSION);
        assert!(manifest.matches(&questions_before));
        Ok(())
    }

    #[test]
    fn invalid_template_is_reported_before_anything_is_written() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_templates(dir.path())?;
        fs::write(
            dir.path().join("AAA-maths.json"),
            serde_json::to_vec(&json!({"maths": {"clues": ["only one"]}}))?,
        )?;
        let out = dir.path().join("new");
        let err = match generate(&config(dir.path()), &out, fixture_time()) {
            Ok(report) => panic!("maths template without a version must fail, got {report:?}"),
            Err(err) => err,
        };
        assert!(format!("{err:#}").contains("AAA-maths.json"));
        assert!(names(&out)?.is_empty());
        Ok(())
    }
}
