//! Hand one question/maths pair from the pool to a new room.
//!
//! The whole assignment runs under the pool lock. A pair is claimed in the
//! index before its files move, and the claim is only released again when
//! the move or the room seed fails and the files are back in `new/`.

use std::collections::BTreeSet;
use std::fs;

use jemima_pack_core::schema::{COMBINED_VERSION, DEFAULT_GUEST_UID, DEFAULT_HOST_UID};
use jemima_pack_core::{
    integrity, normalize_as, parse_document, room_seed, unseal_bytes, utc_timestamp, validate, NormalizedPack,
    PackKind, PackManifest, PackType, RoomCode, RoomStore, SeedSource, ValidationError,
};
use jemima_pack_store_sqlite::{ClaimIndex, ClaimState};
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Map, Value};
use time::OffsetDateTime;
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::config::PackConfig;
use crate::error::AssignError;
use crate::files::file_name;
use crate::pool::{move_all, PackFiles, PackPool};

/// What the caller gets back from a successful assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignOutcome {
    pub room_code: String,
    pub question_pack: String,
    pub maths_pack: String,
    #[serde(skip)]
    pub assignment_id: String,
}

struct OpenedFile {
    document: Map<String, Value>,
    manifest: PackManifest,
}

/// Assign the oldest unclaimed pair using the wall clock and the thread RNG.
///
/// # Errors
/// See [`assign_with`].
pub fn assign<S: RoomStore + ?Sized>(config: &PackConfig, store: &mut S) -> Result<AssignOutcome, AssignError> {
    assign_with(config, store, OffsetDateTime::now_utc(), &mut rand::thread_rng())
}

/// # Errors
/// Returns [`AssignError::PoolExhausted`] when no unclaimed complete pair
/// exists. Decryption, integrity and validation failures name the file.
/// Any failure after the claim leaves the pool as it was.
pub fn assign_with<S, R>(
    config: &PackConfig,
    store: &mut S,
    now: OffsetDateTime,
    rng: &mut R,
) -> Result<AssignOutcome, AssignError>
where
    S: RoomStore + ?Sized,
    R: Rng + ?Sized,
{
    config.validate().map_err(|err| AssignError::failed(&err))?;
    let pool = config.pool();
    // An empty pool is reported without creating the lock or the index.
    if pool.discover().map_err(|err| AssignError::failed(&err))?.is_empty() {
        return Err(AssignError::PoolExhausted);
    }

    pool.ensure_layout().map_err(|err| AssignError::failed(&err))?;
    let _lock = pool.lock().map_err(|err| AssignError::failed(&err))?;
    let mut index = pool.open_index().map_err(|err| AssignError::failed(&err))?;
    release_stale_claims(&pool, &mut index)?;

    let claimed = index.keys().map_err(|err| AssignError::failed(&err))?;
    let pair = pool
        .discover()
        .map_err(|err| AssignError::failed(&err))?
        .into_iter()
        .find(|pair| !claimed.contains(&pair.key))
        .ok_or(AssignError::PoolExhausted)?;
    info!(key = %pair.key, "selected pack pair");

    let questions = open_pack_file(config, &pair.questions, PackType::Questions, now)?;
    let maths = open_pack_file(config, &pair.maths, PackType::Maths, now)?;

    let mut taken = pool.used_room_codes().map_err(|err| AssignError::failed(&err))?;
    taken.extend(index.room_codes().map_err(|err| AssignError::failed(&err))?);
    let room_code = RoomCode::generate(rng, &taken)
        .ok_or_else(|| AssignError::AssignmentFailed("every room code is taken".to_string()))?;

    let combined = combine(&questions.document, &maths.document, &room_code, now)?;
    let seed_source = SeedSource {
        room_code: room_code.to_string(),
        assignment_id: Ulid::new().to_string(),
        assigned_at: timestamp(now)?,
        question_pack: questions.manifest.provenance(),
        maths_pack: maths.manifest.provenance(),
    };
    let seed = room_seed(&combined, &seed_source, now)
        .map_err(|source| AssignError::Validation { file: "combined pack".to_string(), source })?;

    let question_pack = file_name(&pair.questions.sealed);
    let maths_pack = file_name(&pair.maths.sealed);
    let fresh = index
        .claim(&pair.key, room_code.as_str(), &question_pack, &maths_pack)
        .map_err(|err| AssignError::failed(&err))?;
    if !fresh {
        return Err(AssignError::AssignmentFailed(format!("{} was claimed concurrently", pair.key)));
    }

    let target = pool.used_dir().join(room_code.as_str());
    let moved = match move_all(&pair.paths(), &target) {
        Ok(moved) => moved,
        Err(partial) => {
            release_claim(&mut index, &pair.key);
            return Err(AssignError::AssignmentFailed(partial.to_string()));
        }
    };

    if let Err(err) = store.seed_room(&seed) {
        let message = match moved.restore() {
            Ok(()) => {
                release_claim(&mut index, &pair.key);
                format!("failed to seed room {room_code}: {err}")
            }
            Err(restore_err) => {
                // The claim stays so the half-restored pair is never handed out again.
                error!(room = %room_code, error = %restore_err, "failed to restore pack files");
                format!("failed to seed room {room_code}: {err}; restoring pack files failed: {restore_err}")
            }
        };
        return Err(AssignError::AssignmentFailed(message));
    }

    if let Err(err) = index.mark_used(&pair.key) {
        warn!(key = %pair.key, error = %format!("{err:#}"), "room seeded but claim not marked used");
    }
    info!(room = %room_code, key = %pair.key, assignment_id = %seed_source.assignment_id, "pack pair assigned");
    Ok(AssignOutcome {
        room_code: room_code.to_string(),
        question_pack,
        maths_pack,
        assignment_id: seed_source.assignment_id,
    })
}

/// Claims left `claimed` by an interrupted run whose pair is still whole in
/// `new/` are released so the pair can be assigned again.
fn release_stale_claims(pool: &PackPool, index: &mut ClaimIndex) -> Result<(), AssignError> {
    let waiting: BTreeSet<String> =
        pool.discover().map_err(|err| AssignError::failed(&err))?.into_iter().map(|pair| pair.key).collect();
    let records = index.records().map_err(|err| AssignError::failed(&err))?;
    for record in records {
        if record.state == ClaimState::Claimed && waiting.contains(&record.pack_key) {
            warn!(key = %record.pack_key, room = %record.room_code, "releasing stale claim");
            index.release(&record.pack_key).map_err(|err| AssignError::failed(&err))?;
        }
    }
    Ok(())
}

fn release_claim(index: &mut ClaimIndex, key: &str) {
    if let Err(err) = index.release(key) {
        error!(key, error = %format!("{err:#}"), "failed to release claim");
    }
}

/// Questions halves go through normalization so legacy version tags are
/// corrected; maths halves must already carry an exact maths version.
fn open_pack_file(
    config: &PackConfig,
    files: &PackFiles,
    expected: PackType,
    now: OffsetDateTime,
) -> Result<OpenedFile, AssignError> {
    let file = file_name(&files.sealed);
    let manifest_file = file_name(&files.manifest);
    let manifest_bytes = fs::read(&files.manifest)
        .map_err(|err| AssignError::AssignmentFailed(format!("failed to read {manifest_file}: {err}")))?;
    let manifest = PackManifest::from_json_slice(&manifest_bytes)
        .map_err(|source| AssignError::Validation { file: manifest_file.clone(), source })?;
    let sealed = fs::read(&files.sealed)
        .map_err(|err| AssignError::AssignmentFailed(format!("failed to read {file}: {err}")))?;
    if !manifest.matches(&sealed) {
        integrity_problem(config, &file, format!("sealed bytes do not match the hash in {manifest_file}"))?;
    }

    let plaintext = unseal_bytes(&sealed, config.password.expose()).map_err(|err| AssignError::envelope(&file, err))?;
    let document = parse_document(&plaintext).map_err(|source| AssignError::Validation { file: file.clone(), source })?;
    if let Err(mismatch) = integrity::check(&document) {
        integrity_problem(config, &file, mismatch.to_string())?;
    }
    let invalid = |source| AssignError::Validation { file: file.clone(), source };
    let kind = match expected {
        PackType::Questions => PackKind::detect(&document).map_err(invalid)?,
        PackType::Maths => validate(&document).map_err(invalid)?,
    };
    let document = if kind == PackKind::Questions {
        normalize_as(PackKind::Questions, document, now).map_err(invalid)?.into_document()
    } else {
        document
    };
    let expected_kind = match expected {
        PackType::Questions => kind == PackKind::Questions,
        PackType::Maths => kind.maths_variant().is_some(),
    };
    if !expected_kind {
        return Err(AssignError::Validation {
            file,
            source: ValidationError::new(
                "version",
                format!("expected a {} pack, found {}", expected.as_str(), kind.as_str()),
            ),
        });
    }
    Ok(OpenedFile { document, manifest })
}

fn integrity_problem(config: &PackConfig, file: &str, detail: String) -> Result<(), AssignError> {
    if config.strict_integrity {
        return Err(AssignError::IntegrityMismatch { file: file.to_string(), detail });
    }
    warn!(file, detail = %detail, "integrity mismatch ignored");
    Ok(())
}

fn timestamp(now: OffsetDateTime) -> Result<String, AssignError> {
    utc_timestamp(now).map_err(|err| AssignError::AssignmentFailed(format!("cannot format {now}: {err}")))
}

/// Join the two halves under the new room code and stamp the result.
fn combine(
    questions: &Map<String, Value>,
    maths: &Map<String, Value>,
    room_code: &RoomCode,
    now: OffsetDateTime,
) -> Result<NormalizedPack, AssignError> {
    let uid = |key: &str, default: &str| {
        questions
            .get("meta")
            .and_then(|meta| meta.get(key))
            .filter(|value| value.as_str().is_some_and(|text| !text.is_empty()))
            .cloned()
            .unwrap_or_else(|| json!(default))
    };
    let generated_at = timestamp(now)?;
    let document = json!({
        "version": COMBINED_VERSION,
        "meta": {
            "roomCode": room_code.as_str(),
            "generatedAt": generated_at,
            "hostUid": uid("hostUid", DEFAULT_HOST_UID),
            "guestUid": uid("guestUid", DEFAULT_GUEST_UID),
        },
        "rounds": questions.get("rounds").cloned().unwrap_or(Value::Null),
        "maths": maths.get("maths").cloned().unwrap_or(Value::Null),
    });
    let Value::Object(document) = document else {
        return Err(AssignError::AssignmentFailed("combined pack must be an object".to_string()));
    };
    normalize_as(PackKind::Combined, document, now)
        .map(NormalizedPack::stamped)
        .map_err(|source| AssignError::Validation { file: "combined pack".to_string(), source })
}
