//! On-disk pack pool: `new/` holds sealed packs awaiting assignment,
//! `used/<ROOM>/` holds the pairs that seeded each room.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use jemima_pack_core::timestamp::is_pool_key;
use jemima_pack_core::PackType;
use jemima_pack_store_sqlite::{ClaimIndex, ClaimState};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::files::{file_name, move_file};

pub const NEW_DIR: &str = "new";
pub const USED_DIR: &str = "used";
pub const LOCK_FILE: &str = ".assign.lock";
pub const INDEX_FILE: &str = "pool-index.sqlite3";
pub const SEALED_EXTENSION: &str = "sealed";
pub const MANIFEST_EXTENSION: &str = "json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRole {
    Sealed,
    Manifest,
}

impl FileRole {
    fn extension(self) -> &'static str {
        match self {
            Self::Sealed => SEALED_EXTENSION,
            Self::Manifest => MANIFEST_EXTENSION,
        }
    }
}

/// `QPACK_20240501_100000.sealed` and friends.
#[must_use]
pub fn pack_file_name(pack_type: PackType, key: &str, role: FileRole) -> String {
    format!("{}_{key}.{}", pack_type.file_prefix(), role.extension())
}

/// Inverse of [`pack_file_name`]; `None` for anything that is not a pool file.
#[must_use]
pub fn parse_pack_file_name(name: &str) -> Option<(PackType, String, FileRole)> {
    let (stem, extension) = name.rsplit_once('.')?;
    let role = match extension {
        SEALED_EXTENSION => FileRole::Sealed,
        MANIFEST_EXTENSION => FileRole::Manifest,
        _ => return None,
    };
    let (prefix, key) = stem.split_once('_')?;
    let pack_type = PackType::from_file_prefix(prefix)?;
    is_pool_key(key).then(|| (pack_type, key.to_string(), role))
}

/// Which of the four files exist for one timestamp key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyFiles {
    pub questions_sealed: Option<PathBuf>,
    pub questions_manifest: Option<PathBuf>,
    pub maths_sealed: Option<PathBuf>,
    pub maths_manifest: Option<PathBuf>,
}

impl KeyFiles {
    #[must_use]
    pub fn get(&self, pack_type: PackType, role: FileRole) -> Option<&PathBuf> {
        match (pack_type, role) {
            (PackType::Questions, FileRole::Sealed) => self.questions_sealed.as_ref(),
            (PackType::Questions, FileRole::Manifest) => self.questions_manifest.as_ref(),
            (PackType::Maths, FileRole::Sealed) => self.maths_sealed.as_ref(),
            (PackType::Maths, FileRole::Manifest) => self.maths_manifest.as_ref(),
        }
    }

    fn set(&mut self, pack_type: PackType, role: FileRole, path: PathBuf) {
        let slot = match (pack_type, role) {
            (PackType::Questions, FileRole::Sealed) => &mut self.questions_sealed,
            (PackType::Questions, FileRole::Manifest) => &mut self.questions_manifest,
            (PackType::Maths, FileRole::Sealed) => &mut self.maths_sealed,
            (PackType::Maths, FileRole::Manifest) => &mut self.maths_manifest,
        };
        *slot = Some(path);
    }

    fn pair(&self, key: &str) -> Option<PackPair> {
        Some(PackPair {
            key: key.to_string(),
            questions: PackFiles {
                sealed: self.questions_sealed.clone()?,
                manifest: self.questions_manifest.clone()?,
            },
            maths: PackFiles { sealed: self.maths_sealed.clone()?, manifest: self.maths_manifest.clone()? },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackFiles {
    pub sealed: PathBuf,
    pub manifest: PathBuf,
}

/// A complete question/maths pair sharing one timestamp key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackPair {
    pub key: String,
    pub questions: PackFiles,
    pub maths: PackFiles,
}

impl PackPair {
    /// The four files in the order they are moved.
    #[must_use]
    pub fn paths(&self) -> [&Path; 4] {
        [&self.questions.sealed, &self.questions.manifest, &self.maths.sealed, &self.maths.manifest]
    }
}

/// Index every pool file in `dir` by key. A missing directory is empty.
///
/// # Errors
/// Returns an error when the directory exists but cannot be listed.
pub fn scan_dir(dir: &Path) -> Result<BTreeMap<String, KeyFiles>> {
    let mut keys: BTreeMap<String, KeyFiles> = BTreeMap::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(keys),
        Err(err) => return Err(err).with_context(|| format!("failed to list {}", dir.display())),
    };
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
        if !entry.file_type().is_ok_and(|kind| kind.is_file()) {
            continue;
        }
        let name = entry.file_name();
        let Some((pack_type, key, role)) = parse_pack_file_name(&name.to_string_lossy()) else {
            continue;
        };
        keys.entry(key).or_default().set(pack_type, role, entry.path());
    }
    Ok(keys)
}

#[derive(Debug, Clone)]
pub struct PackPool {
    root: PathBuf,
}

impl PackPool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn new_dir(&self) -> PathBuf {
        self.root.join(NEW_DIR)
    }

    #[must_use]
    pub fn used_dir(&self) -> PathBuf {
        self.root.join(USED_DIR)
    }

    #[must_use]
    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    /// # Errors
    /// Returns an error when `new/` or `used/` cannot be created.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [self.new_dir(), self.used_dir()] {
            fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Block until this process holds the pool-wide assignment lock.
    ///
    /// # Errors
    /// Returns an error when the lock file cannot be opened or locked.
    pub fn lock(&self) -> Result<PoolLock> {
        let path = self.lock_path();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        file.lock_exclusive().with_context(|| format!("failed to lock {}", path.display()))?;
        Ok(PoolLock { file, path })
    }

    /// # Errors
    /// Returns an error when `new/` cannot be listed.
    pub fn scan(&self) -> Result<BTreeMap<String, KeyFiles>> {
        scan_dir(&self.new_dir())
    }

    /// Complete pairs in `new/`, oldest key first.
    ///
    /// # Errors
    /// Returns an error when `new/` cannot be listed.
    pub fn discover(&self) -> Result<Vec<PackPair>> {
        Ok(self.scan()?.iter().filter_map(|(key, files)| files.pair(key)).collect())
    }

    /// Room codes that already own a `used/<ROOM>/` directory.
    ///
    /// # Errors
    /// Returns an error when `used/` exists but cannot be listed.
    pub fn used_room_codes(&self) -> Result<BTreeSet<String>> {
        let dir = self.used_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(err) => return Err(err).with_context(|| format!("failed to list {}", dir.display())),
        };
        let mut codes = BTreeSet::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
            if entry.file_type().is_ok_and(|kind| kind.is_dir()) {
                codes.insert(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(codes)
    }

    /// # Errors
    /// Returns an error when the claim index cannot be opened or migrated.
    pub fn open_index(&self) -> Result<ClaimIndex> {
        let mut index = ClaimIndex::open(&self.index_path())?;
        index.migrate()?;
        Ok(index)
    }

    /// Counts for operators. Never creates the pool or its index.
    ///
    /// # Errors
    /// Returns an error when directories or the index cannot be read.
    pub fn status(&self) -> Result<PoolStatus> {
        let scanned = self.scan()?;
        let claims = if self.index_path().exists() { self.open_index()?.records()? } else { Vec::new() };
        let claimed_keys: BTreeSet<&str> = claims.iter().map(|claim| claim.pack_key.as_str()).collect();

        let mut status = PoolStatus { pool_dir: self.root.display().to_string(), ..PoolStatus::default() };
        for (key, files) in &scanned {
            match files.pair(key) {
                Some(_) if claimed_keys.contains(key.as_str()) => {}
                Some(_) => status.available += 1,
                None => status.incomplete_keys.push(key.clone()),
            }
        }
        for claim in &claims {
            match claim.state {
                ClaimState::Claimed => status.claimed += 1,
                ClaimState::Used => status.used += 1,
            }
        }
        status.used_rooms = self.used_room_codes()?.into_iter().collect();
        Ok(status)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub pool_dir: String,
    /// Complete, unclaimed pairs in `new/`.
    pub available: usize,
    pub claimed: usize,
    pub used: usize,
    /// Keys in `new/` missing at least one of their four files.
    pub incomplete_keys: Vec<String>,
    pub used_rooms: Vec<String>,
}

/// Held for the whole of an assignment; released on drop.
#[derive(Debug)]
pub struct PoolLock {
    file: File,
    path: PathBuf,
}

impl PoolLock {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PoolLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %err, "failed to release pool lock");
        }
    }
}

#[derive(Debug, Error)]
#[error("moved {completed} of {total} files into {target} before {failed} failed: {source}{rollback}")]
pub(crate) struct PartialMove {
    completed: usize,
    total: usize,
    target: String,
    failed: String,
    #[source]
    source: io::Error,
    /// Empty when rollback succeeded; otherwise describes what was left behind.
    rollback: String,
}

/// Files moved by [`move_all`], in move order, so they can be put back.
#[derive(Debug)]
pub(crate) struct MovedFiles {
    moves: Vec<(PathBuf, PathBuf)>,
    target_dir: PathBuf,
    created_dir: bool,
}

impl MovedFiles {
    /// Move every file back to where it came from, newest move first.
    pub(crate) fn restore(self) -> io::Result<()> {
        undo(&self.moves, &self.target_dir, self.created_dir)
    }
}

/// Move `files` into `target_dir` in order. On any failure the files
/// already moved are moved back before the error is returned.
pub(crate) fn move_all(files: &[&Path], target_dir: &Path) -> Result<MovedFiles, PartialMove> {
    let partial = |completed: usize, failed: &Path, source: io::Error, rollback: String| PartialMove {
        completed,
        total: files.len(),
        target: target_dir.display().to_string(),
        failed: file_name(failed),
        source,
        rollback,
    };

    let created_dir = !target_dir.exists();
    if let Err(err) = fs::create_dir_all(target_dir) {
        return Err(partial(0, target_dir, err, String::new()));
    }

    let mut moves = Vec::with_capacity(files.len());
    for &from in files {
        let to = target_dir.join(file_name(from));
        if let Err(err) = move_file(from, &to) {
            let rollback = match undo(&moves, target_dir, created_dir) {
                Ok(()) => String::new(),
                Err(undo_err) => {
                    error!(target = %target_dir.display(), error = %undo_err, "rollback of partial move failed");
                    format!("; rollback incomplete: {undo_err}")
                }
            };
            return Err(partial(moves.len(), from, err, rollback));
        }
        moves.push((from.to_path_buf(), to));
    }
    Ok(MovedFiles { moves, target_dir: target_dir.to_path_buf(), created_dir })
}

fn undo(moves: &[(PathBuf, PathBuf)], target_dir: &Path, created_dir: bool) -> io::Result<()> {
    let mut first_error = None;
    for (from, to) in moves.iter().rev() {
        if let Err(err) = move_file(to, from) {
            error!(from = %to.display(), to = %from.display(), error = %err, "failed to move pack file back");
            first_error.get_or_insert(err);
        }
    }
    if created_dir && first_error.is_none() {
        if let Err(err) = fs::remove_dir(target_dir) {
            warn!(dir = %target_dir.display(), error = %err, "failed to remove empty room directory");
        }
    }
    first_error.map_or(Ok(()), Err)
}
