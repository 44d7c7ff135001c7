use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::{apply_migrations, now_rfc3339, open_connection};

const MIGRATION_001_CLAIMS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS claims (
  pack_key TEXT PRIMARY KEY,
  room_code TEXT NOT NULL UNIQUE,
  state TEXT NOT NULL CHECK (state IN ('claimed','used')),
  questions_file TEXT NOT NULL,
  maths_file TEXT NOT NULL,
  claimed_at TEXT NOT NULL,
  used_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_claims_state ON claims(state);
";

const CLAIM_MIGRATIONS: &[(i64, &str)] = &[(1, MIGRATION_001_CLAIMS_SQL)];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimState {
    /// Files are being moved and the room seeded.
    Claimed,
    /// The move is final and the room exists.
    Used,
}

impl ClaimState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Claimed => "claimed",
            Self::Used => "used",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "claimed" => Ok(Self::Claimed),
            "used" => Ok(Self::Used),
            other => Err(anyhow!("invalid claim state: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClaimRecord {
    pub pack_key: String,
    pub room_code: String,
    pub state: ClaimState,
    pub questions_file: String,
    pub maths_file: String,
    pub claimed_at: String,
    pub used_at: Option<String>,
}

/// Durable record of which pool keys have been handed out and to which room.
pub struct ClaimIndex {
    conn: Connection,
}

impl ClaimIndex {
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self { conn: open_connection(path)? })
    }

    /// # Errors
    /// Returns an error when any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        apply_migrations(&mut self.conn, CLAIM_MIGRATIONS)
    }

    /// Record `pack_key` as claimed for `room_code`.
    ///
    /// Returns `false` without writing when the key already has a claim.
    ///
    /// # Errors
    /// Returns an error when the room code is already bound to another key
    /// or the write fails.
    pub fn claim(&mut self, pack_key: &str, room_code: &str, questions_file: &str, maths_file: &str) -> Result<bool> {
        let tx = self.conn.transaction().context("failed to start claim transaction")?;
        let existing = tx
            .query_row("SELECT 1 FROM claims WHERE pack_key = ?1", params![pack_key], |row| {
                row.get::<_, i64>(0)
            })
            .optional()
            .with_context(|| format!("failed to look up claim for {pack_key}"))?;
        if existing.is_some() {
            return Ok(false);
        }
        tx.execute(
            "INSERT INTO claims(pack_key, room_code, state, questions_file, maths_file, claimed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![pack_key, room_code, ClaimState::Claimed.as_str(), questions_file, maths_file, now_rfc3339()?],
        )
        .with_context(|| format!("failed to claim {pack_key} for room {room_code}"))?;
        tx.commit().context("failed to commit claim")?;
        Ok(true)
    }

    /// # Errors
    /// Returns an error when no open claim exists for `pack_key`.
    pub fn mark_used(&mut self, pack_key: &str) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE claims SET state = ?2, used_at = ?3 WHERE pack_key = ?1 AND state = ?4",
                params![pack_key, ClaimState::Used.as_str(), now_rfc3339()?, ClaimState::Claimed.as_str()],
            )
            .with_context(|| format!("failed to mark {pack_key} used"))?;
        if changed == 0 {
            return Err(anyhow!("no open claim for {pack_key}"));
        }
        Ok(())
    }

    /// Drop an open claim so the key becomes available again. Used claims
    /// are never released.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn release(&mut self, pack_key: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM claims WHERE pack_key = ?1 AND state = ?2",
                params![pack_key, ClaimState::Claimed.as_str()],
            )
            .with_context(|| format!("failed to release claim for {pack_key}"))?;
        Ok(changed > 0)
    }

    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn keys(&self) -> Result<BTreeSet<String>> {
        Ok(self.records()?.into_iter().map(|record| record.pack_key).collect())
    }

    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn room_codes(&self) -> Result<BTreeSet<String>> {
        Ok(self.records()?.into_iter().map(|record| record.room_code).collect())
    }

    /// Every claim ordered by pack key.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or hold an unknown state.
    pub fn records(&self) -> Result<Vec<ClaimRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT pack_key, room_code, state, questions_file, maths_file, claimed_at, used_at
                 FROM claims
                 ORDER BY pack_key ASC",
            )
            .context("failed to prepare claim listing")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            })
            .context("failed to list claims")?;

        let mut records = Vec::new();
        for row in rows {
            let (pack_key, room_code, state, questions_file, maths_file, claimed_at, used_at) =
                row.context("failed to read claim row")?;
            records.push(ClaimRecord {
                pack_key,
                room_code,
                state: ClaimState::parse(&state)?,
                questions_file,
                maths_file,
                claimed_at,
                used_at,
            });
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_index(dir: &tempfile::TempDir) -> Result<ClaimIndex> {
        let mut index = ClaimIndex::open(&dir.path().join("pool-index.sqlite3"))?;
        index.migrate()?;
        Ok(index)
    }

    #[test]
    fn a_key_can_be_claimed_once() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut index = open_index(&dir)?;
        assert!(index.claim("20240501_100000", "K7Q", "QPACK_20240501_100000.sealed", "MPACK_20240501_100000.sealed")?);
        assert!(!index.claim("20240501_100000", "ABC", "q", "m")?);
        assert_eq!(index.keys()?, BTreeSet::from(["20240501_100000".to_string()]));
        assert_eq!(index.room_codes()?, BTreeSet::from(["K7Q".to_string()]));
        Ok(())
    }

    #[test]
    fn a_room_code_cannot_be_bound_twice() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut index = open_index(&dir)?;
        index.claim("20240501_100000", "K7Q", "q1", "m1")?;
        assert!(index.claim("20240501_100500", "K7Q", "q2", "m2").is_err());
        Ok(())
    }

    #[test]
    fn release_only_drops_open_claims() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut index = open_index(&dir)?;
        index.claim("20240501_100000", "K7Q", "q1", "m1")?;
        index.claim("20240501_100500", "ABC", "q2", "m2")?;
        index.mark_used("20240501_100500")?;

        assert!(index.release("20240501_100000")?);
        assert!(!index.release("20240501_100500")?);
        let records = index.records()?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, ClaimState::Used);
        assert!(records[0].used_at.is_some());
        assert!(index.mark_used("20240501_100500").is_err());
        Ok(())
    }

    #[test]
    fn claims_survive_reopening() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let mut index = open_index(&dir)?;
            index.claim("20240501_100000", "K7Q", "q1", "m1")?;
        }
        let index = open_index(&dir)?;
        assert_eq!(index.records()?.len(), 1);
        Ok(())
    }
}
