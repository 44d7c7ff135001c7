use std::path::Path;

use anyhow::{Context, Result};
use jemima_pack_core::{merge_room_document, RoomCode, RoomSeed, RoomStore, RoomStoreError, RoundDocument};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::{Map, Value};

use crate::{apply_migrations, now_rfc3339, open_connection, schema_status, SchemaStatus};

const MIGRATION_001_ROOMS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS rooms (
  room_code TEXT PRIMARY KEY,
  document_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS room_rounds (
  room_code TEXT NOT NULL,
  round_number INTEGER NOT NULL CHECK (round_number BETWEEN 1 AND 5),
  document_json TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (room_code, round_number),
  FOREIGN KEY (room_code) REFERENCES rooms(room_code)
);
";

const ROOM_MIGRATIONS: &[(i64, &str)] = &[(1, MIGRATION_001_ROOMS_SQL)];

/// Room store backed by a local SQLite file. Room documents and round
/// documents are stored as JSON text.
pub struct SqliteRoomStore {
    conn: Connection,
}

impl SqliteRoomStore {
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self { conn: open_connection(path)? })
    }

    /// # Errors
    /// Returns an error when any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        apply_migrations(&mut self.conn, ROOM_MIGRATIONS)
    }

    /// # Errors
    /// Returns an error when schema metadata cannot be read.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        schema_status(&self.conn, ROOM_MIGRATIONS)
    }

    /// # Errors
    /// Returns an error when the row cannot be read or holds invalid JSON.
    pub fn load_room(&self, room_code: &str) -> Result<Option<Map<String, Value>>> {
        load_room_document(&self.conn, room_code)
    }

    /// Round documents of a room, in round order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or hold invalid JSON.
    pub fn load_rounds(&self, room_code: &str) -> Result<Vec<RoundDocument>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT document_json FROM room_rounds
                 WHERE room_code = ?1
                 ORDER BY round_number ASC",
            )
            .context("failed to prepare round query")?;
        let rows = stmt
            .query_map(params![room_code], |row| row.get::<_, String>(0))
            .context("failed to query rounds")?;
        let mut rounds = Vec::new();
        for row in rows {
            let json = row.context("failed to read round row")?;
            rounds.push(
                serde_json::from_str(&json)
                    .with_context(|| format!("invalid round document stored for room {room_code}"))?,
            );
        }
        Ok(rounds)
    }

    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn room_codes(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT room_code FROM rooms ORDER BY room_code ASC")
            .context("failed to prepare room listing")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0)).context("failed to list rooms")?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to read room row")
    }

    /// Run `write` in one transaction; an error drops the transaction
    /// uncommitted, so none of its writes become visible.
    fn transact(&mut self, write: impl FnOnce(&Transaction<'_>) -> Result<()>) -> Result<(), RoomStoreError> {
        self.try_transact(write).map_err(|err| RoomStoreError(format!("{err:#}")))
    }

    fn try_transact(&mut self, write: impl FnOnce(&Transaction<'_>) -> Result<()>) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        write(&tx)?;
        tx.commit().context("failed to commit room store transaction")?;
        Ok(())
    }
}

impl RoomStore for SqliteRoomStore {
    fn create_or_update_room(&mut self, room_code: &RoomCode, document: &Map<String, Value>) -> Result<(), RoomStoreError> {
        self.transact(|tx| upsert_room(tx, room_code, document))
    }

    fn set_round_document(&mut self, room_code: &RoomCode, round: &RoundDocument) -> Result<(), RoomStoreError> {
        self.transact(|tx| upsert_round(tx, room_code, round))
    }

    fn seed_room(&mut self, seed: &RoomSeed) -> Result<(), RoomStoreError> {
        self.transact(|tx| {
            upsert_room(tx, &seed.room_code, &seed.document)?;
            for round in &seed.rounds {
                upsert_round(tx, &seed.room_code, round)?;
            }
            Ok(())
        })
    }
}

fn load_room_document(conn: &Connection, room_code: &str) -> Result<Option<Map<String, Value>>> {
    let json = conn
        .query_row(
            "SELECT document_json FROM rooms WHERE room_code = ?1",
            params![room_code],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .with_context(|| format!("failed to load room {room_code}"))?;
    json.map(|json| {
        serde_json::from_str(&json).with_context(|| format!("invalid room document stored for {room_code}"))
    })
    .transpose()
}

fn upsert_room(tx: &Transaction<'_>, room_code: &RoomCode, document: &Map<String, Value>) -> Result<()> {
    let existing = load_room_document(tx, room_code.as_str())?;
    let merged = merge_room_document(existing.as_ref(), document);
    let json = serde_json::to_string(&merged).context("failed to encode room document")?;
    let now = now_rfc3339()?;
    tx.execute(
        "INSERT INTO rooms(room_code, document_json, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?3)
         ON CONFLICT(room_code) DO UPDATE SET
           document_json = excluded.document_json,
           updated_at = excluded.updated_at",
        params![room_code.as_str(), json, now],
    )
    .with_context(|| format!("failed to upsert room {room_code}"))?;
    Ok(())
}

fn upsert_round(tx: &Transaction<'_>, room_code: &RoomCode, round: &RoundDocument) -> Result<()> {
    let json = serde_json::to_string(round).context("failed to encode round document")?;
    let now = now_rfc3339()?;
    tx.execute(
        "INSERT INTO room_rounds(room_code, round_number, document_json, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(room_code, round_number) DO UPDATE SET
           document_json = excluded.document_json,
           updated_at = excluded.updated_at",
        params![room_code.as_str(), i64::from(round.round), json, now],
    )
    .with_context(|| format!("failed to write round {} for room {room_code}", round.round))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn open_store(dir: &tempfile::TempDir) -> Result<SqliteRoomStore> {
        let mut store = SqliteRoomStore::open(&dir.path().join("rooms.sqlite3"))?;
        store.migrate()?;
        Ok(store)
    }

    fn code(value: &str) -> RoomCode {
        RoomCode::parse(value).unwrap_or_else(|err| panic!("fixture room code {value}: {err}"))
    }

    fn round(number: u8) -> RoundDocument {
        let item = json!({"prompt": "Q?", "options": ["yes", "no"], "correct": "A"});
        RoundDocument {
            round: number,
            host_items: vec![item.clone(), item.clone(), item.clone()],
            guest_items: vec![item.clone(), item.clone(), item],
            interlude: None,
        }
    }

    fn seed(room_code: &str, rounds: Vec<RoundDocument>) -> RoomSeed {
        let document = match json!({
            "meta": {"hostUid": "demo-host", "guestUid": "demo-guest"},
            "state": "keyroom",
            "timestamps": {"createdAt": "2024-05-01T10:00:00Z", "updatedAt": "2024-05-01T10:00:00Z"}
        }) {
            Value::Object(document) => document,
            other => panic!("fixture must be an object, got {other}"),
        };
        RoomSeed { room_code: code(room_code), document, rounds }
    }

    #[test]
    fn migrate_is_idempotent_and_reports_status() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut store = open_store(&dir)?;
        store.migrate()?;
        let status = store.schema_status()?;
        assert_eq!(status.current_version, 1);
        assert!(status.pending_versions.is_empty());
        Ok(())
    }

    #[test]
    fn seed_room_writes_room_and_rounds_together() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut store = open_store(&dir)?;
        store
            .seed_room(&seed("K7Q", (1..=5).map(round).collect()))
            .map_err(|err| anyhow::anyhow!(err))?;

        let room = store.load_room("K7Q")?.unwrap_or_default();
        assert_eq!(room["state"], "keyroom");
        let rounds = store.load_rounds("K7Q")?;
        assert_eq!(rounds.iter().map(|round| round.round).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
        assert_eq!(store.room_codes()?, vec!["K7Q".to_string()]);
        Ok(())
    }

    #[test]
    fn failed_seed_leaves_no_visible_room() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut store = open_store(&dir)?;
        let mut rounds = (1..=5).map(round).collect::<Vec<_>>();
        rounds.push(round(9));

        match store.seed_room(&seed("K7Q", rounds)) {
            Ok(()) => panic!("round 9 must violate the round_number check"),
            Err(err) => assert!(err.to_string().contains("round 9"), "unexpected error: {err}"),
        }
        assert_eq!(store.load_room("K7Q")?, None);
        assert!(store.load_rounds("K7Q")?.is_empty());
        Ok(())
    }

    #[test]
    fn reseeding_merges_into_the_existing_room() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut store = open_store(&dir)?;
        store.seed_room(&seed("K7Q", vec![round(1)])).map_err(|err| anyhow::anyhow!(err))?;

        let mut update = seed("K7Q", vec![round(1)]);
        update.document.insert("meta".to_string(), json!({"hostUid": "other-host", "guestUid": "other-guest"}));
        update.document.insert(
            "timestamps".to_string(),
            json!({"createdAt": "2030-01-01T00:00:00Z", "updatedAt": "2030-01-01T00:00:00Z"}),
        );
        store.seed_room(&update).map_err(|err| anyhow::anyhow!(err))?;

        let room = store.load_room("K7Q")?.unwrap_or_default();
        assert_eq!(room["meta"]["hostUid"], "demo-host");
        assert_eq!(room["timestamps"]["createdAt"], "2024-05-01T10:00:00Z");
        assert_eq!(room["timestamps"]["updatedAt"], "2030-01-01T00:00:00Z");
        assert_eq!(store.load_rounds("K7Q")?.len(), 1);
        Ok(())
    }

    #[test]
    fn round_document_requires_an_existing_room() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut store = open_store(&dir)?;
        assert!(store.set_round_document(&code("ZZZ"), &round(1)).is_err());
        store.create_or_update_room(&code("ZZZ"), &seed("ZZZ", vec![]).document).map_err(|err| anyhow::anyhow!(err))?;
        store.set_round_document(&code("ZZZ"), &round(1)).map_err(|err| anyhow::anyhow!(err))?;
        assert_eq!(store.load_rounds("ZZZ")?.len(), 1);
        Ok(())
    }
}
