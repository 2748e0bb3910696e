//! Database schema
//!
//! The store keeps strings out of the hot `event` table: every string-valued
//! field is interned into a per-kind lookup table and the event rows carry
//! integer ids. One row is written per (event, subject) pair; rows of a
//! multi-subject event share the same `id`. `event_view` resolves ids back
//! to strings for reads.
//!
//! `schema_version` records the version per subsystem so the upgrade
//! pipeline in [`crate::upgrades`] knows where to start.

use rusqlite::{Connection, OptionalExtension};

use crate::error::Result;

/// Version the DDL below produces, stored under [`CORE_SCHEMA_NAME`].
pub const CORE_SCHEMA_VERSION: i32 = 4;
pub const CORE_SCHEMA_NAME: &str = "core";

/// Lookup tables interning plain string values.
pub const LOOKUP_TABLES: &[&str] = &[
    "uri",
    "interpretation",
    "manifestation",
    "mimetype",
    "actor",
    "text",
];

/// Idempotent DDL for the current schema version. Safe to re-run against
/// any database at or below the current version once the data migrations
/// have been applied.
pub const SCHEMA_SQL: &str = "
    CREATE TABLE IF NOT EXISTS uri
        (id INTEGER PRIMARY KEY, value VARCHAR UNIQUE);
    CREATE UNIQUE INDEX IF NOT EXISTS uri_value ON uri(value);

    CREATE TABLE IF NOT EXISTS interpretation
        (id INTEGER PRIMARY KEY, value VARCHAR UNIQUE);
    CREATE UNIQUE INDEX IF NOT EXISTS interpretation_value
        ON interpretation(value);

    CREATE TABLE IF NOT EXISTS manifestation
        (id INTEGER PRIMARY KEY, value VARCHAR UNIQUE);
    CREATE UNIQUE INDEX IF NOT EXISTS manifestation_value
        ON manifestation(value);

    CREATE TABLE IF NOT EXISTS mimetype
        (id INTEGER PRIMARY KEY, value VARCHAR UNIQUE);
    CREATE UNIQUE INDEX IF NOT EXISTS mimetype_value ON mimetype(value);

    CREATE TABLE IF NOT EXISTS actor
        (id INTEGER PRIMARY KEY, value VARCHAR UNIQUE);
    CREATE UNIQUE INDEX IF NOT EXISTS actor_value ON actor(value);

    CREATE TABLE IF NOT EXISTS text
        (id INTEGER PRIMARY KEY, value VARCHAR UNIQUE);
    CREATE UNIQUE INDEX IF NOT EXISTS text_value ON text(value);

    CREATE TABLE IF NOT EXISTS payload
        (id INTEGER PRIMARY KEY, value BLOB);

    CREATE TABLE IF NOT EXISTS storage
        (id INTEGER PRIMARY KEY,
         value VARCHAR UNIQUE,
         state INTEGER,
         icon VARCHAR,
         display_name VARCHAR);
    CREATE UNIQUE INDEX IF NOT EXISTS storage_value ON storage(value);

    -- Reserved storage media, always present and always available.
    INSERT OR IGNORE INTO storage (value, state) VALUES ('unknown', 1);
    INSERT OR IGNORE INTO storage (value, state) VALUES ('local', 1);

    CREATE TABLE IF NOT EXISTS event (
        id INTEGER,
        timestamp INTEGER,
        interpretation INTEGER,
        manifestation INTEGER,
        actor INTEGER,
        payload INTEGER,
        subj_id INTEGER,
        subj_interpretation INTEGER,
        subj_manifestation INTEGER,
        subj_origin INTEGER,
        subj_mimetype INTEGER,
        subj_text INTEGER,
        subj_storage INTEGER,
        origin INTEGER,
        subj_id_current INTEGER,
        CONSTRAINT unique_event
            UNIQUE (timestamp, interpretation, manifestation, actor, subj_id)
    );

    CREATE INDEX IF NOT EXISTS event_id ON event(id);
    CREATE INDEX IF NOT EXISTS event_timestamp ON event(timestamp);
    CREATE INDEX IF NOT EXISTS event_interpretation ON event(interpretation);
    CREATE INDEX IF NOT EXISTS event_manifestation ON event(manifestation);
    CREATE INDEX IF NOT EXISTS event_actor ON event(actor);
    CREATE INDEX IF NOT EXISTS event_origin ON event(origin);
    CREATE INDEX IF NOT EXISTS event_subj_id ON event(subj_id);
    CREATE INDEX IF NOT EXISTS event_subj_id_current
        ON event(subj_id_current);
    CREATE INDEX IF NOT EXISTS event_subj_interpretation
        ON event(subj_interpretation);
    CREATE INDEX IF NOT EXISTS event_subj_manifestation
        ON event(subj_manifestation);
    CREATE INDEX IF NOT EXISTS event_subj_origin ON event(subj_origin);
    CREATE INDEX IF NOT EXISTS event_subj_mimetype ON event(subj_mimetype);
    CREATE INDEX IF NOT EXISTS event_subj_text ON event(subj_text);
    CREATE INDEX IF NOT EXISTS event_subj_storage ON event(subj_storage);

    CREATE VIEW IF NOT EXISTS event_view AS
        SELECT event.id,
            event.timestamp,
            event.interpretation,
            event.manifestation,
            event.actor,
            (SELECT value FROM payload
                WHERE payload.id = event.payload) AS payload,
            (SELECT value FROM uri
                WHERE uri.id = event.subj_id) AS subj_uri,
            event.subj_id,
            event.subj_interpretation,
            event.subj_manifestation,
            event.subj_origin,
            (SELECT value FROM uri
                WHERE uri.id = event.subj_origin) AS subj_origin_uri,
            event.subj_mimetype,
            (SELECT value FROM text
                WHERE text.id = event.subj_text) AS subj_text,
            (SELECT value FROM storage
                WHERE storage.id = event.subj_storage) AS subj_storage,
            (SELECT state FROM storage
                WHERE storage.id = event.subj_storage) AS subj_storage_state,
            event.origin,
            (SELECT value FROM uri
                WHERE uri.id = event.origin) AS event_origin_uri,
            event.subj_id_current,
            (SELECT value FROM uri
                WHERE uri.id = event.subj_id_current) AS subj_current_uri
        FROM event;

    CREATE TABLE IF NOT EXISTS schema_version
        (schema VARCHAR PRIMARY KEY ON CONFLICT REPLACE, version INT);
";

/// Run the idempotent DDL against `conn`.
pub fn create_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

/// Stored version for a subsystem, `None` on a fresh database.
pub fn schema_version(conn: &Connection, name: &str) -> Result<Option<i32>> {
    if !table_exists(conn, "schema_version")? {
        return Ok(None);
    }
    let version = conn
        .query_row(
            "SELECT version FROM schema_version WHERE schema = ?1",
            [name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version)
}

pub fn set_schema_version(conn: &Connection, name: &str, version: i32) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_version (schema, version) VALUES (?1, ?2)",
        rusqlite::params![name, version],
    )?;
    Ok(())
}

pub fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ddl_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        create_db(&conn).unwrap();
        create_db(&conn).unwrap();
        assert!(table_exists(&conn, "event").unwrap());
        assert!(table_exists(&conn, "uri").unwrap());
    }

    #[test]
    fn reserved_storage_rows_exist_on_fresh_database() {
        let conn = Connection::open_in_memory().unwrap();
        create_db(&conn).unwrap();
        for medium in ["unknown", "local"] {
            let state: i64 = conn
                .query_row(
                    "SELECT state FROM storage WHERE value = ?1",
                    [medium],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(state, 1, "{} must be seeded as available", medium);
        }
    }

    #[test]
    fn version_round_trip() {
        let conn = Connection::open_in_memory().unwrap();
        create_db(&conn).unwrap();
        assert_eq!(schema_version(&conn, CORE_SCHEMA_NAME).unwrap(), None);
        set_schema_version(&conn, CORE_SCHEMA_NAME, 4).unwrap();
        assert_eq!(schema_version(&conn, CORE_SCHEMA_NAME).unwrap(), Some(4));
        set_schema_version(&conn, CORE_SCHEMA_NAME, 5).unwrap();
        assert_eq!(schema_version(&conn, CORE_SCHEMA_NAME).unwrap(), Some(5));
    }

    #[test]
    fn version_lookup_on_fresh_database() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(schema_version(&conn, CORE_SCHEMA_NAME).unwrap(), None);
    }

    #[test]
    fn column_existence_probe() {
        let conn = Connection::open_in_memory().unwrap();
        create_db(&conn).unwrap();
        assert!(column_exists(&conn, "storage", "icon").unwrap());
        assert!(!column_exists(&conn, "storage", "bogus").unwrap());
    }
}
