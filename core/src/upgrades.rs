//! Schema-upgrade pipeline
//!
//! A database carries a version per subsystem in `schema_version`. On open,
//! the stored `core` version is compared against
//! [`schema::CORE_SCHEMA_VERSION`]: a fresh database gets the current DDL in
//! one shot, an older one is walked through the numbered upgrade steps, and
//! a newer one is refused. Each step only migrates data; schema objects that
//! merely changed shape are re-created by re-running the idempotent DDL
//! afterwards.
//!
//! Steps are written to survive a crash mid-way: every destructive action is
//! guarded by a table or column existence probe, so re-running a partially
//! applied step completes it instead of failing.

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::schema::{
    self, column_exists, table_exists, CORE_SCHEMA_NAME, CORE_SCHEMA_VERSION,
};

/// Legacy classifier URIs and the modern value each one becomes,
/// `(new, old)` pairs.
const INTERPRETATION_RENAMES: &[(&str, &str)] = &[
    (
        "http://www.semanticdesktop.org/ontologies/2007/03/22/nfo#SourceCode",
        "http://www.semanticdesktop.org/ontologies/2007/03/22/nfo/#ManifestationCode",
    ),
    (
        "http://www.semanticdesktop.org/ontologies/2007/03/22/nfo#Bookmark",
        "http://www.semanticdesktop.org/ontologies/nfo/#Bookmark",
    ),
    (
        "http://www.semanticdesktop.org/ontologies/2007/03/22/nfo#Document",
        "http://www.semanticdesktop.org/ontologies/2007/03/22/nfo/#Document",
    ),
    (
        "http://www.semanticdesktop.org/ontologies/2007/03/22/nfo#Image",
        "http://www.semanticdesktop.org/ontologies/2007/03/22/nfo/#Image",
    ),
    (
        "http://www.semanticdesktop.org/ontologies/2007/03/22/nfo#Video",
        "http://www.semanticdesktop.org/ontologies/2007/03/22/nfo/#Video",
    ),
    (
        "http://www.semanticdesktop.org/ontologies/2007/03/22/nfo#Audio",
        "http://www.semanticdesktop.org/ontologies/2007/03/22/nfo/#Audio",
    ),
    (
        "http://www.semanticdesktop.org/ontologies/2007/03/22/nmo#Email",
        "http://www.semanticdesktop.org/ontologies/2007/03/22/nmo/#Email",
    ),
    (
        "http://www.semanticdesktop.org/ontologies/2007/03/22/nmo#IMMessage",
        "http://www.semanticdesktop.org/ontologies/2007/03/22/nmo/#IMMessage",
    ),
    (
        "http://www.zeitgeist-project.com/ontologies/2010/01/27/zg#CreateEvent",
        "http://zeitgeist-project.com/schema/1.0/core#CreateEvent",
    ),
    (
        "http://www.zeitgeist-project.com/ontologies/2010/01/27/zg#ModifyEvent",
        "http://zeitgeist-project.com/schema/1.0/core#ModifyEvent",
    ),
    (
        "http://www.zeitgeist-project.com/ontologies/2010/01/27/zg#AccessEvent",
        "http://zeitgeist-project.com/schema/1.0/core#VisitEvent",
    ),
    (
        "http://www.zeitgeist-project.com/ontologies/2010/01/27/zg#AccessEvent",
        "http://zeitgeist-project.com/schema/1.0/core#OpenEvent",
    ),
    (
        "http://www.zeitgeist-project.com/ontologies/2010/01/27/zg#ModifyEvent",
        "http://zeitgeist-project.com/schema/1.0/core#SaveEvent",
    ),
    (
        "http://www.zeitgeist-project.com/ontologies/2010/01/27/zg#LeaveEvent",
        "http://zeitgeist-project.com/schema/1.0/core#CloseEvent",
    ),
    (
        "http://www.zeitgeist-project.com/ontologies/2010/01/27/zg#SendEvent",
        "http://zeitgeist-project.com/schema/1.0/core#SendEvent",
    ),
    (
        "http://www.zeitgeist-project.com/ontologies/2010/01/27/zg#ReceiveEvent",
        "http://zeitgeist-project.com/schema/1.0/core#ReceiveEvent",
    ),
];

const MANIFESTATION_RENAMES: &[(&str, &str)] = &[
    (
        "http://www.zeitgeist-project.com/ontologies/2010/01/27/zg#UserActivity",
        "http://zeitgeist-project.com/schema/1.0/core#UserActivity",
    ),
    (
        "http://www.zeitgeist-project.com/ontologies/2010/01/27/zg#HeuristicActivity",
        "http://zeitgeist-project.com/schema/1.0/core#HeuristicActivity",
    ),
    (
        "http://www.zeitgeist-project.com/ontologies/2010/01/27/zg#ScheduledActivity",
        "http://zeitgeist-project.com/schema/1.0/core#ScheduledActivity",
    ),
    (
        "http://www.zeitgeist-project.com/ontologies/2010/01/27/zg#WorldActivity",
        "http://zeitgeist-project.com/schema/1.0/core#UserNotification",
    ),
    (
        "http://www.semanticdesktop.org/ontologies/2007/03/22/nfo#FileDataObject",
        "http://www.semanticdesktop.org/ontologies/nfo/#FileDataObject",
    ),
];

const WEB_HISTORY: &str =
    "http://www.semanticdesktop.org/ontologies/2007/03/22/nfo#WebHistory";

/// Bring `conn` up to the current core schema. Refuses databases written
/// by a newer version.
pub fn ensure_schema(conn: &Connection) -> Result<()> {
    if !table_exists(conn, "uri")? {
        debug!("fresh database, creating schema");
        schema::create_db(conn)?;
        schema::set_schema_version(conn, CORE_SCHEMA_NAME, CORE_SCHEMA_VERSION)?;
        return Ok(());
    }

    let stored = schema::schema_version(conn, CORE_SCHEMA_NAME)?.unwrap_or(0);
    if stored > CORE_SCHEMA_VERSION {
        return Err(Error::SchemaVersion {
            found: stored,
            supported: CORE_SCHEMA_VERSION,
        });
    }
    if stored < CORE_SCHEMA_VERSION {
        info!(from = stored, to = CORE_SCHEMA_VERSION, "upgrading database schema");
        for version in stored..CORE_SCHEMA_VERSION {
            run_step(conn, version)?;
        }
        // The view definition has changed across versions; the DDL only
        // creates it when absent.
        conn.execute_batch("DROP VIEW IF EXISTS event_view")?;
    }
    schema::create_db(conn)?;
    schema::set_schema_version(conn, CORE_SCHEMA_NAME, CORE_SCHEMA_VERSION)?;
    Ok(())
}

fn run_step(conn: &Connection, from: i32) -> Result<()> {
    debug!(step = from, "running schema upgrade step");
    match from {
        0 => core_0_1(conn),
        // 1 -> 2 and 2 -> 3 only changed event_view, which the DDL re-run
        // rebuilds.
        1 | 2 => Ok(()),
        3 => core_3_4(conn),
        other => Err(Error::Other(format!(
            "no upgrade step from schema version {}",
            other
        ))),
    }
}

/// Rename `old` to `new` in a lookup table. When a row with the new value
/// already exists the rename is skipped and the old row is left in place,
/// matching the legacy behavior on collision.
fn rename_value(conn: &Connection, table: &str, new: &str, old: &str) -> Result<()> {
    let taken: Option<i64> = conn
        .query_row(
            &format!("SELECT id FROM {} WHERE value = ?1", table),
            [new],
            |row| row.get(0),
        )
        .optional()?;
    if taken.is_none() {
        conn.execute(
            &format!("UPDATE {} SET value = ?1 WHERE value = ?2", table),
            [new, old],
        )?;
    }
    Ok(())
}

/// Version 0 databases predate the current ontology URIs. Remap the legacy
/// classifier values, and split the old "web history" manifestation into
/// subject manifestation RemoteDataObject + subject interpretation Website.
fn core_0_1(conn: &Connection) -> Result<()> {
    for (new, old) in INTERPRETATION_RENAMES {
        rename_value(conn, "interpretation", new, old)?;
    }
    for (new, old) in MANIFESTATION_RENAMES {
        rename_value(conn, "manifestation", new, old)?;
    }

    rename_value(
        conn,
        "manifestation",
        crate::ontology::nfo::REMOTE_DATA_OBJECT,
        WEB_HISTORY,
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO interpretation (value) VALUES (?1)",
        [crate::ontology::nfo::WEBSITE],
    )?;
    conn.execute(
        "UPDATE event SET subj_interpretation =
            (SELECT id FROM interpretation WHERE value = ?1)
         WHERE subj_manifestation =
            (SELECT id FROM manifestation WHERE value = ?2)",
        [
            crate::ontology::nfo::WEBSITE,
            crate::ontology::nfo::REMOTE_DATA_OBJECT,
        ],
    )?;
    Ok(())
}

/// 3 -> 4: the storage table gains icon and display_name, default storage
/// rows appear, and the event table is rebuilt to add `origin` and
/// `subj_id_current` (no ALTER TABLE ADD CONSTRAINT in SQLite).
fn core_3_4(conn: &Connection) -> Result<()> {
    if !column_exists(conn, "storage", "icon")? {
        conn.execute_batch("ALTER TABLE storage ADD COLUMN icon VARCHAR")?;
    }
    if !column_exists(conn, "storage", "display_name")? {
        conn.execute_batch("ALTER TABLE storage ADD COLUMN display_name VARCHAR")?;
    }

    // 1 = available
    conn.execute_batch(
        "INSERT OR IGNORE INTO storage (value, state) VALUES ('unknown', 1);
         INSERT OR IGNORE INTO storage (value, state) VALUES ('local', 1);",
    )?;

    // Rows written before storage tracking have no medium at all; pin them
    // to 'unknown' so availability filters keep returning them.
    conn.execute(
        "UPDATE event SET subj_storage =
            (SELECT id FROM storage WHERE value = 'unknown')
         WHERE subj_storage IS NULL",
        [],
    )?;

    if !column_exists(conn, "event", "subj_id_current")? {
        if !table_exists(conn, "event_old")? {
            conn.execute_batch("ALTER TABLE event RENAME TO event_old")?;
        }
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS event (
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
                    UNIQUE (timestamp, interpretation, manifestation,
                            actor, subj_id)
            );
            INSERT INTO event
                SELECT id, timestamp, interpretation, manifestation, actor,
                    payload, subj_id, subj_interpretation,
                    subj_manifestation, subj_origin, subj_mimetype,
                    subj_text, subj_storage,
                    NULL AS origin, subj_id AS subj_id_current
                FROM event_old;
            DROP TABLE event_old;",
        )?;
    }

    // The per-value delete-cascade triggers are gone in version 4; orphaned
    // lookup rows are reclaimed by VACUUM instead.
    conn.execute_batch(
        "DROP TRIGGER IF EXISTS fkdc_event_uri_1;
         DROP TRIGGER IF EXISTS fkdc_event_uri_2;
         DROP TRIGGER IF EXISTS fkdc_event_interpretation;
         DROP TRIGGER IF EXISTS fkdc_event_manifestation;
         DROP TRIGGER IF EXISTS fkdc_event_actor;
         DROP TRIGGER IF EXISTS fkdc_event_payload;
         DROP TRIGGER IF EXISTS fkdc_event_mimetype;
         DROP TRIGGER IF EXISTS fkdc_event_text;
         DROP TRIGGER IF EXISTS fkdc_event_storage;",
    )?;
    Ok(())
}
