//! Storage engine
//!
//! All reads go through the `event_view` SQL view; writes go to the
//! normalized tables. String values are interned through [`TableLookup`]
//! caches for the four hot classifier tables, and through inline
//! insert-or-ignore statements for the uri/text/storage tables.
//!
//! The engine keeps its open connection and interning caches in a
//! [`Store`]; on any database error the store is dropped and reopened
//! lazily on the next request, so a transient failure never wedges the
//! daemon.

use std::collections::HashMap;
use std::path::PathBuf;

use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info, warn};

use chronolog_core::error::{Error, Result};
use chronolog_core::ontology::{self, zg};
use chronolog_core::types::{
    timestamp_now, Event, EventTemplate, ResultType, StorageState, Subject, TimeRange,
};
use chronolog_core::upgrades;

use crate::extension::ExtensionRegistry;
use crate::lru::LruCache;

/// Default capacity of the resolved-event cache.
pub const DEFAULT_CACHE_SIZE: usize = 2000;

/// Interning cache for one lookup table. Holds both directions in memory;
/// these tables stay small (hundreds of rows) on real databases.
pub struct TableLookup {
    table: &'static str,
    forward: HashMap<String, i64>,
    inverse: HashMap<i64, String>,
}

impl TableLookup {
    pub fn new(conn: &Connection, table: &'static str) -> Result<Self> {
        let mut forward = HashMap::new();
        let mut inverse = HashMap::new();
        let mut stmt = conn.prepare(&format!("SELECT id, value FROM {}", table))?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let value: String = row.get(1)?;
            forward.insert(value.clone(), id);
            inverse.insert(id, value);
        }
        Ok(TableLookup {
            table,
            forward,
            inverse,
        })
    }

    /// Id for `value`, interning it when absent.
    pub fn id_for(&mut self, conn: &Connection, value: &str) -> Result<i64> {
        if let Some(&id) = self.forward.get(value) {
            return Ok(id);
        }
        conn.execute(
            &format!("INSERT OR IGNORE INTO {} (value) VALUES (?1)", self.table),
            [value],
        )?;
        let id: i64 = conn.query_row(
            &format!("SELECT id FROM {} WHERE value = ?1", self.table),
            [value],
            |row| row.get(0),
        )?;
        self.forward.insert(value.to_string(), id);
        self.inverse.insert(id, value.to_string());
        Ok(id)
    }

    /// Id for `value` without interning. `None` means the value has never
    /// been stored, so no event can reference it.
    pub fn lookup(&self, value: &str) -> Option<i64> {
        self.forward.get(value).copied()
    }

    pub fn value(&self, id: i64) -> Option<&str> {
        self.inverse.get(&id).map(|s| s.as_str())
    }
}

#[derive(Clone, Copy, PartialEq)]
pub enum Relation {
    And,
    Or,
}

/// Composable SQL WHERE fragment.
///
/// Conditions joined by one relation; nest instances through [`extend`]
/// for mixed AND/OR shapes. A member that is known to yield nothing (a
/// template naming a value that was never interned) is recorded with
/// [`register_no_result`] so the whole query can be short-circuited.
///
/// [`extend`]: WhereClause::extend
/// [`register_no_result`]: WhereClause::register_no_result
pub struct WhereClause {
    relation: Relation,
    conditions: Vec<String>,
    pub arguments: Vec<Value>,
    no_result_member: bool,
}

impl WhereClause {
    pub fn new(relation: Relation) -> Self {
        WhereClause {
            relation,
            conditions: Vec::new(),
            arguments: Vec::new(),
            no_result_member: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn add(&mut self, condition: impl Into<String>, arguments: Vec<Value>) {
        self.conditions.push(condition.into());
        self.arguments.extend(arguments);
    }

    pub fn extend(&mut self, other: WhereClause) {
        if !other.may_have_results() {
            if self.relation == Relation::And {
                self.conditions.clear();
                self.arguments.clear();
            }
            self.register_no_result();
            return;
        }
        if let Some(sql) = other.sql() {
            self.conditions.push(sql);
            self.arguments.extend(other.arguments);
        }
    }

    pub fn register_no_result(&mut self) {
        self.no_result_member = true;
    }

    /// False when cached knowledge already proves an empty result.
    pub fn may_have_results(&self) -> bool {
        !self.conditions.is_empty() || !self.no_result_member
    }

    pub fn sql(&self) -> Option<String> {
        if self.conditions.is_empty() {
            return None;
        }
        let joiner = match self.relation {
            Relation::And => " AND ",
            Relation::Or => " OR ",
        };
        Some(format!("({})", self.conditions.join(joiner)))
    }
}

/// Open connection plus warmed interning caches.
pub struct Store {
    pub conn: Connection,
    interpretation: TableLookup,
    manifestation: TableLookup,
    mimetype: TableLookup,
    actor: TableLookup,
    last_event_id: u64,
}

impl Store {
    pub fn open(path: &PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        upgrades::ensure_schema(&conn)?;
        let last_event_id: Option<i64> =
            conn.query_row("SELECT MAX(id) FROM event", [], |row| row.get(0))?;
        let interpretation = TableLookup::new(&conn, "interpretation")?;
        let manifestation = TableLookup::new(&conn, "manifestation")?;
        let mimetype = TableLookup::new(&conn, "mimetype")?;
        let actor = TableLookup::new(&conn, "actor")?;
        info!(path = %path.display(), "opened database");
        Ok(Store {
            conn,
            interpretation,
            manifestation,
            mimetype,
            actor,
            last_event_id: last_event_id.unwrap_or(0) as u64,
        })
    }
}

pub struct Engine {
    db_path: PathBuf,
    store: Option<Store>,
    cache: LruCache<u64, Event>,
    pub extensions: ExtensionRegistry,
}

impl Engine {
    pub fn new(db_path: PathBuf, cache_size: usize, extensions: ExtensionRegistry) -> Self {
        Engine {
            db_path,
            store: None,
            cache: LruCache::new(cache_size),
            extensions,
        }
    }

    /// Unload extensions and release the database.
    pub fn close(&mut self) {
        self.extensions.unload_all();
        self.store = None;
        self.cache.clear();
    }

    fn store(&mut self) -> Result<&mut Store> {
        if self.store.is_none() {
            self.store = Some(Store::open(&self.db_path)?);
        }
        // Just assigned when absent.
        self.store
            .as_mut()
            .ok_or_else(|| Error::Other("store unavailable".to_string()))
    }

    /// Drop the store on database errors so the next request reopens it.
    fn run<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let result = f(self);
        if matches!(result, Err(Error::Database(_))) {
            warn!("database error, discarding connection");
            self.store = None;
        }
        result
    }

    pub fn insert_events(&mut self, events: Vec<Event>, sender: &str) -> Result<Vec<u64>> {
        self.run(|engine| {
            let mut ids = Vec::with_capacity(events.len());
            for event in events {
                match engine.insert_event(event, sender) {
                    Ok(id) => ids.push(id),
                    Err(e) => {
                        warn!(error = %e, "failed to insert event");
                        ids.push(0);
                    }
                }
            }
            Ok(ids)
        })
    }

    /// Insert one event and return its id. Returns the id of the already
    /// stored event when the unique tuple clashes, and 0 when an
    /// extension vetoed the insert.
    pub fn insert_event(&mut self, event: Event, sender: &str) -> Result<u64> {
        self.run(|engine| engine.insert_event_inner(event, sender))
    }

    fn insert_event_inner(&mut self, mut event: Event, sender: &str) -> Result<u64> {
        if event.id != 0 {
            return Err(Error::protocol(0, "events must not carry a predefined id"));
        }
        if event.subjects.is_empty() {
            return Err(Error::protocol(0, "events must have at least one subject"));
        }
        if event.timestamp == 0 {
            event.timestamp = timestamp_now();
        }

        let is_move = event.interpretation == zg::MOVE_EVENT;
        for subject in &mut event.subjects {
            if is_move {
                if subject.current_uri.is_empty() || subject.current_uri == subject.uri {
                    return Err(Error::protocol(
                        0,
                        "a move event must give a current_uri different from uri",
                    ));
                }
            } else if subject.current_uri.is_empty() {
                subject.current_uri = subject.uri.clone();
            } else if subject.current_uri != subject.uri {
                return Err(Error::protocol(
                    0,
                    "uri and current_uri may only differ on move events",
                ));
            }
        }

        let store = self.store()?;
        let id = store.last_event_id + 1;
        store.last_event_id = id;
        event.id = id;

        let event = match self.extensions.apply_pre_insert(event, sender) {
            Some(event) => event,
            None => {
                // Vetoed; hand the id back.
                if let Some(store) = self.store.as_mut() {
                    store.last_event_id -= 1;
                }
                return Ok(0);
            }
        };

        // Insert-if-absent: probe for a stored event that would trip the
        // unique constraint before writing anything, then run the row
        // writes under a savepoint so a mid-event failure never leaves a
        // partial event behind.
        let (interp, manif, actor) = {
            let store = self.store()?;
            let interp = store.interpretation.id_for(&store.conn, &event.interpretation)?;
            let manif = store.manifestation.id_for(&store.conn, &event.manifestation)?;
            let actor = store.actor.id_for(&store.conn, &event.actor)?;
            if let Some(existing) = find_duplicate(store, &event, interp, manif, actor)? {
                store.last_event_id -= 1;
                debug!(id = existing, "duplicate event folded onto existing id");
                return Ok(existing);
            }
            store.conn.execute_batch("SAVEPOINT insert_event")?;
            (interp, manif, actor)
        };

        match self.insert_event_rows(&event, interp, manif, actor) {
            Ok(()) => {
                self.store()?.conn.execute_batch("RELEASE insert_event")?;
            }
            Err(e) => {
                if let Some(store) = self.store.as_mut() {
                    let _ = store
                        .conn
                        .execute_batch("ROLLBACK TO insert_event; RELEASE insert_event");
                }
                return Err(e);
            }
        }

        if is_move {
            self.propagate_move(&event)?;
        }
        self.extensions.apply_post_insert(&event, sender);
        Ok(id)
    }

    fn insert_event_rows(
        &mut self,
        event: &Event,
        interp: i64,
        manif: i64,
        actor: i64,
    ) -> Result<()> {
        let store = self.store()?;
        let conn = &store.conn;

        let payload_id: Option<i64> = if event.payload.is_empty() {
            None
        } else {
            conn.execute(
                "INSERT INTO payload (value) VALUES (?1)",
                [&event.payload],
            )?;
            Some(conn.last_insert_rowid())
        };

        {
            let mut intern_uri = conn.prepare_cached(
                "INSERT OR IGNORE INTO uri (value) VALUES (?1)",
            )?;
            if !event.origin.is_empty() {
                intern_uri.execute([&event.origin])?;
            }
            for subject in &event.subjects {
                intern_uri.execute([&subject.uri])?;
                intern_uri.execute([&subject.current_uri])?;
                if !subject.origin.is_empty() {
                    intern_uri.execute([&subject.origin])?;
                }
            }
        }
        {
            let mut intern_text =
                conn.prepare_cached("INSERT OR IGNORE INTO text (value) VALUES (?1)")?;
            let mut intern_storage =
                conn.prepare_cached("INSERT OR IGNORE INTO storage (value) VALUES (?1)")?;
            for subject in &event.subjects {
                if !subject.text.is_empty() {
                    intern_text.execute([&subject.text])?;
                }
                if !subject.storage.is_empty() {
                    intern_storage.execute([&subject.storage])?;
                }
            }
        }

        for subject in &event.subjects {
            let subj_interp = if subject.interpretation.is_empty() {
                None
            } else {
                Some(store.interpretation.id_for(&store.conn, &subject.interpretation)?)
            };
            let subj_manif = if subject.manifestation.is_empty() {
                None
            } else {
                Some(store.manifestation.id_for(&store.conn, &subject.manifestation)?)
            };
            let subj_mime = if subject.mimetype.is_empty() {
                None
            } else {
                Some(store.mimetype.id_for(&store.conn, &subject.mimetype)?)
            };

            // Empty strings resolve to NULL through the subqueries since
            // they are never interned.
            store.conn.execute(
                "INSERT INTO event (
                    id, timestamp, interpretation, manifestation, actor,
                    origin, payload, subj_id, subj_id_current,
                    subj_interpretation, subj_manifestation, subj_origin,
                    subj_mimetype, subj_text, subj_storage
                 ) VALUES (
                    ?1, ?2, ?3, ?4, ?5,
                    (SELECT id FROM uri WHERE value = ?6),
                    ?7,
                    (SELECT id FROM uri WHERE value = ?8),
                    (SELECT id FROM uri WHERE value = ?9),
                    ?10, ?11,
                    (SELECT id FROM uri WHERE value = ?12),
                    ?13,
                    (SELECT id FROM text WHERE value = ?14),
                    (SELECT id FROM storage WHERE value = ?15)
                 )",
                rusqlite::params![
                    event.id,
                    event.timestamp,
                    interp,
                    manif,
                    actor,
                    event.origin,
                    payload_id,
                    subject.uri,
                    subject.current_uri,
                    subj_interp,
                    subj_manif,
                    subject.origin,
                    subj_mime,
                    subject.text,
                    subject.storage,
                ],
            )?;
        }
        Ok(())
    }

    /// A move changes where older rows believe the subject lives now, both
    /// on disk and in the event cache.
    fn propagate_move(&mut self, event: &Event) -> Result<()> {
        let store = self.store()?;
        let move_interp = store.interpretation.id_for(&store.conn, zg::MOVE_EVENT)?;
        for subject in &event.subjects {
            store.conn.execute(
                "UPDATE event
                 SET subj_id_current = (SELECT id FROM uri WHERE value = ?1)
                 WHERE subj_id_current = (SELECT id FROM uri WHERE value = ?2)
                   AND interpretation != ?3 AND timestamp < ?4",
                rusqlite::params![
                    subject.current_uri,
                    subject.uri,
                    move_interp,
                    event.timestamp
                ],
            )?;
        }
        for subject in &event.subjects {
            for (_, cached) in self.cache.values_mut() {
                if cached.timestamp < event.timestamp
                    && cached.interpretation != zg::MOVE_EVENT
                {
                    for cached_subject in &mut cached.subjects {
                        if cached_subject.current_uri == subject.uri {
                            cached_subject.current_uri = subject.current_uri.clone();
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub fn find_event_ids(
        &mut self,
        time_range: TimeRange,
        templates: &[EventTemplate],
        storage_state: StorageState,
        max_events: u32,
        result_type: ResultType,
    ) -> Result<Vec<u64>> {
        self.run(|engine| {
            engine.find_event_ids_inner(
                time_range,
                templates,
                storage_state,
                max_events,
                result_type,
            )
        })
    }

    fn find_event_ids_inner(
        &mut self,
        time_range: TimeRange,
        templates: &[EventTemplate],
        storage_state: StorageState,
        max_events: u32,
        result_type: ResultType,
    ) -> Result<Vec<u64>> {
        let store = self.store()?;
        let where_clause =
            build_event_filter(store, time_range, templates, storage_state);
        if !where_clause.may_have_results() {
            return Ok(Vec::new());
        }

        let where_sql = match where_clause.sql() {
            Some(sql) => format!(" WHERE {}", sql),
            None => String::new(),
        };

        let group_and_sort = |time_desc: bool, by_count: Option<bool>| {
            let mut aggregation = String::new();
            let mut order = String::new();
            if let Some(count_asc) = by_count {
                aggregation = ", COUNT(subj_id) AS num_events".to_string();
                order = format!("num_events {}, ", if count_asc { "ASC" } else { "DESC" });
            }
            let direction = if time_desc { "DESC" } else { "ASC" };
            format!(
                " NATURAL JOIN (
                    SELECT subj_id, max(timestamp) AS timestamp{aggregation}
                    FROM event_view{where_sql}
                    GROUP BY subj_id)
                 GROUP BY subj_id
                 ORDER BY {order}timestamp {direction}, id {direction}"
            )
        };

        let mut sql = "SELECT DISTINCT id FROM event_view".to_string();
        match result_type {
            ResultType::MostRecentEvents => {
                sql += &where_sql;
                sql += " ORDER BY timestamp DESC, id DESC";
            }
            ResultType::LeastRecentEvents => {
                sql += &where_sql;
                sql += " ORDER BY timestamp ASC, id ASC";
            }
            ResultType::MostRecentSubjects => sql += &group_and_sort(true, None),
            ResultType::LeastRecentSubjects => sql += &group_and_sort(false, None),
            ResultType::MostPopularSubjects => sql += &group_and_sort(true, Some(false)),
            ResultType::LeastPopularSubjects => sql += &group_and_sort(false, Some(true)),
        }
        if max_events > 0 {
            sql += &format!(" LIMIT {}", max_events);
        }

        let mut stmt = store.conn.prepare(&sql)?;
        let ids = stmt
            .query_map(rusqlite::params_from_iter(where_clause.arguments.iter()), |row| {
                row.get::<_, u64>(0)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        debug!(count = ids.len(), "query matched events");
        Ok(ids)
    }

    pub fn find_events(
        &mut self,
        time_range: TimeRange,
        templates: &[EventTemplate],
        storage_state: StorageState,
        max_events: u32,
        result_type: ResultType,
    ) -> Result<Vec<Event>> {
        let ids =
            self.find_event_ids(time_range, templates, storage_state, max_events, result_type)?;
        let events = self.get_events(&ids)?;
        Ok(events.into_iter().flatten().collect())
    }

    /// Resolve ids to events, preserving order and duplicates. Unknown ids
    /// yield `None`.
    pub fn get_events(&mut self, ids: &[u64]) -> Result<Vec<Option<Event>>> {
        self.run(|engine| engine.get_events_inner(ids))
    }

    fn get_events_inner(&mut self, ids: &[u64]) -> Result<Vec<Option<Event>>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        // A huge batch would wipe the whole cache; serve it uncached.
        let use_cache = ids.len() <= self.cache.max_size() / 2;

        let mut positions: HashMap<u64, Vec<usize>> = HashMap::new();
        for (n, &id) in ids.iter().enumerate() {
            positions.entry(id).or_default().push(n);
        }

        let mut sorted: Vec<Option<Event>> = vec![None; ids.len()];
        let mut uncached: Vec<u64> = Vec::new();
        if use_cache {
            for &id in positions.keys() {
                if !self.cache.contains(&id) {
                    uncached.push(id);
                }
            }
            for (&id, spots) in &positions {
                if let Some(event) = self.cache.get(&id).cloned() {
                    for &n in spots {
                        sorted[n] = Some(event.clone());
                    }
                }
            }
        } else {
            uncached = positions.keys().copied().collect();
        }

        if uncached.is_empty() {
            return Ok(sorted);
        }

        let events: HashMap<u64, Event> = {
            let store = self.store()?;
            let id_list = uncached
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(",");
            let sql = format!(
                "SELECT id, timestamp, interpretation, manifestation, actor,
                    event_origin_uri, payload,
                    subj_uri, subj_interpretation, subj_manifestation,
                    subj_origin_uri, subj_mimetype, subj_text, subj_storage,
                    subj_current_uri
                 FROM event_view WHERE id IN ({})",
                id_list
            );
            let mut events: HashMap<u64, Event> = HashMap::new();
            let mut stmt = store.conn.prepare(&sql)?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let id: u64 = row.get(0)?;
                let subject = Subject {
                    uri: row.get(7)?,
                    interpretation: resolve(&store.interpretation, row.get(8)?, id)?,
                    manifestation: resolve(&store.manifestation, row.get(9)?, id)?,
                    origin: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
                    mimetype: resolve(&store.mimetype, row.get(11)?, id)?,
                    text: row.get::<_, Option<String>>(12)?.unwrap_or_default(),
                    storage: row.get::<_, Option<String>>(13)?.unwrap_or_default(),
                    current_uri: row.get::<_, Option<String>>(14)?.unwrap_or_default(),
                    current_origin: String::new(),
                };
                let event = events.entry(id).or_insert_with(|| Event {
                    id,
                    ..Default::default()
                });
                if event.subjects.is_empty() {
                    event.timestamp = row.get(1)?;
                    event.interpretation =
                        resolve_req(&store.interpretation, row.get(2)?, id)?;
                    event.manifestation =
                        resolve_req(&store.manifestation, row.get(3)?, id)?;
                    event.actor = resolve_req(&store.actor, row.get(4)?, id)?;
                    event.origin = row.get::<_, Option<String>>(5)?.unwrap_or_default();
                    event.payload = row.get::<_, Option<Vec<u8>>>(6)?.unwrap_or_default();
                }
                event.subjects.push(subject);
            }
            events
        };

        for (id, event) in events {
            if use_cache && event.payload.is_empty() {
                self.cache.insert(id, event.clone());
            }
            if let Some(spots) = positions.get(&id) {
                for &n in spots {
                    sorted[n] = Some(event.clone());
                }
            }
        }
        Ok(sorted)
    }

    /// Delete events by id, returning the bounding timestamps of the rows
    /// actually removed, or `None` when no id matched.
    pub fn delete_events(&mut self, ids: &[u64], sender: &str) -> Result<Option<(i64, i64)>> {
        self.run(|engine| {
            let ids = engine.extensions.apply_pre_delete(ids.to_vec(), sender);
            if ids.is_empty() {
                return Ok(None);
            }
            let id_list = ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(",");
            let store = engine.store()?;
            let bounds: (Option<i64>, Option<i64>) = store.conn.query_row(
                &format!(
                    "SELECT MIN(timestamp), MAX(timestamp) FROM event WHERE id IN ({})",
                    id_list
                ),
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let (Some(min), Some(max)) = bounds else {
                debug!("tried to delete non-existing events");
                return Ok(None);
            };
            store
                .conn
                .execute(&format!("DELETE FROM event WHERE id IN ({})", id_list), [])?;
            for id in &ids {
                engine.cache.remove(id);
            }
            engine.extensions.apply_post_delete(&ids, sender);
            info!(count = ids.len(), "deleted events");
            Ok(Some((min, max)))
        })
    }

    /// Drop the whole log and start over with an empty database.
    pub fn delete_log(&mut self) -> Result<()> {
        self.store = None;
        self.cache.clear();
        for suffix in ["", "-wal", "-shm"] {
            let mut path = self.db_path.as_os_str().to_owned();
            path.push(suffix);
            match std::fs::remove_file(PathBuf::from(path)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        info!("deleted activity log");
        // Reopen eagerly so a broken data dir surfaces now.
        self.store()?;
        Ok(())
    }

    /// Rank URIs that appear in the event-id neighborhood of events
    /// matching `templates`. Result type 0 ranks by co-occurrence count,
    /// 1 by the latest timestamp of the co-occurrence.
    pub fn find_related_uris(
        &mut self,
        time_range: TimeRange,
        templates: &[EventTemplate],
        result_templates: &[EventTemplate],
        storage_state: StorageState,
        max_results: u32,
        result_type: u32,
    ) -> Result<Vec<String>> {
        if result_type > 1 {
            return Err(Error::Other(format!(
                "unsupported relatedness result type {}",
                result_type
            )));
        }
        let ids = self.find_event_ids(
            time_range,
            templates,
            storage_state,
            0,
            ResultType::LeastRecentEvents,
        )?;
        let result_ids: Vec<u64> = if result_templates.is_empty() {
            Vec::new()
        } else {
            self.find_event_ids(
                time_range,
                result_templates,
                storage_state,
                0,
                ResultType::LeastRecentEvents,
            )?
        };

        // Events two ids away in either direction count as co-occurring.
        let mut pot: Vec<u64> = Vec::new();
        for &id in &ids {
            for x in id.saturating_sub(2)..=id + 2 {
                if result_ids.is_empty() || result_ids.contains(&x) {
                    pot.push(x);
                }
            }
        }
        if pot.is_empty() {
            return Ok(Vec::new());
        }

        self.run(|engine| {
            let store = engine.store()?;
            let id_list = pot
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(",");
            let mut stmt = store.conn.prepare(&format!(
                "SELECT id, timestamp, subj_uri FROM event_view WHERE id IN ({})",
                id_list
            ))?;
            let mut counter: HashMap<String, (u64, i64)> = HashMap::new();
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let id: u64 = row.get(0)?;
                let timestamp: i64 = row.get(1)?;
                let uri: Option<String> = row.get(2)?;
                if ids.contains(&id) {
                    continue;
                }
                let Some(uri) = uri else { continue };
                let entry = counter.entry(uri).or_insert((0, 0));
                entry.0 += 1;
                entry.1 = entry.1.max(timestamp);
            }

            let mut ranked: Vec<(String, u64, i64)> = counter
                .into_iter()
                .map(|(uri, (count, latest))| (uri, count, latest))
                .collect();
            if result_type == 0 {
                ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            } else {
                ranked.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| a.0.cmp(&b.0)));
            }
            if max_results > 0 {
                ranked.truncate(max_results as usize);
            }
            Ok(ranked.into_iter().map(|(uri, _, _)| uri).collect())
        })
    }

    /// Point every row whose original subject is `old_uri` at `new_uri`.
    /// Idempotent; returns the number of rows touched.
    pub fn rename_subject(&mut self, old_uri: &str, new_uri: &str) -> Result<u64> {
        self.run(|engine| {
            let store = engine.store()?;
            store
                .conn
                .execute("INSERT OR IGNORE INTO uri (value) VALUES (?1)", [new_uri])?;
            let changed = store.conn.execute(
                "UPDATE event
                 SET subj_id_current = (SELECT id FROM uri WHERE value = ?1)
                 WHERE subj_id = (SELECT id FROM uri WHERE value = ?2)",
                [new_uri, old_uri],
            )?;
            for (_, cached) in engine.cache.values_mut() {
                for subject in &mut cached.subjects {
                    if subject.uri == old_uri {
                        subject.current_uri = new_uri.to_string();
                    }
                }
            }
            Ok(changed as u64)
        })
    }

    #[cfg(test)]
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

/// The stored id an insert of `event` would collide with under the
/// per-subject unique constraint, if any.
fn find_duplicate(
    store: &Store,
    event: &Event,
    interp: i64,
    manif: i64,
    actor: i64,
) -> Result<Option<u64>> {
    let mut stmt = store.conn.prepare_cached(
        "SELECT id FROM event
         WHERE timestamp = ?1 AND interpretation = ?2
           AND manifestation = ?3 AND actor = ?4
           AND subj_id = (SELECT id FROM uri WHERE value = ?5)
         LIMIT 1",
    )?;
    for subject in &event.subjects {
        let existing = stmt
            .query_row(
                rusqlite::params![event.timestamp, interp, manif, actor, subject.uri],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Ok(existing);
        }
    }
    Ok(None)
}

fn resolve(lookup: &TableLookup, id: Option<i64>, event_id: u64) -> Result<String> {
    match id {
        None => Ok(String::new()),
        Some(id) => match lookup.value(id) {
            Some(value) => Ok(value.to_string()),
            None => {
                warn!(event_id, table = lookup.table, id, "dangling lookup reference");
                Ok(String::new())
            }
        },
    }
}

fn resolve_req(lookup: &TableLookup, id: i64, event_id: u64) -> Result<String> {
    resolve(lookup, Some(id), event_id)
}

/// Compile time range, storage state and the template disjunction into one
/// WHERE clause over `event_view`.
fn build_event_filter(
    store: &Store,
    time_range: TimeRange,
    templates: &[EventTemplate],
    storage_state: StorageState,
) -> WhereClause {
    let mut where_clause = WhereClause::new(Relation::And);
    if time_range.begin != 0 {
        where_clause.add("timestamp >= ?", vec![Value::Integer(time_range.begin)]);
    }
    if time_range.end != i64::MAX {
        where_clause.add("timestamp <= ?", vec![Value::Integer(time_range.end)]);
    }
    if storage_state != StorageState::Any {
        where_clause.add(
            "(subj_storage_state = ? OR subj_storage_state IS NULL)",
            vec![Value::Integer(storage_state as i64)],
        );
    }
    where_clause.extend(build_template_filter(store, templates));
    where_clause
}

fn build_template_filter(store: &Store, templates: &[EventTemplate]) -> WhereClause {
    let mut where_or = WhereClause::new(Relation::Or);
    let registry = ontology::registry();

    for template in templates {
        let mut subwhere = WhereClause::new(Relation::And);
        let mut dead = false;

        if let Some(id) = template.id {
            subwhere.add("id = ?", vec![Value::Integer(id as i64)]);
        }

        add_symbol_condition(
            &mut subwhere,
            &mut dead,
            "interpretation",
            &template.interpretation,
            &store.interpretation,
            registry,
        );
        add_symbol_condition(
            &mut subwhere,
            &mut dead,
            "manifestation",
            &template.manifestation,
            &store.manifestation,
            registry,
        );
        add_interned_condition(&mut subwhere, &mut dead, "actor", &template.actor, &store.actor);
        add_string_condition(&mut subwhere, "event_origin_uri", &template.origin);

        for subject in &template.subjects {
            add_symbol_condition(
                &mut subwhere,
                &mut dead,
                "subj_interpretation",
                &subject.interpretation,
                &store.interpretation,
                registry,
            );
            add_symbol_condition(
                &mut subwhere,
                &mut dead,
                "subj_manifestation",
                &subject.manifestation,
                &store.manifestation,
                registry,
            );
            add_interned_condition(
                &mut subwhere,
                &mut dead,
                "subj_mimetype",
                &subject.mimetype,
                &store.mimetype,
            );
            add_string_condition(&mut subwhere, "subj_uri", &subject.uri);
            add_string_condition(&mut subwhere, "subj_origin_uri", &subject.origin);
            add_string_condition(&mut subwhere, "subj_text", &subject.text);
            add_string_condition(&mut subwhere, "subj_current_uri", &subject.current_uri);
            add_string_condition(&mut subwhere, "subj_storage", &subject.storage);
        }

        if dead {
            where_or.register_no_result();
            continue;
        }
        if subwhere.is_empty() {
            // An unconstrained template matches everything; the whole
            // disjunction collapses.
            return WhereClause::new(Relation::Or);
        }
        where_or.extend(subwhere);
    }
    where_or
}

/// Classifier columns carry interned ids and match the template value or
/// any ontology descendant of it.
fn add_symbol_condition(
    subwhere: &mut WhereClause,
    dead: &mut bool,
    column: &str,
    value: &Option<String>,
    lookup: &TableLookup,
    registry: &ontology::SymbolRegistry,
) {
    let Some(value) = value else { return };
    let mut ids: Vec<i64> = Vec::new();
    for uri in registry.descendants(value) {
        if let Some(id) = lookup.lookup(&uri) {
            ids.push(id);
        }
    }
    if ids.is_empty() {
        // None of the candidate symbols were ever stored.
        *dead = true;
        return;
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    subwhere.add(
        format!("{} IN ({})", column, placeholders),
        ids.into_iter().map(Value::Integer).collect(),
    );
}

fn add_interned_condition(
    subwhere: &mut WhereClause,
    dead: &mut bool,
    column: &str,
    value: &Option<String>,
    lookup: &TableLookup,
) {
    let Some(value) = value else { return };
    match lookup.lookup(value) {
        Some(id) => subwhere.add(format!("{} = ?", column), vec![Value::Integer(id)]),
        None => *dead = true,
    }
}

/// Columns the view resolves to strings; NULL for never-set fields.
fn add_string_condition(subwhere: &mut WhereClause, column: &str, value: &Option<String>) {
    let Some(value) = value else { return };
    if value.is_empty() {
        subwhere.add(format!("{} IS NULL", column), vec![]);
    } else {
        subwhere.add(
            format!("{} = ?", column),
            vec![Value::Text(value.clone())],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronolog_core::ontology::nfo;
    use chronolog_core::types::SubjectTemplate;

    fn test_engine() -> (Engine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(
            dir.path().join("activity.sqlite"),
            DEFAULT_CACHE_SIZE,
            ExtensionRegistry::new(),
        );
        (engine, dir)
    }

    fn access_event(timestamp: i64, uri: &str, actor: &str) -> Event {
        Event {
            timestamp,
            interpretation: zg::ACCESS_EVENT.to_string(),
            manifestation: zg::USER_ACTIVITY.to_string(),
            actor: actor.to_string(),
            subjects: vec![Subject {
                uri: uri.to_string(),
                interpretation: nfo::DOCUMENT.to_string(),
                manifestation: nfo::FILE_DATA_OBJECT.to_string(),
                mimetype: "text/plain".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn insert_and_get_round_trip() {
        let (mut engine, _dir) = test_engine();
        let id = engine
            .insert_event(access_event(1000, "file:///a", "app://a.desktop"), "")
            .unwrap();
        assert_eq!(id, 1);

        let events = engine.get_events(&[1, 99]).unwrap();
        assert_eq!(events.len(), 2);
        let event = events[0].as_ref().unwrap();
        assert_eq!(event.timestamp, 1000);
        assert_eq!(event.interpretation, zg::ACCESS_EVENT);
        assert_eq!(event.subjects[0].uri, "file:///a");
        assert_eq!(event.subjects[0].current_uri, "file:///a");
        assert!(events[1].is_none());
    }

    #[test]
    fn duplicate_ids_fill_every_position() {
        let (mut engine, _dir) = test_engine();
        engine
            .insert_event(access_event(1000, "file:///a", "app://a.desktop"), "")
            .unwrap();
        let events = engine.get_events(&[1, 1, 1]).unwrap();
        assert!(events.iter().all(|e| e.is_some()));
    }

    #[test]
    fn identical_events_fold_onto_one_id() {
        let (mut engine, _dir) = test_engine();
        let first = engine
            .insert_event(access_event(1000, "file:///a", "app://a.desktop"), "")
            .unwrap();
        let mut duplicate = access_event(1000, "file:///a", "app://a.desktop");
        duplicate.payload = vec![9, 9];
        let second = engine.insert_event(duplicate, "").unwrap();
        assert_eq!(first, second);

        // The id counter was rolled back.
        let third = engine
            .insert_event(access_event(2000, "file:///b", "app://a.desktop"), "")
            .unwrap();
        assert_eq!(third, 2);
    }

    #[test]
    fn overlapping_duplicate_leaves_no_partial_event_behind() {
        let (mut engine, _dir) = test_engine();
        let first = engine
            .insert_event(access_event(1000, "file:///s1", "app://a.desktop"), "")
            .unwrap();

        // Shares one subject with the stored event; folds instead of
        // inserting.
        let mut overlap = access_event(1000, "file:///s2", "app://a.desktop");
        let shared = access_event(1000, "file:///s1", "app://a.desktop")
            .subjects
            .remove(0);
        overlap.subjects.push(shared);
        let folded = engine.insert_event(overlap, "").unwrap();
        assert_eq!(folded, first);

        let event = engine.get_events(&[first]).unwrap()[0].clone().unwrap();
        assert_eq!(event.subjects.len(), 1);
        assert_eq!(event.subjects[0].uri, "file:///s1");

        // The aborted insert left no row behind under the reused id.
        let next = engine
            .insert_event(access_event(3000, "file:///c", "app://a.desktop"), "")
            .unwrap();
        assert_eq!(next, 2);
        let event = engine.get_events(&[next]).unwrap()[0].clone().unwrap();
        assert_eq!(event.subjects.len(), 1);
        assert_eq!(event.subjects[0].uri, "file:///c");
    }

    #[test]
    fn same_metadata_with_disjoint_subject_is_a_new_event() {
        let (mut engine, _dir) = test_engine();
        let first = engine
            .insert_event(access_event(1000, "file:///a", "app://a.desktop"), "")
            .unwrap();
        let second = engine
            .insert_event(access_event(1000, "file:///b", "app://a.desktop"), "")
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(second, 2);
    }

    #[test]
    fn predefined_id_is_rejected() {
        let (mut engine, _dir) = test_engine();
        let mut event = access_event(1000, "file:///a", "app://a.desktop");
        event.id = 12;
        assert!(matches!(
            engine.insert_event(event, ""),
            Err(Error::Protocol { .. })
        ));
    }

    #[test]
    fn subjectless_event_is_rejected() {
        let (mut engine, _dir) = test_engine();
        let mut event = access_event(1000, "file:///a", "app://a.desktop");
        event.subjects.clear();
        assert!(engine.insert_event(event, "").is_err());
    }

    #[test]
    fn zero_timestamp_gets_assigned() {
        let (mut engine, _dir) = test_engine();
        let id = engine
            .insert_event(access_event(0, "file:///a", "app://a.desktop"), "")
            .unwrap();
        let event = engine.get_events(&[id]).unwrap()[0].clone().unwrap();
        assert!(event.timestamp > 0);
    }

    #[test]
    fn batch_insert_reports_per_event_failures() {
        let (mut engine, _dir) = test_engine();
        let mut bad = access_event(1000, "file:///a", "app://a.desktop");
        bad.subjects.clear();
        let good = access_event(1000, "file:///b", "app://a.desktop");
        let ids = engine.insert_events(vec![bad, good], "").unwrap();
        assert_eq!(ids[0], 0);
        assert!(ids[1] > 0);
    }

    #[test]
    fn query_orders_and_limits() {
        let (mut engine, _dir) = test_engine();
        for (n, t) in [(1u64, 100), (2, 300), (3, 200)] {
            engine
                .insert_event(
                    access_event(t, &format!("file:///{}", n), "app://a.desktop"),
                    "",
                )
                .unwrap();
        }
        let ids = engine
            .find_event_ids(
                TimeRange::always(),
                &[],
                StorageState::Any,
                0,
                ResultType::MostRecentEvents,
            )
            .unwrap();
        assert_eq!(ids, vec![2, 3, 1]);

        let ids = engine
            .find_event_ids(
                TimeRange::always(),
                &[],
                StorageState::Any,
                2,
                ResultType::LeastRecentEvents,
            )
            .unwrap();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn query_filters_by_time_range() {
        let (mut engine, _dir) = test_engine();
        for (n, t) in [(1u64, 100), (2, 200), (3, 300)] {
            engine
                .insert_event(
                    access_event(t, &format!("file:///{}", n), "app://a.desktop"),
                    "",
                )
                .unwrap();
        }
        let ids = engine
            .find_event_ids(
                TimeRange::new(150, 250),
                &[],
                StorageState::Any,
                0,
                ResultType::MostRecentEvents,
            )
            .unwrap();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn template_matching_expands_ontology() {
        let (mut engine, _dir) = test_engine();
        engine
            .insert_event(access_event(100, "file:///a", "app://a.desktop"), "")
            .unwrap();
        let mut leave = access_event(200, "file:///b", "app://b.desktop");
        leave.interpretation = zg::LEAVE_EVENT.to_string();
        engine.insert_event(leave, "").unwrap();

        // Parent symbol matches both children.
        let template = EventTemplate {
            interpretation: Some(zg::EVENT_INTERPRETATION.to_string()),
            ..Default::default()
        };
        let ids = engine
            .find_event_ids(
                TimeRange::always(),
                std::slice::from_ref(&template),
                StorageState::Any,
                0,
                ResultType::MostRecentEvents,
            )
            .unwrap();
        assert_eq!(ids.len(), 2);

        let template = EventTemplate {
            interpretation: Some(zg::LEAVE_EVENT.to_string()),
            ..Default::default()
        };
        let ids = engine
            .find_event_ids(
                TimeRange::always(),
                &[template],
                StorageState::Any,
                0,
                ResultType::MostRecentEvents,
            )
            .unwrap();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn unknown_template_value_short_circuits() {
        let (mut engine, _dir) = test_engine();
        engine
            .insert_event(access_event(100, "file:///a", "app://a.desktop"), "")
            .unwrap();
        let template = EventTemplate {
            actor: Some("app://never-seen.desktop".to_string()),
            ..Default::default()
        };
        let ids = engine
            .find_event_ids(
                TimeRange::always(),
                &[template],
                StorageState::Any,
                0,
                ResultType::MostRecentEvents,
            )
            .unwrap();
        assert!(ids.is_empty());
    }

    #[test]
    fn template_disjunction_unions_matches() {
        let (mut engine, _dir) = test_engine();
        engine
            .insert_event(access_event(100, "file:///a", "app://a.desktop"), "")
            .unwrap();
        engine
            .insert_event(access_event(200, "file:///b", "app://b.desktop"), "")
            .unwrap();
        let templates = vec![
            EventTemplate {
                actor: Some("app://a.desktop".to_string()),
                ..Default::default()
            },
            EventTemplate {
                actor: Some("app://b.desktop".to_string()),
                ..Default::default()
            },
        ];
        let ids = engine
            .find_event_ids(
                TimeRange::always(),
                &templates,
                StorageState::Any,
                0,
                ResultType::LeastRecentEvents,
            )
            .unwrap();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn subject_uri_template_filters() {
        let (mut engine, _dir) = test_engine();
        engine
            .insert_event(access_event(100, "file:///a", "app://a.desktop"), "")
            .unwrap();
        engine
            .insert_event(access_event(200, "file:///b", "app://a.desktop"), "")
            .unwrap();
        let template = EventTemplate {
            subjects: vec![SubjectTemplate {
                uri: Some("file:///b".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        };
        let ids = engine
            .find_event_ids(
                TimeRange::always(),
                &[template],
                StorageState::Any,
                0,
                ResultType::MostRecentEvents,
            )
            .unwrap();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn grouped_result_types_pick_one_event_per_subject() {
        let (mut engine, _dir) = test_engine();
        // file:///a is used three times, file:///b once.
        for t in [100, 200, 300] {
            engine
                .insert_event(access_event(t, "file:///a", "app://a.desktop"), "")
                .unwrap();
        }
        engine
            .insert_event(access_event(250, "file:///b", "app://a.desktop"), "")
            .unwrap();

        let ids = engine
            .find_event_ids(
                TimeRange::always(),
                &[],
                StorageState::Any,
                0,
                ResultType::MostRecentSubjects,
            )
            .unwrap();
        // Newest event of each subject: id 3 (t=300) and id 4 (t=250).
        assert_eq!(ids, vec![3, 4]);

        let ids = engine
            .find_event_ids(
                TimeRange::always(),
                &[],
                StorageState::Any,
                0,
                ResultType::MostPopularSubjects,
            )
            .unwrap();
        assert_eq!(ids, vec![3, 4]);

        let ids = engine
            .find_event_ids(
                TimeRange::always(),
                &[],
                StorageState::Any,
                0,
                ResultType::LeastPopularSubjects,
            )
            .unwrap();
        assert_eq!(ids, vec![4, 3]);
    }

    #[test]
    fn storage_state_filter_keeps_null_storage() {
        let (mut engine, _dir) = test_engine();
        engine
            .insert_event(access_event(100, "file:///a", "app://a.desktop"), "")
            .unwrap();
        let ids = engine
            .find_event_ids(
                TimeRange::always(),
                &[],
                StorageState::Available,
                0,
                ResultType::MostRecentEvents,
            )
            .unwrap();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn local_storage_is_available_on_a_fresh_database() {
        let (mut engine, _dir) = test_engine();
        let mut event = access_event(100, "file:///a", "app://a.desktop");
        event.subjects[0].storage = "local".to_string();
        engine.insert_event(event, "").unwrap();

        let ids = engine
            .find_event_ids(
                TimeRange::always(),
                &[],
                StorageState::Available,
                0,
                ResultType::MostRecentEvents,
            )
            .unwrap();
        assert_eq!(ids, vec![1]);

        let ids = engine
            .find_event_ids(
                TimeRange::always(),
                &[],
                StorageState::NotAvailable,
                0,
                ResultType::MostRecentEvents,
            )
            .unwrap();
        assert!(ids.is_empty());
    }

    #[test]
    fn delete_returns_bounds_and_invalidates_cache() {
        let (mut engine, _dir) = test_engine();
        engine
            .insert_event(access_event(100, "file:///a", "app://a.desktop"), "")
            .unwrap();
        engine
            .insert_event(access_event(300, "file:///b", "app://a.desktop"), "")
            .unwrap();
        engine.get_events(&[1, 2]).unwrap();
        assert_eq!(engine.cache_len(), 2);

        let bounds = engine.delete_events(&[1, 2], "").unwrap();
        assert_eq!(bounds, Some((100, 300)));
        assert_eq!(engine.cache_len(), 0);
        assert!(engine.get_events(&[1]).unwrap()[0].is_none());

        assert_eq!(engine.delete_events(&[77], "").unwrap(), None);
    }

    #[test]
    fn move_event_propagates_current_uri() {
        let (mut engine, _dir) = test_engine();
        engine
            .insert_event(access_event(100, "file:///old", "app://a.desktop"), "")
            .unwrap();

        let mut mv = access_event(200, "file:///old", "app://a.desktop");
        mv.interpretation = zg::MOVE_EVENT.to_string();
        mv.subjects[0].current_uri = "file:///new".to_string();
        engine.insert_event(mv, "").unwrap();

        let event = engine.get_events(&[1]).unwrap()[0].clone().unwrap();
        assert_eq!(event.subjects[0].uri, "file:///old");
        assert_eq!(event.subjects[0].current_uri, "file:///new");
    }

    #[test]
    fn move_event_requires_distinct_uris() {
        let (mut engine, _dir) = test_engine();
        let mut mv = access_event(200, "file:///old", "app://a.desktop");
        mv.interpretation = zg::MOVE_EVENT.to_string();
        mv.subjects[0].current_uri = "file:///old".to_string();
        assert!(engine.insert_event(mv, "").is_err());
    }

    #[test]
    fn mismatched_current_uri_is_rejected_for_non_moves() {
        let (mut engine, _dir) = test_engine();
        let mut event = access_event(100, "file:///a", "app://a.desktop");
        event.subjects[0].current_uri = "file:///elsewhere".to_string();
        assert!(engine.insert_event(event, "").is_err());
    }

    #[test]
    fn rename_subject_is_idempotent() {
        let (mut engine, _dir) = test_engine();
        engine
            .insert_event(access_event(100, "file:///old", "app://a.desktop"), "")
            .unwrap();
        assert_eq!(engine.rename_subject("file:///old", "file:///new").unwrap(), 1);
        assert_eq!(engine.rename_subject("file:///old", "file:///new").unwrap(), 1);
        assert_eq!(engine.rename_subject("file:///missing", "file:///x").unwrap(), 0);

        let event = engine.get_events(&[1]).unwrap()[0].clone().unwrap();
        assert_eq!(event.subjects[0].current_uri, "file:///new");
    }

    #[test]
    fn events_with_payload_are_not_cached() {
        let (mut engine, _dir) = test_engine();
        let mut event = access_event(100, "file:///a", "app://a.desktop");
        event.payload = vec![1, 2, 3];
        engine.insert_event(event, "").unwrap();
        engine
            .insert_event(access_event(200, "file:///b", "app://a.desktop"), "")
            .unwrap();

        engine.get_events(&[1, 2]).unwrap();
        assert_eq!(engine.cache_len(), 1);

        let event = engine.get_events(&[1]).unwrap()[0].clone().unwrap();
        assert_eq!(event.payload, vec![1, 2, 3]);
    }

    #[test]
    fn related_uris_rank_by_cooccurrence() {
        let (mut engine, _dir) = test_engine();
        // Neighborhood of the matching event (id 3) is ids 1..=5.
        engine
            .insert_event(access_event(100, "file:///n1", "app://x.desktop"), "")
            .unwrap();
        engine
            .insert_event(access_event(200, "file:///n2", "app://x.desktop"), "")
            .unwrap();
        engine
            .insert_event(access_event(300, "file:///target", "app://target.desktop"), "")
            .unwrap();
        engine
            .insert_event(access_event(400, "file:///n2", "app://x.desktop"), "")
            .unwrap();

        let template = EventTemplate {
            actor: Some("app://target.desktop".to_string()),
            ..Default::default()
        };
        let uris = engine
            .find_related_uris(TimeRange::always(), &[template], &[], StorageState::Any, 10, 0)
            .unwrap();
        assert_eq!(uris[0], "file:///n2");
        assert!(uris.contains(&"file:///n1".to_string()));
        assert!(!uris.contains(&"file:///target".to_string()));
    }

    #[test]
    fn delete_log_starts_fresh() {
        let (mut engine, _dir) = test_engine();
        engine
            .insert_event(access_event(100, "file:///a", "app://a.desktop"), "")
            .unwrap();
        engine.delete_log().unwrap();
        let ids = engine
            .find_event_ids(
                TimeRange::always(),
                &[],
                StorageState::Any,
                0,
                ResultType::MostRecentEvents,
            )
            .unwrap();
        assert!(ids.is_empty());
        // Ids restart from 1.
        let id = engine
            .insert_event(access_event(500, "file:///b", "app://a.desktop"), "")
            .unwrap();
        assert_eq!(id, 1);
    }

    #[test]
    fn engine_recovers_after_database_error() {
        let (mut engine, _dir) = test_engine();
        engine
            .insert_event(access_event(100, "file:///a", "app://a.desktop"), "")
            .unwrap();
        // Force a database error through a poisoned store.
        if let Some(store) = engine.store.as_mut() {
            store.conn.execute_batch("DROP VIEW event_view").unwrap();
        }
        assert!(engine
            .find_event_ids(
                TimeRange::always(),
                &[],
                StorageState::Any,
                0,
                ResultType::MostRecentEvents,
            )
            .is_err());
        // The store was dropped; the next call reopens and succeeds.
        let ids = engine
            .find_event_ids(
                TimeRange::always(),
                &[],
                StorageState::Any,
                0,
                ResultType::MostRecentEvents,
            )
            .unwrap();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn where_clause_composition() {
        let mut and = WhereClause::new(Relation::And);
        and.add("a = ?", vec![Value::Integer(1)]);
        let mut or = WhereClause::new(Relation::Or);
        or.add("b = ?", vec![Value::Integer(2)]);
        or.add("c = ?", vec![Value::Integer(3)]);
        and.extend(or);
        assert_eq!(and.sql().unwrap(), "(a = ? AND (b = ? OR c = ?))");
        assert_eq!(and.arguments.len(), 3);
    }

    #[test]
    fn where_clause_no_result_short_circuit() {
        let mut and = WhereClause::new(Relation::And);
        and.add("a = ?", vec![Value::Integer(1)]);
        let mut or = WhereClause::new(Relation::Or);
        or.register_no_result();
        and.extend(or);
        assert!(!and.may_have_results());

        // A no-result member of an OR is survivable while another member
        // remains.
        let mut or = WhereClause::new(Relation::Or);
        or.register_no_result();
        or.add("b = ?", vec![Value::Integer(2)]);
        assert!(or.may_have_results());
    }
}
