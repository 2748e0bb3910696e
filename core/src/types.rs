//! Core data types for Chronolog
//!
//! These types are shared between the daemon and the CLI. Events travel
//! over the wire in a positional "plain" form: a triple of metadata
//! strings, subject string-arrays, and payload bytes. Constructors accept
//! the plain form and validate it; producers emit it back unchanged.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ontology::SymbolRegistry;

/// Number of positional metadata fields in the plain event form.
pub const EVENT_META_FIELDS: usize = 6;
/// Number of positional fields in the plain subject form.
pub const SUBJECT_FIELDS: usize = 9;

/// Plain wire form of an event: `(metadata, subjects, payload)`.
pub type EventPlain = (Vec<String>, Vec<Vec<String>>, Vec<u8>);

/// Plain wire form of a data-source record.
pub type DataSourcePlain = (String, String, String, Vec<EventPlain>, bool, i64, bool);

/// Current timestamp in milliseconds since the Unix epoch.
pub fn timestamp_now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A referent of an event, typically a URI identifying a resource.
///
/// `uri` keeps the originally recorded value forever; `current_uri` is a
/// mutable alias that tracks renames and moves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub uri: String,
    pub interpretation: String,
    pub manifestation: String,
    pub origin: String,
    pub mimetype: String,
    pub text: String,
    pub storage: String,
    pub current_uri: String,
    pub current_origin: String,
}

impl Subject {
    pub fn new(uri: impl Into<String>) -> Self {
        Subject {
            uri: uri.into(),
            ..Default::default()
        }
    }

    /// Positional string form. Always exactly [`SUBJECT_FIELDS`] entries.
    pub fn to_plain(&self) -> Vec<String> {
        vec![
            self.uri.clone(),
            self.interpretation.clone(),
            self.manifestation.clone(),
            self.origin.clone(),
            self.mimetype.clone(),
            self.text.clone(),
            self.storage.clone(),
            self.current_uri.clone(),
            self.current_origin.clone(),
        ]
    }

    /// Parse the positional form. Accepts eight fields (pre-current_origin
    /// clients) or nine.
    pub fn from_plain(fields: &[String]) -> Result<Self> {
        if fields.len() != SUBJECT_FIELDS && fields.len() != SUBJECT_FIELDS - 1 {
            return Err(Error::protocol(
                fields.len(),
                format!("subject must have {} fields", SUBJECT_FIELDS),
            ));
        }
        let get = |n: usize| fields.get(n).cloned().unwrap_or_default();
        Ok(Subject {
            uri: get(0),
            interpretation: get(1),
            manifestation: get(2),
            origin: get(3),
            mimetype: get(4),
            text: get(5),
            storage: get(6),
            current_uri: get(7),
            current_origin: get(8),
        })
    }
}

/// A timestamped record of something that happened.
///
/// Nullable string fields are represented as the empty string, matching
/// the wire encoding; `payload` is opaque bytes and may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Surrogate id, 0 until assigned by the engine.
    pub id: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub interpretation: String,
    pub manifestation: String,
    pub actor: String,
    pub origin: String,
    pub subjects: Vec<Subject>,
    pub payload: Vec<u8>,
}

impl Event {
    /// Produce the plain nested-list form, free of any wrapper types.
    pub fn to_plain(&self) -> EventPlain {
        let meta = vec![
            if self.id == 0 {
                String::new()
            } else {
                self.id.to_string()
            },
            self.timestamp.to_string(),
            self.interpretation.clone(),
            self.manifestation.clone(),
            self.actor.clone(),
            self.origin.clone(),
        ];
        let subjects = self.subjects.iter().map(Subject::to_plain).collect();
        (meta, subjects, self.payload.clone())
    }

    /// Parse the plain form, validating arity and the numeric fields.
    /// Errors carry the index of the offending metadata field.
    pub fn from_plain(plain: &EventPlain) -> Result<Self> {
        let (meta, subjects, payload) = plain;
        if meta.len() != EVENT_META_FIELDS && meta.len() != EVENT_META_FIELDS - 1 {
            return Err(Error::protocol(
                meta.len(),
                format!("event metadata must have {} fields", EVENT_META_FIELDS),
            ));
        }
        let get = |n: usize| meta.get(n).cloned().unwrap_or_default();
        let id = if get(0).is_empty() {
            0
        } else {
            get(0)
                .parse::<u64>()
                .map_err(|_| Error::protocol(0, "event id is not an unsigned integer"))?
        };
        let timestamp = if get(1).is_empty() {
            0
        } else {
            get(1)
                .parse::<i64>()
                .map_err(|_| Error::protocol(1, "timestamp is not an integer"))?
        };
        let subjects = subjects
            .iter()
            .map(|s| Subject::from_plain(s))
            .collect::<Result<Vec<_>>>()?;
        Ok(Event {
            id,
            timestamp,
            interpretation: get(2),
            manifestation: get(3),
            actor: get(4),
            origin: get(5),
            subjects,
            payload: payload.clone(),
        })
    }
}

/// Inclusive time range in milliseconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub begin: i64,
    pub end: i64,
}

impl TimeRange {
    pub fn new(begin: i64, end: i64) -> Self {
        TimeRange { begin, end }
    }

    /// The range spanning all representable timestamps.
    pub fn always() -> Self {
        TimeRange {
            begin: 0,
            end: i64::MAX,
        }
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        self.begin <= timestamp && timestamp <= self.end
    }

    /// Overlap of two ranges, or `None` if they are disjoint.
    pub fn intersect(&self, other: &TimeRange) -> Option<TimeRange> {
        let begin = self.begin.max(other.begin);
        let end = self.end.min(other.end);
        if begin <= end {
            Some(TimeRange { begin, end })
        } else {
            None
        }
    }
}

/// Availability filter over a subject's storage medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum StorageState {
    NotAvailable = 0,
    Available = 1,
    Any = 2,
}

impl TryFrom<u32> for StorageState {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(StorageState::NotAvailable),
            1 => Ok(StorageState::Available),
            2 => Ok(StorageState::Any),
            other => Err(Error::Other(format!("unknown storage state {}", other))),
        }
    }
}

/// Ordering and grouping of query results.
///
/// The discriminants are part of the wire protocol and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ResultType {
    /// All events, most recent first.
    MostRecentEvents = 0,
    /// All events, least recent first.
    LeastRecentEvents = 1,
    /// One event per subject URI (the newest), most recent first.
    MostRecentSubjects = 2,
    /// One event per subject URI (the newest), least recent first.
    LeastRecentSubjects = 3,
    /// One event per subject URI, subjects with most events first.
    MostPopularSubjects = 4,
    /// One event per subject URI, subjects with fewest events first.
    LeastPopularSubjects = 5,
}

impl TryFrom<u32> for ResultType {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(ResultType::MostRecentEvents),
            1 => Ok(ResultType::LeastRecentEvents),
            2 => Ok(ResultType::MostRecentSubjects),
            3 => Ok(ResultType::LeastRecentSubjects),
            4 => Ok(ResultType::MostPopularSubjects),
            5 => Ok(ResultType::LeastPopularSubjects),
            other => Err(Error::Other(format!("unknown result type {}", other))),
        }
    }
}

/// Partially-specified subject used for matching.
///
/// `None` matches anything; `Some("")` matches only the unset value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectTemplate {
    pub uri: Option<String>,
    pub interpretation: Option<String>,
    pub manifestation: Option<String>,
    pub origin: Option<String>,
    pub mimetype: Option<String>,
    pub text: Option<String>,
    pub storage: Option<String>,
    pub current_uri: Option<String>,
    pub current_origin: Option<String>,
}

impl SubjectTemplate {
    pub fn from_plain(fields: &[String]) -> Result<Self> {
        let subject = Subject::from_plain(fields)?;
        Ok(SubjectTemplate {
            uri: unset(subject.uri),
            interpretation: unset(subject.interpretation),
            manifestation: unset(subject.manifestation),
            origin: unset(subject.origin),
            mimetype: unset(subject.mimetype),
            text: unset(subject.text),
            storage: unset(subject.storage),
            current_uri: unset(subject.current_uri),
            current_origin: unset(subject.current_origin),
        })
    }

    pub fn to_plain(&self) -> Vec<String> {
        [
            &self.uri,
            &self.interpretation,
            &self.manifestation,
            &self.origin,
            &self.mimetype,
            &self.text,
            &self.storage,
            &self.current_uri,
            &self.current_origin,
        ]
        .into_iter()
        .map(|f| f.clone().unwrap_or_default())
        .collect()
    }

    /// True if every set field of this template matches `subject`.
    pub fn matches_subject(&self, subject: &Subject, ontology: &SymbolRegistry) -> bool {
        field_matches(&self.uri, &subject.uri)
            && symbol_matches(&self.interpretation, &subject.interpretation, ontology)
            && symbol_matches(&self.manifestation, &subject.manifestation, ontology)
            && field_matches(&self.origin, &subject.origin)
            && field_matches(&self.mimetype, &subject.mimetype)
            && field_matches(&self.text, &subject.text)
            && field_matches(&self.storage, &subject.storage)
            && field_matches(&self.current_uri, &subject.current_uri)
            && field_matches(&self.current_origin, &subject.current_origin)
    }
}

/// Partially-specified event used for matching, both in queries and in
/// the blacklist. The match relation is identical in both places.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTemplate {
    pub id: Option<u64>,
    pub interpretation: Option<String>,
    pub manifestation: Option<String>,
    pub actor: Option<String>,
    pub origin: Option<String>,
    pub subjects: Vec<SubjectTemplate>,
}

impl EventTemplate {
    /// Parse the plain event form as a template: empty strings become
    /// wildcards. Timestamps in templates are ignored.
    pub fn from_plain(plain: &EventPlain) -> Result<Self> {
        let event = Event::from_plain(plain)?;
        let subjects = plain
            .1
            .iter()
            .map(|s| SubjectTemplate::from_plain(s))
            .collect::<Result<Vec<_>>>()?;
        Ok(EventTemplate {
            id: if event.id == 0 { None } else { Some(event.id) },
            interpretation: unset(event.interpretation),
            manifestation: unset(event.manifestation),
            actor: unset(event.actor),
            origin: unset(event.origin),
            subjects,
        })
    }

    pub fn to_plain(&self) -> EventPlain {
        let meta = vec![
            self.id.map(|id| id.to_string()).unwrap_or_default(),
            String::new(),
            self.interpretation.clone().unwrap_or_default(),
            self.manifestation.clone().unwrap_or_default(),
            self.actor.clone().unwrap_or_default(),
            self.origin.clone().unwrap_or_default(),
        ];
        let subjects = self.subjects.iter().map(SubjectTemplate::to_plain).collect();
        (meta, subjects, Vec::new())
    }

    /// The single match relation shared by queries, the blacklist and
    /// monitors.
    ///
    /// Every set event-level field must match; interpretation and
    /// manifestation match the template value or any ontology descendant
    /// of it. If the template carries subject templates, at least one
    /// event subject must match at least one of them. Payload never
    /// participates in matching.
    pub fn matches_event(&self, event: &Event, ontology: &SymbolRegistry) -> bool {
        if let Some(id) = self.id {
            if event.id != id {
                return false;
            }
        }
        if !symbol_matches(&self.interpretation, &event.interpretation, ontology)
            || !symbol_matches(&self.manifestation, &event.manifestation, ontology)
            || !field_matches(&self.actor, &event.actor)
            || !field_matches(&self.origin, &event.origin)
        {
            return false;
        }
        if self.subjects.is_empty() {
            return true;
        }
        event.subjects.iter().any(|subject| {
            self.subjects
                .iter()
                .any(|tmpl| tmpl.matches_subject(subject, ontology))
        })
    }
}

fn unset(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn field_matches(template: &Option<String>, value: &str) -> bool {
    match template {
        None => true,
        Some(wanted) => wanted == value,
    }
}

fn symbol_matches(template: &Option<String>, value: &str, ontology: &SymbolRegistry) -> bool {
    match template {
        None => true,
        Some(wanted) if wanted.is_empty() => value.is_empty(),
        Some(wanted) => wanted == value || ontology.descendants(wanted).iter().any(|d| d == value),
    }
}

/// A registered producer of events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    pub unique_id: String,
    pub name: String,
    pub description: String,
    pub event_templates: Vec<EventTemplate>,
    pub running: bool,
    pub last_seen: i64,
    pub enabled: bool,
}

impl DataSource {
    pub fn new(
        unique_id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        event_templates: Vec<EventTemplate>,
    ) -> Self {
        DataSource {
            unique_id: unique_id.into(),
            name: name.into(),
            description: description.into(),
            event_templates,
            running: true,
            last_seen: timestamp_now(),
            enabled: true,
        }
    }

    /// Plain form: `(unique_id, name, description, templates, running,
    /// last_seen, enabled)`.
    pub fn to_plain(&self) -> DataSourcePlain {
        (
            self.unique_id.clone(),
            self.name.clone(),
            self.description.clone(),
            self.event_templates.iter().map(EventTemplate::to_plain).collect(),
            self.running,
            self.last_seen,
            self.enabled,
        )
    }

    /// Parse the plain form. `running` is forced to false: a data-source
    /// read back from disk is not running until it registers again.
    pub fn from_plain(plain: &DataSourcePlain) -> Result<Self> {
        let (unique_id, name, description, templates, _running, last_seen, enabled) = plain;
        let event_templates = templates
            .iter()
            .map(EventTemplate::from_plain)
            .collect::<Result<Vec<_>>>()?;
        Ok(DataSource {
            unique_id: unique_id.clone(),
            name: name.clone(),
            description: description.clone(),
            event_templates,
            running: false,
            last_seen: *last_seen,
            enabled: *enabled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ontology;

    fn sample_event() -> Event {
        Event {
            id: 7,
            timestamp: 1000,
            interpretation: ontology::zg::ACCESS_EVENT.to_string(),
            manifestation: ontology::zg::USER_ACTIVITY.to_string(),
            actor: "application://editor.desktop".to_string(),
            origin: String::new(),
            subjects: vec![Subject {
                uri: "file:///a".to_string(),
                mimetype: "text/plain".to_string(),
                current_uri: "file:///a".to_string(),
                ..Default::default()
            }],
            payload: vec![1, 2, 3],
        }
    }

    #[test]
    fn event_plain_round_trip() {
        let event = sample_event();
        let plain = event.to_plain();
        let back = Event::from_plain(&plain).unwrap();
        assert_eq!(event, back);
    }

    #[test]
    fn event_from_plain_rejects_bad_arity() {
        let plain = (vec!["1".to_string()], vec![], vec![]);
        assert!(matches!(
            Event::from_plain(&plain),
            Err(Error::Protocol { .. })
        ));
    }

    #[test]
    fn event_from_plain_rejects_bad_timestamp() {
        let mut plain = sample_event().to_plain();
        plain.0[1] = "not-a-number".to_string();
        let err = Event::from_plain(&plain).unwrap_err();
        match err {
            Error::Protocol { field, .. } => assert_eq!(field, 1),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn template_empty_matches_everything() {
        let registry = ontology::registry();
        let template = EventTemplate::default();
        assert!(template.matches_event(&sample_event(), registry));
    }

    #[test]
    fn template_matches_on_interpretation_descendant() {
        let registry = ontology::registry();
        let template = EventTemplate {
            interpretation: Some(ontology::zg::EVENT_INTERPRETATION.to_string()),
            ..Default::default()
        };
        // AccessEvent is a child of EventInterpretation.
        assert!(template.matches_event(&sample_event(), registry));
    }

    #[test]
    fn template_subject_constraints_are_a_disjunction() {
        let registry = ontology::registry();
        let template = EventTemplate {
            subjects: vec![
                SubjectTemplate {
                    uri: Some("file:///other".to_string()),
                    ..Default::default()
                },
                SubjectTemplate {
                    mimetype: Some("text/plain".to_string()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert!(template.matches_event(&sample_event(), registry));

        let template = EventTemplate {
            subjects: vec![SubjectTemplate {
                uri: Some("file:///other".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(!template.matches_event(&sample_event(), registry));
    }

    #[test]
    fn template_round_trips_through_plain_form() {
        let template = EventTemplate {
            interpretation: Some(ontology::zg::ACCESS_EVENT.to_string()),
            subjects: vec![SubjectTemplate {
                uri: Some("file:///a".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        };
        let back = EventTemplate::from_plain(&template.to_plain()).unwrap();
        assert_eq!(template, back);
    }

    #[test]
    fn data_source_plain_round_trip() {
        let mut source = DataSource::new("app/1", "App", "An app", vec![]);
        source.running = false;
        let back = DataSource::from_plain(&source.to_plain()).unwrap();
        assert_eq!(source, back);
    }

    #[test]
    fn time_range_intersection() {
        let a = TimeRange::new(0, 100);
        let b = TimeRange::new(50, 200);
        assert_eq!(a.intersect(&b), Some(TimeRange::new(50, 100)));
        let c = TimeRange::new(150, 200);
        assert_eq!(a.intersect(&c), None);
    }
}
