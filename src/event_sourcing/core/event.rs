use chrono::{SecondsFormat, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::error::ValidationError;

// ============================================================================
// Event - Immutable Domain Fact
// ============================================================================
//
// An event carries an opaque JSON payload and a metadata envelope that ties it
// to an entity, an aggregate root and a position (sequence number) inside that
// aggregate's history.
//
// ============================================================================

/// Metadata envelope shared by every event.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct EventMeta {
    pub entity_id: String,
    pub entity_type: String,
    pub root_id: String,
    pub sequence_no: i64,
    pub user: String,
    pub module: String,
    pub account: String,
    pub group: String,
    /// RFC 3339, nanosecond precision, UTC.
    pub created: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
    pub version: i32,
    #[serde(default)]
    pub meta: EventMeta,

    #[serde(skip)]
    errors: Vec<ValidationError>,
}

/// Timestamp format used for `EventMeta::created`.
pub fn created_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

impl Event {
    /// Build a version 1 event for an entity, serializing `payload`.
    pub fn new<P: Serialize>(
        event_type: &str,
        entity_id: &str,
        entity_type: &str,
        payload: &P,
    ) -> Result<Self, serde_json::Error> {
        let mut event = Self::with_version(event_type, entity_id, payload, 1)?;
        event.meta.entity_type = entity_type.to_string();
        Ok(event)
    }

    /// Build an event with an explicit schema version.
    pub fn with_version<P: Serialize>(
        event_type: &str,
        entity_id: &str,
        payload: &P,
        version: i32,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: Uuid::now_v7().to_string(),
            event_type: event_type.to_string(),
            payload: serde_json::to_value(payload)?,
            version,
            meta: EventMeta {
                entity_id: entity_id.to_string(),
                created: created_now(),
                ..EventMeta::default()
            },
            errors: Vec::new(),
        })
    }

    /// Reassemble an event read back from storage.
    pub fn from_parts(id: String, event_type: String, payload: Value, version: i32, meta: EventMeta) -> Self {
        Self {
            id,
            event_type,
            payload,
            version,
            meta,
            errors: Vec::new(),
        }
    }

    pub fn with_root(mut self, root_id: &str) -> Self {
        self.meta.root_id = root_id.to_string();
        self
    }

    pub fn with_user(mut self, user: &str) -> Self {
        self.meta.user = user.to_string();
        self
    }

    /// Deserialize the payload into a concrete type.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    /// Check the fields every persisted event needs.
    ///
    /// On failure the error is also appended to this event's error list.
    pub fn validate(&mut self) -> Result<(), ValidationError> {
        let result = self.check();
        if let Err(err) = &result {
            self.add_error(err.clone());
        }
        result
    }

    pub fn is_valid(&mut self) -> bool {
        self.validate().is_ok()
    }

    fn check(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::MissingId {
                entity_id: self.meta.entity_id.clone(),
            });
        }
        if self.meta.entity_id.is_empty() {
            return Err(ValidationError::MissingEntityId {
                event_id: self.id.clone(),
            });
        }
        if self.version <= 0 {
            return Err(ValidationError::InvalidVersion {
                event_id: self.id.clone(),
                version: self.version,
            });
        }
        if self.event_type.is_empty() {
            return Err(ValidationError::MissingType {
                event_id: self.id.clone(),
            });
        }
        if self.meta.sequence_no <= 0 {
            return Err(ValidationError::MissingSequenceNo {
                event_id: self.id.clone(),
            });
        }
        Ok(())
    }

    pub fn add_error(&mut self, err: ValidationError) {
        self.errors.push(err);
    }

    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }
}

// Accumulated validation errors are bookkeeping, not part of the fact.
impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.event_type == other.event_type
            && self.payload == other.payload
            && self.version == other.version
            && self.meta == other.meta
    }
}

impl Eq for Event {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sequenced(mut event: Event) -> Event {
        event.meta.sequence_no = 1;
        event
    }

    #[test]
    fn test_new_event_defaults() {
        let event = Event::new("CREATE_POST", "post-1", "Post", &json!({"title": "First Post"})).unwrap();

        assert!(!event.id.is_empty());
        assert_eq!(event.event_type, "CREATE_POST");
        assert_eq!(event.version, 1);
        assert_eq!(event.meta.entity_id, "post-1");
        assert_eq!(event.meta.entity_type, "Post");
        assert_eq!(event.meta.sequence_no, 0);
        assert_eq!(event.payload["title"], "First Post");
    }

    #[test]
    fn test_created_has_fixed_nanosecond_precision() {
        let event = Event::new("CREATE_POST", "post-1", "Post", &json!({})).unwrap();
        let fraction = event
            .meta
            .created
            .split('.')
            .nth(1)
            .expect("fractional seconds");
        assert_eq!(fraction.len(), "123456789Z".len());
        assert!(fraction.ends_with('Z'));
    }

    #[test]
    fn test_ids_are_sortable_by_creation() {
        let first = Event::new("A", "e", "T", &json!({})).unwrap();
        let second = Event::new("A", "e", "T", &json!({})).unwrap();
        assert!(first.id < second.id);
    }

    #[test]
    fn test_with_version_keeps_version() {
        let event = Event::with_version("RENAME", "post-1", &json!({"title": "x"}), 3).unwrap();
        assert_eq!(event.version, 3);
        assert!(event.meta.entity_type.is_empty());
    }

    #[test]
    fn test_valid_event_passes() {
        let mut event = sequenced(Event::new("CREATE_POST", "post-1", "Post", &json!({})).unwrap());
        assert!(event.is_valid());
        assert!(event.errors().is_empty());
    }

    #[test]
    fn test_missing_id_is_rejected() {
        let mut event = sequenced(Event::new("CREATE_POST", "post-1", "Post", &json!({})).unwrap());
        event.id.clear();

        let err = event.validate().unwrap_err();
        assert!(matches!(err, ValidationError::MissingId { .. }));
        assert_eq!(event.errors().len(), 1);
    }

    #[test]
    fn test_missing_entity_id_is_rejected() {
        let mut event = sequenced(Event::new("CREATE_POST", "", "Post", &json!({})).unwrap());
        assert!(matches!(
            event.validate(),
            Err(ValidationError::MissingEntityId { .. })
        ));
    }

    #[test]
    fn test_non_positive_version_is_rejected() {
        let mut event = sequenced(Event::with_version("CREATE_POST", "post-1", &json!({}), 0).unwrap());
        assert!(matches!(
            event.validate(),
            Err(ValidationError::InvalidVersion { version: 0, .. })
        ));
    }

    #[test]
    fn test_missing_type_is_rejected() {
        let mut event = sequenced(Event::new("", "post-1", "Post", &json!({})).unwrap());
        assert!(matches!(
            event.validate(),
            Err(ValidationError::MissingType { .. })
        ));
    }

    #[test]
    fn test_unsequenced_event_is_rejected() {
        let mut event = Event::new("CREATE_POST", "post-1", "Post", &json!({})).unwrap();
        assert!(matches!(
            event.validate(),
            Err(ValidationError::MissingSequenceNo { .. })
        ));
    }

    #[test]
    fn test_validation_does_not_touch_payload_or_identity() {
        let mut event = Event::new("", "post-1", "Post", &json!({"title": "t"})).unwrap();
        let before = event.clone();
        let _ = event.validate();
        assert_eq!(event, before);
    }

    #[test]
    fn test_wire_format() {
        let mut event = Event::new("CREATE_POST", "post-1", "Post", &json!({"title": "First Post"})).unwrap();
        event.meta.sequence_no = 4;
        event.meta.root_id = "root-1".to_string();

        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["type"], "CREATE_POST");
        assert_eq!(wire["payload"]["title"], "First Post");
        assert_eq!(wire["meta"]["sequence_no"], 4);
        assert_eq!(wire["meta"]["root_id"], "root-1");
        assert!(wire.get("errors").is_none());

        let decoded: Event = serde_json::from_value(wire).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_decode_payload() {
        #[derive(Deserialize)]
        struct Title {
            title: String,
        }

        let event = Event::new("CREATE_POST", "post-1", "Post", &json!({"title": "First Post"})).unwrap();
        let title: Title = event.decode_payload().unwrap();
        assert_eq!(title.title, "First Post");
    }
}
