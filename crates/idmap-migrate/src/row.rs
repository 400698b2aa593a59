//! A single record flowing through a migration.
//!
//! The source side holds raw input values and is frozen once the source
//! cursor hands the row to the executable. The destination side is built up
//! by the process pipeline and read by the destination.

use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::core::schema::IdSchema;
use crate::core::value::IdValue;
use crate::error::{MigrateError, Result};
use crate::id_map::{MappingRecord, MappingStatus, RollbackAction};

/// Separator for nested property paths (`address/city`).
pub const PROPERTY_SEPARATOR: char = '/';

/// One source record plus the destination values derived from it.
#[derive(Debug, Clone)]
pub struct Row {
    source: Map<String, Value>,
    source_ids: IdSchema,
    destination: Map<String, Value>,
    destination_ids: IdSchema,
    id_map: Option<MappingRecord>,
    hash: Option<String>,
    original_hash: Option<String>,
    status: MappingStatus,
    rollback_action: RollbackAction,
    frozen: bool,
}

impl Row {
    /// Create a row, checking that every source id field is present.
    pub fn new(
        values: Map<String, Value>,
        source_ids: &IdSchema,
        destination_ids: &IdSchema,
    ) -> Result<Self> {
        for field in source_ids.fields() {
            if !values.contains_key(&field.name) {
                return Err(MigrateError::InvalidSourceId {
                    field: field.name.clone(),
                });
            }
        }

        Ok(Self {
            source: values,
            source_ids: source_ids.clone(),
            destination: Map::new(),
            destination_ids: destination_ids.clone(),
            id_map: None,
            hash: None,
            original_hash: None,
            status: MappingStatus::Imported,
            rollback_action: RollbackAction::Delete,
            frozen: false,
        })
    }

    /// Source id components in declared order, coerced to their column types.
    pub fn source_id_values(&self) -> Vec<IdValue> {
        self.source_ids
            .fields()
            .iter()
            .map(|f| {
                self.source
                    .get(&f.name)
                    .map(IdValue::from_json)
                    .unwrap_or(IdValue::Null)
                    .coerce(f.kind)
            })
            .collect()
    }

    /// Destination id components in declared order; absent ones are NULL.
    pub fn destination_id_values(&self) -> Vec<IdValue> {
        self.destination_ids
            .fields()
            .iter()
            .map(|f| {
                get_path(&self.destination, &f.name)
                    .map(IdValue::from_json)
                    .unwrap_or(IdValue::Null)
                    .coerce(f.kind)
            })
            .collect()
    }

    pub fn source_id_schema(&self) -> &IdSchema {
        &self.source_ids
    }

    pub fn destination_id_schema(&self) -> &IdSchema {
        &self.destination_ids
    }

    pub fn source(&self) -> &Map<String, Value> {
        &self.source
    }

    pub fn source_property(&self, key: &str) -> Option<&Value> {
        get_path(&self.source, key)
    }

    pub fn has_source_property(&self, key: &str) -> bool {
        self.source_property(key).is_some()
    }

    /// Set a source value. Fails once the source side is frozen.
    pub fn set_source_property(&mut self, key: impl Into<String>, value: Value) -> Result<()> {
        let key = key.into();
        if self.frozen {
            return Err(MigrateError::FrozenRow(key));
        }
        self.source.insert(key, value);
        Ok(())
    }

    pub fn destination(&self) -> &Map<String, Value> {
        &self.destination
    }

    pub fn destination_property(&self, key: &str) -> Option<&Value> {
        get_path(&self.destination, key)
    }

    pub fn has_destination_property(&self, key: &str) -> bool {
        self.destination_property(key).is_some()
    }

    pub fn set_destination_property(&mut self, key: impl Into<String>, value: Value) {
        self.destination.insert(key.into(), value);
    }

    /// Set a nested destination value, creating intermediate objects.
    ///
    /// A non-object value sitting on the path is replaced by an object.
    pub fn set_destination_property_deep(&mut self, path: &[&str], value: Value) {
        let Some((last, parents)) = path.split_last() else {
            return;
        };

        let mut current = &mut self.destination;
        for key in parents {
            let slot = current
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            current = match slot {
                Value::Object(map) => map,
                _ => unreachable!("slot was just made an object"),
            };
        }
        current.insert(last.to_string(), value);
    }

    pub fn remove_destination_property(&mut self, key: &str) -> Option<Value> {
        self.destination.remove(key)
    }

    /// Freeze the source side. Idempotent.
    pub fn freeze_source(&mut self) -> &mut Self {
        self.frozen = true;
        self
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Recompute the content hash, keeping the previous one as the original.
    pub fn rehash(&mut self) {
        self.original_hash = self.hash.take();
        self.hash = Some(hash_source(&self.source));
    }

    /// Whether the source content differs from the previously seen hash.
    pub fn changed(&self) -> bool {
        self.hash != self.original_hash
    }

    pub fn hash(&self) -> Option<&str> {
        self.hash.as_deref()
    }

    pub fn original_hash(&self) -> Option<&str> {
        self.original_hash.as_deref()
    }

    pub fn status(&self) -> MappingStatus {
        self.status
    }

    pub fn set_status(&mut self, status: MappingStatus) {
        self.status = status;
    }

    pub fn needs_update(&self) -> bool {
        self.status == MappingStatus::NeedsUpdate
    }

    pub fn rollback_action(&self) -> RollbackAction {
        self.rollback_action
    }

    /// The existing mapping for this row, if it was migrated before.
    pub fn id_map(&self) -> Option<&MappingRecord> {
        self.id_map.as_ref()
    }

    /// Attach the stored mapping: its status, hash, and rollback action
    /// become this row's starting point.
    pub fn set_id_map(&mut self, record: MappingRecord) {
        self.status = record.status;
        self.rollback_action = record.rollback_action;
        self.hash = record.hash.clone();
        self.original_hash = record.hash.clone();
        self.id_map = Some(record);
    }
}

fn get_path<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    if let Some(value) = map.get(key) {
        return Some(value);
    }
    if !key.contains(PROPERTY_SEPARATOR) {
        return None;
    }

    let mut parts = key.split(PROPERTY_SEPARATOR);
    let mut current = map.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(m) => m.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// SHA-256 over a key-ordered JSON rendering of the source values.
fn hash_source(source: &Map<String, Value>) -> String {
    let bytes = serde_json::to_vec(&CanonicalMap(source)).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Serializes objects with sorted keys regardless of map ordering features.
struct Canonical<'a>(&'a Value);
struct CanonicalMap<'a>(&'a Map<String, Value>);

impl Serialize for CanonicalMap<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut entries: Vec<_> = self.0.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        let mut map = serializer.serialize_map(Some(entries.len()))?;
        for (k, v) in entries {
            map.serialize_entry(k, &Canonical(v))?;
        }
        map.end()
    }
}

impl Serialize for Canonical<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self.0 {
            Value::Object(m) => CanonicalMap(m).serialize(serializer),
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(&Canonical(item))?;
                }
                seq.end()
            }
            other => other.serialize(serializer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::IdField;
    use serde_json::json;

    fn schema() -> IdSchema {
        IdSchema::new(vec![IdField::integer("id")])
    }

    fn values(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_missing_source_id_fails() {
        let err = Row::new(values(json!({"val": "a"})), &schema(), &schema()).unwrap_err();
        assert!(matches!(err, MigrateError::InvalidSourceId { ref field } if field == "id"));
    }

    #[test]
    fn test_source_id_values_keep_declared_order() {
        let ids = IdSchema::new(vec![IdField::string("lang"), IdField::integer("nid")]);
        let row = Row::new(
            values(json!({"nid": "12", "lang": "en", "title": "x"})),
            &ids,
            &schema(),
        )
        .unwrap();
        assert_eq!(
            row.source_id_values(),
            vec![IdValue::from("en"), IdValue::Integer(12)]
        );
    }

    #[test]
    fn test_frozen_source_rejects_writes() {
        let mut row = Row::new(values(json!({"id": 1})), &schema(), &schema()).unwrap();
        row.set_source_property("extra", json!(true)).unwrap();
        row.freeze_source();
        row.freeze_source();
        assert!(matches!(
            row.set_source_property("late", json!(1)),
            Err(MigrateError::FrozenRow(_))
        ));
        row.set_destination_property("still", json!("ok"));
        assert_eq!(row.destination_property("still"), Some(&json!("ok")));
    }

    #[test]
    fn test_deep_destination_creates_containers() {
        let mut row = Row::new(values(json!({"id": 1})), &schema(), &schema()).unwrap();
        row.set_destination_property("body", json!("scalar"));
        row.set_destination_property_deep(&["body", "value"], json!("text"));
        row.set_destination_property_deep(&["body", "format"], json!("html"));
        assert_eq!(
            row.destination_property("body"),
            Some(&json!({"value": "text", "format": "html"}))
        );
        assert_eq!(row.destination_property("body/format"), Some(&json!("html")));
    }

    #[test]
    fn test_remove_destination_property() {
        let mut row = Row::new(values(json!({"id": 1})), &schema(), &schema()).unwrap();
        row.set_destination_property("title", json!("t"));
        assert_eq!(row.remove_destination_property("title"), Some(json!("t")));
        assert!(!row.has_destination_property("title"));
        assert_eq!(row.remove_destination_property("title"), None);
    }

    #[test]
    fn test_destination_id_values() {
        let dest = IdSchema::new(vec![IdField::integer("tid")]);
        let mut row = Row::new(values(json!({"id": 1})), &schema(), &dest).unwrap();
        assert_eq!(row.destination_id_values(), vec![IdValue::Null]);
        row.set_destination_property("tid", json!(10));
        assert_eq!(row.destination_id_values(), vec![IdValue::Integer(10)]);
    }

    #[test]
    fn test_rehash_detects_change() {
        let mut row = Row::new(values(json!({"id": 1, "val": "a"})), &schema(), &schema()).unwrap();
        row.rehash();
        assert!(row.changed());
        row.rehash();
        assert!(!row.changed());
        row.set_source_property("val", json!("b")).unwrap();
        row.rehash();
        assert!(row.changed());
        assert_eq!(row.hash().unwrap().len(), 64);
    }

    #[test]
    fn test_hash_ignores_key_order() {
        let a = values(json!({"id": 1, "nested": {"x": 1, "y": 2}}));
        let mut b = Map::new();
        b.insert("nested".into(), json!({"y": 2, "x": 1}));
        b.insert("id".into(), json!(1));
        assert_eq!(hash_source(&a), hash_source(&b));
    }

    #[test]
    fn test_nested_source_lookup() {
        let row = Row::new(
            values(json!({"id": 1, "tags": [{"name": "a"}, {"name": "b"}]})),
            &schema(),
            &schema(),
        )
        .unwrap();
        assert_eq!(row.source_property("tags/1/name"), Some(&json!("b")));
        assert!(!row.has_source_property("tags/5/name"));
    }
}
