//! Persistent source ↔ destination id mapping.
//!
//! The [`IdMap`] trait defines the store that records, per migration, which
//! destination record each source record became, with its import status,
//! rollback policy, and content hash, plus a log of per-record messages.
//!
//! - **SQLite**: [`SqlIdMap`] in `sql.rs`
//!
//! The source key is the merge key of every mapping write: re-importing a
//! source record updates its one mapping row instead of adding another.

mod sql;

pub use sql::SqlIdMap;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::schema::IdSchema;
use crate::core::value::IdValue;
use crate::error::{MigrateError, Result};
use crate::message::MessageSink;
use crate::row::Row;

/// Import status of a mapped source record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingStatus {
    Imported,
    NeedsUpdate,
    Ignored,
    Failed,
}

/// How to undo a mapped destination record on rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackAction {
    /// Delete the destination record.
    #[default]
    Delete,
    /// Keep the destination record, forget the mapping.
    Preserve,
}

/// Severity of a stored or displayed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageLevel {
    #[default]
    Error,
    Warning,
    Notice,
    Informational,
}

impl MappingStatus {
    pub fn code(self) -> i64 {
        match self {
            MappingStatus::Imported => 0,
            MappingStatus::NeedsUpdate => 1,
            MappingStatus::Ignored => 2,
            MappingStatus::Failed => 3,
        }
    }

    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            0 => Ok(MappingStatus::Imported),
            1 => Ok(MappingStatus::NeedsUpdate),
            2 => Ok(MappingStatus::Ignored),
            3 => Ok(MappingStatus::Failed),
            _ => Err(MigrateError::Config(format!("Invalid mapping status: {}", code))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MappingStatus::Imported => "imported",
            MappingStatus::NeedsUpdate => "needs_update",
            MappingStatus::Ignored => "ignored",
            MappingStatus::Failed => "failed",
        }
    }
}

impl RollbackAction {
    pub fn code(self) -> i64 {
        match self {
            RollbackAction::Delete => 0,
            RollbackAction::Preserve => 1,
        }
    }

    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            0 => Ok(RollbackAction::Delete),
            1 => Ok(RollbackAction::Preserve),
            _ => Err(MigrateError::Config(format!("Invalid rollback action: {}", code))),
        }
    }
}

impl MessageLevel {
    pub fn code(self) -> i64 {
        match self {
            MessageLevel::Error => 1,
            MessageLevel::Warning => 2,
            MessageLevel::Notice => 3,
            MessageLevel::Informational => 4,
        }
    }

    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            1 => Ok(MessageLevel::Error),
            2 => Ok(MessageLevel::Warning),
            3 => Ok(MessageLevel::Notice),
            4 => Ok(MessageLevel::Informational),
            _ => Err(MigrateError::Config(format!("Invalid message level: {}", code))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageLevel::Error => "error",
            MessageLevel::Warning => "warning",
            MessageLevel::Notice => "notice",
            MessageLevel::Informational => "informational",
        }
    }
}

/// A stored mapping row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingRecord {
    pub source_ids: Vec<IdValue>,

    /// `None` when the row failed before producing a destination key.
    pub destination_ids: Option<Vec<IdValue>>,

    pub status: MappingStatus,
    pub rollback_action: RollbackAction,

    /// Unix timestamp of the last import, 0 when not tracked.
    pub last_imported: i64,

    pub hash: Option<String>,
}

/// One entry of a map iteration: the source key, split off from the
/// destination side of the record.
#[derive(Debug, Clone, PartialEq)]
pub struct MapEntry {
    pub source_ids: Vec<IdValue>,
    pub destination_ids: Option<Vec<IdValue>>,
}

/// A stored message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub msgid: i64,
    pub source_ids: Vec<IdValue>,
    pub level: MessageLevel,
    pub message: String,
}

/// Iterator over all mapping entries of a migration, in source key order.
///
/// The entries are read by a single query when the iterator is created, so
/// the map may be modified while iterating (as rollback does).
#[derive(Debug)]
pub struct MapIter {
    inner: std::vec::IntoIter<MapEntry>,
}

impl MapIter {
    pub(crate) fn new(entries: Vec<MapEntry>) -> Self {
        Self {
            inner: entries.into_iter(),
        }
    }
}

impl Iterator for MapIter {
    type Item = MapEntry;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for MapIter {}

/// Trait for id map persistence backends.
///
/// One instance serves exactly one migration. Implementations must make
/// [`IdMap::save_id_mapping`] a single atomic upsert keyed by the source ids,
/// so that separate processes running the same migration interleave safely
/// at row granularity.
pub trait IdMap: Send {
    /// Migration this map belongs to.
    fn migration_id(&self) -> &str;

    fn source_id_schema(&self) -> &IdSchema;

    fn destination_id_schema(&self) -> &IdSchema;

    /// Target for messages that cannot be persisted.
    fn set_message_sink(&mut self, sink: Arc<dyn MessageSink>);

    /// Create the map and message structures if absent.
    ///
    /// Idempotent. Existing structures missing newer optional columns are
    /// extended in place.
    fn ensure_schema(&self) -> Result<()>;

    /// Upsert the mapping for `row`'s source key.
    ///
    /// A NULL source id component is reported to the message sink and the
    /// call returns `Ok(())` without writing.
    fn save_id_mapping(
        &self,
        row: &Row,
        destination_ids: &[IdValue],
        status: MappingStatus,
        rollback_action: RollbackAction,
    ) -> Result<()>;

    fn lookup_destination_id(&self, source_ids: &[IdValue]) -> Result<Option<Vec<IdValue>>>;

    fn lookup_source_id(&self, destination_ids: &[IdValue]) -> Result<Option<Vec<IdValue>>>;

    fn get_row_by_source(&self, source_ids: &[IdValue]) -> Result<Option<MappingRecord>>;

    fn get_row_by_destination(&self, destination_ids: &[IdValue]) -> Result<Option<MappingRecord>>;

    /// Up to `limit` records marked NEEDS_UPDATE.
    fn get_rows_needing_update(&self, limit: usize) -> Result<Vec<MappingRecord>>;

    /// Append a message for a source key.
    ///
    /// A key with an empty component is not persisted; the message goes to
    /// the message sink instead.
    fn save_message(
        &self,
        source_ids: &[IdValue],
        message: &str,
        level: MessageLevel,
    ) -> Result<()>;

    /// Stored messages, optionally filtered by source key and level.
    fn messages(
        &self,
        source_ids: Option<&[IdValue]>,
        level: Option<MessageLevel>,
    ) -> Result<Vec<MessageRecord>>;

    /// Remove the mapping (unless `messages_only`) and all messages for a key.
    fn delete(&self, source_ids: &[IdValue], messages_only: bool) -> Result<()>;

    /// Remove the mapping and messages of whatever source key maps to
    /// `destination_ids`. No-op when nothing maps there.
    fn delete_destination(&self, destination_ids: &[IdValue]) -> Result<()>;

    /// Remove mappings and messages for many source keys.
    fn delete_bulk(&self, source_id_list: &[Vec<IdValue>]) -> Result<()>;

    /// Mark one mapping NEEDS_UPDATE, keeping its destination key.
    fn set_update(&self, source_ids: &[IdValue]) -> Result<()>;

    /// Mark every mapping NEEDS_UPDATE.
    fn prepare_update(&self) -> Result<()>;

    fn processed_count(&self) -> Result<u64>;

    /// IMPORTED plus NEEDS_UPDATE.
    fn imported_count(&self) -> Result<u64>;

    fn update_count(&self) -> Result<u64>;

    fn error_count(&self) -> Result<u64>;

    fn message_count(&self) -> Result<u64>;

    fn clear_messages(&self) -> Result<()>;

    /// Drop the map and message structures permanently.
    fn destroy(&self) -> Result<()>;

    /// All mapping entries, in source key order.
    fn iter(&self) -> Result<MapIter>;

    /// Persisted high-water value of the migration source.
    fn high_water(&self) -> Result<Option<Value>>;

    fn save_high_water(&self, value: &Value) -> Result<()>;

    /// Release caches held by the backend.
    fn reclaim_memory(&self) {}

    /// Backend type name for logging/debugging.
    fn backend_type(&self) -> &'static str;
}

/// Check an id tuple against its schema's arity.
pub(crate) fn check_arity(ids: &[IdValue], schema: &IdSchema, side: &'static str) -> Result<()> {
    if ids.len() != schema.len() {
        return Err(MigrateError::IdArity {
            side,
            expected: schema.len(),
            got: ids.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_status_roundtrip() {
        let statuses = [
            MappingStatus::Imported,
            MappingStatus::NeedsUpdate,
            MappingStatus::Ignored,
            MappingStatus::Failed,
        ];

        for status in statuses {
            let parsed = MappingStatus::from_code(status.code()).unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_message_level_roundtrip() {
        let levels = [
            MessageLevel::Error,
            MessageLevel::Warning,
            MessageLevel::Notice,
            MessageLevel::Informational,
        ];

        for level in levels {
            assert_eq!(MessageLevel::from_code(level.code()).unwrap(), level);
        }
    }

    #[test]
    fn test_invalid_codes() {
        assert!(MappingStatus::from_code(9).is_err());
        assert!(RollbackAction::from_code(-1).is_err());
        assert!(MessageLevel::from_code(0).is_err());
    }

    #[test]
    fn test_check_arity() {
        let schema = IdSchema::new(vec![
            crate::core::schema::IdField::integer("a"),
            crate::core::schema::IdField::integer("b"),
        ]);
        let pair = [IdValue::Integer(1), IdValue::Integer(2)];
        assert!(check_arity(&pair, &schema, "source").is_ok());
        assert!(matches!(
            check_arity(&[IdValue::Integer(1)], &schema, "source"),
            Err(MigrateError::IdArity { expected: 2, got: 1, .. })
        ));
    }
}
