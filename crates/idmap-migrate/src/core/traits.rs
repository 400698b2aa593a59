//! Collaborator traits of the migration engine.
//!
//! - [`Source`]: yields source records as [`Row`]s
//! - [`Destination`]: imports rows and undoes imports
//!
//! Process plugins live in [`crate::process`] and message sinks in
//! [`crate::message`].

use std::cell::RefCell;

use crate::error::Result;
use crate::id_map::{MessageLevel, RollbackAction};
use crate::row::Row;

use super::schema::IdSchema;
use super::value::IdValue;

/// Record iterator of a migration.
///
/// A source is rewound once per run and then advanced until it returns
/// `Ok(None)`. Implementations build rows with the destination id schema
/// they were constructed with.
pub trait Source: Send {
    /// Source id fields, in key order.
    fn id_schema(&self) -> &IdSchema;

    /// Restart iteration from the first record.
    fn rewind(&mut self) -> Result<()>;

    /// The next record, or `None` when exhausted.
    fn next_row(&mut self) -> Result<Option<Row>>;

    /// Number of records, when known without iterating.
    fn count(&self) -> Option<u64> {
        None
    }

    /// Source property whose increasing value marks new or changed rows.
    fn high_water_property(&self) -> Option<&str> {
        None
    }

    /// Re-import mapped rows whose content hash changed.
    fn track_changes(&self) -> bool {
        false
    }

    /// Plugin name for logging.
    fn name(&self) -> &'static str;
}

/// Record sink of a migration.
pub trait Destination: Send {
    /// Destination id fields, in key order.
    fn id_schema(&self) -> &IdSchema;

    /// Import one row.
    ///
    /// Returns the destination key, or `None` when nothing was saved. A row
    /// carrying an existing mapping (see [`Row::id_map`]) should update the
    /// record it names instead of creating another.
    fn import(&mut self, row: &Row, ctx: &MigrateContext) -> Result<Option<Vec<IdValue>>>;

    /// Delete the record with the given destination key.
    fn rollback(&mut self, destination_ids: &[IdValue]) -> Result<()>;

    /// Rollback policy recorded with each mapping this destination creates.
    fn rollback_action(&self) -> RollbackAction {
        RollbackAction::Delete
    }

    /// Release caches held by the destination.
    fn reclaim_memory(&mut self) {}

    /// Plugin name for logging.
    fn name(&self) -> &'static str;
}

/// Execution context handed to process plugins and destinations.
///
/// Carries the running migration and the key of the row being processed.
/// Messages queued here are written to the id map by the executable under
/// the current key, or under the next key when none is known yet.
#[derive(Debug, Default)]
pub struct MigrateContext {
    migration_id: String,
    source_ids: Vec<IdValue>,
    update: bool,
    queued: RefCell<Vec<(String, MessageLevel)>>,
}

impl MigrateContext {
    pub fn new(migration_id: impl Into<String>) -> Self {
        Self {
            migration_id: migration_id.into(),
            ..Default::default()
        }
    }

    pub fn migration_id(&self) -> &str {
        &self.migration_id
    }

    /// Key of the row currently being processed; empty between rows.
    pub fn source_ids(&self) -> &[IdValue] {
        &self.source_ids
    }

    pub fn set_source_ids(&mut self, ids: Vec<IdValue>) {
        self.source_ids = ids;
    }

    pub fn clear_source_ids(&mut self) {
        self.source_ids.clear();
    }

    /// Whether the run re-imports previously imported rows.
    pub fn is_update(&self) -> bool {
        self.update
    }

    pub fn set_update(&mut self, update: bool) {
        self.update = update;
    }

    /// Queue a message for the current row.
    pub fn queue_message(&self, message: impl Into<String>, level: MessageLevel) {
        self.queued.borrow_mut().push((message.into(), level));
    }

    pub fn has_queued_messages(&self) -> bool {
        !self.queued.borrow().is_empty()
    }

    /// Take all queued messages.
    pub fn drain_messages(&self) -> Vec<(String, MessageLevel)> {
        std::mem::take(&mut *self.queued.borrow_mut())
    }
}
