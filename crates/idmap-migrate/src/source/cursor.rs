use std::cmp::Ordering;
use std::collections::HashSet;

use serde_json::Value;
use tracing::{debug, trace};

use crate::core::schema::IdSchema;
use crate::core::traits::Source;
use crate::core::value::{format_ids, IdValue};
use crate::error::Result;
use crate::id_map::{IdMap, MappingStatus};
use crate::row::Row;

/// Iterates a [`Source`], yielding only rows that need processing.
///
/// A row is processed when any of these hold:
/// - it has no mapping yet
/// - its mapping is marked NEEDS_UPDATE
/// - its high-water property is above the stored high-water mark
/// - change tracking is on and its content hash differs from the stored one
///
/// A mapped row picked up by the last rule is marked NEEDS_UPDATE first.
/// Yielded rows carry their mapping (if any), a fresh hash, and a frozen
/// source side.
pub struct SourceCursor {
    source: Box<dyn Source>,
    id_list: Option<HashSet<Vec<IdValue>>>,
    /// Mark stored when the run started; rows are compared against it.
    high_water: Option<Value>,
    max_seen: Option<Value>,
    committed: Option<Value>,
    skipped: u64,
}

impl SourceCursor {
    pub fn new(source: Box<dyn Source>) -> Self {
        Self {
            source,
            id_list: None,
            high_water: None,
            max_seen: None,
            committed: None,
            skipped: 0,
        }
    }

    /// Restrict iteration to the given source keys.
    pub fn with_id_list(mut self, ids: Vec<Vec<IdValue>>) -> Self {
        let schema = self.source.id_schema().clone();
        self.id_list = Some(ids.into_iter().map(|key| coerce_key(&key, &schema)).collect());
        self
    }

    pub fn source(&self) -> &dyn Source {
        self.source.as_ref()
    }

    /// Rows passed over since the last rewind.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn rewind(&mut self, id_map: &dyn IdMap) -> Result<()> {
        self.source.rewind()?;
        self.high_water = match self.source.high_water_property() {
            Some(_) => id_map.high_water()?,
            None => None,
        };
        self.max_seen = None;
        self.committed = None;
        self.skipped = 0;
        Ok(())
    }

    /// The next row to process, or `None` when the source is exhausted.
    pub fn next_row(&mut self, id_map: &dyn IdMap) -> Result<Option<Row>> {
        while let Some(mut row) = self.source.next_row()? {
            let ids = row.source_id_values();

            if let Some(list) = &self.id_list {
                if !list.contains(&ids) {
                    continue;
                }
            }

            row.rehash();
            if let Some(record) = id_map.get_row_by_source(&ids)? {
                row.set_id_map(record);
                // Stored hash becomes the original, current content the hash.
                row.rehash();
            }

            if self.should_process(&mut row, id_map, &ids)? {
                row.freeze_source();
                return Ok(Some(row));
            }

            trace!("Skipping unchanged row {}", format_ids(&ids));
            self.skipped += 1;
        }

        debug!(
            "{} source exhausted, {} rows unchanged",
            self.source.name(),
            self.skipped
        );
        Ok(None)
    }

    fn should_process(&self, row: &mut Row, id_map: &dyn IdMap, ids: &[IdValue]) -> Result<bool> {
        if row.id_map().is_none() || row.needs_update() {
            return Ok(true);
        }
        if self.above_high_water(row) {
            return Ok(true);
        }
        if self.source.track_changes() && row.changed() {
            id_map.set_update(ids)?;
            row.set_status(MappingStatus::NeedsUpdate);
            return Ok(true);
        }
        Ok(false)
    }

    /// Only called for mapped rows. Without a stored mark nothing was ever
    /// imported with a high-water value, so no mapped row is above it.
    fn above_high_water(&self, row: &Row) -> bool {
        let Some(property) = self.source.high_water_property() else {
            return false;
        };
        match (row.source_property(property), &self.high_water) {
            (Some(value), Some(mark)) if !value.is_null() => {
                compare_values(value, mark) == Some(Ordering::Greater)
            }
            _ => false,
        }
    }

    /// Track the high-water value of a successfully processed row.
    pub fn observe_high_water(&mut self, row: &Row) {
        let Some(property) = self.source.high_water_property() else {
            return;
        };
        let Some(value) = row.source_property(property).filter(|v| !v.is_null()) else {
            return;
        };
        let higher = match &self.max_seen {
            None => true,
            Some(max) => compare_values(value, max) == Some(Ordering::Greater),
        };
        if higher {
            self.max_seen = Some(value.clone());
        }
    }

    /// Persist the highest value observed, if above the stored mark.
    ///
    /// Called after every imported row so an interrupted run keeps its
    /// progress. Rows of the current run are still compared against the mark
    /// loaded at rewind.
    pub fn commit_high_water(&mut self, id_map: &dyn IdMap) -> Result<()> {
        let Some(seen) = &self.max_seen else {
            return Ok(());
        };
        let raise = match self.committed.as_ref().or(self.high_water.as_ref()) {
            None => true,
            Some(mark) => compare_values(seen, mark) == Some(Ordering::Greater),
        };
        if raise {
            id_map.save_high_water(seen)?;
            trace!("High water for {} raised to {}", id_map.migration_id(), seen);
            self.committed = Some(seen.clone());
        }
        Ok(())
    }
}

fn coerce_key(ids: &[IdValue], schema: &IdSchema) -> Vec<IdValue> {
    ids.iter()
        .zip(schema.fields())
        .map(|(v, f)| v.coerce(f.kind))
        .collect()
}

/// Numbers compare numerically, strings lexically; other pairs are unordered.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
