//! Migration executable: the import and rollback loops.
//!
//! One [`MigrateExecutable`] runs one migration. Each row is pulled from the
//! [`SourceCursor`], transformed by the [`Pipeline`], handed to the
//! [`Destination`], and its outcome written to the [`IdMap`] before the next
//! row is pulled. Budgets are checked between rows, so a run can stop at any
//! row boundary and a later run picks up where it left off.

mod budget;

pub use budget::{format_size, Budget, Limits, MemoryCheck, ResourceMonitor, SystemMonitor};

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::core::traits::{Destination, MigrateContext, Source};
use crate::core::value::{format_ids, IdValue};
use crate::error::{MigrateError, Result};
use crate::id_map::{IdMap, MappingStatus, MessageLevel, RollbackAction};
use crate::message::MessageSink;
use crate::process::{Pipeline, Skip};
use crate::row::Row;
use crate::source::SourceCursor;

/// Message recorded when a destination saves nothing and says nothing.
pub const NOTHING_SAVED_MESSAGE: &str = "New object was not saved, no error provided";

/// A migration definition ready to run.
pub struct Migration {
    pub id: String,
    pub label: Option<String>,
    pub source: Box<dyn Source>,
    pub pipeline: Pipeline,
    pub destination: Box<dyn Destination>,
}

impl Migration {
    pub fn new(
        id: impl Into<String>,
        source: Box<dyn Source>,
        pipeline: Pipeline,
        destination: Box<dyn Destination>,
    ) -> Self {
        Self {
            id: id.into(),
            label: None,
            source,
            pipeline,
            destination,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Final state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Source exhausted, or an explicit item/time limit reached.
    Completed,
    /// Stopped by the memory or time budget; run again to continue.
    Incomplete,
    /// Stopped by an external signal.
    Stopped,
    /// The source could not be iterated.
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Incomplete => "incomplete",
            RunStatus::Stopped => "stopped",
            RunStatus::Failed => "failed",
        }
    }
}

/// Per-run options, usually from the command line.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Stop after this many processed rows.
    pub limit: Option<u64>,
    /// Stop after this much time.
    pub time_limit: Option<Duration>,
    /// Only process these source keys.
    pub id_list: Option<Vec<Vec<IdValue>>>,
    /// Re-import everything previously imported.
    pub update: bool,
    /// Progress message every N processed rows.
    pub feedback_every: Option<u64>,
}

/// Row outcome counters of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub failed: u64,
    pub ignored: u64,
    /// Rows dropped by a plugin without a record.
    pub skipped: u64,
    /// Rows the cursor passed over as already migrated.
    pub unchanged: u64,
    pub rolled_back: u64,
}

/// Result of an import or rollback run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Unique id of this run, for correlating logs.
    pub run_id: String,
    pub migration_id: String,
    pub operation: &'static str,
    pub status: RunStatus,
    #[serde(flatten)]
    pub counts: RunCounts,
    pub duration_secs: f64,
}

impl RunSummary {
    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Stored state of a migration, for status listings.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub migration_id: String,
    pub label: Option<String>,
    pub source_plugin: &'static str,
    pub destination_plugin: &'static str,
    /// Source records, when the source can count them.
    pub total: Option<u64>,
    pub processed: u64,
    pub imported: u64,
    pub needs_update: u64,
    pub errors: u64,
    pub messages: u64,
    pub unprocessed: Option<u64>,
    pub high_water: Option<Value>,
}

impl StatusReport {
    pub fn collect(migration: &Migration, id_map: &dyn IdMap) -> Result<Self> {
        let total = migration.source.count();
        let processed = id_map.processed_count()?;
        Ok(Self {
            migration_id: migration.id.clone(),
            label: migration.label.clone(),
            source_plugin: migration.source.name(),
            destination_plugin: migration.destination.name(),
            total,
            processed,
            imported: id_map.imported_count()?,
            needs_update: id_map.update_count()?,
            errors: id_map.error_count()?,
            messages: id_map.message_count()?,
            unprocessed: total.map(|t| t.saturating_sub(processed)),
            high_water: id_map.high_water()?,
        })
    }
}

enum Interrupt {
    /// Explicit item or time limit; the run counts as completed.
    Limit,
    Budget,
    Stop,
}

/// Runs one migration against its id map.
pub struct MigrateExecutable {
    migration_id: String,
    cursor: SourceCursor,
    pipeline: Pipeline,
    destination: Box<dyn Destination>,
    id_map: Box<dyn IdMap>,
    sink: Arc<dyn MessageSink>,
    budget: Budget,
    options: RunOptions,
    stop: Arc<AtomicBool>,
    ctx: MigrateContext,
}

impl MigrateExecutable {
    /// Build an executable. The id map reports unpersistable messages to
    /// `sink` from now on.
    pub fn new(
        migration: Migration,
        mut id_map: Box<dyn IdMap>,
        sink: Arc<dyn MessageSink>,
        budget: Budget,
    ) -> Self {
        id_map.set_message_sink(sink.clone());
        debug!(
            "{}: memory limit {}, id map {}",
            migration.id,
            format_size(budget.limits().memory_limit),
            id_map.backend_type()
        );
        Self {
            ctx: MigrateContext::new(migration.id.clone()),
            migration_id: migration.id,
            cursor: SourceCursor::new(migration.source),
            pipeline: migration.pipeline,
            destination: migration.destination,
            id_map,
            sink,
            budget,
            options: RunOptions::default(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        if let Some(ids) = &options.id_list {
            self.cursor = self.cursor.with_id_list(ids.clone());
        }
        self.options = options;
        self
    }

    /// Share an externally controlled stop flag.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn id_map(&self) -> &dyn IdMap {
        self.id_map.as_ref()
    }

    pub fn migration_id(&self) -> &str {
        &self.migration_id
    }

    /// Queue a message to be stored under the next row's key.
    pub fn queue_message(&self, message: impl Into<String>, level: MessageLevel) {
        self.ctx.queue_message(message, level);
    }

    /// Import rows until the source is exhausted or the run is interrupted.
    ///
    /// Row failures are recorded in the id map and never end the run. An
    /// `Err` means the id map itself failed.
    pub fn import(&mut self) -> Result<RunSummary> {
        let started = Instant::now();
        self.budget.restart();
        let mut counts = RunCounts::default();

        info!("{}: starting import", self.migration_id);
        if self.options.update {
            self.id_map.prepare_update()?;
        }
        self.ctx.set_update(self.options.update);

        if let Err(e) = self.cursor.rewind(self.id_map.as_ref()) {
            self.sink.display(
                &format!("Migration failed with source plugin exception: {}", e),
                MessageLevel::Error,
            );
            return Ok(self.summary("import", RunStatus::Failed, counts, started));
        }

        let mut status = RunStatus::Completed;
        loop {
            let row = match self.cursor.next_row(self.id_map.as_ref()) {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(e) => {
                    self.sink.display(
                        &format!("Migration failed with source plugin exception: {}", e),
                        MessageLevel::Error,
                    );
                    status = RunStatus::Failed;
                    break;
                }
            };

            self.import_row(row, &mut counts)?;
            counts.processed += 1;
            self.feedback(&counts);

            if let Some(interrupt) = self.check_interruption(counts.processed, started) {
                status = match interrupt {
                    Interrupt::Limit => RunStatus::Completed,
                    Interrupt::Budget => RunStatus::Incomplete,
                    Interrupt::Stop => RunStatus::Stopped,
                };
                break;
            }
        }

        counts.unchanged = self.cursor.skipped();

        let summary = self.summary("import", status, counts, started);
        info!(
            "{}: import {} ({} processed, {} created, {} updated, {} failed, {} ignored)",
            self.migration_id,
            status.as_str(),
            summary.counts.processed,
            summary.counts.created,
            summary.counts.updated,
            summary.counts.failed,
            summary.counts.ignored
        );
        Ok(summary)
    }

    fn import_row(&mut self, mut row: Row, counts: &mut RunCounts) -> Result<()> {
        let ids = row.source_id_values();
        self.ctx.set_source_ids(ids.clone());

        // Stale messages from earlier attempts go; messages queued before
        // this key was known are stored under it.
        self.id_map.delete(&ids, true)?;
        self.flush_messages(&ids)?;

        let updating = row.id_map().is_some();
        let outcome = match self.pipeline.run(&mut row, &self.ctx) {
            Ok(ControlFlow::Continue(())) => self
                .destination
                .import(&row, &self.ctx)
                .map(ControlFlow::Continue),
            Ok(ControlFlow::Break(skip)) => Ok(ControlFlow::Break(skip)),
            Err(e) => Err(e),
        };
        // A mapping keeps the rollback policy it was created with.
        let rollback_action = match row.id_map() {
            Some(_) => row.rollback_action(),
            None => self.destination.rollback_action(),
        };

        match outcome {
            Ok(ControlFlow::Continue(Some(dest_ids)))
                if !dest_ids.is_empty() && !dest_ids.iter().all(IdValue::is_null) =>
            {
                self.id_map
                    .save_id_mapping(&row, &dest_ids, MappingStatus::Imported, rollback_action)?;
                if updating {
                    counts.updated += 1;
                } else {
                    counts.created += 1;
                }
                self.cursor.observe_high_water(&row);
                self.cursor.commit_high_water(self.id_map.as_ref())?;
            }
            Ok(ControlFlow::Continue(_)) => {
                self.id_map
                    .save_id_mapping(&row, &[], MappingStatus::Failed, rollback_action)?;
                if !self.ctx.has_queued_messages()
                    && self.id_map.messages(Some(&ids), None)?.is_empty()
                {
                    self.save_message(&ids, NOTHING_SAVED_MESSAGE, MessageLevel::Error)?;
                }
                counts.failed += 1;
            }
            Ok(ControlFlow::Break(Skip::Ignored(message))) => {
                self.id_map
                    .save_id_mapping(&row, &[], MappingStatus::Ignored, rollback_action)?;
                self.save_message(&ids, &message, MessageLevel::Informational)?;
                counts.ignored += 1;
            }
            Ok(ControlFlow::Break(_)) => {
                debug!("{}: row {} skipped", self.migration_id, format_ids(&ids));
                counts.skipped += 1;
            }
            Err(MigrateError::Row {
                message,
                level,
                status,
            }) => {
                self.id_map
                    .save_id_mapping(&row, &[], status, rollback_action)?;
                self.save_message(&ids, &message, level)?;
                match status {
                    MappingStatus::Ignored => counts.ignored += 1,
                    _ => counts.failed += 1,
                }
            }
            Err(e) => {
                self.id_map
                    .save_id_mapping(&row, &[], MappingStatus::Failed, rollback_action)?;
                let message = format!("Migration failed with handled exception: {}", e);
                self.save_message(&ids, &message, MessageLevel::Error)?;
                counts.failed += 1;
            }
        }

        self.flush_messages(&ids)?;
        self.ctx.clear_source_ids();
        Ok(())
    }

    /// Remove everything this migration imported.
    ///
    /// Destination records are deleted unless their mapping says to
    /// preserve them. A destination that fails to delete keeps its mapping.
    pub fn rollback(&mut self) -> Result<RunSummary> {
        let started = Instant::now();
        self.budget.restart();
        let mut counts = RunCounts::default();
        let mut status = RunStatus::Completed;

        info!("{}: starting rollback", self.migration_id);
        for entry in self.id_map.iter()? {
            match &entry.destination_ids {
                Some(dest_ids) => {
                    let action = self
                        .id_map
                        .get_row_by_source(&entry.source_ids)?
                        .map(|r| r.rollback_action)
                        .unwrap_or_default();
                    if action == RollbackAction::Delete {
                        if let Err(e) = self.destination.rollback(dest_ids) {
                            self.sink.display(
                                &format!(
                                    "Rollback of {} failed: {}",
                                    format_ids(dest_ids),
                                    e
                                ),
                                MessageLevel::Error,
                            );
                            counts.failed += 1;
                            counts.processed += 1;
                            continue;
                        }
                    }
                    self.id_map.delete_destination(dest_ids)?;
                }
                None => self.id_map.delete(&entry.source_ids, false)?,
            }
            counts.rolled_back += 1;
            counts.processed += 1;

            if let Some(interrupt) = self.check_interruption(counts.processed, started) {
                status = match interrupt {
                    Interrupt::Limit => RunStatus::Completed,
                    Interrupt::Budget => RunStatus::Incomplete,
                    Interrupt::Stop => RunStatus::Stopped,
                };
                break;
            }
        }

        info!(
            "{}: rollback {} ({} rolled back)",
            self.migration_id,
            status.as_str(),
            counts.rolled_back
        );
        Ok(self.summary("rollback", status, counts, started))
    }

    fn save_message(&self, ids: &[IdValue], message: &str, level: MessageLevel) -> Result<()> {
        self.id_map.save_message(ids, message, level)
    }

    fn flush_messages(&self, ids: &[IdValue]) -> Result<()> {
        for (message, level) in self.ctx.drain_messages() {
            self.save_message(ids, &message, level)?;
        }
        Ok(())
    }

    fn feedback(&self, counts: &RunCounts) {
        let Some(every) = self.options.feedback_every.filter(|n| *n > 0) else {
            return;
        };
        if counts.processed % every == 0 {
            self.sink.display(
                &format!(
                    "Processed {} items ({} created, {} updated, {} failed, {} ignored) - continuing with '{}'",
                    counts.processed,
                    counts.created,
                    counts.updated,
                    counts.failed,
                    counts.ignored,
                    self.migration_id
                ),
                MessageLevel::Informational,
            );
        }
    }

    /// Checks run in order: explicit limits, memory, time, stop signal.
    fn check_interruption(&mut self, processed: u64, started: Instant) -> Option<Interrupt> {
        if self.options.limit.is_some_and(|limit| processed >= limit) {
            return Some(Interrupt::Limit);
        }
        if self.options.time_limit.is_some_and(|limit| started.elapsed() >= limit) {
            return Some(Interrupt::Limit);
        }

        let id_map = &self.id_map;
        let destination = &mut self.destination;
        let check = self.budget.check_memory(|| {
            id_map.reclaim_memory();
            destination.reclaim_memory();
        });
        match check {
            MemoryCheck::Within => {}
            MemoryCheck::Reclaimed { before, after } => {
                self.sink.display(
                    &format!(
                        "Memory usage is {} ({:.0}% of limit {}), reclaimed to {}, continuing",
                        format_size(before),
                        self.budget.memory_fraction(before) * 100.0,
                        format_size(self.budget.limits().memory_limit),
                        format_size(after)
                    ),
                    MessageLevel::Warning,
                );
            }
            MemoryCheck::Exceeded { before, after } => {
                self.sink.display(
                    &format!(
                        "Memory usage is {} ({:.0}% of limit {}), reclaiming left {}, not enough; stopping",
                        format_size(before),
                        self.budget.memory_fraction(before) * 100.0,
                        format_size(self.budget.limits().memory_limit),
                        format_size(after)
                    ),
                    MessageLevel::Warning,
                );
                return Some(Interrupt::Budget);
            }
        }

        if self.budget.time_exceeded() {
            self.sink.display(
                &format!(
                    "Execution time budget reached after {:.1}s; stopping",
                    self.budget.elapsed().as_secs_f64()
                ),
                MessageLevel::Warning,
            );
            return Some(Interrupt::Budget);
        }

        if self.stop.load(Ordering::SeqCst) {
            warn!("{}: stop requested", self.migration_id);
            return Some(Interrupt::Stop);
        }

        None
    }

    fn summary(
        &self,
        operation: &'static str,
        status: RunStatus,
        counts: RunCounts,
        started: Instant,
    ) -> RunSummary {
        RunSummary {
            run_id: uuid::Uuid::new_v4().to_string(),
            migration_id: self.migration_id.clone(),
            operation,
            status,
            counts,
            duration_secs: started.elapsed().as_secs_f64(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::{IdField, IdSchema};
    use crate::id_map::SqlIdMap;
    use crate::message::MemorySink;
    use crate::process::{SkipMethod, SkipOnEmpty, Stage};
    use crate::source::{EmbeddedDataSource, JsonFileSource, SourceOptions};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU64;
    use std::sync::Mutex;

    fn ids() -> IdSchema {
        IdSchema::new(vec![IdField::integer("id")])
    }

    fn rows(value: Value) -> Vec<serde_json::Map<String, Value>> {
        value
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r.as_object().cloned().unwrap())
            .collect()
    }

    fn source(data: Value, track_changes: bool) -> Box<dyn Source> {
        Box::new(EmbeddedDataSource::new(
            rows(data),
            SourceOptions {
                ids: ids(),
                destination_ids: ids(),
                high_water_property: None,
                track_changes,
            },
        ))
    }

    /// Destination keyed `id * 10`, recording what it stored.
    #[derive(Default)]
    struct TimesTen {
        ids: IdSchema,
        stored: Arc<Mutex<HashMap<i64, Value>>>,
        fail: Vec<i64>,
        crash: Vec<i64>,
        empty: Vec<i64>,
        imported: Arc<AtomicU64>,
    }

    impl TimesTen {
        fn new() -> Self {
            Self {
                ids: ids(),
                ..Default::default()
            }
        }
    }

    impl Destination for TimesTen {
        fn id_schema(&self) -> &IdSchema {
            &self.ids
        }

        fn import(&mut self, row: &Row, _ctx: &MigrateContext) -> Result<Option<Vec<IdValue>>> {
            self.imported.fetch_add(1, Ordering::SeqCst);
            let id = row.source_property("id").and_then(Value::as_i64).unwrap();
            if self.fail.contains(&id) {
                return Err(MigrateError::row(format!("cannot store {}", id)));
            }
            if self.crash.contains(&id) {
                return Err(MigrateError::unexpected(format!("storage crashed on {}", id)));
            }
            if self.empty.contains(&id) {
                return Ok(None);
            }
            self.stored
                .lock()
                .unwrap()
                .insert(id * 10, Value::Object(row.destination().clone()));
            Ok(Some(vec![IdValue::Integer(id * 10)]))
        }

        fn rollback(&mut self, destination_ids: &[IdValue]) -> Result<()> {
            if let IdValue::Integer(id) = destination_ids[0] {
                self.stored.lock().unwrap().remove(&id);
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            "times_ten"
        }
    }

    /// Memory reading that jumps once `threshold` rows were imported.
    struct PressureAfter {
        imported: Arc<AtomicU64>,
        threshold: u64,
    }

    impl ResourceMonitor for PressureAfter {
        fn memory_usage(&mut self) -> u64 {
            if self.imported.load(Ordering::SeqCst) >= self.threshold {
                950
            } else {
                100
            }
        }
    }

    fn limits() -> Limits {
        Limits {
            memory_limit: 1000,
            memory_threshold: 0.85,
            memory_reclaim_ratio: 0.90,
            max_execution: None,
            time_threshold: 0.90,
        }
    }

    fn quiet_budget() -> Budget {
        Budget::new(
            limits(),
            Box::new(PressureAfter {
                imported: Arc::new(AtomicU64::new(0)),
                threshold: u64::MAX,
            }),
        )
    }

    fn pipeline() -> Pipeline {
        let mut pipeline = Pipeline::new();
        pipeline.add("val", vec![Stage::get("val")]);
        pipeline
    }

    fn map() -> Box<SqlIdMap> {
        Box::new(SqlIdMap::open_in_memory("example", ids(), ids()).unwrap())
    }

    fn executable(
        source: Box<dyn Source>,
        destination: TimesTen,
        id_map: Box<dyn IdMap>,
        sink: Arc<MemorySink>,
    ) -> MigrateExecutable {
        let migration = Migration::new("example", source, pipeline(), Box::new(destination));
        MigrateExecutable::new(migration, id_map, sink, quiet_budget())
    }

    #[test]
    fn test_example_import_and_change_tracking() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let open = || -> Box<dyn IdMap> {
            Box::new(SqlIdMap::open(file.path(), "example", ids(), ids()).unwrap())
        };
        let sink = Arc::new(MemorySink::new());
        let dest = TimesTen::new();
        let stored = dest.stored.clone();

        let data = json!([{"id": 1, "val": "a"}, {"id": 2, "val": "b"}]);
        let mut exec = executable(source(data.clone(), true), dest, open(), sink.clone());
        let summary = exec.import().unwrap();
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.counts.created, 2);
        let id_map = exec.id_map();
        assert_eq!(
            id_map.lookup_destination_id(&[IdValue::Integer(1)]).unwrap(),
            Some(vec![IdValue::Integer(10)])
        );
        assert_eq!(
            id_map.lookup_destination_id(&[IdValue::Integer(2)]).unwrap(),
            Some(vec![IdValue::Integer(20)])
        );
        let first_hash = exec
            .id_map()
            .get_row_by_source(&[IdValue::Integer(1)])
            .unwrap()
            .unwrap()
            .hash;

        // Unchanged re-run does nothing.
        let dest = TimesTen { stored: stored.clone(), ..TimesTen::new() };
        let mut exec = executable(source(data, true), dest, open(), sink.clone());
        let summary = exec.import().unwrap();
        assert_eq!(summary.counts.processed, 0);
        assert_eq!(summary.counts.unchanged, 2);

        // Changed row is re-imported onto the same destination key.
        let changed = json!([{"id": 1, "val": "c"}, {"id": 2, "val": "b"}]);
        let dest = TimesTen { stored: stored.clone(), ..TimesTen::new() };
        let mut exec = executable(source(changed, true), dest, open(), sink);
        let summary = exec.import().unwrap();
        assert_eq!(summary.counts.processed, 1);
        assert_eq!(summary.counts.updated, 1);

        let record = exec.id_map().get_row_by_source(&[IdValue::Integer(1)]).unwrap().unwrap();
        assert_eq!(record.status, MappingStatus::Imported);
        assert_eq!(record.destination_ids, Some(vec![IdValue::Integer(10)]));
        assert_ne!(record.hash, first_hash);
        assert_eq!(exec.id_map().processed_count().unwrap(), 2);
        assert_eq!(stored.lock().unwrap().get(&10), Some(&json!({"val": "c"})));
    }

    #[test]
    fn test_row_failures_are_isolated() {
        let sink = Arc::new(MemorySink::new());
        let data = json!([{"id": 1}, {"id": 2}, {"id": 3}, {"id": 4}, {"id": 5}]);
        let dest = TimesTen {
            fail: vec![3],
            ..TimesTen::new()
        };
        let mut exec = executable(source(data, false), dest, map(), sink);
        let summary = exec.import().unwrap();

        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.counts.processed, 5);
        assert_eq!(summary.counts.failed, 1);
        let id_map = exec.id_map();
        assert_eq!(id_map.processed_count().unwrap(), 5);
        assert_eq!(id_map.imported_count().unwrap(), 4);
        assert_eq!(id_map.error_count().unwrap(), 1);

        let failed = id_map.get_row_by_source(&[IdValue::Integer(3)]).unwrap().unwrap();
        assert_eq!(failed.status, MappingStatus::Failed);
        assert_eq!(failed.destination_ids, None);
        let messages = id_map.messages(Some(&[IdValue::Integer(3)]), None).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message, "cannot store 3");
        assert_eq!(messages[0].level, MessageLevel::Error);
    }

    #[test]
    fn test_unexpected_errors_are_isolated() {
        let sink = Arc::new(MemorySink::new());
        let data = json!([{"id": 1}, {"id": 2}, {"id": 3}, {"id": 4}, {"id": 5}]);
        let dest = TimesTen {
            crash: vec![3],
            ..TimesTen::new()
        };
        let mut exec = executable(source(data, false), dest, map(), sink);
        let summary = exec.import().unwrap();

        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.counts.created, 4);
        assert_eq!(summary.counts.failed, 1);

        let id_map = exec.id_map();
        let failed = id_map.get_row_by_source(&[IdValue::Integer(3)]).unwrap().unwrap();
        assert_eq!(failed.status, MappingStatus::Failed);
        let messages = id_map.messages(Some(&[IdValue::Integer(3)]), None).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].level, MessageLevel::Error);
        assert!(messages[0]
            .message
            .starts_with("Migration failed with handled exception: storage crashed on 3 ("));
        assert!(messages[0].message.contains(file!()));
    }

    #[test]
    fn test_destination_error_message_is_wrapped() {
        struct Full(IdSchema);

        impl Destination for Full {
            fn id_schema(&self) -> &IdSchema {
                &self.0
            }

            fn import(&mut self, _: &Row, _: &MigrateContext) -> Result<Option<Vec<IdValue>>> {
                Err(MigrateError::destination("disk full"))
            }

            fn rollback(&mut self, _: &[IdValue]) -> Result<()> {
                Ok(())
            }

            fn name(&self) -> &'static str {
                "full"
            }
        }

        let sink = Arc::new(MemorySink::new());
        let migration = Migration::new(
            "example",
            source(json!([{"id": 1}]), false),
            pipeline(),
            Box::new(Full(ids())),
        );
        let mut exec = MigrateExecutable::new(migration, map(), sink, quiet_budget());
        exec.import().unwrap();

        let messages = exec.id_map().messages(None, None).unwrap();
        assert_eq!(
            messages[0].message,
            "Migration failed with handled exception: Destination error: disk full"
        );
    }

    #[test]
    fn test_update_keeps_stored_rollback_action() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let open = || -> Box<dyn IdMap> {
            Box::new(SqlIdMap::open(file.path(), "example", ids(), ids()).unwrap())
        };
        let sink = Arc::new(MemorySink::new());
        let data = json!([{"id": 1, "val": "a"}]);

        let dest = TimesTen::new();
        let stored = dest.stored.clone();
        let mut exec = executable(source(data.clone(), false), dest, open(), sink.clone());
        exec.import().unwrap();

        // Mark the mapping as one whose destination record must survive.
        let id_map = exec.id_map();
        let mut row = Row::new(
            json!({"id": 1, "val": "a"}).as_object().cloned().unwrap(),
            &ids(),
            &ids(),
        )
        .unwrap();
        row.rehash();
        let dest = [IdValue::Integer(10)];
        id_map
            .save_id_mapping(&row, &dest, MappingStatus::NeedsUpdate, RollbackAction::Preserve)
            .unwrap();
        drop(exec);

        let dest = TimesTen { stored: stored.clone(), ..TimesTen::new() };
        let mut exec = executable(source(data, false), dest, open(), sink);
        let summary = exec.import().unwrap();
        assert_eq!(summary.counts.updated, 1);
        let record = exec.id_map().get_row_by_source(&[IdValue::Integer(1)]).unwrap().unwrap();
        assert_eq!(record.rollback_action, RollbackAction::Preserve);

        exec.rollback().unwrap();
        assert!(stored.lock().unwrap().contains_key(&10));
        assert_eq!(exec.id_map().processed_count().unwrap(), 0);
    }

    #[test]
    fn test_high_water_survives_interruption() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let open = || -> Box<dyn IdMap> {
            Box::new(SqlIdMap::open(file.path(), "example", ids(), ids()).unwrap())
        };
        let data = json!([
            {"id": 1, "changed": 1},
            {"id": 2, "changed": 2},
            {"id": 3, "changed": 3},
            {"id": 4, "changed": 4},
            {"id": 5, "changed": 5}
        ]);
        let high_water_source = || -> Box<dyn Source> {
            Box::new(EmbeddedDataSource::new(
                rows(data.clone()),
                SourceOptions {
                    ids: ids(),
                    destination_ids: ids(),
                    high_water_property: Some("changed".into()),
                    track_changes: false,
                },
            ))
        };
        let sink = Arc::new(MemorySink::new());

        let mut seen = Vec::new();
        for expected in [vec![10, 20], vec![30, 40], vec![50]] {
            let dest = TimesTen::new();
            let stored = dest.stored.clone();
            let budget = Budget::new(
                limits(),
                Box::new(PressureAfter {
                    imported: dest.imported.clone(),
                    threshold: 2,
                }),
            );
            let migration =
                Migration::new("example", high_water_source(), pipeline(), Box::new(dest));
            let mut exec = MigrateExecutable::new(migration, open(), sink.clone(), budget);
            let summary = exec.import().unwrap();

            let mut keys: Vec<i64> = stored.lock().unwrap().keys().copied().collect();
            keys.sort();
            assert_eq!(keys, expected);
            seen.push(summary.status);
            assert!(exec.id_map().high_water().unwrap().is_some());
        }
        assert_eq!(
            seen,
            vec![RunStatus::Incomplete, RunStatus::Incomplete, RunStatus::Completed]
        );
        assert_eq!(open().high_water().unwrap(), Some(json!(5)));
    }

    #[test]
    fn test_failed_rows_retry_and_clear_messages() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let open = || -> Box<dyn IdMap> {
            Box::new(SqlIdMap::open(file.path(), "example", ids(), ids()).unwrap())
        };
        let sink = Arc::new(MemorySink::new());
        let data = json!([{"id": 1}, {"id": 2}]);

        let dest = TimesTen { fail: vec![2], ..TimesTen::new() };
        executable(source(data.clone(), false), dest, open(), sink.clone())
            .import()
            .unwrap();

        let mut exec = executable(source(data, false), TimesTen::new(), open(), sink);
        exec.id_map().set_update(&[IdValue::Integer(2)]).unwrap();
        let summary = exec.import().unwrap();
        assert_eq!(summary.counts.processed, 1);
        assert_eq!(exec.id_map().error_count().unwrap(), 0);
        assert_eq!(exec.id_map().message_count().unwrap(), 0);
    }

    #[test]
    fn test_memory_pressure_interrupts_and_resumes() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let open = || -> Box<dyn IdMap> {
            Box::new(SqlIdMap::open(file.path(), "example", ids(), ids()).unwrap())
        };
        let data = json!([{"id": 1}, {"id": 2}, {"id": 3}, {"id": 4}, {"id": 5}]);
        let sink = Arc::new(MemorySink::new());

        let dest = TimesTen::new();
        let budget = Budget::new(
            limits(),
            Box::new(PressureAfter {
                imported: dest.imported.clone(),
                threshold: 2,
            }),
        );
        let migration =
            Migration::new("example", source(data.clone(), false), pipeline(), Box::new(dest));
        let mut exec = MigrateExecutable::new(migration, open(), sink.clone(), budget);
        let summary = exec.import().unwrap();
        assert_eq!(summary.status, RunStatus::Incomplete);
        assert_eq!(summary.counts.processed, 2);
        assert_eq!(exec.id_map().processed_count().unwrap(), 2);
        assert!(sink.contains("not enough"));
        drop(exec);

        let dest = TimesTen::new();
        let imported = dest.imported.clone();
        let mut exec = executable(source(data, false), dest, open(), sink);
        let summary = exec.import().unwrap();
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(imported.load(Ordering::SeqCst), 3);
        assert_eq!(exec.id_map().processed_count().unwrap(), 5);
    }

    #[test]
    fn test_empty_result_gets_synthesized_message() {
        let sink = Arc::new(MemorySink::new());
        let dest = TimesTen { empty: vec![1], ..TimesTen::new() };
        let mut exec = executable(source(json!([{"id": 1}]), false), dest, map(), sink);
        let summary = exec.import().unwrap();
        assert_eq!(summary.counts.failed, 1);

        let messages = exec.id_map().messages(None, None).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message, NOTHING_SAVED_MESSAGE);
        let record = exec.id_map().get_row_by_source(&[IdValue::Integer(1)]).unwrap().unwrap();
        assert_eq!(record.status, MappingStatus::Failed);
    }

    #[test]
    fn test_skips() {
        let sink = Arc::new(MemorySink::new());
        let data = json!([
            {"id": 1, "val": ""},
            {"id": 2, "val": "x", "title": ""},
            {"id": 3, "val": "y", "title": "t"}
        ]);
        let mut pipeline = Pipeline::new();
        pipeline.add(
            "val",
            vec![
                Stage::get("val"),
                Stage::new(Box::new(SkipOnEmpty::new(SkipMethod::Row, None))),
            ],
        );
        pipeline.add(
            "title",
            vec![
                Stage::get("title"),
                Stage::new(Box::new(SkipOnEmpty::new(SkipMethod::Row, Some("no title".into())))),
            ],
        );
        let migration =
            Migration::new("example", source(data, false), pipeline, Box::new(TimesTen::new()));
        let mut exec = MigrateExecutable::new(migration, map(), sink, quiet_budget());
        let summary = exec.import().unwrap();

        assert_eq!(summary.counts.skipped, 1);
        assert_eq!(summary.counts.ignored, 1);
        assert_eq!(summary.counts.created, 1);

        let id_map = exec.id_map();
        assert_eq!(id_map.get_row_by_source(&[IdValue::Integer(1)]).unwrap(), None);
        let ignored = id_map.get_row_by_source(&[IdValue::Integer(2)]).unwrap().unwrap();
        assert_eq!(ignored.status, MappingStatus::Ignored);
        let messages = id_map.messages(Some(&[IdValue::Integer(2)]), None).unwrap();
        assert_eq!(messages[0].level, MessageLevel::Informational);
        assert_eq!(messages[0].message, "no title");
    }

    #[test]
    fn test_source_rewind_failure() {
        let sink = Arc::new(MemorySink::new());
        let source = Box::new(JsonFileSource::new(
            "/nonexistent/rows.json".into(),
            None,
            SourceOptions {
                ids: ids(),
                destination_ids: ids(),
                ..Default::default()
            },
        ));
        let mut exec = executable(source, TimesTen::new(), map(), sink.clone());
        let summary = exec.import().unwrap();
        assert_eq!(summary.status, RunStatus::Failed);
        assert!(sink.contains("source plugin exception"));
    }

    #[test]
    fn test_limit_and_stop() {
        let sink = Arc::new(MemorySink::new());
        let data = json!([{"id": 1}, {"id": 2}, {"id": 3}]);

        let mut exec = executable(source(data.clone(), false), TimesTen::new(), map(), sink.clone())
            .with_options(RunOptions {
                limit: Some(2),
                ..Default::default()
            });
        let summary = exec.import().unwrap();
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.counts.processed, 2);

        let exec = executable(source(data, false), TimesTen::new(), map(), sink);
        let stop = exec.stop_flag();
        stop.store(true, Ordering::SeqCst);
        let mut exec = exec;
        let summary = exec.import().unwrap();
        assert_eq!(summary.status, RunStatus::Stopped);
        assert_eq!(summary.counts.processed, 1);
    }

    #[test]
    fn test_update_mode_reimports_everything() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let open = || -> Box<dyn IdMap> {
            Box::new(SqlIdMap::open(file.path(), "example", ids(), ids()).unwrap())
        };
        let sink = Arc::new(MemorySink::new());
        let data = json!([{"id": 1}, {"id": 2}]);
        executable(source(data.clone(), false), TimesTen::new(), open(), sink.clone())
            .import()
            .unwrap();

        let mut exec = executable(source(data, false), TimesTen::new(), open(), sink)
            .with_options(RunOptions {
                update: true,
                ..Default::default()
            });
        let summary = exec.import().unwrap();
        assert_eq!(summary.counts.updated, 2);
        assert_eq!(exec.id_map().update_count().unwrap(), 0);
    }

    #[test]
    fn test_queued_messages_land_on_next_row() {
        let sink = Arc::new(MemorySink::new());
        let mut exec = executable(source(json!([{"id": 7}]), false), TimesTen::new(), map(), sink);
        exec.queue_message("early warning", MessageLevel::Warning);
        exec.import().unwrap();

        let messages = exec.id_map().messages(Some(&[IdValue::Integer(7)]), None).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message, "early warning");
    }

    #[test]
    fn test_rollback() {
        let sink = Arc::new(MemorySink::new());
        let data = json!([{"id": 1}, {"id": 2}, {"id": 3}]);
        let dest = TimesTen { fail: vec![3], ..TimesTen::new() };
        let stored = dest.stored.clone();
        let mut exec = executable(source(data, false), dest, map(), sink);
        exec.import().unwrap();
        assert_eq!(stored.lock().unwrap().len(), 2);

        let summary = exec.rollback().unwrap();
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.counts.rolled_back, 3);
        assert!(stored.lock().unwrap().is_empty());
        assert_eq!(exec.id_map().processed_count().unwrap(), 0);
        assert_eq!(exec.id_map().message_count().unwrap(), 0);
    }

    #[test]
    fn test_status_report() {
        let id_map = map();
        let migration = Migration::new(
            "example",
            source(json!([{"id": 1}, {"id": 2}]), false),
            pipeline(),
            Box::new(TimesTen::new()),
        )
        .with_label("Example");
        let report = StatusReport::collect(&migration, id_map.as_ref()).unwrap();
        assert_eq!(report.total, Some(2));
        assert_eq!(report.unprocessed, Some(2));
        assert_eq!(report.label.as_deref(), Some("Example"));
    }
}
