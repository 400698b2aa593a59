//! SQLite-backed id map.
//!
//! Each migration gets two tables, `migrate_map_<id>` and
//! `migrate_message_<id>`, whose key columns are derived from the declared
//! source and destination id schemas. High-water values of all migrations
//! sharing a database live in `migrate_high_water`.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rusqlite::types::Value as SqlParam;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row as SqlRow};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{
    check_arity, IdMap, MapEntry, MapIter, MappingRecord, MappingStatus, MessageLevel,
    MessageRecord, RollbackAction,
};
use crate::core::identifier::{
    dest_id_column, map_table_name, message_table_name, quote, shorten_identifier,
    source_id_column,
};
use crate::core::schema::IdSchema;
use crate::core::value::IdValue;
use crate::error::Result;
use crate::message::MessageSink;
use crate::row::Row;

const HIGH_WATER_TABLE: &str = "migrate_high_water";

/// Keys per `IN (...)` list, below SQLite's bound parameter limit.
const BULK_DELETE_CHUNK: usize = 500;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Map columns that older map layouts may lack, with their definitions.
const OPTIONAL_MAP_COLUMNS: [(&str, &str); 3] = [
    ("rollback_action", "INTEGER NOT NULL DEFAULT 0"),
    ("last_imported", "INTEGER NOT NULL DEFAULT 0"),
    ("hash", "TEXT"),
];

/// Id map stored in a SQLite database.
pub struct SqlIdMap {
    conn: Connection,
    migration_id: String,
    map_table_name: String,
    message_table_name: String,
    map_table: String,
    message_table: String,
    message_index: String,
    source_ids: IdSchema,
    destination_ids: IdSchema,
    track_last_imported: bool,
    sink: Option<Arc<dyn MessageSink>>,
}

impl SqlIdMap {
    /// Open (or create) the id map for `migration_id` in a database file.
    pub fn open<P: AsRef<Path>>(
        path: P,
        migration_id: &str,
        source_ids: IdSchema,
        destination_ids: IdSchema,
    ) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn, migration_id, source_ids, destination_ids)
    }

    /// Id map in a private in-memory database.
    pub fn open_in_memory(
        migration_id: &str,
        source_ids: IdSchema,
        destination_ids: IdSchema,
    ) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, migration_id, source_ids, destination_ids)
    }

    /// Build the id map on an existing connection and ensure its schema.
    pub fn with_connection(
        conn: Connection,
        migration_id: &str,
        source_ids: IdSchema,
        destination_ids: IdSchema,
    ) -> Result<Self> {
        source_ids.validate("source ids")?;
        destination_ids.validate("destination ids")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        let map_table_name = map_table_name(migration_id);
        let message_table_name = message_table_name(migration_id);
        let index_name = shorten_identifier(&format!("idx_{}", message_table_name));

        let map = Self {
            conn,
            migration_id: migration_id.to_string(),
            map_table: quote(&map_table_name)?,
            message_table: quote(&message_table_name)?,
            message_index: quote(&index_name)?,
            map_table_name,
            message_table_name,
            source_ids,
            destination_ids,
            track_last_imported: false,
            sink: None,
        };
        map.ensure_schema()?;
        debug!(
            "Id map ready for {}: {} / {}",
            map.migration_id, map.map_table_name, map.message_table_name
        );

        Ok(map)
    }

    /// Record the import time of every saved mapping.
    pub fn with_track_last_imported(mut self, track: bool) -> Self {
        self.track_last_imported = track;
        self
    }

    pub fn map_table_name(&self) -> &str {
        &self.map_table_name
    }

    pub fn message_table_name(&self) -> &str {
        &self.message_table_name
    }

    fn display(&self, text: &str, level: MessageLevel) {
        match &self.sink {
            Some(sink) => sink.display(text, level),
            None => warn!("{}: {}", self.migration_id, text),
        }
    }

    fn source_columns(&self) -> Vec<String> {
        (1..=self.source_ids.len()).map(source_id_column).collect()
    }

    fn dest_columns(&self) -> Vec<String> {
        (1..=self.destination_ids.len()).map(dest_id_column).collect()
    }

    fn record_columns(&self) -> String {
        let mut columns = self.source_columns();
        columns.extend(self.dest_columns());
        columns.extend(
            ["needs_update", "rollback_action", "last_imported", "hash"].map(String::from),
        );
        columns.join(", ")
    }

    fn source_params(&self, ids: &[IdValue]) -> Result<Vec<SqlParam>> {
        check_arity(ids, &self.source_ids, "source")?;
        Ok(coerce_params(ids, &self.source_ids))
    }

    fn dest_params(&self, ids: &[IdValue]) -> Result<Vec<SqlParam>> {
        check_arity(ids, &self.destination_ids, "destination")?;
        Ok(coerce_params(ids, &self.destination_ids))
    }

    fn read_record(&self, row: &SqlRow<'_>) -> rusqlite::Result<RawRecord> {
        let n = self.source_ids.len();
        let m = self.destination_ids.len();
        Ok(RawRecord {
            source_ids: read_ids(row, 0, n)?,
            destination_ids: read_ids(row, n, m)?,
            status: row.get(n + m)?,
            rollback_action: row.get(n + m + 1)?,
            last_imported: row.get(n + m + 2)?,
            hash: row.get(n + m + 3)?,
        })
    }

    fn query_records(&self, sql: &str, params: &[SqlParam]) -> Result<Vec<MappingRecord>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let raw = stmt
            .query_map(params_from_iter(params.iter()), |r| self.read_record(r))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter().map(RawRecord::into_record).collect()
    }

    fn query_one(&self, sql: &str, params: &[SqlParam]) -> Result<Option<MappingRecord>> {
        let raw = self
            .conn
            .prepare_cached(sql)?
            .query_row(params_from_iter(params.iter()), |r| self.read_record(r))
            .optional()?;
        raw.map(RawRecord::into_record).transpose()
    }

    fn count(&self, table: &str, condition: Option<&str>) -> Result<u64> {
        let sql = match condition {
            Some(c) => format!("SELECT COUNT(*) FROM {} WHERE {}", table, c),
            None => format!("SELECT COUNT(*) FROM {}", table),
        };
        let count: i64 = self.conn.query_row(&sql, [], |r| r.get(0))?;
        Ok(count.max(0) as u64)
    }

    fn table_columns(&self, table: &str) -> Result<HashSet<String>> {
        let mut stmt = self.conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let names = stmt
            .query_map([], |r| r.get::<_, String>(1))?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        Ok(names)
    }
}

impl IdMap for SqlIdMap {
    fn migration_id(&self) -> &str {
        &self.migration_id
    }

    fn source_id_schema(&self) -> &IdSchema {
        &self.source_ids
    }

    fn destination_id_schema(&self) -> &IdSchema {
        &self.destination_ids
    }

    fn set_message_sink(&mut self, sink: Arc<dyn MessageSink>) {
        self.sink = Some(sink);
    }

    fn ensure_schema(&self) -> Result<()> {
        let key_columns = self.source_columns().join(", ");

        let mut map_columns = Vec::new();
        for (i, field) in self.source_ids.fields().iter().enumerate() {
            map_columns.push(format!(
                "{} {} NOT NULL",
                source_id_column(i + 1),
                field.kind.sql_type()
            ));
        }
        for (i, field) in self.destination_ids.fields().iter().enumerate() {
            map_columns.push(format!("{} {}", dest_id_column(i + 1), field.kind.sql_type()));
        }
        map_columns.push("needs_update INTEGER NOT NULL DEFAULT 0".to_string());
        for (name, definition) in OPTIONAL_MAP_COLUMNS {
            map_columns.push(format!("{} {}", name, definition));
        }

        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                {},
                PRIMARY KEY ({})
            )",
            self.map_table,
            map_columns.join(",\n                "),
            key_columns
        ))?;

        let mut message_columns = vec!["msgid INTEGER PRIMARY KEY AUTOINCREMENT".to_string()];
        for (i, field) in self.source_ids.fields().iter().enumerate() {
            message_columns.push(format!(
                "{} {} NOT NULL",
                source_id_column(i + 1),
                field.kind.sql_type()
            ));
        }
        message_columns.push(format!(
            "level INTEGER NOT NULL DEFAULT {}",
            MessageLevel::Error.code()
        ));
        message_columns.push("message TEXT NOT NULL".to_string());

        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                {}
            );
            CREATE INDEX IF NOT EXISTS {} ON {} ({});
            CREATE TABLE IF NOT EXISTS {} (
                migration TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
            self.message_table,
            message_columns.join(",\n                "),
            self.message_index,
            self.message_table,
            key_columns,
            HIGH_WATER_TABLE
        ))?;

        // Maps created by older layouts lack some columns.
        let existing = self.table_columns(&self.map_table)?;
        for (name, definition) in OPTIONAL_MAP_COLUMNS {
            if !existing.contains(name) {
                info!("Adding column {} to {}", name, self.map_table_name);
                self.conn.execute_batch(&format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    self.map_table, name, definition
                ))?;
            }
        }

        Ok(())
    }

    fn save_id_mapping(
        &self,
        row: &Row,
        destination_ids: &[IdValue],
        status: MappingStatus,
        rollback_action: RollbackAction,
    ) -> Result<()> {
        let source_ids = row.source_id_values();
        check_arity(&source_ids, &self.source_ids, "source")?;

        // A NULL key component cannot be merged on.
        if let Some(pos) = source_ids.iter().position(IdValue::is_null) {
            self.display(
                &format!(
                    "Did not save to map table due to NULL value for key field {}",
                    self.source_ids.fields()[pos].name
                ),
                MessageLevel::Error,
            );
            return Ok(());
        }

        if destination_ids.len() > self.destination_ids.len() {
            return Err(crate::error::MigrateError::IdArity {
                side: "destination",
                expected: self.destination_ids.len(),
                got: destination_ids.len(),
            });
        }

        let mut params = coerce_params(&source_ids, &self.source_ids);
        for (i, field) in self.destination_ids.fields().iter().enumerate() {
            let value = destination_ids
                .get(i)
                .map(|v| v.coerce(field.kind))
                .unwrap_or(IdValue::Null);
            params.push(to_param(&value));
        }
        let last_imported = if self.track_last_imported {
            Utc::now().timestamp()
        } else {
            0
        };
        params.push(SqlParam::Integer(status.code()));
        params.push(SqlParam::Integer(rollback_action.code()));
        params.push(SqlParam::Integer(last_imported));
        params.push(match row.hash() {
            Some(h) => SqlParam::Text(h.to_string()),
            None => SqlParam::Null,
        });

        let source_columns = self.source_columns();
        let mut columns = source_columns.clone();
        columns.extend(self.dest_columns());
        columns.extend(
            ["needs_update", "rollback_action", "last_imported", "hash"].map(String::from),
        );
        let updates = columns[source_columns.len()..]
            .iter()
            .map(|c| format!("{c} = excluded.{c}"))
            .collect::<Vec<_>>()
            .join(", ");

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})
             ON CONFLICT ({}) DO UPDATE SET {}",
            self.map_table,
            columns.join(", "),
            placeholders(columns.len()),
            source_columns.join(", "),
            updates
        );
        self.conn
            .prepare_cached(&sql)?
            .execute(params_from_iter(params.iter()))?;

        Ok(())
    }

    fn lookup_destination_id(&self, source_ids: &[IdValue]) -> Result<Option<Vec<IdValue>>> {
        let params = self.source_params(source_ids)?;
        let sql = format!(
            "SELECT {} FROM {} WHERE {}",
            self.dest_columns().join(", "),
            self.map_table,
            key_clause(&self.source_columns())
        );
        let m = self.destination_ids.len();
        let ids = self
            .conn
            .prepare_cached(&sql)?
            .query_row(params_from_iter(params.iter()), |r| read_ids(r, 0, m))
            .optional()?;

        Ok(ids.and_then(non_null))
    }

    fn lookup_source_id(&self, destination_ids: &[IdValue]) -> Result<Option<Vec<IdValue>>> {
        let params = self.dest_params(destination_ids)?;
        let sql = format!(
            "SELECT {} FROM {} WHERE {} LIMIT 1",
            self.source_columns().join(", "),
            self.map_table,
            key_clause(&self.dest_columns())
        );
        let n = self.source_ids.len();
        let ids = self
            .conn
            .prepare_cached(&sql)?
            .query_row(params_from_iter(params.iter()), |r| read_ids(r, 0, n))
            .optional()?;

        Ok(ids)
    }

    fn get_row_by_source(&self, source_ids: &[IdValue]) -> Result<Option<MappingRecord>> {
        let params = self.source_params(source_ids)?;
        let sql = format!(
            "SELECT {} FROM {} WHERE {}",
            self.record_columns(),
            self.map_table,
            key_clause(&self.source_columns())
        );
        self.query_one(&sql, &params)
    }

    fn get_row_by_destination(&self, destination_ids: &[IdValue]) -> Result<Option<MappingRecord>> {
        let params = self.dest_params(destination_ids)?;
        let sql = format!(
            "SELECT {} FROM {} WHERE {} LIMIT 1",
            self.record_columns(),
            self.map_table,
            key_clause(&self.dest_columns())
        );
        self.query_one(&sql, &params)
    }

    fn get_rows_needing_update(&self, limit: usize) -> Result<Vec<MappingRecord>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE needs_update = {} ORDER BY {} LIMIT ?",
            self.record_columns(),
            self.map_table,
            MappingStatus::NeedsUpdate.code(),
            self.source_columns().join(", ")
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.query_records(&sql, &[SqlParam::Integer(limit)])
    }

    fn save_message(
        &self,
        source_ids: &[IdValue],
        message: &str,
        level: MessageLevel,
    ) -> Result<()> {
        check_arity(source_ids, &self.source_ids, "source")?;

        if source_ids.iter().any(IdValue::is_empty) {
            self.display(message, level);
            return Ok(());
        }

        let mut params = coerce_params(source_ids, &self.source_ids);
        params.push(SqlParam::Integer(level.code()));
        params.push(SqlParam::Text(message.to_string()));

        let sql = format!(
            "INSERT INTO {} ({}, level, message) VALUES ({})",
            self.message_table,
            self.source_columns().join(", "),
            placeholders(params.len())
        );
        self.conn
            .prepare_cached(&sql)?
            .execute(params_from_iter(params.iter()))?;

        Ok(())
    }

    fn messages(
        &self,
        source_ids: Option<&[IdValue]>,
        level: Option<MessageLevel>,
    ) -> Result<Vec<MessageRecord>> {
        let mut conditions = Vec::new();
        let mut params = Vec::new();
        if let Some(ids) = source_ids {
            params.extend(self.source_params(ids)?);
            conditions.push(key_clause(&self.source_columns()));
        }
        if let Some(level) = level {
            params.push(SqlParam::Integer(level.code()));
            conditions.push("level = ?".to_string());
        }
        let filter = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };

        let n = self.source_ids.len();
        let sql = format!(
            "SELECT msgid, {}, level, message FROM {}{} ORDER BY msgid",
            self.source_columns().join(", "),
            self.message_table,
            filter
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let raw = stmt
            .query_map(params_from_iter(params.iter()), |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    read_ids(r, 1, n)?,
                    r.get::<_, i64>(n + 1)?,
                    r.get::<_, String>(n + 2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        raw.into_iter()
            .map(|(msgid, source_ids, level, message)| {
                Ok(MessageRecord {
                    msgid,
                    source_ids,
                    level: MessageLevel::from_code(level)?,
                    message,
                })
            })
            .collect()
    }

    fn delete(&self, source_ids: &[IdValue], messages_only: bool) -> Result<()> {
        let params = self.source_params(source_ids)?;
        let clause = key_clause(&self.source_columns());

        if !messages_only {
            self.conn
                .prepare_cached(&format!("DELETE FROM {} WHERE {}", self.map_table, clause))?
                .execute(params_from_iter(params.iter()))?;
        }
        self.conn
            .prepare_cached(&format!("DELETE FROM {} WHERE {}", self.message_table, clause))?
            .execute(params_from_iter(params.iter()))?;

        Ok(())
    }

    fn delete_destination(&self, destination_ids: &[IdValue]) -> Result<()> {
        if let Some(source_ids) = self.lookup_source_id(destination_ids)? {
            self.delete(&source_ids, false)?;
        }
        Ok(())
    }

    fn delete_bulk(&self, source_id_list: &[Vec<IdValue>]) -> Result<()> {
        if source_id_list.is_empty() {
            return Ok(());
        }

        let tx = self.conn.unchecked_transaction()?;

        if self.source_ids.len() == 1 {
            let kind = self.source_ids.fields()[0].kind;
            for chunk in source_id_list.chunks(BULK_DELETE_CHUNK) {
                let params = chunk
                    .iter()
                    .map(|ids| {
                        check_arity(ids, &self.source_ids, "source")?;
                        Ok(to_param(&ids[0].coerce(kind)))
                    })
                    .collect::<Result<Vec<_>>>()?;
                let list = placeholders(params.len());
                for table in [&self.map_table, &self.message_table] {
                    tx.execute(
                        &format!("DELETE FROM {} WHERE sourceid1 IN ({})", table, list),
                        params_from_iter(params.iter()),
                    )?;
                }
            }
        } else {
            for ids in source_id_list {
                self.delete(ids, false)?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn set_update(&self, source_ids: &[IdValue]) -> Result<()> {
        let params = self.source_params(source_ids)?;
        let sql = format!(
            "UPDATE {} SET needs_update = {} WHERE {}",
            self.map_table,
            MappingStatus::NeedsUpdate.code(),
            key_clause(&self.source_columns())
        );
        self.conn
            .prepare_cached(&sql)?
            .execute(params_from_iter(params.iter()))?;
        Ok(())
    }

    fn prepare_update(&self) -> Result<()> {
        let updated = self.conn.execute(
            &format!("UPDATE {} SET needs_update = ?1", self.map_table),
            params![MappingStatus::NeedsUpdate.code()],
        )?;
        info!("{}: {} mappings marked for update", self.migration_id, updated);
        Ok(())
    }

    fn processed_count(&self) -> Result<u64> {
        self.count(&self.map_table, None)
    }

    fn imported_count(&self) -> Result<u64> {
        self.count(
            &self.map_table,
            Some(&format!(
                "needs_update IN ({}, {})",
                MappingStatus::Imported.code(),
                MappingStatus::NeedsUpdate.code()
            )),
        )
    }

    fn update_count(&self) -> Result<u64> {
        self.count(
            &self.map_table,
            Some(&format!("needs_update = {}", MappingStatus::NeedsUpdate.code())),
        )
    }

    fn error_count(&self) -> Result<u64> {
        self.count(
            &self.map_table,
            Some(&format!("needs_update = {}", MappingStatus::Failed.code())),
        )
    }

    fn message_count(&self) -> Result<u64> {
        self.count(&self.message_table, None)
    }

    fn clear_messages(&self) -> Result<()> {
        self.conn
            .execute(&format!("DELETE FROM {}", self.message_table), [])?;
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        self.conn.execute_batch(&format!(
            "DROP TABLE IF EXISTS {};
             DROP TABLE IF EXISTS {};",
            self.map_table, self.message_table
        ))?;
        self.conn.execute(
            &format!("DELETE FROM {} WHERE migration = ?1", HIGH_WATER_TABLE),
            params![self.migration_id],
        )?;
        self.conn.flush_prepared_statement_cache();
        info!("{}: id map destroyed", self.migration_id);
        Ok(())
    }

    fn iter(&self) -> Result<MapIter> {
        let source_columns = self.source_columns();
        let mut columns = source_columns.clone();
        columns.extend(self.dest_columns());
        let sql = format!(
            "SELECT {} FROM {} ORDER BY {}",
            columns.join(", "),
            self.map_table,
            source_columns.join(", ")
        );

        let n = self.source_ids.len();
        let m = self.destination_ids.len();
        let mut stmt = self.conn.prepare(&sql)?;
        let entries = stmt
            .query_map([], |r| {
                Ok(MapEntry {
                    source_ids: read_ids(r, 0, n)?,
                    destination_ids: non_null(read_ids(r, n, m)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(MapIter::new(entries))
    }

    fn high_water(&self) -> Result<Option<Value>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT value FROM {} WHERE migration = ?1", HIGH_WATER_TABLE),
                params![self.migration_id],
                |r| r.get(0),
            )
            .optional()?;
        match raw {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    fn save_high_water(&self, value: &Value) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO {} (migration, value) VALUES (?1, ?2)
                 ON CONFLICT (migration) DO UPDATE SET value = excluded.value",
                HIGH_WATER_TABLE
            ),
            params![self.migration_id, serde_json::to_string(value)?],
        )?;
        Ok(())
    }

    fn reclaim_memory(&self) {
        self.conn.flush_prepared_statement_cache();
    }

    fn backend_type(&self) -> &'static str {
        "sqlite"
    }
}

/// Mapping row as read, before status codes are decoded.
struct RawRecord {
    source_ids: Vec<IdValue>,
    destination_ids: Vec<IdValue>,
    status: i64,
    rollback_action: i64,
    last_imported: i64,
    hash: Option<String>,
}

impl RawRecord {
    fn into_record(self) -> Result<MappingRecord> {
        Ok(MappingRecord {
            source_ids: self.source_ids,
            destination_ids: non_null(self.destination_ids),
            status: MappingStatus::from_code(self.status)?,
            rollback_action: RollbackAction::from_code(self.rollback_action)?,
            last_imported: self.last_imported,
            hash: self.hash,
        })
    }
}

fn to_param(value: &IdValue) -> SqlParam {
    match value {
        IdValue::Null => SqlParam::Null,
        IdValue::Integer(i) => SqlParam::Integer(*i),
        IdValue::String(s) => SqlParam::Text(s.clone()),
    }
}

fn coerce_params(ids: &[IdValue], schema: &IdSchema) -> Vec<SqlParam> {
    ids.iter()
        .zip(schema.fields())
        .map(|(v, f)| to_param(&v.coerce(f.kind)))
        .collect()
}

fn read_ids(row: &SqlRow<'_>, offset: usize, len: usize) -> rusqlite::Result<Vec<IdValue>> {
    (offset..offset + len).map(|i| row.get::<_, IdValue>(i)).collect()
}

/// `None` when no component is set.
fn non_null(ids: Vec<IdValue>) -> Option<Vec<IdValue>> {
    if ids.iter().all(IdValue::is_null) {
        None
    } else {
        Some(ids)
    }
}

fn key_clause(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| format!("{} = ?", c))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}
