use std::path::Path;
use std::time::Duration;

use rusqlite::types::Value as SqlParam;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::{Map, Value};
use tracing::debug;

use crate::core::identifier::quote;
use crate::core::schema::{IdFieldType, IdSchema};
use crate::core::traits::{Destination, MigrateContext};
use crate::core::value::{format_ids, IdValue};
use crate::error::{MigrateError, Result};
use crate::id_map::{check_arity, RollbackAction};
use crate::row::Row;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Destination writing rows into one SQLite table.
///
/// The table has one column per destination id field plus a `data` column
/// holding the other destination properties as JSON. A single integer id
/// is a rowid alias, so rows without that id get one assigned on insert.
pub struct TableDestination {
    conn: Connection,
    table: String,
    ids: IdSchema,
    id_columns: Vec<String>,
    rollback_action: RollbackAction,
}

impl TableDestination {
    pub fn open<P: AsRef<Path>>(path: P, table: &str, ids: IdSchema) -> Result<Self> {
        Self::with_connection(Connection::open(path)?, table, ids)
    }

    pub fn open_in_memory(table: &str, ids: IdSchema) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, table, ids)
    }

    pub fn with_connection(conn: Connection, table: &str, ids: IdSchema) -> Result<Self> {
        ids.validate("destination ids")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        let id_columns = ids
            .fields()
            .iter()
            .map(|f| quote(&f.name))
            .collect::<Result<Vec<_>>>()?;
        let destination = Self {
            conn,
            table: quote(table)?,
            ids,
            id_columns,
            rollback_action: RollbackAction::Delete,
        };
        destination.create_table()?;
        Ok(destination)
    }

    pub fn with_rollback_action(mut self, action: RollbackAction) -> Self {
        self.rollback_action = action;
        self
    }

    fn rowid_key(&self) -> bool {
        self.ids.len() == 1 && self.ids.fields()[0].kind == IdFieldType::Integer
    }

    fn create_table(&self) -> Result<()> {
        let sql = if self.rowid_key() {
            format!(
                "CREATE TABLE IF NOT EXISTS {} ({} INTEGER PRIMARY KEY, data TEXT NOT NULL)",
                self.table, self.id_columns[0]
            )
        } else {
            let columns = self
                .ids
                .fields()
                .iter()
                .zip(&self.id_columns)
                .map(|(f, c)| format!("{} {} NOT NULL", c, f.kind.sql_type()))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "CREATE TABLE IF NOT EXISTS {} ({}, data TEXT NOT NULL, PRIMARY KEY ({}))",
                self.table,
                columns,
                self.id_columns.join(", ")
            )
        };
        self.conn.execute_batch(&sql)?;
        Ok(())
    }

    fn key_clause(&self) -> String {
        self.id_columns
            .iter()
            .map(|c| format!("{} = ?", c))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    fn key_params(&self, ids: &[IdValue]) -> Result<Vec<SqlParam>> {
        check_arity(ids, &self.ids, "destination")?;
        Ok(ids
            .iter()
            .zip(self.ids.fields())
            .map(|(v, f)| match v.coerce(f.kind) {
                IdValue::Null => SqlParam::Null,
                IdValue::Integer(i) => SqlParam::Integer(i),
                IdValue::String(s) => SqlParam::Text(s),
            })
            .collect())
    }

    /// Stored document for a destination key.
    pub fn fetch(&self, ids: &[IdValue]) -> Result<Option<Map<String, Value>>> {
        let params = self.key_params(ids)?;
        let raw: Option<String> = self
            .conn
            .prepare_cached(&format!(
                "SELECT data FROM {} WHERE {}",
                self.table,
                self.key_clause()
            ))?
            .query_row(params_from_iter(params.iter()), |r| r.get(0))
            .optional()?;
        raw.map(|text| serde_json::from_str(&text).map_err(MigrateError::from))
            .transpose()
    }

    pub fn row_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", self.table), [], |r| r.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// Destination key for a row: its own id properties, falling back to the
    /// key of its existing mapping.
    fn resolve_ids(&self, row: &Row) -> Vec<IdValue> {
        let ids = row.destination_id_values();
        if !ids.iter().any(IdValue::is_null) {
            return ids;
        }
        match row.id_map().and_then(|m| m.destination_ids.clone()) {
            Some(mapped) if mapped.len() == ids.len() => ids
                .into_iter()
                .zip(mapped)
                .map(|(own, mapped)| if own.is_null() { mapped } else { own })
                .collect(),
            _ => ids,
        }
    }
}

impl Destination for TableDestination {
    fn id_schema(&self) -> &IdSchema {
        &self.ids
    }

    fn import(&mut self, row: &Row, ctx: &MigrateContext) -> Result<Option<Vec<IdValue>>> {
        let ids = self.resolve_ids(row);

        let mut document = row.destination().clone();
        for field in self.ids.fields() {
            document.remove(&field.name);
        }
        let data = serde_json::to_string(&document)?;

        if ids.iter().any(IdValue::is_null) {
            if !self.rowid_key() {
                return Err(MigrateError::row(format!(
                    "Missing destination id for {} in {}",
                    self.ids.names().join(", "),
                    self.table
                )));
            }
            self.conn
                .prepare_cached(&format!("INSERT INTO {} (data) VALUES (?1)", self.table))?
                .execute([&data])?;
            let id = self.conn.last_insert_rowid();
            debug!("{}: inserted {} into {}", ctx.migration_id(), id, self.table);
            return Ok(Some(vec![IdValue::Integer(id)]));
        }

        if ctx.is_update() {
            debug!("{}: updating {} in {}", ctx.migration_id(), format_ids(&ids), self.table);
        }
        let mut params = self.key_params(&ids)?;
        params.push(SqlParam::Text(data));
        let placeholders = vec!["?"; params.len()].join(", ");
        self.conn
            .prepare_cached(&format!(
                "INSERT INTO {} ({}, data) VALUES ({})
                 ON CONFLICT ({}) DO UPDATE SET data = excluded.data",
                self.table,
                self.id_columns.join(", "),
                placeholders,
                self.id_columns.join(", ")
            ))?
            .execute(params_from_iter(params.iter()))?;

        Ok(Some(
            ids.iter()
                .zip(self.ids.fields())
                .map(|(v, f)| v.coerce(f.kind))
                .collect(),
        ))
    }

    fn rollback(&mut self, destination_ids: &[IdValue]) -> Result<()> {
        let params = self.key_params(destination_ids)?;
        self.conn
            .prepare_cached(&format!(
                "DELETE FROM {} WHERE {}",
                self.table,
                self.key_clause()
            ))?
            .execute(params_from_iter(params.iter()))?;
        Ok(())
    }

    fn rollback_action(&self) -> RollbackAction {
        self.rollback_action
    }

    fn reclaim_memory(&mut self) {
        self.conn.flush_prepared_statement_cache();
    }

    fn name(&self) -> &'static str {
        "table"
    }
}
