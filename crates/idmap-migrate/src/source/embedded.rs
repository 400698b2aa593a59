use serde_json::{Map, Value};

use super::SourceOptions;
use crate::core::schema::IdSchema;
use crate::core::traits::Source;
use crate::error::Result;
use crate::row::Row;

/// Source over rows held in memory.
#[derive(Debug, Clone)]
pub struct EmbeddedDataSource {
    rows: Vec<Map<String, Value>>,
    position: usize,
    options: SourceOptions,
}

impl EmbeddedDataSource {
    pub fn new(rows: Vec<Map<String, Value>>, options: SourceOptions) -> Self {
        Self {
            rows,
            position: 0,
            options,
        }
    }
}

impl Source for EmbeddedDataSource {
    fn id_schema(&self) -> &IdSchema {
        &self.options.ids
    }

    fn rewind(&mut self) -> Result<()> {
        self.position = 0;
        Ok(())
    }

    fn next_row(&mut self) -> Result<Option<Row>> {
        let Some(values) = self.rows.get(self.position) else {
            return Ok(None);
        };
        self.position += 1;
        Row::new(values.clone(), &self.options.ids, &self.options.destination_ids).map(Some)
    }

    fn count(&self) -> Option<u64> {
        Some(self.rows.len() as u64)
    }

    fn high_water_property(&self) -> Option<&str> {
        self.options.high_water_property.as_deref()
    }

    fn track_changes(&self) -> bool {
        self.options.track_changes
    }

    fn name(&self) -> &'static str {
        "embedded_data"
    }
}
