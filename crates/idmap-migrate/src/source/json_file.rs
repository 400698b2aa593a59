use std::path::PathBuf;

use serde_json::{Map, Value};
use tracing::debug;

use super::SourceOptions;
use crate::core::schema::IdSchema;
use crate::core::traits::Source;
use crate::error::{MigrateError, Result};
use crate::row::{Row, PROPERTY_SEPARATOR};

/// Source over an array of objects in a JSON document.
///
/// The file is read on every rewind.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
    item_selector: Option<String>,
    items: Vec<Map<String, Value>>,
    position: usize,
    options: SourceOptions,
}

impl JsonFileSource {
    pub fn new(path: PathBuf, item_selector: Option<String>, options: SourceOptions) -> Self {
        Self {
            path,
            item_selector,
            items: Vec::new(),
            position: 0,
            options,
        }
    }

    fn load(&self) -> Result<Vec<Map<String, Value>>> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            MigrateError::source_failure(format!("Cannot read {}: {}", self.path.display(), e))
        })?;
        let document: Value = serde_json::from_str(&content)?;

        let mut selected = &document;
        if let Some(selector) = self.item_selector.as_deref().filter(|s| !s.is_empty()) {
            for part in selector.split(PROPERTY_SEPARATOR).filter(|p| !p.is_empty()) {
                selected = match selected {
                    Value::Object(map) => map.get(part),
                    Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
                    _ => None,
                }
                .ok_or_else(|| {
                    MigrateError::source_failure(format!(
                        "item_selector '{}' not found in {}",
                        selector,
                        self.path.display()
                    ))
                })?;
            }
        }

        let Value::Array(items) = selected else {
            return Err(MigrateError::source_failure(format!(
                "{} does not select an array",
                self.path.display()
            )));
        };
        items
            .iter()
            .enumerate()
            .map(|(i, item)| match item {
                Value::Object(map) => Ok(map.clone()),
                _ => Err(MigrateError::source_failure(format!(
                    "Item {} of {} is not an object",
                    i,
                    self.path.display()
                ))),
            })
            .collect()
    }
}

impl Source for JsonFileSource {
    fn id_schema(&self) -> &IdSchema {
        &self.options.ids
    }

    fn rewind(&mut self) -> Result<()> {
        self.items = self.load()?;
        self.position = 0;
        debug!("Loaded {} items from {}", self.items.len(), self.path.display());
        Ok(())
    }

    fn next_row(&mut self) -> Result<Option<Row>> {
        let Some(values) = self.items.get(self.position) else {
            return Ok(None);
        };
        self.position += 1;
        Row::new(values.clone(), &self.options.ids, &self.options.destination_ids).map(Some)
    }

    fn count(&self) -> Option<u64> {
        if self.items.is_empty() {
            self.load().ok().map(|items| items.len() as u64)
        } else {
            Some(self.items.len() as u64)
        }
    }

    fn high_water_property(&self) -> Option<&str> {
        self.options.high_water_property.as_deref()
    }

    fn track_changes(&self) -> bool {
        self.options.track_changes
    }

    fn name(&self) -> &'static str {
        "json_file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::IdField;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn options() -> SourceOptions {
        let ids = IdSchema::new(vec![IdField::integer("id")]);
        SourceOptions {
            ids: ids.clone(),
            destination_ids: ids,
            ..Default::default()
        }
    }

    fn write(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_reads_selected_items() {
        let file = write(r#"{"data": {"users": [{"id": 1, "name": "a"}, {"id": 2, "name": "b"}]}}"#);
        let mut source = JsonFileSource::new(
            file.path().to_path_buf(),
            Some("data/users".into()),
            options(),
        );
        assert_eq!(source.count(), Some(2));

        source.rewind().unwrap();
        let first = source.next_row().unwrap().unwrap();
        assert_eq!(first.source_property("name"), Some(&Value::from("a")));
        assert!(source.next_row().unwrap().is_some());
        assert!(source.next_row().unwrap().is_none());

        source.rewind().unwrap();
        assert!(source.next_row().unwrap().is_some());
    }

    #[test]
    fn test_missing_file_fails_rewind() {
        let mut source = JsonFileSource::new("/nonexistent/users.json".into(), None, options());
        assert!(matches!(source.rewind(), Err(MigrateError::Source(_))));
        assert_eq!(source.count(), None);
    }

    #[test]
    fn test_non_array_selection_fails() {
        let file = write(r#"{"users": {"id": 1}}"#);
        let mut source =
            JsonFileSource::new(file.path().to_path_buf(), Some("users".into()), options());
        assert!(source.rewind().is_err());
    }

    #[test]
    fn test_item_missing_id_fails() {
        let file = write(r#"[{"name": "no id"}]"#);
        let mut source = JsonFileSource::new(file.path().to_path_buf(), None, options());
        source.rewind().unwrap();
        assert!(matches!(
            source.next_row(),
            Err(MigrateError::InvalidSourceId { .. })
        ));
    }
}
