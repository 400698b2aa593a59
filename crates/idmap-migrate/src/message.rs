//! Message sinks for human-readable progress and error text.

use std::sync::Mutex;

use tracing::{error, info, warn};

use crate::id_map::MessageLevel;

/// Displays or records migration messages as they occur.
pub trait MessageSink: Send + Sync {
    fn display(&self, text: &str, level: MessageLevel);
}

/// Sink that forwards messages to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MessageSink for TracingSink {
    fn display(&self, text: &str, level: MessageLevel) {
        match level {
            MessageLevel::Error => error!("{}", text),
            MessageLevel::Warning => warn!("{}", text),
            MessageLevel::Notice | MessageLevel::Informational => info!("{}", text),
        }
    }
}

/// Sink that keeps every message in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    messages: Mutex<Vec<(String, MessageLevel)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the messages received so far.
    pub fn messages(&self) -> Vec<(String, MessageLevel)> {
        self.messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.messages().iter().any(|(text, _)| text.contains(needle))
    }
}

impl MessageSink for MemorySink {
    fn display(&self, text: &str, level: MessageLevel) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push((text.to_string(), level));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_records_in_order() {
        let sink = MemorySink::new();
        sink.display("first", MessageLevel::Error);
        sink.display("second", MessageLevel::Informational);
        assert_eq!(
            sink.messages(),
            vec![
                ("first".to_string(), MessageLevel::Error),
                ("second".to_string(), MessageLevel::Informational),
            ]
        );
        assert!(sink.contains("sec"));
    }
}
