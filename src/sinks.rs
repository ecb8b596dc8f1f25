//! Outbound side channels: client/provider/admin messages and the audit trail.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkError(pub String);

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "message delivery failed: {}", self.0)
    }
}

impl std::error::Error for SinkError {}

/// Delivers a text message to a contact address. Failures are reported, never retried here.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send_message(&self, destination: &str, text: &str) -> Result<(), SinkError>;
}

/// Fire-and-forget audit record.
pub trait AuditSink: Send + Sync {
    fn log_event(&self, name: &str, payload: Value, metadata: Value);
}

/// Writes messages to the log instead of delivering them.
#[derive(Debug, Default)]
pub struct LogMessageSink;

#[async_trait]
impl MessageSink for LogMessageSink {
    async fn send_message(&self, destination: &str, text: &str) -> Result<(), SinkError> {
        tracing::info!(destination, "message: {text}");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn log_event(&self, name: &str, payload: Value, metadata: Value) {
        tracing::info!(target: "audit", event = name, %payload, %metadata);
    }
}

// ── In-memory sinks ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub destination: String,
    pub text: String,
}

/// Keeps every message it is handed. Can be switched to fail delivery.
#[derive(Debug, Default)]
pub struct MemoryMessageSink {
    sent: Mutex<Vec<SentMessage>>,
    failing: AtomicBool,
}

impl MemoryMessageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn sent_to(&self, destination: &str) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|m| m.destination == destination)
            .map(|m| m.text)
            .collect()
    }
}

#[async_trait]
impl MessageSink for MemoryMessageSink {
    async fn send_message(&self, destination: &str, text: &str) -> Result<(), SinkError> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(SentMessage {
                destination: destination.to_string(),
                text: text.to_string(),
            });
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError(format!("{destination} unreachable")));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub name: String,
    pub payload: Value,
    pub metadata: Value,
}

#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn named(&self, name: &str) -> Vec<AuditRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.name == name)
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn log_event(&self, name: &str, payload: Value, metadata: Value) {
        if let Ok(mut records) = self.records.lock() {
            records.push(AuditRecord {
                name: name.to_string(),
                payload,
                metadata,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_sink_records_even_when_failing() {
        let sink = MemoryMessageSink::new();
        sink.send_message("+100", "hello").await.unwrap();
        sink.set_failing(true);
        assert!(sink.send_message("+100", "again").await.is_err());
        assert_eq!(sink.sent_to("+100"), vec!["hello".to_string(), "again".to_string()]);
    }

    #[test]
    fn memory_audit_filters_by_name() {
        let audit = MemoryAuditSink::new();
        audit.log_event("START", json!({"id": 1}), json!({"source": "manual"}));
        audit.log_event("END", json!({"id": 1}), json!({}));
        assert_eq!(audit.named("START").len(), 1);
        assert_eq!(audit.records().len(), 2);
    }

    #[test]
    fn log_sink_never_fails() {
        let sink = LogMessageSink;
        tokio_test::assert_ok!(tokio_test::block_on(sink.send_message("+100", "hi")));
    }
}
