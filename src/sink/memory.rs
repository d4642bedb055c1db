use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::sink::{RequestStatus, ResultMetadata, ResultSink, SinkError};

#[derive(Debug, Clone)]
struct Entry {
    content: String,
    status: RequestStatus,
    metadata: Option<ResultMetadata>,
    error: Option<String>,
}

impl Entry {
    fn new() -> Self {
        Self {
            content: String::new(),
            status: RequestStatus::InProgress,
            metadata: None,
            error: None,
        }
    }
}

/// In-memory result storage
#[derive(Clone, Default)]
pub struct MemorySink {
    entries: Arc<DashMap<Uuid, Entry>>,
}

impl MemorySink {
    /// Create an empty in-memory sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata recorded by `finalize`
    pub fn metadata(&self, id: Uuid) -> Option<ResultMetadata> {
        self.entries.get(&id).and_then(|entry| entry.metadata.clone())
    }

    /// Message recorded by `mark_error`
    pub fn error(&self, id: Uuid) -> Option<String> {
        self.entries.get(&id).and_then(|entry| entry.error.clone())
    }

    /// Number of requests known to the sink
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no request has been written yet
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids currently in the given status
    pub fn ids_with_status(&self, status: RequestStatus) -> Vec<Uuid> {
        self.entries
            .iter()
            .filter(|entry| entry.status == status)
            .map(|entry| *entry.key())
            .collect()
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn initialize(&self, id: Uuid) -> Result<(), SinkError> {
        let mut entry = self.entries.entry(id).or_insert_with(Entry::new);
        if entry.status.is_terminal() {
            return Err(SinkError::AlreadyTerminal(id));
        }
        *entry = Entry::new();
        Ok(())
    }

    async fn append(&self, id: Uuid, fragment: &str) -> Result<(), SinkError> {
        let mut entry = self.entries.entry(id).or_insert_with(Entry::new);
        if entry.status.is_terminal() {
            return Err(SinkError::AlreadyTerminal(id));
        }
        entry.content.push_str(fragment);
        Ok(())
    }

    async fn finalize(&self, id: Uuid, metadata: &ResultMetadata) -> Result<(), SinkError> {
        let mut entry = self.entries.entry(id).or_insert_with(Entry::new);
        if entry.status.is_terminal() {
            debug!(request_id = %id, status = %entry.status, "Ignoring finalize on terminal request");
            return Ok(());
        }
        entry.status = RequestStatus::Completed;
        entry.metadata = Some(metadata.clone());
        Ok(())
    }

    async fn mark_error(&self, id: Uuid, message: &str) -> Result<(), SinkError> {
        let mut entry = self.entries.entry(id).or_insert_with(Entry::new);
        if entry.status.is_terminal() {
            debug!(request_id = %id, status = %entry.status, "Ignoring error on terminal request");
            return Ok(());
        }
        entry.status = RequestStatus::Failed;
        entry.content = format!("Error: {message}");
        entry.error = Some(message.to_string());
        Ok(())
    }

    async fn get_status(&self, id: Uuid) -> Result<RequestStatus, SinkError> {
        Ok(self
            .entries
            .get(&id)
            .map(|entry| entry.status)
            .unwrap_or(RequestStatus::InProgress))
    }

    async fn get_content(&self, id: Uuid) -> Result<Option<String>, SinkError> {
        Ok(self.entries.get(&id).map(|entry| entry.content.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stream_then_finalize() {
        let sink = MemorySink::new();
        let id = Uuid::new_v4();

        sink.initialize(id).await.unwrap();
        assert_eq!(sink.get_content(id).await.unwrap(), Some(String::new()));
        for fragment in ["H", "i", "!"] {
            sink.append(id, fragment).await.unwrap();
        }
        assert_eq!(sink.get_status(id).await.unwrap(), RequestStatus::InProgress);

        let meta = ResultMetadata::new(Duration::from_millis(30), 3);
        sink.finalize(id, &meta).await.unwrap();

        assert_eq!(sink.get_content(id).await.unwrap().as_deref(), Some("Hi!"));
        assert_eq!(sink.get_status(id).await.unwrap(), RequestStatus::Completed);
        assert_eq!(sink.metadata(id), Some(meta));
    }

    #[tokio::test]
    async fn test_unknown_request() {
        let sink = MemorySink::new();
        let id = Uuid::new_v4();
        assert_eq!(sink.get_status(id).await.unwrap(), RequestStatus::InProgress);
        assert_eq!(sink.get_content(id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_terminal_status_is_final() {
        let sink = MemorySink::new();
        let id = Uuid::new_v4();
        sink.initialize(id).await.unwrap();
        sink.append(id, "partial").await.unwrap();
        sink.mark_error(id, "generator exploded").await.unwrap();

        assert_eq!(sink.get_status(id).await.unwrap(), RequestStatus::Failed);
        assert_eq!(
            sink.get_content(id).await.unwrap().as_deref(),
            Some("Error: generator exploded")
        );

        sink.finalize(id, &ResultMetadata::new(Duration::from_millis(1), 1))
            .await
            .unwrap();
        assert_eq!(sink.get_status(id).await.unwrap(), RequestStatus::Failed);
        assert!(matches!(
            sink.append(id, "late").await,
            Err(SinkError::AlreadyTerminal(_))
        ));
        assert_eq!(sink.error(id).as_deref(), Some("generator exploded"));
        assert_eq!(sink.ids_with_status(RequestStatus::Failed), vec![id]);
    }

    #[tokio::test]
    async fn test_initialize_refuses_terminal_request() {
        let sink = MemorySink::new();
        let id = Uuid::new_v4();
        sink.initialize(id).await.unwrap();
        sink.append(id, "done").await.unwrap();
        sink.finalize(id, &ResultMetadata::new(Duration::from_millis(5), 1))
            .await
            .unwrap();

        assert!(matches!(
            sink.initialize(id).await,
            Err(SinkError::AlreadyTerminal(rejected)) if rejected == id
        ));
        assert_eq!(sink.get_status(id).await.unwrap(), RequestStatus::Completed);
        assert_eq!(sink.get_content(id).await.unwrap().as_deref(), Some("done"));
        assert!(sink.metadata(id).is_some());
    }

    #[tokio::test]
    async fn test_initialize_restarts_in_progress_request() {
        let sink = MemorySink::new();
        let id = Uuid::new_v4();
        sink.initialize(id).await.unwrap();
        sink.append(id, "stale").await.unwrap();

        sink.initialize(id).await.unwrap();
        assert_eq!(sink.get_content(id).await.unwrap(), Some(String::new()));
        assert_eq!(sink.get_status(id).await.unwrap(), RequestStatus::InProgress);
    }
}
