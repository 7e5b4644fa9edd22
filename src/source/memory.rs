//! Scripted in-process source.
//!
//! Entries are treated as arriving after the stream is opened, so opening
//! without a marker replays all of them. A marker skips everything up to and
//! including the event that carried it; an unknown marker replays from the
//! start.

use super::{EventSource, EventStream, SourceError};
use crate::event::{ChangeEvent, ResumeMarker};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::warn;

#[derive(Debug, Clone)]
enum Entry {
    Event(ChangeEvent),
    Malformed { position: String, reason: String },
}

/// Source backed by a fixed list of events.
#[derive(Debug, Default)]
pub struct MemorySource {
    entries: Vec<Entry>,
    following: bool,
    opened_at: Mutex<Vec<Option<ResumeMarker>>>,
}

impl MemorySource {
    /// Serve `events`, then end the stream.
    pub fn new(events: impl IntoIterator<Item = ChangeEvent>) -> Self {
        Self {
            entries: events.into_iter().map(Entry::Event).collect(),
            ..Self::default()
        }
    }

    /// Serve `events`, then wait forever like a live stream with no new writes.
    pub fn following(events: impl IntoIterator<Item = ChangeEvent>) -> Self {
        Self {
            following: true,
            ..Self::new(events)
        }
    }

    /// Append an entry that fails to decode.
    pub fn with_malformed(mut self, position: impl Into<String>, reason: impl Into<String>) -> Self {
        self.entries.push(Entry::Malformed {
            position: position.into(),
            reason: reason.into(),
        });
        self
    }

    /// Positions this source has been opened at, in order.
    pub fn opened_at(&self) -> Vec<Option<ResumeMarker>> {
        self.opened_at.lock().clone()
    }

    fn start_index(&self, resume: Option<&ResumeMarker>) -> usize {
        let Some(marker) = resume else {
            return 0;
        };
        let found = self.entries.iter().position(|entry| match entry {
            Entry::Event(event) => &event.resume_marker == marker,
            Entry::Malformed { .. } => false,
        });
        match found {
            Some(index) => index + 1,
            None => {
                warn!(resume_marker = %marker, "Unknown resume marker, replaying from the start");
                0
            }
        }
    }
}

#[async_trait]
impl EventSource for MemorySource {
    async fn open(&self, resume: Option<&ResumeMarker>) -> Result<Box<dyn EventStream>, SourceError> {
        self.opened_at.lock().push(resume.cloned());
        let start = self.start_index(resume);
        Ok(Box::new(MemoryStream {
            pending: self.entries[start..].iter().cloned().collect(),
            following: self.following,
        }))
    }
}

struct MemoryStream {
    pending: VecDeque<Entry>,
    following: bool,
}

#[async_trait]
impl EventStream for MemoryStream {
    async fn next_event(&mut self) -> Result<Option<ChangeEvent>, SourceError> {
        match self.pending.pop_front() {
            Some(Entry::Event(event)) => Ok(Some(event)),
            Some(Entry::Malformed { position, reason }) => {
                Err(SourceError::Malformed { position, reason })
            }
            None if self.following => std::future::pending().await,
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::OperationKind;
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    fn event(position: &str) -> ChangeEvent {
        ChangeEvent::from_json(position, Utc::now(), OperationKind::Insert, json!({"playerID": 1}))
    }

    async fn drain(stream: &mut Box<dyn EventStream>) -> Vec<String> {
        let mut seen = Vec::new();
        while let Some(e) = stream.next_event().await.unwrap() {
            seen.push(e.commit_position);
        }
        seen
    }

    #[tokio::test]
    async fn test_fresh_open_serves_everything() {
        let source = MemorySource::new(vec![event("1-0"), event("2-0")]);
        let mut stream = source.open(None).await.unwrap();
        assert_eq!(drain(&mut stream).await, vec!["1-0", "2-0"]);
    }

    #[tokio::test]
    async fn test_resume_starts_after_marker() {
        let source = MemorySource::new(vec![event("1-0"), event("2-0"), event("3-0")]);
        let marker = ResumeMarker::new("2-0");
        let mut stream = source.open(Some(&marker)).await.unwrap();
        assert_eq!(drain(&mut stream).await, vec!["3-0"]);
        assert_eq!(source.opened_at(), vec![Some(marker)]);
    }

    #[tokio::test]
    async fn test_unknown_marker_replays() {
        let source = MemorySource::new(vec![event("1-0")]);
        let mut stream = source.open(Some(&ResumeMarker::new("9-9"))).await.unwrap();
        assert_eq!(drain(&mut stream).await, vec!["1-0"]);
    }

    #[tokio::test]
    async fn test_malformed_entry_is_an_error() {
        let source = MemorySource::new(vec![event("1-0")]).with_malformed("2-0", "bad json");
        let mut stream = source.open(None).await.unwrap();
        assert!(stream.next_event().await.unwrap().is_some());
        assert!(stream.next_event().await.unwrap_err().is_malformed());
        assert!(stream.next_event().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_following_blocks_after_last_event() {
        let source = MemorySource::following(vec![event("1-0")]);
        let mut stream = source.open(None).await.unwrap();
        assert!(stream.next_event().await.unwrap().is_some());

        let next = tokio::time::timeout(Duration::from_secs(60), stream.next_event()).await;
        assert!(next.is_err());
    }
}
