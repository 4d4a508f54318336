//! Core data types for the Pixpress compression pipeline.
//!
//! These types describe the persisted task rows, the queue wire payload, and
//! the ephemeral per-file outcomes that drive persistence and acknowledgment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Database identity of a file task.
pub type FileId = i64;

/// Lifecycle status of a file task.
///
/// ```text
/// pending ──▶ processing ──▶ compressed
///    ▲            │
///    └────────────┤ (recoverable failure, attempts + 1)
///                 ▼
///               failed     (attempts exhausted)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Processing,
    Compressed,
    Failed,
}

impl FileStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [FileStatus; 4] = [
        FileStatus::Pending,
        FileStatus::Processing,
        FileStatus::Compressed,
        FileStatus::Failed,
    ];

    /// Stable string form stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Processing => "processing",
            FileStatus::Compressed => "compressed",
            FileStatus::Failed => "failed",
        }
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: FileStatus) -> bool {
        matches!(
            (self, next),
            (FileStatus::Pending, FileStatus::Processing)
                | (FileStatus::Processing, FileStatus::Compressed)
                | (FileStatus::Processing, FileStatus::Pending)
                | (FileStatus::Processing, FileStatus::Failed)
        )
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(FileStatus::Pending),
            "processing" => Ok(FileStatus::Processing),
            "compressed" => Ok(FileStatus::Compressed),
            "failed" => Ok(FileStatus::Failed),
            other => Err(format!("unknown file status: {other}")),
        }
    }
}

/// A file waiting for (or done with) compression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileTask {
    pub id: FileId,

    /// Display name, renamed to the output name on success
    pub name: String,

    /// Storage key of the current file
    pub path: String,

    pub status: FileStatus,

    /// Number of failed compression attempts so far
    pub failed_attempts: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Deferred deletion of a pre-transcode original.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFileToDelete {
    pub id: i64,
    pub file_id: FileId,
    pub source_path: String,
    pub created_at: DateTime<Utc>,
}

/// Permanent audit row for a task whose retries were exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: i64,
    pub file_id: FileId,
    pub error_message: String,
    pub created_at: DateTime<Utc>,
}

/// Queue wire payload: one message per file task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionMessage {
    #[serde(alias = "fileID", alias = "fileId")]
    pub file_id: FileId,
}

impl CompressionMessage {
    pub fn new(file_id: FileId) -> Self {
        Self { file_id }
    }

    /// Parse a raw queue payload.
    pub fn parse(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Serialize to the queue payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Result of transcoding one file, as seen by the consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub file_id: FileId,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskOutcome {
    pub fn succeeded(file_id: FileId) -> Self {
        Self {
            file_id,
            success: true,
            error: None,
        }
    }

    pub fn failed(file_id: FileId, error: impl Into<String>) -> Self {
        Self {
            file_id,
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Aggregate statistics for one orchestrator run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompressionSummary {
    /// Distinct ids in the batch
    pub requested: usize,

    /// Tasks that were pending and dispatched
    pub processed: usize,

    pub succeeded: usize,
    pub failed: usize,

    /// Ids that were no longer pending at fetch time
    pub skipped: usize,

    /// Dispatched tasks that never produced an outcome
    pub cancelled: usize,

    /// Wall time of the transcode phase
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,

    /// Process CPU time over wall time, in percent (may exceed 100 on multiple cores)
    pub cpu_percent: f64,

    /// Peak resident memory observed during the run
    pub peak_memory_mb: f64,
}

/// Outcomes plus summary returned to the batch consumer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompressionReport {
    pub outcomes: Vec<TaskOutcome>,

    /// Ids that were not pending; safe to acknowledge
    pub skipped: Vec<FileId>,

    pub summary: CompressionSummary,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use FileStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Compressed));
        assert!(Processing.can_transition_to(Pending));
        assert!(Processing.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Compressed));
        assert!(!Compressed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Processing.can_transition_to(Processing));
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in FileStatus::ALL {
            assert_eq!(status.as_str().parse::<FileStatus>().unwrap(), status);
        }
        assert!("archived".parse::<FileStatus>().is_err());
    }

    #[test]
    fn test_message_parse_accepts_aliases() {
        assert_eq!(
            CompressionMessage::parse(br#"{"file_id": 12}"#).unwrap(),
            CompressionMessage::new(12)
        );
        assert_eq!(
            CompressionMessage::parse(br#"{"fileID": 13}"#).unwrap(),
            CompressionMessage::new(13)
        );
    }

    #[test]
    fn test_message_parse_rejects_garbage() {
        assert!(CompressionMessage::parse(b"not json").is_err());
        assert!(CompressionMessage::parse(br#"{"file_id": "abc"}"#).is_err());
        assert!(CompressionMessage::parse(br#"{}"#).is_err());
    }

    #[test]
    fn test_summary_serializes_elapsed_as_millis() {
        let summary = CompressionSummary {
            elapsed: Duration::from_millis(1500),
            ..Default::default()
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["elapsed"], 1500);
    }
}
