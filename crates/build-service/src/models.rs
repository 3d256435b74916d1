//! Data models for the build service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Build job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is queued, waiting for a worker
    Pending,
    /// Job has been claimed and is building
    Building,
    /// Build completed successfully
    Completed,
    /// Build failed
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Building => "building",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "building" => Some(JobStatus::Building),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// Pending or building: the single in-flight slot per fingerprint.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Building)
    }
}

/// A build job in the queue, keyed by request fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildJob {
    /// Monotonic row id; claim order follows it
    pub id: i64,

    pub request_hash: String,

    pub status: JobStatus,

    pub enqueued_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Identifier of the worker that claimed the job
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,

    /// Position assigned at admission; live position is derived from
    /// earlier pending jobs
    pub queue_position: usize,

    /// The `make image` command line that was executed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_cmd: Option<String>,

    /// `<phase>: <reason>` message for failed jobs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// The cached descriptor of a finished build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResult {
    pub request_hash: String,

    /// Artifact filenames relative to `store/<fingerprint>/`
    pub images: Vec<String>,

    /// ImageBuilder manifest: one `name - version` line per package
    pub manifest: String,

    pub build_at: DateTime<Utc>,

    /// False at first write; the submit path flips it on read to signal
    /// deduplication
    pub cache_hit: bool,

    pub build_duration_seconds: i64,
}

/// Outcome of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new job was created at this 1-based queue position
    Queued { position: usize },
    /// A job for this fingerprint is already pending or building
    AlreadyInFlight,
    /// A result for this fingerprint already exists
    AlreadyBuilt,
}

/// The response envelope shared by the submit and status endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResponse {
    pub request_hash: String,

    pub status: JobStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_duration: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub cache_hit: bool,
}

impl BuildResponse {
    /// Envelope for a terminal successful result.
    pub fn from_result(result: &BuildResult, cache_hit: bool) -> Self {
        Self {
            request_hash: result.request_hash.clone(),
            status: JobStatus::Completed,
            queue_position: None,
            images: Some(result.images.clone()),
            manifest: Some(result.manifest.clone()),
            error_message: None,
            build_duration: Some(result.build_duration_seconds),
            enqueued_at: None,
            started_at: None,
            finished_at: Some(result.build_at),
            cache_hit,
        }
    }

    /// Envelope for an in-flight or failed job.
    pub fn from_job(job: &BuildJob, queue_position: Option<usize>) -> Self {
        Self {
            request_hash: job.request_hash.clone(),
            status: job.status,
            queue_position,
            images: None,
            manifest: None,
            error_message: job.error_message.clone(),
            build_duration: None,
            enqueued_at: Some(job.enqueued_at),
            started_at: job.started_at,
            finished_at: job.finished_at,
            cache_hit: false,
        }
    }
}
