//! SQLite storage for requests, jobs, results and counters.
//!
//! This is the only shared mutable state in the service. Every status
//! transition goes through here, and `claim_pending` is the single
//! synchronization point between workers: it runs in an immediate
//! transaction so no two workers can observe the same job as pending.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info};

use crate::models::{BuildJob, BuildResult, EnqueueOutcome, JobStatus};
use wrtforge_common::BuildRequest;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS build_requests(
        request_hash TEXT PRIMARY KEY,
        distro TEXT NOT NULL,
        version TEXT NOT NULL,
        target TEXT NOT NULL,
        profile TEXT NOT NULL,
        packages TEXT NOT NULL,
        packages_versions TEXT NOT NULL,
        defaults TEXT,
        rootfs_size_mb INTEGER,
        repositories TEXT NOT NULL,
        repository_keys TEXT NOT NULL,
        diff_packages INTEGER NOT NULL,
        skip_package_resolution INTEGER NOT NULL DEFAULT 0,
        client TEXT,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS build_jobs(
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        request_hash TEXT NOT NULL,
        status TEXT NOT NULL,
        enqueued_at TEXT NOT NULL,
        started_at TEXT,
        finished_at TEXT,
        worker_id TEXT,
        queue_position INTEGER NOT NULL,
        build_cmd TEXT,
        error_message TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_build_jobs_hash ON build_jobs(request_hash);
    CREATE INDEX IF NOT EXISTS idx_build_jobs_status ON build_jobs(status);

    CREATE TABLE IF NOT EXISTS build_results(
        request_hash TEXT PRIMARY KEY,
        images TEXT NOT NULL,
        manifest TEXT NOT NULL,
        build_at TEXT NOT NULL,
        cache_hit INTEGER NOT NULL,
        build_duration_seconds INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS counters(
        name TEXT PRIMARY KEY,
        value INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS metadata_cache(
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        expires_at TEXT NOT NULL
    );
";

/// Storage backend for the job queue and the result cache.
pub struct Storage {
    conn: Connection,
}

impl Storage {
    /// Open (and if necessary create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create database directory {}", dir.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;

        // WAL lets the API connection read while a worker writes.
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL mode")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("Failed to set synchronous mode")?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;

        conn.execute_batch(SCHEMA)
            .context("Failed to initialize schema")?;

        info!("Database ready at {}", path.display());

        Ok(Self { conn })
    }

    /// Idempotent insert of a canonical request. Safe to call twice with
    /// the same fingerprint.
    pub fn put_request(&mut self, req: &BuildRequest) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO build_requests (
                    request_hash, distro, version, target, profile,
                    packages, packages_versions, defaults, rootfs_size_mb,
                    repositories, repository_keys, diff_packages,
                    skip_package_resolution, client, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    req.request_hash,
                    req.distro,
                    req.version,
                    req.target,
                    req.profile,
                    serde_json::to_string(&req.packages)?,
                    serde_json::to_string(&req.packages_versions)?,
                    req.defaults,
                    req.rootfs_size_mb,
                    serde_json::to_string(&req.repositories)?,
                    serde_json::to_string(&req.repository_keys)?,
                    req.diff_packages,
                    req.skip_package_resolution,
                    req.client,
                    req.created_at.to_rfc3339(),
                ],
            )
            .context("Failed to insert build request")?;
        Ok(())
    }

    /// Look up the canonical request for a fingerprint.
    pub fn get_request(&self, request_hash: &str) -> Result<Option<BuildRequest>> {
        self.conn
            .query_row(
                "SELECT request_hash, distro, version, target, profile,
                        packages, packages_versions, defaults, rootfs_size_mb,
                        repositories, repository_keys, diff_packages,
                        skip_package_resolution, client, created_at
                 FROM build_requests WHERE request_hash = ?1",
                params![request_hash],
                request_from_row,
            )
            .optional()
            .context("Failed to query build request")
    }

    /// Create a PENDING job iff no job is in flight and no result exists.
    pub fn enqueue(&mut self, request_hash: &str) -> Result<EnqueueOutcome> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let built: i64 = tx.query_row(
            "SELECT COUNT(*) FROM build_results WHERE request_hash = ?1",
            params![request_hash],
            |row| row.get(0),
        )?;
        if built > 0 {
            return Ok(EnqueueOutcome::AlreadyBuilt);
        }

        let active: i64 = tx.query_row(
            "SELECT COUNT(*) FROM build_jobs
             WHERE request_hash = ?1 AND status IN ('pending', 'building')",
            params![request_hash],
            |row| row.get(0),
        )?;
        if active > 0 {
            return Ok(EnqueueOutcome::AlreadyInFlight);
        }

        let pending: i64 = tx.query_row(
            "SELECT COUNT(*) FROM build_jobs WHERE status = 'pending'",
            params![],
            |row| row.get(0),
        )?;
        let position = pending as usize + 1;

        tx.execute(
            "INSERT INTO build_jobs (request_hash, status, enqueued_at, queue_position)
             VALUES (?1, 'pending', ?2, ?3)",
            params![request_hash, Utc::now().to_rfc3339(), position],
        )?;

        tx.commit()?;

        debug!("Enqueued {} at position {}", request_hash, position);
        Ok(EnqueueOutcome::Queued { position })
    }

    /// Latest job for a fingerprint, if any.
    pub fn get_job(&self, request_hash: &str) -> Result<Option<BuildJob>> {
        self.conn
            .query_row(
                &format!("{JOB_COLUMNS} WHERE request_hash = ?1 ORDER BY id DESC LIMIT 1"),
                params![request_hash],
                job_from_row,
            )
            .optional()
            .context("Failed to query build job")
    }

    /// Number of PENDING jobs.
    pub fn queue_length(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM build_jobs WHERE status = 'pending'",
            params![],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// 1-based position among PENDING jobs, counting only jobs admitted
    /// earlier. None when the latest job is not pending.
    pub fn queue_position(&self, request_hash: &str) -> Result<Option<usize>> {
        let Some(job) = self.get_job(request_hash)? else {
            return Ok(None);
        };
        if job.status != JobStatus::Pending {
            return Ok(None);
        }

        let position: i64 = self.conn.query_row(
            "SELECT COUNT(*) + 1 FROM build_jobs WHERE status = 'pending' AND id < ?1",
            params![job.id],
            |row| row.get(0),
        )?;
        Ok(Some(position as usize))
    }

    /// Atomically claim the oldest PENDING job for `worker_id`.
    ///
    /// Runs in an immediate transaction: concurrent callers serialize
    /// here and can never both obtain the same job.
    pub fn claim_pending(&mut self, worker_id: &str) -> Result<Option<BuildJob>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidate: Option<i64> = tx
            .query_row(
                "SELECT id FROM build_jobs WHERE status = 'pending' ORDER BY id ASC LIMIT 1",
                params![],
                |row| row.get(0),
            )
            .optional()?;

        let Some(id) = candidate else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE build_jobs SET status = 'building', started_at = ?1, worker_id = ?2
             WHERE id = ?3",
            params![Utc::now().to_rfc3339(), worker_id, id],
        )?;

        let job = tx.query_row(
            &format!("{JOB_COLUMNS} WHERE id = ?1"),
            params![id],
            job_from_row,
        )?;

        tx.commit()?;
        Ok(Some(job))
    }

    /// Terminal transition BUILDING -> COMPLETED.
    pub fn complete(&mut self, request_hash: &str, build_cmd: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE build_jobs SET status = 'completed', finished_at = ?1, build_cmd = ?2
             WHERE request_hash = ?3 AND status = 'building'",
            params![Utc::now().to_rfc3339(), build_cmd, request_hash],
        )?;
        Ok(())
    }

    /// Terminal transition BUILDING -> FAILED.
    pub fn fail(&mut self, request_hash: &str, error_message: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE build_jobs SET status = 'failed', finished_at = ?1, error_message = ?2
             WHERE request_hash = ?3 AND status = 'building'",
            params![Utc::now().to_rfc3339(), error_message, request_hash],
        )?;
        Ok(())
    }

    /// Push a stale BUILDING job back to PENDING for re-dispatch.
    pub fn requeue(&mut self, request_hash: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE build_jobs SET status = 'pending', started_at = NULL, worker_id = NULL
             WHERE request_hash = ?1 AND status = 'building'",
            params![request_hash],
        )?;
        Ok(())
    }

    /// All BUILDING jobs. At startup, before any worker runs, every one
    /// of these is stale.
    pub fn stale_building(&self) -> Result<Vec<BuildJob>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{JOB_COLUMNS} WHERE status = 'building' ORDER BY id ASC"))?;
        let jobs = stmt
            .query_map(params![], job_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// Single-writer insert of a build result.
    pub fn put_result(&mut self, result: &BuildResult) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO build_results (
                    request_hash, images, manifest, build_at, cache_hit, build_duration_seconds
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    result.request_hash,
                    serde_json::to_string(&result.images)?,
                    result.manifest,
                    result.build_at.to_rfc3339(),
                    result.cache_hit,
                    result.build_duration_seconds,
                ],
            )
            .context("Failed to insert build result")?;
        Ok(())
    }

    /// Pure read of the cached result.
    pub fn get_result(&self, request_hash: &str) -> Result<Option<BuildResult>> {
        self.conn
            .query_row(
                "SELECT request_hash, images, manifest, build_at, cache_hit,
                        build_duration_seconds
                 FROM build_results WHERE request_hash = ?1",
                params![request_hash],
                result_from_row,
            )
            .optional()
            .context("Failed to query build result")
    }

    /// Drop the result and job history for a fingerprint. Blob deletion
    /// on disk is the caller's responsibility.
    pub fn expire(&mut self, request_hash: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM build_results WHERE request_hash = ?1",
            params![request_hash],
        )?;
        self.conn.execute(
            "DELETE FROM build_jobs WHERE request_hash = ?1",
            params![request_hash],
        )?;
        Ok(())
    }

    /// Expire results older than `build_ttl` and failed jobs older than
    /// `failure_ttl`. Returns the fingerprints whose artifact directories
    /// should be removed from disk.
    pub fn sweep_expired(&mut self, build_ttl: Duration, failure_ttl: Duration) -> Result<Vec<String>> {
        let now = Utc::now();
        let build_ttl = chrono::Duration::seconds(build_ttl.as_secs() as i64);
        let failure_ttl = chrono::Duration::seconds(failure_ttl.as_secs() as i64);

        let mut expired = Vec::new();
        {
            let mut stmt = self
                .conn
                .prepare("SELECT request_hash, build_at FROM build_results")?;
            let rows = stmt.query_map(params![], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (hash, build_at) = row?;
                if parse_timestamp(&build_at)? + build_ttl < now {
                    expired.push(hash);
                }
            }
        }
        for hash in &expired {
            self.expire(hash)?;
        }

        let mut failed = Vec::new();
        {
            let mut stmt = self.conn.prepare(
                "SELECT request_hash, finished_at FROM build_jobs
                 WHERE status = 'failed' AND finished_at IS NOT NULL",
            )?;
            let rows = stmt.query_map(params![], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (hash, finished_at) = row?;
                if parse_timestamp(&finished_at)? + failure_ttl < now {
                    failed.push(hash);
                }
            }
        }
        for hash in &failed {
            self.conn.execute(
                "DELETE FROM build_jobs WHERE request_hash = ?1",
                params![hash],
            )?;
        }

        expired.extend(failed);
        Ok(expired)
    }

    /// Increment an event counter.
    pub fn bump_counter(&mut self, name: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO counters (name, value) VALUES (?1, 1)
             ON CONFLICT(name) DO UPDATE SET value = value + 1",
            params![name],
        )?;
        Ok(())
    }

    /// All counters.
    pub fn counters(&self) -> Result<BTreeMap<String, i64>> {
        let mut stmt = self.conn.prepare("SELECT name, value FROM counters")?;
        let rows = stmt.query_map(params![], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counters = BTreeMap::new();
        for row in rows {
            let (name, value) = row?;
            counters.insert(name, value);
        }
        Ok(counters)
    }

    /// Advisory metadata cache read; expired entries read as absent.
    pub fn cache_get(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT value, expires_at FROM metadata_cache WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((value, expires_at)) if parse_timestamp(&expires_at)? > Utc::now() => {
                Ok(Some(value))
            }
            _ => Ok(None),
        }
    }

    /// Advisory metadata cache write with a time-to-live.
    pub fn cache_put(&mut self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let expires_at = Utc::now() + chrono::Duration::seconds(ttl.as_secs() as i64);
        self.conn.execute(
            "INSERT INTO metadata_cache (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, expires_at = ?3",
            params![key, value, expires_at.to_rfc3339()],
        )?;
        Ok(())
    }
}

const JOB_COLUMNS: &str = "SELECT id, request_hash, status, enqueued_at, started_at,
    finished_at, worker_id, queue_position, build_cmd, error_message FROM build_jobs";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<BuildJob> {
    let status: String = row.get(2)?;
    Ok(BuildJob {
        id: row.get(0)?,
        request_hash: row.get(1)?,
        status: JobStatus::from_str(&status).unwrap_or(JobStatus::Failed),
        enqueued_at: parse_ts_column(row, 3)?,
        started_at: parse_opt_ts_column(row, 4)?,
        finished_at: parse_opt_ts_column(row, 5)?,
        worker_id: row.get(6)?,
        queue_position: row.get::<_, i64>(7)? as usize,
        build_cmd: row.get(8)?,
        error_message: row.get(9)?,
    })
}

fn result_from_row(row: &Row<'_>) -> rusqlite::Result<BuildResult> {
    let images: String = row.get(1)?;
    Ok(BuildResult {
        request_hash: row.get(0)?,
        images: serde_json::from_str(&images).unwrap_or_default(),
        manifest: row.get(2)?,
        build_at: parse_ts_column(row, 3)?,
        cache_hit: row.get(4)?,
        build_duration_seconds: row.get(5)?,
    })
}

fn request_from_row(row: &Row<'_>) -> rusqlite::Result<BuildRequest> {
    let packages: String = row.get(5)?;
    let packages_versions: String = row.get(6)?;
    let repositories: String = row.get(9)?;
    let repository_keys: String = row.get(10)?;

    Ok(BuildRequest {
        request_hash: row.get(0)?,
        distro: row.get(1)?,
        version: row.get(2)?,
        target: row.get(3)?,
        profile: row.get(4)?,
        packages: serde_json::from_str(&packages).unwrap_or_default(),
        packages_versions: serde_json::from_str(&packages_versions).unwrap_or_default(),
        defaults: row.get(7)?,
        rootfs_size_mb: row.get(8)?,
        repositories: serde_json::from_str(&repositories).unwrap_or_default(),
        repository_keys: serde_json::from_str(&repository_keys).unwrap_or_default(),
        diff_packages: row.get(11)?,
        skip_package_resolution: row.get(12)?,
        client: row.get(13)?,
        created_at: parse_ts_column(row, 14)?,
    })
}

fn parse_ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(idx)?;
    parse_timestamp(&value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

fn parse_opt_ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let value: Option<String> = row.get(idx)?;
    match value {
        Some(v) => parse_ts_value(&v)
            .map(Some)
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
            }),
        None => Ok(None),
    }
}

fn parse_timestamp(value: &str) -> rusqlite::Result<DateTime<Utc>> {
    parse_ts_value(value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
    })
}

fn parse_ts_value(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value).map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap as Map;
    use wrtforge_common::{BuildRequest, RequestLimits};

    fn open_storage() -> (Storage, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(&dir.path().join("builder.db")).unwrap();
        (storage, dir)
    }

    fn request(profile: &str) -> BuildRequest {
        let mut req = BuildRequest {
            request_hash: String::new(),
            distro: "openwrt".to_string(),
            version: "23.05.0".to_string(),
            target: "ath79/generic".to_string(),
            profile: profile.to_string(),
            packages: vec!["luci".to_string()],
            packages_versions: Map::new(),
            defaults: None,
            rootfs_size_mb: None,
            repositories: Vec::new(),
            repository_keys: Vec::new(),
            diff_packages: false,
            client: None,
            created_at: Utc::now(),
            skip_package_resolution: false,
        };
        req.canonicalize(&RequestLimits::default()).unwrap();
        req
    }

    #[test]
    fn test_put_request_is_idempotent() {
        let (mut storage, _dir) = open_storage();
        let req = request("tplink_archer-c7-v5");

        storage.put_request(&req).unwrap();
        storage.put_request(&req).unwrap();

        let loaded = storage.get_request(&req.request_hash).unwrap().unwrap();
        assert_eq!(loaded.request_hash, req.request_hash);
        assert_eq!(loaded.packages, req.packages);
        assert_eq!(loaded.profile, req.profile);
    }

    #[test]
    fn test_enqueue_is_single_flight() {
        let (mut storage, _dir) = open_storage();
        let req = request("tplink_archer-c7-v5");
        storage.put_request(&req).unwrap();

        assert_eq!(
            storage.enqueue(&req.request_hash).unwrap(),
            EnqueueOutcome::Queued { position: 1 }
        );
        assert_eq!(
            storage.enqueue(&req.request_hash).unwrap(),
            EnqueueOutcome::AlreadyInFlight
        );
        assert_eq!(storage.queue_length().unwrap(), 1);
    }

    #[test]
    fn test_enqueue_respects_existing_result() {
        let (mut storage, _dir) = open_storage();
        let req = request("tplink_archer-c7-v5");

        storage
            .put_result(&BuildResult {
                request_hash: req.request_hash.clone(),
                images: vec!["image.bin".to_string()],
                manifest: "luci - 23.05-1".to_string(),
                build_at: Utc::now(),
                cache_hit: false,
                build_duration_seconds: 12,
            })
            .unwrap();

        assert_eq!(
            storage.enqueue(&req.request_hash).unwrap(),
            EnqueueOutcome::AlreadyBuilt
        );
    }

    #[test]
    fn test_claim_returns_oldest_and_never_twice() {
        let (mut storage, _dir) = open_storage();
        let first = request("profile-a");
        let second = request("profile-b");
        storage.put_request(&first).unwrap();
        storage.put_request(&second).unwrap();
        storage.enqueue(&first.request_hash).unwrap();
        storage.enqueue(&second.request_hash).unwrap();

        let claimed = storage.claim_pending("w1").unwrap().unwrap();
        assert_eq!(claimed.request_hash, first.request_hash);
        assert_eq!(claimed.status, JobStatus::Building);
        assert_eq!(claimed.worker_id.as_deref(), Some("w1"));
        assert!(claimed.started_at.is_some());

        let claimed = storage.claim_pending("w2").unwrap().unwrap();
        assert_eq!(claimed.request_hash, second.request_hash);

        assert!(storage.claim_pending("w3").unwrap().is_none());
    }

    #[test]
    fn test_queue_position_counts_earlier_pending() {
        let (mut storage, _dir) = open_storage();
        let jobs: Vec<_> = ["a", "b", "c"].into_iter().map(request).collect();
        for req in &jobs {
            storage.put_request(req).unwrap();
            storage.enqueue(&req.request_hash).unwrap();
        }

        assert_eq!(storage.queue_position(&jobs[0].request_hash).unwrap(), Some(1));
        assert_eq!(storage.queue_position(&jobs[2].request_hash).unwrap(), Some(3));

        // Claiming the head shifts everyone forward.
        storage.claim_pending("w1").unwrap().unwrap();
        assert_eq!(storage.queue_position(&jobs[2].request_hash).unwrap(), Some(2));
        assert_eq!(storage.queue_position(&jobs[0].request_hash).unwrap(), None);
    }

    #[test]
    fn test_terminal_transitions() {
        let (mut storage, _dir) = open_storage();
        let req = request("profile-a");
        storage.put_request(&req).unwrap();
        storage.enqueue(&req.request_hash).unwrap();
        storage.claim_pending("w1").unwrap().unwrap();

        storage
            .complete(&req.request_hash, "make image PROFILE=profile-a")
            .unwrap();

        let job = storage.get_job(&req.request_hash).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.finished_at.is_some());
        assert_eq!(
            job.build_cmd.as_deref(),
            Some("make image PROFILE=profile-a")
        );

        // A completed job cannot fail afterwards.
        storage.fail(&req.request_hash, "build: late").unwrap();
        let job = storage.get_job(&req.request_hash).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn test_fail_records_message() {
        let (mut storage, _dir) = open_storage();
        let req = request("profile-a");
        storage.put_request(&req).unwrap();
        storage.enqueue(&req.request_hash).unwrap();
        storage.claim_pending("w1").unwrap().unwrap();

        storage.fail(&req.request_hash, "build: timeout").unwrap();

        let job = storage.get_job(&req.request_hash).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("build: timeout"));
    }

    #[test]
    fn test_requeue_resets_claim_fields() {
        let (mut storage, _dir) = open_storage();
        let req = request("profile-a");
        storage.put_request(&req).unwrap();
        storage.enqueue(&req.request_hash).unwrap();
        storage.claim_pending("w1").unwrap().unwrap();

        assert_eq!(storage.stale_building().unwrap().len(), 1);
        storage.requeue(&req.request_hash).unwrap();

        let job = storage.get_job(&req.request_hash).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.started_at.is_none());
        assert!(job.worker_id.is_none());
        assert!(storage.stale_building().unwrap().is_empty());
    }

    #[test]
    fn test_result_round_trip() {
        let (mut storage, _dir) = open_storage();
        let result = BuildResult {
            request_hash: "deadbeef".to_string(),
            images: vec!["ath79/generic/firmware.bin".to_string()],
            manifest: "luci - 23.05-1\nbase-files - 1553".to_string(),
            build_at: Utc::now(),
            cache_hit: false,
            build_duration_seconds: 42,
        };

        storage.put_result(&result).unwrap();
        let loaded = storage.get_result("deadbeef").unwrap().unwrap();
        assert_eq!(loaded.images, result.images);
        assert_eq!(loaded.manifest, result.manifest);
        assert!(!loaded.cache_hit);
        assert_eq!(loaded.build_duration_seconds, 42);
    }

    #[test]
    fn test_sweep_expires_old_results_and_failures() {
        let (mut storage, _dir) = open_storage();

        storage
            .put_result(&BuildResult {
                request_hash: "old".to_string(),
                images: vec![],
                manifest: String::new(),
                build_at: Utc::now() - chrono::Duration::hours(48),
                cache_hit: false,
                build_duration_seconds: 1,
            })
            .unwrap();
        storage
            .put_result(&BuildResult {
                request_hash: "fresh".to_string(),
                images: vec![],
                manifest: String::new(),
                build_at: Utc::now(),
                cache_hit: false,
                build_duration_seconds: 1,
            })
            .unwrap();

        let expired = storage
            .sweep_expired(Duration::from_secs(86400), Duration::from_secs(3600))
            .unwrap();

        assert_eq!(expired, vec!["old".to_string()]);
        assert!(storage.get_result("old").unwrap().is_none());
        assert!(storage.get_result("fresh").unwrap().is_some());
    }

    #[test]
    fn test_expired_failure_allows_requeue() {
        let (mut storage, _dir) = open_storage();
        let req = request("profile-a");
        storage.put_request(&req).unwrap();
        storage.enqueue(&req.request_hash).unwrap();
        storage.claim_pending("w1").unwrap().unwrap();
        storage.fail(&req.request_hash, "build: boom").unwrap();

        // Within the TTL the failure blocks re-enqueueing on the API
        // side; after the sweep the fingerprint is buildable again.
        let expired = storage
            .sweep_expired(Duration::from_secs(86400), Duration::from_secs(0))
            .unwrap();
        assert_eq!(expired, vec![req.request_hash.clone()]);
        assert!(storage.get_job(&req.request_hash).unwrap().is_none());
        assert_eq!(
            storage.enqueue(&req.request_hash).unwrap(),
            EnqueueOutcome::Queued { position: 1 }
        );
    }

    #[test]
    fn test_counters_accumulate() {
        let (mut storage, _dir) = open_storage();
        storage.bump_counter("requests").unwrap();
        storage.bump_counter("requests").unwrap();
        storage.bump_counter("cache_hits").unwrap();

        let counters = storage.counters().unwrap();
        assert_eq!(counters.get("requests"), Some(&2));
        assert_eq!(counters.get("cache_hits"), Some(&1));
    }

    #[test]
    fn test_metadata_cache_honors_expiry() {
        let (mut storage, _dir) = open_storage();
        storage
            .cache_put("default-packages:23.05.0:ath79/generic:generic", "[\"luci\"]", Duration::from_secs(600))
            .unwrap();
        assert_eq!(
            storage
                .cache_get("default-packages:23.05.0:ath79/generic:generic")
                .unwrap()
                .as_deref(),
            Some("[\"luci\"]")
        );

        storage
            .cache_put("stale-key", "{}", Duration::from_secs(0))
            .unwrap();
        assert_eq!(storage.cache_get("stale-key").unwrap(), None);
    }
}
