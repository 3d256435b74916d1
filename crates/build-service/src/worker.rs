//! Build workers: claim pending jobs and drive them through the
//! orchestrator.
//!
//! Workers are the only writers of BUILDING -> terminal transitions.
//! Each one owns its own storage connection and wakes on either the poll
//! tick or an admission notification.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::builder::{BuildError, BuildPhase, Builder};
use crate::config::Config;
use crate::models::{BuildJob, BuildResult};
use crate::storage::Storage;

/// A single build worker.
pub struct Worker {
    id: String,
    config: Arc<Config>,
    storage: Storage,
    builder: Builder,
    notify: Arc<Notify>,
}

impl Worker {
    pub fn new(id: String, config: Arc<Config>, storage: Storage, notify: Arc<Notify>) -> Self {
        let builder = Builder::new(config.clone());
        Self {
            id,
            config,
            storage,
            builder,
            notify,
        }
    }

    /// Run the claim loop forever. Claims drain back-to-back; once the
    /// queue is empty the worker sleeps until the next tick or wake-up.
    pub async fn run(mut self) {
        info!(
            "Worker {} started, polling every {}s",
            self.id, self.config.worker_poll_seconds
        );

        let mut tick = tokio::time::interval(self.config.worker_poll());

        loop {
            match self.storage.claim_pending(&self.id) {
                Ok(Some(job)) => {
                    self.process(job).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Worker {} failed to claim a job: {e:#}", self.id);
                }
            }

            tokio::select! {
                _ = tick.tick() => {}
                _ = self.notify.notified() => {}
            }
        }
    }

    /// Drive one claimed job to a terminal state.
    async fn process(&mut self, job: BuildJob) {
        info!("Worker {} processing {}", self.id, job.request_hash);

        let request = match self.storage.get_request(&job.request_hash) {
            Ok(Some(request)) => request,
            Ok(None) => {
                // Store inconsistency; the job is unbuildable.
                self.finish_failed(&job.request_hash, "resolve: request record missing");
                return;
            }
            Err(e) => {
                error!("Worker {} cannot load request: {e:#}", self.id);
                self.finish_failed(&job.request_hash, "resolve: request record unreadable");
                return;
            }
        };

        let started = Instant::now();
        let outcome = match tokio::time::timeout(
            self.config.job_timeout(),
            self.builder.build(&mut self.storage, &request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BuildError::new(
                BuildPhase::Build,
                format!("timeout after {} seconds", self.config.job_timeout_seconds),
            )),
        };

        match outcome {
            Ok(outcome) => {
                for change in &outcome.changes {
                    debug!("{}: applied change {:?}", job.request_hash, change);
                }

                let result = BuildResult {
                    request_hash: job.request_hash.clone(),
                    images: outcome.images,
                    manifest: outcome.manifest,
                    build_at: Utc::now(),
                    cache_hit: false,
                    build_duration_seconds: started.elapsed().as_secs() as i64,
                };

                if let Err(e) = self.storage.put_result(&result) {
                    error!("Worker {} failed to save result: {e:#}", self.id);
                    self.finish_failed(&job.request_hash, "discover: result write failed");
                    return;
                }
                if let Err(e) = self.storage.complete(&job.request_hash, &outcome.build_cmd) {
                    error!("Worker {} failed to complete job: {e:#}", self.id);
                }
                if let Err(e) = self.storage.bump_counter("builds_completed") {
                    warn!("Worker {} failed to bump counter: {e:#}", self.id);
                }

                info!(
                    "Build completed for {} in {}s ({} artifacts)",
                    job.request_hash,
                    result.build_duration_seconds,
                    result.images.len()
                );
            }
            Err(e) => {
                error!("Build failed for {}: {e}", job.request_hash);
                self.finish_failed(&job.request_hash, &e.to_string());
            }
        }
    }

    fn finish_failed(&mut self, request_hash: &str, message: &str) {
        if let Err(e) = self.storage.fail(request_hash, message) {
            error!("Worker {} failed to mark job failed: {e:#}", self.id);
        }
        if let Err(e) = self.storage.bump_counter("builds_failed") {
            warn!("Worker {} failed to bump counter: {e:#}", self.id);
        }
    }
}

/// Spawn the configured number of workers, each with its own storage
/// connection.
pub fn spawn_workers(config: Arc<Config>, notify: Arc<Notify>) -> Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::with_capacity(config.worker_concurrent);

    for index in 0..config.worker_concurrent {
        let storage = Storage::open(&config.database_path)?;
        let worker = Worker::new(
            format!("{}-{}", config.worker_id, index),
            config.clone(),
            storage,
            notify.clone(),
        );
        handles.push(tokio::spawn(worker.run()));
    }

    Ok(handles)
}
