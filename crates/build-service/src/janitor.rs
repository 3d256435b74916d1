//! Housekeeping: crash recovery at startup and TTL expiry over time.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::storage::Storage;

/// How often the TTL sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Recover jobs left in BUILDING by a previous process.
///
/// Builds run in ephemeral containers, so a crash leaves at most a stale
/// marker. A job whose artifact directory is still empty is safe to run
/// again; one with a partial artifact tree is failed instead.
pub fn recover_stale_jobs(storage: &mut Storage, store_path: &Path) -> Result<()> {
    let stale = storage.stale_building()?;
    if stale.is_empty() {
        return Ok(());
    }

    let mut requeued = 0;
    let mut failed = 0;

    for job in stale {
        let artifact_dir = store_path.join(&job.request_hash);
        let has_artifacts = artifact_dir
            .read_dir()
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);

        if has_artifacts {
            storage.fail(&job.request_hash, "build: interrupted by service restart")?;
            failed += 1;
        } else {
            storage.requeue(&job.request_hash)?;
            requeued += 1;
        }
    }

    info!("Recovered stale jobs: {requeued} requeued, {failed} failed");
    Ok(())
}

/// Periodic TTL sweep: expired results and failed jobs are dropped from
/// the store and their artifact directories deleted.
pub async fn run(mut storage: Storage, config: Arc<Config>) {
    let mut tick = tokio::time::interval(SWEEP_INTERVAL);
    // The first tick fires immediately; skip it so startup recovery and
    // the first sweep don't race.
    tick.tick().await;

    loop {
        tick.tick().await;
        match sweep(&mut storage, &config) {
            Ok(0) => {}
            Ok(count) => info!("Janitor expired {count} build(s)"),
            Err(e) => error!("Janitor sweep failed: {e:#}"),
        }
    }
}

fn sweep(storage: &mut Storage, config: &Config) -> Result<usize> {
    let expired = storage.sweep_expired(
        Duration::from_secs(config.build_ttl_seconds),
        Duration::from_secs(config.failure_ttl_seconds),
    )?;

    for hash in &expired {
        let artifact_dir = config.store_path.join(hash);
        if artifact_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&artifact_dir) {
                warn!("Failed to remove {}: {e}", artifact_dir.display());
            }
        }
    }

    Ok(expired.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobStatus;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use wrtforge_common::{BuildRequest, RequestLimits};

    fn request(profile: &str) -> BuildRequest {
        let mut req = BuildRequest {
            request_hash: String::new(),
            distro: "openwrt".to_string(),
            version: "23.05.0".to_string(),
            target: "ath79/generic".to_string(),
            profile: profile.to_string(),
            packages: vec!["luci".to_string()],
            packages_versions: BTreeMap::new(),
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

    fn claimed_job(storage: &mut Storage, profile: &str) -> String {
        let req = request(profile);
        storage.put_request(&req).unwrap();
        storage.enqueue(&req.request_hash).unwrap();
        storage.claim_pending("w1").unwrap().unwrap();
        req.request_hash
    }

    #[test]
    fn test_recovery_requeues_empty_artifact_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("store");
        std::fs::create_dir_all(&store).unwrap();
        let mut storage = Storage::open(&dir.path().join("builder.db")).unwrap();

        let hash = claimed_job(&mut storage, "profile-a");

        recover_stale_jobs(&mut storage, &store).unwrap();

        let job = storage.get_job(&hash).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn test_recovery_fails_partial_artifact_trees() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("store");
        let mut storage = Storage::open(&dir.path().join("builder.db")).unwrap();

        let hash = claimed_job(&mut storage, "profile-b");

        let artifact_dir = store.join(&hash);
        std::fs::create_dir_all(&artifact_dir).unwrap();
        std::fs::write(artifact_dir.join("partial.bin"), b"half an image").unwrap();

        recover_stale_jobs(&mut storage, &store).unwrap();

        let job = storage.get_job(&hash).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().starts_with("build:"));
    }
}
