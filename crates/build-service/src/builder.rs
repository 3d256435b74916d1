//! Build orchestration: the per-job pipeline.
//!
//! One job runs through: image tag -> ensure image -> default-package
//! probe -> package resolution -> `make image` -> `make manifest` ->
//! artifact discovery. Every failure is tagged with the phase it happened
//! in, which becomes the job's error message.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::Config;
use crate::container::{imagebuilder_tag, ContainerError, ContainerRunner, Mount, RunOptions, RunOutput};
use crate::storage::Storage;
use package_resolver::{resolve, PackageChange, ResolverInput};
use wrtforge_common::BuildRequest;

/// How long a probed default-package set stays memoized. Advisory only.
const PROBE_CACHE_TTL: Duration = Duration::from_secs(6 * 3600);

/// Artifact extensions worth publishing.
const ARTIFACT_EXTENSIONS: [&str; 4] = ["bin", "img", "gz", "trx"];

/// Pipeline phase a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    Pull,
    InfoProbe,
    Resolve,
    Build,
    Manifest,
    Discover,
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuildPhase::Pull => "pull",
            BuildPhase::InfoProbe => "info-probe",
            BuildPhase::Resolve => "resolve",
            BuildPhase::Build => "build",
            BuildPhase::Manifest => "manifest",
            BuildPhase::Discover => "discover",
        };
        f.write_str(name)
    }
}

/// A phase-tagged build failure; its Display form is the job's
/// `error_message`.
#[derive(Error, Debug)]
#[error("{phase}: {message}")]
pub struct BuildError {
    pub phase: BuildPhase,
    pub message: String,
}

impl BuildError {
    pub fn new(phase: BuildPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
        }
    }
}

/// What a successful pipeline run produced.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    /// Artifact paths relative to the per-fingerprint directory
    pub images: Vec<String>,
    pub manifest: String,
    pub build_cmd: String,
    /// Resolver audit log, empty when resolution was skipped
    pub changes: Vec<PackageChange>,
}

/// The build orchestrator. Stateless apart from configuration; one
/// instance per worker.
pub struct Builder {
    config: Arc<Config>,
    runner: ContainerRunner,
}

impl Builder {
    pub fn new(config: Arc<Config>) -> Self {
        let runner = ContainerRunner::new(
            config.container_runtime.clone(),
            config.container_socket_path.clone(),
        );
        Self { config, runner }
    }

    /// Run the full pipeline for one canonicalized request.
    ///
    /// Writes only inside `store/<fingerprint>/`. The storage handle is
    /// used for the advisory probe cache, never for job transitions.
    pub async fn build(
        &self,
        storage: &mut Storage,
        req: &BuildRequest,
    ) -> Result<BuildOutcome, BuildError> {
        let tag = imagebuilder_tag(&self.config.imagebuilder_registry, &req.version, &req.target)
            .ok_or_else(|| {
                BuildError::new(BuildPhase::Pull, format!("invalid target {:?}", req.target))
            })?;

        self.ensure_image(&tag).await?;

        let default_packages = self.default_packages(storage, &tag, req).await?;

        let (packages, changes) = if req.skip_package_resolution {
            // Prepared requests carry an already-resolved list.
            (req.packages.clone(), Vec::new())
        } else {
            let resolution = resolve(
                &ResolverInput {
                    version: &req.version,
                    target: &req.target,
                    profile: &req.profile,
                    packages: &req.packages,
                    packages_versions: &req.packages_versions,
                    diff_packages: req.diff_packages,
                },
                &default_packages,
            )
            .map_err(|e| BuildError::new(BuildPhase::Resolve, e.to_string()))?;
            (resolution.packages, resolution.changes)
        };

        let artifact_dir = self.config.store_path.join(&req.request_hash);
        std::fs::create_dir_all(&artifact_dir).map_err(|e| {
            BuildError::new(BuildPhase::Build, format!("cannot create artifact dir: {e}"))
        })?;

        let (output, build_cmd) = self.run_image_build(&tag, &artifact_dir, req, &packages).await?;

        if output.output.contains("is too big") {
            return Err(BuildError::new(
                BuildPhase::Build,
                "selected packages exceed device storage",
            ));
        }
        if !output.success() {
            return Err(BuildError::new(
                BuildPhase::Build,
                format!("exit code {}: {}", output.exit_code, tail(&output.output, 1000)),
            ));
        }

        let manifest = self.run_manifest(&tag, req).await?;
        verify_pins(&parse_manifest(&manifest), &req.packages_versions)
            .map_err(|message| BuildError::new(BuildPhase::Manifest, message))?;

        let images = discover_artifacts(&artifact_dir)
            .map_err(|e| BuildError::new(BuildPhase::Discover, e.to_string()))?;
        if images.is_empty() {
            return Err(BuildError::new(BuildPhase::Discover, "no artifacts produced"));
        }

        info!(
            "Built {} for {}/{}: {} artifact(s)",
            req.request_hash,
            req.target,
            req.profile,
            images.len()
        );

        Ok(BuildOutcome {
            images,
            manifest,
            build_cmd,
            changes,
        })
    }

    /// Make sure the ImageBuilder image is available locally. Pull
    /// failures are treated as transient and retried once.
    async fn ensure_image(&self, tag: &str) -> Result<(), BuildError> {
        match self.runner.pull(tag).await {
            Ok(()) => Ok(()),
            Err(first) => {
                debug!("Pull of {} failed ({}), retrying once", tag, first);
                self.runner
                    .pull(tag)
                    .await
                    .map_err(|e| BuildError::new(BuildPhase::Pull, e.to_string()))
            }
        }
    }

    /// Probe the default package set via `make info`, memoized in the
    /// metadata cache per (version, target, profile).
    async fn default_packages(
        &self,
        storage: &mut Storage,
        tag: &str,
        req: &BuildRequest,
    ) -> Result<BTreeSet<String>, BuildError> {
        let cache_key = format!(
            "default-packages:{}:{}:{}",
            req.version, req.target, req.profile
        );

        if let Ok(Some(cached)) = storage.cache_get(&cache_key) {
            if let Ok(packages) = serde_json::from_str::<Vec<String>>(&cached) {
                return Ok(packages.into_iter().collect());
            }
        }

        let opts = RunOptions {
            image: tag.to_string(),
            command: vec!["make".to_string(), "info".to_string()],
            ..RunOptions::default()
        };
        let output = self.run_container(&opts, BuildPhase::InfoProbe).await?;
        if !output.success() {
            return Err(BuildError::new(
                BuildPhase::InfoProbe,
                format!("make info exit code {}", output.exit_code),
            ));
        }

        let packages = parse_default_packages(&output.output);

        let as_json = serde_json::to_string(&packages.iter().collect::<Vec<_>>())
            .unwrap_or_else(|_| "[]".to_string());
        // Cache failures only cost us a re-probe next time.
        if let Err(e) = storage.cache_put(&cache_key, &as_json, PROBE_CACHE_TTL) {
            debug!("Failed to memoize default packages: {e}");
        }

        Ok(packages)
    }

    async fn run_image_build(
        &self,
        tag: &str,
        artifact_dir: &Path,
        req: &BuildRequest,
        packages: &[String],
    ) -> Result<(RunOutput, String), BuildError> {
        let mut command = vec![
            "make".to_string(),
            "image".to_string(),
            format!("PROFILE={}", req.profile),
        ];
        if !packages.is_empty() {
            command.push(format!("PACKAGES={}", packages.join(" ")));
        }
        if let Some(size) = req.rootfs_size_mb {
            command.push(format!("ROOTFS_PARTSIZE={size}"));
        }
        let build_cmd = command.join(" ");

        let mut mounts = vec![Mount {
            source: artifact_dir.to_path_buf(),
            target: "/builder/bin".to_string(),
            read_only: false,
        }];

        if let Some(defaults) = &req.defaults {
            if self.config.allow_defaults {
                let files_dir = artifact_dir.join("files");
                write_defaults_script(&files_dir, defaults).map_err(|e| {
                    BuildError::new(BuildPhase::Build, format!("cannot write defaults: {e}"))
                })?;
                mounts.push(Mount {
                    source: files_dir,
                    target: "/builder/files".to_string(),
                    read_only: true,
                });
            }
        }

        let opts = RunOptions {
            image: tag.to_string(),
            command,
            mounts,
            ..RunOptions::default()
        };

        debug!("Running {}", build_cmd);
        let output = self.run_container(&opts, BuildPhase::Build).await?;
        Ok((output, build_cmd))
    }

    async fn run_manifest(&self, tag: &str, req: &BuildRequest) -> Result<String, BuildError> {
        let opts = RunOptions {
            image: tag.to_string(),
            command: vec![
                "make".to_string(),
                "manifest".to_string(),
                format!("PROFILE={}", req.profile),
            ],
            ..RunOptions::default()
        };

        let output = self.run_container(&opts, BuildPhase::Manifest).await?;
        if !output.success() {
            return Err(BuildError::new(
                BuildPhase::Manifest,
                format!("exit code {}: {}", output.exit_code, tail(&output.output, 500)),
            ));
        }
        if output.output.trim().is_empty() {
            return Err(BuildError::new(BuildPhase::Manifest, "empty manifest"));
        }
        Ok(output.output)
    }

    /// Run a container, retrying once when the runtime itself is
    /// unreachable. A second infrastructure failure fails the phase.
    async fn run_container(
        &self,
        opts: &RunOptions,
        phase: BuildPhase,
    ) -> Result<RunOutput, BuildError> {
        let timeout = self.config.job_timeout();
        match self.runner.run(opts, timeout).await {
            Ok(output) => Ok(output),
            Err(ContainerError::Runtime(first)) => {
                debug!("Container runtime error ({first}), retrying once");
                self.runner
                    .run(opts, timeout)
                    .await
                    .map_err(|e| BuildError::new(phase, e.to_string()))
            }
            Err(e) => Err(BuildError::new(phase, e.to_string())),
        }
    }
}

/// Install the first-boot script as `etc/uci-defaults/99-custom`
/// (mode 0755) under the given `files/` tree.
fn write_defaults_script(files_dir: &Path, defaults: &str) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let script = files_dir.join("etc/uci-defaults/99-custom");
    if let Some(parent) = script.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&script, defaults)?;
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))?;
    Ok(())
}

/// Extract the `Default Packages:` line from `make info` output. An
/// absent line means an empty default set.
fn parse_default_packages(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .find_map(|line| line.strip_prefix("Default Packages:"))
        .map(|rest| rest.split_whitespace().map(|s| s.to_string()).collect())
        .unwrap_or_default()
}

/// Parse manifest text of `name - version` lines into a map.
fn parse_manifest(manifest: &str) -> BTreeMap<String, String> {
    manifest
        .lines()
        .filter_map(|line| line.split_once(" - "))
        .map(|(name, version)| (name.trim().to_string(), version.trim().to_string()))
        .collect()
}

/// Check requested version pins against the built manifest.
fn verify_pins(
    manifest: &BTreeMap<String, String>,
    pins: &BTreeMap<String, String>,
) -> Result<(), String> {
    for (name, version) in pins {
        match manifest.get(name) {
            None => return Err(format!("{name} not in manifest")),
            Some(built) if built != version => {
                return Err(format!(
                    "{name} version not as requested: {version} vs. {built}"
                ));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Walk the artifact directory and keep firmware files, as paths
/// relative to it.
fn discover_artifacts(dir: &Path) -> Result<Vec<String>, walkdir::Error> {
    let mut images = Vec::new();

    for entry in WalkDir::new(dir) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let matches = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| ARTIFACT_EXTENSIONS.contains(&e))
            .unwrap_or(false);
        if !matches {
            continue;
        }

        if let Ok(relative) = entry.path().strip_prefix(dir) {
            images.push(relative.to_string_lossy().into_owned());
        }
    }

    images.sort();
    Ok(images)
}

/// Last `max` bytes of `output`, aligned to a char boundary.
fn tail(output: &str, max: usize) -> &str {
    if output.len() <= max {
        return output;
    }
    let mut start = output.len() - max;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    &output[start..]
}
