//! Build request model, canonicalization and fingerprinting.
//!
//! A request is canonicalized exactly once, at the API boundary. After
//! that it is immutable: the fingerprint derived here is the primary key
//! for deduplication, cache lookup and job identity across the system.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// The only distribution currently served.
pub const DEFAULT_DISTRO: &str = "openwrt";

/// Validation caps applied during canonicalization.
#[derive(Debug, Clone)]
pub struct RequestLimits {
    /// Maximum length of the first-boot `defaults` script in bytes.
    pub max_defaults_length: usize,

    /// Maximum custom rootfs size in megabytes.
    pub max_rootfs_size_mb: u32,

    /// Whether first-boot scripts are honored at all.
    pub allow_defaults: bool,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_defaults_length: 20480,
            max_rootfs_size_mb: 1024,
            allow_defaults: true,
        }
    }
}

/// A firmware build request.
///
/// `packages` is an unordered set of names; with `diff_packages` set it is
/// instead a delta over the device defaults, where a `-name` entry removes
/// a default package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Derived fingerprint, filled in by [`BuildRequest::canonicalize`].
    /// Never trusted from the wire.
    #[serde(default)]
    pub request_hash: String,

    #[serde(default = "default_distro")]
    pub distro: String,

    pub version: String,

    /// Hardware family and variant, encoded as `target/subtarget`.
    pub target: String,

    pub profile: String,

    #[serde(default)]
    pub packages: Vec<String>,

    /// Package name to version pins. Checked against the manifest after a
    /// successful build.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub packages_versions: BTreeMap<String, String>,

    /// Optional first-boot script installed as a uci-defaults file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootfs_size_mb: Option<u32>,

    /// Extra package repositories, in precedence order, paired
    /// positionally with `repository_keys`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repositories: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repository_keys: Vec<String>,

    /// When true, `packages` is a delta against the device defaults.
    #[serde(default)]
    pub diff_packages: bool,

    /// Opaque client identifier, e.g. `auc/0.3.2`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    /// Set by the prepare flow: the packages are already resolved, the
    /// orchestrator must use them verbatim. Not part of the fingerprint.
    #[serde(default)]
    pub skip_package_resolution: bool,
}

fn default_distro() -> String {
    DEFAULT_DISTRO.to_string()
}

impl BuildRequest {
    /// Validate and normalize the request in place, then derive the
    /// fingerprint.
    ///
    /// Normalization sorts and deduplicates `packages`, trims trailing
    /// whitespace from `defaults` (dropping it entirely if nothing
    /// remains) and leaves repository order untouched, since repository
    /// precedence is semantically meaningful.
    pub fn canonicalize(&mut self, limits: &RequestLimits) -> Result<()> {
        self.validate(limits)?;

        self.packages.sort();
        self.packages.dedup();

        if let Some(defaults) = &self.defaults {
            let trimmed = defaults.trim_end();
            if trimmed.is_empty() {
                self.defaults = None;
            } else if trimmed.len() != defaults.len() {
                self.defaults = Some(trimmed.to_string());
            }
        }

        self.request_hash = self.compute_hash();
        Ok(())
    }

    fn validate(&self, limits: &RequestLimits) -> Result<()> {
        if !is_safe_token(&self.distro) {
            return Err(Error::validation("distro", "not a valid token"));
        }

        if !is_valid_version(&self.version) {
            return Err(Error::validation(
                "version",
                format!("{:?} is neither a release version nor SNAPSHOT", self.version),
            ));
        }

        let mut parts = self.target.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(target), Some(subtarget), None)
                if is_safe_token(target) && is_safe_token(subtarget) => {}
            _ => {
                return Err(Error::validation(
                    "target",
                    format!("{:?} is not of the form target/subtarget", self.target),
                ));
            }
        }

        if !is_safe_token(&self.profile) {
            return Err(Error::validation(
                "profile",
                format!("{:?} is not a valid profile name", self.profile),
            ));
        }

        for package in &self.packages {
            // A leading `-` marks an explicit removal in diff mode.
            let name = package.strip_prefix('-').unwrap_or(package);
            if !is_safe_token(name) {
                return Err(Error::validation(
                    "packages",
                    format!("{package:?} is not a valid package name"),
                ));
            }
        }

        for name in self.packages_versions.keys() {
            if !is_safe_token(name) {
                return Err(Error::validation(
                    "packages_versions",
                    format!("{name:?} is not a valid package name"),
                ));
            }
        }

        if let Some(defaults) = &self.defaults {
            if !defaults.trim_end().is_empty() {
                if !limits.allow_defaults {
                    return Err(Error::validation(
                        "defaults",
                        "custom defaults are not enabled on this server",
                    ));
                }
                if defaults.len() > limits.max_defaults_length {
                    return Err(Error::validation(
                        "defaults",
                        format!(
                            "script exceeds maximum length of {} bytes",
                            limits.max_defaults_length
                        ),
                    ));
                }
            }
        }

        if let Some(size) = self.rootfs_size_mb {
            if size == 0 || size > limits.max_rootfs_size_mb {
                return Err(Error::validation(
                    "rootfs_size_mb",
                    format!("must be between 1 and {}", limits.max_rootfs_size_mb),
                ));
            }
        }

        if self.repository_keys.len() != self.repositories.len() {
            return Err(Error::validation(
                "repository_keys",
                format!(
                    "{} keys for {} repositories",
                    self.repository_keys.len(),
                    self.repositories.len()
                ),
            ));
        }

        Ok(())
    }

    /// Compute the request fingerprint: a hex SHA-256 over a stable,
    /// append-only rendering of the identity fields.
    ///
    /// Optional fields contribute nothing when absent, so fingerprints of
    /// minimal requests stay stable as the request format grows.
    pub fn compute_hash(&self) -> String {
        let mut packages = self.packages.clone();
        packages.sort();
        packages.dedup();

        let mut input = format!(
            "{}:{}:{}:{}:{}:{}:{}",
            self.distro,
            self.version,
            self.target,
            self.profile,
            packages.join(","),
            self.diff_packages,
            self.rootfs_size_mb.unwrap_or(0),
        );

        for (name, version) in &self.packages_versions {
            input.push(':');
            input.push_str(name);
            input.push('=');
            input.push_str(version);
        }

        for url in &self.repositories {
            input.push(':');
            input.push_str(url);
        }

        if let Some(defaults) = &self.defaults {
            let trimmed = defaults.trim_end();
            if !trimmed.is_empty() {
                input.push(':');
                input.push_str(trimmed);
            }
        }

        let mut hasher = Sha256::new();
        hasher.update(input.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// The `target` half of `target/subtarget`.
    pub fn target_name(&self) -> &str {
        self.target.split('/').next().unwrap_or(&self.target)
    }

    /// The `subtarget` half of `target/subtarget`.
    pub fn subtarget_name(&self) -> &str {
        self.target.split('/').nth(1).unwrap_or("")
    }
}

/// Conservative token check for profile and package names: alphanumerics
/// plus `_`, `-`, `.` and `+`.
fn is_safe_token(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '+'))
}

/// Versions are either `SNAPSHOT` or a dotted release like `23.05.2`,
/// optionally with a `-rc1` style suffix.
fn is_valid_version(s: &str) -> bool {
    if s == "SNAPSHOT" {
        return true;
    }
    s.starts_with(|c: char| c.is_ascii_digit())
        && s.contains('.')
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(packages: &[&str]) -> BuildRequest {
        BuildRequest {
            request_hash: String::new(),
            distro: DEFAULT_DISTRO.to_string(),
            version: "23.05.0".to_string(),
            target: "ath79/generic".to_string(),
            profile: "tplink_archer-c7-v5".to_string(),
            packages: packages.iter().map(|p| p.to_string()).collect(),
            packages_versions: BTreeMap::new(),
            defaults: None,
            rootfs_size_mb: None,
            repositories: Vec::new(),
            repository_keys: Vec::new(),
            diff_packages: false,
            client: None,
            created_at: Utc::now(),
            skip_package_resolution: false,
        }
    }

    #[test]
    fn test_equivalent_requests_share_fingerprint() {
        let mut a = request(&["vim", "luci", "tmux"]);
        let mut b = request(&["tmux", "luci", "vim", "luci"]);

        a.canonicalize(&RequestLimits::default()).unwrap();
        b.canonicalize(&RequestLimits::default()).unwrap();

        assert_eq!(a.request_hash, b.request_hash);
        assert_eq!(a.packages, vec!["luci", "tmux", "vim"]);
    }

    #[test]
    fn test_canonicalization_is_idempotent() {
        let mut req = request(&["luci", "vim"]);
        req.defaults = Some("uci set system.@system[0].hostname='r1'\n\n".to_string());

        req.canonicalize(&RequestLimits::default()).unwrap();
        let first = req.request_hash.clone();

        req.canonicalize(&RequestLimits::default()).unwrap();
        assert_eq!(req.request_hash, first);
    }

    #[test]
    fn test_fingerprint_sorts_packages_itself() {
        let req = request(&["tmux", "luci"]);
        // compute_hash sorts internally, canonicalized or not.
        assert_eq!(req.compute_hash(), request(&["luci", "tmux"]).compute_hash());
        assert_eq!(req.compute_hash().len(), 64);
    }

    #[test]
    fn test_optional_fields_extend_the_rendering() {
        let minimal = request(&["luci"]);
        let mut pinned = request(&["luci"]);
        pinned
            .packages_versions
            .insert("luci".to_string(), "23.05-1".to_string());

        assert_ne!(minimal.compute_hash(), pinned.compute_hash());

        let mut with_repo = request(&["luci"]);
        with_repo.repositories.push("https://repo.example.org".to_string());
        with_repo.repository_keys.push("RWR...".to_string());
        assert_ne!(minimal.compute_hash(), with_repo.compute_hash());
    }

    #[test]
    fn test_repository_order_is_significant() {
        let mut a = request(&[]);
        a.repositories = vec!["https://one".to_string(), "https://two".to_string()];
        a.repository_keys = vec!["k1".to_string(), "k2".to_string()];

        let mut b = request(&[]);
        b.repositories = vec!["https://two".to_string(), "https://one".to_string()];
        b.repository_keys = vec!["k2".to_string(), "k1".to_string()];

        assert_ne!(a.compute_hash(), b.compute_hash());
    }

    #[test]
    fn test_rejects_malformed_target() {
        let mut req = request(&[]);
        req.target = "ath79".to_string();
        let err = req.canonicalize(&RequestLimits::default()).unwrap_err();
        assert!(err.to_string().contains("target"));

        let mut req = request(&[]);
        req.target = "ath79/generic/extra".to_string();
        assert!(req.canonicalize(&RequestLimits::default()).is_err());
    }

    #[test]
    fn test_rejects_unsafe_package_name() {
        let mut req = request(&["luci", "bad name"]);
        let err = req.canonicalize(&RequestLimits::default()).unwrap_err();
        assert!(err.to_string().contains("packages"));
    }

    #[test]
    fn test_accepts_removal_prefix() {
        let mut req = request(&["-ppp", "luci"]);
        req.diff_packages = true;
        req.canonicalize(&RequestLimits::default()).unwrap();
    }

    #[test]
    fn test_rejects_snapshot_lookalikes() {
        let mut req = request(&[]);
        req.version = "snapshot".to_string();
        assert!(req.canonicalize(&RequestLimits::default()).is_err());

        let mut req = request(&[]);
        req.version = "SNAPSHOT".to_string();
        req.canonicalize(&RequestLimits::default()).unwrap();
    }

    #[test]
    fn test_rejects_mismatched_repository_keys() {
        let mut req = request(&[]);
        req.repositories = vec!["https://repo".to_string()];
        let err = req.canonicalize(&RequestLimits::default()).unwrap_err();
        assert!(err.to_string().contains("repository_keys"));
    }

    #[test]
    fn test_defaults_length_cap() {
        let mut req = request(&[]);
        req.defaults = Some("x".repeat(30));

        let limits = RequestLimits {
            max_defaults_length: 16,
            ..RequestLimits::default()
        };
        assert!(req.canonicalize(&limits).is_err());
    }

    #[test]
    fn test_defaults_rejected_when_disabled() {
        let mut req = request(&[]);
        req.defaults = Some("echo hello".to_string());

        let limits = RequestLimits {
            allow_defaults: false,
            ..RequestLimits::default()
        };
        let err = req.canonicalize(&limits).unwrap_err();
        assert!(err.to_string().contains("defaults"));
    }

    #[test]
    fn test_whitespace_only_defaults_are_dropped() {
        let mut with_blank = request(&["luci"]);
        with_blank.defaults = Some("   \n".to_string());
        with_blank.canonicalize(&RequestLimits::default()).unwrap();
        assert!(with_blank.defaults.is_none());

        let mut without = request(&["luci"]);
        without.canonicalize(&RequestLimits::default()).unwrap();
        assert_eq!(with_blank.request_hash, without.request_hash);
    }

    #[test]
    fn test_rootfs_size_cap() {
        let mut req = request(&[]);
        req.rootfs_size_mb = Some(4096);
        let err = req.canonicalize(&RequestLimits::default()).unwrap_err();
        assert!(err.to_string().contains("rootfs_size_mb"));
    }

    #[test]
    fn test_target_accessors() {
        let req = request(&[]);
        assert_eq!(req.target_name(), "ath79");
        assert_eq!(req.subtarget_name(), "generic");
    }
}
