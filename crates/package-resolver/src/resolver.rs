//! The resolution pipeline.
//!
//! Order of application is fixed: default reconciliation, then renames,
//! then hardware additions, then version pins. Pins go last so an
//! explicit user pin always wins over a rule.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::changes::PackageChange;
use crate::rules;

/// Everything the resolver needs to know about one request.
#[derive(Debug, Clone)]
pub struct ResolverInput<'a> {
    pub version: &'a str,
    /// Encoded as `target/subtarget`.
    pub target: &'a str,
    pub profile: &'a str,
    pub packages: &'a [String],
    pub packages_versions: &'a BTreeMap<String, String>,
    /// When true, `packages` is a delta over `default_packages` and
    /// `-name` entries remove defaults.
    pub diff_packages: bool,
}

/// The resolved package list plus the ordered audit log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub packages: Vec<String>,
    pub changes: Vec<PackageChange>,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ResolveError {
    #[error("package selection is empty after applying removals")]
    EmptySelection,
}

/// Resolve a package selection against the device's default package set.
///
/// Pure and idempotent: resolving the output again with the same default
/// set yields the same list and an empty change log.
pub fn resolve(
    input: &ResolverInput<'_>,
    default_packages: &BTreeSet<String>,
) -> Result<Resolution, ResolveError> {
    let mut changes = Vec::new();

    let mut requested = BTreeSet::new();
    let mut removals = BTreeSet::new();
    for package in input.packages {
        match package.strip_prefix('-') {
            Some(name) if input.diff_packages => {
                removals.insert(name.to_string());
            }
            _ => {
                requested.insert(package.clone());
            }
        }
    }

    // Default reconciliation: in diff mode the request is a delta on top
    // of the defaults; otherwise it already is the complete selection.
    let mut selected: BTreeSet<String> = if input.diff_packages {
        let mut merged: BTreeSet<String> = default_packages.clone();
        merged.extend(requested.iter().cloned());
        for name in &removals {
            // Removing a package that is in neither set is a no-op, but
            // it is still the user's call, so it stays in the log.
            merged.remove(name);
            changes.push(PackageChange::removal(name, "requested removal", false));
        }
        merged
    } else {
        requested
    };

    apply_renames(input, &mut selected, &mut changes);
    apply_additions(input, &mut selected, &mut changes);
    apply_pins(input, &mut selected, &mut changes);

    if selected.is_empty() && !input.packages.is_empty() {
        return Err(ResolveError::EmptySelection);
    }

    Ok(Resolution {
        packages: selected.into_iter().collect(),
        changes,
    })
}

fn apply_renames(
    input: &ResolverInput<'_>,
    selected: &mut BTreeSet<String>,
    changes: &mut Vec<PackageChange>,
) {
    for rename in rules::RENAMES {
        if !rules::version_matches(input.version, rename.versions) {
            continue;
        }
        if !selected.contains(rename.from) {
            continue;
        }
        // An explicit pin on the old name wins over the migration.
        if input.packages_versions.contains_key(rename.from) {
            continue;
        }

        selected.remove(rename.from);
        if selected.contains(rename.to) {
            changes.push(PackageChange::migration(
                rename.from,
                rename.to,
                "duplicate collapsed",
            ));
        } else {
            selected.insert(rename.to.to_string());
            changes.push(PackageChange::migration(
                rename.from,
                rename.to,
                format!("package renamed in {}", input.version),
            ));
        }
    }

    for rename in rules::LANGUAGE_PACK_RENAMES {
        if !rules::version_matches(input.version, rename.versions) {
            continue;
        }

        let matching: Vec<String> = selected
            .iter()
            .filter(|p| p.starts_with(rename.from_prefix))
            .cloned()
            .collect();

        for old in matching {
            if input.packages_versions.contains_key(&old) {
                continue;
            }
            let language = &old[rename.from_prefix.len()..];
            let new = format!("{}{}", rename.to_prefix, language);

            selected.remove(&old);
            if selected.contains(&new) {
                changes.push(PackageChange::migration(&old, &new, "duplicate collapsed"));
            } else {
                selected.insert(new.clone());
                changes.push(PackageChange::migration(
                    &old,
                    &new,
                    format!("language pack renamed in {}", input.version),
                ));
            }
        }
    }
}

fn apply_additions(
    input: &ResolverInput<'_>,
    selected: &mut BTreeSet<String>,
    changes: &mut Vec<PackageChange>,
) {
    for addition in rules::HARDWARE_ADDITIONS {
        if addition.target != input.target {
            continue;
        }
        if !rules::version_matches(input.version, addition.versions) {
            continue;
        }
        let profile_matches = addition.profiles.is_empty()
            || addition.profiles.iter().any(|p| *p == input.profile);
        if !profile_matches {
            continue;
        }

        for package in addition.packages {
            if selected.insert(package.to_string()) {
                changes.push(PackageChange::addition(
                    *package,
                    rules::addition_reason(package, input.target, input.profile),
                ));
            }
        }
    }
}

fn apply_pins(
    input: &ResolverInput<'_>,
    selected: &mut BTreeSet<String>,
    changes: &mut Vec<PackageChange>,
) {
    for (name, version) in input.packages_versions {
        // Pinning a package already in the selection changes nothing
        // here; the pinned version is verified against the manifest
        // after the build.
        if selected.insert(name.clone()) {
            changes.push(PackageChange::pin(
                name,
                version,
                format!("pinned to version {version}"),
            ));
        }
    }
}
