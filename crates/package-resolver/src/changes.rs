//! Audit records for package list transformations.

use serde::{Deserialize, Serialize};

/// Why a change happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// A package was renamed between versions.
    Migration,
    /// A package was added for this version/target/profile.
    Addition,
    /// A package was removed from the selection.
    Removal,
    /// A package was pinned to an explicit version.
    Pin,
}

/// What happened to the package list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Replace,
    Add,
    Remove,
    Pin,
}

/// A single recorded change, ordered within the resolver's change log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageChange {
    #[serde(rename = "type")]
    pub kind: ChangeKind,

    pub action: ChangeAction,

    /// The affected package for additions, removals and pins.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,

    /// Source package of a migration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_package: Option<String>,

    /// Target package of a migration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_package: Option<String>,

    /// Pinned version, for pin changes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    pub reason: String,

    /// False for changes the user asked for themselves, e.g. `-name`
    /// removals.
    pub automatic: bool,
}

impl PackageChange {
    pub fn migration(from: impl Into<String>, to: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Migration,
            action: ChangeAction::Replace,
            package: None,
            from_package: Some(from.into()),
            to_package: Some(to.into()),
            version: None,
            reason: reason.into(),
            automatic: true,
        }
    }

    pub fn addition(package: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Addition,
            action: ChangeAction::Add,
            package: Some(package.into()),
            from_package: None,
            to_package: None,
            version: None,
            reason: reason.into(),
            automatic: true,
        }
    }

    pub fn removal(package: impl Into<String>, reason: impl Into<String>, automatic: bool) -> Self {
        Self {
            kind: ChangeKind::Removal,
            action: ChangeAction::Remove,
            package: Some(package.into()),
            from_package: None,
            to_package: None,
            version: None,
            reason: reason.into(),
            automatic,
        }
    }

    pub fn pin(package: impl Into<String>, version: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Pin,
            action: ChangeAction::Pin,
            package: Some(package.into()),
            from_package: None,
            to_package: None,
            version: Some(version.into()),
            reason: reason.into(),
            automatic: true,
        }
    }
}
