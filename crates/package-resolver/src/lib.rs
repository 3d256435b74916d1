//! Package Resolver
//!
//! Deterministically transforms a user-supplied package list into the
//! final list handed to the ImageBuilder. Applies version migrations,
//! hardware-specific additions and default-package reconciliation, and
//! reports every transformation as an auditable [`PackageChange`].
//!
//! The resolver is pure: identical inputs yield identical outputs, and it
//! never touches the filesystem or the network. Applying it to its own
//! output produces no further changes.

pub mod changes;
pub mod resolver;
pub mod rules;

pub use changes::{ChangeAction, ChangeKind, PackageChange};
pub use resolver::{resolve, Resolution, ResolveError, ResolverInput};
