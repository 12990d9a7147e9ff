//! On-disk format versioning
//!
//! Every collection records a `format-version` attribute with the string
//! value `MAJOR.MINOR.INCREMENTAL`. On open the engine compares it against
//! its compiled-in version: equal proceeds, lower runs the registered
//! migrators in version order, higher major refuses the open.
//!
//! Migrators operate copy-and-swap: a migration that fails leaves the
//! on-disk state exactly as the prior engine version wrote it.

use crate::storage::collection::{Collection, VERSION_KEY};
use crate::{Error, Result};
use std::cmp::Ordering;
use std::sync::Arc;

/// Version the engine writes and expects
pub const CURRENT_VERSION: FormatVersion = FormatVersion {
    major: 1,
    minor: 0,
    incremental: 0,
};

/// Parsed `MAJOR.MINOR.INCREMENTAL` version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatVersion {
    pub major: u32,
    pub minor: u32,
    pub incremental: u32,
}

impl FormatVersion {
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.trim().split('.');
        let mut next = |name: &str| -> Result<u32> {
            parts
                .next()
                .ok_or_else(|| Error::Internal(format!("version string missing {}", name)))?
                .parse::<u32>()
                .map_err(|_| Error::Internal(format!("bad version component {}", name)))
        };
        let version = FormatVersion {
            major: next("major")?,
            minor: next("minor")?,
            incremental: next("incremental")?,
        };
        if parts.next().is_some() {
            return Err(Error::Internal("version string has extra components".into()));
        }
        Ok(version)
    }

    /// Incrementals are compatible; minors and majors are not
    pub fn compatible_with(&self, other: &FormatVersion) -> bool {
        self.major == other.major && self.minor == other.minor
    }
}

impl PartialOrd for FormatVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FormatVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.incremental).cmp(&(
            other.major,
            other.minor,
            other.incremental,
        ))
    }
}

impl std::fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.incremental)
    }
}

/// One migration step: brings a collection at exactly `from` up to `to`
pub struct Migrator {
    pub from: FormatVersion,
    pub to: FormatVersion,
    /// Performs the migration; must leave the collection readable at
    /// `from` when it fails
    pub migrate: fn(&Collection) -> Result<()>,
}

/// Migrators in ascending `from` order; extended as formats evolve
fn migrators() -> Vec<Migrator> {
    Vec::new()
}

/// Read a collection's stored format version
pub fn read_version(coll: &Collection) -> Result<FormatVersion> {
    let bytes = coll.get_attr(VERSION_KEY).map_err(|e| match e {
        Error::NotFound => Error::Internal("collection has no format-version record".into()),
        other => other,
    })?;
    let text = String::from_utf8(bytes)
        .map_err(|_| Error::Internal("format-version record is not utf-8".into()))?;
    FormatVersion::parse(&text)
}

/// Stamp a collection with the current version
pub fn write_current_version(coll: &Collection) -> Result<()> {
    coll.put_attr(VERSION_KEY, CURRENT_VERSION.to_string().as_bytes())
}

/// Version check run at collection open
///
/// Migrates older collections forward one registered step at a time,
/// rewriting the version string after each successful step. An on-disk
/// major version above the engine's is refused.
pub fn check_and_migrate(coll: &Arc<Collection>) -> Result<()> {
    let mut on_disk = read_version(coll)?;

    if on_disk.major > CURRENT_VERSION.major {
        return Err(Error::Internal(format!(
            "on-disk format {} is newer than engine format {}",
            on_disk, CURRENT_VERSION
        )));
    }
    if on_disk == CURRENT_VERSION {
        return Ok(());
    }

    for migrator in migrators() {
        if on_disk == CURRENT_VERSION {
            break;
        }
        if migrator.from != on_disk {
            continue;
        }
        tracing::warn!(
            collection = coll.id(),
            from = %migrator.from,
            to = %migrator.to,
            "migrating collection format"
        );
        (migrator.migrate)(coll)?;
        coll.put_attr(VERSION_KEY, migrator.to.to_string().as_bytes())?;
        on_disk = migrator.to;
    }

    if on_disk != CURRENT_VERSION {
        return Err(Error::Internal(format!(
            "no migration path from on-disk format {} to {}",
            on_disk, CURRENT_VERSION
        )));
    }
    Ok(())
}
