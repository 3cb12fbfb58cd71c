//! Index format versioning.
//!
//! Every index directory records the library version that wrote it in
//! `metadata.json`. Loaders branch on that version, never on byte
//! sniffing, to pick the right on-disk parser for older layouts.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// The version written into newly created indexes.
pub const VERSION_STRING: &str = env!("CARGO_PKG_VERSION");

/// A semantic version triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub revision: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, revision: u32) -> Self {
        Version {
            major,
            minor,
            revision,
        }
    }

    /// Version of the running library.
    pub fn current() -> Self {
        // CARGO_PKG_VERSION is always a valid semver triple.
        VERSION_STRING.parse().unwrap_or(Version::new(0, 0, 0))
    }

    /// Indexes written before 0.3.0 carry no per-document metadata table.
    pub fn metadata_enabled(self) -> bool {
        self >= Version::new(0, 3, 0)
    }

    /// Indexes written before 0.5.0 use the headerless coarse-quantizer
    /// layout (format 1). See the migration table in DESIGN.md.
    pub fn legacy_coarse_format(self) -> bool {
        self < Version::new(0, 5, 0)
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('.');
        let mut next = || -> Result<u32> {
            parts
                .next()
                .ok_or_else(|| Error::corrupt(format!("malformed version string: {s:?}")))?
                .parse()
                .map_err(|_| Error::corrupt(format!("malformed version string: {s:?}")))
        };
        let major = next()?;
        let minor = next()?;
        let revision = next()?;
        Ok(Version::new(major, minor, revision))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)
    }
}
