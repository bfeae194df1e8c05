//! Local certificate blacklist.
//!
//! The blacklist is a plain file maintained by the administrator of the client machine, one
//! fingerprint per line:
//!
//! ```text
//! # revoked after the 2024 key compromise
//! AB:CD:EF:01:23:45:67:89:AB:CD:EF:01:23:45:67:89:AB:CD:EF:01
//! ```
//!
//! It takes precedence over any whitelist: a listed certificate is never trusted.  It is read
//! once and never changes afterwards.  Any line that is neither blank, a comment nor a valid
//! fingerprint makes the whole file unusable.

use std::{collections::HashSet, fs, io::ErrorKind, path::Path};

use log::debug;

use crate::hash::{Fingerprint, ParseHashError};

/// Default location of the system blacklist.
pub const DEFAULT_BLACKLIST_PATH: &str = "/etc/cvmfs/blacklist";

/// Errors from loading a blacklist.
#[derive(Debug, thiserror::Error)]
pub enum BlacklistError {
    /// The file exists but could not be read.
    #[error("failed to read blacklist: {0}")]
    Io(#[from] std::io::Error),
    /// A line is not a fingerprint.
    #[error("blacklist line {line}: {source}")]
    Malformed {
        /// 1-based line number.
        line: usize,
        /// Why the line was rejected.
        #[source]
        source: ParseHashError,
    },
}

/// An immutable set of revoked certificate fingerprints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blacklist {
    fingerprints: HashSet<Fingerprint>,
}

impl Blacklist {
    /// A blacklist with no entries.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Loads the blacklist at `path`.  A missing file is an empty blacklist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BlacklistError> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(content) => {
                let blacklist = Self::parse(&content)?;
                debug!("{} blacklisted fingerprint(s) in {path:?}", blacklist.len());
                Ok(blacklist)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("no blacklist at {path:?}");
                Ok(Self::empty())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Parses blacklist content.
    pub fn parse(content: &str) -> Result<Self, BlacklistError> {
        let mut fingerprints = HashSet::new();
        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fingerprint = Fingerprint::parse(line).map_err(|source| {
                BlacklistError::Malformed {
                    line: idx + 1,
                    source,
                }
            })?;
            fingerprints.insert(fingerprint);
        }
        Ok(Self { fingerprints })
    }

    /// Whether `fingerprint` is revoked.
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.fingerprints.contains(fingerprint)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }
}

impl FromIterator<Fingerprint> for Blacklist {
    fn from_iter<I: IntoIterator<Item = Fingerprint>>(iter: I) -> Self {
        Self {
            fingerprints: iter.into_iter().collect(),
        }
    }
}
