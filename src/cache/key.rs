use crate::selection::RangeSpec;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;

/// Identity of one version of a file on disk.
///
/// Two fingerprints of the same path differ as soon as the file is rewritten,
/// which is what invalidates cached sections and memoized probes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    /// Canonical path.
    pub path: PathBuf,
    pub size: u64,
    /// `None` on platforms without modification times.
    pub modified: Option<SystemTime>,
}

impl Fingerprint {
    /// Stats `path`. Fails when the file is missing or unreadable.
    pub fn of(path: &Path) -> std::io::Result<Fingerprint> {
        let path = fs::canonicalize(path)?;
        let metadata = fs::metadata(&path)?;
        Ok(Fingerprint {
            path,
            size: metadata.len(),
            modified: metadata.modified().ok(),
        })
    }
}

/// Cache key of a materialized section.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SectionKey {
    pub fingerprint: Fingerprint,
    pub sheet_index: usize,
    pub range: RangeSpec,
}

impl SectionKey {
    pub fn new(fingerprint: Fingerprint, sheet_index: usize, range: RangeSpec) -> Self {
        SectionKey {
            fingerprint,
            sheet_index,
            range,
        }
    }

    /// Same file and sheet, another range.
    pub fn with_range(&self, range: RangeSpec) -> Self {
        SectionKey {
            range,
            ..self.clone()
        }
    }
}
