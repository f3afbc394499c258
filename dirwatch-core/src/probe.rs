//! Metadata probe: the engine's only view of the filesystem

use std::fs;
use std::io;
use std::path::Path;
use std::time::SystemTime;
use tracing::trace;
use walkdir::WalkDir;

use crate::error::ProbeError;

/// Snapshot of what a stat call reports for one path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub modified: Option<SystemTime>,
    pub inode: u64,
    pub link_count: u64,
    pub is_dir: bool,
}

/// Stat-like access to the filesystem.
///
/// `Ok(None)` means the path does not exist. Other failures are reported as
/// errors; the engine treats them as "does not exist" too.
pub trait MetadataProbe: Send {
    fn read_metadata(&self, path: &Path) -> Result<Option<Metadata>, ProbeError>;

    /// Names of the direct children of a directory
    fn read_dir(&self, path: &Path) -> Result<Vec<String>, ProbeError>;
}

/// Probe backed by the real filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct FsProbe;

impl MetadataProbe for FsProbe {
    fn read_metadata(&self, path: &Path) -> Result<Option<Metadata>, ProbeError> {
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(ProbeError { path: path.to_path_buf(), source }),
        };

        let (inode, link_count) = inode_and_links(&meta);
        // The later of change and modification time catches attribute-only changes
        let modified = match (meta.modified().ok(), changed_time(&meta)) {
            (Some(m), Some(c)) => Some(m.max(c)),
            (m, c) => m.or(c),
        };

        Ok(Some(Metadata { modified, inode, link_count, is_dir: meta.is_dir() }))
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<String>, ProbeError> {
        let mut names = Vec::new();
        for entry in WalkDir::new(path).min_depth(1).max_depth(1).follow_links(false) {
            match entry {
                Ok(entry) => names.push(entry.file_name().to_string_lossy().into_owned()),
                // Children can vanish between readdir and stat
                Err(e) if e.depth() > 0 => trace!("Skipping child of {:?}: {}", path, e),
                Err(e) => {
                    let source = e.into_io_error().unwrap_or_else(|| io::Error::other("directory loop"));
                    return Err(ProbeError { path: path.to_path_buf(), source });
                }
            }
        }
        Ok(names)
    }
}

#[cfg(unix)]
fn inode_and_links(meta: &fs::Metadata) -> (u64, u64) {
    use std::os::unix::fs::MetadataExt;
    (meta.ino(), meta.nlink())
}

#[cfg(not(unix))]
fn inode_and_links(_meta: &fs::Metadata) -> (u64, u64) {
    (0, 1)
}

#[cfg(unix)]
fn changed_time(meta: &fs::Metadata) -> Option<SystemTime> {
    use std::os::unix::fs::MetadataExt;
    use std::time::Duration;

    let secs = u64::try_from(meta.ctime()).ok()?;
    let nanos = u32::try_from(meta.ctime_nsec()).ok()?;
    SystemTime::UNIX_EPOCH.checked_add(Duration::new(secs, nanos))
}

#[cfg(not(unix))]
fn changed_time(_meta: &fs::Metadata) -> Option<SystemTime> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_path_is_none() {
        let dir = TempDir::new().unwrap();
        let probe = FsProbe;
        assert_eq!(probe.read_metadata(&dir.path().join("missing")).unwrap(), None);
    }

    #[test]
    fn test_file_and_dir_metadata() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "x").unwrap();

        let probe = FsProbe;
        let file_meta = probe.read_metadata(&file).unwrap().unwrap();
        assert!(!file_meta.is_dir);
        assert!(file_meta.modified.is_some());

        let dir_meta = probe.read_metadata(dir.path()).unwrap().unwrap();
        assert!(dir_meta.is_dir);
    }

    #[test]
    fn test_read_dir_lists_direct_children_only() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a"), "").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("nested"), "").unwrap();

        let mut names = FsProbe.read_dir(dir.path()).unwrap();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "sub".to_string()]);
    }
}
