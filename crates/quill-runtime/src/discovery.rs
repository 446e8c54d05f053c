//! Extension discovery from the extensions directory.
//!
//! Discovery scans one directory level for `.qpk` archives and bare
//! extension directories (anything containing a `manifest.toml`). Entries
//! that fail to open or validate are logged and skipped; one broken
//! package never aborts the scan. When two sources declare the same
//! extension id the first in file-name order wins.

use crate::error::{RuntimeError, RuntimeResult};
use crate::manifest::{ExtensionManifest, MANIFEST_FILE_NAME};
use crate::package::{Package, PACKAGE_EXTENSION};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Where a discovered extension lives on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageSource {
    /// A `.qpk` archive that must be extracted before use.
    Archive(PathBuf),

    /// An unpacked extension directory (development layout).
    Directory(PathBuf),
}

impl PackageSource {
    pub fn path(&self) -> &Path {
        match self {
            PackageSource::Archive(p) | PackageSource::Directory(p) => p,
        }
    }
}

/// A discovered extension: its source and parsed manifest.
#[derive(Debug, Clone)]
pub struct DiscoveredPackage {
    pub source: PackageSource,
    pub manifest: ExtensionManifest,
}

/// Inspect a single path as an extension source.
pub fn discover_package(path: &Path) -> RuntimeResult<DiscoveredPackage> {
    if path.is_dir() {
        let manifest_path = path.join(MANIFEST_FILE_NAME);
        if !manifest_path.is_file() {
            return Err(RuntimeError::InvalidManifest(format!(
                "directory '{}' has no {MANIFEST_FILE_NAME}",
                path.display()
            )));
        }
        let manifest = ExtensionManifest::from_file(&manifest_path)?;
        return Ok(DiscoveredPackage {
            source: PackageSource::Directory(path.to_path_buf()),
            manifest,
        });
    }

    if path.extension().and_then(|e| e.to_str()) == Some(PACKAGE_EXTENSION) {
        let package = Package::open(path)?;
        return Ok(DiscoveredPackage {
            manifest: package.manifest().clone(),
            source: PackageSource::Archive(path.to_path_buf()),
        });
    }

    Err(RuntimeError::ExtensionNotFound(format!(
        "'{}' is not an extension package or directory",
        path.display()
    )))
}

/// Scan a directory for extensions.
///
/// Returns discovered extensions sorted by id. A missing directory is
/// treated as empty.
pub fn discover(extensions_dir: &Path) -> RuntimeResult<Vec<DiscoveredPackage>> {
    if !extensions_dir.exists() {
        return Ok(Vec::new());
    }

    let mut entries: Vec<PathBuf> = std::fs::read_dir(extensions_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    // Scan in file-name order so duplicate resolution is deterministic.
    entries.sort();

    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut discovered = Vec::new();

    for path in entries {
        if !path.is_dir() && path.extension().and_then(|e| e.to_str()) != Some(PACKAGE_EXTENSION) {
            continue;
        }

        match discover_package(&path) {
            Ok(package) => {
                let id = package.manifest.id().to_string();
                if !seen_ids.insert(id.clone()) {
                    warn!(
                        extension = %id,
                        path = %path.display(),
                        "skipping duplicate extension id"
                    );
                    continue;
                }
                debug!(extension = %id, path = %path.display(), "discovered extension");
                discovered.push(package);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable extension");
            }
        }
    }

    discovered.sort_by(|a, b| a.manifest.id().cmp(b.manifest.id()));
    Ok(discovered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_extension_dir(root: &Path, dir_name: &str, id: &str) {
        let dir = root.join(dir_name);
        std::fs::create_dir_all(&dir).unwrap();
        let manifest = format!(
            r#"
[extension]
id = "{id}"
display_name = "Test"
version = "0.1.0"
api_version = "1.0.0"
"#
        );
        std::fs::write(dir.join(MANIFEST_FILE_NAME), manifest).unwrap();
    }

    #[test]
    fn test_discover_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let result = discover(&dir.path().join("nope")).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_discover_sorted_by_id() {
        let dir = tempfile::tempdir().unwrap();
        write_extension_dir(dir.path(), "zzz", "org.example.alpha");
        write_extension_dir(dir.path(), "aaa", "org.example.zeta");
        let result = discover(dir.path()).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].manifest.id(), "org.example.alpha");
        assert_eq!(result[1].manifest.id(), "org.example.zeta");
    }

    #[test]
    fn test_duplicate_id_first_wins() {
        let dir = tempfile::tempdir().unwrap();
        write_extension_dir(dir.path(), "a-first", "org.example.dup");
        write_extension_dir(dir.path(), "b-second", "org.example.dup");
        let result = discover(dir.path()).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(
            result[0].source,
            PackageSource::Directory(dir.path().join("a-first"))
        );
    }

    #[test]
    fn test_broken_entry_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_extension_dir(dir.path(), "good", "org.example.good");
        let broken = dir.path().join("broken");
        std::fs::create_dir_all(&broken).unwrap();
        std::fs::write(broken.join(MANIFEST_FILE_NAME), "not valid toml [[").unwrap();
        let result = discover(dir.path()).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].manifest.id(), "org.example.good");
    }

    #[test]
    fn test_unrelated_files_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README.md"), "hello").unwrap();
        write_extension_dir(dir.path(), "ext", "org.example.only");
        let result = discover(dir.path()).unwrap();
        assert_eq!(result.len(), 1);
    }
}
