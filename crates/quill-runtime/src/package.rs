//! Extension package (`.qpk`) loading.
//!
//! A package is a gzip-compressed tarball with a `manifest.toml` and the
//! bytecode entry point at the archive root. Opening a package only
//! inspects it; nothing is written to disk until [`Package::extract_to`]
//! unpacks into a fresh staging directory.
//!
//! Structural rules enforced before extraction:
//! - exactly one `manifest.toml`, at the archive root
//! - every entry stays inside the package root (no absolute paths, no
//!   `..` components, no links)
//! - declared entry sizes and actual extracted bytes both stay under the
//!   unpacked-size ceiling
//!
//! A package that violates any rule is rejected as a whole.

use crate::error::{RuntimeError, RuntimeResult};
use crate::manifest::{ExtensionManifest, MANIFEST_FILE_NAME};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};
use tracing::{debug, warn};
use uuid::Uuid;

/// File extension for extension packages.
pub const PACKAGE_EXTENSION: &str = "qpk";

/// Default ceiling on total unpacked package size.
pub const DEFAULT_MAX_UNPACKED_BYTES: u64 = 64 * 1024 * 1024;

/// An opened, structurally verified extension package.
#[derive(Debug)]
pub struct Package {
    path: PathBuf,
    manifest: ExtensionManifest,
    unpacked_size: u64,
    max_unpacked_bytes: u64,
}

impl Package {
    /// Open and verify a `.qpk` archive with the default size ceiling.
    pub fn open(path: &Path) -> RuntimeResult<Self> {
        Self::open_with_limit(path, DEFAULT_MAX_UNPACKED_BYTES)
    }

    /// Open and verify a `.qpk` archive with an explicit size ceiling.
    pub fn open_with_limit(path: &Path, max_unpacked_bytes: u64) -> RuntimeResult<Self> {
        let mut archive = open_archive(path)?;

        let mut manifest_content: Option<String> = None;
        let mut entry_names: Vec<PathBuf> = Vec::new();
        let mut total_size: u64 = 0;

        for entry in archive.entries()? {
            let mut entry = entry?;
            let raw_path = entry.path()?.into_owned();
            let relative = safe_relative_path(&raw_path)?;

            match entry.header().entry_type() {
                EntryType::Regular => {}
                EntryType::Directory => continue,
                other => {
                    return Err(RuntimeError::PackageIntegrity(format!(
                        "entry '{}' has unsupported type {:?}",
                        relative.display(),
                        other
                    )));
                }
            }

            total_size = total_size.saturating_add(entry.header().size()?);
            if total_size > max_unpacked_bytes {
                return Err(RuntimeError::PackageIntegrity(format!(
                    "unpacked size exceeds the {max_unpacked_bytes} byte ceiling"
                )));
            }

            if relative == Path::new(MANIFEST_FILE_NAME) {
                if manifest_content.is_some() {
                    return Err(RuntimeError::PackageIntegrity(format!(
                        "more than one {MANIFEST_FILE_NAME} in package"
                    )));
                }
                let mut content = String::new();
                entry.read_to_string(&mut content)?;
                manifest_content = Some(content);
            }

            entry_names.push(relative);
        }

        let manifest_content = manifest_content.ok_or_else(|| {
            RuntimeError::PackageIntegrity(format!("no {MANIFEST_FILE_NAME} at package root"))
        })?;
        let manifest = ExtensionManifest::from_str(&manifest_content)?;

        let entry_point = Path::new(&manifest.extension.entry_point);
        if !entry_names.iter().any(|name| name == entry_point) {
            return Err(RuntimeError::PackageIntegrity(format!(
                "entry point '{}' not present in package",
                manifest.extension.entry_point
            )));
        }

        debug!(
            package = %path.display(),
            extension = manifest.id(),
            entries = entry_names.len(),
            unpacked = total_size,
            "opened extension package"
        );

        Ok(Self {
            path: path.to_path_buf(),
            manifest,
            unpacked_size: total_size,
            max_unpacked_bytes,
        })
    }

    /// The archive path this package was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The package's manifest.
    pub fn manifest(&self) -> &ExtensionManifest {
        &self.manifest
    }

    /// Total declared unpacked size in bytes.
    pub fn unpacked_size(&self) -> u64 {
        self.unpacked_size
    }

    /// Unpack the package into a fresh directory under `staging_root`.
    ///
    /// The staging directory is removed when the returned [`StagingDir`]
    /// is dropped. Byte counts are enforced again during extraction, so a
    /// header that lies about its size cannot blow past the ceiling.
    pub fn extract_to(&self, staging_root: &Path) -> RuntimeResult<StagingDir> {
        let target = staging_root.join(Uuid::new_v4().to_string());
        std::fs::create_dir_all(&target)?;
        let staging = StagingDir { path: target };

        let mut archive = open_archive(&self.path)?;
        let mut written: u64 = 0;

        for entry in archive.entries()? {
            let mut entry = entry?;
            let raw_path = entry.path()?.into_owned();
            let relative = safe_relative_path(&raw_path)?;
            if entry.header().entry_type() != EntryType::Regular {
                continue;
            }

            let destination = staging.path.join(&relative);
            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let remaining = self.max_unpacked_bytes.saturating_sub(written);
            let mut file = File::create(&destination)?;
            let copied = std::io::copy(&mut (&mut entry).take(remaining + 1), &mut file)?;
            written = written.saturating_add(copied);
            if written > self.max_unpacked_bytes {
                return Err(RuntimeError::PackageIntegrity(format!(
                    "unpacked size exceeds the {} byte ceiling",
                    self.max_unpacked_bytes
                )));
            }
        }

        debug!(
            extension = self.manifest.id(),
            staging = %staging.path.display(),
            bytes = written,
            "extracted extension package"
        );

        Ok(staging)
    }
}

fn open_archive(path: &Path) -> RuntimeResult<Archive<GzDecoder<File>>> {
    let file = File::open(path)?;
    Ok(Archive::new(GzDecoder::new(file)))
}

/// Normalize an archive entry path, rejecting anything that could land
/// outside the extraction root.
fn safe_relative_path(raw: &Path) -> RuntimeResult<PathBuf> {
    let mut clean = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(RuntimeError::PackageIntegrity(format!(
                    "entry path '{}' escapes the package root",
                    raw.display()
                )));
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(RuntimeError::PackageIntegrity(
            "entry with empty path".to_string(),
        ));
    }
    Ok(clean)
}

/// Temporary extraction directory, removed on drop.
#[derive(Debug)]
pub struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the staged manifest file.
    pub fn manifest_path(&self) -> PathBuf {
        self.path.join(MANIFEST_FILE_NAME)
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            warn!(
                staging = %self.path.display(),
                error = %e,
                "failed to remove staging directory"
            );
        }
    }
}
