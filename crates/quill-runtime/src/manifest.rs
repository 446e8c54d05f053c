//! Extension manifest parsing and validation.
//!
//! Each extension carries a `manifest.toml` describing its identity, the
//! host API version it was built against, and the capabilities it
//! requests. Parsing is pure deserialization: no extension code runs, and
//! a manifest that fails validation allocates no runtime resources.

use crate::capability::CapabilitySet;
use crate::error::{RuntimeError, RuntimeResult};
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Manifest file name inside a package or extension directory.
pub const MANIFEST_FILE_NAME: &str = "manifest.toml";

/// Default bytecode entry point file.
pub const DEFAULT_ENTRY_POINT: &str = "extension.qlb";

/// Extension manifest structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionManifest {
    /// Extension identity and compatibility metadata.
    pub extension: ExtensionMetadata,

    /// Requested capability tags.
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Other extensions this one depends on.
    #[serde(default)]
    pub dependencies: Vec<DependencyRef>,
}

/// Extension identity metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionMetadata {
    /// Globally unique identifier (e.g. `org.inkwell.exporter.markdown`).
    pub id: String,

    /// Human-readable name.
    pub display_name: String,

    /// Extension version.
    pub version: Version,

    /// Host API version the extension was built against.
    pub api_version: Version,

    /// Bytecode file resolved inside the package (defaults to
    /// `extension.qlb`). Must be a bare file name, not a path.
    #[serde(default = "default_entry_point")]
    pub entry_point: String,

    /// Extension description.
    #[serde(default)]
    pub description: Option<String>,

    /// Extension author(s).
    #[serde(default)]
    pub authors: Vec<String>,

    /// License identifier.
    #[serde(default)]
    pub license: Option<String>,
}

fn default_entry_point() -> String {
    DEFAULT_ENTRY_POINT.to_string()
}

/// A dependency on another extension, by id and minimum version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyRef {
    pub id: String,
    pub min_version: Version,
}

impl ExtensionManifest {
    /// Load a manifest from a TOML file.
    pub fn from_file(path: &Path) -> RuntimeResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse a manifest from a TOML string.
    pub fn from_str(content: &str) -> RuntimeResult<Self> {
        let manifest: ExtensionManifest = toml::from_str(content)?;
        manifest.validate_structure()?;
        Ok(manifest)
    }

    /// Serialize the manifest back to TOML. Round-trips field-for-field
    /// with [`ExtensionManifest::from_str`].
    pub fn to_toml(&self) -> RuntimeResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| RuntimeError::InvalidManifest(format!("serialization failed: {e}")))
    }

    /// Structural checks that do not depend on the host or registry.
    fn validate_structure(&self) -> RuntimeResult<()> {
        if self.extension.id.is_empty() {
            return Err(RuntimeError::InvalidManifest(
                "extension id cannot be empty".to_string(),
            ));
        }

        if self.extension.display_name.is_empty() {
            return Err(RuntimeError::InvalidManifest(
                "display_name cannot be empty".to_string(),
            ));
        }

        let entry = &self.extension.entry_point;
        if entry.is_empty() {
            return Err(RuntimeError::InvalidManifest(
                "entry_point cannot be empty".to_string(),
            ));
        }
        if entry.contains('/') || entry.contains('\\') {
            return Err(RuntimeError::InvalidManifest(format!(
                "entry_point '{entry}' must be a bare file name"
            )));
        }

        for dep in &self.dependencies {
            if dep.id.is_empty() {
                return Err(RuntimeError::InvalidManifest(
                    "dependency id cannot be empty".to_string(),
                ));
            }
            if dep.id == self.extension.id {
                return Err(RuntimeError::InvalidManifest(format!(
                    "extension '{}' cannot depend on itself",
                    self.extension.id
                )));
            }
        }

        Ok(())
    }

    /// Get the capability set requested by this manifest.
    ///
    /// Derived, never stored: callers recompute this at load time and per
    /// call so a manifest re-validation takes effect immediately.
    pub fn capability_set(&self) -> CapabilitySet {
        CapabilitySet::from_strings(&self.capabilities)
    }

    /// Extension id.
    pub fn id(&self) -> &str {
        &self.extension.id
    }

    /// Extension version.
    pub fn version(&self) -> Version {
        self.extension.version
    }
}

/// Validate a manifest for installation against the host and registry
/// state. Checks, in order: host API compatibility, id uniqueness, and
/// that every declared dependency is already enabled at a sufficient
/// version. Fails on the first violation; never partially resolves.
pub fn validate_for_install(
    manifest: &ExtensionManifest,
    host_api: Version,
    registered_ids: &[String],
    enabled: &BTreeMap<String, Version>,
) -> RuntimeResult<()> {
    let required = manifest.extension.api_version;
    if !required.is_compatible_with(host_api) {
        return Err(RuntimeError::IncompatibleApiVersion {
            required,
            host: host_api,
        });
    }

    if registered_ids.iter().any(|id| id == manifest.id()) {
        return Err(RuntimeError::DuplicateId(manifest.id().to_string()));
    }

    for dep in &manifest.dependencies {
        match enabled.get(&dep.id) {
            Some(version) if version.satisfies_min(dep.min_version) => {}
            _ => {
                return Err(RuntimeError::DependencyUnsatisfied {
                    extension: manifest.id().to_string(),
                    dependency: dep.id.clone(),
                    min_version: dep.min_version,
                });
            }
        }
    }

    Ok(())
}
