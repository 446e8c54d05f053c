//! Capability-based security model for extensions.
//!
//! Extensions must declare the capabilities they need in their manifest.
//! The bridge enforces that extensions only use capabilities they've
//! declared; the policy is deny-by-default, so a tag outside the fixed
//! vocabulary grants nothing.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A capability that an extension can request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Read the host document (title, chapters, text).
    DocumentRead,

    /// Mutate the host document through bridge calls.
    DocumentWrite,

    /// Read from the filesystem.
    FilesystemRead,

    /// Write to the filesystem.
    FilesystemWrite,

    /// Make outbound HTTP requests.
    NetworkHttp,

    /// Register export hooks for document formats.
    ExportRegister,

    /// Tag outside the fixed vocabulary. Grants no operation.
    Custom(String),
}

impl Capability {
    /// Parse a capability from its manifest tag.
    pub fn parse(s: &str) -> Self {
        match s {
            "document.read" => Capability::DocumentRead,
            "document.write" => Capability::DocumentWrite,
            "filesystem.read" => Capability::FilesystemRead,
            "filesystem.write" => Capability::FilesystemWrite,
            "network.http" => Capability::NetworkHttp,
            "export.register" => Capability::ExportRegister,
            other => Capability::Custom(other.to_string()),
        }
    }

    /// Manifest tag for this capability.
    pub fn as_str(&self) -> &str {
        match self {
            Capability::DocumentRead => "document.read",
            Capability::DocumentWrite => "document.write",
            Capability::FilesystemRead => "filesystem.read",
            Capability::FilesystemWrite => "filesystem.write",
            Capability::NetworkHttp => "network.http",
            Capability::ExportRegister => "export.register",
            Capability::Custom(s) => s,
        }
    }
}

/// A set of capabilities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilitySet {
    capabilities: HashSet<Capability>,
}

impl CapabilitySet {
    /// Create an empty capability set.
    pub fn new() -> Self {
        Self {
            capabilities: HashSet::new(),
        }
    }

    /// Create a capability set from a list of manifest tags.
    pub fn from_strings<I, S>(strings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let capabilities = strings
            .into_iter()
            .map(|s| Capability::parse(s.as_ref()))
            .collect();
        Self { capabilities }
    }

    /// Add a capability to the set.
    pub fn add(&mut self, cap: Capability) {
        self.capabilities.insert(cap);
    }

    /// Check if the set contains a capability.
    pub fn has(&self, cap: &Capability) -> bool {
        self.capabilities.contains(cap)
    }

    /// Check if this set is a superset of another.
    pub fn contains_all(&self, other: &CapabilitySet) -> bool {
        other.capabilities.is_subset(&self.capabilities)
    }

    /// Get all capabilities in the set.
    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.capabilities.iter()
    }

    /// Get the number of capabilities.
    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    /// Check if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
        Self {
            capabilities: iter.into_iter().collect(),
        }
    }
}
