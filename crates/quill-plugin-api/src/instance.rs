//! A fully assembled extension instance.

use crate::bridge::ExportTable;
use crate::enforcer::CapabilityEnforcer;
use crate::fault::FaultTracker;
use crate::session::InterpreterSession;
use quill_runtime::{ExtensionManifest, SignatureStatus, StagingDir, Version};
use serde::Serialize;

/// Everything the registry holds for one installed extension.
///
/// Fields are deliberately public within the crate: dispatch needs
/// disjoint borrows of the session, exports, and enforcer at once.
pub struct ExtensionInstance {
    pub manifest: ExtensionManifest,
    pub session: InterpreterSession,
    pub enforcer: CapabilityEnforcer,
    pub exports: ExportTable,
    pub faults: FaultTracker,
    pub enabled: bool,
    pub signature: SignatureStatus,

    /// Extraction directory for archive installs; removed on drop, so
    /// this must outlive the session using the staged bytecode.
    pub staging: Option<StagingDir>,
}

impl ExtensionInstance {
    pub fn id(&self) -> &str {
        self.manifest.id()
    }

    pub fn version(&self) -> Version {
        self.manifest.version()
    }

    /// Snapshot for listings and status output.
    pub fn info(&self) -> ExtensionInfo {
        ExtensionInfo {
            id: self.id().to_string(),
            display_name: self.manifest.extension.display_name.clone(),
            version: self.version().to_string(),
            enabled: self.enabled,
            failed: self.session.failed(),
            capabilities: self.manifest.capabilities.clone(),
            export_formats: self.exports.formats().map(str::to_string).collect(),
            signed: matches!(self.signature, SignatureStatus::Verified { .. }),
        }
    }
}

/// Status snapshot of an installed extension.
#[derive(Debug, Clone, Serialize)]
pub struct ExtensionInfo {
    pub id: String,
    pub display_name: String,
    pub version: String,
    pub enabled: bool,
    pub failed: bool,
    pub capabilities: Vec<String>,
    pub export_formats: Vec<String>,
    pub signed: bool,
}
