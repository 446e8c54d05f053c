//! Capability enforcement for bridge calls.
//!
//! One enforcer per extension instance, holding the capability set the
//! manifest declared. Policy is deny-by-default: an operation whose
//! required capability is absent fails before any host state is read or
//! written.

use quill_runtime::{Capability, CapabilitySet, RuntimeError, RuntimeResult};
use tracing::debug;

/// Per-extension capability checker.
#[derive(Debug, Clone)]
pub struct CapabilityEnforcer {
    extension_id: String,
    granted: CapabilitySet,
}

impl CapabilityEnforcer {
    pub fn new(extension_id: impl Into<String>, granted: CapabilitySet) -> Self {
        Self {
            extension_id: extension_id.into(),
            granted,
        }
    }

    /// Check that `operation` may run under the granted set.
    pub fn check(&self, operation: &str, required: &Capability) -> RuntimeResult<()> {
        if self.granted.has(required) {
            Ok(())
        } else {
            debug!(
                extension = %self.extension_id,
                operation,
                capability = required.as_str(),
                "capability denied"
            );
            Err(RuntimeError::CapabilityDenied {
                operation: operation.to_string(),
                capability: required.as_str().to_string(),
            })
        }
    }

    pub fn granted(&self) -> &CapabilitySet {
        &self.granted
    }
}
