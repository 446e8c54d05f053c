//! Error types for the Quill runtime.

use crate::version::Version;
use thiserror::Error;

/// Errors that can occur in the Quill runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Extension not found in the registry or on disk.
    #[error("Extension not found: {0}")]
    ExtensionNotFound(String),

    /// Extension exists but is not enabled.
    #[error("Extension is not enabled: {0}")]
    ExtensionDisabled(String),

    /// Failed to parse or validate an extension manifest.
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    /// An extension with the same id is already registered.
    #[error("Duplicate extension id: {0}")]
    DuplicateId(String),

    /// The extension was built against an incompatible host API version.
    #[error("Incompatible API version: extension requires {required}, host provides {host}")]
    IncompatibleApiVersion { required: Version, host: Version },

    /// A declared dependency is missing or too old.
    #[error("Unsatisfied dependency: {extension} requires {dependency} >= {min_version}")]
    DependencyUnsatisfied {
        extension: String,
        dependency: String,
        min_version: Version,
    },

    /// Structural violation in an extension package.
    #[error("Package integrity violation: {0}")]
    PackageIntegrity(String),

    /// Package signature missing, invalid, or from an untrusted key.
    #[error("Signature rejected: {0}")]
    SignatureRejected(String),

    /// Failed to load or validate bytecode.
    #[error("Bytecode error: {0}")]
    BytecodeError(String),

    /// Extension called an operation without the matching capability.
    #[error("Capability denied: {operation} requires {capability}")]
    CapabilityDenied {
        operation: String,
        capability: String,
    },

    /// A value could not cross the bridge boundary.
    #[error("Marshal error: {0}")]
    MarshalError(String),

    /// Interpreter-level failure during extension execution.
    #[error("Execution fault: {0}")]
    ExecutionFault(String),

    /// The owning interpreter session has been terminated.
    #[error("Session closed")]
    SessionClosed,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;
