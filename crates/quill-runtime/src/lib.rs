//! # quill-runtime
//!
//! Quill bytecode runtime for executing extensions in Inkwell.
//!
//! This crate provides:
//! - Extension package loading (`.qpk` archives) with integrity checks
//! - Extension manifest parsing and validation
//! - Detached package signature verification
//! - Bytecode loading, validation, and execution
//! - Capability-based security model
//! - Extension discovery from an extensions directory
//!
//! ## Extension Structure
//!
//! An extension is either a `.qpk` archive (gzip tarball) or a bare
//! directory containing:
//! - `manifest.toml` - Extension metadata, API version, and capabilities
//! - `extension.qlb` - Compiled Quill bytecode (name set by `entry_point`)
//! - optional resource files
//!
//! ## Security Model
//!
//! Extensions declare required capabilities in their manifest. Every host
//! call is checked against the declared set before any host state is
//! touched; packages are structurally verified before extraction and never
//! executed as a side effect of loading.

pub mod bytecode;
pub mod capability;
pub mod discovery;
pub mod error;
pub mod manifest;
pub mod package;
pub mod signature;
pub mod value;
pub mod version;
pub mod vm;

pub use bytecode::{Bytecode, BytecodeLoader};
pub use capability::{Capability, CapabilitySet};
pub use discovery::{discover, discover_package, DiscoveredPackage, PackageSource};
pub use error::{RuntimeError, RuntimeResult};
pub use manifest::{validate_for_install, DependencyRef, ExtensionManifest, ExtensionMetadata};
pub use package::{Package, StagingDir};
pub use signature::{verify_package, SignatureStatus, TrustedKeys};
pub use value::{HandleKind, HandleRef, Value};
pub use version::Version;
pub use vm::{CancelToken, HostCalls, Vm};
