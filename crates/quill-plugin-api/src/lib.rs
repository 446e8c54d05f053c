//! # quill-plugin-api
//!
//! Host-side extension API for Inkwell. This crate owns everything
//! between the document model and the bytecode runtime:
//!
//! - the native bridge extensions call through (`CallHost` dispatch)
//! - capability enforcement, checked before any host state is touched
//! - interpreter session lifecycle and handle epochs
//! - fault tracking with a circuit breaker that auto-disables
//!   repeatedly-faulting extensions
//! - the extension registry: install, enable, disable, uninstall, call

pub mod bridge;
pub mod enforcer;
pub mod fault;
pub mod instance;
pub mod marshal;
pub mod registry;
pub mod session;

pub use bridge::{DocumentHost, ExportTable, NativeBridge};
pub use enforcer::CapabilityEnforcer;
pub use fault::{FaultPolicy, FaultRecord, FaultTracker};
pub use instance::{ExtensionInfo, ExtensionInstance};
pub use registry::{DisableReason, ExtensionRegistry, RegistryEvent};
pub use session::{InterpreterSession, SessionState};
