//! # inkwell-host
//!
//! The Inkwell extension host. Owns the document model and host
//! configuration, and supervises extension calls: every call runs on a
//! blocking worker under a timeout, and a call that overruns is
//! cooperatively cancelled and counted as a fault.

pub mod config;
pub mod document;
pub mod manager;

pub use config::Config;
pub use document::{Chapter, Document, HostAdapter, HostIo};
pub use manager::ExtensionManager;
