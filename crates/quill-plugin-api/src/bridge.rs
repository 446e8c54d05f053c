//! The native bridge: host operations exposed to running bytecode.
//!
//! Every `CallHost` instruction lands here. Dispatch order is fixed:
//! arguments are marshal-checked, the capability is checked, and only
//! then is the document host touched. A denied or malformed call leaves
//! host state untouched.
//!
//! Chapter handles minted by the bridge carry the issuing session's
//! handle epoch; a handle from a terminated session fails with
//! `SessionClosed` no matter which session replays it.

use crate::enforcer::CapabilityEnforcer;
use crate::marshal::{check_args, expect_arity, expect_handle, expect_int, expect_str};
use quill_runtime::vm::HostCalls;
use quill_runtime::{
    Capability, HandleKind, HandleRef, RuntimeError, RuntimeResult, Value,
};
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

/// Host-side document operations the bridge dispatches to.
///
/// Implemented by the embedding application over its document model.
/// Index arguments have already been resolved from live handles; an
/// index that no longer exists should fail with an execution fault.
pub trait DocumentHost: Send {
    fn title(&self) -> RuntimeResult<String>;
    fn set_title(&mut self, title: &str) -> RuntimeResult<()>;
    fn chapter_count(&self) -> RuntimeResult<u32>;
    fn chapter_title(&self, index: u32) -> RuntimeResult<String>;
    fn chapter_text(&self, index: u32) -> RuntimeResult<String>;
    fn set_chapter_text(&mut self, index: u32, text: &str) -> RuntimeResult<()>;
    /// Append a chapter and return its index.
    fn add_chapter(&mut self, title: &str) -> RuntimeResult<u32>;
    fn read_text_file(&self, path: &str) -> RuntimeResult<String>;
    fn write_text_file(&mut self, path: &str, contents: &str) -> RuntimeResult<()>;
    fn http_get(&mut self, url: &str) -> RuntimeResult<String>;
}

/// Export hooks registered by one extension: format id to function name.
#[derive(Debug, Clone, Default)]
pub struct ExportTable {
    formats: BTreeMap<String, String>,
}

impl ExportTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook for a format. Re-registering a format within the
    /// same extension replaces the previous hook.
    pub fn register(&mut self, format: impl Into<String>, function: impl Into<String>) {
        self.formats.insert(format.into(), function.into());
    }

    pub fn hook_for(&self, format: &str) -> Option<&str> {
        self.formats.get(format).map(String::as_str)
    }

    pub fn formats(&self) -> impl Iterator<Item = &str> {
        self.formats.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }
}

/// Bridge between one extension's VM and the host, for one call.
pub struct NativeBridge<'a> {
    extension_id: &'a str,
    epoch: u32,
    enforcer: &'a CapabilityEnforcer,
    exports: &'a mut ExportTable,
    host: &'a mut dyn DocumentHost,
}

impl<'a> NativeBridge<'a> {
    pub fn new(
        extension_id: &'a str,
        epoch: u32,
        enforcer: &'a CapabilityEnforcer,
        exports: &'a mut ExportTable,
        host: &'a mut dyn DocumentHost,
    ) -> Self {
        Self {
            extension_id,
            epoch,
            enforcer,
            exports,
            host,
        }
    }

    fn chapter_handle(&self, index: u32) -> Value {
        Value::Handle(HandleRef {
            kind: HandleKind::Chapter,
            index,
            generation: self.epoch,
        })
    }

    /// Resolve a chapter handle, rejecting stale and foreign handles.
    fn resolve_chapter(&self, operation: &str, value: Value) -> RuntimeResult<u32> {
        let handle = expect_handle(operation, value)?;
        if handle.kind != HandleKind::Chapter {
            return Err(RuntimeError::MarshalError(format!(
                "{operation} expected a chapter handle, got a {} handle",
                handle.kind
            )));
        }
        if handle.generation != self.epoch {
            return Err(RuntimeError::SessionClosed);
        }
        Ok(handle.index)
    }

    fn log(&self, level: &str, message: &str) {
        match level {
            "debug" => debug!(extension = self.extension_id, "{message}"),
            "warn" => warn!(extension = self.extension_id, "{message}"),
            "error" => error!(extension = self.extension_id, "{message}"),
            _ => info!(extension = self.extension_id, "{message}"),
        }
    }
}

impl HostCalls for NativeBridge<'_> {
    fn host_call(&mut self, name: &str, mut args: Vec<Value>) -> RuntimeResult<Value> {
        check_args(&args)?;

        match name {
            "log.debug" | "log.info" | "log.warn" | "log.error" => {
                expect_arity(name, &args, 1)?;
                let message = expect_str(name, args.remove(0))?;
                let level = name.strip_prefix("log.").unwrap_or("info");
                self.log(level, &message);
                Ok(Value::Null)
            }

            "document.get_title" => {
                expect_arity(name, &args, 0)?;
                self.enforcer.check(name, &Capability::DocumentRead)?;
                Ok(Value::Str(self.host.title()?))
            }
            "document.set_title" => {
                expect_arity(name, &args, 1)?;
                let title = expect_str(name, args.remove(0))?;
                self.enforcer.check(name, &Capability::DocumentWrite)?;
                self.host.set_title(&title)?;
                Ok(Value::Null)
            }
            "document.chapter_count" => {
                expect_arity(name, &args, 0)?;
                self.enforcer.check(name, &Capability::DocumentRead)?;
                Ok(Value::Int(i64::from(self.host.chapter_count()?)))
            }
            "document.get_chapter" => {
                expect_arity(name, &args, 1)?;
                let index = expect_int(name, args.remove(0))?;
                self.enforcer.check(name, &Capability::DocumentRead)?;
                let count = i64::from(self.host.chapter_count()?);
                if index < 0 || index >= count {
                    return Err(RuntimeError::ExecutionFault(format!(
                        "chapter index {index} out of range (document has {count})"
                    )));
                }
                Ok(self.chapter_handle(index as u32))
            }
            "document.add_chapter" => {
                expect_arity(name, &args, 1)?;
                let title = expect_str(name, args.remove(0))?;
                self.enforcer.check(name, &Capability::DocumentWrite)?;
                let index = self.host.add_chapter(&title)?;
                Ok(self.chapter_handle(index))
            }

            "chapter.get_title" => {
                expect_arity(name, &args, 1)?;
                let index = self.resolve_chapter(name, args.remove(0))?;
                self.enforcer.check(name, &Capability::DocumentRead)?;
                Ok(Value::Str(self.host.chapter_title(index)?))
            }
            "chapter.get_text" => {
                expect_arity(name, &args, 1)?;
                let index = self.resolve_chapter(name, args.remove(0))?;
                self.enforcer.check(name, &Capability::DocumentRead)?;
                Ok(Value::Str(self.host.chapter_text(index)?))
            }
            "chapter.set_text" => {
                expect_arity(name, &args, 2)?;
                let index = self.resolve_chapter(name, args.remove(0))?;
                let text = expect_str(name, args.remove(0))?;
                self.enforcer.check(name, &Capability::DocumentWrite)?;
                self.host.set_chapter_text(index, &text)?;
                Ok(Value::Null)
            }

            "fs.read_text" => {
                expect_arity(name, &args, 1)?;
                let path = expect_str(name, args.remove(0))?;
                self.enforcer.check(name, &Capability::FilesystemRead)?;
                Ok(Value::Str(self.host.read_text_file(&path)?))
            }
            "fs.write_text" => {
                expect_arity(name, &args, 2)?;
                let path = expect_str(name, args.remove(0))?;
                let contents = expect_str(name, args.remove(0))?;
                self.enforcer.check(name, &Capability::FilesystemWrite)?;
                self.host.write_text_file(&path, &contents)?;
                Ok(Value::Null)
            }

            "http.get" => {
                expect_arity(name, &args, 1)?;
                let url = expect_str(name, args.remove(0))?;
                self.enforcer.check(name, &Capability::NetworkHttp)?;
                Ok(Value::Str(self.host.http_get(&url)?))
            }

            "export.register" => {
                expect_arity(name, &args, 2)?;
                let format = expect_str(name, args.remove(0))?;
                let function = expect_str(name, args.remove(0))?;
                self.enforcer.check(name, &Capability::ExportRegister)?;
                info!(
                    extension = self.extension_id,
                    format = %format,
                    function = %function,
                    "registered export hook"
                );
                self.exports.register(format, function);
                Ok(Value::Null)
            }

            other => Err(RuntimeError::MarshalError(format!(
                "unknown host operation '{other}'"
            ))),
        }
    }
}
