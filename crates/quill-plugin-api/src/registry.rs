//! Extension registry: install, lifecycle, dispatch.
//!
//! The registry is the single owner of extension instances. All
//! lifecycle transitions and every bytecode call go through it, so it is
//! the one place that enforces "disabled extensions run nothing" and
//! where the circuit breaker pulls faulting extensions offline.
//!
//! Lifecycle hooks (`on_load`, `on_enable`, `on_disable`, `on_unload`)
//! are plain bytecode functions; a hook that does not exist is skipped.
//! Load and enable hooks are load-bearing: a failure aborts the install
//! or enable. Disable and unload hooks are best-effort: failures are
//! logged and teardown continues.

use crate::bridge::{DocumentHost, NativeBridge};
use crate::enforcer::CapabilityEnforcer;
use crate::fault::{self, FaultPolicy, FaultTracker};
use crate::instance::{ExtensionInfo, ExtensionInstance};
use crate::marshal;
use crate::session::{InterpreterSession, SessionState};
use quill_runtime::discovery;
use quill_runtime::package::DEFAULT_MAX_UNPACKED_BYTES;
use quill_runtime::vm::DEFAULT_INSTRUCTION_BUDGET;
use quill_runtime::{
    signature, validate_for_install, BytecodeLoader, ExtensionManifest, Package, RuntimeError,
    RuntimeResult, SignatureStatus, TrustedKeys, Value, Version,
};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Lifecycle hook called once, right after install.
pub const ON_LOAD: &str = "on_load";
/// Lifecycle hook called whenever the extension becomes enabled.
pub const ON_ENABLE: &str = "on_enable";
/// Best-effort hook called when the extension is disabled.
pub const ON_DISABLE: &str = "on_disable";
/// Best-effort hook called before uninstall.
pub const ON_UNLOAD: &str = "on_unload";

/// Why an extension was disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableReason {
    /// Explicit host or user request.
    Requested,
    /// The fault circuit breaker tripped.
    CircuitBreaker,
}

/// Registry lifecycle notifications.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Installed { id: String },
    Enabled { id: String },
    Disabled { id: String, reason: DisableReason },
    Uninstalled { id: String },
    Fault { id: String, operation: String },
}

/// Registry of installed extensions.
pub struct ExtensionRegistry {
    host_api: Version,
    staging_root: PathBuf,
    extensions: HashMap<String, ExtensionInstance>,
    events: broadcast::Sender<RegistryEvent>,
    trusted: TrustedKeys,
    require_signature: bool,
    instruction_budget: u64,
    max_unpacked_bytes: u64,
    fault_policy: FaultPolicy,
}

impl ExtensionRegistry {
    /// Create a registry for a host exposing `host_api`. Archive installs
    /// are extracted under `staging_root`.
    pub fn new(host_api: Version, staging_root: impl Into<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            host_api,
            staging_root: staging_root.into(),
            extensions: HashMap::new(),
            events,
            trusted: TrustedKeys::new(),
            require_signature: false,
            instruction_budget: DEFAULT_INSTRUCTION_BUDGET,
            max_unpacked_bytes: DEFAULT_MAX_UNPACKED_BYTES,
            fault_policy: FaultPolicy::default(),
        }
    }

    pub fn with_trusted_keys(mut self, trusted: TrustedKeys) -> Self {
        self.trusted = trusted;
        self
    }

    /// Refuse to install unsigned packages.
    pub fn with_signature_required(mut self, required: bool) -> Self {
        self.require_signature = required;
        self
    }

    pub fn with_instruction_budget(mut self, budget: u64) -> Self {
        self.instruction_budget = budget;
        self
    }

    pub fn with_fault_policy(mut self, policy: FaultPolicy) -> Self {
        self.fault_policy = policy;
        self
    }

    pub fn with_max_unpacked_bytes(mut self, bytes: u64) -> Self {
        self.max_unpacked_bytes = bytes;
        self
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Install an extension from a `.qpk` archive or a bare directory.
    ///
    /// Runs `on_load` then `on_enable`; a failure in either aborts the
    /// install and leaves the registry unchanged. Returns the installed
    /// extension id.
    pub fn install(&mut self, path: &Path, host: &mut dyn DocumentHost) -> RuntimeResult<String> {
        let (manifest, staging, entry_dir, status) = if path.is_dir() {
            if self.require_signature {
                return Err(RuntimeError::SignatureRejected(format!(
                    "directory source '{}' cannot satisfy the signature requirement",
                    path.display()
                )));
            }
            let discovered = discovery::discover_package(path)?;
            self.check_manifest(&discovered.manifest)?;
            (
                discovered.manifest,
                None,
                path.to_path_buf(),
                SignatureStatus::Unsigned,
            )
        } else {
            let package = Package::open_with_limit(path, self.max_unpacked_bytes)?;
            let status = signature::verify_package(path, &self.trusted)?;
            if self.require_signature && status == SignatureStatus::Unsigned {
                return Err(RuntimeError::SignatureRejected(format!(
                    "package '{}' is unsigned and the host requires signatures",
                    path.display()
                )));
            }
            self.check_manifest(package.manifest())?;
            std::fs::create_dir_all(&self.staging_root)?;
            let staging = package.extract_to(&self.staging_root)?;
            let entry_dir = staging.path().to_path_buf();
            (package.manifest().clone(), Some(staging), entry_dir, status)
        };

        let id = manifest.id().to_string();
        let entry = entry_dir.join(&manifest.extension.entry_point);
        let bytecode = BytecodeLoader::load(&entry)?;

        let mut session =
            InterpreterSession::new(id.clone(), bytecode, self.instruction_budget)?;
        session.initialize()?;

        let mut instance = ExtensionInstance {
            enforcer: CapabilityEnforcer::new(id.clone(), manifest.capability_set()),
            exports: Default::default(),
            faults: FaultTracker::new(self.fault_policy),
            enabled: true,
            signature: status,
            staging,
            session,
            manifest,
        };

        // Load-bearing hooks: any failure aborts the install and the
        // instance (staging included) is dropped.
        Self::run_hook(&mut instance, ON_LOAD, host, &self.events)?;
        Self::run_hook(&mut instance, ON_ENABLE, host, &self.events)?;

        info!(
            extension = %id,
            version = %instance.version(),
            signed = matches!(instance.signature, SignatureStatus::Verified { .. }),
            "installed extension"
        );
        self.extensions.insert(id.clone(), instance);
        let _ = self.events.send(RegistryEvent::Installed { id: id.clone() });
        let _ = self.events.send(RegistryEvent::Enabled { id: id.clone() });
        Ok(id)
    }

    /// Discover and install everything under an extensions directory.
    /// One broken extension never aborts the sweep.
    pub fn discover_and_install(
        &mut self,
        extensions_dir: &Path,
        host: &mut dyn DocumentHost,
    ) -> RuntimeResult<usize> {
        let discovered = discovery::discover(extensions_dir)?;
        let mut installed = 0;
        for package in discovered {
            let path = package.source.path().to_path_buf();
            match self.install(&path, host) {
                Ok(_) => installed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "failed to install extension"),
            }
        }
        info!(count = installed, "installed extensions from directory");
        Ok(installed)
    }

    fn check_manifest(&self, manifest: &ExtensionManifest) -> RuntimeResult<()> {
        let registered: Vec<String> = self.extensions.keys().cloned().collect();
        let enabled: BTreeMap<String, Version> = self
            .extensions
            .values()
            .filter(|i| i.enabled)
            .map(|i| (i.id().to_string(), i.version()))
            .collect();
        validate_for_install(manifest, self.host_api, &registered, &enabled)
    }

    /// Enable a disabled extension and run its `on_enable` hook. A hook
    /// failure rolls the extension back to disabled.
    pub fn enable(&mut self, id: &str, host: &mut dyn DocumentHost) -> RuntimeResult<()> {
        let Self {
            extensions, events, ..
        } = self;
        let instance = extensions
            .get_mut(id)
            .ok_or_else(|| RuntimeError::ExtensionNotFound(id.to_string()))?;
        if instance.enabled {
            return Ok(());
        }

        instance.session.resume()?;
        instance.enabled = true;
        if let Err(e) = Self::run_hook(instance, ON_ENABLE, host, events) {
            instance.enabled = false;
            instance.session.suspend()?;
            return Err(e);
        }

        info!(extension = id, "enabled extension");
        let _ = events.send(RegistryEvent::Enabled { id: id.to_string() });
        Ok(())
    }

    /// Disable an extension. Idempotent: disabling a disabled extension
    /// is a no-op. The `on_disable` hook is best-effort.
    pub fn disable(&mut self, id: &str, host: &mut dyn DocumentHost) -> RuntimeResult<()> {
        let Self {
            extensions, events, ..
        } = self;
        let instance = extensions
            .get_mut(id)
            .ok_or_else(|| RuntimeError::ExtensionNotFound(id.to_string()))?;
        if !instance.enabled {
            return Ok(());
        }

        Self::run_hook_best_effort(instance, ON_DISABLE, host, events);
        instance.session.suspend()?;
        instance.enabled = false;

        info!(extension = id, "disabled extension");
        let _ = events.send(RegistryEvent::Disabled {
            id: id.to_string(),
            reason: DisableReason::Requested,
        });
        Ok(())
    }

    /// Uninstall an extension: best-effort `on_disable` and `on_unload`,
    /// terminate the session, drop the instance. Staged files are removed
    /// last, after the session that used them is gone.
    pub fn uninstall(&mut self, id: &str, host: &mut dyn DocumentHost) -> RuntimeResult<()> {
        let mut instance = self
            .extensions
            .remove(id)
            .ok_or_else(|| RuntimeError::ExtensionNotFound(id.to_string()))?;

        if instance.enabled {
            Self::run_hook_best_effort(&mut instance, ON_DISABLE, host, &self.events);
            instance.enabled = false;
        }
        if instance.session.state() == SessionState::Suspended {
            let _ = instance.session.resume();
        }
        Self::run_hook_best_effort(&mut instance, ON_UNLOAD, host, &self.events);
        instance.session.terminate();

        info!(extension = id, "uninstalled extension");
        let _ = self
            .events
            .send(RegistryEvent::Uninstalled { id: id.to_string() });
        drop(instance);
        Ok(())
    }

    /// Call a function in an enabled extension.
    ///
    /// Faults are recorded against the extension; when the breaker trips
    /// the extension is auto-disabled and the original error is still
    /// returned to the caller.
    pub fn call(
        &mut self,
        id: &str,
        function: &str,
        args: Vec<Value>,
        host: &mut dyn DocumentHost,
    ) -> RuntimeResult<Value> {
        let Self {
            extensions, events, ..
        } = self;
        let instance = extensions
            .get_mut(id)
            .ok_or_else(|| RuntimeError::ExtensionNotFound(id.to_string()))?;
        if !instance.enabled {
            return Err(RuntimeError::ExtensionDisabled(id.to_string()));
        }

        let result = Self::dispatch(instance, function, args, host);

        if let Err(e) = &result {
            if fault::is_fault_error(e) {
                warn!(extension = id, function, error = %e, "extension fault");
                let tripped = instance.faults.record(function, &e.to_string());
                let _ = events.send(RegistryEvent::Fault {
                    id: id.to_string(),
                    operation: function.to_string(),
                });
                if tripped {
                    // Skip on_disable: a faulting extension gets no more
                    // bytecode time.
                    instance.session.suspend()?;
                    instance.enabled = false;
                    warn!(
                        extension = id,
                        faults = instance.faults.recent_count(),
                        "circuit breaker tripped, extension disabled"
                    );
                    let _ = events.send(RegistryEvent::Disabled {
                        id: id.to_string(),
                        reason: DisableReason::CircuitBreaker,
                    });
                }
            }
        }

        result
    }

    fn dispatch(
        instance: &mut ExtensionInstance,
        function: &str,
        args: Vec<Value>,
        host: &mut dyn DocumentHost,
    ) -> RuntimeResult<Value> {
        marshal::check_args(&args)?;
        let ExtensionInstance {
            manifest,
            session,
            enforcer,
            exports,
            ..
        } = instance;
        let mut bridge =
            NativeBridge::new(manifest.id(), session.epoch(), enforcer, exports, host);
        session.call(function, args, &mut bridge)
    }

    /// Run a lifecycle hook. A hook that does not exist is a no-op.
    /// Interpreter faults inside hooks feed the same bookkeeping as
    /// regular calls: recorded against the instance and announced as a
    /// `Fault` event.
    fn run_hook(
        instance: &mut ExtensionInstance,
        hook: &str,
        host: &mut dyn DocumentHost,
        events: &broadcast::Sender<RegistryEvent>,
    ) -> RuntimeResult<()> {
        if !instance.session.has_function(hook) {
            return Ok(());
        }
        let result = Self::dispatch(instance, hook, vec![], host).map(|_| ());
        if let Err(e) = &result {
            if fault::is_fault_error(e) {
                warn!(extension = instance.id(), hook, error = %e, "lifecycle hook fault");
                instance.faults.record(hook, &e.to_string());
                let _ = events.send(RegistryEvent::Fault {
                    id: instance.id().to_string(),
                    operation: hook.to_string(),
                });
            }
        }
        result
    }

    fn run_hook_best_effort(
        instance: &mut ExtensionInstance,
        hook: &str,
        host: &mut dyn DocumentHost,
        events: &broadcast::Sender<RegistryEvent>,
    ) {
        if let Err(e) = Self::run_hook(instance, hook, host, events) {
            warn!(extension = instance.id(), hook, error = %e, "lifecycle hook failed");
        }
    }

    /// Run the export hook an enabled extension registered for `format`.
    /// When several extensions claim a format the lowest id wins.
    pub fn run_export(
        &mut self,
        format: &str,
        args: Vec<Value>,
        host: &mut dyn DocumentHost,
    ) -> RuntimeResult<Value> {
        let mut candidates: Vec<(&str, &str)> = self
            .extensions
            .values()
            .filter(|i| i.enabled)
            .filter_map(|i| i.exports.hook_for(format).map(|hook| (i.id(), hook)))
            .collect();
        candidates.sort();

        let (id, hook) = candidates.first().map(|(i, h)| (i.to_string(), h.to_string())).ok_or_else(|| {
            RuntimeError::ExtensionNotFound(format!("no enabled exporter for '{format}'"))
        })?;
        self.call(&id, &hook, args, host)
    }

    /// All formats with an enabled exporter, sorted.
    pub fn export_formats(&self) -> Vec<String> {
        let mut formats: Vec<String> = self
            .extensions
            .values()
            .filter(|i| i.enabled)
            .flat_map(|i| i.exports.formats().map(str::to_string))
            .collect();
        formats.sort();
        formats.dedup();
        formats
    }

    pub fn is_enabled(&self, id: &str) -> bool {
        self.extensions.get(id).is_some_and(|i| i.enabled)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.extensions.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&ExtensionInstance> {
        self.extensions.get(id)
    }

    /// Cancel token for an extension's in-flight call, for supervised
    /// timeouts.
    pub fn cancel_token(&self, id: &str) -> Option<quill_runtime::CancelToken> {
        self.extensions.get(id).map(|i| i.session.cancel_token())
    }

    pub fn count(&self) -> usize {
        self.extensions.len()
    }

    pub fn host_api(&self) -> Version {
        self.host_api
    }

    /// Status of every installed extension, sorted by id.
    pub fn list(&self) -> Vec<ExtensionInfo> {
        let mut infos: Vec<ExtensionInfo> =
            self.extensions.values().map(|i| i.info()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }
}
