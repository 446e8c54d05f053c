//! Supervised access to the extension registry.
//!
//! The registry and document live behind async locks; every registry
//! operation runs on a blocking worker so bytecode execution never stalls
//! the async runtime. Extension calls additionally run under a wall-clock
//! timeout: on overrun the VM's cancel token is tripped, the interpreter
//! bails at its next instruction, and the resulting fault is recorded
//! against the extension like any other.

use crate::config::Config;
use crate::document::{Document, HostAdapter, HostIo};
use quill_plugin_api::{
    DocumentHost, ExtensionInfo, ExtensionRegistry, FaultPolicy, RegistryEvent,
};
use quill_runtime::{RuntimeError, RuntimeResult, TrustedKeys, Value, Version};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::warn;

/// Extension API version this host exposes.
pub const HOST_API_VERSION: Version = Version::new(1, 2, 0);

/// Async supervisor over the registry and the document.
pub struct ExtensionManager {
    registry: Arc<Mutex<ExtensionRegistry>>,
    document: Arc<RwLock<Document>>,
    io: HostIo,
    call_timeout: Duration,
}

impl ExtensionManager {
    /// Build a manager from host configuration.
    pub fn from_config(config: &Config, document: Document) -> RuntimeResult<Self> {
        let mut trusted = TrustedKeys::new();
        for (key_id, encoded) in &config.extensions.trusted_keys {
            trusted.add_base64(key_id.clone(), encoded)?;
        }

        let registry = ExtensionRegistry::new(HOST_API_VERSION, config.staging_dir())
            .with_trusted_keys(trusted)
            .with_signature_required(config.extensions.require_signatures)
            .with_instruction_budget(config.extensions.instruction_budget)
            .with_max_unpacked_bytes(config.max_unpacked_bytes())
            .with_fault_policy(FaultPolicy {
                max_faults: config.extensions.max_faults,
                window: config.fault_window(),
            });

        let workspace = config
            .host
            .workspace_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            registry: Arc::new(Mutex::new(registry)),
            document: Arc::new(RwLock::new(document)),
            io: HostIo::new(workspace, config.host.allow_network),
            call_timeout: config.call_timeout(),
        })
    }

    /// Run a closure against the registry on a blocking worker, with the
    /// document write-locked for the duration.
    async fn with_registry<F, T>(&self, f: F) -> RuntimeResult<T>
    where
        F: FnOnce(&mut ExtensionRegistry, &mut dyn DocumentHost) -> RuntimeResult<T>
            + Send
            + 'static,
        T: Send + 'static,
    {
        let registry = Arc::clone(&self.registry);
        let document = Arc::clone(&self.document);
        let io = self.io.clone();
        tokio::task::spawn_blocking(move || {
            let mut registry = registry.blocking_lock();
            let mut document = document.blocking_write();
            let mut host = HostAdapter::new(&mut document, &io);
            f(&mut registry, &mut host)
        })
        .await
        .map_err(|e| RuntimeError::ExecutionFault(format!("host worker panicked: {e}")))?
    }

    /// Install an extension from a package or directory.
    pub async fn install(&self, path: &Path) -> RuntimeResult<String> {
        let path = path.to_path_buf();
        self.with_registry(move |registry, host| registry.install(&path, host))
            .await
    }

    /// Install everything under an extensions directory.
    pub async fn discover_and_install(&self, extensions_dir: &Path) -> RuntimeResult<usize> {
        let dir = extensions_dir.to_path_buf();
        self.with_registry(move |registry, host| registry.discover_and_install(&dir, host))
            .await
    }

    /// Call a function in an extension under the configured timeout.
    ///
    /// On timeout the in-flight call is cooperatively cancelled; the
    /// interpreter records the cancellation as a fault when it bails.
    pub async fn call(&self, id: &str, function: &str, args: Vec<Value>) -> RuntimeResult<Value> {
        let cancel = { self.registry.lock().await.cancel_token(id) };
        let owned_id = id.to_string();
        let owned_function = function.to_string();
        let work =
            self.with_registry(move |registry, host| registry.call(&owned_id, &owned_function, args, host));

        match tokio::time::timeout(self.call_timeout, work).await {
            Ok(result) => result,
            Err(_) => {
                if let Some(token) = cancel {
                    token.cancel();
                }
                warn!(extension = id, function, timeout = ?self.call_timeout, "extension call timed out");
                Err(RuntimeError::ExecutionFault(format!(
                    "call '{function}' timed out after {:?}",
                    self.call_timeout
                )))
            }
        }
    }

    /// Run the registered exporter for a format, under the call timeout.
    pub async fn run_export(&self, format: &str, args: Vec<Value>) -> RuntimeResult<Value> {
        let owned_format = format.to_string();
        let work =
            self.with_registry(move |registry, host| registry.run_export(&owned_format, args, host));
        match tokio::time::timeout(self.call_timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::ExecutionFault(format!(
                "export '{format}' timed out after {:?}",
                self.call_timeout
            ))),
        }
    }

    pub async fn enable(&self, id: &str) -> RuntimeResult<()> {
        let id = id.to_string();
        self.with_registry(move |registry, host| registry.enable(&id, host))
            .await
    }

    pub async fn disable(&self, id: &str) -> RuntimeResult<()> {
        let id = id.to_string();
        self.with_registry(move |registry, host| registry.disable(&id, host))
            .await
    }

    pub async fn uninstall(&self, id: &str) -> RuntimeResult<()> {
        let id = id.to_string();
        self.with_registry(move |registry, host| registry.uninstall(&id, host))
            .await
    }

    pub async fn is_enabled(&self, id: &str) -> bool {
        self.registry.lock().await.is_enabled(id)
    }

    pub async fn list(&self) -> Vec<ExtensionInfo> {
        self.registry.lock().await.list()
    }

    pub async fn export_formats(&self) -> Vec<String> {
        self.registry.lock().await.export_formats()
    }

    /// Subscribe to registry lifecycle events.
    pub async fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.registry.lock().await.subscribe()
    }

    /// Snapshot of the current document.
    pub async fn document(&self) -> Document {
        self.document.read().await.clone()
    }
}
