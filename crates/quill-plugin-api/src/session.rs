//! Interpreter session lifecycle.
//!
//! One session per installed extension, wrapping its VM. The lifecycle is
//! Created -> Initialized -> Running <-> Suspended -> Terminated, with
//! Terminated absorbing: nothing revives a terminated session. A session
//! that has faulted keeps running (the fault tracker decides when to pull
//! the plug); the `failed` flag only records that at least one call
//! faulted.
//!
//! Each session owns a unique handle epoch. Handles minted through the
//! bridge carry it, and terminating the session retires the epoch so any
//! outstanding handle is permanently invalid.

use quill_runtime::vm::{CancelToken, HostCalls, Vm};
use quill_runtime::{Bytecode, BytecodeLoader, RuntimeError, RuntimeResult, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

static NEXT_EPOCH: AtomicU32 = AtomicU32::new(1);

fn next_epoch() -> u32 {
    NEXT_EPOCH.fetch_add(1, Ordering::Relaxed)
}

/// Lifecycle state of an interpreter session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Initialized,
    Running,
    Suspended,
    Terminated,
}

/// A live interpreter for one installed extension.
pub struct InterpreterSession {
    extension_id: String,
    state: SessionState,
    failed: bool,
    epoch: u32,
    vm: Vm,
}

impl InterpreterSession {
    /// Create a session over bytecode. The bytecode is validated here;
    /// nothing executes until [`InterpreterSession::call`].
    pub fn new(
        extension_id: impl Into<String>,
        bytecode: Bytecode,
        instruction_budget: u64,
    ) -> RuntimeResult<Self> {
        BytecodeLoader::validate(&bytecode)?;
        let extension_id = extension_id.into();
        let epoch = next_epoch();
        debug!(extension = %extension_id, epoch, "created interpreter session");
        Ok(Self {
            extension_id,
            state: SessionState::Created,
            failed: false,
            epoch,
            vm: Vm::new(bytecode, instruction_budget, CancelToken::new()),
        })
    }

    /// Move Created -> Initialized.
    pub fn initialize(&mut self) -> RuntimeResult<()> {
        match self.state {
            SessionState::Created => {
                self.state = SessionState::Initialized;
                Ok(())
            }
            SessionState::Terminated => Err(RuntimeError::SessionClosed),
            _ => Ok(()),
        }
    }

    /// Call a function in the session's bytecode.
    pub fn call(
        &mut self,
        function: &str,
        args: Vec<Value>,
        host: &mut dyn HostCalls,
    ) -> RuntimeResult<Value> {
        match self.state {
            SessionState::Terminated => return Err(RuntimeError::SessionClosed),
            SessionState::Suspended => {
                return Err(RuntimeError::ExtensionDisabled(self.extension_id.clone()))
            }
            SessionState::Created => {
                return Err(RuntimeError::ExecutionFault(
                    "session has not been initialized".to_string(),
                ))
            }
            SessionState::Initialized | SessionState::Running => {}
        }

        self.state = SessionState::Running;
        let result = self.vm.call(function, args, host);
        if let Err(e) = &result {
            if crate::fault::is_fault_error(e) {
                self.failed = true;
            }
        }
        result
    }

    /// Suspend the session; calls are rejected until resumed.
    pub fn suspend(&mut self) -> RuntimeResult<()> {
        match self.state {
            SessionState::Terminated => Err(RuntimeError::SessionClosed),
            _ => {
                self.state = SessionState::Suspended;
                Ok(())
            }
        }
    }

    /// Resume a suspended session.
    pub fn resume(&mut self) -> RuntimeResult<()> {
        match self.state {
            SessionState::Terminated => Err(RuntimeError::SessionClosed),
            SessionState::Suspended => {
                self.state = SessionState::Running;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Terminate the session. Absorbing: cancels any in-flight call and
    /// retires the handle epoch.
    pub fn terminate(&mut self) {
        if self.state == SessionState::Terminated {
            return;
        }
        self.vm.cancel_token().cancel();
        self.epoch = next_epoch();
        self.state = SessionState::Terminated;
        debug!(extension = %self.extension_id, "terminated interpreter session");
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether any call on this session has faulted.
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Current handle epoch; handles minted under an older epoch never
    /// validate.
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Token a supervising task can trip to abort the in-flight call.
    pub fn cancel_token(&self) -> CancelToken {
        self.vm.cancel_token()
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.vm.has_function(name)
    }

    pub fn extension_id(&self) -> &str {
        &self.extension_id
    }
}
