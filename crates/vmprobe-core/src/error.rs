//! Error types of the debug core.

use thiserror::Error;
use vmprobe_protocol::BackendError;

/// Errors returned by [`Session`](crate::Session) operations.
#[derive(Error, Debug)]
pub enum DebugError {
    /// No VM is published under the requested name.
    #[error("no VM named {name:?} is published")]
    NotFound { name: String },

    /// Another session is already attached to the VM.
    #[error("VM {name:?} already has a debugger attached")]
    PermissionDenied { name: String },

    /// `init()` has not completed on this session.
    #[error("session is not initialized")]
    NotInitialized,

    /// `init()` was called twice.
    #[error("session is already initialized")]
    AlreadyInitialized,

    /// The session was closed, or its initialization failed.
    #[error("session is closed")]
    Closed,

    /// A caller-supplied argument is malformed or out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No free breakpoint or debug-register slot is left.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// A guest-virtual page is not present.
    #[error("virtual address {address:#x} is not mapped")]
    Unmapped { address: u64 },

    /// A physical range lies (partly) outside guest memory.
    #[error("physical range {address:#x}+{len:#x} is outside guest memory")]
    OutOfRange { address: u64, len: usize },

    /// A transfer failed after part of it had been applied.
    #[error("memory transfer at {address:#x} faulted after {done} of {len} bytes")]
    PartialFault {
        address: u64,
        done: usize,
        len: usize,
        #[source]
        source: BackendError,
    },

    /// `restore()` before any `save()`.
    #[error("no snapshot has been saved")]
    NoSnapshot,

    /// The operation requires a paused VM.
    #[error("operation requires the VM to be paused")]
    NotPaused,

    /// The hypervisor backend failed.
    #[error("hypervisor backend unavailable: {0}")]
    BackendUnavailable(#[source] BackendError),
}

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, DebugError>;

impl From<BackendError> for DebugError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::InvalidVcpu { vcpu } => {
                DebugError::InvalidArgument(format!("no such vCPU {vcpu}"))
            }
            BackendError::UnsupportedRegister { register } => {
                DebugError::InvalidArgument(format!("register {register:?} is not supported"))
            }
            err @ BackendError::RegisterWidth { .. } => {
                DebugError::InvalidArgument(err.to_string())
            }
            BackendError::UnknownMsr { index } => {
                DebugError::InvalidArgument(format!("MSR {index:#x} is not supported"))
            }
            BackendError::PhysicalRange { address, len } => DebugError::OutOfRange { address, len },
            BackendError::NotPaused => DebugError::NotPaused,
            BackendError::NoSavedState => DebugError::NoSnapshot,
            other => DebugError::BackendUnavailable(other),
        }
    }
}

/// Errors publishing a hypervisor endpoint.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The name is empty or contains a NUL byte.
    #[error("invalid VM name {0:?}")]
    InvalidArgument(String),

    /// Another endpoint already uses the name.
    #[error("a VM named {name:?} is already published")]
    AlreadyPublished { name: String },
}
