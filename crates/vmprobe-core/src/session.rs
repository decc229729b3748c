//! Sessions: the caller's handle on one named VM.
//!
//! ```text
//!   Session::open(name) ──► init() ──► ... operations ... ──► close()
//!        │                    │                                 │
//!        └ attachment lease   └ exit handler attached           └ breakpoints removed,
//!                                                                 handler detached,
//!                                                                 lease released
//! ```
//!
//! Operations are spread over the component modules as further
//! `impl Session` blocks: [`registers`](crate::registers),
//! [`memory`](crate::memory), [`breakpoints`](crate::breakpoints),
//! [`execution`](crate::execution), [`snapshot`](crate::snapshot) and
//! [`monitor`](crate::monitor).
//!
//! # Locking
//!
//! The breakpoint table mutex is the session's program lock. Anything
//! that must be consistent with the set of armed breakpoints (memory
//! transfers, stepping, snapshots) holds it across its backend calls. The
//! armed view is taken only briefly and never across a backend call, so
//! the backend's execution lock (held while it runs the exit handler,
//! which reads the view) can never be waited on while the view is held.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use log::{info, warn};
use vmprobe_protocol::{ExitHandler, Hypervisor, StateFlags, MAX_BREAKPOINTS};

use crate::breakpoints::BreakpointTable;
use crate::error::{DebugError, Result};
use crate::exits::{ArmedView, ExitRouter};
use crate::snapshot::SavedSlots;
use crate::transport::{Lease, Transport};

/// Per-session tunables.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Size of the breakpoint table, `1..=255`.
    pub breakpoint_capacity: usize,
    /// On `resume()`, first step a vCPU still parked on the breakpoint it
    /// stopped at, so the same hit is not reported again.
    pub step_over_on_resume: bool,
    /// Sleep between polls in [`Session::wait_for_state_change`].
    pub poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            breakpoint_capacity: MAX_BREAKPOINTS,
            step_over_on_resume: true,
            poll_interval: Duration::from_millis(1),
        }
    }
}

/// Facts about the VM fixed at `init()`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Geometry {
    pub(crate) cpu_count: u32,
    pub(crate) memory_size: u64,
}

/// A debugging session attached to one VM.
///
/// `Session` is `Send + Sync`; its methods may be called from several
/// threads at once. Dropping it closes it.
pub struct Session {
    name: String,
    config: SessionConfig,
    pub(crate) backend: Arc<dyn Hypervisor>,
    pub(crate) exits: Arc<ExitRouter>,
    pub(crate) table: Mutex<BreakpointTable>,
    pub(crate) saved: Mutex<Option<SavedSlots>>,
    lease: Mutex<Option<Lease>>,
    geometry: OnceLock<Geometry>,
    closed: AtomicBool,
}

impl Session {
    /// Attach to the VM published as `name` with the default config.
    ///
    /// # Errors
    ///
    /// - [`DebugError::NotFound`] if nothing is published under `name`.
    /// - [`DebugError::PermissionDenied`] if another session is attached.
    pub fn open(name: &str) -> Result<Self> {
        Self::open_with(name, SessionConfig::default())
    }

    /// Attach to the VM published as `name`.
    pub fn open_with(name: &str, config: SessionConfig) -> Result<Self> {
        if !(1..=MAX_BREAKPOINTS).contains(&config.breakpoint_capacity) {
            return Err(DebugError::InvalidArgument(format!(
                "breakpoint capacity must be 1..={}, got {}",
                MAX_BREAKPOINTS, config.breakpoint_capacity
            )));
        }
        let (backend, lease) = Transport::connect(name)?;
        info!("Session opened on {:?}", name);
        Ok(Self {
            name: name.to_string(),
            table: Mutex::new(BreakpointTable::new(config.breakpoint_capacity)),
            config,
            backend,
            exits: Arc::new(ExitRouter::new()),
            saved: Mutex::new(None),
            lease: Mutex::new(Some(lease)),
            geometry: OnceLock::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// One-time handshake with the hypervisor: registers the exit handler
    /// and reads the VM geometry.
    ///
    /// A backend failure here is fatal: the session is closed and every
    /// later call fails with [`DebugError::Closed`].
    pub fn init(&self) -> Result<()> {
        // The table lock serializes concurrent init calls.
        let _table = self.lock_table();
        if self.closed.load(Ordering::Acquire) {
            return Err(DebugError::Closed);
        }
        if self.geometry.get().is_some() {
            return Err(DebugError::AlreadyInitialized);
        }

        let handler: Arc<dyn ExitHandler> = Arc::clone(&self.exits) as Arc<dyn ExitHandler>;
        if let Err(err) = self.backend.attach(handler) {
            warn!("Session on {:?} failed to initialize: {}", self.name, err);
            self.closed.store(true, Ordering::Release);
            self.release_lease();
            return Err(DebugError::BackendUnavailable(err));
        }

        let geometry = Geometry {
            cpu_count: self.backend.cpu_count(),
            memory_size: self.backend.physical_memory_size(),
        };
        *self.exits.view_mut() = ArmedView::with_vcpus(geometry.cpu_count);
        let initial = if self.backend.is_paused() {
            StateFlags::PAUSED
        } else {
            StateFlags::RUNNING
        };
        self.exits.monitor.reset(initial);
        let _ = self.geometry.set(geometry);

        info!(
            "Session on {:?} initialized: {} vCPUs, {} MB, state {}",
            self.name,
            geometry.cpu_count,
            geometry.memory_size / (1024 * 1024),
            initial,
        );
        Ok(())
    }

    /// Remove every breakpoint still set, detach from the hypervisor and
    /// release the VM for other sessions. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.geometry.get().is_some() {
            let mut table = self.lock_table();
            if let Err(err) = self.clear_locked(&mut table) {
                warn!("Session on {:?}: breakpoint cleanup failed: {}", self.name, err);
            }
            self.backend.detach();
        }
        self.release_lease();
        info!("Session on {:?} closed", self.name);
    }

    /// Name of the attached VM.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Number of vCPUs of the VM.
    pub fn cpu_count(&self) -> Result<u32> {
        Ok(self.ready()?.cpu_count)
    }

    /// Size of guest physical memory in bytes.
    pub fn physical_memory_size(&self) -> Result<u64> {
        Ok(self.ready()?.memory_size)
    }

    fn release_lease(&self) {
        self.lease
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Geometry of an open, initialized session.
    pub(crate) fn ready(&self) -> Result<Geometry> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DebugError::Closed);
        }
        self.geometry.get().copied().ok_or(DebugError::NotInitialized)
    }

    /// Like [`ready`](Self::ready), also checking the vCPU index.
    pub(crate) fn check_vcpu(&self, vcpu: u32) -> Result<Geometry> {
        let geometry = self.ready()?;
        if vcpu >= geometry.cpu_count {
            return Err(DebugError::InvalidArgument(format!(
                "vCPU {} out of range (cpu count {})",
                vcpu, geometry.cpu_count
            )));
        }
        Ok(geometry)
    }

    pub(crate) fn lock_table(&self) -> MutexGuard<'_, BreakpointTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{publish_sim, sim_config};
    use vmprobe_sim::SimConfig;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn session_is_shareable() {
        assert_send_sync::<Session>();
    }

    #[test]
    fn operations_require_init() {
        let (_vm, _publication) = publish_sim("session-uninit", sim_config());
        let session = Session::open("session-uninit").unwrap();
        assert!(matches!(session.cpu_count(), Err(DebugError::NotInitialized)));
        assert!(matches!(session.pause(), Err(DebugError::NotInitialized)));
        session.init().unwrap();
        assert_eq!(session.cpu_count().unwrap(), 2);
        assert!(matches!(session.init(), Err(DebugError::AlreadyInitialized)));
    }

    #[test]
    fn one_debugger_per_vm() {
        let (_vm, _publication) = publish_sim("session-exclusive", sim_config());
        let first = Session::open("session-exclusive").unwrap();
        assert!(matches!(
            Session::open("session-exclusive"),
            Err(DebugError::PermissionDenied { .. })
        ));
        first.close();
        let second = Session::open("session-exclusive").unwrap();
        second.init().unwrap();
    }

    #[test]
    fn unknown_vm_is_not_found() {
        assert!(matches!(
            Session::open("session-no-such-vm"),
            Err(DebugError::NotFound { .. })
        ));
    }

    #[test]
    fn close_is_idempotent_and_final() {
        let (_vm, _publication) = publish_sim("session-close", sim_config());
        let session = Session::open("session-close").unwrap();
        session.init().unwrap();
        session.close();
        session.close();
        assert!(matches!(session.get_state(), Err(DebugError::Closed)));
        assert!(matches!(session.init(), Err(DebugError::Closed)));
    }

    #[test]
    fn capacity_must_be_in_range() {
        let (_vm, _publication) = publish_sim("session-capacity", sim_config());
        for capacity in [0, MAX_BREAKPOINTS + 1] {
            let config = SessionConfig {
                breakpoint_capacity: capacity,
                ..Default::default()
            };
            assert!(matches!(
                Session::open_with("session-capacity", config),
                Err(DebugError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn init_reports_geometry_and_state() {
        let config = SimConfig {
            vcpus: 3,
            memory_size: 8 << 20,
            start_paused: true,
            ..Default::default()
        };
        let (_vm, _publication) = publish_sim("session-geometry", config);
        let session = Session::open("session-geometry").unwrap();
        session.init().unwrap();
        assert_eq!(session.cpu_count().unwrap(), 3);
        assert_eq!(session.physical_memory_size().unwrap(), 8 << 20);
        assert_eq!(session.get_state().unwrap(), StateFlags::PAUSED);
        assert!(!session.get_state_changed().unwrap());
        assert_eq!(session.name(), "session-geometry");
    }
}
