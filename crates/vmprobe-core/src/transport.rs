//! Name-based rendezvous between hypervisor endpoints and sessions.
//!
//! A hypervisor makes itself reachable with [`Transport::publish`]; a
//! session finds it by name. At most one session holds the attachment
//! lease of an endpoint at a time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use log::{debug, info};
use vmprobe_protocol::Hypervisor;

use crate::error::{DebugError, Result, TransportError};

struct Endpoint {
    ticket: u64,
    backend: Arc<dyn Hypervisor>,
    attached: Arc<AtomicBool>,
}

static REGISTRY: OnceLock<Mutex<HashMap<String, Endpoint>>> = OnceLock::new();
static NEXT_TICKET: AtomicU64 = AtomicU64::new(1);

fn registry() -> MutexGuard<'static, HashMap<String, Endpoint>> {
    REGISTRY
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Process-wide endpoint directory.
pub struct Transport;

impl Transport {
    /// Make `backend` reachable under `name` until the returned
    /// [`Publication`] is dropped.
    pub fn publish(
        name: &str,
        backend: Arc<dyn Hypervisor>,
    ) -> std::result::Result<Publication, TransportError> {
        if name.is_empty() || name.contains('\0') {
            return Err(TransportError::InvalidArgument(name.to_string()));
        }
        let mut endpoints = registry();
        if endpoints.contains_key(name) {
            return Err(TransportError::AlreadyPublished {
                name: name.to_string(),
            });
        }
        let ticket = NEXT_TICKET.fetch_add(1, Ordering::Relaxed);
        endpoints.insert(
            name.to_string(),
            Endpoint {
                ticket,
                backend,
                attached: Arc::new(AtomicBool::new(false)),
            },
        );
        info!("VM {:?} published", name);
        Ok(Publication {
            name: name.to_string(),
            ticket,
        })
    }

    /// Names currently published, sorted.
    pub fn published() -> Vec<String> {
        let mut names: Vec<String> = registry().keys().cloned().collect();
        names.sort();
        names
    }

    /// Take the attachment lease of `name`.
    pub(crate) fn connect(name: &str) -> Result<(Arc<dyn Hypervisor>, Lease)> {
        let endpoints = registry();
        let endpoint = endpoints.get(name).ok_or_else(|| DebugError::NotFound {
            name: name.to_string(),
        })?;
        if endpoint
            .attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DebugError::PermissionDenied {
                name: name.to_string(),
            });
        }
        debug!("attachment lease on {:?} taken", name);
        Ok((
            Arc::clone(&endpoint.backend),
            Lease {
                attached: Arc::clone(&endpoint.attached),
            },
        ))
    }
}

/// Keeps an endpoint published. Dropping it withdraws the name; sessions
/// already attached keep working.
#[must_use = "dropping the publication withdraws the VM immediately"]
#[derive(Debug)]
pub struct Publication {
    name: String,
    ticket: u64,
}

impl Publication {
    /// Name the endpoint is published under.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Publication {
    fn drop(&mut self) {
        let mut endpoints = registry();
        if endpoints
            .get(&self.name)
            .is_some_and(|e| e.ticket == self.ticket)
        {
            endpoints.remove(&self.name);
            info!("VM {:?} withdrawn", self.name);
        }
    }
}

/// Exclusive attachment to one endpoint; released on drop.
pub(crate) struct Lease {
    attached: Arc<AtomicBool>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.attached.store(false, Ordering::Release);
    }
}
