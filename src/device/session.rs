//! Device session lifecycle.
//!
//! A session is one execution context on one device with the kernel module
//! loaded and the entry point resolved. [`SessionManager::acquire`] hands a
//! session out wrapped in a [`SessionGuard`]; dropping the guard releases it.
//! Release either destroys the context (default) or parks it in an idle pool
//! for the next request. A pooled session is owned by exactly one guard at a
//! time, so two requests never launch on the same context concurrently.

use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{ComputeBackend, KernelSpec};
use crate::error::OffloadError;

/// A live context on a device.
pub struct DeviceSession<C> {
    id: u64,
    device: usize,
    context: C,
}

impl<C> DeviceSession<C> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device(&self) -> usize {
        self.device
    }

    pub fn context(&self) -> &C {
        &self.context
    }
}

/// Lifecycle counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Successful `acquire` calls.
    pub acquired: u64,

    /// Guards dropped.
    pub released: u64,

    /// Contexts created on the device.
    pub created: u64,

    /// Contexts destroyed on the device.
    pub destroyed: u64,
}

impl SessionStats {
    /// Sessions currently checked out by requests.
    pub fn in_use(&self) -> u64 {
        self.acquired - self.released
    }

    /// Contexts alive on the device, in use or idle.
    pub fn resident(&self) -> u64 {
        self.created - self.destroyed
    }
}

#[derive(Default)]
struct Counters {
    acquired: AtomicU64,
    released: AtomicU64,
    created: AtomicU64,
    destroyed: AtomicU64,
}

/// Hands out device sessions for one device index.
pub struct SessionManager<B: ComputeBackend> {
    backend: Arc<B>,
    device: usize,
    kernel: KernelSpec,

    /// Idle sessions when pooling is enabled.
    pool: Option<Mutex<Vec<DeviceSession<B::Context>>>>,

    next_id: AtomicU64,
    counters: Counters,
}

impl<B: ComputeBackend> SessionManager<B> {
    /// Session-per-request manager.
    pub fn new(backend: Arc<B>, device: usize, kernel: KernelSpec) -> Self {
        Self::build(backend, device, kernel, None)
    }

    /// Manager that keeps released sessions for reuse.
    pub fn pooled(backend: Arc<B>, device: usize, kernel: KernelSpec) -> Self {
        Self::build(backend, device, kernel, Some(Mutex::new(Vec::new())))
    }

    fn build(
        backend: Arc<B>,
        device: usize,
        kernel: KernelSpec,
        pool: Option<Mutex<Vec<DeviceSession<B::Context>>>>,
    ) -> Self {
        Self {
            backend,
            device,
            kernel,
            pool,
            next_id: AtomicU64::new(1),
            counters: Counters::default(),
        }
    }

    /// Get a live session, reusing an idle one when pooling.
    ///
    /// The driver is initialized on first use; later calls only check the
    /// one-time init result.
    pub fn acquire(&self) -> Result<SessionGuard<'_, B>, OffloadError> {
        if let Some(session) = self.pool.as_ref().and_then(|pool| pool.lock().pop()) {
            self.counters.acquired.fetch_add(1, Ordering::Relaxed);
            debug!(session = session.id, device = self.device, "Reusing pooled session");
            return Ok(SessionGuard::new(self, session));
        }

        self.backend.init()?;
        let context = self.backend.create_context(self.device, &self.kernel)?;
        let session = DeviceSession {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            device: self.device,
            context,
        };
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        self.counters.acquired.fetch_add(1, Ordering::Relaxed);

        debug!(
            session = session.id,
            device = self.device,
            backend = self.backend.name(),
            entry_point = %self.kernel.entry_point,
            "Created device session"
        );
        Ok(SessionGuard::new(self, session))
    }

    /// Return a session. Called from [`SessionGuard`]'s `Drop`.
    fn release(&self, session: DeviceSession<B::Context>) {
        self.counters.released.fetch_add(1, Ordering::Relaxed);
        match &self.pool {
            Some(pool) => {
                debug!(session = session.id, "Parked session in pool");
                pool.lock().push(session);
            }
            None => self.destroy(session),
        }
    }

    fn destroy(&self, session: DeviceSession<B::Context>) {
        let id = session.id;
        self.backend.destroy_context(session.context);
        self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
        debug!(session = id, device = self.device, "Destroyed device session");
    }

    /// Destroy every idle pooled session. Sessions still checked out go back
    /// to the pool when released and are destroyed by the manager's `Drop`.
    pub fn shutdown(&self) {
        let Some(pool) = &self.pool else {
            return;
        };
        let idle: Vec<_> = pool.lock().drain(..).collect();
        let count = idle.len();
        for session in idle {
            self.destroy(session);
        }
        let stats = self.stats();
        if stats.in_use() > 0 {
            warn!(in_use = stats.in_use(), "Shutting down with sessions still checked out");
        }
        info!(destroyed = count, device = self.device, "Session pool drained");
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            acquired: self.counters.acquired.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            created: self.counters.created.load(Ordering::Relaxed),
            destroyed: self.counters.destroyed.load(Ordering::Relaxed),
        }
    }

    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }

    pub fn device(&self) -> usize {
        self.device
    }

    pub fn kernel(&self) -> &KernelSpec {
        &self.kernel
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

impl<B: ComputeBackend> Drop for SessionManager<B> {
    fn drop(&mut self) {
        if let Some(pool) = &self.pool {
            for session in pool.lock().drain(..) {
                self.backend.destroy_context(session.context);
                self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Exclusive handle on a session; releases it on drop.
pub struct SessionGuard<'m, B: ComputeBackend> {
    manager: &'m SessionManager<B>,
    session: ManuallyDrop<DeviceSession<B::Context>>,
}

impl<'m, B: ComputeBackend> SessionGuard<'m, B> {
    fn new(manager: &'m SessionManager<B>, session: DeviceSession<B::Context>) -> Self {
        Self {
            manager,
            session: ManuallyDrop::new(session),
        }
    }

    pub fn id(&self) -> u64 {
        self.session.id
    }

    pub fn device(&self) -> usize {
        self.session.device
    }

    pub fn context(&self) -> &B::Context {
        &self.session.context
    }

    pub fn backend(&self) -> &'m B {
        &self.manager.backend
    }

    pub fn kernel(&self) -> &'m KernelSpec {
        &self.manager.kernel
    }

    /// Release now instead of at end of scope.
    pub fn release(self) {
        drop(self);
    }
}

impl<B: ComputeBackend> Drop for SessionGuard<'_, B> {
    fn drop(&mut self) {
        // SAFETY: `session` is taken exactly once, here, and never touched again.
        let session = unsafe { ManuallyDrop::take(&mut self.session) };
        self.manager.release(session);
    }
}
