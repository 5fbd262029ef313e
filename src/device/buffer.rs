//! Device-resident `f32` buffers.
//!
//! A [`DeviceBuffer`] borrows the session context that allocated it, so it
//! cannot outlive the session, and hands its allocation back to the backend
//! in `Drop`. Every early return in the invocation path therefore frees
//! whatever was allocated so far.

use std::mem::{self, ManuallyDrop};

use tracing::debug;

use super::ComputeBackend;
use crate::error::OffloadError;

pub struct DeviceBuffer<'s, B: ComputeBackend> {
    backend: &'s B,
    context: &'s B::Context,
    raw: ManuallyDrop<B::Buffer>,
    len: usize,
}

impl<'s, B: ComputeBackend> DeviceBuffer<'s, B> {
    /// Allocate room for `len` elements on the session's device.
    pub fn alloc(backend: &'s B, context: &'s B::Context, len: usize) -> Result<Self, OffloadError> {
        let raw = backend.alloc(context, len)?;
        debug!(
            backend = backend.name(),
            len,
            bytes = len * mem::size_of::<f32>(),
            "Allocated device buffer"
        );
        Ok(Self {
            backend,
            context,
            raw: ManuallyDrop::new(raw),
            len,
        })
    }

    /// Copy `src` into this buffer.
    pub fn upload(&mut self, src: &[f32]) -> Result<(), OffloadError> {
        if src.len() > self.len {
            return Err(OffloadError::Transfer {
                direction: "host_to_device",
                reason: format!("{} elements do not fit in {}", src.len(), self.len),
            });
        }
        self.backend.copy_to_device(self.context, src, &mut self.raw)
    }

    /// Copy this buffer back to a fresh host vector.
    pub fn download(&self) -> Result<Vec<f32>, OffloadError> {
        let mut host = vec![0.0f32; self.len];
        self.backend.copy_to_host(self.context, &self.raw, &mut host)?;
        Ok(host)
    }

    /// Size in bytes.
    pub fn byte_len(&self) -> usize {
        self.len * mem::size_of::<f32>()
    }

    pub(crate) fn raw(&self) -> &B::Buffer {
        &self.raw
    }

    pub(crate) fn raw_mut(&mut self) -> &mut B::Buffer {
        &mut self.raw
    }
}

impl<B: ComputeBackend> Drop for DeviceBuffer<'_, B> {
    fn drop(&mut self) {
        // SAFETY: `raw` is taken exactly once, here, and never touched again.
        let raw = unsafe { ManuallyDrop::take(&mut self.raw) };
        self.backend.free(self.context, raw);
        debug!(backend = self.backend.name(), len = self.len, "Freed device buffer");
    }
}
