//! Kernel invocation: copy in, launch, copy out.
//!
//! The sum is written into the right operand's device buffer, so only two
//! buffers are ever allocated per call. Both are [`DeviceBuffer`]s tied to
//! the session, which frees them on every return path.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::device::buffer::DeviceBuffer;
use crate::device::session::SessionGuard;
use crate::device::{ComputeBackend, LaunchGeometry};
use crate::error::OffloadError;

/// Result of one kernel invocation.
#[derive(Debug, Clone)]
pub struct KernelOutput {
    /// Element-wise sum.
    pub sum: Vec<f32>,

    /// Geometry the kernel was launched with.
    pub geometry: LaunchGeometry,

    /// Wall time from launch to synchronize returning.
    pub kernel_time: Duration,
}

/// Add `left` and `right` on the session's device.
pub fn run<B: ComputeBackend>(
    session: &SessionGuard<'_, B>,
    left: &[f32],
    right: &[f32],
) -> Result<KernelOutput, OffloadError> {
    if left.len() != right.len() {
        return Err(OffloadError::ShapeMismatch {
            left: left.len(),
            right: right.len(),
        });
    }
    let n = left.len();
    let count = i32::try_from(n).map_err(|_| {
        OffloadError::InvalidRequest(format!("{n} elements exceed the kernel's i32 count"))
    })?;

    let backend = session.backend();
    let context = session.context();

    let mut x = DeviceBuffer::alloc(backend, context, n)?;
    let mut y = DeviceBuffer::alloc(backend, context, n)?;
    x.upload(left)?;
    y.upload(right)?;

    let geometry = LaunchGeometry::for_len(n, session.kernel().block_size);
    debug!(
        session = session.id(),
        n,
        grid = geometry.grid,
        block = geometry.block,
        bytes = x.byte_len() + y.byte_len(),
        "Launching kernel"
    );

    let start = Instant::now();
    backend.launch(context, geometry, count, x.raw(), y.raw_mut())?;
    backend.synchronize(context)?;
    let kernel_time = start.elapsed();

    // `y` now holds x + y.
    let sum_buf = y;
    let sum = sum_buf.download()?;

    Ok(KernelOutput {
        sum,
        geometry,
        kernel_time,
    })
}
