//! Error type shared by every solver backend
//!
//! Construction and readback are the only fallible operations. Per-step
//! numeric edge cases are clamped inside the solvers and never surface here.

/// Errors raised while allocating, reading back or tearing down a solver.
#[derive(Debug, thiserror::Error)]
pub enum FluidError {
    #[error("Grid dimensions must be positive, got {width}x{height}")]
    InvalidGridSize { width: u32, height: u32 },

    #[error("Failed to allocate {what}: {reason}")]
    Allocation { what: String, reason: String },

    #[error("Field size {actual_width}x{actual_height} does not match grid {width}x{height}")]
    FieldSizeMismatch {
        width: u32,
        height: u32,
        actual_width: u32,
        actual_height: u32,
    },

    #[error("Field holds {actual} values but the grid has {expected} cells")]
    FieldLength { expected: usize, actual: usize },

    #[error("Solver resources have already been released")]
    Disposed,

    #[error("No suitable GPU adapter found: {0}")]
    NoAdapter(#[from] wgpu::RequestAdapterError),

    #[error("Failed to request GPU device: {0}")]
    DeviceRequest(#[from] wgpu::RequestDeviceError),

    #[error("Buffer mapping failed: {0}")]
    BufferMap(#[from] wgpu::BufferAsyncError),

    #[error("Device poll failed: {0}")]
    DevicePoll(#[from] wgpu::PollError),

    #[error("Readback channel closed before the buffer was mapped")]
    ReadbackCancelled,

    #[error("GPU adapter does not support {0}")]
    Unsupported(String),
}

impl FluidError {
    pub(crate) fn allocation(what: impl Into<String>, reason: impl ToString) -> Self {
        FluidError::Allocation {
            what: what.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T, E = FluidError> = std::result::Result<T, E>;
