//! Blocking readback of GPU data into host memory

use crate::error::{FluidError, Result};
use wgpu::{Buffer, Device};

pub(crate) fn staging_buffer(device: &Device, label: &str, bytes: u64) -> Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: bytes,
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    })
}

/// Map a staging buffer whose copy has been submitted and read it as `T`s
///
/// Blocks until the device has finished every submitted command.
pub(crate) fn read_staging<T: bytemuck::Pod>(device: &Device, staging: &Buffer) -> Result<Vec<T>> {
    let slice = staging.slice(..);
    let (sender, receiver) = futures::channel::oneshot::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        // The receiver only disappears if the caller already gave up
        let _ = sender.send(result);
    });

    device.poll(wgpu::PollType::Wait)?;
    futures::executor::block_on(receiver).map_err(|_| FluidError::ReadbackCancelled)??;

    let values = {
        let mapped = slice.get_mapped_range();
        bytemuck::cast_slice(&mapped).to_vec()
    };
    staging.unmap();
    Ok(values)
}
