//! wgpu buffer allocation and blocking readback.

use std::sync::Arc;

use crate::error::SystemError;

/// Minimum buffer size (wgpu requires non-zero buffers).
const MIN_BUF_SIZE: u64 = 4;

/// Storage buffer of 32-bit words on the GPU.
#[derive(Debug, Clone)]
pub struct GpuBuffer {
    buffer: Arc<wgpu::Buffer>,
    words: usize,
}

impl GpuBuffer {
    /// Underlying wgpu buffer.
    pub fn raw(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    /// Capacity in words.
    pub fn words(&self) -> usize {
        self.words
    }

    fn byte_len(words: usize) -> u64 {
        (words as u64 * 4).max(MIN_BUF_SIZE)
    }
}

/// Zeroed storage buffer of `words` words.
pub(crate) fn create_storage_buf(device: &wgpu::Device, label: &str, words: usize) -> GpuBuffer {
    let buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: GpuBuffer::byte_len(words),
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    GpuBuffer {
        buffer: Arc::new(buffer),
        words: words.max(1),
    }
}

fn create_staging_buf(device: &wgpu::Device, label: &str, size: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

/// Copy the first `words` words of `source` to the host.
///
/// Submits its own copy on `queue`, so it does not wait for work enqueued
/// after the caller's last dependency.
pub(crate) fn read_u32_buffer(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    source: &GpuBuffer,
    words: usize,
) -> Result<Vec<u32>, SystemError> {
    if words > source.words {
        return Err(SystemError::DeviceUnavailable(format!(
            "read of {words} words from a buffer of {}",
            source.words
        )));
    }
    if words == 0 {
        return Ok(Vec::new());
    }
    let size = words as u64 * 4;
    let staging = create_staging_buf(device, "readback_staging", size);
    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("readback"),
    });
    encoder.copy_buffer_to_buffer(source.raw(), 0, &staging, 0, size);
    queue.submit(std::iter::once(encoder.finish()));

    let slice = staging.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    device.poll(wgpu::Maintain::Wait);
    rx.recv()
        .map_err(|_| SystemError::DeviceUnavailable("readback callback dropped".into()))?
        .map_err(|e| SystemError::DeviceUnavailable(format!("buffer map failed: {e}")))?;

    let data = slice.get_mapped_range();
    let result: Vec<u32> = bytemuck::cast_slice(&data)[..words].to_vec();
    drop(data);
    staging.unmap();
    Ok(result)
}
