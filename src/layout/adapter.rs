//! GPU buffers mirrored by a [`RecordArray`](super::RecordArray) or a single uniform record.

use wgpu::util::DeviceExt;

use super::{layout_with, FieldValue, Packing, Record, RecordArray, RecordLayout};
use crate::error::LayoutError;

/// An array-of-structs storage buffer with a CPU-side mirror.
///
/// The buffer is also usable as an instance-rate vertex buffer: [`Self::vertex_attributes`] exposes every field as a
/// strided attribute over the same memory, so rendering needs no second copy.
pub struct StorageAdapter<R> {
    records: RecordArray<R>,
    buffer: wgpu::Buffer,
}

impl<R: Record> StorageAdapter<R> {
    pub fn new(
        device: &wgpu::Device,
        proto: R,
        len: usize,
        packing: Packing,
        label: &str,
    ) -> Result<Self, LayoutError> {
        let records = RecordArray::new(proto, len, packing)?;
        log::debug!(
            "storage adapter `{label}`: {len} records of {} components",
            records.layout().record_size()
        );
        let buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: records.as_bytes(),
            usage: wgpu::BufferUsages::VERTEX
                | wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST,
        });
        Ok(Self { records, buffer })
    }

    pub fn get(&self, index: usize) -> Result<R, LayoutError> {
        self.records.get(index)
    }

    /// Update the CPU mirror. Call [`Self::flush`] to upload.
    pub fn set(&mut self, index: usize, record: &R) -> Result<(), LayoutError> {
        self.records.set(index, record)
    }

    pub fn flush(&self, queue: &wgpu::Queue) {
        queue.write_buffer(&self.buffer, 0, self.records.as_bytes());
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn layout(&self) -> &RecordLayout {
        self.records.layout()
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn vertex_attributes(&self, first_location: u32) -> Vec<wgpu::VertexAttribute> {
        self.records.layout().vertex_attributes(first_location)
    }
}

/// A single WGSL-aligned uniform record.
pub struct UniformAdapter<R> {
    proto: R,
    layout: RecordLayout,
    data: Vec<f32>,
    buffer: wgpu::Buffer,
}

impl<R: Record> UniformAdapter<R> {
    pub fn new(device: &wgpu::Device, proto: R, label: &str) -> Result<Self, LayoutError> {
        let layout = layout_with(&proto, Packing::Wgsl)?;
        // uniform blocks are sized in whole 16 byte rows
        let mut data = vec![0.0; layout.record_size().next_multiple_of(4).max(4)];
        if !layout.fields().is_empty() {
            layout.write_record(&mut data, 0, &proto)?;
        }
        let buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::cast_slice(&data),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        Ok(Self {
            proto,
            layout,
            data,
            buffer,
        })
    }

    pub fn update(&mut self, queue: &wgpu::Queue, record: &R) -> Result<(), LayoutError> {
        if self.layout.fields().is_empty() {
            return Ok(());
        }
        self.layout.write_record(&mut self.data, 0, record)?;
        queue.write_buffer(&self.buffer, 0, bytemuck::cast_slice(&self.data));
        Ok(())
    }

    /// Update a subset of fields by name. Names the record doesn't have are skipped.
    pub fn update_fields<'a>(
        &mut self,
        queue: &wgpu::Queue,
        values: impl IntoIterator<Item = (&'a str, FieldValue)>,
    ) -> Result<(), LayoutError> {
        for (name, value) in values {
            if self.layout.field(name).is_none() {
                log::debug!("uniform adapter: skipping unknown field `{name}`");
                continue;
            }
            self.layout.write_field(&mut self.data, 0, name, value)?;
        }
        queue.write_buffer(&self.buffer, 0, bytemuck::cast_slice(&self.data));
        Ok(())
    }

    pub fn get(&self) -> Result<R, LayoutError> {
        if self.layout.fields().is_empty() {
            return Ok(self.proto.clone());
        }
        self.layout.read_record(&self.data, 0, &self.proto)
    }

    pub fn layout(&self) -> &RecordLayout {
        &self.layout
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }
}
