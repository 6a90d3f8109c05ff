// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interfaces to the GPU memory services the reference managers depend on.
//!
//! Buffer management is delegated to a [`BufferAllocator`], and hardware-specific buffer sizes
//! are obtained from a [`BufferSizer`]. [`avp::AvpBufferSizer`] implements the sizing rules of
//! the AVP decode engine, and [`dummy::DummyAllocator`] provides host-memory bookkeeping for
//! tests and tools.

pub mod avp;
pub mod dummy;

/// Opaque handle to a buffer created by a [`BufferAllocator`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GpuBuffer(pub u64);

/// Handle to the storage of a decoded picture. Pictures are GPU resources like any other
/// buffer, but they are allocated by the client and only referenced here.
pub type PictureHandle = GpuBuffer;

/// Per-frame hardware buffers whose size depends on the frame geometry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BufferKind {
    /// Collocated motion vectors written by a frame and read back by motion field projection.
    MvTemporal,
    /// Segment ids written by a frame that updates its segmentation map.
    SegmentId,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryHint {
    NotLockableVideoMem,
    LockableVideoMem,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CacheHint {
    InternalReadWrite,
    InternalRead,
}

/// Geometry parameters used to compute hardware buffer sizes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferSizeParams {
    /// Frame width in superblocks.
    pub width_in_sb: u32,
    /// Frame height in superblocks.
    pub height_in_sb: u32,
    pub use_128x128_superblock: bool,
    /// 0 for 8-bit content, 1 for 10-bit content.
    pub bit_depth_idc: u8,
}

/// Creates, resizes and destroys GPU buffers.
///
/// Errors are opaque to the reference managers: any failure is fatal for the frame being set up
/// and is forwarded to the caller.
pub trait BufferAllocator {
    /// Allocates a buffer of at least `size` bytes. `name` is only used for debugging.
    fn allocate_buffer(
        &mut self,
        size: usize,
        name: &'static str,
        cache: CacheHint,
        memory: MemoryHint,
    ) -> anyhow::Result<GpuBuffer>;

    /// Makes `buffer` at least `size` bytes large. The handle stays valid and keeps its identity.
    fn resize(
        &mut self,
        buffer: GpuBuffer,
        size: usize,
        memory: MemoryHint,
        preserve_contents: bool,
    ) -> anyhow::Result<()>;

    /// Releases `buffer`. The handle must not be used afterwards.
    fn destroy(&mut self, buffer: GpuBuffer);
}

/// Reports the size the hardware requires for geometry-dependent buffers.
pub trait BufferSizer {
    fn required_buffer_size(
        &self,
        kind: BufferKind,
        params: &BufferSizeParams,
    ) -> anyhow::Result<usize>;
}

impl<T: BufferAllocator + ?Sized> BufferAllocator for Box<T> {
    fn allocate_buffer(
        &mut self,
        size: usize,
        name: &'static str,
        cache: CacheHint,
        memory: MemoryHint,
    ) -> anyhow::Result<GpuBuffer> {
        self.as_mut().allocate_buffer(size, name, cache, memory)
    }

    fn resize(
        &mut self,
        buffer: GpuBuffer,
        size: usize,
        memory: MemoryHint,
        preserve_contents: bool,
    ) -> anyhow::Result<()> {
        self.as_mut().resize(buffer, size, memory, preserve_contents)
    }

    fn destroy(&mut self, buffer: GpuBuffer) {
        self.as_mut().destroy(buffer)
    }
}

impl<T: BufferSizer + ?Sized> BufferSizer for Box<T> {
    fn required_buffer_size(
        &self,
        kind: BufferKind,
        params: &BufferSizeParams,
    ) -> anyhow::Result<usize> {
        self.as_ref().required_buffer_size(kind, params)
    }
}
