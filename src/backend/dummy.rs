// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Allocator that only does bookkeeping.
//!
//! No memory is actually reserved: the allocator hands out increasing handles and remembers the
//! size and name of every live buffer, which is enough to exercise the reference managers
//! without a GPU, and to check that every buffer is released exactly once.

use std::collections::BTreeMap;

use anyhow::anyhow;

use crate::backend::BufferAllocator;
use crate::backend::CacheHint;
use crate::backend::GpuBuffer;
use crate::backend::MemoryHint;

#[derive(Clone, Debug)]
pub struct DummyBuffer {
    pub size: usize,
    pub name: &'static str,
    pub cache: CacheHint,
    pub memory: MemoryHint,
}

#[derive(Debug, Default)]
pub struct DummyAllocator {
    next_handle: u64,
    live: BTreeMap<GpuBuffer, DummyBuffer>,
    destroy_counts: BTreeMap<GpuBuffer, usize>,
    allocations: usize,
    /// Number of further allocations to accept before failing, if set.
    fail_after: Option<usize>,
}

impl DummyAllocator {
    pub fn new() -> Self {
        Default::default()
    }

    /// Makes every allocation after the next `allocations` ones fail.
    pub fn fail_after(&mut self, allocations: usize) {
        self.fail_after = Some(allocations);
    }

    pub fn buffer(&self, buffer: GpuBuffer) -> Option<&DummyBuffer> {
        self.live.get(&buffer)
    }

    /// Current size of `buffer`, `None` if it is not allocated.
    pub fn size_of(&self, buffer: GpuBuffer) -> Option<usize> {
        self.live.get(&buffer).map(|b| b.size)
    }

    pub fn is_live(&self, buffer: GpuBuffer) -> bool {
        self.live.contains_key(&buffer)
    }

    pub fn num_live_buffers(&self) -> usize {
        self.live.len()
    }

    /// Total number of successful allocations since creation.
    pub fn num_allocations(&self) -> usize {
        self.allocations
    }

    /// Number of times `destroy` has been called on `buffer`.
    pub fn destroy_count(&self, buffer: GpuBuffer) -> usize {
        self.destroy_counts.get(&buffer).copied().unwrap_or(0)
    }
}

impl BufferAllocator for DummyAllocator {
    fn allocate_buffer(
        &mut self,
        size: usize,
        name: &'static str,
        cache: CacheHint,
        memory: MemoryHint,
    ) -> anyhow::Result<GpuBuffer> {
        if let Some(remaining) = self.fail_after.as_mut() {
            if *remaining == 0 {
                return Err(anyhow!("out of memory while allocating {name} ({size} bytes)"));
            }
            *remaining -= 1;
        }

        self.next_handle += 1;
        let handle = GpuBuffer(self.next_handle);
        self.live.insert(
            handle,
            DummyBuffer {
                size,
                name,
                cache,
                memory,
            },
        );
        self.allocations += 1;
        log::trace!("allocated {name} {handle:?} of {size} bytes");

        Ok(handle)
    }

    fn resize(
        &mut self,
        buffer: GpuBuffer,
        size: usize,
        memory: MemoryHint,
        _preserve_contents: bool,
    ) -> anyhow::Result<()> {
        let entry = self
            .live
            .get_mut(&buffer)
            .ok_or_else(|| anyhow!("cannot resize unknown buffer {buffer:?}"))?;

        if size > entry.size {
            log::trace!("growing {} {buffer:?} from {} to {size} bytes", entry.name, entry.size);
            entry.size = size;
            entry.memory = memory;
        }

        Ok(())
    }

    fn destroy(&mut self, buffer: GpuBuffer) {
        *self.destroy_counts.entry(buffer).or_default() += 1;
        if self.live.remove(&buffer).is_none() {
            log::error!("destroying buffer {buffer:?} which is not allocated");
        }
    }
}
