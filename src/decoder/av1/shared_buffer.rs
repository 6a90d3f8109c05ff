// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::backend::GpuBuffer;

/// A GPU buffer that other frames may hold references to.
///
/// The count tracks how many frames currently read the buffer (as their initial CDF table or as
/// their segment id map). It never goes below zero: releasing an unreferenced buffer leaves the
/// count at zero and reports the underflow to the caller.
#[derive(Debug, PartialEq, Eq)]
pub struct SharedResource {
    buffer: GpuBuffer,
    ref_count: u32,
}

impl SharedResource {
    pub fn new(buffer: GpuBuffer) -> Self {
        Self {
            buffer,
            ref_count: 0,
        }
    }

    pub fn buffer(&self) -> GpuBuffer {
        self.buffer
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    /// Whether some frame still depends on the buffer.
    pub fn is_referenced(&self) -> bool {
        self.ref_count > 0
    }

    pub fn add_ref(&mut self) {
        self.ref_count += 1;
    }

    /// Drops one reference. Returns `false`, leaving the count at zero, if there was none.
    #[must_use]
    pub fn release(&mut self) -> bool {
        match self.ref_count.checked_sub(1) {
            Some(count) => {
                self.ref_count = count;
                true
            }
            None => false,
        }
    }

    /// Drops all references at once and returns how many there were.
    pub(crate) fn force_release(&mut self) -> u32 {
        std::mem::take(&mut self.ref_count)
    }
}
