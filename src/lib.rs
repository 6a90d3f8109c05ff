// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference picture and temporal buffer management for AV1 hardware decoders.
//!
//! This crate keeps track of the decoded picture buffer (DPB) of an AV1 decode context and of the
//! auxiliary GPU buffers attached to every reference: collocated motion vectors, segment id maps
//! and CDF tables. Those buffers are shared between frames (a frame's initial CDF state is the
//! adapted state of its primary reference), so they are reference counted and only recycled once
//! nothing depends on them anymore.
//!
//! Parsing the bitstream and emitting hardware commands are left to the user: parsed frame
//! headers come in as [`codec::av1::picture_params::PicParams`], GPU memory is handled through
//! the [`backend::BufferAllocator`] and [`backend::BufferSizer`] traits, and the per-frame results
//! are exposed through [`decoder::av1::FrameState`].
//!
//! The entry point is [`decoder::av1::Av1DecodeContext`], which runs the per-frame flow on top of
//! [`decoder::av1::reference_frames::ReferenceFrameTable`] and
//! [`decoder::av1::temporal_buffers::TemporalBufferPool`].

pub mod backend;
pub mod codec;
pub mod decoder;
pub mod utils;

/// Width and height of a frame, in pixels.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Returns the number of blocks of `block_size` pixels needed to cover the resolution in
    /// each dimension.
    pub fn in_blocks(&self, block_size: u32) -> (u32, u32) {
        (
            self.width.div_ceil(block_size),
            self.height.div_ceil(block_size),
        )
    }

    pub fn get_area(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Resolution;

    #[test]
    fn resolution_in_superblocks() {
        let resolution = Resolution::from((1920, 1080));
        assert_eq!(resolution.in_blocks(64), (30, 17));
        assert_eq!(resolution.in_blocks(128), (15, 9));
        assert_eq!(resolution.get_area(), 1920 * 1080);
    }
}
