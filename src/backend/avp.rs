// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Buffer sizing rules of the AVP (AV1 video pipe) decode engine.

use anyhow::anyhow;

use crate::backend::BufferKind;
use crate::backend::BufferSizeParams;
use crate::backend::BufferSizer;
use crate::utils::CACHELINE_SIZE;

/// Cache lines needed per superblock, indexed by `[bit_depth_idc][use_128x128_superblock]`.
const SEGMENT_ID_CL_PER_SB: [[usize; 2]; 2] = [[2, 8], [2, 8]];
const MV_TEMPORAL_CL_PER_SB: [[usize; 2]; 2] = [[4, 16], [4, 16]];

/// [`BufferSizer`] implementing the AVP frame buffer size tables.
#[derive(Clone, Copy, Debug, Default)]
pub struct AvpBufferSizer;

impl BufferSizer for AvpBufferSizer {
    fn required_buffer_size(
        &self,
        kind: BufferKind,
        params: &BufferSizeParams,
    ) -> anyhow::Result<usize> {
        let bit_depth = params.bit_depth_idc as usize;
        if bit_depth > 1 {
            return Err(anyhow!(
                "unsupported bit depth idc {} for AVP buffers",
                params.bit_depth_idc
            ));
        }

        let sb128 = params.use_128x128_superblock as usize;
        let total_sb = params.width_in_sb as usize * params.height_in_sb as usize;
        let cachelines = match kind {
            BufferKind::SegmentId => SEGMENT_ID_CL_PER_SB[bit_depth][sb128] * total_sb,
            BufferKind::MvTemporal => MV_TEMPORAL_CL_PER_SB[bit_depth][sb128] * total_sb,
        };

        Ok(cachelines * CACHELINE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params_1080p(use_128x128_superblock: bool) -> BufferSizeParams {
        let (width_in_sb, height_in_sb) = if use_128x128_superblock {
            (15, 9)
        } else {
            (30, 17)
        };
        BufferSizeParams {
            width_in_sb,
            height_in_sb,
            use_128x128_superblock,
            bit_depth_idc: 0,
        }
    }

    #[test]
    fn mv_temporal_buffer_size() {
        let sizer = AvpBufferSizer;
        let sb64 = sizer
            .required_buffer_size(BufferKind::MvTemporal, &params_1080p(false))
            .unwrap();
        let sb128 = sizer
            .required_buffer_size(BufferKind::MvTemporal, &params_1080p(true))
            .unwrap();

        assert_eq!(sb64, 30 * 17 * 4 * CACHELINE_SIZE);
        assert_eq!(sb128, 15 * 9 * 16 * CACHELINE_SIZE);
        assert!(sb128 > sb64);
    }

    #[test]
    fn segment_id_buffer_size() {
        let sizer = AvpBufferSizer;
        let size = sizer
            .required_buffer_size(BufferKind::SegmentId, &params_1080p(false))
            .unwrap();
        assert_eq!(size, 30 * 17 * 2 * CACHELINE_SIZE);
    }

    #[test]
    fn rejects_12bit() {
        let params = BufferSizeParams {
            bit_depth_idc: 2,
            ..params_1080p(false)
        };
        assert!(AvpBufferSizer
            .required_buffer_size(BufferKind::MvTemporal, &params)
            .is_err());
    }
}
