// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

#![no_main]

use cros_av1_dpb::backend::avp::AvpBufferSizer;
use cros_av1_dpb::backend::dummy::DummyAllocator;
use cros_av1_dpb::backend::GpuBuffer;
use cros_av1_dpb::codec::av1::picture_params::FrameType;
use cros_av1_dpb::codec::av1::picture_params::PicParams;
use cros_av1_dpb::codec::av1::picture_params::SegmentationParams;
use cros_av1_dpb::codec::av1::picture_params::TileParams;
use cros_av1_dpb::decoder::av1::temporal_buffers::PoolConfig;
use cros_av1_dpb::decoder::av1::Av1DecodeContext;
use libfuzzer_sys::fuzz_target;

const FRAME_HEADER_LEN: usize = 32;

fn frame_header(data: &[u8]) -> PicParams {
    let mut ref_frame_map = [0u8; 8];
    ref_frame_map.copy_from_slice(&data[8..16]);
    let mut ref_frame_idx = [0u8; 7];
    ref_frame_idx.copy_from_slice(&data[16..23]);
    let mut feature_mask = [0u8; 8];
    feature_mask.copy_from_slice(&data[24..32]);

    PicParams {
        current_frame_idx: data[0],
        frame_width_minus_1: u16::from_le_bytes([data[1], data[2] & 0x3f]),
        frame_height_minus_1: u16::from_le_bytes([data[3], data[4] & 0x3f]),
        frame_type: match data[5] & 0x3 {
            0 => FrameType::KeyFrame,
            1 => FrameType::InterFrame,
            2 => FrameType::IntraOnlyFrame,
            _ => FrameType::SwitchFrame,
        },
        use_128x128_superblock: data[5] & 0x4 != 0,
        enable_order_hint: data[5] & 0x8 != 0,
        reference_select: data[5] & 0x10 != 0,
        disable_frame_end_update_cdf: data[5] & 0x20 != 0,
        large_scale_tile: data[5] & 0x40 != 0,
        anchor_frame_insertion: data[5] & 0x80 != 0,
        order_hint_bits_minus_1: data[6] & 0x7,
        order_hint: data[7],
        ref_frame_map,
        ref_frame_idx,
        primary_ref_frame: data[6] >> 5,
        refresh_frame_flags: data[23],
        base_q_idx: data[4],
        bit_depth_idx: (data[6] >> 3) & 0x1,
        segmentation: SegmentationParams {
            enabled: data[2] & 0x40 != 0,
            update_map: data[2] & 0x80 != 0,
            temporal_update: data[4] & 0x40 != 0,
            update_data: data[4] & 0x80 != 0,
            feature_mask,
        },
        ..Default::default()
    }
}

fuzz_target!(|data: &[u8]| {
    let Some((&config, frames)) = data.split_first() else {
        return;
    };

    let mut ctx = Av1DecodeContext::new(
        DummyAllocator::new(),
        AvpBufferSizer,
        PoolConfig {
            out_of_order_completion: config & 0x1 != 0,
            max_idle_bundles: usize::from(config >> 4),
            ..Default::default()
        },
    );

    for (n, header) in frames.chunks_exact(FRAME_HEADER_LEN).enumerate() {
        let mut pic = frame_header(header);
        let target = GpuBuffer(0x10000 + n as u64);
        if ctx.begin_frame(&mut pic, target).is_err() {
            continue;
        }
        let _ = ctx.resolve_reference_addresses(&pic);
        let _ = ctx.tile_references(&pic, &TileParams { anchor_frame_idx: header[0] });
        let _ = ctx.end_frame(&pic);
    }

    ctx.flush();
    assert_eq!(ctx.allocator().num_live_buffers(), 0);
});
