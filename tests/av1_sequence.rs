// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Multi-frame sequences run through a full decode context.

use cros_av1_dpb::backend::avp::AvpBufferSizer;
use cros_av1_dpb::backend::dummy::DummyAllocator;
use cros_av1_dpb::backend::GpuBuffer;
use cros_av1_dpb::codec::av1::picture_params::FrameType;
use cros_av1_dpb::codec::av1::picture_params::PicParams;
use cros_av1_dpb::codec::av1::picture_params::ReferenceFrameType;
use cros_av1_dpb::codec::av1::picture_params::TileParams;
use cros_av1_dpb::codec::av1::picture_params::REFS_PER_FRAME;
use cros_av1_dpb::decoder::av1::temporal_buffers::CdfProvenance;
use cros_av1_dpb::decoder::av1::temporal_buffers::PoolConfig;
use cros_av1_dpb::decoder::av1::temporal_buffers::PoolDiagnostics;
use cros_av1_dpb::decoder::av1::temporal_buffers::SharedBufferId;
use cros_av1_dpb::decoder::av1::temporal_buffers::DEFAULT_CDF_TABLE_NUM;
use cros_av1_dpb::decoder::av1::Av1DecodeContext;
use cros_av1_dpb::decoder::av1::FrameState;

#[path = "../demos/dpbtrace/script.rs"]
#[allow(dead_code)]
mod script;
use script::Script;

const SEQUENCE: &str = include_str!("../demos/dpbtrace/sequence.json");

type TestContext = Av1DecodeContext<DummyAllocator, AvpBufferSizer>;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Runs every frame of `script`, returning the state and evicted frames of each.
fn run(ctx: &mut TestContext, script: &Script) -> Vec<(FrameState, Vec<u8>)> {
    script
        .frames
        .iter()
        .map(|frame| {
            let mut pic = frame.pic_params();
            let state = ctx.begin_frame(&mut pic, frame.picture()).unwrap();
            let evicted = ctx.end_frame(&pic).unwrap();
            (state, evicted)
        })
        .collect()
}

#[test]
fn scripted_sequence() {
    init_logger();

    let script = Script::from_json(SEQUENCE).unwrap();
    let mut ctx = Av1DecodeContext::new(
        DummyAllocator::new(),
        AvpBufferSizer,
        script.config.pool_config(),
    );
    let frames = run(&mut ctx, &script);
    let states: Vec<&FrameState> = frames.iter().map(|(state, _)| state).collect();
    let evicted: Vec<Vec<u8>> = frames.iter().map(|(_, evicted)| evicted.clone()).collect();

    let expected: Vec<Vec<u8>> = vec![vec![], vec![], vec![], vec![], vec![0, 1, 2, 3], vec![4]];
    assert_eq!(evicted, expected);
    assert!(states.iter().all(|s| !s.concealment.is_degraded()));

    // Frame 1 keeps the segment id map of frame 0 and starts from its adapted CDF tables.
    assert_eq!(states[1].segment_id_buf, states[0].segment_write_buf);
    assert!(states[1].segmentation.stream_in_enabled);
    assert!(!states[1].segmentation.stream_out_enabled);
    assert_eq!(states[1].segmentation.last_active_seg_id, 1);
    assert_eq!(states[1].init_cdf_buf, states[0].backward_adapted_cdf_buf);

    // Frame 2 does not adapt its tables, so frame 3 starts from frame 2's initial tables.
    assert_eq!(states[2].init_cdf_buf, states[1].backward_adapted_cdf_buf);
    assert_eq!(states[3].init_cdf_buf, states[2].init_cdf_buf);

    // LAST of frame 3 is an overlay of GOLDEN, only LAST2 gets projected.
    assert_eq!(
        states[3].motion_field.iter().collect::<Vec<_>>(),
        vec![ReferenceFrameType::Last2]
    );
    assert_eq!(
        states[3].skip_mode_frames,
        Some([ReferenceFrameType::Last, ReferenceFrameType::Last2])
    );

    // Once frames 0 to 3 are released nothing reads frame 0's buffers anymore.
    assert_eq!(states[5].bundle, states[0].bundle);
    assert_eq!(states[5].mv_buf, states[0].mv_buf);

    assert_eq!(ctx.allocator().num_allocations(), DEFAULT_CDF_TABLE_NUM + 5 * 3);
    assert_eq!(ctx.pool().diagnostics(), PoolDiagnostics::default());

    ctx.flush();
    assert_eq!(ctx.allocator().num_live_buffers(), 0);
    for handle in 1..=ctx.allocator().num_allocations() as u64 {
        assert_eq!(ctx.allocator().destroy_count(GpuBuffer(handle)), 1);
    }
}

#[test]
fn chained_cdf_provenance() {
    init_logger();

    let script = Script::from_json(SEQUENCE).unwrap();
    let mut ctx = Av1DecodeContext::new(
        DummyAllocator::new(),
        AvpBufferSizer,
        script.config.pool_config(),
    );
    let first_frames = Script {
        frames: script.frames[..4].to_vec(),
        ..script.clone()
    };
    let frames = run(&mut ctx, &first_frames);
    let bundle = |i: usize| frames[i].0.bundle.unwrap();

    assert_eq!(
        ctx.pool().bundle(bundle(0)).unwrap().init_cdf_buf(),
        Some(CdfProvenance::DefaultTable(0))
    );
    assert_eq!(
        ctx.pool().bundle(bundle(3)).unwrap().init_cdf_buf(),
        Some(CdfProvenance::InheritedFrom {
            primary: bundle(2),
            buffer: SharedBufferId::BackwardAdaptedCdf(bundle(1)),
        })
    );
    // Frames 2 and 3 both read frame 1's adapted tables.
    assert_eq!(
        ctx.pool()
            .bundle(bundle(1))
            .unwrap()
            .backward_adapted_cdf_buf()
            .ref_count(),
        2
    );
}

#[test]
fn superblock_size_change_reuses_handles() {
    init_logger();

    let mut ctx = Av1DecodeContext::new(
        DummyAllocator::new(),
        AvpBufferSizer,
        PoolConfig {
            strict_ref_counting: true,
            ..Default::default()
        },
    );
    let mut pic = PicParams {
        frame_width_minus_1: 1919,
        frame_height_minus_1: 1079,
        refresh_frame_flags: 0xff,
        ..Default::default()
    };

    let sb64 = ctx.begin_frame(&mut pic.clone(), GpuBuffer(1)).unwrap();
    ctx.end_frame(&pic).unwrap();
    let mv_buf = sb64.mv_buf.unwrap();
    let sb64_size = ctx.allocator().size_of(mv_buf).unwrap();

    // The same frame index is decoded again with 128x128 superblocks.
    pic.use_128x128_superblock = true;
    pic.ref_frame_map = [0; 8];
    let sb128 = ctx.begin_frame(&mut pic, GpuBuffer(2)).unwrap();

    assert_eq!(sb128.bundle, sb64.bundle);
    assert_eq!(sb128.mv_buf, Some(mv_buf));
    assert!(ctx.allocator().size_of(mv_buf).unwrap() > sb64_size);
    assert_eq!(ctx.allocator().num_allocations(), DEFAULT_CDF_TABLE_NUM + 3);
}

#[test]
fn large_scale_tile_anchors() {
    init_logger();

    let mut ctx = Av1DecodeContext::new(
        DummyAllocator::new(),
        AvpBufferSizer,
        PoolConfig::default(),
    );
    for (idx, picture) in [(200u8, 42u64), (201, 43)] {
        let mut anchor = PicParams {
            current_frame_idx: idx,
            frame_width_minus_1: 511,
            frame_height_minus_1: 511,
            large_scale_tile: true,
            anchor_frame_insertion: true,
            ..Default::default()
        };
        let state = ctx.begin_frame(&mut anchor, GpuBuffer(picture)).unwrap();
        assert_eq!(state.bundle, None);
        assert!(ctx.end_frame(&anchor).unwrap().is_empty());
    }

    let mut pic = PicParams {
        current_frame_idx: 0,
        frame_type: FrameType::InterFrame,
        frame_width_minus_1: 511,
        frame_height_minus_1: 511,
        large_scale_tile: true,
        ref_frame_map: [200; 8],
        refresh_frame_flags: 0,
        ..Default::default()
    };
    let state = ctx.begin_frame(&mut pic, GpuBuffer(1)).unwrap();
    assert!(!state.concealment.is_degraded());
    assert_eq!(
        ctx.tile_references(&pic, &TileParams { anchor_frame_idx: 201 }),
        [Some(201); REFS_PER_FRAME]
    );
    // A missing anchor falls back to the first valid frame.
    assert_eq!(
        ctx.tile_references(&pic, &TileParams { anchor_frame_idx: 7 }),
        [Some(200); REFS_PER_FRAME]
    );

    // Anchors stay in the DPB whatever the refresh mask says.
    ctx.end_frame(&pic).unwrap();
    assert!(ctx.reference_frames().get_reference_by_frame_index(200).is_some());
    assert!(ctx.reference_frames().get_reference_by_frame_index(201).is_some());
}

#[test]
fn out_of_order_completion_recycles_immediately() {
    init_logger();

    let mut ctx = Av1DecodeContext::new(
        DummyAllocator::new(),
        AvpBufferSizer,
        PoolConfig {
            out_of_order_completion: true,
            ..Default::default()
        },
    );
    let mut key = PicParams {
        refresh_frame_flags: 0xff,
        ..Default::default()
    };
    let first = ctx.begin_frame(&mut key, GpuBuffer(1)).unwrap();
    ctx.end_frame(&key).unwrap();

    // Frame 1 starts from frame 0's tables and evicts it.
    let mut inter = PicParams {
        current_frame_idx: 1,
        frame_type: FrameType::InterFrame,
        ref_frame_map: [0; 8],
        primary_ref_frame: 0,
        refresh_frame_flags: 0xff,
        ..Default::default()
    };
    ctx.begin_frame(&mut inter, GpuBuffer(2)).unwrap();
    ctx.end_frame(&inter).unwrap();

    // Frame 0's bundle is still read by frame 1 but is reused anyway.
    let mut next = PicParams {
        current_frame_idx: 2,
        frame_type: FrameType::InterFrame,
        ref_frame_map: [1; 8],
        refresh_frame_flags: 0xff,
        ..Default::default()
    };
    let reused = ctx.begin_frame(&mut next, GpuBuffer(3)).unwrap();
    assert_eq!(reused.bundle, first.bundle);
}
