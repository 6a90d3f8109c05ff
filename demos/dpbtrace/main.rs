// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Replays a JSON frame script through an AV1 decode context and reports what the reference
//! managers did for every frame.

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use argh::FromArgs;
use cros_av1_dpb::backend::avp::AvpBufferSizer;
use cros_av1_dpb::backend::dummy::DummyAllocator;
use cros_av1_dpb::decoder::av1::Av1DecodeContext;
use cros_av1_dpb::decoder::av1::FrameState;
use serde_json::json;

mod script;
use script::Script;

/// Replay a sequence of AV1 frame headers through the DPB and temporal buffer managers.
#[derive(FromArgs)]
struct Args {
    /// frame script (JSON)
    #[argh(positional)]
    input: PathBuf,

    /// assume frames complete in submission order
    #[argh(switch)]
    out_of_order_completion: bool,

    /// fail on reference count underflows instead of clamping them
    #[argh(switch)]
    strict: bool,

    /// print one JSON object per frame on stdout
    #[argh(switch)]
    json: bool,
}

fn frame_report(frame_idx: u8, state: &FrameState, evicted: &[u8]) -> serde_json::Value {
    let handle = |buffer: Option<cros_av1_dpb::backend::GpuBuffer>| buffer.map(|b| b.0);

    json!({
        "frame_idx": frame_idx,
        "degraded": state.concealment.is_degraded(),
        "substituted": state
            .concealment
            .substituted
            .iter()
            .map(|r| format!("{:?}", r))
            .collect::<Vec<_>>(),
        "active_refs": state.active_refs,
        "primary_ref_idx": state.primary_ref_idx,
        "bundle": state.bundle.map(|b| format!("{:?}", b)),
        "mv_buf": handle(state.mv_buf),
        "init_cdf_buf": handle(state.init_cdf_buf),
        "segment_id_buf": handle(state.segment_id_buf),
        "motion_field": state.motion_field.bits(),
        "skip_mode_frames": state
            .skip_mode_frames
            .map(|frames| frames.map(|r| format!("{:?}", r))),
        "evicted": evicted,
    })
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Args = argh::from_env();

    let input = fs::read_to_string(&args.input)
        .with_context(|| format!("failed to read {}", args.input.display()))?;
    let script = Script::from_json(&input).context("invalid frame script")?;

    let mut config = script.config.pool_config();
    config.out_of_order_completion |= args.out_of_order_completion;
    config.strict_ref_counting |= args.strict;

    let mut ctx = Av1DecodeContext::new(DummyAllocator::new(), AvpBufferSizer, config);

    for frame in &script.frames {
        let mut pic = frame.pic_params();
        let state = ctx
            .begin_frame(&mut pic, frame.picture())
            .with_context(|| format!("failed to set up frame {}", frame.frame_idx))?;
        let evicted = ctx
            .end_frame(&pic)
            .with_context(|| format!("failed to commit frame {}", frame.frame_idx))?;

        if args.json {
            println!("{}", frame_report(frame.frame_idx, &state, &evicted));
        }
        log::info!(
            "frame {}: refs {:?}, primary {:?}, {:?}, evicted {:?}, {} live buffers",
            frame.frame_idx,
            state.active_refs,
            state.primary_ref_idx,
            state.bundle,
            evicted,
            ctx.allocator().num_live_buffers()
        );
    }

    log::info!("pool diagnostics: {:?}", ctx.pool().diagnostics());

    Ok(())
}
