// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference management of an AV1 decode context.
//!
//! [`Av1DecodeContext`] ties the DPB ([`reference_frames::ReferenceFrameTable`]) and the
//! temporal buffers ([`temporal_buffers::TemporalBufferPool`]) together. For every frame, the
//! client calls [`Av1DecodeContext::begin_frame`] with the parsed frame header, emits the
//! hardware commands using the returned [`FrameState`] and
//! [`Av1DecodeContext::resolve_reference_addresses`], then calls [`Av1DecodeContext::end_frame`].

pub mod motion_field;
pub mod reference_frames;
pub mod shared_buffer;
pub mod temporal_buffers;

use thiserror::Error;

use crate::backend::BufferAllocator;
use crate::backend::BufferSizer;
use crate::backend::GpuBuffer;
use crate::backend::PictureHandle;
use crate::codec::av1::picture_params::FrameType;
use crate::codec::av1::picture_params::PicParams;
use crate::codec::av1::picture_params::ReferenceFrameType;
use crate::codec::av1::picture_params::TileParams;
use crate::codec::av1::picture_params::MAX_DPB_NUM;
use crate::codec::av1::picture_params::MAX_DPB_NUM_LST;
use crate::codec::av1::picture_params::MAX_FRAME_SIZE_MINUS_1;
use crate::codec::av1::picture_params::MIN_FRAME_SIZE_MINUS_1;
use crate::codec::av1::picture_params::NUM_REF_FRAMES;
use crate::decoder::av1::motion_field::MotionFieldMask;
use crate::decoder::av1::reference_frames::ActiveReferenceList;
use crate::decoder::av1::reference_frames::ConcealmentReport;
use crate::decoder::av1::reference_frames::ReferenceFrameTable;
use crate::decoder::av1::reference_frames::SegmentationState;
use crate::decoder::av1::temporal_buffers::BundleId;
use crate::decoder::av1::temporal_buffers::FrameBufferParams;
use crate::decoder::av1::temporal_buffers::PoolConfig;
use crate::decoder::av1::temporal_buffers::SharedBufferId;
use crate::decoder::av1::temporal_buffers::TemporalBufferPool;

#[derive(Debug, Error)]
pub enum DpbError {
    #[error("failed to allocate temporal buffers: {0:#}")]
    Allocation(anyhow::Error),
    #[error("failed to resize temporal buffers: {0:#}")]
    Resize(anyhow::Error),
    #[error("failed to compute temporal buffer sizes: {0:#}")]
    Sizing(anyhow::Error),
    #[error("frame index {0} is out of range")]
    InvalidFrameIndex(u8),
    #[error("invalid frame size {width}x{height}")]
    InvalidFrameSize { width: u32, height: u32 },
    #[error("monochrome streams are not supported")]
    UnsupportedMonochrome,
    #[error("{0:?} released more often than referenced")]
    RefCountUnderflow(SharedBufferId),
    #[error("no temporal buffers with id {0:?}")]
    MissingBundle(BundleId),
}

pub type DpbResult<T> = Result<T, DpbError>;

/// Rejects frame headers the decoder cannot handle at all.
pub fn validate_pic_params(pic: &PicParams) -> DpbResult<()> {
    let size_range = MIN_FRAME_SIZE_MINUS_1..=MAX_FRAME_SIZE_MINUS_1;
    if !size_range.contains(&pic.frame_width_minus_1)
        || !size_range.contains(&pic.frame_height_minus_1)
    {
        return Err(DpbError::InvalidFrameSize {
            width: pic.frame_width(),
            height: pic.frame_height(),
        });
    }

    let max_dpb = if pic.large_scale_tile {
        MAX_DPB_NUM_LST
    } else {
        MAX_DPB_NUM
    };
    if pic.current_frame_idx as usize >= max_dpb {
        return Err(DpbError::InvalidFrameIndex(pic.current_frame_idx));
    }

    if pic.mono_chrome {
        return Err(DpbError::UnsupportedMonochrome);
    }

    Ok(())
}

/// Everything the command emission of a frame needs from the reference managers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameState {
    pub concealment: ConcealmentReport,
    pub active_refs: ActiveReferenceList,
    pub primary_ref_idx: Option<u8>,
    pub bundle: Option<BundleId>,
    /// Collocated motion vectors written by the frame.
    pub mv_buf: Option<GpuBuffer>,
    pub init_cdf_buf: Option<GpuBuffer>,
    /// Segment id map read by the frame, `None` unless segment ids are streamed in.
    pub segment_id_buf: Option<GpuBuffer>,
    /// Segment id map written by the frame.
    pub segment_write_buf: Option<GpuBuffer>,
    pub backward_adapted_cdf_buf: Option<GpuBuffer>,
    pub segmentation: SegmentationState,
    pub motion_field: MotionFieldMask,
    pub skip_mode_frames: Option<[ReferenceFrameType; 2]>,
}

/// Picture and collocated motion vector buffers of the reference slots of the hardware.
///
/// Slot 0 is the current frame, slots 1 to 7 are the inter references in
/// `ReferenceFrameType::INTER` order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReferenceAddresses {
    pub pictures: [Option<PictureHandle>; NUM_REF_FRAMES],
    pub collocated_mvs: [Option<GpuBuffer>; NUM_REF_FRAMES],
}

/// Reference management state of one AV1 decode session.
pub struct Av1DecodeContext<A: BufferAllocator, S: BufferSizer> {
    refs: ReferenceFrameTable,
    pool: TemporalBufferPool<A, S>,
    current_target: Option<PictureHandle>,
}

impl<A: BufferAllocator, S: BufferSizer> Av1DecodeContext<A, S> {
    pub fn new(allocator: A, sizer: S, config: PoolConfig) -> Self {
        Self {
            refs: ReferenceFrameTable::new(),
            pool: TemporalBufferPool::new(allocator, sizer, config),
            current_target: None,
        }
    }

    pub fn reference_frames(&self) -> &ReferenceFrameTable {
        &self.refs
    }

    pub fn pool(&self) -> &TemporalBufferPool<A, S> {
        &self.pool
    }

    pub fn allocator(&self) -> &A {
        self.pool.allocator()
    }

    pub fn allocator_mut(&mut self) -> &mut A {
        self.pool.allocator_mut()
    }

    /// Sets up the DPB and the temporal buffers for decoding `pic` into `target`.
    ///
    /// Missing references are concealed in `pic`, which therefore has to be the frame's working
    /// copy. Only invalid frame headers and buffer allocation failures are errors.
    pub fn begin_frame(
        &mut self,
        pic: &mut PicParams,
        target: PictureHandle,
    ) -> DpbResult<FrameState> {
        validate_pic_params(pic)?;

        if pic.large_scale_tile && pic.anchor_frame_insertion {
            self.pool.release_frame(pic.current_frame_idx)?;
            self.refs.insert_anchor_frame(pic, target);
            self.current_target = None;
            return Ok(Default::default());
        }

        let concealment = self.refs.update_picture(pic, target);
        self.current_target = Some(target);

        let primary_ref_idx = self.refs.get_primary_ref_idx();
        let frame = FrameBufferParams::new(
            pic,
            primary_ref_idx,
            self.refs.check_seg_for_prim_frame(pic),
        );
        let segmentation = self.refs.set_segment_data(pic);
        // A frame streaming segment ids in reads its primary reference's map, even when it
        // writes a map of its own.
        let segment_id_buf = primary_ref_idx
            .filter(|_| segmentation.stream_in_enabled)
            .and_then(|idx| self.pool.get_buffer_by_frame_index(idx))
            .and_then(|id| self.pool.segment_id_buffer(id));

        let references = self.refs.reference_frame_indices();
        let bundle = self
            .pool
            .update_picture(pic.current_frame_idx, &references, &frame)?;
        self.refs.update_cur_resource(bundle);

        let motion_field = self.refs.setup_motion_field_projection(pic);
        let skip_mode_frames = self.refs.skip_mode_frames(pic);

        let current = self.pool.bundle(bundle);
        let state = FrameState {
            concealment,
            active_refs: *self.refs.active_reference_list(),
            primary_ref_idx,
            bundle: Some(bundle),
            mv_buf: current.map(|b| b.mv_buf()),
            init_cdf_buf: self.pool.init_cdf_buffer(bundle),
            segment_id_buf,
            segment_write_buf: current.map(|b| b.segment_write_buf().buffer()),
            backward_adapted_cdf_buf: current.map(|b| b.backward_adapted_cdf_buf().buffer()),
            segmentation,
            motion_field,
            skip_mode_frames,
        };
        log::debug!(
            "frame {} set up with {:?}, degraded: {}",
            pic.current_frame_idx,
            bundle,
            state.concealment.is_degraded()
        );

        Ok(state)
    }

    /// Commits the decoded frame and recycles the buffers of the frames it evicted.
    ///
    /// Returns the evicted frame indices.
    pub fn end_frame(&mut self, pic: &PicParams) -> DpbResult<Vec<u8>> {
        if pic.large_scale_tile && pic.anchor_frame_insertion {
            return Ok(Vec::new());
        }

        let evicted = self.refs.update_cur_ref_list(pic);
        self.current_target = None;

        let mut result = Ok(());
        for frame_idx in &evicted {
            if let Err(e) = self.pool.release_frame(*frame_idx) {
                result = result.and(Err(e));
            }
        }

        result.map(|()| evicted)
    }

    /// Registers an anchor frame for large scale tile decoding.
    pub fn insert_anchor_frame(
        &mut self,
        pic: &PicParams,
        picture: PictureHandle,
    ) -> DpbResult<()> {
        validate_pic_params(pic)?;
        // Anchors have no temporal buffers, drop the ones of the frame they replace.
        self.pool.release_frame(pic.current_frame_idx)?;
        self.refs.insert_anchor_frame(pic, picture);
        Ok(())
    }

    /// Active references of a tile.
    pub fn tile_references(&self, pic: &PicParams, tile: &TileParams) -> ActiveReferenceList {
        self.refs.get_active_reference_list(pic, Some(tile))
    }

    /// Fills the hardware reference slots of the frame being decoded.
    ///
    /// Key frames use no reference. Otherwise every missing reference picture is replaced by the
    /// first valid DPB entry, or the current target if there is none, and every missing
    /// collocated motion vector buffer by the one of the first reference that has temporal
    /// buffers.
    pub fn resolve_reference_addresses(&self, pic: &PicParams) -> ReferenceAddresses {
        let mut addresses = ReferenceAddresses::default();
        let Some(target) = self.current_target else {
            return addresses;
        };

        addresses.pictures[0] = Some(target);
        addresses.collocated_mvs[0] = self.pool.current_bundle().map(|b| b.mv_buf());
        if pic.frame_type == FrameType::KeyFrame {
            return addresses;
        }

        let valid_picture = self
            .refs
            .get_valid_reference()
            .and_then(|entry| entry.picture)
            .unwrap_or(target);
        let ref_indices: Vec<u8> = self
            .refs
            .active_reference_list()
            .iter()
            .flatten()
            .copied()
            .collect();
        let valid_mv = self
            .pool
            .get_valid_buffer_for_reference(&ref_indices)
            .and_then(|id| self.pool.bundle(id))
            .map(|b| b.mv_buf());

        for (i, ref_frame) in ReferenceFrameType::INTER.into_iter().enumerate() {
            let entry = self.refs.active_ref_entry(ref_frame);
            addresses.pictures[i + 1] =
                Some(entry.and_then(|e| e.picture).unwrap_or(valid_picture));
            addresses.collocated_mvs[i + 1] = entry
                .and_then(|e| e.bundle)
                .and_then(|id| self.pool.bundle(id))
                .map(|b| b.mv_buf())
                .or(valid_mv);
        }

        addresses
    }

    /// Drops every reference and frees every temporal buffer, e.g. on a sequence change.
    pub fn flush(&mut self) {
        log::debug!("flushing the DPB");
        self.pool.destroy_all();
        self.refs.reset();
        self.current_target = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::avp::AvpBufferSizer;
    use crate::backend::dummy::DummyAllocator;
    use crate::codec::av1::picture_params::SegmentationParams;
    use crate::codec::av1::picture_params::INVALID_FRAME_INDEX;
    use crate::decoder::av1::temporal_buffers::CdfProvenance;
    use crate::decoder::av1::temporal_buffers::DEFAULT_CDF_TABLE_NUM;

    type TestContext = Av1DecodeContext<DummyAllocator, AvpBufferSizer>;

    fn context() -> TestContext {
        Av1DecodeContext::new(
            DummyAllocator::new(),
            AvpBufferSizer,
            PoolConfig {
                strict_ref_counting: true,
                ..Default::default()
            },
        )
    }

    fn key_frame() -> PicParams {
        PicParams {
            frame_width_minus_1: 1919,
            frame_height_minus_1: 1079,
            ..Default::default()
        }
    }

    fn inter_frame(idx: u8, order_hint: u8, primary_ref_frame: u8) -> PicParams {
        PicParams {
            current_frame_idx: idx,
            frame_type: FrameType::InterFrame,
            order_hint,
            ref_frame_map: [0; NUM_REF_FRAMES],
            primary_ref_frame,
            refresh_frame_flags: 0,
            ..key_frame()
        }
    }

    #[test]
    fn validation() {
        assert!(validate_pic_params(&key_frame()).is_ok());

        let pic = PicParams {
            frame_width_minus_1: 14,
            ..key_frame()
        };
        assert!(matches!(
            validate_pic_params(&pic),
            Err(DpbError::InvalidFrameSize { width: 15, .. })
        ));

        let pic = PicParams {
            frame_height_minus_1: 16384,
            ..key_frame()
        };
        assert!(matches!(
            validate_pic_params(&pic),
            Err(DpbError::InvalidFrameSize { .. })
        ));

        let pic = PicParams {
            current_frame_idx: 127,
            ..key_frame()
        };
        assert!(matches!(
            validate_pic_params(&pic),
            Err(DpbError::InvalidFrameIndex(127))
        ));
        let pic = PicParams {
            large_scale_tile: true,
            ..pic
        };
        assert!(validate_pic_params(&pic).is_ok());
        let pic = PicParams {
            current_frame_idx: INVALID_FRAME_INDEX,
            ..pic
        };
        assert!(validate_pic_params(&pic).is_err());

        let pic = PicParams {
            mono_chrome: true,
            ..key_frame()
        };
        assert!(matches!(
            validate_pic_params(&pic),
            Err(DpbError::UnsupportedMonochrome)
        ));
    }

    #[test]
    fn key_then_inter() {
        let mut ctx = context();

        let mut key = key_frame();
        let state = ctx.begin_frame(&mut key, GpuBuffer(1000)).unwrap();
        assert!(!state.concealment.is_degraded());
        assert_eq!(state.primary_ref_idx, None);
        assert_eq!(
            state.init_cdf_buf,
            Some(ctx.pool().default_cdf_table(0).unwrap().buffer())
        );
        assert!(state.motion_field.is_empty());
        assert_eq!(state.skip_mode_frames, None);

        let addresses = ctx.resolve_reference_addresses(&key);
        assert_eq!(addresses.pictures[0], Some(GpuBuffer(1000)));
        assert_eq!(addresses.collocated_mvs[0], state.mv_buf);
        assert_eq!(addresses.pictures[1..], [None::<GpuBuffer>; 7]);

        assert_eq!(ctx.end_frame(&key).unwrap(), Vec::<u8>::new());

        let mut inter = inter_frame(1, 1, 0);
        let state1 = ctx.begin_frame(&mut inter, GpuBuffer(1001)).unwrap();
        assert_eq!(state1.active_refs, [Some(0); 7]);
        assert_eq!(state1.primary_ref_idx, Some(0));
        assert_eq!(state1.init_cdf_buf, state.backward_adapted_cdf_buf);
        assert_eq!(
            ctx.pool().bundle(state1.bundle.unwrap()).unwrap().init_cdf_buf(),
            Some(CdfProvenance::AdaptedFrom(state.bundle.unwrap()))
        );

        let addresses = ctx.resolve_reference_addresses(&inter);
        assert_eq!(addresses.pictures, [
            Some(GpuBuffer(1001)),
            Some(GpuBuffer(1000)),
            Some(GpuBuffer(1000)),
            Some(GpuBuffer(1000)),
            Some(GpuBuffer(1000)),
            Some(GpuBuffer(1000)),
            Some(GpuBuffer(1000)),
            Some(GpuBuffer(1000)),
        ]);
        assert_eq!(addresses.collocated_mvs[1], state.mv_buf);

        // Frame 1 takes over every slot, frame 0 is evicted.
        inter.refresh_frame_flags = 0xff;
        assert_eq!(ctx.end_frame(&inter).unwrap(), vec![0]);
        assert_eq!(ctx.pool().get_buffer_by_frame_index(0), None);
        assert!(!ctx.pool().is_available(state.bundle.unwrap()));
    }

    #[test]
    fn temporal_segmentation_update_reads_primary_map() {
        let mut ctx = context();
        let mut key = key_frame();
        key.segmentation = SegmentationParams {
            enabled: true,
            update_map: true,
            ..Default::default()
        };
        let state0 = ctx.begin_frame(&mut key, GpuBuffer(1)).unwrap();
        assert!(!state0.segmentation.stream_in_enabled);
        assert_eq!(state0.segment_id_buf, None);
        ctx.end_frame(&key).unwrap();

        let mut inter = inter_frame(1, 1, 0);
        inter.segmentation = SegmentationParams {
            enabled: true,
            update_map: true,
            temporal_update: true,
            ..Default::default()
        };
        let state1 = ctx.begin_frame(&mut inter, GpuBuffer(2)).unwrap();

        assert!(state1.segmentation.stream_in_enabled);
        assert!(state1.segmentation.stream_out_enabled);
        assert_eq!(state1.segment_id_buf, state0.segment_write_buf);
        assert_ne!(state1.segment_id_buf, state1.segment_write_buf);
        // Later frames keeping the map chain through frame 1's own map.
        let bundle1 = state1.bundle.unwrap();
        assert_eq!(
            ctx.pool().bundle(bundle1).unwrap().segment_id_buf(),
            Some(SharedBufferId::SegmentWrite(bundle1))
        );
    }

    #[test]
    fn anchor_insertion_releases_replaced_frame_buffers() {
        let mut ctx = context();
        let mut pic = PicParams {
            current_frame_idx: 5,
            large_scale_tile: true,
            ..key_frame()
        };
        let state = ctx.begin_frame(&mut pic, GpuBuffer(5)).unwrap();
        ctx.end_frame(&pic).unwrap();
        assert_eq!(ctx.pool().get_buffer_by_frame_index(5), state.bundle);

        let mut anchor = PicParams {
            anchor_frame_insertion: true,
            ..pic.clone()
        };
        ctx.begin_frame(&mut anchor, GpuBuffer(50)).unwrap();
        assert_eq!(ctx.pool().get_buffer_by_frame_index(5), None);
        assert_eq!(ctx.pool().num_available(), 1);

        ctx.insert_anchor_frame(&pic, GpuBuffer(51)).unwrap();
        assert_eq!(ctx.pool().num_available(), 1);
        assert_eq!(
            ctx.reference_frames()
                .get_reference_by_frame_index(5)
                .and_then(|entry| entry.picture),
            Some(GpuBuffer(51))
        );
    }

    #[test]
    fn missing_references_are_concealed() {
        let mut ctx = context();
        let mut key = key_frame();
        key.current_frame_idx = 4;
        ctx.begin_frame(&mut key, GpuBuffer(4)).unwrap();
        ctx.end_frame(&key).unwrap();

        let mut inter = inter_frame(5, 1, 0);
        inter.ref_frame_map = [4, 9, 4, 4, 4, 4, 4, 4];
        inter.ref_frame_idx = [1, 0, 0, 0, 0, 0, 0];
        let state = ctx.begin_frame(&mut inter, GpuBuffer(5)).unwrap();

        assert!(state.concealment.is_degraded());
        assert_eq!(state.active_refs, [Some(4); 7]);
        assert_eq!(state.primary_ref_idx, None);
        assert_eq!(
            state.init_cdf_buf,
            Some(ctx.pool().default_cdf_table(0).unwrap().buffer())
        );
        let addresses = ctx.resolve_reference_addresses(&inter);
        assert_eq!(addresses.pictures[1], Some(GpuBuffer(4)));
    }

    #[test]
    fn resolve_without_any_reference() {
        let mut ctx = context();
        let mut inter = inter_frame(0, 3, 0);
        inter.ref_frame_map = [INVALID_FRAME_INDEX; NUM_REF_FRAMES];
        let state = ctx.begin_frame(&mut inter, GpuBuffer(7)).unwrap();
        assert_eq!(state.concealment.substituted.len(), 7);

        let addresses = ctx.resolve_reference_addresses(&inter);
        assert_eq!(addresses.pictures, [Some(GpuBuffer(7)); NUM_REF_FRAMES]);
        assert_eq!(addresses.collocated_mvs, [state.mv_buf; NUM_REF_FRAMES]);
    }

    #[test]
    fn invalid_header_is_rejected_before_any_allocation() {
        let mut ctx = context();
        let mut pic = PicParams {
            mono_chrome: true,
            ..key_frame()
        };

        assert!(ctx.begin_frame(&mut pic, GpuBuffer(1)).is_err());
        assert_eq!(ctx.allocator().num_allocations(), 0);
    }

    #[test]
    fn allocation_failure_propagates() {
        let mut ctx = context();
        ctx.allocator_mut().fail_after(DEFAULT_CDF_TABLE_NUM);
        let mut key = key_frame();

        assert!(matches!(
            ctx.begin_frame(&mut key, GpuBuffer(1)),
            Err(DpbError::Allocation(_))
        ));
    }

    #[test]
    fn flush_frees_everything() {
        let mut ctx = context();
        let mut key = key_frame();
        ctx.begin_frame(&mut key, GpuBuffer(1)).unwrap();
        ctx.end_frame(&key).unwrap();

        ctx.flush();
        assert_eq!(ctx.allocator().num_live_buffers(), 0);
        assert!(ctx.reference_frames().get_valid_reference().is_none());
    }
}
