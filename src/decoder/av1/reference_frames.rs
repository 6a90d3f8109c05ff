// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decoded picture buffer of an AV1 decode context.
//!
//! [`ReferenceFrameTable`] tracks, for every DPB frame index, the picture stored there and the
//! side information later frames need from it: its order hint, the order hints of its own
//! references, its geometry and its segmentation state. Each frame goes through
//! [`ReferenceFrameTable::update_picture`] before decoding, which repairs the references of the
//! frame header if needed and resolves them into an active reference list, and through
//! [`ReferenceFrameTable::update_cur_ref_list`] once decoded, which commits it and evicts the
//! frames the refresh mask dropped.

use crate::backend::PictureHandle;
use crate::codec::av1::picture_params::FrameType;
use crate::codec::av1::picture_params::PicParams;
use crate::codec::av1::picture_params::ReferenceFrameType;
use crate::codec::av1::picture_params::TileParams;
use crate::codec::av1::picture_params::MAX_DPB_NUM;
use crate::codec::av1::picture_params::MAX_DPB_NUM_LST;
use crate::codec::av1::picture_params::MAX_SEGMENTS;
use crate::codec::av1::picture_params::NUM_REF_FRAMES;
use crate::codec::av1::picture_params::PRIMARY_REF_NONE;
use crate::codec::av1::picture_params::REFS_PER_FRAME;
use crate::codec::av1::picture_params::SEG_LVL_MAX;
use crate::codec::av1::picture_params::SEG_LVL_REF_FRAME;
use crate::decoder::av1::motion_field::MotionFieldMask;
use crate::decoder::av1::motion_field::MotionFieldProjector;
use crate::decoder::av1::motion_field::ProjectionDirection;
use crate::decoder::av1::temporal_buffers::BundleId;

/// DPB frame indices of the inter references of a frame, in `ReferenceFrameType::INTER` order.
pub type ActiveReferenceList = [Option<u8>; REFS_PER_FRAME];

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SlotState {
    #[default]
    Empty,
    /// The frame is being decoded into this slot.
    Decoding,
    /// Decoded and usable as a reference.
    Committed,
    /// Dropped from the reference map. Its buffers may still be read by in-flight frames.
    Evicted,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DpbEntry {
    pub frame_idx: u8,
    pub state: SlotState,
    pub picture: Option<PictureHandle>,
    pub bundle: Option<BundleId>,
    pub frame_type: FrameType,
    pub order_hint: u8,
    /// Order hints of this frame's own inter references.
    pub ref_order_hints: [u8; REFS_PER_FRAME],
    pub ref_frame_sign_bias: [bool; REFS_PER_FRAME],
    pub ref_frame_side: [bool; REFS_PER_FRAME],
    pub mi_cols: u32,
    pub mi_rows: u32,
    pub segmentation_enabled: bool,
    pub last_active_seg_id: u8,
    pub pre_skip_seg_id: bool,
    /// Large scale tile anchor frame, not subject to the refresh mask.
    pub is_anchor: bool,
}

impl DpbEntry {
    fn new(frame_idx: u8) -> Self {
        Self {
            frame_idx,
            ..Default::default()
        }
    }

    pub fn is_committed(&self) -> bool {
        self.state == SlotState::Committed
    }
}

/// What error concealment had to change in the frame's references.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConcealmentReport {
    /// References that named a missing frame and now use the substitute.
    pub substituted: Vec<ReferenceFrameType>,
    /// Frame index used in place of the missing references.
    pub substitute_frame_idx: Option<u8>,
    /// The primary reference frame was missing and the frame starts from default state instead.
    pub primary_ref_dropped: bool,
}

impl ConcealmentReport {
    /// Whether the frame will not decode exactly as encoded.
    pub fn is_degraded(&self) -> bool {
        !self.substituted.is_empty() || self.primary_ref_dropped
    }
}

/// A reference frame selected by its distance to the current frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NearRef {
    pub ref_frame: ReferenceFrameType,
    pub frame_idx: u8,
    pub order_hint: u8,
}

/// Segmentation buffers usage and side data of the current frame.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentationState {
    /// The segment id map of a previous frame is read.
    pub stream_in_enabled: bool,
    /// The frame writes its own segment id map.
    pub stream_out_enabled: bool,
    pub last_active_seg_id: u8,
    pub pre_skip_seg_id: bool,
}

pub struct ReferenceFrameTable {
    entries: Vec<DpbEntry>,
    dpb_limit: usize,
    current_frame_idx: Option<u8>,
    active_refs: ActiveReferenceList,
    primary_ref_idx: Option<u8>,
}

impl Default for ReferenceFrameTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceFrameTable {
    pub fn new() -> Self {
        Self {
            entries: (0..MAX_DPB_NUM_LST)
                .map(|idx| DpbEntry::new(idx as u8))
                .collect(),
            dpb_limit: MAX_DPB_NUM,
            current_frame_idx: None,
            active_refs: [None; REFS_PER_FRAME],
            primary_ref_idx: None,
        }
    }

    /// Wraps `a - b` into the order hint range of `pic`. Always 0 when order hints are disabled.
    ///
    /// When `a - b` is exactly half the range, both `(a, b)` and `(b, a)` give the most
    /// negative distance.
    pub fn get_relative_dist(pic: &PicParams, a: u8, b: u8) -> i32 {
        if !pic.enable_order_hint {
            return 0;
        }

        let bits = (u32::from(pic.order_hint_bits_minus_1) + 1).min(u8::BITS);
        let m = 1i32 << (bits - 1);
        let diff = i32::from(a) - i32::from(b);

        (diff & (m - 1)) - (diff & m)
    }

    /// Prepares the table for decoding `pic` into `target`.
    ///
    /// References to missing frames are concealed in `pic` first, so this never fails. The
    /// returned report tells whether the frame is degraded.
    pub fn update_picture(
        &mut self,
        pic: &mut PicParams,
        target: PictureHandle,
    ) -> ConcealmentReport {
        self.dpb_limit = if pic.large_scale_tile {
            MAX_DPB_NUM_LST
        } else {
            MAX_DPB_NUM
        };
        self.current_frame_idx = Some(pic.current_frame_idx);

        let report = self.error_concealment(pic);
        self.active_refs = self.resolve_active_refs(pic, report.substitute_frame_idx);
        // Intra-only frames may still inherit state from a primary reference frame.
        self.primary_ref_idx = pic
            .primary_ref_frame_index()
            .filter(|idx| self.is_valid_reference(*idx));
        self.update_cur_frame(pic, target);

        log::debug!(
            "frame {}: order hint {}, references {:?}, primary {:?}",
            pic.current_frame_idx,
            pic.order_hint,
            self.active_refs,
            self.primary_ref_idx
        );

        report
    }

    fn resolve_active_refs(&self, pic: &PicParams, substitute: Option<u8>) -> ActiveReferenceList {
        let mut refs = [None; REFS_PER_FRAME];
        if pic.is_intra() {
            return refs;
        }

        for (active, ref_frame) in refs.iter_mut().zip(ReferenceFrameType::INTER) {
            *active = pic
                .ref_frame_index(ref_frame)
                .filter(|idx| self.is_valid_reference(*idx))
                .or(substitute);
        }

        refs
    }

    fn is_valid_reference(&self, frame_idx: u8) -> bool {
        self.get_reference_by_frame_index(frame_idx).is_some()
    }

    /// Repairs the references of `pic` that name frames absent from the DPB.
    ///
    /// Only the frame's own reference map is changed; committed entries are left alone.
    pub fn error_concealment(&self, pic: &mut PicParams) -> ConcealmentReport {
        let mut report = ConcealmentReport::default();
        let valid = self.get_valid_reference_index();

        if pic.has_primary_ref() {
            let primary = pic
                .primary_ref_frame_index()
                .filter(|idx| self.is_valid_reference(*idx));
            if primary.is_none() {
                log::warn!(
                    "frame {}: primary reference frame {} is missing, using default state",
                    pic.current_frame_idx,
                    pic.primary_ref_frame
                );
                pic.primary_ref_frame = PRIMARY_REF_NONE;
                report.primary_ref_dropped = true;
            }
        }

        if pic.is_intra() {
            return report;
        }

        for (i, ref_frame) in ReferenceFrameType::INTER.into_iter().enumerate() {
            if pic
                .ref_frame_index(ref_frame)
                .is_some_and(|idx| self.is_valid_reference(idx))
            {
                continue;
            }

            report.substituted.push(ref_frame);
            let Some(valid) = valid else {
                continue;
            };

            let slot = pic.ref_frame_idx[i] as usize;
            if slot < NUM_REF_FRAMES {
                pic.ref_frame_map[slot] = valid;
            } else if let Some(slot) = pic.ref_frame_map.iter().position(|idx| *idx == valid) {
                pic.ref_frame_idx[i] = slot as u8;
            }
        }

        if !report.substituted.is_empty() {
            report.substitute_frame_idx = valid;
            match valid {
                Some(valid) => log::warn!(
                    "frame {}: references {:?} are missing, using frame {} instead",
                    pic.current_frame_idx,
                    report.substituted,
                    valid
                ),
                None => log::warn!(
                    "frame {}: references {:?} are missing and the DPB holds no frame",
                    pic.current_frame_idx,
                    report.substituted
                ),
            }
        }

        report
    }

    /// Registers an external anchor frame for large scale tile decoding.
    pub fn insert_anchor_frame(&mut self, pic: &PicParams, picture: PictureHandle) {
        let Some(entry) = self.entries.get_mut(pic.current_frame_idx as usize) else {
            log::warn!("anchor frame index {} is out of range", pic.current_frame_idx);
            return;
        };

        *entry = DpbEntry {
            state: SlotState::Committed,
            picture: Some(picture),
            frame_type: pic.frame_type,
            order_hint: pic.order_hint,
            mi_cols: pic.mi_cols(),
            mi_rows: pic.mi_rows(),
            is_anchor: true,
            ..DpbEntry::new(pic.current_frame_idx)
        };
        log::debug!("inserted anchor frame {}", pic.current_frame_idx);
    }

    /// Committed entry of `frame_idx`, `None` if the index is out of range or unused.
    pub fn get_reference_by_frame_index(&self, frame_idx: u8) -> Option<&DpbEntry> {
        if frame_idx as usize >= self.dpb_limit {
            return None;
        }
        self.entries
            .get(frame_idx as usize)
            .filter(|entry| entry.is_committed())
    }

    /// First committed entry of the DPB.
    pub fn get_valid_reference(&self) -> Option<&DpbEntry> {
        self.entries[..self.dpb_limit]
            .iter()
            .find(|entry| entry.is_committed())
    }

    pub fn get_valid_reference_index(&self) -> Option<u8> {
        self.get_valid_reference().map(|entry| entry.frame_idx)
    }

    pub fn entry(&self, frame_idx: u8) -> Option<&DpbEntry> {
        self.entries.get(frame_idx as usize)
    }

    pub fn current_entry(&self) -> Option<&DpbEntry> {
        self.current_frame_idx.and_then(|idx| self.entry(idx))
    }

    fn current_entry_mut(&mut self) -> Option<&mut DpbEntry> {
        let idx = self.current_frame_idx?;
        self.entries.get_mut(idx as usize)
    }

    /// Frame indices of all the committed entries.
    pub fn reference_frame_indices(&self) -> Vec<u8> {
        self.entries
            .iter()
            .filter(|entry| entry.is_committed())
            .map(|entry| entry.frame_idx)
            .collect()
    }

    pub fn active_reference_list(&self) -> &ActiveReferenceList {
        &self.active_refs
    }

    /// Active reference list of a tile. In large scale tile mode every reference of a tile is its
    /// anchor frame.
    pub fn get_active_reference_list(
        &self,
        pic: &PicParams,
        tile: Option<&TileParams>,
    ) -> ActiveReferenceList {
        match tile {
            Some(tile) if pic.large_scale_tile => {
                let anchor = Some(tile.anchor_frame_idx)
                    .filter(|idx| self.is_valid_reference(*idx))
                    .or_else(|| {
                        log::warn!("anchor frame {} is missing", tile.anchor_frame_idx);
                        self.get_valid_reference_index()
                    });
                [anchor; REFS_PER_FRAME]
            }
            _ => self.active_refs,
        }
    }

    pub fn active_ref(&self, ref_frame: ReferenceFrameType) -> Option<u8> {
        ref_frame
            .inter_index()
            .and_then(|i| self.active_refs[i])
    }

    pub fn active_ref_entry(&self, ref_frame: ReferenceFrameType) -> Option<&DpbEntry> {
        self.active_ref(ref_frame)
            .and_then(|idx| self.get_reference_by_frame_index(idx))
    }

    /// DPB frame index of the primary reference frame of the current frame.
    pub fn get_primary_ref_idx(&self) -> Option<u8> {
        self.primary_ref_idx
    }

    pub fn primary_ref_entry(&self) -> Option<&DpbEntry> {
        self.primary_ref_idx
            .and_then(|idx| self.get_reference_by_frame_index(idx))
    }

    /// Nearest forward and nearest backward references of the current frame.
    ///
    /// On equal order hints the reference that comes first in `ReferenceFrameType::INTER` wins.
    pub fn identify_1st_near_ref(&self, pic: &PicParams) -> (Option<NearRef>, Option<NearRef>) {
        let mut forward: Option<NearRef> = None;
        let mut backward: Option<NearRef> = None;

        for candidate in self.near_ref_candidates() {
            let dist = Self::get_relative_dist(pic, candidate.order_hint, pic.order_hint);
            if dist < 0 {
                if forward.map_or(true, |f| {
                    Self::get_relative_dist(pic, candidate.order_hint, f.order_hint) > 0
                }) {
                    forward = Some(candidate);
                }
            } else if dist > 0
                && backward.map_or(true, |b| {
                    Self::get_relative_dist(pic, candidate.order_hint, b.order_hint) < 0
                })
            {
                backward = Some(candidate);
            }
        }

        (forward, backward)
    }

    /// Nearest forward reference strictly before `forward`.
    pub fn identify_2nd_near_ref(&self, pic: &PicParams, forward: &NearRef) -> Option<NearRef> {
        let mut second: Option<NearRef> = None;

        for candidate in self.near_ref_candidates() {
            if Self::get_relative_dist(pic, candidate.order_hint, forward.order_hint) < 0
                && second.map_or(true, |s| {
                    Self::get_relative_dist(pic, candidate.order_hint, s.order_hint) > 0
                })
            {
                second = Some(candidate);
            }
        }

        second
    }

    fn near_ref_candidates(&self) -> impl Iterator<Item = NearRef> + '_ {
        ReferenceFrameType::INTER
            .into_iter()
            .filter_map(move |ref_frame| {
                self.active_ref_entry(ref_frame).map(|entry| NearRef {
                    ref_frame,
                    frame_idx: entry.frame_idx,
                    order_hint: entry.order_hint,
                })
            })
    }

    /// The two references used by skip mode, `None` if skip mode is not allowed.
    pub fn skip_mode_frames(&self, pic: &PicParams) -> Option<[ReferenceFrameType; 2]> {
        if !pic.enable_order_hint || pic.is_intra() || !pic.reference_select {
            return None;
        }

        let (forward, backward) = self.identify_1st_near_ref(pic);
        let forward = forward?;
        let other = match backward {
            Some(backward) => backward,
            None => self.identify_2nd_near_ref(pic, &forward)?,
        };

        let (a, b) = (forward.ref_frame, other.ref_frame);
        Some([a.min(b), a.max(b)])
    }

    /// Whether the segment id map of the primary reference frame can be read by `pic`.
    pub fn check_seg_for_prim_frame(&self, pic: &PicParams) -> bool {
        self.primary_ref_entry().is_some_and(|primary| {
            primary.segmentation_enabled
                && primary.mi_cols == pic.mi_cols()
                && primary.mi_rows == pic.mi_rows()
        })
    }

    /// Derives the segmentation state of the current frame and records it in its entry.
    pub fn set_segment_data(&mut self, pic: &PicParams) -> SegmentationState {
        let seg = &pic.segmentation;
        let mut state = SegmentationState::default();

        if seg.enabled {
            state.stream_in_enabled =
                (seg.temporal_update || !seg.update_map) && self.check_seg_for_prim_frame(pic);
            state.stream_out_enabled = seg.update_map;

            if seg.update_data {
                for (seg_id, mask) in seg.feature_mask.iter().enumerate().take(MAX_SEGMENTS) {
                    for lvl in (0..SEG_LVL_MAX).filter(|lvl| mask & (1 << lvl) != 0) {
                        state.pre_skip_seg_id |= lvl >= SEG_LVL_REF_FRAME;
                        state.last_active_seg_id = seg_id as u8;
                    }
                }
            } else if let Some(primary) = self.primary_ref_entry() {
                state.last_active_seg_id = primary.last_active_seg_id;
                state.pre_skip_seg_id = primary.pre_skip_seg_id;
            }
        }

        if let Some(entry) = self.current_entry_mut() {
            entry.last_active_seg_id = state.last_active_seg_id;
            entry.pre_skip_seg_id = state.pre_skip_seg_id;
        }

        state
    }

    pub fn setup_motion_field_projection(&self, pic: &PicParams) -> MotionFieldMask {
        MotionFieldProjector::new(self, pic).setup()
    }

    pub fn motion_field_projection(
        &self,
        pic: &PicParams,
        ref_frame: ReferenceFrameType,
        dir: ProjectionDirection,
    ) -> bool {
        MotionFieldProjector::new(self, pic).motion_field_projection(ref_frame, dir)
    }

    /// Starts the entry of the frame being decoded.
    pub fn update_cur_frame(&mut self, pic: &PicParams, target: PictureHandle) {
        let mut ref_order_hints = [0; REFS_PER_FRAME];
        let mut ref_frame_sign_bias = [false; REFS_PER_FRAME];
        let mut ref_frame_side = [false; REFS_PER_FRAME];

        for (i, ref_frame) in ReferenceFrameType::INTER.into_iter().enumerate() {
            let Some(ref_hint) = self.active_ref_entry(ref_frame).map(|e| e.order_hint) else {
                continue;
            };
            ref_order_hints[i] = ref_hint;

            if pic.enable_order_hint && !pic.is_intra() {
                let dist = Self::get_relative_dist(pic, ref_hint, pic.order_hint);
                ref_frame_sign_bias[i] = dist > 0;
                ref_frame_side[i] = dist > 0 || ref_hint == pic.order_hint;
            }
        }

        let Some(entry) = self.entries.get_mut(pic.current_frame_idx as usize) else {
            return;
        };
        if entry.is_committed() {
            log::debug!("frame {} overwrites a reference", pic.current_frame_idx);
        }

        *entry = DpbEntry {
            state: SlotState::Decoding,
            picture: Some(target),
            frame_type: pic.frame_type,
            order_hint: pic.order_hint,
            ref_order_hints,
            ref_frame_sign_bias,
            ref_frame_side,
            mi_cols: pic.mi_cols(),
            mi_rows: pic.mi_rows(),
            segmentation_enabled: pic.segmentation.enabled,
            ..DpbEntry::new(pic.current_frame_idx)
        };
    }

    /// Attaches the temporal buffers of the current frame to its entry.
    pub fn update_cur_resource(&mut self, bundle: BundleId) {
        if let Some(entry) = self.current_entry_mut() {
            entry.bundle = Some(bundle);
        }
    }

    /// Commits the current frame and applies its refresh mask.
    ///
    /// Returns the frame indices that are no longer referenced, in increasing order.
    pub fn update_cur_ref_list(&mut self, pic: &PicParams) -> Vec<u8> {
        let cur = pic.current_frame_idx;
        if let Some(entry) = self.current_entry_mut() {
            if entry.state == SlotState::Decoding {
                entry.state = SlotState::Committed;
            }
        }

        let mut ref_frame_map = pic.ref_frame_map;
        for (slot, idx) in ref_frame_map.iter_mut().enumerate() {
            if pic.refresh_frame_flags & (1 << slot) != 0 {
                *idx = cur;
            }
        }

        let mut evicted = Vec::new();
        for entry in self.entries.iter_mut() {
            if entry.is_committed()
                && !entry.is_anchor
                && !ref_frame_map.contains(&entry.frame_idx)
            {
                entry.state = SlotState::Evicted;
                evicted.push(entry.frame_idx);
            }
        }
        self.current_frame_idx = None;

        if !evicted.is_empty() {
            log::debug!("frame {} evicts {:?}", cur, evicted);
        }

        evicted
    }

    /// Puts the table back to its initial state.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}
