// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Selection of the references whose motion vectors are projected onto the current frame.

use crate::codec::av1::picture_params::PicParams;
use crate::codec::av1::picture_params::ReferenceFrameType;
use crate::decoder::av1::reference_frames::ReferenceFrameTable;

/// Maximum number of references used for motion field projection.
pub const MFMV_STACK_SIZE: i32 = 3;

/// Side of the current frame a projected reference lies on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProjectionDirection {
    /// The reference is displayed after the current frame.
    Backward = 0,
    /// The reference is displayed before the current frame.
    Forward = 2,
}

/// Set of inter references selected for projection. Bit `n` stands for
/// `ReferenceFrameType::INTER[n]`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MotionFieldMask(u8);

impl MotionFieldMask {
    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, ref_frame: ReferenceFrameType) -> bool {
        ref_frame
            .inter_index()
            .is_some_and(|i| self.0 & (1 << i) != 0)
    }

    pub fn insert(&mut self, ref_frame: ReferenceFrameType) {
        if let Some(i) = ref_frame.inter_index() {
            self.0 |= 1 << i;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = ReferenceFrameType> + '_ {
        ReferenceFrameType::INTER
            .into_iter()
            .filter(move |ref_frame| self.contains(*ref_frame))
    }
}

/// Evaluates motion field projection for one frame against the DPB.
pub struct MotionFieldProjector<'a> {
    table: &'a ReferenceFrameTable,
    pic: &'a PicParams,
}

impl<'a> MotionFieldProjector<'a> {
    pub fn new(table: &'a ReferenceFrameTable, pic: &'a PicParams) -> Self {
        Self { table, pic }
    }

    fn dist_to_current(&self, ref_frame: ReferenceFrameType) -> Option<i32> {
        self.table.active_ref_entry(ref_frame).map(|entry| {
            ReferenceFrameTable::get_relative_dist(self.pic, entry.order_hint, self.pic.order_hint)
        })
    }

    /// Whether the motion vectors of `ref_frame` can be projected in direction `dir`.
    ///
    /// Projection is skipped for missing and intra references, for references of a different
    /// size, and for references not on the `dir` side of the current frame.
    pub fn motion_field_projection(
        &self,
        ref_frame: ReferenceFrameType,
        dir: ProjectionDirection,
    ) -> bool {
        let Some(entry) = self.table.active_ref_entry(ref_frame) else {
            return false;
        };
        if entry.frame_type.is_intra() {
            return false;
        }
        if entry.mi_rows != self.pic.mi_rows() || entry.mi_cols != self.pic.mi_cols() {
            log::trace!("{:?} has a different size, not projected", ref_frame);
            return false;
        }

        let dist =
            ReferenceFrameTable::get_relative_dist(self.pic, entry.order_hint, self.pic.order_hint);
        match dir {
            ProjectionDirection::Backward => dist > 0,
            ProjectionDirection::Forward => dist < 0,
        }
    }

    /// Picks the references to project, in the order of the AV1 motion field estimation process.
    pub fn setup(&self) -> MotionFieldMask {
        let mut mask = MotionFieldMask::default();
        if self.pic.is_intra() || !self.pic.enable_order_hint {
            return mask;
        }

        let mut ref_stamp = MFMV_STACK_SIZE - 1;

        if let Some(last) = self.table.active_ref_entry(ReferenceFrameType::Last) {
            let alt_of_last = ReferenceFrameType::AltRef
                .inter_index()
                .map(|i| last.ref_order_hints[i]);
            let golden = self
                .table
                .active_ref_entry(ReferenceFrameType::Golden)
                .map(|entry| entry.order_hint);
            // LAST is the overlay of GOLDEN.
            let is_overlay = alt_of_last.is_some() && alt_of_last == golden;
            if !is_overlay
                && self.motion_field_projection(
                    ReferenceFrameType::Last,
                    ProjectionDirection::Forward,
                )
            {
                mask.insert(ReferenceFrameType::Last);
            }
            ref_stamp -= 1;
        }

        for ref_frame in [ReferenceFrameType::BwdRef, ReferenceFrameType::AltRef2] {
            if self.dist_to_current(ref_frame).is_some_and(|d| d > 0)
                && self.motion_field_projection(ref_frame, ProjectionDirection::Backward)
            {
                mask.insert(ref_frame);
                ref_stamp -= 1;
            }
        }

        if ref_stamp >= 0
            && self
                .dist_to_current(ReferenceFrameType::AltRef)
                .is_some_and(|d| d > 0)
            && self.motion_field_projection(
                ReferenceFrameType::AltRef,
                ProjectionDirection::Backward,
            )
        {
            mask.insert(ReferenceFrameType::AltRef);
            ref_stamp -= 1;
        }

        if ref_stamp >= 0
            && self.motion_field_projection(ReferenceFrameType::Last2, ProjectionDirection::Forward)
        {
            mask.insert(ReferenceFrameType::Last2);
        }

        log::trace!("frame {}: projecting {:?}", self.pic.current_frame_idx, mask);
        mask
    }
}
