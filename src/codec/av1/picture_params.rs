// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Already-parsed AV1 picture parameters, as handed over by the DDI layer.
//!
//! Nothing in this crate parses bitstreams: these structures are filled by the caller from the
//! frame header OBU (or from the driver interface parameter buffers) and only read here. The
//! only exception is error concealment, which repairs the reference map of the frame's working
//! copy in place.

use crate::Resolution;

/// Number of reference frame slots in the AV1 reference map.
pub const NUM_REF_FRAMES: usize = 8;
/// Number of inter references (LAST_FRAME to ALTREF_FRAME) a frame can use.
pub const REFS_PER_FRAME: usize = 7;
/// `primary_ref_frame` value meaning that the frame does not inherit any state.
pub const PRIMARY_REF_NONE: u8 = 7;
/// Frame index used by the DDI for an unset reference.
pub const INVALID_FRAME_INDEX: u8 = 0xff;
/// Maximum number of DPB entries in regular decoding.
pub const MAX_DPB_NUM: usize = 127;
/// Maximum number of DPB entries when large scale tile decoding is used.
pub const MAX_DPB_NUM_LST: usize = 255;

pub const MAX_SEGMENTS: usize = 8;
pub const SEG_LVL_MAX: usize = 8;
/// First segmentation feature that has to be read before the skip flag.
pub const SEG_LVL_REF_FRAME: usize = 5;

/// Valid range of `frame_width_minus_1` and `frame_height_minus_1`.
pub const MIN_FRAME_SIZE_MINUS_1: u16 = 15;
pub const MAX_FRAME_SIZE_MINUS_1: u16 = 16383;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FrameType {
    #[default]
    KeyFrame = 0,
    InterFrame = 1,
    IntraOnlyFrame = 2,
    SwitchFrame = 3,
}

impl FrameType {
    /// Whether frames of this type are decoded without any reference.
    pub fn is_intra(&self) -> bool {
        matches!(self, FrameType::KeyFrame | FrameType::IntraOnlyFrame)
    }
}

/// Reference frame names. `Last` to `AltRef` are the inter references, in the order in which
/// they appear in `ref_frame_idx`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReferenceFrameType {
    Intra = 0,
    Last = 1,
    Last2 = 2,
    Last3 = 3,
    Golden = 4,
    BwdRef = 5,
    AltRef2 = 6,
    AltRef = 7,
}

impl ReferenceFrameType {
    pub const INTER: [ReferenceFrameType; REFS_PER_FRAME] = [
        ReferenceFrameType::Last,
        ReferenceFrameType::Last2,
        ReferenceFrameType::Last3,
        ReferenceFrameType::Golden,
        ReferenceFrameType::BwdRef,
        ReferenceFrameType::AltRef2,
        ReferenceFrameType::AltRef,
    ];

    /// Position of an inter reference in `ref_frame_idx`, `None` for `Intra`.
    pub fn inter_index(&self) -> Option<usize> {
        match self {
            ReferenceFrameType::Intra => None,
            other => Some(*other as usize - ReferenceFrameType::Last as usize),
        }
    }

    /// Inverse of [`ReferenceFrameType::inter_index`].
    pub fn from_inter_index(index: usize) -> Option<Self> {
        Self::INTER.get(index).copied()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentationParams {
    pub enabled: bool,
    pub update_map: bool,
    pub temporal_update: bool,
    pub update_data: bool,
    /// Bit `n` of entry `s` is set when feature `n` is enabled for segment `s`.
    pub feature_mask: [u8; MAX_SEGMENTS],
}

/// Per-tile parameters relevant to reference selection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TileParams {
    /// Anchor frame used by every reference of the tile in large scale tile mode.
    pub anchor_frame_idx: u8,
}

/// Parsed picture parameters of the frame being decoded.
///
/// `ref_frame_map` holds, for each of the eight AV1 reference slots, the DPB frame index of the
/// picture stored there, or [`INVALID_FRAME_INDEX`]. `ref_frame_idx` selects, for each inter
/// reference, which of those slots is used.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PicParams {
    pub current_frame_idx: u8,
    pub frame_width_minus_1: u16,
    pub frame_height_minus_1: u16,
    pub frame_type: FrameType,
    pub show_frame: bool,
    pub bit_depth_idx: u8,
    pub mono_chrome: bool,
    pub use_128x128_superblock: bool,

    pub enable_order_hint: bool,
    pub order_hint_bits_minus_1: u8,
    pub order_hint: u8,

    pub ref_frame_map: [u8; NUM_REF_FRAMES],
    pub ref_frame_idx: [u8; REFS_PER_FRAME],
    pub primary_ref_frame: u8,
    pub refresh_frame_flags: u8,
    /// `reference_select` from the frame header: compound references may be used.
    pub reference_select: bool,

    pub disable_frame_end_update_cdf: bool,
    pub base_q_idx: u8,
    pub segmentation: SegmentationParams,

    pub large_scale_tile: bool,
    pub anchor_frame_insertion: bool,
}

impl Default for PicParams {
    fn default() -> Self {
        Self {
            current_frame_idx: 0,
            frame_width_minus_1: MIN_FRAME_SIZE_MINUS_1,
            frame_height_minus_1: MIN_FRAME_SIZE_MINUS_1,
            frame_type: FrameType::KeyFrame,
            show_frame: true,
            bit_depth_idx: 0,
            mono_chrome: false,
            use_128x128_superblock: false,
            enable_order_hint: true,
            order_hint_bits_minus_1: 6,
            order_hint: 0,
            ref_frame_map: [INVALID_FRAME_INDEX; NUM_REF_FRAMES],
            ref_frame_idx: [0; REFS_PER_FRAME],
            primary_ref_frame: PRIMARY_REF_NONE,
            refresh_frame_flags: 0xff,
            reference_select: false,
            disable_frame_end_update_cdf: false,
            base_q_idx: 0,
            segmentation: Default::default(),
            large_scale_tile: false,
            anchor_frame_insertion: false,
        }
    }
}

impl PicParams {
    pub fn frame_width(&self) -> u32 {
        u32::from(self.frame_width_minus_1) + 1
    }

    pub fn frame_height(&self) -> u32 {
        u32::from(self.frame_height_minus_1) + 1
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::from((self.frame_width(), self.frame_height()))
    }

    /// Frame width in 4x4 mode-info units, as defined by the AV1 specification.
    pub fn mi_cols(&self) -> u32 {
        2 * ((self.frame_width() + 7) >> 3)
    }

    pub fn mi_rows(&self) -> u32 {
        2 * ((self.frame_height() + 7) >> 3)
    }

    pub fn superblock_size(&self) -> u32 {
        if self.use_128x128_superblock {
            128
        } else {
            64
        }
    }

    /// Frame size in superblocks, rounded up.
    pub fn size_in_superblocks(&self) -> (u32, u32) {
        self.resolution().in_blocks(self.superblock_size())
    }

    pub fn is_intra(&self) -> bool {
        self.frame_type.is_intra()
    }

    pub fn has_primary_ref(&self) -> bool {
        self.primary_ref_frame != PRIMARY_REF_NONE
    }

    /// DPB frame index referenced by inter reference `ref_frame`, if the indices are in range.
    pub fn ref_frame_index(&self, ref_frame: ReferenceFrameType) -> Option<u8> {
        let slot = *self.ref_frame_idx.get(ref_frame.inter_index()?)? as usize;
        self.ref_frame_map
            .get(slot)
            .copied()
            .filter(|idx| *idx != INVALID_FRAME_INDEX)
    }

    /// DPB frame index of the primary reference frame, if there is one.
    pub fn primary_ref_frame_index(&self) -> Option<u8> {
        if !self.has_primary_ref() {
            return None;
        }
        ReferenceFrameType::from_inter_index(self.primary_ref_frame as usize)
            .and_then(|ref_frame| self.ref_frame_index(ref_frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_info_geometry() {
        let pic = PicParams {
            frame_width_minus_1: 1919,
            frame_height_minus_1: 1079,
            ..Default::default()
        };

        assert_eq!(pic.mi_cols(), 480);
        assert_eq!(pic.mi_rows(), 270);
        assert_eq!(pic.size_in_superblocks(), (30, 17));

        let pic = PicParams {
            use_128x128_superblock: true,
            ..pic
        };
        assert_eq!(pic.size_in_superblocks(), (15, 9));
    }

    #[test]
    fn reference_lookup() {
        let mut pic = PicParams {
            frame_type: FrameType::InterFrame,
            ref_frame_map: [3, 4, 5, 6, 7, 8, 9, INVALID_FRAME_INDEX],
            ref_frame_idx: [0, 1, 2, 3, 4, 5, 7],
            primary_ref_frame: 3,
            ..Default::default()
        };

        assert_eq!(pic.ref_frame_index(ReferenceFrameType::Last), Some(3));
        assert_eq!(pic.ref_frame_index(ReferenceFrameType::AltRef2), Some(8));
        assert_eq!(pic.ref_frame_index(ReferenceFrameType::AltRef), None);
        assert_eq!(pic.ref_frame_index(ReferenceFrameType::Intra), None);
        assert_eq!(pic.primary_ref_frame_index(), Some(6));

        pic.ref_frame_idx[0] = 12;
        assert_eq!(pic.ref_frame_index(ReferenceFrameType::Last), None);

        pic.primary_ref_frame = PRIMARY_REF_NONE;
        assert_eq!(pic.primary_ref_frame_index(), None);
    }

    #[test]
    fn inter_index_round_trip() {
        for (i, ref_frame) in ReferenceFrameType::INTER.iter().enumerate() {
            assert_eq!(ref_frame.inter_index(), Some(i));
            assert_eq!(ReferenceFrameType::from_inter_index(i), Some(*ref_frame));
        }
        assert_eq!(ReferenceFrameType::from_inter_index(REFS_PER_FRAME), None);
    }
}
