// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! JSON description of a sequence of already-parsed AV1 frame headers.

use cros_av1_dpb::backend::GpuBuffer;
use cros_av1_dpb::backend::PictureHandle;
use cros_av1_dpb::codec::av1::picture_params::FrameType;
use cros_av1_dpb::codec::av1::picture_params::PicParams;
use cros_av1_dpb::codec::av1::picture_params::SegmentationParams;
use cros_av1_dpb::codec::av1::picture_params::INVALID_FRAME_INDEX;
use cros_av1_dpb::codec::av1::picture_params::MAX_SEGMENTS;
use cros_av1_dpb::codec::av1::picture_params::NUM_REF_FRAMES;
use cros_av1_dpb::codec::av1::picture_params::PRIMARY_REF_NONE;
use cros_av1_dpb::codec::av1::picture_params::REFS_PER_FRAME;
use cros_av1_dpb::decoder::av1::temporal_buffers::PoolConfig;
use serde::Deserialize;

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScriptFrameType {
    #[default]
    Key,
    Inter,
    IntraOnly,
    Switch,
}

impl From<ScriptFrameType> for FrameType {
    fn from(value: ScriptFrameType) -> Self {
        match value {
            ScriptFrameType::Key => FrameType::KeyFrame,
            ScriptFrameType::Inter => FrameType::InterFrame,
            ScriptFrameType::IntraOnly => FrameType::IntraOnlyFrame,
            ScriptFrameType::Switch => FrameType::SwitchFrame,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScriptSegmentation {
    pub update_map: bool,
    pub temporal_update: bool,
    pub update_data: bool,
    pub feature_mask: [u8; MAX_SEGMENTS],
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScriptFrame {
    pub frame_idx: u8,
    pub frame_type: ScriptFrameType,
    pub width: u16,
    pub height: u16,
    pub order_hint: u8,
    pub order_hint_bits: u8,
    pub ref_frame_map: [u8; NUM_REF_FRAMES],
    pub ref_frame_idx: [u8; REFS_PER_FRAME],
    pub primary_ref_frame: Option<u8>,
    pub refresh_frame_flags: u8,
    pub reference_select: bool,
    pub disable_frame_end_update_cdf: bool,
    pub base_q_idx: u8,
    pub sb128: bool,
    pub segmentation: Option<ScriptSegmentation>,
    /// Handle of the decoded picture. Defaults to a value derived from the frame index.
    pub picture: Option<u64>,
}

impl Default for ScriptFrame {
    fn default() -> Self {
        Self {
            frame_idx: 0,
            frame_type: ScriptFrameType::Key,
            width: 1920,
            height: 1080,
            order_hint: 0,
            order_hint_bits: 7,
            ref_frame_map: [INVALID_FRAME_INDEX; NUM_REF_FRAMES],
            ref_frame_idx: [0; REFS_PER_FRAME],
            primary_ref_frame: None,
            refresh_frame_flags: 0,
            reference_select: false,
            disable_frame_end_update_cdf: false,
            base_q_idx: 0,
            sb128: false,
            segmentation: None,
            picture: None,
        }
    }
}

impl ScriptFrame {
    pub fn pic_params(&self) -> PicParams {
        let segmentation = match &self.segmentation {
            Some(seg) => SegmentationParams {
                enabled: true,
                update_map: seg.update_map,
                temporal_update: seg.temporal_update,
                update_data: seg.update_data,
                feature_mask: seg.feature_mask,
            },
            None => Default::default(),
        };

        PicParams {
            current_frame_idx: self.frame_idx,
            frame_width_minus_1: self.width.saturating_sub(1),
            frame_height_minus_1: self.height.saturating_sub(1),
            frame_type: self.frame_type.into(),
            use_128x128_superblock: self.sb128,
            enable_order_hint: self.order_hint_bits > 0,
            order_hint_bits_minus_1: self.order_hint_bits.saturating_sub(1),
            order_hint: self.order_hint,
            ref_frame_map: self.ref_frame_map,
            ref_frame_idx: self.ref_frame_idx,
            primary_ref_frame: self.primary_ref_frame.unwrap_or(PRIMARY_REF_NONE),
            refresh_frame_flags: self.refresh_frame_flags,
            reference_select: self.reference_select,
            disable_frame_end_update_cdf: self.disable_frame_end_update_cdf,
            base_q_idx: self.base_q_idx,
            segmentation,
            ..Default::default()
        }
    }

    pub fn picture(&self) -> PictureHandle {
        GpuBuffer(self.picture.unwrap_or(0x1000 + u64::from(self.frame_idx)))
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScriptConfig {
    pub out_of_order_completion: bool,
    pub strict_ref_counting: Option<bool>,
    pub max_idle_bundles: Option<usize>,
}

impl ScriptConfig {
    pub fn pool_config(&self) -> PoolConfig {
        let default = PoolConfig::default();
        PoolConfig {
            out_of_order_completion: self.out_of_order_completion,
            strict_ref_counting: self
                .strict_ref_counting
                .unwrap_or(default.strict_ref_counting),
            max_idle_bundles: self.max_idle_bundles.unwrap_or(default.max_idle_bundles),
            ..default
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Script {
    pub config: ScriptConfig,
    pub frames: Vec<ScriptFrame>,
}

impl Script {
    pub fn from_json(input: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(input)
    }
}
