// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! An Annex B h.264 parser.
//!
//! Parses SPSs in full up to the VUI timing information, PPSs up to
//! `redundant_pic_cnt_present_flag` and slice headers up to their picture
//! order count fields.

use std::collections::BTreeMap;
use std::io::Cursor;

use bytes::Buf;
use enumn::N;
use log::debug;

use crate::bitstream_utils::BitReader;
use crate::codec::NalHeader;
use crate::codec::ParseError;
use crate::stream_info::sample_aspect_ratio;
use crate::stream_info::PixelFormat;
use crate::stream_info::Ratio;
use crate::stream_info::Resolution;
use crate::stream_info::StreamInfo;
use crate::trace::SyntaxTrace;
use crate::utils::nalu;
use crate::utils::nalu::Header;

pub type Nalu<'a> = nalu::Nalu<'a, NaluHeader>;

pub(super) const DEFAULT_4X4_INTRA: [u8; 16] = [
    6, 13, 13, 20, 20, 20, 28, 28, 28, 28, 32, 32, 32, 37, 37, 42,
];

pub(super) const DEFAULT_4X4_INTER: [u8; 16] = [
    10, 14, 14, 20, 20, 20, 24, 24, 24, 24, 27, 27, 27, 30, 30, 34,
];

pub(super) const DEFAULT_8X8_INTRA: [u8; 64] = [
    6, 10, 10, 13, 11, 13, 16, 16, 16, 16, 18, 18, 18, 18, 18, 23, 23, 23, 23, 23, 23, 25, 25, 25,
    25, 25, 25, 25, 27, 27, 27, 27, 27, 27, 27, 27, 29, 29, 29, 29, 29, 29, 29, 31, 31, 31, 31, 31,
    31, 33, 33, 33, 33, 33, 36, 36, 36, 36, 38, 38, 38, 40, 40, 42,
];

pub(super) const DEFAULT_8X8_INTER: [u8; 64] = [
    9, 13, 13, 15, 13, 15, 17, 17, 17, 17, 19, 19, 19, 19, 19, 21, 21, 21, 21, 21, 21, 22, 22, 22,
    22, 22, 22, 22, 24, 24, 24, 24, 24, 24, 24, 24, 25, 25, 25, 25, 25, 25, 25, 27, 27, 27, 27, 27,
    27, 28, 28, 28, 28, 28, 30, 30, 30, 30, 32, 32, 32, 33, 33, 35,
];

const MAX_PPS_COUNT: u32 = 256;
const MAX_SPS_COUNT: u32 = 32;

/// The maximum number of pictures in the DPB, as per A.3.1, clause h)
const DPB_MAX_SIZE: u32 = 16;

/// Table 7-1 – NAL unit type codes, syntax element categories, and NAL unit
/// type classes.
#[derive(N, Debug, Default, PartialEq, Eq, Clone, Copy)]
pub enum NaluType {
    #[default]
    Unknown = 0,
    Slice = 1,
    SliceDpa = 2,
    SliceDpb = 3,
    SliceDpc = 4,
    SliceIdr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    AuDelimiter = 9,
    SeqEnd = 10,
    StreamEnd = 11,
    FillerData = 12,
    SpsExt = 13,
    PrefixUnit = 14,
    SubsetSps = 15,
    DepthSps = 16,
    Reserved17 = 17,
    Reserved18 = 18,
    SliceAux = 19,
    SliceExt = 20,
    SliceDepth = 21,
    Reserved22 = 22,
    Reserved23 = 23,
    Unspecified24 = 24,
    Unspecified25 = 25,
    Unspecified26 = 26,
    Unspecified27 = 27,
    Unspecified28 = 28,
    Unspecified29 = 29,
    Unspecified30 = 30,
    Unspecified31 = 31,
}

impl NaluType {
    /// Whether NAL units of this type start with a slice header.
    pub fn has_slice_header(&self) -> bool {
        matches!(self, Self::Slice | Self::SliceDpa | Self::SliceIdr)
    }

    /// Whether this type ends the access unit before it, as per 7.4.1.2.3.
    pub fn starts_access_unit(&self) -> bool {
        matches!(
            self,
            Self::Sei
                | Self::Sps
                | Self::Pps
                | Self::AuDelimiter
                | Self::PrefixUnit
                | Self::SubsetSps
                | Self::DepthSps
                | Self::Reserved17
                | Self::Reserved18
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NaluHeader {
    pub ref_idc: u8,
    pub type_: NaluType,
    pub idr_pic_flag: bool,
}

impl Header for NaluHeader {
    fn parse<T: AsRef<[u8]>>(cursor: &Cursor<T>) -> Result<Self, ParseError> {
        if !cursor.has_remaining() {
            return Err(ParseError::MalformedNalHeader(String::from(
                "no data left for the 1 byte header",
            )));
        }

        let byte = cursor.chunk()[0];

        if byte & 0x80 != 0 {
            return Err(ParseError::MalformedNalHeader(String::from(
                "forbidden_zero_bit is set",
            )));
        }

        let type_ = NaluType::n(byte & 0x1f).ok_or_else(|| {
            ParseError::MalformedNalHeader(format!("invalid nal_unit_type {}", byte & 0x1f))
        })?;

        let ref_idc = (byte & 0x60) >> 5;
        let idr_pic_flag = matches!(type_, NaluType::SliceIdr);

        Ok(NaluHeader {
            ref_idc,
            type_,
            idr_pic_flag,
        })
    }

    fn is_end(&self) -> bool {
        matches!(self.type_, NaluType::SeqEnd | NaluType::StreamEnd)
    }

    fn len(&self) -> usize {
        1
    }

    fn unit_type_id(&self) -> u8 {
        self.type_ as u8
    }

    fn is_parameter_set(&self) -> bool {
        matches!(self.type_, NaluType::Sps | NaluType::Pps)
    }

    fn is_slice(&self) -> bool {
        matches!(
            self.type_,
            NaluType::Slice
                | NaluType::SliceDpa
                | NaluType::SliceDpb
                | NaluType::SliceDpc
                | NaluType::SliceIdr
        )
    }

    fn is_random_access(&self) -> bool {
        self.idr_pic_flag
    }
}

impl From<NaluHeader> for NalHeader {
    fn from(header: NaluHeader) -> Self {
        NalHeader::Avc(header)
    }
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SliceType {
    #[default]
    P = 0,
    B = 1,
    I = 2,
    Sp = 3,
    Si = 4,
}

impl SliceType {
    /// Whether this is a P slice. See table 7-6.
    pub fn is_p(&self) -> bool {
        matches!(self, SliceType::P)
    }

    /// Whether this is a B slice. See table 7-6.
    pub fn is_b(&self) -> bool {
        matches!(self, SliceType::B)
    }

    /// Whether this is an I slice. See table 7-6.
    pub fn is_i(&self) -> bool {
        matches!(self, SliceType::I)
    }
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    #[default]
    L1 = 10,
    L1B = 9,
    L1_1 = 11,
    L1_2 = 12,
    L1_3 = 13,
    L2_0 = 20,
    L2_1 = 21,
    L2_2 = 22,
    L3 = 30,
    L3_1 = 31,
    L3_2 = 32,
    L4 = 40,
    L4_1 = 41,
    L4_2 = 42,
    L5 = 50,
    L5_1 = 51,
    L5_2 = 52,
    L6 = 60,
    L6_1 = 61,
    L6_2 = 62,
}

/// A H264 Sequence Parameter Set. A syntax structure containing syntax elements
/// that apply to zero or more entire coded video sequences as determined by the
/// content of a seq_parameter_set_id syntax element found in the picture
/// parameter set referred to by the pic_parameter_set_id syntax element found
/// in each slice header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sps {
    /// Identifies the sequence parameter set that is referred to by the picture
    /// parameter set
    pub seq_parameter_set_id: u8,

    /// Profile to which the coded video sequence conforms
    pub profile_idc: u8,

    /// constraint_set0_flag to constraint_set5_flag, most significant first. See 7.4.2.1.1
    pub constraint_set_flags: u8,

    /// Level to which the coded video sequence conforms
    pub level_idc: Level,

    /// Specifies the chroma sampling relative to the luma sampling as specified
    /// in clause 6.2.
    pub chroma_format_idc: u8,

    /// Specifies whether the three colour components of the 4:4:4 chroma format
    /// are coded separately.
    pub separate_colour_plane_flag: bool,

    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub qpprime_y_zero_transform_bypass_flag: bool,

    /// Whether `seq_scaling_list_present_flag[i]` for i = 0..7 or i = 0..11 is
    /// present or whether the sequence level scaling list shall be specified by
    /// Flat_4x4_16 for i = 0..5 and flat_8x8_16 for i = 6..11
    pub seq_scaling_matrix_present_flag: bool,

    /// 4x4 Scaling list as read with 7.3.2.1.1.1
    pub scaling_lists_4x4: [[u8; 16]; 6],
    /// 8x8 Scaling list as read with 7.3.2.1.1.1
    pub scaling_lists_8x8: [[u8; 64]; 6],

    /// Specifies the value of the variable MaxFrameNum that is used in
    /// frame_num related derivations as follows: MaxFrameNum = 2 ^
    /// (log2_max_frame_num_minus4 + 4 )
    pub log2_max_frame_num_minus4: u8,

    /// Specifies the method to decode picture order count (as specified in
    /// clause 8.2.1)
    pub pic_order_cnt_type: u8,

    /// Specifies the value of the variable MaxPicOrderCntLsb that is used in
    /// the decoding process for picture order count as specified in clause
    /// 8.2.1 as follows: MaxPicOrderCntLsb = 2 ^ (
    /// log2_max_pic_order_cnt_lsb_minus4 + 4 ).
    pub log2_max_pic_order_cnt_lsb_minus4: u8,

    /// If true, specifies that `delta_pic_order_cnt[0]` and
    /// `delta_pic_order_cnt[1]` are not present in the slice headers of the
    /// sequence and shall be inferred to be equal to 0.
    pub delta_pic_order_always_zero_flag: bool,

    /// Used to calculate the picture order count of a non-reference picture as
    /// specified in clause 8.2.1.
    pub offset_for_non_ref_pic: i32,

    /// Used to calculate the picture order count of a bottom field as specified
    /// in clause 8.2.1.
    pub offset_for_top_to_bottom_field: i32,

    /// The num_ref_frames_in_pic_order_cnt_cycle values of offset_for_ref_frame
    /// used in the decoding process for picture order count.
    pub offset_for_ref_frame: Vec<i32>,

    /// Specifies the maximum number of short-term and long-term reference
    /// frames, complementary reference field pairs, and non-paired reference
    /// fields that may be used by the decoding process for inter prediction of
    /// any picture in the coded video sequence.
    pub max_num_ref_frames: u8,

    pub gaps_in_frame_num_value_allowed_flag: bool,

    /// Plus 1 specifies the width of each decoded picture in units of
    /// macroblocks.
    pub pic_width_in_mbs_minus1: u16,
    /// Plus 1 specifies the height in slice group map units of a decoded frame
    /// or field.
    pub pic_height_in_map_units_minus1: u16,

    /// If true,  specifies that every coded picture of the coded video sequence
    /// is a coded frame containing only frame macroblocks, else specifies that
    /// coded pictures of the coded video sequence may either be coded fields or
    /// coded frames.
    pub frame_mbs_only_flag: bool,

    pub mb_adaptive_frame_field_flag: bool,
    pub direct_8x8_inference_flag: bool,

    pub frame_cropping_flag: bool,
    pub frame_crop_left_offset: u32,
    pub frame_crop_right_offset: u32,
    pub frame_crop_top_offset: u32,
    pub frame_crop_bottom_offset: u32,

    // Calculated
    /// Same as ExpectedDeltaPerPicOrderCntCycle, see 7-12.
    pub expected_delta_per_pic_order_cnt_cycle: i32,

    pub vui_parameters_present_flag: bool,
    pub vui_parameters: VuiParams,
}

impl Default for Sps {
    fn default() -> Self {
        Self {
            seq_parameter_set_id: Default::default(),
            profile_idc: Default::default(),
            constraint_set_flags: Default::default(),
            level_idc: Default::default(),
            chroma_format_idc: Default::default(),
            separate_colour_plane_flag: Default::default(),
            bit_depth_luma_minus8: Default::default(),
            bit_depth_chroma_minus8: Default::default(),
            qpprime_y_zero_transform_bypass_flag: Default::default(),
            seq_scaling_matrix_present_flag: Default::default(),
            scaling_lists_4x4: [[0; 16]; 6],
            scaling_lists_8x8: [[0; 64]; 6],
            log2_max_frame_num_minus4: Default::default(),
            pic_order_cnt_type: Default::default(),
            log2_max_pic_order_cnt_lsb_minus4: Default::default(),
            delta_pic_order_always_zero_flag: Default::default(),
            offset_for_non_ref_pic: Default::default(),
            offset_for_top_to_bottom_field: Default::default(),
            offset_for_ref_frame: Default::default(),
            max_num_ref_frames: Default::default(),
            gaps_in_frame_num_value_allowed_flag: Default::default(),
            pic_width_in_mbs_minus1: Default::default(),
            pic_height_in_map_units_minus1: Default::default(),
            frame_mbs_only_flag: Default::default(),
            mb_adaptive_frame_field_flag: Default::default(),
            direct_8x8_inference_flag: Default::default(),
            frame_cropping_flag: Default::default(),
            frame_crop_left_offset: Default::default(),
            frame_crop_right_offset: Default::default(),
            frame_crop_top_offset: Default::default(),
            frame_crop_bottom_offset: Default::default(),
            expected_delta_per_pic_order_cnt_cycle: Default::default(),
            vui_parameters_present_flag: Default::default(),
            vui_parameters: Default::default(),
        }
    }
}

impl Sps {
    /// Returns the coded width of the stream.
    ///
    /// See 7-13 through 7-17.
    pub const fn width(&self) -> u32 {
        (self.pic_width_in_mbs_minus1 as u32 + 1) * 16
    }

    /// Returns the coded height of the stream.
    ///
    /// See 7-13 through 7-17.
    pub const fn height(&self) -> u32 {
        (self.pic_height_in_map_units_minus1 as u32 + 1)
            * 16
            * (2 - self.frame_mbs_only_flag as u32)
    }

    /// Returns `ChromaArrayType`, see 7.4.2.1.1.
    pub const fn chroma_array_type(&self) -> u8 {
        match self.separate_colour_plane_flag {
            false => self.chroma_format_idc,
            true => 0,
        }
    }

    /// Returns `SubWidthC` and `SubHeightC`.
    ///
    /// See table 6-1.
    fn sub_width_height_c(&self) -> (u32, u32) {
        match (self.chroma_format_idc, self.separate_colour_plane_flag) {
            (1, false) => (2, 2),
            (2, false) => (2, 1),
            (3, false) => (1, 1),
            // undefined.
            _ => (1, 1),
        }
    }

    /// Returns `CropUnitX` and `CropUnitY`.
    ///
    /// See 7-19 through 7-22.
    fn crop_unit_x_y(&self) -> (u32, u32) {
        match self.chroma_array_type() {
            0 => (1, 2 - u32::from(self.frame_mbs_only_flag)),
            _ => {
                let (sub_width_c, sub_height_c) = self.sub_width_height_c();
                (
                    sub_width_c,
                    sub_height_c * (2 - u32::from(self.frame_mbs_only_flag)),
                )
            }
        }
    }

    /// Same as MaxFrameNum. See 7-10.
    pub fn max_frame_num(&self) -> u32 {
        1 << (self.log2_max_frame_num_minus4 + 4)
    }

    /// Same as MaxPicOrderCntLsb. See 7-11.
    pub fn max_pic_order_cnt_lsb(&self) -> u32 {
        1 << (self.log2_max_pic_order_cnt_lsb_minus4 + 4)
    }

    /// Frames per second from the VUI timing information.
    ///
    /// A progressive frame lasts two clock ticks. Streams that may carry
    /// fields report one picture per clock tick.
    pub fn frame_rate(&self) -> Option<Ratio> {
        let vui = &self.vui_parameters;
        if !self.vui_parameters_present_flag
            || !vui.timing_info_present_flag
            || vui.num_units_in_tick == 0
            || vui.time_scale == 0
        {
            return None;
        }

        let ticks_per_frame = if self.frame_mbs_only_flag { 2 } else { 1 };
        Some(Ratio::new(
            u64::from(vui.time_scale),
            ticks_per_frame * u64::from(vui.num_units_in_tick),
        ))
    }

    pub fn stream_info(&self) -> StreamInfo {
        let (width, height) = self.visible_size();
        let vui = &self.vui_parameters;
        let sample_aspect_ratio = if self.vui_parameters_present_flag
            && vui.aspect_ratio_info_present_flag
        {
            sample_aspect_ratio(vui.aspect_ratio_idc, vui.sar_width, vui.sar_height)
        } else {
            None
        };

        StreamInfo {
            coded_size: Resolution {
                width: self.width(),
                height: self.height(),
            },
            display_size: Resolution { width, height },
            pixel_format: PixelFormat::new(
                self.chroma_format_idc,
                self.bit_depth_luma_minus8 + 8,
                self.bit_depth_chroma_minus8 + 8,
            ),
            profile_idc: self.profile_idc,
            level_idc: self.level_idc as u8,
            frame_rate: self.frame_rate(),
            sample_aspect_ratio,
        }
    }

    /// Returns the visible width and height, once the cropping window is
    /// applied.
    pub fn visible_size(&self) -> (u32, u32) {
        if !self.frame_cropping_flag {
            return (self.width(), self.height());
        }

        let (crop_unit_x, crop_unit_y) = self.crop_unit_x_y();
        (
            self.width()
                - crop_unit_x * (self.frame_crop_left_offset + self.frame_crop_right_offset),
            self.height()
                - crop_unit_y * (self.frame_crop_top_offset + self.frame_crop_bottom_offset),
        )
    }

    fn parse(r: &mut BitReader) -> Result<Self, ParseError> {
        let mut sps = Sps {
            profile_idc: r.u("profile_idc", 8)?,
            constraint_set_flags: r.u("constraint_set_flags", 6)?,
            ..Default::default()
        };

        r.u::<u32>("reserved_zero_2bits", 2)?;

        let level: u8 = r.u("level_idc", 8)?;
        sps.level_idc = Level::n(level)
            .ok_or_else(|| ParseError::InvalidValue(format!("unsupported level {}", level)))?;
        sps.seq_parameter_set_id = r.ue_max("seq_parameter_set_id", MAX_SPS_COUNT - 1)?;

        if matches!(
            sps.profile_idc,
            100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
        ) {
            sps.chroma_format_idc = r.ue_max("chroma_format_idc", 3)?;
            if sps.chroma_format_idc == 3 {
                sps.separate_colour_plane_flag = r.flag("separate_colour_plane_flag")?;
            }

            sps.bit_depth_luma_minus8 = r.ue_max("bit_depth_luma_minus8", 6)?;
            sps.bit_depth_chroma_minus8 = r.ue_max("bit_depth_chroma_minus8", 6)?;
            sps.qpprime_y_zero_transform_bypass_flag =
                r.flag("qpprime_y_zero_transform_bypass_flag")?;
            sps.seq_scaling_matrix_present_flag = r.flag("seq_scaling_matrix_present_flag")?;

            if sps.seq_scaling_matrix_present_flag {
                parse_scaling_lists(
                    r,
                    "seq_scaling_list_present_flag",
                    sps.chroma_format_idc,
                    &mut sps.scaling_lists_4x4,
                    &mut sps.scaling_lists_8x8,
                )?;
            } else {
                fill_scaling_list_flat(&mut sps.scaling_lists_4x4, &mut sps.scaling_lists_8x8);
            }
        } else {
            sps.chroma_format_idc = 1;
            fill_scaling_list_flat(&mut sps.scaling_lists_4x4, &mut sps.scaling_lists_8x8);
        }

        sps.log2_max_frame_num_minus4 = r.ue_max("log2_max_frame_num_minus4", 12)?;

        sps.pic_order_cnt_type = r.ue_max("pic_order_cnt_type", 2)?;

        if sps.pic_order_cnt_type == 0 {
            sps.log2_max_pic_order_cnt_lsb_minus4 =
                r.ue_max("log2_max_pic_order_cnt_lsb_minus4", 12)?;
        } else if sps.pic_order_cnt_type == 1 {
            sps.delta_pic_order_always_zero_flag = r.flag("delta_pic_order_always_zero_flag")?;
            sps.offset_for_non_ref_pic = r.se("offset_for_non_ref_pic")?;
            sps.offset_for_top_to_bottom_field = r.se("offset_for_top_to_bottom_field")?;
            let num_ref_frames_in_pic_order_cnt_cycle: usize =
                r.ue_max("num_ref_frames_in_pic_order_cnt_cycle", 254)?;

            for _ in 0..num_ref_frames_in_pic_order_cnt_cycle {
                sps.offset_for_ref_frame.push(r.se("offset_for_ref_frame")?);
            }

            // (7-12)
            sps.expected_delta_per_pic_order_cnt_cycle = sps
                .offset_for_ref_frame
                .iter()
                .fold(0i32, |acc, offset| acc.wrapping_add(*offset));
        }

        sps.max_num_ref_frames = r.ue_max("max_num_ref_frames", DPB_MAX_SIZE)?;
        sps.gaps_in_frame_num_value_allowed_flag =
            r.flag("gaps_in_frame_num_value_allowed_flag")?;
        sps.pic_width_in_mbs_minus1 = r.ue("pic_width_in_mbs_minus1")?;
        sps.pic_height_in_map_units_minus1 = r.ue("pic_height_in_map_units_minus1")?;
        sps.frame_mbs_only_flag = r.flag("frame_mbs_only_flag")?;

        if !sps.frame_mbs_only_flag {
            sps.mb_adaptive_frame_field_flag = r.flag("mb_adaptive_frame_field_flag")?;
        }

        sps.direct_8x8_inference_flag = r.flag("direct_8x8_inference_flag")?;
        sps.frame_cropping_flag = r.flag("frame_cropping_flag")?;

        if sps.frame_cropping_flag {
            sps.frame_crop_left_offset = r.ue("frame_crop_left_offset")?;
            sps.frame_crop_right_offset = r.ue("frame_crop_right_offset")?;
            sps.frame_crop_top_offset = r.ue("frame_crop_top_offset")?;
            sps.frame_crop_bottom_offset = r.ue("frame_crop_bottom_offset")?;

            // Validate that cropping info is valid.
            let (crop_unit_x, crop_unit_y) = sps.crop_unit_x_y();

            let _ = sps
                .frame_crop_left_offset
                .checked_add(sps.frame_crop_right_offset)
                .and_then(|r| r.checked_mul(crop_unit_x))
                .and_then(|r| sps.width().checked_sub(r))
                .ok_or_else(|| ParseError::InvalidValue(String::from("invalid frame crop width")))?;

            let _ = sps
                .frame_crop_top_offset
                .checked_add(sps.frame_crop_bottom_offset)
                .and_then(|r| r.checked_mul(crop_unit_y))
                .and_then(|r| sps.height().checked_sub(r))
                .ok_or_else(|| {
                    ParseError::InvalidValue(String::from("invalid frame crop height"))
                })?;
        }

        sps.vui_parameters_present_flag = r.flag("vui_parameters_present_flag")?;
        if sps.vui_parameters_present_flag {
            sps.vui_parameters = VuiParams::parse(r)?;
        }

        Ok(sps)
    }
}

/// The VUI syntax up to the timing information, see E.1.1. The HRD parameters
/// and the bitstream restrictions that follow are not read.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VuiParams {
    pub aspect_ratio_info_present_flag: bool,
    /// Sample aspect ratio of the luma samples as per Table E-1. 255 means
    /// Extended_SAR, i.e. `sar_width : sar_height`.
    pub aspect_ratio_idc: u8,
    pub sar_width: u16,
    pub sar_height: u16,

    pub overscan_info_present_flag: bool,
    pub overscan_appropriate_flag: bool,

    pub video_signal_type_present_flag: bool,
    pub video_format: u8,
    pub video_full_range_flag: bool,
    pub colour_description_present_flag: bool,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coefficients: u8,

    pub chroma_loc_info_present_flag: bool,
    pub chroma_sample_loc_type_top_field: u8,
    pub chroma_sample_loc_type_bottom_field: u8,

    pub timing_info_present_flag: bool,
    /// Time units of a `time_scale` Hz clock in one clock tick.
    pub num_units_in_tick: u32,
    /// Time units in one second.
    pub time_scale: u32,
    pub fixed_frame_rate_flag: bool,
}

impl VuiParams {
    fn parse(r: &mut BitReader) -> Result<Self, ParseError> {
        let mut vui = VuiParams::default();

        vui.aspect_ratio_info_present_flag = r.flag("aspect_ratio_info_present_flag")?;
        if vui.aspect_ratio_info_present_flag {
            vui.aspect_ratio_idc = r.u("aspect_ratio_idc", 8)?;
            if vui.aspect_ratio_idc == 255 {
                vui.sar_width = r.u("sar_width", 16)?;
                vui.sar_height = r.u("sar_height", 16)?;
            }
        }

        vui.overscan_info_present_flag = r.flag("overscan_info_present_flag")?;
        if vui.overscan_info_present_flag {
            vui.overscan_appropriate_flag = r.flag("overscan_appropriate_flag")?;
        }

        vui.video_signal_type_present_flag = r.flag("video_signal_type_present_flag")?;
        if vui.video_signal_type_present_flag {
            vui.video_format = r.u("video_format", 3)?;
            vui.video_full_range_flag = r.flag("video_full_range_flag")?;
            vui.colour_description_present_flag = r.flag("colour_description_present_flag")?;
            if vui.colour_description_present_flag {
                vui.colour_primaries = r.u("colour_primaries", 8)?;
                vui.transfer_characteristics = r.u("transfer_characteristics", 8)?;
                vui.matrix_coefficients = r.u("matrix_coefficients", 8)?;
            }
        }

        vui.chroma_loc_info_present_flag = r.flag("chroma_loc_info_present_flag")?;
        if vui.chroma_loc_info_present_flag {
            vui.chroma_sample_loc_type_top_field =
                r.ue_max("chroma_sample_loc_type_top_field", 5)?;
            vui.chroma_sample_loc_type_bottom_field =
                r.ue_max("chroma_sample_loc_type_bottom_field", 5)?;
        }

        vui.timing_info_present_flag = r.flag("timing_info_present_flag")?;
        if vui.timing_info_present_flag {
            vui.num_units_in_tick = r.u("num_units_in_tick", 32)?;
            vui.time_scale = r.u("time_scale", 32)?;
            vui.fixed_frame_rate_flag = r.flag("fixed_frame_rate_flag")?;
        }

        Ok(vui)
    }
}

fn fill_default_scaling_list_4x4(scaling_list4x4: &mut [u8; 16], i: usize) {
    // See table 7-2.
    if i < 3 {
        *scaling_list4x4 = DEFAULT_4X4_INTRA;
    } else {
        *scaling_list4x4 = DEFAULT_4X4_INTER;
    }
}

fn fill_default_scaling_list_8x8(scaling_list8x8: &mut [u8; 64], i: usize) {
    if i % 2 == 0 {
        *scaling_list8x8 = DEFAULT_8X8_INTRA;
    } else {
        *scaling_list8x8 = DEFAULT_8X8_INTER;
    }
}

/// Fall-back rule A of table 7-2.
fn fill_fallback_scaling_list_4x4(scaling_list4x4: &mut [[u8; 16]; 6], i: usize) {
    scaling_list4x4[i] = match i {
        0 => DEFAULT_4X4_INTRA,
        3 => DEFAULT_4X4_INTER,
        _ => scaling_list4x4[i - 1],
    }
}

/// Fall-back rule A of table 7-2.
fn fill_fallback_scaling_list_8x8(scaling_list8x8: &mut [[u8; 64]; 6], i: usize) {
    scaling_list8x8[i] = match i {
        0 => DEFAULT_8X8_INTRA,
        1 => DEFAULT_8X8_INTER,
        _ => scaling_list8x8[i - 2],
    }
}

fn fill_scaling_list_flat(scaling_list4x4: &mut [[u8; 16]; 6], scaling_list8x8: &mut [[u8; 64]; 6]) {
    // (7-8)
    for outer in scaling_list4x4 {
        outer.fill(16);
    }

    // (7-9)
    for outer in scaling_list8x8 {
        outer.fill(16);
    }
}

/// 7.3.2.1.1.1. Returns `useDefaultScalingMatrixFlag`.
fn parse_scaling_list(r: &mut BitReader, scaling_list: &mut [u8]) -> Result<bool, ParseError> {
    let mut last_scale = 8u8;
    let mut next_scale = 8u8;

    for j in 0..scaling_list.len() {
        if next_scale != 0 {
            let delta_scale: i32 = r.se_bounded("delta_scale", -128, 127)?;
            next_scale = ((last_scale as i32 + delta_scale + 256) % 256) as u8;
            if j == 0 && next_scale == 0 {
                return Ok(true);
            }
        }

        scaling_list[j] = if next_scale == 0 {
            last_scale
        } else {
            next_scale
        };

        last_scale = scaling_list[j];
    }

    Ok(false)
}

fn parse_scaling_lists(
    r: &mut BitReader,
    present_flag_name: &'static str,
    chroma_format_idc: u8,
    scaling_lists_4x4: &mut [[u8; 16]; 6],
    scaling_lists_8x8: &mut [[u8; 64]; 6],
) -> Result<(), ParseError> {
    for i in 0..6 {
        if r.flag(present_flag_name)? {
            if parse_scaling_list(r, &mut scaling_lists_4x4[i])? {
                fill_default_scaling_list_4x4(&mut scaling_lists_4x4[i], i);
            }
        } else {
            fill_fallback_scaling_list_4x4(scaling_lists_4x4, i);
        }
    }

    let num_8x8 = if chroma_format_idc != 3 { 2 } else { 6 };
    for i in 0..num_8x8 {
        if r.flag(present_flag_name)? {
            if parse_scaling_list(r, &mut scaling_lists_8x8[i])? {
                fill_default_scaling_list_8x8(&mut scaling_lists_8x8[i], i);
            }
        } else {
            fill_fallback_scaling_list_8x8(scaling_lists_8x8, i);
        }
    }

    Ok(())
}

/// A H264 Picture Parameter Set, up to `redundant_pic_cnt_present_flag`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pps {
    /// Identifies the picture parameter set that is referred to in the slice header.
    pub pic_parameter_set_id: u8,

    /// Refers to the active sequence parameter set.
    pub seq_parameter_set_id: u8,

    /// Selects the entropy decoding method to be applied for the syntax
    /// elements for which two descriptors appear in the syntax tables.
    pub entropy_coding_mode_flag: bool,

    /// If true, specifies that the syntax elements delta_pic_order_cnt_bottom
    /// (when `pic_order_cnt_type` is equal to 0) or `delta_pic_order_cnt[1]`
    /// (when `pic_order_cnt_type` is equal to 1), which are related to picture
    /// order counts for the bottom field of a coded frame, are present in the
    /// slice headers for coded frames as specified in clause 7.3.3.
    pub bottom_field_pic_order_in_frame_present_flag: bool,

    /// Plus 1 specifies the number of slice groups for a picture.
    pub num_slice_groups_minus1: u8,
    pub slice_group_map_type: u8,

    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_idc: u8,
    pub pic_init_qp_minus26: i8,
    pub pic_init_qs_minus26: i8,
    pub chroma_qp_index_offset: i8,
    pub deblocking_filter_control_present_flag: bool,
    pub constrained_intra_pred_flag: bool,

    /// Specifies whether redundant_pic_cnt is present in the slice headers.
    pub redundant_pic_cnt_present_flag: bool,
}

impl Pps {
    fn parse(r: &mut BitReader, parser: &Parser) -> Result<Self, ParseError> {
        let mut pps = Pps {
            pic_parameter_set_id: r.ue_max("pic_parameter_set_id", MAX_PPS_COUNT - 1)?,
            seq_parameter_set_id: r.ue_max("seq_parameter_set_id", MAX_SPS_COUNT - 1)?,
            ..Default::default()
        };

        let sps = parser.get_sps(pps.seq_parameter_set_id).ok_or_else(|| {
            ParseError::MissingParameterSet(format!("SPS {}", pps.seq_parameter_set_id))
        })?;

        pps.entropy_coding_mode_flag = r.flag("entropy_coding_mode_flag")?;
        pps.bottom_field_pic_order_in_frame_present_flag =
            r.flag("bottom_field_pic_order_in_frame_present_flag")?;
        pps.num_slice_groups_minus1 = r.ue_max("num_slice_groups_minus1", 7)?;

        if pps.num_slice_groups_minus1 > 0 {
            pps.slice_group_map_type = r.ue_max("slice_group_map_type", 6)?;
            match pps.slice_group_map_type {
                0 => {
                    for _ in 0..=pps.num_slice_groups_minus1 {
                        r.ue::<u32>("run_length_minus1")?;
                    }
                }
                2 => {
                    for _ in 0..pps.num_slice_groups_minus1 {
                        r.ue::<u32>("top_left")?;
                        r.ue::<u32>("bottom_right")?;
                    }
                }
                3..=5 => {
                    r.flag("slice_group_change_direction_flag")?;
                    r.ue::<u32>("slice_group_change_rate_minus1")?;
                }
                6 => {
                    let pic_size_in_map_units_minus1: u32 = r.ue_max(
                        "pic_size_in_map_units_minus1",
                        (u32::from(sps.pic_width_in_mbs_minus1) + 1)
                            * (u32::from(sps.pic_height_in_map_units_minus1) + 1)
                            - 1,
                    )?;
                    // Ceil(Log2(num_slice_groups_minus1 + 1))
                    let bits = (u32::from(pps.num_slice_groups_minus1) + 1)
                        .next_power_of_two()
                        .trailing_zeros() as usize;
                    for _ in 0..=pic_size_in_map_units_minus1 {
                        r.u::<u32>("slice_group_id", bits)?;
                    }
                }
                _ => (),
            }
        }

        pps.num_ref_idx_l0_default_active_minus1 =
            r.ue_max("num_ref_idx_l0_default_active_minus1", 31)?;
        pps.num_ref_idx_l1_default_active_minus1 =
            r.ue_max("num_ref_idx_l1_default_active_minus1", 31)?;

        pps.weighted_pred_flag = r.flag("weighted_pred_flag")?;
        pps.weighted_bipred_idc = r.u("weighted_bipred_idc", 2)?;

        let qp_bd_offset_y = i32::from(6 * (sps.bit_depth_luma_minus8));
        pps.pic_init_qp_minus26 = r.se_bounded("pic_init_qp_minus26", -(26 + qp_bd_offset_y), 25)?;
        pps.pic_init_qs_minus26 = r.se_bounded("pic_init_qs_minus26", -26, 25)?;
        pps.chroma_qp_index_offset = r.se_bounded("chroma_qp_index_offset", -12, 12)?;

        pps.deblocking_filter_control_present_flag =
            r.flag("deblocking_filter_control_present_flag")?;
        pps.constrained_intra_pred_flag = r.flag("constrained_intra_pred_flag")?;
        pps.redundant_pic_cnt_present_flag = r.flag("redundant_pic_cnt_present_flag")?;

        Ok(pps)
    }
}

/// The part of a slice header that identifies its picture: everything up to
/// `redundant_pic_cnt`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeaderPrefix {
    /// Specifies the address of the first macroblock in the slice.
    pub first_mb_in_slice: u32,

    pub slice_type: SliceType,

    /// Whether all slices of the picture have the same `slice_type`, i.e. the
    /// coded value was 5 or above.
    pub slice_type_fixed: bool,

    pub pic_parameter_set_id: u8,
    pub colour_plane_id: u8,

    /// Used as an identifier for pictures and shall be represented by
    /// `log2_max_frame_num_minus4 + 4` bits in the bitstream.
    pub frame_num: u16,

    /// If set, specifies that the slice is a slice of a coded field. If not
    /// set, specifies that the slice is a slice of a coded frame.
    pub field_pic_flag: bool,

    /// If set, specifies that the slice is part of a coded bottom field. If
    /// not set, specifies that the picture is a coded top field.
    pub bottom_field_flag: bool,

    /// Identifies an IDR picture. The values of `idr_pic_id` in all the slices
    /// of an IDR picture shall remain unchanged.
    pub idr_pic_id: u16,

    /// Specifies the picture order count modulo MaxPicOrderCntLsb for the top
    /// field of a coded frame or for a coded field.
    pub pic_order_cnt_lsb: u16,

    /// Specifies the picture order count difference between the bottom field
    /// and the top field of a coded frame.
    pub delta_pic_order_cnt_bottom: i32,

    /// The first entry specifies the picture order count difference from the
    /// expected picture order count for the top field of a coded frame or for
    /// a coded field. The second entry specifies the picture order count
    /// difference from the expected picture order count for the bottom field
    /// of a coded frame.
    pub delta_pic_order_cnt: [i32; 2],

    /// Zero for slices of primary coded pictures.
    pub redundant_pic_cnt: u8,
}

impl SliceHeaderPrefix {
    fn parse(r: &mut BitReader, header: &NaluHeader, parser: &Parser) -> Result<Self, ParseError> {
        let mut hdr = SliceHeaderPrefix {
            first_mb_in_slice: r.ue("first_mb_in_slice")?,
            ..Default::default()
        };

        let slice_type: u8 = r.ue_max("slice_type", 9)?;
        hdr.slice_type_fixed = slice_type >= 5;
        hdr.slice_type = SliceType::n(slice_type % 5)
            .ok_or_else(|| ParseError::InvalidValue(format!("invalid slice type {}", slice_type)))?;

        hdr.pic_parameter_set_id = r.ue_max("pic_parameter_set_id", MAX_PPS_COUNT - 1)?;

        let (pps, sps) = parser.pps_and_sps(hdr.pic_parameter_set_id)?;

        if sps.separate_colour_plane_flag {
            hdr.colour_plane_id = r.u("colour_plane_id", 2)?;
        }

        hdr.frame_num = r.u("frame_num", usize::from(sps.log2_max_frame_num_minus4) + 4)?;

        if !sps.frame_mbs_only_flag {
            hdr.field_pic_flag = r.flag("field_pic_flag")?;
            if hdr.field_pic_flag {
                hdr.bottom_field_flag = r.flag("bottom_field_flag")?;
            }
        }

        if header.idr_pic_flag {
            hdr.idr_pic_id = r.ue_max("idr_pic_id", 0xffff)?;
        }

        if sps.pic_order_cnt_type == 0 {
            hdr.pic_order_cnt_lsb = r.u(
                "pic_order_cnt_lsb",
                usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4,
            )?;

            if pps.bottom_field_pic_order_in_frame_present_flag && !hdr.field_pic_flag {
                hdr.delta_pic_order_cnt_bottom = r.se("delta_pic_order_cnt_bottom")?;
            }
        }

        if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero_flag {
            hdr.delta_pic_order_cnt[0] = r.se("delta_pic_order_cnt[0]")?;
            if pps.bottom_field_pic_order_in_frame_present_flag && !hdr.field_pic_flag {
                hdr.delta_pic_order_cnt[1] = r.se("delta_pic_order_cnt[1]")?;
            }
        }

        if pps.redundant_pic_cnt_present_flag {
            hdr.redundant_pic_cnt = r.ue_max("redundant_pic_cnt", 127)?;
        }

        Ok(hdr)
    }
}

/// Keeps the last parsed instance of every parameter set.
#[derive(Debug, Default)]
pub struct Parser {
    active_spses: BTreeMap<u8, Sps>,
    active_ppses: BTreeMap<u8, Pps>,
    trace_enabled: bool,
    last_trace: Option<SyntaxTrace>,
}

impl Parser {
    pub fn set_trace(&mut self, enabled: bool) {
        self.trace_enabled = enabled;
    }

    pub fn take_trace(&mut self) -> Option<SyntaxTrace> {
        self.last_trace.take()
    }

    fn parse_rbsp<T>(
        &mut self,
        nalu: &Nalu,
        parse: impl FnOnce(&mut BitReader, &Parser) -> Result<T, ParseError>,
    ) -> Result<T, ParseError> {
        let rbsp = nalu.rbsp();
        let mut r = BitReader::new(&rbsp).with_trace(self.trace_enabled);
        let result = parse(&mut r, self);
        self.last_trace = r.take_trace();
        result
    }

    /// Parse a SPS NALU.
    pub fn parse_sps(&mut self, nalu: &Nalu) -> Result<&Sps, ParseError> {
        let sps = self.parse_rbsp(nalu, |r, _| Sps::parse(r))?;
        let key = sps.seq_parameter_set_id;

        debug!(
            "SPS {}: {}x{}, pic_order_cnt_type {}",
            key,
            sps.width(),
            sps.height(),
            sps.pic_order_cnt_type
        );

        self.active_spses.insert(key, sps);
        self.get_sps(key)
            .ok_or_else(|| ParseError::MissingParameterSet(format!("SPS {}", key)))
    }

    /// Parse a PPS NALU. The SPS it refers to must have been parsed already.
    pub fn parse_pps(&mut self, nalu: &Nalu) -> Result<&Pps, ParseError> {
        let pps = self.parse_rbsp(nalu, |r, parser| Pps::parse(r, parser))?;
        let key = pps.pic_parameter_set_id;

        self.active_ppses.insert(key, pps);
        self.get_pps(key)
            .ok_or_else(|| ParseError::MissingParameterSet(format!("PPS {}", key)))
    }

    /// Parses the slice header of `nalu` up to `redundant_pic_cnt`.
    pub fn parse_slice_header_prefix(
        &mut self,
        nalu: &Nalu,
    ) -> Result<SliceHeaderPrefix, ParseError> {
        let header = nalu.header();
        if !header.type_.has_slice_header() {
            return Err(ParseError::InvalidValue(format!(
                "{:?} is not a slice NALU",
                header.type_
            )));
        }

        self.parse_rbsp(nalu, |r, parser| SliceHeaderPrefix::parse(r, header, parser))
    }

    pub fn get_sps(&self, sps_id: u8) -> Option<&Sps> {
        self.active_spses.get(&sps_id)
    }

    pub fn get_pps(&self, pps_id: u8) -> Option<&Pps> {
        self.active_ppses.get(&pps_id)
    }

    /// Returns the PPS with id `pps_id` and the SPS it refers to.
    pub fn pps_and_sps(&self, pps_id: u8) -> Result<(&Pps, &Sps), ParseError> {
        let pps = self
            .get_pps(pps_id)
            .ok_or_else(|| ParseError::MissingParameterSet(format!("PPS {}", pps_id)))?;
        let sps = self.get_sps(pps.seq_parameter_set_id).ok_or_else(|| {
            ParseError::MissingParameterSet(format!("SPS {}", pps.seq_parameter_set_id))
        })?;

        Ok((pps, sps))
    }
}
