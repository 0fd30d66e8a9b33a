// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! An Annex B h.265 parser.
//!
//! Parses VPSs in full, and SPSs, PPSs and slice segment headers as far as the
//! picture order count of each picture needs.

use std::collections::BTreeMap;
use std::io::Cursor;

use bitreader::BitReader as HeaderReader;
use bytes::Buf;
use enumn::N;
use log::debug;

use crate::bitstream_utils::BitReader;
use crate::codec::NalHeader;
use crate::codec::ParseError;
use crate::stream_info::cropped_size;
use crate::stream_info::sub_width_height_c;
use crate::stream_info::PixelFormat;
use crate::stream_info::Ratio;
use crate::stream_info::Resolution;
use crate::stream_info::StreamInfo;
use crate::trace::SyntaxTrace;
use crate::utils::nalu;
use crate::utils::nalu::Header;

// Given the max SPS id.
const MAX_SPS_COUNT: u32 = 16;
// Given the max PPS id.
const MAX_PPS_COUNT: u32 = 64;
/// vps_max_sub_layers_minus1 and sps_max_sub_layers_minus1 are at most 6.
const MAX_SUB_LAYERS: usize = 7;
// 7.4.3.1
const MAX_NUM_LAYER_SETS: u32 = 1024;
// E.3.2
const MAX_CPB_CNT: u32 = 32;

/// Table 7-1 – NAL unit type codes and NAL unit type classes
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum NaluType {
    #[default]
    TrailN = 0,
    TrailR = 1,
    TsaN = 2,
    TsaR = 3,
    StsaN = 4,
    StsaR = 5,
    RadlN = 6,
    RadlR = 7,
    RaslN = 8,
    RaslR = 9,
    RsvVclN10 = 10,
    RsvVclR11 = 11,
    RsvVclN12 = 12,
    RsvVclR13 = 13,
    RsvVclN14 = 14,
    RsvVclR15 = 15,
    BlaWLp = 16,
    BlaWRadl = 17,
    BlaNLp = 18,
    IdrWRadl = 19,
    IdrNLp = 20,
    CraNut = 21,
    RsvIrapVcl22 = 22,
    RsvIrapVcl23 = 23,
    RsvVcl24 = 24,
    RsvVcl25 = 25,
    RsvVcl26 = 26,
    RsvVcl27 = 27,
    RsvVcl28 = 28,
    RsvVcl29 = 29,
    RsvVcl30 = 30,
    RsvVcl31 = 31,
    VpsNut = 32,
    SpsNut = 33,
    PpsNut = 34,
    AudNut = 35,
    EosNut = 36,
    EobNut = 37,
    FdNut = 38,
    PrefixSeiNut = 39,
    SuffixSeiNut = 40,
    RsvNvcl41 = 41,
    RsvNvcl42 = 42,
    RsvNvcl43 = 43,
    RsvNvcl44 = 44,
    RsvNvcl45 = 45,
    RsvNvcl46 = 46,
    RsvNvcl47 = 47,
    Unspec48 = 48,
    Unspec49 = 49,
    Unspec50 = 50,
    Unspec51 = 51,
    Unspec52 = 52,
    Unspec53 = 53,
    Unspec54 = 54,
    Unspec55 = 55,
    Unspec56 = 56,
    Unspec57 = 57,
    Unspec58 = 58,
    Unspec59 = 59,
    Unspec60 = 60,
    Unspec61 = 61,
    Unspec62 = 62,
    Unspec63 = 63,
}

impl NaluType {
    /// Whether this is an IDR NALU.
    pub fn is_idr(&self) -> bool {
        matches!(self, Self::IdrWRadl | Self::IdrNLp)
    }

    /// Whether this is an IRAP NALU.
    pub fn is_irap(&self) -> bool {
        let type_ = *self as u32;
        type_ >= Self::BlaWLp as u32 && type_ <= Self::RsvIrapVcl23 as u32
    }

    /// Whether this is a BLA NALU.
    pub fn is_bla(&self) -> bool {
        let type_ = *self as u32;
        type_ >= Self::BlaWLp as u32 && type_ <= Self::BlaNLp as u32
    }

    /// Whether this is a CRA NALU.
    pub fn is_cra(&self) -> bool {
        matches!(self, Self::CraNut)
    }

    /// Whether this is a RADL NALU.
    pub fn is_radl(&self) -> bool {
        matches!(self, Self::RadlN | Self::RadlR)
    }

    /// Whether this is a RASL NALU.
    pub fn is_rasl(&self) -> bool {
        matches!(self, Self::RaslN | Self::RaslR)
    }

    /// Whether this is a sub-layer non-reference NALU.
    pub fn is_slnr(&self) -> bool {
        matches!(
            self,
            Self::TrailN
                | Self::TsaN
                | Self::StsaN
                | Self::RadlN
                | Self::RaslN
                | Self::RsvVclN10
                | Self::RsvVclN12
                | Self::RsvVclN14
        )
    }

    /// Whether this NALU carries a slice segment.
    pub fn is_slice(&self) -> bool {
        let type_ = *self as u32;
        type_ <= Self::RaslR as u32 || (self.is_irap() && type_ <= Self::CraNut as u32)
    }
}

/// 7.3.1.2 NAL unit header syntax.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NaluHeader {
    /// The NALU type.
    type_: NaluType,
    /// Specifies the identifier of the layer to which a VCL NAL unit belongs or
    /// the identifier of a layer to which a non-VCL NAL unit applies.
    nuh_layer_id: u8,
    /// Minus 1 specifies a temporal identifier for the NAL unit. The value of
    /// nuh_temporal_id_plus1 shall not be equal to 0.
    nuh_temporal_id_plus1: u8,
}

impl NaluHeader {
    pub fn type_(&self) -> NaluType {
        self.type_
    }

    pub fn layer_id(&self) -> u8 {
        self.nuh_layer_id
    }

    pub fn temporal_id(&self) -> u8 {
        self.nuh_temporal_id_plus1 - 1
    }
}

impl Header for NaluHeader {
    fn parse<T: AsRef<[u8]>>(cursor: &Cursor<T>) -> Result<Self, ParseError> {
        let data = cursor.chunk();
        if data.len() < 2 {
            return Err(ParseError::MalformedNalHeader(format!(
                "{} bytes left for a 2 byte header",
                data.len()
            )));
        }

        let mut r = HeaderReader::new(&data[0..2]);

        if r.read_bool()? {
            return Err(ParseError::MalformedNalHeader(String::from(
                "forbidden_zero_bit is set",
            )));
        }

        let type_ = r.read_u8(6)?;
        let type_ = NaluType::n(type_).ok_or_else(|| {
            ParseError::MalformedNalHeader(format!("invalid nal_unit_type {}", type_))
        })?;

        let nuh_layer_id = r.read_u8(6)?;
        let nuh_temporal_id_plus1 = r.read_u8(3)?;
        if nuh_temporal_id_plus1 == 0 {
            return Err(ParseError::MalformedNalHeader(String::from(
                "nuh_temporal_id_plus1 is 0",
            )));
        }

        Ok(Self {
            type_,
            nuh_layer_id,
            nuh_temporal_id_plus1,
        })
    }

    fn is_end(&self) -> bool {
        matches!(self.type_, NaluType::EosNut | NaluType::EobNut)
    }

    fn len(&self) -> usize {
        // 7.3.1.2
        2
    }

    fn unit_type_id(&self) -> u8 {
        self.type_ as u8
    }

    fn layer_id(&self) -> u8 {
        self.nuh_layer_id
    }

    fn temporal_id(&self) -> u8 {
        self.nuh_temporal_id_plus1 - 1
    }

    fn is_parameter_set(&self) -> bool {
        matches!(
            self.type_,
            NaluType::VpsNut | NaluType::SpsNut | NaluType::PpsNut
        )
    }

    fn is_slice(&self) -> bool {
        self.type_.is_slice()
    }

    fn is_random_access(&self) -> bool {
        self.type_.is_irap()
    }
}

impl From<NaluHeader> for NalHeader {
    fn from(header: NaluHeader) -> Self {
        NalHeader::Hevc(header)
    }
}

pub type Nalu<'a> = nalu::Nalu<'a, NaluHeader>;

/// The profile part of profile_tier_level(), shared by the general profile
/// and the sub-layer profiles.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProfileInfo {
    pub profile_space: u8,
    pub tier_flag: bool,
    pub profile_idc: u8,
    pub profile_compatibility_flag: [bool; 32],
    pub progressive_source_flag: bool,
    pub interlaced_source_flag: bool,
    pub non_packed_constraint_flag: bool,
    pub frame_only_constraint_flag: bool,
    pub max_12bit_constraint_flag: bool,
    pub max_10bit_constraint_flag: bool,
    pub max_8bit_constraint_flag: bool,
    pub max_422chroma_constraint_flag: bool,
    pub max_420chroma_constraint_flag: bool,
    pub max_monochrome_constraint_flag: bool,
    pub intra_constraint_flag: bool,
    pub one_picture_only_constraint_flag: bool,
    pub lower_bit_rate_constraint_flag: bool,
    pub max_14bit_constraint_flag: bool,
    pub inbld_flag: bool,
}

impl ProfileInfo {
    /// Whether the profile is `idc` or claims compatibility with it.
    fn is_compatible_with(&self, idc: u8) -> bool {
        self.profile_idc == idc || self.profile_compatibility_flag[usize::from(idc)]
    }

    fn parse(r: &mut BitReader, general: bool) -> Result<Self, ParseError> {
        let name = |general_name: &'static str, sub_layer_name: &'static str| -> &'static str {
            if general {
                general_name
            } else {
                sub_layer_name
            }
        };

        let mut info = ProfileInfo {
            profile_space: r.u(name("general_profile_space", "sub_layer_profile_space"), 2)?,
            tier_flag: r.flag(name("general_tier_flag", "sub_layer_tier_flag"))?,
            profile_idc: r.u(name("general_profile_idc", "sub_layer_profile_idc"), 5)?,
            ..Default::default()
        };

        for flag in info.profile_compatibility_flag.iter_mut() {
            *flag = r.flag(name(
                "general_profile_compatibility_flag",
                "sub_layer_profile_compatibility_flag",
            ))?;
        }

        info.progressive_source_flag = r.flag(name(
            "general_progressive_source_flag",
            "sub_layer_progressive_source_flag",
        ))?;
        info.interlaced_source_flag = r.flag(name(
            "general_interlaced_source_flag",
            "sub_layer_interlaced_source_flag",
        ))?;
        info.non_packed_constraint_flag = r.flag(name(
            "general_non_packed_constraint_flag",
            "sub_layer_non_packed_constraint_flag",
        ))?;
        info.frame_only_constraint_flag = r.flag(name(
            "general_frame_only_constraint_flag",
            "sub_layer_frame_only_constraint_flag",
        ))?;

        // The next 43 bits depend on the profile.
        if (4..=11).any(|idc| info.is_compatible_with(idc)) {
            info.max_12bit_constraint_flag = r.flag("max_12bit_constraint_flag")?;
            info.max_10bit_constraint_flag = r.flag("max_10bit_constraint_flag")?;
            info.max_8bit_constraint_flag = r.flag("max_8bit_constraint_flag")?;
            info.max_422chroma_constraint_flag = r.flag("max_422chroma_constraint_flag")?;
            info.max_420chroma_constraint_flag = r.flag("max_420chroma_constraint_flag")?;
            info.max_monochrome_constraint_flag = r.flag("max_monochrome_constraint_flag")?;
            info.intra_constraint_flag = r.flag("intra_constraint_flag")?;
            info.one_picture_only_constraint_flag =
                r.flag("one_picture_only_constraint_flag")?;
            info.lower_bit_rate_constraint_flag = r.flag("lower_bit_rate_constraint_flag")?;

            if [5, 9, 10, 11].iter().any(|&idc| info.is_compatible_with(idc)) {
                info.max_14bit_constraint_flag = r.flag("max_14bit_constraint_flag")?;
                // reserved_zero_33bits
                r.skip_bits(33)?;
            } else {
                // reserved_zero_34bits
                r.skip_bits(34)?;
            }
        } else if info.is_compatible_with(2) {
            // reserved_zero_7bits
            r.skip_bits(7)?;
            info.one_picture_only_constraint_flag = r.flag("one_picture_only_constraint_flag")?;
            // reserved_zero_35bits
            r.skip_bits(35)?;
        } else {
            // reserved_zero_43bits
            r.skip_bits(43)?;
        }

        if [1, 2, 3, 4, 5, 9, 11]
            .iter()
            .any(|&idc| info.is_compatible_with(idc))
        {
            info.inbld_flag = r.flag(name("general_inbld_flag", "sub_layer_inbld_flag"))?;
        } else {
            // reserved_zero_bit
            r.skip_bits(1)?;
        }

        Ok(info)
    }
}

/// 7.3.3 Profile, tier and level syntax.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProfileTierLevel {
    /// Only present when profilePresentFlag is set.
    pub general_profile: Option<ProfileInfo>,
    /// 30 times the level number of Table A.8.
    pub general_level_idc: u8,
    pub sub_layer_profile_present_flag: [bool; MAX_SUB_LAYERS - 1],
    pub sub_layer_level_present_flag: [bool; MAX_SUB_LAYERS - 1],
    pub sub_layer_profile: [Option<ProfileInfo>; MAX_SUB_LAYERS - 1],
    pub sub_layer_level_idc: [u8; MAX_SUB_LAYERS - 1],
}

impl ProfileTierLevel {
    fn parse(
        r: &mut BitReader,
        profile_present_flag: bool,
        max_num_sub_layers_minus1: u8,
    ) -> Result<Self, ParseError> {
        let mut ptl = ProfileTierLevel::default();

        if profile_present_flag {
            ptl.general_profile = Some(ProfileInfo::parse(r, true)?);
        }

        ptl.general_level_idc = r.u("general_level_idc", 8)?;

        let num_sub_layers = usize::from(max_num_sub_layers_minus1);
        for i in 0..num_sub_layers {
            ptl.sub_layer_profile_present_flag[i] = r.flag("sub_layer_profile_present_flag")?;
            ptl.sub_layer_level_present_flag[i] = r.flag("sub_layer_level_present_flag")?;
        }

        if num_sub_layers > 0 {
            for _ in num_sub_layers..8 {
                r.u::<u8>("reserved_zero_2bits", 2)?;
            }
        }

        for i in 0..num_sub_layers {
            if ptl.sub_layer_profile_present_flag[i] {
                ptl.sub_layer_profile[i] = Some(ProfileInfo::parse(r, false)?);
            }

            // When not present, sub_layer_level_idc[i] is inferred from the
            // next higher sub-layer, i.e. the general level for the highest.
            if ptl.sub_layer_level_present_flag[i] {
                ptl.sub_layer_level_idc[i] = r.u("sub_layer_level_idc", 8)?;
            }
        }

        let mut level_idc = ptl.general_level_idc;
        for i in (0..num_sub_layers).rev() {
            if ptl.sub_layer_level_present_flag[i] {
                level_idc = ptl.sub_layer_level_idc[i];
            } else {
                ptl.sub_layer_level_idc[i] = level_idc;
            }
        }

        Ok(ptl)
    }
}

/// E.2.3 Sub-layer HRD parameters syntax, one entry per CPB.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SublayerHrdParameters {
    pub bit_rate_value_minus1: Vec<u32>,
    pub cpb_size_value_minus1: Vec<u32>,
    pub cpb_size_du_value_minus1: Vec<u32>,
    pub bit_rate_du_value_minus1: Vec<u32>,
    pub cbr_flag: Vec<bool>,
}

impl SublayerHrdParameters {
    fn parse(
        r: &mut BitReader,
        cpb_cnt: u32,
        sub_pic_hrd_params_present_flag: bool,
    ) -> Result<Self, ParseError> {
        let mut h = SublayerHrdParameters::default();

        for _ in 0..cpb_cnt {
            h.bit_rate_value_minus1
                .push(r.ue_max("bit_rate_value_minus1", u32::MAX - 1)?);
            h.cpb_size_value_minus1
                .push(r.ue_max("cpb_size_value_minus1", u32::MAX - 1)?);
            if sub_pic_hrd_params_present_flag {
                h.cpb_size_du_value_minus1
                    .push(r.ue_max("cpb_size_du_value_minus1", u32::MAX - 1)?);
                h.bit_rate_du_value_minus1
                    .push(r.ue_max("bit_rate_du_value_minus1", u32::MAX - 1)?);
            }

            h.cbr_flag.push(r.flag("cbr_flag")?);
        }

        Ok(h)
    }
}

/// E.2.2 HRD parameters syntax.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HrdParams {
    /// When set, specifies that NAL HRD parameters (pertaining to the Type II
    /// bitstream conformance point) are present in the hrd_parameters( ) syntax
    /// structure.
    pub nal_hrd_parameters_present_flag: bool,
    /// When set, specifies that VCL HRD parameters (pertaining to the Type I
    /// bitstream conformance point) are present in the hrd_parameters( ) syntax
    /// structure.
    pub vcl_hrd_parameters_present_flag: bool,
    /// When set, specifies that sub-picture level HRD parameters are present
    /// and the HRD may operate at access unit level or sub-picture level.
    pub sub_pic_hrd_params_present_flag: bool,
    pub tick_divisor_minus2: u8,
    pub du_cpb_removal_delay_increment_length_minus1: u8,
    pub sub_pic_cpb_params_in_pic_timing_sei_flag: bool,
    pub dpb_output_delay_du_length_minus1: u8,
    pub bit_rate_scale: u8,
    pub cpb_size_scale: u8,
    pub cpb_size_du_scale: u8,
    pub initial_cpb_removal_delay_length_minus1: u8,
    pub au_cpb_removal_delay_length_minus1: u8,
    pub dpb_output_delay_length_minus1: u8,
    pub fixed_pic_rate_general_flag: [bool; MAX_SUB_LAYERS],
    /// Inferred to be set when fixed_pic_rate_general_flag is.
    pub fixed_pic_rate_within_cvs_flag: [bool; MAX_SUB_LAYERS],
    pub elemental_duration_in_tc_minus1: [u32; MAX_SUB_LAYERS],
    pub low_delay_hrd_flag: [bool; MAX_SUB_LAYERS],
    pub cpb_cnt_minus1: [u32; MAX_SUB_LAYERS],
    pub nal_hrd: [SublayerHrdParameters; MAX_SUB_LAYERS],
    pub vcl_hrd: [SublayerHrdParameters; MAX_SUB_LAYERS],
}

impl HrdParams {
    fn parse(
        r: &mut BitReader,
        common_inf_present_flag: bool,
        max_num_sub_layers_minus1: u8,
    ) -> Result<Self, ParseError> {
        let mut hrd = HrdParams::default();

        if common_inf_present_flag {
            hrd.nal_hrd_parameters_present_flag = r.flag("nal_hrd_parameters_present_flag")?;
            hrd.vcl_hrd_parameters_present_flag = r.flag("vcl_hrd_parameters_present_flag")?;
            if hrd.nal_hrd_parameters_present_flag || hrd.vcl_hrd_parameters_present_flag {
                hrd.sub_pic_hrd_params_present_flag =
                    r.flag("sub_pic_hrd_params_present_flag")?;
                if hrd.sub_pic_hrd_params_present_flag {
                    hrd.tick_divisor_minus2 = r.u("tick_divisor_minus2", 8)?;
                    hrd.du_cpb_removal_delay_increment_length_minus1 =
                        r.u("du_cpb_removal_delay_increment_length_minus1", 5)?;
                    hrd.sub_pic_cpb_params_in_pic_timing_sei_flag =
                        r.flag("sub_pic_cpb_params_in_pic_timing_sei_flag")?;
                    hrd.dpb_output_delay_du_length_minus1 =
                        r.u("dpb_output_delay_du_length_minus1", 5)?;
                }
                hrd.bit_rate_scale = r.u("bit_rate_scale", 4)?;
                hrd.cpb_size_scale = r.u("cpb_size_scale", 4)?;
                if hrd.sub_pic_hrd_params_present_flag {
                    hrd.cpb_size_du_scale = r.u("cpb_size_du_scale", 4)?;
                }
                hrd.initial_cpb_removal_delay_length_minus1 =
                    r.u("initial_cpb_removal_delay_length_minus1", 5)?;
                hrd.au_cpb_removal_delay_length_minus1 =
                    r.u("au_cpb_removal_delay_length_minus1", 5)?;
                hrd.dpb_output_delay_length_minus1 = r.u("dpb_output_delay_length_minus1", 5)?;
            }
        }

        for i in 0..=usize::from(max_num_sub_layers_minus1) {
            hrd.fixed_pic_rate_general_flag[i] = r.flag("fixed_pic_rate_general_flag")?;
            hrd.fixed_pic_rate_within_cvs_flag[i] = if hrd.fixed_pic_rate_general_flag[i] {
                true
            } else {
                r.flag("fixed_pic_rate_within_cvs_flag")?
            };

            if hrd.fixed_pic_rate_within_cvs_flag[i] {
                hrd.elemental_duration_in_tc_minus1[i] =
                    r.ue_max("elemental_duration_in_tc_minus1", 2047)?;
            } else {
                hrd.low_delay_hrd_flag[i] = r.flag("low_delay_hrd_flag")?;
            }

            if !hrd.low_delay_hrd_flag[i] {
                hrd.cpb_cnt_minus1[i] = r.ue_max("cpb_cnt_minus1", MAX_CPB_CNT - 1)?;
            }

            let cpb_cnt = hrd.cpb_cnt_minus1[i] + 1;
            if hrd.nal_hrd_parameters_present_flag {
                hrd.nal_hrd[i] =
                    SublayerHrdParameters::parse(r, cpb_cnt, hrd.sub_pic_hrd_params_present_flag)?;
            }

            if hrd.vcl_hrd_parameters_present_flag {
                hrd.vcl_hrd[i] =
                    SublayerHrdParameters::parse(r, cpb_cnt, hrd.sub_pic_hrd_params_present_flag)?;
            }
        }

        Ok(hrd)
    }
}

/// Reads max_dec_pic_buffering_minus1, max_num_reorder_pics and
/// max_latency_increase_plus1 for the sub-layers that carry them, copying the
/// highest sub-layer's values to the others when only it is present.
fn parse_sub_layer_ordering_info(
    r: &mut BitReader,
    ordering_info_present_flag: bool,
    max_sub_layers_minus1: u8,
) -> Result<[[u32; MAX_SUB_LAYERS]; 3], ParseError> {
    let mut max_dec_pic_buffering_minus1 = [0u32; MAX_SUB_LAYERS];
    let mut max_num_reorder_pics = [0u32; MAX_SUB_LAYERS];
    let mut max_latency_increase_plus1 = [0u32; MAX_SUB_LAYERS];

    let highest = usize::from(max_sub_layers_minus1);
    let start = if ordering_info_present_flag { 0 } else { highest };

    for i in start..=highest {
        max_dec_pic_buffering_minus1[i] = r.ue_max("max_dec_pic_buffering_minus1", 15)?;
        max_num_reorder_pics[i] = r.ue_max("max_num_reorder_pics", max_dec_pic_buffering_minus1[i])?;
        max_latency_increase_plus1[i] = r.ue_max("max_latency_increase_plus1", u32::MAX - 1)?;

        if i > start {
            if max_dec_pic_buffering_minus1[i] < max_dec_pic_buffering_minus1[i - 1] {
                return Err(ParseError::InvalidValue(format!(
                    "max_dec_pic_buffering_minus1[{}] {} is below the lower sub-layer's",
                    i, max_dec_pic_buffering_minus1[i]
                )));
            }

            if max_num_reorder_pics[i] < max_num_reorder_pics[i - 1] {
                return Err(ParseError::InvalidValue(format!(
                    "max_num_reorder_pics[{}] {} is below the lower sub-layer's",
                    i, max_num_reorder_pics[i]
                )));
            }
        }
    }

    if !ordering_info_present_flag {
        for i in 0..highest {
            max_dec_pic_buffering_minus1[i] = max_dec_pic_buffering_minus1[highest];
            max_num_reorder_pics[i] = max_num_reorder_pics[highest];
            max_latency_increase_plus1[i] = max_latency_increase_plus1[highest];
        }
    }

    Ok([
        max_dec_pic_buffering_minus1,
        max_num_reorder_pics,
        max_latency_increase_plus1,
    ])
}

/// 7.3.2.1 Video parameter set RBSP syntax, without the VPS extension.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Vps {
    /// Identifies the VPS for reference by other syntax elements.
    pub video_parameter_set_id: u8,
    /// If vps_base_layer_internal_flag is equal to 1 and
    /// vps_base_layer_available_flag is equal to 1, the base layer is present
    /// in the bitstream.
    pub base_layer_internal_flag: bool,
    /// See `base_layer_internal_flag`.
    pub base_layer_available_flag: bool,
    pub max_layers_minus1: u8,
    pub max_sub_layers_minus1: u8,
    pub temporal_id_nesting_flag: bool,
    pub profile_tier_level: ProfileTierLevel,
    pub sub_layer_ordering_info_present_flag: bool,
    pub max_dec_pic_buffering_minus1: [u32; MAX_SUB_LAYERS],
    pub max_num_reorder_pics: [u32; MAX_SUB_LAYERS],
    pub max_latency_increase_plus1: [u32; MAX_SUB_LAYERS],
    /// Specifies the maximum allowed value of nuh_layer_id of all NAL units in
    /// each CVS referring to the VPS.
    pub max_layer_id: u8,
    pub num_layer_sets_minus1: u32,
    /// layer_id_included_flag[i][j] for the layer sets after the first one.
    pub layer_id_included_flag: Vec<Vec<bool>>,
    pub timing_info_present_flag: bool,
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub poc_proportional_to_timing_flag: bool,
    pub num_ticks_poc_diff_one_minus1: u32,
    pub num_hrd_parameters: u32,
    pub hrd_layer_set_idx: Vec<u32>,
    /// cprms_present_flag[0] is inferred to be set.
    pub cprms_present_flag: Vec<bool>,
    pub hrd_parameters: Vec<HrdParams>,
    pub extension_flag: bool,
}

impl Vps {
    fn parse(r: &mut BitReader) -> Result<Self, ParseError> {
        let mut vps = Vps {
            video_parameter_set_id: r.u("vps_video_parameter_set_id", 4)?,
            base_layer_internal_flag: r.flag("vps_base_layer_internal_flag")?,
            base_layer_available_flag: r.flag("vps_base_layer_available_flag")?,
            max_layers_minus1: r.u("vps_max_layers_minus1", 6)?,
            max_sub_layers_minus1: r.u("vps_max_sub_layers_minus1", 3)?,
            temporal_id_nesting_flag: r.flag("vps_temporal_id_nesting_flag")?,
            ..Default::default()
        };

        if usize::from(vps.max_sub_layers_minus1) >= MAX_SUB_LAYERS {
            return Err(ParseError::InvalidValue(format!(
                "vps_max_sub_layers_minus1 {}",
                vps.max_sub_layers_minus1
            )));
        }

        let reserved: u32 = r.u("vps_reserved_0xffff_16bits", 16)?;
        if reserved != 0xffff {
            debug!("vps_reserved_0xffff_16bits is {:#x}", reserved);
        }

        vps.profile_tier_level = ProfileTierLevel::parse(r, true, vps.max_sub_layers_minus1)?;

        vps.sub_layer_ordering_info_present_flag =
            r.flag("vps_sub_layer_ordering_info_present_flag")?;
        [
            vps.max_dec_pic_buffering_minus1,
            vps.max_num_reorder_pics,
            vps.max_latency_increase_plus1,
        ] = parse_sub_layer_ordering_info(
            r,
            vps.sub_layer_ordering_info_present_flag,
            vps.max_sub_layers_minus1,
        )?;

        vps.max_layer_id = r.u("vps_max_layer_id", 6)?;
        if vps.max_layer_id > 62 {
            return Err(ParseError::InvalidValue(format!(
                "vps_max_layer_id {}",
                vps.max_layer_id
            )));
        }

        vps.num_layer_sets_minus1 = r.ue_max("vps_num_layer_sets_minus1", MAX_NUM_LAYER_SETS - 1)?;

        for _ in 1..=vps.num_layer_sets_minus1 {
            let included = (0..=vps.max_layer_id)
                .map(|_| r.flag("layer_id_included_flag"))
                .collect::<Result<Vec<_>, _>>()?;
            vps.layer_id_included_flag.push(included);
        }

        vps.timing_info_present_flag = r.flag("vps_timing_info_present_flag")?;
        if vps.timing_info_present_flag {
            vps.num_units_in_tick = r.u("vps_num_units_in_tick", 32)?;
            vps.time_scale = r.u("vps_time_scale", 32)?;
            if vps.num_units_in_tick == 0 || vps.time_scale == 0 {
                return Err(ParseError::InvalidValue(String::from(
                    "vps_num_units_in_tick and vps_time_scale must be greater than 0",
                )));
            }

            vps.poc_proportional_to_timing_flag = r.flag("vps_poc_proportional_to_timing_flag")?;
            if vps.poc_proportional_to_timing_flag {
                vps.num_ticks_poc_diff_one_minus1 =
                    r.ue_max("vps_num_ticks_poc_diff_one_minus1", u32::MAX - 1)?;
            }

            vps.num_hrd_parameters =
                r.ue_max("vps_num_hrd_parameters", vps.num_layer_sets_minus1 + 1)?;

            let min_layer_set_idx = u32::from(!vps.base_layer_internal_flag);
            for i in 0..vps.num_hrd_parameters as usize {
                let idx: u32 = r.ue_max("hrd_layer_set_idx", vps.num_layer_sets_minus1)?;
                if idx < min_layer_set_idx {
                    return Err(ParseError::InvalidValue(format!("hrd_layer_set_idx {}", idx)));
                }
                vps.hrd_layer_set_idx.push(idx);

                let cprms_present_flag = if i > 0 {
                    r.flag("cprms_present_flag")?
                } else {
                    true
                };
                vps.cprms_present_flag.push(cprms_present_flag);

                vps.hrd_parameters.push(HrdParams::parse(
                    r,
                    cprms_present_flag,
                    vps.max_sub_layers_minus1,
                )?);
            }
        }

        vps.extension_flag = r.flag("vps_extension_flag")?;

        Ok(vps)
    }
}

/// 7.3.2.2 Sequence parameter set RBSP syntax, up to the coding block sizes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sps {
    pub video_parameter_set_id: u8,
    pub max_sub_layers_minus1: u8,
    pub temporal_id_nesting_flag: bool,
    pub profile_tier_level: ProfileTierLevel,
    pub seq_parameter_set_id: u8,
    pub chroma_format_idc: u8,
    pub separate_colour_plane_flag: bool,
    pub pic_width_in_luma_samples: u32,
    pub pic_height_in_luma_samples: u32,
    pub conformance_window_flag: bool,
    pub conf_win_left_offset: u32,
    pub conf_win_right_offset: u32,
    pub conf_win_top_offset: u32,
    pub conf_win_bottom_offset: u32,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub sub_layer_ordering_info_present_flag: bool,
    pub max_dec_pic_buffering_minus1: [u32; MAX_SUB_LAYERS],
    pub max_num_reorder_pics: [u32; MAX_SUB_LAYERS],
    pub max_latency_increase_plus1: [u32; MAX_SUB_LAYERS],
    pub log2_min_luma_coding_block_size_minus3: u32,
    pub log2_diff_max_min_luma_coding_block_size: u32,

    // Derived.
    pub ctb_log2_size_y: u32,
    pub pic_size_in_ctbs_y: u32,
}

impl Sps {
    /// MaxPicOrderCntLsb, (7-8).
    pub fn max_pic_order_cnt_lsb(&self) -> u32 {
        1 << (self.log2_max_pic_order_cnt_lsb_minus4 + 4)
    }

    pub fn coded_size(&self) -> Resolution {
        Resolution {
            width: self.pic_width_in_luma_samples,
            height: self.pic_height_in_luma_samples,
        }
    }

    /// The size of the conformance cropping window, see (7-1) and (7-2).
    pub fn visible_size(&self) -> Resolution {
        if !self.conformance_window_flag {
            return self.coded_size();
        }

        cropped_size(
            self.coded_size(),
            sub_width_height_c(self.chroma_format_idc, self.separate_colour_plane_flag),
            (
                self.conf_win_left_offset,
                self.conf_win_right_offset,
                self.conf_win_top_offset,
                self.conf_win_bottom_offset,
            ),
        )
    }

    /// The stream format signalled by this SPS. The frame rate comes from the
    /// timing information of `vps`, the VUI is not parsed.
    pub fn stream_info(&self, vps: Option<&Vps>) -> StreamInfo {
        let frame_rate = vps
            .filter(|vps| vps.timing_info_present_flag)
            .map(|vps| Ratio::new(u64::from(vps.time_scale), u64::from(vps.num_units_in_tick)));

        StreamInfo {
            coded_size: self.coded_size(),
            display_size: self.visible_size(),
            pixel_format: PixelFormat::new(
                self.chroma_format_idc,
                self.bit_depth_luma_minus8 + 8,
                self.bit_depth_chroma_minus8 + 8,
            ),
            profile_idc: self
                .profile_tier_level
                .general_profile
                .as_ref()
                .map_or(0, |profile| profile.profile_idc),
            level_idc: self.profile_tier_level.general_level_idc,
            frame_rate,
            sample_aspect_ratio: None,
        }
    }

    fn parse(r: &mut BitReader) -> Result<Self, ParseError> {
        let mut sps = Sps {
            video_parameter_set_id: r.u("sps_video_parameter_set_id", 4)?,
            max_sub_layers_minus1: r.u("sps_max_sub_layers_minus1", 3)?,
            temporal_id_nesting_flag: r.flag("sps_temporal_id_nesting_flag")?,
            ..Default::default()
        };

        if usize::from(sps.max_sub_layers_minus1) >= MAX_SUB_LAYERS {
            return Err(ParseError::InvalidValue(format!(
                "sps_max_sub_layers_minus1 {}",
                sps.max_sub_layers_minus1
            )));
        }

        sps.profile_tier_level = ProfileTierLevel::parse(r, true, sps.max_sub_layers_minus1)?;

        sps.seq_parameter_set_id = r.ue_max("sps_seq_parameter_set_id", MAX_SPS_COUNT - 1)?;
        sps.chroma_format_idc = r.ue_max("chroma_format_idc", 3)?;
        if sps.chroma_format_idc == 3 {
            sps.separate_colour_plane_flag = r.flag("separate_colour_plane_flag")?;
        }

        sps.pic_width_in_luma_samples = r.ue_max("pic_width_in_luma_samples", 16888)?;
        sps.pic_height_in_luma_samples = r.ue_max("pic_height_in_luma_samples", 16888)?;
        if sps.pic_width_in_luma_samples == 0 || sps.pic_height_in_luma_samples == 0 {
            return Err(ParseError::InvalidValue(String::from(
                "picture dimensions must not be 0",
            )));
        }

        sps.conformance_window_flag = r.flag("conformance_window_flag")?;
        if sps.conformance_window_flag {
            sps.conf_win_left_offset = r.ue("conf_win_left_offset")?;
            sps.conf_win_right_offset = r.ue("conf_win_right_offset")?;
            sps.conf_win_top_offset = r.ue("conf_win_top_offset")?;
            sps.conf_win_bottom_offset = r.ue("conf_win_bottom_offset")?;
        }

        sps.bit_depth_luma_minus8 = r.ue_max("bit_depth_luma_minus8", 8)?;
        sps.bit_depth_chroma_minus8 = r.ue_max("bit_depth_chroma_minus8", 8)?;
        sps.log2_max_pic_order_cnt_lsb_minus4 = r.ue_max("log2_max_pic_order_cnt_lsb_minus4", 12)?;

        sps.sub_layer_ordering_info_present_flag =
            r.flag("sps_sub_layer_ordering_info_present_flag")?;
        [
            sps.max_dec_pic_buffering_minus1,
            sps.max_num_reorder_pics,
            sps.max_latency_increase_plus1,
        ] = parse_sub_layer_ordering_info(
            r,
            sps.sub_layer_ordering_info_present_flag,
            sps.max_sub_layers_minus1,
        )?;

        sps.log2_min_luma_coding_block_size_minus3 =
            r.ue_max("log2_min_luma_coding_block_size_minus3", 3)?;
        sps.log2_diff_max_min_luma_coding_block_size =
            r.ue_max("log2_diff_max_min_luma_coding_block_size", 3)?;

        // (7-10), (7-11)
        let min_cb_log2_size_y = sps.log2_min_luma_coding_block_size_minus3 + 3;
        sps.ctb_log2_size_y = min_cb_log2_size_y + sps.log2_diff_max_min_luma_coding_block_size;
        if sps.ctb_log2_size_y > 6 {
            return Err(ParseError::InvalidValue(format!(
                "CtbLog2SizeY {}",
                sps.ctb_log2_size_y
            )));
        }

        // (7-13) to (7-19)
        let ctb_size_y = 1 << sps.ctb_log2_size_y;
        let pic_width_in_ctbs_y = sps.pic_width_in_luma_samples.div_ceil(ctb_size_y);
        let pic_height_in_ctbs_y = sps.pic_height_in_luma_samples.div_ceil(ctb_size_y);
        sps.pic_size_in_ctbs_y = pic_width_in_ctbs_y * pic_height_in_ctbs_y;

        // The remaining SPS syntax is not needed for the picture order count.
        Ok(sps)
    }
}

/// 7.3.2.3 Picture parameter set RBSP syntax, up to
/// num_extra_slice_header_bits.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pps {
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,
    pub dependent_slice_segments_enabled_flag: bool,
    pub output_flag_present_flag: bool,
    pub num_extra_slice_header_bits: u8,
}

impl Pps {
    fn parse(r: &mut BitReader) -> Result<Self, ParseError> {
        Ok(Pps {
            pic_parameter_set_id: r.ue_max("pps_pic_parameter_set_id", MAX_PPS_COUNT - 1)?,
            seq_parameter_set_id: r.ue_max("pps_seq_parameter_set_id", MAX_SPS_COUNT - 1)?,
            dependent_slice_segments_enabled_flag: r
                .flag("dependent_slice_segments_enabled_flag")?,
            output_flag_present_flag: r.flag("output_flag_present_flag")?,
            num_extra_slice_header_bits: r.u("num_extra_slice_header_bits", 3)?,
        })
    }
}

/// 7.3.6.1 General slice segment header syntax, up to
/// slice_pic_order_cnt_lsb.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SliceHeaderPrefix {
    pub first_slice_segment_in_pic_flag: bool,
    pub no_output_of_prior_pics_flag: bool,
    pub pic_parameter_set_id: u8,
    pub dependent_slice_segment_flag: bool,
    pub segment_address: u32,
    /// Not present in dependent slice segments.
    pub slice_type: Option<u8>,
    pub pic_output_flag: bool,
    pub colour_plane_id: u8,
    /// Zero for IDR pictures.
    pub pic_order_cnt_lsb: u32,
}

impl SliceHeaderPrefix {
    fn parse(r: &mut BitReader, type_: NaluType, parser: &Parser) -> Result<Self, ParseError> {
        let mut hdr = SliceHeaderPrefix {
            first_slice_segment_in_pic_flag: r.flag("first_slice_segment_in_pic_flag")?,
            no_output_of_prior_pics_flag: false,
            pic_parameter_set_id: 0,
            dependent_slice_segment_flag: false,
            segment_address: 0,
            slice_type: None,
            pic_output_flag: true,
            colour_plane_id: 0,
            pic_order_cnt_lsb: 0,
        };

        if type_.is_irap() {
            hdr.no_output_of_prior_pics_flag = r.flag("no_output_of_prior_pics_flag")?;
        }

        hdr.pic_parameter_set_id = r.ue_max("slice_pic_parameter_set_id", MAX_PPS_COUNT - 1)?;

        let (pps, sps) = parser.pps_and_sps(hdr.pic_parameter_set_id)?;

        if !hdr.first_slice_segment_in_pic_flag {
            if pps.dependent_slice_segments_enabled_flag {
                hdr.dependent_slice_segment_flag = r.flag("dependent_slice_segment_flag")?;
            }

            // Ceil(Log2(PicSizeInCtbsY))
            let num_bits = (u32::BITS - (sps.pic_size_in_ctbs_y - 1).leading_zeros()) as usize;
            hdr.segment_address = r.u("slice_segment_address", num_bits)?;
            if hdr.segment_address >= sps.pic_size_in_ctbs_y {
                return Err(ParseError::InvalidValue(format!(
                    "slice_segment_address {}",
                    hdr.segment_address
                )));
            }
        }

        if hdr.dependent_slice_segment_flag {
            return Ok(hdr);
        }

        // slice_reserved_flag
        r.skip_bits(usize::from(pps.num_extra_slice_header_bits))?;

        hdr.slice_type = Some(r.ue_max("slice_type", 2)?);

        if pps.output_flag_present_flag {
            hdr.pic_output_flag = r.flag("pic_output_flag")?;
        }

        if sps.separate_colour_plane_flag {
            hdr.colour_plane_id = r.u("colour_plane_id", 2)?;
        }

        if !type_.is_idr() {
            hdr.pic_order_cnt_lsb = r.u(
                "slice_pic_order_cnt_lsb",
                usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4,
            )?;
        }

        Ok(hdr)
    }
}

/// Keeps the last parsed instance of every parameter set.
#[derive(Debug, Default)]
pub struct Parser {
    active_vpses: BTreeMap<u8, Vps>,
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

    /// Parse a VPS NALU.
    pub fn parse_vps(&mut self, nalu: &Nalu) -> Result<&Vps, ParseError> {
        let vps = self.parse_rbsp(nalu, |r, _| Vps::parse(r))?;
        let key = vps.video_parameter_set_id;

        self.active_vpses.insert(key, vps);
        self.get_vps(key)
            .ok_or_else(|| ParseError::MissingParameterSet(format!("VPS {}", key)))
    }

    /// Parse a SPS NALU.
    pub fn parse_sps(&mut self, nalu: &Nalu) -> Result<&Sps, ParseError> {
        let sps = self.parse_rbsp(nalu, |r, _| Sps::parse(r))?;
        let key = sps.seq_parameter_set_id;

        if self.get_vps(sps.video_parameter_set_id).is_none() {
            debug!(
                "SPS {} refers to VPS {} which was not received",
                key, sps.video_parameter_set_id
            );
        }

        self.active_spses.insert(key, sps);
        self.get_sps(key)
            .ok_or_else(|| ParseError::MissingParameterSet(format!("SPS {}", key)))
    }

    /// Parse a PPS NALU.
    pub fn parse_pps(&mut self, nalu: &Nalu) -> Result<&Pps, ParseError> {
        let pps = self.parse_rbsp(nalu, |r, _| Pps::parse(r))?;
        let key = pps.pic_parameter_set_id;

        if self.get_sps(pps.seq_parameter_set_id).is_none() {
            debug!(
                "PPS {} refers to SPS {} which was not received",
                key, pps.seq_parameter_set_id
            );
        }

        self.active_ppses.insert(key, pps);
        self.get_pps(key)
            .ok_or_else(|| ParseError::MissingParameterSet(format!("PPS {}", key)))
    }

    /// Parses the slice segment header of `nalu` up to its picture order count.
    pub fn parse_slice_header_prefix(
        &mut self,
        nalu: &Nalu,
    ) -> Result<SliceHeaderPrefix, ParseError> {
        let type_ = nalu.header().type_();
        if !type_.is_slice() {
            return Err(ParseError::InvalidValue(format!(
                "{:?} is not a slice NALU",
                type_
            )));
        }

        self.parse_rbsp(nalu, |r, parser| SliceHeaderPrefix::parse(r, type_, parser))
    }

    pub fn get_vps(&self, vps_id: u8) -> Option<&Vps> {
        self.active_vpses.get(&vps_id)
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

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use crate::bitstream_utils::escape_rbsp;
    use crate::bitstream_utils::BitWriter;

    /// Prepends a start code and a NAL unit header to an RBSP.
    pub(crate) fn nal(type_: NaluType, layer_id: u8, tid: u8, rbsp: &[u8]) -> Vec<u8> {
        let mut out = vec![
            0,
            0,
            0,
            1,
            ((type_ as u8) << 1) | (layer_id >> 5),
            ((layer_id & 0x1f) << 3) | (tid + 1),
        ];
        out.extend(escape_rbsp(rbsp));
        out
    }

    /// Writes a Main profile profile_tier_level(1, sub_layer_levels.len()).
    pub(crate) fn write_ptl<W: std::io::Write>(
        w: &mut BitWriter<W>,
        general_level_idc: u8,
        sub_layer_levels: &[Option<u8>],
    ) {
        w.write_f(2, 0u32).unwrap(); // general_profile_space
        w.write_f(1, false).unwrap(); // general_tier_flag
        w.write_f(5, 1u32).unwrap(); // general_profile_idc
        w.write_f(32, 0x6000_0000u32).unwrap(); // compatible with Main and Main 10
        w.write_f(4, 0b1001u32).unwrap(); // progressive, frame only
        w.write_f(32, 0u32).unwrap(); // general_reserved_zero_43bits
        w.write_f(11, 0u32).unwrap();
        w.write_f(1, false).unwrap(); // general_inbld_flag
        w.write_f(8, general_level_idc).unwrap();

        for level in sub_layer_levels {
            w.write_f(1, false).unwrap(); // sub_layer_profile_present_flag
            w.write_f(1, level.is_some()).unwrap();
        }
        if !sub_layer_levels.is_empty() {
            for _ in sub_layer_levels.len()..8 {
                w.write_f(2, 0u32).unwrap();
            }
        }
        for level in sub_layer_levels.iter().flatten() {
            w.write_f(8, *level).unwrap();
        }
    }

    /// A single layer VPS with timing and HRD information.
    pub(crate) fn vps_rbsp(vps_id: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut w = BitWriter::new(&mut buf);
            w.write_f(4, vps_id).unwrap();
            w.write_f(1, true).unwrap(); // vps_base_layer_internal_flag
            w.write_f(1, true).unwrap(); // vps_base_layer_available_flag
            w.write_f(6, 0u32).unwrap(); // vps_max_layers_minus1
            w.write_f(3, 0u32).unwrap(); // vps_max_sub_layers_minus1
            w.write_f(1, true).unwrap(); // vps_temporal_id_nesting_flag
            w.write_f(16, 0xffffu32).unwrap();
            write_ptl(&mut w, 93, &[]);
            w.write_f(1, true).unwrap(); // vps_sub_layer_ordering_info_present_flag
            w.write_ue(4u32).unwrap();
            w.write_ue(2u32).unwrap();
            w.write_ue(0u32).unwrap();
            w.write_f(6, 0u32).unwrap(); // vps_max_layer_id
            w.write_ue(0u32).unwrap(); // vps_num_layer_sets_minus1
            w.write_f(1, true).unwrap(); // vps_timing_info_present_flag
            w.write_f(32, 1001u32).unwrap();
            w.write_f(32, 60000u32).unwrap();
            w.write_f(1, false).unwrap(); // vps_poc_proportional_to_timing_flag
            w.write_ue(1u32).unwrap(); // vps_num_hrd_parameters
            w.write_ue(0u32).unwrap(); // hrd_layer_set_idx[0]
            w.write_f(1, true).unwrap(); // nal_hrd_parameters_present_flag
            w.write_f(1, false).unwrap(); // vcl_hrd_parameters_present_flag
            w.write_f(1, false).unwrap(); // sub_pic_hrd_params_present_flag
            w.write_f(4, 2u32).unwrap(); // bit_rate_scale
            w.write_f(4, 3u32).unwrap(); // cpb_size_scale
            w.write_f(5, 23u32).unwrap();
            w.write_f(5, 23u32).unwrap();
            w.write_f(5, 23u32).unwrap();
            w.write_f(1, true).unwrap(); // fixed_pic_rate_general_flag[0]
            w.write_ue(0u32).unwrap(); // elemental_duration_in_tc_minus1[0]
            w.write_ue(0u32).unwrap(); // cpb_cnt_minus1[0]
            w.write_ue(9999u32).unwrap(); // bit_rate_value_minus1
            w.write_ue(2999u32).unwrap(); // cpb_size_value_minus1
            w.write_f(1, true).unwrap(); // cbr_flag
            w.write_f(1, false).unwrap(); // vps_extension_flag
            w.write_trailing_bits().unwrap();
        }

        buf
    }

    /// A 1920x1080 SPS with 64x64 CTBs and `log2_max_poc_lsb` bits of POC LSB.
    pub(crate) fn sps_rbsp(sps_id: u32, log2_max_poc_lsb: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut w = BitWriter::new(&mut buf);
            w.write_f(4, 0u32).unwrap(); // sps_video_parameter_set_id
            w.write_f(3, 0u32).unwrap(); // sps_max_sub_layers_minus1
            w.write_f(1, true).unwrap(); // sps_temporal_id_nesting_flag
            write_ptl(&mut w, 120, &[]);
            w.write_ue(sps_id).unwrap();
            w.write_ue(1u32).unwrap(); // chroma_format_idc
            w.write_ue(1920u32).unwrap();
            w.write_ue(1080u32).unwrap();
            w.write_f(1, false).unwrap(); // conformance_window_flag
            w.write_ue(0u32).unwrap(); // bit_depth_luma_minus8
            w.write_ue(0u32).unwrap(); // bit_depth_chroma_minus8
            w.write_ue(log2_max_poc_lsb - 4).unwrap();
            w.write_f(1, true).unwrap(); // sps_sub_layer_ordering_info_present_flag
            w.write_ue(4u32).unwrap();
            w.write_ue(2u32).unwrap();
            w.write_ue(0u32).unwrap();
            w.write_ue(0u32).unwrap(); // log2_min_luma_coding_block_size_minus3
            w.write_ue(3u32).unwrap(); // log2_diff_max_min_luma_coding_block_size
            // The remaining SPS syntax is not parsed.
            w.write_f(8, 0x5au32).unwrap();
            w.write_trailing_bits().unwrap();
        }

        buf
    }

    pub(crate) fn pps_rbsp(pps_id: u32, sps_id: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut w = BitWriter::new(&mut buf);
            w.write_ue(pps_id).unwrap();
            w.write_ue(sps_id).unwrap();
            w.write_f(1, false).unwrap(); // dependent_slice_segments_enabled_flag
            w.write_f(1, false).unwrap(); // output_flag_present_flag
            w.write_f(3, 0u32).unwrap(); // num_extra_slice_header_bits
            w.write_f(8, 0x5au32).unwrap();
            w.write_trailing_bits().unwrap();
        }

        buf
    }

    /// A slice segment of PPS 0, for an SPS made by [`sps_rbsp`] with 8 bits
    /// of POC LSB.
    pub(crate) fn slice_rbsp(type_: NaluType, first: bool, poc_lsb: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut w = BitWriter::new(&mut buf);
            w.write_f(1, first).unwrap(); // first_slice_segment_in_pic_flag
            if type_.is_irap() {
                w.write_f(1, false).unwrap(); // no_output_of_prior_pics_flag
            }
            w.write_ue(0u32).unwrap(); // slice_pic_parameter_set_id
            if !first {
                // 510 CTBs
                w.write_f(9, 255u32).unwrap(); // slice_segment_address
            }
            w.write_ue(if type_.is_irap() { 2u32 } else { 1u32 }).unwrap(); // slice_type
            if !type_.is_idr() {
                w.write_f(8, poc_lsb).unwrap();
            }
            w.write_f(16, 0xbeefu32).unwrap();
            w.write_trailing_bits().unwrap();
        }

        buf
    }

    fn parse_nal(data: &[u8]) -> Nalu {
        let mut cursor = Cursor::new(data);
        Nalu::next(&mut cursor).unwrap().unwrap()
    }

    #[test]
    fn nalu_header() {
        let data = nal(NaluType::CraNut, 0, 0, &[0x80]);
        assert_eq!(data[4..6], [0x2a, 0x01]);

        let nalu = parse_nal(&data);
        assert_eq!(nalu.header().type_(), NaluType::CraNut);
        assert_eq!(nalu.header().layer_id(), 0);
        assert_eq!(nalu.header().temporal_id(), 0);
        assert!(nalu.header().is_random_access());
        assert!(nalu.header().is_slice());

        let data = nal(NaluType::TsaN, 33, 2, &[0x80]);

        let nalu = parse_nal(&data);
        assert_eq!(nalu.header().type_(), NaluType::TsaN);
        assert_eq!(nalu.header().layer_id(), 33);
        assert_eq!(nalu.header().temporal_id(), 2);
        assert!(!nalu.header().is_random_access());

        let data = nal(NaluType::PpsNut, 0, 0, &[0x80]);

        let nalu = parse_nal(&data);
        assert!(nalu.header().is_parameter_set());
        assert!(!nalu.header().is_slice());
        assert!(!NaluType::RsvIrapVcl22.is_slice());
    }

    #[test]
    fn malformed_nalu_headers() {
        // forbidden_zero_bit
        let mut cursor = Cursor::new(&[0u8, 0, 1, 0x80, 0x01][..]);
        assert!(matches!(
            Nalu::next(&mut cursor),
            Err(ParseError::MalformedNalHeader(_))
        ));

        // nuh_temporal_id_plus1 equal to 0
        let mut cursor = Cursor::new(&[0u8, 0, 1, 0x02, 0x00][..]);
        assert!(matches!(
            Nalu::next(&mut cursor),
            Err(ParseError::MalformedNalHeader(_))
        ));

        // Single byte
        let mut cursor = Cursor::new(&[0u8, 0, 1, 0x02][..]);
        assert!(matches!(
            Nalu::next(&mut cursor),
            Err(ParseError::MalformedNalHeader(_))
        ));
    }

    #[test]
    fn parse_vps() {
        let mut parser = Parser::default();
        let vps = parser
            .parse_vps(&parse_nal(&nal(NaluType::VpsNut, 0, 0, &vps_rbsp(3))))
            .unwrap();

        assert_eq!(vps.video_parameter_set_id, 3);
        assert!(vps.base_layer_internal_flag);
        let profile = vps.profile_tier_level.general_profile.as_ref().unwrap();
        assert_eq!(profile.profile_idc, 1);
        assert!(profile.profile_compatibility_flag[1]);
        assert!(profile.profile_compatibility_flag[2]);
        assert!(profile.progressive_source_flag);
        assert!(profile.frame_only_constraint_flag);
        assert_eq!(vps.profile_tier_level.general_level_idc, 93);
        assert_eq!(vps.max_dec_pic_buffering_minus1[0], 4);
        assert_eq!(vps.max_num_reorder_pics[0], 2);
        assert_eq!(vps.num_units_in_tick, 1001);
        assert_eq!(vps.time_scale, 60000);
        assert_eq!(vps.cprms_present_flag, vec![true]);

        let hrd = &vps.hrd_parameters[0];
        assert!(hrd.nal_hrd_parameters_present_flag);
        assert_eq!(hrd.bit_rate_scale, 2);
        assert_eq!(hrd.cpb_size_scale, 3);
        assert!(hrd.fixed_pic_rate_within_cvs_flag[0]);
        assert_eq!(hrd.nal_hrd[0].bit_rate_value_minus1, vec![9999]);
        assert_eq!(hrd.nal_hrd[0].cpb_size_value_minus1, vec![2999]);
        assert_eq!(hrd.nal_hrd[0].cbr_flag, vec![true]);
        assert!(!vps.extension_flag);
    }

    #[test]
    fn sub_layer_level_without_profile() {
        let mut buf = Vec::new();
        {
            let mut w = BitWriter::new(&mut buf);
            write_ptl(&mut w, 120, &[Some(90), None]);
            w.write_f(8, 0xffu32).unwrap();
            w.write_trailing_bits().unwrap();
        }

        let mut r = BitReader::new(&buf);
        let ptl = ProfileTierLevel::parse(&mut r, true, 2).unwrap();
        assert_eq!(ptl.general_level_idc, 120);
        assert_eq!(ptl.sub_layer_profile[0], None);
        assert_eq!(ptl.sub_layer_level_idc[0], 90);
        // Inferred from the general level.
        assert_eq!(ptl.sub_layer_level_idc[1], 120);
        assert_eq!(r.u::<u32>("marker", 8).unwrap(), 0xff);
    }

    #[test]
    fn parse_sps_and_pps() {
        let mut parser = Parser::default();
        let sps = parser
            .parse_sps(&parse_nal(&nal(NaluType::SpsNut, 0, 0, &sps_rbsp(1, 8))))
            .unwrap();

        assert_eq!(sps.seq_parameter_set_id, 1);
        assert_eq!(sps.pic_width_in_luma_samples, 1920);
        assert_eq!(sps.pic_height_in_luma_samples, 1080);
        assert_eq!(sps.max_pic_order_cnt_lsb(), 256);
        assert_eq!(sps.ctb_log2_size_y, 6);
        assert_eq!(sps.pic_size_in_ctbs_y, 30 * 17);
        assert_eq!(sps.profile_tier_level.general_level_idc, 120);

        let pps = parser
            .parse_pps(&parse_nal(&nal(NaluType::PpsNut, 0, 0, &pps_rbsp(0, 1))))
            .unwrap();
        assert_eq!(pps.seq_parameter_set_id, 1);
        assert!(parser.pps_and_sps(0).is_ok());
        assert!(matches!(
            parser.pps_and_sps(1),
            Err(ParseError::MissingParameterSet(_))
        ));
    }

    #[test]
    fn sps_stream_info() {
        let mut parser = Parser::default();
        let vps = nal(NaluType::VpsNut, 0, 0, &vps_rbsp(0));
        let sps = nal(NaluType::SpsNut, 0, 0, &sps_rbsp(1, 8));
        parser.parse_vps(&parse_nal(&vps)).unwrap();
        parser.parse_sps(&parse_nal(&sps)).unwrap();

        let sps = parser.get_sps(1).unwrap();
        let info = sps.stream_info(parser.get_vps(sps.video_parameter_set_id));
        assert_eq!(info.frame_rate, Some(Ratio::new(60000, 1001)));
        assert_eq!(info.sample_aspect_ratio, None);
        assert_eq!(info.profile_idc, 1);
        assert_eq!(info.level_idc, 120);
        assert_eq!(info.pixel_format, PixelFormat::new(1, 8, 8));
        assert_eq!(info.display_size, info.coded_size);

        // Without its VPS the frame rate is unknown.
        assert_eq!(sps.stream_info(None).frame_rate, None);
    }

    #[test]
    fn conformance_window() {
        let sps = Sps {
            chroma_format_idc: 1,
            pic_width_in_luma_samples: 1920,
            pic_height_in_luma_samples: 1088,
            conformance_window_flag: true,
            conf_win_left_offset: 2,
            conf_win_bottom_offset: 4,
            ..Default::default()
        };
        assert_eq!(
            sps.visible_size(),
            Resolution {
                width: 1916,
                height: 1080
            }
        );

        let sps = Sps {
            chroma_format_idc: 2,
            ..sps
        };
        assert_eq!(sps.visible_size().height, 1084);
    }

    #[test]
    fn slice_header_prefix() {
        let mut parser = Parser::default();
        parser
            .parse_sps(&parse_nal(&nal(NaluType::SpsNut, 0, 0, &sps_rbsp(0, 8))))
            .unwrap();
        parser
            .parse_pps(&parse_nal(&nal(NaluType::PpsNut, 0, 0, &pps_rbsp(0, 0))))
            .unwrap();

        let idr = nal(NaluType::IdrWRadl, 0, 0, &slice_rbsp(NaluType::IdrWRadl, true, 0));
        let hdr = parser.parse_slice_header_prefix(&parse_nal(&idr)).unwrap();
        assert!(hdr.first_slice_segment_in_pic_flag);
        assert_eq!(hdr.slice_type, Some(2));
        assert_eq!(hdr.pic_order_cnt_lsb, 0);

        let trail = nal(NaluType::TrailR, 0, 0, &slice_rbsp(NaluType::TrailR, false, 77));
        let hdr = parser.parse_slice_header_prefix(&parse_nal(&trail)).unwrap();
        assert!(!hdr.first_slice_segment_in_pic_flag);
        assert_eq!(hdr.segment_address, 255);
        assert_eq!(hdr.slice_type, Some(1));
        assert_eq!(hdr.pic_order_cnt_lsb, 77);

        let vps = nal(NaluType::VpsNut, 0, 0, &vps_rbsp(0));
        assert!(matches!(
            parser.parse_slice_header_prefix(&parse_nal(&vps)),
            Err(ParseError::InvalidValue(_))
        ));
    }

    #[test]
    fn slice_without_pps() {
        let mut parser = Parser::default();
        let idr = nal(NaluType::IdrNLp, 0, 0, &slice_rbsp(NaluType::IdrNLp, true, 0));
        assert!(matches!(
            parser.parse_slice_header_prefix(&parse_nal(&idr)),
            Err(ParseError::MissingParameterSet(_))
        ));
    }

    #[test]
    fn trace_sps() {
        let mut parser = Parser::default();
        parser.set_trace(true);
        parser
            .parse_sps(&parse_nal(&nal(NaluType::SpsNut, 0, 0, &sps_rbsp(2, 6))))
            .unwrap();

        let trace = parser.take_trace().unwrap();
        assert_eq!(trace.value_of("sps_seq_parameter_set_id"), Some(2));
        assert_eq!(trace.value_of("log2_max_pic_order_cnt_lsb_minus4"), Some(2));
        assert!(parser.take_trace().is_none());
    }
}
