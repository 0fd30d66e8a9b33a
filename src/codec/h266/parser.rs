// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.266 NAL unit header and parameter set parsing.
//!
//! The VPS is parsed in full. SPS, PPS and picture headers are parsed as far as
//! needed to derive the picture order count of each picture.

use std::collections::BTreeMap;
use std::io::Cursor;

use bitreader::BitReader as HeaderReader;
use bytes::Buf;
use enumn::N;
use log::debug;

use crate::bitstream_utils::BitReader;
use crate::codec::h266::ptl::DpbParameters;
use crate::codec::h266::ptl::ProfileTierLevel;
use crate::codec::h266::vps::Vps;
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

/// sps_num_subpics_minus1 shall be in the range of 0 to MaxSlicesPerAu - 1.
const MAX_SUBPICS: u32 = 600;

/// Table 5 – NAL unit type codes and NAL unit type classes
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum NaluType {
    #[default]
    TrailNut = 0,
    StsaNut = 1,
    RadlNut = 2,
    RaslNut = 3,
    RsvVcl4 = 4,
    RsvVcl5 = 5,
    RsvVcl6 = 6,
    IdrWRadl = 7,
    IdrNLp = 8,
    CraNut = 9,
    GdrNut = 10,
    RsvIrap11 = 11,
    OpiNut = 12,
    DciNut = 13,
    VpsNut = 14,
    SpsNut = 15,
    PpsNut = 16,
    PrefixApsNut = 17,
    SuffixApsNut = 18,
    PhNut = 19,
    AudNut = 20,
    EosNut = 21,
    EobNut = 22,
    PrefixSeiNut = 23,
    SuffixSeiNut = 24,
    FdNut = 25,
    RsvNvcl26 = 26,
    RsvNvcl27 = 27,
    Unspec28 = 28,
    Unspec29 = 29,
    Unspec30 = 30,
    Unspec31 = 31,
}

impl NaluType {
    pub fn is_idr(&self) -> bool {
        matches!(self, Self::IdrWRadl | Self::IdrNLp)
    }

    /// IDR and CRA pictures. The reserved IRAP type is not decodable.
    pub fn is_irap(&self) -> bool {
        matches!(self, Self::IdrWRadl | Self::IdrNLp | Self::CraNut)
    }

    pub fn is_gdr(&self) -> bool {
        matches!(self, Self::GdrNut)
    }

    pub fn is_radl(&self) -> bool {
        matches!(self, Self::RadlNut)
    }

    pub fn is_rasl(&self) -> bool {
        matches!(self, Self::RaslNut)
    }

    /// Coded slice NAL units of a defined type.
    pub fn is_slice(&self) -> bool {
        matches!(
            self,
            Self::TrailNut
                | Self::StsaNut
                | Self::RadlNut
                | Self::RaslNut
                | Self::IdrWRadl
                | Self::IdrNLp
                | Self::CraNut
                | Self::GdrNut
        )
    }
}

/// 7.3.1.2 NAL unit header syntax.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NaluHeader {
    type_: NaluType,
    /// The layer a VCL NAL unit belongs to, or the layer a non-VCL NAL unit
    /// applies to.
    nuh_layer_id: u8,
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

        // nuh_reserved_zero_bit
        r.skip(1)?;

        let nuh_layer_id = r.read_u8(6)?;
        let type_ = r.read_u8(5)?;
        let type_ = NaluType::n(type_).ok_or_else(|| {
            ParseError::MalformedNalHeader(format!("invalid nal_unit_type {}", type_))
        })?;

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
            NaluType::VpsNut
                | NaluType::SpsNut
                | NaluType::PpsNut
                | NaluType::PrefixApsNut
                | NaluType::SuffixApsNut
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
        NalHeader::Vvc(header)
    }
}

pub type Nalu<'a> = nalu::Nalu<'a, NaluHeader>;

/// Number of bits of a `u(v)` element coding values up to `range - 1`,
/// Ceil(Log2(range)).
fn ceil_log2(range: u32) -> usize {
    if range <= 1 {
        0
    } else {
        (32 - (range - 1).leading_zeros()) as usize
    }
}

/// A H.266 Sequence Parameter Set, up to the DPB parameters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sps {
    pub seq_parameter_set_id: u8,
    /// Zero when the SPS does not refer to a VPS.
    pub video_parameter_set_id: u8,
    pub max_sublayers_minus1: u8,
    pub chroma_format_idc: u8,
    pub log2_ctu_size_minus5: u8,
    pub ptl_dpb_hrd_params_present_flag: bool,
    pub profile_tier_level: ProfileTierLevel,
    pub gdr_enabled_flag: bool,
    pub ref_pic_resampling_enabled_flag: bool,
    pub res_change_in_clvs_allowed_flag: bool,
    pub pic_width_max_in_luma_samples: u32,
    pub pic_height_max_in_luma_samples: u32,
    pub conformance_window_flag: bool,
    pub conf_win_left_offset: u32,
    pub conf_win_right_offset: u32,
    pub conf_win_top_offset: u32,
    pub conf_win_bottom_offset: u32,

    pub subpic_info_present_flag: bool,
    pub num_subpics_minus1: u32,
    pub independent_subpics_flag: bool,
    pub subpic_same_size_flag: bool,
    pub subpic_ctu_top_left_x: Vec<u32>,
    pub subpic_ctu_top_left_y: Vec<u32>,
    pub subpic_width_minus1: Vec<u32>,
    pub subpic_height_minus1: Vec<u32>,
    pub subpic_treated_as_pic_flag: Vec<bool>,
    pub loop_filter_across_subpic_enabled_flag: Vec<bool>,
    pub subpic_id_len_minus1: u32,
    pub subpic_id_mapping_explicitly_signalled_flag: bool,
    pub subpic_id_mapping_present_flag: bool,
    pub subpic_id: Vec<u32>,

    pub bitdepth_minus8: u8,
    pub entropy_coding_sync_enabled_flag: bool,
    pub entry_point_offsets_present_flag: bool,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub poc_msb_cycle_flag: bool,
    pub poc_msb_cycle_len_minus1: u32,
    pub num_extra_ph_bytes: u8,
    pub extra_ph_bit_present_flag: Vec<bool>,
    pub num_extra_sh_bytes: u8,
    pub extra_sh_bit_present_flag: Vec<bool>,
    pub sublayer_dpb_params_flag: bool,
    pub dpb_parameters: DpbParameters,
}

impl Sps {
    pub fn ctb_size_y(&self) -> u32 {
        1 << (self.log2_ctu_size_minus5 + 5)
    }

    /// MaxPicOrderCntLsb
    pub fn max_pic_order_cnt_lsb(&self) -> u32 {
        1 << (self.log2_max_pic_order_cnt_lsb_minus4 + 4)
    }

    pub fn coded_size(&self) -> Resolution {
        Resolution {
            width: self.pic_width_max_in_luma_samples,
            height: self.pic_height_max_in_luma_samples,
        }
    }

    /// The maximum picture size once the SPS conformance window is applied.
    pub fn visible_size(&self) -> Resolution {
        if !self.conformance_window_flag {
            return self.coded_size();
        }

        cropped_size(
            self.coded_size(),
            sub_width_height_c(self.chroma_format_idc, false),
            (
                self.conf_win_left_offset,
                self.conf_win_right_offset,
                self.conf_win_top_offset,
                self.conf_win_bottom_offset,
            ),
        )
    }

    /// The stream format signalled by this SPS. The frame rate comes from the
    /// general timing and HRD parameters of `vps`. Without a profile_tier_level
    /// in the SPS the profile and level are 0.
    pub fn stream_info(&self, vps: Option<&Vps>) -> StreamInfo {
        let frame_rate = vps
            .filter(|vps| vps.timing_hrd_params_present_flag)
            .map(|vps| &vps.general_timing_hrd_parameters)
            .filter(|hrd| hrd.num_units_in_tick != 0 && hrd.time_scale != 0)
            .map(|hrd| Ratio::new(u64::from(hrd.time_scale), u64::from(hrd.num_units_in_tick)));
        let bit_depth = self.bitdepth_minus8 + 8;

        StreamInfo {
            coded_size: self.coded_size(),
            display_size: self.visible_size(),
            pixel_format: PixelFormat::new(self.chroma_format_idc, bit_depth, bit_depth),
            profile_idc: self.profile_tier_level.general_profile_idc,
            level_idc: self.profile_tier_level.general_level_idc,
            frame_rate,
            sample_aspect_ratio: None,
        }
    }

    /// NumExtraPhBits
    pub fn num_extra_ph_bits(&self) -> usize {
        self.extra_ph_bit_present_flag.iter().filter(|&&f| f).count()
    }

    fn parse(r: &mut BitReader) -> Result<Self, ParseError> {
        let mut sps = Sps {
            seq_parameter_set_id: r.u("sps_seq_parameter_set_id", 4)?,
            video_parameter_set_id: r.u("sps_video_parameter_set_id", 4)?,
            max_sublayers_minus1: r.u("sps_max_sublayers_minus1", 3)?,
            chroma_format_idc: r.u("sps_chroma_format_idc", 2)?,
            log2_ctu_size_minus5: r.u("sps_log2_ctu_size_minus5", 2)?,
            ptl_dpb_hrd_params_present_flag: r.flag("sps_ptl_dpb_hrd_params_present_flag")?,
            ..Default::default()
        };

        if sps.max_sublayers_minus1 > 6 {
            return Err(ParseError::InvalidValue(format!(
                "sps_max_sublayers_minus1 {}",
                sps.max_sublayers_minus1
            )));
        }

        if sps.log2_ctu_size_minus5 > 2 {
            return Err(ParseError::InvalidValue(format!(
                "sps_log2_ctu_size_minus5 {}",
                sps.log2_ctu_size_minus5
            )));
        }

        if sps.ptl_dpb_hrd_params_present_flag {
            sps.profile_tier_level = ProfileTierLevel::parse(r, true, sps.max_sublayers_minus1)?;
        }

        sps.gdr_enabled_flag = r.flag("sps_gdr_enabled_flag")?;
        sps.ref_pic_resampling_enabled_flag = r.flag("sps_ref_pic_resampling_enabled_flag")?;
        if sps.ref_pic_resampling_enabled_flag {
            sps.res_change_in_clvs_allowed_flag = r.flag("sps_res_change_in_clvs_allowed_flag")?;
        }

        sps.pic_width_max_in_luma_samples = r.ue("sps_pic_width_max_in_luma_samples")?;
        sps.pic_height_max_in_luma_samples = r.ue("sps_pic_height_max_in_luma_samples")?;
        if sps.pic_width_max_in_luma_samples == 0 || sps.pic_height_max_in_luma_samples == 0 {
            return Err(ParseError::InvalidValue(format!(
                "picture size {}x{}",
                sps.pic_width_max_in_luma_samples, sps.pic_height_max_in_luma_samples
            )));
        }

        sps.conformance_window_flag = r.flag("sps_conformance_window_flag")?;
        if sps.conformance_window_flag {
            sps.conf_win_left_offset = r.ue("sps_conf_win_left_offset")?;
            sps.conf_win_right_offset = r.ue("sps_conf_win_right_offset")?;
            sps.conf_win_top_offset = r.ue("sps_conf_win_top_offset")?;
            sps.conf_win_bottom_offset = r.ue("sps_conf_win_bottom_offset")?;
        }

        sps.subpic_info_present_flag = r.flag("sps_subpic_info_present_flag")?;
        if sps.subpic_info_present_flag {
            sps.parse_subpic_info(r)?;
        }

        sps.bitdepth_minus8 = r.ue_max("sps_bitdepth_minus8", 8)?;
        sps.entropy_coding_sync_enabled_flag = r.flag("sps_entropy_coding_sync_enabled_flag")?;
        sps.entry_point_offsets_present_flag = r.flag("sps_entry_point_offsets_present_flag")?;

        sps.log2_max_pic_order_cnt_lsb_minus4 = r.u("sps_log2_max_pic_order_cnt_lsb_minus4", 4)?;
        if sps.log2_max_pic_order_cnt_lsb_minus4 > 12 {
            return Err(ParseError::InvalidValue(format!(
                "sps_log2_max_pic_order_cnt_lsb_minus4 {}",
                sps.log2_max_pic_order_cnt_lsb_minus4
            )));
        }

        sps.poc_msb_cycle_flag = r.flag("sps_poc_msb_cycle_flag")?;
        if sps.poc_msb_cycle_flag {
            sps.poc_msb_cycle_len_minus1 = r.ue_max(
                "sps_poc_msb_cycle_len_minus1",
                27 - u32::from(sps.log2_max_pic_order_cnt_lsb_minus4),
            )?;
        }

        sps.num_extra_ph_bytes = r.u("sps_num_extra_ph_bytes", 2)?;
        for _ in 0..usize::from(sps.num_extra_ph_bytes) * 8 {
            sps.extra_ph_bit_present_flag
                .push(r.flag("sps_extra_ph_bit_present_flag")?);
        }

        sps.num_extra_sh_bytes = r.u("sps_num_extra_sh_bytes", 2)?;
        for _ in 0..usize::from(sps.num_extra_sh_bytes) * 8 {
            sps.extra_sh_bit_present_flag
                .push(r.flag("sps_extra_sh_bit_present_flag")?);
        }

        if sps.ptl_dpb_hrd_params_present_flag {
            if sps.max_sublayers_minus1 > 0 {
                sps.sublayer_dpb_params_flag = r.flag("sps_sublayer_dpb_params_flag")?;
            }

            sps.dpb_parameters =
                DpbParameters::parse(r, sps.max_sublayers_minus1, sps.sublayer_dpb_params_flag)?;
        }

        Ok(sps)
    }

    fn parse_subpic_info(&mut self, r: &mut BitReader) -> Result<(), ParseError> {
        self.num_subpics_minus1 = r.ue_max("sps_num_subpics_minus1", MAX_SUBPICS - 1)?;
        self.independent_subpics_flag = true;
        if self.num_subpics_minus1 > 0 {
            self.independent_subpics_flag = r.flag("sps_independent_subpics_flag")?;
            self.subpic_same_size_flag = r.flag("sps_subpic_same_size_flag")?;
        }

        let ctb_size = self.ctb_size_y();
        let width_in_ctbs = (self.pic_width_max_in_luma_samples + ctb_size - 1) / ctb_size;
        let height_in_ctbs = (self.pic_height_max_in_luma_samples + ctb_size - 1) / ctb_size;
        let wide = self.pic_width_max_in_luma_samples > ctb_size;
        let tall = self.pic_height_max_in_luma_samples > ctb_size;
        let num_subpics_minus1 = self.num_subpics_minus1 as usize;

        if num_subpics_minus1 > 0 {
            for i in 0..=num_subpics_minus1 {
                let mut top_left_x = 0;
                let mut top_left_y = 0;
                let mut width_minus1 = 0;
                let mut height_minus1 = 0;

                if !self.subpic_same_size_flag || i == 0 {
                    if i > 0 && wide {
                        top_left_x =
                            r.u("sps_subpic_ctu_top_left_x", ceil_log2(width_in_ctbs))?;
                    }
                    if i > 0 && tall {
                        top_left_y =
                            r.u("sps_subpic_ctu_top_left_y", ceil_log2(height_in_ctbs))?;
                    }
                    if i < num_subpics_minus1 && wide {
                        width_minus1 = r.u("sps_subpic_width_minus1", ceil_log2(width_in_ctbs))?;
                    }
                    if i < num_subpics_minus1 && tall {
                        height_minus1 =
                            r.u("sps_subpic_height_minus1", ceil_log2(height_in_ctbs))?;
                    }
                }

                self.subpic_ctu_top_left_x.push(top_left_x);
                self.subpic_ctu_top_left_y.push(top_left_y);
                self.subpic_width_minus1.push(width_minus1);
                self.subpic_height_minus1.push(height_minus1);

                if !self.independent_subpics_flag {
                    self.subpic_treated_as_pic_flag
                        .push(r.flag("sps_subpic_treated_as_pic_flag")?);
                    self.loop_filter_across_subpic_enabled_flag
                        .push(r.flag("sps_loop_filter_across_subpic_enabled_flag")?);
                }
            }
        }

        self.subpic_id_len_minus1 = r.ue_max("sps_subpic_id_len_minus1", 15)?;
        self.subpic_id_mapping_explicitly_signalled_flag =
            r.flag("sps_subpic_id_mapping_explicitly_signalled_flag")?;
        if self.subpic_id_mapping_explicitly_signalled_flag {
            self.subpic_id_mapping_present_flag = r.flag("sps_subpic_id_mapping_present_flag")?;
            if self.subpic_id_mapping_present_flag {
                let bits = self.subpic_id_len_minus1 as usize + 1;
                for _ in 0..=num_subpics_minus1 {
                    self.subpic_id.push(r.u("sps_subpic_id", bits)?);
                }
            }
        }

        Ok(())
    }
}

/// A H.266 Picture Parameter Set, up to pps_no_pic_partition_flag.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pps {
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,
    pub mixed_nalu_types_in_pic_flag: bool,
    pub pic_width_in_luma_samples: u32,
    pub pic_height_in_luma_samples: u32,
    pub conformance_window_flag: bool,
    pub conf_win_left_offset: u32,
    pub conf_win_right_offset: u32,
    pub conf_win_top_offset: u32,
    pub conf_win_bottom_offset: u32,
    pub scaling_window_explicit_signalling_flag: bool,
    pub scaling_win_left_offset: i32,
    pub scaling_win_right_offset: i32,
    pub scaling_win_top_offset: i32,
    pub scaling_win_bottom_offset: i32,
    pub output_flag_present_flag: bool,
    pub no_pic_partition_flag: bool,
}

impl Pps {
    fn parse(r: &mut BitReader) -> Result<Self, ParseError> {
        let mut pps = Pps {
            pic_parameter_set_id: r.u("pps_pic_parameter_set_id", 6)?,
            seq_parameter_set_id: r.u("pps_seq_parameter_set_id", 4)?,
            mixed_nalu_types_in_pic_flag: r.flag("pps_mixed_nalu_types_in_pic_flag")?,
            pic_width_in_luma_samples: r.ue("pps_pic_width_in_luma_samples")?,
            pic_height_in_luma_samples: r.ue("pps_pic_height_in_luma_samples")?,
            conformance_window_flag: r.flag("pps_conformance_window_flag")?,
            ..Default::default()
        };

        if pps.conformance_window_flag {
            pps.conf_win_left_offset = r.ue("pps_conf_win_left_offset")?;
            pps.conf_win_right_offset = r.ue("pps_conf_win_right_offset")?;
            pps.conf_win_top_offset = r.ue("pps_conf_win_top_offset")?;
            pps.conf_win_bottom_offset = r.ue("pps_conf_win_bottom_offset")?;
        }

        pps.scaling_window_explicit_signalling_flag =
            r.flag("pps_scaling_window_explicit_signalling_flag")?;
        if pps.scaling_window_explicit_signalling_flag {
            pps.scaling_win_left_offset = r.se("pps_scaling_win_left_offset")?;
            pps.scaling_win_right_offset = r.se("pps_scaling_win_right_offset")?;
            pps.scaling_win_top_offset = r.se("pps_scaling_win_top_offset")?;
            pps.scaling_win_bottom_offset = r.se("pps_scaling_win_bottom_offset")?;
        }

        pps.output_flag_present_flag = r.flag("pps_output_flag_present_flag")?;
        pps.no_pic_partition_flag = r.flag("pps_no_pic_partition_flag")?;

        Ok(pps)
    }
}

/// 7.3.2.6 Adaptation parameter set header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Aps {
    /// 0: ALF, 1: LMCS, 2: scaling list.
    pub params_type: u8,
    pub adaptation_parameter_set_id: u8,
    pub chroma_present_flag: bool,
    pub is_suffix: bool,
}

impl Aps {
    /// APS ids are only unique per aps_params_type.
    pub fn key(&self) -> u32 {
        (u32::from(self.params_type) << 5) | u32::from(self.adaptation_parameter_set_id)
    }

    fn parse(r: &mut BitReader, is_suffix: bool) -> Result<Self, ParseError> {
        let aps = Aps {
            params_type: r.u("aps_params_type", 3)?,
            adaptation_parameter_set_id: r.u("aps_adaptation_parameter_set_id", 5)?,
            chroma_present_flag: r.flag("aps_chroma_present_flag")?,
            is_suffix,
        };

        if aps.params_type > 2 {
            return Err(ParseError::InvalidValue(format!(
                "aps_params_type {}",
                aps.params_type
            )));
        }

        Ok(aps)
    }
}

/// 7.3.2.8 Picture header structure, up to ph_poc_msb_cycle_val.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PicHeader {
    pub gdr_or_irap_pic_flag: bool,
    pub non_ref_pic_flag: bool,
    pub gdr_pic_flag: bool,
    pub inter_slice_allowed_flag: bool,
    pub intra_slice_allowed_flag: bool,
    pub pic_parameter_set_id: u8,
    pub pic_order_cnt_lsb: u32,
    pub recovery_poc_cnt: u32,
    pub poc_msb_cycle_present_flag: bool,
    pub poc_msb_cycle_val: u32,
}

impl PicHeader {
    fn parse(r: &mut BitReader, parser: &Parser) -> Result<Self, ParseError> {
        let mut ph = PicHeader {
            gdr_or_irap_pic_flag: r.flag("ph_gdr_or_irap_pic_flag")?,
            non_ref_pic_flag: r.flag("ph_non_ref_pic_flag")?,
            intra_slice_allowed_flag: true,
            ..Default::default()
        };

        if ph.gdr_or_irap_pic_flag {
            ph.gdr_pic_flag = r.flag("ph_gdr_pic_flag")?;
        }

        ph.inter_slice_allowed_flag = r.flag("ph_inter_slice_allowed_flag")?;
        if ph.inter_slice_allowed_flag {
            ph.intra_slice_allowed_flag = r.flag("ph_intra_slice_allowed_flag")?;
        }

        ph.pic_parameter_set_id = r.ue_max("ph_pic_parameter_set_id", 63)?;

        let (_, sps) = parser.pps_and_sps(ph.pic_parameter_set_id)?;

        ph.pic_order_cnt_lsb = r.u(
            "ph_pic_order_cnt_lsb",
            usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4,
        )?;

        if ph.gdr_pic_flag {
            ph.recovery_poc_cnt = r.ue_max("ph_recovery_poc_cnt", sps.max_pic_order_cnt_lsb())?;
        }

        for _ in 0..sps.num_extra_ph_bits() {
            r.flag("ph_extra_bit")?;
        }

        if sps.poc_msb_cycle_flag {
            ph.poc_msb_cycle_present_flag = r.flag("ph_poc_msb_cycle_present_flag")?;
            if ph.poc_msb_cycle_present_flag {
                ph.poc_msb_cycle_val = r.u(
                    "ph_poc_msb_cycle_val",
                    sps.poc_msb_cycle_len_minus1 as usize + 1,
                )?;
            }
        }

        Ok(ph)
    }
}

/// The start of a slice header: whether it carries the picture header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeaderPrefix {
    pub picture_header_in_slice_header_flag: bool,
    pub picture_header: Option<PicHeader>,
}

/// Keeps the last parsed instance of every parameter set.
#[derive(Debug, Default)]
pub struct Parser {
    active_vpses: BTreeMap<u8, Vps>,
    active_spses: BTreeMap<u8, Sps>,
    active_ppses: BTreeMap<u8, Pps>,
    active_apses: BTreeMap<u32, Aps>,
    trace_enabled: bool,
    last_trace: Option<SyntaxTrace>,
}

impl Parser {
    pub fn set_trace(&mut self, enabled: bool) {
        self.trace_enabled = enabled;
    }

    /// Takes the trace of the last parsed structure.
    pub fn take_trace(&mut self) -> Option<SyntaxTrace> {
        self.last_trace.take()
    }

    /// Runs `parse` over the RBSP of `nalu`, keeping its trace whether it
    /// succeeded or not.
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

    pub fn parse_vps(&mut self, nalu: &Nalu) -> Result<&Vps, ParseError> {
        let vps = self.parse_rbsp(nalu, |r, _| Vps::parse(r))?;
        let key = vps.video_parameter_set_id;

        debug!("VPS {} with {} layers", key, vps.layer_id.len());
        self.active_vpses.insert(key, vps);
        self.get_vps(key)
            .ok_or_else(|| ParseError::MissingParameterSet(format!("VPS {}", key)))
    }

    pub fn parse_sps(&mut self, nalu: &Nalu) -> Result<&Sps, ParseError> {
        let sps = self.parse_rbsp(nalu, |r, _| Sps::parse(r))?;
        let key = sps.seq_parameter_set_id;

        if sps.video_parameter_set_id != 0 && self.get_vps(sps.video_parameter_set_id).is_none() {
            debug!(
                "SPS {} refers to VPS {} which was not received",
                key, sps.video_parameter_set_id
            );
        }

        self.active_spses.insert(key, sps);
        self.get_sps(key)
            .ok_or_else(|| ParseError::MissingParameterSet(format!("SPS {}", key)))
    }

    pub fn parse_pps(&mut self, nalu: &Nalu) -> Result<&Pps, ParseError> {
        let pps = self.parse_rbsp(nalu, |r, _| Pps::parse(r))?;
        let key = pps.pic_parameter_set_id;

        self.active_ppses.insert(key, pps);
        self.get_pps(key)
            .ok_or_else(|| ParseError::MissingParameterSet(format!("PPS {}", key)))
    }

    pub fn parse_aps(&mut self, nalu: &Nalu) -> Result<&Aps, ParseError> {
        let is_suffix = nalu.header().type_() == NaluType::SuffixApsNut;
        let aps = self.parse_rbsp(nalu, |r, _| Aps::parse(r, is_suffix))?;
        let key = aps.key();

        self.active_apses.insert(key, aps);
        self.active_apses
            .get(&key)
            .ok_or_else(|| ParseError::MissingParameterSet(format!("APS {}", key)))
    }

    /// Parses a picture header NAL unit.
    pub fn parse_picture_header(&mut self, nalu: &Nalu) -> Result<PicHeader, ParseError> {
        self.parse_rbsp(nalu, PicHeader::parse)
    }

    /// Parses the slice header up to its embedded picture header, if any.
    pub fn parse_slice_header_prefix(
        &mut self,
        nalu: &Nalu,
    ) -> Result<SliceHeaderPrefix, ParseError> {
        self.parse_rbsp(nalu, |r, parser| {
            let picture_header_in_slice_header_flag =
                r.flag("sh_picture_header_in_slice_header_flag")?;
            let picture_header = if picture_header_in_slice_header_flag {
                Some(PicHeader::parse(r, parser)?)
            } else {
                None
            };

            Ok(SliceHeaderPrefix {
                picture_header_in_slice_header_flag,
                picture_header,
            })
        })
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

    /// Looks up an APS by its [`Aps::key`].
    pub fn get_aps(&self, key: u32) -> Option<&Aps> {
        self.active_apses.get(&key)
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
    use crate::codec::h266::ptl::GeneralTimingHrdParameters;
    use crate::codec::h266::vps::tests::three_layer_vps_rbsp;

    /// Prepends a start code and a NAL unit header to an RBSP.
    pub(crate) fn nal(type_: NaluType, layer_id: u8, tid: u8, rbsp: &[u8]) -> Vec<u8> {
        let mut out = vec![0, 0, 0, 1, layer_id & 0x3f, ((type_ as u8) << 3) | (tid + 1)];
        out.extend(escape_rbsp(rbsp));
        out
    }

    /// An SPS with 8 bit POC LSBs, no PTL and a 64x64 CTB.
    pub(crate) fn sps_rbsp(sps_id: u32, vps_id: u32, poc_msb_cycle: bool) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut w = BitWriter::new(&mut buf);
            w.write_f(4, sps_id).unwrap();
            w.write_f(4, vps_id).unwrap();
            w.write_f(3, 0u32).unwrap(); // sps_max_sublayers_minus1
            w.write_f(2, 1u32).unwrap(); // sps_chroma_format_idc
            w.write_f(2, 1u32).unwrap(); // sps_log2_ctu_size_minus5
            w.write_f(1, false).unwrap(); // sps_ptl_dpb_hrd_params_present_flag
            w.write_f(1, false).unwrap(); // sps_gdr_enabled_flag
            w.write_f(1, false).unwrap(); // sps_ref_pic_resampling_enabled_flag
            w.write_ue(416u32).unwrap();
            w.write_ue(240u32).unwrap();
            w.write_f(1, false).unwrap(); // sps_conformance_window_flag
            w.write_f(1, false).unwrap(); // sps_subpic_info_present_flag
            w.write_ue(2u32).unwrap(); // sps_bitdepth_minus8
            w.write_f(1, false).unwrap();
            w.write_f(1, false).unwrap();
            w.write_f(4, 4u32).unwrap(); // sps_log2_max_pic_order_cnt_lsb_minus4
            w.write_f(1, poc_msb_cycle).unwrap();
            if poc_msb_cycle {
                w.write_ue(3u32).unwrap(); // sps_poc_msb_cycle_len_minus1
            }
            w.write_f(2, 1u32).unwrap(); // sps_num_extra_ph_bytes
            w.write_f(8, 0b1000_0001u32).unwrap(); // sps_extra_ph_bit_present_flag
            w.write_f(2, 0u32).unwrap(); // sps_num_extra_sh_bytes
            // The remaining SPS syntax is not parsed.
            w.write_f(8, 0xa5u32).unwrap();
            w.write_trailing_bits().unwrap();
        }

        buf
    }

    pub(crate) fn pps_rbsp(pps_id: u32, sps_id: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut w = BitWriter::new(&mut buf);
            w.write_f(6, pps_id).unwrap();
            w.write_f(4, sps_id).unwrap();
            w.write_f(1, false).unwrap();
            w.write_ue(416u32).unwrap();
            w.write_ue(240u32).unwrap();
            w.write_f(1, false).unwrap(); // pps_conformance_window_flag
            w.write_f(1, true).unwrap(); // pps_scaling_window_explicit_signalling_flag
            w.write_se(-2).unwrap();
            w.write_se(2).unwrap();
            w.write_se(0).unwrap();
            w.write_se(0).unwrap();
            w.write_f(1, false).unwrap();
            w.write_f(1, true).unwrap(); // pps_no_pic_partition_flag
            w.write_trailing_bits().unwrap();
        }

        buf
    }

    /// Writes picture_header_structure() for an SPS made by [`sps_rbsp`].
    pub(crate) fn write_picture_header<W: std::io::Write>(
        w: &mut BitWriter<W>,
        irap: bool,
        pps_id: u32,
        poc_lsb: u32,
        msb_cycle: Option<u32>,
    ) {
        w.write_f(1, irap).unwrap(); // ph_gdr_or_irap_pic_flag
        w.write_f(1, false).unwrap(); // ph_non_ref_pic_flag
        if irap {
            w.write_f(1, false).unwrap(); // ph_gdr_pic_flag
        }
        w.write_f(1, !irap).unwrap(); // ph_inter_slice_allowed_flag
        if !irap {
            w.write_f(1, true).unwrap(); // ph_intra_slice_allowed_flag
        }
        w.write_ue(pps_id).unwrap();
        w.write_f(8, poc_lsb).unwrap();
        w.write_f(1, true).unwrap(); // ph_extra_bit[0]
        w.write_f(1, false).unwrap(); // ph_extra_bit[1]
        if let Some(val) = msb_cycle {
            w.write_f(1, true).unwrap(); // ph_poc_msb_cycle_present_flag
            w.write_f(4, val).unwrap();
        }
        // Remaining picture header fields.
        w.write_f(5, 0b10110u32).unwrap();
    }

    pub(crate) fn picture_header_rbsp(irap: bool, pps_id: u32, poc_lsb: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut w = BitWriter::new(&mut buf);
            write_picture_header(&mut w, irap, pps_id, poc_lsb, None);
            w.write_trailing_bits().unwrap();
        }

        buf
    }

    /// A slice RBSP, with an embedded picture header when `ph` is set.
    pub(crate) fn slice_rbsp(ph: Option<(bool, u32, u32)>) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut w = BitWriter::new(&mut buf);
            w.write_f(1, ph.is_some()).unwrap();
            if let Some((irap, pps_id, poc_lsb)) = ph {
                write_picture_header(&mut w, irap, pps_id, poc_lsb, None);
            }
            w.write_f(16, 0xbeefu32).unwrap();
            w.write_trailing_bits().unwrap();
        }

        buf
    }

    fn parse_nal<'a>(data: &'a [u8]) -> Nalu<'a> {
        let mut cursor = Cursor::new(data);
        Nalu::next(&mut cursor).unwrap().unwrap()
    }

    #[test]
    fn nalu_header() {
        let data = [0x00, 0x00, 0x01, 0x00, 0x79, 0xaa];
        let nalu = parse_nal(&data);
        let hdr = nalu.header();
        assert_eq!(hdr.type_(), NaluType::SpsNut);
        assert_eq!(hdr.layer_id(), 0);
        assert_eq!(hdr.temporal_id(), 0);
        assert!(hdr.is_parameter_set());
        assert!(!hdr.is_slice());

        let data = [0x00, 0x00, 0x01, 0x02, 0x3a, 0xaa];
        let nalu = parse_nal(&data);
        let hdr = nalu.header();
        assert_eq!(hdr.type_(), NaluType::IdrWRadl);
        assert_eq!(hdr.layer_id(), 2);
        assert_eq!(hdr.temporal_id(), 1);
        assert!(hdr.is_random_access());
    }

    #[test]
    fn malformed_nalu_headers() {
        // forbidden_zero_bit
        let forbidden = Cursor::new([0x80u8, 0x79]);
        assert!(matches!(
            NaluHeader::parse(&forbidden),
            Err(ParseError::MalformedNalHeader(_))
        ));

        // nuh_temporal_id_plus1 == 0
        let tid = Cursor::new([0x00u8, 0x78]);
        assert!(matches!(
            NaluHeader::parse(&tid),
            Err(ParseError::MalformedNalHeader(_))
        ));

        let short = Cursor::new([0x00u8]);
        assert!(matches!(
            NaluHeader::parse(&short),
            Err(ParseError::MalformedNalHeader(_))
        ));
    }

    #[test]
    fn parse_parameter_sets() {
        let mut stream = nal(NaluType::VpsNut, 0, 0, &three_layer_vps_rbsp(2));
        stream.extend(nal(NaluType::SpsNut, 0, 0, &sps_rbsp(1, 2, false)));
        stream.extend(nal(NaluType::PpsNut, 0, 0, &pps_rbsp(3, 1)));
        stream.extend(nal(NaluType::PrefixApsNut, 0, 0, &[0x22, 0x80]));

        let mut parser = Parser::default();
        let mut cursor = Cursor::new(stream.as_slice());

        let vps_nal = Nalu::next(&mut cursor).unwrap().unwrap();
        let vps = parser.parse_vps(&vps_nal).unwrap();
        assert_eq!(vps.id(), 2);
        assert_eq!(vps.total_num_olss(), 3);

        let sps_nal = Nalu::next(&mut cursor).unwrap().unwrap();
        let sps = parser.parse_sps(&sps_nal).unwrap();
        assert_eq!(sps.seq_parameter_set_id, 1);
        assert_eq!(sps.video_parameter_set_id, 2);
        assert_eq!(sps.ctb_size_y(), 64);
        assert_eq!(sps.pic_width_max_in_luma_samples, 416);
        assert_eq!(sps.bitdepth_minus8, 2);
        assert_eq!(sps.max_pic_order_cnt_lsb(), 256);
        assert_eq!(sps.num_extra_ph_bits(), 2);

        let pps_nal = Nalu::next(&mut cursor).unwrap().unwrap();
        let pps = parser.parse_pps(&pps_nal).unwrap();
        assert_eq!(pps.pic_parameter_set_id, 3);
        assert_eq!(pps.seq_parameter_set_id, 1);
        assert_eq!(pps.scaling_win_left_offset, -2);
        assert_eq!(pps.scaling_win_right_offset, 2);
        assert!(pps.no_pic_partition_flag);

        // aps_params_type 1 (LMCS), id 2, chroma present
        let aps_nal = Nalu::next(&mut cursor).unwrap().unwrap();
        let aps = parser.parse_aps(&aps_nal).unwrap();
        assert_eq!(aps.params_type, 1);
        assert_eq!(aps.adaptation_parameter_set_id, 2);
        assert!(aps.chroma_present_flag);
        assert_eq!(aps.key(), (1 << 5) | 2);
        assert!(parser.get_aps((1 << 5) | 2).is_some());

        let (pps, sps) = parser.pps_and_sps(3).unwrap();
        assert_eq!(pps.seq_parameter_set_id, sps.seq_parameter_set_id);
        assert!(matches!(
            parser.pps_and_sps(4),
            Err(ParseError::MissingParameterSet(_))
        ));
    }

    #[test]
    fn sps_stream_info() {
        let mut parser = Parser::default();
        let data = nal(NaluType::SpsNut, 0, 0, &sps_rbsp(1, 2, false));
        let mut cursor = Cursor::new(data.as_slice());
        let sps_nal = Nalu::next(&mut cursor).unwrap().unwrap();
        let sps = parser.parse_sps(&sps_nal).unwrap();

        let info = sps.stream_info(None);
        assert_eq!(
            info.display_size,
            Resolution {
                width: 416,
                height: 240
            }
        );
        assert_eq!(info.pixel_format, PixelFormat::new(1, 10, 10));
        assert_eq!((info.profile_idc, info.level_idc), (0, 0));
        assert_eq!(info.frame_rate, None);

        let vps = Vps {
            timing_hrd_params_present_flag: true,
            general_timing_hrd_parameters: GeneralTimingHrdParameters {
                num_units_in_tick: 1,
                time_scale: 50,
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(sps.stream_info(Some(&vps)).frame_rate, Some(Ratio::new(50, 1)));

        let cropped = Sps {
            conformance_window_flag: true,
            conf_win_right_offset: 4,
            conf_win_bottom_offset: 1,
            ..sps.clone()
        };
        assert_eq!(
            cropped.visible_size(),
            Resolution {
                width: 408,
                height: 238
            }
        );
    }

    #[test]
    fn failed_vps_keeps_previous_instance() {
        let mut parser = Parser::default();

        let good = nal(NaluType::VpsNut, 0, 0, &three_layer_vps_rbsp(1));
        let good_nal = parse_nal(&good);
        parser.parse_vps(&good_nal).unwrap();

        let mut truncated = three_layer_vps_rbsp(1);
        truncated.truncate(5);
        let bad = nal(NaluType::VpsNut, 0, 0, &truncated);
        let bad_nal = parse_nal(&bad);
        assert_eq!(
            parser.parse_vps(&bad_nal).unwrap_err(),
            ParseError::BitstreamTruncated
        );

        assert_eq!(parser.get_vps(1).unwrap().total_num_olss(), 3);
    }

    #[test]
    fn picture_header_and_slice_prefix() {
        let mut stream = nal(NaluType::SpsNut, 0, 0, &sps_rbsp(0, 0, true));
        stream.extend(nal(NaluType::PpsNut, 0, 0, &pps_rbsp(0, 0)));

        let mut ph_rbsp = Vec::new();
        {
            let mut w = BitWriter::new(&mut ph_rbsp);
            write_picture_header(&mut w, false, 0, 17, Some(5));
            w.write_trailing_bits().unwrap();
        }
        stream.extend(nal(NaluType::PhNut, 0, 0, &ph_rbsp));
        stream.extend(nal(NaluType::TrailNut, 0, 0, &slice_rbsp(None)));

        let mut parser = Parser::default();
        parser.set_trace(true);
        let mut cursor = Cursor::new(stream.as_slice());

        let sps_nal = Nalu::next(&mut cursor).unwrap().unwrap();
        parser.parse_sps(&sps_nal).unwrap();
        let pps_nal = Nalu::next(&mut cursor).unwrap().unwrap();
        parser.parse_pps(&pps_nal).unwrap();

        let ph_nal = Nalu::next(&mut cursor).unwrap().unwrap();
        let ph = parser.parse_picture_header(&ph_nal).unwrap();
        assert!(!ph.gdr_or_irap_pic_flag);
        assert!(ph.inter_slice_allowed_flag);
        assert_eq!(ph.pic_order_cnt_lsb, 17);
        assert!(ph.poc_msb_cycle_present_flag);
        assert_eq!(ph.poc_msb_cycle_val, 5);

        let trace = parser.take_trace().unwrap();
        assert_eq!(trace.value_of("ph_pic_order_cnt_lsb"), Some(17));
        assert_eq!(trace.values_of("ph_extra_bit").collect::<Vec<_>>(), vec![1, 0]);

        let slice_nal = Nalu::next(&mut cursor).unwrap().unwrap();
        let prefix = parser.parse_slice_header_prefix(&slice_nal).unwrap();
        assert!(!prefix.picture_header_in_slice_header_flag);
        assert!(prefix.picture_header.is_none());
    }

    #[test]
    fn picture_header_without_pps() {
        let ph = nal(NaluType::PhNut, 0, 0, &picture_header_rbsp(true, 0, 0));
        let ph_nal = parse_nal(&ph);

        let mut parser = Parser::default();
        assert!(matches!(
            parser.parse_picture_header(&ph_nal),
            Err(ParseError::MissingParameterSet(_))
        ));
    }

    #[test]
    fn sps_with_subpictures() {
        let mut buf = Vec::new();
        {
            let mut w = BitWriter::new(&mut buf);
            w.write_f(4, 0u32).unwrap();
            w.write_f(4, 0u32).unwrap();
            w.write_f(3, 0u32).unwrap();
            w.write_f(2, 1u32).unwrap();
            w.write_f(2, 0u32).unwrap(); // 32x32 CTBs
            w.write_f(1, false).unwrap();
            w.write_f(1, false).unwrap();
            w.write_f(1, false).unwrap();
            w.write_ue(128u32).unwrap(); // 4 CTBs wide
            w.write_ue(64u32).unwrap(); // 2 CTBs tall
            w.write_f(1, false).unwrap();
            w.write_f(1, true).unwrap(); // sps_subpic_info_present_flag
            w.write_ue(1u32).unwrap(); // sps_num_subpics_minus1
            w.write_f(1, true).unwrap(); // sps_independent_subpics_flag
            w.write_f(1, false).unwrap(); // sps_subpic_same_size_flag
            // subpicture 0: width and height
            w.write_f(2, 1u32).unwrap();
            w.write_f(1, 1u32).unwrap();
            // subpicture 1: top left x and y
            w.write_f(2, 2u32).unwrap();
            w.write_f(1, 0u32).unwrap();
            w.write_ue(3u32).unwrap(); // sps_subpic_id_len_minus1
            w.write_f(1, true).unwrap();
            w.write_f(1, true).unwrap();
            w.write_f(4, 9u32).unwrap();
            w.write_f(4, 6u32).unwrap();
            w.write_ue(0u32).unwrap(); // sps_bitdepth_minus8
            w.write_f(1, false).unwrap();
            w.write_f(1, false).unwrap();
            w.write_f(4, 0u32).unwrap();
            w.write_f(1, false).unwrap();
            w.write_f(2, 0u32).unwrap();
            w.write_f(2, 0u32).unwrap();
            w.write_trailing_bits().unwrap();
        }

        let mut r = BitReader::new(&buf);
        let sps = Sps::parse(&mut r).unwrap();
        assert_eq!(sps.num_subpics_minus1, 1);
        assert_eq!(sps.subpic_width_minus1, vec![1, 0]);
        assert_eq!(sps.subpic_height_minus1, vec![1, 0]);
        assert_eq!(sps.subpic_ctu_top_left_x, vec![0, 2]);
        assert_eq!(sps.subpic_ctu_top_left_y, vec![0, 0]);
        assert_eq!(sps.subpic_id, vec![9, 6]);
        assert_eq!(sps.max_pic_order_cnt_lsb(), 16);
    }
}
