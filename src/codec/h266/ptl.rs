// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Syntax structures shared by the H.266 VPS and SPS: profile_tier_level(),
//! general_constraints_info(), dpb_parameters() and the HRD parameters.

use crate::bitstream_utils::BitReader;
use crate::codec::ParseError;

/// Maximum number of temporal sublayers, vps_max_sublayers_minus1 + 1.
pub const MAX_SUBLAYERS: usize = 7;
/// Upper bound for ptl_num_sub_profiles we are willing to allocate for.
const MAX_SUB_PROFILES: usize = 64;
/// hrd_cpb_cnt_minus1 shall be in the range of 0 to 31.
const MAX_CPB_CNT: u32 = 31;

/// 7.3.3.2 General constraints information syntax.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GeneralConstraintsInfo {
    pub present_flag: bool,
    /* general */
    pub intra_only_constraint_flag: bool,
    pub all_layers_independent_constraint_flag: bool,
    pub one_au_only_constraint_flag: bool,
    /* picture format */
    pub sixteen_minus_max_bitdepth_constraint_idc: u8,
    pub three_minus_max_chroma_format_constraint_idc: u8,
    /* NAL unit type related */
    pub no_mixed_nalu_types_in_pic_constraint_flag: bool,
    pub no_trail_constraint_flag: bool,
    pub no_stsa_constraint_flag: bool,
    pub no_rasl_constraint_flag: bool,
    pub no_radl_constraint_flag: bool,
    pub no_idr_constraint_flag: bool,
    pub no_cra_constraint_flag: bool,
    pub no_gdr_constraint_flag: bool,
    pub no_aps_constraint_flag: bool,
    pub no_idr_rpl_constraint_flag: bool,
    /* tile, slice, subpicture partitioning */
    pub one_tile_per_pic_constraint_flag: bool,
    pub pic_header_in_slice_header_constraint_flag: bool,
    pub one_slice_per_pic_constraint_flag: bool,
    pub no_rectangular_slice_constraint_flag: bool,
    pub one_slice_per_subpic_constraint_flag: bool,
    pub no_subpic_info_constraint_flag: bool,
    /* CTU and block partitioning */
    pub three_minus_max_log2_ctu_size_constraint_idc: u8,
    pub no_partition_constraints_override_constraint_flag: bool,
    pub no_mtt_constraint_flag: bool,
    pub no_qtbtt_dual_tree_intra_constraint_flag: bool,
    /* intra */
    pub no_palette_constraint_flag: bool,
    pub no_ibc_constraint_flag: bool,
    pub no_isp_constraint_flag: bool,
    pub no_mrl_constraint_flag: bool,
    pub no_mip_constraint_flag: bool,
    pub no_cclm_constraint_flag: bool,
    /* inter */
    pub no_ref_pic_resampling_constraint_flag: bool,
    pub no_res_change_in_clvs_constraint_flag: bool,
    pub no_weighted_prediction_constraint_flag: bool,
    pub no_ref_wraparound_constraint_flag: bool,
    pub no_temporal_mvp_constraint_flag: bool,
    pub no_sbtmvp_constraint_flag: bool,
    pub no_amvr_constraint_flag: bool,
    pub no_bdof_constraint_flag: bool,
    pub no_smvd_constraint_flag: bool,
    pub no_dmvr_constraint_flag: bool,
    pub no_mmvd_constraint_flag: bool,
    pub no_affine_motion_constraint_flag: bool,
    pub no_prof_constraint_flag: bool,
    pub no_bcw_constraint_flag: bool,
    pub no_ciip_constraint_flag: bool,
    pub no_gpm_constraint_flag: bool,
    /* transform, quantization, residual */
    pub no_luma_transform_size_64_constraint_flag: bool,
    pub no_transform_skip_constraint_flag: bool,
    pub no_bdpcm_constraint_flag: bool,
    pub no_mts_constraint_flag: bool,
    pub no_lfnst_constraint_flag: bool,
    pub no_joint_cbcr_constraint_flag: bool,
    pub no_sbt_constraint_flag: bool,
    pub no_act_constraint_flag: bool,
    pub no_explicit_scaling_list_constraint_flag: bool,
    pub no_dep_quant_constraint_flag: bool,
    pub no_sign_data_hiding_constraint_flag: bool,
    pub no_cu_qp_delta_constraint_flag: bool,
    pub no_chroma_qp_offset_constraint_flag: bool,
    /* loop filter */
    pub no_sao_constraint_flag: bool,
    pub no_alf_constraint_flag: bool,
    pub no_ccalf_constraint_flag: bool,
    pub no_lmcs_constraint_flag: bool,
    pub no_ladf_constraint_flag: bool,
    pub no_virtual_boundaries_constraint_flag: bool,
    pub num_reserved_bits: u8,
}

impl GeneralConstraintsInfo {
    pub(crate) fn parse(r: &mut BitReader) -> Result<Self, ParseError> {
        let mut gci = GeneralConstraintsInfo {
            present_flag: r.flag("gci_present_flag")?,
            ..Default::default()
        };

        if gci.present_flag {
            gci.intra_only_constraint_flag = r.flag("gci_intra_only_constraint_flag")?;
            gci.all_layers_independent_constraint_flag =
                r.flag("gci_all_layers_independent_constraint_flag")?;
            gci.one_au_only_constraint_flag = r.flag("gci_one_au_only_constraint_flag")?;

            gci.sixteen_minus_max_bitdepth_constraint_idc =
                r.u("gci_sixteen_minus_max_bitdepth_constraint_idc", 4)?;
            gci.three_minus_max_chroma_format_constraint_idc =
                r.u("gci_three_minus_max_chroma_format_constraint_idc", 2)?;

            gci.no_mixed_nalu_types_in_pic_constraint_flag =
                r.flag("gci_no_mixed_nalu_types_in_pic_constraint_flag")?;
            gci.no_trail_constraint_flag = r.flag("gci_no_trail_constraint_flag")?;
            gci.no_stsa_constraint_flag = r.flag("gci_no_stsa_constraint_flag")?;
            gci.no_rasl_constraint_flag = r.flag("gci_no_rasl_constraint_flag")?;
            gci.no_radl_constraint_flag = r.flag("gci_no_radl_constraint_flag")?;
            gci.no_idr_constraint_flag = r.flag("gci_no_idr_constraint_flag")?;
            gci.no_cra_constraint_flag = r.flag("gci_no_cra_constraint_flag")?;
            gci.no_gdr_constraint_flag = r.flag("gci_no_gdr_constraint_flag")?;
            gci.no_aps_constraint_flag = r.flag("gci_no_aps_constraint_flag")?;
            gci.no_idr_rpl_constraint_flag = r.flag("gci_no_idr_rpl_constraint_flag")?;

            gci.one_tile_per_pic_constraint_flag = r.flag("gci_one_tile_per_pic_constraint_flag")?;
            gci.pic_header_in_slice_header_constraint_flag =
                r.flag("gci_pic_header_in_slice_header_constraint_flag")?;
            gci.one_slice_per_pic_constraint_flag =
                r.flag("gci_one_slice_per_pic_constraint_flag")?;
            gci.no_rectangular_slice_constraint_flag =
                r.flag("gci_no_rectangular_slice_constraint_flag")?;
            gci.one_slice_per_subpic_constraint_flag =
                r.flag("gci_one_slice_per_subpic_constraint_flag")?;
            gci.no_subpic_info_constraint_flag = r.flag("gci_no_subpic_info_constraint_flag")?;

            gci.three_minus_max_log2_ctu_size_constraint_idc =
                r.u("gci_three_minus_max_log2_ctu_size_constraint_idc", 2)?;
            gci.no_partition_constraints_override_constraint_flag =
                r.flag("gci_no_partition_constraints_override_constraint_flag")?;
            gci.no_mtt_constraint_flag = r.flag("gci_no_mtt_constraint_flag")?;
            gci.no_qtbtt_dual_tree_intra_constraint_flag =
                r.flag("gci_no_qtbtt_dual_tree_intra_constraint_flag")?;

            gci.no_palette_constraint_flag = r.flag("gci_no_palette_constraint_flag")?;
            gci.no_ibc_constraint_flag = r.flag("gci_no_ibc_constraint_flag")?;
            gci.no_isp_constraint_flag = r.flag("gci_no_isp_constraint_flag")?;
            gci.no_mrl_constraint_flag = r.flag("gci_no_mrl_constraint_flag")?;
            gci.no_mip_constraint_flag = r.flag("gci_no_mip_constraint_flag")?;
            gci.no_cclm_constraint_flag = r.flag("gci_no_cclm_constraint_flag")?;

            gci.no_ref_pic_resampling_constraint_flag =
                r.flag("gci_no_ref_pic_resampling_constraint_flag")?;
            gci.no_res_change_in_clvs_constraint_flag =
                r.flag("gci_no_res_change_in_clvs_constraint_flag")?;
            gci.no_weighted_prediction_constraint_flag =
                r.flag("gci_no_weighted_prediction_constraint_flag")?;
            gci.no_ref_wraparound_constraint_flag =
                r.flag("gci_no_ref_wraparound_constraint_flag")?;
            gci.no_temporal_mvp_constraint_flag = r.flag("gci_no_temporal_mvp_constraint_flag")?;
            gci.no_sbtmvp_constraint_flag = r.flag("gci_no_sbtmvp_constraint_flag")?;
            gci.no_amvr_constraint_flag = r.flag("gci_no_amvr_constraint_flag")?;
            gci.no_bdof_constraint_flag = r.flag("gci_no_bdof_constraint_flag")?;
            gci.no_smvd_constraint_flag = r.flag("gci_no_smvd_constraint_flag")?;
            gci.no_dmvr_constraint_flag = r.flag("gci_no_dmvr_constraint_flag")?;
            gci.no_mmvd_constraint_flag = r.flag("gci_no_mmvd_constraint_flag")?;
            gci.no_affine_motion_constraint_flag =
                r.flag("gci_no_affine_motion_constraint_flag")?;
            gci.no_prof_constraint_flag = r.flag("gci_no_prof_constraint_flag")?;
            gci.no_bcw_constraint_flag = r.flag("gci_no_bcw_constraint_flag")?;
            gci.no_ciip_constraint_flag = r.flag("gci_no_ciip_constraint_flag")?;
            gci.no_gpm_constraint_flag = r.flag("gci_no_gpm_constraint_flag")?;

            gci.no_luma_transform_size_64_constraint_flag =
                r.flag("gci_no_luma_transform_size_64_constraint_flag")?;
            gci.no_transform_skip_constraint_flag =
                r.flag("gci_no_transform_skip_constraint_flag")?;
            gci.no_bdpcm_constraint_flag = r.flag("gci_no_bdpcm_constraint_flag")?;
            gci.no_mts_constraint_flag = r.flag("gci_no_mts_constraint_flag")?;
            gci.no_lfnst_constraint_flag = r.flag("gci_no_lfnst_constraint_flag")?;
            gci.no_joint_cbcr_constraint_flag = r.flag("gci_no_joint_cbcr_constraint_flag")?;
            gci.no_sbt_constraint_flag = r.flag("gci_no_sbt_constraint_flag")?;
            gci.no_act_constraint_flag = r.flag("gci_no_act_constraint_flag")?;
            gci.no_explicit_scaling_list_constraint_flag =
                r.flag("gci_no_explicit_scaling_list_constraint_flag")?;
            gci.no_dep_quant_constraint_flag = r.flag("gci_no_dep_quant_constraint_flag")?;
            gci.no_sign_data_hiding_constraint_flag =
                r.flag("gci_no_sign_data_hiding_constraint_flag")?;
            gci.no_cu_qp_delta_constraint_flag = r.flag("gci_no_cu_qp_delta_constraint_flag")?;
            gci.no_chroma_qp_offset_constraint_flag =
                r.flag("gci_no_chroma_qp_offset_constraint_flag")?;

            gci.no_sao_constraint_flag = r.flag("gci_no_sao_constraint_flag")?;
            gci.no_alf_constraint_flag = r.flag("gci_no_alf_constraint_flag")?;
            gci.no_ccalf_constraint_flag = r.flag("gci_no_ccalf_constraint_flag")?;
            gci.no_lmcs_constraint_flag = r.flag("gci_no_lmcs_constraint_flag")?;
            gci.no_ladf_constraint_flag = r.flag("gci_no_ladf_constraint_flag")?;
            gci.no_virtual_boundaries_constraint_flag =
                r.flag("gci_no_virtual_boundaries_constraint_flag")?;

            gci.num_reserved_bits = r.u("gci_num_reserved_bits", 8)?;
            for _ in 0..gci.num_reserved_bits {
                r.u::<u32>("gci_reserved_zero_bit", 1)?;
            }
        }

        r.skip_to_byte_alignment("gci_alignment_zero_bit")?;

        Ok(gci)
    }
}

/// 7.3.3.1 General profile, tier, and level syntax.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProfileTierLevel {
    pub general_profile_idc: u8,
    pub general_tier_flag: bool,
    pub general_level_idc: u8,
    pub frame_only_constraint_flag: bool,
    pub multilayer_enabled_flag: bool,
    pub general_constraints_info: GeneralConstraintsInfo,
    pub sublayer_level_present_flag: [bool; MAX_SUBLAYERS],
    /// Inferred from the next higher sublayer when not present, see 7.4.4.1.
    pub sublayer_level_idc: [u8; MAX_SUBLAYERS],
    pub num_sub_profiles: u8,
    pub general_sub_profile_idc: Vec<u32>,
}

impl ProfileTierLevel {
    pub(crate) fn parse(
        r: &mut BitReader,
        profile_tier_present_flag: bool,
        max_num_sub_layers_minus1: u8,
    ) -> Result<Self, ParseError> {
        let max_sublayers = usize::from(max_num_sub_layers_minus1);
        if max_sublayers >= MAX_SUBLAYERS {
            return Err(ParseError::UnsupportedDerivedRange(format!(
                "profile_tier_level() with MaxNumSubLayersMinus1 {}",
                max_num_sub_layers_minus1
            )));
        }

        let mut ptl = ProfileTierLevel::default();

        if profile_tier_present_flag {
            ptl.general_profile_idc = r.u("general_profile_idc", 7)?;
            ptl.general_tier_flag = r.flag("general_tier_flag")?;
        }

        ptl.general_level_idc = r.u("general_level_idc", 8)?;
        ptl.frame_only_constraint_flag = r.flag("ptl_frame_only_constraint_flag")?;
        ptl.multilayer_enabled_flag = r.flag("ptl_multilayer_enabled_flag")?;

        if profile_tier_present_flag {
            ptl.general_constraints_info = GeneralConstraintsInfo::parse(r)?;
        }

        for i in (0..max_sublayers).rev() {
            ptl.sublayer_level_present_flag[i] = r.flag("ptl_sublayer_level_present_flag")?;
        }

        r.skip_to_byte_alignment("ptl_reserved_zero_bit")?;

        ptl.sublayer_level_idc[max_sublayers] = ptl.general_level_idc;
        for i in (0..max_sublayers).rev() {
            ptl.sublayer_level_idc[i] = if ptl.sublayer_level_present_flag[i] {
                r.u("sublayer_level_idc", 8)?
            } else {
                ptl.sublayer_level_idc[i + 1]
            };
        }

        if profile_tier_present_flag {
            ptl.num_sub_profiles = r.u("ptl_num_sub_profiles", 8)?;
            if usize::from(ptl.num_sub_profiles) > MAX_SUB_PROFILES {
                return Err(ParseError::UnsupportedDerivedRange(format!(
                    "ptl_num_sub_profiles {}",
                    ptl.num_sub_profiles
                )));
            }

            for _ in 0..ptl.num_sub_profiles {
                ptl.general_sub_profile_idc
                    .push(r.u("general_sub_profile_idc", 32)?);
            }
        }

        Ok(ptl)
    }
}

/// 7.3.4 DPB parameters syntax.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DpbParameters {
    pub max_dec_pic_buffering_minus1: [u32; MAX_SUBLAYERS],
    pub max_num_reorder_pics: [u32; MAX_SUBLAYERS],
    pub max_latency_increase_plus1: [u32; MAX_SUBLAYERS],
}

impl DpbParameters {
    pub(crate) fn parse(
        r: &mut BitReader,
        max_sub_layers_minus1: u8,
        sub_layer_info_flag: bool,
    ) -> Result<Self, ParseError> {
        let max = usize::from(max_sub_layers_minus1);
        if max >= MAX_SUBLAYERS {
            return Err(ParseError::UnsupportedDerivedRange(format!(
                "dpb_parameters() with MaxSubLayersMinus1 {}",
                max
            )));
        }

        let mut dpb = DpbParameters::default();
        let start = if sub_layer_info_flag { 0 } else { max };

        for i in start..=max {
            dpb.max_dec_pic_buffering_minus1[i] = r.ue("dpb_max_dec_pic_buffering_minus1")?;
            dpb.max_num_reorder_pics[i] =
                r.ue_max("dpb_max_num_reorder_pics", dpb.max_dec_pic_buffering_minus1[i])?;
            dpb.max_latency_increase_plus1[i] =
                r.ue_max("dpb_max_latency_increase_plus1", u32::MAX - 1)?;
        }

        // The values of the highest sublayer apply to all lower sublayers.
        for i in 0..start {
            dpb.max_dec_pic_buffering_minus1[i] = dpb.max_dec_pic_buffering_minus1[max];
            dpb.max_num_reorder_pics[i] = dpb.max_num_reorder_pics[max];
            dpb.max_latency_increase_plus1[i] = dpb.max_latency_increase_plus1[max];
        }

        Ok(dpb)
    }
}

/// 7.3.5.1 General timing and HRD parameters syntax.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GeneralTimingHrdParameters {
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub general_nal_hrd_params_present_flag: bool,
    pub general_vcl_hrd_params_present_flag: bool,
    pub general_same_pic_timing_in_all_ols_flag: bool,
    pub general_du_hrd_params_present_flag: bool,
    pub tick_divisor_minus2: u8,
    pub bit_rate_scale: u8,
    pub cpb_size_scale: u8,
    pub cpb_size_du_scale: u8,
    pub hrd_cpb_cnt_minus1: u32,
}

impl GeneralTimingHrdParameters {
    pub(crate) fn parse(r: &mut BitReader) -> Result<Self, ParseError> {
        let mut hrd = GeneralTimingHrdParameters {
            num_units_in_tick: r.u("num_units_in_tick", 32)?,
            time_scale: r.u("time_scale", 32)?,
            general_nal_hrd_params_present_flag: r.flag("general_nal_hrd_params_present_flag")?,
            general_vcl_hrd_params_present_flag: r.flag("general_vcl_hrd_params_present_flag")?,
            ..Default::default()
        };

        if hrd.num_units_in_tick == 0 || hrd.time_scale == 0 {
            return Err(ParseError::InvalidValue(format!(
                "num_units_in_tick {} time_scale {}",
                hrd.num_units_in_tick, hrd.time_scale
            )));
        }

        if hrd.general_nal_hrd_params_present_flag || hrd.general_vcl_hrd_params_present_flag {
            hrd.general_same_pic_timing_in_all_ols_flag =
                r.flag("general_same_pic_timing_in_all_ols_flag")?;
            hrd.general_du_hrd_params_present_flag =
                r.flag("general_du_hrd_params_present_flag")?;
            if hrd.general_du_hrd_params_present_flag {
                hrd.tick_divisor_minus2 = r.u("tick_divisor_minus2", 8)?;
            }
            hrd.bit_rate_scale = r.u("bit_rate_scale", 4)?;
            hrd.cpb_size_scale = r.u("cpb_size_scale", 4)?;
            if hrd.general_du_hrd_params_present_flag {
                hrd.cpb_size_du_scale = r.u("cpb_size_du_scale", 4)?;
            }
            hrd.hrd_cpb_cnt_minus1 = r.ue("hrd_cpb_cnt_minus1")?;
            if hrd.hrd_cpb_cnt_minus1 > MAX_CPB_CNT {
                return Err(ParseError::UnsupportedDerivedRange(format!(
                    "hrd_cpb_cnt_minus1 {}",
                    hrd.hrd_cpb_cnt_minus1
                )));
            }
        }

        Ok(hrd)
    }
}

/// 7.3.5.3 Sublayer HRD parameters syntax, one entry per CPB.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SublayerHrdParameters {
    pub bit_rate_value_minus1: Vec<u32>,
    pub cpb_size_value_minus1: Vec<u32>,
    pub cpb_size_du_value_minus1: Vec<u32>,
    pub bit_rate_du_value_minus1: Vec<u32>,
    pub cbr_flag: Vec<bool>,
}

impl SublayerHrdParameters {
    fn parse(r: &mut BitReader, general: &GeneralTimingHrdParameters) -> Result<Self, ParseError> {
        let mut hrd = SublayerHrdParameters::default();

        for _ in 0..=general.hrd_cpb_cnt_minus1 {
            hrd.bit_rate_value_minus1
                .push(r.ue_max("bit_rate_value_minus1", u32::MAX - 1)?);
            hrd.cpb_size_value_minus1
                .push(r.ue_max("cpb_size_value_minus1", u32::MAX - 1)?);
            if general.general_du_hrd_params_present_flag {
                hrd.cpb_size_du_value_minus1
                    .push(r.ue_max("cpb_size_du_value_minus1", u32::MAX - 1)?);
                hrd.bit_rate_du_value_minus1
                    .push(r.ue_max("bit_rate_du_value_minus1", u32::MAX - 1)?);
            }
            hrd.cbr_flag.push(r.flag("cbr_flag")?);
        }

        Ok(hrd)
    }
}

/// 7.3.5.2 OLS timing and HRD parameters syntax.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OlsTimingHrdParameters {
    pub fixed_pic_rate_general_flag: [bool; MAX_SUBLAYERS],
    /// Inferred to be 1 when fixed_pic_rate_general_flag is 1.
    pub fixed_pic_rate_within_cvs_flag: [bool; MAX_SUBLAYERS],
    pub elemental_duration_in_tc_minus1: [u32; MAX_SUBLAYERS],
    pub low_delay_hrd_flag: [bool; MAX_SUBLAYERS],
    pub nal_sublayer_hrd_parameters: [SublayerHrdParameters; MAX_SUBLAYERS],
    pub vcl_sublayer_hrd_parameters: [SublayerHrdParameters; MAX_SUBLAYERS],
}

impl OlsTimingHrdParameters {
    pub(crate) fn parse(
        r: &mut BitReader,
        general: &GeneralTimingHrdParameters,
        first_sub_layer: u8,
        max_sub_layers_val: u8,
    ) -> Result<Self, ParseError> {
        let max = usize::from(max_sub_layers_val);
        if max >= MAX_SUBLAYERS {
            return Err(ParseError::UnsupportedDerivedRange(format!(
                "ols_timing_hrd_parameters() with MaxSubLayersVal {}",
                max
            )));
        }

        let mut hrd = OlsTimingHrdParameters::default();

        for i in usize::from(first_sub_layer)..=max {
            hrd.fixed_pic_rate_general_flag[i] = r.flag("fixed_pic_rate_general_flag")?;
            hrd.fixed_pic_rate_within_cvs_flag[i] = if !hrd.fixed_pic_rate_general_flag[i] {
                r.flag("fixed_pic_rate_within_cvs_flag")?
            } else {
                true
            };

            if hrd.fixed_pic_rate_within_cvs_flag[i] {
                hrd.elemental_duration_in_tc_minus1[i] =
                    r.ue_max("elemental_duration_in_tc_minus1", 2047)?;
            } else if (general.general_nal_hrd_params_present_flag
                || general.general_vcl_hrd_params_present_flag)
                && general.hrd_cpb_cnt_minus1 == 0
            {
                hrd.low_delay_hrd_flag[i] = r.flag("low_delay_hrd_flag")?;
            }

            if general.general_nal_hrd_params_present_flag {
                hrd.nal_sublayer_hrd_parameters[i] = SublayerHrdParameters::parse(r, general)?;
            }

            if general.general_vcl_hrd_params_present_flag {
                hrd.vcl_sublayer_hrd_parameters[i] = SublayerHrdParameters::parse(r, general)?;
            }
        }

        Ok(hrd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::bitstream_utils::BitWriter;

    #[test]
    fn ptl_without_profile_infers_sublayer_levels() {
        let mut buf = Vec::new();
        {
            let mut w = BitWriter::new(&mut buf);
            w.write_f(8, 51u32).unwrap(); // general_level_idc
            w.write_f(1, true).unwrap(); // ptl_frame_only_constraint_flag
            w.write_f(1, false).unwrap(); // ptl_multilayer_enabled_flag
            // ptl_sublayer_level_present_flag[1], [0]
            w.write_f(1, true).unwrap();
            w.write_f(1, false).unwrap();
            w.align().unwrap();
            w.write_f(8, 48u32).unwrap(); // sublayer_level_idc[1]
        }

        let mut r = BitReader::new(&buf);
        let ptl = ProfileTierLevel::parse(&mut r, false, 2).unwrap();
        assert_eq!(ptl.general_level_idc, 51);
        assert!(ptl.frame_only_constraint_flag);
        assert_eq!(ptl.sublayer_level_idc[2], 51);
        assert_eq!(ptl.sublayer_level_idc[1], 48);
        assert_eq!(ptl.sublayer_level_idc[0], 48);
        assert_eq!(r.num_bits_left(), 0);
    }

    #[test]
    fn ptl_with_profile_and_constraints() {
        let mut buf = Vec::new();
        {
            let mut w = BitWriter::new(&mut buf);
            w.write_f(7, 1u32).unwrap(); // general_profile_idc (Main 10)
            w.write_f(1, false).unwrap(); // general_tier_flag
            w.write_f(8, 83u32).unwrap(); // general_level_idc
            w.write_f(1, true).unwrap();
            w.write_f(1, false).unwrap();
            // general_constraints_info()
            w.write_f(1, true).unwrap(); // gci_present_flag
            w.write_f(1, true).unwrap(); // gci_intra_only_constraint_flag
            w.write_f(2, 0u32).unwrap();
            w.write_f(4, 6u32).unwrap(); // sixteen_minus_max_bitdepth
            w.write_f(2, 1u32).unwrap(); // three_minus_max_chroma_format
            for _ in 0..16 {
                w.write_f(1, false).unwrap();
            }
            w.write_f(2, 2u32).unwrap(); // three_minus_max_log2_ctu_size
            for _ in 0..44 {
                w.write_f(1, false).unwrap();
            }
            w.write_f(8, 3u32).unwrap(); // gci_num_reserved_bits
            w.write_f(3, 0u32).unwrap();
            w.align().unwrap();
            w.align().unwrap();
            w.write_f(8, 2u32).unwrap(); // ptl_num_sub_profiles
            w.write_f(32, 0xdead_beefu32).unwrap();
            w.write_f(32, 7u32).unwrap();
        }

        let mut r = BitReader::new(&buf).with_trace(true);
        let ptl = ProfileTierLevel::parse(&mut r, true, 0).unwrap();
        assert_eq!(ptl.general_profile_idc, 1);
        assert_eq!(ptl.general_level_idc, 83);
        let gci = &ptl.general_constraints_info;
        assert!(gci.present_flag);
        assert!(gci.intra_only_constraint_flag);
        assert_eq!(gci.sixteen_minus_max_bitdepth_constraint_idc, 6);
        assert_eq!(gci.three_minus_max_chroma_format_constraint_idc, 1);
        assert_eq!(gci.three_minus_max_log2_ctu_size_constraint_idc, 2);
        assert_eq!(gci.num_reserved_bits, 3);
        assert_eq!(ptl.general_sub_profile_idc, vec![0xdead_beef, 7]);
        assert_eq!(r.num_bits_left(), 0);

        let trace = r.take_trace().unwrap();
        assert_eq!(trace.value_of("gci_sixteen_minus_max_bitdepth_constraint_idc"), Some(6));
        assert_eq!(trace.value_of("general_sub_profile_idc"), Some(0xdead_beef));
    }

    #[test]
    fn dpb_parameters_fill_lower_sublayers() {
        let mut buf = Vec::new();
        {
            let mut w = BitWriter::new(&mut buf);
            w.write_ue(4u32).unwrap();
            w.write_ue(2u32).unwrap();
            w.write_ue(0u32).unwrap();
            w.write_trailing_bits().unwrap();
        }

        let mut r = BitReader::new(&buf);
        let dpb = DpbParameters::parse(&mut r, 2, false).unwrap();
        assert_eq!(dpb.max_dec_pic_buffering_minus1[..3], [4, 4, 4]);
        assert_eq!(dpb.max_num_reorder_pics[..3], [2, 2, 2]);
    }

    #[test]
    fn hrd_parameters() {
        let mut buf = Vec::new();
        {
            let mut w = BitWriter::new(&mut buf);
            w.write_f(32, 1001u32).unwrap();
            w.write_f(32, 60000u32).unwrap();
            w.write_f(1, true).unwrap(); // nal
            w.write_f(1, false).unwrap(); // vcl
            w.write_f(1, true).unwrap(); // same_pic_timing
            w.write_f(1, false).unwrap(); // du
            w.write_f(4, 2u32).unwrap();
            w.write_f(4, 3u32).unwrap();
            w.write_ue(1u32).unwrap(); // hrd_cpb_cnt_minus1
            // ols_timing_hrd_parameters(0, 0)
            w.write_f(1, false).unwrap(); // fixed_pic_rate_general_flag
            w.write_f(1, false).unwrap(); // fixed_pic_rate_within_cvs_flag
            for j in 0..2u32 {
                w.write_ue(1000 + j).unwrap();
                w.write_ue(2000 + j).unwrap();
                w.write_f(1, j == 1).unwrap();
            }
            w.write_trailing_bits().unwrap();
        }

        let mut r = BitReader::new(&buf);
        let general = GeneralTimingHrdParameters::parse(&mut r).unwrap();
        assert_eq!(general.time_scale, 60000);
        assert_eq!(general.hrd_cpb_cnt_minus1, 1);

        let ols = OlsTimingHrdParameters::parse(&mut r, &general, 0, 0).unwrap();
        assert!(!ols.fixed_pic_rate_within_cvs_flag[0]);
        assert!(!ols.low_delay_hrd_flag[0]);
        let nal = &ols.nal_sublayer_hrd_parameters[0];
        assert_eq!(nal.bit_rate_value_minus1, vec![1000, 1001]);
        assert_eq!(nal.cpb_size_value_minus1, vec![2000, 2001]);
        assert_eq!(nal.cbr_flag, vec![false, true]);
        assert!(!r.has_more_rsbp_data());
    }

    #[test]
    fn too_many_cpbs() {
        let mut buf = Vec::new();
        {
            let mut w = BitWriter::new(&mut buf);
            w.write_f(32, 1u32).unwrap();
            w.write_f(32, 25u32).unwrap();
            w.write_f(1, false).unwrap();
            w.write_f(1, true).unwrap();
            w.write_f(1, false).unwrap();
            w.write_f(1, false).unwrap();
            w.write_f(8, 0u32).unwrap();
            w.write_ue(32u32).unwrap();
        }

        let mut r = BitReader::new(&buf);
        assert!(matches!(
            GeneralTimingHrdParameters::parse(&mut r),
            Err(ParseError::UnsupportedDerivedRange(_))
        ));
    }
}
