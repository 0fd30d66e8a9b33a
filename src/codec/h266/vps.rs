// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! 7.3.2.3 Video parameter set RBSP syntax.

use log::debug;

use crate::bitstream_utils::BitReader;
use crate::codec::h266::ols::DerivedVpsState;
use crate::codec::h266::ptl::DpbParameters;
use crate::codec::h266::ptl::GeneralTimingHrdParameters;
use crate::codec::h266::ptl::OlsTimingHrdParameters;
use crate::codec::h266::ptl::ProfileTierLevel;
use crate::codec::ParseError;

/// A H.266 Video Parameter Set.
///
/// Per layer vectors have vps_max_layers_minus1 + 1 entries. Rows of the
/// inter-layer arrays have one entry per lower layer, so that
/// `direct_ref_layer_flag[i][j]` only exists for `j < i`. Syntax elements that
/// are not present hold their inferred value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Vps {
    pub video_parameter_set_id: u8,
    pub max_layers_minus1: u8,
    pub max_sublayers_minus1: u8,
    pub default_ptl_dpb_hrd_max_tid_flag: bool,
    pub all_independent_layers_flag: bool,
    pub layer_id: Vec<u8>,
    pub independent_layer_flag: Vec<bool>,
    pub max_tid_ref_present_flag: Vec<bool>,
    pub direct_ref_layer_flag: Vec<Vec<bool>>,
    pub max_tid_il_ref_pics_plus1: Vec<Vec<u8>>,
    pub each_layer_is_an_ols_flag: bool,
    pub ols_mode_idc: u8,
    pub num_output_layer_sets_minus2: u8,
    /// Indexed by OLS, row 0 is empty.
    pub ols_output_layer_flag: Vec<Vec<bool>>,

    pub num_ptls_minus1: u8,
    pub pt_present_flag: Vec<bool>,
    pub ptl_max_tid: Vec<u8>,
    pub profile_tier_level: Vec<ProfileTierLevel>,
    /// One entry per OLS.
    pub ols_ptl_idx: Vec<u8>,

    pub num_dpb_params_minus1: u32,
    pub sublayer_dpb_params_present_flag: bool,
    pub dpb_max_tid: Vec<u8>,
    pub dpb_parameters: Vec<DpbParameters>,
    /// The `ols_dpb_*` vectors have one entry per multi-layer OLS.
    pub ols_dpb_pic_width: Vec<u32>,
    pub ols_dpb_pic_height: Vec<u32>,
    pub ols_dpb_chroma_format: Vec<u8>,
    pub ols_dpb_bitdepth_minus8: Vec<u8>,
    pub ols_dpb_params_idx: Vec<u32>,

    pub timing_hrd_params_present_flag: bool,
    pub general_timing_hrd_parameters: GeneralTimingHrdParameters,
    pub sublayer_cpb_params_present_flag: bool,
    pub num_ols_timing_hrd_params_minus1: u32,
    pub hrd_max_tid: Vec<u8>,
    pub ols_timing_hrd_parameters: Vec<OlsTimingHrdParameters>,
    pub ols_timing_hrd_idx: Vec<u32>,

    pub extension_flag: bool,

    /// Variables derived from the syntax elements above.
    pub derived: DerivedVpsState,
}

impl Vps {
    pub fn id(&self) -> u8 {
        self.video_parameter_set_id
    }

    pub fn total_num_olss(&self) -> usize {
        self.derived.total_num_olss
    }

    pub fn num_multi_layer_olss(&self) -> usize {
        self.derived.num_multi_layer_olss
    }

    /// Parses a VPS RBSP, i.e. the NAL unit payload after the header with the
    /// emulation prevention bytes removed.
    pub(crate) fn parse(r: &mut BitReader) -> Result<Self, ParseError> {
        let mut vps = Vps {
            video_parameter_set_id: r.u("vps_video_parameter_set_id", 4)?,
            max_layers_minus1: r.u("vps_max_layers_minus1", 6)?,
            max_sublayers_minus1: r.u("vps_max_sublayers_minus1", 3)?,
            ..Default::default()
        };

        if vps.video_parameter_set_id == 0 {
            return Err(ParseError::InvalidValue(String::from(
                "vps_video_parameter_set_id 0 is reserved",
            )));
        }

        if vps.max_sublayers_minus1 > 6 {
            return Err(ParseError::InvalidValue(format!(
                "vps_max_sublayers_minus1 {}",
                vps.max_sublayers_minus1
            )));
        }

        let num_layers = usize::from(vps.max_layers_minus1) + 1;
        let max_sublayers_minus1 = vps.max_sublayers_minus1;

        vps.default_ptl_dpb_hrd_max_tid_flag =
            if vps.max_layers_minus1 > 0 && vps.max_sublayers_minus1 > 0 {
                r.flag("vps_default_ptl_dpb_hrd_max_tid_flag")?
            } else {
                true
            };

        vps.all_independent_layers_flag = if vps.max_layers_minus1 > 0 {
            r.flag("vps_all_independent_layers_flag")?
        } else {
            true
        };

        vps.parse_layers(r, num_layers)?;

        vps.each_layer_is_an_ols_flag = vps.max_layers_minus1 == 0;
        vps.ols_mode_idc = 2;
        if vps.max_layers_minus1 > 0 {
            if vps.all_independent_layers_flag {
                vps.each_layer_is_an_ols_flag = r.flag("vps_each_layer_is_an_ols_flag")?;
            }

            if !vps.each_layer_is_an_ols_flag {
                if !vps.all_independent_layers_flag {
                    vps.ols_mode_idc = r.u("vps_ols_mode_idc", 2)?;
                }

                if vps.ols_mode_idc == 2 {
                    vps.num_output_layer_sets_minus2 = r.u("vps_num_output_layer_sets_minus2", 8)?;
                    vps.ols_output_layer_flag.push(Vec::new());
                    for _ in 1..=usize::from(vps.num_output_layer_sets_minus2) + 1 {
                        let mut flags = Vec::with_capacity(num_layers);
                        for _ in 0..num_layers {
                            flags.push(r.flag("vps_ols_output_layer_flag")?);
                        }
                        vps.ols_output_layer_flag.push(flags);
                    }
                }
            }

            vps.num_ptls_minus1 = r.u("vps_num_ptls_minus1", 8)?;
        }

        vps.derived = DerivedVpsState::compute_structure(&vps)?;
        let total_num_olss = vps.derived.total_num_olss;

        if usize::from(vps.num_ptls_minus1) >= total_num_olss {
            return Err(ParseError::UnsupportedDerivedRange(format!(
                "vps_num_ptls_minus1 {} with TotalNumOlss {}",
                vps.num_ptls_minus1, total_num_olss
            )));
        }

        for i in 0..=usize::from(vps.num_ptls_minus1) {
            let pt_present = if i > 0 {
                r.flag("vps_pt_present_flag")?
            } else {
                true
            };

            let max_tid = if !vps.default_ptl_dpb_hrd_max_tid_flag {
                r.u("vps_ptl_max_tid", 3)?
            } else {
                max_sublayers_minus1
            };

            if max_tid > max_sublayers_minus1 {
                return Err(ParseError::InvalidValue(format!(
                    "vps_ptl_max_tid[{}] {} above vps_max_sublayers_minus1 {}",
                    i, max_tid, max_sublayers_minus1
                )));
            }

            vps.pt_present_flag.push(pt_present);
            vps.ptl_max_tid.push(max_tid);
        }

        r.skip_to_byte_alignment("vps_ptl_alignment_zero_bit")?;

        for i in 0..=usize::from(vps.num_ptls_minus1) {
            let mut ptl = ProfileTierLevel::parse(r, vps.pt_present_flag[i], vps.ptl_max_tid[i])?;

            // Profile, tier and constraints are carried over from the previous
            // structure when not present.
            if !vps.pt_present_flag[i] {
                if let Some(prev) = vps.profile_tier_level.last() {
                    ptl.general_profile_idc = prev.general_profile_idc;
                    ptl.general_tier_flag = prev.general_tier_flag;
                    ptl.general_constraints_info = prev.general_constraints_info.clone();
                    ptl.num_sub_profiles = prev.num_sub_profiles;
                    ptl.general_sub_profile_idc = prev.general_sub_profile_idc.clone();
                }
            }

            vps.profile_tier_level.push(ptl);
        }

        let num_ptls = usize::from(vps.num_ptls_minus1) + 1;
        for i in 0..total_num_olss {
            let idx = if num_ptls > 1 && num_ptls != total_num_olss {
                r.u("vps_ols_ptl_idx", 8)?
            } else if num_ptls == 1 {
                0
            } else {
                i as u8
            };

            if usize::from(idx) >= num_ptls {
                return Err(ParseError::UnsupportedDerivedRange(format!(
                    "vps_ols_ptl_idx[{}] {} with {} PTLs",
                    i, idx, num_ptls
                )));
            }

            vps.ols_ptl_idx.push(idx);
        }

        let mut derived = std::mem::take(&mut vps.derived);
        derived.compute_sublayers(&vps)?;
        vps.derived = derived;

        if !vps.each_layer_is_an_ols_flag {
            vps.parse_dpb_and_hrd(r)?;
        }

        vps.extension_flag = r.flag("vps_extension_flag")?;
        if vps.extension_flag {
            while r.has_more_rsbp_data() {
                r.flag("vps_extension_data_flag")?;
            }
        }

        debug!(
            "VPS {}: {} layers, {} OLSs, {} multi-layer",
            vps.video_parameter_set_id,
            num_layers,
            total_num_olss,
            vps.derived.num_multi_layer_olss
        );

        Ok(vps)
    }

    fn parse_layers(&mut self, r: &mut BitReader, num_layers: usize) -> Result<(), ParseError> {
        for i in 0..num_layers {
            let layer_id: u8 = r.u("vps_layer_id", 6)?;
            if let Some(&prev) = self.layer_id.last() {
                if layer_id <= prev {
                    return Err(ParseError::InvalidValue(format!(
                        "vps_layer_id[{}] {} is not above vps_layer_id[{}] {}",
                        i,
                        layer_id,
                        i - 1,
                        prev
                    )));
                }
            }

            let mut independent = true;
            let mut max_tid_ref_present = false;
            let mut direct_refs = vec![false; i];
            let mut max_tid_il_ref_pics_plus1 = vec![self.max_sublayers_minus1 + 1; i];

            if i > 0 && !self.all_independent_layers_flag {
                independent = r.flag("vps_independent_layer_flag")?;
                if !independent {
                    max_tid_ref_present = r.flag("vps_max_tid_ref_present_flag")?;
                    for j in 0..i {
                        direct_refs[j] = r.flag("vps_direct_ref_layer_flag")?;
                        if max_tid_ref_present && direct_refs[j] {
                            max_tid_il_ref_pics_plus1[j] = r.u("vps_max_tid_il_ref_pics_plus1", 3)?;
                        }
                    }

                    if !direct_refs.contains(&true) {
                        return Err(ParseError::InvalidValue(format!(
                            "dependent layer {} has no reference layer",
                            i
                        )));
                    }
                }
            }

            self.layer_id.push(layer_id);
            self.independent_layer_flag.push(independent);
            self.max_tid_ref_present_flag.push(max_tid_ref_present);
            self.direct_ref_layer_flag.push(direct_refs);
            self.max_tid_il_ref_pics_plus1.push(max_tid_il_ref_pics_plus1);
        }

        Ok(())
    }

    fn parse_dpb_and_hrd(&mut self, r: &mut BitReader) -> Result<(), ParseError> {
        let num_multi_layer_olss = self.derived.num_multi_layer_olss;
        let max_sublayers_minus1 = self.max_sublayers_minus1;

        self.num_dpb_params_minus1 = r.ue("vps_num_dpb_params_minus1")?;
        if self.num_dpb_params_minus1 as usize >= num_multi_layer_olss.max(1) {
            return Err(ParseError::UnsupportedDerivedRange(format!(
                "vps_num_dpb_params_minus1 {} with NumMultiLayerOlss {}",
                self.num_dpb_params_minus1, num_multi_layer_olss
            )));
        }

        let num_dpb_params = self.num_dpb_params_minus1 as usize + 1;
        self.derived.vps_num_dpb_params = num_dpb_params;

        if max_sublayers_minus1 > 0 {
            self.sublayer_dpb_params_present_flag = r.flag("vps_sublayer_dpb_params_present_flag")?;
        }

        for _ in 0..num_dpb_params {
            let max_tid = self.max_tid_or_default(r, "vps_dpb_max_tid")?;
            self.dpb_max_tid.push(max_tid);
            self.dpb_parameters.push(DpbParameters::parse(
                r,
                max_tid,
                self.sublayer_dpb_params_present_flag,
            )?);
        }

        for i in 0..num_multi_layer_olss {
            self.ols_dpb_pic_width.push(r.ue("vps_ols_dpb_pic_width")?);
            self.ols_dpb_pic_height.push(r.ue("vps_ols_dpb_pic_height")?);
            self.ols_dpb_chroma_format.push(r.u("vps_ols_dpb_chroma_format", 2)?);
            self.ols_dpb_bitdepth_minus8.push(r.ue_max("vps_ols_dpb_bitdepth_minus8", 8)?);

            let idx = if num_dpb_params > 1 && num_dpb_params != num_multi_layer_olss {
                r.ue_max("vps_ols_dpb_params_idx", self.num_dpb_params_minus1)?
            } else if num_dpb_params == 1 {
                0
            } else {
                i as u32
            };
            self.ols_dpb_params_idx.push(idx);
        }

        self.timing_hrd_params_present_flag = r.flag("vps_timing_hrd_params_present_flag")?;
        if !self.timing_hrd_params_present_flag {
            return Ok(());
        }

        self.general_timing_hrd_parameters = GeneralTimingHrdParameters::parse(r)?;
        if max_sublayers_minus1 > 0 {
            self.sublayer_cpb_params_present_flag = r.flag("vps_sublayer_cpb_params_present_flag")?;
        }

        self.num_ols_timing_hrd_params_minus1 = r.ue("vps_num_ols_timing_hrd_params_minus1")?;
        if self.num_ols_timing_hrd_params_minus1 as usize >= num_multi_layer_olss.max(1) {
            return Err(ParseError::UnsupportedDerivedRange(format!(
                "vps_num_ols_timing_hrd_params_minus1 {} with NumMultiLayerOlss {}",
                self.num_ols_timing_hrd_params_minus1, num_multi_layer_olss
            )));
        }

        for _ in 0..=self.num_ols_timing_hrd_params_minus1 {
            let max_tid = self.max_tid_or_default(r, "vps_hrd_max_tid")?;
            let first_sub_layer = if self.sublayer_cpb_params_present_flag {
                0
            } else {
                max_tid
            };

            self.hrd_max_tid.push(max_tid);
            self.ols_timing_hrd_parameters.push(OlsTimingHrdParameters::parse(
                r,
                &self.general_timing_hrd_parameters,
                first_sub_layer,
                max_tid,
            )?);
        }

        let num_hrd_params = self.num_ols_timing_hrd_params_minus1 as usize + 1;
        for i in 0..num_multi_layer_olss {
            let idx = if num_hrd_params > 1 && num_hrd_params != num_multi_layer_olss {
                r.ue_max(
                    "vps_ols_timing_hrd_idx",
                    self.num_ols_timing_hrd_params_minus1,
                )?
            } else if num_hrd_params == 1 {
                0
            } else {
                i as u32
            };
            self.ols_timing_hrd_idx.push(idx);
        }

        Ok(())
    }

    /// Reads a `vps_dpb_max_tid` or `vps_hrd_max_tid` value. When absent the
    /// value is vps_max_sublayers_minus1.
    fn max_tid_or_default(&self, r: &mut BitReader, name: &'static str) -> Result<u8, ParseError> {
        if self.default_ptl_dpb_hrd_max_tid_flag {
            return Ok(self.max_sublayers_minus1);
        }

        let max_tid: u8 = r.u(name, 3)?;
        if max_tid > self.max_sublayers_minus1 {
            return Err(ParseError::InvalidValue(format!(
                "{} {} above vps_max_sublayers_minus1 {}",
                name, max_tid, self.max_sublayers_minus1
            )));
        }

        Ok(max_tid)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use crate::bitstream_utils::BitWriter;

    /// Writes a profile_tier_level(1, 0) without constraint info and sub
    /// profiles, starting byte aligned.
    fn write_ptl<W: std::io::Write>(w: &mut BitWriter<W>, level_idc: u32) {
        w.write_f(7, 1u32).unwrap(); // general_profile_idc
        w.write_f(1, false).unwrap(); // general_tier_flag
        w.write_f(8, level_idc).unwrap(); // general_level_idc
        w.write_f(1, true).unwrap(); // ptl_frame_only_constraint_flag
        w.write_f(1, true).unwrap(); // ptl_multilayer_enabled_flag
        w.write_f(1, false).unwrap(); // gci_present_flag
        w.align().unwrap();
        w.write_f(8, 0u32).unwrap(); // ptl_num_sub_profiles
    }

    /// A VPS RBSP for three layers where layer 1 is predicted from layer 0
    /// and layer 2 is independent. OLS 1 outputs layer 1, OLS 2 outputs
    /// layer 2.
    pub(crate) fn three_layer_vps_rbsp(vps_id: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut w = BitWriter::new(&mut buf);
            w.write_f(4, vps_id).unwrap(); // vps_video_parameter_set_id
            w.write_f(6, 2u32).unwrap(); // vps_max_layers_minus1
            w.write_f(3, 0u32).unwrap(); // vps_max_sublayers_minus1
            w.write_f(1, false).unwrap(); // vps_all_independent_layers_flag

            w.write_f(6, 0u32).unwrap(); // vps_layer_id[0]

            w.write_f(6, 1u32).unwrap(); // vps_layer_id[1]
            w.write_f(1, false).unwrap(); // vps_independent_layer_flag[1]
            w.write_f(1, false).unwrap(); // vps_max_tid_ref_present_flag[1]
            w.write_f(1, true).unwrap(); // vps_direct_ref_layer_flag[1][0]

            w.write_f(6, 2u32).unwrap(); // vps_layer_id[2]
            w.write_f(1, true).unwrap(); // vps_independent_layer_flag[2]

            w.write_f(2, 2u32).unwrap(); // vps_ols_mode_idc
            w.write_f(8, 1u32).unwrap(); // vps_num_output_layer_sets_minus2
            for flag in [false, true, false, false, false, true] {
                w.write_f(1, flag).unwrap(); // vps_ols_output_layer_flag
            }
            w.write_f(8, 0u32).unwrap(); // vps_num_ptls_minus1
            w.align().unwrap();
            write_ptl(&mut w, 51);

            w.write_ue(0u32).unwrap(); // vps_num_dpb_params_minus1
            w.write_ue(5u32).unwrap(); // dpb_max_dec_pic_buffering_minus1
            w.write_ue(2u32).unwrap(); // dpb_max_num_reorder_pics
            w.write_ue(0u32).unwrap(); // dpb_max_latency_increase_plus1

            w.write_ue(1920u32).unwrap(); // vps_ols_dpb_pic_width
            w.write_ue(1080u32).unwrap(); // vps_ols_dpb_pic_height
            w.write_f(2, 1u32).unwrap(); // vps_ols_dpb_chroma_format
            w.write_ue(2u32).unwrap(); // vps_ols_dpb_bitdepth_minus8

            w.write_f(1, false).unwrap(); // vps_timing_hrd_params_present_flag
            w.write_f(1, false).unwrap(); // vps_extension_flag
            w.write_trailing_bits().unwrap();
        }

        buf
    }

    #[test]
    fn three_layer_output_layer_sets() {
        let rbsp = three_layer_vps_rbsp(1);
        let mut r = BitReader::new(&rbsp);
        let vps = Vps::parse(&mut r).unwrap();

        assert_eq!(vps.id(), 1);
        assert_eq!(vps.layer_id, vec![0, 1, 2]);
        assert_eq!(vps.ols_mode_idc, 2);
        assert!(!vps.each_layer_is_an_ols_flag);
        assert_eq!(vps.total_num_olss(), 3);
        assert_eq!(vps.num_multi_layer_olss(), 1);
        assert_eq!(vps.ols_ptl_idx, vec![0, 0, 0]);
        assert_eq!(vps.profile_tier_level[0].general_level_idc, 51);

        let derived = &vps.derived;
        assert_eq!(derived.num_layers_in_ols, vec![1, 2, 1]);
        assert_eq!(derived.layer_id_in_ols[1], vec![0, 1]);
        assert_eq!(derived.layer_id_in_ols[2], vec![2]);
        assert_eq!(derived.output_layer_id_in_ols[1], vec![1]);
        assert_eq!(derived.multi_layer_ols_idx, vec![None, Some(0), None]);
        assert_eq!(derived.reference_layer_idx[1], vec![0]);
        assert_eq!(derived.num_sub_layers_in_layer_in_ols[1], vec![1, 1, 0]);
        assert_eq!(derived.vps_num_dpb_params, 1);

        assert_eq!(vps.dpb_max_tid, vec![0]);
        assert_eq!(vps.dpb_parameters[0].max_dec_pic_buffering_minus1[0], 5);
        assert_eq!(vps.ols_dpb_pic_width, vec![1920]);
        assert_eq!(vps.ols_dpb_pic_height, vec![1080]);
        assert_eq!(vps.ols_dpb_bitdepth_minus8, vec![2]);
        assert_eq!(vps.ols_dpb_params_idx, vec![0]);
        assert!(!vps.extension_flag);
    }

    #[test]
    fn dpb_max_tid_is_inferred() {
        // Two independent layers in one OLS, three sublayers.
        let mut buf = Vec::new();
        {
            let mut w = BitWriter::new(&mut buf);
            w.write_f(4, 3u32).unwrap();
            w.write_f(6, 1u32).unwrap();
            w.write_f(3, 2u32).unwrap();
            w.write_f(1, true).unwrap(); // vps_default_ptl_dpb_hrd_max_tid_flag
            w.write_f(1, true).unwrap(); // vps_all_independent_layers_flag
            w.write_f(6, 0u32).unwrap();
            w.write_f(6, 1u32).unwrap();
            w.write_f(1, false).unwrap(); // vps_each_layer_is_an_ols_flag
            w.write_f(8, 0u32).unwrap(); // vps_num_output_layer_sets_minus2
            w.write_f(1, true).unwrap(); // vps_ols_output_layer_flag[1][0]
            w.write_f(1, true).unwrap(); // vps_ols_output_layer_flag[1][1]
            w.write_f(8, 0u32).unwrap(); // vps_num_ptls_minus1
            w.align().unwrap();
            // profile_tier_level(1, 2)
            w.write_f(7, 1u32).unwrap();
            w.write_f(1, false).unwrap();
            w.write_f(8, 80u32).unwrap();
            w.write_f(1, true).unwrap();
            w.write_f(1, true).unwrap();
            w.write_f(1, false).unwrap(); // gci_present_flag
            w.align().unwrap();
            w.write_f(2, 0u32).unwrap(); // ptl_sublayer_level_present_flag[1], [0]
            w.align().unwrap();
            w.write_f(8, 0u32).unwrap(); // ptl_num_sub_profiles

            w.write_ue(0u32).unwrap(); // vps_num_dpb_params_minus1
            w.write_f(1, false).unwrap(); // vps_sublayer_dpb_params_present_flag
            w.write_ue(7u32).unwrap(); // dpb_max_dec_pic_buffering_minus1[2]
            w.write_ue(3u32).unwrap(); // dpb_max_num_reorder_pics[2]
            w.write_ue(0u32).unwrap(); // dpb_max_latency_increase_plus1[2]
            w.write_ue(640u32).unwrap();
            w.write_ue(480u32).unwrap();
            w.write_f(2, 1u32).unwrap();
            w.write_ue(0u32).unwrap();
            w.write_f(1, false).unwrap(); // vps_timing_hrd_params_present_flag
            w.write_f(1, false).unwrap(); // vps_extension_flag
            w.write_trailing_bits().unwrap();
        }

        let mut r = BitReader::new(&buf);
        let vps = Vps::parse(&mut r).unwrap();

        assert_eq!(vps.ols_mode_idc, 2);
        assert_eq!(vps.total_num_olss(), 2);
        assert_eq!(vps.ptl_max_tid, vec![2]);
        assert_eq!(vps.dpb_max_tid, vec![2]);
        assert_eq!(vps.dpb_parameters[0].max_dec_pic_buffering_minus1[..3], [7, 7, 7]);
        assert_eq!(vps.derived.num_sub_layers_in_layer_in_ols[1], vec![3, 3]);
        assert_eq!(vps.derived.layer_used_as_output_layer, vec![true, true]);
    }

    #[test]
    fn single_layer_vps() {
        let mut buf = Vec::new();
        {
            let mut w = BitWriter::new(&mut buf);
            w.write_f(4, 1u32).unwrap();
            w.write_f(6, 0u32).unwrap();
            w.write_f(3, 0u32).unwrap();
            w.write_f(6, 0u32).unwrap(); // vps_layer_id[0]
            w.align().unwrap();
            write_ptl(&mut w, 35);
            w.write_f(1, false).unwrap(); // vps_extension_flag
            w.write_trailing_bits().unwrap();
        }

        let mut r = BitReader::new(&buf).with_trace(true);
        let vps = Vps::parse(&mut r).unwrap();
        assert!(vps.each_layer_is_an_ols_flag);
        assert_eq!(vps.total_num_olss(), 1);
        assert_eq!(vps.derived.vps_num_dpb_params, 0);
        assert!(vps.dpb_parameters.is_empty());

        let trace = r.take_trace().unwrap();
        assert_eq!(trace.value_of("general_level_idc"), Some(35));
        assert_eq!(trace.value_of("vps_extension_flag"), Some(0));
    }

    #[test]
    fn reserved_vps_id() {
        let rbsp = three_layer_vps_rbsp(0);
        let mut r = BitReader::new(&rbsp);
        assert!(matches!(Vps::parse(&mut r), Err(ParseError::InvalidValue(_))));
    }

    #[test]
    fn truncated_vps() {
        let rbsp = three_layer_vps_rbsp(1);
        let mut r = BitReader::new(&rbsp[..6]);
        assert_eq!(Vps::parse(&mut r), Err(ParseError::BitstreamTruncated));
    }

    #[test]
    fn too_many_ptls() {
        let mut buf = Vec::new();
        {
            let mut w = BitWriter::new(&mut buf);
            w.write_f(4, 1u32).unwrap();
            w.write_f(6, 1u32).unwrap(); // vps_max_layers_minus1
            w.write_f(3, 0u32).unwrap();
            w.write_f(1, true).unwrap(); // vps_all_independent_layers_flag
            w.write_f(6, 0u32).unwrap();
            w.write_f(6, 1u32).unwrap();
            w.write_f(1, true).unwrap(); // vps_each_layer_is_an_ols_flag
            w.write_f(8, 2u32).unwrap(); // vps_num_ptls_minus1, TotalNumOlss is 2
            w.write_trailing_bits().unwrap();
        }

        let mut r = BitReader::new(&buf);
        assert!(matches!(
            Vps::parse(&mut r),
            Err(ParseError::UnsupportedDerivedRange(_))
        ));
    }
}
