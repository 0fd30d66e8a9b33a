// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use log::debug;

use crate::codec::h266::parser::NaluHeader;
use crate::codec::h266::parser::NaluType;
use crate::codec::h266::parser::Nalu;
use crate::codec::h266::parser::Parser;
use crate::codec::h266::parser::PicHeader;
use crate::codec::pic_order_cnt_msb;
use crate::codec::pic_order_cnt_val;
use crate::codec::poc_in_range;
use crate::codec::NalEvent;
use crate::codec::NalHandler;
use crate::codec::ParameterSetKind;
use crate::codec::ParameterSetRef;
use crate::codec::ParseError;
use crate::codec::PictureInfo;
use crate::stream_info::StreamInfo;
use crate::trace::SyntaxTrace;

/// Data associated with a H.266 picture, taken from its picture header and
/// the NAL unit header of its first slice.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PictureData {
    pub nalu_type: NaluType,
    pub layer_id: u8,
    /// NoOutputBeforeRecoveryFlag. Set for CLVS start pictures.
    pub no_output_before_recovery_flag: bool,
    pub valid_for_prev_tid0_pic: bool,
    pub pic_order_cnt_lsb: i32,
    pub pic_order_cnt_msb: i32,
    pub pic_order_cnt_val: i32,
}

impl PictureData {
    /// Runs the picture order count process of 8.3.1.
    pub fn new(
        header: &NaluHeader,
        ph: &PicHeader,
        first_picture_in_layer: bool,
        prev_tid0_pic: Option<&PictureData>,
        max_pic_order_cnt_lsb: i32,
    ) -> Result<Self, ParseError> {
        let nalu_type = header.type_();

        // HandleCraAsClvsStartFlag is only set through external means, which
        // are not provided.
        let no_output_before_recovery_flag = nalu_type.is_idr()
            || ((nalu_type.is_irap() || nalu_type.is_gdr()) && first_picture_in_layer);

        let pic_order_cnt_lsb = ph.pic_order_cnt_lsb as i32;
        let pic_order_cnt_msb = if ph.poc_msb_cycle_present_flag {
            // Equation (196)
            poc_in_range(
                "PicOrderCntMsb",
                i64::from(ph.poc_msb_cycle_val) * i64::from(max_pic_order_cnt_lsb),
            )?
        } else if no_output_before_recovery_flag {
            0
        } else {
            match prev_tid0_pic {
                Some(prev) => pic_order_cnt_msb(
                    pic_order_cnt_lsb,
                    prev.pic_order_cnt_lsb,
                    prev.pic_order_cnt_msb,
                    max_pic_order_cnt_lsb,
                )?,
                None => 0,
            }
        };

        // prevTid0Pic is the previous picture of the same layer with
        // TemporalId 0 that is not a RASL or RADL picture.
        let valid_for_prev_tid0_pic =
            header.temporal_id() == 0 && !nalu_type.is_rasl() && !nalu_type.is_radl();

        Ok(Self {
            nalu_type,
            layer_id: header.layer_id(),
            no_output_before_recovery_flag,
            valid_for_prev_tid0_pic,
            pic_order_cnt_lsb,
            pic_order_cnt_msb,
            pic_order_cnt_val: pic_order_cnt_val(pic_order_cnt_msb, pic_order_cnt_lsb)?,
        })
    }
}

/// Turns H.266 NAL units into pictures.
///
/// A picture starts either with a picture header NAL unit, in which case the
/// picture is reported at its first slice, or with a slice that carries its
/// own picture header.
#[derive(Debug, Default)]
pub struct PictureParser {
    parser: Parser,
    /// Picture header waiting for the first slice of its picture.
    pending_picture_header: Option<PicHeader>,
    /// prevTid0Pic of each layer.
    prev_tid0_pic: BTreeMap<u8, PictureData>,
    /// Layers that had a picture since the start or the last end of sequence.
    active_layers: BTreeSet<u8>,
    stream_info: Option<StreamInfo>,
}

impl PictureParser {
    pub fn parser(&self) -> &Parser {
        &self.parser
    }

    fn start_picture(
        &mut self,
        header: &NaluHeader,
        ph: &PicHeader,
    ) -> Result<PictureInfo, ParseError> {
        let (pps, sps) = self.parser.pps_and_sps(ph.pic_parameter_set_id)?;

        let mut references = Vec::with_capacity(3);
        if sps.video_parameter_set_id != 0 {
            references.push(ParameterSetRef::new(
                ParameterSetKind::Vps,
                u32::from(sps.video_parameter_set_id),
            ));
        }
        references.push(ParameterSetRef::new(
            ParameterSetKind::Sps,
            u32::from(sps.seq_parameter_set_id),
        ));
        references.push(ParameterSetRef::new(
            ParameterSetKind::Pps,
            u32::from(pps.pic_parameter_set_id),
        ));

        let layer_id = header.layer_id();
        let pic = PictureData::new(
            header,
            ph,
            !self.active_layers.contains(&layer_id),
            self.prev_tid0_pic.get(&layer_id),
            sps.max_pic_order_cnt_lsb() as i32,
        )?;

        debug!(
            "{:?} picture in layer {} with POC {}",
            pic.nalu_type, layer_id, pic.pic_order_cnt_val
        );

        self.active_layers.insert(layer_id);

        if self.stream_info.is_none() {
            let vps = self.parser.get_vps(sps.video_parameter_set_id);
            self.stream_info = Some(sps.stream_info(vps));
        }

        let info = PictureInfo {
            poc: pic.pic_order_cnt_val,
            is_random_access_point: pic.nalu_type.is_irap(),
            poc_reset: pic.no_output_before_recovery_flag,
            references,
        };

        if pic.valid_for_prev_tid0_pic {
            self.prev_tid0_pic.insert(layer_id, pic);
        }

        Ok(info)
    }
}

impl NalHandler for PictureParser {
    type Header = NaluHeader;

    fn handle(&mut self, nalu: &Nalu) -> Result<NalEvent, ParseError> {
        let header = nalu.header();

        let event = match header.type_() {
            NaluType::VpsNut => {
                let vps = self.parser.parse_vps(nalu)?;
                NalEvent::ParameterSet(ParameterSetRef::new(
                    ParameterSetKind::Vps,
                    u32::from(vps.video_parameter_set_id),
                ))
            }
            NaluType::SpsNut => {
                let sps = self.parser.parse_sps(nalu)?;
                NalEvent::ParameterSet(ParameterSetRef::new(
                    ParameterSetKind::Sps,
                    u32::from(sps.seq_parameter_set_id),
                ))
            }
            NaluType::PpsNut => {
                let pps = self.parser.parse_pps(nalu)?;
                NalEvent::ParameterSet(ParameterSetRef::new(
                    ParameterSetKind::Pps,
                    u32::from(pps.pic_parameter_set_id),
                ))
            }
            NaluType::PrefixApsNut | NaluType::SuffixApsNut => {
                let aps = self.parser.parse_aps(nalu)?;
                NalEvent::ParameterSet(ParameterSetRef::new(ParameterSetKind::Aps, aps.key()))
            }
            NaluType::PhNut => {
                let ph = self.parser.parse_picture_header(nalu)?;
                if self.pending_picture_header.replace(ph).is_some() {
                    debug!("picture header without slices dropped");
                }
                NalEvent::PicturePrefix
            }
            NaluType::EosNut => {
                self.active_layers.remove(&header.layer_id());
                self.prev_tid0_pic.remove(&header.layer_id());
                NalEvent::EndOfSequence
            }
            NaluType::EobNut => {
                self.active_layers.clear();
                self.prev_tid0_pic.clear();
                NalEvent::EndOfSequence
            }
            type_ if type_.is_slice() => {
                let prefix = self.parser.parse_slice_header_prefix(nalu)?;
                let ph = match prefix.picture_header {
                    Some(ph) => {
                        self.pending_picture_header = None;
                        ph
                    }
                    None => match self.pending_picture_header.take() {
                        Some(ph) => ph,
                        None => return Ok(NalEvent::SliceContinuation),
                    },
                };

                NalEvent::PictureStart(self.start_picture(header, &ph)?)
            }
            _ => NalEvent::Other,
        };

        Ok(event)
    }

    fn set_trace(&mut self, enabled: bool) {
        self.parser.set_trace(enabled);
    }

    fn take_trace(&mut self) -> Option<SyntaxTrace> {
        self.parser.take_trace()
    }

    fn stream_info(&self) -> Option<StreamInfo> {
        self.stream_info.clone()
    }
}
