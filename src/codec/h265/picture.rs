// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use log::debug;

use crate::codec::h265::parser::NaluHeader;
use crate::codec::h265::parser::NaluType;
use crate::codec::h265::parser::Nalu;
use crate::codec::h265::parser::Parser;
use crate::codec::h265::parser::SliceHeaderPrefix;
use crate::codec::pic_order_cnt_msb;
use crate::codec::pic_order_cnt_val;
use crate::codec::NalEvent;
use crate::codec::NalHandler;
use crate::codec::ParameterSetKind;
use crate::codec::ParameterSetRef;
use crate::codec::ParseError;
use crate::codec::PictureInfo;
use crate::stream_info::StreamInfo;
use crate::trace::SyntaxTrace;

/// Data associated with an h.265 picture, taken from its first slice segment.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct PictureData {
    // Fields extracted from the slice header. These are the CamelCase
    // variables, unless noted otherwise.
    pub nalu_type: NaluType,
    pub no_rasl_output_flag: bool,
    pub pic_output_flag: bool,
    pub valid_for_prev_tid0_pic: bool,
    pub slice_pic_order_cnt_lsb: i32,
    pub pic_order_cnt_msb: i32,
    pub pic_order_cnt_val: i32,
}

impl PictureData {
    /// Instantiates a new `PictureData` from the header of the first slice
    /// segment of a picture.
    ///
    /// This runs the picture order count process of clause 8.3.1.
    pub fn new_from_slice(
        nalu_header: &NaluHeader,
        hdr: &SliceHeaderPrefix,
        first_picture_in_bitstream: bool,
        first_picture_after_eos: bool,
        prev_tid0_pic: Option<&PictureData>,
        max_pic_order_cnt_lsb: i32,
    ) -> Result<Self, ParseError> {
        let nalu_type = nalu_header.type_();

        // We assume HandleCraAsBlaFlag == 0, as it is only set through
        // external means, which we do not provide.

        let slice_pic_order_cnt_lsb = hdr.pic_order_cnt_lsb as i32;

        // The value of NoRaslOutputFlag is equal to 1 for each IDR access
        // unit, each BLA access unit, and each CRA access unit that is the
        // first access unit in the bitstream in decoding order, is the first
        // access unit that follows an end of sequence NAL unit in decoding
        // order, or has HandleCraAsBlaFlag equal to 1.
        let no_rasl_output_flag = nalu_type.is_idr()
            || nalu_type.is_bla()
            || (nalu_type.is_cra() && first_picture_in_bitstream)
            || first_picture_after_eos;

        let pic_output_flag = if nalu_type.is_rasl() && no_rasl_output_flag {
            false
        } else {
            hdr.pic_output_flag
        };

        // Equation (8-1)
        let pic_order_cnt_msb = match prev_tid0_pic {
            Some(prev) if !(nalu_type.is_irap() && no_rasl_output_flag) => pic_order_cnt_msb(
                slice_pic_order_cnt_lsb,
                prev.slice_pic_order_cnt_lsb,
                prev.pic_order_cnt_msb,
                max_pic_order_cnt_lsb,
            )?,
            _ => 0,
        };

        // Let prevTid0Pic be the previous picture in decoding order that has
        // TemporalId equal to 0 and that is not a RASL, RADL or SLNR picture.
        let valid_for_prev_tid0_pic = nalu_header.temporal_id() == 0
            && !nalu_type.is_radl()
            && !nalu_type.is_rasl()
            && !nalu_type.is_slnr();

        Ok(Self {
            nalu_type,
            no_rasl_output_flag,
            pic_output_flag,
            valid_for_prev_tid0_pic,
            slice_pic_order_cnt_lsb,
            pic_order_cnt_msb,
            // Equation (8-2)
            pic_order_cnt_val: pic_order_cnt_val(pic_order_cnt_msb, slice_pic_order_cnt_lsb)?,
        })
    }
}

/// Turns h.265 NAL units into pictures.
///
/// Only the base layer is indexed: NAL units with a nuh_layer_id greater than
/// 0 are reported as [`NalEvent::Other`].
#[derive(Debug)]
pub struct PictureParser {
    parser: Parser,
    prev_tid0_pic: Option<PictureData>,
    first_picture_in_bitstream: bool,
    first_picture_after_eos: bool,
    stream_info: Option<StreamInfo>,
}

impl Default for PictureParser {
    fn default() -> Self {
        Self {
            parser: Default::default(),
            prev_tid0_pic: None,
            first_picture_in_bitstream: true,
            first_picture_after_eos: false,
            stream_info: None,
        }
    }
}

impl PictureParser {
    pub fn parser(&self) -> &Parser {
        &self.parser
    }

    fn start_picture(
        &mut self,
        header: &NaluHeader,
        hdr: &SliceHeaderPrefix,
    ) -> Result<PictureInfo, ParseError> {
        let (pps, sps) = self.parser.pps_and_sps(hdr.pic_parameter_set_id)?;

        let references = vec![
            ParameterSetRef::new(
                ParameterSetKind::Vps,
                u32::from(sps.video_parameter_set_id),
            ),
            ParameterSetRef::new(ParameterSetKind::Sps, u32::from(sps.seq_parameter_set_id)),
            ParameterSetRef::new(ParameterSetKind::Pps, u32::from(pps.pic_parameter_set_id)),
        ];

        let pic = PictureData::new_from_slice(
            header,
            hdr,
            self.first_picture_in_bitstream,
            self.first_picture_after_eos,
            self.prev_tid0_pic.as_ref(),
            sps.max_pic_order_cnt_lsb() as i32,
        )?;

        debug!(
            "{:?} picture with POC {}",
            pic.nalu_type, pic.pic_order_cnt_val
        );

        if self.stream_info.is_none() {
            let vps = self.parser.get_vps(sps.video_parameter_set_id);
            self.stream_info = Some(sps.stream_info(vps));
        }

        self.first_picture_in_bitstream = false;
        self.first_picture_after_eos = false;

        let info = PictureInfo {
            poc: pic.pic_order_cnt_val,
            is_random_access_point: pic.nalu_type.is_irap(),
            poc_reset: pic.nalu_type.is_irap() && pic.no_rasl_output_flag,
            references,
        };

        if pic.valid_for_prev_tid0_pic {
            self.prev_tid0_pic = Some(pic);
        }

        Ok(info)
    }
}

impl NalHandler for PictureParser {
    type Header = NaluHeader;

    fn handle(&mut self, nalu: &Nalu) -> Result<NalEvent, ParseError> {
        let header = nalu.header();
        if header.layer_id() > 0 {
            return Ok(NalEvent::Other);
        }

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
            NaluType::EosNut | NaluType::EobNut => {
                self.first_picture_after_eos = true;
                self.prev_tid0_pic = None;
                NalEvent::EndOfSequence
            }
            type_ if type_.is_slice() => {
                let hdr = self.parser.parse_slice_header_prefix(nalu)?;
                if hdr.first_slice_segment_in_pic_flag {
                    NalEvent::PictureStart(self.start_picture(header, &hdr)?)
                } else {
                    NalEvent::SliceContinuation
                }
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
