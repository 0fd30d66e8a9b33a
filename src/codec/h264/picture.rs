// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use log::debug;

use crate::codec::h264::parser::Nalu;
use crate::codec::h264::parser::NaluHeader;
use crate::codec::h264::parser::NaluType;
use crate::codec::h264::parser::Parser;
use crate::codec::h264::parser::SliceHeaderPrefix;
use crate::codec::h264::parser::Sps;
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

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Field {
    #[default]
    Frame,
    Top,
    Bottom,
}

impl Field {
    fn of(hdr: &SliceHeaderPrefix) -> Self {
        match (hdr.field_pic_flag, hdr.bottom_field_flag) {
            (false, _) => Field::Frame,
            (true, false) => Field::Top,
            (true, true) => Field::Bottom,
        }
    }

    fn is_field(&self) -> bool {
        !matches!(self, Field::Frame)
    }
}

/// The values of the previous reference picture used by POC type 0.
#[derive(Debug, Default)]
struct PrevReferencePicInfo {
    pic_order_cnt_msb: i32,
    pic_order_cnt_lsb: i32,
}

/// The values of the previous picture used by POC types 1 and 2.
#[derive(Debug, Default)]
struct PrevPicInfo {
    frame_num: i32,
    frame_num_offset: i32,
}

/// Data associated with an h.264 picture or field, taken from its first slice.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PictureData {
    pub nal_ref_idc: u8,
    pub is_idr: bool,
    pub field: Field,
    pub frame_num: i32,
    pub frame_num_offset: i32,
    pub pic_order_cnt_msb: i32,
    pub pic_order_cnt_lsb: i32,
    pub top_field_order_cnt: i32,
    pub bottom_field_order_cnt: i32,
    /// PicOrderCnt() of the frame or field, see 8-1.
    pub pic_order_cnt: i32,
}

impl PictureData {
    /// Runs the decoding process for picture order count of clause 8.2.1.
    ///
    /// Memory management control operation 5 is not taken into account, as
    /// the slice header is not parsed that far.
    fn new(
        header: &NaluHeader,
        hdr: &SliceHeaderPrefix,
        sps: &Sps,
        prev_pic: &PrevPicInfo,
        prev_ref_pic: &PrevReferencePicInfo,
    ) -> Result<Self, ParseError> {
        let mut pic = PictureData {
            nal_ref_idc: header.ref_idc,
            is_idr: header.idr_pic_flag,
            field: Field::of(hdr),
            frame_num: i32::from(hdr.frame_num),
            pic_order_cnt_lsb: i32::from(hdr.pic_order_cnt_lsb),
            ..Default::default()
        };

        match sps.pic_order_cnt_type {
            // H.264 8.2.1.1
            0 => {
                let (prev_pic_order_cnt_msb, prev_pic_order_cnt_lsb) = if pic.is_idr {
                    (0, 0)
                } else {
                    (prev_ref_pic.pic_order_cnt_msb, prev_ref_pic.pic_order_cnt_lsb)
                };

                pic.pic_order_cnt_msb = pic_order_cnt_msb(
                    pic.pic_order_cnt_lsb,
                    prev_pic_order_cnt_lsb,
                    prev_pic_order_cnt_msb,
                    sps.max_pic_order_cnt_lsb() as i32,
                )?;

                if pic.field != Field::Bottom {
                    pic.top_field_order_cnt =
                        pic_order_cnt_val(pic.pic_order_cnt_msb, pic.pic_order_cnt_lsb)?;
                }

                match pic.field {
                    Field::Frame => {
                        pic.bottom_field_order_cnt = pic
                            .top_field_order_cnt
                            .wrapping_add(hdr.delta_pic_order_cnt_bottom)
                    }
                    Field::Bottom => {
                        pic.bottom_field_order_cnt =
                            pic_order_cnt_val(pic.pic_order_cnt_msb, pic.pic_order_cnt_lsb)?
                    }
                    Field::Top => (),
                }
            }

            // H.264 8.2.1.2
            1 => {
                pic.frame_num_offset = Self::frame_num_offset(&pic, sps, prev_pic);

                let num_ref_frames_in_pic_order_cnt_cycle = sps.offset_for_ref_frame.len() as i32;
                let mut abs_frame_num = if num_ref_frames_in_pic_order_cnt_cycle != 0 {
                    pic.frame_num_offset.wrapping_add(pic.frame_num)
                } else {
                    0
                };

                if pic.nal_ref_idc == 0 && abs_frame_num > 0 {
                    abs_frame_num -= 1;
                }

                let mut expected_pic_order_cnt = 0i32;

                if abs_frame_num > 0 {
                    let pic_order_cnt_cycle_cnt =
                        (abs_frame_num - 1) / num_ref_frames_in_pic_order_cnt_cycle;
                    let frame_num_in_pic_order_cnt_cycle =
                        (abs_frame_num - 1) % num_ref_frames_in_pic_order_cnt_cycle;

                    expected_pic_order_cnt = pic_order_cnt_cycle_cnt
                        .wrapping_mul(sps.expected_delta_per_pic_order_cnt_cycle);

                    for offset in
                        &sps.offset_for_ref_frame[..=frame_num_in_pic_order_cnt_cycle as usize]
                    {
                        expected_pic_order_cnt = expected_pic_order_cnt.wrapping_add(*offset);
                    }
                }

                if pic.nal_ref_idc == 0 {
                    expected_pic_order_cnt =
                        expected_pic_order_cnt.wrapping_add(sps.offset_for_non_ref_pic);
                }

                match pic.field {
                    Field::Frame => {
                        pic.top_field_order_cnt =
                            expected_pic_order_cnt.wrapping_add(hdr.delta_pic_order_cnt[0]);
                        pic.bottom_field_order_cnt = pic
                            .top_field_order_cnt
                            .wrapping_add(sps.offset_for_top_to_bottom_field)
                            .wrapping_add(hdr.delta_pic_order_cnt[1]);
                    }
                    Field::Top => {
                        pic.top_field_order_cnt =
                            expected_pic_order_cnt.wrapping_add(hdr.delta_pic_order_cnt[0]);
                    }
                    Field::Bottom => {
                        pic.bottom_field_order_cnt = expected_pic_order_cnt
                            .wrapping_add(sps.offset_for_top_to_bottom_field)
                            .wrapping_add(hdr.delta_pic_order_cnt[0]);
                    }
                }
            }

            // H.264 8.2.1.3
            _ => {
                pic.frame_num_offset = Self::frame_num_offset(&pic, sps, prev_pic);

                let temp_pic_order_cnt = if pic.is_idr {
                    0
                } else if pic.nal_ref_idc == 0 {
                    pic.frame_num_offset
                        .wrapping_add(pic.frame_num)
                        .wrapping_mul(2)
                        .wrapping_sub(1)
                } else {
                    pic.frame_num_offset
                        .wrapping_add(pic.frame_num)
                        .wrapping_mul(2)
                };

                match pic.field {
                    Field::Frame => {
                        pic.top_field_order_cnt = temp_pic_order_cnt;
                        pic.bottom_field_order_cnt = temp_pic_order_cnt;
                    }
                    Field::Top => pic.top_field_order_cnt = temp_pic_order_cnt,
                    Field::Bottom => pic.bottom_field_order_cnt = temp_pic_order_cnt,
                }
            }
        }

        pic.pic_order_cnt = match pic.field {
            Field::Frame => std::cmp::min(pic.top_field_order_cnt, pic.bottom_field_order_cnt),
            Field::Top => pic.top_field_order_cnt,
            Field::Bottom => pic.bottom_field_order_cnt,
        };

        Ok(pic)
    }

    /// FrameNumOffset, see 8-6 and 8-11.
    fn frame_num_offset(pic: &PictureData, sps: &Sps, prev_pic: &PrevPicInfo) -> i32 {
        if pic.is_idr {
            0
        } else if prev_pic.frame_num > pic.frame_num {
            prev_pic
                .frame_num_offset
                .wrapping_add(sps.max_frame_num() as i32)
        } else {
            prev_pic.frame_num_offset
        }
    }

    /// Whether `self` is the second field of a complementary field pair whose
    /// first field is `first`.
    fn completes(&self, first: &PictureData) -> bool {
        self.field.is_field()
            && first.field.is_field()
            && self.field != first.field
            && !self.is_idr
            && self.frame_num == first.frame_num
            && (self.nal_ref_idc == 0) == (first.nal_ref_idc == 0)
    }
}

/// The first slice of the current picture, kept to find the first slice of
/// the next one.
#[derive(Debug)]
struct FirstSlice {
    nal_ref_idc: u8,
    idr_pic_flag: bool,
    pic_order_cnt_type: u8,
    hdr: SliceHeaderPrefix,
}

impl FirstSlice {
    /// Detection of the first VCL NAL unit of a primary coded picture, as per
    /// 7.4.1.2.4.
    fn differs_from(&self, header: &NaluHeader, hdr: &SliceHeaderPrefix) -> bool {
        let prev = &self.hdr;

        hdr.frame_num != prev.frame_num
            || hdr.pic_parameter_set_id != prev.pic_parameter_set_id
            || hdr.field_pic_flag != prev.field_pic_flag
            || hdr.bottom_field_flag != prev.bottom_field_flag
            || (header.ref_idc == 0) != (self.nal_ref_idc == 0)
            || (self.pic_order_cnt_type == 0
                && (hdr.pic_order_cnt_lsb != prev.pic_order_cnt_lsb
                    || hdr.delta_pic_order_cnt_bottom != prev.delta_pic_order_cnt_bottom))
            || (self.pic_order_cnt_type == 1
                && hdr.delta_pic_order_cnt != prev.delta_pic_order_cnt)
            || header.idr_pic_flag != self.idr_pic_flag
            || (header.idr_pic_flag && self.idr_pic_flag && hdr.idr_pic_id != prev.idr_pic_id)
    }
}

/// Turns h.264 NAL units into pictures.
///
/// The two fields of a complementary field pair make a single picture, whose
/// picture order count is that of its first field.
#[derive(Debug, Default)]
pub struct PictureParser {
    parser: Parser,
    prev_pic: PrevPicInfo,
    prev_ref_pic: PrevReferencePicInfo,
    current: Option<FirstSlice>,
    /// A field that has not been paired yet.
    unpaired_field: Option<PictureData>,
    stream_info: Option<StreamInfo>,
}

impl PictureParser {
    pub fn parser(&self) -> &Parser {
        &self.parser
    }

    /// Ends the current access unit: the next slice starts a new picture.
    fn end_access_unit(&mut self) {
        self.current = None;
    }

    fn handle_slice(&mut self, nalu: &Nalu) -> Result<NalEvent, ParseError> {
        let header = nalu.header();
        let hdr = self.parser.parse_slice_header_prefix(nalu)?;

        // Slices of redundant coded pictures are never decoded.
        if hdr.redundant_pic_cnt > 0 {
            return Ok(NalEvent::SliceContinuation);
        }

        let (pps, sps) = self.parser.pps_and_sps(hdr.pic_parameter_set_id)?;

        let new_picture = match &self.current {
            Some(current) => current.differs_from(header, &hdr),
            None => true,
        };
        if !new_picture {
            return Ok(NalEvent::SliceContinuation);
        }

        let references = vec![
            ParameterSetRef::new(ParameterSetKind::Sps, u32::from(sps.seq_parameter_set_id)),
            ParameterSetRef::new(ParameterSetKind::Pps, u32::from(pps.pic_parameter_set_id)),
        ];

        let pic = PictureData::new(header, &hdr, sps, &self.prev_pic, &self.prev_ref_pic)?;

        if self.stream_info.is_none() {
            self.stream_info = Some(sps.stream_info());
        }

        self.current = Some(FirstSlice {
            nal_ref_idc: header.ref_idc,
            idr_pic_flag: header.idr_pic_flag,
            pic_order_cnt_type: sps.pic_order_cnt_type,
            hdr,
        });

        self.prev_pic = PrevPicInfo {
            frame_num: pic.frame_num,
            frame_num_offset: pic.frame_num_offset,
        };
        if pic.nal_ref_idc != 0 {
            self.prev_ref_pic = PrevReferencePicInfo {
                pic_order_cnt_msb: pic.pic_order_cnt_msb,
                pic_order_cnt_lsb: pic.pic_order_cnt_lsb,
            };
        }

        if let Some(first) = self.unpaired_field.take() {
            if pic.completes(&first) {
                debug!(
                    "{:?} field with POC {} completes the field pair",
                    pic.field, pic.pic_order_cnt
                );
                return Ok(NalEvent::SliceContinuation);
            }
        }

        debug!(
            "{:?} {:?} with POC {}",
            header.type_, pic.field, pic.pic_order_cnt
        );

        let info = PictureInfo {
            poc: pic.pic_order_cnt,
            is_random_access_point: pic.is_idr,
            poc_reset: pic.is_idr,
            references,
        };

        if pic.field.is_field() {
            self.unpaired_field = Some(pic);
        }

        Ok(NalEvent::PictureStart(info))
    }
}

impl NalHandler for PictureParser {
    type Header = NaluHeader;

    fn handle(&mut self, nalu: &Nalu) -> Result<NalEvent, ParseError> {
        let type_ = nalu.header().type_;

        if type_.starts_access_unit() {
            self.end_access_unit();
        }

        let event = match type_ {
            NaluType::Sps => {
                let sps = self.parser.parse_sps(nalu)?;
                NalEvent::ParameterSet(ParameterSetRef::new(
                    ParameterSetKind::Sps,
                    u32::from(sps.seq_parameter_set_id),
                ))
            }
            NaluType::Pps => {
                let pps = self.parser.parse_pps(nalu)?;
                NalEvent::ParameterSet(ParameterSetRef::new(
                    ParameterSetKind::Pps,
                    u32::from(pps.pic_parameter_set_id),
                ))
            }
            NaluType::SeqEnd | NaluType::StreamEnd => {
                self.end_access_unit();
                self.unpaired_field = None;
                self.prev_pic = Default::default();
                self.prev_ref_pic = Default::default();
                NalEvent::EndOfSequence
            }
            type_ if type_.has_slice_header() => self.handle_slice(nalu)?,
            NaluType::SliceDpb | NaluType::SliceDpc => NalEvent::SliceContinuation,
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
