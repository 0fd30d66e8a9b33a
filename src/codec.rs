// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Codec specific NAL unit header, parameter set and slice header parsers.
//!
//! Every codec provides a `parser` module with its NAL unit header type, the
//! parameter sets it understands and a `Parser` that keeps the last received
//! instance of each parameter set, and a `picture` module that turns slices
//! into pictures with a picture order count.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::bitstream_utils::BitReaderError;
use crate::stream_info::StreamInfo;
use crate::trace::SyntaxTrace;
use crate::utils::nalu::Header;

#[cfg(feature = "h264")]
pub mod h264;
#[cfg(feature = "h265")]
pub mod h265;
#[cfg(feature = "h266")]
pub mod h266;

/// Number of NAL units looked at by [`Codec::detect`].
const DETECT_MAX_NALUS: usize = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Codec {
    Avc,
    Hevc,
    Vvc,
}

impl FromStr for Codec {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "h264" | "H264" | "avc" | "AVC" => Ok(Codec::Avc),
            "h265" | "H265" | "hevc" | "HEVC" => Ok(Codec::Hevc),
            "h266" | "H266" | "vvc" | "VVC" => Ok(Codec::Vvc),
            _ => Err("unrecognized codec. Valid values: h264, h265, h266"),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Codec::Avc => "H.264",
            Codec::Hevc => "H.265",
            Codec::Vvc => "H.266",
        };

        f.write_str(name)
    }
}

impl Codec {
    /// Guesses the codec of an Annex B stream from the headers of its first
    /// NAL units.
    ///
    /// Only the unit types that usually open a stream are considered: SEI,
    /// parameter sets and access unit delimiters. The first NAL unit whose
    /// header fits exactly one codec decides.
    pub fn detect(data: &[u8]) -> Option<Codec> {
        data.windows(5)
            .filter(|w| w[..3] == [0, 0, 1])
            .take(DETECT_MAX_NALUS)
            .find_map(|w| Self::from_header_bytes(w[3], w[4]))
    }

    fn from_header_bytes(b0: u8, b1: u8) -> Option<Codec> {
        // forbidden_zero_bit
        if b0 & 0x80 != 0 {
            return None;
        }

        let avc = matches!(b0 & 0x1f, 6..=9);
        let hevc = matches!((b0 >> 1) & 0x3f, 32..=35 | 39) && b1 & 0x7 != 0;
        let vvc = b0 & 0x40 == 0 && matches!(b1 >> 3, 12..=17 | 20 | 23) && b1 & 0x7 != 0;

        match (avc, hevc, vvc) {
            (true, false, false) => Some(Codec::Avc),
            (false, true, false) => Some(Codec::Hevc),
            (false, false, true) => Some(Codec::Vvc),
            _ => None,
        }
    }
}

/// Errors raised while parsing a single NAL unit. The indexer logs them and
/// skips the offending unit.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("bitstream truncated")]
    BitstreamTruncated,
    #[error("malformed NAL unit header: {0}")]
    MalformedNalHeader(String),
    #[error("value outside of the supported range: {0}")]
    UnsupportedDerivedRange(String),
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("missing parameter set: {0}")]
    MissingParameterSet(String),
}

impl From<BitReaderError> for ParseError {
    fn from(err: BitReaderError) -> Self {
        match err {
            BitReaderError::OutOfBits => ParseError::BitstreamTruncated,
            err => ParseError::InvalidValue(err.to_string()),
        }
    }
}

impl From<bitreader::BitReaderError> for ParseError {
    fn from(err: bitreader::BitReaderError) -> Self {
        match err {
            bitreader::BitReaderError::NotEnoughData { .. } => ParseError::BitstreamTruncated,
            err => ParseError::MalformedNalHeader(err.to_string()),
        }
    }
}

/// The kinds of NAL units that are replayed to a decoder before seeking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParameterSetKind {
    Vps,
    Sps,
    Pps,
    Aps,
}

impl fmt::Display for ParameterSetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParameterSetKind::Vps => "VPS",
            ParameterSetKind::Sps => "SPS",
            ParameterSetKind::Pps => "PPS",
            ParameterSetKind::Aps => "APS",
        };

        f.write_str(name)
    }
}

/// A parameter set referenced by a picture, by kind and id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParameterSetRef {
    pub kind: ParameterSetKind,
    pub id: u32,
}

impl ParameterSetRef {
    pub fn new(kind: ParameterSetKind, id: u32) -> Self {
        Self { kind, id }
    }
}

/// What a codec handler made of a NAL unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NalEvent {
    /// A parameter set was parsed and stored.
    ParameterSet(ParameterSetRef),
    /// The first slice of a new picture.
    PictureStart(PictureInfo),
    /// Another slice of the current picture.
    SliceContinuation,
    /// A NAL unit that belongs to the next picture but does not start it, e.g.
    /// a VVC picture header that precedes the picture's slices.
    PicturePrefix,
    /// End of sequence: the next picture restarts POC derivation.
    EndOfSequence,
    /// Anything else (SEI, AUD, filler data...).
    Other,
}

/// Per picture data produced from its first slice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PictureInfo {
    /// Picture order count within the coded video sequence.
    pub poc: i32,
    /// Whether decoding can start at this picture.
    pub is_random_access_point: bool,
    /// Whether POC derivation restarted at this picture, i.e. it is an IRAP
    /// picture with NoRaslOutputFlag equal to 1 or an IDR picture.
    pub poc_reset: bool,
    /// Parameter sets a decoder needs to decode this picture.
    pub references: Vec<ParameterSetRef>,
}

/// A codec specific consumer of NAL units.
///
/// Implemented by the `picture` module of every codec. Handlers own the parser
/// state of their codec, and are fed NAL units in decoding order.
pub trait NalHandler: Send {
    type Header: Header + Clone + fmt::Debug + Into<NalHeader>;

    /// Parses `nalu` and updates the parser state.
    ///
    /// A parameter set that fails to parse must not replace an earlier valid
    /// instance with the same id.
    fn handle(
        &mut self,
        nalu: &crate::utils::nalu::Nalu<'_, Self::Header>,
    ) -> Result<NalEvent, ParseError>;

    /// Enables or disables syntax tracing for the following NAL units.
    fn set_trace(&mut self, enabled: bool);

    /// Takes the syntax trace of the last handled NAL unit, if tracing is on.
    fn take_trace(&mut self) -> Option<SyntaxTrace>;

    /// Format of the stream, taken from the parameter sets active at its first
    /// picture. `None` until a picture started.
    fn stream_info(&self) -> Option<StreamInfo>;
}

/// A parsed NAL unit header of any of the supported codecs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NalHeader {
    #[cfg(feature = "h264")]
    Avc(h264::parser::NaluHeader),
    #[cfg(feature = "h265")]
    Hevc(h265::parser::NaluHeader),
    #[cfg(feature = "h266")]
    Vvc(h266::parser::NaluHeader),
}

impl NalHeader {
    fn as_header(&self) -> &dyn DynHeader {
        match self {
            #[cfg(feature = "h264")]
            NalHeader::Avc(hdr) => hdr,
            #[cfg(feature = "h265")]
            NalHeader::Hevc(hdr) => hdr,
            #[cfg(feature = "h266")]
            NalHeader::Vvc(hdr) => hdr,
        }
    }

    pub fn unit_type_id(&self) -> u8 {
        self.as_header().dyn_unit_type_id()
    }

    pub fn layer_id(&self) -> u8 {
        self.as_header().dyn_layer_id()
    }

    pub fn temporal_id(&self) -> u8 {
        self.as_header().dyn_temporal_id()
    }

    pub fn is_parameter_set(&self) -> bool {
        self.as_header().dyn_is_parameter_set()
    }

    pub fn is_slice(&self) -> bool {
        self.as_header().dyn_is_slice()
    }

    pub fn is_random_access(&self) -> bool {
        self.as_header().dyn_is_random_access()
    }
}

impl fmt::Display for NalHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(feature = "h264")]
            NalHeader::Avc(hdr) => write!(f, "{:?} ref_idc {}", hdr.type_, hdr.ref_idc),
            #[cfg(feature = "h265")]
            NalHeader::Hevc(hdr) => write!(
                f,
                "{:?} layer {} tid {}",
                hdr.type_(),
                hdr.layer_id(),
                hdr.temporal_id()
            ),
            #[cfg(feature = "h266")]
            NalHeader::Vvc(hdr) => write!(
                f,
                "{:?} layer {} tid {}",
                hdr.type_(),
                hdr.layer_id(),
                hdr.temporal_id()
            ),
        }
    }
}

// Object safe mirror of `Header`, whose `parse` constructor keeps it from being
// used as a trait object.
trait DynHeader {
    fn dyn_unit_type_id(&self) -> u8;
    fn dyn_layer_id(&self) -> u8;
    fn dyn_temporal_id(&self) -> u8;
    fn dyn_is_parameter_set(&self) -> bool;
    fn dyn_is_slice(&self) -> bool;
    fn dyn_is_random_access(&self) -> bool;
}

impl<H: Header> DynHeader for H {
    fn dyn_unit_type_id(&self) -> u8 {
        self.unit_type_id()
    }

    fn dyn_layer_id(&self) -> u8 {
        self.layer_id()
    }

    fn dyn_temporal_id(&self) -> u8 {
        self.temporal_id()
    }

    fn dyn_is_parameter_set(&self) -> bool {
        self.is_parameter_set()
    }

    fn dyn_is_slice(&self) -> bool {
        self.is_slice()
    }

    fn dyn_is_random_access(&self) -> bool {
        self.is_random_access()
    }
}

/// Computes the picture order count MSB from the previous reference picture
/// values. Equations (8-3) of H.264, (8-1) of H.265 and (197) of H.266.
pub(crate) fn pic_order_cnt_msb(
    pic_order_cnt_lsb: i32,
    prev_pic_order_cnt_lsb: i32,
    prev_pic_order_cnt_msb: i32,
    max_pic_order_cnt_lsb: i32,
) -> Result<i32, ParseError> {
    let msb = i64::from(prev_pic_order_cnt_msb);
    let max = i64::from(max_pic_order_cnt_lsb);

    let msb = if (pic_order_cnt_lsb < prev_pic_order_cnt_lsb)
        && (prev_pic_order_cnt_lsb - pic_order_cnt_lsb) >= (max_pic_order_cnt_lsb / 2)
    {
        msb + max
    } else if (pic_order_cnt_lsb > prev_pic_order_cnt_lsb)
        && (pic_order_cnt_lsb - prev_pic_order_cnt_lsb) > (max_pic_order_cnt_lsb / 2)
    {
        msb - max
    } else {
        msb
    };

    poc_in_range("PicOrderCntMsb", msb)
}

/// PicOrderCntMsb + pic_order_cnt_lsb, failing when the sum does not fit a
/// picture order count.
pub(crate) fn pic_order_cnt_val(
    pic_order_cnt_msb: i32,
    pic_order_cnt_lsb: i32,
) -> Result<i32, ParseError> {
    poc_in_range(
        "PicOrderCntVal",
        i64::from(pic_order_cnt_msb) + i64::from(pic_order_cnt_lsb),
    )
}

pub(crate) fn poc_in_range(name: &str, value: i64) -> Result<i32, ParseError> {
    i32::try_from(value)
        .map_err(|_| ParseError::UnsupportedDerivedRange(format!("{} = {}", name, value)))
}
