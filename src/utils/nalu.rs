// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Annex B byte stream framing: start code scanning and NAL unit splitting.

use std::borrow::Cow;
use std::fmt::Debug;
use std::io::Cursor;
use std::marker::PhantomData;

use crate::bitstream_utils::unescape_rbsp;
use crate::codec::ParseError;

const START_CODE: [u8; 3] = [0x00, 0x00, 0x01];

pub trait Header: Sized {
    /// Parse the NALU header, returning it.
    fn parse<T: AsRef<[u8]>>(cursor: &Cursor<T>) -> Result<Self, ParseError>;
    /// Whether this header type indicates EOS.
    fn is_end(&self) -> bool;
    /// The length of the header.
    fn len(&self) -> usize;
    /// The raw nal_unit_type.
    fn unit_type_id(&self) -> u8;
    /// nuh_layer_id, zero for codecs without layers.
    fn layer_id(&self) -> u8 {
        0
    }
    /// TemporalId, zero for codecs without temporal sublayers in the header.
    fn temporal_id(&self) -> u8 {
        0
    }
    /// Whether the unit carries a VPS, SPS, PPS or APS.
    fn is_parameter_set(&self) -> bool;
    /// Whether the unit carries coded slice data.
    fn is_slice(&self) -> bool;
    /// Whether the unit is a slice of a picture decoding can start from.
    fn is_random_access(&self) -> bool;
}

fn find_start_code(data: &[u8]) -> Option<usize> {
    // discard all zeroes until the start code pattern is found
    data.windows(3).position(|window| window == START_CODE)
}

/// Length of `data` once trailing_zero_8bits are dropped.
fn trimmed_len(data: &[u8]) -> usize {
    data.iter().rposition(|&b| b != 0).map_or(0, |pos| pos + 1)
}

#[derive(Debug, Clone)]
pub struct Nalu<'a, U> {
    header: U,
    /// The NAL unit bytes, header included, start code and trailing zero bytes
    /// excluded. Emulation prevention bytes are still present.
    data: Cow<'a, [u8]>,
    /// Offset of the first header byte in the byte stream.
    offset: u64,
    /// Offset of the start code, including the leading zero_byte if any.
    sc_offset: u64,
}

impl<'a, U> Nalu<'a, U>
where
    U: Debug + Header,
{
    /// Find the next Annex B encoded NAL unit.
    ///
    /// The cursor is moved past the NAL unit before its header is parsed, so
    /// calling `next` again after an error resumes with the following unit.
    /// Returns `Ok(None)` once no start code is left.
    pub fn next(cursor: &mut Cursor<&'a [u8]>) -> Result<Option<Self>, ParseError> {
        let data: &'a [u8] = *cursor.get_ref();
        let pos = usize::try_from(cursor.position())
            .unwrap_or(data.len())
            .min(data.len());

        // Find the start code for this NALU
        let current_nalu_offset = match find_start_code(&data[pos..]) {
            Some(offset) => offset,
            None => {
                cursor.set_position(data.len() as u64);
                return Ok(None);
            }
        };

        let mut start_code_offset = pos + current_nalu_offset;

        // If the preceding byte is 00, then we actually have a four byte SC,
        // i.e. 00 00 00 01 Where the first 00 is the "zero_byte()"
        if start_code_offset > 0 && data[start_code_offset - 1] == 00 {
            start_code_offset -= 1;
        }

        // The NALU offset is its offset + 3 bytes to skip the start code.
        let nalu_offset = pos + current_nalu_offset + 3;

        // Find the start of the subsequent NALU. Whatever data is left must be
        // part of the current NALU otherwise.
        let next_start_code = find_start_code(&data[nalu_offset..])
            .map_or(data.len(), |offset| nalu_offset + offset);

        cursor.set_position(next_start_code as u64);

        // Discard trailing_zero_8bits
        let nal_size = trimmed_len(&data[nalu_offset..next_start_code]);

        Self::from_parts(
            Cow::Borrowed(&data[nalu_offset..nalu_offset + nal_size]),
            nalu_offset as u64,
            start_code_offset as u64,
        )
        .map(Some)
    }

    /// Builds a NAL unit out of a span produced by a [`StartCodeScanner`].
    pub fn from_span(span: NalSpan) -> Result<Nalu<'static, U>, ParseError> {
        Nalu::from_parts(Cow::Owned(span.data), span.offset, span.sc_offset)
    }

    fn from_parts<'b>(
        data: Cow<'b, [u8]>,
        offset: u64,
        sc_offset: u64,
    ) -> Result<Nalu<'b, U>, ParseError> {
        if data.is_empty() {
            return Err(ParseError::MalformedNalHeader(format!(
                "empty NAL unit at offset {}",
                offset
            )));
        }

        let header = U::parse(&Cursor::new(data.as_ref()))?;
        if data.len() < header.len() {
            return Err(ParseError::MalformedNalHeader(format!(
                "NAL unit at offset {} is shorter than its header",
                offset
            )));
        }

        Ok(Nalu {
            header,
            data,
            offset,
            sc_offset,
        })
    }

    /// Get a reference to the nalu's header.
    pub fn header(&self) -> &U {
        &self.header
    }

    /// Get a reference to the nalu's data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The bytes following the header, still escaped.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.header.len()..]
    }

    /// The payload with emulation prevention bytes removed.
    pub fn rbsp(&self) -> Cow<[u8]> {
        unescape_rbsp(self.payload())
    }

    /// Get the nalu's size.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Get the nalu's offset.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Get the nalu's sc offset.
    pub fn sc_offset(&self) -> u64 {
        self.sc_offset
    }

    /// Offset one past the last byte of the unit.
    pub fn end_offset(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

impl<U> AsRef<[u8]> for Nalu<'_, U> {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

/// The byte range of a NAL unit found by a [`StartCodeScanner`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NalSpan {
    /// Offset of the start code, including the leading zero_byte if any.
    pub sc_offset: u64,
    /// Offset of the first header byte.
    pub offset: u64,
    /// The NAL unit bytes without start code and trailing zero bytes.
    pub data: Vec<u8>,
}

/// Incremental Annex B splitter for streams that arrive in chunks.
///
/// Start codes may straddle chunk boundaries: the unscanned tail of a chunk is
/// carried over and searched again once the next chunk arrives.
#[derive(Debug, Default)]
pub struct StartCodeScanner {
    buf: Vec<u8>,
    /// Stream offset of `buf[0]`.
    base: u64,
    /// Index into `buf` where the next start code search begins.
    search_pos: usize,
    /// Start code offset and payload start index of the unit being collected.
    current: Option<(u64, usize)>,
}

impl StartCodeScanner {
    pub fn new() -> Self {
        Default::default()
    }

    /// Feeds `chunk` and returns the NAL units it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<NalSpan> {
        self.buf.extend_from_slice(chunk);

        let mut spans = Vec::new();
        while let Some(pos) = find_start_code(&self.buf[self.search_pos..]) {
            let sc = self.search_pos + pos;

            let mut sc_offset = sc;
            if sc > 0 && self.buf[sc - 1] == 0 {
                sc_offset -= 1;
            }

            if let Some((cur_sc, start)) = self.current.take() {
                spans.extend(self.make_span(cur_sc, start, sc));
            }

            self.current = Some((self.base + sc_offset as u64, sc + 3));
            self.search_pos = sc + 3;
        }

        // The last two bytes may be the beginning of a split start code.
        self.search_pos = self.search_pos.max(self.buf.len().saturating_sub(2));
        self.compact();

        spans
    }

    /// Signals the end of the stream and returns the last NAL unit, if any.
    pub fn finish(&mut self) -> Option<NalSpan> {
        let (cur_sc, start) = self.current.take()?;
        let end = self.buf.len();
        let span = self.make_span(cur_sc, start, end);

        self.base += end as u64;
        self.buf.clear();
        self.search_pos = 0;

        span
    }

    /// Number of bytes fed so far.
    pub fn bytes_consumed(&self) -> u64 {
        self.base + self.buf.len() as u64
    }

    fn make_span(&self, sc_offset: u64, start: usize, end: usize) -> Option<NalSpan> {
        let payload = &self.buf[start..end];
        let size = trimmed_len(payload);
        if size == 0 {
            log::debug!("Skipping empty NAL unit at offset {}", sc_offset);
            return None;
        }

        Some(NalSpan {
            sc_offset,
            offset: self.base + start as u64,
            data: payload[..size].to_vec(),
        })
    }

    fn compact(&mut self) {
        // Keep one byte before the search position for the zero_byte lookback.
        let keep_from = match self.current {
            Some((_, start)) => start.min(self.search_pos.saturating_sub(1)),
            None => self.search_pos.saturating_sub(1),
        };

        if keep_from == 0 {
            return;
        }

        if self.current.is_none() && self.base == 0 {
            log::debug!("Skipping {} bytes before the first start code", keep_from);
        }

        self.buf.drain(..keep_from);
        self.base += keep_from as u64;
        self.search_pos -= keep_from;
        if let Some((_, start)) = self.current.as_mut() {
            *start -= keep_from;
        }
    }
}

/// Iterator over the NAL units of an in-memory byte stream.
///
/// Units whose header fails to parse are yielded as errors; iteration goes on
/// with the following unit.
pub struct NalIterator<'a, U>(Cursor<&'a [u8]>, PhantomData<U>);

impl<'a, U> NalIterator<'a, U> {
    pub fn new(stream: &'a [u8]) -> Self {
        Self(Cursor::new(stream), PhantomData)
    }
}

impl<'a, U: Debug + Header> Iterator for NalIterator<'a, U> {
    type Item = Result<Nalu<'a, U>, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        Nalu::next(&mut self.0).transpose()
    }
}
