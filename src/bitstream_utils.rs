// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::borrow::Cow;
use std::io::Cursor;
use std::io::Read;
use std::io::Write;

use thiserror::Error;

use crate::trace::SyntaxTrace;
use crate::trace::TraceEntry;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BitReaderError {
    #[error("reader ran out of bits")]
    OutOfBits,
    #[error("more than 32 ({0}) bits were requested")]
    TooManyBitsRequested(usize),
    #[error("invalid Exp-Golomb code: more than 31 leading zero bits")]
    InvalidExpGolomb,
    #[error("failed to convert read input to target type")]
    ConversionFailed,
    #[error("{name} out of bounds: expected {min} - {max}, got {value}")]
    OutOfBounds {
        name: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
}

/// A bit reader over an RBSP, i.e. a NAL unit payload whose emulation
/// prevention bytes have already been removed with [`unescape_rbsp`].
///
/// The `u`, `flag`, `ue` and `se` methods are named after the syntax element
/// descriptors of the standards and record what they read into an optional
/// [`SyntaxTrace`].
#[derive(Clone)]
pub struct BitReader<'a> {
    /// A reference into the next unread byte in the stream.
    data: Cursor<&'a [u8]>,
    /// Contents of the current byte. First unread bit starting at position 8 -
    /// num_remaining_bits_in_curr_bytes.
    curr_byte: u8,
    /// Number of bits remaining in `curr_byte`
    num_remaining_bits_in_curr_byte: usize,
    /// How many bits have been read so far.
    position: u64,
    trace: Option<SyntaxTrace>,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data: Cursor::new(data),
            curr_byte: Default::default(),
            num_remaining_bits_in_curr_byte: Default::default(),
            position: 0,
            trace: None,
        }
    }

    /// Enables recording of every named read into a [`SyntaxTrace`].
    pub fn with_trace(mut self, enabled: bool) -> Self {
        self.trace = enabled.then(SyntaxTrace::default);
        self
    }

    /// Takes the trace recorded so far, leaving tracing disabled.
    pub fn take_trace(&mut self) -> Option<SyntaxTrace> {
        self.trace.take()
    }

    /// Read up to 32 bits from the stream.
    pub fn read_bits<U: TryFrom<u32>>(&mut self, num_bits: usize) -> Result<U, BitReaderError> {
        if num_bits > 32 {
            return Err(BitReaderError::TooManyBitsRequested(num_bits));
        }

        if num_bits == 0 {
            return U::try_from(0).map_err(|_| BitReaderError::ConversionFailed);
        }

        let mut bits_left = num_bits;
        let mut out = 0u64;

        while self.num_remaining_bits_in_curr_byte < bits_left {
            out |= u64::from(self.curr_byte) << (bits_left - self.num_remaining_bits_in_curr_byte);
            bits_left -= self.num_remaining_bits_in_curr_byte;
            self.move_to_next_byte()?;
        }

        out |= u64::from(self.curr_byte) >> (self.num_remaining_bits_in_curr_byte - bits_left);
        out &= (1u64 << num_bits) - 1;
        self.num_remaining_bits_in_curr_byte -= bits_left;
        self.position += num_bits as u64;

        let out = u32::try_from(out).map_err(|_| BitReaderError::ConversionFailed)?;
        U::try_from(out).map_err(|_| BitReaderError::ConversionFailed)
    }

    /// Skip `num_bits` bits from the stream.
    pub fn skip_bits(&mut self, mut num_bits: usize) -> Result<(), BitReaderError> {
        while num_bits > 0 {
            let n = std::cmp::min(num_bits, 32);
            self.read_bits::<u32>(n)?;
            num_bits -= n;
        }

        Ok(())
    }

    /// Returns the amount of bits left in the stream
    pub fn num_bits_left(&self) -> usize {
        let len = self.data.get_ref().len();
        let pos = self.data.position() as usize;
        (len - pos.min(len)) * 8 + self.num_remaining_bits_in_curr_byte
    }

    /// Whether the stream still has RBSP data. Implements more_rbsp_data(),
    /// i.e. whether anything but the rbsp_stop_one_bit and the alignment zero
    /// bits following it is left.
    pub fn has_more_rsbp_data(&mut self) -> bool {
        if self.num_remaining_bits_in_curr_byte == 0 && self.move_to_next_byte().is_err() {
            // no more data at all in the rbsp
            return false;
        }

        // If the next bit is the stop bit, then we should only see unset bits
        // until the end of the data.
        if (self.curr_byte & ((1 << (self.num_remaining_bits_in_curr_byte - 1)) - 1)) != 0 {
            return true;
        }

        let mut buf = [0u8; 1];
        let orig_pos = self.data.position();
        let mut more = false;
        while self.data.read_exact(&mut buf).is_ok() {
            if buf[0] != 0 {
                more = true;
                break;
            }
        }
        self.data.set_position(orig_pos);

        more
    }

    /// Reads an Unsigned Exponential golomb coding number from the next bytes in the
    /// bitstream. This may advance the state of position within the bitstream even if the
    /// read operation is unsuccessful. See H.264 clause 9.1 for details.
    pub fn read_ue<U: TryFrom<u32>>(&mut self) -> Result<U, BitReaderError> {
        let mut num_bits = 0;

        while self.read_bits::<u32>(1)? == 0 {
            num_bits += 1;
            if num_bits > 31 {
                return Err(BitReaderError::InvalidExpGolomb);
            }
        }

        let value = ((1u32 << num_bits) - 1)
            .checked_add(self.read_bits::<u32>(num_bits)?)
            .ok_or(BitReaderError::InvalidExpGolomb)?;

        U::try_from(value).map_err(|_| BitReaderError::ConversionFailed)
    }

    /// Reads a signed exponential golomb coding number. Instead of using two's
    /// complement, this scheme maps even integers to positive numbers and odd
    /// integers to negative numbers. The least significant bit indicates the
    /// sign. See H.264 clause 9.1.1 for details.
    pub fn read_se<U: TryFrom<i32>>(&mut self) -> Result<U, BitReaderError> {
        let ue = i64::from(self.read_ue::<u32>()?);

        let se = if ue % 2 == 0 { -(ue / 2) } else { ue / 2 + 1 };
        let se = i32::try_from(se).map_err(|_| BitReaderError::ConversionFailed)?;

        U::try_from(se).map_err(|_| BitReaderError::ConversionFailed)
    }

    /// Reads `u(n)` syntax element `name`.
    pub fn u<U: TryFrom<u32>>(
        &mut self,
        name: &'static str,
        num_bits: usize,
    ) -> Result<U, BitReaderError> {
        let position = self.position;
        let value: u32 = self.read_bits(num_bits)?;
        self.record(name, i64::from(value), num_bits as u32, u64::from(value), position);
        U::try_from(value).map_err(|_| BitReaderError::ConversionFailed)
    }

    /// Reads `u(1)` syntax element `name` as a flag.
    pub fn flag(&mut self, name: &'static str) -> Result<bool, BitReaderError> {
        Ok(self.u::<u32>(name, 1)? == 1)
    }

    /// Reads `ue(v)` syntax element `name`.
    pub fn ue<U: TryFrom<u32>>(&mut self, name: &'static str) -> Result<U, BitReaderError> {
        let position = self.position;
        let value: u32 = self.read_ue()?;
        let width = (self.position - position) as u32;
        self.record(name, i64::from(value), width, u64::from(value), position);
        U::try_from(value).map_err(|_| BitReaderError::ConversionFailed)
    }

    /// Reads `ue(v)` syntax element `name`, failing if it is above `max`.
    pub fn ue_max<U: TryFrom<u32>>(
        &mut self,
        name: &'static str,
        max: u32,
    ) -> Result<U, BitReaderError> {
        let value: u32 = self.ue(name)?;
        if value > max {
            return Err(BitReaderError::OutOfBounds {
                name,
                value: i64::from(value),
                min: 0,
                max: i64::from(max),
            });
        }

        U::try_from(value).map_err(|_| BitReaderError::ConversionFailed)
    }

    /// Reads `se(v)` syntax element `name`.
    pub fn se<U: TryFrom<i32>>(&mut self, name: &'static str) -> Result<U, BitReaderError> {
        let position = self.position;
        let value: i32 = self.read_se()?;
        let width = (self.position - position) as u32;
        let code_num = if value > 0 {
            2 * i64::from(value) - 1
        } else {
            -2 * i64::from(value)
        };
        self.record(name, i64::from(value), width, code_num as u64, position);
        U::try_from(value).map_err(|_| BitReaderError::ConversionFailed)
    }

    /// Reads `se(v)` syntax element `name`, failing outside `min..=max`.
    pub fn se_bounded<U: TryFrom<i32>>(
        &mut self,
        name: &'static str,
        min: i32,
        max: i32,
    ) -> Result<U, BitReaderError> {
        let value: i32 = self.se(name)?;
        if value < min || value > max {
            return Err(BitReaderError::OutOfBounds {
                name,
                value: i64::from(value),
                min: i64::from(min),
                max: i64::from(max),
            });
        }

        U::try_from(value).map_err(|_| BitReaderError::ConversionFailed)
    }

    /// Reads zero bits named `name` until the reader is byte aligned.
    pub fn skip_to_byte_alignment(&mut self, name: &'static str) -> Result<(), BitReaderError> {
        let remaining = self.num_remaining_bits_in_curr_byte;
        if remaining > 0 {
            let bits: u32 = self.u(name, remaining)?;
            if bits != 0 {
                log::debug!("{} is not zero ({:#x})", name, bits);
            }
        }

        Ok(())
    }

    /// Return the position of this bitstream in bits.
    pub fn position(&self) -> u64 {
        self.position
    }

    fn record(&mut self, name: &'static str, value: i64, bit_width: u32, raw_bits: u64, position: u64) {
        if let Some(trace) = self.trace.as_mut() {
            trace.push(TraceEntry {
                name,
                value,
                bit_width,
                raw_bits,
                position,
            });
        }
    }

    fn get_byte(&mut self) -> Result<u8, BitReaderError> {
        let mut buf = [0u8; 1];
        self.data
            .read_exact(&mut buf)
            .map_err(|_| BitReaderError::OutOfBits)?;
        Ok(buf[0])
    }

    fn move_to_next_byte(&mut self) -> Result<(), BitReaderError> {
        let byte = self.get_byte()?;
        self.num_remaining_bits_in_curr_byte = 8;
        self.curr_byte = byte;
        Ok(())
    }
}

/// Removes the emulation prevention bytes from a NAL unit payload, i.e. every
/// `0x03` that follows two zero bytes.
///
/// Returns the input untouched if it contains no emulation prevention byte.
pub fn unescape_rbsp(data: &[u8]) -> Cow<[u8]> {
    let has_epb = data.windows(3).any(|w| w == [0x00, 0x00, 0x03]);
    if !has_epb {
        return Cow::Borrowed(data);
    }

    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0;
    for &byte in data {
        if zeros >= 2 && byte == 0x03 {
            zeros = 0;
            continue;
        }

        zeros = if byte == 0 { zeros + 1 } else { 0 };
        out.push(byte);
    }

    Cow::Owned(out)
}

/// Inserts emulation prevention bytes so that no start code prefix can appear
/// inside a NAL unit: a `0x03` goes before any byte in `0x00..=0x03` that
/// follows two zero bytes, and after a trailing `cabac_zero_word`.
///
/// `data` is expected to end with its RBSP trailing bits. A single trailing
/// zero byte would merge into the start code of the next NAL unit.
pub fn escape_rbsp(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 64 + 1);
    let mut zeros = 0;
    for &byte in data {
        if zeros >= 2 && byte <= 0x03 {
            out.push(0x03);
            zeros = 0;
        }

        zeros = if byte == 0 { zeros + 1 } else { 0 };
        out.push(byte);
    }

    if zeros >= 2 {
        out.push(0x03);
    }

    out
}

#[derive(Debug, Error)]
pub enum BitWriterError {
    #[error("invalid bit count")]
    InvalidBitCount,
    #[error("value does not fit in a 32 bit Exp-Golomb code")]
    ValueTooLarge,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type BitWriterResult<T> = std::result::Result<T, BitWriterError>;

/// Writes RBSP bits. Used to synthesize parameter sets and slice headers.
pub struct BitWriter<W: Write> {
    out: W,
    nth_bit: u8,
    curr_byte: u8,
}

impl<W: Write> BitWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            out: writer,
            curr_byte: 0,
            nth_bit: 0,
        }
    }

    /// Writes fixed bit size integer (up to 32 bit)
    pub fn write_f<T: Into<u32>>(&mut self, bits: usize, value: T) -> BitWriterResult<usize> {
        let value = value.into();

        if bits > 32 {
            return Err(BitWriterError::InvalidBitCount);
        }

        let mut written = 0;
        for bit in (0..bits).rev() {
            let bit = 1u32 << bit;

            self.write_bit((value & bit) == bit)?;
            written += 1;
        }

        Ok(written)
    }

    /// Takes a single bit that will be outputed to [`std::io::Write`]
    pub fn write_bit(&mut self, bit: bool) -> BitWriterResult<()> {
        self.curr_byte |= (bit as u8) << (7u8 - self.nth_bit);
        self.nth_bit += 1;

        if self.nth_bit == 8 {
            self.out.write_all(&[self.curr_byte])?;
            self.nth_bit = 0;
            self.curr_byte = 0;
        }

        Ok(())
    }

    /// Writes an unsigned Exp-Golomb code, see 9.1.
    pub fn write_ue<T: Into<u32>>(&mut self, value: T) -> BitWriterResult<usize> {
        let value = u64::from(value.into()) + 1;
        if value > u64::from(u32::MAX) {
            return Err(BitWriterError::ValueTooLarge);
        }

        let len = 64 - value.leading_zeros() as usize;
        for _ in 1..len {
            self.write_bit(false)?;
        }

        for bit in (0..len).rev() {
            self.write_bit((value >> bit) & 1 == 1)?;
        }

        Ok(2 * len - 1)
    }

    /// Writes a signed Exp-Golomb code, see 9.1.1.
    pub fn write_se<T: Into<i32>>(&mut self, value: T) -> BitWriterResult<usize> {
        let value = i64::from(value.into());
        let code_num = if value > 0 { 2 * value - 1 } else { -2 * value };
        let code_num = u32::try_from(code_num).map_err(|_| BitWriterError::ValueTooLarge)?;

        self.write_ue(code_num)
    }

    /// Writes the rbsp_stop_one_bit and the alignment zero bits.
    pub fn write_trailing_bits(&mut self) -> BitWriterResult<()> {
        self.write_bit(true)?;
        while self.nth_bit != 0 {
            self.write_bit(false)?;
        }

        Ok(())
    }

    /// Pads with zero bits up to the next byte boundary.
    pub fn align(&mut self) -> BitWriterResult<()> {
        while self.nth_bit != 0 {
            self.write_bit(false)?;
        }

        Ok(())
    }

    /// Immediately outputs any cached bits to [`std::io::Write`]
    pub fn flush(&mut self) -> BitWriterResult<()> {
        if self.nth_bit != 0 {
            self.out.write_all(&[self.curr_byte])?;
            self.nth_bit = 0;
            self.curr_byte = 0;
        }

        self.out.flush()?;
        Ok(())
    }
}

impl<W: Write> Drop for BitWriter<W> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("Unable to flush bits {e:?}");
        }
    }
}
