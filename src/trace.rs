// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Optional record of the syntax elements read while parsing a NAL unit.

use std::fmt;

/// A single syntax element as it was read from the RBSP.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceEntry {
    /// Name of the syntax element, e.g. `vps_max_layers_minus1`.
    pub name: &'static str,
    /// Decoded value. Signed Exp-Golomb values keep their sign.
    pub value: i64,
    /// Number of bits consumed from the RBSP.
    pub bit_width: u32,
    /// The consumed bits, most significant bit first. Only filled for fixed
    /// length fields; Exp-Golomb codes leave this as the decoded code number.
    pub raw_bits: u64,
    /// Bit position of the first consumed bit, relative to the RBSP start.
    pub position: u64,
}

impl fmt::Display for TraceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "@{:<6} {:<48} {:>12} ({} bits, raw {:#x})",
            self.position, self.name, self.value, self.bit_width, self.raw_bits
        )
    }
}

/// Ordered list of the syntax elements of one NAL unit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyntaxTrace(Vec<TraceEntry>);

impl SyntaxTrace {
    pub fn push(&mut self, entry: TraceEntry) {
        self.0.push(entry);
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the value of the first element called `name`, if any.
    pub fn value_of(&self, name: &str) -> Option<i64> {
        self.0.iter().find(|e| e.name == name).map(|e| e.value)
    }

    /// Returns every value recorded under `name`, in bitstream order.
    pub fn values_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = i64> + 'a {
        self.0.iter().filter(move |e| e.name == name).map(|e| e.value)
    }
}

impl fmt::Display for SyntaxTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.0 {
            writeln!(f, "{}", entry)?;
        }

        Ok(())
    }
}
