// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Seek index of a scanned stream.
//!
//! Frames are appended in coding order with a picture order count that is
//! unique over the whole stream. Seeking to a frame given by its display order
//! index yields the closest preceding random access frame, its byte range and
//! the parameter sets to feed a decoder first.

use std::collections::BTreeMap;
use std::ops::Range;

use bytes::Bytes;
use thiserror::Error;

use crate::codec::ParameterSetKind;
use crate::codec::ParameterSetRef;

const EXTRADATA_START_CODE: [u8; 4] = [0, 0, 0, 1];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("a frame with POC {0} is already indexed")]
    DuplicatePoc(i64),
    #[error("no random access frame at or before display index {0}")]
    NoSeekPoint(usize),
    #[error("frame {0} is out of range")]
    FrameOutOfRange(usize),
    #[error("frame {coding_idx} refers to {kind} {id} which was not received before it")]
    ParameterSetMissingForSeek {
        coding_idx: usize,
        kind: ParameterSetKind,
        id: u32,
    },
}

/// One picture, or one access unit for multi-layer streams.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameEntry {
    pub poc: i64,
    /// From the first byte of the start code of the first NAL unit of the
    /// frame, to the end of its last slice.
    pub byte_range: Range<u64>,
    pub is_random_access_point: bool,
    /// Parameter sets the first picture of the frame refers to.
    pub references: Vec<ParameterSetRef>,
}

/// A NAL unit kept after the scan, header included and start code excluded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetainedNal {
    /// Stream offset of the header.
    pub offset: u64,
    pub data: Bytes,
}

#[derive(Clone, Debug)]
struct StoredParameterSet {
    parameter_set: ParameterSetRef,
    /// Coding index of the first frame that follows the parameter set.
    next_frame: usize,
    nal: RetainedNal,
}

/// Every parameter set NAL unit of a stream, in stream order.
#[derive(Clone, Debug, Default)]
pub struct ParameterSetStore {
    stored: Vec<StoredParameterSet>,
}

impl ParameterSetStore {
    pub fn len(&self) -> usize {
        self.stored.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stored.is_empty()
    }

    fn retain(&mut self, parameter_set: ParameterSetRef, next_frame: usize, nal: RetainedNal) {
        self.stored.push(StoredParameterSet {
            parameter_set,
            next_frame,
            nal,
        });
    }

    /// The newest instance of every parameter set received before frame
    /// `coding_idx`, ordered by kind then id.
    pub fn active_at(&self, coding_idx: usize) -> BTreeMap<ParameterSetRef, &RetainedNal> {
        self.stored
            .iter()
            .take_while(|stored| stored.next_frame <= coding_idx)
            .map(|stored| (stored.parameter_set, &stored.nal))
            .collect()
    }
}

/// Where to resume decoding to reach a given frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeekPoint {
    /// Coding index of the random access frame to start decoding from.
    pub coding_idx: usize,
    /// Display index of that frame.
    pub display_idx: usize,
    pub byte_range: Range<u64>,
    /// Parameter set NAL units to send before `byte_range`.
    pub parameter_sets: Vec<Vec<u8>>,
}

#[derive(Clone, Debug, Default)]
pub struct FrameIndex {
    frames: Vec<FrameEntry>,
    /// Coding index of every frame, by POC.
    by_poc: BTreeMap<i64, usize>,
    parameter_sets: ParameterSetStore,
}

impl FrameIndex {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames in coding order.
    pub fn frames(&self) -> &[FrameEntry] {
        &self.frames
    }

    pub fn parameter_sets(&self) -> &ParameterSetStore {
        &self.parameter_sets
    }

    /// Appends a frame with no parameter set references.
    pub fn add_frame(
        &mut self,
        poc: i64,
        byte_range: Range<u64>,
        is_random_access_point: bool,
    ) -> Result<usize, IndexError> {
        self.add_entry(FrameEntry {
            poc,
            byte_range,
            is_random_access_point,
            references: Vec::new(),
        })
    }

    /// Appends `entry` and returns its coding index. A frame whose POC is
    /// already indexed is rejected.
    pub fn add_entry(&mut self, entry: FrameEntry) -> Result<usize, IndexError> {
        if self.by_poc.contains_key(&entry.poc) {
            return Err(IndexError::DuplicatePoc(entry.poc));
        }

        let coding_idx = self.frames.len();
        self.by_poc.insert(entry.poc, coding_idx);
        self.frames.push(entry);

        Ok(coding_idx)
    }

    /// Moves the end of the byte range of frame `coding_idx` to `end`.
    pub fn extend_frame(&mut self, coding_idx: usize, end: u64) -> Result<(), IndexError> {
        let frame = self
            .frames
            .get_mut(coding_idx)
            .ok_or(IndexError::FrameOutOfRange(coding_idx))?;
        frame.byte_range.end = frame.byte_range.end.max(end);

        Ok(())
    }

    /// Records a parameter set NAL unit that precedes the next frame to be
    /// added.
    pub fn retain_parameter_set(&mut self, parameter_set: ParameterSetRef, nal: RetainedNal) {
        self.parameter_sets
            .retain(parameter_set, self.frames.len(), nal);
    }

    pub fn frame(&self, coding_idx: usize) -> Result<&FrameEntry, IndexError> {
        self.frames
            .get(coding_idx)
            .ok_or(IndexError::FrameOutOfRange(coding_idx))
    }

    pub fn frame_byte_range(&self, coding_idx: usize) -> Result<Range<u64>, IndexError> {
        Ok(self.frame(coding_idx)?.byte_range.clone())
    }

    /// Coding indices of the frames, in display order.
    pub fn display_order(&self) -> Vec<usize> {
        self.by_poc.values().copied().collect()
    }

    pub fn poc_of_display_index(&self, display_idx: usize) -> Result<i64, IndexError> {
        self.by_poc
            .keys()
            .nth(display_idx)
            .copied()
            .ok_or(IndexError::FrameOutOfRange(display_idx))
    }

    /// Display index of frame `coding_idx`.
    pub fn display_index_of(&self, coding_idx: usize) -> Result<usize, IndexError> {
        let poc = self.frame(coding_idx)?.poc;
        Ok(self.by_poc.range(..poc).count())
    }

    /// Returns the coding index of the random access frame to start decoding
    /// from to reach the frame shown at `target_display_idx`.
    ///
    /// That is the last random access frame that precedes the target in coding
    /// order and is not displayed after it.
    pub fn closest_seekable_frame_before(
        &self,
        target_display_idx: usize,
    ) -> Result<usize, IndexError> {
        let target_poc = self.poc_of_display_index(target_display_idx)?;
        let target_coding_idx = self.by_poc[&target_poc];

        self.frames[..=target_coding_idx]
            .iter()
            .rposition(|frame| frame.is_random_access_point && frame.poc <= target_poc)
            .ok_or(IndexError::NoSeekPoint(target_display_idx))
    }

    /// The parameter set NAL units to send to a decoder before frame
    /// `coding_idx`: the newest instance of every parameter set received
    /// before it, ordered VPS, SPS, PPS then APS.
    pub fn active_parameter_sets_for_seek(
        &self,
        coding_idx: usize,
    ) -> Result<Vec<Vec<u8>>, IndexError> {
        let frame = self.frame(coding_idx)?;
        let active = self.parameter_sets.active_at(coding_idx);

        if let Some(missing) = frame
            .references
            .iter()
            .find(|reference| !active.contains_key(reference))
        {
            return Err(IndexError::ParameterSetMissingForSeek {
                coding_idx,
                kind: missing.kind,
                id: missing.id,
            });
        }

        Ok(active.values().map(|nal| nal.data.to_vec()).collect())
    }

    /// The VPS, SPS and PPS NAL units active at the first frame, each with a
    /// four byte start code. Empty if no frame was indexed.
    pub fn extradata(&self) -> Vec<u8> {
        if self.frames.is_empty() {
            return Vec::new();
        }

        let mut out = Vec::new();
        for (parameter_set, nal) in self.parameter_sets.active_at(0) {
            if parameter_set.kind == ParameterSetKind::Aps {
                continue;
            }
            out.extend_from_slice(&EXTRADATA_START_CODE);
            out.extend_from_slice(&nal.data);
        }

        out
    }

    /// Everything needed to show the frame at `target_display_idx`.
    pub fn seek_point(&self, target_display_idx: usize) -> Result<SeekPoint, IndexError> {
        let coding_idx = self.closest_seekable_frame_before(target_display_idx)?;

        Ok(SeekPoint {
            coding_idx,
            display_idx: self.display_index_of(coding_idx)?,
            byte_range: self.frame_byte_range(coding_idx)?,
            parameter_sets: self.active_parameter_sets_for_seek(coding_idx)?,
        })
    }
}
