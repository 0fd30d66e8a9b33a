// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Indexing of H.264, H.265 and H.266 Annex B elementary streams.
//!
//! The stream is split into NAL units, the parameter sets are parsed and the
//! slices are peeked far enough to group them into pictures with a picture
//! order count. The resulting [`FrameIndex`] tells where to resume decoding
//! to reach any frame and which parameter sets to send to the decoder first.
//!
//! ```no_run
//! use annexb_index::IndexerConfig;
//! use annexb_index::StreamIndexer;
//!
//! let stream = std::fs::read("video.h265").unwrap();
//! let index = StreamIndexer::new(IndexerConfig::default())
//!     .index_bytes(&stream)
//!     .unwrap();
//! let seek = index.seek(120).unwrap();
//! ```

pub mod bitstream_utils;
pub mod codec;
pub mod index;
pub mod indexer;
pub mod stream_info;
pub mod trace;
pub mod utils;

pub use codec::Codec;
pub use codec::NalEvent;
pub use codec::NalHeader;
pub use codec::ParameterSetKind;
pub use codec::ParameterSetRef;
pub use codec::ParseError;
pub use index::FrameEntry;
pub use index::FrameIndex;
pub use index::IndexError;
pub use index::SeekPoint;
pub use indexer::IndexerConfig;
pub use indexer::IndexerHandle;
pub use indexer::ScanOutcome;
pub use indexer::StreamIndex;
pub use indexer::StreamIndexer;
pub use stream_info::PixelFormat;
pub use stream_info::Ratio;
pub use stream_info::Resolution;
pub use stream_info::StreamInfo;
