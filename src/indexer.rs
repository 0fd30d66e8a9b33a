// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Scanning of whole Annex B streams into a [`StreamIndex`].
//!
//! [`StreamIndexer`] runs the scan on the calling thread, either over an
//! in-memory stream or over anything implementing [`Read`]. [`IndexerHandle`]
//! runs the same scan on a worker thread that can be cancelled.
//!
//! Errors in individual NAL units never abort a scan: they are logged, counted
//! in [`ScanStats`] and the unit is skipped. Only I/O errors of the byte source
//! end a scan early.

use std::io::ErrorKind;
use std::io::Read;
use std::ops::ControlFlow;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use anyhow::anyhow;
use anyhow::Context;
use bytes::Bytes;

use crate::codec::Codec;
use crate::codec::NalEvent;
use crate::codec::NalHandler;
use crate::codec::NalHeader;
use crate::codec::ParseError;
use crate::codec::PictureInfo;
use crate::index::FrameEntry;
use crate::index::FrameIndex;
use crate::index::IndexError;
use crate::index::RetainedNal;
use crate::index::SeekPoint;
use crate::stream_info::StreamInfo;
use crate::trace::SyntaxTrace;
use crate::utils::nalu::Nalu;
use crate::utils::NalIterator;
use crate::utils::StartCodeScanner;

#[cfg(feature = "h264")]
use crate::codec::h264::picture::PictureParser as AvcPictureParser;
#[cfg(feature = "h265")]
use crate::codec::h265::picture::PictureParser as HevcPictureParser;
#[cfg(feature = "h266")]
use crate::codec::h266::picture::PictureParser as VvcPictureParser;

const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub struct IndexerConfig {
    /// Codec of the stream, detected from its first NAL units if `None`.
    pub codec: Option<Codec>,
    /// Number of bytes read from the source at a time.
    pub chunk_size: usize,
    /// Stop once this many frames are indexed.
    pub frame_limit: Option<usize>,
    /// Record a syntax trace of every parsed NAL unit.
    pub trace: bool,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            codec: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            frame_limit: None,
            trace: false,
        }
    }
}

/// How a scan ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanOutcome {
    /// The whole stream was scanned.
    Completed,
    /// The scan was cancelled. The index holds the frames found so far.
    Cancelled,
    /// [`IndexerConfig::frame_limit`] frames were indexed.
    FrameLimitReached,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// NAL units with a valid header.
    pub nal_units: usize,
    pub parameter_sets: usize,
    pub pictures: usize,
    /// NAL units skipped because their header could not be parsed.
    pub malformed_headers: usize,
    /// NAL units skipped because their payload could not be parsed.
    pub parse_errors: usize,
    /// Pictures left out of the index because their POC was already indexed.
    pub rejected_frames: usize,
    /// Bytes read from the stream.
    pub bytes: u64,
}

/// What the scan made of one NAL unit.
#[derive(Debug, PartialEq, Eq)]
pub struct NalSummary {
    pub sc_offset: u64,
    pub offset: u64,
    pub size: usize,
    pub header: NalHeader,
    pub outcome: Result<NalEvent, ParseError>,
    /// Syntax elements read from the unit, if tracing was enabled.
    pub trace: Option<SyntaxTrace>,
}

/// The result of a scan.
#[derive(Debug)]
pub struct StreamIndex {
    pub codec: Codec,
    pub frames: FrameIndex,
    /// First slice of every random access frame, in coding order.
    pub random_access_slices: Vec<RetainedNal>,
    /// Every NAL unit with a valid header, in stream order.
    pub nal_units: Vec<NalSummary>,
    pub stats: ScanStats,
    pub outcome: ScanOutcome,
    /// Format of the stream, `None` if no picture was found.
    pub info: Option<StreamInfo>,
}

impl StreamIndex {
    /// Where to resume decoding to show the frame at `target_display_idx`.
    pub fn seek(&self, target_display_idx: usize) -> Result<SeekPoint, IndexError> {
        self.frames.seek_point(target_display_idx)
    }

    /// The parameter sets of the first frame, for a container or a decoder
    /// that needs them up front.
    pub fn extradata(&self) -> Vec<u8> {
        self.frames.extradata()
    }
}

/// The frame the last slices were added to.
#[derive(Debug)]
struct CurrentFrame {
    coding_idx: usize,
    /// POC of the last picture, as derived by the codec.
    picture_poc: i32,
    /// Layer of the last picture.
    layer_id: u8,
}

/// Per stream scan state, fed one NAL unit at a time.
struct Scan<P: NalHandler> {
    codec: Codec,
    handler: P,
    frame_limit: Option<usize>,
    frames: FrameIndex,
    random_access_slices: Vec<RetainedNal>,
    nal_units: Vec<NalSummary>,
    stats: ScanStats,
    /// Number of POC resets so far. Picture order counts restart with every
    /// coded video sequence, so the index orders frames by sequence first.
    sequence: i64,
    current_frame: Option<CurrentFrame>,
    /// Start code offset of NAL units that open the next picture.
    prefix_start: Option<u64>,
}

impl<P: NalHandler + Default> Scan<P> {
    fn new(codec: Codec, config: &IndexerConfig) -> Self {
        let mut handler = P::default();
        handler.set_trace(config.trace);

        Self {
            codec,
            handler,
            frame_limit: config.frame_limit,
            frames: Default::default(),
            random_access_slices: Default::default(),
            nal_units: Default::default(),
            stats: Default::default(),
            sequence: 0,
            current_frame: None,
            prefix_start: None,
        }
    }
}

impl<P: NalHandler> Scan<P> {
    fn malformed(&mut self, err: ParseError) {
        log::debug!("Skipping NAL unit with malformed header: {}", err);
        self.stats.malformed_headers += 1;
    }

    fn extend_frame(&mut self, coding_idx: usize, end: u64) {
        if let Err(err) = self.frames.extend_frame(coding_idx, end) {
            log::warn!("Cannot extend frame {} to offset {}: {}", coding_idx, end, err);
        }
    }

    fn feed(&mut self, nalu: &Nalu<'_, P::Header>) -> ControlFlow<ScanOutcome> {
        self.stats.nal_units += 1;

        let header: NalHeader = nalu.header().clone().into();
        let outcome = self.handler.handle(nalu);
        let trace = self.handler.take_trace();

        let mut flow = ControlFlow::Continue(());
        match &outcome {
            Ok(NalEvent::ParameterSet(parameter_set)) => {
                self.stats.parameter_sets += 1;
                self.frames.retain_parameter_set(
                    *parameter_set,
                    RetainedNal {
                        offset: nalu.offset(),
                        data: Bytes::copy_from_slice(nalu.data()),
                    },
                );
            }
            Ok(NalEvent::PictureStart(info)) => {
                flow = self.start_picture(nalu, header.layer_id(), info);
            }
            Ok(NalEvent::SliceContinuation) => {
                if let Some(coding_idx) = self.current_frame.as_ref().map(|c| c.coding_idx) {
                    self.extend_frame(coding_idx, nalu.end_offset());
                }
            }
            // A picture header without slices is dropped with its picture.
            Ok(NalEvent::PicturePrefix) => {
                self.prefix_start = Some(nalu.sc_offset());
            }
            Ok(NalEvent::EndOfSequence) => {
                self.prefix_start = None;
            }
            Ok(NalEvent::Other) => (),
            Err(err) => {
                self.stats.parse_errors += 1;
                if header.is_parameter_set() {
                    log::warn!(
                        "Rejecting parameter set at offset {} ({}): {}",
                        nalu.offset(),
                        header,
                        err
                    );
                } else {
                    log::debug!(
                        "Skipping NAL unit at offset {} ({}): {}",
                        nalu.offset(),
                        header,
                        err
                    );
                }
            }
        }

        self.nal_units.push(NalSummary {
            sc_offset: nalu.sc_offset(),
            offset: nalu.offset(),
            size: nalu.size(),
            header,
            outcome,
            trace,
        });

        flow
    }

    fn start_picture(
        &mut self,
        nalu: &Nalu<'_, P::Header>,
        layer_id: u8,
        info: &PictureInfo,
    ) -> ControlFlow<ScanOutcome> {
        self.stats.pictures += 1;

        // Pictures of higher layers with the same POC share the access unit,
        // and the frame, of the picture before them.
        if let Some(current) = self.current_frame.as_mut() {
            if current.picture_poc == info.poc && layer_id > current.layer_id {
                current.layer_id = layer_id;
                let coding_idx = current.coding_idx;
                self.extend_frame(coding_idx, nalu.end_offset());
                self.prefix_start = None;
                return ControlFlow::Continue(());
            }
        }

        if self.frame_limit.is_some_and(|limit| self.frames.len() >= limit) {
            log::debug!("Frame limit reached at offset {}", nalu.sc_offset());
            return ControlFlow::Break(ScanOutcome::FrameLimitReached);
        }

        if info.poc_reset && !self.frames.is_empty() {
            self.sequence += 1;
        }

        let poc = (self.sequence << 32) + i64::from(info.poc);
        let start = self.prefix_start.take().unwrap_or(nalu.sc_offset());

        let entry = FrameEntry {
            poc,
            byte_range: start..nalu.end_offset(),
            is_random_access_point: info.is_random_access_point,
            references: info.references.clone(),
        };

        match self.frames.add_entry(entry) {
            Ok(coding_idx) => {
                log::trace!(
                    "Frame {} at offset {}: POC {}{}",
                    coding_idx,
                    start,
                    info.poc,
                    if info.is_random_access_point {
                        ", random access point"
                    } else {
                        ""
                    }
                );

                if info.is_random_access_point {
                    self.random_access_slices.push(RetainedNal {
                        offset: nalu.offset(),
                        data: Bytes::copy_from_slice(nalu.data()),
                    });
                }

                self.current_frame = Some(CurrentFrame {
                    coding_idx,
                    picture_poc: info.poc,
                    layer_id,
                });
            }
            Err(err) => {
                log::debug!(
                    "Rejecting picture at offset {}: {}",
                    nalu.sc_offset(),
                    err
                );
                self.stats.rejected_frames += 1;
                self.current_frame = None;
            }
        }

        ControlFlow::Continue(())
    }

    fn finish(mut self, outcome: ScanOutcome, bytes: u64) -> StreamIndex {
        self.stats.bytes = bytes;

        log::debug!(
            "{} scan {:?}: {} frames out of {} pictures, {} NAL units, {} parameter sets, {} malformed headers, {} parse errors",
            self.codec,
            outcome,
            self.frames.len(),
            self.stats.pictures,
            self.stats.nal_units,
            self.stats.parameter_sets,
            self.stats.malformed_headers,
            self.stats.parse_errors
        );

        let info = self.handler.stream_info();
        if let Some(info) = &info {
            log::debug!(
                "{} stream of {} pictures ({} coded), profile {} level {}",
                self.codec,
                info.display_size,
                info.coded_size,
                info.profile_idc,
                info.level_idc
            );
        }

        StreamIndex {
            codec: self.codec,
            frames: self.frames,
            random_access_slices: self.random_access_slices,
            nal_units: self.nal_units,
            stats: self.stats,
            outcome,
            info,
        }
    }
}

/// Reads into `buf` until it is full or the source is exhausted.
fn read_chunk<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut len = 0;
    while len < buf.len() {
        match reader.read(&mut buf[len..]) {
            Ok(0) => break,
            Ok(n) => len += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(len)
}

/// Builds the [`StreamIndex`] of an Annex B stream.
pub struct StreamIndexer {
    config: IndexerConfig,
    cancelled: Arc<AtomicBool>,
}

impl StreamIndexer {
    pub fn new(config: IndexerConfig) -> Self {
        Self::with_cancel_flag(config, Default::default())
    }

    /// Creates an indexer that stops scanning once `cancelled` is set.
    pub fn with_cancel_flag(config: IndexerConfig, cancelled: Arc<AtomicBool>) -> Self {
        Self { config, cancelled }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    fn codec_of(&self, data: &[u8]) -> anyhow::Result<Codec> {
        match self.config.codec {
            Some(codec) => Ok(codec),
            None => Codec::detect(data)
                .ok_or_else(|| anyhow!("could not detect the codec of the stream")),
        }
    }

    /// Scans an in-memory stream.
    pub fn index_bytes(&self, data: &[u8]) -> anyhow::Result<StreamIndex> {
        let codec = self.codec_of(data)?;
        log::debug!("Indexing {} bytes of {} stream", data.len(), codec);

        match codec {
            #[cfg(feature = "h264")]
            Codec::Avc => Ok(self.scan_bytes::<AvcPictureParser>(codec, data)),
            #[cfg(feature = "h265")]
            Codec::Hevc => Ok(self.scan_bytes::<HevcPictureParser>(codec, data)),
            #[cfg(feature = "h266")]
            Codec::Vvc => Ok(self.scan_bytes::<VvcPictureParser>(codec, data)),
            #[allow(unreachable_patterns)]
            codec => Err(anyhow!("support for {} is not enabled", codec)),
        }
    }

    /// Scans a stream read in chunks of [`IndexerConfig::chunk_size`] bytes.
    pub fn index_reader<R: Read>(&self, mut reader: R) -> anyhow::Result<StreamIndex> {
        let mut chunk = vec![0u8; self.config.chunk_size.max(1)];
        let len = read_chunk(&mut reader, &mut chunk).context("failed to read the stream")?;

        let codec = self.codec_of(&chunk[..len])?;
        log::debug!("Indexing {} stream", codec);

        match codec {
            #[cfg(feature = "h264")]
            Codec::Avc => self.scan_reader::<AvcPictureParser, R>(codec, reader, chunk, len),
            #[cfg(feature = "h265")]
            Codec::Hevc => self.scan_reader::<HevcPictureParser, R>(codec, reader, chunk, len),
            #[cfg(feature = "h266")]
            Codec::Vvc => self.scan_reader::<VvcPictureParser, R>(codec, reader, chunk, len),
            #[allow(unreachable_patterns)]
            codec => Err(anyhow!("support for {} is not enabled", codec)),
        }
    }

    fn scan_bytes<P: NalHandler + Default>(&self, codec: Codec, data: &[u8]) -> StreamIndex {
        let mut scan = Scan::<P>::new(codec, &self.config);

        for nalu in NalIterator::<P::Header>::new(data) {
            if self.is_cancelled() {
                return scan.finish(ScanOutcome::Cancelled, data.len() as u64);
            }

            match nalu {
                Ok(nalu) => {
                    if let ControlFlow::Break(outcome) = scan.feed(&nalu) {
                        return scan.finish(outcome, data.len() as u64);
                    }
                }
                Err(err) => scan.malformed(err),
            }
        }

        scan.finish(ScanOutcome::Completed, data.len() as u64)
    }

    fn scan_reader<P: NalHandler + Default, R: Read>(
        &self,
        codec: Codec,
        mut reader: R,
        mut chunk: Vec<u8>,
        mut len: usize,
    ) -> anyhow::Result<StreamIndex> {
        let mut scanner = StartCodeScanner::new();
        let mut scan = Scan::<P>::new(codec, &self.config);

        loop {
            if self.is_cancelled() {
                return Ok(scan.finish(ScanOutcome::Cancelled, scanner.bytes_consumed()));
            }

            let spans = if len == 0 {
                scanner.finish().into_iter().collect()
            } else {
                scanner.push(&chunk[..len])
            };

            for span in spans {
                if self.is_cancelled() {
                    return Ok(scan.finish(ScanOutcome::Cancelled, scanner.bytes_consumed()));
                }

                match Nalu::<P::Header>::from_span(span) {
                    Ok(nalu) => {
                        if let ControlFlow::Break(outcome) = scan.feed(&nalu) {
                            return Ok(scan.finish(outcome, scanner.bytes_consumed()));
                        }
                    }
                    Err(err) => scan.malformed(err),
                }
            }

            if len == 0 {
                break;
            }

            len = read_chunk(&mut reader, &mut chunk).with_context(|| {
                format!(
                    "failed to read the stream at offset {}",
                    scanner.bytes_consumed()
                )
            })?;
        }

        Ok(scan.finish(ScanOutcome::Completed, scanner.bytes_consumed()))
    }
}

/// A scan running on a worker thread.
pub struct IndexerHandle {
    cancelled: Arc<AtomicBool>,
    worker_thread: JoinHandle<anyhow::Result<StreamIndex>>,
}

impl IndexerHandle {
    /// Starts scanning `source` on a new thread.
    pub fn spawn<R: Read + Send + 'static>(
        source: R,
        config: IndexerConfig,
    ) -> anyhow::Result<Self> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let indexer = StreamIndexer::with_cancel_flag(config, Arc::clone(&cancelled));

        let worker_thread = thread::Builder::new()
            .name("annexb-indexer".into())
            .spawn(move || indexer.index_reader(source))
            .context("failed to spawn the indexer thread")?;

        Ok(Self {
            cancelled,
            worker_thread,
        })
    }

    /// Asks the worker to stop after the NAL unit it is processing.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_finished(&self) -> bool {
        self.worker_thread.is_finished()
    }

    /// Waits for the scan to end and returns its result.
    pub fn join(self) -> anyhow::Result<StreamIndex> {
        self.worker_thread
            .join()
            .map_err(|_| anyhow!("the indexer thread panicked"))?
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    use crate::codec::ParameterSetKind;
    use crate::codec::ParameterSetRef;
    use crate::stream_info::Ratio;
    use crate::stream_info::Resolution;

    /// A reader that fails after yielding `data`.
    struct FailingReader {
        data: Cursor<Vec<u8>>,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.data.read(buf)? {
                0 => Err(std::io::Error::new(ErrorKind::Other, "device unplugged")),
                n => Ok(n),
            }
        }
    }

    #[cfg(feature = "h264")]
    mod avc {
        use super::*;

        use crate::codec::h264::parser::tests::nal;
        use crate::codec::h264::parser::tests::pps_rbsp;
        use crate::codec::h264::parser::tests::sps_rbsp;
        use crate::codec::h264::parser::tests::PocFields;
        use crate::codec::h264::parser::tests::TestSlice;
        use crate::codec::h264::parser::NaluType;

        fn slice(first_mb: u32, frame_num: u32, idr: bool, lsb: u32) -> Vec<u8> {
            let slice = TestSlice {
                first_mb,
                frame_num,
                idr_pic_id: idr.then_some(0),
                poc: PocFields::Lsb(lsb),
                ..Default::default()
            };
            let type_ = if idr {
                NaluType::SliceIdr
            } else {
                NaluType::Slice
            };

            nal(type_, 1, &slice.rbsp())
        }

        /// Two GOPs of I P B B, each opened by an IDR, with two slices per
        /// picture.
        pub(super) fn stream() -> Vec<u8> {
            let mut stream = Vec::new();
            for _ in 0..2 {
                stream.extend(nal(NaluType::Sps, 3, &sps_rbsp(0, 0, true)));
                stream.extend(nal(NaluType::Pps, 3, &pps_rbsp(0, 0, false)));
                for (frame_num, idr, lsb) in [(0, true, 0), (1, false, 6), (2, false, 2), (2, false, 4)] {
                    stream.extend(slice(0, frame_num, idr, lsb));
                    stream.extend(slice(60, frame_num, idr, lsb));
                }
            }
            stream
        }

        #[test]
        fn index_stream() {
            let stream = stream();
            let index = StreamIndexer::new(Default::default())
                .index_bytes(&stream)
                .unwrap();

            assert_eq!(index.codec, Codec::Avc);
            assert_eq!(index.outcome, ScanOutcome::Completed);
            assert_eq!(index.frames.len(), 8);
            assert_eq!(index.stats.pictures, 8);
            assert_eq!(index.stats.parameter_sets, 4);
            assert_eq!(index.stats.nal_units, 20);
            assert_eq!(index.nal_units.len(), 20);
            assert_eq!(index.random_access_slices.len(), 2);

            let pocs: Vec<i64> = index.frames.frames().iter().map(|f| f.poc).collect();
            let second = 1i64 << 32;
            assert_eq!(
                pocs,
                vec![0, 6, 2, 4, second, second + 6, second + 2, second + 4]
            );
            assert_eq!(index.frames.display_order(), vec![0, 2, 3, 1, 4, 6, 7, 5]);

            // Frames span both slices, from the first start code.
            let frames = index.frames.frames();
            assert_eq!(frames[0].byte_range.start, index.nal_units[2].sc_offset);
            assert_eq!(
                frames[0].byte_range.end,
                index.nal_units[3].offset + index.nal_units[3].size as u64
            );
            assert_eq!(frames[1].byte_range.start, frames[0].byte_range.end);

            // Display index 6 is the third picture of the second GOP.
            let seek = index.seek(6).unwrap();
            assert_eq!(seek.coding_idx, 4);
            assert_eq!(seek.display_idx, 4);
            assert_eq!(seek.byte_range, frames[4].byte_range);
            let nal_data = |nal: &NalSummary| {
                let start = nal.offset as usize;
                stream[start..start + nal.size].to_vec()
            };
            assert_eq!(
                seek.parameter_sets,
                vec![nal_data(&index.nal_units[10]), nal_data(&index.nal_units[11])]
            );

            let info = index.info.as_ref().unwrap();
            assert_eq!(
                info.display_size,
                Resolution {
                    width: 1920,
                    height: 1080
                }
            );
            assert_eq!(info.coded_size.height, 1088);
            assert_eq!((info.profile_idc, info.level_idc), (100, 40));
            assert_eq!(info.frame_rate, None);

            let mut extradata = vec![0, 0, 0, 1];
            extradata.extend(nal_data(&index.nal_units[0]));
            extradata.extend([0, 0, 0, 1]);
            extradata.extend(nal_data(&index.nal_units[1]));
            assert_eq!(index.extradata(), extradata);
        }

        #[test]
        fn parameter_sets_only() {
            let mut stream = nal(NaluType::Sps, 3, &sps_rbsp(0, 0, true));
            stream.extend(nal(NaluType::Pps, 3, &pps_rbsp(0, 0, false)));

            let config = IndexerConfig {
                codec: Some(Codec::Avc),
                ..Default::default()
            };
            let index = StreamIndexer::new(config).index_bytes(&stream).unwrap();

            assert!(index.frames.is_empty());
            assert_eq!(index.info, None);
            assert!(index.extradata().is_empty());
        }

        #[test]
        fn reader_matches_bytes() {
            let stream = stream();
            let from_bytes = StreamIndexer::new(Default::default())
                .index_bytes(&stream)
                .unwrap();

            // Chunks much smaller than the NAL units.
            let config = IndexerConfig {
                chunk_size: 7,
                ..Default::default()
            };
            let from_reader = StreamIndexer::new(config)
                .index_reader(Cursor::new(stream.clone()))
                .unwrap();

            assert_eq!(from_reader.frames.frames(), from_bytes.frames.frames());
            assert_eq!(from_reader.nal_units, from_bytes.nal_units);
            assert_eq!(from_reader.stats, from_bytes.stats);
            assert_eq!(from_reader.stats.bytes, stream.len() as u64);
        }

        #[test]
        fn malformed_header_is_skipped() {
            let clean = stream();
            let half = clean.len() / 2;
            let pos = half
                + clean[half..]
                    .windows(4)
                    .position(|w| w == [0, 0, 0, 1])
                    .unwrap();

            let mut stream = clean[..pos].to_vec();
            // forbidden_zero_bit set
            stream.extend([0, 0, 0, 1, 0x85, 0x11, 0x22]);
            stream.extend(&clean[pos..]);

            let index = StreamIndexer::new(Default::default())
                .index_bytes(&stream)
                .unwrap();

            assert_eq!(index.stats.malformed_headers, 1);
            assert_eq!(index.stats.nal_units, 20);
            assert_eq!(index.frames.len(), 8);
        }

        #[test]
        fn duplicate_poc_is_rejected() {
            let mut stream = nal(NaluType::Sps, 3, &sps_rbsp(0, 0, true));
            stream.extend(nal(NaluType::Pps, 3, &pps_rbsp(0, 0, false)));
            stream.extend(slice(0, 0, true, 0));
            stream.extend(slice(0, 1, false, 4));
            stream.extend(slice(0, 2, false, 4));
            stream.extend(slice(60, 2, false, 4));
            stream.extend(slice(0, 3, false, 8));

            let index = StreamIndexer::new(Default::default())
                .index_bytes(&stream)
                .unwrap();

            assert_eq!(index.stats.pictures, 4);
            assert_eq!(index.stats.rejected_frames, 1);
            let pocs: Vec<i64> = index.frames.frames().iter().map(|f| f.poc).collect();
            assert_eq!(pocs, vec![0, 4, 8]);
            // The slices of the rejected picture do not extend the one before.
            assert_eq!(
                index.frames.frames()[1].byte_range.end,
                index.nal_units[3].offset + index.nal_units[3].size as u64
            );
        }

        #[test]
        fn frame_limit() {
            let config = IndexerConfig {
                frame_limit: Some(3),
                ..Default::default()
            };
            let index = StreamIndexer::new(config)
                .index_bytes(&stream())
                .unwrap();

            assert_eq!(index.outcome, ScanOutcome::FrameLimitReached);
            assert_eq!(index.frames.len(), 3);
            // The last frame got both of its slices.
            assert_eq!(index.stats.nal_units, 9);
        }

        #[test]
        fn cancelled_before_start() {
            let cancelled = Arc::new(AtomicBool::new(true));
            let index = StreamIndexer::with_cancel_flag(Default::default(), cancelled)
                .index_bytes(&stream())
                .unwrap();

            assert_eq!(index.outcome, ScanOutcome::Cancelled);
            assert!(index.frames.is_empty());
        }

        #[test]
        fn trace() {
            let config = IndexerConfig {
                trace: true,
                ..Default::default()
            };
            let index = StreamIndexer::new(config)
                .index_bytes(&stream())
                .unwrap();

            let sps_trace = index.nal_units[0].trace.as_ref().unwrap();
            assert_eq!(sps_trace.value_of("profile_idc"), Some(100));
            assert_eq!(sps_trace.value_of("pic_order_cnt_type"), Some(0));

            let untraced = StreamIndexer::new(Default::default())
                .index_bytes(&stream())
                .unwrap();
            assert!(untraced.nal_units.iter().all(|nal| nal.trace.is_none()));
        }

        #[test]
        fn missing_parameter_sets() {
            let mut stream = slice(0, 0, true, 0);
            stream.extend(nal(NaluType::Sps, 3, &sps_rbsp(0, 0, true)));
            stream.extend(nal(NaluType::Pps, 3, &pps_rbsp(0, 0, false)));
            stream.extend(slice(0, 0, true, 0));

            let config = IndexerConfig {
                codec: Some(Codec::Avc),
                ..Default::default()
            };
            let index = StreamIndexer::new(config).index_bytes(&stream).unwrap();

            assert_eq!(index.stats.parse_errors, 1);
            assert!(matches!(
                index.nal_units[0].outcome,
                Err(ParseError::MissingParameterSet(_))
            ));
            assert_eq!(index.frames.len(), 1);
            assert_eq!(
                index.frames.frames()[0].references,
                vec![
                    ParameterSetRef::new(ParameterSetKind::Sps, 0),
                    ParameterSetRef::new(ParameterSetKind::Pps, 0)
                ]
            );
        }

        #[test]
        fn worker_thread() {
            let handle = IndexerHandle::spawn(Cursor::new(stream()), Default::default()).unwrap();
            let index = handle.join().unwrap();

            assert_eq!(index.outcome, ScanOutcome::Completed);
            assert_eq!(index.frames.len(), 8);
        }

        #[test]
        fn read_error() {
            let reader = FailingReader {
                data: Cursor::new(stream()),
            };
            let config = IndexerConfig {
                chunk_size: 16,
                ..Default::default()
            };

            let err = StreamIndexer::new(config).index_reader(reader).unwrap_err();
            assert!(err.to_string().starts_with("failed to read the stream at offset"));
        }
    }

    #[cfg(feature = "h265")]
    mod hevc {
        use super::*;

        use crate::codec::h265::parser::tests::nal;
        use crate::codec::h265::parser::tests::pps_rbsp;
        use crate::codec::h265::parser::tests::slice_rbsp;
        use crate::codec::h265::parser::tests::sps_rbsp;
        use crate::codec::h265::parser::tests::vps_rbsp;
        use crate::codec::h265::parser::NaluType;

        fn slice(type_: NaluType, first: bool, poc_lsb: u32) -> Vec<u8> {
            nal(type_, 0, 0, &slice_rbsp(type_, first, poc_lsb))
        }

        #[test]
        fn index_stream() {
            let mut stream = nal(NaluType::VpsNut, 0, 0, &vps_rbsp(0));
            stream.extend(nal(NaluType::SpsNut, 0, 0, &sps_rbsp(0, 8)));
            stream.extend(nal(NaluType::PpsNut, 0, 0, &pps_rbsp(0, 0)));
            stream.extend(slice(NaluType::IdrWRadl, true, 0));
            stream.extend(slice(NaluType::IdrWRadl, false, 0));
            stream.extend(slice(NaluType::TrailR, true, 8));
            stream.extend(slice(NaluType::TrailN, true, 4));
            // A CRA in the middle of the sequence continues the POC.
            stream.extend(slice(NaluType::CraNut, true, 16));
            stream.extend(slice(NaluType::RaslN, true, 12));
            stream.extend(slice(NaluType::TrailR, true, 20));

            let index = StreamIndexer::new(Default::default())
                .index_bytes(&stream)
                .unwrap();

            assert_eq!(index.codec, Codec::Hevc);
            let frames = index.frames.frames();
            let pocs: Vec<i64> = frames.iter().map(|f| f.poc).collect();
            assert_eq!(pocs, vec![0, 8, 4, 16, 12, 20]);
            let raps: Vec<bool> = frames.iter().map(|f| f.is_random_access_point).collect();
            assert_eq!(raps, vec![true, false, false, true, false, false]);

            // POC 12 is shown before the CRA, decoding starts at the IDR.
            assert_eq!(index.frames.closest_seekable_frame_before(3), Ok(0));
            assert_eq!(index.frames.closest_seekable_frame_before(4), Ok(3));

            let seek = index.seek(5).unwrap();
            assert_eq!(seek.coding_idx, 3);
            assert_eq!(seek.parameter_sets.len(), 3);
            assert_eq!(seek.parameter_sets[0][..2], [0x40, 0x01]);

            let info = index.info.as_ref().unwrap();
            assert_eq!(info.frame_rate, Some(Ratio::new(60000, 1001)));
            assert_eq!(info.level_idc, 120);

            // VPS, SPS and PPS with start codes.
            let extradata: Vec<u8> = seek
                .parameter_sets
                .iter()
                .flat_map(|nal| [0, 0, 0, 1].into_iter().chain(nal.iter().copied()))
                .collect();
            assert_eq!(index.extradata(), extradata);
        }
    }

    #[cfg(feature = "h266")]
    mod vvc {
        use super::*;

        use crate::codec::h266::parser::tests::nal;
        use crate::codec::h266::parser::tests::picture_header_rbsp;
        use crate::codec::h266::parser::tests::pps_rbsp;
        use crate::codec::h266::parser::tests::slice_rbsp;
        use crate::codec::h266::parser::tests::sps_rbsp;
        use crate::codec::h266::parser::NaluType;

        #[test]
        fn picture_headers_open_frames() {
            let mut stream = nal(NaluType::SpsNut, 0, 0, &sps_rbsp(0, 0, false));
            stream.extend(nal(NaluType::PpsNut, 0, 0, &pps_rbsp(0, 0)));
            let mut ph_offsets = Vec::new();
            for (type_, lsb) in [
                (NaluType::IdrNLp, 0),
                (NaluType::TrailNut, 2),
                (NaluType::TrailNut, 1),
            ] {
                let irap = type_ == NaluType::IdrNLp;
                ph_offsets.push(stream.len() as u64);
                stream.extend(nal(NaluType::PhNut, 0, 0, &picture_header_rbsp(irap, 0, lsb)));
                stream.extend(nal(type_, 0, 0, &slice_rbsp(None)));
                stream.extend(nal(type_, 0, 0, &slice_rbsp(None)));
            }

            let config = IndexerConfig {
                codec: Some(Codec::Vvc),
                ..Default::default()
            };
            let index = StreamIndexer::new(config).index_bytes(&stream).unwrap();

            let frames = index.frames.frames();
            let pocs: Vec<i64> = frames.iter().map(|f| f.poc).collect();
            assert_eq!(pocs, vec![0, 2, 1]);
            let starts: Vec<u64> = frames.iter().map(|f| f.byte_range.start).collect();
            assert_eq!(starts, ph_offsets);
            assert_eq!(frames[2].byte_range.end, stream.len() as u64);
            assert_eq!(index.random_access_slices.len(), 1);
        }

        #[test]
        fn prefix_aps_after_picture_header() {
            let mut stream = nal(NaluType::SpsNut, 0, 0, &sps_rbsp(0, 0, false));
            stream.extend(nal(NaluType::PpsNut, 0, 0, &pps_rbsp(0, 0)));
            let ph_offset = stream.len() as u64;
            stream.extend(nal(NaluType::PhNut, 0, 0, &picture_header_rbsp(true, 0, 0)));
            // LMCS APS 2
            stream.extend(nal(NaluType::PrefixApsNut, 0, 0, &[0x22, 0x80]));
            stream.extend(nal(NaluType::IdrWRadl, 0, 0, &slice_rbsp(None)));

            let config = IndexerConfig {
                codec: Some(Codec::Vvc),
                ..Default::default()
            };
            let index = StreamIndexer::new(config).index_bytes(&stream).unwrap();

            assert_eq!(index.stats.parameter_sets, 3);
            assert_eq!(index.frames.len(), 1);
            assert_eq!(
                index.frames.frames()[0].byte_range,
                ph_offset..stream.len() as u64
            );
        }

        #[test]
        fn layers_share_a_frame() {
            let mut stream = nal(NaluType::SpsNut, 0, 0, &sps_rbsp(0, 0, false));
            stream.extend(nal(NaluType::PpsNut, 0, 0, &pps_rbsp(0, 0)));
            for (type_, lsb) in [(NaluType::IdrNLp, 0), (NaluType::TrailNut, 1)] {
                let irap = type_ == NaluType::IdrNLp;
                for layer_id in [0, 1] {
                    stream.extend(nal(
                        type_,
                        layer_id,
                        0,
                        &slice_rbsp(Some((irap, 0, lsb))),
                    ));
                }
            }

            let config = IndexerConfig {
                codec: Some(Codec::Vvc),
                ..Default::default()
            };
            let index = StreamIndexer::new(config).index_bytes(&stream).unwrap();

            assert_eq!(index.stats.pictures, 4);
            assert_eq!(index.stats.rejected_frames, 0);
            let pocs: Vec<i64> = index.frames.frames().iter().map(|f| f.poc).collect();
            assert_eq!(pocs, vec![0, 1]);
            assert_eq!(
                index.frames.frames()[1].byte_range.end,
                stream.len() as u64
            );
        }
    }
}
