// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

#![no_main]

use annexb_index::Codec;
use annexb_index::IndexerConfig;
use annexb_index::StreamIndexer;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let config = IndexerConfig {
        codec: Some(Codec::Avc),
        trace: true,
        ..Default::default()
    };

    if let Ok(index) = StreamIndexer::new(config).index_bytes(data) {
        for display_idx in 0..index.frames.len() {
            let _ = index.seek(display_idx);
        }
    }
});
