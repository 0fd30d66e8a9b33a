// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Format of a stream, as signalled by the parameter sets of its first
//! picture.

use std::fmt;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Chroma subsampling, from `chroma_format_idc`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ChromaFormat {
    Monochrome,
    Yuv420,
    Yuv422,
    Yuv444,
}

impl ChromaFormat {
    pub fn from_idc(chroma_format_idc: u8) -> Option<Self> {
        match chroma_format_idc {
            0 => Some(ChromaFormat::Monochrome),
            1 => Some(ChromaFormat::Yuv420),
            2 => Some(ChromaFormat::Yuv422),
            3 => Some(ChromaFormat::Yuv444),
            _ => None,
        }
    }
}

impl fmt::Display for ChromaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChromaFormat::Monochrome => "4:0:0",
            ChromaFormat::Yuv420 => "4:2:0",
            ChromaFormat::Yuv422 => "4:2:2",
            ChromaFormat::Yuv444 => "4:4:4",
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PixelFormat {
    pub chroma_format: ChromaFormat,
    pub bit_depth_luma: u8,
    pub bit_depth_chroma: u8,
}

impl PixelFormat {
    pub fn new(chroma_format_idc: u8, bit_depth_luma: u8, bit_depth_chroma: u8) -> Option<Self> {
        Some(Self {
            chroma_format: ChromaFormat::from_idc(chroma_format_idc)?,
            bit_depth_luma,
            bit_depth_chroma,
        })
    }
}

/// A rational number, e.g. a frame rate in frames per second.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Ratio {
    pub num: u64,
    pub den: u64,
}

impl Ratio {
    pub fn new(num: u64, den: u64) -> Self {
        Self { num, den }
    }

    pub fn as_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }
}

impl fmt::Display for Ratio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Sample aspect ratios of Table E-1 of H.264, also used by H.265 and H.266,
/// indexed by `aspect_ratio_idc - 1`.
const SAMPLE_ASPECT_RATIOS: [(u64, u64); 16] = [
    (1, 1),
    (12, 11),
    (10, 11),
    (16, 11),
    (40, 33),
    (24, 11),
    (20, 11),
    (32, 11),
    (80, 33),
    (18, 11),
    (15, 11),
    (64, 33),
    (160, 99),
    (4, 3),
    (3, 2),
    (2, 1),
];

/// aspect_ratio_idc value for an explicit sar_width:sar_height.
const EXTENDED_SAR: u8 = 255;

/// The sample aspect ratio signalled by `aspect_ratio_idc`, or `None` if it
/// is unspecified or reserved.
pub fn sample_aspect_ratio(
    aspect_ratio_idc: u8,
    sar_width: u16,
    sar_height: u16,
) -> Option<Ratio> {
    match aspect_ratio_idc {
        EXTENDED_SAR if sar_width != 0 && sar_height != 0 => {
            Some(Ratio::new(u64::from(sar_width), u64::from(sar_height)))
        }
        1..=16 => {
            let (num, den) = SAMPLE_ASPECT_RATIOS[usize::from(aspect_ratio_idc - 1)];
            Some(Ratio::new(num, den))
        }
        _ => None,
    }
}

/// Format properties a decoder or a container muxer needs up front.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamInfo {
    /// Size of the decoded pictures.
    pub coded_size: Resolution,
    /// Size once the cropping or conformance window is applied.
    pub display_size: Resolution,
    /// `None` for a reserved `chroma_format_idc`.
    pub pixel_format: Option<PixelFormat>,
    /// `general_profile_idc`, or `profile_idc` for H.264. 0 when the SPS
    /// carries no profile.
    pub profile_idc: u8,
    pub level_idc: u8,
    /// Frames per second, from the VUI of H.264 or the VPS timing of H.265
    /// and H.266. `None` when not signalled.
    pub frame_rate: Option<Ratio>,
    /// From the VUI of H.264. The VUI of H.265 and H.266 comes after syntax
    /// that is not parsed, so it is `None` for them.
    pub sample_aspect_ratio: Option<Ratio>,
}

/// Size left once `left + right` and `top + bottom` units of `unit_x` by
/// `unit_y` samples are cropped from `coded`.
pub(crate) fn cropped_size(
    coded: Resolution,
    (unit_x, unit_y): (u32, u32),
    (left, right, top, bottom): (u32, u32, u32, u32),
) -> Resolution {
    let crop = |size: u32, unit: u32, a: u32, b: u32| {
        a.checked_add(b)
            .and_then(|offset| offset.checked_mul(unit))
            .map_or(0, |offset| size.saturating_sub(offset))
    };

    Resolution {
        width: crop(coded.width, unit_x, left, right),
        height: crop(coded.height, unit_y, top, bottom),
    }
}

/// SubWidthC and SubHeightC of H.265 and H.266 for `chroma_format_idc`.
pub(crate) fn sub_width_height_c(chroma_format_idc: u8, separate_colour_plane: bool) -> (u32, u32) {
    match (chroma_format_idc, separate_colour_plane) {
        (1, false) => (2, 2),
        (2, false) => (2, 1),
        _ => (1, 1),
    }
}
