// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Pooled NVIDIA hardware video decode stage.
//!
//! The crate sits between a generic media pipeline and the vendor decode API. Compressed packets
//! pulled from an input [pid](filter::InputPid) are pushed to a hardware parser, decoded pictures
//! are reordered into presentation order and handed downstream either as host copies or as
//! lazily-mapped [frames](video_frame::HwFrame).
//!
//! The main entry point is [`decoder::NvDecoder`]. All instances in a process share one
//! [`environment::DecodeEnvironment`], which owns the GPU context and the
//! [pool](pool::DecoderPool) of idle hardware decoders.

pub mod backend;
pub mod config;
pub mod decoder;
pub mod environment;
pub mod filter;
pub mod pool;
pub mod utils;
pub mod video_frame;

use enumn::N;

use crate::utils::align_up;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self { width: value.0, height: value.1 }
    }
}

/// Codec types understood by the hardware parser. Values match the vendor enumeration.
#[derive(N, Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CodecType {
    Mpeg1 = 0,
    Mpeg2 = 1,
    Mpeg4 = 2,
    Vc1 = 3,
    #[default]
    H264 = 4,
    Hevc = 8,
    Vp8 = 9,
    Vp9 = 10,
    Av1 = 11,
}

impl CodecType {
    /// Display name used for the stage, e.g. `AVC|H264`.
    pub fn name(&self) -> &'static str {
        match self {
            CodecType::Mpeg1 => "MPEG-1",
            CodecType::Mpeg2 => "MPEG-2",
            CodecType::Mpeg4 => "MPEG-4 part2",
            CodecType::Vc1 => "VC1",
            CodecType::H264 => "AVC|H264",
            CodecType::Hevc => "HEVC",
            CodecType::Vp8 => "VP8",
            CodecType::Vp9 => "VP9",
            CodecType::Av1 => "AV1",
        }
    }
}

/// Chroma subsampling of a coded stream. Values match the vendor enumeration.
#[derive(N, Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ChromaFormat {
    Monochrome = 0,
    #[default]
    Yuv420 = 1,
    Yuv422 = 2,
    Yuv444 = 3,
}

/// Pixel formats the stage can deliver downstream.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Nv12,
    Nv12_10,
    Yuv422,
    Yuv422_10,
    Yuv444,
    Yuv444_10,
}

impl PixelFormat {
    /// Output format for a stream of `chroma` subsampling. Returns `None` for layouts we cannot
    /// represent (e.g. monochrome).
    pub fn for_chroma(chroma: ChromaFormat, high_bit_depth: bool) -> Option<Self> {
        match (chroma, high_bit_depth) {
            (ChromaFormat::Yuv420, false) => Some(PixelFormat::Nv12),
            (ChromaFormat::Yuv420, true) => Some(PixelFormat::Nv12_10),
            (ChromaFormat::Yuv422, false) => Some(PixelFormat::Yuv422),
            (ChromaFormat::Yuv422, true) => Some(PixelFormat::Yuv422_10),
            (ChromaFormat::Yuv444, false) => Some(PixelFormat::Yuv444),
            (ChromaFormat::Yuv444, true) => Some(PixelFormat::Yuv444_10),
            (ChromaFormat::Monochrome, _) => None,
        }
    }

    pub fn bytes_per_sample(&self) -> u32 {
        match self {
            PixelFormat::Nv12 | PixelFormat::Yuv422 | PixelFormat::Yuv444 => 1,
            PixelFormat::Nv12_10 | PixelFormat::Yuv422_10 | PixelFormat::Yuv444_10 => 2,
        }
    }

    pub fn is_high_bit_depth(&self) -> bool {
        self.bytes_per_sample() > 1
    }
}

/// Identifies which configuration a hardware decoder has been built for. Two decoders are
/// interchangeable only if every field matches.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ConfigKey {
    pub width: u32,
    pub height: u32,
    pub bpp_luma: u32,
    pub bpp_chroma: u32,
    pub codec: CodecType,
    pub chroma_format: ChromaFormat,
}

impl ConfigKey {
    pub fn resolution(&self) -> Resolution {
        Resolution::from((self.width, self.height))
    }
}

/// Memory layout of one decoded frame in host memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameLayout {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Bytes per luma row.
    pub stride: u32,
    /// Bytes per chroma row.
    pub stride_uv: u32,
    /// Rows per chroma plane.
    pub uv_height: u32,
    pub nb_planes: u32,
    /// Size of the whole frame.
    pub out_size: usize,
}

impl FrameLayout {
    /// Computes the tightly-packed layout for `format` at `width`x`height`.
    pub fn new(format: PixelFormat, width: u32, height: u32) -> Self {
        Self::with_stride(format, width, height, width * format.bytes_per_sample())
    }

    /// Computes the layout for `format` using an explicit luma `stride`.
    pub fn with_stride(format: PixelFormat, width: u32, height: u32, stride: u32) -> Self {
        let (stride_uv, uv_height, nb_planes) = match format {
            PixelFormat::Nv12 | PixelFormat::Nv12_10 => {
                (stride, align_up(height as usize, 2) as u32 / 2, 2)
            }
            PixelFormat::Yuv422 | PixelFormat::Yuv422_10 => {
                (align_up(stride as usize, 2) as u32 / 2, height, 3)
            }
            PixelFormat::Yuv444 | PixelFormat::Yuv444_10 => (stride, height, 3),
        };

        let luma_size = stride as usize * height as usize;
        let chroma_size = stride_uv as usize * uv_height as usize * (nb_planes as usize - 1);

        Self {
            format,
            width,
            height,
            stride,
            stride_uv,
            uv_height,
            nb_planes,
            out_size: luma_size + chroma_size,
        }
    }

    pub fn luma_size(&self) -> usize {
        self.stride as usize * self.height as usize
    }

    /// Number of chroma rows following the luma plane, all chroma planes included.
    pub fn chroma_rows(&self) -> u32 {
        self.uv_height * (self.nb_planes - 1)
    }

    /// Byte offset and stride of `plane` within a frame, if the plane exists.
    pub fn plane(&self, plane: usize) -> Option<(usize, u32)> {
        let chroma_plane_size = self.stride_uv as usize * self.uv_height as usize;

        match plane {
            0 => Some((0, self.stride)),
            1 if self.nb_planes > 1 => Some((self.luma_size(), self.stride_uv)),
            2 if self.nb_planes > 2 => Some((self.luma_size() + chroma_plane_size, self.stride_uv)),
            _ => None,
        }
    }
}
