// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interface to the vendor decode driver.
//!
//! The driver is consumed as a black box: a compute-context API, a callback-driven parser and a
//! hardware decoder whose decoded surfaces can be mapped and copied out. Resolving the driver's
//! entry points at runtime is the job of the loader that provides the [`Driver`] implementation.
//!
//! Every method that touches the hardware expects the decode context to be current on the calling
//! thread, see [`crate::environment::DecodeEnvironment::make_current`].

#[cfg(test)]
pub(crate) mod dummy;

use std::fmt;

use enumn::N;

use crate::ChromaFormat;
use crate::CodecType;

/// Status codes returned by the driver. Values match the vendor enumeration.
#[derive(N, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum CuStatus {
    Success = 0,
    InvalidValue = 1,
    OutOfMemory = 2,
    NotInitialized = 3,
    Deinitialized = 4,
    NoDevice = 100,
    InvalidDevice = 101,
    InvalidContext = 201,
    MapFailed = 205,
    UnmapFailed = 206,
    AlreadyMapped = 208,
    NotMapped = 211,
    SharedObjectInitFailed = 303,
    OperatingSystem = 304,
    InvalidHandle = 400,
    NotSupported = 801,
    Unknown = 999,
}

impl CuStatus {
    fn name(&self) -> &'static str {
        match self {
            CuStatus::Success => "CUDA_SUCCESS",
            CuStatus::InvalidValue => "CUDA_ERROR_INVALID_VALUE",
            CuStatus::OutOfMemory => "CUDA_ERROR_OUT_OF_MEMORY",
            CuStatus::NotInitialized => "CUDA_ERROR_NOT_INITIALIZED",
            CuStatus::Deinitialized => "CUDA_ERROR_DEINITIALIZED",
            CuStatus::NoDevice => "CUDA_ERROR_NO_DEVICE",
            CuStatus::InvalidDevice => "CUDA_ERROR_INVALID_DEVICE",
            CuStatus::InvalidContext => "CUDA_ERROR_INVALID_CONTEXT",
            CuStatus::MapFailed => "CUDA_ERROR_MAP_FAILED",
            CuStatus::UnmapFailed => "CUDA_ERROR_UNMAP_FAILED",
            CuStatus::AlreadyMapped => "CUDA_ERROR_ALREADY_MAPPED",
            CuStatus::NotMapped => "CUDA_ERROR_NOT_MAPPED",
            CuStatus::SharedObjectInitFailed => "CUDA_ERROR_SHARED_OBJECT_INIT_FAILED",
            CuStatus::OperatingSystem => "CUDA_ERROR_OPERATING_SYSTEM",
            CuStatus::InvalidHandle => "CUDA_ERROR_INVALID_HANDLE",
            CuStatus::NotSupported => "CUDA_ERROR_NOT_SUPPORTED",
            CuStatus::Unknown => "CUDA_ERROR_UNKNOWN",
        }
    }
}

/// A non-success status returned by the driver.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CuError(pub u32);

impl CuError {
    pub fn status(&self) -> Option<CuStatus> {
        CuStatus::n(self.0)
    }
}

impl From<CuStatus> for CuError {
    fn from(status: CuStatus) -> Self {
        CuError(status as u32)
    }
}

impl fmt::Display for CuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status() {
            Some(status) => write!(f, "{}", status.name()),
            None => write!(f, "unknown driver error {}", self.0),
        }
    }
}

impl std::error::Error for CuError {}

pub type CuResult<T> = Result<T, CuError>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Device(pub i32);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContextHandle(pub u64);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ParserHandle(pub u64);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DecoderHandle(pub u64);

/// An address in device memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub fn offset(&self, bytes: usize) -> DevicePtr {
        DevicePtr(self.0 + bytes as u64)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

/// Stream format reported by the parser whenever it meets a new sequence header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VideoFormat {
    pub codec: CodecType,
    pub coded_width: u32,
    pub coded_height: u32,
    pub display_area: Rect,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub chroma_format: ChromaFormat,
    pub progressive_sequence: bool,
}

/// Picture parameters passed from the parser to the decoder, in decode order. Opaque to us beyond
/// the surface index.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PictureParams {
    pub curr_pic_idx: i32,
    pub field_pic: bool,
    pub bottom_field: bool,
    pub intra_pic: bool,
}

/// A picture that is ready for display, in decode order.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DisplayInfo {
    pub picture_index: i32,
    pub progressive_frame: bool,
    pub top_field_first: bool,
    pub repeat_first_field: i32,
    pub timestamp: u64,
}

/// Flags of a [`SourceDataPacket`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PacketFlags {
    pub end_of_stream: bool,
    pub timestamp: bool,
    pub discontinuity: bool,
}

/// Compressed data pushed to the parser.
#[derive(Clone, Debug, Default)]
pub struct SourceDataPacket<'a> {
    pub flags: PacketFlags,
    pub payload: &'a [u8],
    pub timestamp: u64,
}

/// Parameters of a parser.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParserParams {
    pub codec: CodecType,
    pub max_decode_surfaces: u32,
    pub max_display_delay: u32,
    pub clock_rate: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SurfaceFormat {
    #[default]
    Nv12,
    P016,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DeinterlaceMode {
    Weave,
    Bob,
    #[default]
    Adaptive,
}

/// Decoder creation flags, selecting which engine performs the decode.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateFlags(pub u32);

impl CreateFlags {
    pub const DEFAULT: CreateFlags = CreateFlags(0);
    pub const PREFER_CUDA: CreateFlags = CreateFlags(1);
    pub const PREFER_DXVA: CreateFlags = CreateFlags(2);
    pub const PREFER_CUVID: CreateFlags = CreateFlags(4);
}

/// Parameters of a hardware decoder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecoderCreateInfo {
    pub codec: CodecType,
    pub width: u32,
    pub height: u32,
    pub num_decode_surfaces: u32,
    pub chroma_format: ChromaFormat,
    pub output_format: SurfaceFormat,
    pub deinterlace_mode: DeinterlaceMode,
    pub bit_depth_minus8: u32,
    pub target_width: u32,
    pub target_height: u32,
    pub display_area: Rect,
    pub num_output_surfaces: u32,
    pub creation_flags: CreateFlags,
}

/// Post-processing parameters used when mapping a decoded surface.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcParams {
    pub progressive_frame: bool,
    pub second_field: bool,
    pub top_field_first: bool,
}

/// A decoded surface mapped into device memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MappedFrame {
    pub ptr: DevicePtr,
    pub pitch: u32,
}

/// Destination of a 2D copy.
#[derive(Debug)]
pub enum CopyDst<'a> {
    Host(&'a mut [u8]),
    Device(DevicePtr),
}

/// A pitched 2D copy out of device memory.
#[derive(Debug)]
pub struct Memcpy2d<'a> {
    pub src: DevicePtr,
    pub src_pitch: usize,
    pub dst: CopyDst<'a>,
    pub dst_pitch: usize,
    pub width_in_bytes: usize,
    pub height: usize,
}

/// Callbacks invoked by the parser from within [`Driver::parse_data`], on the calling thread.
///
/// Returning `false` from a callback tells the parser to stop processing the current packet.
pub trait ParserCallbacks {
    /// A new or changed sequence header has been parsed.
    fn on_sequence(&mut self, format: &VideoFormat) -> bool;

    /// A picture is ready to be decoded, in decode order.
    fn on_decode(&mut self, params: &PictureParams) -> bool;

    /// A decoded picture is ready for display, in decode order.
    fn on_display(&mut self, info: &DisplayInfo) -> bool;
}

/// Entry points of the vendor compute and video decode driver.
pub trait Driver: Send + Sync {
    fn init(&self) -> CuResult<()>;
    fn device_count(&self) -> CuResult<u32>;
    fn device_get(&self, ordinal: u32) -> CuResult<Device>;
    fn device_name(&self, device: Device) -> CuResult<String>;
    fn device_compute_capability(&self, device: Device) -> CuResult<(i32, i32)>;

    /// Creates a blocking-sync context on `device`, usable for GL interop if `gl_interop` is set.
    fn ctx_create(&self, device: Device, gl_interop: bool) -> CuResult<ContextHandle>;
    fn ctx_destroy(&self, ctx: ContextHandle);
    fn ctx_push_current(&self, ctx: ContextHandle) -> CuResult<()>;
    fn ctx_pop_current(&self);

    /// Unloads the driver bindings.
    fn uninit(&self);

    fn memcpy_2d(&self, copy: Memcpy2d<'_>) -> CuResult<()>;

    fn create_parser(&self, params: &ParserParams) -> CuResult<ParserHandle>;
    fn destroy_parser(&self, parser: ParserHandle);

    /// Pushes `packet` to `parser`. Any callback triggered by the data is invoked on `callbacks`
    /// before this method returns.
    fn parse_data(
        &self,
        parser: ParserHandle,
        packet: &SourceDataPacket<'_>,
        callbacks: &mut dyn ParserCallbacks,
    ) -> CuResult<()>;

    fn create_decoder(&self, info: &DecoderCreateInfo) -> CuResult<DecoderHandle>;
    fn destroy_decoder(&self, decoder: DecoderHandle);
    fn decode_picture(&self, decoder: DecoderHandle, params: &PictureParams) -> CuResult<()>;
    fn map_frame(
        &self,
        decoder: DecoderHandle,
        picture_index: i32,
        params: &ProcParams,
    ) -> CuResult<MappedFrame>;
    fn unmap_frame(&self, decoder: DecoderHandle, frame: DevicePtr);

    fn gl_register_buffer(&self, buffer: u32) -> CuResult<()>;
    fn gl_unregister_buffer(&self, buffer: u32);
    /// Maps a registered GL buffer object, returning its device address and size in bytes.
    fn gl_map_buffer(&self, buffer: u32) -> CuResult<(DevicePtr, usize)>;
    fn gl_unmap_buffer(&self, buffer: u32);
}

/// Pixel transfer formats used for texture uploads.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GlPixelFormat {
    Luminance,
    LuminanceAlpha,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GlPixelType {
    UnsignedByte,
    UnsignedShort,
}

/// The subset of the graphics API needed to upload decoded planes into textures.
///
/// Implemented by the consumer owning the graphics context; all calls are made on its thread.
pub trait GlApi {
    fn gen_buffer(&self) -> u32;
    fn gen_texture(&self) -> u32;
    /// Binds `buffer` as the pixel unpack buffer. `0` unbinds.
    fn bind_unpack_buffer(&self, buffer: u32);
    /// Allocates `size` bytes of stream-draw storage for the bound unpack buffer.
    fn buffer_data(&self, size: usize);
    /// Binds `texture` to the 2D target. `0` unbinds.
    fn bind_texture(&self, texture: u32);
    fn tex_image_2d(&self, format: GlPixelFormat, pixel_type: GlPixelType, width: u32, height: u32);
    /// Updates the bound texture from the bound unpack buffer.
    fn tex_sub_image_2d(
        &self,
        format: GlPixelFormat,
        pixel_type: GlPixelType,
        width: u32,
        height: u32,
    );
}
