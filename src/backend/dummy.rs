// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy driver whose only purpose is to let the decode stage run so we can
//! test it in isolation.
//!
//! The parser is scripted: each call to `parse_data` with a payload pops one batch of events from
//! the script and replays it on the callbacks. Device memory is emulated by a map of host
//! allocations, and mapped surfaces are filled with a recognizable pattern (see
//! [`surface_byte`]).

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::backend::*;
use crate::utils::align_up;
use crate::ChromaFormat;
use crate::CodecType;

/// Pitch alignment of mapped surfaces, so copies always have padding to skip.
const SURFACE_PITCH_ALIGNMENT: usize = 256;

/// Value of the byte at `row` of surface `picture_index`. Chroma rows follow the luma rows, so
/// the first chroma row of a `height`-tall picture is row `height`.
pub(crate) fn surface_byte(picture_index: i32, row: usize) -> u8 {
    (picture_index as usize * 31 + row) as u8
}

/// One callback the scripted parser fires.
#[derive(Clone, Debug)]
pub(crate) enum ParserEvent {
    Sequence(VideoFormat),
    Decode(PictureParams),
    Display(DisplayInfo),
}

/// Sequence header of an 8-bit 4:2:0 stream.
pub(crate) fn sequence(codec: CodecType, width: u32, height: u32) -> ParserEvent {
    ParserEvent::Sequence(VideoFormat {
        codec,
        coded_width: width,
        coded_height: height,
        chroma_format: ChromaFormat::Yuv420,
        progressive_sequence: true,
        ..Default::default()
    })
}

pub(crate) fn decode(picture_index: i32) -> ParserEvent {
    ParserEvent::Decode(PictureParams { curr_pic_idx: picture_index, ..Default::default() })
}

pub(crate) fn display(picture_index: i32, timestamp: u64) -> ParserEvent {
    ParserEvent::Display(DisplayInfo {
        picture_index,
        progressive_frame: true,
        timestamp,
        ..Default::default()
    })
}

#[derive(Default)]
pub(crate) struct DummyState {
    /// Event batches replayed by successive non-empty `parse_data` calls.
    pub script: VecDeque<Vec<ParserEvent>>,
    /// Events replayed when the end of stream is signaled.
    pub eos_events: Vec<ParserEvent>,
    /// Timestamps of all packets with a payload, in submission order.
    pub parsed: Vec<u64>,
    pub eos_count: u32,

    pub devices: u32,
    pub fail_init: bool,
    pub fail_gl_context: bool,
    pub fail_context: bool,
    pub fail_push: bool,
    pub fail_create_parser: bool,
    pub fail_create_decoder: bool,
    pub fail_decode: bool,
    pub fail_map: bool,
    pub fail_copy: bool,
    pub fail_register: bool,

    pub contexts_created: u32,
    pub contexts_destroyed: u32,
    pub gl_context: bool,
    pub uninit_count: u32,
    pub current_depth: i32,
    pub parsers_created: u32,
    pub parsers_destroyed: u32,
    pub decoders_created: u32,
    pub decoders_destroyed: u32,
    pub decoded: Vec<i32>,
    pub maps: u32,
    pub unmaps: u32,
    pub copies: u32,
    pub last_create_info: Option<DecoderCreateInfo>,

    next_handle: u64,
    decoders: HashMap<u64, DecoderCreateInfo>,
    /// Emulated device memory, keyed by base address.
    memory: BTreeMap<u64, Vec<u8>>,

    next_gl_name: u32,
    bound_buffer: u32,
    bound_texture: u32,
    gl_buffers: HashMap<u32, u64>,
    pub registered_buffers: HashSet<u32>,
    /// (texture, unpack buffer, format, width, height) of every texture update.
    pub texture_updates: Vec<(u32, u32, GlPixelFormat, u32, u32)>,
}

impl DummyState {
    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn alloc(&mut self, size: usize) -> DevicePtr {
        let base = self.next_handle() << 32;
        self.memory.insert(base, vec![0u8; size]);
        DevicePtr(base)
    }

    fn resolve(&mut self, ptr: DevicePtr) -> Option<(&mut Vec<u8>, usize)> {
        let (base, buf) = self.memory.range_mut(..=ptr.0).next_back()?;
        let offset = (ptr.0 - base) as usize;
        (offset <= buf.len()).then_some((buf, offset))
    }
}

/// Copies `height` rows of `width` bytes from `src` to `dst`, honoring the pitch of each side.
///
/// Rows that would run past the end of either buffer are truncated.
fn copy_rows(
    src: &[u8],
    src_pitch: usize,
    dst: &mut [u8],
    dst_pitch: usize,
    width: usize,
    height: usize,
) {
    for row in 0..height {
        let src_start = row * src_pitch;
        let dst_start = row * dst_pitch;
        if src_start >= src.len() || dst_start >= dst.len() {
            break;
        }

        let len = width.min(src.len() - src_start).min(dst.len() - dst_start);
        dst[dst_start..dst_start + len].copy_from_slice(&src[src_start..src_start + len]);
    }
}

pub(crate) struct DummyDriver {
    state: Mutex<DummyState>,
}

impl DummyDriver {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self { state: Mutex::new(DummyState { devices: 1, ..Default::default() }) })
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, DummyState> {
        self.state.lock().unwrap()
    }

    /// Queues the events fired by the next packet pushed to the parser.
    pub(crate) fn script(&self, events: Vec<ParserEvent>) {
        self.state().script.push_back(events);
    }

    pub(crate) fn live_decoders(&self) -> usize {
        self.state().decoders.len()
    }

    /// Contents of the GL buffer `buffer`, as last written by the driver.
    pub(crate) fn gl_buffer_contents(&self, buffer: u32) -> Vec<u8> {
        let mut state = self.state();
        let Some(&base) = state.gl_buffers.get(&buffer) else {
            return vec![];
        };
        state.resolve(DevicePtr(base)).map(|(buf, _)| buf.clone()).unwrap_or_default()
    }
}

impl Driver for DummyDriver {
    fn init(&self) -> CuResult<()> {
        if self.state().fail_init {
            return Err(CuStatus::NotInitialized.into());
        }
        Ok(())
    }

    fn device_count(&self) -> CuResult<u32> {
        Ok(self.state().devices)
    }

    fn device_get(&self, ordinal: u32) -> CuResult<Device> {
        if ordinal >= self.state().devices {
            return Err(CuStatus::InvalidDevice.into());
        }
        Ok(Device(ordinal as i32))
    }

    fn device_name(&self, device: Device) -> CuResult<String> {
        Ok(format!("Dummy GPU {}", device.0))
    }

    fn device_compute_capability(&self, _: Device) -> CuResult<(i32, i32)> {
        Ok((8, 6))
    }

    fn ctx_create(&self, _: Device, gl_interop: bool) -> CuResult<ContextHandle> {
        let mut state = self.state();
        if state.fail_context || (gl_interop && state.fail_gl_context) {
            return Err(CuStatus::NotSupported.into());
        }
        state.contexts_created += 1;
        state.gl_context = gl_interop;
        Ok(ContextHandle(state.next_handle()))
    }

    fn ctx_destroy(&self, _: ContextHandle) {
        self.state().contexts_destroyed += 1;
    }

    fn ctx_push_current(&self, _: ContextHandle) -> CuResult<()> {
        let mut state = self.state();
        if state.fail_push {
            return Err(CuStatus::InvalidContext.into());
        }
        state.current_depth += 1;
        Ok(())
    }

    fn ctx_pop_current(&self) {
        self.state().current_depth -= 1;
    }

    fn uninit(&self) {
        self.state().uninit_count += 1;
    }

    fn memcpy_2d(&self, copy: Memcpy2d<'_>) -> CuResult<()> {
        let mut state = self.state();
        if state.fail_copy {
            return Err(CuStatus::InvalidValue.into());
        }
        state.copies += 1;

        let src = {
            let (buf, offset) = state.resolve(copy.src).ok_or(CuStatus::InvalidValue)?;
            let end = offset + copy.src_pitch * copy.height.saturating_sub(1) + copy.width_in_bytes;
            if end > buf.len() {
                return Err(CuStatus::InvalidValue.into());
            }
            buf[offset..end].to_vec()
        };

        match copy.dst {
            CopyDst::Host(dst) => {
                copy_rows(
                    &src,
                    copy.src_pitch,
                    dst,
                    copy.dst_pitch,
                    copy.width_in_bytes,
                    copy.height,
                );
            }
            CopyDst::Device(ptr) => {
                let (buf, offset) = state.resolve(ptr).ok_or(CuStatus::InvalidValue)?;
                copy_rows(
                    &src,
                    copy.src_pitch,
                    &mut buf[offset..],
                    copy.dst_pitch,
                    copy.width_in_bytes,
                    copy.height,
                );
            }
        }

        Ok(())
    }

    fn create_parser(&self, _: &ParserParams) -> CuResult<ParserHandle> {
        let mut state = self.state();
        if state.fail_create_parser {
            return Err(CuStatus::NotSupported.into());
        }
        state.parsers_created += 1;
        Ok(ParserHandle(state.next_handle()))
    }

    fn destroy_parser(&self, _: ParserHandle) {
        self.state().parsers_destroyed += 1;
    }

    fn parse_data(
        &self,
        _: ParserHandle,
        packet: &SourceDataPacket<'_>,
        callbacks: &mut dyn ParserCallbacks,
    ) -> CuResult<()> {
        // The callbacks call back into the driver, so the lock must be released first.
        let events = {
            let mut state = self.state();
            if packet.flags.end_of_stream {
                state.eos_count += 1;
                std::mem::take(&mut state.eos_events)
            } else {
                state.parsed.push(packet.timestamp);
                state.script.pop_front().unwrap_or_default()
            }
        };

        for event in events {
            let proceed = match event {
                ParserEvent::Sequence(format) => callbacks.on_sequence(&format),
                ParserEvent::Decode(params) => callbacks.on_decode(&params),
                ParserEvent::Display(info) => callbacks.on_display(&info),
            };
            if !proceed {
                break;
            }
        }

        Ok(())
    }

    fn create_decoder(&self, info: &DecoderCreateInfo) -> CuResult<DecoderHandle> {
        let mut state = self.state();
        if state.fail_create_decoder {
            return Err(CuStatus::OutOfMemory.into());
        }
        state.decoders_created += 1;
        state.last_create_info = Some(info.clone());
        let handle = state.next_handle();
        state.decoders.insert(handle, info.clone());
        Ok(DecoderHandle(handle))
    }

    fn destroy_decoder(&self, decoder: DecoderHandle) {
        let mut state = self.state();
        state.decoders.remove(&decoder.0);
        state.decoders_destroyed += 1;
    }

    fn decode_picture(&self, decoder: DecoderHandle, params: &PictureParams) -> CuResult<()> {
        let mut state = self.state();
        if state.fail_decode || !state.decoders.contains_key(&decoder.0) {
            return Err(CuStatus::InvalidHandle.into());
        }
        state.decoded.push(params.curr_pic_idx);
        Ok(())
    }

    fn map_frame(
        &self,
        decoder: DecoderHandle,
        picture_index: i32,
        _: &ProcParams,
    ) -> CuResult<MappedFrame> {
        let mut state = self.state();
        if state.fail_map {
            return Err(CuStatus::MapFailed.into());
        }
        let info = state.decoders.get(&decoder.0).ok_or(CuStatus::InvalidHandle)?.clone();

        let bytes_per_sample = if info.output_format == SurfaceFormat::P016 { 2 } else { 1 };
        let pitch = align_up(info.width as usize * bytes_per_sample, SURFACE_PITCH_ALIGNMENT);
        // Room for a luma plane and two full-size chroma planes.
        let rows = info.height as usize * 3;

        let ptr = state.alloc(pitch * rows);
        let (buf, _) = state.resolve(ptr).ok_or(CuStatus::Unknown)?;
        for (row, line) in buf.chunks_mut(pitch).enumerate() {
            line.fill(surface_byte(picture_index, row));
        }

        state.maps += 1;
        Ok(MappedFrame { ptr, pitch: pitch as u32 })
    }

    fn unmap_frame(&self, _: DecoderHandle, frame: DevicePtr) {
        let mut state = self.state();
        state.memory.remove(&frame.0);
        state.unmaps += 1;
    }

    fn gl_register_buffer(&self, buffer: u32) -> CuResult<()> {
        let mut state = self.state();
        if state.fail_register {
            return Err(CuStatus::NotSupported.into());
        }
        if !state.gl_buffers.contains_key(&buffer) {
            return Err(CuStatus::InvalidHandle.into());
        }
        state.registered_buffers.insert(buffer);
        Ok(())
    }

    fn gl_unregister_buffer(&self, buffer: u32) {
        self.state().registered_buffers.remove(&buffer);
    }

    fn gl_map_buffer(&self, buffer: u32) -> CuResult<(DevicePtr, usize)> {
        let mut state = self.state();
        if !state.registered_buffers.contains(&buffer) {
            return Err(CuStatus::NotMapped.into());
        }
        let base = *state.gl_buffers.get(&buffer).ok_or(CuStatus::InvalidHandle)?;
        let (buf, _) = state.resolve(DevicePtr(base)).ok_or(CuStatus::InvalidHandle)?;
        Ok((DevicePtr(base), buf.len()))
    }

    fn gl_unmap_buffer(&self, _: u32) {}
}

impl GlApi for DummyDriver {
    fn gen_buffer(&self) -> u32 {
        let mut state = self.state();
        state.next_gl_name += 1;
        state.next_gl_name
    }

    fn gen_texture(&self) -> u32 {
        self.gen_buffer()
    }

    fn bind_unpack_buffer(&self, buffer: u32) {
        self.state().bound_buffer = buffer;
    }

    fn buffer_data(&self, size: usize) {
        let mut state = self.state();
        let buffer = state.bound_buffer;
        let ptr = state.alloc(size);
        state.gl_buffers.insert(buffer, ptr.0);
    }

    fn bind_texture(&self, texture: u32) {
        self.state().bound_texture = texture;
    }

    fn tex_image_2d(&self, _: GlPixelFormat, _: GlPixelType, _: u32, _: u32) {}

    fn tex_sub_image_2d(&self, format: GlPixelFormat, _: GlPixelType, width: u32, height: u32) {
        let mut state = self.state();
        let update = (state.bound_texture, state.bound_buffer, format, width, height);
        state.texture_updates.push(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_rows_drops_padding() {
        let src = [1, 2, 0xff, 3, 4, 0xff];
        let mut dst = [0u8; 4];

        copy_rows(&src, 3, &mut dst, 2, 2, 2);

        assert_eq!(dst, [1, 2, 3, 4]);
    }
}
