// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Delivery of decoded pictures.
//!
//! Pictures are either copied to host memory as soon as they are dequeued
//! ([`download_picture`]), or handed downstream as a [`HwFrame`] whose planes are only copied
//! when a consumer asks for them, into host memory or (with the `gl` feature) into a texture.

#[cfg(feature = "gl")]
pub mod texture;

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use log::error;
use thiserror::Error;

use crate::backend::CopyDst;
use crate::backend::CuError;
use crate::backend::DecoderHandle;
use crate::backend::Driver;
use crate::backend::Memcpy2d;
use crate::backend::ProcParams;
use crate::decoder::display_queue::DisplayQueue;
use crate::decoder::display_queue::PendingPicture;
use crate::decoder::display_queue::PictureId;
use crate::decoder::display_queue::PictureSource;
use crate::environment::DecodeEnvironment;
use crate::environment::EnvironmentError;
use crate::FrameLayout;

pub const Y_PLANE: usize = 0;
pub const UV_PLANE: usize = 1;
pub const U_PLANE: usize = 1;
pub const V_PLANE: usize = 2;

#[derive(Debug, Error)]
pub enum MapError {
    #[error("failed to make context current: {0}")]
    Context(#[from] EnvironmentError),
    #[error("failed to map decoded picture: {0}")]
    Map(CuError),
    #[error("failed to copy decoded picture: {0}")]
    Copy(CuError),
    #[error("plane {0} does not exist")]
    BadPlane(usize),
    #[error("no hardware decoder to read the picture from")]
    NoDecoder,
    #[error("failed to register buffer for interop: {0}")]
    Register(CuError),
}

/// Per-stage state shared between the stage and the frames it hands downstream.
#[derive(Default)]
pub(crate) struct FrameState {
    pub(crate) queue: DisplayQueue,
    #[cfg(feature = "gl")]
    pub(crate) textures: [Option<texture::PlaneTexture>; 2],
}

/// Host copy of the last picture read in lazy-copy mode, shared by all the frames of a stage.
#[derive(Default)]
pub(crate) struct Staging {
    /// Grows as needed, never shrinks.
    data: Vec<u8>,
    picture: Option<PictureId>,
}

impl Staging {
    pub(crate) fn capacity(&self) -> usize {
        self.data.len()
    }
}

/// Size in bytes of `plane` in `layout`.
fn plane_size(layout: &FrameLayout, plane: usize) -> usize {
    match plane {
        Y_PLANE => layout.luma_size(),
        _ => layout.stride_uv as usize * layout.uv_height as usize,
    }
}

fn proc_params(picture: &PendingPicture) -> ProcParams {
    ProcParams {
        progressive_frame: picture.progressive,
        second_field: false,
        top_field_first: picture.top_field_first,
    }
}

/// Copies `picture` out of `decoder` into `dst`, which must hold at least `layout.out_size`
/// bytes. The context must be current.
pub(crate) fn download_picture(
    driver: &dyn Driver,
    decoder: DecoderHandle,
    picture: &PendingPicture,
    layout: &FrameLayout,
    dst: &mut [u8],
) -> Result<(), MapError> {
    let frame = driver
        .map_frame(decoder, picture.picture_index, &proc_params(picture))
        .map_err(MapError::Map)?;

    let pitch = frame.pitch as usize;
    let (luma, chroma) = dst.split_at_mut(layout.luma_size().min(dst.len()));

    let res = driver
        .memcpy_2d(Memcpy2d {
            src: frame.ptr,
            src_pitch: pitch,
            dst: CopyDst::Host(luma),
            dst_pitch: layout.stride as usize,
            width_in_bytes: pitch.min(layout.stride as usize),
            height: layout.height as usize,
        })
        .and_then(|()| {
            driver.memcpy_2d(Memcpy2d {
                src: frame.ptr.offset(layout.height as usize * pitch),
                src_pitch: pitch,
                dst: CopyDst::Host(chroma),
                dst_pitch: layout.stride_uv as usize,
                width_in_bytes: pitch.min(layout.stride_uv as usize),
                height: layout.chroma_rows() as usize,
            })
        });

    driver.unmap_frame(decoder, frame.ptr);

    res.map_err(|e| {
        error!("failed to copy picture {} to host memory: {}", picture.picture_index, e);
        MapError::Copy(e)
    })
}

/// A decoded picture whose pixels stay on the GPU until requested.
///
/// The picture record is recycled when the frame is dropped.
pub struct HwFrame {
    picture: PictureId,
    decoder: DecoderHandle,
    layout: FrameLayout,
    env: Arc<DecodeEnvironment>,
    frames: Arc<Mutex<FrameState>>,
    staging: Arc<Mutex<Staging>>,
    blocking: bool,
}

impl fmt::Debug for HwFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HwFrame")
            .field("picture", &self.picture)
            .field("decoder", &self.decoder)
            .field("layout", &self.layout)
            .field("blocking", &self.blocking)
            .finish()
    }
}

impl HwFrame {
    pub(crate) fn new(
        picture: PictureId,
        source: PictureSource,
        env: Arc<DecodeEnvironment>,
        frames: Arc<Mutex<FrameState>>,
        staging: Arc<Mutex<Staging>>,
        blocking: bool,
    ) -> Self {
        Self {
            picture,
            decoder: source.decoder,
            layout: source.layout,
            env,
            frames,
            staging,
            blocking,
        }
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    /// Whether the consumer must release this frame before the stage can produce more output.
    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    fn pending(&self, queue: &DisplayQueue) -> Result<PendingPicture, MapError> {
        queue.get(self.picture).cloned().ok_or(MapError::NoDecoder)
    }

    /// Returns the pixels of `plane`, copying the picture to host memory first if needed.
    ///
    /// All the frames of a stage share one host buffer, so reading a plane of another frame
    /// copies that frame over this one.
    pub fn plane(&self, plane: usize) -> Result<MappedPlane<'_>, MapError> {
        let (offset, stride) = self.layout.plane(plane).ok_or(MapError::BadPlane(plane))?;
        let len = plane_size(&self.layout, plane);

        let mut staging = self.staging.lock().unwrap();
        let picture = self.pending(&self.frames.lock().unwrap().queue)?;

        if !picture.y_mapped || staging.picture != Some(self.picture) {
            if staging.data.len() < self.layout.out_size {
                staging.data.resize(self.layout.out_size, 0);
            }
            staging.picture = None;

            let current = self.env.make_current()?;
            download_picture(
                current.driver(),
                self.decoder,
                &picture,
                &self.layout,
                &mut staging.data,
            )?;

            staging.picture = Some(self.picture);
            if let Some(pending) = self.frames.lock().unwrap().queue.get_mut(self.picture) {
                pending.y_mapped = true;
            }
        }

        Ok(MappedPlane { guard: staging, offset, len, stride })
    }
}

impl Drop for HwFrame {
    fn drop(&mut self) {
        self.frames.lock().unwrap().queue.release(self.picture);
    }
}

/// A plane of a [`HwFrame`] in host memory. Other frames of the stage cannot be copied to host
/// memory while this is alive.
pub struct MappedPlane<'a> {
    guard: MutexGuard<'a, Staging>,
    offset: usize,
    len: usize,
    stride: u32,
}

impl MappedPlane<'_> {
    pub fn data(&self) -> &[u8] {
        &self.guard.data[self.offset..self.offset + self.len]
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }
}
