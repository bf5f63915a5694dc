// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Zero-copy delivery of decoded pictures into GL textures.
//!
//! Each stage owns up to two textures, one for the luma plane and one for the interleaved chroma
//! plane, each backed by a pixel buffer object registered with the driver. Uploading a plane
//! copies it from the decoder surface to the buffer object on the GPU, then updates the texture
//! from the buffer object, so the pixels never go through host memory.

use log::debug;
use log::error;

use crate::backend::CopyDst;
use crate::backend::DevicePtr;
use crate::backend::Driver;
use crate::backend::GlApi;
use crate::backend::GlPixelFormat;
use crate::backend::GlPixelType;
use crate::backend::Memcpy2d;
use crate::decoder::display_queue::PendingPicture;
use crate::decoder::display_queue::PictureId;
use crate::video_frame::plane_size;
use crate::video_frame::proc_params;
use crate::video_frame::FrameState;
use crate::video_frame::HwFrame;
use crate::video_frame::MapError;
use crate::video_frame::UV_PLANE;
use crate::video_frame::Y_PLANE;

/// A texture and the buffer object backing it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct PlaneTexture {
    pbo: u32,
    texture: u32,
    /// `pbo` is registered with the driver.
    registered: bool,
    /// Picture whose plane was last uploaded.
    picture: Option<PictureId>,
}

impl PlaneTexture {
    fn release(self, driver: &dyn Driver) {
        if self.registered {
            driver.gl_unregister_buffer(self.pbo);
        }
    }
}

impl FrameState {
    /// Unregisters the buffer objects of all textures. The context must be current.
    pub(crate) fn release_textures(&mut self, driver: &dyn Driver) {
        for texture in self.textures.iter_mut().filter_map(Option::take) {
            texture.release(driver);
        }
    }
}

impl HwFrame {
    /// Uploads `plane` (luma or interleaved chroma) to its texture and returns the texture name.
    ///
    /// `texture_id` is the name the caller currently holds for this plane. Passing 0 while the
    /// stage already has a texture for the plane drops it and creates a new one, which is how the
    /// caller recovers from losing its GL context.
    pub fn gl_texture(&self, gl: &dyn GlApi, plane: usize, texture_id: u32) -> Result<u32, MapError> {
        if plane > UV_PLANE {
            return Err(MapError::BadPlane(plane));
        }

        let layout = self.layout;
        let pixel_type = match layout.format.is_high_bit_depth() {
            true => GlPixelType::UnsignedShort,
            false => GlPixelType::UnsignedByte,
        };
        let (format, width, height, rows) = match plane {
            Y_PLANE => (GlPixelFormat::Luminance, layout.width, layout.height, layout.height),
            _ => (GlPixelFormat::LuminanceAlpha, layout.width / 2, layout.height / 2, layout.uv_height),
        };

        let mut guard = self.frames.lock().unwrap();
        let state = &mut *guard;
        let current = self.env.make_current()?;
        let driver = current.driver();

        if texture_id == 0 {
            if let Some(old) = state.textures[plane].take() {
                debug!("dropping texture {} of plane {}", old.texture, plane);
                old.release(driver);
            }
        }

        let slot = state.textures[plane].get_or_insert_with(|| {
            let pbo = gl.gen_buffer();
            let texture = gl.gen_texture();

            gl.bind_unpack_buffer(pbo);
            gl.buffer_data(plane_size(&layout, plane));
            gl.bind_unpack_buffer(0);

            gl.bind_texture(texture);
            gl.tex_image_2d(format, pixel_type, width, height);
            gl.bind_texture(0);

            PlaneTexture { pbo, texture, registered: false, picture: None }
        });
        if !slot.registered {
            driver.gl_register_buffer(slot.pbo).map_err(MapError::Register)?;
            slot.registered = true;
        }
        let texture = *slot;

        let mut picture = self.pending(&state.queue)?;
        let mapped = match plane {
            Y_PLANE => picture.y_mapped,
            _ => picture.uv_mapped,
        };
        if mapped && texture.picture == Some(self.picture) {
            return Ok(texture.texture);
        }

        let (dst, dst_size) = driver.gl_map_buffer(texture.pbo).map_err(MapError::Map)?;
        let res = self.copy_plane(driver, &picture, plane, dst, dst_size / rows as usize, rows);
        driver.gl_unmap_buffer(texture.pbo);
        drop(current);
        res?;

        match plane {
            Y_PLANE => picture.y_mapped = true,
            _ => picture.uv_mapped = true,
        }
        if let Some(pending) = state.queue.get_mut(self.picture) {
            *pending = picture;
        }
        if let Some(texture) = state.textures[plane].as_mut() {
            texture.picture = Some(self.picture);
        }

        gl.bind_texture(texture.texture);
        gl.bind_unpack_buffer(texture.pbo);
        gl.tex_sub_image_2d(format, pixel_type, width, height);
        gl.bind_unpack_buffer(0);
        gl.bind_texture(0);

        Ok(texture.texture)
    }

    fn copy_plane(
        &self,
        driver: &dyn Driver,
        picture: &PendingPicture,
        plane: usize,
        dst: DevicePtr,
        dst_pitch: usize,
        rows: u32,
    ) -> Result<(), MapError> {
        let frame = driver
            .map_frame(self.decoder, picture.picture_index, &proc_params(picture))
            .map_err(MapError::Map)?;
        let pitch = frame.pitch as usize;
        let src = match plane {
            Y_PLANE => frame.ptr,
            _ => frame.ptr.offset(self.layout.height as usize * pitch),
        };

        let res = driver.memcpy_2d(Memcpy2d {
            src,
            src_pitch: pitch,
            dst: CopyDst::Device(dst),
            dst_pitch,
            width_in_bytes: dst_pitch.min(pitch),
            height: rows as usize,
        });
        driver.unmap_frame(self.decoder, frame.ptr);

        res.map_err(|e| {
            error!("failed to copy plane {} to texture: {}", plane, e);
            MapError::Copy(e)
        })
    }
}
