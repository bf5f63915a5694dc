// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parser callbacks of the decode stage.
//!
//! The parser calls back into the stage synchronously from [`Driver::parse_data`], on the thread
//! processing the stage and with the decode context current. A sequence header may reconfigure
//! the stage, which is where decoders are taken from and handed back to the pool.

use std::sync::Arc;

use log::debug;
use log::error;
use log::info;

use crate::backend::DecoderCreateInfo;
use crate::backend::DeinterlaceMode;
use crate::backend::DisplayInfo;
use crate::backend::ParserCallbacks;
use crate::backend::PictureParams;
use crate::backend::Rect;
use crate::backend::SurfaceFormat;
use crate::backend::VideoFormat;
use crate::decoder::display_queue::PictureSource;
use crate::decoder::NvDecoder;
use crate::decoder::StreamState;
use crate::pool::Checkout;
use crate::ConfigKey;
use crate::FrameLayout;
use crate::PixelFormat;

/// Configuration described by `format`, cropped to its display area.
fn config_key(format: &VideoFormat) -> ConfigKey {
    let mut width = format.coded_width;
    let mut height = format.coded_height;

    let area = &format.display_area;
    if area.right > 0 && (area.right as u32) < width {
        width = area.right as u32;
    }
    if area.bottom > 0 && (area.bottom as u32) < height {
        height = area.bottom as u32;
    }

    ConfigKey {
        width,
        height,
        bpp_luma: 8 + format.bit_depth_luma_minus8 as u32,
        bpp_chroma: 8 + format.bit_depth_chroma_minus8 as u32,
        codec: format.codec,
        chroma_format: format.chroma_format,
    }
}

impl NvDecoder {
    /// Whether the current instance already decodes `key`.
    fn is_configured_for(&self, key: &ConfigKey) -> bool {
        self.layout.is_some()
            && self.instance.as_ref().is_some_and(|inst| inst.has_decoder() && inst.matches(key))
    }

    fn high_bit_depth(&self, key: &ConfigKey) -> bool {
        self.options.ten_bit_output && key.bpp_luma + key.bpp_chroma > 16
    }

    pub(super) fn create_info(&self, key: &ConfigKey) -> DecoderCreateInfo {
        DecoderCreateInfo {
            codec: key.codec,
            width: key.width,
            height: key.height,
            num_decode_surfaces: self.options.num_surfaces,
            chroma_format: key.chroma_format,
            output_format: match self.high_bit_depth(key) {
                true => SurfaceFormat::P016,
                false => SurfaceFormat::Nv12,
            },
            deinterlace_mode: DeinterlaceMode::Adaptive,
            bit_depth_minus8: key.bpp_luma - 8,
            target_width: key.width,
            target_height: key.height,
            display_area: Rect {
                left: 0,
                top: 0,
                right: key.width as i32,
                bottom: key.height as i32,
            },
            num_output_surfaces: 1,
            creation_flags: self.options.decode_mode.creation_flags(),
        }
    }
}

impl ParserCallbacks for NvDecoder {
    fn on_sequence(&mut self, format: &VideoFormat) -> bool {
        let key = config_key(format);
        info!(
            "stage {}: sequence {}x{} ({}x{} coded), {} bpp",
            self.id.0, key.width, key.height, format.coded_width, format.coded_height, key.bpp_luma
        );

        // Redundant sequence header.
        if self.is_configured_for(&key) {
            return true;
        }

        let same_config = self.key == Some(key) && self.layout.is_some();
        self.key = Some(key);

        let high_bit_depth = self.high_bit_depth(&key);
        let Some(pixel_format) = PixelFormat::for_chroma(key.chroma_format, high_bit_depth) else {
            error!("stage {}: unsupported chroma format {:?}", self.id.0, key.chroma_format);
            self.layout = None;
            self.state = StreamState::ReloadFull;
            return false;
        };

        let env = Arc::clone(&self.env);
        let pool = env.pool();

        let (checkout, displaced) = pool.checkout(&key, self.instance.take(), self.id);
        if let Some(displaced) = displaced {
            self.hand_back(displaced);
        }

        match checkout {
            Checkout::Reused(inst) => {
                info!(
                    "stage {}: reusing decoder instance {} for {}x{} - {} decoders loaded",
                    self.id.0,
                    inst.id(),
                    key.width,
                    key.height,
                    pool.live_decoders()
                );
                let layout =
                    FrameLayout::with_stride(pixel_format, key.width, key.height, inst.stride);
                self.layout = Some(layout);
                self.instance = Some(inst);
                self.state = match same_config {
                    true => StreamState::Configured,
                    false => StreamState::ReloadLight,
                };
            }
            Checkout::NeedsCreation(mut inst) | Checkout::Reconfigure(mut inst) => {
                if self.has_pictures_from(&inst) {
                    let old = pool.detach_decoder(&mut inst);
                    self.retire(old, false);
                }

                let layout = FrameLayout::new(pixel_format, key.width, key.height);
                inst.stride = layout.stride;
                self.layout = Some(layout);

                let info = self.create_info(&key);
                let res = pool.create_decoder(env.driver().as_ref(), &mut inst, key, &info);
                self.instance = Some(inst);

                if let Err(e) = res {
                    error!("stage {}: failed to create decoder: {}", self.id.0, e);
                    self.fault = Some(e);
                    self.state = StreamState::ReloadFull;
                    return false;
                }

                self.state = match same_config {
                    true => StreamState::Configured,
                    false => StreamState::ReloadFull,
                };
            }
        }

        if self.state != StreamState::Configured {
            self.publish_format = true;
        }
        true
    }

    fn on_decode(&mut self, params: &PictureParams) -> bool {
        let Some(decoder) = self.instance.as_ref().and_then(|inst| inst.decoder) else {
            error!("stage {}: picture {} has no decoder", self.id.0, params.curr_pic_idx);
            return true;
        };

        match self.env.driver().decode_picture(decoder, params) {
            Ok(()) => {
                debug!("stage {}: decoded picture {}", self.id.0, params.curr_pic_idx);
                self.decode_error = None;
            }
            Err(e) => {
                error!(
                    "stage {}: failed to decode picture {}: {}",
                    self.id.0, params.curr_pic_idx, e
                );
                self.decode_error = Some(e);
            }
        }
        true
    }

    fn on_display(&mut self, info: &DisplayInfo) -> bool {
        let decoder = self.instance.as_ref().and_then(|inst| inst.decoder);
        let source = match (decoder, self.layout) {
            (Some(decoder), Some(layout)) => Some(PictureSource { decoder, layout }),
            _ => None,
        };

        let mut frames = self.frames.lock().unwrap();
        if let Some(id) = frames.queue.on_picture_ready(info, self.id) {
            if let Some(picture) = frames.queue.get_mut(id) {
                picture.source = source;
            }
        }
        true
    }
}
