// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Options exposed to the operator.
//!
//! Options can be built directly or parsed from a `key=value:key=value` argument string:
//!
//! ```
//! use nvdec_filter::config::NvDecOptions;
//! use nvdec_filter::config::OutputMode;
//! use nvdec_filter::config::UnloadPolicy;
//!
//! let options: NvDecOptions = "unload=reuse:fmode=copy:num_surfaces=8".parse().unwrap();
//! assert_eq!(options.unload, UnloadPolicy::ReusePool);
//! assert_eq!(options.output_mode, OutputMode::EagerCopy);
//! assert_eq!(options.num_surfaces, 8);
//! ```

use std::str::FromStr;

use anyhow::anyhow;
use anyhow::Context;

use crate::backend::CreateFlags;

/// What happens to an instance's hardware decoder when the stage goes idle.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum UnloadPolicy {
    /// Keep the decoder loaded while idle. It is destroyed with the stage.
    #[default]
    KeepNothing,
    /// Destroy the hardware decoder as soon as the stage is deactivated.
    DestroyOnIdle,
    /// Hand the instance to the process-wide pool so another stage can reuse it.
    ReusePool,
}

impl FromStr for UnloadPolicy {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keep-nothing" | "no" => Ok(UnloadPolicy::KeepNothing),
            "destroy-on-idle" | "destroy" => Ok(UnloadPolicy::DestroyOnIdle),
            "reuse-pool" | "reuse" => Ok(UnloadPolicy::ReusePool),
            _ => Err("unrecognized unload policy. Valid values: keep-nothing, destroy-on-idle, reuse-pool"),
        }
    }
}

/// Preferred hardware decode path.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DecodeMode {
    #[default]
    VendorNative,
    ComputeFallback,
    OsNative,
}

impl DecodeMode {
    pub fn creation_flags(&self) -> CreateFlags {
        match self {
            DecodeMode::VendorNative => CreateFlags::PREFER_CUVID,
            DecodeMode::ComputeFallback => CreateFlags::PREFER_CUDA,
            DecodeMode::OsNative => CreateFlags::PREFER_DXVA,
        }
    }
}

impl FromStr for DecodeMode {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vendor-native" | "cuvid" => Ok(DecodeMode::VendorNative),
            "compute-fallback" | "cuda" => Ok(DecodeMode::ComputeFallback),
            "os-native" | "dxva" => Ok(DecodeMode::OsNative),
            _ => Err("unrecognized decode mode. Valid values: vendor-native, compute-fallback, os-native"),
        }
    }
}

/// How decoded pictures are delivered downstream. Fixed for the lifetime of a stage.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// Each picture is copied to a freshly allocated host buffer and dispatched.
    EagerCopy,
    /// Picture data is only copied when a consumer asks for a plane, into a single buffer shared
    /// by all pictures of the stage. Not safe if several consumers hold pictures at once.
    LazyCopy,
    /// Picture data is copied on the GPU into a texture owned by the stage.
    #[default]
    Texture,
}

impl FromStr for OutputMode {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eager-copy" | "copy" => Ok(OutputMode::EagerCopy),
            "lazy-copy" | "single" => Ok(OutputMode::LazyCopy),
            "zero-copy-texture" | "gl" => Ok(OutputMode::Texture),
            _ => Err("unrecognized output mode. Valid values: eager-copy, lazy-copy, zero-copy-texture"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NvDecOptions {
    /// Number of hardware surfaces to allocate.
    pub num_surfaces: u32,
    pub unload: UnloadPolicy,
    pub decode_mode: DecodeMode,
    pub output_mode: OutputMode,
    /// Output 10-bit streams in a 16-bit container instead of downconverting to 8 bits.
    pub ten_bit_output: bool,
}

impl Default for NvDecOptions {
    fn default() -> Self {
        Self {
            num_surfaces: 20,
            unload: Default::default(),
            decode_mode: Default::default(),
            output_mode: Default::default(),
            ten_bit_output: false,
        }
    }
}

impl FromStr for NvDecOptions {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut options = NvDecOptions::default();

        for arg in s.split(':').filter(|arg| !arg.is_empty()) {
            let (key, value) = arg
                .split_once('=')
                .ok_or_else(|| anyhow!("argument {:?} is not of the form key=value", arg))?;

            match key {
                "num_surfaces" => {
                    options.num_surfaces =
                        value.parse().with_context(|| format!("invalid num_surfaces {:?}", value))?
                }
                "unload" => options.unload = value.parse().map_err(|e: &str| anyhow!(e))?,
                "vmode" => options.decode_mode = value.parse().map_err(|e: &str| anyhow!(e))?,
                "fmode" => options.output_mode = value.parse().map_err(|e: &str| anyhow!(e))?,
                "ten_bit" => {
                    options.ten_bit_output =
                        value.parse().with_context(|| format!("invalid ten_bit {:?}", value))?
                }
                _ => return Err(anyhow!("unknown option {:?}", key)),
            }
        }

        if options.num_surfaces == 0 {
            return Err(anyhow!("num_surfaces must be at least 1"));
        }

        Ok(options)
    }
}
