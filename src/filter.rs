// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interface to the media pipeline hosting the decode stage.
//!
//! The pipeline delivers compressed packets on an [`InputPid`] and collects decoded pictures from
//! an [`OutputPid`]. Both sides carry typed stream properties ([`PidProp`]), and each packet
//! carries a set of [`PacketProps`] that the stage forwards from the compressed packet to the
//! picture decoded from it.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::video_frame::HwFrame;
use crate::PixelFormat;

/// Codec identifiers used by the pipeline.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CodecId {
    Mpeg1,
    Mpeg2Simple,
    Mpeg2Main,
    Mpeg2Snr,
    Mpeg2Spatial,
    Mpeg2High,
    Mpeg2_422,
    Mpeg4Part2,
    Avc,
    Hevc,
    /// Uncompressed pictures.
    Raw,
    Other(u32),
}

/// Stream properties of a pid.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PidProp {
    CodecId,
    /// Out-of-band decoder configuration (e.g. `avcC`).
    DecoderConfig,
    DecoderConfigEnhancement,
    Width,
    Height,
    Stride,
    BitDepthY,
    BitDepthUv,
    PixelFormat,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PropertyValue {
    Uint(u32),
    Bool(bool),
    Data(Bytes),
    CodecId(CodecId),
    PixelFormat(PixelFormat),
}

impl PropertyValue {
    pub fn as_uint(&self) -> Option<u32> {
        match self {
            PropertyValue::Uint(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_codec_id(&self) -> Option<CodecId> {
        match self {
            PropertyValue::CodecId(codec) => Some(*codec),
            _ => None,
        }
    }
}

/// Per-packet properties.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PacketProps {
    /// Composition timestamp.
    pub cts: u64,
    /// The packet only exists to reach a seek point and must not be presented.
    pub seek: bool,
    /// 0 for progressive, 1 for top field first, 2 for bottom field first.
    pub interlaced: u8,
    pub custom: BTreeMap<String, PropertyValue>,
}

impl PacketProps {
    /// Copies every property of `other` onto `self`.
    pub fn merge(&mut self, other: &PacketProps) {
        self.cts = other.cts;
        self.seek = other.seek;
        self.interlaced = other.interlaced;
        self.custom.extend(other.custom.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}

/// A compressed packet.
#[derive(Clone, Debug)]
pub struct Packet {
    pub data: Bytes,
    pub props: Arc<PacketProps>,
}

impl Packet {
    pub fn new(data: impl Into<Bytes>, cts: u64) -> Self {
        Self { data: data.into(), props: Arc::new(PacketProps { cts, ..Default::default() }) }
    }
}

/// Contents of a packet sent downstream.
#[derive(Debug)]
pub enum Payload {
    /// The whole picture, copied to host memory.
    Data(Vec<u8>),
    /// A handle giving access to the picture on demand.
    Frame(HwFrame),
}

#[derive(Debug)]
pub struct OutputPacket {
    pub props: PacketProps,
    pub payload: Payload,
}

/// Control events sent to the stage.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FilterEvent {
    /// Playback (re)starts, usually after a seek.
    Play,
    /// Playback stops, the stage may release its resources.
    Stop,
}

pub trait InputPid {
    /// Identifies the pid among the inputs of the pipeline.
    fn id(&self) -> u32;
    fn property(&self, prop: PidProp) -> Option<PropertyValue>;
    fn properties(&self) -> Vec<(PidProp, PropertyValue)>;
    /// Returns the packet at the head of the pid without removing it.
    fn get_packet(&mut self) -> Option<Packet>;
    /// Removes the packet at the head of the pid.
    fn drop_packet(&mut self);
    /// Whether the pid is empty and no more packets will come.
    fn is_eos(&self) -> bool;
}

pub trait OutputPid {
    /// Sets `prop`, or removes it if `value` is `None`.
    fn set_property(&mut self, prop: PidProp, value: Option<PropertyValue>);
    fn send(&mut self, packet: OutputPacket);
    fn set_eos(&mut self);
}
