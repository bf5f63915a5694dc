// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decode stage.
//!
//! An [`NvDecoder`] pulls compressed packets from one input pid, pushes them through a hardware
//! parser and decoder, and sends the decoded pictures downstream in presentation order. Each call
//! to [`NvDecoder::process`] parses at most one packet and delivers at most one picture.
//!
//! The hardware objects live in a [`DecoderInstance`] which the stage checks out of the
//! process-wide [`DecoderPool`](crate::pool::DecoderPool) when the stream is set up, and again
//! whenever a sequence header changes the configuration. How the instance is disposed of when the
//! stage goes idle is set by [`UnloadPolicy`].

pub mod display_queue;
mod sequence;
pub mod source_packets;

use std::sync::Arc;
use std::sync::Mutex;

use log::debug;
use log::error;
use log::info;
use log::warn;
use thiserror::Error;

use crate::backend::CuError;
use crate::backend::Driver;
use crate::backend::PacketFlags;
use crate::backend::ParserParams;
use crate::backend::SourceDataPacket;
use crate::config::NvDecOptions;
use crate::config::OutputMode;
use crate::config::UnloadPolicy;
use crate::decoder::display_queue::PictureId;
use crate::decoder::source_packets::SourcePackets;
use crate::environment::DecodeEnvironment;
use crate::environment::EnvironmentError;
use crate::filter::CodecId;
use crate::filter::FilterEvent;
use crate::filter::InputPid;
use crate::filter::OutputPacket;
use crate::filter::OutputPid;
use crate::filter::PacketProps;
use crate::filter::Payload;
use crate::filter::PidProp;
use crate::filter::PropertyValue;
use crate::pool::DecoderInstance;
use crate::pool::StageId;
use crate::video_frame::download_picture;
use crate::video_frame::FrameState;
use crate::video_frame::HwFrame;
use crate::video_frame::Staging;
use crate::ChromaFormat;
use crate::CodecType;
use crate::ConfigKey;
use crate::FrameLayout;
use crate::PixelFormat;

/// Maximum number of pictures the parser may hold back for reordering.
const MAX_DISPLAY_DELAY: u32 = 4;
/// Timestamps are passed through the parser in milliseconds.
const CLOCK_RATE: u32 = 1000;

#[derive(Debug, Error)]
pub enum ConfigureError {
    #[error("codec {0:?} is not supported")]
    UnsupportedCodec(Option<CodecId>),
    #[error("{0} streams must be in Annex B format")]
    AnnexBRequired(&'static str),
    #[error("the stage is already bound to another input")]
    RequiresNewInstance,
    #[error(transparent)]
    Environment(#[from] EnvironmentError),
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to create hardware decoder: {0}")]
    DecoderCreate(CuError),
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),
    #[error(transparent)]
    Environment(#[from] EnvironmentError),
}

/// Where the stage stands with respect to the stream configuration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// No parser is set up yet, or the stage has been deactivated.
    NeedsSetup,
    Configured,
    /// A pooled decoder for the new configuration was adopted.
    ReloadLight,
    /// A decoder was (re)created for the new configuration.
    ReloadFull,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProcessStatus {
    Continue,
    /// All pictures have been delivered and the output is at end of stream.
    Eos,
}

/// Parser codec for a pipeline codec identifier.
pub fn codec_type(codec: CodecId) -> Option<CodecType> {
    match codec {
        CodecId::Mpeg1 => Some(CodecType::Mpeg1),
        CodecId::Mpeg2Simple
        | CodecId::Mpeg2Main
        | CodecId::Mpeg2Snr
        | CodecId::Mpeg2Spatial
        | CodecId::Mpeg2High
        | CodecId::Mpeg2_422 => Some(CodecType::Mpeg2),
        CodecId::Mpeg4Part2 => Some(CodecType::Mpeg4),
        CodecId::Avc => Some(CodecType::H264),
        CodecId::Hevc => Some(CodecType::Hevc),
        CodecId::Raw | CodecId::Other(_) => None,
    }
}

/// A decoder swapped out while pictures it decoded were still queued or held downstream.
struct RetiredDecoder {
    inst: DecoderInstance,
    /// Goes idle in the pool once its pictures are consumed, instead of being destroyed.
    pooled: bool,
}

pub struct NvDecoder {
    id: StageId,
    options: NvDecOptions,
    /// Output mode in effect, which may differ from the requested one if graphics interop is not
    /// available.
    output_mode: OutputMode,
    env: Arc<DecodeEnvironment>,
    env_acquired: bool,

    input: Option<u32>,
    codec: Option<CodecType>,
    /// Size announced by the input pid, used to look for a pooled decoder before the first
    /// sequence header.
    pid_size: (u32, u32),

    frames: Arc<Mutex<FrameState>>,
    staging: Arc<Mutex<Staging>>,
    instance: Option<DecoderInstance>,
    retired: Vec<RetiredDecoder>,
    key: Option<ConfigKey>,
    layout: Option<FrameLayout>,
    state: StreamState,

    /// The packet at the head of the input has already been parsed.
    skip_next_parse: bool,
    eos_sent: bool,
    publish_format: bool,
    /// Set when a hardware decoder could not be created. Cleared by deactivation.
    fault: Option<CuError>,
    fault_reported: bool,
    decode_error: Option<CuError>,
    source_packets: SourcePackets,
}

impl NvDecoder {
    pub fn new(env: Arc<DecodeEnvironment>, options: NvDecOptions) -> Self {
        let output_mode = match options.output_mode {
            OutputMode::Texture if !cfg!(feature = "gl") => OutputMode::EagerCopy,
            mode => mode,
        };

        Self {
            id: env.next_stage_id(),
            options,
            output_mode,
            env,
            env_acquired: false,
            input: None,
            codec: None,
            pid_size: (0, 0),
            frames: Default::default(),
            staging: Default::default(),
            instance: None,
            retired: Vec::new(),
            key: None,
            layout: None,
            state: StreamState::NeedsSetup,
            skip_next_parse: false,
            eos_sent: false,
            publish_format: false,
            fault: None,
            fault_reported: false,
            decode_error: None,
            source_packets: SourcePackets::new(),
        }
    }

    pub fn id(&self) -> StageId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn output_mode(&self) -> OutputMode {
        self.output_mode
    }

    /// Layout of the pictures currently produced, once known.
    pub fn layout(&self) -> Option<&FrameLayout> {
        self.layout.as_ref()
    }

    pub fn name(&self) -> String {
        let prefix = match self.output_mode {
            OutputMode::Texture => "NVidia HWGL",
            _ => "NVidia HW",
        };
        match self.codec {
            Some(codec) => format!("{} {}", prefix, codec.name()),
            None => prefix.to_string(),
        }
    }

    /// Binds the stage to `input` and sets up the properties of `output`.
    ///
    /// Can be called again on the same pid when its properties change. The decode environment is
    /// acquired on the first call.
    pub fn configure_pid(
        &mut self,
        input: &dyn InputPid,
        output: &mut dyn OutputPid,
    ) -> Result<(), ConfigureError> {
        if self.input.is_some_and(|id| id != input.id()) {
            return Err(ConfigureError::RequiresNewInstance);
        }

        let codec_id = input.property(PidProp::CodecId).and_then(|v| v.as_codec_id());
        let codec =
            codec_id.and_then(codec_type).ok_or(ConfigureError::UnsupportedCodec(codec_id))?;

        if matches!(codec, CodecType::H264 | CodecType::Hevc)
            && input.property(PidProp::DecoderConfig).is_some()
        {
            return Err(ConfigureError::AnnexBRequired(codec.name()));
        }

        if !self.env_acquired {
            let want_gl = self.output_mode == OutputMode::Texture;
            let gl_interop = self.env.acquire(want_gl)?;
            self.env_acquired = true;
            if want_gl && !gl_interop {
                warn!("stage {}: no graphics interop, falling back to eager copy", self.id.0);
                self.output_mode = OutputMode::EagerCopy;
            }
        }

        for (prop, value) in input.properties() {
            output.set_property(prop, Some(value));
        }
        output.set_property(PidProp::CodecId, Some(PropertyValue::CodecId(CodecId::Raw)));
        output.set_property(PidProp::DecoderConfig, None);
        output.set_property(PidProp::DecoderConfigEnhancement, None);

        let size_prop = |prop| input.property(prop).and_then(|v| v.as_uint()).unwrap_or(0);
        self.pid_size = (size_prop(PidProp::Width), size_prop(PidProp::Height));

        if self.codec != Some(codec) {
            debug!("stage {}: configured for {}", self.id.0, codec.name());
            self.state = StreamState::NeedsSetup;
        }
        self.codec = Some(codec);
        self.input = Some(input.id());

        Ok(())
    }

    /// Detaches the stage from its input.
    pub fn remove_pid(&mut self) {
        self.deactivate();
        self.input = None;
        self.codec = None;
    }

    /// Checks out a decoder instance for the stream and gives it a fresh parser.
    fn configure_stream(&mut self) -> Result<(), ProcessError> {
        let codec = self
            .codec
            .ok_or_else(|| ProcessError::UnsupportedConfiguration("no input configured".into()))?;

        let guess = ConfigKey {
            width: self.pid_size.0,
            height: self.pid_size.1,
            bpp_luma: 8,
            bpp_chroma: 8,
            codec,
            chroma_format: ChromaFormat::Yuv420,
        };

        let env = Arc::clone(&self.env);
        let current = env.make_current()?;

        let (checkout, displaced) = env.pool().checkout(&guess, self.instance.take(), self.id);
        if let Some(displaced) = displaced {
            self.hand_back(displaced);
        }
        let reused = checkout.is_reused();
        let mut inst = checkout.into_instance();

        if reused {
            info!("stage {}: reusing decoder instance {} for the new stream", self.id.0, inst.id());
            let format = PixelFormat::Nv12;
            self.key = Some(guess);
            self.layout =
                Some(FrameLayout::with_stride(format, guess.width, guess.height, inst.stride));
            self.publish_format = true;
        }

        let params = ParserParams {
            codec,
            max_decode_surfaces: self.options.num_surfaces,
            max_display_delay: MAX_DISPLAY_DELAY,
            clock_rate: CLOCK_RATE,
        };
        let res = env.pool().create_parser(current.driver(), &mut inst, &params);
        self.instance = Some(inst);

        res.map_err(|e| {
            ProcessError::UnsupportedConfiguration(format!("failed to create parser: {}", e))
        })?;

        self.state = StreamState::Configured;
        self.skip_next_parse = false;
        self.eos_sent = false;
        Ok(())
    }

    /// Whether pictures read from the decoder of `inst` are still queued or held downstream.
    pub(super) fn has_pictures_from(&self, inst: &DecoderInstance) -> bool {
        inst.decoder.is_some_and(|decoder| self.frames.lock().unwrap().queue.holds_decoder(decoder))
    }

    /// Keeps `inst` out of the pool until the pictures it decoded have been consumed.
    pub(super) fn retire(&mut self, inst: DecoderInstance, pooled: bool) {
        debug!("stage {}: keeping decoder instance {} until drained", self.id.0, inst.id());
        self.retired.push(RetiredDecoder { inst, pooled });
    }

    /// Puts an instance displaced by a pooled one back in the pool, once its pictures are read.
    pub(super) fn hand_back(&mut self, displaced: DecoderInstance) {
        if self.has_pictures_from(&displaced) {
            self.retire(displaced, true);
        } else {
            self.env.pool().return_to_pool(displaced);
        }
    }

    /// Disposes of the retired decoders with no picture left, or of all of them if `all` is set.
    /// The context must be current.
    fn release_retired(&mut self, driver: &dyn Driver, all: bool) {
        if self.retired.is_empty() {
            return;
        }

        let frames = self.frames.lock().unwrap();
        let (done, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.retired).into_iter().partition(|retired| {
                all || !retired.inst.decoder.is_some_and(|d| frames.queue.holds_decoder(d))
            });
        drop(frames);
        self.retired = kept;

        let pool = self.env.pool();
        for retired in done {
            debug!("stage {}: releasing decoder instance {}", self.id.0, retired.inst.id());
            match retired.pooled {
                true => pool.return_to_pool(retired.inst),
                false => pool.destroy_instance(driver, retired.inst),
            }
        }
    }

    fn unsupported_configuration(&self) -> ProcessError {
        let key = self.key.unwrap_or_default();
        ProcessError::UnsupportedConfiguration(format!(
            "{}x{} {:?} {} bpp",
            key.width, key.height, key.chroma_format, key.bpp_luma
        ))
    }

    /// Drives the stage: parses at most one packet from `input` and sends at most one picture to
    /// `output`.
    pub fn process(
        &mut self,
        input: &mut dyn InputPid,
        output: &mut dyn OutputPid,
    ) -> Result<ProcessStatus, ProcessError> {
        if self.state == StreamState::NeedsSetup {
            self.configure_stream()?;
        }

        let packet = input.get_packet();
        if packet.is_none() {
            self.skip_next_parse = false;
        }

        if let Some(err) = self.fault {
            return self.drain_faulted(err, input, output);
        }

        if matches!(self.state, StreamState::ReloadLight | StreamState::ReloadFull)
            && self.layout.is_none()
        {
            return Err(self.unsupported_configuration());
        }

        let parser = self
            .instance
            .as_ref()
            .and_then(|inst| inst.parser)
            .map(|(parser, _)| parser)
            .ok_or_else(|| ProcessError::UnsupportedConfiguration("no parser".into()))?;

        let env = Arc::clone(&self.env);
        let current = env.make_current()?;
        let driver = current.driver();
        self.release_retired(driver, false);

        if self.skip_next_parse {
            self.skip_next_parse = false;
        } else {
            match &packet {
                Some(packet) => {
                    self.eos_sent = false;
                    self.source_packets.submit(Arc::clone(&packet.props));
                    let data = SourceDataPacket {
                        flags: PacketFlags { timestamp: true, ..Default::default() },
                        payload: &packet.data[..],
                        timestamp: packet.props.cts,
                    };
                    if let Err(e) = driver.parse_data(parser, &data, self) {
                        error!("stage {}: failed to parse packet: {}", self.id.0, e);
                    }
                }
                None if input.is_eos() && !self.eos_sent => {
                    debug!("stage {}: flushing parser", self.id.0);
                    self.eos_sent = true;
                    let data = SourceDataPacket {
                        flags: PacketFlags { end_of_stream: true, ..Default::default() },
                        ..Default::default()
                    };
                    if let Err(e) = driver.parse_data(parser, &data, self) {
                        error!("stage {}: failed to flush parser: {}", self.id.0, e);
                    }
                }
                None => (),
            }
        }

        if self.publish_format {
            self.publish_format = false;
            self.publish_format(output);
        }

        if let Some(err) = self.fault {
            if packet.is_some() {
                input.drop_packet();
            }
            self.frames.lock().unwrap().queue.reset();
            self.fault_reported = true;
            return Err(ProcessError::DecoderCreate(err));
        }

        if matches!(self.state, StreamState::ReloadLight | StreamState::ReloadFull) {
            if self.layout.is_none() {
                return Err(self.unsupported_configuration());
            }
            debug!("stage {}: configuration changed ({:?})", self.id.0, self.state);
            // The packet that carried the sequence header has been parsed already, it is dropped
            // by the next call.
            self.skip_next_parse = packet.is_some();
            self.state = StreamState::Configured;
            return Ok(ProcessStatus::Continue);
        }

        if packet.is_some() {
            input.drop_packet();
        }

        let next = self.frames.lock().unwrap().queue.pop_next();
        match next {
            Some(picture) => {
                self.deliver(picture, driver, output);
                Ok(ProcessStatus::Continue)
            }
            None if packet.is_none() && input.is_eos() => {
                self.source_packets.drain();
                output.set_eos();
                Ok(ProcessStatus::Eos)
            }
            None => Ok(ProcessStatus::Continue),
        }
    }

    /// Discards input after a decoder creation failure until the end of stream.
    fn drain_faulted(
        &mut self,
        err: CuError,
        input: &mut dyn InputPid,
        output: &mut dyn OutputPid,
    ) -> Result<ProcessStatus, ProcessError> {
        if input.get_packet().is_some() {
            input.drop_packet();
        } else if input.is_eos() {
            self.source_packets.drain();
            output.set_eos();
            return Ok(ProcessStatus::Eos);
        }

        if !self.fault_reported {
            self.fault_reported = true;
            return Err(ProcessError::DecoderCreate(err));
        }
        Ok(ProcessStatus::Continue)
    }

    fn publish_format(&self, output: &mut dyn OutputPid) {
        let (Some(key), Some(layout)) = (self.key, self.layout) else {
            return;
        };
        let (bpp_luma, bpp_chroma) = match layout.format.is_high_bit_depth() {
            true => (key.bpp_luma, key.bpp_chroma),
            false => (8, 8),
        };

        info!(
            "stage {}: output {}x{} {:?}, stride {}",
            self.id.0, layout.width, layout.height, layout.format, layout.stride
        );
        output.set_property(PidProp::Width, Some(PropertyValue::Uint(layout.width)));
        output.set_property(PidProp::Height, Some(PropertyValue::Uint(layout.height)));
        output.set_property(PidProp::Stride, Some(PropertyValue::Uint(layout.stride)));
        output.set_property(PidProp::BitDepthY, Some(PropertyValue::Uint(bpp_luma)));
        output.set_property(PidProp::BitDepthUv, Some(PropertyValue::Uint(bpp_chroma)));
        output.set_property(PidProp::PixelFormat, Some(PropertyValue::PixelFormat(layout.format)));
    }

    fn release_picture(&self, picture: PictureId) {
        self.frames.lock().unwrap().queue.release(picture);
    }

    /// Sends `picture` downstream. The context must be current.
    fn deliver(&mut self, picture: PictureId, driver: &dyn Driver, output: &mut dyn OutputPid) {
        let (pending, last) = {
            let frames = self.frames.lock().unwrap();
            (frames.queue.get(picture).cloned(), frames.queue.is_empty())
        };
        let Some(pending) = pending else {
            return;
        };

        let mut props = PacketProps::default();
        if !self.source_packets.claim(pending.timestamp, &mut props) {
            props.cts = pending.timestamp;
            if props.interlaced == 0 && !pending.progressive {
                props.interlaced = if pending.top_field_first { 1 } else { 2 };
            }
        }

        if props.seek {
            debug!("stage {}: dropping seek picture {}", self.id.0, pending.timestamp);
            self.release_picture(picture);
            return;
        }

        let Some(source) = pending.source else {
            error!("stage {}: picture {} has no decoder", self.id.0, pending.picture_index);
            self.release_picture(picture);
            return;
        };

        match self.output_mode {
            OutputMode::EagerCopy => {
                let layout = source.layout;
                let mut data = vec![0u8; layout.out_size];
                let res = download_picture(driver, source.decoder, &pending, &layout, &mut data);
                self.release_picture(picture);

                match res {
                    Ok(()) => output.send(OutputPacket { props, payload: Payload::Data(data) }),
                    Err(e) => warn!(
                        "stage {}: discarding picture {}: {}",
                        self.id.0, pending.timestamp, e
                    ),
                }
            }
            OutputMode::LazyCopy | OutputMode::Texture => {
                let frame = HwFrame::new(
                    picture,
                    source,
                    Arc::clone(&self.env),
                    Arc::clone(&self.frames),
                    Arc::clone(&self.staging),
                    last && self.eos_sent,
                );
                output.send(OutputPacket { props, payload: Payload::Frame(frame) });
            }
        }
    }

    pub fn process_event(&mut self, event: FilterEvent) {
        match event {
            FilterEvent::Play => {
                debug!("stage {}: play, discarding queued pictures", self.id.0);
                self.frames.lock().unwrap().queue.reset();
            }
            FilterEvent::Stop => self.deactivate(),
        }
    }

    /// Puts the stage to rest, disposing of its hardware decoder according to the unload policy.
    /// The stream is set up again on the next call to [`process`](Self::process).
    pub fn deactivate(&mut self) {
        self.frames.lock().unwrap().queue.reset();
        self.source_packets.drain();

        if self.env_acquired {
            let env = Arc::clone(&self.env);
            match env.make_current() {
                Ok(current) => self.unload(current.driver()),
                Err(e) => error!("stage {}: cannot release hardware objects: {}", self.id.0, e),
            };
        }

        self.state = StreamState::NeedsSetup;
        self.fault = None;
        self.fault_reported = false;
        self.decode_error = None;
    }

    /// Releases the textures and the retired decoders, then disposes of the current instance as
    /// the unload policy says. The context must be current.
    fn unload(&mut self, driver: &dyn Driver) {
        #[cfg(feature = "gl")]
        self.frames.lock().unwrap().release_textures(driver);
        self.release_retired(driver, false);

        let Some(mut inst) = self.instance.take() else {
            return;
        };
        let pool = self.env.pool();
        match self.options.unload {
            UnloadPolicy::KeepNothing => self.instance = Some(inst),
            UnloadPolicy::DestroyOnIdle => {
                pool.destroy_decoder(driver, &mut inst);
                self.instance = Some(inst);
            }
            UnloadPolicy::ReusePool => {
                if let Some(e) = self.decode_error {
                    info!("stage {}: not pooling decoder after decode error {}", self.id.0, e);
                    pool.destroy_decoder(driver, &mut inst);
                }
                pool.return_to_pool(inst);
                self.key = None;
                self.layout = None;
            }
        }
    }
}

impl Drop for NvDecoder {
    fn drop(&mut self) {
        self.frames.lock().unwrap().queue.reset();
        self.source_packets.drain();

        if !self.env_acquired {
            return;
        }

        let env = Arc::clone(&self.env);
        match env.make_current() {
            Ok(current) => {
                let driver = current.driver();
                #[cfg(feature = "gl")]
                self.frames.lock().unwrap().release_textures(driver);
                self.release_retired(driver, true);

                if let Some(mut inst) = self.instance.take() {
                    match self.options.unload {
                        UnloadPolicy::ReusePool => {
                            if self.decode_error.is_some() {
                                env.pool().destroy_decoder(driver, &mut inst);
                            }
                            env.pool().return_to_pool(inst);
                        }
                        _ => env.pool().destroy_instance(driver, inst),
                    }
                }
            }
            Err(e) => {
                error!("stage {}: cannot release hardware objects: {}", self.id.0, e);
                if self.options.unload == UnloadPolicy::ReusePool {
                    if let Some(inst) = self.instance.take() {
                        env.pool().return_to_pool(inst);
                    }
                }
            }
        }

        env.release();
    }
}
