// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Pool of idle hardware decoders shared by all the decode stages of a process.
//!
//! Creating a hardware decoder is expensive, so instead of destroying the decoder of a stage that
//! goes idle, the stage can hand its [`DecoderInstance`] back to the pool where another stage (or
//! the same one after a reconfiguration) can pick it up. An instance is always in exactly one
//! place: owned by a stage, idle in the pool, or destroyed.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use log::debug;
use log::info;

use crate::backend::CuResult;
use crate::backend::DecoderCreateInfo;
use crate::backend::DecoderHandle;
use crate::backend::Driver;
use crate::backend::ParserHandle;
use crate::backend::ParserParams;
use crate::CodecType;
use crate::ConfigKey;

/// Identifies a decode stage.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct StageId(pub u32);

/// A hardware parser and decoder pair, bound to the configuration it was built for.
#[derive(Debug)]
pub struct DecoderInstance {
    id: u32,
    pub(crate) key: Option<ConfigKey>,
    /// Stride of the frames produced by `decoder`.
    pub(crate) stride: u32,
    pub(crate) parser: Option<(ParserHandle, CodecType)>,
    pub(crate) decoder: Option<DecoderHandle>,
    owner: Option<StageId>,
}

impl DecoderInstance {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The configuration the instance was last set up for.
    pub fn key(&self) -> Option<&ConfigKey> {
        self.key.as_ref()
    }

    pub fn owner(&self) -> Option<StageId> {
        self.owner
    }

    pub fn has_decoder(&self) -> bool {
        self.decoder.is_some()
    }

    /// Whether the instance holds a hardware decoder built for exactly `key`.
    pub fn matches(&self, key: &ConfigKey) -> bool {
        self.key.as_ref() == Some(key)
    }
}

/// Outcome of [`DecoderPool::checkout`].
#[derive(Debug)]
pub enum Checkout {
    /// The instance holds a decoder built for the requested configuration and can be used as-is.
    Reused(DecoderInstance),
    /// The instance has no hardware decoder yet.
    NeedsCreation(DecoderInstance),
    /// The instance holds a decoder for another configuration, which must be replaced.
    Reconfigure(DecoderInstance),
}

impl Checkout {
    pub fn into_instance(self) -> DecoderInstance {
        match self {
            Checkout::Reused(inst) | Checkout::NeedsCreation(inst) | Checkout::Reconfigure(inst) => {
                inst
            }
        }
    }

    pub fn is_reused(&self) -> bool {
        matches!(self, Checkout::Reused(_))
    }
}

/// Idle decoder instances.
///
/// The pool lock only guards list manipulation. Creating and destroying hardware objects is done
/// by the caller outside of it, with the decode context current.
#[derive(Default)]
pub struct DecoderPool {
    idle: Mutex<Vec<DecoderInstance>>,
    next_id: AtomicU32,
    live_decoders: AtomicU32,
}

impl DecoderPool {
    pub fn new() -> Self {
        Default::default()
    }

    /// Number of instances currently idle in the pool.
    pub fn idle_len(&self) -> usize {
        self.idle.lock().unwrap().len()
    }

    /// Number of hardware decoders currently alive in the process.
    pub fn live_decoders(&self) -> u32 {
        self.live_decoders.load(Ordering::SeqCst)
    }

    fn new_instance(&self, owner: StageId) -> DecoderInstance {
        DecoderInstance {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            key: None,
            stride: 0,
            parser: None,
            decoder: None,
            owner: Some(owner),
        }
    }

    /// Finds an instance for `key` on behalf of stage `owner`, which currently holds `own` (if
    /// anything).
    ///
    /// An idle instance built for exactly `key` always wins. If `own` is displaced by it, `own`
    /// hands its parser over to the returned instance, since the parser carries the state of the
    /// stream being decoded, and is returned alongside it. The caller puts it back with
    /// [`return_to_pool`](Self::return_to_pool) once the pictures it decoded have been read.
    /// Otherwise `own` is returned, and only a stage holding nothing takes an arbitrary idle
    /// instance or a new one.
    pub fn checkout(
        &self,
        key: &ConfigKey,
        own: Option<DecoderInstance>,
        owner: StageId,
    ) -> (Checkout, Option<DecoderInstance>) {
        let mut idle = self.idle.lock().unwrap();

        if let Some(pos) = idle.iter().position(|inst| inst.matches(key) && inst.has_decoder()) {
            let mut inst = idle.swap_remove(pos);
            inst.owner = Some(owner);

            let displaced = own.map(|mut displaced| {
                std::mem::swap(&mut inst.parser, &mut displaced.parser);
                displaced.owner = None;
                displaced
            });

            return (Checkout::Reused(inst), displaced);
        }

        let checkout = match own {
            Some(mut inst) => {
                inst.owner = Some(owner);
                if !inst.has_decoder() {
                    Checkout::NeedsCreation(inst)
                } else if inst.matches(key) {
                    Checkout::Reused(inst)
                } else {
                    Checkout::Reconfigure(inst)
                }
            }
            None => match idle.pop() {
                Some(mut inst) => {
                    inst.owner = Some(owner);
                    if inst.has_decoder() {
                        Checkout::Reconfigure(inst)
                    } else {
                        Checkout::NeedsCreation(inst)
                    }
                }
                None => {
                    drop(idle);
                    Checkout::NeedsCreation(self.new_instance(owner))
                }
            },
        };

        (checkout, None)
    }

    /// Moves the hardware decoder of `inst` to a new unowned instance, leaving `inst` with its
    /// parser only.
    pub fn detach_decoder(&self, inst: &mut DecoderInstance) -> DecoderInstance {
        let detached = DecoderInstance {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            key: inst.key.take(),
            stride: inst.stride,
            parser: None,
            decoder: inst.decoder.take(),
            owner: None,
        };
        debug!("decoder instance {}: decoder moved to instance {}", inst.id, detached.id);
        detached
    }

    /// Makes `inst` available to other stages.
    pub fn return_to_pool(&self, mut inst: DecoderInstance) {
        debug!("decoder instance {} returned to pool", inst.id);
        inst.owner = None;
        self.idle.lock().unwrap().push(inst);
    }

    /// Creates a fresh hardware parser for `inst`, replacing any parser it held. A parser carries
    /// the state of the stream it was fed, so it is never carried over to a new stream.
    pub fn create_parser(
        &self,
        driver: &dyn Driver,
        inst: &mut DecoderInstance,
        params: &ParserParams,
    ) -> CuResult<()> {
        if let Some((parser, _)) = inst.parser.take() {
            driver.destroy_parser(parser);
        }

        let parser = driver.create_parser(params)?;
        inst.parser = Some((parser, params.codec));
        debug!("decoder instance {}: parser created for {:?}", inst.id, params.codec);
        Ok(())
    }

    /// Builds the hardware decoder of `inst` for `key`.
    pub fn create_decoder(
        &self,
        driver: &dyn Driver,
        inst: &mut DecoderInstance,
        key: ConfigKey,
        info: &DecoderCreateInfo,
    ) -> CuResult<()> {
        self.destroy_decoder(driver, inst);

        let decoder = driver.create_decoder(info)?;
        inst.decoder = Some(decoder);
        inst.key = Some(key);

        let live = self.live_decoders.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            "decoder instance {} created ({}x{} {}) - {} decoders loaded",
            inst.id,
            key.width,
            key.height,
            key.codec.name(),
            live
        );
        Ok(())
    }

    /// Destroys the hardware decoder of `inst`, if any. The parser is kept.
    pub fn destroy_decoder(&self, driver: &dyn Driver, inst: &mut DecoderInstance) {
        if let Some(decoder) = inst.decoder.take() {
            driver.destroy_decoder(decoder);
            let live = self.live_decoders.fetch_sub(1, Ordering::SeqCst) - 1;
            info!("decoder instance {} destroyed - {} decoders still loaded", inst.id, live);
        }
    }

    /// Destroys every hardware object held by `inst`.
    pub fn destroy_instance(&self, driver: &dyn Driver, mut inst: DecoderInstance) {
        self.destroy_decoder(driver, &mut inst);
        if let Some((parser, _)) = inst.parser.take() {
            driver.destroy_parser(parser);
        }
    }

    /// Destroys all idle instances. Called when the last stage of the process goes away.
    pub fn destroy_all(&self, driver: &dyn Driver) {
        let idle = std::mem::take(&mut *self.idle.lock().unwrap());
        for inst in idle {
            self.destroy_instance(driver, inst);
        }
    }
}
