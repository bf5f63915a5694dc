// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The GPU context shared by every decode stage of a process.
//!
//! A [`DecodeEnvironment`] is created once and handed to each stage through an `Arc`. The context
//! itself is only created when the first stage [acquires](DecodeEnvironment::acquire) the
//! environment, and torn down, together with the idle decoders of the [`DecoderPool`], when the
//! last one releases it.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use log::debug;
use log::error;
use log::info;
use log::warn;
use thiserror::Error;

use crate::backend::ContextHandle;
use crate::backend::CuError;
use crate::backend::Driver;
use crate::pool::DecoderPool;
use crate::pool::StageId;

#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("failed to initialize the driver: {0}")]
    Init(CuError),
    #[error("no capable device found")]
    NoDevice,
    #[error("failed to query device: {0}")]
    Device(CuError),
    #[error("failed to create context: {0}")]
    ContextCreate(CuError),
    #[error("failed to make context current: {0}")]
    MakeCurrent(CuError),
    #[error("the decode environment has not been acquired")]
    NotAcquired,
}

#[derive(Default)]
struct EnvState {
    refs: u32,
    context: Option<ContextHandle>,
    gl_interop: bool,
}

pub struct DecodeEnvironment {
    driver: Arc<dyn Driver>,
    pool: DecoderPool,
    state: Mutex<EnvState>,
    next_stage: AtomicU32,
}

impl DecodeEnvironment {
    pub fn new(driver: Arc<dyn Driver>) -> Arc<Self> {
        Arc::new(Self {
            driver,
            pool: DecoderPool::new(),
            state: Default::default(),
            next_stage: AtomicU32::new(0),
        })
    }

    /// Returns whether `driver` can be initialized and reports at least one device.
    pub fn probe(driver: &dyn Driver) -> bool {
        if let Err(e) = driver.init() {
            debug!("driver not usable: {}", e);
            return false;
        }

        match driver.device_count() {
            Ok(count) => count > 0,
            Err(e) => {
                debug!("failed to enumerate devices: {}", e);
                false
            }
        }
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn pool(&self) -> &DecoderPool {
        &self.pool
    }

    pub fn next_stage_id(&self) -> StageId {
        StageId(self.next_stage.fetch_add(1, Ordering::SeqCst))
    }

    /// Number of stages currently holding the environment.
    pub fn refs(&self) -> u32 {
        self.state.lock().unwrap().refs
    }

    /// Whether the context can share buffers with the graphics API.
    pub fn gl_interop(&self) -> bool {
        self.state.lock().unwrap().gl_interop
    }

    /// Takes a reference on the environment, creating the context on first use.
    ///
    /// If `want_gl` is set, the context is created with graphics interop and falls back to a
    /// plain context if that fails. Returns whether the context supports graphics interop.
    pub fn acquire(&self, want_gl: bool) -> Result<bool, EnvironmentError> {
        let mut state = self.state.lock().unwrap();

        if state.context.is_none() {
            let driver = self.driver.as_ref();

            driver.init().map_err(EnvironmentError::Init)?;
            let count = driver.device_count().map_err(EnvironmentError::Device)?;
            if count == 0 {
                return Err(EnvironmentError::NoDevice);
            }

            let device = driver.device_get(0).map_err(EnvironmentError::Device)?;
            let name = driver.device_name(device).map_err(EnvironmentError::Device)?;
            let (major, minor) =
                driver.device_compute_capability(device).map_err(EnvironmentError::Device)?;
            info!(
                "{} device(s) found, using {} (compute capability {}.{})",
                count, name, major, minor
            );

            let gl_context = match want_gl {
                true => driver
                    .ctx_create(device, true)
                    .map_err(|e| warn!("failed to create GL interop context ({}), using plain one", e))
                    .ok(),
                false => None,
            };
            let (context, gl_interop) = match gl_context {
                Some(context) => (context, true),
                None => {
                    let context =
                        driver.ctx_create(device, false).map_err(EnvironmentError::ContextCreate)?;
                    (context, false)
                }
            };

            state.context = Some(context);
            state.gl_interop = gl_interop;
        }

        state.refs += 1;
        Ok(state.gl_interop)
    }

    /// Drops a reference taken by [`acquire`](Self::acquire). The last reference destroys the
    /// idle decoders, the context and unloads the driver.
    pub fn release(&self) {
        let mut state = self.state.lock().unwrap();

        if state.refs == 0 {
            error!("decode environment released more times than acquired");
            return;
        }

        state.refs -= 1;
        if state.refs > 0 {
            return;
        }

        if let Some(context) = state.context.take() {
            match self.driver.ctx_push_current(context) {
                Ok(()) => {
                    self.pool.destroy_all(self.driver.as_ref());
                    self.driver.ctx_pop_current();
                }
                Err(e) => error!("failed to make context current for teardown: {}", e),
            }
            self.driver.ctx_destroy(context);
            self.driver.uninit();
            state.gl_interop = false;
            info!("decode environment torn down");
        }
    }

    /// Makes the context current on the calling thread until the returned guard is dropped.
    pub fn make_current(&self) -> Result<CurrentContext<'_>, EnvironmentError> {
        let context = self.state.lock().unwrap().context.ok_or(EnvironmentError::NotAcquired)?;
        self.driver.ctx_push_current(context).map_err(EnvironmentError::MakeCurrent)?;
        Ok(CurrentContext { env: self })
    }
}

/// The context is current on this thread while this guard is alive.
pub struct CurrentContext<'a> {
    env: &'a DecodeEnvironment,
}

impl<'a> CurrentContext<'a> {
    pub fn driver(&self) -> &'a dyn Driver {
        self.env.driver.as_ref()
    }
}

impl Drop for CurrentContext<'_> {
    fn drop(&mut self) {
        self.env.driver.ctx_pop_current();
    }
}
