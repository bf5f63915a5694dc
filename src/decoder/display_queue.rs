// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reordering of decoded pictures into presentation order.
//!
//! The hardware reports pictures ready for display in decode order. They are kept here, sorted by
//! timestamp, until the stage delivers them. Picture records live in an arena and are recycled
//! through a freelist, so handles stay valid while a picture is held downstream.

use std::collections::VecDeque;

use log::debug;

use crate::backend::DecoderHandle;
use crate::backend::DisplayInfo;
use crate::pool::StageId;
use crate::FrameLayout;

/// Handle to a picture record of a [`DisplayQueue`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PictureId(usize);

/// The decoder holding the pixels of a picture, and the layout they are read out with.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PictureSource {
    pub decoder: DecoderHandle,
    pub layout: FrameLayout,
}

/// A decoded picture waiting to be displayed. Holds no pixel data: the pixels stay in the
/// decoder's surface `picture_index` until mapped.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PendingPicture {
    pub picture_index: i32,
    pub timestamp: u64,
    pub progressive: bool,
    pub top_field_first: bool,
    pub repeat_first_field: i32,
    /// Luma plane already copied out for this picture.
    pub y_mapped: bool,
    /// Chroma plane already copied out for this picture.
    pub uv_mapped: bool,
    pub owner: Option<StageId>,
    /// Set by the stage when the picture is queued. A picture without a source cannot be read.
    pub source: Option<PictureSource>,
}

#[derive(Debug, Default)]
pub struct DisplayQueue {
    slots: Vec<PendingPicture>,
    free: Vec<PictureId>,
    queue: VecDeque<PictureId>,
}

impl DisplayQueue {
    pub fn new() -> Self {
        Default::default()
    }

    /// Queues the picture described by `info`, keeping the queue sorted by timestamp. Pictures
    /// with equal timestamps stay in decode order.
    ///
    /// Returns `None` if the picture was discarded because its timestamp is out of the valid
    /// 32-bit range, which marks pictures decoded while seeking.
    pub fn on_picture_ready(&mut self, info: &DisplayInfo, owner: StageId) -> Option<PictureId> {
        if info.timestamp > u32::MAX as u64 {
            debug!("picture {} discarded while seeking", info.picture_index);
            return None;
        }

        let id = self.acquire();
        self.slots[id.0] = PendingPicture {
            picture_index: info.picture_index,
            timestamp: info.timestamp,
            progressive: info.progressive_frame,
            top_field_first: info.top_field_first,
            repeat_first_field: info.repeat_first_field,
            y_mapped: false,
            uv_mapped: false,
            owner: Some(owner),
            source: None,
        };

        let pos = self
            .queue
            .iter()
            .position(|queued| self.slots[queued.0].timestamp > info.timestamp)
            .unwrap_or(self.queue.len());
        self.queue.insert(pos, id);

        debug!(
            "picture {} queued for display at {} ({} pending)",
            info.picture_index,
            info.timestamp,
            self.queue.len()
        );
        Some(id)
    }

    fn acquire(&mut self) -> PictureId {
        match self.free.pop() {
            Some(id) => id,
            None => {
                self.slots.push(Default::default());
                PictureId(self.slots.len() - 1)
            }
        }
    }

    /// Removes the picture with the earliest timestamp from the queue. It must be handed back
    /// with [`release`](Self::release) once consumed.
    pub fn pop_next(&mut self) -> Option<PictureId> {
        self.queue.pop_front()
    }

    /// Clears `id` and puts it back in the freelist.
    pub fn release(&mut self, id: PictureId) {
        if let Some(slot) = self.slots.get_mut(id.0) {
            *slot = Default::default();
            if !self.free.contains(&id) {
                self.free.push(id);
            }
        }
    }

    /// Drops all queued pictures without delivering them. Pictures already popped are not
    /// affected.
    pub fn reset(&mut self) {
        while let Some(id) = self.queue.pop_back() {
            self.release(id);
        }
    }

    pub fn get(&self, id: PictureId) -> Option<&PendingPicture> {
        self.slots.get(id.0)
    }

    pub fn get_mut(&mut self, id: PictureId) -> Option<&mut PendingPicture> {
        self.slots.get_mut(id.0)
    }

    /// Whether a picture read from `decoder` is still queued, or popped and not yet released.
    pub fn holds_decoder(&self, decoder: DecoderHandle) -> bool {
        self.slots.iter().any(|picture| picture.source.is_some_and(|src| src.decoder == decoder))
    }

    /// Number of pictures waiting to be displayed.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of recycled picture records ready for reuse.
    pub fn free_len(&self) -> usize {
        self.free.len()
    }
}
