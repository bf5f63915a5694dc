// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use crate::filter::PacketProps;

/// Properties of the compressed packets submitted to the parser, kept until the picture decoded
/// from each packet claims them by timestamp.
#[derive(Debug, Default)]
pub struct SourcePackets {
    held: Vec<Arc<PacketProps>>,
}

impl SourcePackets {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn submit(&mut self, props: Arc<PacketProps>) {
        self.held.push(props);
    }

    /// Merges the properties of the packet with timestamp `cts` into `dst` and forgets the packet.
    /// Returns `false` if no such packet is held.
    pub fn claim(&mut self, cts: u64, dst: &mut PacketProps) -> bool {
        match self.held.iter().position(|props| props.cts == cts) {
            Some(pos) => {
                let props = self.held.remove(pos);
                dst.merge(&props);
                true
            }
            None => false,
        }
    }

    /// Forgets all held packets.
    pub fn drain(&mut self) {
        self.held.clear();
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}
