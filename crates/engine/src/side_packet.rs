// SPDX-FileCopyrightText: © 2025 FlowGraph Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Output side packets.
//!
//! A side packet is a single untimed value produced at most once per run,
//! either supplied to the graph at start or emitted by a node during Open.
//! Consumers cannot open until every side packet they declare is present, so
//! each [`OutputSidePacket`] tracks which node/local-name slots it feeds.

use flowgraph_core::error::{FlowGraphError, Result};
use flowgraph_core::packet::Packet;
use flowgraph_core::packet_type::PacketType;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// One consumer slot of a side packet: the node index and the name the node
/// declared it under.
#[derive(Debug, Clone)]
pub struct SidePacketMirror {
    pub node: usize,
    pub local_name: Arc<str>,
}

/// A write-once value shared with every declared consumer.
pub struct OutputSidePacket {
    name: Arc<str>,
    packet_type: PacketType,
    value: Mutex<Option<Packet>>,
    mirrors: RwLock<Vec<SidePacketMirror>>,
}

impl OutputSidePacket {
    pub fn new(name: Arc<str>, packet_type: PacketType) -> Self {
        Self { name, packet_type, value: Mutex::new(None), mirrors: RwLock::new(Vec::new()) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wires one consumer slot. Build time only.
    pub fn add_mirror(&self, node: usize, local_name: Arc<str>) {
        self.mirrors.write().push(SidePacketMirror { node, local_name });
    }

    /// Sets the value. Write-once; the caller delivers the returned mirror
    /// slots to their nodes.
    ///
    /// # Errors
    ///
    /// `FailedPrecondition` if already set, `InvalidArgument` on an empty or
    /// timestamped packet or a type mismatch.
    pub fn set(&self, packet: Packet) -> Result<Vec<SidePacketMirror>> {
        if packet.is_empty() {
            return Err(FlowGraphError::InvalidArgument(format!(
                "side packet '{}' must not be empty",
                self.name
            )));
        }
        if !packet.timestamp().is_unset() {
            return Err(FlowGraphError::InvalidArgument(format!(
                "side packet '{}' must carry an unset timestamp",
                self.name
            )));
        }
        self.packet_type.validate(&packet)?;
        let mut value = self.value.lock();
        if value.is_some() {
            return Err(FlowGraphError::FailedPrecondition(format!(
                "side packet '{}' was already set",
                self.name
            )));
        }
        *value = Some(packet);
        Ok(self.mirrors.read().clone())
    }

    /// Clears the value so the next run can set it again. Only valid between
    /// runs; mirrors stay wired.
    pub fn reset(&self) {
        *self.value.lock() = None;
    }

    pub fn get(&self) -> Option<Packet> {
        self.value.lock().clone()
    }

    pub fn is_set(&self) -> bool {
        self.value.lock().is_some()
    }
}

impl std::fmt::Debug for OutputSidePacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSidePacket")
            .field("name", &self.name)
            .field("is_set", &self.is_set())
            .finish_non_exhaustive()
    }
}
