// SPDX-FileCopyrightText: © 2025 FlowGraph Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Per-invocation stream views.
//!
//! A calculator never touches the durable stream managers directly. For each
//! invocation the engine snapshots one [`InputStreamShard`] per input edge
//! (the packet selected by the node's input stream handler, possibly empty)
//! and one [`OutputStreamShard`] per output edge (an empty staging buffer).
//! After the invocation returns, the engine drains the output shards and
//! propagates their packets and bounds to every downstream mirror.

use crate::error::{FlowGraphError, Result};
use crate::packet::Packet;
use crate::packet_type::PacketType;
use crate::timestamp::{Timestamp, TimestampDiff};
use std::sync::Arc;

/// One input edge's contribution to an invocation: either the packet selected
/// for the invocation timestamp, or an empty packet stamped with the latest
/// settled timestamp when only the bound advanced.
#[derive(Debug, Clone)]
pub struct InputStreamShard {
    name: Arc<str>,
    packet: Packet,
}

impl InputStreamShard {
    pub fn new(name: Arc<str>, packet: Packet) -> Self {
        Self { name, packet }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn packet(&self) -> &Packet {
        &self.packet
    }

    pub const fn is_empty(&self) -> bool {
        self.packet.is_empty()
    }

    /// Borrows the packet payload as `T`.
    pub fn value<T: 'static>(&self) -> Result<&T> {
        self.packet.get::<T>()
    }
}

/// The staging buffer a calculator writes one output edge's results into
/// during a single invocation.
///
/// Offset and header are *intro data*: they may only be set while the stream's
/// intro data is unlocked, i.e. during Open. The engine locks intro data after
/// the first propagation.
#[derive(Debug)]
pub struct OutputStreamShard {
    name: Arc<str>,
    packet_type: PacketType,
    output_queue: Vec<Packet>,
    next_timestamp_bound: Timestamp,
    offset_update: Option<TimestampDiff>,
    header_update: Option<Packet>,
    intro_locked: bool,
    closed: bool,
    close_requested: bool,
}

impl OutputStreamShard {
    /// Builds a shard against the durable stream's current state. Engine use.
    pub fn new(
        name: Arc<str>,
        packet_type: PacketType,
        next_timestamp_bound: Timestamp,
        intro_locked: bool,
        closed: bool,
    ) -> Self {
        Self {
            name,
            packet_type,
            output_queue: Vec::new(),
            next_timestamp_bound,
            offset_update: None,
            header_update: None,
            intro_locked,
            closed,
            close_requested: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Emits a packet on this output stream.
    ///
    /// # Errors
    ///
    /// `FailedPrecondition` if the stream is closed; `InvalidArgument` if the
    /// timestamp is disallowed, below the stream's bound, or the payload fails
    /// type validation.
    pub fn add_packet(&mut self, packet: Packet) -> Result<()> {
        if self.closed || self.close_requested {
            return Err(FlowGraphError::FailedPrecondition(format!(
                "output stream '{}' is closed",
                self.name
            )));
        }
        let ts = packet.timestamp();
        if !ts.is_allowed_in_stream() {
            return Err(FlowGraphError::InvalidArgument(format!(
                "timestamp {ts} is not allowed on output stream '{}'",
                self.name
            )));
        }
        if ts < self.next_timestamp_bound {
            return Err(FlowGraphError::InvalidArgument(format!(
                "timestamp {ts} on output stream '{}' is below the current bound {}",
                self.name, self.next_timestamp_bound
            )));
        }
        self.packet_type.validate(&packet)?;
        self.next_timestamp_bound = ts.next_allowed_in_stream();
        self.output_queue.push(packet);
        Ok(())
    }

    /// Promises that no packet earlier than `bound` will ever be emitted.
    /// Ignored if it does not move the shard's bound forward.
    pub fn set_next_timestamp_bound(&mut self, bound: Timestamp) -> Result<()> {
        if self.closed || self.close_requested {
            return Err(FlowGraphError::FailedPrecondition(format!(
                "output stream '{}' is closed",
                self.name
            )));
        }
        if bound > self.next_timestamp_bound {
            self.next_timestamp_bound = bound;
        }
        Ok(())
    }

    /// Declares how far this output may lag the input timestamp. Open only.
    pub fn set_offset(&mut self, offset: TimestampDiff) -> Result<()> {
        if self.intro_locked {
            return Err(FlowGraphError::FailedPrecondition(format!(
                "offset of output stream '{}' may only be set during Open",
                self.name
            )));
        }
        self.offset_update = Some(offset);
        Ok(())
    }

    /// Sets the stream header. Open only; the header must carry an unset
    /// timestamp.
    pub fn set_header(&mut self, header: Packet) -> Result<()> {
        if self.intro_locked {
            return Err(FlowGraphError::FailedPrecondition(format!(
                "header of output stream '{}' may only be set during Open",
                self.name
            )));
        }
        if !header.timestamp().is_unset() {
            return Err(FlowGraphError::InvalidArgument(format!(
                "header of output stream '{}' must carry an unset timestamp",
                self.name
            )));
        }
        self.header_update = Some(header);
        Ok(())
    }

    /// Requests that the stream be closed once this invocation's outputs have
    /// been propagated.
    pub fn close(&mut self) {
        self.close_requested = true;
    }

    pub const fn next_timestamp_bound(&self) -> Timestamp {
        self.next_timestamp_bound
    }

    // --- Engine-side drains ---

    pub fn take_packets(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.output_queue)
    }

    pub fn take_offset_update(&mut self) -> Option<TimestampDiff> {
        self.offset_update.take()
    }

    pub fn take_header_update(&mut self) -> Option<Packet> {
        self.header_update.take()
    }

    pub const fn close_requested(&self) -> bool {
        self.close_requested
    }
}
