// SPDX-FileCopyrightText: © 2025 FlowGraph Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Durable output stream state and mirror fan-out.
//!
//! An [`OutputStreamManager`] owns one output edge of one producer. It holds
//! the stream's durable intro data (offset, header), its next timestamp bound,
//! and the list of *mirrors*: one [`InputStreamManager`] per consumer of the
//! stream. Propagation delivers a shard's packets to every mirror, cloning for
//! all but the last so single-consumer edges move their packets.

use crate::input_stream::InputStreamManager;
use flowgraph_core::error::Result;
use flowgraph_core::packet::Packet;
use flowgraph_core::packet_type::PacketType;
use flowgraph_core::shard::OutputStreamShard;
use flowgraph_core::timestamp::{Timestamp, TimestampDiff};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// Who consumes a mirror: a node's input edge or a graph output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorTarget {
    Node(usize),
    GraphOutput(usize),
}

/// One consumer-side copy of an output stream.
#[derive(Debug)]
pub struct Mirror {
    pub target: MirrorTarget,
    pub input: Arc<InputStreamManager>,
}

#[derive(Debug)]
struct OutputState {
    next_timestamp_bound: Timestamp,
    offset: Option<TimestampDiff>,
    header: Packet,
    intro_locked: bool,
    closed: bool,
}

/// The durable state of one output edge.
pub struct OutputStreamManager {
    name: Arc<str>,
    packet_type: PacketType,
    state: Mutex<OutputState>,
    mirrors: RwLock<Vec<Mirror>>,
}

impl OutputStreamManager {
    pub fn new(name: Arc<str>, packet_type: PacketType) -> Self {
        Self {
            name,
            packet_type,
            state: Mutex::new(OutputState {
                next_timestamp_bound: Timestamp::UNSTARTED,
                offset: None,
                header: Packet::empty(),
                intro_locked: false,
                closed: false,
            }),
            mirrors: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn packet_type(&self) -> &PacketType {
        &self.packet_type
    }

    /// Wires one consumer. Build time only.
    pub fn add_mirror(&self, target: MirrorTarget, input: Arc<InputStreamManager>) {
        self.mirrors.write().push(Mirror { target, input });
    }

    pub fn num_mirrors(&self) -> usize {
        self.mirrors.read().len()
    }

    /// Snapshots the durable state into a per-invocation staging shard.
    pub fn make_shard(&self) -> OutputStreamShard {
        let state = self.state.lock();
        OutputStreamShard::new(
            Arc::clone(&self.name),
            self.packet_type.clone(),
            state.next_timestamp_bound,
            state.intro_locked,
            state.closed,
        )
    }

    /// Resets the stream to its pre-run state. Only valid between runs;
    /// mirrors stay wired.
    pub fn prepare_for_run(&self) {
        let mut state = self.state.lock();
        state.next_timestamp_bound = Timestamp::UNSTARTED;
        state.offset = None;
        state.header = Packet::empty();
        state.intro_locked = false;
        state.closed = false;
    }

    /// Freezes offset and header. Called once the producer's Open outputs have
    /// been propagated.
    pub fn lock_intro_data(&self) {
        self.state.lock().intro_locked = true;
    }

    pub fn offset(&self) -> Option<TimestampDiff> {
        self.state.lock().offset
    }

    pub fn next_timestamp_bound(&self) -> Timestamp {
        self.state.lock().next_timestamp_bound
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn header(&self) -> Packet {
        self.state.lock().header.clone()
    }

    /// Drains a finished invocation's shard into the durable state and every
    /// mirror. Returns the consumers whose readiness may have changed.
    ///
    /// # Errors
    ///
    /// Forwards mirror queue validation errors; these indicate a producer that
    /// broke its own stream contract and are fatal to the run.
    pub fn propagate_updates(&self, shard: &mut OutputStreamShard) -> Result<Vec<MirrorTarget>> {
        let mut notified = Vec::new();

        // Intro data lands before any packet so mirrors observe headers first.
        if let Some(offset) = shard.take_offset_update() {
            self.state.lock().offset = Some(offset);
        }
        if let Some(header) = shard.take_header_update() {
            self.state.lock().header = header.clone();
            for mirror in self.mirrors.read().iter() {
                mirror.input.set_header(header.clone());
            }
        }

        let mut packets = shard.take_packets();
        let close_requested = shard.close_requested();
        let new_bound =
            if close_requested { Timestamp::DONE } else { shard.next_timestamp_bound() };

        {
            let mut state = self.state.lock();
            if close_requested {
                state.closed = true;
            }
            if new_bound > state.next_timestamp_bound {
                state.next_timestamp_bound = new_bound;
            }
        }

        // When the bound is exactly the successor of the last packet, the
        // mirror's own bound update from add_packets already covers it.
        let bound_is_redundant = packets
            .last()
            .is_some_and(|p| p.timestamp().next_allowed_in_stream() == new_bound);

        let mirrors = self.mirrors.read();
        let last = mirrors.len().saturating_sub(1);
        for (i, mirror) in mirrors.iter().enumerate() {
            let mut notify = false;
            if !packets.is_empty() {
                let batch =
                    if i == last { std::mem::take(&mut packets) } else { packets.clone() };
                notify |= mirror.input.add_packets(batch)?;
            }
            if !bound_is_redundant {
                notify |= mirror.input.set_next_timestamp_bound(new_bound)?;
            }
            if notify {
                notified.push(mirror.target);
            }
        }
        Ok(notified)
    }

    /// The bound this output may advance to once every input earlier than or
    /// equal to `settled_input` has been accounted for. `UNSET` when no offset
    /// was declared (the stream gives no automatic progress guarantee).
    pub fn compute_output_timestamp_bound(&self, settled_input: Timestamp) -> Timestamp {
        let Some(offset) = self.offset() else {
            return Timestamp::UNSET;
        };
        if settled_input == Timestamp::UNSTARTED || settled_input == Timestamp::UNSET {
            Timestamp::UNSET
        } else if settled_input == Timestamp::PRE_STREAM {
            Timestamp::MIN
        } else if settled_input >= Timestamp::POST_STREAM {
            Timestamp::ONE_OVER_POST_STREAM
        } else if settled_input == Timestamp::MAX && offset >= TimestampDiff::ZERO {
            Timestamp::POST_STREAM
        } else {
            (settled_input + offset).next_allowed_in_stream()
        }
    }

    /// Advances the bound without an invocation (offset-driven progress).
    /// Returns the consumers whose readiness may have changed.
    ///
    /// # Errors
    ///
    /// Forwards mirror bound regression errors.
    pub fn propagate_timestamp_bound(&self, bound: Timestamp) -> Result<Vec<MirrorTarget>> {
        {
            let mut state = self.state.lock();
            if state.closed || bound <= state.next_timestamp_bound {
                return Ok(Vec::new());
            }
            state.next_timestamp_bound = bound;
        }
        let mut notified = Vec::new();
        for mirror in self.mirrors.read().iter() {
            if mirror.input.set_next_timestamp_bound(bound)? {
                notified.push(mirror.target);
            }
        }
        Ok(notified)
    }

    /// Closes the stream and announces the terminal bound to every mirror.
    /// Idempotent. Returns the consumers whose readiness may have changed.
    ///
    /// # Errors
    ///
    /// Forwards mirror bound regression errors.
    pub fn close(&self) -> Result<Vec<MirrorTarget>> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(Vec::new());
            }
            state.closed = true;
            state.next_timestamp_bound = Timestamp::DONE;
        }
        let mut notified = Vec::new();
        for mirror in self.mirrors.read().iter() {
            if mirror.input.set_next_timestamp_bound(Timestamp::DONE)? {
                notified.push(mirror.target);
            }
        }
        Ok(notified)
    }
}

impl std::fmt::Debug for OutputStreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("OutputStreamManager")
            .field("name", &self.name)
            .field("next_timestamp_bound", &state.next_timestamp_bound)
            .field("closed", &state.closed)
            .field("num_mirrors", &self.mirrors.read().len())
            .finish_non_exhaustive()
    }
}
