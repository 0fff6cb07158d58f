// SPDX-FileCopyrightText: © 2025 FlowGraph Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Durable per-edge input queues.
//!
//! An [`InputStreamManager`] owns one input edge of one consumer: a FIFO of
//! packets in strictly increasing timestamp order plus the stream's *next
//! timestamp bound*. Producers append through [`InputStreamManager::add_packets`]
//! and [`InputStreamManager::set_next_timestamp_bound`]; the consumer's input
//! stream handler reads and pops under its own scheduling policy.
//!
//! All mutation happens under an internal mutex. Queue-size callbacks (used by
//! graph input throttling) are invoked after the lock is released.

use flowgraph_core::error::{FlowGraphError, Result};
use flowgraph_core::packet::Packet;
use flowgraph_core::packet_type::PacketType;
use flowgraph_core::timestamp::Timestamp;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::warn;

/// Invoked when a stream crosses its configured queue-size limit.
pub type QueueSizeCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug)]
struct StreamState {
    queue: VecDeque<Packet>,
    next_timestamp_bound: Timestamp,
    closed: bool,
    header: Packet,
    max_queue_size: usize,
    num_packets_added: u64,
}

/// The durable state of one input edge.
pub struct InputStreamManager {
    name: Arc<str>,
    packet_type: PacketType,
    state: Mutex<StreamState>,
    becomes_full: Mutex<Option<QueueSizeCallback>>,
    becomes_not_full: Mutex<Option<QueueSizeCallback>>,
}

impl InputStreamManager {
    /// `max_queue_size` of zero means unbounded.
    pub fn new(name: Arc<str>, packet_type: PacketType, max_queue_size: usize) -> Self {
        Self {
            name,
            packet_type,
            state: Mutex::new(StreamState {
                queue: VecDeque::new(),
                next_timestamp_bound: Timestamp::UNSTARTED,
                closed: false,
                header: Packet::empty(),
                max_queue_size,
                num_packets_added: 0,
            }),
            becomes_full: Mutex::new(None),
            becomes_not_full: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn name_arc(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    pub fn packet_type(&self) -> &PacketType {
        &self.packet_type
    }

    /// Registers the callbacks fired when the queue crosses its size limit.
    pub fn set_queue_size_callbacks(
        &self,
        becomes_full: Option<QueueSizeCallback>,
        becomes_not_full: Option<QueueSizeCallback>,
    ) {
        *self.becomes_full.lock() = becomes_full;
        *self.becomes_not_full.lock() = becomes_not_full;
    }

    /// Appends a batch of packets.
    ///
    /// The whole batch is validated before any packet is enqueued, so a
    /// failing call leaves the stream untouched. Returns true if the consumer
    /// should re-check readiness (the queue's minimum changed).
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if a timestamp is disallowed, violates the stream's
    /// bound or the batch's internal ordering, breaks `PRE_STREAM` /
    /// `POST_STREAM` exclusivity, or a payload fails type validation.
    /// `FailedPrecondition` if the stream is closed.
    pub fn add_packets(&self, packets: Vec<Packet>) -> Result<bool> {
        if packets.is_empty() {
            return Ok(false);
        }
        let notify;
        let fire_full;
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(FlowGraphError::FailedPrecondition(format!(
                    "input stream '{}' is closed",
                    self.name
                )));
            }
            // First pass: validate without mutating.
            let mut bound = state.next_timestamp_bound;
            let mut num_added = state.num_packets_added;
            for packet in &packets {
                let ts = packet.timestamp();
                if !ts.is_allowed_in_stream() {
                    return Err(FlowGraphError::InvalidArgument(format!(
                        "timestamp {ts} is not allowed on input stream '{}'",
                        self.name
                    )));
                }
                if ts < bound {
                    return Err(FlowGraphError::InvalidArgument(format!(
                        "timestamp {ts} on input stream '{}' is below the current bound {bound}",
                        self.name
                    )));
                }
                if ts == Timestamp::POST_STREAM && num_added > 0 {
                    return Err(FlowGraphError::InvalidArgument(format!(
                        "a POST_STREAM packet must be the only packet on input stream '{}'",
                        self.name
                    )));
                }
                self.packet_type.validate(packet)?;
                bound = ts.next_allowed_in_stream();
                num_added += 1;
            }
            // Second pass: commit.
            let was_empty = state.queue.is_empty();
            let was_full = self.is_full_locked(&state);
            state.next_timestamp_bound = bound;
            state.num_packets_added = num_added;
            state.queue.extend(packets);
            notify = was_empty;
            fire_full = !was_full && self.is_full_locked(&state);
        }
        if fire_full {
            let cb = self.becomes_full.lock().clone();
            if let Some(cb) = cb {
                cb();
            }
        }
        Ok(notify)
    }

    /// Promises that no packet earlier than `bound` will arrive.
    ///
    /// Returns true if the consumer should re-check readiness: the bound
    /// advanced while the queue is empty (a non-empty queue's minimum is its
    /// front packet, which did not move).
    ///
    /// # Errors
    ///
    /// `Unknown` if `bound` regresses below the stream's current bound.
    pub fn set_next_timestamp_bound(&self, bound: Timestamp) -> Result<bool> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(false);
        }
        if bound < state.next_timestamp_bound {
            return Err(FlowGraphError::Unknown(format!(
                "next timestamp bound of input stream '{}' regressed from {} to {bound}",
                self.name, state.next_timestamp_bound
            )));
        }
        if bound > state.next_timestamp_bound {
            state.next_timestamp_bound = bound;
            return Ok(state.queue.is_empty());
        }
        Ok(false)
    }

    /// The stream's contribution to readiness: the front packet's timestamp if
    /// the queue is non-empty, the next timestamp bound otherwise. The flag
    /// reports which case applied.
    pub fn min_timestamp_or_bound(&self) -> (Timestamp, bool) {
        let state = self.state.lock();
        match state.queue.front() {
            Some(packet) => (packet.timestamp(), false),
            None => (state.next_timestamp_bound, true),
        }
    }

    /// A clone of the front packet, if any.
    pub fn queue_head(&self) -> Option<Packet> {
        self.state.lock().queue.front().cloned()
    }

    /// Pops the packet at exactly `timestamp`, dropping any earlier packets
    /// the consumer's policy chose to skip. When the stream has no packet
    /// there, returns an empty packet stamped with the predecessor of the
    /// stream's bound: the latest point the stream is known settled through.
    pub fn pop_packet_at_timestamp(&self, timestamp: Timestamp) -> Packet {
        let result;
        let fire_not_full;
        {
            let mut state = self.state.lock();
            let was_full = self.is_full_locked(&state);
            let mut dropped = 0_u64;
            while state.queue.front().is_some_and(|p| p.timestamp() < timestamp) {
                state.queue.pop_front();
                dropped += 1;
            }
            if dropped > 0 {
                warn!(
                    stream = %self.name,
                    dropped,
                    "dropped packets earlier than the invocation timestamp"
                );
            }
            result = if state.queue.front().is_some_and(|p| p.timestamp() == timestamp) {
                state.queue.pop_front().unwrap_or_default()
            } else {
                Packet::empty().at(state.next_timestamp_bound.previous_allowed_in_stream())
            };
            fire_not_full = was_full && !self.is_full_locked(&state);
        }
        if fire_not_full {
            let cb = self.becomes_not_full.lock().clone();
            if let Some(cb) = cb {
                cb();
            }
        }
        result
    }

    /// Pops the front packet, if any.
    pub fn pop_queue_head(&self) -> Option<Packet> {
        let result;
        let fire_not_full;
        {
            let mut state = self.state.lock();
            let was_full = self.is_full_locked(&state);
            result = state.queue.pop_front();
            fire_not_full = was_full && !self.is_full_locked(&state);
        }
        if fire_not_full {
            let cb = self.becomes_not_full.lock().clone();
            if let Some(cb) = cb {
                cb();
            }
        }
        result
    }

    /// Drops every queued packet with a timestamp earlier than `timestamp`.
    /// Returns the number of packets dropped.
    pub fn erase_packets_earlier_than(&self, timestamp: Timestamp) -> usize {
        let dropped;
        let fire_not_full;
        {
            let mut state = self.state.lock();
            let was_full = self.is_full_locked(&state);
            let before = state.queue.len();
            while state.queue.front().is_some_and(|p| p.timestamp() < timestamp) {
                state.queue.pop_front();
            }
            dropped = before - state.queue.len();
            fire_not_full = was_full && !self.is_full_locked(&state);
        }
        if fire_not_full {
            let cb = self.becomes_not_full.lock().clone();
            if let Some(cb) = cb {
                cb();
            }
        }
        dropped
    }

    /// The timestamp of the `n`-th latest queued packet, or `None` when fewer
    /// than `n` packets are queued. Used by queue-trimming policies.
    pub fn min_timestamp_among_n_latest(&self, n: usize) -> Option<Timestamp> {
        let state = self.state.lock();
        let len = state.queue.len();
        if n == 0 || len < n {
            return None;
        }
        state.queue.get(len - n).map(Packet::timestamp)
    }

    /// Resets the stream to its pre-run state. Only valid between runs.
    pub fn prepare_for_run(&self) {
        let mut state = self.state.lock();
        state.queue.clear();
        state.next_timestamp_bound = Timestamp::UNSTARTED;
        state.closed = false;
        state.header = Packet::empty();
        state.num_packets_added = 0;
    }

    /// Closes the stream: drops queued packets and pins the bound to `DONE`.
    /// Idempotent.
    pub fn close(&self) {
        let fire_not_full;
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let was_full = self.is_full_locked(&state);
            state.closed = true;
            state.queue.clear();
            state.next_timestamp_bound = Timestamp::DONE;
            fire_not_full = was_full;
        }
        if fire_not_full {
            let cb = self.becomes_not_full.lock().clone();
            if let Some(cb) = cb {
                cb();
            }
        }
    }

    /// True once the stream can never again contribute an invocation: the
    /// queue is empty and the bound is terminal.
    pub fn is_done(&self) -> bool {
        let state = self.state.lock();
        state.queue.is_empty() && state.next_timestamp_bound == Timestamp::DONE
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    pub fn queue_size(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// True when a queue-size limit is configured and reached.
    pub fn is_full(&self) -> bool {
        self.is_full_locked(&self.state.lock())
    }

    pub fn set_max_queue_size(&self, max_queue_size: usize) {
        self.state.lock().max_queue_size = max_queue_size;
    }

    pub fn num_packets_added(&self) -> u64 {
        self.state.lock().num_packets_added
    }

    pub fn set_header(&self, header: Packet) {
        self.state.lock().header = header;
    }

    pub fn header(&self) -> Packet {
        self.state.lock().header.clone()
    }

    #[allow(clippy::unused_self)]
    fn is_full_locked(&self, state: &StreamState) -> bool {
        state.max_queue_size > 0 && state.queue.len() >= state.max_queue_size
    }
}

impl std::fmt::Debug for InputStreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InputStreamManager")
            .field("name", &self.name)
            .field("queue_size", &state.queue.len())
            .field("next_timestamp_bound", &state.next_timestamp_bound)
            .field("closed", &state.closed)
            .finish_non_exhaustive()
    }
}
