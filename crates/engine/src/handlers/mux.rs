// SPDX-FileCopyrightText: © 2025 FlowGraph Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Control-stream driven input selection.
//!
//! The node's last input stream is the *control* stream; its packets carry an
//! `i64` index selecting one of the preceding data streams. An invocation
//! fires at the control packet's timestamp once the selected data stream has
//! either delivered a packet at that timestamp or guaranteed it never will
//! (its bound or front passed it), in which case the selected input is empty.
//! Data packets earlier than the control timestamp are discarded.
//!
//! Unselected data streams are left untouched, so a data stream that neither
//! delivers nor advances its bound past the control timestamp stalls the
//! node. Feed the mux from producers with declared offsets, or from streams
//! that are closed when idle.

use super::{InputStreamHandler, PreparedInvocation, SchedulingPlan};
use crate::input_stream::InputStreamManager;
use flowgraph_core::error::FlowGraphError;
use flowgraph_core::packet::Packet;
use flowgraph_core::shard::InputStreamShard;
use flowgraph_core::timestamp::Timestamp;
use std::sync::Arc;

pub struct MuxInputStreamHandler {
    streams: Vec<Arc<InputStreamManager>>,
}

impl MuxInputStreamHandler {
    /// The last stream is the control stream.
    pub fn new(streams: Vec<Arc<InputStreamManager>>) -> Self {
        Self { streams }
    }

    fn control(&self) -> &InputStreamManager {
        &self.streams[self.streams.len() - 1]
    }

    fn num_data_streams(&self) -> usize {
        self.streams.len() - 1
    }
}

impl InputStreamHandler for MuxInputStreamHandler {
    fn schedule_invocations(&mut self, max_allowance: usize) -> SchedulingPlan {
        let mut plan = SchedulingPlan::default();
        while plan.invocations.len() < max_allowance {
            let Some(control_packet) = self.control().queue_head() else {
                let (bound, _) = self.control().min_timestamp_or_bound();
                if bound == Timestamp::DONE {
                    plan.ready_for_close = true;
                } else {
                    plan.input_bound = bound;
                }
                break;
            };
            let control_ts = control_packet.timestamp();

            let selected = match control_packet.get::<i64>() {
                Ok(&index) if (0..self.num_data_streams() as i64).contains(&index) => {
                    usize::try_from(index).unwrap_or_default()
                },
                Ok(&index) => {
                    plan.error = Some(FlowGraphError::InvalidArgument(format!(
                        "mux control packet at {control_ts} selects stream {index}, \
                         but only {} data stream(s) exist",
                        self.num_data_streams()
                    )));
                    break;
                },
                Err(err) => {
                    plan.error = Some(err);
                    break;
                },
            };

            // Data that the control stream already skipped past is stale.
            let data = &self.streams[selected];
            data.erase_packets_earlier_than(control_ts);

            let (data_min, data_empty) = data.min_timestamp_or_bound();
            let has_packet = !data_empty && data_min == control_ts;
            let settled = has_packet || data_min > control_ts;
            if !settled {
                plan.input_bound = control_ts;
                break;
            }

            let inputs = self
                .streams
                .iter()
                .enumerate()
                .map(|(i, stream)| {
                    let packet = if i == selected && has_packet {
                        stream.pop_queue_head().unwrap_or_default()
                    } else if i == self.streams.len() - 1 {
                        stream.pop_queue_head().unwrap_or_default()
                    } else {
                        Packet::empty().at(control_ts)
                    };
                    InputStreamShard::new(stream.name_arc(), packet)
                })
                .collect();
            plan.invocations.push(PreparedInvocation {
                input_timestamp: control_ts,
                inputs,
                propagate_bound: true,
            });
        }
        plan
    }
}
