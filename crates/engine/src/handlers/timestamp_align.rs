// SPDX-FileCopyrightText: © 2025 FlowGraph Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Synchronization across per-stream clock domains.
//!
//! Some sources stamp packets in their own clock domain (e.g. capture devices
//! with different epochs). This policy withholds all invocations until every
//! stream has delivered its first packet, takes those first packets as
//! simultaneous, and from then on synchronizes like the default policy after
//! shifting each stream by its learned constant offset. Packets popped from
//! non-base streams are restamped into the base stream's domain.

use super::{InputStreamHandler, PreparedInvocation, SchedulingPlan};
use crate::input_stream::InputStreamManager;
use flowgraph_core::error::{FlowGraphError, Result};
use flowgraph_core::shard::InputStreamShard;
use flowgraph_core::timestamp::{Timestamp, TimestampDiff};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct Options {
    base_stream_index: usize,
}

pub struct TimestampAlignInputStreamHandler {
    streams: Vec<Arc<InputStreamManager>>,
    base: usize,
    /// Offset added to stream `i`'s timestamps to map them into the base
    /// stream's domain. Learned from the first packet of every stream.
    offsets: Option<Vec<TimestampDiff>>,
}

impl TimestampAlignInputStreamHandler {
    pub fn new(
        streams: Vec<Arc<InputStreamManager>>,
        options: Option<&serde_json::Value>,
    ) -> Result<Self> {
        let options = match options {
            Some(value) => Options::deserialize(value).map_err(|e| {
                FlowGraphError::Configuration(format!(
                    "invalid TimestampAlignInputStreamHandler options: {e}"
                ))
            })?,
            None => Options::default(),
        };
        if !streams.is_empty() && options.base_stream_index >= streams.len() {
            return Err(FlowGraphError::Configuration(format!(
                "base_stream_index {} is out of range for {} input stream(s)",
                options.base_stream_index,
                streams.len()
            )));
        }
        Ok(Self { streams, base: options.base_stream_index, offsets: None })
    }

    /// Learns per-stream offsets once every stream has its first packet.
    fn try_learn_offsets(&mut self) {
        if self.offsets.is_some() {
            return;
        }
        let fronts: Option<Vec<Timestamp>> = self
            .streams
            .iter()
            .map(|s| s.queue_head().map(|p| p.timestamp()))
            .collect();
        let Some(fronts) = fronts else { return };
        let base_front = fronts[self.base];
        let offsets: Vec<TimestampDiff> = fronts.iter().map(|&f| base_front - f).collect();
        debug!(base = self.base, ?offsets, "learned timestamp alignment offsets");
        self.offsets = Some(offsets);
    }

    /// Lock-step readiness over aligned timestamps.
    fn aligned_readiness(&self, offsets: &[TimestampDiff]) -> AlignedReadiness {
        let mut min_bound = Timestamp::DONE;
        let mut min_packet: Option<Timestamp> = None;
        for (stream, &offset) in self.streams.iter().zip(offsets) {
            let (ts, empty) = stream.min_timestamp_or_bound();
            // Sentinels carry no clock-domain meaning and are never shifted.
            let aligned = if ts.is_range_value() { ts + offset } else { ts };
            if empty {
                min_bound = min_bound.min(aligned);
            } else {
                min_packet = Some(min_packet.map_or(aligned, |p| p.min(aligned)));
            }
        }
        match min_packet {
            Some(ts) if ts < min_bound => AlignedReadiness::Ready(ts),
            Some(_) => AlignedReadiness::NotReady(min_bound),
            None if min_bound == Timestamp::DONE => AlignedReadiness::Close,
            None => AlignedReadiness::NotReady(min_bound),
        }
    }
}

enum AlignedReadiness {
    NotReady(Timestamp),
    Ready(Timestamp),
    Close,
}

impl InputStreamHandler for TimestampAlignInputStreamHandler {
    fn schedule_invocations(&mut self, max_allowance: usize) -> SchedulingPlan {
        let mut plan = SchedulingPlan::default();
        while plan.invocations.len() < max_allowance {
            self.try_learn_offsets();
            let Some(offsets) = self.offsets.clone() else {
                // A stream that ends before its first packet can never be
                // aligned; give up once everything else is exhausted too.
                if self.streams.iter().all(|s| s.is_done()) {
                    plan.ready_for_close = true;
                }
                break;
            };
            match self.aligned_readiness(&offsets) {
                AlignedReadiness::Ready(ts) => {
                    let inputs = self
                        .streams
                        .iter()
                        .zip(&offsets)
                        .map(|(stream, &offset)| {
                            let packet = stream.pop_packet_at_timestamp(ts - offset);
                            // Restamp into the base domain.
                            InputStreamShard::new(stream.name_arc(), packet.at(ts))
                        })
                        .collect();
                    plan.invocations.push(PreparedInvocation {
                        input_timestamp: ts,
                        inputs,
                        propagate_bound: true,
                    });
                },
                AlignedReadiness::Close => {
                    plan.ready_for_close = true;
                    break;
                },
                AlignedReadiness::NotReady(bound) => {
                    plan.input_bound = bound;
                    break;
                },
            }
        }
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{add, stream};
    use super::*;

    #[test]
    fn test_waits_for_first_packet_on_every_stream() {
        let a = stream("a");
        let b = stream("b");
        add(&a, 1, 100);
        let mut handler =
            TimestampAlignInputStreamHandler::new(vec![Arc::clone(&a), Arc::clone(&b)], None)
                .unwrap();
        let plan = handler.schedule_invocations(usize::MAX);
        assert!(plan.invocations.is_empty());
        assert!(!plan.ready_for_close);
    }

    #[test]
    fn test_aligns_and_restamps() {
        let a = stream("a");
        let b = stream("b");
        // a's clock starts at 100, b's at 0; their first packets align.
        add(&a, 1, 100);
        add(&a, 2, 101);
        add(&b, 10, 0);
        add(&b, 20, 1);
        let mut handler =
            TimestampAlignInputStreamHandler::new(vec![Arc::clone(&a), Arc::clone(&b)], None)
                .unwrap();
        let plan = handler.schedule_invocations(usize::MAX);
        assert_eq!(plan.invocations.len(), 2);
        let first = &plan.invocations[0];
        assert_eq!(first.input_timestamp, Timestamp::new(100));
        assert_eq!(*first.inputs[0].value::<i64>().unwrap(), 1);
        assert_eq!(*first.inputs[1].value::<i64>().unwrap(), 10);
        // The b packet was restamped into a's domain.
        assert_eq!(first.inputs[1].packet().timestamp(), Timestamp::new(100));
        assert_eq!(plan.invocations[1].input_timestamp, Timestamp::new(101));
    }

    #[test]
    fn test_base_stream_index_option() {
        let a = stream("a");
        let b = stream("b");
        add(&a, 1, 100);
        add(&b, 10, 0);
        let options = serde_json::json!({ "base_stream_index": 1 });
        let mut handler = TimestampAlignInputStreamHandler::new(
            vec![Arc::clone(&a), Arc::clone(&b)],
            Some(&options),
        )
        .unwrap();
        let plan = handler.schedule_invocations(usize::MAX);
        assert_eq!(plan.invocations.len(), 1);
        // Output timestamps live in b's domain.
        assert_eq!(plan.invocations[0].input_timestamp, Timestamp::new(0));
    }

    #[test]
    fn test_rejects_out_of_range_base() {
        let a = stream("a");
        let options = serde_json::json!({ "base_stream_index": 3 });
        assert!(
            TimestampAlignInputStreamHandler::new(vec![Arc::clone(&a)], Some(&options)).is_err()
        );
    }
}
