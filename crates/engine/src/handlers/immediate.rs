// SPDX-FileCopyrightText: © 2025 FlowGraph Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Unsynchronized, minimum-latency policy.
//!
//! Fires as soon as any stream has a queued packet, at the smallest front
//! timestamp; streams without a packet at that timestamp contribute an empty
//! shard. Invocation timestamps may repeat across streams but never regress,
//! because each pop only ever removes a stream's front packet.

use super::{InputStreamHandler, PreparedInvocation, SchedulingPlan};
use crate::input_stream::InputStreamManager;
use flowgraph_core::packet::Packet;
use flowgraph_core::shard::InputStreamShard;
use flowgraph_core::timestamp::Timestamp;
use std::sync::Arc;

pub struct ImmediateInputStreamHandler {
    streams: Vec<Arc<InputStreamManager>>,
}

impl ImmediateInputStreamHandler {
    pub fn new(streams: Vec<Arc<InputStreamManager>>) -> Self {
        Self { streams }
    }
}

impl InputStreamHandler for ImmediateInputStreamHandler {
    fn schedule_invocations(&mut self, max_allowance: usize) -> SchedulingPlan {
        let mut plan = SchedulingPlan::default();
        while plan.invocations.len() < max_allowance {
            let fronts: Vec<Option<Timestamp>> =
                self.streams.iter().map(|s| s.queue_head().map(|p| p.timestamp())).collect();
            let Some(ts) = fronts.iter().flatten().copied().min() else {
                if self.streams.iter().all(|s| s.is_done()) {
                    plan.ready_for_close = true;
                } else {
                    plan.input_bound = self
                        .streams
                        .iter()
                        .map(|s| s.min_timestamp_or_bound().0)
                        .min()
                        .unwrap_or(Timestamp::DONE);
                }
                break;
            };
            let inputs = self
                .streams
                .iter()
                .zip(&fronts)
                .map(|(stream, front)| {
                    let packet = if *front == Some(ts) {
                        stream.pop_queue_head().unwrap_or_default()
                    } else {
                        Packet::empty().at(ts)
                    };
                    InputStreamShard::new(stream.name_arc(), packet)
                })
                .collect();
            plan.invocations.push(PreparedInvocation {
                input_timestamp: ts,
                inputs,
                propagate_bound: true,
            });
        }
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{add, stream};
    use super::*;

    #[test]
    fn test_fires_without_waiting_for_peers() {
        let a = stream("a");
        let b = stream("b");
        add(&a, 1, 5);
        // b gives no bound guarantee at all; the default policy would stall.
        let mut handler = ImmediateInputStreamHandler::new(vec![Arc::clone(&a), Arc::clone(&b)]);
        let plan = handler.schedule_invocations(usize::MAX);
        assert_eq!(plan.invocations.len(), 1);
        assert_eq!(plan.invocations[0].input_timestamp, Timestamp::new(5));
        assert!(plan.invocations[0].inputs[1].is_empty());
    }

    #[test]
    fn test_merges_equal_timestamps() {
        let a = stream("a");
        let b = stream("b");
        add(&a, 1, 3);
        add(&b, 2, 3);
        let mut handler = ImmediateInputStreamHandler::new(vec![Arc::clone(&a), Arc::clone(&b)]);
        let plan = handler.schedule_invocations(usize::MAX);
        assert_eq!(plan.invocations.len(), 1);
        assert_eq!(*plan.invocations[0].inputs[0].value::<i64>().unwrap(), 1);
        assert_eq!(*plan.invocations[0].inputs[1].value::<i64>().unwrap(), 2);
    }

    #[test]
    fn test_close_when_all_done() {
        let a = stream("a");
        add(&a, 1, 1);
        a.set_next_timestamp_bound(Timestamp::DONE).unwrap();
        let mut handler = ImmediateInputStreamHandler::new(vec![Arc::clone(&a)]);
        let plan = handler.schedule_invocations(usize::MAX);
        assert_eq!(plan.invocations.len(), 1);
        assert!(plan.ready_for_close);
    }
}
