// SPDX-FileCopyrightText: © 2025 FlowGraph Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Bounded-queue policy for real-time pipelines.
//!
//! Keeps every input queue near `target_queue_size` by evicting the oldest
//! packets whenever a queue grows past `trigger_queue_size`, then synchronizes
//! like the default policy. With `fixed_min_size` the eviction itself is
//! synchronized: a common cutoff timestamp is computed across all streams so
//! the surviving packets stay aligned.

use super::{
    fill_input_set, sync_set_readiness, InputStreamHandler, PreparedInvocation, Readiness,
    SchedulingPlan,
};
use crate::input_stream::InputStreamManager;
use flowgraph_core::error::{FlowGraphError, Result};
use flowgraph_core::timestamp::Timestamp;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct Options {
    trigger_queue_size: usize,
    target_queue_size: usize,
    fixed_min_size: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self { trigger_queue_size: 1, target_queue_size: 1, fixed_min_size: false }
    }
}

pub struct FixedSizeInputStreamHandler {
    streams: Vec<Arc<InputStreamManager>>,
    trigger_queue_size: usize,
    target_queue_size: usize,
    fixed_min_size: bool,
}

impl FixedSizeInputStreamHandler {
    pub fn new(
        streams: Vec<Arc<InputStreamManager>>,
        options: Option<&serde_json::Value>,
    ) -> Result<Self> {
        let options = match options {
            Some(value) => Options::deserialize(value).map_err(|e| {
                FlowGraphError::Configuration(format!(
                    "invalid FixedSizeInputStreamHandler options: {e}"
                ))
            })?,
            None => Options::default(),
        };
        if options.target_queue_size == 0 || options.trigger_queue_size < options.target_queue_size
        {
            return Err(FlowGraphError::Configuration(format!(
                "queue sizes must satisfy 1 <= target ({}) <= trigger ({})",
                options.target_queue_size, options.trigger_queue_size
            )));
        }
        Ok(Self {
            streams,
            trigger_queue_size: options.trigger_queue_size,
            target_queue_size: options.target_queue_size,
            fixed_min_size: options.fixed_min_size,
        })
    }

    fn erase_surplus(&self) {
        if !self.streams.iter().any(|s| s.queue_size() > self.trigger_queue_size) {
            return;
        }
        if self.fixed_min_size {
            // One cutoff for every stream, so the kept suffixes stay aligned.
            let cutoff = self
                .streams
                .iter()
                .filter_map(|s| s.min_timestamp_among_n_latest(self.target_queue_size))
                .min();
            if let Some(cutoff) = cutoff {
                for stream in &self.streams {
                    let dropped = stream.erase_packets_earlier_than(cutoff);
                    if dropped > 0 {
                        debug!(stream = %stream.name(), dropped, "evicted surplus packets");
                    }
                }
            }
        } else {
            for stream in &self.streams {
                if stream.queue_size() <= self.trigger_queue_size {
                    continue;
                }
                if let Some(cutoff) = stream.min_timestamp_among_n_latest(self.target_queue_size) {
                    let dropped = stream.erase_packets_earlier_than(cutoff);
                    debug!(stream = %stream.name(), dropped, "evicted surplus packets");
                }
            }
        }
    }
}

impl InputStreamHandler for FixedSizeInputStreamHandler {
    fn schedule_invocations(&mut self, max_allowance: usize) -> SchedulingPlan {
        let mut plan = SchedulingPlan::default();
        while plan.invocations.len() < max_allowance {
            self.erase_surplus();
            match sync_set_readiness(&self.streams) {
                Readiness::ReadyForProcess(ts) => {
                    plan.invocations.push(PreparedInvocation {
                        input_timestamp: ts,
                        inputs: fill_input_set(&self.streams, ts),
                        propagate_bound: true,
                    });
                },
                Readiness::ReadyForClose => {
                    plan.ready_for_close = true;
                    break;
                },
                Readiness::NotReady(bound) => {
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
    fn test_evicts_surplus_per_stream() {
        let a = stream("a");
        for t in 1..=5 {
            add(&a, t, t);
        }
        let options = serde_json::json!({ "trigger_queue_size": 3, "target_queue_size": 2 });
        let mut handler =
            FixedSizeInputStreamHandler::new(vec![Arc::clone(&a)], Some(&options)).unwrap();
        let plan = handler.schedule_invocations(usize::MAX);
        // Packets at t=1..=3 were evicted; the two latest fire.
        assert_eq!(plan.invocations.len(), 2);
        assert_eq!(plan.invocations[0].input_timestamp, Timestamp::new(4));
        assert_eq!(plan.invocations[1].input_timestamp, Timestamp::new(5));
    }

    #[test]
    fn test_fixed_min_size_aligns_eviction() {
        let a = stream("a");
        let b = stream("b");
        for t in 1..=4 {
            add(&a, t, t);
        }
        add(&b, 10, 1);
        add(&b, 20, 2);
        let options = serde_json::json!({
            "trigger_queue_size": 2,
            "target_queue_size": 2,
            "fixed_min_size": true
        });
        let mut handler = FixedSizeInputStreamHandler::new(
            vec![Arc::clone(&a), Arc::clone(&b)],
            Some(&options),
        )
        .unwrap();
        let plan = handler.schedule_invocations(usize::MAX);
        // The cutoff is min(t=3 from a, t=1 from b) = t=1, so b keeps both
        // packets and the set synchronizes from t=1 upward.
        assert!(!plan.invocations.is_empty());
        assert_eq!(plan.invocations[0].input_timestamp, Timestamp::new(1));
        assert_eq!(*plan.invocations[0].inputs[1].value::<i64>().unwrap(), 10);
    }

    #[test]
    fn test_rejects_inconsistent_sizes() {
        let options = serde_json::json!({ "trigger_queue_size": 1, "target_queue_size": 2 });
        assert!(FixedSizeInputStreamHandler::new(Vec::new(), Some(&options)).is_err());
    }
}
