// SPDX-FileCopyrightText: © 2025 FlowGraph Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Lock-step synchronization, the default policy.
//!
//! Fires one invocation per settled timestamp across all input streams, in
//! strictly increasing timestamp order. With `batch_size > 1` the handler
//! accumulates that many ready invocations before releasing any, withholding
//! the node's input bound in the meantime so downstream consumers observe the
//! whole batch at once.

use super::{
    fill_input_set, sync_set_readiness, InputStreamHandler, PreparedInvocation, Readiness,
    SchedulingPlan,
};
use crate::input_stream::InputStreamManager;
use flowgraph_core::error::{FlowGraphError, Result};
use flowgraph_core::timestamp::Timestamp;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct Options {
    batch_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self { batch_size: 1 }
    }
}

pub struct DefaultInputStreamHandler {
    streams: Vec<Arc<InputStreamManager>>,
    batch_size: usize,
    /// Invocations withheld while the current batch fills up.
    pending: Vec<PreparedInvocation>,
    /// Completed-batch invocations not yet handed out. Drained incrementally
    /// so a batch larger than the node's in-flight allowance still makes
    /// progress across scheduling rounds.
    released: VecDeque<PreparedInvocation>,
}

impl DefaultInputStreamHandler {
    pub fn new(
        streams: Vec<Arc<InputStreamManager>>,
        options: Option<&serde_json::Value>,
    ) -> Result<Self> {
        let options = match options {
            Some(value) => Options::deserialize(value).map_err(|e| {
                FlowGraphError::Configuration(format!("invalid DefaultInputStreamHandler options: {e}"))
            })?,
            None => Options::default(),
        };
        if options.batch_size == 0 {
            return Err(FlowGraphError::Configuration(
                "batch_size must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            streams,
            batch_size: options.batch_size,
            pending: Vec::new(),
            released: VecDeque::new(),
        })
    }

    fn drain_released(&mut self, plan: &mut SchedulingPlan, max_allowance: usize) {
        while plan.invocations.len() < max_allowance {
            let Some(invocation) = self.released.pop_front() else { break };
            plan.invocations.push(invocation);
        }
    }
}

impl InputStreamHandler for DefaultInputStreamHandler {
    fn schedule_invocations(&mut self, max_allowance: usize) -> SchedulingPlan {
        let mut plan = SchedulingPlan::default();
        self.drain_released(&mut plan, max_allowance);
        while plan.invocations.len() < max_allowance {
            match sync_set_readiness(&self.streams) {
                Readiness::ReadyForProcess(ts) => {
                    let inputs = fill_input_set(&self.streams, ts);
                    // Only a batch's first invocation advances bounds, so the
                    // batch lands downstream as one unit.
                    let propagate_bound = self.pending.is_empty();
                    self.pending.push(PreparedInvocation {
                        input_timestamp: ts,
                        inputs,
                        propagate_bound,
                    });
                    if self.pending.len() >= self.batch_size {
                        self.released.extend(self.pending.drain(..));
                        self.drain_released(&mut plan, max_allowance);
                    }
                },
                Readiness::ReadyForClose => {
                    // Flush a partial batch before closing.
                    self.released.extend(self.pending.drain(..));
                    self.drain_released(&mut plan, max_allowance);
                    plan.ready_for_close = self.released.is_empty();
                    break;
                },
                Readiness::NotReady(bound) => {
                    if self.pending.is_empty() && self.released.is_empty() {
                        plan.input_bound = bound;
                    } else {
                        plan.input_bound = Timestamp::UNSET;
                    }
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
    fn test_fires_in_timestamp_order() {
        let a = stream("a");
        let b = stream("b");
        add(&a, 1, 1);
        add(&a, 2, 3);
        add(&b, 10, 1);
        b.set_next_timestamp_bound(Timestamp::new(4)).unwrap();

        let mut handler =
            DefaultInputStreamHandler::new(vec![Arc::clone(&a), Arc::clone(&b)], None).unwrap();
        let plan = handler.schedule_invocations(usize::MAX);
        assert_eq!(plan.invocations.len(), 2);
        assert_eq!(plan.invocations[0].input_timestamp, Timestamp::new(1));
        assert_eq!(*plan.invocations[0].inputs[1].value::<i64>().unwrap(), 10);
        assert_eq!(plan.invocations[1].input_timestamp, Timestamp::new(3));
        // b has no packet at t=3.
        assert!(plan.invocations[1].inputs[1].is_empty());
        assert!(!plan.ready_for_close);
        // The next round reports where the node now stands.
        let plan = handler.schedule_invocations(usize::MAX);
        assert!(plan.invocations.is_empty());
        assert_eq!(plan.input_bound, Timestamp::new(4));
    }

    #[test]
    fn test_respects_allowance() {
        let a = stream("a");
        add(&a, 1, 1);
        add(&a, 2, 2);
        add(&a, 3, 3);
        let mut handler = DefaultInputStreamHandler::new(vec![Arc::clone(&a)], None).unwrap();
        let plan = handler.schedule_invocations(2);
        assert_eq!(plan.invocations.len(), 2);
        let plan = handler.schedule_invocations(2);
        assert_eq!(plan.invocations.len(), 1);
    }

    #[test]
    fn test_ready_for_close() {
        let a = stream("a");
        add(&a, 1, 1);
        a.set_next_timestamp_bound(Timestamp::DONE).unwrap();
        let mut handler = DefaultInputStreamHandler::new(vec![Arc::clone(&a)], None).unwrap();
        let plan = handler.schedule_invocations(usize::MAX);
        assert_eq!(plan.invocations.len(), 1);
        assert!(plan.ready_for_close);
    }

    #[test]
    fn test_batching_withholds_until_full() {
        let a = stream("a");
        let options = serde_json::json!({ "batch_size": 2 });
        let mut handler =
            DefaultInputStreamHandler::new(vec![Arc::clone(&a)], Some(&options)).unwrap();

        add(&a, 1, 1);
        a.set_next_timestamp_bound(Timestamp::new(2)).unwrap();
        let plan = handler.schedule_invocations(usize::MAX);
        // One invocation is pending inside the handler; nothing is released
        // and the input bound is withheld.
        assert!(plan.invocations.is_empty());
        assert_eq!(plan.input_bound, Timestamp::UNSET);

        add(&a, 2, 2);
        a.set_next_timestamp_bound(Timestamp::new(3)).unwrap();
        let plan = handler.schedule_invocations(usize::MAX);
        assert_eq!(plan.invocations.len(), 2);
        assert!(plan.invocations[0].propagate_bound);
        assert!(!plan.invocations[1].propagate_bound);
    }

    #[test]
    fn test_full_batch_drains_under_small_allowance() {
        let a = stream("a");
        let options = serde_json::json!({ "batch_size": 2 });
        let mut handler =
            DefaultInputStreamHandler::new(vec![Arc::clone(&a)], Some(&options)).unwrap();
        add(&a, 1, 1);
        add(&a, 2, 2);
        a.set_next_timestamp_bound(Timestamp::DONE).unwrap();

        // A completed batch larger than the allowance comes out one
        // invocation per round instead of being withheld forever.
        let plan = handler.schedule_invocations(1);
        assert_eq!(plan.invocations.len(), 1);
        assert!(plan.invocations[0].propagate_bound);
        assert!(!plan.ready_for_close);

        let plan = handler.schedule_invocations(1);
        assert_eq!(plan.invocations.len(), 1);
        assert!(!plan.invocations[0].propagate_bound);
        assert!(!plan.ready_for_close);

        let plan = handler.schedule_invocations(1);
        assert!(plan.invocations.is_empty());
        assert!(plan.ready_for_close);
    }

    #[test]
    fn test_partial_batch_flushes_on_close() {
        let a = stream("a");
        let options = serde_json::json!({ "batch_size": 3 });
        let mut handler =
            DefaultInputStreamHandler::new(vec![Arc::clone(&a)], Some(&options)).unwrap();
        add(&a, 1, 1);
        a.set_next_timestamp_bound(Timestamp::DONE).unwrap();
        let plan = handler.schedule_invocations(usize::MAX);
        assert_eq!(plan.invocations.len(), 1);
        assert!(plan.ready_for_close);
    }

    #[test]
    fn test_rejects_zero_batch_size() {
        let options = serde_json::json!({ "batch_size": 0 });
        assert!(DefaultInputStreamHandler::new(Vec::new(), Some(&options)).is_err());
    }
}
