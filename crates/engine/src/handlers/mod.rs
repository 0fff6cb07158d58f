// SPDX-FileCopyrightText: © 2025 FlowGraph Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Input stream handlers: per-node input scheduling policies.
//!
//! A handler owns the consumer side of all of one node's input streams and
//! decides when the node is ready to run, at which timestamp, and with which
//! packets. The engine asks the handler for a [`SchedulingPlan`] whenever a
//! producer signals that the node's readiness may have changed; everything
//! else (invoking the calculator, propagating outputs) is policy-free.
//!
//! Built-in policies:
//!
//! - [`DefaultInputStreamHandler`]: lock-step sync over all inputs, optional
//!   invocation batching
//! - [`FixedSizeInputStreamHandler`]: bounded queues with surplus eviction
//! - [`ImmediateInputStreamHandler`]: fire per arriving packet, no sync
//! - [`TimestampAlignInputStreamHandler`]: sync across per-stream clock
//!   domains by learning constant offsets
//! - [`MuxInputStreamHandler`]: control-stream driven input selection

mod default;
mod fixed_size;
mod immediate;
mod mux;
mod timestamp_align;

pub use default::DefaultInputStreamHandler;
pub use fixed_size::FixedSizeInputStreamHandler;
pub use immediate::ImmediateInputStreamHandler;
pub use mux::MuxInputStreamHandler;
pub use timestamp_align::TimestampAlignInputStreamHandler;

use crate::input_stream::InputStreamManager;
use flowgraph_core::error::{FlowGraphError, Result};
use flowgraph_core::shard::InputStreamShard;
use flowgraph_core::timestamp::Timestamp;
use std::collections::HashMap;
use std::sync::Arc;

/// One ready invocation: the chosen timestamp and a settled input snapshot,
/// one shard per input edge in declared order.
#[derive(Debug)]
pub struct PreparedInvocation {
    pub input_timestamp: Timestamp,
    pub inputs: Vec<InputStreamShard>,
    /// Whether completing this invocation may advance downstream bounds.
    /// False for all but the first invocation of a batch.
    pub propagate_bound: bool,
}

/// What a handler decided for one scheduling round.
#[derive(Debug)]
pub struct SchedulingPlan {
    /// Invocations to run, in timestamp order.
    pub invocations: Vec<PreparedInvocation>,
    /// All inputs are exhausted; the node should close after the invocations.
    pub ready_for_close: bool,
    /// The node's input bound when no invocation was produced: the earliest
    /// timestamp a future invocation could carry. `UNSET` when the handler
    /// withholds progress (e.g. while a batch is accumulating).
    pub input_bound: Timestamp,
    /// A scheduling-time failure (e.g. an unreadable control packet). The
    /// engine treats it like a calculator error.
    pub error: Option<FlowGraphError>,
}

impl Default for SchedulingPlan {
    fn default() -> Self {
        Self {
            invocations: Vec::new(),
            ready_for_close: false,
            input_bound: Timestamp::UNSET,
            error: None,
        }
    }
}

/// Per-node input scheduling policy.
pub trait InputStreamHandler: Send {
    /// Produces at most `max_allowance` new invocations. Popping packets and
    /// choosing timestamps happens here; the handler must leave its streams
    /// consistent with the plan it returns.
    fn schedule_invocations(&mut self, max_allowance: usize) -> SchedulingPlan;
}

/// Readiness of a synchronized set of input streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Carries the bound below which no invocation can happen.
    NotReady(Timestamp),
    /// A settled timestamp exists; carries it.
    ReadyForProcess(Timestamp),
    /// Every stream is done.
    ReadyForClose,
}

/// Computes lock-step readiness over a set of streams.
///
/// A timestamp is *settled* once no stream can produce anything earlier: the
/// smallest queued front timestamp fires iff it is below every empty stream's
/// bound.
pub fn sync_set_readiness(streams: &[Arc<InputStreamManager>]) -> Readiness {
    let mut min_bound = Timestamp::DONE;
    let mut min_packet: Option<Timestamp> = None;
    for stream in streams {
        let (ts, empty) = stream.min_timestamp_or_bound();
        if empty {
            min_bound = min_bound.min(ts);
        } else {
            min_packet = Some(min_packet.map_or(ts, |p| p.min(ts)));
        }
    }
    match min_packet {
        Some(ts) if ts < min_bound => Readiness::ReadyForProcess(ts),
        Some(_) => Readiness::NotReady(min_bound),
        None if min_bound == Timestamp::DONE => Readiness::ReadyForClose,
        None => Readiness::NotReady(min_bound),
    }
}

/// Builds the input set for an invocation at `timestamp`: the packet at that
/// timestamp from each stream that has one, an empty placeholder from each
/// that does not. The placeholder's timestamp is the stream's settled
/// horizon, the predecessor of its bound.
pub fn fill_input_set(
    streams: &[Arc<InputStreamManager>],
    timestamp: Timestamp,
) -> Vec<InputStreamShard> {
    streams
        .iter()
        .map(|s| InputStreamShard::new(s.name_arc(), s.pop_packet_at_timestamp(timestamp)))
        .collect()
}

/// Builds a handler from the node's input streams and optional JSON options.
pub type HandlerFactory = Arc<
    dyn Fn(
            Vec<Arc<InputStreamManager>>,
            Option<&serde_json::Value>,
        ) -> Result<Box<dyn InputStreamHandler>>
        + Send
        + Sync,
>;

/// Registry of input stream handler policies, keyed by name.
#[derive(Clone)]
pub struct HandlerRegistry {
    factories: HashMap<String, HandlerFactory>,
}

impl HandlerRegistry {
    /// A registry with every built-in policy registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self { factories: HashMap::new() };
        registry.register("DefaultInputStreamHandler", |streams, options| {
            Ok(Box::new(DefaultInputStreamHandler::new(streams, options)?))
        });
        registry.register("FixedSizeInputStreamHandler", |streams, options| {
            Ok(Box::new(FixedSizeInputStreamHandler::new(streams, options)?))
        });
        registry.register("ImmediateInputStreamHandler", |streams, _options| {
            Ok(Box::new(ImmediateInputStreamHandler::new(streams)))
        });
        registry.register("TimestampAlignInputStreamHandler", |streams, options| {
            Ok(Box::new(TimestampAlignInputStreamHandler::new(streams, options)?))
        });
        registry.register("MuxInputStreamHandler", |streams, _options| {
            Ok(Box::new(MuxInputStreamHandler::new(streams)))
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(
                Vec<Arc<InputStreamManager>>,
                Option<&serde_json::Value>,
            ) -> Result<Box<dyn InputStreamHandler>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn create(
        &self,
        name: &str,
        streams: Vec<Arc<InputStreamManager>>,
        options: Option<&serde_json::Value>,
    ) -> Result<Box<dyn InputStreamHandler>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            FlowGraphError::NotFound(format!("input stream handler '{name}' is not registered"))
        })?;
        factory(streams, options)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
