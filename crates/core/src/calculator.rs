// SPDX-FileCopyrightText: © 2025 FlowGraph Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The calculator lifecycle contract and its execution context.
//!
//! A calculator is the user-defined body of one graph node. The engine drives
//! it through a fixed lifecycle — `open` once, `process` once per ready
//! invocation, `close` once after input exhaustion — and exchanges typed
//! packets through the [`CalculatorContext`]. The engine never inspects
//! calculator internals, and a calculator never touches the runtime's stream
//! managers directly.

use crate::error::{FlowGraphError, Result};
use crate::packet::Packet;
use crate::shard::{InputStreamShard, OutputStreamShard};
use crate::timestamp::Timestamp;
use indexmap::IndexMap;
use std::sync::Arc;

/// The context handed to a calculator for one lifecycle call.
///
/// `inputs` holds one shard per declared input edge, in contract order;
/// `outputs` holds one staging shard per declared output edge. During
/// `process`, `input_timestamp` is the invocation timestamp chosen by the
/// node's input stream handler; during `open` it is `UNSTARTED` and during
/// `close` it is `DONE`.
pub struct CalculatorContext {
    pub node_name: Arc<str>,
    pub input_timestamp: Timestamp,
    pub inputs: Vec<InputStreamShard>,
    pub outputs: Vec<OutputStreamShard>,
    /// Read-only side packets, immutable for the whole run.
    pub input_side_packets: IndexMap<String, Packet>,
    output_side: Vec<(Arc<str>, Option<Packet>)>,
    in_open: bool,
}

impl CalculatorContext {
    /// Builds an empty context; the engine fills in the public fields. Engine
    /// use.
    pub fn new(node_name: Arc<str>, output_side_packets: Vec<Arc<str>>, in_open: bool) -> Self {
        Self {
            node_name,
            input_timestamp: Timestamp::UNSET,
            inputs: Vec::new(),
            outputs: Vec::new(),
            input_side_packets: IndexMap::new(),
            output_side: output_side_packets.into_iter().map(|n| (n, None)).collect(),
            in_open,
        }
    }

    /// The packet of input edge `index` for this invocation (possibly empty).
    pub fn input(&self, index: usize) -> &Packet {
        self.inputs[index].packet()
    }

    /// The staging shard of output edge `index`.
    pub fn output(&mut self, index: usize) -> &mut OutputStreamShard {
        &mut self.outputs[index]
    }

    pub fn input_side_packet(&self, name: &str) -> Option<&Packet> {
        self.input_side_packets.get(name)
    }

    /// Stages a write-once output side packet. Open only; the packet must be
    /// non-empty and carry an unset timestamp.
    pub fn set_output_side_packet(&mut self, name: &str, packet: Packet) -> Result<()> {
        if !self.in_open {
            return Err(FlowGraphError::FailedPrecondition(format!(
                "output side packet '{name}' may only be set during Open"
            )));
        }
        if packet.is_empty() {
            return Err(FlowGraphError::InvalidArgument(format!(
                "output side packet '{name}' must not be empty"
            )));
        }
        if !packet.timestamp().is_unset() {
            return Err(FlowGraphError::InvalidArgument(format!(
                "output side packet '{name}' must carry an unset timestamp"
            )));
        }
        let slot = self
            .output_side
            .iter_mut()
            .find(|(n, _)| n.as_ref() == name)
            .ok_or_else(|| {
                FlowGraphError::NotFound(format!(
                    "node '{}' declares no output side packet '{name}'",
                    self.node_name
                ))
            })?;
        if slot.1.is_some() {
            return Err(FlowGraphError::FailedPrecondition(format!(
                "output side packet '{name}' was already set"
            )));
        }
        slot.1 = Some(packet);
        Ok(())
    }

    /// Drains the staged output side packets. Engine use.
    pub fn take_output_side_packets(&mut self) -> Vec<(Arc<str>, Packet)> {
        self.output_side
            .iter_mut()
            .filter_map(|(name, slot)| slot.take().map(|p| (name.clone(), p)))
            .collect()
    }
}

/// The fundamental trait for any processing node body.
///
/// Implementations are constructed per run by a registered factory, so any
/// state accumulated across `process` calls is naturally scoped to one run.
pub trait Calculator: Send {
    /// Called once per run before any `process`. May set offsets, headers and
    /// output side packets, and may already emit packets.
    fn open(&mut self, _cc: &mut CalculatorContext) -> Result<()> {
        Ok(())
    }

    /// Called once per ready invocation with a consistent snapshot of ready
    /// inputs.
    fn process(&mut self, cc: &mut CalculatorContext) -> Result<()>;

    /// Called exactly once after input exhaustion, before the node is marked
    /// closed. May still emit packets.
    fn close(&mut self, _cc: &mut CalculatorContext) -> Result<()> {
        Ok(())
    }
}
