// SPDX-FileCopyrightText: © 2025 FlowGraph Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Calculator contracts.
//!
//! Before any calculator instance exists, the graph validator asks the
//! registered contract function to declare the node's edge and side packet
//! types into a [`CalculatorContract`]. The contract is sized from the node's
//! configuration (one slot per wired stream), so a contract function both
//! validates the arity it was given and fills in the types.

use crate::error::{FlowGraphError, Result};
use crate::packet_type::PacketType;
use indexmap::IndexMap;

/// The declared interface of one node: per-edge packet types, side packet
/// types, and an optional input stream handler preference.
#[derive(Debug, Default)]
pub struct CalculatorContract {
    node_name: String,
    inputs: Vec<PacketType>,
    outputs: Vec<PacketType>,
    input_side_packets: IndexMap<String, PacketType>,
    output_side_packets: IndexMap<String, PacketType>,
    options: Option<serde_json::Value>,
    input_stream_handler: Option<String>,
}

impl CalculatorContract {
    pub fn new(
        node_name: impl Into<String>,
        num_inputs: usize,
        num_outputs: usize,
        options: Option<serde_json::Value>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            inputs: vec![PacketType::default(); num_inputs],
            outputs: vec![PacketType::default(); num_outputs],
            input_side_packets: IndexMap::new(),
            output_side_packets: IndexMap::new(),
            options,
            input_stream_handler: None,
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Fails unless the node was wired with exactly the given edge counts.
    /// Contract functions call this first when their shape is fixed.
    pub fn expect_arity(&self, num_inputs: usize, num_outputs: usize) -> Result<()> {
        if self.inputs.len() != num_inputs || self.outputs.len() != num_outputs {
            return Err(FlowGraphError::Configuration(format!(
                "node '{}' expects {num_inputs} input(s) and {num_outputs} output(s), \
                 got {} and {}",
                self.node_name,
                self.inputs.len(),
                self.outputs.len()
            )));
        }
        Ok(())
    }

    pub fn input_mut(&mut self, index: usize) -> &mut PacketType {
        &mut self.inputs[index]
    }

    pub fn output_mut(&mut self, index: usize) -> &mut PacketType {
        &mut self.outputs[index]
    }

    pub fn inputs(&self) -> &[PacketType] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[PacketType] {
        &self.outputs
    }

    pub fn declare_input_side_packet<T: 'static>(&mut self, name: impl Into<String>) {
        let mut ty = PacketType::default();
        ty.set::<T>();
        self.input_side_packets.insert(name.into(), ty);
    }

    pub fn declare_input_side_packet_any(&mut self, name: impl Into<String>) {
        self.input_side_packets.insert(name.into(), PacketType::Any);
    }

    pub fn declare_output_side_packet<T: 'static>(&mut self, name: impl Into<String>) {
        let mut ty = PacketType::default();
        ty.set::<T>();
        self.output_side_packets.insert(name.into(), ty);
    }

    pub fn input_side_packets(&self) -> &IndexMap<String, PacketType> {
        &self.input_side_packets
    }

    pub fn output_side_packets(&self) -> &IndexMap<String, PacketType> {
        &self.output_side_packets
    }

    pub fn options(&self) -> Option<&serde_json::Value> {
        self.options.as_ref()
    }

    /// Selects the input stream handler this calculator needs, overriding the
    /// default lock-step policy. A handler given in the node's configuration
    /// still wins over this preference.
    pub fn set_input_stream_handler(&mut self, name: impl Into<String>) {
        self.input_stream_handler = Some(name.into());
    }

    pub fn input_stream_handler(&self) -> Option<&str> {
        self.input_stream_handler.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expect_arity() {
        let contract = CalculatorContract::new("adder", 2, 1, None);
        assert!(contract.expect_arity(2, 1).is_ok());
        let err = contract.expect_arity(1, 1).unwrap_err();
        assert!(matches!(err, FlowGraphError::Configuration(_)));
    }

    #[test]
    fn test_declared_types() {
        let mut contract = CalculatorContract::new("adder", 1, 1, None);
        contract.input_mut(0).set::<i64>();
        contract.output_mut(0).set::<i64>();
        contract.declare_input_side_packet::<String>("label");
        assert_eq!(contract.inputs().len(), 1);
        assert!(contract.input_side_packets().contains_key("label"));
    }
}
