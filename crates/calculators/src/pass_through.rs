// SPDX-FileCopyrightText: © 2025 FlowGraph Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Forwards every input packet unchanged, input `i` to output `i`.
//!
//! Mostly useful for renaming streams and for fanning a typed stream into a
//! subgraph; it also serves as the minimal example of a `SameAs` contract and
//! a zero offset.

use flowgraph_core::calculator::{Calculator, CalculatorContext};
use flowgraph_core::contract::CalculatorContract;
use flowgraph_core::error::{FlowGraphError, Result};
use flowgraph_core::packet_type::EdgeRef;
use flowgraph_core::timestamp::TimestampDiff;

pub const KIND: &str = "core::pass_through";

pub struct PassThroughCalculator;

pub fn contract(contract: &mut CalculatorContract) -> Result<()> {
    if contract.num_inputs() != contract.num_outputs() {
        return Err(FlowGraphError::Configuration(format!(
            "node '{}' must have as many outputs as inputs, got {} and {}",
            contract.node_name(),
            contract.num_inputs(),
            contract.num_outputs()
        )));
    }
    for i in 0..contract.num_inputs() {
        contract.input_mut(i).set_any();
        contract.output_mut(i).set_same_as(EdgeRef::Input(i));
    }
    Ok(())
}

impl Calculator for PassThroughCalculator {
    fn open(&mut self, cc: &mut CalculatorContext) -> Result<()> {
        for i in 0..cc.outputs.len() {
            cc.output(i).set_offset(TimestampDiff::ZERO)?;
        }
        Ok(())
    }

    fn process(&mut self, cc: &mut CalculatorContext) -> Result<()> {
        for i in 0..cc.inputs.len() {
            if !cc.input(i).is_empty() {
                let packet = cc.input(i).clone();
                cc.output(i).add_packet(packet)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgraph_core::packet::Packet;
    use flowgraph_core::packet_type::PacketType;
    use flowgraph_core::shard::{InputStreamShard, OutputStreamShard};
    use flowgraph_core::timestamp::Timestamp;
    use std::sync::Arc;

    #[test]
    fn test_contract_requires_matching_arity() {
        let mut c = CalculatorContract::new("pt", 2, 1, None);
        assert!(contract(&mut c).is_err());
        let mut c = CalculatorContract::new("pt", 2, 2, None);
        contract(&mut c).unwrap();
        assert!(c.outputs()[1].is_same_as());
    }

    #[test]
    fn test_forwards_packets() {
        let mut cc = CalculatorContext::new(Arc::from("pt"), Vec::new(), false);
        cc.input_timestamp = Timestamp::new(3);
        let packet = Packet::new(7i64).at(Timestamp::new(3));
        cc.inputs = vec![InputStreamShard::new(Arc::from("in"), packet.clone())];
        cc.outputs = vec![OutputStreamShard::new(
            Arc::from("out"),
            PacketType::Any,
            Timestamp::UNSTARTED,
            true,
            false,
        )];
        PassThroughCalculator.process(&mut cc).unwrap();
        let out = cc.output(0).take_packets();
        assert_eq!(out.len(), 1);
        assert!(out[0].shares_payload_with(&packet));
    }
}
