// SPDX-FileCopyrightText: © 2025 FlowGraph Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Forwards one of several data streams, chosen per timestamp by a control
//! stream.
//!
//! Inputs are `n` data streams followed by one `i64` control stream; the
//! single output carries whichever data packet the control stream selected.
//! The heavy lifting happens in the node's `MuxInputStreamHandler`, which
//! this calculator requests through its contract: by the time `process` runs,
//! exactly the selected data stream (at most) carries a packet.

use flowgraph_core::calculator::{Calculator, CalculatorContext};
use flowgraph_core::contract::CalculatorContract;
use flowgraph_core::error::{FlowGraphError, Result};
use flowgraph_core::packet_type::EdgeRef;

pub const KIND: &str = "core::mux";

pub struct MuxCalculator;

pub fn contract(contract: &mut CalculatorContract) -> Result<()> {
    if contract.num_inputs() < 2 || contract.num_outputs() != 1 {
        return Err(FlowGraphError::Configuration(format!(
            "node '{}' needs at least one data stream plus a control stream, \
             and exactly one output",
            contract.node_name()
        )));
    }
    let control = contract.num_inputs() - 1;
    for i in 0..control {
        contract.input_mut(i).set_any();
    }
    contract.input_mut(control).set::<i64>();
    contract.output_mut(0).set_same_as(EdgeRef::Input(0));
    contract.set_input_stream_handler("MuxInputStreamHandler");
    Ok(())
}

impl Calculator for MuxCalculator {
    fn process(&mut self, cc: &mut CalculatorContext) -> Result<()> {
        let control = cc.inputs.len() - 1;
        for i in 0..control {
            if !cc.input(i).is_empty() {
                let packet = cc.input(i).clone();
                cc.output(0).add_packet(packet)?;
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_shape() {
        let mut c = CalculatorContract::new("mux", 3, 1, None);
        contract(&mut c).unwrap();
        assert_eq!(c.input_stream_handler(), Some("MuxInputStreamHandler"));
        let mut ty = flowgraph_core::packet_type::PacketType::default();
        ty.set::<i64>();
        assert_eq!(c.inputs()[2], ty);

        let mut c = CalculatorContract::new("mux", 1, 1, None);
        assert!(contract(&mut c).is_err());
    }
}
