// SPDX-FileCopyrightText: © 2025 FlowGraph Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Adds a configured constant to every `i64` packet.

use flowgraph_core::calculator::{Calculator, CalculatorContext};
use flowgraph_core::contract::CalculatorContract;
use flowgraph_core::error::{FlowGraphError, Result};
use flowgraph_core::packet::Packet;
use flowgraph_core::timestamp::TimestampDiff;
use serde::Deserialize;

pub const KIND: &str = "core::add_constant";

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct Options {
    value: i64,
}

pub struct AddConstantCalculator {
    value: i64,
}

impl AddConstantCalculator {
    pub fn from_options(options: Option<&serde_json::Value>) -> Result<Self> {
        let options = match options {
            Some(value) => Options::deserialize(value).map_err(|e| {
                FlowGraphError::Configuration(format!("invalid {KIND} options: {e}"))
            })?,
            None => Options::default(),
        };
        Ok(Self { value: options.value })
    }
}

pub fn contract(contract: &mut CalculatorContract) -> Result<()> {
    contract.expect_arity(1, 1)?;
    contract.input_mut(0).set::<i64>();
    contract.output_mut(0).set::<i64>();
    Ok(())
}

impl Calculator for AddConstantCalculator {
    fn open(&mut self, cc: &mut CalculatorContext) -> Result<()> {
        cc.output(0).set_offset(TimestampDiff::ZERO)
    }

    fn process(&mut self, cc: &mut CalculatorContext) -> Result<()> {
        if !cc.input(0).is_empty() {
            let v = *cc.input(0).get::<i64>()?;
            let ts = cc.input_timestamp;
            cc.output(0).add_packet(Packet::new(v + self.value).at(ts))?;
        }
        Ok(())
    }
}
