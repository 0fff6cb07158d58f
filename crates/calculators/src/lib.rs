// SPDX-FileCopyrightText: © 2025 FlowGraph Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! FlowGraph Calculators - Built-in calculator implementations.
//!
//! Small general-purpose calculators shipped with the framework:
//!
//! - [`pass_through`]: forward inputs unchanged (`core::pass_through`)
//! - [`add_constant`]: add a constant to `i64` packets (`core::add_constant`)
//! - [`mux`]: control-stream driven stream selection (`core::mux`)
//!
//! Call [`register_builtins`] on a registry before building graphs that use
//! them.

pub mod add_constant;
pub mod mux;
pub mod pass_through;

use flowgraph_core::calculator::Calculator;
use flowgraph_core::registry::CalculatorRegistry;

/// Registers every built-in calculator kind.
pub fn register_builtins(registry: &mut CalculatorRegistry) {
    registry.register(pass_through::KIND, pass_through::contract, |_options| {
        Ok(Box::new(pass_through::PassThroughCalculator) as Box<dyn Calculator>)
    });
    registry.register(add_constant::KIND, add_constant::contract, |options| {
        Ok(Box::new(add_constant::AddConstantCalculator::from_options(options)?)
            as Box<dyn Calculator>)
    });
    registry.register(mux::KIND, mux::contract, |_options| {
        Ok(Box::new(mux::MuxCalculator) as Box<dyn Calculator>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_builtins() {
        let mut registry = CalculatorRegistry::new();
        register_builtins(&mut registry);
        assert!(registry.contains("core::pass_through"));
        assert!(registry.contains("core::add_constant"));
        assert!(registry.contains("core::mux"));
    }
}
