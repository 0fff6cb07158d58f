// SPDX-FileCopyrightText: © 2025 FlowGraph Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Calculator factory registry.
//!
//! Calculators are selected by name at graph-build time: the registry maps a
//! calculator kind (e.g. `core::pass_through`) to its contract function and a
//! factory that builds a fresh instance per run, configured from optional
//! JSON options.

use crate::calculator::Calculator;
use crate::contract::CalculatorContract;
use crate::error::{FlowGraphError, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Builds a fresh calculator instance from optional configuration.
pub type CalculatorFactory =
    Arc<dyn Fn(Option<&serde_json::Value>) -> Result<Box<dyn Calculator>> + Send + Sync>;

/// Declares a node's edge and side packet types into a sized contract.
pub type ContractFn = Arc<dyn Fn(&mut CalculatorContract) -> Result<()> + Send + Sync>;

#[derive(Clone)]
struct CalculatorInfo {
    contract: ContractFn,
    factory: CalculatorFactory,
}

/// The registry of all calculator kinds a graph can instantiate.
#[derive(Clone, Default)]
pub struct CalculatorRegistry {
    info: HashMap<String, CalculatorInfo>,
}

impl CalculatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a calculator kind. A later registration under the same name
    /// replaces the earlier one.
    pub fn register<C, F>(&mut self, name: &str, contract: C, factory: F)
    where
        C: Fn(&mut CalculatorContract) -> Result<()> + Send + Sync + 'static,
        F: Fn(Option<&serde_json::Value>) -> Result<Box<dyn Calculator>> + Send + Sync + 'static,
    {
        self.info.insert(
            name.to_string(),
            CalculatorInfo { contract: Arc::new(contract), factory: Arc::new(factory) },
        );
    }

    /// Runs the registered contract function for `name` against `contract`.
    pub fn fill_contract(&self, name: &str, contract: &mut CalculatorContract) -> Result<()> {
        let info = self.info.get(name).ok_or_else(|| {
            FlowGraphError::NotFound(format!("calculator '{name}' is not registered"))
        })?;
        (info.contract)(contract)
    }

    /// Creates a fresh calculator instance, passing in its configuration.
    pub fn create(
        &self,
        name: &str,
        options: Option<&serde_json::Value>,
    ) -> Result<Box<dyn Calculator>> {
        let info = self.info.get(name).ok_or_else(|| {
            FlowGraphError::NotFound(format!("calculator '{name}' is not registered"))
        })?;
        (info.factory)(options)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.info.contains_key(name)
    }

    /// Removes a calculator kind. Returns true if it was present.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.info.remove(name).is_some()
    }

    /// The registered calculator kinds, unordered.
    pub fn kinds(&self) -> Vec<&str> {
        self.info.keys().map(String::as_str).collect()
    }
}
