// SPDX-FileCopyrightText: © 2025 FlowGraph Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! FlowGraph Core - Data model and calculator contract for timestamped
//! dataflow graphs.
//!
//! This crate defines the abstractions shared by the engine and by calculator
//! implementations:
//!
//! - [`timestamp`]: `Timestamp`/`TimestampDiff` and bound arithmetic
//! - [`packet`]: type-erased, reference-counted, timestamped values
//! - [`packet_type`]: per-edge type descriptors and `SameAs` resolution
//! - [`shard`]: per-invocation input/output stream views
//! - [`calculator`]: the `Calculator` lifecycle trait and its context
//! - [`contract`]: declared node interfaces
//! - [`registry`]: calculator factory registry
//! - [`error`]: error types and handling
//!
//! ## Quick Start
//!
//! ```
//! use flowgraph_core::calculator::{Calculator, CalculatorContext};
//! use flowgraph_core::error::Result;
//! use flowgraph_core::packet::Packet;
//!
//! struct Doubler;
//!
//! impl Calculator for Doubler {
//!     fn process(&mut self, cc: &mut CalculatorContext) -> Result<()> {
//!         if !cc.input(0).is_empty() {
//!             let v = *cc.input(0).get::<i64>()?;
//!             let ts = cc.input_timestamp;
//!             cc.output(0).add_packet(Packet::new(v * 2).at(ts))?;
//!         }
//!         Ok(())
//!     }
//! }
//! ```

pub mod calculator;
pub mod contract;
pub mod error;
pub mod packet;
pub mod packet_type;
pub mod registry;
pub mod shard;
pub mod timestamp;

// Convenience re-exports for the types calculator implementations touch most.
pub use calculator::{Calculator, CalculatorContext};
pub use contract::CalculatorContract;
pub use error::{FlowGraphError, Result};
pub use packet::{Packet, TypeKey};
pub use packet_type::{EdgeRef, PacketType};
pub use registry::{CalculatorFactory, CalculatorRegistry, ContractFn};
pub use shard::{InputStreamShard, OutputStreamShard};
pub use timestamp::{Timestamp, TimestampDiff};
