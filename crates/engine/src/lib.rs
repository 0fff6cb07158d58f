// SPDX-FileCopyrightText: © 2025 FlowGraph Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! FlowGraph Engine - Graph scheduling and stream propagation.
//!
//! The engine turns a validated [`config::GraphConfig`] into a running
//! dataflow graph: packets move along timestamped streams, every node's input
//! stream handler decides when its calculator fires, and timestamp bounds
//! propagate so downstream nodes can make progress without packets.
//!
//! - [`input_stream`] / [`output_stream`]: durable per-edge stream state
//! - [`side_packet`]: write-once per-run values
//! - [`handlers`]: the input scheduling policy family
//! - [`node`]: the per-node Open/Process/Close driver
//! - [`scheduler`]: the worker pool
//! - [`config`] / [`graph_builder`]: validation and wiring
//! - [`graph`]: the public driver, [`graph::CalculatorGraph`]

pub mod config;
pub mod graph;
pub mod graph_builder;
pub mod handlers;
pub mod input_stream;
pub mod node;
pub mod output_stream;
pub mod scheduler;
pub mod side_packet;

pub use config::{GraphConfig, GraphInputStreamAddMode, InputStreamHandlerConfig, NodeConfig};
pub use graph::{CalculatorGraph, ErrorCallback, OutputStreamPoller};
pub use handlers::{HandlerRegistry, InputStreamHandler, SchedulingPlan};
pub use input_stream::InputStreamManager;
pub use output_stream::OutputStreamManager;
pub use side_packet::OutputSidePacket;
