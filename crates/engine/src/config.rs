// SPDX-FileCopyrightText: © 2025 FlowGraph Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Graph configuration.
//!
//! A [`GraphConfig`] is plain serializable data: the graph's input streams,
//! its nodes, and runtime knobs. Everything referenced by name (calculators,
//! handlers, streams, side packets) is resolved at build time by the graph
//! validator, never lazily during a run.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Behavior of `add_packet_to_input_stream` when a graph input queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphInputStreamAddMode {
    /// Block the caller until a consumer drains the queue.
    #[default]
    WaitUntilNotFull,
    /// Never block; queues grow without limit.
    Unlimited,
}

/// Per-node selection of an input stream handler policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputStreamHandlerConfig {
    /// Registered handler name, e.g. `FixedSizeInputStreamHandler`.
    pub handler: String,
    #[serde(default)]
    pub options: Option<serde_json::Value>,
}

/// Configuration of one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Registered calculator kind, e.g. `core::pass_through`.
    pub calculator: String,
    /// Unique node name; derived from the calculator kind when empty.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub input_streams: Vec<String>,
    #[serde(default)]
    pub output_streams: Vec<String>,
    /// Local side packet name to graph-level side packet name.
    #[serde(default)]
    pub input_side_packets: IndexMap<String, String>,
    #[serde(default)]
    pub output_side_packets: IndexMap<String, String>,
    /// Input streams to ignore during cycle validation. The packets still
    /// flow; only the edge direction is exempted.
    #[serde(default)]
    pub back_edge_inputs: Vec<String>,
    /// Calculator-specific options, passed verbatim to the factory.
    #[serde(default)]
    pub options: Option<serde_json::Value>,
    /// Overrides both the default policy and the calculator's preference.
    #[serde(default)]
    pub input_stream_handler: Option<InputStreamHandlerConfig>,
    /// Upper limit on invocations prepared but not yet completed.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

const fn default_max_in_flight() -> usize {
    1
}

/// Configuration of a whole graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GraphConfig {
    /// Streams fed from outside the graph.
    pub input_streams: Vec<String>,
    pub nodes: Vec<NodeConfig>,
    /// Worker threads; zero selects the host's available parallelism.
    pub num_threads: usize,
    /// Queue limit applied to graph input streams; zero means unbounded.
    pub max_queue_size: usize,
    pub input_stream_add_mode: GraphInputStreamAddMode,
}

impl GraphConfig {
    /// Parses a JSON graph description.
    ///
    /// # Errors
    ///
    /// Returns the underlying parse error message wrapped as a configuration
    /// failure.
    pub fn from_json(json: &str) -> flowgraph_core::error::Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            flowgraph_core::error::FlowGraphError::Configuration(format!(
                "invalid graph configuration: {e}"
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_graph() {
        let config = GraphConfig::from_json(
            r#"{
                "input_streams": ["in"],
                "nodes": [
                    {
                        "calculator": "core::pass_through",
                        "input_streams": ["in"],
                        "output_streams": ["out"]
                    }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(config.input_streams, vec!["in"]);
        assert_eq!(config.nodes.len(), 1);
        assert_eq!(config.nodes[0].max_in_flight, 1);
        assert_eq!(config.input_stream_add_mode, GraphInputStreamAddMode::WaitUntilNotFull);
    }

    #[test]
    fn test_parse_handler_and_options() {
        let config = GraphConfig::from_json(
            r#"{
                "nodes": [
                    {
                        "calculator": "core::add_constant",
                        "name": "adder",
                        "input_streams": ["a"],
                        "output_streams": ["b"],
                        "options": { "value": 3 },
                        "input_stream_handler": {
                            "handler": "FixedSizeInputStreamHandler",
                            "options": { "trigger_queue_size": 2 }
                        }
                    }
                ]
            }"#,
        )
        .unwrap();
        let node = &config.nodes[0];
        assert_eq!(node.name, "adder");
        assert!(node.options.is_some());
        assert_eq!(
            node.input_stream_handler.as_ref().unwrap().handler,
            "FixedSizeInputStreamHandler"
        );
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let result = GraphConfig::from_json(r#"{ "streams": ["in"] }"#);
        assert!(result.is_err());
    }
}
