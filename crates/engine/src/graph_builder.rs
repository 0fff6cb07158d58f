// SPDX-FileCopyrightText: © 2025 FlowGraph Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Graph validation and construction.
//!
//! Turns a [`GraphConfig`] into wired runtime structures, failing fast on
//! anything a run could not recover from: unknown calculators or handlers,
//! unproduced streams, duplicate producers, type conflicts, and cycles not
//! annotated as back edges. All `SameAs` type links are resolved here so the
//! running graph validates packets against concrete types only.

use crate::config::{GraphConfig, NodeConfig};
use crate::handlers::HandlerRegistry;
use crate::input_stream::InputStreamManager;
use crate::node::CalculatorNode;
use crate::output_stream::{MirrorTarget, OutputStreamManager};
use crate::side_packet::OutputSidePacket;
use flowgraph_core::contract::CalculatorContract;
use flowgraph_core::error::{FlowGraphError, Result};
use flowgraph_core::packet_type::{resolve_same_as, EdgeRef, PacketType};
use flowgraph_core::registry::CalculatorRegistry;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Everything needed to (re)start one node: resolved at build time so runs
/// only instantiate.
#[derive(Debug, Clone)]
pub struct NodeSetup {
    pub kind: String,
    pub options: Option<serde_json::Value>,
    pub handler: String,
    pub handler_options: Option<serde_json::Value>,
    /// Local side packet name to graph-level side packet name.
    pub input_side_packets: Vec<(String, String)>,
}

/// One stream fed from outside the graph, exposed as a producer-less output
/// stream manager.
#[derive(Debug)]
pub struct GraphInput {
    pub name: String,
    pub output: Arc<OutputStreamManager>,
}

/// The wired but not yet running graph.
#[derive(Debug)]
pub struct BuiltGraph {
    pub nodes: Vec<Arc<CalculatorNode>>,
    pub setups: Vec<NodeSetup>,
    pub graph_inputs: Vec<GraphInput>,
    /// Every stream in the graph by name, for observer wiring.
    pub streams: HashMap<String, Arc<OutputStreamManager>>,
    pub side_packets: IndexMap<String, Arc<OutputSidePacket>>,
    /// Side packets consumed but not produced by any node; they must be
    /// supplied when the graph is initialized.
    pub required_external_side_packets: Vec<String>,
}

enum Producer {
    GraphInput(usize),
    Node { node: usize, output: usize },
}

/// Validates `config` and wires the runtime structures.
pub fn build_graph(
    config: &GraphConfig,
    registry: &CalculatorRegistry,
    handlers: &HandlerRegistry,
) -> Result<BuiltGraph> {
    let node_names = resolve_node_names(config)?;
    let producers = collect_producers(config)?;

    // Per-node contracts, filled by the registered contract functions.
    let mut contracts = Vec::with_capacity(config.nodes.len());
    for (i, node) in config.nodes.iter().enumerate() {
        if node.input_streams.is_empty() {
            return Err(FlowGraphError::Configuration(format!(
                "node '{}' has no input streams; source nodes are not supported, \
                 feed it from a graph input stream",
                node_names[i]
            )));
        }
        for stream in &node.input_streams {
            if !producers.contains_key(stream.as_str()) {
                return Err(FlowGraphError::Configuration(format!(
                    "input stream '{stream}' of node '{}' is not produced by any \
                     node or graph input",
                    node_names[i]
                )));
            }
        }
        let mut contract = CalculatorContract::new(
            node_names[i].clone(),
            node.input_streams.len(),
            node.output_streams.len(),
            node.options.clone(),
        );
        registry.fill_contract(&node.calculator, &mut contract)?;
        validate_side_packet_wiring(node, &node_names[i], &contract)?;
        contracts.push(contract);
    }

    let resolved = resolve_stream_types(config, &contracts, &producers)?;
    check_acyclic(config, &node_names, &producers)?;

    // Input stream managers, one per (consumer, edge), typed from resolution.
    let mut node_inputs: Vec<Vec<Arc<InputStreamManager>>> = Vec::with_capacity(config.nodes.len());
    for (i, node) in config.nodes.iter().enumerate() {
        let inputs = node
            .input_streams
            .iter()
            .enumerate()
            .map(|(j, stream)| {
                Arc::new(InputStreamManager::new(
                    Arc::from(stream.as_str()),
                    resolved.node_input(i, j).clone(),
                    0,
                ))
            })
            .collect();
        node_inputs.push(inputs);
    }

    // Output stream managers and graph inputs, with mirrors to each consumer.
    let mut streams = HashMap::new();
    let mut node_outputs: Vec<Vec<Arc<OutputStreamManager>>> = Vec::new();
    for (i, node) in config.nodes.iter().enumerate() {
        let outputs: Vec<Arc<OutputStreamManager>> = node
            .output_streams
            .iter()
            .enumerate()
            .map(|(j, stream)| {
                Arc::new(OutputStreamManager::new(
                    Arc::from(stream.as_str()),
                    resolved.node_output(i, j).clone(),
                ))
            })
            .collect();
        for (name, osm) in node.output_streams.iter().zip(&outputs) {
            streams.insert(name.clone(), Arc::clone(osm));
        }
        node_outputs.push(outputs);
    }
    let graph_inputs: Vec<GraphInput> = config
        .input_streams
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let output = Arc::new(OutputStreamManager::new(
                Arc::from(name.as_str()),
                resolved.graph_input(i).clone(),
            ));
            streams.insert(name.clone(), Arc::clone(&output));
            GraphInput { name: name.clone(), output }
        })
        .collect();

    for (i, node) in config.nodes.iter().enumerate() {
        for (j, stream) in node.input_streams.iter().enumerate() {
            let osm = match &producers[stream.as_str()] {
                Producer::GraphInput(g) => &graph_inputs[*g].output,
                Producer::Node { node: p, output } => &node_outputs[*p][*output],
            };
            osm.add_mirror(MirrorTarget::Node(i), Arc::clone(&node_inputs[i][j]));
        }
    }

    // Side packets: node-produced ones carry the producer's declared type,
    // externally supplied ones accept anything.
    let mut side_packets: IndexMap<String, Arc<OutputSidePacket>> = IndexMap::new();
    for (i, node) in config.nodes.iter().enumerate() {
        for (local, global) in &node.output_side_packets {
            if side_packets.contains_key(global) {
                return Err(FlowGraphError::Configuration(format!(
                    "side packet '{global}' is produced more than once"
                )));
            }
            let ty = contracts[i]
                .output_side_packets()
                .get(local)
                .cloned()
                .unwrap_or(PacketType::Any);
            side_packets
                .insert(global.clone(), Arc::new(OutputSidePacket::new(Arc::from(global.as_str()), ty)));
        }
    }
    let mut required_external = Vec::new();
    for (i, node) in config.nodes.iter().enumerate() {
        for (local, global) in &node.input_side_packets {
            let slot = side_packets.entry(global.clone()).or_insert_with(|| {
                required_external.push(global.clone());
                Arc::new(OutputSidePacket::new(Arc::from(global.as_str()), PacketType::Any))
            });
            slot.add_mirror(i, Arc::from(local.as_str()));
        }
    }

    let mut nodes = Vec::with_capacity(config.nodes.len());
    let mut setups = Vec::with_capacity(config.nodes.len());
    for (i, node) in config.nodes.iter().enumerate() {
        let output_side = node
            .output_side_packets
            .iter()
            .map(|(local, global)| {
                (Arc::from(local.as_str()), Arc::clone(&side_packets[global]))
            })
            .collect();
        nodes.push(Arc::new(CalculatorNode::new(
            i,
            Arc::from(node_names[i].as_str()),
            node_inputs[i].clone(),
            node_outputs[i].clone(),
            output_side,
            node.max_in_flight,
        )));
        setups.push(make_setup(node, &contracts[i], handlers)?);
    }

    debug!(
        nodes = nodes.len(),
        graph_inputs = graph_inputs.len(),
        streams = streams.len(),
        "graph built"
    );
    Ok(BuiltGraph {
        nodes,
        setups,
        graph_inputs,
        streams,
        side_packets,
        required_external_side_packets: required_external,
    })
}

fn resolve_node_names(config: &GraphConfig) -> Result<Vec<String>> {
    let mut names = Vec::with_capacity(config.nodes.len());
    let mut seen = HashSet::new();
    for (i, node) in config.nodes.iter().enumerate() {
        if node.calculator.is_empty() {
            return Err(FlowGraphError::Configuration(format!(
                "node at index {i} does not name a calculator"
            )));
        }
        let name = if node.name.is_empty() {
            format!("{}_{i}", node.calculator.replace("::", "_"))
        } else {
            node.name.clone()
        };
        if !seen.insert(name.clone()) {
            return Err(FlowGraphError::Configuration(format!(
                "duplicate node name '{name}'"
            )));
        }
        names.push(name);
    }
    Ok(names)
}

fn collect_producers(config: &GraphConfig) -> Result<HashMap<String, Producer>> {
    let mut producers = HashMap::new();
    for (i, name) in config.input_streams.iter().enumerate() {
        if producers.insert(name.clone(), Producer::GraphInput(i)).is_some() {
            return Err(FlowGraphError::Configuration(format!(
                "duplicate graph input stream '{name}'"
            )));
        }
    }
    for (i, node) in config.nodes.iter().enumerate() {
        for (j, name) in node.output_streams.iter().enumerate() {
            if producers
                .insert(name.clone(), Producer::Node { node: i, output: j })
                .is_some()
            {
                return Err(FlowGraphError::Configuration(format!(
                    "stream '{name}' is produced more than once"
                )));
            }
        }
    }
    Ok(producers)
}

fn validate_side_packet_wiring(
    node: &NodeConfig,
    name: &str,
    contract: &CalculatorContract,
) -> Result<()> {
    for declared in contract.input_side_packets().keys() {
        if !node.input_side_packets.contains_key(declared) {
            return Err(FlowGraphError::Configuration(format!(
                "node '{name}' declares input side packet '{declared}' but the \
                 configuration does not map it"
            )));
        }
    }
    for declared in contract.output_side_packets().keys() {
        if !node.output_side_packets.contains_key(declared) {
            return Err(FlowGraphError::Configuration(format!(
                "node '{name}' declares output side packet '{declared}' but the \
                 configuration does not map it"
            )));
        }
    }
    for configured in node.output_side_packets.keys() {
        if !contract.output_side_packets().contains_key(configured) {
            return Err(FlowGraphError::Configuration(format!(
                "node '{name}' is configured with output side packet '{configured}' \
                 which its calculator does not declare"
            )));
        }
    }
    Ok(())
}

/// Resolved concrete types for every edge slot in the graph.
struct ResolvedTypes {
    types: Vec<PacketType>,
    graph_input_base: usize,
    node_input_base: Vec<usize>,
    node_output_base: Vec<usize>,
}

impl ResolvedTypes {
    fn graph_input(&self, i: usize) -> &PacketType {
        &self.types[self.graph_input_base + i]
    }

    fn node_input(&self, node: usize, edge: usize) -> &PacketType {
        &self.types[self.node_input_base[node] + edge]
    }

    fn node_output(&self, node: usize, edge: usize) -> &PacketType {
        &self.types[self.node_output_base[node] + edge]
    }
}

/// Builds the global slot space (graph inputs, then each node's inputs and
/// outputs), links `SameAs` declarations and producer/consumer connections,
/// and resolves everything to concrete types.
fn resolve_stream_types(
    config: &GraphConfig,
    contracts: &[CalculatorContract],
    producers: &HashMap<String, Producer>,
) -> Result<ResolvedTypes> {
    let graph_input_base = 0;
    let mut next = config.input_streams.len();
    let mut node_input_base = Vec::with_capacity(config.nodes.len());
    let mut node_output_base = Vec::with_capacity(config.nodes.len());
    for node in &config.nodes {
        node_input_base.push(next);
        next += node.input_streams.len();
        node_output_base.push(next);
        next += node.output_streams.len();
    }

    let mut constraints: Vec<Option<PacketType>> = vec![None; next];
    let mut links: Vec<(usize, usize)> = Vec::new();

    let edge_slot = |node: usize, edge: EdgeRef| match edge {
        EdgeRef::Input(j) => node_input_base[node] + j,
        EdgeRef::Output(j) => node_output_base[node] + j,
    };

    for (i, contract) in contracts.iter().enumerate() {
        for (j, ty) in contract.inputs().iter().enumerate() {
            let slot = node_input_base[i] + j;
            match ty {
                PacketType::SameAs(edge) => links.push((slot, edge_slot(i, *edge))),
                concrete => constraints[slot] = Some(concrete.clone()),
            }
        }
        for (j, ty) in contract.outputs().iter().enumerate() {
            let slot = node_output_base[i] + j;
            match ty {
                PacketType::SameAs(edge) => links.push((slot, edge_slot(i, *edge))),
                concrete => constraints[slot] = Some(concrete.clone()),
            }
        }
    }

    // A connection forces the consumer's edge type and the producer's to
    // agree, and carries concrete types through untyped pass-through chains.
    for (i, node) in config.nodes.iter().enumerate() {
        for (j, stream) in node.input_streams.iter().enumerate() {
            let consumer_slot = node_input_base[i] + j;
            let producer_slot = match &producers[stream.as_str()] {
                Producer::GraphInput(g) => graph_input_base + g,
                Producer::Node { node: p, output } => node_output_base[*p] + output,
            };
            links.push((consumer_slot, producer_slot));
        }
    }

    let types = resolve_same_as(&constraints, &links)?;
    Ok(ResolvedTypes { types, graph_input_base, node_input_base, node_output_base })
}

/// Kahn's algorithm over node dependencies, ignoring declared back edges.
fn check_acyclic(
    config: &GraphConfig,
    node_names: &[String],
    producers: &HashMap<String, Producer>,
) -> Result<()> {
    let n = config.nodes.len();
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut indegree = vec![0_usize; n];
    for (i, node) in config.nodes.iter().enumerate() {
        for stream in &node.input_streams {
            if node.back_edge_inputs.contains(stream) {
                continue;
            }
            if let Producer::Node { node: p, .. } = &producers[stream.as_str()] {
                successors[*p].push(i);
                indegree[i] += 1;
            }
        }
    }
    let mut queue: VecDeque<usize> =
        (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut visited = 0;
    while let Some(i) = queue.pop_front() {
        visited += 1;
        for &s in &successors[i] {
            indegree[s] -= 1;
            if indegree[s] == 0 {
                queue.push_back(s);
            }
        }
    }
    if visited < n {
        let stuck: Vec<&str> = (0..n)
            .filter(|&i| indegree[i] > 0)
            .map(|i| node_names[i].as_str())
            .collect();
        return Err(FlowGraphError::Configuration(format!(
            "graph contains a cycle through: {}; annotate intentional feedback \
             with back_edge_inputs",
            stuck.join(", ")
        )));
    }
    Ok(())
}

fn make_setup(
    node: &NodeConfig,
    contract: &CalculatorContract,
    handlers: &HandlerRegistry,
) -> Result<NodeSetup> {
    let (handler, handler_options) = match &node.input_stream_handler {
        Some(config) => (config.handler.clone(), config.options.clone()),
        None => (
            contract
                .input_stream_handler()
                .unwrap_or("DefaultInputStreamHandler")
                .to_string(),
            None,
        ),
    };
    if !handlers.contains(&handler) {
        return Err(FlowGraphError::NotFound(format!(
            "input stream handler '{handler}' is not registered"
        )));
    }
    Ok(NodeSetup {
        kind: node.calculator.clone(),
        options: node.options.clone(),
        handler,
        handler_options,
        input_side_packets: node
            .input_side_packets
            .iter()
            .map(|(local, global)| (local.clone(), global.clone()))
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgraph_core::calculator::{Calculator, CalculatorContext};

    struct Relay;

    impl Calculator for Relay {
        fn process(&mut self, cc: &mut CalculatorContext) -> Result<()> {
            if !cc.input(0).is_empty() {
                let packet = cc.input(0).clone();
                cc.output(0).add_packet(packet)?;
            }
            Ok(())
        }
    }

    fn test_registry() -> CalculatorRegistry {
        let mut registry = CalculatorRegistry::new();
        registry.register(
            "test::relay",
            |contract| {
                contract.expect_arity(1, 1)?;
                contract.input_mut(0).set_any();
                contract.output_mut(0).set_same_as(EdgeRef::Input(0));
                Ok(())
            },
            |_| Ok(Box::new(Relay) as Box<dyn Calculator>),
        );
        registry.register(
            "test::typed_sink",
            |contract| {
                contract.expect_arity(1, 0)?;
                contract.input_mut(0).set::<i64>();
                Ok(())
            },
            |_| Ok(Box::new(Relay) as Box<dyn Calculator>),
        );
        registry
    }

    fn build(json: &str) -> Result<BuiltGraph> {
        let config = GraphConfig::from_json(json).unwrap();
        build_graph(&config, &test_registry(), &HandlerRegistry::with_builtins())
    }

    #[test]
    fn test_builds_linear_graph() {
        let built = build(
            r#"{
                "input_streams": ["in"],
                "nodes": [
                    { "calculator": "test::relay", "input_streams": ["in"],
                      "output_streams": ["mid"] },
                    { "calculator": "test::typed_sink", "input_streams": ["mid"] }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(built.nodes.len(), 2);
        assert_eq!(built.graph_inputs.len(), 1);
        // The sink's i64 requirement flows back through the relay's SameAs
        // link to the graph input.
        let mut ty = PacketType::default();
        ty.set::<i64>();
        assert_eq!(*built.graph_inputs[0].output.packet_type(), ty);
        // One mirror per consumer.
        assert_eq!(built.graph_inputs[0].output.num_mirrors(), 1);
        assert_eq!(built.nodes[0].output_streams()[0].num_mirrors(), 1);
    }

    #[test]
    fn test_rejects_unproduced_stream() {
        let err = build(
            r#"{ "nodes": [
                { "calculator": "test::relay", "input_streams": ["ghost"],
                  "output_streams": ["out"] }
            ]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, FlowGraphError::Configuration(_)));
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_rejects_duplicate_producer() {
        let err = build(
            r#"{
                "input_streams": ["in", "in2"],
                "nodes": [
                    { "calculator": "test::relay", "input_streams": ["in"],
                      "output_streams": ["dup"] },
                    { "calculator": "test::relay", "input_streams": ["in2"],
                      "output_streams": ["dup"] }
                ]
            }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("produced more than once"));
    }

    #[test]
    fn test_rejects_source_node() {
        let err = build(
            r#"{ "nodes": [
                { "calculator": "test::relay", "output_streams": ["out"] }
            ]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("source nodes are not supported"));
    }

    #[test]
    fn test_rejects_cycle_without_back_edge() {
        let err = build(
            r#"{
                "input_streams": ["in"],
                "nodes": [
                    { "calculator": "test::relay", "input_streams": ["b"],
                      "output_streams": ["a"] },
                    { "calculator": "test::relay", "input_streams": ["a"],
                      "output_streams": ["b"] }
                ]
            }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_accepts_declared_back_edge() {
        let built = build(
            r#"{
                "input_streams": ["in", "seed"],
                "nodes": [
                    { "calculator": "test::relay", "input_streams": ["loop"],
                      "output_streams": ["fwd"],
                      "back_edge_inputs": ["loop"] },
                    { "calculator": "test::relay", "input_streams": ["fwd"],
                      "output_streams": ["loop"] }
                ]
            }"#,
        );
        assert!(built.is_ok());
    }

    #[test]
    fn test_external_side_packets_are_tracked() {
        let mut registry = test_registry();
        registry.register(
            "test::gated",
            |contract| {
                contract.expect_arity(1, 0)?;
                contract.input_mut(0).set_any();
                contract.declare_input_side_packet::<String>("label");
                Ok(())
            },
            |_| Ok(Box::new(Relay) as Box<dyn Calculator>),
        );
        let config = GraphConfig::from_json(
            r#"{
                "input_streams": ["in"],
                "nodes": [
                    { "calculator": "test::gated", "input_streams": ["in"],
                      "input_side_packets": { "label": "run_label" } }
                ]
            }"#,
        )
        .unwrap();
        let built =
            build_graph(&config, &registry, &HandlerRegistry::with_builtins()).unwrap();
        assert_eq!(built.required_external_side_packets, vec!["run_label"]);
        assert!(built.side_packets.contains_key("run_label"));
    }

    #[test]
    fn test_unknown_calculator_fails() {
        let err = build(
            r#"{
                "input_streams": ["in"],
                "nodes": [
                    { "calculator": "test::missing", "input_streams": ["in"] }
                ]
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, FlowGraphError::NotFound(_)));
    }
}
