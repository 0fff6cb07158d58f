// SPDX-FileCopyrightText: © 2025 FlowGraph Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! End-to-end graph runs: feeding, synchronization, observation, teardown.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use flowgraph_calculators::register_builtins;
use flowgraph_core::calculator::{Calculator, CalculatorContext};
use flowgraph_core::error::{FlowGraphError, Result};
use flowgraph_core::packet::Packet;
use flowgraph_core::registry::CalculatorRegistry;
use flowgraph_core::timestamp::{Timestamp, TimestampDiff};
use flowgraph_engine::config::GraphConfig;
use flowgraph_engine::graph::CalculatorGraph;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Sums whatever `i64` packets arrived at the invocation timestamp.
struct Sum;

impl Calculator for Sum {
    fn open(&mut self, cc: &mut CalculatorContext) -> Result<()> {
        cc.output(0).set_offset(TimestampDiff::ZERO)
    }

    fn process(&mut self, cc: &mut CalculatorContext) -> Result<()> {
        let mut total = 0i64;
        for i in 0..cc.inputs.len() {
            if !cc.input(i).is_empty() {
                total += *cc.input(i).get::<i64>()?;
            }
        }
        let ts = cc.input_timestamp;
        cc.output(0).add_packet(Packet::new(total).at(ts))
    }
}

fn test_registry() -> CalculatorRegistry {
    let mut registry = CalculatorRegistry::new();
    register_builtins(&mut registry);
    registry.register(
        "test::sum",
        |contract| {
            contract.expect_arity(2, 1)?;
            contract.input_mut(0).set::<i64>();
            contract.input_mut(1).set::<i64>();
            contract.output_mut(0).set::<i64>();
            Ok(())
        },
        |_| Ok(Box::new(Sum) as Box<dyn Calculator>),
    );
    registry
}

fn pkt(v: i64, ts: i64) -> Packet {
    Packet::new(v).at(Timestamp::new(ts))
}

#[test]
fn test_linear_pipeline_delivers_in_order() {
    init_tracing();
    let graph = CalculatorGraph::new(test_registry());
    let config = GraphConfig::from_json(
        r#"{
            "input_streams": ["in"],
            "num_threads": 2,
            "nodes": [
                { "calculator": "core::add_constant", "name": "adder",
                  "input_streams": ["in"], "output_streams": ["plus_one"],
                  "options": { "value": 1 } },
                { "calculator": "core::pass_through", "name": "relay",
                  "input_streams": ["plus_one"], "output_streams": ["out"] }
            ]
        }"#,
    )
    .unwrap();
    graph.initialize(&config, IndexMap::new()).unwrap();
    let poller = graph.add_output_stream_poller("out").unwrap();
    graph.start_run().unwrap();

    for t in 1..=5 {
        graph.add_packet_to_input_stream("in", pkt(t * 10, t)).unwrap();
    }
    graph.close_all_input_streams().unwrap();
    graph.wait_until_done().unwrap();

    let mut got = Vec::new();
    while let Some(p) = poller.try_next() {
        got.push((*p.get::<i64>().unwrap(), p.timestamp()));
    }
    let expected: Vec<(i64, Timestamp)> =
        (1..=5).map(|t| (t * 10 + 1, Timestamp::new(t))).collect();
    assert_eq!(got, expected);
}

/// A packet becomes processable once every other input stream's bound passes
/// its timestamp, without any packet arriving there.
#[test]
fn test_bound_advance_unblocks_lock_step() {
    init_tracing();
    let graph = CalculatorGraph::new(test_registry());
    let config = GraphConfig::from_json(
        r#"{
            "input_streams": ["a", "b"],
            "nodes": [
                { "calculator": "core::pass_through", "name": "relay",
                  "input_streams": ["a"], "output_streams": ["a_relayed"] },
                { "calculator": "test::sum", "name": "sum",
                  "input_streams": ["a_relayed", "b"], "output_streams": ["out"] }
            ]
        }"#,
    )
    .unwrap();
    graph.initialize(&config, IndexMap::new()).unwrap();
    let results = Arc::new(Mutex::new(Vec::new()));
    {
        let results = Arc::clone(&results);
        graph
            .observe_output_stream("out", move |p| {
                results.lock().push((*p.get::<i64>().unwrap(), p.timestamp()));
            })
            .unwrap();
    }
    graph.start_run().unwrap();

    graph.add_packet_to_input_stream("a", pkt(7, 1)).unwrap();
    graph.wait_until_idle().unwrap();
    // b has made no promise yet; the sum node must not have fired.
    assert!(results.lock().is_empty());

    // Advancing b's bound past t=1 settles the packet, even though b stays
    // empty. The relay's zero offset carries the guarantee through.
    graph.set_input_stream_timestamp_bound("b", Timestamp::new(2)).unwrap();
    graph.wait_until_idle().unwrap();
    assert_eq!(*results.lock(), vec![(7, Timestamp::new(1))]);

    graph.close_all_input_streams().unwrap();
    graph.wait_until_done().unwrap();
}

#[test]
fn test_mux_selects_per_control_packet() {
    init_tracing();
    let graph = CalculatorGraph::new(test_registry());
    let config = GraphConfig::from_json(
        r#"{
            "input_streams": ["d0", "d1", "select"],
            "nodes": [
                { "calculator": "core::mux", "name": "mux",
                  "input_streams": ["d0", "d1", "select"],
                  "output_streams": ["out"] }
            ]
        }"#,
    )
    .unwrap();
    graph.initialize(&config, IndexMap::new()).unwrap();
    let poller = graph.add_output_stream_poller("out").unwrap();
    graph.start_run().unwrap();

    graph.add_packet_to_input_stream("d0", pkt(100, 1)).unwrap();
    graph.add_packet_to_input_stream("d1", pkt(200, 1)).unwrap();
    graph.add_packet_to_input_stream("select", pkt(1, 1)).unwrap();
    graph.add_packet_to_input_stream("d0", pkt(101, 2)).unwrap();
    graph.add_packet_to_input_stream("select", pkt(0, 2)).unwrap();
    graph.close_all_input_streams().unwrap();
    graph.wait_until_done().unwrap();

    let first = poller.try_next().unwrap();
    assert_eq!(*first.get::<i64>().unwrap(), 200);
    assert_eq!(first.timestamp(), Timestamp::new(1));
    let second = poller.try_next().unwrap();
    assert_eq!(*second.get::<i64>().unwrap(), 101);
    assert!(poller.try_next().is_none());
}

#[test]
fn test_calculator_error_fails_the_run() {
    init_tracing();
    struct Failing;
    impl Calculator for Failing {
        fn process(&mut self, cc: &mut CalculatorContext) -> Result<()> {
            Err(FlowGraphError::Calculator(format!(
                "cannot handle packet at {}",
                cc.input_timestamp
            )))
        }
    }
    let mut registry = test_registry();
    registry.register(
        "test::failing",
        |contract| {
            contract.expect_arity(1, 0)?;
            contract.input_mut(0).set::<i64>();
            Ok(())
        },
        |_| Ok(Box::new(Failing) as Box<dyn Calculator>),
    );

    let graph = CalculatorGraph::new(registry);
    let reported = Arc::new(Mutex::new(None));
    {
        let reported = Arc::clone(&reported);
        graph
            .set_error_callback(Arc::new(move |err| {
                *reported.lock() = Some(err.clone());
            }))
            .unwrap();
    }
    let config = GraphConfig::from_json(
        r#"{
            "input_streams": ["in"],
            "nodes": [
                { "calculator": "test::failing", "name": "sink",
                  "input_streams": ["in"] }
            ]
        }"#,
    )
    .unwrap();
    graph.initialize(&config, IndexMap::new()).unwrap();
    graph.start_run().unwrap();

    graph.add_packet_to_input_stream("in", pkt(1, 1)).unwrap();
    let err = graph.wait_until_done().unwrap_err();
    assert!(matches!(err, FlowGraphError::Calculator(_)));
    assert!(err.to_string().contains("sink"));
    assert!(graph.has_error());
    assert!(matches!(*reported.lock(), Some(FlowGraphError::Calculator(_))));

    // The run is over; feeding more input is a precondition failure.
    assert!(graph.add_packet_to_input_stream("in", pkt(2, 2)).is_err());
}

/// A batching node whose batch exceeds its in-flight limit still drains the
/// batch across scheduling rounds and the run terminates.
#[test]
fn test_batching_completes_with_default_in_flight_limit() {
    init_tracing();
    let graph = CalculatorGraph::new(test_registry());
    let config = GraphConfig::from_json(
        r#"{
            "input_streams": ["in"],
            "nodes": [
                { "calculator": "core::pass_through", "name": "batcher",
                  "input_streams": ["in"], "output_streams": ["out"],
                  "input_stream_handler": {
                      "handler": "DefaultInputStreamHandler",
                      "options": { "batch_size": 2 }
                  } }
            ]
        }"#,
    )
    .unwrap();
    graph.initialize(&config, IndexMap::new()).unwrap();
    let poller = graph.add_output_stream_poller("out").unwrap();
    graph.start_run().unwrap();

    for t in 1..=5 {
        graph.add_packet_to_input_stream("in", pkt(t, t)).unwrap();
    }
    // The last batch stays partial and only flushes when the input closes.
    graph.close_all_input_streams().unwrap();
    graph.wait_until_done().unwrap();

    let mut got = Vec::new();
    while let Some(p) = poller.try_next() {
        got.push(*p.get::<i64>().unwrap());
    }
    assert_eq!(got, vec![1, 2, 3, 4, 5]);
}

/// Side packets produced in one node's Open gate another node's Open.
#[test]
fn test_side_packets_flow_between_nodes() {
    init_tracing();
    struct TokenSource;
    impl Calculator for TokenSource {
        fn open(&mut self, cc: &mut CalculatorContext) -> Result<()> {
            cc.set_output_side_packet("token", Packet::new("t-42".to_string()))
        }
        fn process(&mut self, cc: &mut CalculatorContext) -> Result<()> {
            if !cc.input(0).is_empty() {
                let packet = cc.input(0).clone();
                cc.output(0).add_packet(packet)?;
            }
            Ok(())
        }
    }
    struct Tagger;
    impl Calculator for Tagger {
        fn open(&mut self, cc: &mut CalculatorContext) -> Result<()> {
            cc.output(0).set_offset(TimestampDiff::ZERO)
        }
        fn process(&mut self, cc: &mut CalculatorContext) -> Result<()> {
            if cc.input(0).is_empty() {
                return Ok(());
            }
            let token = cc
                .input_side_packet("token")
                .ok_or_else(|| FlowGraphError::Calculator("token missing".to_string()))?
                .get::<String>()?
                .clone();
            let prefix = cc.input_side_packet("prefix").map_or_else(
                || Ok(String::new()),
                |p| p.get::<String>().cloned(),
            )?;
            let v = *cc.input(0).get::<i64>()?;
            let ts = cc.input_timestamp;
            cc.output(0).add_packet(Packet::new(format!("{prefix}{token}:{v}")).at(ts))
        }
    }

    let mut registry = test_registry();
    registry.register(
        "test::token_source",
        |contract| {
            contract.expect_arity(1, 1)?;
            contract.input_mut(0).set::<i64>();
            contract.output_mut(0).set::<i64>();
            contract.declare_output_side_packet::<String>("token");
            Ok(())
        },
        |_| Ok(Box::new(TokenSource) as Box<dyn Calculator>),
    );
    registry.register(
        "test::tagger",
        |contract| {
            contract.expect_arity(1, 1)?;
            contract.input_mut(0).set::<i64>();
            contract.output_mut(0).set::<String>();
            contract.declare_input_side_packet::<String>("token");
            contract.declare_input_side_packet::<String>("prefix");
            Ok(())
        },
        |_| Ok(Box::new(Tagger) as Box<dyn Calculator>),
    );

    let graph = CalculatorGraph::new(registry);
    let config = GraphConfig::from_json(
        r#"{
            "input_streams": ["in"],
            "nodes": [
                { "calculator": "test::token_source", "name": "source",
                  "input_streams": ["in"], "output_streams": ["mid"],
                  "output_side_packets": { "token": "session_token" } },
                { "calculator": "test::tagger", "name": "tagger",
                  "input_streams": ["mid"], "output_streams": ["out"],
                  "input_side_packets": {
                      "token": "session_token",
                      "prefix": "run_prefix"
                  } }
            ]
        }"#,
    )
    .unwrap();
    let mut side_packets = IndexMap::new();
    side_packets.insert("run_prefix".to_string(), Packet::new("v1/".to_string()));
    graph.initialize(&config, side_packets).unwrap();
    let poller = graph.add_output_stream_poller("out").unwrap();
    graph.start_run().unwrap();

    graph.add_packet_to_input_stream("in", pkt(9, 1)).unwrap();
    graph.close_all_input_streams().unwrap();
    graph.wait_until_done().unwrap();

    let out = poller.try_next().unwrap();
    assert_eq!(out.get::<String>().unwrap(), "v1/t-42:9");
}

/// With the default add mode, feeding blocks on a full consumer queue
/// instead of growing it without limit, and the run still completes.
#[test]
fn test_backpressure_does_not_deadlock() {
    init_tracing();
    struct Slow;
    impl Calculator for Slow {
        fn open(&mut self, cc: &mut CalculatorContext) -> Result<()> {
            cc.output(0).set_offset(TimestampDiff::ZERO)
        }
        fn process(&mut self, cc: &mut CalculatorContext) -> Result<()> {
            std::thread::sleep(Duration::from_millis(2));
            if !cc.input(0).is_empty() {
                let packet = cc.input(0).clone();
                cc.output(0).add_packet(packet)?;
            }
            Ok(())
        }
    }
    let mut registry = test_registry();
    registry.register(
        "test::slow",
        |contract| {
            contract.expect_arity(1, 1)?;
            contract.input_mut(0).set::<i64>();
            contract.output_mut(0).set::<i64>();
            Ok(())
        },
        |_| Ok(Box::new(Slow) as Box<dyn Calculator>),
    );

    let graph = CalculatorGraph::new(registry);
    let config = GraphConfig::from_json(
        r#"{
            "input_streams": ["in"],
            "max_queue_size": 2,
            "num_threads": 2,
            "nodes": [
                { "calculator": "test::slow", "name": "slow",
                  "input_streams": ["in"], "output_streams": ["out"] }
            ]
        }"#,
    )
    .unwrap();
    graph.initialize(&config, IndexMap::new()).unwrap();
    let poller = graph.add_output_stream_poller("out").unwrap();
    graph.start_run().unwrap();

    for t in 1..=50 {
        graph.add_packet_to_input_stream("in", pkt(t, t)).unwrap();
    }
    graph.close_all_input_streams().unwrap();
    graph.wait_until_done().unwrap();

    let mut count = 0;
    while poller.try_next().is_some() {
        count += 1;
    }
    assert_eq!(count, 50);
}

/// A graph initialized once can run several times; per-run state is rebuilt.
#[test]
fn test_graph_runs_twice() {
    init_tracing();
    let graph = CalculatorGraph::new(test_registry());
    let config = GraphConfig::from_json(
        r#"{
            "input_streams": ["in"],
            "nodes": [
                { "calculator": "core::add_constant", "name": "adder",
                  "input_streams": ["in"], "output_streams": ["out"],
                  "options": { "value": 100 } }
            ]
        }"#,
    )
    .unwrap();
    graph.initialize(&config, IndexMap::new()).unwrap();
    let poller = graph.add_output_stream_poller("out").unwrap();

    for run in 0..2 {
        graph.start_run().unwrap();
        graph.add_packet_to_input_stream("in", pkt(run, 1)).unwrap();
        graph.close_all_input_streams().unwrap();
        graph.wait_until_done().unwrap();
        let out = poller.next_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(*out.get::<i64>().unwrap(), run + 100);
        assert!(poller.try_next().is_none());
    }
}

/// A failed run pins the graph: starting another run is refused and the
/// graph must be rebuilt.
#[test]
fn test_failed_run_refuses_restart() {
    init_tracing();
    struct Failing;
    impl Calculator for Failing {
        fn process(&mut self, _cc: &mut CalculatorContext) -> Result<()> {
            Err(FlowGraphError::Calculator("unusable input".to_string()))
        }
    }
    let mut registry = test_registry();
    registry.register(
        "test::failing",
        |contract| {
            contract.expect_arity(1, 0)?;
            contract.input_mut(0).set::<i64>();
            Ok(())
        },
        |_| Ok(Box::new(Failing) as Box<dyn Calculator>),
    );

    let graph = CalculatorGraph::new(registry);
    let config = GraphConfig::from_json(
        r#"{
            "input_streams": ["in"],
            "nodes": [
                { "calculator": "test::failing", "name": "sink",
                  "input_streams": ["in"] }
            ]
        }"#,
    )
    .unwrap();
    graph.initialize(&config, IndexMap::new()).unwrap();
    graph.start_run().unwrap();

    graph.add_packet_to_input_stream("in", pkt(1, 1)).unwrap();
    assert!(graph.wait_until_done().is_err());

    let err = graph.start_run().unwrap_err();
    assert!(matches!(err, FlowGraphError::FailedPrecondition(_)));
    assert!(graph.has_error());
}

/// Timestamps must be strictly increasing per stream; a regression is
/// rejected at the graph input.
#[test]
fn test_rejects_timestamp_regression_at_input() {
    init_tracing();
    let graph = CalculatorGraph::new(test_registry());
    let config = GraphConfig::from_json(
        r#"{
            "input_streams": ["in"],
            "nodes": [
                { "calculator": "core::pass_through", "name": "relay",
                  "input_streams": ["in"], "output_streams": ["out"] }
            ]
        }"#,
    )
    .unwrap();
    graph.initialize(&config, IndexMap::new()).unwrap();
    graph.start_run().unwrap();

    graph.add_packet_to_input_stream("in", pkt(1, 5)).unwrap();
    let err = graph.add_packet_to_input_stream("in", pkt(2, 5)).unwrap_err();
    assert!(matches!(err, FlowGraphError::InvalidArgument(_)));

    graph.close_all_input_streams().unwrap();
    graph.wait_until_done().unwrap();
}
