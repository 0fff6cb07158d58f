// SPDX-FileCopyrightText: © 2025 FlowGraph Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The graph driver.
//!
//! [`CalculatorGraph`] owns the whole runtime: it validates and wires a
//! configuration, instantiates calculators and handlers per run, feeds graph
//! input streams (with optional backpressure), dispatches node tasks through
//! the worker pool, delivers observed output packets, and surfaces the first
//! error of a run to every waiting caller.
//!
//! A graph can run multiple times: `wait_until_done` tears the run down and
//! `start_run` rebuilds per-run state on the wiring that `initialize`
//! produced.

use crate::config::{GraphConfig, GraphInputStreamAddMode};
use crate::graph_builder::{build_graph, BuiltGraph};
use crate::handlers::HandlerRegistry;
use crate::input_stream::InputStreamManager;
use crate::output_stream::MirrorTarget;
use crate::scheduler::{Scheduler, Task};
use flowgraph_core::error::{FlowGraphError, Result};
use flowgraph_core::packet::Packet;
use flowgraph_core::packet_type::PacketType;
use flowgraph_core::registry::CalculatorRegistry;
use flowgraph_core::timestamp::Timestamp;
use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info};

/// Invoked once per run with the first error, as soon as it is recorded.
pub type ErrorCallback = Arc<dyn Fn(&FlowGraphError) + Send + Sync>;

enum ObserverSink {
    Callback(Box<dyn Fn(&Packet) + Send + Sync>),
    Poller(crossbeam_channel::Sender<Packet>),
}

struct Observer {
    input: Arc<InputStreamManager>,
    sink: ObserverSink,
    /// Serializes delivery so observed packets keep their timestamp order
    /// even when several workers drain the same observer.
    delivery: Mutex<()>,
}

struct Topology {
    built: BuiltGraph,
    observers: Vec<Observer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Uninitialized,
    Idle,
    Running,
}

struct RunState {
    phase: Phase,
    error: Option<FlowGraphError>,
    /// Nodes not yet closed in the current run.
    remaining: usize,
    num_threads: usize,
    max_queue_size: usize,
    add_mode: GraphInputStreamAddMode,
}

struct GraphInner {
    calc_registry: CalculatorRegistry,
    handler_registry: HandlerRegistry,
    topology: RwLock<Option<Topology>>,
    scheduler: Scheduler,
    state: Mutex<RunState>,
    done_cv: Condvar,
    not_full_cv: Condvar,
    error_callback: Mutex<Option<ErrorCallback>>,
    initial_side_packets: Mutex<IndexMap<String, Packet>>,
}

/// Reads packets from an observed output stream. Packets arrive in timestamp
/// order; the channel never drops.
pub struct OutputStreamPoller {
    receiver: crossbeam_channel::Receiver<Packet>,
}

impl OutputStreamPoller {
    /// A packet if one is already buffered.
    pub fn try_next(&self) -> Option<Packet> {
        self.receiver.try_recv().ok()
    }

    /// Blocks up to `timeout` for the next packet.
    pub fn next_timeout(&self, timeout: Duration) -> Option<Packet> {
        self.receiver.recv_timeout(timeout).ok()
    }
}

/// A runnable dataflow graph.
pub struct CalculatorGraph {
    inner: Arc<GraphInner>,
}

impl CalculatorGraph {
    pub fn new(calc_registry: CalculatorRegistry) -> Self {
        Self::with_registries(calc_registry, HandlerRegistry::with_builtins())
    }

    pub fn with_registries(
        calc_registry: CalculatorRegistry,
        handler_registry: HandlerRegistry,
    ) -> Self {
        Self {
            inner: Arc::new(GraphInner {
                calc_registry,
                handler_registry,
                topology: RwLock::new(None),
                scheduler: Scheduler::new(),
                state: Mutex::new(RunState {
                    phase: Phase::Uninitialized,
                    error: None,
                    remaining: 0,
                    num_threads: 0,
                    max_queue_size: 0,
                    add_mode: GraphInputStreamAddMode::default(),
                }),
                done_cv: Condvar::new(),
                not_full_cv: Condvar::new(),
                error_callback: Mutex::new(None),
                initial_side_packets: Mutex::new(IndexMap::new()),
            }),
        }
    }

    /// Registers a callback invoked with the first error of a run. Must be
    /// called before `initialize`.
    ///
    /// # Errors
    ///
    /// `FailedPrecondition` once the graph is initialized.
    pub fn set_error_callback(&self, callback: ErrorCallback) -> Result<()> {
        if self.inner.state.lock().phase != Phase::Uninitialized {
            return Err(FlowGraphError::FailedPrecondition(
                "the error callback must be set before initialize".to_string(),
            ));
        }
        *self.inner.error_callback.lock() = Some(callback);
        Ok(())
    }

    /// Validates `config`, wires the graph, and stores `side_packets` for
    /// every run. Every side packet the graph consumes but no node produces
    /// must be supplied here.
    pub fn initialize(
        &self,
        config: &GraphConfig,
        side_packets: IndexMap<String, Packet>,
    ) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.phase != Phase::Uninitialized {
            return Err(FlowGraphError::FailedPrecondition(
                "the graph is already initialized".to_string(),
            ));
        }
        let built = build_graph(config, &self.inner.calc_registry, &self.inner.handler_registry)?;
        for required in &built.required_external_side_packets {
            if !side_packets.contains_key(required) {
                return Err(FlowGraphError::Configuration(format!(
                    "side packet '{required}' is consumed but neither produced by a \
                     node nor supplied to initialize"
                )));
            }
        }
        state.num_threads = if config.num_threads == 0 {
            std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        } else {
            config.num_threads
        };
        state.max_queue_size = config.max_queue_size;
        state.add_mode = config.input_stream_add_mode;
        state.phase = Phase::Idle;
        drop(state);
        *self.inner.initial_side_packets.lock() = side_packets;
        *self.inner.topology.write() = Some(Topology { built, observers: Vec::new() });
        Ok(())
    }

    /// Registers a callback invoked for every packet on `stream`, from worker
    /// threads, in timestamp order. Call between `initialize` and
    /// `start_run`.
    pub fn observe_output_stream<F>(&self, stream: &str, callback: F) -> Result<()>
    where
        F: Fn(&Packet) + Send + Sync + 'static,
    {
        self.add_observer(stream, ObserverSink::Callback(Box::new(callback)))
    }

    /// Returns a poller buffering every packet on `stream`. Call between
    /// `initialize` and `start_run`.
    pub fn add_output_stream_poller(&self, stream: &str) -> Result<OutputStreamPoller> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        self.add_observer(stream, ObserverSink::Poller(sender))?;
        Ok(OutputStreamPoller { receiver })
    }

    fn add_observer(&self, stream: &str, sink: ObserverSink) -> Result<()> {
        if self.inner.state.lock().phase == Phase::Running {
            return Err(FlowGraphError::FailedPrecondition(
                "observers must be added before start_run".to_string(),
            ));
        }
        let mut topology = self.inner.topology.write();
        let Some(topology) = topology.as_mut() else {
            return Err(FlowGraphError::FailedPrecondition(
                "the graph is not initialized".to_string(),
            ));
        };
        let osm = topology.built.streams.get(stream).ok_or_else(|| {
            FlowGraphError::NotFound(format!("output stream '{stream}' does not exist"))
        })?;
        let input =
            Arc::new(InputStreamManager::new(Arc::from(stream), PacketType::Any, 0));
        osm.add_mirror(MirrorTarget::GraphOutput(topology.observers.len()), Arc::clone(&input));
        topology.observers.push(Observer { input, sink, delivery: Mutex::new(()) });
        Ok(())
    }

    /// Starts a run: instantiates every node's calculator and handler,
    /// delivers side packets, and begins scheduling.
    ///
    /// # Errors
    ///
    /// `FailedPrecondition` if the graph is uninitialized, already running,
    /// or a previous run failed. A failed graph must be rebuilt.
    pub fn start_run(&self) -> Result<()> {
        let topology = self.inner.topology.read();
        let Some(topology) = topology.as_ref() else {
            return Err(FlowGraphError::FailedPrecondition(
                "the graph is not initialized".to_string(),
            ));
        };
        let (num_threads, max_queue_size) = {
            let mut state = self.inner.state.lock();
            if state.phase == Phase::Running {
                return Err(FlowGraphError::FailedPrecondition(
                    "the graph is already running".to_string(),
                ));
            }
            if state.error.is_some() {
                return Err(FlowGraphError::FailedPrecondition(
                    "the previous run failed; the graph must be rebuilt".to_string(),
                ));
            }
            state.remaining = topology.built.nodes.len();
            state.phase = Phase::Running;
            (state.num_threads, state.max_queue_size)
        };

        let built = &topology.built;
        for input in &built.graph_inputs {
            input.output.prepare_for_run();
        }
        for node in &built.nodes {
            for stream in node.input_streams() {
                stream.prepare_for_run();
            }
            for stream in node.output_streams() {
                stream.prepare_for_run();
            }
        }
        for observer in &topology.observers {
            observer.input.prepare_for_run();
        }
        for slot in built.side_packets.values() {
            slot.reset();
        }

        // Backpressure wiring: graph input consumers get the queue limit and
        // wake blocked feeders when they drain.
        let weak = Arc::downgrade(&self.inner);
        for input in &built.graph_inputs {
            for node in &built.nodes {
                for stream in node.input_streams() {
                    if stream.name() == input.name {
                        stream.set_max_queue_size(max_queue_size);
                        let weak = Weak::clone(&weak);
                        stream.set_queue_size_callbacks(
                            None,
                            Some(Arc::new(move || {
                                if let Some(inner) = weak.upgrade() {
                                    let _state = inner.state.lock();
                                    inner.not_full_cv.notify_all();
                                }
                            })),
                        );
                    }
                }
            }
        }

        // Fresh calculator and handler instances for this run.
        for (node, setup) in built.nodes.iter().zip(&built.setups) {
            let calculator =
                self.inner.calc_registry.create(&setup.kind, setup.options.as_ref())?;
            let handler = self.inner.handler_registry.create(
                &setup.handler,
                node.input_streams().to_vec(),
                setup.handler_options.as_ref(),
            )?;
            let local_names: Vec<String> =
                setup.input_side_packets.iter().map(|(local, _)| local.clone()).collect();
            node.prepare_for_run(calculator, handler, &local_names);
        }

        // Externally supplied side packets land before anything runs.
        let initial = self.inner.initial_side_packets.lock().clone();
        for (name, packet) in initial {
            if let Some(slot) = built.side_packets.get(&name) {
                for mirror in slot.set(packet.clone())? {
                    built.nodes[mirror.node]
                        .supply_input_side_packet(&mirror.local_name, packet.clone());
                }
            }
        }

        let runner = {
            let weak = Arc::downgrade(&self.inner);
            Arc::new(move |task| {
                if let Some(inner) = weak.upgrade() {
                    inner.dispatch(task);
                }
            })
        };
        self.inner.scheduler.start(num_threads, runner);
        info!(nodes = built.nodes.len(), num_threads, "run started");

        for node in &built.nodes {
            if node.try_schedule() {
                self.inner.scheduler.submit(Task::Node(node.index()));
            }
        }
        Ok(())
    }

    /// Adds one packet to a graph input stream. With the default add mode the
    /// call blocks while any consumer queue of that stream is full.
    pub fn add_packet_to_input_stream(&self, stream: &str, packet: Packet) -> Result<()> {
        let inner = &self.inner;
        let topology = inner.topology.read();
        let built = Self::running_built(&topology, inner)?;
        let input = built
            .graph_inputs
            .iter()
            .find(|g| g.name == stream)
            .ok_or_else(|| {
                FlowGraphError::NotFound(format!("graph input stream '{stream}' does not exist"))
            })?;

        let throttled = {
            let state = inner.state.lock();
            state.add_mode == GraphInputStreamAddMode::WaitUntilNotFull
        };
        if throttled {
            let consumers: Vec<Arc<InputStreamManager>> = built
                .nodes
                .iter()
                .flat_map(|n| n.input_streams().iter().cloned())
                .filter(|s| s.name() == stream)
                .collect();
            let mut state = inner.state.lock();
            while state.error.is_none()
                && state.phase == Phase::Running
                && consumers.iter().any(|c| c.is_full())
            {
                inner.not_full_cv.wait(&mut state);
            }
            if let Some(err) = &state.error {
                return Err(err.clone());
            }
        }

        let mut shard = input.output.make_shard();
        shard.add_packet(packet)?;
        let notified = input.output.propagate_updates(&mut shard)?;
        inner.fan_out(&topology, notified);
        Ok(())
    }

    /// Advances a graph input stream's bound without sending a packet.
    pub fn set_input_stream_timestamp_bound(&self, stream: &str, bound: Timestamp) -> Result<()> {
        let inner = &self.inner;
        let topology = inner.topology.read();
        let built = Self::running_built(&topology, inner)?;
        let input = built
            .graph_inputs
            .iter()
            .find(|g| g.name == stream)
            .ok_or_else(|| {
                FlowGraphError::NotFound(format!("graph input stream '{stream}' does not exist"))
            })?;
        let notified = input.output.propagate_timestamp_bound(bound)?;
        inner.fan_out(&topology, notified);
        Ok(())
    }

    /// Updates the consumer queue limit for one graph input stream.
    pub fn set_input_stream_max_queue_size(&self, stream: &str, max_queue_size: usize) -> Result<()> {
        let topology = self.inner.topology.read();
        let built = Self::running_built(&topology, &self.inner)?;
        let mut found = false;
        for node in &built.nodes {
            for s in node.input_streams() {
                if s.name() == stream {
                    s.set_max_queue_size(max_queue_size);
                    found = true;
                }
            }
        }
        if found {
            let _state = self.inner.state.lock();
            self.inner.not_full_cv.notify_all();
            Ok(())
        } else {
            Err(FlowGraphError::NotFound(format!(
                "graph input stream '{stream}' has no consumers"
            )))
        }
    }

    /// Closes one graph input stream; its consumers observe a terminal bound.
    pub fn close_input_stream(&self, stream: &str) -> Result<()> {
        let inner = &self.inner;
        let topology = inner.topology.read();
        let built = Self::running_built(&topology, inner)?;
        let input = built
            .graph_inputs
            .iter()
            .find(|g| g.name == stream)
            .ok_or_else(|| {
                FlowGraphError::NotFound(format!("graph input stream '{stream}' does not exist"))
            })?;
        let notified = input.output.close()?;
        inner.fan_out(&topology, notified);
        Ok(())
    }

    /// Closes every graph input stream. The run then drains and finishes.
    pub fn close_all_input_streams(&self) -> Result<()> {
        let inner = &self.inner;
        let topology = inner.topology.read();
        let built = Self::running_built(&topology, inner)?;
        for input in &built.graph_inputs {
            let notified = input.output.close()?;
            inner.fan_out(&topology, notified);
        }
        Ok(())
    }

    /// Alias of [`Self::close_all_input_streams`]; the graph has no other
    /// packet sources.
    pub fn close_all_packet_sources(&self) -> Result<()> {
        self.close_all_input_streams()
    }

    /// Blocks until no task is queued or running, then reports the run's
    /// error state. Input streams stay open.
    pub fn wait_until_idle(&self) -> Result<()> {
        self.inner.scheduler.wait_until_idle();
        let state = self.inner.state.lock();
        state.error.as_ref().map_or(Ok(()), |e| Err(e.clone()))
    }

    /// Blocks until every node has closed (or the run failed), then tears the
    /// run down. The graph can start another run afterwards.
    pub fn wait_until_done(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            while state.phase == Phase::Running && state.remaining > 0 && state.error.is_none() {
                self.inner.done_cv.wait(&mut state);
            }
        }
        // Let in-flight observer deliveries and node teardown finish.
        self.inner.scheduler.wait_until_idle();
        self.inner.scheduler.shutdown();

        let mut state = self.inner.state.lock();
        state.phase = Phase::Idle;
        let result = state.error.as_ref().map_or(Ok(()), |e| Err(e.clone()));
        drop(state);
        if result.is_err() {
            if let Some(topology) = self.inner.topology.read().as_ref() {
                for node in &topology.built.nodes {
                    node.cleanup();
                }
            }
        }
        debug!(ok = result.is_ok(), "run finished");
        result
    }

    pub fn has_error(&self) -> bool {
        self.inner.state.lock().error.is_some()
    }

    fn running_built<'a>(
        topology: &'a parking_lot::RwLockReadGuard<'_, Option<Topology>>,
        inner: &GraphInner,
    ) -> Result<&'a BuiltGraph> {
        let Some(topology) = topology.as_ref() else {
            return Err(FlowGraphError::FailedPrecondition(
                "the graph is not initialized".to_string(),
            ));
        };
        if inner.state.lock().phase != Phase::Running {
            return Err(FlowGraphError::FailedPrecondition(
                "the graph is not running".to_string(),
            ));
        }
        Ok(&topology.built)
    }
}

impl GraphInner {
    fn dispatch(self: &Arc<Self>, task: Task) {
        let topology = self.topology.read();
        let Some(topology) = topology.as_ref() else { return };
        if self.state.lock().error.is_some() {
            return;
        }
        match task {
            Task::Node(index) => {
                let node = &topology.built.nodes[index];
                let outcome = node.run_task();

                for (mirror, packet) in outcome.side_packet_deliveries {
                    let consumer = &topology.built.nodes[mirror.node];
                    if consumer.supply_input_side_packet(&mirror.local_name, packet)
                        && consumer.try_schedule()
                    {
                        self.scheduler.submit(Task::Node(consumer.index()));
                    }
                }
                self.fan_out_targets(topology, outcome.notify);

                if let Some(err) = outcome.error {
                    self.record_error(err);
                }
                if outcome.closed {
                    let mut state = self.state.lock();
                    state.remaining = state.remaining.saturating_sub(1);
                    if state.remaining == 0 {
                        self.done_cv.notify_all();
                    }
                }
            },
            Task::GraphOutput(index) => {
                let observer = &topology.observers[index];
                let _delivery = observer.delivery.lock();
                while let Some(packet) = observer.input.pop_queue_head() {
                    match &observer.sink {
                        ObserverSink::Callback(cb) => cb(&packet),
                        ObserverSink::Poller(sender) => {
                            let _ = sender.send(packet);
                        },
                    }
                }
            },
        }
    }

    fn fan_out(
        &self,
        topology: &parking_lot::RwLockReadGuard<'_, Option<Topology>>,
        targets: Vec<MirrorTarget>,
    ) {
        if let Some(topology) = topology.as_ref() {
            self.fan_out_targets(topology, targets);
        }
    }

    fn fan_out_targets(&self, topology: &Topology, targets: Vec<MirrorTarget>) {
        for target in targets {
            match target {
                MirrorTarget::Node(index) => {
                    let node = &topology.built.nodes[index];
                    if node.try_schedule() {
                        self.scheduler.submit(Task::Node(index));
                    }
                },
                MirrorTarget::GraphOutput(index) => {
                    self.scheduler.submit(Task::GraphOutput(index));
                },
            }
        }
    }

    fn record_error(&self, err: FlowGraphError) {
        let callback = {
            let mut state = self.state.lock();
            if state.error.is_some() {
                debug!(%err, "suppressing error recorded after the first");
                return;
            }
            error!(%err, "run failed");
            state.error = Some(err.clone());
            self.done_cv.notify_all();
            self.not_full_cv.notify_all();
            self.error_callback.lock().clone()
        };
        if let Some(callback) = callback {
            callback(&err);
        }
    }
}

impl std::fmt::Debug for CalculatorGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("CalculatorGraph")
            .field("phase", &state.phase)
            .field("has_error", &state.error.is_some())
            .finish_non_exhaustive()
    }
}
