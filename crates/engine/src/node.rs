// SPDX-FileCopyrightText: © 2025 FlowGraph Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Per-node execution driver.
//!
//! A [`CalculatorNode`] glues one calculator instance to its input stream
//! handler and its output stream managers, and drives the calculator through
//! Open / Process / Close. Scheduling state (readiness, in-flight count) and
//! execution state (the calculator itself) live behind separate locks so
//! producers can poke a node's readiness while its calculator is running.
//!
//! At most one task per node is queued at a time, guarded by the `scheduled`
//! flag; a `dirty` flag set by producers closes the window between a task's
//! last scheduling round and it clearing `scheduled`.

use crate::handlers::{InputStreamHandler, PreparedInvocation};
use crate::input_stream::InputStreamManager;
use crate::output_stream::{MirrorTarget, OutputStreamManager};
use crate::side_packet::{OutputSidePacket, SidePacketMirror};
use flowgraph_core::calculator::{Calculator, CalculatorContext};
use flowgraph_core::error::{FlowGraphError, Result};
use flowgraph_core::packet::Packet;
use flowgraph_core::timestamp::Timestamp;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeStatus {
    Unstarted,
    Running,
    Closed,
}

struct SchedState {
    status: NodeStatus,
    handler: Option<Box<dyn InputStreamHandler>>,
    in_flight: usize,
    scheduled: bool,
    dirty: bool,
    missing_side_packets: usize,
}

struct ExecState {
    calculator: Option<Box<dyn Calculator>>,
    input_side_packets: IndexMap<String, Packet>,
}

/// Everything one finished task tells the graph driver.
#[derive(Default)]
pub struct TaskOutcome {
    /// Consumers whose readiness may have changed.
    pub notify: Vec<MirrorTarget>,
    /// Side packet deliveries to perform: the consumer slot and the value.
    pub side_packet_deliveries: Vec<(SidePacketMirror, Packet)>,
    /// First failure encountered, fatal to the run.
    pub error: Option<FlowGraphError>,
    /// The node closed during this task.
    pub closed: bool,
}

enum Work {
    Open,
    Invocations(Vec<PreparedInvocation>, Timestamp),
    Close,
    Idle,
}

/// One node of a running graph.
pub struct CalculatorNode {
    index: usize,
    name: Arc<str>,
    input_streams: Vec<Arc<InputStreamManager>>,
    output_streams: Vec<Arc<OutputStreamManager>>,
    /// Declared output side packets: local name plus the shared slot.
    output_side_packets: Vec<(Arc<str>, Arc<OutputSidePacket>)>,
    max_in_flight: usize,
    sched: Mutex<SchedState>,
    exec: Mutex<ExecState>,
}

impl CalculatorNode {
    pub fn new(
        index: usize,
        name: Arc<str>,
        input_streams: Vec<Arc<InputStreamManager>>,
        output_streams: Vec<Arc<OutputStreamManager>>,
        output_side_packets: Vec<(Arc<str>, Arc<OutputSidePacket>)>,
        max_in_flight: usize,
    ) -> Self {
        Self {
            index,
            name,
            input_streams,
            output_streams,
            output_side_packets,
            max_in_flight: max_in_flight.max(1),
            sched: Mutex::new(SchedState {
                status: NodeStatus::Unstarted,
                handler: None,
                in_flight: 0,
                scheduled: false,
                dirty: false,
                missing_side_packets: 0,
            }),
            exec: Mutex::new(ExecState { calculator: None, input_side_packets: IndexMap::new() }),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_streams(&self) -> &[Arc<InputStreamManager>] {
        &self.input_streams
    }

    pub fn output_streams(&self) -> &[Arc<OutputStreamManager>] {
        &self.output_streams
    }

    pub fn is_closed(&self) -> bool {
        self.sched.lock().status == NodeStatus::Closed
    }

    /// Installs a fresh calculator and handler for a new run.
    /// `input_side_packet_names` lists the side packets the node waits for.
    pub fn prepare_for_run(
        &self,
        calculator: Box<dyn Calculator>,
        handler: Box<dyn InputStreamHandler>,
        input_side_packet_names: &[String],
    ) {
        {
            let mut sched = self.sched.lock();
            sched.status = NodeStatus::Unstarted;
            sched.handler = Some(handler);
            sched.in_flight = 0;
            sched.scheduled = false;
            sched.dirty = false;
            sched.missing_side_packets = input_side_packet_names.len();
        }
        let mut exec = self.exec.lock();
        exec.calculator = Some(calculator);
        exec.input_side_packets =
            input_side_packet_names.iter().map(|n| (n.clone(), Packet::empty())).collect();
    }

    /// Delivers one input side packet. Returns true if the node just became
    /// eligible to open.
    pub fn supply_input_side_packet(&self, local_name: &str, packet: Packet) -> bool {
        {
            let mut exec = self.exec.lock();
            let Some(slot) = exec.input_side_packets.get_mut(local_name) else {
                return false;
            };
            if !slot.is_empty() {
                return false;
            }
            *slot = packet;
        }
        let mut sched = self.sched.lock();
        sched.missing_side_packets = sched.missing_side_packets.saturating_sub(1);
        sched.missing_side_packets == 0 && sched.status == NodeStatus::Unstarted
    }

    /// Marks the node as needing a scheduling round. Returns true if the
    /// caller should enqueue a task (none is queued or running yet).
    pub fn try_schedule(&self) -> bool {
        let mut sched = self.sched.lock();
        if sched.status == NodeStatus::Closed {
            return false;
        }
        if sched.status == NodeStatus::Unstarted && sched.missing_side_packets > 0 {
            return false;
        }
        sched.dirty = true;
        if sched.scheduled {
            return false;
        }
        sched.scheduled = true;
        true
    }

    /// Runs one task: opens, processes and closes as far as the node's inputs
    /// allow, then clears the `scheduled` flag.
    pub fn run_task(&self) -> TaskOutcome {
        let mut outcome = TaskOutcome::default();
        loop {
            let work = {
                let mut sched = self.sched.lock();
                sched.dirty = false;
                match sched.status {
                    NodeStatus::Unstarted => Work::Open,
                    NodeStatus::Running => {
                        let allowance = self.max_in_flight - sched.in_flight;
                        let Some(handler) = sched.handler.as_mut() else {
                            outcome.error = Some(FlowGraphError::Internal(format!(
                                "node '{}' has no input stream handler installed",
                                self.name
                            )));
                            break;
                        };
                        let mut plan = handler.schedule_invocations(allowance);
                        if let Some(err) = plan.error.take() {
                            outcome.error = Some(err);
                            break;
                        }
                        sched.in_flight += plan.invocations.len();
                        assert!(
                            sched.in_flight <= self.max_in_flight,
                            "node '{}' exceeded its in-flight limit",
                            self.name
                        );
                        if plan.invocations.is_empty() {
                            if plan.ready_for_close && sched.in_flight == 0 {
                                Work::Close
                            } else {
                                Work::Invocations(Vec::new(), plan.input_bound)
                            }
                        } else {
                            Work::Invocations(plan.invocations, plan.input_bound)
                        }
                    },
                    NodeStatus::Closed => Work::Idle,
                }
            };

            match work {
                Work::Open => {
                    if let Err(err) = self.open_node(&mut outcome) {
                        outcome.error = Some(err);
                        break;
                    }
                    self.sched.lock().status = NodeStatus::Running;
                },
                Work::Invocations(invocations, input_bound) => {
                    let had_invocations = !invocations.is_empty();
                    for invocation in invocations {
                        let result = self.process_invocation(invocation, &mut outcome);
                        self.sched.lock().in_flight -= 1;
                        if let Err(err) = result {
                            outcome.error = Some(err);
                            break;
                        }
                    }
                    if outcome.error.is_some() {
                        break;
                    }
                    if input_bound != Timestamp::UNSET {
                        if let Err(err) = self.propagate_input_bound(input_bound, &mut outcome) {
                            outcome.error = Some(err);
                            break;
                        }
                    }
                    if !had_invocations {
                        // Nothing ready; go idle unless a producer raced us.
                        let mut sched = self.sched.lock();
                        if !sched.dirty {
                            sched.scheduled = false;
                            break;
                        }
                    }
                },
                Work::Close => {
                    if let Err(err) = self.close_node(&mut outcome) {
                        outcome.error = Some(err);
                    }
                    outcome.closed = true;
                    let mut sched = self.sched.lock();
                    sched.status = NodeStatus::Closed;
                    sched.scheduled = false;
                    break;
                },
                Work::Idle => {
                    self.sched.lock().scheduled = false;
                    break;
                },
            }
        }
        if outcome.error.is_some() {
            self.sched.lock().scheduled = false;
        }
        outcome
    }

    /// Drops the calculator and handler, e.g. on teardown after an error.
    pub fn cleanup(&self) {
        let mut sched = self.sched.lock();
        sched.handler = None;
        sched.status = NodeStatus::Closed;
        drop(sched);
        let mut exec = self.exec.lock();
        exec.calculator = None;
        exec.input_side_packets.clear();
    }

    fn make_context(&self, in_open: bool) -> CalculatorContext {
        let side_names = self.output_side_packets.iter().map(|(n, _)| Arc::clone(n)).collect();
        let mut cc = CalculatorContext::new(Arc::clone(&self.name), side_names, in_open);
        cc.outputs = self.output_streams.iter().map(|o| o.make_shard()).collect();
        cc
    }

    fn drain_outputs(&self, cc: &mut CalculatorContext, outcome: &mut TaskOutcome) -> Result<()> {
        for (shard, manager) in cc.outputs.iter_mut().zip(&self.output_streams) {
            outcome.notify.extend(manager.propagate_updates(shard)?);
        }
        Ok(())
    }

    fn open_node(&self, outcome: &mut TaskOutcome) -> Result<()> {
        debug!(node = %self.name, "opening");
        let mut exec = self.exec.lock();
        let mut cc = self.make_context(true);
        cc.input_timestamp = Timestamp::UNSTARTED;
        cc.input_side_packets = exec.input_side_packets.clone();
        let calculator = exec.calculator.as_mut().ok_or_else(|| {
            FlowGraphError::Internal(format!("node '{}' has no calculator instance", self.name))
        })?;
        calculator.open(&mut cc).map_err(|e| {
            FlowGraphError::Calculator(format!("node '{}' failed in Open: {e}", self.name))
        })?;

        let staged = cc.take_output_side_packets();
        for (local_name, slot) in &self.output_side_packets {
            let Some((_, packet)) =
                staged.iter().find(|(n, _)| n.as_ref() == local_name.as_ref())
            else {
                return Err(FlowGraphError::Calculator(format!(
                    "node '{}' did not set declared output side packet '{local_name}' in Open",
                    self.name
                )));
            };
            for mirror in slot.set(packet.clone())? {
                outcome.side_packet_deliveries.push((mirror, packet.clone()));
            }
        }

        self.drain_outputs(&mut cc, outcome)?;
        for manager in &self.output_streams {
            manager.lock_intro_data();
        }
        Ok(())
    }

    fn process_invocation(
        &self,
        invocation: PreparedInvocation,
        outcome: &mut TaskOutcome,
    ) -> Result<()> {
        trace!(node = %self.name, timestamp = %invocation.input_timestamp, "process");
        let mut exec = self.exec.lock();
        let mut cc = self.make_context(false);
        cc.input_timestamp = invocation.input_timestamp;
        cc.inputs = invocation.inputs;
        cc.input_side_packets = exec.input_side_packets.clone();
        let calculator = exec.calculator.as_mut().ok_or_else(|| {
            FlowGraphError::Internal(format!("node '{}' has no calculator instance", self.name))
        })?;
        calculator.process(&mut cc).map_err(|e| {
            FlowGraphError::Calculator(format!(
                "node '{}' failed in Process at {}: {e}",
                self.name, invocation.input_timestamp
            ))
        })?;

        if invocation.propagate_bound {
            for (shard, manager) in cc.outputs.iter_mut().zip(&self.output_streams) {
                let candidate =
                    manager.compute_output_timestamp_bound(invocation.input_timestamp);
                if candidate != Timestamp::UNSET {
                    shard.set_next_timestamp_bound(candidate)?;
                }
            }
        }
        self.drain_outputs(&mut cc, outcome)
    }

    /// Advances output bounds from the node's input bound when no invocation
    /// ran, for outputs with a declared offset.
    fn propagate_input_bound(&self, input_bound: Timestamp, outcome: &mut TaskOutcome) -> Result<()> {
        let settled = input_bound.previous_allowed_in_stream();
        for manager in &self.output_streams {
            let candidate = manager.compute_output_timestamp_bound(settled);
            if candidate != Timestamp::UNSET {
                outcome.notify.extend(manager.propagate_timestamp_bound(candidate)?);
            }
        }
        Ok(())
    }

    fn close_node(&self, outcome: &mut TaskOutcome) -> Result<()> {
        debug!(node = %self.name, "closing");
        let mut exec = self.exec.lock();
        let mut cc = self.make_context(false);
        cc.input_timestamp = Timestamp::DONE;
        cc.input_side_packets = exec.input_side_packets.clone();
        let calculator = exec.calculator.as_mut().ok_or_else(|| {
            FlowGraphError::Internal(format!("node '{}' has no calculator instance", self.name))
        })?;
        let result = calculator.close(&mut cc).map_err(|e| {
            FlowGraphError::Calculator(format!("node '{}' failed in Close: {e}", self.name))
        });
        // Close outputs even if the calculator failed, so downstream nodes
        // are not left waiting forever.
        let drained = self.drain_outputs(&mut cc, outcome);
        for manager in &self.output_streams {
            outcome.notify.extend(manager.close()?);
        }
        exec.calculator = None;
        result.and(drained)
    }
}

impl std::fmt::Debug for CalculatorNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalculatorNode")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("num_inputs", &self.input_streams.len())
            .field("num_outputs", &self.output_streams.len())
            .finish_non_exhaustive()
    }
}
