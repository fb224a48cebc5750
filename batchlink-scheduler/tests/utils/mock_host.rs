// Copyright 2024 The BatchLink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use core::time::Duration;
use std::collections::HashSet;

use batchlink_scheduler::host::{
    HostEnv, NodeSnapshot, ProcessId, WorkFinished, WorkMode, WorkerCommand, WorkerEvent,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Money one hack thread steals per round, as a fraction of the target's
/// available money.
const HACK_FRACTION_PER_THREAD: f64 = 0.01;
/// Per-thread money multiplier of one grow round.
const GROW_BASE: f64 = 1.01;

#[derive(Debug, Clone)]
pub struct LaunchRecord {
    pub pid: ProcessId,
    pub hostname: String,
    pub mode: WorkMode,
    pub threads: u32,
}

struct MockHostState {
    nodes: Vec<NodeSnapshot>,
    alive: HashSet<ProcessId>,
    launches: Vec<LaunchRecord>,
    next_pid: u32,
    launches_before_failure: Option<usize>,
    auto_ack: bool,
    hack_duration: Duration,
    grow_duration: Duration,
    weaken_duration: Duration,
    hack_cost_gb: f64,
    grow_cost_gb: f64,
    weaken_cost_gb: f64,
    player_skill: u32,
}

/// Scripted stand-in for the host environment.
///
/// Processes exist only as bookkeeping. Start and resume commands are
/// acknowledged automatically unless a test turns that off, and completion
/// reports are injected by the test when it wants a round to land.
pub struct MockHost {
    state: Mutex<MockHostState>,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkerEvent>>>,
    exit_tx: mpsc::UnboundedSender<ProcessId>,
    exit_rx: Mutex<Option<mpsc::UnboundedReceiver<ProcessId>>>,
    command_tx: mpsc::UnboundedSender<(ProcessId, WorkerCommand)>,
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<(ProcessId, WorkerCommand)>>>,
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHost {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(MockHostState {
                nodes: Vec::new(),
                alive: HashSet::new(),
                launches: Vec::new(),
                next_pid: 1,
                launches_before_failure: None,
                auto_ack: true,
                hack_duration: Duration::from_millis(1000),
                grow_duration: Duration::from_millis(3200),
                weaken_duration: Duration::from_millis(4000),
                hack_cost_gb: 1.7,
                grow_cost_gb: 1.75,
                weaken_cost_gb: 1.75,
                player_skill: 100,
            }),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            exit_tx,
            exit_rx: Mutex::new(Some(exit_rx)),
            command_tx,
            command_rx: Mutex::new(Some(command_rx)),
        }
    }

    pub fn add_node(&self, snapshot: NodeSnapshot) {
        let mut state = self.state.lock();
        match state
            .nodes
            .iter_mut()
            .find(|node| node.hostname == snapshot.hostname)
        {
            Some(node) => *node = snapshot,
            None => state.nodes.push(snapshot),
        }
    }

    pub fn update_node(&self, hostname: &str, update: impl FnOnce(&mut NodeSnapshot)) {
        let mut state = self.state.lock();
        if let Some(node) = state
            .nodes
            .iter_mut()
            .find(|node| node.hostname == hostname)
        {
            update(node);
        }
    }

    pub fn set_durations(&self, hack: Duration, grow: Duration, weaken: Duration) {
        let mut state = self.state.lock();
        state.hack_duration = hack;
        state.grow_duration = grow;
        state.weaken_duration = weaken;
    }

    pub fn set_uniform_cost_gb(&self, cost_gb: f64) {
        let mut state = self.state.lock();
        state.hack_cost_gb = cost_gb;
        state.grow_cost_gb = cost_gb;
        state.weaken_cost_gb = cost_gb;
    }

    pub fn set_player_skill(&self, skill: u32) {
        self.state.lock().player_skill = skill;
    }

    /// Makes every launch after the first `limit` fail.
    pub fn fail_launches_after(&self, limit: usize) {
        self.state.lock().launches_before_failure = Some(limit);
    }

    pub fn set_auto_ack(&self, auto_ack: bool) {
        self.state.lock().auto_ack = auto_ack;
    }

    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.state.lock().launches.clone()
    }

    pub fn alive_pids(&self) -> Vec<ProcessId> {
        let mut pids: Vec<ProcessId> = self.state.lock().alive.iter().copied().collect();
        pids.sort_unstable();
        pids
    }

    pub fn send_event(&self, event: WorkerEvent) {
        drop(self.event_tx.send(event));
    }

    pub fn send_exit(&self, pid: ProcessId) {
        drop(self.exit_tx.send(pid));
    }

    /// Reports one round of `pid` complete, with the mode taken from its
    /// launch record.
    pub fn complete(&self, pid: ProcessId, target: &str, amount: f64) {
        let mode = self
            .state
            .lock()
            .launches
            .iter()
            .find(|launch| launch.pid == pid)
            .map_or(WorkMode::Weaken, |launch| launch.mode);
        drop(self.event_tx.send(WorkerEvent::Done(WorkFinished {
            pid,
            target: target.to_string(),
            mode,
            amount,
        })));
    }

    pub fn take_commands(&self) -> mpsc::UnboundedReceiver<(ProcessId, WorkerCommand)> {
        self.command_rx
            .lock()
            .take()
            .expect("Command stream already taken")
    }
}

impl HostEnv for MockHost {
    fn launch(&self, hostname: &str, mode: WorkMode, threads: u32) -> Option<ProcessId> {
        let mut state = self.state.lock();
        if state
            .launches_before_failure
            .is_some_and(|limit| state.launches.len() >= limit)
        {
            return None;
        }
        if !state
            .nodes
            .iter()
            .any(|node| node.hostname == hostname && node.has_admin_rights)
        {
            return None;
        }
        let pid = ProcessId(state.next_pid);
        state.next_pid += 1;
        state.alive.insert(pid);
        state.launches.push(LaunchRecord {
            pid,
            hostname: hostname.to_string(),
            mode,
            threads,
        });
        Some(pid)
    }

    fn kill(&self, pid: ProcessId) -> bool {
        let killed = self.state.lock().alive.remove(&pid);
        if killed {
            drop(self.exit_tx.send(pid));
        }
        killed
    }

    fn process_alive(&self, pid: ProcessId) -> bool {
        self.state.lock().alive.contains(&pid)
    }

    fn send_command(&self, pid: ProcessId, command: WorkerCommand) -> bool {
        let auto_ack = {
            let state = self.state.lock();
            if !state.alive.contains(&pid) {
                return false;
            }
            state.auto_ack
        };
        if auto_ack {
            match &command {
                WorkerCommand::Start { .. } => {
                    drop(self.event_tx.send(WorkerEvent::Started { pid }));
                }
                WorkerCommand::Resume => {
                    drop(self.event_tx.send(WorkerEvent::Resumed { pid }));
                }
                WorkerCommand::Stop => {}
            }
        }
        drop(self.command_tx.send((pid, command)));
        true
    }

    fn take_event_stream(&self) -> Option<mpsc::UnboundedReceiver<WorkerEvent>> {
        self.event_rx.lock().take()
    }

    fn take_exit_stream(&self) -> Option<mpsc::UnboundedReceiver<ProcessId>> {
        self.exit_rx.lock().take()
    }

    fn nodes(&self) -> Vec<String> {
        self.state
            .lock()
            .nodes
            .iter()
            .map(|node| node.hostname.clone())
            .collect()
    }

    fn node_snapshot(&self, hostname: &str) -> Option<NodeSnapshot> {
        self.state
            .lock()
            .nodes
            .iter()
            .find(|node| node.hostname == hostname)
            .cloned()
    }

    fn operation_cost_gb(&self, mode: WorkMode) -> f64 {
        let state = self.state.lock();
        match mode {
            WorkMode::Hack => state.hack_cost_gb,
            WorkMode::Grow => state.grow_cost_gb,
            WorkMode::Weaken => state.weaken_cost_gb,
        }
    }

    fn operation_duration(&self, mode: WorkMode, _target: &str) -> Duration {
        let state = self.state.lock();
        match mode {
            WorkMode::Hack => state.hack_duration,
            WorkMode::Grow => state.grow_duration,
            WorkMode::Weaken => state.weaken_duration,
        }
    }

    fn hack_analyze_threads(&self, target: &str, amount: f64) -> f64 {
        let state = self.state.lock();
        let Some(node) = state.nodes.iter().find(|node| node.hostname == target) else {
            return -1.0;
        };
        if amount <= 0.0 || amount > node.money_available {
            return -1.0;
        }
        amount / (node.money_available * HACK_FRACTION_PER_THREAD)
    }

    fn hack_analyze_security(&self, threads: u32) -> f64 {
        0.002 * f64::from(threads)
    }

    fn growth_analyze(&self, _target: &str, multiplier: f64) -> f64 {
        if multiplier <= 1.0 {
            return 0.0;
        }
        multiplier.ln() / GROW_BASE.ln()
    }

    fn growth_analyze_security(&self, threads: u32) -> f64 {
        0.004 * f64::from(threads)
    }

    fn player_skill(&self) -> u32 {
        self.state.lock().player_skill
    }
}

/// A registered, reachable node holding money, ready to be adjusted per test.
pub fn test_node(hostname: &str, capacity_gb: f64) -> NodeSnapshot {
    NodeSnapshot {
        hostname: hostname.to_string(),
        capacity_gb,
        used_gb: 0.0,
        has_admin_rights: true,
        security: 1.0,
        min_security: 1.0,
        money_available: 1_000_000.0,
        money_max: 2_000_000.0,
        growth_rate: 30.0,
        required_skill: 1,
        operator_owned: false,
    }
}
