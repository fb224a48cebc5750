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
use std::collections::HashMap;
use std::sync::Arc;

use batchlink_config::coordinator::SimSpec;
use batchlink_scheduler::host::{
    HostEnv, NodeSnapshot, ProcessId, WorkFinished, WorkMode, WorkerCommand, WorkerEvent,
};
use batchlink_scheduler::worker_pool::WEAKEN_PER_THREAD;
use batchlink_util::spawn;
use batchlink_util::task::JoinHandleDropGuard;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{event, Level};

const HACK_COST_GB: f64 = 1.7;
const GROW_COST_GB: f64 = 1.75;
const WEAKEN_COST_GB: f64 = 1.75;

const HACK_SECURITY_PER_THREAD: f64 = 0.002;
const GROW_SECURITY_PER_THREAD: f64 = 0.004;

const GROW_TIME_FACTOR: f64 = 3.2;
const WEAKEN_TIME_FACTOR: f64 = 4.0;

/// Fraction of a node's current money one hack thread steals at zero
/// security.
const HACK_FRACTION_SCALE: f64 = 0.02;
/// Converts a node's growth rate into the per-thread money multiplier.
const GROW_BASE_SCALE: f64 = 0.05;

const RAM_EPSILON: f64 = 1e-9;
const FIRST_PID: u32 = 1000;
const DEFAULT_MIN_SECURITY: f64 = 1.0;
const DEFAULT_HACK_TIME_MS: u64 = 5000;

#[derive(Debug)]
struct SimNode {
    name: String,
    ram_gb: f64,
    used_gb: f64,
    admin_rights: bool,
    operator_owned: bool,
    money_max: f64,
    money_available: f64,
    min_security: f64,
    security: f64,
    growth_rate: f64,
    required_skill: u32,
    base_hack_time: Duration,
}

#[derive(Debug)]
struct SimProcess {
    node: String,
    ram_gb: f64,
    command_tx: UnboundedSender<WorkerCommand>,
    _task: JoinHandleDropGuard<()>,
}

#[derive(Debug)]
struct NetState {
    nodes: Vec<SimNode>,
    index: HashMap<String, usize>,
    processes: HashMap<ProcessId, SimProcess>,
    next_pid: u32,
}

impl NetState {
    fn node(&self, name: &str) -> Option<&SimNode> {
        let index = self.index.get(name).copied()?;
        self.nodes.get(index)
    }

    fn node_mut(&mut self, name: &str) -> Option<&mut SimNode> {
        let index = self.index.get(name).copied()?;
        self.nodes.get_mut(index)
    }
}

fn hack_fraction(node: &SimNode) -> f64 {
    ((100.0 - node.security).max(0.0) / 100.0) * HACK_FRACTION_SCALE
}

fn grow_base(node: &SimNode) -> f64 {
    1.0 + (node.growth_rate / 100.0) * GROW_BASE_SCALE
}

const fn cost_per_thread_gb(mode: WorkMode) -> f64 {
    match mode {
        WorkMode::Hack => HACK_COST_GB,
        WorkMode::Grow => GROW_COST_GB,
        WorkMode::Weaken => WEAKEN_COST_GB,
    }
}

fn duration_of(node: &SimNode, mode: WorkMode) -> Duration {
    let hack_time = node.base_hack_time.mul_f64(node.security / node.min_security);
    match mode {
        WorkMode::Hack => hack_time,
        WorkMode::Grow => hack_time.mul_f64(GROW_TIME_FACTOR),
        WorkMode::Weaken => hack_time.mul_f64(WEAKEN_TIME_FACTOR),
    }
}

/// Mutates the target for one finished round and returns the amount to
/// report: money stolen, money added, or security removed.
fn apply_round(node: &mut SimNode, mode: WorkMode, threads: u32) -> f64 {
    let threads = f64::from(threads);
    match mode {
        WorkMode::Hack => {
            let stolen =
                (node.money_available * hack_fraction(node) * threads).min(node.money_available);
            node.money_available -= stolen;
            node.security += HACK_SECURITY_PER_THREAD * threads;
            stolen
        }
        WorkMode::Grow => {
            let before = node.money_available;
            node.money_available = (node.money_available.max(1.0)
                * grow_base(node).powf(threads))
            .min(node.money_max);
            node.security += GROW_SECURITY_PER_THREAD * threads;
            node.money_available - before
        }
        WorkMode::Weaken => {
            let before = node.security;
            node.security = (node.security - WEAKEN_PER_THREAD * threads).max(node.min_security);
            before - node.security
        }
    }
}

/// Removes the process record and releases its memory on the node it ran on.
/// `false` when the process was already gone.
fn reap(state: &Mutex<NetState>, pid: ProcessId) -> bool {
    let process = {
        let mut state = state.lock();
        let Some(process) = state.processes.remove(&pid) else {
            return false;
        };
        if let Some(node) = state.node_mut(&process.node) {
            node.used_gb = (node.used_gb - process.ram_gb).max(0.0);
        }
        process
    };
    drop(process);
    true
}

async fn run_round(
    state: &Mutex<NetState>,
    event_tx: &UnboundedSender<WorkerEvent>,
    pid: ProcessId,
    mode: WorkMode,
    threads: u32,
    target: &str,
) {
    let duration = {
        let state = state.lock();
        state.node(target).map(|node| duration_of(node, mode))
    };
    let Some(duration) = duration else {
        event!(Level::WARN, %pid, target, "Round against an unknown node dropped");
        return;
    };
    tokio::time::sleep(duration).await;
    let amount = {
        let mut state = state.lock();
        state
            .node_mut(target)
            .map_or(0.0, |node| apply_round(node, mode, threads))
    };
    drop(event_tx.send(WorkerEvent::Done(WorkFinished {
        pid,
        target: target.to_string(),
        mode,
        amount,
    })));
}

async fn worker_task(
    state: Arc<Mutex<NetState>>,
    event_tx: UnboundedSender<WorkerEvent>,
    exit_tx: UnboundedSender<ProcessId>,
    pid: ProcessId,
    mode: WorkMode,
    threads: u32,
    mut command_rx: UnboundedReceiver<WorkerCommand>,
) {
    let mut last_target: Option<String> = None;
    'commands: loop {
        let Some(command) = command_rx.recv().await else {
            break;
        };
        match command {
            WorkerCommand::Start {
                target,
                auto_continue,
                ..
            } => {
                drop(event_tx.send(WorkerEvent::Started { pid }));
                loop {
                    run_round(&state, &event_tx, pid, mode, threads, &target).await;
                    if !auto_continue {
                        break;
                    }
                    match command_rx.try_recv() {
                        Ok(WorkerCommand::Stop) | Err(TryRecvError::Disconnected) => {
                            break 'commands;
                        }
                        Ok(_) | Err(TryRecvError::Empty) => {}
                    }
                }
                last_target = Some(target);
            }
            WorkerCommand::Resume => {
                drop(event_tx.send(WorkerEvent::Resumed { pid }));
                match &last_target {
                    Some(target) => {
                        run_round(&state, &event_tx, pid, mode, threads, target).await;
                    }
                    None => event!(Level::WARN, %pid, "Resumed with no previous round"),
                }
            }
            WorkerCommand::Stop => break,
        }
    }
    if reap(&state, pid) {
        drop(event_tx.send(WorkerEvent::Killed { pid }));
        drop(exit_tx.send(pid));
    }
}

/// In-memory network of nodes with real asynchronous worker processes.
///
/// Each launched process is a task that consumes commands, sleeps for the
/// operation's duration, mutates the target node, and reports completions
/// over the shared event stream, so timing behaves like a live host with
/// deterministic formulas behind it.
#[derive(Debug)]
pub struct SimNet {
    player_skill: u32,
    state: Arc<Mutex<NetState>>,
    event_tx: UnboundedSender<WorkerEvent>,
    event_rx: Mutex<Option<UnboundedReceiver<WorkerEvent>>>,
    exit_tx: UnboundedSender<ProcessId>,
    exit_rx: Mutex<Option<UnboundedReceiver<ProcessId>>>,
}

impl SimNet {
    /// Unset or zero per-node fields fall back to playable values so a
    /// sparse config still produces a working network.
    pub fn new(spec: &SimSpec) -> Self {
        let mut nodes = Vec::with_capacity(spec.nodes.len());
        let mut index = HashMap::new();
        for node in &spec.nodes {
            if index.contains_key(&node.name) {
                event!(Level::WARN, name = %node.name, "Duplicate node name, keeping the first");
                continue;
            }
            let min_security = if node.min_security > 0.0 {
                node.min_security
            } else {
                DEFAULT_MIN_SECURITY
            };
            let money_max = node.money_max.max(0.0);
            let hack_time_ms = if node.hack_time_ms > 0 {
                node.hack_time_ms
            } else {
                DEFAULT_HACK_TIME_MS
            };
            index.insert(node.name.clone(), nodes.len());
            nodes.push(SimNode {
                name: node.name.clone(),
                ram_gb: node.ram_gb.max(0.0),
                used_gb: 0.0,
                admin_rights: node.admin_rights,
                operator_owned: node.operator_owned,
                money_max,
                money_available: node
                    .money_available
                    .unwrap_or(money_max)
                    .clamp(0.0, money_max),
                min_security,
                security: node.security.unwrap_or(min_security).max(min_security),
                growth_rate: if node.growth_rate > 0.0 {
                    node.growth_rate
                } else {
                    1.0
                },
                required_skill: node.required_skill,
                base_hack_time: Duration::from_millis(hack_time_ms),
            });
        }
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        Self {
            player_skill: spec.player_skill.max(1),
            state: Arc::new(Mutex::new(NetState {
                nodes,
                index,
                processes: HashMap::new(),
                next_pid: FIRST_PID,
            })),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            exit_tx,
            exit_rx: Mutex::new(Some(exit_rx)),
        }
    }

    /// Number of processes currently running across the network.
    pub fn process_count(&self) -> usize {
        self.state.lock().processes.len()
    }
}

impl HostEnv for SimNet {
    fn launch(&self, hostname: &str, mode: WorkMode, threads: u32) -> Option<ProcessId> {
        if threads == 0 {
            return None;
        }
        let need_gb = cost_per_thread_gb(mode) * f64::from(threads);
        let mut state = self.state.lock();
        {
            let node = state.node_mut(hostname)?;
            if !node.admin_rights || node.used_gb + need_gb > node.ram_gb + RAM_EPSILON {
                return None;
            }
            node.used_gb += need_gb;
        }
        let pid = ProcessId(state.next_pid);
        state.next_pid += 1;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let task_state = self.state.clone();
        let task_events = self.event_tx.clone();
        let task_exits = self.exit_tx.clone();
        let task = spawn!("sim_worker", async move {
            worker_task(
                task_state,
                task_events,
                task_exits,
                pid,
                mode,
                threads,
                command_rx,
            )
            .await;
        });
        state.processes.insert(
            pid,
            SimProcess {
                node: hostname.to_string(),
                ram_gb: need_gb,
                command_tx,
                _task: task,
            },
        );
        Some(pid)
    }

    fn kill(&self, pid: ProcessId) -> bool {
        if reap(&self.state, pid) {
            drop(self.event_tx.send(WorkerEvent::Killed { pid }));
            drop(self.exit_tx.send(pid));
            return true;
        }
        false
    }

    fn process_alive(&self, pid: ProcessId) -> bool {
        self.state.lock().processes.contains_key(&pid)
    }

    fn send_command(&self, pid: ProcessId, command: WorkerCommand) -> bool {
        let state = self.state.lock();
        state
            .processes
            .get(&pid)
            .is_some_and(|process| process.command_tx.send(command).is_ok())
    }

    fn take_event_stream(&self) -> Option<UnboundedReceiver<WorkerEvent>> {
        self.event_rx.lock().take()
    }

    fn take_exit_stream(&self) -> Option<UnboundedReceiver<ProcessId>> {
        self.exit_rx.lock().take()
    }

    fn nodes(&self) -> Vec<String> {
        self.state
            .lock()
            .nodes
            .iter()
            .map(|node| node.name.clone())
            .collect()
    }

    fn node_snapshot(&self, hostname: &str) -> Option<NodeSnapshot> {
        let state = self.state.lock();
        let node = state.node(hostname)?;
        Some(NodeSnapshot {
            hostname: node.name.clone(),
            capacity_gb: node.ram_gb,
            used_gb: node.used_gb,
            has_admin_rights: node.admin_rights,
            security: node.security,
            min_security: node.min_security,
            money_available: node.money_available,
            money_max: node.money_max,
            growth_rate: node.growth_rate,
            required_skill: node.required_skill,
            operator_owned: node.operator_owned,
        })
    }

    fn operation_cost_gb(&self, mode: WorkMode) -> f64 {
        cost_per_thread_gb(mode)
    }

    fn operation_duration(&self, mode: WorkMode, target: &str) -> Duration {
        let state = self.state.lock();
        state
            .node(target)
            .map_or(Duration::ZERO, |node| duration_of(node, mode))
    }

    fn hack_analyze_threads(&self, target: &str, amount: f64) -> f64 {
        let state = self.state.lock();
        let Some(node) = state.node(target) else {
            return -1.0;
        };
        if amount <= 0.0 || amount > node.money_available {
            return -1.0;
        }
        let per_thread = node.money_available * hack_fraction(node);
        if per_thread <= 0.0 {
            return -1.0;
        }
        amount / per_thread
    }

    fn hack_analyze_security(&self, threads: u32) -> f64 {
        HACK_SECURITY_PER_THREAD * f64::from(threads)
    }

    fn growth_analyze(&self, target: &str, multiplier: f64) -> f64 {
        let state = self.state.lock();
        let Some(node) = state.node(target) else {
            return 0.0;
        };
        if multiplier <= 1.0 {
            return 0.0;
        }
        multiplier.ln() / grow_base(node).ln()
    }

    fn growth_analyze_security(&self, threads: u32) -> f64 {
        GROW_SECURITY_PER_THREAD * f64::from(threads)
    }

    fn player_skill(&self) -> u32 {
        self.player_skill
    }
}
