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

use core::fmt;
use core::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

/// Identity of one remote worker process. Zero is reserved as the
/// "never launched / already dead" sentinel.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ProcessId(pub u32);

impl ProcessId {
    pub const DEAD: Self = Self(0);
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// The operation a worker process executes against a target node.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum WorkMode {
    Hack,
    Grow,
    Weaken,
}

impl WorkMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hack => "hack",
            Self::Grow => "grow",
            Self::Weaken => "weaken",
        }
    }
}

impl fmt::Display for WorkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options shared by every worker of a group when a cycle is started.
#[derive(Clone, Debug, PartialEq)]
pub struct StartOptions {
    pub target: String,
    /// When set, the worker immediately begins the next unit of work after
    /// reporting a completion instead of waiting for another start command.
    pub auto_continue: bool,
}

/// Command sent to a single worker process over its private channel.
#[derive(Clone, Debug, PartialEq)]
pub enum WorkerCommand {
    Start {
        target: String,
        mode: WorkMode,
        auto_continue: bool,
    },
    /// Clears the stopped flag of an idle worker so it picks up the next
    /// unit of work with its previous target and mode.
    Resume,
    Stop,
}

/// Event reported by a worker process back to the pool.
#[derive(Clone, Debug, PartialEq)]
pub enum WorkerEvent {
    /// Acknowledges a `Start` command.
    Started { pid: ProcessId },
    /// Acknowledges a `Resume` command.
    Resumed { pid: ProcessId },
    /// One unit of work finished.
    Done(WorkFinished),
    /// The process exited, normally or not.
    Killed { pid: ProcessId },
}

/// Payload of a completed unit of work.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkFinished {
    pub pid: ProcessId,
    pub target: String,
    pub mode: WorkMode,
    /// Money extracted for hack, balance multiplier for grow, security
    /// reduction for weaken.
    pub amount: f64,
}

/// Point-in-time resource description of one compute node.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeSnapshot {
    pub hostname: String,
    pub capacity_gb: f64,
    pub used_gb: f64,
    pub has_admin_rights: bool,
    pub security: f64,
    pub min_security: f64,
    pub money_available: f64,
    pub money_max: f64,
    pub growth_rate: f64,
    pub required_skill: u32,
    /// Nodes owned by the operator run workers but are never targeted.
    pub operator_owned: bool,
}

/// Capabilities the coordinator consumes from whatever actually runs the
/// worker processes.
///
/// All methods are synchronous queries or fire-and-forget sends. The two
/// stream accessors hand out the receiving half of the host's event plumbing
/// exactly once; the pool and the process registry each take one.
pub trait HostEnv: Send + Sync + 'static {
    /// Launches a worker process for `mode` with `threads` threads on `node`.
    /// Returns `None` when the process could not be spawned.
    fn launch(&self, node: &str, mode: WorkMode, threads: u32) -> Option<ProcessId>;

    /// Terminates a process. Returns whether the process existed.
    fn kill(&self, pid: ProcessId) -> bool;

    fn process_alive(&self, pid: ProcessId) -> bool;

    /// Delivers a command on the per-process channel. Returns `false` if the
    /// process is gone and the command was dropped.
    fn send_command(&self, pid: ProcessId, command: WorkerCommand) -> bool;

    /// Acknowledgement and completion stream shared by all worker processes.
    /// Yields `None` on every call after the first.
    fn take_event_stream(&self) -> Option<UnboundedReceiver<WorkerEvent>>;

    /// Push notifications for process exits where the host supports them.
    /// Hosts without push notification return `None` here and the process
    /// registry falls back to periodic liveness polling.
    fn take_exit_stream(&self) -> Option<UnboundedReceiver<ProcessId>>;

    fn nodes(&self) -> Vec<String>;

    fn node_snapshot(&self, hostname: &str) -> Option<NodeSnapshot>;

    /// Memory cost in GB of one worker thread running `mode`.
    fn operation_cost_gb(&self, mode: WorkMode) -> f64;

    /// How long one `mode` operation against `target` currently takes. This
    /// varies with the target's security level and changes over a run.
    fn operation_duration(&self, mode: WorkMode, target: &str) -> Duration;

    /// Number of hack threads needed to extract `amount` money from `target`.
    fn hack_analyze_threads(&self, target: &str, amount: f64) -> f64;

    /// Security increase caused by hacking with `threads` threads.
    fn hack_analyze_security(&self, threads: u32) -> f64;

    /// Number of grow threads needed to multiply `target`'s money by
    /// `multiplier`.
    fn growth_analyze(&self, target: &str, multiplier: f64) -> f64;

    /// Security increase caused by growing with `threads` threads.
    fn growth_analyze_security(&self, threads: u32) -> f64;

    /// Skill level of the operator, gating which targets are reachable.
    fn player_skill(&self) -> u32;
}
