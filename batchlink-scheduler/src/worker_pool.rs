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
use std::collections::HashMap;
use std::sync::Arc;

use batchlink_error::{Code, Error, ResultExt};
use batchlink_util::instant_wrapper::InstantWrapper;
use batchlink_util::spawn;
use batchlink_util::task::JoinHandleDropGuard;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{event, Level};

use crate::host::{HostEnv, ProcessId, WorkFinished, WorkMode, WorkerCommand, WorkerEvent};
use crate::hwgw_batch::{BatchGroups, HwgwBatch};
use crate::memory_pool::MemoryPool;
use crate::process_registry::ProcessRegistry;
use crate::worker::Worker;
use crate::worker_group::WorkerGroup;

/// Security removed per weaken thread per round.
pub const WEAKEN_PER_THREAD: f64 = 0.05;

/// Thread counts for the four phases of one batch against a target at its
/// security baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchRatios {
    pub hack_threads: u32,
    pub hack_weaken_threads: u32,
    pub grow_threads: u32,
    pub grow_weaken_threads: u32,
}

impl BatchRatios {
    pub const fn total_threads(&self) -> u32 {
        self.hack_threads + self.hack_weaken_threads + self.grow_threads + self.grow_weaken_threads
    }
}

#[derive(Default)]
struct RouteState {
    start_acks: HashMap<ProcessId, oneshot::Sender<bool>>,
    resume_acks: HashMap<ProcessId, oneshot::Sender<bool>>,
    done_txs: HashMap<ProcessId, UnboundedSender<WorkFinished>>,
}

impl RouteState {
    fn forget(&mut self, pid: ProcessId) {
        if let Some(ack) = self.start_acks.remove(&pid) {
            drop(ack.send(false));
        }
        if let Some(ack) = self.resume_acks.remove(&pid) {
            drop(ack.send(false));
        }
        self.done_txs.remove(&pid);
    }
}

/// Spawns workers against pool memory and routes host events back to the
/// worker handles that are waiting on them.
///
/// The pool claims the host's event stream on construction and pumps it for
/// its whole lifetime. Worker handles register interest per process id and
/// the pump resolves them as acknowledgements and completion reports arrive.
pub struct WorkerPool {
    host: Arc<dyn HostEnv>,
    memory: Arc<MemoryPool>,
    registry: Arc<ProcessRegistry>,
    hack_cost_gb: f64,
    grow_cost_gb: f64,
    weaken_cost_gb: f64,
    routes: Arc<Mutex<RouteState>>,
    _event_pump: JoinHandleDropGuard<()>,
}

impl WorkerPool {
    /// Errors if the host's event stream was already claimed by another pool.
    pub fn new(
        host: Arc<dyn HostEnv>,
        memory: Arc<MemoryPool>,
        registry: Arc<ProcessRegistry>,
    ) -> Result<Arc<Self>, Error> {
        let event_rx = host
            .take_event_stream()
            .err_tip(|| "Worker event stream was already claimed")?;
        let routes = Arc::new(Mutex::new(RouteState::default()));
        let pump_routes = routes.clone();
        let pump_host = host.clone();
        let event_pump = spawn!("worker_event_pump", async move {
            Self::pump_events(event_rx, pump_routes, pump_host).await;
        });
        Ok(Arc::new(Self {
            hack_cost_gb: host.operation_cost_gb(WorkMode::Hack),
            grow_cost_gb: host.operation_cost_gb(WorkMode::Grow),
            weaken_cost_gb: host.operation_cost_gb(WorkMode::Weaken),
            host,
            memory,
            registry,
            routes,
            _event_pump: event_pump,
        }))
    }

    async fn pump_events(
        mut event_rx: UnboundedReceiver<WorkerEvent>,
        routes: Arc<Mutex<RouteState>>,
        host: Arc<dyn HostEnv>,
    ) {
        while let Some(worker_event) = event_rx.recv().await {
            match worker_event {
                WorkerEvent::Started { pid } => {
                    let ack = routes.lock().start_acks.remove(&pid);
                    match ack {
                        Some(ack) => drop(ack.send(true)),
                        None => {
                            event!(Level::WARN, %pid, "Start acknowledged with nobody waiting");
                        }
                    }
                }
                WorkerEvent::Resumed { pid } => {
                    let ack = routes.lock().resume_acks.remove(&pid);
                    match ack {
                        Some(ack) => drop(ack.send(true)),
                        None => {
                            event!(Level::WARN, %pid, "Resume acknowledged with nobody waiting");
                        }
                    }
                }
                WorkerEvent::Done(done) => {
                    let done_tx = routes.lock().done_txs.get(&done.pid).cloned();
                    match done_tx {
                        Some(done_tx) => {
                            if done_tx.send(done).is_err() {
                                event!(
                                    Level::WARN,
                                    "Completion report for a dropped worker handle"
                                );
                            }
                        }
                        None => {
                            event!(Level::WARN, ?done, "Completion report with no route");
                        }
                    }
                }
                WorkerEvent::Killed { pid } => {
                    if host.process_alive(pid) {
                        event!(
                            Level::WARN,
                            %pid,
                            "Killed event for a process the host still reports alive, ignoring"
                        );
                        continue;
                    }
                    routes.lock().forget(pid);
                }
            }
        }
    }

    pub(crate) const fn host(&self) -> &Arc<dyn HostEnv> {
        &self.host
    }

    pub(crate) const fn memory(&self) -> &Arc<MemoryPool> {
        &self.memory
    }

    pub(crate) const fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    const fn cost_gb(&self, mode: WorkMode) -> f64 {
        match mode {
            WorkMode::Hack => self.hack_cost_gb,
            WorkMode::Grow => self.grow_cost_gb,
            WorkMode::Weaken => self.weaken_cost_gb,
        }
    }

    pub(crate) fn register_start_ack(&self, pid: ProcessId) -> oneshot::Receiver<bool> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if let Some(stale) = self.routes.lock().start_acks.insert(pid, ack_tx) {
            drop(stale.send(false));
        }
        ack_rx
    }

    pub(crate) fn register_resume_ack(&self, pid: ProcessId) -> oneshot::Receiver<bool> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if let Some(stale) = self.routes.lock().resume_acks.insert(pid, ack_tx) {
            drop(stale.send(false));
        }
        ack_rx
    }

    pub(crate) fn bind_done_channel(&self, pid: ProcessId) -> UnboundedReceiver<WorkFinished> {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        self.routes.lock().done_txs.insert(pid, done_tx);
        done_rx
    }

    /// Drops all routing for `pid`, resolving any pending acknowledgements as
    /// failed. Does not touch the process itself.
    pub(crate) fn forget(&self, pid: ProcessId) {
        self.routes.lock().forget(pid);
    }

    /// Reserves memory for `threads` threads of `mode` and spawns workers on
    /// it, splitting across nodes when no single node can hold the whole
    /// group. All-or-nothing: on any failure everything reserved or spawned
    /// here is rolled back and `None` returned. Zero threads is never
    /// satisfiable.
    pub fn reserve_group(self: &Arc<Self>, mode: WorkMode, threads: u32) -> Option<WorkerGroup> {
        if threads == 0 {
            return None;
        }
        let cost_gb = self.cost_gb(mode);
        let mut reservations = self.memory.reserve_threads(threads, cost_gb)?.into_iter();
        let mut workers = Vec::new();
        for reservation in reservations.by_ref() {
            let worker_threads = (reservation.size_gb() / cost_gb).floor() as u32;
            match Worker::spawn(self, reservation, mode, worker_threads) {
                Ok(worker) => workers.push(worker),
                Err(err) => {
                    event!(
                        Level::ERROR,
                        ?mode,
                        threads,
                        ?err,
                        "Failed to spawn a group member, rolling back the group"
                    );
                    for mut worker in workers {
                        worker.kill();
                    }
                    for unused in reservations {
                        self.memory.free(&unused);
                    }
                    return None;
                }
            }
        }
        match WorkerGroup::new(mode, workers) {
            Ok(group) => Some(group),
            Err(err) => {
                event!(Level::ERROR, ?err, "Could not assemble the reserved group");
                None
            }
        }
    }

    /// Sizes the four phases of a batch that steals `hack_ratio` of the
    /// target's current money and then restores it.
    pub fn calculate_batch_ratios(
        &self,
        target: &str,
        hack_ratio: f64,
    ) -> Result<BatchRatios, Error> {
        let snapshot = self
            .host
            .node_snapshot(target)
            .err_tip_with_code(|_| (Code::NotFound, format!("No node snapshot for {target}")))?;
        let hack_amount = snapshot.money_available * hack_ratio;
        let hack_threads = (self
            .host
            .hack_analyze_threads(target, hack_amount)
            .floor() as u32)
            .max(1);
        let hack_weaken_threads = (self.host.hack_analyze_security(hack_threads)
            / WEAKEN_PER_THREAD)
            .ceil() as u32;
        let grow_multiplier = 1.0 / (1.0 - hack_ratio);
        let grow_threads = self.host.growth_analyze(target, grow_multiplier).ceil() as u32;
        let grow_weaken_threads = (self.host.growth_analyze_security(grow_threads)
            / WEAKEN_PER_THREAD)
            .ceil() as u32;
        Ok(BatchRatios {
            hack_threads,
            hack_weaken_threads,
            grow_threads,
            grow_weaken_threads,
        })
    }

    /// Total memory one batch sized by `ratios` occupies while in flight.
    pub fn batch_ram_gb(&self, ratios: &BatchRatios) -> f64 {
        f64::from(ratios.hack_threads) * self.hack_cost_gb
            + f64::from(ratios.grow_threads) * self.grow_cost_gb
            + f64::from(ratios.hack_weaken_threads + ratios.grow_weaken_threads)
                * self.weaken_cost_gb
    }

    /// Reserves all four groups of a batch against `target`.
    ///
    /// Yields `None` without comment when the target is unknown or not at its
    /// security baseline, since callers probe with this during preparation.
    /// A partial reservation is an error: what was reserved is killed and
    /// logged before `None` is returned.
    pub fn reserve_batch<I, NowFn>(
        self: &Arc<Self>,
        target: &str,
        hack_ratio: f64,
        gap: Duration,
        now_fn: NowFn,
    ) -> Option<HwgwBatch<I, NowFn>>
    where
        I: InstantWrapper,
        NowFn: Fn() -> I + Send + Sync + 'static,
    {
        let snapshot = self.host.node_snapshot(target)?;
        if snapshot.security > snapshot.min_security {
            return None;
        }
        let ratios = match self.calculate_batch_ratios(target, hack_ratio) {
            Ok(ratios) => ratios,
            Err(err) => {
                event!(Level::ERROR, target, ?err, "Failed to size a batch");
                return None;
            }
        };
        let hack = self.reserve_group(WorkMode::Hack, ratios.hack_threads);
        let hack_weaken = self.reserve_group(WorkMode::Weaken, ratios.hack_weaken_threads);
        let grow = self.reserve_group(WorkMode::Grow, ratios.grow_threads);
        let grow_weaken = self.reserve_group(WorkMode::Weaken, ratios.grow_weaken_threads);
        match (hack, hack_weaken, grow, grow_weaken) {
            (Some(hack), Some(hack_weaken), Some(grow), Some(grow_weaken)) => {
                Some(HwgwBatch::new(
                    self.host.clone(),
                    target.to_string(),
                    BatchGroups {
                        hack,
                        hack_weaken,
                        grow,
                        grow_weaken,
                    },
                    gap,
                    now_fn,
                ))
            }
            (hack, hack_weaken, grow, grow_weaken) => {
                event!(
                    Level::ERROR,
                    target,
                    hack = hack.is_some(),
                    hack_weaken = hack_weaken.is_some(),
                    grow = grow.is_some(),
                    grow_weaken = grow_weaken.is_some(),
                    ?ratios,
                    "Could not reserve a full batch, rolling back"
                );
                for group in [hack, hack_weaken, grow, grow_weaken] {
                    if let Some(mut group) = group {
                        group.kill();
                    }
                }
                None
            }
        }
    }

    /// Stops and kills every process the registry still considers running.
    pub fn kill_all(&self) {
        let pids = self.registry.running();
        let mut routes = self.routes.lock();
        for pid in pids {
            self.host.send_command(pid, WorkerCommand::Stop);
            self.host.kill(pid);
            routes.forget(pid);
        }
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("hack_cost_gb", &self.hack_cost_gb)
            .field("grow_cost_gb", &self.grow_cost_gb)
            .field("weaken_cost_gb", &self.weaken_cost_gb)
            .finish_non_exhaustive()
    }
}
