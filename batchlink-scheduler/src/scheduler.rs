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
use std::sync::Arc;

use batchlink_config::coordinator::SchedulerSpec;
use batchlink_error::Error;
use batchlink_util::instant_wrapper::InstantWrapper;
use batchlink_util::task::JoinHandleDropGuard;
use tracing::{event, Level};

use crate::batch_manager::{BatchManager, FixedRatio, RatioStrategy, ThreadBudget};
use crate::host::{HostEnv, NodeSnapshot};
use crate::memory_pool::MemoryPool;
use crate::process_registry::ProcessRegistry;
use crate::worker_pool::WorkerPool;

/// Ratio used when sizing the footprint probe that decides whether a target
/// fits in free memory at all.
const PROBE_RATIO: f64 = 0.25;

/// Liveness sweep cadence when the config leaves it unset.
const DEFAULT_EXIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

struct Candidate {
    hostname: String,
    score: f64,
}

/// Continuously rates every reachable node and keeps a [`BatchManager`]
/// pointed at the most profitable one that fits in memory.
///
/// A sitting target is only abandoned when a challenger beats its current
/// score by the configured margin, so small rating wobbles do not burn a
/// freshly prepared target.
pub struct Scheduler<I: InstantWrapper, NowFn: Fn() -> I> {
    host: Arc<dyn HostEnv>,
    memory: Arc<MemoryPool>,
    registry: Arc<ProcessRegistry>,
    pool: Arc<WorkerPool>,
    config: SchedulerSpec,
    ratio_strategy: Arc<dyn RatioStrategy>,
    now_fn: NowFn,
    manager: Option<BatchManager<I, NowFn>>,
    _exit_watcher: JoinHandleDropGuard<()>,
}

impl<I, NowFn> Scheduler<I, NowFn>
where
    I: InstantWrapper,
    NowFn: Fn() -> I + Clone + Send + Sync + 'static,
{
    pub fn new(host: Arc<dyn HostEnv>, config: SchedulerSpec, now_fn: NowFn) -> Result<Self, Error> {
        let memory = Arc::new(MemoryPool::new());
        let registry = Arc::new(ProcessRegistry::new(memory.clone()));
        let exit_watcher = registry.spawn_exit_watcher(
            host.clone(),
            config
                .exit_poll_interval_ms
                .map_or(DEFAULT_EXIT_POLL_INTERVAL, Duration::from_millis),
        );
        let pool = WorkerPool::new(host.clone(), memory.clone(), registry.clone())?;
        let ratio_strategy: Arc<dyn RatioStrategy> = if config.hack_ratio > 0.0 {
            Arc::new(FixedRatio(config.hack_ratio))
        } else {
            Arc::new(ThreadBudget)
        };
        Ok(Self {
            host,
            memory,
            registry,
            pool,
            config,
            ratio_strategy,
            now_fn,
            manager: None,
            _exit_watcher: exit_watcher,
        })
    }

    /// Runs the rate-prepare-schedule loop forever. Transient failures are
    /// logged and the loop carries on with the next pass.
    pub async fn run(&mut self) {
        let idle_sleep = Duration::from_millis(self.config.idle_sleep_ms);
        loop {
            self.tick().await;
            (self.now_fn)().sleep(idle_sleep).await;
        }
    }

    /// One pass: refresh node registrations, re-rate targets, then prepare
    /// and saturate the current target.
    pub async fn tick(&mut self) {
        self.sync_nodes();
        match self.pick_target() {
            Some(best) => {
                if self.should_switch(&best) {
                    self.switch_to(&best.hostname).await;
                }
            }
            None => event!(Level::DEBUG, "No eligible target fits in memory"),
        }
        let breather = Duration::from_millis(self.config.schedule_breather_ms);
        if let Some(manager) = &mut self.manager {
            match manager.prepare().await {
                Ok(true) => {
                    while manager.schedule() {
                        (self.now_fn)().sleep(breather).await;
                    }
                }
                Ok(false) => {
                    event!(
                        Level::DEBUG,
                        target = manager.target(),
                        "Target not at baseline yet"
                    );
                }
                Err(err) => {
                    event!(
                        Level::WARN,
                        target = manager.target(),
                        ?err,
                        "Preparation pass failed"
                    );
                }
            }
        }
    }

    /// Registers every visible node's memory, holding back the configured
    /// reserve on nodes the operator owns.
    fn sync_nodes(&self) {
        let reserve_gb = self.config.reserve_home_gb as f64;
        for hostname in self.host.nodes() {
            let Some(mut snapshot) = self.host.node_snapshot(&hostname) else {
                continue;
            };
            if snapshot.operator_owned {
                snapshot.capacity_gb = (snapshot.capacity_gb - reserve_gb).max(0.0);
            }
            self.memory.register(&snapshot);
        }
    }

    fn eligible(&self, snapshot: &NodeSnapshot) -> bool {
        !snapshot.operator_owned
            && snapshot.money_max > 0.0
            && snapshot.required_skill <= self.host.player_skill()
            && snapshot.has_admin_rights
            && !self.config.exclude_nodes.contains(&snapshot.hostname)
    }

    fn rating(snapshot: &NodeSnapshot) -> f64 {
        snapshot.money_max.powf(1.5) / snapshot.min_security * snapshot.growth_rate.ln()
    }

    /// Best-rated eligible node whose probe batch fits in currently free
    /// memory.
    fn pick_target(&self) -> Option<Candidate> {
        let free_ram = self.memory.total_available();
        let mut best: Option<Candidate> = None;
        for hostname in self.host.nodes() {
            let Some(snapshot) = self.host.node_snapshot(&hostname) else {
                continue;
            };
            if !self.eligible(&snapshot) {
                continue;
            }
            let Ok(ratios) = self.pool.calculate_batch_ratios(&hostname, PROBE_RATIO) else {
                continue;
            };
            if self.pool.batch_ram_gb(&ratios) > free_ram {
                continue;
            }
            let score = Self::rating(&snapshot);
            if best.as_ref().is_none_or(|current| score > current.score) {
                best = Some(Candidate { hostname, score });
            }
        }
        best
    }

    fn should_switch(&self, best: &Candidate) -> bool {
        let Some(manager) = &self.manager else {
            return true;
        };
        if manager.target() == best.hostname {
            return false;
        }
        let current_score = self
            .host
            .node_snapshot(manager.target())
            .map_or(0.0, |snapshot| Self::rating(&snapshot));
        best.score > current_score * self.config.switch_margin
    }

    async fn switch_to(&mut self, target: &str) {
        if let Some(mut manager) = self.manager.take() {
            event!(
                Level::INFO,
                old_target = manager.target(),
                new_target = target,
                "Switching target"
            );
            manager.stop().await;
        }
        let gap = Duration::from_millis(self.config.batch_gap_ms);
        match BatchManager::new(
            self.pool.clone(),
            target,
            gap,
            self.ratio_strategy.clone(),
            self.now_fn.clone(),
        ) {
            Ok(manager) => self.manager = Some(manager),
            Err(err) => {
                event!(Level::WARN, target, ?err, "Could not take on target");
            }
        }
    }

    /// Stops the active manager and kills everything the pool still runs.
    pub async fn shutdown(&mut self) {
        if let Some(mut manager) = self.manager.take() {
            manager.stop().await;
        }
        self.pool.kill_all();
    }

    pub fn current_target(&self) -> Option<&str> {
        self.manager.as_ref().map(BatchManager::target)
    }

    pub const fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub const fn memory(&self) -> &Arc<MemoryPool> {
        &self.memory
    }

    pub const fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }
}

impl<I, NowFn> fmt::Debug for Scheduler<I, NowFn>
where
    I: InstantWrapper,
    NowFn: Fn() -> I + Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field(
                "target",
                &self.manager.as_ref().map(BatchManager::target),
            )
            .finish_non_exhaustive()
    }
}
