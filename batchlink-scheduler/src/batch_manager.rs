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

use batchlink_error::{error_if, Code, Error, ResultExt};
use batchlink_util::common::random_id;
use batchlink_util::instant_wrapper::InstantWrapper;
use batchlink_util::spawn;
use batchlink_util::task::JoinHandleDropGuard;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{event, Level};

use crate::host::{HostEnv, StartOptions, WorkMode};
use crate::memory_pool::MemoryPool;
use crate::worker_group::WorkerGroup;
use crate::worker_pool::{WorkerPool, WEAKEN_PER_THREAD};

/// Length of the ids handed to scheduled batches.
const BATCH_ID_LEN: usize = 7;

/// Picks the money fraction one batch should steal from a target.
pub trait RatioStrategy: Send + Sync {
    /// `budget_threads` is how many whole worker threads the pool currently
    /// has free; strategies may size against it or ignore it.
    fn hack_ratio(&self, pool: &WorkerPool, target: &str, budget_threads: u64) -> f64;
}

/// Always steals the same fraction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedRatio(pub f64);

impl RatioStrategy for FixedRatio {
    fn hack_ratio(&self, _pool: &WorkerPool, _target: &str, _budget_threads: u64) -> f64 {
        self.0
    }
}

/// Steals the largest fraction whose batch still fits the free thread
/// budget, found by interval halving.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadBudget;

impl ThreadBudget {
    const MIN_RATIO: f64 = 0.1;
    const MAX_RATIO: f64 = 0.95;
    const REFINE_STEPS: u32 = 10;
}

impl RatioStrategy for ThreadBudget {
    fn hack_ratio(&self, pool: &WorkerPool, target: &str, budget_threads: u64) -> f64 {
        let total_at = |ratio: f64| {
            pool.calculate_batch_ratios(target, ratio)
                .map_or(u64::MAX, |ratios| u64::from(ratios.total_threads()))
        };
        if total_at(Self::MAX_RATIO) <= budget_threads {
            return Self::MAX_RATIO;
        }
        let mut ratio = 0.5;
        for _ in 0..Self::REFINE_STEPS {
            if total_at(ratio) > budget_threads {
                ratio -= ratio / 2.0;
            } else {
                ratio += (1.0 - ratio) / 2.0;
            }
        }
        ratio.clamp(Self::MIN_RATIO, Self::MAX_RATIO)
    }
}

struct BatchHandle {
    shutdown: Arc<Notify>,
    task: JoinHandleDropGuard<()>,
}

/// Drives one target: weakens and grows it back to its baseline, then keeps
/// scheduling batches against it for as long as memory allows.
pub struct BatchManager<I: InstantWrapper, NowFn: Fn() -> I> {
    host: Arc<dyn HostEnv>,
    memory: Arc<MemoryPool>,
    pool: Arc<WorkerPool>,
    target: String,
    gap: Duration,
    ratio_strategy: Arc<dyn RatioStrategy>,
    now_fn: NowFn,
    batches: Arc<Mutex<HashMap<String, BatchHandle>>>,
}

impl<I, NowFn> BatchManager<I, NowFn>
where
    I: InstantWrapper,
    NowFn: Fn() -> I + Clone + Send + Sync + 'static,
{
    /// Refuses targets that can never produce money or that the current
    /// skill level cannot touch.
    pub fn new(
        pool: Arc<WorkerPool>,
        target: &str,
        gap: Duration,
        ratio_strategy: Arc<dyn RatioStrategy>,
        now_fn: NowFn,
    ) -> Result<Self, Error> {
        let host = pool.host().clone();
        let memory = pool.memory().clone();
        let snapshot = host.node_snapshot(target).err_tip_with_code(|_| {
            (Code::NotFound, format!("Cannot manage unknown node {target}"))
        })?;
        error_if!(
            snapshot.money_max <= 0.0,
            "{target} holds no money and cannot be batched"
        );
        error_if!(
            snapshot.required_skill > host.player_skill(),
            "{target} requires skill {} but only {} is available",
            snapshot.required_skill,
            host.player_skill()
        );
        Ok(Self {
            host,
            memory,
            pool,
            target: target.to_string(),
            gap,
            ratio_strategy,
            now_fn,
            batches: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Weakens the target to its security floor and grows its money back to
    /// maximum, as far as free memory allows in one pass. Returns whether the
    /// target ended the pass at baseline; callers keep invoking this until it
    /// does.
    pub async fn prepare(&mut self) -> Result<bool, Error> {
        let snapshot = self
            .host
            .node_snapshot(&self.target)
            .err_tip(|| format!("While preparing {}", self.target))?;
        let weaken_cost = self.host.operation_cost_gb(WorkMode::Weaken);
        let free_threads = self.memory.free_threads(weaken_cost);

        let security_deficit = snapshot.security - snapshot.min_security;
        let weaken_threads =
            (((security_deficit / WEAKEN_PER_THREAD).ceil() as u64).min(free_threads)) as u32;
        let grow_multiplier = 1.0 / (snapshot.money_available.max(1.0) / snapshot.money_max);

        let mut groups: Vec<WorkerGroup> = Vec::new();
        if weaken_threads > 0 {
            if let Some(group) = self.pool.reserve_group(WorkMode::Weaken, weaken_threads) {
                groups.push(group);
            }
        }
        if grow_multiplier > 1.0 {
            let grow_threads = (self
                .host
                .growth_analyze(&self.target, grow_multiplier)
                .ceil() as u64)
                .min(free_threads / 2) as u32;
            if let Some(grow_group) = self.pool.reserve_group(WorkMode::Grow, grow_threads) {
                let grow_security = self.host.growth_analyze_security(grow_group.threads());
                let extra_weaken =
                    (((grow_security / WEAKEN_PER_THREAD).floor() as u64).min(free_threads)) as u32;
                if let Some(group) = self.pool.reserve_group(WorkMode::Weaken, extra_weaken) {
                    groups.push(group);
                }
                groups.push(grow_group);
            }
        }
        event!(
            Level::DEBUG,
            target = %self.target,
            security_deficit,
            grow_multiplier,
            groups = groups.len(),
            "Preparation pass"
        );

        let options = StartOptions {
            target: self.target.clone(),
            auto_continue: false,
        };
        let runs = groups.iter_mut().map(|group| async {
            group.work(&options).await?;
            group.next_done().await?;
            Ok::<(), Error>(())
        });
        let results = join_all(runs).await;
        for mut group in groups {
            group.kill();
        }
        for result in results {
            result.err_tip(|| format!("While preparing {}", self.target))?;
        }
        self.is_prepared()
    }

    /// Whether the target sits at maximum money and minimum security.
    pub fn is_prepared(&self) -> Result<bool, Error> {
        let snapshot = self
            .host
            .node_snapshot(&self.target)
            .err_tip(|| format!("Lost sight of {}", self.target))?;
        Ok(snapshot.money_available >= snapshot.money_max
            && snapshot.security <= snapshot.min_security)
    }

    /// Tries to reserve and launch one more batch. `false` means the pool
    /// cannot hold another batch right now, or the target slipped off its
    /// baseline.
    pub fn schedule(&mut self) -> bool {
        let weaken_cost = self.host.operation_cost_gb(WorkMode::Weaken);
        let budget_threads = self.memory.free_threads(weaken_cost);
        let ratio = self
            .ratio_strategy
            .hack_ratio(&self.pool, &self.target, budget_threads);
        if ratio <= 0.0 {
            return false;
        }
        let Some(mut batch) =
            self.pool
                .reserve_batch(&self.target, ratio, self.gap, self.now_fn.clone())
        else {
            return false;
        };
        let batch_id = random_id(BATCH_ID_LEN);
        event!(
            Level::INFO,
            target = %self.target,
            batch_id = %batch_id,
            ratio,
            threads = batch.threads(),
            ram_gb = batch.ram_gb(),
            "Scheduled batch"
        );
        let shutdown = Arc::new(Notify::new());
        let task_shutdown = shutdown.clone();
        let task_batches = self.batches.clone();
        let run_target = self.target.clone();
        let run_id = batch_id.clone();
        let task = spawn!("batch_run", async move {
            let failure = tokio::select! {
                err = batch.run_continuously() => Some(err),
                () = task_shutdown.notified() => None,
            };
            match failure {
                Some(err) => {
                    event!(
                        Level::WARN,
                        target = %run_target,
                        batch_id = %run_id,
                        total_yield = batch.total_yield(),
                        ?err,
                        "Batch ended"
                    );
                    // An ordering failure already killed the groups; errors
                    // that bail out earlier leave them running.
                    batch.kill();
                }
                None => {
                    batch.kill();
                    event!(
                        Level::INFO,
                        target = %run_target,
                        batch_id = %run_id,
                        total_yield = batch.total_yield(),
                        "Batch stopped"
                    );
                }
            }
            drop(task_batches.lock().remove(&run_id));
        });
        self.batches
            .lock()
            .insert(batch_id, BatchHandle { shutdown, task });
        true
    }

    /// Stops every running batch, killing their workers, and waits for the
    /// batch tasks to wind down.
    pub async fn stop(&mut self) {
        let handles: Vec<(String, BatchHandle)> = self.batches.lock().drain().collect();
        for (_, handle) in &handles {
            handle.shutdown.notify_one();
        }
        for (batch_id, handle) in handles {
            if handle.task.await.is_err() {
                event!(Level::WARN, batch_id = %batch_id, "Batch task panicked during stop");
            }
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Number of batches currently in flight.
    pub fn batch_count(&self) -> usize {
        self.batches.lock().len()
    }
}

impl<I: InstantWrapper, NowFn: Fn() -> I> fmt::Debug for BatchManager<I, NowFn> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchManager")
            .field("target", &self.target)
            .field("gap", &self.gap)
            .finish_non_exhaustive()
    }
}
