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

use batchlink_error::{error_if, make_err, Code, Error};
use batchlink_util::instant_wrapper::InstantWrapper;
use tracing::{event, Level};

use crate::host::{HostEnv, StartOptions, WorkMode};
use crate::ordering::join_in_order;
use crate::worker_group::WorkerGroup;

/// The four reserved groups backing one batch.
#[derive(Debug)]
pub struct BatchGroups {
    pub hack: WorkerGroup,
    pub hack_weaken: WorkerGroup,
    pub grow: WorkerGroup,
    pub grow_weaken: WorkerGroup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Idle,
    Running,
    Completed,
    Failed,
    Killed,
}

/// One hack-weaken-grow-weaken cycle against a target, re-runnable while its
/// groups stay alive.
///
/// All four phases launch together. The hack and grow phases are delayed so
/// that each lands shortly before the weaken that cleans up after it, with
/// `gap` between adjacent landings. Every round verifies the realized
/// completion order and fails the batch when the timing slipped.
pub struct HwgwBatch<I: InstantWrapper, NowFn: Fn() -> I> {
    host: Arc<dyn HostEnv>,
    target: String,
    groups: BatchGroups,
    gap: Duration,
    /// Epoch of the round in flight, also the stamp completions are measured
    /// against.
    last_work_started: I,
    now_fn: NowFn,
    state: BatchState,
    total_yield: f64,
}

impl<I, NowFn> HwgwBatch<I, NowFn>
where
    I: InstantWrapper,
    NowFn: Fn() -> I + Send + Sync + 'static,
{
    pub fn new(
        host: Arc<dyn HostEnv>,
        target: String,
        groups: BatchGroups,
        gap: Duration,
        now_fn: NowFn,
    ) -> Self {
        Self {
            host,
            target,
            groups,
            gap,
            last_work_started: I::from_secs(0),
            now_fn,
            state: BatchState::Idle,
            total_yield: 0.0,
        }
    }

    /// Runs one full round and returns the amount the hack phase yielded.
    ///
    /// Completion order is asserted within each hack/weaken and grow/weaken
    /// pair and between the two pairs. Any failure kills the remaining
    /// groups, so a batch that errored once cannot run again.
    pub async fn work(&mut self) -> Result<f64, Error> {
        error_if!(
            matches!(self.state, BatchState::Failed | BatchState::Killed),
            "Batch against {} is dead and cannot run again",
            self.target
        );
        let hack_time = self.host.operation_duration(WorkMode::Hack, &self.target);
        let grow_time = self.host.operation_duration(WorkMode::Grow, &self.target);
        let weaken_time = self.host.operation_duration(WorkMode::Weaken, &self.target);
        if hack_time > grow_time {
            return Err(make_err!(
                Code::FailedPrecondition,
                "Hack ({}ms) outlasting grow ({}ms) on {} is not supported",
                hack_time.as_millis(),
                grow_time.as_millis(),
                self.target
            ));
        }
        let hack_delay = weaken_time.saturating_sub(hack_time + self.gap).max(self.gap);
        let grow_delay = weaken_time.saturating_sub(grow_time + self.gap).max(self.gap);

        self.state = BatchState::Running;
        self.last_work_started = (self.now_fn)();
        let options = StartOptions {
            target: self.target.clone(),
            auto_continue: false,
        };
        let now_fn = &self.now_fn;
        let epoch = &self.last_work_started;
        let BatchGroups {
            hack,
            hack_weaken,
            grow,
            grow_weaken,
        } = &mut self.groups;

        let hack_leg = async {
            now_fn().sleep(hack_delay).await;
            hack.work(&options).await?;
            hack.next_done().await
        };
        let hack_weaken_leg = async {
            hack_weaken.work(&options).await?;
            hack_weaken.next_done().await
        };
        let grow_leg = async {
            now_fn().sleep(grow_delay).await;
            grow.work(&options).await?;
            grow.next_done().await
        };
        let grow_weaken_leg = async {
            grow_weaken.work(&options).await?;
            grow_weaken.next_done().await
        };

        let hack_pair = join_in_order(epoch, "hack", "hack weaken", hack_leg, hack_weaken_leg);
        let grow_pair = join_in_order(epoch, "grow", "grow weaken", grow_leg, grow_weaken_leg);
        let outcome = join_in_order(epoch, "hack", "grow", hack_pair, grow_pair).await;

        match outcome {
            Ok(((hack_finished, _), _)) => {
                self.state = BatchState::Completed;
                self.total_yield += hack_finished.amount;
                Ok(hack_finished.amount)
            }
            Err(err) => {
                self.kill_groups();
                self.state = BatchState::Failed;
                Err(err)
            }
        }
    }

    /// Runs rounds back to back until one fails, returning the failure.
    pub async fn run_continuously(&mut self) -> Error {
        loop {
            match self.work().await {
                Ok(amount) => {
                    event!(
                        Level::INFO,
                        target = %self.target,
                        amount,
                        total_yield = self.total_yield,
                        "Batch round complete"
                    );
                }
                Err(err) => return err,
            }
        }
    }

    /// Kills all four groups and invalidates the batch.
    pub fn kill(&mut self) {
        self.kill_groups();
        self.state = BatchState::Killed;
    }

    fn kill_groups(&mut self) {
        self.groups.hack.kill();
        self.groups.hack_weaken.kill();
        self.groups.grow.kill();
        self.groups.grow_weaken.kill();
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub const fn state(&self) -> BatchState {
        self.state
    }

    /// Total amount yielded across all completed rounds.
    pub const fn total_yield(&self) -> f64 {
        self.total_yield
    }

    pub fn threads(&self) -> u32 {
        self.groups.hack.threads()
            + self.groups.hack_weaken.threads()
            + self.groups.grow.threads()
            + self.groups.grow_weaken.threads()
    }

    pub fn ram_gb(&self) -> f64 {
        self.groups.hack.ram_gb()
            + self.groups.hack_weaken.ram_gb()
            + self.groups.grow.ram_gb()
            + self.groups.grow_weaken.ram_gb()
    }
}

impl<I: InstantWrapper, NowFn: Fn() -> I> fmt::Debug for HwgwBatch<I, NowFn> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HwgwBatch")
            .field("target", &self.target)
            .field("state", &self.state)
            .field("gap", &self.gap)
            .field("total_yield", &self.total_yield)
            .finish_non_exhaustive()
    }
}
