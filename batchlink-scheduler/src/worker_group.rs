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

use batchlink_error::{error_if, make_err, Code, Error, ResultExt};
use futures::future::join_all;

use crate::host::{StartOptions, WorkFinished, WorkMode};
use crate::worker::Worker;

/// A set of workers of one mode that act as a single unit.
///
/// The thread count asked of the pool may be split across several nodes, so
/// one logical operation can be backed by several processes. Either every
/// member starts a round or none keep running.
#[derive(Debug)]
pub struct WorkerGroup {
    mode: WorkMode,
    workers: Vec<Worker>,
}

impl WorkerGroup {
    pub(crate) fn new(mode: WorkMode, workers: Vec<Worker>) -> Result<Self, Error> {
        error_if!(
            workers.is_empty(),
            "Refusing to build an empty {mode} work group"
        );
        Ok(Self { mode, workers })
    }

    /// Starts one round of work on every member. If any member fails to
    /// acknowledge, the whole group is killed and an error returned, so a
    /// group is never left partially running.
    pub async fn work(&mut self, options: &StartOptions) -> Result<(), Error> {
        let acks = join_all(
            self.workers
                .iter_mut()
                .map(|worker| worker.start(options)),
        )
        .await;
        if acks.contains(&false) {
            self.kill();
            return Err(make_err!(
                Code::Aborted,
                "A {} group member failed to start, group killed",
                self.mode
            ));
        }
        Ok(())
    }

    /// Resumes a paused round on every member, with the same all-or-nothing
    /// behavior as [`WorkerGroup::work`].
    pub async fn resume(&mut self) -> Result<(), Error> {
        let acks = join_all(self.workers.iter_mut().map(Worker::resume)).await;
        if acks.contains(&false) {
            self.kill();
            return Err(make_err!(
                Code::Aborted,
                "A {} group member failed to resume, group killed",
                self.mode
            ));
        }
        Ok(())
    }

    /// Waits for every member to report its round complete and folds the
    /// reports into one, summing the amounts.
    pub async fn next_done(&mut self) -> Result<WorkFinished, Error> {
        let mode = self.mode;
        let dones = join_all(self.workers.iter_mut().map(Worker::next_done)).await;
        let mut merged: Option<WorkFinished> = None;
        for done in dones {
            let done =
                done.err_tip(|| format!("A {mode} worker died before reporting completion"))?;
            match &mut merged {
                Some(merged) => merged.amount += done.amount,
                None => merged = Some(done),
            }
        }
        merged.err_tip(|| "Work group is empty")
    }

    /// Kills every member. Memory is released through the registry as the
    /// deaths are observed.
    pub fn kill(&mut self) {
        for worker in &mut self.workers {
            worker.kill();
        }
    }

    pub const fn mode(&self) -> WorkMode {
        self.mode
    }

    pub fn threads(&self) -> u32 {
        self.workers.iter().map(Worker::threads).sum()
    }

    pub fn ram_gb(&self) -> f64 {
        self.workers.iter().map(Worker::ram_gb).sum()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl fmt::Display for WorkerGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} thread {} group across {} processes",
            self.threads(),
            self.mode,
            self.workers.len()
        )
    }
}
