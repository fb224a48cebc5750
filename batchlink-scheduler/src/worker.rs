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
use std::sync::Arc;

use batchlink_error::{make_err, Code, Error};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::host::{HostEnv, ProcessId, StartOptions, WorkFinished, WorkMode, WorkerCommand};
use crate::memory_pool::MemoryReservation;
use crate::worker_pool::WorkerPool;

/// Handle to one remote work process.
///
/// The process itself outlives this handle unless [`Worker::kill`] is called.
/// Memory backing the process is owned by the process registry once spawned
/// and is released when the process dies, not when the handle drops.
pub struct Worker {
    pool: Arc<WorkerPool>,
    host: Arc<dyn HostEnv>,
    pid: ProcessId,
    mode: WorkMode,
    hostname: String,
    target: Option<String>,
    threads: u32,
    ram_gb: f64,
    done_rx: UnboundedReceiver<WorkFinished>,
}

impl Worker {
    /// Launches a process sized to `reservation` and wires it into the pool's
    /// event routing. The reservation is released on launch failure and is
    /// otherwise bound to the new process for its lifetime.
    pub(crate) fn spawn(
        pool: &Arc<WorkerPool>,
        reservation: MemoryReservation,
        mode: WorkMode,
        threads: u32,
    ) -> Result<Self, Error> {
        let host = pool.host().clone();
        let hostname = reservation.hostname().to_string();
        let ram_gb = reservation.size_gb();
        let Some(pid) = host.launch(&hostname, mode, threads) else {
            pool.memory().free(&reservation);
            return Err(make_err!(
                Code::Internal,
                "Failed to launch {threads} thread {mode} process on {hostname}"
            ));
        };
        let done_rx = pool.bind_done_channel(pid);
        pool.registry().assign(pid, reservation);
        drop(pool.registry().started(pid));
        Ok(Self {
            pool: pool.clone(),
            host,
            pid,
            mode,
            hostname,
            target: None,
            threads,
            ram_gb,
            done_rx,
        })
    }

    /// Tells the process to begin one round of work against
    /// `options.target`. Resolves once the process acknowledges, or `false`
    /// if it never does.
    pub async fn start(&mut self, options: &StartOptions) -> bool {
        let ack = self.pool.register_start_ack(self.pid);
        let command = WorkerCommand::Start {
            target: options.target.clone(),
            mode: self.mode,
            auto_continue: options.auto_continue,
        };
        if !self.host.send_command(self.pid, command) {
            self.pool.forget(self.pid);
            return false;
        }
        self.target = Some(options.target.clone());
        ack.await.unwrap_or(false)
    }

    /// Tells a paused process to repeat its previous round of work.
    pub async fn resume(&mut self) -> bool {
        let ack = self.pool.register_resume_ack(self.pid);
        if !self.host.send_command(self.pid, WorkerCommand::Resume) {
            self.pool.forget(self.pid);
            return false;
        }
        ack.await.unwrap_or(false)
    }

    /// Waits for the next completed round of work. `None` means the process
    /// is gone and no further completions can arrive.
    pub async fn next_done(&mut self) -> Option<WorkFinished> {
        self.done_rx.recv().await
    }

    /// Stops and kills the process. The registry observes the death and
    /// releases the memory bound to it.
    pub fn kill(&mut self) {
        if self.pid == ProcessId::DEAD {
            return;
        }
        self.pool.forget(self.pid);
        self.host.send_command(self.pid, WorkerCommand::Stop);
        self.host.kill(self.pid);
        self.pid = ProcessId::DEAD;
    }

    /// Checks whether the process still exists, detaching the handle from
    /// pool routing the first time it does not.
    pub fn is_running(&mut self) -> bool {
        if self.pid == ProcessId::DEAD {
            return false;
        }
        if self.host.process_alive(self.pid) {
            return true;
        }
        self.pool.forget(self.pid);
        self.pid = ProcessId::DEAD;
        false
    }

    pub const fn pid(&self) -> ProcessId {
        self.pid
    }

    pub const fn mode(&self) -> WorkMode {
        self.mode
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub const fn threads(&self) -> u32 {
        self.threads
    }

    pub const fn ram_gb(&self) -> f64 {
        self.ram_gb
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("pid", &self.pid)
            .field("mode", &self.mode)
            .field("hostname", &self.hostname)
            .field("target", &self.target)
            .field("threads", &self.threads)
            .field("ram_gb", &self.ram_gb)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} threads of {} as pid {} on {}",
            self.threads, self.mode, self.pid, self.hostname
        )?;
        if let Some(target) = &self.target {
            write!(f, " targeting {target}")?;
        }
        Ok(())
    }
}
