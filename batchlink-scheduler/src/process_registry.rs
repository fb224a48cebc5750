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
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use batchlink_util::spawn;
use batchlink_util::task::JoinHandleDropGuard;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{event, Level};

use crate::host::{HostEnv, ProcessId};
use crate::memory_pool::{MemoryPool, MemoryReservation};

/// Resolves once the process it was created for is reported dead.
#[derive(Debug)]
pub struct ExitListener(watch::Receiver<bool>);

impl ExitListener {
    pub async fn wait(mut self) {
        // A closed channel means the registry itself went away, which also
        // ends the process's tracked lifetime.
        drop(self.0.wait_for(|dead| *dead).await);
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    watchers: HashMap<ProcessId, watch::Sender<bool>>,
    reservations: HashMap<ProcessId, MemoryReservation>,
    /// Processes whose death was reported before anyone registered them.
    /// Consumed by the next `started` call for that process id.
    dead: HashSet<ProcessId>,
}

/// Tracks live worker processes and the memory reservation each one owns.
///
/// Reservations are released exclusively through [`ProcessRegistry::killed`],
/// never at the moment a caller asks for a process to die. The remote side
/// only vacates its memory when it actually exits, so freeing earlier would
/// hand the same memory out twice.
#[derive(Debug)]
pub struct ProcessRegistry {
    memory: Arc<MemoryPool>,
    state: Mutex<RegistryState>,
}

impl ProcessRegistry {
    pub fn new(memory: Arc<MemoryPool>) -> Self {
        Self {
            memory,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Registers a live process and returns a listener that resolves when the
    /// process is later reported killed. Calling this again for the same
    /// process returns another listener for the same event. If the process
    /// has already been reported dead, the listener resolves immediately.
    pub fn started(&self, pid: ProcessId) -> ExitListener {
        let mut state = self.state.lock();
        if state.dead.remove(&pid) {
            let (sender, receiver) = watch::channel(true);
            drop(sender);
            return ExitListener(receiver);
        }
        let receiver = match state.watchers.entry(pid) {
            Entry::Occupied(entry) => entry.get().subscribe(),
            Entry::Vacant(entry) => {
                let (sender, receiver) = watch::channel(false);
                entry.insert(sender);
                receiver
            }
        };
        ExitListener(receiver)
    }

    /// Binds a reservation to a process, at most once. Returns `false` and
    /// releases `reservation` right away when the process already owns one or
    /// is already dead, so the ticket cannot leak either way.
    pub fn assign(&self, pid: ProcessId, reservation: MemoryReservation) -> bool {
        let rejected = {
            let mut state = self.state.lock();
            if state.dead.contains(&pid) {
                Some(reservation)
            } else {
                match state.reservations.entry(pid) {
                    Entry::Occupied(_) => Some(reservation),
                    Entry::Vacant(entry) => {
                        entry.insert(reservation);
                        None
                    }
                }
            }
        };
        let Some(reservation) = rejected else {
            return true;
        };
        event!(
            Level::WARN,
            %pid,
            hostname = reservation.hostname(),
            size_gb = reservation.size_gb(),
            "Dropping reservation that could not be bound to its process"
        );
        self.memory.free(&reservation);
        false
    }

    /// Reports a process dead. Idempotent: bookkeeping is removed, every
    /// exit listener resolves, and the bound reservation (if any) is freed
    /// exactly once.
    pub fn killed(&self, pid: ProcessId) {
        let (sender, reservation) = {
            let mut state = self.state.lock();
            let sender = state.watchers.remove(&pid);
            let reservation = state.reservations.remove(&pid);
            if sender.is_none() && reservation.is_none() {
                state.dead.insert(pid);
            }
            (sender, reservation)
        };
        if let Some(sender) = sender {
            drop(sender.send(true));
        }
        if let Some(reservation) = reservation {
            if !self.memory.free(&reservation) {
                event!(
                    Level::WARN,
                    %pid,
                    hostname = reservation.hostname(),
                    "Reservation of dead process was already freed"
                );
            }
        }
    }

    /// Process ids currently tracked as alive.
    pub fn running(&self) -> Vec<ProcessId> {
        self.state.lock().watchers.keys().copied().collect()
    }

    /// Watches the host for process exits and feeds them into [`Self::killed`].
    ///
    /// Prefers the host's push notification stream; hosts without one are
    /// polled every `poll_interval` instead. The returned guard aborts the
    /// watcher when dropped.
    pub fn spawn_exit_watcher(
        self: &Arc<Self>,
        host: Arc<dyn HostEnv>,
        poll_interval: Duration,
    ) -> JoinHandleDropGuard<()> {
        let registry = self.clone();
        if let Some(mut exit_stream) = host.take_exit_stream() {
            return spawn!("process_exit_stream", async move {
                while let Some(pid) = exit_stream.recv().await {
                    registry.killed(pid);
                }
            });
        }
        spawn!("process_exit_poll", async move {
            loop {
                tokio::time::sleep(poll_interval).await;
                for pid in registry.running() {
                    if !host.process_alive(pid) {
                        registry.killed(pid);
                    }
                }
            }
        })
    }
}
