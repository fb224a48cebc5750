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

use core::cmp::Ordering;
use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{event, Level};

use crate::host::NodeSnapshot;

/// Ticket for a slice of one node's memory.
///
/// A ticket has exactly one owner until it is freed, either explicitly via
/// [`MemoryPool::free`] or by the process registry when the owning process
/// dies. Tickets cannot be cloned; a stale ticket whose chunk was already
/// released is rejected by `free` and `grow`.
#[derive(Debug, PartialEq)]
pub struct MemoryReservation {
    hostname: String,
    chunk_index: usize,
    generation: u64,
    size_gb: f64,
}

impl MemoryReservation {
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub const fn size_gb(&self) -> f64 {
        self.size_gb
    }
}

#[derive(Debug)]
struct Chunk {
    size_gb: f64,
    generation: u64,
}

/// Bookkeeping for one registered node.
#[derive(Debug)]
struct NodeArena {
    hostname: String,
    capacity_gb: f64,
    has_admin_rights: bool,
    chunks: Vec<Option<Chunk>>,
    free_chunks: Vec<usize>,
    /// Free memory as of the last mutation. `None` forces a full recompute,
    /// which happens after every `free` so float drift cannot accumulate.
    cached_available: Option<f64>,
    next_generation: u64,
}

impl NodeArena {
    fn new(node: &NodeSnapshot) -> Self {
        Self {
            hostname: node.hostname.clone(),
            capacity_gb: node.capacity_gb,
            has_admin_rights: node.has_admin_rights,
            chunks: Vec::new(),
            free_chunks: Vec::new(),
            cached_available: None,
            next_generation: 1,
        }
    }

    /// Returns whether anything changed. Capacity never shrinks.
    fn update(&mut self, node: &NodeSnapshot) -> bool {
        self.has_admin_rights = node.has_admin_rights;
        if self.capacity_gb < node.capacity_gb {
            let gained_gb = node.capacity_gb - self.capacity_gb;
            self.capacity_gb = node.capacity_gb;
            if let Some(cached) = self.cached_available.as_mut() {
                *cached += gained_gb;
            }
            return true;
        }
        false
    }

    fn available(&mut self) -> f64 {
        let available = match self.cached_available {
            Some(value) => value,
            None => {
                let reserved: f64 = self
                    .chunks
                    .iter()
                    .flatten()
                    .map(|chunk| chunk.size_gb)
                    .sum();
                let value = self.capacity_gb - reserved;
                self.cached_available = Some(value);
                value
            }
        };
        assert!(
            available >= 0.0,
            "negative free memory on node {}",
            self.hostname
        );
        available
    }

    fn reserve(&mut self, amount_gb: f64) -> Option<(usize, u64)> {
        if self.available() < amount_gb {
            return None;
        }
        if let Some(cached) = self.cached_available.as_mut() {
            *cached -= amount_gb;
        }
        let generation = self.next_generation;
        self.next_generation += 1;
        let chunk = Chunk {
            size_gb: amount_gb,
            generation,
        };
        let chunk_index = match self.free_chunks.pop() {
            Some(index) => {
                self.chunks[index] = Some(chunk);
                index
            }
            None => {
                self.chunks.push(Some(chunk));
                self.chunks.len() - 1
            }
        };
        Some((chunk_index, generation))
    }

    fn free(&mut self, chunk_index: usize, generation: u64) -> bool {
        let Some(slot) = self.chunks.get_mut(chunk_index) else {
            return false;
        };
        if slot
            .as_ref()
            .is_none_or(|chunk| chunk.generation != generation)
        {
            return false;
        }
        *slot = None;
        self.free_chunks.push(chunk_index);
        self.cached_available = None;
        true
    }

    fn grow(&mut self, chunk_index: usize, generation: u64, extra_gb: f64) -> bool {
        if self.available() < extra_gb {
            return false;
        }
        let Some(Some(chunk)) = self.chunks.get_mut(chunk_index) else {
            return false;
        };
        if chunk.generation != generation {
            return false;
        }
        chunk.size_gb += extra_gb;
        if let Some(cached) = self.cached_available.as_mut() {
            *cached -= extra_gb;
        }
        true
    }
}

#[derive(Debug, Default)]
struct PoolState {
    /// Arenas in registration order. The most-available scan is a stable
    /// sort, so ties resolve to the earlier registration.
    arenas: Vec<NodeArena>,
    index: HashMap<String, usize>,
}

impl PoolState {
    fn arena_mut(&mut self, hostname: &str) -> Option<&mut NodeArena> {
        let index = *self.index.get(hostname)?;
        self.arenas.get_mut(index)
    }

    /// Usable arena indices paired with their free memory, most free first.
    fn by_most_available(&mut self) -> Vec<(usize, f64)> {
        let mut ordered: Vec<(usize, f64)> = self
            .arenas
            .iter_mut()
            .enumerate()
            .filter(|(_, arena)| arena.has_admin_rights)
            .map(|(index, arena)| (index, arena.available()))
            .collect();
        ordered.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        ordered
    }

    fn total_available(&mut self) -> f64 {
        self.arenas
            .iter_mut()
            .filter(|arena| arena.has_admin_rights)
            .map(NodeArena::available)
            .sum()
    }

    fn reserve_most_available(&mut self, amount_gb: f64) -> Option<MemoryReservation> {
        for (index, _) in self.by_most_available() {
            let arena = &mut self.arenas[index];
            if let Some((chunk_index, generation)) = arena.reserve(amount_gb) {
                return Some(MemoryReservation {
                    hostname: arena.hostname.clone(),
                    chunk_index,
                    generation,
                    size_gb: amount_gb,
                });
            }
        }
        None
    }

    fn free(&mut self, reservation: &MemoryReservation) -> bool {
        let Some(arena) = self.arena_mut(&reservation.hostname) else {
            return false;
        };
        if !arena.has_admin_rights {
            return false;
        }
        arena.free(reservation.chunk_index, reservation.generation)
    }

    fn rollback(&mut self, reservations: Vec<MemoryReservation>) {
        for reservation in reservations {
            self.free(&reservation);
        }
    }
}

/// Arena-style allocator for the network's worker memory.
///
/// One arena per registered node tracks reserved chunks. Every operation is
/// one short synchronous critical section, so a check-then-reserve pair can
/// never interleave with a release it has not observed.
#[derive(Debug, Default)]
pub struct MemoryPool {
    state: Mutex<PoolState>,
}

impl MemoryPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a node, or refreshes an already known one. Returns whether
    /// anything was added or updated. Snapshots without admin rights are
    /// ignored entirely.
    pub fn register(&self, node: &NodeSnapshot) -> bool {
        if !node.has_admin_rights {
            return false;
        }
        let mut state = self.state.lock();
        if let Some(&index) = state.index.get(node.hostname.as_str()) {
            return state.arenas[index].update(node);
        }
        let index = state.arenas.len();
        state.arenas.push(NodeArena::new(node));
        state.index.insert(node.hostname.clone(), index);
        true
    }

    /// Reserves `amount_gb` on the usable node with the most free memory.
    pub fn reserve(&self, amount_gb: f64) -> Option<MemoryReservation> {
        self.state.lock().reserve_most_available(amount_gb)
    }

    /// Reserves `amount_gb` on one specific node.
    pub fn reserve_on(&self, amount_gb: f64, hostname: &str) -> Option<MemoryReservation> {
        let mut state = self.state.lock();
        let Some(arena) = state.arena_mut(hostname) else {
            event!(
                Level::ERROR,
                hostname,
                "Attempt to reserve memory on a node that was never registered"
            );
            return None;
        };
        if !arena.has_admin_rights {
            return None;
        }
        let (chunk_index, generation) = arena.reserve(amount_gb)?;
        Some(MemoryReservation {
            hostname: arena.hostname.clone(),
            chunk_index,
            generation,
            size_gb: amount_gb,
        })
    }

    /// Spreads one logical request of `amount_gb` across as many nodes as
    /// needed, filling the node with the most free memory first. Either the
    /// full amount is reserved or nothing is.
    pub fn reserve_total(&self, amount_gb: f64) -> Option<Vec<MemoryReservation>> {
        let mut state = self.state.lock();
        if state.total_available() < amount_gb {
            return None;
        }

        let mut remaining_gb = amount_gb;
        let mut reservations = Vec::new();
        for (index, available) in state.by_most_available() {
            if remaining_gb <= 0.0 {
                break;
            }
            if available <= 0.0 {
                continue;
            }
            let take_gb = remaining_gb.min(available);
            let hostname = state.arenas[index].hostname.clone();
            let Some((chunk_index, generation)) = state.arenas[index].reserve(take_gb) else {
                event!(
                    Level::ERROR,
                    hostname,
                    take_gb,
                    "Reservation accounting out of sync while spreading a request"
                );
                state.rollback(reservations);
                return None;
            };
            reservations.push(MemoryReservation {
                hostname,
                chunk_index,
                generation,
                size_gb: take_gb,
            });
            remaining_gb -= take_gb;
        }

        if remaining_gb > 0.0 {
            state.rollback(reservations);
            event!(
                Level::WARN,
                requested_gb = amount_gb,
                missing_gb = remaining_gb,
                "Not enough free memory to spread reservation"
            );
            return None;
        }
        Some(reservations)
    }

    /// Reserves memory for `threads` whole worker threads of `thread_size_gb`
    /// each, split across nodes with the most free memory first. Every
    /// returned chunk holds an integral number of threads. Fails without
    /// side effects when the request cannot be fully satisfied, which can
    /// happen even with enough aggregate memory if it is fragmented into
    /// pieces smaller than one thread.
    pub fn reserve_threads(
        &self,
        threads: u32,
        thread_size_gb: f64,
    ) -> Option<Vec<MemoryReservation>> {
        let mut state = self.state.lock();
        if state.total_available() < f64::from(threads) * thread_size_gb {
            return None;
        }

        let mut remaining = threads;
        let mut reservations = Vec::new();
        for (index, available) in state.by_most_available() {
            if remaining == 0 {
                break;
            }
            let node_threads = (available / thread_size_gb).floor() as u32;
            if node_threads == 0 {
                continue;
            }
            let use_threads = node_threads.min(remaining);
            let take_gb = f64::from(use_threads) * thread_size_gb;
            let hostname = state.arenas[index].hostname.clone();
            let Some((chunk_index, generation)) = state.arenas[index].reserve(take_gb) else {
                event!(
                    Level::ERROR,
                    hostname,
                    use_threads,
                    thread_size_gb,
                    "Reservation accounting out of sync while spreading threads"
                );
                state.rollback(reservations);
                return None;
            };
            reservations.push(MemoryReservation {
                hostname,
                chunk_index,
                generation,
                size_gb: take_gb,
            });
            remaining -= use_threads;
        }

        if remaining > 0 {
            state.rollback(reservations);
            event!(
                Level::WARN,
                threads,
                thread_size_gb,
                missing_threads = remaining,
                "Enough memory in aggregate but too fragmented for whole threads"
            );
            return None;
        }
        Some(reservations)
    }

    /// Reserves `chunks` chunks of `chunk_size_gb` each, every one placed
    /// independently on whichever node has the most free memory. All of them
    /// are rolled back if any single one cannot be placed.
    pub fn reserve_chunks(
        &self,
        chunks: u32,
        chunk_size_gb: f64,
    ) -> Option<Vec<MemoryReservation>> {
        let mut state = self.state.lock();
        let mut reservations = Vec::with_capacity(chunks as usize);
        for _ in 0..chunks {
            match state.reserve_most_available(chunk_size_gb) {
                Some(reservation) => reservations.push(reservation),
                None => {
                    state.rollback(reservations);
                    return None;
                }
            }
        }
        Some(reservations)
    }

    /// Releases a reservation. Returns `false` if the ticket is unknown or
    /// was already freed; capacity is only ever returned once per ticket.
    pub fn free(&self, reservation: &MemoryReservation) -> bool {
        self.state.lock().free(reservation)
    }

    /// Extends a reservation in place by `extra_gb`, failing if the node
    /// does not have that much free. The ticket's recorded size is updated
    /// on success.
    pub fn grow(&self, reservation: &mut MemoryReservation, extra_gb: f64) -> bool {
        let mut state = self.state.lock();
        let Some(arena) = state.arena_mut(&reservation.hostname) else {
            return false;
        };
        if !arena.has_admin_rights {
            return false;
        }
        if !arena.grow(reservation.chunk_index, reservation.generation, extra_gb) {
            return false;
        }
        reservation.size_gb += extra_gb;
        true
    }

    /// Free memory on one node, or `None` if it was never registered.
    pub fn available_on(&self, hostname: &str) -> Option<f64> {
        let mut state = self.state.lock();
        let arena = state.arena_mut(hostname)?;
        Some(arena.available())
    }

    /// Free memory summed across all usable nodes.
    pub fn total_available(&self) -> f64 {
        self.state.lock().total_available()
    }

    /// How many whole worker threads of `thread_size_gb` currently fit in
    /// the network, respecting per-node fragmentation.
    pub fn free_threads(&self, thread_size_gb: f64) -> u64 {
        let mut state = self.state.lock();
        state
            .arenas
            .iter_mut()
            .filter(|arena| arena.has_admin_rights)
            .map(|arena| (arena.available() / thread_size_gb).floor() as u64)
            .sum()
    }
}
