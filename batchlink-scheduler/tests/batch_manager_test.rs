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
use std::sync::Arc;

use batchlink_error::{Code, Error};
use batchlink_macro::batchlink_test;
use batchlink_scheduler::batch_manager::{BatchManager, FixedRatio, RatioStrategy, ThreadBudget};
use batchlink_scheduler::host::{HostEnv, ProcessId, WorkMode};
use batchlink_scheduler::memory_pool::MemoryPool;
use batchlink_scheduler::process_registry::ProcessRegistry;
use batchlink_scheduler::worker_pool::WorkerPool;
use batchlink_util::instant_wrapper::MockInstantWrapped;
use batchlink_util::spawn;
use pretty_assertions::assert_eq;
use utils::mock_host::{test_node, MockHost};

mod utils {
    pub(crate) mod mock_host;
}

const GAP: Duration = Duration::from_millis(50);

fn make_pool(host: &Arc<MockHost>) -> Result<Arc<WorkerPool>, Error> {
    let memory = Arc::new(MemoryPool::new());
    for hostname in host.nodes() {
        memory.register(&host.node_snapshot(&hostname).unwrap());
    }
    let registry = Arc::new(ProcessRegistry::new(memory.clone()));
    WorkerPool::new(host.clone(), memory, registry)
}

async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

#[batchlink_test]
async fn manager_refuses_hopeless_targets() -> Result<(), Error> {
    let host = Arc::new(MockHost::default());
    host.add_node(test_node("target", 32.0));
    host.add_node(test_node("broke", 32.0));
    host.update_node("broke", |node| node.money_max = 0.0);
    host.add_node(test_node("fortress", 32.0));
    host.update_node("fortress", |node| node.required_skill = 9999);
    let pool = make_pool(&host)?;

    let err = BatchManager::new(
        pool.clone(),
        "ghost",
        GAP,
        Arc::new(FixedRatio(0.25)),
        MockInstantWrapped::default,
    )
    .unwrap_err();
    assert_eq!(err.code, Code::NotFound);

    let err = BatchManager::new(
        pool.clone(),
        "broke",
        GAP,
        Arc::new(FixedRatio(0.25)),
        MockInstantWrapped::default,
    )
    .unwrap_err();
    assert_eq!(err.code, Code::InvalidArgument);

    let err = BatchManager::new(
        pool.clone(),
        "fortress",
        GAP,
        Arc::new(FixedRatio(0.25)),
        MockInstantWrapped::default,
    )
    .unwrap_err();
    assert_eq!(err.code, Code::InvalidArgument);

    drop(BatchManager::new(
        pool,
        "target",
        GAP,
        Arc::new(FixedRatio(0.25)),
        MockInstantWrapped::default,
    )?);
    Ok(())
}

#[batchlink_test]
async fn preparing_a_prepared_target_launches_nothing() -> Result<(), Error> {
    let host = Arc::new(MockHost::default());
    host.add_node(test_node("target", 200.0));
    host.update_node("target", |node| node.money_available = node.money_max);
    let pool = make_pool(&host)?;
    let mut manager = BatchManager::new(
        pool,
        "target",
        GAP,
        Arc::new(FixedRatio(0.25)),
        MockInstantWrapped::default,
    )?;

    assert!(manager.is_prepared()?);
    assert!(manager.prepare().await?);
    assert!(host.launches().is_empty());
    Ok(())
}

#[batchlink_test]
async fn prepare_weakens_and_grows_toward_baseline() -> Result<(), Error> {
    let host = Arc::new(MockHost::default());
    host.add_node(test_node("target", 200.0));
    host.update_node("target", |node| node.security = 1.5);
    let pool = make_pool(&host)?;
    let manager = BatchManager::new(
        pool,
        "target",
        GAP,
        Arc::new(FixedRatio(0.25)),
        MockInstantWrapped::default,
    )?;
    assert!(!manager.is_prepared()?);

    let handle = spawn!("prepare", async move {
        let mut manager = manager;
        let result = manager.prepare().await;
        (manager, result)
    });
    settle().await;

    // 0.5 security over the floor takes 10 weaken threads. Doubling the money
    // wants 70 grow threads but is capped at half the 114 free, and the 0.228
    // security those 57 add gets 4 more weaken threads.
    let sized: Vec<(WorkMode, u32)> = host
        .launches()
        .iter()
        .map(|launch| (launch.mode, launch.threads))
        .collect();
    assert_eq!(
        sized,
        vec![
            (WorkMode::Weaken, 10),
            (WorkMode::Grow, 57),
            (WorkMode::Weaken, 4)
        ]
    );

    host.update_node("target", |node| {
        node.security = node.min_security;
        node.money_available = node.money_max;
    });
    host.complete(ProcessId(1), "target", 0.5);
    host.complete(ProcessId(2), "target", 1_000_000.0);
    host.complete(ProcessId(3), "target", 0.228);
    settle().await;

    let (manager, result) = handle.await.unwrap();
    assert!(result?);
    assert!(manager.is_prepared()?);
    assert!(host.alive_pids().is_empty());
    Ok(())
}

#[batchlink_test]
async fn schedule_backs_off_when_memory_is_tight() -> Result<(), Error> {
    let host = Arc::new(MockHost::default());
    host.add_node(test_node("target", 4.0));
    host.update_node("target", |node| node.money_available = node.money_max);
    let pool = make_pool(&host)?;
    let mut manager = BatchManager::new(
        pool,
        "target",
        GAP,
        Arc::new(FixedRatio(0.25)),
        MockInstantWrapped::default,
    )?;

    assert!(!manager.schedule());
    assert_eq!(manager.batch_count(), 0);
    assert!(host.alive_pids().is_empty());
    Ok(())
}

#[batchlink_test]
async fn scheduled_batch_winds_down_on_stop() -> Result<(), Error> {
    let host = Arc::new(MockHost::default());
    host.add_node(test_node("target", 200.0));
    host.update_node("target", |node| node.money_available = node.money_max);
    let pool = make_pool(&host)?;
    let mut manager = BatchManager::new(
        pool,
        "target",
        GAP,
        Arc::new(FixedRatio(0.005)),
        MockInstantWrapped::default,
    )?;

    assert!(manager.schedule());
    assert_eq!(manager.batch_count(), 1);
    assert_eq!(host.alive_pids().len(), 4);
    // Let the round dispatch its weakens; the clock never moves, so the
    // batch then idles mid-round until told to stop.
    settle().await;

    manager.stop().await;
    assert_eq!(manager.batch_count(), 0);
    assert!(host.alive_pids().is_empty());
    Ok(())
}

#[batchlink_test]
async fn thread_budget_ratio_tracks_free_threads() -> Result<(), Error> {
    let host = Arc::new(MockHost::default());
    host.add_node(test_node("target", 200.0));
    host.update_node("target", |node| node.money_available = node.money_max);
    let pool = make_pool(&host)?;
    let strategy = ThreadBudget;

    let greedy = strategy.hack_ratio(&pool, "target", 10_000);
    assert!((greedy - 0.95).abs() < 1e-9);

    let starved = strategy.hack_ratio(&pool, "target", 4);
    assert!((starved - 0.1).abs() < 1e-9);
    Ok(())
}
