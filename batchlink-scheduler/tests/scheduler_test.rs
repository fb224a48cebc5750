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

use std::sync::Arc;

use batchlink_config::coordinator::SchedulerSpec;
use batchlink_error::Error;
use batchlink_macro::batchlink_test;
use batchlink_scheduler::host::NodeSnapshot;
use batchlink_scheduler::scheduler::Scheduler;
use batchlink_util::instant_wrapper::MockInstantWrapped;
use pretty_assertions::assert_eq;
use utils::mock_host::{test_node, MockHost};

mod utils {
    pub(crate) mod mock_host;
}

/// A memoryless node sitting at its baseline, so it is immediately
/// schedulable once selected.
fn prepared_target(hostname: &str, money: f64) -> NodeSnapshot {
    let mut node = test_node(hostname, 0.0);
    node.money_max = money;
    node.money_available = money;
    node
}

/// Pure worker capacity. Operator ownership keeps it out of the target
/// ratings.
fn worker_node(hostname: &str, capacity_gb: f64) -> NodeSnapshot {
    let mut node = test_node(hostname, capacity_gb);
    node.operator_owned = true;
    node
}

/// The probe footprint at the built-in 0.25 ratio is ~100 GB against these
/// nodes; a 0.9 hack ratio needs ~600 GB. Sized between the two, the worker
/// node lets every target pass the selection probe while no batch can
/// actually reserve, which keeps ticks from parking on in-flight rounds.
fn config(hack_ratio: f64) -> SchedulerSpec {
    SchedulerSpec {
        hack_ratio,
        batch_gap_ms: 50,
        switch_margin: 1.1,
        schedule_breather_ms: 0,
        idle_sleep_ms: 1,
        ..Default::default()
    }
}

#[batchlink_test]
async fn switching_targets_requires_a_margin() -> Result<(), Error> {
    let host = Arc::new(MockHost::default());
    host.add_node(worker_node("home", 128.0));
    host.add_node(prepared_target("gold", 2_000_000.0));
    host.add_node(prepared_target("silver", 1_000_000.0));

    let mut scheduler = Scheduler::new(host.clone(), config(0.9), MockInstantWrapped::default)?;
    scheduler.tick().await;
    assert_eq!(scheduler.current_target(), Some("gold"));
    assert!(host.launches().is_empty());

    // 2.1e6 rates ~1.08x the incumbent, inside the 1.1 margin.
    host.update_node("silver", |node| {
        node.money_max = 2_100_000.0;
        node.money_available = 2_100_000.0;
    });
    scheduler.tick().await;
    assert_eq!(scheduler.current_target(), Some("gold"));

    // 3.2e6 rates ~2x the incumbent, well past the margin.
    host.update_node("silver", |node| {
        node.money_max = 3_200_000.0;
        node.money_available = 3_200_000.0;
    });
    scheduler.tick().await;
    assert_eq!(scheduler.current_target(), Some("silver"));
    Ok(())
}

#[batchlink_test]
async fn targets_that_cannot_fit_in_memory_are_ignored() -> Result<(), Error> {
    let host = Arc::new(MockHost::default());
    host.add_node(worker_node("home", 32.0));
    host.add_node(prepared_target("bank", 1_000_000.0));

    let mut scheduler = Scheduler::new(host.clone(), config(0.9), MockInstantWrapped::default)?;
    scheduler.tick().await;
    assert_eq!(scheduler.current_target(), None);

    host.add_node(worker_node("home", 160.0));
    scheduler.tick().await;
    assert_eq!(scheduler.current_target(), Some("bank"));
    Ok(())
}

#[batchlink_test]
async fn excluded_nodes_are_never_targeted() -> Result<(), Error> {
    let host = Arc::new(MockHost::default());
    host.add_node(worker_node("home", 128.0));
    host.add_node(prepared_target("gold", 2_000_000.0));
    host.add_node(prepared_target("silver", 1_000_000.0));

    let mut cfg = config(0.9);
    cfg.exclude_nodes = vec!["gold".to_string()];
    let mut scheduler = Scheduler::new(host.clone(), cfg, MockInstantWrapped::default)?;
    scheduler.tick().await;
    assert_eq!(scheduler.current_target(), Some("silver"));
    Ok(())
}

#[batchlink_test]
async fn operator_nodes_contribute_memory_but_are_never_targets() -> Result<(), Error> {
    let host = Arc::new(MockHost::default());
    let mut home = prepared_target("home", 2_000_000.0);
    home.capacity_gb = 128.0;
    home.operator_owned = true;
    host.add_node(home);
    host.add_node(prepared_target("silver", 1_000_000.0));

    let mut cfg = config(0.9);
    cfg.reserve_home_gb = 16;
    let mut scheduler = Scheduler::new(host.clone(), cfg, MockInstantWrapped::default)?;
    scheduler.tick().await;

    // The held-back reserve never registers, and the operator node is not
    // targeted even though it rates higher than any challenger.
    assert!((scheduler.memory().total_available() - 112.0).abs() < 1e-9);
    assert_eq!(scheduler.current_target(), Some("silver"));
    Ok(())
}
