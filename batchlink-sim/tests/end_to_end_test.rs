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

use batchlink_config::coordinator::{SchedulerSpec, SimNodeConfig, SimSpec};
use batchlink_error::{make_err, Code, Error};
use batchlink_macro::batchlink_test;
use batchlink_scheduler::host::HostEnv;
use batchlink_scheduler::scheduler::Scheduler;
use batchlink_sim::sim_net::SimNet;
use batchlink_util::instant_wrapper::default_instant_wrapper;
use pretty_assertions::assert_eq;

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) -> Result<(), Error> {
    for _ in 0..2000 {
        if condition() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(3)).await;
    }
    Err(make_err!(Code::DeadlineExceeded, "Timed out waiting for {what}"))
}

/// Drives the whole stack against a simulated network: an operator node that
/// only contributes memory and one hackable target that starts off its
/// baseline.
#[batchlink_test]
async fn scheduler_preps_target_and_keeps_batches_running() -> Result<(), Error> {
    let sim = Arc::new(SimNet::new(&SimSpec {
        player_skill: 1,
        nodes: vec![
            SimNodeConfig {
                name: "home".to_string(),
                ram_gb: 64.0,
                admin_rights: true,
                operator_owned: true,
                ..Default::default()
            },
            SimNodeConfig {
                name: "n00dles".to_string(),
                admin_rights: true,
                money_max: 1_000_000.0,
                money_available: Some(900_000.0),
                min_security: 1.0,
                security: Some(1.2),
                growth_rate: 100.0,
                required_skill: 1,
                hack_time_ms: 50,
                ..Default::default()
            },
        ],
    }));
    let config = SchedulerSpec {
        reserve_home_gb: 0,
        hack_ratio: 0.25,
        batch_gap_ms: 10,
        switch_margin: 1.1,
        schedule_breather_ms: 1,
        idle_sleep_ms: 5,
        ..Default::default()
    };
    let mut scheduler = Scheduler::new(sim.clone(), config, default_instant_wrapper)?;

    let watch = async {
        wait_until("the target to reach its baseline", || {
            let snapshot = sim.node_snapshot("n00dles").unwrap();
            snapshot.money_available >= snapshot.money_max
                && snapshot.security <= snapshot.min_security
        })
        .await?;
        // A full batch means at least four worker processes in flight at
        // once; preparation alone never needs that many.
        wait_until("a batch to be in flight", || sim.process_count() >= 4).await
    };
    tokio::select! {
        () = scheduler.run() => {}
        result = watch => result?,
    }
    assert_eq!(scheduler.current_target(), Some("n00dles"));

    scheduler.shutdown().await;
    assert_eq!(sim.process_count(), 0);
    wait_until("all reservations to drain", || {
        (scheduler.memory().total_available() - 64.0).abs() < 1e-6
    })
    .await?;
    Ok(())
}
