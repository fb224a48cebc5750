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

use batchlink_config::coordinator::CoordinatorConfig;
use batchlink_error::{Error, ResultExt};
use batchlink_scheduler::scheduler::Scheduler;
use batchlink_sim::sim_net::SimNet;
use batchlink_util::init_tracing;
use batchlink_util::instant_wrapper::default_instant_wrapper;
use clap::Parser;
use mimalloc::MiMalloc;
#[cfg(target_family = "unix")]
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tracing::{event, Level};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// Note: If these defaults change make sure you update the documentation in
// `batchlink-config/src/coordinator.rs`.
const DEFAULT_RESERVE_HOME_GB: u64 = 1024;
const DEFAULT_BATCH_GAP_MS: u64 = 50;
const DEFAULT_SWITCH_MARGIN: f64 = 1.1;
const DEFAULT_SCHEDULE_BREATHER_MS: u64 = 500;
const DEFAULT_IDLE_SLEEP_MS: u64 = 1000;

/// Batch coordinator for a simulated compute network.
#[derive(Parser, Debug)]
#[clap(
    author = "The BatchLink Authors",
    version,
    about,
    long_about = None
)]
struct Args {
    /// Config file to use.
    #[clap(value_parser)]
    config_file: String,
}

async fn get_config() -> Result<CoordinatorConfig, Box<dyn std::error::Error>> {
    let args = Args::parse();
    let json_contents = String::from_utf8(
        std::fs::read(&args.config_file)
            .err_tip(|| format!("Could not open config file {}", args.config_file))?,
    )?;
    Ok(serde_json5::from_str(&json_contents)?)
}

async fn inner_main(cfg: CoordinatorConfig, shutdown: Arc<Notify>) -> Result<(), Error> {
    let sim = Arc::new(SimNet::new(&cfg.sim));
    let mut scheduler = Scheduler::new(sim, cfg.scheduler, default_instant_wrapper)?;
    tokio::select! {
        () = scheduler.run() => {}
        () = shutdown.notified() => {}
    }
    scheduler.shutdown().await;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing()?;

    let mut cfg = futures::executor::block_on(get_config())?;

    {
        let scheduler_cfg = &mut cfg.scheduler;
        if scheduler_cfg.reserve_home_gb == 0 {
            scheduler_cfg.reserve_home_gb = DEFAULT_RESERVE_HOME_GB;
        }
        if scheduler_cfg.batch_gap_ms == 0 {
            scheduler_cfg.batch_gap_ms = DEFAULT_BATCH_GAP_MS;
        }
        if scheduler_cfg.switch_margin <= 0.0 {
            scheduler_cfg.switch_margin = DEFAULT_SWITCH_MARGIN;
        }
        if scheduler_cfg.schedule_breather_ms == 0 {
            scheduler_cfg.schedule_breather_ms = DEFAULT_SCHEDULE_BREATHER_MS;
        }
        if scheduler_cfg.idle_sleep_ms == 0 {
            scheduler_cfg.idle_sleep_ms = DEFAULT_IDLE_SLEEP_MS;
        }
    }

    #[allow(clippy::disallowed_methods)]
    {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;

        runtime.spawn(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to listen to SIGINT");
            eprintln!("User terminated process via SIGINT");
            std::process::exit(130);
        });

        let shutdown = Arc::new(Notify::new());
        #[cfg(target_family = "unix")]
        {
            let shutdown = shutdown.clone();
            runtime.spawn(async move {
                signal(SignalKind::terminate())
                    .expect("Failed to listen to SIGTERM")
                    .recv()
                    .await;
                event!(Level::WARN, "Process terminated via SIGTERM",);
                shutdown.notify_one();
            });
        }

        runtime
            .block_on(inner_main(cfg, shutdown))
            .err_tip(|| "main() function failed")?;
    }
    Ok(())
}
