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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use batchlink_error::Error;
use batchlink_macro::batchlink_test;
use batchlink_util::instant_wrapper::{InstantWrapper, MockInstantWrapped};
use batchlink_util::spawn;
use mock_instant::thread_local::MockClock;
use pretty_assertions::assert_eq;

async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

#[batchlink_test]
async fn mock_sleep_completes_only_when_the_clock_reaches_it() -> Result<(), Error> {
    let woke = Arc::new(AtomicBool::new(false));
    let woke_flag = woke.clone();
    let handle = spawn!("sleeper", async move {
        MockInstantWrapped::default()
            .sleep(Duration::from_millis(100))
            .await;
        woke_flag.store(true, Ordering::Release);
    });

    settle().await;
    assert!(!woke.load(Ordering::Acquire));
    MockClock::advance(Duration::from_millis(99));
    settle().await;
    assert!(!woke.load(Ordering::Acquire));
    MockClock::advance(Duration::from_millis(1));
    settle().await;
    assert!(woke.load(Ordering::Acquire));

    handle.await.unwrap();
    Ok(())
}

#[batchlink_test]
async fn mock_elapsed_tracks_the_clock() -> Result<(), Error> {
    let epoch = MockInstantWrapped::default();
    assert_eq!(epoch.elapsed(), Duration::ZERO);
    MockClock::advance(Duration::from_millis(250));
    assert_eq!(epoch.elapsed(), Duration::from_millis(250));
    Ok(())
}

#[batchlink_test]
async fn system_time_wrapper_round_trips_unix_seconds() -> Result<(), Error> {
    let at = <SystemTime as InstantWrapper>::from_secs(1_234_567_890);
    assert_eq!(at.unix_timestamp(), 1_234_567_890);
    Ok(())
}
