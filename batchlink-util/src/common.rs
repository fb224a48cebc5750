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

use core::cell::RefCell;

use batchlink_error::Error;
use rand::distr::Alphanumeric;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

const TEST_RNG_SEED: u64 = 42;

thread_local! {
    static PROCESS_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_rng(&mut rand::rng()));
}

/// Reseed the process-wide id generator with a fixed seed so generated ids
/// are stable across test runs. Tests invoke this on entry.
pub fn reseed_rng_for_test() -> Result<(), Error> {
    PROCESS_RNG.with(|rng| {
        *rng.borrow_mut() = SmallRng::seed_from_u64(TEST_RNG_SEED);
    });
    Ok(())
}

/// Short alphanumeric identifier drawn from the process-wide generator.
pub fn random_id(len: usize) -> String {
    PROCESS_RNG.with(|rng| {
        let mut rng = rng.borrow_mut();
        (0..len)
            .map(|_| char::from(rng.sample(Alphanumeric)))
            .collect()
    })
}
