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

use batchlink_error::Error;
use batchlink_macro::batchlink_test;
use batchlink_util::common::{random_id, reseed_rng_for_test};
use pretty_assertions::assert_eq;

#[batchlink_test]
async fn reseeded_generator_repeats_its_ids() -> Result<(), Error> {
    let first = random_id(7);
    reseed_rng_for_test()?;
    let replay = random_id(7);
    assert_eq!(first, replay);
    assert_eq!(first.len(), 7);
    assert!(first.chars().all(|c| c.is_ascii_alphanumeric()));
    Ok(())
}

#[batchlink_test]
async fn consecutive_ids_differ() -> Result<(), Error> {
    assert_ne!(random_id(7), random_id(7));
    Ok(())
}
