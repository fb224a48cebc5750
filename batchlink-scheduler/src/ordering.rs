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

use core::future::Future;

use batchlink_error::{make_err, Code, Error, ResultExt};
use batchlink_util::instant_wrapper::InstantWrapper;
use futures::future::join;

/// Awaits two futures to completion and verifies that `earlier` finished no
/// later than `later`, measured against a shared `epoch`.
///
/// Both futures always run to completion before any verdict is reached, so a
/// failure on one side never cancels the other mid-flight. Errors from the
/// futures themselves take precedence over the ordering check and are merged
/// when both sides fail. Equal completion stamps count as ordered; only a
/// strictly earlier completion of `later` raises [`Code::OrderViolation`].
///
/// Calls nest: a wrapping call observes a nested pair completing when the
/// slower of its two members does.
pub async fn join_in_order<I, A, B, FutA, FutB>(
    epoch: &I,
    earlier_name: &str,
    later_name: &str,
    earlier: FutA,
    later: FutB,
) -> Result<(A, B), Error>
where
    I: InstantWrapper,
    FutA: Future<Output = Result<A, Error>>,
    FutB: Future<Output = Result<B, Error>>,
{
    let ((earlier_at, earlier_result), (later_at, later_result)) = join(
        async {
            let result = earlier.await;
            (epoch.elapsed(), result)
        },
        async {
            let result = later.await;
            (epoch.elapsed(), result)
        },
    )
    .await;

    let (earlier_value, later_value) = match (earlier_result, later_result) {
        (Ok(earlier_value), Ok(later_value)) => (earlier_value, later_value),
        (Err(err), Ok(_)) => {
            return Err(err).err_tip(|| format!("While awaiting {earlier_name}"));
        }
        (Ok(_), Err(err)) => {
            return Err(err).err_tip(|| format!("While awaiting {later_name}"));
        }
        (Err(earlier_err), Err(later_err)) => {
            return Err(earlier_err.merge(later_err));
        }
    };

    if later_at < earlier_at {
        return Err(make_err!(
            Code::OrderViolation,
            "{later_name} finished before {earlier_name}: {}ms",
            (earlier_at - later_at).as_millis()
        ));
    }
    Ok((earlier_value, later_value))
}
