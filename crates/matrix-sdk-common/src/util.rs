// Copyright 2021 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::{SystemTime, UNIX_EPOCH};

use ruma::{MilliSecondsSinceUnixEpoch, SecondsSinceUnixEpoch};

/// Get the current time as a [`SecondsSinceUnixEpoch`].
///
/// Saturates to `SecondsSinceUnixEpoch(0)` if the system clock is set before
/// the epoch, rather than panicking.
pub fn seconds_since_unix_epoch() -> SecondsSinceUnixEpoch {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    SecondsSinceUnixEpoch(ruma::UInt::try_from(now.as_secs()).unwrap_or(ruma::UInt::from(0u32)))
}

/// Get the current time as a [`MilliSecondsSinceUnixEpoch`].
pub fn millis_since_unix_epoch() -> MilliSecondsSinceUnixEpoch {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    MilliSecondsSinceUnixEpoch(
        ruma::UInt::try_from(now.as_millis() as u64).unwrap_or(ruma::UInt::from(0u32)),
    )
}
