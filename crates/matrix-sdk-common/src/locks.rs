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

//! Re-exports of the lock types used across the crypto core.
//!
//! The core is modeled as single-threaded with respect to its cryptographic
//! state, but suspension points (network jobs, store transactions) require
//! the state to be held behind an async-aware lock rather than borrowed
//! across an `.await`.

pub use std::sync::{Mutex as StdMutex, RwLock as StdRwLock};

pub use tokio::sync::{Mutex, RwLock};
