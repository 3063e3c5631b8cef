// Copyright 2020 The Matrix.org Foundation C.I.C.
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

//! The Olm Account and 1:1 sessions (C5): identity keys, one-time keys, and
//! the double-ratchet sessions built on top of them via `vodozemac`.

pub mod account;
pub mod group_sessions;
pub mod session;

pub use account::{IdentityKeys, PickledAccount, ReadOnlyAccount};
pub use session::{PickledSession, Session};
