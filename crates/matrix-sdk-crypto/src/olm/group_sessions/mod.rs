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

//! Megolm group sessions (half of C5/C6): the outbound session a room uses to
//! send, and the inbound sessions used to read what was sent.
//!
//! Tracking of *which* devices have received the current outbound session key
//! lives in the Encrypted Store's `devices_received_key` table
//! ([`crate::store`]), not on these types; that keeps a session object a pure
//! ratchet wrapper, mirroring how [`crate::olm::Session`] carries no
//! recipient bookkeeping either.

pub mod inbound;
pub mod outbound;

pub use inbound::{InboundGroupSession, PickledInboundGroupSession};
pub use outbound::{OutboundGroupSession, PickledOutboundGroupSession};
