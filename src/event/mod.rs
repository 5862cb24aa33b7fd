// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Event system for session and identity changes.
//!
//! This module provides a pub/sub event system for notifying subscribers
//! about session lifecycle and identity-store changes. The [`EventBus`] uses
//! tokio's broadcast channel to allow multiple subscribers to receive events.
//!
//! # Examples
//!
//! ```
//! use bumper::event::{SessionId, BumperEvent, EventBus};
//!
//! let bus = EventBus::new();
//!
//! // Subscribe to events
//! let mut rx = bus.subscribe();
//!
//! // Publish an event
//! let session_id = SessionId::new();
//! bus.publish(BumperEvent::session_connected(session_id, "helperbot@bumper/helperbot"));
//! ```

mod bumper_event;
mod event_bus;
mod session_id;

pub use bumper_event::BumperEvent;
pub use event_bus::EventBus;
pub use session_id::SessionId;
