// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! XMPP-like server: a stream-of-stanzas protocol used by the vendor's
//! mobile app and robots for presence, bind/session setup, and forwarding
//! `com:ctl`/`com:sf` command envelopes between a controller and a bot.

mod server;
mod session;
mod stanza;

pub use server::{XmppServer, XmppServerBuilder, XmppServerConfig};
pub use session::{ClientKind, SessionOutput, SessionState, XmppSession};
pub use stanza::{parse_stanza, render_empty, render_open, split_next_unit, Stanza};
