// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Event types published on the shared event bus.

use super::SessionId;

/// Events emitted by the broker, XMPP server and identity store.
///
/// These events notify subscribers (chiefly the maintenance loop and any
/// future admin surface) about session lifecycle and identity changes. All
/// session-scoped variants carry the relevant [`SessionId`].
#[derive(Debug, Clone)]
pub enum BumperEvent {
    /// A device or app session finished its CONNECT/auth handshake.
    SessionConnected {
        /// The newly connected session.
        session_id: SessionId,
        /// The client id it authenticated as.
        client_id: String,
    },

    /// A session disconnected, cleanly or otherwise.
    SessionDisconnected {
        /// The session that disconnected.
        session_id: SessionId,
        /// Error message if the disconnect was abnormal.
        error: Option<String>,
    },

    /// A message was routed between two endpoints.
    MessageRouted {
        /// The topic or stanza address it was routed on.
        topic: String,
    },

    /// The identity store evicted expired tokens or OAuth grants.
    IdentitySwept {
        /// Number of token records removed.
        tokens_removed: usize,
        /// Number of OAuth records removed.
        oauth_removed: usize,
    },
}

impl BumperEvent {
    /// Creates a session-connected event.
    #[must_use]
    pub fn session_connected(session_id: SessionId, client_id: impl Into<String>) -> Self {
        Self::SessionConnected {
            session_id,
            client_id: client_id.into(),
        }
    }

    /// Creates a session-disconnected event with no error.
    #[must_use]
    pub fn session_disconnected(session_id: SessionId) -> Self {
        Self::SessionDisconnected {
            session_id,
            error: None,
        }
    }

    /// Creates a session-disconnected event carrying an error description.
    #[must_use]
    pub fn session_disconnected_with_error(session_id: SessionId, error: impl Into<String>) -> Self {
        Self::SessionDisconnected {
            session_id,
            error: Some(error.into()),
        }
    }

    /// Returns `true` if this is a session lifecycle event.
    #[must_use]
    pub fn is_session_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::SessionConnected { .. } | Self::SessionDisconnected { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_connected_carries_client_id() {
        let id = SessionId::new();
        let event = BumperEvent::session_connected(id, "bot@bumper/atom");
        match event {
            BumperEvent::SessionConnected { client_id, .. } => {
                assert_eq!(client_id, "bot@bumper/atom");
            }
            _ => panic!("expected SessionConnected"),
        }
    }

    #[test]
    fn lifecycle_classification() {
        let id = SessionId::new();
        assert!(BumperEvent::session_connected(id, "x").is_session_lifecycle());
        assert!(BumperEvent::session_disconnected(id).is_session_lifecycle());
        assert!(!BumperEvent::IdentitySwept {
            tokens_removed: 0,
            oauth_removed: 0
        }
        .is_session_lifecycle());
    }

    #[test]
    fn disconnected_with_error() {
        let id = SessionId::new();
        let event = BumperEvent::session_disconnected_with_error(id, "reset by peer");
        if let BumperEvent::SessionDisconnected { error, .. } = event {
            assert_eq!(error, Some("reset by peer".to_string()));
        } else {
            panic!("expected SessionDisconnected");
        }
    }
}
