// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Record types stored in the [`super::IdentityStore`].
//!
//! These mirror the document shapes the original implementation keeps in
//! its TinyDB-backed store (`bumper/models.py`, `bumper/db.py`): a bot is a
//! robot vacuum identified by `did`/`class`/`resource`, a client is an app
//! install identified by `userid`/`resource`, and a user owns both.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A robot vacuum, identified by vendor device id, device class, and
/// connection resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Vendor-assigned device id (the `did` in MQTT/XMPP addressing).
    pub did: String,
    /// Vendor device class (model family).
    pub class: String,
    /// Connection resource (e.g. `atom`).
    pub resource: String,
    /// Human-assigned name, if any.
    pub name: Option<String>,
    /// Nickname set via the app.
    pub nick: Option<String>,
    /// OEM/company identifier.
    pub company: Option<String>,
    /// Whether the device currently holds an MQTT session.
    pub mqtt_connection: bool,
    /// Whether the device currently holds an XMPP session.
    pub xmpp_connection: bool,
}

impl Device {
    /// Builds a new, disconnected device record.
    #[must_use]
    pub fn new(did: impl Into<String>, class: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            did: did.into(),
            class: class.into(),
            resource: resource.into(),
            name: None,
            nick: None,
            company: None,
            mqtt_connection: false,
            xmpp_connection: false,
        }
    }
}

/// An app install belonging to a [`User`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    /// The owning user's id.
    pub userid: String,
    /// Login realm (`ecouser.net` for the consumer app).
    pub realm: String,
    /// Connection resource, defaults to `"token"` in the original.
    pub resource: String,
    /// Whether the client currently holds an MQTT session.
    pub mqtt_connection: bool,
    /// Whether the client currently holds an XMPP session.
    pub xmpp_connection: bool,
}

impl Client {
    /// Builds a new, disconnected client record with the default resource.
    #[must_use]
    pub fn new(userid: impl Into<String>, realm: impl Into<String>) -> Self {
        Self {
            userid: userid.into(),
            realm: realm.into(),
            resource: "token".to_string(),
            mqtt_connection: false,
            xmpp_connection: false,
        }
    }
}

/// An account owning a set of devices and app clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Unique user id.
    pub userid: String,
    /// Device ids (`did`s) owned by this user.
    pub devices: Vec<String>,
    /// Client resources registered to this user.
    pub bots: Vec<String>,
}

impl User {
    /// Builds a new user with no devices or clients.
    #[must_use]
    pub fn new(userid: impl Into<String>) -> Self {
        Self {
            userid: userid.into(),
            devices: Vec::new(),
            bots: Vec::new(),
        }
    }
}

/// A login token, associated with a user and an authcode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    /// The user this token authenticates.
    pub userid: String,
    /// The opaque token value.
    pub token: String,
    /// The one-time authcode this token was minted from, if any.
    pub authcode: Option<String>,
    /// ISO-8601 expiration timestamp.
    pub expiration: DateTime<Utc>,
}

impl Token {
    /// Mints a new token for `userid`, valid for `validity_seconds` from now.
    #[must_use]
    pub fn new(userid: impl Into<String>, validity_seconds: i64) -> Self {
        Self {
            userid: userid.into(),
            token: Uuid::new_v4().simple().to_string(),
            authcode: None,
            expiration: Utc::now() + Duration::seconds(validity_seconds),
        }
    }

    /// Returns `true` if this token has expired as of `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiration
    }
}

/// An OAuth grant issued to a user (used by the vendor app's longer-lived
/// session flow).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuth {
    /// The user this grant belongs to.
    pub user_id: String,
    /// Opaque access token.
    pub access_token: String,
    /// Opaque refresh token.
    pub refresh_token: String,
    /// ISO-8601 expiration timestamp.
    pub expire_at: DateTime<Utc>,
}

impl OAuth {
    /// Mints a new grant for `user_id`, valid for `validity_days` from now.
    #[must_use]
    pub fn new(user_id: impl Into<String>, validity_days: i64) -> Self {
        Self {
            user_id: user_id.into(),
            access_token: Uuid::new_v4().simple().to_string(),
            refresh_token: Uuid::new_v4().simple().to_string(),
            expire_at: Utc::now() + Duration::days(validity_days),
        }
    }

    /// Returns `true` if this grant has expired as of `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expire_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_defaults_are_disconnected() {
        let device = Device::new("E000123", "yna5xi", "atom");
        assert!(!device.mqtt_connection);
        assert!(!device.xmpp_connection);
    }

    #[test]
    fn client_defaults_to_token_resource() {
        let client = Client::new("fuid_123", "ecouser.net");
        assert_eq!(client.resource, "token");
    }

    #[test]
    fn token_expiration_is_in_the_future() {
        let token = Token::new("fuid_123", 3600);
        assert!(!token.is_expired(Utc::now()));
        assert!(token.is_expired(Utc::now() + Duration::seconds(3601)));
    }

    #[test]
    fn oauth_expiration_uses_days() {
        let grant = OAuth::new("fuid_123", 15);
        assert!(!grant.is_expired(Utc::now()));
        assert!(grant.is_expired(Utc::now() + Duration::days(16)));
    }
}
