// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client-id shape classification and the authentication fallback chain,
//! grounded in `bumper/mqtt/server.py`'s `authenticate()`.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{MqttError, Result};
use crate::identity::IdentityStore;

use super::topic::HELPER_BOT_CLIENT_ID;

/// The three shapes an MQTT `CONNECT` client id can take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientIdKind {
    /// The fixed HelperBot identity.
    HelperBot,
    /// A robot vacuum: `{did}@{class}.ecorobot.net/{resource}`.
    Bot {
        /// Vendor device id.
        did: String,
        /// Device class.
        class: String,
        /// Connection resource.
        resource: String,
    },
    /// An app install: `{userid}@{realm}/{resource}` where `realm` contains
    /// `ecouser`.
    AppClient {
        /// Owning user id.
        userid: String,
        /// Login realm.
        realm: String,
        /// Connection resource.
        resource: String,
    },
    /// A client id that doesn't match either `@`-delimited shape — matched
    /// against the password file (keyed by the CONNECT `username`) and,
    /// failing that, the anonymous-mode fallback, instead of being rejected
    /// outright. Matches the original's fallthrough: its `"@" in client_id`
    /// branch simply isn't taken, and the file-auth check below it runs
    /// unconditionally on whatever `username` the CONNECT carried.
    Unrecognized {
        /// The CONNECT packet's `username` field, if any.
        username: String,
    },
}

/// Classifies a raw MQTT client id by its `@`/`/`-delimited shape, matching
/// the original's bot-vs-app disambiguation: the segment after `@` is split
/// on `/` into a domain and a resource; if the domain doesn't contain
/// `ecouser` it's a robot, otherwise it's an app client.
pub fn classify_client_id(client_id: &str) -> Result<ClientIdKind> {
    if client_id == HELPER_BOT_CLIENT_ID {
        return Ok(ClientIdKind::HelperBot);
    }

    let (id_part, rest) = client_id
        .split_once('@')
        .ok_or_else(|| MqttError::UnrecognizedClientId(client_id.to_string()))?;
    let (domain, resource) = rest
        .split_once('/')
        .ok_or_else(|| MqttError::UnrecognizedClientId(client_id.to_string()))?;

    if domain.contains("ecouser") {
        Ok(ClientIdKind::AppClient {
            userid: id_part.to_string(),
            realm: domain.to_string(),
            resource: resource.to_string(),
        })
    } else {
        let class = domain.split('.').next().unwrap_or(domain).to_string();
        Ok(ClientIdKind::Bot {
            did: id_part.to_string(),
            class,
            resource: resource.to_string(),
        })
    }
}

/// An in-memory view of the bcrypt password file (`BUMPER_DATA/passwd`),
/// one `username:bcrypt_hash` pair per line, matching the original's
/// `passlib`-backed fallback.
#[derive(Debug, Default, Clone)]
pub struct PasswordFile {
    hashes: HashMap<String, String>,
}

impl PasswordFile {
    /// Loads a password file from disk. Returns an empty file if the path
    /// doesn't exist — the password-file fallback is optional.
    pub fn load(path: &Path) -> Result<Self> {
        let Ok(contents) = std::fs::read_to_string(path) else {
            return Ok(Self::default());
        };
        let mut hashes = HashMap::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some((user, hash)) = line.split_once(':') {
                hashes.insert(user.to_string(), hash.to_string());
            }
        }
        Ok(Self { hashes })
    }

    /// Verifies a username/password pair against the loaded bcrypt hashes.
    #[must_use]
    pub fn verify(&self, username: &str, password: &str) -> bool {
        self.hashes
            .get(username)
            .is_some_and(|hash| bcrypt::verify(password, hash).unwrap_or(false))
    }
}

/// Outcome of authenticating a CONNECT attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    /// Connection accepted.
    Accept,
    /// Connection rejected.
    Reject,
}

/// Runs the full authentication fallback chain for an app client: authcode
/// check (or `use_auth` disabled), then password file, then anonymous mode.
/// Matches `check_authcode(...) or not bumper.use_auth` followed by the
/// password-file and `allow-anonymous` fallbacks in the original.
pub fn authenticate_app_client(
    store: &IdentityStore,
    passwords: &PasswordFile,
    userid: &str,
    password: &str,
    use_auth: bool,
    allow_anonymous: bool,
) -> Result<AuthDecision> {
    if !use_auth || store.check_authcode(userid, password)? || store.check_token(userid, password)? {
        return Ok(AuthDecision::Accept);
    }
    if passwords.verify(userid, password) {
        return Ok(AuthDecision::Accept);
    }
    Ok(if allow_anonymous {
        AuthDecision::Accept
    } else {
        AuthDecision::Reject
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_helper_bot() {
        assert_eq!(
            classify_client_id(HELPER_BOT_CLIENT_ID).unwrap(),
            ClientIdKind::HelperBot
        );
    }

    #[test]
    fn classifies_bot_client_id() {
        let kind = classify_client_id("E0000000000000001234@159.ecorobot.net/atom").unwrap();
        assert_eq!(
            kind,
            ClientIdKind::Bot {
                did: "E0000000000000001234".to_string(),
                class: "159".to_string(),
                resource: "atom".to_string(),
            }
        );
    }

    #[test]
    fn classifies_app_client_id() {
        let kind = classify_client_id("fuid_tmpuser@ecouser.net/IOSF53D07BA").unwrap();
        assert_eq!(
            kind,
            ClientIdKind::AppClient {
                userid: "fuid_tmpuser".to_string(),
                realm: "ecouser.net".to_string(),
                resource: "IOSF53D07BA".to_string(),
            }
        );
    }

    #[test]
    fn rejects_client_id_without_at() {
        assert!(classify_client_id("no-at-sign").is_err());
    }

    #[test]
    fn password_file_missing_is_empty() {
        let file = PasswordFile::load(Path::new("/nonexistent/passwd")).unwrap();
        assert!(!file.verify("anyone", "anything"));
    }

    #[test]
    fn use_auth_disabled_accepts_everyone() {
        let store = IdentityStore::open_in_memory(crate::event::EventBus::new()).unwrap();
        let passwords = PasswordFile::default();
        let decision =
            authenticate_app_client(&store, &passwords, "fuid_1", "wrong", false, false).unwrap();
        assert_eq!(decision, AuthDecision::Accept);
    }

    #[test]
    fn anonymous_fallback_accepts_when_enabled() {
        let store = IdentityStore::open_in_memory(crate::event::EventBus::new()).unwrap();
        let passwords = PasswordFile::default();
        let decision =
            authenticate_app_client(&store, &passwords, "fuid_1", "wrong", true, true).unwrap();
        assert_eq!(decision, AuthDecision::Accept);
    }

    #[test]
    fn rejects_when_nothing_matches() {
        let store = IdentityStore::open_in_memory(crate::event::EventBus::new()).unwrap();
        let passwords = PasswordFile::default();
        let decision =
            authenticate_app_client(&store, &passwords, "fuid_1", "wrong", true, false).unwrap();
        assert_eq!(decision, AuthDecision::Reject);
    }
}
