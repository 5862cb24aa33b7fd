// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tests the one thing [`IdentityStore`]'s own in-memory-backed unit tests
//! can't: that records actually survive a process restart via its on-disk
//! `sled` backend.

use bumper::event::EventBus;
use bumper::identity::{Device, IdentityStore, User};

fn scratch_dir() -> std::path::PathBuf {
    std::env::temp_dir().join(format!("bumper-identity-test-{}", uuid::Uuid::new_v4()))
}

#[test]
fn bot_record_survives_reopen() {
    let dir = scratch_dir();

    {
        let store = IdentityStore::open(&dir, EventBus::new()).unwrap();
        let mut device = Device::new("E000123", "yna5xi", "atom");
        device.nick = Some("Rosie".to_string());
        store.bot_add(&device).unwrap();
    }

    let reopened = IdentityStore::open(&dir, EventBus::new()).unwrap();
    let device = reopened.bot_get("E000123").unwrap().expect("device persisted across reopen");
    assert_eq!(device.nick.as_deref(), Some("Rosie"));

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn user_devices_and_tokens_survive_reopen() {
    let dir = scratch_dir();
    let token_value;

    {
        let store = IdentityStore::open(&dir, EventBus::new()).unwrap();
        store.user_add(&User::new("fuid_1")).unwrap();
        store.user_add_device("fuid_1", "E000123").unwrap();
        let token = store.user_add_token("fuid_1", 3600).unwrap();
        store.user_add_authcode(&token.token, "ABCDEF").unwrap();
        token_value = token.token;
    }

    let reopened = IdentityStore::open(&dir, EventBus::new()).unwrap();
    let user = reopened.user_get("fuid_1").unwrap().expect("user persisted across reopen");
    assert_eq!(user.devices, vec!["E000123".to_string()]);
    assert!(reopened.check_token("fuid_1", &token_value).unwrap());
    assert!(reopened.check_authcode("fuid_1", "ABCDEF").unwrap());

    std::fs::remove_dir_all(&dir).ok();
}
