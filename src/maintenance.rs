// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background sweep for expired tokens and OAuth grants.
//!
//! Grounded in `bumper/__init__.py`'s periodic `revoke_expired_tokens`/
//! `revoke_expired_oauths` timer loop, which the original schedules every
//! few seconds via `asyncio`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::identity::IdentityStore;

/// How often the sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Spawns the periodic token/OAuth expiry sweep, returning its
/// [`tokio::task::JoinHandle`] so the caller can abort it on shutdown.
pub fn spawn(identity: Arc<IdentityStore>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            match identity.sweep_expired() {
                Ok(()) => debug!("expired token/oauth sweep completed"),
                Err(e) => warn!(error = %e, "expired token/oauth sweep failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBus;

    #[tokio::test]
    async fn sweep_task_runs_without_panicking() {
        let identity = Arc::new(IdentityStore::open_in_memory(EventBus::new()).unwrap());
        let handle = spawn(identity);
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();
    }
}
