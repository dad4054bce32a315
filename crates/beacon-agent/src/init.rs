// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One-shot initialization broadcast.
//!
//! `Idle` settles exactly once, to `Initialized` or `Shutdown`. Waiters that subscribe
//! after it settled see the outcome on their first poll without suspending.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitState {
    Idle,
    Initialized,
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct InitSignal {
    tx: Arc<watch::Sender<InitState>>,
}

impl Default for InitSignal {
    fn default() -> Self {
        InitSignal::new()
    }
}

impl InitSignal {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(InitState::Idle);
        InitSignal { tx: Arc::new(tx) }
    }

    #[must_use]
    pub fn state(&self) -> InitState {
        *self.tx.borrow()
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state() == InitState::Initialized
    }

    /// Settles `Idle` to `Initialized`. Returns false if already settled.
    pub fn mark_initialized(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == InitState::Idle {
                *state = InitState::Initialized;
                true
            } else {
                false
            }
        })
    }

    /// Moves to the terminal `Shutdown` state from anywhere.
    pub fn mark_shutdown(&self) {
        self.tx.send_if_modified(|state| {
            let changed = *state != InitState::Shutdown;
            *state = InitState::Shutdown;
            changed
        });
    }

    /// Waits until the state leaves `Idle`, or `timeout` runs out.
    ///
    /// Returns true only for `Initialized`. A timeout does not cancel the handshake that
    /// will eventually settle the state.
    pub async fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut rx = self.tx.subscribe();
        let settled = async move {
            rx.wait_for(|state| *state != InitState::Idle)
                .await
                .map(|state| *state == InitState::Initialized)
                .unwrap_or(false)
        };
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, settled)
                .await
                .unwrap_or(false),
            None => settled.await,
        }
    }
}
