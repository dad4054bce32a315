// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Session registry and flush orchestration.
//!
//! The [`Sender`] owns one [`CacheEntry`] per live session. A flush pass walks the
//! registry in registration order and, per entry:
//! 1. performs the new-session handshake if the entry is not initialized yet (or, for an
//!    immediate pass, adopts the last known server id without a round trip),
//! 2. drains all chunks the entry's payload builder produces,
//! 3. drops the entry once its session is closed and nothing is left to send.
//!
//! No session traffic leaves before the global handshake returned a valid response. A pass
//! stops at the first request the collector did not answer: the chunk in flight is lost and
//! the next pass continues with the following one. Only invalid answers disable capture.

use std::future::Future;
use std::sync::{Arc, Mutex, Weak};

use tokio::runtime::Handle;
use tracing::{debug, error, warn};

use crate::clock::now_millis;
use crate::communication_state::CommunicationState;
use crate::config::Config;
use crate::constants::{AGENT_TECHNOLOGY, AGENT_VERSION, PLATFORM_TYPE};
use crate::encoder::{EventType, Fragment};
use crate::init::InitSignal;
use crate::payload::PayloadBuilder;
use crate::response::StatusResponse;
use crate::state_machine::TransportStateMachine;
use crate::strategy::SendingStrategy;

/// Per-session registry entry.
#[derive(Debug)]
pub struct CacheEntry {
    inner: Mutex<EntryState>,
}

#[derive(Debug)]
struct EntryState {
    prefix: Fragment,
    payload: PayloadBuilder,
    state: CommunicationState,
    session_start_ms: i64,
    initialized: bool,
    closed: bool,
}

impl CacheEntry {
    fn with<R>(&self, f: impl FnOnce(&mut EntryState) -> R) -> R {
        #[allow(clippy::expect_used)]
        let mut entry = self.inner.lock().expect("lock poisoned");
        f(&mut entry)
    }

    /// Queues a fragment if this session's state permits it.
    pub fn enqueue(&self, fragment: Fragment) -> bool {
        self.with(|entry| {
            let EntryState { payload, state, .. } = entry;
            payload.enqueue(fragment, state)
        })
    }

    /// Marks the session as ended. The entry is dropped once drained.
    pub fn close(&self) {
        self.with(|entry| entry.closed = true);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.with(|entry| entry.closed)
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.with(|entry| entry.initialized)
    }

    #[must_use]
    pub fn communication_state(&self) -> CommunicationState {
        self.with(|entry| entry.state.clone())
    }

    #[must_use]
    pub fn queued(&self) -> usize {
        self.with(|entry| entry.payload.len())
    }

    pub fn set_carrier(&self, carrier: Option<String>) {
        self.with(|entry| entry.payload.set_carrier(carrier));
    }

    pub fn set_network_technology(&self, network_technology: Option<String>) {
        self.with(|entry| entry.payload.set_network_technology(network_technology));
    }

    pub fn set_connection_type(&self, connection_type: Option<String>) {
        self.with(|entry| entry.payload.set_connection_type(connection_type));
    }

    /// Applies a collector response. A session that lost capture drops what it queued.
    ///
    /// Unreachable responses change nothing.
    fn apply(&self, response: &StatusResponse) {
        self.with(|entry| {
            entry.state.update_from_response(response);
            if !entry.state.is_capture_enabled() && !entry.payload.is_empty() {
                debug!(
                    "Capture disabled, discarding {} queued fragments",
                    entry.payload.len()
                );
                entry.payload.clear();
            }
        });
    }
}

struct SenderInner {
    config: Arc<Config>,
    transport: TransportStateMachine,
    default_state: Mutex<CommunicationState>,
    entries: Mutex<Vec<Arc<CacheEntry>>>,
    flush_lock: tokio::sync::Mutex<()>,
    init: InitSignal,
    strategies: Vec<Arc<dyn SendingStrategy>>,
    runtime: Option<Handle>,
}

/// Cheap handle to the shared sender.
#[derive(Clone)]
pub struct Sender {
    inner: Arc<SenderInner>,
}

/// Non-owning handle, used by background tasks that must not keep the sender alive.
#[derive(Clone)]
pub struct WeakSender {
    inner: Weak<SenderInner>,
}

impl WeakSender {
    #[must_use]
    pub fn upgrade(&self) -> Option<Sender> {
        self.inner.upgrade().map(|inner| Sender { inner })
    }
}

impl Sender {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        transport: TransportStateMachine,
        strategies: Vec<Arc<dyn SendingStrategy>>,
        runtime: Option<Handle>,
    ) -> Self {
        Sender {
            inner: Arc::new(SenderInner {
                config,
                transport,
                default_state: Mutex::new(CommunicationState::default()),
                entries: Mutex::new(Vec::new()),
                flush_lock: tokio::sync::Mutex::new(()),
                init: InitSignal::new(),
                strategies,
                runtime,
            }),
        }
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakSender {
        WeakSender {
            inner: Arc::downgrade(&self.inner),
        }
    }

    #[must_use]
    pub fn init_signal(&self) -> &InitSignal {
        &self.inner.init
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Snapshot of the process-wide state new sessions start from.
    #[must_use]
    pub fn default_state(&self) -> CommunicationState {
        #[allow(clippy::expect_used)]
        let state = self.inner.default_state.lock().expect("lock poisoned");
        state.clone()
    }

    /// Starts every configured strategy.
    pub fn start(&self) {
        for strategy in &self.inner.strategies {
            strategy.start(self);
        }
    }

    /// Runs `future` on the runtime the sender was created on.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match &self.inner.runtime {
            Some(runtime) => {
                runtime.spawn(future);
            }
            None => error!("No tokio runtime available, dropping background task"),
        }
    }

    /// Fire-and-forget [`Sender::flush`].
    pub fn request_flush(&self) {
        let sender = self.clone();
        self.spawn(async move { sender.flush().await });
    }

    /// Global handshake. Settles the init signal exactly once.
    pub async fn initialize(&self) -> bool {
        let server_id = self.default_state().server_id();
        let response = self
            .inner
            .transport
            .get(&self.status_url(server_id, false))
            .await;

        {
            #[allow(clippy::expect_used)]
            let mut state = self.inner.default_state.lock().expect("lock poisoned");
            state.update_from_response(&response);
        }

        if response.valid {
            if self.inner.init.mark_initialized() {
                debug!("Initialized against {}", self.inner.config.endpoint);
                for strategy in &self.inner.strategies {
                    strategy.after_init(self);
                }
            }
            true
        } else {
            error!(
                "Initial handshake failed with status {}, shutting down",
                response.status_code
            );
            self.inner.init.mark_shutdown();
            false
        }
    }

    /// Adds a session to the registry. Its state starts as a clone of the default state.
    pub fn register_session(
        &self,
        prefix: Fragment,
        payload: PayloadBuilder,
        session_start_ms: i64,
    ) -> Arc<CacheEntry> {
        let entry = Arc::new(CacheEntry {
            inner: Mutex::new(EntryState {
                prefix,
                payload,
                state: self.default_state(),
                session_start_ms,
                initialized: false,
                closed: false,
            }),
        });
        #[allow(clippy::expect_used)]
        let mut entries = self.inner.entries.lock().expect("lock poisoned");
        entries.push(entry.clone());
        entry
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        #[allow(clippy::expect_used)]
        let entries = self.inner.entries.lock().expect("lock poisoned");
        entries.len()
    }

    /// Notifies strategies that a fragment of `event_type` was queued.
    pub fn notify_enqueued(&self, event_type: EventType) {
        for strategy in &self.inner.strategies {
            strategy.after_enqueue(self, event_type);
        }
    }

    /// Runs one flush pass, unless one is already running.
    pub async fn flush(&self) {
        let Ok(_guard) = self.inner.flush_lock.try_lock() else {
            debug!("Flush already in progress");
            return;
        };
        self.flush_pass(false).await;
    }

    /// Waits for any running pass, then flushes without new-session handshakes.
    pub async fn flush_immediate(&self) {
        let _guard = self.inner.flush_lock.lock().await;
        self.flush_pass(true).await;
    }

    /// Shuts every strategy down (each does its final flush) and settles `Shutdown`.
    pub async fn shutdown(&self) {
        for strategy in &self.inner.strategies {
            strategy.shutdown(self).await;
        }
        self.inner.init.mark_shutdown();
    }

    async fn flush_pass(&self, immediate: bool) {
        if !self.inner.init.is_initialized() {
            debug!("Not initialized, skipping flush");
            return;
        }

        let entries = {
            #[allow(clippy::expect_used)]
            let entries = self.inner.entries.lock().expect("lock poisoned");
            entries.clone()
        };
        for entry in entries {
            if !self.flush_entry(&entry, immediate).await {
                debug!("Collector unreachable, ending flush pass");
                break;
            }
        }
    }

    /// Returns false when the collector could not be reached.
    async fn flush_entry(&self, entry: &Arc<CacheEntry>, immediate: bool) -> bool {
        if !entry.is_initialized() {
            if immediate {
                let server_id = self.default_state().server_id();
                entry.with(|entry| {
                    entry.state.adopt_server_id(server_id);
                    entry.state.set_server_id_locked();
                    entry.initialized = true;
                });
            } else {
                let server_id = entry.with(|entry| entry.state.server_id());
                let response = self
                    .inner
                    .transport
                    .get(&self.status_url(server_id, true))
                    .await;
                if response.transport_failed {
                    warn!(
                        "New session handshake failed with status {}, retrying on next flush",
                        response.status_code
                    );
                    return false;
                }
                entry.apply(&response);
                entry.with(|entry| {
                    entry.state.set_server_id_locked();
                    entry.initialized = true;
                });
            }
        }

        let mut reachable = true;
        loop {
            let next = entry.with(|entry| {
                let transmission_time = now_millis();
                entry
                    .payload
                    .next_chunk(
                        &entry.prefix,
                        &entry.state,
                        entry.session_start_ms,
                        transmission_time,
                    )
                    .map(|chunk| (chunk, entry.state.server_id()))
            });
            let Some((chunk, server_id)) = next else {
                break;
            };

            let response = self
                .inner
                .transport
                .post(&self.beacon_url(server_id), &chunk)
                .await;
            if response.transport_failed {
                warn!(
                    "Beacon not delivered, last status {}, chunk dropped",
                    response.status_code
                );
                reachable = false;
                break;
            }
            entry.apply(&response);
            if !response.valid {
                warn!("Beacon rejected with an invalid response, capture disabled");
                break;
            }
        }

        if entry.with(|entry| entry.closed && entry.payload.is_empty()) {
            self.deregister(entry);
        }
        reachable
    }

    fn deregister(&self, entry: &Arc<CacheEntry>) {
        #[allow(clippy::expect_used)]
        let mut entries = self.inner.entries.lock().expect("lock poisoned");
        entries.retain(|e| !Arc::ptr_eq(e, entry));
    }

    fn base_url(&self, server_id: i32) -> String {
        format!(
            "{}?type=m&srvid={server_id}&app={}&va={}&pt={PLATFORM_TYPE}&tt={AGENT_TECHNOLOGY}",
            self.inner.config.endpoint,
            urlencoding::encode(&self.inner.config.application_id),
            urlencoding::encode(AGENT_VERSION),
        )
    }

    fn status_url(&self, server_id: i32, new_session: bool) -> String {
        let mut url = self.base_url(server_id);
        url.push_str("&resp=json");
        if new_session {
            url.push_str("&ns=1");
        }
        url
    }

    fn beacon_url(&self, server_id: i32) -> String {
        self.base_url(server_id)
    }
}
