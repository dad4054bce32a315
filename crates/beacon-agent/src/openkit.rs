// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent entry point.
//!
//! Creating an [`OpenKit`] starts the sending strategies and the global handshake in the
//! background. Sessions can be created right away; nothing they record leaves the process
//! until the handshake succeeded.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rand::Rng;
use tokio::runtime::Handle;
use tracing::{debug, error};

use crate::config::{Config, DataCollectionLevel};
use crate::init::InitState;
use crate::sender::Sender;
use crate::session::{Session, SessionInner};
use crate::state_machine::TransportStateMachine;
use crate::strategy;
use crate::transport::{HttpClient, ReqwestClient};

struct OpenKitInner {
    config: Arc<Config>,
    sender: Sender,
    visitor_id: i64,
    session_numbers: AtomicI32,
    sessions: Mutex<Vec<Weak<SessionInner>>>,
    shut_down: AtomicBool,
}

#[derive(Clone)]
pub struct OpenKit {
    inner: Arc<OpenKitInner>,
}

impl OpenKit {
    /// Builds an agent sending through reqwest.
    ///
    /// Must be called from within a tokio runtime. Outside of one the agent starts shut
    /// down and only hands out disabled sessions.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let client =
            ReqwestClient::new_or_direct(config.request_timeout, config.proxy_https.as_deref());
        OpenKit::with_client(config, Arc::new(client))
    }

    #[must_use]
    pub fn with_client(config: Config, client: Arc<dyn HttpClient>) -> Self {
        let runtime = Handle::try_current().ok();
        let config = Arc::new(config);
        let transport = TransportStateMachine::new(client, config.retry_policy.clone());
        let strategies = strategy::from_config(&config.sending_strategies);
        let sender = Sender::new(config.clone(), transport, strategies, runtime.clone());

        if runtime.is_some() {
            sender.start();
            let initializer = sender.clone();
            sender.spawn(async move {
                initializer.initialize().await;
            });
        } else {
            error!("OpenKit created outside of a tokio runtime, starting shut down");
            sender.init_signal().mark_shutdown();
        }

        // without user behavior consent the device must not be recognizable
        let visitor_id = if config.data_collection_level == DataCollectionLevel::UserBehavior {
            config.device_id
        } else {
            rand::thread_rng().gen_range(0..i64::MAX)
        };

        OpenKit {
            inner: Arc::new(OpenKitInner {
                config,
                sender,
                visitor_id,
                session_numbers: AtomicI32::new(0),
                sessions: Mutex::new(Vec::new()),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Waits for the global handshake. `None` waits indefinitely.
    ///
    /// Returns false on timeout, failed handshake or shutdown.
    pub async fn wait_for_init(&self, timeout: Option<Duration>) -> bool {
        self.inner.sender.init_signal().wait(timeout).await
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.inner.sender.init_signal().is_initialized()
    }

    /// Starts a new session. After shutdown the session is disabled.
    pub fn create_session(&self, client_ip: Option<&str>) -> Session {
        if self.inner.shut_down.load(Ordering::SeqCst)
            || self.inner.sender.init_signal().state() == InitState::Shutdown
        {
            debug!("OpenKit is shut down, returning a disabled session");
            return Session::Disabled;
        }

        let session_number = if self.inner.config.data_collection_level
            == DataCollectionLevel::UserBehavior
        {
            self.inner.session_numbers.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            1
        };
        let session = Session::start(
            &self.inner.sender,
            &self.inner.config,
            self.inner.visitor_id,
            session_number,
            client_ip,
        );

        #[allow(clippy::expect_used)]
        let mut sessions = self.inner.sessions.lock().expect("lock poisoned");
        sessions.retain(|session| session.upgrade().is_some_and(|inner| !inner.is_ended()));
        sessions.extend(session.downgrade());
        session
    }

    /// Ends all open sessions and lets every strategy do its final flush. Idempotent.
    ///
    /// Sessions only need an explicit end to be closed earlier; dropping the last handle
    /// ends a session as well.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let sessions = {
            #[allow(clippy::expect_used)]
            let mut sessions = self.inner.sessions.lock().expect("lock poisoned");
            std::mem::take(&mut *sessions)
        };
        for session in sessions.iter().filter_map(Weak::upgrade) {
            Session::Active(session).end();
        }
        self.inner.sender.shutdown().await;
        debug!("OpenKit shut down");
    }

    /// Device id sent in the beacon prefix.
    #[must_use]
    pub fn visitor_id(&self) -> i64 {
        self.inner.visitor_id
    }

    #[must_use]
    pub fn sender(&self) -> &Sender {
        &self.inner.sender
    }
}
