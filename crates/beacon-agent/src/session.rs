// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sessions: the root of the event hierarchy.
//!
//! A session owns its open actions and web request tracers. Ending it closes all of them
//! (emitting their fragments) before the session end fragment is queued. Actions and
//! tracers only hold the session weakly; dropping the last [`Session`] handle ends it.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::action::{Action, ActionInner};
use crate::clock::now_millis;
use crate::config::Config;
use crate::encoder::{encode, encode_prefix, Event, Prefix};
use crate::sender::{CacheEntry, Sender};
use crate::web_request::{TracerInner, WebRequestTracer};

/// Shared state behind an active [`Session`].
pub struct SessionInner {
    sender: Sender,
    entry: Arc<CacheEntry>,
    pub(crate) application_id: String,
    pub(crate) visitor_id: i64,
    pub(crate) session_number: i32,
    start_ms: i64,
    sequence: AtomicI32,
    action_ids: AtomicI32,
    open_actions: Mutex<Vec<Arc<ActionInner>>>,
    tracers: Mutex<Vec<Arc<TracerInner>>>,
    ended: AtomicBool,
}

impl SessionInner {
    pub(crate) fn next_sequence(&self) -> i32 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn offset_ms(&self) -> i64 {
        (now_millis() - self.start_ms).max(0)
    }

    pub(crate) fn server_id(&self) -> i32 {
        self.entry.communication_state().server_id()
    }

    pub(crate) fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Encodes and queues `event`, then lets the strategies react.
    pub(crate) fn record(&self, event: Event) {
        let event_type = event.event_type();
        if self.entry.enqueue(encode(&event)) {
            self.sender.notify_enqueued(event_type);
        }
    }

    pub(crate) fn request_flush(&self) {
        self.sender.request_flush();
    }

    pub(crate) fn detach_action(&self, id: i32) {
        #[allow(clippy::expect_used)]
        let mut actions = self.open_actions.lock().expect("lock poisoned");
        actions.retain(|action| action.id != id);
    }

    fn close(&self) {
        let actions = {
            #[allow(clippy::expect_used)]
            let mut actions = self.open_actions.lock().expect("lock poisoned");
            std::mem::take(&mut *actions)
        };
        for action in actions {
            action.leave_within(self);
        }

        let tracers = {
            #[allow(clippy::expect_used)]
            let mut tracers = self.tracers.lock().expect("lock poisoned");
            std::mem::take(&mut *tracers)
        };
        for tracer in tracers {
            tracer.stop_within(self, None);
        }

        self.record(Event::SessionEnd {
            sequence: self.next_sequence(),
            offset_ms: self.offset_ms(),
        });
        self.entry.close();
        self.request_flush();
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if !self.ended.swap(true, Ordering::SeqCst) {
            debug!("Session {} dropped without end, ending it", self.session_number);
            self.close();
        }
    }
}

#[derive(Clone)]
pub enum Session {
    Active(Arc<SessionInner>),
    /// Returned once capture is off or the agent is shut down. Every call is a no-op.
    Disabled,
}

impl Session {
    /// Registers a new session with `sender` and queues its start fragment.
    pub(crate) fn start(
        sender: &Sender,
        config: &Config,
        visitor_id: i64,
        session_number: i32,
        client_ip: Option<&str>,
    ) -> Session {
        let start_ms = now_millis();
        let prefix = encode_prefix(&Prefix {
            application_id: config.application_id.clone(),
            application_name: config.application_name.clone(),
            application_version: config.application_version.clone(),
            visitor_id,
            session_number,
            client_ip: client_ip.map(str::to_string),
            operating_system: config.operating_system.clone(),
            manufacturer: config.manufacturer.clone(),
            model_id: config.model_id.clone(),
            data_collection_level: config.data_collection_level.code(),
            crash_reporting_level: config.crash_reporting_level.code(),
        });
        let payload = crate::payload::PayloadBuilder::new(
            config.data_collection_level,
            config.crash_reporting_level,
        );
        let entry = sender.register_session(prefix, payload, start_ms);

        let inner = Arc::new(SessionInner {
            sender: sender.clone(),
            entry,
            application_id: config.application_id.clone(),
            visitor_id,
            session_number,
            start_ms,
            sequence: AtomicI32::new(0),
            action_ids: AtomicI32::new(0),
            open_actions: Mutex::new(Vec::new()),
            tracers: Mutex::new(Vec::new()),
            ended: AtomicBool::new(false),
        });
        inner.record(Event::SessionStart {
            sequence: inner.next_sequence(),
            offset_ms: 0,
        });
        debug!("Session {session_number} started");
        Session::Active(inner)
    }

    fn active(&self) -> Option<&Arc<SessionInner>> {
        match self {
            Session::Active(inner) if !inner.is_ended() => Some(inner),
            _ => None,
        }
    }

    /// Opens a root action. Empty names yield a disabled action.
    pub fn enter_action(&self, name: &str) -> Action {
        let Some(inner) = self.active() else {
            return Action::Disabled;
        };
        if name.is_empty() {
            debug!("Ignoring action without a name");
            return Action::Disabled;
        }
        let id = inner.action_ids.fetch_add(1, Ordering::SeqCst) + 1;
        let action = ActionInner::enter(inner, id, name);
        #[allow(clippy::expect_used)]
        let mut actions = inner.open_actions.lock().expect("lock poisoned");
        actions.push(action.clone());
        Action::Active(action)
    }

    /// Tags the session with a user. Empty tags are ignored.
    pub fn identify_user(&self, tag: &str) {
        let Some(inner) = self.active() else {
            return;
        };
        if tag.is_empty() {
            return;
        }
        inner.record(Event::IdentifyUser {
            tag: tag.to_string(),
            sequence: inner.next_sequence(),
            offset_ms: inner.offset_ms(),
        });
    }

    pub fn report_error(&self, name: &str, code: i32) {
        let Some(inner) = self.active() else {
            return;
        };
        if name.is_empty() {
            return;
        }
        inner.record(Event::Error {
            name: name.to_string(),
            parent_id: 0,
            sequence: inner.next_sequence(),
            offset_ms: inner.offset_ms(),
            code: Some(code),
            reason: None,
            stacktrace: None,
            technology: None,
        });
    }

    /// Reports an error carrying a cause instead of a code.
    pub fn report_error_cause(&self, name: &str, reason: Option<&str>, stacktrace: Option<&str>) {
        let Some(inner) = self.active() else {
            return;
        };
        if name.is_empty() {
            return;
        }
        inner.record(Event::Error {
            name: name.to_string(),
            parent_id: 0,
            sequence: inner.next_sequence(),
            offset_ms: inner.offset_ms(),
            code: None,
            reason: reason.map(str::to_string),
            stacktrace: stacktrace.map(str::to_string),
            technology: Some(crate::constants::CRASH_TECHNOLOGY.to_string()),
        });
    }

    pub fn report_crash(&self, name: &str, reason: Option<&str>, stacktrace: Option<&str>) {
        let Some(inner) = self.active() else {
            return;
        };
        if name.is_empty() {
            return;
        }
        inner.record(Event::Crash {
            name: name.to_string(),
            sequence: inner.next_sequence(),
            offset_ms: inner.offset_ms(),
            reason: reason.map(str::to_string),
            stacktrace: stacktrace.map(str::to_string),
        });
    }

    /// Starts timing a web request outside of any action.
    pub fn trace_web_request(&self, url: &str) -> WebRequestTracer {
        let Some(inner) = self.active() else {
            return WebRequestTracer::Disabled;
        };
        let Some(tracer) = TracerInner::start(inner, 0, url) else {
            return WebRequestTracer::Disabled;
        };
        #[allow(clippy::expect_used)]
        let mut tracers = inner.tracers.lock().expect("lock poisoned");
        tracers.retain(|tracer| !tracer.is_stopped());
        tracers.push(tracer.clone());
        WebRequestTracer::Active(tracer)
    }

    /// Sets the carrier sent with every following chunk. Empty clears it.
    pub fn report_carrier(&self, carrier: &str) {
        if let Some(inner) = self.active() {
            inner.entry.set_carrier(non_empty(carrier));
        }
    }

    pub fn report_network_technology(&self, technology: &str) {
        if let Some(inner) = self.active() {
            inner.entry.set_network_technology(non_empty(technology));
        }
    }

    pub fn report_connection_type(&self, connection_type: &str) {
        if let Some(inner) = self.active() {
            inner.entry.set_connection_type(non_empty(connection_type));
        }
    }

    /// Ends the session. Idempotent.
    pub fn end(&self) {
        let Session::Active(inner) = self else {
            return;
        };
        if inner.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.close();
    }

    #[must_use]
    pub fn is_ended(&self) -> bool {
        match self {
            Session::Active(inner) => inner.is_ended(),
            Session::Disabled => true,
        }
    }

    #[must_use]
    pub fn is_disabled(&self) -> bool {
        matches!(self, Session::Disabled)
    }

    pub(crate) fn downgrade(&self) -> Option<Weak<SessionInner>> {
        match self {
            Session::Active(inner) => Some(Arc::downgrade(inner)),
            Session::Disabled => None,
        }
    }

    #[must_use]
    pub fn session_number(&self) -> Option<i32> {
        match self {
            Session::Active(inner) => Some(inner.session_number),
            Session::Disabled => None,
        }
    }

    /// Number of fragments waiting to be sent.
    #[must_use]
    pub fn queued(&self) -> usize {
        match self {
            Session::Active(inner) => inner.entry.queued(),
            Session::Disabled => 0,
        }
    }

    #[must_use]
    pub fn open_actions(&self) -> usize {
        match self {
            Session::Active(inner) => {
                #[allow(clippy::expect_used)]
                let actions = inner.open_actions.lock().expect("lock poisoned");
                actions.len()
            }
            Session::Disabled => 0,
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use super::*;
    use crate::state_machine::tests::ScriptedClient;
    use crate::state_machine::{RetryPolicy, TransportStateMachine};

    /// A sender with no strategies whose queue can be inspected through `Session::queued`.
    pub(crate) fn session_with(config: Config) -> (Sender, Session) {
        let config = Arc::new(config);
        let transport =
            TransportStateMachine::new(Arc::new(ScriptedClient::default()), RetryPolicy::default());
        let sender = Sender::new(
            config.clone(),
            transport,
            Vec::new(),
            Some(tokio::runtime::Handle::current()),
        );
        let session = Session::start(&sender, &config, 7, 1, None);
        (sender, session)
    }

    pub(crate) fn session() -> (Sender, Session) {
        session_with(Config::new("http://collector/mbeacon", "app", 7))
    }

    #[tokio::test]
    async fn start_queues_session_start() {
        let (sender, session) = session();
        assert_eq!(session.queued(), 1);
        assert_eq!(sender.session_count(), 1);
        assert_eq!(session.session_number(), Some(1));
    }

    #[tokio::test]
    async fn end_closes_actions_then_queues_session_end() {
        let (_sender, session) = session();
        let first = session.enter_action("a");
        let _second = session.enter_action("b");
        first.leave();
        assert_eq!(session.open_actions(), 1);

        session.end();
        assert!(session.is_ended());
        assert_eq!(session.open_actions(), 0);
        // start, a, b, end
        assert_eq!(session.queued(), 4);

        session.end();
        assert_eq!(session.queued(), 4);
    }

    #[tokio::test]
    async fn calls_after_end_are_ignored() {
        let (_sender, session) = session();
        session.end();
        session.identify_user("u");
        session.report_error("e", 1);
        assert!(session.enter_action("a").is_disabled());
        assert!(session.trace_web_request("http://x").is_disabled());
        assert_eq!(session.queued(), 2);
    }

    #[tokio::test]
    async fn empty_names_are_ignored() {
        let (_sender, session) = session();
        assert!(session.enter_action("").is_disabled());
        session.identify_user("");
        session.report_crash("", None, None);
        assert_eq!(session.queued(), 1);
    }

    #[tokio::test]
    async fn crash_is_gated_by_crash_reporting_level() {
        let mut config = Config::new("http://collector/mbeacon", "app", 7);
        config.crash_reporting_level = crate::config::CrashReportingLevel::OptOutCrashes;
        let (_sender, session) = session_with(config);
        session.report_crash("boom", Some("reason"), Some("trace"));
        session.report_error("err", 3);
        assert_eq!(session.queued(), 2);
    }

    #[tokio::test]
    async fn disabled_session_is_inert() {
        let session = Session::Disabled;
        session.identify_user("u");
        session.end();
        assert!(session.is_ended());
        assert_eq!(session.queued(), 0);
        assert!(session.enter_action("a").is_disabled());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_last_handle_ends_the_session() {
        let (sender, session) = session();
        assert!(sender.initialize().await);
        let action = session.enter_action("a");
        let tracer = action.trace_web_request("https://example.com/api");
        let nested = session.enter_action("b");

        drop(session);
        assert!(action.is_closed());
        assert!(nested.is_closed());
        assert!(tracer.is_stopped());

        sender.flush().await;
        assert_eq!(sender.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn end_drains_through_the_sender() {
        let (sender, session) = session();
        assert!(sender.initialize().await);
        session.identify_user("jane");
        session.end();
        // let the requested flush run
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(session.queued(), 0);
        assert_eq!(sender.session_count(), 0);
    }
}
