// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! User actions.
//!
//! An action's own fragment is only queued when it is left, carrying both its start and
//! end sequence numbers. Events reported on the action are queued as they happen, so they
//! precede the action fragment on the wire.
//!
//! Actions refer back to their session weakly. Once the session is gone every call is a
//! no-op.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::encoder::{Event, ReportedValue};
use crate::session::SessionInner;
use crate::web_request::{TracerInner, WebRequestTracer};

/// Shared state behind an active [`Action`].
pub struct ActionInner {
    session: Weak<SessionInner>,
    pub(crate) id: i32,
    name: String,
    start_sequence: i32,
    start_offset_ms: i64,
    closed: AtomicBool,
    tracers: Mutex<Vec<Arc<TracerInner>>>,
}

impl ActionInner {
    pub(crate) fn enter(session: &Arc<SessionInner>, id: i32, name: &str) -> Arc<ActionInner> {
        let start_sequence = session.next_sequence();
        let start_offset_ms = session.offset_ms();
        Arc::new(ActionInner {
            session: Arc::downgrade(session),
            id,
            name: name.to_string(),
            start_sequence,
            start_offset_ms,
            closed: AtomicBool::new(false),
            tracers: Mutex::new(Vec::new()),
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn take_tracers(&self) -> Vec<Arc<TracerInner>> {
        #[allow(clippy::expect_used)]
        let mut tracers = self.tracers.lock().expect("lock poisoned");
        std::mem::take(&mut *tracers)
    }

    fn leave(&self) {
        if let Some(session) = self.session.upgrade() {
            self.leave_within(&session);
        }
    }

    /// Closes the action and queues its fragment into `session`. A second call does nothing.
    pub(crate) fn leave_within(&self, session: &SessionInner) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for tracer in self.take_tracers() {
            tracer.stop_within(session, None);
        }

        let end_sequence = session.next_sequence();
        let end_offset_ms = session.offset_ms();
        session.record(Event::Action {
            name: self.name.clone(),
            id: self.id,
            parent_id: 0,
            start_sequence: self.start_sequence,
            end_sequence,
            start_offset_ms: self.start_offset_ms,
            duration_ms: (end_offset_ms - self.start_offset_ms).max(0),
        });
        session.detach_action(self.id);
        session.request_flush();
    }

    /// Closes the action without queuing anything.
    fn cancel(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for tracer in self.take_tracers() {
            tracer.discard();
        }
        if let Some(session) = self.session.upgrade() {
            session.detach_action(self.id);
        }
    }
}

#[derive(Clone)]
pub enum Action {
    Active(Arc<ActionInner>),
    /// Every call is a no-op.
    Disabled,
}

impl Action {
    /// The action and its session, while both are open.
    fn open(&self) -> Option<(&Arc<ActionInner>, Arc<SessionInner>)> {
        match self {
            Action::Active(inner) if !inner.is_closed() => {
                let session = inner.session.upgrade()?;
                Some((inner, session))
            }
            _ => None,
        }
    }

    pub fn report_event(&self, name: &str) -> &Self {
        if let Some((inner, session)) = self.open() {
            if !name.is_empty() {
                session.record(Event::NamedEvent {
                    name: name.to_string(),
                    parent_id: inner.id,
                    sequence: session.next_sequence(),
                    offset_ms: session.offset_ms(),
                });
            }
        }
        self
    }

    /// Reports an int, double or string value under `name`.
    pub fn report_value(&self, name: &str, value: impl Into<ReportedValue>) -> &Self {
        if let Some((inner, session)) = self.open() {
            if !name.is_empty() {
                session.record(Event::Value {
                    name: name.to_string(),
                    parent_id: inner.id,
                    sequence: session.next_sequence(),
                    offset_ms: session.offset_ms(),
                    value: value.into(),
                });
            }
        }
        self
    }

    pub fn report_error(&self, name: &str, code: i32) -> &Self {
        if let Some((inner, session)) = self.open() {
            if !name.is_empty() {
                session.record(Event::Error {
                    name: name.to_string(),
                    parent_id: inner.id,
                    sequence: session.next_sequence(),
                    offset_ms: session.offset_ms(),
                    code: Some(code),
                    reason: None,
                    stacktrace: None,
                    technology: None,
                });
            }
        }
        self
    }

    /// Starts timing a web request made as part of this action.
    pub fn trace_web_request(&self, url: &str) -> WebRequestTracer {
        let Some((inner, session)) = self.open() else {
            return WebRequestTracer::Disabled;
        };
        let Some(tracer) = TracerInner::start(&session, inner.id, url) else {
            return WebRequestTracer::Disabled;
        };
        #[allow(clippy::expect_used)]
        let mut tracers = inner.tracers.lock().expect("lock poisoned");
        tracers.retain(|tracer| !tracer.is_stopped());
        tracers.push(tracer.clone());
        WebRequestTracer::Active(tracer)
    }

    /// Closes the action, stopping its open tracers. Idempotent.
    pub fn leave(&self) {
        if let Action::Active(inner) = self {
            inner.leave();
        }
    }

    /// Discards the action and its open tracers without reporting them.
    pub fn cancel(&self) {
        if let Action::Active(inner) = self {
            inner.cancel();
        }
    }

    #[must_use]
    pub fn id(&self) -> Option<i32> {
        match self {
            Action::Active(inner) => Some(inner.id),
            Action::Disabled => None,
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        match self {
            Action::Active(inner) => inner.is_closed(),
            Action::Disabled => true,
        }
    }

    #[must_use]
    pub fn is_disabled(&self) -> bool {
        matches!(self, Action::Disabled)
    }
}
