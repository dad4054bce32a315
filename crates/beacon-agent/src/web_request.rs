// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Web request timing.
//!
//! A tracer records one outgoing request. Its [`WebRequestTracer::tag`] is meant to be
//! sent along with the request so the server side can correlate it with this session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::constants::{PROTOCOL_VERSION, THREAD_ID};
use crate::encoder::Event;
use crate::session::SessionInner;

#[derive(Debug, Default)]
struct Transfer {
    bytes_sent: Option<i64>,
    bytes_received: Option<i64>,
}

/// Shared state behind an active [`WebRequestTracer`].
pub struct TracerInner {
    session: Weak<SessionInner>,
    parent_id: i32,
    url: String,
    tag: String,
    start_sequence: i32,
    start_offset_ms: i64,
    transfer: Mutex<Transfer>,
    stopped: AtomicBool,
}

impl TracerInner {
    /// Starts a tracer under `parent_id` (0 for the session itself).
    ///
    /// The query string is not reported. Empty urls yield `None`.
    pub(crate) fn start(
        session: &Arc<SessionInner>,
        parent_id: i32,
        url: &str,
    ) -> Option<Arc<TracerInner>> {
        let url = url.split('?').next().unwrap_or_default();
        if url.is_empty() {
            debug!("Ignoring web request without a url");
            return None;
        }
        let start_sequence = session.next_sequence();
        let tag = format!(
            "MT_{PROTOCOL_VERSION}_{}_{}_{}_{}_{parent_id}_{THREAD_ID}_{start_sequence}",
            session.server_id(),
            session.visitor_id,
            session.session_number,
            urlencoding::encode(&session.application_id),
        );
        Some(Arc::new(TracerInner {
            session: Arc::downgrade(session),
            parent_id,
            url: url.to_string(),
            tag,
            start_sequence,
            start_offset_ms: session.offset_ms(),
            transfer: Mutex::new(Transfer::default()),
            stopped: AtomicBool::new(false),
        }))
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn with_transfer(&self, f: impl FnOnce(&mut Transfer)) {
        #[allow(clippy::expect_used)]
        let mut transfer = self.transfer.lock().expect("lock poisoned");
        f(&mut transfer);
    }

    fn stop(&self, response_code: Option<i32>) {
        match self.session.upgrade() {
            Some(session) => self.stop_within(&session, response_code),
            None => self.discard(),
        }
    }

    /// Queues the timing into `session`. Only the first call has an effect.
    pub(crate) fn stop_within(&self, session: &SessionInner, response_code: Option<i32>) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let (bytes_sent, bytes_received) = {
            #[allow(clippy::expect_used)]
            let transfer = self.transfer.lock().expect("lock poisoned");
            (transfer.bytes_sent, transfer.bytes_received)
        };
        let end_sequence = session.next_sequence();
        let end_offset_ms = session.offset_ms();
        session.record(Event::WebRequest {
            url: self.url.clone(),
            parent_id: self.parent_id,
            start_sequence: self.start_sequence,
            end_sequence,
            start_offset_ms: self.start_offset_ms,
            duration_ms: (end_offset_ms - self.start_offset_ms).max(0),
            bytes_sent,
            bytes_received,
            response_code,
        });
    }

    /// Marks the tracer stopped without reporting it.
    pub(crate) fn discard(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub enum WebRequestTracer {
    Active(Arc<TracerInner>),
    /// Every call is a no-op and the tag is empty.
    Disabled,
}

impl WebRequestTracer {
    /// Correlation tag: `MT_3_{server}_{device}_{session}_{app}_{parent}_1_{sequence}`.
    #[must_use]
    pub fn tag(&self) -> &str {
        match self {
            WebRequestTracer::Active(inner) => &inner.tag,
            WebRequestTracer::Disabled => "",
        }
    }

    pub fn set_bytes_sent(&self, bytes: i64) -> &Self {
        if let WebRequestTracer::Active(inner) = self {
            if !inner.is_stopped() {
                inner.with_transfer(|transfer| transfer.bytes_sent = Some(bytes));
            }
        }
        self
    }

    pub fn set_bytes_received(&self, bytes: i64) -> &Self {
        if let WebRequestTracer::Active(inner) = self {
            if !inner.is_stopped() {
                inner.with_transfer(|transfer| transfer.bytes_received = Some(bytes));
            }
        }
        self
    }

    /// Stops timing and reports the request with `response_code`. Idempotent.
    pub fn stop(&self, response_code: i32) {
        if let WebRequestTracer::Active(inner) = self {
            inner.stop(Some(response_code));
        }
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        match self {
            WebRequestTracer::Active(inner) => inner.is_stopped(),
            WebRequestTracer::Disabled => true,
        }
    }

    #[must_use]
    pub fn is_disabled(&self) -> bool {
        matches!(self, WebRequestTracer::Disabled)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{Config, DataCollectionLevel};
    use crate::session::tests::{session, session_with};

    #[tokio::test]
    async fn tag_identifies_session_parent_and_sequence() {
        let (_sender, session) = session();
        let tracer = session.trace_web_request("https://example.com/api?token=secret");
        // session start took sequence 1
        assert_eq!(tracer.tag(), "MT_3_1_7_1_app_0_1_2");

        let action = session.enter_action("load");
        let nested = action.trace_web_request("https://example.com/other");
        assert_eq!(nested.tag(), "MT_3_1_7_1_app_1_1_4");
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (_sender, session) = session();
        let tracer = session.trace_web_request("https://example.com/api");
        tracer.set_bytes_sent(10).set_bytes_received(20);
        tracer.stop(200);
        tracer.stop(500);
        assert!(tracer.is_stopped());
        assert_eq!(session.queued(), 2);
    }

    #[tokio::test]
    async fn session_end_stops_open_tracers() {
        let (_sender, session) = session();
        let tracer = session.trace_web_request("https://example.com/api");
        session.end();
        assert!(tracer.is_stopped());
        // start, web request, end
        assert_eq!(session.queued(), 3);
    }

    #[tokio::test]
    async fn empty_url_is_disabled() {
        let (_sender, session) = session();
        let tracer = session.trace_web_request("?only=query");
        assert!(tracer.is_disabled());
        assert_eq!(tracer.tag(), "");
        tracer.stop(200);
        assert_eq!(session.queued(), 1);
    }

    #[tokio::test]
    async fn data_collection_off_drops_web_requests() {
        let mut config = Config::new("http://collector/mbeacon", "app", 7);
        config.data_collection_level = DataCollectionLevel::Off;
        let (_sender, session) = session_with(config);
        let tracer = session.trace_web_request("https://example.com/api");
        tracer.stop(200);
        assert!(tracer.is_stopped());
        assert_eq!(session.queued(), 1);
    }
}
