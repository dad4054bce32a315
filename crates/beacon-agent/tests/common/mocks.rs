// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process collector standing in for the HTTP transport

use std::sync::Mutex;

use beacon_agent::errors::TransportError;
use beacon_agent::transport::{HttpClient, HttpResponse};

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedRequest {
    pub method: &'static str,
    pub url: String,
    pub body: String,
}

#[allow(dead_code)]
impl RecordedRequest {
    pub fn is_new_session_handshake(&self) -> bool {
        self.method == "GET" && self.url.ends_with("&ns=1")
    }

    /// Value of `key` in the request query string.
    pub fn query(&self, key: &str) -> Option<&str> {
        let (_, query) = self.url.split_once('?')?;
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    /// Event type codes in the beacon body, in wire order.
    pub fn event_types(&self) -> Vec<u32> {
        self.body
            .split('&')
            .filter_map(|pair| pair.strip_prefix("et="))
            .filter_map(|code| code.parse().ok())
            .collect()
    }
}

type Responder = Box<dyn Fn(&RecordedRequest) -> Result<HttpResponse, TransportError> + Send + Sync>;

/// Records every request and answers through a responder. The default answers
/// `200 type=m` to everything.
pub struct RecordingCollector {
    requests: Mutex<Vec<RecordedRequest>>,
    responder: Responder,
}

impl Default for RecordingCollector {
    fn default() -> Self {
        RecordingCollector::new(|_| Ok(HttpResponse::new(200, "type=m")))
    }
}

#[allow(dead_code)]
impl RecordingCollector {
    pub fn new(
        responder: impl Fn(&RecordedRequest) -> Result<HttpResponse, TransportError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        RecordingCollector {
            requests: Mutex::new(Vec::new()),
            responder: Box::new(responder),
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().expect("lock poisoned").clone()
    }

    pub fn beacons(&self) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.method == "POST")
            .collect()
    }

    /// Event type codes over all beacons, in send order.
    pub fn event_types(&self) -> Vec<u32> {
        self.beacons()
            .iter()
            .flat_map(RecordedRequest::event_types)
            .collect()
    }

    fn record(&self, request: RecordedRequest) -> Result<HttpResponse, TransportError> {
        let response = (self.responder)(&request);
        self.requests.lock().expect("lock poisoned").push(request);
        response
    }
}

#[async_trait::async_trait]
impl HttpClient for RecordingCollector {
    async fn get(&self, url: &str) -> Result<HttpResponse, TransportError> {
        self.record(RecordedRequest {
            method: "GET",
            url: url.to_string(),
            body: String::new(),
        })
    }

    async fn post(&self, url: &str, body: String) -> Result<HttpResponse, TransportError> {
        self.record(RecordedRequest {
            method: "POST",
            url: url.to_string(),
            body,
        })
    }
}
