// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Failure executing a request against the collector.
///
/// Never surfaced to callers of the lifecycle API: the transport state machine turns it
/// into a synthetic failure response so it flows through the same retry path as a 5xx.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to build request: {0}")]
    Request(String),
    #[error("request failed: {0}")]
    Io(String),
    #[error("request timed out")]
    Timeout,
    #[error("failed to read response body: {0}")]
    Body(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_builder() {
            TransportError::Request(err.to_string())
        } else if err.is_body() || err.is_decode() {
            TransportError::Body(err.to_string())
        } else {
            TransportError::Io(err.to_string())
        }
    }
}

/// Malformed collector response body.
#[derive(Debug, Error, PartialEq)]
pub enum ResponseError {
    #[error("missing validity marker")]
    MissingMarker,
    #[error("malformed key-value pair: {0}")]
    MalformedPair(String),
    #[error("invalid number for key {key}: {value}")]
    InvalidNumber { key: String, value: String },
    #[error("malformed json: {0}")]
    Json(String),
    #[error("collector reported status {0}")]
    Status(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} environment variable is not set")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}
