// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Beacon protocol and transmission engine.
//!
//! Application-level events (sessions, actions, errors, crashes, web request
//! timings) are encoded into compact `key=value` fragments, queued per session,
//! assembled into size-bounded beacons and shipped to a collector endpoint.
//!
//! The pieces, leaf to root:
//! - [`encoder`]: pure event-to-fragment encoding
//! - [`payload`]: per-session fragment queue and chunk assembly
//! - [`communication_state`]: server-assigned parameters gating capture
//! - [`state_machine`]: retry, backoff and overload prevention per endpoint
//! - [`sender`]: session registry and flush orchestration
//! - [`strategy`]: pluggable policies deciding when to flush
//! - [`openkit`], [`session`], [`action`], [`web_request`]: lifecycle objects

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod action;
pub mod communication_state;
pub mod config;
pub mod constants;
pub mod encoder;
pub mod errors;
pub mod init;
pub mod openkit;
pub mod payload;
pub mod response;
pub mod sender;
pub mod session;
pub mod state_machine;
pub mod strategy;
pub mod transport;
pub mod web_request;

pub(crate) mod clock;
