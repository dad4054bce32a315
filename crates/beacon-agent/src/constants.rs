// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Beacon protocol tokens and default limits.
//!
//! Keys are fixed two-character tokens. They are never derived from user input,
//! so they are written to the wire without escaping.

use std::time::Duration;

/// Protocol version sent as `vv` in every beacon prefix.
pub const PROTOCOL_VERSION: u32 = 3;
/// Agent version sent as `va`.
pub const AGENT_VERSION: &str = "0.1.0";
/// Platform type sent as `pt`.
pub const PLATFORM_TYPE: u32 = 1;
/// Agent technology token sent as `tt` on requests and in the prefix.
pub const AGENT_TECHNOLOGY: &str = "okrs";
/// Visit store version sent as `vs` in the mutable header.
pub const VISIT_STORE_VERSION: u32 = 2;
/// Thread id reported with every event. There is only one logical thread.
pub const THREAD_ID: u32 = 1;
/// Technology type reported with crashes (`tt`): custom.
pub const CRASH_TECHNOLOGY: &str = "c";

pub const DEFAULT_SERVER_ID: i32 = 1;
pub const DEFAULT_MULTIPLICITY: i32 = 1;
pub const DEFAULT_MAX_BEACON_SIZE_BYTES: usize = 30 * 1024;
pub const DEFAULT_TRAFFIC_CONTROL_PERCENTAGE: i32 = 100;

/// Default per-field string limit, in characters.
pub const MAX_NAME_LEN: usize = 250;
/// Limit for free-text reason fields, in characters.
pub const MAX_REASON_LEN: usize = 1_000;
/// Limit for stack traces, in characters. Truncation happens on a line boundary.
pub const MAX_STACKTRACE_LEN: usize = 128_000;

/// Backoff applied between attempts of a single request. 3 attempts in total.
pub const DEFAULT_RETRY_DELAYS: [Duration; 2] = [Duration::from_secs(1), Duration::from_secs(2)];
/// Overload cooldown used when the collector omits `Retry-After`.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_SEND_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) mod keys {
    // prefix
    pub const PROTOCOL_VERSION: &str = "vv";
    pub const AGENT_VERSION: &str = "va";
    pub const APPLICATION_ID: &str = "ap";
    pub const APPLICATION_NAME: &str = "an";
    pub const APPLICATION_VERSION: &str = "vn";
    pub const PLATFORM_TYPE: &str = "pt";
    pub const AGENT_TECHNOLOGY: &str = "tt";
    pub const VISITOR_ID: &str = "vi";
    pub const SESSION_NUMBER: &str = "sn";
    pub const CLIENT_IP: &str = "ip";
    pub const OPERATING_SYSTEM: &str = "os";
    pub const MANUFACTURER: &str = "mf";
    pub const MODEL_ID: &str = "md";
    pub const DATA_COLLECTION_LEVEL: &str = "dl";
    pub const CRASH_REPORTING_LEVEL: &str = "cl";

    // mutable header
    pub const VISIT_STORE_VERSION: &str = "vs";
    pub const SESSION_START_TIME: &str = "tv";
    pub const TRANSMISSION_TIME: &str = "tx";
    pub const MULTIPLICITY: &str = "mp";
    pub const CARRIER: &str = "cr";
    pub const NETWORK_TECHNOLOGY: &str = "np";
    pub const CONNECTION_TYPE: &str = "ct";

    // events
    pub const EVENT_TYPE: &str = "et";
    pub const NAME: &str = "na";
    pub const THREAD_ID: &str = "it";
    pub const ACTION_ID: &str = "ca";
    pub const PARENT_ACTION_ID: &str = "pa";
    pub const START_SEQUENCE: &str = "s0";
    pub const TIME_0: &str = "t0";
    pub const END_SEQUENCE: &str = "s1";
    pub const TIME_1: &str = "t1";
    pub const VALUE: &str = "vl";
    pub const ERROR_VALUE: &str = "ev";
    pub const REASON: &str = "rs";
    pub const STACKTRACE: &str = "st";
    pub const TECHNOLOGY_TYPE: &str = "tt";
    pub const BYTES_SENT: &str = "bs";
    pub const BYTES_RECEIVED: &str = "br";
    pub const RESPONSE_CODE: &str = "rc";
}
