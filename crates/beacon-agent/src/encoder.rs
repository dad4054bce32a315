// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire encoding of semantic events.
//!
//! Every event becomes one [`Fragment`]: an `&`-joined list of `key=value` pairs with
//! percent-encoded values. The field order of each event kind is fixed and part of the
//! wire contract, so each builder below appends its fields in a set order.
//!
//! Strings are truncated before encoding: names to [`MAX_NAME_LEN`] characters, reasons to
//! [`MAX_REASON_LEN`] and stack traces to [`MAX_STACKTRACE_LEN`] on a line boundary.
//! Absent optional values omit their key altogether.

use std::borrow::Cow;
use std::fmt::{self, Display};

use serde::Deserialize;

use crate::constants::{
    keys, AGENT_TECHNOLOGY, AGENT_VERSION, CRASH_TECHNOLOGY, MAX_NAME_LEN, MAX_REASON_LEN,
    MAX_STACKTRACE_LEN, PLATFORM_TYPE, PROTOCOL_VERSION, THREAD_ID, VISIT_STORE_VERSION,
};

/// Delimiter joining key-value pairs and fragments.
pub const DELIMITER: char = '&';

/// Stable discriminant embedded in every event fragment as `et`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    ManualAction,
    NamedEvent,
    ValueString,
    ValueInt,
    ValueDouble,
    SessionStart,
    SessionEnd,
    WebRequest,
    Error,
    Crash,
    IdentifyUser,
}

impl EventType {
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            EventType::ManualAction => 1,
            EventType::NamedEvent => 10,
            EventType::ValueString => 11,
            EventType::ValueInt => 12,
            EventType::ValueDouble => 13,
            EventType::SessionStart => 18,
            EventType::SessionEnd => 19,
            EventType::WebRequest => 30,
            EventType::Error => 40,
            EventType::Crash => 50,
            EventType::IdentifyUser => 60,
        }
    }

    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        let event_type = match code {
            1 => EventType::ManualAction,
            10 => EventType::NamedEvent,
            11 => EventType::ValueString,
            12 => EventType::ValueInt,
            13 => EventType::ValueDouble,
            18 => EventType::SessionStart,
            19 => EventType::SessionEnd,
            30 => EventType::WebRequest,
            40 => EventType::Error,
            50 => EventType::Crash,
            60 => EventType::IdentifyUser,
            _ => return None,
        };
        Some(event_type)
    }
}

/// One encoded event, or any other encoded run of key-value pairs (prefix, header).
///
/// Immutable once built.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Fragment(String);

impl Fragment {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Length in bytes, which is what the beacon size budget is measured in.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Recovers the event kind by scanning for the `et` pair only.
    #[must_use]
    pub fn event_type(&self) -> Option<EventType> {
        self.0
            .split(DELIMITER)
            .find_map(|pair| pair.strip_prefix("et="))
            .and_then(|code| code.parse().ok())
            .and_then(EventType::from_code)
    }
}

impl Display for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A reported value: strings become `ValueString`, numbers `ValueInt`/`ValueDouble`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ReportedValue {
    Int(i64),
    Double(f64),
    Str(String),
}

impl ReportedValue {
    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self {
            ReportedValue::Int(_) => EventType::ValueInt,
            ReportedValue::Double(_) => EventType::ValueDouble,
            ReportedValue::Str(_) => EventType::ValueString,
        }
    }
}

impl From<i64> for ReportedValue {
    fn from(value: i64) -> Self {
        ReportedValue::Int(value)
    }
}

impl From<i32> for ReportedValue {
    fn from(value: i32) -> Self {
        ReportedValue::Int(i64::from(value))
    }
}

impl From<f64> for ReportedValue {
    fn from(value: f64) -> Self {
        ReportedValue::Double(value)
    }
}

impl From<&str> for ReportedValue {
    fn from(value: &str) -> Self {
        ReportedValue::Str(value.to_string())
    }
}

impl From<String> for ReportedValue {
    fn from(value: String) -> Self {
        ReportedValue::Str(value)
    }
}

/// Semantic events produced by the lifecycle objects.
///
/// Offsets (`offset_ms`) are milliseconds since session start; durations are milliseconds.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    SessionStart {
        sequence: i32,
        offset_ms: i64,
    },
    SessionEnd {
        sequence: i32,
        offset_ms: i64,
    },
    Action {
        name: String,
        id: i32,
        parent_id: i32,
        start_sequence: i32,
        end_sequence: i32,
        start_offset_ms: i64,
        duration_ms: i64,
    },
    NamedEvent {
        name: String,
        parent_id: i32,
        sequence: i32,
        offset_ms: i64,
    },
    Value {
        name: String,
        parent_id: i32,
        sequence: i32,
        offset_ms: i64,
        value: ReportedValue,
    },
    IdentifyUser {
        tag: String,
        sequence: i32,
        offset_ms: i64,
    },
    Error {
        name: String,
        parent_id: i32,
        sequence: i32,
        offset_ms: i64,
        code: Option<i32>,
        reason: Option<String>,
        stacktrace: Option<String>,
        technology: Option<String>,
    },
    Crash {
        name: String,
        sequence: i32,
        offset_ms: i64,
        reason: Option<String>,
        stacktrace: Option<String>,
    },
    WebRequest {
        url: String,
        parent_id: i32,
        start_sequence: i32,
        end_sequence: i32,
        start_offset_ms: i64,
        duration_ms: i64,
        bytes_sent: Option<i64>,
        bytes_received: Option<i64>,
        response_code: Option<i32>,
    },
}

impl Event {
    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self {
            Event::SessionStart { .. } => EventType::SessionStart,
            Event::SessionEnd { .. } => EventType::SessionEnd,
            Event::Action { .. } => EventType::ManualAction,
            Event::NamedEvent { .. } => EventType::NamedEvent,
            Event::Value { value, .. } => value.event_type(),
            Event::IdentifyUser { .. } => EventType::IdentifyUser,
            Event::Error { .. } => EventType::Error,
            Event::Crash { .. } => EventType::Crash,
            Event::WebRequest { .. } => EventType::WebRequest,
        }
    }
}

/// Encodes one event into its wire fragment.
#[must_use]
pub fn encode(event: &Event) -> Fragment {
    let mut builder = FragmentBuilder::new();
    builder.number(keys::EVENT_TYPE, event.event_type().code());

    match event {
        Event::SessionStart {
            sequence,
            offset_ms,
        }
        | Event::SessionEnd {
            sequence,
            offset_ms,
        } => {
            builder.number(keys::THREAD_ID, THREAD_ID);
            builder.number(keys::PARENT_ACTION_ID, 0);
            builder.number(keys::START_SEQUENCE, sequence);
            builder.number(keys::TIME_0, offset_ms);
        }
        Event::Action {
            name,
            id,
            parent_id,
            start_sequence,
            end_sequence,
            start_offset_ms,
            duration_ms,
        } => {
            builder.text(keys::NAME, name, MAX_NAME_LEN);
            builder.number(keys::THREAD_ID, THREAD_ID);
            builder.number(keys::ACTION_ID, id);
            builder.number(keys::PARENT_ACTION_ID, parent_id);
            builder.number(keys::START_SEQUENCE, start_sequence);
            builder.number(keys::TIME_0, start_offset_ms);
            builder.number(keys::END_SEQUENCE, end_sequence);
            builder.number(keys::TIME_1, duration_ms);
        }
        Event::NamedEvent {
            name,
            parent_id,
            sequence,
            offset_ms,
        } => {
            builder.event_basics(name, *parent_id, *sequence, *offset_ms);
        }
        Event::Value {
            name,
            parent_id,
            sequence,
            offset_ms,
            value,
        } => {
            builder.event_basics(name, *parent_id, *sequence, *offset_ms);
            match value {
                ReportedValue::Int(value) => builder.number(keys::VALUE, value),
                ReportedValue::Double(value) => builder.double(keys::VALUE, *value),
                ReportedValue::Str(value) => builder.text(keys::VALUE, value, MAX_NAME_LEN),
            }
        }
        Event::IdentifyUser {
            tag,
            sequence,
            offset_ms,
        } => {
            builder.event_basics(tag, 0, *sequence, *offset_ms);
        }
        Event::Error {
            name,
            parent_id,
            sequence,
            offset_ms,
            code,
            reason,
            stacktrace,
            technology,
        } => {
            builder.event_basics(name, *parent_id, *sequence, *offset_ms);
            if let Some(code) = code {
                builder.number(keys::ERROR_VALUE, code);
            }
            builder.optional_text(keys::REASON, reason.as_deref(), MAX_REASON_LEN);
            if let Some(stacktrace) = stacktrace {
                builder.raw(keys::STACKTRACE, truncate_stacktrace(stacktrace));
            }
            builder.optional_text(keys::TECHNOLOGY_TYPE, technology.as_deref(), MAX_NAME_LEN);
        }
        Event::Crash {
            name,
            sequence,
            offset_ms,
            reason,
            stacktrace,
        } => {
            builder.event_basics(name, 0, *sequence, *offset_ms);
            builder.optional_text(keys::REASON, reason.as_deref(), MAX_REASON_LEN);
            if let Some(stacktrace) = stacktrace {
                builder.raw(keys::STACKTRACE, truncate_stacktrace(stacktrace));
            }
            builder.raw(keys::TECHNOLOGY_TYPE, CRASH_TECHNOLOGY);
        }
        Event::WebRequest {
            url,
            parent_id,
            start_sequence,
            end_sequence,
            start_offset_ms,
            duration_ms,
            bytes_sent,
            bytes_received,
            response_code,
        } => {
            builder.event_basics(url, *parent_id, *start_sequence, *start_offset_ms);
            builder.number(keys::END_SEQUENCE, end_sequence);
            builder.number(keys::TIME_1, duration_ms);
            if let Some(bytes_sent) = bytes_sent {
                builder.number(keys::BYTES_SENT, bytes_sent);
            }
            if let Some(bytes_received) = bytes_received {
                builder.number(keys::BYTES_RECEIVED, bytes_received);
            }
            if let Some(response_code) = response_code {
                builder.number(keys::RESPONSE_CODE, response_code);
            }
        }
    }

    builder.finish()
}

/// Immutable per-session beacon prefix.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Prefix {
    pub application_id: String,
    pub application_name: Option<String>,
    pub application_version: Option<String>,
    pub visitor_id: i64,
    pub session_number: i32,
    pub client_ip: Option<String>,
    pub operating_system: String,
    pub manufacturer: String,
    pub model_id: Option<String>,
    pub data_collection_level: u8,
    pub crash_reporting_level: u8,
}

#[must_use]
pub fn encode_prefix(prefix: &Prefix) -> Fragment {
    let mut builder = FragmentBuilder::new();
    builder.number(keys::PROTOCOL_VERSION, PROTOCOL_VERSION);
    builder.raw(keys::AGENT_VERSION, AGENT_VERSION);
    builder.raw(keys::APPLICATION_ID, &prefix.application_id);
    builder.optional_text(
        keys::APPLICATION_NAME,
        prefix.application_name.as_deref(),
        MAX_NAME_LEN,
    );
    builder.optional_text(
        keys::APPLICATION_VERSION,
        prefix.application_version.as_deref(),
        MAX_NAME_LEN,
    );
    builder.number(keys::PLATFORM_TYPE, PLATFORM_TYPE);
    builder.raw(keys::AGENT_TECHNOLOGY, AGENT_TECHNOLOGY);
    builder.number(keys::VISITOR_ID, prefix.visitor_id);
    builder.number(keys::SESSION_NUMBER, prefix.session_number);
    builder.optional_text(keys::CLIENT_IP, prefix.client_ip.as_deref(), MAX_NAME_LEN);
    builder.text(keys::OPERATING_SYSTEM, &prefix.operating_system, MAX_NAME_LEN);
    builder.text(keys::MANUFACTURER, &prefix.manufacturer, MAX_NAME_LEN);
    builder.optional_text(keys::MODEL_ID, prefix.model_id.as_deref(), MAX_NAME_LEN);
    builder.number(keys::DATA_COLLECTION_LEVEL, prefix.data_collection_level);
    builder.number(keys::CRASH_REPORTING_LEVEL, prefix.crash_reporting_level);
    builder.finish()
}

/// Per-chunk header. Rebuilt for every chunk from the state at call time.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MutableHeader<'a> {
    pub session_start_ms: i64,
    pub transmission_time_ms: i64,
    pub multiplicity: i32,
    pub carrier: Option<&'a str>,
    pub network_technology: Option<&'a str>,
    pub connection_type: Option<&'a str>,
}

#[must_use]
pub fn encode_mutable_header(header: &MutableHeader<'_>) -> Fragment {
    let mut builder = FragmentBuilder::new();
    builder.number(keys::VISIT_STORE_VERSION, VISIT_STORE_VERSION);
    builder.number(keys::SESSION_START_TIME, header.session_start_ms);
    builder.number(keys::TRANSMISSION_TIME, header.transmission_time_ms);
    builder.number(keys::MULTIPLICITY, header.multiplicity);
    builder.optional_text(keys::CARRIER, header.carrier, MAX_NAME_LEN);
    builder.optional_text(keys::NETWORK_TECHNOLOGY, header.network_technology, MAX_NAME_LEN);
    builder.optional_text(keys::CONNECTION_TYPE, header.connection_type, MAX_NAME_LEN);
    builder.finish()
}

/// Formats a double the way the collector expects, including non-finite values.
#[must_use]
pub fn format_double(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "Infinity".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else {
        value.to_string()
    }
}

/// Cuts `value` to at most `max_chars` characters.
#[must_use]
pub fn truncate(value: &str, max_chars: usize) -> &str {
    match value.char_indices().nth(max_chars) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

/// Cuts a stack trace to [`MAX_STACKTRACE_LEN`] characters, dropping the partial last line.
///
/// A single line longer than the limit has no boundary to cut at and is cut at the limit.
#[must_use]
pub fn truncate_stacktrace(value: &str) -> &str {
    let Some((limit, _)) = value.char_indices().nth(MAX_STACKTRACE_LEN) else {
        return value;
    };
    let head = &value[..limit];
    if value[limit..].starts_with('\n') {
        return head;
    }
    match head.rfind('\n') {
        Some(boundary) => &head[..boundary],
        None => head,
    }
}

struct FragmentBuilder {
    buffer: String,
}

impl FragmentBuilder {
    fn new() -> Self {
        FragmentBuilder {
            buffer: String::new(),
        }
    }

    /// Appends a pair, escaping the value but not truncating it.
    fn raw(&mut self, key: &str, value: &str) {
        if !self.buffer.is_empty() {
            self.buffer.push(DELIMITER);
        }
        self.buffer.push_str(&urlencoding::encode(key));
        self.buffer.push('=');
        self.buffer.push_str(&escape(value));
    }

    fn text(&mut self, key: &str, value: &str, max_chars: usize) {
        self.raw(key, truncate(value, max_chars));
    }

    fn optional_text(&mut self, key: &str, value: Option<&str>, max_chars: usize) {
        if let Some(value) = value {
            self.text(key, value, max_chars);
        }
    }

    fn number(&mut self, key: &str, value: impl Display) {
        self.raw(key, &value.to_string());
    }

    fn double(&mut self, key: &str, value: f64) {
        self.raw(key, &format_double(value));
    }

    /// `na`, `it`, `pa`, `s0`, `t0`: the leading fields shared by most events.
    fn event_basics(&mut self, name: &str, parent_id: i32, sequence: i32, offset_ms: i64) {
        self.text(keys::NAME, name, MAX_NAME_LEN);
        self.number(keys::THREAD_ID, THREAD_ID);
        self.number(keys::PARENT_ACTION_ID, parent_id);
        self.number(keys::START_SEQUENCE, sequence);
        self.number(keys::TIME_0, offset_ms);
    }

    fn finish(self) -> Fragment {
        Fragment(self.buffer)
    }
}

fn escape(value: &str) -> Cow<'_, str> {
    urlencoding::encode(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(name: &str) -> Event {
        Event::Action {
            name: name.to_string(),
            id: 3,
            parent_id: 0,
            start_sequence: 2,
            end_sequence: 5,
            start_offset_ms: 100,
            duration_ms: 42,
        }
    }

    #[test]
    fn action_fields_are_in_wire_order() {
        let fragment = encode(&action("checkout"));
        assert_eq!(
            fragment.as_str(),
            "et=1&na=checkout&it=1&ca=3&pa=0&s0=2&t0=100&s1=5&t1=42"
        );
    }

    #[test]
    fn session_start_and_end() {
        let start = encode(&Event::SessionStart {
            sequence: 1,
            offset_ms: 0,
        });
        let end = encode(&Event::SessionEnd {
            sequence: 9,
            offset_ms: 1500,
        });
        assert_eq!(start.as_str(), "et=18&it=1&pa=0&s0=1&t0=0");
        assert_eq!(end.as_str(), "et=19&it=1&pa=0&s0=9&t0=1500");
    }

    #[test]
    fn value_double_drops_trailing_zero() {
        let fragment = encode(&Event::Value {
            name: "x".to_string(),
            parent_id: 4,
            sequence: 7,
            offset_ms: 12,
            value: ReportedValue::Double(5.0),
        });
        assert_eq!(fragment.as_str(), "et=13&na=x&it=1&pa=4&s0=7&t0=12&vl=5");
        assert_eq!(fragment.event_type(), Some(EventType::ValueDouble));
    }

    #[test]
    fn non_finite_values_are_encoded_literally() {
        for (value, token) in [
            (f64::NAN, "NaN"),
            (f64::INFINITY, "Infinity"),
            (f64::NEG_INFINITY, "-Infinity"),
        ] {
            let fragment = encode(&Event::Value {
                name: "v".to_string(),
                parent_id: 0,
                sequence: 1,
                offset_ms: 0,
                value: ReportedValue::Double(value),
            });
            assert!(
                fragment.as_str().ends_with(&format!("&vl={token}")),
                "{fragment}"
            );
        }
    }

    #[test]
    fn values_are_percent_encoded_as_utf8() {
        let fragment = encode(&Event::NamedEvent {
            name: "grüße & more=1".to_string(),
            parent_id: 0,
            sequence: 1,
            offset_ms: 0,
        });
        assert!(fragment
            .as_str()
            .starts_with("et=10&na=gr%C3%BC%C3%9Fe%20%26%20more%3D1&"));
    }

    #[test]
    fn names_are_truncated_before_encoding() {
        let name = "ä".repeat(300);
        let fragment = encode(&action(&name));
        let expected = urlencoding::encode(&"ä".repeat(MAX_NAME_LEN)).into_owned();
        assert!(fragment.as_str().contains(&format!("na={expected}&")));
    }

    #[test]
    fn absent_optionals_omit_their_keys() {
        let fragment = encode(&Event::Error {
            name: "boom".to_string(),
            parent_id: 2,
            sequence: 3,
            offset_ms: 4,
            code: Some(-7),
            reason: None,
            stacktrace: None,
            technology: None,
        });
        assert_eq!(fragment.as_str(), "et=40&na=boom&it=1&pa=2&s0=3&t0=4&ev=-7");
    }

    #[test]
    fn crash_carries_reason_stacktrace_and_technology() {
        let fragment = encode(&Event::Crash {
            name: "Panic".to_string(),
            sequence: 1,
            offset_ms: 0,
            reason: Some("index out of bounds".to_string()),
            stacktrace: Some("a\nb".to_string()),
        });
        assert_eq!(
            fragment.as_str(),
            "et=50&na=Panic&it=1&pa=0&s0=1&t0=0&rs=index%20out%20of%20bounds&st=a%0Ab&tt=c"
        );
    }

    #[test]
    fn reason_is_limited_to_a_thousand_chars() {
        let fragment = encode(&Event::Crash {
            name: "c".to_string(),
            sequence: 1,
            offset_ms: 0,
            reason: Some("r".repeat(MAX_REASON_LEN + 10)),
            stacktrace: None,
        });
        let reason = fragment
            .as_str()
            .split('&')
            .find_map(|pair| pair.strip_prefix("rs="))
            .unwrap();
        assert_eq!(reason.len(), MAX_REASON_LEN);
    }

    #[test]
    fn stacktrace_is_cut_on_a_line_boundary() {
        let line = format!("{}\n", "x".repeat(99));
        let trace = line.repeat(2_000);
        let truncated = truncate_stacktrace(&trace);
        assert!(truncated.chars().count() <= MAX_STACKTRACE_LEN);
        assert!(truncated.ends_with('x'));
        assert_eq!(truncated.lines().count(), MAX_STACKTRACE_LEN / 100);
        assert!(truncated.lines().all(|l| l.len() == 99));
    }

    #[test]
    fn stacktrace_single_long_line_is_cut_at_limit() {
        let trace = "y".repeat(MAX_STACKTRACE_LEN + 5);
        assert_eq!(truncate_stacktrace(&trace).len(), MAX_STACKTRACE_LEN);
    }

    #[test]
    fn short_stacktrace_is_untouched() {
        assert_eq!(truncate_stacktrace("a\nb\n"), "a\nb\n");
    }

    #[test]
    fn web_request_fields() {
        let fragment = encode(&Event::WebRequest {
            url: "https://example.com/a?b=c".to_string(),
            parent_id: 1,
            start_sequence: 2,
            end_sequence: 3,
            start_offset_ms: 10,
            duration_ms: 20,
            bytes_sent: Some(100),
            bytes_received: None,
            response_code: Some(200),
        });
        assert_eq!(
            fragment.as_str(),
            "et=30&na=https%3A%2F%2Fexample.com%2Fa%3Fb%3Dc&it=1&pa=1&s0=2&t0=10&s1=3&t1=20&bs=100&rc=200"
        );
        assert_eq!(fragment.event_type(), Some(EventType::WebRequest));
    }

    #[test]
    fn event_type_round_trips_through_code() {
        for event_type in [
            EventType::ManualAction,
            EventType::NamedEvent,
            EventType::ValueString,
            EventType::ValueInt,
            EventType::ValueDouble,
            EventType::SessionStart,
            EventType::SessionEnd,
            EventType::WebRequest,
            EventType::Error,
            EventType::Crash,
            EventType::IdentifyUser,
        ] {
            assert_eq!(EventType::from_code(event_type.code()), Some(event_type));
        }
        assert_eq!(EventType::from_code(2), None);
    }

    #[test]
    fn prefix_and_header_order() {
        let prefix = encode_prefix(&Prefix {
            application_id: "app-1".to_string(),
            application_name: None,
            application_version: Some("1.2".to_string()),
            visitor_id: 42,
            session_number: 7,
            client_ip: None,
            operating_system: "Linux".to_string(),
            manufacturer: "acme".to_string(),
            model_id: None,
            data_collection_level: 2,
            crash_reporting_level: 2,
        });
        assert_eq!(
            prefix.as_str(),
            format!(
                "vv=3&va={AGENT_VERSION}&ap=app-1&vn=1.2&pt=1&tt=okrs&vi=42&sn=7&os=Linux&mf=acme&dl=2&cl=2"
            )
        );

        let header = encode_mutable_header(&MutableHeader {
            session_start_ms: 1000,
            transmission_time_ms: 2000,
            multiplicity: 1,
            carrier: Some("T1"),
            network_technology: None,
            connection_type: Some("w"),
        });
        assert_eq!(
            header.as_str(),
            "vs=2&tv=1000&tx=2000&mp=1&cr=T1&ct=w"
        );
    }
}
