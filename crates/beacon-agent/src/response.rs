// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collector response parsing.
//!
//! The collector answers either with a legacy key-value body (`type=m&cp=1&...`) or a JSON
//! document with `mobileAgentConfig`, `appConfig` and `dynamicConfig` sections. Both forms
//! normalize into [`StatusResponse`], which is what [`CommunicationState`] consumes.
//!
//! [`CommunicationState`]: crate::communication_state::CommunicationState

use serde::Deserialize;
use tracing::debug;

use crate::errors::ResponseError;

const RESPONSE_TYPE_MARKER: &str = "type=m";

/// Normalized collector response.
///
/// Every field other than `valid`, `status_code` and `transport_failed` is optional: absent
/// fields leave the corresponding communication state untouched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StatusResponse {
    pub valid: bool,
    pub status_code: u16,
    /// No usable answer after all retries (non-2xx statuses or no response at all). Carries
    /// nothing about the collector's configuration.
    pub transport_failed: bool,
    pub capture: Option<bool>,
    pub multiplicity: Option<i32>,
    pub server_id: Option<i32>,
    pub max_beacon_size_kb: Option<i32>,
    pub capture_errors: Option<bool>,
    pub capture_crashes: Option<bool>,
    pub traffic_control_percentage: Option<i32>,
    pub timestamp: Option<i64>,
}

impl StatusResponse {
    /// Success that never touched the network (overload prevention).
    #[must_use]
    pub fn synthetic_success() -> Self {
        StatusResponse {
            valid: true,
            status_code: 200,
            ..Default::default()
        }
    }

    /// A 2xx whose body failed validation.
    #[must_use]
    pub fn failure(status_code: u16) -> Self {
        StatusResponse {
            valid: false,
            status_code,
            ..Default::default()
        }
    }

    /// The collector could not be reached or kept answering with an error status.
    #[must_use]
    pub fn unreachable(status_code: u16) -> Self {
        StatusResponse {
            valid: false,
            status_code,
            transport_failed: true,
            ..Default::default()
        }
    }

    /// Builds a response from a completed HTTP exchange.
    ///
    /// Non-2xx statuses yield an unreachable response and malformed bodies a plain failure.
    /// A 2xx with an empty body is valid and carries no updates.
    #[must_use]
    pub fn from_http(status_code: u16, body: &str) -> Self {
        if !(200..300).contains(&status_code) {
            return StatusResponse::unreachable(status_code);
        }
        if body.trim().is_empty() {
            return StatusResponse {
                valid: true,
                status_code,
                ..Default::default()
            };
        }
        match parse(body) {
            Ok(mut response) => {
                response.status_code = status_code;
                response
            }
            Err(e) => {
                debug!("Discarding collector response: {e}");
                StatusResponse::failure(status_code)
            }
        }
    }
}

/// Parses a collector body in either supported format.
pub fn parse(body: &str) -> Result<StatusResponse, ResponseError> {
    let body = body.trim();
    if body.starts_with('{') {
        parse_json(body)
    } else {
        parse_key_value(body)
    }
}

fn parse_key_value(body: &str) -> Result<StatusResponse, ResponseError> {
    let mut pairs = body.split('&').filter(|pair| !pair.is_empty());
    if pairs.next() != Some(RESPONSE_TYPE_MARKER) {
        return Err(ResponseError::MissingMarker);
    }

    let mut response = StatusResponse {
        valid: true,
        ..Default::default()
    };
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| ResponseError::MalformedPair(pair.to_string()))?;
        match key {
            "cp" => response.capture = Some(parse_int(key, value)? != 0),
            "id" => response.server_id = Some(parse_int(key, value)?),
            "bn" => response.max_beacon_size_kb = Some(parse_int(key, value)?),
            "er" => response.capture_errors = Some(parse_int(key, value)? != 0),
            "cr" => response.capture_crashes = Some(parse_int(key, value)? != 0),
            "mp" => response.multiplicity = Some(parse_int(key, value)?),
            "tc" => response.traffic_control_percentage = Some(parse_int(key, value)?),
            // send interval and other legacy keys are not used by this agent
            _ => {}
        }
    }
    Ok(response)
}

fn parse_int(key: &str, value: &str) -> Result<i32, ResponseError> {
    value.parse().map_err(|_| ResponseError::InvalidNumber {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonResponse {
    mobile_agent_config: Option<MobileAgentConfig>,
    app_config: Option<AppConfig>,
    dynamic_config: Option<DynamicConfig>,
    timestamp: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MobileAgentConfig {
    max_beacon_size_kb: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppConfig {
    capture: Option<i32>,
    report_crashes: Option<i32>,
    report_errors: Option<i32>,
    traffic_control_percentage: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DynamicConfig {
    multiplicity: Option<i32>,
    server_id: Option<i32>,
    status: Option<String>,
}

fn parse_json(body: &str) -> Result<StatusResponse, ResponseError> {
    let json: JsonResponse =
        serde_json::from_str(body).map_err(|e| ResponseError::Json(e.to_string()))?;

    let mut response = StatusResponse {
        valid: true,
        timestamp: json.timestamp,
        ..Default::default()
    };
    if let Some(agent) = json.mobile_agent_config {
        response.max_beacon_size_kb = agent.max_beacon_size_kb;
    }
    if let Some(app) = json.app_config {
        response.capture = app.capture.map(|v| v != 0);
        response.capture_crashes = app.report_crashes.map(|v| v != 0);
        response.capture_errors = app.report_errors.map(|v| v != 0);
        response.traffic_control_percentage = app.traffic_control_percentage;
    }
    if let Some(dynamic) = json.dynamic_config {
        if let Some(status) = dynamic.status {
            if status.eq_ignore_ascii_case("error") {
                return Err(ResponseError::Status(status));
            }
        }
        response.multiplicity = dynamic.multiplicity;
        response.server_id = dynamic.server_id;
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_value_body_is_parsed() {
        let response = parse("type=m&cp=1&id=5&bn=64&er=0&cr=1&mp=3&si=120&tc=50").unwrap();
        assert_eq!(
            response,
            StatusResponse {
                valid: true,
                status_code: 0,
                transport_failed: false,
                capture: Some(true),
                multiplicity: Some(3),
                server_id: Some(5),
                max_beacon_size_kb: Some(64),
                capture_errors: Some(false),
                capture_crashes: Some(true),
                traffic_control_percentage: Some(50),
                timestamp: None,
            }
        );
    }

    #[test]
    fn key_value_body_requires_marker_first() {
        assert_eq!(parse("cp=1&type=m"), Err(ResponseError::MissingMarker));
        assert_eq!(parse("hello"), Err(ResponseError::MissingMarker));
    }

    #[test]
    fn key_value_body_rejects_bad_numbers() {
        assert!(matches!(
            parse("type=m&mp=abc"),
            Err(ResponseError::InvalidNumber { .. })
        ));
        assert!(matches!(
            parse("type=m&mp"),
            Err(ResponseError::MalformedPair(_))
        ));
    }

    #[test]
    fn json_body_is_parsed() {
        let body = r#"{
            "mobileAgentConfig": {"maxBeaconSizeKb": 128, "sendIntervalSec": 120},
            "appConfig": {"capture": 1, "reportCrashes": 0, "reportErrors": 1, "trafficControlPercentage": 100},
            "dynamicConfig": {"multiplicity": 2, "serverId": 9, "status": "OK"},
            "timestamp": 1700000000000
        }"#;
        let response = parse(body).unwrap();
        assert!(response.valid);
        assert_eq!(response.max_beacon_size_kb, Some(128));
        assert_eq!(response.capture, Some(true));
        assert_eq!(response.capture_crashes, Some(false));
        assert_eq!(response.capture_errors, Some(true));
        assert_eq!(response.multiplicity, Some(2));
        assert_eq!(response.server_id, Some(9));
        assert_eq!(response.timestamp, Some(1_700_000_000_000));
    }

    #[test]
    fn json_error_status_is_invalid() {
        let body = r#"{"dynamicConfig": {"status": "ERROR"}}"#;
        assert_eq!(
            parse(body),
            Err(ResponseError::Status("ERROR".to_string()))
        );
    }

    #[test]
    fn malformed_json_is_invalid() {
        assert!(matches!(parse("{not json"), Err(ResponseError::Json(_))));
    }

    #[test]
    fn from_http_classifies_status_and_body() {
        let error = StatusResponse::from_http(500, "type=m&cp=1");
        assert!(!error.valid);
        assert!(error.transport_failed);

        let garbage = StatusResponse::from_http(200, "garbage");
        assert!(!garbage.valid);
        assert!(!garbage.transport_failed);

        let empty = StatusResponse::from_http(200, "");
        assert!(empty.valid);
        assert_eq!(empty.capture, None);

        let ok = StatusResponse::from_http(202, "type=m&mp=0");
        assert!(ok.valid);
        assert_eq!(ok.status_code, 202);
        assert_eq!(ok.multiplicity, Some(0));
    }
}
