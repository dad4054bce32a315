// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Server-assigned parameters for one session (or the process-wide default).
//!
//! Sessions start from a clone of the default state and from then on only see responses
//! addressed to them. Two latches hold for the lifetime of an instance: once capture is
//! off it stays off, and once the server id is locked it no longer changes.

use tracing::debug;

use crate::config::{CrashReportingLevel, DataCollectionLevel};
use crate::constants::{
    DEFAULT_MAX_BEACON_SIZE_BYTES, DEFAULT_MULTIPLICITY, DEFAULT_SERVER_ID,
    DEFAULT_TRAFFIC_CONTROL_PERCENTAGE,
};
use crate::encoder::EventType;
use crate::response::StatusResponse;

#[derive(Clone, Debug, PartialEq)]
pub struct CommunicationState {
    server_id: i32,
    max_beacon_size: usize,
    multiplicity: i32,
    capture: bool,
    capture_errors: bool,
    capture_crashes: bool,
    traffic_control_percentage: i32,
    timestamp: i64,
    server_id_locked: bool,
}

impl Default for CommunicationState {
    fn default() -> Self {
        CommunicationState {
            server_id: DEFAULT_SERVER_ID,
            max_beacon_size: DEFAULT_MAX_BEACON_SIZE_BYTES,
            multiplicity: DEFAULT_MULTIPLICITY,
            capture: true,
            capture_errors: true,
            capture_crashes: true,
            traffic_control_percentage: DEFAULT_TRAFFIC_CONTROL_PERCENTAGE,
            timestamp: 0,
            server_id_locked: false,
        }
    }
}

impl CommunicationState {
    /// Applies a collector response.
    ///
    /// Order matters: an invalid or capture-off response disables capture and nothing else
    /// is applied. Otherwise multiplicity, server id, beacon size, error/crash flags and the
    /// config timestamp are adopted in that order.
    ///
    /// An unreachable collector says nothing about capture and leaves the state untouched.
    pub fn update_from_response(&mut self, response: &StatusResponse) {
        if response.transport_failed {
            return;
        }
        if !response.valid || response.capture == Some(false) {
            debug!(
                "Disabling capture: valid={} capture={:?}",
                response.valid, response.capture
            );
            self.disable_capture();
            return;
        }

        if let Some(multiplicity) = response.multiplicity {
            if multiplicity <= 0 {
                self.multiplicity = 0;
                self.disable_capture();
            } else {
                self.multiplicity = multiplicity;
            }
        }

        if let Some(server_id) = response.server_id {
            if !self.server_id_locked {
                self.server_id = if server_id >= 0 {
                    server_id
                } else {
                    DEFAULT_SERVER_ID
                };
            }
        }

        if let Some(kb) = response.max_beacon_size_kb {
            if let Ok(kb) = usize::try_from(kb) {
                self.max_beacon_size = kb.saturating_mul(1024);
            }
        }

        if let Some(capture_errors) = response.capture_errors {
            self.capture_errors = capture_errors;
        }
        if let Some(capture_crashes) = response.capture_crashes {
            self.capture_crashes = capture_crashes;
        }
        if let Some(percentage) = response.traffic_control_percentage {
            self.traffic_control_percentage = percentage;
        }
        if let Some(timestamp) = response.timestamp {
            self.timestamp = timestamp;
        }
    }

    /// Idempotent and one-way for this instance.
    pub fn disable_capture(&mut self) {
        self.capture = false;
    }

    /// Takes over `server_id` unless the id is already locked.
    pub fn adopt_server_id(&mut self, server_id: i32) {
        if !self.server_id_locked {
            self.server_id = server_id;
        }
    }

    /// One-way latch: the server id is frozen from here on.
    pub fn set_server_id_locked(&mut self) {
        self.server_id_locked = true;
    }

    /// Whether an event of `event_type` may be queued right now.
    ///
    /// Global capture gates first, the server's error/crash flags second, the static
    /// privacy levels last.
    #[must_use]
    pub fn permits(
        &self,
        event_type: EventType,
        data_collection: DataCollectionLevel,
        crash_reporting: CrashReportingLevel,
    ) -> bool {
        if !self.capture {
            return false;
        }
        match event_type {
            EventType::SessionStart | EventType::SessionEnd => true,
            EventType::ManualAction | EventType::WebRequest => {
                data_collection != DataCollectionLevel::Off
            }
            EventType::NamedEvent
            | EventType::ValueString
            | EventType::ValueInt
            | EventType::ValueDouble
            | EventType::IdentifyUser => data_collection == DataCollectionLevel::UserBehavior,
            EventType::Error => {
                self.capture_errors && data_collection != DataCollectionLevel::Off
            }
            EventType::Crash => {
                self.capture_crashes && crash_reporting == CrashReportingLevel::OptInCrashes
            }
        }
    }

    #[must_use]
    pub fn server_id(&self) -> i32 {
        self.server_id
    }

    #[must_use]
    pub fn max_beacon_size(&self) -> usize {
        self.max_beacon_size
    }

    #[must_use]
    pub fn multiplicity(&self) -> i32 {
        self.multiplicity
    }

    #[must_use]
    pub fn is_capture_enabled(&self) -> bool {
        self.capture
    }

    #[must_use]
    pub fn is_capture_errors_enabled(&self) -> bool {
        self.capture_errors
    }

    #[must_use]
    pub fn is_capture_crashes_enabled(&self) -> bool {
        self.capture_crashes
    }

    #[must_use]
    pub fn traffic_control_percentage(&self) -> i32 {
        self.traffic_control_percentage
    }

    #[must_use]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    #[must_use]
    pub fn is_server_id_locked(&self) -> bool {
        self.server_id_locked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> StatusResponse {
        StatusResponse {
            valid: true,
            status_code: 200,
            ..Default::default()
        }
    }

    #[test]
    fn defaults() {
        let state = CommunicationState::default();
        assert_eq!(state.server_id(), 1);
        assert_eq!(state.max_beacon_size(), 30 * 1024);
        assert_eq!(state.multiplicity(), 1);
        assert!(state.is_capture_enabled());
        assert!(state.is_capture_errors_enabled());
        assert!(state.is_capture_crashes_enabled());
        assert!(!state.is_server_id_locked());
    }

    #[test]
    fn locked_server_id_ignores_later_responses() {
        let mut state = CommunicationState::default();
        state.update_from_response(&StatusResponse {
            server_id: Some(4),
            ..valid()
        });
        state.set_server_id_locked();
        state.update_from_response(&StatusResponse {
            server_id: Some(7),
            ..valid()
        });
        assert_eq!(state.server_id(), 4);
    }

    #[test]
    fn negative_server_id_falls_back_to_default() {
        let mut state = CommunicationState::default();
        state.update_from_response(&StatusResponse {
            server_id: Some(8),
            ..valid()
        });
        state.update_from_response(&StatusResponse {
            server_id: Some(-3),
            ..valid()
        });
        assert_eq!(state.server_id(), 1);
    }

    #[test]
    fn zero_multiplicity_latches_capture_off() {
        let mut state = CommunicationState::default();
        state.update_from_response(&StatusResponse {
            multiplicity: Some(0),
            ..valid()
        });
        assert!(!state.is_capture_enabled());
        assert_eq!(state.multiplicity(), 0);

        state.update_from_response(&StatusResponse {
            capture: Some(true),
            multiplicity: Some(1),
            ..valid()
        });
        assert!(!state.is_capture_enabled());
    }

    #[test]
    fn invalid_response_disables_capture_and_applies_nothing_else() {
        let mut state = CommunicationState::default();
        state.update_from_response(&StatusResponse {
            valid: false,
            server_id: Some(9),
            max_beacon_size_kb: Some(1),
            ..Default::default()
        });
        assert!(!state.is_capture_enabled());
        assert_eq!(state.server_id(), 1);
        assert_eq!(state.max_beacon_size(), 30 * 1024);
    }

    #[test]
    fn unreachable_collector_leaves_state_untouched() {
        let mut state = CommunicationState::default();
        state.update_from_response(&StatusResponse::unreachable(503));
        state.update_from_response(&StatusResponse::unreachable(0));
        assert_eq!(state, CommunicationState::default());
    }

    #[test]
    fn adopt_server_id_honors_the_lock() {
        let mut state = CommunicationState::default();
        state.adopt_server_id(4);
        state.set_server_id_locked();
        state.adopt_server_id(7);
        assert_eq!(state.server_id(), 4);
    }

    #[test]
    fn capture_off_response_applies_nothing_else() {
        let mut state = CommunicationState::default();
        state.update_from_response(&StatusResponse {
            capture: Some(false),
            server_id: Some(9),
            ..valid()
        });
        assert!(!state.is_capture_enabled());
        assert_eq!(state.server_id(), 1);
    }

    #[test]
    fn beacon_size_flags_and_timestamp_are_adopted() {
        let mut state = CommunicationState::default();
        state.update_from_response(&StatusResponse {
            max_beacon_size_kb: Some(10),
            capture_errors: Some(false),
            capture_crashes: Some(false),
            traffic_control_percentage: Some(25),
            timestamp: Some(77),
            ..valid()
        });
        assert_eq!(state.max_beacon_size(), 10 * 1024);
        assert!(!state.is_capture_errors_enabled());
        assert!(!state.is_capture_crashes_enabled());
        assert_eq!(state.traffic_control_percentage(), 25);
        assert_eq!(state.timestamp(), 77);

        state.update_from_response(&StatusResponse {
            max_beacon_size_kb: Some(-1),
            ..valid()
        });
        assert_eq!(state.max_beacon_size(), 10 * 1024);
    }

    #[test]
    fn fresh_clone_of_default_is_independent() {
        let default = CommunicationState::default();
        let mut session = default.clone();
        session.disable_capture();
        assert!(default.is_capture_enabled());
    }

    #[test]
    fn permits_applies_capture_then_flags_then_levels() {
        let mut state = CommunicationState::default();
        let full = (
            DataCollectionLevel::UserBehavior,
            CrashReportingLevel::OptInCrashes,
        );
        assert!(state.permits(EventType::IdentifyUser, full.0, full.1));
        assert!(!state.permits(
            EventType::IdentifyUser,
            DataCollectionLevel::Performance,
            full.1
        ));
        assert!(state.permits(
            EventType::ManualAction,
            DataCollectionLevel::Performance,
            full.1
        ));
        assert!(!state.permits(EventType::WebRequest, DataCollectionLevel::Off, full.1));
        assert!(state.permits(EventType::SessionStart, DataCollectionLevel::Off, full.1));
        assert!(!state.permits(
            EventType::Crash,
            full.0,
            CrashReportingLevel::OptOutCrashes
        ));

        state.update_from_response(&StatusResponse {
            capture_errors: Some(false),
            ..valid()
        });
        assert!(!state.permits(EventType::Error, full.0, full.1));
        assert!(state.permits(EventType::Crash, full.0, full.1));

        state.disable_capture();
        assert!(!state.permits(EventType::SessionStart, full.0, full.1));
    }
}
