// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-session fragment queue and beacon chunk assembly.
//!
//! Fragments are kept in emission order and drained destructively: once a fragment has
//! been placed into a chunk it is gone, whether or not the chunk reaches the collector.

use std::collections::VecDeque;

use tracing::trace;

use crate::communication_state::CommunicationState;
use crate::config::{CrashReportingLevel, DataCollectionLevel};
use crate::encoder::{encode_mutable_header, Fragment, MutableHeader, DELIMITER};

/// Fields reported out of band and repeated in every chunk header.
#[derive(Clone, Debug, Default, PartialEq)]
struct SupplementaryFields {
    carrier: Option<String>,
    network_technology: Option<String>,
    connection_type: Option<String>,
}

#[derive(Debug)]
pub struct PayloadBuilder {
    fragments: VecDeque<Fragment>,
    supplementary: SupplementaryFields,
    data_collection_level: DataCollectionLevel,
    crash_reporting_level: CrashReportingLevel,
}

impl PayloadBuilder {
    #[must_use]
    pub fn new(
        data_collection_level: DataCollectionLevel,
        crash_reporting_level: CrashReportingLevel,
    ) -> Self {
        PayloadBuilder {
            fragments: VecDeque::new(),
            supplementary: SupplementaryFields::default(),
            data_collection_level,
            crash_reporting_level,
        }
    }

    /// Queues `fragment` if `state` currently permits its event kind.
    ///
    /// Returns whether the fragment was queued. Rejected fragments are dropped.
    pub fn enqueue(&mut self, fragment: Fragment, state: &CommunicationState) -> bool {
        let permitted = fragment.event_type().is_some_and(|event_type| {
            state.permits(
                event_type,
                self.data_collection_level,
                self.crash_reporting_level,
            )
        });
        if !permitted {
            trace!("Dropping fragment {fragment}");
            return false;
        }
        self.fragments.push_back(fragment);
        true
    }

    /// Builds the next chunk: `prefix & header & fragment & fragment ...`.
    ///
    /// Fragments are taken from the head while the chunk stays within the state's max
    /// beacon size. The first fragment is always taken, even when it alone exceeds the
    /// budget. Returns `None` when the queue is empty.
    pub fn next_chunk(
        &mut self,
        prefix: &Fragment,
        state: &CommunicationState,
        session_start_ms: i64,
        transmission_time_ms: i64,
    ) -> Option<String> {
        let first = self.fragments.pop_front()?;

        let header = encode_mutable_header(&MutableHeader {
            session_start_ms,
            transmission_time_ms,
            multiplicity: state.multiplicity(),
            carrier: self.supplementary.carrier.as_deref(),
            network_technology: self.supplementary.network_technology.as_deref(),
            connection_type: self.supplementary.connection_type.as_deref(),
        });

        let mut chunk = String::with_capacity(state.max_beacon_size());
        chunk.push_str(prefix.as_str());
        chunk.push(DELIMITER);
        chunk.push_str(header.as_str());
        chunk.push(DELIMITER);
        chunk.push_str(first.as_str());

        let max = state.max_beacon_size();
        while let Some(next) = self.fragments.front() {
            if chunk.len() + DELIMITER.len_utf8() + next.len() > max {
                break;
            }
            chunk.push(DELIMITER);
            chunk.push_str(next.as_str());
            self.fragments.pop_front();
        }
        Some(chunk)
    }

    pub fn clear(&mut self) {
        self.fragments.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn set_carrier(&mut self, carrier: Option<String>) {
        self.supplementary.carrier = carrier;
    }

    pub fn set_network_technology(&mut self, network_technology: Option<String>) {
        self.supplementary.network_technology = network_technology;
    }

    pub fn set_connection_type(&mut self, connection_type: Option<String>) {
        self.supplementary.connection_type = connection_type;
    }
}
