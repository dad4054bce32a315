// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::UNIX_EPOCH;

/// Milliseconds since the unix epoch. A clock set before 1970 reads as 0.
pub(crate) fn now_millis() -> i64 {
    UNIX_EPOCH
        .elapsed()
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}
