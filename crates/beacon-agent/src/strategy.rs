// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Policies deciding when the sender flushes.
//!
//! Several strategies can be active at once. They request flushes independently, and the
//! sender collapses concurrent requests into a single pass.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{SendingStrategies, StrategyConfig};
use crate::encoder::EventType;
use crate::sender::Sender;

#[async_trait]
pub trait SendingStrategy: Send + Sync {
    /// Called once when the sender starts.
    fn start(&self, _sender: &Sender) {}

    /// Called once when the global handshake succeeded.
    fn after_init(&self, _sender: &Sender) {}

    /// Called after a fragment of `event_type` was queued.
    fn after_enqueue(&self, _sender: &Sender, _event_type: EventType) {}

    /// Stops the strategy. The default performs one last best-effort flush.
    async fn shutdown(&self, sender: &Sender) {
        sender.flush_immediate().await;
    }
}

/// Builds the configured strategies, in order.
#[must_use]
pub fn from_config(strategies: &SendingStrategies) -> Vec<Arc<dyn SendingStrategy>> {
    strategies
        .0
        .iter()
        .map(|strategy| -> Arc<dyn SendingStrategy> {
            match strategy {
                StrategyConfig::Interval(period) => Arc::new(IntervalStrategy::new(*period)),
                StrategyConfig::Immediate => Arc::new(ImmediateStrategy),
                StrategyConfig::FlushLeftovers => Arc::new(FlushLeftoversStrategy),
            }
        })
        .collect()
}

/// Flushes only what is left at shutdown.
pub struct FlushLeftoversStrategy;

impl SendingStrategy for FlushLeftoversStrategy {}

/// Flushes on a fixed period until shut down.
pub struct IntervalStrategy {
    period: Duration,
    cancel_token: CancellationToken,
}

impl IntervalStrategy {
    #[must_use]
    pub fn new(period: Duration) -> Self {
        IntervalStrategy {
            period,
            cancel_token: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl SendingStrategy for IntervalStrategy {
    fn start(&self, sender: &Sender) {
        let weak = sender.downgrade();
        let cancel_token = self.cancel_token.clone();
        let period = self.period;
        sender.spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(sender) = weak.upgrade() else {
                            break;
                        };
                        sender.flush().await;
                    }
                }
            }
            debug!("Interval strategy stopped");
        });
    }

    async fn shutdown(&self, sender: &Sender) {
        self.cancel_token.cancel();
        sender.flush_immediate().await;
    }
}

/// Flushes as soon as a critical event is queued.
pub struct ImmediateStrategy;

impl ImmediateStrategy {
    #[must_use]
    pub fn is_critical(event_type: EventType) -> bool {
        matches!(
            event_type,
            EventType::Crash
                | EventType::Error
                | EventType::ManualAction
                | EventType::IdentifyUser
                | EventType::SessionStart
                | EventType::SessionEnd
                | EventType::WebRequest
        )
    }
}

#[async_trait]
impl SendingStrategy for ImmediateStrategy {
    /// Events queued before the handshake completed are sent right away.
    fn after_init(&self, sender: &Sender) {
        sender.request_flush();
    }

    fn after_enqueue(&self, sender: &Sender, event_type: EventType) {
        if ImmediateStrategy::is_critical(event_type) {
            sender.request_flush();
        }
    }
}
