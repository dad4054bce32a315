// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Scripted lifecycle commands.
//!
//! Each stdin line is one JSON command. Sessions, actions and tracers are referred to by
//! caller-chosen handles, e.g.
//!
//! ```text
//! {"op":"create_session","session":"s"}
//! {"op":"enter_action","session":"s","action":"a","name":"checkout"}
//! {"op":"report_value","action":"a","name":"items","value":3}
//! {"op":"leave_action","action":"a"}
//! {"op":"end_session","session":"s"}
//! ```

use std::collections::HashMap;

use serde::Deserialize;
use tokio::time::Duration;
use tracing::warn;

use beacon_agent::action::Action;
use beacon_agent::encoder::ReportedValue;
use beacon_agent::openkit::OpenKit;
use beacon_agent::session::Session;
use beacon_agent::web_request::WebRequestTracer;

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    CreateSession {
        session: String,
        client_ip: Option<String>,
    },
    IdentifyUser {
        session: String,
        tag: String,
    },
    EnterAction {
        session: String,
        action: String,
        name: String,
    },
    ReportEvent {
        action: String,
        name: String,
    },
    ReportValue {
        action: String,
        name: String,
        value: ReportedValue,
    },
    ReportError {
        session: String,
        action: Option<String>,
        name: String,
        code: i32,
    },
    ReportCrash {
        session: String,
        name: String,
        reason: Option<String>,
        stacktrace: Option<String>,
    },
    LeaveAction {
        action: String,
    },
    CancelAction {
        action: String,
    },
    TraceWebRequest {
        tracer: String,
        session: String,
        action: Option<String>,
        url: String,
    },
    StopWebRequest {
        tracer: String,
        response_code: i32,
        bytes_sent: Option<i64>,
        bytes_received: Option<i64>,
    },
    SetConnection {
        session: String,
        carrier: Option<String>,
        network_technology: Option<String>,
        connection_type: Option<String>,
    },
    EndSession {
        session: String,
    },
    Flush,
    Sleep {
        ms: u64,
    },
}

pub struct Replay {
    openkit: OpenKit,
    sessions: HashMap<String, Session>,
    actions: HashMap<String, Action>,
    tracers: HashMap<String, WebRequestTracer>,
}

impl Replay {
    pub fn new(openkit: OpenKit) -> Self {
        Replay {
            openkit,
            sessions: HashMap::new(),
            actions: HashMap::new(),
            tracers: HashMap::new(),
        }
    }

    fn session(&self, handle: &str) -> Session {
        self.sessions.get(handle).cloned().unwrap_or_else(|| {
            warn!("Unknown session {handle}");
            Session::Disabled
        })
    }

    fn action(&self, handle: &str) -> Action {
        self.actions.get(handle).cloned().unwrap_or_else(|| {
            warn!("Unknown action {handle}");
            Action::Disabled
        })
    }

    pub async fn apply(&mut self, command: Command) {
        match command {
            Command::CreateSession { session, client_ip } => {
                let created = self.openkit.create_session(client_ip.as_deref());
                self.sessions.insert(session, created);
            }
            Command::IdentifyUser { session, tag } => self.session(&session).identify_user(&tag),
            Command::EnterAction {
                session,
                action,
                name,
            } => {
                let entered = self.session(&session).enter_action(&name);
                self.actions.insert(action, entered);
            }
            Command::ReportEvent { action, name } => {
                self.action(&action).report_event(&name);
            }
            Command::ReportValue {
                action,
                name,
                value,
            } => {
                self.action(&action).report_value(&name, value);
            }
            Command::ReportError {
                session,
                action: Some(action),
                name,
                code,
            } => {
                if !self.sessions.contains_key(&session) {
                    warn!("Unknown session {session}");
                }
                self.action(&action).report_error(&name, code);
            }
            Command::ReportError {
                session,
                action: None,
                name,
                code,
            } => self.session(&session).report_error(&name, code),
            Command::ReportCrash {
                session,
                name,
                reason,
                stacktrace,
            } => self.session(&session).report_crash(
                &name,
                reason.as_deref(),
                stacktrace.as_deref(),
            ),
            Command::LeaveAction { action } => {
                if let Some(left) = self.actions.remove(&action) {
                    left.leave();
                }
            }
            Command::CancelAction { action } => {
                if let Some(cancelled) = self.actions.remove(&action) {
                    cancelled.cancel();
                }
            }
            Command::TraceWebRequest {
                tracer,
                session,
                action,
                url,
            } => {
                let started = match action {
                    Some(action) => self.action(&action).trace_web_request(&url),
                    None => self.session(&session).trace_web_request(&url),
                };
                self.tracers.insert(tracer, started);
            }
            Command::StopWebRequest {
                tracer,
                response_code,
                bytes_sent,
                bytes_received,
            } => match self.tracers.remove(&tracer) {
                Some(stopped) => {
                    if let Some(bytes) = bytes_sent {
                        stopped.set_bytes_sent(bytes);
                    }
                    if let Some(bytes) = bytes_received {
                        stopped.set_bytes_received(bytes);
                    }
                    stopped.stop(response_code);
                }
                None => warn!("Unknown web request {tracer}"),
            },
            Command::SetConnection {
                session,
                carrier,
                network_technology,
                connection_type,
            } => {
                let session = self.session(&session);
                if let Some(carrier) = carrier {
                    session.report_carrier(&carrier);
                }
                if let Some(technology) = network_technology {
                    session.report_network_technology(&technology);
                }
                if let Some(connection_type) = connection_type {
                    session.report_connection_type(&connection_type);
                }
            }
            Command::EndSession { session } => {
                if let Some(ended) = self.sessions.remove(&session) {
                    ended.end();
                }
            }
            Command::Flush => self.openkit.sender().flush_immediate().await,
            Command::Sleep { ms } => tokio::time::sleep(Duration::from_millis(ms)).await,
        }
    }
}
