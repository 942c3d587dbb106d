//! Build lifecycle messages and their realtime wire form.

use std::time::Duration;

use serde::Serialize;
use serde_json::json;

use crate::models::build_event::{format_duration, BuildEvent, BuildStatus};

/// Something that happened to a build event, addressed by event id.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastMessage {
    pub event_id: u64,
    pub kind: BroadcastKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BroadcastKind {
    /// Sent once to a freshly registered subscriber so it can identify itself.
    Identity { subscriber_id: String },
    /// A build event was created.
    Created { event: BuildEvent },
    /// The build moved to a new status. `succeeded` is set for terminal states.
    StatusChanged {
        status: BuildStatus,
        succeeded: Option<bool>,
    },
    /// A fragment of build output was appended.
    OutputAppended { fragment: String },
    /// Periodic elapsed-time update; also sent once when the build stops.
    DurationTick { elapsed: Duration },
}

impl BroadcastMessage {
    pub fn identity(subscriber_id: impl Into<String>) -> Self {
        Self {
            event_id: 0,
            kind: BroadcastKind::Identity {
                subscriber_id: subscriber_id.into(),
            },
        }
    }

    pub fn created(event: &BuildEvent) -> Self {
        Self {
            event_id: event.id,
            kind: BroadcastKind::Created {
                event: event.clone(),
            },
        }
    }

    pub fn status_changed(event_id: u64, status: BuildStatus) -> Self {
        Self {
            event_id,
            kind: BroadcastKind::StatusChanged {
                status,
                succeeded: status.outcome(),
            },
        }
    }

    pub fn output_appended(event_id: u64, fragment: impl Into<String>) -> Self {
        Self {
            event_id,
            kind: BroadcastKind::OutputAppended {
                fragment: fragment.into(),
            },
        }
    }

    pub fn duration_tick(event_id: u64, elapsed: Duration) -> Self {
        Self {
            event_id,
            kind: BroadcastKind::DurationTick { elapsed },
        }
    }

    /// Convert to the frame sent to dashboard clients.
    pub fn to_frame(&self) -> RealtimeFrame {
        let (kind, body) = match &self.kind {
            BroadcastKind::Identity { subscriber_id } => ("id", json!(subscriber_id)),
            BroadcastKind::Created { event } => ("new", json!(event)),
            BroadcastKind::StatusChanged {
                status,
                succeeded: Some(ok),
            } => ("update", json!({ "set_status": status, "ok": ok })),
            BroadcastKind::StatusChanged {
                status,
                succeeded: None,
            } => ("update", json!({ "set_status": status })),
            BroadcastKind::OutputAppended { fragment } => ("write", json!(fragment)),
            BroadcastKind::DurationTick { elapsed } => {
                ("update", json!({ "duration": format_duration(*elapsed) }))
            }
        };

        RealtimeFrame {
            id: self.event_id,
            kind,
            body,
        }
    }
}

/// `{ "id": ..., "type": ..., "body": ... }` as sent over the realtime socket.
#[derive(Debug, Clone, Serialize)]
pub struct RealtimeFrame {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub body: serde_json::Value,
}
