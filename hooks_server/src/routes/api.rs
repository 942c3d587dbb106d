//! JSON history API for the dashboard.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::{Deserialize, Serialize};

use crate::models::build_event::{format_duration, BuildEvent};
use crate::routes::HooksState;

/// Number of events the dashboard shows by default.
pub const RECENT_EVENTS: usize = 10;
const MAX_EVENTS: usize = 500;

/// A build event plus the derived fields the dashboard renders.
#[derive(Debug, Serialize)]
pub struct EventJson {
    #[serde(flatten)]
    pub event: BuildEvent,
    pub duration: String,
    pub date: String,
}

impl From<BuildEvent> for EventJson {
    fn from(event: BuildEvent) -> Self {
        Self {
            duration: format_duration(event.duration()),
            date: event.date(),
            event,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListEventsQuery {
    pub limit: Option<usize>,
}

pub async fn recent_events(State(state): State<HooksState>) -> Json<Vec<EventJson>> {
    Json(recent(&state, RECENT_EVENTS))
}

pub async fn list_events(
    State(state): State<HooksState>,
    Query(query): Query<ListEventsQuery>,
) -> Json<Vec<EventJson>> {
    let limit = query.limit.unwrap_or(RECENT_EVENTS).min(MAX_EVENTS);
    Json(recent(&state, limit))
}

pub async fn get_event(
    State(state): State<HooksState>,
    Path(event_id): Path<u64>,
) -> Result<Json<EventJson>, StatusCode> {
    state
        .store
        .get(event_id)
        .map(|event| Json(event.into()))
        .ok_or(StatusCode::NOT_FOUND)
}

fn recent(state: &HooksState, limit: usize) -> Vec<EventJson> {
    state
        .store
        .list_recent(limit)
        .into_iter()
        .map(EventJson::from)
        .collect()
}
