//! Push webhook handler — validates the payload and starts a build.
//!
//! The response never waits for the build and is always `200 ok`;
//! malformed pushes are logged and dropped.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;

use crate::models::push::PushEvent;
use crate::routes::HooksState;
use crate::services::pipeline::BuildRequest;

pub async fn handle_webhook(
    State(state): State<HooksState>,
    body: Bytes,
) -> (StatusCode, &'static str) {
    let request = PushEvent::from_slice(&body).and_then(|push| BuildRequest::from_push(&push));

    match request {
        Ok(request) => {
            crate::metrics::webhook_received(true);
            tracing::info!(
                repo = %request.slug,
                git_ref = %request.git_ref,
                revision = %request.revision,
                "Webhook processed"
            );
            state.pipeline.spawn(request);
        }
        Err(e) => {
            crate::metrics::webhook_received(false);
            tracing::warn!("Ignoring webhook: {e}");
        }
    }

    (StatusCode::OK, "ok")
}
