//! WHIP HTTP handlers.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use tracing::info;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::AppState;
use crate::errors::AppError;

/// `POST /whip`: body is a JSON-encoded SDP offer. Replies `201 Created`
/// with the answer and a `Location` header naming the session resource.
pub async fn handle_whip(
    State(state): State<AppState>,
    Json(offer): Json<RTCSessionDescription>,
) -> Result<impl IntoResponse, AppError> {
    info!("WHIP offer received ({} bytes of SDP)", offer.sdp.len());
    let (answer, session_id) = state.server.handle_new_connection(offer).await?;

    Ok((
        StatusCode::CREATED,
        [
            (header::CONTENT_TYPE, "application/sdp".to_string()),
            (header::LOCATION, format!("/whip/sessions/{session_id}")),
        ],
        Json(answer),
    ))
}

/// `DELETE /whip/sessions/{id}`: stop and dispose the session.
pub async fn handle_delete(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> StatusCode {
    state.server.delete_connection(&session_id).await;
    StatusCode::OK
}

pub async fn health_check() -> &'static str {
    "OK"
}
