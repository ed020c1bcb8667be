use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use crate::error::AppError;
use crate::tracking::{self, ClickOutcome, TrackingError};
use crate::AppState;

// 1x1 transparent GIF
const TRANSPARENT_GIF: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00,
    0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00, 0x00, 0x00,
    0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x01, 0x44, 0x00, 0x3b,
];

const NO_DESTINATION: &str = "No destination configured for this campaign.";

fn parse_pair(campaign_id: &str, recipient_id: &str) -> Option<(Uuid, Uuid)> {
    Some((campaign_id.parse().ok()?, recipient_id.parse().ok()?))
}

/// Always answers with the pixel, whatever the ids.
pub async fn track_open(
    State(state): State<AppState>,
    Path((campaign_id, recipient_id)): Path<(String, String)>,
) -> Response {
    if let Some((campaign_id, recipient_id)) = parse_pair(&campaign_id, &recipient_id) {
        tracking::record_open(state.store.as_ref(), campaign_id, recipient_id).await;
    }

    (
        [
            (header::CONTENT_TYPE, "image/gif"),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            (header::PRAGMA, "no-cache"),
            (header::EXPIRES, "0"),
        ],
        TRANSPARENT_GIF,
    )
        .into_response()
}

pub async fn track_click(
    State(state): State<AppState>,
    Path((campaign_id, recipient_id)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let (campaign_id, recipient_id) = parse_pair(&campaign_id, &recipient_id)
        .ok_or_else(|| AppError::from(TrackingError::UnknownRecipient))?;

    let outcome = tracking::record_click(
        state.store.as_ref(),
        &state.config.base_url,
        campaign_id,
        recipient_id,
    )
    .await?;

    match outcome {
        ClickOutcome::Redirect(url) => {
            Ok((StatusCode::FOUND, [(header::LOCATION, url)]).into_response())
        }
        ClickOutcome::NoDestination => Err(AppError::NotFound(NO_DESTINATION.to_string())),
    }
}
