use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dispatch::DispatchReport;
use crate::error::AppError;
use crate::models::{Campaign, CampaignRecipient, CampaignStats, CampaignStatus};
use crate::store::StoreError;
use crate::AppState;

#[derive(Serialize)]
pub struct CampaignDetail {
    pub campaign: Campaign,
    pub stats: CampaignStats,
    pub recipients: Vec<CampaignRecipient>,
}

#[derive(Deserialize)]
pub struct RecipientSelection {
    pub recipient_ids: Vec<Uuid>,
}

async fn load_campaign(state: &AppState, id: Uuid) -> Result<Campaign, AppError> {
    state
        .store
        .find_campaign(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Campaign not found".to_string()))
}

pub async fn show(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CampaignDetail>, AppError> {
    let campaign = load_campaign(&state, id).await?;
    let stats = state.store.campaign_stats(id).await?;
    let recipients = state.store.list_campaign_recipients(id).await?;
    Ok(Json(CampaignDetail {
        campaign,
        stats,
        recipients,
    }))
}

/// Dispatch now; responds once every recipient has been attempted. The
/// dispatch runs in its own task and completes even if the client goes away.
pub async fn send(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DispatchReport>, AppError> {
    let dispatcher = state.dispatcher.clone();
    let report = tokio::spawn(async move { dispatcher.dispatch(id).await })
        .await
        .map_err(|e| AppError::Internal(format!("Dispatch task failed: {e}")))??;
    Ok(Json(report))
}

/// Cancel a scheduled campaign. Mail already handed to the transport is
/// unaffected.
pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Campaign>, AppError> {
    let cancelled = state
        .store
        .transition_campaign(
            id,
            &[CampaignStatus::Scheduled],
            CampaignStatus::Cancelled,
            None,
        )
        .await?;

    match cancelled {
        Some(campaign) => {
            tracing::info!(campaign_id = %id, "Campaign cancelled");
            Ok(Json(campaign))
        }
        None => {
            let campaign = load_campaign(&state, id).await?;
            Err(AppError::Conflict(format!(
                "Only scheduled campaigns can be cancelled (campaign is {})",
                campaign.status
            )))
        }
    }
}

/// Replace the campaign's recipient set while it is still editable.
pub async fn update_recipients(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(selection): Json<RecipientSelection>,
) -> Result<Json<Vec<CampaignRecipient>>, AppError> {
    load_campaign(&state, id).await?;

    for recipient_id in &selection.recipient_ids {
        if state.store.find_recipient(*recipient_id).await?.is_none() {
            return Err(AppError::BadRequest(format!(
                "Unknown recipient {recipient_id}"
            )));
        }
    }

    let rows = match state
        .store
        .sync_campaign_recipients(id, &selection.recipient_ids)
        .await
    {
        Ok(rows) => rows,
        Err(e @ StoreError::NotEditable(_)) => return Err(AppError::Conflict(e.to_string())),
        Err(e) => return Err(e.into()),
    };
    tracing::info!(campaign_id = %id, recipients = rows.len(), "Campaign recipients updated");
    Ok(Json(rows))
}
