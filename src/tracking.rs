//! Open and click events. Both timestamps are set once: the first event wins
//! and repeats leave the row untouched.

use chrono::Utc;
use uuid::Uuid;

use crate::models::{Campaign, CampaignRecipient};
use crate::store::{CampaignStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum TrackingError {
    #[error("Invalid tracking link")]
    UnknownRecipient,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClickOutcome {
    Redirect(String),
    NoDestination,
}

/// Everything a destination strategy may look at.
pub struct ClickContext<'a> {
    pub base_url: &'a str,
    pub campaign: &'a Campaign,
    pub campaign_recipient: &'a CampaignRecipient,
}

pub type DestinationStrategy = fn(&ClickContext<'_>) -> Option<String>;

/// Evaluated in order; the first strategy that yields a URL wins. The
/// landing page outranks the campaign's fallback redirect.
pub const DESTINATION_STRATEGIES: &[DestinationStrategy] = &[landing_page, fallback_redirect];

pub fn landing_page_url(base_url: &str, form_template_id: Uuid, token: &str) -> String {
    format!(
        "{base_url}/phishing/template/{form_template_id}/{}",
        urlencoding::encode(token)
    )
}

fn landing_page(ctx: &ClickContext<'_>) -> Option<String> {
    let form_template_id = ctx.campaign.form_template_id?;
    let token = ctx.campaign_recipient.tracking_token.as_deref()?;
    Some(landing_page_url(ctx.base_url, form_template_id, token))
}

fn fallback_redirect(ctx: &ClickContext<'_>) -> Option<String> {
    ctx.campaign
        .redirect_url
        .as_deref()
        .filter(|url| !url.trim().is_empty())
        .map(str::to_string)
}

pub fn resolve_destination(ctx: &ClickContext<'_>) -> Option<String> {
    DESTINATION_STRATEGIES.iter().find_map(|strategy| strategy(ctx))
}

/// Record the first open of a campaign email. Never fails: unknown pairs and
/// store errors are logged and swallowed so the pixel always renders.
pub async fn record_open(store: &dyn CampaignStore, campaign_id: Uuid, recipient_id: Uuid) {
    let row = match store.find_campaign_recipient(campaign_id, recipient_id).await {
        Ok(Some(row)) => row,
        Ok(None) => {
            tracing::debug!(%campaign_id, %recipient_id, "Open for unknown campaign recipient");
            return;
        }
        Err(e) => {
            tracing::error!(%campaign_id, %recipient_id, "Failed to look up open: {e}");
            return;
        }
    };

    if row.opened_at.is_some() {
        tracing::debug!(%campaign_id, %recipient_id, "Repeated open ignored");
        return;
    }
    if let Err(e) = store.mark_opened(row.id, Utc::now()).await {
        tracing::error!(%campaign_id, %recipient_id, "Failed to record open: {e}");
    }
}

/// Record the first click and work out where to send the browser.
pub async fn record_click(
    store: &dyn CampaignStore,
    base_url: &str,
    campaign_id: Uuid,
    recipient_id: Uuid,
) -> Result<ClickOutcome, TrackingError> {
    let Some(row) = store
        .find_campaign_recipient(campaign_id, recipient_id)
        .await?
    else {
        tracing::warn!(%campaign_id, %recipient_id, "Click for unknown campaign recipient");
        return Err(TrackingError::UnknownRecipient);
    };
    let campaign = store
        .find_campaign(campaign_id)
        .await?
        .ok_or(TrackingError::UnknownRecipient)?;

    let row = if row.clicked_at.is_some() {
        tracing::debug!(%campaign_id, %recipient_id, "Repeated click ignored");
        row
    } else {
        store.mark_clicked(row.id, Utc::now()).await?
    };

    let ctx = ClickContext {
        base_url,
        campaign: &campaign,
        campaign_recipient: &row,
    };
    Ok(match resolve_destination(&ctx) {
        Some(url) => ClickOutcome::Redirect(url),
        None => {
            tracing::warn!(%campaign_id, "Click with no destination configured");
            ClickOutcome::NoDestination
        }
    })
}
