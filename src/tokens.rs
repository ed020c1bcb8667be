//! Opaque per-(campaign, recipient) tokens that tie opens, clicks and form
//! posts back to a single send.

use crate::models::CampaignRecipient;
use crate::security::generate_token;
use crate::store::{CampaignStore, StoreError};

/// Issuance attempts before giving up on a unique token.
const MAX_ISSUE_ATTEMPTS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Could not issue a unique tracking token after {0} attempts")]
    Exhausted(usize),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A fresh URL-safe token with 256 bits of entropy.
pub fn issue() -> String {
    generate_token()
}

pub async fn resolve(
    store: &dyn CampaignStore,
    token: &str,
) -> Result<Option<CampaignRecipient>, StoreError> {
    if token.is_empty() {
        return Ok(None);
    }
    store.find_by_tracking_token(token).await
}

/// Return the row with a tracking token, issuing one if it has none yet.
pub async fn ensure_token(
    store: &dyn CampaignStore,
    campaign_recipient: &CampaignRecipient,
) -> Result<CampaignRecipient, TokenError> {
    ensure_token_with(store, campaign_recipient, issue).await
}

pub async fn ensure_token_with<F>(
    store: &dyn CampaignStore,
    campaign_recipient: &CampaignRecipient,
    mut issuer: F,
) -> Result<CampaignRecipient, TokenError>
where
    F: FnMut() -> String + Send,
{
    if campaign_recipient.tracking_token.is_some() {
        return Ok(campaign_recipient.clone());
    }

    for attempt in 1..=MAX_ISSUE_ATTEMPTS {
        let token = issuer();
        match store
            .assign_tracking_token(campaign_recipient.id, &token)
            .await
        {
            Ok(row) => return Ok(row),
            Err(StoreError::Conflict(_)) => {
                tracing::warn!(
                    campaign_recipient_id = %campaign_recipient.id,
                    attempt,
                    "Tracking token collision, reissuing"
                );
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(TokenError::Exhausted(MAX_ISSUE_ATTEMPTS))
}
