//! Persistence boundary for the dispatch and tracking pipeline.
//!
//! Every mutating call returns the updated row so callers never hold on to
//! stale state. Set-once timestamps (`opened_at`, `clicked_at`, the tracking
//! token, awareness acknowledgement) are written with compare-and-set
//! semantics: the first writer wins and later calls return the existing row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    Campaign, CampaignRecipient, CampaignStats, CampaignStatus, DispatchTarget, EmailTemplate,
    FormSubmission, FormTemplate, NewFormSubmission, Recipient,
};
use crate::security::CryptoError;

#[cfg(test)]
pub mod memory;
pub mod postgres;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Unique constraint violated: {0}")]
    Conflict(String),

    #[error("Row not found: {0}")]
    NotFound(String),

    #[error("Campaign cannot be edited while {0}")]
    NotEditable(CampaignStatus),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

#[async_trait]
pub trait CampaignStore: Send + Sync {
    async fn find_campaign(&self, id: Uuid) -> Result<Option<Campaign>, StoreError>;

    /// Atomically move a campaign into `to` if its status is one of `from`.
    /// Returns `None` when the campaign is missing, in another status, or
    /// `to` is not reachable from its status.
    async fn transition_campaign(
        &self,
        id: Uuid,
        from: &[CampaignStatus],
        to: CampaignStatus,
        sent_at: Option<DateTime<Utc>>,
    ) -> Result<Option<Campaign>, StoreError>;

    /// Campaigns in `scheduled` whose `scheduled_at` is at or before `now`.
    async fn due_campaigns(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError>;

    async fn find_email_template(&self, id: Uuid) -> Result<Option<EmailTemplate>, StoreError>;

    async fn find_form_template(&self, id: Uuid) -> Result<Option<FormTemplate>, StoreError>;

    async fn find_recipient(&self, id: Uuid) -> Result<Option<Recipient>, StoreError>;

    /// All campaign-recipient rows of a campaign, in creation order.
    async fn list_campaign_recipients(
        &self,
        campaign_id: Uuid,
    ) -> Result<Vec<CampaignRecipient>, StoreError>;

    async fn list_dispatch_targets(
        &self,
        campaign_id: Uuid,
    ) -> Result<Vec<DispatchTarget>, StoreError>;

    /// Make the campaign's recipient set equal to `recipient_ids`: rows for
    /// recipients that remain are kept with their history, rows for removed
    /// recipients are deleted, new recipients get a pending row.
    ///
    /// The campaign's status is checked under the same lock as the edit;
    /// anything but draft or scheduled yields `NotEditable`.
    async fn sync_campaign_recipients(
        &self,
        campaign_id: Uuid,
        recipient_ids: &[Uuid],
    ) -> Result<Vec<CampaignRecipient>, StoreError>;

    async fn find_campaign_recipient(
        &self,
        campaign_id: Uuid,
        recipient_id: Uuid,
    ) -> Result<Option<CampaignRecipient>, StoreError>;

    async fn find_by_tracking_token(
        &self,
        token: &str,
    ) -> Result<Option<CampaignRecipient>, StoreError>;

    /// Store `token` unless the row already has one. Returns
    /// `StoreError::Conflict` if another row owns the same token.
    async fn assign_tracking_token(
        &self,
        campaign_recipient_id: Uuid,
        token: &str,
    ) -> Result<CampaignRecipient, StoreError>;

    async fn mark_sent(
        &self,
        campaign_recipient_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<CampaignRecipient, StoreError>;

    async fn mark_failed(
        &self,
        campaign_recipient_id: Uuid,
        error: &str,
    ) -> Result<CampaignRecipient, StoreError>;

    async fn mark_opened(
        &self,
        campaign_recipient_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<CampaignRecipient, StoreError>;

    async fn mark_clicked(
        &self,
        campaign_recipient_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<CampaignRecipient, StoreError>;

    /// Persist a submission; `submitted_data` is encrypted before it is stored.
    async fn insert_submission(
        &self,
        submission: NewFormSubmission,
    ) -> Result<FormSubmission, StoreError>;

    async fn find_submission(&self, id: Uuid) -> Result<Option<FormSubmission>, StoreError>;

    async fn acknowledge_submission(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<FormSubmission>, StoreError>;

    async fn campaign_stats(&self, campaign_id: Uuid) -> Result<CampaignStats, StoreError>;
}
