//! In-memory `CampaignStore` used by unit and router tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{CampaignStore, StoreError};
use crate::models::{
    Campaign, CampaignRecipient, CampaignStats, CampaignStatus, DispatchTarget, EmailTemplate,
    FormSubmission, FormTemplate, NewFormSubmission, Recipient, SendStatus,
};
use crate::security::SubmissionCipher;

struct StoredSubmission {
    record: FormSubmission,
    sealed: String,
}

#[derive(Default)]
struct State {
    campaigns: HashMap<Uuid, Campaign>,
    recipients: HashMap<Uuid, Recipient>,
    email_templates: HashMap<Uuid, EmailTemplate>,
    form_templates: HashMap<Uuid, FormTemplate>,
    campaign_recipients: Vec<CampaignRecipient>,
    submissions: Vec<StoredSubmission>,
}

impl State {
    fn campaign_recipient_mut(&mut self, id: Uuid) -> Result<&mut CampaignRecipient, StoreError> {
        self.campaign_recipients
            .iter_mut()
            .find(|cr| cr.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("campaign recipient {id}")))
    }
}

fn pending_row(campaign_id: Uuid, recipient_id: Uuid) -> CampaignRecipient {
    CampaignRecipient {
        id: Uuid::new_v4(),
        campaign_id,
        recipient_id,
        status: SendStatus::Pending,
        sent_at: None,
        opened_at: None,
        clicked_at: None,
        error_message: None,
        tracking_token: None,
    }
}

pub struct MemoryStore {
    state: Mutex<State>,
    cipher: SubmissionCipher,
}

impl MemoryStore {
    pub fn new(cipher: SubmissionCipher) -> Self {
        Self {
            state: Mutex::new(State::default()),
            cipher,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn insert_campaign(&self, campaign: Campaign) {
        self.lock().campaigns.insert(campaign.id, campaign);
    }

    pub fn insert_recipient(&self, recipient: Recipient) {
        self.lock().recipients.insert(recipient.id, recipient);
    }

    pub fn remove_recipient(&self, id: Uuid) {
        self.lock().recipients.remove(&id);
    }

    pub fn insert_email_template(&self, template: EmailTemplate) {
        self.lock().email_templates.insert(template.id, template);
    }

    pub fn insert_form_template(&self, template: FormTemplate) {
        self.lock().form_templates.insert(template.id, template);
    }

    pub fn add_campaign_recipient(&self, campaign_id: Uuid, recipient_id: Uuid) -> CampaignRecipient {
        let row = pending_row(campaign_id, recipient_id);
        self.lock().campaign_recipients.push(row.clone());
        row
    }

    pub fn remove_campaign_recipient(&self, id: Uuid) {
        self.lock().campaign_recipients.retain(|cr| cr.id != id);
    }

    pub fn campaign(&self, id: Uuid) -> Option<Campaign> {
        self.lock().campaigns.get(&id).cloned()
    }

    pub fn campaign_recipient(&self, id: Uuid) -> Option<CampaignRecipient> {
        self.lock()
            .campaign_recipients
            .iter()
            .find(|cr| cr.id == id)
            .cloned()
    }

    /// The stored (encrypted) form of a submission's data.
    pub fn sealed_submission(&self, id: Uuid) -> Option<String> {
        self.lock()
            .submissions
            .iter()
            .find(|s| s.record.id == id)
            .map(|s| s.sealed.clone())
    }

    pub fn submission_count(&self) -> usize {
        self.lock().submissions.len()
    }

    fn open(&self, stored: &StoredSubmission) -> Result<FormSubmission, StoreError> {
        let mut record = stored.record.clone();
        record.submitted_data = self.cipher.decrypt_json(&stored.sealed)?;
        Ok(record)
    }
}

#[async_trait]
impl CampaignStore for MemoryStore {
    async fn find_campaign(&self, id: Uuid) -> Result<Option<Campaign>, StoreError> {
        Ok(self.campaign(id))
    }

    async fn transition_campaign(
        &self,
        id: Uuid,
        from: &[CampaignStatus],
        to: CampaignStatus,
        sent_at: Option<DateTime<Utc>>,
    ) -> Result<Option<Campaign>, StoreError> {
        let mut state = self.lock();
        let Some(campaign) = state.campaigns.get_mut(&id) else {
            return Ok(None);
        };
        if !from.contains(&campaign.status) || !campaign.status.can_transition_to(to) {
            return Ok(None);
        }
        campaign.status = to;
        if sent_at.is_some() {
            campaign.sent_at = sent_at;
        }
        Ok(Some(campaign.clone()))
    }

    async fn due_campaigns(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        let state = self.lock();
        let mut due: Vec<&Campaign> = state
            .campaigns
            .values()
            .filter(|c| {
                c.status == CampaignStatus::Scheduled && c.scheduled_at.is_some_and(|at| at <= now)
            })
            .collect();
        due.sort_by_key(|c| c.scheduled_at);
        Ok(due.into_iter().map(|c| c.id).collect())
    }

    async fn find_email_template(&self, id: Uuid) -> Result<Option<EmailTemplate>, StoreError> {
        Ok(self.lock().email_templates.get(&id).cloned())
    }

    async fn find_form_template(&self, id: Uuid) -> Result<Option<FormTemplate>, StoreError> {
        Ok(self.lock().form_templates.get(&id).cloned())
    }

    async fn find_recipient(&self, id: Uuid) -> Result<Option<Recipient>, StoreError> {
        Ok(self.lock().recipients.get(&id).cloned())
    }

    async fn list_campaign_recipients(
        &self,
        campaign_id: Uuid,
    ) -> Result<Vec<CampaignRecipient>, StoreError> {
        Ok(self
            .lock()
            .campaign_recipients
            .iter()
            .filter(|cr| cr.campaign_id == campaign_id)
            .cloned()
            .collect())
    }

    async fn list_dispatch_targets(
        &self,
        campaign_id: Uuid,
    ) -> Result<Vec<DispatchTarget>, StoreError> {
        let state = self.lock();
        Ok(state
            .campaign_recipients
            .iter()
            .filter(|cr| cr.campaign_id == campaign_id)
            .map(|cr| DispatchTarget {
                campaign_recipient: cr.clone(),
                recipient: state.recipients.get(&cr.recipient_id).cloned(),
            })
            .collect())
    }

    async fn sync_campaign_recipients(
        &self,
        campaign_id: Uuid,
        recipient_ids: &[Uuid],
    ) -> Result<Vec<CampaignRecipient>, StoreError> {
        {
            let mut state = self.lock();
            let status = state
                .campaigns
                .get(&campaign_id)
                .map(|c| c.status)
                .ok_or_else(|| StoreError::NotFound(format!("campaign {campaign_id}")))?;
            if !status.is_editable() {
                return Err(StoreError::NotEditable(status));
            }

            let State {
                campaign_recipients,
                submissions,
                ..
            } = &mut *state;
            campaign_recipients
                .retain(|cr| cr.campaign_id != campaign_id || recipient_ids.contains(&cr.recipient_id));
            submissions.retain(|s| {
                campaign_recipients
                    .iter()
                    .any(|cr| cr.id == s.record.campaign_recipient_id)
            });
            for recipient_id in recipient_ids {
                let exists = campaign_recipients
                    .iter()
                    .any(|cr| cr.campaign_id == campaign_id && cr.recipient_id == *recipient_id);
                if !exists {
                    campaign_recipients.push(pending_row(campaign_id, *recipient_id));
                }
            }
        }
        self.list_campaign_recipients(campaign_id).await
    }

    async fn find_campaign_recipient(
        &self,
        campaign_id: Uuid,
        recipient_id: Uuid,
    ) -> Result<Option<CampaignRecipient>, StoreError> {
        Ok(self
            .lock()
            .campaign_recipients
            .iter()
            .find(|cr| cr.campaign_id == campaign_id && cr.recipient_id == recipient_id)
            .cloned())
    }

    async fn find_by_tracking_token(
        &self,
        token: &str,
    ) -> Result<Option<CampaignRecipient>, StoreError> {
        Ok(self
            .lock()
            .campaign_recipients
            .iter()
            .find(|cr| cr.tracking_token.as_deref() == Some(token))
            .cloned())
    }

    async fn assign_tracking_token(
        &self,
        campaign_recipient_id: Uuid,
        token: &str,
    ) -> Result<CampaignRecipient, StoreError> {
        let mut state = self.lock();
        let taken = state
            .campaign_recipients
            .iter()
            .any(|cr| cr.id != campaign_recipient_id && cr.tracking_token.as_deref() == Some(token));
        let row = state.campaign_recipient_mut(campaign_recipient_id)?;
        if row.tracking_token.is_some() {
            return Ok(row.clone());
        }
        if taken {
            return Err(StoreError::Conflict(
                "campaign_recipients.tracking_token".to_string(),
            ));
        }
        row.tracking_token = Some(token.to_string());
        Ok(row.clone())
    }

    async fn mark_sent(
        &self,
        campaign_recipient_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<CampaignRecipient, StoreError> {
        let mut state = self.lock();
        let row = state.campaign_recipient_mut(campaign_recipient_id)?;
        row.status = SendStatus::Sent;
        row.sent_at = Some(at);
        row.error_message = None;
        Ok(row.clone())
    }

    async fn mark_failed(
        &self,
        campaign_recipient_id: Uuid,
        error: &str,
    ) -> Result<CampaignRecipient, StoreError> {
        let mut state = self.lock();
        let row = state.campaign_recipient_mut(campaign_recipient_id)?;
        row.status = SendStatus::Failed;
        row.error_message = Some(error.to_string());
        Ok(row.clone())
    }

    async fn mark_opened(
        &self,
        campaign_recipient_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<CampaignRecipient, StoreError> {
        let mut state = self.lock();
        let row = state.campaign_recipient_mut(campaign_recipient_id)?;
        row.opened_at.get_or_insert(at);
        Ok(row.clone())
    }

    async fn mark_clicked(
        &self,
        campaign_recipient_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<CampaignRecipient, StoreError> {
        let mut state = self.lock();
        let row = state.campaign_recipient_mut(campaign_recipient_id)?;
        row.clicked_at.get_or_insert(at);
        Ok(row.clone())
    }

    async fn insert_submission(
        &self,
        submission: NewFormSubmission,
    ) -> Result<FormSubmission, StoreError> {
        let sealed = self.cipher.encrypt_json(&submission.submitted_data)?;
        let record = FormSubmission {
            id: Uuid::new_v4(),
            campaign_recipient_id: submission.campaign_recipient_id,
            form_template_id: submission.form_template_id,
            submitted_data: submission.submitted_data,
            ip_address: submission.ip_address,
            user_agent: submission.user_agent,
            referer: submission.referer,
            is_aware: false,
            awareness_acknowledged_at: None,
            created_at: Utc::now(),
        };
        let mut stored = record.clone();
        stored.submitted_data = serde_json::Value::Null;
        self.lock().submissions.push(StoredSubmission {
            record: stored,
            sealed,
        });
        Ok(record)
    }

    async fn find_submission(&self, id: Uuid) -> Result<Option<FormSubmission>, StoreError> {
        let state = self.lock();
        state
            .submissions
            .iter()
            .find(|s| s.record.id == id)
            .map(|s| self.open(s))
            .transpose()
    }

    async fn acknowledge_submission(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<FormSubmission>, StoreError> {
        {
            let mut state = self.lock();
            if let Some(stored) = state.submissions.iter_mut().find(|s| s.record.id == id) {
                if !stored.record.is_aware {
                    stored.record.is_aware = true;
                    stored.record.awareness_acknowledged_at = Some(at);
                }
            }
        }
        self.find_submission(id).await
    }

    async fn campaign_stats(&self, campaign_id: Uuid) -> Result<CampaignStats, StoreError> {
        let state = self.lock();
        let rows: Vec<&CampaignRecipient> = state
            .campaign_recipients
            .iter()
            .filter(|cr| cr.campaign_id == campaign_id)
            .collect();
        let count = |f: &dyn Fn(&CampaignRecipient) -> bool| {
            i64::try_from(rows.iter().filter(|cr| f(cr)).count()).unwrap_or(i64::MAX)
        };
        let submitted = state
            .submissions
            .iter()
            .filter(|s| rows.iter().any(|cr| cr.id == s.record.campaign_recipient_id))
            .count();

        Ok(CampaignStats {
            total_recipients: count(&|_| true),
            sent_count: count(&|cr| cr.status == SendStatus::Sent),
            failed_count: count(&|cr| cr.status == SendStatus::Failed),
            pending_count: count(&|cr| cr.status == SendStatus::Pending),
            opened_count: count(&|cr| cr.opened_at.is_some()),
            clicked_count: count(&|cr| cr.clicked_at.is_some()),
            submitted_count: i64::try_from(submitted).unwrap_or(i64::MAX),
            ..Default::default()
        }
        .with_rates())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::new(SubmissionCipher::new([3u8; 32]))
    }

    fn campaign_in(store: &MemoryStore, status: CampaignStatus) -> Uuid {
        let id = Uuid::new_v4();
        store.insert_campaign(Campaign {
            id,
            name: "Drill".to_string(),
            template_id: Uuid::new_v4(),
            form_template_id: None,
            track_open: true,
            track_click: true,
            redirect_url: None,
            status,
            scheduled_at: None,
            sent_at: None,
        });
        id
    }

    #[tokio::test]
    async fn test_mark_clicked_keeps_first_timestamp() {
        let store = store();
        let cr = store.add_campaign_recipient(Uuid::new_v4(), Uuid::new_v4());
        let first = Utc::now();
        let later = first + chrono::Duration::seconds(30);

        store.mark_clicked(cr.id, first).await.unwrap();
        let row = store.mark_clicked(cr.id, later).await.unwrap();
        assert_eq!(row.clicked_at, Some(first));
    }

    #[tokio::test]
    async fn test_assign_tracking_token_conflict() {
        let store = store();
        let campaign_id = Uuid::new_v4();
        let a = store.add_campaign_recipient(campaign_id, Uuid::new_v4());
        let b = store.add_campaign_recipient(campaign_id, Uuid::new_v4());

        store.assign_tracking_token(a.id, "dup").await.unwrap();
        let err = store.assign_tracking_token(b.id, "dup").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_assign_tracking_token_keeps_existing() {
        let store = store();
        let cr = store.add_campaign_recipient(Uuid::new_v4(), Uuid::new_v4());
        store.assign_tracking_token(cr.id, "first").await.unwrap();
        let row = store.assign_tracking_token(cr.id, "second").await.unwrap();
        assert_eq!(row.tracking_token.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_sync_preserves_history_of_kept_recipients() {
        let store = store();
        let campaign_id = campaign_in(&store, CampaignStatus::Draft);
        let (kept, dropped, added) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let kept_row = store.add_campaign_recipient(campaign_id, kept);
        store.add_campaign_recipient(campaign_id, dropped);
        store.mark_opened(kept_row.id, Utc::now()).await.unwrap();

        let rows = store
            .sync_campaign_recipients(campaign_id, &[kept, added])
            .await
            .unwrap();

        assert_eq!(rows.len(), 2);
        let kept_after = rows.iter().find(|r| r.recipient_id == kept).unwrap();
        assert_eq!(kept_after.id, kept_row.id);
        assert!(kept_after.opened_at.is_some());
        assert!(rows.iter().any(|r| r.recipient_id == added && r.status == SendStatus::Pending));
        assert!(!rows.iter().any(|r| r.recipient_id == dropped));
    }

    #[tokio::test]
    async fn test_sync_rejected_once_dispatch_claimed_campaign() {
        let store = store();
        let campaign_id = campaign_in(&store, CampaignStatus::Draft);
        let recipient_id = Uuid::new_v4();
        let row = store.add_campaign_recipient(campaign_id, recipient_id);

        store
            .transition_campaign(
                campaign_id,
                &CampaignStatus::SENDABLE,
                CampaignStatus::Sending,
                None,
            )
            .await
            .unwrap()
            .unwrap();

        let err = store
            .sync_campaign_recipients(campaign_id, &[Uuid::new_v4()])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotEditable(CampaignStatus::Sending)));
        let rows = store.list_campaign_recipients(campaign_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, row.id);
    }

    #[tokio::test]
    async fn test_sync_unknown_campaign() {
        let store = store();
        let err = store
            .sync_campaign_recipients(Uuid::new_v4(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_transition_refuses_unreachable_status() {
        let store = store();
        let campaign_id = campaign_in(&store, CampaignStatus::Draft);

        let skipped = store
            .transition_campaign(campaign_id, &[CampaignStatus::Draft], CampaignStatus::Sent, None)
            .await
            .unwrap();
        assert!(skipped.is_none());
        assert_eq!(store.campaign(campaign_id).unwrap().status, CampaignStatus::Draft);

        let cancelled = store
            .transition_campaign(
                campaign_id,
                &[CampaignStatus::Draft],
                CampaignStatus::Cancelled,
                None,
            )
            .await
            .unwrap();
        assert!(cancelled.is_none());
    }

    #[tokio::test]
    async fn test_submission_is_sealed_at_rest() {
        let store = store();
        let cr = store.add_campaign_recipient(Uuid::new_v4(), Uuid::new_v4());
        let data = serde_json::json!({"password": "hunter2"});
        let saved = store
            .insert_submission(NewFormSubmission {
                campaign_recipient_id: cr.id,
                form_template_id: Uuid::new_v4(),
                submitted_data: data.clone(),
                ip_address: None,
                user_agent: None,
                referer: None,
            })
            .await
            .unwrap();

        let sealed = store.sealed_submission(saved.id).unwrap();
        assert!(!sealed.contains("hunter2"));
        let loaded = store.find_submission(saved.id).await.unwrap().unwrap();
        assert_eq!(loaded.submitted_data, data);
    }
}
