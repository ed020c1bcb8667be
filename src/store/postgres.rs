use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{CampaignStore, StoreError};
use crate::models::{
    Campaign, CampaignRecipient, CampaignStats, CampaignStatus, DispatchTarget, EmailTemplate,
    FormSubmission, FormTemplate, NewFormSubmission, Recipient,
};
use crate::security::SubmissionCipher;

const CAMPAIGN_COLUMNS: &str = "id, name, template_id, form_template_id, track_open, track_click, \
     redirect_url, status, scheduled_at, sent_at";

const CR_COLUMNS: &str = "id, campaign_id, recipient_id, status, sent_at, opened_at, clicked_at, \
     error_message, tracking_token";

const SUBMISSION_COLUMNS: &str = "id, campaign_recipient_id, form_template_id, submitted_data, \
     ip_address, user_agent, referer, is_aware, awareness_acknowledged_at, created_at";

type CampaignRow = (
    Uuid,
    String,
    Uuid,
    Option<Uuid>,
    bool,
    bool,
    Option<String>,
    String,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
);

type CampaignRecipientRow = (
    Uuid,
    Uuid,
    Uuid,
    String,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
    Option<String>,
    Option<String>,
);

type SubmissionRow = (
    Uuid,
    Uuid,
    Uuid,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    bool,
    Option<DateTime<Utc>>,
    DateTime<Utc>,
);

fn campaign_from_row(row: CampaignRow) -> Result<Campaign, StoreError> {
    let (
        id,
        name,
        template_id,
        form_template_id,
        track_open,
        track_click,
        redirect_url,
        status,
        scheduled_at,
        sent_at,
    ) = row;
    Ok(Campaign {
        id,
        name,
        template_id,
        form_template_id,
        track_open,
        track_click,
        redirect_url: redirect_url.filter(|u| !u.is_empty()),
        status: status
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("campaign {id}: {e}")))?,
        scheduled_at,
        sent_at,
    })
}

fn campaign_recipient_from_row(row: CampaignRecipientRow) -> Result<CampaignRecipient, StoreError> {
    let (
        id,
        campaign_id,
        recipient_id,
        status,
        sent_at,
        opened_at,
        clicked_at,
        error_message,
        tracking_token,
    ) = row;
    Ok(CampaignRecipient {
        id,
        campaign_id,
        recipient_id,
        status: status
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("campaign recipient {id}: {e}")))?,
        sent_at,
        opened_at,
        clicked_at,
        error_message,
        tracking_token,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

pub struct PostgresCampaignStore {
    pool: PgPool,
    cipher: SubmissionCipher,
}

impl PostgresCampaignStore {
    pub fn new(pool: PgPool, cipher: SubmissionCipher) -> Self {
        Self { pool, cipher }
    }

    async fn fetch_campaign_recipient(&self, id: Uuid) -> Result<CampaignRecipient, StoreError> {
        let row = sqlx::query_as::<_, CampaignRecipientRow>(&format!(
            "SELECT {CR_COLUMNS} FROM campaign_recipients WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("campaign recipient {id}")))?;
        campaign_recipient_from_row(row)
    }

    /// Run a set-once update; when the guard rejects it, return the row as is.
    async fn update_once(&self, sql: &str, id: Uuid, at: DateTime<Utc>) -> Result<CampaignRecipient, StoreError> {
        let row = sqlx::query_as::<_, CampaignRecipientRow>(sql)
            .bind(at)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => campaign_recipient_from_row(row),
            None => self.fetch_campaign_recipient(id).await,
        }
    }

    fn submission_from_row(&self, row: SubmissionRow) -> Result<FormSubmission, StoreError> {
        let (
            id,
            campaign_recipient_id,
            form_template_id,
            sealed,
            ip_address,
            user_agent,
            referer,
            is_aware,
            awareness_acknowledged_at,
            created_at,
        ) = row;
        Ok(FormSubmission {
            id,
            campaign_recipient_id,
            form_template_id,
            submitted_data: self.cipher.decrypt_json(&sealed)?,
            ip_address,
            user_agent,
            referer,
            is_aware,
            awareness_acknowledged_at,
            created_at,
        })
    }
}

#[async_trait]
impl CampaignStore for PostgresCampaignStore {
    async fn find_campaign(&self, id: Uuid) -> Result<Option<Campaign>, StoreError> {
        sqlx::query_as::<_, CampaignRow>(&format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(campaign_from_row)
        .transpose()
    }

    async fn transition_campaign(
        &self,
        id: Uuid,
        from: &[CampaignStatus],
        to: CampaignStatus,
        sent_at: Option<DateTime<Utc>>,
    ) -> Result<Option<Campaign>, StoreError> {
        let from: Vec<String> = from
            .iter()
            .filter(|s| s.can_transition_to(to))
            .map(|s| s.as_str().to_string())
            .collect();
        if from.is_empty() {
            return Ok(None);
        }
        sqlx::query_as::<_, CampaignRow>(&format!(
            "UPDATE campaigns SET status = $1, sent_at = COALESCE($2, sent_at), updated_at = NOW() \
             WHERE id = $3 AND status = ANY($4) RETURNING {CAMPAIGN_COLUMNS}"
        ))
        .bind(to.as_str())
        .bind(sent_at)
        .bind(id)
        .bind(&from)
        .fetch_optional(&self.pool)
        .await?
        .map(campaign_from_row)
        .transpose()
    }

    async fn due_campaigns(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM campaigns WHERE status = 'scheduled' AND scheduled_at <= $1 \
             ORDER BY scheduled_at",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn find_email_template(&self, id: Uuid) -> Result<Option<EmailTemplate>, StoreError> {
        let row = sqlx::query_as::<_, (Uuid, String, String, String)>(
            "SELECT id, name, subject, html_body FROM email_templates WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id, name, subject, html_body)| EmailTemplate {
            id,
            name,
            subject,
            html_body,
        }))
    }

    async fn find_form_template(&self, id: Uuid) -> Result<Option<FormTemplate>, StoreError> {
        let row = sqlx::query_as::<_, (Uuid, String, String, Option<String>, bool, serde_json::Value)>(
            "SELECT id, name, html_content, target_url, is_active, metadata \
             FROM form_templates WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(
            |(id, name, html_content, target_url, is_active, metadata)| FormTemplate {
                id,
                name,
                html_content,
                target_url: target_url.filter(|u| !u.is_empty()),
                is_active,
                metadata,
            },
        ))
    }

    async fn find_recipient(&self, id: Uuid) -> Result<Option<Recipient>, StoreError> {
        let row = sqlx::query_as::<_, (Uuid, String, String, bool)>(
            "SELECT id, email, name, is_subscribed FROM recipients WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id, email, name, is_subscribed)| Recipient {
            id,
            email,
            name,
            is_subscribed,
        }))
    }

    async fn list_campaign_recipients(
        &self,
        campaign_id: Uuid,
    ) -> Result<Vec<CampaignRecipient>, StoreError> {
        sqlx::query_as::<_, CampaignRecipientRow>(&format!(
            "SELECT {CR_COLUMNS} FROM campaign_recipients WHERE campaign_id = $1 \
             ORDER BY created_at, id"
        ))
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(campaign_recipient_from_row)
        .collect()
    }

    async fn list_dispatch_targets(
        &self,
        campaign_id: Uuid,
    ) -> Result<Vec<DispatchTarget>, StoreError> {
        let rows = sqlx::query_as::<
            _,
            (
                Uuid,
                Uuid,
                Uuid,
                String,
                Option<DateTime<Utc>>,
                Option<DateTime<Utc>>,
                Option<DateTime<Utc>>,
                Option<String>,
                Option<String>,
                Option<String>,
                Option<String>,
                Option<bool>,
            ),
        >(
            "SELECT cr.id, cr.campaign_id, cr.recipient_id, cr.status, cr.sent_at, cr.opened_at, \
             cr.clicked_at, cr.error_message, cr.tracking_token, r.email, r.name, r.is_subscribed \
             FROM campaign_recipients cr LEFT JOIN recipients r ON r.id = cr.recipient_id \
             WHERE cr.campaign_id = $1 ORDER BY cr.created_at, cr.id",
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(
                |(id, cid, rid, status, sent, opened, clicked, error, token, email, name, subscribed)| {
                    let campaign_recipient = campaign_recipient_from_row((
                        id, cid, rid, status, sent, opened, clicked, error, token,
                    ))?;
                    let recipient = match (email, subscribed) {
                        (Some(email), Some(is_subscribed)) => Some(Recipient {
                            id: rid,
                            email,
                            name: name.unwrap_or_default(),
                            is_subscribed,
                        }),
                        _ => None,
                    };
                    Ok(DispatchTarget {
                        campaign_recipient,
                        recipient,
                    })
                },
            )
            .collect()
    }

    async fn sync_campaign_recipients(
        &self,
        campaign_id: Uuid,
        recipient_ids: &[Uuid],
    ) -> Result<Vec<CampaignRecipient>, StoreError> {
        let mut ids = recipient_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let mut tx = self.pool.begin().await?;

        // Row lock serialises this edit against dispatch claiming the campaign.
        let status = sqlx::query_scalar::<_, String>(
            "SELECT status FROM campaigns WHERE id = $1 FOR UPDATE",
        )
        .bind(campaign_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("campaign {campaign_id}")))?;
        let status: CampaignStatus = status
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("campaign {campaign_id}: {e}")))?;
        if !status.is_editable() {
            return Err(StoreError::NotEditable(status));
        }

        sqlx::query(
            "DELETE FROM campaign_recipients WHERE campaign_id = $1 AND NOT (recipient_id = ANY($2))",
        )
        .bind(campaign_id)
        .bind(&ids)
        .execute(&mut *tx)
        .await?;

        // Insert in the caller's order so creation order follows selection order.
        for recipient_id in recipient_ids {
            sqlx::query(
                "INSERT INTO campaign_recipients (campaign_id, recipient_id, status) \
                 VALUES ($1, $2, 'pending') ON CONFLICT (campaign_id, recipient_id) DO NOTHING",
            )
            .bind(campaign_id)
            .bind(recipient_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.list_campaign_recipients(campaign_id).await
    }

    async fn find_campaign_recipient(
        &self,
        campaign_id: Uuid,
        recipient_id: Uuid,
    ) -> Result<Option<CampaignRecipient>, StoreError> {
        sqlx::query_as::<_, CampaignRecipientRow>(&format!(
            "SELECT {CR_COLUMNS} FROM campaign_recipients WHERE campaign_id = $1 AND recipient_id = $2"
        ))
        .bind(campaign_id)
        .bind(recipient_id)
        .fetch_optional(&self.pool)
        .await?
        .map(campaign_recipient_from_row)
        .transpose()
    }

    async fn find_by_tracking_token(
        &self,
        token: &str,
    ) -> Result<Option<CampaignRecipient>, StoreError> {
        sqlx::query_as::<_, CampaignRecipientRow>(&format!(
            "SELECT {CR_COLUMNS} FROM campaign_recipients WHERE tracking_token = $1"
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await?
        .map(campaign_recipient_from_row)
        .transpose()
    }

    async fn assign_tracking_token(
        &self,
        campaign_recipient_id: Uuid,
        token: &str,
    ) -> Result<CampaignRecipient, StoreError> {
        let result = sqlx::query_as::<_, CampaignRecipientRow>(&format!(
            "UPDATE campaign_recipients SET tracking_token = $1, updated_at = NOW() \
             WHERE id = $2 AND tracking_token IS NULL RETURNING {CR_COLUMNS}"
        ))
        .bind(token)
        .bind(campaign_recipient_id)
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(Some(row)) => campaign_recipient_from_row(row),
            Ok(None) => self.fetch_campaign_recipient(campaign_recipient_id).await,
            Err(e) if is_unique_violation(&e) => Err(StoreError::Conflict(
                "campaign_recipients.tracking_token".to_string(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn mark_sent(
        &self,
        campaign_recipient_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<CampaignRecipient, StoreError> {
        let row = sqlx::query_as::<_, CampaignRecipientRow>(&format!(
            "UPDATE campaign_recipients SET status = 'sent', sent_at = $1, error_message = NULL, \
             updated_at = NOW() WHERE id = $2 RETURNING {CR_COLUMNS}"
        ))
        .bind(at)
        .bind(campaign_recipient_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("campaign recipient {campaign_recipient_id}")))?;
        campaign_recipient_from_row(row)
    }

    async fn mark_failed(
        &self,
        campaign_recipient_id: Uuid,
        error: &str,
    ) -> Result<CampaignRecipient, StoreError> {
        let row = sqlx::query_as::<_, CampaignRecipientRow>(&format!(
            "UPDATE campaign_recipients SET status = 'failed', error_message = $1, \
             updated_at = NOW() WHERE id = $2 RETURNING {CR_COLUMNS}"
        ))
        .bind(error)
        .bind(campaign_recipient_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("campaign recipient {campaign_recipient_id}")))?;
        campaign_recipient_from_row(row)
    }

    async fn mark_opened(
        &self,
        campaign_recipient_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<CampaignRecipient, StoreError> {
        self.update_once(
            &format!(
                "UPDATE campaign_recipients SET opened_at = $1, updated_at = NOW() \
                 WHERE id = $2 AND opened_at IS NULL RETURNING {CR_COLUMNS}"
            ),
            campaign_recipient_id,
            at,
        )
        .await
    }

    async fn mark_clicked(
        &self,
        campaign_recipient_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<CampaignRecipient, StoreError> {
        self.update_once(
            &format!(
                "UPDATE campaign_recipients SET clicked_at = $1, updated_at = NOW() \
                 WHERE id = $2 AND clicked_at IS NULL RETURNING {CR_COLUMNS}"
            ),
            campaign_recipient_id,
            at,
        )
        .await
    }

    async fn insert_submission(
        &self,
        submission: NewFormSubmission,
    ) -> Result<FormSubmission, StoreError> {
        let sealed = self.cipher.encrypt_json(&submission.submitted_data)?;
        let (id, created_at) = sqlx::query_as::<_, (Uuid, DateTime<Utc>)>(
            "INSERT INTO form_submissions \
             (campaign_recipient_id, form_template_id, submitted_data, ip_address, user_agent, referer) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id, created_at",
        )
        .bind(submission.campaign_recipient_id)
        .bind(submission.form_template_id)
        .bind(&sealed)
        .bind(&submission.ip_address)
        .bind(&submission.user_agent)
        .bind(&submission.referer)
        .fetch_one(&self.pool)
        .await?;

        Ok(FormSubmission {
            id,
            campaign_recipient_id: submission.campaign_recipient_id,
            form_template_id: submission.form_template_id,
            submitted_data: submission.submitted_data,
            ip_address: submission.ip_address,
            user_agent: submission.user_agent,
            referer: submission.referer,
            is_aware: false,
            awareness_acknowledged_at: None,
            created_at,
        })
    }

    async fn find_submission(&self, id: Uuid) -> Result<Option<FormSubmission>, StoreError> {
        sqlx::query_as::<_, SubmissionRow>(&format!(
            "SELECT {SUBMISSION_COLUMNS} FROM form_submissions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| self.submission_from_row(row))
        .transpose()
    }

    async fn acknowledge_submission(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<FormSubmission>, StoreError> {
        sqlx::query(
            "UPDATE form_submissions SET is_aware = true, awareness_acknowledged_at = $1 \
             WHERE id = $2 AND is_aware = false",
        )
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.find_submission(id).await
    }

    async fn campaign_stats(&self, campaign_id: Uuid) -> Result<CampaignStats, StoreError> {
        let (total, sent, failed, pending, opened, clicked, submitted) =
            sqlx::query_as::<_, (i64, i64, i64, i64, i64, i64, i64)>(
                "SELECT COUNT(*), \
                 COUNT(*) FILTER (WHERE cr.status = 'sent'), \
                 COUNT(*) FILTER (WHERE cr.status = 'failed'), \
                 COUNT(*) FILTER (WHERE cr.status = 'pending'), \
                 COUNT(cr.opened_at), \
                 COUNT(cr.clicked_at), \
                 (SELECT COUNT(*) FROM form_submissions fs \
                  JOIN campaign_recipients c2 ON c2.id = fs.campaign_recipient_id \
                  WHERE c2.campaign_id = $1) \
                 FROM campaign_recipients cr WHERE cr.campaign_id = $1",
            )
            .bind(campaign_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(CampaignStats {
            total_recipients: total,
            sent_count: sent,
            failed_count: failed,
            pending_count: pending,
            opened_count: opened,
            clicked_count: clicked,
            submitted_count: submitted,
            ..Default::default()
        }
        .with_rates())
    }
}
