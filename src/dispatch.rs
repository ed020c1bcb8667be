//! Campaign dispatch: render one tracked email per recipient and hand it to
//! the mail transport, recording each outcome on the recipient's row.
//!
//! Sends run concurrently, bounded by `dispatch_concurrency`. A failure is
//! confined to its recipient; the campaign always finishes as `sent`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::email::MailTransport;
use crate::models::{Campaign, CampaignRecipient, CampaignStatus, DispatchTarget};
use crate::rewriter::{self, EmailRewrite};
use crate::store::{CampaignStore, StoreError};
use crate::tokens;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Campaign not found")]
    CampaignNotFound,

    #[error("Campaign cannot be sent while {0}")]
    NotSendable(CampaignStatus),

    #[error("Email template {0} not found")]
    TemplateMissing(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    Sent,
    Failed,
    Skipped,
}

impl DispatchReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Sent => self.sent += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Skipped => self.skipped += 1,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DispatchSettings {
    pub base_url: String,
    pub concurrency: usize,
    pub send_timeout: Duration,
    pub rate_limit: Duration,
}

impl DispatchSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            concurrency: config.dispatch_concurrency.max(1),
            send_timeout: config.mail_send_timeout(),
            rate_limit: Duration::from_millis(config.smtp_rate_limit_ms),
        }
    }

    fn click_endpoint(&self) -> String {
        format!("{}/track/click", self.base_url)
    }
}

/// Per-campaign data shared by every send task.
struct Job {
    campaign: Campaign,
    subject: String,
    body: String,
    has_form_template: bool,
    click_endpoint: String,
}

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn CampaignStore>,
    mail: Arc<dyn MailTransport>,
    settings: Arc<DispatchSettings>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        mail: Arc<dyn MailTransport>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            store,
            mail,
            settings: Arc::new(settings),
        }
    }

    /// Send every recipient of a draft or scheduled campaign.
    ///
    /// Nothing is mutated when the campaign is not sendable or its template
    /// is missing.
    pub async fn dispatch(&self, campaign_id: Uuid) -> Result<DispatchReport, DispatchError> {
        let campaign = self
            .store
            .find_campaign(campaign_id)
            .await?
            .ok_or(DispatchError::CampaignNotFound)?;
        if !campaign.status.can_be_sent() {
            return Err(DispatchError::NotSendable(campaign.status));
        }

        let template = self
            .store
            .find_email_template(campaign.template_id)
            .await?
            .ok_or(DispatchError::TemplateMissing(campaign.template_id))?;

        let has_form_template = match campaign.form_template_id {
            Some(id) => self.store.find_form_template(id).await?.is_some(),
            None => false,
        };

        let previous_status = campaign.status;
        let campaign = self
            .store
            .transition_campaign(
                campaign_id,
                &CampaignStatus::SENDABLE,
                CampaignStatus::Sending,
                None,
            )
            .await?
            .ok_or(DispatchError::NotSendable(CampaignStatus::Sending))?;

        let targets = match self.store.list_dispatch_targets(campaign_id).await {
            Ok(targets) => targets,
            Err(e) => {
                let restored = self
                    .store
                    .transition_campaign(
                        campaign_id,
                        &[CampaignStatus::Sending],
                        previous_status,
                        None,
                    )
                    .await;
                match restored {
                    Ok(Some(_)) => {}
                    Ok(None) => tracing::warn!(
                        campaign_id = %campaign_id,
                        "Campaign left 'sending' before its status could be restored"
                    ),
                    Err(revert) => tracing::error!(
                        campaign_id = %campaign_id,
                        "Could not restore campaign status to {previous_status}: {revert}"
                    ),
                }
                return Err(e.into());
            }
        };

        tracing::info!(
            campaign_id = %campaign_id,
            recipients = targets.len(),
            "Dispatching campaign '{}'",
            campaign.name
        );

        let job = Arc::new(Job {
            campaign,
            subject: template.subject,
            body: template.html_body,
            has_form_template,
            click_endpoint: self.settings.click_endpoint(),
        });
        let report = self.send_all(&job, targets).await;

        let finished = self
            .store
            .transition_campaign(
                campaign_id,
                &[CampaignStatus::Sending],
                CampaignStatus::Sent,
                Some(Utc::now()),
            )
            .await?;
        if finished.is_none() {
            tracing::warn!(campaign_id = %campaign_id, "Campaign left 'sending' during dispatch");
        }

        tracing::info!(
            campaign_id = %campaign_id,
            sent = report.sent,
            failed = report.failed,
            skipped = report.skipped,
            "Campaign dispatch complete"
        );
        Ok(report)
    }

    async fn send_all(&self, job: &Arc<Job>, targets: Vec<DispatchTarget>) -> DispatchReport {
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency));
        let mut tasks = JoinSet::new();

        for target in targets {
            let worker = self.clone();
            let job = Arc::clone(job);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return Outcome::Failed;
                };
                worker.deliver(&job, target).await
            });
        }

        let mut report = DispatchReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    tracing::error!(campaign_id = %job.campaign.id, "Send task aborted: {e}");
                    report.record(Outcome::Failed);
                }
            }
        }
        report
    }

    async fn deliver(&self, job: &Job, target: DispatchTarget) -> Outcome {
        let row = target.campaign_recipient;
        let campaign_id = job.campaign.id;

        let Some(recipient) = target.recipient else {
            tracing::warn!(
                campaign_id = %campaign_id,
                recipient_id = %row.recipient_id,
                "Recipient record missing, skipping"
            );
            return Outcome::Skipped;
        };
        if !recipient.is_subscribed {
            tracing::debug!(
                campaign_id = %campaign_id,
                recipient_id = %recipient.id,
                "Recipient unsubscribed, skipping"
            );
            return Outcome::Skipped;
        }

        if let Err(e) = tokens::ensure_token(self.store.as_ref(), &row).await {
            tracing::error!(campaign_id = %campaign_id, email = %recipient.email, "Tracking token unavailable: {e}");
            self.record_failure(campaign_id, &row, &e.to_string()).await;
            return Outcome::Failed;
        }

        let click_url = rewriter::click_url(&self.settings.base_url, campaign_id, recipient.id);
        let pixel_url = job.campaign.track_open.then(|| {
            rewriter::pixel_url(&self.settings.base_url, campaign_id, recipient.id, Utc::now())
        });
        let html = rewriter::rewrite_email(&EmailRewrite {
            body: &job.body,
            track_open: job.campaign.track_open,
            track_click: job.campaign.track_click,
            has_form_template: job.has_form_template,
            click_url: &click_url,
            pixel_url: pixel_url.as_deref(),
            click_endpoint: &job.click_endpoint,
        });

        let sent = tokio::time::timeout(
            self.settings.send_timeout,
            self.mail.send(&recipient.email, &job.subject, &html),
        )
        .await;

        let outcome = match sent {
            Ok(Ok(())) => {
                if let Err(e) = self.store.mark_sent(row.id, Utc::now()).await {
                    tracing::error!(email = %recipient.email, "Sent but could not record it: {e}");
                }
                Outcome::Sent
            }
            Ok(Err(e)) => {
                tracing::error!(campaign_id = %campaign_id, email = %recipient.email, "Failed to send: {e}");
                self.record_failure(campaign_id, &row, &e.to_string()).await;
                Outcome::Failed
            }
            Err(_) => {
                let detail = format!(
                    "Mail transport timed out after {}s",
                    self.settings.send_timeout.as_secs()
                );
                tracing::error!(campaign_id = %campaign_id, email = %recipient.email, "{detail}");
                self.record_failure(campaign_id, &row, &detail).await;
                Outcome::Failed
            }
        };

        if !self.settings.rate_limit.is_zero() {
            tokio::time::sleep(self.settings.rate_limit).await;
        }
        outcome
    }

    async fn record_failure(&self, campaign_id: Uuid, row: &CampaignRecipient, detail: &str) {
        if let Err(e) = self.store.mark_failed(row.id, detail).await {
            tracing::error!(
                campaign_id = %campaign_id,
                campaign_recipient_id = %row.id,
                "Could not record send failure ({detail}): {e}"
            );
        }
    }
}

/// Background loop: dispatches scheduled campaigns once they are due.
pub async fn campaign_scheduler(
    store: Arc<dyn CampaignStore>,
    dispatcher: Dispatcher,
    interval: Duration,
) {
    loop {
        tokio::time::sleep(interval).await;

        match store.due_campaigns(Utc::now()).await {
            Ok(due) => {
                for campaign_id in due {
                    tracing::info!("Scheduler triggering campaign {campaign_id}");
                    let dispatcher = dispatcher.clone();
                    tokio::spawn(async move {
                        if let Err(e) = dispatcher.dispatch(campaign_id).await {
                            tracing::error!("Scheduled dispatch failed for {campaign_id}: {e}");
                        }
                    });
                }
            }
            Err(e) => {
                tracing::error!("Scheduler query failed: {e}");
            }
        }
    }
}
