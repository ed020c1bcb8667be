use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
#[error("Unknown {kind} value: {value}")]
pub struct ParseStatusError {
    kind: &'static str,
    value: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Sending,
    Sent,
    Cancelled,
}

impl CampaignStatus {
    pub const SENDABLE: [Self; 2] = [Self::Draft, Self::Scheduled];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn can_be_sent(self) -> bool {
        Self::SENDABLE.contains(&self)
    }

    pub fn is_editable(self) -> bool {
        matches!(self, Self::Draft | Self::Scheduled)
    }

    /// Status moves forward only. Editing may move a scheduled campaign back
    /// to draft (its schedule was cleared) and only a scheduled campaign can
    /// be cancelled. A dispatch that fails before sending anything hands the
    /// campaign back to draft or scheduled.
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Draft, Self::Scheduled | Self::Sending)
            | (Self::Scheduled, Self::Draft | Self::Sending | Self::Cancelled)
            | (Self::Sending, Self::Sent | Self::Draft | Self::Scheduled) => true,
            (current, next) => current == next && current.is_editable(),
        }
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "scheduled" => Ok(Self::Scheduled),
            "sending" => Ok(Self::Sending),
            "sent" => Ok(Self::Sent),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ParseStatusError {
                kind: "campaign status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SendStatus {
    Pending,
    Sent,
    Failed,
}

impl SendStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for SendStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            other => Err(ParseStatusError {
                kind: "send status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    pub template_id: Uuid,
    pub form_template_id: Option<Uuid>,
    pub track_open: bool,
    pub track_click: bool,
    pub redirect_url: Option<String>,
    pub status: CampaignStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Recipient {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub is_subscribed: bool,
}

/// One row per (campaign, recipient) pair.
#[derive(Clone, Debug, Serialize)]
pub struct CampaignRecipient {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub recipient_id: Uuid,
    pub status: SendStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub clicked_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    #[serde(skip_serializing)]
    pub tracking_token: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct EmailTemplate {
    pub id: Uuid,
    pub name: String,
    pub subject: String,
    pub html_body: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct FormTemplate {
    pub id: Uuid,
    pub name: String,
    pub html_content: String,
    pub target_url: Option<String>,
    pub is_active: bool,
    pub metadata: serde_json::Value,
}

/// Captured landing-page post. `submitted_data` is the decrypted value.
#[derive(Clone, Debug, Serialize)]
pub struct FormSubmission {
    pub id: Uuid,
    pub campaign_recipient_id: Uuid,
    pub form_template_id: Uuid,
    pub submitted_data: serde_json::Value,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub is_aware: bool,
    pub awareness_acknowledged_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewFormSubmission {
    pub campaign_recipient_id: Uuid,
    pub form_template_id: Uuid,
    pub submitted_data: serde_json::Value,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
}

/// A campaign-recipient row joined with its recipient, if the recipient
/// still exists.
#[derive(Clone, Debug)]
pub struct DispatchTarget {
    pub campaign_recipient: CampaignRecipient,
    pub recipient: Option<Recipient>,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct CampaignStats {
    pub total_recipients: i64,
    pub sent_count: i64,
    pub failed_count: i64,
    pub pending_count: i64,
    pub opened_count: i64,
    pub clicked_count: i64,
    pub submitted_count: i64,
    pub open_rate: f64,
    pub click_rate: f64,
    pub submission_rate: f64,
}

impl CampaignStats {
    /// Fill in the percentage rates (relative to sent count, two decimals).
    #[must_use]
    pub fn with_rates(mut self) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let rate = |n: i64| {
            if self.sent_count > 0 {
                ((n as f64 / self.sent_count as f64) * 10_000.0).round() / 100.0
            } else {
                0.0
            }
        };
        self.open_rate = rate(self.opened_count);
        self.click_rate = rate(self.clicked_count);
        self.submission_rate = rate(self.submitted_count);
        self
    }
}
