//! Landing-page form capture and the awareness acknowledgement.

use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::models::{FormSubmission, NewFormSubmission};
use crate::store::{CampaignStore, StoreError};
use crate::tokens;

/// Cookie set when a landing page is rendered; carries the signed token.
pub const SESSION_COOKIE: &str = "phish_session";

pub const TOKEN_FIELD: &str = "_tracking_token";

/// Form plumbing that is never stored with the captured data.
const FRAMEWORK_FIELDS: [&str; 3] = ["_token", "_method", TOKEN_FIELD];

fn referer_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"/phishing/template/[0-9A-Fa-f-]+/([A-Za-z0-9_-]+)")
                .map_err(|e| tracing::warn!("Referer pattern failed to compile: {e}"))
                .ok()
        })
        .as_ref()
}

pub fn token_from_referer(referer: &str) -> Option<String> {
    referer_pattern()?
        .captures(referer)
        .map(|caps| caps[1].to_string())
}

/// Posted hidden field first, then the session cookie, then the referer.
pub fn resolve_token(
    posted: Option<&str>,
    session: Option<&str>,
    referer: Option<&str>,
) -> Option<String> {
    let non_empty = |v: Option<&str>| v.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
    non_empty(posted)
        .or_else(|| non_empty(session))
        .or_else(|| referer.and_then(token_from_referer))
}

pub fn posted_token(fields: &[(String, String)]) -> Option<&str> {
    fields
        .iter()
        .find(|(name, _)| name == TOKEN_FIELD)
        .map(|(_, value)| value.as_str())
}

/// Turn posted fields into a JSON object. Repeated names (checkbox groups,
/// `name[]` inputs) collect into an array.
pub fn build_submitted_data(fields: &[(String, String)]) -> Value {
    let mut data = Map::new();
    for (name, value) in fields {
        if FRAMEWORK_FIELDS.contains(&name.as_str()) {
            continue;
        }
        let value = Value::String(value.clone());
        match data.get_mut(name) {
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                data.insert(name.clone(), value);
            }
        }
    }
    Value::Object(data)
}

#[derive(Clone, Debug, Default)]
pub struct CaptureRequest {
    pub form_template_id: Uuid,
    pub fields: Vec<(String, String)>,
    pub session_token: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
}

#[derive(Debug)]
pub enum CaptureOutcome {
    Captured {
        submission: Box<FormSubmission>,
        identifier: String,
    },
    /// No token, or the token matched nobody.
    Unknown,
    /// Something broke while saving; nothing is shown to the visitor.
    Error,
}

impl CaptureOutcome {
    pub fn identifier(&self) -> &str {
        match self {
            Self::Captured { identifier, .. } => identifier.as_str(),
            Self::Unknown => "unknown",
            Self::Error => "error",
        }
    }

    pub fn submission(&self) -> Option<&FormSubmission> {
        match self {
            Self::Captured { submission, .. } => Some(&**submission),
            _ => None,
        }
    }
}

/// Store a landing-page post against the recipient it belongs to. Never
/// fails: unresolvable posts map to `Unknown` and errors to `Error`.
pub async fn capture(store: &dyn CampaignStore, request: CaptureRequest) -> CaptureOutcome {
    let form_template_id = request.form_template_id;
    match try_capture(store, request).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(%form_template_id, "Error capturing form submission: {e}");
            CaptureOutcome::Error
        }
    }
}

async fn try_capture(
    store: &dyn CampaignStore,
    request: CaptureRequest,
) -> Result<CaptureOutcome, StoreError> {
    let form_template_id = request.form_template_id;
    let Some(token) = resolve_token(
        posted_token(&request.fields),
        request.session_token.as_deref(),
        request.referer.as_deref(),
    ) else {
        tracing::warn!(%form_template_id, ip = ?request.ip_address, "Form submission without tracking token");
        return Ok(CaptureOutcome::Unknown);
    };

    let Some(row) = tokens::resolve(store, &token).await? else {
        tracing::warn!(%form_template_id, "Form submission with unknown tracking token");
        return Ok(CaptureOutcome::Unknown);
    };
    if store.find_form_template(form_template_id).await?.is_none() {
        tracing::warn!(%form_template_id, "Form submission for unknown form template");
        return Ok(CaptureOutcome::Unknown);
    }

    let submission = store
        .insert_submission(NewFormSubmission {
            campaign_recipient_id: row.id,
            form_template_id,
            submitted_data: build_submitted_data(&request.fields),
            ip_address: request.ip_address,
            user_agent: request.user_agent,
            referer: request.referer,
        })
        .await?;

    tracing::info!(
        submission_id = %submission.id,
        campaign_recipient_id = %row.id,
        %form_template_id,
        "Form submission captured"
    );

    let identifier = store
        .find_recipient(row.recipient_id)
        .await?
        .map_or_else(|| "unknown".to_string(), |r| r.email);

    Ok(CaptureOutcome::Captured {
        submission: Box::new(submission),
        identifier,
    })
}

/// Flag a submission as acknowledged. Only the first call stamps the time.
pub async fn acknowledge(
    store: &dyn CampaignStore,
    submission_id: Uuid,
) -> Result<Option<FormSubmission>, StoreError> {
    store.acknowledge_submission(submission_id, Utc::now()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::tests::Fixture;
    use crate::email::tests::MockMailTransport;

    fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    async fn fixture_with_token() -> (Fixture, Uuid, String) {
        let fx = Fixture::new(MockMailTransport::default());
        let form_id = fx.attach_form_template();
        let recipient_id = fx.add_recipient("alice@corp.test", true);
        let row = fx
            .store
            .find_campaign_recipient(fx.campaign_id, recipient_id)
            .await
            .unwrap()
            .unwrap();
        let row = tokens::ensure_token(fx.store.as_ref(), &row).await.unwrap();
        (fx, form_id, row.tracking_token.unwrap())
    }

    #[test]
    fn test_token_priority() {
        assert_eq!(
            resolve_token(Some("posted"), Some("session"), Some("/phishing/template/1/ref")),
            Some("posted".to_string())
        );
        assert_eq!(
            resolve_token(Some(""), Some("session"), None),
            Some("session".to_string())
        );
        assert_eq!(
            resolve_token(None, None, Some("https://sim.test/phishing/template/5f0c-aa/abc123?x=1")),
            Some("abc123".to_string())
        );
        assert_eq!(resolve_token(None, None, Some("https://elsewhere.test/")), None);
        assert_eq!(resolve_token(None, None, None), None);
    }

    #[test]
    fn test_submitted_data_strips_plumbing_and_groups_repeats() {
        let data = build_submitted_data(&fields(&[
            ("_token", "csrf"),
            ("_method", "POST"),
            ("_tracking_token", "tok"),
            ("username", "alice"),
            ("role", "a"),
            ("role", "b"),
            ("role", "c"),
        ]));
        assert_eq!(
            data,
            serde_json::json!({"username": "alice", "role": ["a", "b", "c"]})
        );
    }

    #[tokio::test]
    async fn test_capture_round_trips_encrypted_data() {
        let (fx, form_id, token) = fixture_with_token().await;

        let outcome = capture(
            fx.store.as_ref(),
            CaptureRequest {
                form_template_id: form_id,
                fields: fields(&[
                    ("_tracking_token", token.as_str()),
                    ("email", "alice@corp.test"),
                    ("password", "Winter2024!"),
                ]),
                ip_address: Some("203.0.113.9".to_string()),
                user_agent: Some("Mozilla/5.0".to_string()),
                ..Default::default()
            },
        )
        .await;

        assert_eq!(outcome.identifier(), "alice@corp.test");
        let saved = outcome.submission().unwrap();
        assert!(!fx.store.sealed_submission(saved.id).unwrap().contains("Winter2024!"));

        let loaded = fx.store.find_submission(saved.id).await.unwrap().unwrap();
        assert_eq!(
            loaded.submitted_data,
            serde_json::json!({"email": "alice@corp.test", "password": "Winter2024!"})
        );
        assert_eq!(loaded.ip_address.as_deref(), Some("203.0.113.9"));
        assert!(!loaded.is_aware);
    }

    #[tokio::test]
    async fn test_capture_uses_session_token() {
        let (fx, form_id, token) = fixture_with_token().await;
        let outcome = capture(
            fx.store.as_ref(),
            CaptureRequest {
                form_template_id: form_id,
                fields: fields(&[("password", "x")]),
                session_token: Some(token),
                ..Default::default()
            },
        )
        .await;
        assert!(matches!(outcome, CaptureOutcome::Captured { .. }));
    }

    #[tokio::test]
    async fn test_capture_without_token_is_unknown() {
        let (fx, form_id, _) = fixture_with_token().await;
        let outcome = capture(
            fx.store.as_ref(),
            CaptureRequest {
                form_template_id: form_id,
                fields: fields(&[("password", "x")]),
                ..Default::default()
            },
        )
        .await;
        assert_eq!(outcome.identifier(), "unknown");
        assert_eq!(fx.store.submission_count(), 0);
    }

    #[tokio::test]
    async fn test_capture_with_bogus_token_is_unknown() {
        let (fx, form_id, _) = fixture_with_token().await;
        let outcome = capture(
            fx.store.as_ref(),
            CaptureRequest {
                form_template_id: form_id,
                fields: fields(&[("_tracking_token", "forged"), ("password", "x")]),
                ..Default::default()
            },
        )
        .await;
        assert!(matches!(outcome, CaptureOutcome::Unknown));
        assert_eq!(fx.store.submission_count(), 0);
    }

    #[tokio::test]
    async fn test_multiple_captures_allowed() {
        let (fx, form_id, token) = fixture_with_token().await;
        for _ in 0..2 {
            capture(
                fx.store.as_ref(),
                CaptureRequest {
                    form_template_id: form_id,
                    fields: fields(&[("_tracking_token", token.as_str()), ("password", "x")]),
                    ..Default::default()
                },
            )
            .await;
        }
        assert_eq!(fx.store.submission_count(), 2);
    }

    #[tokio::test]
    async fn test_acknowledge_is_idempotent() {
        let (fx, form_id, token) = fixture_with_token().await;
        let outcome = capture(
            fx.store.as_ref(),
            CaptureRequest {
                form_template_id: form_id,
                fields: fields(&[("_tracking_token", token.as_str())]),
                ..Default::default()
            },
        )
        .await;
        let id = outcome.submission().unwrap().id;

        let first = acknowledge(fx.store.as_ref(), id).await.unwrap().unwrap();
        assert!(first.is_aware);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = acknowledge(fx.store.as_ref(), id).await.unwrap().unwrap();
        assert_eq!(
            first.awareness_acknowledged_at,
            second.awareness_acknowledged_at
        );

        assert!(acknowledge(fx.store.as_ref(), Uuid::new_v4())
            .await
            .unwrap()
            .is_none());
    }
}
