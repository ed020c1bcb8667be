use axum::extract::rejection::FormRejection;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap};
use axum::response::{Html, IntoResponse, Response};
use axum::{Form, Json};
use axum_extra::extract::cookie::{Cookie, SameSite};
use axum_extra::extract::CookieJar;
use chrono::Utc;
use uuid::Uuid;

use crate::capture::{self, CaptureOutcome, CaptureRequest, SESSION_COOKIE};
use crate::error::AppError;
use crate::rewriter::{self, LandingPage};
use crate::routes::ClientIp;
use crate::{security, tokens, AppState};

const ACKNOWLEDGED_MESSAGE: &str = "Thank you for confirming you understand the risks of phishing!";

const SECURITY_HEADERS: [(header::HeaderName, &str); 2] = [
    (header::X_FRAME_OPTIONS, "DENY"),
    (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
];

fn header_string(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Render a form template for the recipient owning `token`.
pub async fn landing_page(
    State(state): State<AppState>,
    Path((form_template_id, token)): Path<(String, String)>,
    jar: CookieJar,
) -> Result<(CookieJar, Response), AppError> {
    let form_template_id: Uuid = form_template_id.parse().map_err(|_| AppError::not_found())?;
    let template = state
        .store
        .find_form_template(form_template_id)
        .await?
        .ok_or_else(AppError::not_found)?;
    let row = tokens::resolve(state.store.as_ref(), &token)
        .await?
        .ok_or_else(AppError::not_found)?;

    if row.clicked_at.is_none() {
        state.store.mark_clicked(row.id, Utc::now()).await?;
    }

    let capture_url = format!(
        "{}/phishing/capture/{form_template_id}",
        state.config.base_url
    );
    let html = rewriter::process_landing_page(&LandingPage {
        html: &template.html_content,
        target_url: template.target_url.as_deref(),
        capture_url: &capture_url,
        token: &token,
    });

    let is_https = state.config.base_url.starts_with("https://");
    let cookie = Cookie::build((
        SESSION_COOKIE,
        security::sign_session_token(&state.config.session_secret, &token),
    ))
    .path("/phishing")
    .http_only(true)
    .secure(is_https)
    .same_site(SameSite::Lax)
    .max_age(time::Duration::hours(2))
    .build();

    Ok((jar.add(cookie), (SECURITY_HEADERS, Html(html)).into_response()))
}

/// Accept a landing-page post. Always ends on the awareness page.
pub async fn capture_submission(
    State(state): State<AppState>,
    Path(form_template_id): Path<String>,
    ClientIp(client_ip): ClientIp,
    headers: HeaderMap,
    jar: CookieJar,
    form: Result<Form<Vec<(String, String)>>, FormRejection>,
) -> Result<Response, AppError> {
    let outcome = match form_template_id.parse::<Uuid>() {
        Ok(form_template_id) => {
            let fields = match form {
                Ok(Form(fields)) => fields,
                Err(e) => {
                    tracing::warn!("Unreadable form submission: {e}");
                    Vec::new()
                }
            };
            let session_token = jar.get(SESSION_COOKIE).and_then(|c| {
                security::verify_session_token(&state.config.session_secret, c.value())
            });

            capture::capture(
                state.store.as_ref(),
                CaptureRequest {
                    form_template_id,
                    fields,
                    session_token,
                    ip_address: client_ip.map(|ip| ip.to_string()),
                    user_agent: header_string(&headers, header::USER_AGENT),
                    referer: header_string(&headers, header::REFERER),
                },
            )
            .await
        }
        Err(_) => CaptureOutcome::Unknown,
    };

    let mut ctx = tera::Context::new();
    ctx.insert("identifier", outcome.identifier());
    if let Some(submission) = outcome.submission() {
        let fields: Vec<&String> = submission
            .submitted_data
            .as_object()
            .map(|data| data.keys().collect())
            .unwrap_or_default();
        ctx.insert("submission_id", &submission.id);
        ctx.insert("captured_fields", &fields);
        ctx.insert(
            "acknowledge_url",
            &format!("/phishing/acknowledge/{}", submission.id),
        );
    }
    let html = state.tera.render("phishing/awareness.html", &ctx)?;

    Ok((SECURITY_HEADERS, Html(html)).into_response())
}

pub async fn acknowledge(
    State(state): State<AppState>,
    Path(submission_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let submission_id: Uuid = submission_id.parse().map_err(|_| AppError::not_found())?;
    let submission = capture::acknowledge(state.store.as_ref(), submission_id)
        .await?
        .ok_or_else(AppError::not_found)?;

    tracing::info!(submission_id = %submission.id, "Awareness acknowledged");

    Ok(Json(serde_json::json!({
        "success": true,
        "message": ACKNOWLEDGED_MESSAGE,
    })))
}
