//! Per-recipient HTML rewriting for campaign emails and landing pages.
//!
//! Everything here is pure. A pattern that fails to compile degrades to the
//! unmodified input with a warning; rewriting never returns an error.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::{Captures, Regex};
use uuid::Uuid;

/// Markers an author can place where the tracked link should go.
pub const LINK_PLACEHOLDERS: [&str; 3] = ["{{PHISHING_LINK}}", "{{LINK}}", "{{URL}}"];

const CTA_BUTTON: &str = concat!(
    r#"<div style="margin-top: 30px; padding: 20px; background: #f8f9fa; border-radius: 8px; text-align: center;">"#,
    r#"<p style="margin: 0 0 15px; font-size: 16px; color: #333;">Click the button below to continue:</p>"#,
    r#"<a href="{url}" style="display: inline-block; padding: 12px 30px; background: #007bff; color: white; text-decoration: none; border-radius: 5px; font-weight: bold;">Continue</a>"#,
    "</div>"
);

const WARNING_BANNER: &str = concat!(
    r#"<div style="position: fixed; top: 0; left: 0; right: 0; background: #fff3cd; border-bottom: 2px solid #ffc107; padding: 10px; text-align: center; z-index: 9999; font-family: Arial, sans-serif;">"#,
    "<strong>&#9888; PHISHING AWARENESS SIMULATION</strong> - ",
    "This page is part of a security awareness exercise.",
    "</div>",
    r#"<div style="height: 50px;"></div>"#
);

struct Patterns {
    anchor_href: Regex,
    head_open: Regex,
    body_open: Regex,
    form_open: Regex,
    form_routing_attr: Regex,
}

impl Patterns {
    fn compile() -> Result<Self, regex::Error> {
        Ok(Self {
            anchor_href: Regex::new(r#"(?is)(<a\s+(?:[^>]*?\s+)?)href=(?:"([^"]*)"|'([^']*)')"#)?,
            head_open: Regex::new(r"(?i)<head\b[^>]*>")?,
            body_open: Regex::new(r"(?i)<body\b[^>]*>")?,
            form_open: Regex::new(r"(?i)<form\b([^>]*)>")?,
            form_routing_attr: Regex::new(
                r#"(?i)\s+(?:action|method)\s*=\s*(?:"[^"]*"|'[^']*'|[^\s>]+)"#,
            )?,
        })
    }
}

fn patterns() -> Result<&'static Patterns, &'static regex::Error> {
    static PATTERNS: OnceLock<Result<Patterns, regex::Error>> = OnceLock::new();
    PATTERNS.get_or_init(Patterns::compile).as_ref()
}

fn with_patterns<F>(
    original: &str,
    what: &str,
    compiled: Result<&Patterns, &regex::Error>,
    rewrite: F,
) -> String
where
    F: FnOnce(&Patterns) -> String,
{
    match compiled {
        Ok(p) => rewrite(p),
        Err(e) => {
            tracing::warn!(error = %e, "Could not rewrite {what}, leaving HTML unmodified");
            original.to_string()
        }
    }
}

pub(crate) fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// `{base}/track/click/{campaign}/{recipient}`
pub fn click_url(base_url: &str, campaign_id: Uuid, recipient_id: Uuid) -> String {
    format!("{base_url}/track/click/{campaign_id}/{recipient_id}")
}

/// `{base}/track/open/{campaign}/{recipient}?t={unix}`; the timestamp keeps
/// proxies from serving a cached pixel.
pub fn pixel_url(base_url: &str, campaign_id: Uuid, recipient_id: Uuid, at: DateTime<Utc>) -> String {
    format!(
        "{base_url}/track/open/{campaign_id}/{recipient_id}?t={}",
        at.timestamp()
    )
}

/// Inputs for rewriting one recipient's email body.
#[derive(Clone, Debug)]
pub struct EmailRewrite<'a> {
    pub body: &'a str,
    pub track_open: bool,
    pub track_click: bool,
    pub has_form_template: bool,
    pub click_url: &'a str,
    pub pixel_url: Option<&'a str>,
    /// Prefix of every click-tracking URL; hrefs under it are left alone.
    pub click_endpoint: &'a str,
}

pub fn rewrite_email(input: &EmailRewrite<'_>) -> String {
    rewrite_email_using(input, patterns())
}

fn rewrite_email_using(input: &EmailRewrite<'_>, compiled: Result<&Patterns, &regex::Error>) -> String {
    with_patterns(input.body, "email body", compiled, |p| {
        let mut html = LINK_PLACEHOLDERS
            .iter()
            .fold(input.body.to_string(), |html, marker| {
                html.replace(marker, input.click_url)
            });

        let has_placeholder = LINK_PLACEHOLDERS.iter().any(|m| input.body.contains(m));
        if input.has_form_template && !has_placeholder {
            html.push_str(&CTA_BUTTON.replace("{url}", &escape_attr(input.click_url)));
        }

        if input.track_open {
            if let Some(pixel) = input.pixel_url {
                html.push_str(&format!(
                    r#"<img src="{}" width="1" height="1" alt="" style="border:0;" />"#,
                    escape_attr(pixel)
                ));
            }
        }

        if input.track_click {
            html = rewrite_links(p, &html, input.click_url, input.click_endpoint);
        }

        wrap_document(html)
    })
}

fn rewrite_links(p: &Patterns, html: &str, click_url: &str, click_endpoint: &str) -> String {
    p.anchor_href
        .replace_all(html, |caps: &Captures| {
            let href = caps
                .get(2)
                .or_else(|| caps.get(3))
                .map_or("", |m| m.as_str());
            if href.starts_with(click_endpoint) || href.contains("{{") {
                return caps[0].to_string();
            }
            format!("{}href=\"{}\"", &caps[1], escape_attr(click_url))
        })
        .into_owned()
}

fn wrap_document(html: String) -> String {
    let lower = html.to_ascii_lowercase();
    if lower.contains("<!doctype") || lower.contains("<html") {
        return html;
    }
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n    <meta charset=\"UTF-8\">\n    \
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0\">\n\
         </head>\n<body>\n{html}\n</body>\n</html>"
    )
}

/// Inputs for rendering a form template as a landing page.
#[derive(Clone, Debug)]
pub struct LandingPage<'a> {
    pub html: &'a str,
    pub target_url: Option<&'a str>,
    pub capture_url: &'a str,
    /// Token of the recipient the page is rendered for.
    pub token: &'a str,
}

/// Point the first form at the capture endpoint, embed the tracking token,
/// load relative assets from the target site, and add the awareness banner.
pub fn process_landing_page(page: &LandingPage<'_>) -> String {
    process_landing_page_using(page, patterns())
}

fn process_landing_page_using(
    page: &LandingPage<'_>,
    compiled: Result<&Patterns, &regex::Error>,
) -> String {
    with_patterns(page.html, "landing page", compiled, |p| {
        let mut html = page.html.to_string();

        if let Some(target) = page.target_url.filter(|t| !t.is_empty()) {
            let base_tag = format!(r#"<base href="{}" target="_blank">"#, escape_attr(target));
            html = p
                .head_open
                .replacen(&html, 1, |caps: &Captures| format!("{}{base_tag}", &caps[0]))
                .into_owned();
        }

        let capture_url = escape_attr(page.capture_url);
        let token_field = format!(
            r#"<input type="hidden" name="_tracking_token" value="{}">"#,
            escape_attr(page.token)
        );
        html = p
            .form_open
            .replacen(&html, 1, |caps: &Captures| {
                let attrs = p.form_routing_attr.replace_all(&caps[1], "");
                format!(r#"<form{attrs} action="{capture_url}" method="POST">{token_field}"#)
            })
            .into_owned();

        if p.body_open.is_match(&html) {
            html = p
                .body_open
                .replacen(&html, 1, |caps: &Captures| format!("{}{WARNING_BANNER}", &caps[0]))
                .into_owned();
        } else {
            html.insert_str(0, WARNING_BANNER);
        }

        html
    })
}
