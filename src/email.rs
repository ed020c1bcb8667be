use std::time::Duration;

use async_trait::async_trait;

/// Outbound mail capability used by the dispatcher: one synchronous send per
/// recipient with a definite outcome.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html_body: &str) -> Result<(), MailError>;
}

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    /// Worth retrying: connection problems, 4xx replies.
    #[error("Temporary delivery failure: {0}")]
    Transient(String),

    /// Bad address, rejected message, 5xx replies.
    #[error("Permanent delivery failure: {0}")]
    Permanent(String),
}

impl MailError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<lettre::transport::smtp::Error> for MailError {
    fn from(e: lettre::transport::smtp::Error) -> Self {
        if e.is_permanent() {
            Self::Permanent(e.to_string())
        } else {
            Self::Transient(e.to_string())
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

pub struct SmtpMailTransport {
    transport: lettre::AsyncSmtpTransport<lettre::Tokio1Executor>,
    from_email: String,
    retry: RetryPolicy,
}

impl SmtpMailTransport {
    pub fn new(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        use_tls: bool,
        from_email: String,
        retry: RetryPolicy,
    ) -> Result<Self, MailError> {
        use lettre::transport::smtp::authentication::Credentials;
        use lettre::AsyncSmtpTransport;

        let mut builder = if use_tls {
            AsyncSmtpTransport::<lettre::Tokio1Executor>::relay(host)
                .map_err(|e| MailError::Permanent(e.to_string()))?
                .port(port)
        } else {
            AsyncSmtpTransport::<lettre::Tokio1Executor>::builder_dangerous(host).port(port)
        };

        if let (Some(user), Some(pass)) = (username, password) {
            builder = builder.credentials(Credentials::new(user.to_string(), pass.to_string()));
        }

        Ok(Self {
            transport: builder.build(),
            from_email,
            retry,
        })
    }

    fn build_message(
        &self,
        to: &str,
        subject: &str,
        html_body: &str,
    ) -> Result<lettre::Message, MailError> {
        use lettre::message::header::ContentType;
        use lettre::Message;

        Message::builder()
            .from(
                self.from_email
                    .parse()
                    .map_err(|e: lettre::address::AddressError| {
                        MailError::Permanent(e.to_string())
                    })?,
            )
            .to(to.parse().map_err(|e: lettre::address::AddressError| {
                MailError::Permanent(format!("invalid recipient address: {e}"))
            })?)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(html_body.to_string())
            .map_err(|e| MailError::Permanent(e.to_string()))
    }
}

#[async_trait]
impl MailTransport for SmtpMailTransport {
    async fn send(&self, to: &str, subject: &str, html_body: &str) -> Result<(), MailError> {
        use lettre::AsyncTransport;

        let message = self.build_message(to, subject, html_body)?;
        send_with_retry(self.retry, || {
            let message = message.clone();
            async move {
                self.transport
                    .send(message)
                    .await
                    .map(|_| ())
                    .map_err(MailError::from)
            }
        })
        .await
    }
}

/// Run `attempt` until it succeeds, fails permanently, or the policy's
/// attempts are used up. Waits a fixed backoff between attempts.
pub async fn send_with_retry<F, Fut>(policy: RetryPolicy, mut attempt: F) -> Result<(), MailError>
where
    F: FnMut() -> Fut + Send,
    Fut: std::future::Future<Output = Result<(), MailError>> + Send,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut tries = 0;
    loop {
        tries += 1;
        match attempt().await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && tries < max_attempts => {
                tracing::warn!(attempt = tries, max_attempts, "SMTP send failed, retrying: {e}");
                tokio::time::sleep(policy.backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}
