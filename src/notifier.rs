use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::{env, sync::Arc};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("send failed: {0}")]
    Send(String),
}

/// Outbound email. Every call site treats delivery as best-effort: a failed
/// notification is logged by the caller and never rolls back a state
/// transition that already hit the store.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), NotifyError>;
}

/// SMTP notifier. `from_env` returns `None` when SMTP is not configured;
/// the caller then falls back to [`LogNotifier`].
#[derive(Clone)]
pub struct SmtpNotifier {
    mailer: Arc<AsyncSmtpTransport<Tokio1Executor>>,
    from: String,
}

impl SmtpNotifier {
    pub fn from_env() -> Option<Self> {
        let host = env::var("SMTP_HOST").ok()?;
        let from = env::var("SMTP_FROM").ok()?;
        let port = env::var("SMTP_PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(587);

        let builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&host)
            .ok()?
            .port(port);
        let builder = match (env::var("SMTP_USER").ok(), env::var("SMTP_PASSWORD").ok()) {
            (Some(user), Some(password)) => builder.credentials(Credentials::new(user, password)),
            _ => builder,
        };
        info!(target = "courier.mail", host = %host, port = port, "smtp notifier configured");
        Some(Self {
            mailer: Arc::new(builder.build()),
            from,
        })
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), NotifyError> {
        let to_addr: Mailbox = to
            .parse()
            .map_err(|_| NotifyError::InvalidAddress(to.to_string()))?;
        let from_addr: Mailbox = self
            .from
            .parse()
            .map_err(|_| NotifyError::InvalidAddress(self.from.clone()))?;
        let email = Message::builder()
            .from(from_addr)
            .to(to_addr)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|err| NotifyError::Send(err.to_string()))?;
        self.mailer
            .send(email)
            .await
            .map_err(|err| NotifyError::Send(err.to_string()))?;
        info!(target = "courier.mail", to = %to, subject = subject, "notification sent");
        Ok(())
    }
}

/// Fallback notifier when SMTP is not configured: logs the message instead
/// of delivering it, so the rest of the flow behaves identically.
#[derive(Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), NotifyError> {
        info!(
            target = "courier.mail",
            to = %to,
            subject = subject,
            body = body,
            "smtp not configured; notification logged only"
        );
        Ok(())
    }
}

pub fn upload_link_email(buyer_name: &str, upload_link: &str) -> (String, String) {
    let subject = "Your upload link".to_string();
    let body = format!(
        "Hi {buyer_name},\n\n\
         Thanks for your order! Please upload your photos here:\n\n\
         {upload_link}\n\n\
         The link is unique to your order, so don't share it.\n"
    );
    (subject, body)
}

pub fn reset_confirmation_email(
    buyer_name: &str,
    order_reference: &str,
    confirm_link: &str,
) -> (String, String) {
    let subject = format!("Upload reset requested for order {order_reference}");
    let body = format!(
        "{buyer_name} asked to redo the upload for order {order_reference}.\n\n\
         Confirming will delete the files already received and reopen the\n\
         upload form. If you do nothing the request expires on its own.\n\n\
         Confirm: {confirm_link}\n"
    );
    (subject, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_email_embeds_link_and_name() {
        let (subject, body) = upload_link_email("Jane Doe", "http://localhost/upload-form/abc");
        assert_eq!(subject, "Your upload link");
        assert!(body.contains("Jane Doe"));
        assert!(body.contains("http://localhost/upload-form/abc"));
    }

    #[test]
    fn reset_email_targets_the_order() {
        let (subject, body) =
            reset_confirmation_email("Jane Doe", "1001", "http://localhost/reset-upload/abc");
        assert!(subject.contains("1001"));
        assert!(body.contains("http://localhost/reset-upload/abc"));
    }
}
