//! SMTP transport built on lettre's tokio executor.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::misc::AccountError;
use crate::notifier::MailTransport;

/// Sends rendered messages through an SMTP relay
pub struct SmtpMailer {
    from: Mailbox,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailer {
    /// Connects to `host` over STARTTLS with the given relay credentials.
    /// `from` is the address messages are sent as
    pub fn new(
        host: &str,
        port: u16,
        from: &str,
        credentials: Option<(String, String)>,
    ) -> Result<Self, AccountError> {
        let from = from
            .parse::<Mailbox>()
            .map_err(|err| AccountError::msg(format!("Invalid from address: {err}")))?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
            .map_err(|err| AccountError::msg(format!("Failed to create SMTP transport: {err}")))?
            .port(port);

        if let Some((username, password)) = credentials {
            builder = builder.credentials(Credentials::new(username, password));
        }

        Ok(Self {
            from,
            transport: builder.build(),
        })
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), AccountError> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(to
                .parse()
                .map_err(|err| AccountError::msg(format!("Invalid to address: {err}")))?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|err| AccountError::msg(format!("Failed to create email: {err}")))?;

        let _response = self
            .transport
            .send(message)
            .await
            .map_err(|err| AccountError::msg(format!("Failed to send email: {err}")))?;

        Ok(())
    }
}
