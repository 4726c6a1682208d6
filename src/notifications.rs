/// Buyer notifications
///
/// Module này gửi email cho buyer ở từng bước của vòng đời locker.
/// The relay only ever sends two kinds of mail: the locker was reserved, and
/// the order was picked up. Delivery goes through an SMTP relay (lettre),
/// or is only logged when mail is disabled in the configuration.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::{header::ContentType, Mailbox};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, info};

use crate::config::MailConfig;
use crate::error::{RelayError, RelayResult};
use crate::types::LockerNumber;

/// The transactional emails the relay sends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmailTemplate {
    /// A locker was reserved for the buyer
    LockerReserved { locker_number: LockerNumber },
    /// The buyer opened their locker
    LockerPickedUp { locker_number: LockerNumber },
}

impl EmailTemplate {
    /// Email subject
    pub fn subject(&self) -> String {
        match self {
            EmailTemplate::LockerReserved { .. } => "Potato Order Confirmation".to_string(),
            EmailTemplate::LockerPickedUp { .. } => "Your potatoes have been picked up".to_string(),
        }
    }

    /// Plain-text email body
    pub fn body(&self) -> String {
        match self {
            EmailTemplate::LockerReserved { locker_number } => format!(
                "Hello,\n\nyour locker has been reserved. Your potatoes will be waiting in locker #{}.\n\
                 Sign the locker number with your wallet to open it when you arrive.\n\nThe Potato Vendor",
                locker_number
            ),
            EmailTemplate::LockerPickedUp { locker_number } => format!(
                "Hello,\n\nlocker #{} was opened and your potatoes have been picked up. Enjoy!\n\nThe Potato Vendor",
                locker_number
            ),
        }
    }

    /// Template label for logs
    pub fn name(&self) -> &'static str {
        match self {
            EmailTemplate::LockerReserved { .. } => "locker_reserved",
            EmailTemplate::LockerPickedUp { .. } => "locker_picked_up",
        }
    }
}

/// Outbound mail
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Send one templated email; errors are `MailSendFailed`
    async fn send(&self, to: &str, template: &EmailTemplate) -> RelayResult<()>;
}

/// SMTP relay mailer with fixed sender credentials
pub struct SmtpMailer {
    /// Sender mailbox
    from: Mailbox,
    /// Async SMTP transport (implicit TLS)
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailer {
    /// Build the transport from configuration
    ///
    /// # Errors
    /// * `Config` if credentials or the sender address are missing or invalid
    pub fn new(config: &MailConfig) -> RelayResult<Self> {
        let username = config
            .username
            .clone()
            .ok_or_else(|| RelayError::Config("mail.username (EMAIL_USER) is not set".to_string()))?;
        let password = config
            .password
            .clone()
            .ok_or_else(|| RelayError::Config("mail.password (EMAIL_PASS) is not set".to_string()))?;

        let from_address = config.from_address.clone().unwrap_or_else(|| username.clone());
        let from = from_address
            .parse::<Mailbox>()
            .map_err(|e| RelayError::Config(format!("Invalid sender address {}: {}", from_address, e)))?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
            .map_err(|e| RelayError::Config(format!("Invalid SMTP relay {}: {}", config.smtp_host, e)))?
            .port(config.smtp_port)
            .credentials(Credentials::new(username, password))
            .timeout(Some(Duration::from_secs(config.timeout_secs)))
            .build();

        info!("SMTP mailer ready: {}:{} as {}", config.smtp_host, config.smtp_port, from);
        Ok(Self { from, transport })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, to: &str, template: &EmailTemplate) -> RelayResult<()> {
        let message = build_message(&self.from, to, template)?;
        self.transport
            .send(message)
            .await
            .map_err(|e| RelayError::MailSendFailed(format!("{} to {}: {}", template.name(), to, e)))?;
        debug!("Sent {} email to {}", template.name(), to);
        Ok(())
    }
}

/// Mailer used when mail is disabled: logs instead of sending
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, to: &str, template: &EmailTemplate) -> RelayResult<()> {
        info!(
            "Mail disabled, would send email: To: {}, Subject: {}",
            to,
            template.subject()
        );
        Ok(())
    }
}

/// Assemble the plain-text message; bad recipient addresses fail here, not at the relay
fn build_message(from: &Mailbox, to: &str, template: &EmailTemplate) -> RelayResult<Message> {
    let recipient = to
        .parse::<Mailbox>()
        .map_err(|e| RelayError::MailSendFailed(format!("invalid recipient {}: {}", to, e)))?;

    Message::builder()
        .from(from.clone())
        .to(recipient)
        .subject(template.subject())
        .header(ContentType::TEXT_PLAIN)
        .body(template.body())
        .map_err(|e| RelayError::MailSendFailed(format!("could not build {}: {}", template.name(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> Mailbox {
        "Potato Vendor <vendor@example.com>".parse().unwrap()
    }

    #[test]
    fn test_templates_mention_locker() {
        let reserved = EmailTemplate::LockerReserved { locker_number: 17 };
        assert_eq!(reserved.subject(), "Potato Order Confirmation");
        assert!(reserved.body().contains("locker #17"));

        let picked = EmailTemplate::LockerPickedUp { locker_number: 0 };
        assert!(picked.subject().contains("picked up"));
        assert!(picked.body().contains("locker #0"));
    }

    #[test]
    fn test_build_message_rejects_bad_recipient() {
        let template = EmailTemplate::LockerReserved { locker_number: 1 };
        let err = build_message(&sender(), "not an address", &template).unwrap_err();
        assert_eq!(err.kind(), "mail_send_failed");
    }

    #[test]
    fn test_build_message_sets_headers() {
        let template = EmailTemplate::LockerPickedUp { locker_number: 4 };
        let message = build_message(&sender(), "a@x.com", &template).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("To: a@x.com"));
        assert!(raw.contains("Subject: Your potatoes have been picked up"));
    }

    #[test]
    fn test_smtp_mailer_requires_credentials() {
        let config = MailConfig::default();
        assert!(matches!(SmtpMailer::new(&config), Err(RelayError::Config(_))));
    }

    #[test]
    fn test_log_mailer_always_succeeds() {
        let template = EmailTemplate::LockerReserved { locker_number: 2 };
        assert!(tokio_test::block_on(LogMailer.send("a@x.com", &template)).is_ok());
    }
}
