use std::sync::Arc;

use lettre::message::{header::ContentType, Mailbox};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use thiserror::Error;

use crate::config::{Config, SmtpConfig};

#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid mailbox address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("unable to build message: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("SMTP delivery failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

/// A rendered transactional email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub html: String,
}

impl Email {
    pub fn verification(to: &str, first_name: &str, link: &str) -> Email {
        Email {
            to: to.to_string(),
            subject: "Education Portal - Verify Your Email".to_string(),
            html: layout(
                "Verify your email",
                first_name,
                &format!(
                    "<p>Thanks for signing up. Confirm your email address to activate your account.</p>\
                     <p><a href=\"{link}\">Verify email</a></p>\
                     <p>The link expires in 2 hours.</p>",
                    link = link
                ),
            ),
        }
    }

    pub fn password_reset(to: &str, first_name: &str, link: &str) -> Email {
        Email {
            to: to.to_string(),
            subject: "Education Portal - Password Reset".to_string(),
            html: layout(
                "Reset your password",
                first_name,
                &format!(
                    "<p>We received a request to reset your password.</p>\
                     <p><a href=\"{link}\">Reset password</a></p>\
                     <p>The link expires in 10 minutes. Ignore this email if you didn't ask for it.</p>",
                    link = link
                ),
            ),
        }
    }

    pub fn two_factor_code(to: &str, first_name: &str, code: &str) -> Email {
        Email {
            to: to.to_string(),
            subject: "Education Portal - Your Login Code".to_string(),
            html: layout(
                "Your login code",
                first_name,
                &format!(
                    "<p>Use this code to finish logging in:</p>\
                     <p style=\"font-size:24px;letter-spacing:4px\"><strong>{code}</strong></p>\
                     <p>The code expires in 10 minutes.</p>",
                    code = code
                ),
            ),
        }
    }
}

fn layout(heading: &str, first_name: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html><html><body style=\"font-family:sans-serif\">\
         <h2>{heading}</h2><p>Hi {name},</p>{body}\
         <p>Education Portal</p></body></html>",
        heading = heading,
        name = html_escape(first_name),
        body = body
    )
}

fn html_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[rocket::async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: Email) -> Result<(), MailError>;
}

pub type Mail = Arc<dyn Mailer>;

pub fn from_config(config: &Config) -> Result<Mail, MailError> {
    match &config.smtp {
        Some(smtp) => {
            tracing::info!("Sending email through {}:{}", smtp.host, smtp.port);
            Ok(Arc::new(SmtpMailer::new(smtp)?))
        }
        None => {
            tracing::warn!("SMTP isn't configured. Outgoing emails will only be logged.");
            Ok(Arc::new(LogMailer))
        }
    }
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig) -> Result<SmtpMailer, MailError> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?
            .port(config.port)
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ))
            .build();

        Ok(SmtpMailer {
            transport,
            from: config.from.parse()?,
        })
    }
}

#[rocket::async_trait]
impl Mailer for SmtpMailer {
    #[tracing::instrument(skip(self, email), fields(to = %email.to, subject = %email.subject))]
    async fn send(&self, email: Email) -> Result<(), MailError> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(email.to.parse()?)
            .subject(email.subject)
            .header(ContentType::TEXT_HTML)
            .body(email.html)?;

        self.transport.send(message).await?;
        tracing::info!("email sent");
        Ok(())
    }
}

/// Logs emails instead of sending them. Used when SMTP isn't configured.
pub struct LogMailer;

#[rocket::async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: Email) -> Result<(), MailError> {
        tracing::info!(to = %email.to, subject = %email.subject, "email not sent (no SMTP)");
        tracing::debug!("{}", email.html);
        Ok(())
    }
}

/// Sends `email`, logging delivery failures instead of returning them.
pub async fn send_logged(mailer: &dyn Mailer, email: Email) {
    let to = email.to.clone();
    if let Err(e) = mailer.send(email).await {
        tracing::error!("unable to send email to {}: {}", to, e);
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Keeps every sent email in memory.
    #[derive(Default)]
    pub struct RecordingMailer {
        pub sent: Mutex<Vec<Email>>,
    }

    #[rocket::async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, email: Email) -> Result<(), MailError> {
            self.sent.lock().unwrap().push(email);
            Ok(())
        }
    }
}
