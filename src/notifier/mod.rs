//! Notification Dispatch
//!
//! Fire-and-forget delivery of confirmation and reset messages. The
//! lifecycle engine only ever enqueues onto an unbounded channel; a single
//! worker task owned by the dispatcher drains the queue and hands rendered
//! messages to a [`MailTransport`]. Delivery failures are logged here and
//! never surfaced to the caller that triggered the message; retry policy
//! belongs to the transport collaborator.

use async_trait::async_trait;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

use crate::misc::AccountError;

#[cfg(feature = "smtp")]
/// lettre-backed SMTP transport
pub mod smtp;

/// Which lifecycle event a message belongs to
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MessageKind {
    /// Email-address confirmation
    Confirm,
    /// Password reset
    Reset,
}

/// Delivers one rendered message to its destination address
#[async_trait]
pub trait MailTransport: Send + Sync + 'static {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), AccountError>;
}

/// Subject, link, and body templates for one message kind.
///
/// The link is built from `url`: if `url` contains `{validation_code}` the
/// code replaces the placeholder, otherwise the code is appended. The body
/// likewise substitutes `{link}` or appends the link at the end.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MessageLayout {
    /// Link the recipient follows, e.g.
    /// `https://example.com/validate?code={validation_code}`
    pub url: String,
    /// Message subject line
    pub subject: String,
    /// Plain-text body template
    pub body: String,
}

impl MessageLayout {
    fn link_for(&self, code: &str) -> String {
        if self.url.contains("{validation_code}") {
            self.url.replace("{validation_code}", code)
        } else {
            format!("{}{code}", self.url)
        }
    }

    fn body_for(&self, link: &str) -> String {
        if self.body.contains("{link}") {
            self.body.replace("{link}", link)
        } else {
            format!("{}{link}", self.body)
        }
    }
}

/// The layouts for both message kinds
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MessageLayouts {
    pub confirm: MessageLayout,
    pub reset: MessageLayout,
}

impl Default for MessageLayouts {
    fn default() -> Self {
        Self {
            confirm: MessageLayout {
                url: String::new(),
                subject: "Please confirm your email!".to_string(),
                body: "Please confirm your email\n{link}".to_string(),
            },
            reset: MessageLayout {
                url: String::new(),
                subject: "Password reset request".to_string(),
                body: "Follow this link to reset your password\n{link}".to_string(),
            },
        }
    }
}

impl MessageLayouts {
    fn for_kind(&self, kind: MessageKind) -> &MessageLayout {
        match kind {
            MessageKind::Confirm => &self.confirm,
            MessageKind::Reset => &self.reset,
        }
    }
}

struct Notification {
    to: String,
    code: String,
    kind: MessageKind,
}

/// A cheaply-clonable handle for enqueueing messages. Dropping every clone
/// shuts the worker down once the queue drains
#[derive(Clone)]
pub struct NotificationDispatcher {
    tx: UnboundedSender<Notification>,
}

impl NotificationDispatcher {
    /// Spawns the worker task and returns the handle the engine holds. The
    /// engine never owns the scheduler; this is the only place a task is
    /// spawned
    pub fn spawn<T: MailTransport>(transport: T, layouts: MessageLayouts) -> Self {
        let (tx, mut rx) = unbounded_channel::<Notification>();

        let _worker = tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                let layout = layouts.for_kind(notification.kind);
                let link = layout.link_for(&notification.code);
                let body = layout.body_for(&link);

                if let Err(err) = transport
                    .send(&notification.to, &layout.subject, &body)
                    .await
                {
                    log::warn!(target: "bastion", "Failed to deliver {:?} message to {}: {}", notification.kind, notification.to, err.into_string());
                }
            }
        });

        Self { tx }
    }

    pub(crate) fn dispatch(&self, to: &str, code: &str, kind: MessageKind) {
        let notification = Notification {
            to: to.to_string(),
            code: code.to_string(),
            kind,
        };

        if self.tx.send(notification).is_err() {
            log::warn!(target: "bastion", "Notification worker is gone; dropping {kind:?} message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct RecordingTransport {
        sent: Arc<Mutex<Vec<(String, String, String)>>>,
    }

    #[async_trait]
    impl MailTransport for RecordingTransport {
        async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), AccountError> {
            self.sent
                .lock()
                .push((to.to_string(), subject.to_string(), body.to_string()));
            Ok(())
        }
    }

    #[test]
    fn link_placeholder_substitution() {
        let layout = MessageLayout {
            url: "https://example.com/validate?code={validation_code}".to_string(),
            subject: "s".to_string(),
            body: "Visit {link} now".to_string(),
        };
        assert_eq!(
            layout.link_for("abc"),
            "https://example.com/validate?code=abc"
        );
        assert_eq!(
            layout.body_for("https://example.com/validate?code=abc"),
            "Visit https://example.com/validate?code=abc now"
        );
    }

    #[test]
    fn link_appended_without_placeholder() {
        let layout = MessageLayout {
            url: "https://example.com/validate/".to_string(),
            subject: "s".to_string(),
            body: "No placeholder here\n".to_string(),
        };
        assert_eq!(layout.link_for("abc"), "https://example.com/validate/abc");
        assert_eq!(
            layout.body_for("L"),
            "No placeholder here\nL"
        );
    }

    #[tokio::test]
    async fn dispatch_renders_and_delivers() {
        let transport = RecordingTransport::default();
        let sent = transport.sent.clone();
        let dispatcher = NotificationDispatcher::spawn(transport, MessageLayouts::default());

        dispatcher.dispatch("user@example.com", "code123", MessageKind::Confirm);

        // the worker runs on its own task; yield until it drains the queue
        for _ in 0..100 {
            if !sent.lock().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }

        let sent = sent.lock();
        assert_eq!(sent.len(), 1);
        let (to, subject, body) = &sent[0];
        assert_eq!(to, "user@example.com");
        assert_eq!(subject, "Please confirm your email!");
        assert!(body.contains("code123"));
    }
}
