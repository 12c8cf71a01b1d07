use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Placeholder replaced by the receiver's name when rendering a task body.
pub const NAME_TOKEN: &str = "{name}";

/// Substitutes every occurrence of [`NAME_TOKEN`] with `name`.
///
/// Content without the token passes through unchanged.
pub fn replace_name_token(content: &str, name: &str) -> String {
    content.replace(NAME_TOKEN, name)
}

/// A scheduled bulk email job with templated content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailTask {
    pub id: String,
    pub subject: String,
    pub content: String,
    pub send_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// One recipient of an [`EmailTask`] with its own delivery status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailReceiver {
    pub id: String,
    pub task_id: String,
    pub email: String,
    pub name: String,
    pub send_status: EmailSendStatus,
    pub status_updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
}

impl EmailReceiver {
    /// Marks the receiver as delivered.
    ///
    /// Sets the status to `Completed` and both timestamps to `now`. Calling
    /// this on an already completed receiver is a no-op so the original
    /// delivery timestamps are preserved.
    pub fn complete_send(&mut self, now: DateTime<Utc>) {
        if self.send_status == EmailSendStatus::Completed {
            return;
        }
        self.send_status = EmailSendStatus::Completed;
        self.status_updated_at = now;
        self.sent_at = Some(now);
    }
}

/// Delivery status of an [`EmailReceiver`].
///
/// `Waiting` is the initial state; `Completed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmailSendStatus {
    Waiting,
    Completed,
}

impl EmailSendStatus {
    /// Returns the canonical database representation for the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "WAITING",
            Self::Completed => "COMPLETED",
        }
    }
}

/// An email task bundled with its receivers, ready for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct EmailTaskInfo {
    pub task: EmailTask,
    pub receivers: Vec<EmailReceiver>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receiver() -> EmailReceiver {
        EmailReceiver {
            id: "r-1".to_string(),
            task_id: "t-1".to_string(),
            email: "guest@example.com".to_string(),
            name: "guest1".to_string(),
            send_status: EmailSendStatus::Waiting,
            status_updated_at: Utc::now(),
            sent_at: None,
        }
    }

    #[test]
    fn replaces_every_name_token() {
        assert_eq!(replace_name_token("Hi {name}, {name}!", "Sam"), "Hi Sam, Sam!");
    }

    #[test]
    fn content_without_token_is_unchanged() {
        let content = "Welcome to the club.";
        assert_eq!(replace_name_token(content, "Sam"), content);
    }

    #[test]
    fn complete_send_sets_status_and_timestamps() {
        let mut receiver = receiver();
        assert_eq!(receiver.send_status, EmailSendStatus::Waiting);
        assert!(receiver.sent_at.is_none());

        let now = Utc::now();
        receiver.complete_send(now);

        assert_eq!(receiver.send_status, EmailSendStatus::Completed);
        assert_eq!(receiver.status_updated_at, now);
        assert_eq!(receiver.sent_at, Some(now));
    }

    #[test]
    fn complete_send_is_a_noop_when_already_completed() {
        let mut receiver = receiver();
        let first = Utc::now();
        receiver.complete_send(first);

        let later = first + chrono::Duration::seconds(30);
        receiver.complete_send(later);

        assert_eq!(receiver.status_updated_at, first);
        assert_eq!(receiver.sent_at, Some(first));
    }
}
