use metrics::counter;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use clubhub_core::email::{replace_name_token, EmailSendStatus, EmailTaskInfo};
use clubhub_mail::{MailerClient, MailerError, OutgoingMessage};
use clubhub_storage::{Database, EmailStoreError, EmailTaskRepository};

use crate::members::Clock;

/// Dispatches email tasks by rendering one message per receiver and tracking
/// each delivery in the store.
#[derive(Clone)]
pub struct EmailClient {
    tasks: EmailTaskRepository,
    mailer: MailerClient,
    from_address: String,
    clock: Clock,
}

impl EmailClient {
    pub fn new(
        database: &Database,
        mailer: MailerClient,
        from_address: impl Into<String>,
        clock: Clock,
    ) -> Self {
        Self {
            tasks: database.email_tasks(),
            mailer,
            from_address: from_address.into(),
            clock,
        }
    }

    /// Loads a task with its receivers and sends it.
    pub async fn dispatch_task(&self, task_id: &str) -> Result<DispatchReport, EmailError> {
        let info = self
            .tasks
            .fetch_task_with_receivers(task_id)
            .await
            .map_err(|err| match err {
                EmailStoreError::MissingTask => EmailError::NotFound,
                other => EmailError::Storage(other),
            })?;

        self.send_to_receivers(info).await
    }

    /// Sends the task body to every waiting receiver, one at a time.
    ///
    /// Every `{name}` occurrence in the body is replaced with the receiver's
    /// name before delivery. The first transport failure aborts the run;
    /// receivers completed so far keep their status, so a retried dispatch
    /// picks up where the failed one stopped.
    pub async fn send_to_receivers(
        &self,
        mut info: EmailTaskInfo,
    ) -> Result<DispatchReport, EmailError> {
        let mut sent = 0u32;
        for receiver in info.receivers.iter_mut() {
            if receiver.send_status == EmailSendStatus::Completed {
                continue;
            }

            let html = replace_name_token(&info.task.content, &receiver.name);
            let message = OutgoingMessage {
                from: &self.from_address,
                to: &receiver.email,
                subject: &info.task.subject,
                html,
            };

            self.mailer.send(&message).await.map_err(|source| {
                counter!("email_messages_sent_total", "result" => "error").increment(1);
                EmailError::Sending {
                    email: receiver.email.clone(),
                    source,
                }
            })?;

            let now = (self.clock)();
            receiver.complete_send(now);
            self.tasks.mark_receiver_completed(&receiver.id, now).await?;
            counter!("email_messages_sent_total", "result" => "ok").increment(1);
            sent += 1;
        }

        counter!("email_tasks_dispatched_total").increment(1);
        info!(stage = "email", task_id = %info.task.id, sent, "dispatched email task");
        Ok(DispatchReport {
            task_id: info.task.id,
            sent,
        })
    }
}

/// Summary of a completed dispatch run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchReport {
    pub task_id: String,
    pub sent: u32,
}

/// Errors raised while dispatching an email task.
#[derive(Debug, Error)]
pub enum EmailError {
    #[error("email task not found")]
    NotFound,
    #[error("failed to send email to {email}: {source}")]
    Sending {
        email: String,
        #[source]
        source: MailerError,
    },
    #[error("storage error: {0}")]
    Storage(#[from] EmailStoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use httpmock::prelude::*;
    use serde_json::json;
    use std::sync::Arc;
    use url::Url;
    use uuid::Uuid;

    use clubhub_storage::{NewEmailReceiver, NewEmailTask};

    async fn setup_database() -> Database {
        let url = format!("sqlite:file:{}?mode=memory&cache=shared", Uuid::new_v4());
        let database = Database::connect(&url).await.expect("connect");
        database.run_migrations().await.expect("migrations");
        database
    }

    async fn seed_task(database: &Database, receivers: &[(&str, &str, &str)]) {
        let now = Utc::now();
        let repo = database.email_tasks();
        repo.insert_task(&NewEmailTask {
            id: "t-1",
            subject: "Welcome",
            content: "Hi {name}, welcome aboard!",
            send_at: now,
            created_at: now,
        })
        .await
        .expect("task");

        let records: Vec<NewEmailReceiver<'_>> = receivers
            .iter()
            .map(|&(id, email, name)| NewEmailReceiver {
                id,
                task_id: "t-1",
                email,
                name,
                created_at: now,
            })
            .collect();
        repo.insert_receivers(&records).await.expect("receivers");
    }

    fn client(database: &Database, server: &MockServer) -> EmailClient {
        let base = Url::parse(&server.url("/v1/")).expect("url");
        let mailer = MailerClient::new(
            "api-key",
            base,
            reqwest::Client::builder().build().expect("client"),
        );
        EmailClient::new(database, mailer, "club@example.com", Arc::new(Utc::now))
    }

    #[tokio::test]
    async fn dispatch_renders_name_per_receiver() {
        let database = setup_database().await;
        seed_task(
            &database,
            &[
                ("r-1", "a@example.com", "guest1"),
                ("r-2", "b@example.com", "guest2"),
            ],
        )
        .await;

        let server = MockServer::start_async().await;
        let first = server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/messages").json_body(json!({
                    "from": "club@example.com",
                    "to": "a@example.com",
                    "subject": "Welcome",
                    "html": "Hi guest1, welcome aboard!"
                }));
                then.status(202);
            })
            .await;
        let second = server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/messages").json_body(json!({
                    "from": "club@example.com",
                    "to": "b@example.com",
                    "subject": "Welcome",
                    "html": "Hi guest2, welcome aboard!"
                }));
                then.status(202);
            })
            .await;

        let report = client(&database, &server)
            .dispatch_task("t-1")
            .await
            .expect("dispatch");

        first.assert_async().await;
        second.assert_async().await;
        assert_eq!(report.sent, 2);

        let info = database
            .email_tasks()
            .fetch_task_with_receivers("t-1")
            .await
            .expect("task info");
        assert!(info
            .receivers
            .iter()
            .all(|r| r.send_status == EmailSendStatus::Completed && r.sent_at.is_some()));
    }

    #[tokio::test]
    async fn transport_failure_wraps_cause_and_keeps_receiver_waiting() {
        let database = setup_database().await;
        seed_task(&database, &[("r-1", "a@example.com", "guest1")]).await;

        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/messages");
                then.status(500).body("smtp relay down");
            })
            .await;

        let err = client(&database, &server)
            .dispatch_task("t-1")
            .await
            .expect_err("transport failure should propagate");
        assert!(matches!(
            err,
            EmailError::Sending { ref email, .. } if email == "a@example.com"
        ));

        let info = database
            .email_tasks()
            .fetch_task_with_receivers("t-1")
            .await
            .expect("task info");
        assert_eq!(info.receivers[0].send_status, EmailSendStatus::Waiting);
        assert!(info.receivers[0].sent_at.is_none());
    }

    #[tokio::test]
    async fn retried_dispatch_skips_completed_receivers() {
        let database = setup_database().await;
        seed_task(
            &database,
            &[
                ("r-1", "a@example.com", "guest1"),
                ("r-2", "b@example.com", "guest2"),
            ],
        )
        .await;
        database
            .email_tasks()
            .mark_receiver_completed("r-1", Utc::now())
            .await
            .expect("pre-complete");

        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/messages");
                then.status(202);
            })
            .await;

        let report = client(&database, &server)
            .dispatch_task("t-1")
            .await
            .expect("dispatch");

        assert_eq!(report.sent, 1);
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn dispatch_unknown_task_fails_with_not_found() {
        let database = setup_database().await;
        let server = MockServer::start_async().await;

        let err = client(&database, &server)
            .dispatch_task("missing")
            .await
            .expect_err("unknown task should fail");
        assert!(matches!(err, EmailError::NotFound));
    }
}
