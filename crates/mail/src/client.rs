use reqwest::{Client, Response, StatusCode};
use serde::Serialize;
use thiserror::Error;
use url::Url;

/// Client for the HTTP mail delivery API.
///
/// The API accepts one fully rendered message per request; templating is the
/// caller's responsibility.
#[derive(Clone)]
pub struct MailerClient {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl MailerClient {
    /// Creates a new mailer client with the provided configuration.
    pub fn new(api_key: impl Into<String>, base_url: Url, http: Client) -> Self {
        Self {
            http,
            base_url,
            api_key: api_key.into(),
        }
    }

    /// Delivers a single rendered message.
    pub async fn send(&self, message: &OutgoingMessage<'_>) -> Result<(), MailerError> {
        let url = self.base_url.join("messages")?;
        let response = self
            .http
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(message)
            .send()
            .await?;

        ensure_success(response).await
    }
}

/// A rendered message handed to the delivery API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingMessage<'a> {
    pub from: &'a str,
    pub to: &'a str,
    pub subject: &'a str,
    pub html: String,
}

/// Errors produced by the mailer client.
#[derive(Debug, Error)]
pub enum MailerError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

async fn ensure_success(response: Response) -> Result<(), MailerError> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(MailerError::Status { status, body });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client(base_url: &Url) -> MailerClient {
        MailerClient::new(
            "api-key",
            base_url.clone(),
            Client::builder().build().expect("client"),
        )
    }

    #[tokio::test]
    async fn send_posts_rendered_message() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/v1/")).expect("url");
        let client = client(&base);

        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/messages")
                    .header("Authorization", "Bearer api-key")
                    .json_body(json!({
                        "from": "club@example.com",
                        "to": "guest@example.com",
                        "subject": "Welcome",
                        "html": "Hi Sam!"
                    }));
                then.status(202);
            })
            .await;

        client
            .send(&OutgoingMessage {
                from: "club@example.com",
                to: "guest@example.com",
                subject: "Welcome",
                html: "Hi Sam!".to_string(),
            })
            .await
            .expect("send message");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn error_status_returns_message() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/v1/")).expect("url");
        let client = client(&base);

        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/messages");
                then.status(422).body("invalid recipient");
            })
            .await;

        let err = client
            .send(&OutgoingMessage {
                from: "club@example.com",
                to: "not-an-address",
                subject: "Welcome",
                html: "Hi!".to_string(),
            })
            .await
            .expect_err("should error");
        match err {
            MailerError::Status { status, body } => {
                assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
                assert_eq!(body, "invalid recipient");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
