use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::models::chat::{ChatMessage, Role};
use crate::core::models::user::UserId;

#[derive(Error, Debug)]
pub enum GeneratorError {
    #[error("Agent response timed out")]
    Timeout,
    #[error("Agent request failed: {0}")]
    Transport(String),
    #[error("Agent endpoint returned {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Could not read agent response: {0}")]
    Decode(String),
}

/// Everything the response generator needs for one turn.
#[derive(Debug, Clone, Serialize)]
pub struct GenerateRequest {
    pub message: String,
    pub agent_id: String,
    pub history: Vec<HistoryTurn>,
    pub user_id: Option<UserId>,
    /// Credits for this turn were already handled by the caller
    pub skip_deduction: bool,
    pub session_id: String,
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryTurn {
    pub role: Role,
    pub content: String,
}

impl HistoryTurn {
    /// Conversation turns worth sending upstream; failure notices are local only.
    pub fn from_messages(messages: &[ChatMessage]) -> Vec<Self> {
        messages
            .iter()
            .filter(|m| !m.is_error)
            .map(|m| Self {
                role: m.role,
                content: m.content.clone(),
            })
            .collect()
    }
}

/// Opaque agent backend.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(&self, request: GenerateRequest) -> Result<ChatMessage, GeneratorError>;
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(alias = "content", alias = "message")]
    response: String,
}

pub struct HttpGenerator {
    client: reqwest::Client,
    endpoint: String,
    model: Option<String>,
}

impl HttpGenerator {
    pub fn new(endpoint: &str, model: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model,
        })
    }
}

#[async_trait]
impl ResponseGenerator for HttpGenerator {
    async fn generate(&self, mut request: GenerateRequest) -> Result<ChatMessage, GeneratorError> {
        if request.model.is_none() {
            request.model = self.model.clone();
        }
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GeneratorError::Timeout
                } else {
                    GeneratorError::Transport(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GeneratorError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let body: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| GeneratorError::Decode(e.to_string()))?;
        Ok(ChatMessage::assistant(body.response))
    }
}

/// Offline stand-in that answers by quoting the message back.
pub struct EchoGenerator;

#[async_trait]
impl ResponseGenerator for EchoGenerator {
    async fn generate(&self, request: GenerateRequest) -> Result<ChatMessage, GeneratorError> {
        Ok(ChatMessage::assistant(format!(
            "[{}] {}",
            request.agent_id, request.message
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(message: &str) -> GenerateRequest {
        GenerateRequest {
            message: message.into(),
            agent_id: "agent-x".into(),
            history: vec![],
            user_id: Some(UserId::new("u1")),
            skip_deduction: true,
            session_id: "s1".into(),
            model: None,
        }
    }

    #[test]
    fn history_skips_failure_notices() {
        let messages = vec![
            ChatMessage::user("hi"),
            ChatMessage::failure_notice("could not send"),
            ChatMessage::assistant("hello"),
        ];
        let turns = HistoryTurn::from_messages(&messages);
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn echo_generator_quotes_message() {
        let reply = EchoGenerator.generate(request("ping")).await.unwrap();
        assert_eq!(reply.content, "[agent-x] ping");
        assert_eq!(reply.role, Role::Assistant);
    }

    #[tokio::test]
    async fn http_generator_sends_skip_deduction_and_model() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat"))
            .and(body_partial_json(serde_json::json!({
                "skip_deduction": true,
                "model": "fast",
                "agent_id": "agent-x"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": "hello there"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let generator = HttpGenerator::new(
            &format!("{}/chat", server.uri()),
            Some("fast".into()),
            Duration::from_secs(5),
        )
        .unwrap();
        let reply = generator.generate(request("hi")).await.unwrap();
        assert_eq!(reply.content, "hello there");
    }

    #[tokio::test]
    async fn http_generator_surfaces_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let generator =
            HttpGenerator::new(&server.uri(), None, Duration::from_secs(5)).unwrap();
        let err = generator.generate(request("hi")).await.unwrap_err();
        assert!(matches!(err, GeneratorError::Http { status: 502, .. }));
    }
}
