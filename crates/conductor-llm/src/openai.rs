use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use conductor_core::chat::{ChatModel, ChatOptions};
use conductor_core::errors::GatewayError;
use conductor_core::turns::ConversationTurn;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Endpoint settings for an OpenAI-compatible `/chat/completions` API.
#[derive(Clone, Debug)]
pub struct OpenAiCompatConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<SecretString>,
    pub request_timeout: Duration,
}

impl Default for OpenAiCompatConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4o-mini".into(),
            api_key: None,
            request_timeout: Duration::from_secs(120),
        }
    }
}

pub struct OpenAiCompatModel {
    client: Client,
    config: OpenAiCompatConfig,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: String,
    content: &'a str,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireReply,
}

#[derive(Deserialize)]
struct WireReply {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiCompatModel {
    pub fn new(config: OpenAiCompatConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| GatewayError::InvalidRequest(format!("http client: {e}")))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

fn map_transport_error(e: reqwest::Error, timeout: Duration) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Timeout(timeout)
    } else {
        GatewayError::NetworkError(e.to_string())
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatModel {
    fn name(&self) -> &str {
        &self.config.model
    }

    #[instrument(skip(self, messages, options), fields(model = %self.config.model, turns = messages.len()))]
    async fn complete(
        &self,
        messages: &[ConversationTurn],
        options: &ChatOptions,
    ) -> Result<String, GatewayError> {
        let body = WireRequest {
            model: options.model.as_deref().unwrap_or(&self.config.model),
            messages: messages
                .iter()
                .map(|t| WireMessage {
                    role: t.role.to_string(),
                    content: &t.content,
                })
                .collect(),
            max_tokens: options.max_tokens,
            temperature: options.temperature,
        };

        let mut req = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key.expose_secret());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| map_transport_error(e, self.config.request_timeout))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(status, body));
        }

        let parsed: WireResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| GatewayError::MalformedResponse("no choices in completion".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn model_for(server: &MockServer, key: Option<&str>) -> OpenAiCompatModel {
        OpenAiCompatModel::new(OpenAiCompatConfig {
            base_url: format!("{}/v1/", server.uri()),
            model: "test-model".into(),
            api_key: key.map(|k| SecretString::from(k.to_string())),
            request_timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn returns_first_choice_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({
                "model": "test-model",
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "hello there"}}]
            })))
            .mount(&server)
            .await;

        let model = model_for(&server, Some("sk-test"));
        let out = model
            .complete(&[ConversationTurn::user("hi")], &ChatOptions::default())
            .await
            .unwrap();
        assert_eq!(out, "hello there");
    }

    #[tokio::test]
    async fn maps_http_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let err = model_for(&server, None)
            .complete(&[ConversationTurn::user("hi")], &ChatOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn empty_choices_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})))
            .mount(&server)
            .await;

        let err = model_for(&server, None)
            .complete(&[ConversationTurn::user("hi")], &ChatOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn per_call_model_override() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"model": "other", "max_tokens": 64})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "ok"}}]
            })))
            .mount(&server)
            .await;

        let options = ChatOptions {
            model: Some("other".into()),
            max_tokens: Some(64),
            temperature: None,
        };
        let out = model_for(&server, None)
            .complete(&[ConversationTurn::user("hi")], &options)
            .await
            .unwrap();
        assert_eq!(out, "ok");
    }
}
