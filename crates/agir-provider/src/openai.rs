use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{LlmProvider, LlmRequest, LlmResponse, RETRYABLE_TAG};

/// Client for the chat-completions protocol. OpenAI, DeepSeek, Ollama and
/// Anthropic's compatibility endpoint all accept this shape.
///
/// Timeouts and retries belong to [`crate::ModelRouter`]; this type only
/// tags failures the router may retry.
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    http: reqwest::Client,
    completions_url: String,
    api_key: String,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>, base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            completions_url: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: api_key.into(),
        }
    }
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    choices: Vec<ReplyChoice>,
    usage: Option<ReplyUsage>,
}

#[derive(Deserialize)]
struct ReplyChoice {
    message: ReplyMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ReplyMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ReplyUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

/// The system prompt goes first; empty turns are dropped because some
/// local servers reject them.
fn chat_body(request: &LlmRequest) -> ChatBody<'_> {
    let system = request.system.as_deref().map(|content| WireMessage {
        role: "system",
        content,
    });
    let turns = request
        .messages
        .iter()
        .filter(|m| !m.content.trim().is_empty())
        .map(|m| WireMessage {
            role: &m.role,
            content: &m.content,
        });
    ChatBody {
        model: &request.model,
        messages: system.into_iter().chain(turns).collect(),
        max_tokens: request.max_tokens,
        temperature: request.temperature,
    }
}

fn status_error(status: reqwest::StatusCode, body: &str) -> anyhow::Error {
    let tag = if status.as_u16() == 429 || status.is_server_error() {
        format!(" {RETRYABLE_TAG}")
    } else {
        String::new()
    };
    let detail = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_owned))
        .unwrap_or_else(|| body.chars().take(200).collect());
    anyhow!("chat completion returned {status}{tag}: {detail}")
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse> {
        let resp = self
            .http
            .post(&self.completions_url)
            .bearer_auth(&self.api_key)
            .json(&chat_body(&request))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    anyhow!("chat completion transport error {RETRYABLE_TAG}: {e}")
                } else {
                    anyhow!("chat completion transport error: {e}")
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let reply: ChatReply = resp.json().await?;
        let usage = reply.usage;
        let choice = reply
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("chat completion returned no choices"))?;
        Ok(LlmResponse {
            text: choice.message.content.unwrap_or_default(),
            input_tokens: usage.as_ref().map(|u| u.prompt_tokens),
            output_tokens: usage.as_ref().map(|u| u.completion_tokens),
            stop_reason: choice.finish_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LlmMessage;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn turn(model: &str, system: Option<&str>, text: &str) -> LlmRequest {
        LlmRequest {
            model: model.into(),
            system: system.map(Into::into),
            messages: vec![LlmMessage::user(text)],
            max_tokens: 256,
            temperature: None,
        }
    }

    #[test]
    fn body_puts_system_first_and_skips_blank_turns() {
        let mut req = turn("gpt-4o-mini", Some("You are Dana Ruiz."), "how did the session go?");
        req.messages.insert(0, LlmMessage::assistant("  "));
        req.temperature = Some(0.2);

        let body = serde_json::to_value(chat_body(&req)).unwrap();
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["content"], "how did the session go?");
        assert_eq!(body["max_tokens"], 256);
        assert!((body["temperature"].as_f64().unwrap() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn temperature_is_omitted_when_unset() {
        let body = serde_json::to_value(chat_body(&turn("m", None, "hi"))).unwrap();
        assert!(body.get("temperature").is_none());
    }

    #[tokio::test]
    async fn chat_reads_text_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({"model": "gpt-4o-mini"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{
                    "message": {"role": "assistant", "content": "The patient slept better."},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 7, "completion_tokens": 4}
            })))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new("sk-test", &format!("{}/v1/", server.uri()));
        let resp = provider
            .chat(turn("gpt-4o-mini", None, "summarise"))
            .await
            .unwrap();
        assert_eq!(resp.text, "The patient slept better.");
        assert_eq!(resp.input_tokens, Some(7));
        assert_eq!(resp.output_tokens, Some(4));
        assert_eq!(resp.stop_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn overload_is_tagged_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_json(serde_json::json!({
                "error": {"message": "overloaded", "type": "server_error"}
            })))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new("sk-test", &server.uri());
        let err = provider
            .chat(turn("gpt-4o-mini", None, "hi"))
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains(RETRYABLE_TAG));
        assert!(err.contains("overloaded"));
    }

    #[tokio::test]
    async fn rejected_key_is_not_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_string("nope"))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new("bad", &server.uri());
        let err = provider
            .chat(turn("gpt-4o-mini", None, "hi"))
            .await
            .unwrap_err()
            .to_string();
        assert!(!err.contains(RETRYABLE_TAG));
        assert!(err.contains("401"));
        assert!(err.contains("nope"));
    }

    #[tokio::test]
    async fn empty_choices_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})),
            )
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new("ollama", &server.uri());
        let err = provider.chat(turn("llama3", None, "hi")).await.unwrap_err();
        assert!(err.to_string().contains("no choices"));
    }
}
