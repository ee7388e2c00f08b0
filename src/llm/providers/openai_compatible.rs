use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;

use crate::errors::{DroidClawError, DroidClawResult};
use crate::llm::provider::LlmProvider;
use crate::llm::sse_parser;
use crate::llm::types::{CallConfig, ChatMessage, LlmResponse, StreamChunkKind};

pub struct OpenAiCompatibleProvider {
    id: String,
    api_base: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(id: String, api_base: String, api_key: String, timeout: Duration) -> DroidClawResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            id,
            api_base,
            api_key,
            client,
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.id
    }

    async fn chat(&self, messages: &[ChatMessage], cfg: &CallConfig) -> DroidClawResult<LlmResponse> {
        let body = serde_json::json!({
            "model": cfg.model,
            "messages": messages,
            "stream": cfg.stream,
            "temperature": cfg.temperature,
        });

        tracing::debug!(
            provider = %self.id,
            model = %cfg.model,
            stream = cfg.stream,
            messages = messages.len(),
            "sending LLM request"
        );
        tracing::trace!(body = %sanitized_body(&body), "request body (sanitized, base64 omitted)");

        let mut request = self.client.post(&self.api_base).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }
        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let err_body = response.text().await.unwrap_or_default();
            return Err(DroidClawError::Api {
                status,
                body: err_body,
            });
        }

        if cfg.stream {
            self.handle_stream(response).await
        } else {
            self.handle_json(response).await
        }
    }
}

impl OpenAiCompatibleProvider {
    /// Accumulate an SSE stream into a single reply.
    async fn handle_stream(&self, response: reqwest::Response) -> DroidClawResult<LlmResponse> {
        let mut byte_stream = response.bytes_stream();
        let mut pending: Vec<u8> = Vec::new();
        let mut reply = LlmResponse::default();

        'stream: while let Some(result) = byte_stream.next().await {
            let bytes = result?;
            pending.extend_from_slice(&bytes);

            // Split on complete lines only; a UTF-8 sequence may straddle two chunks.
            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = pending.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                match sse_parser::parse_sse_line(line) {
                    Ok(Some(chunk)) => match chunk.kind {
                        StreamChunkKind::Reasoning => reply.reasoning.push_str(&chunk.content),
                        StreamChunkKind::Content => reply.content.push_str(&chunk.content),
                        StreamChunkKind::Done => break 'stream,
                    },
                    Ok(None) => {}
                    Err(DroidClawError::SseParsing(e)) => {
                        tracing::debug!("SSE parse skipped: {e}");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        tracing::info!(
            provider = %self.id,
            content_len = reply.content.len(),
            reasoning_len = reply.reasoning.len(),
            "LLM stream complete"
        );
        Ok(reply)
    }

    async fn handle_json(&self, response: reqwest::Response) -> DroidClawResult<LlmResponse> {
        let json: serde_json::Value = response.json().await?;
        let message = &json["choices"][0]["message"];
        if message.is_null() {
            return Err(DroidClawError::LlmProvider(format!(
                "response has no choices: {}",
                truncate(&json.to_string(), 200)
            )));
        }

        let reply = LlmResponse {
            content: message["content"].as_str().unwrap_or("").to_string(),
            reasoning: message["reasoning_content"].as_str().unwrap_or("").to_string(),
        };
        tracing::info!(
            provider = %self.id,
            content_len = reply.content.len(),
            reasoning_len = reply.reasoning.len(),
            "LLM JSON response received"
        );
        Ok(reply)
    }
}

/// Copy of the request body with image payloads replaced, for logging.
fn sanitized_body(body: &serde_json::Value) -> String {
    let mut log_body = body.clone();
    if let Some(msgs) = log_body.get_mut("messages").and_then(|m| m.as_array_mut()) {
        for msg in msgs {
            let Some(parts) = msg.get_mut("content").and_then(|c| c.as_array_mut()) else {
                continue;
            };
            for part in parts {
                if part.get("type").and_then(|t| t.as_str()) == Some("image_url") {
                    part["image_url"]["url"] = serde_json::Value::String("<omitted_base64_image>".into());
                }
            }
        }
    }
    serde_json::to_string(&log_body).unwrap_or_default()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const COMPLETIONS: &str = "/v1/chat/completions";

    async fn server_replying(template: ResponseTemplate) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(COMPLETIONS))
            .respond_with(template)
            .mount(&server)
            .await;
        server
    }

    fn provider(server: &MockServer) -> OpenAiCompatibleProvider {
        let url = format!("{}{COMPLETIONS}", server.uri());
        OpenAiCompatibleProvider::new("test".into(), url, "sk-test".into(), Duration::from_secs(5)).unwrap()
    }

    fn cfg(stream: bool) -> CallConfig {
        CallConfig { model: "m".into(), stream, temperature: 0.0 }
    }

    #[tokio::test]
    async fn json_reply_is_read() {
        let body = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "<answer>do(action=\"Home\")</answer>"}}]
        })
        .to_string();
        let server = server_replying(ResponseTemplate::new(200).set_body_raw(body, "application/json")).await;
        let reply = provider(&server)
            .chat(&[ChatMessage::user("hi")], &cfg(false))
            .await
            .unwrap();
        assert_eq!(reply.content, "<answer>do(action=\"Home\")</answer>");
        assert!(reply.reasoning.is_empty());
    }

    #[tokio::test]
    async fn streamed_reply_is_accumulated() {
        let body = [
            r#"data: {"choices":[{"delta":{"reasoning_content":"look"}}]}"#,
            r#"data: {"choices":[{"delta":{"content":"finish(message="}}]}"#,
            r#"data: {"choices":[{"delta":{"content":"\"ok\")"}}]}"#,
            "data: [DONE]",
            "",
        ]
        .join("\n\n");
        let server = server_replying(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")).await;
        let reply = provider(&server)
            .chat(&[ChatMessage::user("hi")], &cfg(true))
            .await
            .unwrap();
        assert_eq!(reply.content, "finish(message=\"ok\")");
        assert_eq!(reply.reasoning, "look");
    }

    #[tokio::test]
    async fn non_success_status_is_an_api_error() {
        let server = server_replying(ResponseTemplate::new(429).set_body_raw("{}", "application/json")).await;
        let err = provider(&server)
            .chat(&[ChatMessage::user("hi")], &cfg(false))
            .await
            .unwrap_err();
        assert!(matches!(err, DroidClawError::Api { status: 429, .. }));
        assert_eq!(err.classify(), crate::errors::FailureKind::RateLimited);
    }

    #[test]
    fn sanitized_body_hides_images() {
        let body = serde_json::json!({
            "messages": [ChatMessage::user_with_image("s", "data:image/png;base64,SECRET".into())]
        });
        let logged = sanitized_body(&body);
        assert!(!logged.contains("SECRET"));
        assert!(logged.contains("<omitted_base64_image>"));
    }
}
