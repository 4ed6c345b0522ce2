//! OpenAI-compatible chat client with SSE streaming.

use std::collections::VecDeque;

use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{ChatClient, ChatMessage, ChunkStream, LlmConfig, LlmError};

#[derive(Debug)]
pub struct OpenAiChatClient {
    http: reqwest::Client,
    config: LlmConfig,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
}

#[derive(Debug, Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiChatClient {
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        if config.api_key.is_empty() {
            return Err(LlmError::Configuration("API key is required".to_string()));
        }
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| LlmError::Configuration(e.to_string()))?;
        Ok(Self { http, config })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    fn request_body(&self, messages: &[ChatMessage], stream: bool) -> serde_json::Value {
        let mut body = json!({
            "model": self.config.model,
            "messages": messages,
            "stream": stream,
        });
        if let Some(temperature) = self.config.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = self.config.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }

    async fn post(
        &self,
        messages: &[ChatMessage],
        stream: bool,
    ) -> Result<reqwest::Response, LlmError> {
        let response = self
            .http
            .post(self.completions_url())
            .bearer_auth(&self.config.api_key)
            .json(&self.request_body(messages, stream))
            .send()
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Provider(format!("{status}: {body}")));
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl ChatClient for OpenAiChatClient {
    async fn stream_chat(&self, messages: &[ChatMessage]) -> Result<ChunkStream, LlmError> {
        let response = self.post(messages, true).await?;
        Ok(sse_content_stream(response.bytes_stream()))
    }

    async fn chat(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        let response = self.post(messages, false).await?;
        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;
        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| LlmError::Parse("completion has no choices".to_string()))
    }
}

type ByteStream =
    std::pin::Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>;

struct SseState {
    bytes: ByteStream,
    buffer: String,
    pending: VecDeque<String>,
    done: bool,
}

/// Adapt an SSE byte stream into a stream of content deltas. Complete
/// `data:` lines are parsed as completion chunks; `[DONE]` ends the stream.
fn sse_content_stream(
    bytes: impl futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
) -> ChunkStream {
    let state = SseState {
        bytes: Box::pin(bytes),
        buffer: String::new(),
        pending: VecDeque::new(),
        done: false,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(content) = state.pending.pop_front() {
                return Some((Ok(content), state));
            }
            if state.done {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.push_str(&String::from_utf8_lossy(&chunk));
                    drain_events(&mut state.buffer, &mut state.pending, &mut state.done);
                }
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(LlmError::Network(e.to_string())), state));
                }
                None => return None,
            }
        }
    }))
}

fn drain_events(buffer: &mut String, pending: &mut VecDeque<String>, done: &mut bool) {
    while let Some(newline) = buffer.find('\n') {
        let line: String = buffer.drain(..=newline).collect();
        let line = line.trim();
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data == "[DONE]" {
            *done = true;
            continue;
        }
        match serde_json::from_str::<ChatCompletionChunk>(data) {
            Ok(chunk) => {
                if let Some(content) = chunk
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|choice| choice.delta.content)
                {
                    if !content.is_empty() {
                        pending.push_back(content);
                    }
                }
            }
            Err(e) => debug!("skipping unparseable SSE chunk: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_events_extracts_deltas_and_done() {
        let mut buffer = String::from(
            "data: {\"choices\":[{\"delta\":{\"content\":\"He\"}}]}\n\n\
             data: {\"choices\":[{\"delta\":{\"content\":\"llo\"}}]}\n\n\
             data: [DONE]\n\n",
        );
        let mut pending = VecDeque::new();
        let mut done = false;

        drain_events(&mut buffer, &mut pending, &mut done);

        assert_eq!(pending, VecDeque::from(["He".to_string(), "llo".to_string()]));
        assert!(done);
        assert!(buffer.is_empty());
    }

    #[test]
    fn drain_events_keeps_partial_line_buffered() {
        let mut buffer = String::from("data: {\"choices\":[{\"delta\":{\"cont");
        let mut pending = VecDeque::new();
        let mut done = false;

        drain_events(&mut buffer, &mut pending, &mut done);

        assert!(pending.is_empty());
        assert!(!done);
        assert!(!buffer.is_empty());
    }

    #[test]
    fn empty_api_key_is_rejected() {
        let err = OpenAiChatClient::new(LlmConfig::default()).unwrap_err();
        assert!(matches!(err, LlmError::Configuration(_)));
    }
}
