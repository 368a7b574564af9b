use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::chat::{ChatEntry, Role};
use crate::gateway::vision::VisionBackend;
use crate::gateway::{BackendError, GenerationBackend};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// REST client for the Gemini generative-language API. Implements both the
/// text generation and vision capabilities behind the gateway traits.
pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
    vision_model: String,
}

impl GeminiClient {
    pub fn new(api_key: String, vision_model: String) -> Self {
        Self::with_base_url(api_key, vision_model, DEFAULT_BASE_URL.to_string())
    }

    pub fn with_base_url(api_key: String, vision_model: String, base_url: String) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client");
        Self {
            client,
            api_key,
            base_url,
            vision_model,
        }
    }

    fn contents(history: &[ChatEntry]) -> Vec<Value> {
        history
            .iter()
            .map(|entry| {
                let role = match entry.role {
                    Role::Assistant => "model",
                    Role::User => "user",
                };
                json!({ "role": role, "parts": [{ "text": entry.content }] })
            })
            .collect()
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<Value, BackendError> {
        let response = self
            .client
            .post(url)
            .query(&[("key", self.api_key.as_str())])
            .json(body)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, text));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))
    }

}

/// Vision calls ride the same generateContent endpoint with an inline
/// image part and JSON response mode. The vision gateway owns the field
/// defaulting; this returns the provider's parsed payload.
#[async_trait]
impl VisionBackend for GeminiClient {
    async fn analyze(
        &self,
        image_b64: &str,
        mime_type: &str,
        system: &str,
        prompt: &str,
    ) -> Result<Value, BackendError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.vision_model);
        let body = json!({
            "system_instruction": { "parts": [{ "text": system }] },
            "contents": [{
                "role": "user",
                "parts": [
                    { "inline_data": { "mime_type": mime_type, "data": image_b64 } },
                    { "text": prompt }
                ]
            }],
            "generationConfig": { "response_mime_type": "application/json" }
        });

        let payload = self.post_json(&url, &body).await?;
        let text = extract_text(&payload).ok_or(BackendError::Empty)?;
        serde_json::from_str(&text).map_err(|e| BackendError::Api(format!("non-JSON analysis: {e}")))
    }
}

fn classify_status(status: StatusCode, body: String) -> BackendError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        BackendError::RateLimited
    } else if status.is_server_error() {
        BackendError::Unavailable(format!("{status}: {body}"))
    } else {
        BackendError::Api(format!("{status}: {body}"))
    }
}

/// Concatenate the text parts of the first candidate.
fn extract_text(payload: &Value) -> Option<String> {
    let parts = payload
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;

    let text: String = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();

    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

#[async_trait]
impl GenerationBackend for GeminiClient {
    async fn complete(
        &self,
        model: &str,
        system: &str,
        history: &[ChatEntry],
    ) -> Result<String, BackendError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, model);
        let body = json!({
            "system_instruction": { "parts": [{ "text": system }] },
            "contents": Self::contents(history),
        });

        let payload = self.post_json(&url, &body).await?;
        extract_text(&payload).ok_or(BackendError::Empty)
    }

    async fn stream(
        &self,
        model: &str,
        system: &str,
        history: &[ChatEntry],
        tx: mpsc::Sender<String>,
    ) -> Result<(), BackendError> {
        let url = format!("{}/models/{}:streamGenerateContent", self.base_url, model);
        let body = json!({
            "system_instruction": { "parts": [{ "text": system }] },
            "contents": Self::contents(history),
        });

        let response = self
            .client
            .post(&url)
            .query(&[("alt", "sse"), ("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, text));
        }

        let mut stream = response.bytes_stream();
        // Carry partial lines across network chunks; an SSE data line can
        // be split anywhere.
        let mut pending = String::new();

        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| BackendError::Network(e.to_string()))?;
            pending.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(newline) = pending.find('\n') {
                let line = pending[..newline].trim().to_string();
                pending.drain(..=newline);

                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    return Ok(());
                }
                let Ok(payload) = serde_json::from_str::<Value>(data) else {
                    debug!("skipping unparseable stream line");
                    continue;
                };
                if let Some(text) = extract_text(&payload) {
                    if tx.send(text).await.is_err() {
                        // Receiver dropped: the session was cancelled.
                        return Ok(());
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_text_joins_candidate_parts() {
        let payload = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "Use neem " }, { "text": "oil spray." }] }
            }]
        });
        assert_eq!(extract_text(&payload).unwrap(), "Use neem oil spray.");
    }

    #[test]
    fn extract_text_rejects_empty_candidates() {
        assert!(extract_text(&json!({ "candidates": [] })).is_none());
        assert!(extract_text(&json!({})).is_none());
    }

    #[test]
    fn status_classification_separates_retryable_from_fatal() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()).is_retryable());
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, String::new()).is_retryable());
        assert!(!classify_status(StatusCode::FORBIDDEN, String::new()).is_retryable());
    }

    #[test]
    fn history_maps_assistant_to_model_role() {
        let history = vec![
            ChatEntry { role: Role::User, content: "hi".into() },
            ChatEntry { role: Role::Assistant, content: "hello".into() },
        ];
        let contents = GeminiClient::contents(&history);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
    }
}
